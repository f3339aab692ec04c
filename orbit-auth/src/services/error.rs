use service_core::error::AppError;
use thiserror::Error;

use super::store::StoreError;

/// Failure taxonomy of the token engines. Protocol variants map onto OAuth2
/// error codes; `Database`, `Cache` and `Internal` all surface as a generic
/// server error.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Account is inactive")]
    InactiveAccount,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Conflict(String),

    #[error("Invalid grant: {0}")]
    InvalidGrant(String),

    #[error("Unsupported PKCE method")]
    UnsupportedPkceMethod,

    #[error("Token has been revoked")]
    Revoked,

    #[error("Token has expired")]
    Expired,

    #[error("Client authentication failed")]
    InvalidClient,

    #[error("Unsupported grant type")]
    UnsupportedGrantType,

    #[error("Client is not authorized for this grant type")]
    UnauthorizedClient,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Requested scope is not allowed")]
    InvalidScope,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Cache error: {0}")]
    Cache(#[source] anyhow::Error),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    /// True for the failures that must never be described to the caller.
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            ServiceError::Database(_) | ServiceError::Cache(_) | ServiceError::Internal(_)
        )
    }

    /// Short machine label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ServiceError::InvalidCredentials => "invalid_credentials",
            ServiceError::InactiveAccount => "inactive_account",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::Conflict(_) => "conflict",
            ServiceError::InvalidGrant(_) => "invalid_grant",
            ServiceError::UnsupportedPkceMethod => "unsupported_pkce_method",
            ServiceError::Revoked => "revoked",
            ServiceError::Expired => "expired",
            ServiceError::InvalidClient => "invalid_client",
            ServiceError::UnsupportedGrantType => "unsupported_grant_type",
            ServiceError::UnauthorizedClient => "unauthorized_client",
            ServiceError::InvalidRequest(_) => "invalid_request",
            ServiceError::InvalidScope => "invalid_scope",
            ServiceError::InvalidToken => "invalid_token",
            ServiceError::Database(_) | ServiceError::Cache(_) | ServiceError::Internal(_) => {
                "server_error"
            }
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ServiceError::NotFound(what),
            StoreError::Conflict(msg) => ServiceError::Conflict(msg),
            StoreError::AlreadyUsed => {
                ServiceError::InvalidGrant("authorization code already used".into())
            }
            StoreError::AlreadyRotated => {
                ServiceError::InvalidGrant("refresh token already rotated".into())
            }
            StoreError::Expired => ServiceError::Expired,
            StoreError::Revoked => ServiceError::Revoked,
            StoreError::Database(e) => ServiceError::Database(anyhow::Error::new(e)),
            StoreError::Backend(e) => ServiceError::Database(e),
        }
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::InvalidCredentials => {
                AppError::AuthError(anyhow::anyhow!("Invalid credentials"))
            }
            ServiceError::InactiveAccount => {
                AppError::Forbidden(anyhow::anyhow!("Account is inactive"))
            }
            ServiceError::NotFound(what) => AppError::NotFound(anyhow::anyhow!("{} not found", what)),
            ServiceError::Conflict(msg) => AppError::Conflict(anyhow::anyhow!(msg)),
            ServiceError::InvalidGrant(_) => AppError::BadRequest(anyhow::anyhow!("Invalid grant")),
            ServiceError::UnsupportedPkceMethod => {
                AppError::BadRequest(anyhow::anyhow!("Unsupported PKCE method"))
            }
            ServiceError::Revoked => AppError::Unauthorized(anyhow::anyhow!("Token has been revoked")),
            ServiceError::Expired => AppError::Unauthorized(anyhow::anyhow!("Token has expired")),
            ServiceError::InvalidClient => {
                AppError::Unauthorized(anyhow::anyhow!("Client authentication failed"))
            }
            ServiceError::UnsupportedGrantType => {
                AppError::BadRequest(anyhow::anyhow!("Unsupported grant type"))
            }
            ServiceError::UnauthorizedClient => {
                AppError::Forbidden(anyhow::anyhow!("Client is not authorized for this grant"))
            }
            ServiceError::InvalidRequest(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            ServiceError::InvalidScope => AppError::BadRequest(anyhow::anyhow!("Invalid scope")),
            ServiceError::InvalidToken => AppError::Unauthorized(anyhow::anyhow!("Invalid token")),
            ServiceError::Database(e) => AppError::DatabaseError(e),
            ServiceError::Cache(e) => AppError::CacheError(e),
            ServiceError::Internal(e) => AppError::InternalError(e),
        }
    }
}
