use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

use crate::models::{Session, SessionState};

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateOrbitRequest {
    #[validate(length(min = 1, max = 100, message = "Name must be 1-100 characters"))]
    #[schema(example = "acme")]
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct OrbitResponse {
    pub orbit_id: Uuid,
    #[schema(example = "acme")]
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RegisterUserRequest {
    #[validate(length(min = 3, max = 64, message = "Username must be 3-64 characters"))]
    #[schema(example = "ada")]
    pub username: String,

    #[validate(email(message = "Invalid email format"))]
    #[schema(example = "ada@example.com")]
    pub email: String,

    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    #[schema(example = "password123", min_length = 8)]
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RegisterUserResponse {
    pub user_id: Uuid,
    #[schema(example = "ada@example.com")]
    pub email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct LoginRequest {
    #[validate(email(message = "Invalid email format"))]
    #[schema(example = "ada@example.com")]
    pub email: String,

    #[validate(length(min = 1, message = "Password is required"))]
    #[schema(example = "password123")]
    pub password: String,

    #[validate(length(min = 1, message = "client_id is required"))]
    #[schema(example = "3f1c9a0e5b7d4e2f8a6c1b0d9e8f7a6b")]
    pub client_id: String,

    /// Space-delimited scopes.
    #[schema(example = "read profile")]
    pub scope: Option<String>,

    #[schema(example = "Firefox on Linux")]
    pub device_info: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LoginResponse {
    pub access_token: String,
    /// `<session_id>.<secret>`, shown once.
    pub refresh_token: String,
    #[schema(example = "Bearer")]
    pub token_type: String,
    #[schema(example = 900)]
    pub expires_in: i64,
    pub session_id: Uuid,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RefreshRequest {
    #[validate(length(min = 1, message = "refresh_token is required"))]
    pub refresh_token: String,

    #[validate(length(min = 1, message = "client_id is required"))]
    pub client_id: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AccessTokenResponse {
    pub access_token: String,
    #[schema(example = "Bearer")]
    pub token_type: String,
    #[schema(example = 900)]
    pub expires_in: i64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MessageResponse {
    #[schema(example = "Logged out")]
    pub message: String,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct SessionsQuery {
    #[param(example = 1)]
    pub page: Option<u32>,
    #[param(example = 20)]
    pub per_page: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SessionView {
    pub id: Uuid,
    pub client_id: String,
    pub device_info: Option<String>,
    pub ip_address: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[schema(example = "active")]
    pub state: String,
    pub current: bool,
}

impl SessionView {
    pub fn from_session(session: Session, current: Option<Uuid>) -> Self {
        let state = match session.state() {
            SessionState::Active => "active",
            SessionState::Revoked => "revoked",
            SessionState::Expired => "expired",
        };
        Self {
            current: current == Some(session.id),
            id: session.id,
            client_id: session.client_id,
            device_info: session.device_info,
            ip_address: session.ip_address,
            started_at: session.started_at,
            last_active_at: session.last_active_at,
            expires_at: session.expires_at,
            state: state.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionView>,
    pub page: u32,
    pub per_page: u32,
    pub total: i64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UserInfoResponse {
    pub sub: String,
    pub email: String,
    pub email_verified: bool,
    pub preferred_username: String,
    pub orbit_id: Uuid,
}
