use service_core::axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use service_core::error::AppError;
use uuid::Uuid;

pub const ORBIT_HEADER: &str = "x-orbit-id";

/// The tenant a request addresses, taken from the `x-orbit-id` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrbitId(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for OrbitId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(ORBIT_HEADER)
            .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("Missing {} header", ORBIT_HEADER)))?
            .to_str()
            .map_err(|_| AppError::BadRequest(anyhow::anyhow!("Invalid {} header", ORBIT_HEADER)))?;

        Uuid::parse_str(raw.trim())
            .map(OrbitId)
            .map_err(|_| AppError::BadRequest(anyhow::anyhow!("Invalid {} header", ORBIT_HEADER)))
    }
}
