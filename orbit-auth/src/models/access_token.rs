use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Server-side record of an issued access token. The bearer JWT is trusted on
/// its signature; this row backs introspection and revocation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AccessTokenRecord {
    pub jti: String,
    pub orbit_id: Uuid,
    pub client_id: String,
    pub user_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
    pub refresh_token_id: Option<Uuid>,
    pub scopes: Vec<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

impl AccessTokenRecord {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    pub fn is_active(&self) -> bool {
        !self.revoked && !self.is_expired()
    }
}
