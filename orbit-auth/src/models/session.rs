use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A first-party login. Refresh material handed to the client is
/// `<id>.<secret>`; only an argon2 hash of the whole string is kept.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Session {
    pub id: Uuid,
    pub orbit_id: Uuid,
    pub user_id: Uuid,
    pub client_id: String,
    #[serde(skip_serializing)]
    pub secret_hash: String,
    pub scopes: Vec<String>,
    pub device_info: Option<String>,
    pub ip_address: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Active,
    Revoked,
    Expired,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Uuid,
        orbit_id: Uuid,
        user_id: Uuid,
        client_id: String,
        secret_hash: String,
        scopes: Vec<String>,
        device_info: Option<String>,
        ip_address: Option<String>,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            orbit_id,
            user_id,
            client_id,
            secret_hash,
            scopes,
            device_info,
            ip_address,
            started_at: now,
            last_active_at: now,
            expires_at: now + ttl,
            revoked: false,
            revoked_at: None,
            metadata: serde_json::json!({}),
        }
    }

    /// Revocation wins over expiry so a logged-out session reports `Revoked`.
    pub fn state(&self) -> SessionState {
        if self.revoked {
            SessionState::Revoked
        } else if Utc::now() > self.expires_at {
            SessionState::Expired
        } else {
            SessionState::Active
        }
    }
}
