use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Pending authorization grant. `Created -> Exchanged` or `Created -> Expired`,
/// both terminal.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuthCode {
    pub code: String,
    pub orbit_id: Uuid,
    pub client_id: String,
    pub user_id: Uuid,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub used: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl AuthCode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        code: String,
        orbit_id: Uuid,
        client_id: String,
        user_id: Uuid,
        redirect_uri: String,
        scopes: Vec<String>,
        code_challenge: Option<String>,
        code_challenge_method: Option<String>,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            code,
            orbit_id,
            client_id,
            user_id,
            redirect_uri,
            scopes,
            code_challenge,
            code_challenge_method,
            used: false,
            expires_at: now + ttl,
            created_at: now,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Seconds left before expiry, floored at zero.
    pub fn remaining_ttl_seconds(&self) -> u64 {
        (self.expires_at - Utc::now()).num_seconds().max(0) as u64
    }
}
