use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Scopes a user has granted to a client within one orbit.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Consent {
    pub id: Uuid,
    pub orbit_id: Uuid,
    pub user_id: Uuid,
    pub client_id: String,
    pub scopes: Vec<String>,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
}

impl Consent {
    pub fn new(orbit_id: Uuid, user_id: Uuid, client_id: String, scopes: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            orbit_id,
            user_id,
            client_id,
            scopes,
            granted_at: Utc::now(),
            expires_at: None,
            revoked: false,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.revoked && self.expires_at.map_or(true, |exp| Utc::now() < exp)
    }

    pub fn covers(&self, requested: &[String]) -> bool {
        self.is_active() && requested.iter().all(|s| self.scopes.contains(s))
    }
}
