use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Role {
    pub id: Uuid,
    pub orbit_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Role {
    pub fn new(orbit_id: Uuid, name: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            orbit_id,
            name,
            description: None,
            created_at: Utc::now(),
        }
    }
}
