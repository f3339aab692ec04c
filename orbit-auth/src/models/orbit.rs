use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// An isolated tenant. Every other record is scoped to exactly one orbit.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Orbit {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Orbit {
    pub fn new(name: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            created_at: Utc::now(),
        }
    }
}
