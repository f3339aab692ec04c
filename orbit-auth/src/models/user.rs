use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

pub const PASSWORD_ALGO_ARGON2ID: &str = "argon2id";

/// End user of an orbit. Users are soft-deleted only.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub orbit_id: Uuid,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub password_algo: String,
    pub is_active: bool,
    pub is_locked: bool,
    pub mfa_enabled: bool,
    pub email_verified: bool,
    pub profile: serde_json::Value,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn new(orbit_id: Uuid, username: String, email: String, password_hash: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            orbit_id,
            username,
            email: normalize_email(&email),
            password_hash,
            password_algo: PASSWORD_ALGO_ARGON2ID.to_string(),
            is_active: true,
            is_locked: false,
            mfa_enabled: false,
            email_verified: false,
            profile: serde_json::json!({}),
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Whether the account may authenticate or receive new tokens.
    pub fn can_authenticate(&self) -> bool {
        self.is_active && !self.is_locked && self.deleted_at.is_none()
    }

    pub fn sanitized(&self) -> SanitizedUser {
        SanitizedUser::from(self)
    }
}

/// Emails are matched case-insensitively within an orbit.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[derive(Debug, Clone, Serialize)]
pub struct SanitizedUser {
    pub id: Uuid,
    pub orbit_id: Uuid,
    pub username: String,
    pub email: String,
    pub email_verified: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&User> for SanitizedUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            orbit_id: user.orbit_id,
            username: user.username.clone(),
            email: user.email.clone(),
            email_verified: user.email_verified,
            created_at: user.created_at,
        }
    }
}
