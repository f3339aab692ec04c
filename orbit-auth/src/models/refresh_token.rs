use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use uuid::Uuid;

/// One link of a refresh-token rotation chain.
///
/// The opaque token value is handed to the client once and only its SHA-256
/// hash is stored. `rotated_from_id`/`rotated_to_id` point into the same
/// table, so the chain is append-only and each token is rotated at most once.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RefreshToken {
    pub id: Uuid,
    pub orbit_id: Uuid,
    pub client_id: String,
    pub user_id: Option<Uuid>,
    pub token_hash: String,
    pub scopes: Vec<String>,
    pub revoked: bool,
    pub rotated_from_id: Option<Uuid>,
    pub rotated_to_id: Option<Uuid>,
    pub use_count: i32,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl RefreshToken {
    pub fn new(
        orbit_id: Uuid,
        client_id: String,
        user_id: Option<Uuid>,
        token: &str,
        scopes: Vec<String>,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            orbit_id,
            client_id,
            user_id,
            token_hash: Self::hash_token(token),
            scopes,
            revoked: false,
            rotated_from_id: None,
            rotated_to_id: None,
            use_count: 0,
            last_used_at: None,
            expires_at: now + ttl,
            created_at: now,
        }
    }

    /// Successor of `self` in the chain; inherits client, user and scopes.
    pub fn successor(&self, token: &str, ttl: Duration) -> Self {
        let mut next = Self::new(
            self.orbit_id,
            self.client_id.clone(),
            self.user_id,
            token,
            self.scopes.clone(),
            ttl,
        );
        next.rotated_from_id = Some(self.id);
        next
    }

    /// Hash a token using SHA-256
    pub fn hash_token(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    pub fn is_rotated(&self) -> bool {
        self.rotated_to_id.is_some()
    }

    /// Not expired, not revoked, and still the head of its chain.
    pub fn is_usable(&self) -> bool {
        !self.is_expired() && !self.revoked && !self.is_rotated()
    }
}
