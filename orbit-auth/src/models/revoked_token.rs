use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Append-only revocation ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RevokedToken {
    pub jti: String,
    pub orbit_id: Uuid,
    pub token_kind: String,
    pub reason: String,
    pub revoked_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Access => "access",
            TokenKind::Refresh => "refresh",
        }
    }
}

impl RevokedToken {
    pub fn new(
        jti: String,
        orbit_id: Uuid,
        kind: TokenKind,
        reason: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            jti,
            orbit_id,
            token_kind: kind.as_str().to_string(),
            reason: reason.to_string(),
            revoked_at: Utc::now(),
            expires_at,
        }
    }
}
