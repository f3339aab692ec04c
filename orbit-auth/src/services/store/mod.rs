//! Persistence seam. The store is the source of truth; every multi-row
//! state change of the token lifecycle is a single atomic method here.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    AccessTokenRecord, AuthCode, Client, Consent, Orbit, RefreshToken, RevokedToken, Role,
    Session, SigningKey, User,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Conflict(String),

    #[error("already used")]
    AlreadyUsed,

    #[error("already rotated")]
    AlreadyRotated,

    #[error("expired")]
    Expired,

    #[error("revoked")]
    Revoked,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store backend error: {0}")]
    Backend(anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Everything revoked by one refresh-token revocation, so callers can
/// invalidate cache entries afterwards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChainRevocation {
    pub refresh_ids: Vec<Uuid>,
    pub access_jtis: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionRevocation {
    /// False when the session was already revoked.
    pub newly_revoked: bool,
    pub access_jtis: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SessionPage {
    pub sessions: Vec<Session>,
    pub total: i64,
}

#[async_trait]
pub trait Store: Send + Sync {
    // ==================== Orbits ====================
    async fn create_orbit(&self, orbit: &Orbit) -> StoreResult<()>;
    async fn find_orbit(&self, id: Uuid) -> StoreResult<Option<Orbit>>;

    // ==================== Users & Roles ====================
    /// Fails with `Conflict` when the email or username is taken in the orbit.
    async fn create_user(&self, user: &User) -> StoreResult<()>;
    async fn find_user(&self, orbit_id: Uuid, id: Uuid) -> StoreResult<Option<User>>;
    /// Soft-deleted users are never returned.
    async fn find_user_by_email(&self, orbit_id: Uuid, email: &str) -> StoreResult<Option<User>>;
    async fn set_user_status(
        &self,
        orbit_id: Uuid,
        id: Uuid,
        is_active: bool,
        is_locked: bool,
    ) -> StoreResult<()>;
    async fn create_role(&self, role: &Role) -> StoreResult<()>;
    async fn assign_role(&self, orbit_id: Uuid, user_id: Uuid, role_id: Uuid) -> StoreResult<()>;
    async fn role_ids_for_user(&self, orbit_id: Uuid, user_id: Uuid) -> StoreResult<Vec<String>>;

    // ==================== Clients ====================
    async fn create_client(&self, client: &Client) -> StoreResult<()>;
    async fn find_client(&self, orbit_id: Uuid, client_id: &str) -> StoreResult<Option<Client>>;
    async fn update_client_secret(
        &self,
        orbit_id: Uuid,
        client_id: &str,
        secret_hash: &str,
    ) -> StoreResult<()>;

    // ==================== Sessions ====================
    /// Creates the session and its first access-token record together.
    async fn open_session(&self, session: &Session, access: &AccessTokenRecord) -> StoreResult<()>;
    async fn find_session(&self, orbit_id: Uuid, id: Uuid) -> StoreResult<Option<Session>>;
    /// Under a row lock: rejects revoked/expired sessions, bumps
    /// `last_active_at` and records the new access token.
    async fn refresh_session(
        &self,
        orbit_id: Uuid,
        session_id: Uuid,
        access: &AccessTokenRecord,
    ) -> StoreResult<()>;
    /// Idempotent. Also revokes (flag + ledger) the session's live access tokens.
    async fn revoke_session(
        &self,
        orbit_id: Uuid,
        session_id: Uuid,
        reason: &str,
    ) -> StoreResult<SessionRevocation>;
    /// Newest first.
    async fn list_sessions(
        &self,
        orbit_id: Uuid,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> StoreResult<SessionPage>;

    // ==================== Authorization Codes ====================
    async fn create_auth_code(&self, code: &AuthCode) -> StoreResult<()>;
    async fn find_auth_code(&self, orbit_id: Uuid, code: &str) -> StoreResult<Option<AuthCode>>;
    /// Marks the code used and records the issued tokens in one unit.
    /// A concurrent second redemption observes `AlreadyUsed`.
    async fn redeem_auth_code(
        &self,
        orbit_id: Uuid,
        code: &str,
        access: &AccessTokenRecord,
        refresh: Option<&RefreshToken>,
    ) -> StoreResult<()>;

    // ==================== Access Tokens & Revocation ====================
    async fn create_access_token(&self, record: &AccessTokenRecord) -> StoreResult<()>;
    async fn find_access_token(
        &self,
        orbit_id: Uuid,
        jti: &str,
    ) -> StoreResult<Option<AccessTokenRecord>>;
    /// Sets the record's flag and appends to the ledger together. Returns the
    /// record when one exists.
    async fn revoke_access_token(
        &self,
        orbit_id: Uuid,
        jti: &str,
        reason: &str,
    ) -> StoreResult<Option<AccessTokenRecord>>;
    async fn find_revocation(&self, jti: &str) -> StoreResult<Option<RevokedToken>>;

    // ==================== Refresh Tokens ====================
    async fn find_refresh_token_by_hash(&self, token_hash: &str)
        -> StoreResult<Option<RefreshToken>>;
    /// Appends `new_refresh` after `old_id` and records `new_access`.
    /// `AlreadyRotated`, `Revoked` and `Expired` leave the chain untouched.
    async fn rotate_refresh_token(
        &self,
        orbit_id: Uuid,
        old_id: Uuid,
        new_refresh: &RefreshToken,
        new_access: &AccessTokenRecord,
    ) -> StoreResult<()>;
    /// Revokes one refresh token and the access tokens minted from it.
    async fn revoke_refresh_token(
        &self,
        orbit_id: Uuid,
        id: Uuid,
        reason: &str,
    ) -> StoreResult<ChainRevocation>;
    /// Revokes `start_id` and every descendant along `rotated_to_id`.
    async fn revoke_refresh_chain(
        &self,
        orbit_id: Uuid,
        start_id: Uuid,
        reason: &str,
    ) -> StoreResult<ChainRevocation>;

    // ==================== Consents ====================
    async fn upsert_consent(&self, consent: &Consent) -> StoreResult<()>;
    async fn find_consent(
        &self,
        orbit_id: Uuid,
        user_id: Uuid,
        client_id: &str,
    ) -> StoreResult<Option<Consent>>;
    async fn revoke_consent(&self, orbit_id: Uuid, user_id: Uuid, client_id: &str)
        -> StoreResult<bool>;

    // ==================== Signing Keys ====================
    async fn upsert_signing_key(&self, key: &SigningKey) -> StoreResult<()>;

    async fn health_check(&self) -> StoreResult<()>;
}
