use std::sync::Arc;

use chrono::Duration;
use uuid::Uuid;

use super::error::ServiceError;
use super::jwt::{SignedToken, TokenGrant, TokenSigner};
use super::metrics;
use super::revocation::RevocationService;
use super::roles::RoleLookup;
use super::store::{Store, StoreError};
use crate::models::{Client, RefreshToken};
use crate::utils::token::random_secret;

const REUSE_REASON: &str = "refresh_token_reuse";

#[derive(Debug, Clone)]
pub struct RotatedTokens {
    pub access: SignedToken,
    pub refresh_token: String,
    pub scopes: Vec<String>,
}

/// Rotation chains for the `refresh_token` grant. Each presentation appends a
/// new link; presenting a link that was already rotated revokes everything
/// after it.
#[derive(Clone)]
pub struct RefreshTokenService {
    store: Arc<dyn Store>,
    signer: Arc<TokenSigner>,
    roles: Arc<dyn RoleLookup>,
    revocation: RevocationService,
    ttl: Duration,
}

impl RefreshTokenService {
    pub fn new(
        store: Arc<dyn Store>,
        signer: Arc<TokenSigner>,
        roles: Arc<dyn RoleLookup>,
        revocation: RevocationService,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            signer,
            roles,
            revocation,
            ttl,
        }
    }

    /// A new chain head. Not persisted; the caller stores it inside its own atomic unit.
    pub fn issue(
        &self,
        orbit_id: Uuid,
        client_id: &str,
        user_id: Option<Uuid>,
        scopes: Vec<String>,
    ) -> (RefreshToken, String) {
        let value = random_secret();
        let record = RefreshToken::new(
            orbit_id,
            client_id.to_string(),
            user_id,
            &value,
            scopes,
            self.ttl,
        );
        (record, value)
    }

    /// Exchanges `presented` for a new access token and the next refresh
    /// token. `requested_scopes` may narrow, never widen, the original grant.
    #[tracing::instrument(skip(self, client, presented, requested_scopes), fields(orbit_id = %orbit_id, client_id = %client.client_id))]
    pub async fn rotate(
        &self,
        orbit_id: Uuid,
        client: &Client,
        presented: &str,
        requested_scopes: Vec<String>,
    ) -> Result<RotatedTokens, ServiceError> {
        let current = self
            .store
            .find_refresh_token_by_hash(&RefreshToken::hash_token(presented))
            .await?
            .filter(|t| t.orbit_id == orbit_id && t.client_id == client.client_id)
            .ok_or_else(|| ServiceError::InvalidGrant("unknown refresh token".into()))?;

        if current.is_rotated() {
            return Err(self.reuse_detected(&current).await);
        }
        if current.revoked {
            return Err(ServiceError::InvalidGrant("refresh token revoked".into()));
        }
        if current.is_expired() {
            return Err(ServiceError::InvalidGrant("refresh token expired".into()));
        }

        let scopes = if requested_scopes.is_empty() {
            current.scopes.clone()
        } else if requested_scopes.iter().all(|s| current.scopes.contains(s)) {
            requested_scopes
        } else {
            return Err(ServiceError::InvalidScope);
        };

        let roles = match current.user_id {
            Some(user_id) => {
                let user = self
                    .store
                    .find_user(orbit_id, user_id)
                    .await?
                    .filter(|u| u.can_authenticate())
                    .ok_or_else(|| ServiceError::InvalidGrant("user is no longer active".into()))?;
                self.roles.role_ids(orbit_id, user.id).await?
            }
            None => Vec::new(),
        };

        let access = self.signer.sign(TokenGrant {
            orbit_id,
            subject: current
                .user_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| client.client_id.clone()),
            client_id: client.client_id.clone(),
            scopes: scopes.clone(),
            roles,
            session_id: None,
        })?;

        let value = random_secret();
        let next = current.successor(&value, self.ttl);

        match self
            .store
            .rotate_refresh_token(orbit_id, current.id, &next, &access.record(Some(next.id)))
            .await
        {
            Ok(()) => {}
            Err(StoreError::AlreadyRotated) => return Err(self.reuse_detected(&current).await),
            Err(StoreError::Revoked) => {
                return Err(ServiceError::InvalidGrant("refresh token revoked".into()))
            }
            Err(StoreError::Expired) => {
                return Err(ServiceError::InvalidGrant("refresh token expired".into()))
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(
            previous = %current.id,
            next = %next.id,
            jti = %access.jti(),
            "Refresh token rotated"
        );
        Ok(RotatedTokens {
            access,
            refresh_token: value,
            scopes,
        })
    }

    /// Revokes the presented link and every descendant, then fails the grant.
    async fn reuse_detected(&self, token: &RefreshToken) -> ServiceError {
        metrics::record_refresh_reuse();
        tracing::warn!(
            refresh_token_id = %token.id,
            client_id = %token.client_id,
            "Rotated refresh token presented again; revoking chain"
        );

        match self
            .store
            .revoke_refresh_chain(token.orbit_id, token.id, REUSE_REASON)
            .await
        {
            Ok(revoked) => {
                self.revocation.apply_chain(&revoked, REUSE_REASON).await;
                ServiceError::InvalidGrant("refresh token reuse detected".into())
            }
            Err(e) => e.into(),
        }
    }
}
