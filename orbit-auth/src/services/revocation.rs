use std::sync::Arc;

use uuid::Uuid;

use super::cache::{self, Cache};
use super::error::ServiceError;
use super::jwt::{AccessTokenClaims, TokenSigner};
use super::metrics;
use super::store::{ChainRevocation, Store, StoreError};
use crate::dtos::oauth::IntrospectionResponse;
use crate::models::{AccessTokenRecord, Client, RefreshToken, SessionState};
use crate::utils::password::verify_password_blocking;
use crate::utils::token::join_scopes;
use crate::utils::{Password, PasswordHashString};

/// Outcome of a revocation check. Flag and ledger collapse into one answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevocationStatus {
    NotRevoked,
    Revoked { reason: String },
}

impl RevocationStatus {
    pub fn is_revoked(&self) -> bool {
        matches!(self, RevocationStatus::Revoked { .. })
    }
}

/// Shape of a presented credential. Access tokens are JWTs, session refresh
/// material is `<session_id>.<secret>` and rotation-chain refresh tokens are
/// opaque without dots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenShape {
    Access,
    SessionMaterial,
    RefreshToken,
}

impl TokenShape {
    pub fn of(token: &str) -> Self {
        match token.matches('.').count() {
            2 => TokenShape::Access,
            1 => TokenShape::SessionMaterial,
            _ => TokenShape::RefreshToken,
        }
    }
}

/// Splits `<session_id>.<secret>`.
pub fn split_session_material(material: &str) -> Option<(Uuid, &str)> {
    let (id, secret) = material.split_once('.')?;
    if secret.is_empty() {
        return None;
    }
    Uuid::parse_str(id).ok().map(|id| (id, secret))
}

#[derive(Clone)]
pub struct RevocationService {
    store: Arc<dyn Store>,
    cache: Cache,
    signer: Arc<TokenSigner>,
}

impl RevocationService {
    pub fn new(store: Arc<dyn Store>, cache: Cache, signer: Arc<TokenSigner>) -> Self {
        Self { store, cache, signer }
    }

    /// Cache flag first, then the ledger and the record flag. A store hit is
    /// backfilled into the cache.
    pub async fn status(&self, orbit_id: Uuid, jti: &str) -> Result<RevocationStatus, ServiceError> {
        let key = cache::revoked_key(jti);
        if let Some(reason) = self.cache.get_raw(&key).await {
            return Ok(RevocationStatus::Revoked { reason });
        }

        let reason = match self.store.find_revocation(jti).await? {
            Some(entry) => Some(entry.reason),
            None => self
                .store
                .find_access_token(orbit_id, jti)
                .await?
                .filter(|record| record.revoked)
                .map(|_| "revoked".to_string()),
        };

        match reason {
            Some(reason) => {
                self.cache
                    .set_raw(&key, &reason, cache::REVOKED_BACKFILL_TTL)
                    .await;
                Ok(RevocationStatus::Revoked { reason })
            }
            None => Ok(RevocationStatus::NotRevoked),
        }
    }

    /// Flag and ledger in the store, then the cache flag (write-through) and
    /// introspection invalidation.
    #[tracing::instrument(skip(self), fields(orbit_id = %orbit_id))]
    pub async fn revoke_access(
        &self,
        orbit_id: Uuid,
        jti: &str,
        reason: &str,
    ) -> Result<Option<AccessTokenRecord>, ServiceError> {
        let record = self.store.revoke_access_token(orbit_id, jti, reason).await?;
        self.mark_access_revoked(jti, reason).await;
        metrics::record_revocation("access", 1);
        tracing::info!(jti = %jti, reason = %reason, "Access token revoked");
        Ok(record)
    }

    /// Cache side effects for access tokens the store already revoked.
    pub async fn mark_access_revoked(&self, jti: &str, reason: &str) {
        self.cache
            .set_raw(&cache::revoked_key(jti), reason, cache::REVOKED_TTL)
            .await;
        self.cache.invalidate(&cache::introspect_key(jti)).await;
    }

    pub async fn apply_chain(&self, revoked: &ChainRevocation, reason: &str) {
        for jti in &revoked.access_jtis {
            self.mark_access_revoked(jti, reason).await;
        }
        metrics::record_revocation("refresh", revoked.refresh_ids.len());
        metrics::record_revocation("access", revoked.access_jtis.len());
    }

    /// Short-TTL cached record lookup. Returns the record and whether it is active.
    ///
    /// A cached record can predate a revocation that raced its write, so a
    /// cache hit is only trusted while `revoked:<jti>` is absent.
    pub async fn introspect(
        &self,
        orbit_id: Uuid,
        jti: &str,
    ) -> Result<Option<(AccessTokenRecord, bool)>, ServiceError> {
        let key = cache::introspect_key(jti);
        let record = match self.cache.get_json::<AccessTokenRecord>(&key).await {
            Some(record) if record.orbit_id == orbit_id => {
                if record.is_active() && self.cache.get_raw(&cache::revoked_key(jti)).await.is_some() {
                    self.cache.invalidate(&key).await;
                    return Ok(Some((record, false)));
                }
                Some(record)
            }
            _ => {
                let record = self.store.find_access_token(orbit_id, jti).await?;
                if let Some(record) = &record {
                    self.cache.set_json(&key, record, cache::INTROSPECT_TTL).await;
                }
                record
            }
        };

        Ok(record.map(|record| {
            let active = record.is_active();
            (record, active)
        }))
    }

    /// RFC 7662 view of `token` for `client`. Tokens issued to other clients
    /// or other orbits are reported inactive.
    #[tracing::instrument(skip(self, client, token), fields(orbit_id = %client.orbit_id, client_id = %client.client_id))]
    pub async fn introspect_token(
        &self,
        client: &Client,
        token: &str,
    ) -> Result<IntrospectionResponse, ServiceError> {
        match TokenShape::of(token) {
            TokenShape::Access => self.introspect_access(client, token).await,
            TokenShape::SessionMaterial => self.introspect_session(client, token).await,
            TokenShape::RefreshToken => self.introspect_refresh(client, token).await,
        }
    }

    async fn introspect_access(
        &self,
        client: &Client,
        token: &str,
    ) -> Result<IntrospectionResponse, ServiceError> {
        let Some(claims) = self.owned_claims(client, token) else {
            return Ok(IntrospectionResponse::inactive());
        };

        let Some((record, active)) = self.introspect(client.orbit_id, &claims.jti).await? else {
            return Ok(IntrospectionResponse::inactive());
        };
        if !active {
            return Ok(IntrospectionResponse::inactive());
        }

        Ok(IntrospectionResponse {
            active: true,
            scope: Some(join_scopes(&record.scopes)),
            client_id: Some(record.client_id),
            token_type: Some("Bearer".to_string()),
            exp: Some(claims.exp),
            iat: Some(claims.iat),
            sub: Some(claims.sub),
            aud: Some(claims.aud),
            iss: Some(claims.iss),
            jti: Some(claims.jti),
            sid: claims.sid,
        })
    }

    async fn introspect_session(
        &self,
        client: &Client,
        material: &str,
    ) -> Result<IntrospectionResponse, ServiceError> {
        let Some((session_id, _)) = split_session_material(material) else {
            return Ok(IntrospectionResponse::inactive());
        };
        let Some(session) = self.store.find_session(client.orbit_id, session_id).await? else {
            return Ok(IntrospectionResponse::inactive());
        };
        if session.client_id != client.client_id || session.state() != SessionState::Active {
            return Ok(IntrospectionResponse::inactive());
        }
        if !verify_password_blocking(
            Password::new(material),
            Some(PasswordHashString::new(session.secret_hash.clone())),
        )
        .await?
        {
            return Ok(IntrospectionResponse::inactive());
        }

        Ok(IntrospectionResponse {
            active: true,
            scope: Some(join_scopes(&session.scopes)),
            client_id: Some(session.client_id),
            token_type: Some("refresh_token".to_string()),
            exp: Some(session.expires_at.timestamp()),
            iat: Some(session.started_at.timestamp()),
            sub: Some(session.user_id.to_string()),
            sid: Some(session.id.to_string()),
            ..IntrospectionResponse::default()
        })
    }

    async fn introspect_refresh(
        &self,
        client: &Client,
        token: &str,
    ) -> Result<IntrospectionResponse, ServiceError> {
        let Some(record) = self.owned_refresh(client, token).await? else {
            return Ok(IntrospectionResponse::inactive());
        };
        if !record.is_usable() {
            return Ok(IntrospectionResponse::inactive());
        }

        Ok(IntrospectionResponse {
            active: true,
            scope: Some(join_scopes(&record.scopes)),
            client_id: Some(record.client_id),
            token_type: Some("refresh_token".to_string()),
            exp: Some(record.expires_at.timestamp()),
            iat: Some(record.created_at.timestamp()),
            sub: Some(
                record
                    .user_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| client.client_id.clone()),
            ),
            ..IntrospectionResponse::default()
        })
    }

    /// RFC 7009 revocation on behalf of `client`. Unknown tokens and tokens
    /// of other clients are silently ignored.
    #[tracing::instrument(skip(self, client, token), fields(orbit_id = %client.orbit_id, client_id = %client.client_id))]
    pub async fn revoke_token(&self, client: &Client, token: &str) -> Result<(), ServiceError> {
        let orbit_id = client.orbit_id;
        match TokenShape::of(token) {
            TokenShape::Access => {
                if let Some(claims) = self.owned_claims(client, token) {
                    self.revoke_access(orbit_id, &claims.jti, "client_revoked").await?;
                }
            }
            TokenShape::SessionMaterial => {
                let Some((session_id, _)) = split_session_material(token) else {
                    return Ok(());
                };
                let Some(session) = self.store.find_session(orbit_id, session_id).await? else {
                    return Ok(());
                };
                if session.client_id != client.client_id {
                    return Ok(());
                }
                let valid = verify_password_blocking(
                    Password::new(token),
                    Some(PasswordHashString::new(session.secret_hash)),
                )
                .await?;
                if valid {
                    self.revoke_session(orbit_id, session_id, "client_revoked").await?;
                }
            }
            TokenShape::RefreshToken => {
                if let Some(record) = self.owned_refresh(client, token).await? {
                    match self
                        .store
                        .revoke_refresh_chain(orbit_id, record.id, "client_revoked")
                        .await
                    {
                        Ok(revoked) => self.apply_chain(&revoked, "client_revoked").await,
                        Err(StoreError::NotFound(_)) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
        Ok(())
    }

    /// Revokes a session and its live access tokens. Idempotent.
    pub async fn revoke_session(
        &self,
        orbit_id: Uuid,
        session_id: Uuid,
        reason: &str,
    ) -> Result<bool, ServiceError> {
        let outcome = self.store.revoke_session(orbit_id, session_id, reason).await?;
        for jti in &outcome.access_jtis {
            self.mark_access_revoked(jti, reason).await;
        }
        if outcome.newly_revoked {
            metrics::record_revocation("session", 1);
            tracing::info!(session_id = %session_id, reason = %reason, "Session revoked");
        }
        metrics::record_revocation("access", outcome.access_jtis.len());
        Ok(outcome.newly_revoked)
    }

    fn owned_claims(&self, client: &Client, token: &str) -> Option<AccessTokenClaims> {
        self.signer
            .verify(token, Some(&client.client_id))
            .ok()
            .filter(|claims| claims.orbit_id == client.orbit_id)
    }

    async fn owned_refresh(
        &self,
        client: &Client,
        token: &str,
    ) -> Result<Option<RefreshToken>, ServiceError> {
        Ok(self
            .store
            .find_refresh_token_by_hash(&RefreshToken::hash_token(token))
            .await?
            .filter(|r| r.orbit_id == client.orbit_id && r.client_id == client.client_id))
    }
}
