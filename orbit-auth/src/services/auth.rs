use std::sync::Arc;

use chrono::Duration;
use uuid::Uuid;

use super::client::ClientService;
use super::error::ServiceError;
use super::jwt::{AccessTokenClaims, SignedToken, TokenGrant, TokenSigner};
use super::revocation::{split_session_material, RevocationService, RevocationStatus};
use super::roles::RoleLookup;
use super::store::{SessionPage, Store, StoreError};
use crate::models::{normalize_email, Session, SessionState, User};
use crate::utils::password::{hash_password_blocking, verify_password_blocking};
use crate::utils::token::random_secret;
use crate::utils::{Password, PasswordHashString};

pub const MAX_SESSIONS_PER_PAGE: u32 = 100;

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password: Password,
}

#[derive(Debug, Clone)]
pub struct LoginInput {
    pub email: String,
    pub password: Password,
    pub client_id: String,
    pub scopes: Vec<String>,
    pub device_info: Option<String>,
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub access: SignedToken,
    /// `<session_id>.<secret>`. Returned once, stored only as a hash.
    pub refresh_material: String,
    pub session: Session,
}

/// First-party authentication: registration, session-based login, refresh
/// and logout, plus bearer validation.
#[derive(Clone)]
pub struct AuthService {
    store: Arc<dyn Store>,
    signer: Arc<TokenSigner>,
    roles: Arc<dyn RoleLookup>,
    clients: ClientService,
    revocation: RevocationService,
    session_ttl: Duration,
}

impl AuthService {
    pub fn new(
        store: Arc<dyn Store>,
        signer: Arc<TokenSigner>,
        roles: Arc<dyn RoleLookup>,
        clients: ClientService,
        revocation: RevocationService,
        session_ttl: Duration,
    ) -> Self {
        Self {
            store,
            signer,
            roles,
            clients,
            revocation,
            session_ttl,
        }
    }

    #[tracing::instrument(skip(self, new), fields(orbit_id = %orbit_id))]
    pub async fn register(&self, orbit_id: Uuid, new: NewUser) -> Result<User, ServiceError> {
        self.store
            .find_orbit(orbit_id)
            .await?
            .ok_or(ServiceError::NotFound("Orbit"))?;

        let hash = hash_password_blocking(new.password).await?;
        let user = User::new(orbit_id, new.username, new.email, hash.into_string());
        self.store.create_user(&user).await?;

        tracing::info!(user_id = %user.id, "User registered");
        Ok(user)
    }

    /// Verifies the password, opens a session and signs its first access token.
    ///
    /// Unknown email and wrong password are both `InvalidCredentials`, and no
    /// session is created for either.
    #[tracing::instrument(skip(self, input), fields(orbit_id = %orbit_id, client_id = %input.client_id))]
    pub async fn login(&self, orbit_id: Uuid, input: LoginInput) -> Result<LoginOutcome, ServiceError> {
        let client = self
            .clients
            .find(orbit_id, &input.client_id)
            .await?
            .ok_or(ServiceError::InvalidClient)?;
        if !client.allows_scopes(&input.scopes) {
            return Err(ServiceError::InvalidScope);
        }

        let user = self
            .store
            .find_user_by_email(orbit_id, &normalize_email(&input.email))
            .await?;

        let stored_hash = user
            .as_ref()
            .map(|u| PasswordHashString::new(u.password_hash.clone()));
        if !verify_password_blocking(input.password, stored_hash).await? {
            tracing::warn!("Login failed: invalid credentials");
            return Err(ServiceError::InvalidCredentials);
        }
        let user = user.ok_or(ServiceError::InvalidCredentials)?;

        if !user.can_authenticate() {
            tracing::warn!(user_id = %user.id, "Login refused: account inactive");
            return Err(ServiceError::InactiveAccount);
        }

        let session_id = Uuid::new_v4();
        let refresh_material = format!("{}.{}", session_id, random_secret());
        let secret_hash = hash_password_blocking(Password::new(refresh_material.clone())).await?;

        let session = Session::new(
            session_id,
            orbit_id,
            user.id,
            client.client_id.clone(),
            secret_hash.into_string(),
            input.scopes.clone(),
            input.device_info,
            input.ip_address,
            self.session_ttl,
        );

        let roles = self.roles.role_ids(orbit_id, user.id).await?;
        let access = self.signer.sign(TokenGrant {
            orbit_id,
            subject: user.id.to_string(),
            client_id: client.client_id,
            scopes: input.scopes,
            roles,
            session_id: Some(session_id),
        })?;

        self.store.open_session(&session, &access.record(None)).await?;

        tracing::info!(user_id = %user.id, session_id = %session_id, jti = %access.jti(), "User logged in");
        Ok(LoginOutcome {
            access,
            refresh_material,
            session,
        })
    }

    /// Re-issues an access token bound to the same session. The session id
    /// and secret do not change.
    #[tracing::instrument(skip(self, material), fields(orbit_id = %orbit_id, client_id = %client_id))]
    pub async fn refresh(
        &self,
        orbit_id: Uuid,
        material: &str,
        client_id: &str,
    ) -> Result<SignedToken, ServiceError> {
        let (session_id, _) = split_session_material(material)
            .ok_or_else(|| ServiceError::InvalidGrant("malformed refresh token".into()))?;

        let session = self
            .store
            .find_session(orbit_id, session_id)
            .await?
            .filter(|s| s.client_id == client_id)
            .ok_or_else(|| ServiceError::InvalidGrant("unknown session".into()))?;

        match session.state() {
            SessionState::Revoked => return Err(ServiceError::Revoked),
            SessionState::Expired => return Err(ServiceError::Expired),
            SessionState::Active => {}
        }

        let matches = verify_password_blocking(
            Password::new(material),
            Some(PasswordHashString::new(session.secret_hash.clone())),
        )
        .await?;
        if !matches {
            tracing::warn!(session_id = %session_id, "Refresh secret mismatch");
            return Err(ServiceError::InvalidGrant("unknown session".into()));
        }

        let user = self
            .store
            .find_user(orbit_id, session.user_id)
            .await?
            .ok_or(ServiceError::InactiveAccount)?;
        if !user.can_authenticate() {
            return Err(ServiceError::InactiveAccount);
        }

        let roles = self.roles.role_ids(orbit_id, user.id).await?;
        let access = self.signer.sign(TokenGrant {
            orbit_id,
            subject: user.id.to_string(),
            client_id: session.client_id.clone(),
            scopes: session.scopes.clone(),
            roles,
            session_id: Some(session.id),
        })?;

        self.store
            .refresh_session(orbit_id, session.id, &access.record(None))
            .await?;

        tracing::info!(session_id = %session.id, jti = %access.jti(), "Session refreshed");
        Ok(access)
    }

    /// Revokes the caller's own session and its live access tokens. Idempotent.
    #[tracing::instrument(skip(self), fields(orbit_id = %orbit_id))]
    pub async fn logout(
        &self,
        orbit_id: Uuid,
        user_id: Uuid,
        session_id: Uuid,
    ) -> Result<(), ServiceError> {
        self.store
            .find_session(orbit_id, session_id)
            .await?
            .filter(|s| s.user_id == user_id)
            .ok_or(ServiceError::NotFound("Session"))?;

        self.revocation
            .revoke_session(orbit_id, session_id, "user_logout")
            .await?;
        Ok(())
    }

    /// Signature, issuer and audience first, then the revocation check.
    pub async fn validate_token(
        &self,
        token: &str,
        audience: Option<&str>,
    ) -> Result<AccessTokenClaims, ServiceError> {
        let claims = self.signer.verify(token, audience)?;

        match self.revocation.status(claims.orbit_id, &claims.jti).await? {
            RevocationStatus::NotRevoked => Ok(claims),
            RevocationStatus::Revoked { reason } => {
                tracing::debug!(jti = %claims.jti, reason = %reason, "Rejected revoked token");
                Err(ServiceError::Revoked)
            }
        }
    }

    pub async fn revoke_access_token(
        &self,
        orbit_id: Uuid,
        jti: &str,
        reason: &str,
    ) -> Result<(), ServiceError> {
        self.revocation.revoke_access(orbit_id, jti, reason).await?;
        Ok(())
    }

    /// `page` is 1-based; `per_page` is clamped to `1..=100`.
    pub async fn list_sessions(
        &self,
        orbit_id: Uuid,
        user_id: Uuid,
        page: u32,
        per_page: u32,
    ) -> Result<SessionPage, ServiceError> {
        let page = page.max(1);
        let per_page = per_page.clamp(1, MAX_SESSIONS_PER_PAGE);
        let offset = i64::from(page - 1) * i64::from(per_page);

        Ok(self
            .store
            .list_sessions(orbit_id, user_id, i64::from(per_page), offset)
            .await?)
    }

    /// The user behind a validated access token.
    pub async fn userinfo(&self, claims: &AccessTokenClaims) -> Result<User, ServiceError> {
        let user_id = claims.user_id().ok_or(ServiceError::InvalidToken)?;
        let user = match self.store.find_user(claims.orbit_id, user_id).await {
            Ok(Some(user)) => user,
            Ok(None) | Err(StoreError::NotFound(_)) => return Err(ServiceError::InvalidToken),
            Err(e) => return Err(e.into()),
        };
        if !user.can_authenticate() {
            return Err(ServiceError::InactiveAccount);
        }
        Ok(user)
    }
}
