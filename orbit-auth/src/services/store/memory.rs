use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{ChainRevocation, SessionPage, SessionRevocation, Store, StoreError, StoreResult};
use crate::models::{
    AccessTokenRecord, AuthCode, Client, Consent, Orbit, RefreshToken, RevokedToken, Role,
    Session, SigningKey, TokenKind, User,
};

/// In-process store for tests and `STORE_BACKEND=memory` local runs.
///
/// One mutex guards all tables and is held for the whole of each atomic
/// unit, which gives the same serialization the Postgres row locks give.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    orbits: HashMap<Uuid, Orbit>,
    users: HashMap<Uuid, User>,
    roles: HashMap<Uuid, Role>,
    user_roles: Vec<(Uuid, Uuid, Uuid)>,
    clients: HashMap<(Uuid, String), Client>,
    sessions: HashMap<Uuid, Session>,
    auth_codes: HashMap<String, AuthCode>,
    access_tokens: HashMap<String, AccessTokenRecord>,
    refresh_tokens: HashMap<Uuid, RefreshToken>,
    revoked: HashMap<String, RevokedToken>,
    consents: HashMap<(Uuid, Uuid, String), Consent>,
    signing_keys: HashMap<String, SigningKey>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("Memory store mutex poisoned: {}", e)))
    }
}

impl Inner {
    fn insert_access(&mut self, record: &AccessTokenRecord) -> StoreResult<()> {
        if self.access_tokens.contains_key(&record.jti) {
            return Err(StoreError::Conflict(format!("duplicate jti {}", record.jti)));
        }
        self.access_tokens.insert(record.jti.clone(), record.clone());
        Ok(())
    }

    fn insert_refresh(&mut self, token: &RefreshToken) -> StoreResult<()> {
        let duplicate = self.refresh_tokens.contains_key(&token.id)
            || self
                .refresh_tokens
                .values()
                .any(|t| t.token_hash == token.token_hash);
        if duplicate {
            return Err(StoreError::Conflict("duplicate refresh token".into()));
        }
        self.refresh_tokens.insert(token.id, token.clone());
        Ok(())
    }

    fn append_ledger(&mut self, entry: RevokedToken) {
        self.revoked.entry(entry.jti.clone()).or_insert(entry);
    }

    fn revoke_access(&mut self, orbit_id: Uuid, jti: &str, reason: &str) -> Option<AccessTokenRecord> {
        let record = self
            .access_tokens
            .get_mut(jti)
            .filter(|r| r.orbit_id == orbit_id)
            .map(|r| {
                r.revoked = true;
                r.clone()
            });
        let expires_at = record.as_ref().map(|r| r.expires_at);
        self.append_ledger(RevokedToken::new(
            jti.to_string(),
            orbit_id,
            TokenKind::Access,
            reason,
            expires_at,
        ));
        record
    }

    /// Flags one refresh token plus its live access tokens.
    fn revoke_refresh(&mut self, orbit_id: Uuid, id: Uuid, reason: &str, out: &mut ChainRevocation) {
        let Some(token) = self.refresh_tokens.get_mut(&id) else {
            return;
        };
        token.revoked = true;
        let expires_at = token.expires_at;
        out.refresh_ids.push(id);
        self.append_ledger(RevokedToken::new(
            id.to_string(),
            orbit_id,
            TokenKind::Refresh,
            reason,
            Some(expires_at),
        ));

        let jtis: Vec<String> = self
            .access_tokens
            .values()
            .filter(|a| a.refresh_token_id == Some(id) && !a.revoked)
            .map(|a| a.jti.clone())
            .collect();
        for jti in jtis {
            self.revoke_access(orbit_id, &jti, reason);
            out.access_jtis.push(jti);
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_orbit(&self, orbit: &Orbit) -> StoreResult<()> {
        let mut inner = self.lock()?;
        if inner.orbits.values().any(|o| o.name == orbit.name) {
            return Err(StoreError::Conflict("Orbit name already taken".into()));
        }
        inner.orbits.insert(orbit.id, orbit.clone());
        Ok(())
    }

    async fn find_orbit(&self, id: Uuid) -> StoreResult<Option<Orbit>> {
        Ok(self.lock()?.orbits.get(&id).cloned())
    }

    async fn create_user(&self, user: &User) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let same_orbit = inner.users.values().filter(|u| u.orbit_id == user.orbit_id);
        for existing in same_orbit {
            if existing.email == user.email {
                return Err(StoreError::Conflict("Email already registered".into()));
            }
            if existing.username == user.username {
                return Err(StoreError::Conflict("Username already taken".into()));
            }
        }
        inner.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn find_user(&self, orbit_id: Uuid, id: Uuid) -> StoreResult<Option<User>> {
        Ok(self
            .lock()?
            .users
            .get(&id)
            .filter(|u| u.orbit_id == orbit_id && u.deleted_at.is_none())
            .cloned())
    }

    async fn find_user_by_email(&self, orbit_id: Uuid, email: &str) -> StoreResult<Option<User>> {
        Ok(self
            .lock()?
            .users
            .values()
            .find(|u| u.orbit_id == orbit_id && u.email == email && u.deleted_at.is_none())
            .cloned())
    }

    async fn set_user_status(
        &self,
        orbit_id: Uuid,
        id: Uuid,
        is_active: bool,
        is_locked: bool,
    ) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let user = inner
            .users
            .get_mut(&id)
            .filter(|u| u.orbit_id == orbit_id)
            .ok_or(StoreError::NotFound("User"))?;
        user.is_active = is_active;
        user.is_locked = is_locked;
        user.updated_at = Utc::now();
        Ok(())
    }

    async fn create_role(&self, role: &Role) -> StoreResult<()> {
        let mut inner = self.lock()?;
        if inner
            .roles
            .values()
            .any(|r| r.orbit_id == role.orbit_id && r.name == role.name)
        {
            return Err(StoreError::Conflict("Role already exists".into()));
        }
        inner.roles.insert(role.id, role.clone());
        Ok(())
    }

    async fn assign_role(&self, orbit_id: Uuid, user_id: Uuid, role_id: Uuid) -> StoreResult<()> {
        let mut inner = self.lock()?;
        if !inner.roles.get(&role_id).is_some_and(|r| r.orbit_id == orbit_id) {
            return Err(StoreError::NotFound("Role"));
        }
        if !inner.user_roles.contains(&(orbit_id, user_id, role_id)) {
            inner.user_roles.push((orbit_id, user_id, role_id));
        }
        Ok(())
    }

    async fn role_ids_for_user(&self, orbit_id: Uuid, user_id: Uuid) -> StoreResult<Vec<String>> {
        Ok(self
            .lock()?
            .user_roles
            .iter()
            .filter(|(o, u, _)| *o == orbit_id && *u == user_id)
            .map(|(_, _, r)| r.to_string())
            .collect())
    }

    async fn create_client(&self, client: &Client) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let key = (client.orbit_id, client.client_id.clone());
        if inner.clients.contains_key(&key) {
            return Err(StoreError::Conflict("client_id already exists".into()));
        }
        inner.clients.insert(key, client.clone());
        Ok(())
    }

    async fn find_client(&self, orbit_id: Uuid, client_id: &str) -> StoreResult<Option<Client>> {
        Ok(self
            .lock()?
            .clients
            .get(&(orbit_id, client_id.to_string()))
            .cloned())
    }

    async fn update_client_secret(
        &self,
        orbit_id: Uuid,
        client_id: &str,
        secret_hash: &str,
    ) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let client = inner
            .clients
            .get_mut(&(orbit_id, client_id.to_string()))
            .ok_or(StoreError::NotFound("Client"))?;
        client.secret_hash = Some(secret_hash.to_string());
        client.updated_at = Utc::now();
        Ok(())
    }

    async fn open_session(&self, session: &Session, access: &AccessTokenRecord) -> StoreResult<()> {
        let mut inner = self.lock()?;
        if inner.sessions.contains_key(&session.id) {
            return Err(StoreError::Conflict("duplicate session id".into()));
        }
        inner.insert_access(access)?;
        inner.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn find_session(&self, orbit_id: Uuid, id: Uuid) -> StoreResult<Option<Session>> {
        Ok(self
            .lock()?
            .sessions
            .get(&id)
            .filter(|s| s.orbit_id == orbit_id)
            .cloned())
    }

    async fn refresh_session(
        &self,
        orbit_id: Uuid,
        session_id: Uuid,
        access: &AccessTokenRecord,
    ) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let now = Utc::now();
        {
            let session = inner
                .sessions
                .get(&session_id)
                .filter(|s| s.orbit_id == orbit_id)
                .ok_or(StoreError::NotFound("Session"))?;
            if session.revoked {
                return Err(StoreError::Revoked);
            }
            if now > session.expires_at {
                return Err(StoreError::Expired);
            }
        }
        inner.insert_access(access)?;
        if let Some(session) = inner.sessions.get_mut(&session_id) {
            session.last_active_at = now;
        }
        Ok(())
    }

    async fn revoke_session(
        &self,
        orbit_id: Uuid,
        session_id: Uuid,
        reason: &str,
    ) -> StoreResult<SessionRevocation> {
        let mut inner = self.lock()?;
        let session = inner
            .sessions
            .get_mut(&session_id)
            .filter(|s| s.orbit_id == orbit_id)
            .ok_or(StoreError::NotFound("Session"))?;

        let newly_revoked = !session.revoked;
        if newly_revoked {
            session.revoked = true;
            session.revoked_at = Some(Utc::now());
        }

        let jtis: Vec<String> = inner
            .access_tokens
            .values()
            .filter(|a| a.session_id == Some(session_id) && !a.revoked)
            .map(|a| a.jti.clone())
            .collect();
        for jti in &jtis {
            inner.revoke_access(orbit_id, jti, reason);
        }

        Ok(SessionRevocation {
            newly_revoked,
            access_jtis: jtis,
        })
    }

    async fn list_sessions(
        &self,
        orbit_id: Uuid,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> StoreResult<SessionPage> {
        let inner = self.lock()?;
        let mut sessions: Vec<Session> = inner
            .sessions
            .values()
            .filter(|s| s.orbit_id == orbit_id && s.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        let total = sessions.len() as i64;
        let sessions = sessions
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok(SessionPage { sessions, total })
    }

    async fn create_auth_code(&self, code: &AuthCode) -> StoreResult<()> {
        let mut inner = self.lock()?;
        if inner.auth_codes.contains_key(&code.code) {
            return Err(StoreError::Conflict("duplicate authorization code".into()));
        }
        inner.auth_codes.insert(code.code.clone(), code.clone());
        Ok(())
    }

    async fn find_auth_code(&self, orbit_id: Uuid, code: &str) -> StoreResult<Option<AuthCode>> {
        Ok(self
            .lock()?
            .auth_codes
            .get(code)
            .filter(|c| c.orbit_id == orbit_id)
            .cloned())
    }

    async fn redeem_auth_code(
        &self,
        orbit_id: Uuid,
        code: &str,
        access: &AccessTokenRecord,
        refresh: Option<&RefreshToken>,
    ) -> StoreResult<()> {
        let mut inner = self.lock()?;
        {
            let record = inner
                .auth_codes
                .get(code)
                .filter(|c| c.orbit_id == orbit_id)
                .ok_or(StoreError::NotFound("Authorization code"))?;
            if record.used {
                return Err(StoreError::AlreadyUsed);
            }
            if record.is_expired() {
                return Err(StoreError::Expired);
            }
        }

        // Validate every insert before mutating anything.
        if inner.access_tokens.contains_key(&access.jti) {
            return Err(StoreError::Conflict(format!("duplicate jti {}", access.jti)));
        }
        if let Some(refresh) = refresh {
            inner.insert_refresh(refresh)?;
        }
        inner.insert_access(access)?;
        if let Some(record) = inner.auth_codes.get_mut(code) {
            record.used = true;
        }
        Ok(())
    }

    async fn create_access_token(&self, record: &AccessTokenRecord) -> StoreResult<()> {
        self.lock()?.insert_access(record)
    }

    async fn find_access_token(
        &self,
        orbit_id: Uuid,
        jti: &str,
    ) -> StoreResult<Option<AccessTokenRecord>> {
        Ok(self
            .lock()?
            .access_tokens
            .get(jti)
            .filter(|r| r.orbit_id == orbit_id)
            .cloned())
    }

    async fn revoke_access_token(
        &self,
        orbit_id: Uuid,
        jti: &str,
        reason: &str,
    ) -> StoreResult<Option<AccessTokenRecord>> {
        Ok(self.lock()?.revoke_access(orbit_id, jti, reason))
    }

    async fn find_revocation(&self, jti: &str) -> StoreResult<Option<RevokedToken>> {
        Ok(self.lock()?.revoked.get(jti).cloned())
    }

    async fn find_refresh_token_by_hash(
        &self,
        token_hash: &str,
    ) -> StoreResult<Option<RefreshToken>> {
        Ok(self
            .lock()?
            .refresh_tokens
            .values()
            .find(|t| t.token_hash == token_hash)
            .cloned())
    }

    async fn rotate_refresh_token(
        &self,
        orbit_id: Uuid,
        old_id: Uuid,
        new_refresh: &RefreshToken,
        new_access: &AccessTokenRecord,
    ) -> StoreResult<()> {
        let mut inner = self.lock()?;
        {
            let old = inner
                .refresh_tokens
                .get(&old_id)
                .filter(|t| t.orbit_id == orbit_id)
                .ok_or(StoreError::NotFound("Refresh token"))?;
            if old.rotated_to_id.is_some() {
                return Err(StoreError::AlreadyRotated);
            }
            if old.revoked {
                return Err(StoreError::Revoked);
            }
            if old.is_expired() {
                return Err(StoreError::Expired);
            }
        }
        if inner.access_tokens.contains_key(&new_access.jti) {
            return Err(StoreError::Conflict(format!("duplicate jti {}", new_access.jti)));
        }

        let mut next = new_refresh.clone();
        next.rotated_from_id = Some(old_id);
        inner.insert_refresh(&next)?;
        inner.insert_access(new_access)?;

        if let Some(old) = inner.refresh_tokens.get_mut(&old_id) {
            old.rotated_to_id = Some(next.id);
            old.use_count += 1;
            old.last_used_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn revoke_refresh_token(
        &self,
        orbit_id: Uuid,
        id: Uuid,
        reason: &str,
    ) -> StoreResult<ChainRevocation> {
        let mut inner = self.lock()?;
        if !inner
            .refresh_tokens
            .get(&id)
            .is_some_and(|t| t.orbit_id == orbit_id)
        {
            return Err(StoreError::NotFound("Refresh token"));
        }
        let mut out = ChainRevocation::default();
        inner.revoke_refresh(orbit_id, id, reason, &mut out);
        Ok(out)
    }

    async fn revoke_refresh_chain(
        &self,
        orbit_id: Uuid,
        start_id: Uuid,
        reason: &str,
    ) -> StoreResult<ChainRevocation> {
        let mut inner = self.lock()?;
        let mut out = ChainRevocation::default();
        let mut cursor = Some(start_id);

        while let Some(id) = cursor {
            let Some(token) = inner.refresh_tokens.get(&id).filter(|t| t.orbit_id == orbit_id) else {
                break;
            };
            cursor = token.rotated_to_id;
            if out.refresh_ids.contains(&id) {
                break;
            }
            inner.revoke_refresh(orbit_id, id, reason, &mut out);
        }

        if out.refresh_ids.is_empty() {
            return Err(StoreError::NotFound("Refresh token"));
        }
        Ok(out)
    }

    async fn upsert_consent(&self, consent: &Consent) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let key = (consent.orbit_id, consent.user_id, consent.client_id.clone());
        let mut record = consent.clone();
        if let Some(existing) = inner.consents.get(&key) {
            record.id = existing.id;
        }
        inner.consents.insert(key, record);
        Ok(())
    }

    async fn find_consent(
        &self,
        orbit_id: Uuid,
        user_id: Uuid,
        client_id: &str,
    ) -> StoreResult<Option<Consent>> {
        Ok(self
            .lock()?
            .consents
            .get(&(orbit_id, user_id, client_id.to_string()))
            .cloned())
    }

    async fn revoke_consent(
        &self,
        orbit_id: Uuid,
        user_id: Uuid,
        client_id: &str,
    ) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        match inner
            .consents
            .get_mut(&(orbit_id, user_id, client_id.to_string()))
        {
            Some(consent) if !consent.revoked => {
                consent.revoked = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn upsert_signing_key(&self, key: &SigningKey) -> StoreResult<()> {
        let mut inner = self.lock()?;
        if key.is_active {
            for other in inner.signing_keys.values_mut() {
                if other.orbit_id == key.orbit_id && other.kid != key.kid {
                    other.is_active = false;
                }
            }
        }
        inner.signing_keys.insert(key.kid.clone(), key.clone());
        Ok(())
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.lock().map(|_| ())
    }
}

#[cfg(test)]
impl MemoryStore {
    /// Pushes `expires_at` one second into the past for the session or
    /// refresh token with this id, or the authorization code with this value.
    pub fn force_expire(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        let past = Utc::now() - chrono::Duration::seconds(1);
        match Uuid::parse_str(key) {
            Ok(id) => {
                if let Some(session) = inner.sessions.get_mut(&id) {
                    session.expires_at = past;
                }
                if let Some(token) = inner.refresh_tokens.get_mut(&id) {
                    token.expires_at = past;
                }
            }
            Err(_) => {
                if let Some(code) = inner.auth_codes.get_mut(key) {
                    code.expires_at = past;
                }
            }
        }
    }
}
