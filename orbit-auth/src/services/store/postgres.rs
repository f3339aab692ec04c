use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::{ChainRevocation, SessionPage, SessionRevocation, Store, StoreError, StoreResult};
use crate::models::{
    AccessTokenRecord, AuthCode, Client, Consent, Orbit, RefreshToken, RevokedToken, Role,
    Session, SigningKey, TokenKind, User,
};

const USER_COLUMNS: &str = "id, orbit_id, username, email, password_hash, password_algo, \
    is_active, is_locked, mfa_enabled, email_verified, profile, metadata, created_at, \
    updated_at, deleted_at";
const CLIENT_COLUMNS: &str = "id, orbit_id, client_id, name, secret_hash, redirect_uris, \
    grant_types, token_endpoint_auth_method, is_public, allowed_scopes, created_at, updated_at";
const SESSION_COLUMNS: &str = "id, orbit_id, user_id, client_id, secret_hash, scopes, \
    device_info, ip_address, started_at, last_active_at, expires_at, revoked, revoked_at, metadata";
const CODE_COLUMNS: &str = "code, orbit_id, client_id, user_id, redirect_uri, scopes, \
    code_challenge, code_challenge_method, used, expires_at, created_at";
const ACCESS_COLUMNS: &str = "jti, orbit_id, client_id, user_id, session_id, refresh_token_id, \
    scopes, issued_at, expires_at, revoked";
const REFRESH_COLUMNS: &str = "id, orbit_id, client_id, user_id, token_hash, scopes, revoked, \
    rotated_from_id, rotated_to_id, use_count, last_used_at, expires_at, created_at";
const CONSENT_COLUMNS: &str =
    "id, orbit_id, user_id, client_id, scopes, granted_at, expires_at, revoked";
const REVOKED_COLUMNS: &str = "jti, orbit_id, token_kind, reason, revoked_at, expires_at";

/// Durable store on PostgreSQL.
///
/// Atomic units open a transaction and take `FOR UPDATE` locks on the rows
/// they decide on. Returning early drops the transaction, which rolls it back.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Unique violations become `Conflict` with a caller-presentable message.
fn map_unique(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            let message = match db.constraint() {
                Some("users_orbit_email_key") => "Email already registered",
                Some("users_orbit_username_key") => "Username already taken",
                Some("oauth_clients_orbit_client_key") => "client_id already exists",
                Some("orbits_name_key") => "Orbit name already taken",
                Some("roles_orbit_id_name_key") => "Role already exists",
                _ => "Record already exists",
            };
            return StoreError::Conflict(message.to_string());
        }
    }
    StoreError::Database(err)
}

// ==================== Shared statements ====================

async fn insert_access(conn: &mut PgConnection, r: &AccessTokenRecord) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO access_tokens (jti, orbit_id, client_id, user_id, session_id, \
         refresh_token_id, scopes, issued_at, expires_at, revoked) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(&r.jti)
    .bind(r.orbit_id)
    .bind(&r.client_id)
    .bind(r.user_id)
    .bind(r.session_id)
    .bind(r.refresh_token_id)
    .bind(&r.scopes)
    .bind(r.issued_at)
    .bind(r.expires_at)
    .bind(r.revoked)
    .execute(conn)
    .await
    .map_err(map_unique)?;
    Ok(())
}

async fn insert_refresh(conn: &mut PgConnection, t: &RefreshToken) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO refresh_tokens (id, orbit_id, client_id, user_id, token_hash, scopes, \
         revoked, rotated_from_id, rotated_to_id, use_count, last_used_at, expires_at, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
    )
    .bind(t.id)
    .bind(t.orbit_id)
    .bind(&t.client_id)
    .bind(t.user_id)
    .bind(&t.token_hash)
    .bind(&t.scopes)
    .bind(t.revoked)
    .bind(t.rotated_from_id)
    .bind(t.rotated_to_id)
    .bind(t.use_count)
    .bind(t.last_used_at)
    .bind(t.expires_at)
    .bind(t.created_at)
    .execute(conn)
    .await
    .map_err(map_unique)?;
    Ok(())
}

async fn append_ledger(conn: &mut PgConnection, entry: &RevokedToken) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO revoked_tokens (jti, orbit_id, token_kind, reason, revoked_at, expires_at) \
         VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT (jti) DO NOTHING",
    )
    .bind(&entry.jti)
    .bind(entry.orbit_id)
    .bind(&entry.token_kind)
    .bind(&entry.reason)
    .bind(entry.revoked_at)
    .bind(entry.expires_at)
    .execute(conn)
    .await?;
    Ok(())
}

async fn revoke_access_in(
    conn: &mut PgConnection,
    orbit_id: Uuid,
    jti: &str,
    reason: &str,
) -> StoreResult<Option<AccessTokenRecord>> {
    let query = format!(
        "UPDATE access_tokens SET revoked = TRUE WHERE jti = $1 AND orbit_id = $2 \
         RETURNING {}",
        ACCESS_COLUMNS
    );
    let record = sqlx::query_as::<_, AccessTokenRecord>(&query)
        .bind(jti)
        .bind(orbit_id)
        .fetch_optional(&mut *conn)
        .await?;

    let entry = RevokedToken::new(
        jti.to_string(),
        orbit_id,
        TokenKind::Access,
        reason,
        record.as_ref().map(|r| r.expires_at),
    );
    append_ledger(conn, &entry).await?;
    Ok(record)
}

async fn revoke_refresh_in(
    conn: &mut PgConnection,
    orbit_id: Uuid,
    id: Uuid,
    reason: &str,
    out: &mut ChainRevocation,
) -> StoreResult<bool> {
    let expires_at: Option<(DateTime<Utc>,)> = sqlx::query_as(
        "UPDATE refresh_tokens SET revoked = TRUE WHERE id = $1 AND orbit_id = $2 \
         RETURNING expires_at",
    )
    .bind(id)
    .bind(orbit_id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some((expires_at,)) = expires_at else {
        return Ok(false);
    };
    out.refresh_ids.push(id);
    let entry = RevokedToken::new(
        id.to_string(),
        orbit_id,
        TokenKind::Refresh,
        reason,
        Some(expires_at),
    );
    append_ledger(&mut *conn, &entry).await?;

    let minted: Vec<(String, DateTime<Utc>)> = sqlx::query_as(
        "UPDATE access_tokens SET revoked = TRUE \
         WHERE refresh_token_id = $1 AND orbit_id = $2 AND revoked = FALSE \
         RETURNING jti, expires_at",
    )
    .bind(id)
    .bind(orbit_id)
    .fetch_all(&mut *conn)
    .await?;

    for (jti, expires_at) in minted {
        let entry = RevokedToken::new(
            jti.clone(),
            orbit_id,
            TokenKind::Access,
            reason,
            Some(expires_at),
        );
        append_ledger(&mut *conn, &entry).await?;
        out.access_jtis.push(jti);
    }
    Ok(true)
}

#[async_trait]
impl Store for PgStore {
    // ==================== Orbits ====================

    async fn create_orbit(&self, orbit: &Orbit) -> StoreResult<()> {
        sqlx::query("INSERT INTO orbits (id, name, created_at) VALUES ($1, $2, $3)")
            .bind(orbit.id)
            .bind(&orbit.name)
            .bind(orbit.created_at)
            .execute(&self.pool)
            .await
            .map_err(map_unique)?;
        Ok(())
    }

    async fn find_orbit(&self, id: Uuid) -> StoreResult<Option<Orbit>> {
        Ok(
            sqlx::query_as::<_, Orbit>("SELECT id, name, created_at FROM orbits WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    // ==================== Users & Roles ====================

    async fn create_user(&self, user: &User) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO users (id, orbit_id, username, email, password_hash, password_algo, \
             is_active, is_locked, mfa_enabled, email_verified, profile, metadata, created_at, \
             updated_at, deleted_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(user.id)
        .bind(user.orbit_id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.password_algo)
        .bind(user.is_active)
        .bind(user.is_locked)
        .bind(user.mfa_enabled)
        .bind(user.email_verified)
        .bind(&user.profile)
        .bind(&user.metadata)
        .bind(user.created_at)
        .bind(user.updated_at)
        .bind(user.deleted_at)
        .execute(&self.pool)
        .await
        .map_err(map_unique)?;
        Ok(())
    }

    async fn find_user(&self, orbit_id: Uuid, id: Uuid) -> StoreResult<Option<User>> {
        let query = format!(
            "SELECT {} FROM users WHERE id = $1 AND orbit_id = $2 AND deleted_at IS NULL",
            USER_COLUMNS
        );
        Ok(sqlx::query_as::<_, User>(&query)
            .bind(id)
            .bind(orbit_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_user_by_email(&self, orbit_id: Uuid, email: &str) -> StoreResult<Option<User>> {
        let query = format!(
            "SELECT {} FROM users WHERE orbit_id = $1 AND email = $2 AND deleted_at IS NULL",
            USER_COLUMNS
        );
        Ok(sqlx::query_as::<_, User>(&query)
            .bind(orbit_id)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn set_user_status(
        &self,
        orbit_id: Uuid,
        id: Uuid,
        is_active: bool,
        is_locked: bool,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE users SET is_active = $3, is_locked = $4, updated_at = now() \
             WHERE id = $1 AND orbit_id = $2",
        )
        .bind(id)
        .bind(orbit_id)
        .bind(is_active)
        .bind(is_locked)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("User"));
        }
        Ok(())
    }

    async fn create_role(&self, role: &Role) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO roles (id, orbit_id, name, description, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(role.id)
        .bind(role.orbit_id)
        .bind(&role.name)
        .bind(&role.description)
        .bind(role.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_unique)?;
        Ok(())
    }

    async fn assign_role(&self, orbit_id: Uuid, user_id: Uuid, role_id: Uuid) -> StoreResult<()> {
        let exists: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM roles WHERE id = $1 AND orbit_id = $2")
                .bind(role_id)
                .bind(orbit_id)
                .fetch_optional(&self.pool)
                .await?;
        if exists.is_none() {
            return Err(StoreError::NotFound("Role"));
        }

        sqlx::query(
            "INSERT INTO user_roles (orbit_id, user_id, role_id) VALUES ($1, $2, $3) \
             ON CONFLICT DO NOTHING",
        )
        .bind(orbit_id)
        .bind(user_id)
        .bind(role_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn role_ids_for_user(&self, orbit_id: Uuid, user_id: Uuid) -> StoreResult<Vec<String>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT role_id FROM user_roles WHERE orbit_id = $1 AND user_id = $2 ORDER BY role_id",
        )
        .bind(orbit_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id.to_string()).collect())
    }

    // ==================== Clients ====================

    async fn create_client(&self, client: &Client) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO oauth_clients (id, orbit_id, client_id, name, secret_hash, redirect_uris, \
             grant_types, token_endpoint_auth_method, is_public, allowed_scopes, created_at, \
             updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(client.id)
        .bind(client.orbit_id)
        .bind(&client.client_id)
        .bind(&client.name)
        .bind(&client.secret_hash)
        .bind(&client.redirect_uris)
        .bind(&client.grant_types)
        .bind(&client.token_endpoint_auth_method)
        .bind(client.is_public)
        .bind(&client.allowed_scopes)
        .bind(client.created_at)
        .bind(client.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_unique)?;
        Ok(())
    }

    async fn find_client(&self, orbit_id: Uuid, client_id: &str) -> StoreResult<Option<Client>> {
        let query = format!(
            "SELECT {} FROM oauth_clients WHERE orbit_id = $1 AND client_id = $2",
            CLIENT_COLUMNS
        );
        Ok(sqlx::query_as::<_, Client>(&query)
            .bind(orbit_id)
            .bind(client_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn update_client_secret(
        &self,
        orbit_id: Uuid,
        client_id: &str,
        secret_hash: &str,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE oauth_clients SET secret_hash = $3, updated_at = now() \
             WHERE orbit_id = $1 AND client_id = $2",
        )
        .bind(orbit_id)
        .bind(client_id)
        .bind(secret_hash)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("Client"));
        }
        Ok(())
    }

    // ==================== Sessions ====================

    async fn open_session(&self, session: &Session, access: &AccessTokenRecord) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO sessions (id, orbit_id, user_id, client_id, secret_hash, scopes, \
             device_info, ip_address, started_at, last_active_at, expires_at, revoked, \
             revoked_at, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(session.id)
        .bind(session.orbit_id)
        .bind(session.user_id)
        .bind(&session.client_id)
        .bind(&session.secret_hash)
        .bind(&session.scopes)
        .bind(&session.device_info)
        .bind(&session.ip_address)
        .bind(session.started_at)
        .bind(session.last_active_at)
        .bind(session.expires_at)
        .bind(session.revoked)
        .bind(session.revoked_at)
        .bind(&session.metadata)
        .execute(&mut *tx)
        .await
        .map_err(map_unique)?;

        insert_access(&mut tx, access).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_session(&self, orbit_id: Uuid, id: Uuid) -> StoreResult<Option<Session>> {
        let query = format!(
            "SELECT {} FROM sessions WHERE id = $1 AND orbit_id = $2",
            SESSION_COLUMNS
        );
        Ok(sqlx::query_as::<_, Session>(&query)
            .bind(id)
            .bind(orbit_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn refresh_session(
        &self,
        orbit_id: Uuid,
        session_id: Uuid,
        access: &AccessTokenRecord,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(bool, DateTime<Utc>)> = sqlx::query_as(
            "SELECT revoked, expires_at FROM sessions WHERE id = $1 AND orbit_id = $2 FOR UPDATE",
        )
        .bind(session_id)
        .bind(orbit_id)
        .fetch_optional(&mut *tx)
        .await?;

        match row {
            None => return Err(StoreError::NotFound("Session")),
            Some((true, _)) => return Err(StoreError::Revoked),
            Some((false, expires_at)) if Utc::now() > expires_at => {
                return Err(StoreError::Expired)
            }
            Some(_) => {}
        }

        sqlx::query("UPDATE sessions SET last_active_at = now() WHERE id = $1")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        insert_access(&mut tx, access).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn revoke_session(
        &self,
        orbit_id: Uuid,
        session_id: Uuid,
        reason: &str,
    ) -> StoreResult<SessionRevocation> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(bool,)> = sqlx::query_as(
            "SELECT revoked FROM sessions WHERE id = $1 AND orbit_id = $2 FOR UPDATE",
        )
        .bind(session_id)
        .bind(orbit_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((already_revoked,)) = row else {
            return Err(StoreError::NotFound("Session"));
        };

        if !already_revoked {
            sqlx::query("UPDATE sessions SET revoked = TRUE, revoked_at = now() WHERE id = $1")
                .bind(session_id)
                .execute(&mut *tx)
                .await?;
        }

        let live: Vec<(String,)> = sqlx::query_as(
            "SELECT jti FROM access_tokens \
             WHERE session_id = $1 AND orbit_id = $2 AND revoked = FALSE FOR UPDATE",
        )
        .bind(session_id)
        .bind(orbit_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut access_jtis = Vec::with_capacity(live.len());
        for (jti,) in live {
            revoke_access_in(&mut tx, orbit_id, &jti, reason).await?;
            access_jtis.push(jti);
        }

        tx.commit().await?;
        Ok(SessionRevocation {
            newly_revoked: !already_revoked,
            access_jtis,
        })
    }

    async fn list_sessions(
        &self,
        orbit_id: Uuid,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> StoreResult<SessionPage> {
        let (total,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sessions WHERE orbit_id = $1 AND user_id = $2")
                .bind(orbit_id)
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;

        let query = format!(
            "SELECT {} FROM sessions WHERE orbit_id = $1 AND user_id = $2 \
             ORDER BY started_at DESC LIMIT $3 OFFSET $4",
            SESSION_COLUMNS
        );
        let sessions = sqlx::query_as::<_, Session>(&query)
            .bind(orbit_id)
            .bind(user_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        Ok(SessionPage { sessions, total })
    }

    // ==================== Authorization Codes ====================

    async fn create_auth_code(&self, code: &AuthCode) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO auth_codes (code, orbit_id, client_id, user_id, redirect_uri, scopes, \
             code_challenge, code_challenge_method, used, expires_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(&code.code)
        .bind(code.orbit_id)
        .bind(&code.client_id)
        .bind(code.user_id)
        .bind(&code.redirect_uri)
        .bind(&code.scopes)
        .bind(&code.code_challenge)
        .bind(&code.code_challenge_method)
        .bind(code.used)
        .bind(code.expires_at)
        .bind(code.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_unique)?;
        Ok(())
    }

    async fn find_auth_code(&self, orbit_id: Uuid, code: &str) -> StoreResult<Option<AuthCode>> {
        let query = format!(
            "SELECT {} FROM auth_codes WHERE code = $1 AND orbit_id = $2",
            CODE_COLUMNS
        );
        Ok(sqlx::query_as::<_, AuthCode>(&query)
            .bind(code)
            .bind(orbit_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn redeem_auth_code(
        &self,
        orbit_id: Uuid,
        code: &str,
        access: &AccessTokenRecord,
        refresh: Option<&RefreshToken>,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(bool, DateTime<Utc>)> = sqlx::query_as(
            "SELECT used, expires_at FROM auth_codes WHERE code = $1 AND orbit_id = $2 FOR UPDATE",
        )
        .bind(code)
        .bind(orbit_id)
        .fetch_optional(&mut *tx)
        .await?;

        match row {
            None => return Err(StoreError::NotFound("Authorization code")),
            Some((true, _)) => return Err(StoreError::AlreadyUsed),
            Some((false, expires_at)) if Utc::now() >= expires_at => {
                return Err(StoreError::Expired)
            }
            Some(_) => {}
        }

        if let Some(refresh) = refresh {
            insert_refresh(&mut tx, refresh).await?;
        }
        insert_access(&mut tx, access).await?;

        sqlx::query("UPDATE auth_codes SET used = TRUE WHERE code = $1")
            .bind(code)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    // ==================== Access Tokens & Revocation ====================

    async fn create_access_token(&self, record: &AccessTokenRecord) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await?;
        insert_access(&mut conn, record).await
    }

    async fn find_access_token(
        &self,
        orbit_id: Uuid,
        jti: &str,
    ) -> StoreResult<Option<AccessTokenRecord>> {
        let query = format!(
            "SELECT {} FROM access_tokens WHERE jti = $1 AND orbit_id = $2",
            ACCESS_COLUMNS
        );
        Ok(sqlx::query_as::<_, AccessTokenRecord>(&query)
            .bind(jti)
            .bind(orbit_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn revoke_access_token(
        &self,
        orbit_id: Uuid,
        jti: &str,
        reason: &str,
    ) -> StoreResult<Option<AccessTokenRecord>> {
        let mut tx = self.pool.begin().await?;
        let record = revoke_access_in(&mut tx, orbit_id, jti, reason).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn find_revocation(&self, jti: &str) -> StoreResult<Option<RevokedToken>> {
        let query = format!("SELECT {} FROM revoked_tokens WHERE jti = $1", REVOKED_COLUMNS);
        Ok(sqlx::query_as::<_, RevokedToken>(&query)
            .bind(jti)
            .fetch_optional(&self.pool)
            .await?)
    }

    // ==================== Refresh Tokens ====================

    async fn find_refresh_token_by_hash(
        &self,
        token_hash: &str,
    ) -> StoreResult<Option<RefreshToken>> {
        let query = format!(
            "SELECT {} FROM refresh_tokens WHERE token_hash = $1",
            REFRESH_COLUMNS
        );
        Ok(sqlx::query_as::<_, RefreshToken>(&query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn rotate_refresh_token(
        &self,
        orbit_id: Uuid,
        old_id: Uuid,
        new_refresh: &RefreshToken,
        new_access: &AccessTokenRecord,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let query = format!(
            "SELECT {} FROM refresh_tokens WHERE id = $1 AND orbit_id = $2 FOR UPDATE",
            REFRESH_COLUMNS
        );
        let old = sqlx::query_as::<_, RefreshToken>(&query)
            .bind(old_id)
            .bind(orbit_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound("Refresh token"))?;

        if old.is_rotated() {
            return Err(StoreError::AlreadyRotated);
        }
        if old.revoked {
            return Err(StoreError::Revoked);
        }
        if old.is_expired() {
            return Err(StoreError::Expired);
        }

        let mut next = new_refresh.clone();
        next.rotated_from_id = Some(old_id);
        insert_refresh(&mut tx, &next).await?;

        sqlx::query(
            "UPDATE refresh_tokens SET rotated_to_id = $2, use_count = use_count + 1, \
             last_used_at = now() WHERE id = $1",
        )
        .bind(old_id)
        .bind(next.id)
        .execute(&mut *tx)
        .await?;

        insert_access(&mut tx, new_access).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn revoke_refresh_token(
        &self,
        orbit_id: Uuid,
        id: Uuid,
        reason: &str,
    ) -> StoreResult<ChainRevocation> {
        let mut tx = self.pool.begin().await?;
        let mut out = ChainRevocation::default();
        if !revoke_refresh_in(&mut tx, orbit_id, id, reason, &mut out).await? {
            return Err(StoreError::NotFound("Refresh token"));
        }
        tx.commit().await?;
        Ok(out)
    }

    async fn revoke_refresh_chain(
        &self,
        orbit_id: Uuid,
        start_id: Uuid,
        reason: &str,
    ) -> StoreResult<ChainRevocation> {
        let mut tx = self.pool.begin().await?;
        let mut out = ChainRevocation::default();
        let mut cursor = Some(start_id);

        while let Some(id) = cursor {
            if out.refresh_ids.contains(&id) {
                break;
            }
            let next: Option<(Option<Uuid>,)> = sqlx::query_as(
                "SELECT rotated_to_id FROM refresh_tokens WHERE id = $1 AND orbit_id = $2 \
                 FOR UPDATE",
            )
            .bind(id)
            .bind(orbit_id)
            .fetch_optional(&mut *tx)
            .await?;

            let Some((rotated_to,)) = next else {
                break;
            };
            revoke_refresh_in(&mut tx, orbit_id, id, reason, &mut out).await?;
            cursor = rotated_to;
        }

        if out.refresh_ids.is_empty() {
            return Err(StoreError::NotFound("Refresh token"));
        }
        tx.commit().await?;
        Ok(out)
    }

    // ==================== Consents ====================

    async fn upsert_consent(&self, consent: &Consent) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO consents (id, orbit_id, user_id, client_id, scopes, granted_at, \
             expires_at, revoked) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (orbit_id, user_id, client_id) DO UPDATE SET \
             scopes = EXCLUDED.scopes, granted_at = EXCLUDED.granted_at, \
             expires_at = EXCLUDED.expires_at, revoked = EXCLUDED.revoked",
        )
        .bind(consent.id)
        .bind(consent.orbit_id)
        .bind(consent.user_id)
        .bind(&consent.client_id)
        .bind(&consent.scopes)
        .bind(consent.granted_at)
        .bind(consent.expires_at)
        .bind(consent.revoked)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_consent(
        &self,
        orbit_id: Uuid,
        user_id: Uuid,
        client_id: &str,
    ) -> StoreResult<Option<Consent>> {
        let query = format!(
            "SELECT {} FROM consents WHERE orbit_id = $1 AND user_id = $2 AND client_id = $3",
            CONSENT_COLUMNS
        );
        Ok(sqlx::query_as::<_, Consent>(&query)
            .bind(orbit_id)
            .bind(user_id)
            .bind(client_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn revoke_consent(
        &self,
        orbit_id: Uuid,
        user_id: Uuid,
        client_id: &str,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE consents SET revoked = TRUE \
             WHERE orbit_id = $1 AND user_id = $2 AND client_id = $3 AND revoked = FALSE",
        )
        .bind(orbit_id)
        .bind(user_id)
        .bind(client_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ==================== Signing Keys ====================

    async fn upsert_signing_key(&self, key: &SigningKey) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        if key.is_active {
            sqlx::query(
                "UPDATE signing_keys SET is_active = FALSE \
                 WHERE orbit_id IS NOT DISTINCT FROM $1 AND kid <> $2",
            )
            .bind(key.orbit_id)
            .bind(&key.kid)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO signing_keys (kid, orbit_id, algorithm, public_jwk, not_before, \
             expires_at, is_active, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (kid) DO UPDATE SET public_jwk = EXCLUDED.public_jwk, \
             expires_at = EXCLUDED.expires_at, is_active = EXCLUDED.is_active",
        )
        .bind(&key.kid)
        .bind(key.orbit_id)
        .bind(&key.algorithm)
        .bind(&key.public_jwk)
        .bind(key.not_before)
        .bind(key.expires_at)
        .bind(key.is_active)
        .bind(key.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::db;
    use chrono::Duration;

    async fn store() -> PgStore {
        let config = DatabaseConfig {
            url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/orbit_auth_test".to_string()),
            max_connections: 5,
            min_connections: 1,
        };
        let pool = db::create_pool(&config).await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        PgStore::new(pool)
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn concurrent_redeem_has_one_winner() {
        let store = store().await;
        let orbit = Orbit::new(format!("orbit-{}", Uuid::new_v4()));
        store.create_orbit(&orbit).await.unwrap();
        let user = User::new(orbit.id, "u".into(), "u@x.com".into(), "h".into());
        store.create_user(&user).await.unwrap();

        let code = AuthCode::new(
            Uuid::new_v4().to_string(),
            orbit.id,
            "c1".into(),
            user.id,
            "https://app/cb".into(),
            vec![],
            None,
            None,
            Duration::minutes(5),
        );
        store.create_auth_code(&code).await.unwrap();

        let record = |jti: &str| AccessTokenRecord {
            jti: jti.to_string(),
            orbit_id: orbit.id,
            client_id: "c1".into(),
            user_id: Some(user.id),
            session_id: None,
            refresh_token_id: None,
            scopes: vec![],
            issued_at: Utc::now(),
            expires_at: Utc::now() + Duration::minutes(15),
            revoked: false,
        };
        let a = record(&Uuid::new_v4().to_string());
        let b = record(&Uuid::new_v4().to_string());

        let (first, second) = tokio::join!(
            store.redeem_auth_code(orbit.id, &code.code, &a, None),
            store.redeem_auth_code(orbit.id, &code.code, &b, None),
        );

        assert_eq!(
            [first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(),
            1
        );
        assert!(matches!(
            first.err().or(second.err()),
            Some(StoreError::AlreadyUsed)
        ));
    }
}
