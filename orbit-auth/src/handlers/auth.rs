use service_core::{
    axum::{
        extract::{ConnectInfo, Query, State},
        http::StatusCode,
        response::IntoResponse,
        Json,
    },
    error::AppError,
};
use std::net::SocketAddr;

use crate::{
    dtos::auth::{
        AccessTokenResponse, LoginRequest, LoginResponse, MessageResponse, RefreshRequest,
        SessionListResponse, SessionView, SessionsQuery,
    },
    middleware::{AuthUser, OrbitId},
    services::{auth::LoginInput, ServiceError},
    utils::{token::parse_scopes, Password, ValidatedJson},
    AppState,
};

const DEFAULT_SESSIONS_PER_PAGE: u32 = 20;

/// Login with email and password
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    params(("x-orbit-id" = String, Header, description = "Orbit of the user")),
    responses(
        (status = 200, description = "Login successful", body = LoginResponse),
        (status = 401, description = "Invalid credentials", body = ErrorResponse),
        (status = 403, description = "Account inactive", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse),
        (status = 429, description = "Too many attempts", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn login(
    State(state): State<AppState>,
    OrbitId(orbit_id): OrbitId,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    ValidatedJson(req): ValidatedJson<LoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state
        .engines
        .auth
        .login(
            orbit_id,
            LoginInput {
                email: req.email,
                password: Password::new(req.password),
                client_id: req.client_id,
                scopes: parse_scopes(req.scope.as_deref()),
                device_info: req.device_info,
                ip_address: connect_info.map(|ConnectInfo(addr)| addr.ip().to_string()),
            },
        )
        .await?;

    Ok((
        StatusCode::OK,
        Json(LoginResponse {
            expires_in: outcome.access.expires_in(),
            access_token: outcome.access.token,
            refresh_token: outcome.refresh_material,
            token_type: "Bearer".to_string(),
            session_id: outcome.session.id,
        }),
    ))
}

/// Get a fresh access token for an existing session
#[utoipa::path(
    post,
    path = "/auth/refresh",
    request_body = RefreshRequest,
    params(("x-orbit-id" = String, Header, description = "Orbit of the user")),
    responses(
        (status = 200, description = "Access token issued", body = AccessTokenResponse),
        (status = 400, description = "Unknown or malformed session token", body = ErrorResponse),
        (status = 401, description = "Session revoked or expired", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn refresh(
    State(state): State<AppState>,
    OrbitId(orbit_id): OrbitId,
    ValidatedJson(req): ValidatedJson<RefreshRequest>,
) -> Result<impl IntoResponse, AppError> {
    let access = state
        .engines
        .auth
        .refresh(orbit_id, &req.refresh_token, &req.client_id)
        .await?;

    Ok(Json(AccessTokenResponse {
        expires_in: access.expires_in(),
        access_token: access.token,
        token_type: "Bearer".to_string(),
    }))
}

/// End the session behind the presented access token
#[utoipa::path(
    post,
    path = "/auth/logout",
    responses(
        (status = 200, description = "Logged out", body = MessageResponse),
        (status = 400, description = "Token is not bound to a session", body = ErrorResponse),
        (status = 401, description = "Invalid token", body = ErrorResponse)
    ),
    tag = "Authentication",
    security(("bearer_auth" = []))
)]
pub async fn logout(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
) -> Result<impl IntoResponse, AppError> {
    let user_id = claims.user_id().ok_or(ServiceError::InvalidToken)?;
    let session_id = claims.session_id().ok_or_else(|| {
        AppError::BadRequest(anyhow::anyhow!("Token is not bound to a session"))
    })?;

    state
        .engines
        .auth
        .logout(claims.orbit_id, user_id, session_id)
        .await?;

    Ok(Json(MessageResponse {
        message: "Logged out".to_string(),
    }))
}

/// List the caller's sessions
#[utoipa::path(
    get,
    path = "/auth/sessions",
    params(SessionsQuery),
    responses(
        (status = 200, description = "One page of sessions, newest first", body = SessionListResponse),
        (status = 401, description = "Invalid token", body = ErrorResponse)
    ),
    tag = "Authentication",
    security(("bearer_auth" = []))
)]
pub async fn list_sessions(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Query(query): Query<SessionsQuery>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = claims.user_id().ok_or(ServiceError::InvalidToken)?;
    let page = query.page.unwrap_or(1).max(1);
    let per_page = query
        .per_page
        .unwrap_or(DEFAULT_SESSIONS_PER_PAGE)
        .clamp(1, crate::services::auth::MAX_SESSIONS_PER_PAGE);

    let result = state
        .engines
        .auth
        .list_sessions(claims.orbit_id, user_id, page, per_page)
        .await?;

    let current = claims.session_id();
    Ok(Json(SessionListResponse {
        sessions: result
            .sessions
            .into_iter()
            .map(|s| SessionView::from_session(s, current))
            .collect(),
        page,
        per_page,
        total: result.total,
    }))
}
