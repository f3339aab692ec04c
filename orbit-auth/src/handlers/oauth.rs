use axum_extra::{
    headers::{authorization::Basic, Authorization},
    TypedHeader,
};
use service_core::axum::{
    extract::{
        rejection::{FormRejection, QueryRejection},
        Query, State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Form, Json,
};
use url::Url;

use crate::{
    dtos::{
        auth::UserInfoResponse,
        oauth::{
            AuthorizeQuery, IntrospectionResponse, OAuthErrorResponse, TokenHintRequest,
            TokenRequest, TokenResponse,
        },
    },
    middleware::{bearer_token, AuthUser, OrbitId},
    models::Client,
    services::{
        client::{ClientCredentials, CredentialSource},
        metrics,
        oauth::{AuthorizationRequest, GrantRequest},
        ServiceError,
    },
    utils::token::parse_scopes,
    AppState,
};

/// An engine failure rendered as an RFC 6749 error body.
///
/// Server-side failures carry no description; the cause is only logged.
#[derive(Debug)]
pub struct OAuthError(pub ServiceError);

impl From<ServiceError> for OAuthError {
    fn from(err: ServiceError) -> Self {
        OAuthError(err)
    }
}

impl OAuthError {
    /// Collapses every reason a bearer token can be refused into `invalid_token`.
    pub fn bearer(err: ServiceError) -> Self {
        match err {
            ServiceError::Revoked
            | ServiceError::Expired
            | ServiceError::InvalidToken
            | ServiceError::InactiveAccount
            | ServiceError::NotFound(_) => OAuthError(ServiceError::InvalidToken),
            other => OAuthError(other),
        }
    }

    fn parts(&self) -> (StatusCode, &'static str, Option<String>) {
        match &self.0 {
            ServiceError::InvalidRequest(msg) => {
                (StatusCode::BAD_REQUEST, "invalid_request", Some(msg.clone()))
            }
            ServiceError::UnsupportedPkceMethod => (
                StatusCode::BAD_REQUEST,
                "invalid_request",
                Some("code_challenge_method must be S256".into()),
            ),
            ServiceError::InvalidClient => (
                StatusCode::UNAUTHORIZED,
                "invalid_client",
                Some("Client authentication failed".into()),
            ),
            ServiceError::InvalidGrant(reason) => {
                (StatusCode::BAD_REQUEST, "invalid_grant", Some(reason.clone()))
            }
            ServiceError::Revoked => (
                StatusCode::BAD_REQUEST,
                "invalid_grant",
                Some("grant has been revoked".into()),
            ),
            ServiceError::Expired => (
                StatusCode::BAD_REQUEST,
                "invalid_grant",
                Some("grant has expired".into()),
            ),
            ServiceError::InvalidCredentials | ServiceError::InactiveAccount => (
                StatusCode::BAD_REQUEST,
                "invalid_grant",
                Some("resource owner cannot be authenticated".into()),
            ),
            ServiceError::UnsupportedGrantType => (
                StatusCode::BAD_REQUEST,
                "unsupported_grant_type",
                Some("grant_type is not supported".into()),
            ),
            ServiceError::UnauthorizedClient => (
                StatusCode::BAD_REQUEST,
                "unauthorized_client",
                Some("client is not registered for this grant type".into()),
            ),
            ServiceError::InvalidScope => (
                StatusCode::BAD_REQUEST,
                "invalid_scope",
                Some("requested scope is not allowed".into()),
            ),
            ServiceError::InvalidToken => (
                StatusCode::UNAUTHORIZED,
                "invalid_token",
                Some("access token is invalid".into()),
            ),
            ServiceError::NotFound(what) => (
                StatusCode::BAD_REQUEST,
                "invalid_request",
                Some(format!("{} not found", what.to_lowercase())),
            ),
            ServiceError::Conflict(msg) => {
                (StatusCode::BAD_REQUEST, "invalid_request", Some(msg.clone()))
            }
            ServiceError::Database(_) | ServiceError::Cache(_) | ServiceError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "server_error", None)
            }
        }
    }
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        if self.0.is_server_error() {
            tracing::error!(error = ?self.0, "OAuth request failed");
        }

        let (status, code, description) = self.parts();
        let mut res = (
            status,
            Json(OAuthErrorResponse {
                error: code.to_string(),
                error_description: description,
            }),
        )
            .into_response();

        let headers = res.headers_mut();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        match code {
            "invalid_client" => {
                headers.insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static("Basic realm=\"orbit-auth\""),
                );
            }
            "invalid_token" => {
                headers.insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static("Bearer error=\"invalid_token\""),
                );
            }
            _ => {}
        }
        res
    }
}

/// Basic credentials win; form credentials are used only when no header was sent.
/// Presenting a secret both ways is rejected.
fn client_credentials(
    basic: Option<TypedHeader<Authorization<Basic>>>,
    form_client_id: Option<String>,
    form_client_secret: Option<String>,
) -> Result<ClientCredentials, ServiceError> {
    if let Some(TypedHeader(Authorization(basic))) = basic {
        if form_client_secret.is_some() {
            return Err(ServiceError::InvalidRequest(
                "use only one client authentication method".into(),
            ));
        }
        if form_client_id.is_some_and(|id| id != basic.username()) {
            return Err(ServiceError::InvalidRequest(
                "client_id does not match the authorization header".into(),
            ));
        }
        return Ok(ClientCredentials {
            client_id: basic.username().to_string(),
            client_secret: Some(basic.password().to_string()).filter(|s| !s.is_empty()),
            source: CredentialSource::Basic,
        });
    }

    match form_client_id.filter(|id| !id.is_empty()) {
        Some(client_id) => Ok(ClientCredentials {
            client_id,
            client_secret: form_client_secret.filter(|s| !s.is_empty()),
            source: CredentialSource::Form,
        }),
        None => Err(ServiceError::InvalidClient),
    }
}

async fn authenticate_client(
    state: &AppState,
    orbit_id: uuid::Uuid,
    credentials: ClientCredentials,
    allow_public: bool,
) -> Result<Client, ServiceError> {
    state
        .engines
        .clients
        .authenticate(orbit_id, credentials, allow_public)
        .await
}

fn no_store<T: IntoResponse>(body: T) -> Response {
    (
        [
            (header::CACHE_CONTROL, "no-store"),
            (header::PRAGMA, "no-cache"),
        ],
        body,
    )
        .into_response()
}

/// Start an authorization-code flow for the signed-in user
#[utoipa::path(
    get,
    path = "/oauth/authorize",
    params(AuthorizeQuery),
    responses(
        (status = 302, description = "Redirect to the client with code and state"),
        (status = 400, description = "Invalid request, scope or PKCE parameters", body = OAuthErrorResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ErrorResponse)
    ),
    tag = "OAuth",
    security(("bearer_auth" = []))
)]
pub async fn authorize(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    query: Result<Query<AuthorizeQuery>, QueryRejection>,
) -> Result<Response, OAuthError> {
    let Query(query) =
        query.map_err(|e| ServiceError::InvalidRequest(e.body_text()))?;

    let user_id = claims.user_id().ok_or_else(|| {
        ServiceError::InvalidRequest("authorization requires an end-user token".into())
    })?;

    let client = state
        .engines
        .clients
        .find(claims.orbit_id, &query.client_id)
        .await?
        .ok_or(ServiceError::InvalidClient)?;

    let code = state
        .engines
        .oauth
        .authorize(
            &client,
            user_id,
            AuthorizationRequest {
                response_type: query.response_type,
                client_id: query.client_id,
                redirect_uri: query.redirect_uri,
                scopes: parse_scopes(query.scope.as_deref()),
                code_challenge: query.code_challenge,
                code_challenge_method: query.code_challenge_method,
            },
        )
        .await?;

    let mut location = Url::parse(&code.redirect_uri)
        .map_err(|e| ServiceError::Internal(anyhow::anyhow!("stored redirect_uri: {}", e)))?;
    {
        let mut pairs = location.query_pairs_mut();
        pairs.append_pair("code", &code.code);
        if let Some(state_param) = query.state.as_deref() {
            pairs.append_pair("state", state_param);
        }
    }

    Ok((
        StatusCode::FOUND,
        [
            (header::LOCATION, location.to_string()),
            (header::CACHE_CONTROL, "no-store".to_string()),
        ],
    )
        .into_response())
}

/// Exchange a grant for tokens
#[utoipa::path(
    post,
    path = "/oauth/token",
    request_body(content = TokenRequest, content_type = "application/x-www-form-urlencoded"),
    params(("x-orbit-id" = String, Header, description = "Orbit of the client")),
    responses(
        (status = 200, description = "Tokens issued", body = TokenResponse),
        (status = 400, description = "OAuth2 error", body = OAuthErrorResponse),
        (status = 401, description = "Client authentication failed", body = OAuthErrorResponse),
        (status = 429, description = "Too many requests", body = ErrorResponse),
        (status = 500, description = "Server error", body = OAuthErrorResponse)
    ),
    tag = "OAuth"
)]
pub async fn token(
    State(state): State<AppState>,
    OrbitId(orbit_id): OrbitId,
    basic: Option<TypedHeader<Authorization<Basic>>>,
    form: Result<Form<TokenRequest>, FormRejection>,
) -> Result<Response, OAuthError> {
    let Form(req) = form.map_err(|e| ServiceError::InvalidRequest(e.body_text()))?;
    let grant_label = req.grant_type.clone().unwrap_or_else(|| "none".to_string());

    let client = match client_credentials(basic, req.client_id, req.client_secret) {
        Ok(credentials) => authenticate_client(&state, orbit_id, credentials, true).await,
        Err(e) => Err(e),
    };
    let client = client.map_err(|e| {
        metrics::record_grant_failure(&grant_label, e.label());
        e
    })?;

    let tokens: TokenResponse = state
        .engines
        .oauth
        .token(
            &client,
            GrantRequest {
                grant_type: req.grant_type,
                code: req.code,
                redirect_uri: req.redirect_uri,
                code_verifier: req.code_verifier,
                refresh_token: req.refresh_token,
                scope: req.scope,
            },
        )
        .await?;

    Ok(no_store(Json(tokens)))
}

/// Introspect a token issued to the calling client
#[utoipa::path(
    post,
    path = "/oauth/introspect",
    request_body(content = TokenHintRequest, content_type = "application/x-www-form-urlencoded"),
    params(("x-orbit-id" = String, Header, description = "Orbit of the client")),
    responses(
        (status = 200, description = "Token state; inactive tokens report only active=false", body = IntrospectionResponse),
        (status = 401, description = "Client authentication failed", body = OAuthErrorResponse)
    ),
    tag = "OAuth"
)]
pub async fn introspect(
    State(state): State<AppState>,
    OrbitId(orbit_id): OrbitId,
    basic: Option<TypedHeader<Authorization<Basic>>>,
    form: Result<Form<TokenHintRequest>, FormRejection>,
) -> Result<Response, OAuthError> {
    let Form(req) = form.map_err(|e| ServiceError::InvalidRequest(e.body_text()))?;
    let credentials = client_credentials(basic, req.client_id, req.client_secret)?;
    let client = authenticate_client(&state, orbit_id, credentials, false).await?;

    let token = req
        .token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ServiceError::InvalidRequest("token is required".into()))?;

    let response: IntrospectionResponse = state
        .engines
        .revocation
        .introspect_token(&client, &token)
        .await?;

    Ok(no_store(Json(response)))
}

/// Revoke a token issued to the calling client
#[utoipa::path(
    post,
    path = "/oauth/revoke",
    request_body(content = TokenHintRequest, content_type = "application/x-www-form-urlencoded"),
    params(("x-orbit-id" = String, Header, description = "Orbit of the client")),
    responses(
        (status = 200, description = "Revoked, or the token was unknown"),
        (status = 401, description = "Client authentication failed", body = OAuthErrorResponse)
    ),
    tag = "OAuth"
)]
pub async fn revoke(
    State(state): State<AppState>,
    OrbitId(orbit_id): OrbitId,
    basic: Option<TypedHeader<Authorization<Basic>>>,
    form: Result<Form<TokenHintRequest>, FormRejection>,
) -> Result<Response, OAuthError> {
    let Form(req) = form.map_err(|e| ServiceError::InvalidRequest(e.body_text()))?;
    let credentials = client_credentials(basic, req.client_id, req.client_secret)?;
    let client = authenticate_client(&state, orbit_id, credentials, false).await?;

    let token = req
        .token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ServiceError::InvalidRequest("token is required".into()))?;

    state
        .engines
        .revocation
        .revoke_token(&client, &token)
        .await?;

    Ok(StatusCode::OK.into_response())
}

/// Claims about the user behind a bearer token
#[utoipa::path(
    get,
    path = "/oauth/userinfo",
    responses(
        (status = 200, description = "User claims", body = UserInfoResponse),
        (status = 401, description = "Invalid bearer token", body = OAuthErrorResponse)
    ),
    tag = "OAuth",
    security(("bearer_auth" = []))
)]
pub async fn userinfo(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<UserInfoResponse>, OAuthError> {
    let token = bearer_token(&headers).ok_or(OAuthError(ServiceError::InvalidToken))?;

    let claims = state
        .engines
        .auth
        .validate_token(token, None)
        .await
        .map_err(OAuthError::bearer)?;
    let user = state
        .engines
        .auth
        .userinfo(&claims)
        .await
        .map_err(OAuthError::bearer)?;

    Ok(Json(UserInfoResponse {
        sub: user.id.to_string(),
        email: user.email,
        email_verified: user.email_verified,
        preferred_username: user.username,
        orbit_id: user.orbit_id,
    }))
}
