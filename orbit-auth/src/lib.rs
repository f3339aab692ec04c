pub mod config;
pub mod db;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;

use service_core::axum::{
    extract::State,
    http::{header, HeaderName, HeaderValue, Method, Request, StatusCode},
    middleware::{from_fn, from_fn_with_state},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use service_core::middleware::{
    create_ip_rate_limiter, ip_rate_limit_middleware, request_id_middleware,
    security_headers_middleware, IpRateLimiter, REQUEST_ID_HEADER,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};

use crate::config::OrbitConfig;
use crate::services::{Cache, Engines, Lifetimes, Store, StoreRoleLookup, TokenSigner};
use service_core::error::AppError;

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check,
        handlers::well_known::jwks,
        handlers::orbit::create_orbit,
        handlers::user::register_user,
        handlers::client::register_client,
        handlers::client::rotate_client_secret,
        handlers::auth::login,
        handlers::auth::refresh,
        handlers::auth::logout,
        handlers::auth::list_sessions,
        handlers::oauth::authorize,
        handlers::oauth::token,
        handlers::oauth::introspect,
        handlers::oauth::revoke,
        handlers::oauth::userinfo,
    ),
    components(
        schemas(
            dtos::ErrorResponse,
            dtos::auth::CreateOrbitRequest,
            dtos::auth::OrbitResponse,
            dtos::auth::RegisterUserRequest,
            dtos::auth::RegisterUserResponse,
            dtos::auth::LoginRequest,
            dtos::auth::LoginResponse,
            dtos::auth::RefreshRequest,
            dtos::auth::AccessTokenResponse,
            dtos::auth::MessageResponse,
            dtos::auth::SessionView,
            dtos::auth::SessionListResponse,
            dtos::auth::UserInfoResponse,
            dtos::client::RegisterClientRequest,
            dtos::client::RegisterClientResponse,
            dtos::client::ClientSecretResponse,
            dtos::client::ClientAuthForm,
            dtos::oauth::TokenRequest,
            dtos::oauth::TokenResponse,
            dtos::oauth::TokenHintRequest,
            dtos::oauth::IntrospectionResponse,
            dtos::oauth::OAuthErrorResponse,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Orbits", description = "Tenant management"),
        (name = "Users", description = "User registration"),
        (name = "Clients", description = "OAuth client registration"),
        (name = "Authentication", description = "First-party sessions"),
        (name = "OAuth", description = "OAuth2 authorization server endpoints"),
        (name = "Well-Known", description = "Public service metadata"),
        (name = "Observability", description = "Service health and monitoring"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
            components.add_security_scheme(
                "client_basic",
                SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Basic).build()),
            );
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<OrbitConfig>,
    pub store: Arc<dyn Store>,
    pub cache: Cache,
    pub signer: Arc<TokenSigner>,
    pub engines: Engines,
    pub login_rate_limiter: IpRateLimiter,
    pub token_rate_limiter: IpRateLimiter,
}

impl AppState {
    /// Wires every engine onto the given store, cache and signer.
    pub fn new(
        config: OrbitConfig,
        store: Arc<dyn Store>,
        cache: Cache,
        signer: Arc<TokenSigner>,
    ) -> Result<Self, AppError> {
        let roles = Arc::new(StoreRoleLookup::new(store.clone()));
        let engines = Engines::new(
            store.clone(),
            cache.clone(),
            signer.clone(),
            roles,
            Lifetimes::from_config(&config.tokens),
        );

        let login_rate_limiter = create_ip_rate_limiter(
            config.rate_limit.login_attempts,
            config.rate_limit.login_window_seconds,
        )?;
        let token_rate_limiter = create_ip_rate_limiter(
            config.rate_limit.token_attempts,
            config.rate_limit.token_window_seconds,
        )?;

        Ok(Self {
            config: Arc::new(config),
            store,
            cache,
            signer,
            engines,
            login_rate_limiter,
            token_rate_limiter,
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    let login_route = Router::new()
        .route("/auth/login", post(handlers::login))
        .layer(from_fn_with_state(
            state.login_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ));

    let token_route = Router::new()
        .route("/oauth/token", post(handlers::token))
        .layer(from_fn_with_state(
            state.token_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ));

    let bearer_routes = Router::new()
        .route("/auth/logout", post(handlers::logout))
        .route("/auth/sessions", get(handlers::list_sessions))
        .route("/oauth/authorize", get(handlers::authorize))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ));

    let timeout = Duration::from_secs(state.config.security.request_timeout_seconds);

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(handlers::metrics::metrics))
        .route("/oauth/jwks", get(handlers::well_known::jwks))
        .route("/.well-known/jwks.json", get(handlers::well_known::jwks))
        .route(
            "/.well-known/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        )
        .route("/orbits", post(handlers::create_orbit))
        .route("/users", post(handlers::register_user))
        .route("/clients", post(handlers::register_client))
        .route(
            "/clients/:client_id/secret",
            post(handlers::rotate_client_secret),
        )
        .route("/auth/refresh", post(handlers::refresh))
        .route("/oauth/introspect", post(handlers::introspect))
        .route("/oauth/revoke", post(handlers::revoke))
        .route("/oauth/userinfo", get(handlers::userinfo))
        .merge(login_route)
        .merge(token_route)
        .merge(bearer_routes)
        .with_state(state.clone())
        .layer(from_fn(middleware::metrics_middleware))
        .layer(TimeoutLayer::new(timeout))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri().path(),
                    version = ?request.version(),
                )
            }),
        )
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(cors_layer(&state.config.security.allowed_origins))
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!("Ignoring invalid CORS origin '{}': {}", o, e);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("x-orbit-id"),
            HeaderName::from_static(REQUEST_ID_HEADER),
        ])
}

/// Service health check
///
/// The store is required; a failing cache only degrades the service because
/// every read has a store fallback.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy or degraded"),
        (status = 503, description = "Store is unreachable")
    ),
    tag = "Observability"
)]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_up = match state.store.health_check().await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(error = %e, "Store health check failed");
            false
        }
    };
    let cache_up = match state.cache.health_check().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "Cache health check failed");
            false
        }
    };

    let (status, label) = match (store_up, cache_up) {
        (true, true) => (StatusCode::OK, "healthy"),
        (true, false) => (StatusCode::OK, "degraded"),
        (false, _) => (StatusCode::SERVICE_UNAVAILABLE, "unhealthy"),
    };
    let up = |ok: bool| if ok { "up" } else { "down" };

    (
        status,
        Json(serde_json::json!({
            "status": label,
            "service": state.config.service_name,
            "version": state.config.service_version,
            "environment": format!("{:?}", state.config.environment),
            "checks": {
                "store": up(store_up),
                "cache": up(cache_up),
            }
        })),
    )
}
