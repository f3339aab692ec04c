//! Shared setup for the HTTP integration tests: an `AppState` on the
//! in-memory store, a pluggable cache backend and the fixture RSA key.

#![allow(dead_code)]

use base64::{engine::general_purpose::STANDARD, Engine as _};
use http_body_util::BodyExt;
use orbit_auth::{
    build_router,
    config::{
        CacheBackendKind, CacheConfig, DatabaseConfig, Environment, JwtConfig, OrbitConfig,
        RateLimitConfig, SecurityConfig, StoreBackend, StoreConfig, TokenLifetimeConfig,
    },
    services::{Cache, CacheBackend, InMemoryCache, MemoryStore, Store, TokenSigner},
    AppState,
};
use serde_json::{json, Value};
use service_core::axum::{
    body::Body,
    http::{header, HeaderMap, Method, Request, StatusCode},
    Router,
};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tower::ServiceExt;
use url::Url;
use uuid::Uuid;

pub const PRIVATE_KEY: &str = include_str!("../fixtures/signing_key.pem");
pub const PUBLIC_KEY: &str = include_str!("../fixtures/signing_key.pub.pem");
pub const ISSUER: &str = "https://auth.test";
pub const REDIRECT: &str = "https://app.example.com/callback";
pub const PASSWORD: &str = "correct-horse-battery";

/// RFC 7636 appendix B.
pub const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
pub const CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct RegisteredClient {
    pub client_id: String,
    pub client_secret: Option<String>,
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub orbit_id: Uuid,
    _key_files: (NamedTempFile, NamedTempFile),
}

fn write_key(pem: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp key file");
    file.write_all(pem.as_bytes()).expect("write key");
    file
}

pub fn test_config(private_key: &NamedTempFile, public_key: &NamedTempFile) -> OrbitConfig {
    OrbitConfig {
        common: service_core::config::Config {
            host: "127.0.0.1".into(),
            port: 8080,
        },
        environment: Environment::Dev,
        service_name: "orbit-auth-test".into(),
        service_version: "0.0.0".into(),
        log_level: "debug".into(),
        otlp_endpoint: None,
        store: StoreConfig {
            backend: StoreBackend::Memory,
        },
        database: DatabaseConfig {
            url: "postgres://unused".into(),
            max_connections: 1,
            min_connections: 1,
        },
        cache: CacheConfig {
            backend: CacheBackendKind::Memory,
            redis_url: "redis://unused".into(),
        },
        jwt: JwtConfig {
            issuer: ISSUER.into(),
            key_id: "test-key".into(),
            private_key_path: private_key.path().to_string_lossy().into_owned(),
            public_key_path: public_key.path().to_string_lossy().into_owned(),
            previous_keys: vec![],
        },
        tokens: TokenLifetimeConfig {
            session_ttl_days: 30,
            refresh_token_ttl_days: 30,
            auth_code_ttl_seconds: 300,
        },
        security: SecurityConfig {
            allowed_origins: vec!["http://localhost:3000".into()],
            request_timeout_seconds: 30,
        },
        rate_limit: RateLimitConfig {
            login_attempts: 5,
            login_window_seconds: 900,
            token_attempts: 100,
            token_window_seconds: 60,
        },
    }
}

/// Authorization header value for HTTP Basic client authentication.
pub fn basic_auth(client_id: &str, secret: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", client_id, secret)))
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_cache(Arc::new(InMemoryCache::new())).await
    }

    /// A fresh app with one orbit already created.
    pub async fn with_cache(cache_backend: Arc<dyn CacheBackend>) -> Self {
        let private_key = write_key(PRIVATE_KEY);
        let public_key = write_key(PUBLIC_KEY);
        let config = test_config(&private_key, &public_key);

        let signer = TokenSigner::from_config(&config.jwt).expect("signer");
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store
            .upsert_signing_key(&signer.signing_key_record().expect("jwk"))
            .await
            .expect("signing key");

        let state = AppState::new(config, store, Cache::new(cache_backend), Arc::new(signer))
            .expect("state");
        let router = build_router(state.clone());

        let mut app = Self {
            router,
            state,
            orbit_id: Uuid::nil(),
            _key_files: (private_key, public_key),
        };

        let res = app
            .send(json_request(
                Method::POST,
                "/orbits",
                None,
                json!({ "name": format!("orbit-{}", Uuid::new_v4()) }),
            ))
            .await;
        assert_eq!(res.status, StatusCode::CREATED, "{}", res.body);
        app.orbit_id = res.body["orbit_id"].as_str().unwrap().parse().unwrap();
        app
    }

    pub async fn send(&self, req: Request<Body>) -> Response {
        let res = self.router.clone().oneshot(req).await.expect("infallible router");
        let status = res.status();
        let headers = res.headers().clone();
        let raw = res.into_body().collect().await.unwrap().to_bytes().to_vec();
        let body = serde_json::from_slice(&raw).unwrap_or(Value::Null);
        Response {
            status,
            headers,
            body,
            raw,
        }
    }

    pub fn orbit_header(&self) -> String {
        self.orbit_id.to_string()
    }

    pub async fn register_user(&self, username: &str, email: &str) -> Uuid {
        let res = self
            .send(json_request(
                Method::POST,
                "/users",
                Some(self.orbit_id),
                json!({ "username": username, "email": email, "password": PASSWORD }),
            ))
            .await;
        assert_eq!(res.status, StatusCode::CREATED, "{}", res.body);
        res.body["user_id"].as_str().unwrap().parse().unwrap()
    }

    pub async fn register_client(&self, body: Value) -> RegisteredClient {
        let res = self
            .send(json_request(Method::POST, "/clients", Some(self.orbit_id), body))
            .await;
        assert_eq!(res.status, StatusCode::CREATED, "{}", res.body);
        RegisteredClient {
            client_id: res.body["client_id"].as_str().unwrap().to_string(),
            client_secret: res.body["client_secret"].as_str().map(str::to_string),
        }
    }

    /// Confidential client allowed every grant, scopes `read profile`.
    pub async fn confidential_client(&self) -> RegisteredClient {
        self.register_client(json!({
            "name": "dashboard",
            "redirect_uris": [REDIRECT],
            "grant_types": ["authorization_code", "refresh_token", "client_credentials"],
            "allowed_scopes": ["read", "profile"],
        }))
        .await
    }

    pub async fn public_client(&self) -> RegisteredClient {
        self.register_client(json!({
            "name": "spa",
            "redirect_uris": [REDIRECT],
            "token_endpoint_auth_method": "none",
            "allowed_scopes": ["read", "profile"],
        }))
        .await
    }

    pub async fn login(&self, email: &str, client_id: &str) -> Response {
        self.send(json_request(
            Method::POST,
            "/auth/login",
            Some(self.orbit_id),
            json!({ "email": email, "password": PASSWORD, "client_id": client_id, "scope": "read profile" }),
        ))
        .await
    }

    /// Logs in and returns the access token.
    pub async fn user_token(&self, email: &str, client_id: &str) -> String {
        let res = self.login(email, client_id).await;
        assert_eq!(res.status, StatusCode::OK, "{}", res.body);
        res.body["access_token"].as_str().unwrap().to_string()
    }

    /// Runs `/oauth/authorize` and returns the redirect location.
    pub async fn authorize(&self, bearer: &str, params: &[(&str, &str)]) -> Response {
        let query = serde_urlencoded::to_string(params).unwrap();
        let req = Request::builder()
            .method(Method::GET)
            .uri(format!("/oauth/authorize?{}", query))
            .header(header::AUTHORIZATION, format!("Bearer {}", bearer))
            .body(Body::empty())
            .unwrap();
        self.send(req).await
    }

    /// Authorizes with S256 PKCE and returns the code from the redirect.
    pub async fn issue_code(&self, bearer: &str, client_id: &str) -> String {
        let res = self
            .authorize(
                bearer,
                &[
                    ("response_type", "code"),
                    ("client_id", client_id),
                    ("redirect_uri", REDIRECT),
                    ("scope", "read profile"),
                    ("state", "xyz"),
                    ("code_challenge", CHALLENGE),
                    ("code_challenge_method", "S256"),
                ],
            )
            .await;
        assert_eq!(res.status, StatusCode::FOUND, "{}", res.body);
        redirect_param(&res, "code").expect("code in redirect")
    }

    /// POSTs a form to one of the client-authenticated OAuth endpoints.
    pub async fn oauth_form(
        &self,
        path: &str,
        authorization: Option<&str>,
        form: &[(&str, &str)],
    ) -> Response {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header("x-orbit-id", self.orbit_header())
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
        if let Some(value) = authorization {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        let body = serde_urlencoded::to_string(form).unwrap();
        self.send(builder.body(Body::from(body)).unwrap()).await
    }

    pub async fn exchange_code(&self, client: &RegisteredClient, code: &str, verifier: &str) -> Response {
        let auth = basic_auth(&client.client_id, client.client_secret.as_deref().unwrap_or(""));
        self.oauth_form(
            "/oauth/token",
            Some(&auth),
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", REDIRECT),
                ("code_verifier", verifier),
            ],
        )
        .await
    }

    pub async fn introspect(&self, client: &RegisteredClient, token: &str) -> Response {
        let auth = basic_auth(&client.client_id, client.client_secret.as_deref().unwrap_or(""));
        self.oauth_form("/oauth/introspect", Some(&auth), &[("token", token)])
            .await
    }

    pub async fn revoke(&self, client: &RegisteredClient, token: &str) -> Response {
        let auth = basic_auth(&client.client_id, client.client_secret.as_deref().unwrap_or(""));
        self.oauth_form("/oauth/revoke", Some(&auth), &[("token", token)])
            .await
    }

    pub async fn get_with_bearer(&self, path: &str, bearer: &str) -> Response {
        let req = Request::builder()
            .method(Method::GET)
            .uri(path)
            .header(header::AUTHORIZATION, format!("Bearer {}", bearer))
            .body(Body::empty())
            .unwrap();
        self.send(req).await
    }
}

pub fn json_request(method: Method, uri: &str, orbit: Option<Uuid>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(orbit) = orbit {
        builder = builder.header("x-orbit-id", orbit.to_string());
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub fn redirect_param(res: &Response, name: &str) -> Option<String> {
    let location = res.headers.get(header::LOCATION)?.to_str().ok()?;
    let url = Url::parse(location).ok()?;
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

/// A cache whose every call fails, as if the cache server were unreachable.
pub struct FailingCache;

#[async_trait::async_trait]
impl CacheBackend for FailingCache {
    async fn get(&self, _key: &str) -> Result<Option<String>, anyhow::Error> {
        Err(anyhow::anyhow!("cache down"))
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), anyhow::Error> {
        Err(anyhow::anyhow!("cache down"))
    }

    async fn delete(&self, _key: &str) -> Result<(), anyhow::Error> {
        Err(anyhow::anyhow!("cache down"))
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        Err(anyhow::anyhow!("cache down"))
    }
}
