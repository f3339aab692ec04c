mod common;

use common::TestApp;
use service_core::axum::{
    body::Body,
    http::{header, Request, StatusCode},
};

async fn get(app: &TestApp, path: &str) -> common::Response {
    app.send(Request::builder().uri(path).body(Body::empty()).unwrap())
        .await
}

#[tokio::test]
async fn jwks_publishes_the_active_key() {
    let app = TestApp::new().await;

    for path in ["/oauth/jwks", "/.well-known/jwks.json"] {
        let res = get(&app, path).await;
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(
            res.headers.get(header::CACHE_CONTROL).unwrap(),
            "public, max-age=3600"
        );

        let key = &res.body["keys"][0];
        assert_eq!(key["kid"], "test-key");
        assert_eq!(key["kty"], "RSA");
        assert_eq!(key["alg"], "RS256");
        assert_eq!(key["use"], "sig");
        assert!(key["n"].as_str().is_some_and(|n| !n.is_empty()));
        assert_eq!(key["e"], "AQAB");
    }
}

#[tokio::test]
async fn userinfo_returns_subject_claims() {
    let app = TestApp::new().await;
    let user_id = app.register_user("ada", "ada@example.com").await;
    let client = app.confidential_client().await;
    let bearer = app.user_token("ada@example.com", &client.client_id).await;

    let res = app.get_with_bearer("/oauth/userinfo", &bearer).await;
    assert_eq!(res.status, StatusCode::OK, "{}", res.body);
    assert_eq!(res.body["sub"], user_id.to_string());
    assert_eq!(res.body["email"], "ada@example.com");
    assert_eq!(res.body["preferred_username"], "ada");
    assert_eq!(res.body["orbit_id"], app.orbit_id.to_string());

    let res = get(&app, "/oauth/userinfo").await;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);
    assert_eq!(res.body["error"], "invalid_token");
    assert!(res.headers.get(header::WWW_AUTHENTICATE).is_some());
}

#[tokio::test]
async fn health_openapi_and_request_ids() {
    let app = TestApp::new().await;

    let health = get(&app, "/health").await;
    assert_eq!(health.status, StatusCode::OK);
    assert_eq!(health.body["status"], "healthy");
    assert!(health.headers.get("x-request-id").is_some());
    assert_eq!(health.headers.get(header::X_CONTENT_TYPE_OPTIONS).unwrap(), "nosniff");

    let doc = get(&app, "/.well-known/openapi.json").await;
    assert_eq!(doc.status, StatusCode::OK);
    assert!(doc.body["paths"]["/oauth/token"].is_object());
}

#[tokio::test]
async fn unknown_orbit_cannot_register_users() {
    let app = TestApp::new().await;
    let res = app
        .send(common::json_request(
            service_core::axum::http::Method::POST,
            "/users",
            Some(uuid::Uuid::new_v4()),
            serde_json::json!({ "username": "ada", "email": "ada@example.com", "password": common::PASSWORD }),
        ))
        .await;
    assert_eq!(res.status, StatusCode::NOT_FOUND);
}
