//! The cache is an optimization only: a backend that fails every call must
//! not change any outcome.

mod common;

use common::{basic_auth, FailingCache, TestApp, VERIFIER};
use serde_json::json;
use service_core::axum::http::StatusCode;
use std::sync::Arc;

async fn failing_app() -> TestApp {
    TestApp::with_cache(Arc::new(FailingCache)).await
}

#[tokio::test]
async fn code_flow_works_without_cache() {
    let app = failing_app().await;
    app.register_user("ada", "ada@example.com").await;
    let client = app.confidential_client().await;
    let bearer = app.user_token("ada@example.com", &client.client_id).await;
    let code = app.issue_code(&bearer, &client.client_id).await;

    let res = app.exchange_code(&client, &code, VERIFIER).await;
    assert_eq!(res.status, StatusCode::OK, "{}", res.body);
    let access = res.body["access_token"].as_str().unwrap().to_string();
    let refresh = res.body["refresh_token"].as_str().unwrap().to_string();

    let again = app.exchange_code(&client, &code, VERIFIER).await;
    assert_eq!(again.body["error"], "invalid_grant");

    let auth = basic_auth(&client.client_id, client.client_secret.as_deref().unwrap());
    let rotated = app
        .oauth_form(
            "/oauth/token",
            Some(&auth),
            &[("grant_type", "refresh_token"), ("refresh_token", &refresh)],
        )
        .await;
    assert_eq!(rotated.status, StatusCode::OK, "{}", rotated.body);

    let replay = app
        .oauth_form(
            "/oauth/token",
            Some(&auth),
            &[("grant_type", "refresh_token"), ("refresh_token", &refresh)],
        )
        .await;
    assert_eq!(replay.body["error"], "invalid_grant");

    assert_eq!(app.introspect(&client, &access).await.body["active"], true);
}

#[tokio::test]
async fn revocation_holds_without_cache() {
    let app = failing_app().await;
    app.register_user("ada", "ada@example.com").await;
    let client = app.confidential_client().await;
    let bearer = app.user_token("ada@example.com", &client.client_id).await;

    assert_eq!(app.get_with_bearer("/oauth/userinfo", &bearer).await.status, StatusCode::OK);
    assert_eq!(app.introspect(&client, &bearer).await.body["active"], true);

    assert_eq!(app.revoke(&client, &bearer).await.status, StatusCode::OK);

    assert_eq!(app.introspect(&client, &bearer).await.body, json!({ "active": false }));
    assert_eq!(
        app.get_with_bearer("/oauth/userinfo", &bearer).await.status,
        StatusCode::UNAUTHORIZED
    );
}

#[tokio::test]
async fn client_auth_is_unchanged_without_cache() {
    let app = failing_app().await;
    let client = app.confidential_client().await;

    let ok = app
        .oauth_form(
            "/oauth/token",
            Some(&basic_auth(&client.client_id, client.client_secret.as_deref().unwrap())),
            &[("grant_type", "client_credentials")],
        )
        .await;
    assert_eq!(ok.status, StatusCode::OK);

    let bad = app
        .oauth_form(
            "/oauth/token",
            Some(&basic_auth(&client.client_id, "wrong")),
            &[("grant_type", "client_credentials")],
        )
        .await;
    assert_eq!(bad.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn health_reports_degraded_cache() {
    let app = failing_app().await;
    let res = app
        .send(
            service_core::axum::http::Request::builder()
                .uri("/health")
                .body(service_core::axum::body::Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["status"], "degraded");
    assert_eq!(res.body["checks"]["store"], "up");
    assert_eq!(res.body["checks"]["cache"], "down");
}
