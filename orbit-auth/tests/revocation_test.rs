mod common;

use common::{TestApp, VERIFIER};
use serde_json::json;
use service_core::axum::http::StatusCode;

#[tokio::test]
async fn introspection_sees_revocation_immediately() {
    let app = TestApp::new().await;
    app.register_user("ada", "ada@example.com").await;
    let client = app.confidential_client().await;
    let bearer = app.user_token("ada@example.com", &client.client_id).await;
    let code = app.issue_code(&bearer, &client.client_id).await;
    let tokens = app.exchange_code(&client, &code, VERIFIER).await;
    let access = tokens.body["access_token"].as_str().unwrap();

    // Prime the introspection cache.
    let before = app.introspect(&client, access).await;
    assert_eq!(before.body["active"], true);

    let res = app.revoke(&client, access).await;
    assert_eq!(res.status, StatusCode::OK);

    let after = app.introspect(&client, access).await;
    assert_eq!(after.status, StatusCode::OK);
    assert_eq!(after.body, json!({ "active": false }));
}

#[tokio::test]
async fn revoked_bearer_is_refused() {
    let app = TestApp::new().await;
    app.register_user("ada", "ada@example.com").await;
    let client = app.confidential_client().await;
    let bearer = app.user_token("ada@example.com", &client.client_id).await;
    let code = app.issue_code(&bearer, &client.client_id).await;
    let tokens = app.exchange_code(&client, &code, VERIFIER).await;
    let access = tokens.body["access_token"].as_str().unwrap();

    let ok = app.get_with_bearer("/oauth/userinfo", access).await;
    assert_eq!(ok.status, StatusCode::OK);

    app.revoke(&client, access).await;

    let res = app.get_with_bearer("/oauth/userinfo", access).await;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);
    assert_eq!(res.body["error"], "invalid_token");
}

#[tokio::test]
async fn revoking_a_refresh_token_kills_its_access_tokens() {
    let app = TestApp::new().await;
    app.register_user("ada", "ada@example.com").await;
    let client = app.confidential_client().await;
    let bearer = app.user_token("ada@example.com", &client.client_id).await;
    let code = app.issue_code(&bearer, &client.client_id).await;
    let tokens = app.exchange_code(&client, &code, VERIFIER).await;
    let access = tokens.body["access_token"].as_str().unwrap();
    let refresh = tokens.body["refresh_token"].as_str().unwrap();

    assert_eq!(app.revoke(&client, refresh).await.status, StatusCode::OK);

    assert_eq!(app.introspect(&client, refresh).await.body["active"], false);
    assert_eq!(app.introspect(&client, access).await.body["active"], false);
}

#[tokio::test]
async fn unknown_tokens_revoke_with_200() {
    let app = TestApp::new().await;
    let client = app.confidential_client().await;

    for token in ["garbage", "a.b.c", "00000000-0000-0000-0000-000000000000.secret"] {
        let res = app.revoke(&client, token).await;
        assert_eq!(res.status, StatusCode::OK, "{}", token);
        assert_eq!(app.introspect(&client, token).await.body, json!({ "active": false }));
    }
}

#[tokio::test]
async fn clients_only_see_their_own_tokens() {
    let app = TestApp::new().await;
    app.register_user("ada", "ada@example.com").await;
    let client = app.confidential_client().await;
    let other = app.confidential_client().await;
    let bearer = app.user_token("ada@example.com", &client.client_id).await;
    let code = app.issue_code(&bearer, &client.client_id).await;
    let tokens = app.exchange_code(&client, &code, VERIFIER).await;
    let access = tokens.body["access_token"].as_str().unwrap();

    assert_eq!(app.introspect(&other, access).await.body, json!({ "active": false }));

    assert_eq!(app.revoke(&other, access).await.status, StatusCode::OK);
    assert_eq!(app.introspect(&client, access).await.body["active"], true);
}

#[tokio::test]
async fn public_clients_cannot_introspect() {
    let app = TestApp::new().await;
    let client = app.public_client().await;

    let res = app
        .oauth_form(
            "/oauth/introspect",
            None,
            &[("client_id", &client.client_id), ("token", "a.b.c")],
        )
        .await;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);
    assert_eq!(res.body["error"], "invalid_client");
}
