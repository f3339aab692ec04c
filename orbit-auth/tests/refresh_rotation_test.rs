mod common;

use common::{basic_auth, RegisteredClient, TestApp, VERIFIER};
use service_core::axum::http::StatusCode;

async fn rotate(app: &TestApp, client: &RegisteredClient, refresh_token: &str) -> common::Response {
    let auth = basic_auth(&client.client_id, client.client_secret.as_deref().unwrap());
    app.oauth_form(
        "/oauth/token",
        Some(&auth),
        &[("grant_type", "refresh_token"), ("refresh_token", refresh_token)],
    )
    .await
}

async fn first_pair(app: &TestApp, client: &RegisteredClient) -> (String, String) {
    app.register_user("ada", "ada@example.com").await;
    let bearer = app.user_token("ada@example.com", &client.client_id).await;
    let code = app.issue_code(&bearer, &client.client_id).await;
    let res = app.exchange_code(client, &code, VERIFIER).await;
    assert_eq!(res.status, StatusCode::OK, "{}", res.body);
    (
        res.body["access_token"].as_str().unwrap().to_string(),
        res.body["refresh_token"].as_str().unwrap().to_string(),
    )
}

#[tokio::test]
async fn rotation_replaces_the_refresh_token() {
    let app = TestApp::new().await;
    let client = app.confidential_client().await;
    let (_, r1) = first_pair(&app, &client).await;

    let res = rotate(&app, &client, &r1).await;
    assert_eq!(res.status, StatusCode::OK, "{}", res.body);
    let r2 = res.body["refresh_token"].as_str().unwrap();
    assert_ne!(r1, r2);

    let res = rotate(&app, &client, r2).await;
    assert_eq!(res.status, StatusCode::OK, "{}", res.body);
}

#[tokio::test]
async fn reuse_revokes_the_whole_chain() {
    let app = TestApp::new().await;
    let client = app.confidential_client().await;
    let (_, r1) = first_pair(&app, &client).await;

    let res = rotate(&app, &client, &r1).await;
    assert_eq!(res.status, StatusCode::OK);
    let r2 = res.body["refresh_token"].as_str().unwrap().to_string();
    let a2 = res.body["access_token"].as_str().unwrap().to_string();

    let replay = rotate(&app, &client, &r1).await;
    assert_eq!(replay.status, StatusCode::BAD_REQUEST);
    assert_eq!(replay.body["error"], "invalid_grant");

    let descendant = rotate(&app, &client, &r2).await;
    assert_eq!(descendant.status, StatusCode::BAD_REQUEST);
    assert_eq!(descendant.body["error"], "invalid_grant");

    let info = app.introspect(&client, &a2).await;
    assert_eq!(info.body, serde_json::json!({ "active": false }));
}

#[tokio::test]
async fn refresh_may_narrow_but_not_widen_scope() {
    let app = TestApp::new().await;
    let client = app.confidential_client().await;
    let (_, r1) = first_pair(&app, &client).await;
    let auth = basic_auth(&client.client_id, client.client_secret.as_deref().unwrap());

    let wider = app
        .oauth_form(
            "/oauth/token",
            Some(&auth),
            &[("grant_type", "refresh_token"), ("refresh_token", &r1), ("scope", "read admin")],
        )
        .await;
    assert_eq!(wider.status, StatusCode::BAD_REQUEST);
    assert_eq!(wider.body["error"], "invalid_scope");

    let narrower = app
        .oauth_form(
            "/oauth/token",
            Some(&auth),
            &[("grant_type", "refresh_token"), ("refresh_token", &r1), ("scope", "read")],
        )
        .await;
    assert_eq!(narrower.status, StatusCode::OK, "{}", narrower.body);
    assert_eq!(narrower.body["scope"], "read");
}

#[tokio::test]
async fn refresh_token_is_bound_to_its_client() {
    let app = TestApp::new().await;
    let client = app.confidential_client().await;
    let other = app.confidential_client().await;
    let (_, r1) = first_pair(&app, &client).await;

    let res = rotate(&app, &other, &r1).await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(res.body["error"], "invalid_grant");

    let res = rotate(&app, &client, &r1).await;
    assert_eq!(res.status, StatusCode::OK);
}
