mod common;

use common::{redirect_param, TestApp, CHALLENGE, REDIRECT, VERIFIER};
use orbit_auth::utils::pkce;
use service_core::axum::http::{header, StatusCode};

#[test]
fn verifier_fixture_hashes_to_challenge() {
    assert_eq!(pkce::s256_challenge(VERIFIER), CHALLENGE);
}

#[tokio::test]
async fn code_flow_issues_tokens_once() {
    let app = TestApp::new().await;
    app.register_user("ada", "ada@example.com").await;
    let client = app.confidential_client().await;
    let bearer = app.user_token("ada@example.com", &client.client_id).await;

    let code = app.issue_code(&bearer, &client.client_id).await;

    let res = app.exchange_code(&client, &code, VERIFIER).await;
    assert_eq!(res.status, StatusCode::OK, "{}", res.body);
    assert_eq!(res.body["token_type"], "Bearer");
    assert_eq!(res.body["expires_in"], 900);
    assert_eq!(res.body["scope"], "read profile");
    assert!(res.body["refresh_token"].is_string());
    assert_eq!(res.headers.get(header::CACHE_CONTROL).unwrap(), "no-store");

    let access = res.body["access_token"].as_str().unwrap();
    let info = app.introspect(&client, access).await;
    assert_eq!(info.body["active"], true);
    assert_eq!(info.body["client_id"], client.client_id.as_str());

    let again = app.exchange_code(&client, &code, VERIFIER).await;
    assert_eq!(again.status, StatusCode::BAD_REQUEST);
    assert_eq!(again.body["error"], "invalid_grant");
}

#[tokio::test]
async fn redirect_carries_state() {
    let app = TestApp::new().await;
    app.register_user("ada", "ada@example.com").await;
    let client = app.confidential_client().await;
    let bearer = app.user_token("ada@example.com", &client.client_id).await;

    let res = app
        .authorize(
            &bearer,
            &[
                ("response_type", "code"),
                ("client_id", &client.client_id),
                ("redirect_uri", REDIRECT),
                ("scope", "read"),
                ("state", "af0ifjsldkj"),
                ("code_challenge", CHALLENGE),
                ("code_challenge_method", "S256"),
            ],
        )
        .await;

    assert_eq!(res.status, StatusCode::FOUND);
    let location = res.headers.get(header::LOCATION).unwrap().to_str().unwrap();
    assert!(location.starts_with(REDIRECT));
    assert_eq!(redirect_param(&res, "state").as_deref(), Some("af0ifjsldkj"));
}

#[tokio::test]
async fn concurrent_exchanges_have_one_winner() {
    let app = TestApp::new().await;
    app.register_user("ada", "ada@example.com").await;
    let client = app.confidential_client().await;
    let bearer = app.user_token("ada@example.com", &client.client_id).await;
    let code = app.issue_code(&bearer, &client.client_id).await;

    let (a, b) = tokio::join!(
        app.exchange_code(&client, &code, VERIFIER),
        app.exchange_code(&client, &code, VERIFIER)
    );

    let mut statuses = [a.status, b.status];
    statuses.sort();
    assert_eq!(statuses, [StatusCode::OK, StatusCode::BAD_REQUEST]);
    let loser = if a.status == StatusCode::OK { &b } else { &a };
    assert_eq!(loser.body["error"], "invalid_grant");
}

#[tokio::test]
async fn wrong_verifier_is_invalid_grant() {
    let app = TestApp::new().await;
    app.register_user("ada", "ada@example.com").await;
    let client = app.confidential_client().await;
    let bearer = app.user_token("ada@example.com", &client.client_id).await;
    let code = app.issue_code(&bearer, &client.client_id).await;

    let res = app
        .exchange_code(&client, &code, "wrong-verifier-wrong-verifier-wrong-verifier-x")
        .await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(res.body["error"], "invalid_grant");
}

#[tokio::test]
async fn plain_pkce_is_rejected() {
    let app = TestApp::new().await;
    app.register_user("ada", "ada@example.com").await;
    let client = app.public_client().await;
    let bearer = app.user_token("ada@example.com", &client.client_id).await;

    let res = app
        .authorize(
            &bearer,
            &[
                ("response_type", "code"),
                ("client_id", &client.client_id),
                ("redirect_uri", REDIRECT),
                ("code_challenge", VERIFIER),
                ("code_challenge_method", "plain"),
            ],
        )
        .await;

    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(res.body["error"], "invalid_request");
    assert!(res.headers.get(header::LOCATION).is_none());
}

#[tokio::test]
async fn public_client_needs_pkce() {
    let app = TestApp::new().await;
    app.register_user("ada", "ada@example.com").await;
    let client = app.public_client().await;
    let bearer = app.user_token("ada@example.com", &client.client_id).await;

    let res = app
        .authorize(
            &bearer,
            &[
                ("response_type", "code"),
                ("client_id", &client.client_id),
                ("redirect_uri", REDIRECT),
            ],
        )
        .await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(res.body["error"], "invalid_request");

    let code = app.issue_code(&bearer, &client.client_id).await;
    let res = app
        .oauth_form(
            "/oauth/token",
            None,
            &[
                ("grant_type", "authorization_code"),
                ("client_id", &client.client_id),
                ("code", &code),
                ("redirect_uri", REDIRECT),
                ("code_verifier", VERIFIER),
            ],
        )
        .await;
    assert_eq!(res.status, StatusCode::OK, "{}", res.body);
}

#[tokio::test]
async fn redirect_mismatch_is_not_redirected() {
    let app = TestApp::new().await;
    app.register_user("ada", "ada@example.com").await;
    let client = app.confidential_client().await;
    let bearer = app.user_token("ada@example.com", &client.client_id).await;

    let res = app
        .authorize(
            &bearer,
            &[
                ("response_type", "code"),
                ("client_id", &client.client_id),
                ("redirect_uri", "https://evil.example.com/callback"),
                ("code_challenge", CHALLENGE),
                ("code_challenge_method", "S256"),
            ],
        )
        .await;

    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert!(res.headers.get(header::LOCATION).is_none());
}

#[tokio::test]
async fn authorize_requires_a_bearer() {
    let app = TestApp::new().await;
    let res = app.authorize("not-a-jwt", &[("client_id", "x")]).await;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn redirect_uri_must_match_at_exchange() {
    let app = TestApp::new().await;
    app.register_user("ada", "ada@example.com").await;
    let client = app.confidential_client().await;
    let bearer = app.user_token("ada@example.com", &client.client_id).await;
    let code = app.issue_code(&bearer, &client.client_id).await;

    let auth = common::basic_auth(&client.client_id, client.client_secret.as_deref().unwrap());
    let res = app
        .oauth_form(
            "/oauth/token",
            Some(&auth),
            &[
                ("grant_type", "authorization_code"),
                ("code", &code),
                ("redirect_uri", "https://app.example.com/other"),
                ("code_verifier", VERIFIER),
            ],
        )
        .await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(res.body["error"], "invalid_grant");
}
