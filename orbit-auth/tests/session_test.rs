mod common;

use common::{json_request, TestApp, PASSWORD};
use serde_json::json;
use service_core::axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
};

async fn session_refresh(app: &TestApp, refresh_token: &str, client_id: &str) -> common::Response {
    app.send(json_request(
        Method::POST,
        "/auth/refresh",
        Some(app.orbit_id),
        json!({ "refresh_token": refresh_token, "client_id": client_id }),
    ))
    .await
}

async fn logout(app: &TestApp, bearer: &str) -> common::Response {
    let req = Request::builder()
        .method(Method::POST)
        .uri("/auth/logout")
        .header(header::AUTHORIZATION, format!("Bearer {}", bearer))
        .body(Body::empty())
        .unwrap();
    app.send(req).await
}

async fn login_from(app: &TestApp, client_id: &str, ip: &str) -> common::Response {
    let mut req = json_request(
        Method::POST,
        "/auth/login",
        Some(app.orbit_id),
        json!({ "email": "ada@example.com", "password": "wrong-pass", "client_id": client_id }),
    );
    req.headers_mut()
        .insert("x-forwarded-for", ip.parse().unwrap());
    app.send(req).await
}

#[tokio::test]
async fn login_refresh_logout_lifecycle() {
    let app = TestApp::new().await;
    app.register_user("ada", "ada@example.com").await;
    let client = app.confidential_client().await;

    let login = app.login("ada@example.com", &client.client_id).await;
    assert_eq!(login.status, StatusCode::OK, "{}", login.body);
    assert_eq!(login.body["expires_in"], 900);
    let access = login.body["access_token"].as_str().unwrap().to_string();
    let material = login.body["refresh_token"].as_str().unwrap().to_string();
    let session_id = login.body["session_id"].as_str().unwrap().to_string();
    assert!(material.starts_with(&format!("{}.", session_id)));

    let refreshed = session_refresh(&app, &material, &client.client_id).await;
    assert_eq!(refreshed.status, StatusCode::OK, "{}", refreshed.body);
    let second = refreshed.body["access_token"].as_str().unwrap().to_string();
    assert_ne!(second, access);

    let res = logout(&app, &second).await;
    assert_eq!(res.status, StatusCode::OK, "{}", res.body);

    // Every access token of the session dies with it.
    assert_eq!(app.get_with_bearer("/auth/sessions", &access).await.status, StatusCode::UNAUTHORIZED);
    assert_eq!(app.get_with_bearer("/auth/sessions", &second).await.status, StatusCode::UNAUTHORIZED);

    let after = session_refresh(&app, &material, &client.client_id).await;
    assert_eq!(after.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn wrong_password_and_unknown_email_look_identical() {
    let app = TestApp::new().await;
    let ada = app.register_user("ada", "ada@example.com").await;
    let client = app.confidential_client().await;

    let wrong = app
        .send(json_request(
            Method::POST,
            "/auth/login",
            Some(app.orbit_id),
            json!({ "email": "ada@example.com", "password": "nope-nope", "client_id": client.client_id }),
        ))
        .await;
    let unknown = app
        .send(json_request(
            Method::POST,
            "/auth/login",
            Some(app.orbit_id),
            json!({ "email": "bob@example.com", "password": PASSWORD, "client_id": client.client_id }),
        ))
        .await;

    assert_eq!(wrong.status, StatusCode::UNAUTHORIZED);
    assert_eq!(wrong.raw, unknown.raw);

    let sessions = app.state.store.list_sessions(app.orbit_id, ada, 10, 0).await.unwrap();
    assert_eq!(sessions.total, 0);
}

#[tokio::test]
async fn tampered_session_secret_is_rejected() {
    let app = TestApp::new().await;
    app.register_user("ada", "ada@example.com").await;
    let client = app.confidential_client().await;
    let login = app.login("ada@example.com", &client.client_id).await;
    let session_id = login.body["session_id"].as_str().unwrap();

    let res = session_refresh(&app, &format!("{}.forged", session_id), &client.client_id).await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);

    let res = session_refresh(&app, "no-session-here", &client.client_id).await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn sessions_are_listed_per_user() {
    let app = TestApp::new().await;
    app.register_user("ada", "ada@example.com").await;
    app.register_user("bob", "bob@example.com").await;
    let client = app.confidential_client().await;

    let first = app.user_token("ada@example.com", &client.client_id).await;
    app.user_token("ada@example.com", &client.client_id).await;
    app.user_token("ada@example.com", &client.client_id).await;
    app.user_token("bob@example.com", &client.client_id).await;

    let res = app.get_with_bearer("/auth/sessions?page=1&per_page=2", &first).await;
    assert_eq!(res.status, StatusCode::OK, "{}", res.body);
    assert_eq!(res.body["total"], 3);
    assert_eq!(res.body["per_page"], 2);
    assert_eq!(res.body["sessions"].as_array().unwrap().len(), 2);

    let res = app.get_with_bearer("/auth/sessions?page=2&per_page=2", &first).await;
    let page: Vec<_> = res.body["sessions"].as_array().unwrap().clone();
    assert_eq!(page.len(), 1);
}

#[tokio::test]
async fn duplicate_registration_conflicts_within_an_orbit() {
    let app = TestApp::new().await;
    app.register_user("ada", "ada@example.com").await;

    let res = app
        .send(json_request(
            Method::POST,
            "/users",
            Some(app.orbit_id),
            json!({ "username": "ada2", "email": "ADA@example.com", "password": PASSWORD }),
        ))
        .await;
    assert_eq!(res.status, StatusCode::CONFLICT);

    let other = TestApp::new().await;
    other.register_user("ada", "ada@example.com").await;
}

#[tokio::test]
async fn login_is_rate_limited_per_ip() {
    let app = TestApp::new().await;
    let client = app.confidential_client().await;

    for _ in 0..5 {
        let res = login_from(&app, &client.client_id, "203.0.113.7").await;
        assert_eq!(res.status, StatusCode::UNAUTHORIZED);
    }
    let res = login_from(&app, &client.client_id, "203.0.113.7").await;
    assert_eq!(res.status, StatusCode::TOO_MANY_REQUESTS);
    assert!(res.headers.get(header::RETRY_AFTER).is_some());

    let elsewhere = login_from(&app, &client.client_id, "198.51.100.1").await;
    assert_eq!(elsewhere.status, StatusCode::UNAUTHORIZED);
}
