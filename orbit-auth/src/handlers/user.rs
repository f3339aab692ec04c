use service_core::{
    axum::{extract::State, http::StatusCode, response::IntoResponse, Json},
    error::AppError,
};

use crate::{
    dtos::auth::{RegisterUserRequest, RegisterUserResponse},
    middleware::OrbitId,
    services::auth::NewUser,
    utils::{Password, ValidatedJson},
    AppState,
};

/// Register a user in an orbit
#[utoipa::path(
    post,
    path = "/users",
    request_body = RegisterUserRequest,
    params(("x-orbit-id" = String, Header, description = "Target orbit")),
    responses(
        (status = 201, description = "User registered", body = RegisterUserResponse),
        (status = 404, description = "Unknown orbit", body = ErrorResponse),
        (status = 409, description = "Email or username already taken", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse)
    ),
    tag = "Users"
)]
pub async fn register_user(
    State(state): State<AppState>,
    OrbitId(orbit_id): OrbitId,
    ValidatedJson(req): ValidatedJson<RegisterUserRequest>,
) -> Result<impl IntoResponse, AppError> {
    let user = state
        .engines
        .auth
        .register(
            orbit_id,
            NewUser {
                username: req.username,
                email: req.email,
                password: Password::new(req.password),
            },
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterUserResponse {
            user_id: user.id,
            email: user.email,
            created_at: user.created_at,
        }),
    ))
}
