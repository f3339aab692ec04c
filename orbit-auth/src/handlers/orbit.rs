use service_core::{
    axum::{extract::State, http::StatusCode, response::IntoResponse, Json},
    error::AppError,
};

use crate::{
    dtos::auth::{CreateOrbitRequest, OrbitResponse},
    models::Orbit,
    services::ServiceError,
    utils::ValidatedJson,
    AppState,
};

/// Create a tenant
#[utoipa::path(
    post,
    path = "/orbits",
    request_body = CreateOrbitRequest,
    responses(
        (status = 201, description = "Orbit created", body = OrbitResponse),
        (status = 409, description = "Name already taken", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse)
    ),
    tag = "Orbits"
)]
pub async fn create_orbit(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<CreateOrbitRequest>,
) -> Result<impl IntoResponse, AppError> {
    let orbit = Orbit::new(req.name.trim().to_string());
    state
        .store
        .create_orbit(&orbit)
        .await
        .map_err(ServiceError::from)?;

    tracing::info!(orbit_id = %orbit.id, "Orbit created");
    Ok((
        StatusCode::CREATED,
        Json(OrbitResponse {
            orbit_id: orbit.id,
            name: orbit.name,
            created_at: orbit.created_at,
        }),
    ))
}
