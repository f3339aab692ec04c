use crate::AppState;
use service_core::axum::{extract::State, http::header, response::IntoResponse, Json};

/// Public signing keys
#[utoipa::path(
    get,
    path = "/oauth/jwks",
    responses(
        (status = 200, description = "Active and previous public keys as a JWK set")
    ),
    tag = "Well-Known"
)]
pub async fn jwks(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CACHE_CONTROL, "public, max-age=3600")],
        Json(state.signer.jwks()),
    )
}
