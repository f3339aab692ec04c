use axum_extra::{
    headers::{authorization::Basic, Authorization},
    TypedHeader,
};
use service_core::{
    axum::{
        extract::{Path, State},
        http::StatusCode,
        response::IntoResponse,
        Form, Json,
    },
    error::AppError,
};

use crate::{
    dtos::client::{ClientAuthForm, ClientSecretResponse, RegisterClientRequest, RegisterClientResponse},
    middleware::OrbitId,
    services::{
        client::{ClientCredentials, CredentialSource, NewClient},
        ServiceError,
    },
    utils::ValidatedJson,
    AppState,
};

/// Register an OAuth client
#[utoipa::path(
    post,
    path = "/clients",
    request_body = RegisterClientRequest,
    params(("x-orbit-id" = String, Header, description = "Target orbit")),
    responses(
        (status = 201, description = "Client registered; the secret is only shown here", body = RegisterClientResponse),
        (status = 400, description = "Invalid redirect URI, grant type or auth method", body = ErrorResponse),
        (status = 404, description = "Unknown orbit", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse)
    ),
    tag = "Clients"
)]
pub async fn register_client(
    State(state): State<AppState>,
    OrbitId(orbit_id): OrbitId,
    ValidatedJson(req): ValidatedJson<RegisterClientRequest>,
) -> Result<impl IntoResponse, AppError> {
    let (client, client_secret) = state
        .engines
        .clients
        .register(
            orbit_id,
            NewClient {
                name: req.name,
                redirect_uris: req.redirect_uris,
                grant_types: req.grant_types,
                auth_method: req.token_endpoint_auth_method,
                allowed_scopes: req.allowed_scopes,
            },
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterClientResponse {
            client_id: client.client_id,
            client_secret,
            name: client.name,
            redirect_uris: client.redirect_uris,
            grant_types: client.grant_types,
            token_endpoint_auth_method: client.token_endpoint_auth_method,
            allowed_scopes: client.allowed_scopes,
            created_at: client.created_at,
        }),
    ))
}

/// Rotate the calling client's secret
#[utoipa::path(
    post,
    path = "/clients/{client_id}/secret",
    params(
        ("client_id" = String, Path, description = "Client identifier"),
        ("x-orbit-id" = String, Header, description = "Orbit of the client")
    ),
    responses(
        (status = 200, description = "New secret, shown once", body = ClientSecretResponse),
        (status = 401, description = "Client authentication failed", body = ErrorResponse)
    ),
    tag = "Clients",
    security(("client_basic" = []))
)]
pub async fn rotate_client_secret(
    State(state): State<AppState>,
    OrbitId(orbit_id): OrbitId,
    Path(client_id): Path<String>,
    basic: Option<TypedHeader<Authorization<Basic>>>,
    form: Option<Form<ClientAuthForm>>,
) -> Result<impl IntoResponse, AppError> {
    let credentials = match (basic, form) {
        (Some(TypedHeader(Authorization(basic))), _) => ClientCredentials {
            client_id: basic.username().to_string(),
            client_secret: Some(basic.password().to_string()),
            source: CredentialSource::Basic,
        },
        (None, Some(Form(form))) => ClientCredentials {
            client_id: form.client_id.unwrap_or_default(),
            client_secret: form.client_secret,
            source: CredentialSource::Form,
        },
        (None, None) => return Err(ServiceError::InvalidClient.into()),
    };

    if credentials.client_id != client_id {
        return Err(ServiceError::InvalidClient.into());
    }

    let client = state
        .engines
        .clients
        .authenticate(orbit_id, credentials, false)
        .await?;
    let client_secret = state.engines.clients.rotate_secret(&client).await?;

    Ok(Json(ClientSecretResponse {
        client_id: client.client_id,
        client_secret,
    }))
}
