use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RegisterClientRequest {
    #[validate(length(min = 1, max = 100, message = "Name must be 1-100 characters"))]
    #[schema(example = "Billing Dashboard")]
    pub name: String,

    #[validate(length(min = 1, message = "At least one redirect URI is required"))]
    #[schema(example = json!(["https://app.example.com/callback"]))]
    pub redirect_uris: Vec<String>,

    /// Defaults to `["authorization_code", "refresh_token"]`.
    #[serde(default)]
    #[schema(example = json!(["authorization_code", "refresh_token"]))]
    pub grant_types: Vec<String>,

    /// `client_secret_basic` (default), `client_secret_post` or `none` for public clients.
    #[schema(example = "client_secret_basic")]
    pub token_endpoint_auth_method: Option<String>,

    #[serde(default)]
    #[schema(example = json!(["read", "profile"]))]
    pub allowed_scopes: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RegisterClientResponse {
    #[schema(example = "3f1c9a0e5b7d4e2f8a6c1b0d9e8f7a6b")]
    pub client_id: String,
    /// Only present for confidential clients, and only in this response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    pub name: String,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub token_endpoint_auth_method: String,
    pub allowed_scopes: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ClientSecretResponse {
    pub client_id: String,
    pub client_secret: String,
}

/// Form credentials for client-authenticated endpoints that take no other input.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct ClientAuthForm {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}
