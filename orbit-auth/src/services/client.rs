use std::sync::Arc;

use chrono::Utc;
use url::Url;
use uuid::Uuid;

use super::cache::{self, Cache};
use super::error::ServiceError;
use super::store::Store;
use crate::models::{Client, GrantType, TokenEndpointAuthMethod};
use crate::utils::password::{hash_password_blocking, verify_password_blocking};
use crate::utils::token::{random_client_id, random_secret};
use crate::utils::{Password, PasswordHashString};

#[derive(Debug, Clone)]
pub struct NewClient {
    pub name: String,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub auth_method: Option<String>,
    pub allowed_scopes: Vec<String>,
}

/// How the caller presented its credentials at a client-authenticated endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Basic,
    Form,
}

#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub source: CredentialSource,
}

#[derive(Clone)]
pub struct ClientService {
    store: Arc<dyn Store>,
    cache: Cache,
}

impl ClientService {
    pub fn new(store: Arc<dyn Store>, cache: Cache) -> Self {
        Self { store, cache }
    }

    /// Returns the stored client and, for confidential clients, the plaintext secret.
    #[tracing::instrument(skip(self, new), fields(orbit_id = %orbit_id))]
    pub async fn register(
        &self,
        orbit_id: Uuid,
        new: NewClient,
    ) -> Result<(Client, Option<String>), ServiceError> {
        self.store
            .find_orbit(orbit_id)
            .await?
            .ok_or(ServiceError::NotFound("Orbit"))?;

        let method: TokenEndpointAuthMethod = match new.auth_method.as_deref() {
            None => TokenEndpointAuthMethod::ClientSecretBasic,
            Some(raw) => raw.parse().map_err(|_| {
                ServiceError::InvalidRequest(format!("unsupported token_endpoint_auth_method '{}'", raw))
            })?,
        };

        for uri in &new.redirect_uris {
            validate_redirect_uri(uri)?;
        }

        let grant_types = if new.grant_types.is_empty() {
            vec![
                GrantType::AuthorizationCode.as_str().to_string(),
                GrantType::RefreshToken.as_str().to_string(),
            ]
        } else {
            let mut parsed = Vec::with_capacity(new.grant_types.len());
            for raw in &new.grant_types {
                let grant: GrantType = raw.parse().map_err(|_| {
                    ServiceError::InvalidRequest(format!("unsupported grant type '{}'", raw))
                })?;
                if !parsed.contains(&grant.as_str().to_string()) {
                    parsed.push(grant.as_str().to_string());
                }
            }
            parsed
        };

        if method.is_public()
            && grant_types
                .iter()
                .any(|g| g == GrantType::ClientCredentials.as_str())
        {
            return Err(ServiceError::InvalidRequest(
                "public clients cannot use client_credentials".into(),
            ));
        }

        let (secret, secret_hash) = if method.is_public() {
            (None, None)
        } else {
            let secret = random_secret();
            let hash = hash_password_blocking(Password::new(secret.clone())).await?;
            (Some(secret), Some(hash.into_string()))
        };

        let now = Utc::now();
        let client = Client {
            id: Uuid::new_v4(),
            orbit_id,
            client_id: random_client_id(),
            name: new.name,
            secret_hash,
            redirect_uris: new.redirect_uris,
            grant_types,
            token_endpoint_auth_method: method.as_str().to_string(),
            is_public: method.is_public(),
            allowed_scopes: new.allowed_scopes,
            created_at: now,
            updated_at: now,
        };

        self.store.create_client(&client).await?;
        tracing::info!(client_id = %client.client_id, public = client.is_public, "Client registered");
        Ok((client, secret))
    }

    /// Cache-first lookup.
    pub async fn find(&self, orbit_id: Uuid, client_id: &str) -> Result<Option<Client>, ServiceError> {
        let key = cache::client_key(orbit_id, client_id);
        if let Some(client) = self.cache.get_json::<Client>(&key).await {
            return Ok(Some(client));
        }

        let client = self.store.find_client(orbit_id, client_id).await?;
        if let Some(client) = &client {
            self.cache.set_json(&key, client, cache::CLIENT_TTL).await;
        }
        Ok(client)
    }

    /// Every failure is `InvalidClient`, whether the id is unknown, the
    /// secret is wrong, or the credentials came the wrong way.
    ///
    /// Public clients only pass when `allow_public` is set and no secret was sent.
    #[tracing::instrument(skip(self, credentials), fields(orbit_id = %orbit_id, client_id = %credentials.client_id))]
    pub async fn authenticate(
        &self,
        orbit_id: Uuid,
        credentials: ClientCredentials,
        allow_public: bool,
    ) -> Result<Client, ServiceError> {
        let client = self.find(orbit_id, &credentials.client_id).await?;

        let Some(client) = client else {
            if let Some(secret) = credentials.client_secret {
                verify_password_blocking(Password::new(secret), None).await?;
            }
            tracing::warn!("Client authentication failed");
            return Err(ServiceError::InvalidClient);
        };

        if client.is_public {
            if allow_public && credentials.client_secret.is_none() {
                return Ok(client);
            }
            tracing::warn!("Client authentication failed");
            return Err(ServiceError::InvalidClient);
        }

        let expected_source = match client.auth_method() {
            TokenEndpointAuthMethod::ClientSecretPost => CredentialSource::Form,
            _ => CredentialSource::Basic,
        };

        let secret = credentials.client_secret.unwrap_or_default();
        let verified = verify_password_blocking(
            Password::new(secret),
            client.secret_hash.clone().map(PasswordHashString::new),
        )
        .await?;

        if !verified || credentials.source != expected_source {
            tracing::warn!("Client authentication failed");
            return Err(ServiceError::InvalidClient);
        }
        Ok(client)
    }

    /// Replace the secret of an already authenticated confidential client.
    #[tracing::instrument(skip(self, client), fields(orbit_id = %client.orbit_id, client_id = %client.client_id))]
    pub async fn rotate_secret(&self, client: &Client) -> Result<String, ServiceError> {
        if client.is_public {
            return Err(ServiceError::InvalidRequest(
                "public clients have no secret".into(),
            ));
        }

        let secret = random_secret();
        let hash = hash_password_blocking(Password::new(secret.clone())).await?;
        self.store
            .update_client_secret(client.orbit_id, &client.client_id, hash.as_str())
            .await?;
        self.cache
            .invalidate(&cache::client_key(client.orbit_id, &client.client_id))
            .await;

        tracing::info!("Client secret rotated");
        Ok(secret)
    }
}

/// Absolute http(s) URL without a fragment.
fn validate_redirect_uri(raw: &str) -> Result<(), ServiceError> {
    let url = Url::parse(raw)
        .map_err(|_| ServiceError::InvalidRequest(format!("redirect_uri '{}' is not an absolute URL", raw)))?;
    if !matches!(url.scheme(), "http" | "https") || url.fragment().is_some() {
        return Err(ServiceError::InvalidRequest(format!(
            "redirect_uri '{}' must be http(s) without a fragment",
            raw
        )));
    }
    Ok(())
}
