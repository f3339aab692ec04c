use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use uuid::Uuid;

use super::cache::{self, Cache};
use super::consent::ConsentService;
use super::error::ServiceError;
use super::jwt::{SignedToken, TokenGrant, TokenSigner};
use super::metrics;
use super::refresh::RefreshTokenService;
use super::roles::RoleLookup;
use super::store::{Store, StoreError};
use crate::dtos::oauth::TokenResponse;
use crate::models::{AuthCode, Client, GrantType};
use crate::utils::pkce;
use crate::utils::token::{join_scopes, parse_scopes, random_secret};

/// Parameters of `GET /oauth/authorize` after the end user is known.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub response_type: Option<String>,
    pub client_id: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewAuthCode {
    pub client_id: String,
    pub user_id: Uuid,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
}

/// A token-endpoint request after client authentication.
#[derive(Debug, Clone, Default)]
pub struct GrantRequest {
    pub grant_type: Option<String>,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub code_verifier: Option<String>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
}

/// The authorization-code, refresh-token and client-credentials grants.
#[derive(Clone)]
pub struct OAuthService {
    store: Arc<dyn Store>,
    cache: Cache,
    signer: Arc<TokenSigner>,
    roles: Arc<dyn RoleLookup>,
    consents: ConsentService,
    refresh: RefreshTokenService,
    code_ttl: Duration,
}

impl OAuthService {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Cache,
        signer: Arc<TokenSigner>,
        roles: Arc<dyn RoleLookup>,
        consents: ConsentService,
        refresh: RefreshTokenService,
        code_ttl: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            signer,
            roles,
            consents,
            refresh,
            code_ttl,
        }
    }

    /// Validates an authorization request for `user_id`, records consent and
    /// issues a code. Errors here must not be redirected back to the client.
    #[tracing::instrument(skip(self, client, request), fields(orbit_id = %client.orbit_id, client_id = %client.client_id, user_id = %user_id))]
    pub async fn authorize(
        &self,
        client: &Client,
        user_id: Uuid,
        request: AuthorizationRequest,
    ) -> Result<AuthCode, ServiceError> {
        if request.response_type.as_deref() != Some("code") {
            return Err(ServiceError::InvalidRequest(
                "response_type must be 'code'".into(),
            ));
        }
        if !client.allows_redirect(&request.redirect_uri) {
            return Err(ServiceError::InvalidRequest(
                "redirect_uri is not registered for this client".into(),
            ));
        }
        if !client.allows_grant(GrantType::AuthorizationCode) {
            return Err(ServiceError::UnauthorizedClient);
        }
        if !client.allows_scopes(&request.scopes) {
            return Err(ServiceError::InvalidScope);
        }

        match (&request.code_challenge, &request.code_challenge_method) {
            (Some(challenge), method) => {
                // An absent method means `plain`, which is never accepted.
                if !method.as_deref().is_some_and(pkce::is_supported_method) {
                    return Err(ServiceError::UnsupportedPkceMethod);
                }
                if !pkce::is_valid_challenge(challenge) {
                    return Err(ServiceError::InvalidRequest(
                        "code_challenge is malformed".into(),
                    ));
                }
            }
            (None, Some(_)) => {
                return Err(ServiceError::InvalidRequest(
                    "code_challenge_method without code_challenge".into(),
                ))
            }
            (None, None) if client.is_public => {
                return Err(ServiceError::InvalidRequest(
                    "public clients must use PKCE".into(),
                ))
            }
            (None, None) => {}
        }

        let user = self
            .store
            .find_user(client.orbit_id, user_id)
            .await?
            .filter(|u| u.can_authenticate())
            .ok_or(ServiceError::InactiveAccount)?;

        self.consents
            .grant(client.orbit_id, user.id, &client.client_id, &request.scopes)
            .await?;

        self.create_code(
            client.orbit_id,
            NewAuthCode {
                client_id: client.client_id.clone(),
                user_id: user.id,
                redirect_uri: request.redirect_uri,
                scopes: request.scopes,
                code_challenge: request.code_challenge,
                code_challenge_method: request.code_challenge_method,
            },
        )
        .await
    }

    /// Persists a fresh unused code and mirrors it into the cache for its lifetime.
    pub async fn create_code(&self, orbit_id: Uuid, new: NewAuthCode) -> Result<AuthCode, ServiceError> {
        let code = AuthCode::new(
            random_secret(),
            orbit_id,
            new.client_id,
            new.user_id,
            new.redirect_uri,
            new.scopes,
            new.code_challenge,
            new.code_challenge_method,
            self.code_ttl,
        );
        self.store.create_auth_code(&code).await?;
        self.cache
            .set_json(
                &cache::auth_code_key(&code.code),
                &code,
                StdDuration::from_secs(code.remaining_ttl_seconds().max(1)),
            )
            .await;

        tracing::info!(client_id = %code.client_id, user_id = %code.user_id, "Authorization code issued");
        Ok(code)
    }

    /// Dispatches on `grant_type` and records the outcome in metrics.
    pub async fn token(&self, client: &Client, request: GrantRequest) -> Result<TokenResponse, ServiceError> {
        let grant_label = request.grant_type.clone().unwrap_or_else(|| "none".to_string());
        let result = self.dispatch(client, request).await;

        match &result {
            Ok(_) => metrics::record_token_issued(&grant_label),
            Err(e) => metrics::record_grant_failure(&grant_label, e.label()),
        }
        result
    }

    async fn dispatch(&self, client: &Client, request: GrantRequest) -> Result<TokenResponse, ServiceError> {
        let grant: GrantType = request
            .grant_type
            .as_deref()
            .ok_or_else(|| ServiceError::InvalidRequest("grant_type is required".into()))?
            .parse()
            .map_err(|_| ServiceError::UnsupportedGrantType)?;

        if grant == GrantType::ClientCredentials && client.is_public {
            return Err(ServiceError::InvalidClient);
        }
        if !client.allows_grant(grant) {
            return Err(ServiceError::UnauthorizedClient);
        }

        match grant {
            GrantType::AuthorizationCode => {
                let code = required(request.code, "code")?;
                let redirect_uri = required(request.redirect_uri, "redirect_uri")?;
                self.exchange(client, &code, &redirect_uri, request.code_verifier.as_deref())
                    .await
            }
            GrantType::RefreshToken => {
                let presented = required(request.refresh_token, "refresh_token")?;
                let rotated = self
                    .refresh
                    .rotate(
                        client.orbit_id,
                        client,
                        &presented,
                        parse_scopes(request.scope.as_deref()),
                    )
                    .await?;
                Ok(token_response(
                    &rotated.access,
                    Some(rotated.refresh_token),
                    &rotated.scopes,
                ))
            }
            GrantType::ClientCredentials => {
                self.client_credentials(client, parse_scopes(request.scope.as_deref()))
                    .await
            }
        }
    }

    /// Single-use exchange. Token record and `used` flag are written in one
    /// store unit, so a concurrent second exchange fails with `InvalidGrant`.
    #[tracing::instrument(skip(self, client, code, code_verifier), fields(orbit_id = %client.orbit_id, client_id = %client.client_id))]
    pub async fn exchange(
        &self,
        client: &Client,
        code: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenResponse, ServiceError> {
        let orbit_id = client.orbit_id;
        let record = self.load_code(orbit_id, code).await?.ok_or_else(|| {
            ServiceError::InvalidGrant("unknown authorization code".into())
        })?;

        if record.used {
            return Err(ServiceError::InvalidGrant("authorization code already used".into()));
        }
        if record.is_expired() {
            return Err(ServiceError::InvalidGrant("authorization code expired".into()));
        }
        if record.client_id != client.client_id || record.redirect_uri != redirect_uri {
            tracing::warn!("Authorization code presented by the wrong client or redirect");
            return Err(ServiceError::InvalidGrant(
                "authorization code was not issued to this client or redirect_uri".into(),
            ));
        }

        if let Some(challenge) = &record.code_challenge {
            let method = record.code_challenge_method.as_deref().unwrap_or("plain");
            if !pkce::is_supported_method(method) {
                return Err(ServiceError::UnsupportedPkceMethod);
            }
            let verifier = code_verifier
                .ok_or_else(|| ServiceError::InvalidGrant("code_verifier is required".into()))?;
            if !pkce::is_valid_verifier(verifier) || !pkce::verify_s256(verifier, challenge) {
                return Err(ServiceError::InvalidGrant("PKCE verification failed".into()));
            }
        }

        let user = self
            .store
            .find_user(orbit_id, record.user_id)
            .await?
            .filter(|u| u.can_authenticate())
            .ok_or_else(|| ServiceError::InvalidGrant("user is no longer active".into()))?;
        let roles = self.roles.role_ids(orbit_id, user.id).await?;

        let access = self.signer.sign(TokenGrant {
            orbit_id,
            subject: user.id.to_string(),
            client_id: client.client_id.clone(),
            scopes: record.scopes.clone(),
            roles,
            session_id: None,
        })?;

        let refresh = client.allows_grant(GrantType::RefreshToken).then(|| {
            self.refresh
                .issue(orbit_id, &client.client_id, Some(user.id), record.scopes.clone())
        });

        let redeemed = self
            .store
            .redeem_auth_code(
                orbit_id,
                code,
                &access.record(refresh.as_ref().map(|(r, _)| r.id)),
                refresh.as_ref().map(|(r, _)| r),
            )
            .await;
        self.cache.invalidate(&cache::auth_code_key(code)).await;

        match redeemed {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => {
                return Err(ServiceError::InvalidGrant("unknown authorization code".into()))
            }
            Err(StoreError::Expired) => {
                return Err(ServiceError::InvalidGrant("authorization code expired".into()))
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(user_id = %user.id, jti = %access.jti(), "Authorization code exchanged");
        Ok(token_response(
            &access,
            refresh.map(|(_, value)| value),
            &record.scopes,
        ))
    }

    /// Confidential clients only. The subject is the client itself and no
    /// refresh token is issued.
    #[tracing::instrument(skip(self, client, scopes), fields(orbit_id = %client.orbit_id, client_id = %client.client_id))]
    pub async fn client_credentials(
        &self,
        client: &Client,
        scopes: Vec<String>,
    ) -> Result<TokenResponse, ServiceError> {
        if client.is_public {
            return Err(ServiceError::InvalidClient);
        }
        if !client.allows_grant(GrantType::ClientCredentials) {
            return Err(ServiceError::UnauthorizedClient);
        }

        let scopes = if scopes.is_empty() {
            client.allowed_scopes.clone()
        } else if client.allows_scopes(&scopes) {
            scopes
        } else {
            return Err(ServiceError::InvalidScope);
        };

        let access = self.signer.sign(TokenGrant {
            orbit_id: client.orbit_id,
            subject: client.client_id.clone(),
            client_id: client.client_id.clone(),
            scopes: scopes.clone(),
            roles: Vec::new(),
            session_id: None,
        })?;
        self.store.create_access_token(&access.record(None)).await?;

        tracing::info!(jti = %access.jti(), "Client credentials token issued");
        Ok(token_response(&access, None, &scopes))
    }

    /// Cache first; the store stays authoritative for `used`.
    async fn load_code(&self, orbit_id: Uuid, code: &str) -> Result<Option<AuthCode>, ServiceError> {
        if let Some(cached) = self
            .cache
            .get_json::<AuthCode>(&cache::auth_code_key(code))
            .await
            .filter(|c| c.orbit_id == orbit_id)
        {
            return Ok(Some(cached));
        }
        Ok(self.store.find_auth_code(orbit_id, code).await?)
    }
}

fn required(value: Option<String>, name: &str) -> Result<String, ServiceError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ServiceError::InvalidRequest(format!("{} is required", name)))
}

fn token_response(access: &SignedToken, refresh_token: Option<String>, scopes: &[String]) -> TokenResponse {
    TokenResponse {
        access_token: access.token.clone(),
        token_type: "Bearer".to_string(),
        expires_in: access.expires_in(),
        refresh_token,
        scope: (!scopes.is_empty()).then(|| join_scopes(scopes)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::client::{ClientCredentials, CredentialSource, NewClient};
    use crate::services::testing::{Harness, REDIRECT};

    const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
    const CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

    fn authorize_request(h: &Harness, challenge: Option<&str>, method: Option<&str>) -> AuthorizationRequest {
        AuthorizationRequest {
            response_type: Some("code".into()),
            client_id: h.client.client_id.clone(),
            redirect_uri: REDIRECT.into(),
            scopes: vec!["read".into()],
            code_challenge: challenge.map(str::to_string),
            code_challenge_method: method.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn code_exchanges_exactly_once() {
        let h = Harness::new().await;
        let code = h.seed_code(None, None).await;

        let tokens = h.oauth.exchange(&h.client, &code, REDIRECT, None).await.unwrap();
        assert_eq!(tokens.token_type, "Bearer");
        assert_eq!(tokens.expires_in, 900);
        assert!(tokens.refresh_token.is_some());

        assert!(matches!(
            h.oauth.exchange(&h.client, &code, REDIRECT, None).await,
            Err(ServiceError::InvalidGrant(_))
        ));
    }

    #[tokio::test]
    async fn expired_code_fails_invalid_grant() {
        let h = Harness::new().await;
        let code = h.seed_code(None, None).await;
        h.oauth.cache.invalidate(&cache::auth_code_key(&code)).await;
        h.store.force_expire(&code);

        assert!(matches!(
            h.oauth.exchange(&h.client, &code, REDIRECT, None).await,
            Err(ServiceError::InvalidGrant(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_exchanges_issue_one_token() {
        let h = Harness::new().await;
        let code = h.seed_code(None, None).await;

        let (a, b) = tokio::join!(
            h.oauth.exchange(&h.client, &code, REDIRECT, None),
            h.oauth.exchange(&h.client, &code, REDIRECT, None),
        );
        let successes = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(successes, 1);
        assert!(matches!(a.err().or(b.err()), Some(ServiceError::InvalidGrant(_))));
    }

    #[tokio::test]
    async fn redirect_and_client_must_match() {
        let h = Harness::new().await;
        let code = h.seed_code(None, None).await;

        assert!(matches!(
            h.oauth.exchange(&h.client, &code, "https://evil/cb", None).await,
            Err(ServiceError::InvalidGrant(_))
        ));
        assert!(matches!(
            h.oauth.exchange(&h.public_client, &code, REDIRECT, None).await,
            Err(ServiceError::InvalidGrant(_))
        ));
        // Mismatches do not burn the code.
        assert!(h.oauth.exchange(&h.client, &code, REDIRECT, None).await.is_ok());
    }

    #[tokio::test]
    async fn pkce_s256_is_verified() {
        let h = Harness::new().await;
        let code = h.seed_code(Some(CHALLENGE), Some("S256")).await;

        assert!(matches!(
            h.oauth.exchange(&h.client, &code, REDIRECT, Some("wrong-verifier")).await,
            Err(ServiceError::InvalidGrant(_))
        ));
        assert!(matches!(
            h.oauth.exchange(&h.client, &code, REDIRECT, None).await,
            Err(ServiceError::InvalidGrant(_))
        ));
        assert!(h
            .oauth
            .exchange(&h.client, &code, REDIRECT, Some(VERIFIER))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn non_s256_code_fails_unsupported_method() {
        let h = Harness::new().await;
        let code = h.seed_code(Some(VERIFIER), Some("plain")).await;
        assert!(matches!(
            h.oauth.exchange(&h.client, &code, REDIRECT, Some(VERIFIER)).await,
            Err(ServiceError::UnsupportedPkceMethod)
        ));
    }

    #[tokio::test]
    async fn authorize_rejects_plain_and_unregistered_redirects() {
        let h = Harness::new().await;

        assert!(matches!(
            h.oauth
                .authorize(&h.client, h.user.id, authorize_request(&h, Some(VERIFIER), Some("plain")))
                .await,
            Err(ServiceError::UnsupportedPkceMethod)
        ));
        assert!(matches!(
            h.oauth
                .authorize(&h.client, h.user.id, authorize_request(&h, Some(CHALLENGE), None))
                .await,
            Err(ServiceError::UnsupportedPkceMethod)
        ));

        let mut elsewhere = authorize_request(&h, None, None);
        elsewhere.redirect_uri = "https://app/cb/extra".into();
        assert!(matches!(
            h.oauth.authorize(&h.client, h.user.id, elsewhere).await,
            Err(ServiceError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn public_clients_need_pkce() {
        let h = Harness::new().await;
        let mut request = authorize_request(&h, None, None);
        request.client_id = h.public_client.client_id.clone();

        assert!(matches!(
            h.oauth.authorize(&h.public_client, h.user.id, request.clone()).await,
            Err(ServiceError::InvalidRequest(_))
        ));

        request.code_challenge = Some(CHALLENGE.into());
        request.code_challenge_method = Some("S256".into());
        let code = h
            .oauth
            .authorize(&h.public_client, h.user.id, request)
            .await
            .unwrap();

        let consent = h
            .consents
            .find(h.orbit, h.user.id, &h.public_client.client_id)
            .await
            .unwrap()
            .unwrap();
        assert!(consent.covers(&["read".to_string()]));

        assert!(h
            .oauth
            .exchange(&h.public_client, &code.code, REDIRECT, Some(VERIFIER))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn client_credentials_rules() {
        let h = Harness::new().await;

        let tokens = h.oauth.client_credentials(&h.client, vec![]).await.unwrap();
        assert!(tokens.refresh_token.is_none());
        let claims = h.auth.validate_token(&tokens.access_token, None).await.unwrap();
        assert_eq!(claims.sub, h.client.client_id);
        assert_eq!(claims.user_id(), None);

        assert!(matches!(
            h.oauth.client_credentials(&h.client, vec!["admin".into()]).await,
            Err(ServiceError::InvalidScope)
        ));
        assert!(matches!(
            h.oauth.client_credentials(&h.public_client, vec![]).await,
            Err(ServiceError::InvalidClient)
        ));
    }

    #[tokio::test]
    async fn token_dispatch_checks_grant_registration() {
        let h = Harness::new().await;
        let request = |grant: &str| GrantRequest {
            grant_type: Some(grant.to_string()),
            ..GrantRequest::default()
        };

        assert!(matches!(
            h.oauth.token(&h.client, request("password")).await,
            Err(ServiceError::UnsupportedGrantType)
        ));
        assert!(matches!(
            h.oauth.token(&h.public_client, request("client_credentials")).await,
            Err(ServiceError::InvalidClient)
        ));
        assert!(matches!(
            h.oauth.token(&h.client, request("authorization_code")).await,
            Err(ServiceError::InvalidRequest(_))
        ));

        let (service, _) = h
            .clients
            .register(
                h.orbit,
                NewClient {
                    name: "daemon".into(),
                    redirect_uris: vec![REDIRECT.into()],
                    grant_types: vec!["client_credentials".into()],
                    auth_method: None,
                    allowed_scopes: vec!["read".into()],
                },
            )
            .await
            .unwrap();
        assert!(matches!(
            h.oauth.token(&service, request("refresh_token")).await,
            Err(ServiceError::UnauthorizedClient)
        ));
    }

    #[tokio::test]
    async fn authenticated_client_gets_client_credentials_token() {
        let h = Harness::new().await;
        let client = h
            .clients
            .authenticate(
                h.orbit,
                ClientCredentials {
                    client_id: h.client.client_id.clone(),
                    client_secret: Some(h.client_secret.clone()),
                    source: CredentialSource::Basic,
                },
                false,
            )
            .await
            .unwrap();

        let tokens = h
            .oauth
            .token(
                &client,
                GrantRequest {
                    grant_type: Some("client_credentials".into()),
                    scope: Some("read".into()),
                    ..GrantRequest::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(tokens.scope.as_deref(), Some("read"));
        assert!(tokens.refresh_token.is_none());
    }
}
