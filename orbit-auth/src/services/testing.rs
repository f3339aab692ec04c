//! Shared fixture for engine tests: one orbit, one user, a confidential and a
//! public client, all on the in-memory store and cache.

use std::sync::Arc;

use uuid::Uuid;

use super::auth::NewUser;
use super::client::NewClient;
use super::oauth::NewAuthCode;
use super::*;
use crate::models::{Client, Orbit, Role, User};
use crate::utils::Password;

pub const ISSUER: &str = "https://auth.test";
pub const REDIRECT: &str = "https://app/cb";
pub const PRIVATE_KEY: &str = include_str!("../../tests/fixtures/signing_key.pem");
pub const PUBLIC_KEY: &str = include_str!("../../tests/fixtures/signing_key.pub.pem");

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub signer: Arc<TokenSigner>,
    pub orbit: Uuid,
    pub user: User,
    pub client: Client,
    pub client_secret: String,
    pub public_client: Client,
    pub auth: AuthService,
    pub oauth: OAuthService,
    pub refresh: RefreshTokenService,
    pub revocation: RevocationService,
    pub clients: ClientService,
    pub consents: ConsentService,
}

impl Harness {
    pub async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let cache = Cache::new(Arc::new(InMemoryCache::new()));
        let signer = Arc::new(TokenSigner::from_pems(ISSUER, "test-key", PRIVATE_KEY, PUBLIC_KEY).unwrap());
        let roles: Arc<dyn RoleLookup> = Arc::new(StoreRoleLookup::new(store.clone()));

        let engines = Engines::new(store.clone(), cache, signer.clone(), roles, Lifetimes::default());

        let orbit = Orbit::new(format!("orbit-{}", Uuid::new_v4()));
        store.create_orbit(&orbit).await.unwrap();

        let user = engines
            .auth
            .register(
                orbit.id,
                NewUser {
                    username: "ada".into(),
                    email: "a@x.com".into(),
                    password: Password::new("pw123456"),
                },
            )
            .await
            .unwrap();

        let role = Role::new(orbit.id, "reader".into());
        store.create_role(&role).await.unwrap();
        store.assign_role(orbit.id, user.id, role.id).await.unwrap();

        let (client, secret) = engines
            .clients
            .register(
                orbit.id,
                NewClient {
                    name: "confidential".into(),
                    redirect_uris: vec![REDIRECT.into()],
                    grant_types: vec![
                        "authorization_code".into(),
                        "refresh_token".into(),
                        "client_credentials".into(),
                    ],
                    auth_method: None,
                    allowed_scopes: vec!["read".into(), "profile".into()],
                },
            )
            .await
            .unwrap();

        let (public_client, _) = engines
            .clients
            .register(
                orbit.id,
                NewClient {
                    name: "spa".into(),
                    redirect_uris: vec![REDIRECT.into()],
                    grant_types: vec![],
                    auth_method: Some("none".into()),
                    allowed_scopes: vec!["read".into(), "profile".into()],
                },
            )
            .await
            .unwrap();

        Self {
            store,
            signer,
            orbit: orbit.id,
            user,
            client,
            client_secret: secret.unwrap(),
            public_client,
            auth: engines.auth,
            oauth: engines.oauth,
            refresh: engines.refresh,
            revocation: engines.revocation,
            clients: engines.clients,
            consents: engines.consents,
        }
    }

    /// A code for the confidential client with scopes `read profile`.
    pub async fn seed_code(&self, challenge: Option<&str>, method: Option<&str>) -> String {
        self.oauth
            .create_code(
                self.orbit,
                NewAuthCode {
                    client_id: self.client.client_id.clone(),
                    user_id: self.user.id,
                    redirect_uri: REDIRECT.into(),
                    scopes: vec!["read".into(), "profile".into()],
                    code_challenge: challenge.map(str::to_string),
                    code_challenge_method: method.map(str::to_string),
                },
            )
            .await
            .unwrap()
            .code
    }
}
