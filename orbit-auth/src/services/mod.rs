//! Token lifecycle engines and the stores and caches they sit on.

pub mod auth;
pub mod cache;
pub mod client;
pub mod consent;
pub mod error;
pub mod jwt;
pub mod metrics;
pub mod oauth;
pub mod refresh;
pub mod revocation;
pub mod roles;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use chrono::Duration;

pub use auth::AuthService;
pub use cache::{Cache, CacheBackend, InMemoryCache, RedisCache};
pub use client::ClientService;
pub use consent::ConsentService;
pub use error::ServiceError;
pub use jwt::{AccessTokenClaims, TokenSigner};
pub use oauth::OAuthService;
pub use refresh::RefreshTokenService;
pub use revocation::{RevocationService, RevocationStatus};
pub use roles::{RoleLookup, StoreRoleLookup};
pub use store::{MemoryStore, PgStore, Store, StoreError};

/// Lifetimes of everything except access tokens, which are fixed.
#[derive(Debug, Clone, Copy)]
pub struct Lifetimes {
    pub session: Duration,
    pub refresh_token: Duration,
    pub auth_code: Duration,
}

impl Lifetimes {
    pub fn from_config(tokens: &crate::config::TokenLifetimeConfig) -> Self {
        Self {
            session: Duration::days(tokens.session_ttl_days),
            refresh_token: Duration::days(tokens.refresh_token_ttl_days),
            auth_code: Duration::seconds(tokens.auth_code_ttl_seconds),
        }
    }
}

impl Default for Lifetimes {
    fn default() -> Self {
        Self {
            session: Duration::days(30),
            refresh_token: Duration::days(30),
            auth_code: Duration::minutes(5),
        }
    }
}

/// Every engine wired onto one store, cache and signer.
#[derive(Clone)]
pub struct Engines {
    pub clients: ClientService,
    pub consents: ConsentService,
    pub revocation: RevocationService,
    pub auth: AuthService,
    pub refresh: RefreshTokenService,
    pub oauth: OAuthService,
}

impl Engines {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Cache,
        signer: Arc<TokenSigner>,
        roles: Arc<dyn RoleLookup>,
        lifetimes: Lifetimes,
    ) -> Self {
        let clients = ClientService::new(store.clone(), cache.clone());
        let consents = ConsentService::new(store.clone(), cache.clone());
        let revocation = RevocationService::new(store.clone(), cache.clone(), signer.clone());
        let auth = AuthService::new(
            store.clone(),
            signer.clone(),
            roles.clone(),
            clients.clone(),
            revocation.clone(),
            lifetimes.session,
        );
        let refresh = RefreshTokenService::new(
            store.clone(),
            signer.clone(),
            roles.clone(),
            revocation.clone(),
            lifetimes.refresh_token,
        );
        let oauth = OAuthService::new(
            store,
            cache,
            signer,
            roles,
            consents.clone(),
            refresh.clone(),
            lifetimes.auth_code,
        );

        Self {
            clients,
            consents,
            revocation,
            auth,
            refresh,
            oauth,
        }
    }
}
