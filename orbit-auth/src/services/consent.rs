use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use super::cache::{self, Cache};
use super::error::ServiceError;
use super::store::Store;
use crate::models::Consent;

#[derive(Clone)]
pub struct ConsentService {
    store: Arc<dyn Store>,
    cache: Cache,
}

impl ConsentService {
    pub fn new(store: Arc<dyn Store>, cache: Cache) -> Self {
        Self { store, cache }
    }

    /// Adds `scopes` to whatever the user already granted the client.
    #[tracing::instrument(skip(self, scopes), fields(orbit_id = %orbit_id, user_id = %user_id))]
    pub async fn grant(
        &self,
        orbit_id: Uuid,
        user_id: Uuid,
        client_id: &str,
        scopes: &[String],
    ) -> Result<Consent, ServiceError> {
        let consent = match self.store.find_consent(orbit_id, user_id, client_id).await? {
            Some(mut existing) if existing.is_active() => {
                for scope in scopes {
                    if !existing.scopes.contains(scope) {
                        existing.scopes.push(scope.clone());
                    }
                }
                existing.granted_at = Utc::now();
                existing
            }
            _ => Consent::new(orbit_id, user_id, client_id.to_string(), scopes.to_vec()),
        };

        self.store.upsert_consent(&consent).await?;
        self.cache
            .invalidate(&cache::consent_key(orbit_id, user_id, client_id))
            .await;
        Ok(consent)
    }

    pub async fn find(
        &self,
        orbit_id: Uuid,
        user_id: Uuid,
        client_id: &str,
    ) -> Result<Option<Consent>, ServiceError> {
        let key = cache::consent_key(orbit_id, user_id, client_id);
        if let Some(consent) = self.cache.get_json::<Consent>(&key).await {
            return Ok(Some(consent));
        }

        let consent = self.store.find_consent(orbit_id, user_id, client_id).await?;
        if let Some(consent) = &consent {
            self.cache.set_json(&key, consent, cache::CONSENT_TTL).await;
        }
        Ok(consent)
    }

    /// Returns false when there was no active consent to revoke.
    pub async fn revoke(
        &self,
        orbit_id: Uuid,
        user_id: Uuid,
        client_id: &str,
    ) -> Result<bool, ServiceError> {
        let revoked = self.store.revoke_consent(orbit_id, user_id, client_id).await?;
        self.cache
            .invalidate(&cache::consent_key(orbit_id, user_id, client_id))
            .await;
        if revoked {
            tracing::info!(orbit_id = %orbit_id, user_id = %user_id, client_id = %client_id, "Consent revoked");
        }
        Ok(revoked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cache::InMemoryCache;
    use crate::services::store::MemoryStore;

    fn service() -> ConsentService {
        ConsentService::new(
            Arc::new(MemoryStore::new()),
            Cache::new(Arc::new(InMemoryCache::new())),
        )
    }

    #[tokio::test]
    async fn grants_accumulate_scopes() {
        let svc = service();
        let (orbit, user) = (Uuid::new_v4(), Uuid::new_v4());

        svc.grant(orbit, user, "c1", &["read".into()]).await.unwrap();
        svc.grant(orbit, user, "c1", &["profile".into(), "read".into()])
            .await
            .unwrap();

        let consent = svc.find(orbit, user, "c1").await.unwrap().unwrap();
        assert_eq!(consent.scopes, vec!["read".to_string(), "profile".to_string()]);
    }

    #[tokio::test]
    async fn revoke_is_visible_through_the_cache() {
        let svc = service();
        let (orbit, user) = (Uuid::new_v4(), Uuid::new_v4());
        svc.grant(orbit, user, "c1", &["read".into()]).await.unwrap();
        assert!(svc.find(orbit, user, "c1").await.unwrap().unwrap().is_active());

        assert!(svc.revoke(orbit, user, "c1").await.unwrap());
        assert!(!svc.find(orbit, user, "c1").await.unwrap().unwrap().is_active());
        assert!(!svc.revoke(orbit, user, "c1").await.unwrap());
    }
}
