use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use super::store::{Store, StoreResult};

/// Narrow capability: the role ids to embed in a user's access token.
#[async_trait]
pub trait RoleLookup: Send + Sync {
    async fn role_ids(&self, orbit_id: Uuid, user_id: Uuid) -> StoreResult<Vec<String>>;
}

/// Role lookup backed by the persistent store.
pub struct StoreRoleLookup {
    store: Arc<dyn Store>,
}

impl StoreRoleLookup {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RoleLookup for StoreRoleLookup {
    async fn role_ids(&self, orbit_id: Uuid, user_id: Uuid) -> StoreResult<Vec<String>> {
        self.store.role_ids_for_user(orbit_id, user_id).await
    }
}
