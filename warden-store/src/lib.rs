//! The transactional KV facade and id sequence the rest of the task
//! scheduler is built on: conditional single-item writes guarded by a small
//! predicate algebra, and paged secondary-index scans. Two backends ship
//! here — an in-memory one (always available) and a Redis one (behind the
//! `redis-backend` feature) — but nothing above this crate should know
//! which one is in use.

mod config;
mod error;
mod kv_store;
mod memory;
mod page;
mod predicate;
#[cfg(feature = "redis-backend")]
mod redis_store;
mod schema;

pub use config::{StoreBackend, StoreConfig};
pub use error::{StoreError, StoreResult};
pub use kv_store::{KvStore, Sequence};
pub use memory::{InMemorySequence, InMemoryStore};
pub use page::{FullScanRequest, Page, PageToken, ScanRequest};
pub use predicate::Predicate;
#[cfg(feature = "redis-backend")]
pub use redis_store::{RedisSequence, RedisStore};
pub use schema::{AttrValue, IndexDef, Item, Table, LOCK_INDICES, TASK_INDICES};

use std::sync::Arc;

/// Build the `KvStore` named by a [`StoreConfig`]. Returns a trait object so
/// callers never have to name the concrete backend type.
pub fn open_store(config: &StoreConfig) -> StoreResult<Arc<dyn KvStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(InMemoryStore::new())),
        #[cfg(feature = "redis-backend")]
        StoreBackend::Redis => {
            let url = config.redis_url.as_deref().ok_or_else(|| {
                StoreError::Transport("redis backend selected without redis_url".into())
            })?;
            Ok(Arc::new(RedisStore::new(url)?))
        }
        #[cfg(not(feature = "redis-backend"))]
        StoreBackend::Redis => Err(StoreError::Transport(
            "redis backend requested but warden-store was built without the redis-backend feature"
                .into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_store_defaults_to_memory() {
        let store = open_store(&StoreConfig::memory()).unwrap();
        store
            .put(Table::Tasks, "t1", None, Item::new(), Predicate::Always)
            .await
            .unwrap();
        assert!(store.get(Table::Tasks, "t1", None).await.unwrap().is_some());
    }
}
