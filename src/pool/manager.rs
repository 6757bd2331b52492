//! Pool registry owned by one cache instance.

use std::sync::Arc;

use tracing::info;

use super::array_pool::{ArrayPool, BufferPool};
use super::fake::{FakeArrayPool, FakePool};
use super::lease::{Lease, ObjectPoolKind, Pool, PoolOwned};
use super::object_pool::{ObjectPool, ObjectPoolOptions};
use super::stats::PoolStats;
use super::string_pool::StringPool;
use crate::config::PoolingConfig;
use crate::engine::{OperationContext, ResponseEnvelope};

/// Every pool used on the request path of one cache instance.
///
/// Real or fake variants are chosen once at construction.
pub struct PoolManager {
    fake: bool,
    buffers: Arc<dyn BufferPool>,
    operation_contexts: Arc<dyn Pool<OperationContext>>,
    responses: Arc<dyn Pool<ResponseEnvelope>>,
    strings: StringPool,
}

impl PoolManager {
    pub fn new(config: &PoolingConfig) -> Self {
        if !config.enabled {
            return Self::fake();
        }

        let options = ObjectPoolOptions::from(config);
        info!(
            initial_capacity = options.initial_capacity,
            max_capacity = options.max_capacity,
            "Creating growable object pools"
        );
        Self {
            fake: false,
            buffers: Arc::new(ArrayPool::new(config.buffers_per_bucket)),
            operation_contexts: Arc::new(ObjectPool::new(
                ObjectPoolKind::OperationContext.name(),
                options.clone(),
            )),
            responses: Arc::new(ObjectPool::new(
                ObjectPoolKind::ResponseEnvelope.name(),
                options,
            )),
            strings: StringPool::new(true),
        }
    }

    /// Manager whose pools allocate on rent and drop on return
    pub fn fake() -> Self {
        Self {
            fake: true,
            buffers: Arc::new(FakeArrayPool::new()),
            operation_contexts: Arc::new(FakePool::new(ObjectPoolKind::OperationContext.name())),
            responses: Arc::new(FakePool::new(ObjectPoolKind::ResponseEnvelope.name())),
            strings: StringPool::new(false),
        }
    }

    pub fn is_fake(&self) -> bool {
        self.fake
    }

    /// Rent from the pool that owns `T`
    pub fn rent<T: PoolOwned>(&self) -> Lease<T> {
        T::owning_pool(self).rent()
    }

    pub fn give_back<T: PoolOwned>(&self, lease: Lease<T>) {
        T::owning_pool(self).give_back(lease)
    }

    pub fn buffers(&self) -> &dyn BufferPool {
        self.buffers.as_ref()
    }

    pub fn strings(&self) -> &StringPool {
        &self.strings
    }

    pub fn operation_contexts(&self) -> &dyn Pool<OperationContext> {
        self.operation_contexts.as_ref()
    }

    pub fn responses(&self) -> &dyn Pool<ResponseEnvelope> {
        self.responses.as_ref()
    }

    /// Reset every pool to its initial state
    pub fn clear(&self) {
        self.buffers.clear();
        self.operation_contexts.clear();
        self.responses.clear();
        self.strings.clear();
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            fake: self.fake,
            object_pools: vec![
                self.operation_contexts.stats(),
                self.responses.stats(),
            ],
            array_pool: self.buffers.stats(),
            string_pool: self.strings.stats(),
        }
    }
}

impl Default for PoolManager {
    fn default() -> Self {
        Self::new(&PoolingConfig::default())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rent_by_owner_type() {
        let manager = PoolManager::default();
        let mut operation: Lease<OperationContext> = manager.rent();
        operation.client_id.push_str("client-1");
        operation.key = Some("a".into());
        manager.give_back(operation);

        let operation: Lease<OperationContext> = manager.rent();
        assert!(operation.client_id.is_empty());
        assert!(operation.key.is_none());
        let stats = manager.stats();
        assert!(!stats.fake);
        assert_eq!(stats.object_pools.len(), ObjectPoolKind::ALL.len());
    }

    #[test]
    fn test_disabled_pooling_uses_fakes() {
        let config = PoolingConfig {
            enabled: false,
            ..Default::default()
        };
        let manager = PoolManager::new(&config);
        assert!(manager.is_fake());

        let lease: Lease<ResponseEnvelope> = manager.rent();
        assert!(lease.is_out_of_pool());
        manager.give_back(lease);
        assert!(manager.stats().object_pools.iter().all(|p| p.fake));
    }

    #[test]
    fn test_clear_resets_all_pools() {
        let manager = PoolManager::default();
        let buf = manager.buffers().rent(64);
        manager.buffers().give_back(buf);
        let _key = manager.strings().intern("k");
        manager.clear();

        let stats = manager.stats();
        assert!(stats.array_pool.buckets.iter().all(|b| b.available == 0));
        assert_eq!(stats.string_pool.interned, 0);
    }
}
