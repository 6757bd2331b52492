//! Runtime context of one cache instance.
//!
//! Everything a component needs from its surroundings is passed down from
//! here at construction time; nothing is reached through process globals, so
//! several instances can share a process.

use std::sync::Arc;

use tracing::info;

use crate::config::CacheConfig;
use crate::error::Result;
use crate::monitoring::{ApiLogger, CacheMetrics};
use crate::pool::PoolManager;
use crate::serialization::{SerializationContext, SurrogateSelector};
use crate::storage::{
    format_service, Clock, CompressionManager, DataFormatService, PayloadCodec, SystemClock,
};

#[derive(Clone)]
pub struct RuntimeContext {
    pub config: Arc<CacheConfig>,
    pub clock: Arc<dyn Clock>,
    pub pools: Arc<PoolManager>,
    pub selector: Arc<SurrogateSelector>,
    pub serialization: SerializationContext,
    pub format: Arc<dyn DataFormatService>,
    pub metrics: Arc<CacheMetrics>,
    pub api_log: Arc<ApiLogger>,
}

impl RuntimeContext {
    /// Validate `config` and build the shared services
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// As [`RuntimeContext::new`] with an injected clock
    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let pools = Arc::new(PoolManager::new(&config.pooling));
        let selector = Arc::new(SurrogateSelector::new());
        let serialization = SerializationContext::new(config.cache_name.clone());
        let codec = PayloadCodec::new(
            selector.clone(),
            serialization.clone(),
            pools.clone(),
            CompressionManager::new(&config.compression),
        );
        let format = format_service(config.data_format, config.deployment, codec);
        let metrics = Arc::new(CacheMetrics::new(&config.cache_name)?);
        let api_log = Arc::new(ApiLogger::new(&config.api_log));

        info!(
            cache = %config.cache_name,
            topology = %config.topology,
            data_format = ?config.data_format,
            deployment = ?config.deployment,
            pooling = !pools.is_fake(),
            "Runtime context created"
        );

        Ok(Self {
            config,
            clock,
            pools,
            selector,
            serialization,
            format,
            metrics,
            api_log,
        })
    }

    pub fn cache_name(&self) -> &str {
        &self.config.cache_name
    }
}

// =============================================================================
// Tests
// =============================================================================
