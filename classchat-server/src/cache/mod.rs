//! Volatile cache tier holding unread counters, read pointers and seen-by sets.

pub mod backend;
pub mod keys;
pub mod memory;
pub mod read_state;
pub mod redis_backend;
pub mod seen_by;

use std::{sync::Arc, time::Duration};

use shared::config::server::CacheConfig;
use thiserror::Error;
use tracing::info;

pub use backend::CacheBackend;
pub use keys::{CacheKeys, SeenKey};
pub use read_state::ReadStateCache;
pub use seen_by::SeenByTracker;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    #[error("cache operation '{0}' timed out")]
    Timeout(&'static str),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Connects the configured backend: Redis when enabled, otherwise the in-process store.
///
/// # Errors
/// Returns [`CacheError`] when the Redis client cannot be created or the first connection fails.
pub async fn connect_backend(config: &CacheConfig) -> Result<Arc<dyn CacheBackend>, CacheError> {
    if config.enabled {
        let backend = redis_backend::RedisBackend::connect(
            &config.url,
            Duration::from_millis(config.op_timeout_ms),
        )
        .await?;
        info!(url = %config.url, "connected redis cache backend");
        Ok(Arc::new(backend))
    } else {
        info!("cache disabled; using in-process memory backend");
        Ok(Arc::new(memory::MemoryBackend::new()))
    }
}
