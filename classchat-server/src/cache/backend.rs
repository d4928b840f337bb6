use std::time::Duration;

use async_trait::async_trait;

use super::CacheError;

/// Per-key atomic primitives the read-state cache is built from.
///
/// Every operation touches exactly one key; there are no cross-key transactions.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Increments a counter and refreshes its TTL, returning the new value.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, CacheError>;

    /// Subtracts `by` from a counter; a counter at or below `by` is deleted instead.
    /// Returns the remaining value.
    async fn decr_or_delete(&self, key: &str, by: i64) -> Result<i64, CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    async fn get_i64(&self, key: &str) -> Result<Option<i64>, CacheError>;

    /// Writes `value` only when it is greater than the stored value (missing counts as 0),
    /// refreshing the TTL on success. Returns the replaced value when the write happened.
    async fn set_if_greater(&self, key: &str, value: i64, ttl: Duration)
    -> Result<Option<i64>, CacheError>;

    /// Overwrites a counter; values at or below zero delete the key.
    async fn set_counter(&self, key: &str, value: i64, ttl: Duration) -> Result<(), CacheError>;

    /// Adds a member to a set and refreshes its TTL. Returns whether the member was new.
    async fn set_add(&self, key: &str, member: i64, ttl: Duration) -> Result<bool, CacheError>;

    async fn set_members(&self, key: &str) -> Result<Vec<i64>, CacheError>;

    async fn set_card(&self, key: &str) -> Result<u64, CacheError>;

    async fn set_remove(&self, key: &str, members: &[i64]) -> Result<u64, CacheError>;

    /// One step of a non-blocking cursor scan; a returned cursor of 0 ends the iteration.
    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), CacheError>;

    async fn ping(&self) -> Result<(), CacheError>;
}
