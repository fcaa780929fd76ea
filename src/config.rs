//! Configuration Module
//!
//! Handles loading and managing cache configuration from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// One year, the default lifetime of a positive cache entry.
pub const DEFAULT_BASE_TTL: u64 = 365 * 24 * 60 * 60;

/// Cache configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Base TTL in seconds for positive entries (0 = never expire)
    pub default_ttl: u64,
    /// TTL in seconds for tombstone keys
    pub tombstone_ttl: u64,
    /// Upper bound (inclusive) of the random jitter added to every TTL
    pub ttl_jitter: u64,
    /// TTL in seconds of a rebuild lock key
    pub lock_ttl: u64,
    /// Lock acquisition attempts before giving up
    pub lock_tries: u32,
    /// Backoff between lock attempts in milliseconds
    pub lock_retry_ms: u64,
    /// Redis connection URL, memory store when unset
    pub redis_url: Option<String>,
    /// Memory store expiry sweep interval in seconds
    pub sweep_interval: u64,
}

impl CacheConfig {
    /// Creates a new CacheConfig by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_DEFAULT_TTL` - Base TTL in seconds (default: one year)
    /// - `CACHE_TOMBSTONE_TTL` - Tombstone TTL (default: 60)
    /// - `CACHE_TTL_JITTER` - Max jitter in seconds (default: 10)
    /// - `CACHE_LOCK_TTL` - Lock key TTL (default: 5)
    /// - `CACHE_LOCK_TRIES` - Lock attempts (default: 10)
    /// - `CACHE_LOCK_RETRY_MS` - Lock backoff (default: 100)
    /// - `REDIS_URL` - Redis URL (default: unset, memory store)
    /// - `SWEEP_INTERVAL` - Memory store sweep frequency in seconds (default: 1)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_ttl: env_or("CACHE_DEFAULT_TTL", defaults.default_ttl),
            tombstone_ttl: env_or("CACHE_TOMBSTONE_TTL", defaults.tombstone_ttl),
            ttl_jitter: env_or("CACHE_TTL_JITTER", defaults.ttl_jitter),
            lock_ttl: env_or("CACHE_LOCK_TTL", defaults.lock_ttl),
            lock_tries: env_or("CACHE_LOCK_TRIES", defaults.lock_tries),
            lock_retry_ms: env_or("CACHE_LOCK_RETRY_MS", defaults.lock_retry_ms),
            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),
            sweep_interval: env_or("SWEEP_INTERVAL", defaults.sweep_interval),
        }
    }

    /// Backoff between two lock attempts.
    pub fn lock_retry(&self) -> Duration {
        Duration::from_millis(self.lock_retry_ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_BASE_TTL,
            tombstone_ttl: 60,
            ttl_jitter: 10,
            lock_ttl: 5,
            lock_tries: 10,
            lock_retry_ms: 100,
            redis_url: None,
            sweep_interval: 1,
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = CacheConfig::default();
        assert_eq!(config.default_ttl, 31_536_000);
        assert_eq!(config.tombstone_ttl, 60);
        assert_eq!(config.ttl_jitter, 10);
        assert_eq!(config.lock_ttl, 5);
        assert_eq!(config.lock_tries, 10);
        assert_eq!(config.lock_retry(), Duration::from_millis(100));
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn test_config_from_env_defaults() {
        // Clear any existing env vars to test defaults
        env::remove_var("CACHE_DEFAULT_TTL");
        env::remove_var("CACHE_LOCK_TRIES");
        env::remove_var("REDIS_URL");

        let config = CacheConfig::from_env();
        assert_eq!(config.default_ttl, DEFAULT_BASE_TTL);
        assert_eq!(config.lock_tries, 10);
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn test_config_from_env_ignores_garbage() {
        env::set_var("CACHE_LOCK_RETRY_MS", "soon");
        let config = CacheConfig::from_env();
        assert_eq!(config.lock_retry_ms, 100);
        env::remove_var("CACHE_LOCK_RETRY_MS");
    }
}
