//! Runtime configuration for the session coordinator.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, SessionError};
use crate::logging::LogConfig;
use crate::security::SecureString;

/// Tunables for cache, rate limiting, dataset lifetime and paging.
///
/// Built with the `with_*` setters or loaded from the environment with
/// [`SessionConfig::from_env`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    cache_ttl: Duration,
    cache_max_entries: usize,
    rate_window: Duration,
    rate_max_requests: usize,
    dataset_max_age: Duration,
    sweep_interval: Duration,
    default_page_size: usize,
    max_page_size: usize,
    max_upload_bytes: u64,
    llm_timeout: Duration,
    analysis_row_limit: usize,
    materialize_full_tables: bool,
    api_key: Option<SecureString>,
    test_mode: bool,
    log: LogConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(600),
            cache_max_entries: 256,
            rate_window: Duration::from_secs(60),
            rate_max_requests: 60,
            dataset_max_age: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
            default_page_size: 1000,
            max_page_size: 5000,
            max_upload_bytes: 100 * 1024 * 1024,
            llm_timeout: Duration::from_secs(60),
            analysis_row_limit: 100,
            materialize_full_tables: true,
            api_key: None,
            test_mode: false,
            log: LogConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through `lookup`, falling back to defaults for unset keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(secs) = parse_var::<u64, _>(&lookup, "ANALYSIS_CACHE_TTL_SEC")? {
            config.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(max) = parse_var(&lookup, "ANALYSIS_CACHE_MAX")? {
            config.cache_max_entries = max;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "RATE_LIMIT_WINDOW_SEC")? {
            config.rate_window = Duration::from_secs(secs);
        }
        if let Some(max) = parse_var(&lookup, "RATE_LIMIT_MAX_REQ")? {
            config.rate_max_requests = max;
        }
        if let Some(minutes) = parse_var::<u64, _>(&lookup, "TEMP_CLEANUP_AGE_MIN")? {
            let secs = minutes.checked_mul(60).ok_or_else(|| {
                SessionError::configuration(format!(
                    "TEMP_CLEANUP_AGE_MIN={minutes} is too large"
                ))
            })?;
            config.dataset_max_age = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "LLM_TIMEOUT_SEC")? {
            config.llm_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "SWEEP_INTERVAL_SEC")? {
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(key) = lookup("API_KEY").filter(|key| !key.is_empty()) {
            config.api_key = Some(SecureString::new(key));
        }
        if let Some(flag) = lookup("TEST_MODE") {
            config.test_mode = matches!(flag.trim().to_lowercase().as_str(), "true" | "1");
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejects settings that would make a component unusable.
    pub fn validate(&self) -> Result<()> {
        if self.cache_max_entries == 0 {
            return Err(SessionError::configuration(
                "cache max entries must be positive",
            ));
        }
        if self.cache_ttl.is_zero() {
            return Err(SessionError::configuration("cache TTL must be positive"));
        }
        if self.rate_max_requests == 0 || self.rate_window.is_zero() {
            return Err(SessionError::configuration(
                "rate limit window and max requests must be positive",
            ));
        }
        if self.max_page_size == 0 || self.default_page_size == 0 {
            return Err(SessionError::configuration("page sizes must be positive"));
        }
        if self.default_page_size > self.max_page_size {
            return Err(SessionError::configuration(format!(
                "default page size {} exceeds maximum {}",
                self.default_page_size, self.max_page_size
            )));
        }
        if self.sweep_interval.is_zero() {
            return Err(SessionError::configuration("sweep interval must be positive"));
        }
        Ok(())
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_cache_max_entries(mut self, max: usize) -> Self {
        self.cache_max_entries = max;
        self
    }

    /// Set the sliding window and the number of requests admitted per window.
    pub fn with_rate_limit(mut self, window: Duration, max_requests: usize) -> Self {
        self.rate_window = window;
        self.rate_max_requests = max_requests;
        self
    }

    /// Set the age after which the sweep evicts a dataset.
    pub fn with_dataset_max_age(mut self, age: Duration) -> Self {
        self.dataset_max_age = age;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_default_page_size(mut self, size: usize) -> Self {
        self.default_page_size = size;
        self
    }

    pub fn with_max_page_size(mut self, size: usize) -> Self {
        self.max_page_size = size;
        self
    }

    pub fn with_max_upload_bytes(mut self, bytes: u64) -> Self {
        self.max_upload_bytes = bytes;
        self
    }

    pub fn with_llm_timeout(mut self, timeout: Duration) -> Self {
        self.llm_timeout = timeout;
        self
    }

    /// Set how many rows of a table slice are sent for analysis.
    pub fn with_analysis_row_limit(mut self, rows: usize) -> Self {
        self.analysis_row_limit = rows;
        self
    }

    /// Keep fully read Excel/PDF tables in memory for repeat paging.
    pub fn with_materialize_full_tables(mut self, enabled: bool) -> Self {
        self.materialize_full_tables = enabled;
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(SecureString::new(key.into()));
        self
    }

    pub fn with_test_mode(mut self, enabled: bool) -> Self {
        self.test_mode = enabled;
        self
    }

    pub fn with_log_config(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }

    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    pub fn cache_max_entries(&self) -> usize {
        self.cache_max_entries
    }

    pub fn rate_window(&self) -> Duration {
        self.rate_window
    }

    pub fn rate_max_requests(&self) -> usize {
        self.rate_max_requests
    }

    pub fn dataset_max_age(&self) -> Duration {
        self.dataset_max_age
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    pub fn default_page_size(&self) -> usize {
        self.default_page_size
    }

    pub fn max_page_size(&self) -> usize {
        self.max_page_size
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_bytes
    }

    pub fn llm_timeout(&self) -> Duration {
        self.llm_timeout
    }

    pub fn analysis_row_limit(&self) -> usize {
        self.analysis_row_limit
    }

    pub fn materialize_full_tables(&self) -> bool {
        self.materialize_full_tables
    }

    /// Get the API key.
    ///
    /// # Security
    /// Returns a reference to the secure string. Avoid storing or logging the
    /// exposed value.
    pub fn api_key(&self) -> Option<&SecureString> {
        self.api_key.as_ref()
    }

    pub fn test_mode(&self) -> bool {
        self.test_mode
    }

    pub fn log(&self) -> &LogConfig {
        &self.log
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            SessionError::configuration(format!("{name}={raw:?} is not valid: {e}"))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.cache_ttl(), Duration::from_secs(600));
        assert_eq!(config.cache_max_entries(), 256);
        assert_eq!(config.rate_window(), Duration::from_secs(60));
        assert_eq!(config.rate_max_requests(), 60);
        assert_eq!(config.dataset_max_age(), Duration::from_secs(1800));
        assert_eq!(config.default_page_size(), 1000);
        assert_eq!(config.max_page_size(), 5000);
        assert_eq!(config.max_upload_bytes(), 100 * 1024 * 1024);
        assert!(config.api_key().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_session_config_builder() {
        let config = SessionConfig::new()
            .with_cache_ttl(Duration::from_secs(5))
            .with_rate_limit(Duration::from_secs(1), 2)
            .with_api_key("k")
            .with_test_mode(true);

        assert_eq!(config.cache_ttl(), Duration::from_secs(5));
        assert_eq!(config.rate_max_requests(), 2);
        assert_eq!(config.api_key().map(SecureString::expose), Some("k"));
        assert!(config.test_mode());
    }

    #[test]
    fn test_from_lookup_reads_variables() {
        let config = SessionConfig::from_lookup(lookup_from(&[
            ("ANALYSIS_CACHE_TTL_SEC", "30"),
            ("ANALYSIS_CACHE_MAX", "8"),
            ("RATE_LIMIT_MAX_REQ", "5"),
            ("TEMP_CLEANUP_AGE_MIN", "2"),
            ("API_KEY", "secret"),
            ("TEST_MODE", "True"),
        ]))
        .unwrap();

        assert_eq!(config.cache_ttl(), Duration::from_secs(30));
        assert_eq!(config.cache_max_entries(), 8);
        assert_eq!(config.rate_max_requests(), 5);
        assert_eq!(config.dataset_max_age(), Duration::from_secs(120));
        assert!(config.api_key().is_some());
        assert!(config.test_mode());
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = SessionConfig::from_lookup(lookup_from(&[("RATE_LIMIT_MAX_REQ", "lots")]))
            .unwrap_err();
        assert!(matches!(err, SessionError::Configuration { .. }));
        assert!(err.to_string().contains("RATE_LIMIT_MAX_REQ"));
    }

    #[test]
    fn test_from_lookup_rejects_overflowing_cleanup_age() {
        let minutes = u64::MAX.to_string();
        let err = SessionConfig::from_lookup(lookup_from(&[("TEMP_CLEANUP_AGE_MIN", minutes.as_str())]))
            .unwrap_err();
        assert!(matches!(err, SessionError::Configuration { .. }));
        assert!(err.to_string().contains("TEMP_CLEANUP_AGE_MIN"));
    }

    #[test]
    fn test_validate_rejects_inconsistent_paging() {
        let config = SessionConfig::new()
            .with_default_page_size(6000)
            .with_max_page_size(5000);
        assert!(config.validate().is_err());

        assert!(SessionConfig::new().with_cache_max_entries(0).validate().is_err());
    }

    #[test]
    fn test_api_key_not_leaked_in_debug() {
        let config = SessionConfig::new().with_api_key("super-secret-api-key-12345");
        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains("super-secret-api-key-12345"));
        assert!(debug_output.contains("SecureString(***)"));
    }
}
