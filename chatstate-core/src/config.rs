use std::fmt;
use std::time::Duration;

use crate::sweeper::DEFAULT_SWEEP_INTERVAL;
use crate::ttl::{ExpiryMode, TtlPolicy};
use crate::StoreError;

pub const DEFAULT_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_KEY_PREFIX: &str = "chatstate";
pub const DEFAULT_CHECKPOINT_COLLECTION: &str = "checkpoints";
pub const DEFAULT_STORE_COLLECTION: &str = "store";
pub const DEFAULT_LIST_PAGE_SIZE: usize = 50;
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

pub const ENV_URL: &str = "CHATSTATE_REDIS_URL";
pub const ENV_KEY_PREFIX: &str = "CHATSTATE_KEY_PREFIX";
pub const ENV_TTL_DAYS: &str = "CHATSTATE_TTL_DAYS";
pub const ENV_EXPIRY_MODE: &str = "CHATSTATE_EXPIRY_MODE";
pub const ENV_OPERATION_TIMEOUT_SECS: &str = "CHATSTATE_OPERATION_TIMEOUT_SECS";

/// Connection and layout settings shared by both stores.
///
/// Built once at startup and handed to the backend; nothing reads the
/// environment after that.
#[derive(Clone)]
pub struct StoreConfig {
    url: String,
    key_prefix: String,
    checkpoint_collection: String,
    store_collection: String,
    ttl_policy: TtlPolicy,
    list_page_size: usize,
    operation_timeout: Duration,
    sweep_interval: Duration,
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("url", &redact_url(&self.url))
            .field("key_prefix", &self.key_prefix)
            .field("checkpoint_collection", &self.checkpoint_collection)
            .field("store_collection", &self.store_collection)
            .field("ttl_policy", &self.ttl_policy)
            .field("list_page_size", &self.list_page_size)
            .field("operation_timeout", &self.operation_timeout)
            .field("sweep_interval", &self.sweep_interval)
            .finish()
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            checkpoint_collection: DEFAULT_CHECKPOINT_COLLECTION.to_string(),
            store_collection: DEFAULT_STORE_COLLECTION.to_string(),
            ttl_policy: TtlPolicy::default(),
            list_page_size: DEFAULT_LIST_PAGE_SIZE,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl StoreConfig {
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::new()
    }

    pub fn from_env() -> Result<Self, StoreError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the `CHATSTATE_*` variables through `lookup`; unset or blank
    /// variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, StoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let mut builder = StoreConfigBuilder::new();

        if let Some(url) = read(ENV_URL) {
            builder = builder.url(url);
        }
        if let Some(prefix) = read(ENV_KEY_PREFIX) {
            builder = builder.key_prefix(prefix);
        }
        if let Some(days) = read(ENV_TTL_DAYS) {
            let days: u64 = parse_number(ENV_TTL_DAYS, &days)?;
            builder = builder.ttl(Duration::from_secs(days.saturating_mul(24 * 60 * 60)));
        }
        if let Some(mode) = read(ENV_EXPIRY_MODE) {
            builder = builder.expiry_mode(mode.parse()?);
        }
        if let Some(secs) = read(ENV_OPERATION_TIMEOUT_SECS) {
            let secs: u64 = parse_number(ENV_OPERATION_TIMEOUT_SECS, &secs)?;
            builder = builder.operation_timeout(Duration::from_secs(secs));
        }

        builder.build()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub fn checkpoint_collection(&self) -> &str {
        &self.checkpoint_collection
    }

    pub fn store_collection(&self) -> &str {
        &self.store_collection
    }

    pub fn ttl_policy(&self) -> TtlPolicy {
        self.ttl_policy
    }

    pub fn list_page_size(&self) -> usize {
        self.list_page_size
    }

    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }
}

fn parse_number(name: &str, raw: &str) -> Result<u64, StoreError> {
    raw.trim().parse().map_err(|_| {
        StoreError::InvalidConfig(format!("{name} must be a whole number, got '{raw}'"))
    })
}

/// Hides the userinfo part (`user:password@`) of a connection URL.
pub fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    match rest.rsplit_once('@') {
        Some((_, host)) => format!("{scheme}://<redacted>@{host}"),
        None => url.to_string(),
    }
}

#[derive(Debug, Default, Clone)]
pub struct StoreConfigBuilder {
    url: Option<String>,
    key_prefix: Option<String>,
    checkpoint_collection: Option<String>,
    store_collection: Option<String>,
    ttl: Option<Duration>,
    expiry_mode: Option<ExpiryMode>,
    list_page_size: Option<usize>,
    operation_timeout: Option<Duration>,
    sweep_interval: Option<Duration>,
}

impl StoreConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn url(mut self, value: impl Into<String>) -> Self {
        self.url = Some(value.into());
        self
    }

    pub fn key_prefix(mut self, value: impl Into<String>) -> Self {
        self.key_prefix = Some(value.into());
        self
    }

    pub fn checkpoint_collection(mut self, value: impl Into<String>) -> Self {
        self.checkpoint_collection = Some(value.into());
        self
    }

    pub fn store_collection(mut self, value: impl Into<String>) -> Self {
        self.store_collection = Some(value.into());
        self
    }

    pub fn ttl(mut self, value: Duration) -> Self {
        self.ttl = Some(value);
        self
    }

    pub fn expiry_mode(mut self, value: ExpiryMode) -> Self {
        self.expiry_mode = Some(value);
        self
    }

    pub fn list_page_size(mut self, value: usize) -> Self {
        self.list_page_size = Some(value);
        self
    }

    pub fn operation_timeout(mut self, value: Duration) -> Self {
        self.operation_timeout = Some(value);
        self
    }

    pub fn sweep_interval(mut self, value: Duration) -> Self {
        self.sweep_interval = Some(value);
        self
    }

    pub fn build(self) -> Result<StoreConfig, StoreError> {
        let defaults = StoreConfig::default();

        let url = self.url.unwrap_or(defaults.url);
        if url.trim().is_empty() {
            return Err(StoreError::InvalidConfig("url must not be empty".to_string()));
        }

        let key_prefix = non_empty_name("key_prefix", self.key_prefix, defaults.key_prefix)?;
        let checkpoint_collection = non_empty_name(
            "checkpoint_collection",
            self.checkpoint_collection,
            defaults.checkpoint_collection,
        )?;
        let store_collection = non_empty_name(
            "store_collection",
            self.store_collection,
            defaults.store_collection,
        )?;
        if checkpoint_collection == store_collection {
            return Err(StoreError::InvalidConfig(format!(
                "checkpoint and store collections must differ, both are '{store_collection}'"
            )));
        }

        let ttl_policy = TtlPolicy::new(
            self.ttl.unwrap_or_else(|| defaults.ttl_policy.ttl()),
            self.expiry_mode.unwrap_or_default(),
        )?;

        let list_page_size = self.list_page_size.unwrap_or(defaults.list_page_size);
        if list_page_size == 0 {
            return Err(StoreError::InvalidConfig(
                "list_page_size must be greater than zero".to_string(),
            ));
        }

        let operation_timeout = self.operation_timeout.unwrap_or(defaults.operation_timeout);
        if operation_timeout.is_zero() {
            return Err(StoreError::InvalidConfig(
                "operation_timeout must be greater than zero".to_string(),
            ));
        }

        let sweep_interval = self.sweep_interval.unwrap_or(defaults.sweep_interval);
        if sweep_interval.is_zero() {
            return Err(StoreError::InvalidConfig(
                "sweep_interval must be greater than zero".to_string(),
            ));
        }

        Ok(StoreConfig {
            url,
            key_prefix,
            checkpoint_collection,
            store_collection,
            ttl_policy,
            list_page_size,
            operation_timeout,
            sweep_interval,
        })
    }
}

fn non_empty_name(
    field: &str,
    value: Option<String>,
    default: String,
) -> Result<String, StoreError> {
    let value = value.unwrap_or(default);
    if value.trim().is_empty() {
        return Err(StoreError::InvalidConfig(format!("{field} must not be empty")));
    }
    if value.contains(|c: char| matches!(c, '{' | '}' | '*' | '?' | ' ') || c.is_control()) {
        return Err(StoreError::InvalidConfig(format!(
            "{field} contains characters invalid in keys: {value:?}"
        )));
    }
    Ok(value)
}
