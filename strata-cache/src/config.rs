//! Cache configuration.
//!
//! Configuration comes from the environment ([`CacheConfig::from_env`]) or a
//! TOML document ([`CacheConfig::from_toml_str`]). Durations are written in
//! milliseconds:
//!
//! ```toml
//! default_ttl_ms = 300000
//! max_entries = 1000
//! layers = ["memory", "remote"]
//! namespace = "app"
//! schema_version = "2025-01-31"
//!
//! [remote]
//! host = "cache.internal"
//! port = 6379
//! max_retries = 5
//! circuit_breaker_timeout_ms = 60000
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{CacheError, CacheResult};
use crate::key::KeyNamespace;
use crate::layer::LayerKind;
use crate::memory::DEFAULT_MAX_ENTRIES;
use crate::remote::{BreakerConfig, ResilienceSettings};

/// Default TTL when a write does not specify one.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);
/// Default expiry sweep period.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);
/// Default TTL jitter fraction.
pub const DEFAULT_JITTER_PCT: f64 = 0.10;
/// Default lifetime of negative-cache markers.
pub const DEFAULT_NEGATIVE_TTL: Duration = Duration::from_secs(30);

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Whether the cache runs in this process or behind an HTTP endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheMode {
    /// Layers live in this process.
    #[default]
    InProcess,
    /// Forward every call to a cache service.
    Proxy(ProxyConfig),
}

/// Where the proxy implementation sends requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Base URL of the cache service, e.g. `http://cache.internal:8080`.
    pub url: String,
    /// Request timeout.
    #[serde(rename = "timeout_ms", with = "millis", default = "ProxyConfig::default_timeout")]
    pub timeout: Duration,
}

impl ProxyConfig {
    /// Proxy to `url` with the default timeout.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Self::default_timeout(),
        }
    }

    fn default_timeout() -> Duration {
        Duration::from_secs(2)
    }
}

/// Remote-tier connection and resilience settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Host name.
    pub host: String,
    /// Port.
    pub port: u16,
    /// ACL user name.
    pub username: Option<String>,
    /// Password.
    pub password: Option<String>,
    /// Database index.
    pub database: i64,
    /// Prefix added to every remote key.
    pub key_prefix: String,
    /// Consecutive connect failures before the circuit opens.
    pub max_retries: u32,
    /// How long the circuit stays open before probing.
    #[serde(rename = "circuit_breaker_timeout_ms", with = "millis")]
    pub circuit_breaker_timeout: Duration,
    /// Base reconnect backoff.
    #[serde(rename = "base_delay_ms", with = "millis")]
    pub base_delay: Duration,
    /// Reconnect backoff cap.
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
    /// Connect deadline.
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
    /// Per-command deadline.
    #[serde(rename = "command_timeout_ms", with = "millis")]
    pub command_timeout: Duration,
    /// Keep-alive ping period.
    #[serde(rename = "keepalive_interval_ms", with = "millis")]
    pub keepalive_interval: Duration,
    /// Minimum spacing of outage warnings.
    #[serde(rename = "log_interval_ms", with = "millis")]
    pub log_interval: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        let breaker = BreakerConfig::default();
        let resilience = ResilienceSettings::default();
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            username: None,
            password: None,
            database: 0,
            key_prefix: String::new(),
            max_retries: breaker.max_retries,
            circuit_breaker_timeout: breaker.circuit_breaker_timeout,
            base_delay: breaker.base_delay,
            max_delay: breaker.max_delay,
            connect_timeout: resilience.connect_timeout,
            command_timeout: resilience.command_timeout,
            keepalive_interval: resilience.keepalive_interval,
            log_interval: resilience.log_interval,
        }
    }
}

impl RemoteConfig {
    /// Set host and port.
    pub fn with_address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Set credentials.
    pub fn with_credentials(
        mut self,
        username: Option<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username;
        self.password = Some(password.into());
        self
    }

    /// Set the database index.
    pub fn with_database(mut self, database: i64) -> Self {
        self.database = database;
        self
    }

    /// Set the breaker retry count and open window.
    pub fn with_breaker(mut self, max_retries: u32, timeout: Duration) -> Self {
        self.max_retries = max_retries;
        self.circuit_breaker_timeout = timeout;
        self
    }

    /// Resilience settings derived from this config.
    pub fn resilience(&self) -> ResilienceSettings {
        ResilienceSettings {
            breaker: BreakerConfig {
                max_retries: self.max_retries,
                circuit_breaker_timeout: self.circuit_breaker_timeout,
                base_delay: self.base_delay,
                max_delay: self.max_delay,
            },
            connect_timeout: self.connect_timeout,
            command_timeout: self.command_timeout,
            keepalive_interval: self.keepalive_interval,
            log_interval: self.log_interval,
        }
    }
}

/// Top-level cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL for writes that do not set one.
    #[serde(rename = "default_ttl_ms", with = "millis")]
    pub default_ttl: Duration,
    /// Memory-tier capacity.
    pub max_entries: usize,
    /// Expiry sweep period.
    #[serde(rename = "sweep_interval_ms", with = "millis")]
    pub sweep_interval: Duration,
    /// Layers in read order.
    pub layers: Vec<LayerKind>,
    /// Key namespace.
    pub namespace: String,
    /// Schema version baked into keys.
    pub schema_version: String,
    /// TTL jitter fraction used by `remember`.
    pub jitter_pct: f64,
    /// Lifetime of negative-cache markers.
    #[serde(rename = "negative_ttl_ms", with = "millis")]
    pub negative_ttl: Duration,
    /// In-process or proxy.
    pub mode: CacheMode,
    /// Remote tier settings.
    pub remote: RemoteConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_TTL,
            max_entries: DEFAULT_MAX_ENTRIES,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            layers: vec![LayerKind::Memory, LayerKind::Remote],
            namespace: "app".to_string(),
            schema_version: "v1".to_string(),
            jitter_pct: DEFAULT_JITTER_PCT,
            negative_ttl: DEFAULT_NEGATIVE_TTL,
            mode: CacheMode::InProcess,
            remote: RemoteConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Memory-only configuration.
    pub fn memory_only() -> Self {
        Self {
            layers: vec![LayerKind::Memory],
            ..Self::default()
        }
    }

    /// Set the default TTL.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the memory-tier capacity.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Set the layer order.
    pub fn with_layers(mut self, layers: Vec<LayerKind>) -> Self {
        self.layers = layers;
        self
    }

    /// Set namespace and schema version.
    pub fn with_namespace(
        mut self,
        namespace: impl Into<String>,
        schema_version: impl Into<String>,
    ) -> Self {
        self.namespace = namespace.into();
        self.schema_version = schema_version.into();
        self
    }

    /// Set remote tier settings.
    pub fn with_remote(mut self, remote: RemoteConfig) -> Self {
        self.remote = remote;
        self
    }

    /// Route everything through a cache service.
    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.mode = CacheMode::Proxy(proxy);
        self
    }

    /// Key namespace built from this config.
    pub fn key_namespace(&self) -> KeyNamespace {
        KeyNamespace::new(&self.namespace, &self.schema_version)
    }

    /// Whether the remote tier is configured.
    pub fn uses_remote(&self) -> bool {
        self.layers.contains(&LayerKind::Remote)
    }

    /// Parse a TOML document and validate it.
    pub fn from_toml_str(s: &str) -> CacheResult<Self> {
        let config: Self = toml::from_str(s).map_err(|e| CacheError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `STRATA_*` environment variables, falling back to defaults.
    pub fn from_env() -> CacheResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> CacheResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            name: &str,
        ) -> CacheResult<Option<T>> {
            match lookup(name) {
                None => Ok(None),
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map(Some)
                    .map_err(|_| CacheError::config(format!("{name}: cannot parse {raw:?}"))),
            }
        }
        let ms = |name: &str| parsed::<u64>(&lookup, name).map(|v| v.map(Duration::from_millis));

        let mut config = Self::default();
        if let Some(v) = ms("STRATA_DEFAULT_TTL_MS")? {
            config.default_ttl = v;
        }
        if let Some(v) = parsed(&lookup, "STRATA_MAX_ENTRIES")? {
            config.max_entries = v;
        }
        if let Some(v) = ms("STRATA_SWEEP_INTERVAL_MS")? {
            config.sweep_interval = v;
        }
        if let Some(raw) = lookup("STRATA_LAYERS") {
            config.layers = raw
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(str::parse)
                .collect::<CacheResult<_>>()?;
        }
        if let Some(v) = lookup("STRATA_NAMESPACE") {
            config.namespace = v;
        }
        if let Some(v) = lookup("STRATA_SCHEMA_VERSION") {
            config.schema_version = v;
        }
        if let Some(v) = parsed(&lookup, "STRATA_JITTER_PCT")? {
            config.jitter_pct = v;
        }
        if let Some(v) = ms("STRATA_NEGATIVE_TTL_MS")? {
            config.negative_ttl = v;
        }
        if let Some(url) = lookup("STRATA_PROXY_URL") {
            let mut proxy = ProxyConfig::new(url);
            if let Some(v) = ms("STRATA_PROXY_TIMEOUT_MS")? {
                proxy.timeout = v;
            }
            config.mode = CacheMode::Proxy(proxy);
        }

        let remote = &mut config.remote;
        if let Some(v) = lookup("STRATA_REDIS_HOST") {
            remote.host = v;
        }
        if let Some(v) = parsed(&lookup, "STRATA_REDIS_PORT")? {
            remote.port = v;
        }
        remote.username = lookup("STRATA_REDIS_USERNAME").or(remote.username.take());
        remote.password = lookup("STRATA_REDIS_PASSWORD").or(remote.password.take());
        if let Some(v) = parsed(&lookup, "STRATA_REDIS_DB")? {
            remote.database = v;
        }
        if let Some(v) = lookup("STRATA_REDIS_KEY_PREFIX") {
            remote.key_prefix = v;
        }
        if let Some(v) = parsed(&lookup, "STRATA_REDIS_MAX_RETRIES")? {
            remote.max_retries = v;
        }
        if let Some(v) = ms("STRATA_REDIS_CIRCUIT_TIMEOUT_MS")? {
            remote.circuit_breaker_timeout = v;
        }
        if let Some(v) = ms("STRATA_REDIS_BASE_DELAY_MS")? {
            remote.base_delay = v;
        }
        if let Some(v) = ms("STRATA_REDIS_MAX_DELAY_MS")? {
            remote.max_delay = v;
        }
        if let Some(v) = ms("STRATA_REDIS_CONNECT_TIMEOUT_MS")? {
            remote.connect_timeout = v;
        }
        if let Some(v) = ms("STRATA_REDIS_COMMAND_TIMEOUT_MS")? {
            remote.command_timeout = v;
        }
        if let Some(v) = ms("STRATA_REDIS_KEEPALIVE_MS")? {
            remote.keepalive_interval = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> CacheResult<()> {
        if self.max_entries == 0 {
            return Err(CacheError::config("max_entries must be at least 1"));
        }
        if self.default_ttl.is_zero() {
            return Err(CacheError::config("default_ttl must be positive"));
        }
        if self.sweep_interval.is_zero() {
            return Err(CacheError::config("sweep_interval must be positive"));
        }
        if !(0.0..1.0).contains(&self.jitter_pct) {
            return Err(CacheError::config("jitter_pct must be in [0, 1)"));
        }
        if self.namespace.is_empty() || self.schema_version.is_empty() {
            return Err(CacheError::config(
                "namespace and schema_version must not be empty",
            ));
        }
        if self.namespace.contains(':') || self.schema_version.contains(':') {
            return Err(CacheError::config(
                "namespace and schema_version must not contain ':'",
            ));
        }
        match &self.mode {
            CacheMode::InProcess if self.layers.is_empty() => {
                Err(CacheError::config("at least one cache layer is required"))
            }
            CacheMode::Proxy(proxy) => url::Url::parse(&proxy.url)
                .map(|_| ())
                .map_err(|e| CacheError::config(format!("invalid proxy url {:?}: {e}", proxy.url))),
            CacheMode::InProcess => {
                let mut seen = Vec::with_capacity(self.layers.len());
                for layer in &self.layers {
                    if seen.contains(layer) {
                        return Err(CacheError::config(format!("layer {layer} listed twice")));
                    }
                    seen.push(*layer);
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_ttl, DEFAULT_TTL);
        assert_eq!(config.layers, vec![LayerKind::Memory, LayerKind::Remote]);
        assert_eq!(config.remote.resilience().breaker.max_retries, 5);
    }

    #[test]
    fn test_from_lookup() {
        let config = CacheConfig::from_lookup(lookup(&[
            ("STRATA_DEFAULT_TTL_MS", "60000"),
            ("STRATA_MAX_ENTRIES", "2"),
            ("STRATA_LAYERS", "memory"),
            ("STRATA_NAMESPACE", "shop"),
            ("STRATA_SCHEMA_VERSION", "2025-01-31"),
            ("STRATA_REDIS_HOST", "cache.internal"),
            ("STRATA_REDIS_PASSWORD", "hunter2"),
            ("STRATA_REDIS_DB", "3"),
            ("STRATA_REDIS_CIRCUIT_TIMEOUT_MS", "1500"),
        ]))
        .unwrap();

        assert_eq!(config.default_ttl, Duration::from_secs(60));
        assert_eq!(config.max_entries, 2);
        assert_eq!(config.layers, vec![LayerKind::Memory]);
        assert_eq!(
            config.key_namespace().key("product", 1).as_str(),
            "shop:2025-01-31:product:1"
        );
        assert_eq!(config.remote.host, "cache.internal");
        assert_eq!(config.remote.password.as_deref(), Some("hunter2"));
        assert_eq!(config.remote.database, 3);
        assert_eq!(
            config.remote.circuit_breaker_timeout,
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = CacheConfig::from_lookup(lookup(&[("STRATA_MAX_ENTRIES", "lots")])).unwrap_err();
        assert!(err.to_string().contains("STRATA_MAX_ENTRIES"));
        assert!(CacheConfig::from_lookup(lookup(&[("STRATA_LAYERS", "memory,disk")])).is_err());
    }

    #[test]
    fn test_proxy_from_lookup() {
        let config =
            CacheConfig::from_lookup(lookup(&[("STRATA_PROXY_URL", "http://cache:8080")])).unwrap();
        assert_eq!(config.mode, CacheMode::Proxy(ProxyConfig::new("http://cache:8080")));
    }

    #[test]
    fn test_from_toml() {
        let config = CacheConfig::from_toml_str(
            r#"
            default_ttl_ms = 1000
            layers = ["memory", "remote"]
            jitter_pct = 0.2

            [remote]
            host = "redis"
            max_retries = 3
            circuit_breaker_timeout_ms = 5000
            "#,
        )
        .unwrap();
        assert_eq!(config.default_ttl, Duration::from_secs(1));
        assert_eq!(config.jitter_pct, 0.2);
        assert_eq!(config.remote.host, "redis");
        assert_eq!(config.remote.port, 6379);
        assert_eq!(config.remote.max_retries, 3);
        assert_eq!(config.remote.circuit_breaker_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_proxy_mode_toml() {
        let config = CacheConfig::from_toml_str(
            r#"
            [mode]
            kind = "proxy"
            url = "http://cache.internal:8080"
            timeout_ms = 500
            "#,
        )
        .unwrap();
        let CacheMode::Proxy(proxy) = config.mode else {
            panic!("expected proxy mode");
        };
        assert_eq!(proxy.timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_validation() {
        assert!(CacheConfig::default().with_max_entries(0).validate().is_err());
        assert!(CacheConfig::default().with_layers(vec![]).validate().is_err());
        assert!(
            CacheConfig::default()
                .with_layers(vec![LayerKind::Memory, LayerKind::Memory])
                .validate()
                .is_err()
        );
        assert!(CacheConfig::default().with_namespace("a:b", "v1").validate().is_err());
        assert!(
            CacheConfig::default()
                .with_proxy(ProxyConfig::new("not a url"))
                .validate()
                .is_err()
        );
        let mut config = CacheConfig::default();
        config.jitter_pct = 1.5;
        assert!(config.validate().is_err());
    }
}
