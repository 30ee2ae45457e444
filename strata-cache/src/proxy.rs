//! [`CacheService`] over HTTP, for processes that share a cache service
//! instead of running their own manager.
//!
//! Every call is a JSON request to `{base}/cache/...`:
//!
//! | Operation | Request | Response |
//! |-----------|---------|----------|
//! | get | `POST /cache/get` `{key}` | `{value}` (null on miss) |
//! | set | `POST /cache/set` `{key, value, ttl_ms, tags, namespace}` | `{stored}` |
//! | delete | `POST /cache/delete` `{key}` | `{deleted}` |
//! | invalidate | `POST /cache/invalidate` `{tags}` | `{removed}` |
//! | clear | `POST /cache/clear` `{}` | any |
//! | stats | `GET /cache/stats` | [`CacheStats`] |
//!
//! An unreachable or failing service degrades to a no-op, with warnings
//! rate-limited the same way as the remote tier.

use async_trait::async_trait;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::config::ProxyConfig;
use crate::error::{CacheError, CacheResult};
use crate::logging::LogThrottle;
use crate::options::CacheOptions;
use crate::service::CacheService;
use crate::stats::CacheStats;

/// Body of `get` and `delete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRequest {
    /// Cache key.
    pub key: String,
}

/// Body of `set`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetRequest {
    /// Cache key.
    pub key: String,
    /// Value to store.
    pub value: Value,
    /// TTL in milliseconds; the service default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    /// Tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Body of `invalidate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidateRequest {
    /// Tags to invalidate.
    pub tags: Vec<String>,
}

/// Response of `get`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetResponse {
    /// The value, `null` on a miss.
    #[serde(default)]
    pub value: Option<Value>,
}

/// Response of `set`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetResponse {
    /// Whether the value was stored.
    pub stored: bool,
}

/// Response of `delete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteResponse {
    /// Whether the key was present.
    pub deleted: bool,
}

/// Response of `invalidate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidateResponse {
    /// Keys removed.
    pub removed: usize,
}

/// HTTP client for a remote cache service.
#[derive(Debug)]
pub struct ProxyCache {
    client: reqwest::Client,
    base: String,
    timeout: Duration,
    throttle: LogThrottle,
}

impl ProxyCache {
    /// Build a client for the service at `config.url`.
    pub fn new(config: &ProxyConfig) -> CacheResult<Self> {
        let parsed = Url::parse(&config.url)
            .map_err(|e| CacheError::config(format!("invalid proxy url {:?}: {e}", config.url)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(CacheError::config(format!(
                "proxy url must be http or https, got {:?}",
                parsed.scheme()
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CacheError::config(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            base: config.url.trim_end_matches('/').to_string(),
            timeout: config.timeout,
            throttle: LogThrottle::default(),
        })
    }

    /// The service base URL.
    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn endpoint(&self, op: &str) -> String {
        format!("{}/cache/{op}", self.base)
    }

    async fn post<B, R>(&self, op: &str, body: &B) -> CacheResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self
            .client
            .post(self.endpoint(op))
            .json(body)
            .send()
            .await
            .map_err(|e| self.http_error(e))?
            .error_for_status()
            .map_err(|e| self.http_error(e))?;
        response.json::<R>().await.map_err(|e| self.http_error(e))
    }

    fn http_error(&self, e: reqwest::Error) -> CacheError {
        if e.is_timeout() {
            CacheError::Timeout(u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX))
        } else if e.is_decode() {
            CacheError::deserialization(e.to_string())
        } else if e.is_connect() {
            CacheError::connection(e.to_string())
        } else {
            CacheError::backend(e.to_string())
        }
    }

    fn degrade(&self, op: &str, error: &CacheError) {
        match self.throttle.permit() {
            Some(suppressed) => {
                warn!(op, base = %self.base, error = %error, suppressed, "cache service call failed, continuing without cache");
            }
            None => debug!(op, error = %error, "cache service call failed"),
        }
    }
}

#[async_trait]
impl CacheService for ProxyCache {
    async fn get_value(&self, key: &str) -> Option<Value> {
        let body = KeyRequest {
            key: key.to_string(),
        };
        match self.post::<_, GetResponse>("get", &body).await {
            Ok(response) => response.value.filter(|v| !v.is_null()),
            Err(e) => {
                self.degrade("get", &e);
                None
            }
        }
    }

    async fn set_value(&self, key: &str, value: Value, options: &CacheOptions) -> bool {
        let body = SetRequest {
            key: key.to_string(),
            value,
            ttl_ms: options
                .ttl
                .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
            tags: options.tags.clone(),
            namespace: options.namespace.clone(),
        };
        match self.post::<_, SetResponse>("set", &body).await {
            Ok(response) => response.stored,
            Err(e) => {
                self.degrade("set", &e);
                false
            }
        }
    }

    async fn delete(&self, key: &str) -> bool {
        let body = KeyRequest {
            key: key.to_string(),
        };
        match self.post::<_, DeleteResponse>("delete", &body).await {
            Ok(response) => response.deleted,
            Err(e) => {
                self.degrade("delete", &e);
                false
            }
        }
    }

    async fn invalidate_by_tags(&self, tags: &[String]) -> usize {
        let body = InvalidateRequest {
            tags: tags.to_vec(),
        };
        match self.post::<_, InvalidateResponse>("invalidate", &body).await {
            Ok(response) => response.removed,
            Err(e) => {
                self.degrade("invalidate", &e);
                0
            }
        }
    }

    async fn clear(&self) {
        if let Err(e) = self
            .post::<_, IgnoredAny>("clear", &serde_json::json!({}))
            .await
        {
            self.degrade("clear", &e);
        }
    }

    async fn stats(&self) -> CacheStats {
        let result: Result<CacheStats, reqwest::Error> = async {
            self.client
                .get(self.endpoint("stats"))
                .send()
                .await?
                .error_for_status()?
                .json::<CacheStats>()
                .await
        }
        .await;
        match result {
            Ok(stats) => stats,
            Err(e) => {
                let e = self.http_error(e);
                self.degrade("stats", &e);
                CacheStats::default()
            }
        }
    }
}
