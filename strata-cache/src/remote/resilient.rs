//! Connection resilience for the remote tier.
//!
//! [`ResilientClient`] owns at most one live connection. While connected it
//! forwards operations with a per-command timeout. When the connection breaks
//! it reconnects with exponential backoff; after `max_retries` consecutive
//! failures the circuit opens and retries stop. A failed first connect opens
//! the circuit straight away. Once `circuit_breaker_timeout` has passed, the
//! next operation (or keep-alive tick) launches a single probe.
//!
//! Callers never see remote failures: reads come back absent and writes come
//! back `false`, without waiting on the network while the circuit is open.

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::breaker::{BreakerConfig, BreakerState, CircuitBreaker, FailureAction};
use super::{RemoteConnector, RemoteStore};
use crate::clock::{SharedClock, duration_millis};
use crate::error::{CacheError, CacheResult};
use crate::logging::LogThrottle;

/// Timeouts and breaker tuning for a [`ResilientClient`].
#[derive(Debug, Clone)]
pub struct ResilienceSettings {
    /// Breaker and backoff tuning.
    pub breaker: BreakerConfig,
    /// Deadline for one connect attempt.
    pub connect_timeout: Duration,
    /// Deadline for one command.
    pub command_timeout: Duration,
    /// Period of the keep-alive ping.
    pub keepalive_interval: Duration,
    /// Minimum spacing between failure warnings.
    pub log_interval: Duration,
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(2),
            keepalive_interval: Duration::from_secs(30),
            log_interval: Duration::from_secs(10),
        }
    }
}

struct Inner {
    connector: Arc<dyn RemoteConnector>,
    settings: ResilienceSettings,
    clock: SharedClock,
    conn: RwLock<Option<Arc<dyn RemoteStore>>>,
    breaker: Mutex<CircuitBreaker>,
    connecting: AtomicBool,
    closed: AtomicBool,
    throttle: LogThrottle,
    shutdown: watch::Sender<bool>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    /// One connect attempt. A failed `initial` attempt opens the circuit at
    /// once; later failures follow the backoff schedule.
    fn connect_once(self: Arc<Self>, initial: bool) -> BoxFuture<'static, bool> {
        async move {
            if self.closed.load(Ordering::Acquire) || self.connecting.swap(true, Ordering::AcqRel)
            {
                return false;
            }

            let timeout = self.settings.connect_timeout;
            let result = match tokio::time::timeout(timeout, self.connector.connect()).await {
                Ok(result) => result,
                Err(_) => Err(CacheError::Timeout(duration_millis(timeout) as u64)),
            };

            match result {
                Ok(store) => {
                    *self.conn.write() = Some(store);
                    self.breaker.lock().record_success();
                    self.connecting.store(false, Ordering::Release);
                    info!(endpoint = %self.connector.endpoint(), "remote tier connected");
                    true
                }
                Err(e) => {
                    let (action, failures) = {
                        let mut breaker = self.breaker.lock();
                        let now = self.clock.now_millis();
                        let action = if initial {
                            breaker.trip(now);
                            FailureAction::Open
                        } else {
                            breaker.record_failure(now)
                        };
                        (action, breaker.consecutive_failures())
                    };
                    self.connecting.store(false, Ordering::Release);
                    self.warn_throttled("connect", &e);
                    match action {
                        FailureAction::RetryAfter(delay) => {
                            debug!(
                                failures,
                                delay_ms = delay.as_millis() as u64,
                                "scheduling remote reconnect"
                            );
                            self.schedule_reconnect(delay);
                        }
                        FailureAction::Open => {
                            warn!(
                                endpoint = %self.connector.endpoint(),
                                failures,
                                timeout_ms = self.settings.breaker.circuit_breaker_timeout.as_millis() as u64,
                                "remote tier circuit opened"
                            );
                        }
                    }
                    false
                }
            }
        }
        .boxed()
    }

    fn schedule_reconnect(self: &Arc<Self>, delay: Duration) {
        let inner = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    inner.connect_once(false).await;
                }
                _ = shutdown.changed() => {}
            }
        });
    }

    fn live_store(self: &Arc<Self>) -> Option<Arc<dyn RemoteStore>> {
        if let Some(store) = self.conn.read().clone() {
            return Some(store);
        }
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let probe = self.breaker.lock().try_acquire_probe(self.clock.now_millis());
        if probe {
            info!(endpoint = %self.connector.endpoint(), "remote tier circuit half-open, probing");
            let inner = Arc::clone(self);
            tokio::spawn(inner.connect_once(false));
        }
        None
    }

    fn on_operation_error(self: &Arc<Self>, op: &'static str, err: &CacheError) {
        self.warn_throttled(op, err);
        let dropped = self.conn.write().take().is_some();
        if !dropped {
            return;
        }
        let action = self.breaker.lock().record_failure(self.clock.now_millis());
        match action {
            FailureAction::RetryAfter(delay) => self.schedule_reconnect(delay),
            FailureAction::Open => {
                warn!(endpoint = %self.connector.endpoint(), "remote tier circuit opened")
            }
        }
    }

    fn warn_throttled(&self, op: &'static str, err: &CacheError) {
        if let Some(suppressed) = self.throttle.permit() {
            warn!(
                operation = op,
                endpoint = %self.connector.endpoint(),
                error = %err,
                suppressed,
                "remote tier unavailable, degrading to no-op"
            );
        }
    }
}

/// Remote-tier client that degrades to no-ops instead of failing.
///
/// Cloning is cheap; clones share the connection and breaker.
#[derive(Clone)]
pub struct ResilientClient {
    inner: Arc<Inner>,
}

impl ResilientClient {
    /// Create a disconnected client. Call [`start`](Self::start) to connect.
    pub fn new(
        connector: Arc<dyn RemoteConnector>,
        settings: ResilienceSettings,
        clock: SharedClock,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                connector,
                breaker: Mutex::new(CircuitBreaker::new(settings.breaker.clone())),
                throttle: LogThrottle::new(settings.log_interval),
                settings,
                clock,
                conn: RwLock::new(None),
                connecting: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                shutdown,
                keepalive: Mutex::new(None),
            }),
        }
    }

    /// Make the first connection attempt and start the keep-alive task.
    ///
    /// Returns whether the first attempt succeeded. On failure the circuit
    /// starts open: operations degrade until `circuit_breaker_timeout` has
    /// passed and a probe reconnects.
    pub async fn start(&self) -> bool {
        self.spawn_keepalive();
        Arc::clone(&self.inner).connect_once(true).await
    }

    fn spawn_keepalive(&self) {
        let mut slot = self.inner.keepalive.lock();
        if slot.is_some() {
            return;
        }
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let mut shutdown = self.inner.shutdown.subscribe();
        let period = self.inner.settings.keepalive_interval;

        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let alive = ResilientClient { inner }.ping().await;
                        trace!(alive, "remote keep-alive");
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    async fn call<T, F, Fut>(&self, op: &'static str, f: F) -> Option<T>
    where
        F: FnOnce(Arc<dyn RemoteStore>) -> Fut,
        Fut: Future<Output = CacheResult<T>>,
    {
        let store = self.inner.live_store()?;
        let timeout = self.inner.settings.command_timeout;
        let result = match tokio::time::timeout(timeout, f(store)).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(duration_millis(timeout) as u64)),
        };
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.inner.on_operation_error(op, &e);
                None
            }
        }
    }

    /// Fetch raw bytes; absent when unavailable.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.call("get", |s| async move { s.get(key).await })
            .await
            .flatten()
    }

    /// Store raw bytes with a native TTL. Returns whether the store accepted it.
    pub async fn set(&self, key: &str, value: Vec<u8>, ttl_ms: u64) -> bool {
        self.call("set", |s| async move { s.set(key, value, ttl_ms).await })
            .await
            .is_some()
    }

    /// Delete keys. Returns how many existed; zero when unavailable.
    pub async fn delete(&self, keys: &[String]) -> u64 {
        if keys.is_empty() {
            return 0;
        }
        self.call("delete", |s| async move { s.delete(keys).await })
            .await
            .unwrap_or(0)
    }

    /// Whether a key exists; `false` when unavailable.
    pub async fn exists(&self, key: &str) -> bool {
        self.call("exists", |s| async move { s.exists(key).await })
            .await
            .unwrap_or(false)
    }

    /// Keys matching a glob; empty when unavailable.
    pub async fn scan(&self, pattern: &str) -> Vec<String> {
        self.call("scan", |s| async move { s.scan(pattern).await })
            .await
            .unwrap_or_default()
    }

    /// Flush the database. Returns whether it happened.
    pub async fn flush(&self) -> bool {
        self.call("flush", |s| async move { s.flush().await })
            .await
            .is_some()
    }

    /// Ping the store. Returns whether it answered.
    pub async fn ping(&self) -> bool {
        self.call("ping", |s| async move { s.ping().await })
            .await
            .is_some()
    }

    /// Whether a connection is currently held.
    pub fn is_connected(&self) -> bool {
        self.inner.conn.read().is_some()
    }

    /// Whether the circuit is open.
    pub fn is_open(&self) -> bool {
        self.inner.breaker.lock().is_open()
    }

    /// Breaker state right now.
    pub fn breaker_state(&self) -> BreakerState {
        self.inner
            .breaker
            .lock()
            .state(self.inner.clock.now_millis())
    }

    /// Consecutive connect failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.breaker.lock().consecutive_failures()
    }

    /// Endpoint description.
    pub fn endpoint(&self) -> String {
        self.inner.connector.endpoint()
    }

    /// Stop background tasks and drop the connection.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.shutdown.send_replace(true);
        self.inner.conn.write().take();
        let handle = self.inner.keepalive.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!(endpoint = %self.inner.connector.endpoint(), "remote tier client closed");
    }
}

impl std::fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientClient")
            .field("endpoint", &self.endpoint())
            .field("connected", &self.is_connected())
            .field("open", &self.is_open())
            .finish()
    }
}
