//! In-process fakes for exercising the remote tier without a server.
//!
//! Enabled for this crate's tests and, for downstream tests, through the
//! `testing` feature.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::clock::SharedClock;
use crate::error::{CacheError, CacheResult};
use crate::key::KeyPattern;
use crate::remote::{RemoteConnector, RemoteStore};

pub use crate::clock::ManualClock;

struct Stored {
    bytes: Vec<u8>,
    expires: Option<i64>,
}

/// A remote store kept in a hash map, honouring native TTLs.
pub struct InMemoryRemote {
    clock: SharedClock,
    data: Mutex<HashMap<String, Stored>>,
    unavailable: AtomicBool,
}

impl InMemoryRemote {
    /// Create an empty store.
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            data: Mutex::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every operation fail with a connection error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Store bytes with no TTL, bypassing the client.
    pub fn insert_raw(&self, key: &str, bytes: Vec<u8>) {
        self.data.lock().insert(
            key.to_string(),
            Stored {
                bytes,
                expires: None,
            },
        );
    }

    /// Raw bytes under a live key.
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        let now = self.clock.now_millis();
        self.data
            .lock()
            .get(key)
            .filter(|s| s.expires.is_none_or(|e| e > now))
            .map(|s| s.bytes.clone())
    }

    /// Whether a live key exists.
    pub fn contains(&self, key: &str) -> bool {
        self.raw(key).is_some()
    }

    /// Remaining native TTL of a key in milliseconds.
    pub fn ttl_ms(&self, key: &str) -> Option<i64> {
        let now = self.clock.now_millis();
        self.data
            .lock()
            .get(key)
            .and_then(|s| s.expires)
            .map(|e| e - now)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.data
            .lock()
            .values()
            .filter(|s| s.expires.is_none_or(|e| e > now))
            .count()
    }

    /// Whether there are no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> CacheResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(CacheError::connection("connection reset by peer"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.check()?;
        Ok(self.raw(key))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_ms: u64) -> CacheResult<()> {
        self.check()?;
        let expires = self.clock.now_millis() + i64::try_from(ttl_ms).unwrap_or(i64::MAX);
        self.data.lock().insert(
            key.to_string(),
            Stored {
                bytes: value,
                expires: Some(expires),
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> CacheResult<u64> {
        self.check()?;
        let now = self.clock.now_millis();
        let mut data = self.data.lock();
        let mut removed = 0;
        for key in keys {
            let live = data
                .remove(key)
                .is_some_and(|s| s.expires.is_none_or(|e| e > now));
            if live {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        self.check()?;
        Ok(self.contains(key))
    }

    async fn scan(&self, pattern: &str) -> CacheResult<Vec<String>> {
        self.check()?;
        let pattern = KeyPattern::new_unchecked(pattern.to_string());
        let now = self.clock.now_millis();
        Ok(self
            .data
            .lock()
            .iter()
            .filter(|(k, s)| s.expires.is_none_or(|e| e > now) && pattern.matches(k))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn flush(&self) -> CacheResult<()> {
        self.check()?;
        self.data.lock().clear();
        Ok(())
    }

    async fn ping(&self) -> CacheResult<()> {
        self.check()
    }
}

/// Connector that fails a fixed number of times before handing out an
/// [`InMemoryRemote`].
pub struct FlakyConnector {
    store: Arc<InMemoryRemote>,
    failures_left: AtomicU32,
    attempts: AtomicU32,
    down: AtomicBool,
}

impl FlakyConnector {
    /// Always succeeds.
    pub fn healthy(store: Arc<InMemoryRemote>) -> Self {
        Self::failing(store, 0)
    }

    /// Fails the first `n` attempts.
    pub fn failing(store: Arc<InMemoryRemote>, n: u32) -> Self {
        Self {
            store,
            failures_left: AtomicU32::new(n),
            attempts: AtomicU32::new(0),
            down: AtomicBool::new(false),
        }
    }

    /// Fail every attempt while set.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Connect attempts so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// The store handed out on success.
    pub fn store(&self) -> &Arc<InMemoryRemote> {
        &self.store
    }
}

#[async_trait]
impl RemoteConnector for FlakyConnector {
    async fn connect(&self) -> CacheResult<Arc<dyn RemoteStore>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(CacheError::connection("connection refused"));
        }
        let scheduled_failure = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scheduled_failure {
            return Err(CacheError::connection("connection refused"));
        }
        Ok(self.store.clone())
    }

    fn endpoint(&self) -> String {
        "memory://flaky".to_string()
    }
}
