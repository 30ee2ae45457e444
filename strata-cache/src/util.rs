//! Memoization helpers: `remember`, TTL jitter and stale-while-revalidate.

use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::duration_millis;
use crate::entry::CacheEntry;
use crate::error::NotFound;
use crate::key::validate_key;
use crate::manager::{CacheManager, Lookup};
use crate::options::RememberOptions;
use crate::strata_debug;

/// `ttl` scaled by a random factor in `[1 - pct, 1 + pct]`.
///
/// Spreads out the expiry of entries written together so they are not all
/// recomputed at once. `pct` is clamped to `[0, 1)`.
pub fn jittered(ttl: Duration, pct: f64) -> Duration {
    jittered_with(&mut rand::thread_rng(), ttl, pct)
}

/// [`jittered`] with a caller-supplied random source.
pub fn jittered_with<R: Rng + ?Sized>(rng: &mut R, ttl: Duration, pct: f64) -> Duration {
    let pct = if pct.is_finite() { pct.clamp(0.0, 0.99) } else { 0.0 };
    if pct == 0.0 || ttl.is_zero() {
        return ttl;
    }
    let factor = rng.gen_range(-pct..=pct);
    let lo = ttl.mul_f64(1.0 - pct);
    let hi = ttl.mul_f64(1.0 + pct);
    ttl.mul_f64(1.0 + factor).clamp(lo, hi)
}

/// Age after which an entry with `ttl` is served stale and refreshed:
/// `floor(ttl * 0.8)` at millisecond resolution.
pub fn soft_ttl(ttl: Duration) -> Duration {
    Duration::from_millis(u64::try_from(ttl.as_millis() * 4 / 5).unwrap_or(u64::MAX))
}

/// Whether an entry is past its soft TTL at `now`.
///
/// The soft TTL is taken from the lifetime the entry was actually written
/// with, so jittered entries go stale in proportion; `ttl` is only used for
/// entries whose creation time is unknown.
pub fn is_stale<T>(entry: &CacheEntry<T>, ttl: Duration, now: i64) -> bool {
    entry.age(now, ttl) > soft_ttl(entry.lifetime(ttl))
}

fn scoped_key(options: &RememberOptions, key: &str) -> String {
    match options.namespace {
        Some(ref ns) => format!("{ns}:{key}"),
        None => key.to_string(),
    }
}

/// Return the cached value for `key`, or run `compute`, cache its result
/// and return it.
///
/// - A live value is returned without calling `compute`.
/// - A live negative marker returns `E::not_found` without calling `compute`.
/// - A successful computation is stored with a jittered TTL and the tags in
///   `options`.
/// - A not-found failure stores a negative marker (unless disabled) and is
///   returned. Any other failure is returned and nothing is cached.
/// - An invalid key skips the cache and just computes.
///
/// Concurrent misses on the same key may each run `compute`.
///
/// ```rust,ignore
/// let product = remember(&cache, "product:42", Duration::from_secs(300), || async {
///     db.find_product(42).await
/// }, RememberOptions::default().with_tag(EntityTag::record("product", 42))).await?;
/// ```
pub async fn remember<T, E, F, Fut>(
    cache: &CacheManager,
    key: &str,
    ttl: Duration,
    compute: F,
    options: RememberOptions,
) -> Result<T, E>
where
    T: Serialize + DeserializeOwned,
    E: NotFound,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let key = scoped_key(&options, key);
    if let Err(e) = validate_key(&key) {
        warn!(key = %key, error = %e, "invalid cache key, computing without cache");
        return compute().await;
    }

    match cache.lookup::<T>(&key).await {
        Lookup::Hit(value) => {
            strata_debug!(key = %key, "remember hit");
            return Ok(value);
        }
        Lookup::Negative => return Err(E::not_found(&key)),
        Lookup::Miss => {}
    }

    let result = compute().await;
    store_result(cache, &key, ttl, &options, &result).await;
    result
}

/// Like [`remember`], but a value past its soft TTL (80% of `ttl`) is
/// returned immediately while `compute` refreshes it in the background.
///
/// A failed refresh leaves the stale value in place until it expires.
pub async fn remember_swr<T, E, F, Fut>(
    cache: &CacheManager,
    key: &str,
    ttl: Duration,
    compute: F,
    options: RememberOptions,
) -> Result<T, E>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    E: NotFound + Display + Send + Sync + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    let key = scoped_key(&options, key);
    if let Err(e) = validate_key(&key) {
        warn!(key = %key, error = %e, "invalid cache key, computing without cache");
        return compute().await;
    }

    match cache.lookup_entry::<T>(&key).await {
        Lookup::Hit(entry) => {
            let now = cache.clock().now_millis();
            if is_stale(&entry, ttl, now) {
                debug!(key = %key, age_ms = duration_millis(entry.age(now, ttl)), "serving stale value, refreshing");
                let cache = cache.clone();
                tokio::spawn(async move {
                    let result = compute().await;
                    if let Err(ref e) = result {
                        warn!(key = %key, error = %e, "background refresh failed, keeping stale value");
                        return;
                    }
                    store_result(&cache, &key, ttl, &options, &result).await;
                });
            }
            Ok(entry.data)
        }
        Lookup::Negative => Err(E::not_found(&key)),
        Lookup::Miss => {
            let result = compute().await;
            store_result(cache, &key, ttl, &options, &result).await;
            result
        }
    }
}

async fn store_result<T, E>(
    cache: &CacheManager,
    key: &str,
    ttl: Duration,
    options: &RememberOptions,
    result: &Result<T, E>,
) where
    T: Serialize,
    E: NotFound,
{
    match result {
        Ok(value) => {
            let pct = options.jitter_pct.unwrap_or(cache.config().jitter_pct);
            cache
                .set(key, value, &options.write_options(jittered(ttl, pct)))
                .await;
        }
        Err(e) if e.is_not_found() && options.negative_cache => {
            let negative_ttl = options.negative_ttl.unwrap_or(cache.config().negative_ttl);
            cache.set_negative(key, negative_ttl, &options.tags).await;
        }
        Err(_) => {}
    }
}
