//! In-process session store.
//!
//! Records live in a [`DashMap`] keyed by session id. A background task
//! sweeps expired records on a fixed interval, independent of traffic.
//! The task is tied to the store: [`MemoryStore::shutdown`] stops it, and
//! so does dropping the last handle.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::SessionStore;
use crate::error::StoreError;
use crate::session::SessionData;

/// Default sweep interval: 1 minute.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Retention for browser-session cookies (no max-age): 1 day.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Upper bound for expiry and sweep-interval arithmetic (~30 years).
pub const MAX_TTL: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

struct Record {
    payload: String,
    expires_at: Instant,
}

struct Shared {
    records: DashMap<String, Record>,
    default_ttl: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn expiry(&self, ttl: Option<Duration>) -> Instant {
        let ttl = ttl.unwrap_or(self.default_ttl).min(MAX_TTL);
        Instant::now() + ttl
    }

    /// Remove records expired at `now`.
    ///
    /// Keys are collected first and each removal re-checks expiry, so a
    /// record refreshed by a concurrent `save` or `touch` survives.
    fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .records
            .iter()
            .filter(|entry| entry.expires_at <= now)
            .map(|entry| entry.key().clone())
            .collect();

        expired
            .iter()
            .filter(|id| {
                self.records
                    .remove_if(id.as_str(), |_, record| record.expires_at <= now)
                    .is_some()
            })
            .count()
    }

    fn stop_sweeper(&self) -> bool {
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

/// Default in-memory [`SessionStore`].
///
/// Cloning yields another handle to the same records.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Shared>,
}

impl MemoryStore {
    /// Create a store with the default sweep interval and retention.
    ///
    /// The sweeper starts immediately when called inside a tokio runtime.
    pub fn new() -> Self {
        Self::with_options(DEFAULT_SWEEP_INTERVAL, DEFAULT_TTL)
    }

    pub fn with_options(sweep_interval: Duration, default_ttl: Duration) -> Self {
        let store = Self::without_sweeper(default_ttl);
        store.start_sweeper(sweep_interval);
        store
    }

    /// Create a store that only expires records lazily, on access.
    pub fn without_sweeper(default_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Shared {
                records: DashMap::new(),
                default_ttl,
                sweeper: Mutex::new(None),
            }),
        }
    }

    fn start_sweeper(&self, every: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime available; memory store will only expire sessions lazily");
            return;
        };
        let every = every.clamp(Duration::from_millis(1), MAX_TTL);
        let handle = runtime.spawn(run_sweeper(Arc::downgrade(&self.inner), every));
        let previous = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stop the background sweeper. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.inner.stop_sweeper() {
            debug!("Memory store sweeper stopped");
        }
    }

    pub fn is_sweeping(&self) -> bool {
        self.inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Run one sweep now and return how many records were removed.
    pub fn sweep_expired(&self) -> usize {
        self.inner.sweep(Instant::now())
    }

    pub fn default_ttl(&self) -> Duration {
        self.inner.default_ttl
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("records", &self.inner.records.len())
            .field("default_ttl", &self.inner.default_ttl)
            .finish()
    }
}

async fn run_sweeper(shared: Weak<Shared>, every: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let removed = shared.sweep(Instant::now());
        if removed > 0 {
            debug!("Swept {} expired sessions", removed);
        }
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn load(&self, id: &str) -> Result<Option<SessionData>, StoreError> {
        let now = Instant::now();
        let lookup = self
            .inner
            .records
            .get(id)
            .map(|record| (record.expires_at > now).then(|| record.payload.clone()));

        match lookup {
            None => Ok(None),
            Some(None) => {
                self.inner
                    .records
                    .remove_if(id, |_, record| record.expires_at <= now);
                Ok(None)
            }
            Some(Some(payload)) => Ok(Some(serde_json::from_str(&payload)?)),
        }
    }

    async fn save(
        &self,
        id: &str,
        data: &SessionData,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_string(data)?;
        let expires_at = self.inner.expiry(ttl);
        self.inner
            .records
            .insert(id.to_string(), Record { payload, expires_at });
        Ok(())
    }

    async fn touch(&self, id: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let now = Instant::now();
        if let Some(mut record) = self.inner.records.get_mut(id) {
            if record.expires_at > now {
                record.expires_at = self.inner.expiry(ttl);
            }
        }
        Ok(())
    }

    async fn destroy(&self, id: &str) -> Result<(), StoreError> {
        self.inner.records.remove(id);
        Ok(())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        let now = Instant::now();
        Ok(self
            .inner
            .records
            .iter()
            .filter(|entry| entry.expires_at > now)
            .count())
    }

    async fn ids(&self) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        Ok(self
            .inner
            .records
            .iter()
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.inner.records.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(value: serde_json::Value) -> SessionData {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let store = MemoryStore::new();
        store
            .save("a", &data(json!({"user": "alice"})), Some(Duration::from_secs(60)))
            .await
            .unwrap();

        let loaded = store.load("a").await.unwrap().unwrap();
        assert_eq!(loaded["user"], "alice");
        assert!(store.load("missing").await.unwrap().is_none());
        store.shutdown();
    }

    #[tokio::test]
    async fn test_save_overwrites() {
        let store = MemoryStore::without_sweeper(DEFAULT_TTL);
        store.save("a", &data(json!({"n": 1})), None).await.unwrap();
        store.save("a", &data(json!({"n": 2})), None).await.unwrap();
        assert_eq!(store.load("a").await.unwrap().unwrap()["n"], 2);
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_touch_missing_key_is_ok() {
        let store = MemoryStore::without_sweeper(DEFAULT_TTL);
        store.touch("ghost", Some(Duration::from_secs(5))).await.unwrap();
        assert!(store.load("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let store = MemoryStore::without_sweeper(DEFAULT_TTL);
        store.save("a", &SessionData::new(), None).await.unwrap();
        store.destroy("a").await.unwrap();
        store.destroy("a").await.unwrap();
        store.destroy("never-existed").await.unwrap();
        assert!(store.load("a").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_record_is_absent() {
        let store = MemoryStore::without_sweeper(DEFAULT_TTL);
        store
            .save("a", &SessionData::new(), Some(Duration::from_secs(10)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.load("a").await.unwrap().is_none());
        assert_eq!(store.inner.records.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_slides_expiry() {
        let store = MemoryStore::without_sweeper(DEFAULT_TTL);
        let ttl = Some(Duration::from_secs(10));
        store.save("a", &SessionData::new(), ttl).await.unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        store.touch("a", ttl).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;

        assert!(store.load("a").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_does_not_revive_expired_record() {
        let store = MemoryStore::without_sweeper(DEFAULT_TTL);
        let ttl = Some(Duration::from_secs(10));
        store.save("a", &SessionData::new(), ttl).await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        store.touch("a", ttl).await.unwrap();
        assert!(store.load("a").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_cookie_uses_default_ttl() {
        let store = MemoryStore::without_sweeper(Duration::from_secs(30));
        store.save("a", &SessionData::new(), None).await.unwrap();

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(store.load("a").await.unwrap().is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.load("a").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep_removes_expired() {
        let store = MemoryStore::with_options(Duration::from_secs(60), DEFAULT_TTL);
        assert!(store.is_sweeping());
        store
            .save("short", &SessionData::new(), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        store
            .save("long", &SessionData::new(), Some(Duration::from_secs(600)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(store.inner.records.len(), 1);
        assert!(store.inner.records.contains_key("long"));
        store.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_sweeper() {
        let store = MemoryStore::with_options(Duration::from_secs(60), DEFAULT_TTL);
        store.shutdown();
        store.shutdown();
        tokio::task::yield_now().await;
        assert!(!store.is_sweeping());

        store
            .save("a", &SessionData::new(), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;

        // Only lazy expiry remains.
        assert_eq!(store.inner.records.len(), 1);
        assert_eq!(store.sweep_expired(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_sweep_interval_keeps_sweeper_alive() {
        let store = MemoryStore::with_options(Duration::MAX, DEFAULT_TTL);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.is_sweeping());
        store.shutdown();
    }

    #[test]
    fn test_new_outside_runtime_does_not_sweep() {
        let store = MemoryStore::new();
        assert!(!store.is_sweeping());
    }

    #[test]
    fn test_sweep_keeps_refreshed_record() {
        let shared = MemoryStore::without_sweeper(DEFAULT_TTL);
        let past = Instant::now();
        shared.inner.records.insert(
            "a".to_string(),
            Record {
                payload: "{}".to_string(),
                expires_at: past,
            },
        );
        shared.inner.records.insert(
            "b".to_string(),
            Record {
                payload: "{}".to_string(),
                expires_at: past + Duration::from_secs(3600),
            },
        );
        assert_eq!(shared.inner.sweep(past), 1);
        assert!(shared.inner.records.contains_key("b"));
    }

    #[tokio::test]
    async fn test_inspection_methods() {
        let store = MemoryStore::without_sweeper(DEFAULT_TTL);
        store.save("a", &SessionData::new(), None).await.unwrap();
        store.save("b", &SessionData::new(), None).await.unwrap();

        let mut ids = store.ids().await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(store.kind(), "memory");

        store.clear().await.unwrap();
        assert_eq!(store.len().await.unwrap(), 0);
    }
}
