//! Session lifecycle: resolve a session before the handler runs, commit it
//! afterwards.

use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderMap, HeaderValue};
use tracing::{debug, warn};

use crate::codec::{self, CookieOptions, CookieSigner};
use crate::config::SessionConfig;
use crate::error::{ConfigError, InvalidStateError, Result};
use crate::id::{self, IdGenerator};
use crate::session::{Session, Snapshot};
use crate::store::{SessionStore, SessionStoreHandle};

/// How a session was committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Saved to the store; the client gets a cookie.
    Persisted,
    /// Expiry refreshed; the client's cookie is still valid.
    Touched,
    /// Removed from the store; the client is told to drop its cookie.
    Destroyed,
    /// Nothing to do: an empty new session under `save_uninitialized =
    /// false`, or a session that was already committed.
    Skipped,
}

/// Result of [`SessionManager::commit`].
#[derive(Debug, Clone)]
pub struct Commit {
    outcome: Outcome,
    set_cookie: Option<HeaderValue>,
}

impl Commit {
    fn new(outcome: Outcome, set_cookie: Option<HeaderValue>) -> Self {
        Self {
            outcome,
            set_cookie,
        }
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    /// `Set-Cookie` value to attach to the response, if any.
    pub fn set_cookie(&self) -> Option<&HeaderValue> {
        self.set_cookie.as_ref()
    }

    pub fn into_set_cookie(self) -> Option<HeaderValue> {
        self.set_cookie
    }
}

struct Inner {
    name: String,
    cookie: CookieOptions,
    signer: CookieSigner,
    generator: Arc<dyn IdGenerator>,
    store: Arc<dyn SessionStore>,
    save_uninitialized: bool,
}

/// Drives the session state machine against a store.
///
/// Usable without the tower layer: call [`resolve`](Self::resolve) before
/// the handler and [`commit`](Self::commit) after it.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

/// Builder for [`SessionManager`] carrying the parts that cannot come from
/// a config file.
pub struct SessionManagerBuilder {
    config: SessionConfig,
    store: Option<Arc<dyn SessionStore>>,
    generator: Option<Arc<dyn IdGenerator>>,
}

impl SessionManagerBuilder {
    pub fn with_store(mut self, store: impl SessionStore) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    pub fn with_shared_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_generate_id(mut self, generator: impl IdGenerator + 'static) -> Self {
        self.generator = Some(Arc::new(generator));
        self
    }

    /// Validate everything and build the manager.
    ///
    /// The id generator is invoked once here; a generator that yields an
    /// unusable id fails now rather than on the first request.
    pub fn build(self) -> std::result::Result<SessionManager, ConfigError> {
        let config = self.config;
        config.validate()?;

        let generator = self
            .generator
            .unwrap_or_else(|| config.generate_id.generator());
        id::probe(generator.as_ref())?;

        let signer = config.signer()?;
        let store = match self.store {
            Some(store) => store,
            None => config.store.build()?,
        };

        debug!(
            "Session manager ready: cookie={}, store={}, signed={}",
            config.name,
            store.kind(),
            signer.is_signing()
        );

        Ok(SessionManager {
            inner: Arc::new(Inner {
                name: config.name,
                cookie: config.cookie,
                signer,
                generator,
                store,
                save_uninitialized: config.save_uninitialized,
            }),
        })
    }
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> std::result::Result<Self, ConfigError> {
        Self::builder(config).build()
    }

    pub fn builder(config: SessionConfig) -> SessionManagerBuilder {
        SessionManagerBuilder {
            config,
            store: None,
            generator: None,
        }
    }

    pub fn cookie_name(&self) -> &str {
        &self.inner.name
    }

    pub fn store(&self) -> SessionStoreHandle {
        SessionStoreHandle(self.inner.store.clone())
    }

    /// Load the session named by the request cookie, or start a new one.
    ///
    /// Store failures are logged and degrade to a fresh session.
    pub async fn resolve(&self, headers: &HeaderMap) -> Session {
        let inner = &self.inner;
        let cookies = codec::parse_headers(headers);
        let id = cookies
            .get(&inner.name)
            .and_then(|raw| inner.signer.unsign(raw));

        match id {
            Some(id) => match inner.store.load(&id).await {
                Ok(Some(data)) => {
                    debug!("Loaded session ({} keys)", data.len());
                    return Session::loaded(
                        id,
                        data,
                        inner.cookie.clone(),
                        inner.generator.clone(),
                    );
                }
                Ok(None) => debug!("Session cookie has no live record; starting fresh"),
                Err(e) => warn!("Failed to load session, starting fresh: {}", e),
            },
            None if cookies.contains_key(&inner.name) => {
                debug!("Session cookie failed verification; starting fresh")
            }
            None => {}
        }

        self.fresh_session()
    }

    fn fresh_session(&self) -> Session {
        Session::fresh(
            self.inner.generator.generate(),
            self.inner.cookie.clone(),
            self.inner.generator.clone(),
        )
    }

    /// Persist, touch or destroy the session after the handler has run.
    ///
    /// Store failures here are returned: a cookie pointing at data that
    /// was never written is worse than a failed request.
    pub async fn commit(&self, session: &Session) -> Result<Commit> {
        let Some(snapshot) = session.begin_commit() else {
            return Ok(Commit::new(Outcome::Skipped, None));
        };
        let superseded = snapshot.superseded.clone();
        match self.apply(session, snapshot).await {
            Ok(commit) => {
                debug!("Session committed: {:?}", commit.outcome);
                Ok(commit)
            }
            Err(e) => {
                session.abort_commit(superseded);
                Err(e)
            }
        }
    }

    async fn apply(&self, session: &Session, snapshot: Snapshot) -> Result<Commit> {
        let store = &self.inner.store;

        for old_id in &snapshot.superseded {
            store.destroy(old_id).await?;
        }

        if snapshot.destroyed {
            if !snapshot.is_new {
                store.destroy(&snapshot.id).await?;
            }
            let header = codec::serialize_clear(&self.inner.name, &snapshot.cookie);
            return Ok(Commit::new(Outcome::Destroyed, Some(to_header(header, &snapshot.id)?)));
        }

        let ttl = snapshot.cookie.max_age.map(Duration::from_secs);

        if snapshot.is_new || snapshot.modified {
            let uninitialized = snapshot.is_new
                && !snapshot.modified
                && snapshot.data.is_empty()
                && !snapshot.regenerated;
            if uninitialized && !self.inner.save_uninitialized {
                return Ok(Commit::new(Outcome::Skipped, None));
            }

            let value = self.inner.signer.sign(&snapshot.id);
            let header = to_header(
                codec::serialize(&self.inner.name, &value, &snapshot.cookie),
                &snapshot.id,
            )?;
            store.save(&snapshot.id, &snapshot.data, ttl).await?;
            session.mark_persisted();
            return Ok(Commit::new(Outcome::Persisted, Some(header)));
        }

        store.touch(&snapshot.id, ttl).await?;
        Ok(Commit::new(Outcome::Touched, None))
    }
}

fn to_header(value: String, id: &str) -> Result<HeaderValue> {
    HeaderValue::try_from(value).map_err(|_| {
        InvalidStateError::UnencodableId { id: id.to_string() }.into()
    })
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("name", &self.inner.name)
            .field("cookie", &self.inner.cookie)
            .field("store", &self.inner.store.kind())
            .field("save_uninitialized", &self.inner.save_uninitialized)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use http::header::COOKIE;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> impl IdGenerator + 'static {
        let next = AtomicUsize::new(0);
        move || format!("id-{}", next.fetch_add(1, Ordering::SeqCst))
    }

    fn manager(config: SessionConfig) -> (SessionManager, MemoryStore) {
        let store = MemoryStore::without_sweeper(crate::store::memory::DEFAULT_TTL);
        let manager = SessionManager::builder(config)
            .with_store(store.clone())
            .with_generate_id(counter())
            .build()
            .unwrap();
        (manager, store)
    }

    fn headers_with(cookie: &HeaderValue) -> HeaderMap {
        let value = cookie.to_str().unwrap();
        let pair = value.split(';').next().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(pair).unwrap());
        headers
    }

    #[tokio::test]
    async fn test_new_session_is_persisted_with_cookie() {
        let (manager, store) = manager(SessionConfig::default());
        let session = manager.resolve(&HeaderMap::new()).await;
        // The probe in `build` consumed id-0.
        assert_eq!(session.id(), "id-1");
        assert!(session.is_new());

        let commit = manager.commit(&session).await.unwrap();
        assert_eq!(commit.outcome(), Outcome::Persisted);
        assert!(commit.set_cookie().unwrap().to_str().unwrap().starts_with("sid=id-1"));
        assert!(!session.is_new());
        assert!(store.load("id-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_uninitialized_session_skipped_when_configured() {
        let (manager, store) = manager(SessionConfig::default().with_save_uninitialized(false));
        let session = manager.resolve(&HeaderMap::new()).await;
        let commit = manager.commit(&session).await.unwrap();
        assert_eq!(commit.outcome(), Outcome::Skipped);
        assert!(commit.set_cookie().is_none());
        assert_eq!(store.len().await.unwrap(), 0);

        let session = manager.resolve(&HeaderMap::new()).await;
        session.insert("k", "v").unwrap();
        let commit = manager.commit(&session).await.unwrap();
        assert_eq!(commit.outcome(), Outcome::Persisted);
    }

    #[tokio::test]
    async fn test_regenerated_empty_session_is_saved() {
        let (manager, store) = manager(SessionConfig::default().with_save_uninitialized(false));
        let session = manager.resolve(&HeaderMap::new()).await;
        let new_id = session.regenerate().unwrap();

        let commit = manager.commit(&session).await.unwrap();
        assert_eq!(commit.outcome(), Outcome::Persisted);
        assert!(commit.set_cookie().is_some());
        assert!(store.load(&new_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_existing_unmodified_session_is_touched() {
        let (manager, _store) = manager(SessionConfig::default());
        let first = manager.resolve(&HeaderMap::new()).await;
        first.insert("k", "v").unwrap();
        let cookie = manager.commit(&first).await.unwrap().into_set_cookie().unwrap();

        let second = manager.resolve(&headers_with(&cookie)).await;
        assert_eq!(second.id(), first.id());
        assert!(!second.is_new());
        let commit = manager.commit(&second).await.unwrap();
        assert_eq!(commit.outcome(), Outcome::Touched);
        assert!(commit.set_cookie().is_none());
    }

    #[tokio::test]
    async fn test_destroy_removes_record_and_clears_cookie() {
        let (manager, store) = manager(SessionConfig::default());
        let first = manager.resolve(&HeaderMap::new()).await;
        let cookie = manager.commit(&first).await.unwrap().into_set_cookie().unwrap();

        let second = manager.resolve(&headers_with(&cookie)).await;
        second.destroy();
        let commit = manager.commit(&second).await.unwrap();
        assert_eq!(commit.outcome(), Outcome::Destroyed);
        let header = commit.set_cookie().unwrap().to_str().unwrap().to_string();
        assert!(header.starts_with("sid=;"));
        assert!(header.contains("Max-Age=0"));
        assert!(store.load(&first.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_regenerate_replaces_record() {
        let (manager, store) = manager(SessionConfig::default());
        let first = manager.resolve(&HeaderMap::new()).await;
        first.insert("user", "alice").unwrap();
        let cookie = manager.commit(&first).await.unwrap().into_set_cookie().unwrap();
        let old_id = first.id();

        let second = manager.resolve(&headers_with(&cookie)).await;
        let user: Option<String> = second.get("user").unwrap();
        let new_id = second.regenerate().unwrap();
        second.insert("user", user).unwrap();
        let commit = manager.commit(&second).await.unwrap();

        assert_eq!(commit.outcome(), Outcome::Persisted);
        assert_ne!(new_id, old_id);
        assert!(store.load(&old_id).await.unwrap().is_none());
        let record = store.load(&new_id).await.unwrap().unwrap();
        assert_eq!(record["user"], "alice");
        assert!(commit
            .set_cookie()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with(&format!("sid={}", new_id)));
    }

    #[tokio::test]
    async fn test_commit_twice_is_skipped() {
        let (manager, _store) = manager(SessionConfig::default());
        let session = manager.resolve(&HeaderMap::new()).await;
        manager.commit(&session).await.unwrap();
        let again = manager.commit(&session).await.unwrap();
        assert_eq!(again.outcome(), Outcome::Skipped);
    }

    #[tokio::test]
    async fn test_signed_cookie_roundtrip_and_tamper() {
        let (manager, _store) = manager(SessionConfig::default().with_secret("keyboard cat"));
        let first = manager.resolve(&HeaderMap::new()).await;
        first.insert("k", "v").unwrap();
        let cookie = manager.commit(&first).await.unwrap().into_set_cookie().unwrap();
        assert!(cookie.to_str().unwrap().starts_with("sid=s:"));

        let second = manager.resolve(&headers_with(&cookie)).await;
        assert_eq!(second.id(), first.id());

        let mut forged = HeaderMap::new();
        forged.insert(COOKIE, HeaderValue::from_str(&format!("sid={}", first.id())).unwrap());
        let third = manager.resolve(&forged).await;
        assert_ne!(third.id(), first.id());
        assert!(third.is_new());
    }

    #[tokio::test]
    async fn test_per_session_max_age_drives_cookie() {
        let (manager, _store) =
            manager(SessionConfig::default().with_cookie(CookieOptions::default().with_max_age(60)));
        let session = manager.resolve(&HeaderMap::new()).await;
        session.set_max_age(Some(5)).unwrap();
        let commit = manager.commit(&session).await.unwrap();
        assert!(commit.set_cookie().unwrap().to_str().unwrap().contains("Max-Age=5"));
    }

    #[test]
    fn test_build_rejects_empty_generator() {
        let result = SessionManager::builder(SessionConfig::default())
            .with_store(MemoryStore::without_sweeper(crate::store::memory::DEFAULT_TTL))
            .with_generate_id(String::new)
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidGenerateId(_))));
    }

    #[test]
    fn test_build_rejects_invalid_cookie_options() {
        let config = SessionConfig::default().with_cookie(CookieOptions::default().with_path(""));
        assert!(matches!(
            SessionManager::new(config),
            Err(ConfigError::InvalidCookie(_))
        ));
    }
}
