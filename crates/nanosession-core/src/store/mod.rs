pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::session::SessionData;

pub use memory::MemoryStore;

/// Trait for session storage backends.
///
/// Every operation may suspend on I/O and fails independently of the
/// others. Implementations own retry policy, if any.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Short backend name, used in logs.
    fn kind(&self) -> &'static str {
        "custom"
    }

    /// Fetch a session payload.
    ///
    /// Missing or expired keys are `Ok(None)`; `Err` is reserved for
    /// genuine backend failures.
    async fn load(&self, id: &str) -> Result<Option<SessionData>, StoreError>;

    /// Upsert a payload, replacing any previous TTL.
    ///
    /// `ttl` of `None` means the cookie is a browser-session cookie; the
    /// store picks its own retention.
    async fn save(
        &self,
        id: &str,
        data: &SessionData,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Slide the expiry window without rewriting data. Absent keys are a
    /// successful no-op.
    async fn touch(&self, id: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Remove a session. Idempotent.
    async fn destroy(&self, id: &str) -> Result<(), StoreError>;

    /// Number of live sessions.
    async fn len(&self) -> Result<usize, StoreError> {
        Err(StoreError::Unsupported("len"))
    }

    /// Ids of all live sessions.
    async fn ids(&self) -> Result<Vec<String>, StoreError> {
        Err(StoreError::Unsupported("ids"))
    }

    /// Remove every session.
    async fn clear(&self) -> Result<(), StoreError> {
        Err(StoreError::Unsupported("clear"))
    }
}

#[async_trait]
impl<T: SessionStore + ?Sized> SessionStore for Arc<T> {
    fn kind(&self) -> &'static str {
        (**self).kind()
    }

    async fn load(&self, id: &str) -> Result<Option<SessionData>, StoreError> {
        (**self).load(id).await
    }

    async fn save(
        &self,
        id: &str,
        data: &SessionData,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        (**self).save(id, data, ttl).await
    }

    async fn touch(&self, id: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        (**self).touch(id, ttl).await
    }

    async fn destroy(&self, id: &str) -> Result<(), StoreError> {
        (**self).destroy(id).await
    }

    async fn len(&self) -> Result<usize, StoreError> {
        (**self).len().await
    }

    async fn ids(&self) -> Result<Vec<String>, StoreError> {
        (**self).ids().await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        (**self).clear().await
    }
}

/// The store backing the current request, exposed through request
/// extensions next to the [`Session`](crate::Session).
#[derive(Clone)]
pub struct SessionStoreHandle(pub Arc<dyn SessionStore>);

impl std::ops::Deref for SessionStoreHandle {
    type Target = dyn SessionStore;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl std::fmt::Debug for SessionStoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SessionStoreHandle")
            .field(&self.0.kind())
            .finish()
    }
}
