use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::codec::CookieOptions;
use crate::error::{InvalidStateError, Result};
use crate::id::{IdGenerator, RandomIdGenerator};

/// Session payload: string keys to arbitrary JSON values.
pub type SessionData = serde_json::Map<String, Value>;

struct State {
    id: String,
    data: SessionData,
    cookie: CookieOptions,
    is_new: bool,
    modified: bool,
    destroyed: bool,
    /// Set by `regenerate` until the session is persisted.
    regenerated: bool,
    /// Ids given up by `regenerate` that still have a store record.
    superseded: Vec<String>,
    committed: bool,
}

impl State {
    fn ensure_live(&self) -> std::result::Result<(), InvalidStateError> {
        if self.destroyed {
            return Err(InvalidStateError::Destroyed {
                id: self.id.clone(),
            });
        }
        Ok(())
    }
}

/// What the manager needs to decide how to commit a session.
pub(crate) struct Snapshot {
    pub id: String,
    pub data: SessionData,
    pub cookie: CookieOptions,
    pub is_new: bool,
    pub modified: bool,
    pub destroyed: bool,
    pub regenerated: bool,
    pub superseded: Vec<String>,
}

/// A server-side session attached to one request.
///
/// Cheap to clone: all clones share the same state, so the copy a handler
/// pulls out of the request extensions is the one the middleware commits.
/// The session never talks to the store itself.
#[derive(Clone)]
pub struct Session {
    state: Arc<Mutex<State>>,
    generator: Arc<dyn IdGenerator>,
}

impl Session {
    /// Create a detached session, e.g. one attached by an upstream layer
    /// that manages persistence on its own.
    pub fn new(id: impl Into<String>) -> Self {
        Self::fresh(
            id.into(),
            CookieOptions::default(),
            Arc::new(RandomIdGenerator),
        )
    }

    pub(crate) fn fresh(
        id: String,
        cookie: CookieOptions,
        generator: Arc<dyn IdGenerator>,
    ) -> Self {
        Self::build(id, SessionData::new(), cookie, true, generator)
    }

    pub(crate) fn loaded(
        id: String,
        data: SessionData,
        cookie: CookieOptions,
        generator: Arc<dyn IdGenerator>,
    ) -> Self {
        Self::build(id, data, cookie, false, generator)
    }

    fn build(
        id: String,
        data: SessionData,
        cookie: CookieOptions,
        is_new: bool,
        generator: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                id,
                data,
                cookie,
                is_new,
                modified: false,
                destroyed: false,
                regenerated: false,
                superseded: Vec::new(),
                committed: false,
            })),
            generator,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> String {
        self.lock().id.clone()
    }

    /// Get a value, deserialized into `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_value(key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn get_value(&self, key: &str) -> std::result::Result<Option<Value>, InvalidStateError> {
        let state = self.lock();
        state.ensure_live()?;
        Ok(state.data.get(key).cloned())
    }

    /// Set a value, returning the previous one.
    ///
    /// Writing a value equal to the current one does not mark the session
    /// modified.
    pub fn insert(&self, key: impl Into<String>, value: impl Serialize) -> Result<Option<Value>> {
        let value = serde_json::to_value(value)?;
        let mut state = self.lock();
        state.ensure_live()?;
        let key = key.into();
        if state.data.get(&key) == Some(&value) {
            return Ok(Some(value));
        }
        state.modified = true;
        Ok(state.data.insert(key, value))
    }

    pub fn remove(&self, key: &str) -> std::result::Result<Option<Value>, InvalidStateError> {
        let mut state = self.lock();
        state.ensure_live()?;
        let removed = state.data.remove(key);
        if removed.is_some() {
            state.modified = true;
        }
        Ok(removed)
    }

    pub fn clear(&self) -> std::result::Result<(), InvalidStateError> {
        let mut state = self.lock();
        state.ensure_live()?;
        if !state.data.is_empty() {
            state.data.clear();
            state.modified = true;
        }
        Ok(())
    }

    /// Copy of the current payload.
    pub fn data(&self) -> std::result::Result<SessionData, InvalidStateError> {
        let state = self.lock();
        state.ensure_live()?;
        Ok(state.data.clone())
    }

    /// Mark the session for deletion. Terminal; repeated calls are no-ops.
    pub fn destroy(&self) {
        self.lock().destroyed = true;
    }

    /// Swap in a fresh id and an empty payload.
    ///
    /// The old record is deleted when the session is committed. Nothing is
    /// carried over: re-insert whatever should survive.
    pub fn regenerate(&self) -> std::result::Result<String, InvalidStateError> {
        let new_id = self.generator.generate();
        let mut state = self.lock();
        state.ensure_live()?;
        if !state.is_new {
            let old_id = std::mem::replace(&mut state.id, new_id.clone());
            state.superseded.push(old_id);
        } else {
            state.id = new_id.clone();
        }
        state.data.clear();
        state.is_new = true;
        state.modified = false;
        state.regenerated = true;
        Ok(new_id)
    }

    pub fn is_new(&self) -> bool {
        self.lock().is_new
    }

    pub fn is_modified(&self) -> bool {
        self.lock().modified
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    pub fn cookie(&self) -> CookieOptions {
        self.lock().cookie.clone()
    }

    /// Override this session's cookie lifetime.
    ///
    /// Only allowed before the session is first persisted.
    pub fn set_max_age(&self, max_age: Option<u64>) -> std::result::Result<(), InvalidStateError> {
        let mut state = self.lock();
        state.ensure_live()?;
        if !state.is_new {
            return Err(InvalidStateError::CookieLocked {
                id: state.id.clone(),
            });
        }
        state.cookie.max_age = max_age;
        Ok(())
    }

    /// Take the state to commit, or `None` if it was already committed.
    pub(crate) fn begin_commit(&self) -> Option<Snapshot> {
        let mut state = self.lock();
        if state.committed {
            return None;
        }
        state.committed = true;
        Some(Snapshot {
            id: state.id.clone(),
            data: state.data.clone(),
            cookie: state.cookie.clone(),
            is_new: state.is_new,
            modified: state.modified,
            destroyed: state.destroyed,
            regenerated: state.regenerated,
            superseded: std::mem::take(&mut state.superseded),
        })
    }

    /// Put back ids that still need deleting after a failed commit, so the
    /// caller may retry.
    pub(crate) fn abort_commit(&self, superseded: Vec<String>) {
        let mut state = self.lock();
        state.committed = false;
        state.superseded.extend(superseded);
    }

    pub(crate) fn mark_persisted(&self) {
        let mut state = self.lock();
        state.is_new = false;
        state.modified = false;
        state.regenerated = false;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Session")
            .field("id", &state.id)
            .field("is_new", &state.is_new)
            .field("modified", &state.modified)
            .field("destroyed", &state.destroyed)
            .finish()
    }
}
