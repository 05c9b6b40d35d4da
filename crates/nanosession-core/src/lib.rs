//! Server-side sessions for `http`/tower services.
//!
//! A [`SessionLayer`] resolves a [`Session`] from the request cookie before
//! the inner service runs and commits it afterwards: persisting new or
//! modified sessions, touching unchanged ones, and destroying the ones the
//! handler gave up. `Set-Cookie` is only emitted when the client-side id or
//! its expiry changes.

pub mod codec;
pub mod config;
pub mod error;
#[cfg(feature = "axum")]
pub mod extract;
pub mod id;
pub mod manager;
pub mod middleware;
pub mod session;
pub mod store;

pub use codec::{CookieOptions, SameSite};
pub use config::SessionConfig;
pub use error::{ConfigError, Error, InvalidStateError, Result, StoreError};
pub use id::{IdGenerator, IdStrategy};
pub use manager::{Commit, Outcome, SessionManager};
pub use middleware::{SessionLayer, SessionService};
pub use session::{Session, SessionData};
pub use store::{MemoryStore, SessionStore, SessionStoreHandle};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
