//! Tower integration.
//!
//! [`SessionLayer`] wraps any `http` service: it resolves the session
//! before calling the inner service, exposes it through request extensions
//! and commits it once the inner future completes.

use std::task::{Context, Poll};

use futures::future::BoxFuture;
use http::header::SET_COOKIE;
use http::{Request, Response, StatusCode};
use tower::{Layer, Service};
use tracing::error;

use crate::config::SessionConfig;
use crate::error::ConfigError;
use crate::manager::SessionManager;
use crate::session::Session;

/// Layer that attaches a [`Session`] to every request.
#[derive(Debug, Clone)]
pub struct SessionLayer {
    manager: SessionManager,
}

impl SessionLayer {
    pub fn new(manager: SessionManager) -> Self {
        Self { manager }
    }

    /// Build a layer with the configured store and id generator.
    pub fn from_config(config: SessionConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(SessionManager::new(config)?))
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }
}

impl<S> Layer<S> for SessionLayer {
    type Service = SessionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SessionService {
            inner,
            manager: self.manager.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionService<S> {
    inner: S,
    manager: SessionManager,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for SessionService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        // Keep the instance that was polled ready.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let manager = self.manager.clone();

        Box::pin(async move {
            // An upstream layer owns this session.
            if req.extensions().get::<Session>().is_some() {
                return inner.call(req).await;
            }

            let session = manager.resolve(req.headers()).await;
            req.extensions_mut().insert(session.clone());
            req.extensions_mut().insert(manager.store());

            let mut res = inner.call(req).await?;

            match manager.commit(&session).await {
                Ok(commit) => {
                    if let Some(cookie) = commit.into_set_cookie() {
                        res.headers_mut().append(SET_COOKIE, cookie);
                    }
                    Ok(res)
                }
                Err(e) => {
                    error!("Failed to commit session: {}", e);
                    let mut failed = Response::new(ResBody::default());
                    *failed.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                    Ok(failed)
                }
            }
        })
    }
}
