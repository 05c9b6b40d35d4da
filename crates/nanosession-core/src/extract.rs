//! axum extractors for the session and its store.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;

use crate::session::Session;
use crate::store::SessionStoreHandle;

const MISSING_LAYER: &str = "Session layer is not installed";

impl<S> FromRequestParts<S> for Session
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Session>()
            .cloned()
            .ok_or((StatusCode::INTERNAL_SERVER_ERROR, MISSING_LAYER))
    }
}

impl<S> FromRequestParts<S> for SessionStoreHandle
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<SessionStoreHandle>()
            .cloned()
            .ok_or((StatusCode::INTERNAL_SERVER_ERROR, MISSING_LAYER))
    }
}
