//! HTTP handlers. They parse requests, call one service and shape the reply.
//!
//! Caller identity is taken from the `x-actor-id` / `x-actor-admin` headers,
//! which the gateway in front of this service sets after authentication.

pub mod file_handlers;
pub mod health_handlers;
pub mod upload_handlers;

use crate::{
    config::UploadConfig,
    errors::AppError,
    services::{
        access::Actor, file_service::FileService, folder_upload::FolderUploadPlanner,
        preview::RequestOrigin, sequence::SequenceGenerator,
    },
};
use axum::{
    extract::FromRequestParts,
    http::{HeaderMap, header, request::Parts},
};
use sqlx::SqlitePool;
use std::sync::Arc;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub files: FileService,
    pub folders: FolderUploadPlanner,
    pub sequences: SequenceGenerator,
    pub upload: UploadConfig,
}

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_ADMIN_HEADER: &str = "x-actor-admin";

/// Read the caller from gateway headers. A missing or malformed id is 401.
pub fn actor_from_headers(headers: &HeaderMap) -> Result<Actor, AppError> {
    let id = headers
        .get(ACTOR_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|id| *id > 0)
        .ok_or_else(|| AppError::unauthorized("missing or invalid x-actor-id header"))?;
    let is_admin = headers
        .get(ACTOR_ADMIN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);
    Ok(Actor { id, is_admin })
}

/// Scheme and host the client used, honoring reverse-proxy headers.
pub fn origin_from_headers(headers: &HeaderMap) -> RequestOrigin {
    let header_str = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    // Only `http` and `https` may reach a generated URL.
    let forwarded = header_str("x-forwarded-proto")
        .and_then(|proto| proto.split(',').next())
        .map(|proto| proto.trim().to_ascii_lowercase())
        .filter(|proto| proto == "http" || proto == "https");
    let ssl = header_str("x-forwarded-ssl").is_some_and(|v| v.eq_ignore_ascii_case("on"));
    let scheme = match forwarded {
        Some(proto) => proto,
        None if ssl => "https".into(),
        None => "http".into(),
    };
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("localhost")
        .to_string();

    RequestOrigin { scheme, host }
}

impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        actor_from_headers(&parts.headers)
    }
}

impl<S> FromRequestParts<S> for RequestOrigin
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(origin_from_headers(&parts.headers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, StatusCode};

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_actor_headers() {
        let actor =
            actor_from_headers(&headers(&[("x-actor-id", "12"), ("x-actor-admin", "true")]))
                .unwrap();
        assert_eq!(actor, Actor::admin(12));
        assert_eq!(actor_from_headers(&headers(&[("x-actor-id", "5")])).unwrap(), Actor::new(5));

        let err = actor_from_headers(&headers(&[("x-actor-id", "abc")])).unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        assert!(actor_from_headers(&HeaderMap::new()).is_err());
    }

    #[test]
    fn test_origin_follows_proxy_headers() {
        let origin = origin_from_headers(&headers(&[
            ("host", "files.example.com"),
            ("x-forwarded-proto", "HTTPS, http"),
        ]));
        assert_eq!(origin.scheme, "https");
        assert_eq!(origin.host, "files.example.com");

        let ssl = origin_from_headers(&headers(&[("host", "a:8080"), ("x-forwarded-ssl", "on")]));
        assert_eq!(ssl.scheme, "https");
        assert_eq!(ssl.host, "a:8080");

        assert_eq!(origin_from_headers(&HeaderMap::new()), RequestOrigin::default());
    }

    #[test]
    fn test_origin_ignores_unknown_schemes() {
        let odd = origin_from_headers(&headers(&[
            ("host", "files.example.com"),
            ("x-forwarded-proto", "javascript"),
        ]));
        assert_eq!(odd.scheme, "http");

        let odd_with_ssl = origin_from_headers(&headers(&[
            ("x-forwarded-proto", "ftp"),
            ("x-forwarded-ssl", "on"),
        ]));
        assert_eq!(odd_with_ssl.scheme, "https");
    }
}
