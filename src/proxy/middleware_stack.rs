//! Middleware stack builder for clean composition

use crate::config::CorsSettings;
use crate::proxy::guard::RequestGuard;
use crate::proxy::middleware::*;
use axum::{
    http::{HeaderName, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tracing::warn;

const WILDCARD: &str = "*";

/// Builder for composing the relay middleware stack
pub struct RelayMiddlewareStack {
    guard: Arc<RequestGuard>,
    cors: CorsLayer,
}

impl RelayMiddlewareStack {
    pub fn new(guard: Arc<RequestGuard>) -> Self {
        Self {
            guard,
            cors: CorsLayer::permissive(),
        }
    }

    pub fn with_cors(mut self, settings: &CorsSettings) -> Self {
        self.cors = cors_layer(settings);
        self
    }

    /// Apply the complete middleware stack to a router
    ///
    /// Outer to inner: CORS, request ID, logging, error handling, guard.
    /// Preflight requests are answered before they reach the guard.
    pub fn apply_to_router<S>(self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        router
            .layer(from_fn_with_state(self.guard, guard_middleware))
            .layer(from_fn(error_handling_middleware))
            .layer(from_fn(logging_middleware))
            .layer(from_fn(request_id_middleware))
            .layer(self.cors)
    }
}

/// CORS layer from configuration; `*` in origins or headers allows any
pub fn cors_layer(settings: &CorsSettings) -> CorsLayer {
    let origins = if settings.allowed_origins.iter().any(|o| o == WILDCARD) {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(settings.allowed_origins.iter().filter_map(|origin| {
            HeaderValue::from_str(origin)
                .inspect_err(|_| warn!(origin, "Ignoring invalid CORS origin"))
                .ok()
        }))
    };

    let headers = if settings.allowed_headers.iter().any(|h| h == WILDCARD) {
        AllowHeaders::any()
    } else {
        AllowHeaders::list(
            settings
                .allowed_headers
                .iter()
                .filter_map(|name| HeaderName::try_from(name.as_str()).ok()),
        )
    };

    let methods: Vec<Method> = settings
        .allowed_methods
        .iter()
        .filter_map(|method| Method::from_bytes(method.to_ascii_uppercase().as_bytes()).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(methods)
        .allow_headers(headers)
        .max_age(Duration::from_secs(settings.max_age_secs))
}
