//! Relay service: router, handlers and background tasks
//!
//! ```rust,ignore
//! let service = RelayService::start(components);
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//! let hub = Arc::clone(&service.state().hub);
//! axum::serve(
//!     listener,
//!     service.router().into_make_service_with_connect_info::<SocketAddr>(),
//! )
//! .with_graceful_shutdown(async move {
//!     signal.await;
//!     hub.close();
//! })
//! .await?;
//! service.shutdown().await;
//! ```
//!
//! Forwarded traffic falls through to the forwarding engine; the control
//! endpoints (`/health`, `/status`, `/events`, `/logs/{code}`) are served
//! directly and never reach a destination.

use crate::config::CorsSettings;
use crate::domain::{ExchangeRecord, MappingCode, RequestId};
use crate::infrastructure::{LogStore, MappingStore, SessionValidator};
use crate::proxy::error_response::ScopedError;
use crate::proxy::forwarding::ForwardingEngine;
use crate::proxy::guard::{RateLimitConfig, RequestGuard};
use crate::proxy::headers::{paths, HeaderPolicy};
use crate::proxy::log_writer::LogWriter;
use crate::proxy::middleware::AccessControl;
use crate::proxy::middleware_stack::RelayMiddlewareStack;
use crate::proxy::observer_hub::{HubMessage, ObserverConfig, ObserverHub};
use crate::proxy::recorder::ExchangeRecorder;
use crate::proxy::types::*;
use axum::{
    extract::{ConnectInfo, Path, Query, Request, State},
    http::HeaderMap,
    response::{
        sse::{Event, Sse},
        Response,
    },
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures_core::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Records returned by `/logs/{code}` when no limit is given
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Upper bound on the `/logs/{code}` limit
pub const MAX_PAGE_SIZE: usize = 500;

/// Everything the relay needs from the outside world
pub struct RelayComponents {
    pub proxy: ProxyConfig,
    pub header_policy: HeaderPolicy,
    pub rate_limit: RateLimitConfig,
    pub purge_interval: Duration,
    pub observers: ObserverConfig,
    pub mode: DeploymentMode,
    pub global_access: bool,
    pub cors: Option<CorsSettings>,
    pub mappings: Arc<dyn MappingStore>,
    pub log_store: Arc<dyn LogStore>,
    pub session: Arc<dyn SessionValidator>,
}

/// Shared state handed to every handler
#[derive(Clone)]
pub struct RelayState {
    pub engine: ForwardingEngine,
    pub hub: Arc<ObserverHub>,
    pub log_store: Arc<dyn LogStore>,
    pub access: Arc<AccessControl>,
    pub guard: Arc<RequestGuard>,
    pub mode: DeploymentMode,
}

/// Handles of the tasks that outlive individual requests
pub struct BackgroundTasks {
    shutdown_tx: watch::Sender<bool>,
    writer: JoinHandle<usize>,
    maintenance: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Stop maintenance and wait for the log writer to drain its queue;
    /// returns the number of records the writer persisted
    pub async fn shutdown(self) -> usize {
        let _ = self.shutdown_tx.send(true);

        for handle in self.maintenance {
            if let Err(e) = handle.await {
                warn!(error = %e, "Maintenance task ended abnormally");
            }
        }

        match self.writer.await {
            Ok(written) => written,
            Err(e) => {
                warn!(error = %e, "Log writer ended abnormally");
                0
            }
        }
    }
}

/// The assembled relay
pub struct RelayService {
    state: RelayState,
    cors: Option<CorsSettings>,
    tasks: BackgroundTasks,
}

impl RelayService {
    /// Wire the components together and spawn the background tasks
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(components: RelayComponents) -> Self {
        let RelayComponents {
            proxy,
            header_policy,
            rate_limit,
            purge_interval,
            observers,
            mode,
            global_access,
            cors,
            mappings,
            log_store,
            session,
        } = components;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let hub = Arc::new(ObserverHub::new(observers));
        let (writer, queue) = LogWriter::new(
            Arc::clone(&log_store),
            proxy.log_queue_capacity,
            shutdown_rx.clone(),
        );
        let writer = tokio::spawn(writer.run());

        let guard = Arc::new(
            RequestGuard::new(rate_limit)
                .with_max_request_size(proxy.max_request_size)
                .with_denied_content_types(&proxy.denied_content_types),
        );

        let maintenance = vec![
            hub.spawn_maintenance(shutdown_rx.clone()),
            spawn_guard_purge(Arc::clone(&guard), purge_interval, shutdown_rx),
        ];

        let recorder = ExchangeRecorder::new(Arc::clone(&hub), queue);
        let engine = ForwardingEngine::new(proxy, Arc::clone(&mappings), header_policy, recorder);
        let access = Arc::new(AccessControl::new(global_access, session, mappings));

        info!(%mode, global_access, "Relay service started");

        Self {
            state: RelayState {
                engine,
                hub,
                log_store,
                access,
                guard,
                mode,
            },
            cors,
            tasks: BackgroundTasks {
                shutdown_tx,
                writer,
                maintenance,
            },
        }
    }

    pub fn state(&self) -> &RelayState {
        &self.state
    }

    /// Router with the full middleware stack applied
    pub fn router(&self) -> Router {
        let router = Router::new()
            .route(paths::HEALTH, get(health_handler))
            .route(paths::STATUS, get(status_handler))
            .route(paths::EVENTS, get(events_handler))
            .route(paths::LOGS, get(logs_handler))
            .fallback(proxy_handler)
            .with_state(self.state.clone());

        let mut stack = RelayMiddlewareStack::new(Arc::clone(&self.state.guard));
        if let Some(cors) = &self.cors {
            stack = stack.with_cors(cors);
        }
        stack.apply_to_router(router)
    }

    pub async fn shutdown(self) -> usize {
        let Self { state, tasks, .. } = self;
        state.hub.close();
        drop(state);
        tasks.shutdown().await
    }
}

fn spawn_guard_purge(
    guard: Arc<RequestGuard>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let purged = guard.purge_stale();
                    if purged > 0 {
                        debug!(purged, tracked = guard.tracked_clients(), "Purged stale rate windows");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

/// Axum handler for forwarded traffic
async fn proxy_handler(
    State(state): State<RelayState>,
    request_id: RequestId,
    request: Request,
) -> Result<Response, ScopedError> {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client_ip = state.guard.client_ip(request.headers(), peer);

    state
        .engine
        .handle(request, client_ip, request_id)
        .await
        .map_err(|error| ScopedError::new(error, request_id))
}

/// Health check handler
async fn health_handler() -> &'static str {
    "OK"
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatus {
    pub mode: DeploymentMode,
    pub global_access: bool,
    pub live_observers: usize,
    pub timestamp: DateTime<Utc>,
}

async fn status_handler(State(state): State<RelayState>) -> Json<RelayStatus> {
    Json(RelayStatus {
        mode: state.mode,
        global_access: state.access.global_access(),
        live_observers: state.hub.live_count(),
        timestamp: Utc::now(),
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub code: Option<String>,
    pub token: Option<String>,
}

async fn events_handler(
    State(state): State<RelayState>,
    request_id: RequestId,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ScopedError> {
    let scoped = |error: ProxyError| ScopedError::new(error, request_id);

    let code = query
        .code
        .as_deref()
        .map(parse_code)
        .transpose()
        .map_err(scoped)?;

    state
        .access
        .authorize(&headers, query.token.as_deref(), code.as_ref())
        .await
        .map_err(scoped)?;

    let subscription = state.hub.subscribe(code);
    debug!(observer_id = %subscription.id(), "Streaming events");

    Ok(Sse::new(
        subscription.map(|message| Ok::<_, Infallible>(hub_event(&message))),
    ))
}

/// SSE frame for a hub message; the event name mirrors the message type
fn hub_event(message: &HubMessage) -> Event {
    Event::default()
        .event(message.kind())
        .json_data(message)
        .unwrap_or_else(|e| {
            warn!(error = %e, kind = message.kind(), "Failed to encode observer message");
            Event::default().comment("encoding failed")
        })
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<String>,
    pub offset: Option<String>,
    pub token: Option<String>,
}

impl LogsQuery {
    /// Unparseable values fall back to the defaults
    fn page(&self) -> (usize, usize) {
        let limit = self
            .limit
            .as_deref()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        let offset = self
            .offset
            .as_deref()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        (limit, offset)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogsPage {
    pub code: MappingCode,
    pub limit: usize,
    pub offset: usize,
    pub records: Vec<ExchangeRecord>,
}

async fn logs_handler(
    State(state): State<RelayState>,
    request_id: RequestId,
    Path(code): Path<String>,
    headers: HeaderMap,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogsPage>, ScopedError> {
    let scoped = |error: ProxyError| ScopedError::new(error, request_id);

    let code = parse_code(&code).map_err(scoped)?;
    state
        .access
        .authorize(&headers, query.token.as_deref(), Some(&code))
        .await
        .map_err(scoped)?;

    let (limit, offset) = query.page();
    let records = state
        .log_store
        .query(&code, limit, offset)
        .await
        .map_err(|e| scoped(e.into()))?;

    Ok(Json(LogsPage {
        code,
        limit,
        offset,
        records,
    }))
}

fn parse_code(code: &str) -> ProxyResult<MappingCode> {
    MappingCode::try_new(code).map_err(|_| ProxyError::not_found(code))
}
