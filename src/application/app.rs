use crate::config::{AccessSettings, Settings};
use crate::infrastructure::log_messages::application as messages;
use crate::infrastructure::{
    Database, HttpSessionValidator, InMemoryLogStore, InMemoryMappingStore, LogStore,
    MappingStore, PostgresLogStore, PostgresMappingStore, SessionValidator,
    StaticSessionValidator,
};
use crate::proxy::headers::HeaderPolicy;
use crate::proxy::{RelayComponents, RelayService};
use crate::{Error, Result};
use axum::http::Uri;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, instrument, warn};

/// Main application struct that coordinates all components
pub struct Application {
    settings: Settings,
    service: RelayService,
    database: Option<Database>,
}

impl Application {
    /// Build stores, the session validator and the relay service
    ///
    /// Without a `database` section the stores are in-memory and seeded
    /// from the `mappings` list.
    #[instrument(skip_all, fields(mode = %settings.application.mode))]
    pub async fn new(settings: Settings) -> Result<Self> {
        info!(environment = %settings.application.environment, "{}", messages::STARTING);

        let (mappings, log_store, database) = match &settings.database {
            Some(database_settings) => {
                let database = Database::connect(database_settings).await?;
                if !settings.mappings.is_empty() {
                    warn!(
                        seeds = settings.mappings.len(),
                        "Ignoring seed mappings, the database is authoritative"
                    );
                }
                let mappings: Arc<dyn MappingStore> =
                    Arc::new(PostgresMappingStore::new(database.pool().clone()));
                let log_store: Arc<dyn LogStore> =
                    Arc::new(PostgresLogStore::new(database.pool().clone()));
                (mappings, log_store, Some(database))
            }
            None => {
                let seeds = settings.seed_mappings()?;
                let retain = settings.proxy.retain_per_code.max(1);
                info!(seeds = seeds.len(), retain, "{}", messages::IN_MEMORY_STORES);
                let mappings: Arc<dyn MappingStore> =
                    Arc::new(InMemoryMappingStore::with_mappings(seeds));
                let log_store: Arc<dyn LogStore> =
                    Arc::new(InMemoryLogStore::with_retention(retain));
                (mappings, log_store, None)
            }
        };

        let session = session_validator(&settings.access)?;
        let mode = settings.application.mode;

        let service = RelayService::start(RelayComponents {
            proxy: settings.proxy_config(),
            header_policy: HeaderPolicy::from_config(&settings.headers, mode),
            rate_limit: settings.rate_limit_config(),
            purge_interval: Duration::from_secs(settings.rate_limit.purge_interval_secs),
            observers: settings.observer_config(),
            mode,
            global_access: settings.access.global_access,
            cors: Some(settings.cors.clone()),
            mappings,
            log_store,
            session,
        });

        Ok(Self {
            settings,
            service,
            database,
        })
    }

    /// Bind the configured address and serve until ctrl-c or SIGTERM
    #[instrument(skip(self))]
    pub async fn run(self) -> Result<()> {
        let address = format!(
            "{}:{}",
            self.settings.application.host, self.settings.application.port
        );
        let listener = TcpListener::bind(&address).await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on an already bound listener until `shutdown` resolves, then
    /// drain the log writer within the configured grace period
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        info!(address = %listener.local_addr()?, "{}", messages::LISTENING);

        let router = self.service.router();

        // Open SSE streams never end on their own; close them once the
        // signal fires so the server can finish draining connections
        let hub = Arc::clone(&self.service.state().hub);
        let signal = async move {
            shutdown.await;
            hub.close();
        };

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await?;

        let grace = Duration::from_secs(self.settings.application.shutdown_grace_secs);
        match tokio::time::timeout(grace, self.service.shutdown()).await {
            Ok(written) => info!(written, "{}", messages::STOPPED),
            Err(_) => warn!(?grace, "Log writer did not drain within the grace period"),
        }

        Ok(())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn service(&self) -> &RelayService {
        &self.service
    }

    pub fn database(&self) -> Option<&Database> {
        self.database.as_ref()
    }
}

fn session_validator(access: &AccessSettings) -> Result<Arc<dyn SessionValidator>> {
    match &access.session_url {
        Some(url) => {
            let uri: Uri = url
                .parse()
                .map_err(|e| Error::invalid_setting("access.session_url", format!("{e}")))?;
            Ok(Arc::new(HttpSessionValidator::new(
                uri,
                Duration::from_millis(access.session_timeout_ms),
            )))
        }
        None => Ok(Arc::new(StaticSessionValidator::new(access.token_table()))),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("{}", messages::SHUTDOWN_SIGNAL);
}
