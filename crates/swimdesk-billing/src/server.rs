use crate::api::{build_router, AppState};
use crate::config::{BillingConfig, StorageBackend};
use crate::domain::clock::SystemClock;
use crate::metrics::PrometheusMetricsRecorder;
use crate::storage::{BillingRepository, InMemoryBillingRepository, PgBillingRepository};

use anyhow::Context;
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::timeout::TimeoutLayer;
use tracing::{error, info, warn};

/// Billing server that hosts the HTTP API
pub struct BillingServer {
    config: BillingConfig,
    repository: Arc<dyn BillingRepository + Send + Sync>,
    pool: Option<PgPool>,
    metrics: Option<Arc<PrometheusMetricsRecorder>>,
}

impl BillingServer {
    pub async fn new_with_config(config: BillingConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let (repository, pool): (Arc<dyn BillingRepository + Send + Sync>, Option<PgPool>) =
            match config.storage.backend {
                StorageBackend::Postgres => {
                    let pool = PgPoolOptions::new()
                        .max_connections(config.database.max_connections)
                        .min_connections(config.database.min_connections)
                        .acquire_timeout(config.connect_timeout())
                        .connect(&config.database.url)
                        .await
                        .context("Failed to connect to database")?;
                    let repository =
                        PgBillingRepository::new(pool.clone(), config.billing.lock_timeout_seconds);
                    (Arc::new(repository), Some(pool))
                }
                StorageBackend::Memory => {
                    warn!("Using in-memory storage; billing records are lost on restart");
                    (
                        Arc::new(InMemoryBillingRepository::new(config.lock_timeout())),
                        None,
                    )
                }
            };

        let metrics = if config.metrics.enabled {
            Some(Arc::new(
                PrometheusMetricsRecorder::install().context("Failed to initialize metrics")?,
            ))
        } else {
            None
        };

        Ok(Self {
            config,
            repository,
            pool,
            metrics,
        })
    }

    /// Server over an existing repository, used by tests and embedding callers.
    pub fn with_repository(
        config: BillingConfig,
        repository: Arc<dyn BillingRepository + Send + Sync>,
    ) -> Self {
        Self {
            config,
            repository,
            pool: None,
            metrics: None,
        }
    }

    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        let Some(pool) = &self.pool else {
            info!("No database configured, skipping migrations");
            return Ok(());
        };

        info!("Running database migrations");
        match sqlx::migrate!("./migrations").run(pool).await {
            Ok(_) => {
                info!("Database migrations completed successfully");
                Ok(())
            }
            Err(e) => {
                error!("Failed to run database migrations: {}", e);
                Err(anyhow::anyhow!("Migration failed: {}", e))
            }
        }
    }

    pub fn router(&self) -> Router {
        let state = AppState::new(
            self.repository.clone(),
            Arc::new(SystemClock),
            self.config.billing.default_invoice_due_days,
            self.metrics.clone(),
        );
        build_router(state).layer(TimeoutLayer::new(self.config.request_timeout()))
    }

    pub async fn run_with_listener(
        self,
        listener: tokio::net::TcpListener,
        shutdown_signal: tokio::sync::oneshot::Receiver<()>,
    ) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!("Starting billing HTTP server on {}", addr);

        let router = self.router();
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_signal.await;
            })
            .await
            .context("HTTP server error")?;

        self.shutdown().await
    }

    pub async fn serve(
        self,
        shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let addr: SocketAddr = format!(
            "{}:{}",
            self.config.http.listen_address, self.config.http.port
        )
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid server address: {}", e))?;

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;

        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            shutdown_signal.await;
            let _ = tx.send(());
        });

        self.run_with_listener(listener, rx).await
    }

    async fn shutdown(self) -> anyhow::Result<()> {
        info!("Shutting down billing server");

        if let Some(pool) = self.pool {
            info!("Closing database connections");
            pool.close().await;
        }

        info!("Billing server shutdown complete");
        Ok(())
    }
}
