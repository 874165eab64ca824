use axum::extract::DefaultBodyLimit;
use axum::handler::Handler;
use axum::routing::{get, post, MethodRouter};
use axum::{middleware, Router};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::connection;
use crate::error::{Error, Result};
use crate::error_injector::{self, ErrorInjector};
use crate::handlers::{health_check, ingest};
use crate::health::Readiness;
use crate::latency::{self, LatencyInjector};
use crate::middleware::{logging_middleware, NextRequestId, REQUEST_ID_HEADER};
use crate::rate_limiter::{self, RateLimiter};
use crate::statistics::{self, Statistics, StatisticsCollector};

/// The per-request injection chain, outermost first: statistics capture,
/// rate limiting, latency, error injection.
#[derive(Debug, Clone)]
pub struct Pipeline {
    statistics: Arc<StatisticsCollector>,
    rate_limiter: Arc<RateLimiter>,
    latency: Arc<LatencyInjector>,
    errors: Arc<ErrorInjector>,
}

impl Pipeline {
    /// Compiles every expression up front; a bad expression fails here rather
    /// than on the first request.
    pub fn new(config: &ServerConfig, statistics: Arc<StatisticsCollector>, started: Instant) -> Result<Self> {
        Ok(Self {
            statistics,
            rate_limiter: Arc::new(RateLimiter::new(&config.rate_limit)?),
            latency: Arc::new(LatencyInjector::new(&config.latency, started)?),
            errors: Arc::new(ErrorInjector::new(config.error_expression.as_deref(), started)?),
        })
    }

    pub fn statistics(&self) -> &Arc<StatisticsCollector> {
        &self.statistics
    }

    /// Routes POST and PUT to `handler` behind the injection chain. Bodies
    /// of any size are accepted.
    pub fn wrap<H, T>(&self, handler: H) -> MethodRouter
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        let layers = ServiceBuilder::new()
            .layer(DefaultBodyLimit::disable())
            .layer(middleware::from_fn_with_state(self.statistics.clone(), statistics::capture))
            .layer(middleware::from_fn_with_state(self.rate_limiter.clone(), rate_limiter::enforce))
            .layer(middleware::from_fn_with_state(self.latency.clone(), latency::inject))
            .layer(middleware::from_fn_with_state(self.errors.clone(), error_injector::inject));

        post(handler.clone()).put(handler).route_layer(layers)
    }
}

/// Builds the application router. Every path other than the health check
/// ingests through the injection chain.
pub fn create_app(pipeline: &Pipeline, readiness: Readiness) -> Router {
    let ingest = pipeline.wrap(ingest);

    Router::new()
        .route("/_health", get(health_check).with_state(readiness))
        .fallback_service(ingest)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(REQUEST_ID_HEADER, NextRequestId))
                .layer(PropagateRequestIdLayer::new(REQUEST_ID_HEADER))
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

pub struct Server {
    config: ServerConfig,
    statistics: Arc<StatisticsCollector>,
    readiness: Readiness,
    app: Router,
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let statistics = Arc::new(StatisticsCollector::new());
        let readiness = Readiness::new();
        let pipeline = Pipeline::new(&config, statistics.clone(), Instant::now())?;
        let app = create_app(&pipeline, readiness.clone());

        Ok(Self {
            config,
            statistics,
            readiness,
            app,
        })
    }

    /// Binds the listener and starts serving in the background.
    pub async fn start(self) -> Result<RunningServer> {
        let listener = TcpListener::bind(self.config.address).await?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (drain_tx, drain_rx) = watch::channel(());

        let accept = tokio::spawn(connection::serve(listener, self.app, shutdown_rx.clone(), drain_rx));
        let reporter = statistics::spawn_reporter(self.statistics.clone(), self.config.report_interval, shutdown_rx);

        self.readiness.set_ready(true);
        info!(address = %local_addr, "Server is ready to handle requests at {}", local_addr);

        Ok(RunningServer {
            local_addr,
            statistics: self.statistics,
            readiness: self.readiness,
            shutdown_tx,
            drain_tx,
            accept,
            reporter,
        })
    }

    /// Serves until `signal` resolves, then shuts down gracefully and returns
    /// the final statistics.
    pub async fn run(self, signal: impl Future<Output = ()>, shutdown_timeout: Duration) -> Result<Statistics> {
        let running = self.start().await?;
        signal.await;
        Ok(running.shutdown(shutdown_timeout).await)
    }
}

pub struct RunningServer {
    local_addr: SocketAddr,
    statistics: Arc<StatisticsCollector>,
    readiness: Readiness,
    shutdown_tx: watch::Sender<bool>,
    drain_tx: watch::Sender<()>,
    accept: JoinHandle<()>,
    reporter: JoinHandle<()>,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn snapshot(&self) -> Statistics {
        self.statistics.snapshot()
    }

    /// Stops accepting connections, waits up to `timeout` for in-flight
    /// requests and returns the final statistics. Requests still running when
    /// the timeout expires are abandoned.
    pub async fn shutdown(self, timeout: Duration) -> Statistics {
        let RunningServer {
            statistics,
            readiness,
            shutdown_tx,
            drain_tx,
            accept,
            reporter,
            ..
        } = self;

        info!("Server is shutting down");
        readiness.set_ready(false);
        shutdown_tx.send_replace(true);

        let drained = async move {
            if let Err(err) = accept.await {
                error!(error = %err, "accept loop failed");
            }
            drain_tx.closed().await;
        };
        if tokio::time::timeout(timeout, drained).await.is_err() {
            warn!(error = %Error::ShutdownTimeout(timeout), "could not gracefully shutdown the server");
        }

        if let Err(err) = reporter.await {
            error!(error = %err, "statistics reporter failed");
        }
        statistics.settle().await;

        info!("Server stopped");
        statistics.snapshot()
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
