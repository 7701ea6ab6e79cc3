//! Service Registry
//!
//! Control plane binary: hosts the registry and config engines over the
//! coordination store, keeps the search index reconciled, and serves
//! health and Prometheus endpoints.
//!
//! ```text
//! svc-registry run                  # control plane + periodic reconcile
//! svc-registry consistency print    # ask the running plane for a comparison
//! ```

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use svc_registry::{
    respond, AppConfig, ConfigLedgerRef, ConfigStore, ConsistencyReconciler,
    CoordinationStoreRef, Envelope, MemoryStore, ReconcileMode, ReconcileReport,
    RegistryMetrics, SearchIndexRef, ServiceRegistry, SqlIndex,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Service Registry - discovery and dynamic config control plane
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// YAML config file; built-in defaults apply when omitted
    #[arg(long, short, global = true, env = "SVC_REGISTRY_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the control plane
    Run {
        /// Health server bind address
        #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
        health_addr: SocketAddr,

        /// Metrics server bind address
        #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
        metrics_addr: SocketAddr,
    },

    /// Compare store descriptors with the search index of a running plane
    Consistency {
        #[arg(value_enum)]
        mode: ReconcileMode,

        /// Health server address of the running control plane
        #[arg(long, env = "ADMIN_ADDR", default_value = "127.0.0.1:8081")]
        admin_addr: SocketAddr,

        /// Give up waiting for the pass after this many seconds
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(&cli);

    let config = match &cli.config {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AppConfig::default(),
    };

    match cli.command {
        Command::Run {
            health_addr,
            metrics_addr,
        } => {
            info!("Starting {} {}", svc_registry::NAME, svc_registry::VERSION);
            info!("  Service prefix: {}", config.services.key_prefix);
            info!("  Config prefix: {}", config.configs.key_prefix);
            info!("  Database: {}", config.database.url);

            let plane = ControlPlane::build(&config).await?;
            plane.run(&config, health_addr, metrics_addr).await?;
        }
        Command::Consistency {
            mode,
            admin_addr,
            timeout_secs,
        } => {
            let report =
                request_reconcile(admin_addr, mode, Duration::from_secs(timeout_secs)).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_consistent() {
                warn!(
                    missing = report.missing.len(),
                    orphaned = report.orphaned.len(),
                    "store and index disagree"
                );
            }
        }
    }

    info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Control Plane
// =============================================================================

/// Every component wired over one store and one index
struct ControlPlane {
    store: Arc<MemoryStore>,
    registry: Arc<ServiceRegistry>,
    configs: Arc<ConfigStore>,
    reconciler: Arc<ConsistencyReconciler>,
    metrics: Arc<RegistryMetrics>,
}

impl ControlPlane {
    async fn build(config: &AppConfig) -> anyhow::Result<Self> {
        let store = MemoryStore::with_config(config.store_config());
        let index = Arc::new(
            SqlIndex::connect(&config.index_config())
                .await
                .context("connecting search index")?,
        );
        let metrics = Arc::new(RegistryMetrics::new());
        let keyspace = config.keyspace();

        let store_ref: CoordinationStoreRef = store.clone();
        let search: SearchIndexRef = index.clone();
        let ledger: ConfigLedgerRef = index;

        let registry = ServiceRegistry::new(store_ref.clone(), search.clone(), metrics.clone())
            .with_keyspace(keyspace.clone())
            .with_address_policy(config.address_policy()?)
            .with_resolver(config.resolver()?);
        let configs = ConfigStore::new(store_ref.clone(), ledger, metrics.clone())
            .with_keyspace(keyspace.clone());
        let reconciler =
            ConsistencyReconciler::new(config.reconciler_config(), store_ref, search, metrics.clone())
                .with_keyspace(keyspace);

        Ok(Self {
            store,
            registry: Arc::new(registry),
            configs: Arc::new(configs),
            reconciler: Arc::new(reconciler),
            metrics,
        })
    }

    /// Store and index both answer
    async fn ready(&self) -> bool {
        let configs = self.configs.range("", "", None).await;
        let index = self.registry.search_service("", 0, 0).await;
        configs.is_ok() && index.is_ok()
    }

    async fn run(
        self,
        config: &AppConfig,
        health_addr: SocketAddr,
        metrics_addr: SocketAddr,
    ) -> anyhow::Result<()> {
        let plane = Arc::new(self);
        let shutdown = CancellationToken::new();
        let mut tasks = vec![plane.store.spawn_reaper()];

        if config.reconcile.interval_secs > 0 {
            let period = Duration::from_secs(config.reconcile.interval_secs);
            info!("Reconcile every {:?}", period);
            tasks.push(tokio::spawn(
                plane.reconciler.clone().run_periodic(period, shutdown.clone()),
            ));
        } else {
            info!("Periodic reconcile disabled");
        }

        let health_plane = plane.clone();
        let health_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = run_health_server(health_addr, health_plane, health_shutdown).await {
                error!("Health server error: {}", e);
            }
        }));

        let metrics = plane.metrics.clone();
        let metrics_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(metrics_addr, metrics, metrics_shutdown).await {
                error!("Metrics server error: {}", e);
            }
        }));

        info!("Control plane running");
        tokio::signal::ctrl_c()
            .await
            .context("waiting for ctrl-c")?;
        info!("Shutdown signal received");

        shutdown.cancel();
        plane.store.shutdown();
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!("Task ended abnormally: {}", e);
            }
        }
        Ok(())
    }
}

// =============================================================================
// Consistency Client
// =============================================================================

/// Run one reconcile pass inside the control plane at `addr`, which owns
/// the coordination store
async fn request_reconcile(
    addr: SocketAddr,
    mode: ReconcileMode,
    timeout: Duration,
) -> anyhow::Result<ReconcileReport> {
    let url = format!("http://{}/reconcile/{}", addr, mode);
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("building http client")?;

    let response = client
        .post(&url)
        .send()
        .await
        .with_context(|| format!("contacting control plane at {}", addr))?;
    let status = response.status();
    let envelope: Envelope<ReconcileReport> = response
        .json()
        .await
        .with_context(|| format!("decoding reconcile response (HTTP {})", status))?;

    if let (true, Some(report)) = (envelope.ok, envelope.result) {
        return Ok(report);
    }
    match envelope.error {
        Some(err) => anyhow::bail!("reconcile {} failed: {} {}", mode, err.code, err.message),
        None => anyhow::bail!("reconcile {} returned HTTP {} without a report", mode, status),
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(cli: &Cli) {
    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "sqlx=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// HTTP Servers
// =============================================================================

fn text_response(status: StatusCode, content_type: &'static str, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn json_response<T: Serialize>((status, envelope): (u16, Envelope<T>)) -> Response<Body> {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    match serde_json::to_vec(&envelope) {
        Ok(body) => text_response(status, "application/json", body),
        Err(e) => {
            error!("Response encoding failed: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "encoding failed")
        }
    }
}

/// Liveness, readiness and on-demand reconcile passes
async fn handle_admin(plane: Arc<ControlPlane>, req: Request<Body>) -> Response<Body> {
    let path = req.uri().path();
    if let Some(mode) = path.strip_prefix("/reconcile/") {
        if req.method() != Method::POST {
            return text_response(StatusCode::METHOD_NOT_ALLOWED, "text/plain", "use POST");
        }
        let result = match mode.parse::<ReconcileMode>() {
            Ok(mode) => plane.reconciler.run(mode).await,
            Err(e) => Err(e),
        };
        return json_response(respond(result));
    }

    match path {
        "/healthz" | "/livez" => text_response(StatusCode::OK, "text/plain", "ok"),
        "/readyz" => {
            if plane.ready().await {
                text_response(StatusCode::OK, "text/plain", "ok")
            } else {
                text_response(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "not ready")
            }
        }
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "not found"),
    }
}

async fn serve<F, Fut>(
    name: &str,
    addr: SocketAddr,
    handler: F,
    shutdown: CancellationToken,
) -> anyhow::Result<()>
where
    F: Fn(Request<Body>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<Body>> + Send + 'static,
{
    let make_svc = make_service_fn(move |_conn| {
        let handler = handler.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let response = handler(req);
                async move { Ok::<_, Infallible>(response.await) }
            }))
        }
    });

    info!("{} server listening on {}", name, addr);
    Server::try_bind(&addr)
        .with_context(|| format!("binding {} server", name))?
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .with_context(|| format!("{} server", name))
}

async fn run_health_server(
    addr: SocketAddr,
    plane: Arc<ControlPlane>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let handler = move |req: Request<Body>| handle_admin(plane.clone(), req);
    serve("Health", addr, handler, shutdown).await
}

async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<RegistryMetrics>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let handler = move |req: Request<Body>| {
        let metrics = metrics.clone();
        async move {
            match req.uri().path() {
                "/metrics" => match metrics.encode_prometheus() {
                    Ok(text) => text_response(
                        StatusCode::OK,
                        "text/plain; version=0.0.4",
                        text,
                    ),
                    Err(e) => {
                        error!("Metrics encoding failed: {}", e);
                        text_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "text/plain",
                            "metrics unavailable",
                        )
                    }
                },
                _ => text_response(StatusCode::NOT_FOUND, "text/plain", "not found"),
            }
        }
    };
    serve("Metrics", addr, handler, shutdown).await
}
