//! meshcache node
//!
//! Runs one or more cache nodes of a single cache in this process, joined
//! over the in-process transport, and serves their metrics and health.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        meshcache-node                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │  node-1      │◀──▶│  node-2      │◀──▶│  node-N      │       │
//! │  │  (seed)      │    │              │    │              │       │
//! │  └──────┬───────┘    └──────┬───────┘    └──────┬───────┘       │
//! │         └───────── InMemoryNetwork ─────────────┘               │
//! │                                                                  │
//! │   :8080 /metrics[/<node>]          :8081 /healthz /livez /readyz │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use meshcache::cluster::{InMemoryNetwork, NodeId};
use meshcache::config::CacheConfig;
use meshcache::engine::{CacheInstance, RuntimeContext};

// =============================================================================
// CLI Arguments
// =============================================================================

/// meshcache node - clustered in-memory cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cache configuration file (YAML); defaults apply when omitted
    #[arg(long, env = "MESHCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured cache name
    #[arg(long, env = "MESHCACHE_CACHE_NAME")]
    cache_name: Option<String>,

    /// Prefix of the node identifiers
    #[arg(long, env = "MESHCACHE_NODE_ID", default_value = "node")]
    node_id: String,

    /// Nodes to run in this process
    #[arg(long, env = "MESHCACHE_CLUSTER_SIZE", default_value = "1")]
    cluster_size: usize,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

type Instances = Arc<Vec<Arc<CacheInstance>>>;

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let mut config = match &args.config {
        Some(path) => CacheConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => CacheConfig::default(),
    };
    if let Some(name) = &args.cache_name {
        config.cache_name = name.clone();
    }
    if args.cluster_size > 1 && !config.topology.is_clustered() {
        anyhow::bail!(
            "{} nodes requested but topology {} is not clustered",
            args.cluster_size,
            config.topology
        );
    }

    info!("Starting meshcache");
    info!("  Cache: {}", config.cache_name);
    info!("  Topology: {}", config.topology);
    info!("  Nodes: {}", args.cluster_size);

    let network = InMemoryNetwork::new();
    let mut instances = Vec::with_capacity(args.cluster_size.max(1));
    let mut seed: Option<NodeId> = None;
    for n in 1..=args.cluster_size.max(1) {
        let id = NodeId::new(format!("{}-{}", args.node_id, n));
        let context = RuntimeContext::new(config.clone()).context("building runtime context")?;
        let instance = CacheInstance::new(id.clone(), context, network.transport(id.clone()))?;
        network.register(id.clone(), instance.node().clone());
        instance
            .start(seed.as_ref())
            .await
            .with_context(|| format!("starting {}", id))?;
        seed.get_or_insert(id);
        instances.push(instance);
    }
    let instances: Instances = Arc::new(instances);
    info!("Cache nodes started");

    let health_addr = args.health_addr.clone();
    let health_instances = instances.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_instances).await {
            error!("Health server error: {:#}", e);
        }
    });

    let metrics_addr = args.metrics_addr.clone();
    let metrics_instances = instances.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_instances).await {
            error!("Metrics server error: {:#}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown requested");

    // Leave in reverse join order so the seed hands off last
    for instance in instances.iter().rev() {
        if let Err(e) = instance.stop().await {
            warn!(node = %instance.id(), "Stop failed: {}", e);
        }
    }

    info!("meshcache shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?);

    if args.log_json {
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
    Ok(())
}

// =============================================================================
// HTTP plumbing
// =============================================================================

fn respond(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

async fn serve<F>(addr: &str, name: &'static str, handler: F) -> anyhow::Result<()>
where
    F: Fn(Request<Incoming>) -> Response<Full<Bytes>> + Clone + Send + Sync + 'static,
{
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid {} server address {}", name, addr))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {} server to {}", name, addr))?;

    info!("{} server listening on {}", name, addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .with_context(|| format!("{} server accept", name))?;
        let io = TokioIo::new(stream);
        let handler = handler.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let handler = handler.clone();
                async move { Ok::<_, Infallible>(handler(req)) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("{} server connection error: {}", name, e);
            }
        });
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str, instances: Instances) -> anyhow::Result<()> {
    serve(addr, "Health", move |req| health_response(req.uri().path(), &instances)).await
}

fn health_response(path: &str, instances: &[Arc<CacheInstance>]) -> Response<Full<Bytes>> {
    let probe = |ok: bool| {
        if ok {
            respond(StatusCode::OK, "text/plain", "ok")
        } else {
            respond(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "unavailable")
        }
    };
    match path {
        "/livez" => probe(instances.iter().all(|i| i.is_live())),
        "/readyz" => probe(instances.iter().all(|i| i.is_ready())),
        "/healthz" => {
            let reports: Vec<_> = instances
                .iter()
                .map(|i| serde_json::json!({ "node": i.id(), "health": i.health() }))
                .collect();
            let operational = instances.iter().all(|i| i.health().status.is_operational());
            let status = if operational {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            match serde_json::to_vec(&reports) {
                Ok(body) => respond(status, "application/json", body),
                Err(e) => respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    e.to_string(),
                ),
            }
        }
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, instances: Instances) -> anyhow::Result<()> {
    serve(addr, "Metrics", move |req| metrics_response(req.uri().path(), &instances)).await
}

/// `/metrics` exposes the first node, `/metrics/<node>` any other
fn metrics_response(path: &str, instances: &[Arc<CacheInstance>]) -> Response<Full<Bytes>> {
    let instance = match path.strip_prefix("/metrics") {
        Some("") | Some("/") => instances.first(),
        Some(rest) => {
            let node = rest.trim_start_matches('/');
            instances.iter().find(|i| i.id().as_str() == node)
        }
        None => None,
    };
    let Some(instance) = instance else {
        return respond(StatusCode::NOT_FOUND, "text/plain", "not found");
    };
    match instance.render_metrics() {
        Ok(text) => respond(StatusCode::OK, "text/plain; version=0.0.4", text),
        Err(e) => respond(
            StatusCode::INTERNAL_SERVER_ERROR,
            "text/plain",
            e.to_string(),
        ),
    }
}
