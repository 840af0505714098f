use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use gantry_api::{serve, ChangeService, ChangeServiceClient, ClientError, EventType, RemoteStore};
use gantry_core::ResourceKind;
use gantry_kubehub::{DocumentStore, KubeStore, MemoryStore};
use gantry_store::{load_views, spawn_pipeline, ConfigurationSnapshot, SnapshotBuilder, SnapshotHandle};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod config;

use config::{Config, StoreConfig};

#[derive(Parser, Debug)]
#[command(name = "gantryctl", version, about = "Gantry gateway control plane")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the pipeline and the change service against the configured store
    Serve {
        #[arg(long = "config", short = 'c')]
        config: Option<PathBuf>,
    },
    /// Run the pipeline against a remote change service and print every snapshot
    Follow {
        /// Change service base URL, e.g. "http://127.0.0.1:7400"
        #[arg(long = "server")]
        server: String,
        #[arg(long = "config", short = 'c')]
        config: Option<PathBuf>,
    },
    /// List the current resources of one kind
    List {
        #[arg(long = "server")]
        server: String,
        /// Kind, e.g. "routes" or "Cluster"
        kind: String,
    },
    /// Stream +/~/- deltas of one kind
    Watch {
        #[arg(long = "server")]
        server: String,
        kind: String,
    },
    /// Load the configured store once and build a snapshot from it
    Check {
        #[arg(long = "config", short = 'c')]
        config: PathBuf,
    },
}

fn init_tracing() {
    let env = std::env::var("GANTRY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<&str>) {
    let Some(addr) = addr else { return };
    if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        match builder.with_http_listener(sock).install() {
            Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
            Err(e) => warn!(error = %e, "failed to install metrics exporter"),
        }
    } else {
        warn!(addr = %addr, "invalid GANTRY_METRICS_ADDR; expected host:port");
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
        }
        token.cancel();
    });
    cancel
}

async fn build_store(cfg: &StoreConfig) -> Result<Arc<dyn DocumentStore>> {
    Ok(match cfg {
        StoreConfig::Memory { seed } => {
            let store = MemoryStore::new();
            if let Some(path) = seed {
                store.seed_from_file(path)?;
            }
            Arc::new(store) as Arc<dyn DocumentStore>
        }
        StoreConfig::Kubernetes { namespace, group, version } => {
            Arc::new(KubeStore::try_default(namespace.clone(), group, version).await?)
        }
    })
}

fn print_snapshot(output: Output, snap: &ConfigurationSnapshot) -> Result<()> {
    match output {
        Output::Human => println!("{}", snap.summary()),
        Output::Json => println!("{}", serde_json::to_string(&snap.summary())?),
    }
    Ok(())
}

/// Print every published snapshot until cancelled.
async fn print_snapshots(handle: SnapshotHandle, output: Output, cancel: CancellationToken) -> Result<()> {
    let mut versions = handle.subscribe_version();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            changed = versions.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
        }
        print_snapshot(output, &handle.current())?;
    }
}

fn parse_kind(kind: &str) -> Result<ResourceKind> {
    ResourceKind::from_str(kind).map_err(|e| anyhow!("{}", e))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => {
            let cfg = Config::load(config.as_deref())?;
            init_metrics(cfg.metrics_addr.as_deref());
            let store = build_store(&cfg.store).await?;
            let cancel = cancel_on_ctrl_c();
            let t0 = Instant::now();

            let service_cfg = cfg.service_config();
            let (service, service_join) =
                ChangeService::start(store, cfg.feed_config(), service_cfg.watch_buffer, cancel.child_token());
            // One store subscription per kind: the local snapshots follow the hubs remote watchers see.
            let pipeline = spawn_pipeline(
                Arc::new(service.local_store()),
                cfg.pipeline_config(),
                cfg.feed_config(),
                cancel.child_token(),
            );
            let listener = TcpListener::bind(service_cfg.addr())
                .await
                .with_context(|| format!("binding {}", service_cfg.addr()))?;
            info!(addr = %service_cfg.addr(), took_ms = %t0.elapsed().as_millis(), "serve: ready to accept");

            serve(listener, service.router(), cancel.clone()).await?;
            cancel.cancel();
            if let Ok(Err(e)) = pipeline.join.await {
                error!(error = %e, "pipeline stopped on a fatal feed error");
            }
            if let Ok(Err(e)) = service_join.await {
                error!(error = %e, "change service stopped on a fatal feed error");
            }
        }
        Commands::Follow { server, config } => {
            let cfg = Config::load(config.as_deref())?;
            init_metrics(cfg.metrics_addr.as_deref());
            let client = ChangeServiceClient::new(&server)?;
            let cancel = cancel_on_ctrl_c();
            let pipeline = spawn_pipeline(
                Arc::new(RemoteStore::new(client)),
                cfg.pipeline_config(),
                cfg.feed_config(),
                cancel.child_token(),
            );
            let reporter = tokio::spawn(print_snapshots(pipeline.handle.clone(), cli.output, cancel.clone()));
            let res = pipeline.join.await?;
            cancel.cancel();
            reporter.await??;
            res?;
        }
        Commands::List { server, kind } => {
            let kind = parse_kind(&kind)?;
            let client = ChangeServiceClient::new(&server)?;
            let items = client.list_collection::<serde_json::Value>(kind.collection()).await?;
            match cli.output {
                Output::Human => {
                    for item in &items {
                        let id = item.get("id").and_then(|v| v.as_str()).unwrap_or("-");
                        println!("{:<32} {}", id, item);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&items)?),
            }
        }
        Commands::Watch { server, kind } => {
            let kind = parse_kind(&kind)?;
            let client = ChangeServiceClient::new(&server)?;
            let cancel = cancel_on_ctrl_c();
            let mut stream = client.watch_collection::<serde_json::Value>(kind.collection()).await?;
            info!(%kind, "watch: streaming deltas");
            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => break,
                    item = stream.next() => item,
                };
                match item {
                    Some(Ok(ev)) => match cli.output {
                        Output::Human => {
                            let sign = match ev.event_type {
                                EventType::Create => '+',
                                EventType::Update => '~',
                                EventType::Delete => '-',
                                EventType::Unknown => '?',
                            };
                            let id = ev.resource.get("id").and_then(|v| v.as_str()).unwrap_or("-");
                            println!("{} {}", sign, id);
                        }
                        Output::Json => println!("{}", serde_json::to_string(&ev)?),
                    },
                    Some(Err(ClientError::Terminated(reason))) => {
                        warn!(%kind, reason = %reason, "watch ended by server; re-list to resume");
                        return Err(anyhow!("watch terminated: {}", reason));
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => break,
                }
            }
        }
        Commands::Check { config } => {
            let cfg = Config::load(Some(config.as_path()))?;
            check(&cfg, &config, cli.output).await?;
        }
    }

    Ok(())
}

async fn check(cfg: &Config, path: &Path, output: Output) -> Result<()> {
    let t0 = Instant::now();
    let store = build_store(&cfg.store).await?;
    let views = load_views(store.as_ref()).await.map_err(|e| anyhow!("loading {}: {}", path.display(), e))?;
    match SnapshotBuilder::new().build(&views, 1) {
        Ok(snap) => {
            info!(took_ms = %t0.elapsed().as_millis(), "check: snapshot built");
            print_snapshot(output, &snap)?;
            let summary = snap.summary();
            if summary.dangling_references > 0 && output == Output::Human {
                for route in &snap.routes {
                    if let Some(c) = route.cluster.as_ref().filter(|c| c.is_dangling()) {
                        println!("warning: route {} references missing cluster {}", route.id, c.id());
                    }
                    for m in route.middlewares.iter().filter(|m| m.is_dangling()) {
                        println!("warning: route {} references missing middleware {}", route.id, m.id());
                    }
                    if let Some(a) = route.authentication_policy.as_ref().filter(|a| a.is_dangling()) {
                        println!("warning: route {} references missing authentication policy {}", route.id, a.id());
                    }
                }
            }
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "check: snapshot build failed");
            Err(e.into())
        }
    }
}
