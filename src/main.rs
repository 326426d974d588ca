//! Courier gateway binary

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use courier_gateway::api::{self, ApiState};
use courier_gateway::channels::{CloudClient, SessionRegistry, SocketTransport};
use courier_gateway::db::{self, NumberRepo};
use courier_gateway::fanout::{Backbone, EventHub};
use courier_gateway::ingest::IngestPipeline;
use courier_gateway::media::{CloudMediaClient, FsMediaStore};
use courier_gateway::workers::{self, GatewaySender, WorkerCtx};
use courier_gateway::Config;

#[derive(Parser)]
#[command(name = "courier", version, about = "Multi-tenant WhatsApp message ingestion gateway")]
struct Cli {
    /// Path to TOML config file
    #[arg(short, long, env = "COURIER_CONFIG")]
    config: Option<PathBuf>,

    /// Override the HTTP port
    #[arg(short, long)]
    port: Option<u16>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose);

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.port = port;
    }

    let pool = db::init(&config.db_path)?;

    let hub = Arc::new(EventHub::new());
    let registry = Arc::new(SessionRegistry::new());

    let cloud = CloudClient::new(config.cloud.graph_base.clone(), config.cloud.api_version.clone());
    let media = CloudMediaClient::new(
        config.cloud.graph_base.clone(),
        config.cloud.api_version.clone(),
    );
    let store = Arc::new(FsMediaStore::new(config.media.uploads_dir.clone()));

    // The socket transport is provided by the embedding deployment; without
    // one, qr conversations ingest via backfill and cannot send
    let transport: Option<Arc<dyn SocketTransport>> = None;

    let pipeline = Arc::new(IngestPipeline::new(
        pool.clone(),
        media,
        store,
        Arc::clone(&hub) as Arc<dyn Backbone>,
        transport.clone(),
        cloud.clone(),
        config.media.fetch_on_append,
        config.cloud.mark_read,
    ));

    let sender = Arc::new(GatewaySender::new(
        cloud,
        NumberRepo::new(pool.clone()),
        transport,
    ));
    let ctx = Arc::new(WorkerCtx::new(pool.clone(), Arc::clone(&hub), sender));
    let worker_handles = workers::spawn_all(ctx);
    tracing::info!(workers = worker_handles.len(), "background workers started");

    let state = Arc::new(ApiState::new(pool, config, pipeline, hub, registry));
    api::serve(state).await?;

    Ok(())
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "courier_gateway=info",
        1 => "courier_gateway=debug",
        2 => "courier_gateway=trace",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
