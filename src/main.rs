use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use livetrack::bus::{CommandBus, MemoryBus, NatsBus};
use livetrack::config::Settings;
use livetrack::elevation::ElevationClient;
use livetrack::pilots::FilePilotSource;
use livetrack::proxy::ProxyPool;
use livetrack::scheduler::{Ticker, TickerSettings};
use livetrack::storage::{BlobStorage, LocalStorage, S3Storage, sweep_archives};
use livetrack::trackers::TrackerFetcher;
use livetrack::trackers::flymaster::FlymasterFetcher;
use livetrack::trackers::flyme::FlymeFetcher;
use livetrack::trackers::inreach::InreachFetcher;
use livetrack::trackers::skylines::SkylinesFetcher;
use livetrack::trackers::spot::SpotFetcher;

#[derive(Parser)]
#[command(name = "livetrack", about = "Live GPS track aggregation service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the tick scheduler until interrupted.
    Run,
    /// Build and persist the encoded track groups once, from the last
    /// snapshot, then exit.
    Export,
    /// Run the archive retention sweep once, then exit.
    Sweep,
}

async fn build_storage(settings: &Settings) -> Arc<dyn BlobStorage> {
    match &settings.s3_bucket {
        Some(bucket) => {
            info!("using S3 storage bucket {bucket}");
            Arc::new(S3Storage::new(bucket).await) as Arc<dyn BlobStorage>
        }
        None => {
            info!("using local storage at {}", settings.data_dir);
            Arc::new(LocalStorage::new(settings.data_dir.clone())) as Arc<dyn BlobStorage>
        }
    }
}

async fn build_bus(settings: &Settings) -> Result<Arc<dyn CommandBus>> {
    match &settings.nats_url {
        Some(url) => Ok(Arc::new(NatsBus::connect(url, &settings.nats_bucket).await?)),
        None => {
            warn!("no NATS url configured, commands and telemetry stay in-process");
            Ok(Arc::new(MemoryBus::new()))
        }
    }
}

fn build_fetchers(settings: &Settings, client: &reqwest::Client) -> Vec<Arc<dyn TrackerFetcher>> {
    let proxy = ProxyPool::new(client.clone(), settings.proxy_provisioner_url.clone());
    vec![
        Arc::new(InreachFetcher::new(client.clone(), proxy)),
        Arc::new(SpotFetcher::new(client.clone(), settings.spot_url.clone())),
        Arc::new(SkylinesFetcher::new(client.clone(), settings.skylines_url.clone())),
        Arc::new(FlymeFetcher::new(client.clone(), settings.flyme_url.clone())),
        Arc::new(FlymasterFetcher::new(client.clone(), settings.flymaster_url.clone())),
    ]
}

fn build_ticker(
    settings: &Settings,
    storage: Arc<dyn BlobStorage>,
    bus: Arc<dyn CommandBus>,
    fetchers: Vec<Arc<dyn TrackerFetcher>>,
) -> Ticker {
    let client = reqwest::Client::new();
    let elevation = settings
        .elevation_url
        .as_ref()
        .map(|url| ElevationClient::new(client, url.clone()));
    let ticker_settings = TickerSettings {
        fetch_timeout: settings.fetch_timeout,
        partner_strip: settings.partner_strip,
        ..Default::default()
    };
    Ticker::new(
        ticker_settings,
        fetchers,
        Arc::new(FilePilotSource::new(settings.pilots_path.clone())),
        storage,
        bus,
        elevation,
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env();
    let storage = build_storage(&settings).await;

    match cli.command {
        Command::Run => {
            if let Some(port) = settings.metrics_port {
                livetrack::metrics::init_metrics(port)?;
            }
            let bus = build_bus(&settings).await?;
            let client = reqwest::Client::builder().build()?;
            let fetchers = build_fetchers(&settings, &client);
            let ticker = Arc::new(build_ticker(&settings, storage, bus, fetchers));

            ticker.restore().await;
            let runner = tokio::spawn(ticker.clone().run(settings.tick_interval));

            tokio::signal::ctrl_c().await?;
            info!("interrupt received");
            runner.abort();
            ticker.shutdown(Utc::now().timestamp()).await;
        }
        Command::Export => {
            let bus: Arc<dyn CommandBus> = Arc::new(MemoryBus::new());
            let ticker = build_ticker(&settings, storage, bus, Vec::new());
            ticker.restore().await;
            ticker.export_once(Utc::now().timestamp()).await?;
            info!("export complete");
        }
        Command::Sweep => {
            let today = Utc::now().date_naive();
            let deleted = sweep_archives(storage.as_ref(), "archive/", today, 30).await?;
            info!("sweep complete, {deleted} archives deleted");
        }
    }
    Ok(())
}
