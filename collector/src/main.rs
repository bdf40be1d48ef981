mod config;
mod error;
mod event;
mod filter;
mod service;
mod sink;
mod telemetry;
mod tracker;

use crate::config::Settings;
use crate::error::CollectorError;
use crate::filter::MarkerFilter;
use crate::service::EventIngest;
use crate::sink::{CsvSink, FinalizedRecord};
use crate::telemetry::{HttpSnapshotProvider, Sampler, SnapshotProvider, SAMPLE_CSV_HEADER};
use crate::tracker::RequestTracker;
use clap::Parser as ClapParser;
use hyper::server::conn::http1;
use hyper::Uri;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::{fs, process};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt};

const EVENT_QUEUE_DEPTH: usize = 1024;

#[derive(ClapParser, Debug)]
#[command(version)]
struct Cli {
    #[arg(short, long, default_value = "collector.toml")]
    config: String,

    /// Replay a captured NDJSON event log through the tracker and exit
    #[arg(long)]
    replay: Option<String>,
}

fn main() {
    let subscriber = tracing_subscriber::registry().with(
        fmt::Layer::default()
            .with_target(false)
            .with_thread_names(false)
            .with_ansi(true)
            .with_line_number(false)
            .with_file(false)
            .with_thread_ids(false),
    );
    tracing::subscriber::set_global_default(subscriber)
        .expect("Unable to set a global logger instance");

    let cli = Cli::parse();
    let settings = match build_settings(cli.config.as_str()) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let runtime = match common::runtime::build(settings.runtime.threads) {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to create runtime: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.replay {
        Some(path) => runtime.block_on(replay(&settings, path.as_str())),
        None => runtime.block_on(run(&settings)),
    };

    if let Err(e) = result {
        error!("{}", e);
        process::exit(1);
    }
}

pub async fn run(settings: &Settings) -> Result<(), CollectorError> {
    let addr = common::socket::parse_address(settings.http.addr.clone())
        .map_err(|e| CollectorError::NetworkError(e.to_string()))?;
    let socket = common::socket::listen_reuse_socket(&addr)
        .map_err(|e| CollectorError::NetworkError(e.to_string()))?;
    let listener = TcpListener::from_std(socket.into())
        .map_err(|e| CollectorError::NetworkError(e.to_string()))?;

    info!("Listening on http://{}", addr);

    let telemetry = build_telemetry(settings)?;
    let sink = CsvSink::open(
        settings.output.path.as_str(),
        FinalizedRecord::CSV_HEADER,
        settings.output.flush_interval,
    )
    .await?;
    let filter = MarkerFilter::new(
        settings.filter.segment_markers.clone(),
        settings.filter.manifest_markers.clone(),
    );

    let (events, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let tracker = RequestTracker::new(Box::new(filter), telemetry.clone(), Box::new(sink));

    let shutdown = Arc::new(Notify::new());
    let tracker_task = tokio::spawn(tracker.run(rx, shutdown.clone()));
    let sampler_task = start_sampler(settings, &telemetry, &shutdown).await?;
    common::shutdown::watch(shutdown.clone());

    let service = EventIngest::new(events);
    let http = http1::Builder::new();

    let notified = shutdown.notified();
    tokio::pin!(notified);

    let mut serve_result = Ok(());
    loop {
        tokio::select! {
            _ = &mut notified => {
                info!("shutdown requested");
                break;
            }
            accepted = listener.accept() => {
                let (tcp_stream, remote_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        // The tracker and sampler must still drain and flush
                        // before this error reaches main and the runtime drops.
                        error!("accept: {}", e);
                        serve_result = Err(CollectorError::NetworkError(e.to_string()));
                        shutdown.notify_waiters();
                        break;
                    }
                };

                let service = service.clone();
                let io = TokioIo::new(tcp_stream);
                let conn = http.serve_connection(io, service);

                debug!("Connection accepted from {}", remote_addr);
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        error!("Connection error: {:?}", e);
                    }
                });
            }
        }
    }

    drop(service);
    if let Err(e) = tracker_task.await {
        error!("tracker task: {}", e);
    }

    if let Some(task) = sampler_task {
        if let Err(e) = task.await {
            error!("sampler task: {}", e);
        }
    }

    serve_result
}

/// Process a captured event log offline; records are emitted without
/// telemetry since the player session is long gone.
async fn replay(settings: &Settings, path: &str) -> Result<(), CollectorError> {
    info!("replaying event log {}", path);

    let data = tokio::fs::read(path)
        .await
        .map_err(|e| CollectorError::ConfigError(format!("Event log '{}': {}", path, e)))?;

    let sink = CsvSink::open(
        settings.output.path.as_str(),
        FinalizedRecord::CSV_HEADER,
        settings.output.flush_interval,
    )
    .await?;
    let filter = MarkerFilter::new(
        settings.filter.segment_markers.clone(),
        settings.filter.manifest_markers.clone(),
    );
    let mut tracker = RequestTracker::new(Box::new(filter), None, Box::new(sink));

    let mut parsed: u64 = 0;
    let mut skipped: u64 = 0;
    for line in data.split(|b| *b == b'\n') {
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }

        match serde_json::from_slice(line) {
            Ok(event) => {
                tracker.handle(event).await;
                parsed += 1;
            }
            Err(e) => {
                warn!("malformed event line: {}", e);
                skipped += 1;
            }
        }
    }

    info!(
        "replayed {} events ({} skipped), {} requests left open",
        parsed,
        skipped,
        tracker.live_count()
    );
    tracker.finish().await;
    Ok(())
}

fn build_telemetry(
    settings: &Settings,
) -> Result<Option<Arc<dyn SnapshotProvider>>, CollectorError> {
    let cfg = match &settings.telemetry {
        Some(cfg) => cfg,
        None => return Ok(None),
    };

    let uri = Uri::try_from(cfg.url.as_str())
        .map_err(|e| CollectorError::ConfigError(format!("Invalid telemetry URL: {}", e)))?;

    Ok(Some(
        Arc::new(HttpSnapshotProvider::new(uri, cfg.timeout)) as Arc<dyn SnapshotProvider>
    ))
}

async fn start_sampler(
    settings: &Settings,
    telemetry: &Option<Arc<dyn SnapshotProvider>>,
    shutdown: &Arc<Notify>,
) -> Result<Option<tokio::task::JoinHandle<()>>, CollectorError> {
    let (cfg, provider) = match (&settings.telemetry, telemetry) {
        (Some(cfg), Some(provider)) => (cfg, provider),
        _ => return Ok(None),
    };

    let interval = match cfg.poll_interval {
        Some(interval) if !interval.is_zero() => interval,
        _ => return Ok(None),
    };

    let path = cfg
        .sample_path
        .clone()
        .unwrap_or_else(|| "telemetry.csv".to_string());
    let sink = CsvSink::open(
        path.as_str(),
        SAMPLE_CSV_HEADER,
        settings.output.flush_interval,
    )
    .await?;

    info!("sampling telemetry every {:?} into {}", interval, path);
    let sampler = Sampler::new(provider.clone(), sink, interval, cfg.log_failures);
    Ok(Some(tokio::spawn(sampler.run(shutdown.clone()))))
}

fn build_settings(config_path: &str) -> Result<Settings, CollectorError> {
    let data = fs::read_to_string(config_path).map_err(|_| {
        CollectorError::ConfigError(format!("Config file '{}' does not exist", config_path))
    })?;

    toml::from_str(&data)
        .map_err(|e| CollectorError::ConfigError(format!("Invalid configuration: {}", e)))
}
