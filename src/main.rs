use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use peerwatch::capture::SampleCapture;
use peerwatch::client::{run_client, PublisherClient, ViewerClient};
use peerwatch::config::Config;
use peerwatch::events::EventBus;
use peerwatch::protocol::{ClientMessage, Role};
use peerwatch::rtc::WebRtcTransportFactory;
use peerwatch::signaling::{self, SignalingEvent, SignalingHandle, SignalingOptions};
use peerwatch::supervisor::SupervisorContext;
use peerwatch::telemetry::{
    self, FileSnapshotSource, FileUsageSource, ReporterIntervals, TelemetryClient,
};
use peerwatch::transport::TransportFactory;
use peerwatch::server;

#[derive(Parser)]
#[command(name = "peerwatch", version, about = "Signaling broker and peer session supervisor")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the signaling broker.
    Broker,
    /// Stream this machine's capture to the group's viewer.
    Publish(PublishArgs),
    /// Receive every publisher in a group.
    View(ViewArgs),
}

#[derive(Args)]
struct PublishArgs {
    #[arg(long)]
    group: String,
    #[arg(long)]
    peer_id: String,
    /// Overrides PEERWATCH_BROKER_URL.
    #[arg(long)]
    broker_url: Option<String>,
    /// JPEG kept up to date by an external screen grabber.
    #[arg(long)]
    snapshot_file: Option<PathBuf>,
    /// `app<TAB>title` line kept up to date by an external window watcher.
    #[arg(long)]
    usage_file: Option<PathBuf>,
}

#[derive(Args)]
struct ViewArgs {
    #[arg(long)]
    group: String,
    #[arg(long, default_value = "viewer")]
    peer_id: String,
    #[arg(long)]
    broker_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cfg = Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level)),
        )
        .init();
    cfg.log_summary();

    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    match cli.command {
        Command::Broker => {
            tokio::spawn(cancel_on_ctrl_c(cancel.clone()));
            server::run(&cfg, cancel).await.context("broker stopped with an error")?;
        }
        Command::Publish(args) => publish(cfg, args, cancel).await?,
        Command::View(args) => view(cfg, args, cancel).await?,
    }

    info!("peerwatch stopped");
    Ok(())
}

async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("ctrl-c received, shutting down");
    }
    cancel.cancel();
}

fn connect_broker(
    cfg: &Config,
    url: Option<String>,
    join: ClientMessage,
) -> (SignalingHandle, UnboundedReceiver<SignalingEvent>) {
    signaling::connect(SignalingOptions {
        url: url.unwrap_or_else(|| cfg.broker_url.clone()),
        join,
        backoff: cfg.reconnect_backoff(),
        queue_capacity: cfg.outbound_queue,
    })
}

/// Log every session event until `cancel` fires.
fn spawn_event_logger(events: &EventBus, cancel: CancellationToken) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(event) => info!(
                        event_type = %event.event_type,
                        peer_id = %event.peer_id,
                        data = %serde_json::to_string(&event.data).unwrap_or_default(),
                        "session event"
                    ),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("event logger lagged, skipped {n} events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });
}

fn context(
    cfg: &Config,
    role: Role,
    group_key: &str,
    local_peer_id: &str,
    factory: Arc<dyn TransportFactory>,
    signaling: &SignalingHandle,
    cancel: &CancellationToken,
) -> SupervisorContext {
    let events = EventBus::new();
    spawn_event_logger(&events, cancel.clone());
    SupervisorContext {
        role,
        group_key: group_key.to_string(),
        local_peer_id: local_peer_id.to_string(),
        config: cfg.supervisor(),
        factory,
        signal: Arc::new(signaling.sender()),
        events,
    }
}

async fn publish(cfg: Config, args: PublishArgs, cancel: CancellationToken) -> anyhow::Result<()> {
    let capture = Arc::new(SampleCapture::vp8());
    let factory = Arc::new(WebRtcTransportFactory::sender(cfg.stun_urls.clone(), capture));

    let (signaling, signal_events) = connect_broker(
        &cfg,
        args.broker_url,
        ClientMessage::Join {
            group_key: args.group.clone(),
            role: Role::Publisher,
            peer_id: Some(args.peer_id.clone()),
        },
    );

    let ctx = context(
        &cfg,
        Role::Publisher,
        &args.group,
        &args.peer_id,
        factory,
        &signaling,
        &cancel,
    );
    let publisher = Arc::new(PublisherClient::new(ctx));
    publisher.start_tracking().await;

    let reporter = match &cfg.telemetry_url {
        Some(url) => {
            let client = TelemetryClient::new(url, &args.group, &args.peer_id)
                .context("could not build telemetry client")?;
            let tracking = publisher.clone();
            let snapshot_path = args.snapshot_file.unwrap_or_else(|| PathBuf::from("snapshot.jpg"));
            let usage_path = args.usage_file.unwrap_or_else(|| PathBuf::from("usage.txt"));
            Some(telemetry::spawn_reporter(
                Arc::new(client),
                Arc::new(FileSnapshotSource::new(snapshot_path)),
                Arc::new(FileUsageSource::new(usage_path)),
                Arc::new(move || tracking.is_tracking()),
                ReporterIntervals::default(),
                cancel.child_token(),
            ))
        }
        None => None,
    };

    let mut driver = tokio::spawn(run_client(
        publisher.clone(),
        signal_events,
        cfg.liveness_interval,
        cancel.clone(),
    ));

    let driver_done = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received, stopping tracking");
            false
        }
        _ = &mut driver => {
            warn!("broker unreachable, stopping");
            true
        }
    };

    publisher.stop_tracking().await;
    cancel.cancel();
    if !driver_done {
        let _ = driver.await;
    }
    if let Some(reporter) = reporter {
        let _ = reporter.await;
    }
    if let Err(e) = signaling.shutdown().await {
        warn!("signaling ended with an error: {e}");
    }
    Ok(())
}

async fn view(cfg: Config, args: ViewArgs, cancel: CancellationToken) -> anyhow::Result<()> {
    let factory = Arc::new(WebRtcTransportFactory::receiver(cfg.stun_urls.clone()));

    let (signaling, signal_events) = connect_broker(
        &cfg,
        args.broker_url,
        ClientMessage::Join {
            group_key: args.group.clone(),
            role: Role::Viewer,
            peer_id: Some(args.peer_id.clone()),
        },
    );

    let ctx = context(
        &cfg,
        Role::Viewer,
        &args.group,
        &args.peer_id,
        factory,
        &signaling,
        &cancel,
    );
    let viewer = Arc::new(ViewerClient::new(ctx));
    info!(group_key = %args.group, "viewing");

    let driver = tokio::spawn(run_client(
        viewer,
        signal_events,
        cfg.liveness_interval,
        cancel.clone(),
    ));

    tokio::spawn(cancel_on_ctrl_c(cancel.clone()));
    cancel.cancelled().await;
    let _ = driver.await;
    if let Err(e) = signaling.shutdown().await {
        warn!("signaling ended with an error: {e}");
    }
    Ok(())
}
