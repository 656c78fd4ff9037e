mod capture;
mod config;
mod counter;
mod error;
mod filter;
mod hashing;
mod heartbeat;
mod logging;
mod packet;
mod queue;
mod registration;
mod shutdown;
mod uplink;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};

use crate::capture::{CaptureLoop, FramePipeline};
use crate::config::Config;
use crate::counter::FlowCounter;
use crate::filter::PacketFilter;
use crate::hashing::AgentIdentity;
use crate::logging::setup_logging;
use crate::shutdown::ShutdownTrigger;
use crate::uplink::{Dispatcher, WsConnector};

#[derive(Parser, Debug)]
#[command(name = "network-agent", about = "Flags repeated connection attempts and streams them to a collector")]
struct Opt {
    /// Collector address as host:port
    #[arg(long)]
    server: String,

    /// YAML config file. Defaults to network-agent.yaml next to the
    /// executable or in the working directory.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Also log to stderr
    #[arg(long)]
    console: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opt = Opt::parse();

    // Logging is configured from the file, so note what happened and log it once it is up.
    let mut notes = Vec::new();
    let config = match opt.config.clone().or_else(config::locate) {
        Some(path) => match Config::load(&path) {
            Ok(cfg) => {
                notes.push(format!("Configuration loaded from {}", path.display()));
                cfg
            }
            Err(e) => {
                notes.push(format!("Failed to load config {} ({}), using defaults", path.display(), e));
                Config::default()
            }
        },
        None => {
            notes.push("Config not found, using defaults".to_string());
            Config::default()
        }
    };

    if let Err(e) = setup_logging(&config.logging, opt.console) {
        eprintln!("Failed to setup logging: {}", e);
        return Err(e.into());
    }
    for note in notes {
        info!("{}", note);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;

    if let Err(e) = runtime.block_on(run_agent(opt.server, config)) {
        error!("Agent stopped: {}", e);
        return Err(e);
    }

    info!("Agent stopped");
    Ok(())
}

async fn run_agent(server: String, config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting up...");

    let identity = AgentIdentity::detect();
    info!(
        "Agent {} on {} ({})",
        identity.hash(),
        identity.hostname(),
        identity.host_os()
    );

    if let Err(e) = registration::register(&server, &identity, config.uplink.registration_timeout()).await {
        warn!("Agent registration failed: {}", e);
    }

    let connector = Arc::new(WsConnector::new(&server));
    let dispatcher = Dispatcher::connect(connector, config.uplink.failure_policy.to_policy()).await?;

    let (trigger, signal) = shutdown::channel();
    let (event_queue, events_rx) = queue::bounded("events", config.uplink.event_queue_capacity);
    let (heartbeat_queue, status_rx) = queue::bounded("heartbeat", config.uplink.heartbeat_queue_capacity);

    let heartbeat_observer = heartbeat_queue.clone();
    let heartbeat_handle = tokio::spawn(heartbeat::run(
        identity.hash(),
        config.uplink.heartbeat_interval(),
        heartbeat_queue,
        signal.clone(),
    ));

    let filter = Arc::new(PacketFilter::new(
        &config.detection.ignore_ranges[..],
        config.detection.max_destination_port,
    ));
    let counter = Arc::new(FlowCounter::new(
        config.detection.threshold,
        config.detection.max_tracked_flows,
    ));
    info!(
        "Flagging flows after {} attempts (ports <= {}, {} ignored ranges)",
        counter.threshold(),
        config.detection.max_destination_port,
        filter.ignore_ranges().len()
    );
    let pipeline = FramePipeline::new(filter, counter.clone());

    let interfaces = capture::select_interfaces(
        pnet::datalink::interfaces(),
        config.capture.interfaces.as_deref(),
    );
    let mut capture_handles = Vec::new();
    for interface in interfaces {
        info!("Interface Name: {}", interface.name);
        let capture_loop = CaptureLoop::new(
            interface,
            config.capture.clone(),
            pipeline.clone(),
            event_queue.clone(),
            signal.clone(),
        );
        capture_handles.push(capture_loop.spawn()?);
    }
    // Held until exit, so the agent keeps heartbeating even if every capture loop stops.
    let queues = [event_queue, heartbeat_observer];

    tokio::spawn(wait_for_signal(trigger.clone()));

    let result = dispatcher.run(events_rx, status_rx, signal).await;
    trigger.trigger();

    if let Err(e) = heartbeat_handle.await {
        warn!("Heartbeat task error: {}", e);
    }
    info!(
        "{} capture loops started, {} flows tracked at exit",
        capture_handles.len(),
        counter.tracked_flows()
    );

    for queue in &queues {
        if queue.dropped() > 0 {
            warn!("{} queue dropped {} payloads", queue.name(), queue.dropped());
        }
    }

    result?;
    Ok(())
}

async fn wait_for_signal(trigger: ShutdownTrigger) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
                    _ = terminate.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received Ctrl+C");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C");
        }
    }

    info!("Shutdown signal received, stopping...");
    trigger.trigger();
}
