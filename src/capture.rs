//! Per-interface packet capture.
//!
//! Each interface gets its own OS thread because the datalink receiver blocks.
//! Frames are parsed, filtered and counted on that thread; emitted events are
//! serialized and offered to the event queue.

use std::io::ErrorKind;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};
use pnet::datalink::{self, Channel, NetworkInterface};

use crate::config::CaptureConfig;
use crate::counter::{EventDecision, FlowCounter};
use crate::error::{CaptureError, PacketError};
use crate::filter::PacketFilter;
use crate::hashing::FlowKey;
use crate::packet::parse_frame;
use crate::queue::{self, OutboundQueue};
use crate::shutdown::ShutdownSignal;

/// Parse, filter and count stage shared by every capture loop.
#[derive(Clone)]
pub struct FramePipeline {
    filter: Arc<PacketFilter>,
    counter: Arc<FlowCounter>,
}

impl FramePipeline {
    pub fn new(filter: Arc<PacketFilter>, counter: Arc<FlowCounter>) -> Self {
        FramePipeline { filter, counter }
    }

    /// `Ok(None)` when the filter rejects the frame.
    pub fn handle(&self, frame: &[u8]) -> Result<Option<EventDecision>, PacketError> {
        let headers = parse_frame(frame)?;
        if !self.filter.should_count(&headers) {
            return Ok(None);
        }

        let (Some(network), Some(transport)) = (headers.network, headers.transport) else {
            return Ok(None);
        };

        let port = transport.destination_port.to_string();
        let key = FlowKey::new(network.source, network.destination, &port);
        Ok(Some(self.counter.observe(key, network.source, network.destination, &port)))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames: u64,
    pub malformed: u64,
    pub counted: u64,
    pub events: u64,
}

/// Feeds frames from one interface through the pipeline into the event queue.
pub struct CaptureWorker {
    interface: String,
    pipeline: FramePipeline,
    events: OutboundQueue,
    stats: CaptureStats,
}

impl CaptureWorker {
    pub fn new(interface: impl Into<String>, pipeline: FramePipeline, events: OutboundQueue) -> Self {
        CaptureWorker {
            interface: interface.into(),
            pipeline,
            events,
            stats: CaptureStats::default(),
        }
    }

    pub fn ingest(&mut self, frame: &[u8]) {
        self.stats.frames += 1;

        let decision = match self.pipeline.handle(frame) {
            Ok(Some(decision)) => decision,
            Ok(None) => return,
            Err(e) => {
                self.stats.malformed += 1;
                if queue::warn_due(self.stats.malformed) {
                    warn!(
                        "Dropping malformed packet on {} ({} so far): {}",
                        self.interface, self.stats.malformed, e
                    );
                } else {
                    debug!("Dropping malformed packet on {}: {}", self.interface, e);
                }
                return;
            }
        };
        self.stats.counted += 1;

        let Some(event) = decision.into_event() else {
            return;
        };

        match serde_json::to_string(&event) {
            Ok(json) => {
                if self.events.offer(json) {
                    self.stats.events += 1;
                }
            }
            Err(e) => warn!("Failed to serialize event {} on {}: {}", event.id, self.interface, e),
        }
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }
}

pub struct CaptureLoop {
    interface: NetworkInterface,
    settings: CaptureConfig,
    worker: CaptureWorker,
    shutdown: ShutdownSignal,
}

impl CaptureLoop {
    pub fn new(
        interface: NetworkInterface,
        settings: CaptureConfig,
        pipeline: FramePipeline,
        events: OutboundQueue,
        shutdown: ShutdownSignal,
    ) -> Self {
        let worker = CaptureWorker::new(interface.name.clone(), pipeline, events);
        CaptureLoop {
            interface,
            settings,
            worker,
            shutdown,
        }
    }

    /// Captures until shutdown is signalled or the source fails. Interfaces
    /// that are down or cannot be opened are not retried.
    pub fn run(mut self) -> Result<CaptureStats, CaptureError> {
        let name = self.interface.name.clone();
        if !self.interface.is_up() {
            return Err(CaptureError::InterfaceDown(name));
        }
        if !has_link_layer(&self.interface) {
            return Err(CaptureError::NoLinkLayer(name));
        }

        let channel_config = datalink::Config {
            read_buffer_size: self.settings.snaplen,
            read_timeout: Some(self.settings.read_timeout()),
            promiscuous: self.settings.promiscuous,
            ..Default::default()
        };

        let mut rx = match datalink::channel(&self.interface, channel_config) {
            Ok(Channel::Ethernet(_tx, rx)) => rx,
            Ok(_) => return Err(CaptureError::UnsupportedChannel(name)),
            Err(e) => {
                return Err(CaptureError::ChannelOpen {
                    interface: name,
                    source: e,
                })
            }
        };

        info!("Capturing packets on interface: {}", name);

        while !self.shutdown.is_triggered() {
            match rx.next() {
                Ok(frame) => self.worker.ingest(frame),
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
                Err(e) => {
                    return Err(CaptureError::Read {
                        interface: name,
                        frames: self.worker.stats().frames,
                        source: e,
                    })
                }
            }
        }

        Ok(self.worker.stats())
    }

    /// Runs the loop on a dedicated, named thread and logs how it ended.
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        let name = self.interface.name.clone();
        thread::Builder::new()
            .name(format!("capture-{}", name))
            .spawn(move || match self.run() {
                Ok(stats) => info!(
                    "Capture on {} stopped after {} frames ({} counted, {} malformed, {} events)",
                    name, stats.frames, stats.counted, stats.malformed, stats.events
                ),
                Err(CaptureError::InterfaceDown(iface)) => info!("Interface is down: {}", iface),
                Err(e @ CaptureError::NoLinkLayer(_)) => warn!("{}", e),
                Err(e) => error!("{}", e),
            })
    }
}

/// Interfaces to capture on: all of them, or only those named in `wanted`.
/// Requested names that do not exist are logged.
pub fn select_interfaces(available: Vec<NetworkInterface>, wanted: Option<&[String]>) -> Vec<NetworkInterface> {
    let Some(wanted) = wanted else {
        return available;
    };

    for name in wanted {
        if !available.iter().any(|iface| &iface.name == name) {
            warn!("Configured interface {} not found", name);
        }
    }

    available
        .into_iter()
        .filter(|iface| is_selected(&iface.name, Some(wanted)))
        .collect()
}

/// Frames are decoded as ethernet, so interfaces without a hardware address
/// (tun, wireguard and other raw IP links) are skipped.
fn has_link_layer(interface: &NetworkInterface) -> bool {
    interface.mac.is_some()
}

fn is_selected(name: &str, wanted: Option<&[String]>) -> bool {
    wanted.map_or(true, |names| names.iter().any(|n| n == name))
}
