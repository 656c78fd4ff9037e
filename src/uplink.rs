//! Persistent outbound connections to the collector and the dispatcher loop
//! that feeds them.
//!
//! Events go to `/ws`, heartbeats to `/ws/agent/status`, one text frame per
//! payload. The connection layer sits behind [`Connector`] and [`FrameSink`]
//! so the dispatcher can be driven without a collector.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::SinkExt;
use log::{debug, error, info, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::UplinkError;
use crate::shutdown::ShutdownSignal;

pub const EVENTS_PATH: &str = "/ws";
pub const STATUS_PATH: &str = "/ws/agent/status";

#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: &str) -> Result<(), UplinkError>;
    async fn close(&mut self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, path: &'static str) -> Result<Box<dyn FrameSink>, UplinkError>;
}

/// Dials `ws://<server><path>`.
pub struct WsConnector {
    server: String,
}

impl WsConnector {
    pub fn new(server: &str) -> Self {
        WsConnector {
            server: server.to_string(),
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, path: &'static str) -> Result<Box<dyn FrameSink>, UplinkError> {
        let url = format!("ws://{}{}", self.server, path);
        info!("Initializing WebSocket {}", url);
        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| UplinkError::Connect {
                path,
                source: Box::new(e),
            })?;
        Ok(Box::new(WsSink { path, stream }))
    }
}

struct WsSink {
    path: &'static str,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: &str) -> Result<(), UplinkError> {
        self.stream
            .send(Message::Text(text.to_owned()))
            .await
            .map_err(|e| UplinkError::Write {
                path: self.path,
                reason: e.to_string(),
            })
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!("Closing uplink {} failed: {}", self.path, e);
        }
    }
}

/// What the dispatcher does when a write fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop dispatching and report the error; the process exits.
    FailFast,
    /// Re-dial the failed connection and resend the frame once connected.
    Reconnect(Backoff),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub events_sent: u64,
    pub heartbeats_sent: u64,
    pub reconnects: u64,
}

struct Link {
    path: &'static str,
    sink: Box<dyn FrameSink>,
}

/// The single consumer of the event and heartbeat queues.
pub struct Dispatcher {
    connector: Arc<dyn Connector>,
    policy: FailurePolicy,
    events: Link,
    status: Link,
    stats: DispatchStats,
}

impl Dispatcher {
    /// Establishes both connections. Either failing is fatal.
    pub async fn connect(connector: Arc<dyn Connector>, policy: FailurePolicy) -> Result<Self, UplinkError> {
        let events = Link {
            path: EVENTS_PATH,
            sink: connector.connect(EVENTS_PATH).await?,
        };
        let status = Link {
            path: STATUS_PATH,
            sink: connector.connect(STATUS_PATH).await?,
        };

        Ok(Dispatcher {
            connector,
            policy,
            events,
            status,
            stats: DispatchStats::default(),
        })
    }

    /// Forwards queued payloads until shutdown or until both queues close.
    /// On shutdown whatever is already queued is flushed first.
    pub async fn run(
        mut self,
        mut events_rx: mpsc::Receiver<String>,
        mut status_rx: mpsc::Receiver<String>,
        mut shutdown: ShutdownSignal,
    ) -> Result<DispatchStats, UplinkError> {
        let mut events_open = true;
        let mut status_open = true;

        while events_open || status_open {
            tokio::select! {
                item = events_rx.recv(), if events_open => match item {
                    Some(payload) => {
                        let outcome = deliver(
                            &*self.connector,
                            self.policy,
                            &mut self.events,
                            &payload,
                            &mut self.stats,
                            &mut shutdown,
                        )
                        .await?;
                        if outcome == Delivery::Abandoned {
                            break;
                        }
                        self.stats.events_sent += 1;
                    }
                    None => {
                        info!("Event queue closed");
                        events_open = false;
                    }
                },
                item = status_rx.recv(), if status_open => match item {
                    Some(payload) => {
                        let outcome = deliver(
                            &*self.connector,
                            self.policy,
                            &mut self.status,
                            &payload,
                            &mut self.stats,
                            &mut shutdown,
                        )
                        .await?;
                        if outcome == Delivery::Abandoned {
                            break;
                        }
                        self.stats.heartbeats_sent += 1;
                    }
                    None => {
                        info!("Heartbeat queue closed");
                        status_open = false;
                    }
                },
                _ = shutdown.wait() => {
                    info!("Dispatcher draining queues before exit");
                    self.drain(&mut events_rx, &mut status_rx).await;
                    break;
                }
            }
        }

        self.events.sink.close().await;
        self.status.sink.close().await;
        info!(
            "Dispatcher stopped: {} events, {} heartbeats sent, {} reconnects",
            self.stats.events_sent, self.stats.heartbeats_sent, self.stats.reconnects
        );
        Ok(self.stats)
    }

    async fn drain(&mut self, events_rx: &mut mpsc::Receiver<String>, status_rx: &mut mpsc::Receiver<String>) {
        while let Ok(payload) = events_rx.try_recv() {
            if let Err(e) = self.events.sink.send_text(&payload).await {
                warn!("Dropping undelivered events during shutdown: {}", e);
                break;
            }
            self.stats.events_sent += 1;
        }
        while let Ok(payload) = status_rx.try_recv() {
            if let Err(e) = self.status.sink.send_text(&payload).await {
                warn!("Dropping undelivered heartbeats during shutdown: {}", e);
                break;
            }
            self.stats.heartbeats_sent += 1;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Sent,
    /// Shutdown arrived while the link was being re-dialed; the frame is dropped.
    Abandoned,
}

async fn deliver(
    connector: &dyn Connector,
    policy: FailurePolicy,
    link: &mut Link,
    payload: &str,
    stats: &mut DispatchStats,
    shutdown: &mut ShutdownSignal,
) -> Result<Delivery, UplinkError> {
    let err = match link.sink.send_text(payload).await {
        Ok(()) => return Ok(Delivery::Sent),
        Err(e) => e,
    };

    match policy {
        FailurePolicy::FailFast => {
            error!("{}", err);
            Err(err)
        }
        FailurePolicy::Reconnect(backoff) => {
            warn!("{}, reconnecting", err);
            if redial(connector, link, backoff, shutdown).await? == Delivery::Abandoned {
                info!("Shutdown during reconnect of {}, dropping pending frame", link.path);
                return Ok(Delivery::Abandoned);
            }
            stats.reconnects += 1;
            link.sink.send_text(payload).await.map_err(|e| {
                error!("{}", e);
                e
            })?;
            Ok(Delivery::Sent)
        }
    }
}

/// Re-dials `link` with exponential backoff. Both the wait and the dial give
/// way to shutdown.
async fn redial(
    connector: &dyn Connector,
    link: &mut Link,
    backoff: Backoff,
    shutdown: &mut ShutdownSignal,
) -> Result<Delivery, UplinkError> {
    let mut delay = backoff.initial;

    for attempt in 1..=backoff.max_attempts {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.wait() => return Ok(Delivery::Abandoned),
        }

        let dialed = tokio::select! {
            result = connector.connect(link.path) => result,
            _ = shutdown.wait() => return Ok(Delivery::Abandoned),
        };

        match dialed {
            Ok(sink) => {
                info!("Uplink {} reconnected after {} attempt(s)", link.path, attempt);
                link.sink = sink;
                return Ok(Delivery::Sent);
            }
            Err(e) => {
                warn!(
                    "Reconnect attempt {}/{} for {} failed: {}",
                    attempt, backoff.max_attempts, link.path, e
                );
                delay = (delay * 2).min(backoff.max);
            }
        }
    }

    error!("Giving up on uplink {}", link.path);
    Err(UplinkError::ReconnectExhausted {
        path: link.path,
        attempts: backoff.max_attempts,
    })
}
