use std::time::Duration;

use log::{error, info};
use serde::Serialize;

use crate::queue::OutboundQueue;
use crate::shutdown::ShutdownSignal;

/// Liveness record sent on the status connection. The id is the numeric
/// agent hash, not its text form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Heartbeat {
    #[serde(rename = "ID")]
    pub id: u32,
    #[serde(rename = "Status")]
    pub status: &'static str,
}

impl Heartbeat {
    pub fn alive(agent_hash: u32) -> Self {
        Heartbeat {
            id: agent_hash,
            status: "Alive",
        }
    }
}

/// Queues a heartbeat immediately and then once per `interval` until
/// shutdown. A full heartbeat queue drops that beat.
pub async fn run(agent_hash: u32, interval: Duration, queue: OutboundQueue, mut shutdown: ShutdownSignal) {
    let payload = match serde_json::to_string(&Heartbeat::alive(agent_hash)) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to serialize heartbeat: {}", e);
            return;
        }
    };

    info!("Heartbeat started (every {:?})", interval);
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                queue.offer(payload.clone());
            }
            _ = shutdown.wait() => {
                info!("Heartbeat stopping");
                break;
            }
        }
    }
}
