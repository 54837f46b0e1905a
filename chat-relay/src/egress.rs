use std::{fmt, sync::Arc};

use futures_util::{Stream, StreamExt};
use tokio::{select, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    broker::BrokerHealth, envelope::Envelope, registry::ConnectionRegistry, shutdown::Signal,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Writes `raw` to every connection in a registry snapshot, one after the
    /// other. A failed write is logged and skipped; the connection stays
    /// registered until its own receive loop notices the dead socket. A slow
    /// socket holds up every connection after it in the snapshot.
    pub async fn broadcast(&self, raw: &str) -> BroadcastReport {
        let connections = self.registry.snapshot().await;
        debug!(clients = connections.len(), "broadcasting message");

        let mut report = BroadcastReport::default();
        for connection in connections {
            match connection.send_text(raw).await {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    warn!(
                        connection_id = %connection.id(),
                        error = %err,
                        "failed to deliver message"
                    );
                    report.failed += 1;
                }
            }
        }
        report
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerExit {
    Shutdown,
    StreamEnded,
}

pub async fn run<S, E>(
    deliveries: S,
    broadcaster: &Broadcaster,
    shutdown: &mut Signal,
) -> ConsumerExit
where
    S: Stream<Item = Result<Vec<u8>, E>>,
    E: fmt::Display,
{
    let mut deliveries = std::pin::pin!(deliveries);

    loop {
        let delivery = select! {
            _ = shutdown.wait() => return ConsumerExit::Shutdown,
            delivery = deliveries.next() => delivery,
        };

        match delivery {
            Some(Ok(body)) => deliver(&body, broadcaster).await,
            Some(Err(err)) => warn!(error = %err, "broker delivery failed"),
            None => return ConsumerExit::StreamEnded,
        }
    }
}

async fn deliver(body: &[u8], broadcaster: &Broadcaster) {
    if let Err(err) = Envelope::decode(body) {
        warn!(error = %err, "discarding malformed broker message");
        return;
    }
    let raw = match std::str::from_utf8(body) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(error = %err, "discarding non utf-8 broker message");
            return;
        }
    };

    let report = broadcaster.broadcast(raw).await;
    debug!(
        delivered = report.delivered,
        failed = report.failed,
        "broadcast complete"
    );
}

/// Spawns the instance's single consumer task. If the broker stops
/// delivering, fan-out for this instance is over: the task marks the broker
/// link as down so health checks fail, and is not restarted.
pub fn spawn<S, E>(
    deliveries: S,
    broadcaster: Broadcaster,
    mut shutdown: Signal,
    health: Arc<BrokerHealth>,
) -> JoinHandle<ConsumerExit>
where
    S: Stream<Item = Result<Vec<u8>, E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    tokio::spawn(async move {
        let exit = run(deliveries, &broadcaster, &mut shutdown).await;
        match exit {
            ConsumerExit::Shutdown => info!("broker consumer stopped for shutdown"),
            ConsumerExit::StreamEnded => {
                error!("broker consumer ended; this instance no longer receives messages");
                health.mark_disconnected();
            }
        }
        exit
    })
}
