use std::{future::Future, sync::Arc, time::Duration};

use axum::extract::ws::{CloseFrame, Message};
use chrono::Utc;
use futures_util::Stream;
use tokio_util::task::{TaskTracker, task_tracker::TrackedFuture};
use tracing::{debug, error, info, warn};

use crate::{
    broker::Publisher,
    envelope::Envelope,
    ingress::{CLOSE_GOING_AWAY, Disconnect, Ingress},
    registry::{ClientSink, Connection, ConnectionIds, ConnectionRegistry},
    shutdown::Signal,
};

/// Everything a connection task needs, built once by the composition root
/// and cloned into each session.
#[derive(Clone)]
pub struct Relay {
    instance: Arc<str>,
    registry: Arc<ConnectionRegistry>,
    publisher: Arc<dyn Publisher>,
    ids: Arc<ConnectionIds>,
    shutdown: Signal,
    sessions: TaskTracker,
}

impl Relay {
    pub fn new(
        instance: impl Into<String>,
        registry: Arc<ConnectionRegistry>,
        publisher: Arc<dyn Publisher>,
        shutdown: Signal,
    ) -> Self {
        let instance: String = instance.into();
        Self {
            ids: Arc::new(ConnectionIds::new(instance.clone())),
            instance: instance.into(),
            registry,
            publisher,
            shutdown,
            sessions: TaskTracker::new(),
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn track<F: Future>(&self, session: F) -> TrackedFuture<F> {
        self.sessions.track_future(session)
    }

    /// Waits up to `grace` for every tracked session to finish. Returns the
    /// number still running when the wait gave up.
    pub async fn drain_sessions(&self, grace: Duration) -> usize {
        self.sessions.close();
        match tokio::time::timeout(grace, self.sessions.wait()).await {
            Ok(()) => 0,
            Err(_) => self.sessions.len(),
        }
    }
}

/// Runs one upgraded socket from registration to close. This task owns the
/// connection: it is the only place that removes it from the registry or
/// closes its socket.
pub async fn serve<S>(relay: Relay, sink: ClientSink, frames: S)
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let connection = Arc::new(Connection::new(relay.ids.next(), sink));
    let connection_id = connection.id().clone();

    let local_clients = match relay.registry.add(Arc::clone(&connection)).await {
        Ok(count) => count,
        Err(err) => {
            error!(%connection_id, error = %err, "refusing connection");
            if let Err(err) = connection.close(None).await {
                debug!(%connection_id, error = %err, "socket already closed");
            }
            return;
        }
    };
    info!(
        %connection_id,
        total_clients = relay.registry.reported_count(),
        local_clients,
        "client connected"
    );

    send_welcome(&connection, &relay.instance).await;

    let ingress = Ingress {
        connection_id: &connection_id,
        instance: &relay.instance,
        publisher: relay.publisher.as_ref(),
    };
    let mut shutdown = relay.shutdown.clone();
    let disconnect = ingress.run(frames, &mut shutdown).await;
    disconnect.log(&connection_id);

    let remaining = relay.registry.remove(&connection_id).await;
    info!(
        %connection_id,
        total_clients = relay.registry.reported_count(),
        local_clients = remaining.unwrap_or_default(),
        "client disconnected"
    );

    let frame = matches!(disconnect, Disconnect::Shutdown).then(|| CloseFrame {
        code: CLOSE_GOING_AWAY,
        reason: "server shutting down".into(),
    });
    if let Err(err) = connection.close(frame).await {
        debug!(%connection_id, error = %err, "socket already closed");
    }
}

async fn send_welcome(connection: &Connection, instance: &str) {
    let welcome = match Envelope::welcome(instance, Utc::now()).encode() {
        Ok(bytes) => bytes,
        Err(err) => {
            error!(error = %err, "failed to encode welcome message");
            return;
        }
    };
    let welcome = String::from_utf8_lossy(&welcome);
    if let Err(err) = connection.send_text(&welcome).await {
        warn!(
            connection_id = %connection.id(),
            error = %err,
            "failed to send welcome message"
        );
    }
}
