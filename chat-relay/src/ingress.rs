use axum::extract::ws::Message;
use chrono::Utc;
use futures_util::{Stream, StreamExt};
use tokio::select;
use tracing::{debug, error, info, warn};

use crate::{
    broker::Publisher,
    envelope::{Envelope, InboundMessage},
    registry::ConnectionId,
    shutdown::Signal,
};

const CLOSE_NORMAL: u16 = 1000;
pub(crate) const CLOSE_GOING_AWAY: u16 = 1001;
const CLOSE_ABNORMAL: u16 = 1006;

#[derive(Debug)]
pub enum Disconnect {
    Closed(Option<u16>),
    StreamEnded,
    ReadFailed(axum::Error),
    Shutdown,
}

impl Disconnect {
    /// Close codes other than normal, going-away and abnormal closure.
    pub fn is_unexpected(&self) -> bool {
        matches!(
            self,
            Disconnect::Closed(Some(code))
                if ![CLOSE_NORMAL, CLOSE_GOING_AWAY, CLOSE_ABNORMAL].contains(code)
        )
    }

    pub fn log(&self, connection_id: &ConnectionId) {
        match self {
            Disconnect::Closed(code) if self.is_unexpected() => {
                warn!(%connection_id, ?code, "client closed with unexpected code");
            }
            Disconnect::Closed(code) => debug!(%connection_id, ?code, "client closed"),
            Disconnect::StreamEnded => debug!(%connection_id, "client stream ended"),
            Disconnect::ReadFailed(err) => debug!(%connection_id, error = %err, "read failed"),
            Disconnect::Shutdown => info!(%connection_id, "closing client for shutdown"),
        }
    }
}

pub struct Ingress<'a> {
    pub connection_id: &'a ConnectionId,
    pub instance: &'a str,
    pub publisher: &'a dyn Publisher,
}

impl Ingress<'_> {
    pub async fn run<S>(&self, mut frames: S, shutdown: &mut Signal) -> Disconnect
    where
        S: Stream<Item = Result<Message, axum::Error>> + Unpin,
    {
        loop {
            let frame = select! {
                _ = shutdown.wait() => return Disconnect::Shutdown,
                frame = frames.next() => frame,
            };

            match frame {
                Some(Ok(Message::Text(text))) => {
                    self.relay(text.as_bytes()).await;
                }
                Some(Ok(Message::Binary(bytes))) => {
                    self.relay(&bytes).await;
                }
                // Pings are answered by the websocket layer itself.
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    return Disconnect::Closed(frame.map(|frame| frame.code));
                }
                Some(Err(err)) => return Disconnect::ReadFailed(err),
                None => return Disconnect::StreamEnded,
            }
        }
    }

    async fn relay(&self, payload: &[u8]) {
        let connection_id = self.connection_id;

        let inbound = match InboundMessage::parse(payload) {
            Ok(inbound) => inbound,
            Err(err) => {
                warn!(%connection_id, error = %err, "discarding malformed client message");
                return;
            }
        };

        let envelope = Envelope::stamp(inbound, connection_id, self.instance, Utc::now());
        let body = match envelope.encode() {
            Ok(body) => body,
            Err(err) => {
                error!(%connection_id, error = %err, "failed to encode envelope");
                return;
            }
        };

        match self.publisher.publish(body).await {
            Ok(()) => debug!(%connection_id, "published message to broker"),
            Err(err) => {
                error!(%connection_id, error = ?err, "failed to publish message; dropping it");
            }
        }
    }
}
