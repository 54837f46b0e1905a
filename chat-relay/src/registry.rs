//! Bookkeeping for the sockets held by this instance.
//!
//! The registry only tracks membership. Each [`Connection`] is owned by the
//! task that accepted it; that task is the only one that removes it from the
//! registry or closes its socket.

use std::{
    collections::BTreeMap,
    fmt,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use axum::extract::ws::{CloseFrame, Message};
use futures_util::{Sink, SinkExt};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

/// Outbound half of a client socket.
pub type ClientSink = Pin<Box<dyn Sink<Message, Error = axum::Error> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hands out `<instance>-<nanos>` ids. The numeric part is the creation time
/// in nanoseconds, bumped when needed so it strictly increases.
pub struct ConnectionIds {
    instance: String,
    last: AtomicU64,
}

impl ConnectionIds {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            last: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> ConnectionId {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or_default();
        let previous = match self
            .last
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |last| {
                Some(now.max(last + 1))
            }) {
            Ok(previous) | Err(previous) => previous,
        };
        ConnectionId(format!("{}-{}", self.instance, now.max(previous + 1)))
    }
}

pub struct Connection {
    id: ConnectionId,
    sink: Mutex<ClientSink>,
}

impl Connection {
    pub fn new(id: ConnectionId, sink: ClientSink) -> Self {
        Self {
            id,
            sink: Mutex::new(sink),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub async fn send_text(&self, text: &str) -> Result<(), axum::Error> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text.to_owned())).await
    }

    /// Sends an optional close frame and closes the socket's outbound half.
    pub async fn close(&self, frame: Option<CloseFrame<'static>>) -> Result<(), axum::Error> {
        let mut sink = self.sink.lock().await;
        if let Some(frame) = frame {
            sink.send(Message::Close(Some(frame))).await?;
        }
        sink.close().await
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} is already registered")]
    AlreadyRegistered(ConnectionId),
}

/// The set of live connections on this instance.
///
/// Add and remove take the write lock; snapshots and size take the read lock.
/// `reported` mirrors the map's length and is updated inside the same write
/// critical section, so status readers can load it without locking.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<BTreeMap<ConnectionId, Arc<Connection>>>,
    reported: AtomicUsize,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the local client count after insertion.
    pub async fn add(&self, connection: Arc<Connection>) -> Result<usize, RegistryError> {
        let mut connections = self.connections.write().await;
        if connections.contains_key(connection.id()) {
            return Err(RegistryError::AlreadyRegistered(connection.id().clone()));
        }
        connections.insert(connection.id().clone(), connection);
        self.reported.fetch_add(1, Ordering::SeqCst);
        Ok(connections.len())
    }

    /// Returns the remaining count, or `None` when the id was not registered.
    pub async fn remove(&self, id: &ConnectionId) -> Option<usize> {
        let mut connections = self.connections.write().await;
        connections.remove(id)?;
        self.reported.fetch_sub(1, Ordering::SeqCst);
        Some(connections.len())
    }

    /// Point-in-time copy of the membership, ordered by connection id. The
    /// lock is released before the caller touches any socket.
    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn size(&self) -> usize {
        self.connections.read().await.len()
    }

    pub fn reported_count(&self) -> usize {
        self.reported.load(Ordering::SeqCst)
    }
}


#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::testing::{drain_sink, recording_sink};
    use super::*;

    fn connection(ids: &ConnectionIds) -> Arc<Connection> {
        Arc::new(Connection::new(ids.next(), drain_sink()))
    }

    #[test]
    fn ids_are_unique_and_carry_the_instance() {
        let ids = ConnectionIds::new("pod-a");
        let generated: Vec<_> = (0..1_000).map(|_| ids.next()).collect();
        let unique: HashSet<_> = generated.iter().collect();

        assert_eq!(unique.len(), generated.len());
        assert!(generated.iter().all(|id| id.as_str().starts_with("pod-a-")));
        assert!(generated.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[tokio::test]
    async fn duplicate_add_is_rejected() {
        let registry = ConnectionRegistry::new();
        let ids = ConnectionIds::new("pod-a");
        let first = connection(&ids);

        assert_eq!(registry.add(Arc::clone(&first)).await, Ok(1));
        let result = registry.add(Arc::clone(&first)).await;

        assert_eq!(
            result,
            Err(RegistryError::AlreadyRegistered(first.id().clone()))
        );
        assert_eq!(registry.size().await, 1);
        assert_eq!(registry.reported_count(), 1);
    }

    #[tokio::test]
    async fn removing_twice_is_a_no_op() {
        let registry = ConnectionRegistry::new();
        let ids = ConnectionIds::new("pod-a");
        let conn = connection(&ids);
        registry.add(Arc::clone(&conn)).await.unwrap();

        assert_eq!(registry.remove(conn.id()).await, Some(0));
        assert_eq!(registry.remove(conn.id()).await, None);
        assert_eq!(registry.size().await, 0);
        assert_eq!(registry.reported_count(), 0);
    }

    #[tokio::test]
    async fn snapshot_is_detached_from_later_changes() {
        let registry = ConnectionRegistry::new();
        let ids = ConnectionIds::new("pod-a");
        let a = connection(&ids);
        let b = connection(&ids);
        registry.add(Arc::clone(&a)).await.unwrap();
        registry.add(Arc::clone(&b)).await.unwrap();

        let snapshot = registry.snapshot().await;
        registry.remove(a.id()).await;

        let snapshot_ids: Vec<_> = snapshot.iter().map(|c| c.id().clone()).collect();
        assert_eq!(snapshot_ids, vec![a.id().clone(), b.id().clone()]);
        assert_eq!(registry.size().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_adds_and_removes_settle_consistently() {
        let registry = Arc::new(ConnectionRegistry::new());
        let ids = ConnectionIds::new("pod-a");
        let planned: Vec<ConnectionId> = (0..200).map(|_| ids.next()).collect();
        let known: Arc<HashSet<ConnectionId>> = Arc::new(planned.iter().cloned().collect());

        let mut tasks = Vec::new();
        for (i, id) in planned.into_iter().enumerate() {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let conn = Arc::new(Connection::new(id, drain_sink()));
                registry.add(Arc::clone(&conn)).await.unwrap();
                tokio::task::yield_now().await;
                // Every third connection stays registered.
                if i % 3 != 0 {
                    registry.remove(conn.id()).await;
                }
            }));
        }

        let observer = {
            let registry = Arc::clone(&registry);
            let known = Arc::clone(&known);
            tokio::spawn(async move {
                for _ in 0..100 {
                    let snapshot = registry.snapshot().await;
                    let unique: HashSet<_> = snapshot.iter().map(|c| c.id().clone()).collect();
                    assert_eq!(unique.len(), snapshot.len(), "snapshot repeated an entry");
                    assert!(unique.is_subset(&known), "snapshot held an unknown id");
                    tokio::task::yield_now().await;
                }
            })
        };

        for task in tasks {
            task.await.unwrap();
        }
        observer.await.unwrap();

        let expected = (0..200).filter(|i| i % 3 == 0).count();
        assert_eq!(registry.size().await, expected);
        assert_eq!(registry.reported_count(), expected);
        assert_eq!(registry.snapshot().await.len(), expected);
    }

    #[tokio::test]
    async fn close_sends_the_frame_first() {
        let (sink, mut rx) = recording_sink();
        let conn = Connection::new(ConnectionIds::new("pod-a").next(), sink);

        conn.send_text("hello").await.unwrap();
        conn.close(Some(CloseFrame {
            code: 1001,
            reason: "bye".into(),
        }))
        .await
        .unwrap();

        assert_eq!(rx.recv().await, Some(Message::Text("hello".into())));
        match rx.recv().await {
            Some(Message::Close(Some(frame))) => assert_eq!(frame.code, 1001),
            other => panic!("expected close frame, got {other:?}"),
        }
    }
}
