//! Helper connections
//!
//! Tracks accepted helper sockets and the optional process-name mapping
//! announced through `ping` events.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, watch};
use tracing::debug;
use uuid::Uuid;

type LineWriter = Box<dyn AsyncWrite + Send + Unpin>;

const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Identity of a connection, handed to event handlers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub peer: String,
}

/// One accepted helper socket (write side)
pub struct ClientConnection {
    info: ConnectionInfo,
    writer: Mutex<LineWriter>,
    alive: AtomicBool,
    /// Flipped by `close`; interrupts a write in progress
    closed: watch::Sender<bool>,
    write_timeout: Duration,
    connected_at: DateTime<Utc>,
}

impl ClientConnection {
    /// Wrap the write half of an accepted socket
    pub fn new(peer: impl Into<String>, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            info: ConnectionInfo {
                id: Uuid::new_v4(),
                peer: peer.into(),
            },
            writer: Mutex::new(Box::new(writer)),
            alive: AtomicBool::new(true),
            closed: watch::channel(false).0,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            connected_at: Utc::now(),
        }
    }

    /// Limit how long one line may take to be accepted by the peer
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn id(&self) -> Uuid {
        self.info.id
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Write one complete protocol line
    ///
    /// A peer that does not take the line within the write timeout, or a
    /// `close` while waiting, fails the write and marks the connection dead.
    pub async fn write_line(&self, line: &str) -> io::Result<()> {
        if !self.is_alive() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection is closed",
            ));
        }

        let mut closed = self.closed.subscribe();
        let write = async {
            let mut writer = self.writer.lock().await;
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        };

        let result = tokio::select! {
            result = tokio::time::timeout(self.write_timeout, write) => {
                result.unwrap_or_else(|_| {
                    Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("peer did not accept the line within {:?}", self.write_timeout),
                    ))
                })
            }
            _ = closed.wait_for(|closed| *closed) => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection closed during write",
            )),
        };

        if result.is_err() {
            self.alive.store(false, Ordering::SeqCst);
        }
        result
    }

    /// Mark closed and shut down the write half
    ///
    /// Never waits behind a write in progress: that write is interrupted
    /// and the socket is released once the last handle drops.
    pub async fn close(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        self.closed.send_replace(true);

        let Ok(mut writer) = self.writer.try_lock() else {
            debug!("Connection {} closed with a write in progress", self.info.id);
            return;
        };
        match tokio::time::timeout(self.write_timeout, writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Shutdown of connection {} failed: {}", self.info.id, e),
            Err(_) => debug!("Shutdown of connection {} timed out", self.info.id),
        }
    }
}

/// Live helper connections plus the process-name index
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<Uuid, Arc<ClientConnection>>,
    processes: DashMap<String, Uuid>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, connection: Arc<ClientConnection>) {
        self.connections.insert(connection.id(), connection);
    }

    /// Remove a connection and every process name pointing at it
    pub fn remove(&self, id: Uuid) -> Option<Arc<ClientConnection>> {
        self.processes.retain(|_, conn_id| *conn_id != id);
        self.connections.remove(&id).map(|(_, conn)| conn)
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<ClientConnection>> {
        self.connections.get(&id).map(|c| Arc::clone(c.value()))
    }

    /// Snapshot of the connections still marked alive
    pub fn live(&self) -> Vec<Arc<ClientConnection>> {
        self.connections
            .iter()
            .filter(|c| c.value().is_alive())
            .map(|c| Arc::clone(c.value()))
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.connections.iter().filter(|c| c.value().is_alive()).count()
    }

    /// Associate a process name with a known connection
    pub fn register_process(&self, process: &str, id: Uuid) -> bool {
        if !self.connections.contains_key(&id) {
            return false;
        }
        self.processes.insert(process.to_string(), id);
        true
    }

    /// Connection that announced the given process name
    pub fn by_process(&self, process: &str) -> Option<Arc<ClientConnection>> {
        let id = *self.processes.get(process)?.value();
        self.get(id)
    }

    pub fn process_names(&self) -> Vec<String> {
        self.processes.iter().map(|e| e.key().clone()).collect()
    }

    /// Remove everything, returning the connections that were held
    pub fn drain(&self) -> Vec<Arc<ClientConnection>> {
        self.processes.clear();
        let ids: Vec<Uuid> = self.connections.iter().map(|c| *c.key()).collect();
        ids.into_iter()
            .filter_map(|id| self.connections.remove(&id).map(|(_, conn)| conn))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_write_line_reaches_peer() {
        let (client, mut server) = tokio::io::duplex(1024);
        let conn = ClientConnection::new("test", client);

        conn.write_line("{\"action\":\"x\"}\n").await.unwrap();

        let mut buf = vec![0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"{\"action\":\"x\"}\n");
    }

    #[tokio::test]
    async fn test_closed_connection_refuses_writes() {
        let (client, _server) = tokio::io::duplex(64);
        let conn = ClientConnection::new("test", client);

        conn.close().await;
        assert!(!conn.is_alive());
        assert!(conn.write_line("x\n").await.is_err());
    }

    #[tokio::test]
    async fn test_unread_peer_times_out_write() {
        let (client, _server) = tokio::io::duplex(16);
        let conn = ClientConnection::new("stalled", client)
            .with_write_timeout(Duration::from_millis(50));

        let err = conn.write_line(&"x".repeat(1024)).await.unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(!conn.is_alive());
    }

    #[tokio::test]
    async fn test_close_interrupts_pending_write() {
        let (client, _server) = tokio::io::duplex(16);
        let conn = Arc::new(
            ClientConnection::new("stalled", client).with_write_timeout(Duration::from_secs(60)),
        );

        let writer = conn.clone();
        let write = tokio::spawn(async move { writer.write_line(&"x".repeat(1024)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(1), conn.close())
            .await
            .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), write)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_dropped_peer_fails_write() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let conn = ClientConnection::new("gone", client);

        assert!(conn.write_line("x\n").await.is_err());
        assert!(!conn.is_alive());
    }

    #[tokio::test]
    async fn test_process_mapping_follows_connection() {
        let registry = ConnectionRegistry::new();
        let (client, _server) = tokio::io::duplex(64);
        let conn = Arc::new(ClientConnection::new("test", client));
        let id = conn.id();
        registry.insert(conn);

        assert!(registry.register_process("com.apple.MobileSMS", id));
        assert_eq!(registry.by_process("com.apple.MobileSMS").map(|c| c.id()), Some(id));

        registry.remove(id);
        assert!(registry.by_process("com.apple.MobileSMS").is_none());
        assert!(registry.process_names().is_empty());
    }

    #[test]
    fn test_register_unknown_connection() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.register_process("proc", Uuid::new_v4()));
    }

    #[tokio::test]
    async fn test_drain() {
        let registry = ConnectionRegistry::new();
        for _ in 0..3 {
            let (client, _server) = tokio::io::duplex(64);
            registry.insert(Arc::new(ClientConnection::new("test", client)));
        }
        assert_eq!(registry.live_count(), 3);
        assert_eq!(registry.drain().len(), 3);
        assert_eq!(registry.live_count(), 0);
    }
}
