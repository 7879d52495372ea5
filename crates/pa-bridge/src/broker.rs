//! Private API connection broker
//!
//! Owns the loopback listener the helper connects to, the accepted helper
//! connections, and the serialized write path. Incoming lines either
//! resolve a pending transaction or fan out to the event handlers.
//!
//! Lifecycle: `Stopped -> Starting -> Listening <-> Connected -> Stopping ->
//! Stopped`, with `Failed` once listener recovery gives up.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use pa_core::{BridgeConfig, HandleResolver, Notifier, listen_port};
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connection::{ClientConnection, ConnectionInfo, ConnectionRegistry};
use crate::error::{BridgeError, Result};
use crate::events::{
    AliasDeregistrationHandler, EventHandlerSet, FaceTimeStatusHandler, FindMyLocationCache,
    FindMyLocationHandler, IncomingEvent, PingHandler, TypingHandler,
};
use crate::mode::AttachMode;
use crate::protocol::{IncomingMessage, LineBuffer, OutgoingRequest, decode_line};
use crate::session::FaceTimeSessions;
use crate::transaction::{Transaction, TransactionKind, TransactionRegistry};

const READ_CHUNK: usize = 8 * 1024;

/// Longest line excerpt included in decode warnings
const LOG_EXCERPT: usize = 200;

/// Broker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerState {
    Stopped,
    Starting,
    Listening,
    Connected,
    Stopping,
    /// Listener recovery exhausted its restarts
    Failed,
}

/// Snapshot for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct BrokerStatus {
    pub state: BrokerState,
    pub address: Option<SocketAddr>,
    pub connections: usize,
    pub processes: Vec<String>,
    pub pending_transactions: usize,
    pub restarts: u32,
}

/// Collaborators the default event handlers publish through
#[derive(Clone)]
pub struct Collaborators {
    pub notifier: Arc<dyn Notifier>,
    pub resolver: Arc<dyn HandleResolver>,
}

struct Inner {
    config: BridgeConfig,
    transactions: Arc<TransactionRegistry>,
    connections: Arc<ConnectionRegistry>,
    sessions: Arc<FaceTimeSessions>,
    handlers: EventHandlerSet,
    mode: Option<Arc<dyn AttachMode>>,
    write_lock: Semaphore,
    lifecycle: tokio::sync::Mutex<()>,
    state: Mutex<BrokerState>,
    address: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    readers: DashMap<Uuid, JoinHandle<()>>,
    restarts: AtomicU32,
}

/// Handle to the broker; cheap to clone
#[derive(Clone)]
pub struct PrivateApiBroker {
    inner: Arc<Inner>,
}

/// The standard handler set: typing, ping, FaceTime, Find My, aliases
pub fn default_handlers(
    config: &BridgeConfig,
    collaborators: &Collaborators,
    connections: &Arc<ConnectionRegistry>,
    sessions: &Arc<FaceTimeSessions>,
) -> EventHandlerSet {
    EventHandlerSet::new()
        .with(Arc::new(TypingHandler::new(
            collaborators.notifier.clone(),
            Duration::from_secs(config.typing_debounce_secs),
        )))
        .with(Arc::new(PingHandler::new(connections.clone())))
        .with(Arc::new(FaceTimeStatusHandler::new(
            collaborators.notifier.clone(),
            collaborators.resolver.clone(),
            sessions.clone(),
        )))
        .with(Arc::new(FindMyLocationHandler::new(
            collaborators.notifier.clone(),
            Arc::new(FindMyLocationCache::new()),
            Duration::from_millis(config.findmy_emit_delay_ms),
        )))
        .with(Arc::new(AliasDeregistrationHandler::new(
            collaborators.notifier.clone(),
        )))
}

impl PrivateApiBroker {
    /// Broker with the default event handlers
    pub fn new(
        config: BridgeConfig,
        collaborators: Collaborators,
        mode: Option<Arc<dyn AttachMode>>,
    ) -> Self {
        Self::with_handlers(config, mode, |config, connections, sessions| {
            default_handlers(config, &collaborators, connections, sessions)
        })
    }

    /// Broker with a custom handler set built against its registries
    pub fn with_handlers<F>(config: BridgeConfig, mode: Option<Arc<dyn AttachMode>>, build: F) -> Self
    where
        F: FnOnce(&BridgeConfig, &Arc<ConnectionRegistry>, &Arc<FaceTimeSessions>) -> EventHandlerSet,
    {
        let connections = Arc::new(ConnectionRegistry::new());
        let sessions = Arc::new(FaceTimeSessions::new());
        let handlers = build(&config, &connections, &sessions);

        Self {
            inner: Arc::new(Inner {
                config,
                transactions: Arc::new(TransactionRegistry::new()),
                connections,
                sessions,
                handlers,
                mode,
                write_lock: Semaphore::new(1),
                lifecycle: tokio::sync::Mutex::new(()),
                state: Mutex::new(BrokerState::Stopped),
                address: Mutex::new(None),
                accept_task: Mutex::new(None),
                readers: DashMap::new(),
                restarts: AtomicU32::new(0),
            }),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn transactions(&self) -> &Arc<TransactionRegistry> {
        &self.inner.transactions
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.inner.connections
    }

    pub fn sessions(&self) -> &Arc<FaceTimeSessions> {
        &self.inner.sessions
    }

    /// Address the listener is bound to, while listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.address.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: BrokerState) {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn state(&self) -> BrokerState {
        let state = *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state == BrokerState::Listening && self.inner.connections.live_count() > 0 {
            BrokerState::Connected
        } else {
            state
        }
    }

    pub fn status(&self) -> BrokerStatus {
        BrokerStatus {
            state: self.state(),
            address: self.local_addr(),
            connections: self.inner.connections.live_count(),
            processes: self.inner.connections.process_names(),
            pending_transactions: self.inner.transactions.len(),
            restarts: self.inner.restarts.load(Ordering::SeqCst),
        }
    }

    /// Listening with at least one live helper connection
    pub fn is_healthy(&self) -> bool {
        self.state() == BrokerState::Connected
    }

    /// Fail with `HelperNotRunning` unless the broker is healthy
    pub fn throw_for_bad_status(&self) -> Result<()> {
        if self.is_healthy() {
            Ok(())
        } else {
            Err(BridgeError::HelperNotRunning)
        }
    }

    /// Bind the listener and start the attach mode
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.start_locked().await
    }

    /// Close every connection, the listener, and the attach mode
    ///
    /// Calling this on a stopped broker does nothing.
    pub async fn stop(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.stop_locked().await;
        self.set_state(BrokerState::Stopped);
        Ok(())
    }

    pub async fn restart(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        info!("Restarting Private API broker");
        self.stop_locked().await;
        self.start_locked().await
    }

    fn bind(&self) -> Result<TcpListener> {
        let port = listen_port(&self.inner.config);
        let addr: SocketAddr = format!("{}:{}", self.inner.config.host, port)
            .parse()
            .map_err(|e| {
                BridgeError::Core(pa_core::Error::Config(format!(
                    "invalid bridge host '{}': {}",
                    self.inner.config.host, e
                )))
            })?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        Ok(socket.listen(self.inner.config.backlog)?)
    }

    async fn start_locked(&self) -> Result<()> {
        if matches!(self.state(), BrokerState::Listening | BrokerState::Connected) {
            debug!("Private API broker already listening");
            return Ok(());
        }
        self.set_state(BrokerState::Starting);

        let listener = match self.bind() {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind Private API listener: {}", e);
                self.set_state(BrokerState::Stopped);
                return Err(e);
            }
        };
        let address = listener.local_addr()?;
        *self.inner.address.lock().unwrap_or_else(PoisonError::into_inner) = Some(address);
        self.inner.restarts.store(0, Ordering::SeqCst);

        let task = tokio::spawn(self.clone().accept_loop(listener));
        *self.inner.accept_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        self.set_state(BrokerState::Listening);
        info!("Private API broker listening on {}", address);

        if let Some(mode) = &self.inner.mode {
            self.start_mode(mode.as_ref()).await;
        }
        Ok(())
    }

    async fn start_mode(&self, mode: &dyn AttachMode) {
        match mode.install().await {
            Ok(status) if status.success => {
                debug!("{} install: {}", mode.name(), status.message);
                if let Err(e) = mode.start().await {
                    error!("Failed to start {} mode: {}", mode.name(), e);
                }
            }
            Ok(status) => warn!("Not starting {} mode: {}", mode.name(), status.message),
            Err(e) => error!("Failed to install {} mode: {}", mode.name(), e),
        }
    }

    async fn stop_locked(&self) {
        let accept = self
            .inner
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let was_running = accept.is_some();
        if let Some(task) = accept {
            self.set_state(BrokerState::Stopping);
            task.abort();
        }

        let readers: Vec<Uuid> = self.inner.readers.iter().map(|r| *r.key()).collect();
        for id in readers {
            if let Some((_, task)) = self.inner.readers.remove(&id) {
                task.abort();
            }
        }
        for connection in self.inner.connections.drain() {
            connection.close().await;
        }
        *self.inner.address.lock().unwrap_or_else(PoisonError::into_inner) = None;

        if let Some(mode) = &self.inner.mode {
            if let Err(e) = mode.stop().await {
                warn!("Failed to stop {} mode: {}", mode.name(), e);
            }
        }

        if was_running {
            info!("Private API broker stopped");
        }
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => self.on_connection(stream, peer),
                Err(e) => {
                    error!("Private API listener error: {}", e);
                    // Recovery aborts this task, so it must not run on it
                    tokio::spawn(self.recover());
                    return;
                }
            }
        }
    }

    /// Restart the listener after a failure, up to `max_restarts` times
    fn recover(self) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let _lifecycle = self.inner.lifecycle.lock().await;
            let max = self.inner.config.max_restarts;

            loop {
                let attempt = self.inner.restarts.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt > max {
                    self.stop_locked().await;
                    self.set_state(BrokerState::Failed);
                    error!(
                        "Private API listener failed after {} restart(s); giving up",
                        max
                    );
                    return;
                }

                warn!("Restarting Private API listener ({}/{})", attempt, max);
                self.stop_locked().await;
                self.set_state(BrokerState::Stopped);
                tokio::time::sleep(Duration::from_millis(250 * u64::from(attempt))).await;

                match self.start_locked().await {
                    Ok(()) => return,
                    Err(e) => error!("Private API listener restart failed: {}", e),
                }
            }
        })
    }

    fn on_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let (reader, writer) = stream.into_split();
        let connection = Arc::new(
            ClientConnection::new(peer.to_string(), writer)
                .with_write_timeout(Duration::from_millis(self.inner.config.write_timeout_ms)),
        );
        let info = connection.info().clone();
        self.inner.connections.insert(connection);
        info!("Private API helper connected (id: {}, peer: {})", info.id, info.peer);

        self.inner.readers.retain(|_, task| !task.is_finished());
        let id = info.id;
        let task = tokio::spawn(self.clone().read_loop(reader, info));
        self.inner.readers.insert(id, task);
    }

    async fn read_loop(self, mut reader: OwnedReadHalf, info: ConnectionInfo) {
        let mut buffer = LineBuffer::new();
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    for line in buffer.push(&chunk[..n]) {
                        self.handle_line(&line, &info).await;
                    }
                }
                Err(e) => {
                    warn!("Read from helper connection {} failed: {}", info.id, e);
                    break;
                }
            }
        }

        if let Some(connection) = self.inner.connections.remove(info.id) {
            connection.close().await;
        }
        self.inner.readers.remove(&info.id);
        info!("Private API helper disconnected (id: {})", info.id);
    }

    /// Route one complete incoming line
    async fn handle_line(&self, line: &str, info: &ConnectionInfo) {
        let message = match decode_line(line) {
            Ok(message) => message,
            Err(e) => {
                let excerpt: String = line.chars().take(LOG_EXCERPT).collect();
                warn!("Dropping undecodable helper line ({}): {}", e, excerpt);
                return;
            }
        };

        match message {
            IncomingMessage::Response(response) => {
                let id = response.transaction_id;
                let matched = match response.outcome {
                    Ok(payload) => self.inner.transactions.resolve(&id, payload),
                    Err(message) => self.inner.transactions.reject(&id, message),
                };
                if !matched {
                    debug!("Response for unknown or finished transaction {}", id);
                }
            }
            IncomingMessage::Event(envelope) => {
                let event = IncomingEvent::from_envelope(envelope);
                self.inner.handlers.dispatch(&event, info).await;
            }
            IncomingMessage::Anomaly(value) => {
                warn!("Helper line has neither transactionId nor event: {}", value);
            }
        }
    }

    /// Forget a connection that can no longer take writes
    async fn drop_connection(&self, connection: &ClientConnection) {
        let id = connection.id();
        self.inner.connections.remove(id);
        if let Some((_, task)) = self.inner.readers.remove(&id) {
            task.abort();
        }
        connection.close().await;
        info!("Private API helper dropped after failed write (id: {})", id);
    }

    /// Send one action line to every live connection
    ///
    /// Holds the write permit across serialization, the broadcast, and the
    /// post-send delay. Succeeds if any connection took the line; each
    /// connection gets at most `write_timeout_ms` and is dropped on failure.
    async fn send_line(&self, action: &str, data: Option<&Value>, transaction_id: Option<&str>) -> Result<()> {
        let _permit = self
            .inner
            .write_lock
            .acquire()
            .await
            .map_err(|_| BridgeError::HelperNotRunning)?;

        let line = OutgoingRequest {
            action,
            data,
            transaction_id,
        }
        .to_line()?;

        let connections = self.inner.connections.live();
        if connections.is_empty() {
            return Err(BridgeError::HelperNotRunning);
        }

        let mut delivered = 0;
        for connection in &connections {
            match connection.write_line(&line).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        "Failed to write '{}' to helper connection {}: {}",
                        action,
                        connection.id(),
                        e
                    );
                    self.drop_connection(connection).await;
                }
            }
        }

        if self.inner.config.write_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.inner.config.write_delay_ms)).await;
        }

        if delivered == 0 {
            return Err(BridgeError::Write {
                action: action.to_string(),
            });
        }
        debug!("Sent '{}' to {} connection(s)", action, delivered);
        Ok(())
    }

    /// Write an action, awaiting the helper's response when a transaction
    /// is supplied
    ///
    /// The transaction is registered before anything is sent. A write that
    /// reaches no connection discards it. Responses slower than
    /// `transaction_timeout_secs` expire it and fail with `Timeout`.
    pub async fn write(
        &self,
        action: &str,
        data: Option<Value>,
        transaction: Option<Transaction>,
    ) -> Result<Option<Value>> {
        let pending = match transaction {
            Some(transaction) => {
                let id = transaction.id.clone();
                Some(
                    self.inner
                        .transactions
                        .add(transaction)
                        .ok_or(BridgeError::DuplicateTransaction(id))?,
                )
            }
            None => None,
        };
        let transaction_id = pending.as_ref().map(|p| p.id().to_string());

        if let Err(e) = self
            .send_line(action, data.as_ref(), transaction_id.as_deref())
            .await
        {
            if let Some(id) = &transaction_id {
                self.inner.transactions.discard(id);
            }
            return Err(e);
        }

        let (Some(pending), Some(id)) = (pending, transaction_id) else {
            return Ok(None);
        };

        let deadline = Duration::from_secs(self.inner.config.transaction_timeout_secs);
        match tokio::time::timeout(deadline, pending.wait()).await {
            Ok(result) => result.map(Some),
            Err(_) => {
                self.inner.transactions.expire(&id);
                warn!("No response to '{}' ({}) within {:?}", action, id, deadline);
                Err(BridgeError::Timeout {
                    action: action.to_string(),
                })
            }
        }
    }

    /// Transactional write; resolves with the response payload
    pub async fn request(&self, action: &str, data: Value, kind: TransactionKind) -> Result<Value> {
        let response = self
            .write(action, Some(data), Some(Transaction::new(kind)))
            .await?;
        Ok(response.unwrap_or(Value::Null))
    }

    /// Fire-and-forget write
    pub async fn send(&self, action: &str, data: Value) -> Result<()> {
        self.write(action, Some(data), None).await?;
        Ok(())
    }
}
