//! Helper ping handler

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{EventHandler, HelperEvent, IncomingEvent, types};
use crate::connection::{ConnectionInfo, ConnectionRegistry};
use crate::error::Result;

/// Records which process a connection belongs to
pub struct PingHandler {
    connections: Arc<ConnectionRegistry>,
}

impl PingHandler {
    pub fn new(connections: Arc<ConnectionRegistry>) -> Self {
        Self { connections }
    }
}

#[async_trait]
impl EventHandler for PingHandler {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn event_types(&self) -> &'static [&'static str] {
        &[types::PING]
    }

    async fn handle(&self, event: &IncomingEvent, connection: &ConnectionInfo) -> Result<()> {
        let process = match &event.kind {
            HelperEvent::Ping { process } => process.as_deref(),
            _ => None,
        };

        match process {
            Some(process) => {
                if self.connections.register_process(process, connection.id) {
                    info!(
                        "Private API helper ping from {} (connection {})",
                        process, connection.id
                    );
                } else {
                    debug!("Ping from {} on unknown connection {}", process, connection.id);
                }
            }
            None => info!("Private API helper ping (connection {})", connection.id),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ClientConnection;

    #[tokio::test]
    async fn test_ping_registers_process() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (client, _server) = tokio::io::duplex(64);
        let conn = Arc::new(ClientConnection::new("127.0.0.1:50000", client));
        let info = conn.info().clone();
        registry.insert(conn);

        let handler = PingHandler::new(registry.clone());
        let event = IncomingEvent {
            name: types::PING.to_string(),
            guid: None,
            process: Some("com.apple.MobileSMS".to_string()),
            kind: HelperEvent::Ping {
                process: Some("com.apple.MobileSMS".to_string()),
            },
        };
        handler.handle(&event, &info).await.unwrap();

        assert_eq!(
            registry.by_process("com.apple.MobileSMS").map(|c| c.id()),
            Some(info.id)
        );
    }

    #[tokio::test]
    async fn test_ping_without_process() {
        let registry = Arc::new(ConnectionRegistry::new());
        let handler = PingHandler::new(registry.clone());
        let event = IncomingEvent {
            name: types::PING.to_string(),
            guid: None,
            process: None,
            kind: HelperEvent::Ping { process: None },
        };
        let info = ConnectionInfo {
            id: uuid::Uuid::new_v4(),
            peer: "test".to_string(),
        };

        handler.handle(&event, &info).await.unwrap();
        assert!(registry.process_names().is_empty());
    }
}
