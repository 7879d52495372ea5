//! Action façades
//!
//! One façade per domain. Every method checks broker health, validates its
//! required fields, then writes the action; transactional actions resolve
//! with the helper's response payload.

pub mod attachment;
pub mod chat;
pub mod cloud;
pub mod facetime;
pub mod handle;
pub mod message;

use serde_json::Value;

use crate::broker::PrivateApiBroker;
use crate::error::{BridgeError, Result};

pub use attachment::AttachmentActions;
pub use chat::ChatActions;
pub use cloud::CloudActions;
pub use facetime::FaceTimeActions;
pub use handle::HandleActions;
pub use message::{MessageActions, MultipartMessage, OutgoingMessage};

/// A value that can be absent for validation purposes
///
/// Strings, lists, and `null` can be missing; booleans and numbers never
/// are, so `false` and `0` are valid values.
pub trait Required {
    fn is_missing(&self) -> bool;
}

impl Required for str {
    fn is_missing(&self) -> bool {
        self.is_empty()
    }
}

impl Required for String {
    fn is_missing(&self) -> bool {
        self.is_empty()
    }
}

impl<T: Required + ?Sized> Required for &T {
    fn is_missing(&self) -> bool {
        (**self).is_missing()
    }
}

impl<T: Required> Required for Option<T> {
    fn is_missing(&self) -> bool {
        self.as_ref().is_none_or(Required::is_missing)
    }
}

impl<T> Required for [T] {
    fn is_missing(&self) -> bool {
        self.is_empty()
    }
}

impl<T> Required for Vec<T> {
    fn is_missing(&self) -> bool {
        self.is_empty()
    }
}

impl Required for bool {
    fn is_missing(&self) -> bool {
        false
    }
}

impl Required for i64 {
    fn is_missing(&self) -> bool {
        false
    }
}

impl Required for Value {
    fn is_missing(&self) -> bool {
        match self {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            Value::Array(items) => items.is_empty(),
            _ => false,
        }
    }
}

/// Fail with a validation error naming every missing field
pub fn throw_for_missing_fields(action: &str, fields: &[(&str, &dyn Required)]) -> Result<()> {
    let missing: Vec<&str> = fields
        .iter()
        .filter(|(_, value)| value.is_missing())
        .map(|(name, _)| *name)
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(BridgeError::validation(action, &missing))
    }
}

/// Numeric boolean expected by older helper builds
pub fn bool_flag(value: bool) -> u8 {
    u8::from(value)
}

/// Every façade, sharing one broker
#[derive(Clone)]
pub struct PrivateApi {
    pub message: MessageActions,
    pub chat: ChatActions,
    pub handle: HandleActions,
    pub attachment: AttachmentActions,
    pub cloud: CloudActions,
    pub facetime: FaceTimeActions,
}

impl PrivateApi {
    pub fn new(broker: PrivateApiBroker) -> Self {
        Self {
            message: MessageActions::new(broker.clone()),
            chat: ChatActions::new(broker.clone()),
            handle: HandleActions::new(broker.clone()),
            attachment: AttachmentActions::new(broker.clone()),
            cloud: CloudActions::new(broker.clone()),
            facetime: FaceTimeActions::new(broker),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scripted helper answering every request over loopback

    use std::sync::Arc;
    use std::time::Duration;

    use pa_core::{BridgeConfig, ChannelNotifier, StaticHandleResolver};
    use serde_json::{Value, json};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;

    use crate::broker::{Collaborators, PrivateApiBroker};

    pub type Reply = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

    pub async fn broker() -> PrivateApiBroker {
        let broker = PrivateApiBroker::new(
            BridgeConfig {
                base_port: 0,
                write_delay_ms: 0,
                transaction_timeout_secs: 5,
                ..BridgeConfig::default()
            },
            Collaborators {
                notifier: Arc::new(ChannelNotifier::new(8)),
                resolver: Arc::new(StaticHandleResolver::new()),
            },
            None,
        );
        broker.start().await.unwrap();
        broker
    }

    /// Connect a helper that answers transactional requests with `reply`
    /// and forwards every request it sees
    pub async fn helper(broker: &PrivateApiBroker, reply: Reply) -> mpsc::UnboundedReceiver<Value> {
        let stream = TcpStream::connect(broker.local_addr().unwrap()).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let request: Value = serde_json::from_str(&line).unwrap();
                if let Some(id) = request["transactionId"].as_str() {
                    let response = json!({"transactionId": id, "data": reply(&request)});
                    let line = format!("{}\n", response);
                    if writer.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                }
                if tx.send(request).is_err() {
                    break;
                }
            }
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.connections().live_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        rx
    }

    /// Helper echoing each request's action and data
    pub async fn echo_helper(broker: &PrivateApiBroker) -> mpsc::UnboundedReceiver<Value> {
        helper(
            broker,
            Arc::new(|request: &Value| json!({"action": request["action"], "data": request["data"]})),
        )
        .await
    }
}
