//! pa-bridge: the private API helper bridge
//!
//! A loopback socket broker between the server and the helper injected
//! into the messaging application. Action façades turn calls into
//! newline-delimited JSON requests correlated by transaction id; helper
//! events are routed to typed handlers.

pub mod actions;
pub mod broker;
pub mod connection;
pub mod error;
pub mod events;
pub mod mode;
pub mod protocol;
pub mod session;
pub mod transaction;

pub use actions::{
    AttachmentActions, ChatActions, CloudActions, FaceTimeActions, HandleActions, MessageActions,
    MultipartMessage, OutgoingMessage, PrivateApi, bool_flag, throw_for_missing_fields,
};
pub use broker::{BrokerState, BrokerStatus, Collaborators, PrivateApiBroker, default_handlers};
pub use connection::{ClientConnection, ConnectionInfo, ConnectionRegistry};
pub use error::{BridgeError, Result};
pub use events::{EventHandler, EventHandlerSet, HelperEvent, IncomingEvent};
pub use mode::{AttachMode, BundleMode, InstallStatus, ProcessInjectionMode};
pub use session::{CallSession, FaceTimeSessions};
pub use transaction::{
    PendingTransaction, Transaction, TransactionKind, TransactionRegistry, TransactionState,
};
