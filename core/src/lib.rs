/// chatsync - live conversation synchronization engine
///
/// Keeps a client's message list, inbox and unread badge in step with a chat server
/// over one shared push connection, with REST for history, inbox and polling.

pub mod api;
pub mod channel;
pub mod config;
pub mod console;
pub mod error;
pub mod inbox;
pub mod message_store;
pub mod notifications;
pub mod poller;
pub mod router;
pub mod sender;
pub mod session;
pub mod tracker;
pub mod types;

pub use api::{ChatApi, HttpChatApi};
pub use channel::{ConnectionStatus, LiveChannel, MemoryServer, MemoryTransport, WsTransport};
pub use config::Config;
pub use error::{Result, SyncError};
pub use session::{ChatSession, Credentials, SessionContext};
pub use types::{ConversationSummary, DeliveryState, InboundMessage, Message, MessageId, UserId, UserRef};
