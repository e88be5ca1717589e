/// Shared types for the sync engine: wire payloads and the in-memory model
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use uuid::Uuid;

/// Server-side user id
pub type UserId = i64;

/// Client-generated idempotency key round-tripped through send and echo
pub type ClientRef = Uuid;

/// A user as the server describes it inside message events
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserRef {
    pub id: UserId,
    #[serde(default)]
    pub name: String,
}

/// Message identity: server-assigned once persisted, local while pending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MessageId {
    Server(i64),
    Local(Uuid),
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Server(id) => write!(f, "{}", id),
            MessageId::Local(id) => write!(f, "local-{}", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Shown locally, not yet confirmed by the server
    Optimistic,
    /// Persisted by the server (terminal)
    Confirmed,
    /// Transmit rejected or timed out; kept visible for retry
    Failed,
}

/// One entry of a conversation log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub delivery_state: DeliveryState,
    pub client_ref: Option<ClientRef>,
}

impl Message {
    /// A locally originated message awaiting confirmation
    pub fn optimistic(
        client_ref: ClientRef,
        sender_id: UserId,
        receiver_id: UserId,
        content: String,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::Local(client_ref),
            sender_id,
            receiver_id,
            content,
            timestamp,
            delivery_state: DeliveryState::Optimistic,
            client_ref: Some(client_ref),
        }
    }

    /// The other party of this message from `self_id`'s point of view
    pub fn counterpart(&self, self_id: UserId) -> UserId {
        if self.sender_id != self_id {
            self.sender_id
        } else {
            self.receiver_id
        }
    }

    pub fn is_pending(&self) -> bool {
        self.delivery_state != DeliveryState::Confirmed
    }
}

impl From<&InboundMessage> for Message {
    fn from(event: &InboundMessage) -> Self {
        Self {
            id: MessageId::Server(event.id),
            sender_id: event.sender.id,
            receiver_id: event.receiver.id,
            content: event.content.clone(),
            timestamp: event.timestamp,
            delivery_state: DeliveryState::Confirmed,
            client_ref: event.client_ref,
        }
    }
}

/// Message event as delivered on the message topic and by the history endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub id: i64,
    pub sender: UserRef,
    pub receiver: UserRef,
    pub content: String,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<ClientRef>,
}

impl InboundMessage {
    /// The party that is not `self_id`
    pub fn counterpart(&self, self_id: UserId) -> &UserRef {
        if self.sender.id != self_id {
            &self.sender
        } else {
            &self.receiver
        }
    }
}

/// Outbound send frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundFrame {
    pub receiver_id: UserId,
    pub content: String,
    pub client_ref: ClientRef,
}

/// Summary of one conversation thread (inbox row)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub peer_id: UserId,
    #[serde(default)]
    pub peer_name: String,
    #[serde(default)]
    pub last_preview: String,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub unread_count: u32,
}

impl ConversationSummary {
    pub fn new(peer: &UserRef) -> Self {
        Self {
            peer_id: peer.id,
            peer_name: peer.name.clone(),
            last_preview: String::new(),
            updated_at: DateTime::<Utc>::default(),
            unread_count: 0,
        }
    }
}

/// Inbox rows come either as full summaries or as bare users ordered by recency
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InboxEntry {
    Summary(ConversationSummary),
    User(UserRef),
}

impl From<InboxEntry> for ConversationSummary {
    fn from(entry: InboxEntry) -> Self {
        match entry {
            InboxEntry::Summary(summary) => summary,
            InboxEntry::User(user) => ConversationSummary::new(&user),
        }
    }
}

/// Parse ISO-8601 with an offset, or a naive local timestamp taken as UTC
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", raw)))
}
