//! Shared fixtures: a scripted backend and a session wired to an in-memory push server
#![allow(dead_code)]

use async_trait::async_trait;
use chatsync_core::api::ChatApi;
use chatsync_core::types::{ConversationSummary, InboundMessage, OutboundFrame, UserId, UserRef};
use chatsync_core::{ChatSession, Config, MemoryServer, MemoryTransport, Result, SessionContext, SyncError};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

pub const ME: UserId = 1;
pub const TOKEN: &str = "session-token";

pub fn user(id: UserId) -> UserRef {
    UserRef {
        id,
        name: format!("user{}", id),
    }
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

pub fn event_at(id: i64, from: UserId, to: UserId, content: &str, timestamp: DateTime<Utc>) -> InboundMessage {
    InboundMessage {
        id,
        sender: user(from),
        receiver: user(to),
        content: content.to_string(),
        timestamp,
        client_ref: None,
    }
}

pub fn event(id: i64, from: UserId, to: UserId, content: &str, secs: i64) -> InboundMessage {
    event_at(id, from, to, content, at(secs))
}

/// Let spawned tasks run
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

/// Backend double. History and unread answers can be held back until released.
#[derive(Default)]
pub struct FakeApi {
    pub me: Mutex<Option<UserRef>>,
    pub histories: Mutex<HashMap<UserId, Vec<InboundMessage>>>,
    history_gates: Mutex<HashMap<UserId, Arc<Notify>>>,
    pub inbox: Mutex<Vec<ConversationSummary>>,
    pub unread: AtomicU64,
    unread_gate: Mutex<Option<Arc<Notify>>>,
    pub fail_sends: AtomicBool,
    pub fail_history: AtomicBool,
    pub fail_inbox: AtomicBool,
    pub sent: Mutex<Vec<OutboundFrame>>,
    pub marked_read: Mutex<Vec<UserId>>,
    pub unread_calls: AtomicU64,
    next_id: AtomicI64,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        let api = Self::default();
        *api.me.lock() = Some(user(ME));
        api.next_id.store(1000, Ordering::SeqCst);
        Arc::new(api)
    }

    pub fn set_history(&self, peer: UserId, history: Vec<InboundMessage>) {
        self.histories.lock().insert(peer, history);
    }

    /// Hold history requests for `peer` until the returned gate is notified
    pub fn gate_history(&self, peer: UserId) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.history_gates.lock().insert(peer, gate.clone());
        gate
    }

    pub fn gate_unread(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.unread_gate.lock() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn fetch_me(&self) -> Result<UserRef> {
        self.me.lock().clone().ok_or(SyncError::NotAuthenticated)
    }

    async fn fetch_inbox(&self) -> Result<Vec<ConversationSummary>> {
        if self.fail_inbox.load(Ordering::SeqCst) {
            return Err(SyncError::Api("503 Service Unavailable".to_string()));
        }
        Ok(self.inbox.lock().clone())
    }

    async fn fetch_history(&self, peer: UserId) -> Result<Vec<InboundMessage>> {
        let gate = self.history_gates.lock().get(&peer).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(SyncError::Api("503 Service Unavailable".to_string()));
        }
        Ok(self.histories.lock().get(&peer).cloned().unwrap_or_default())
    }

    async fn fetch_unread_count(&self) -> Result<u64> {
        self.unread_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.unread_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(self.unread.load(Ordering::SeqCst))
    }

    async fn send_message(&self, frame: &OutboundFrame) -> Result<InboundMessage> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(SyncError::Api("500 Internal Server Error".to_string()));
        }
        self.sent.lock().push(frame.clone());
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut stored = event_at(id, ME, frame.receiver_id, &frame.content, Utc::now());
        stored.client_ref = Some(frame.client_ref);
        Ok(stored)
    }

    async fn mark_read(&self, peer: UserId) -> Result<()> {
        self.marked_read.lock().push(peer);
        Ok(())
    }
}

pub struct Harness {
    pub session: ChatSession,
    pub server: MemoryServer,
    pub api: Arc<FakeApi>,
    pub context: SessionContext,
}

impl Harness {
    pub fn with_config(config: Config) -> Self {
        let (transport, server) = MemoryTransport::pair();
        let api = FakeApi::new();
        let context = SessionContext::new();
        context.login(TOKEN, Some(user(ME)));
        let session = ChatSession::new(config, context.clone(), Arc::new(transport), api.clone());
        Self {
            session,
            server,
            api,
            context,
        }
    }

    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub async fn started() -> Self {
        let harness = Self::new();
        harness.session.start().await.unwrap();
        settle().await;
        harness
    }

    pub fn push(&self, event: &InboundMessage) -> bool {
        let topic = self.session.config().message_topic.clone();
        self.server.push_json(&topic, event)
    }
}
