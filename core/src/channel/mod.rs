/// Live channel client: one persistent push connection per session
///
/// Subscriptions are reference counted per topic. The first handler for a topic puts one
/// SUBSCRIBE on the wire, the last `unsubscribe` takes it off again, so any number of
/// surfaces can share the connection.
pub mod memory;
pub mod stomp;
pub mod ws;

pub use memory::{MemoryServer, MemoryTransport};
pub use ws::WsTransport;

use crate::config::ReconnectPolicy;
use crate::error::{Result, SyncError};
use crate::session::Credentials;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Frames the engine hands to a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Subscribe { id: String, topic: String },
    Unsubscribe { id: String },
    Send { destination: String, body: String },
    Disconnect,
}

/// Frames a transport hands back to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Event { topic: String, body: String },
    /// The server rejected the connection; the link is closed after this
    Error { message: String },
}

/// An open link. Dropping `inbound`'s sender side signals connection loss.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<ClientFrame>,
    pub inbound: mpsc::UnboundedReceiver<ServerFrame>,
}

/// Opens push links. The handshake must be complete when `open` returns.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, credentials: &Credentials) -> Result<Link>;
}

/// Identity of one open connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(u64);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Connection indicator published on a watch channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected(ConnectionHandle),
    Reconnecting { attempt: u32 },
    Failed(String),
}

pub type Handler = Arc<dyn Fn(&str) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&SyncError) + Send + Sync>;

struct TopicEntry {
    wire_id: String,
    handlers: Vec<(SubscriptionId, Handler)>,
}

struct OpenLink {
    handle: ConnectionHandle,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    reader: JoinHandle<()>,
}

#[derive(Default)]
struct ChannelState {
    link: Option<OpenLink>,
    topics: HashMap<String, TopicEntry>,
    credentials: Option<Credentials>,
    supervisor: Option<JoinHandle<()>>,
    error_handler: Option<ErrorHandler>,
    /// Bumped by `disconnect` so handshakes that finish afterwards are dropped
    epoch: u64,
}

/// Session-scoped push connection. Clones share the connection.
#[derive(Clone)]
pub struct LiveChannel {
    transport: Arc<dyn Transport>,
    connect_timeout: Duration,
    reconnect: ReconnectPolicy,
    state: Arc<Mutex<ChannelState>>,
    connect_gate: Arc<tokio::sync::Mutex<()>>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    ids: Arc<AtomicU64>,
}

impl LiveChannel {
    pub fn new(
        transport: Arc<dyn Transport>,
        connect_timeout: Duration,
        reconnect: ReconnectPolicy,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            transport,
            connect_timeout,
            reconnect,
            state: Arc::new(Mutex::new(ChannelState::default())),
            connect_gate: Arc::new(tokio::sync::Mutex::new(())),
            status: Arc::new(status),
            ids: Arc::new(AtomicU64::new(0)),
        }
    }

    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }

    /// Open the connection, or return the existing handle when already connected
    pub async fn connect(&self, credentials: &Credentials) -> Result<ConnectionHandle> {
        let _gate = self.connect_gate.lock().await;
        if let Some(handle) = self.handle() {
            debug!("Already connected as {}", handle);
            return Ok(handle);
        }

        let epoch = {
            let mut state = self.state.lock();
            state.credentials = Some(credentials.clone());
            state.epoch
        };
        self.status.send_replace(ConnectionStatus::Connecting);

        match self.open_link(credentials, epoch).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.report_failure(&e);
                Err(e)
            }
        }
    }

    async fn open_link(&self, credentials: &Credentials, epoch: u64) -> Result<ConnectionHandle> {
        let Link { outbound, inbound } = timeout(self.connect_timeout, self.transport.open(credentials))
            .await
            .map_err(|_| SyncError::Timeout("Push handshake timed out".to_string()))??;

        let handle = ConnectionHandle(self.next_id());
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.epoch != epoch {
            let _ = outbound.send(ClientFrame::Disconnect);
            return Err(SyncError::Connection(
                "Channel was disconnected during the handshake".to_string(),
            ));
        }

        for (topic, entry) in &state.topics {
            let _ = outbound.send(ClientFrame::Subscribe {
                id: entry.wire_id.clone(),
                topic: topic.clone(),
            });
        }
        let reader = tokio::spawn(self.clone().read_loop(handle, inbound));
        state.link = Some(OpenLink {
            handle,
            outbound,
            reader,
        });
        let topics = state.topics.len();
        drop(guard);

        self.status.send_replace(ConnectionStatus::Connected(handle));
        info!("Push channel connected ({}, {} topics)", handle, topics);
        Ok(handle)
    }

    async fn read_loop(self, handle: ConnectionHandle, mut inbound: mpsc::UnboundedReceiver<ServerFrame>) {
        while let Some(frame) = inbound.recv().await {
            match frame {
                ServerFrame::Event { topic, body } => {
                    self.dispatch(handle, &topic, &body);
                }
                ServerFrame::Error { message } => {
                    self.link_lost(handle, SyncError::Connection(format!("Server error: {}", message)));
                    return;
                }
            }
        }
        self.link_lost(handle, SyncError::Connection("Push connection closed".to_string()));
    }

    /// Invoke the handlers of `topic` if `handle` is still the live connection
    fn dispatch(&self, handle: ConnectionHandle, topic: &str, body: &str) -> usize {
        let handlers: Vec<Handler> = {
            let state = self.state.lock();
            if state.link.as_ref().map(|l| l.handle) != Some(handle) {
                return 0;
            }
            match state.topics.get(topic) {
                Some(entry) => entry.handlers.iter().map(|(_, h)| h.clone()).collect(),
                None => {
                    debug!("No handler for topic {}", topic);
                    return 0;
                }
            }
        };
        for handler in &handlers {
            handler(body);
        }
        handlers.len()
    }

    fn link_lost(&self, handle: ConnectionHandle, err: SyncError) {
        {
            let mut state = self.state.lock();
            if state.link.as_ref().map(|l| l.handle) != Some(handle) {
                return;
            }
            state.link = None;
        }
        self.report_failure(&err);
        if self.reconnect.is_enabled() {
            self.spawn_reconnect();
        }
    }

    fn report_failure(&self, err: &SyncError) {
        error!("Push channel failure: {}", err);
        self.status.send_replace(ConnectionStatus::Failed(err.to_string()));
        let handler = self.state.lock().error_handler.clone();
        if let Some(handler) = handler {
            handler(err);
        }
    }

    fn spawn_reconnect(&self) {
        let channel = self.clone();
        let task = tokio::spawn(async move { channel.reconnect_loop().await });
        if let Some(old) = self.state.lock().supervisor.replace(task) {
            old.abort();
        }
    }

    async fn reconnect_loop(self) {
        for attempt in 1..=self.reconnect.max_attempts {
            self.status.send_replace(ConnectionStatus::Reconnecting { attempt });
            sleep(self.reconnect.delay_for(attempt)).await;

            let _gate = self.connect_gate.lock().await;
            let (credentials, epoch) = {
                let state = self.state.lock();
                if state.link.is_some() {
                    return;
                }
                match state.credentials.clone() {
                    Some(c) => (c, state.epoch),
                    None => return,
                }
            };
            match self.open_link(&credentials, epoch).await {
                Ok(handle) => {
                    info!("Reconnected as {} after {} attempt(s)", handle, attempt);
                    return;
                }
                Err(e) => warn!("Reconnect attempt {} failed: {}", attempt, e),
            }
        }
        self.report_failure(&SyncError::Connection(format!(
            "Gave up after {} reconnect attempts",
            self.reconnect.max_attempts
        )));
    }

    /// Register `handler` for `topic`. Handlers run in arrival order per topic.
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id());
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let is_new = !state.topics.contains_key(topic);
        let entry = state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicEntry {
                wire_id: format!("sub-{}", id.0),
                handlers: Vec::new(),
            });
        entry.handlers.push((id, Arc::new(handler)));

        if is_new {
            if let Some(link) = &state.link {
                let _ = link.outbound.send(ClientFrame::Subscribe {
                    id: entry.wire_id.clone(),
                    topic: topic.to_string(),
                });
            }
            debug!("Subscribed to {}", topic);
        }
        id
    }

    /// Subscribe with a typed payload; malformed payloads are logged and skipped.
    pub fn subscribe_json<T, F>(&self, topic: &str, handler: F) -> SubscriptionId
    where
        T: DeserializeOwned,
        F: Fn(T) + Send + Sync + 'static,
    {
        let name = topic.to_string();
        self.subscribe(topic, move |body| match serde_json::from_str::<T>(body) {
            Ok(value) => handler(value),
            Err(e) => warn!("Dropping malformed payload on {}: {}", name, e),
        })
    }

    /// Remove one handler. The wire subscription goes when its last handler does.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(topic) = state
            .topics
            .iter()
            .find(|(_, e)| e.handlers.iter().any(|(h, _)| *h == id))
            .map(|(t, _)| t.clone())
        else {
            return false;
        };

        let now_empty = match state.topics.get_mut(&topic) {
            Some(entry) => {
                entry.handlers.retain(|(h, _)| *h != id);
                entry.handlers.is_empty()
            }
            None => false,
        };
        if now_empty {
            if let Some(entry) = state.topics.remove(&topic) {
                if let Some(link) = &state.link {
                    let _ = link.outbound.send(ClientFrame::Unsubscribe { id: entry.wire_id });
                }
            }
            debug!("Unsubscribed from {}", topic);
        }
        true
    }

    /// Fire-and-forget send. Fails with `NotConnected` instead of queueing.
    pub fn send<T: Serialize>(&self, destination: &str, payload: &T) -> Result<()> {
        let body = serde_json::to_string(payload)?;
        let state = self.state.lock();
        let link = state.link.as_ref().ok_or(SyncError::NotConnected)?;
        link.outbound
            .send(ClientFrame::Send {
                destination: destination.to_string(),
                body,
            })
            .map_err(|_| SyncError::NotConnected)
    }

    /// Close the connection and drop every handler. Returns false when there was
    /// nothing to close.
    pub fn disconnect(&self) -> bool {
        let (link, supervisor, wire_ids) = {
            let mut state = self.state.lock();
            state.epoch += 1;
            state.credentials = None;
            let wire_ids: Vec<String> = state.topics.drain().map(|(_, e)| e.wire_id).collect();
            (state.link.take(), state.supervisor.take(), wire_ids)
        };
        if let Some(supervisor) = supervisor {
            supervisor.abort();
        }
        self.status.send_replace(ConnectionStatus::Disconnected);

        let Some(link) = link else {
            return false;
        };
        for id in wire_ids {
            let _ = link.outbound.send(ClientFrame::Unsubscribe { id });
        }
        let _ = link.outbound.send(ClientFrame::Disconnect);
        link.reader.abort();
        info!("Push channel disconnected ({})", link.handle);
        true
    }

    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&SyncError) + Send + Sync + 'static,
    {
        self.state.lock().error_handler = Some(Arc::new(handler));
    }

    pub fn handle(&self) -> Option<ConnectionHandle> {
        self.state.lock().link.as_ref().map(|l| l.handle)
    }

    pub fn is_connected(&self) -> bool {
        self.handle().is_some()
    }

    /// Non-blocking connection indicator
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Number of local handlers registered for `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.state
            .lock()
            .topics
            .get(topic)
            .map(|e| e.handlers.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    fn creds() -> Credentials {
        Credentials {
            token: "t0k".to_string(),
            user_id: 1,
        }
    }

    fn channel(reconnect: ReconnectPolicy) -> (LiveChannel, MemoryServer) {
        let (transport, server) = MemoryTransport::pair();
        (
            LiveChannel::new(Arc::new(transport), Duration::from_secs(1), reconnect),
            server,
        )
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&str) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move |_: &str| {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (channel, server) = channel(ReconnectPolicy::disabled());
        let first = channel.connect(&creds()).await.unwrap();
        let second = channel.connect(&creds()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(server.connections_opened(), 1);
        assert_eq!(server.last_token().as_deref(), Some("t0k"));
        assert_eq!(*channel.status().borrow(), ConnectionStatus::Connected(first));
    }

    #[tokio::test]
    async fn test_one_wire_subscription_per_topic() {
        let (channel, server) = channel(ReconnectPolicy::disabled());
        channel.connect(&creds()).await.unwrap();

        let a = channel.subscribe("/user/queue/messages", |_| {});
        let b = channel.subscribe("/user/queue/messages", |_| {});
        assert_eq!(channel.subscriber_count("/user/queue/messages"), 2);

        assert!(channel.unsubscribe(a));
        assert!(!channel.unsubscribe(a));
        assert!(channel.unsubscribe(b));

        let frames = server.received();
        let subs = frames
            .iter()
            .filter(|f| matches!(f, ClientFrame::Subscribe { .. }))
            .count();
        let unsubs = frames
            .iter()
            .filter(|f| matches!(f, ClientFrame::Unsubscribe { .. }))
            .count();
        assert_eq!((subs, unsubs), (1, 1));
    }

    #[tokio::test]
    async fn test_events_reach_handlers_in_order() {
        let (channel, server) = channel(ReconnectPolicy::disabled());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        channel.subscribe("/topic/a", move |body| sink.lock().push(body.to_string()));
        channel.connect(&creds()).await.unwrap();

        server.push("/topic/a", "1");
        server.push("/topic/b", "ignored");
        server.push("/topic/a", "2");
        settle().await;

        assert_eq!(*seen.lock(), vec!["1".to_string(), "2".to_string()]);
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let (channel, server) = channel(ReconnectPolicy::disabled());
        assert!(matches!(
            channel.send("/app/chat", &"hi"),
            Err(SyncError::NotConnected)
        ));

        channel.connect(&creds()).await.unwrap();
        channel.send("/app/chat", &"hi").unwrap();
        assert!(server.received().contains(&ClientFrame::Send {
            destination: "/app/chat".to_string(),
            body: "\"hi\"".to_string(),
        }));
    }

    #[tokio::test]
    async fn test_disconnect_drops_handlers() {
        let (channel, server) = channel(ReconnectPolicy::disabled());
        let (count, handler) = counter();
        channel.subscribe("/topic/a", handler);
        channel.connect(&creds()).await.unwrap();

        assert!(channel.disconnect());
        assert!(!channel.disconnect());
        server.push("/topic/a", "late");
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(channel.subscriber_count("/topic/a"), 0);
        assert!(server.received().contains(&ClientFrame::Disconnect));
        assert!(channel.send("/app/chat", &"x").is_err());
    }

    #[tokio::test]
    async fn test_refused_connection_reports_error() {
        let (channel, server) = channel(ReconnectPolicy::disabled());
        let (count, _) = counter();
        let c = count.clone();
        channel.set_error_handler(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        server.refuse(Some("bad token"));

        assert!(channel.connect(&creds()).await.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(matches!(*channel.status().borrow(), ConnectionStatus::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resubscribes_topics() {
        let policy = ReconnectPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };
        let (channel, server) = channel(policy);
        let (count, handler) = counter();
        channel.subscribe("/topic/a", handler);
        let first = channel.connect(&creds()).await.unwrap();

        server.drop_link();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let second = channel.handle().expect("reconnected");
        assert_ne!(first, second);
        assert_eq!(server.connections_opened(), 2);
        assert!(server
            .received()
            .iter()
            .any(|f| matches!(f, ClientFrame::Subscribe { topic, .. } if topic == "/topic/a")));

        server.push("/topic/a", "after");
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    fn recording_errors(channel: &LiveChannel) -> Arc<Mutex<Vec<String>>> {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        channel.set_error_handler(move |e| sink.lock().push(e.to_string()));
        errors
    }

    #[tokio::test]
    async fn test_server_error_frame_fails_the_link() {
        let (channel, server) = channel(ReconnectPolicy::disabled());
        let errors = recording_errors(&channel);
        channel.connect(&creds()).await.unwrap();

        assert!(server.fail("session expired"));
        settle().await;
        server.drop_link();
        settle().await;

        assert!(!channel.is_connected());
        assert_eq!(errors.lock().len(), 1);
        assert!(errors.lock()[0].contains("session expired"));
        match &*channel.status().borrow() {
            ConnectionStatus::Failed(reason) => assert!(reason.contains("session expired")),
            other => panic!("unexpected status: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lost_link_is_reported_once() {
        let (channel, server) = channel(ReconnectPolicy::disabled());
        let errors = recording_errors(&channel);
        channel.connect(&creds()).await.unwrap();

        server.drop_link();
        settle().await;

        assert_eq!(errors.lock().len(), 1);
        assert!(errors.lock()[0].contains("closed"));
        assert!(matches!(*channel.status().borrow(), ConnectionStatus::Failed(_)));
        assert!(matches!(
            channel.send("/app/chat", &"hi"),
            Err(SyncError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_no_reconnect_by_default() {
        let (channel, server) = channel(ReconnectPolicy::disabled());
        channel.connect(&creds()).await.unwrap();
        server.drop_link();
        settle().await;

        assert!(!channel.is_connected());
        assert_eq!(server.connections_opened(), 1);
    }
}
