/// Session wiring: identity, the shared push channel and every store, started on
/// login and torn down on logout
use crate::api::ChatApi;
use crate::channel::{ConnectionStatus, LiveChannel, SubscriptionId, Transport};
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::inbox::InboxStore;
use crate::message_store::MessageStore;
use crate::notifications::{notification_text, NotificationCenter};
use crate::poller::UnreadPoller;
use crate::router::{MessageRouter, RouteOutcome};
use crate::sender::OptimisticSender;
use crate::tracker::{ActiveConversation, Focus};
use crate::types::{ClientRef, ConversationSummary, InboundMessage, Message, UserId, UserRef};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What a transport needs to authenticate a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub user_id: UserId,
}

#[derive(Debug, Default)]
struct Identity {
    token: Option<String>,
    user: Option<UserRef>,
}

/// Token and current user, filled in by whatever performed the login
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    inner: Arc<RwLock<Identity>>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a token, and the user when it is already known
    pub fn login(&self, token: impl Into<String>, user: Option<UserRef>) {
        let mut identity = self.inner.write();
        identity.token = Some(token.into());
        identity.user = user;
    }

    pub fn logout(&self) {
        let mut identity = self.inner.write();
        identity.token = None;
        identity.user = None;
    }

    pub fn set_user(&self, user: UserRef) {
        self.inner.write().user = Some(user);
    }

    pub fn token(&self) -> Option<String> {
        self.inner.read().token.clone()
    }

    pub fn user(&self) -> Option<UserRef> {
        self.inner.read().user.clone()
    }

    pub fn credentials(&self) -> Option<Credentials> {
        let identity = self.inner.read();
        Some(Credentials {
            token: identity.token.clone()?,
            user_id: identity.user.as_ref()?.id,
        })
    }

    pub fn is_logged_in(&self) -> bool {
        self.inner.read().token.is_some()
    }
}

/// Parts that exist only while the session is running
struct Running {
    user: UserRef,
    router: MessageRouter,
    sender: OptimisticSender,
    subscriptions: Vec<SubscriptionId>,
}

/// One logged-in session. Clones share everything.
#[derive(Clone)]
pub struct ChatSession {
    config: Arc<Config>,
    context: SessionContext,
    api: Arc<dyn ChatApi>,
    channel: LiveChannel,
    tracker: ActiveConversation,
    messages: MessageStore,
    inbox: InboxStore,
    notifications: NotificationCenter,
    poller: UnreadPoller,
    running: Arc<Mutex<Option<Running>>>,
    start_gate: Arc<tokio::sync::Mutex<()>>,
}

impl ChatSession {
    pub fn new(
        config: Config,
        context: SessionContext,
        transport: Arc<dyn Transport>,
        api: Arc<dyn ChatApi>,
    ) -> Self {
        let channel = LiveChannel::new(transport, config.connect_timeout, config.reconnect.clone());
        let inbox = InboxStore::new();
        let poller = UnreadPoller::new(api.clone(), inbox.clone(), config.poll_interval);
        let notifications = NotificationCenter::new(config.notification_ttl);
        Self {
            config: Arc::new(config),
            context,
            api,
            channel,
            tracker: ActiveConversation::new(),
            messages: MessageStore::new(),
            inbox,
            notifications,
            poller,
            running: Arc::new(Mutex::new(None)),
            start_gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Bring the session up: resolve the user, connect, subscribe, start polling and load
    /// the inbox. Calling it again while running returns the current user.
    pub async fn start(&self) -> Result<UserRef> {
        let _gate = self.start_gate.lock().await;
        if let Some(running) = self.running.lock().as_ref() {
            return Ok(running.user.clone());
        }

        let token = self.context.token().ok_or(SyncError::NotAuthenticated)?;
        let user = match self.context.user() {
            Some(user) => user,
            None => {
                let me = self.api.fetch_me().await?;
                if !self.context.is_logged_in() {
                    return Err(SyncError::NotAuthenticated);
                }
                self.context.set_user(me.clone());
                me
            }
        };
        let credentials = Credentials {
            token,
            user_id: user.id,
        };
        self.channel.connect(&credentials).await?;

        let router = MessageRouter::new(
            user.id,
            self.tracker.clone(),
            self.messages.clone(),
            self.inbox.clone(),
            self.config.echo_match_window,
        );
        let sender = OptimisticSender::new(
            user.id,
            self.channel.clone(),
            self.api.clone(),
            self.messages.clone(),
            self.inbox.clone(),
            self.config.send_destination.clone(),
            self.config.send_timeout,
            self.config.http_fallback,
        );

        let subscriptions = vec![
            self.subscribe_messages(router.clone(), user.id),
            self.subscribe_notifications(),
        ];
        self.poller.start();

        *self.running.lock() = Some(Running {
            user: user.clone(),
            router,
            sender,
            subscriptions,
        });
        info!("Session started for {} ({})", user.name, user.id);

        if let Err(e) = self.refresh_inbox().await {
            warn!("Initial inbox load failed: {}", e);
        }
        Ok(user)
    }

    fn subscribe_messages(&self, router: MessageRouter, self_id: UserId) -> SubscriptionId {
        let api = self.api.clone();
        self.channel
            .subscribe_json(&self.config.message_topic, move |event: InboundMessage| {
                let outcome = router.route(&event);
                // A message shown in the open conversation is read on the server too.
                if outcome == RouteOutcome::Appended && event.sender.id != self_id {
                    let api = api.clone();
                    let peer = event.sender.id;
                    tokio::spawn(async move {
                        if let Err(e) = api.mark_read(peer).await {
                            debug!("mark-read for {} failed: {}", peer, e);
                        }
                    });
                }
            })
    }

    fn subscribe_notifications(&self) -> SubscriptionId {
        let notifications = self.notifications.clone();
        self.channel
            .subscribe(&self.config.notification_topic, move |body| {
                notifications.push(notification_text(body));
            })
    }

    /// Make `peer` the open conversation (or close it with `None`), clear its badge and
    /// load its history. A load that finishes after the user moved on is discarded.
    pub fn open_conversation(&self, peer: Option<UserId>) -> Option<JoinHandle<()>> {
        let focus = self.tracker.set(peer);
        let peer = peer?;

        if self.inbox.mark_read(peer) > 0 {
            debug!("Cleared unread for {}", peer);
        }
        let api = self.api.clone();
        tokio::spawn(async move {
            if let Err(e) = api.mark_read(peer).await {
                debug!("mark-read for {} failed: {}", peer, e);
            }
        });

        let session = self.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = session.load_history(focus).await {
                warn!("History load for {} failed: {}", peer, e);
            }
        }))
    }

    /// Fetch the history for `focus`. Returns false when the result was discarded
    /// because the open conversation changed meanwhile.
    pub async fn load_history(&self, focus: Focus) -> Result<bool> {
        let Some(peer) = focus.peer else {
            return Ok(false);
        };
        let history = self.api.fetch_history(peer).await?;
        if !self.tracker.is_current(&focus) {
            debug!("Discarding stale history for {}", peer);
            return Ok(false);
        }
        let count = history.len();
        self.messages
            .replace_history(peer, history.iter().map(Message::from).collect());
        debug!("Loaded {} messages with {}", count, peer);
        Ok(true)
    }

    /// Reload the inbox from the server, merging with what is known locally
    pub async fn refresh_inbox(&self) -> Result<usize> {
        let snapshot = self.api.fetch_inbox().await?;
        if !self.is_running() {
            return Ok(0);
        }
        let count = snapshot.len();
        self.inbox.replace_all(snapshot);
        Ok(count)
    }

    pub fn send(&self, peer: UserId, content: &str) -> Result<ClientRef> {
        let sender = self.running_sender()?;
        sender.submit(peer, content)
    }

    pub fn retry(&self, peer: UserId, client_ref: ClientRef) -> Result<()> {
        let sender = self.running_sender()?;
        sender.retry(peer, client_ref)
    }

    fn running_sender(&self) -> Result<OptimisticSender> {
        self.running
            .lock()
            .as_ref()
            .map(|r| r.sender.clone())
            .ok_or(SyncError::NotAuthenticated)
    }

    /// Stop everything the session started and clear its state. Subscriptions go first,
    /// then the poller, then the connection. Safe to call repeatedly.
    pub fn teardown(&self) -> bool {
        let running = self.running.lock().take();
        if let Some(running) = &running {
            for id in &running.subscriptions {
                self.channel.unsubscribe(*id);
            }
            running.router.reset();
        }
        self.poller.stop();
        self.channel.disconnect();

        self.notifications.clear();
        self.tracker.set(None);
        self.inbox.remove_all();
        self.messages.clear();
        if running.is_some() {
            info!("Session torn down");
        }
        running.is_some()
    }

    pub fn logout(&self) {
        self.teardown();
        self.context.logout();
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn user(&self) -> Option<UserRef> {
        self.running.lock().as_ref().map(|r| r.user.clone())
    }

    pub fn active_conversation(&self) -> Option<UserId> {
        self.tracker.get()
    }

    pub fn messages(&self, peer: UserId) -> Vec<Message> {
        self.messages.messages(peer)
    }

    pub fn inbox(&self) -> Vec<ConversationSummary> {
        self.inbox.entries()
    }

    pub fn total_unread(&self) -> u64 {
        self.inbox.total_unread()
    }

    pub fn notifications(&self) -> &NotificationCenter {
        &self.notifications
    }

    /// The shared push connection, for surfaces that want their own subscriptions
    pub fn channel(&self) -> &LiveChannel {
        &self.channel
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.channel.status()
    }

    pub fn poller(&self) -> &UnreadPoller {
        &self.poller
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
