/// Message router: turns each inbound message event into store updates
///
/// The active conversation is read once, when the event is routed. An event for the
/// open conversation lands in its log; any other event only touches the inbox.
use crate::inbox::InboxStore;
use crate::message_store::MessageStore;
use crate::tracker::ActiveConversation;
use crate::types::{ClientRef, InboundMessage, Message, UserId};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Appended to the open conversation
    Appended,
    /// Matched and confirmed one of our pending sends
    Confirmed,
    /// Inbox updated only; `unread` says whether the badge moved
    Background { unread: bool },
    /// Already seen; nothing changed
    Duplicate,
}

/// How many recent event ids are remembered for duplicate detection
const SEEN_CAPACITY: usize = 4096;

/// Bounded set of recently routed ids; the oldest id is forgotten first.
#[derive(Default)]
struct SeenIds {
    ids: HashSet<i64>,
    order: VecDeque<i64>,
}

impl SeenIds {
    fn insert(&mut self, id: i64) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > SEEN_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }

    fn clear(&mut self) {
        self.ids.clear();
        self.order.clear();
    }
}

#[derive(Clone)]
pub struct MessageRouter {
    self_id: UserId,
    tracker: ActiveConversation,
    messages: MessageStore,
    inbox: InboxStore,
    echo_window: Duration,
    seen: Arc<Mutex<SeenIds>>,
}

impl MessageRouter {
    pub fn new(
        self_id: UserId,
        tracker: ActiveConversation,
        messages: MessageStore,
        inbox: InboxStore,
        echo_window: Duration,
    ) -> Self {
        Self {
            self_id,
            tracker,
            messages,
            inbox,
            echo_window,
            seen: Arc::new(Mutex::new(SeenIds::default())),
        }
    }

    pub fn route(&self, event: &InboundMessage) -> RouteOutcome {
        if !self.seen.lock().insert(event.id) {
            debug!("Duplicate message event {}", event.id);
            return RouteOutcome::Duplicate;
        }

        let counterpart = event.counterpart(self.self_id);
        let from_self = event.sender.id == self.self_id;
        let active = self.tracker.is_active(counterpart.id);

        let outcome = if from_self && self.reconcile(counterpart.id, event) {
            RouteOutcome::Confirmed
        } else if active {
            if !self.messages.insert(counterpart.id, Message::from(event)) {
                return RouteOutcome::Duplicate;
            }
            RouteOutcome::Appended
        } else {
            RouteOutcome::Background {
                unread: !from_self,
            }
        };

        let unread = matches!(outcome, RouteOutcome::Background { unread: true });
        self.inbox
            .record_activity(counterpart, &event.content, event.timestamp, unread);
        debug!("Routed message {} from {}: {:?}", event.id, event.sender.id, outcome);
        outcome
    }

    /// Decode and route a raw topic payload. Malformed payloads are dropped.
    pub fn route_raw(&self, body: &str) -> Option<RouteOutcome> {
        match serde_json::from_str::<InboundMessage>(body) {
            Ok(event) => Some(self.route(&event)),
            Err(e) => {
                warn!("Dropping malformed message event: {}", e);
                None
            }
        }
    }

    /// Match an echo of our own send to its pending entry: by client ref when the
    /// server returned one, otherwise by content within the echo window.
    fn reconcile(&self, peer: UserId, event: &InboundMessage) -> bool {
        let by_ref: Option<ClientRef> = event
            .client_ref
            .filter(|r| self.messages.get(peer, *r).is_some_and(|m| m.is_pending()));
        let client_ref = by_ref.or_else(|| {
            self.messages.find_echo_candidate(
                peer,
                event.sender.id,
                event.receiver.id,
                &event.content,
                event.timestamp,
                self.echo_window,
            )
        });
        match client_ref {
            Some(client_ref) => self.messages.confirm(peer, client_ref, Message::from(event)),
            None => false,
        }
    }

    /// Forget seen event ids
    pub fn reset(&self) {
        self.seen.lock().clear();
    }
}
