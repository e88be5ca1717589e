/// Message store: per-conversation logs kept in memory for the session
/// Each log is sorted ascending by timestamp and never holds two entries with the same id.
use crate::types::{ClientRef, DeliveryState, Message, MessageId, UserId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Default)]
pub struct MessageStore {
    logs: Arc<RwLock<HashMap<UserId, Vec<Message>>>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert by timestamp. Returns false when a message with the same id is already present.
    pub fn insert(&self, peer: UserId, msg: Message) -> bool {
        let mut logs = self.logs.write();
        let log = logs.entry(peer).or_default();
        insert_sorted(log, msg)
    }

    /// Replace a conversation with the server's history. Local entries the history does
    /// not cover (pending sends, events pushed while it was in flight) are kept.
    pub fn replace_history(&self, peer: UserId, history: Vec<Message>) {
        let mut logs = self.logs.write();
        let previous = logs.remove(&peer).unwrap_or_default();

        let mut log: Vec<Message> = Vec::with_capacity(history.len() + previous.len());
        for msg in history {
            insert_sorted(&mut log, msg);
        }
        for msg in previous {
            let known = msg
                .client_ref
                .is_some_and(|r| log.iter().any(|m| m.client_ref == Some(r)));
            if !known {
                insert_sorted(&mut log, msg);
            }
        }
        logs.insert(peer, log);
    }

    /// Confirm a pending message with the server's copy: it takes the server id and
    /// timestamp and is repositioned. If the server copy is already in the log the
    /// pending entry is dropped instead of duplicated.
    pub fn confirm(&self, peer: UserId, client_ref: ClientRef, server: Message) -> bool {
        let mut logs = self.logs.write();
        let Some(log) = logs.get_mut(&peer) else {
            return false;
        };
        let Some(pos) = log
            .iter()
            .position(|m| m.client_ref == Some(client_ref) && m.is_pending())
        else {
            return false;
        };

        let pending = log.remove(pos);
        if log.iter().any(|m| m.id == server.id) {
            return true;
        }
        let confirmed = Message {
            id: server.id,
            timestamp: server.timestamp,
            delivery_state: DeliveryState::Confirmed,
            client_ref: Some(client_ref),
            ..pending
        };
        insert_sorted(log, confirmed);
        true
    }

    /// Oldest unconfirmed message from `sender` to `receiver` with the same content,
    /// sent within `window` of `timestamp`. Failed messages qualify: a late echo means
    /// the server stored them after all.
    pub fn find_echo_candidate(
        &self,
        peer: UserId,
        sender: UserId,
        receiver: UserId,
        content: &str,
        timestamp: DateTime<Utc>,
        window: Duration,
    ) -> Option<ClientRef> {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        let logs = self.logs.read();
        logs.get(&peer)?
            .iter()
            .filter(|m| m.is_pending())
            .filter(|m| m.sender_id == sender && m.receiver_id == receiver && m.content == content)
            .find(|m| (m.timestamp - timestamp).abs() <= window)
            .and_then(|m| m.client_ref)
    }

    /// Move a message from `from` to `to`. Returns false when it is not in state `from`.
    pub fn transition(
        &self,
        peer: UserId,
        client_ref: ClientRef,
        from: DeliveryState,
        to: DeliveryState,
    ) -> bool {
        let mut logs = self.logs.write();
        let Some(msg) = logs
            .get_mut(&peer)
            .and_then(|log| log.iter_mut().find(|m| m.client_ref == Some(client_ref)))
        else {
            return false;
        };
        if msg.delivery_state != from {
            return false;
        }
        msg.delivery_state = to;
        true
    }

    pub fn get(&self, peer: UserId, client_ref: ClientRef) -> Option<Message> {
        let logs = self.logs.read();
        logs.get(&peer)?
            .iter()
            .find(|m| m.client_ref == Some(client_ref))
            .cloned()
    }

    /// Snapshot of one conversation
    pub fn messages(&self, peer: UserId) -> Vec<Message> {
        let logs = self.logs.read();
        logs.get(&peer).cloned().unwrap_or_default()
    }

    /// Get message count for one conversation
    pub fn count(&self, peer: UserId) -> usize {
        let logs = self.logs.read();
        logs.get(&peer).map(Vec::len).unwrap_or(0)
    }

    pub fn clear(&self) {
        self.logs.write().clear();
    }
}

fn insert_sorted(log: &mut Vec<Message>, msg: Message) -> bool {
    if log.iter().any(|m| m.id == msg.id) {
        return false;
    }
    let pos = log.partition_point(|m| m.timestamp <= msg.timestamp);
    log.insert(pos, msg);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn server(id: i64, from: UserId, to: UserId, content: &str, secs: i64) -> Message {
        Message {
            id: MessageId::Server(id),
            sender_id: from,
            receiver_id: to,
            content: content.to_string(),
            timestamp: at(secs),
            delivery_state: DeliveryState::Confirmed,
            client_ref: None,
        }
    }

    fn ids(store: &MessageStore, peer: UserId) -> Vec<MessageId> {
        store.messages(peer).into_iter().map(|m| m.id).collect()
    }

    #[test]
    fn test_out_of_order_and_duplicate_inserts() {
        let store = MessageStore::new();
        assert!(store.insert(7, server(3, 7, 1, "c", 30)));
        assert!(store.insert(7, server(1, 7, 1, "a", 10)));
        assert!(store.insert(7, server(2, 1, 7, "b", 20)));
        assert!(!store.insert(7, server(2, 1, 7, "b", 20)));

        assert_eq!(
            ids(&store, 7),
            vec![MessageId::Server(1), MessageId::Server(2), MessageId::Server(3)]
        );
    }

    #[test]
    fn test_equal_timestamps_keep_arrival_order() {
        let store = MessageStore::new();
        store.insert(7, server(5, 7, 1, "first", 10));
        store.insert(7, server(4, 7, 1, "second", 10));
        assert_eq!(ids(&store, 7), vec![MessageId::Server(5), MessageId::Server(4)]);
    }

    #[test]
    fn test_confirm_moves_pending_to_server_position() {
        let store = MessageStore::new();
        let pending = Message::optimistic(uuid::Uuid::new_v4(), 1, 7, "offer 40?".to_string(), at(50));
        let client_ref = pending.client_ref.unwrap();
        store.insert(7, pending);
        store.insert(7, server(1, 7, 1, "hello", 40));

        assert!(store.confirm(7, client_ref, server(9, 1, 7, "offer 40?", 45)));
        let log = store.messages(7);
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].id, MessageId::Server(9));
        assert_eq!(log[1].delivery_state, DeliveryState::Confirmed);
        assert!(!store.confirm(7, client_ref, server(9, 1, 7, "offer 40?", 45)));
    }

    #[test]
    fn test_history_replacement_keeps_unknown_pending_messages() {
        let store = MessageStore::new();
        let pending = Message::optimistic(uuid::Uuid::new_v4(), 1, 7, "still sending".to_string(), at(100));
        store.insert(7, server(1, 7, 1, "old", 5));
        store.insert(7, pending.clone());

        store.replace_history(7, vec![server(2, 7, 1, "x", 20), server(1, 7, 1, "old", 5)]);
        assert_eq!(
            ids(&store, 7),
            vec![MessageId::Server(1), MessageId::Server(2), pending.id]
        );
    }

    #[test]
    fn test_echo_candidate_includes_failed_sends() {
        let store = MessageStore::new();
        let pending = Message::optimistic(uuid::Uuid::new_v4(), 1, 7, "hello?".to_string(), at(100));
        let client_ref = pending.client_ref.unwrap();
        store.insert(7, pending);
        store.transition(7, client_ref, DeliveryState::Optimistic, DeliveryState::Failed);

        let window = Duration::from_secs(30);
        assert_eq!(store.find_echo_candidate(7, 1, 7, "hello?", at(116), window), Some(client_ref));
        assert_eq!(store.find_echo_candidate(7, 1, 7, "hello?", at(140), window), None);
        assert_eq!(store.find_echo_candidate(7, 1, 7, "other", at(116), window), None);

        assert!(store.confirm(7, client_ref, server(90, 1, 7, "hello?", 116)));
        assert_eq!(store.find_echo_candidate(7, 1, 7, "hello?", at(116), window), None);
        assert_eq!(store.count(7), 1);
    }

    #[test]
    fn test_transition_requires_expected_state() {
        let store = MessageStore::new();
        let pending = Message::optimistic(uuid::Uuid::new_v4(), 1, 7, "hi".to_string(), at(1));
        let client_ref = pending.client_ref.unwrap();
        store.insert(7, pending);

        assert!(!store.transition(7, client_ref, DeliveryState::Failed, DeliveryState::Optimistic));
        assert!(store.transition(7, client_ref, DeliveryState::Optimistic, DeliveryState::Failed));
        assert_eq!(store.get(7, client_ref).unwrap().delivery_state, DeliveryState::Failed);
    }
}
