/// Optimistic send: a message shows up locally before the server has it
use crate::api::ChatApi;
use crate::channel::LiveChannel;
use crate::error::{Result, SyncError};
use crate::inbox::InboxStore;
use crate::message_store::MessageStore;
use crate::types::{ClientRef, DeliveryState, Message, OutboundFrame, UserId, UserRef};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct OptimisticSender {
    self_id: UserId,
    channel: LiveChannel,
    api: Arc<dyn ChatApi>,
    messages: MessageStore,
    inbox: InboxStore,
    destination: String,
    send_timeout: Duration,
    http_fallback: bool,
}

impl OptimisticSender {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_id: UserId,
        channel: LiveChannel,
        api: Arc<dyn ChatApi>,
        messages: MessageStore,
        inbox: InboxStore,
        destination: String,
        send_timeout: Duration,
        http_fallback: bool,
    ) -> Self {
        Self {
            self_id,
            channel,
            api,
            messages,
            inbox,
            destination,
            send_timeout,
            http_fallback,
        }
    }

    /// Append `content` to the conversation with `peer` right away and transmit it in
    /// the background. The returned ref identifies the message until it is confirmed.
    pub fn submit(&self, peer: UserId, content: &str) -> Result<ClientRef> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SyncError::InvalidInput("Message is empty".to_string()));
        }
        if peer == self.self_id {
            return Err(SyncError::InvalidInput("Cannot message yourself".to_string()));
        }

        let client_ref = Uuid::new_v4();
        let message = Message::optimistic(client_ref, self.self_id, peer, content.to_string(), Utc::now());
        let at = message.timestamp;
        self.messages.insert(peer, message);

        let peer_ref = UserRef {
            id: peer,
            name: self.inbox.get(peer).map(|s| s.peer_name).unwrap_or_default(),
        };
        self.inbox.record_activity(&peer_ref, content, at, false);

        debug!("Queued {} for {}", client_ref, peer);
        self.spawn_transmit(peer, client_ref, content.to_string());
        Ok(client_ref)
    }

    /// Put a failed message back in flight
    pub fn retry(&self, peer: UserId, client_ref: ClientRef) -> Result<()> {
        let message = self
            .messages
            .get(peer, client_ref)
            .ok_or_else(|| SyncError::UnknownMessage(client_ref.to_string()))?;
        if !self
            .messages
            .transition(peer, client_ref, DeliveryState::Failed, DeliveryState::Optimistic)
        {
            return Err(SyncError::InvalidInput(format!(
                "Message {} is not in the failed state",
                client_ref
            )));
        }
        debug!("Retrying {}", client_ref);
        self.spawn_transmit(peer, client_ref, message.content);
        Ok(())
    }

    fn spawn_transmit(&self, peer: UserId, client_ref: ClientRef, content: String) {
        let sender = self.clone();
        tokio::spawn(async move { sender.transmit(peer, client_ref, content).await });
    }

    async fn transmit(&self, peer: UserId, client_ref: ClientRef, content: String) {
        let frame = OutboundFrame {
            receiver_id: peer,
            content,
            client_ref,
        };
        match self.channel.send(&self.destination, &frame) {
            Ok(()) => self.await_echo(peer, client_ref).await,
            Err(SyncError::NotConnected) if self.http_fallback => {
                self.send_over_http(peer, &frame).await
            }
            Err(e) => self.fail(peer, client_ref, &e),
        }
    }

    /// The push echo confirms the message; without one in time it is failed.
    async fn await_echo(&self, peer: UserId, client_ref: ClientRef) {
        sleep(self.send_timeout).await;
        if self
            .messages
            .transition(peer, client_ref, DeliveryState::Optimistic, DeliveryState::Failed)
        {
            warn!(
                "No confirmation for {} within {:?}",
                client_ref, self.send_timeout
            );
        }
    }

    async fn send_over_http(&self, peer: UserId, frame: &OutboundFrame) {
        debug!("Push channel down, sending {} over HTTP", frame.client_ref);
        match timeout(self.send_timeout, self.api.send_message(frame)).await {
            Ok(Ok(stored)) => {
                self.messages
                    .confirm(peer, frame.client_ref, Message::from(&stored));
            }
            Ok(Err(e)) => self.fail(peer, frame.client_ref, &e),
            Err(_) => self.fail(
                peer,
                frame.client_ref,
                &SyncError::Timeout("HTTP send timed out".to_string()),
            ),
        }
    }

    fn fail(&self, peer: UserId, client_ref: ClientRef, err: &SyncError) {
        if self
            .messages
            .transition(peer, client_ref, DeliveryState::Optimistic, DeliveryState::Failed)
        {
            warn!("Send {} to {} failed: {}", client_ref, peer, err);
        }
    }
}
