//! In-process transport. The paired [`MemoryServer`] plays the push server: it sees every
//! frame the client sends and can push events, reject handshakes or drop the link.

use super::{ClientFrame, Link, ServerFrame, Transport};
use crate::error::{Result, SyncError};
use crate::session::Credentials;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

struct ServerLink {
    to_client: mpsc::UnboundedSender<ServerFrame>,
    from_client: mpsc::UnboundedReceiver<ClientFrame>,
}

#[derive(Default)]
struct Shared {
    links: Vec<ServerLink>,
    refuse: Option<String>,
    opened: usize,
    last_token: Option<String>,
}

#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Mutex<Shared>>,
}

#[derive(Clone)]
pub struct MemoryServer {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryTransport {
    pub fn pair() -> (Self, MemoryServer) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        (
            Self {
                shared: shared.clone(),
            },
            MemoryServer { shared },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, credentials: &Credentials) -> Result<Link> {
        let mut shared = self.shared.lock();
        if let Some(reason) = &shared.refuse {
            return Err(SyncError::Connection(reason.clone()));
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        shared.links.push(ServerLink {
            to_client: in_tx,
            from_client: out_rx,
        });
        shared.opened += 1;
        shared.last_token = Some(credentials.token.clone());
        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

impl MemoryServer {
    /// Deliver an event on the most recent link. False if that link is gone.
    pub fn push(&self, topic: &str, body: &str) -> bool {
        self.send_frame(ServerFrame::Event {
            topic: topic.to_string(),
            body: body.to_string(),
        })
    }

    pub fn push_json<T: Serialize>(&self, topic: &str, payload: &T) -> bool {
        match serde_json::to_string(payload) {
            Ok(body) => self.push(topic, &body),
            Err(_) => false,
        }
    }

    /// Send an ERROR frame, which closes the link on the client side
    pub fn fail(&self, message: &str) -> bool {
        self.send_frame(ServerFrame::Error {
            message: message.to_string(),
        })
    }

    /// Close the most recent link without an ERROR frame
    pub fn drop_link(&self) {
        self.shared.lock().links.pop();
    }

    /// Reject future handshakes with `reason`, or accept them again with `None`
    pub fn refuse(&self, reason: Option<&str>) {
        self.shared.lock().refuse = reason.map(String::from);
    }

    pub fn connections_opened(&self) -> usize {
        self.shared.lock().opened
    }

    pub fn last_token(&self) -> Option<String> {
        self.shared.lock().last_token.clone()
    }

    /// Drain the frames the client sent on the most recent link
    pub fn received(&self) -> Vec<ClientFrame> {
        let mut shared = self.shared.lock();
        let mut frames = Vec::new();
        if let Some(link) = shared.links.last_mut() {
            while let Ok(frame) = link.from_client.try_recv() {
                frames.push(frame);
            }
        }
        frames
    }

    fn send_frame(&self, frame: ServerFrame) -> bool {
        let shared = self.shared.lock();
        match shared.links.last() {
            Some(link) => link.to_client.send(frame).is_ok(),
            None => false,
        }
    }
}
