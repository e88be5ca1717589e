/// Periodic reconciliation of the global unread count
///
/// Each tick takes a stamp from the inbox clock before the request goes out, so a poll
/// that was issued before a push-driven change can never overwrite it.
use crate::api::ChatApi;
use crate::error::Result;
use crate::inbox::{InboxStore, Stamp};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct UnreadPoller {
    api: Arc<dyn ChatApi>,
    inbox: InboxStore,
    period: Duration,
    running: Arc<Mutex<Option<CancellationToken>>>,
}

impl UnreadPoller {
    pub fn new(api: Arc<dyn ChatApi>, inbox: InboxStore, period: Duration) -> Self {
        Self {
            api,
            inbox,
            period,
            running: Arc::new(Mutex::new(None)),
        }
    }

    /// Start polling. The first poll goes out immediately. False if already running.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock();
        if running.is_some() {
            return false;
        }
        let token = CancellationToken::new();
        tokio::spawn(self.clone().run(token.clone()));
        *running = Some(token);
        info!("Unread poller started ({:?} period)", self.period);
        true
    }

    /// Stop polling. In-flight requests are abandoned. Safe to call repeatedly.
    pub fn stop(&self) -> bool {
        match self.running.lock().take() {
            Some(token) => {
                token.cancel();
                debug!("Unread poller stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    async fn run(self, token: CancellationToken) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {
                    let stamp = self.inbox.issue_stamp();
                    let poller = self.clone();
                    let token = token.clone();
                    // Requests may overlap; stamps decide which answer wins.
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = token.cancelled() => {}
                            result = poller.poll_once(stamp) => {
                                if let Err(e) = result {
                                    warn!("Unread poll failed: {}", e);
                                }
                            }
                        }
                    });
                }
            }
        }
    }

    /// Fetch the count and apply it under `stamp`. Returns whether it was applied.
    pub async fn poll_once(&self, stamp: Stamp) -> Result<bool> {
        let count = self.api.fetch_unread_count().await?;
        Ok(self.inbox.apply_unread_snapshot(stamp, count))
    }
}
