/// Inbox store: conversation summaries ordered by recency, plus the global unread badge
use crate::types::{ConversationSummary, UserId, UserRef};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Logical-clock stamp attached to every authoritative unread read
pub type Stamp = u64;

#[derive(Debug, Default)]
struct Inbox {
    /// Sorted descending by `updated_at`, unique by `peer_id`
    rows: Vec<ConversationSummary>,
    unread_total: u64,
    last_applied: Stamp,
}

impl Inbox {
    fn take(&mut self, peer: UserId) -> Option<ConversationSummary> {
        let pos = self.rows.iter().position(|r| r.peer_id == peer)?;
        Some(self.rows.remove(pos))
    }

    /// Newest first; among equal timestamps the latest insert goes first.
    fn place(&mut self, row: ConversationSummary) {
        let pos = self.rows.partition_point(|r| r.updated_at > row.updated_at);
        self.rows.insert(pos, row);
    }
}

#[derive(Clone, Default)]
pub struct InboxStore {
    inner: Arc<Mutex<Inbox>>,
    clock: Arc<AtomicU64>,
}

impl InboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next logical-clock value. Poll requests take one when they are issued.
    pub fn issue_stamp(&self) -> Stamp {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Insert or replace a summary and reorder
    pub fn upsert(&self, summary: ConversationSummary) {
        let mut inbox = self.inner.lock();
        inbox.take(summary.peer_id);
        inbox.place(summary);
    }

    /// Record a message for `peer`. Preview and recency only move forward in time; an
    /// older event still counts as unread when `unread` is set.
    pub fn record_activity(
        &self,
        peer: &UserRef,
        preview: &str,
        at: DateTime<Utc>,
        unread: bool,
    ) -> ConversationSummary {
        let mut inbox = self.inner.lock();
        let mut row = inbox
            .take(peer.id)
            .unwrap_or_else(|| ConversationSummary::new(peer));
        if row.peer_name.is_empty() {
            row.peer_name = peer.name.clone();
        }
        if at >= row.updated_at {
            row.last_preview = preview.to_string();
            row.updated_at = at;
        }
        if unread {
            row.unread_count += 1;
            inbox.unread_total += 1;
            inbox.last_applied = self.issue_stamp();
        }
        inbox.place(row.clone());
        row
    }

    /// Replace the list with a fetched snapshot. Local details the snapshot lacks
    /// (preview, recency, unread) are kept, and peers missing from it are not dropped.
    pub fn replace_all(&self, snapshot: Vec<ConversationSummary>) {
        let mut inbox = self.inner.lock();
        let mut local = std::mem::take(&mut inbox.rows);

        // Place in reverse so server order survives among equal timestamps.
        for mut incoming in snapshot.into_iter().rev() {
            if inbox.rows.iter().any(|r| r.peer_id == incoming.peer_id) {
                continue;
            }
            if let Some(pos) = local.iter().position(|r| r.peer_id == incoming.peer_id) {
                let known = local.remove(pos);
                if known.updated_at > incoming.updated_at {
                    incoming.updated_at = known.updated_at;
                    incoming.last_preview = known.last_preview;
                }
                if incoming.peer_name.is_empty() {
                    incoming.peer_name = known.peer_name;
                }
                if incoming.unread_count == 0 {
                    incoming.unread_count = known.unread_count;
                }
            }
            inbox.place(incoming);
        }
        for row in local.into_iter().rev() {
            inbox.place(row);
        }
        debug!("Inbox replaced: {} conversations", inbox.rows.len());
    }

    /// Zero one conversation's badge. Returns how many unread messages were cleared.
    pub fn mark_read(&self, peer: UserId) -> u32 {
        let mut inbox = self.inner.lock();
        let Some(row) = inbox.rows.iter_mut().find(|r| r.peer_id == peer) else {
            return 0;
        };
        let cleared = std::mem::take(&mut row.unread_count);
        if cleared > 0 {
            inbox.unread_total = inbox.unread_total.saturating_sub(u64::from(cleared));
            inbox.last_applied = self.issue_stamp();
        }
        cleared
    }

    /// Apply an authoritative unread count read under `stamp`. Ignored unless the stamp is
    /// newer than the last applied change.
    pub fn apply_unread_snapshot(&self, stamp: Stamp, count: u64) -> bool {
        let mut inbox = self.inner.lock();
        if stamp <= inbox.last_applied {
            debug!(
                "Discarding stale unread snapshot (stamp {} <= {})",
                stamp, inbox.last_applied
            );
            return false;
        }
        inbox.unread_total = count;
        inbox.last_applied = stamp;
        true
    }

    pub fn total_unread(&self) -> u64 {
        self.inner.lock().unread_total
    }

    pub fn entries(&self) -> Vec<ConversationSummary> {
        self.inner.lock().rows.clone()
    }

    pub fn get(&self, peer: UserId) -> Option<ConversationSummary> {
        self.inner.lock().rows.iter().find(|r| r.peer_id == peer).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything (logout). Polls issued before this point can no longer apply.
    pub fn remove_all(&self) {
        let mut inbox = self.inner.lock();
        inbox.rows.clear();
        inbox.unread_total = 0;
        inbox.last_applied = self.clock.load(Ordering::SeqCst);
    }
}
