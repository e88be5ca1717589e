/// Active conversation tracker: the one cell async callbacks read to learn
/// which conversation is open *now*.
use crate::types::UserId;
use parking_lot::RwLock;
use std::sync::Arc;

/// Snapshot of the tracker taken when async work starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Focus {
    pub peer: Option<UserId>,
    pub generation: u64,
}

#[derive(Debug, Default)]
struct Cell {
    peer: Option<UserId>,
    generation: u64,
}

/// Shared cell; clones point at the same value.
#[derive(Debug, Clone, Default)]
pub struct ActiveConversation {
    cell: Arc<RwLock<Cell>>,
}

impl ActiveConversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point the tracker at `peer` (or at nothing). Every call starts a new generation,
    /// even when the peer is unchanged.
    pub fn set(&self, peer: Option<UserId>) -> Focus {
        let mut cell = self.cell.write();
        cell.peer = peer;
        cell.generation += 1;
        Focus {
            peer: cell.peer,
            generation: cell.generation,
        }
    }

    pub fn get(&self) -> Option<UserId> {
        self.cell.read().peer
    }

    pub fn is_active(&self, peer: UserId) -> bool {
        self.get() == Some(peer)
    }

    pub fn focus(&self) -> Focus {
        let cell = self.cell.read();
        Focus {
            peer: cell.peer,
            generation: cell.generation,
        }
    }

    /// True while no `set` happened since `focus` was taken
    pub fn is_current(&self, focus: &Focus) -> bool {
        self.focus() == *focus
    }
}
