//! Presence tracking for the other participants of a session.
//!
//! ## Architecture
//!
//! ```text
//! ServerMsg::UserInfo / UserLeft / UserCursor
//!       │
//!       ▼
//! PresenceTracker::upsert() / remove() / update_cursor()
//!       │  (returns whether the roster changed)
//!       ▼
//! SessionEvent::ChangeUsers(full map)   ← host renders from the snapshot
//! ```
//!
//! The local participant is never tracked here; its identity is owned by the
//! host and pushed to the server through the session.

use std::collections::BTreeMap;

use crate::operation::Operation;
use crate::protocol::{CursorData, UserInfo};

/// Roster of remote participants keyed by their session-scoped id.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    /// Our own id on the current connection.
    local_id: Option<u64>,
    users: BTreeMap<u64, UserInfo>,
    cursors: BTreeMap<u64, CursorData>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set our own id; notifications about it are ignored from now on.
    pub fn set_local_id(&mut self, id: u64) {
        self.local_id = Some(id);
        self.users.remove(&id);
        self.cursors.remove(&id);
    }

    pub fn local_id(&self) -> Option<u64> {
        self.local_id
    }

    fn is_local(&self, id: u64) -> bool {
        self.local_id == Some(id)
    }

    /// Join or info update. Returns `true` if the roster changed.
    pub fn upsert(&mut self, id: u64, info: UserInfo) -> bool {
        if self.is_local(id) {
            return false;
        }
        match self.users.insert(id, info.clone()) {
            Some(previous) if previous == info => false,
            Some(_) => {
                log::debug!("Participant {id} is now {}", info.name);
                true
            }
            None => {
                log::debug!("Participant {id} ({}) joined", info.name);
                true
            }
        }
    }

    /// Leave. Returns `true` if the participant was known.
    pub fn remove(&mut self, id: u64) -> bool {
        self.cursors.remove(&id);
        let removed = self.users.remove(&id).is_some();
        if removed {
            log::debug!("Participant {id} left");
        }
        removed
    }

    /// Record a participant's cursors. Returns `true` if they changed.
    pub fn update_cursor(&mut self, id: u64, data: CursorData) -> bool {
        if self.is_local(id) {
            return false;
        }
        self.cursors.insert(id, data.clone()) != Some(data)
    }

    /// Map every remote cursor through an operation applied to the
    /// document. Returns `true` if any cursor moved.
    pub fn transform_cursors(&mut self, op: &Operation) -> bool {
        let mut moved = false;
        for data in self.cursors.values_mut() {
            let before = data.clone();
            data.transform(op);
            moved |= *data != before;
        }
        moved
    }

    /// Forget everyone, e.g. when a new connection opens. Returns `true`
    /// if anything was removed.
    pub fn clear(&mut self) -> bool {
        self.local_id = None;
        let had_users = !self.users.is_empty() || !self.cursors.is_empty();
        self.users.clear();
        self.cursors.clear();
        had_users
    }

    pub fn users(&self) -> &BTreeMap<u64, UserInfo> {
        &self.users
    }

    pub fn cursors(&self) -> &BTreeMap<u64, CursorData> {
        &self.cursors
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}
