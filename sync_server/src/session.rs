//! Connected sessions.
//!
//! A session is one recipient of deltas: its room, its interest focus, and
//! its per-recipient sync history. The history lives here and nowhere else,
//! so closing the session reclaims it; there is no global per-client
//! dictionary to leak on disconnect.

use std::collections::HashMap;

use sync_core::delta::SyncState;
use sync_core::math::IVec2;

use crate::boundary::ConnectionId;

/// One connected recipient.
pub struct Session {
    pub connection_id: ConnectionId,
    pub room_id: String,
    /// Center of this session's interest queries.
    pub focus: IVec2,
    pub interest_radius: i32,
    /// Last values sent to this recipient, per kind.
    pub sync: SyncState,
}

/// All open sessions, keyed by connection.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<ConnectionId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Opens a session, replacing any previous one on the same connection.
    pub fn open(
        &mut self,
        connection_id: ConnectionId,
        room_id: impl Into<String>,
        focus: IVec2,
        interest_radius: i32,
    ) {
        self.sessions.insert(
            connection_id,
            Session {
                connection_id,
                room_id: room_id.into(),
                focus,
                interest_radius,
                sync: SyncState::new(),
            },
        );
    }

    /// Closes a session, dropping its sync history with it.
    pub fn close(&mut self, connection_id: ConnectionId) -> bool {
        self.sessions.remove(&connection_id).is_some()
    }

    pub fn get(&self, connection_id: ConnectionId) -> Option<&Session> {
        self.sessions.get(&connection_id)
    }

    pub fn get_mut(&mut self, connection_id: ConnectionId) -> Option<&mut Session> {
        self.sessions.get_mut(&connection_id)
    }

    pub fn set_focus(&mut self, connection_id: ConnectionId, focus: IVec2) -> bool {
        match self.sessions.get_mut(&connection_id) {
            Some(s) => {
                s.focus = focus;
                true
            }
            None => false,
        }
    }

    /// Moves a session to another room. The sync history stays; deltas are
    /// per-recipient, not per-room.
    pub fn move_room(&mut self, connection_id: ConnectionId, room_id: impl Into<String>) -> bool {
        match self.sessions.get_mut(&connection_id) {
            Some(s) => {
                s.room_id = room_id.into();
                true
            }
            None => false,
        }
    }

    /// Connection ids in a room, sorted.
    pub fn in_room(&self, room_id: &str) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .sessions
            .values()
            .filter(|s| s.room_id == room_id)
            .map(|s| s.connection_id)
            .collect();
        ids.sort();
        ids
    }

    /// All connection ids, sorted for stable per-tick iteration.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.sessions.keys().copied().collect();
        ids.sort();
        ids
    }
}
