use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use shared::{
    domain::{PresenceStatus, ThreadId, UserId},
    protocol::RealtimeEvent,
};
use tokio::time::Instant;
use tracing::trace;

pub const TYPING_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceState {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub last_seen: Option<DateTime<Utc>>,
}

impl PresenceState {
    pub fn is_online(&self) -> bool {
        self.status == PresenceStatus::Online
    }
}

/// Ephemeral per-thread typing indicators and per-user presence. Typing
/// entries expire on their own if the matching stop event never arrives.
#[derive(Debug)]
pub struct PresenceTypingTracker {
    timeout: Duration,
    typing: HashMap<(ThreadId, UserId), Instant>,
    presence: HashMap<UserId, PresenceState>,
}

impl PresenceTypingTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            typing: HashMap::new(),
            presence: HashMap::new(),
        }
    }

    pub fn on_typing_start(&mut self, user_id: &UserId, thread_id: &ThreadId) {
        let expires_at = Instant::now() + self.timeout;
        self.typing
            .insert((thread_id.clone(), user_id.clone()), expires_at);
    }

    pub fn on_typing_stop(&mut self, user_id: &UserId, thread_id: &ThreadId) {
        self.typing.remove(&(thread_id.clone(), user_id.clone()));
    }

    pub fn is_typing(&mut self, thread_id: &ThreadId) -> bool {
        self.prune_expired();
        self.typing.keys().any(|(thread, _)| thread == thread_id)
    }

    pub fn typing_users(&mut self, thread_id: &ThreadId) -> Vec<UserId> {
        self.prune_expired();
        let mut users: Vec<UserId> = self
            .typing
            .keys()
            .filter(|(thread, _)| thread == thread_id)
            .map(|(_, user)| user.clone())
            .collect();
        users.sort();
        users
    }

    /// Drops typing entries whose deadline has passed.
    pub fn prune_expired(&mut self) -> usize {
        let now = Instant::now();
        let before = self.typing.len();
        self.typing.retain(|_, expires_at| *expires_at > now);
        let pruned = before - self.typing.len();
        if pruned > 0 {
            trace!(pruned, "presence: expired typing indicators");
        }
        pruned
    }

    pub fn on_presence_update(
        &mut self,
        user_id: &UserId,
        status: PresenceStatus,
        last_seen: Option<DateTime<Utc>>,
    ) -> PresenceState {
        let state = PresenceState {
            user_id: user_id.clone(),
            status,
            last_seen,
        };
        self.presence.insert(user_id.clone(), state.clone());
        state
    }

    pub fn presence(&self, user_id: &UserId) -> Option<&PresenceState> {
        self.presence.get(user_id)
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.presence
            .get(user_id)
            .is_some_and(PresenceState::is_online)
    }

    /// Applies typing and presence events; returns false for anything else.
    pub fn apply(&mut self, event: &RealtimeEvent) -> bool {
        match event {
            RealtimeEvent::TypingStart { user_id, thread_id } => {
                self.on_typing_start(user_id, thread_id)
            }
            RealtimeEvent::TypingStop { user_id, thread_id } => {
                self.on_typing_stop(user_id, thread_id)
            }
            RealtimeEvent::PresenceUpdate {
                user_id,
                status,
                last_seen,
            } => {
                self.on_presence_update(user_id, *status, *last_seen);
            }
            _ => return false,
        }
        true
    }
}

impl Default for PresenceTypingTracker {
    fn default() -> Self {
        Self::new(TYPING_TIMEOUT)
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
