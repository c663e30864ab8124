//! Per-room activity feeds.
//!
//! Each room gets a bounded ring buffer of recent events. Appending beyond
//! capacity discards the oldest entry; reads copy out the most recent N.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// One feed event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    /// Acting user
    pub actor: String,
    /// What happened ("opened", "edited", "deployed", ...)
    pub verb: String,
    /// What it happened to, when applicable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ActivityEvent {
    pub fn new(actor: impl Into<String>, verb: impl Into<String>, target: Option<String>) -> Self {
        Self {
            actor: actor.into(),
            verb: verb.into(),
            target,
            timestamp: Utc::now(),
        }
    }
}

/// Bounded ring of events for one room.
#[derive(Debug)]
struct ActivityFeed {
    events: VecDeque<ActivityEvent>,
    capacity: usize,
}

impl ActivityFeed {
    fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, event: ActivityEvent) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    fn recent(&self, n: usize) -> Vec<ActivityEvent> {
        self.events.iter().rev().take(n).cloned().collect()
    }
}

/// Room id → activity ring, capacity fixed at construction.
pub struct ActivityLog {
    rooms: RwLock<HashMap<String, ActivityFeed>>,
    capacity: usize,
}

impl ActivityLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Append an event to a room's feed.
    pub fn record(&self, room_id: &str, event: ActivityEvent) {
        let mut rooms = self.rooms.write();
        rooms
            .entry(room_id.to_string())
            .or_insert_with(|| ActivityFeed::new(self.capacity))
            .push(event);
    }

    /// Copies of the most recent `n` events, newest first.
    pub fn recent(&self, room_id: &str, n: usize) -> Vec<ActivityEvent> {
        self.rooms
            .read()
            .get(room_id)
            .map(|feed| feed.recent(n))
            .unwrap_or_default()
    }

    /// Drop a room's feed entirely.
    pub fn purge_room(&self, room_id: &str) {
        self.rooms.write().remove(room_id);
    }
}
