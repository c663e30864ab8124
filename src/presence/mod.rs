//! # Real-Time Presence & Collaboration State
//!
//! Per-room in-memory state for cursors, selections, typing flags,
//! permissions and activity feeds. A single reader-writer lock guards the
//! room map; writers hold it only for the mutation, readers receive copies.
//!
//! Colors come from a fixed 12-entry palette assigned by a per-room
//! monotonically increasing index modulo 12. When the last user leaves a
//! room the whole room state (index included) is dropped, so a fresh wave
//! of joins starts at palette position 0 again.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Per-room activity feeds.
pub mod activity;

/// Presence data types and update payloads.
pub mod types;

pub use activity::{ActivityEvent, ActivityLog};
pub use types::{
    CursorPosition, Permission, PresenceEntry, PresenceUpdate, PresenceUpdateKind, Selection,
    UserStatus,
};

/// The 12-color collaborator palette, assigned in join order.
pub const COLOR_PALETTE: [&str; 12] = [
    "#e06c75", "#61afef", "#98c379", "#e5c07b", "#c678dd", "#56b6c2", "#d19a66", "#f47fb0",
    "#7f9cf5", "#50c9a0", "#ef7b66", "#a8b356",
];

/// Default capacity of each room's activity ring.
const ACTIVITY_FEED_CAPACITY: usize = 100;

#[derive(Debug, Default)]
struct RoomState {
    users: HashMap<u64, PresenceEntry>,
    /// Monotonic palette index; only ever increments while the room lives
    color_cursor: usize,
}

/// In-memory presence state for every room.
pub struct PresenceManager {
    rooms: RwLock<HashMap<String, RoomState>>,
    activity: ActivityLog,
}

impl Default for PresenceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceManager {
    pub fn new() -> Self {
        Self::with_feed_capacity(ACTIVITY_FEED_CAPACITY)
    }

    pub fn with_feed_capacity(capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            activity: ActivityLog::new(capacity),
        }
    }

    /// Add a user to a room, assigning the next palette color. Rejoining
    /// refreshes the existing entry instead of burning a color.
    pub fn join(
        &self,
        room_id: &str,
        user_id: u64,
        username: &str,
        permission: Permission,
    ) -> PresenceEntry {
        let mut rooms = self.rooms.write();
        let room = rooms.entry(room_id.to_string()).or_default();

        let entry = match room.users.get_mut(&user_id) {
            Some(existing) => {
                existing.status = UserStatus::Online;
                existing.last_activity = monotonic_now(existing.last_activity);
                existing.clone()
            }
            None => {
                let color = COLOR_PALETTE[room.color_cursor % COLOR_PALETTE.len()];
                room.color_cursor += 1;
                let entry = PresenceEntry {
                    user_id,
                    username: username.to_string(),
                    color: color.to_string(),
                    cursor: None,
                    selection: None,
                    typing: false,
                    following: None,
                    permission,
                    status: UserStatus::Online,
                    last_activity: Utc::now(),
                };
                room.users.insert(user_id, entry.clone());
                entry
            }
        };
        debug!(room_id, user_id, "user joined room");
        entry
    }

    /// Remove a user; drops the whole room state when it empties.
    pub fn leave(&self, room_id: &str, user_id: u64) -> bool {
        let mut rooms = self.rooms.write();
        let Some(room) = rooms.get_mut(room_id) else {
            return false;
        };
        let removed = room.users.remove(&user_id).is_some();
        if room.users.is_empty() {
            rooms.remove(room_id);
            self.activity.purge_room(room_id);
            debug!(room_id, "room emptied, palette state freed");
        }
        removed
    }

    /// Move a user's cursor; refreshes status and activity.
    pub fn update_cursor(
        &self,
        room_id: &str,
        user_id: u64,
        line: u32,
        col: u32,
    ) -> Option<PresenceEntry> {
        self.mutate(room_id, user_id, |entry| {
            entry.cursor = Some(CursorPosition {
                line,
                col,
                ts: Utc::now(),
            });
        })
    }

    /// Replace a user's selection; refreshes status and activity.
    pub fn update_selection(
        &self,
        room_id: &str,
        user_id: u64,
        selection: Selection,
    ) -> Option<PresenceEntry> {
        self.mutate(room_id, user_id, |entry| {
            entry.selection = Some(selection);
        })
    }

    /// Flip a user's typing flag.
    pub fn set_typing(&self, room_id: &str, user_id: u64, typing: bool) -> Option<PresenceEntry> {
        self.mutate(room_id, user_id, |entry| {
            entry.typing = typing;
        })
    }

    /// Follow another user. The target may be absent from the room; readers
    /// treat a dangling follow as no-op.
    pub fn follow(
        &self,
        room_id: &str,
        user_id: u64,
        target: Option<u64>,
    ) -> Option<PresenceEntry> {
        self.mutate(room_id, user_id, |entry| {
            entry.following = target;
        })
    }

    /// Set a user's availability.
    pub fn set_status(
        &self,
        room_id: &str,
        user_id: u64,
        status: UserStatus,
    ) -> Option<PresenceEntry> {
        let mut rooms = self.rooms.write();
        let entry = rooms.get_mut(room_id)?.users.get_mut(&user_id)?;
        entry.status = status;
        entry.last_activity = monotonic_now(entry.last_activity);
        Some(entry.clone())
    }

    /// Change a user's permission. The actor must be admin or owner, an
    /// owner's permission can never be changed, and only an owner may grant
    /// or revoke admin.
    pub fn change_permission(
        &self,
        room_id: &str,
        actor_id: u64,
        target_id: u64,
        permission: Permission,
    ) -> bool {
        let mut rooms = self.rooms.write();
        let Some(room) = rooms.get_mut(room_id) else {
            return false;
        };
        let Some(actor) = room.users.get(&actor_id).map(|e| e.permission) else {
            return false;
        };
        let Some(target) = room.users.get(&target_id).map(|e| e.permission) else {
            return false;
        };

        if !actor.can_moderate() || target == Permission::Owner || permission == Permission::Owner {
            return false;
        }
        if (permission == Permission::Admin || target == Permission::Admin)
            && actor != Permission::Owner
        {
            return false;
        }

        let entry = room.users.get_mut(&target_id).expect("checked above");
        entry.permission = permission;
        entry.last_activity = monotonic_now(entry.last_activity);
        true
    }

    /// Remove a user from the room on another user's authority. Requires
    /// admin or owner; owners cannot be kicked.
    pub fn kick_user(&self, room_id: &str, actor_id: u64, target_id: u64) -> bool {
        let allowed = {
            let rooms = self.rooms.read();
            let Some(room) = rooms.get(room_id) else {
                return false;
            };
            let actor = room.users.get(&actor_id).map(|e| e.permission);
            let target = room.users.get(&target_id).map(|e| e.permission);
            matches!(
                (actor, target),
                (Some(actor), Some(target)) if actor.can_moderate() && target != Permission::Owner
            )
        };
        if !allowed {
            return false;
        }
        debug!(room_id, actor_id, target_id, "user kicked from room");
        self.leave(room_id, target_id)
    }

    /// Copies of every entry in a room.
    pub fn get_room_presence(&self, room_id: &str) -> Vec<PresenceEntry> {
        let rooms = self.rooms.read();
        let mut entries: Vec<_> = rooms
            .get(room_id)
            .map(|room| room.users.values().cloned().collect())
            .unwrap_or_default();
        entries.sort_by_key(|e| e.user_id);
        entries
    }

    /// Copy of one entry.
    pub fn get_user(&self, room_id: &str, user_id: u64) -> Option<PresenceEntry> {
        self.rooms
            .read()
            .get(room_id)?
            .users
            .get(&user_id)
            .cloned()
    }

    /// Number of live rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    /// Remove every entry idle for longer than `idle_timeout`. Returns the
    /// removed `(room, user)` pairs so the caller can fan out disconnect
    /// notices; emptied rooms are purged.
    pub fn cleanup(&self, idle_timeout: Duration) -> Vec<(String, u64)> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(idle_timeout).unwrap_or(chrono::Duration::zero());
        let mut removed = Vec::new();

        let mut rooms = self.rooms.write();
        rooms.retain(|room_id, room| {
            room.users.retain(|user_id, entry| {
                let stale = entry.last_activity < cutoff;
                if stale {
                    removed.push((room_id.clone(), *user_id));
                }
                !stale
            });
            !room.users.is_empty()
        });
        drop(rooms);

        for (room_id, _) in &removed {
            if self.get_room_presence(room_id).is_empty() {
                self.activity.purge_room(room_id);
            }
        }
        if !removed.is_empty() {
            debug!(count = removed.len(), "presence cleanup removed idle entries");
        }
        removed
    }

    /// The per-room activity feed.
    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    fn mutate(
        &self,
        room_id: &str,
        user_id: u64,
        apply: impl FnOnce(&mut PresenceEntry),
    ) -> Option<PresenceEntry> {
        let mut rooms = self.rooms.write();
        let entry = rooms.get_mut(room_id)?.users.get_mut(&user_id)?;
        apply(entry);
        entry.status = UserStatus::Online;
        entry.last_activity = monotonic_now(entry.last_activity);
        Some(entry.clone())
    }
}

/// Observers must see non-decreasing activity timestamps per entry, even if
/// the wall clock steps backwards between updates.
fn monotonic_now(previous: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(previous)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_assigns_distinct_palette_colors() {
        let manager = PresenceManager::new();
        for user in 0..3u64 {
            manager.join("R", user, &format!("user{user}"), Permission::Editor);
        }

        let entries = manager.get_room_presence("R");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].color, COLOR_PALETTE[0]);
        assert_eq!(entries[1].color, COLOR_PALETTE[1]);
        assert_eq!(entries[2].color, COLOR_PALETTE[2]);
    }

    #[test]
    fn test_palette_wraps_after_twelve() {
        let manager = PresenceManager::new();
        for user in 0..13u64 {
            manager.join("R", user, "u", Permission::Viewer);
        }
        let thirteenth = manager.get_user("R", 12).unwrap();
        assert_eq!(thirteenth.color, COLOR_PALETTE[0]);
    }

    #[test]
    fn test_palette_recycles_when_room_empties() {
        let manager = PresenceManager::new();
        for user in 0..4u64 {
            manager.join("R", user, "u", Permission::Viewer);
        }
        for user in 0..4u64 {
            manager.leave("R", user);
        }
        assert_eq!(manager.room_count(), 0);

        let fresh = manager.join("R", 99, "newcomer", Permission::Viewer);
        assert_eq!(fresh.color, COLOR_PALETTE[0]);
    }

    #[test]
    fn test_rejoin_keeps_color() {
        let manager = PresenceManager::new();
        let first = manager.join("R", 1, "alice", Permission::Owner);
        manager.join("R", 2, "bob", Permission::Editor);
        let again = manager.join("R", 1, "alice", Permission::Owner);
        assert_eq!(first.color, again.color);
        assert_eq!(manager.get_room_presence("R").len(), 2);
    }

    #[test]
    fn test_cursor_updates_are_monotonic() {
        let manager = PresenceManager::new();
        manager.join("R", 1, "alice", Permission::Editor);

        let mut last = manager.get_user("R", 1).unwrap().last_activity;
        for i in 0..50 {
            let entry = manager.update_cursor("R", 1, i, 0).unwrap();
            assert!(entry.last_activity >= last);
            last = entry.last_activity;
        }
    }

    #[test]
    fn test_follow_absent_target_allowed() {
        let manager = PresenceManager::new();
        manager.join("R", 1, "alice", Permission::Editor);
        let entry = manager.follow("R", 1, Some(404)).unwrap();
        assert_eq!(entry.following, Some(404));
    }

    #[test]
    fn test_kick_rules() {
        let manager = PresenceManager::new();
        manager.join("R", 1, "alice", Permission::Owner);
        manager.join("R", 2, "bob", Permission::Editor);
        manager.join("R", 3, "carol", Permission::Viewer);

        // Editors cannot kick.
        assert!(!manager.kick_user("R", 2, 3));
        // Nobody kicks an owner.
        assert!(!manager.kick_user("R", 2, 1));
        // Owners can.
        assert!(manager.kick_user("R", 1, 3));
        assert_eq!(manager.get_room_presence("R").len(), 2);
        // Kicking again reports failure.
        assert!(!manager.kick_user("R", 1, 3));
    }

    #[test]
    fn test_permission_change_rules() {
        let manager = PresenceManager::new();
        manager.join("R", 1, "alice", Permission::Owner);
        manager.join("R", 2, "bob", Permission::Admin);
        manager.join("R", 3, "carol", Permission::Viewer);

        // Admin may adjust non-admin permissions.
        assert!(manager.change_permission("R", 2, 3, Permission::Editor));
        // Only the owner may grant admin.
        assert!(!manager.change_permission("R", 2, 3, Permission::Admin));
        assert!(manager.change_permission("R", 1, 3, Permission::Admin));
        // Nobody changes the owner, nobody grants owner.
        assert!(!manager.change_permission("R", 2, 1, Permission::Viewer));
        assert!(!manager.change_permission("R", 1, 3, Permission::Owner));
    }

    #[test]
    fn test_cleanup_removes_idle_and_purges_rooms() {
        let manager = PresenceManager::new();
        manager.join("R", 1, "alice", Permission::Editor);
        manager.join("S", 2, "bob", Permission::Editor);

        // Nothing is stale yet.
        assert!(manager.cleanup(Duration::from_secs(60)).is_empty());

        // Zero timeout ages everyone out.
        std::thread::sleep(std::time::Duration::from_millis(2));
        let removed = manager.cleanup(Duration::from_millis(1));
        assert_eq!(removed.len(), 2);
        assert_eq!(manager.room_count(), 0);
    }

    #[test]
    fn test_activity_feed_via_manager() {
        let manager = PresenceManager::with_feed_capacity(2);
        manager
            .activity()
            .record("R", ActivityEvent::new("alice", "opened", Some("main.rs".to_string())));
        manager
            .activity()
            .record("R", ActivityEvent::new("bob", "edited", None));
        manager
            .activity()
            .record("R", ActivityEvent::new("carol", "deployed", None));

        let recent = manager.activity().recent("R", 10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].verb, "deployed");
    }
}
