//! Presence data types and the WebSocket update payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Collaboration permission, ordered by authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Viewer,
    Editor,
    Admin,
    Owner,
}

impl Permission {
    /// Whether this permission can kick users or change permissions.
    pub fn can_moderate(self) -> bool {
        matches!(self, Permission::Admin | Permission::Owner)
    }
}

/// User availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Online,
    Away,
    Busy,
    Offline,
}

/// A cursor position in a document.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CursorPosition {
    pub line: u32,
    pub col: u32,
    pub ts: DateTime<Utc>,
}

/// A selection range in a document.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Selection {
    pub start_line: u32,
    pub start_col: u32,
    pub end_line: u32,
    pub end_col: u32,
    pub ts: DateTime<Utc>,
}

/// One user's presence in one room. Callers always receive copies; the
/// manager owns the live entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: u64,
    pub username: String,
    /// Palette color assigned at join
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Selection>,
    pub typing: bool,
    /// User this user follows; may name someone no longer in the room
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub following: Option<u64>,
    pub permission: Permission,
    pub status: UserStatus,
    pub last_activity: DateTime<Utc>,
}

/// What a presence update announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceUpdateKind {
    Cursor,
    Selection,
    Typing,
    Follow,
    Status,
    Join,
    Leave,
}

/// Message the collaboration WebSocket layer fans out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceUpdate {
    #[serde(rename = "type")]
    pub kind: PresenceUpdateKind,
    pub room_id: String,
    pub user_id: u64,
    pub timestamp: DateTime<Utc>,
    pub presence: PresenceEntry,
}

impl PresenceUpdate {
    pub fn new(kind: PresenceUpdateKind, room_id: impl Into<String>, presence: PresenceEntry) -> Self {
        Self {
            kind,
            room_id: room_id.into(),
            user_id: presence.user_id,
            timestamp: Utc::now(),
            presence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_ordering() {
        assert!(Permission::Owner > Permission::Admin);
        assert!(Permission::Admin > Permission::Editor);
        assert!(Permission::Editor > Permission::Viewer);
        assert!(Permission::Admin.can_moderate());
        assert!(!Permission::Editor.can_moderate());
    }

    #[test]
    fn test_update_wire_shape() {
        let entry = PresenceEntry {
            user_id: 3,
            username: "alice".to_string(),
            color: "#e06c75".to_string(),
            cursor: None,
            selection: None,
            typing: false,
            following: None,
            permission: Permission::Owner,
            status: UserStatus::Online,
            last_activity: Utc::now(),
        };
        let update = PresenceUpdate::new(PresenceUpdateKind::Join, "room-1", entry);
        let json = serde_json::to_value(&update).unwrap();

        assert_eq!(json["type"], "join");
        assert_eq!(json["room_id"], "room-1");
        assert_eq!(json["user_id"], 3);
        assert_eq!(json["presence"]["permission"], "owner");
    }
}
