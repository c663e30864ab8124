//! Presence scenarios: join/leave/kick, palette recycling, monotonic
//! activity timestamps.

use apex_core::presence::{COLOR_PALETTE, Permission, PresenceManager};
use std::collections::HashSet;
use std::sync::Arc;

#[test]
fn join_leave_kick_scenario() {
    let manager = PresenceManager::new();
    let alice = 1u64;
    let bob = 2u64;
    let carol = 3u64;

    manager.join("R", alice, "alice", Permission::Owner);
    manager.join("R", bob, "bob", Permission::Editor);
    manager.join("R", carol, "carol", Permission::Viewer);

    let entries = manager.get_room_presence("R");
    assert_eq!(entries.len(), 3);
    let colors: HashSet<_> = entries.iter().map(|e| e.color.as_str()).collect();
    assert_eq!(colors.len(), 3, "colors must be distinct");
    for entry in &entries {
        assert!(COLOR_PALETTE.contains(&entry.color.as_str()));
    }

    // bob is an editor: no kick authority.
    assert!(!manager.kick_user("R", bob, carol));
    // alice owns the room.
    assert!(manager.kick_user("R", alice, carol));
    assert_eq!(manager.get_room_presence("R").len(), 2);
}

#[test]
fn palette_recycles_after_full_drain() {
    let manager = PresenceManager::new();
    let first_wave: Vec<String> = (0..5u64)
        .map(|u| manager.join("R", u, "user", Permission::Editor).color)
        .collect();

    for u in 0..5u64 {
        manager.leave("R", u);
    }

    let second_wave: Vec<String> = (10..15u64)
        .map(|u| manager.join("R", u, "user", Permission::Editor).color)
        .collect();

    // Same palette positions, starting at 0 again.
    assert_eq!(first_wave, second_wave);
    assert_eq!(first_wave[0], COLOR_PALETTE[0]);
}

#[test]
fn concurrent_updates_keep_timestamps_monotonic() {
    let manager = Arc::new(PresenceManager::new());
    manager.join("R", 1, "alice", Permission::Editor);

    let mut handles = Vec::new();
    for t in 0..4 {
        let manager = Arc::clone(&manager);
        handles.push(std::thread::spawn(move || {
            for i in 0..200u32 {
                manager.update_cursor("R", 1, i, t);
            }
        }));
    }

    // A reader polling the entry must never observe time going backwards.
    let reader = {
        let manager = Arc::clone(&manager);
        std::thread::spawn(move || {
            let mut last = manager.get_user("R", 1).unwrap().last_activity;
            for _ in 0..500 {
                let now = manager.get_user("R", 1).unwrap().last_activity;
                assert!(now >= last);
                last = now;
            }
        })
    };

    for handle in handles {
        handle.join().unwrap();
    }
    reader.join().unwrap();
}

#[test]
fn cleanup_reports_removed_pairs() {
    let manager = PresenceManager::new();
    manager.join("R", 1, "alice", Permission::Editor);
    manager.join("S", 2, "bob", Permission::Editor);

    std::thread::sleep(std::time::Duration::from_millis(5));
    let mut removed = manager.cleanup(std::time::Duration::from_millis(1));
    removed.sort();

    assert_eq!(removed, vec![("R".to_string(), 1), ("S".to_string(), 2)]);
    assert!(manager.get_room_presence("R").is_empty());
    assert_eq!(manager.room_count(), 0);
}
