use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::protocol::{ConnectionId, Role};

// ---------------------------------------------------------------------------
// Group
// ---------------------------------------------------------------------------

/// One viewer slot plus any number of publishers.
#[derive(Debug, Default)]
struct Group {
    viewer: Option<Member>,
    publishers: HashMap<ConnectionId, Option<String>>,
}

#[derive(Debug, Clone)]
struct Member {
    connection_id: ConnectionId,
    peer_id: Option<String>,
}

impl Group {
    fn is_empty(&self) -> bool {
        self.viewer.is_none() && self.publishers.is_empty()
    }

    fn viewer_id(&self) -> Option<&ConnectionId> {
        self.viewer.as_ref().map(|m| &m.connection_id)
    }

    fn holds(&self, connection_id: &ConnectionId) -> bool {
        self.viewer_id() == Some(connection_id) || self.publishers.contains_key(connection_id)
    }
}

// ---------------------------------------------------------------------------
// Departure
// ---------------------------------------------------------------------------

/// A role a connection held when it was removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub group_key: String,
    pub role: Role,
    pub peer_id: Option<String>,
    /// Viewer of the group right after the removal, if one is still there.
    pub viewer: Option<ConnectionId>,
}

// ---------------------------------------------------------------------------
// GroupInfo  (serialisable snapshot for the inspection API)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GroupInfo {
    pub group_key: String,
    pub has_viewer: bool,
    pub publisher_count: usize,
}

// ---------------------------------------------------------------------------
// SessionRegistry
// ---------------------------------------------------------------------------

/// In-memory table of groups keyed by group key.
///
/// All access goes through one mutex.  Messages are small and the critical
/// sections never await, so contention stays negligible.  A group that ends
/// up with neither a viewer nor publishers is dropped in the same critical
/// section that emptied it.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    groups: Mutex<HashMap<String, Group>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Group>> {
        self.groups.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `connection_id` under `group_key`.
    ///
    /// A viewer join replaces whatever viewer was there before.  The displaced
    /// connection is not told.
    pub fn join(
        &self,
        group_key: &str,
        role: Role,
        connection_id: &ConnectionId,
        peer_id: Option<String>,
    ) {
        let mut groups = self.lock();
        let group = groups.entry(group_key.to_string()).or_default();
        match role {
            Role::Viewer => {
                group.viewer = Some(Member {
                    connection_id: connection_id.clone(),
                    peer_id,
                });
            }
            Role::Publisher => {
                group.publishers.insert(connection_id.clone(), peer_id);
            }
        }
    }

    /// Connection to address when a sender targets "the `role`" of a group
    /// without knowing its identity.  Only the viewer is addressable that way.
    pub fn route_target_for(&self, group_key: &str, role: Role) -> Option<ConnectionId> {
        match role {
            Role::Viewer => self.lock().get(group_key).and_then(|g| g.viewer_id().cloned()),
            Role::Publisher => None,
        }
    }

    /// Whether `connection_id` currently holds `role` in `group_key`.
    pub fn is_member_as(&self, group_key: &str, role: Role, connection_id: &ConnectionId) -> bool {
        let groups = self.lock();
        let Some(group) = groups.get(group_key) else {
            return false;
        };
        match role {
            Role::Viewer => group.viewer_id() == Some(connection_id),
            Role::Publisher => group.publishers.contains_key(connection_id),
        }
    }

    /// Whether `connection_id` holds any role in `group_key`.
    pub fn is_member(&self, group_key: &str, connection_id: &ConnectionId) -> bool {
        self.lock()
            .get(group_key)
            .is_some_and(|group| group.holds(connection_id))
    }

    /// Application-level peer id a member registered with.
    pub fn peer_id_of(&self, group_key: &str, connection_id: &ConnectionId) -> Option<String> {
        let groups = self.lock();
        let group = groups.get(group_key)?;
        if let Some(peer_id) = group.publishers.get(connection_id) {
            return peer_id.clone();
        }
        group
            .viewer
            .as_ref()
            .filter(|m| &m.connection_id == connection_id)
            .and_then(|m| m.peer_id.clone())
    }

    /// Whether some publisher connection in `group_key` registered `peer_id`.
    pub fn has_publisher_peer(&self, group_key: &str, peer_id: &str) -> bool {
        self.lock().get(group_key).is_some_and(|group| {
            group
                .publishers
                .values()
                .any(|registered| registered.as_deref() == Some(peer_id))
        })
    }

    /// Drop `connection_id` from every group it appears in.
    ///
    /// Returns one [`Departure`] per role cleared.  Groups left empty are
    /// deleted before the lock is released.
    pub fn remove(&self, connection_id: &ConnectionId) -> Vec<Departure> {
        let mut groups = self.lock();
        let mut departures = Vec::new();

        for (group_key, group) in groups.iter_mut() {
            if group.viewer_id() == Some(connection_id) {
                let member = group.viewer.take();
                departures.push(Departure {
                    group_key: group_key.clone(),
                    role: Role::Viewer,
                    peer_id: member.and_then(|m| m.peer_id),
                    viewer: None,
                });
            }
            if let Some(peer_id) = group.publishers.remove(connection_id) {
                departures.push(Departure {
                    group_key: group_key.clone(),
                    role: Role::Publisher,
                    peer_id,
                    viewer: group.viewer_id().cloned(),
                });
            }
        }

        groups.retain(|_, group| !group.is_empty());
        departures
    }

    /// Snapshot of one group.
    pub fn group(&self, group_key: &str) -> Option<GroupInfo> {
        self.lock().get(group_key).map(|g| GroupInfo {
            group_key: group_key.to_string(),
            has_viewer: g.viewer.is_some(),
            publisher_count: g.publishers.len(),
        })
    }

    /// Snapshot of every group, sorted by key.
    pub fn groups(&self) -> Vec<GroupInfo> {
        let groups = self.lock();
        let mut infos: Vec<GroupInfo> = groups
            .iter()
            .map(|(key, g)| GroupInfo {
                group_key: key.clone(),
                has_viewer: g.viewer.is_some(),
                publisher_count: g.publishers.len(),
            })
            .collect();
        infos.sort_by(|a, b| a.group_key.cmp(&b.group_key));
        infos
    }

    pub fn group_count(&self) -> usize {
        self.lock().len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::from(id)
    }

    #[test]
    fn groups_are_created_lazily_and_removed_when_empty() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.group_count(), 0);

        registry.join("team1", Role::Viewer, &conn("v"), None);
        registry.join("team1", Role::Publisher, &conn("p1"), Some("e1".into()));
        assert_eq!(registry.group_count(), 1);

        registry.remove(&conn("p1"));
        assert_eq!(registry.group_count(), 1, "viewer still holds the group");

        registry.remove(&conn("v"));
        assert_eq!(registry.group_count(), 0);
        assert!(registry.group("team1").is_none());
    }

    #[test]
    fn no_empty_group_survives_any_join_leave_sequence() {
        let registry = SessionRegistry::new();
        let ids: Vec<ConnectionId> = (0..6).map(|i| conn(&format!("c{i}"))).collect();
        let groups = ["a", "b", "c"];

        // Deterministic pseudo-random walk over joins and removals.
        let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
        for _ in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let id = &ids[(seed % ids.len() as u64) as usize];
            let group = groups[((seed >> 8) % groups.len() as u64) as usize];
            match (seed >> 16) % 3 {
                0 => registry.join(group, Role::Viewer, id, None),
                1 => registry.join(group, Role::Publisher, id, Some(id.to_string())),
                _ => {
                    registry.remove(id);
                }
            }

            for info in registry.groups() {
                assert!(
                    info.has_viewer || info.publisher_count > 0,
                    "empty group {} retained",
                    info.group_key
                );
            }
        }

        for id in &ids {
            registry.remove(id);
        }
        assert_eq!(registry.group_count(), 0);
    }

    #[test]
    fn second_viewer_overwrites_first() {
        let registry = SessionRegistry::new();
        registry.join("team1", Role::Viewer, &conn("v1"), None);
        registry.join("team1", Role::Viewer, &conn("v2"), None);

        assert_eq!(
            registry.route_target_for("team1", Role::Viewer),
            Some(conn("v2"))
        );
        assert!(!registry.is_member("team1", &conn("v1")));

        // Removing the displaced viewer leaves the new one untouched.
        assert!(registry.remove(&conn("v1")).is_empty());
        assert_eq!(
            registry.route_target_for("team1", Role::Viewer),
            Some(conn("v2"))
        );
    }

    #[test]
    fn remove_reports_publisher_departures_with_current_viewer() {
        let registry = SessionRegistry::new();
        registry.join("team1", Role::Viewer, &conn("v"), Some("manager1".into()));
        registry.join("team1", Role::Publisher, &conn("p1"), Some("e1".into()));
        registry.join("team2", Role::Publisher, &conn("p1"), Some("e1".into()));

        let mut departures = registry.remove(&conn("p1"));
        departures.sort_by(|a, b| a.group_key.cmp(&b.group_key));

        assert_eq!(
            departures,
            vec![
                Departure {
                    group_key: "team1".into(),
                    role: Role::Publisher,
                    peer_id: Some("e1".into()),
                    viewer: Some(conn("v")),
                },
                Departure {
                    group_key: "team2".into(),
                    role: Role::Publisher,
                    peer_id: Some("e1".into()),
                    viewer: None,
                },
            ]
        );
        assert!(registry.group("team2").is_none());
    }

    #[test]
    fn membership_checks_respect_role() {
        let registry = SessionRegistry::new();
        registry.join("team1", Role::Publisher, &conn("p1"), Some("e1".into()));

        assert!(registry.is_member_as("team1", Role::Publisher, &conn("p1")));
        assert!(!registry.is_member_as("team1", Role::Viewer, &conn("p1")));
        assert!(!registry.is_member("team2", &conn("p1")));
        assert_eq!(registry.peer_id_of("team1", &conn("p1")).as_deref(), Some("e1"));
        assert_eq!(registry.route_target_for("team1", Role::Viewer), None);
        assert_eq!(registry.route_target_for("team1", Role::Publisher), None);
    }

    #[test]
    fn publisher_peer_lookup_sees_a_replacement_connection() {
        let registry = SessionRegistry::new();
        registry.join("team1", Role::Publisher, &conn("old"), Some("e1".into()));
        registry.join("team1", Role::Publisher, &conn("new"), Some("e1".into()));

        registry.remove(&conn("old"));
        assert!(registry.has_publisher_peer("team1", "e1"));

        registry.remove(&conn("new"));
        assert!(!registry.has_publisher_peer("team1", "e1"));
        assert!(!registry.has_publisher_peer("team2", "e1"));
    }
}
