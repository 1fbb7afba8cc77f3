#![forbid(unsafe_code)]

// Presenter election and privilege resolution.
//
// Resolution order, evaluated fresh on every privileged action:
//   1. display name in the static allow-list -> presenter, unconditionally
//   2. first-joiner policy with a record registered for this connection
//   3. an existing record matching the peer's stable uuid (connection id may
//      have changed across a reconnect)
//   4. otherwise not a presenter

use crate::config::PresenterPolicy;
use std::collections::HashMap;
use std::sync::RwLock as StdRwLock;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct PresenterRecord {
    pub name: String,
    pub uuid: String,
}

pub struct PresenterRegistry {
    policy: PresenterPolicy,
    /// room id -> (connection id -> record)
    rooms: StdRwLock<HashMap<String, HashMap<String, PresenterRecord>>>,
}

impl PresenterRegistry {
    pub fn new(policy: PresenterPolicy) -> Self {
        Self {
            policy,
            rooms: StdRwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &PresenterPolicy {
        &self.policy
    }

    /// Registers a presenter record on join where the policy applies: an
    /// allow-listed name always gets a record; otherwise the first peer to
    /// join the room gets one.
    pub fn register_join(&self, room_id: &str, conn_id: &str, name: &str, uuid: &str) {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        let records = rooms.entry(room_id.to_string()).or_default();

        let record = PresenterRecord {
            name: name.to_string(),
            uuid: uuid.to_string(),
        };

        if self.policy.list.iter().any(|n| n == name) {
            records.insert(conn_id.to_string(), record);
        } else if self.policy.join_first && records.is_empty() {
            records.insert(conn_id.to_string(), record);
        }

        debug!("Presenter records for room {}: {}", room_id, records.len());
    }

    /// Registers a record for a presenter asserted by a signed token claim,
    /// so later privileged actions resolve without re-presenting the token.
    pub fn register_claim(&self, room_id: &str, conn_id: &str, name: &str, uuid: &str) {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        let records = rooms.entry(room_id.to_string()).or_default();
        records.insert(
            conn_id.to_string(),
            PresenterRecord {
                name: name.to_string(),
                uuid: uuid.to_string(),
            },
        );
    }

    /// Resolves whether the given peer currently holds presenter privilege.
    pub fn resolve(&self, room_id: &str, conn_id: &str, name: &str, uuid: &str) -> bool {
        if self.policy.list.iter().any(|n| n == name) {
            return true;
        }

        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        let records = match rooms.get(room_id) {
            Some(records) => records,
            None => return false,
        };

        if let Some(record) = records.get(conn_id) {
            return record.name == name && record.uuid == uuid;
        }

        // The connection id changed across a reconnect; match on the stable
        // uuid, never the transient connection id.
        records.values().any(|r| r.uuid == uuid && r.name == name)
    }

    /// Drops all records for a destroyed room.
    pub fn remove_room(&self, room_id: &str) {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        rooms.remove(room_id);
    }

    pub fn record_count(&self, room_id: &str) -> usize {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.get(room_id).map(|r| r.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(list: Vec<&str>, join_first: bool) -> PresenterRegistry {
        PresenterRegistry::new(PresenterPolicy {
            list: list.into_iter().map(String::from).collect(),
            join_first,
        })
    }

    #[test]
    fn first_joiner_becomes_presenter() {
        let reg = registry(vec![], true);
        reg.register_join("r1", "c-bob", "bob", "u-bob");
        reg.register_join("r1", "c-carol", "carol", "u-carol");

        assert!(reg.resolve("r1", "c-bob", "bob", "u-bob"));
        assert!(!reg.resolve("r1", "c-carol", "carol", "u-carol"));
    }

    #[test]
    fn allow_list_overrides_join_order() {
        let reg = registry(vec!["alice"], true);
        reg.register_join("r1", "c-bob", "bob", "u-bob");
        reg.register_join("r1", "c-alice", "alice", "u-alice");

        // alice resolves via the allow-list even though bob joined first
        assert!(reg.resolve("r1", "c-alice", "alice", "u-alice"));
        // bob keeps his first-joiner record
        assert!(reg.resolve("r1", "c-bob", "bob", "u-bob"));
    }

    #[test]
    fn reconnect_matches_on_stable_uuid() {
        let reg = registry(vec![], true);
        reg.register_join("r1", "c-old", "bob", "u-bob");

        // Same uuid, brand-new connection id
        assert!(reg.resolve("r1", "c-new", "bob", "u-bob"));
        // Different uuid claiming the same name is refused
        assert!(!reg.resolve("r1", "c-new", "bob", "u-impostor"));
    }

    #[test]
    fn no_privilege_without_join_first_or_list() {
        let reg = registry(vec![], false);
        reg.register_join("r1", "c-bob", "bob", "u-bob");
        assert!(!reg.resolve("r1", "c-bob", "bob", "u-bob"));
    }

    #[test]
    fn token_claim_registers_durable_record() {
        let reg = registry(vec![], false);
        reg.register_claim("r1", "c-tok", "eve", "u-eve");

        assert!(reg.resolve("r1", "c-tok", "eve", "u-eve"));
        // Still resolves after a reconnect under a new connection id
        assert!(reg.resolve("r1", "c-new", "eve", "u-eve"));
    }

    #[test]
    fn room_destruction_clears_records() {
        let reg = registry(vec![], true);
        reg.register_join("r1", "c-bob", "bob", "u-bob");
        assert_eq!(reg.record_count("r1"), 1);

        reg.remove_room("r1");
        assert_eq!(reg.record_count("r1"), 0);
        assert!(!reg.resolve("r1", "c-bob", "bob", "u-bob"));
    }
}
