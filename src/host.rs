#![forbid(unsafe_code)]

// Authenticated-IP grants for protected deployments.
//
// When host protection is enabled, a successful presenter login grants the
// client IP access to start rooms. The grant is revoked when that presenter's
// connection leaves.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Clone, Default)]
pub struct HostGrants {
    inner: Arc<RwLock<HashMap<String, bool>>>,
}

impl HostGrants {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn authorize(&self, ip: &str) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.insert(ip.to_string(), true);
    }

    pub fn is_authorized(&self, ip: &str) -> bool {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(ip).copied().unwrap_or(false)
    }

    pub fn revoke(&self, ip: &str) -> bool {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.remove(ip).is_some()
    }

    /// True while at least one grant is active.
    pub fn any_active(&self) -> bool {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.values().any(|v| *v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_and_revoke() {
        let grants = HostGrants::new();
        assert!(!grants.is_authorized("10.0.0.1"));

        grants.authorize("10.0.0.1");
        assert!(grants.is_authorized("10.0.0.1"));
        assert!(grants.any_active());

        assert!(grants.revoke("10.0.0.1"));
        assert!(!grants.is_authorized("10.0.0.1"));
        assert!(!grants.any_active());

        // Revoking an absent grant is a no-op
        assert!(!grants.revoke("10.0.0.1"));
    }
}
