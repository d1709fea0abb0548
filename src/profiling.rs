//! Router reliability profiles
//!
//! The builder records how path builds through each router went and skips
//! routers whose record is poor. The scoring here is deliberately coarse:
//! a router is bad for paths once it has enough attempts on record and
//! under a quarter of them succeeded.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;

use crate::contact::RouterId;

/// Minimum attempts before a record can disqualify a router
const MIN_ATTEMPTS: u64 = 10;

/// Success ratio below which a router is bad for paths
const MIN_GOOD_RATIO: f64 = 0.25;

/// Per-hop reliability bookkeeping consumed by hop selection
pub trait RouterProfile: Send + Sync {
    /// Record a successful build through these hops
    fn mark_success(&self, hops: &[RouterId]);

    /// Record a failed build through these hops
    fn mark_failure(&self, hops: &[RouterId]);

    /// Record a timed-out build through these hops
    fn mark_timeout(&self, hops: &[RouterId]);

    /// Whether this router should be skipped during hop selection
    fn is_bad_for_path(&self, id: &RouterId) -> bool;
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
struct ProfileRecord {
    success: u64,
    fail: u64,
    timeout: u64,
}

impl ProfileRecord {
    fn attempts(&self) -> u64 {
        self.success + self.fail + self.timeout
    }

    fn bad(&self) -> bool {
        let attempts = self.attempts();
        attempts >= MIN_ATTEMPTS && (self.success as f64 / attempts as f64) < MIN_GOOD_RATIO
    }
}

/// In-memory reliability profile
#[derive(Default)]
pub struct MemRouterProfile {
    records: Mutex<HashMap<RouterId, ProfileRecord>>,
}

impl MemRouterProfile {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, hops: &[RouterId], apply: impl Fn(&mut ProfileRecord)) {
        let mut records = self.records.lock();
        for hop in hops {
            apply(records.entry(*hop).or_default());
        }
    }
}

impl RouterProfile for MemRouterProfile {
    fn mark_success(&self, hops: &[RouterId]) {
        self.update(hops, |r| r.success += 1);
    }

    fn mark_failure(&self, hops: &[RouterId]) {
        self.update(hops, |r| r.fail += 1);
    }

    fn mark_timeout(&self, hops: &[RouterId]) {
        self.update(hops, |r| r.timeout += 1);
    }

    fn is_bad_for_path(&self, id: &RouterId) -> bool {
        self.records
            .lock()
            .get(id)
            .map(|r| r.bad())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(b: u8) -> RouterId {
        RouterId([b; 32])
    }

    #[test]
    fn test_unknown_router_is_fine() {
        let profile = MemRouterProfile::new();
        assert!(!profile.is_bad_for_path(&id(1)));
    }

    #[test]
    fn test_needs_enough_attempts_to_go_bad() {
        let profile = MemRouterProfile::new();
        let hops = [id(1)];
        for _ in 0..MIN_ATTEMPTS - 1 {
            profile.mark_failure(&hops);
        }
        assert!(!profile.is_bad_for_path(&id(1)));
        profile.mark_failure(&hops);
        assert!(profile.is_bad_for_path(&id(1)));
    }

    #[test]
    fn test_successes_keep_router_good() {
        let profile = MemRouterProfile::new();
        let hops = [id(2)];
        for _ in 0..20 {
            profile.mark_success(&hops);
        }
        for _ in 0..20 {
            profile.mark_timeout(&hops);
        }
        // 50% success is comfortably above the threshold
        assert!(!profile.is_bad_for_path(&id(2)));
    }
}
