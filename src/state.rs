//! Cluster state machine: heartbeat counter, failover gate, sticky error
//! codes.
//!
//! Exactly one state machine exists per cluster. It serializes mutually
//! exclusive operations (bootstrap, failover, switchover, unprovision)
//! behind the non-reentrant failover gate, and accumulates operator-visible
//! error codes keyed by code. Codes are rotated each monitoring tick; a code
//! can be preserved across one rotation so that a cadence-gated check does
//! not drop it.

use crate::error::{RepmanError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Severity of a sticky state entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorLevel {
    Info,
    Warn,
    Err,
}

/// One sticky error code entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StickyState {
    /// Error code, e.g. `ERR00004`.
    pub code: String,
    pub level: ErrorLevel,
    /// Human description, already formatted.
    pub desc: String,
    /// Component that raised the code.
    pub from: String,
    /// Server the code concerns, when applicable.
    pub server_url: Option<String>,
}

/// Cluster-wide state machine.
pub struct StateMachine {
    heartbeats: AtomicU64,
    in_failover: AtomicBool,
    discovered: AtomicBool,
    /// Codes raised in the current tick.
    states: Mutex<BTreeMap<String, StickyState>>,
    /// Codes from the previous tick, kept for failure-time copies.
    old_states: Mutex<BTreeMap<String, StickyState>>,
    /// Codes that survive the next rotation.
    preserved: Mutex<HashSet<String>>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            heartbeats: AtomicU64::new(0),
            in_failover: AtomicBool::new(false),
            discovered: AtomicBool::new(false),
            states: Mutex::new(BTreeMap::new()),
            old_states: Mutex::new(BTreeMap::new()),
            preserved: Mutex::new(HashSet::new()),
        }
    }

    /// Advance the heartbeat counter. Strictly monotonic within one process
    /// lifetime.
    pub fn heartbeat(&self) -> u64 {
        self.heartbeats.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn heartbeats(&self) -> u64 {
        self.heartbeats.load(Ordering::SeqCst)
    }

    /// Acquire the failover gate. Non-reentrant: a second acquisition while
    /// held is an illegal sequence and is rejected.
    pub fn set_failover_state(&self) -> Result<()> {
        if self
            .in_failover
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RepmanError::FailoverInProgress);
        }
        Ok(())
    }

    /// Release the failover gate. Safe to call when not held.
    pub fn remove_failover_state(&self) {
        self.in_failover.store(false, Ordering::SeqCst);
    }

    pub fn is_in_failover(&self) -> bool {
        self.in_failover.load(Ordering::SeqCst)
    }

    pub fn set_discovered(&self) {
        self.discovered.store(true, Ordering::SeqCst);
    }

    pub fn undiscovered(&self) {
        self.discovered.store(false, Ordering::SeqCst);
    }

    pub fn is_discovered(&self) -> bool {
        self.discovered.load(Ordering::SeqCst)
    }

    /// Raise a sticky code for the current tick.
    pub fn set_state(
        &self,
        code: &str,
        level: ErrorLevel,
        from: &str,
        desc: String,
        server_url: Option<String>,
    ) {
        let entry = StickyState {
            code: code.to_string(),
            level,
            desc,
            from: from.to_string(),
            server_url,
        };
        self.states.lock().insert(code.to_string(), entry);
    }

    /// Mark a code to survive the next rotation. Used by cadence-gated
    /// checks that only re-evaluate every N ticks.
    pub fn preserve_state(&self, code: &str) {
        self.preserved.lock().insert(code.to_string());
    }

    /// Copy forward the previous-tick codes for one server. Called when a
    /// probe fails so the cluster view is not cleared mid-failure.
    pub fn copy_old_state_from_unknown_server(&self, url: &str) {
        let old = self.old_states.lock();
        let mut current = self.states.lock();
        for (code, entry) in old.iter() {
            if entry.server_url.as_deref() == Some(url) {
                current.entry(code.clone()).or_insert_with(|| entry.clone());
            }
        }
    }

    /// Rotate sticky codes at the start of a tick: current codes become the
    /// previous set, preserved codes carry over, the preserve marks reset.
    pub fn rotate(&self) {
        // Lock order matches copy_old_state_from_unknown_server.
        let mut old = self.old_states.lock();
        let mut states = self.states.lock();
        let mut preserved = self.preserved.lock();

        let current = std::mem::take(&mut *states);
        for code in preserved.iter() {
            if let Some(entry) = current.get(code) {
                states.insert(code.clone(), entry.clone());
            }
        }
        *old = current;
        preserved.clear();
    }

    /// Snapshot of the codes raised this tick.
    pub fn current_states(&self) -> Vec<StickyState> {
        self.states.lock().values().cloned().collect()
    }

    pub fn has_state(&self, code: &str) -> bool {
        self.states.lock().contains_key(code)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for the failover gate. Every return path of a gated
/// operation releases the gate through this guard.
pub struct FailoverGate {
    sme: std::sync::Arc<StateMachine>,
}

impl FailoverGate {
    pub fn acquire(sme: &std::sync::Arc<StateMachine>) -> Result<Self> {
        sme.set_failover_state()?;
        Ok(Self {
            sme: std::sync::Arc::clone(sme),
        })
    }

    /// Release early, before dependent work that must run outside the gate.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for FailoverGate {
    fn drop(&mut self) {
        self.sme.remove_failover_state();
    }
}

/// Operator-visible error code templates.
pub mod codes {
    pub const ERR00004: &str = "Database %s access denied: %s";
    pub const ERR00014: &str = "Could not get binlog dump threads on %s: %s";
    pub const ERR00073: &str = "Could not get event status on %s";
    pub const ERR00075: &str = "Could not get processlist: %s";
    pub const WARN0085: &str = "Capture mode is on for server %s";
    pub const WARN0088: &str = "High number of slow queries on %s";
    pub const WARN0100: &str = "No space left on device on %s: %s";

    /// Template for an error code, if known.
    pub fn template(code: &str) -> Option<&'static str> {
        match code {
            "ERR00004" => Some(ERR00004),
            "ERR00014" => Some(ERR00014),
            "ERR00073" => Some(ERR00073),
            "ERR00075" => Some(ERR00075),
            "WARN0085" => Some(WARN0085),
            "WARN0088" => Some(WARN0088),
            "WARN0100" => Some(WARN0100),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_monotonic() {
        let sme = StateMachine::new();
        assert_eq!(sme.heartbeats(), 0);
        assert_eq!(sme.heartbeat(), 1);
        assert_eq!(sme.heartbeat(), 2);
        assert_eq!(sme.heartbeats(), 2);
    }

    #[test]
    fn test_failover_gate_non_reentrant() {
        let sme = StateMachine::new();
        assert!(sme.set_failover_state().is_ok());
        assert!(matches!(
            sme.set_failover_state(),
            Err(RepmanError::FailoverInProgress)
        ));
        sme.remove_failover_state();
        assert!(sme.set_failover_state().is_ok());
    }

    #[test]
    fn test_remove_when_not_held_is_safe() {
        let sme = StateMachine::new();
        sme.remove_failover_state();
        assert!(!sme.is_in_failover());
    }

    #[test]
    fn test_rotation_drops_unpreserved_codes() {
        let sme = StateMachine::new();
        sme.set_state("ERR00075", ErrorLevel::Err, "MON", "processlist".into(), None);
        sme.rotate();
        assert!(!sme.has_state("ERR00075"));
    }

    #[test]
    fn test_preserve_survives_one_rotation() {
        let sme = StateMachine::new();
        sme.set_state("ERR00073", ErrorLevel::Err, "MON", "events".into(), None);
        sme.preserve_state("ERR00073");
        sme.rotate();
        assert!(sme.has_state("ERR00073"));
        sme.rotate();
        assert!(!sme.has_state("ERR00073"));
    }

    #[test]
    fn test_copy_old_state_from_unknown_server() {
        let sme = StateMachine::new();
        sme.set_state(
            "WARN0100",
            ErrorLevel::Warn,
            "CONF",
            "disk full".into(),
            Some("db1:3306".to_string()),
        );
        sme.set_state(
            "WARN0088",
            ErrorLevel::Info,
            "MON",
            "slow queries".into(),
            Some("db2:3306".to_string()),
        );
        sme.rotate();
        assert!(!sme.has_state("WARN0100"));

        sme.copy_old_state_from_unknown_server("db1:3306");
        assert!(sme.has_state("WARN0100"));
        // The other server's code was not copied.
        assert!(!sme.has_state("WARN0088"));
    }

    #[test]
    fn test_discovered_flag() {
        let sme = StateMachine::new();
        assert!(!sme.is_discovered());
        sme.set_discovered();
        assert!(sme.is_discovered());
        sme.undiscovered();
        assert!(!sme.is_discovered());
    }

    #[test]
    fn test_code_templates() {
        assert!(codes::template("ERR00004").is_some());
        assert!(codes::template("ERR99999").is_none());
    }

    #[test]
    fn test_failover_gate_guard_releases_on_drop() {
        let sme = std::sync::Arc::new(StateMachine::new());
        {
            let _gate = FailoverGate::acquire(&sme).unwrap();
            assert!(sme.is_in_failover());
            assert!(FailoverGate::acquire(&sme).is_err());
        }
        assert!(!sme.is_in_failover());
    }
}
