//! Per-host execution statistics (the play recap)

use indexmap::IndexMap;
use serde::Serialize;

use super::task::TaskResult;

/// Counters for one host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HostStats {
    /// Tasks that completed, changed or not
    pub ok: u32,
    pub changed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub unreachable: u32,
    /// Blocks whose failure a rescue recovered
    pub rescued: u32,
    /// Failures tolerated by `ignore_errors`
    pub ignored: u32,
}

impl HostStats {
    /// A host is successful iff nothing failed and it stayed reachable
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.unreachable == 0
    }
}

/// Statistics of every host touched by a run, in first-seen order
#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    hosts: IndexMap<String, HostStats>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure `host` appears in the recap even if nothing ran on it
    pub fn track(&mut self, host: &str) {
        self.hosts.entry(host.to_string()).or_default();
    }

    /// Count a task result.
    ///
    /// With `defer_failure` a failure is left uncounted: a rescue section
    /// either recovers it or fails and is counted itself.
    pub fn record(&mut self, result: &TaskResult, defer_failure: bool) {
        let stats = self.hosts.entry(result.host.clone()).or_default();

        if result.unreachable {
            stats.unreachable += 1;
        } else if result.skipped {
            stats.skipped += 1;
        } else if result.ignored {
            stats.failed += 1;
            stats.ignored += 1;
        } else if result.failed {
            if !defer_failure {
                stats.failed += 1;
            }
        } else {
            stats.ok += 1;
            if result.changed {
                stats.changed += 1;
            }
        }
    }

    /// Count a block recovered by its rescue section
    pub fn record_rescued(&mut self, host: &str) {
        self.hosts.entry(host.to_string()).or_default().rescued += 1;
    }

    pub fn get(&self, host: &str) -> Option<&HostStats> {
        self.hosts.get(host)
    }

    pub fn hosts(&self) -> impl Iterator<Item = (&String, &HostStats)> {
        self.hosts.iter()
    }

    /// Whether every host succeeded
    pub fn is_success(&self) -> bool {
        self.hosts.values().all(HostStats::is_success)
    }

    /// Hosts with failures or unreachable counts
    pub fn failed_hosts(&self) -> Vec<String> {
        self.hosts
            .iter()
            .filter(|(_, s)| !s.is_success())
            .map(|(h, _)| h.clone())
            .collect()
    }
}
