use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Retention cap: oldest records are evicted past this.
pub const HISTORY_CAP: usize = 1000;

// ---------------------------------------------------------------------------
// ExecutionRecord
// ---------------------------------------------------------------------------

/// One row per command invocation. Append-only; read-side analytics only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub phase: String,
    pub success: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub fixes_applied: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    pub duration_ms: u64,
}

/// One gate evaluation outcome, kept separately so failure rates can be
/// computed per gate id across all runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateOutcome {
    pub gate_id: String,
    pub passed: bool,
    pub category: String,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// CommandStats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandStats {
    pub command: String,
    pub runs: usize,
    pub successes: usize,
    pub success_rate: f64,
    pub avg_duration_ms: u64,
}

// ---------------------------------------------------------------------------
// ExecutionHistory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionHistory {
    #[serde(default)]
    records: Vec<ExecutionRecord>,
    #[serde(default)]
    gate_outcomes: Vec<GateOutcome>,
}

impl ExecutionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, record: ExecutionRecord) {
        self.records.push(record);
        if self.records.len() > HISTORY_CAP {
            self.records.drain(..self.records.len() - HISTORY_CAP);
        }
    }

    pub fn record_gate(&mut self, gate_id: &str, passed: bool, category: &str) {
        self.gate_outcomes.push(GateOutcome {
            gate_id: gate_id.to_string(),
            passed,
            category: category.to_string(),
            at: Utc::now(),
        });
        if self.gate_outcomes.len() > HISTORY_CAP {
            self.gate_outcomes
                .drain(..self.gate_outcomes.len() - HISTORY_CAP);
        }
    }

    pub fn records(&self) -> &[ExecutionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    // -----------------------------------------------------------------------
    // Analytics
    // -----------------------------------------------------------------------

    /// Overall command success rate; 1.0 when empty.
    pub fn success_rate(&self) -> f64 {
        if self.records.is_empty() {
            return 1.0;
        }
        let ok = self.records.iter().filter(|r| r.success).count();
        ok as f64 / self.records.len() as f64
    }

    /// Per-command aggregates, sorted by command name.
    pub fn command_stats(&self) -> Vec<CommandStats> {
        let mut by_command: BTreeMap<&str, (usize, usize, u64)> = BTreeMap::new();
        for record in &self.records {
            let entry = by_command.entry(&record.command).or_default();
            entry.0 += 1;
            if record.success {
                entry.1 += 1;
            }
            entry.2 += record.duration_ms;
        }
        by_command
            .into_iter()
            .map(|(command, (runs, successes, total_ms))| CommandStats {
                command: command.to_string(),
                runs,
                successes,
                success_rate: successes as f64 / runs as f64,
                avg_duration_ms: total_ms / runs as u64,
            })
            .collect()
    }

    /// The `n` most common error strings across all records, most frequent
    /// first; ties break alphabetically for determinism.
    pub fn common_errors(&self, n: usize) -> Vec<(String, usize)> {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for record in &self.records {
            for error in &record.errors {
                *counts.entry(error).or_default() += 1;
            }
        }
        let mut out: Vec<(String, usize)> = counts
            .into_iter()
            .map(|(e, c)| (e.to_string(), c))
            .collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        out.truncate(n);
        out
    }

    /// Failures ÷ total evaluations for a gate id; 0.0 when never evaluated.
    pub fn gate_failure_rate(&self, gate_id: &str) -> f64 {
        let evals: Vec<&GateOutcome> = self
            .gate_outcomes
            .iter()
            .filter(|o| o.gate_id == gate_id)
            .collect();
        if evals.is_empty() {
            return 0.0;
        }
        let failures = evals.iter().filter(|o| !o.passed).count();
        failures as f64 / evals.len() as f64
    }

    /// Categories seen on failed evaluations of a gate, deduplicated.
    pub fn failure_categories(&self, gate_id: &str) -> Vec<String> {
        let mut cats: Vec<String> = self
            .gate_outcomes
            .iter()
            .filter(|o| o.gate_id == gate_id && !o.passed)
            .map(|o| o.category.clone())
            .collect();
        cats.sort();
        cats.dedup();
        cats
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn record(command: &str, success: bool, duration_ms: u64) -> ExecutionRecord {
        ExecutionRecord {
            command: command.to_string(),
            args: Vec::new(),
            timestamp: Utc::now(),
            phase: "implementation".to_string(),
            success,
            errors: if success {
                Vec::new()
            } else {
                vec!["build failed".to_string()]
            },
            warnings: Vec::new(),
            fixes_applied: Vec::new(),
            suggestions: Vec::new(),
            duration_ms,
        }
    }

    #[test]
    fn append_evicts_past_cap() {
        let mut history = ExecutionHistory::new();
        for i in 0..(HISTORY_CAP + 50) {
            history.append(record(&format!("cmd-{i}"), true, 1));
        }
        assert_eq!(history.len(), HISTORY_CAP);
        // Oldest evicted: first surviving record is cmd-50.
        assert_eq!(history.records()[0].command, "cmd-50");
    }

    #[test]
    fn success_rate_counts_failures() {
        let mut history = ExecutionHistory::new();
        assert_eq!(history.success_rate(), 1.0);
        history.append(record("build", true, 10));
        history.append(record("build", false, 10));
        assert!((history.success_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn command_stats_aggregates() {
        let mut history = ExecutionHistory::new();
        history.append(record("build", true, 100));
        history.append(record("build", false, 300));
        history.append(record("test", true, 50));

        let stats = history.command_stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].command, "build");
        assert_eq!(stats[0].runs, 2);
        assert_eq!(stats[0].avg_duration_ms, 200);
        assert!((stats[0].success_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn common_errors_ranked() {
        let mut history = ExecutionHistory::new();
        for _ in 0..3 {
            history.append(record("build", false, 1));
        }
        let mut odd = record("lint", false, 1);
        odd.errors = vec!["style violation".to_string()];
        history.append(odd);

        let errors = history.common_errors(2);
        assert_eq!(errors[0], ("build failed".to_string(), 3));
        assert_eq!(errors[1], ("style violation".to_string(), 1));
    }

    #[test]
    fn gate_failure_rate_per_gate() {
        let mut history = ExecutionHistory::new();
        for i in 0..10 {
            history.record_gate("x", i >= 4, "missing_file");
        }
        assert!((history.gate_failure_rate("x") - 0.4).abs() < f64::EPSILON);
        assert_eq!(history.gate_failure_rate("never-seen"), 0.0);
        assert_eq!(history.failure_categories("x"), vec!["missing_file"]);
    }
}
