use crate::context::GateContext;
use crate::error::{Result, WardenError};
use crate::events::{Event, EventBus};
use crate::gate::{GateResult, GateType, Severity};
use crate::history::ExecutionHistory;
use crate::patterns::{
    decompose_suggestion, derive_suggestions, result_category, ImprovementPattern,
    ImprovementSuggestion,
};
use crate::registry::GateRegistry;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// ExecutorOptions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorOptions {
    /// Invoke registered auto-fix routines between failed attempts.
    #[serde(default = "default_auto_fix")]
    pub auto_fix: bool,
    /// Maximum attempts per gate (the first attempt counts).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay between an auto-fix and the re-evaluation.
    #[serde(default)]
    pub retry_delay_ms: u64,
    /// Per-attempt time box. An over-time attempt is a failed attempt, not
    /// a crash; the predicate's own work is not aborted.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// A failed `warning`-severity gate does not block when set.
    #[serde(default = "default_continue_on_warning")]
    pub continue_on_warning: bool,
    /// Exhausted-retries pre-execution failures become hard stops.
    #[serde(default)]
    pub fail_fast: bool,
}

fn default_auto_fix() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_continue_on_warning() -> bool {
    true
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            auto_fix: default_auto_fix(),
            max_retries: default_max_retries(),
            retry_delay_ms: 0,
            timeout_ms: default_timeout_ms(),
            continue_on_warning: default_continue_on_warning(),
            fail_fast: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Attempt state machine
// ---------------------------------------------------------------------------

/// Lifecycle of one gate attempt. Modeled explicitly so the engine works the
/// same under an event loop, threads, or plain sequential execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Scheduled,
    Running,
    Passed,
    Failed,
    TimedOut,
    Retrying,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateAttempt {
    /// 1-indexed attempt number.
    pub number: u32,
    pub state: AttemptState,
    #[serde(default)]
    pub errors: Vec<String>,
    pub duration_ms: u64,
    /// True if an auto-fix ran after this attempt failed.
    #[serde(default)]
    pub fix_applied: bool,
}

// ---------------------------------------------------------------------------
// GateExecution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Passed,
    /// Failed, but non-blocking (warning/info severity, or continue-on-warning).
    Warning,
    Failed,
    /// Gate disabled; never evaluated.
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateExecution {
    pub gate_id: String,
    pub outcome: ExecutionOutcome,
    pub attempts: Vec<GateAttempt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<GateResult>,
}

impl GateExecution {
    pub fn fix_applied(&self) -> bool {
        self.attempts.iter().any(|a| a.fix_applied)
    }

    pub fn blocking_failure(&self) -> bool {
        self.outcome == ExecutionOutcome::Failed
    }
}

// ---------------------------------------------------------------------------
// ValidationSummary / PhaseRunReport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub warnings: usize,
    pub skipped: usize,
    pub fixed_automatically: usize,
    pub success_rate: f64,
}

impl ValidationSummary {
    pub fn from_executions(executions: &[GateExecution]) -> Self {
        let total = executions.len();
        let passed = executions
            .iter()
            .filter(|e| e.outcome == ExecutionOutcome::Passed)
            .count();
        let failed = executions
            .iter()
            .filter(|e| e.outcome == ExecutionOutcome::Failed)
            .count();
        let warnings = executions
            .iter()
            .filter(|e| e.outcome == ExecutionOutcome::Warning)
            .count();
        let skipped = executions
            .iter()
            .filter(|e| e.outcome == ExecutionOutcome::Skipped)
            .count();
        let fixed_automatically = executions.iter().filter(|e| e.fix_applied()).count();
        let evaluated = total - skipped;
        let success_rate = if evaluated == 0 {
            1.0
        } else {
            passed as f64 / evaluated as f64
        };
        Self {
            total,
            passed,
            failed,
            warnings,
            skipped,
            fixed_automatically,
            success_rate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRunReport {
    pub phase: String,
    pub summary: ValidationSummary,
    pub executions: Vec<GateExecution>,
    pub suggestions: Vec<ImprovementSuggestion>,
}

// ---------------------------------------------------------------------------
// ValidationExecutor
// ---------------------------------------------------------------------------

/// Orchestrates gate execution around the registry: retries with auto-fix,
/// per-attempt time boxes, continuous-gate deferral, and suggestion mining.
pub struct ValidationExecutor {
    pub options: ExecutorOptions,
    patterns: Vec<ImprovementPattern>,
    learning: bool,
    /// Continuous gates queued for deferred evaluation; results surface via
    /// the event bus and history only.
    continuous: Vec<(String, GateContext)>,
}

impl ValidationExecutor {
    pub fn new(options: ExecutorOptions) -> Self {
        Self {
            options,
            patterns: crate::patterns::default_patterns(),
            learning: true,
            continuous: Vec::new(),
        }
    }

    pub fn with_patterns(mut self, patterns: Vec<ImprovementPattern>) -> Self {
        self.patterns = patterns;
        self
    }

    /// Toggle suggestion mining. When off, phase reports carry no
    /// improvement suggestions.
    pub fn with_learning(mut self, enabled: bool) -> Self {
        self.learning = enabled;
        self
    }

    pub fn pending_continuous(&self) -> usize {
        self.continuous.len()
    }

    /// Run one gate with the retry/auto-fix/timeout machinery.
    pub fn run_gate(
        &self,
        registry: &mut GateRegistry,
        history: &mut ExecutionHistory,
        bus: &EventBus,
        gate_id: &str,
        ctx: &GateContext,
    ) -> Result<GateExecution> {
        let gate = registry
            .gate(gate_id)
            .ok_or_else(|| WardenError::GateNotFound(gate_id.to_string()))?;
        if !gate.enabled {
            return Ok(GateExecution {
                gate_id: gate_id.to_string(),
                outcome: ExecutionOutcome::Skipped,
                attempts: Vec::new(),
                result: None,
            });
        }
        let severity = gate.severity;
        let max_attempts = self.options.max_retries.max(1);

        let mut attempts: Vec<GateAttempt> = Vec::new();
        let mut final_result: Option<GateResult> = None;
        let mut fix_ran = false;

        for number in 1..=max_attempts {
            let mut attempt = GateAttempt {
                number,
                state: AttemptState::Scheduled,
                errors: Vec::new(),
                duration_ms: 0,
                fix_applied: false,
            };
            attempt.state = AttemptState::Running;
            let started = Instant::now();
            let mut result = registry.validate_gate(gate_id, ctx)?;
            let elapsed = started.elapsed().as_millis() as u64;
            attempt.duration_ms = elapsed;

            if elapsed > self.options.timeout_ms {
                // Over-time: the work already ran, but the result is
                // discarded and the attempt scored as timed out.
                let timeout = WardenError::Timeout {
                    gate: gate_id.to_string(),
                    attempt: number,
                    limit_ms: self.options.timeout_ms,
                };
                result = GateResult::failed(gate_id, severity, vec![timeout.to_string()]);
                attempt.state = AttemptState::TimedOut;
            } else if result.passed {
                attempt.state = AttemptState::Passed;
            } else {
                attempt.state = AttemptState::Failed;
            }
            attempt.errors = result.errors.clone();
            history.record_gate(gate_id, result.passed, result_category(&result));
            bus.publish(&Event::GateEvaluated {
                result: result.clone(),
            });

            if result.passed {
                bus.publish(&Event::GatePassed {
                    gate_id: gate_id.to_string(),
                });
                let mut result = result;
                result.fix_applied = fix_ran;
                attempts.push(attempt);
                final_result = Some(result);
                break;
            }
            bus.publish(&Event::GateFailed {
                gate_id: gate_id.to_string(),
                errors: result.errors.clone(),
            });

            let can_retry = number < max_attempts
                && self.options.auto_fix
                && registry.has_fixer(gate_id);
            if can_retry {
                let fixed = registry.run_fix(gate_id, ctx).unwrap_or(false);
                attempt.fix_applied = fixed;
                if fixed {
                    fix_ran = true;
                    bus.publish(&Event::GateFixed {
                        gate_id: gate_id.to_string(),
                        attempt: number,
                    });
                    attempt.state = AttemptState::Retrying;
                    attempts.push(attempt);
                    if self.options.retry_delay_ms > 0 {
                        std::thread::sleep(Duration::from_millis(self.options.retry_delay_ms));
                    }
                    continue;
                }
                // Fixer declined: re-evaluating would change nothing.
            }
            attempts.push(attempt);
            final_result = Some(result);
            break;
        }

        let result = final_result.expect("at least one attempt ran");
        let outcome = if result.passed {
            ExecutionOutcome::Passed
        } else {
            match severity {
                Severity::Error => ExecutionOutcome::Failed,
                Severity::Warning if self.options.continue_on_warning => {
                    ExecutionOutcome::Warning
                }
                Severity::Warning => ExecutionOutcome::Failed,
                Severity::Info => ExecutionOutcome::Warning,
            }
        };
        tracing::debug!(gate = gate_id, ?outcome, attempts = attempts.len(), "gate execution finished");

        Ok(GateExecution {
            gate_id: gate_id.to_string(),
            outcome,
            attempts,
            result: Some(result),
        })
    }

    /// Run all gates of `gate_type` for a phase, sequentially in id order.
    /// Continuous gates are queued instead of evaluated.
    pub fn run_stage(
        &mut self,
        registry: &mut GateRegistry,
        history: &mut ExecutionHistory,
        bus: &EventBus,
        phase: &str,
        ctx: &GateContext,
        gate_type: GateType,
    ) -> Result<Vec<GateExecution>> {
        let ids: Vec<String> = registry
            .gates_for_phase(phase)
            .iter()
            .filter(|g| g.gate_type == gate_type)
            .map(|g| g.id.clone())
            .collect();

        if gate_type == GateType::Continuous {
            for id in ids {
                self.continuous.push((id, ctx.clone()));
            }
            return Ok(Vec::new());
        }

        let mut executions = Vec::new();
        for id in ids {
            executions.push(self.run_gate(registry, history, bus, &id, ctx)?);
        }
        Ok(executions)
    }

    /// Evaluate queued continuous gates. Their outcomes are published on the
    /// bus (`gate:continuous:completed`) and recorded in history; nothing is
    /// returned to block on.
    pub fn drain_continuous(
        &mut self,
        registry: &mut GateRegistry,
        history: &mut ExecutionHistory,
        bus: &EventBus,
    ) -> usize {
        let queued = std::mem::take(&mut self.continuous);
        let count = queued.len();
        for (id, ctx) in queued {
            match self.run_gate(registry, history, bus, &id, &ctx) {
                Ok(execution) => {
                    if let Some(result) = execution.result {
                        bus.publish(&Event::ContinuousGateCompleted { result });
                    }
                }
                Err(e) => tracing::warn!(gate = %id, error = %e, "continuous gate dropped"),
            }
        }
        count
    }

    /// Full phase validation: pre- and post-execution gates evaluated,
    /// continuous gates queued, summary computed, suggestions mined.
    pub fn run_phase(
        &mut self,
        registry: &mut GateRegistry,
        history: &mut ExecutionHistory,
        bus: &EventBus,
        phase: &str,
        ctx: &GateContext,
    ) -> Result<PhaseRunReport> {
        let mut executions =
            self.run_stage(registry, history, bus, phase, ctx, GateType::PreExecution)?;
        executions.extend(self.run_stage(
            registry,
            history,
            bus,
            phase,
            ctx,
            GateType::PostExecution,
        )?);
        self.run_stage(registry, history, bus, phase, ctx, GateType::Continuous)?;

        let summary = ValidationSummary::from_executions(&executions);
        let failed: Vec<&GateResult> = executions
            .iter()
            .filter(|e| e.blocking_failure() || e.outcome == ExecutionOutcome::Warning)
            .filter_map(|e| e.result.as_ref())
            .filter(|r| !r.passed)
            .collect();
        let mut suggestions = if self.learning {
            derive_suggestions(&failed, history, &self.patterns)
        } else {
            Vec::new()
        };
        if self.learning && summary.success_rate < 0.8 {
            suggestions.push(decompose_suggestion(phase, summary.success_rate));
        }

        Ok(PhaseRunReport {
            phase: phase.to_string(),
            summary,
            executions,
            suggestions,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::{GateRequirements, ValidationGate};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn fixture() -> (GateRegistry, ExecutionHistory, EventBus) {
        (
            GateRegistry::in_memory(),
            ExecutionHistory::new(),
            EventBus::new(),
        )
    }

    fn condition_gate(id: &str, condition: &str) -> ValidationGate {
        ValidationGate::new(id, GateType::PreExecution).with_requirements(GateRequirements {
            conditions: vec![condition.to_string()],
            ..GateRequirements::default()
        })
    }

    #[test]
    fn passing_gate_single_attempt() {
        let (mut reg, mut history, bus) = fixture();
        reg.register_gate(ValidationGate::new("ok", GateType::PreExecution))
            .unwrap();
        let executor = ValidationExecutor::new(ExecutorOptions::default());
        let execution = executor
            .run_gate(&mut reg, &mut history, &bus, "ok", &GateContext::for_phase("p"))
            .unwrap();
        assert_eq!(execution.outcome, ExecutionOutcome::Passed);
        assert_eq!(execution.attempts.len(), 1);
        assert_eq!(execution.attempts[0].state, AttemptState::Passed);
    }

    #[test]
    fn auto_fix_retries_until_pass() {
        let (mut reg, mut history, bus) = fixture();
        reg.register_gate(condition_gate("flaky", "ready")).unwrap();

        // Condition passes only after the fixer flips the flag.
        let flag = Rc::new(RefCell::new(false));
        let read = flag.clone();
        reg.register_condition("ready", Box::new(move |_| Ok(*read.borrow())));
        let write = flag.clone();
        reg.register_fixer(
            "flaky",
            Box::new(move |_| {
                *write.borrow_mut() = true;
                true
            }),
        )
        .unwrap();

        let executor = ValidationExecutor::new(ExecutorOptions::default());
        let execution = executor
            .run_gate(&mut reg, &mut history, &bus, "flaky", &GateContext::for_phase("p"))
            .unwrap();
        assert_eq!(execution.outcome, ExecutionOutcome::Passed);
        assert_eq!(execution.attempts.len(), 2);
        assert_eq!(execution.attempts[0].state, AttemptState::Retrying);
        assert!(execution.attempts[0].fix_applied);
        assert!(execution.result.unwrap().fix_applied);
    }

    #[test]
    fn retry_loop_never_exceeds_max_retries() {
        let (mut reg, mut history, bus) = fixture();
        reg.register_gate(condition_gate("never", "always-false"))
            .unwrap();
        reg.register_condition("always-false", Box::new(|_| Ok(false)));
        // A fixer that claims success but fixes nothing.
        reg.register_fixer("never", Box::new(|_| true)).unwrap();

        let executor = ValidationExecutor::new(ExecutorOptions {
            max_retries: 3,
            ..ExecutorOptions::default()
        });
        let execution = executor
            .run_gate(&mut reg, &mut history, &bus, "never", &GateContext::for_phase("p"))
            .unwrap();
        assert_eq!(execution.outcome, ExecutionOutcome::Failed);
        assert_eq!(execution.attempts.len(), 3);
        assert_eq!(execution.attempts.last().unwrap().state, AttemptState::Failed);
    }

    #[test]
    fn no_fixer_means_single_attempt() {
        let (mut reg, mut history, bus) = fixture();
        reg.register_gate(condition_gate("plain", "always-false"))
            .unwrap();
        reg.register_condition("always-false", Box::new(|_| Ok(false)));

        let executor = ValidationExecutor::new(ExecutorOptions::default());
        let execution = executor
            .run_gate(&mut reg, &mut history, &bus, "plain", &GateContext::for_phase("p"))
            .unwrap();
        assert_eq!(execution.attempts.len(), 1);
        assert_eq!(execution.outcome, ExecutionOutcome::Failed);
    }

    #[test]
    fn warning_severity_downgrades_failure() {
        let (mut reg, mut history, bus) = fixture();
        reg.register_gate(
            condition_gate("advisory", "always-false").with_severity(Severity::Warning),
        )
        .unwrap();
        reg.register_condition("always-false", Box::new(|_| Ok(false)));

        let executor = ValidationExecutor::new(ExecutorOptions::default());
        let execution = executor
            .run_gate(&mut reg, &mut history, &bus, "advisory", &GateContext::for_phase("p"))
            .unwrap();
        assert_eq!(execution.outcome, ExecutionOutcome::Warning);

        // With continue_on_warning off the same failure blocks.
        let strict = ValidationExecutor::new(ExecutorOptions {
            continue_on_warning: false,
            ..ExecutorOptions::default()
        });
        let execution = strict
            .run_gate(&mut reg, &mut history, &bus, "advisory", &GateContext::for_phase("p"))
            .unwrap();
        assert_eq!(execution.outcome, ExecutionOutcome::Failed);
    }

    #[test]
    fn disabled_gate_is_skipped() {
        let (mut reg, mut history, bus) = fixture();
        let mut gate = ValidationGate::new("off", GateType::PreExecution);
        gate.enabled = false;
        reg.register_gate(gate).unwrap();

        let executor = ValidationExecutor::new(ExecutorOptions::default());
        let execution = executor
            .run_gate(&mut reg, &mut history, &bus, "off", &GateContext::for_phase("p"))
            .unwrap();
        assert_eq!(execution.outcome, ExecutionOutcome::Skipped);
        assert!(execution.attempts.is_empty());
    }

    #[test]
    fn over_time_attempt_scored_timed_out() {
        let (mut reg, mut history, bus) = fixture();
        reg.register_gate(condition_gate("slow", "sleepy")).unwrap();
        reg.register_condition(
            "sleepy",
            Box::new(|_| {
                std::thread::sleep(Duration::from_millis(20));
                Ok(true)
            }),
        );

        let executor = ValidationExecutor::new(ExecutorOptions {
            timeout_ms: 1,
            max_retries: 1,
            ..ExecutorOptions::default()
        });
        let execution = executor
            .run_gate(&mut reg, &mut history, &bus, "slow", &GateContext::for_phase("p"))
            .unwrap();
        assert_eq!(execution.attempts[0].state, AttemptState::TimedOut);
        assert_eq!(execution.outcome, ExecutionOutcome::Failed);
        let result = execution.result.unwrap();
        assert!(result.errors[0].contains("exceeded 1ms"));
    }

    #[test]
    fn continuous_gates_queue_and_drain_via_bus() {
        let (mut reg, mut history, mut bus) = fixture();
        reg.register_gate(ValidationGate::new("monitor", GateType::Continuous))
            .unwrap();

        let seen = Rc::new(RefCell::new(0));
        let sink = seen.clone();
        bus.subscribe_prefix(
            "gate:continuous:",
            Box::new(move |_| *sink.borrow_mut() += 1),
        );

        let mut executor = ValidationExecutor::new(ExecutorOptions::default());
        let ctx = GateContext::for_phase("p");
        let executions = executor
            .run_stage(&mut reg, &mut history, &bus, "p", &ctx, GateType::Continuous)
            .unwrap();
        assert!(executions.is_empty(), "continuous gates never block");
        assert_eq!(executor.pending_continuous(), 1);

        let drained = executor.drain_continuous(&mut reg, &mut history, &bus);
        assert_eq!(drained, 1);
        assert_eq!(*seen.borrow(), 1);
        assert_eq!(executor.pending_continuous(), 0);
    }

    #[test]
    fn phase_report_summary_and_decompose_suggestion() {
        let (mut reg, mut history, bus) = fixture();
        reg.register_gate(ValidationGate::new("good", GateType::PreExecution).for_phase("impl"))
            .unwrap();
        reg.register_gate(condition_gate("bad", "always-false").for_phase("impl"))
            .unwrap();
        reg.register_condition("always-false", Box::new(|_| Ok(false)));

        let mut executor = ValidationExecutor::new(ExecutorOptions::default());
        let report = executor
            .run_phase(&mut reg, &mut history, &bus, "impl", &GateContext::for_phase("impl"))
            .unwrap();

        assert_eq!(report.summary.total, 2);
        assert_eq!(report.summary.passed, 1);
        assert_eq!(report.summary.failed, 1);
        assert!((report.summary.success_rate - 0.5).abs() < f64::EPSILON);
        assert!(report
            .suggestions
            .iter()
            .any(|s| s.pattern_id == "decompose-phase"));
    }

    #[test]
    fn learning_disabled_yields_no_phase_suggestions() {
        let (mut reg, mut history, bus) = fixture();
        reg.register_gate(condition_gate("bad", "always-false").for_phase("impl"))
            .unwrap();
        reg.register_condition("always-false", Box::new(|_| Ok(false)));

        let mut executor =
            ValidationExecutor::new(ExecutorOptions::default()).with_learning(false);
        let report = executor
            .run_phase(&mut reg, &mut history, &bus, "impl", &GateContext::for_phase("impl"))
            .unwrap();

        assert_eq!(report.summary.failed, 1);
        assert!(report.suggestions.is_empty());
    }

    #[test]
    fn summary_ignores_skipped_in_success_rate() {
        let executions = vec![
            GateExecution {
                gate_id: "a".to_string(),
                outcome: ExecutionOutcome::Passed,
                attempts: Vec::new(),
                result: None,
            },
            GateExecution {
                gate_id: "b".to_string(),
                outcome: ExecutionOutcome::Skipped,
                attempts: Vec::new(),
                result: None,
            },
        ];
        let summary = ValidationSummary::from_executions(&executions);
        assert_eq!(summary.skipped, 1);
        assert!((summary.success_rate - 1.0).abs() < f64::EPSILON);
    }
}
