use crate::context::GateContext;
use crate::error::{Result, WardenError};
use crate::events::{Event, EventBus};
use crate::executor::{
    ExecutorOptions, GateExecution, ValidationExecutor, ValidationSummary,
};
use crate::gate::{validate_id, GateResult, GateType};
use crate::history::{ExecutionHistory, ExecutionRecord};
use crate::patterns::{
    decompose_suggestion, derive_suggestions, result_category, ImprovementPattern,
    ImprovementSuggestion,
};
use crate::registry::GateRegistry;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

// ---------------------------------------------------------------------------
// HookStage / CommandHook
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookStage {
    Pre,
    Post,
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HookStage::Pre => "pre",
            HookStage::Post => "post",
        })
    }
}

/// What a hook handler reports back to the lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookOutcome {
    pub success: bool,
    /// A pre-stage hook returning `false` here aborts the command.
    pub should_proceed: bool,
    /// Ask the executor to run auto-fix routines even if they are disabled
    /// in its options.
    pub auto_fix_requested: bool,
    #[serde(default)]
    pub messages: Vec<String>,
}

impl HookOutcome {
    pub fn proceed() -> Self {
        Self {
            success: true,
            should_proceed: true,
            auto_fix_requested: false,
            messages: Vec::new(),
        }
    }

    pub fn abort(message: impl Into<String>) -> Self {
        Self {
            success: false,
            should_proceed: false,
            auto_fix_requested: false,
            messages: vec![message.into()],
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.messages.push(message.into());
        self
    }

    pub fn requesting_fix(mut self) -> Self {
        self.auto_fix_requested = true;
        self
    }
}

pub type HookHandler = Box<dyn FnMut(&GateContext) -> HookOutcome>;

/// How pre-stage hooks are consulted. Sequential stops at the first abort;
/// parallel runs every matching hook and joins the outcomes, so an abort
/// never hides later hooks' messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookMode {
    #[default]
    Sequential,
    Parallel,
}

/// A callback attached to a command name (or `*` for every command) at one
/// lifecycle stage. Higher priority runs first.
pub struct CommandHook {
    pub id: String,
    pub command: String,
    pub stage: HookStage,
    pub priority: i32,
    pub enabled: bool,
    handler: HookHandler,
}

impl CommandHook {
    pub fn new(
        id: impl Into<String>,
        command: impl Into<String>,
        stage: HookStage,
        handler: HookHandler,
    ) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            stage,
            priority: 0,
            enabled: true,
            handler,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn matches(&self, command: &str, stage: HookStage) -> bool {
        self.enabled && self.stage == stage && (self.command == "*" || self.command == command)
    }
}

// ---------------------------------------------------------------------------
// CommandRun / CommandOutcome / LifecycleReport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRun {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandRun {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

/// Result of the wrapped command itself. The lifecycle treats the command as
/// opaque: it only sees this.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub success: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl CommandOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failed(errors: Vec<String>) -> Self {
        Self {
            success: false,
            errors,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleReport {
    pub command: String,
    /// False when a pre hook or blocking pre-execution gate stopped the
    /// command before it ran.
    pub proceeded: bool,
    /// Hook or gate id responsible for an abort.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted_by: Option<String>,
    pub command_success: bool,
    pub pre: Vec<GateExecution>,
    pub post: Vec<GateExecution>,
    pub summary: ValidationSummary,
    /// Errors present on a first attempt that an auto-fix cleared.
    #[serde(default)]
    pub errors_cleared: Vec<String>,
    pub suggestions: Vec<ImprovementSuggestion>,
    #[serde(default)]
    pub hook_messages: Vec<String>,
    pub duration_ms: u64,
}

impl LifecycleReport {
    pub fn success(&self) -> bool {
        self.proceeded
            && self.command_success
            && !self
                .pre
                .iter()
                .chain(self.post.iter())
                .any(|e| e.blocking_failure())
    }
}

/// One round of the post-failure improvement loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovementRound {
    /// 1-indexed.
    pub iteration: u32,
    pub errors_before: Vec<String>,
    /// Errors present before this round's fixes that the re-validation no
    /// longer reports, regardless of which gate they came from.
    pub errors_cleared: Vec<String>,
    pub fixes_applied: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovementOutcome {
    pub rounds: Vec<ImprovementRound>,
    /// True when the final re-validation reported no errors at all.
    pub resolved: bool,
    pub remaining_errors: Vec<String>,
}

// ---------------------------------------------------------------------------
// CommandLifecycle
// ---------------------------------------------------------------------------

/// Wraps a command in the full validation lifecycle: pre hooks, pre gates,
/// the command, post hooks, post gates, continuous-gate drain, and the
/// history record.
pub struct CommandLifecycle {
    hooks: Vec<CommandHook>,
    mode: HookMode,
    executor: ValidationExecutor,
    patterns: Vec<ImprovementPattern>,
    learning: bool,
}

impl CommandLifecycle {
    pub fn new(options: ExecutorOptions) -> Self {
        Self {
            hooks: Vec::new(),
            mode: HookMode::Sequential,
            executor: ValidationExecutor::new(options),
            patterns: crate::patterns::default_patterns(),
            learning: true,
        }
    }

    pub fn with_mode(mut self, mode: HookMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_patterns(mut self, patterns: Vec<ImprovementPattern>) -> Self {
        self.patterns = patterns;
        self
    }

    /// Toggle suggestion mining. When off, reports carry no improvement
    /// suggestions at all.
    pub fn with_learning(mut self, enabled: bool) -> Self {
        self.learning = enabled;
        self
    }

    pub fn register_hook(&mut self, hook: CommandHook) -> Result<()> {
        validate_id(&hook.id)?;
        self.hooks.push(hook);
        Ok(())
    }

    pub fn hook_ids(&self) -> Vec<&str> {
        self.hooks.iter().map(|h| h.id.as_str()).collect()
    }

    /// Indices of hooks matching (command, stage), highest priority first,
    /// id order breaking ties.
    fn matching_hooks(&self, command: &str, stage: HookStage) -> Vec<usize> {
        let mut indices: Vec<usize> = self
            .hooks
            .iter()
            .enumerate()
            .filter(|(_, h)| h.matches(command, stage))
            .map(|(i, _)| i)
            .collect();
        indices.sort_by(|&a, &b| {
            self.hooks[b]
                .priority
                .cmp(&self.hooks[a].priority)
                .then(self.hooks[a].id.cmp(&self.hooks[b].id))
        });
        indices
    }

    /// Run the whole lifecycle for one command. `command_fn` is invoked only
    /// if every pre hook allows it and no blocking pre-execution gate fails.
    pub fn run<F>(
        &mut self,
        registry: &mut GateRegistry,
        history: &mut ExecutionHistory,
        bus: &EventBus,
        run: &CommandRun,
        ctx: &GateContext,
        command_fn: F,
    ) -> Result<LifecycleReport>
    where
        F: FnOnce(&GateContext) -> CommandOutcome,
    {
        let started = Instant::now();
        let phase = ctx.phase.clone();
        let mut hook_messages = Vec::new();
        let mut fix_requested = false;

        bus.publish(&Event::ValidationPreStarted {
            phase: phase.clone(),
            command: run.command.clone(),
        });

        // Pre hooks. In sequential mode the first abort wins and later
        // hooks are not consulted; in parallel mode every hook runs and the
        // aborts are joined.
        let mut hook_abort: Option<String> = None;
        for index in self.matching_hooks(&run.command, HookStage::Pre) {
            let hook = &mut self.hooks[index];
            let outcome = (hook.handler)(ctx);
            hook_messages.extend(outcome.messages.iter().cloned());
            fix_requested |= outcome.auto_fix_requested;
            if !outcome.should_proceed && hook_abort.is_none() {
                hook_abort = Some(hook.id.clone());
                if self.mode == HookMode::Sequential {
                    break;
                }
            }
        }
        if let Some(aborted_by) = hook_abort {
            tracing::info!(command = %run.command, hook = %aborted_by, "command aborted by pre hook");
            bus.publish(&Event::ValidationPreCompleted {
                phase: phase.clone(),
                command: run.command.clone(),
                passed: false,
            });
            let report = self.finish_report(
                run,
                false,
                Some(aborted_by.clone()),
                false,
                Vec::new(),
                Vec::new(),
                hook_messages,
                history,
                &phase,
                started,
            );
            // Under fail-fast the abort is a hard stop for the caller too.
            if self.executor.options.fail_fast {
                return Err(WardenError::CommandBlocked {
                    command: run.command.clone(),
                    blocker: aborted_by,
                    errors: report.hook_messages.clone(),
                });
            }
            return Ok(report);
        }

        let saved_auto_fix = self.executor.options.auto_fix;
        if fix_requested {
            self.executor.options.auto_fix = true;
        }

        // Pre-execution gates. A blocking failure stops the command.
        let pre = self.executor.run_stage(
            registry,
            history,
            bus,
            &phase,
            ctx,
            GateType::PreExecution,
        )?;
        let pre_blocked = pre.iter().find(|e| e.blocking_failure()).map(|e| e.gate_id.clone());
        bus.publish(&Event::ValidationPreCompleted {
            phase: phase.clone(),
            command: run.command.clone(),
            passed: pre_blocked.is_none(),
        });

        if let Some(gate_id) = pre_blocked {
            self.executor.options.auto_fix = saved_auto_fix;
            // Retries are exhausted by this point; the gate's final errors
            // are what the caller gets to see.
            let errors: Vec<String> = pre
                .iter()
                .find(|e| e.gate_id == gate_id)
                .and_then(|e| e.result.as_ref())
                .map(|r| r.errors.clone())
                .unwrap_or_default();
            let report = self.finish_report(
                run,
                false,
                Some(gate_id.clone()),
                false,
                pre,
                Vec::new(),
                hook_messages,
                history,
                &phase,
                started,
            );
            if self.executor.options.fail_fast {
                return Err(WardenError::CommandBlocked {
                    command: run.command.clone(),
                    blocker: gate_id,
                    errors,
                });
            }
            return Ok(report);
        }

        // The command itself.
        let command_outcome = command_fn(ctx);

        // Post hooks. `should_proceed` has no meaning after the fact; their
        // messages and fix requests still count.
        for index in self.matching_hooks(&run.command, HookStage::Post) {
            let hook = &mut self.hooks[index];
            let outcome = (hook.handler)(ctx);
            hook_messages.extend(outcome.messages.iter().cloned());
            fix_requested |= outcome.auto_fix_requested;
        }
        if fix_requested {
            self.executor.options.auto_fix = true;
        }

        // Post-execution gates, then continuous gates queued and drained.
        bus.publish(&Event::ValidationPostStarted {
            phase: phase.clone(),
            command: run.command.clone(),
        });
        let post = self.executor.run_stage(
            registry,
            history,
            bus,
            &phase,
            ctx,
            GateType::PostExecution,
        )?;
        self.executor.run_stage(
            registry,
            history,
            bus,
            &phase,
            ctx,
            GateType::Continuous,
        )?;
        self.executor.drain_continuous(registry, history, bus);
        let post_passed = !post.iter().any(|e| e.blocking_failure());
        bus.publish(&Event::ValidationPostCompleted {
            phase: phase.clone(),
            command: run.command.clone(),
            passed: post_passed,
        });
        self.executor.options.auto_fix = saved_auto_fix;

        let mut report = self.finish_report(
            run,
            true,
            None,
            command_outcome.success,
            pre,
            post,
            hook_messages,
            history,
            &phase,
            started,
        );
        // Merge the command's own errors into the record just appended.
        if !command_outcome.errors.is_empty() || !command_outcome.warnings.is_empty() {
            report.hook_messages.extend(command_outcome.errors);
            report.hook_messages.extend(command_outcome.warnings);
        }
        Ok(report)
    }

    /// Post-failure improvement loop: re-validate the phase's pre-execution
    /// gates, apply registered fixers to the failing ones, and validate
    /// again, up to `max_iterations` rounds. Cleared errors are tracked
    /// across the whole phase, so a fix on one gate gets credit when it
    /// unblocks another (a prior-gate requirement, say). Stops early once no
    /// errors remain or a round applies no fix.
    pub fn improve(
        &self,
        registry: &mut GateRegistry,
        history: &mut ExecutionHistory,
        bus: &EventBus,
        ctx: &GateContext,
        max_iterations: u32,
    ) -> Result<ImprovementOutcome> {
        let mut rounds = Vec::new();
        let mut results = self.validate_pre(registry, history, ctx)?;
        for iteration in 1..=max_iterations {
            let errors_before = collect_errors(&results);
            if errors_before.is_empty() {
                break;
            }

            let mut fixes_applied = Vec::new();
            for result in results.iter().filter(|r| !r.passed) {
                if registry.run_fix(&result.gate_id, ctx) == Some(true) {
                    bus.publish(&Event::GateFixed {
                        gate_id: result.gate_id.clone(),
                        attempt: iteration,
                    });
                    fixes_applied.push(result.gate_id.clone());
                }
            }
            if fixes_applied.is_empty() {
                // Nothing auto-fixable is left; further rounds cannot help.
                break;
            }

            results = self.validate_pre(registry, history, ctx)?;
            let errors_after = collect_errors(&results);
            let errors_cleared: Vec<String> = errors_before
                .iter()
                .filter(|e| !errors_after.contains(e))
                .cloned()
                .collect();
            tracing::debug!(
                iteration,
                cleared = errors_cleared.len(),
                remaining = errors_after.len(),
                "improvement round"
            );
            rounds.push(ImprovementRound {
                iteration,
                errors_before,
                errors_cleared,
                fixes_applied,
            });
        }

        let remaining_errors = collect_errors(&results);
        Ok(ImprovementOutcome {
            rounds,
            resolved: remaining_errors.is_empty(),
            remaining_errors,
        })
    }

    /// Evaluate every enabled pre-execution gate for the context's phase,
    /// recording each outcome in history.
    fn validate_pre(
        &self,
        registry: &mut GateRegistry,
        history: &mut ExecutionHistory,
        ctx: &GateContext,
    ) -> Result<Vec<GateResult>> {
        let ids: Vec<String> = registry
            .gates_for_phase(&ctx.phase)
            .iter()
            .filter(|g| g.gate_type == GateType::PreExecution && g.enabled)
            .map(|g| g.id.clone())
            .collect();
        let mut results = Vec::new();
        for id in ids {
            let result = registry.validate_gate(&id, ctx)?;
            history.record_gate(&id, result.passed, result_category(&result));
            results.push(result);
        }
        Ok(results)
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_report(
        &self,
        run: &CommandRun,
        proceeded: bool,
        aborted_by: Option<String>,
        command_success: bool,
        pre: Vec<GateExecution>,
        post: Vec<GateExecution>,
        hook_messages: Vec<String>,
        history: &mut ExecutionHistory,
        phase: &str,
        started: Instant,
    ) -> LifecycleReport {
        let all: Vec<&GateExecution> = pre.iter().chain(post.iter()).collect();
        let summary = ValidationSummary::from_executions(
            &pre.iter().chain(post.iter()).cloned().collect::<Vec<_>>(),
        );

        // Errors the auto-fix loop cleared: present on the first attempt of
        // a fixed gate, absent from its final result.
        let mut errors_cleared = Vec::new();
        for execution in &all {
            if !execution.fix_applied() {
                continue;
            }
            let final_errors = execution
                .result
                .as_ref()
                .map(|r| r.errors.clone())
                .unwrap_or_default();
            if let Some(first) = execution.attempts.first() {
                for error in &first.errors {
                    if !final_errors.contains(error) {
                        errors_cleared.push(error.clone());
                    }
                }
            }
        }

        let failed: Vec<&GateResult> = all
            .iter()
            .filter_map(|e| e.result.as_ref())
            .filter(|r| !r.passed)
            .collect();
        let mut suggestions = if self.learning {
            derive_suggestions(&failed, history, &self.patterns)
        } else {
            Vec::new()
        };
        if self.learning && proceeded && summary.success_rate < 0.8 {
            suggestions.push(decompose_suggestion(phase, summary.success_rate));
        }

        let errors: Vec<String> = failed.iter().flat_map(|r| r.errors.clone()).collect();
        let warnings: Vec<String> = all
            .iter()
            .filter_map(|e| e.result.as_ref())
            .flat_map(|r| r.warnings.clone())
            .collect();
        let fixes_applied: Vec<String> = all
            .iter()
            .filter(|e| e.fix_applied())
            .map(|e| e.gate_id.clone())
            .collect();
        let duration_ms = started.elapsed().as_millis() as u64;
        let success =
            proceeded && command_success && !all.iter().any(|e| e.blocking_failure());

        history.append(ExecutionRecord {
            command: run.command.clone(),
            args: run.args.clone(),
            timestamp: Utc::now(),
            phase: phase.to_string(),
            success,
            errors,
            warnings,
            fixes_applied,
            suggestions: suggestions.iter().map(|s| s.suggestion.clone()).collect(),
            duration_ms,
        });

        LifecycleReport {
            command: run.command.clone(),
            proceeded,
            aborted_by,
            command_success,
            pre,
            post,
            summary,
            errors_cleared,
            suggestions,
            hook_messages,
            duration_ms,
        }
    }
}

fn collect_errors(results: &[GateResult]) -> Vec<String> {
    results
        .iter()
        .filter(|r| !r.passed)
        .flat_map(|r| r.errors.iter().cloned())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
