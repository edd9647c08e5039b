use crate::context::GateContext;
use crate::error::{Result, WardenError};
use crate::gate::{validate_id, GateResult, GateStatus, Severity, ValidationGate};
use crate::storage::{MemStore, Store};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

// ---------------------------------------------------------------------------
// Callback types
// ---------------------------------------------------------------------------

/// A named condition predicate. `Err` is captured into the gate result as an
/// evaluation error, never propagated.
pub type ConditionFn = Box<dyn Fn(&GateContext) -> std::result::Result<bool, String>>;

/// A custom validator: returns the error list (empty = pass). Replaces the
/// default requirement algorithm entirely, but its result is persisted the
/// same way.
pub type ValidatorFn = Box<dyn Fn(&GateContext) -> Vec<String>>;

/// An auto-fix routine. Returns true if it believes the problem was fixed.
pub type FixerFn = Box<dyn FnMut(&GateContext) -> bool>;

/// How a gate is evaluated: the built-in requirement walk, or a registered
/// custom validator. Dispatched by match, never by downcasting.
enum Evaluator {
    Default,
    Custom(ValidatorFn),
}

struct GateEntry {
    gate: ValidationGate,
    evaluator: Evaluator,
    fixer: Option<FixerFn>,
    status: GateStatus,
    last_result: Option<GateResult>,
}

// ---------------------------------------------------------------------------
// PhaseValidation
// ---------------------------------------------------------------------------

/// Per-gate breakdown of a whole-phase validation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseValidation {
    pub phase: String,
    pub passed: bool,
    pub results: Vec<GateResult>,
}

// ---------------------------------------------------------------------------
// GateRegistry
// ---------------------------------------------------------------------------

/// Declarative gate registry and default evaluator.
///
/// The status map is the engine's one piece of mutable shared state: it is
/// written only here, immediately after each evaluation, and read by the
/// phase machine (single-writer discipline).
pub struct GateRegistry {
    gates: BTreeMap<String, GateEntry>,
    conditions: BTreeMap<String, ConditionFn>,
    store: Box<dyn Store>,
}

impl GateRegistry {
    pub fn new(store: Box<dyn Store>) -> Self {
        Self {
            gates: BTreeMap::new(),
            conditions: BTreeMap::new(),
            store,
        }
    }

    /// Registry backed by an empty in-memory store; file requirements will
    /// all fail until real files are registered. Intended for tests.
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemStore::new()))
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    pub fn register_gate(&mut self, gate: ValidationGate) -> Result<()> {
        validate_id(&gate.id)?;
        self.gates.insert(
            gate.id.clone(),
            GateEntry {
                gate,
                evaluator: Evaluator::Default,
                fixer: None,
                status: GateStatus::Pending,
                last_result: None,
            },
        );
        Ok(())
    }

    pub fn register_condition(&mut self, name: impl Into<String>, predicate: ConditionFn) {
        self.conditions.insert(name.into(), predicate);
    }

    pub fn register_validator(&mut self, gate_id: &str, validator: ValidatorFn) -> Result<()> {
        let entry = self
            .gates
            .get_mut(gate_id)
            .ok_or_else(|| WardenError::GateNotFound(gate_id.to_string()))?;
        entry.evaluator = Evaluator::Custom(validator);
        Ok(())
    }

    pub fn register_fixer(&mut self, gate_id: &str, fixer: FixerFn) -> Result<()> {
        let entry = self
            .gates
            .get_mut(gate_id)
            .ok_or_else(|| WardenError::GateNotFound(gate_id.to_string()))?;
        entry.fixer = Some(fixer);
        entry.gate.auto_fixable = true;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn gate(&self, id: &str) -> Option<&ValidationGate> {
        self.gates.get(id).map(|e| &e.gate)
    }

    pub fn gate_ids(&self) -> Vec<String> {
        self.gates.keys().cloned().collect()
    }

    pub fn status(&self, id: &str) -> Option<GateStatus> {
        self.gates.get(id).map(|e| e.status)
    }

    pub fn last_result(&self, id: &str) -> Option<&GateResult> {
        self.gates.get(id).and_then(|e| e.last_result.as_ref())
    }

    pub fn passed_gates(&self) -> Vec<String> {
        self.gates
            .iter()
            .filter(|(_, e)| e.status == GateStatus::Passed)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Gates applicable to a phase, in id order.
    pub fn gates_for_phase(&self, phase: &str) -> Vec<&ValidationGate> {
        self.gates
            .values()
            .filter(|e| e.gate.phase.applies_to(phase))
            .map(|e| &e.gate)
            .collect()
    }

    pub fn has_fixer(&self, id: &str) -> bool {
        self.gates
            .get(id)
            .map(|e| e.fixer.is_some())
            .unwrap_or(false)
    }

    // -----------------------------------------------------------------------
    // State reset
    // -----------------------------------------------------------------------

    /// Reset a gate back to `pending`, clearing its last result.
    pub fn reset_gate(&mut self, id: &str) -> Result<()> {
        let entry = self
            .gates
            .get_mut(id)
            .ok_or_else(|| WardenError::GateNotFound(id.to_string()))?;
        entry.status = GateStatus::Pending;
        entry.last_result = None;
        Ok(())
    }

    pub fn reset_all(&mut self) {
        for entry in self.gates.values_mut() {
            entry.status = GateStatus::Pending;
            entry.last_result = None;
        }
    }

    // -----------------------------------------------------------------------
    // Evaluation
    // -----------------------------------------------------------------------

    /// Evaluate one gate against the caller's partial context. The full gate
    /// context is rebuilt here: passed-gate ids always come from the
    /// registry, not from the caller.
    pub fn validate_gate(&mut self, id: &str, partial: &GateContext) -> Result<GateResult> {
        if !self.gates.contains_key(id) {
            return Err(WardenError::GateNotFound(id.to_string()));
        }
        let started = Instant::now();
        let mut ctx = partial.clone();
        ctx.passed_gates = self.passed_gates();

        let entry = self.gates.get(id).expect("checked above");
        let errors = match &entry.evaluator {
            Evaluator::Default => self.evaluate_default(&entry.gate, &ctx),
            Evaluator::Custom(validator) => validator(&ctx),
        };

        let severity = entry.gate.severity;
        let passed = errors.is_empty();
        let result = GateResult {
            gate_id: id.to_string(),
            passed,
            severity,
            errors,
            warnings: Vec::new(),
            fix_applied: false,
            evaluated_at: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
        };

        // Single write point for the status map.
        let entry = self.gates.get_mut(id).expect("checked above");
        entry.status = result.status();
        entry.last_result = Some(result.clone());
        tracing::debug!(gate = id, passed, "gate evaluated");
        Ok(result)
    }

    /// Evaluate every gate applicable to `phase`. Passes iff all pass.
    pub fn validate_phase(&mut self, phase: &str, partial: &GateContext) -> PhaseValidation {
        let ids: Vec<String> = self
            .gates_for_phase(phase)
            .iter()
            .map(|g| g.id.clone())
            .collect();

        let mut results = Vec::new();
        for id in ids {
            // Gate existence is guaranteed by the selection above.
            if let Ok(result) = self.validate_gate(&id, partial) {
                results.push(result);
            }
        }
        PhaseValidation {
            phase: phase.to_string(),
            passed: results.iter().all(|r| r.passed),
            results,
        }
    }

    /// Run a gate's registered auto-fix routine. Returns `None` if the gate
    /// has no fixer.
    pub fn run_fix(&mut self, id: &str, ctx: &GateContext) -> Option<bool> {
        let entry = self.gates.get_mut(id)?;
        let fixer = entry.fixer.as_mut()?;
        let fixed = fixer(ctx);
        tracing::debug!(gate = id, fixed, "auto-fix attempted");
        Some(fixed)
    }

    fn evaluate_default(&self, gate: &ValidationGate, ctx: &GateContext) -> Vec<String> {
        let mut errors = Vec::new();

        for section in &gate.requirements.sections {
            if !ctx.has_section(section) {
                errors.push(format!("Missing required section: {section}"));
            }
        }

        for file in &gate.requirements.files {
            if !self.store.is_readable(Path::new(file)) {
                errors.push(format!("Missing or inaccessible file: {file}"));
            }
        }

        for required in &gate.requirements.gates {
            if !ctx.gate_passed(required) {
                errors.push(format!("Required gate not passed: {required}"));
            }
        }

        for name in &gate.requirements.conditions {
            match self.conditions.get(name) {
                None => errors.push(format!("Unknown condition: {name}")),
                Some(predicate) => match predicate(ctx) {
                    Ok(true) => {}
                    Ok(false) => errors.push(format!("Condition not met: {name}")),
                    Err(e) => errors.push(format!("Condition '{name}' failed to evaluate: {e}")),
                },
            }
        }

        errors
    }

    /// Severity of a gate, defaulting to `error` for unknown ids.
    pub fn severity(&self, id: &str) -> Severity {
        self.gates
            .get(id)
            .map(|e| e.gate.severity)
            .unwrap_or(Severity::Error)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
