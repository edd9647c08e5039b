use crate::error::{Result, WardenError};
use crate::events::{Event, EventBus};
use crate::gate::GateStatus;
use crate::io;
use crate::registry::GateRegistry;
use crate::storage::Store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const STATE_FILE: &str = ".warden/state.yaml";

pub fn state_path(root: &Path) -> PathBuf {
    root.join(STATE_FILE)
}

// ---------------------------------------------------------------------------
// PhaseSpec
// ---------------------------------------------------------------------------

/// A stage of the governed workflow. Phases form a DAG through
/// `prerequisites`, though most configurations use a linear chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub id: String,
    pub ordinal: u32,
    /// File or directory paths that must exist before leaving this phase.
    #[serde(default)]
    pub required_outputs: Vec<String>,
    /// Gate ids that must be in `passed` state to complete this phase.
    #[serde(default)]
    pub gates: Vec<String>,
    /// Phases allowed to precede this one. Empty means unconstrained
    /// (a DAG root or a phase reachable from anywhere).
    #[serde(default)]
    pub prerequisites: Vec<String>,
}

impl PhaseSpec {
    pub fn new(id: impl Into<String>, ordinal: u32) -> Self {
        Self {
            id: id.into(),
            ordinal,
            required_outputs: Vec::new(),
            gates: Vec::new(),
            prerequisites: Vec::new(),
        }
    }

    pub fn with_outputs(mut self, outputs: Vec<String>) -> Self {
        self.required_outputs = outputs;
        self
    }

    pub fn with_gates(mut self, gates: Vec<String>) -> Self {
        self.gates = gates;
        self
    }

    pub fn with_prerequisites(mut self, prerequisites: Vec<String>) -> Self {
        self.prerequisites = prerequisites;
        self
    }
}

// ---------------------------------------------------------------------------
// PhaseState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedPhase {
    pub id: String,
    pub completed_at: DateTime<Utc>,
    pub duration_secs: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTransition {
    pub from: String,
    pub to: String,
    pub blockers: Vec<String>,
}

/// A forced transition is never silent: the bypass and its justification are
/// appended here permanently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForcedDecision {
    pub from: String,
    pub to: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseState {
    pub current: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed: Vec<CompletedPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingTransition>,
    #[serde(default)]
    pub decisions: Vec<ForcedDecision>,
}

impl PhaseState {
    pub fn new(initial: impl Into<String>) -> Self {
        Self {
            current: initial.into(),
            started_at: Utc::now(),
            completed: Vec::new(),
            pending: None,
            decisions: Vec::new(),
        }
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = state_path(root);
        if !path.exists() {
            return Err(WardenError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        Ok(serde_yaml::from_str(&data)?)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        io::atomic_write(&state_path(root), data.as_bytes())
    }

    pub fn has_completed(&self, phase: &str) -> bool {
        self.completed.iter().any(|c| c.id == phase)
    }
}

// ---------------------------------------------------------------------------
// TransitionCheck
// ---------------------------------------------------------------------------

/// The structured answer to "may we move to this phase?". All three blocker
/// categories accumulate; the transition is allowed iff none are present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransitionCheck {
    pub from: String,
    pub to: String,
    pub allowed: bool,
    #[serde(default)]
    pub missing_outputs: Vec<String>,
    #[serde(default)]
    pub failed_gates: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prerequisite_violation: Option<String>,
}

impl TransitionCheck {
    /// Flat blocker list for event payloads and pending-transition records.
    pub fn blockers(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .missing_outputs
            .iter()
            .map(|o| format!("missing output: {o}"))
            .collect();
        out.extend(
            self.failed_gates
                .iter()
                .map(|g| format!("gate not passed: {g}")),
        );
        if let Some(v) = &self.prerequisite_violation {
            out.push(v.clone());
        }
        out
    }
}

// ---------------------------------------------------------------------------
// PhaseMachine
// ---------------------------------------------------------------------------

/// The state machine gating movement between workflow phases. It reads the
/// registry's gate status map but never writes it; `PhaseState` is mutated
/// only here.
pub struct PhaseMachine {
    specs: BTreeMap<String, PhaseSpec>,
    state: PhaseState,
    store: Box<dyn Store>,
}

impl PhaseMachine {
    pub fn new(specs: Vec<PhaseSpec>, initial: &str, store: Box<dyn Store>) -> Result<Self> {
        let specs: BTreeMap<String, PhaseSpec> =
            specs.into_iter().map(|s| (s.id.clone(), s)).collect();
        if !specs.contains_key(initial) {
            return Err(WardenError::PhaseNotFound(initial.to_string()));
        }
        Ok(Self {
            specs,
            state: PhaseState::new(initial),
            store,
        })
    }

    pub fn with_state(mut self, state: PhaseState) -> Result<Self> {
        if !self.specs.contains_key(&state.current) {
            return Err(WardenError::PhaseNotFound(state.current));
        }
        self.state = state;
        Ok(self)
    }

    pub fn current(&self) -> &str {
        &self.state.current
    }

    pub fn state(&self) -> &PhaseState {
        &self.state
    }

    pub fn spec(&self, id: &str) -> Option<&PhaseSpec> {
        self.specs.get(id)
    }

    /// Phases in ordinal order.
    pub fn phases(&self) -> Vec<&PhaseSpec> {
        let mut out: Vec<&PhaseSpec> = self.specs.values().collect();
        out.sort_by_key(|s| s.ordinal);
        out
    }

    /// Check whether moving to `to` is allowed, accumulating every blocker:
    /// missing outputs of the *current* phase, its unpassed gates, and a
    /// prerequisite violation on the target.
    pub fn validate_transition(
        &self,
        to: &str,
        registry: &GateRegistry,
    ) -> Result<TransitionCheck> {
        let target = self
            .specs
            .get(to)
            .ok_or_else(|| WardenError::PhaseNotFound(to.to_string()))?;
        let current = self
            .specs
            .get(&self.state.current)
            .ok_or_else(|| WardenError::PhaseNotFound(self.state.current.clone()))?;

        let mut check = TransitionCheck {
            from: current.id.clone(),
            to: target.id.clone(),
            ..TransitionCheck::default()
        };

        for output in &current.required_outputs {
            if !self.store.is_readable(Path::new(output)) {
                check.missing_outputs.push(output.clone());
            }
        }

        for gate_id in &current.gates {
            if registry.status(gate_id) != Some(GateStatus::Passed) {
                check.failed_gates.push(gate_id.clone());
            }
        }

        if !target.prerequisites.is_empty() && !target.prerequisites.contains(&current.id) {
            check.prerequisite_violation = Some(format!(
                "phase '{}' cannot follow '{}': prerequisites are [{}]",
                target.id,
                current.id,
                target.prerequisites.join(", ")
            ));
        }

        check.allowed = check.missing_outputs.is_empty()
            && check.failed_gates.is_empty()
            && check.prerequisite_violation.is_none();
        Ok(check)
    }

    /// Validate and commit. On a blocked transition the state keeps a
    /// pending-transition record and the structured check is returned in the
    /// error.
    pub fn transition_to(&mut self, to: &str, registry: &GateRegistry, bus: &EventBus) -> Result<()> {
        let check = self.validate_transition(to, registry)?;
        bus.publish(&Event::PhaseTransitionValidated {
            from: check.from.clone(),
            to: check.to.clone(),
            allowed: check.allowed,
        });

        if !check.allowed {
            self.state.pending = Some(PendingTransition {
                from: check.from.clone(),
                to: check.to.clone(),
                blockers: check.blockers(),
            });
            bus.publish(&Event::PhaseTransitionBlocked {
                from: check.from.clone(),
                to: check.to.clone(),
                blockers: check.blockers(),
            });
            tracing::info!(from = %check.from, to = %check.to, "transition blocked");
            return Err(WardenError::TransitionBlocked {
                from: check.from.clone(),
                to: check.to.clone(),
                check,
            });
        }

        self.commit(to);
        bus.publish(&Event::PhaseTransitionCompleted {
            from: check.from.clone(),
            to: to.to_string(),
        });
        tracing::info!(from = %check.from, to, "phase transition");
        Ok(())
    }

    /// Bypass all checks. The decision is permanently recorded with its
    /// justification.
    pub fn force_transition(&mut self, to: &str, reason: &str, bus: &EventBus) -> Result<()> {
        if !self.specs.contains_key(to) {
            return Err(WardenError::PhaseNotFound(to.to_string()));
        }
        let from = self.state.current.clone();
        self.state.decisions.push(ForcedDecision {
            from: from.clone(),
            to: to.to_string(),
            reason: reason.to_string(),
            at: Utc::now(),
        });
        self.commit(to);
        bus.publish(&Event::PhaseTransitionForced {
            from: from.clone(),
            to: to.to_string(),
            reason: reason.to_string(),
        });
        tracing::warn!(%from, to, reason, "forced phase transition");
        Ok(())
    }

    fn commit(&mut self, to: &str) {
        let now = Utc::now();
        let from = self.state.current.clone();
        self.state.completed.push(CompletedPhase {
            id: from,
            completed_at: now,
            duration_secs: (now - self.state.started_at).num_seconds(),
        });
        self.state.current = to.to_string();
        self.state.started_at = now;
        self.state.pending = None;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::{GateType, ValidationGate};
    use crate::storage::MemStore;

    fn linear_specs() -> Vec<PhaseSpec> {
        vec![
            PhaseSpec::new("ideation", 0)
                .with_outputs(vec!["docs/idea.md".to_string()])
                .with_gates(vec!["idea-review".to_string()]),
            PhaseSpec::new("design", 1).with_prerequisites(vec!["ideation".to_string()]),
            PhaseSpec::new("implementation", 2).with_prerequisites(vec!["design".to_string()]),
        ]
    }

    fn ready_registry() -> GateRegistry {
        let mut reg = GateRegistry::in_memory();
        reg.register_gate(ValidationGate::new("idea-review", GateType::PreExecution))
            .unwrap();
        reg
    }

    fn pass_gate(reg: &mut GateRegistry, id: &str) {
        reg.validate_gate(id, &crate::context::GateContext::for_phase("ideation"))
            .unwrap();
    }

    #[test]
    fn allowed_transition_with_everything_satisfied() {
        // ideation -> design with outputs present and gates passed.
        let store = MemStore::new().with_file("docs/idea.md", "# Idea");
        let machine = PhaseMachine::new(linear_specs(), "ideation", Box::new(store)).unwrap();
        let mut reg = ready_registry();
        pass_gate(&mut reg, "idea-review");

        let check = machine.validate_transition("design", &reg).unwrap();
        assert!(check.allowed);
        assert!(check.missing_outputs.is_empty());
        assert!(check.failed_gates.is_empty());
        assert!(check.prerequisite_violation.is_none());
    }

    #[test]
    fn truth_table_all_eight_combinations() {
        // allowed iff outputs present AND gates passed AND prerequisite ok.
        for outputs_ok in [false, true] {
            for gates_ok in [false, true] {
                for prereq_ok in [false, true] {
                    let store = if outputs_ok {
                        MemStore::new().with_file("docs/idea.md", "# Idea")
                    } else {
                        MemStore::new()
                    };
                    let machine =
                        PhaseMachine::new(linear_specs(), "ideation", Box::new(store)).unwrap();
                    let mut reg = ready_registry();
                    if gates_ok {
                        pass_gate(&mut reg, "idea-review");
                    }
                    // "implementation" requires coming from "design".
                    let target = if prereq_ok { "design" } else { "implementation" };

                    let check = machine.validate_transition(target, &reg).unwrap();
                    assert_eq!(
                        check.allowed,
                        outputs_ok && gates_ok && prereq_ok,
                        "outputs={outputs_ok} gates={gates_ok} prereq={prereq_ok}"
                    );
                    assert_eq!(check.missing_outputs.is_empty(), outputs_ok);
                    assert_eq!(check.failed_gates.is_empty(), gates_ok);
                    assert_eq!(check.prerequisite_violation.is_none(), prereq_ok);
                }
            }
        }
    }

    #[test]
    fn blocked_transition_records_pending_and_errors() {
        let machine = PhaseMachine::new(linear_specs(), "ideation", Box::new(MemStore::new()));
        let mut machine = machine.unwrap();
        let reg = ready_registry();
        let bus = EventBus::new();

        let err = machine.transition_to("design", &reg, &bus).unwrap_err();
        let WardenError::TransitionBlocked { from, to, check } = err else {
            panic!("expected TransitionBlocked");
        };
        assert_eq!(from, "ideation");
        assert_eq!(to, "design");
        assert_eq!(check.missing_outputs, vec!["docs/idea.md"]);
        assert_eq!(check.failed_gates, vec!["idea-review"]);

        let pending = machine.state().pending.as_ref().unwrap();
        assert_eq!(pending.to, "design");
        assert_eq!(pending.blockers.len(), 2);
    }

    #[test]
    fn successful_transition_updates_state() {
        let store = MemStore::new().with_file("docs/idea.md", "# Idea");
        let mut machine = PhaseMachine::new(linear_specs(), "ideation", Box::new(store)).unwrap();
        let mut reg = ready_registry();
        pass_gate(&mut reg, "idea-review");
        let bus = EventBus::new();

        machine.transition_to("design", &reg, &bus).unwrap();
        assert_eq!(machine.current(), "design");
        assert!(machine.state().has_completed("ideation"));
        assert!(machine.state().pending.is_none());
    }

    #[test]
    fn force_transition_is_logged_permanently() {
        let mut machine =
            PhaseMachine::new(linear_specs(), "ideation", Box::new(MemStore::new())).unwrap();
        let bus = EventBus::new();

        machine
            .force_transition("implementation", "hotfix: skipping design", &bus)
            .unwrap();
        assert_eq!(machine.current(), "implementation");
        assert_eq!(machine.state().decisions.len(), 1);
        assert_eq!(machine.state().decisions[0].reason, "hotfix: skipping design");
    }

    #[test]
    fn unknown_phase_is_hard_error() {
        let machine =
            PhaseMachine::new(linear_specs(), "ideation", Box::new(MemStore::new())).unwrap();
        let reg = ready_registry();
        assert!(matches!(
            machine.validate_transition("shipping", &reg),
            Err(WardenError::PhaseNotFound(_))
        ));
    }

    #[test]
    fn empty_prerequisites_are_unconstrained() {
        let specs = vec![
            PhaseSpec::new("anywhere", 0),
            PhaseSpec::new("open", 1), // no prerequisites declared
        ];
        let machine = PhaseMachine::new(specs, "anywhere", Box::new(MemStore::new())).unwrap();
        let reg = GateRegistry::in_memory();
        let check = machine.validate_transition("open", &reg).unwrap();
        assert!(check.allowed);
    }

    #[test]
    fn state_persists_across_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut state = PhaseState::new("ideation");
        state.decisions.push(ForcedDecision {
            from: "ideation".to_string(),
            to: "design".to_string(),
            reason: "test".to_string(),
            at: Utc::now(),
        });
        state.save(dir.path()).unwrap();

        let loaded = PhaseState::load(dir.path()).unwrap();
        assert_eq!(loaded.current, "ideation");
        assert_eq!(loaded.decisions.len(), 1);
    }

    #[test]
    fn load_without_state_file_is_not_initialized() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(matches!(
            PhaseState::load(dir.path()),
            Err(WardenError::NotInitialized)
        ));
    }
}
