use crate::assemble::{ContextAssembler, FallbackStrategy};
use crate::error::{Result, WardenError};
use crate::executor::{ExecutorOptions, ValidationExecutor};
use crate::gate::{validate_id, ValidationGate};
use crate::hooks::CommandLifecycle;
use crate::io;
use crate::layer::{ContextLayer, LayerKind, LayerRule};
use crate::phase::PhaseSpec;
use crate::token::TokenBudget;
use crate::trigger::DynamicTrigger;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = ".warden/config.yaml";

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

// ---------------------------------------------------------------------------
// LayerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayerConfig {
    #[serde(default = "default_layer_enabled")]
    pub enabled: bool,
    pub budget: usize,
    #[serde(default)]
    pub reserved: usize,
    #[serde(default)]
    pub rules: Vec<LayerRule>,
}

fn default_layer_enabled() -> bool {
    true
}

impl LayerConfig {
    fn with_budget(budget: usize) -> Self {
        Self {
            enabled: true,
            budget,
            reserved: 0,
            rules: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// WardenConfig
// ---------------------------------------------------------------------------

/// Workspace configuration, persisted as `.warden/config.yaml`. Everything
/// has a default so a missing file behaves like a freshly-initialized
/// workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WardenConfig {
    /// Aggregate token budget across all layers.
    #[serde(default = "default_total_budget")]
    pub total_budget: usize,
    /// Tokens held back from the aggregate budget.
    #[serde(default = "default_reserved")]
    pub reserved: usize,
    #[serde(default = "default_fallback")]
    pub fallback: FallbackStrategy,
    #[serde(default = "default_layers")]
    pub layers: BTreeMap<LayerKind, LayerConfig>,
    /// When off, content-rewriting fallback strategies degrade to
    /// lowest-priority truncation.
    #[serde(default = "default_flag_on")]
    pub auto_compression: bool,
    /// When off, no improvement suggestions are mined.
    #[serde(default = "default_flag_on")]
    pub learning_enabled: bool,
    /// Warnings block and pre-execution failures become hard stops.
    #[serde(default)]
    pub strict_validation: bool,
    #[serde(default)]
    pub executor: ExecutorOptions,
    #[serde(default)]
    pub gates: Vec<ValidationGate>,
    #[serde(default)]
    pub triggers: Vec<DynamicTrigger>,
    #[serde(default = "default_phases")]
    pub phases: Vec<PhaseSpec>,
}

fn default_total_budget() -> usize {
    8000
}

fn default_reserved() -> usize {
    500
}

fn default_fallback() -> FallbackStrategy {
    FallbackStrategy::TruncateLowestPriority
}

fn default_flag_on() -> bool {
    true
}

fn default_layers() -> BTreeMap<LayerKind, LayerConfig> {
    let mut layers = BTreeMap::new();
    layers.insert(LayerKind::Global, LayerConfig::with_budget(2000));
    layers.insert(LayerKind::Phase, LayerConfig::with_budget(1500));
    layers.insert(LayerKind::Task, LayerConfig::with_budget(1000));
    layers.insert(LayerKind::Dynamic, LayerConfig::with_budget(500));
    layers
}

fn default_phases() -> Vec<PhaseSpec> {
    let chain = ["ideation", "design", "implementation", "qa", "release"];
    chain
        .iter()
        .enumerate()
        .map(|(i, id)| {
            let mut spec = PhaseSpec::new(*id, i as u32);
            if i > 0 {
                spec.prerequisites = vec![chain[i - 1].to_string()];
            }
            spec
        })
        .collect()
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            total_budget: default_total_budget(),
            reserved: default_reserved(),
            fallback: default_fallback(),
            layers: default_layers(),
            auto_compression: true,
            learning_enabled: true,
            strict_validation: false,
            executor: ExecutorOptions::default(),
            gates: Vec::new(),
            triggers: Vec::new(),
            phases: default_phases(),
        }
    }
}

impl WardenConfig {
    pub fn load(root: &Path) -> Result<Self> {
        let path = config_path(root);
        if !path.exists() {
            return Err(WardenError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        Ok(serde_yaml::from_str(&data)?)
    }

    pub fn load_or_default(root: &Path) -> Result<Self> {
        match Self::load(root) {
            Ok(config) => Ok(config),
            Err(WardenError::NotInitialized) => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        io::atomic_write(&config_path(root), data.as_bytes())
    }

    /// Non-fatal configuration problems. Loading never rejects a config on
    /// these; hosts decide whether to surface or refuse.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.reserved >= self.total_budget {
            warnings.push(format!(
                "reserved ({}) leaves no usable aggregate budget ({})",
                self.reserved, self.total_budget
            ));
        }
        let layer_total: usize = self
            .layers
            .values()
            .filter(|l| l.enabled)
            .map(|l| l.budget)
            .sum();
        if layer_total > self.total_budget {
            warnings.push(format!(
                "enabled layer budgets sum to {layer_total}, above the aggregate budget {}",
                self.total_budget
            ));
        }
        for (kind, layer) in &self.layers {
            if layer.enabled && layer.budget == 0 {
                warnings.push(format!("layer '{kind}' is enabled with a zero budget"));
            }
            if layer.reserved >= layer.budget && layer.budget > 0 {
                warnings.push(format!("layer '{kind}' reserves its entire budget"));
            }
        }

        let mut seen = std::collections::BTreeSet::new();
        for gate in &self.gates {
            if validate_id(&gate.id).is_err() {
                warnings.push(format!("gate id '{}' is not a valid slug", gate.id));
            }
            if !seen.insert(&gate.id) {
                warnings.push(format!("duplicate gate id '{}'", gate.id));
            }
        }

        for trigger in &self.triggers {
            if trigger.sections.is_empty() {
                warnings.push(format!(
                    "trigger '{}' activates no sections",
                    trigger.pattern
                ));
            }
        }

        let mut ordinals = std::collections::BTreeSet::new();
        for phase in &self.phases {
            if validate_id(&phase.id).is_err() {
                warnings.push(format!("phase id '{}' is not a valid slug", phase.id));
            }
            if !ordinals.insert(phase.ordinal) {
                warnings.push(format!(
                    "phase '{}' reuses ordinal {}",
                    phase.id, phase.ordinal
                ));
            }
        }

        warnings
    }

    /// Executor options with the strict-validation flag folded in.
    pub fn effective_executor_options(&self) -> ExecutorOptions {
        let mut options = self.executor.clone();
        if self.strict_validation {
            options.continue_on_warning = false;
            options.fail_fast = true;
        }
        options
    }

    /// Validation executor wired from the effective options and the
    /// learning flag.
    pub fn build_executor(&self) -> ValidationExecutor {
        ValidationExecutor::new(self.effective_executor_options())
            .with_learning(self.learning_enabled)
    }

    /// Command lifecycle wired the same way.
    pub fn build_lifecycle(&self) -> CommandLifecycle {
        CommandLifecycle::new(self.effective_executor_options())
            .with_learning(self.learning_enabled)
    }

    /// Build a context assembler from the layer and trigger declarations.
    pub fn build_assembler(&self) -> ContextAssembler {
        let fallback = if !self.auto_compression
            && matches!(
                self.fallback,
                FallbackStrategy::CompressContent | FallbackStrategy::SummarizeContent
            ) {
            FallbackStrategy::TruncateLowestPriority
        } else {
            self.fallback
        };

        let mut assembler = ContextAssembler::new(
            TokenBudget::with_reserved(self.total_budget, self.reserved),
            fallback,
        );
        for (&kind, config) in &self.layers {
            let mut layer = ContextLayer::new(
                kind,
                TokenBudget::with_reserved(config.budget, config.reserved),
            )
            .with_rules(config.rules.clone());
            layer.enabled = config.enabled;
            assembler.set_layer(layer);
        }
        for trigger in &self.triggers {
            assembler.declare_trigger(trigger.clone());
        }
        assembler
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::GateType;

    #[test]
    fn default_config_is_clean() {
        let config = WardenConfig::default();
        assert!(config.validate().is_empty());
        assert_eq!(config.phases.len(), 5);
        assert_eq!(config.phases[0].id, "ideation");
        assert_eq!(config.phases[1].prerequisites, vec!["ideation"]);
    }

    #[test]
    fn yaml_roundtrip() {
        let mut config = WardenConfig::default();
        config
            .gates
            .push(ValidationGate::new("docs-complete", GateType::PreExecution));
        config
            .triggers
            .push(DynamicTrigger::new("*.rs", vec!["rust-style".to_string()]));

        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: WardenConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn minimal_yaml_uses_defaults() {
        let config: WardenConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, WardenConfig::default());
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(serde_yaml::from_str::<WardenConfig>("token_budget: 100\n").is_err());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = WardenConfig::default();
        config.total_budget = 4000;
        config.save(dir.path()).unwrap();

        let loaded = WardenConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.total_budget, 4000);
    }

    #[test]
    fn load_missing_is_not_initialized() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(matches!(
            WardenConfig::load(dir.path()),
            Err(WardenError::NotInitialized)
        ));
        assert_eq!(
            WardenConfig::load_or_default(dir.path()).unwrap(),
            WardenConfig::default()
        );
    }

    #[test]
    fn validate_flags_budget_problems() {
        let mut config = WardenConfig::default();
        config.reserved = config.total_budget;
        config
            .layers
            .insert(LayerKind::Dynamic, LayerConfig::with_budget(0));
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("reserved")));
        assert!(warnings.iter().any(|w| w.contains("zero budget")));
    }

    #[test]
    fn validate_flags_duplicate_gate_ids() {
        let mut config = WardenConfig::default();
        config
            .gates
            .push(ValidationGate::new("lint", GateType::PreExecution));
        config
            .gates
            .push(ValidationGate::new("lint", GateType::PostExecution));
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("duplicate gate id")));
    }

    #[test]
    fn strict_validation_hardens_executor_options() {
        let mut config = WardenConfig::default();
        config.strict_validation = true;
        let options = config.effective_executor_options();
        assert!(!options.continue_on_warning);
        assert!(options.fail_fast);
    }

    #[test]
    fn built_lifecycle_honors_strict_and_learning_flags() {
        use crate::context::GateContext;
        use crate::events::EventBus;
        use crate::gate::GateRequirements;
        use crate::history::ExecutionHistory;
        use crate::hooks::{CommandOutcome, CommandRun};
        use crate::registry::GateRegistry;

        let mut config = WardenConfig::default();
        config.strict_validation = true;
        config.learning_enabled = false;

        let mut reg = GateRegistry::in_memory();
        reg.register_gate(
            ValidationGate::new("needs-docs", GateType::PreExecution).with_requirements(
                GateRequirements {
                    files: vec!["docs/design.md".to_string()],
                    ..GateRequirements::default()
                },
            ),
        )
        .unwrap();
        let mut history = ExecutionHistory::new();
        let bus = EventBus::new();

        // Strict validation makes the blocking pre failure a hard stop.
        let mut lc = config.build_lifecycle();
        let err = lc
            .run(
                &mut reg,
                &mut history,
                &bus,
                &CommandRun::new("build"),
                &GateContext::for_phase("implementation"),
                |_| CommandOutcome::ok(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            WardenError::CommandBlocked { ref blocker, .. } if blocker == "needs-docs"
        ));

        // Learning off: the executor mines nothing for the same failure.
        let mut executor = config.build_executor();
        reg.reset_all();
        let report = executor
            .run_phase(
                &mut reg,
                &mut history,
                &bus,
                "implementation",
                &GateContext::for_phase("implementation"),
            )
            .unwrap();
        assert_eq!(report.summary.failed, 1);
        assert!(report.suggestions.is_empty());
    }

    #[test]
    fn assembler_honors_disabled_compression() {
        let mut config = WardenConfig::default();
        config.fallback = FallbackStrategy::CompressContent;
        config.auto_compression = false;
        // Nothing to assert structurally on the assembler itself; behavior
        // is covered by assembly tests. Here we only check construction.
        let _ = config.build_assembler();

        config.auto_compression = true;
        let _ = config.build_assembler();
    }
}
