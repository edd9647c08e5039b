use crate::error::{Result, WardenError};
use crate::fragment::{ContextFragment, FragmentKind, Priority};
use crate::token::{estimate_tokens, TokenBudget};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// LayerKind
// ---------------------------------------------------------------------------

/// The three configured layers plus the `dynamic` pseudo-layer populated by
/// triggers. Declaration order is dependency order: task depends on phase
/// depends on global; dynamic is resolved last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Global,
    Phase,
    Task,
    Dynamic,
}

impl LayerKind {
    /// All layers in dependency order.
    pub fn all() -> &'static [LayerKind] {
        &[
            LayerKind::Global,
            LayerKind::Phase,
            LayerKind::Task,
            LayerKind::Dynamic,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LayerKind::Global => "global",
            LayerKind::Phase => "phase",
            LayerKind::Task => "task",
            LayerKind::Dynamic => "dynamic",
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// LayerRule
// ---------------------------------------------------------------------------

/// Field of a fragment a rule condition inspects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", rename_all = "snake_case")]
pub enum RuleCondition {
    /// Matches fragments carrying the tag.
    Tag { value: String },
    /// Matches fragments of the given kind.
    Kind { value: FragmentKind },
    /// Matches fragments whose source equals the value.
    Source { value: String },
    /// Matches fragments at or below the given priority rank.
    PriorityAtMost { value: Priority },
}

impl RuleCondition {
    pub fn matches(&self, fragment: &ContextFragment) -> bool {
        match self {
            RuleCondition::Tag { value } => fragment.has_tag(value),
            RuleCondition::Kind { value } => fragment.kind == *value,
            RuleCondition::Source { value } => fragment.source == *value,
            RuleCondition::PriorityAtMost { value } => {
                fragment.priority.rank() <= value.rank()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RuleAction {
    Include,
    Exclude,
    /// Lossy whitespace compression; token estimate is recomputed.
    Compress,
    /// Prepend a fixed header to the fragment content.
    Transform { prefix: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerRule {
    pub condition: RuleCondition,
    #[serde(flatten)]
    pub action: RuleAction,
}

// ---------------------------------------------------------------------------
// ContextLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextLayer {
    pub kind: LayerKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub budget: TokenBudget,
    #[serde(default)]
    pub rules: Vec<LayerRule>,
}

fn default_enabled() -> bool {
    true
}

impl ContextLayer {
    pub fn new(kind: LayerKind, budget: TokenBudget) -> Self {
        Self {
            kind,
            enabled: true,
            budget,
            rules: Vec::new(),
        }
    }

    pub fn with_rules(mut self, rules: Vec<LayerRule>) -> Self {
        self.rules = rules;
        self
    }

    /// Apply this layer's rules to a candidate. Returns `None` if the
    /// fragment is excluded, otherwise the (possibly rewritten) fragment.
    /// Exclusion wins over every other action.
    pub fn apply_rules(&self, fragment: &ContextFragment) -> Option<ContextFragment> {
        let matching: Vec<&LayerRule> = self
            .rules
            .iter()
            .filter(|r| r.condition.matches(fragment))
            .collect();

        if matching
            .iter()
            .any(|r| matches!(r.action, RuleAction::Exclude))
        {
            return None;
        }

        let mut result = fragment.clone();
        for rule in matching {
            match &rule.action {
                RuleAction::Include | RuleAction::Exclude => {}
                RuleAction::Compress => {
                    result.content = compress_whitespace(&result.content);
                    result.token_estimate = estimate_tokens(&result.content);
                }
                RuleAction::Transform { prefix } => {
                    result.content = format!("{prefix}{}", result.content);
                    result.token_estimate = estimate_tokens(&result.content);
                }
            }
        }
        Some(result)
    }

    /// Budgeted greedy selection: stable-sort candidates by priority rank
    /// descending then recency descending, accept while the charge fits
    /// `total - reserved`. No partial truncation happens here; fragments
    /// that do not fit are simply skipped once the first one overflows.
    pub fn select(&self, candidates: Vec<ContextFragment>) -> (Vec<ContextFragment>, TokenBudget) {
        let mut budget = self.budget.clone();
        budget.reset();

        if !self.enabled {
            return (Vec::new(), budget);
        }

        let mut ordered = candidates;
        ordered.sort_by(|a, b| {
            b.priority
                .rank()
                .cmp(&a.priority.rank())
                .then(b.created_at.cmp(&a.created_at))
        });

        let mut accepted = Vec::new();
        for fragment in ordered {
            if budget.charge(fragment.token_estimate) {
                accepted.push(fragment);
            } else {
                // Budget exhausted for this layer.
                break;
            }
        }
        (accepted, budget)
    }

    /// Strict variant of `select` for fail-fast assembly: dropping is not an
    /// option, so the first candidate that cannot be charged fails the whole
    /// selection with `BudgetExceeded` naming this layer.
    pub fn select_strict(
        &self,
        candidates: Vec<ContextFragment>,
    ) -> Result<(Vec<ContextFragment>, TokenBudget)> {
        let mut budget = self.budget.clone();
        budget.reset();

        if !self.enabled {
            return Ok((Vec::new(), budget));
        }

        let needed: usize = candidates.iter().map(|f| f.token_estimate).sum();
        let mut ordered = candidates;
        ordered.sort_by(|a, b| {
            b.priority
                .rank()
                .cmp(&a.priority.rank())
                .then(b.created_at.cmp(&a.created_at))
        });

        let mut accepted = Vec::new();
        for fragment in ordered {
            if !budget.charge(fragment.token_estimate) {
                return Err(WardenError::BudgetExceeded {
                    layer: self.kind.to_string(),
                    needed,
                    available: budget.total.saturating_sub(budget.reserved),
                });
            }
            accepted.push(fragment);
        }
        Ok((accepted, budget))
    }
}

/// Collapse runs of whitespace into single spaces, dropping blank lines.
pub fn compress_whitespace(content: &str) -> String {
    content.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
