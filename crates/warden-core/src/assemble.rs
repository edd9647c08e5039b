use crate::error::{Result, WardenError};
use crate::fragment::{ContextFragment, FragmentPool};
use crate::layer::{compress_whitespace, ContextLayer, LayerKind};
use crate::token::{estimate_tokens, TokenBudget};
use crate::trigger::{DynamicTrigger, TriggerSet};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

// ---------------------------------------------------------------------------
// FallbackStrategy
// ---------------------------------------------------------------------------

/// What to do when per-layer selection still overflows the aggregate budget.
/// Exactly one strategy is active per configuration; they are never chained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    TruncateOldest,
    TruncateLowestPriority,
    CompressContent,
    SummarizeContent,
    FailFast,
}

impl FallbackStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            FallbackStrategy::TruncateOldest => "truncate_oldest",
            FallbackStrategy::TruncateLowestPriority => "truncate_lowest_priority",
            FallbackStrategy::CompressContent => "compress_content",
            FallbackStrategy::SummarizeContent => "summarize_content",
            FallbackStrategy::FailFast => "fail_fast",
        }
    }
}

impl fmt::Display for FallbackStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// AssemblyRequest / AssembledContext
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssemblyRequest {
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub tools: Vec<String>,
}

impl AssemblyRequest {
    pub fn for_phase(phase: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            ..Self::default()
        }
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssemblyStats {
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_ratio: Option<f64>,
    pub cache_hit: bool,
    pub fragments_considered: usize,
    pub fragments_dropped: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssembledContext {
    pub content: String,
    pub token_count: usize,
    /// Layers that contributed at least one fragment, in dependency order.
    pub layers: Vec<String>,
    pub stats: AssemblyStats,
}

// ---------------------------------------------------------------------------
// ContextAssembler
// ---------------------------------------------------------------------------

pub struct ContextAssembler {
    layers: BTreeMap<LayerKind, ContextLayer>,
    pool: FragmentPool,
    triggers: TriggerSet,
    declarations: Vec<DynamicTrigger>,
    aggregate: TokenBudget,
    fallback: FallbackStrategy,
    cache: Option<(String, AssembledContext)>,
}

impl ContextAssembler {
    pub fn new(aggregate: TokenBudget, fallback: FallbackStrategy) -> Self {
        let mut layers = BTreeMap::new();
        for &kind in LayerKind::all() {
            layers.insert(kind, ContextLayer::new(kind, TokenBudget::new(aggregate.total)));
        }
        Self {
            layers,
            pool: FragmentPool::new(),
            triggers: TriggerSet::new(),
            declarations: Vec::new(),
            aggregate,
            fallback,
            cache: None,
        }
    }

    pub fn set_layer(&mut self, layer: ContextLayer) {
        self.layers.insert(layer.kind, layer);
        self.cache = None;
    }

    pub fn layer(&self, kind: LayerKind) -> Option<&ContextLayer> {
        self.layers.get(&kind)
    }

    pub fn declare_trigger(&mut self, trigger: DynamicTrigger) {
        self.declarations.push(trigger);
        self.cache = None;
    }

    pub fn pool_mut(&mut self) -> &mut FragmentPool {
        self.cache = None;
        &mut self.pool
    }

    pub fn pool(&self) -> &FragmentPool {
        &self.pool
    }

    pub fn triggers(&self) -> &TriggerSet {
        &self.triggers
    }

    pub fn clear_triggers(&mut self) {
        self.triggers.clear();
        self.cache = None;
    }

    /// Assemble the context document for a request.
    ///
    /// Aside from trigger accumulation (a session-level effect by design)
    /// and the result cache, this is a pure function of the layer configs,
    /// fragment pool, trigger set, and aggregate budget. Fails only with
    /// `BudgetExceeded`, and only under `fail_fast`.
    pub fn assemble(&mut self, request: &AssemblyRequest) -> Result<AssembledContext> {
        let started = Instant::now();
        let added = self.triggers.activate(&request.files, &request.tools);
        if !added.is_empty() {
            tracing::debug!(patterns = ?added, "triggers activated");
        }

        let fingerprint = self.fingerprint(request);
        if let Some((cached_key, cached)) = &self.cache {
            if *cached_key == fingerprint {
                let mut hit = cached.clone();
                hit.stats.cache_hit = true;
                hit.stats.duration_ms = started.elapsed().as_millis() as u64;
                return Ok(hit);
            }
        }

        let now = Utc::now();
        let mut accepted: Vec<ContextFragment> = Vec::new();
        let mut contributing: Vec<String> = Vec::new();
        let mut considered = 0usize;

        for &kind in LayerKind::all() {
            let Some(layer) = self.layers.get(&kind) else {
                continue;
            };
            let candidates: Vec<ContextFragment> = self
                .pool
                .for_layer(kind, now)
                .into_iter()
                .filter(|f| self.relevant(kind, f, request))
                .filter_map(|f| layer.apply_rules(f))
                .collect();
            considered += candidates.len();

            // Fail-fast refuses to drop at the layer level too; the other
            // strategies keep greedy per-layer selection and let the
            // aggregate pass reconcile.
            let (selected, budget) = if self.fallback == FallbackStrategy::FailFast {
                layer.select_strict(candidates)?
            } else {
                layer.select(candidates)
            };
            if !selected.is_empty() {
                tracing::debug!(layer = %kind, fragments = selected.len(), used = budget.used, "layer selected");
                contributing.push(kind.to_string());
                accepted.extend(selected);
            }
        }

        // Concatenation order: priority first, then layer dependency order,
        // then recency.
        accepted.sort_by(|a, b| {
            b.priority
                .rank()
                .cmp(&a.priority.rank())
                .then(a.layer.cmp(&b.layer))
                .then(b.created_at.cmp(&a.created_at))
        });

        let limit = self.aggregate.total.saturating_sub(self.aggregate.reserved);
        let total: usize = accepted.iter().map(|f| f.token_estimate).sum();
        let before_fallback = accepted.len();
        let mut compression_ratio = None;

        if total > limit {
            match self.fallback {
                FallbackStrategy::FailFast => {
                    return Err(WardenError::BudgetExceeded {
                        layer: "aggregate".to_string(),
                        needed: total,
                        available: limit,
                    });
                }
                FallbackStrategy::TruncateOldest => {
                    drop_while_over(&mut accepted, limit, |a, b| a.created_at.cmp(&b.created_at));
                }
                FallbackStrategy::TruncateLowestPriority => {
                    drop_while_over(&mut accepted, limit, |a, b| {
                        a.priority
                            .rank()
                            .cmp(&b.priority.rank())
                            .then(a.created_at.cmp(&b.created_at))
                    });
                }
                FallbackStrategy::CompressContent => {
                    let before = total;
                    for f in accepted.iter_mut() {
                        f.content = compress_whitespace(&f.content);
                        f.token_estimate = estimate_tokens(&f.content);
                    }
                    let after: usize = accepted.iter().map(|f| f.token_estimate).sum();
                    if before > 0 {
                        compression_ratio = Some(after as f64 / before as f64);
                    }
                    // Rewriting alone cannot bound the total; enforce the
                    // budget by dropping lowest-priority tails if needed.
                    drop_while_over(&mut accepted, limit, |a, b| {
                        a.priority.rank().cmp(&b.priority.rank())
                    });
                }
                FallbackStrategy::SummarizeContent => {
                    let before = total;
                    for f in accepted.iter_mut() {
                        f.content = summarize(&f.content);
                        f.token_estimate = estimate_tokens(&f.content);
                    }
                    let after: usize = accepted.iter().map(|f| f.token_estimate).sum();
                    if before > 0 {
                        compression_ratio = Some(after as f64 / before as f64);
                    }
                    drop_while_over(&mut accepted, limit, |a, b| {
                        a.priority.rank().cmp(&b.priority.rank())
                    });
                }
            }
            tracing::debug!(strategy = %self.fallback, kept = accepted.len(), "aggregate fallback applied");
        }

        let token_count: usize = accepted.iter().map(|f| f.token_estimate).sum();
        let content = accepted
            .iter()
            .map(|f| f.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        // Contributing layers may have shrunk after the fallback pass.
        let still_present: Vec<String> = contributing
            .into_iter()
            .filter(|name| accepted.iter().any(|f| f.layer.as_str() == name))
            .collect();

        let result = AssembledContext {
            content,
            token_count,
            layers: still_present,
            stats: AssemblyStats {
                duration_ms: started.elapsed().as_millis() as u64,
                compression_ratio,
                cache_hit: false,
                fragments_considered: considered,
                fragments_dropped: before_fallback - accepted.len(),
            },
        };
        self.cache = Some((fingerprint, result.clone()));
        Ok(result)
    }

    /// Phase-layer fragments may be pinned to a phase via a `phase:<id>`
    /// tag; task-layer fragments via `task:<id>`. Untagged fragments apply
    /// everywhere. Dynamic-layer fragments require an active trigger naming
    /// their key.
    fn relevant(&self, kind: LayerKind, fragment: &ContextFragment, request: &AssemblyRequest) -> bool {
        match kind {
            LayerKind::Global => true,
            LayerKind::Phase => {
                let pinned: Vec<&String> = fragment
                    .tags
                    .iter()
                    .filter(|t| t.starts_with("phase:"))
                    .collect();
                pinned.is_empty()
                    || pinned
                        .iter()
                        .any(|t| t.as_str() == format!("phase:{}", request.phase))
            }
            LayerKind::Task => {
                let pinned: Vec<&String> = fragment
                    .tags
                    .iter()
                    .filter(|t| t.starts_with("task:"))
                    .collect();
                match &request.task {
                    None => pinned.is_empty(),
                    Some(task) => {
                        pinned.is_empty()
                            || pinned.iter().any(|t| t.as_str() == format!("task:{task}"))
                    }
                }
            }
            LayerKind::Dynamic => self
                .triggers
                .matching(&self.declarations)
                .iter()
                .any(|d| d.sections.iter().any(|s| s == &fragment.key)),
        }
    }

    fn fingerprint(&self, request: &AssemblyRequest) -> String {
        let mut parts = vec![
            request.phase.clone(),
            request.task.clone().unwrap_or_default(),
            self.pool.revision().to_string(),
        ];
        parts.extend(self.triggers.patterns().map(str::to_string));
        parts.join("|")
    }
}

fn drop_while_over<F>(fragments: &mut Vec<ContextFragment>, limit: usize, drop_order: F)
where
    F: Fn(&ContextFragment, &ContextFragment) -> std::cmp::Ordering,
{
    let mut total: usize = fragments.iter().map(|f| f.token_estimate).sum();
    while total > limit && !fragments.is_empty() {
        let victim = fragments
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| drop_order(a, b))
            .map(|(i, _)| i)
            .unwrap_or(0);
        let removed = fragments.remove(victim);
        total -= removed.token_estimate;
    }
}

/// Cheap derived summary: first line, hard-capped at 160 chars.
fn summarize(content: &str) -> String {
    let first = content.lines().next().unwrap_or("").trim();
    if first.chars().count() <= 160 {
        first.to_string()
    } else {
        let cut: String = first.chars().take(160).collect();
        format!("{cut}…")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::{FragmentKind, Priority};

    fn frag(key: &str, layer: LayerKind, priority: Priority, tokens: usize) -> ContextFragment {
        ContextFragment::new(key, FragmentKind::Knowledge, layer, priority, "body text", "test")
            .with_token_estimate(tokens)
    }

    fn assembler(total: usize, fallback: FallbackStrategy) -> ContextAssembler {
        ContextAssembler::new(TokenBudget::new(total), fallback)
    }

    #[test]
    fn truncate_lowest_priority_keeps_high_fragment() {
        // Budget 100, fragments of 60 (high) and 50 (low): only the high
        // one survives.
        let mut asm = assembler(100, FallbackStrategy::TruncateLowestPriority);
        // Per-layer budget admits both so the aggregate pass decides.
        asm.set_layer(ContextLayer::new(LayerKind::Global, TokenBudget::new(200)));
        asm.pool_mut()
            .insert(frag("high", LayerKind::Global, Priority::High, 60));
        asm.pool_mut()
            .insert(frag("low", LayerKind::Global, Priority::Low, 50));

        let result = asm.assemble(&AssemblyRequest::for_phase("design")).unwrap();
        assert_eq!(result.token_count, 60);
        assert_eq!(result.stats.fragments_dropped, 1);
    }

    #[test]
    fn fail_fast_raises_budget_exceeded() {
        let mut asm = assembler(100, FallbackStrategy::FailFast);
        asm.set_layer(ContextLayer::new(LayerKind::Global, TokenBudget::new(200)));
        asm.pool_mut()
            .insert(frag("a", LayerKind::Global, Priority::High, 60));
        asm.pool_mut()
            .insert(frag("b", LayerKind::Global, Priority::Low, 50));

        let err = asm
            .assemble(&AssemblyRequest::for_phase("design"))
            .unwrap_err();
        assert!(matches!(err, WardenError::BudgetExceeded { .. }));
    }

    #[test]
    fn fail_fast_raises_budget_exceeded_on_layer_overflow() {
        // Layer budget 100 with fragments of 60 and 50: the global layer
        // itself overflows, before any aggregate reconciliation.
        let mut asm = assembler(100, FallbackStrategy::FailFast);
        asm.pool_mut()
            .insert(frag("high", LayerKind::Global, Priority::High, 60));
        asm.pool_mut()
            .insert(frag("low", LayerKind::Global, Priority::Low, 50));

        let err = asm
            .assemble(&AssemblyRequest::for_phase("design"))
            .unwrap_err();
        let WardenError::BudgetExceeded {
            layer,
            needed,
            available,
        } = err
        else {
            panic!("expected BudgetExceeded, got {err:?}");
        };
        assert_eq!(layer, "global");
        assert_eq!(needed, 110);
        assert_eq!(available, 100);
    }

    #[test]
    fn non_fail_fast_strategies_always_fit_budget() {
        for strategy in [
            FallbackStrategy::TruncateOldest,
            FallbackStrategy::TruncateLowestPriority,
            FallbackStrategy::CompressContent,
            FallbackStrategy::SummarizeContent,
        ] {
            let mut asm = assembler(80, strategy);
            asm.set_layer(ContextLayer::new(LayerKind::Global, TokenBudget::new(500)));
            for i in 0..6 {
                asm.pool_mut().insert(frag(
                    &format!("f{i}"),
                    LayerKind::Global,
                    Priority::Medium,
                    30,
                ));
            }
            let result = asm
                .assemble(&AssemblyRequest::for_phase("design"))
                .unwrap_or_else(|_| panic!("strategy {strategy} must not fail"));
            assert!(
                result.token_count <= 80,
                "strategy {strategy} exceeded budget: {}",
                result.token_count
            );
        }
    }

    #[test]
    fn truncate_oldest_drops_oldest_first() {
        let mut asm = assembler(100, FallbackStrategy::TruncateOldest);
        asm.set_layer(ContextLayer::new(LayerKind::Global, TokenBudget::new(500)));
        let old = {
            let mut f = frag("old", LayerKind::Global, Priority::High, 60);
            f.created_at = Utc::now() - chrono::Duration::hours(2);
            f
        };
        asm.pool_mut().insert(old);
        asm.pool_mut()
            .insert(frag("new", LayerKind::Global, Priority::High, 60));

        let result = asm.assemble(&AssemblyRequest::for_phase("design")).unwrap();
        assert_eq!(result.token_count, 60);
        assert!(result.content.contains("body text"));
        assert_eq!(result.stats.fragments_dropped, 1);
    }

    #[test]
    fn disabled_layer_contributes_nothing() {
        let mut asm = assembler(1000, FallbackStrategy::TruncateOldest);
        let mut layer = ContextLayer::new(LayerKind::Global, TokenBudget::new(500));
        layer.enabled = false;
        asm.set_layer(layer);
        asm.pool_mut()
            .insert(frag("a", LayerKind::Global, Priority::High, 10));

        let result = asm.assemble(&AssemblyRequest::for_phase("design")).unwrap();
        assert_eq!(result.token_count, 0);
        assert!(result.layers.is_empty());
    }

    #[test]
    fn dynamic_layer_requires_active_trigger() {
        let mut asm = assembler(1000, FallbackStrategy::TruncateOldest);
        asm.declare_trigger(DynamicTrigger::new("*.rs", vec!["rust-style".to_string()]));
        asm.pool_mut().insert(frag(
            "rust-style",
            LayerKind::Dynamic,
            Priority::Medium,
            10,
        ));

        // No .rs file in play: dynamic fragment stays out.
        let result = asm
            .assemble(&AssemblyRequest::for_phase("implementation"))
            .unwrap();
        assert_eq!(result.token_count, 0);

        // A .rs file activates the trigger, and it sticks for the session.
        let request = AssemblyRequest::for_phase("implementation")
            .with_files(vec!["src/main.rs".to_string()]);
        let result = asm.assemble(&request).unwrap();
        assert_eq!(result.token_count, 10);
        assert_eq!(result.layers, vec!["dynamic".to_string()]);

        let result = asm
            .assemble(&AssemblyRequest::for_phase("implementation"))
            .unwrap();
        assert_eq!(result.token_count, 10, "trigger set is monotone");
    }

    #[test]
    fn phase_pinned_fragments_filtered_by_request_phase() {
        let mut asm = assembler(1000, FallbackStrategy::TruncateOldest);
        asm.pool_mut().insert(
            frag("design-notes", LayerKind::Phase, Priority::High, 10)
                .with_tags(vec!["phase:design".to_string()]),
        );
        asm.pool_mut().insert(
            frag("qa-notes", LayerKind::Phase, Priority::High, 10)
                .with_tags(vec!["phase:qa".to_string()]),
        );

        let result = asm.assemble(&AssemblyRequest::for_phase("design")).unwrap();
        assert_eq!(result.token_count, 10);
    }

    #[test]
    fn repeat_request_hits_cache() {
        let mut asm = assembler(1000, FallbackStrategy::TruncateOldest);
        asm.pool_mut()
            .insert(frag("a", LayerKind::Global, Priority::High, 10));

        let request = AssemblyRequest::for_phase("design");
        let first = asm.assemble(&request).unwrap();
        assert!(!first.stats.cache_hit);
        let second = asm.assemble(&request).unwrap();
        assert!(second.stats.cache_hit);
        assert_eq!(second.content, first.content);

        // Pool mutation invalidates the cache.
        asm.pool_mut()
            .insert(frag("b", LayerKind::Global, Priority::High, 10));
        let third = asm.assemble(&request).unwrap();
        assert!(!third.stats.cache_hit);
    }

    #[test]
    fn compression_records_ratio() {
        let mut asm = assembler(10, FallbackStrategy::CompressContent);
        asm.set_layer(ContextLayer::new(LayerKind::Global, TokenBudget::new(500)));
        let f = ContextFragment::new(
            "doc",
            FragmentKind::Knowledge,
            LayerKind::Global,
            Priority::High,
            "word    word    word    word    word    word    word    word",
            "test",
        );
        asm.pool_mut().insert(f);

        let result = asm.assemble(&AssemblyRequest::for_phase("design")).unwrap();
        let ratio = result.stats.compression_ratio.unwrap();
        assert!(ratio < 1.0);
        assert!(result.token_count <= 10);
    }
}
