use crate::layer::LayerKind;
use crate::token::estimate_tokens;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// FragmentKind / Priority
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentKind {
    Instruction,
    Knowledge,
    Pattern,
    Memory,
}

/// Priority classes, highest first. `Ord` follows declaration order, so
/// `Critical < High`; use `rank()` when sorting descending by importance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    /// Numeric rank, higher is more important.
    pub fn rank(self) -> u8 {
        match self {
            Priority::Critical => 3,
            Priority::High => 2,
            Priority::Medium => 1,
            Priority::Low => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// ContextFragment
// ---------------------------------------------------------------------------

/// An atomic unit of assembled content. Immutable once created: a newer
/// fragment with the same `key` supersedes the old one in the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextFragment {
    pub id: String,
    /// Logical key used for supersession; independent of the instance id.
    pub key: String,
    pub kind: FragmentKind,
    pub layer: LayerKind,
    pub priority: Priority,
    pub content: String,
    pub token_estimate: usize,
    pub source: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ContextFragment {
    pub fn new(
        key: impl Into<String>,
        kind: FragmentKind,
        layer: LayerKind,
        priority: Priority,
        content: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        let content = content.into();
        let token_estimate = estimate_tokens(&content);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            key: key.into(),
            kind,
            layer,
            priority,
            content,
            token_estimate,
            source: source.into(),
            created_at: Utc::now(),
            tags: Vec::new(),
            expires_at: None,
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_expiry(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    /// Override the derived token estimate (e.g. when the host has an exact
    /// count from its tokenizer).
    pub fn with_token_estimate(mut self, tokens: usize) -> Self {
        self.token_estimate = tokens;
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

// ---------------------------------------------------------------------------
// FragmentPool
// ---------------------------------------------------------------------------

/// All candidate fragments, keyed by logical key. Insertion with an existing
/// key replaces the old fragment (supersession); fragments themselves are
/// never mutated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FragmentPool {
    fragments: HashMap<String, ContextFragment>,
    /// Bumped on every mutation; lets callers detect staleness cheaply.
    #[serde(skip)]
    revision: u64,
}

impl FragmentPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fragment, superseding any existing fragment with the same
    /// key. Returns the superseded fragment, if any.
    pub fn insert(&mut self, fragment: ContextFragment) -> Option<ContextFragment> {
        self.revision += 1;
        self.fragments.insert(fragment.key.clone(), fragment)
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn get(&self, key: &str) -> Option<&ContextFragment> {
        self.fragments.get(key)
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Live (non-expired) fragments belonging to `layer`.
    pub fn for_layer(&self, layer: LayerKind, now: DateTime<Utc>) -> Vec<&ContextFragment> {
        let mut out: Vec<&ContextFragment> = self
            .fragments
            .values()
            .filter(|f| f.layer == layer && !f.is_expired(now))
            .collect();
        // Deterministic order regardless of map iteration.
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Drop expired fragments. Returns how many were evicted.
    pub fn evict_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.fragments.len();
        self.fragments.retain(|_, f| !f.is_expired(now));
        let evicted = before - self.fragments.len();
        if evicted > 0 {
            self.revision += 1;
        }
        evicted
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
