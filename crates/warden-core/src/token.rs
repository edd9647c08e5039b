use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Token estimation
// ---------------------------------------------------------------------------

/// Rough token estimate: one token per four characters, minimum one for
/// non-empty content. Good enough for budget accounting; exact counts are
/// the host's concern.
pub fn estimate_tokens(content: &str) -> usize {
    if content.is_empty() {
        return 0;
    }
    (content.chars().count() / 4).max(1)
}

// ---------------------------------------------------------------------------
// TokenBudget
// ---------------------------------------------------------------------------

/// Capacity accounting for a layer or for the whole assembly.
///
/// Invariant: `used + reserved <= total`. `charge` refuses (and leaves the
/// budget untouched) rather than violate it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBudget {
    pub total: usize,
    #[serde(default)]
    pub reserved: usize,
    #[serde(default)]
    pub used: usize,
}

impl TokenBudget {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            reserved: 0,
            used: 0,
        }
    }

    pub fn with_reserved(total: usize, reserved: usize) -> Self {
        Self {
            total,
            reserved: reserved.min(total),
            used: 0,
        }
    }

    pub fn available(&self) -> usize {
        self.total.saturating_sub(self.used + self.reserved)
    }

    pub fn fits(&self, tokens: usize) -> bool {
        self.used + self.reserved + tokens <= self.total
    }

    /// Charge `tokens` against the budget. Returns false (without mutating)
    /// if the charge would break the invariant.
    pub fn charge(&mut self, tokens: usize) -> bool {
        if !self.fits(tokens) {
            return false;
        }
        self.used += tokens;
        true
    }

    pub fn release(&mut self, tokens: usize) {
        self.used = self.used.saturating_sub(tokens);
    }

    pub fn reset(&mut self) {
        self.used = 0;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
