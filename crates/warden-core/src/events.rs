use crate::gate::GateResult;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// Everything observers can see. Continuous-gate outcomes are *only*
/// observable here and in the execution history, never through a
/// synchronous return value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    ValidationPreStarted {
        phase: String,
        command: String,
    },
    ValidationPreCompleted {
        phase: String,
        command: String,
        passed: bool,
    },
    ValidationPostStarted {
        phase: String,
        command: String,
    },
    ValidationPostCompleted {
        phase: String,
        command: String,
        passed: bool,
    },
    GateEvaluated {
        result: GateResult,
    },
    GatePassed {
        gate_id: String,
    },
    GateFailed {
        gate_id: String,
        errors: Vec<String>,
    },
    GateFixed {
        gate_id: String,
        attempt: u32,
    },
    ContinuousGateCompleted {
        result: GateResult,
    },
    PhaseTransitionValidated {
        from: String,
        to: String,
        allowed: bool,
    },
    PhaseTransitionCompleted {
        from: String,
        to: String,
    },
    PhaseTransitionBlocked {
        from: String,
        to: String,
        blockers: Vec<String>,
    },
    PhaseTransitionForced {
        from: String,
        to: String,
        reason: String,
    },
}

impl Event {
    /// Dotted event name for subscribers that filter by prefix
    /// (`validation:pre:*`, `gate:*`, `phase:transition:*`).
    pub fn name(&self) -> &'static str {
        match self {
            Event::ValidationPreStarted { .. } => "validation:pre:started",
            Event::ValidationPreCompleted { .. } => "validation:pre:completed",
            Event::ValidationPostStarted { .. } => "validation:post:started",
            Event::ValidationPostCompleted { .. } => "validation:post:completed",
            Event::GateEvaluated { .. } => "gate:evaluated",
            Event::GatePassed { .. } => "gate:passed",
            Event::GateFailed { .. } => "gate:failed",
            Event::GateFixed { .. } => "gate:fixed",
            Event::ContinuousGateCompleted { .. } => "gate:continuous:completed",
            Event::PhaseTransitionValidated { .. } => "phase:transition:validated",
            Event::PhaseTransitionCompleted { .. } => "phase:transition:completed",
            Event::PhaseTransitionBlocked { .. } => "phase:transition:blocked",
            Event::PhaseTransitionForced { .. } => "phase:transition:forced",
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

type Subscriber = Box<dyn Fn(&Event)>;

/// Explicit publish/subscribe. Publishing never fails and never blocks on a
/// subscriber; subscribers are invoked in registration order.
#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<(Option<String>, Subscriber)>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every event.
    pub fn subscribe(&mut self, subscriber: Subscriber) {
        self.subscribers.push((None, subscriber));
    }

    /// Subscribe to events whose name starts with `prefix`
    /// (e.g. `"gate:"`, `"phase:transition:"`).
    pub fn subscribe_prefix(&mut self, prefix: impl Into<String>, subscriber: Subscriber) {
        self.subscribers.push((Some(prefix.into()), subscriber));
    }

    pub fn publish(&self, event: &Event) {
        for (prefix, subscriber) in &self.subscribers {
            let wants = match prefix {
                None => true,
                Some(p) => event.name().starts_with(p.as_str()),
            };
            if wants {
                subscriber(event);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
