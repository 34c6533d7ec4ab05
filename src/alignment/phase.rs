// Alignment run phases and the transitions between them

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlignmentPhase {
    Idle,
    Coarse,
    Fine,
    Aligned,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    BeginCoarse,
    /// Coarse succeeded, or a fine-only run skips it
    BeginFine,
    Converged,
    Failed,
    Cancelled,
}

impl AlignmentPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AlignmentPhase::Aligned | AlignmentPhase::Failed | AlignmentPhase::Cancelled
        )
    }

    pub fn advance(self, event: PhaseEvent) -> Option<AlignmentPhase> {
        use AlignmentPhase as P;
        use PhaseEvent as E;

        match (self, event) {
            (P::Idle, E::BeginCoarse) => Some(P::Coarse),
            (P::Idle | P::Coarse, E::BeginFine) => Some(P::Fine),
            (P::Coarse | P::Fine, E::Converged) => Some(P::Aligned),
            (P::Idle | P::Coarse | P::Fine, E::Failed) => Some(P::Failed),
            (P::Idle | P::Coarse | P::Fine, E::Cancelled) => Some(P::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for AlignmentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AlignmentPhase::Idle => "IDLE",
            AlignmentPhase::Coarse => "COARSE",
            AlignmentPhase::Fine => "FINE",
            AlignmentPhase::Aligned => "ALIGNED",
            AlignmentPhase::Failed => "FAILED",
            AlignmentPhase::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Current phase of one run, logging every change
#[derive(Debug)]
pub(crate) struct PhaseTracker {
    phase: AlignmentPhase,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            phase: AlignmentPhase::Idle,
        }
    }

    pub fn current(&self) -> AlignmentPhase {
        self.phase
    }

    pub fn advance(&mut self, event: PhaseEvent) -> AlignmentPhase {
        match self.phase.advance(event) {
            Some(next) => {
                debug!(from = %self.phase, to = %next, "Alignment phase changed");
                self.phase = next;
            }
            None => warn!(phase = %self.phase, event = ?event, "Ignoring phase event"),
        }
        self.phase
    }
}
