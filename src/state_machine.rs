//! Per-request phase tracking: Start → DetectingLanguage → Translating → Merging → Done.
//! Each orchestrator call owns its own tracker; nothing here is process-global.

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

/// Phases a translation request moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RequestPhase {
    Start,
    DetectingLanguage,
    Translating,
    Merging,
    Done,
    Failed,
}

impl std::fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestPhase::Start => write!(f, "Start"),
            RequestPhase::DetectingLanguage => write!(f, "DetectingLanguage"),
            RequestPhase::Translating => write!(f, "Translating"),
            RequestPhase::Merging => write!(f, "Merging"),
            RequestPhase::Done => write!(f, "Done"),
            RequestPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Validated phase transitions.
impl RequestPhase {
    /// Returns whether moving from `self` to `next` is valid.
    pub fn can_transition_to(self, next: RequestPhase) -> bool {
        matches!(
            (self, next),
            (RequestPhase::Start, RequestPhase::DetectingLanguage)
                | (RequestPhase::Start, RequestPhase::Translating) // source language supplied
                | (RequestPhase::Start, RequestPhase::Done) // cache hit
                | (RequestPhase::DetectingLanguage, RequestPhase::Translating)
                | (RequestPhase::Translating, RequestPhase::Merging)
                | (RequestPhase::Translating, RequestPhase::Done)
                | (RequestPhase::Merging, RequestPhase::Done)
                | (RequestPhase::Start, RequestPhase::Failed)
                | (RequestPhase::DetectingLanguage, RequestPhase::Failed)
                | (RequestPhase::Translating, RequestPhase::Failed)
                | (RequestPhase::Merging, RequestPhase::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RequestPhase::Done | RequestPhase::Failed)
    }
}

/// Phase tracker for a single request.
pub struct PhaseTracker {
    request_id: String,
    phase: RwLock<RequestPhase>,
}

impl PhaseTracker {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            phase: RwLock::new(RequestPhase::Start),
        }
    }

    pub fn current(&self) -> RequestPhase {
        *self.phase.read()
    }

    /// Attempt a transition. Returns Ok(new_phase) or Err with reason.
    pub fn transition(&self, next: RequestPhase) -> Result<RequestPhase, String> {
        let mut phase = self.phase.write();
        let current = *phase;
        if !current.can_transition_to(next) {
            let msg = format!("invalid transition: {} -> {}", current, next);
            warn!(request_id = %self.request_id, "{}", msg);
            return Err(msg);
        }
        *phase = next;
        debug!(request_id = %self.request_id, from = %current, to = %next, "request_phase");
        Ok(next)
    }

    /// Move to Failed unless the request already finished.
    pub fn fail(&self) {
        let mut phase = self.phase.write();
        if phase.is_terminal() {
            return;
        }
        let prev = *phase;
        *phase = RequestPhase::Failed;
        debug!(request_id = %self.request_id, from = %prev, "request_failed");
    }
}
