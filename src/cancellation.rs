//! Cancellation framework: race groups + per-session generation guards.
//! Race losers get a cooperative cancel signal; a newer page-translation batch
//! in the same session supersedes the older one.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Cancellation scope for one race. Every contender gets a child token;
/// the first winner cancels the rest.
pub struct RaceCancellation {
    root: CancellationToken,
}

impl RaceCancellation {
    /// Start a race scope nested under `parent`, so cancelling the caller
    /// also stops every contender.
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            root: parent.child_token(),
        }
    }

    /// Token handed to one contender.
    pub fn contender_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    /// Signal every contender still running that the race is decided.
    pub fn cancel_losers(&self) {
        self.root.cancel();
    }

    pub fn is_decided(&self) -> bool {
        self.root.is_cancelled()
    }
}

impl Drop for RaceCancellation {
    fn drop(&mut self) {
        // No contender outlives its race.
        self.root.cancel();
    }
}

/// Generation counter plus the token shared by that generation's work.
struct SessionSlot {
    state: Mutex<SlotState>,
}

struct SlotState {
    generation: u64,
    token: CancellationToken,
}

impl SessionSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                generation: 0,
                token: CancellationToken::new(),
            }),
        }
    }

    /// Cancel the running generation and open the next one.
    fn advance(self: &Arc<Self>) -> GenerationGuard {
        let mut state = self.state.lock();
        state.token.cancel();
        state.generation += 1;
        state.token = CancellationToken::new();
        GenerationGuard {
            slot: Arc::clone(self),
            generation: state.generation,
            token: state.token.child_token(),
        }
    }

    fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    fn cancel(&self) {
        self.state.lock().token.cancel();
    }
}

/// Checked by batch work before each chunk and before results are written.
/// Goes stale once its session starts a newer generation or is cancelled.
#[derive(Clone)]
pub struct GenerationGuard {
    slot: Arc<SessionSlot>,
    generation: u64,
    token: CancellationToken,
}

impl GenerationGuard {
    /// Guard that never goes stale, for callers without a session.
    pub fn detached() -> Self {
        let slot = Arc::new(SessionSlot::new());
        let token = slot.state.lock().token.child_token();
        Self {
            slot,
            generation: 0,
            token,
        }
    }

    pub fn is_current(&self) -> bool {
        self.slot.generation() == self.generation
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn should_continue(&self) -> bool {
        !self.is_cancelled() && self.is_current()
    }

    /// Cancelled together with the generation; handed to in-flight calls.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Explicit page-translation sessions, keyed by caller-chosen id.
/// Replaces any notion of a global "currently translating" flag.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<SessionSlot>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Begin new work in `session_id`, superseding whatever that session was doing.
    pub fn begin(&self, session_id: &str) -> GenerationGuard {
        let slot = Arc::clone(
            self.sessions
                .lock()
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(SessionSlot::new())),
        );
        let guard = slot.advance();
        debug!(session_id, generation = guard.generation(), "session generation advanced");
        guard
    }

    /// Like `begin`, but the session is finished when the lease drops, even
    /// if the work holding it is abandoned mid-flight.
    pub fn lease(self: &Arc<Self>, session_id: &str) -> SessionLease {
        SessionLease {
            registry: Arc::clone(self),
            session_id: session_id.to_string(),
            guard: self.begin(session_id),
        }
    }

    /// Forget the session once its latest generation is done.
    /// A stale guard finishing leaves the newer work registered.
    pub fn finish(&self, session_id: &str, guard: &GenerationGuard) {
        let mut sessions = self.sessions.lock();
        let latest = sessions
            .get(session_id)
            .is_some_and(|slot| Arc::ptr_eq(slot, &guard.slot) && guard.is_current());
        if latest {
            sessions.remove(session_id);
        }
    }

    /// Cancel the session's in-flight work. Returns false for unknown sessions.
    pub fn cancel(&self, session_id: &str) -> bool {
        let Some(slot) = self.sessions.lock().remove(session_id) else {
            return false;
        };
        slot.cancel();
        debug!(session_id, generation = slot.generation(), "session cancelled");
        true
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().len()
    }
}

/// One generation of a session, held for the duration of the work.
pub struct SessionLease {
    registry: Arc<SessionRegistry>,
    session_id: String,
    guard: GenerationGuard,
}

impl SessionLease {
    pub fn guard(&self) -> &GenerationGuard {
        &self.guard
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.guard.token.cancel();
        self.registry.finish(&self.session_id, &self.guard);
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
