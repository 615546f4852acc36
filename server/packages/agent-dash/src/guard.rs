//! Per-actor admission control for one-shot agent runs.
//!
//! An actor (chat user, bot user, scheduled task) may have at most one run in
//! flight. A second request is rejected immediately rather than queued. The
//! guard also owns the small amount of state kept per actor between runs.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use agent_dash_error::SandboxError;
use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActorKey(String);

impl ActorKey {
    pub fn chat(user: &str) -> Self {
        Self(format!("chat:{user}"))
    }

    pub fn bot(user_id: impl fmt::Display) -> Self {
        Self(format!("bot:{user_id}"))
    }

    pub fn scheduled(task_id: &str) -> Self {
        Self(format!("scheduled:{task_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
struct InFlight {
    generation: u64,
    cancel: oneshot::Sender<()>,
}

#[derive(Debug, Default)]
struct ActorSlot {
    in_flight: Option<InFlight>,
    work_dir: Option<PathBuf>,
    session_reset: bool,
}

impl ActorSlot {
    fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.work_dir.is_none() && !self.session_reset
    }
}

#[derive(Debug, Default)]
struct GuardState {
    next_generation: u64,
    actors: HashMap<ActorKey, ActorSlot>,
}

#[derive(Debug, Default)]
pub struct ConcurrencyGuard {
    state: Mutex<GuardState>,
}

impl ConcurrencyGuard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, GuardState> {
        // The map stays consistent even if a holder panicked mid-update.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a run for `actor`, failing if one is already in flight.
    pub fn try_acquire(self: &Arc<Self>, actor: &ActorKey) -> Result<ExecutionLease, SandboxError> {
        let mut state = self.lock();
        state.next_generation += 1;
        let generation = state.next_generation;
        let slot = state.actors.entry(actor.clone()).or_default();
        if slot.in_flight.is_some() {
            return Err(SandboxError::ExecutionInProgress {
                actor: actor.to_string(),
            });
        }
        let (cancel_tx, cancel_rx) = oneshot::channel();
        slot.in_flight = Some(InFlight {
            generation,
            cancel: cancel_tx,
        });
        tracing::debug!(actor = %actor, generation, "execution slot acquired");
        Ok(ExecutionLease {
            guard: Arc::clone(self),
            actor: actor.clone(),
            generation,
            cancel: Some(cancel_rx),
        })
    }

    /// Cancel the in-flight run for `actor` and free its slot.
    ///
    /// Returns false when nothing was running.
    pub fn cancel(&self, actor: &ActorKey) -> bool {
        let in_flight = {
            let mut state = self.lock();
            let Some(slot) = state.actors.get_mut(actor) else {
                return false;
            };
            let in_flight = slot.in_flight.take();
            if slot.is_idle() {
                state.actors.remove(actor);
            }
            in_flight
        };
        match in_flight {
            Some(in_flight) => {
                tracing::info!(actor = %actor, generation = in_flight.generation, "cancelling execution");
                let _ = in_flight.cancel.send(());
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, actor: &ActorKey) -> bool {
        self.lock()
            .actors
            .get(actor)
            .is_some_and(|slot| slot.in_flight.is_some())
    }

    pub fn set_work_dir(&self, actor: &ActorKey, dir: impl Into<PathBuf>) {
        let mut state = self.lock();
        state.actors.entry(actor.clone()).or_default().work_dir = Some(dir.into());
    }

    pub fn work_dir(&self, actor: &ActorKey) -> Option<PathBuf> {
        self.lock()
            .actors
            .get(actor)
            .and_then(|slot| slot.work_dir.clone())
    }

    /// Working directory for `actor`, or `default` when none was chosen.
    pub fn work_dir_or(&self, actor: &ActorKey, default: &Path) -> PathBuf {
        self.work_dir(actor).unwrap_or_else(|| default.to_path_buf())
    }

    /// Make the next run of `actor` start a fresh agent conversation.
    pub fn reset_session(&self, actor: &ActorKey) {
        let mut state = self.lock();
        state.actors.entry(actor.clone()).or_default().session_reset = true;
    }

    /// Consume the reset flag set by [`reset_session`](Self::reset_session).
    pub fn take_session_reset(&self, actor: &ActorKey) -> bool {
        let mut state = self.lock();
        let Some(slot) = state.actors.get_mut(actor) else {
            return false;
        };
        let reset = std::mem::take(&mut slot.session_reset);
        if slot.is_idle() {
            state.actors.remove(actor);
        }
        reset
    }

    fn release(&self, actor: &ActorKey, generation: u64) {
        let mut state = self.lock();
        let Some(slot) = state.actors.get_mut(actor) else {
            return;
        };
        if slot
            .in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.generation == generation)
        {
            slot.in_flight = None;
            tracing::debug!(actor = %actor, generation, "execution slot released");
        }
        if slot.is_idle() {
            state.actors.remove(actor);
        }
    }
}

/// Proof of admission for one run. Dropping it frees the actor's slot.
#[derive(Debug)]
pub struct ExecutionLease {
    guard: Arc<ConcurrencyGuard>,
    actor: ActorKey,
    generation: u64,
    cancel: Option<oneshot::Receiver<()>>,
}

impl ExecutionLease {
    pub fn actor(&self) -> &ActorKey {
        &self.actor
    }

    /// Take the receiver that fires when the run is cancelled.
    ///
    /// The receiver resolves with an error if the slot is released first;
    /// callers should only treat `Ok(())` as a cancellation.
    pub fn take_cancel(&mut self) -> Option<oneshot::Receiver<()>> {
        self.cancel.take()
    }
}

impl Drop for ExecutionLease {
    fn drop(&mut self) {
        self.guard.release(&self.actor, self.generation);
    }
}
