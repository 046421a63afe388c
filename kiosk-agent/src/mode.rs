//! Player mode state machine
//!
//! Gates which subsystem is active:
//!
//! ```text
//! PAIRING  -> PLAYBACK
//! PLAYBACK -> MENU | PAIRING
//! MENU     -> PLAYBACK | PAIRING
//! ```
//!
//! Transitions are serialized end to end: observers of one transition have
//! all returned before the next transition is evaluated, so they see changes
//! in commit order. Observers run on the caller's thread with the mode lock
//! released (they may read [`PlayerModeStateMachine::current`] but must not
//! request a transition). A panicking observer is logged and never reaches
//! the caller.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use kiosk_common::events::{AgentEvent, PlayerMode};
use tracing::{error, info};

use crate::error::{AgentError, Result};
use crate::state::SharedState;

/// Observer invoked with (old, new) after every committed transition
pub type ModeObserver = Box<dyn Fn(PlayerMode, PlayerMode) + Send + Sync>;

/// Result of a successful transition request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Changed { from: PlayerMode, to: PlayerMode },
    /// Requested mode was already current
    NoChange,
}

/// Is `from -> to` in the transition table?
pub fn is_allowed(from: PlayerMode, to: PlayerMode) -> bool {
    use PlayerMode::*;
    matches!(
        (from, to),
        (Pairing, Playback) | (Playback, Menu) | (Playback, Pairing) | (Menu, Playback) | (Menu, Pairing)
    )
}

/// Top-level player mode holder
pub struct PlayerModeStateMachine {
    /// Held from evaluation through observer notification
    sequence: Mutex<()>,
    current: Mutex<PlayerMode>,
    observers: RwLock<Vec<ModeObserver>>,
    state: Option<Arc<SharedState>>,
}

impl PlayerModeStateMachine {
    pub fn new(initial: PlayerMode) -> Self {
        Self {
            sequence: Mutex::new(()),
            current: Mutex::new(initial),
            observers: RwLock::new(Vec::new()),
            state: None,
        }
    }

    /// Start in PAIRING when unregistered, PLAYBACK otherwise
    pub fn for_pairing_status(paired: bool) -> Self {
        Self::new(if paired {
            PlayerMode::Playback
        } else {
            PlayerMode::Pairing
        })
    }

    /// Also publish transitions on the agent event channel
    pub fn with_events(mut self, state: Arc<SharedState>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn current(&self) -> PlayerMode {
        *self.lock()
    }

    /// Run `f` if `mode` is current, holding off transitions until it returns
    ///
    /// Must not be called from a mode observer.
    pub fn while_in<R>(&self, mode: PlayerMode, f: impl FnOnce() -> R) -> Option<R> {
        let _sequence = self.sequence_lock();
        if self.current() == mode {
            Some(f())
        } else {
            None
        }
    }

    /// Register an observer for committed transitions
    pub fn subscribe(&self, observer: ModeObserver) {
        self.observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(observer);
    }

    /// Move to `to` from whatever the current mode is
    pub fn transition(&self, to: PlayerMode) -> Result<TransitionOutcome> {
        self.transition_inner(None, to)
    }

    /// Move `from -> to` only if the current mode is still `from`
    ///
    /// When several threads race from the same source state, exactly one
    /// succeeds; the rest get [`AgentError::SourceMismatch`].
    pub fn compare_and_transition(
        &self,
        from: PlayerMode,
        to: PlayerMode,
    ) -> Result<TransitionOutcome> {
        self.transition_inner(Some(from), to)
    }

    fn transition_inner(
        &self,
        expected: Option<PlayerMode>,
        to: PlayerMode,
    ) -> Result<TransitionOutcome> {
        let _sequence = self.sequence_lock();
        let from = {
            let mut current = self.lock();
            let from = *current;

            if let Some(expected) = expected {
                if expected != from {
                    return Err(AgentError::SourceMismatch {
                        expected,
                        actual: from,
                    });
                }
            }
            if from == to {
                return Ok(TransitionOutcome::NoChange);
            }
            if !is_allowed(from, to) {
                return Err(AgentError::InvalidTransition { from, to });
            }

            *current = to;
            from
        };

        info!(from = %from, to = %to, "Player mode changed");
        self.notify(from, to);
        Ok(TransitionOutcome::Changed { from, to })
    }

    fn notify(&self, from: PlayerMode, to: PlayerMode) {
        let observers = self
            .observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for observer in observers.iter() {
            if catch_unwind(AssertUnwindSafe(|| observer(from, to))).is_err() {
                error!(from = %from, to = %to, "Mode observer panicked");
            }
        }

        if let Some(state) = &self.state {
            state.broadcast_event(AgentEvent::ModeChanged {
                from,
                to,
                timestamp: Utc::now(),
            });
        }
    }

    fn sequence_lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.sequence
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PlayerMode> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
