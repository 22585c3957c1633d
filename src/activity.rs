//! Activity sources that gate delivery to bound listeners.
//!
//! A listener registered against an [`ActivitySource`] only receives values
//! while the source reports a state at least as active as
//! [`ActivityState::Started`], and is detached for good once the source
//! reaches [`ActivityState::Destroyed`].

use parking_lot::Mutex;
use slotmap::{new_key_type, SlotMap};
use std::fmt;
use std::sync::Arc;

new_key_type! {
    /// Handle to an observer registered with an [`ActivitySource`].
    pub struct ObserverKey;
}

/// Callback receiving the new state after every transition.
pub type StateObserver = Arc<dyn Fn(ActivityState) + Send + Sync>;

/// Ordered activity states, least active first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ActivityState {
    /// Terminal. No transitions follow.
    Destroyed,
    Initialized,
    Created,
    Started,
    Resumed,
}

impl ActivityState {
    pub fn is_at_least(self, other: ActivityState) -> bool {
        self >= other
    }

    /// Whether a bound listener should receive values in this state.
    pub fn is_active(self) -> bool {
        self.is_at_least(ActivityState::Started)
    }
}

/// Capability consumed by bound bindings.
///
/// Implementations must deliver transitions on the coordinating context of the
/// cells they gate. Identity is the allocation behind the `Arc` the source is
/// registered with.
pub trait ActivitySource: Send + Sync {
    fn current_state(&self) -> ActivityState;

    fn observe(&self, observer: StateObserver) -> ObserverKey;

    fn unobserve(&self, key: ObserverKey);
}

pub(crate) fn source_addr(source: &dyn ActivitySource) -> *const () {
    source as *const _ as *const ()
}

/// A manually driven [`ActivitySource`].
///
/// Starts in [`ActivityState::Initialized`]. Owners move it with
/// [`Lifecycle::set_state`]; once destroyed it ignores further transitions and
/// drops its observers.
pub struct Lifecycle {
    state: Mutex<ActivityState>,
    observers: Mutex<SlotMap<ObserverKey, StateObserver>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ActivityState::Initialized),
            observers: Mutex::new(SlotMap::with_key()),
        }
    }

    /// Move to `state` and notify every observer.
    ///
    /// Repeating the current state, or any transition after destruction, is
    /// ignored.
    pub fn set_state(&self, state: ActivityState) {
        let observers: Vec<StateObserver> = {
            let mut current = self.state.lock();
            if *current == ActivityState::Destroyed || *current == state {
                return;
            }
            *current = state;
            self.observers.lock().values().cloned().collect()
        };

        tracing::trace!(?state, observers = observers.len(), "lifecycle transition");
        for observer in observers {
            observer(state);
        }

        if state == ActivityState::Destroyed {
            self.observers.lock().clear();
        }
    }

    /// Shorthand for `set_state(ActivityState::Destroyed)`.
    pub fn destroy(&self) {
        self.set_state(ActivityState::Destroyed);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivitySource for Lifecycle {
    fn current_state(&self) -> ActivityState {
        *self.state.lock()
    }

    fn observe(&self, observer: StateObserver) -> ObserverKey {
        self.observers.lock().insert(observer)
    }

    fn unobserve(&self, key: ObserverKey) {
        self.observers.lock().remove(key);
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("state", &self.current_state())
            .field("observers", &self.observer_count())
            .finish()
    }
}
