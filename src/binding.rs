//! Per-listener bookkeeping inside a cell.
//!
//! A [`Binding`] links one listener to one cell. It records whether the
//! listener is currently eligible for delivery and the last version it was
//! handed, so a version is never delivered twice to the same binding.

use crate::activity::{source_addr, ActivitySource, ObserverKey};
use crate::listener::Listener;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

/// Version of a cell that has never been written.
pub(crate) const START_VERSION: i64 = -1;

/// How a listener's eligibility is decided.
#[derive(Clone)]
pub enum ListenScope {
    /// Eligible from registration until removed.
    Always,
    /// Eligible while the source is at least started; removed when it is destroyed.
    Bound(Arc<dyn ActivitySource>),
}

impl ListenScope {
    pub fn bound(source: Arc<dyn ActivitySource>) -> Self {
        ListenScope::Bound(source)
    }
}

impl fmt::Debug for ListenScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenScope::Always => f.write_str("Always"),
            ListenScope::Bound(source) => f
                .debug_tuple("Bound")
                .field(&source_addr(&**source))
                .finish(),
        }
    }
}

pub(crate) struct Binding<T> {
    listener: Listener<T>,
    scope: ListenScope,
    observation: Mutex<Option<ObserverKey>>,
    active: AtomicBool,
    detached: AtomicBool,
    last_version: AtomicI64,
}

impl<T> Binding<T> {
    pub fn new(listener: Listener<T>, scope: ListenScope, last_version: i64) -> Self {
        Self {
            listener,
            scope,
            observation: Mutex::new(None),
            active: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            last_version: AtomicI64::new(last_version),
        }
    }

    pub fn listener(&self) -> &Listener<T> {
        &self.listener
    }

    pub fn source(&self) -> Option<&Arc<dyn ActivitySource>> {
        match &self.scope {
            ListenScope::Always => None,
            ListenScope::Bound(source) => Some(source),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Store the flag, returning whether it changed.
    pub fn swap_active(&self, active: bool) -> bool {
        self.active.swap(active, Ordering::AcqRel) != active
    }

    pub fn should_be_active(&self) -> bool {
        match &self.scope {
            ListenScope::Always => true,
            ListenScope::Bound(source) => source.current_state().is_active(),
        }
    }

    /// Record `version` as delivered unless this binding already saw it or a newer one.
    pub fn claim(&self, version: i64) -> bool {
        if self.last_version.load(Ordering::Acquire) >= version {
            return false;
        }
        self.last_version.store(version, Ordering::Release);
        true
    }

    /// Whether registering with `scope` would be the same registration.
    pub fn matches(&self, scope: &ListenScope) -> bool {
        match (&self.scope, scope) {
            (ListenScope::Always, ListenScope::Always) => true,
            (ListenScope::Bound(ours), ListenScope::Bound(theirs)) => {
                source_addr(&**ours) == source_addr(&**theirs)
            }
            _ => false,
        }
    }

    pub fn is_attached_to(&self, source: &dyn ActivitySource) -> bool {
        self.source()
            .is_some_and(|ours| source_addr(&**ours) == source_addr(source))
    }

    pub fn set_observation(&self, key: ObserverKey) {
        *self.observation.lock() = Some(key);
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// Stop observing the activity source. Idempotent.
    pub fn detach(&self) {
        self.detached.store(true, Ordering::Release);
        let key = self.observation.lock().take();
        if let (Some(source), Some(key)) = (self.source(), key) {
            source.unobserve(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityState, Lifecycle};

    fn listener() -> Listener<i32> {
        Listener::new(|_| {})
    }

    #[test]
    fn test_claim_is_once_per_version() {
        let binding = Binding::new(listener(), ListenScope::Always, START_VERSION);
        assert!(!binding.claim(START_VERSION));
        assert!(binding.claim(0));
        assert!(!binding.claim(0));
        assert!(binding.claim(3));
        assert!(!binding.claim(2));
        assert!(binding.claim(4));
    }

    #[test]
    fn test_swap_active_reports_change() {
        let binding = Binding::new(listener(), ListenScope::Always, START_VERSION);
        assert!(binding.swap_active(true));
        assert!(!binding.swap_active(true));
        assert!(binding.is_active());
        assert!(binding.swap_active(false));
    }

    #[test]
    fn test_bound_follows_source_state() {
        let lifecycle = Arc::new(Lifecycle::new());
        let binding = Binding::new(
            listener(),
            ListenScope::bound(lifecycle.clone()),
            START_VERSION,
        );
        assert!(!binding.should_be_active());
        lifecycle.set_state(ActivityState::Resumed);
        assert!(binding.should_be_active());
    }

    #[test]
    fn test_matches_compares_source_identity() {
        let first = Arc::new(Lifecycle::new());
        let second = Arc::new(Lifecycle::new());
        let binding = Binding::new(listener(), ListenScope::bound(first.clone()), START_VERSION);

        assert!(binding.matches(&ListenScope::bound(first.clone())));
        assert!(!binding.matches(&ListenScope::bound(second.clone())));
        assert!(!binding.matches(&ListenScope::Always));
        assert!(binding.is_attached_to(&*first));
        assert!(!binding.is_attached_to(&*second));
    }

    #[test]
    fn test_detach_unobserves_source() {
        let lifecycle = Arc::new(Lifecycle::new());
        let binding = Binding::new(
            listener(),
            ListenScope::bound(lifecycle.clone()),
            START_VERSION,
        );
        binding.set_observation(lifecycle.observe(Arc::new(|_: ActivityState| {})));
        assert_eq!(lifecycle.observer_count(), 1);

        binding.detach();
        binding.detach();
        assert!(binding.is_detached());
        assert_eq!(lifecycle.observer_count(), 0);
    }
}
