//! Cells derived from other cells.
//!
//! A [`Mediator`] listens to any number of upstream cells, but only while it
//! has active listeners of its own: the first active listener plugs every
//! source in, losing the last one unplugs them all. An inactive mediator puts
//! no load on its upstream cells.

use crate::binding::START_VERSION;
use crate::cell::{ActivityHooks, CellId, LiveCell, WeakCell};
use crate::error::CellError;
use crate::listener::{Listener, ListenerId};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

/// What a source relays into and how, used to tell repeat additions from conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayKey {
    Listener { id: ListenerId, sticky: bool },
    Forwarding,
}

trait SourceEntry: Send + Sync {
    fn key(&self) -> RelayKey;

    /// Whether the upstream cell still exists.
    fn is_live(&self) -> bool;

    fn plug(&self) -> Result<(), CellError>;

    fn unplug(&self) -> Result<(), CellError>;
}

struct SourceBinding<S> {
    upstream: WeakCell<S>,
    relay: Listener<S>,
    key: RelayKey,
    sticky: bool,
}

impl<S: Send + Sync + 'static> SourceBinding<S> {
    fn new(upstream: &LiveCell<S>, listener: Listener<S>, key: RelayKey, sticky: bool) -> Self {
        let weak = upstream.downgrade();
        let last_seen = AtomicI64::new(START_VERSION);
        // A relay re-plugged as sticky may be offered a version it already passed on.
        let relay = Listener::new(move |value: &S| {
            let Some(upstream) = weak.upgrade() else {
                return;
            };
            let version = upstream.version();
            if last_seen.swap(version, Ordering::AcqRel) != version {
                listener.notify(value);
            }
        });
        Self {
            upstream: upstream.downgrade(),
            relay,
            key,
            sticky,
        }
    }
}

impl<S: Send + Sync + 'static> SourceEntry for SourceBinding<S> {
    fn key(&self) -> RelayKey {
        self.key
    }

    fn is_live(&self) -> bool {
        self.upstream.is_alive()
    }

    fn plug(&self) -> Result<(), CellError> {
        let Some(upstream) = self.upstream.upgrade() else {
            return Ok(());
        };
        tracing::debug!(source = ?upstream.id(), sticky = self.sticky, "plug source");
        if self.sticky {
            upstream.listen_forever_sticky(&self.relay)
        } else {
            upstream.listen_forever(&self.relay)
        }
    }

    fn unplug(&self) -> Result<(), CellError> {
        let Some(upstream) = self.upstream.upgrade() else {
            return Ok(());
        };
        tracing::debug!(source = ?upstream.id(), "unplug source");
        upstream.unregister_listener(&self.relay)
    }
}

#[derive(Default)]
struct SourceTable {
    entries: Mutex<IndexMap<CellId, Arc<dyn SourceEntry>>>,
}

impl SourceTable {
    fn snapshot(&self) -> Vec<Arc<dyn SourceEntry>> {
        self.entries.lock().values().cloned().collect()
    }

    /// Forget sources whose upstream cell has been dropped.
    fn prune(&self) {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live());
        if entries.len() != before {
            tracing::debug!(pruned = before - entries.len(), "pruned dropped sources");
        }
    }
}

impl ActivityHooks for SourceTable {
    fn on_active(&self) {
        self.prune();
        for entry in self.snapshot() {
            if let Err(err) = entry.plug() {
                tracing::warn!(%err, "Failed to plug mediator source");
            }
        }
    }

    fn on_inactive(&self) {
        self.prune();
        for entry in self.snapshot() {
            if let Err(err) = entry.unplug() {
                tracing::warn!(%err, "Failed to unplug mediator source");
            }
        }
    }
}

impl Drop for SourceTable {
    fn drop(&mut self) {
        for entry in self.entries.get_mut().values() {
            if let Err(err) = entry.unplug() {
                tracing::warn!(%err, "Failed to unplug source of dropped mediator");
            }
        }
    }
}

/// A cell whose value is fed by other cells.
///
/// Dereferences to its [`LiveCell`], so listeners register on a mediator
/// exactly as on any other cell. Upstream cells are held weakly: dropping a
/// source cell simply silences it.
pub struct Mediator<T> {
    cell: LiveCell<T>,
    sources: Arc<SourceTable>,
}

/// Non-owning handle to a [`Mediator`].
pub struct WeakMediator<T> {
    cell: WeakCell<T>,
    sources: Weak<SourceTable>,
}

impl<T> Clone for Mediator<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            sources: self.sources.clone(),
        }
    }
}

impl<T> Clone for WeakMediator<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            sources: self.sources.clone(),
        }
    }
}

impl<T> Deref for Mediator<T> {
    type Target = LiveCell<T>;

    fn deref(&self) -> &Self::Target {
        &self.cell
    }
}

impl<T> Mediator<T> {
    pub fn as_cell(&self) -> &LiveCell<T> {
        &self.cell
    }

    pub fn downgrade(&self) -> WeakMediator<T> {
        WeakMediator {
            cell: self.cell.downgrade(),
            sources: Arc::downgrade(&self.sources),
        }
    }

    /// Number of upstream cells that are still alive.
    pub fn source_count(&self) -> usize {
        self.sources.prune();
        self.sources.entries.lock().len()
    }

    pub fn has_source<S>(&self, upstream: &LiveCell<S>) -> bool {
        self.sources.entries.lock().contains_key(&upstream.id())
    }
}

impl<T: Send + Sync + 'static> Mediator<T> {
    pub fn new() -> Self {
        let sources = Arc::new(SourceTable::default());
        let cell = LiveCell::with_hooks(sources.clone());
        Self { cell, sources }
    }

    /// Start relaying values of `upstream` to `listener` while this mediator is active.
    ///
    /// Only writes made while plugged are relayed. Adding the same upstream
    /// with the same listener again is a no-op; with another listener, or the
    /// same listener through [`Mediator::add_source_sticky`], it fails with
    /// [`CellError::ConflictingSource`]. The upstream must live on this
    /// mediator's context.
    pub fn add_source<S: Send + Sync + 'static>(
        &self,
        upstream: &LiveCell<S>,
        listener: &Listener<S>,
    ) -> Result<(), CellError> {
        let key = RelayKey::Listener {
            id: listener.id(),
            sticky: false,
        };
        let entry = SourceBinding::new(upstream, listener.clone(), key, false);
        self.insert_source(upstream, entry)
    }

    /// Like [`Mediator::add_source`], but each time the mediator becomes
    /// active the upstream's latest value is relayed if it was not already.
    pub fn add_source_sticky<S: Send + Sync + 'static>(
        &self,
        upstream: &LiveCell<S>,
        listener: &Listener<S>,
    ) -> Result<(), CellError> {
        let key = RelayKey::Listener {
            id: listener.id(),
            sticky: true,
        };
        let entry = SourceBinding::new(upstream, listener.clone(), key, true);
        self.insert_source(upstream, entry)
    }

    /// Relay values of `upstream` straight into this mediator.
    pub fn add_forwarding_source(&self, upstream: &LiveCell<T>) -> Result<(), CellError>
    where
        T: Clone,
    {
        let target = self.downgrade();
        let forward = Listener::new(move |value: &T| {
            if let Some(mediator) = target.upgrade() {
                if let Err(err) = mediator.write(value.clone()) {
                    tracing::warn!(%err, "Failed to forward source value");
                }
            }
        });
        let entry = SourceBinding::new(upstream, forward, RelayKey::Forwarding, false);
        self.insert_source(upstream, entry)
    }

    fn insert_source<S: Send + Sync + 'static>(
        &self,
        upstream: &LiveCell<S>,
        entry: SourceBinding<S>,
    ) -> Result<(), CellError> {
        self.cell.context().ensure_current("add_source")?;
        upstream.context().ensure_current("add_source")?;
        self.sources.prune();
        let id = upstream.id();
        let entry: Arc<dyn SourceEntry> = Arc::new(entry);
        {
            let mut entries = self.sources.entries.lock();
            if let Some(existing) = entries.get(&id) {
                return if existing.key() == entry.key() {
                    Ok(())
                } else {
                    Err(CellError::ConflictingSource { cell: id })
                };
            }
            entries.insert(id, entry.clone());
        }
        tracing::debug!(mediator = ?self.cell.id(), source = ?id, "added source");
        if self.cell.has_active_listeners() {
            if let Err(err) = entry.plug() {
                self.sources.entries.lock().shift_remove(&id);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Stop listening to `upstream`. No-op if it is not a source.
    pub fn remove_source<S>(&self, upstream: &LiveCell<S>) -> Result<(), CellError> {
        self.cell.context().ensure_current("remove_source")?;
        let removed = self.sources.entries.lock().shift_remove(&upstream.id());
        match removed {
            Some(entry) => {
                tracing::debug!(mediator = ?self.cell.id(), source = ?upstream.id(), "removed source");
                entry.unplug()
            }
            None => Ok(()),
        }
    }
}

impl<T> WeakMediator<T> {
    pub fn upgrade(&self) -> Option<Mediator<T>> {
        Some(Mediator {
            cell: self.cell.upgrade()?,
            sources: self.sources.upgrade()?,
        })
    }
}

impl<T: Send + Sync + 'static> Default for Mediator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Mediator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mediator")
            .field("cell", &self.cell)
            .field("sources", &self.source_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityState, Lifecycle};
    use crate::context::MainContext;
    use std::thread;

    fn recorder<T: Clone + Send + 'static>() -> (Listener<T>, Arc<Mutex<Vec<T>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener = Listener::new(move |value: &T| sink.lock().push(value.clone()));
        (listener, seen)
    }

    #[test]
    fn test_sources_plug_only_while_active() {
        let a = LiveCell::new();
        let mediator: Mediator<i32> = Mediator::new();
        mediator.add_forwarding_source(&a).unwrap();
        assert!(!a.has_listeners());

        let (listener, seen) = recorder();
        mediator.listen_forever(&listener).unwrap();
        assert!(a.has_active_listeners());

        a.write(1).unwrap();
        assert_eq!(*seen.lock(), vec![1]);

        mediator.unregister_listener(&listener).unwrap();
        assert!(!a.has_listeners());
    }

    #[test]
    fn test_two_sources_remove_and_deactivate() {
        let a = LiveCell::new();
        let b = LiveCell::new();
        let mediator: Mediator<i32> = Mediator::new();
        mediator.add_forwarding_source(&a).unwrap();
        mediator.add_forwarding_source(&b).unwrap();

        let (listener, seen) = recorder();
        mediator.listen_forever(&listener).unwrap();

        a.write(1).unwrap();
        b.write(2).unwrap();
        assert_eq!(*seen.lock(), vec![1, 2]);

        mediator.remove_source(&a).unwrap();
        a.write(3).unwrap();
        assert_eq!(*seen.lock(), vec![1, 2]);
        assert_eq!(mediator.source_count(), 1);

        mediator.unregister_listener(&listener).unwrap();
        b.write(4).unwrap();
        mediator.listen_forever(&listener).unwrap();
        assert_eq!(*seen.lock(), vec![1, 2]);
        assert_eq!(mediator.read(), Some(2));
    }

    #[test]
    fn test_sticky_source_replays_once_on_reactivation() {
        let b = LiveCell::new();
        let mediator: Mediator<i32> = Mediator::new();
        let target = mediator.downgrade();
        let relay = Listener::new(move |value: &i32| {
            if let Some(mediator) = target.upgrade() {
                mediator.write(*value).unwrap();
            }
        });
        mediator.add_source_sticky(&b, &relay).unwrap();

        let lifecycle = Arc::new(Lifecycle::new());
        let (listener, seen) = recorder();
        mediator.listen(lifecycle.clone(), &listener).unwrap();

        lifecycle.set_state(ActivityState::Started);
        b.write(1).unwrap();
        assert_eq!(*seen.lock(), vec![1]);

        // Already relayed version is not relayed again.
        lifecycle.set_state(ActivityState::Created);
        lifecycle.set_state(ActivityState::Started);
        assert_eq!(*seen.lock(), vec![1]);
        assert_eq!(mediator.version(), 0);

        lifecycle.set_state(ActivityState::Created);
        b.write(2).unwrap();
        assert_eq!(*seen.lock(), vec![1]);
        lifecycle.set_state(ActivityState::Started);
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn test_conflicting_source() {
        let a: LiveCell<i32> = LiveCell::new();
        let mediator: Mediator<i32> = Mediator::new();
        let (first, _) = recorder();
        let (second, _) = recorder();

        mediator.add_source(&a, &first).unwrap();
        mediator.add_source(&a, &first).unwrap();
        assert_eq!(
            mediator.add_source(&a, &second),
            Err(CellError::ConflictingSource { cell: a.id() })
        );
        assert_eq!(
            mediator.add_forwarding_source(&a),
            Err(CellError::ConflictingSource { cell: a.id() })
        );

        let b = LiveCell::new();
        mediator.add_forwarding_source(&b).unwrap();
        mediator.add_forwarding_source(&b).unwrap();
        assert_eq!(mediator.source_count(), 2);
    }

    #[test]
    fn test_sticky_and_plain_source_with_same_listener_conflict() {
        let a: LiveCell<i32> = LiveCell::new();
        let mediator: Mediator<i32> = Mediator::new();
        let (relay, _) = recorder();

        mediator.add_source(&a, &relay).unwrap();
        assert_eq!(
            mediator.add_source_sticky(&a, &relay),
            Err(CellError::ConflictingSource { cell: a.id() })
        );

        let b: LiveCell<i32> = LiveCell::new();
        mediator.add_source_sticky(&b, &relay).unwrap();
        mediator.add_source_sticky(&b, &relay).unwrap();
        assert_eq!(
            mediator.add_source(&b, &relay),
            Err(CellError::ConflictingSource { cell: b.id() })
        );
        assert_eq!(mediator.source_count(), 2);
    }

    #[test]
    fn test_source_on_other_context_is_rejected_without_recording() {
        let there = thread::spawn(MainContext::current).join().unwrap();
        let foreign: LiveCell<i32> = LiveCell::new_in(there);
        let mediator: Mediator<i32> = Mediator::new();

        assert_eq!(
            mediator.add_forwarding_source(&foreign),
            Err(CellError::OffContextMutation {
                operation: "add_source"
            })
        );
        assert_eq!(mediator.source_count(), 0);

        // Active mediators reject it too, and nothing is plugged later.
        let (listener, _) = recorder();
        mediator.listen_forever(&listener).unwrap();
        let (relay, _) = recorder();
        assert!(mediator.add_source(&foreign, &relay).is_err());
        assert!(!mediator.has_source(&foreign));
        assert!(!foreign.has_listeners());
    }

    #[test]
    fn test_source_added_while_active_plugs_immediately() {
        let mediator: Mediator<i32> = Mediator::new();
        let (listener, seen) = recorder();
        mediator.listen_forever(&listener).unwrap();

        let a = LiveCell::with_value(10);
        mediator.add_forwarding_source(&a).unwrap();
        assert!(a.has_active_listeners());
        assert!(seen.lock().is_empty());

        a.write(11).unwrap();
        assert_eq!(*seen.lock(), vec![11]);
    }

    #[test]
    fn test_source_listener_sees_upstream_values() {
        let a = LiveCell::new();
        let mediator: Mediator<String> = Mediator::new();
        let (relay, relayed) = recorder::<i32>();
        mediator.add_source(&a, &relay).unwrap();

        let (listener, _) = recorder();
        mediator.listen_forever(&listener).unwrap();
        a.write(5).unwrap();
        a.write(6).unwrap();

        assert_eq!(*relayed.lock(), vec![5, 6]);
        assert_eq!(mediator.version(), -1);
    }

    #[test]
    fn test_dropping_mediator_detaches_from_upstream() {
        let a = LiveCell::new();
        {
            let mediator: Mediator<i32> = Mediator::new();
            mediator.add_forwarding_source(&a).unwrap();
            let (listener, _) = recorder();
            mediator.listen_forever(&listener).unwrap();
            assert!(a.has_listeners());
        }
        assert!(!a.has_listeners());
        a.write(1).unwrap();
    }

    #[test]
    fn test_dropped_upstream_is_silent() {
        let mediator: Mediator<i32> = Mediator::new();
        {
            let a = LiveCell::new();
            mediator.add_forwarding_source(&a).unwrap();
        }
        assert_eq!(mediator.source_count(), 0);

        let (listener, seen) = recorder();
        mediator.listen_forever(&listener).unwrap();
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_dropped_upstream_is_pruned_on_activation() {
        let mediator: Mediator<i32> = Mediator::new();
        let kept = LiveCell::new();
        mediator.add_forwarding_source(&kept).unwrap();
        {
            let gone: LiveCell<i32> = LiveCell::new();
            mediator.add_forwarding_source(&gone).unwrap();
        }
        assert_eq!(mediator.sources.entries.lock().len(), 2);

        let (listener, seen) = recorder();
        mediator.listen_forever(&listener).unwrap();
        assert_eq!(mediator.sources.entries.lock().len(), 1);
        assert!(mediator.has_source(&kept));

        kept.write(7).unwrap();
        assert_eq!(*seen.lock(), vec![7]);
    }
}
