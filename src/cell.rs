//! Core cell type and its dispatch loop.

use crate::activity::{ActivitySource, ActivityState, StateObserver};
use crate::binding::{Binding, ListenScope, START_VERSION};
use crate::context::MainContext;
use crate::error::CellError;
use crate::listener::{Listener, ListenerId};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

/// Identity of a [`LiveCell`], shared by all of its handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellId(usize);

/// Callbacks fired when a cell gains its first active listener or loses its
/// last one.
///
/// Used to engage upstream work lazily; [`crate::Mediator`] plugs and unplugs
/// its sources through these.
pub trait ActivityHooks: Send + Sync {
    /// Active listener count went from 0 to 1.
    fn on_active(&self) {}

    /// Active listener count went from 1 to 0.
    fn on_inactive(&self) {}
}

struct Slot<T> {
    value: Option<Arc<T>>,
    version: i64,
}

struct DispatchState<T> {
    bindings: IndexMap<ListenerId, Arc<Binding<T>>>,
    active_count: usize,
    dispatching: bool,
    invalidated: bool,
}

struct CellInner<T> {
    context: MainContext,
    slot: RwLock<Slot<T>>,
    // Only locked on the coordinating context, and never across a callback.
    state: Mutex<DispatchState<T>>,
    pending: Mutex<Option<T>>,
    hooks: Option<Arc<dyn ActivityHooks>>,
}

impl<T> Drop for CellInner<T> {
    fn drop(&mut self) {
        for binding in self.state.get_mut().bindings.values() {
            binding.detach();
        }
    }
}

/// A single-slot observable value.
///
/// Every write bumps the cell's version and synchronously delivers the value
/// to each active listener that has not seen that version yet. Handles are
/// cheap to clone and all clones share the same cell.
///
/// Mutation is confined to the cell's [`MainContext`]; calling a mutating
/// method from another thread fails with [`CellError::OffContextMutation`].
/// [`LiveCell::post_write`] and [`LiveCell::read`] work from any thread.
pub struct LiveCell<T> {
    inner: Arc<CellInner<T>>,
}

/// Non-owning handle to a [`LiveCell`].
pub struct WeakCell<T> {
    inner: Weak<CellInner<T>>,
}

impl<T> Clone for LiveCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Clone for WeakCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> PartialEq for LiveCell<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> Eq for LiveCell<T> {}

impl<T> Hash for LiveCell<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl<T> LiveCell<T> {
    pub fn id(&self) -> CellId {
        CellId(Arc::as_ptr(&self.inner) as *const () as usize)
    }

    pub fn downgrade(&self) -> WeakCell<T> {
        WeakCell {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn context(&self) -> &MainContext {
        &self.inner.context
    }

    /// Number of writes so far, minus one if the cell started empty.
    pub fn version(&self) -> i64 {
        self.inner.slot.read().version
    }

    pub fn has_listeners(&self) -> bool {
        !self.inner.state.lock().bindings.is_empty()
    }

    pub fn has_active_listeners(&self) -> bool {
        self.inner.state.lock().active_count > 0
    }

    pub fn listener_count(&self) -> usize {
        self.inner.state.lock().bindings.len()
    }

    /// Shared handle to the current value, `None` if never written.
    pub fn read_shared(&self) -> Option<Arc<T>> {
        self.inner.slot.read().value.clone()
    }

    /// Read the current value with a closure.
    ///
    /// No lock is held while `f` runs, so it may write back into the cell.
    pub fn with<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        let value = self.read_shared();
        f(value.as_deref())
    }

    /// Clone of the current value, `None` if never written.
    ///
    /// Off the coordinating context this may lag behind a concurrent write.
    pub fn read(&self) -> Option<T>
    where
        T: Clone,
    {
        self.with(|value| value.cloned())
    }
}

impl<T: Send + Sync + 'static> LiveCell<T> {
    /// Create an empty cell on the calling thread's context.
    pub fn new() -> Self {
        Self::new_in(MainContext::current())
    }

    /// Create a cell holding `value` on the calling thread's context.
    pub fn with_value(value: T) -> Self {
        Self::with_value_in(value, MainContext::current())
    }

    pub fn new_in(context: MainContext) -> Self {
        Self::from_parts(None, context, None)
    }

    pub fn with_value_in(value: T, context: MainContext) -> Self {
        Self::from_parts(Some(value), context, None)
    }

    /// Create an empty cell whose activity transitions are reported to `hooks`.
    pub fn with_hooks(hooks: Arc<dyn ActivityHooks>) -> Self {
        Self::from_parts(None, MainContext::current(), Some(hooks))
    }

    fn from_parts(
        value: Option<T>,
        context: MainContext,
        hooks: Option<Arc<dyn ActivityHooks>>,
    ) -> Self {
        let version = if value.is_some() {
            START_VERSION + 1
        } else {
            START_VERSION
        };
        Self {
            inner: Arc::new(CellInner {
                context,
                slot: RwLock::new(Slot {
                    value: value.map(Arc::new),
                    version,
                }),
                state: Mutex::new(DispatchState {
                    bindings: IndexMap::new(),
                    active_count: 0,
                    dispatching: false,
                    invalidated: false,
                }),
                pending: Mutex::new(None),
                hooks,
            }),
        }
    }

    /// Store `value` and deliver it to every eligible listener before returning.
    pub fn write(&self, value: T) -> Result<(), CellError> {
        self.inner.context.ensure_current("write")?;
        let version = {
            let mut slot = self.inner.slot.write();
            slot.version += 1;
            slot.value = Some(Arc::new(value));
            slot.version
        };
        tracing::trace!(cell = ?self.id(), version, "write");
        self.dispatch(None);
        Ok(())
    }

    /// Hand `value` to the coordinating context from any thread.
    ///
    /// Only the latest value posted before the context drains is written;
    /// earlier ones are overwritten, and a single drain task is queued for
    /// the whole burst.
    pub fn post_write(&self, value: T) {
        let schedule = self.inner.pending.lock().replace(value).is_none();
        if !schedule {
            return;
        }
        let cell = self.downgrade();
        self.inner.context.post(move || {
            if let Some(cell) = cell.upgrade() {
                cell.drain_pending();
            }
        });
    }

    fn drain_pending(&self) {
        let value = self.inner.pending.lock().take();
        if let Some(value) = value {
            if let Err(err) = self.write(value) {
                tracing::warn!(%err, "Failed to apply posted value");
            }
        }
    }

    /// Register `listener` with the given scope.
    ///
    /// A sticky registration delivers the current value, if any, as soon as
    /// the listener becomes active; otherwise only later writes are delivered.
    /// Registering the same listener again with the same scope is a no-op,
    /// and registering against an already destroyed source is ignored.
    pub fn register_listener(
        &self,
        listener: &Listener<T>,
        scope: ListenScope,
        sticky: bool,
    ) -> Result<(), CellError> {
        self.inner.context.ensure_current("register_listener")?;

        if let ListenScope::Bound(source) = &scope {
            if source.current_state() == ActivityState::Destroyed {
                tracing::debug!(listener = ?listener.id(), "Activity source already destroyed, ignoring listener");
                return Ok(());
            }
        }

        let last_version = if sticky { START_VERSION } else { self.version() };
        let binding = {
            let mut state = self.inner.state.lock();
            if let Some(existing) = state.bindings.get(&listener.id()) {
                return if existing.matches(&scope) {
                    Ok(())
                } else {
                    Err(CellError::ConflictingRegistration {
                        listener: listener.id(),
                    })
                };
            }
            let binding = Arc::new(Binding::new(listener.clone(), scope, last_version));
            state.bindings.insert(listener.id(), binding.clone());
            binding
        };
        tracing::debug!(cell = ?self.id(), listener = ?listener.id(), sticky, "registered listener");

        match binding.source() {
            Some(source) => {
                let key = source.observe(self.activity_observer(&binding));
                binding.set_observation(key);
                self.set_active(&binding, binding.should_be_active());
            }
            None => self.set_active(&binding, true),
        }
        Ok(())
    }

    /// Listen while `source` is active, starting from the next write.
    pub fn listen(
        &self,
        source: Arc<dyn ActivitySource>,
        listener: &Listener<T>,
    ) -> Result<(), CellError> {
        self.register_listener(listener, ListenScope::Bound(source), false)
    }

    /// Listen while `source` is active, replaying the current value on activation.
    pub fn listen_sticky(
        &self,
        source: Arc<dyn ActivitySource>,
        listener: &Listener<T>,
    ) -> Result<(), CellError> {
        self.register_listener(listener, ListenScope::Bound(source), true)
    }

    /// Listen until explicitly removed, starting from the next write.
    pub fn listen_forever(&self, listener: &Listener<T>) -> Result<(), CellError> {
        self.register_listener(listener, ListenScope::Always, false)
    }

    /// Listen until explicitly removed, receiving the current value immediately.
    pub fn listen_forever_sticky(&self, listener: &Listener<T>) -> Result<(), CellError> {
        self.register_listener(listener, ListenScope::Always, true)
    }

    /// Remove `listener`. No-op if it is not registered.
    pub fn unregister_listener(&self, listener: &Listener<T>) -> Result<(), CellError> {
        self.inner.context.ensure_current("unregister_listener")?;
        let removed = self.inner.state.lock().bindings.shift_remove(&listener.id());
        let Some(binding) = removed else {
            return Ok(());
        };
        binding.detach();
        self.set_active(&binding, false);
        tracing::debug!(cell = ?self.id(), listener = ?listener.id(), "unregistered listener");
        Ok(())
    }

    /// Remove every listener bound to `source`.
    pub fn unregister_all(&self, source: &dyn ActivitySource) -> Result<(), CellError> {
        self.inner.context.ensure_current("unregister_all")?;
        let listeners: Vec<Listener<T>> = self
            .inner
            .state
            .lock()
            .bindings
            .values()
            .filter(|binding| binding.is_attached_to(source))
            .map(|binding| binding.listener().clone())
            .collect();
        for listener in &listeners {
            self.unregister_listener(listener)?;
        }
        Ok(())
    }

    fn activity_observer(&self, binding: &Arc<Binding<T>>) -> StateObserver {
        let cell = self.downgrade();
        let binding = Arc::downgrade(binding);
        Arc::new(move |state: ActivityState| {
            let (Some(cell), Some(binding)) = (cell.upgrade(), binding.upgrade()) else {
                return;
            };
            if binding.is_detached() {
                return;
            }
            if !cell.context().is_current() {
                tracing::error!(cell = ?cell.id(), ?state, "Activity transition delivered off the coordinating context");
                return;
            }
            if state == ActivityState::Destroyed {
                tracing::debug!(cell = ?cell.id(), listener = ?binding.listener().id(), "Activity source destroyed, detaching listener");
                if let Err(err) = cell.unregister_listener(binding.listener()) {
                    tracing::warn!(%err, "Failed to detach listener");
                }
                return;
            }
            cell.set_active(&binding, binding.should_be_active());
        })
    }

    fn set_active(&self, binding: &Arc<Binding<T>>, active: bool) {
        // The flag flips before any callback so nested calls see the new state.
        if !binding.swap_active(active) {
            return;
        }
        let (became_active, became_inactive) = {
            let mut state = self.inner.state.lock();
            let was_inactive = state.active_count == 0;
            if active {
                state.active_count += 1;
            } else {
                state.active_count -= 1;
            }
            (
                was_inactive && active,
                state.active_count == 0 && !active,
            )
        };

        if let Some(hooks) = &self.inner.hooks {
            if became_active {
                hooks.on_active();
            }
            if became_inactive {
                hooks.on_inactive();
            }
        }

        if active {
            self.dispatch(Some(binding.clone()));
        }
    }

    fn dispatch(&self, mut initiator: Option<Arc<Binding<T>>>) {
        {
            let mut state = self.inner.state.lock();
            if state.dispatching {
                state.invalidated = true;
                return;
            }
            state.dispatching = true;
        }
        let _dispatching = DispatchingGuard {
            state: &self.inner.state,
        };

        loop {
            self.inner.state.lock().invalidated = false;
            match initiator.take() {
                Some(binding) => self.consider_notify(&binding),
                None => {
                    // Bindings added during the pass are not in the snapshot;
                    // their own activation restarts the pass.
                    let snapshot: Vec<Arc<Binding<T>>> =
                        self.inner.state.lock().bindings.values().cloned().collect();
                    for binding in &snapshot {
                        self.consider_notify(binding);
                        if self.inner.state.lock().invalidated {
                            break;
                        }
                    }
                }
            }
            if !self.inner.state.lock().invalidated {
                break;
            }
            tracing::trace!(cell = ?self.id(), "dispatch invalidated, restarting pass");
        }
    }

    fn consider_notify(&self, binding: &Arc<Binding<T>>) {
        if !binding.is_active() {
            return;
        }
        // The source may have changed state without the transition reaching
        // us yet; the flag stays the only gate for delivery.
        if !binding.should_be_active() {
            self.set_active(binding, false);
            return;
        }
        let (version, value) = {
            let slot = self.inner.slot.read();
            (slot.version, slot.value.clone())
        };
        if !binding.claim(version) {
            return;
        }
        if let Some(value) = value {
            tracing::trace!(cell = ?self.id(), listener = ?binding.listener().id(), version, "deliver");
            binding.listener().notify(&value);
        }
    }
}

struct DispatchingGuard<'a, T> {
    state: &'a Mutex<DispatchState<T>>,
}

impl<T> Drop for DispatchingGuard<'_, T> {
    fn drop(&mut self) {
        self.state.lock().dispatching = false;
    }
}

impl<T> WeakCell<T> {
    pub fn upgrade(&self) -> Option<LiveCell<T>> {
        self.inner.upgrade().map(|inner| LiveCell { inner })
    }

    /// Whether the cell still has a strong handle somewhere.
    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl<T: Send + Sync + 'static> Default for LiveCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for LiveCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.inner.slot.read();
        f.debug_struct("LiveCell")
            .field("id", &self.id())
            .field("version", &slot.version)
            .field("value", &slot.value)
            .finish()
    }
}

impl<T> fmt::Debug for WeakCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakCell")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}
