//! Listener handles.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Identity of a [`Listener`], stable across clones of the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(usize);

/// A callback receiving values from a cell.
///
/// Identity is the allocation, not the closure: two `Listener::new` calls
/// with the same closure body are two listeners, while clones of one handle
/// are the same listener. Keep a clone around to unregister later.
pub struct Listener<T: ?Sized> {
    callback: Arc<dyn Fn(&T) + Send + Sync>,
}

impl<T: ?Sized> Listener<T> {
    pub fn new(callback: impl Fn(&T) + Send + Sync + 'static) -> Self {
        Self {
            callback: Arc::new(callback),
        }
    }

    pub fn id(&self) -> ListenerId {
        ListenerId(Arc::as_ptr(&self.callback) as *const () as usize)
    }

    pub(crate) fn notify(&self, value: &T) {
        (self.callback)(value)
    }
}

impl<T: ?Sized> Clone for Listener<T> {
    fn clone(&self) -> Self {
        Self {
            callback: self.callback.clone(),
        }
    }
}

impl<T: ?Sized> PartialEq for Listener<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl<T: ?Sized> Eq for Listener<T> {}

impl<T: ?Sized> Hash for Listener<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl<T: ?Sized> fmt::Debug for Listener<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Listener").field(&self.id()).finish()
    }
}
