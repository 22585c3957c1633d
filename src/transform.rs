//! Derived cells built from a [`Mediator`].
//!
//! Both helpers are lazy: the mapping function only runs while the returned
//! mediator has active listeners, and only for writes made while it does.

use crate::cell::LiveCell;
use crate::error::CellError;
use crate::listener::Listener;
use crate::mediator::Mediator;
use parking_lot::Mutex;

/// A mediator holding `f` applied to every value written to `source`.
pub fn map<X, Y>(
    source: &LiveCell<X>,
    f: impl Fn(&X) -> Y + Send + Sync + 'static,
) -> Result<Mediator<Y>, CellError>
where
    X: Send + Sync + 'static,
    Y: Send + Sync + 'static,
{
    let result = Mediator::new();
    let target = result.downgrade();
    let relay = Listener::new(move |value: &X| {
        if let Some(result) = target.upgrade() {
            if let Err(err) = result.write(f(value)) {
                tracing::warn!(%err, "Failed to write mapped value");
            }
        }
    });
    result.add_source(source, &relay)?;
    Ok(result)
}

/// A mediator that follows whichever cell `f` picked for the latest value of
/// `source`.
///
/// When `f` picks a different cell, the previous one stops feeding the result.
/// Picking the current cell again changes nothing, and `None` leaves the
/// result without a backing cell. A newly picked cell feeds the result from
/// its next write on.
pub fn switch_map<X, Y>(
    source: &LiveCell<X>,
    f: impl Fn(&X) -> Option<LiveCell<Y>> + Send + Sync + 'static,
) -> Result<Mediator<Y>, CellError>
where
    X: Send + Sync + 'static,
    Y: Clone + Send + Sync + 'static,
{
    let result = Mediator::new();
    let target = result.downgrade();
    let backing: Mutex<Option<LiveCell<Y>>> = Mutex::new(None);
    let relay = Listener::new(move |value: &X| {
        let Some(result) = target.upgrade() else {
            return;
        };
        let next = f(value);
        let previous = {
            let mut backing = backing.lock();
            if *backing == next {
                return;
            }
            std::mem::replace(&mut *backing, next.clone())
        };
        if let Some(previous) = previous {
            if let Err(err) = result.remove_source(&previous) {
                tracing::warn!(%err, "Failed to detach previous backing cell");
            }
        }
        if let Some(next) = next {
            if let Err(err) = result.add_forwarding_source(&next) {
                tracing::warn!(%err, "Failed to attach backing cell");
            }
        }
    });
    result.add_source(source, &relay)?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recorder<T: Clone + Send + 'static>() -> (Listener<T>, Arc<Mutex<Vec<T>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener = Listener::new(move |value: &T| sink.lock().push(value.clone()));
        (listener, seen)
    }

    #[test]
    fn test_map_applies_function() {
        let source = LiveCell::new();
        let lengths = map(&source, |s: &String| s.len()).unwrap();
        let (listener, seen) = recorder();
        lengths.listen_forever(&listener).unwrap();

        source.write("abc".to_string()).unwrap();
        source.write("hello".to_string()).unwrap();
        assert_eq!(*seen.lock(), vec![3, 5]);
    }

    #[test]
    fn test_map_is_lazy() {
        let source = LiveCell::new();
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let doubled = map(&source, move |v: &i32| {
            *counter.lock() += 1;
            v * 2
        })
        .unwrap();

        source.write(1).unwrap();
        assert_eq!(*calls.lock(), 0);
        assert_eq!(doubled.read(), None);

        let (listener, seen) = recorder();
        doubled.listen_forever(&listener).unwrap();
        source.write(2).unwrap();
        assert_eq!(*calls.lock(), 1);
        assert_eq!(*seen.lock(), vec![4]);
    }

    #[test]
    fn test_switch_map_follows_latest_backing_cell() {
        let left = LiveCell::new();
        let right = LiveCell::new();
        let selector = LiveCell::new();

        let cells = (left.clone(), right.clone());
        let switched = switch_map(&selector, move |pick_left: &bool| {
            Some(if *pick_left {
                cells.0.clone()
            } else {
                cells.1.clone()
            })
        })
        .unwrap();
        let (listener, seen) = recorder();
        switched.listen_forever(&listener).unwrap();

        selector.write(true).unwrap();
        left.write("l1").unwrap();
        right.write("r1").unwrap();
        assert_eq!(*seen.lock(), vec!["l1"]);

        selector.write(false).unwrap();
        left.write("l2").unwrap();
        right.write("r2").unwrap();
        assert_eq!(*seen.lock(), vec!["l1", "r2"]);
        assert!(!left.has_listeners());
        assert_eq!(switched.source_count(), 2);

        // Re-picking the current cell keeps the wiring as is.
        selector.write(false).unwrap();
        right.write("r3").unwrap();
        assert_eq!(*seen.lock(), vec!["l1", "r2", "r3"]);
    }

    #[test]
    fn test_switch_map_none_detaches() {
        let backing = LiveCell::new();
        let selector = LiveCell::new();
        let cell = backing.clone();
        let switched = switch_map(&selector, move |on: &bool| on.then(|| cell.clone())).unwrap();
        let (listener, seen) = recorder();
        switched.listen_forever(&listener).unwrap();

        selector.write(true).unwrap();
        backing.write(1).unwrap();
        selector.write(false).unwrap();
        backing.write(2).unwrap();

        assert_eq!(*seen.lock(), vec![1]);
        assert_eq!(switched.source_count(), 1);
    }
}
