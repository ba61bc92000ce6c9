//! Thread-safe multi-listener registry with ordered fan-out dispatch.
//!
//! Listeners are held as `Arc<T>` (usually `Arc<dyn SomeListener>`) in a
//! copy-on-write vector. Registration and removal rebuild the vector under a
//! mutex; dispatch loads an immutable snapshot and never takes the lock, so
//! concurrent (un)registration does not affect an in-flight dispatch.
//!
//! A listener halts the fan-out for the current call by returning
//! [`ListenerError::StopDispatch`]; that is not reported as a failure.

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::error::{Error, Result};

/// Outcome a listener returns to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerError {
    /// Stop dispatching this call to the remaining listeners.
    StopDispatch,
    /// The listener failed; the failure is logged and re-raised to the caller.
    Failed(String),
}

impl ListenerError {
    /// Convenience constructor for [`ListenerError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        ListenerError::Failed(message.into())
    }
}

impl From<Error> for ListenerError {
    fn from(err: Error) -> Self {
        ListenerError::Failed(err.to_string())
    }
}

/// Result type returned by listener callbacks.
pub type ListenerResult = std::result::Result<(), ListenerError>;

struct Inner<T: ?Sized> {
    name: &'static str,
    listeners: ArcSwap<Vec<Arc<T>>>,
    /// Serializes mutation; `true` once closed.
    closed: Mutex<bool>,
}

/// Ordered, duplicate-free registry of listeners.
pub struct ListenerRegistry<T: ?Sized> {
    inner: Arc<Inner<T>>,
}

impl<T: ?Sized> Clone for ListenerRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: ?Sized> std::fmt::Debug for ListenerRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("name", &self.inner.name)
            .field("listeners", &self.inner.listeners.load().len())
            .finish()
    }
}

impl<T: ?Sized> ListenerRegistry<T> {
    /// Create an empty registry. `name` identifies it in logs.
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                listeners: ArcSwap::from_pointee(Vec::new()),
                closed: Mutex::new(false),
            }),
        }
    }

    /// Register a listener.
    ///
    /// If the same listener (by identity) is already registered, nothing
    /// changes and the existing entry is returned.
    pub fn register(&self, listener: Arc<T>) -> Result<Arc<T>> {
        let closed = self.inner.closed.lock();
        if *closed {
            return Err(Error::Closed("listener registry"));
        }

        let current = self.inner.listeners.load_full();
        if let Some(existing) = current.iter().find(|l| same(l, &listener)) {
            return Ok(Arc::clone(existing));
        }

        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(Arc::clone(&listener));
        self.inner.listeners.store(Arc::new(next));
        trace!(registry = self.inner.name, count = current.len() + 1, "listener registered");

        Ok(listener)
    }

    /// Remove a listener, returning it if it was registered.
    pub fn unregister(&self, listener: &Arc<T>) -> Option<Arc<T>> {
        let _guard = self.inner.closed.lock();

        let current = self.inner.listeners.load_full();
        let index = current.iter().position(|l| same(l, listener))?;

        let mut next: Vec<Arc<T>> = current.iter().cloned().collect();
        let removed = next.remove(index);
        self.inner.listeners.store(Arc::new(next));
        trace!(registry = self.inner.name, "listener unregistered");

        Some(removed)
    }

    /// Immutable snapshot of the listeners, in registration order.
    pub fn snapshot(&self) -> Arc<Vec<Arc<T>>> {
        self.inner.listeners.load_full()
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.inner.listeners.load().len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.lock()
    }

    /// Handle that fans every call out to the currently registered listeners.
    pub fn dispatcher(&self) -> Dispatcher<T> {
        Dispatcher {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Dispatch one call to every listener. See [`Dispatcher::dispatch`].
    pub fn dispatch<F>(&self, f: F) -> Result<()>
    where
        F: FnMut(&T) -> ListenerResult,
    {
        self.dispatcher().dispatch(f)
    }

    /// Remove every listener. The registry rejects registration afterwards.
    pub fn close(&self) {
        let mut closed = self.inner.closed.lock();
        *closed = true;
        self.inner.listeners.store(Arc::new(Vec::new()));
    }
}

/// Fan-out handle returned by [`ListenerRegistry::dispatcher`].
///
/// Capability traits implement themselves for `Dispatcher<dyn Trait>` so that
/// a dispatcher can be passed anywhere a single listener is expected.
pub struct Dispatcher<T: ?Sized> {
    inner: Arc<Inner<T>>,
}

impl<T: ?Sized> Clone for Dispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: ?Sized> Dispatcher<T> {
    /// Invoke `f` on each listener in order on the calling thread.
    ///
    /// Stops early without error on [`ListenerError::StopDispatch`]. Any other
    /// failure is logged and returned, and the remaining listeners are skipped.
    pub fn dispatch<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&T) -> ListenerResult,
    {
        let snapshot = self.inner.listeners.load_full();
        for (index, listener) in snapshot.iter().enumerate() {
            match f(&**listener) {
                Ok(()) => {}
                Err(ListenerError::StopDispatch) => {
                    trace!(registry = self.inner.name, index, "dispatch stopped by listener");
                    return Ok(());
                }
                Err(ListenerError::Failed(message)) => {
                    warn!(registry = self.inner.name, index, error = %message, "listener failed");
                    return Err(Error::Listener(message));
                }
            }
        }
        Ok(())
    }

    /// Number of listeners a dispatch would reach right now.
    pub fn len(&self) -> usize {
        self.inner.listeners.load().len()
    }

    /// Whether a dispatch would reach no listener.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn same<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Probe: Send + Sync {
        fn hit(&self, log: &Mutex<Vec<&'static str>>) -> ListenerResult;
    }

    struct Named(&'static str, Option<ListenerError>);

    impl Probe for Named {
        fn hit(&self, log: &Mutex<Vec<&'static str>>) -> ListenerResult {
            log.lock().push(self.0);
            match &self.1 {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        }
    }

    fn probe(name: &'static str, outcome: Option<ListenerError>) -> Arc<dyn Probe> {
        Arc::new(Named(name, outcome))
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let registry: ListenerRegistry<dyn Probe> = ListenerRegistry::new("test");
        for name in ["l1", "l2", "l3"] {
            registry.register(probe(name, None)).unwrap();
        }

        let log = Mutex::new(Vec::new());
        registry.dispatch(|l| l.hit(&log)).unwrap();
        assert_eq!(*log.lock(), vec!["l1", "l2", "l3"]);
    }

    #[test]
    fn test_stop_dispatch_is_not_an_error() {
        let registry: ListenerRegistry<dyn Probe> = ListenerRegistry::new("test");
        registry.register(probe("l1", None)).unwrap();
        registry
            .register(probe("l2", Some(ListenerError::StopDispatch)))
            .unwrap();
        registry.register(probe("l3", None)).unwrap();

        let log = Mutex::new(Vec::new());
        assert!(registry.dispatch(|l| l.hit(&log)).is_ok());
        assert_eq!(*log.lock(), vec!["l1", "l2"]);
    }

    #[test]
    fn test_failure_propagates_and_halts() {
        let registry: ListenerRegistry<dyn Probe> = ListenerRegistry::new("test");
        registry
            .register(probe("l1", Some(ListenerError::failed("boom"))))
            .unwrap();
        registry.register(probe("l2", None)).unwrap();

        let log = Mutex::new(Vec::new());
        let err = registry.dispatch(|l| l.hit(&log)).unwrap_err();
        assert!(matches!(err, Error::Listener(ref m) if m == "boom"));
        assert_eq!(*log.lock(), vec!["l1"]);
    }

    #[test]
    fn test_register_same_listener_twice() {
        let registry: ListenerRegistry<dyn Probe> = ListenerRegistry::new("test");
        let l1 = probe("l1", None);
        let first = registry.register(Arc::clone(&l1)).unwrap();
        let second = registry.register(Arc::clone(&l1)).unwrap();
        assert!(same(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister() {
        let registry: ListenerRegistry<dyn Probe> = ListenerRegistry::new("test");
        let l1 = probe("l1", None);
        let l2 = probe("l2", None);
        registry.register(Arc::clone(&l1)).unwrap();
        registry.register(Arc::clone(&l2)).unwrap();

        assert!(registry.unregister(&l1).is_some());
        assert!(registry.unregister(&l1).is_none());

        let log = Mutex::new(Vec::new());
        registry.dispatch(|l| l.hit(&log)).unwrap();
        assert_eq!(*log.lock(), vec!["l2"]);
    }

    #[test]
    fn test_snapshot_unaffected_by_later_registration() {
        let registry: ListenerRegistry<dyn Probe> = ListenerRegistry::new("test");
        registry.register(probe("l1", None)).unwrap();
        let snapshot = registry.snapshot();
        registry.register(probe("l2", None)).unwrap();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_close_clears_and_rejects() {
        let registry: ListenerRegistry<dyn Probe> = ListenerRegistry::new("test");
        let dispatcher = registry.dispatcher();
        registry.register(probe("l1", None)).unwrap();
        assert_eq!(dispatcher.len(), 1);

        registry.close();
        assert!(registry.is_empty());
        assert!(dispatcher.is_empty());
        assert!(registry.register(probe("l2", None)).is_err());
    }
}
