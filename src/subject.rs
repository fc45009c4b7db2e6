use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;

/// Error raised by subject operations after disposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubjectError {
    /// The subject was used after `dispose`.
    #[error("subject has been disposed")]
    Disposed,
}

/// A sink for values fanned out by a [`BroadcastSubject`].
pub trait Observer<T, E>: Send + Sync {
    /// A value was produced.
    fn on_next(&self, value: &T);
    /// The stream failed; no further values follow.
    fn on_error(&self, error: &E);
    /// The stream finished; no further values follow.
    fn on_completed(&self);
}

impl<T, E, O: Observer<T, E> + ?Sized> Observer<T, E> for Arc<O> {
    fn on_next(&self, value: &T) {
        (**self).on_next(value);
    }

    fn on_error(&self, error: &E) {
        (**self).on_error(error);
    }

    fn on_completed(&self) {
        (**self).on_completed();
    }
}

/// Registered sinks, in subscription order.
struct Sinks<T, E> {
    entries: Vec<(u64, Arc<dyn Observer<T, E>>)>,
    next_id: u64,
    disposed: bool,
}

struct State<T, E> {
    sinks: Mutex<Sinks<T, E>>,
}

/// A single producer endpoint fanning values out to an evolving set of
/// observers.
///
/// Dispatch is snapshot-based: each produced value is delivered to a
/// point-in-time copy of the sink list, walked in registration order
/// outside the lock. Observers registered or disposed while a dispatch is
/// in flight see only whole calls; an observer present for the full
/// duration of a dispatch is delivered to exactly once.
///
/// ```
/// use rememo::{BroadcastSubject, Observer};
///
/// struct Print;
///
/// impl Observer<i32, String> for Print {
///     fn on_next(&self, value: &i32) {
///         println!("got {value}");
///     }
///     fn on_error(&self, error: &String) {
///         println!("failed: {error}");
///     }
///     fn on_completed(&self) {
///         println!("done");
///     }
/// }
///
/// let subject = BroadcastSubject::<i32, String>::new();
/// let subscription = subject.subscribe(Print).unwrap();
/// subject.producer().on_next(&42).unwrap();
/// subscription.dispose();
/// ```
pub struct BroadcastSubject<T, E> {
    state: Arc<State<T, E>>,
    producer: Producer<T, E>,
}

impl<T, E> BroadcastSubject<T, E> {
    /// Create a subject with no observers.
    pub fn new() -> Self {
        let state = Arc::new(State {
            sinks: Mutex::new(Sinks { entries: Vec::new(), next_id: 0, disposed: false }),
        });
        Self { producer: Producer { state: state.clone() }, state }
    }

    /// The producing endpoint. Every call returns the same handle.
    pub fn producer(&self) -> &Producer<T, E> {
        &self.producer
    }

    /// Register `observer` for every value produced after this call
    /// returns, until the subscription is disposed or a terminal event is
    /// observed.
    pub fn subscribe(
        &self,
        observer: impl Observer<T, E> + 'static,
    ) -> Result<Subscription<T, E>, SubjectError> {
        let mut sinks = self.state.sinks.lock();
        if sinks.disposed {
            return Err(SubjectError::Disposed);
        }
        let id = sinks.next_id;
        sinks.next_id += 1;
        let sink: Arc<dyn Observer<T, E>> = Arc::new(observer);
        sinks.entries.push((id, sink));
        Ok(Subscription { state: Arc::downgrade(&self.state), id })
    }

    /// Shut the subject down, dropping all observers. Idempotent. Further
    /// produce and subscribe calls fail with [`SubjectError::Disposed`].
    pub fn dispose(&self) {
        let mut sinks = self.state.sinks.lock();
        sinks.disposed = true;
        sinks.entries.clear();
    }
}

impl<T, E> Default for BroadcastSubject<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

/// The producing endpoint of a [`BroadcastSubject`].
pub struct Producer<T, E> {
    state: Arc<State<T, E>>,
}

impl<T, E> Clone for Producer<T, E> {
    fn clone(&self) -> Self {
        Self { state: self.state.clone() }
    }
}

impl<T, E> Producer<T, E> {
    /// Deliver `value` to every currently registered observer.
    pub fn on_next(&self, value: &T) -> Result<(), SubjectError> {
        let snapshot: Vec<_> = {
            let sinks = self.state.sinks.lock();
            if sinks.disposed {
                return Err(SubjectError::Disposed);
            }
            sinks.entries.iter().map(|(_, sink)| sink.clone()).collect()
        };
        for sink in &snapshot {
            sink.on_next(value);
        }
        Ok(())
    }

    /// Fail the stream. Every registered observer sees the error once and
    /// is then dropped.
    pub fn on_error(&self, error: &E) -> Result<(), SubjectError> {
        for sink in self.take_all()? {
            sink.on_error(error);
        }
        Ok(())
    }

    /// Finish the stream. Every registered observer sees the completion
    /// once and is then dropped.
    pub fn on_completed(&self) -> Result<(), SubjectError> {
        for sink in self.take_all()? {
            sink.on_completed();
        }
        Ok(())
    }

    fn take_all(&self) -> Result<Vec<Arc<dyn Observer<T, E>>>, SubjectError> {
        let mut sinks = self.state.sinks.lock();
        if sinks.disposed {
            return Err(SubjectError::Disposed);
        }
        Ok(std::mem::take(&mut sinks.entries).into_iter().map(|(_, sink)| sink).collect())
    }
}

/// Handle to one registration on a [`BroadcastSubject`].
pub struct Subscription<T, E> {
    state: Weak<State<T, E>>,
    id: u64,
}

impl<T, E> Subscription<T, E> {
    /// Stop deliveries to the registered observer.
    ///
    /// Idempotent: disposing twice is a no-op. Values produced after this
    /// returns are no longer delivered. Dropping the handle without calling
    /// this keeps the registration alive.
    pub fn dispose(&self) {
        if let Some(state) = self.state.upgrade() {
            let mut sinks = state.sinks.lock();
            if let Some(i) = sinks.entries.iter().position(|(id, _)| *id == self.id) {
                sinks.entries.remove(i);
            }
        }
    }
}
