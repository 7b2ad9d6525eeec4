//! One-shot promise/future pair.
//!
//! The producer and consumer share reference-counted state with an atomic
//! `INIT -> WAITING -> FINISHED` progression. A consumer either blocks in
//! [`Future::get`] or installs a continuation with [`Future::on_ready`]; the
//! continuation then runs on whichever thread fulfills the promise. Dropping
//! an unfulfilled [`Promise`] resolves the future with
//! [`ErrorCode::BrokenPromise`].

use crate::functional::UniqueFunction;
use crate::status::{ErrorCode, Status, StatusWith};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

const INIT: u8 = 0;
const WAITING: u8 = 1;
const FINISHED: u8 = 2;

struct Shared<T> {
    state: AtomicU8,
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

struct Slot<T> {
    value: Option<StatusWith<T>>,
    continuation: Option<UniqueFunction<StatusWith<T>>>,
}

impl<T> Shared<T> {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(INIT),
            slot: Mutex::new(Slot {
                value: None,
                continuation: None,
            }),
            ready: Condvar::new(),
        }
    }

    fn finish(&self, value: StatusWith<T>) {
        let mut slot = self.slot.lock();
        let previous = self.state.swap(FINISHED, Ordering::AcqRel);
        if previous == WAITING {
            if let Some(continuation) = slot.continuation.take() {
                drop(slot);
                continuation.call(value);
                return;
            }
        }
        slot.value = Some(value);
        drop(slot);
        self.ready.notify_all();
    }
}

/// The producing half.
pub struct Promise<T> {
    shared: Option<Arc<Shared<T>>>,
}

/// The consuming half.
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

/// Creates a connected promise and future.
pub fn make_promise_future<T>() -> (Promise<T>, Future<T>) {
    let shared = Arc::new(Shared::new());
    (
        Promise {
            shared: Some(Arc::clone(&shared)),
        },
        Future { shared },
    )
}

impl<T> Promise<T> {
    /// Fulfills the future with a value.
    pub fn emplace_value(mut self, value: T) {
        if let Some(shared) = self.shared.take() {
            shared.finish(Ok(value));
        }
    }

    /// Fulfills the future with an error.
    pub fn set_error(mut self, status: Status) {
        debug_assert!(!status.is_ok());
        if let Some(shared) = self.shared.take() {
            shared.finish(Err(status));
        }
    }

    /// Fulfills the future with a value or error.
    pub fn set_from(mut self, result: StatusWith<T>) {
        if let Some(shared) = self.shared.take() {
            shared.finish(result);
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.finish(Err(Status::new(
                ErrorCode::BrokenPromise,
                "promise dropped without a value",
            )));
        }
    }
}

impl<T> Future<T> {
    /// A future that is already fulfilled.
    pub fn ready(value: StatusWith<T>) -> Self {
        let shared = Arc::new(Shared::new());
        shared.finish(value);
        Self { shared }
    }

    /// Returns true once the promise has been fulfilled.
    pub fn is_ready(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == FINISHED
    }

    /// Blocks until the promise is fulfilled.
    pub fn get(self) -> StatusWith<T> {
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(value) = slot.value.take() {
                return value;
            }
            self.shared.ready.wait(&mut slot);
        }
    }

    /// Blocks for at most `timeout`. Gives the future back on timeout.
    pub fn get_timeout(self, timeout: Duration) -> Result<StatusWith<T>, Self> {
        let mut slot = self.shared.slot.lock();
        if slot.value.is_none() {
            self.shared.ready.wait_for(&mut slot, timeout);
        }
        match slot.value.take() {
            Some(value) => Ok(value),
            None => {
                drop(slot);
                Err(self)
            }
        }
    }

    /// Runs `f` with the result, immediately if it is available, otherwise on
    /// the thread that fulfills the promise.
    pub fn on_ready(self, f: impl FnOnce(StatusWith<T>) + Send + 'static) {
        let mut slot = self.shared.slot.lock();
        if let Some(value) = slot.value.take() {
            drop(slot);
            f(value);
            return;
        }
        slot.continuation = Some(UniqueFunction::new(f));
        let _ = self.shared.state.compare_exchange(
            INIT,
            WAITING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("fulfilled", &self.shared.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn value_crosses_threads() {
        let (promise, future) = make_promise_future();
        let producer = thread::spawn(move || promise.emplace_value(42));
        assert_eq!(future.get().unwrap(), 42);
        producer.join().unwrap();
    }

    #[test]
    fn continuation_runs_on_fulfillment() {
        let (promise, future) = make_promise_future::<&str>();
        let (tx, rx) = mpsc::channel();
        future.on_ready(move |v| tx.send(v).unwrap());
        assert!(rx.try_recv().is_err());
        promise.emplace_value("done");
        assert_eq!(rx.recv().unwrap().unwrap(), "done");
    }

    #[test]
    fn continuation_on_ready_future_runs_inline() {
        let future = Future::ready(Ok(1));
        assert!(future.is_ready());
        let (tx, rx) = mpsc::channel();
        future.on_ready(move |v| tx.send(v).unwrap());
        assert_eq!(rx.try_recv().unwrap().unwrap(), 1);
    }

    #[test]
    fn dropped_promise_breaks() {
        let (promise, future) = make_promise_future::<()>();
        drop(promise);
        assert_eq!(future.get().unwrap_err().code(), ErrorCode::BrokenPromise);
    }

    #[test]
    fn timeout_returns_future() {
        let (promise, future) = make_promise_future::<u8>();
        let future = future.get_timeout(Duration::from_millis(10)).unwrap_err();
        promise.set_error(Status::new(ErrorCode::RuntimeError, "x"));
        assert_eq!(
            future.get().unwrap_err().code(),
            ErrorCode::RuntimeError
        );
    }
}
