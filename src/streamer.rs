//! Bounded-concurrency streaming of key/value writes into an external store.
//!
//! [`AsyncStreamer`] keeps at most `window` writes in flight. Submitting more
//! blocks the caller until a completion frees a slot, so a load generator can
//! push millions of entries without buffering them all in memory.
//!
//! The first failure observed (either an async completion error or a synchronous
//! rejection by the sink) is latched. From then on every `push_entry` returns it
//! at once, and `await_completion` returns it after the in-flight writes drain.
//!
//! ```no_run
//! use stampede::streamer::{AsyncStreamer, AsyncSink, Completion, SinkError};
//!
//! struct Store;
//!
//! impl AsyncSink<u64, String> for Store {
//!     fn put_async(&self, _key: u64, _value: String, done: Completion) -> Result<(), SinkError> {
//!         done(Ok(()));
//!         Ok(())
//!     }
//! }
//!
//! let streamer = AsyncStreamer::new(Store, 100);
//! for key in 0..10_000 {
//!     streamer.push_entry(key, format!("value-{}", key))?;
//! }
//! streamer.await_completion()?;
//! # Ok::<(), stampede::error::HarnessError>(())
//! ```

use crate::error::{HarnessError, Result};
use std::marker::PhantomData;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Default number of writes allowed in flight.
pub const DEFAULT_CONCURRENCY_WINDOW: usize = 1000;

/// Error reported by a sink, either synchronously or on completion.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct SinkError(pub String);

impl SinkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Completion callback handed to the sink with every write.
pub type Completion = Box<dyn FnOnce(std::result::Result<(), SinkError>) + Send + 'static>;

/// An asynchronous key/value store.
pub trait AsyncSink<K, V>: Send + Sync {
    /// Start writing `value` under `key`.
    ///
    /// On `Ok`, `on_complete` must be invoked exactly once, from any thread,
    /// possibly before this method returns. On `Err` the write was never
    /// started and `on_complete` must not be invoked.
    fn put_async(&self, key: K, value: V, on_complete: Completion)
    -> std::result::Result<(), SinkError>;
}

impl<K, V, S: AsyncSink<K, V> + ?Sized> AsyncSink<K, V> for Arc<S> {
    fn put_async(
        &self,
        key: K,
        value: V,
        on_complete: Completion,
    ) -> std::result::Result<(), SinkError> {
        (**self).put_async(key, value, on_complete)
    }
}

/// Common interface of the streamer flavours.
pub trait Streamer<K, V>: Send + Sync {
    fn push_entry(&self, key: K, value: V) -> Result<()>;
    fn await_completion(&self) -> Result<()>;
}

/// How [`streamer_for`] should drive the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Pipelined writes, at most `window` in flight.
    Async { window: usize },
    /// One write at a time, each awaited before `push_entry` returns.
    Sync,
}

impl Default for StreamMode {
    fn default() -> Self {
        Self::Async {
            window: DEFAULT_CONCURRENCY_WINDOW,
        }
    }
}

/// Build a streamer for `sink` in the requested mode.
pub fn streamer_for<K, V, S>(sink: S, mode: StreamMode) -> Box<dyn Streamer<K, V>>
where
    K: 'static,
    V: 'static,
    S: AsyncSink<K, V> + 'static,
{
    match mode {
        StreamMode::Async { window } => Box::new(AsyncStreamer::new(sink, window)),
        StreamMode::Sync => Box::new(SyncStreamer::new(sink)),
    }
}

#[derive(Debug, Clone)]
enum Latched {
    Async(String),
    Rejected(String),
}

impl Latched {
    fn to_error(&self) -> HarnessError {
        match self {
            Self::Async(msg) => HarnessError::AsyncOperation(msg.clone()),
            Self::Rejected(msg) => HarnessError::Rejected(msg.clone()),
        }
    }
}

#[derive(Debug, Default)]
struct Window {
    in_flight: usize,
    failure: Option<Latched>,
}

#[derive(Debug)]
struct Shared {
    window: Mutex<Window>,
    changed: Condvar,
    limit: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn complete(&self, result: std::result::Result<(), SinkError>) {
        let mut window = self.lock();
        window.in_flight -= 1;
        if let Err(err) = result {
            if window.failure.is_none() {
                tracing::warn!(error = %err, "Async write failed, streamer is now failing fast");
                window.failure = Some(Latched::Async(err.0));
            } else {
                tracing::debug!(error = %err, "Async write failed after earlier failure");
            }
        }
        drop(window);
        self.changed.notify_all();
    }
}

/// Pipelined streamer with a bounded in-flight window.
pub struct AsyncStreamer<K, V, S> {
    sink: S,
    shared: Arc<Shared>,
    _entries: PhantomData<fn(K, V)>,
}

impl<K, V, S: AsyncSink<K, V>> AsyncStreamer<K, V, S> {
    /// Create a streamer allowing `window` writes in flight (minimum 1).
    pub fn new(sink: S, window: usize) -> Self {
        Self {
            sink,
            shared: Arc::new(Shared {
                window: Mutex::new(Window::default()),
                changed: Condvar::new(),
                limit: window.max(1),
            }),
            _entries: PhantomData,
        }
    }

    pub fn window(&self) -> usize {
        self.shared.limit
    }

    /// Writes submitted but not yet completed.
    pub fn in_flight(&self) -> usize {
        self.shared.lock().in_flight
    }

    /// Submit one write, blocking while the window is full.
    pub fn push_entry(&self, key: K, value: V) -> Result<()> {
        {
            let mut window = self.shared.lock();
            loop {
                if let Some(failure) = &window.failure {
                    return Err(failure.to_error());
                }
                if window.in_flight < self.shared.limit {
                    break;
                }
                window = self
                    .shared
                    .changed
                    .wait(window)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            window.in_flight += 1;
        }

        let shared = Arc::clone(&self.shared);
        let on_complete: Completion = Box::new(move |result| shared.complete(result));

        if let Err(err) = self.sink.put_async(key, value, on_complete) {
            let mut window = self.shared.lock();
            window.in_flight -= 1;
            if window.failure.is_none() {
                tracing::warn!(error = %err, "Sink rejected write, streamer is now failing fast");
                window.failure = Some(Latched::Rejected(err.0.clone()));
            }
            drop(window);
            self.shared.changed.notify_all();
            return Err(HarnessError::Rejected(err.0));
        }
        Ok(())
    }

    /// Block until nothing is in flight, then return the latched failure if any.
    pub fn await_completion(&self) -> Result<()> {
        let mut window = self.shared.lock();
        while window.in_flight > 0 {
            window = self
                .shared
                .changed
                .wait(window)
                .unwrap_or_else(PoisonError::into_inner);
        }
        match &window.failure {
            Some(failure) => Err(failure.to_error()),
            None => Ok(()),
        }
    }
}

impl<K, V, S: AsyncSink<K, V>> Streamer<K, V> for AsyncStreamer<K, V, S> {
    fn push_entry(&self, key: K, value: V) -> Result<()> {
        AsyncStreamer::push_entry(self, key, value)
    }

    fn await_completion(&self) -> Result<()> {
        AsyncStreamer::await_completion(self)
    }
}

/// Streamer that waits for every write before accepting the next one.
pub struct SyncStreamer<K, V, S> {
    sink: S,
    failure: Mutex<Option<Latched>>,
    _entries: PhantomData<fn(K, V)>,
}

impl<K, V, S: AsyncSink<K, V>> SyncStreamer<K, V, S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            failure: Mutex::new(None),
            _entries: PhantomData,
        }
    }

    fn latch(&self, failure: Latched) -> HarnessError {
        let mut slot = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        slot.get_or_insert(failure).to_error()
    }
}

impl<K, V, S: AsyncSink<K, V>> Streamer<K, V> for SyncStreamer<K, V, S> {
    fn push_entry(&self, key: K, value: V) -> Result<()> {
        if let Some(failure) = &*self.failure.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(failure.to_error());
        }

        let (tx, rx) = mpsc::channel();
        let on_complete: Completion = Box::new(move |result| {
            let _ = tx.send(result);
        });
        if let Err(err) = self.sink.put_async(key, value, on_complete) {
            return Err(self.latch(Latched::Rejected(err.0)));
        }

        match rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(self.latch(Latched::Async(err.0))),
            Err(_) => Err(self.latch(Latched::Async(
                "sink dropped the completion callback".to_string(),
            ))),
        }
    }

    fn await_completion(&self) -> Result<()> {
        match &*self.failure.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(failure) => Err(failure.to_error()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    /// Completes writes immediately, optionally failing one key.
    #[derive(Default)]
    struct ImmediateSink {
        writes: AtomicUsize,
        fail_key: Option<u32>,
        reject_key: Option<u32>,
    }

    impl AsyncSink<u32, String> for ImmediateSink {
        fn put_async(
            &self,
            key: u32,
            _value: String,
            on_complete: Completion,
        ) -> std::result::Result<(), SinkError> {
            if self.reject_key == Some(key) {
                return Err(SinkError::new("key rejected by validation"));
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            if self.fail_key == Some(key) {
                on_complete(Err(SinkError::new("expected exception")));
            } else {
                on_complete(Ok(()));
            }
            Ok(())
        }
    }

    /// Holds completions until the test releases them.
    #[derive(Default)]
    struct ParkedSink {
        pending: Mutex<Vec<Completion>>,
    }

    impl ParkedSink {
        fn pending(&self) -> usize {
            self.pending.lock().unwrap().len()
        }

        fn complete_one(&self, result: std::result::Result<(), SinkError>) {
            let completion = self.pending.lock().unwrap().pop().expect("nothing pending");
            completion(result);
        }
    }

    impl AsyncSink<u32, String> for ParkedSink {
        fn put_async(
            &self,
            _key: u32,
            _value: String,
            on_complete: Completion,
        ) -> std::result::Result<(), SinkError> {
            self.pending.lock().unwrap().push(on_complete);
            Ok(())
        }
    }

    #[test]
    fn test_await_with_nothing_in_flight_returns() {
        let streamer = AsyncStreamer::new(ImmediateSink::default(), 4);
        streamer.await_completion().unwrap();
    }

    #[test]
    fn test_push_and_await_many_entries() {
        let sink = Arc::new(ImmediateSink::default());
        let streamer = Arc::new(AsyncStreamer::new(Arc::clone(&sink), 16));

        let pusher = {
            let streamer = Arc::clone(&streamer);
            thread::spawn(move || {
                for i in 0..5000 {
                    streamer.push_entry(i, "value".to_string()).unwrap();
                }
            })
        };
        pusher.join().unwrap();
        streamer.await_completion().unwrap();

        assert_eq!(sink.writes.load(Ordering::SeqCst), 5000);
        assert_eq!(streamer.in_flight(), 0);
    }

    #[test]
    fn test_push_blocks_when_window_full() {
        let sink = Arc::new(ParkedSink::default());
        let streamer = Arc::new(AsyncStreamer::new(Arc::clone(&sink), 2));

        streamer.push_entry(1, "a".into()).unwrap();
        streamer.push_entry(2, "b".into()).unwrap();
        assert_eq!(streamer.in_flight(), 2);

        let pushed = Arc::new(AtomicUsize::new(0));
        let blocked = {
            let streamer = Arc::clone(&streamer);
            let pushed = Arc::clone(&pushed);
            thread::spawn(move || {
                streamer.push_entry(3, "c".into()).unwrap();
                pushed.fetch_add(1, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert_eq!(pushed.load(Ordering::SeqCst), 0, "push should block on full window");
        assert_eq!(sink.pending(), 2);

        sink.complete_one(Ok(()));
        blocked.join().unwrap();
        assert_eq!(pushed.load(Ordering::SeqCst), 1);
        assert_eq!(streamer.in_flight(), 2);

        sink.complete_one(Ok(()));
        sink.complete_one(Ok(()));
        streamer.await_completion().unwrap();
    }

    #[test]
    fn test_await_blocks_until_drained() {
        let sink = Arc::new(ParkedSink::default());
        let streamer = Arc::new(AsyncStreamer::new(Arc::clone(&sink), 8));
        streamer.push_entry(1, "a".into()).unwrap();

        let waiter = {
            let streamer = Arc::clone(&streamer);
            thread::spawn(move || streamer.await_completion())
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        sink.complete_one(Ok(()));
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn test_async_failure_fails_fast() {
        let sink = ImmediateSink {
            fail_key: Some(1),
            ..Default::default()
        };
        let streamer = AsyncStreamer::new(sink, 4);

        streamer.push_entry(1, "value".into()).unwrap();
        let err = streamer.await_completion().unwrap_err();
        assert!(matches!(err, HarnessError::AsyncOperation(ref m) if m == "expected exception"));

        let err = streamer.push_entry(2, "value".into()).unwrap_err();
        assert!(matches!(err, HarnessError::AsyncOperation(ref m) if m == "expected exception"));
        // Rejected before reaching the sink.
        assert_eq!(streamer.sink.writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_await_after_failure_waits_for_drain() {
        let sink = Arc::new(ParkedSink::default());
        let streamer = Arc::new(AsyncStreamer::new(Arc::clone(&sink), 8));
        for key in 1..=3 {
            streamer.push_entry(key, "v".into()).unwrap();
        }

        let waiter = {
            let streamer = Arc::clone(&streamer);
            thread::spawn(move || streamer.await_completion())
        };
        thread::sleep(Duration::from_millis(20));
        sink.complete_one(Err(SinkError::new("write timed out")));

        // Pushes fail fast, but await holds until the window drains.
        assert!(streamer.push_entry(4, "v".into()).is_err());
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        assert_eq!(streamer.in_flight(), 2);

        sink.complete_one(Ok(()));
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        sink.complete_one(Ok(()));
        let err = waiter.join().unwrap().unwrap_err();
        assert!(err.to_string().contains("write timed out"));
        assert_eq!(streamer.in_flight(), 0);
    }

    #[test]
    fn test_synchronous_rejection_is_distinct_but_latched() {
        let sink = ImmediateSink {
            reject_key: Some(1),
            ..Default::default()
        };
        let streamer = AsyncStreamer::new(sink, 4);

        let err = streamer.push_entry(1, "foobar".into()).unwrap_err();
        assert!(matches!(err, HarnessError::Rejected(_)));
        assert_eq!(streamer.in_flight(), 0);

        assert!(matches!(
            streamer.await_completion().unwrap_err(),
            HarnessError::Rejected(_)
        ));
        assert!(streamer.push_entry(2, "ok".into()).is_err());
        assert_eq!(streamer.sink.writes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_window_minimum_is_one() {
        let streamer = AsyncStreamer::new(ImmediateSink::default(), 0);
        assert_eq!(streamer.window(), 1);
        streamer.push_entry(1, "v".into()).unwrap();
        streamer.await_completion().unwrap();
    }

    #[test]
    fn test_sync_streamer_latches_failure() {
        let sink = ImmediateSink {
            fail_key: Some(3),
            ..Default::default()
        };
        let streamer: Box<dyn Streamer<u32, String>> = streamer_for(sink, StreamMode::Sync);
        streamer.push_entry(1, "a".into()).unwrap();
        streamer.push_entry(2, "b".into()).unwrap();
        assert!(streamer.push_entry(3, "c".into()).is_err());
        assert!(streamer.push_entry(4, "d".into()).is_err());
        assert!(streamer.await_completion().is_err());
    }

    #[test]
    fn test_streamer_for_async_mode() {
        let streamer: Box<dyn Streamer<u32, String>> =
            streamer_for(ImmediateSink::default(), StreamMode::default());
        for i in 0..100 {
            streamer.push_entry(i, "v".into()).unwrap();
        }
        streamer.await_completion().unwrap();
    }
}
