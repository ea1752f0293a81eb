use super::{ErrorSlot, Response};
use async_trait::async_trait;
use gqlx_core::{Error, OperationResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const DEFAULT_BUFFER: usize = 16;

type OnClose = Box<dyn FnOnce() + Send>;

/// A response fed through a channel by a producer task.
///
/// [`ChanResponse::send`] never blocks past the completion signal: once the
/// consumer closes the response, pending and future sends are dropped.
pub struct ChanResponse {
    sender: Mutex<Option<mpsc::Sender<OperationResult>>>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<OperationResult>>,
    on_close: Mutex<Option<OnClose>>,
    err: ErrorSlot,
    closed: AtomicBool,
    done: CancellationToken,
}

impl Default for ChanResponse {
    fn default() -> Self {
        Self::new()
    }
}

impl ChanResponse {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: tokio::sync::Mutex::new(receiver),
            on_close: Mutex::new(None),
            err: ErrorSlot::default(),
            closed: AtomicBool::new(false),
            done: CancellationToken::new(),
        }
    }

    /// Creates a response that runs `on_close` the first time it is closed.
    pub fn with_on_close(capacity: usize, on_close: impl FnOnce() + Send + 'static) -> Self {
        let response = Self::with_capacity(capacity);
        *lock(&response.on_close) = Some(Box::new(on_close));
        response
    }

    /// Delivers a result to the consumer.
    ///
    /// Waits until the result is buffered or the response is closed. Returns
    /// false if the result was dropped.
    pub async fn send(&self, result: OperationResult) -> bool {
        let Some(sender) = lock(&self.sender).clone() else {
            return false;
        };
        tokio::select! {
            biased;
            () = self.done.cancelled() => false,
            sent = sender.send(result) => sent.is_ok(),
        }
    }

    /// Marks the producer side as finished. The consumer still drains what
    /// is buffered before [`Response::next`] returns `None`.
    pub fn close_channel(&self) {
        lock(&self.sender).take();
    }

    /// Records an error without closing.
    pub fn set_error(&self, err: Error) -> bool {
        self.err.set(err)
    }

    /// Returns true once the response has been closed or drained.
    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Response for ChanResponse {
    async fn next(&self) -> Option<OperationResult> {
        let mut receiver = self.receiver.lock().await;
        let result = receiver.recv().await;
        if result.is_none() {
            self.done.cancel();
        }
        result
    }

    fn err(&self) -> Option<Error> {
        self.err.get()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let on_close = lock(&self.on_close).take();
        if let Some(on_close) = on_close {
            on_close();
        }
        self.close_channel();
        self.done.cancel();
    }

    /// Ignored once [`Response::close`] has run. A response that ended by
    /// draining its channel still takes the error.
    fn close_with_error(&self, err: Error) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.err.set(err);
        self.close();
    }

    fn done(&self) -> CancellationToken {
        self.done.clone()
    }
}

impl std::fmt::Debug for ChanResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChanResponse")
            .field("done", &self.done.is_cancelled())
            .field("err", &self.err.get())
            .finish_non_exhaustive()
    }
}
