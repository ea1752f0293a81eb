use super::{same_response, BoxResponse, ChanResponse, Response};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use gqlx_core::{Error, OperationResult};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Per-result hook of a bind. It decides whether and when the result reaches
/// the proxy's consumer by calling [`ProxySink::send`].
pub type OnResult = Arc<dyn Fn(OperationResult, ProxySink) -> BoxFuture<'static, ()> + Send + Sync>;

struct Bind {
    id: u64,
    upstream: BoxResponse,
}

struct Inner {
    out: ChanResponse,
    binds: Mutex<Vec<Bind>>,
    /// Hooks currently running. The proxy never auto-closes while one runs,
    /// so a hook can unbind its own upstream and bind a replacement.
    in_flight: AtomicUsize,
    next_bind: AtomicU64,
}

/// A response that relays results from the upstream responses bound to it.
///
/// The consumer sees one stable response while upstreams are swapped
/// underneath it with [`ProxyResponse::unbind`] and [`ProxyResponse::bind`].
/// The proxy closes itself once its last bind is gone and no hook is running.
#[derive(Clone)]
pub struct ProxyResponse {
    inner: Arc<Inner>,
}

impl Default for ProxyResponse {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyResponse {
    /// Creates a proxy with no binds. Callers bind an upstream before
    /// handing the proxy out.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                out: ChanResponse::new(),
                binds: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                next_bind: AtomicU64::new(0),
            }),
        }
    }

    /// Creates a proxy relaying `upstream` unchanged.
    pub fn wrap(upstream: BoxResponse) -> Self {
        let proxy = Self::new();
        proxy.bind(upstream, None);
        proxy
    }

    /// Starts relaying `upstream`. Each result goes through `on_result`, or
    /// straight to the consumer when no hook is given.
    ///
    /// The relay task stops when either side finishes: if the proxy closes
    /// first the upstream is closed, if the upstream ends first its error (if
    /// any) is recorded on the proxy.
    pub fn bind(&self, upstream: BoxResponse, on_result: Option<OnResult>) {
        let id = self.inner.next_bind.fetch_add(1, Ordering::Relaxed);
        self.inner.binds().push(Bind {
            id,
            upstream: upstream.clone(),
        });
        trace!(bind = id, "bound upstream");

        let inner = self.inner.clone();
        tokio::spawn(inner.relay(id, upstream, on_result));
    }

    /// Detaches `upstream`. Returns false if it was not bound.
    ///
    /// The upstream itself is left open; callers replacing it close it.
    pub fn unbind(&self, upstream: &BoxResponse) -> bool {
        let removed = {
            let mut binds = self.inner.binds();
            let before = binds.len();
            binds.retain(|b| !same_response(&b.upstream, upstream));
            binds.len() != before
        };
        if removed {
            self.inner.close_if_idle();
        }
        removed
    }

    /// Number of currently bound upstreams.
    pub fn bind_count(&self) -> usize {
        self.inner.binds().len()
    }

    /// Returns a boxed handle to this proxy.
    pub fn boxed(&self) -> BoxResponse {
        Arc::new(self.clone())
    }
}

impl Inner {
    fn binds(&self) -> MutexGuard<'_, Vec<Bind>> {
        self.binds.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_bound(&self, id: u64) -> bool {
        self.binds().iter().any(|b| b.id == id)
    }

    fn remove_bind(&self, id: u64) -> bool {
        let mut binds = self.binds();
        let before = binds.len();
        binds.retain(|b| b.id != id);
        binds.len() != before
    }

    fn close_if_idle(&self) {
        let idle = {
            let binds = self.binds();
            binds.is_empty() && self.in_flight.load(Ordering::SeqCst) == 0
        };
        if idle {
            trace!("last bind gone, closing proxy");
            self.out.close();
        }
    }

    async fn relay(self: Arc<Self>, id: u64, upstream: BoxResponse, on_result: Option<OnResult>) {
        let proxy_done = self.out.done();
        loop {
            let next = tokio::select! {
                biased;
                () = proxy_done.cancelled() => {
                    upstream.close();
                    self.remove_bind(id);
                    return;
                }
                next = upstream.next() => next,
            };

            let Some(result) = next else {
                break;
            };
            if !self.is_bound(id) {
                // Unbound while waiting; the replacement owns delivery now.
                return;
            }

            self.in_flight.fetch_add(1, Ordering::SeqCst);
            match &on_result {
                Some(hook) => {
                    hook(
                        result,
                        ProxySink {
                            inner: self.clone(),
                        },
                    )
                    .await;
                }
                None => {
                    self.out.send(result).await;
                }
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if !self.is_bound(id) {
                self.close_if_idle();
                return;
            }
        }

        if self.remove_bind(id) {
            if let Some(err) = upstream.err() {
                self.out.set_error(err);
            }
        }
        self.close_if_idle();
    }
}

/// Delivery handle passed to [`OnResult`] hooks.
#[derive(Clone)]
pub struct ProxySink {
    inner: Arc<Inner>,
}

impl ProxySink {
    /// Delivers a result to the proxy's consumer. Returns false if the proxy
    /// is already closed.
    pub async fn send(&self, result: OperationResult) -> bool {
        self.inner.out.send(result).await
    }
}

#[async_trait]
impl Response for ProxyResponse {
    async fn next(&self) -> Option<OperationResult> {
        self.inner.out.next().await
    }

    fn err(&self) -> Option<Error> {
        self.inner.out.err()
    }

    fn close(&self) {
        self.inner.out.close();
    }

    fn close_with_error(&self, err: Error) {
        self.inner.out.close_with_error(err);
    }

    fn done(&self) -> CancellationToken {
        self.inner.out.done()
    }
}
