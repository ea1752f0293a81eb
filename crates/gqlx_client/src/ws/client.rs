use super::dial::{tungstenite_dialer, Dialer, WsConnection};
use super::protocol::{MessageType, OperationMessage};
use crate::response::{BoxResponse, ChanResponse, Response, SingleResponse};
use crate::transport::Transport;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use gqlx_core::{Error, ErrorCode, Operation, Result};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace, warn};

/// Ws client configuration.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// `ws://` or `wss://` endpoint.
    pub url: String,
    /// Headers sent with the handshake.
    pub headers: HashMap<String, String>,
    /// Delay before redialing after a failed dial or a reset.
    pub backoff: Duration,
    /// A connection that stays silent this long is reset.
    pub read_timeout: Duration,
    /// Results buffered per operation.
    pub buffer: usize,
    /// Payload of `connection_init`.
    pub init_payload: Option<serde_json::Value>,
    /// Log every protocol frame at `trace` level.
    pub trace_protocol: bool,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            headers: HashMap::new(),
            backoff: Duration::from_secs(1),
            read_timeout: Duration::from_secs(60),
            buffer: 16,
            init_payload: None,
            trace_protocol: false,
        }
    }
}

impl WsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    #[must_use]
    pub fn buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer;
        self
    }

    #[must_use]
    pub fn init_payload(mut self, payload: serde_json::Value) -> Self {
        self.init_payload = Some(payload);
        self
    }

    #[must_use]
    pub fn trace_protocol(mut self, enabled: bool) -> Self {
        self.trace_protocol = enabled;
        self
    }
}

/// Connection state of a [`WsTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No usable connection.
    Disconnected,
    /// Connected, `connection_ack` not yet received.
    Connected,
    /// Acknowledged; operations may be started.
    Ready,
}

struct Pending {
    operation: Operation,
    response: Arc<ChanResponse>,
    /// Whether `start` went out on the current connection.
    started: bool,
}

enum Command {
    Start(String),
    Stop(String),
}

struct Shared {
    config: WsConfig,
    state: Mutex<ConnectionState>,
    running: AtomicBool,
    pending: Mutex<IndexMap<String, Pending>>,
    next_id: AtomicU64,
    commands: mpsc::UnboundedSender<Command>,
    errors: broadcast::Sender<Error>,
    shutdown: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = std::mem::replace(&mut *lock(&self.state), state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "connection state changed");
        }
    }

    fn notify(&self, err: Error) {
        // No receivers is fine.
        let _ = self.errors.send(err);
    }

    /// Forgets an operation and tells the server to stop it if it was
    /// started.
    fn stop(&self, id: &str) {
        let removed = lock(&self.pending).shift_remove(id);
        if let Some(pending) = removed {
            if pending.started {
                let _ = self.commands.send(Command::Stop(id.to_string()));
            }
        }
    }
}

/// Subscription transport over a persistent `graphql-ws` connection.
///
/// One background task owns the connection. It reconnects after any
/// transport failure and restarts every pending operation once the new
/// connection is acknowledged, so consumers only notice a delivery gap.
/// Dropping the last handle shuts the loop down.
#[derive(Clone)]
pub struct WsTransport {
    shared: Arc<Shared>,
    _guard: Arc<DropGuard>,
}

impl WsTransport {
    /// Connects to `config.url` with `tokio-tungstenite`.
    pub fn connect(config: WsConfig) -> Self {
        let dialer = tungstenite_dialer(config.url.clone(), config.headers.clone());
        Self::spawn(config, dialer, CancellationToken::new())
    }

    /// Starts the client loop with a custom dialer. Cancelling `shutdown`
    /// stops the loop and fails every pending operation.
    pub fn spawn(config: WsConfig, dialer: Dialer, shutdown: CancellationToken) -> Self {
        let shutdown = shutdown.child_token();
        let guard = shutdown.clone().drop_guard();
        let (commands, receiver) = mpsc::unbounded_channel();
        let (errors, _) = broadcast::channel(16);
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(ConnectionState::Disconnected),
            running: AtomicBool::new(true),
            pending: Mutex::new(IndexMap::new()),
            next_id: AtomicU64::new(1),
            commands,
            errors,
            shutdown,
        });

        let worker = Worker {
            shared: shared.clone(),
            dialer,
            commands: receiver,
            conn: None,
            read_deadline: Instant::now(),
        };
        tokio::spawn(worker.run());

        Self {
            shared,
            _guard: Arc::new(guard),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Returns false once the client loop has exited.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Number of operations awaiting or receiving results.
    pub fn pending_count(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    /// Connection-level errors: failed dials, resets and shutdown.
    pub fn errors(&self) -> broadcast::Receiver<Error> {
        self.shared.errors.subscribe()
    }

    /// Stops every pending operation, then shuts the client down.
    pub fn close(&self) {
        let responses: Vec<_> = lock(&self.shared.pending)
            .values()
            .map(|p| p.response.clone())
            .collect();
        for response in responses {
            response.close();
        }
        self.shared.shutdown.cancel();
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn request(&self, operation: Operation) -> BoxResponse {
        if !self.is_running() {
            return Arc::new(SingleResponse::failed(Error::closed("ws client is not running")));
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let response = {
            let id = id.clone();
            Arc::new(ChanResponse::with_on_close(
                self.shared.config.buffer,
                move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.stop(&id);
                    }
                },
            ))
        };

        lock(&self.shared.pending).insert(
            id.clone(),
            Pending {
                operation,
                response: response.clone(),
                started: false,
            },
        );
        trace!(%id, "operation registered");
        let _ = self.shared.commands.send(Command::Start(id));

        response
    }
}

enum Event {
    Shutdown,
    Command(Option<Command>),
    Frame(Option<Result<OperationMessage>>),
    ReadTimeout,
}

/// Owner of the physical connection.
struct Worker {
    shared: Arc<Shared>,
    dialer: Dialer,
    commands: mpsc::UnboundedReceiver<Command>,
    conn: Option<WsConnection>,
    read_deadline: Instant,
}

impl Worker {
    async fn run(mut self) {
        let shutdown = self.shared.shutdown.clone();

        loop {
            if shutdown.is_cancelled() {
                self.shared.notify(Error::cancelled());
                break;
            }

            if self.conn.is_none() && !self.establish(&shutdown).await {
                continue;
            }

            let event = {
                let Some(conn) = self.conn.as_mut() else {
                    continue;
                };
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => Event::Shutdown,
                    command = self.commands.recv() => Event::Command(command),
                    frame = conn.stream.next() => Event::Frame(frame),
                    () = tokio::time::sleep_until(self.read_deadline) => Event::ReadTimeout,
                }
            };

            match event {
                Event::Shutdown | Event::Command(None) => {
                    self.shared.notify(Error::cancelled());
                    break;
                }
                Event::Command(Some(command)) => self.on_command(command).await,
                Event::ReadTimeout => {
                    self.reset(Error::new(ErrorCode::Timeout, "no message within read timeout"))
                        .await;
                }
                Event::Frame(None) => {
                    self.reset(Error::new(ErrorCode::ConnectionError, "connection dropped"))
                        .await;
                }
                Event::Frame(Some(Err(err))) if err.code == ErrorCode::ConnectionTerminated => {
                    debug!(error = %err, "server closed the connection");
                    self.shared.notify(err);
                    break;
                }
                Event::Frame(Some(Err(err))) => self.reset(err).await,
                Event::Frame(Some(Ok(message))) => {
                    self.read_deadline = Instant::now() + self.shared.config.read_timeout;
                    self.dispatch(message).await;
                }
            }
        }

        self.finish().await;
    }

    /// Dials and sends `connection_init`. Returns false after a failed
    /// attempt, once the backoff has elapsed.
    async fn establish(&mut self, shutdown: &CancellationToken) -> bool {
        self.shared.set_state(ConnectionState::Disconnected);

        let dialed = tokio::select! {
            () = shutdown.cancelled() => return false,
            dialed = (self.dialer)() => dialed,
        };
        match dialed {
            Ok(conn) => {
                self.conn = Some(conn);
                self.shared.set_state(ConnectionState::Connected);
                self.read_deadline = Instant::now() + self.shared.config.read_timeout;
                let init = OperationMessage::init(self.shared.config.init_payload.clone());
                if let Err(err) = self.write(init).await {
                    self.reset(err).await;
                    return false;
                }
                true
            }
            Err(err) => {
                warn!(error = %err, "dial failed");
                self.shared.notify(err);
                backoff(self.shared.config.backoff, shutdown).await;
                false
            }
        }
    }

    /// Drops the connection and marks every operation unstarted so the
    /// next `connection_ack` restarts it.
    async fn reset(&mut self, err: Error) {
        warn!(error = %err, "resetting connection");
        self.shared.set_state(ConnectionState::Disconnected);
        for pending in lock(&self.shared.pending).values_mut() {
            pending.started = false;
        }
        if let Some(mut conn) = self.conn.take() {
            let _ = conn.sink.close().await;
        }
        self.shared.notify(err);
        let shutdown = self.shared.shutdown.clone();
        backoff(self.shared.config.backoff, &shutdown).await;
    }

    async fn write(&mut self, message: OperationMessage) -> Result<()> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(Error::new(ErrorCode::ConnectionError, "not connected"));
        };
        if self.shared.config.trace_protocol {
            trace!(direction = "send", kind = %message.kind, id = ?message.id, payload = ?message.payload);
        }
        conn.sink.send(message).await
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Start(id) => {
                if self.shared.state() != ConnectionState::Ready {
                    // Started on the next connection_ack.
                    return;
                }
                if let Err(err) = self.start(&id).await {
                    self.reset(err).await;
                }
            }
            Command::Stop(id) => {
                if self.conn.is_some() {
                    if let Err(err) = self.write(OperationMessage::stop(&id)).await {
                        self.reset(err).await;
                    }
                }
            }
        }
    }

    /// Sends `start` for `id` unless it is gone or already started.
    async fn start(&mut self, id: &str) -> Result<()> {
        let payload = {
            let mut pending = lock(&self.shared.pending);
            match pending.get_mut(id) {
                Some(p) if !p.started => {
                    p.started = true;
                    p.operation.payload()
                }
                _ => return Ok(()),
            }
        };
        debug!(%id, "starting operation");
        self.write(OperationMessage::start(id, &payload)).await
    }

    async fn dispatch(&mut self, message: OperationMessage) {
        if self.shared.config.trace_protocol {
            trace!(direction = "recv", kind = %message.kind, id = ?message.id, payload = ?message.payload);
        }

        let kind = message.kind.clone();
        match kind {
            MessageType::ConnectionAck => {
                self.shared.set_state(ConnectionState::Ready);
                let unstarted: Vec<String> = lock(&self.shared.pending)
                    .iter()
                    .filter(|(_, p)| !p.started)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in unstarted {
                    if let Err(err) = self.start(&id).await {
                        self.reset(err).await;
                        return;
                    }
                }
            }
            MessageType::KeepAlive => {}
            MessageType::ConnectionError => {
                let detail = message
                    .payload
                    .map(|p| p.to_string())
                    .unwrap_or_default();
                self.reset(Error::new(
                    ErrorCode::ConnectionError,
                    format!("connection_error: {detail}"),
                ))
                .await;
            }
            MessageType::Complete => {
                let Some(id) = message.id.as_deref() else {
                    return;
                };
                let removed = lock(&self.shared.pending).shift_remove(id);
                if let Some(pending) = removed {
                    debug!(%id, "operation completed");
                    pending.response.close_channel();
                }
            }
            MessageType::Data | MessageType::Error => {
                let Some(id) = message.id.clone() else {
                    return;
                };
                let response = lock(&self.shared.pending)
                    .get(&id)
                    .map(|p| p.response.clone());
                match response {
                    Some(response) => {
                        response.send(message.into_result()).await;
                    }
                    None => trace!(%id, "result for unknown operation"),
                }
            }
            other => trace!(kind = %other, "ignoring message"),
        }
    }

    async fn finish(mut self) {
        self.shared.running.store(false, Ordering::SeqCst);

        // Stops queued by close() go out before the terminate.
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Stop(id) = command {
                if self.conn.is_some() && self.write(OperationMessage::stop(&id)).await.is_err() {
                    break;
                }
            }
        }
        if self.conn.is_some() {
            let _ = self.write(OperationMessage::terminate()).await;
        }
        if let Some(mut conn) = self.conn.take() {
            let _ = conn.sink.close().await;
        }
        self.shared.set_state(ConnectionState::Disconnected);

        let orphans = std::mem::take(&mut *lock(&self.shared.pending));
        let err = if self.shared.shutdown.is_cancelled() {
            Error::cancelled()
        } else {
            Error::new(ErrorCode::ConnectionTerminated, "connection terminated by server")
        };
        for (_, pending) in orphans {
            pending.response.close_with_error(err.clone());
        }
        debug!("ws client stopped");
    }
}

/// Sleeps for `delay` unless `shutdown` fires first.
async fn backoff(delay: Duration, shutdown: &CancellationToken) {
    tokio::select! {
        () = shutdown.cancelled() => {}
        () = tokio::time::sleep(delay) => {}
    }
}
