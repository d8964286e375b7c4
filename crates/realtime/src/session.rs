//! Manages one logical realtime connection: connect, reconnect with backoff,
//! outbound queueing and fan-out of inbound messages to subscribers.
//!
//! All network activity for a session happens on a single driver task. The
//! driver owns the transport; the [`Session`] handle only talks to it through
//! a bounded outbound queue and the shared state below. Every driver is
//! tagged with a generation number, and a driver whose generation is no
//! longer current never touches session state or subscribers again.

use crate::{
    config::SessionConfig,
    credentials::TokenSource,
    endpoint,
    error::{SessionError, TransportError},
    events::{EventKind, Registry, SessionEvent, Subscription},
    transport::{Connector, Frame, TransportLink, WsConnector},
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::{
    fmt, mem,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::{
    runtime::Handle,
    sync::{
        broadcast,
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    task::JoinHandle,
};
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

const STATE_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle of a [`Session`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        })
    }
}

/// Outbound message accepted by [`Session::send`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_owned())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Payload::Binary(data)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Text(value.to_string())
    }
}

impl From<Payload> for Frame {
    fn from(payload: Payload) -> Self {
        match payload {
            Payload::Text(text) => Frame::Text(text),
            Payload::Binary(data) => Frame::Binary(data),
        }
    }
}

struct Inner {
    state: ConnectionState,
    retry_count: u32,
    manual_close: bool,
    /// Set once automatic reconnection gave up; only `reset` clears it.
    exhausted: bool,
    generation: u64,
    /// Present only while `Open`.
    outbound: Option<mpsc::Sender<Frame>>,
    driver: Option<JoinHandle<()>>,
    /// Drivers that were replaced and may still be flushing a close frame.
    closing: Vec<JoinHandle<()>>,
}

struct Shared {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenSource>,
    subscribers: Arc<Registry>,
    states: broadcast::Sender<ConnectionState>,
    inner: Mutex<Inner>,
    /// Held by `connect` and `reset` from retiring the old driver until the
    /// new one is spawned, so overlapping calls queue behind one teardown.
    handover: tokio::sync::Mutex<()>,
}

/// How a single connection attempt ended.
enum Attempt {
    /// Never reached `Open`.
    Failed(SessionError),
    /// Was open, then the peer closed or the transport broke.
    Dropped(Option<TransportError>),
    /// A newer generation took over.
    Stale,
}

enum PumpEnd {
    /// We sent the close frame ourselves.
    Local,
    Peer(Option<String>),
    Failed(TransportError),
}

/// Replaced drivers being waited on. Whatever has not finished when this is
/// dropped goes back to `closing`, so a cancelled wait is picked up by the
/// next `connect`.
struct PendingClose<'a> {
    shared: &'a Shared,
    handles: Vec<JoinHandle<()>>,
}

impl PendingClose<'_> {
    async fn wait(mut self) {
        while let Some(handle) = self.handles.last_mut() {
            let _ = handle.await;
            self.handles.pop();
        }
    }
}

impl Drop for PendingClose<'_> {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.shared.lock().closing.append(&mut self.handles);
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        debug!(from = %inner.state, to = %state, "Session state transition");
        inner.state = state;
        let _ = self.states.send(state);
    }

    /// Runs `f` only if `generation` is still the current driver.
    fn with_current<R>(&self, generation: u64, f: impl FnOnce(&mut Inner) -> R) -> Option<R> {
        let mut inner = self.lock();
        (inner.generation == generation).then(|| f(&mut inner))
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    fn pending_close(&self, inner: &mut Inner) -> PendingClose<'_> {
        PendingClose {
            shared: self,
            handles: mem::take(&mut inner.closing),
        }
    }

    /// Detaches the current driver and bumps the generation.
    ///
    /// An open transport is asked to send a close frame and gets
    /// `close_grace` to do so before it is aborted; any other driver (still
    /// connecting, or waiting out a backoff delay) is aborted immediately.
    /// The handle is parked in `closing` so a later `connect` can wait for
    /// the old transport to be gone.
    fn retire(&self, inner: &mut Inner) {
        inner.generation += 1;
        let outbound = inner.outbound.take();
        let Some(driver) = inner.driver.take() else {
            return;
        };

        let graceful = outbound.is_some_and(|tx| tx.try_send(Frame::Close(None)).is_ok());
        match (graceful, Handle::try_current()) {
            (true, Ok(runtime)) => {
                let abort = driver.abort_handle();
                let grace = self.config.close_grace;
                runtime.spawn(async move {
                    tokio::time::sleep(grace).await;
                    abort.abort();
                });
            }
            _ => driver.abort(),
        }
        inner.closing.push(driver);
    }

    async fn resolve_url(&self, extra_query: Option<&str>) -> Result<url::Url, SessionError> {
        let token = self.tokens.token().await?;
        endpoint::build_url(&self.config.endpoint, token.as_ref(), extra_query)
    }

    async fn attempt(
        &self,
        generation: u64,
        extra_query: Option<&str>,
        ready: &mut Option<oneshot::Sender<Result<(), SessionError>>>,
    ) -> Attempt {
        let url = match self.resolve_url(extra_query).await {
            Ok(url) => url,
            Err(e) => return Attempt::Failed(e),
        };
        let shown = endpoint::redacted(&url);
        debug!(endpoint = %shown, "Opening transport");

        let link = match self.connector.connect(url.as_str()).await {
            Ok(link) => link,
            Err(source) => {
                return Attempt::Failed(SessionError::Connection {
                    endpoint: shown,
                    source,
                });
            }
        };

        let (tx, rx) = mpsc::channel(self.config.send_buffer.max(1));
        let opened = self.with_current(generation, |inner| {
            inner.retry_count = 0;
            inner.outbound = Some(tx);
            self.set_state(inner, ConnectionState::Open);
        });
        if opened.is_none() {
            return Attempt::Stale;
        }

        info!(endpoint = %shown, "Realtime session open");
        self.subscribers.emit(&SessionEvent::Open);
        if let Some(ready) = ready.take() {
            let _ = ready.send(Ok(()));
        }

        let end = self.pump(generation, link, rx).await;

        let dropped = self.with_current(generation, |inner| {
            inner.outbound = None;
            self.set_state(inner, ConnectionState::Closing);
            self.set_state(inner, ConnectionState::Closed);
        });
        match (dropped, end) {
            (None, _) | (_, PumpEnd::Local) => Attempt::Stale,
            (Some(()), PumpEnd::Peer(reason)) => {
                warn!(reason = reason.as_deref().unwrap_or(""), "Peer closed the realtime session");
                Attempt::Dropped(None)
            }
            (Some(()), PumpEnd::Failed(e)) => {
                warn!(error = %e, "Realtime transport failed");
                Attempt::Dropped(Some(e))
            }
        }
    }

    /// Moves frames between the transport and the session until either side
    /// ends it.
    async fn pump(
        &self,
        generation: u64,
        link: TransportLink,
        mut outbound: mpsc::Receiver<Frame>,
    ) -> PumpEnd {
        let TransportLink {
            mut sink,
            mut stream,
        } = link;

        loop {
            tokio::select! {
                frame = outbound.recv() => match frame {
                    Some(Frame::Close(reason)) => {
                        let _ = sink.send(Frame::Close(reason)).await;
                        let _ = sink.close().await;
                        return PumpEnd::Local;
                    }
                    Some(frame) => {
                        if let Err(e) = sink.send(frame).await {
                            return PumpEnd::Failed(e);
                        }
                    }
                    None => {
                        let _ = sink.close().await;
                        return PumpEnd::Local;
                    }
                },
                inbound = stream.next() => match inbound {
                    Some(Ok(Frame::Text(text))) => self.deliver(generation, text.as_bytes()),
                    Some(Ok(Frame::Binary(data))) => self.deliver(generation, &data),
                    Some(Ok(Frame::Close(reason))) => return PumpEnd::Peer(reason),
                    Some(Err(e)) => return PumpEnd::Failed(e),
                    None => return PumpEnd::Peer(None),
                },
            }
        }
    }

    /// Parses one inbound payload. A payload that is not JSON becomes a
    /// single `error` event and no `data` event.
    fn deliver(&self, generation: u64, raw: &[u8]) {
        if !self.is_current(generation) {
            return;
        }
        match serde_json::from_slice::<Value>(raw) {
            Ok(value) => self.subscribers.emit(&SessionEvent::Data(value)),
            Err(e) => {
                warn!(error = %e, bytes = raw.len(), "Dropping undecodable inbound message");
                self.subscribers
                    .emit(&SessionEvent::Error(SessionError::Decode(e.to_string())));
            }
        }
    }

    /// Emits `err` on the `error` channel if `generation` is still current.
    fn report(&self, generation: u64, err: SessionError) {
        if self.is_current(generation) {
            self.subscribers.emit(&SessionEvent::Error(err));
        }
    }
}

/// Driver task: one initial attempt, then reconnects until the retry limit,
/// a manual close, or a newer generation ends it.
async fn run_driver(
    shared: Arc<Shared>,
    generation: u64,
    extra_query: Option<String>,
    ready: oneshot::Sender<Result<(), SessionError>>,
) {
    let mut ready = Some(ready);

    loop {
        match shared
            .attempt(generation, extra_query.as_deref(), &mut ready)
            .await
        {
            Attempt::Stale => return,
            Attempt::Failed(err) => {
                if let Some(ready) = ready.take() {
                    // Never opened: fail fast, no retries.
                    error!(error = %err, "Initial connection failed");
                    let current = shared.with_current(generation, |inner| {
                        shared.set_state(inner, ConnectionState::Failed);
                    });
                    if current.is_some() {
                        shared.subscribers.emit(&SessionEvent::Error(err.clone()));
                        let _ = ready.send(Err(err));
                    }
                    return;
                }
                warn!(error = %err, "Reconnect attempt failed");
                shared.report(generation, err);
            }
            Attempt::Dropped(Some(e)) => shared.report(generation, SessionError::Transport(e)),
            Attempt::Dropped(None) => {}
        }

        let policy = &shared.config.retry;
        let next = shared.with_current(generation, |inner| {
            if inner.manual_close {
                if inner.state != ConnectionState::Closed {
                    shared.set_state(inner, ConnectionState::Closed);
                }
                return None;
            }
            if !policy.allows(inner.retry_count) {
                inner.exhausted = true;
                shared.set_state(inner, ConnectionState::Failed);
                return Some(Err(inner.retry_count));
            }
            inner.retry_count += 1;
            shared.set_state(inner, ConnectionState::Connecting);
            Some(Ok((inner.retry_count, policy.delay_for(inner.retry_count))))
        });

        match next.flatten() {
            None => return,
            Some(Err(attempts)) => {
                error!(attempts, "Giving up on realtime session");
                shared.report(generation, SessionError::RetryExhausted { attempts });
                return;
            }
            Some(Ok((attempt, delay))) => {
                info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// A reconnecting realtime session.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use mediagen_realtime::{Session, SessionConfig, EventKind, SessionEvent, StaticToken};
/// # async fn demo() -> Result<(), mediagen_realtime::SessionError> {
/// let session = Session::with_websocket(
///     SessionConfig::new("https://api.example.com/realtime"),
///     Arc::new(StaticToken::new("token")),
/// );
/// session.connect(Some("task_id=42")).await?;
/// session.on(EventKind::Data, |event: &SessionEvent| println!("{:?}", event));
/// session.send(r#"{"type":"ping"}"#)?;
/// session.disconnect();
/// # Ok(())
/// # }
/// ```
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        let (states, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                tokens,
                subscribers: Arc::new(Registry::default()),
                states,
                inner: Mutex::new(Inner {
                    state: ConnectionState::Idle,
                    retry_count: 0,
                    manual_close: false,
                    exhausted: false,
                    generation: 0,
                    outbound: None,
                    driver: None,
                    closing: Vec::new(),
                }),
                handover: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Session over a real WebSocket transport.
    pub fn with_websocket(config: SessionConfig, tokens: Arc<dyn TokenSource>) -> Self {
        Self::new(config, Arc::new(WsConnector), tokens)
    }

    pub fn endpoint(&self) -> &str {
        &self.shared.config.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn retry_count(&self) -> u32 {
        self.shared.lock().retry_count
    }

    pub fn is_manually_closed(&self) -> bool {
        self.shared.lock().manual_close
    }

    /// Every state transition from now on, in order.
    pub fn state_changes(&self) -> broadcast::Receiver<ConnectionState> {
        self.shared.states.subscribe()
    }

    /// Opens the session, replacing any existing transport.
    ///
    /// All subscribers are removed before the new transport is opened, so
    /// handlers must be registered again after each call. Resolves once the
    /// session is `Open`; if the transport fails first the session moves to
    /// `Failed` and no retries are made.
    #[instrument(name = "realtime_connect", skip_all, fields(endpoint = %self.shared.config.endpoint))]
    pub async fn connect(&self, extra_query: Option<&str>) -> Result<(), SessionError> {
        let handover = self.shared.handover.lock().await;
        let (generation, closing) = {
            let mut inner = self.shared.lock();
            if inner.exhausted {
                return Err(SessionError::RetryExhausted {
                    attempts: inner.retry_count,
                });
            }
            self.shared.retire(&mut inner);
            (inner.generation, self.shared.pending_close(&mut inner))
        };
        self.shared.subscribers.clear();

        // The previous transport must be gone before a new one is opened.
        closing.wait().await;

        let (ready_tx, ready_rx) = oneshot::channel();
        {
            let mut inner = self.shared.lock();
            if inner.generation != generation {
                return Err(SessionError::Superseded);
            }
            inner.retry_count = 0;
            self.shared.set_state(&mut inner, ConnectionState::Connecting);

            let span = info_span!(
                "realtime_session",
                endpoint = %self.shared.config.endpoint,
                generation
            );
            let driver = run_driver(
                self.shared.clone(),
                generation,
                extra_query.map(str::to_owned),
                ready_tx,
            );
            inner.driver = Some(tokio::spawn(driver.instrument(span)));
        }
        drop(handover);

        ready_rx.await.unwrap_or(Err(SessionError::Superseded))
    }

    /// Queues `payload` for the transport.
    ///
    /// Never blocks. Returns `NotConnected` unless the session is `Open`, and
    /// `Backpressure` if the outbound queue is full.
    pub fn send(&self, payload: impl Into<Payload>) -> Result<(), SessionError> {
        let inner = self.shared.lock();
        let state = inner.state;
        let Some(tx) = inner
            .outbound
            .as_ref()
            .filter(|_| state == ConnectionState::Open)
        else {
            warn!(%state, "Dropping outbound message: session is not connected");
            return Err(SessionError::NotConnected(state));
        };

        let payload: Payload = payload.into();
        match tx.try_send(Frame::from(payload)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(capacity = self.shared.config.send_buffer, "Outbound queue full");
                Err(SessionError::Backpressure)
            }
            Err(TrySendError::Closed(_)) => Err(SessionError::NotConnected(state)),
        }
    }

    pub fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), SessionError> {
        let text = serde_json::to_string(value).map_err(|e| SessionError::Encode(e.to_string()))?;
        self.send(Payload::Text(text))
    }

    /// Closes the session and suppresses automatic reconnection. Calling it
    /// again is a no-op.
    pub fn disconnect(&self) {
        let mut inner = self.shared.lock();
        if inner.manual_close && inner.driver.is_none() {
            debug!("Session already disconnected");
            return;
        }
        inner.manual_close = true;
        self.shared.retire(&mut inner);
        if !inner.exhausted {
            self.shared.set_state(&mut inner, ConnectionState::Closed);
        }
        info!(endpoint = %self.shared.config.endpoint, "Realtime session disconnected");
    }

    /// Tears down any transport and returns to `Idle` with the manual-close
    /// flag, retry count and retry exhaustion cleared. Subscribers are kept.
    pub async fn reset(&self) {
        let _handover = self.shared.handover.lock().await;
        let closing = {
            let mut inner = self.shared.lock();
            self.shared.retire(&mut inner);
            inner.manual_close = false;
            inner.exhausted = false;
            inner.retry_count = 0;
            self.shared.set_state(&mut inner, ConnectionState::Idle);
            self.shared.pending_close(&mut inner)
        };
        closing.wait().await;
    }

    /// Registers `handler` for `kind`. Handlers run in registration order.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.shared.subscribers.subscribe(kind, Arc::new(handler))
    }

    pub fn clear_subscribers(&self) {
        self.shared.subscribers.clear();
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.shared.subscribers.count(kind)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        {
            let mut inner = self.shared.lock();
            inner.manual_close = true;
            self.shared.retire(&mut inner);
            inner.closing.clear();
        }
        self.shared.subscribers.clear();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("Session")
            .field("endpoint", &self.shared.config.endpoint)
            .field("state", &inner.state)
            .field("retry_count", &inner.retry_count)
            .field("manual_close", &inner.manual_close)
            .finish()
    }
}
