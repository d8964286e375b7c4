//! Scripted in-memory connector shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures_util::{Sink, SinkExt, StreamExt};
use mediagen_realtime::{
    Connector, Frame, RetryPolicy, Session, SessionConfig, StaticToken, TransportError,
    TransportLink, transport::FrameSink,
};
use std::{
    collections::VecDeque,
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};
use tokio::{sync::mpsc, time::Instant};

/// Server side of one scripted transport.
pub struct Peer {
    pub url: String,
    to_client: fmpsc::UnboundedSender<Result<Frame, TransportError>>,
    from_client: fmpsc::UnboundedReceiver<Frame>,
}

impl Peer {
    pub fn push_text(&self, text: &str) {
        let _ = self.to_client.unbounded_send(Ok(Frame::Text(text.to_string())));
    }

    pub fn push_binary(&self, data: &[u8]) {
        let _ = self.to_client.unbounded_send(Ok(Frame::Binary(data.to_vec())));
    }

    pub fn close(&self) {
        let _ = self.to_client.unbounded_send(Ok(Frame::Close(Some("bye".into()))));
    }

    pub fn fail(&self, err: TransportError) {
        let _ = self.to_client.unbounded_send(Err(err));
    }

    /// Next frame written by the session, or `None` once it released the transport.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_client.next().await
    }
}

struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Sink that delivers frames but never finishes closing, like a peer that
/// stops reading after the close frame.
struct NeverCloses<S>(S);

impl<S> Sink<Frame> for NeverCloses<S>
where
    S: Sink<Frame, Error = TransportError> + Unpin,
{
    type Error = TransportError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.0).poll_ready(cx)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Frame) -> Result<(), Self::Error> {
        Pin::new(&mut self.0).start_send(item)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Pending
    }
}

/// Connector whose attempts succeed or fail according to a script. Once the
/// script runs out every attempt succeeds.
pub struct ScriptedConnector {
    script: Mutex<VecDeque<Result<(), TransportError>>>,
    attempts: Mutex<Vec<(Instant, String)>>,
    peers: mpsc::UnboundedSender<Peer>,
    live: Arc<AtomicUsize>,
    max_live: AtomicUsize,
    stuck_close: AtomicBool,
}

impl ScriptedConnector {
    pub fn new(script: Vec<Result<(), TransportError>>) -> (Arc<Self>, mpsc::UnboundedReceiver<Peer>) {
        let (peers, peers_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            script: Mutex::new(script.into()),
            attempts: Mutex::new(Vec::new()),
            peers,
            live: Arc::new(AtomicUsize::new(0)),
            max_live: AtomicUsize::new(0),
            stuck_close: AtomicBool::new(false),
        });
        (connector, peers_rx)
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().iter().map(|(at, _)| *at).collect()
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    /// Transports opened from now on never complete a local close, so the
    /// session has to wait out its close grace.
    pub fn hold_close(&self) {
        self.stuck_close.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, url: &str) -> Result<TransportLink, TransportError> {
        self.attempts
            .lock()
            .unwrap()
            .push((Instant::now(), url.to_string()));
        let outcome = self.script.lock().unwrap().pop_front().unwrap_or(Ok(()));
        outcome?;

        let (to_client, inbound) = fmpsc::unbounded();
        let (outbound, from_client) = fmpsc::unbounded();

        let now_live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(now_live, Ordering::SeqCst);
        let guard = LiveGuard(self.live.clone());

        let stream = inbound.map(move |item| {
            let _alive = &guard;
            item
        });
        let sink = outbound.sink_map_err(|e| TransportError::Io(e.to_string()));
        let sink: FrameSink = if self.stuck_close.load(Ordering::SeqCst) {
            Box::pin(NeverCloses(sink))
        } else {
            Box::pin(sink)
        };

        let _ = self.peers.send(Peer {
            url: url.to_string(),
            to_client,
            from_client,
        });
        Ok(TransportLink::new(sink, Box::pin(stream)))
    }
}

pub fn refused() -> Result<(), TransportError> {
    Err(TransportError::Connect("connection refused".to_string()))
}

pub fn config(retry_limit: u32, base_delay: Duration) -> SessionConfig {
    SessionConfig::new("https://rt.example.com/ws")
        .with_retry(RetryPolicy::new(retry_limit, base_delay).with_max_delay(Duration::from_secs(60)))
}

pub fn session(
    config: SessionConfig,
    script: Vec<Result<(), TransportError>>,
) -> (Session, Arc<ScriptedConnector>, mpsc::UnboundedReceiver<Peer>) {
    let (connector, peers) = ScriptedConnector::new(script);
    let session = Session::new(config, connector.clone(), Arc::new(StaticToken::none()));
    (session, connector, peers)
}
