//! Transport seam between the session driver and the network.
//!
//! The session only ever sees a [`TransportLink`]: a sink of outbound
//! [`Frame`]s and a stream of inbound ones. [`WsConnector`] produces links
//! backed by `tokio-tungstenite`; tests plug in scripted connectors.

use crate::error::TransportError;
use async_trait::async_trait;
use futures::{Sink, Stream};
use futures_util::{SinkExt, StreamExt, future};
use std::pin::Pin;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::{CloseFrame, Message as WsMessage, frame::coding::CloseCode},
};
use tracing::debug;

/// A unit of traffic on the transport, in either direction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// Close handshake, with the peer's (or our) reason if any.
    Close(Option<String>),
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

/// An open transport. Dropping both halves releases it.
pub struct TransportLink {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl TransportLink {
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

/// Opens transports. The returned future resolves once the transport is
/// ready to carry frames, or fails if it never gets there.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<TransportLink, TransportError>;
}

/// WebSocket connector built on `tokio-tungstenite`.
#[derive(Clone, Debug, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<TransportLink, TransportError> {
        let (ws_stream, response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!(status = %response.status(), "WebSocket handshake complete");

        let (ws_tx, ws_rx) = ws_stream.split();

        let sink = ws_tx
            .sink_map_err(TransportError::from)
            .with(|frame: Frame| future::ready(Ok::<_, TransportError>(to_ws_message(frame))));

        // Ping/pong are answered by tungstenite itself and never surface.
        let stream = ws_rx.filter_map(|msg| {
            future::ready(match msg {
                Ok(WsMessage::Text(text)) => Some(Ok(Frame::Text(text.as_str().to_owned()))),
                Ok(WsMessage::Binary(data)) => Some(Ok(Frame::Binary(data.to_vec()))),
                Ok(WsMessage::Close(close)) => Some(Ok(Frame::Close(
                    close.map(|c| c.reason.as_str().to_owned()),
                ))),
                Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => None,
                Err(e) => Some(Err(TransportError::from(e))),
            })
        });

        Ok(TransportLink::new(Box::pin(sink), Box::pin(stream)))
    }
}

fn to_ws_message(frame: Frame) -> WsMessage {
    match frame {
        Frame::Text(text) => WsMessage::Text(text.into()),
        Frame::Binary(data) => WsMessage::Binary(data.into()),
        Frame::Close(reason) => WsMessage::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: reason.unwrap_or_default().into(),
        })),
    }
}
