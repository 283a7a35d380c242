//! Frame transport: the seam between the session runtime and a socket.
//!
//! ARCHITECTURE
//! ============
//! A [`Connector`] opens one connection and hands back a [`Link`]: a frame
//! sink and a frame stream. The runtime never sees WebSocket messages, only
//! decoded [`Frame`]s, so tests can drive it over in-memory channels.
//! [`WsConnector`] speaks binary WebSocket messages carrying protobuf frames.

use std::pin::Pin;

use async_trait::async_trait;
use frames::{CodecError, Frame};
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),
    #[error("frame decode failed: {0}")]
    Codec(#[from] CodecError),
    #[error("connection closed")]
    Closed,
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(error))
    }
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

/// One open connection.
pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a fresh connection.
    async fn connect(&self) -> Result<Link, TransportError>;
}

/// WebSocket connector for the realtime server.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Link, TransportError> {
        let (ws, _) = connect_async(self.url.as_str()).await?;
        let (write, read) = ws.split();

        let sink = write
            .sink_map_err(TransportError::from)
            .with(|frame: Frame| future::ready(Ok::<_, TransportError>(Message::Binary(frames::encode_frame(&frame).into()))));

        let stream = read.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Binary(bytes)) => Some(frames::decode_frame(&bytes).map_err(TransportError::from)),
                Ok(Message::Close(_)) => Some(Err(TransportError::Closed)),
                Ok(_) => None,
                Err(error) => Some(Err(TransportError::from(error))),
            })
        });

        Ok(Link { sink: Box::pin(sink), stream: Box::pin(stream) })
    }
}
