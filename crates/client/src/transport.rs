//! The port through which the client core reaches the network.
//!
//! Socket handling, DNS, TLS, connection pooling and every wire codec (HTTP/1.1, HTTP/2,
//! WebSocket framing) live behind [`Transport`]. The core hands it immutable [`Request`]s and
//! [`Handshake`]s and receives `http` responses with streaming bodies, or a [`WsConnection`]
//! made of an outbound frame sink and an inbound frame stream.

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Sink, Stream, TryStreamExt};
use http::Uri;
use http_body::Frame as BodyFrame;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use tokio::time::Instant;

use crate::error::TransportError;
use crate::headers::HeaderStore;
use crate::request::Request;

/// Streaming response body produced by a transport.
pub type TransportBody = BoxBody<Bytes, TransportError>;

/// Response head plus streaming body, as returned by [`Transport::execute`].
pub type TransportResponse = http::Response<TransportBody>;

/// Outbound half of a WebSocket connection.
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;

/// Inbound half of a WebSocket connection, yielding frames in arrival order.
pub type FrameStream = BoxStream<'static, Result<Frame, TransportError>>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Performs one request/response exchange.
    ///
    /// `deadline` is the caller's deadline, if any. The dispatcher enforces it as well, so
    /// honouring it here only serves to release resources earlier.
    async fn execute(&self, request: &Request, deadline: Option<Instant>) -> Result<TransportResponse, TransportError>;

    /// Performs the opening handshake and returns the established connection.
    async fn open_websocket(&self, handshake: &Handshake) -> Result<WsConnection, TransportError>;
}

/// A decoded WebSocket frame.
///
/// Data frames carry a `last` flag; a message split into several frames is delivered as a
/// sequence of frames where only the final one has `last == true`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text { data: String, last: bool },
    Binary { data: Bytes, last: bool },
    Ping(Bytes),
    Pong(Bytes),
    Close { code: u16, reason: String },
}

impl Frame {
    pub fn text(data: impl Into<String>) -> Self {
        Frame::Text { data: data.into(), last: true }
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Frame::Binary { data: data.into(), last: true }
    }

    pub fn close(code: u16, reason: impl Into<String>) -> Self {
        Frame::Close { code, reason: reason.into() }
    }

    /// Returns true for ping, pong and close frames
    #[inline]
    pub fn is_control(&self) -> bool {
        matches!(self, Frame::Ping(_) | Frame::Pong(_) | Frame::Close { .. })
    }
}

/// Everything a transport needs to open a WebSocket connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Handshake {
    uri: Uri,
    headers: HeaderStore,
    subprotocols: Vec<String>,
}

impl Handshake {
    pub(crate) fn new(uri: Uri, headers: HeaderStore, subprotocols: Vec<String>) -> Self {
        Self { uri, headers, subprotocols }
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Extra headers for the upgrade request.
    pub fn headers(&self) -> &HeaderStore {
        &self.headers
    }

    /// Subprotocols offered to the server, most preferred first.
    pub fn subprotocols(&self) -> &[String] {
        &self.subprotocols
    }
}

/// An established WebSocket connection handed over by the transport.
pub struct WsConnection {
    subprotocol: Option<String>,
    sink: FrameSink,
    frames: FrameStream,
}

impl WsConnection {
    pub fn new<S, F>(sink: S, frames: F) -> Self
    where
        S: Sink<Frame, Error = TransportError> + Send + 'static,
        F: Stream<Item = Result<Frame, TransportError>> + Send + 'static,
    {
        Self { subprotocol: None, sink: Box::pin(sink), frames: Box::pin(frames) }
    }

    /// Records the subprotocol the server selected.
    #[must_use]
    pub fn with_subprotocol(mut self, subprotocol: impl Into<String>) -> Self {
        self.subprotocol = Some(subprotocol.into());
        self
    }

    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    pub(crate) fn into_parts(self) -> (Option<String>, FrameSink, FrameStream) {
        (self.subprotocol, self.sink, self.frames)
    }
}

impl fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsConnection").field("subprotocol", &self.subprotocol).finish_non_exhaustive()
    }
}

/// A body that yields `bytes` in a single frame.
pub fn full_body(bytes: impl Into<Bytes>) -> TransportBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> TransportBody {
    Empty::new().map_err(|never| match never {}).boxed()
}

/// A body that yields every chunk of `stream` in order.
pub fn stream_body<S>(stream: S) -> TransportBody
where
    S: Stream<Item = Result<Bytes, TransportError>> + Send + Sync + 'static,
{
    StreamBody::new(stream.map_ok(BodyFrame::data)).boxed()
}
