//! WebSocket sessions.
//!
//! A session moves through [`SessionState`] `Connecting -> Open -> Closing -> Closed` and never
//! goes back. Once the handshake succeeds a single receive loop per connection drives the
//! caller's [`Listener`]: `on_open` first, then one callback per inbound frame in arrival order,
//! awaiting each callback before reading the next frame. The loop ends with exactly one
//! terminal callback, `on_close` or `on_error`, and then drops its reference to the listener.
//!
//! Outbound frames go through the [`WebSocket`] handle, which may be used from any thread and
//! from inside listener callbacks.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use http::{HeaderName, Uri};
use once_cell::sync::OnceCell;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::Client;
use crate::error::ClientError;
use crate::future::Promise;
use crate::headers::{HeaderStore, parse_value};
use crate::request::{parse_unrestricted, validate_target};
use crate::transport::{FrameSink, FrameStream, Frame, Handshake, Transport};
use crate::utils::ensure;

/// Largest payload of a ping or pong frame.
const MAX_CONTROL_PAYLOAD: usize = 125;

/// Largest close reason, leaving room for the two byte status code.
const MAX_CLOSE_REASON: usize = 123;

/// Reported by `on_close` when the connection ended without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

pub const NORMAL_CLOSURE: u16 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Receives the events of one session.
///
/// Callbacks for a session are never run concurrently with each other, and the next inbound
/// frame is not read until the previous callback has returned. Every method defaults to doing
/// nothing.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    async fn on_open(&self, _ws: &WebSocket) {}

    async fn on_text(&self, _ws: &WebSocket, _data: String, _last: bool) {}

    async fn on_binary(&self, _ws: &WebSocket, _data: Bytes, _last: bool) {}

    /// Called after the matching pong has been sent.
    async fn on_ping(&self, _ws: &WebSocket, _data: Bytes) {}

    async fn on_pong(&self, _ws: &WebSocket, _data: Bytes) {}

    async fn on_close(&self, _ws: &WebSocket, _code: u16, _reason: String) {}

    async fn on_error(&self, _ws: &WebSocket, _error: ClientError) {}
}

/// Handle to a WebSocket session. Clones refer to the same session.
#[derive(Clone)]
pub struct WebSocket {
    inner: Arc<Session>,
}

struct Session {
    uri: Uri,
    subprotocol: OnceCell<String>,
    state: Mutex<SessionState>,
    output: tokio::sync::Mutex<Output>,
    output_closed: AtomicBool,
    input_closed: AtomicBool,
    terminated: AtomicBool,
    failure: Mutex<Option<ClientError>>,
    shutdown: CancellationToken,
}

struct Output {
    sink: Option<FrameSink>,
    fragment: Option<MessageKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageKind {
    Text,
    Binary,
}

impl WebSocket {
    fn connecting(uri: Uri) -> Self {
        WebSocket {
            inner: Arc::new(Session {
                uri,
                subprotocol: OnceCell::new(),
                state: Mutex::new(SessionState::Connecting),
                output: tokio::sync::Mutex::new(Output { sink: None, fragment: None }),
                output_closed: AtomicBool::new(false),
                input_closed: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
                failure: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    /// The subprotocol selected by the server, if any.
    pub fn subprotocol(&self) -> Option<&str> {
        self.inner.subprotocol.get().map(String::as_str)
    }

    pub fn state(&self) -> SessionState {
        *self.lock_state()
    }

    pub fn is_output_closed(&self) -> bool {
        self.inner.output_closed.load(Ordering::Acquire)
    }

    pub fn is_input_closed(&self) -> bool {
        self.inner.input_closed.load(Ordering::Acquire)
    }

    /// Sends a text frame. `last == false` starts or continues a fragmented message, which
    /// must be finished before a binary message can be sent.
    pub async fn send_text(&self, data: impl Into<String>, last: bool) -> Result<(), ClientError> {
        self.send_frame(Frame::Text { data: data.into(), last }, Some((MessageKind::Text, last))).await
    }

    pub async fn send_binary(&self, data: impl Into<Bytes>, last: bool) -> Result<(), ClientError> {
        self.send_frame(Frame::Binary { data: data.into(), last }, Some((MessageKind::Binary, last))).await
    }

    pub async fn ping(&self, data: impl Into<Bytes>) -> Result<(), ClientError> {
        let data = data.into();
        check_control_payload(&data)?;
        self.send_frame(Frame::Ping(data), None).await
    }

    /// Sends an unsolicited pong. Pings from the peer are answered automatically.
    pub async fn pong(&self, data: impl Into<Bytes>) -> Result<(), ClientError> {
        let data = data.into();
        check_control_payload(&data)?;
        self.send_frame(Frame::Pong(data), None).await
    }

    /// Starts the closing handshake and closes the output.
    ///
    /// Inbound frames keep arriving until the peer answers with its own close frame, which is
    /// reported through `on_close`.
    pub async fn send_close(&self, code: u16, reason: &str) -> Result<(), ClientError> {
        ensure!(is_valid_close_code(code), ClientError::malformed_input(format!("invalid close code: {code}")));
        ensure!(
            reason.len() <= MAX_CLOSE_REASON,
            ClientError::malformed_input(format!("close reason is {} bytes, at most {MAX_CLOSE_REASON} allowed", reason.len()))
        );

        self.send_frame(Frame::close(code, reason), None).await?;
        self.advance(SessionState::Closing);
        debug!(uri = %self.inner.uri, code, "close frame sent");
        Ok(())
    }

    /// Closes the session at once. No further listener callbacks are made.
    pub fn abort(&self) {
        self.inner.terminated.store(true, Ordering::Release);
        self.inner.output_closed.store(true, Ordering::Release);
        self.inner.input_closed.store(true, Ordering::Release);
        self.advance(SessionState::Closed);
        self.inner.shutdown.cancel();
        info!(uri = %self.inner.uri, "websocket aborted");
    }

    async fn send_frame(&self, frame: Frame, data: Option<(MessageKind, bool)>) -> Result<(), ClientError> {
        let mut output = self.inner.output.lock().await;
        match self.state() {
            SessionState::Connecting => return Err(ClientError::invalid_state("websocket is not open yet")),
            SessionState::Closed => return Err(ClientError::SessionClosed),
            SessionState::Open | SessionState::Closing => {}
        }
        if self.is_output_closed() {
            return Err(ClientError::SessionClosed);
        }

        if let Some((kind, _)) = data {
            ensure!(
                output.fragment.is_none_or(|current| current == kind),
                ClientError::invalid_state(format!("cannot send {kind:?} data while a fragmented message is unfinished"))
            );
        }

        let is_close = matches!(frame, Frame::Close { .. });
        let Some(sink) = output.sink.as_mut() else {
            return Err(ClientError::SessionClosed);
        };

        match sink.send(frame).await {
            Ok(()) => {
                if let Some((kind, last)) = data {
                    output.fragment = if last { None } else { Some(kind) };
                }
                if is_close {
                    self.close_output(&mut output);
                }
                Ok(())
            }
            Err(e) => {
                self.close_output(&mut output);
                let error = ClientError::from(e);
                self.record_failure(error.clone());
                Err(error)
            }
        }
    }

    fn close_output(&self, output: &mut Output) {
        output.sink = None;
        self.inner.output_closed.store(true, Ordering::Release);
    }

    /// Keeps the first send failure and wakes the receive loop so it reports it.
    fn record_failure(&self, error: ClientError) {
        let mut failure = self.inner.failure.lock().unwrap_or_else(PoisonError::into_inner);
        if failure.is_none() {
            *failure = Some(error);
        }
        drop(failure);
        self.inner.shutdown.cancel();
    }

    fn take_failure(&self) -> Option<ClientError> {
        self.inner.failure.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves the state forward; earlier states are ignored.
    fn advance(&self, next: SessionState) {
        let mut state = self.lock_state();
        if next > *state {
            debug!(uri = %self.inner.uri, from = ?*state, to = ?next, "websocket state changed");
            *state = next;
        }
    }

    /// Claims the single terminal callback. Returns false if it was already claimed.
    fn terminate(&self) -> bool {
        !self.inner.terminated.swap(true, Ordering::AcqRel)
    }

    async fn connect(
        self,
        transport: Arc<dyn Transport>,
        handshake: Handshake,
        connect_timeout: Option<Duration>,
        listener: Arc<dyn Listener>,
    ) -> Result<WebSocket, ClientError> {
        debug!(uri = %handshake.uri(), "opening websocket");

        let opening = transport.open_websocket(&handshake);
        let connected = match connect_timeout {
            Some(timeout) => match time::timeout(timeout, opening).await {
                Ok(connected) => connected.map_err(ClientError::from),
                Err(_elapsed) => Err(ClientError::Timeout),
            },
            None => opening.await.map_err(ClientError::from),
        };

        let connection = match connected {
            Ok(connection) => connection,
            Err(e) => {
                error!(uri = %handshake.uri(), cause = %e, "websocket handshake failed");
                self.fail(listener.as_ref(), e.clone()).await;
                return Err(e);
            }
        };

        let (subprotocol, sink, frames) = connection.into_parts();
        if let Some(subprotocol) = subprotocol {
            let _ = self.inner.subprotocol.set(subprotocol);
        }
        self.inner.output.lock().await.sink = Some(sink);
        self.advance(SessionState::Open);
        info!(uri = %handshake.uri(), subprotocol = ?self.subprotocol(), "websocket open");

        tokio::spawn(receive_loop(self.clone(), listener, frames));
        Ok(self)
    }

    async fn fail(&self, listener: &dyn Listener, error: ClientError) {
        if !self.terminate() {
            warn!(uri = %self.inner.uri, cause = %error, "suppressed error after session terminated");
            return;
        }
        self.inner.output_closed.store(true, Ordering::Release);
        self.inner.input_closed.store(true, Ordering::Release);
        self.advance(SessionState::Closed);
        listener.on_error(self, error).await;
    }

    async fn finish(&self, listener: &dyn Listener, code: u16, reason: String) {
        if !self.terminate() {
            warn!(uri = %self.inner.uri, code, "suppressed close after session terminated");
            return;
        }
        info!(uri = %self.inner.uri, code, reason = %reason, "websocket closed");
        self.inner.input_closed.store(true, Ordering::Release);
        self.advance(SessionState::Closed);
        listener.on_close(self, code, reason).await;
    }

    /// Handles one inbound frame. Returns true when the frame ended the session.
    async fn deliver(&self, listener: &dyn Listener, frame: Frame) -> bool {
        match frame {
            Frame::Text { data, last } => listener.on_text(self, data, last).await,
            Frame::Binary { data, last } => listener.on_binary(self, data, last).await,
            Frame::Ping(data) => {
                if let Err(e) = self.send_frame(Frame::Pong(data.clone()), None).await {
                    debug!(uri = %self.inner.uri, cause = %e, "pong reply not sent");
                }
                listener.on_ping(self, data).await;
            }
            Frame::Pong(data) => listener.on_pong(self, data).await,
            Frame::Close { code, reason } => {
                self.inner.input_closed.store(true, Ordering::Release);
                self.advance(SessionState::Closing);
                if !self.is_output_closed() {
                    let echo = if matches!(code, 1005 | 1006 | 1015) { NORMAL_CLOSURE } else { code };
                    if let Err(e) = self.send_frame(Frame::close(echo, ""), None).await {
                        debug!(uri = %self.inner.uri, cause = %e, "close reply not sent");
                    }
                }
                self.finish(listener, code, reason).await;
                return true;
            }
        }
        false
    }

    async fn release(&self) {
        let mut output = self.inner.output.lock().await;
        self.close_output(&mut output);
        self.inner.input_closed.store(true, Ordering::Release);
        self.advance(SessionState::Closed);
    }
}

async fn receive_loop(ws: WebSocket, listener: Arc<dyn Listener>, mut frames: FrameStream) {
    let shutdown = ws.inner.shutdown.clone();
    listener.on_open(&ws).await;

    loop {
        let next = tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                if let Some(error) = ws.take_failure() {
                    ws.fail(listener.as_ref(), error).await;
                }
                break;
            }
            next = frames.next() => next,
        };

        match next {
            Some(Ok(frame)) => {
                debug!(uri = %ws.inner.uri, control = frame.is_control(), "frame received");
                if ws.deliver(listener.as_ref(), frame).await {
                    break;
                }
            }
            Some(Err(e)) => {
                error!(uri = %ws.inner.uri, cause = %e, "websocket transport failed");
                ws.fail(listener.as_ref(), ClientError::from(e)).await;
                break;
            }
            None => {
                ws.finish(listener.as_ref(), ABNORMAL_CLOSURE, String::new()).await;
                break;
            }
        }
    }

    ws.release().await;
    debug!(uri = %ws.inner.uri, "receive loop finished");
}

fn check_control_payload(data: &Bytes) -> Result<(), ClientError> {
    ensure!(
        data.len() <= MAX_CONTROL_PAYLOAD,
        ClientError::malformed_input(format!("control payload is {} bytes, at most {MAX_CONTROL_PAYLOAD} allowed", data.len()))
    );
    Ok(())
}

fn is_valid_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
}

impl fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocket")
            .field("uri", &self.inner.uri)
            .field("state", &self.state())
            .field("subprotocol", &self.subprotocol())
            .finish_non_exhaustive()
    }
}

/// Configures and opens a [`WebSocket`]; obtained from
/// [`Client::new_websocket_builder`](crate::Client::new_websocket_builder).
#[derive(Debug, Clone)]
pub struct WebSocketBuilder {
    client: Client,
    inner: Result<Parts, ClientError>,
}

#[derive(Debug, Clone, Default)]
struct Parts {
    headers: HeaderStore,
    subprotocols: Vec<String>,
    connect_timeout: Option<Duration>,
}

impl WebSocketBuilder {
    pub(crate) fn new(client: Client) -> Self {
        Self { client, inner: Ok(Parts::default()) }
    }

    /// Adds a header to the opening handshake. Headers the handshake manages itself are
    /// rejected with [`ClientError::MalformedInput`].
    pub fn header(self, name: &str, value: &str) -> Self {
        self.and_then(|mut parts| {
            let name = parse_unrestricted(name)?;
            ensure!(
                !is_websocket_owned(&name),
                ClientError::malformed_input(format!("restricted header name: {name}"))
            );
            parts.headers.add(name, parse_value(value)?);
            Ok(parts)
        })
    }

    /// Offers subprotocols to the server, most preferred first.
    pub fn subprotocols(self, subprotocols: &[&str]) -> Self {
        self.and_then(|mut parts| {
            for subprotocol in subprotocols {
                ensure!(
                    is_token(subprotocol),
                    ClientError::malformed_input(format!("invalid subprotocol: '{subprotocol}'"))
                );
                parts.subprotocols.push((*subprotocol).to_string());
            }
            Ok(parts)
        })
    }

    /// Handshake deadline; overrides the client's connect timeout.
    pub fn connect_timeout(self, timeout: Duration) -> Self {
        self.and_then(move |mut parts| {
            ensure!(!timeout.is_zero(), ClientError::malformed_input("connect timeout must be non-zero"));
            parts.connect_timeout = Some(timeout);
            Ok(parts)
        })
    }

    /// Starts the handshake with `uri` and returns a promise for the open session.
    ///
    /// Builder errors and targets that are not absolute `ws`/`wss` URIs are returned at once.
    /// Handshake failures are delivered to `listener.on_error` and fail the promise with
    /// [`ClientError::ConnectionFailed`] or [`ClientError::Timeout`].
    pub fn build_async<T>(&self, uri: T, listener: Arc<dyn Listener>) -> Result<Promise<WebSocket>, ClientError>
    where
        Uri: TryFrom<T>,
        <Uri as TryFrom<T>>::Error: fmt::Display,
    {
        let parts = self.inner.as_ref().map_err(Clone::clone)?;
        let uri = Uri::try_from(uri).map_err(ClientError::invalid_uri)?;
        validate_target(&uri, &["ws", "wss"])?;

        let headers = self.client.default_headers().merge(&parts.headers);
        let handshake = Handshake::new(uri.clone(), headers, parts.subprotocols.clone());
        let connect_timeout = parts.connect_timeout.or(self.client.connect_timeout());
        let transport = Arc::clone(self.client.transport());

        let ws = WebSocket::connecting(uri);
        Ok(self.client.worker_pool().spawn(ws.connect(transport, handshake, connect_timeout, listener)))
    }

    fn and_then<F>(self, f: F) -> Self
    where
        F: FnOnce(Parts) -> Result<Parts, ClientError>,
    {
        Self { client: self.client, inner: self.inner.and_then(f) }
    }
}

/// Handshake headers the transport computes itself.
pub(crate) fn is_websocket_owned(name: &HeaderName) -> bool {
    name.as_str().starts_with("sec-websocket-")
}

fn is_token(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b))
}
