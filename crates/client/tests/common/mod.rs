//! Shared utilities for the integration tests: an in-memory transport and a recording listener.

#![allow(dead_code, reason = "each test binary uses a different subset of these helpers")]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::SinkExt;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use micro_client::error::{ClientError, TransportError};
use micro_client::transport::{Frame, Handshake, Transport, TransportResponse, WsConnection, full_body};
use micro_client::{Listener, Request, WebSocket};
use tokio::sync::Notify;
use tokio::time::{self, Instant};

/// Installs a test subscriber once per binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().with_max_level(tracing::Level::DEBUG).try_init();
}

#[derive(Debug, Clone)]
struct Route {
    status: u16,
    content_type: &'static str,
    body: String,
    delay: Duration,
}

/// Answers requests by path from a script and hands out prepared WebSocket connections.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<String, Route>>,
    requests: Mutex<Vec<Request>>,
    sockets: Mutex<VecDeque<Result<WsConnection, TransportError>>>,
    handshakes: Mutex<Vec<Handshake>>,
    executed: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn route(&self, path: &str, status: u16, body: &str) {
        self.route_delayed(path, status, body, Duration::ZERO);
    }

    pub fn route_delayed(&self, path: &str, status: u16, body: &str, delay: Duration) {
        let route = Route { status, content_type: "text/plain; charset=utf-8", body: body.to_string(), delay };
        self.routes.lock().unwrap().insert(path.to_string(), route);
    }

    pub fn push_socket(&self, connection: WsConnection) {
        self.sockets.lock().unwrap().push_back(Ok(connection));
    }

    pub fn push_handshake_failure(&self, error: TransportError) {
        self.sockets.lock().unwrap().push_back(Err(error));
    }

    /// Requests as they reached the transport, in arrival order.
    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn handshakes(&self) -> Vec<Handshake> {
        self.handshakes.lock().unwrap().clone()
    }

    /// Exchanges that ran to completion.
    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, request: &Request, _deadline: Option<Instant>) -> Result<TransportResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        let route = self.routes.lock().unwrap().get(request.uri().path()).cloned();

        let Some(route) = route else {
            return Ok(http::Response::builder().status(404).body(full_body("")).unwrap());
        };
        if !route.delay.is_zero() {
            time::sleep(route.delay).await;
        }
        self.executed.fetch_add(1, Ordering::SeqCst);

        let response = http::Response::builder()
            .status(route.status)
            .header("content-type", route.content_type)
            .body(full_body(route.body))
            .map_err(TransportError::protocol)?;
        Ok(response)
    }

    async fn open_websocket(&self, handshake: &Handshake) -> Result<WsConnection, TransportError> {
        self.handshakes.lock().unwrap().push(handshake.clone());
        self.sockets.lock().unwrap().pop_front().unwrap_or_else(|| Err(TransportError::handshake("no scripted connection")))
    }
}

/// The far end of an in-memory WebSocket connection.
pub struct Peer {
    inbound: Option<UnboundedSender<Result<Frame, TransportError>>>,
    outbound: UnboundedReceiver<Frame>,
}

impl Peer {
    /// Delivers `frame` to the client. Returns false once the client stopped reading.
    pub fn send(&self, frame: Frame) -> bool {
        self.inbound.as_ref().is_some_and(|inbound| inbound.unbounded_send(Ok(frame)).is_ok())
    }

    pub fn fail(&self, error: TransportError) -> bool {
        self.inbound.as_ref().is_some_and(|inbound| inbound.unbounded_send(Err(error)).is_ok())
    }

    /// Ends the inbound stream without a close frame.
    pub fn hang_up(&mut self) {
        self.inbound = None;
    }

    /// Next frame the client sent, if one arrives in time.
    pub async fn next_sent(&mut self, wait: Duration) -> Option<Frame> {
        use futures::StreamExt;
        time::timeout(wait, self.outbound.next()).await.ok().flatten()
    }
}

pub fn socket_pair() -> (WsConnection, Peer) {
    let (inbound, frames) = mpsc::unbounded();
    let (sink, outbound) = mpsc::unbounded::<Frame>();
    let sink = sink.sink_map_err(TransportError::protocol);

    (WsConnection::new(sink, frames), Peer { inbound: Some(inbound), outbound })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Open,
    Text(String, bool),
    Binary(Bytes, bool),
    Ping(Bytes),
    Pong(Bytes),
    Close(u16, String),
    Error(String),
}

impl Event {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Close(..) | Event::Error(_))
    }
}

/// Listener that records every callback and flags overlapping invocations.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
    notify: Notify,
    busy: AtomicBool,
    overlapped: AtomicBool,
    jitter: bool,
    stall: Option<Duration>,
    greeting: Option<&'static str>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sleeps a varying few milliseconds inside every data callback.
    pub fn with_jitter() -> Arc<Self> {
        Arc::new(Self { jitter: true, ..Self::default() })
    }

    /// Sleeps `stall` inside every data callback.
    pub fn stalling(stall: Duration) -> Arc<Self> {
        Arc::new(Self { stall: Some(stall), ..Self::default() })
    }

    /// Sends `greeting` from inside `on_open`.
    pub fn greeting(text: &'static str) -> Arc<Self> {
        Arc::new(Self { greeting: Some(text), ..Self::default() })
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    /// Waits until at least `count` events were recorded.
    pub async fn wait_for(&self, count: usize) -> Vec<Event> {
        let waiting = async {
            loop {
                let events = self.events();
                if events.len() >= count {
                    return events;
                }
                self.notify.notified().await;
            }
        };
        time::timeout(Duration::from_secs(5), waiting).await.expect("listener events did not arrive in time")
    }

    async fn record(&self, event: Event, delay: Duration) {
        if self.busy.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        if !delay.is_zero() {
            time::sleep(delay).await;
        }
        self.events.lock().unwrap().push(event);
        self.busy.store(false, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn delay_for(&self) -> Duration {
        if let Some(stall) = self.stall {
            return stall;
        }
        if !self.jitter {
            return Duration::ZERO;
        }
        let seen = self.events.lock().unwrap().len() as u64;
        Duration::from_millis(seen * 7 % 5)
    }
}

#[async_trait]
impl Listener for Recorder {
    async fn on_open(&self, ws: &WebSocket) {
        if let Some(greeting) = self.greeting {
            ws.send_text(greeting, true).await.unwrap();
        }
        self.record(Event::Open, Duration::ZERO).await;
    }

    async fn on_text(&self, _ws: &WebSocket, data: String, last: bool) {
        self.record(Event::Text(data, last), self.delay_for()).await;
    }

    async fn on_binary(&self, _ws: &WebSocket, data: Bytes, last: bool) {
        self.record(Event::Binary(data, last), self.delay_for()).await;
    }

    async fn on_ping(&self, _ws: &WebSocket, data: Bytes) {
        self.record(Event::Ping(data), Duration::ZERO).await;
    }

    async fn on_pong(&self, _ws: &WebSocket, data: Bytes) {
        self.record(Event::Pong(data), Duration::ZERO).await;
    }

    async fn on_close(&self, _ws: &WebSocket, code: u16, reason: String) {
        self.record(Event::Close(code, reason), Duration::ZERO).await;
    }

    async fn on_error(&self, _ws: &WebSocket, error: ClientError) {
        self.record(Event::Error(error.to_string()), Duration::ZERO).await;
    }
}
