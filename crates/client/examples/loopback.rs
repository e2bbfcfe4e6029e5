//! Runs the client against an in-process loopback transport.
//!
//! HTTP requests are answered with a description of what was received, and WebSocket sessions
//! echo every data frame back until the client closes.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use micro_client::error::TransportError;
use micro_client::response::handlers;
use micro_client::transport::{Frame, Handshake, Transport, TransportResponse, WsConnection, full_body};
use micro_client::{Client, ClientError, Listener, Request, WebSocket};
use tokio::time::Instant;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

struct Loopback;

#[async_trait]
impl Transport for Loopback {
    async fn execute(&self, request: &Request, _deadline: Option<Instant>) -> Result<TransportResponse, TransportError> {
        let body = request.body().map(|body| body.to_bytes()).unwrap_or_default();
        let description = format!("{} {} ({} bytes)", request.method(), request.uri().path(), body.len());

        http::Response::builder()
            .status(200)
            .header("content-type", "text/plain; charset=utf-8")
            .body(full_body(description))
            .map_err(TransportError::protocol)
    }

    async fn open_websocket(&self, _handshake: &Handshake) -> Result<WsConnection, TransportError> {
        let (to_client, frames) = mpsc::unbounded::<Result<Frame, TransportError>>();
        let (sink, mut from_client) = mpsc::unbounded::<Frame>();

        tokio::spawn(async move {
            while let Some(frame) = from_client.next().await {
                let reply = match frame {
                    Frame::Close { code, .. } => Frame::close(code, ""),
                    Frame::Ping(data) => Frame::Pong(data),
                    other => other,
                };
                let closing = matches!(reply, Frame::Close { .. });
                if to_client.unbounded_send(Ok(reply)).is_err() || closing {
                    break;
                }
            }
        });

        Ok(WsConnection::new(sink.sink_map_err(TransportError::protocol), frames))
    }
}

struct Printer;

#[async_trait]
impl Listener for Printer {
    async fn on_open(&self, ws: &WebSocket) {
        info!(uri = %ws.uri(), "opened");
        if let Err(e) = ws.send_text("hello", true).await {
            error!(cause = %e, "send failed");
        }
    }

    async fn on_text(&self, ws: &WebSocket, data: String, _last: bool) {
        info!(data = %data, "text received");
        if let Err(e) = ws.send_close(1000, "done").await {
            error!(cause = %e, "close failed");
        }
    }

    async fn on_binary(&self, _ws: &WebSocket, data: Bytes, _last: bool) {
        info!(len = data.len(), "binary received");
    }

    async fn on_close(&self, _ws: &WebSocket, code: u16, reason: String) {
        info!(code, reason = %reason, "closed");
    }

    async fn on_error(&self, _ws: &WebSocket, error: ClientError) {
        error!(cause = %error, "session failed");
    }
}

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::DEBUG).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let client = Client::new(Loopback);

    let todo = Request::builder_with("https://jsonplaceholder.typicode.com/todos/1").get().build().unwrap();
    let post = Request::builder_with("https://jsonplaceholder.typicode.com/posts")
        .post()
        .headers(&["Content-Type", "application/json", "Accept", "application/json"])
        .body(r#"{"title":"foo","body":"bar","userId":1}"#)
        .build()
        .unwrap();

    let first = client.send_async(&todo, handlers::string()).then_apply(|response| response.into_body());
    let second = client.send_async(&post, handlers::string()).then_apply(|response| response.into_body());
    match first.then_combine(&second, |a, b| format!("{a} : {b}")).await {
        Ok(combined) => info!(combined = %combined, "both requests finished"),
        Err(e) => error!(cause = %e, "request failed"),
    }

    let opening = client.new_websocket_builder().build_async("wss://echo.example.com/", Arc::new(Printer));
    let ws = match opening {
        Ok(promise) => promise.await,
        Err(e) => Err(e),
    };
    match ws {
        Ok(ws) => {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            info!(state = ?ws.state(), "session finished");
        }
        Err(e) => error!(cause = %e, "websocket failed"),
    }
}
