//! The dispatch engine.
//!
//! [`Client`] ties a [`Transport`] to a [`WorkerPool`]. [`Client::send_async`] submits a request
//! to the pool and hands back a [`Promise`]; [`Client::send`] is the same path followed by a
//! blocking wait. Both go through one private exchange routine, so blocking and asynchronous
//! dispatch report identical results and errors.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderName, HeaderValue};
use tokio::time::{self, Instant};
use tracing::{debug, error};

use crate::error::{ClientBuildError, ClientError};
use crate::future::{Promise, WorkerPool};
use crate::headers::HeaderStore;
use crate::request::{Request, is_restricted};
use crate::response::{BodyHandler, Response, ResponseInfo};
use crate::transport::Transport;
use crate::utils::ensure;
use crate::websocket::{WebSocketBuilder, is_websocket_owned};

/// Entry point for sending requests and opening WebSocket sessions.
///
/// Cheap to clone; clones share the transport, the default headers and the worker pool.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    pool: WorkerPool,
    default_headers: HeaderStore,
    connect_timeout: Option<Duration>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// A client over `transport` running on the shared worker pool.
    pub fn new<T: Transport>(transport: T) -> Client {
        Client {
            inner: Arc::new(ClientInner {
                transport: Arc::new(transport),
                pool: WorkerPool::shared(),
                default_headers: HeaderStore::new(),
                connect_timeout: None,
            }),
        }
    }

    /// Sends `request` and blocks the calling thread until the response is available.
    ///
    /// Must not be called from inside an async runtime; use [`Client::send_async`] there.
    pub fn send<H>(&self, request: &Request, handler: H) -> Result<Response<H::Output>, ClientError>
    where
        H: BodyHandler,
        H::Output: Clone,
    {
        self.send_async(request, handler).wait()
    }

    /// Submits `request` to the worker pool and returns immediately.
    ///
    /// The promise fails with [`ClientError::ConnectionFailed`], [`ClientError::Timeout`],
    /// [`ClientError::DecodeFailed`], or [`ClientError::Cancelled`] once cancelled.
    pub fn send_async<H>(&self, request: &Request, handler: H) -> Promise<Response<H::Output>>
    where
        H: BodyHandler,
    {
        let inner = Arc::clone(&self.inner);
        let request = request.clone();
        self.inner.pool.spawn(async move { inner.execute(request, handler).await })
    }

    pub fn new_websocket_builder(&self) -> WebSocketBuilder {
        WebSocketBuilder::new(self.clone())
    }

    pub fn worker_pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    pub fn default_headers(&self) -> &HeaderStore {
        &self.inner.default_headers
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub(crate) fn connect_timeout(&self) -> Option<Duration> {
        self.inner.connect_timeout
    }
}

impl ClientInner {
    async fn execute<H>(&self, request: Request, handler: H) -> Result<Response<H::Output>, ClientError>
    where
        H: BodyHandler,
    {
        let request = if self.default_headers.is_empty() {
            request
        } else {
            request.with_headers(self.default_headers.merge(request.headers()))
        };
        let deadline = request.timeout().map(|timeout| Instant::now() + timeout);

        debug!(method = %request.method(), uri = %request.uri(), "dispatching request");

        let exchange = self.exchange(&request, deadline, &handler);
        let result = match deadline {
            Some(deadline) => time::timeout_at(deadline, exchange).await.unwrap_or_else(|_elapsed| Err(ClientError::Timeout)),
            None => exchange.await,
        };

        match &result {
            Ok(response) => debug!(uri = %request.uri(), status = %response.status(), "request completed"),
            Err(e) => error!(uri = %request.uri(), cause = %e, "request failed"),
        }
        result
    }

    async fn exchange<H>(&self, request: &Request, deadline: Option<Instant>, handler: &H) -> Result<Response<H::Output>, ClientError>
    where
        H: BodyHandler,
    {
        let response = self.transport.execute(request, deadline).await?;
        let (head, body) = response.into_parts();

        let status = head.status.as_u16();
        ensure!((100..=599).contains(&status), ClientError::decode_failed(format!("status code out of range: {status}")));

        let info = ResponseInfo::new(head.status, HeaderStore::from(head.headers));
        let body = handler.handle(&info, body).await?;
        Ok(Response::new(info, request.uri().clone(), body))
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("pool", &self.inner.pool)
            .field("default_headers", &self.inner.default_headers)
            .field("connect_timeout", &self.inner.connect_timeout)
            .finish_non_exhaustive()
    }
}

/// Configures a [`Client`].
#[derive(Default)]
pub struct ClientBuilder {
    transport: Option<Arc<dyn Transport>>,
    pool: Option<WorkerPool>,
    default_headers: HeaderStore,
    connect_timeout: Option<Duration>,
}

impl ClientBuilder {
    fn new() -> Self {
        Self::default()
    }

    pub fn transport<T: Transport>(mut self, transport: T) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn shared_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Runs dispatches on `pool` instead of the shared pool.
    pub fn worker_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Headers sent with every request and handshake, ahead of their own headers.
    ///
    /// Transport-owned names such as `Host` or `Sec-WebSocket-*` make [`ClientBuilder::build`]
    /// fail with [`ClientBuildError::RestrictedHeader`].
    pub fn default_headers(mut self, headers: HeaderStore) -> Self {
        self.default_headers = headers;
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.add(name, value);
        self
    }

    /// Handshake deadline for WebSocket sessions opened through this client.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<Client, ClientBuildError> {
        let transport = self.transport.ok_or(ClientBuildError::MissingTransport)?;
        let restricted = self.default_headers.names().into_iter().find(|name| is_restricted(name) || is_websocket_owned(name));
        if let Some(name) = restricted {
            return Err(ClientBuildError::RestrictedHeader { name: name.to_string() });
        }
        let pool = self.pool.unwrap_or_else(WorkerPool::shared);

        Ok(Client {
            inner: Arc::new(ClientInner {
                transport,
                pool,
                default_headers: self.default_headers,
                connect_timeout: self.connect_timeout,
            }),
        })
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("has_transport", &self.transport.is_some())
            .field("pool", &self.pool)
            .field("default_headers", &self.default_headers)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}
