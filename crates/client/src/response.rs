//! Immutable responses and the handlers that decide how a body is materialised.
//!
//! A [`BodyHandler`] turns the transport's streaming body into the `T` of a [`Response<T>`]:
//! eagerly ([`handlers::string`], [`handlers::bytes`], [`handlers::json`],
//! [`handlers::discarding`]) or lazily ([`handlers::lazy`], which hands back a [`LazyBody`]
//! the caller drains later).

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{StatusCode, Uri};
use http_body_util::BodyExt;
use mime::Mime;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use crate::error::ClientError;
use crate::headers::HeaderStore;
use crate::transport::TransportBody;

/// Result of a completed HTTP exchange.
#[derive(Debug, Clone)]
pub struct Response<T> {
    status: StatusCode,
    headers: HeaderStore,
    uri: Uri,
    body: T,
}

impl<T> Response<T> {
    pub(crate) fn new(head: ResponseInfo, uri: Uri, body: T) -> Self {
        Self { status: head.status, headers: head.headers, uri, body }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderStore {
        &self.headers
    }

    /// The URI the request was sent to.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn body(&self) -> &T {
        &self.body
    }

    pub fn into_body(self) -> T {
        self.body
    }

    pub fn map<U, F>(self, f: F) -> Response<U>
    where
        F: FnOnce(T) -> U,
    {
        Response { status: self.status, headers: self.headers, uri: self.uri, body: f(self.body) }
    }
}

/// Status and headers of a response, available to handlers before the body is read.
#[derive(Debug, Clone)]
pub struct ResponseInfo {
    status: StatusCode,
    headers: HeaderStore,
}

impl ResponseInfo {
    pub fn new(status: StatusCode, headers: HeaderStore) -> Self {
        Self { status, headers }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderStore {
        &self.headers
    }

    fn content_type(&self) -> Option<Mime> {
        self.headers.first(CONTENT_TYPE).and_then(|value| value.to_str().ok()).and_then(|value| value.parse().ok())
    }
}

/// Converts a streaming response body into the value exposed as `Response::body`.
#[async_trait]
pub trait BodyHandler: Send + Sync + 'static {
    type Output: Send + Sync + 'static;

    async fn handle(&self, info: &ResponseInfo, body: TransportBody) -> Result<Self::Output, ClientError>;
}

pub mod handlers {
    //! Stock [`BodyHandler`](super::BodyHandler) implementations.

    use super::{BodyHandler, ClientError, DeserializeOwned, LazyBody, PhantomData, ResponseInfo, TransportBody, async_trait};
    use super::{collect, decode_json, decode_text};
    use bytes::Bytes;
    use http_body_util::BodyExt;

    /// Decodes the body as text. Only UTF-8 (and its US-ASCII subset) is accepted.
    pub fn string() -> StringHandler {
        StringHandler
    }

    pub fn bytes() -> BytesHandler {
        BytesHandler
    }

    /// Deserializes the body as JSON into `T`.
    pub fn json<T>() -> JsonHandler<T> {
        JsonHandler { _marker: PhantomData }
    }

    /// Drains and drops the body.
    pub fn discarding() -> DiscardingHandler {
        DiscardingHandler
    }

    /// Leaves the body unread behind a [`LazyBody`] handle.
    pub fn lazy() -> LazyHandler {
        LazyHandler
    }

    #[derive(Debug, Clone, Copy)]
    pub struct StringHandler;

    #[async_trait]
    impl BodyHandler for StringHandler {
        type Output = String;

        async fn handle(&self, info: &ResponseInfo, body: TransportBody) -> Result<String, ClientError> {
            let bytes = collect(body).await?;
            decode_text(info.content_type().as_ref(), bytes)
        }
    }

    #[derive(Debug, Clone, Copy)]
    pub struct BytesHandler;

    #[async_trait]
    impl BodyHandler for BytesHandler {
        type Output = Bytes;

        async fn handle(&self, _info: &ResponseInfo, body: TransportBody) -> Result<Bytes, ClientError> {
            collect(body).await
        }
    }

    pub struct JsonHandler<T> {
        _marker: PhantomData<fn() -> T>,
    }

    impl<T> std::fmt::Debug for JsonHandler<T> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("JsonHandler").field("target", &std::any::type_name::<T>()).finish()
        }
    }

    #[async_trait]
    impl<T> BodyHandler for JsonHandler<T>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        type Output = T;

        async fn handle(&self, _info: &ResponseInfo, body: TransportBody) -> Result<T, ClientError> {
            decode_json(&collect(body).await?)
        }
    }

    #[derive(Debug, Clone, Copy)]
    pub struct DiscardingHandler;

    #[async_trait]
    impl BodyHandler for DiscardingHandler {
        type Output = ();

        async fn handle(&self, _info: &ResponseInfo, mut body: TransportBody) -> Result<(), ClientError> {
            while let Some(frame) = body.frame().await {
                frame?;
            }
            Ok(())
        }
    }

    #[derive(Debug, Clone, Copy)]
    pub struct LazyHandler;

    #[async_trait]
    impl BodyHandler for LazyHandler {
        type Output = LazyBody;

        async fn handle(&self, info: &ResponseInfo, body: TransportBody) -> Result<LazyBody, ClientError> {
            Ok(LazyBody::new(body, info.content_type()))
        }
    }
}

/// A response body that has not been read yet.
///
/// Clones share the same underlying stream, which can be consumed exactly once; later attempts
/// fail with [`ClientError::DecodeFailed`].
#[derive(Clone)]
pub struct LazyBody {
    inner: Arc<Mutex<Option<TransportBody>>>,
    content_type: Option<Mime>,
}

impl LazyBody {
    fn new(body: TransportBody, content_type: Option<Mime>) -> Self {
        Self { inner: Arc::new(Mutex::new(Some(body))), content_type }
    }

    pub async fn can_consume(&self) -> bool {
        let guard = self.inner.lock().await;
        guard.is_some()
    }

    pub async fn bytes(&self) -> Result<Bytes, ClientError> {
        let body = self.take().await?;
        collect(body).await
    }

    pub async fn text(&self) -> Result<String, ClientError> {
        let bytes = self.bytes().await?;
        decode_text(self.content_type.as_ref(), bytes)
    }

    pub async fn json<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        decode_json(&self.bytes().await?)
    }

    /// Hands the raw body to `f`, for callers that stream it themselves.
    pub async fn apply<T, F, Fut>(&self, f: F) -> Result<T, ClientError>
    where
        F: FnOnce(TransportBody) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let body = self.take().await?;
        f(body).await
    }

    async fn take(&self) -> Result<TransportBody, ClientError> {
        let mut guard = self.inner.lock().await;
        guard.take().ok_or_else(|| ClientError::decode_failed("body has been consumed"))
    }
}

impl fmt::Debug for LazyBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyBody").field("content_type", &self.content_type).finish_non_exhaustive()
    }
}

async fn collect(body: TransportBody) -> Result<Bytes, ClientError> {
    Ok(body.collect().await?.to_bytes())
}

fn decode_text(content_type: Option<&Mime>, bytes: Bytes) -> Result<String, ClientError> {
    if let Some(charset) = content_type.and_then(|mime| mime.get_param(mime::CHARSET)) {
        let supported = charset == mime::UTF_8 || charset.as_str().eq_ignore_ascii_case("us-ascii");
        if !supported {
            return Err(ClientError::decode_failed(format!("unsupported charset: {charset}")));
        }
    }
    String::from_utf8(bytes.into()).map_err(|e| ClientError::decode_failed(format!("body is not valid utf-8: {e}")))
}

fn decode_json<T: DeserializeOwned>(bytes: &Bytes) -> Result<T, ClientError> {
    serde_json::from_slice(bytes).map_err(|e| ClientError::decode_failed(format!("invalid json body: {e}")))
}
