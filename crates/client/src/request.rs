//! Immutable request values and the staging builder that produces them.
//!
//! A [`RequestBuilder`] accumulates method, target, headers, body and an optional timeout. Each
//! setter records the first error it hits and [`RequestBuilder::build`] surfaces it, the same
//! way `http::request::Builder` works, so call chains stay fluent while construction errors
//! are still reported synchronously. `build` snapshots the staged state: later changes to the
//! builder never leak into a [`Request`] that was already built.

use std::convert::Infallible;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::{HeaderName, Method, Uri};
use http_body::Frame;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};

use crate::error::ClientError;
use crate::headers::{HeaderStore, parse_name, parse_value};
use crate::utils::ensure;

/// Headers owned by the transport; callers may not set them.
const RESTRICTED_HEADERS: [&str; 5] = ["connection", "content-length", "expect", "host", "upgrade"];

/// An outbound HTTP call described as an immutable value.
///
/// Cheap to clone and safe to dispatch any number of times from any thread.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    method: Method,
    uri: Uri,
    headers: HeaderStore,
    body: Option<RequestBody>,
    timeout: Option<Duration>,
}

impl Request {
    pub fn builder() -> RequestBuilder {
        RequestBuilder::new()
    }

    /// Starts a builder that already targets `uri`.
    pub fn builder_with<T>(uri: T) -> RequestBuilder
    where
        Uri: TryFrom<T>,
        <Uri as TryFrom<T>>::Error: Display,
    {
        RequestBuilder::new().uri(uri)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderStore {
        &self.headers
    }

    /// The body, absent for methods that never carry one (GET, HEAD, DELETE, ...).
    pub fn body(&self) -> Option<&RequestBody> {
        self.body.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Converts into an `http::Request` with a freshly produced body, for transports built on
    /// the `http` ecosystem.
    pub fn to_http_request(&self) -> http::Request<BoxBody<Bytes, Infallible>> {
        let body = self.body.as_ref().map_or_else(|| Empty::new().boxed(), RequestBody::to_http_body);
        let mut request = http::Request::new(body);
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = self.uri.clone();
        *request.headers_mut() = self.headers.to_header_map();
        request
    }

    /// Copy of this request carrying `headers` instead of its own.
    pub(crate) fn with_headers(&self, headers: HeaderStore) -> Request {
        Request { headers, ..self.clone() }
    }
}

/// Byte source of a request body.
///
/// Bodies are replayable: [`RequestBody::to_http_body`] yields a new `http_body::Body` on every
/// call so the owning [`Request`] can be dispatched repeatedly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestBody {
    kind: Kind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Kind {
    Empty,
    Once(Bytes),
    Chunks(Arc<[Bytes]>),
}

impl RequestBody {
    pub fn empty() -> Self {
        Self { kind: Kind::Empty }
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self::from_bytes(Bytes::from(value.into()))
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        if bytes.is_empty() { Self::empty() } else { Self { kind: Kind::Once(bytes) } }
    }

    /// A body sent as a sequence of chunks, in order.
    pub fn from_chunks<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Bytes>,
    {
        let chunks: Arc<[Bytes]> = chunks.into_iter().filter(|chunk| !chunk.is_empty()).collect();
        if chunks.is_empty() { Self::empty() } else { Self { kind: Kind::Chunks(chunks) } }
    }

    pub fn content_length(&self) -> u64 {
        match &self.kind {
            Kind::Empty => 0,
            Kind::Once(bytes) => bytes.len() as u64,
            Kind::Chunks(chunks) => chunks.iter().map(|chunk| chunk.len() as u64).sum(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self.kind, Kind::Empty)
    }

    /// The whole body as contiguous bytes.
    pub fn to_bytes(&self) -> Bytes {
        match &self.kind {
            Kind::Empty => Bytes::new(),
            Kind::Once(bytes) => bytes.clone(),
            Kind::Chunks(chunks) => {
                let mut buf = BytesMut::with_capacity(usize::try_from(self.content_length()).unwrap_or_default());
                for chunk in chunks.iter() {
                    buf.extend_from_slice(chunk);
                }
                buf.freeze()
            }
        }
    }

    pub fn to_http_body(&self) -> BoxBody<Bytes, Infallible> {
        match &self.kind {
            Kind::Empty => Empty::new().boxed(),
            Kind::Once(bytes) => Full::new(bytes.clone()).boxed(),
            Kind::Chunks(chunks) => {
                let frames = chunks.iter().cloned().map(|chunk| Ok::<_, Infallible>(Frame::data(chunk))).collect::<Vec<_>>();
                StreamBody::new(futures::stream::iter(frames)).boxed()
            }
        }
    }
}

impl From<String> for RequestBody {
    fn from(value: String) -> Self {
        RequestBody::from_string(value)
    }
}

impl From<&'static str> for RequestBody {
    fn from(value: &'static str) -> Self {
        RequestBody::from_bytes(Bytes::from_static(value.as_bytes()))
    }
}

impl From<Bytes> for RequestBody {
    fn from(value: Bytes) -> Self {
        RequestBody::from_bytes(value)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(value: Vec<u8>) -> Self {
        RequestBody::from_bytes(value)
    }
}

impl From<()> for RequestBody {
    fn from((): ()) -> Self {
        RequestBody::empty()
    }
}

/// Staging object for a [`Request`].
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    inner: Result<Parts, ClientError>,
}

#[derive(Debug, Clone, Default)]
struct Parts {
    method: Option<Method>,
    uri: Option<Uri>,
    headers: HeaderStore,
    body: Option<RequestBody>,
    timeout: Option<Duration>,
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self { inner: Ok(Parts::default()) }
    }

    /// Sets the target. Unparsable input is reported as [`ClientError::InvalidUri`] by `build`.
    pub fn uri<T>(self, uri: T) -> Self
    where
        Uri: TryFrom<T>,
        <Uri as TryFrom<T>>::Error: Display,
    {
        self.and_then(move |mut parts| {
            parts.uri = Some(Uri::try_from(uri).map_err(ClientError::invalid_uri)?);
            Ok(parts)
        })
    }

    pub fn get(self) -> Self {
        self.method(Method::GET)
    }

    pub fn post(self) -> Self {
        self.method(Method::POST)
    }

    pub fn put(self) -> Self {
        self.method(Method::PUT)
    }

    pub fn delete(self) -> Self {
        self.method(Method::DELETE)
    }

    /// Sets the verb. Only one verb may govern a request; a second call is
    /// [`ClientError::InvalidState`].
    pub fn method(self, method: Method) -> Self {
        self.and_then(move |mut parts| {
            if let Some(existing) = &parts.method {
                return Err(ClientError::invalid_state(format!("method {method} after {existing}")));
            }
            ensure!(
                parts.body.is_none() || accepts_body(&method),
                ClientError::invalid_state(format!("{method} request cannot carry a body"))
            );
            parts.method = Some(method);
            Ok(parts)
        })
    }

    /// Attaches a body; rejected for methods that never carry one.
    pub fn body(self, body: impl Into<RequestBody>) -> Self {
        let body = body.into();
        self.and_then(move |mut parts| {
            ensure!(parts.body.is_none(), ClientError::invalid_state("body already set"));
            if let Some(method) = &parts.method {
                ensure!(accepts_body(method), ClientError::invalid_state(format!("body after {method}")));
            }
            parts.body = Some(body);
            Ok(parts)
        })
    }

    /// Adds a header value, keeping earlier values for the same name.
    pub fn header(self, name: &str, value: &str) -> Self {
        self.and_then(|mut parts| {
            let name = parse_unrestricted(name)?;
            parts.headers.add(name, parse_value(value)?);
            Ok(parts)
        })
    }

    /// Adds flattened `name, value, ...` pairs; an odd count is [`ClientError::MalformedInput`].
    pub fn headers(self, flat: &[&str]) -> Self {
        self.and_then(|mut parts| {
            let mut staged = HeaderStore::with_capacity(flat.len() / 2);
            staged.add_all(flat)?;
            for (name, _) in &staged {
                check_unrestricted(name)?;
            }
            parts.headers.extend(staged);
            Ok(parts)
        })
    }

    /// Replaces any earlier values for `name` with `value`.
    pub fn set_header(self, name: &str, value: &str) -> Self {
        self.and_then(|mut parts| {
            let name = parse_unrestricted(name)?;
            parts.headers.set(name, parse_value(value)?);
            Ok(parts)
        })
    }

    /// Deadline for the whole exchange; dispatch fails with [`ClientError::Timeout`] once it
    /// elapses. Requests have no timeout unless one is set here.
    pub fn timeout(self, timeout: Duration) -> Self {
        self.and_then(move |mut parts| {
            ensure!(!timeout.is_zero(), ClientError::malformed_input("timeout must be non-zero"));
            parts.timeout = Some(timeout);
            Ok(parts)
        })
    }

    /// Produces an immutable [`Request`] from the staged state.
    ///
    /// Can be called repeatedly; without intervening changes every call yields an equal
    /// request. POST and PUT without a body get an empty body.
    pub fn build(&self) -> Result<Request, ClientError> {
        let parts = self.inner.as_ref().map_err(Clone::clone)?;

        let uri = parts.uri.clone().ok_or(ClientError::MissingTarget)?;
        validate_target(&uri, &["http", "https"])?;

        let method = parts.method.clone().unwrap_or(Method::GET);
        let body = match &parts.body {
            Some(body) => Some(body.clone()),
            None if accepts_body(&method) => Some(RequestBody::empty()),
            None => None,
        };

        Ok(Request { method, uri, headers: parts.headers.clone(), body, timeout: parts.timeout })
    }

    fn and_then<F>(self, f: F) -> Self
    where
        F: FnOnce(Parts) -> Result<Parts, ClientError>,
    {
        Self { inner: self.inner.and_then(f) }
    }
}

fn accepts_body(method: &Method) -> bool {
    !matches!(*method, Method::GET | Method::HEAD | Method::DELETE | Method::OPTIONS | Method::CONNECT)
}

pub(crate) fn parse_unrestricted(name: &str) -> Result<HeaderName, ClientError> {
    let name = parse_name(name)?;
    check_unrestricted(&name)?;
    Ok(name)
}

pub(crate) fn is_restricted(name: &HeaderName) -> bool {
    RESTRICTED_HEADERS.contains(&name.as_str())
}

fn check_unrestricted(name: &HeaderName) -> Result<(), ClientError> {
    ensure!(
        !is_restricted(name),
        ClientError::malformed_input(format!("restricted header name: {name}"))
    );
    Ok(())
}

/// Checks that `uri` is absolute with one of the allowed schemes and a non-empty host.
pub(crate) fn validate_target(uri: &Uri, schemes: &[&str]) -> Result<(), ClientError> {
    let scheme = uri.scheme_str().ok_or_else(|| ClientError::invalid_uri(format!("missing scheme: {uri}")))?;
    ensure!(
        schemes.iter().any(|allowed| scheme.eq_ignore_ascii_case(allowed)),
        ClientError::invalid_uri(format!("unsupported scheme '{scheme}', expected one of {schemes:?}"))
    );
    ensure!(uri.host().is_some_and(|host| !host.is_empty()), ClientError::invalid_uri(format!("missing host: {uri}")));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET: &str = "https://api.myapp.com/someEndPoint";

    #[test]
    fn build_twice_yields_equal_requests() {
        let builder = Request::builder_with(TARGET).post().header("Accept", "application/json").body("payload");

        let first = builder.build().unwrap();
        let second = builder.build().unwrap();

        assert_eq!(first, second);
        assert_eq!(first.method(), &Method::POST);
        assert_eq!(first.uri().host(), Some("api.myapp.com"));
    }

    #[test]
    fn built_request_is_a_snapshot() {
        let builder = Request::builder_with(TARGET).header("Accept", "text/plain");
        let built = builder.build().unwrap();

        let builder = builder.set_header("Accept", "application/json");
        let rebuilt = builder.build().unwrap();

        assert_eq!(built.headers().values("accept"), vec!["text/plain"]);
        assert_eq!(rebuilt.headers().values("accept"), vec!["application/json"]);
    }

    #[test]
    fn set_header_overrides_added_header() {
        let request = Request::builder_with(TARGET)
            .header("Authorization", "Bearer k1")
            .post()
            .body("the string version of my request body")
            .set_header("Authorization", "Bearer k2")
            .build()
            .unwrap();

        assert_eq!(request.headers().values("authorization"), vec!["Bearer k2"]);
    }

    #[test]
    fn headers_requires_even_arguments() {
        let err = Request::builder_with(TARGET).headers(&["Authorization", "Bearer k1", "Accept"]).build().unwrap_err();
        assert!(matches!(err, ClientError::MalformedInput { .. }));
    }

    #[test]
    fn second_verb_is_invalid_state() {
        let err = Request::builder_with(TARGET).get().post().build().unwrap_err();
        assert!(matches!(err, ClientError::InvalidState { .. }));

        let err = Request::builder_with(TARGET).get().get().build().unwrap_err();
        assert!(matches!(err, ClientError::InvalidState { .. }));
    }

    #[test]
    fn body_is_rejected_for_bodyless_methods() {
        let err = Request::builder_with(TARGET).get().body("x").build().unwrap_err();
        assert!(matches!(err, ClientError::InvalidState { .. }));

        let err = Request::builder_with(TARGET).body("x").delete().build().unwrap_err();
        assert!(matches!(err, ClientError::InvalidState { .. }));
    }

    #[test]
    fn first_error_wins() {
        let err = Request::builder_with(TARGET).get().post().headers(&["odd"]).build().unwrap_err();
        assert!(matches!(err, ClientError::InvalidState { .. }));
    }

    #[test]
    fn post_and_put_default_to_empty_body() {
        let post = Request::builder_with(TARGET).post().build().unwrap();
        let put = Request::builder_with(TARGET).put().build().unwrap();

        assert!(post.body().is_some_and(RequestBody::is_empty));
        assert!(put.body().is_some_and(RequestBody::is_empty));
    }

    #[test]
    fn get_is_the_default_and_has_no_body() {
        let request = Request::builder_with(TARGET).build().unwrap();

        assert_eq!(request.method(), &Method::GET);
        assert!(request.body().is_none());
        assert!(request.timeout().is_none());
    }

    #[test]
    fn missing_target() {
        let err = Request::builder().get().build().unwrap_err();
        assert!(matches!(err, ClientError::MissingTarget));
    }

    #[test]
    fn invalid_targets() {
        for target in ["/relative/path", "ftp://files.example.com/x", "not a uri"] {
            let err = Request::builder_with(target).build().unwrap_err();
            assert!(matches!(err, ClientError::InvalidUri { .. }), "{target} gave {err:?}");
        }
    }

    #[test]
    fn restricted_headers_are_rejected() {
        let err = Request::builder_with(TARGET).header("Host", "evil.example.com").build().unwrap_err();
        assert!(matches!(err, ClientError::MalformedInput { .. }));

        let err = Request::builder_with(TARGET).headers(&["Accept", "*/*", "Content-Length", "3"]).build().unwrap_err();
        assert!(matches!(err, ClientError::MalformedInput { .. }));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err = Request::builder_with(TARGET).timeout(Duration::ZERO).build().unwrap_err();
        assert!(matches!(err, ClientError::MalformedInput { .. }));

        let request = Request::builder_with(TARGET).timeout(Duration::from_secs(3)).build().unwrap();
        assert_eq!(request.timeout(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn chunked_body_reports_length_and_concatenates() {
        let body = RequestBody::from_chunks([Bytes::from_static(b"hello "), Bytes::new(), Bytes::from_static(b"world")]);

        assert_eq!(body.content_length(), 11);
        assert_eq!(body.to_bytes(), Bytes::from_static(b"hello world"));
        assert!(RequestBody::from_chunks(Vec::new()).is_empty());
        assert!(RequestBody::from("").is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn http_body_is_replayable() {
        let request = Request::builder_with(TARGET)
            .put()
            .body(RequestBody::from_chunks([Bytes::from_static(b"a"), Bytes::from_static(b"b")]))
            .build()
            .unwrap();

        for _ in 0..2 {
            let http_request = request.to_http_request();
            assert_eq!(http_request.method(), Method::PUT);
            let bytes = http_request.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(bytes, Bytes::from_static(b"ab"));
        }
    }
}
