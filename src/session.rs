//! Host client surface.
//!
//! A minimal client session whose requests route through an
//! [`InterceptionPoint`]. When a hook is installed on the point every
//! session created from it hands its calls to the hook; otherwise calls go
//! straight to the session's real [`Transport`].

use crate::error::{Error, Result};
use crate::response::Response;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use http::Method;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Body attached to an outgoing request.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Bytes(Bytes),
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
    /// Streaming body; clones share the same underlying stream.
    Stream(StreamBody),
}

/// Shared handle to a streaming request body.
#[derive(Clone)]
pub struct StreamBody(Arc<Mutex<Option<BoxStream<'static, Bytes>>>>);

impl StreamBody {
    pub fn new(stream: BoxStream<'static, Bytes>) -> Self {
        Self(Arc::new(Mutex::new(Some(stream))))
    }

    /// Take the stream out of the handle; later takers get `None`.
    pub fn take(&self) -> Option<BoxStream<'static, Bytes>> {
        self.0.lock().take()
    }

    /// Whether two handles refer to the same stream.
    pub fn ptr_eq(&self, other: &StreamBody) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for StreamBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamBody")
            .field("consumed", &self.0.lock().is_none())
            .finish()
    }
}

/// Per-call options, the keyword arguments of a request.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Query parameters merged into the URL.
    pub params: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<RequestBody>,
    /// Follow redirect responses (default true).
    pub allow_redirects: bool,
    /// Raise on non-2xx responses; `None` defers to the interceptor default.
    pub raise_for_status: Option<bool>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            params: Vec::new(),
            headers: Vec::new(),
            body: None,
            allow_redirects: true,
            raise_for_status: None,
        }
    }
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((key.into(), value.to_string()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(RequestBody::Bytes(body.into()));
        self
    }

    pub fn json(mut self, value: serde_json::Value) -> Self {
        self.body = Some(RequestBody::Json(value));
        self
    }

    pub fn form(mut self, pairs: Vec<(String, String)>) -> Self {
        self.body = Some(RequestBody::Form(pairs));
        self
    }

    pub fn stream(mut self, stream: BoxStream<'static, Bytes>) -> Self {
        self.body = Some(RequestBody::Stream(StreamBody::new(stream)));
        self
    }

    pub fn allow_redirects(mut self, allow: bool) -> Self {
        self.allow_redirects = allow;
        self
    }

    pub fn raise_for_status(mut self, raise: bool) -> Self {
        self.raise_for_status = Some(raise);
        self
    }
}

/// A live call: method, URL as given by the caller, and options.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub options: RequestOptions,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>, options: RequestOptions) -> Self {
        Self {
            method,
            url: url.into(),
            options,
        }
    }
}

/// The real network transport behind a session.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: Request) -> Result<Response>;
}

/// Transport that refuses every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineTransport;

#[async_trait]
impl Transport for OfflineTransport {
    async fn send(&self, request: Request) -> Result<Response> {
        Err(Error::ConnectionRefused {
            method: request.method,
            url: request.url,
        })
    }
}

/// Hook installed on an [`InterceptionPoint`] to take over request handling.
#[async_trait]
pub trait RequestHook: Send + Sync {
    async fn handle(&self, session: &Session, request: Request) -> Result<Response>;
}

/// The single place where a hook can be installed for all sessions.
#[derive(Clone, Default)]
pub struct InterceptionPoint {
    slot: Arc<RwLock<Option<Arc<dyn RequestHook>>>>,
}

impl InterceptionPoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `hook`, returning whatever was installed before.
    pub fn install(&self, hook: Arc<dyn RequestHook>) -> Option<Arc<dyn RequestHook>> {
        self.slot.write().replace(hook)
    }

    /// Put back a previously installed hook (or clear the slot).
    pub fn restore(&self, previous: Option<Arc<dyn RequestHook>>) {
        *self.slot.write() = previous;
    }

    pub fn is_hooked(&self) -> bool {
        self.slot.read().is_some()
    }

    fn current(&self) -> Option<Arc<dyn RequestHook>> {
        self.slot.read().clone()
    }
}

impl fmt::Debug for InterceptionPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptionPoint")
            .field("hooked", &self.is_hooked())
            .finish()
    }
}

/// A client session bound to an interception point.
pub struct Session {
    point: InterceptionPoint,
    transport: Arc<dyn Transport>,
    closed: AtomicBool,
}

impl Session {
    /// Create a session that reaches the network through `transport`.
    pub fn new(point: &InterceptionPoint, transport: Arc<dyn Transport>) -> Self {
        Self {
            point: point.clone(),
            transport,
            closed: AtomicBool::new(false),
        }
    }

    /// Create a session with no network access.
    pub fn offline(point: &InterceptionPoint) -> Self {
        Self::new(point, Arc::new(OfflineTransport))
    }

    /// The real transport, used for passthrough calls.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Issue a request, routed through the installed hook if any.
    pub async fn request(
        &self,
        method: Method,
        url: impl Into<String>,
        options: RequestOptions,
    ) -> Result<Response> {
        let request = Request::new(method, url, options);
        match self.point.current() {
            Some(hook) => hook.handle(self, request).await,
            None => {
                if self.is_closed() {
                    return Err(Error::SessionClosed);
                }
                self.transport.send(request).await
            }
        }
    }

    pub async fn get(&self, url: impl Into<String>) -> Result<Response> {
        self.request(Method::GET, url, RequestOptions::default()).await
    }

    pub async fn get_with(
        &self,
        url: impl Into<String>,
        options: RequestOptions,
    ) -> Result<Response> {
        self.request(Method::GET, url, options).await
    }

    pub async fn post(&self, url: impl Into<String>, options: RequestOptions) -> Result<Response> {
        self.request(Method::POST, url, options).await
    }

    pub async fn put(&self, url: impl Into<String>, options: RequestOptions) -> Result<Response> {
        self.request(Method::PUT, url, options).await
    }

    pub async fn patch(&self, url: impl Into<String>, options: RequestOptions) -> Result<Response> {
        self.request(Method::PATCH, url, options).await
    }

    pub async fn delete(&self, url: impl Into<String>) -> Result<Response> {
        self.request(Method::DELETE, url, RequestOptions::default()).await
    }

    pub async fn head(&self, url: impl Into<String>) -> Result<Response> {
        self.request(Method::HEAD, url, RequestOptions::default()).await
    }

    pub async fn options(&self, url: impl Into<String>) -> Result<Response> {
        self.request(Method::OPTIONS, url, RequestOptions::default()).await
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("point", &self.point)
            .field("closed", &self.is_closed())
            .finish()
    }
}
