//! Expectations: one registered expected call and the outcome it produces.

use crate::error::{BoxError, Error, Result};
use crate::matcher::UrlMatcher;
use crate::response::{DefaultResponseFactory, Response, ResponseFactory, ResponseParts};
use crate::session::RequestOptions;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use http::{HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Error to raise instead of producing a response.
#[derive(Clone)]
pub enum Raise {
    /// A specific error value, raised as-is every time.
    Error(Arc<dyn std::error::Error + Send + Sync + 'static>),
    /// Constructs a fresh error for each resolution.
    Factory(Arc<dyn Fn() -> BoxError + Send + Sync>),
    /// Simulated timeout.
    Timeout,
}

impl Raise {
    pub fn error<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Raise::Error(Arc::new(error))
    }

    pub fn factory<F, E>(factory: F) -> Self
    where
        F: Fn() -> E + Send + Sync + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        Raise::Factory(Arc::new(move || Box::new(factory()) as BoxError))
    }

    fn to_error(&self, method: &Method, url: &str) -> Error {
        match self {
            Raise::Error(error) => Error::Raised(Arc::clone(error)),
            Raise::Factory(factory) => Error::Raised(Arc::from(factory())),
            Raise::Timeout => Error::Timeout {
                method: method.clone(),
                url: url.to_string(),
            },
        }
    }
}

impl fmt::Debug for Raise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Raise::Error(error) => f.debug_tuple("Error").field(&error.to_string()).finish(),
            Raise::Factory(_) => f.write_str("Factory"),
            Raise::Timeout => f.write_str("Timeout"),
        }
    }
}

/// Partial response returned by a callback; set fields override the
/// expectation's static outcome.
#[derive(Debug, Clone, Default)]
pub struct CallbackResult {
    pub status: Option<u16>,
    pub body: Option<Bytes>,
    pub payload: Option<serde_json::Value>,
    pub headers: Option<Vec<(String, String)>>,
    pub content_type: Option<String>,
    pub reason: Option<String>,
    /// URL reported by the response instead of the request URL.
    pub url: Option<String>,
}

impl CallbackResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(Vec::new)
            .push((name.into(), value.into()));
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

type SyncCallback = dyn Fn(&str, &RequestOptions) -> Option<CallbackResult> + Send + Sync;
type AsyncCallback =
    dyn Fn(String, RequestOptions) -> BoxFuture<'static, Option<CallbackResult>> + Send + Sync;

/// Dynamic outcome, invoked with the request URL and live call options.
#[derive(Clone)]
pub enum Callback {
    Sync(Arc<SyncCallback>),
    Async(Arc<AsyncCallback>),
}

impl Callback {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&str, &RequestOptions) -> Option<CallbackResult> + Send + Sync + 'static,
    {
        Callback::Sync(Arc::new(f))
    }

    /// Wrap an async callback; the call does not resume until it completes.
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(String, RequestOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<CallbackResult>> + Send + 'static,
    {
        Callback::Async(Arc::new(move |url: String, options: RequestOptions| {
            f(url, options).boxed()
        }))
    }

    async fn invoke(&self, url: &str, options: &RequestOptions) -> Option<CallbackResult> {
        match self {
            Callback::Sync(f) => f(url, options),
            Callback::Async(f) => f(url.to_string(), options.clone()).await,
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callback::Sync(_) => f.write_str("Callback::Sync"),
            Callback::Async(_) => f.write_str("Callback::Async"),
        }
    }
}

/// Latency simulation applied before the outcome is produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Delay {
    /// Fixed delay in milliseconds
    #[serde(default)]
    pub fixed_ms: u64,

    /// Minimum delay for random range (ms)
    #[serde(default)]
    pub min_ms: u64,

    /// Maximum delay for random range (ms)
    #[serde(default)]
    pub max_ms: u64,
}

impl Delay {
    pub fn fixed(ms: u64) -> Self {
        Self {
            fixed_ms: ms,
            ..Self::default()
        }
    }

    pub fn between(min_ms: u64, max_ms: u64) -> Self {
        Self {
            fixed_ms: 0,
            min_ms,
            max_ms,
        }
    }

    /// Calculate the actual delay to apply.
    pub fn calculate(&self) -> u64 {
        if self.fixed_ms > 0 {
            return self.fixed_ms;
        }
        if self.max_ms > self.min_ms {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            return rng.gen_range(self.min_ms..=self.max_ms);
        }
        self.min_ms
    }
}

/// Registration options for one expectation.
///
/// ```
/// use mock_responses::ResponseSpec;
///
/// let spec = ResponseSpec::new()
///     .status(201)
///     .payload(serde_json::json!({"id": 1}))
///     .header("Location", "/items/1");
/// ```
#[derive(Clone)]
pub struct ResponseSpec {
    status: u16,
    body: Bytes,
    payload: Option<serde_json::Value>,
    headers: Vec<(String, String)>,
    content_type: String,
    reason: Option<String>,
    repeat: bool,
    raise: Option<Raise>,
    callback: Option<Callback>,
    factory: Option<Arc<dyn ResponseFactory>>,
    delay: Option<Delay>,
}

impl Default for ResponseSpec {
    fn default() -> Self {
        Self {
            status: 200,
            body: Bytes::new(),
            payload: None,
            headers: Vec::new(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            reason: None,
            repeat: false,
            raise: None,
            callback: None,
            factory: None,
            delay: None,
        }
    }
}

impl ResponseSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Structured payload serialized to a JSON body; overrides `body`.
    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Add a header; it replaces the default content type when named so.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.headers
            .extend(headers.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Explicit reason phrase; defaults to the standard phrase for the status.
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Keep the expectation after it matches.
    pub fn repeat(mut self, repeat: bool) -> Self {
        self.repeat = repeat;
        self
    }

    /// Raise `error` instead of building a response.
    pub fn exception<E>(mut self, error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.raise = Some(Raise::error(error));
        self
    }

    pub fn raise(mut self, raise: Raise) -> Self {
        self.raise = Some(raise);
        self
    }

    /// Shorthand for a simulated timeout error.
    pub fn timeout(mut self, timeout: bool) -> Self {
        if timeout {
            self.raise = Some(Raise::Timeout);
        } else if matches!(self.raise, Some(Raise::Timeout)) {
            self.raise = None;
        }
        self
    }

    pub fn callback(mut self, callback: Callback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Alternate response constructor.
    pub fn response_factory(mut self, factory: impl ResponseFactory + 'static) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    pub fn delay(mut self, delay: Delay) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl fmt::Debug for ResponseSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseSpec")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("repeat", &self.repeat)
            .field("raise", &self.raise)
            .field("callback", &self.callback)
            .finish()
    }
}

/// Result of resolving an expectation.
#[derive(Debug)]
pub enum Outcome {
    Response(Response),
    Failure(Error),
}

/// Static response fields after validation.
#[derive(Debug, Clone)]
struct StaticResponse {
    status: StatusCode,
    reason: Option<String>,
    content_type: String,
    headers: Vec<(String, String)>,
    body: Bytes,
}

/// One registered expected call.
pub struct Expectation {
    id: u64,
    method: Method,
    matcher: UrlMatcher,
    response: StaticResponse,
    raise: Option<Raise>,
    callback: Option<Callback>,
    factory: Arc<dyn ResponseFactory>,
    delay: Option<Delay>,
    repeat: bool,
}

impl Expectation {
    /// Validate the registration options and build an expectation.
    ///
    /// Invalid status codes, header names or values and unserializable
    /// payloads are rejected here rather than at resolution time.
    pub fn new(method: Method, matcher: UrlMatcher, spec: ResponseSpec) -> Result<Self> {
        let status =
            StatusCode::from_u16(spec.status).map_err(|_| Error::InvalidStatus(spec.status))?;
        validate_header("Content-Type", &spec.content_type)?;
        for (name, value) in &spec.headers {
            validate_header(name, value)?;
        }

        let body = match &spec.payload {
            Some(payload) => serialize_payload(payload)?,
            None => spec.body,
        };

        Ok(Self {
            id: 0,
            method,
            matcher,
            response: StaticResponse {
                status,
                reason: spec.reason,
                content_type: spec.content_type,
                headers: spec.headers,
                body,
            },
            raise: spec.raise,
            callback: spec.callback,
            factory: spec
                .factory
                .unwrap_or_else(|| Arc::new(DefaultResponseFactory)),
            delay: spec.delay,
            repeat: spec.repeat,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn matcher(&self) -> &UrlMatcher {
        &self.matcher
    }

    pub fn is_repeat(&self) -> bool {
        self.repeat
    }

    /// Whether this expectation accepts a call with `method` to `url`.
    pub fn matches(&self, method: &Method, url: &str) -> bool {
        self.method.as_str().eq_ignore_ascii_case(method.as_str()) && self.matcher.matches(url)
    }

    /// Produce the outcome for a call.
    ///
    /// A registered error wins over a callback, which wins over the static
    /// response.
    pub async fn resolve(&self, method: &Method, url: &str, options: &RequestOptions) -> Outcome {
        if let Some(delay) = &self.delay {
            let delay_ms = delay.calculate();
            if delay_ms > 0 {
                debug!(expectation = self.id, delay_ms, "Applying delay");
                tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
            }
        }

        if let Some(raise) = &self.raise {
            return Outcome::Failure(raise.to_error(method, url));
        }

        let overrides = match &self.callback {
            Some(callback) => callback.invoke(url, options).await,
            None => None,
        };

        match overrides {
            Some(overrides) => match self.apply_overrides(overrides) {
                Ok((response, response_url)) => Outcome::Response(self.build(
                    method,
                    response_url.as_deref().unwrap_or(url),
                    &response,
                )),
                Err(e) => Outcome::Failure(e),
            },
            None => Outcome::Response(self.build(method, url, &self.response)),
        }
    }

    fn apply_overrides(
        &self,
        overrides: CallbackResult,
    ) -> Result<(StaticResponse, Option<String>)> {
        let mut response = self.response.clone();
        if let Some(status) = overrides.status {
            response.status =
                StatusCode::from_u16(status).map_err(|_| Error::InvalidStatus(status))?;
        }
        if let Some(reason) = overrides.reason {
            response.reason = Some(reason);
        }
        if let Some(content_type) = overrides.content_type {
            response.content_type = content_type;
        }
        if let Some(headers) = overrides.headers {
            response.headers = headers;
        }
        if let Some(payload) = overrides.payload {
            response.body = serialize_payload(&payload)?;
        } else if let Some(body) = overrides.body {
            response.body = body;
        }
        Ok((response, overrides.url))
    }

    fn build(&self, method: &Method, url: &str, response: &StaticResponse) -> Response {
        let reason = response.reason.clone().unwrap_or_else(|| {
            response
                .status
                .canonical_reason()
                .unwrap_or_default()
                .to_string()
        });

        self.factory.build(ResponseParts {
            method: method.clone(),
            url: url.to_string(),
            status: response.status,
            reason,
            headers: merge_headers(&response.content_type, &response.headers),
            body: response.body.clone(),
        })
    }
}

impl fmt::Debug for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expectation")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("matcher", &self.matcher)
            .field("status", &self.response.status)
            .field("repeat", &self.repeat)
            .finish()
    }
}

/// Content type first, then caller headers; the first caller header with a
/// given name replaces an existing entry in place, later ones are appended.
fn merge_headers(content_type: &str, headers: &[(String, String)]) -> Vec<(String, String)> {
    let mut merged = vec![("Content-Type".to_string(), content_type.to_string())];
    let mut replaced: Vec<&str> = Vec::new();
    for (name, value) in headers {
        let first = !replaced.iter().any(|n| n.eq_ignore_ascii_case(name));
        let existing = merged.iter().position(|(n, _)| n.eq_ignore_ascii_case(name));
        match (first, existing) {
            (true, Some(pos)) => merged[pos] = (name.clone(), value.clone()),
            _ => merged.push((name.clone(), value.clone())),
        }
        if first {
            replaced.push(name);
        }
    }
    merged
}

/// Reject header names or values that are not valid HTTP.
pub(crate) fn validate_header(name: &str, value: &str) -> Result<()> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|e| Error::InvalidHeader {
        name: name.to_string(),
        reason: e.to_string(),
    })?;
    HeaderValue::from_str(value).map_err(|e| Error::InvalidHeader {
        name: name.to_string(),
        reason: e.to_string(),
    })?;
    Ok(())
}

fn serialize_payload(payload: &serde_json::Value) -> Result<Bytes> {
    serde_json::to_vec(payload)
        .map(Bytes::from)
        .map_err(|e| Error::Payload(Arc::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "http://example.com/api?foo=bar#fragment";

    fn expectation(spec: ResponseSpec) -> Expectation {
        Expectation::new(Method::GET, UrlMatcher::from(URL), spec).unwrap()
    }

    async fn response(exp: &Expectation) -> Response {
        match exp.resolve(&Method::GET, URL, &RequestOptions::default()).await {
            Outcome::Response(r) => r,
            Outcome::Failure(e) => panic!("unexpected failure: {e}"),
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("oops")]
    struct Oops;

    #[test]
    fn test_method_is_case_insensitive() {
        let exp = expectation(ResponseSpec::new());
        let lower = Method::from_bytes(b"get").unwrap();
        assert!(exp.matches(&lower, URL));
        assert!(!exp.matches(&Method::POST, URL));
    }

    #[test]
    fn test_invalid_registration_rejected() {
        let err = Expectation::new(Method::GET, URL.into(), ResponseSpec::new().status(42));
        assert!(matches!(err, Err(Error::InvalidStatus(42))));

        let err = Expectation::new(
            Method::GET,
            URL.into(),
            ResponseSpec::new().header("bad header", "x"),
        );
        assert!(matches!(err, Err(Error::InvalidHeader { .. })));
    }

    #[tokio::test]
    async fn test_default_reason_and_content_type() {
        let exp = expectation(ResponseSpec::new().status(404));
        let r = response(&exp).await;
        assert_eq!(r.status(), StatusCode::NOT_FOUND);
        assert_eq!(r.reason(), "Not Found");
        assert_eq!(r.content_type(), Some("application/json"));
    }

    #[tokio::test]
    async fn test_unknown_status_has_empty_reason() {
        let r = response(&expectation(ResponseSpec::new().status(599))).await;
        assert_eq!(r.reason(), "");

        let r = response(&expectation(ResponseSpec::new().status(599).reason("Custom"))).await;
        assert_eq!(r.reason(), "Custom");
    }

    #[tokio::test]
    async fn test_caller_headers_override_content_type() {
        let exp = expectation(
            ResponseSpec::new()
                .content_type("text/html")
                .header("content-type", "text/plain")
                .header("Connection", "keep-alive"),
        );
        let r = response(&exp).await;
        assert_eq!(r.content_type(), Some("text/plain"));
        assert_eq!(r.headers().get_all("content-type").iter().count(), 1);
        assert_eq!(r.raw_headers().len(), 2);
        assert_eq!(&r.raw_headers()[0].0[..], b"content-type");
    }

    #[tokio::test]
    async fn test_payload_overrides_body() {
        let exp = expectation(
            ResponseSpec::new()
                .body("ignored")
                .payload(serde_json::json!({"foo": "bar"})),
        );
        let mut r = response(&exp).await;
        assert_eq!(r.text().await.unwrap(), r#"{"foo":"bar"}"#);
    }

    #[tokio::test]
    async fn test_exception_wins_over_callback() {
        let exp = expectation(
            ResponseSpec::new()
                .exception(Oops)
                .callback(Callback::sync(|_, _| Some(CallbackResult::new().status(201)))),
        );
        match exp.resolve(&Method::GET, URL, &RequestOptions::default()).await {
            Outcome::Failure(e) => assert!(e.downcast_ref::<Oops>().is_some()),
            Outcome::Response(_) => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn test_factory_raise_builds_fresh_error() {
        let exp = expectation(ResponseSpec::new().raise(Raise::factory(|| Oops)));
        for _ in 0..2 {
            match exp.resolve(&Method::GET, URL, &RequestOptions::default()).await {
                Outcome::Failure(e) => assert_eq!(e.to_string(), "oops"),
                Outcome::Response(_) => panic!("expected failure"),
            }
        }
    }

    #[tokio::test]
    async fn test_timeout_shorthand() {
        let exp = expectation(ResponseSpec::new().timeout(true));
        match exp.resolve(&Method::GET, URL, &RequestOptions::default()).await {
            Outcome::Failure(e) => assert!(e.is_timeout()),
            Outcome::Response(_) => panic!("expected timeout"),
        }
    }

    #[tokio::test]
    async fn test_sync_callback_receives_url_and_options() {
        let exp = expectation(ResponseSpec::new().status(200).callback(Callback::sync(
            |url, options| {
                assert_eq!(url, URL);
                assert!(options.allow_redirects);
                Some(CallbackResult::new().body("New body"))
            },
        )));
        let mut r = response(&exp).await;
        assert_eq!(r.status(), StatusCode::OK);
        assert_eq!(r.bytes().await.unwrap(), Bytes::from_static(b"New body"));
    }

    #[tokio::test]
    async fn test_callback_returning_none_uses_static_outcome() {
        let exp = expectation(
            ResponseSpec::new()
                .status(202)
                .callback(Callback::sync(|_, _| None)),
        );
        assert_eq!(response(&exp).await.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_async_callback_can_suspend_and_set_url() {
        let exp = expectation(ResponseSpec::new().callback(Callback::from_async(
            |url, _options| async move {
                tokio::task::yield_now().await;
                Some(CallbackResult::new().status(418).url(format!("{url}&extra=1")))
            },
        )));
        let r = response(&exp).await;
        assert_eq!(r.status().as_u16(), 418);
        assert_eq!(r.url(), format!("{URL}&extra=1"));
    }

    #[tokio::test]
    async fn test_custom_response_factory() {
        #[derive(Clone, Debug, PartialEq)]
        struct Tagged;

        let exp = expectation(ResponseSpec::new().body("Test").response_factory(
            |parts: ResponseParts| {
                let mut response = Response::from_parts(parts);
                response.extensions_mut().insert(Tagged);
                response
            },
        ));
        let r = response(&exp).await;
        assert_eq!(r.extensions().get::<Tagged>(), Some(&Tagged));
    }

    #[test]
    fn test_delay_calculation() {
        assert_eq!(Delay::fixed(100).calculate(), 100);
        let delay = Delay::between(50, 150).calculate();
        assert!((50..=150).contains(&delay));
    }
}
