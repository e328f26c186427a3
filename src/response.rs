//! In-memory response objects handed back to intercepted callers.

use crate::error::{Error, Result};
use bytes::Bytes;
use http::header::SET_COOKIE;
use http::{Extensions, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Everything needed to construct a [`Response`].
#[derive(Debug, Clone)]
pub struct ResponseParts {
    pub method: Method,
    pub url: String,
    pub status: StatusCode,
    pub reason: String,
    /// Header pairs in order, with names in the case they were given.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// Builds responses for an expectation; the default builds a plain [`Response`].
///
/// Custom factories can decorate the response, e.g. by inserting typed
/// values into its extensions.
pub trait ResponseFactory: Send + Sync {
    fn build(&self, parts: ResponseParts) -> Response;
}

/// The factory used when an expectation does not name one.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResponseFactory;

impl ResponseFactory for DefaultResponseFactory {
    fn build(&self, parts: ResponseParts) -> Response {
        Response::from_parts(parts)
    }
}

impl<F> ResponseFactory for F
where
    F: Fn(ResponseParts) -> Response + Send + Sync,
{
    fn build(&self, parts: ResponseParts) -> Response {
        self(parts)
    }
}

/// A cookie parsed from a `Set-Cookie` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    /// Attributes such as `Path` or `HttpOnly`, in order.
    pub attributes: Vec<(String, Option<String>)>,
}

impl Cookie {
    /// Parse a `Set-Cookie` header value.
    pub fn parse(header: &str) -> Option<Self> {
        let mut segments = header.split(';');
        let (name, value) = segments.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let attributes = segments
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|attr| match attr.split_once('=') {
                Some((k, v)) => (k.trim().to_string(), Some(v.trim().to_string())),
                None => (attr.to_string(), None),
            })
            .collect();

        Some(Self {
            name: name.to_string(),
            value: value.trim().trim_matches('"').to_string(),
            attributes,
        })
    }

    /// Look up an attribute case-insensitively.
    pub fn attribute(&self, name: &str) -> Option<Option<&str>> {
        self.attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref())
    }
}

/// Release flag shared between a response and the interceptor that issued it.
#[derive(Debug, Clone, Default)]
pub(crate) struct ReleaseHandle(Arc<AtomicBool>);

impl ReleaseHandle {
    pub(crate) fn release(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_released(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A simulated HTTP response.
pub struct Response {
    method: Method,
    url: String,
    status: StatusCode,
    reason: String,
    headers: HeaderMap,
    raw_headers: Vec<(Bytes, Bytes)>,
    cookies: Vec<Cookie>,
    body: Bytes,
    position: usize,
    history: Vec<Response>,
    extensions: Extensions,
    released: ReleaseHandle,
}

impl Response {
    /// Build a response from its parts.
    ///
    /// Header pairs that are not valid HTTP header names or values are kept
    /// in the raw header list but left out of the typed header map.
    pub fn from_parts(parts: ResponseParts) -> Self {
        let mut headers = HeaderMap::with_capacity(parts.headers.len());
        let mut raw_headers = Vec::with_capacity(parts.headers.len());
        for (name, value) in &parts.headers {
            raw_headers.push((
                Bytes::copy_from_slice(name.as_bytes()),
                Bytes::copy_from_slice(value.as_bytes()),
            ));
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }

        let cookies = headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(Cookie::parse)
            .collect();

        Self {
            method: parts.method,
            url: parts.url,
            status: parts.status,
            reason: parts.reason,
            headers,
            raw_headers,
            cookies,
            body: parts.body,
            position: 0,
            history: Vec::new(),
            extensions: Extensions::new(),
            released: ReleaseHandle::default(),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Case-insensitive, multi-valued header map.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Header name/value byte pairs as they were configured.
    pub fn raw_headers(&self) -> &[(Bytes, Bytes)] {
        &self.raw_headers
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    pub fn cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.iter().find(|c| c.name == name)
    }

    /// Responses of the redirect chain that led here, oldest first.
    pub fn history(&self) -> &[Response] {
        &self.history
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }

    pub fn is_closed(&self) -> bool {
        self.released.is_released()
    }

    /// Fail with [`Error::Status`] unless the status is 2xx.
    pub fn raise_for_status(&self) -> Result<()> {
        if self.status.is_success() {
            return Ok(());
        }
        Err(Error::Status {
            status: self.status.as_u16(),
            reason: self.reason.clone(),
            url: self.url.clone(),
        })
    }

    /// Read up to `n` bytes from the body stream.
    ///
    /// Returns an empty chunk once the stream is exhausted.
    pub async fn read(&mut self, n: usize) -> Result<Bytes> {
        tokio::task::yield_now().await;
        self.ensure_open()?;
        let end = self.body.len().min(self.position.saturating_add(n));
        let chunk = self.body.slice(self.position..end);
        self.position = end;
        Ok(chunk)
    }

    /// Read the rest of the body stream.
    pub async fn bytes(&mut self) -> Result<Bytes> {
        tokio::task::yield_now().await;
        self.ensure_open()?;
        let chunk = self.body.slice(self.position..);
        self.position = self.body.len();
        Ok(chunk)
    }

    pub async fn text(&mut self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| Error::Decode(Arc::new(e)))
    }

    /// Release the response; further body reads fail.
    pub fn close(&self) {
        self.released.release();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ResponseClosed);
        }
        Ok(())
    }

    pub(crate) fn set_history(&mut self, history: Vec<Response>) {
        self.history = history;
    }

    /// Handles for this response and every response in its history.
    pub(crate) fn release_handles(&self) -> Vec<ReleaseHandle> {
        let mut handles = vec![self.released.clone()];
        for previous in &self.history {
            handles.extend(previous.release_handles());
        }
        handles
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("status", &self.status)
            .field("reason", &self.reason)
            .field("headers", &self.headers)
            .field("history", &self.history.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(headers: Vec<(&str, &str)>, body: &'static str) -> ResponseParts {
        ResponseParts {
            method: Method::GET,
            url: "http://example.com/api".to_string(),
            status: StatusCode::OK,
            reason: "OK".to_string(),
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: Bytes::from_static(body.as_bytes()),
        }
    }

    #[tokio::test]
    async fn test_partial_reads() {
        let mut response = Response::from_parts(parts(vec![], "Test"));
        assert_eq!(response.read(2).await.unwrap(), Bytes::from_static(b"Te"));
        assert_eq!(response.read(2).await.unwrap(), Bytes::from_static(b"st"));
        assert!(response.read(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_with_huge_limit_returns_rest() {
        let mut response = Response::from_parts(parts(vec![], "Test"));
        assert_eq!(response.read(2).await.unwrap(), Bytes::from_static(b"Te"));
        assert_eq!(response.read(usize::MAX).await.unwrap(), Bytes::from_static(b"st"));
        assert!(response.read(usize::MAX).await.unwrap().is_empty());
    }

    #[test]
    fn test_headers_are_case_insensitive_and_raw_preserved() {
        let response = Response::from_parts(parts(
            vec![("Content-Type", "text/html"), ("Connection", "keep-alive")],
            "",
        ));
        assert_eq!(response.headers()["connection"], "keep-alive");
        assert_eq!(response.content_type(), Some("text/html"));
        assert_eq!(
            response.raw_headers(),
            &[
                (Bytes::from_static(b"Content-Type"), Bytes::from_static(b"text/html")),
                (Bytes::from_static(b"Connection"), Bytes::from_static(b"keep-alive")),
            ]
        );
    }

    #[test]
    fn test_cookies_from_set_cookie_headers() {
        let response = Response::from_parts(parts(
            vec![
                ("Set-Cookie", "session=abc123; Path=/; HttpOnly"),
                ("Set-Cookie", "theme=\"dark\""),
            ],
            "",
        ));
        assert_eq!(response.cookies().len(), 2);
        let session = response.cookie("session").unwrap();
        assert_eq!(session.value, "abc123");
        assert_eq!(session.attribute("path"), Some(Some("/")));
        assert_eq!(session.attribute("httponly"), Some(None));
        assert_eq!(response.cookie("theme").unwrap().value, "dark");
    }

    #[test]
    fn test_cookie_parse_rejects_garbage() {
        assert!(Cookie::parse("no-equals-sign").is_none());
        assert!(Cookie::parse("=value").is_none());
    }

    #[tokio::test]
    async fn test_closed_response_refuses_reads() {
        let mut response = Response::from_parts(parts(vec![], "body"));
        response.close();
        assert!(response.is_closed());
        assert!(matches!(response.bytes().await, Err(Error::ResponseClosed)));
    }

    #[test]
    fn test_raise_for_status() {
        let mut p = parts(vec![], "");
        p.status = StatusCode::BAD_REQUEST;
        p.reason = "Bad Request".to_string();
        let err = Response::from_parts(p).raise_for_status().unwrap_err();
        match err {
            Error::Status { status, reason, .. } => {
                assert_eq!(status, 400);
                assert_eq!(reason, "Bad Request");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(Response::from_parts(parts(vec![], "")).raise_for_status().is_ok());
    }

    #[tokio::test]
    async fn test_json_body() {
        let mut response = Response::from_parts(parts(vec![], r#"{"foo":"bar"}"#));
        let value: serde_json::Value = response.json().await.unwrap();
        assert_eq!(value["foo"], "bar");
    }
}
