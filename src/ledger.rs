//! Call ledger: every observed call, keyed by method and normalized URL.

use crate::normalize::normalize;
use crate::session::{RequestBody, RequestOptions};
use http::Method;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// Ledger key: upper-cased method and normalized URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub method: Method,
    pub url: String,
}

impl RequestKey {
    pub fn new(method: &Method, url: &str) -> Self {
        Self {
            method: canonical_method(method),
            url: normalize(url),
        }
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// One observed call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// Options as they were when the call was made.
    pub options: RequestOptions,
    /// True when the body could not be copied and is shared with the caller.
    pub shared_body: bool,
}

impl RecordedCall {
    /// Snapshot the call options.
    ///
    /// Byte, JSON and form bodies are copied; a streaming body cannot be
    /// copied and is recorded as a handle to the caller's stream instead.
    fn capture(options: &RequestOptions) -> Self {
        let shared_body = matches!(options.body, Some(RequestBody::Stream(_)));
        Self {
            options: options.clone(),
            shared_body,
        }
    }
}

/// Record of all calls seen by an interceptor.
#[derive(Debug, Default)]
pub struct Ledger {
    calls: Mutex<HashMap<RequestKey, Vec<RecordedCall>>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a call; happens before resolution so failed calls are kept.
    pub fn record(&self, method: &Method, url: &str, options: &RequestOptions) {
        let key = RequestKey::new(method, url);
        let call = RecordedCall::capture(options);
        if call.shared_body {
            debug!(key = %key, "Streaming body recorded by reference");
        }
        self.calls.lock().entry(key).or_default().push(call);
    }

    /// Snapshot of every recorded call.
    pub fn snapshot(&self) -> HashMap<RequestKey, Vec<RecordedCall>> {
        self.calls.lock().clone()
    }

    /// Calls recorded for one method and URL (the URL is normalized first).
    pub fn calls(&self, method: &Method, url: &str) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .get(&RequestKey::new(method, url))
            .cloned()
            .unwrap_or_default()
    }

    /// Total number of recorded calls across all keys.
    pub fn total(&self) -> usize {
        self.calls.lock().values().map(Vec::len).sum()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

fn canonical_method(method: &Method) -> Method {
    let upper = method.as_str().to_ascii_uppercase();
    Method::from_bytes(upper.as_bytes()).unwrap_or_else(|_| method.clone())
}
