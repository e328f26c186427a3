//! The interceptor: registration API, activation, passthrough and call
//! bookkeeping.

use crate::config::{InterceptorConfig, Settings};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::expectation::{Expectation, ResponseSpec};
use crate::ledger::{Ledger, RecordedCall, RequestKey};
use crate::matcher::{Registry, UrlMatcher};
use crate::normalize::merge_params;
use crate::response::{ReleaseHandle, Response};
use crate::session::{InterceptionPoint, Request, RequestHook, Session};
use async_trait::async_trait;
use http::Method;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, Instrument};

/// Where the interceptor is installed while active.
struct Activation {
    point: InterceptionPoint,
    previous: Option<Arc<dyn RequestHook>>,
}

struct Inner {
    config: InterceptorConfig,
    registry: Registry,
    ledger: Ledger,
    activation: Mutex<Option<Activation>>,
    /// Responses handed out during the current activation
    issued: Mutex<Vec<ReleaseHandle>>,
    requests_total: AtomicU64,
    requests_matched: AtomicU64,
    requests_unmatched: AtomicU64,
    requests_passthrough: AtomicU64,
}

/// Intercepts requests issued through sessions and resolves them against
/// registered expectations.
///
/// Each interceptor owns its own registry and ledger. Cloning yields another
/// handle to the same interceptor.
///
/// ```no_run
/// # async fn demo() -> mock_responses::Result<()> {
/// use mock_responses::{InterceptionPoint, Interceptor, ResponseSpec, Session};
///
/// let point = InterceptionPoint::new();
/// let session = Session::offline(&point);
/// let mock = Interceptor::default();
/// let _guard = mock.activate(&point)?;
///
/// mock.get("http://example.com/api", ResponseSpec::new().status(204))?;
/// let response = session.get("http://example.com/api").await?;
/// assert_eq!(response.status().as_u16(), 204);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Interceptor {
    inner: Arc<Inner>,
}

impl Default for Interceptor {
    fn default() -> Self {
        Self::new(InterceptorConfig::default())
    }
}

impl Interceptor {
    /// Create a new interceptor with the given configuration.
    pub fn new(config: InterceptorConfig) -> Self {
        info!(
            passthrough = config.passthrough.len(),
            fixtures = config.expectations.len(),
            raise_for_status = config.raise_for_status,
            "Interceptor created"
        );

        Self {
            inner: Arc::new(Inner {
                config,
                registry: Registry::new(),
                ledger: Ledger::new(),
                activation: Mutex::new(None),
                issued: Mutex::new(Vec::new()),
                requests_total: AtomicU64::new(0),
                requests_matched: AtomicU64::new(0),
                requests_unmatched: AtomicU64::new(0),
                requests_passthrough: AtomicU64::new(0),
            }),
        }
    }

    pub fn builder() -> InterceptorBuilder {
        InterceptorBuilder::default()
    }

    /// Create from a YAML configuration string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(Self::new(InterceptorConfig::from_yaml(yaml)?))
    }

    /// Create from a YAML configuration file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        Ok(Self::new(InterceptorConfig::from_file(path)?))
    }

    pub fn config(&self) -> &InterceptorConfig {
        &self.inner.config
    }

    fn settings(&self) -> &Settings {
        &self.inner.config.settings
    }

    // Activation

    /// Install the interceptor on `point`.
    ///
    /// Starting an interceptor that is already active is a precondition
    /// violation and fails with [`Error::AlreadyActive`]. Fixture
    /// expectations from the configuration are registered here.
    pub fn start(&self, point: &InterceptionPoint) -> Result<()> {
        let mut activation = self.inner.activation.lock();
        if activation.is_some() {
            return Err(Error::AlreadyActive);
        }

        for expectation in self.build_fixtures()? {
            debug!(expectation = ?expectation, "Registering fixture");
            self.inner.registry.push(expectation);
        }
        let previous = point.install(Arc::new(self.clone()));
        *activation = Some(Activation {
            point: point.clone(),
            previous,
        });

        info!(pending = self.inner.registry.len(), "Interceptor activated");
        Ok(())
    }

    /// Restore the previous hook, release handed-out responses, and clear the
    /// registry and ledger.
    pub fn stop(&self) -> Result<()> {
        let Activation { point, previous } =
            self.inner.activation.lock().take().ok_or(Error::NotActive)?;
        point.restore(previous);

        let issued: Vec<ReleaseHandle> = std::mem::take(&mut *self.inner.issued.lock());
        for handle in &issued {
            handle.release();
        }
        let unused = self.inner.registry.len();
        let recorded = self.inner.ledger.total();
        self.inner.registry.clear();
        self.inner.ledger.clear();

        info!(
            released = issued.len(),
            unused,
            recorded,
            "Interceptor deactivated"
        );
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.inner.activation.lock().is_some()
    }

    /// Activate for the lifetime of the returned guard.
    pub fn activate(&self, point: &InterceptionPoint) -> Result<InterceptorGuard> {
        self.start(point)?;
        Ok(InterceptorGuard {
            interceptor: self.clone(),
        })
    }

    /// Run a unit of work with the interceptor active, passing it in.
    ///
    /// Deactivation happens on every exit path, including panics.
    pub fn run<F, T>(&self, point: &InterceptionPoint, f: F) -> Result<T>
    where
        F: FnOnce(Interceptor) -> T,
    {
        let _guard = self.activate(point)?;
        let span = tracing::info_span!("intercepted", param = %self.param_name());
        let _enter = span.enter();
        Ok(f(self.clone()))
    }

    /// Async counterpart of [`run`](Self::run).
    pub async fn run_async<F, Fut>(&self, point: &InterceptionPoint, f: F) -> Result<Fut::Output>
    where
        F: FnOnce(Interceptor) -> Fut,
        Fut: Future,
    {
        let _guard = self.activate(point)?;
        let span = tracing::info_span!("intercepted", param = %self.param_name());
        Ok(f(self.clone()).instrument(span).await)
    }

    fn param_name(&self) -> &str {
        self.inner.config.param.as_deref().unwrap_or("mocked")
    }

    /// Build every fixture expectation; nothing is registered if one fails.
    fn build_fixtures(&self) -> Result<Vec<Expectation>> {
        self.inner
            .config
            .expectations
            .iter()
            .enumerate()
            .map(|(i, def)| {
                let build = || -> anyhow::Result<_> {
                    let spec = def.to_spec(self.settings())?;
                    Ok(Expectation::new(def.method()?, def.matcher()?, spec)?)
                };
                build().map_err(|e| Error::Fixture(format!("Expectation {}: {}", i, e)))
            })
            .collect()
    }

    // Registration

    /// Register an expectation, returning its id.
    pub fn add(
        &self,
        url: impl Into<UrlMatcher>,
        method: Method,
        spec: ResponseSpec,
    ) -> Result<u64> {
        let expectation = Expectation::new(method, url.into(), spec)?;
        debug!(expectation = ?expectation, "Registering expectation");
        Ok(self.inner.registry.push(expectation))
    }

    pub fn get(&self, url: impl Into<UrlMatcher>, spec: ResponseSpec) -> Result<u64> {
        self.add(url, Method::GET, spec)
    }

    pub fn post(&self, url: impl Into<UrlMatcher>, spec: ResponseSpec) -> Result<u64> {
        self.add(url, Method::POST, spec)
    }

    pub fn put(&self, url: impl Into<UrlMatcher>, spec: ResponseSpec) -> Result<u64> {
        self.add(url, Method::PUT, spec)
    }

    pub fn patch(&self, url: impl Into<UrlMatcher>, spec: ResponseSpec) -> Result<u64> {
        self.add(url, Method::PATCH, spec)
    }

    pub fn delete(&self, url: impl Into<UrlMatcher>, spec: ResponseSpec) -> Result<u64> {
        self.add(url, Method::DELETE, spec)
    }

    pub fn options(&self, url: impl Into<UrlMatcher>, spec: ResponseSpec) -> Result<u64> {
        self.add(url, Method::OPTIONS, spec)
    }

    pub fn head(&self, url: impl Into<UrlMatcher>, spec: ResponseSpec) -> Result<u64> {
        self.add(url, Method::HEAD, spec)
    }

    /// Remove a registered expectation by id.
    pub fn remove(&self, id: u64) -> bool {
        self.inner.registry.remove(id)
    }

    /// Expectations not yet consumed.
    pub fn pending(&self) -> usize {
        self.inner.registry.len()
    }

    // Observed calls

    /// Every call recorded during the current activation.
    pub fn requests(&self) -> HashMap<RequestKey, Vec<RecordedCall>> {
        self.inner.ledger.snapshot()
    }

    /// Calls recorded for `method` and `url`.
    pub fn calls(&self, method: &Method, url: &str) -> Vec<RecordedCall> {
        self.inner.ledger.calls(method, url)
    }

    /// Get total intercepted requests (passthrough excluded).
    pub fn total_requests(&self) -> u64 {
        self.inner.requests_total.load(Ordering::Relaxed)
    }

    /// Get total requests matched.
    pub fn total_matched(&self) -> u64 {
        self.inner.requests_matched.load(Ordering::Relaxed)
    }

    /// Get total requests unmatched.
    pub fn total_unmatched(&self) -> u64 {
        self.inner.requests_unmatched.load(Ordering::Relaxed)
    }

    /// Get total requests forwarded to the real transport.
    pub fn total_passthrough(&self) -> u64 {
        self.inner.requests_passthrough.load(Ordering::Relaxed)
    }

    fn is_passthrough(&self, url: &str) -> bool {
        self.inner
            .config
            .passthrough
            .iter()
            .any(|prefix| url.starts_with(prefix.as_str()))
    }

    fn track(&self, response: &Response) {
        self.inner.issued.lock().extend(response.release_handles());
    }
}

#[async_trait]
impl RequestHook for Interceptor {
    async fn handle(&self, session: &Session, request: Request) -> Result<Response> {
        if session.is_closed() {
            return Err(Error::SessionClosed);
        }

        let url = merge_params(&request.url, &request.options.params);

        if self.is_passthrough(&url) {
            debug!(method = %request.method, url = %url, "Passing request through");
            self.inner.requests_passthrough.fetch_add(1, Ordering::Relaxed);
            return session.transport().send(request).await;
        }

        self.inner.requests_total.fetch_add(1, Ordering::Relaxed);
        self.inner.ledger.record(&request.method, &url, &request.options);

        let result = Engine::new(&self.inner.registry, self.settings())
            .resolve(&request.method, &url, &request.options)
            .await;

        let response = match result {
            Ok(response) => response,
            Err(error) => {
                let counter = if error.is_connection_refused() {
                    &self.inner.requests_unmatched
                } else {
                    &self.inner.requests_matched
                };
                counter.fetch_add(1, Ordering::Relaxed);
                return Err(error);
            }
        };

        self.inner.requests_matched.fetch_add(1, Ordering::Relaxed);
        self.track(&response);

        let raise = request
            .options
            .raise_for_status
            .unwrap_or(self.inner.config.raise_for_status);
        if raise {
            response.raise_for_status()?;
        }
        Ok(response)
    }
}

impl fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interceptor")
            .field("active", &self.is_active())
            .field("pending", &self.pending())
            .field("passthrough", &self.inner.config.passthrough)
            .finish()
    }
}

/// Keeps an interceptor active; deactivates it when dropped.
#[must_use = "the interceptor is deactivated when the guard is dropped"]
pub struct InterceptorGuard {
    interceptor: Interceptor,
}

impl Deref for InterceptorGuard {
    type Target = Interceptor;

    fn deref(&self) -> &Interceptor {
        &self.interceptor
    }
}

impl Drop for InterceptorGuard {
    fn drop(&mut self) {
        if self.interceptor.is_active() {
            let _ = self.interceptor.stop();
        }
    }
}

/// Builder for [`Interceptor`].
#[derive(Debug, Default)]
pub struct InterceptorBuilder {
    config: InterceptorConfig,
}

impl InterceptorBuilder {
    /// Name reported on the span wrapping units of work.
    pub fn param(mut self, name: impl Into<String>) -> Self {
        self.config.param = Some(name.into());
        self
    }

    pub fn passthrough<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config
            .passthrough
            .extend(prefixes.into_iter().map(Into::into));
        self
    }

    pub fn raise_for_status(mut self, raise: bool) -> Self {
        self.config.raise_for_status = raise;
        self
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.config.settings = settings;
        self
    }

    pub fn build(self) -> Interceptor {
        Interceptor::new(self.config)
    }
}
