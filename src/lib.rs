//! Mock Responses
//!
//! A test double for async HTTP clients. Requests issued through a
//! [`Session`] are intercepted and resolved against registered expectations
//! instead of reaching the network.
//!
//! # Features
//!
//! - **URL Matching**: Literal URLs compared after query normalization, or regex patterns
//! - **Ordered Expectations**: First match wins; one-shot unless marked `repeat`
//! - **Static Responses**: Status, headers, reason phrase, raw or JSON bodies
//! - **Dynamic Callbacks**: Sync or async callbacks that can override the response
//! - **Failure Injection**: Registered errors and simulated timeouts
//! - **Redirects**: Redirect chains followed through the registry, with history
//! - **Passthrough**: URL prefixes forwarded to the real transport
//! - **Call Ledger**: Every intercepted call recorded for assertions
//!
//! # Example
//!
//! ```no_run
//! # async fn demo() -> mock_responses::Result<()> {
//! use mock_responses::{InterceptionPoint, Interceptor, ResponseSpec, Session};
//!
//! let point = InterceptionPoint::new();
//! let session = Session::offline(&point);
//!
//! let mock = Interceptor::default();
//! let _guard = mock.activate(&point)?;
//! mock.get(
//!     "http://example.com/api?page=1&sort=asc",
//!     ResponseSpec::new().payload(serde_json::json!({"items": []})),
//! )?;
//!
//! let mut response = session.get("http://example.com/api?sort=asc&page=1").await?;
//! let body: serde_json::Value = response.json().await?;
//! assert_eq!(body["items"], serde_json::json!([]));
//! # Ok(())
//! # }
//! ```
//!
//! # Example Configuration
//!
//! ```yaml
//! passthrough:
//!   - http://localhost:8080
//! expectations:
//!   - url: http://example.com/hello
//!     method: GET
//!     repeat: true
//!     response:
//!       status: 200
//!       body:
//!         type: json
//!         content:
//!           message: "Hello, World!"
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod expectation;
pub mod interceptor;
pub mod ledger;
pub mod matcher;
pub mod normalize;
pub mod response;
pub mod session;

pub use config::{InterceptorConfig, Settings};
pub use error::{Error, Result};
pub use expectation::{Callback, CallbackResult, Delay, Expectation, Outcome, Raise, ResponseSpec};
pub use interceptor::{Interceptor, InterceptorBuilder, InterceptorGuard};
pub use ledger::{RecordedCall, RequestKey};
pub use matcher::UrlMatcher;
pub use normalize::{merge_params, normalize};
pub use response::{Cookie, Response, ResponseFactory, ResponseParts};
pub use session::{
    InterceptionPoint, OfflineTransport, Request, RequestBody, RequestHook, RequestOptions,
    Session, Transport,
};
