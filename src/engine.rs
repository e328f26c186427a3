//! Resolution engine.
//!
//! Turns a live call into a response or an error by consulting the
//! [`Registry`], following redirect chains when asked to.

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::expectation::Outcome;
use crate::matcher::Registry;
use crate::response::Response;
use crate::session::RequestOptions;
use http::header::LOCATION;
use http::{Method, StatusCode};
use tracing::{debug, info, warn};

/// Status codes that trigger redirect following.
const REDIRECT_CODES: [StatusCode; 5] = [
    StatusCode::MOVED_PERMANENTLY,
    StatusCode::FOUND,
    StatusCode::SEE_OTHER,
    StatusCode::TEMPORARY_REDIRECT,
    StatusCode::PERMANENT_REDIRECT,
];

/// Resolves calls against a registry.
pub struct Engine<'a> {
    registry: &'a Registry,
    settings: &'a Settings,
}

impl<'a> Engine<'a> {
    pub fn new(registry: &'a Registry, settings: &'a Settings) -> Self {
        Self { registry, settings }
    }

    /// Resolve a call, following redirects when `options.allow_redirects`.
    ///
    /// Each hop re-scans the registry as it stands after the previous hop
    /// consumed its expectation; a hop nothing matches fails with
    /// [`Error::ConnectionRefused`] naming that hop's method and URL.
    pub async fn resolve(
        &self,
        method: &Method,
        url: &str,
        options: &RequestOptions,
    ) -> Result<Response> {
        let mut method = method.clone();
        let mut url = url.to_string();
        let mut history = Vec::new();

        loop {
            let Some(expectation) = self.registry.take_match(&method, &url) else {
                if self.settings.log_unmatched {
                    warn!(method = %method, url = %url, "No matching expectation found");
                }
                return Err(Error::ConnectionRefused { method, url });
            };

            if self.settings.log_matches {
                info!(
                    expectation = expectation.id(),
                    method = %method,
                    url = %url,
                    matcher = %expectation.matcher(),
                    "Request matched expectation"
                );
            }

            let mut response = match expectation.resolve(&method, &url, options).await {
                Outcome::Response(response) => response,
                Outcome::Failure(error) => return Err(error),
            };

            if options.allow_redirects && REDIRECT_CODES.contains(&response.status()) {
                if let Some(location) = redirect_target(&response) {
                    debug!(
                        status = response.status().as_u16(),
                        from = %url,
                        to = %location,
                        "Following redirect"
                    );
                    history.push(response);
                    url = location;
                    method = Method::GET;
                    continue;
                }
            }

            response.set_history(history);
            return Ok(response);
        }
    }
}

/// The next URL of a redirect, joined against the response URL when relative.
fn redirect_target(response: &Response) -> Option<String> {
    let location = response.headers().get(LOCATION)?.to_str().ok()?;
    match url::Url::parse(location) {
        Ok(_) => Some(location.to_string()),
        Err(url::ParseError::RelativeUrlWithoutBase) => url::Url::parse(response.url())
            .and_then(|base| base.join(location))
            .map(String::from)
            .ok(),
        Err(_) => Some(location.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expectation::{Expectation, ResponseSpec};
    use crate::matcher::UrlMatcher;

    fn register(registry: &Registry, url: &str, spec: ResponseSpec) {
        registry.push(Expectation::new(Method::GET, UrlMatcher::from(url), spec).unwrap());
    }

    #[tokio::test]
    async fn test_follows_redirect_with_history() {
        let registry = Registry::new();
        let settings = Settings::default();
        register(
            &registry,
            "http://example.com/start",
            ResponseSpec::new()
                .status(307)
                .header("Location", "https://target"),
        );
        register(&registry, "https://target", ResponseSpec::new().status(200));

        let response = Engine::new(&registry, &settings)
            .resolve(&Method::GET, "http://example.com/start", &RequestOptions::default())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.url(), "https://target");
        assert_eq!(response.history().len(), 1);
        assert_eq!(response.history()[0].status().as_u16(), 307);
        assert_eq!(response.history()[0].url(), "http://example.com/start");
    }

    #[tokio::test]
    async fn test_redirect_forces_get() {
        let registry = Registry::new();
        let settings = Settings::default();
        registry.push(
            Expectation::new(
                Method::POST,
                "http://example.com/form".into(),
                ResponseSpec::new().status(303).header("Location", "/done"),
            )
            .unwrap(),
        );
        register(&registry, "http://example.com/done", ResponseSpec::new().status(200));

        let response = Engine::new(&registry, &settings)
            .resolve(&Method::POST, "http://example.com/form", &RequestOptions::default())
            .await
            .unwrap();

        assert_eq!(*response.method(), Method::GET);
        assert_eq!(response.url(), "http://example.com/done");
    }

    #[tokio::test]
    async fn test_redirect_without_location_is_final() {
        let registry = Registry::new();
        let settings = Settings::default();
        register(&registry, "http://example.com/", ResponseSpec::new().status(302));

        let response = Engine::new(&registry, &settings)
            .resolve(&Method::GET, "http://example.com/", &RequestOptions::default())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        assert!(response.history().is_empty());
    }

    #[tokio::test]
    async fn test_redirects_not_followed_when_disabled() {
        let registry = Registry::new();
        let settings = Settings::default();
        register(
            &registry,
            "http://example.com/",
            ResponseSpec::new().status(301).header("Location", "http://other/"),
        );

        let response = Engine::new(&registry, &settings)
            .resolve(
                &Method::GET,
                "http://example.com/",
                &RequestOptions::default().allow_redirects(false),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    }

    #[tokio::test]
    async fn test_unmatched_hop_reports_redirected_url() {
        let registry = Registry::new();
        let settings = Settings::default();
        register(
            &registry,
            "http://example.com/",
            ResponseSpec::new().status(308).header("Location", "http://nowhere/next"),
        );

        let err = Engine::new(&registry, &settings)
            .resolve(&Method::POST, "http://example.com/", &RequestOptions::default())
            .await;
        // POST expectation was never registered
        assert!(matches!(err, Err(Error::ConnectionRefused { .. })));

        let err = Engine::new(&registry, &settings)
            .resolve(&Method::GET, "http://example.com/", &RequestOptions::default())
            .await
            .unwrap_err();
        match err {
            Error::ConnectionRefused { method, url } => {
                assert_eq!(method, Method::GET);
                assert_eq!(url, "http://nowhere/next");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_redirect_loop_terminates_on_exhaustion() {
        let registry = Registry::new();
        let settings = Settings::default();
        register(
            &registry,
            "http://example.com/loop",
            ResponseSpec::new().status(302).header("Location", "http://example.com/loop"),
        );
        register(
            &registry,
            "http://example.com/loop",
            ResponseSpec::new().status(302).header("Location", "http://example.com/loop"),
        );

        let err = Engine::new(&registry, &settings)
            .resolve(&Method::GET, "http://example.com/loop", &RequestOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_connection_refused());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_error_is_not_redirected() {
        #[derive(Debug, thiserror::Error)]
        #[error("boom")]
        struct Boom;

        let registry = Registry::new();
        let settings = Settings::default();
        register(
            &registry,
            "http://example.com/",
            ResponseSpec::new()
                .status(302)
                .header("Location", "http://example.com/next")
                .exception(Boom),
        );

        let err = Engine::new(&registry, &settings)
            .resolve(&Method::GET, "http://example.com/", &RequestOptions::default())
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<Boom>().is_some());
    }
}
