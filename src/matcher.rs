//! URL matching and the ordered expectation registry.

use crate::expectation::Expectation;
use crate::normalize::normalize;
use http::Method;
use parking_lot::Mutex;
use regex::Regex;
use std::fmt;
use std::sync::Arc;

/// How an expectation decides whether a URL is the one it expects.
#[derive(Clone)]
pub enum UrlMatcher {
    /// Equality against the normalized URL.
    Literal(String),
    /// Regex search against the URL as issued.
    Pattern(Regex),
}

impl UrlMatcher {
    pub fn literal(url: &str) -> Self {
        UrlMatcher::Literal(normalize(url))
    }

    pub fn pattern(regex: Regex) -> Self {
        UrlMatcher::Pattern(regex)
    }

    pub fn matches(&self, url: &str) -> bool {
        match self {
            UrlMatcher::Literal(expected) => *expected == normalize(url),
            UrlMatcher::Pattern(regex) => regex.is_match(url),
        }
    }
}

impl fmt::Debug for UrlMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UrlMatcher::Literal(url) => f.debug_tuple("Literal").field(url).finish(),
            UrlMatcher::Pattern(regex) => f.debug_tuple("Pattern").field(&regex.as_str()).finish(),
        }
    }
}

impl fmt::Display for UrlMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UrlMatcher::Literal(url) => f.write_str(url),
            UrlMatcher::Pattern(regex) => write!(f, "/{}/", regex.as_str()),
        }
    }
}

impl From<&str> for UrlMatcher {
    fn from(url: &str) -> Self {
        UrlMatcher::literal(url)
    }
}

impl From<String> for UrlMatcher {
    fn from(url: String) -> Self {
        UrlMatcher::literal(&url)
    }
}

impl From<&String> for UrlMatcher {
    fn from(url: &String) -> Self {
        UrlMatcher::literal(url)
    }
}

impl From<url::Url> for UrlMatcher {
    fn from(url: url::Url) -> Self {
        UrlMatcher::literal(url.as_str())
    }
}

impl From<Regex> for UrlMatcher {
    fn from(regex: Regex) -> Self {
        UrlMatcher::Pattern(regex)
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    expectations: Vec<Arc<Expectation>>,
    next_id: u64,
}

/// Ordered collection of expectations; first match wins.
///
/// Lookup and consumption happen under one lock with no suspension point in
/// between, so a non-repeating expectation can be claimed only once.
#[derive(Debug, Default)]
pub struct Registry {
    state: Mutex<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an expectation, returning the id assigned to it.
    pub fn push(&self, mut expectation: Expectation) -> u64 {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        expectation.set_id(id);
        state.expectations.push(Arc::new(expectation));
        id
    }

    /// Find the first expectation matching the call; a non-repeating match
    /// is removed from the registry before it is returned.
    pub fn take_match(&self, method: &Method, url: &str) -> Option<Arc<Expectation>> {
        let mut state = self.state.lock();
        let index = state
            .expectations
            .iter()
            .position(|exp| exp.matches(method, url))?;

        if state.expectations[index].is_repeat() {
            Some(Arc::clone(&state.expectations[index]))
        } else {
            Some(state.expectations.remove(index))
        }
    }

    /// Remove an expectation by id.
    pub fn remove(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        let before = state.expectations.len();
        state.expectations.retain(|exp| exp.id() != id);
        state.expectations.len() != before
    }

    pub fn clear(&self) {
        self.state.lock().expectations.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().expectations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expectation::ResponseSpec;

    fn register(
        registry: &Registry,
        method: Method,
        matcher: UrlMatcher,
        spec: ResponseSpec,
    ) -> u64 {
        registry.push(Expectation::new(method, matcher, spec).unwrap())
    }

    #[test]
    fn test_literal_matching_ignores_query_order() {
        let matcher = UrlMatcher::from("http://example.com/api?b=2&a=1");
        assert!(matcher.matches("http://example.com/api?a=1&b=2"));
        assert!(!matcher.matches("http://example.com/api?a=1"));
    }

    #[test]
    fn test_pattern_matching_uses_raw_url() {
        let matcher = UrlMatcher::from(Regex::new(r"^http://example\.com/api\?foo=.*$").unwrap());
        assert!(matcher.matches("http://example.com/api?foo=bar#fragment"));

        let matcher =
            UrlMatcher::from(Regex::new(r"^http://exampleexample\.com/api\?foo=.*$").unwrap());
        assert!(!matcher.matches("http://example.com/api?foo=bar#fragment"));
    }

    #[test]
    fn test_first_match_wins_and_is_consumed() {
        let registry = Registry::new();
        let url = "http://example.com/api";
        let first = register(&registry, Method::GET, url.into(), ResponseSpec::new().status(200));
        let second = register(&registry, Method::GET, url.into(), ResponseSpec::new().status(201));

        assert_eq!(registry.take_match(&Method::GET, url).unwrap().id(), first);
        assert_eq!(registry.take_match(&Method::GET, url).unwrap().id(), second);
        assert!(registry.take_match(&Method::GET, url).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_repeat_expectation_persists() {
        let registry = Registry::new();
        let url = "http://example.com/api";
        let id = register(&registry, Method::GET, url.into(), ResponseSpec::new().repeat(true));

        for _ in 0..5 {
            assert_eq!(registry.take_match(&Method::GET, url).unwrap().id(), id);
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_method_mismatch_skips() {
        let registry = Registry::new();
        let url = "http://example.com/api";
        register(&registry, Method::GET, url.into(), ResponseSpec::new());
        assert!(registry.take_match(&Method::POST, url).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_and_clear() {
        let registry = Registry::new();
        let id = register(&registry, Method::GET, "http://a/".into(), ResponseSpec::new());
        register(&registry, Method::GET, "http://b/".into(), ResponseSpec::new());

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert_eq!(registry.len(), 1);

        registry.clear();
        assert!(registry.is_empty());
    }
}
