//! Configuration for an interceptor.
//!
//! Defines passthrough prefixes, logging settings, and expectations that can
//! be declared up front in YAML fixture files.

use crate::expectation::{validate_header, Delay, ResponseSpec};
use crate::matcher::UrlMatcher;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Main configuration for an interceptor.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct InterceptorConfig {
    /// Name of the span wrapping units of work run under the interceptor
    #[serde(default)]
    pub param: Option<String>,

    /// URL prefixes forwarded to the real transport
    #[serde(default)]
    pub passthrough: Vec<String>,

    /// Raise on non-2xx responses unless the call says otherwise
    #[serde(default)]
    pub raise_for_status: bool,

    /// Global settings
    #[serde(default)]
    pub settings: Settings,

    /// Expectations registered on every activation
    #[serde(default)]
    pub expectations: Vec<ExpectationDef>,
}

impl InterceptorConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (i, expectation) in self.expectations.iter().enumerate() {
            expectation
                .validate()
                .map_err(|e| anyhow::anyhow!("Expectation {}: {}", i, e))?;
        }
        Ok(())
    }
}

/// Global settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Log every matched expectation
    #[serde(default = "default_true")]
    pub log_matches: bool,

    /// Log calls no expectation matched
    #[serde(default = "default_true")]
    pub log_unmatched: bool,

    /// Content type for fixture responses that do not set one
    #[serde(default = "default_content_type")]
    pub default_content_type: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_matches: true,
            log_unmatched: true,
            default_content_type: default_content_type(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_content_type() -> String {
    "application/json".to_string()
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_status() -> u16 {
    200
}

/// An expectation declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExpectationDef {
    /// Literal URL (compared after normalization)
    #[serde(default)]
    pub url: Option<String>,

    /// Regex searched in the URL as issued
    #[serde(default)]
    pub pattern: Option<String>,

    /// HTTP method
    #[serde(default = "default_method")]
    pub method: String,

    /// Response to return
    #[serde(default)]
    pub response: ResponseDef,

    /// Keep matching after the first call
    #[serde(default)]
    pub repeat: bool,

    /// Raise a simulated timeout instead of responding
    #[serde(default)]
    pub timeout: bool,

    /// Latency simulation
    #[serde(default)]
    pub delay: Option<Delay>,
}

impl ExpectationDef {
    /// Validate the expectation definition.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.matcher()?;
        self.method()?;
        self.response.validate()
    }

    /// Build the URL matcher; exactly one of `url` and `pattern` must be set.
    pub fn matcher(&self) -> anyhow::Result<UrlMatcher> {
        match (&self.url, &self.pattern) {
            (Some(url), None) => Ok(UrlMatcher::literal(url)),
            (None, Some(pattern)) => {
                let regex = regex::Regex::new(pattern)
                    .map_err(|e| anyhow::anyhow!("Invalid regex: {}", e))?;
                Ok(UrlMatcher::Pattern(regex))
            }
            (Some(_), Some(_)) => anyhow::bail!("Only one of url and pattern may be set"),
            (None, None) => anyhow::bail!("One of url or pattern is required"),
        }
    }

    pub fn method(&self) -> anyhow::Result<http::Method> {
        http::Method::from_bytes(self.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| anyhow::anyhow!("Invalid method {}: {}", self.method, e))
    }

    /// Convert into registration options.
    pub fn to_spec(&self, settings: &Settings) -> anyhow::Result<ResponseSpec> {
        let response = &self.response;
        let content_type = response
            .content_type
            .clone()
            .or_else(|| response.body.as_ref().map(|b| b.content_type().to_string()))
            .unwrap_or_else(|| settings.default_content_type.clone());

        let mut spec = ResponseSpec::new()
            .status(response.status)
            .content_type(content_type)
            .headers(response.headers.clone())
            .repeat(self.repeat)
            .timeout(self.timeout);

        if let Some(body) = &response.body {
            spec = spec.body(body.to_bytes()?);
        }
        if let Some(reason) = &response.reason {
            spec = spec.reason(reason.clone());
        }
        if let Some(delay) = &self.delay {
            spec = spec.delay(delay.clone());
        }
        Ok(spec)
    }
}

/// Response definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseDef {
    /// HTTP status code
    #[serde(default = "default_status")]
    pub status: u16,

    /// Reason phrase (defaults to the standard phrase)
    #[serde(default)]
    pub reason: Option<String>,

    /// Content type (defaults to the body's, then the global default)
    #[serde(default)]
    pub content_type: Option<String>,

    /// Response headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Response body
    #[serde(default)]
    pub body: Option<BodyDef>,
}

impl Default for ResponseDef {
    fn default() -> Self {
        Self {
            status: default_status(),
            reason: None,
            content_type: None,
            headers: BTreeMap::new(),
            body: None,
        }
    }
}

impl ResponseDef {
    /// Validate the response definition.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.status < 100 || self.status > 999 {
            anyhow::bail!("Invalid status code: {}", self.status);
        }
        if let Some(content_type) = &self.content_type {
            validate_header("Content-Type", content_type)?;
        }
        for (name, value) in &self.headers {
            validate_header(name, value)?;
        }
        if let Some(body) = &self.body {
            body.to_bytes()?;
        }
        Ok(())
    }
}

/// Response body configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BodyDef {
    /// Plain text body
    Text { content: String },
    /// JSON body
    Json { content: serde_json::Value },
    /// Base64 encoded binary
    Base64 { content: String },
}

impl BodyDef {
    /// Get the body content as bytes.
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        match self {
            BodyDef::Text { content } => Ok(content.as_bytes().to_vec()),
            BodyDef::Json { content } => Ok(serde_json::to_vec(content)?),
            BodyDef::Base64 { content } => {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD
                    .decode(content)
                    .map_err(|e| anyhow::anyhow!("Invalid base64: {}", e))
            }
        }
    }

    /// Get content type for this body.
    pub fn content_type(&self) -> &'static str {
        match self {
            BodyDef::Text { .. } => "text/plain",
            BodyDef::Json { .. } => "application/json",
            BodyDef::Base64 { .. } => "application/octet-stream",
        }
    }
}
