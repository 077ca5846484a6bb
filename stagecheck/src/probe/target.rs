//! Probe targets and the responses they are expected to give.

use crate::core::has_references;
use crate::errors::TargetParseError;
use regex::Regex;
use reqwest::Url;

/// Strips the brackets `Url` keeps around IPv6 literals.
fn bare_host(host: &str) -> String {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
        .to_string()
}

/// Transport used to reach a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Plain HTTP GET.
    Http,
    /// HTTP GET over TLS.
    Https,
    /// TCP connect and close.
    Tcp,
}

impl Protocol {
    /// Returns the URL scheme.
    #[must_use]
    pub fn scheme(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Tcp => "tcp",
        }
    }
}

/// How a response body must look.
#[derive(Debug, Clone, Default)]
pub enum BodyMatch {
    /// Any body is accepted.
    #[default]
    Any,
    /// The body must equal this text exactly.
    Exact(String),
    /// The body must match this pattern.
    Pattern(Regex),
}

/// The response that counts as healthy for an HTTP target.
#[derive(Debug, Clone)]
pub struct ExpectedResponse {
    /// Required status code.
    pub status: u16,
    /// Required body.
    pub body: BodyMatch,
}

impl Default for ExpectedResponse {
    fn default() -> Self {
        Self {
            status: 200,
            body: BodyMatch::Any,
        }
    }
}

impl ExpectedResponse {
    /// Compares an observed response, describing the first mismatch.
    pub fn check(&self, status: u16, body: &str) -> Result<(), String> {
        if status != self.status {
            return Err(format!("expected status {}, got {}", self.status, status));
        }
        match &self.body {
            BodyMatch::Any => Ok(()),
            BodyMatch::Exact(expected) if body == expected => Ok(()),
            BodyMatch::Exact(expected) => Err(format!("expected body {expected:?}, got {body:?}")),
            BodyMatch::Pattern(pattern) if pattern.is_match(body) => Ok(()),
            BodyMatch::Pattern(pattern) => {
                Err(format!("body {body:?} does not match /{}/", pattern.as_str()))
            }
        }
    }
}

/// A fully resolved endpoint to poll.
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    protocol: Protocol,
    host: String,
    port: u16,
    path: String,
    expected: ExpectedResponse,
}

impl ProbeTarget {
    /// Parses `http://`, `https://` or `tcp://` targets.
    ///
    /// Targets that still hold a `${...}` reference are rejected: a probe
    /// target must be resolved before polling starts.
    pub fn parse(target: &str) -> Result<Self, TargetParseError> {
        if has_references(target) {
            return Err(TargetParseError::Unresolved(target.to_string()));
        }
        let url = Url::parse(target).map_err(|e| TargetParseError::InvalidUrl {
            target: target.to_string(),
            reason: e.to_string(),
        })?;

        let protocol = match url.scheme() {
            "http" => Protocol::Http,
            "https" => Protocol::Https,
            "tcp" => Protocol::Tcp,
            other => return Err(TargetParseError::UnsupportedScheme(other.to_string())),
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .map(bare_host)
            .ok_or_else(|| TargetParseError::MissingHost(target.to_string()))?;
        let port = match protocol {
            Protocol::Tcp => url
                .port()
                .ok_or_else(|| TargetParseError::MissingPort(target.to_string()))?,
            Protocol::Http => url.port().unwrap_or(80),
            Protocol::Https => url.port().unwrap_or(443),
        };
        let path = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };

        Ok(Self {
            protocol,
            host,
            port,
            path,
            expected: ExpectedResponse::default(),
        })
    }

    /// Creates a TCP target.
    #[must_use]
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        let host: String = host.into();
        Self {
            protocol: Protocol::Tcp,
            host: bare_host(&host),
            port,
            path: String::new(),
            expected: ExpectedResponse::default(),
        }
    }

    /// Requires a specific status code.
    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.expected.status = status;
        self
    }

    /// Requires the body to equal `body` exactly.
    #[must_use]
    pub fn with_exact_body(mut self, body: impl Into<String>) -> Self {
        self.expected.body = BodyMatch::Exact(body.into());
        self
    }

    /// Requires the body to match a regular expression.
    pub fn with_body_pattern(mut self, pattern: &str) -> Result<Self, TargetParseError> {
        let regex = Regex::new(pattern).map_err(|e| TargetParseError::InvalidPattern(e.to_string()))?;
        self.expected.body = BodyMatch::Pattern(regex);
        Ok(self)
    }

    /// Returns the protocol.
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Returns the host; IPv6 literals come without brackets.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the HTTP path (empty for TCP).
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the expected response.
    #[must_use]
    pub fn expected(&self) -> &ExpectedResponse {
        &self.expected
    }

    /// Renders the target as a URL.
    #[must_use]
    pub fn url(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        match self.protocol {
            Protocol::Tcp => format!("tcp://{}:{}", host, self.port),
            Protocol::Http | Protocol::Https => {
                let default_port = if self.protocol == Protocol::Http { 80 } else { 443 };
                let path = if self.path.is_empty() { "/" } else { self.path.as_str() };
                if self.port == default_port {
                    format!("{}://{}{}", self.protocol.scheme(), host, path)
                } else {
                    format!("{}://{}:{}{}", self.protocol.scheme(), host, self.port, path)
                }
            }
        }
    }
}

impl std::fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.url())
    }
}
