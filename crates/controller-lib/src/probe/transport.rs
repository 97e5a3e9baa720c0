//! HTTP transport used by the endpoint prober

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// How a probe request failed before a status code was received
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The attempt used up its whole timeout
    Timeout,
    /// Nothing is listening on the port yet
    ConnectionRefused,
    /// DNS, reset, TLS and other connection-level failures
    Connect,
    Other,
}

impl FailureKind {
    /// A terminal failure ends the probe instead of consuming another attempt
    pub fn is_terminal(&self) -> bool {
        matches!(self, FailureKind::Timeout)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::ConnectionRefused => "connection_refused",
            FailureKind::Connect => "connect",
            FailureKind::Other => "other",
        }
    }
}

/// Transport-level probe failure
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    pub kind: FailureKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify from the error text when the client gives nothing better
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        let kind = if lower.contains("timed out") || lower.contains("timeout") {
            FailureKind::Timeout
        } else if lower.contains("connection refused") {
            FailureKind::ConnectionRefused
        } else if lower.contains("connect") || lower.contains("dns") {
            FailureKind::Connect
        } else {
            FailureKind::Other
        };
        Self { kind, message }
    }
}

/// Issues a single GET and reports the status code
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    async fn get(&self, url: &str, timeout: Duration) -> Result<u16, TransportError>;
}

/// reqwest-backed transport
#[derive(Debug, Clone)]
pub struct HttpProbeTransport {
    client: reqwest::Client,
}

impl HttpProbeTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("smscale/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()
            .map_err(|e| TransportError::new(FailureKind::Other, e.to_string()))?;
        Ok(Self { client })
    }

    fn classify(err: reqwest::Error) -> TransportError {
        // reqwest wraps the io error, so the source chain carries the detail
        let mut detail = err.to_string();
        let mut source = std::error::Error::source(&err);
        while let Some(inner) = source {
            detail.push_str(": ");
            detail.push_str(&inner.to_string());
            source = inner.source();
        }

        if err.is_timeout() {
            return TransportError::new(FailureKind::Timeout, detail);
        }
        let classified = TransportError::from_message(detail);
        if err.is_connect() && classified.kind == FailureKind::Other {
            return TransportError::new(FailureKind::Connect, classified.message);
        }
        classified
    }
}

#[async_trait]
impl ProbeTransport for HttpProbeTransport {
    async fn get(&self, url: &str, timeout: Duration) -> Result<u16, TransportError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(Self::classify)?;
        Ok(response.status().as_u16())
    }
}
