//! The HTTP transport seam: executes a single request and reports parsed
//! rate-limit headers. The concrete transport is abstracted behind
//! [`HttpTransport`] so the Helix core can be driven by a fake in tests.

mod reqwest_transport;

pub use reqwest_transport::ReqwestTransport;

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;

/// A query parameter value: a single string, or repeated values emitted as
/// repeated query parameters in insertion order.
#[derive(Debug, Clone)]
pub enum QueryValue {
    Single(String),
    Multi(Vec<String>),
}

impl From<&str> for QueryValue {
    fn from(s: &str) -> Self {
        QueryValue::Single(s.to_string())
    }
}

impl From<String> for QueryValue {
    fn from(s: String) -> Self {
        QueryValue::Single(s)
    }
}

/// A single HTTP request to execute.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: &'static str,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, QueryValue)>,
    pub body: Option<Value>,
    pub cancel: Option<CancellationToken>,
}

impl FetchRequest {
    pub fn new(method: &'static str, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
            cancel: None,
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<QueryValue>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Parsed `Ratelimit-Limit` / `Ratelimit-Remaining` / `Ratelimit-Reset`
/// headers. Their absence from a response is a fatal transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u32,
    pub remaining: u32,
    /// Unix seconds at which the window resets.
    pub reset: i64,
}

/// The result of executing a [`FetchRequest`].
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub body: Option<Value>,
    pub rate_limit: RateLimitHeaders,
}

/// Executes a single HTTP request. Implementations must cooperate with
/// `cancel` and must surface missing rate-limit headers as
/// [`TransportError::MissingRateLimitHeaders`].
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, TransportError>;
}

pub(crate) fn extract_rate_limit_headers(
    headers: &HashMap<String, String>,
) -> Result<RateLimitHeaders, TransportError> {
    let get = |name: &str| {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    };

    let limit = get("Ratelimit-Limit").ok_or(TransportError::MissingRateLimitHeaders)?;
    let remaining = get("Ratelimit-Remaining").ok_or(TransportError::MissingRateLimitHeaders)?;
    let reset = get("Ratelimit-Reset").ok_or(TransportError::MissingRateLimitHeaders)?;

    let limit = limit
        .parse()
        .map_err(|_| TransportError::MissingRateLimitHeaders)?;
    let remaining = remaining
        .parse()
        .map_err(|_| TransportError::MissingRateLimitHeaders)?;
    let reset = reset
        .parse()
        .map_err(|_| TransportError::MissingRateLimitHeaders)?;

    Ok(RateLimitHeaders {
        limit,
        remaining,
        reset,
    })
}
