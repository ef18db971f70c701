use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Method;

use super::{extract_rate_limit_headers, FetchRequest, FetchResponse, HttpTransport, QueryValue};
use crate::error::TransportError;

/// Default [`HttpTransport`] backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, TransportError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| TransportError::InvalidHeader("method".to_string()))?;

        let mut builder = self.client.request(method, &request.url);

        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }

        let mut pairs: Vec<(String, String)> = Vec::new();
        for (key, value) in &request.query {
            match value {
                QueryValue::Single(v) => pairs.push((key.clone(), v.clone())),
                QueryValue::Multi(values) => {
                    for v in values {
                        pairs.push((key.clone(), v.clone()));
                    }
                }
            }
        }
        if !pairs.is_empty() {
            builder = builder.query(&pairs);
        }

        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let send_fut = builder.send();

        let response = if let Some(cancel) = &request.cancel {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                result = send_fut => result?,
            }
        } else {
            send_fut.await?
        };

        let status = response.status().as_u16();

        let mut headers = HashMap::new();
        for (key, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(key.as_str().to_string(), v.to_string());
            }
        }
        let rate_limit = extract_rate_limit_headers(&headers)?;

        let bytes = if let Some(cancel) = &request.cancel {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                result = response.bytes() => result?,
            }
        } else {
            response.bytes().await?
        };

        let body = if bytes.is_empty() {
            None
        } else {
            Some(serde_json::from_slice(&bytes).map_err(|e| {
                TransportError::InvalidHeader(format!("response body was not valid JSON: {e}"))
            })?)
        };

        Ok(FetchResponse {
            status,
            body,
            rate_limit,
        })
    }
}
