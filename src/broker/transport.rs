//! Downstream transport - one call per batch
//!
//! The broker only needs "send these id-tagged requests, get back replies".
//! `HttpTransport` does that over HTTP with a JSON array body.
//!
//! ## Status handling
//!
//! - `202 Accepted`: body is a JSON array of replies
//! - `204 No Content`: no replies, body not read
//! - anything else: the body (or `"<code>: error"` if empty) becomes the error

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use tracing::{instrument, trace};

use crate::error::{BAD_REQUEST_CODE, INTERNAL_CODE, RuntimeError};

use super::messages::{ExchangeRequest, ExchangeResponse};

/// Carries one batch of requests to the collector
#[async_trait]
pub trait Transport: Send + Sync {
    async fn exchange(
        &self,
        requests: &[ExchangeRequest],
    ) -> Result<Vec<ExchangeResponse>, RuntimeError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    method: Method,
    url: String,
}

impl HttpTransport {
    pub fn new(method: &str, url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|e| anyhow::anyhow!("invalid exchange method '{method}': {e}"))?;

        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            method,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip_all, fields(url = %self.url, batch = requests.len()))]
    async fn exchange(
        &self,
        requests: &[ExchangeRequest],
    ) -> Result<Vec<ExchangeResponse>, RuntimeError> {
        let body = serde_json::to_vec(requests)
            .map_err(|e| RuntimeError::new(BAD_REQUEST_CODE, e.to_string()))?;

        trace!("exchanging {} bytes", body.len());

        let response = self
            .client
            .request(self.method.clone(), &self.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| RuntimeError::new(INTERNAL_CODE, format!("get failed, {e}")))?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }

        if status != StatusCode::ACCEPTED {
            let code = i32::from(status.as_u16());
            let text = response.text().await.unwrap_or_default();
            if text.is_empty() {
                return Err(RuntimeError::new(code, format!("{code}: error")));
            }
            return Err(RuntimeError::new(code, text));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| RuntimeError::new(INTERNAL_CODE, e.to_string()))?;
        if bytes.is_empty() {
            let code = i32::from(status.as_u16());
            return Err(RuntimeError::new(code, format!("{code}: error")));
        }

        serde_json::from_slice(&bytes).map_err(|e| RuntimeError::new(INTERNAL_CODE, e.to_string()))
    }
}
