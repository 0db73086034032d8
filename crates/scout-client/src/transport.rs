use std::time::Duration;

use reqwest::{Client, Proxy, redirect};
use scout_core::config::ScanConfig;
use scout_core::error::AppError;
use scout_core::models::HttpResponse;
use scout_core::rotator::HeaderSet;
use scout_core::traits::Transport;

const REDIRECT_LIMIT: usize = 10;

/// HTTP transport using reqwest.
///
/// Follows redirects, honours an optional HTTP/HTTPS/SOCKS5 proxy, and reads
/// at most `max_body_bytes` of each body. Any status is returned as a
/// response; only connection-level failures are errors.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    max_body_bytes: usize,
}

impl ReqwestTransport {
    pub fn new(config: &ScanConfig) -> Result<Self, AppError> {
        let mut builder = Client::builder()
            .timeout(config.attempt_timeout)
            .redirect(redirect::Policy::limited(REDIRECT_LIMIT));

        if let Some(proxy) = &config.proxy {
            let proxy = Proxy::all(proxy)
                .map_err(|e| AppError::ConfigError(format!("Invalid proxy '{proxy}': {e}")))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| AppError::ConfigError(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            max_body_bytes: config.max_scan_bytes,
        })
    }

    pub fn with_max_body_bytes(mut self, max: usize) -> Self {
        self.max_body_bytes = max;
        self
    }
}

impl Transport for ReqwestTransport {
    async fn get(
        &self,
        url: &str,
        headers: &HeaderSet,
        timeout: Duration,
    ) -> Result<HttpResponse, AppError> {
        let mut request = self.client.get(url).timeout(timeout);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let mut response = request
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;
        let status = response.status().as_u16();

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?
        {
            let room = self.max_body_bytes.saturating_sub(body.len());
            if chunk.len() >= room {
                body.extend_from_slice(&chunk[..room]);
                tracing::debug!(%url, max_bytes = self.max_body_bytes, "Body truncated");
                break;
            }
            body.extend_from_slice(&chunk);
        }

        Ok(HttpResponse::new(
            status,
            String::from_utf8_lossy(&body).into_owned(),
        ))
    }
}

fn map_reqwest_error(e: reqwest::Error, timeout: Duration) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(timeout.as_millis() as u64)
    } else if e.is_builder() {
        AppError::InvalidUrl(e.to_string())
    } else if e.is_connect() {
        AppError::NetworkError(format!("Connection failed: {e}"))
    } else {
        AppError::NetworkError(e.to_string())
    }
}
