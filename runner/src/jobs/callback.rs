//! Callback delivery of deployment logs

use std::time::Duration;

use reqwest::{header, Client};
use tracing::{debug, error};

use crate::errors::RunnerError;

/// Posts log text to the caller-supplied callback URL
#[derive(Debug, Clone)]
pub struct CallbackClient {
    client: Client,
    url: String,
}

impl CallbackClient {
    /// Create a client for `url`
    pub fn new(url: &str, timeout: Duration) -> Result<Self, RunnerError> {
        let parsed = url::Url::parse(url)
            .map_err(|e| RunnerError::InvalidInput(format!("Invalid callback URL {url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(RunnerError::InvalidInput(format!(
                "Unsupported callback scheme: {}",
                parsed.scheme()
            )));
        }

        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// POST `body` as `text/plain`
    pub async fn push(&self, body: String) -> Result<(), RunnerError> {
        debug!("POST {} ({} bytes)", self.url, body.len());

        let response = self
            .client
            .post(&self.url)
            .header(header::CONTENT_TYPE, "text/plain")
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            error!("Callback POST failed: {} - {}", status, text);
            return Err(RunnerError::ServerError(format!("{}: {}", status, text)));
        }
        Ok(())
    }
}
