// Third Party
use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("failed to reach reporting endpoint: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("reporting endpoint rejected payload with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Delivers one serialized payload to the remote reporting endpoint.
#[async_trait]
pub trait ReportingSink: Send + Sync {
    async fn deliver(&self, payload: &str) -> Result<(), ReportError>;
}

/// Posts payloads as the single form field `data`. Only `200 OK` counts as delivered.
#[derive(Debug, Clone)]
pub struct HttpReportingSink {
    client: reqwest::Client,
    url: String,
}

impl HttpReportingSink {
    pub fn new(url: &str) -> Result<Self, anyhow::Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl ReportingSink for HttpReportingSink {
    async fn deliver(&self, payload: &str) -> Result<(), ReportError> {
        let response = self
            .client
            .post(&self.url)
            .form(&[("data", payload)])
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::OK {
            debug!("Delivered {} bytes to {}", payload.len(), self.url);
            return Ok(());
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|error| format!("<unreadable body: {}>", error));
        Err(ReportError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}
