//! HTTP client for the chat backend

use crate::error::{ClientError, ClientResult};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::NaiveDate;
use futures::stream::{Stream, StreamExt};
use parlor_core::config::BackendConfig;
use parlor_core::session::{NotifyError, Rating, SessionNotifier};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, info};

/// Raw body of a streaming reply
pub type ByteStream = Pin<Box<dyn Stream<Item = ClientResult<Bytes>> + Send>>;

/// Opens streaming chat requests
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send one message and return the response body as it arrives
    async fn open_stream(&self, message: &str, session_id: &str) -> ClientResult<ByteStream>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    message: &'a str,
    session_id: &'a str,
}

#[derive(Serialize)]
struct FeedbackRequest<'a> {
    session_id: &'a str,
    rating: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    comment: Option<&'a str>,
}

#[derive(Serialize)]
struct ResetRequest<'a> {
    session_id: &'a str,
}

/// Reply of `GET /health`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub service: Option<String>,
}

/// Reply of `GET /stats`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BackendStats {
    pub active_memory_sessions: u64,
    pub total_sessions: u64,
    pub total_conversations: u64,
    pub today_conversations: u64,
}

/// Client for the chat, feedback, export and reset endpoints
#[derive(Debug, Clone)]
pub struct ChatBackend {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl ChatBackend {
    /// Create a client for `base_url`
    ///
    /// `timeout` bounds every request except the chat stream, which runs for
    /// as long as the backend keeps sending.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> ClientResult<Self> {
        let client = Client::builder().connect_timeout(timeout).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    pub fn from_config(config: &BackendConfig) -> ClientResult<Self> {
        Self::new(&config.base_url, Duration::from_secs(config.timeout_secs))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Submit a rating for a reply in `session_id`
    pub async fn submit_feedback(
        &self,
        session_id: &str,
        rating: Rating,
        comment: Option<&str>,
    ) -> ClientResult<()> {
        let body = FeedbackRequest {
            session_id,
            rating: rating.score(),
            comment,
        };
        let response = self
            .client
            .post(self.url("/feedback"))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;
        check_status(response).await?;
        debug!(session_id, rating = rating.score(), "Feedback submitted");
        Ok(())
    }

    /// Fetch the full exportable history
    pub async fn export(&self) -> ClientResult<Value> {
        let response = self
            .client
            .get(self.url("/export"))
            .timeout(self.timeout)
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    /// Export history into `dir` as `chat_history_<date>.json`
    pub async fn export_to_file(&self, dir: &Path, date: NaiveDate) -> ClientResult<PathBuf> {
        let history = self.export().await?;
        tokio::fs::create_dir_all(dir).await?;

        let path = dir.join(export_file_name(date));
        tokio::fs::write(&path, serde_json::to_vec_pretty(&history)?).await?;
        info!(path = %path.display(), "Exported chat history");
        Ok(path)
    }

    /// Tell the backend to forget a session
    pub async fn reset(&self, session_id: &str) -> ClientResult<()> {
        let response = self
            .client
            .post(self.url("/reset"))
            .timeout(self.timeout)
            .json(&ResetRequest { session_id })
            .send()
            .await?;
        check_status(response).await?;
        debug!(session_id, "Backend session reset");
        Ok(())
    }

    /// Check that the backend is up
    pub async fn health(&self) -> ClientResult<HealthStatus> {
        let response = self
            .client
            .get(self.url("/health"))
            .timeout(self.timeout)
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    /// Fetch conversation statistics
    pub async fn stats(&self) -> ClientResult<BackendStats> {
        let response = self
            .client
            .get(self.url("/stats"))
            .timeout(self.timeout)
            .send()
            .await?;
        let value: Value = check_status(response).await?.json().await?;

        // The stats endpoint reports its own failures in a 200 body.
        if let Some(error) = value.get("error").and_then(Value::as_str) {
            return Err(ClientError::Api(error.to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }
}

#[async_trait]
impl ChatTransport for ChatBackend {
    async fn open_stream(&self, message: &str, session_id: &str) -> ClientResult<ByteStream> {
        debug!(
            session_id,
            message_len = message.len(),
            "Opening chat stream to {}",
            self.base_url
        );
        let response = self
            .client
            .post(self.url("/chat/stream"))
            .json(&ChatRequest {
                message,
                session_id,
            })
            .send()
            .await?;
        let response = check_status(response).await?;

        Ok(Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(ClientError::from)),
        ))
    }
}

#[async_trait]
impl SessionNotifier for ChatBackend {
    async fn session_deleted(&self, session_id: &str) -> Result<(), NotifyError> {
        self.reset(session_id).await.map_err(NotifyError::from)
    }
}

/// Name of the export file for `date`
pub fn export_file_name(date: NaiveDate) -> String {
    format!("chat_history_{}.json", date.format("%Y-%m-%d"))
}

async fn check_status(response: Response) -> ClientResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let error_text = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(ClientError::Api(format!("HTTP {}: {}", status, error_text)))
}
