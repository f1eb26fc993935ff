//! HTTP client for the conversation and recognition server

mod events;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use events::{SseEvent, SseParser};

use crate::config::Settings;
use crate::vision::{RecognitionBackend, SpotResult, Stage, StageReport};
use crate::{Error, Result};

/// Timeout for utterance uploads
const AUDIO_UPLOAD_TIMEOUT: Duration = Duration::from_secs(3);

/// Timeout for image uploads and card spotting
const IMAGE_UPLOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for short JSON requests
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Conversation task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Serialize)]
struct ResetConversationRequest<'a> {
    system_message: &'a str,
}

#[derive(Debug, Deserialize)]
struct ResetConversationResponse {
    status: ConversationStatus,
}

#[derive(Debug, Deserialize)]
struct ServerStatusResponse {
    status: String,
}

#[derive(Debug, Deserialize)]
struct UploadImageResponse {
    status: Stage,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    reading: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskStatusResponse {
    status: TaskStatusBody,
}

#[derive(Debug, Deserialize)]
struct TaskStatusBody {
    status: Stage,
    #[serde(default)]
    reading: Option<String>,
}

/// Client for the Seer backend
#[derive(Debug, Clone)]
pub struct BackendClient {
    client: reqwest::Client,
    base_url: String,
}

impl BackendClient {
    /// Create a client for `base_url`
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Upload an utterance with the reply parameters
    ///
    /// Returns the raw reply body; replies are normally streamed through
    /// [`Self::response_events`] instead.
    ///
    /// # Errors
    ///
    /// Returns error if the request fails, times out or is rejected
    pub async fn upload_audio(&self, audio: Vec<u8>, settings: &Settings) -> Result<Vec<u8>> {
        tracing::debug!(audio_bytes = audio.len(), "uploading utterance");

        let form = reqwest::multipart::Form::new()
            .part(
                "audio",
                reqwest::multipart::Part::bytes(audio)
                    .file_name("audio.wav")
                    .mime_str("audio/wav")?,
            )
            .text("prompt", settings.prompt.clone())
            .text("temperature", settings.temperature.to_string())
            .text("max_new_tokens", settings.max_tokens.to_string());

        let response = self
            .client
            .post(self.url("/upload-audio"))
            .multipart(form)
            .timeout(AUDIO_UPLOAD_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "utterance upload failed");
                e
            })?;

        let response = check_status(response, "upload-audio").await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Reset the conversation with a new system message
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the reply is malformed
    pub async fn reset_conversation(&self, system_message: &str) -> Result<ConversationStatus> {
        let response = self
            .client
            .post(self.url("/reset-conversation"))
            .json(&ResetConversationRequest { system_message })
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        let response = check_status(response, "reset-conversation").await?;
        let body: ResetConversationResponse = response.json().await?;
        tracing::info!(status = ?body.status, "conversation reset");
        Ok(body.status)
    }

    /// Server status string
    ///
    /// # Errors
    ///
    /// Returns error if the server is unreachable or the reply is malformed
    pub async fn server_status(&self) -> Result<String> {
        let response = self
            .client
            .get(self.url("/status"))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        let response = check_status(response, "status").await?;
        let body: ServerStatusResponse = response.json().await?;
        Ok(body.status)
    }

    /// Stream reply audio into `on_audio` until the server closes the stream
    ///
    /// Each `data` payload is one base64-encoded clip. A `close` or `error`
    /// event ends the stream. Returns the number of clips delivered.
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot be opened or breaks mid-way
    pub async fn response_events(&self, mut on_audio: impl FnMut(Vec<u8>)) -> Result<usize> {
        use base64::Engine;
        use futures::StreamExt;

        let response = self
            .client
            .get(self.url("/response-events"))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        let response = check_status(response, "response-events").await?;

        let mut parser = SseParser::default();
        let mut stream = response.bytes_stream();
        let mut delivered = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for event in parser.feed(&chunk) {
                match event.event.as_str() {
                    "close" => {
                        tracing::debug!(delivered, "response events closed by server");
                        return Ok(delivered);
                    }
                    "error" => {
                        tracing::error!(data = %event.data, "server processing error");
                        return Err(Error::Protocol(format!(
                            "server processing error: {}",
                            event.data
                        )));
                    }
                    _ => match base64::engine::general_purpose::STANDARD.decode(event.data.trim()) {
                        Ok(bytes) => {
                            delivered += 1;
                            on_audio(bytes);
                        }
                        Err(e) => tracing::warn!(error = %e, "undecodable response audio"),
                    },
                }
            }
        }

        tracing::debug!(delivered, "response events ended");
        Ok(delivered)
    }
}

#[async_trait]
impl RecognitionBackend for BackendClient {
    async fn upload_image(&self, image: Vec<u8>, task_id: Option<&str>) -> Result<StageReport> {
        tracing::debug!(image_bytes = image.len(), task_id = ?task_id, "uploading image");

        let form = reqwest::multipart::Form::new()
            .part(
                "image",
                reqwest::multipart::Part::bytes(image)
                    .file_name("snapshot.jpg")
                    .mime_str("image/jpeg")?,
            )
            .text("task_id", task_id.unwrap_or_default().to_string());

        let response = self
            .client
            .post(self.url("/upload-image"))
            .multipart(form)
            .timeout(IMAGE_UPLOAD_TIMEOUT)
            .send()
            .await?;

        let response = check_status(response, "upload-image").await?;
        let body: UploadImageResponse = response.json().await?;
        Ok(StageReport {
            stage: body.status,
            task_id: body.task_id.filter(|id| !id.is_empty()),
            audio: body.reading,
        })
    }

    async fn task_status(&self, task_id: &str) -> Result<StageReport> {
        let response = self
            .client
            .get(self.url(&format!("/task-status/{task_id}")))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        let response = check_status(response, "task-status").await?;
        let body: TaskStatusResponse = response.json().await?;
        Ok(StageReport {
            stage: body.status.status,
            task_id: Some(task_id.to_string()),
            audio: body.status.reading,
        })
    }

    async fn spot_cards(&self, image: Vec<u8>) -> Result<SpotResult> {
        let form = reqwest::multipart::Form::new().part(
            "image",
            reqwest::multipart::Part::bytes(image)
                .file_name("snapshot.jpg")
                .mime_str("image/jpeg")?,
        );

        let response = self
            .client
            .post(self.url("/spot-cards/"))
            .multipart(form)
            .timeout(IMAGE_UPLOAD_TIMEOUT)
            .send()
            .await?;

        let response = check_status(response, "spot-cards").await?;
        Ok(response.json().await?)
    }
}

async fn check_status(response: reqwest::Response, endpoint: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    tracing::error!(endpoint, status = %status, body = %body, "backend rejected request");
    Err(Error::Protocol(format!("{endpoint} returned {status}: {body}")))
}
