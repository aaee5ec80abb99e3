use futures::Stream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use url::Url;

use usellm_core::types::ChatResult;

use crate::accumulator::{UpdateCallback, WireFormat, accumulate};
use crate::env_keys::{get_env_api_key, get_env_base_url};
use crate::error::StreamError;
use crate::openai_stream::content_deltas;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1/";
const CHAT_COMPLETIONS_PATH: &str = "chat/completions";

// ---------- ClientConfig ----------

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub wire_format: WireFormat,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            wire_format: WireFormat::EventStream,
        }
    }
}

impl ClientConfig {
    /// Read `OPENAI_API_KEY` and `OPENAI_BASE_URL`.
    pub fn from_env() -> Self {
        Self {
            base_url: get_env_base_url().unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key: get_env_api_key(),
            ..Self::default()
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_wire_format(mut self, wire_format: WireFormat) -> Self {
        self.wire_format = wire_format;
        self
    }
}

// ---------- ChatClient ----------

/// Streaming client for the OpenAI Chat Completions endpoint (or anything
/// that speaks the same protocol).
#[derive(Debug, Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    config: ClientConfig,
}

impl ChatClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn chat_completions_url(&self) -> Result<Url, StreamError> {
        let mut base = self.config.base_url.trim().to_string();
        if base.ends_with("/chat/completions") {
            return Url::parse(&base)
                .map_err(|e| StreamError::Config(format!("Invalid base URL {base}: {e}")));
        }
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .map_err(|e| StreamError::Config(format!("Invalid base URL {base}: {e}")))?;
        base_url
            .join(CHAT_COMPLETIONS_PATH)
            .map_err(|e| StreamError::Config(format!("Invalid base URL {base}: {e}")))
    }

    /// POST `body` with `"stream": true` and return the response once its
    /// status is known to be 2xx. Any other status fails with the raw body.
    pub async fn open_stream(&self, body: &Value) -> Result<reqwest::Response, StreamError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                StreamError::Config(
                    "OpenAI API key is required. Set OPENAI_API_KEY or pass it as an argument."
                        .to_string(),
                )
            })?;
        let url = self.chat_completions_url()?;

        let mut body = body.clone();
        if let Some(obj) = body.as_object_mut() {
            obj.insert("stream".to_string(), Value::Bool(true));
        }

        tracing::debug!("POST {url}");
        let response = self
            .http
            .post(url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::warn!("Chat completion request failed with {status}");
            return Err(StreamError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }

    /// Stream a chat completion, calling `observer` with the growing message.
    /// Cancelling `cancel` drops the in-flight read and yields `Aborted`.
    pub async fn stream_chat(
        &self,
        body: &Value,
        observer: Option<UpdateCallback<'_>>,
        cancel: &CancellationToken,
    ) -> Result<ChatResult, StreamError> {
        let run = async {
            let response = self.open_stream(body).await?;
            accumulate(self.config.wire_format, response.bytes_stream(), observer).await
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StreamError::Aborted),
            result = run => result,
        }
    }

    /// Open a chat completion and return its content fragments as a stream.
    pub async fn stream_content(
        &self,
        body: &Value,
    ) -> Result<impl Stream<Item = Result<String, StreamError>>, StreamError> {
        let response = self.open_stream(body).await?;
        Ok(content_deltas(response.bytes_stream()))
    }
}
