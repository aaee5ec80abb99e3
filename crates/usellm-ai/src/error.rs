use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed chunk: {0}")]
    MalformedChunk(String),

    #[error("Provider error: {0}")]
    Provider(String),

    /// Non-2xx response; `body` is the raw response text.
    #[error("{status} {body}")]
    Status { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Stream error: {0}")]
    Transport(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Request was aborted")]
    Aborted,
}
