use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("malformed event: {0}")]
    Malformed(String),

    #[error("event stream unavailable: {0}")]
    Unavailable(String),
}
