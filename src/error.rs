use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A fetched document lacks a required field or has malformed content.
    #[error("Extraction error: {0}")]
    Extraction(String),

    /// Image bytes could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Errors that only concern a single post or image. The driver logs and
    /// skips these; everything else aborts the run.
    pub fn is_per_resource(&self) -> bool {
        matches!(self, Error::Extraction(_) | Error::Decode(_))
    }
}
