use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::path::PathBuf;
use thiserror::Error;

/// Reasons a submission is refused before any job starts.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("No URL provided")]
    MissingUrl,

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid resolution: {0}")]
    InvalidResolution(String),

    #[error("{} file not found", .0.display())]
    MissingCredentials(PathBuf),

    #[error("FFmpeg not available")]
    TranscoderUnavailable,

    #[error("A download is already in progress")]
    Busy,

    #[error("Failed to prepare download directory: {0}")]
    Storage(#[from] std::io::Error),
}

/// Failure of a single engine run.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to launch {}: {source}", .binary.display())]
    Spawn {
        binary: PathBuf,
        source: std::io::Error,
    },

    #[error("{0}")]
    Tool(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the artifact retrieval path. Never written into the progress
/// state.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Download not complete")]
    NotComplete,

    #[error("File not found")]
    NotFound,
}

impl IntoResponse for ResolveError {
    fn into_response(self) -> Response {
        let status = match self {
            ResolveError::NotComplete => StatusCode::BAD_REQUEST,
            ResolveError::NotFound => StatusCode::NOT_FOUND,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_error_messages() {
        assert_eq!(SubmitError::MissingUrl.to_string(), "No URL provided");
        assert_eq!(
            SubmitError::MissingCredentials(PathBuf::from("cookies.txt")).to_string(),
            "cookies.txt file not found"
        );
        assert_eq!(
            SubmitError::TranscoderUnavailable.to_string(),
            "FFmpeg not available"
        );
    }
}
