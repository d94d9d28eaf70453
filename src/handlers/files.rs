use axum::{
    body::Body,
    extract::{Query, State},
    http::{
        HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap},
    },
    response::{IntoResponse, Response},
};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{error, info};

use crate::artifacts::find_artifact;
use crate::error::ResolveError;
use crate::fetcher::MediaFormat;
use crate::progress::Status;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    pub format: Option<String>,
}

pub async fn download_file(
    Query(query): Query<FileQuery>,
    State(state): State<AppState>,
) -> Result<Response, ResolveError> {
    let snapshot = state.progress.snapshot();
    if snapshot.status != Status::Downloaded {
        return Err(ResolveError::NotComplete);
    }

    let ext = query
        .format
        .as_deref()
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(|f| MediaFormat::parse(f).map(|m| m.extension()).unwrap_or(f))
        .unwrap_or(MediaFormat::Video.extension())
        .to_string();

    let dir = state.settings.download_dir.clone();
    let lookup_ext = ext.clone();
    let file_path = match tokio::task::spawn_blocking(move || find_artifact(&dir, &lookup_ext))
        .await
    {
        Ok(found) => found.ok_or(ResolveError::NotFound)?,
        Err(e) => {
            error!("Artifact lookup task failed: {}", e);
            return Err(ResolveError::NotFound);
        }
    };

    let file = match File::open(&file_path).await {
        Ok(f) => f,
        Err(e) => {
            error!("File download failed: {} (Path: {:?})", e, file_path);
            return Err(ResolveError::NotFound);
        }
    };
    let total_size = file.metadata().await.map(|m| m.len()).ok();

    let filename = snapshot.filename.unwrap_or_else(|| {
        file_path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("output.{}", ext))
    });
    info!("Serving {:?} as {}", file_path, filename);

    let mut headers = HeaderMap::new();
    let mime = mime_guess::from_path(&file_path).first_or_octet_stream();
    if let Ok(val) = HeaderValue::from_str(mime.as_ref()) {
        headers.insert(CONTENT_TYPE, val);
    }
    if let Ok(val) = HeaderValue::from_str(&content_disposition(&filename)) {
        headers.insert(CONTENT_DISPOSITION, val);
    }
    if let Some(len) = total_size
        && let Ok(val) = HeaderValue::from_str(&len.to_string())
    {
        headers.insert(CONTENT_LENGTH, val);
    }

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((headers, body).into_response())
}

/// Attachment header with an ASCII fallback name and the exact UTF-8 name.
pub fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '_',
        })
        .collect();
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        utf8_percent_encode(filename, NON_ALPHANUMERIC)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_disposition_ascii() {
        assert_eq!(
            content_disposition("Talk.mp4"),
            "attachment; filename=\"Talk.mp4\"; filename*=UTF-8''Talk%2Emp4"
        );
    }

    #[test]
    fn test_content_disposition_unicode_and_quotes() {
        let header = content_disposition("Café \"live\".mp3");
        assert!(header.starts_with("attachment; filename=\"Caf_ _live_.mp3\""));
        assert!(header.ends_with("filename*=UTF-8''Caf%C3%A9%20%22live%22%2Emp3"));
    }
}
