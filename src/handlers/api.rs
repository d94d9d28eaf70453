use axum::{
    Form, Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::SubmitError;
use crate::progress::ProgressState;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct DownloadForm {
    pub url: Option<String>,
    pub format: Option<String>,
    pub resolution: Option<String>,
}

pub async fn start_download(
    State(state): State<AppState>,
    Form(form): Form<DownloadForm>,
) -> Response {
    let submitted = state
        .jobs
        .submit_form(
            form.url.as_deref(),
            form.format.as_deref(),
            form.resolution.as_deref(),
        )
        .await;

    match submitted {
        Ok(_job) => Json(serde_json::json!({ "status": "started" })).into_response(),
        Err(SubmitError::Busy) => {
            info!("Rejected submission: a download is already running");
            (
                StatusCode::CONFLICT,
                Json(serde_json::json!({ "error": SubmitError::Busy.to_string() })),
            )
                .into_response()
        }
        Err(e) => {
            warn!("Rejected submission: {}", e);
            Json(state.progress.reject(e.to_string())).into_response()
        }
    }
}

pub async fn progress(State(state): State<AppState>) -> Json<ProgressState> {
    Json(state.progress.snapshot())
}
