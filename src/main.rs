mod artifacts;
mod config;
mod error;
mod fetcher;
mod handlers;
mod jobs;
mod progress;
mod state;
mod tasks;

use axum::{
    Router,
    routing::{get, post},
};
use local_ip_address::local_ip;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Level, error, info};

use crate::config::Settings;
use crate::fetcher::YtDlp;
use crate::handlers::{api, files, web};
use crate::jobs::JobManager;
use crate::progress::ProgressTracker;
use crate::state::AppState;
use crate::tasks::Reclaimer;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let settings = Settings::new().expect("Failed to load configuration");

    tracing_subscriber::fmt()
        .with_env_filter(&settings.log_level)
        .init();

    info!("Starting mediagrab...");

    if !settings.download_dir.exists() {
        std::fs::create_dir_all(&settings.download_dir)
            .expect("Failed to create download directory");
    }

    let fetcher = Arc::new(YtDlp::new(
        settings.ytdlp_path.clone(),
        settings.ffmpeg_path.clone(),
        settings.audio_quality.clone(),
    ));
    let progress = ProgressTracker::new();
    let jobs = JobManager::new(&settings, progress.clone(), fetcher);

    let state = AppState {
        settings: settings.clone(),
        progress,
        jobs,
    };

    // Start background tasks (Storage reclaim)
    let shutdown = CancellationToken::new();
    let reclaimer = tasks::start_background_tasks(&settings, shutdown.clone());

    // --- Router Setup ---
    let app = create_app(state);

    let port = settings.server_port;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Listening on http://{}", addr);
    if let Ok(ip) = local_ip() {
        info!("Network address: http://{}:{}", ip, port);
    }

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind listener");
    let serve = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(shutdown.clone()));
    if let Err(e) = serve.await {
        error!("Server error: {}", e);
    }

    shutdown.cancel();
    let _ = reclaimer.await;
    Reclaimer::from_settings(&settings).remove_all();
    info!("Shutdown complete.");
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = shutdown.cancelled() => {},
    }
    info!("Shutdown signal received.");
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(web::index_handler))
        .route("/download", post(api::start_download))
        .route("/progress", get(api::progress))
        .route("/download_file", get(files::download_file))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_response(tower_http::trace::DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_settings;
    use crate::fetcher::testing::{Script, ScriptedFetcher};
    use axum::http::{StatusCode, header::CONTENT_DISPOSITION};
    use axum_test::TestServer;
    use std::time::Duration;
    use tempfile::tempdir;

    async fn setup_test_app(
        fetcher: ScriptedFetcher,
    ) -> (TestServer, AppState, Arc<ScriptedFetcher>, tempfile::TempDir) {
        let tmp_dir = tempdir().unwrap();
        let download_dir = tmp_dir.path().join("downloads");
        let cookie_file = tmp_dir.path().join("cookies.txt");
        std::fs::write(&cookie_file, "# Netscape HTTP Cookie File\n").unwrap();

        let settings = test_settings(download_dir, cookie_file);
        let fetcher = Arc::new(fetcher);
        let progress = ProgressTracker::new();
        let jobs = JobManager::new(&settings, progress.clone(), fetcher.clone());

        let state = AppState {
            settings,
            progress,
            jobs,
        };

        let app = create_app(state.clone());
        (TestServer::new(app).unwrap(), state, fetcher, tmp_dir)
    }

    async fn poll_until_settled(server: &TestServer) -> Vec<serde_json::Value> {
        let mut seen = Vec::new();
        for _ in 0..200 {
            let body: serde_json::Value = server.get("/progress").await.json();
            // The bare marker is set mid-job, before the audio fallback runs.
            let failed = body["error"].is_string() && body["error"] != "Download failed";
            let done = body["status"] == "Downloaded" || failed;
            seen.push(body);
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        seen
    }

    #[tokio::test]
    async fn test_index_page() {
        let (server, _, _, _tmp) = setup_test_app(ScriptedFetcher::default()).await;
        let response = server.get("/").await;
        response.assert_status_ok();
        response.assert_header("content-type", "text/html");
        assert!(response.text().contains("<form id=\"job\""));
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let (server, _, _, _tmp) = setup_test_app(ScriptedFetcher::default()).await;
        server
            .get("/some/random/page")
            .await
            .assert_status(StatusCode::NOT_FOUND);
        server
            .get("/index.html")
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_progress_before_any_job() {
        let (server, _, _, _tmp) = setup_test_app(ScriptedFetcher::default()).await;
        let first: serde_json::Value = server.get("/progress").await.json();
        let second: serde_json::Value = server.get("/progress").await.json();
        assert_eq!(first, second);
        assert_eq!(first["status"], "");
        assert_eq!(first["percentage"], 0.0);
    }

    #[tokio::test]
    async fn test_download_file_before_submission() {
        let (server, _, _, _tmp) = setup_test_app(ScriptedFetcher::default()).await;
        let response = server.get("/download_file").add_query_param("format", "mp3").await;
        response.assert_status(StatusCode::BAD_REQUEST);
        response.assert_json(&serde_json::json!({ "error": "Download not complete" }));
    }

    #[tokio::test]
    async fn test_submit_without_url() {
        let (server, state, fetcher, _tmp) = setup_test_app(ScriptedFetcher::default()).await;
        let response = server
            .post("/download")
            .form(&[("format", "mp4"), ("resolution", "720")])
            .await;
        response.assert_status_ok();
        let body: serde_json::Value = response.json();
        assert_eq!(body["error"], "No URL provided");
        assert_eq!(body["status"], "");
        assert_eq!(body["percentage"], 0.0);
        assert!(body["filename"].is_null());

        assert!(fetcher.calls().is_empty());
        assert_eq!(state.progress.in_flight(), 0);
        let polled: serde_json::Value = server.get("/progress").await.json();
        assert_eq!(polled, body);
    }

    #[tokio::test]
    async fn test_submit_without_transcoder() {
        let mut fetcher = ScriptedFetcher::default();
        fetcher.transcoder = false;
        let (server, _, fetcher, _tmp) = setup_test_app(fetcher).await;
        let body: serde_json::Value = server
            .post("/download")
            .form(&[("url", "https://x/video"), ("format", "mp4")])
            .await
            .json();
        assert_eq!(body["error"], "FFmpeg not available");
        assert!(fetcher.calls().is_empty());

        server
            .post("/download")
            .form(&[("url", "https://x/video"), ("format", "mp3")])
            .await
            .assert_json(&serde_json::json!({ "status": "started" }));
        let last = poll_until_settled(&server).await.pop().unwrap();
        assert_eq!(last["filename"], "Audio.mp3");
    }

    #[tokio::test]
    async fn test_video_download_end_to_end() {
        let (server, _, fetcher, _tmp) = setup_test_app(ScriptedFetcher::new(
            Script::succeed("Talk"),
            Script::fail("unused"),
        ))
        .await;

        let response = server
            .post("/download")
            .form(&[
                ("url", "https://x/video"),
                ("format", "mp4"),
                ("resolution", "480"),
            ])
            .await;
        response.assert_status_ok();
        response.assert_json(&serde_json::json!({ "status": "started" }));

        let seen = poll_until_settled(&server).await;
        let percentages: Vec<f64> = seen
            .iter()
            .map(|s| s["percentage"].as_f64().unwrap())
            .collect();
        assert!(percentages.windows(2).all(|w| w[0] <= w[1]), "{:?}", percentages);
        let last = seen.last().unwrap();
        assert_eq!(last["status"], "Downloaded");
        assert_eq!(last["percentage"], 100.0);
        assert_eq!(last["filename"], "Talk.mp4");
        assert_eq!(
            fetcher.calls(),
            vec![crate::fetcher::FetchTarget::Video { max_height: 480 }]
        );

        let file = server.get("/download_file").add_query_param("format", "mp4").await;
        file.assert_status_ok();
        let disposition = file.header(CONTENT_DISPOSITION);
        assert!(
            disposition
                .to_str()
                .unwrap()
                .starts_with("attachment; filename=\"Talk.mp4\"")
        );
        assert_eq!(file.text(), "media:mp4");

        // Retrieval does not consume the artifact.
        server
            .get("/download_file")
            .add_query_param("format", "mp4")
            .await
            .assert_status_ok();
    }

    #[tokio::test]
    async fn test_fallback_artifact_not_found_as_mp4() {
        let (server, _, _, _tmp) = setup_test_app(ScriptedFetcher::new(
            Script::fail("Requested format is not available"),
            Script::succeed("Talk"),
        ))
        .await;

        server
            .post("/download")
            .form(&[("url", "https://x/video"), ("format", "mp4")])
            .await
            .assert_status_ok();
        let last = poll_until_settled(&server).await.pop().unwrap();
        assert_eq!(last["status"], "Downloaded");
        assert_eq!(last["filename"], "Talk.mp3");
        assert!(last["error"].is_null());

        let response = server.get("/download_file").add_query_param("format", "mp4").await;
        response.assert_status_not_found();
        response.assert_json(&serde_json::json!({ "error": "File not found" }));

        server
            .get("/download_file")
            .add_query_param("format", "mp3")
            .await
            .assert_status_ok();
    }

    #[tokio::test]
    async fn test_reclaimed_artifact_is_not_found() {
        let (server, state, _, _tmp) = setup_test_app(ScriptedFetcher::default()).await;
        server
            .post("/download")
            .form(&[("url", "https://x/song"), ("format", "mp3")])
            .await
            .assert_status_ok();
        let last = poll_until_settled(&server).await.pop().unwrap();
        assert_eq!(last["status"], "Downloaded");

        Reclaimer::new(state.settings.download_dir.clone(), Duration::ZERO)
            .sweep_at(std::time::SystemTime::now() + Duration::from_secs(1));

        server
            .get("/download_file")
            .add_query_param("format", "mp3")
            .await
            .assert_status_not_found();
    }

    #[tokio::test]
    async fn test_rapid_submissions_settle() {
        let (server, _, fetcher, _tmp) = setup_test_app(ScriptedFetcher::default().gated()).await;

        for format in ["mp4", "mp3"] {
            server
                .post("/download")
                .form(&[("url", "https://x/video"), ("format", format)])
                .await
                .assert_json(&serde_json::json!({ "status": "started" }));
        }

        let polled: serde_json::Value = server.get("/progress").await.json();
        assert_eq!(polled["status"], "");
        assert_eq!(polled["percentage"], 0.0);

        fetcher.release(2);
        let last = poll_until_settled(&server).await.pop().unwrap();
        assert_eq!(last["status"], "Downloaded");
        let name = last["filename"].as_str().unwrap();
        assert!(name == "Video.mp4" || name == "Audio.mp3", "{}", name);
    }

    #[tokio::test]
    async fn test_busy_rejection_when_configured() {
        let tmp_dir = tempdir().unwrap();
        let cookie_file = tmp_dir.path().join("cookies.txt");
        std::fs::write(&cookie_file, "").unwrap();
        let mut settings = test_settings(tmp_dir.path().join("downloads"), cookie_file);
        settings.reject_concurrent = true;

        let fetcher = Arc::new(ScriptedFetcher::default().gated());
        let progress = ProgressTracker::new();
        let jobs = JobManager::new(&settings, progress.clone(), fetcher.clone());
        let server = TestServer::new(create_app(AppState {
            settings,
            progress,
            jobs,
        }))
        .unwrap();

        server
            .post("/download")
            .form(&[("url", "https://x/video")])
            .await
            .assert_status_ok();
        let response = server
            .post("/download")
            .form(&[("url", "https://x/other")])
            .await;
        response.assert_status(StatusCode::CONFLICT);
        response.assert_json(&serde_json::json!({ "error": "A download is already in progress" }));

        let before: serde_json::Value = server.get("/progress").await.json();
        server
            .post("/download")
            .form(&[("format", "mp4")])
            .await
            .assert_status(StatusCode::CONFLICT);
        let after: serde_json::Value = server.get("/progress").await.json();
        assert_eq!(after, before);
        assert!(after["error"].is_null());

        fetcher.release(1);
        let last = poll_until_settled(&server).await.pop().unwrap();
        assert_eq!(last["filename"], "Video.mp4");
    }
}
