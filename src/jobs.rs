//! Job submission and the background runner.
//!
//! There is a single progress slot and no queue. A submission resets the
//! slot, purges stale same-format artifacts and detaches a supervised runner.
//! Unless `reject_concurrent` is set, a second submission while one is still
//! running resets the slot again and both runners race on it; whichever
//! writes last decides the terminal state.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::artifacts::{artifact_stem, purge_format, unix_now};
use crate::config::Settings;
use crate::error::SubmitError;
use crate::fetcher::{FetchEvent, FetchRequest, FetchTarget, Fetcher, MediaFormat};
use crate::progress::{InFlight, ProgressTracker};

pub const DEFAULT_RESOLUTION: u32 = 720;

#[derive(Clone, Debug, PartialEq)]
pub struct JobRequest {
    pub url: String,
    pub format: MediaFormat,
    pub resolution: u32,
}

impl JobRequest {
    /// Validates raw form values. Blank values fall back to the defaults
    /// (`mp4`, 720); a trailing `p` on the resolution is accepted.
    pub fn parse(
        url: Option<&str>,
        format: Option<&str>,
        resolution: Option<&str>,
    ) -> Result<Self, SubmitError> {
        let url = url
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or(SubmitError::MissingUrl)?;

        let format = match format.map(str::trim).filter(|f| !f.is_empty()) {
            None => MediaFormat::Video,
            Some(f) => {
                MediaFormat::parse(f).ok_or_else(|| SubmitError::UnsupportedFormat(f.to_string()))?
            }
        };

        let resolution = match resolution.map(str::trim).filter(|r| !r.is_empty()) {
            None => DEFAULT_RESOLUTION,
            Some(r) => r
                .trim_end_matches(['p', 'P'])
                .parse::<u32>()
                .ok()
                .filter(|h| *h > 0)
                .ok_or_else(|| SubmitError::InvalidResolution(r.to_string()))?,
        };

        Ok(Self {
            url: url.to_string(),
            format,
            resolution,
        })
    }

    fn target(&self) -> FetchTarget {
        match self.format {
            MediaFormat::Video => FetchTarget::Video {
                max_height: self.resolution,
            },
            MediaFormat::Audio => FetchTarget::Audio,
        }
    }
}

#[derive(Clone)]
pub struct JobManager {
    progress: ProgressTracker,
    fetcher: Arc<dyn Fetcher>,
    download_dir: PathBuf,
    cookie_file: PathBuf,
    reject_concurrent: bool,
}

impl JobManager {
    pub fn new(settings: &Settings, progress: ProgressTracker, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            progress,
            fetcher,
            download_dir: settings.download_dir.clone(),
            cookie_file: settings.cookie_file.clone(),
            reject_concurrent: settings.reject_concurrent,
        }
    }

    /// Admission check for a new job. In strict mode this fails while
    /// another job is running, before anything else is looked at.
    fn admit(&self) -> Result<InFlight, SubmitError> {
        if self.reject_concurrent {
            self.progress.try_track_exclusive().ok_or(SubmitError::Busy)
        } else {
            Ok(self.progress.track())
        }
    }

    /// Validates raw form values and submits them. A busy rejection wins
    /// over any validation error so a running job's state stays intact.
    pub async fn submit_form(
        &self,
        url: Option<&str>,
        format: Option<&str>,
        resolution: Option<&str>,
    ) -> Result<JoinHandle<()>, SubmitError> {
        let guard = self.admit()?;
        let request = JobRequest::parse(url, format, resolution)?;
        self.start(request, guard).await
    }

    /// Validates preconditions, resets the progress slot and starts the job
    /// in the background. The returned handle resolves once the job has
    /// reached a terminal state; callers are free to drop it.
    pub async fn submit(&self, request: JobRequest) -> Result<JoinHandle<()>, SubmitError> {
        let guard = self.admit()?;
        self.start(request, guard).await
    }

    async fn start(
        &self,
        request: JobRequest,
        guard: InFlight,
    ) -> Result<JoinHandle<()>, SubmitError> {
        if !tokio::fs::try_exists(&self.cookie_file).await.unwrap_or(false) {
            return Err(SubmitError::MissingCredentials(self.cookie_file.clone()));
        }
        if request.format.requires_transcoder() && !self.fetcher.transcoder_available() {
            return Err(SubmitError::TranscoderUnavailable);
        }

        if self.progress.in_flight() > 1 {
            warn!("Another download is still running; the new job will share its progress slot");
        }
        self.progress.reset();

        let dir = self.download_dir.clone();
        let ext = request.format.extension();
        tokio::task::spawn_blocking(move || -> std::io::Result<usize> {
            std::fs::create_dir_all(&dir)?;
            purge_format(&dir, ext)
        })
        .await
        .map_err(std::io::Error::other)??;

        let runner = JobRunner {
            id: Uuid::new_v4(),
            fetcher: self.fetcher.clone(),
            progress: self.progress.clone(),
            request: FetchRequest {
                source_url: request.url.clone(),
                target: request.target(),
                output_dir: self.download_dir.clone(),
                stem: artifact_stem(unix_now()),
                cookie_file: self.cookie_file.clone(),
            },
        };
        info!(
            "Starting job {} for {} ({:?}, {}p)",
            runner.id, request.url, request.format, request.resolution
        );

        Ok(runner.launch(guard))
    }
}

struct JobRunner {
    id: Uuid,
    fetcher: Arc<dyn Fetcher>,
    progress: ProgressTracker,
    request: FetchRequest,
}

impl JobRunner {
    /// Detaches the job. A supervisor awaits it so a panic still lands in
    /// the progress slot, and releases the in-flight guard afterwards.
    fn launch(self, guard: InFlight) -> JoinHandle<()> {
        let id = self.id;
        let progress = self.progress.clone();
        let job = tokio::spawn(self.run());

        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = job.await {
                error!("Job {} aborted: {}", id, e);
                progress.fail("Download task panicked");
            }
        })
    }

    async fn run(self) {
        let progress = self.progress.clone();
        let on_event = move |event: FetchEvent| progress.apply(&event);

        match self.fetcher.fetch(&self.request, &on_event).await {
            Ok(outcome) => {
                info!("Job {} finished: {:?}", self.id, outcome.path);
                self.progress.complete(outcome.display_name());
            }
            Err(primary) => match self.request.target {
                FetchTarget::Video { .. } => {
                    warn!("Job {} primary download failed: {}", self.id, primary);
                    self.fallback(primary.to_string(), &on_event).await;
                }
                FetchTarget::Audio => {
                    error!("Job {} failed: {}", self.id, primary);
                    self.progress.fail(format!("Download failed: {}", primary));
                }
            },
        }
    }

    /// Retries the same source as audio-only.
    async fn fallback(&self, primary: String, on_event: &(dyn Fn(FetchEvent) + Send + Sync)) {
        let request = self.request.with_target(FetchTarget::Audio);
        let ext = request.target.format().extension();
        let dir = request.output_dir.clone();
        match tokio::task::spawn_blocking(move || purge_format(&dir, ext)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Job {} could not purge old .{} files: {}", self.id, ext, e),
            Err(e) => warn!("Job {} purge task failed: {}", self.id, e),
        }
        self.progress.restart_attempt();

        match self.fetcher.fetch(&request, on_event).await {
            Ok(outcome) => {
                info!("Job {} audio fallback succeeded: {:?}", self.id, outcome.path);
                self.progress.complete(outcome.display_name());
            }
            Err(e) => {
                error!("Job {} audio fallback failed: {}", self.id, e);
                self.progress.fail(format!(
                    "Download failed: {}; audio fallback failed: {}",
                    primary, e
                ));
            }
        }
    }
}
