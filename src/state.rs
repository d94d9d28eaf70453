use crate::config::Settings;
use crate::jobs::JobManager;
use crate::progress::ProgressTracker;

#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub progress: ProgressTracker,
    pub jobs: JobManager,
}
