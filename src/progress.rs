use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::fetcher::FetchEvent;

/// Fallback title when the engine does not report one.
const UNTITLED: &str = "output";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Status {
    #[default]
    Empty,
    Downloading,
    Downloaded,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Empty => "",
            Status::Downloading => "Downloading",
            Status::Downloaded => "Downloaded",
        }
    }
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Snapshot of the current or most recent job, as returned by `/progress`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ProgressState {
    pub percentage: f64,
    pub status: Status,
    pub error: Option<String>,
    pub filename: Option<String>,
}

impl ProgressState {
    fn rejected(error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }
}

/// Owner of the single progress slot.
///
/// Every mutation takes the lock once for the whole record, so readers never
/// see `Downloaded` without the matching `filename`. Writes from concurrent
/// jobs are not fenced against each other: the last writer wins.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    state: Arc<Mutex<ProgressState>>,
    in_flight: Arc<AtomicUsize>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ProgressState> {
        // A panicking writer only ever leaves a complete record behind.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> ProgressState {
        self.lock().clone()
    }

    /// Replaces the slot with a fresh zero record for a new job.
    pub fn reset(&self) {
        *self.lock() = ProgressState::default();
    }

    /// Replaces the slot with a fresh record carrying a precondition error.
    pub fn reject(&self, error: impl Into<String>) -> ProgressState {
        let state = ProgressState::rejected(error.into());
        *self.lock() = state.clone();
        state
    }

    /// Applies one engine event.
    pub fn apply(&self, event: &FetchEvent) {
        let mut state = self.lock();
        match event {
            FetchEvent::Downloading { percent } => {
                if percent.is_finite() {
                    state.percentage = state.percentage.max(percent.clamp(0.0, 100.0));
                }
                state.status = Status::Downloading;
            }
            FetchEvent::Finished { title, ext } => {
                let title = title.as_deref().filter(|t| !t.trim().is_empty());
                state.percentage = 100.0;
                state.status = Status::Downloaded;
                state.filename = Some(format!("{}.{}", title.unwrap_or(UNTITLED), ext));
                state.error = None;
            }
            FetchEvent::Error { .. } => {
                state.error = Some("Download failed".to_string());
            }
        }
    }

    /// Starts a new attempt inside the same job (the audio fallback).
    pub fn restart_attempt(&self) {
        let mut state = self.lock();
        state.percentage = 0.0;
        state.status = Status::Empty;
    }

    /// Publishes a finished artifact and clears any error left by an earlier
    /// attempt.
    pub fn complete(&self, filename: String) {
        let mut state = self.lock();
        state.percentage = 100.0;
        state.status = Status::Downloaded;
        state.filename = Some(filename);
        state.error = None;
    }

    pub fn fail(&self, error: impl Into<String>) {
        let mut state = self.lock();
        if state.status == Status::Downloaded {
            state.status = Status::Empty;
        }
        state.error = Some(error.into());
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Marks a job as running until the returned guard is dropped.
    pub fn track(&self) -> InFlight {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlight {
            counter: self.in_flight.clone(),
        }
    }

    /// Like [`track`](Self::track), but only when nothing else is running.
    pub fn try_track_exclusive(&self) -> Option<InFlight> {
        self.in_flight
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| InFlight {
                counter: self.in_flight.clone(),
            })
    }
}

pub struct InFlight {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}
