//! Stage and pipeline state as immutable snapshots.
//!
//! Every mutation goes through a single `update` entry point that takes the
//! lock internally; readers always receive a copy, never a live reference.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};

use crate::mail::DateRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum StageStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct StageSnapshot {
    pub status: StageStatus,
    pub processed: usize,
    pub total: usize,
    pub failed: usize,
    pub progress_percent: u8,
    /// Classification: travel-classified so far. Booking: bookings found.
    pub travel_count: usize,
    pub bookings_found: usize,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Default for StageSnapshot {
    fn default() -> Self {
        Self {
            status: StageStatus::Pending,
            processed: 0,
            total: 0,
            failed: 0,
            progress_percent: 0,
            travel_count: 0,
            bookings_found: 0,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

pub struct StageState {
    name: &'static str,
    inner: RwLock<StageSnapshot>,
    stop: AtomicBool,
}

impl StageState {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: RwLock::new(StageSnapshot::default()),
            stop: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Single mutation entry point; recomputes the percentage under the
    /// same lock so a snapshot can never mix counters and percent.
    pub fn update(&self, f: impl FnOnce(&mut StageSnapshot)) {
        let mut snapshot = self.inner.write().unwrap();
        f(&mut snapshot);
        snapshot.progress_percent = match snapshot.status {
            StageStatus::Completed => 100,
            _ if snapshot.total > 0 => {
                ((snapshot.processed as f64 / snapshot.total as f64) * 100.0).min(100.0) as u8
            }
            _ => snapshot.progress_percent,
        };
    }

    pub fn snapshot(&self) -> StageSnapshot {
        self.inner.read().unwrap().clone()
    }

    pub fn mark_in_progress(&self) {
        tracing::info!("Starting {} stage", self.name);
        self.update(|s| {
            s.status = StageStatus::InProgress;
            s.started_at = Some(Utc::now());
        });
    }

    pub fn mark_completed(&self) {
        tracing::info!("{} stage completed", self.name);
        self.update(|s| {
            s.status = StageStatus::Completed;
            s.finished_at = Some(Utc::now());
        });
    }

    pub fn mark_failed(&self, error: String) {
        tracing::error!("{} stage failed: {}", self.name, error);
        self.update(|s| {
            s.status = StageStatus::Failed;
            s.finished_at = Some(Utc::now());
            s.error = Some(error);
        });
    }

    pub fn record_progress(&self, processed: usize, total: usize, failed: usize) {
        self.update(|s| {
            s.processed = processed;
            s.total = total;
            s.failed = failed;
        });
    }

    /// Back to a fresh pending snapshot with the stop flag cleared.
    pub fn reset(&self) {
        self.stop.store(false, Ordering::Relaxed);
        let mut snapshot = self.inner.write().unwrap();
        *snapshot = StageSnapshot::default();
    }

    pub fn request_stop(&self) {
        tracing::info!("Stop requested for {} stage", self.name);
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineErrorEntry {
    pub stage: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PipelineProgress {
    pub is_running: bool,
    pub stages: Vec<(String, StageSnapshot)>,
    pub overall_progress: u8,
    pub elapsed_seconds: i64,
    pub errors: Vec<PipelineErrorEntry>,
    pub message: String,
}

#[derive(Debug, Default)]
struct RunState {
    is_running: bool,
    date_range: Option<DateRange>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    errors: Vec<PipelineErrorEntry>,
    message: String,
}

/// Coordinator-owned run bookkeeping, mutated from the control surface and
/// the monitor task.
#[derive(Default)]
pub struct PipelineState {
    inner: Mutex<RunState>,
}

impl PipelineState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic check-and-begin; false when a run is already active.
    pub fn begin_run(&self, range: DateRange) -> bool {
        let mut state = self.inner.lock().unwrap();
        if state.is_running {
            return false;
        }
        *state = RunState {
            is_running: true,
            date_range: Some(range),
            started_at: Some(Utc::now()),
            finished_at: None,
            errors: Vec::new(),
            message: format!("Pipeline started for {range}"),
        };
        tracing::info!("Pipeline started for date range: {}", range);
        true
    }

    pub fn finish_run(&self, message: impl Into<String>) {
        let mut state = self.inner.lock().unwrap();
        if !state.is_running {
            return;
        }
        state.is_running = false;
        state.finished_at = Some(Utc::now());
        state.message = message.into();
        tracing::info!("{}", state.message);
    }

    pub fn add_error(&self, stage: &str, error: impl Into<String>) {
        let mut state = self.inner.lock().unwrap();
        let error = error.into();
        tracing::error!("Pipeline error in {}: {}", stage, error);
        state.errors.push(PipelineErrorEntry {
            stage: stage.to_string(),
            error,
            timestamp: Utc::now(),
        });
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().unwrap().is_running
    }

    pub fn date_range(&self) -> Option<DateRange> {
        self.inner.lock().unwrap().date_range
    }

    pub fn note(&self, message: impl Into<String>) {
        self.inner.lock().unwrap().message = message.into();
    }

    /// Aggregate view over the given stage snapshots: equal weight per
    /// stage, elapsed seconds from run start, accumulated errors.
    pub fn progress(&self, stages: Vec<(String, StageSnapshot)>) -> PipelineProgress {
        let state = self.inner.lock().unwrap();

        let overall = if stages.is_empty() {
            0
        } else {
            let sum: u32 = stages.iter().map(|(_, s)| s.progress_percent as u32).sum();
            (sum / stages.len() as u32) as u8
        };

        let elapsed_seconds = state
            .started_at
            .map(|start| {
                let end = state.finished_at.unwrap_or_else(Utc::now);
                (end - start).num_seconds()
            })
            .unwrap_or(0);

        PipelineProgress {
            is_running: state.is_running,
            stages,
            overall_progress: overall,
            elapsed_seconds,
            errors: state.errors.clone(),
            message: state.message.clone(),
        }
    }
}
