//! Pipeline coordinator: wires stages and queues together, runs them
//! concurrently and exposes the whole control surface - start, stop and
//! progress. Stages exit cooperatively at their next checkpoint; nothing
//! is ever force-killed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::extract::TravelExtractor;
use crate::mail::{DateRange, MailSource};
use crate::pipeline::queues::PipelineQueues;
use crate::pipeline::stage::{run_stage, PipelineStage};
use crate::pipeline::stages::{
    BookingExtractionStage, ClassificationStage, ContentExtractionStage, ImportStage,
};
use crate::pipeline::state::{PipelineProgress, PipelineState};
use crate::storage::EmailStore;

const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub started: bool,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct StopOutcome {
    pub stopped: bool,
    pub message: String,
}

pub struct PipelineCoordinator {
    import: Arc<ImportStage>,
    classification: Arc<ClassificationStage>,
    content: Arc<ContentExtractionStage>,
    booking: Arc<BookingExtractionStage>,
    state: Arc<PipelineState>,
    queue_bound: usize,
    shutdown: Mutex<CancellationToken>,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl PipelineCoordinator {
    pub fn new(
        store: Arc<dyn EmailStore>,
        mail: Arc<dyn MailSource>,
        extractor: Arc<dyn TravelExtractor>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            import: Arc::new(ImportStage::new(
                store.clone(),
                mail.clone(),
                config.batch.import_batch_size,
            )),
            classification: Arc::new(ClassificationStage::new(
                store.clone(),
                extractor.clone(),
                config.batch.classification_batch_size,
            )),
            content: Arc::new(ContentExtractionStage::new(
                store.clone(),
                mail,
                config.batch.content_batch_size,
            )),
            booking: Arc::new(BookingExtractionStage::new(
                store,
                extractor,
                config.batch.booking_batch_size,
            )),
            state: Arc::new(PipelineState::new()),
            queue_bound: config.batch.queue_bound,
            shutdown: Mutex::new(CancellationToken::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Launch a run. Refuses while one is active; otherwise resets all
    /// stage state, rebuilds the queues and spawns one task per stage plus
    /// a monitor.
    pub fn start(&self, range: DateRange) -> StartOutcome {
        if !self.state.begin_run(range) {
            return StartOutcome {
                started: false,
                message: "Pipeline is already running".to_string(),
            };
        }

        self.import.state().reset();
        self.classification.state().reset();
        self.content.state().reset();
        self.booking.state().reset();

        let queues = PipelineQueues::new(self.queue_bound);
        let token = CancellationToken::new();
        *self.shutdown.lock().unwrap() = token.clone();

        let (q1_tx, q1_rx) = queues.import_to_classification;
        let (q2_tx, q2_rx) = queues.classification_to_content;
        let (q3_tx, q3_rx) = queues.content_to_booking;

        let mut handles = self.handles.lock().unwrap();
        handles.clear();

        let import = self.import.clone();
        let import_token = token.clone();
        handles.push(tokio::spawn(async move {
            import.run_import(range, q1_tx, import_token).await;
        }));

        handles.push(tokio::spawn(run_stage(
            self.classification.clone(),
            q1_rx,
            Some(q2_tx),
            token.clone(),
        )));
        handles.push(tokio::spawn(run_stage(
            self.content.clone(),
            q2_rx,
            Some(q3_tx),
            token.clone(),
        )));
        handles.push(tokio::spawn(run_stage(
            self.booking.clone(),
            q3_rx,
            None,
            token.clone(),
        )));
        handles.push(self.spawn_monitor(token));
        drop(handles);

        tracing::info!("Pipeline started");
        StartOutcome {
            started: true,
            message: format!("Pipeline started for emails from {range}"),
        }
    }

    /// Watches stage snapshots, records failures in the aggregate error
    /// list and closes out the run when every stage reaches a terminal
    /// state.
    fn spawn_monitor(&self, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        let state = self.state.clone();
        type SnapshotFn = Box<dyn Fn() -> crate::pipeline::state::StageSnapshot + Send + Sync>;
        let stages: Vec<(&'static str, SnapshotFn)> = vec![
            ("import", {
                let s = self.import.clone();
                Box::new(move || s.state().snapshot())
            }),
            ("classification", {
                let s = self.classification.clone();
                Box::new(move || s.state().snapshot())
            }),
            ("content", {
                let s = self.content.clone();
                Box::new(move || s.state().snapshot())
            }),
            ("booking", {
                let s = self.booking.clone();
                Box::new(move || s.state().snapshot())
            }),
        ];

        tokio::spawn(async move {
            let mut reported: Vec<&'static str> = Vec::new();
            loop {
                let mut all_terminal = true;
                let mut any_failed = false;
                for (name, snapshot_fn) in &stages {
                    let snapshot = snapshot_fn();
                    if !snapshot.status.is_terminal() {
                        all_terminal = false;
                    }
                    if let Some(error) = snapshot.error {
                        any_failed = true;
                        if !reported.contains(name) {
                            reported.push(name);
                            state.add_error(name, error);
                        }
                    }
                }

                if all_terminal {
                    let message = if token.is_cancelled() {
                        "Pipeline stopped by user"
                    } else if any_failed {
                        "Pipeline completed with errors"
                    } else {
                        "Pipeline completed successfully"
                    };
                    state.finish_run(message);
                    break;
                }

                tokio::time::sleep(MONITOR_INTERVAL).await;
            }
        })
    }

    /// Await the current run's tasks. Returns immediately when no run was
    /// started; meant for callers that want completion rather than polling
    /// `get_progress`.
    pub async fn wait_until_idle(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock().unwrap());
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                tracing::error!("Pipeline task panicked: {}", e);
            }
        }
    }

    /// Cooperative stop: cancels the run token and flags every stage. Tasks
    /// exit at their next checkpoint; in-flight external calls wind down on
    /// their own.
    pub fn stop(&self) -> StopOutcome {
        if !self.state.is_running() {
            return StopOutcome {
                stopped: false,
                message: "Pipeline is not running".to_string(),
            };
        }

        self.shutdown.lock().unwrap().cancel();
        self.import.request_stop();
        self.classification.request_stop();
        self.content.request_stop();
        self.booking.request_stop();
        self.state.note("Pipeline stop requested");

        tracing::info!("Pipeline stop requested");
        StopOutcome {
            stopped: true,
            message: "Pipeline stop requested. Current operations will complete before stopping."
                .to_string(),
        }
    }

    pub fn get_progress(&self) -> PipelineProgress {
        self.state.progress(vec![
            ("import".to_string(), self.import.state().snapshot()),
            (
                "classification".to_string(),
                self.classification.state().snapshot(),
            ),
            ("content".to_string(), self.content.state().snapshot()),
            ("booking".to_string(), self.booking.state().snapshot()),
        ])
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::PipelineConfig;
    use crate::storage::MemoryStore;
    use crate::testing::{date_range, header, ScriptedMailSource, StubExtractor};

    async fn wait_until_finished(coordinator: &PipelineCoordinator) {
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while coordinator.is_running() {
            assert!(
                std::time::Instant::now() < deadline,
                "pipeline did not finish in time"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn start_refuses_while_running() {
        let store = Arc::new(MemoryStore::new());
        let mail = Arc::new(ScriptedMailSource::with_pages(vec![vec![header(
            "m1", "s", "a@b",
        )]]));
        let extractor = Arc::new(StubExtractor::new());
        let coordinator =
            PipelineCoordinator::new(store, mail, extractor, &PipelineConfig::default());

        let first = coordinator.start(date_range());
        assert!(first.started);
        // No await point between the two calls on a current-thread runtime,
        // so the first run cannot have finished yet.
        let second = coordinator.start(date_range());
        assert!(!second.started);
        assert!(second.message.contains("already running"));

        wait_until_finished(&coordinator).await;
    }

    #[tokio::test]
    async fn empty_run_completes_cleanly() {
        let store = Arc::new(MemoryStore::new());
        let mail = Arc::new(ScriptedMailSource::default());
        let extractor = Arc::new(StubExtractor::new());
        let coordinator =
            PipelineCoordinator::new(store, mail, extractor, &PipelineConfig::default());

        assert!(coordinator.start(date_range()).started);
        coordinator.wait_until_idle().await;

        let progress = coordinator.get_progress();
        assert!(!progress.is_running);
        assert_eq!(progress.overall_progress, 100);
        assert!(progress.errors.is_empty());
        assert!(progress.message.contains("completed successfully"));
    }

    #[tokio::test]
    async fn stop_before_start_reports_not_running() {
        let store = Arc::new(MemoryStore::new());
        let mail = Arc::new(ScriptedMailSource::default());
        let extractor = Arc::new(StubExtractor::new());
        let coordinator =
            PipelineCoordinator::new(store, mail, extractor, &PipelineConfig::default());

        let outcome = coordinator.stop();
        assert!(!outcome.stopped);
    }
}
