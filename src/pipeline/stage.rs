//! Reusable stage skeleton.
//!
//! A stage drains leftover work discovered in the store first, then reads
//! batches from its input queue until the end-of-stream sentinel arrives.
//! The sentinel is forwarded downstream exactly once no matter how the
//! stage exits, so later stages wind down instead of hanging.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::AppResult;

use super::queues::{EmailBatch, QueueMessage, QueuePoll, QueueReceiver, QueueSender};
use super::state::StageState;

/// Poll timeout for the input queue; keeps the stage responsive to stop
/// requests while idle.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn name(&self) -> &'static str;

    fn batch_size(&self) -> usize;

    fn state(&self) -> &StageState;

    /// Work left over from a prior, possibly crashed run. Idempotent and
    /// called before any queue draining begins.
    async fn check_pending_work(&self) -> AppResult<Option<Vec<String>>>;

    /// One unit of work. Safe to re-invoke on the same batch: per-item
    /// terminal status is written only after the corresponding external
    /// side effect succeeded, and per-item failures are recorded without
    /// aborting the batch. An error escaping this method fails the stage.
    async fn process_batch(&self, batch: EmailBatch) -> AppResult<Option<EmailBatch>>;

    fn request_stop(&self) {
        self.state().request_stop();
    }
}

/// Drive a queue-connected stage to completion.
pub async fn run_stage<S>(
    stage: Arc<S>,
    input: QueueReceiver,
    output: Option<QueueSender>,
    shutdown: CancellationToken,
) where
    S: PipelineStage + ?Sized + 'static,
{
    stage.state().mark_in_progress();

    let result = drive(stage.as_ref(), input, output.as_ref(), &shutdown).await;

    // Sentinel goes downstream on every exit path, including failure.
    if let Some(out) = &output {
        if let Err(e) = out.send(QueueMessage::Done).await {
            tracing::warn!("{}: could not propagate end signal: {}", stage.name(), e);
        }
    }

    match result {
        Ok(()) => stage.state().mark_completed(),
        Err(e) => stage.state().mark_failed(e.to_string()),
    }
}

async fn drive<S>(
    stage: &S,
    mut input: QueueReceiver,
    output: Option<&QueueSender>,
    shutdown: &CancellationToken,
) -> AppResult<()>
where
    S: PipelineStage + ?Sized,
{
    let stopped = |stage: &S| shutdown.is_cancelled() || stage.state().stop_requested();

    // Resume: leftover work from durable state, processed through the same
    // code path and batch size as queue-delivered work.
    if let Some(pending) = stage.check_pending_work().await? {
        if !pending.is_empty() {
            tracing::info!(
                "{}: Found {} pending items at startup",
                stage.name(),
                pending.len()
            );
            for chunk in pending.chunks(stage.batch_size().max(1)) {
                if stopped(stage) {
                    return Ok(());
                }
                let result = stage.process_batch(EmailBatch::new(chunk.to_vec())).await?;
                forward(stage, output, result).await?;
            }
        }
    }

    loop {
        if stopped(stage) {
            return Ok(());
        }

        match input.poll(POLL_TIMEOUT).await {
            QueuePoll::Message(QueueMessage::Done) => {
                tracing::info!("{}: Received end signal", stage.name());
                return Ok(());
            }
            QueuePoll::Message(QueueMessage::Batch(batch)) => {
                let result = stage.process_batch(batch).await?;
                forward(stage, output, result).await?;
            }
            QueuePoll::Empty => continue,
            QueuePoll::Disconnected => {
                tracing::warn!("{}: input queue disconnected", stage.name());
                return Ok(());
            }
        }
    }
}

async fn forward<S>(
    stage: &S,
    output: Option<&QueueSender>,
    result: Option<EmailBatch>,
) -> AppResult<()>
where
    S: PipelineStage + ?Sized,
{
    if let (Some(out), Some(batch)) = (output, result) {
        if !batch.is_empty() {
            tracing::debug!("{}: forwarding {} items", stage.name(), batch.len());
            out.send(QueueMessage::Batch(batch)).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::pipeline::queues::stage_queue;

    /// Echo stage that records every batch it sees and forwards it.
    struct EchoStage {
        state: StageState,
        pending: Vec<String>,
        seen: Mutex<Vec<Vec<String>>>,
        fail_on: Option<String>,
    }

    impl EchoStage {
        fn new(pending: Vec<String>) -> Self {
            Self {
                state: StageState::new("echo"),
                pending,
                seen: Mutex::new(Vec::new()),
                fail_on: None,
            }
        }
    }

    #[async_trait]
    impl PipelineStage for EchoStage {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn batch_size(&self) -> usize {
            2
        }

        fn state(&self) -> &StageState {
            &self.state
        }

        async fn check_pending_work(&self) -> AppResult<Option<Vec<String>>> {
            if self.pending.is_empty() {
                Ok(None)
            } else {
                Ok(Some(self.pending.clone()))
            }
        }

        async fn process_batch(&self, batch: EmailBatch) -> AppResult<Option<EmailBatch>> {
            if let Some(poison) = &self.fail_on {
                if batch.email_ids.contains(poison) {
                    return Err(anyhow::anyhow!("poisoned batch").into());
                }
            }
            self.seen.lock().unwrap().push(batch.email_ids.clone());
            Ok(Some(batch))
        }
    }

    #[tokio::test]
    async fn pending_work_is_processed_before_queue_items() {
        let stage = Arc::new(EchoStage::new(vec![
            "p1".to_string(),
            "p2".to_string(),
            "p3".to_string(),
        ]));
        let (in_tx, in_rx) = stage_queue("in", 4);
        let (out_tx, mut out_rx) = stage_queue("out", 8);

        in_tx.send_batch(vec!["q1".to_string()]).await.unwrap();
        in_tx.send(QueueMessage::Done).await.unwrap();

        run_stage(stage.clone(), in_rx, Some(out_tx), CancellationToken::new()).await;

        let seen = stage.seen.lock().unwrap().clone();
        // Pending work first, chunked at batch size 2, then the queue batch.
        assert_eq!(
            seen,
            vec![
                vec!["p1".to_string(), "p2".to_string()],
                vec!["p3".to_string()],
                vec!["q1".to_string()],
            ]
        );

        // Output: three forwarded batches then the sentinel, in order.
        let mut messages = Vec::new();
        loop {
            match out_rx.poll(Duration::from_millis(100)).await {
                QueuePoll::Message(m) => {
                    let done = m == QueueMessage::Done;
                    messages.push(m);
                    if done {
                        break;
                    }
                }
                other => panic!("unexpected poll: {other:?}"),
            }
        }
        assert_eq!(messages.len(), 4);
        assert_eq!(messages.last(), Some(&QueueMessage::Done));
        assert_eq!(stage.state.snapshot().status, super::super::StageStatus::Completed);
    }

    #[tokio::test]
    async fn failing_stage_still_propagates_sentinel() {
        let mut inner = EchoStage::new(vec![]);
        inner.fail_on = Some("bad".to_string());
        let stage = Arc::new(inner);

        let (in_tx, in_rx) = stage_queue("in", 4);
        let (out_tx, mut out_rx) = stage_queue("out", 4);

        in_tx.send_batch(vec!["bad".to_string()]).await.unwrap();

        run_stage(stage.clone(), in_rx, Some(out_tx), CancellationToken::new()).await;

        assert_eq!(
            stage.state.snapshot().status,
            super::super::StageStatus::Failed
        );
        assert!(matches!(
            out_rx.poll(Duration::from_millis(100)).await,
            QueuePoll::Message(QueueMessage::Done)
        ));
    }

    #[tokio::test]
    async fn cancellation_stops_between_batches() {
        let stage = Arc::new(EchoStage::new(vec![]));
        let (_in_tx, in_rx) = stage_queue("in", 4);
        let (out_tx, mut out_rx) = stage_queue("out", 4);
        let token = CancellationToken::new();
        token.cancel();

        run_stage(stage.clone(), in_rx, Some(out_tx), token).await;

        assert_eq!(
            stage.state.snapshot().status,
            super::super::StageStatus::Completed
        );
        assert!(matches!(
            out_rx.poll(Duration::from_millis(100)).await,
            QueuePoll::Message(QueueMessage::Done)
        ));
    }
}
