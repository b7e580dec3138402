//! Bounded hand-off queues between adjacent stages.
//!
//! Bounding provides natural backpressure: a slow downstream stage stalls
//! the upstream `send` until space frees, so a fast importer cannot grow
//! memory without bound while LLM extraction crawls. End-of-stream is a
//! dedicated `QueueMessage::Done` variant, never an empty batch.

use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::mpsc;

use crate::error::AppResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailBatch {
    pub email_ids: Vec<String>,
}

impl EmailBatch {
    pub fn new(email_ids: Vec<String>) -> Self {
        Self { email_ids }
    }

    pub fn len(&self) -> usize {
        self.email_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.email_ids.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueMessage {
    Batch(EmailBatch),
    /// Upstream finished; propagated downstream exactly once per queue.
    Done,
}

#[derive(Debug)]
pub enum QueuePoll {
    Message(QueueMessage),
    /// Nothing arrived within the poll timeout.
    Empty,
    /// Sender side dropped without a `Done`; treated as upstream death.
    Disconnected,
}

pub struct QueueSender {
    name: &'static str,
    tx: mpsc::Sender<QueueMessage>,
}

impl QueueSender {
    /// Waits while the queue is full.
    pub async fn send(&self, message: QueueMessage) -> AppResult<()> {
        if matches!(message, QueueMessage::Done) {
            tracing::debug!("Sent end signal to {}", self.name);
        }
        self.tx
            .send(message)
            .await
            .map_err(|_| anyhow!("queue {} closed", self.name).into())
    }

    pub async fn send_batch(&self, email_ids: Vec<String>) -> AppResult<()> {
        let batch = EmailBatch::new(email_ids);
        tracing::debug!("Put {} items into {}", batch.len(), self.name);
        self.send(QueueMessage::Batch(batch)).await
    }
}

pub struct QueueReceiver {
    name: &'static str,
    rx: mpsc::Receiver<QueueMessage>,
}

impl QueueReceiver {
    pub async fn poll(&mut self, timeout: Duration) -> QueuePoll {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(message)) => QueuePoll::Message(message),
            Ok(None) => {
                tracing::warn!("Queue {} disconnected without end signal", self.name);
                QueuePoll::Disconnected
            }
            Err(_) => QueuePoll::Empty,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

pub fn stage_queue(name: &'static str, bound: usize) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::channel(bound.max(1));
    (QueueSender { name, tx }, QueueReceiver { name, rx })
}

/// The three queues connecting adjacent pipeline stages, rebuilt for every
/// run so a fresh start never sees stale batches.
pub struct PipelineQueues {
    pub import_to_classification: (QueueSender, QueueReceiver),
    pub classification_to_content: (QueueSender, QueueReceiver),
    pub content_to_booking: (QueueSender, QueueReceiver),
}

impl PipelineQueues {
    pub fn new(bound: usize) -> Self {
        Self {
            import_to_classification: stage_queue("import_to_classification", bound),
            classification_to_content: stage_queue("classification_to_content", bound),
            content_to_booking: stage_queue("content_to_booking", bound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn batches_arrive_in_fifo_order() {
        let (tx, mut rx) = stage_queue("test", 4);
        tx.send_batch(vec!["a".to_string()]).await.unwrap();
        tx.send_batch(vec!["b".to_string()]).await.unwrap();
        tx.send(QueueMessage::Done).await.unwrap();

        match rx.poll(Duration::from_millis(100)).await {
            QueuePoll::Message(QueueMessage::Batch(batch)) => {
                assert_eq!(batch.email_ids, vec!["a"])
            }
            other => panic!("unexpected poll result: {other:?}"),
        }
        match rx.poll(Duration::from_millis(100)).await {
            QueuePoll::Message(QueueMessage::Batch(batch)) => {
                assert_eq!(batch.email_ids, vec!["b"])
            }
            other => panic!("unexpected poll result: {other:?}"),
        }
        assert!(matches!(
            rx.poll(Duration::from_millis(100)).await,
            QueuePoll::Message(QueueMessage::Done)
        ));
    }

    #[tokio::test]
    async fn poll_times_out_on_empty_queue() {
        let (_tx, mut rx) = stage_queue("test", 2);
        assert!(matches!(
            rx.poll(Duration::from_millis(20)).await,
            QueuePoll::Empty
        ));
    }

    #[tokio::test]
    async fn dropped_sender_reports_disconnect() {
        let (tx, mut rx) = stage_queue("test", 2);
        drop(tx);
        assert!(matches!(
            rx.poll(Duration::from_millis(20)).await,
            QueuePoll::Disconnected
        ));
    }

    #[tokio::test]
    async fn full_queue_blocks_until_drained() {
        let (tx, mut rx) = stage_queue("test", 2);
        tx.send_batch(vec!["a".to_string()]).await.unwrap();
        tx.send_batch(vec!["b".to_string()]).await.unwrap();

        // Third send must not complete while the queue is full.
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), tx.send_batch(vec!["c".to_string()]))
                .await;
        assert!(blocked.is_err(), "send should block on a full queue");

        // Slow consumer frees one slot; the retry goes through.
        match rx.poll(Duration::from_millis(100)).await {
            QueuePoll::Message(QueueMessage::Batch(batch)) => {
                assert_eq!(batch.email_ids, vec!["a"])
            }
            other => panic!("unexpected poll result: {other:?}"),
        }
        tokio::time::timeout(Duration::from_millis(100), tx.send_batch(vec!["c".to_string()]))
            .await
            .expect("send should complete after a slot frees")
            .unwrap();
    }
}
