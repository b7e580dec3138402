//! Import stage: discovers new message ids from the mail source page by
//! page, persists their headers and emits id batches downstream. Unlike
//! the queue-connected stages it drives itself from the search cursor, so
//! it has no input queue and always starts fresh.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::AppResult;
use crate::mail::{DateRange, MailSource};
use crate::model::{EmailCategory, MessageRecord};
use crate::pipeline::queues::{QueueMessage, QueueSender};
use crate::pipeline::state::StageState;
use crate::storage::EmailStore;

pub struct ImportStage {
    store: Arc<dyn EmailStore>,
    mail: Arc<dyn MailSource>,
    state: StageState,
    batch_size: usize,
}

impl ImportStage {
    pub fn new(store: Arc<dyn EmailStore>, mail: Arc<dyn MailSource>, batch_size: usize) -> Self {
        Self {
            store,
            mail,
            state: StageState::new("import"),
            batch_size,
        }
    }

    pub fn state(&self) -> &StageState {
        &self.state
    }

    pub fn request_stop(&self) {
        self.state.request_stop();
    }

    pub async fn run_import(
        &self,
        range: DateRange,
        output: QueueSender,
        shutdown: CancellationToken,
    ) {
        self.state.mark_in_progress();

        let result = self.import_all(&range, &output, &shutdown).await;

        if let Err(e) = output.send(QueueMessage::Done).await {
            tracing::warn!("import: could not propagate end signal: {}", e);
        }

        match result {
            Ok((imported, skipped)) => {
                tracing::info!(
                    "Import completed. Total imported: {}, skipped: {}",
                    imported,
                    skipped
                );
                self.state.mark_completed();
            }
            Err(e) => self.state.mark_failed(e.to_string()),
        }
    }

    async fn import_all(
        &self,
        range: &DateRange,
        output: &QueueSender,
        shutdown: &CancellationToken,
    ) -> AppResult<(usize, usize)> {
        tracing::info!("Starting import for date range: {}", range);

        let existing = self.store.existing_message_ids().await?;
        tracing::info!("Found {} existing emails in store", existing.len());

        let mut page_token: Option<String> = None;
        let mut imported = 0;
        let mut skipped = 0;
        let mut failed = 0;

        loop {
            if shutdown.is_cancelled() || self.state.stop_requested() {
                break;
            }

            let page = self
                .mail
                .search(range, page_token.as_deref(), self.batch_size)
                .await?;
            if page.ids.is_empty() {
                tracing::info!("No more emails to import");
                break;
            }

            let mut new_records: Vec<MessageRecord> = Vec::new();
            for email_id in &page.ids {
                if existing.contains(email_id) {
                    skipped += 1;
                    continue;
                }
                match self.mail.fetch_headers(email_id).await {
                    Ok(header) => new_records.push(MessageRecord {
                        email_id: header.email_id,
                        subject: header.subject,
                        sender: header.sender,
                        timestamp: header.timestamp,
                        category: EmailCategory::Unclassified,
                    }),
                    Err(e) => {
                        tracing::error!("Failed to get headers for email {}: {}", email_id, e);
                        failed += 1;
                    }
                }
            }

            if !new_records.is_empty() {
                let email_ids: Vec<String> =
                    new_records.iter().map(|r| r.email_id.clone()).collect();
                let saved = self.store.insert_messages(new_records).await?;
                imported += saved;
                tracing::info!("Saved {} emails and sent for classification", saved);

                // Durable write above precedes visibility downstream.
                output.send_batch(email_ids).await?;
            }

            self.state
                .record_progress(imported, page.result_size_estimate.max(imported), failed);

            page_token = page.next_page_token;
            if page_token.is_none() {
                tracing::info!("No more pages to import");
                break;
            }
        }

        Ok((imported, skipped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::pipeline::queues::{stage_queue, QueuePoll};
    use crate::pipeline::state::StageStatus;
    use crate::storage::MemoryStore;
    use crate::testing::{date_range, header, ScriptedMailSource};

    #[tokio::test]
    async fn imports_pages_and_skips_known_ids() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_messages(vec![MessageRecord {
                email_id: "known".to_string(),
                subject: "s".to_string(),
                sender: "x".to_string(),
                timestamp: chrono::Utc::now(),
                category: EmailCategory::Unclassified,
            }])
            .await
            .unwrap();

        let mail = Arc::new(ScriptedMailSource::with_pages(vec![
            vec![header("known", "old", "a@b"), header("m1", "new 1", "a@b")],
            vec![header("m2", "new 2", "a@b")],
        ]));

        let stage = ImportStage::new(store.clone(), mail, 10);
        let (tx, mut rx) = stage_queue("out", 8);
        stage
            .run_import(date_range(), tx, CancellationToken::new())
            .await;

        assert_eq!(stage.state().snapshot().status, StageStatus::Completed);
        assert_eq!(store.existing_message_ids().await.unwrap().len(), 3);

        // Two batches (one per page with new ids) then the sentinel.
        match rx.poll(Duration::from_millis(100)).await {
            QueuePoll::Message(QueueMessage::Batch(b)) => assert_eq!(b.email_ids, vec!["m1"]),
            other => panic!("unexpected: {other:?}"),
        }
        match rx.poll(Duration::from_millis(100)).await {
            QueuePoll::Message(QueueMessage::Batch(b)) => assert_eq!(b.email_ids, vec!["m2"]),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            rx.poll(Duration::from_millis(100)).await,
            QueuePoll::Message(QueueMessage::Done)
        ));
    }

    #[tokio::test]
    async fn failed_header_fetch_does_not_abort_page() {
        let store = Arc::new(MemoryStore::new());
        let mut mail = ScriptedMailSource::with_pages(vec![vec![
            header("ok", "fine", "a@b"),
            header("broken", "gone", "a@b"),
        ]]);
        mail.fail_headers_for("broken");
        let stage = ImportStage::new(store.clone(), Arc::new(mail), 10);
        let (tx, mut rx) = stage_queue("out", 8);

        stage
            .run_import(date_range(), tx, CancellationToken::new())
            .await;

        assert_eq!(stage.state().snapshot().status, StageStatus::Completed);
        assert_eq!(stage.state().snapshot().failed, 1);
        match rx.poll(Duration::from_millis(100)).await {
            QueuePoll::Message(QueueMessage::Batch(b)) => assert_eq!(b.email_ids, vec!["ok"]),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
