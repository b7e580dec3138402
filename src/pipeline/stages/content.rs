//! Content extraction stage: fetches full bodies and attachments for
//! travel-classified messages and persists them before forwarding.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AppResult;
use crate::mail::MailSource;
use crate::model::ExtractionStatus;
use crate::pipeline::queues::EmailBatch;
use crate::pipeline::stage::PipelineStage;
use crate::pipeline::state::StageState;
use crate::storage::EmailStore;

pub struct ContentExtractionStage {
    store: Arc<dyn EmailStore>,
    mail: Arc<dyn MailSource>,
    state: StageState,
    batch_size: usize,
}

impl ContentExtractionStage {
    pub fn new(store: Arc<dyn EmailStore>, mail: Arc<dyn MailSource>, batch_size: usize) -> Self {
        Self {
            store,
            mail,
            state: StageState::new("content"),
            batch_size,
        }
    }
}

#[async_trait]
impl PipelineStage for ContentExtractionStage {
    fn name(&self) -> &'static str {
        "content"
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn state(&self) -> &StageState {
        &self.state
    }

    async fn check_pending_work(&self) -> AppResult<Option<Vec<String>>> {
        let pending = self.store.content_pending_ids().await?;
        if pending.is_empty() {
            Ok(None)
        } else {
            tracing::info!(
                "Found {} travel emails pending content extraction",
                pending.len()
            );
            Ok(Some(pending))
        }
    }

    async fn process_batch(&self, batch: EmailBatch) -> AppResult<Option<EmailBatch>> {
        let snapshot = self.state.snapshot();
        let mut processed = snapshot.processed;
        let mut failed = snapshot.failed;
        let total = snapshot.total + batch.len();

        let mut extracted_ids: Vec<String> = Vec::new();
        for email_id in &batch.email_ids {
            let Some(content) = self.store.get_content(email_id).await? else {
                continue;
            };
            if content.extraction_status == ExtractionStatus::Completed {
                // Re-delivered item; already durable, nothing to redo.
                continue;
            }

            self.store
                .update_extraction(email_id, ExtractionStatus::Extracting, None)
                .await?;

            match self.mail.fetch_full(email_id).await {
                Ok(full) => {
                    // Body and terminal status land in one commit.
                    self.store.complete_extraction(email_id, full).await?;
                    extracted_ids.push(email_id.clone());
                }
                Err(e) => {
                    tracing::warn!("Content extraction failed for {}: {}", email_id, e);
                    self.store
                        .update_extraction(
                            email_id,
                            ExtractionStatus::Failed,
                            Some(e.to_string()),
                        )
                        .await?;
                    failed += 1;
                }
            }
            processed += 1;
        }

        self.state.update(|s| {
            s.processed = processed;
            s.total = total;
            s.failed = failed;
        });

        if extracted_ids.is_empty() {
            Ok(None)
        } else {
            Ok(Some(EmailBatch::new(extracted_ids)))
        }
    }
}
