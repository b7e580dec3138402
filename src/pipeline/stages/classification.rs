//! Classification stage: assigns a category per message and creates the
//! content row for travel-classified mail before forwarding it.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AppResult;
use crate::extract::TravelExtractor;
use crate::mail::MessageHeader;
use crate::model::EmailCategory;
use crate::pipeline::queues::EmailBatch;
use crate::pipeline::stage::PipelineStage;
use crate::pipeline::state::StageState;
use crate::storage::EmailStore;

pub struct ClassificationStage {
    store: Arc<dyn EmailStore>,
    extractor: Arc<dyn TravelExtractor>,
    state: StageState,
    batch_size: usize,
}

impl ClassificationStage {
    pub fn new(
        store: Arc<dyn EmailStore>,
        extractor: Arc<dyn TravelExtractor>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            extractor,
            state: StageState::new("classification"),
            batch_size,
        }
    }
}

#[async_trait]
impl PipelineStage for ClassificationStage {
    fn name(&self) -> &'static str {
        "classification"
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn state(&self) -> &StageState {
        &self.state
    }

    async fn check_pending_work(&self) -> AppResult<Option<Vec<String>>> {
        let pending = self.store.unclassified_ids().await?;
        if pending.is_empty() {
            Ok(None)
        } else {
            tracing::info!("Found {} unclassified emails in store", pending.len());
            Ok(Some(pending))
        }
    }

    async fn process_batch(&self, batch: EmailBatch) -> AppResult<Option<EmailBatch>> {
        let mut headers: Vec<MessageHeader> = Vec::new();
        for email_id in &batch.email_ids {
            if let Some(msg) = self.store.get_message(email_id).await? {
                if msg.category == EmailCategory::Unclassified {
                    headers.push(MessageHeader {
                        email_id: msg.email_id,
                        subject: msg.subject,
                        sender: msg.sender,
                        timestamp: msg.timestamp,
                    });
                }
            }
        }
        if headers.is_empty() {
            return Ok(None);
        }

        let snapshot = self.state.snapshot();
        let mut processed = snapshot.processed;
        let mut failed = snapshot.failed;
        let mut travel_count = snapshot.travel_count;
        let total = snapshot.total + headers.len();

        let categories = match self.extractor.classify(&headers).await {
            Ok(categories) => categories,
            Err(e) => {
                // A whole-batch classify failure is recorded per item; the
                // stage keeps consuming later batches.
                tracing::error!("Classification batch failed: {}", e);
                for header in &headers {
                    self.store
                        .set_category(&header.email_id, EmailCategory::ClassificationFailed)
                        .await?;
                }
                failed += headers.len();
                processed += headers.len();
                self.state.update(|s| {
                    s.processed = processed;
                    s.total = total;
                    s.failed = failed;
                });
                return Ok(None);
            }
        };

        let mut travel_ids: Vec<String> = Vec::new();
        for (i, header) in headers.iter().enumerate() {
            let category = categories
                .get(i)
                .copied()
                .unwrap_or(EmailCategory::ClassificationFailed);
            self.store.set_category(&header.email_id, category).await?;
            processed += 1;
            if category == EmailCategory::ClassificationFailed {
                failed += 1;
            }
            if category.is_travel() {
                // The content row is created at hand-off so the content
                // stage can re-discover it as pending work after a crash.
                self.store
                    .create_content_if_missing(&header.email_id)
                    .await?;
                travel_count += 1;
                travel_ids.push(header.email_id.clone());
            }
        }

        self.state.update(|s| {
            s.processed = processed;
            s.total = total;
            s.failed = failed;
            s.travel_count = travel_count;
        });

        if travel_ids.is_empty() {
            Ok(None)
        } else {
            tracing::info!("Classified {} travel emails for content extraction", travel_ids.len());
            Ok(Some(EmailBatch::new(travel_ids)))
        }
    }
}
