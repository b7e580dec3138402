//! Trip detection: reconciles validated booking fragments against the
//! persisted trip set.
//!
//! Each batch sends the full current trip list as context and expects a
//! full replacement back. The engine verifies the count instead of
//! trusting the model: fewer trips returned than sent means trips were
//! silently dropped, and the safe merge preserves them. Trips are swapped
//! atomically after every successful batch; a failed batch leaves the
//! previously persisted set untouched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::config::DetectionConfig;
use crate::error::AppResult;
use crate::extract::{FragmentForDetection, TravelExtractor};
use crate::mail::DateRange;
use crate::model::{merge_preserving_existing, TripDetectionStatus};
use crate::storage::EmailStore;

#[derive(Debug, Clone, Default)]
pub struct DetectionProgress {
    pub is_running: bool,
    pub total_emails: usize,
    pub processed_emails: usize,
    pub trips_found: usize,
    pub current_batch: usize,
    pub total_batches: usize,
    pub finished: bool,
    pub error: Option<String>,
    pub message: String,
    pub cost_estimate_usd: f64,
}

#[derive(Debug, Clone)]
pub struct DetectionSummary {
    pub trips: usize,
    pub processed_emails: usize,
    pub failed_emails: usize,
}

pub struct TripDetectionEngine {
    store: Arc<dyn EmailStore>,
    extractor: Arc<dyn TravelExtractor>,
    config: DetectionConfig,
    progress: RwLock<DetectionProgress>,
    stop: AtomicBool,
}

impl TripDetectionEngine {
    pub fn new(
        store: Arc<dyn EmailStore>,
        extractor: Arc<dyn TravelExtractor>,
        config: DetectionConfig,
    ) -> Self {
        Self {
            store,
            extractor,
            config,
            progress: RwLock::new(DetectionProgress::default()),
            stop: AtomicBool::new(false),
        }
    }

    pub fn get_progress(&self) -> DetectionProgress {
        self.progress.read().unwrap().clone()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    fn update_progress(&self, f: impl FnOnce(&mut DetectionProgress)) {
        let mut progress = self.progress.write().unwrap();
        f(&mut progress);
    }

    pub async fn run_detection(&self, range: Option<DateRange>) -> AppResult<DetectionSummary> {
        self.stop.store(false, Ordering::Relaxed);
        self.update_progress(|p| {
            *p = DetectionProgress {
                is_running: true,
                message: "Starting trip detection...".to_string(),
                ..DetectionProgress::default()
            };
        });

        let result = self.detect(range).await;

        match &result {
            Ok(summary) => {
                let message = format!("Detection completed. Found {} trips.", summary.trips);
                self.update_progress(|p| {
                    p.is_running = false;
                    p.finished = true;
                    p.message = message;
                });
            }
            Err(e) => {
                let error = e.to_string();
                self.update_progress(|p| {
                    p.is_running = false;
                    p.finished = true;
                    p.message = format!("Detection failed: {error}");
                    p.error = Some(error);
                });
            }
        }

        result
    }

    async fn detect(&self, range: Option<DateRange>) -> AppResult<DetectionSummary> {
        // A prior run that died mid-batch leaves rows stuck in Detecting;
        // they are retried, not skipped.
        let stuck = self.store.reset_stuck_detecting().await?;
        if stuck > 0 {
            tracing::warn!("Reset {} emails stuck in detecting status", stuck);
        }

        let mut all_trips = self.store.load_trips().await?;
        tracing::info!("Starting with {} existing trips", all_trips.len());

        let candidates = self.store.detection_candidates(range.as_ref()).await?;
        if candidates.is_empty() {
            self.update_progress(|p| p.message = "No travel emails found for detection".to_string());
            return Ok(DetectionSummary {
                trips: all_trips.len(),
                processed_emails: 0,
                failed_emails: 0,
            });
        }

        let batch_size = self.config.batch_size.max(1);
        let total_batches = candidates.len().div_ceil(batch_size);
        let cost_estimate = self
            .extractor
            .estimate_cost(
                candidates.len() as u64 * self.config.estimated_input_tokens_per_email,
                candidates.len() as u64 * self.config.estimated_output_tokens_per_email,
            )
            .await;

        tracing::info!(
            "Total booking emails found for detection: {}",
            candidates.len()
        );
        self.update_progress(|p| {
            p.total_emails = candidates.len();
            p.total_batches = total_batches;
            p.trips_found = all_trips.len();
            p.cost_estimate_usd = cost_estimate;
            p.message = format!(
                "Found {} travel emails to analyze (est. cost ${:.4})",
                candidates.len(),
                cost_estimate
            );
        });

        let mut processed = 0usize;
        let mut failed = 0usize;

        for (batch_index, chunk) in candidates.chunks(batch_size).enumerate() {
            if self.stop.load(Ordering::Relaxed) {
                self.update_progress(|p| p.message = "Detection stopped by user".to_string());
                break;
            }

            let batch_num = batch_index + 1;
            self.update_progress(|p| {
                p.current_batch = batch_num;
                p.message = format!(
                    "Processing batch {batch_num} ({} emails, {} existing trips)",
                    chunk.len(),
                    p.trips_found
                );
            });

            let (fragments, invalid) = self.gate_batch(chunk).await?;

            // Grouped by reason so the status write stays readable in logs.
            let mut by_reason: HashMap<String, Vec<String>> = HashMap::new();
            for (email_id, reason) in invalid {
                by_reason.entry(reason).or_default().push(email_id);
            }
            for (reason, ids) in by_reason {
                tracing::info!("Excluding {} emails from detection: {}", ids.len(), reason);
                self.store
                    .update_trip_detection(&ids, TripDetectionStatus::Failed, Some(reason))
                    .await?;
                failed += ids.len();
            }

            if fragments.is_empty() {
                tracing::warn!(
                    "Batch {}: no valid booking fragments, skipping batch",
                    batch_num
                );
                processed += chunk.len();
                self.update_progress(|p| p.processed_emails = processed);
                continue;
            }

            let valid_ids: Vec<String> =
                fragments.iter().map(|f| f.email_id.clone()).collect();
            self.store
                .update_trip_detection(&valid_ids, TripDetectionStatus::Detecting, None)
                .await?;

            match self.extractor.detect_trips(&fragments, &all_trips).await {
                Ok(returned) => {
                    let merged = if returned.len() < all_trips.len() {
                        tracing::warn!(
                            "Batch {}: extraction returned {} trips but {} were sent; \
                             performing safety merge to prevent trip loss",
                            batch_num,
                            returned.len(),
                            all_trips.len()
                        );
                        merge_preserving_existing(&all_trips, returned)
                    } else {
                        returned
                    };

                    // Swap first, mark contributing messages only after the
                    // swap survives.
                    self.store.replace_all_trips(merged.clone()).await?;
                    self.store
                        .update_trip_detection(&valid_ids, TripDetectionStatus::Completed, None)
                        .await?;

                    all_trips = merged;
                    tracing::info!(
                        "Batch {}: saved {} trips",
                        batch_num,
                        all_trips.len()
                    );

                    // Next batch starts from the primary provider again.
                    self.extractor.reset().await;

                    processed += chunk.len();
                    self.update_progress(|p| {
                        p.processed_emails = processed;
                        p.trips_found = all_trips.len();
                    });
                }
                Err(e) => {
                    // The fallback chain is exhausted. Batches depend on
                    // sequential trip context, so the run stops here rather
                    // than skipping ahead.
                    let reason = format!("Trip detection failed: {e}");
                    tracing::error!(
                        "Batch {}: all providers failed, stopping detection run: {}",
                        batch_num,
                        e
                    );
                    self.store
                        .update_trip_detection(
                            &valid_ids,
                            TripDetectionStatus::Failed,
                            Some(reason.clone()),
                        )
                        .await?;

                    let remaining: Vec<String> = candidates
                        .iter()
                        .skip((batch_index + 1) * batch_size)
                        .cloned()
                        .collect();
                    if !remaining.is_empty() {
                        self.store
                            .update_trip_detection(
                                &remaining,
                                TripDetectionStatus::Failed,
                                Some(format!("Detection run aborted: {e}")),
                            )
                            .await?;
                    }

                    return Err(e);
                }
            }
        }

        Ok(DetectionSummary {
            trips: all_trips.len(),
            processed_emails: processed,
            failed_emails: failed,
        })
    }

    /// Load each candidate's booking and apply the completeness, locality
    /// and test-booking gates. Returns valid fragments in input order plus
    /// (id, reason) pairs for the excluded ones.
    async fn gate_batch(
        &self,
        chunk: &[String],
    ) -> AppResult<(Vec<FragmentForDetection>, Vec<(String, String)>)> {
        let mut fragments = Vec::new();
        let mut invalid = Vec::new();

        for email_id in chunk {
            let message = self.store.get_message(email_id).await?;
            let content = self.store.get_content(email_id).await?;
            let (Some(message), Some(content)) = (message, content) else {
                invalid.push((email_id.clone(), "Missing message or content".to_string()));
                continue;
            };
            let Some(booking) = content.booking else {
                invalid.push((email_id.clone(), "No booking information".to_string()));
                continue;
            };

            match booking.validate_for_trip_detection(&self.config.local_area) {
                Ok(()) => fragments.push(FragmentForDetection {
                    email_id: message.email_id.clone(),
                    subject: message.subject.clone(),
                    sender: message.sender.clone(),
                    date: message.timestamp,
                    category: message.category,
                    booking,
                }),
                Err(reason) => invalid.push((email_id.clone(), reason)),
            }
        }

        Ok((fragments, invalid))
    }

    /// Clear all trips and reset per-email detection status so the next
    /// run re-detects from scratch.
    pub async fn reset_detection(&self) -> AppResult<usize> {
        let reset = self.store.reset_trip_detection().await?;
        tracing::info!("Reset trip detection status for {} emails", reset);
        Ok(reset)
    }
}
