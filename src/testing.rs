//! Shared test fixtures: tracing setup, seed helpers and scripted
//! implementations of the mail-source and extractor boundaries.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};

use crate::error::AppResult;
use crate::extract::{EmailForExtraction, FragmentForDetection, TravelExtractor};
use crate::mail::{DateRange, FullMessage, MailSource, MessageHeader, MessagePage};
use crate::model::{BookingInfo, EmailCategory, MessageRecord, Trip};
use crate::storage::{EmailStore, MemoryStore};

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn date_range() -> DateRange {
    DateRange::new(
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
        NaiveDate::from_ymd_opt(2024, 5, 31).unwrap(),
    )
    .unwrap()
}

pub fn header(email_id: &str, subject: &str, sender: &str) -> MessageHeader {
    MessageHeader {
        email_id: email_id.to_string(),
        subject: subject.to_string(),
        sender: sender.to_string(),
        timestamp: Utc.with_ymd_and_hms(2024, 5, 2, 9, 0, 0).unwrap(),
    }
}

pub async fn seed_message(store: &Arc<MemoryStore>, email_id: &str, day: u32) {
    store
        .insert_messages(vec![MessageRecord {
            email_id: email_id.to_string(),
            subject: format!("subject {email_id}"),
            sender: "sender@example.com".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, day, 12, 0, 0).unwrap(),
            category: EmailCategory::Unclassified,
        }])
        .await
        .unwrap();
}

// ============================================================================
// Scripted mail source
// ============================================================================

/// Mail source backed by scripted pages and bodies. Pages are served in
/// order with numeric page tokens, like a real paginated search.
#[derive(Default)]
pub struct ScriptedMailSource {
    pages: Vec<Vec<MessageHeader>>,
    bodies: HashMap<String, FullMessage>,
    fail_headers: HashSet<String>,
    fail_full: HashSet<String>,
}

impl ScriptedMailSource {
    pub fn with_pages(pages: Vec<Vec<MessageHeader>>) -> Self {
        Self {
            pages,
            ..Default::default()
        }
    }

    pub fn set_body(&mut self, email_id: &str, text: &str) {
        self.bodies.insert(
            email_id.to_string(),
            FullMessage {
                text: Some(text.to_string()),
                ..Default::default()
            },
        );
    }

    pub fn fail_headers_for(&mut self, email_id: &str) {
        self.fail_headers.insert(email_id.to_string());
    }

    pub fn fail_full_for(&mut self, email_id: &str) {
        self.fail_full.insert(email_id.to_string());
    }

    fn all_headers(&self) -> HashMap<String, MessageHeader> {
        self.pages
            .iter()
            .flatten()
            .map(|h| (h.email_id.clone(), h.clone()))
            .collect()
    }
}

#[async_trait]
impl MailSource for ScriptedMailSource {
    async fn search(
        &self,
        _range: &DateRange,
        page_token: Option<&str>,
        _max_results: usize,
    ) -> AppResult<MessagePage> {
        let index: usize = page_token.map(|t| t.parse().unwrap_or(0)).unwrap_or(0);
        let Some(page) = self.pages.get(index) else {
            return Ok(MessagePage::default());
        };
        let next = if index + 1 < self.pages.len() {
            Some((index + 1).to_string())
        } else {
            None
        };
        Ok(MessagePage {
            ids: page.iter().map(|h| h.email_id.clone()).collect(),
            next_page_token: next,
            result_size_estimate: self.pages.iter().map(|p| p.len()).sum(),
        })
    }

    async fn fetch_headers(&self, email_id: &str) -> AppResult<MessageHeader> {
        if self.fail_headers.contains(email_id) {
            return Err(anyhow::anyhow!("scripted header failure for {email_id}").into());
        }
        self.all_headers()
            .get(email_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown email {email_id}").into())
    }

    async fn fetch_full(&self, email_id: &str) -> AppResult<FullMessage> {
        if self.fail_full.contains(email_id) {
            return Err(anyhow::anyhow!("scripted body failure for {email_id}").into());
        }
        Ok(self.bodies.get(email_id).cloned().unwrap_or_default())
    }
}

// ============================================================================
// Stub extractor
// ============================================================================

/// Extractor with scripted per-email answers. Unscripted booking lookups
/// error, which doubles as the per-item failure path in stage tests.
#[derive(Default)]
pub struct StubExtractor {
    categories: Mutex<HashMap<String, EmailCategory>>,
    bookings: Mutex<HashMap<String, BookingInfo>>,
    trip_responses: Mutex<VecDeque<Vec<Trip>>>,
    booking_calls: AtomicUsize,
    detect_calls: AtomicUsize,
    fail_classify: AtomicBool,
    fail_detect: AtomicBool,
}

impl StubExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_category(&self, email_id: &str, category: EmailCategory) {
        self.categories
            .lock()
            .unwrap()
            .insert(email_id.to_string(), category);
    }

    pub fn set_booking(&self, email_id: &str, booking: BookingInfo) {
        self.bookings
            .lock()
            .unwrap()
            .insert(email_id.to_string(), booking);
    }

    /// Queue a full-replacement trip list for the next `detect_trips` call.
    /// With the queue empty, detection echoes the existing trips back.
    pub fn push_trip_response(&self, trips: Vec<Trip>) {
        self.trip_responses.lock().unwrap().push_back(trips);
    }

    pub fn fail_classification(&self) {
        self.fail_classify.store(true, Ordering::Relaxed);
    }

    pub fn fail_detection(&self) {
        self.fail_detect.store(true, Ordering::Relaxed);
    }

    pub fn booking_calls(&self) -> usize {
        self.booking_calls.load(Ordering::Relaxed)
    }

    pub fn detect_calls(&self) -> usize {
        self.detect_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TravelExtractor for StubExtractor {
    async fn classify(&self, headers: &[MessageHeader]) -> AppResult<Vec<EmailCategory>> {
        if self.fail_classify.load(Ordering::Relaxed) {
            return Err(anyhow::anyhow!("scripted classification failure").into());
        }
        let categories = self.categories.lock().unwrap();
        Ok(headers
            .iter()
            .map(|h| {
                categories
                    .get(&h.email_id)
                    .copied()
                    .unwrap_or(EmailCategory::Marketing)
            })
            .collect())
    }

    async fn extract_booking(&self, email: &EmailForExtraction) -> AppResult<BookingInfo> {
        self.booking_calls.fetch_add(1, Ordering::Relaxed);
        self.bookings
            .lock()
            .unwrap()
            .get(&email.email_id)
            .cloned()
            .ok_or_else(|| {
                anyhow::anyhow!("no scripted booking for {}", email.email_id).into()
            })
    }

    async fn detect_trips(
        &self,
        _fragments: &[FragmentForDetection],
        existing: &[Trip],
    ) -> AppResult<Vec<Trip>> {
        self.detect_calls.fetch_add(1, Ordering::Relaxed);
        if self.fail_detect.load(Ordering::Relaxed) {
            return Err(anyhow::anyhow!("scripted detection failure").into());
        }
        match self.trip_responses.lock().unwrap().pop_front() {
            Some(trips) => Ok(trips),
            None => Ok(existing.to_vec()),
        }
    }
}

/// Store seeded with `n` unclassified messages, one per day of May 2024.
pub async fn seeded_store(n: usize) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for i in 0..n {
        seed_message(&store, &format!("m{}", i + 1), (i + 1) as u32).await;
    }
    store
}
