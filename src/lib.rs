//! tripclerk
//!
//! Ingests an email archive, classifies messages, extracts structured
//! travel-booking data through LLM calls and reconciles booking fragments
//! into persisted trips.
//!
//! The crate is organized around three cores:
//!
//! - the stage pipeline (`pipeline`): import -> classify -> extract content
//!   -> extract bookings, connected by bounded queues and resumable from
//!   durable per-item status after a crash
//! - the AI resilience layer (`ai`): per-model rate limiting and an ordered
//!   provider fallback chain shared by every LLM-backed step
//! - trip detection (`trips`): reconciles newly extracted booking fragments
//!   against the persisted trip set without losing trips the model drops
//!
//! Mail retrieval (`mail::MailSource`) and persistence (`storage::EmailStore`)
//! are boundary traits; an in-memory store ships for tests and local runs.

pub mod ai;
pub mod config;
pub mod error;
pub mod extract;
pub mod mail;
pub mod model;
pub mod pipeline;
pub mod storage;
pub mod testing;
pub mod trips;

pub use error::{AppResult, PipelineError};

pub type HttpClient = reqwest::Client;
