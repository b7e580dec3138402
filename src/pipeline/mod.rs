//! Stage pipeline: bounded queues, per-stage state, the reusable stage
//! skeleton and the coordinator that wires them together.
//!
//! Emails flow import -> classification -> content extraction -> booking
//! extraction over three bounded queues. Every stage re-discovers pending
//! work from the store at startup, so the pipeline resumes after a crash
//! without queue contents surviving it. Trip detection runs separately over
//! the persisted booking corpus (see `crate::trips`).

pub mod coordinator;
pub mod queues;
pub mod stage;
pub mod stages;
pub mod state;

pub use coordinator::{PipelineCoordinator, StartOutcome, StopOutcome};
pub use queues::{EmailBatch, PipelineQueues, QueueMessage, QueuePoll, QueueReceiver, QueueSender};
pub use stage::{run_stage, PipelineStage};
pub use state::{PipelineProgress, PipelineState, StageSnapshot, StageState, StageStatus};
