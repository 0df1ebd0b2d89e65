//! Proof batching: a pending queue, deterministic Merkle batches, and the
//! submit/confirm lifecycle against an external settlement channel.

mod aggregator;
mod batch;
mod channel;
mod error;
pub mod merkle;
mod retry;
mod service;
mod store;

pub use aggregator::{
    AggregatorConfig, BatchAggregator, BatchSink, ChainVerifier, NoopSink, OperatorAlert,
    RejectionOutcome,
};
pub use batch::{build_batch, Batch, BatchLeaf, BatchPayload, SubmissionState};
pub use channel::{
    ConfirmationEvent, ConfirmationKey, InMemorySettlement, Outcome, SettlementChannel,
    SubmissionHandle,
};
pub use error::{BatchError, BatchResult};
pub use merkle::{InclusionProof, MerkleTree};
pub use retry::RetryStrategy;
pub use service::{spawn_confirmation_listener, spawn_flush_loop};
pub use store::{BatchStore, InMemoryBatchStore};
