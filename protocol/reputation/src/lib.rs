//! Reputation derived from confirmed batches only.
//!
//! Scores move on action weights and streak bonuses, decay while an
//! identity is idle, and drop on slashes that compound for repeat offenders.
//! Confirmed batches are applied once each, in sealing order.

mod config;
mod engine;
mod error;
mod grade;
mod state;

pub use config::{ReputationConfig, SlashTiers};
pub use engine::{ApplyOutcome, ReputationEngine, ReputationSummary};
pub use error::{ReputationError, ReputationResult};
pub use grade::{Grade, GradeThresholds, SlashSeverity};
pub use state::{IdentityStatistics, ReputationState, ScoreEvent, ScoreEventKind};
