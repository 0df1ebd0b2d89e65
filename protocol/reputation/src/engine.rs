use crate::config::ReputationConfig;
use crate::error::{ReputationError, ReputationResult};
use crate::grade::{Grade, SlashSeverity};
use crate::state::{ReputationState, ScoreEvent};
use async_trait::async_trait;
use ledger::{ActionType, ActionTypeRegistry};
use sequencer_core::{Batch, BatchSink};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ApplyOutcome {
    /// The batch (and any buffered successors it unblocked) took effect.
    Applied {
        batches: Vec<String>,
        records: usize,
        unknown_identities: Vec<String>,
    },
    /// Waiting for earlier sequence numbers.
    Buffered { sequence: u64, expected: u64 },
    Replayed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReputationSummary {
    pub identities: usize,
    pub applied_batches: usize,
    pub skipped_batches: usize,
    pub buffered_batches: usize,
    pub next_sequence: u64,
    pub grades: BTreeMap<Grade, usize>,
}

/// A terminal batch waiting in the reorder buffer.
enum Parked {
    Confirmed(Batch),
    Skipped(String),
}

#[derive(Default)]
struct Inner {
    states: HashMap<String, ReputationState>,
    seen: HashSet<String>,
    applied: usize,
    skipped: usize,
    next_sequence: u64,
    parked: BTreeMap<u64, Parked>,
}

/// Applies confirmed batches strictly in sealing order. Rejected batches
/// only advance the sequence so later confirmations are not held back.
pub struct ReputationEngine {
    config: ReputationConfig,
    registry: Arc<ActionTypeRegistry>,
    inner: RwLock<Inner>,
}

impl ReputationEngine {
    pub fn new(config: ReputationConfig, registry: Arc<ActionTypeRegistry>) -> Self {
        Self {
            config,
            registry,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn config(&self) -> &ReputationConfig {
        &self.config
    }

    /// Idempotent; an existing state is left untouched.
    pub async fn register(&self, identity: &str, now: u64) -> ReputationState {
        let mut inner = self.inner.write().await;
        inner
            .states
            .entry(identity.to_string())
            .or_insert_with(|| {
                info!(identity, score = self.config.initial_score, "identity registered");
                ReputationState::new(identity, now, &self.config)
            })
            .clone()
    }

    pub async fn on_batch_confirmed(&self, batch: &Batch) -> ReputationResult<ApplyOutcome> {
        let mut inner = self.inner.write().await;
        if inner.seen.contains(&batch.batch_id) || batch.sequence < inner.next_sequence {
            debug!(batch_id = %batch.batch_id, "batch already applied");
            return Ok(ApplyOutcome::Replayed);
        }
        if batch.sequence > inner.next_sequence {
            if inner.parked.contains_key(&batch.sequence) {
                return Ok(ApplyOutcome::Replayed);
            }
            self.park(&mut inner, batch.sequence, Parked::Confirmed(batch.clone()))?;
            return Ok(ApplyOutcome::Buffered {
                sequence: batch.sequence,
                expected: inner.next_sequence,
            });
        }

        let mut batches = Vec::new();
        let mut records = 0;
        let mut unknown = Vec::new();
        self.apply(&mut inner, batch, &mut records, &mut unknown);
        batches.push(batch.batch_id.clone());
        self.drain(&mut inner, &mut batches, &mut records, &mut unknown);
        Ok(ApplyOutcome::Applied {
            batches,
            records,
            unknown_identities: unknown,
        })
    }

    /// Marks a rejected batch's sequence number as consumed.
    pub async fn on_batch_rejected(&self, batch: &Batch) -> ReputationResult<()> {
        let mut inner = self.inner.write().await;
        if inner.seen.contains(&batch.batch_id) || batch.sequence < inner.next_sequence {
            return Ok(());
        }
        if batch.sequence > inner.next_sequence {
            if !inner.parked.contains_key(&batch.sequence) {
                self.park(&mut inner, batch.sequence, Parked::Skipped(batch.batch_id.clone()))?;
            }
            return Ok(());
        }
        inner.seen.insert(batch.batch_id.clone());
        inner.skipped += 1;
        inner.next_sequence += 1;
        debug!(batch_id = %batch.batch_id, "rejected batch skipped");
        let (mut batches, mut records, mut unknown) = (Vec::new(), 0, Vec::new());
        self.drain(&mut inner, &mut batches, &mut records, &mut unknown);
        Ok(())
    }

    fn park(&self, inner: &mut Inner, sequence: u64, parked: Parked) -> ReputationResult<()> {
        if inner.parked.len() >= self.config.reorder_buffer_limit {
            warn!(sequence, expected = inner.next_sequence, "reorder buffer full");
            return Err(ReputationError::ReorderBufferFull {
                limit: self.config.reorder_buffer_limit,
                expected: inner.next_sequence,
            });
        }
        debug!(sequence, expected = inner.next_sequence, "batch buffered out of order");
        inner.parked.insert(sequence, parked);
        Ok(())
    }

    fn drain(
        &self,
        inner: &mut Inner,
        batches: &mut Vec<String>,
        records: &mut usize,
        unknown: &mut Vec<String>,
    ) {
        while let Some(parked) = inner.parked.remove(&inner.next_sequence) {
            match parked {
                Parked::Confirmed(batch) => {
                    self.apply(inner, &batch, records, unknown);
                    batches.push(batch.batch_id);
                }
                Parked::Skipped(batch_id) => {
                    inner.seen.insert(batch_id);
                    inner.skipped += 1;
                    inner.next_sequence += 1;
                }
            }
        }
    }

    fn apply(
        &self,
        inner: &mut Inner,
        batch: &Batch,
        records: &mut usize,
        unknown: &mut Vec<String>,
    ) {
        for leaf in &batch.ordered_leaves {
            let Some(state) = inner.states.get_mut(&leaf.identity) else {
                if !unknown.contains(&leaf.identity) {
                    warn!(
                        identity = %leaf.identity,
                        batch_id = %batch.batch_id,
                        "confirmed action for unregistered identity"
                    );
                    unknown.push(leaf.identity.clone());
                }
                continue;
            };
            let weight = self
                .registry
                .weight(&ActionType::new(leaf.action_type.as_str()))
                .unwrap_or(0.0);
            state.apply_action(
                &leaf.action_type,
                weight,
                leaf.timestamp,
                &batch.batch_id,
                &self.config,
            );
            *records += 1;
        }
        inner.seen.insert(batch.batch_id.clone());
        inner.applied += 1;
        inner.next_sequence = batch.sequence + 1;
        info!(
            batch_id = %batch.batch_id,
            sequence = batch.sequence,
            leaves = batch.ordered_leaves.len(),
            "reputation applied"
        );
    }

    /// Evaluates decay for one identity as of `now`.
    pub async fn decay(&self, identity: &str, now: u64) -> ReputationResult<f64> {
        let mut inner = self.inner.write().await;
        let state = inner
            .states
            .get_mut(identity)
            .ok_or_else(|| ReputationError::UnknownIdentity(identity.to_string()))?;
        let delta = state.apply_decay(now, &self.config);
        if delta != 0.0 {
            debug!(identity, delta, score = state.score, "decay applied");
        }
        Ok(delta)
    }

    /// Periodic decay over every identity; returns how many changed.
    pub async fn sweep_decay(&self, now: u64) -> usize {
        let mut inner = self.inner.write().await;
        let mut changed = 0;
        for state in inner.states.values_mut() {
            if state.apply_decay(now, &self.config) != 0.0 {
                changed += 1;
            }
        }
        if changed > 0 {
            info!(changed, "decay sweep");
        }
        changed
    }

    pub async fn slash(
        &self,
        identity: &str,
        severity: SlashSeverity,
        now: u64,
    ) -> ReputationResult<ReputationState> {
        let mut inner = self.inner.write().await;
        let state = inner
            .states
            .get_mut(identity)
            .ok_or_else(|| ReputationError::UnknownIdentity(identity.to_string()))?;
        let delta = state.apply_slash(severity, now, &self.config);
        warn!(
            identity,
            ?severity,
            delta,
            score = state.score,
            slashes = state.slash_count,
            "identity slashed"
        );
        Ok(state.clone())
    }

    /// Current state with decay evaluated lazily up to `now`.
    pub async fn state(&self, identity: &str, now: u64) -> ReputationResult<ReputationState> {
        let mut inner = self.inner.write().await;
        let state = inner
            .states
            .get_mut(identity)
            .ok_or_else(|| ReputationError::UnknownIdentity(identity.to_string()))?;
        state.apply_decay(now, &self.config);
        Ok(state.clone())
    }

    pub fn grade(&self, score: f64) -> Grade {
        Grade::from_score(score, &self.config.grades)
    }

    pub async fn history(&self, identity: &str, limit: usize) -> ReputationResult<Vec<ScoreEvent>> {
        let inner = self.inner.read().await;
        let state = inner
            .states
            .get(identity)
            .ok_or_else(|| ReputationError::UnknownIdentity(identity.to_string()))?;
        Ok(state.history().take(limit).cloned().collect())
    }

    /// Read-only view of every identity, sorted by identity. No decay is
    /// evaluated.
    pub async fn snapshot(&self) -> Vec<ReputationState> {
        let inner = self.inner.read().await;
        let mut states: Vec<ReputationState> = inner.states.values().cloned().collect();
        states.sort_by(|a, b| a.identity.cmp(&b.identity));
        states
    }

    pub async fn summary(&self) -> ReputationSummary {
        let inner = self.inner.read().await;
        let mut grades = BTreeMap::new();
        for state in inner.states.values() {
            *grades.entry(state.grade).or_insert(0) += 1;
        }
        ReputationSummary {
            identities: inner.states.len(),
            applied_batches: inner.applied,
            skipped_batches: inner.skipped,
            buffered_batches: inner.parked.len(),
            next_sequence: inner.next_sequence,
            grades,
        }
    }
}

#[async_trait]
impl BatchSink for ReputationEngine {
    async fn on_batch_confirmed(&self, batch: &Batch) -> anyhow::Result<()> {
        ReputationEngine::on_batch_confirmed(self, batch).await?;
        Ok(())
    }

    async fn on_batch_rejected(&self, batch: &Batch) -> anyhow::Result<()> {
        ReputationEngine::on_batch_rejected(self, batch).await?;
        Ok(())
    }
}
