use crate::batch::{build_batch, Batch, SubmissionState};
use crate::channel::{
    ConfirmationEvent, ConfirmationKey, Outcome, SettlementChannel, SubmissionHandle,
};
use crate::error::{BatchError, BatchResult};
use crate::merkle::Hash;
use crate::retry::RetryStrategy;
use crate::store::BatchStore;
use async_trait::async_trait;
use ledger::{short_hex, ActionLedger};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use zk_engine::{Proof, ProofEngine, ProofStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub batch_size_max: usize,
    pub batch_timeout_ms: u64,
    pub max_pending: usize,
    /// Rejections a proof may go through before it is failed permanently.
    pub max_batch_retries: u32,
    pub flush_interval_ms: u64,
    pub submit_retry: RetryStrategy,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            batch_size_max: 100,
            batch_timeout_ms: 60_000,
            max_pending: 1_000,
            max_batch_retries: 3,
            flush_interval_ms: 1_000,
            submit_retry: RetryStrategy::default(),
        }
    }
}

/// Chain audit consulted before a proof is accepted.
#[async_trait]
pub trait ChainVerifier: Send + Sync {
    async fn verify_chain(&self, identity: &str) -> bool;
}

#[async_trait]
impl ChainVerifier for ActionLedger {
    async fn verify_chain(&self, identity: &str) -> bool {
        ActionLedger::verify_chain(self, identity).await
    }
}

/// Receives terminal batch outcomes. Only confirmed batches may change
/// downstream state; rejections are forwarded so consumers can skip the
/// sequence number.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn on_batch_confirmed(&self, batch: &Batch) -> anyhow::Result<()>;
    async fn on_batch_rejected(&self, batch: &Batch) -> anyhow::Result<()>;
}

pub struct NoopSink;

#[async_trait]
impl BatchSink for NoopSink {
    async fn on_batch_confirmed(&self, _batch: &Batch) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_batch_rejected(&self, _batch: &Batch) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatorAlert {
    SubmissionFailed {
        batch_id: String,
        attempts: u32,
        reason: String,
    },
    PermanentBatchFailure {
        batch_id: String,
        records: Vec<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RejectionOutcome {
    pub requeued: usize,
    pub failed: usize,
}

struct PendingProof {
    proof: Proof,
    enqueued_at: Instant,
    /// Came back from a rejected batch; due on the next flush.
    requeued: bool,
}

#[derive(Default)]
struct AggregatorState {
    pending: VecDeque<PendingProof>,
    /// Records pending or inside a non-terminal batch.
    queued: HashSet<Hash>,
    batches: HashMap<String, Batch>,
    /// Roots with a submission in flight or accepted, by batch id.
    active_roots: HashMap<Hash, String>,
    confirmed_roots: HashSet<Hash>,
    /// Last rejected batch per root. A resealed batch can share its root.
    rejected_roots: HashMap<Hash, String>,
    processed: HashSet<String>,
    rejections: HashMap<Hash, u32>,
    next_sequence: u64,
}

impl AggregatorState {
    fn in_flight(&self, batch: &Batch) -> bool {
        match batch.submission_state {
            SubmissionState::Submitted => true,
            SubmissionState::Sealed => {
                self.active_roots.get(&batch.merkle_root) == Some(&batch.batch_id)
            }
            _ => false,
        }
    }
}

/// Pending queue plus sealed batches, guarded by one lock: enqueue, flush and
/// sealing never interleave.
pub struct BatchAggregator {
    config: AggregatorConfig,
    engine: Arc<ProofEngine>,
    chains: Arc<dyn ChainVerifier>,
    channel: Arc<dyn SettlementChannel>,
    store: Arc<dyn BatchStore>,
    sink: Arc<dyn BatchSink>,
    alerts: broadcast::Sender<OperatorAlert>,
    state: Mutex<AggregatorState>,
}

impl BatchAggregator {
    pub fn new(
        config: AggregatorConfig,
        engine: Arc<ProofEngine>,
        chains: Arc<dyn ChainVerifier>,
        channel: Arc<dyn SettlementChannel>,
        store: Arc<dyn BatchStore>,
        sink: Arc<dyn BatchSink>,
    ) -> Self {
        let (alerts, _) = broadcast::channel(64);
        Self {
            config,
            engine,
            chains,
            channel,
            store,
            sink,
            alerts,
            state: Mutex::new(AggregatorState::default()),
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn channel(&self) -> Arc<dyn SettlementChannel> {
        self.channel.clone()
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<OperatorAlert> {
        self.alerts.subscribe()
    }

    fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.config.batch_timeout_ms)
    }

    /// Accepts a generated, verifiable proof whose identity chain audits
    /// clean. Seals and returns a batch when the size threshold is reached.
    pub async fn enqueue(&self, proof: Proof) -> BatchResult<Option<Batch>> {
        let not_verified = |reason: &str| BatchError::RecordNotVerified {
            record: short_hex(&proof.record_hash),
            reason: reason.to_string(),
        };
        if proof.status != ProofStatus::Generated {
            return Err(not_verified(&format!("proof status is {:?}", proof.status)));
        }
        if !self.engine.verify_own(&proof) {
            return Err(not_verified("proof does not verify"));
        }
        if !self.chains.verify_chain(&proof.identity).await {
            return Err(not_verified("identity chain failed verification"));
        }

        let mut state = self.state.lock().await;
        if state.queued.contains(&proof.record_hash) {
            debug!(record = %short_hex(&proof.record_hash), "proof already queued");
            return Ok(None);
        }
        if state.pending.len() >= self.config.max_pending {
            return Err(BatchError::Overflow {
                limit: self.config.max_pending,
            });
        }
        state.queued.insert(proof.record_hash);
        state.pending.push_back(PendingProof {
            proof,
            enqueued_at: Instant::now(),
            requeued: false,
        });
        if state.pending.len() >= self.config.batch_size_max {
            return self.seal_locked(&mut state).await.map(Some);
        }
        Ok(None)
    }

    /// Seals if the pending count or the oldest pending age crossed its
    /// threshold.
    pub async fn flush_due(&self) -> BatchResult<Option<Batch>> {
        let mut state = self.state.lock().await;
        let Some(oldest) = state.pending.front() else {
            return Ok(None);
        };
        let expired = oldest.requeued || oldest.enqueued_at.elapsed() >= self.batch_timeout();
        if expired || state.pending.len() >= self.config.batch_size_max {
            return self.seal_locked(&mut state).await.map(Some);
        }
        Ok(None)
    }

    /// Seals whatever is pending, regardless of thresholds.
    pub async fn flush(&self) -> BatchResult<Option<Batch>> {
        let mut state = self.state.lock().await;
        if state.pending.is_empty() {
            return Ok(None);
        }
        self.seal_locked(&mut state).await.map(Some)
    }

    async fn seal_locked(&self, state: &mut AggregatorState) -> BatchResult<Batch> {
        let take = state.pending.len().min(self.config.batch_size_max);
        let drained: Vec<PendingProof> = state.pending.drain(..take).collect();
        let attempt = drained
            .iter()
            .map(|p| state.rejections.get(&p.proof.record_hash).copied().unwrap_or(0))
            .max()
            .unwrap_or(0);
        let members = drained.iter().map(|p| p.proof.clone()).collect();
        let sealed_at = chrono::Utc::now().timestamp();

        let mut batch = match build_batch(state.next_sequence, attempt, members, sealed_at) {
            Ok(batch) => batch,
            Err(err) => {
                restore_front(state, drained);
                return Err(err);
            }
        };
        batch.submission_state = SubmissionState::Sealed;
        if let Err(err) = self.store.put(&batch).await {
            restore_front(state, drained);
            return Err(BatchError::Store(err.to_string()));
        }

        state.next_sequence += 1;
        state.batches.insert(batch.batch_id.clone(), batch.clone());
        for proof in &batch.proofs {
            if let Err(err) = self
                .engine
                .mark_status(&proof.record_hash, ProofStatus::Batched)
                .await
            {
                warn!(error = %err, "could not mark proof batched");
            }
        }
        info!(
            batch_id = %batch.batch_id,
            sequence = batch.sequence,
            leaves = batch.ordered_leaves.len(),
            root = %batch.root_hex(),
            "sealed batch"
        );
        Ok(batch)
    }

    /// Hands a sealed batch to the settlement channel, retrying with backoff.
    pub async fn submit(&self, batch_id: &str) -> BatchResult<SubmissionHandle> {
        let payload = {
            let mut state = self.state.lock().await;
            let batch = state
                .batches
                .get(batch_id)
                .ok_or_else(|| BatchError::UnknownBatch(batch_id.to_string()))?;
            let root = batch.merkle_root;
            if state.active_roots.contains_key(&root) || state.confirmed_roots.contains(&root) {
                return Err(BatchError::DuplicateRoot(hex::encode(root)));
            }
            if batch.submission_state != SubmissionState::Sealed {
                return Err(BatchError::InvalidTransition {
                    batch_id: batch_id.to_string(),
                    from: batch.submission_state,
                    to: SubmissionState::Submitted,
                });
            }
            let payload = batch.payload();
            state.active_roots.insert(root, batch_id.to_string());
            payload
        };

        let strategy = &self.config.submit_retry;
        let max_attempts = strategy.max_attempts();
        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            match self.channel.submit(payload.clone()).await {
                Ok(handle) => break Ok(handle),
                Err(err) if attempt < max_attempts => {
                    let delay = strategy.delay_for_attempt(attempt);
                    warn!(
                        batch_id,
                        attempt,
                        error = %err,
                        ?delay,
                        "submission failed; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => break Err(err),
            }
        };

        let mut state = self.state.lock().await;
        match result {
            Ok(handle) => {
                let Some(batch) = state.batches.get_mut(batch_id) else {
                    return Err(BatchError::UnknownBatch(batch_id.to_string()));
                };
                // a confirmation may already have overtaken this submission
                if batch.submission_state == SubmissionState::Sealed {
                    batch.submission_state = SubmissionState::Submitted;
                }
                batch.submission_handle = Some(handle.id.clone());
                let snapshot = batch.clone();
                self.store
                    .put(&snapshot)
                    .await
                    .map_err(|e| BatchError::Store(e.to_string()))?;
                info!(batch_id, handle = %handle.id, attempts = attempt, "batch submitted");
                Ok(handle)
            }
            Err(err) => {
                state.active_roots.remove(&payload.merkle_root);
                let reason = err.to_string();
                error!(
                    batch_id,
                    attempts = attempt,
                    error = %reason,
                    "submission retries exhausted"
                );
                let _ = self.alerts.send(OperatorAlert::SubmissionFailed {
                    batch_id: batch_id.to_string(),
                    attempts: attempt,
                    reason: reason.clone(),
                });
                Err(BatchError::SubmissionFailed {
                    batch_id: batch_id.to_string(),
                    attempts: attempt,
                    reason,
                })
            }
        }
    }

    /// Submitted → Confirmed, once. Redeliveries return `Ok(None)`.
    pub async fn on_confirmed(
        &self,
        batch_id: &str,
        confirmation_ref: &str,
    ) -> BatchResult<Option<Batch>> {
        let mut state = self.state.lock().await;
        if state.processed.contains(batch_id) {
            debug!(batch_id, "duplicate confirmation ignored");
            return Ok(None);
        }
        let batch = state
            .batches
            .get(batch_id)
            .ok_or_else(|| BatchError::UnknownBatch(batch_id.to_string()))?;
        if !state.in_flight(batch) {
            return Err(BatchError::InvalidTransition {
                batch_id: batch_id.to_string(),
                from: batch.submission_state,
                to: SubmissionState::Confirmed,
            });
        }
        let mut confirmed = batch.clone();
        confirmed.submission_state = SubmissionState::Confirmed;
        confirmed.confirmation_ref = Some(confirmation_ref.to_string());

        // The sink is idempotent by batch id, so a failure below is safe to
        // retry on the next delivery.
        self.sink
            .on_batch_confirmed(&confirmed)
            .await
            .map_err(|e| BatchError::Sink(e.to_string()))?;
        self.store
            .put(&confirmed)
            .await
            .map_err(|e| BatchError::Store(e.to_string()))?;

        state.processed.insert(batch_id.to_string());
        state.active_roots.remove(&confirmed.merkle_root);
        state.confirmed_roots.insert(confirmed.merkle_root);
        for proof in &confirmed.proofs {
            state.queued.remove(&proof.record_hash);
            state.rejections.remove(&proof.record_hash);
        }
        state
            .batches
            .insert(batch_id.to_string(), confirmed.clone());
        drop(state);

        for proof in &confirmed.proofs {
            if let Err(err) = self
                .engine
                .mark_status(&proof.record_hash, ProofStatus::Confirmed)
                .await
            {
                warn!(error = %err, "could not mark proof confirmed");
            }
        }
        info!(batch_id, confirmation = confirmation_ref, "batch confirmed");
        Ok(Some(confirmed))
    }

    /// Submitted → Rejected. Members go back to the front of the queue for a
    /// fresh batch until they exhaust `max_batch_retries`.
    pub async fn on_rejected(
        &self,
        batch_id: &str,
        reason: &str,
    ) -> BatchResult<Option<RejectionOutcome>> {
        let mut state = self.state.lock().await;
        if state.processed.contains(batch_id) {
            debug!(batch_id, "duplicate rejection ignored");
            return Ok(None);
        }
        let batch = state
            .batches
            .get(batch_id)
            .ok_or_else(|| BatchError::UnknownBatch(batch_id.to_string()))?;
        if !state.in_flight(batch) {
            return Err(BatchError::InvalidTransition {
                batch_id: batch_id.to_string(),
                from: batch.submission_state,
                to: SubmissionState::Rejected,
            });
        }
        let mut rejected = batch.clone();
        rejected.submission_state = SubmissionState::Rejected;
        self.store
            .put(&rejected)
            .await
            .map_err(|e| BatchError::Store(e.to_string()))?;
        self.sink
            .on_batch_rejected(&rejected)
            .await
            .map_err(|e| BatchError::Sink(e.to_string()))?;

        state.processed.insert(batch_id.to_string());
        state.active_roots.remove(&rejected.merkle_root);
        state
            .rejected_roots
            .insert(rejected.merkle_root, batch_id.to_string());
        state
            .batches
            .insert(batch_id.to_string(), rejected.clone());
        warn!(batch_id, reason, "batch rejected");

        let requeued_at = Instant::now();
        let mut outcome = RejectionOutcome::default();
        let mut failed = Vec::new();
        let mut requeue = Vec::new();
        for proof in rejected.proofs {
            let count = state.rejections.entry(proof.record_hash).or_insert(0);
            *count += 1;
            if *count > self.config.max_batch_retries {
                state.queued.remove(&proof.record_hash);
                failed.push(proof);
            } else {
                requeue.push(proof);
            }
        }
        for proof in requeue.into_iter().rev() {
            state.pending.push_front(PendingProof {
                proof,
                enqueued_at: requeued_at,
                requeued: true,
            });
            outcome.requeued += 1;
        }
        outcome.failed = failed.len();
        drop(state);

        for pending in &failed {
            if let Err(err) = self
                .engine
                .mark_status(&pending.record_hash, ProofStatus::Failed)
                .await
            {
                warn!(error = %err, "could not mark proof failed");
            }
        }
        if !failed.is_empty() {
            let records: Vec<String> = failed.iter().map(|p| hex::encode(p.record_hash)).collect();
            error!(batch_id, records = records.len(), "permanent batch failure");
            let _ = self.alerts.send(OperatorAlert::PermanentBatchFailure {
                batch_id: batch_id.to_string(),
                records,
            });
            return Err(BatchError::PermanentBatchFailure {
                batch_id: batch_id.to_string(),
                records: failed.len(),
            });
        }
        Ok(Some(outcome))
    }

    /// Routes a channel event keyed by batch id or merkle root.
    ///
    /// Root-keyed rejections are only trusted for a root's first submission:
    /// once a root has been rejected, a root-keyed rejection cannot be told
    /// apart from a redelivery and is dropped. Settlement layers that resubmit
    /// roots must key outcomes by batch id.
    pub async fn handle_event(&self, event: ConfirmationEvent) -> BatchResult<()> {
        let batch_id = match &event.key {
            ConfirmationKey::BatchId(id) => id.clone(),
            ConfirmationKey::MerkleRoot(root) => {
                let state = self.state.lock().await;
                let rejection = matches!(event.outcome, Outcome::Rejected { .. });
                if let Some(rejected) = state.rejected_roots.get(root).filter(|_| rejection) {
                    debug!(
                        root = %hex::encode(root),
                        last_rejected = %rejected,
                        "root-keyed rejection dropped"
                    );
                    return Ok(());
                }
                let settled = state.confirmed_roots.contains(root)
                    || state.rejected_roots.contains_key(root);
                match state.active_roots.get(root) {
                    Some(id) => id.clone(),
                    None if settled => {
                        debug!(root = %hex::encode(root), "late event for settled root");
                        return Ok(());
                    }
                    None => return Err(BatchError::UnknownBatch(hex::encode(root))),
                }
            }
        };
        match event.outcome {
            Outcome::Confirmed { confirmation_ref } => {
                self.on_confirmed(&batch_id, &confirmation_ref).await?;
            }
            Outcome::Rejected { reason } => {
                self.on_rejected(&batch_id, &reason).await?;
            }
        }
        Ok(())
    }

    /// Sealed batches with no submission in flight, oldest first.
    pub async fn unsubmitted(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut ids: Vec<(u64, String)> = state
            .batches
            .values()
            .filter(|b| b.submission_state == SubmissionState::Sealed && !state.in_flight(b))
            .map(|b| (b.sequence, b.batch_id.clone()))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    pub async fn batch(&self, batch_id: &str) -> Option<Batch> {
        self.state.lock().await.batches.get(batch_id).cloned()
    }

    pub async fn batches(&self) -> Vec<Batch> {
        let mut batches: Vec<Batch> = self.state.lock().await.batches.values().cloned().collect();
        batches.sort_by_key(|b| b.sequence);
        batches
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Pending, or held by a batch that has not settled.
    pub async fn is_queued(&self, record_hash: &Hash) -> bool {
        self.state.lock().await.queued.contains(record_hash)
    }
}

fn restore_front(state: &mut AggregatorState, drained: Vec<PendingProof>) {
    for pending in drained.into_iter().rev() {
        state.pending.push_front(pending);
    }
}
