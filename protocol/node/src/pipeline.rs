use crate::config::NodeConfig;
use anyhow::Context;
use ledger::{
    short_hex, ActionLedger, ActionRecord, ActionType, ActionTypeRegistry, FileLedgerStore,
    InMemoryIdentityProvider, InMemoryLedgerStore, LedgerStore,
};
use reputation::ReputationEngine;
use sequencer_core::{
    spawn_confirmation_listener, spawn_flush_loop, BatchAggregator, BatchError, InMemoryBatchStore,
    InMemorySettlement, SettlementChannel,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use zk_core::{StubBackend, StubConfig, VerificationKey};
use zk_engine::{InMemoryProofStore, PredicateSet, Proof, ProofEngine, ProofStatus};

/// The result of pushing one action through the pipeline.
#[derive(Debug, Clone)]
pub struct RecordedAction {
    pub record: ActionRecord,
    pub proof: Proof,
    /// Set when this action filled a batch.
    pub sealed_batch: Option<String>,
}

/// What one pass over stranded proofs moved forward.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StrandedSweep {
    pub regenerated: usize,
    pub enqueued: usize,
}

/// Every core component, wired together. Cheap to clone.
#[derive(Clone)]
pub struct Pipeline {
    pub ledger: Arc<ActionLedger>,
    pub identities: Arc<InMemoryIdentityProvider>,
    pub registry: Arc<ActionTypeRegistry>,
    pub engine: Arc<ProofEngine>,
    pub aggregator: Arc<BatchAggregator>,
    pub reputation: Arc<ReputationEngine>,
    pub settlement: InMemorySettlement,
    shutdown: Arc<watch::Sender<bool>>,
    decay_sweep: Duration,
    audit_interval: Duration,
    retry_sweep: Duration,
}

impl Pipeline {
    pub async fn build(config: &NodeConfig) -> anyhow::Result<Self> {
        let registry = Arc::new(config.registry());

        let identities = Arc::new(InMemoryIdentityProvider::new());
        for identity in &config.identities {
            identities.register_seed(&identity.did, &identity.seed).await;
        }

        let store: Arc<dyn LedgerStore> = match &config.data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("creating {}", dir.display()))?;
                Arc::new(FileLedgerStore::open(dir.join("ledger.jsonl"))?)
            }
            None => Arc::new(InMemoryLedgerStore::new()),
        };
        let ledger = Arc::new(ActionLedger::new(config.ledger.clone(), store, identities.clone()));

        let circuit = zk_program_action::descriptor();
        let backend = Arc::new(StubBackend::new(StubConfig {
            circuits: vec![circuit.clone()],
            latency: Duration::from_millis(config.prover_latency_ms),
        }));
        let engine = Arc::new(ProofEngine::new(
            config.proofs.clone(),
            backend,
            Arc::new(PredicateSet::with_builtins(registry.clone())),
            Arc::new(InMemoryProofStore::new()),
            VerificationKey::derive(&circuit),
        ));

        let reputation = Arc::new(ReputationEngine::new(
            config.reputation.clone(),
            registry.clone(),
        ));
        let now = now_secs();
        for identity in &config.identities {
            reputation.register(&identity.did, now).await;
        }

        let settlement = if config.settlement.auto_confirm {
            InMemorySettlement::auto_confirming(config.settlement.event_capacity)
        } else {
            InMemorySettlement::new(config.settlement.event_capacity)
        };
        let aggregator = Arc::new(BatchAggregator::new(
            config.aggregator.clone(),
            engine.clone(),
            ledger.clone(),
            Arc::new(settlement.clone()),
            Arc::new(InMemoryBatchStore::new()),
            reputation.clone(),
        ));

        let (shutdown, _) = watch::channel(false);
        info!(
            identities = config.identities.len(),
            action_types = registry.len(),
            durable = config.data_dir.is_some(),
            "pipeline ready"
        );
        Ok(Self {
            ledger,
            identities,
            registry,
            engine,
            aggregator,
            reputation,
            settlement,
            shutdown: Arc::new(shutdown),
            decay_sweep: Duration::from_secs(config.decay_sweep_secs.max(1)),
            audit_interval: Duration::from_secs(config.audit_interval_secs.max(1)),
            retry_sweep: Duration::from_secs(config.retry_sweep_secs.max(1)),
        })
    }

    /// append → generate → enqueue. A batch sealed by this action is
    /// submitted right away; failed submissions are picked up by the flush
    /// loop. A record whose proof is cancelled or refused by a full queue is
    /// still on the ledger and is carried forward by the stranded sweep.
    pub async fn record_action(
        &self,
        identity: &str,
        action_type: &str,
        timestamp: u64,
        payload: &[u8],
    ) -> anyhow::Result<RecordedAction> {
        let record = self
            .ledger
            .append(identity, ActionType::new(action_type), timestamp, payload)
            .await?;
        let proof = self.engine.generate(&record, payload).await?;
        let sealed = self.aggregator.enqueue(proof.clone()).await?;
        let sealed_batch = sealed.map(|batch| batch.batch_id);
        if let Some(batch_id) = &sealed_batch {
            self.submit_sealed(batch_id).await;
        }
        Ok(RecordedAction {
            record,
            proof,
            sealed_batch,
        })
    }

    async fn submit_sealed(&self, batch_id: &str) {
        if let Err(err) = self.aggregator.submit(batch_id).await {
            warn!(batch_id = %batch_id, error = %err, "immediate submission failed");
        }
    }

    /// Regenerates proofs left `Pending` and enqueues generated proofs the
    /// aggregator is not holding.
    pub async fn retry_stranded(&self) -> anyhow::Result<StrandedSweep> {
        let mut sweep = StrandedSweep::default();
        for stale in self.engine.pending().await? {
            let hash = stale.record_hash;
            let (Some(record), Some(payload)) =
                (self.ledger.record(&hash).await?, self.ledger.payload(&hash).await?)
            else {
                warn!(record = %short_hex(&hash), "pending proof has no ledger record");
                continue;
            };
            match self.engine.generate(&record, &payload).await {
                Ok(_) => sweep.regenerated += 1,
                Err(err) => warn!(record = %short_hex(&hash), error = %err, "regeneration failed"),
            }
        }

        for proof in self.engine.with_status(ProofStatus::Generated).await? {
            if self.aggregator.is_queued(&proof.record_hash).await {
                continue;
            }
            let hash = proof.record_hash;
            match self.aggregator.enqueue(proof).await {
                Ok(sealed) => {
                    sweep.enqueued += 1;
                    if let Some(batch) = sealed {
                        self.submit_sealed(&batch.batch_id).await;
                    }
                }
                Err(BatchError::Overflow { limit }) => {
                    debug!(limit, "queue still full; stranded proofs wait for the next sweep");
                    break;
                }
                Err(err) => {
                    warn!(record = %short_hex(&hash), error = %err, "stranded proof not enqueued")
                }
            }
        }
        if sweep != StrandedSweep::default() {
            info!(
                regenerated = sweep.regenerated,
                enqueued = sweep.enqueued,
                "stranded proofs recovered"
            );
        }
        Ok(sweep)
    }

    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![
            spawn_flush_loop(self.aggregator.clone(), self.shutdown.subscribe()),
            spawn_confirmation_listener(
                self.aggregator.clone(),
                self.settlement.subscribe_confirmations(),
                self.shutdown.subscribe(),
            ),
        ];
        tasks.push(self.spawn_decay_sweep());
        tasks.push(self.spawn_chain_audit());
        tasks.push(self.spawn_retry_sweep());
        tasks.push(self.spawn_alert_log());
        tasks
    }

    fn spawn_decay_sweep(&self) -> JoinHandle<()> {
        let reputation = self.reputation.clone();
        let mut shutdown = self.shutdown.subscribe();
        let period = self.decay_sweep;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        reputation.sweep_decay(now_secs()).await;
                    }
                    _ = shutdown.changed() => return,
                }
            }
        })
    }

    fn spawn_chain_audit(&self) -> JoinHandle<()> {
        let ledger = self.ledger.clone();
        let mut shutdown = self.shutdown.subscribe();
        let period = self.audit_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => return,
                }
                let identities = match ledger.identities().await {
                    Ok(identities) => identities,
                    Err(err) => {
                        warn!(error = %err, "chain audit skipped");
                        continue;
                    }
                };
                for identity in identities {
                    if let Err(err) = ledger.audit_chain(&identity).await {
                        error!(
                            identity = %identity,
                            error = %err,
                            "chain audit failed; identity halted"
                        );
                    }
                }
            }
        })
    }

    fn spawn_retry_sweep(&self) -> JoinHandle<()> {
        let pipeline = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        let period = self.retry_sweep;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = pipeline.retry_stranded().await {
                            warn!(error = %err, "stranded sweep failed");
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        })
    }

    fn spawn_alert_log(&self) -> JoinHandle<()> {
        let mut alerts = self.aggregator.subscribe_alerts();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    alert = alerts.recv() => match alert {
                        Ok(alert) => error!(?alert, "operator alert"),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "operator alerts dropped");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    },
                    _ = shutdown.changed() => return,
                }
            }
        })
    }

    /// Stops background loops and cancels in-flight proofs.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.engine.shutdown();
    }
}

pub fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
