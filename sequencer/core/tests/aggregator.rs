use async_trait::async_trait;
use ledger::{ActionLedger, InMemoryIdentityProvider, InMemoryLedgerStore, LedgerConfig};
use sequencer_core::{
    spawn_confirmation_listener, spawn_flush_loop, AggregatorConfig, Batch, BatchAggregator,
    BatchError, BatchSink, BatchStore, ChainVerifier, ConfirmationEvent, ConfirmationKey,
    InMemoryBatchStore, InMemorySettlement, NoopSink, OperatorAlert, Outcome, RejectionOutcome,
    RetryStrategy, SettlementChannel, SubmissionState,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use zk_core::{StubBackend, StubConfig, VerificationKey};
use zk_engine::{AcceptAll, InMemoryProofStore, Proof, ProofEngine, ProofEngineConfig, ProofStatus};

const DIDS: [&str; 2] = ["did:robo:courier-1", "did:robo:courier-2"];

struct Fixture {
    ledger: Arc<ActionLedger>,
    engine: Arc<ProofEngine>,
    settlement: InMemorySettlement,
    store: InMemoryBatchStore,
}

async fn fixture() -> Fixture {
    let ids = InMemoryIdentityProvider::new();
    for did in DIDS {
        ids.register_seed(did, did).await;
    }
    let ledger = ActionLedger::new(
        LedgerConfig::default(),
        Arc::new(InMemoryLedgerStore::new()),
        Arc::new(ids),
    );
    let engine = ProofEngine::new(
        ProofEngineConfig::default(),
        Arc::new(StubBackend::new(StubConfig {
            circuits: vec![zk_program_action::descriptor()],
            latency: Duration::ZERO,
        })),
        Arc::new(AcceptAll),
        Arc::new(InMemoryProofStore::new()),
        VerificationKey::derive(&zk_program_action::descriptor()),
    );
    Fixture {
        ledger: Arc::new(ledger),
        engine: Arc::new(engine),
        settlement: InMemorySettlement::new(64),
        store: InMemoryBatchStore::new(),
    }
}

impl Fixture {
    fn aggregator(
        &self,
        config: AggregatorConfig,
        sink: Arc<dyn BatchSink>,
    ) -> Arc<BatchAggregator> {
        self.aggregator_with(config, self.ledger.clone(), sink)
    }

    fn aggregator_with(
        &self,
        config: AggregatorConfig,
        chains: Arc<dyn ChainVerifier>,
        sink: Arc<dyn BatchSink>,
    ) -> Arc<BatchAggregator> {
        Arc::new(BatchAggregator::new(
            config,
            self.engine.clone(),
            chains,
            Arc::new(self.settlement.clone()),
            Arc::new(self.store.clone()),
            sink,
        ))
    }

    async fn proofs(&self, count: u64) -> Vec<Proof> {
        let mut proofs = Vec::new();
        for i in 0..count {
            let did = DIDS[(i % 2) as usize];
            let payload = format!("parcel-{i}").into_bytes();
            let record = self
                .ledger
                .append(did, "DELIV_DONE".into(), 100 + i, &payload)
                .await
                .unwrap();
            proofs.push(self.engine.generate(&record, &payload).await.unwrap());
        }
        proofs
    }
}

fn config(batch_size_max: usize) -> AggregatorConfig {
    AggregatorConfig {
        batch_size_max,
        batch_timeout_ms: 60_000,
        submit_retry: RetryStrategy::Fixed {
            max_attempts: 2,
            delay_ms: 1,
        },
        ..AggregatorConfig::default()
    }
}

#[derive(Default)]
struct CountingSink {
    confirmed: AtomicUsize,
    rejected: AtomicUsize,
}

#[async_trait]
impl BatchSink for CountingSink {
    async fn on_batch_confirmed(&self, _batch: &Batch) -> anyhow::Result<()> {
        self.confirmed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_batch_rejected(&self, _batch: &Batch) -> anyhow::Result<()> {
        self.rejected.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct BrokenChains;

#[async_trait]
impl ChainVerifier for BrokenChains {
    async fn verify_chain(&self, _identity: &str) -> bool {
        false
    }
}

async fn sealed(agg: &BatchAggregator, proofs: Vec<Proof>) -> Batch {
    let mut last = None;
    for proof in proofs {
        last = agg.enqueue(proof).await.unwrap().or(last);
    }
    match last {
        Some(batch) => batch,
        None => agg.flush().await.unwrap().unwrap(),
    }
}

#[tokio::test]
async fn seals_when_size_threshold_is_reached() {
    let fx = fixture().await;
    let agg = fx.aggregator(config(3), Arc::new(NoopSink));
    let proofs = fx.proofs(3).await;

    assert!(agg.enqueue(proofs[0].clone()).await.unwrap().is_none());
    assert!(agg.enqueue(proofs[1].clone()).await.unwrap().is_none());
    let batch = agg.enqueue(proofs[2].clone()).await.unwrap().unwrap();

    assert_eq!(batch.submission_state, SubmissionState::Sealed);
    assert_eq!(batch.ordered_leaves.len(), 3);
    assert!(batch.verify_integrity());
    assert_eq!(agg.pending_len().await, 0);
    // leaves ordered by identity, then timestamp
    let keys: Vec<_> = batch
        .ordered_leaves
        .iter()
        .map(|l| (l.identity.clone(), l.timestamp))
        .collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);
    assert_eq!(
        fx.engine.get(&proofs[0].record_hash).await.unwrap().status,
        ProofStatus::Batched
    );
    assert!(fx.store.get(&batch.batch_id).await.unwrap().is_some());
}

#[tokio::test]
async fn seals_when_oldest_proof_times_out() {
    let fx = fixture().await;
    let agg = fx.aggregator(
        AggregatorConfig {
            batch_timeout_ms: 50,
            ..config(10)
        },
        Arc::new(NoopSink),
    );
    for proof in fx.proofs(2).await {
        agg.enqueue(proof).await.unwrap();
    }
    assert!(agg.flush_due().await.unwrap().is_none());
    tokio::time::sleep(Duration::from_millis(80)).await;
    let batch = agg.flush_due().await.unwrap().unwrap();
    assert_eq!(batch.ordered_leaves.len(), 2);
    assert!(agg.flush_due().await.unwrap().is_none());
}

#[tokio::test]
async fn duplicate_and_overflowing_enqueues() {
    let fx = fixture().await;
    let agg = fx.aggregator(
        AggregatorConfig {
            max_pending: 2,
            ..config(10)
        },
        Arc::new(NoopSink),
    );
    let proofs = fx.proofs(3).await;
    agg.enqueue(proofs[0].clone()).await.unwrap();
    assert!(agg.enqueue(proofs[0].clone()).await.unwrap().is_none());
    agg.enqueue(proofs[1].clone()).await.unwrap();
    assert_eq!(agg.pending_len().await, 2);
    assert_eq!(
        agg.enqueue(proofs[2].clone()).await.unwrap_err(),
        BatchError::Overflow { limit: 2 }
    );
}

#[tokio::test]
async fn unverified_records_are_refused() {
    let fx = fixture().await;
    let proofs = fx.proofs(2).await;

    let agg = fx.aggregator_with(config(10), Arc::new(BrokenChains), Arc::new(NoopSink));
    assert!(matches!(
        agg.enqueue(proofs[0].clone()).await,
        Err(BatchError::RecordNotVerified { .. })
    ));

    let agg = fx.aggregator(config(10), Arc::new(NoopSink));
    let mut not_generated = proofs[1].clone();
    not_generated.status = ProofStatus::Pending;
    assert!(matches!(
        agg.enqueue(not_generated).await,
        Err(BatchError::RecordNotVerified { .. })
    ));

    let mut forged = proofs[1].clone();
    forged.proof_bytes[0] ^= 0xff;
    assert!(matches!(
        agg.enqueue(forged).await,
        Err(BatchError::RecordNotVerified { .. })
    ));
    assert_eq!(agg.pending_len().await, 0);
}

#[tokio::test]
async fn same_root_is_not_submitted_twice() {
    let fx = fixture().await;
    let agg = fx.aggregator(config(2), Arc::new(NoopSink));
    let batch = sealed(&agg, fx.proofs(2).await).await;

    let handle = agg.submit(&batch.batch_id).await.unwrap();
    assert_eq!(handle.merkle_root, batch.merkle_root);
    assert_eq!(
        agg.batch(&batch.batch_id).await.unwrap().submission_state,
        SubmissionState::Submitted
    );
    assert!(matches!(
        agg.submit(&batch.batch_id).await,
        Err(BatchError::DuplicateRoot(_))
    ));
    assert_eq!(fx.settlement.submissions().await.len(), 1);
}

#[tokio::test]
async fn confirmations_are_processed_once() {
    let fx = fixture().await;
    let sink = Arc::new(CountingSink::default());
    let agg = fx.aggregator(config(2), sink.clone());
    let batch = sealed(&agg, fx.proofs(2).await).await;
    agg.submit(&batch.batch_id).await.unwrap();

    let event = ConfirmationEvent {
        key: ConfirmationKey::MerkleRoot(batch.merkle_root),
        outcome: Outcome::Confirmed {
            confirmation_ref: "settle-1".into(),
        },
    };
    agg.handle_event(event.clone()).await.unwrap();
    agg.handle_event(event).await.unwrap();
    assert!(agg
        .on_confirmed(&batch.batch_id, "settle-1")
        .await
        .unwrap()
        .is_none());

    assert_eq!(sink.confirmed.load(Ordering::SeqCst), 1);
    let stored = agg.batch(&batch.batch_id).await.unwrap();
    assert_eq!(stored.submission_state, SubmissionState::Confirmed);
    assert_eq!(stored.confirmation_ref.as_deref(), Some("settle-1"));
    for leaf in &stored.ordered_leaves {
        assert_eq!(
            fx.engine.get(&leaf.record_hash).await.unwrap().status,
            ProofStatus::Confirmed
        );
    }
    // a confirmed root can never be submitted again
    assert!(matches!(
        agg.submit(&batch.batch_id).await,
        Err(BatchError::DuplicateRoot(_))
    ));
}

#[tokio::test]
async fn rejected_members_are_requeued_until_retries_run_out() {
    let fx = fixture().await;
    let sink = Arc::new(CountingSink::default());
    let agg = fx.aggregator(
        AggregatorConfig {
            max_batch_retries: 1,
            ..config(3)
        },
        sink.clone(),
    );
    let mut alerts = agg.subscribe_alerts();
    let first = sealed(&agg, fx.proofs(3).await).await;
    agg.submit(&first.batch_id).await.unwrap();

    let outcome = agg.on_rejected(&first.batch_id, "bad root").await.unwrap();
    assert_eq!(
        outcome,
        Some(RejectionOutcome {
            requeued: 3,
            failed: 0
        })
    );
    assert_eq!(agg.pending_len().await, 3);
    assert_eq!(sink.rejected.load(Ordering::SeqCst), 1);
    assert_eq!(sink.confirmed.load(Ordering::SeqCst), 0);

    // requeued proofs are already due
    let second = agg.flush_due().await.unwrap().unwrap();
    assert_eq!(second.sequence, first.sequence + 1);
    assert_eq!(second.attempt, 1);
    agg.submit(&second.batch_id).await.unwrap();

    let err = agg.on_rejected(&second.batch_id, "bad root").await.unwrap_err();
    assert_eq!(
        err,
        BatchError::PermanentBatchFailure {
            batch_id: second.batch_id.clone(),
            records: 3
        }
    );
    assert!(matches!(
        alerts.recv().await.unwrap(),
        OperatorAlert::PermanentBatchFailure { records, .. } if records.len() == 3
    ));
    assert_eq!(agg.pending_len().await, 0);
    for leaf in &second.ordered_leaves {
        assert_eq!(
            fx.engine.get(&leaf.record_hash).await.unwrap().status,
            ProofStatus::Failed
        );
    }
}

#[tokio::test]
async fn redelivered_rejection_leaves_the_resealed_batch_alone() {
    let fx = fixture().await;
    let sink = Arc::new(CountingSink::default());
    let agg = fx.aggregator(config(3), sink.clone());
    let mut events = fx.settlement.subscribe_confirmations();
    let first = sealed(&agg, fx.proofs(3).await).await;
    let first_handle = agg.submit(&first.batch_id).await.unwrap();

    fx.settlement.reject(first.merkle_root, "bad root").await;
    let rejection = events.recv().await.unwrap();
    assert_eq!(rejection.key, ConfirmationKey::BatchId(first.batch_id.clone()));
    agg.handle_event(rejection.clone()).await.unwrap();

    // same members, same root, fresh submission
    let second = agg.flush_due().await.unwrap().unwrap();
    assert_eq!(second.merkle_root, first.merkle_root);
    let second_handle = agg.submit(&second.batch_id).await.unwrap();
    assert_ne!(second_handle.id, first_handle.id);
    assert_eq!(fx.settlement.submissions().await.len(), 2);

    agg.handle_event(rejection).await.unwrap();
    agg.handle_event(ConfirmationEvent {
        key: ConfirmationKey::MerkleRoot(first.merkle_root),
        outcome: Outcome::Rejected {
            reason: "bad root".into(),
        },
    })
    .await
    .unwrap();
    assert_eq!(
        agg.batch(&second.batch_id).await.unwrap().submission_state,
        SubmissionState::Submitted
    );
    assert_eq!(sink.rejected.load(Ordering::SeqCst), 1);

    fx.settlement.confirm(second.merkle_root).await;
    agg.handle_event(events.recv().await.unwrap()).await.unwrap();
    assert_eq!(
        agg.batch(&second.batch_id).await.unwrap().submission_state,
        SubmissionState::Confirmed
    );
    assert_eq!(sink.confirmed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn exhausted_submission_raises_an_alert() {
    let fx = fixture().await;
    let agg = fx.aggregator(config(2), Arc::new(NoopSink));
    let mut alerts = agg.subscribe_alerts();
    let batch = sealed(&agg, fx.proofs(2).await).await;

    fx.settlement.fail_next(2);
    let err = agg.submit(&batch.batch_id).await.unwrap_err();
    assert!(matches!(err, BatchError::SubmissionFailed { attempts: 2, .. }));
    assert!(matches!(
        alerts.recv().await.unwrap(),
        OperatorAlert::SubmissionFailed { attempts: 2, .. }
    ));
    assert_eq!(agg.unsubmitted().await, vec![batch.batch_id.clone()]);

    // the batch stays sealed and can be resubmitted
    agg.submit(&batch.batch_id).await.unwrap();
    assert!(agg.unsubmitted().await.is_empty());
}

#[tokio::test]
async fn background_loops_settle_batches() {
    let fx = fixture().await;
    let settlement = InMemorySettlement::auto_confirming(64);
    let sink = Arc::new(CountingSink::default());
    let agg = Arc::new(BatchAggregator::new(
        AggregatorConfig {
            batch_timeout_ms: 10,
            flush_interval_ms: 5,
            ..config(100)
        },
        fx.engine.clone(),
        fx.ledger.clone(),
        Arc::new(settlement.clone()),
        Arc::new(fx.store.clone()),
        sink.clone(),
    ));
    let (stop, stopped) = watch::channel(false);
    let listener = spawn_confirmation_listener(
        agg.clone(),
        settlement.subscribe_confirmations(),
        stopped.clone(),
    );
    let flusher = spawn_flush_loop(agg.clone(), stopped);

    for proof in fx.proofs(4).await {
        agg.enqueue(proof).await.unwrap();
    }
    let mut confirmed = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if sink.confirmed.load(Ordering::SeqCst) == 1 {
            confirmed = true;
            break;
        }
    }
    stop.send(true).unwrap();
    listener.await.unwrap();
    flusher.await.unwrap();

    assert!(confirmed);
    let batches = agg.batches().await;
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].submission_state, SubmissionState::Confirmed);
}
