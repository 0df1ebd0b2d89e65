use ledger::{
    ActionLedger, ActionRecord, ActionTypeEntry, ActionTypeRegistry, InMemoryIdentityProvider,
    InMemoryLedgerStore, LedgerConfig,
};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use zk_core::{CircuitDescriptor, StubBackend, StubConfig, VerificationKey};
use zk_engine::{
    AcceptAll, InMemoryProofStore, PredicateSet, ProofEngine, ProofEngineConfig, ProofError,
    ProofStatus, ProofStore,
};

const DID: &str = "did:robo:drone-3";

async fn ledger() -> ActionLedger {
    let ids = InMemoryIdentityProvider::new();
    ids.register_seed(DID, "drone-3").await;
    ActionLedger::new(
        LedgerConfig::default(),
        Arc::new(InMemoryLedgerStore::new()),
        Arc::new(ids),
    )
}

fn backend(latency: Duration) -> Arc<StubBackend> {
    Arc::new(StubBackend::new(StubConfig {
        circuits: vec![zk_program_action::descriptor()],
        latency,
    }))
}

fn engine_with(
    backend: Arc<StubBackend>,
    config: ProofEngineConfig,
) -> (ProofEngine, InMemoryProofStore) {
    let store = InMemoryProofStore::new();
    let key = VerificationKey::derive(&zk_program_action::descriptor());
    let engine = ProofEngine::new(
        config,
        backend,
        Arc::new(AcceptAll),
        Arc::new(store.clone()),
        key,
    );
    (engine, store)
}

async fn record(ledger: &ActionLedger, ts: u64, payload: &[u8]) -> ActionRecord {
    ledger
        .append(DID, "DELIV_DONE".into(), ts, payload)
        .await
        .unwrap()
}

proptest! {
    #[test]
    fn proofs_do_not_verify_against_other_records(
        a in prop::collection::vec(any::<u8>(), 1..128),
        b in prop::collection::vec(any::<u8>(), 1..128),
    ) {
        let rt = Runtime::new().expect("tokio runtime");
        let (ok_own, ok_other) = rt.block_on(async {
            let ledger = ledger().await;
            let (engine, _) = engine_with(backend(Duration::ZERO), ProofEngineConfig::default());
            let ra = record(&ledger, 10, &a).await;
            let rb = record(&ledger, 11, &b).await;
            let pa = engine.generate(&ra, &a).await.unwrap();
            let other_inputs = engine.public_inputs(&rb);
            (
                engine.verify(&pa, &pa.public_inputs, engine.key()),
                engine.verify(&pa, &other_inputs, engine.key()),
            )
        });
        prop_assert!(ok_own);
        prop_assert!(!ok_other);
    }
}

#[tokio::test]
async fn second_generate_returns_cached_proof() {
    let ledger = ledger().await;
    let (engine, store) = engine_with(backend(Duration::ZERO), ProofEngineConfig::default());
    let r = record(&ledger, 5, b"parcel").await;

    let first = engine.generate(&r, b"parcel").await.unwrap();
    let second = engine.generate(&r, b"parcel").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.status, ProofStatus::Generated);

    let stats = engine.statistics().await;
    assert_eq!(stats.generated, 1);
    assert_eq!(stats.cache_hits, 1);
    let stored = store.get(&r.record_hash).await.unwrap().unwrap();
    assert_eq!(stored.status, ProofStatus::Generated);
}

#[tokio::test]
async fn predicate_failure_is_invalid_witness() {
    let ledger = ledger().await;
    let registry = Arc::new(ActionTypeRegistry::from(vec![ActionTypeEntry::new(
        "DELIV_DONE",
        5.0,
        Some("json_object"),
        "",
    )]));
    let store = InMemoryProofStore::new();
    let engine = ProofEngine::new(
        ProofEngineConfig::default(),
        backend(Duration::ZERO),
        Arc::new(PredicateSet::with_builtins(registry)),
        Arc::new(store.clone()),
        VerificationKey::derive(&zk_program_action::descriptor()),
    );
    let r = record(&ledger, 1, b"not json").await;
    let err = engine.generate(&r, b"not json").await.unwrap_err();
    assert!(matches!(err, ProofError::InvalidWitness(_)));
    assert_eq!(
        engine.get(&r.record_hash).await.unwrap().status,
        ProofStatus::Failed
    );
}

#[tokio::test]
async fn payload_must_match_record() {
    let ledger = ledger().await;
    let (engine, _) = engine_with(backend(Duration::ZERO), ProofEngineConfig::default());
    let r = record(&ledger, 1, b"original").await;
    let err = engine.generate(&r, b"swapped").await.unwrap_err();
    assert!(matches!(err, ProofError::InvalidWitness(_)));
}

#[tokio::test]
async fn stale_key_is_a_mismatch() {
    let ledger = ledger().await;
    let stale = VerificationKey::derive(&CircuitDescriptor {
        version: "2.0.0".into(),
        ..zk_program_action::descriptor()
    });
    let engine = ProofEngine::new(
        ProofEngineConfig::default(),
        backend(Duration::ZERO),
        Arc::new(AcceptAll),
        Arc::new(InMemoryProofStore::new()),
        stale,
    );
    let r = record(&ledger, 1, b"x").await;
    let err = engine.generate(&r, b"x").await.unwrap_err();
    assert!(matches!(err, ProofError::KeyMismatch { .. }));
}

#[tokio::test]
async fn timeouts_are_retried_then_fail() {
    let ledger = ledger().await;
    let (engine, _) = engine_with(
        backend(Duration::from_millis(300)),
        ProofEngineConfig {
            timeout_ms: 20,
            max_attempts: 2,
            ..ProofEngineConfig::default()
        },
    );
    let r = record(&ledger, 1, b"slow").await;
    let err = engine.generate(&r, b"slow").await.unwrap_err();
    assert!(matches!(err, ProofError::Timeout(_)));
    let proof = engine.get(&r.record_hash).await.unwrap();
    assert_eq!(proof.status, ProofStatus::Failed);
    assert_eq!(proof.attempts, 2);
}

#[tokio::test]
async fn transient_backend_errors_recover() {
    let ledger = ledger().await;
    let stub = backend(Duration::ZERO);
    stub.fail_next(2);
    let (engine, _) = engine_with(stub, ProofEngineConfig::default());
    let r = record(&ledger, 1, b"flaky").await;
    let proof = engine.generate(&r, b"flaky").await.unwrap();
    assert_eq!(proof.attempts, 3);
    assert!(engine.verify_own(&proof));
}

#[tokio::test]
async fn queued_callers_share_one_generation_slot() {
    let ledger = ledger().await;
    let stub = backend(Duration::from_millis(50));
    stub.fail_next(1);
    let (engine, _) = engine_with(
        stub,
        ProofEngineConfig {
            max_attempts: 1,
            ..ProofEngineConfig::default()
        },
    );
    let engine = Arc::new(engine);
    let r = record(&ledger, 1, b"contended").await;

    // first caller fails, the second waits behind it and reproves, the third
    // arrives while the second is still proving
    let first = engine.spawn_generate(r.clone(), b"contended".to_vec());
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = engine.spawn_generate(r.clone(), b"contended".to_vec());
    tokio::time::sleep(Duration::from_millis(60)).await;
    let third = engine.spawn_generate(r.clone(), b"contended".to_vec());

    assert!(first.await.unwrap().is_err());
    let second = second.await.unwrap().unwrap();
    let third = third.await.unwrap().unwrap();
    assert_eq!(second, third);
    let stats = engine.statistics().await;
    assert_eq!(stats.generated, 1);
    assert_eq!(stats.cache_hits, 1);
}

#[tokio::test]
async fn shutdown_leaves_proof_pending() {
    let ledger = ledger().await;
    let (engine, _) = engine_with(backend(Duration::from_secs(5)), ProofEngineConfig::default());
    let engine = Arc::new(engine);
    let r = record(&ledger, 1, b"long").await;

    let handle = engine.spawn_generate(r.clone(), b"long".to_vec());
    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.shutdown();

    let err = handle.await.unwrap().unwrap_err();
    assert_eq!(err, ProofError::Cancelled);
    assert_eq!(
        engine.get(&r.record_hash).await.unwrap().status,
        ProofStatus::Pending
    );
    assert_eq!(engine.pending().await.unwrap().len(), 1);
    assert_eq!(engine.statistics().await.cancelled, 1);
    // the ledger is untouched by the cancelled generation
    assert!(ledger.verify_chain(DID).await);
}

#[tokio::test]
async fn generate_all_runs_in_parallel_on_bounded_pool() {
    let ledger = ledger().await;
    let (engine, _) = engine_with(
        backend(Duration::from_millis(40)),
        ProofEngineConfig {
            workers: 4,
            ..ProofEngineConfig::default()
        },
    );
    let engine = Arc::new(engine);
    let mut jobs = Vec::new();
    for ts in 0..8u64 {
        let payload = ts.to_le_bytes().to_vec();
        jobs.push((record(&ledger, ts, &payload).await, payload));
    }
    let started = std::time::Instant::now();
    let results = engine.generate_all(jobs).await;
    assert!(results.iter().all(|r| r.is_ok()));
    // two waves of four
    assert!(started.elapsed() >= Duration::from_millis(80));
    assert_eq!(engine.statistics().await.generated, 8);
}

#[tokio::test]
async fn mark_status_tracks_batching() {
    let ledger = ledger().await;
    let (engine, store) = engine_with(backend(Duration::ZERO), ProofEngineConfig::default());
    let r = record(&ledger, 1, b"b").await;
    engine.generate(&r, b"b").await.unwrap();
    engine
        .mark_status(&r.record_hash, ProofStatus::Batched)
        .await
        .unwrap();
    assert_eq!(store.by_status(ProofStatus::Batched).await.unwrap().len(), 1);
    assert!(matches!(
        engine.mark_status(&[0u8; 32], ProofStatus::Confirmed).await,
        Err(ProofError::UnknownRecord(_))
    ));
    assert_eq!(engine.clear_cache().await, 0);
}
