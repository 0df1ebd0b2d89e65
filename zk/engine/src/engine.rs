use crate::error::{ProofError, ProofResult};
use crate::predicate::PredicateProvider;
use crate::proof::{Proof, ProofStatus, ProofStore};
use ledger::{hash_payload, short_hex, ActionRecord, Hash};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zk_core::{CircuitId, ProofRequest, VerificationKey, ZkBackend, ZkError};
use zk_program_action::{encode_witness, ActionWitness, PublicInputs};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProofEngineConfig {
    /// Concurrent proving slots.
    pub workers: usize,
    pub timeout_ms: u64,
    /// Attempts per `generate` call for retryable failures.
    pub max_attempts: u32,
    pub time_bucket_secs: u64,
}

impl Default for ProofEngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            timeout_ms: 30_000,
            max_attempts: 3,
            time_bucket_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProofStatistics {
    pub generated: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub cache_hits: u64,
    pub avg_proving_ms: f64,
    pub tracked: usize,
    pub pending: usize,
}

#[derive(Default)]
struct Counters {
    generated: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    cache_hits: AtomicU64,
    proving_ms: AtomicU64,
}

/// Builds and verifies record-bound proofs on a bounded pool of proving slots.
///
/// Proofs are keyed by `record_hash`; a record that already has a usable proof
/// is never proven twice. Shutdown cancels in-flight work and leaves those
/// proofs `Pending`.
pub struct ProofEngine {
    config: ProofEngineConfig,
    backend: Arc<dyn ZkBackend>,
    predicates: Arc<dyn PredicateProvider>,
    store: Arc<dyn ProofStore>,
    circuit: CircuitId,
    key: VerificationKey,
    permits: Arc<Semaphore>,
    proofs: Mutex<HashMap<Hash, Proof>>,
    in_flight: Mutex<HashMap<Hash, Arc<Mutex<()>>>>,
    shutdown: watch::Sender<bool>,
    counters: Counters,
}

impl ProofEngine {
    pub fn new(
        config: ProofEngineConfig,
        backend: Arc<dyn ZkBackend>,
        predicates: Arc<dyn PredicateProvider>,
        store: Arc<dyn ProofStore>,
        key: VerificationKey,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        info!(
            backend = backend.backend_id(),
            workers = config.workers,
            key = %key.id,
            "proof engine ready"
        );
        Self {
            permits: Arc::new(Semaphore::new(config.workers.max(1))),
            circuit: key.circuit_id.clone(),
            config,
            backend,
            predicates,
            store,
            key,
            proofs: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            shutdown,
            counters: Counters::default(),
        }
    }

    pub fn key(&self) -> &VerificationKey {
        &self.key
    }

    pub fn config(&self) -> &ProofEngineConfig {
        &self.config
    }

    pub fn public_inputs(&self, record: &ActionRecord) -> PublicInputs {
        PublicInputs::new(
            record.record_hash,
            record.action_type.as_str(),
            record.timestamp,
            self.config.time_bucket_secs,
        )
    }

    pub async fn generate(&self, record: &ActionRecord, payload: &[u8]) -> ProofResult<Proof> {
        let guard = self
            .in_flight
            .lock()
            .await
            .entry(record.record_hash)
            .or_default()
            .clone();
        let held = guard.lock().await;
        let result = self.generate_exclusive(record, payload).await;
        drop(held);
        let mut in_flight = self.in_flight.lock().await;
        // the map and this call are the only holders: no one is queued behind us
        if Arc::strong_count(&guard) <= 2 {
            in_flight.remove(&record.record_hash);
        }
        result
    }

    async fn generate_exclusive(
        &self,
        record: &ActionRecord,
        payload: &[u8],
    ) -> ProofResult<Proof> {
        let previous = self.proofs.lock().await.get(&record.record_hash).cloned();
        if let Some(existing) = &previous {
            if matches!(
                existing.status,
                ProofStatus::Generated | ProofStatus::Batched | ProofStatus::Confirmed
            ) {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                debug!(record = %short_hex(&record.record_hash), "proof cache hit");
                return Ok(existing.clone());
            }
        }

        let inputs = self.public_inputs(record);
        let public_commitment = inputs.commitment().map_err(encoding)?;
        let mut proof = Proof {
            record_hash: record.record_hash,
            identity: record.identity.clone(),
            timestamp: record.timestamp,
            public_inputs: inputs,
            public_commitment,
            proof_bytes: Vec::new(),
            verification_key_id: self.key.id.clone(),
            status: ProofStatus::Pending,
            attempts: previous.map(|p| p.attempts).unwrap_or(0),
            last_error: None,
        };
        self.persist(&proof).await?;

        match self.prove_with_retries(&mut proof, record, payload).await {
            Ok(bytes) => {
                proof.proof_bytes = bytes;
                proof.status = ProofStatus::Generated;
                proof.last_error = None;
                self.persist(&proof).await?;
                self.counters.generated.fetch_add(1, Ordering::Relaxed);
                info!(
                    identity = %record.identity,
                    record = %short_hex(&record.record_hash),
                    attempts = proof.attempts,
                    "proof generated"
                );
                Ok(proof)
            }
            Err(ProofError::Cancelled) => {
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                self.persist(&proof).await?;
                warn!(
                    record = %short_hex(&record.record_hash),
                    "proof generation cancelled; left pending"
                );
                Err(ProofError::Cancelled)
            }
            Err(err) => {
                proof.status = ProofStatus::Failed;
                proof.last_error = Some(err.to_string());
                self.persist(&proof).await?;
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    record = %short_hex(&record.record_hash),
                    error = %err,
                    "proof generation failed"
                );
                Err(err)
            }
        }
    }

    async fn prove_with_retries(
        &self,
        proof: &mut Proof,
        record: &ActionRecord,
        payload: &[u8],
    ) -> ProofResult<Vec<u8>> {
        self.check_key()?;
        let witness = self.build_witness(record, payload)?;
        let request = ProofRequest {
            circuit_id: self.circuit.clone(),
            witness: encode_witness(&witness).map_err(encoding)?,
            public_inputs: proof.public_inputs.encode().map_err(encoding)?,
        };

        let mut tries = 0;
        loop {
            tries += 1;
            proof.attempts += 1;
            let started = Instant::now();
            match self.prove_once(request.clone()).await {
                Ok(bytes) => {
                    self.counters
                        .proving_ms
                        .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
                    return Ok(bytes);
                }
                Err(err) if err.is_retryable() && tries < self.config.max_attempts => {
                    warn!(attempt = tries, error = %err, "retrying proof generation");
                    proof.last_error = Some(err.to_string());
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn prove_once(&self, request: ProofRequest) -> ProofResult<Vec<u8>> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return Err(ProofError::Cancelled);
        }
        let _permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| ProofError::Cancelled)?
            }
            _ = shutdown.changed() => return Err(ProofError::Cancelled),
        };
        let timeout = Duration::from_millis(self.config.timeout_ms);
        tokio::select! {
            result = tokio::time::timeout(timeout, self.backend.prove(request)) => match result {
                Ok(Ok(bytes)) => Ok(bytes),
                Ok(Err(err)) => Err(ProofError::Backend(err)),
                Err(_) => Err(ProofError::Timeout(timeout)),
            },
            _ = shutdown.changed() => Err(ProofError::Cancelled),
        }
    }

    fn check_key(&self) -> ProofResult<()> {
        let circuit = self
            .backend
            .registry()
            .get(&self.circuit)
            .ok_or_else(|| ProofError::Backend(ZkError::UnknownCircuit(self.circuit.clone())))?;
        if !self.key.matches(circuit) {
            return Err(ProofError::KeyMismatch {
                key_version: self.key.circuit_version.clone(),
                circuit_version: circuit.version.clone(),
            });
        }
        Ok(())
    }

    fn build_witness(&self, record: &ActionRecord, payload: &[u8]) -> ProofResult<ActionWitness> {
        let payload_hash = hash_payload(payload);
        if payload_hash != record.payload_hash {
            return Err(ProofError::InvalidWitness(
                "payload does not match record payload_hash".into(),
            ));
        }
        if !self.predicates.check(&record.action_type, payload) {
            return Err(ProofError::InvalidWitness(format!(
                "predicate for {} not satisfied",
                record.action_type
            )));
        }
        Ok(ActionWitness {
            payload: payload.to_vec(),
            payload_hash,
            signature: record.signature.clone(),
            predicate_id: self.predicates.predicate_id(&record.action_type),
            predicate_holds: true,
        })
    }

    async fn persist(&self, proof: &Proof) -> ProofResult<()> {
        self.store
            .put(proof)
            .await
            .map_err(|e| ProofError::Store(e.to_string()))?;
        self.proofs
            .lock()
            .await
            .insert(proof.record_hash, proof.clone());
        Ok(())
    }

    /// Generation as an independent task.
    pub fn spawn_generate(
        self: &Arc<Self>,
        record: ActionRecord,
        payload: Vec<u8>,
    ) -> JoinHandle<ProofResult<Proof>> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.generate(&record, &payload).await })
    }

    /// Runs all jobs in parallel (bounded by the worker count). Results keep
    /// the input order.
    pub async fn generate_all(
        self: &Arc<Self>,
        jobs: Vec<(ActionRecord, Vec<u8>)>,
    ) -> Vec<ProofResult<Proof>> {
        let handles: Vec<_> = jobs
            .into_iter()
            .map(|(record, payload)| self.spawn_generate(record, payload))
            .collect();
        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.await.unwrap_or_else(|_| Err(ProofError::Cancelled)));
        }
        results
    }

    /// Checks a proof against this engine's key and its own public inputs.
    pub fn verify(
        &self,
        proof: &Proof,
        public_inputs: &PublicInputs,
        key: &VerificationKey,
    ) -> bool {
        verify_proof(self.backend.as_ref(), proof, public_inputs, key)
    }

    pub fn verify_own(&self, proof: &Proof) -> bool {
        self.verify(proof, &proof.public_inputs, &self.key)
    }

    pub async fn mark_status(&self, record_hash: &Hash, status: ProofStatus) -> ProofResult<Proof> {
        let updated = {
            let mut proofs = self.proofs.lock().await;
            let proof = proofs
                .get_mut(record_hash)
                .ok_or_else(|| ProofError::UnknownRecord(short_hex(record_hash)))?;
            proof.status = status;
            proof.clone()
        };
        self.store
            .put(&updated)
            .await
            .map_err(|e| ProofError::Store(e.to_string()))?;
        debug!(record = %short_hex(record_hash), ?status, "proof status updated");
        Ok(updated)
    }

    pub async fn get(&self, record_hash: &Hash) -> Option<Proof> {
        self.proofs.lock().await.get(record_hash).cloned()
    }

    /// Proofs in `status`, read from the store so entries evicted by
    /// `clear_cache` are still found. Ordered by identity, then timestamp.
    pub async fn with_status(&self, status: ProofStatus) -> ProofResult<Vec<Proof>> {
        self.store
            .by_status(status)
            .await
            .map_err(|e| ProofError::Store(e.to_string()))
    }

    /// Proofs left behind by cancelled or abandoned generations.
    pub async fn pending(&self) -> ProofResult<Vec<Proof>> {
        self.with_status(ProofStatus::Pending).await
    }

    /// Drops `Pending` and `Failed` entries from memory. The store keeps them.
    pub async fn clear_cache(&self) -> usize {
        let mut proofs = self.proofs.lock().await;
        let before = proofs.len();
        proofs.retain(|_, p| !matches!(p.status, ProofStatus::Pending | ProofStatus::Failed));
        before - proofs.len()
    }

    pub async fn statistics(&self) -> ProofStatistics {
        let proofs = self.proofs.lock().await;
        let generated = self.counters.generated.load(Ordering::Relaxed);
        let proving_ms = self.counters.proving_ms.load(Ordering::Relaxed);
        ProofStatistics {
            generated,
            failed: self.counters.failed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            avg_proving_ms: if generated == 0 {
                0.0
            } else {
                proving_ms as f64 / generated as f64
            },
            tracked: proofs.len(),
            pending: proofs
                .values()
                .filter(|p| p.status == ProofStatus::Pending)
                .count(),
        }
    }

    /// Cancels in-flight and future generations.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        info!("proof engine shutting down");
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

fn encoding(err: anyhow::Error) -> ProofError {
    ProofError::Encoding(err.to_string())
}

/// Pure verification: the proof must name `key`, commit to exactly
/// `public_inputs`, and pass the backend check.
pub fn verify_proof(
    backend: &dyn ZkBackend,
    proof: &Proof,
    public_inputs: &PublicInputs,
    key: &VerificationKey,
) -> bool {
    if proof.verification_key_id != key.id || proof.record_hash != public_inputs.record_hash {
        return false;
    }
    match public_inputs.commitment() {
        Ok(commitment) if commitment == proof.public_commitment => {}
        _ => return false,
    }
    let Ok(encoded) = public_inputs.encode() else {
        return false;
    };
    backend
        .verify(&proof.proof_bytes, &encoded, key)
        .unwrap_or(false)
}
