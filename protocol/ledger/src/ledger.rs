use crate::error::{LedgerError, LedgerResult};
use crate::identity::{verify_signature_bytes, IdentityProvider};
use crate::store::LedgerStore;
use crate::types::{
    compute_record_hash, hash_payload, short_hex, ActionRecord, ActionType, Hash, GENESIS_HASH,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub max_payload_bytes: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerStatistics {
    pub total_records: u64,
    pub identities: u64,
    pub halted_identities: Vec<String>,
    pub by_action_type: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Copy)]
struct ChainHead {
    record_hash: Hash,
    timestamp: u64,
    next_sequence: u64,
}

#[derive(Default)]
struct ChainSlot {
    loaded: bool,
    head: Option<ChainHead>,
}

/// Append-only, per-identity hash chains.
///
/// Appends for one identity are serialized through that identity's slot lock;
/// different identities never contend beyond the slot map lookup.
pub struct ActionLedger {
    config: LedgerConfig,
    store: Arc<dyn LedgerStore>,
    identity: Arc<dyn IdentityProvider>,
    chains: Mutex<HashMap<String, Arc<Mutex<ChainSlot>>>>,
    halted: RwLock<HashSet<String>>,
}

impl ActionLedger {
    pub fn new(
        config: LedgerConfig,
        store: Arc<dyn LedgerStore>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            config,
            store,
            identity,
            chains: Mutex::new(HashMap::new()),
            halted: RwLock::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    async fn slot(&self, identity: &str) -> Arc<Mutex<ChainSlot>> {
        self.chains
            .lock()
            .await
            .entry(identity.to_string())
            .or_default()
            .clone()
    }

    pub async fn append(
        &self,
        identity: &str,
        action_type: ActionType,
        timestamp: u64,
        payload: &[u8],
    ) -> LedgerResult<ActionRecord> {
        if payload.len() > self.config.max_payload_bytes {
            return Err(LedgerError::PayloadTooLarge {
                size: payload.len(),
                limit: self.config.max_payload_bytes,
            });
        }

        let slot = self.slot(identity).await;
        let mut slot = slot.lock().await;
        if self.is_halted(identity).await {
            return Err(LedgerError::IdentityHalted(identity.to_string()));
        }
        if !slot.loaded {
            let existing = self.store.records(identity).await.map_err(store_err)?;
            slot.head = existing.last().map(|r| ChainHead {
                record_hash: r.record_hash,
                timestamp: r.timestamp,
                next_sequence: r.sequence + 1,
            });
            slot.loaded = true;
        }

        let (prev_hash, sequence) = match slot.head {
            Some(head) if timestamp < head.timestamp => {
                return Err(LedgerError::OutOfOrderTimestamp {
                    identity: identity.to_string(),
                    timestamp,
                    last: head.timestamp,
                })
            }
            Some(head) => (head.record_hash, head.next_sequence),
            None => (GENESIS_HASH, 0),
        };

        let payload_hash = hash_payload(payload);
        let record_hash =
            compute_record_hash(identity, &action_type, timestamp, &payload_hash, &prev_hash);
        let signature = self
            .identity
            .sign(identity, &record_hash)
            .await
            .map_err(|e| LedgerError::Signing(e.to_string()))?;

        let record = ActionRecord {
            identity: identity.to_string(),
            action_type,
            timestamp,
            sequence,
            payload_hash,
            prev_hash,
            record_hash,
            signature,
        };
        self.store
            .append(&record, payload)
            .await
            .map_err(store_err)?;
        slot.head = Some(ChainHead {
            record_hash,
            timestamp,
            next_sequence: sequence + 1,
        });
        info!(
            identity,
            action_type = %record.action_type,
            sequence,
            record = %short_hex(&record_hash),
            "appended action record"
        );
        Ok(record)
    }

    /// Full audit of one identity's chain. Returns `false` and halts further
    /// appends for the identity on any break.
    pub async fn verify_chain(&self, identity: &str) -> bool {
        match self.audit_chain(identity).await {
            Ok(()) => true,
            Err(err) => {
                warn!(identity, error = %err, "chain verification failed");
                false
            }
        }
    }

    /// Like [`verify_chain`](Self::verify_chain) but reports the break.
    pub async fn audit_chain(&self, identity: &str) -> LedgerResult<()> {
        let records = self.store.records(identity).await.map_err(store_err)?;
        if records.is_empty() {
            return Ok(());
        }
        let public_key = self
            .identity
            .resolve(identity)
            .await
            .map_err(|e| LedgerError::Signing(e.to_string()))?
            .ok_or_else(|| LedgerError::UnknownIdentity(identity.to_string()))?;
        if let Err(err) = verify_records(&records, Some(&public_key)) {
            self.halted.write().await.insert(identity.to_string());
            warn!(identity, "appends halted pending audit");
            return Err(err);
        }
        debug!(identity, records = records.len(), "chain verified");
        Ok(())
    }

    pub async fn is_halted(&self, identity: &str) -> bool {
        self.halted.read().await.contains(identity)
    }

    /// Operator action after an external audit. The cached head is dropped so
    /// the next append re-reads the chain from the store.
    pub async fn release_halt(&self, identity: &str) -> bool {
        let released = self.halted.write().await.remove(identity);
        if released {
            self.chains.lock().await.remove(identity);
            info!(identity, "released chain halt");
        }
        released
    }

    pub async fn halted_identities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.halted.read().await.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn records(&self, identity: &str) -> LedgerResult<Vec<ActionRecord>> {
        self.store.records(identity).await.map_err(store_err)
    }

    pub async fn record(&self, record_hash: &Hash) -> LedgerResult<Option<ActionRecord>> {
        self.store.record(record_hash).await.map_err(store_err)
    }

    pub async fn payload(&self, record_hash: &Hash) -> LedgerResult<Option<Vec<u8>>> {
        self.store.payload(record_hash).await.map_err(store_err)
    }

    pub async fn head(&self, identity: &str) -> LedgerResult<Option<ActionRecord>> {
        Ok(self.records(identity).await?.pop())
    }

    pub async fn identities(&self) -> LedgerResult<Vec<String>> {
        self.store.identities().await.map_err(store_err)
    }

    pub async fn records_by_type(
        &self,
        action_type: &ActionType,
    ) -> LedgerResult<Vec<ActionRecord>> {
        let mut out = Vec::new();
        for identity in self.identities().await? {
            out.extend(
                self.records(&identity)
                    .await?
                    .into_iter()
                    .filter(|r| &r.action_type == action_type),
            );
        }
        Ok(out)
    }

    /// Records with `from <= timestamp <= to`.
    pub async fn records_in_range(
        &self,
        identity: &str,
        from: u64,
        to: u64,
    ) -> LedgerResult<Vec<ActionRecord>> {
        Ok(self
            .records(identity)
            .await?
            .into_iter()
            .filter(|r| r.timestamp >= from && r.timestamp <= to)
            .collect())
    }

    pub async fn statistics(&self) -> LedgerResult<LedgerStatistics> {
        let mut stats = LedgerStatistics {
            halted_identities: self.halted_identities().await,
            ..LedgerStatistics::default()
        };
        for identity in self.identities().await? {
            stats.identities += 1;
            for record in self.records(&identity).await? {
                stats.total_records += 1;
                *stats
                    .by_action_type
                    .entry(record.action_type.to_string())
                    .or_insert(0) += 1;
            }
        }
        Ok(stats)
    }
}

fn store_err(err: anyhow::Error) -> LedgerError {
    LedgerError::Store(err.to_string())
}

/// Checks linkage, hashes, ordering and (when a key is supplied) signatures of
/// one identity's chain. Pure; usable by external auditors.
pub fn verify_records(records: &[ActionRecord], public_key: Option<&[u8; 32]>) -> LedgerResult<()> {
    let Some(first) = records.first() else {
        return Ok(());
    };
    let identity = first.identity.as_str();
    let mut prev_hash = GENESIS_HASH;
    let mut last_ts = 0u64;

    for (index, record) in records.iter().enumerate() {
        let broken = |reason: &str| LedgerError::ChainBroken {
            identity: identity.to_string(),
            index: index as u64,
            reason: reason.to_string(),
        };
        if record.identity != identity {
            return Err(broken("record belongs to another identity"));
        }
        if record.sequence != index as u64 {
            return Err(broken("sequence gap"));
        }
        if record.prev_hash != prev_hash {
            return Err(broken("prev_hash does not link to predecessor"));
        }
        if record.expected_hash() != record.record_hash {
            return Err(broken("record_hash mismatch"));
        }
        if index > 0 && record.timestamp < last_ts {
            return Err(broken("timestamp regression"));
        }
        if let Some(key) = public_key {
            if verify_signature_bytes(key, &record.signature, &record.record_hash).is_err() {
                return Err(broken("signature mismatch"));
            }
        }
        prev_hash = record.record_hash;
        last_ts = record.timestamp;
    }
    Ok(())
}
