use anyhow::Context;
use ledger::{ActionTypeEntry, ActionTypeRegistry, LedgerConfig};
use reputation::ReputationConfig;
use sequencer_core::AggregatorConfig;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use zk_engine::ProofEngineConfig;

/// Development keyring entry; production identities come from an external
/// provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevIdentity {
    pub did: String,
    pub seed: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// Confirm every accepted submission immediately.
    pub auto_confirm: bool,
    pub event_capacity: usize,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            auto_confirm: true,
            event_capacity: 1_024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub listen: String,
    /// Ledger records are kept in memory when unset.
    pub data_dir: Option<PathBuf>,
    pub prover_latency_ms: u64,
    pub decay_sweep_secs: u64,
    pub audit_interval_secs: u64,
    /// How often stranded proofs are regenerated or re-enqueued.
    pub retry_sweep_secs: u64,
    pub ledger: LedgerConfig,
    pub proofs: ProofEngineConfig,
    pub aggregator: AggregatorConfig,
    pub reputation: ReputationConfig,
    pub settlement: SettlementConfig,
    /// Replaces the built-in catalog when set.
    pub action_types: Option<Vec<ActionTypeEntry>>,
    pub identities: Vec<DevIdentity>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7700".into(),
            data_dir: None,
            prover_latency_ms: 0,
            decay_sweep_secs: 3_600,
            audit_interval_secs: 600,
            retry_sweep_secs: 30,
            ledger: LedgerConfig::default(),
            proofs: ProofEngineConfig::default(),
            aggregator: AggregatorConfig::default(),
            reputation: ReputationConfig::default(),
            settlement: SettlementConfig::default(),
            action_types: None,
            identities: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Reads `ROBOID_CONFIG` if set, then applies `ROBOID_LISTEN` and
    /// `ROBOID_DATA_DIR`.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match env::var("ROBOID_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        if let Ok(listen) = env::var("ROBOID_LISTEN") {
            config.listen = listen;
        }
        if let Ok(dir) = env::var("ROBOID_DATA_DIR") {
            config.data_dir = Some(PathBuf::from(dir));
        }
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&raw, path.extension().and_then(|e| e.to_str()).unwrap_or("json"))
            .with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn parse(raw: &str, extension: &str) -> anyhow::Result<Self> {
        match extension {
            "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
            _ => Ok(serde_json::from_str(raw)?),
        }
    }

    pub fn registry(&self) -> ActionTypeRegistry {
        match &self.action_types {
            Some(entries) => ActionTypeRegistry::from(entries.clone()),
            None => ActionTypeRegistry::default_catalog(),
        }
    }
}
