use crate::types::{ActionRecord, Hash};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, warn};

/// Durable backing for ledger chains. `append` must not return `Ok` before the
/// record is durable.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn append(&self, record: &ActionRecord, payload: &[u8]) -> anyhow::Result<()>;
    async fn records(&self, identity: &str) -> anyhow::Result<Vec<ActionRecord>>;
    async fn record(&self, record_hash: &Hash) -> anyhow::Result<Option<ActionRecord>>;
    async fn payload(&self, record_hash: &Hash) -> anyhow::Result<Option<Vec<u8>>>;
    async fn identities(&self) -> anyhow::Result<Vec<String>>;
}

#[derive(Default)]
struct Tables {
    chains: HashMap<String, Vec<ActionRecord>>,
    index: HashMap<Hash, (String, usize)>,
    payloads: HashMap<Hash, Vec<u8>>,
}

impl Tables {
    fn insert(&mut self, record: ActionRecord, payload: Vec<u8>) {
        let chain = self.chains.entry(record.identity.clone()).or_default();
        self.index
            .insert(record.record_hash, (record.identity.clone(), chain.len()));
        self.payloads.insert(record.record_hash, payload);
        chain.push(record);
    }

    fn records(&self, identity: &str) -> Vec<ActionRecord> {
        self.chains.get(identity).cloned().unwrap_or_default()
    }

    fn record(&self, record_hash: &Hash) -> Option<ActionRecord> {
        let (identity, position) = self.index.get(record_hash)?;
        self.chains.get(identity)?.get(*position).cloned()
    }

    fn identities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.chains.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[derive(Clone, Default)]
pub struct InMemoryLedgerStore {
    inner: Arc<RwLock<Tables>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrites a stored record in place. Only used to simulate tampering.
    #[cfg(test)]
    pub(crate) async fn overwrite(&self, record: ActionRecord) {
        let mut guard = self.inner.write().await;
        if let Some(chain) = guard.chains.get_mut(&record.identity) {
            if let Some(slot) = chain.get_mut(record.sequence as usize) {
                *slot = record;
            }
        }
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn append(&self, record: &ActionRecord, payload: &[u8]) -> anyhow::Result<()> {
        self.inner
            .write()
            .await
            .insert(record.clone(), payload.to_vec());
        Ok(())
    }

    async fn records(&self, identity: &str) -> anyhow::Result<Vec<ActionRecord>> {
        Ok(self.inner.read().await.records(identity))
    }

    async fn record(&self, record_hash: &Hash) -> anyhow::Result<Option<ActionRecord>> {
        Ok(self.inner.read().await.record(record_hash))
    }

    async fn payload(&self, record_hash: &Hash) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.inner.read().await.payloads.get(record_hash).cloned())
    }

    async fn identities(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.inner.read().await.identities())
    }
}

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    record: ActionRecord,
    payload: String,
}

/// JSON-lines ledger file. Each append is written and `sync_data`'d before it
/// is acknowledged; the file is replayed into memory on open.
///
/// A failed write is truncated back to the last acknowledged entry. If even
/// that fails the store refuses further appends until it is reopened, since
/// the file may hold an entry the chain heads never saw.
pub struct FileLedgerStore {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
    tables: RwLock<Tables>,
    poisoned: AtomicBool,
    #[cfg(test)]
    fail_sync: AtomicBool,
}

impl FileLedgerStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tables = if path.exists() {
            replay(&path)?
        } else {
            Tables::default()
        };
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(tokio::fs::File::from_std(file)),
            tables: RwLock::new(tables),
            poisoned: AtomicBool::new(false),
            #[cfg(test)]
            fail_sync: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_entry(&self, file: &mut tokio::fs::File, line: &[u8]) -> io::Result<()> {
        file.write_all(line).await?;
        file.flush().await?;
        #[cfg(test)]
        if self.fail_sync.swap(false, Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected sync failure"));
        }
        file.sync_data().await
    }
}

/// Loads every entry. A trailing line without its newline is a write torn by
/// a crash: it was never acknowledged, so it is cut off. Any other unreadable
/// line is corruption.
fn replay(path: &Path) -> anyhow::Result<Tables> {
    let raw = std::fs::read(path)?;
    let mut tables = Tables::default();
    let mut offset = 0usize;
    for (line_no, chunk) in raw.split_inclusive(|b| *b == b'\n').enumerate() {
        let complete = chunk.ends_with(b"\n");
        let line = chunk.strip_suffix(b"\n").unwrap_or(chunk);
        if line.iter().all(u8::is_ascii_whitespace) {
            offset += chunk.len();
            continue;
        }
        if !complete {
            warn!(
                path = %path.display(),
                bytes = chunk.len(),
                "dropping torn trailing ledger entry"
            );
            let file = std::fs::OpenOptions::new().write(true).open(path)?;
            file.set_len(offset as u64)?;
            file.sync_data()?;
            break;
        }
        let entry: StoredEntry = serde_json::from_slice(line).map_err(|e| {
            anyhow::anyhow!("corrupt ledger entry at {}:{}: {e}", path.display(), line_no + 1)
        })?;
        tables.insert(entry.record, hex::decode(entry.payload)?);
        offset += chunk.len();
    }
    Ok(tables)
}

#[async_trait]
impl LedgerStore for FileLedgerStore {
    async fn append(&self, record: &ActionRecord, payload: &[u8]) -> anyhow::Result<()> {
        let entry = StoredEntry {
            record: record.clone(),
            payload: hex::encode(payload),
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        {
            let mut file = self.file.lock().await;
            if self.poisoned.load(Ordering::SeqCst) {
                anyhow::bail!(
                    "ledger file {} needs to be reopened after a failed write",
                    self.path.display()
                );
            }
            let committed = file.metadata().await?.len();
            if let Err(err) = self.write_entry(&mut file, &line).await {
                if let Err(rollback) = file.set_len(committed).await {
                    self.poisoned.store(true, Ordering::SeqCst);
                    error!(
                        path = %self.path.display(),
                        error = %rollback,
                        "could not roll back failed ledger write"
                    );
                }
                return Err(anyhow::Error::new(err).context("appending ledger entry"));
            }
        }
        self.tables
            .write()
            .await
            .insert(record.clone(), payload.to_vec());
        Ok(())
    }

    async fn records(&self, identity: &str) -> anyhow::Result<Vec<ActionRecord>> {
        Ok(self.tables.read().await.records(identity))
    }

    async fn record(&self, record_hash: &Hash) -> anyhow::Result<Option<ActionRecord>> {
        Ok(self.tables.read().await.record(record_hash))
    }

    async fn payload(&self, record_hash: &Hash) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.tables.read().await.payloads.get(record_hash).cloned())
    }

    async fn identities(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.tables.read().await.identities())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::InMemoryIdentityProvider;
    use crate::ledger::{ActionLedger, LedgerConfig};
    use std::io::Write;

    const DID: &str = "did:robo:courier-9";

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("roboid-store-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir.join("ledger.jsonl")
    }

    async fn identities() -> Arc<InMemoryIdentityProvider> {
        let ids = Arc::new(InMemoryIdentityProvider::new());
        ids.register_seed(DID, "courier-9").await;
        ids
    }

    #[tokio::test]
    async fn failed_write_is_rolled_back() -> anyhow::Result<()> {
        let path = scratch("rollback");
        let ids = identities().await;
        let store = Arc::new(FileLedgerStore::open(&path)?);
        let ledger = ActionLedger::new(LedgerConfig::default(), store.clone(), ids.clone());
        ledger.append(DID, "PKG_LOAD".into(), 1, b"a").await?;
        let committed = std::fs::metadata(&path)?.len();

        store.fail_sync.store(true, Ordering::SeqCst);
        assert!(ledger.append(DID, "DELIV_DONE".into(), 2, b"b").await.is_err());
        assert_eq!(std::fs::metadata(&path)?.len(), committed);

        let retried = ledger.append(DID, "DELIV_DONE".into(), 2, b"b").await?;
        assert_eq!(retried.sequence, 1);
        let reopened = ActionLedger::new(
            LedgerConfig::default(),
            Arc::new(FileLedgerStore::open(&path)?),
            ids,
        );
        assert_eq!(reopened.records(DID).await?.len(), 2);
        assert!(reopened.verify_chain(DID).await);

        let _ = std::fs::remove_dir_all(path.parent().unwrap_or(&path));
        Ok(())
    }

    #[tokio::test]
    async fn torn_tail_is_dropped_on_open() -> anyhow::Result<()> {
        let path = scratch("torn");
        let ids = identities().await;
        {
            let ledger = ActionLedger::new(
                LedgerConfig::default(),
                Arc::new(FileLedgerStore::open(&path)?),
                ids.clone(),
            );
            ledger.append(DID, "PKG_LOAD".into(), 1, b"a").await?;
            ledger.append(DID, "DELIV_DONE".into(), 2, b"b").await?;
        }
        let committed = std::fs::metadata(&path)?.len();
        let mut file = std::fs::OpenOptions::new().append(true).open(&path)?;
        file.write_all(br#"{"record":{"identity":"did:robo:cour"#)?;
        drop(file);

        let ledger = ActionLedger::new(
            LedgerConfig::default(),
            Arc::new(FileLedgerStore::open(&path)?),
            ids,
        );
        assert_eq!(std::fs::metadata(&path)?.len(), committed);
        assert_eq!(ledger.records(DID).await?.len(), 2);
        let next = ledger.append(DID, "WAYPOINT".into(), 3, b"c").await?;
        assert_eq!(next.sequence, 2);
        assert!(ledger.verify_chain(DID).await);

        let _ = std::fs::remove_dir_all(path.parent().unwrap_or(&path));
        Ok(())
    }

    #[test]
    fn corrupt_middle_line_is_refused() -> anyhow::Result<()> {
        let path = scratch("corrupt");
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&path, b"not json\n{}\n")?;
        assert!(FileLedgerStore::open(&path).is_err());
        let _ = std::fs::remove_dir_all(path.parent().unwrap_or(&path));
        Ok(())
    }
}
