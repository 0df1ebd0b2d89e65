use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("timestamp {timestamp} for {identity} precedes last record at {last}")]
    OutOfOrderTimestamp {
        identity: String,
        timestamp: u64,
        last: u64,
    },
    #[error("payload of {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("chain broken for {identity} at record {index}: {reason}")]
    ChainBroken {
        identity: String,
        index: u64,
        reason: String,
    },
    #[error("appends halted for {0} pending audit")]
    IdentityHalted(String),
    #[error("identity not resolvable: {0}")]
    UnknownIdentity(String),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("store error: {0}")]
    Store(String),
}

impl LedgerError {
    /// Chain integrity failures halt the identity and are never retried.
    pub fn is_chain_integrity(&self) -> bool {
        matches!(
            self,
            LedgerError::ChainBroken { .. } | LedgerError::IdentityHalted(_)
        )
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
