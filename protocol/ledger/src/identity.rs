use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// External signing and key resolution. Implementations own the private keys;
/// the ledger only ever sees signatures and public keys.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn sign(&self, did: &str, message: &[u8]) -> anyhow::Result<Vec<u8>>;
    async fn resolve(&self, did: &str) -> anyhow::Result<Option<[u8; 32]>>;
}

pub fn sign_bytes(signing_key: &SigningKey, message: &[u8]) -> Vec<u8> {
    signing_key.sign(message).to_bytes().to_vec()
}

pub fn verify_signature_bytes(
    public_key: &[u8],
    signature: &[u8],
    message: &[u8],
) -> anyhow::Result<()> {
    let key_bytes: [u8; 32] = public_key
        .try_into()
        .map_err(|_| anyhow::anyhow!("public key must be 32 bytes"))?;
    let verifying_key = VerifyingKey::from_bytes(&key_bytes)?;
    let signature = Signature::from_slice(signature)?;
    verifying_key.verify(message, &signature)?;
    Ok(())
}

/// Development keyring. Keys are derived deterministically from a seed string.
#[derive(Default)]
pub struct InMemoryIdentityProvider {
    keys: RwLock<HashMap<String, SigningKey>>,
}

impl InMemoryIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_seed(&self, did: &str, seed: &str) -> [u8; 32] {
        let digest = blake3::hash(seed.as_bytes());
        self.register_key(did, SigningKey::from_bytes(digest.as_bytes()))
            .await
    }

    pub async fn register_key(&self, did: &str, key: SigningKey) -> [u8; 32] {
        let public = key.verifying_key().to_bytes();
        self.keys.write().await.insert(did.to_string(), key);
        public
    }

    pub async fn dids(&self) -> Vec<String> {
        let mut dids: Vec<String> = self.keys.read().await.keys().cloned().collect();
        dids.sort();
        dids
    }
}

#[async_trait]
impl IdentityProvider for InMemoryIdentityProvider {
    async fn sign(&self, did: &str, message: &[u8]) -> anyhow::Result<Vec<u8>> {
        let keys = self.keys.read().await;
        let key = keys
            .get(did)
            .ok_or_else(|| anyhow::anyhow!("no signing key for {did}"))?;
        Ok(sign_bytes(key, message))
    }

    async fn resolve(&self, did: &str) -> anyhow::Result<Option<[u8; 32]>> {
        Ok(self
            .keys
            .read()
            .await
            .get(did)
            .map(|k| k.verifying_key().to_bytes()))
    }
}
