//! Hashlock preimage generation, hashing and the per-swap secret store

use super::SwapId;
use crate::error::{SwapError, SwapResult};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{compiler_fence, Ordering};
use tracing::{debug, info, warn};

/// Secret/preimage size in bytes
pub const SECRET_SIZE: usize = 32;

/// Hashlock preimage. Never logged, never serialized.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret([u8; SECRET_SIZE]);

impl Secret {
    pub fn from_bytes(bytes: [u8; SECRET_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse a `0x`-prefixed or bare hex string
    pub fn from_hex(input: &str) -> SwapResult<Self> {
        let raw = hex::decode(input.trim().trim_start_matches("0x"))
            .map_err(|e| SwapError::InvalidRecord {
                kind: "secret",
                message: e.to_string(),
            })?;
        let bytes: [u8; SECRET_SIZE] =
            raw.try_into().map_err(|v: Vec<u8>| SwapError::InvalidRecord {
                kind: "secret",
                message: format!("expected {} bytes, got {}", SECRET_SIZE, v.len()),
            })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        for byte in self.0.iter_mut() {
            *byte = 0;
        }
        compiler_fence(Ordering::SeqCst);
    }
}

/// SHA-256 of a secret, published on both legs
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashedSecret(pub [u8; 32]);

impl HashedSecret {
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for HashedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for HashedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashedSecret({})", self.to_hex())
    }
}

impl Serialize for HashedSecret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

/// Stateless secret operations
pub struct SecretManager;

impl SecretManager {
    /// Fresh secret from the OS CSPRNG together with its hash
    pub fn generate() -> SwapResult<(Secret, HashedSecret)> {
        let mut bytes = [0u8; SECRET_SIZE];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| SwapError::Entropy(e.to_string()))?;
        let secret = Secret(bytes);
        let hashed = Self::hash(&secret);
        Ok((secret, hashed))
    }

    pub fn hash(secret: &Secret) -> HashedSecret {
        let digest = Sha256::digest(secret.as_bytes());
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        HashedSecret(out)
    }

    pub fn verify(candidate: &Secret, expected: &HashedSecret) -> bool {
        &Self::hash(candidate) == expected
    }
}

/// Concurrently readable secrets keyed by swap; a held secret is only
/// replaced by one verified against an on-chain hashlock
#[derive(Default)]
pub struct SecretStore {
    secrets: DashMap<SwapId, Secret>,
}

impl SecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate and hold a secret for `swap_id`; an existing secret is kept
    pub fn generate_for(&self, swap_id: SwapId) -> SwapResult<HashedSecret> {
        match self.secrets.entry(swap_id) {
            Entry::Occupied(existing) => Ok(SecretManager::hash(existing.get())),
            Entry::Vacant(slot) => {
                let (secret, hashed) = SecretManager::generate()?;
                slot.insert(secret);
                info!("Generated secret for swap {} (hashlock {})", swap_id, hashed);
                Ok(hashed)
            }
        }
    }

    /// Cache `candidate` only if it hashes to `expected`.
    ///
    /// A cached secret that also hashes to `expected` wins and is returned.
    /// One that does not is stale, e.g. generated after a restart before the
    /// old leg became visible, and is replaced.
    pub fn record_verified(
        &self,
        swap_id: SwapId,
        candidate: Secret,
        expected: &HashedSecret,
    ) -> SwapResult<Secret> {
        if !SecretManager::verify(&candidate, expected) {
            return Err(SwapError::SecretMismatch {
                swap_id: swap_id.to_hex(),
                expected: expected.to_hex(),
            });
        }
        match self.secrets.entry(swap_id) {
            Entry::Occupied(existing) if SecretManager::verify(existing.get(), expected) => {
                Ok(existing.get().clone())
            }
            Entry::Occupied(mut stale) => {
                warn!("Replacing stale secret for swap {} with a verified one", swap_id);
                stale.insert(candidate.clone());
                Ok(candidate)
            }
            Entry::Vacant(slot) => {
                debug!("Cached verified secret for swap {}", swap_id);
                Ok(slot.insert(candidate).clone())
            }
        }
    }

    pub fn get(&self, swap_id: &SwapId) -> Option<Secret> {
        self.secrets.get(swap_id).map(|s| s.clone())
    }

    pub fn hashed(&self, swap_id: &SwapId) -> Option<HashedSecret> {
        self.secrets.get(swap_id).map(|s| SecretManager::hash(s.value()))
    }

    /// Drop the secret once both legs are terminal
    pub fn forget(&self, swap_id: &SwapId) {
        if self.secrets.remove(swap_id).is_some() {
            debug!("Cleared secret for swap {}", swap_id);
        }
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}
