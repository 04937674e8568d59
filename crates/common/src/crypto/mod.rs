//! Signature contexts.
//!
//! A [`SigContext`] owns the set of keys a client knows about and performs
//! detached signing, verification and per-recipient encryption of manifest
//! bodies. Two variants exist: [`SodiumSigContext`] (ed25519 signatures,
//! curve25519 sealed-box encryption, keys persisted under a key directory)
//! and [`DummySigContext`] for tests (signature is `dummy.<fingerprint>`).
//!
//! Contexts operate on *fingerprints*: short stable identifiers derived
//! from public key material (`0x` + hex of a prefix of the raw key in the
//! sodium variant).

mod dummy;
mod sodium;

pub use dummy::DummySigContext;
pub use sodium::SodiumSigContext;

use std::collections::{HashMap, HashSet, VecDeque};

/// Errors from signing, verification or key management. Never retried.
#[derive(Debug, thiserror::Error)]
pub enum SigError {
    #[error("cannot verify signature: {0}")]
    BadSignature(String),

    #[error("unknown signer: {0}")]
    UnknownKey(String),

    #[error("secret key not found: {0}")]
    KeyNotFound(String),

    #[error("invalid key: {0}")]
    KeyFormat(String),

    #[error("cannot decrypt data: no matching key")]
    DecryptionFailed,

    #[error("key storage error: {0}")]
    KeyStorage(#[from] std::io::Error),
}

/// A directed endorsement graph between key fingerprints.
///
/// `add_owner(key, owner)` records that `owner` endorses `key` (i.e. `key`
/// may sign on `owner`'s behalf). [`OwnerGraph::possible_owners`] walks the
/// graph transitively: the result of verifying a signature is acceptable
/// for a manifest owner `O` iff `O` is in the signer's possible owners.
#[derive(Debug, Clone, Default)]
pub struct OwnerGraph {
    // key fingerprint -> owners endorsing it
    owners: HashMap<String, HashSet<String>>,
}

impl OwnerGraph {
    pub fn add_owner(&mut self, key: &str, owner: &str) {
        self.owners
            .entry(key.to_string())
            .or_default()
            .insert(owner.to_string());
    }

    pub fn remove_key(&mut self, key: &str) {
        self.owners.remove(key);
        for endorsers in self.owners.values_mut() {
            endorsers.remove(key);
        }
    }

    /// All identities the given signer may act for, including itself.
    pub fn possible_owners(&self, signer: &str) -> HashSet<String> {
        let mut result = HashSet::new();
        let mut queue = VecDeque::from([signer.to_string()]);
        while let Some(current) = queue.pop_front() {
            if !result.insert(current.clone()) {
                continue;
            }
            if let Some(owners) = self.owners.get(&current) {
                for owner in owners {
                    queue.push_back(owner.clone());
                }
            }
        }
        result
    }
}

/// Capability set shared by all signature context variants.
///
/// Implementations must be cheap to [`SigContext::duplicate`]: verifying a
/// self-signed manifest uses a scratch copy so the embedded pubkey does not
/// leak into the caller's context.
pub trait SigContext: Send + Sync {
    /// Generate a new keypair, persisting it where the variant keeps keys.
    /// Returns `(fingerprint, pubkey)`.
    fn generate(&mut self) -> Result<(String, String), SigError>;

    /// Load a previously generated keypair by fingerprint.
    fn load_key(&mut self, key_id: &str) -> Result<(String, String), SigError>;

    /// Compute the fingerprint of a public key without registering it.
    fn fingerprint(&self, pubkey: &str) -> Result<String, SigError>;

    /// Register a public key. When `owner` is given, record the endorsement
    /// edge in the ownership graph. Returns the key's fingerprint.
    fn add_pubkey(&mut self, pubkey: &str, owner: Option<&str>) -> Result<String, SigError>;

    /// Forget a key and all its endorsement edges.
    fn remove_key(&mut self, key_id: &str) -> Result<(), SigError>;

    /// Get a registered public key by fingerprint.
    fn get_pubkey(&self, signer: &str) -> Result<String, SigError>;

    /// Whether the secret half for this fingerprint is available.
    fn is_private_key_available(&self, key_id: &str) -> bool;

    /// Sign data on behalf of `owner`.
    ///
    /// With `only_primary` the owner's own secret must be loaded; otherwise
    /// any loaded secret whose key the owner endorses may be used.
    fn sign(&self, owner: &str, data: &[u8], only_primary: bool) -> Result<String, SigError>;

    /// Verify a detached signature, returning the signer's fingerprint.
    /// The signer may differ from a manifest's owner (secondary keys).
    fn verify(&self, signature: &str, data: &[u8]) -> Result<String, SigError>;

    /// The set of identities the signer may sign for (see [`OwnerGraph`]).
    fn possible_owners(&self, signer: &str) -> HashSet<String>;

    /// Encrypt data for a set of recipient public keys.
    ///
    /// A fresh symmetric key encrypts the data once; the key is wrapped
    /// separately for each recipient. Returns `(ciphertext, wrapped_keys)`.
    fn encrypt(&self, data: &[u8], keys: &[String]) -> Result<(String, Vec<String>), SigError>;

    /// Try every wrapped key against every loaded secret.
    fn decrypt(&self, ciphertext: &str, wrapped_keys: &[String]) -> Result<Vec<u8>, SigError>;

    /// Create an independent copy of this context.
    fn duplicate(&self) -> Box<dyn SigContext>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_possible_owners_transitive() {
        let mut graph = OwnerGraph::default();
        graph.add_owner("0xkey2", "0xkey1");
        graph.add_owner("0xkey3", "0xkey2");

        let owners = graph.possible_owners("0xkey3");
        assert!(owners.contains("0xkey3"));
        assert!(owners.contains("0xkey2"));
        assert!(owners.contains("0xkey1"));

        let owners = graph.possible_owners("0xkey1");
        assert_eq!(owners.len(), 1);
        assert!(owners.contains("0xkey1"));
    }

    #[test]
    fn test_possible_owners_cycle() {
        let mut graph = OwnerGraph::default();
        graph.add_owner("0xa", "0xb");
        graph.add_owner("0xb", "0xa");

        let owners = graph.possible_owners("0xa");
        assert_eq!(owners.len(), 2);
    }

    #[test]
    fn test_remove_key_drops_edges() {
        let mut graph = OwnerGraph::default();
        graph.add_owner("0xkey2", "0xkey1");
        graph.remove_key("0xkey2");
        assert_eq!(graph.possible_owners("0xkey2").len(), 1);
    }
}
