//! Dummy signature context for tests: signatures are `dummy.<fingerprint>`,
//! public keys are `key.<fingerprint>`. No actual cryptography.

use std::collections::HashSet;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use super::{OwnerGraph, SigContext, SigError};

#[derive(Debug, Clone, Default)]
pub struct DummySigContext {
    signers: HashSet<String>,
    secrets: HashSet<String>,
    graph: OwnerGraph,
    counter: u64,
}

impl DummySigContext {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SigContext for DummySigContext {
    fn generate(&mut self) -> Result<(String, String), SigError> {
        self.counter += 1;
        let fingerprint = format!("0x{:020x}", self.counter);
        self.signers.insert(fingerprint.clone());
        self.secrets.insert(fingerprint.clone());
        Ok((fingerprint.clone(), format!("key.{}", fingerprint)))
    }

    fn load_key(&mut self, key_id: &str) -> Result<(String, String), SigError> {
        self.signers.insert(key_id.to_string());
        self.secrets.insert(key_id.to_string());
        Ok((key_id.to_string(), format!("key.{}", key_id)))
    }

    fn fingerprint(&self, pubkey: &str) -> Result<String, SigError> {
        pubkey
            .strip_prefix("key.")
            .map(str::to_string)
            .ok_or_else(|| SigError::KeyFormat(format!("expected key.* key, got {:?}", pubkey)))
    }

    fn add_pubkey(&mut self, pubkey: &str, owner: Option<&str>) -> Result<String, SigError> {
        let fingerprint = self.fingerprint(pubkey)?;
        self.signers.insert(fingerprint.clone());
        if let Some(owner) = owner {
            self.graph.add_owner(&fingerprint, owner);
        }
        Ok(fingerprint)
    }

    fn remove_key(&mut self, key_id: &str) -> Result<(), SigError> {
        self.signers.remove(key_id);
        self.secrets.remove(key_id);
        self.graph.remove_key(key_id);
        Ok(())
    }

    fn get_pubkey(&self, signer: &str) -> Result<String, SigError> {
        if self.signers.contains(signer) {
            Ok(format!("key.{}", signer))
        } else {
            Err(SigError::UnknownKey(signer.to_string()))
        }
    }

    fn is_private_key_available(&self, key_id: &str) -> bool {
        self.secrets.contains(key_id)
    }

    fn sign(&self, owner: &str, data: &[u8], only_primary: bool) -> Result<String, SigError> {
        let _ = data;
        if self.secrets.contains(owner) {
            return Ok(format!("dummy.{}", owner));
        }
        if !only_primary {
            if let Some(secondary) = self
                .secrets
                .iter()
                .find(|fp| self.graph.possible_owners(fp).contains(owner))
            {
                return Ok(format!("dummy.{}", secondary));
            }
        }
        Err(SigError::KeyNotFound(owner.to_string()))
    }

    fn verify(&self, signature: &str, _data: &[u8]) -> Result<String, SigError> {
        let signer = signature.trim().strip_prefix("dummy.").ok_or_else(|| {
            SigError::BadSignature(format!("expected dummy.* signature, got {:?}", signature))
        })?;
        if !self.signers.contains(signer) {
            return Err(SigError::UnknownKey(signer.to_string()));
        }
        Ok(signer.to_string())
    }

    fn possible_owners(&self, signer: &str) -> HashSet<String> {
        self.graph.possible_owners(signer)
    }

    fn encrypt(&self, data: &[u8], keys: &[String]) -> Result<(String, Vec<String>), SigError> {
        let wrapped = keys
            .iter()
            .map(|key| self.fingerprint(key).map(|fp| format!("enc.{}", fp)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((BASE64.encode(data), wrapped))
    }

    fn decrypt(&self, ciphertext: &str, wrapped_keys: &[String]) -> Result<Vec<u8>, SigError> {
        let usable = wrapped_keys.iter().any(|wrapped| {
            wrapped
                .strip_prefix("enc.")
                .is_some_and(|fp| self.secrets.contains(fp))
        });
        if !usable {
            return Err(SigError::DecryptionFailed);
        }
        BASE64
            .decode(ciphertext)
            .map_err(|_| SigError::DecryptionFailed)
    }

    fn duplicate(&self) -> Box<dyn SigContext> {
        Box::new(self.clone())
    }
}
