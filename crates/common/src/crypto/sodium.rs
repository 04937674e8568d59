//! Sodium signature context: ed25519 signatures, curve25519 sealed-box
//! style encryption, keys persisted as `<fingerprint>.pub` / `.sec` files.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use super::{OwnerGraph, SigContext, SigError};

/// Size of raw ed25519 key material.
const KEY_SIZE: usize = 32;
/// Bytes of public key material hashed into a fingerprint.
const FINGERPRINT_PREFIX: usize = 10;
/// XChaCha20-Poly1305 nonce size.
const NONCE_SIZE: usize = 24;

/// Signature context backed by ed25519 keys on disk.
///
/// Public keys and signatures are exchanged as base64; a signature string
/// carries the signer's fingerprint so verification can look up the key:
/// `<fingerprint>:<base64-signature>`.
pub struct SodiumSigContext {
    key_dir: PathBuf,
    pubkeys: HashMap<String, VerifyingKey>,
    secrets: HashMap<String, SigningKey>,
    graph: OwnerGraph,
}

impl SodiumSigContext {
    pub fn new(key_dir: PathBuf) -> Self {
        Self {
            key_dir,
            pubkeys: HashMap::new(),
            secrets: HashMap::new(),
            graph: OwnerGraph::default(),
        }
    }

    pub fn key_dir(&self) -> &PathBuf {
        &self.key_dir
    }

    fn decode_pubkey(pubkey: &str) -> Result<VerifyingKey, SigError> {
        let bytes = BASE64
            .decode(pubkey.trim())
            .map_err(|e| SigError::KeyFormat(format!("pubkey base64: {}", e)))?;
        let bytes: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| SigError::KeyFormat("pubkey has wrong length".into()))?;
        VerifyingKey::from_bytes(&bytes)
            .map_err(|e| SigError::KeyFormat(format!("pubkey decode: {}", e)))
    }

    fn fingerprint_for(key: &VerifyingKey) -> String {
        format!("0x{}", hex::encode(&key.as_bytes()[..FINGERPRINT_PREFIX]))
    }

    /// Write a single-line key file with mode 0600, failing if it exists.
    /// O_EXCL guards against concurrent generators sharing a key directory.
    fn write_key_file(&self, name: &str, contents: &str) -> Result<(), SigError> {
        std::fs::create_dir_all(&self.key_dir)?;
        let path = self.key_dir.join(name);
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(contents.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    fn read_key_file(&self, name: &str) -> Result<String, SigError> {
        let path = self.key_dir.join(name);
        if !path.exists() {
            return Err(SigError::KeyNotFound(name.to_string()));
        }
        Ok(std::fs::read_to_string(path)?.trim().to_string())
    }

    /// Convert an ed25519 public key to its X25519 (Montgomery) form for ECDH.
    fn pubkey_to_x25519(key: &VerifyingKey) -> Result<X25519PublicKey, SigError> {
        let point = CompressedEdwardsY::from_slice(key.as_bytes())
            .map_err(|_| SigError::KeyFormat("invalid edwards point".into()))?
            .decompress()
            .ok_or_else(|| SigError::KeyFormat("cannot decompress edwards point".into()))?;
        Ok(X25519PublicKey::from(point.to_montgomery().to_bytes()))
    }

    fn secret_to_x25519(key: &SigningKey) -> StaticSecret {
        StaticSecret::from(key.to_scalar_bytes())
    }

    fn wrap_key(sym_key: &[u8; KEY_SIZE], recipient: &VerifyingKey) -> Result<String, SigError> {
        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let ephemeral_pub = X25519PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&Self::pubkey_to_x25519(recipient)?);

        let kek = Sha256::digest(shared.as_bytes());
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&kek));
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let wrapped = cipher
            .encrypt(XNonce::from_slice(&nonce), sym_key.as_slice())
            .map_err(|_| SigError::KeyFormat("key wrap failed".into()))?;

        let mut out = Vec::with_capacity(KEY_SIZE + NONCE_SIZE + wrapped.len());
        out.extend_from_slice(ephemeral_pub.as_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&wrapped);
        Ok(BASE64.encode(out))
    }

    fn unwrap_key(wrapped: &str, secret: &SigningKey) -> Option<[u8; KEY_SIZE]> {
        let bytes = BASE64.decode(wrapped.trim()).ok()?;
        if bytes.len() <= KEY_SIZE + NONCE_SIZE {
            return None;
        }
        let mut ephemeral_pub = [0u8; KEY_SIZE];
        ephemeral_pub.copy_from_slice(&bytes[..KEY_SIZE]);
        let nonce = &bytes[KEY_SIZE..KEY_SIZE + NONCE_SIZE];
        let wrapped_key = &bytes[KEY_SIZE + NONCE_SIZE..];

        let shared = Self::secret_to_x25519(secret)
            .diffie_hellman(&X25519PublicKey::from(ephemeral_pub));
        let kek = Sha256::digest(shared.as_bytes());
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&kek));
        let sym_key = cipher
            .decrypt(XNonce::from_slice(nonce), wrapped_key)
            .ok()?;
        sym_key.try_into().ok()
    }
}

impl SigContext for SodiumSigContext {
    fn generate(&mut self) -> Result<(String, String), SigError> {
        let mut seed = [0u8; KEY_SIZE];
        getrandom::getrandom(&mut seed)
            .map_err(|e| SigError::KeyFormat(format!("rng failure: {}", e)))?;
        let signing = SigningKey::from_bytes(&seed);
        let verifying = signing.verifying_key();
        let fingerprint = Self::fingerprint_for(&verifying);
        let pubkey = BASE64.encode(verifying.as_bytes());

        self.write_key_file(&format!("{}.pub", fingerprint), &pubkey)?;
        self.write_key_file(&format!("{}.sec", fingerprint), &BASE64.encode(seed))?;

        self.pubkeys.insert(fingerprint.clone(), verifying);
        self.secrets.insert(fingerprint.clone(), signing);
        Ok((fingerprint, pubkey))
    }

    fn load_key(&mut self, key_id: &str) -> Result<(String, String), SigError> {
        let pubkey = self.read_key_file(&format!("{}.pub", key_id))?;
        let secret = self.read_key_file(&format!("{}.sec", key_id))?;

        let verifying = Self::decode_pubkey(&pubkey)?;
        let fingerprint = Self::fingerprint_for(&verifying);
        if fingerprint != key_id {
            return Err(SigError::KeyFormat(format!(
                "key file {} does not match its fingerprint {}",
                key_id, fingerprint
            )));
        }

        let seed = BASE64
            .decode(secret)
            .map_err(|e| SigError::KeyFormat(format!("secret base64: {}", e)))?;
        let seed: [u8; KEY_SIZE] = seed
            .try_into()
            .map_err(|_| SigError::KeyFormat("secret key has wrong length".into()))?;
        let signing = SigningKey::from_bytes(&seed);
        if signing.verifying_key() != verifying {
            return Err(SigError::KeyFormat(format!(
                "secret key for {} does not match its public key",
                key_id
            )));
        }

        self.pubkeys.insert(fingerprint.clone(), verifying);
        self.secrets.insert(fingerprint.clone(), signing);
        Ok((fingerprint, pubkey))
    }

    fn fingerprint(&self, pubkey: &str) -> Result<String, SigError> {
        Ok(Self::fingerprint_for(&Self::decode_pubkey(pubkey)?))
    }

    fn add_pubkey(&mut self, pubkey: &str, owner: Option<&str>) -> Result<String, SigError> {
        let verifying = Self::decode_pubkey(pubkey)?;
        let fingerprint = Self::fingerprint_for(&verifying);
        self.pubkeys.insert(fingerprint.clone(), verifying);
        if let Some(owner) = owner {
            self.graph.add_owner(&fingerprint, owner);
        }
        Ok(fingerprint)
    }

    fn remove_key(&mut self, key_id: &str) -> Result<(), SigError> {
        self.pubkeys.remove(key_id);
        self.secrets.remove(key_id);
        self.graph.remove_key(key_id);
        Ok(())
    }

    fn get_pubkey(&self, signer: &str) -> Result<String, SigError> {
        self.pubkeys
            .get(signer)
            .map(|key| BASE64.encode(key.as_bytes()))
            .ok_or_else(|| SigError::UnknownKey(signer.to_string()))
    }

    fn is_private_key_available(&self, key_id: &str) -> bool {
        self.secrets.contains_key(key_id)
    }

    fn sign(&self, owner: &str, data: &[u8], only_primary: bool) -> Result<String, SigError> {
        let (fingerprint, key) = if let Some(key) = self.secrets.get(owner) {
            (owner.to_string(), key)
        } else if only_primary {
            return Err(SigError::KeyNotFound(owner.to_string()));
        } else {
            // A secondary key may sign if the owner endorses it.
            self.secrets
                .iter()
                .find(|(fp, _)| self.graph.possible_owners(fp).contains(owner))
                .map(|(fp, key)| (fp.clone(), key))
                .ok_or_else(|| SigError::KeyNotFound(owner.to_string()))?
        };

        let signature: Signature = key.sign(data);
        Ok(format!(
            "{}:{}",
            fingerprint,
            BASE64.encode(signature.to_bytes())
        ))
    }

    fn verify(&self, signature: &str, data: &[u8]) -> Result<String, SigError> {
        let (fingerprint, sig_b64) = signature
            .trim()
            .split_once(':')
            .ok_or_else(|| SigError::BadSignature("malformed signature string".into()))?;

        let key = self
            .pubkeys
            .get(fingerprint)
            .ok_or_else(|| SigError::UnknownKey(fingerprint.to_string()))?;

        let sig_bytes = BASE64
            .decode(sig_b64.trim())
            .map_err(|e| SigError::BadSignature(format!("signature base64: {}", e)))?;
        let sig_bytes: [u8; 64] = sig_bytes
            .try_into()
            .map_err(|_| SigError::BadSignature("signature has wrong length".into()))?;

        key.verify(data, &Signature::from_bytes(&sig_bytes))
            .map_err(|_| SigError::BadSignature(fingerprint.to_string()))?;
        Ok(fingerprint.to_string())
    }

    fn possible_owners(&self, signer: &str) -> HashSet<String> {
        self.graph.possible_owners(signer)
    }

    fn encrypt(&self, data: &[u8], keys: &[String]) -> Result<(String, Vec<String>), SigError> {
        let mut sym_key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut sym_key);
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&sym_key));
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), data)
            .map_err(|_| SigError::KeyFormat("encryption failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);

        let mut wrapped_keys = Vec::with_capacity(keys.len());
        for pubkey in keys {
            let recipient = Self::decode_pubkey(pubkey)?;
            wrapped_keys.push(Self::wrap_key(&sym_key, &recipient)?);
        }
        Ok((BASE64.encode(out), wrapped_keys))
    }

    fn decrypt(&self, ciphertext: &str, wrapped_keys: &[String]) -> Result<Vec<u8>, SigError> {
        let bytes = BASE64
            .decode(ciphertext.trim())
            .map_err(|_| SigError::DecryptionFailed)?;
        if bytes.len() <= NONCE_SIZE {
            return Err(SigError::DecryptionFailed);
        }
        let (nonce, data) = bytes.split_at(NONCE_SIZE);

        for wrapped in wrapped_keys {
            for secret in self.secrets.values() {
                if let Some(sym_key) = Self::unwrap_key(wrapped, secret) {
                    let cipher = XChaCha20Poly1305::new(Key::from_slice(&sym_key));
                    if let Ok(plain) = cipher.decrypt(XNonce::from_slice(nonce), data) {
                        return Ok(plain);
                    }
                }
            }
        }
        Err(SigError::DecryptionFailed)
    }

    fn duplicate(&self) -> Box<dyn SigContext> {
        Box::new(Self {
            key_dir: self.key_dir.clone(),
            pubkeys: self.pubkeys.clone(),
            secrets: self.secrets.clone(),
            graph: self.graph.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> (tempfile::TempDir, SodiumSigContext) {
        let dir = tempfile::tempdir().unwrap();
        let sig = SodiumSigContext::new(dir.path().to_path_buf());
        (dir, sig)
    }

    #[test]
    fn test_generate_and_fingerprint() {
        let (_dir, mut sig) = context();
        let (fingerprint, pubkey) = sig.generate().unwrap();
        assert!(fingerprint.starts_with("0x"));
        assert_eq!(fingerprint.len(), 2 + 2 * FINGERPRINT_PREFIX);
        assert_eq!(sig.fingerprint(&pubkey).unwrap(), fingerprint);
    }

    #[test]
    fn test_key_files_written_once() {
        let (dir, mut sig) = context();
        let (fingerprint, _) = sig.generate().unwrap();

        let sec = dir.path().join(format!("{}.sec", fingerprint));
        assert!(sec.exists());
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&sec).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        // O_EXCL: re-creating the same key file must fail
        assert!(sig.write_key_file(&format!("{}.sec", fingerprint), "x").is_err());
    }

    #[test]
    fn test_load_key_roundtrip() {
        let (dir, mut sig) = context();
        let (fingerprint, pubkey) = sig.generate().unwrap();

        let mut fresh = SodiumSigContext::new(dir.path().to_path_buf());
        let (loaded_fp, loaded_pub) = fresh.load_key(&fingerprint).unwrap();
        assert_eq!(loaded_fp, fingerprint);
        assert_eq!(loaded_pub, pubkey);
        assert!(fresh.is_private_key_available(&fingerprint));
    }

    #[test]
    fn test_sign_verify() {
        let (_dir, mut sig) = context();
        let (fingerprint, _) = sig.generate().unwrap();

        let signature = sig.sign(&fingerprint, b"test data", true).unwrap();
        assert_eq!(sig.verify(&signature, b"test data").unwrap(), fingerprint);
        assert!(matches!(
            sig.verify(&signature, b"other data"),
            Err(SigError::BadSignature(_))
        ));
    }

    #[test]
    fn test_verify_unknown_signer() {
        let (_dir, mut sig) = context();
        let (owner, _) = sig.generate().unwrap();
        let signature = sig.sign(&owner, b"data", true).unwrap();

        let (_dir2, other) = context();
        assert!(matches!(
            other.verify(&signature, b"data"),
            Err(SigError::UnknownKey(_))
        ));
    }

    #[test]
    fn test_sign_with_secondary_key() {
        let (_dir, mut sig) = context();
        let (owner, _) = sig.generate().unwrap();
        let (secondary, secondary_pub) = sig.generate().unwrap();
        sig.add_pubkey(&secondary_pub, Some(&owner)).unwrap();

        // Drop the owner's secret: only the secondary remains usable.
        sig.secrets.remove(&owner);
        assert!(matches!(
            sig.sign(&owner, b"data", true),
            Err(SigError::KeyNotFound(_))
        ));

        let signature = sig.sign(&owner, b"data", false).unwrap();
        let signer = sig.verify(&signature, b"data").unwrap();
        assert_eq!(signer, secondary);
        assert!(sig.possible_owners(&signer).contains(&owner));
    }

    #[test]
    fn test_encrypt_decrypt() {
        let (_dir, mut sig) = context();
        let (_owner, pubkey) = sig.generate().unwrap();

        let (ciphertext, wrapped) = sig.encrypt(b"secret manifest", &[pubkey]).unwrap();
        assert_eq!(wrapped.len(), 1);
        let plain = sig.decrypt(&ciphertext, &wrapped).unwrap();
        assert_eq!(plain, b"secret manifest");
    }

    #[test]
    fn test_decrypt_without_key_fails() {
        let (_dir, mut sig) = context();
        let (_owner, pubkey) = sig.generate().unwrap();
        let (ciphertext, wrapped) = sig.encrypt(b"secret", &[pubkey]).unwrap();

        let (_dir2, mut other) = context();
        other.generate().unwrap();
        assert!(matches!(
            other.decrypt(&ciphertext, &wrapped),
            Err(SigError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_encrypt_multiple_recipients() {
        let (_dir, mut alice) = context();
        let (_fp_a, pub_a) = alice.generate().unwrap();
        let (_dir2, mut bob) = context();
        let (_fp_b, pub_b) = bob.generate().unwrap();

        let (ciphertext, wrapped) = alice.encrypt(b"shared", &[pub_a, pub_b]).unwrap();
        assert_eq!(wrapped.len(), 2);
        assert_eq!(alice.decrypt(&ciphertext, &wrapped).unwrap(), b"shared");
        assert_eq!(bob.decrypt(&ciphertext, &wrapped).unwrap(), b"shared");
    }
}
