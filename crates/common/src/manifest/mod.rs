//! # Signed manifests
//!
//! A manifest is an opaque byte sequence: an ASCII [`Header`] carrying the
//! detached signature (and optionally the signer's public key), a `---`
//! separator line, and a canonical YAML body. The body bytes are the exact
//! input to the signature and are preserved verbatim (`original_data`) so
//! that re-emission is byte-identical.
//!
//! ## Encryption model
//!
//! When a manifest restricts `access` to a set of users, the stored body is
//! `{encrypted: {encrypted-data, encrypted-keys}}` with one wrapped key per
//! recipient. The in-memory fields stay decrypted; only `original_data`
//! (the signed bytes) holds the ciphertext.

pub mod header;
pub mod schema;

pub use header::{split_header, Header, SelfSigned};
pub use schema::{CommandSet, Schema};

use serde_yaml::{Mapping, Value};

use crate::crypto::{SigContext, SigError};

/// Errors from manifest loading, construction or validation.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("separator not found in manifest")]
    MissingSeparator,

    #[error("malformed manifest header: {0}")]
    HeaderParse(String),

    #[error("manifest parse error: {0}")]
    Parse(String),

    #[error("schema violation at {path}: {detail}")]
    Schema { path: String, detail: String },

    #[error("signature verification failed: {0}")]
    Signature(#[from] SigError),

    #[error("trying to use an unsigned manifest")]
    Unsigned,

    #[error("manifest already signed")]
    AlreadySigned,

    #[error("manifest owner {manifest} does not match signer {signer}")]
    OwnerMismatch { signer: String, manifest: String },
}

/// A loaded or constructed manifest.
///
/// The fields must not be modified after signing; they have to keep
/// matching the signed bytes.
#[derive(Debug, Clone)]
pub struct Manifest {
    // Set once the signature has been verified, or an unsigned manifest was
    // explicitly accepted.
    header: Option<Header>,
    fields: Mapping,
    // The signed body bytes. For encrypted manifests this is the
    // ciphertext envelope, not the decrypted fields.
    original_data: Vec<u8>,
}

impl Manifest {
    /// Create an unsigned manifest from a set of fields.
    pub fn from_fields(fields: Mapping) -> Result<Self, ManifestError> {
        require_str(&fields, "owner")?;
        require_str(&fields, "object")?;
        let original_data = canonical_bytes(&fields)?;
        Ok(Self {
            header: None,
            fields,
            original_data,
        })
    }

    /// Create an unsigned manifest from serialized YAML. An existing header
    /// is stripped and ignored.
    pub fn from_unsigned_bytes(data: &[u8]) -> Result<Self, ManifestError> {
        let body = match split_header(data) {
            Ok((_, body)) => body,
            Err(ManifestError::MissingSeparator) => data,
            Err(e) => return Err(e),
        };
        let fields = parse_body(body)?;
        require_str(&fields, "owner")?;
        require_str(&fields, "object")?;
        Ok(Self {
            header: None,
            fields,
            original_data: body.to_vec(),
        })
    }

    /// Load and verify a manifest from its on-disk bytes.
    ///
    /// `trusted_owner` accepts a signature-less manifest from that owner
    /// (files read out of a trusted storage). `self_signed` controls
    /// whether an embedded pubkey is rejected, accepted or required.
    pub fn from_bytes(
        data: &[u8],
        sig: &dyn SigContext,
        schema: Option<&Schema>,
        self_signed: SelfSigned,
        trusted_owner: Option<&str>,
    ) -> Result<Self, ManifestError> {
        let (header_data, rest_data) = split_header(data)?;
        let header = Header::from_bytes(header_data)?;
        let signer = header.verify_rest(rest_data, sig, self_signed, trusted_owner)?;

        let mut fields = parse_body(rest_data)?;
        if let Some(envelope) = encrypted_envelope(&fields)? {
            let plaintext = sig.decrypt(&envelope.0, &envelope.1)?;
            fields = parse_body(&plaintext)?;
        }

        let owner = require_str(&fields, "owner")?.to_string();
        if owner != signer {
            if header.signature.is_none() {
                return Err(ManifestError::Parse(format!(
                    "wrong owner for manifest without signature: trusted owner {:?}, manifest {:?}",
                    signer, owner
                )));
            }
            if !sig.possible_owners(&signer).contains(&owner) {
                return Err(ManifestError::OwnerMismatch {
                    signer,
                    manifest: owner,
                });
            }
        }

        let manifest = Self {
            header: Some(header),
            fields,
            original_data: rest_data.to_vec(),
        };
        if let Some(schema) = schema {
            manifest.apply_schema(schema)?;
        }
        Ok(manifest)
    }

    /// Sign a previously unsigned manifest with the owner's key.
    ///
    /// If `attach_pubkey` is set, the public key is embedded so the
    /// manifest becomes self-verifying.
    pub fn sign(&mut self, sig: &dyn SigContext, attach_pubkey: bool) -> Result<(), ManifestError> {
        self.sign_with(sig, attach_pubkey, false)
    }

    /// Like [`Manifest::sign`], optionally allowing an endorsed secondary
    /// key when the owner's own secret is not loaded.
    pub fn sign_with(
        &mut self,
        sig: &dyn SigContext,
        attach_pubkey: bool,
        use_secondary: bool,
    ) -> Result<(), ManifestError> {
        if self.header.is_some() {
            return Err(ManifestError::AlreadySigned);
        }
        let owner = require_str(&self.fields, "owner")?.to_string();
        let signature = sig.sign(&owner, &self.original_data, !use_secondary)?;
        let pubkey = if attach_pubkey {
            Some(sig.get_pubkey(&owner)?)
        } else {
            None
        };
        self.header = Some(Header::new(Some(signature), pubkey));
        Ok(())
    }

    /// Explicitly mark the manifest as unsigned and allow using it.
    pub fn skip_signing(&mut self) {
        self.header = Some(Header::empty());
    }

    /// Encrypt the body for the recipients listed in `access`.
    ///
    /// Must precede signing: the signature covers the ciphertext. The
    /// owner is always a recipient so they can read their own manifest.
    /// A missing `access` field, or one granting `{user: "*"}`, leaves
    /// the body in plaintext.
    pub fn encrypt(&mut self, sig: &dyn SigContext) -> Result<(), ManifestError> {
        if self.header.is_some() {
            return Err(ManifestError::AlreadySigned);
        }
        let recipients = match access_recipients(&self.fields)? {
            Some(users) => users,
            None => return Ok(()),
        };
        let owner = require_str(&self.fields, "owner")?.to_string();

        let mut pubkeys = vec![sig.get_pubkey(&owner)?];
        for user in &recipients {
            if *user != owner {
                pubkeys.push(sig.get_pubkey(user)?);
            }
        }

        let plaintext = canonical_bytes(&self.fields)?;
        let (ciphertext, wrapped_keys) = sig.encrypt(&plaintext, &pubkeys)?;

        let mut envelope = Mapping::new();
        envelope.insert("encrypted-data".into(), Value::String(ciphertext));
        envelope.insert(
            "encrypted-keys".into(),
            Value::Sequence(wrapped_keys.into_iter().map(Value::String).collect()),
        );
        let mut body = Mapping::new();
        body.insert("encrypted".into(), Value::Mapping(envelope));
        self.original_data = canonical_bytes(&body)?;
        Ok(())
    }

    /// Serialize the manifest, including the signature.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ManifestError> {
        let header = self.header.as_ref().ok_or(ManifestError::Unsigned)?;
        let mut out = header.to_bytes()?;
        out.extend_from_slice(header::HEADER_SEPARATOR);
        out.extend_from_slice(&self.original_data);
        Ok(out)
    }

    /// Validate the fields against a schema.
    pub fn apply_schema(&self, schema: &Schema) -> Result<(), ManifestError> {
        schema.validate(&yaml_to_json(&Value::Mapping(self.fields.clone()))?)
    }

    /* Getters */

    /// The manifest fields. Fails on a manifest that was never signed nor
    /// explicitly accepted as unsigned.
    pub fn fields(&self) -> Result<&Mapping, ManifestError> {
        if self.header.is_none() {
            return Err(ManifestError::Unsigned);
        }
        Ok(&self.fields)
    }

    pub fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    pub fn original_data(&self) -> &[u8] {
        &self.original_data
    }

    pub fn owner(&self) -> Result<&str, ManifestError> {
        require_str(&self.fields, "owner")
    }

    pub fn object_type(&self) -> Result<&str, ManifestError> {
        require_str(&self.fields, "object")
    }

    /// String field accessor used by the typed object wrappers.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }
}

fn parse_body(body: &[u8]) -> Result<Mapping, ManifestError> {
    let text = std::str::from_utf8(body)
        .map_err(|e| ManifestError::Parse(format!("body is not UTF-8: {}", e)))?;
    let value: Value =
        serde_yaml::from_str(text).map_err(|e| ManifestError::Parse(e.to_string()))?;
    match value {
        Value::Mapping(mapping) => Ok(mapping),
        _ => Err(ManifestError::Parse("manifest body must be a mapping".into())),
    }
}

fn require_str<'a>(fields: &'a Mapping, name: &str) -> Result<&'a str, ManifestError> {
    fields
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| ManifestError::Parse(format!("expecting a {:?} field", name)))
}

/// Detect the `{encrypted: {encrypted-data, encrypted-keys}}` body shape.
fn encrypted_envelope(fields: &Mapping) -> Result<Option<(String, Vec<String>)>, ManifestError> {
    if fields.len() != 1 {
        return Ok(None);
    }
    let envelope = match fields.get("encrypted") {
        Some(Value::Mapping(envelope)) => envelope,
        Some(_) => return Err(ManifestError::Parse("malformed encrypted envelope".into())),
        None => return Ok(None),
    };
    let data = envelope
        .get("encrypted-data")
        .and_then(Value::as_str)
        .ok_or_else(|| ManifestError::Parse("encrypted-data missing".into()))?;
    let keys = envelope
        .get("encrypted-keys")
        .and_then(Value::as_sequence)
        .ok_or_else(|| ManifestError::Parse("encrypted-keys missing".into()))?
        .iter()
        .map(|key| {
            key.as_str()
                .map(str::to_string)
                .ok_or_else(|| ManifestError::Parse("encrypted-keys must be strings".into()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some((data.to_string(), keys)))
}

/// Recipient fingerprints from an `access` field, or `None` when the
/// manifest stays in plaintext (no access list, or `{user: "*"}`).
fn access_recipients(fields: &Mapping) -> Result<Option<Vec<String>>, ManifestError> {
    let access = match fields.get("access").and_then(Value::as_sequence) {
        Some(access) if !access.is_empty() => access,
        _ => return Ok(None),
    };
    let mut users = Vec::new();
    for entry in access {
        let user = entry
            .as_mapping()
            .and_then(|m| m.get("user"))
            .and_then(Value::as_str)
            .ok_or_else(|| ManifestError::Parse("access entries must carry a user".into()))?;
        if user == "*" {
            return Ok(None);
        }
        users.push(user.to_string());
    }
    Ok(Some(users))
}

/// Dump fields as canonical YAML: mapping keys sorted, block style.
/// These bytes are the exact signature input.
pub fn canonical_bytes(fields: &Mapping) -> Result<Vec<u8>, ManifestError> {
    let sorted = sort_keys(&Value::Mapping(fields.clone()));
    let text = serde_yaml::to_string(&sorted).map_err(|e| ManifestError::Parse(e.to_string()))?;
    Ok(text.into_bytes())
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Mapping(mapping) => {
            let mut entries: Vec<(&Value, &Value)> = mapping.iter().collect();
            entries.sort_by_key(|(key, _)| key.as_str().map(str::to_string));
            let mut sorted = Mapping::new();
            for (key, val) in entries {
                sorted.insert(key.clone(), sort_keys(val));
            }
            Value::Mapping(sorted)
        }
        Value::Sequence(seq) => Value::Sequence(seq.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// Convert YAML fields to JSON for schema validation.
pub fn yaml_to_json(value: &Value) -> Result<serde_json::Value, ManifestError> {
    serde_json::to_value(value).map_err(|e| ManifestError::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DummySigContext;

    fn fields(owner: &str) -> Mapping {
        let text = format!(
            "object: container\nowner: '{}'\nversion: '1'\npaths:\n- /.uuid/1\n",
            owner
        );
        match serde_yaml::from_str(&text).unwrap() {
            Value::Mapping(mapping) => mapping,
            _ => unreachable!(),
        }
    }

    fn signer() -> (String, DummySigContext) {
        let mut sig = DummySigContext::new();
        let (owner, _) = sig.generate().unwrap();
        (owner, sig)
    }

    #[test]
    fn test_roundtrip() {
        let (owner, sig) = signer();
        let mut manifest = Manifest::from_fields(fields(&owner)).unwrap();
        manifest.sign(&sig, false).unwrap();
        let data = manifest.to_bytes().unwrap();

        let parsed =
            Manifest::from_bytes(&data, &sig, None, SelfSigned::Disallow, None).unwrap();
        assert_eq!(parsed.header(), manifest.header());
        assert_eq!(parsed.fields().unwrap(), manifest.fields().unwrap());
        assert_eq!(parsed.original_data(), manifest.original_data());

        // Re-emission is byte-identical.
        assert_eq!(parsed.to_bytes().unwrap(), data);
    }

    #[test]
    fn test_canonical_bytes_sorted() {
        let mut mapping = Mapping::new();
        mapping.insert("zebra".into(), Value::from(1));
        mapping.insert("alpha".into(), Value::from(2));
        let bytes = canonical_bytes(&mapping).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.find("alpha").unwrap() < text.find("zebra").unwrap());
    }

    #[test]
    fn test_unsigned_fields_inaccessible() {
        let (owner, _sig) = signer();
        let manifest = Manifest::from_fields(fields(&owner)).unwrap();
        assert!(matches!(manifest.fields(), Err(ManifestError::Unsigned)));
        assert!(matches!(manifest.to_bytes(), Err(ManifestError::Unsigned)));
    }

    #[test]
    fn test_skip_signing() {
        let (owner, _sig) = signer();
        let mut manifest = Manifest::from_fields(fields(&owner)).unwrap();
        manifest.skip_signing();
        assert!(manifest.fields().is_ok());
    }

    #[test]
    fn test_tampered_body_rejected() {
        let (owner, sig) = signer();
        let mut manifest = Manifest::from_fields(fields(&owner)).unwrap();
        manifest.sign(&sig, false).unwrap();
        let data = manifest.to_bytes().unwrap();

        // Forge the owner in the body without re-signing.
        let tampered = String::from_utf8(data).unwrap().replace(&owner, "0xevil");
        let result =
            Manifest::from_bytes(tampered.as_bytes(), &sig, None, SelfSigned::Disallow, None);
        assert!(result.is_err());
    }

    #[test]
    fn test_secondary_key_signature() {
        let mut sig = DummySigContext::new();
        let (owner, owner_pub) = sig.generate().unwrap();
        let (secondary, secondary_pub) = sig.generate().unwrap();
        // Drop the owner's secret but keep the public key known, and
        // endorse the secondary key.
        sig.remove_key(&owner).unwrap();
        sig.add_pubkey(&owner_pub, None).unwrap();
        sig.add_pubkey(&secondary_pub, Some(&owner)).unwrap();

        let mut manifest = Manifest::from_fields(fields(&owner)).unwrap();
        assert!(manifest.sign(&sig, false).is_err());
        manifest.sign_with(&sig, false, true).unwrap();

        let data = manifest.to_bytes().unwrap();
        let parsed =
            Manifest::from_bytes(&data, &sig, None, SelfSigned::Disallow, None).unwrap();
        assert_eq!(parsed.owner().unwrap(), owner);
        // The signer is the secondary key, not the owner.
        let signature = parsed.header().unwrap().signature.clone().unwrap();
        assert!(signature.contains(&secondary));
        assert!(sig.possible_owners(&secondary).contains(&owner));
    }

    #[test]
    fn test_unrelated_signer_rejected() {
        let mut sig = DummySigContext::new();
        let (owner, _) = sig.generate().unwrap();
        let (_other, _) = sig.generate().unwrap();

        let mut manifest = Manifest::from_fields(fields(&owner)).unwrap();
        manifest.sign(&sig, false).unwrap();
        let data = manifest.to_bytes().unwrap();

        // Replace the signature with one from an unrelated key.
        let text = String::from_utf8(data).unwrap();
        let forged = text.replace(
            &format!("dummy.{}", owner),
            &format!("dummy.{}", _other),
        );
        let result =
            Manifest::from_bytes(forged.as_bytes(), &sig, None, SelfSigned::Disallow, None);
        assert!(matches!(result, Err(ManifestError::OwnerMismatch { .. })));
    }

    #[test]
    fn test_self_signed_policies() {
        let mut sig = DummySigContext::new();
        let (owner, _) = sig.generate().unwrap();
        let mut manifest = Manifest::from_fields(fields(&owner)).unwrap();
        manifest.sign(&sig, true).unwrap();
        let data = manifest.to_bytes().unwrap();

        // A context that does not know the key accepts the self-signed form.
        let fresh = DummySigContext::new();
        assert!(Manifest::from_bytes(&data, &fresh, None, SelfSigned::Require, None).is_ok());
        assert!(Manifest::from_bytes(&data, &fresh, None, SelfSigned::Allow, None).is_ok());
        assert!(Manifest::from_bytes(&data, &fresh, None, SelfSigned::Disallow, None).is_err());
    }

    #[test]
    fn test_trusted_owner_accepts_unsigned() {
        let mut sig = DummySigContext::new();
        let (owner, _) = sig.generate().unwrap();
        let mut manifest = Manifest::from_fields(fields(&owner)).unwrap();
        manifest.skip_signing();
        let data = manifest.to_bytes().unwrap();

        assert!(
            Manifest::from_bytes(&data, &sig, None, SelfSigned::Disallow, Some(&owner)).is_ok()
        );
        // Without a trusted owner the unsigned manifest is rejected.
        assert!(Manifest::from_bytes(&data, &sig, None, SelfSigned::Disallow, None).is_err());
        // A different trusted owner does not match the manifest owner.
        assert!(
            Manifest::from_bytes(&data, &sig, None, SelfSigned::Disallow, Some("0xother"))
                .is_err()
        );
    }

    #[test]
    fn test_encrypted_manifest_roundtrip() {
        let mut sig = DummySigContext::new();
        let (owner, _) = sig.generate().unwrap();

        let mut plain = fields(&owner);
        let access: Value = serde_yaml::from_str(&format!("- user: '{}'", owner)).unwrap();
        plain.insert("access".into(), access);

        let mut manifest = Manifest::from_fields(plain.clone()).unwrap();
        manifest.encrypt(&sig).unwrap();
        manifest.sign(&sig, false).unwrap();
        let data = manifest.to_bytes().unwrap();

        // The serialized body is the ciphertext envelope.
        let text = String::from_utf8(data.clone()).unwrap();
        assert!(text.contains("encrypted-data"));
        assert!(!text.contains("/.uuid/1"));

        // The owner can decrypt and read the original fields.
        let parsed = Manifest::from_bytes(&data, &sig, None, SelfSigned::Disallow, None).unwrap();
        assert_eq!(parsed.fields().unwrap(), &plain);

        // A third party cannot.
        let mut outsider = DummySigContext::new();
        outsider.generate().unwrap();
        outsider.add_pubkey(&format!("key.{}", owner), None).unwrap();
        assert!(
            Manifest::from_bytes(&data, &outsider, None, SelfSigned::Disallow, None).is_err()
        );
    }

    #[test]
    fn test_access_wildcard_stays_plaintext() {
        let mut sig = DummySigContext::new();
        let (owner, _) = sig.generate().unwrap();

        let mut plain = fields(&owner);
        let access: Value = serde_yaml::from_str("- user: '*'").unwrap();
        plain.insert("access".into(), access);

        let mut manifest = Manifest::from_fields(plain).unwrap();
        manifest.encrypt(&sig).unwrap();
        manifest.sign(&sig, false).unwrap();
        let text = String::from_utf8(manifest.to_bytes().unwrap()).unwrap();
        assert!(!text.contains("encrypted-data"));
    }
}
