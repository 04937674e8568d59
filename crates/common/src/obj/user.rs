//! User objects: identity, key endorsements and the manifests catalog.

use serde_yaml::{Mapping, Value};

use crate::crypto::{SigContext, SigError};
use crate::manifest::{Manifest, ManifestError, Schema};

use super::{Link, ObjectError};

/// A Wildland user.
///
/// The first entry of `pubkeys` is the user's primary key; the remaining
/// entries are secondary keys the user endorses; manifests owned by this
/// user verify against any of them.
#[derive(Debug, Clone)]
pub struct User {
    manifest: Manifest,
    owner: String,
    pubkeys: Vec<String>,
    paths: Vec<String>,
    manifests_catalog: Vec<CatalogEntry>,
    members: Vec<String>,
}

/// One entry of a user's manifests catalog: where the user publishes
/// further container manifests.
#[derive(Debug, Clone)]
pub enum CatalogEntry {
    /// An inline container stub.
    Stub(Mapping),
    /// A link to a container manifest.
    Link(Link),
    /// A URL to resolve through the client.
    Url(String),
}

impl User {
    pub fn from_manifest(manifest: Manifest) -> Result<Self, ObjectError> {
        let object = manifest.object_type()?;
        if object != "user" {
            return Err(ObjectError::WrongType {
                expected: "user".into(),
                actual: object.into(),
            });
        }
        manifest.apply_schema(&Schema::for_object("user")?)?;

        let fields = manifest.fields()?;
        let owner = manifest.owner()?.to_string();
        let pubkeys = str_list(fields, "pubkeys")?;
        if pubkeys.is_empty() {
            return Err(ObjectError::Invalid("user needs at least one pubkey".into()));
        }
        let paths = str_list(fields, "paths")?;

        let mut manifests_catalog = Vec::new();
        if let Some(Value::Sequence(entries)) = fields.get("manifests-catalog") {
            for entry in entries {
                manifests_catalog.push(CatalogEntry::parse(entry)?);
            }
        }

        let mut members = Vec::new();
        if let Some(Value::Sequence(entries)) = fields.get("members") {
            for entry in entries {
                let path = entry
                    .as_mapping()
                    .and_then(|m| m.get("user-path"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        ObjectError::Invalid("members entries must carry user-path".into())
                    })?;
                members.push(path.to_string());
            }
        }

        Ok(Self {
            manifest,
            owner,
            pubkeys,
            paths,
            manifests_catalog,
            members,
        })
    }

    /// Build the manifest fields for a new user.
    pub fn make_fields(
        owner: &str,
        pubkeys: &[String],
        paths: &[String],
    ) -> Result<Mapping, ManifestError> {
        let mut fields = Mapping::new();
        fields.insert("object".into(), "user".into());
        fields.insert("owner".into(), owner.into());
        fields.insert("version".into(), "1".into());
        fields.insert(
            "pubkeys".into(),
            Value::Sequence(pubkeys.iter().map(|key| key.as_str().into()).collect()),
        );
        fields.insert(
            "paths".into(),
            Value::Sequence(paths.iter().map(|path| path.as_str().into()).collect()),
        );
        Ok(fields)
    }

    /// Register this user's keys in a signature context: the primary key
    /// first, then every secondary key with an endorsement edge back to
    /// this owner.
    pub fn add_user_keys(&self, sig: &mut dyn SigContext) -> Result<(), SigError> {
        let mut pubkeys = self.pubkeys.iter();
        if let Some(primary) = pubkeys.next() {
            sig.add_pubkey(primary, None)?;
        }
        for secondary in pubkeys {
            sig.add_pubkey(secondary, Some(&self.owner))?;
        }
        Ok(())
    }

    /* Getters */

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn primary_pubkey(&self) -> &str {
        &self.pubkeys[0]
    }

    pub fn pubkeys(&self) -> &[String] {
        &self.pubkeys
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn manifests_catalog(&self) -> &[CatalogEntry] {
        &self.manifests_catalog
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }
}

impl CatalogEntry {
    fn parse(entry: &Value) -> Result<Self, ObjectError> {
        match entry {
            Value::String(url) => Ok(CatalogEntry::Url(url.clone())),
            Value::Mapping(mapping) => {
                if mapping.get("object").and_then(Value::as_str) == Some("link") {
                    Ok(CatalogEntry::Link(Link::from_fields(mapping)?))
                } else {
                    Ok(CatalogEntry::Stub(mapping.clone()))
                }
            }
            _ => Err(ObjectError::Invalid(
                "manifests-catalog entries must be strings or mappings".into(),
            )),
        }
    }
}

fn str_list(fields: &Mapping, name: &str) -> Result<Vec<String>, ObjectError> {
    let list = fields
        .get(name)
        .and_then(Value::as_sequence)
        .ok_or_else(|| ObjectError::Invalid(format!("expecting a {:?} list", name)))?;
    list.iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| ObjectError::Invalid(format!("{:?} entries must be strings", name)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{DummySigContext, SigContext as _};

    fn user_manifest(sig: &DummySigContext, owner: &str, pubkeys: &[String]) -> Manifest {
        let fields =
            User::make_fields(owner, pubkeys, &[format!("/users/{}", owner)]).unwrap();
        let mut manifest = Manifest::from_fields(fields).unwrap();
        manifest.sign(sig, false).unwrap();
        manifest
    }

    #[test]
    fn test_user_from_manifest() {
        let mut sig = DummySigContext::new();
        let (owner, pubkey) = sig.generate().unwrap();
        let manifest = user_manifest(&sig, &owner, &[pubkey.clone()]);

        let user = User::from_manifest(manifest).unwrap();
        assert_eq!(user.owner(), owner);
        assert_eq!(user.primary_pubkey(), pubkey);
    }

    #[test]
    fn test_add_user_keys_endorses_secondaries() {
        let mut sig = DummySigContext::new();
        let (owner, pubkey) = sig.generate().unwrap();
        let manifest = user_manifest(
            &sig,
            &owner,
            &[pubkey, "key.0xsecondary".to_string()],
        );
        let user = User::from_manifest(manifest).unwrap();

        let mut fresh = DummySigContext::new();
        user.add_user_keys(&mut fresh).unwrap();
        assert!(fresh.possible_owners("0xsecondary").contains(&owner));
        // The primary key does not endorse anyone else.
        assert_eq!(fresh.possible_owners(&owner).len(), 1);
    }

    #[test]
    fn test_wrong_object_type() {
        let mut sig = DummySigContext::new();
        let (owner, _) = sig.generate().unwrap();
        let mut fields = Mapping::new();
        fields.insert("object".into(), "container".into());
        fields.insert("owner".into(), owner.as_str().into());
        fields.insert("version".into(), "1".into());
        let mut manifest = Manifest::from_fields(fields).unwrap();
        manifest.sign(&sig, false).unwrap();

        assert!(matches!(
            User::from_manifest(manifest),
            Err(ObjectError::WrongType { .. })
        ));
    }
}
