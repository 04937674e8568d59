//! Bridge objects: one user's endorsement of another user's namespace.

use serde_yaml::{Mapping, Value};

use crate::manifest::{Manifest, Schema};

use super::{Link, ObjectError};

/// Where a bridge's target user manifest lives.
#[derive(Debug, Clone)]
pub enum UserLocation {
    Url(String),
    Link(Link),
}

/// A bridge: mounts a remote user's namespace under the bridge owner's
/// paths, endorsing the remote user's public key along the way.
#[derive(Debug, Clone)]
pub struct Bridge {
    manifest: Option<Manifest>,
    owner: String,
    user_pubkey: String,
    user_id: String,
    user_location: UserLocation,
    paths: Vec<String>,
}

impl Bridge {
    pub fn from_manifest(manifest: Manifest) -> Result<Self, ObjectError> {
        let object = manifest.object_type()?;
        if object != "bridge" {
            return Err(ObjectError::WrongType {
                expected: "bridge".into(),
                actual: object.into(),
            });
        }
        manifest.apply_schema(&Schema::for_object("bridge")?)?;
        let fields = manifest.fields()?;

        let owner = manifest.owner()?.to_string();
        let user_pubkey = require_str(fields, "user-pubkey")?;
        let user_id = require_str(fields, "user-id")?;
        let user_location = match fields.get("user-location") {
            Some(Value::String(url)) => UserLocation::Url(url.clone()),
            Some(Value::Mapping(link)) => UserLocation::Link(Link::from_fields(link)?),
            _ => {
                return Err(ObjectError::Invalid(
                    "bridge needs a user-location url or link".into(),
                ))
            }
        };
        let paths = fields
            .get("paths")
            .and_then(Value::as_sequence)
            .map(|seq| {
                seq.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        if paths.is_empty() {
            return Err(ObjectError::Invalid("bridge needs at least one path".into()));
        }

        Ok(Self {
            manifest: Some(manifest),
            owner,
            user_pubkey,
            user_id,
            user_location,
            paths,
        })
    }

    /* Getters */

    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn user_pubkey(&self) -> &str {
        &self.user_pubkey
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn user_location(&self) -> &UserLocation {
        &self.user_location
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }
}

fn require_str(fields: &Mapping, name: &str) -> Result<String, ObjectError> {
    fields
        .get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ObjectError::Invalid(format!("bridge needs a {:?} field", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{DummySigContext, SigContext as _};

    #[test]
    fn test_bridge_from_manifest() {
        let mut sig = DummySigContext::new();
        let (owner, _) = sig.generate().unwrap();

        let text = format!(
            concat!(
                "object: bridge\n",
                "owner: '{owner}'\n",
                "version: '1'\n",
                "user-pubkey: key.0xremote\n",
                "user-id: '0xremote'\n",
                "user-location: https://example.com/remote.user.yaml\n",
                "paths:\n",
                "- /people/remote\n",
            ),
            owner = owner
        );
        let fields = match serde_yaml::from_str(&text).unwrap() {
            Value::Mapping(mapping) => mapping,
            _ => unreachable!(),
        };
        let mut manifest = Manifest::from_fields(fields).unwrap();
        manifest.sign(&sig, false).unwrap();

        let bridge = Bridge::from_manifest(manifest).unwrap();
        assert_eq!(bridge.owner(), owner);
        assert_eq!(bridge.user_id(), "0xremote");
        assert!(matches!(bridge.user_location(), UserLocation::Url(_)));
        assert_eq!(bridge.paths(), ["/people/remote"]);
    }
}
