//! Storage objects: concrete backends attached to a container.

use serde_yaml::{Mapping, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::manifest::{canonical_bytes, Manifest, ManifestError, Schema};

use super::{Container, ObjectError};

/// Where a storage's manifest catalog keeps its manifest files.
#[derive(Debug, Clone, PartialEq)]
pub enum ManifestPattern {
    /// `/{pattern}/{path}.{object-type}.yaml` style glob; `{path}` expands
    /// to the object's publish path and `*` matches a uuid.
    Glob { path: String },
    /// An explicit list of relative manifest files.
    List { paths: Vec<String> },
}

impl ManifestPattern {
    pub fn from_fields(fields: &Mapping) -> Result<Option<Self>, ObjectError> {
        let pattern = match fields.get("manifest-pattern").and_then(Value::as_mapping) {
            Some(pattern) => pattern,
            None => return Ok(None),
        };
        match pattern.get("type").and_then(Value::as_str) {
            Some("glob") => {
                let path = pattern
                    .get("path")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ObjectError::Invalid("glob pattern needs a path".into()))?;
                Ok(Some(ManifestPattern::Glob {
                    path: path.to_string(),
                }))
            }
            Some("list") => {
                let paths = pattern
                    .get("paths")
                    .and_then(Value::as_sequence)
                    .ok_or_else(|| ObjectError::Invalid("list pattern needs paths".into()))?
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect();
                Ok(Some(ManifestPattern::List { paths }))
            }
            other => Err(ObjectError::Invalid(format!(
                "unknown manifest-pattern type: {:?}",
                other
            ))),
        }
    }

    /// Concrete glob patterns for watching container manifests, with
    /// `{path}` replaced by a wildcard for any publish path.
    pub fn watch_patterns(&self) -> Vec<String> {
        match self {
            ManifestPattern::Glob { path } => vec![path.replace("{path}", "*")],
            ManifestPattern::List { paths } => paths.clone(),
        }
    }
}

/// A storage: one concrete backend of a container.
#[derive(Debug, Clone)]
pub struct Storage {
    manifest: Option<Manifest>,
    owner: String,
    storage_type: String,
    container_path: String,
    backend_id: String,
    trusted: bool,
    primary: bool,
    read_only: bool,
    manifest_pattern: Option<ManifestPattern>,
    // Complete manifest fields, including backend-specific params.
    // Passed verbatim to the daemon's mount command.
    params: Mapping,
}

impl Storage {
    pub fn from_manifest(manifest: Manifest) -> Result<Self, ObjectError> {
        let object = manifest.object_type()?;
        if object != "storage" {
            return Err(ObjectError::WrongType {
                expected: "storage".into(),
                actual: object.into(),
            });
        }
        manifest.apply_schema(&Schema::for_object("storage")?)?;
        let fields = manifest.fields()?.clone();
        let mut storage = Self::from_fields(fields)?;
        storage.manifest = Some(manifest);
        Ok(storage)
    }

    /// Parse storage fields, e.g. from an inline container entry.
    /// A missing `backend-id` is derived deterministically from the params.
    pub fn from_fields(mut fields: Mapping) -> Result<Self, ObjectError> {
        let owner = fields
            .get("owner")
            .and_then(Value::as_str)
            .ok_or_else(|| ObjectError::Invalid("storage needs an owner".into()))?
            .to_string();
        let storage_type = fields
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ObjectError::Invalid("storage needs a type".into()))?
            .to_string();
        let container_path = fields
            .get("container-path")
            .and_then(Value::as_str)
            .ok_or_else(|| ObjectError::Invalid("storage needs a container-path".into()))?
            .to_string();

        let backend_id = match fields.get("backend-id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                let id = derive_backend_id(&fields)?;
                fields.insert("backend-id".into(), id.as_str().into());
                id
            }
        };

        let trusted = fields
            .get("trusted")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let primary = fields
            .get("primary")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let read_only = fields
            .get("read-only")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let manifest_pattern = ManifestPattern::from_fields(&fields)?;

        Ok(Self {
            manifest: None,
            owner,
            storage_type,
            container_path,
            backend_id,
            trusted,
            primary,
            read_only,
            manifest_pattern,
            params: fields,
        })
    }

    /// Check this storage against its owning container.
    pub fn validate_for(&self, container: &Container) -> Result<(), ObjectError> {
        if self.owner != container.owner() {
            return Err(ObjectError::Invalid(format!(
                "storage owner {} does not match container owner {}",
                self.owner,
                container.owner()
            )));
        }
        if !container
            .paths()
            .iter()
            .any(|path| path == &self.container_path)
        {
            return Err(ObjectError::Invalid(format!(
                "unrecognized container path for storage: {:?}",
                self.container_path
            )));
        }
        Ok(())
    }

    /* Getters */

    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn storage_type(&self) -> &str {
        &self.storage_type
    }

    pub fn container_path(&self) -> &str {
        &self.container_path
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn manifest_pattern(&self) -> Option<&ManifestPattern> {
        self.manifest_pattern.as_ref()
    }

    pub fn params(&self) -> &Mapping {
        &self.params
    }
}

/// Deterministic backend id: a UUID carved out of the hash of the
/// canonical storage params. Stable across re-parses of the same manifest.
pub fn derive_backend_id(fields: &Mapping) -> Result<String, ObjectError> {
    let mut hashable = fields.clone();
    hashable.remove("backend-id");
    let digest = Sha256::digest(canonical_bytes(&hashable).map_err(ManifestError::from)?);
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Ok(Uuid::from_bytes(bytes).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obj::Container;

    fn storage_fields(owner: &str, container_path: &str) -> Mapping {
        let mut fields = Mapping::new();
        fields.insert("object".into(), "storage".into());
        fields.insert("owner".into(), owner.into());
        fields.insert("version".into(), "1".into());
        fields.insert("type".into(), "local".into());
        fields.insert("container-path".into(), container_path.into());
        fields.insert("location".into(), "/srv/data".into());
        fields
    }

    #[test]
    fn test_backend_id_is_deterministic() {
        let a = Storage::from_fields(storage_fields("0xaaa", "/.uuid/x")).unwrap();
        let b = Storage::from_fields(storage_fields("0xaaa", "/.uuid/x")).unwrap();
        assert_eq!(a.backend_id(), b.backend_id());
        Uuid::parse_str(a.backend_id()).unwrap();

        let c = Storage::from_fields(storage_fields("0xbbb", "/.uuid/x")).unwrap();
        assert_ne!(a.backend_id(), c.backend_id());
    }

    #[test]
    fn test_explicit_backend_id_kept() {
        let mut fields = storage_fields("0xaaa", "/.uuid/x");
        fields.insert("backend-id".into(), "my-backend".into());
        let storage = Storage::from_fields(fields).unwrap();
        assert_eq!(storage.backend_id(), "my-backend");
    }

    #[test]
    fn test_validate_for_container() {
        let container = Container::new("0xaaa", vec!["/data".into()], vec![]);
        let uuid_path = container.paths()[0].clone();

        let storage = Storage::from_fields(storage_fields("0xaaa", &uuid_path)).unwrap();
        storage.validate_for(&container).unwrap();

        let wrong_owner = Storage::from_fields(storage_fields("0xbbb", &uuid_path)).unwrap();
        assert!(wrong_owner.validate_for(&container).is_err());

        let wrong_path = Storage::from_fields(storage_fields("0xaaa", "/elsewhere")).unwrap();
        assert!(wrong_path.validate_for(&container).is_err());
    }

    #[test]
    fn test_manifest_pattern_watch_patterns() {
        let glob = ManifestPattern::Glob {
            path: "/manifests/{path}.container.yaml".into(),
        };
        assert_eq!(glob.watch_patterns(), vec!["/manifests/*.container.yaml"]);

        let list = ManifestPattern::List {
            paths: vec!["a.yaml".into(), "b.yaml".into()],
        };
        assert_eq!(list.watch_patterns().len(), 2);
    }
}
