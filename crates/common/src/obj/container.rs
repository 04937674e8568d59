//! Container objects: logical directories identified by a uuid path.

use serde_yaml::{Mapping, Value};
use uuid::Uuid;

use crate::manifest::{Manifest, ManifestError, Schema};

use super::{Link, ObjectError};

/// One entry of `backends.storage`. The original shape is preserved so
/// that re-emitting the container manifest keeps its signature valid.
#[derive(Debug, Clone)]
pub enum StorageRef {
    /// A URL to a separately published storage manifest.
    Url(String),
    /// Storage fields inlined into the container manifest.
    Inline(Mapping),
    /// A link resolved by mounting the link's storage.
    Link(Link),
}

/// A Wildland container.
///
/// The first path is always `/.uuid/<uuid>`: the primary identifier,
/// immutable once assigned and used as the mount-table key.
#[derive(Debug, Clone)]
pub struct Container {
    manifest: Option<Manifest>,
    owner: String,
    paths: Vec<String>,
    title: Option<String>,
    categories: Vec<String>,
    backends: Vec<StorageRef>,
    access: Option<Vec<String>>,
}

impl Container {
    pub fn from_manifest(manifest: Manifest) -> Result<Self, ObjectError> {
        let object = manifest.object_type()?;
        if object != "container" {
            return Err(ObjectError::WrongType {
                expected: "container".into(),
                actual: object.into(),
            });
        }
        manifest.apply_schema(&Schema::for_object("container")?)?;

        let fields = manifest.fields()?.clone();
        let owner = manifest.owner()?.to_string();

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

        let title = fields
            .get("title")
            .and_then(Value::as_str)
            .map(str::to_string);
        let categories = fields
            .get("categories")
            .and_then(Value::as_sequence)
            .map(|seq| {
                seq.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut backends = Vec::new();
        if let Some(storage_list) = fields
            .get("backends")
            .and_then(Value::as_mapping)
            .and_then(|b| b.get("storage"))
            .and_then(Value::as_sequence)
        {
            for entry in storage_list {
                backends.push(StorageRef::parse(entry)?);
            }
        }

        let access = parse_access(&fields)?;

        let container = Self {
            manifest: Some(manifest),
            owner,
            paths,
            title,
            categories,
            backends,
            access,
        };
        container.validate()?;
        Ok(container)
    }

    /// Create a new, not yet signed container.
    pub fn new(owner: &str, paths: Vec<String>, backends: Vec<StorageRef>) -> Self {
        let mut container = Self {
            manifest: None,
            owner: owner.to_string(),
            paths,
            title: None,
            categories: Vec::new(),
            backends,
            access: None,
        };
        container.ensure_uuid();
        container
    }

    /// Semantic checks beyond the schema.
    pub fn validate(&self) -> Result<(), ObjectError> {
        let uuid_path = self
            .paths
            .first()
            .ok_or_else(|| ObjectError::Invalid("container needs at least one path".into()))?;
        let ident = uuid_path
            .strip_prefix("/.uuid/")
            .ok_or_else(|| ObjectError::Invalid("first path must be /.uuid/<uuid>".into()))?;
        Uuid::parse_str(ident)
            .map_err(|_| ObjectError::Invalid(format!("invalid container uuid: {:?}", ident)))?;

        // An inline storage may not widen the container's access set.
        if let Some(container_access) = &self.access {
            for backend in &self.backends {
                if let StorageRef::Inline(fields) = backend {
                    if let Some(storage_access) = parse_access(fields)? {
                        let widened = storage_access
                            .iter()
                            .any(|user| !container_access.contains(user));
                        if widened {
                            return Err(ObjectError::Invalid(
                                "inline storage access must be a subset of container access"
                                    .into(),
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Find or create the container's uuid path. The uuid is immutable
    /// once assigned.
    pub fn ensure_uuid(&mut self) -> Uuid {
        if let Some(uuid) = self.uuid() {
            return uuid;
        }
        let ident = Uuid::new_v4();
        self.paths.insert(0, format!("/.uuid/{}", ident));
        ident
    }

    pub fn uuid(&self) -> Option<Uuid> {
        self.paths
            .iter()
            .find_map(|path| path.strip_prefix("/.uuid/"))
            .and_then(|ident| Uuid::parse_str(ident).ok())
    }

    /// The primary path, used for remount detection.
    pub fn uuid_path(&self) -> Option<&str> {
        self.paths.first().map(String::as_str)
    }

    /// Declared paths plus the paths synthesised from categories:
    /// `/<category>/<title>` for each category.
    pub fn expanded_paths(&self) -> Vec<String> {
        let mut paths = self.paths.clone();
        if let Some(title) = &self.title {
            for category in &self.categories {
                paths.push(format!("{}/{}", category.trim_end_matches('/'), title));
            }
        }
        paths
    }

    /// Build the manifest fields for this container.
    pub fn to_fields(&self) -> Result<Mapping, ManifestError> {
        let mut fields = Mapping::new();
        fields.insert("object".into(), "container".into());
        fields.insert("owner".into(), self.owner.as_str().into());
        fields.insert("version".into(), "1".into());
        fields.insert(
            "paths".into(),
            Value::Sequence(self.paths.iter().map(|p| p.as_str().into()).collect()),
        );
        if let Some(title) = &self.title {
            fields.insert("title".into(), title.as_str().into());
        }
        if !self.categories.is_empty() {
            fields.insert(
                "categories".into(),
                Value::Sequence(self.categories.iter().map(|c| c.as_str().into()).collect()),
            );
        }
        let storage: Vec<Value> = self
            .backends
            .iter()
            .map(|backend| match backend {
                StorageRef::Url(url) => Value::String(url.clone()),
                StorageRef::Inline(mapping) => Value::Mapping(mapping.clone()),
                StorageRef::Link(link) => Value::Mapping(link.to_fields()),
            })
            .collect();
        let mut backends = Mapping::new();
        backends.insert("storage".into(), Value::Sequence(storage));
        fields.insert("backends".into(), Value::Mapping(backends));
        if let Some(access) = &self.access {
            fields.insert(
                "access".into(),
                Value::Sequence(
                    access
                        .iter()
                        .map(|user| {
                            let mut entry = Mapping::new();
                            entry.insert("user".into(), user.as_str().into());
                            Value::Mapping(entry)
                        })
                        .collect(),
                ),
            );
        }
        Ok(fields)
    }

    /* Getters */

    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub fn backends(&self) -> &[StorageRef] {
        &self.backends
    }

    pub fn access(&self) -> Option<&[String]> {
        self.access.as_deref()
    }

    /* Setters */

    pub fn set_title(&mut self, title: Option<String>) {
        self.title = title;
    }

    pub fn set_categories(&mut self, categories: Vec<String>) {
        self.categories = categories;
    }
}

impl std::fmt::Display for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}",
            self.owner,
            self.uuid_path().unwrap_or("<no-uuid>")
        )
    }
}

impl StorageRef {
    fn parse(entry: &Value) -> Result<Self, ObjectError> {
        match entry {
            Value::String(url) => Ok(StorageRef::Url(url.clone())),
            Value::Mapping(mapping) => {
                if mapping.get("object").and_then(Value::as_str) == Some("link") {
                    Ok(StorageRef::Link(Link::from_fields(mapping)?))
                } else {
                    Ok(StorageRef::Inline(mapping.clone()))
                }
            }
            _ => Err(ObjectError::Invalid(
                "storage entries must be URLs, links or inline manifests".into(),
            )),
        }
    }
}

fn parse_access(fields: &Mapping) -> Result<Option<Vec<String>>, ObjectError> {
    let access = match fields.get("access").and_then(Value::as_sequence) {
        Some(access) => access,
        None => return Ok(None),
    };
    let mut users = Vec::new();
    for entry in access {
        let user = entry
            .as_mapping()
            .and_then(|m| m.get("user"))
            .and_then(Value::as_str)
            .ok_or_else(|| ObjectError::Invalid("access entries must carry a user".into()))?;
        users.push(user.to_string());
    }
    Ok(Some(users))
}
