//! Link objects: late-bound references used wherever a URL is accepted.

use serde_yaml::{Mapping, Value};

use super::ObjectError;

/// `{object: link, file: <path>, storage: <inline storage fields>}`,
/// resolved by instantiating the storage and reading the file.
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    file: String,
    storage: Mapping,
}

impl Link {
    pub fn new(file: String, storage: Mapping) -> Self {
        Self { file, storage }
    }

    pub fn from_fields(fields: &Mapping) -> Result<Self, ObjectError> {
        if fields.get("object").and_then(Value::as_str) != Some("link") {
            return Err(ObjectError::Invalid("not a link object".into()));
        }
        let file = fields
            .get("file")
            .and_then(Value::as_str)
            .ok_or_else(|| ObjectError::Invalid("link needs a file field".into()))?;
        if !file.starts_with('/') {
            return Err(ObjectError::Invalid("link file must be absolute".into()));
        }
        let storage = fields
            .get("storage")
            .and_then(Value::as_mapping)
            .ok_or_else(|| ObjectError::Invalid("link needs inline storage fields".into()))?;
        Ok(Self {
            file: file.to_string(),
            storage: storage.clone(),
        })
    }

    pub fn to_fields(&self) -> Mapping {
        let mut fields = Mapping::new();
        fields.insert("object".into(), "link".into());
        fields.insert("file".into(), self.file.as_str().into());
        fields.insert("storage".into(), Value::Mapping(self.storage.clone()));
        fields
    }

    /* Getters */

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn storage_fields(&self) -> &Mapping {
        &self.storage
    }
}
