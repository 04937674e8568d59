//! Typed Wildland objects.
//!
//! Every object is a validated view over a signed [`Manifest`]: the wrapper
//! keeps the manifest (so re-emission stays byte-identical) next to the
//! parsed, type-checked fields.

mod bridge;
mod container;
mod link;
mod storage;
mod user;

pub use bridge::{Bridge, UserLocation};
pub use container::{Container, StorageRef};
pub use link::Link;
pub use storage::{derive_backend_id, ManifestPattern, Storage};
pub use user::{CatalogEntry, User};

use crate::manifest::ManifestError;

/// Kinds of Wildland objects, matching the manifest `object` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WildlandObject {
    User,
    Container,
    Storage,
    Bridge,
    Link,
}

impl WildlandObject {
    pub fn as_str(&self) -> &'static str {
        match self {
            WildlandObject::User => "user",
            WildlandObject::Container => "container",
            WildlandObject::Storage => "storage",
            WildlandObject::Bridge => "bridge",
            WildlandObject::Link => "link",
        }
    }

    /// Directory under the client's base dir where manifests of this type
    /// are saved.
    pub fn type_dir(&self) -> &'static str {
        match self {
            WildlandObject::User => "users",
            WildlandObject::Container => "containers",
            WildlandObject::Storage => "storage",
            WildlandObject::Bridge => "bridges",
            WildlandObject::Link => "links",
        }
    }

    pub fn from_str(value: &str) -> Result<Self, ManifestError> {
        match value {
            "user" => Ok(WildlandObject::User),
            "container" => Ok(WildlandObject::Container),
            "storage" => Ok(WildlandObject::Storage),
            "bridge" => Ok(WildlandObject::Bridge),
            "link" => Ok(WildlandObject::Link),
            other => Err(ManifestError::Parse(format!(
                "unknown object type: {:?}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for WildlandObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Semantic violations in otherwise well-formed manifests.
#[derive(Debug, thiserror::Error)]
pub enum ObjectError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("expected a {expected} manifest, got {actual}")]
    WrongType { expected: String, actual: String },

    #[error("{0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_type_names() {
        assert_eq!(WildlandObject::from_str("container").unwrap(), WildlandObject::Container);
        assert_eq!(WildlandObject::Container.type_dir(), "containers");
        assert!(WildlandObject::from_str("widget").is_err());
    }
}
