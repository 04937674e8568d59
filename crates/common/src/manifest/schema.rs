//! JSON-Schema validation for manifest bodies and control commands.
//!
//! Schemas are embedded in the binary; each object type has one, plus a
//! per-command argument schema file for the control servers.

use std::collections::HashMap;

use jsonschema::JSONSchema;
use serde_json::Value;

use super::ManifestError;

const USER_SCHEMA: &str = include_str!("schemas/user.schema.json");
const CONTAINER_SCHEMA: &str = include_str!("schemas/container.schema.json");
const STORAGE_SCHEMA: &str = include_str!("schemas/storage.schema.json");
const BRIDGE_SCHEMA: &str = include_str!("schemas/bridge.schema.json");
const LINK_SCHEMA: &str = include_str!("schemas/link.schema.json");
const FS_COMMANDS: &str = include_str!("schemas/fs-commands.json");
const SYNC_COMMANDS: &str = include_str!("schemas/sync-commands.json");

/// A compiled JSON-Schema document.
pub struct Schema {
    name: String,
    compiled: JSONSchema,
}

impl std::fmt::Debug for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schema").field("name", &self.name).finish()
    }
}

impl Schema {
    /// Compile a schema from its JSON source.
    pub fn compile(name: &str, source: &Value) -> Result<Self, ManifestError> {
        let compiled = JSONSchema::compile(source)
            .map_err(|e| ManifestError::Parse(format!("schema {}: {}", name, e)))?;
        Ok(Self {
            name: name.to_string(),
            compiled,
        })
    }

    /// Load the schema for a manifest object type.
    pub fn for_object(object_type: &str) -> Result<Self, ManifestError> {
        let source = match object_type {
            "user" => USER_SCHEMA,
            "container" => CONTAINER_SCHEMA,
            "storage" => STORAGE_SCHEMA,
            "bridge" => BRIDGE_SCHEMA,
            "link" => LINK_SCHEMA,
            other => {
                return Err(ManifestError::Parse(format!(
                    "no schema for object type {:?}",
                    other
                )))
            }
        };
        let value: Value = serde_json::from_str(source)
            .map_err(|e| ManifestError::Parse(format!("schema {}: {}", object_type, e)))?;
        Self::compile(object_type, &value)
    }

    /// Load the per-command argument schemas for a control server.
    /// The source file maps command name to an argument schema.
    pub fn load_commands(which: CommandSet) -> Result<HashMap<String, Schema>, ManifestError> {
        let source = match which {
            CommandSet::Fs => FS_COMMANDS,
            CommandSet::Sync => SYNC_COMMANDS,
        };
        let value: Value = serde_json::from_str(source)
            .map_err(|e| ManifestError::Parse(format!("command schemas: {}", e)))?;
        let map = value
            .as_object()
            .ok_or_else(|| ManifestError::Parse("command schemas must be an object".into()))?;

        let mut result = HashMap::new();
        for (command, schema) in map {
            result.insert(command.clone(), Schema::compile(command, schema)?);
        }
        Ok(result)
    }

    /// Validate an instance, reporting the first violation with its
    /// dotted path into the document.
    pub fn validate(&self, instance: &Value) -> Result<(), ManifestError> {
        if let Err(mut errors) = self.compiled.validate(instance) {
            if let Some(error) = errors.next() {
                let path = error
                    .instance_path
                    .to_string()
                    .trim_start_matches('/')
                    .replace('/', ".");
                return Err(ManifestError::Schema {
                    path: if path.is_empty() { ".".into() } else { path },
                    detail: error.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Which command-schema file to load.
#[derive(Debug, Clone, Copy)]
pub enum CommandSet {
    Fs,
    Sync,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_schemas_compile() {
        for object_type in ["user", "container", "storage", "bridge", "link"] {
            Schema::for_object(object_type).unwrap();
        }
        assert!(Schema::for_object("nonsense").is_err());
    }

    #[test]
    fn test_command_schemas_compile() {
        let commands = Schema::load_commands(CommandSet::Fs).unwrap();
        assert!(commands.contains_key("mount"));
        assert!(commands.contains_key("add-watch"));
        let commands = Schema::load_commands(CommandSet::Sync).unwrap();
        assert!(commands.contains_key("start"));
    }

    #[test]
    fn test_container_schema_validates() {
        let schema = Schema::for_object("container").unwrap();
        let good = json!({
            "object": "container",
            "owner": "0xaaa",
            "version": "1",
            "paths": ["/.uuid/11111111-2222-3333-4444-555555555555", "/data"],
            "backends": {"storage": []}
        });
        schema.validate(&good).unwrap();
    }

    #[test]
    fn test_schema_error_carries_path() {
        let schema = Schema::for_object("container").unwrap();
        let bad = json!({
            "object": "container",
            "owner": "0xaaa",
            "version": "1",
            "paths": "not-a-list",
            "backends": {"storage": []}
        });
        match schema.validate(&bad) {
            Err(ManifestError::Schema { path, .. }) => assert_eq!(path, "paths"),
            other => panic!("expected schema error, got {:?}", other),
        }
    }
}
