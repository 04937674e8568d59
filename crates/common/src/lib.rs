/**
 * Cryptographic identity and signatures.
 *  - Sodium (ed25519 + sealed-box) and dummy signature contexts
 *  - Key ownership graph for secondary-key signing
 */
pub mod crypto;
/**
 * Signed manifest envelope.
 *  Header parsing/emission, canonical YAML bodies,
 *  per-recipient encryption and JSON-Schema validation.
 */
pub mod manifest;
/**
 * Typed Wildland objects parsed out of manifests:
 *  users, containers, storages, bridges and links.
 */
pub mod obj;
/**
 * Object loader: resolves names, local paths, file:// URLs
 *  and Wildland paths into validated objects.
 */
pub mod client;
/**
 * Storage backend interface.
 *  The VFS-shaped trait all backends implement, plus the
 *  local-directory and static in-memory backends.
 */
pub mod storage;
/**
 * Line-delimited JSON control protocol over unix sockets,
 *  shared by the mount daemon and the sync daemon.
 */
pub mod control;

pub mod prelude {
    pub use crate::client::Client;
    pub use crate::crypto::{DummySigContext, SigContext, SigError, SodiumSigContext};
    pub use crate::manifest::{Manifest, ManifestError};
    pub use crate::obj::{Bridge, Container, Link, Storage, User, WildlandObject};
    pub use crate::storage::{Attr, FsError, StorageBackend};
}
