//! Daemon configuration.

use std::path::PathBuf;

/// Runtime configuration for the mount daemon. Values come from the
/// environment with sensible XDG-based defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Client base directory (manifests, keys).
    pub base_dir: PathBuf,
    /// Control socket path.
    pub socket_path: PathBuf,
    /// Where the FUSE filesystem is mounted.
    pub mount_dir: PathBuf,
    /// Default user fingerprint reported by `status`.
    pub default_user: Option<String>,
    /// Log filter directive, e.g. `info` or `wildland_daemon=debug`.
    pub log_level: String,
    /// Optional directory for daily-rolling log files.
    pub log_dir: Option<PathBuf>,
    /// Skip mounting the kernel filesystem (control socket only).
    pub no_fuse: bool,
}

impl Config {
    pub fn from_env() -> Self {
        let base_dir = std::env::var_os("WILDLAND_BASE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                directories::BaseDirs::new()
                    .map(|dirs| dirs.config_dir().join("wildland"))
                    .unwrap_or_else(|| PathBuf::from(".wildland"))
            });
        let socket_path = std::env::var_os("WILDLAND_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                directories::BaseDirs::new()
                    .and_then(|dirs| dirs.runtime_dir().map(|dir| dir.join("wlfuse.sock")))
                    .unwrap_or_else(|| base_dir.join("wlfuse.sock"))
            });
        let mount_dir = std::env::var_os("WILDLAND_MOUNT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                directories::BaseDirs::new()
                    .map(|dirs| dirs.home_dir().join("wildland"))
                    .unwrap_or_else(|| base_dir.join("mnt"))
            });

        Self {
            socket_path,
            mount_dir,
            default_user: std::env::var("WILDLAND_DEFAULT_USER").ok(),
            log_level: std::env::var("WILDLAND_LOG").unwrap_or_else(|_| "info".to_string()),
            log_dir: std::env::var_os("WILDLAND_LOG_DIR").map(PathBuf::from),
            no_fuse: std::env::var_os("WILDLAND_NO_FUSE").is_some(),
            base_dir,
        }
    }
}
