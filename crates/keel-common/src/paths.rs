//! Standard filesystem paths for Keel.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default root directory for Keel data.
pub static KEEL_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("KEEL_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/keel"))
});

/// Default runtime directory for Keel.
pub static KEEL_RUNTIME_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("KEEL_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/run/keel"))
});

/// Standard paths used by the Keel network plane.
#[derive(Debug, Clone)]
pub struct KeelPaths {
    /// Root data directory (default: /var/lib/keel).
    pub root: PathBuf,
    /// Runtime directory (default: /run/keel).
    pub runtime: PathBuf,
}

impl KeelPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let runtime = root.join("run");
        Self { root, runtime }
    }

    /// Backing file for the driver key/value store.
    #[must_use]
    pub fn store_file(&self) -> PathBuf {
        self.root.join("network.db")
    }

    /// Directory holding network namespace bind mounts.
    #[must_use]
    pub fn netns_dir(&self) -> PathBuf {
        self.runtime.join("netns")
    }

    /// Bind-mount path for a sandbox key.
    #[must_use]
    pub fn netns(&self, key: &str) -> PathBuf {
        self.netns_dir().join(key)
    }

    /// Directory holding per-container hosts files.
    #[must_use]
    pub fn hosts_dir(&self) -> PathBuf {
        self.root.join("hosts")
    }

    /// Hosts file for a container.
    #[must_use]
    pub fn hosts(&self, container_id: &str) -> PathBuf {
        self.hosts_dir().join(container_id)
    }

    /// Create all necessary directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(&self.runtime)?;
        std::fs::create_dir_all(self.netns_dir())?;
        std::fs::create_dir_all(self.hosts_dir())?;
        Ok(())
    }
}

impl Default for KeelPaths {
    fn default() -> Self {
        Self {
            root: KEEL_ROOT.clone(),
            runtime: KEEL_RUNTIME_DIR.clone(),
        }
    }
}
