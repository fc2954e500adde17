// App Info
// Host application facts the updater depends on, injected so tests can stub them

use std::path::{Path, PathBuf};

use crate::auto_update::UpdateError;

/// Capabilities of the running application
pub trait AppInfo: Send + Sync {
    /// Version of the running build
    fn current_version(&self) -> String;

    /// Whether this is an installed build rather than a development run
    fn is_packaged(&self) -> bool;

    /// Path of the running executable
    fn executable_path(&self) -> Result<PathBuf, UpdateError>;

    /// Process-owned scratch directory for update files
    fn temp_dir(&self) -> PathBuf;
}

/// `AppInfo` of the current process
pub struct SystemAppInfo {
    temp_dir: PathBuf,
}

impl Default for SystemAppInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemAppInfo {
    pub fn new() -> Self {
        Self {
            temp_dir: std::env::temp_dir().join("d2rmm_updates"),
        }
    }
}

impl AppInfo for SystemAppInfo {
    fn current_version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    /// Release builds not running out of a cargo `target` directory
    fn is_packaged(&self) -> bool {
        if cfg!(debug_assertions) {
            return false;
        }
        match std::env::current_exe() {
            Ok(exe) => !exe.components().any(|c| c.as_os_str() == "target"),
            Err(_) => false,
        }
    }

    fn executable_path(&self) -> Result<PathBuf, UpdateError> {
        std::env::current_exe().map_err(|e| {
            UpdateError::FileSystem(format!("Failed to get current executable path: {}", e))
        })
    }

    fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone()
    }
}

/// Fixed `AppInfo`, for embedding hosts that know their own layout and for tests
#[derive(Debug, Clone)]
pub struct StaticAppInfo {
    version: String,
    packaged: bool,
    executable: PathBuf,
    temp_dir: PathBuf,
}

impl StaticAppInfo {
    pub fn new(version: &str, executable: impl AsRef<Path>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            version: version.to_string(),
            packaged: true,
            executable: executable.as_ref().to_path_buf(),
            temp_dir: temp_dir.into(),
        }
    }

    pub fn packaged(mut self, packaged: bool) -> Self {
        self.packaged = packaged;
        self
    }
}

impl AppInfo for StaticAppInfo {
    fn current_version(&self) -> String {
        self.version.clone()
    }

    fn is_packaged(&self) -> bool {
        self.packaged
    }

    fn executable_path(&self) -> Result<PathBuf, UpdateError> {
        Ok(self.executable.clone())
    }

    fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone()
    }
}
