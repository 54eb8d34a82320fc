use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::fs;
use std::path::PathBuf;

/// Application paths following OS conventions
#[derive(Clone, Debug)]
pub struct AppPaths {
    /// Configuration directory (config.toml)
    pub config: PathBuf,
    /// Data directory (persisted bridge credentials)
    pub data: PathBuf,
}

impl AppPaths {
    /// Resolve OS-specific paths for Handclap
    ///
    /// # Platform Paths
    ///
    /// ## Linux
    /// - Config: `~/.config/handclap/`
    /// - Data: `~/.local/share/handclap/` → bridge.toml
    ///
    /// ## macOS
    /// - Config: `~/Library/Application Support/org.Handclap.Handclap/`
    /// - Data: `~/Library/Application Support/org.Handclap.Handclap/`
    ///
    /// ## Windows
    /// - Config: `%APPDATA%\Handclap\Handclap\config\`
    /// - Data: `%APPDATA%\Handclap\Handclap\data\`
    pub fn new() -> Result<Self> {
        let proj_dirs = ProjectDirs::from("org", "Handclap", "Handclap")
            .context("Failed to determine project directories")?;

        Ok(Self {
            config: proj_dirs.config_dir().to_path_buf(),
            data: proj_dirs.data_dir().to_path_buf(),
        })
    }

    /// Paths rooted at an explicit directory (portable installs, tests)
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            config: root.join("config"),
            data: root.join("data"),
        }
    }

    /// Create all necessary directories
    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.config).context("Failed to create config directory")?;
        fs::create_dir_all(&self.data).context("Failed to create data directory")?;

        log::debug!("Application directories initialized");
        log::debug!("  Config: {}", self.config.display());
        log::debug!("  Data:   {}", self.data.display());

        Ok(())
    }

    /// Get path to config file
    pub fn config_file(&self) -> PathBuf {
        self.config.join("config.toml")
    }

    /// Get path to the persisted bridge connection
    pub fn bridge_store_file(&self) -> PathBuf {
        self.data.join("bridge.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_creation() {
        let paths = AppPaths::new().expect("Failed to create paths");

        assert!(!paths.config.as_os_str().is_empty());
        assert!(!paths.data.as_os_str().is_empty());
    }

    #[test]
    fn test_rooted_paths() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::rooted_at(dir.path());
        paths.ensure_directories().unwrap();

        assert!(paths.config.is_dir());
        assert!(paths.data.is_dir());
        assert_eq!(paths.config_file(), dir.path().join("config/config.toml"));
        assert_eq!(paths.bridge_store_file(), dir.path().join("data/bridge.toml"));
    }
}
