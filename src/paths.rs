//! On-disk layout of the service's data root and config file.

use std::path::{Path, PathBuf};

use crate::error::Result;

const DATA_DIR_NAME: &str = ".leindex_data";
const CONFIG_DIR_NAME: &str = ".leindex";
pub const CONFIG_FILE_NAME: &str = "mcp_config.yaml";

/// The service data root (default `~/.leindex_data/`) with its fixed
/// subdirectory layout.
#[derive(Debug, Clone)]
pub struct DataRoot {
    root: PathBuf,
}

impl DataRoot {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn default_root() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DATA_DIR_NAME)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn indexes_dir(&self) -> PathBuf {
        self.root.join("indexes")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.root.join("registry")
    }

    pub fn registry_db(&self) -> PathBuf {
        self.registry_dir().join("registry.sqlite")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.registry_dir().join("backups")
    }

    pub fn project_index_dir(&self, project_id: &str) -> PathBuf {
        self.indexes_dir().join(project_id)
    }

    /// Directory for downloaded embedding model files.
    pub fn models_dir(&self) -> PathBuf {
        self.cache_dir().join("models")
    }

    /// Create the tree, 0700 throughout.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.indexes_dir(),
            self.cache_dir(),
            self.logs_dir(),
            self.registry_dir(),
            self.backups_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
            restrict_dir(&dir)?;
        }
        Ok(())
    }
}

/// Default config file location: `~/.leindex/mcp_config.yaml`.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR_NAME)
        .join(CONFIG_FILE_NAME)
}

/// Enforce 0700 on the config parent and 0600 on the file itself. Failure
/// here is an unrecoverable init error for the caller.
pub fn enforce_config_perms(config_path: &Path) -> Result<()> {
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
        restrict_dir(parent)?;
    }
    #[cfg(unix)]
    if config_path.exists() {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(config_path, perms)?;
    }
    Ok(())
}

fn restrict_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o700);
        std::fs::set_permissions(dir, perms)?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn ensure_creates_layout_with_restrictive_perms() {
        let tmp = TempDir::new().unwrap();
        let root = DataRoot::new(tmp.path().join("data"));
        root.ensure().unwrap();

        for dir in [
            root.indexes_dir(),
            root.cache_dir(),
            root.logs_dir(),
            root.registry_dir(),
            root.backups_dir(),
        ] {
            assert!(dir.is_dir(), "{dir:?} missing");
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
                assert_eq!(mode & 0o777, 0o700, "{dir:?} has mode {mode:o}");
            }
        }
    }

    #[test]
    fn config_perms_enforced() {
        let tmp = TempDir::new().unwrap();
        let config = tmp.path().join("conf").join(CONFIG_FILE_NAME);
        std::fs::create_dir_all(config.parent().unwrap()).unwrap();
        std::fs::write(&config, "version: 2\n").unwrap();

        enforce_config_perms(&config).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&config).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn project_index_dir_nests_under_indexes() {
        let root = DataRoot::new(PathBuf::from("/data"));
        assert_eq!(
            root.project_index_dir("abc"),
            PathBuf::from("/data/indexes/abc")
        );
    }
}
