//! Directory-per-instance registry with an `agent.cfg` config file

use crate::auth::CredentialRecord;
use crate::error::ProviderError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const CFG_FILE_NAME: &str = "agent.cfg";
const DATA_DIR_NAME: &str = "data";

/// Per-instance configuration persisted to `<root>/<name>/agent.cfg`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InstanceConfig {
    /// Credential record written by `add`, read by `authenticate`
    pub auth: Option<CredentialRecord>,
}

/// Tracks known instance identities backed by a directory per instance.
///
/// The registry is the single source of truth for which agent names exist;
/// runtime state (running, port) lives in the provider.
pub struct InstanceRegistry {
    root: PathBuf,
    known: RwLock<HashSet<String>>,
}

impl InstanceRegistry {
    /// Open a registry rooted at an existing directory, detecting instances
    /// from the subdirectories already present.
    pub fn open<P: AsRef<Path>>(root: P) -> anyhow::Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            anyhow::bail!("{} does not exist or is not a directory", root.display());
        }

        let mut known = HashSet::new();
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) if valid_name(&name) => {
                    known.insert(name);
                }
                Ok(name) => {
                    warn!(name, "Skipping directory with invalid agent name");
                }
                Err(_) => {
                    warn!(path = %entry.path().display(), "Skipping non-UTF-8 directory");
                }
            }
        }

        debug!(root = %root.display(), count = known.len(), "Instance registry opened");

        Ok(Self {
            root,
            known: RwLock::new(known),
        })
    }

    /// Create the filesystem layout for a new instance.
    ///
    /// Fails with `AlreadyExists` when the name is known and `InvalidName`
    /// when it contains characters outside lowercase alnum, `.`, `-`, `_`.
    pub fn add(&self, name: &str) -> Result<(), ProviderError> {
        if !valid_name(name) {
            return Err(ProviderError::InvalidName(name.to_string()));
        }

        {
            let known = self.known.read();
            if known.contains(name) {
                return Err(ProviderError::AlreadyExists(name.to_string()));
            }
        }

        let instance = self.instance_path(name);
        fs::create_dir_all(instance.join(DATA_DIR_NAME))?;
        self.write_config(name, &InstanceConfig::default())?;

        self.known.write().insert(name.to_string());
        Ok(())
    }

    /// Whether an instance with this name exists
    pub fn has(&self, name: &str) -> bool {
        self.known.read().contains(name)
    }

    /// All known instance names, sorted
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.known.read().iter().cloned().collect();
        names.sort();
        names
    }

    /// Read the persisted instance configuration
    pub fn config(&self, name: &str) -> Result<InstanceConfig, ProviderError> {
        if !self.has(name) {
            return Err(ProviderError::NotFound(name.to_string()));
        }
        let content = fs::read_to_string(self.config_file(name))?;
        toml::from_str(&content).map_err(|e| {
            ProviderError::Storage(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("corrupt agent.cfg for {}: {}", name, e),
            ))
        })
    }

    /// Persist the instance configuration
    pub fn update_config(&self, name: &str, config: &InstanceConfig) -> Result<(), ProviderError> {
        if !self.has(name) {
            return Err(ProviderError::NotFound(name.to_string()));
        }
        self.write_config(name, config)
    }

    fn write_config(&self, name: &str, config: &InstanceConfig) -> Result<(), ProviderError> {
        let content = toml::to_string(config).map_err(|e| {
            ProviderError::Storage(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("cannot serialize agent.cfg for {}: {}", name, e),
            ))
        })?;
        fs::write(self.config_file(name), content)?;
        Ok(())
    }

    /// Delete an instance's entire directory and forget its name
    pub fn remove(&self, name: &str) -> Result<(), ProviderError> {
        if !self.has(name) {
            return Err(ProviderError::NotFound(name.to_string()));
        }
        fs::remove_dir_all(self.instance_path(name))?;
        self.known.write().remove(name);
        Ok(())
    }

    /// Delete the instance's data subdirectory, keeping its credentials
    pub fn reset_data(&self, name: &str) -> Result<(), ProviderError> {
        if !self.has(name) {
            return Err(ProviderError::NotFound(name.to_string()));
        }
        let data = self.data_path(name);
        if !data.exists() {
            return Err(ProviderError::Storage(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("data directory missing for {}", name),
            )));
        }
        fs::remove_dir_all(&data)?;
        fs::create_dir(&data)?;
        Ok(())
    }

    /// Root directory of one instance
    pub fn instance_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// The `data/` subdirectory handed to the backend as the agent's home
    pub fn data_path(&self, name: &str) -> PathBuf {
        self.instance_path(name).join(DATA_DIR_NAME)
    }

    fn config_file(&self, name: &str) -> PathBuf {
        self.instance_path(name).join(CFG_FILE_NAME)
    }
}

/// Validate an agent name: lowercase alnum, `.`, `-` and `_` only
pub fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.chars().all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-' || c == '_'
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry() -> (TempDir, InstanceRegistry) {
        let dir = TempDir::new().unwrap();
        let registry = InstanceRegistry::open(dir.path()).unwrap();
        (dir, registry)
    }

    #[test]
    fn test_valid_names() {
        assert!(valid_name("alice"));
        assert!(valid_name("alice.b-c_d0"));
        assert!(!valid_name(""));
        assert!(!valid_name("Alice"));
        assert!(!valid_name("alice bob"));
        assert!(!valid_name("alice/../etc"));
    }

    #[test]
    fn test_open_requires_directory() {
        assert!(InstanceRegistry::open("/nonexistent/path/for/test").is_err());
    }

    #[test]
    fn test_add_creates_layout() {
        let (dir, registry) = registry();

        registry.add("alice").unwrap();

        assert!(registry.has("alice"));
        assert!(dir.path().join("alice").join("agent.cfg").is_file());
        assert!(dir.path().join("alice").join("data").is_dir());
    }

    #[test]
    fn test_add_twice_fails() {
        let (_dir, registry) = registry();

        registry.add("alice").unwrap();
        let err = registry.add("alice").unwrap_err();
        assert!(matches!(err, ProviderError::AlreadyExists(_)));
    }

    #[test]
    fn test_add_invalid_name_fails() {
        let (_dir, registry) = registry();

        let err = registry.add("Not Valid").unwrap_err();
        assert!(matches!(err, ProviderError::InvalidName(_)));
    }

    #[test]
    fn test_autodetect_existing_instances() {
        let dir = TempDir::new().unwrap();
        {
            let registry = InstanceRegistry::open(dir.path()).unwrap();
            registry.add("alice").unwrap();
            registry.add("bob").unwrap();
        }

        let registry = InstanceRegistry::open(dir.path()).unwrap();
        assert_eq!(registry.list(), vec!["alice".to_string(), "bob".to_string()]);
    }

    #[test]
    fn test_config_round_trip() {
        let (_dir, registry) = registry();
        registry.add("alice").unwrap();

        let mut config = registry.config("alice").unwrap();
        assert!(config.auth.is_none());

        config.auth = Some(CredentialRecord {
            salt: "00ff".to_string(),
            hashed_secret: "abcd".to_string(),
        });
        registry.update_config("alice", &config).unwrap();

        let reread = registry.config("alice").unwrap();
        assert_eq!(reread, config);
    }

    #[test]
    fn test_config_unknown_name() {
        let (_dir, registry) = registry();
        assert!(matches!(
            registry.config("ghost").unwrap_err(),
            ProviderError::NotFound(_)
        ));
    }

    #[test]
    fn test_remove_deletes_directory() {
        let (dir, registry) = registry();
        registry.add("alice").unwrap();

        registry.remove("alice").unwrap();

        assert!(!registry.has("alice"));
        assert!(!dir.path().join("alice").exists());
    }

    #[test]
    fn test_reset_data_keeps_credentials() {
        let (dir, registry) = registry();
        registry.add("alice").unwrap();
        std::fs::write(registry.data_path("alice").join("mailbox"), b"mail").unwrap();

        registry.reset_data("alice").unwrap();

        assert!(registry.data_path("alice").is_dir());
        assert!(!registry.data_path("alice").join("mailbox").exists());
        assert!(dir.path().join("alice").join("agent.cfg").is_file());
    }

    #[test]
    fn test_reset_data_unknown_name() {
        let (_dir, registry) = registry();
        assert!(matches!(
            registry.reset_data("ghost").unwrap_err(),
            ProviderError::NotFound(_)
        ));
    }
}
