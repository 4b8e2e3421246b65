//! Configuration file management for dispatchd.
//!
//! Provides a TOML-based config file at `~/.config/dispatchd/config.toml`
//! and a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use dispatchd_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SupervisorSection {
    #[serde(default = "default_agent_binary")]
    pub agent_binary: String,
    #[serde(default)]
    pub isolation_mode: Option<String>,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            agent_binary: default_agent_binary(),
            isolation_mode: None,
        }
    }
}

fn default_agent_binary() -> String {
    "claude".to_string()
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the dispatchd config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/dispatchd` or
/// `~/.config/dispatchd`. We intentionally ignore the platform-specific
/// `dirs::config_dir()` (which returns `~/Library/Application Support`
/// on macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("dispatchd");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("dispatchd")
}

/// Return the path to the dispatchd config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct DispatchdConfig {
    pub db_config: DbConfig,
    pub agent_binary: String,
    pub isolation_mode: Option<String>,
}

impl DispatchdConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > built-in default.
    ///
    /// - DB path: `cli_db_path` > `DISPATCHD_DATABASE_PATH` env >
    ///   `config_file.database.path` > `DbConfig::default_path()`
    /// - Agent binary / isolation mode: config file's `supervisor` section,
    ///   falling back to built-in defaults; no env var override, since these
    ///   are rarely-changed operator settings rather than per-invocation ones.
    pub fn resolve(cli_db_path: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        let database_path = if let Some(path) = cli_db_path {
            PathBuf::from(path)
        } else if let Ok(path) = std::env::var("DISPATCHD_DATABASE_PATH") {
            PathBuf::from(path)
        } else if let Some(ref cfg) = file_config {
            PathBuf::from(&cfg.database.path)
        } else {
            DbConfig::default_path()
        };
        let db_config = DbConfig::new(database_path);

        let supervisor = file_config.map(|c| c.supervisor).unwrap_or_default();

        Ok(Self {
            db_config,
            agent_binary: supervisor.agent_binary,
            isolation_mode: supervisor.isolation_mode,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        crate::test_util::lock_env()
    }

    #[test]
    fn save_and_load_config_roundtrip() {
        let _lock = lock_env();
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("dispatchd");
        let path = dir.join("config.toml");

        let original = ConfigFile {
            database: DatabaseSection {
                path: "/tmp/example/dispatchd.db".to_string(),
            },
            supervisor: SupervisorSection::default(),
        };

        std::fs::create_dir_all(&dir).unwrap();
        let contents = toml::to_string_pretty(&original).unwrap();
        std::fs::write(&path, &contents).unwrap();

        let loaded_contents = std::fs::read_to_string(&path).unwrap();
        let loaded: ConfigFile = toml::from_str(&loaded_contents).unwrap();

        assert_eq!(loaded.database.path, original.database.path);
        assert_eq!(loaded.supervisor.agent_binary, "claude");
    }

    #[cfg(unix)]
    #[test]
    fn save_config_sets_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let _lock = lock_env();

        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("test.toml");
        std::fs::write(&file, "test").unwrap();

        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&file, perms).unwrap();

        let meta = std::fs::metadata(&file).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn resolve_with_cli_flag_overrides_all() {
        let _lock = lock_env();

        unsafe { std::env::set_var("DISPATCHD_DATABASE_PATH", "/tmp/env/dispatchd.db") };

        let config = DispatchdConfig::resolve(Some("/tmp/cli/dispatchd.db")).unwrap();
        assert_eq!(config.db_config.database_path, PathBuf::from("/tmp/cli/dispatchd.db"));

        unsafe { std::env::remove_var("DISPATCHD_DATABASE_PATH") };
    }

    #[test]
    fn resolve_with_env_var_overrides_config_file() {
        let _lock = lock_env();

        unsafe { std::env::set_var("DISPATCHD_DATABASE_PATH", "/tmp/env/dispatchd.db") };

        let config = DispatchdConfig::resolve(None).unwrap();
        assert_eq!(config.db_config.database_path, PathBuf::from("/tmp/env/dispatchd.db"));

        unsafe { std::env::remove_var("DISPATCHD_DATABASE_PATH") };
    }

    #[test]
    fn resolve_defaults_db_path_when_nothing_set() {
        let _lock = lock_env();

        unsafe { std::env::remove_var("DISPATCHD_DATABASE_PATH") };

        let config = DispatchdConfig::resolve(None).unwrap();
        assert_eq!(config.db_config.database_path, DbConfig::default_path());
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("dispatchd/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}
