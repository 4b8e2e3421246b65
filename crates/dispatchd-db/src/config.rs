use std::env;
use std::path::{Path, PathBuf};

/// Database configuration.
///
/// Reads from the `DISPATCHD_DATABASE_PATH` environment variable, falling
/// back to a file under the user's XDG data directory.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Filesystem path to the SQLite database file.
    pub database_path: PathBuf,
}

impl DbConfig {
    /// Build a config from the environment.
    ///
    /// Priority: `DISPATCHD_DATABASE_PATH` env var, then the XDG data
    /// directory default (`~/.local/share/dispatchd/dispatchd.db`).
    pub fn from_env() -> Self {
        let database_path = match env::var_os("DISPATCHD_DATABASE_PATH") {
            Some(path) => PathBuf::from(path),
            None => Self::default_path(),
        };
        Self { database_path }
    }

    /// Build a config from an explicit path (useful for tests and CLI flags).
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }

    /// The default database file location.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dispatchd")
            .join("dispatchd.db")
    }

    /// Return a `sqlite://` connection URL for this config, creating the
    /// parent directory if necessary is the caller's responsibility.
    pub fn connection_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.database_path.display())
    }

    /// Directory that should hold the database file and its sidecar logs.
    pub fn data_dir(&self) -> &Path {
        self.database_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_new() {
        let cfg = DbConfig::new("/tmp/example/dispatchd.db");
        assert_eq!(cfg.database_path, PathBuf::from("/tmp/example/dispatchd.db"));
    }

    #[test]
    fn connection_url_has_rwc_mode() {
        let cfg = DbConfig::new("/tmp/example/dispatchd.db");
        assert_eq!(
            cfg.connection_url(),
            "sqlite:///tmp/example/dispatchd.db?mode=rwc"
        );
    }

    #[test]
    fn data_dir_is_parent() {
        let cfg = DbConfig::new("/tmp/example/dispatchd.db");
        assert_eq!(cfg.data_dir(), Path::new("/tmp/example"));
    }
}
