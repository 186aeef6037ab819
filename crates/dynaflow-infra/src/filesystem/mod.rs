//! Data directory layout for DynaFlow.
//!
//! The data directory holds `dynaflow.db` and the optional `dynaflow.toml`.

use std::path::{Path, PathBuf};

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `DYNAFLOW_DATA_DIR` environment variable
/// 2. `~/.dynaflow`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DYNAFLOW_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".dynaflow");
    }

    // Last resort: current directory
    PathBuf::from(".dynaflow")
}

/// Create the data directory if it does not exist yet.
pub async fn ensure_data_dir(data_dir: &Path) -> Result<(), std::io::Error> {
    tokio::fs::create_dir_all(data_dir).await
}

/// Path of the SQLite database file inside `data_dir`.
pub fn database_path(data_dir: &Path) -> PathBuf {
    data_dir.join("dynaflow.db")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_ensure_data_dir_creates_nested() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b");

        ensure_data_dir(&nested).await.unwrap();
        assert!(tokio::fs::try_exists(&nested).await.unwrap());
        // Second call is a no-op.
        ensure_data_dir(&nested).await.unwrap();
    }

    #[test]
    fn test_database_path() {
        let data_dir = PathBuf::from("/var/lib/dynaflow");
        assert_eq!(database_path(&data_dir), PathBuf::from("/var/lib/dynaflow/dynaflow.db"));
    }

    #[test]
    fn test_resolve_data_dir_from_env() {
        // SAFETY: This test is single-threaded and restores the env var immediately.
        unsafe {
            std::env::set_var("DYNAFLOW_DATA_DIR", "/tmp/test-dynaflow");
        }
        let dir = resolve_data_dir();
        assert_eq!(dir, PathBuf::from("/tmp/test-dynaflow"));
        unsafe {
            std::env::remove_var("DYNAFLOW_DATA_DIR");
        }
    }
}
