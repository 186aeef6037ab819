//! Engine configuration loader.
//!
//! Reads `dynaflow.toml` from the data directory and deserializes it into
//! [`EngineConfig`]. Falls back to defaults when the file is missing or
//! malformed.

use std::path::Path;

use dynaflow_types::config::EngineConfig;

/// Name of the configuration file inside the data directory.
pub const CONFIG_FILE_NAME: &str = "dynaflow.toml";

/// Load engine configuration from `{data_dir}/dynaflow.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - Values that would stall the processor are clamped (see [`sanitize`]).
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join(CONFIG_FILE_NAME);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No {CONFIG_FILE_NAME} found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => sanitize(config),
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// Clamp zero values that would make the processor spin or never run a task.
pub fn sanitize(mut config: EngineConfig) -> EngineConfig {
    if config.max_concurrent_tasks == 0 {
        tracing::warn!("max_concurrent_tasks = 0 would never run a task, using 1");
        config.max_concurrent_tasks = 1;
    }
    if config.batch_size == 0 {
        config.batch_size = 1;
    }
    config.poll_interval_ms = config.poll_interval_ms.max(10);
    config.cancel_watch_interval_ms = config.cancel_watch_interval_ms.max(10);
    config.schedule_interval_secs = config.schedule_interval_secs.max(1);
    config.conflict_retry_limit = config.conflict_retry_limit.max(1);
    config.store_retry_limit = config.store_retry_limit.max(1);
    config.retry_max_delay_secs = config.retry_max_delay_secs.max(config.retry_base_delay_secs);
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use dynaflow_types::ids::OwnerId;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[tokio::test]
    async fn load_engine_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join(CONFIG_FILE_NAME),
            r#"
processor_identifier = "worker-a"
owner_id = 3
max_concurrent_tasks = 8
retry_base_delay_secs = 10
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.processor_identifier.as_deref(), Some("worker-a"));
        assert_eq!(config.owner_id, Some(OwnerId(3)));
        assert_eq!(config.max_concurrent_tasks, 8);
        assert_eq!(config.retry_base_delay_secs, 10);
        assert_eq!(config.poll_interval_ms, 1_000);
    }

    #[tokio::test]
    async fn load_engine_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join(CONFIG_FILE_NAME), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn sanitize_clamps_zero_values() {
        let config = sanitize(EngineConfig {
            max_concurrent_tasks: 0,
            batch_size: 0,
            poll_interval_ms: 0,
            retry_base_delay_secs: 60,
            retry_max_delay_secs: 5,
            ..EngineConfig::default()
        });
        assert_eq!(config.max_concurrent_tasks, 1);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.poll_interval_ms, 10);
        assert_eq!(config.retry_max_delay_secs, 60);
    }
}
