//! Runtime configuration.
//!
//! Loaded once at startup from `fluxion.json`, checked as a whole, and then
//! passed by value into the runtime. Syntactic problems surface as parse
//! errors; semantic problems are collected so the operator sees all of them
//! in one run.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use fluxion_pool::{validate_strategy, ExecutorOptions, WorkerStrategy};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FluxionConfig {
    /// The dynamic directory all routes come from.
    pub dir: PathBuf,
    pub host: String,
    pub port: u16,
    /// Request body cap enforced at the HTTP boundary (413 beyond it).
    pub max_request_bytes: i64,
    /// Database names workers may provide to handlers.
    pub databases: Vec<String>,
    pub worker_strategy: WorkerStrategy,
    pub worker_options: ExecutorOptions,
}

impl Default for FluxionConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./app"),
            host: "127.0.0.1".to_string(),
            port: 8533,
            max_request_bytes: 1024 * 1024,
            databases: Vec::new(),
            worker_strategy: WorkerStrategy::default(),
            worker_options: ExecutorOptions::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Load and validate a configuration file.
pub fn load_config(path: &Path) -> Result<FluxionConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config: FluxionConfig =
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    validate_config(&config).map_err(ConfigError::Invalid)?;
    Ok(config)
}

/// Semantic checks over an already-deserialized configuration. Returns every
/// problem found.
pub fn validate_config(config: &FluxionConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.max_request_bytes <= 0 {
        errors.push(format!(
            "maxRequestBytes must be positive, got {}",
            config.max_request_bytes
        ));
    }

    if !config.dir.is_dir() {
        errors.push(format!(
            "dir does not exist or is not a directory: {}",
            config.dir.display()
        ));
    }

    let mut seen = std::collections::HashSet::new();
    for name in &config.databases {
        if name.is_empty() {
            errors.push("database names must not be empty".to_string());
        } else if !seen.insert(name.as_str()) {
            errors.push(format!("duplicate database name \"{}\"", name));
        }
    }

    for err in validate_strategy(&config.worker_strategy, &config.databases) {
        errors.push(err.to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluxion_pool::WorkerSpec;

    fn valid_config() -> (tempfile::TempDir, FluxionConfig) {
        let dir = tempfile::tempdir().unwrap();
        let config = FluxionConfig {
            dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        (dir, config)
    }

    #[test]
    fn default_config_with_real_dir_is_valid() {
        let (_dir, config) = valid_config();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn zero_or_negative_body_cap_fails() {
        let (_dir, mut config) = valid_config();
        config.max_request_bytes = 0;
        assert!(validate_config(&config).is_err());
        config.max_request_bytes = -5;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn missing_dir_fails() {
        let (dir, mut config) = valid_config();
        config.dir = dir.path().join("missing");
        let errors = validate_config(&config).unwrap_err();
        assert!(errors[0].contains("not a directory"));
    }

    #[test]
    fn strategy_problems_are_collected_alongside_other_errors() {
        let (_dir, mut config) = valid_config();
        config.max_request_bytes = 0;
        config.databases = vec!["db1".to_string()];
        config.worker_strategy = WorkerStrategy::Custom(vec![WorkerSpec {
            id: String::new(),
            db: vec!["nope".to_string()],
            overrides: Default::default(),
        }]);
        let errors = validate_config(&config).unwrap_err();
        assert!(errors.len() >= 3);
    }

    #[test]
    fn config_file_round_trips() {
        let (dir, _) = valid_config();
        let path = dir.path().join("fluxion.json");
        std::fs::write(
            &path,
            format!(
                r#"{{
                    "dir": {:?},
                    "port": 9000,
                    "databases": ["db1", "db2"],
                    "workerStrategy": [{{"id": "w1", "db": ["db1"], "maxInflight": 4}}]
                }}"#,
                dir.path()
            ),
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.databases, vec!["db1", "db2"]);
        assert!(matches!(config.worker_strategy, WorkerStrategy::Custom(_)));
    }

    #[test]
    fn parse_failures_name_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fluxion.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("fluxion.json"));
    }
}
