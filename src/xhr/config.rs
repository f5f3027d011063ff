use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 50;

#[derive(Debug, Error)]
pub enum XhrConfigError {
    #[error("failed to read xhr config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct XhrConfig {
    /// Minimum spacing between two upload `progress` notifications.
    pub progress_interval_ms: u64,
}

impl Default for XhrConfig {
    fn default() -> Self {
        Self {
            progress_interval_ms: DEFAULT_PROGRESS_INTERVAL_MS,
        }
    }
}

impl XhrConfig {
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, XhrConfigError> {
        match config_path {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path)?;
                Ok(serde_yaml::from_str(&contents)?)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn loads_default() {
        let config = XhrConfig::load(None).unwrap();
        assert_eq!(config.progress_interval(), Duration::from_millis(50));
    }

    #[test]
    fn missing_file_falls_back_to_default() {
        let config = XhrConfig::load(Some(PathBuf::from("/nonexistent/xhr.yaml"))).unwrap();
        assert_eq!(config.progress_interval_ms, 50);
    }

    #[test]
    fn loads_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "progress_interval_ms: 0").unwrap();
        let config = XhrConfig::load(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.progress_interval(), Duration::ZERO);
    }

    #[test]
    fn rejects_malformed_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "progress_interval_ms: [fast").unwrap();
        let err = XhrConfig::load(Some(file.path().to_path_buf())).unwrap_err();
        assert!(matches!(err, XhrConfigError::Yaml(_)));
    }
}
