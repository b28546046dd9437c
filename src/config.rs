use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "iperf-watch.toml";

/// Top-level configuration loaded from iperf-watch.toml.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct WatchConfig {
    pub iperf: IperfConfig,
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IperfConfig {
    /// Path to the iperf3 executable.
    pub binary: PathBuf,
    pub host: String,
    pub port: u16,
    pub interval_secs: u32,
    pub duration_secs: u32,
    /// Appended verbatim after the generated client arguments.
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Name of the array field holding per-interval records.
    pub progress_field: String,
    /// Bounded wait after end-of-stream or a termination signal.
    pub grace_ms: u64,
    /// How many trailing stderr lines a session result keeps.
    pub stderr_tail_lines: usize,
}

// --- Default implementations ---

impl Default for IperfConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("iperf3"),
            host: "127.0.0.1".to_string(),
            port: 5201,
            interval_secs: 1,
            duration_secs: 10,
            extra_args: Vec::new(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            progress_field: "intervals".to_string(),
            grace_ms: 500,
            stderr_tail_lines: 20,
        }
    }
}

impl MonitorConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

/// Load configuration from `path`.
///
/// When `explicit` is false a missing file falls back to defaults, so the
/// tool runs without any config in place. An explicitly requested file must
/// exist.
pub fn load_config(path: &Path, explicit: bool) -> Result<WatchConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(WatchConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    let config: WatchConfig = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    config.validate()?;
    Ok(config)
}

impl WatchConfig {
    /// Check the values a run cannot start without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.iperf.binary.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("iperf.binary must not be empty".into()));
        }
        if self.iperf.port == 0 {
            return Err(ConfigError::Invalid("iperf.port must be non-zero".into()));
        }
        if self.iperf.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "iperf.interval_secs must be greater than 0".into(),
            ));
        }
        if self.iperf.duration_secs == 0 {
            return Err(ConfigError::Invalid(
                "iperf.duration_secs must be greater than 0".into(),
            ));
        }
        if self.monitor.progress_field.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "monitor.progress_field must not be empty".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_iperf3_conventions() {
        let config = WatchConfig::default();
        assert_eq!(config.iperf.binary, PathBuf::from("iperf3"));
        assert_eq!(config.iperf.port, 5201);
        assert_eq!(config.iperf.interval_secs, 1);
        assert_eq!(config.monitor.progress_field, "intervals");
        assert_eq!(config.monitor.grace(), Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_default_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join(DEFAULT_CONFIG_FILE), false).unwrap();
        assert_eq!(config.iperf.port, 5201);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(&dir.path().join("nope.toml"), true).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("nope.toml"));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(
            &path,
            "[iperf]\nhost = \"10.0.0.2\"\nport = 5300\n\n[monitor]\ngrace_ms = 50\n",
        )
        .unwrap();

        let config = load_config(&path, true).unwrap();
        assert_eq!(config.iperf.host, "10.0.0.2");
        assert_eq!(config.iperf.port, 5300);
        assert_eq!(config.iperf.duration_secs, 10);
        assert_eq!(config.monitor.grace_ms, 50);
        assert_eq!(config.monitor.stderr_tail_lines, 20);
    }

    #[test]
    fn test_malformed_toml_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, "[iperf\nport = ").unwrap();
        let err = load_config(&path, false).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, "[iperf]\ninterval_secs = 0\n").unwrap();
        let err = load_config(&path, true).unwrap_err();
        assert!(err.to_string().contains("interval_secs"));
    }

    #[test]
    fn test_example_config_parses_to_defaults() {
        let config: WatchConfig =
            toml::from_str(include_str!("../iperf-watch.example.toml")).unwrap();
        let defaults = WatchConfig::default();
        assert_eq!(config.iperf.port, defaults.iperf.port);
        assert_eq!(config.iperf.binary, defaults.iperf.binary);
        assert_eq!(config.monitor.progress_field, defaults.monitor.progress_field);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_progress_field_rejected() {
        let mut config = WatchConfig::default();
        config.monitor.progress_field = "  ".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
