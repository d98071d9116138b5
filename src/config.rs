use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Server configuration, loaded from TOML. Every field has a default, so an
/// empty or missing file is a valid configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub sessions: SessionConfig,
    pub projects: ProjectsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Browser origins allowed for CORS and WebSocket upgrades.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let cors_origins = [5173, 3000, 3001, 3002]
            .iter()
            .flat_map(|port| {
                [
                    format!("http://localhost:{port}"),
                    format!("http://127.0.0.1:{port}"),
                ]
            })
            .collect();
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3001)),
            cors_origins,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Line ceiling of each session's output buffer.
    pub max_scrollback_lines: usize,
    /// Largest accepted input chunk, in decoded bytes.
    pub input_chunk_max: usize,
    pub input_bytes_per_sec: u64,
    /// Delay between the graceful and the forceful termination signal.
    pub stop_grace_ms: u64,
    pub max_sessions: usize,
    pub default_cols: u16,
    pub default_rows: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_scrollback_lines: crate::bus::DEFAULT_MAX_LINES,
            input_chunk_max: 32 * 1024,
            input_bytes_per_sec: crate::rate_limit::DEFAULT_BYTES_PER_WINDOW,
            stop_grace_ms: 3000,
            max_sessions: 256,
            default_cols: 80,
            default_rows: 24,
        }
    }
}

impl SessionConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectsConfig {
    /// Project directories known to the server.
    pub roots: Vec<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {1}", .0.display())]
    ReadFailed(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config {}: {1}", .0.display())]
    ParseFailed(PathBuf, #[source] toml::de::Error),
}

impl Config {
    /// Load config from a TOML file path. Returns None if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    /// Load from `path`, or the default location, falling back to defaults
    /// when no file exists. Environment overrides are applied last.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(Path::to_path_buf).or_else(default_path);
        let mut config = match path {
            Some(p) => Self::load(&p)?.unwrap_or_default(),
            None => Self::default(),
        };
        config.apply_cors_override(std::env::var("CORS_ORIGIN").ok().as_deref());
        Ok(config)
    }

    /// Replace the CORS allow-list with a comma-separated override, if it
    /// names at least one origin.
    pub fn apply_cors_override(&mut self, value: Option<&str>) {
        let Some(value) = value else {
            return;
        };
        let origins: Vec<String> = value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if !origins.is_empty() {
            self.server.cors_origins = origins;
        }
    }
}

/// `$XDG_CONFIG_HOME/multiterm/config.toml` or the platform equivalent.
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("multiterm").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.bind.to_string(), "127.0.0.1:3001");
        assert_eq!(config.server.cors_origins.len(), 8);
        assert!(config
            .server
            .cors_origins
            .contains(&"http://localhost:5173".to_string()));
        assert_eq!(config.sessions.max_scrollback_lines, 5000);
        assert_eq!(config.sessions.input_chunk_max, 32768);
        assert_eq!(config.sessions.input_bytes_per_sec, 1_000_000);
        assert_eq!(config.sessions.stop_grace(), Duration::from_secs(3));
        assert!(config.projects.roots.is_empty());
    }

    #[test]
    fn parse_partial_config() {
        let toml = r#"
            [server]
            bind = "0.0.0.0:8080"

            [sessions]
            max_scrollback_lines = 100
            stop_grace_ms = 500

            [projects]
            roots = ["/srv/app", "/srv/api"]
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind.port(), 8080);
        assert_eq!(config.server.cors_origins.len(), 8, "unset fields keep defaults");
        assert_eq!(config.sessions.max_scrollback_lines, 100);
        assert_eq!(config.sessions.input_chunk_max, 32768);
        assert_eq!(config.sessions.stop_grace(), Duration::from_millis(500));
        assert_eq!(config.projects.roots.len(), 2);
    }

    #[test]
    fn load_missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(&dir.path().join("nope.toml")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sessions]\nmax_sessions = \"lots\"\n").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed(..)));
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn load_or_default_reads_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sessions]\nmax_sessions = 3\n").unwrap();
        let config = Config::load_or_default(Some(&path)).unwrap();
        assert_eq!(config.sessions.max_sessions, 3);
    }

    #[test]
    fn cors_override_replaces_allow_list() {
        let mut config = Config::default();
        config.apply_cors_override(Some(" https://a.example , https://b.example,"));
        assert_eq!(
            config.server.cors_origins,
            vec!["https://a.example", "https://b.example"]
        );
    }

    #[test]
    fn blank_cors_override_is_ignored() {
        let mut config = Config::default();
        config.apply_cors_override(Some(" , "));
        assert_eq!(config.server.cors_origins.len(), 8);
        config.apply_cors_override(None);
        assert_eq!(config.server.cors_origins.len(), 8);
    }
}
