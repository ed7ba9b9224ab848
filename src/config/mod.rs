/// Configuration management for portera
///
/// Two sections: `[main]` names the listen addresses and the backend set,
/// `[health]` carries the credentials the monitor probes with. `backends`
/// is a comma-separated list of host:port pairs in one string.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Main portera configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub main: MainConfig,
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MainConfig {
    /// Address to listen on for primary (read-write) clients
    pub primary: String,
    /// Address to listen on for follower (read-only) clients
    pub follower: String,
    /// Comma-separated list of host:port backends
    pub backends: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Username for the monitor's probe session
    pub username: String,
    /// Password for the probe session; may be empty
    #[serde(default)]
    pub password: String,
    /// Database the probe session connects to
    pub database: String,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        split_host_port(&self.main.primary)
            .map_err(|e| ConfigError::ValidationError(format!("main.primary: {e}")))?;

        split_host_port(&self.main.follower)
            .map_err(|e| ConfigError::ValidationError(format!("main.follower: {e}")))?;

        let backends = self.backend_addrs();
        if backends.is_empty() {
            return Err(ConfigError::ValidationError(
                "main.backends contains no backend definitions".to_string(),
            ));
        }
        for backend in &backends {
            split_host_port(backend).map_err(|e| {
                ConfigError::ValidationError(format!("invalid backend '{backend}': {e}"))
            })?;
        }

        if self.health.username.is_empty() {
            return Err(ConfigError::ValidationError(
                "no health-check username defined".to_string(),
            ));
        }

        if self.health.database.is_empty() {
            return Err(ConfigError::ValidationError(
                "no health-check database defined".to_string(),
            ));
        }

        Ok(())
    }

    /// The configured backends, trimmed, in declaration order.
    pub fn backend_addrs(&self) -> Vec<String> {
        self.main
            .backends
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Split a `host:port` pair, accepting hostnames as well as IPs.
pub fn split_host_port(addr: &str) -> Result<(&str, u16), ConfigError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::ValidationError(format!("'{addr}' is not host:port")))?;

    if host.is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "'{addr}' has an empty host"
        )));
    }

    let port = port
        .parse::<u16>()
        .map_err(|_| ConfigError::ValidationError(format!("'{addr}' has an invalid port")))?;

    Ok((host, port))
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const EXAMPLE: &str = r#"
[main]
primary = "127.0.0.1:5433"
follower = "127.0.0.1:5434"
backends = "10.0.1.10:5432, 10.0.1.11:5432,10.0.1.12:5432"

[health]
username = "monitor"
password = "hunter2"
database = "postgres"
"#;

    fn example() -> Config {
        toml::from_str(EXAMPLE).unwrap()
    }

    #[test]
    fn example_config_is_valid() {
        let config = example();
        assert!(config.validate().is_ok());
        assert_eq!(config.main.primary, "127.0.0.1:5433");
        assert_eq!(
            config.backend_addrs(),
            vec!["10.0.1.10:5432", "10.0.1.11:5432", "10.0.1.12:5432"]
        );
    }

    #[test]
    fn password_may_be_omitted() {
        let trimmed = EXAMPLE.replace("password = \"hunter2\"\n", "");
        let config: Config = toml::from_str(&trimmed).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.health.password, "");
    }

    #[test]
    fn missing_username_is_rejected() {
        let mut config = example();
        config.health.username.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("username"));
    }

    #[test]
    fn missing_database_is_rejected() {
        let mut config = example();
        config.health.database.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("database"));
    }

    #[test]
    fn empty_backend_list_is_rejected() {
        let mut config = example();
        config.main.backends = " , ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_backend_is_named_in_the_error() {
        let mut config = example();
        config.main.backends = "10.0.1.10:5432,nonsense".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("nonsense"));
    }

    #[test]
    fn host_port_accepts_hostnames() {
        assert_eq!(
            split_host_port("db-1.internal:5432").unwrap(),
            ("db-1.internal", 5432)
        );
        assert!(split_host_port("no-port").is_err());
        assert!(split_host_port(":5432").is_err());
        assert!(split_host_port("host:notaport").is_err());
    }

    #[test]
    fn load_from_file_roundtrip() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(EXAMPLE.as_bytes()).unwrap();

        let config = Config::load_from_file(file.path()).unwrap();
        assert_eq!(config.health.username, "monitor");

        assert!(matches!(
            Config::load_from_file("/nonexistent/portera.ini"),
            Err(ConfigError::IoError(_))
        ));
    }
}
