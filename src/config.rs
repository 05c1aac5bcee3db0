use std::fs;

use serde_derive::Deserialize;

use crate::error::ServerError;

/// Server configuration, loaded from a TOML file with one `[[server]]`
/// block per virtual listen address.
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(rename = "server")]
    servers: Vec<ServerConfig>,
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default = "default_max_events")]
    max_events: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub listen: String,
    pub host: String,
    pub port: u16,
    /// Directory where multipart uploads are stored.
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
        }
    }
}

fn default_max_events() -> usize {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_upload_dir() -> String {
    "uploads".to_string()
}

impl Config {
    pub fn load(path: &str) -> Result<Config, ServerError> {
        let content = fs::read_to_string(path)?;
        Config::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<Config, ServerError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.servers.is_empty() {
            return Err(ServerError::InvalidConfig(
                "at least one [[server]] block is required".into(),
            ));
        }
        if self.max_events == 0 {
            return Err(ServerError::InvalidConfig("max_events cannot be 0".into()));
        }
        for (i, server) in self.servers.iter().enumerate() {
            if server.port == 0 {
                return Err(ServerError::InvalidConfig(format!(
                    "server \"{}\" has port 0",
                    server.listen
                )));
            }
            if self.servers[..i].iter().any(|s| s.listen == server.listen) {
                return Err(ServerError::InvalidConfig(format!(
                    "duplicate listen identifier \"{}\"",
                    server.listen
                )));
            }
        }
        Ok(())
    }

    pub fn get_servers(&self) -> &[ServerConfig] {
        &self.servers
    }

    /// Resolves the server block owning a connection, by its listen
    /// identifier. Used once per accepted request.
    pub fn get_server_by_listen(&self, listen: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.listen == listen)
    }

    pub fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    pub fn max_events(&self) -> usize {
        self.max_events
    }
}
