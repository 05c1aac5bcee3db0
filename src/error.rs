use std::fmt;
use std::io;

/// Errors that can abort server startup or configuration loading.
#[derive(Debug)]
pub enum ServerError {
    /// A wrapped std::io::Error from socket or file operations.
    Io(io::Error),
    /// The configuration file could not be deserialized.
    Config(toml::de::Error),
    /// The configuration deserialized but failed validation.
    InvalidConfig(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServerError::Io(e) => fmt::Display::fmt(e, f),
            ServerError::Config(e) => write!(f, "config parse: {}", e),
            ServerError::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        ServerError::Io(e)
    }
}

impl From<toml::de::Error> for ServerError {
    fn from(e: toml::de::Error) -> Self {
        ServerError::Config(e)
    }
}
