//! Error types for the nginx-proxy-core crate

use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Backup/restore error: {0}")]
    Resource(String),

    #[error("Configuration syntax check failed: {0}")]
    Syntax(String),

    #[error("Edge server process error: {0}")]
    Process(String),

    #[error("Certificate acquisition failed: {0}")]
    Acquisition(String),

    #[error("Manual intervention required: {0}")]
    ManualIntervention(String),

    #[error("Command execution failed: {cmd} - {message}")]
    Command { cmd: String, message: String },

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Connection test failed: {host}:{port} - {reason}")]
    ConnectionTest {
        host: String,
        port: u16,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        Error::Resource(msg.into())
    }

    pub fn syntax(msg: impl Into<String>) -> Self {
        Error::Syntax(msg.into())
    }

    pub fn process(msg: impl Into<String>) -> Self {
        Error::Process(msg.into())
    }

    pub fn acquisition(msg: impl Into<String>) -> Self {
        Error::Acquisition(msg.into())
    }

    pub fn manual(msg: impl Into<String>) -> Self {
        Error::ManualIntervention(msg.into())
    }

    /// Whether this error unwinds the current transaction through rollback.
    ///
    /// Acquisition failures only demote the site to HTTP and connectivity
    /// problems are advisory. Everything else that reaches the orchestrator
    /// mid-transaction is fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Acquisition(_) | Error::ConnectionTest { .. })
    }
}

/// Non-fatal conditions collected into operation reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    /// Backend or DNS probe failed; the proxy is still provisioned
    Connectivity(String),
    /// Certificate could not be obtained; the site stays HTTP-only
    Acquisition(String),
    /// Neither redirect strategy produced a verified redirect
    RedirectNotInstalled(String),
    /// A backup could not be taken or a non-critical cleanup failed
    Resource(String),
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::Connectivity(msg) => write!(f, "connectivity: {}", msg),
            Warning::Acquisition(msg) => write!(f, "certificate: {}", msg),
            Warning::RedirectNotInstalled(msg) => write!(f, "redirect: {}", msg),
            Warning::Resource(msg) => write!(f, "backup: {}", msg),
        }
    }
}

impl From<&Error> for Warning {
    fn from(err: &Error) -> Self {
        match err {
            Error::Acquisition(msg) => Warning::Acquisition(msg.clone()),
            Error::ConnectionTest { .. } => Warning::Connectivity(err.to_string()),
            other => Warning::Resource(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::syntax("unexpected }").is_fatal());
        assert!(Error::process("reload failed").is_fatal());
        assert!(Error::validation("bad domain").is_fatal());
        assert!(!Error::acquisition("rate limited").is_fatal());
        assert!(!Error::ConnectionTest {
            host: "10.0.0.5".to_string(),
            port: 4000,
            reason: "refused".to_string(),
        }
        .is_fatal());
    }

    #[test]
    fn test_warning_from_error() {
        let warning = Warning::from(&Error::acquisition("both strategies failed"));
        assert_eq!(
            warning,
            Warning::Acquisition("both strategies failed".to_string())
        );
        assert!(warning.to_string().starts_with("certificate:"));
    }
}
