// src/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;

/// Errors surfaced by the connector layer.
///
/// Consumer callbacks never raise across the worker boundary; their failures
/// are routed to the worker's error handler instead. Everything here is a
/// control-path error returned to the caller.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to communicate with the broker: {0}")]
    Connection(#[from] LapinError),

    #[error("Invalid message payload: {0}")]
    Validation(String),

    #[error("Consumer failure: {0}")]
    ConsumerRuntime(String),

    #[error("Failed to stop {} consumer(s): {}", .failures.len(), format_failures(.failures))]
    Shutdown { failures: Vec<(String, ConnectorError)> },

    #[error("Message serialization error: {0}")]
    Serialization(#[from] SerdeError),
}

/// Custom Result type for connector operations.
pub type Result<T> = std::result::Result<T, ConnectorError>;

fn format_failures(failures: &[(String, ConnectorError)]) -> String {
    failures
        .iter()
        .map(|(name, err)| format!("{name}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_error_names_every_failed_consumer() {
        let err = ConnectorError::Shutdown {
            failures: vec![
                ("events".to_string(), ConnectorError::ConsumerRuntime("cancel refused".to_string())),
                ("audit".to_string(), ConnectorError::Validation("bad state".to_string())),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("2 consumer(s)"));
        assert!(text.contains("events"));
        assert!(text.contains("audit"));
    }

    #[test]
    fn serde_errors_convert_into_serialization() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: ConnectorError = parse.into();
        assert!(matches!(err, ConnectorError::Serialization(_)));
    }
}
