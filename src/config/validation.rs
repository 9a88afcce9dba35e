//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (ports, thresholds, sizes)
//! - Check cross-field consistency (busy threshold vs. connection limit)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServiceConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::ServiceConfig;

/// Smallest backlog the server will ask the OS for.
pub const MIN_BACKLOG: u32 = 4;

/// Smallest receive buffer accepted for the listening socket.
pub const MIN_RECEIVE_BUFFER_SIZE: u32 = 512;

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Check every semantic rule and collect all violations.
pub fn validate_config(config: &ServiceConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let server = &config.server;

    if server.port < 1024 {
        errors.push(ValidationError::new("server.port", "must be greater than 1023"));
    }
    if server.backlog < MIN_BACKLOG {
        errors.push(ValidationError::new(
            "server.backlog",
            format!("must be at least {MIN_BACKLOG}"),
        ));
    }
    if server.receive_buffer_size < MIN_RECEIVE_BUFFER_SIZE {
        errors.push(ValidationError::new(
            "server.receive_buffer_size",
            format!("must be at least {MIN_RECEIVE_BUFFER_SIZE} bytes"),
        ));
    }
    if server.io_threads == 0 {
        errors.push(ValidationError::new("server.io_threads", "must be at least 1"));
    }
    if server.max_connections < server.busy_threshold {
        errors.push(ValidationError::new(
            "server.max_connections",
            "cannot be less than server.busy_threshold",
        ));
    }

    if config.client_io.read_chunk_size == 0 {
        errors.push(ValidationError::new("client_io.read_chunk_size", "must be at least 1"));
    }

    let monitor = &config.monitor;
    if monitor.frequency_minutes == 0 {
        errors.push(ValidationError::new("monitor.frequency_minutes", "must be at least 1"));
    }
    if monitor.spam_requests_block_threshold == 0 {
        errors.push(ValidationError::new(
            "monitor.spam_requests_block_threshold",
            "must be at least 1",
        ));
    }
    if monitor.erroneous_requests_block_threshold == 0 {
        errors.push(ValidationError::new(
            "monitor.erroneous_requests_block_threshold",
            "must be at least 1",
        ));
    }

    let observability = &config.observability;
    if observability.metrics_enabled && observability.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("invalid socket address '{}'", observability.metrics_address),
        ));
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

    #[test]
    fn defaults_are_valid() {
        assert!(validate_config(&ServiceConfig::default()).is_ok());
    }

    #[test]
    fn reports_every_violation() {
        let mut config = ServiceConfig::default();
        config.server.port = 80;
        config.server.busy_threshold = 10;
        config.server.max_connections = 5;
        config.monitor.spam_requests_block_threshold = 0;
        config.observability.metrics_enabled = true;
        config.observability.metrics_address = "not-an-address".into();

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec![
                "server.port",
                "server.max_connections",
                "monitor.spam_requests_block_threshold",
                "observability.metrics_address",
            ]
        );
    }
}
