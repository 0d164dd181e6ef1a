// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rdds contributors

//! Error taxonomy for transport setup.
//!
//! These errors cover the synchronous setup path only: registry lookups,
//! instance configuration, and association establishment. Runtime transport
//! failures (socket errors, backpressure timeout) are never surfaced as
//! errors from `write()`-style calls -- they arrive asynchronously via the
//! loss/drop callbacks, because they occur on a different thread than the
//! call that queued the data.

use std::fmt;
use std::io;

/// Result alias used throughout the transport core.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors raised across the client/transport boundary during setup.
#[derive(Debug)]
pub enum TransportError {
    /// A named instance, config, or link key does not exist.
    NotFound(String),

    /// A name is already registered.
    Duplicate(String),

    /// A resource (link, socket, pool) could not be created. Fatal for the
    /// requesting call; never retried automatically.
    UnableToCreate(String),

    /// Catch-all for internal inconsistencies worth reporting.
    MiscProblem(String),

    /// No transport configuration could be resolved for an entity.
    NotConfigured(String),

    /// A generic instance configuration did not match the transport kind it
    /// was handed to.
    ConfigurationConflict(String),

    /// A bounded blocking write exceeded `max_blocking_time`.
    WriteTimeout,

    /// Underlying I/O failure during setup.
    Io(io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::NotFound(what) => write!(f, "not found: {}", what),
            TransportError::Duplicate(what) => write!(f, "duplicate: {}", what),
            TransportError::UnableToCreate(what) => write!(f, "unable to create: {}", what),
            TransportError::MiscProblem(what) => write!(f, "transport problem: {}", what),
            TransportError::NotConfigured(what) => {
                write!(f, "no transport configuration for: {}", what)
            }
            TransportError::ConfigurationConflict(what) => {
                write!(f, "configuration conflict: {}", what)
            }
            TransportError::WriteTimeout => write!(f, "write timed out (max_blocking_time)"),
            TransportError::Io(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io(err)
    }
}

impl TransportError {
    /// True for errors that indicate caller misconfiguration rather than a
    /// transient runtime condition.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            TransportError::NotConfigured(_) | TransportError::ConfigurationConflict(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = TransportError::NotFound("inst 'tcp1'".to_string());
        assert_eq!(err.to_string(), "not found: inst 'tcp1'");

        let err = TransportError::ConfigurationConflict("udp inst for tcp".to_string());
        assert!(err.to_string().contains("configuration conflict"));

        let err = TransportError::WriteTimeout;
        assert!(err.to_string().contains("max_blocking_time"));
    }

    #[test]
    fn test_io_conversion_preserves_source() {
        let io_err = io::Error::new(io::ErrorKind::AddrInUse, "bind failed");
        let err: TransportError = io_err.into();

        assert!(matches!(err, TransportError::Io(_)));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_configuration_classification() {
        assert!(TransportError::NotConfigured("w1".into()).is_configuration());
        assert!(TransportError::ConfigurationConflict("x".into()).is_configuration());
        assert!(!TransportError::WriteTimeout.is_configuration());
        assert!(!TransportError::Duplicate("x".into()).is_configuration());
    }
}
