//! Unified error type for the LLMQ subsystem
//!
//! Variants follow the fault taxonomy the services rely on:
//! protocol faults are attributable to a peer and never leave the component
//! that detected them, liveness faults surface as `NoQuorum`/`Expired`,
//! consistency faults as `Conflict`, and `Invariant` marks programming errors
//! that must abort startup or shutdown of the hosting process.

use serde::{Deserialize, Serialize};

/// Unified error type for all LLMQ operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum LlmqError {
    /// Invalid input or arguments
    #[error("Invalid: {message}")]
    Invalid {
        /// Error message describing the invalid input
        message: String,
    },

    /// Resource not found
    #[error("Not found: {message}")]
    NotFound {
        /// Error message describing what was not found
        message: String,
    },

    /// Malformed or invalid data supplied by a peer
    #[error("Protocol fault: {message}")]
    Protocol {
        /// Error message describing the offending message
        message: String,
    },

    /// A signing request or DKG session could not gather a quorum
    #[error("No quorum: {message}")]
    NoQuorum {
        /// Error message describing the request
        message: String,
    },

    /// A request outlived its deadline
    #[error("Expired: {message}")]
    Expired {
        /// Error message describing the expired request
        message: String,
    },

    /// A quorum referenced by an active request has been purged
    #[error("Quorum expired: {message}")]
    QuorumExpired {
        /// Error message naming the purged quorum
        message: String,
    },

    /// Two valid but different results for the same identifier
    #[error("Conflict: {message}")]
    Conflict {
        /// Error message describing the conflicting results
        message: String,
    },

    /// Cryptographic operation failed
    #[error("Crypto error: {message}")]
    Crypto {
        /// Error message describing the cryptographic failure
        message: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message describing the serialization failure
        message: String,
    },

    /// Invalid configuration
    #[error("Config error: {message}")]
    Config {
        /// Error message describing the configuration problem
        message: String,
    },

    /// Programming error: lifecycle misuse, duplicate construction
    #[error("Invariant violated: {message}")]
    Invariant {
        /// Error message describing the violated invariant
        message: String,
    },

    /// Internal system error
    #[error("Internal error: {message}")]
    Internal {
        /// Error message describing the internal error
        message: String,
    },
}

impl LlmqError {
    /// Create an invalid input error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a protocol fault error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a no-quorum error
    pub fn no_quorum(message: impl Into<String>) -> Self {
        Self::NoQuorum {
            message: message.into(),
        }
    }

    /// Create an expired error
    pub fn expired(message: impl Into<String>) -> Self {
        Self::Expired {
            message: message.into(),
        }
    }

    /// Create a quorum-expired error
    pub fn quorum_expired(message: impl Into<String>) -> Self {
        Self::QuorumExpired {
            message: message.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Create a crypto error
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an invariant violation error
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the error is a programming error that must terminate the node
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Invariant { .. })
    }

    /// Whether the error is attributable to a remote peer
    pub fn is_peer_fault(&self) -> bool {
        matches!(self, Self::Protocol { .. })
    }
}

/// Standard Result type for LLMQ operations
pub type Result<T> = std::result::Result<T, LlmqError>;

impl From<bincode::Error> for LlmqError {
    fn from(err: bincode::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<toml::de::Error> for LlmqError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<std::io::Error> for LlmqError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(err.to_string()),
            _ => Self::internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = LlmqError::invalid("test message");
        assert!(matches!(err, LlmqError::Invalid { .. }));
        assert_eq!(err.to_string(), "Invalid: test message");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(LlmqError::invariant("start called twice").is_fatal());
        assert!(!LlmqError::protocol("bad share").is_fatal());
        assert!(LlmqError::protocol("bad share").is_peer_fault());
        assert!(!LlmqError::no_quorum("timeout").is_peer_fault());
    }

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "config missing");
        let err = LlmqError::from(io_err);
        assert!(matches!(err, LlmqError::NotFound { .. }));
    }
}
