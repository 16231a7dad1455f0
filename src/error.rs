//! # Error Types for DLC Lending
//!
//! Every fallible operation in the settlement core returns [`LendingResult`].
//! Errors are grouped by *kind* so callers can decide how to react without
//! matching on individual variants: validation failures are rejected before
//! any state mutation, crypto-verification failures are fatal to the request,
//! and invariant violations halt the tick that hit them.

use thiserror::Error;

/// Classification of a [`LendingError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    State,
    InsufficientResource,
    CryptoVerification,
    Invariant,
    Internal,
}

/// Main error type for all lending, oracle and settlement operations
#[derive(Debug, Error)]
pub enum LendingError {
    /// Malformed public key, signature, amount or other request field
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Unknown loan, event, oracle, pool, attestation, ...
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Duplicate attestation, completion or authorization
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// Operation attempted from a status that forbids it
    #[error("Invalid {entity} state: expected {expected}, got {actual}")]
    InvalidState {
        entity: &'static str,
        expected: String,
        actual: String,
    },

    /// No available DLC event, liquidity, collateral or cap headroom
    #[error("Insufficient {resource}: required {required}, available {available}")]
    Insufficient {
        resource: &'static str,
        required: String,
        available: String,
    },

    /// Oracle capacity exhausted, the lending event queue is empty
    #[error("No available DLC event")]
    NoAvailableDlcEvent,

    /// Adaptor or plain signature failed to verify
    #[error("Signature verification failed: {message}")]
    SignatureVerification { message: String },

    /// Submitted CET does not match the expected structure
    #[error("Invalid CET: {message}")]
    InvalidCet { message: String },

    /// DLC event has not been triggered yet
    #[error("DLC event {event_id} not triggered")]
    EventNotTriggered { event_id: u64 },

    /// Attestation for the event already exists
    #[error("Attestation already exists for DLC event {event_id}")]
    AttestationExists { event_id: u64 },

    /// Broken invariant while moving escrowed funds. Never swallowed.
    #[error("Invariant violation: {message}")]
    Invariant { message: String },

    /// Hex decoding failures
    #[error("Hex decoding failed: {source}")]
    Hex {
        #[from]
        source: hex::FromHexError,
    },

    /// Curve arithmetic and key parsing failures
    #[error("secp256k1 error: {source}")]
    Secp {
        #[from]
        source: bitcoin::secp256k1::Error,
    },

    /// Bitcoin consensus decoding failures
    #[error("Transaction decoding failed: {source}")]
    Consensus {
        #[from]
        source: bitcoin::consensus::encode::Error,
    },

    /// JSON serialization/deserialization errors
    #[error("JSON processing error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    /// File I/O operations
    #[error("File operation failed: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Generic operation failures with context
    #[error("Operation failed: {operation} - {message}")]
    OperationFailed { operation: String, message: String },
}

/// Result type alias for lending operations
pub type LendingResult<T> = Result<T, LendingError>;

impl LendingError {
    /// Create a validation error with a message
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Create a conflict error with a message
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Create an invalid state error
    pub fn state(
        entity: &'static str,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        Self::InvalidState {
            entity,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Create an insufficient-resource error
    pub fn insufficient(
        resource: &'static str,
        required: impl ToString,
        available: impl ToString,
    ) -> Self {
        Self::Insufficient {
            resource,
            required: required.to_string(),
            available: available.to_string(),
        }
    }

    /// Create a signature verification error
    pub fn signature(message: impl Into<String>) -> Self {
        Self::SignatureVerification {
            message: message.into(),
        }
    }

    /// Create an invalid CET error
    pub fn invalid_cet(message: impl Into<String>) -> Self {
        Self::InvalidCet {
            message: message.into(),
        }
    }

    /// Create an invariant violation
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant {
            message: message.into(),
        }
    }

    /// Create an operation failed error
    pub fn operation(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Kind of this error, see [`ErrorKind`]
    pub fn kind(&self) -> ErrorKind {
        match self {
            LendingError::Validation { .. }
            | LendingError::InvalidCet { .. }
            | LendingError::Hex { .. }
            | LendingError::Consensus { .. } => ErrorKind::Validation,
            LendingError::NotFound { .. } => ErrorKind::NotFound,
            LendingError::Conflict { .. } | LendingError::AttestationExists { .. } => {
                ErrorKind::Conflict
            }
            LendingError::InvalidState { .. } | LendingError::EventNotTriggered { .. } => {
                ErrorKind::State
            }
            LendingError::Insufficient { .. } | LendingError::NoAvailableDlcEvent => {
                ErrorKind::InsufficientResource
            }
            LendingError::SignatureVerification { .. } | LendingError::Secp { .. } => {
                ErrorKind::CryptoVerification
            }
            LendingError::Invariant { .. } => ErrorKind::Invariant,
            LendingError::Json { .. }
            | LendingError::Io { .. }
            | LendingError::OperationFailed { .. } => ErrorKind::Internal,
        }
    }

    /// Check if this error indicates a security issue
    pub fn is_security_critical(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::CryptoVerification | ErrorKind::Invariant
        ) || matches!(self, LendingError::InvalidCet { .. })
    }

    /// Check if this error must halt block processing
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Invariant
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = LendingError::validation("invalid amount");
        assert!(matches!(err, LendingError::Validation { .. }));
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = LendingError::signature("adaptor signature mismatch");
        assert!(err.is_security_critical());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(
            LendingError::AttestationExists { event_id: 1 }.kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            LendingError::EventNotTriggered { event_id: 1 }.kind(),
            ErrorKind::State
        );
        assert_eq!(
            LendingError::NoAvailableDlcEvent.kind(),
            ErrorKind::InsufficientResource
        );
        assert!(LendingError::invalid_cet("dust output").is_security_critical());
        assert!(LendingError::invariant("escrow mismatch").is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = LendingError::not_found("loan", "tb1pxyz");
        assert_eq!(err.to_string(), "loan not found: tb1pxyz");

        let err = LendingError::insufficient("liquidity", 100, 50);
        assert_eq!(
            err.to_string(),
            "Insufficient liquidity: required 100, available 50"
        );
    }
}
