//! Errors returned by the lifecycle operations

use std::{fmt, sync::Arc};

use fe2o3_amqp_types::{
    definitions::{self, AmqpError, ErrorCondition, Fields},
    messaging::Outcome,
};

use crate::engine::Delivery;

/// An error reported by the remote peer or by the protocol engine
#[derive(Debug, Clone)]
pub struct ProtocolError {
    /// Error condition
    pub condition: ErrorCondition,

    /// Human readable description
    pub description: Option<String>,

    /// Additional information attached by the peer
    pub info: Option<Fields>,

    /// The underlying cause if the error did not originate from an AMQP error frame
    /// (ie. a socket error that caused a disconnect)
    pub raw_cause: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl ProtocolError {
    /// Creates a new [`ProtocolError`]
    pub fn new(condition: impl Into<ErrorCondition>, description: Option<String>) -> Self {
        Self {
            condition: condition.into(),
            description,
            info: None,
            raw_cause: None,
        }
    }

    /// Attaches the raw cause of the error
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.raw_cause = Some(Arc::new(cause));
        self
    }

    /// Creates an `amqp:internal-error` with a description
    pub fn internal(description: impl Into<String>) -> Self {
        Self::new(AmqpError::InternalError, Some(description.into()))
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{:?}: {}", self.condition, description),
            None => write!(f, "{:?}", self.condition),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.raw_cause
            .as_ref()
            .map(|cause| cause.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<definitions::Error> for ProtocolError {
    fn from(error: definitions::Error) -> Self {
        Self {
            condition: error.condition,
            description: error.description,
            info: error.info,
            raw_cause: None,
        }
    }
}

impl From<AmqpError> for ProtocolError {
    fn from(condition: AmqpError) -> Self {
        Self::new(condition, None)
    }
}

/// Terminal delivery state reported by the receiving peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// The message was accepted
    Accepted,

    /// The message was rejected
    Rejected,

    /// The message was released
    Released,

    /// The message was modified
    Modified,
}

impl Disposition {
    /// Name of the disposition as used in event and error messages
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Accepted => "accepted",
            Disposition::Rejected => "rejected",
            Disposition::Released => "released",
            Disposition::Modified => "modified",
        }
    }

    /// Maps an outcome onto its disposition kind
    ///
    /// Returns `None` for outcomes that are not one of the four messaging outcomes
    pub fn from_outcome(outcome: &Outcome) -> Option<Self> {
        match outcome {
            Outcome::Accepted(_) => Some(Disposition::Accepted),
            Outcome::Rejected(_) => Some(Disposition::Rejected),
            Outcome::Released(_) => Some(Disposition::Released),
            Outcome::Modified(_) => Some(Disposition::Modified),
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The remote peer settled a delivery with an outcome other than accepted
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct SendOperationFailedError {
    /// Kind of the terminal disposition
    pub disposition: Disposition,

    /// Human readable message
    pub message: String,

    /// Error carried by a rejected outcome
    pub remote_error: Option<ProtocolError>,

    /// The delivery as last reported by the engine
    pub delivery: Delivery,
}

/// Errors of the lifecycle operations
///
/// Every public asynchronous operation resolves with exactly one of these or with its value.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The remote peer or the engine reported an AMQP error
    #[error("Protocol error {}", .0)]
    Protocol(ProtocolError),

    /// The operation did not complete before its deadline
    #[error("Operation timeout: {}", .0)]
    OperationTimeout(String),

    /// The caller cancelled the operation
    #[error("Operation cancelled: {}", .0)]
    Cancelled(String),

    /// A send was attempted while the link had no credit
    #[error("Insufficient credit: {}", .0)]
    InsufficientCredit(String),

    /// Invalid combination of options
    #[error("Invalid configuration: {}", .0)]
    Configuration(String),

    /// The remote peer did not accept the message
    #[error(transparent)]
    SendOperationFailed(#[from] SendOperationFailedError),

    /// The transport was disconnected before the operation completed
    #[error("Connection {:?} has been disconnected, cause: {:?}", .connection_id, .cause)]
    Disconnected {
        /// Id of the disconnected connection
        connection_id: String,

        /// Error that caused the disconnect if any was reported
        cause: Option<ProtocolError>,
    },
}

impl From<ProtocolError> for Error {
    fn from(error: ProtocolError) -> Self {
        Self::Protocol(error)
    }
}

impl From<definitions::Error> for Error {
    fn from(error: definitions::Error) -> Self {
        Self::Protocol(error.into())
    }
}

impl Error {
    /// Whether the error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::OperationTimeout(_))
    }

    /// Whether the error is a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    /// Returns the disposition if this is a [`Error::SendOperationFailed`]
    pub fn disposition(&self) -> Option<Disposition> {
        match self {
            Error::SendOperationFailed(err) => Some(err.disposition),
            _ => None,
        }
    }
}
