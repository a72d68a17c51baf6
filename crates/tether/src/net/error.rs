use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection attempt already in progress")]
    AlreadyConnecting,
    #[error("already connected")]
    AlreadyConnected,
    #[error("not connected")]
    NotConnected,
    #[error("in-flight table is full ({0} unacknowledged reliable packets)")]
    LedgerFull(usize),
    #[error("payload of {0} bytes is too large")]
    PayloadTooLarge(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetError {
    #[error("no connection to {0}")]
    UnknownPeer(SocketAddr),
    #[error("connection limit of {0} reached")]
    CapacityReached(usize),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Coarse category passed to the error callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    Timeout,
    DeliveryFailure,
    Decode,
    Capacity,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::DeliveryFailure => "delivery failure",
            ErrorCategory::Decode => "decode",
            ErrorCategory::Capacity => "capacity",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a connection ended up in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    ConnectTimeout,
    IdleTimeout,
    DeliveryFailures,
    LedgerFull,
}

impl FailureReason {
    pub fn category(&self) -> ErrorCategory {
        match self {
            FailureReason::ConnectTimeout | FailureReason::IdleTimeout => ErrorCategory::Timeout,
            FailureReason::DeliveryFailures => ErrorCategory::DeliveryFailure,
            FailureReason::LedgerFull => ErrorCategory::Capacity,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::ConnectTimeout => "connection attempt timed out",
            FailureReason::IdleTimeout => "connection idle timeout",
            FailureReason::DeliveryFailures => "too many consecutive delivery failures",
            FailureReason::LedgerFull => "in-flight table full",
        }
    }
}
