use std::fmt;

use crate::core::txn::BranchState;

/// One failed connect attempt: the address tried and why it failed.
#[derive(Debug, Clone)]
pub struct ConnectAttempt {
    pub address: String,
    pub cause: String,
}

#[derive(Debug)]
pub enum WireError {
    /// An address-list token failed to parse. The whole list is rejected.
    MalformedAddress { token: String, reason: String },
    /// Unrecognized address-list selection behavior string.
    BadListBehavior(String),
    /// Every address in the list was tried and failed. Carries the full
    /// per-address failure record, not just the last one.
    ConnectFailed(Vec<ConnectAttempt>),
    /// The broker link dropped or was closed underneath an operation.
    Disconnected,
    /// The delivery queue was closed.
    QueueClosed,
    /// An inbound item could not be decoded into a logical message.
    Decode(String),
    /// A transaction operation was called in a state that does not permit it.
    InvalidTxnState {
        op: &'static str,
        state: BranchState,
    },
    /// The branch was rolled back cleanly; the work may be retried.
    TxnRolledBack(String),
    /// The outcome of a commit could not be determined. Callers must not
    /// blindly retry: the broker may already have applied the transaction.
    TxnHeuristic(String),
    /// Two branches were joined across different broker sessions.
    RmMismatch,
    Timeout,
    Internal(String),
}

impl std::error::Error for WireError {}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::MalformedAddress { token, reason } => {
                write!(f, "Malformed broker address '{token}': {reason}")
            }
            WireError::BadListBehavior(s) => {
                write!(f, "Bad address list behavior value: {s}")
            }
            WireError::ConnectFailed(attempts) => {
                write!(f, "Unable to connect to any broker address:")?;
                for a in attempts {
                    write!(f, " [{} => {}]", a.address, a.cause)?;
                }
                Ok(())
            }
            WireError::Disconnected => write!(f, "Broker link is disconnected"),
            WireError::QueueClosed => write!(f, "Delivery queue is closed"),
            WireError::Decode(msg) => write!(f, "Inbound packet decode failed: {msg}"),
            WireError::InvalidTxnState { op, state } => {
                write!(f, "Transaction operation '{op}' invalid in state {state:?}")
            }
            WireError::TxnRolledBack(msg) => {
                write!(f, "Transaction rolled back: {msg}")
            }
            WireError::TxnHeuristic(msg) => {
                write!(f, "Transaction outcome indeterminate: {msg}")
            }
            WireError::RmMismatch => {
                write!(f, "Transaction branches belong to different broker sessions")
            }
            WireError::Timeout => write!(f, "Operation timed out"),
            WireError::Internal(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl WireError {
    /// True for the indeterminate-outcome case integration code must treat
    /// specially (no blind retry).
    pub fn is_heuristic(&self) -> bool {
        matches!(self, WireError::TxnHeuristic(_))
    }
}
