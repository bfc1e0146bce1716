//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;

use crate::ordering::Evidence;

/// Customized error type for Mirador.
///
/// Contract violations are bugs in the calling driver and must halt the
/// processing of the offending event. Byzantine evidence is surfaced so the
/// caller can report it; local progress is unaffected.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum MiradorError {
    /// Caller broke an invariant of the ordering core.
    ContractViolation(String),

    /// A peer or client was observed misbehaving.
    ByzantineEvidence(Evidence),

    /// Durable storage collaborator failed (I/O or codec).
    Storage(String),

    /// Malformed or inconsistent configuration.
    Config(String),
}

impl MiradorError {
    pub fn msg(msg: impl ToString) -> Self {
        MiradorError::ContractViolation(msg.to_string())
    }

    /// Returns true if this error indicates a bug in the caller.
    #[inline]
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, MiradorError::ContractViolation(_))
    }

    /// Returns the evidence carried, if this is a Byzantine fault report.
    #[inline]
    pub fn evidence(&self) -> Option<&Evidence> {
        match self {
            MiradorError::ByzantineEvidence(ev) => Some(ev),
            _ => None,
        }
    }
}

impl fmt::Display for MiradorError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MiradorError::ContractViolation(msg) => {
                write!(f, "contract violation: {}", msg)
            }
            MiradorError::ByzantineEvidence(ev) => {
                write!(f, "byzantine evidence: {}", ev)
            }
            MiradorError::Storage(msg) => write!(f, "storage: {}", msg),
            MiradorError::Config(msg) => write!(f, "config: {}", msg),
        }
    }
}

impl error::Error for MiradorError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `MiradorError`.
macro_rules! impl_from_error {
    ($error:ty => $variant:ident) => {
        impl From<$error> for MiradorError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                MiradorError::$variant(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error => Storage);
impl_from_error!(rmp_serde::encode::Error => Storage);
impl_from_error!(rmp_serde::decode::Error => Storage);
impl_from_error!(toml::de::Error => Config);
