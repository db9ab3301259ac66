//! Classified errors and warnings attached to code positions (C15, §7).

use std::fmt;

use crate::address::Address;

/// Severity-classified failure kinds, per §7.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AnalysisErrorKind {
    /// An invariant the editing API exists to guarantee was violated (e.g.
    /// cloning a two-way branch during node split, overlapping inputs of
    /// different sizes). Fatal to the current function.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    /// Jump-table recovery or late-discovered unreachable flow. Localized:
    /// the containing construct is degraded, not the whole function.
    #[error("recovery failure: {0}")]
    RecoveryFailure(String),
    /// The loader could not supply bytes for a read-only constant fold.
    #[error("data unavailable for constant fold")]
    DataUnavailable,
    /// A dynamic symbol and a cell of a different size were associated.
    #[error("type conflict: {0}")]
    TypeConflict(String),
    /// Decoding persisted state failed; the partial state is discarded.
    #[error("parse error: {0}")]
    ParseError(String),
}

/// An error tied to the address it was discovered at, if any.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}{}", place.map(|a| format!(" at {a}")).unwrap_or_default())]
pub struct AnalysisError {
    pub kind: AnalysisErrorKind,
    pub place: Option<Address>,
}

impl AnalysisError {
    pub fn new(kind: AnalysisErrorKind, place: Option<Address>) -> Self {
        Self { kind, place }
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::new(AnalysisErrorKind::InvariantViolation(msg.into()), None)
    }

    pub fn recovery(msg: impl Into<String>, place: Address) -> Self {
        Self::new(AnalysisErrorKind::RecoveryFailure(msg.into()), Some(place))
    }
}

/// A non-fatal diagnostic attached to the function (§7): never alters
/// control flow, only surfaced to the host/pretty-printer.
#[derive(Debug, Clone)]
pub enum Warning {
    /// Placed near an address.
    AtAddress { text: String, address: Address },
    /// Placed at the function prototype/header.
    Header { text: String },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::AtAddress { text, address } => write!(f, "{text} (at {address})"),
            Warning::Header { text } => write!(f, "{text}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, AnalysisError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::SpaceId;

    #[test]
    fn error_display_includes_address_when_present() {
        let addr = Address::new(SpaceId(0), 0x1000);
        let err = AnalysisError::recovery("likely a thunk", addr);
        assert_eq!(err.to_string(), "recovery failure: likely a thunk at 0:0x1000");
    }

    #[test]
    fn invariant_error_has_no_address() {
        let err = AnalysisError::invariant("double definition");
        assert_eq!(err.to_string(), "invariant violation: double definition");
    }
}
