//! Error taxonomy of the monitor.
//!
//! Two disjoint categories share one enum: `IllegalFlow` is the security
//! verdict, the intended output of the monitor when the monitored program
//! attempts a sensitive upgrade. Every other variant is an
//! internal-consistency fault: the instrumenter emitted a malformed call
//! sequence. Faults are fatal and must never be read as security results.
//!
//! Codes are append-only: assigned codes are permanent and never reused.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::branch_scope::ScopeId;
use crate::object_registry::ObjectId;

const ERROR_UNKNOWN_OBJECT: &str = "LF-2001";
const ERROR_UNKNOWN_FIELD: &str = "LF-2002";
const ERROR_UNKNOWN_LOCAL: &str = "LF-2003";
const ERROR_DUPLICATE_LOCAL: &str = "LF-2004";
const ERROR_FRAME_IMBALANCE: &str = "LF-2005";
const ERROR_SCOPE_MISMATCH: &str = "LF-3001";
const ERROR_UNCLOSED_SCOPES: &str = "LF-3002";
const ERROR_ARGUMENT_INDEX: &str = "LF-3003";
const ERROR_RETURN_CHANNEL_EMPTY: &str = "LF-3004";
const ERROR_ILLEGAL_FLOW: &str = "LF-4001";

// ---------------------------------------------------------------------------
// ErrorCategory — verdicts vs faults
// ---------------------------------------------------------------------------

/// Which taxonomy an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The monitor worked as intended and rejected a forbidden flow.
    SecurityVerdict,
    /// The instrumenter emitted a malformed call sequence.
    InternalFault,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SecurityVerdict => write!(f, "security_verdict"),
            Self::InternalFault => write!(f, "internal_fault"),
        }
    }
}

// ---------------------------------------------------------------------------
// MonitorError
// ---------------------------------------------------------------------------

/// Error from a monitor operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorError {
    /// Sensitive upgrade rejected by the no-sensitive-upgrade check.
    IllegalFlow {
        entity: String,
        old_level: String,
        pc_level: String,
        invocation: String,
    },
    /// The object identity was never minted by the registry.
    UnknownObject { object: ObjectId },
    /// The field was never registered on this object.
    UnknownField { object: ObjectId, field: String },
    /// The local was never added to this frame.
    UnknownLocal { local: String },
    /// The local already exists in this frame.
    DuplicateLocal { local: String },
    /// Frame push/pop discipline was violated.
    FrameImbalance { detail: String },
    /// A branch-scope pop does not match the most recent open push.
    ScopeMismatch {
        expected: Option<ScopeId>,
        actual: ScopeId,
    },
    /// The invocation closed while branch scopes were still open.
    UnclosedScopes { open: usize },
    /// An argument binding read past the stored argument buffer.
    ArgumentIndexOutOfRange { index: usize, len: usize },
    /// A return level was consumed before any callee recorded one.
    ReturnChannelEmpty,
}

impl MonitorError {
    pub fn stable_code(&self) -> &'static str {
        match self {
            Self::IllegalFlow { .. } => ERROR_ILLEGAL_FLOW,
            Self::UnknownObject { .. } => ERROR_UNKNOWN_OBJECT,
            Self::UnknownField { .. } => ERROR_UNKNOWN_FIELD,
            Self::UnknownLocal { .. } => ERROR_UNKNOWN_LOCAL,
            Self::DuplicateLocal { .. } => ERROR_DUPLICATE_LOCAL,
            Self::FrameImbalance { .. } => ERROR_FRAME_IMBALANCE,
            Self::ScopeMismatch { .. } => ERROR_SCOPE_MISMATCH,
            Self::UnclosedScopes { .. } => ERROR_UNCLOSED_SCOPES,
            Self::ArgumentIndexOutOfRange { .. } => ERROR_ARGUMENT_INDEX,
            Self::ReturnChannelEmpty => ERROR_RETURN_CHANNEL_EMPTY,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::IllegalFlow { .. } => ErrorCategory::SecurityVerdict,
            _ => ErrorCategory::InternalFault,
        }
    }

    /// True for the intended output of the monitor; false for
    /// instrumentation bugs.
    pub fn is_security_verdict(&self) -> bool {
        self.category() == ErrorCategory::SecurityVerdict
    }
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllegalFlow {
                entity,
                old_level,
                pc_level,
                invocation,
            } => write!(
                f,
                "illegal flow in `{invocation}`: sensitive upgrade of `{entity}` \
                 from `{old_level}` under pc `{pc_level}`"
            ),
            Self::UnknownObject { object } => write!(f, "unknown object: {object}"),
            Self::UnknownField { object, field } => {
                write!(f, "unknown field `{field}` on {object}")
            }
            Self::UnknownLocal { local } => write!(f, "unknown local `{local}`"),
            Self::DuplicateLocal { local } => {
                write!(f, "duplicate local `{local}` in this frame")
            }
            Self::FrameImbalance { detail } => write!(f, "frame stack imbalance: {detail}"),
            Self::ScopeMismatch { expected, actual } => match expected {
                Some(expected) => write!(
                    f,
                    "branch scope mismatch: popped `{actual}` while `{expected}` is open"
                ),
                None => write!(
                    f,
                    "branch scope mismatch: popped `{actual}` with no open scope"
                ),
            },
            Self::UnclosedScopes { open } => {
                write!(f, "{open} branch scope(s) still open at close")
            }
            Self::ArgumentIndexOutOfRange { index, len } => write!(
                f,
                "argument index {index} out of range for buffer of length {len}"
            ),
            Self::ReturnChannelEmpty => {
                write!(f, "return channel is empty: no callee recorded a return level")
            }
        }
    }
}

impl std::error::Error for MonitorError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn illegal_flow() -> MonitorError {
        MonitorError::IllegalFlow {
            entity: "int_x".to_string(),
            old_level: "low".to_string(),
            pc_level: "high".to_string(),
            invocation: "main.Demo.run()".to_string(),
        }
    }

    // -- Categories --

    #[test]
    fn illegal_flow_is_the_only_security_verdict() {
        assert_eq!(illegal_flow().category(), ErrorCategory::SecurityVerdict);
        assert!(illegal_flow().is_security_verdict());

        let faults = [
            MonitorError::UnknownLocal {
                local: "x".to_string(),
            },
            MonitorError::DuplicateLocal {
                local: "x".to_string(),
            },
            MonitorError::FrameImbalance {
                detail: "pop on empty stack".to_string(),
            },
            MonitorError::UnclosedScopes { open: 2 },
            MonitorError::ArgumentIndexOutOfRange { index: 3, len: 2 },
            MonitorError::ReturnChannelEmpty,
        ];
        for fault in faults {
            assert_eq!(fault.category(), ErrorCategory::InternalFault);
            assert!(!fault.is_security_verdict());
        }
    }

    // -- Stable codes --

    #[test]
    fn stable_codes_are_distinct() {
        let errors = [
            illegal_flow(),
            MonitorError::UnknownLocal {
                local: "x".to_string(),
            },
            MonitorError::DuplicateLocal {
                local: "x".to_string(),
            },
            MonitorError::FrameImbalance {
                detail: "d".to_string(),
            },
            MonitorError::UnclosedScopes { open: 1 },
            MonitorError::ArgumentIndexOutOfRange { index: 0, len: 0 },
            MonitorError::ReturnChannelEmpty,
        ];
        let mut codes: Vec<&str> = errors.iter().map(MonitorError::stable_code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn illegal_flow_code_is_permanent() {
        assert_eq!(illegal_flow().stable_code(), "LF-4001");
    }

    // -- Display --

    #[test]
    fn display_names_the_entities() {
        let message = illegal_flow().to_string();
        assert!(message.contains("int_x"));
        assert!(message.contains("low"));
        assert!(message.contains("high"));
        assert!(message.contains("main.Demo.run()"));
    }

    #[test]
    fn category_display() {
        assert_eq!(
            ErrorCategory::SecurityVerdict.to_string(),
            "security_verdict"
        );
        assert_eq!(ErrorCategory::InternalFault.to_string(), "internal_fault");
    }
}
