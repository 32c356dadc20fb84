//! Structured observability events with stable snake_case keys.
//!
//! No logger facade: every mutating monitor operation appends one event
//! carrying the operation, its outcome, the stable error code when it
//! failed, and the entities involved. The embedder drains events from the
//! registry and ships them wherever it logs.

use std::fmt;

use serde::{Deserialize, Serialize};

const COMPONENT: &str = "invocation_monitor";

// ---------------------------------------------------------------------------
// FlowOperation / FlowOutcome
// ---------------------------------------------------------------------------

/// Monitor operation an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowOperation {
    Open,
    Close,
    DropRelease,
    RegisterObject,
    AddField,
    SetField,
    AddLocal,
    InitializeLocal,
    InitializeField,
    AssignLocal,
    AssignField,
    BranchPush,
    BranchPop,
    StoreArguments,
    BindArgument,
    RecordReturn,
    ConsumeReturn,
}

impl fmt::Display for FlowOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "open",
            Self::Close => "close",
            Self::DropRelease => "drop_release",
            Self::RegisterObject => "register_object",
            Self::AddField => "add_field",
            Self::SetField => "set_field",
            Self::AddLocal => "add_local",
            Self::InitializeLocal => "initialize_local",
            Self::InitializeField => "initialize_field",
            Self::AssignLocal => "assign_local",
            Self::AssignField => "assign_field",
            Self::BranchPush => "branch_push",
            Self::BranchPop => "branch_pop",
            Self::StoreArguments => "store_arguments",
            Self::BindArgument => "bind_argument",
            Self::RecordReturn => "record_return",
            Self::ConsumeReturn => "consume_return",
        };
        f.write_str(name)
    }
}

/// Outcome of one monitor operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowOutcome {
    Pass,
    IllegalFlow,
    Fault,
}

impl fmt::Display for FlowOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::IllegalFlow => write!(f, "illegal_flow"),
            Self::Fault => write!(f, "fault"),
        }
    }
}

// ---------------------------------------------------------------------------
// FlowEvent
// ---------------------------------------------------------------------------

/// One structured event from the monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEvent {
    /// Label of the invocation that performed the operation.
    pub invocation: String,
    pub component: String,
    pub operation: FlowOperation,
    pub outcome: FlowOutcome,
    pub error_code: Option<String>,
    /// Local name, field name, object id, or scope id the operation touched.
    pub entity: Option<String>,
    /// Resulting level name, when the operation produced one.
    pub level: Option<String>,
    /// Ambient PC level name at the time of the operation.
    pub pc: Option<String>,
}

impl FlowEvent {
    pub(crate) fn new(invocation: &str, operation: FlowOperation, outcome: FlowOutcome) -> Self {
        Self {
            invocation: invocation.to_string(),
            component: COMPONENT.to_string(),
            operation,
            outcome,
            error_code: None,
            entity: None,
            level: None,
            pc: None,
        }
    }

    pub(crate) fn with_error_code(mut self, code: &'static str) -> Self {
        self.error_code = Some(code.to_string());
        self
    }

    pub(crate) fn with_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    pub(crate) fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = Some(level.into());
        self
    }

    pub(crate) fn with_pc(mut self, pc: impl Into<String>) -> Self {
        self.pc = Some(pc.into());
        self
    }
}
