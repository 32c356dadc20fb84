//! Branch-scope protocol: the push/pop discipline on the branch-PC stack.
//!
//! Entering a branch guarded by a condition raises the ambient program
//! counter for the branch body. Every push returns a move-only
//! `BranchToken` and only the matching pop accepts it, so a correctly
//! nested instrumenter cannot express a mismatched pop. Out-of-order
//! consumption across sibling tokens remains the fatal `ScopeMismatch`
//! fault, never a security verdict.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::MonitorError;
use crate::security_lattice::{SecurityLattice, SecurityLevel};

const SCOPE_SCHEMA: &[u8] = b"labelflow.branch-scope.v1";

// ---------------------------------------------------------------------------
// ScopeId — identity tying a push to its pop
// ---------------------------------------------------------------------------

/// Identity of one branch scope, supplied by the instrumenter.
///
/// The instrumenter keys scopes by the branch's join point; `derive` gives a
/// stable identity from the enclosing method signature and the join-point
/// offset within it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeId(String);

impl ScopeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives a scope identity from a method signature and the bytecode
    /// offset of the branch's join point.
    pub fn derive(method_signature: &str, join_point_offset: u32) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(SCOPE_SCHEMA);
        hasher.update(method_signature.as_bytes());
        hasher.update(join_point_offset.to_be_bytes());
        let digest = hasher.finalize();
        let hex: String = digest[..8].iter().map(|byte| format!("{byte:02x}")).collect();
        Self(format!("bs-{hex}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// BranchToken — move-only pop capability
// ---------------------------------------------------------------------------

/// Capability returned by a branch-PC push; consumed by the matching pop.
///
/// Deliberately neither `Clone` nor serializable: one push, one pop.
#[derive(Debug)]
pub struct BranchToken {
    scope_id: ScopeId,
    depth: usize,
}

impl BranchToken {
    pub fn scope_id(&self) -> &ScopeId {
        &self.scope_id
    }
}

// ---------------------------------------------------------------------------
// BranchPcStack — ambient PC contributed by enclosing branches
// ---------------------------------------------------------------------------

/// Stack of `(level, scope)` entries for the branches currently entered.
///
/// Entries carry the level already joined with the ambient PC at push time,
/// so the current PC is a plain fold over the stack.
#[derive(Debug, Clone, Default)]
pub struct BranchPcStack {
    entries: Vec<(SecurityLevel, ScopeId)>,
}

impl BranchPcStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes an entry and hands back the capability for its pop.
    pub fn push(&mut self, level: SecurityLevel, scope_id: ScopeId) -> BranchToken {
        let token = BranchToken {
            scope_id: scope_id.clone(),
            depth: self.entries.len(),
        };
        self.entries.push((level, scope_id));
        token
    }

    /// Pops the entry matching `token`.
    ///
    /// The token must belong to the most recently pushed, unpopped entry;
    /// anything else is the fatal `ScopeMismatch` fault.
    pub fn pop(&mut self, token: BranchToken) -> Result<(), MonitorError> {
        match self.entries.last() {
            None => Err(MonitorError::ScopeMismatch {
                expected: None,
                actual: token.scope_id,
            }),
            Some((_, top)) if *top == token.scope_id && token.depth + 1 == self.entries.len() => {
                self.entries.pop();
                Ok(())
            }
            Some((_, top)) => Err(MonitorError::ScopeMismatch {
                expected: Some(top.clone()),
                actual: token.scope_id,
            }),
        }
    }

    /// Ambient PC: `base` joined with every open entry.
    pub fn current(&self, lattice: &SecurityLattice, base: SecurityLevel) -> SecurityLevel {
        self.entries
            .iter()
            .fold(base, |acc, (level, _)| lattice.join(acc, *level))
    }

    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
