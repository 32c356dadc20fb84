//! Finite security lattices and the levels drawn from them.
//!
//! A `SecurityLattice` is constructed once from configuration and is immutable
//! afterwards. `leq`, `join`, and `meet` are precomputed table lookups that
//! cannot fail during tracking; construction is the only failure point.
//! `SecurityLevel` values are opaque indices and are only meaningful together
//! with the lattice that minted them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const ERROR_EMPTY_LATTICE: &str = "LF-1001";
const ERROR_TOO_MANY_LEVELS: &str = "LF-1002";
const ERROR_DUPLICATE_LEVEL: &str = "LF-1003";
const ERROR_UNKNOWN_LEVEL: &str = "LF-1004";
const ERROR_ORDER_CYCLE: &str = "LF-1005";
const ERROR_NO_UNIQUE_JOIN: &str = "LF-1006";
const ERROR_NO_UNIQUE_MEET: &str = "LF-1007";
const ERROR_INVALID_SPEC: &str = "LF-1008";

// ---------------------------------------------------------------------------
// SecurityLevel — an opaque point of a lattice
// ---------------------------------------------------------------------------

/// One point of a `SecurityLattice`.
///
/// Copyable and immutable. A level carries no ordering information of its
/// own; all comparisons go through the lattice that minted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecurityLevel(u16);

impl SecurityLevel {
    pub(crate) fn index(self) -> usize {
        usize::from(self.0)
    }
}

// ---------------------------------------------------------------------------
// LatticeSpec — configuration surface
// ---------------------------------------------------------------------------

/// Declarative description of a finite lattice, loadable from configuration.
///
/// `order` lists pairs `(lower, upper)` asserting that `lower` flows to
/// `upper`. Reflexivity and transitivity are filled in at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatticeSpec {
    pub levels: Vec<String>,
    pub order: Vec<(String, String)>,
}

impl LatticeSpec {
    /// The default two-point lattice: `low` flows to `high`.
    pub fn two_point() -> Self {
        Self {
            levels: vec!["low".to_string(), "high".to_string()],
            order: vec![("low".to_string(), "high".to_string())],
        }
    }
}

// ---------------------------------------------------------------------------
// LatticeError — configuration-time failures
// ---------------------------------------------------------------------------

/// Error from building a `SecurityLattice` out of a `LatticeSpec`.
///
/// Only malformed external input is reported here; a constructed lattice
/// never fails during tracking.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LatticeError {
    #[error("empty lattice: at least one level is required")]
    EmptyLattice,
    #[error("too many levels: {count} exceeds the supported maximum of {max}")]
    TooManyLevels { count: usize, max: usize },
    #[error("duplicate level name `{name}`")]
    DuplicateLevel { name: String },
    #[error("unknown level name `{name}`")]
    UnknownLevel { name: String },
    #[error("order cycle between `{a}` and `{b}`")]
    OrderCycle { a: String, b: String },
    #[error("levels `{a}` and `{b}` have no unique least upper bound")]
    NoUniqueJoin { a: String, b: String },
    #[error("levels `{a}` and `{b}` have no unique greatest lower bound")]
    NoUniqueMeet { a: String, b: String },
    #[error("malformed lattice spec: {detail}")]
    InvalidSpec { detail: String },
}

impl LatticeError {
    pub fn stable_code(&self) -> &'static str {
        match self {
            Self::EmptyLattice => ERROR_EMPTY_LATTICE,
            Self::TooManyLevels { .. } => ERROR_TOO_MANY_LEVELS,
            Self::DuplicateLevel { .. } => ERROR_DUPLICATE_LEVEL,
            Self::UnknownLevel { .. } => ERROR_UNKNOWN_LEVEL,
            Self::OrderCycle { .. } => ERROR_ORDER_CYCLE,
            Self::NoUniqueJoin { .. } => ERROR_NO_UNIQUE_JOIN,
            Self::NoUniqueMeet { .. } => ERROR_NO_UNIQUE_MEET,
            Self::InvalidSpec { .. } => ERROR_INVALID_SPEC,
        }
    }
}

// ---------------------------------------------------------------------------
// SecurityLattice — validated order with precomputed tables
// ---------------------------------------------------------------------------

/// A validated finite lattice with total `leq`/`join`/`meet` tables.
#[derive(Debug, Clone)]
pub struct SecurityLattice {
    names: Vec<String>,
    index_by_name: BTreeMap<String, u16>,
    // n * n row-major tables; `leq[a * n + b]` means a flows to b.
    leq: Vec<bool>,
    join: Vec<u16>,
    meet: Vec<u16>,
    bottom: u16,
    top: u16,
}

impl SecurityLattice {
    /// The default two-point lattice (`low` flows to `high`).
    pub fn two_point() -> Self {
        Self::from_spec(&LatticeSpec::two_point())
            .expect("the built-in two-point spec is well formed")
    }

    /// Validates a spec and precomputes the order and bound tables.
    pub fn from_spec(spec: &LatticeSpec) -> Result<Self, LatticeError> {
        let n = spec.levels.len();
        if n == 0 {
            return Err(LatticeError::EmptyLattice);
        }
        if n > usize::from(u16::MAX) {
            return Err(LatticeError::TooManyLevels {
                count: n,
                max: usize::from(u16::MAX),
            });
        }

        let mut index_by_name = BTreeMap::new();
        for (index, name) in spec.levels.iter().enumerate() {
            if index_by_name.insert(name.clone(), index as u16).is_some() {
                return Err(LatticeError::DuplicateLevel { name: name.clone() });
            }
        }

        let mut leq = vec![false; n * n];
        for index in 0..n {
            leq[index * n + index] = true;
        }
        for (lower, upper) in &spec.order {
            let lo = lookup(&index_by_name, lower)?;
            let up = lookup(&index_by_name, upper)?;
            leq[usize::from(lo) * n + usize::from(up)] = true;
        }

        // Warshall closure over the declared edges.
        for k in 0..n {
            for a in 0..n {
                if leq[a * n + k] {
                    for b in 0..n {
                        if leq[k * n + b] {
                            leq[a * n + b] = true;
                        }
                    }
                }
            }
        }

        for a in 0..n {
            for b in (a + 1)..n {
                if leq[a * n + b] && leq[b * n + a] {
                    return Err(LatticeError::OrderCycle {
                        a: spec.levels[a].clone(),
                        b: spec.levels[b].clone(),
                    });
                }
            }
        }

        let mut join = vec![0u16; n * n];
        let mut meet = vec![0u16; n * n];
        for a in 0..n {
            for b in 0..n {
                let lub =
                    least_upper_bound(&leq, n, a, b).ok_or_else(|| LatticeError::NoUniqueJoin {
                        a: spec.levels[a].clone(),
                        b: spec.levels[b].clone(),
                    })?;
                let glb = greatest_lower_bound(&leq, n, a, b).ok_or_else(|| {
                    LatticeError::NoUniqueMeet {
                        a: spec.levels[a].clone(),
                        b: spec.levels[b].clone(),
                    }
                })?;
                join[a * n + b] = lub as u16;
                meet[a * n + b] = glb as u16;
            }
        }

        // With every pairwise bound present, folding reaches the extremes.
        let mut bottom = 0usize;
        let mut top = 0usize;
        for index in 1..n {
            bottom = usize::from(meet[bottom * n + index]);
            top = usize::from(join[top * n + index]);
        }

        Ok(Self {
            names: spec.levels.clone(),
            index_by_name,
            leq,
            join,
            meet,
            bottom: bottom as u16,
            top: top as u16,
        })
    }

    /// Parses a JSON `LatticeSpec` and builds the lattice from it.
    pub fn from_json_str(text: &str) -> Result<Self, LatticeError> {
        let spec: LatticeSpec = serde_json::from_str(text).map_err(|err| {
            LatticeError::InvalidSpec {
                detail: err.to_string(),
            }
        })?;
        Self::from_spec(&spec)
    }

    /// Whether `a` flows to `b`.
    pub fn leq(&self, a: SecurityLevel, b: SecurityLevel) -> bool {
        self.leq[a.index() * self.names.len() + b.index()]
    }

    /// Least upper bound of `a` and `b`.
    pub fn join(&self, a: SecurityLevel, b: SecurityLevel) -> SecurityLevel {
        SecurityLevel(self.join[a.index() * self.names.len() + b.index()])
    }

    /// Greatest lower bound of `a` and `b`.
    pub fn meet(&self, a: SecurityLevel, b: SecurityLevel) -> SecurityLevel {
        SecurityLevel(self.meet[a.index() * self.names.len() + b.index()])
    }

    /// Joins every operand onto `base`.
    pub fn join_all(&self, base: SecurityLevel, operands: &[SecurityLevel]) -> SecurityLevel {
        operands
            .iter()
            .fold(base, |acc, operand| self.join(acc, *operand))
    }

    pub fn bottom(&self) -> SecurityLevel {
        SecurityLevel(self.bottom)
    }

    pub fn top(&self) -> SecurityLevel {
        SecurityLevel(self.top)
    }

    /// Resolves a configured level name.
    pub fn level(&self, name: &str) -> Result<SecurityLevel, LatticeError> {
        lookup(&self.index_by_name, name).map(SecurityLevel)
    }

    /// Display name of a level minted by this lattice.
    pub fn name(&self, level: SecurityLevel) -> &str {
        &self.names[level.index()]
    }

    pub fn level_count(&self) -> usize {
        self.names.len()
    }
}

impl fmt::Display for SecurityLattice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lattice[{}]", self.names.join(", "))
    }
}

fn lookup(index_by_name: &BTreeMap<String, u16>, name: &str) -> Result<u16, LatticeError> {
    index_by_name
        .get(name)
        .copied()
        .ok_or_else(|| LatticeError::UnknownLevel {
            name: name.to_string(),
        })
}

fn least_upper_bound(leq: &[bool], n: usize, a: usize, b: usize) -> Option<usize> {
    let candidates: Vec<usize> = (0..n)
        .filter(|&c| leq[a * n + c] && leq[b * n + c])
        .collect();
    candidates
        .iter()
        .copied()
        .find(|&c| candidates.iter().all(|&d| leq[c * n + d]))
}

fn greatest_lower_bound(leq: &[bool], n: usize, a: usize, b: usize) -> Option<usize> {
    let candidates: Vec<usize> = (0..n)
        .filter(|&c| leq[c * n + a] && leq[c * n + b])
        .collect();
    candidates
        .iter()
        .copied()
        .find(|&c| candidates.iter().all(|&d| leq[d * n + c]))
}
