//! Dynamic information-flow monitor enforcing noninterference at run time.
//!
//! The monitor attaches a security level, a point on a finite lattice, to
//! every tracked local, object field, and control-flow program counter, and
//! checks at every write that nothing leaks from a more sensitive context
//! into a less sensitive observable. Enforcement is the no-sensitive-upgrade
//! policy: a write to an already-initialized variable may not happen under
//! an ambient PC that does not flow to the variable's current level.
//!
//! An instrumenter drives the monitor: one [`invocation::InvocationMonitor`]
//! per procedure invocation, opened at entry and closed on every exit path,
//! replaying the body's statements as explicit monitor calls. Shared state
//! lives in an explicit [`object_registry::ObjectRegistry`], handed around
//! by `Arc`, never looked up ambiently.

#![forbid(unsafe_code)]

pub mod branch_scope;
pub mod error;
pub mod flow_event;
pub mod invocation;
pub mod object_registry;
pub mod security_lattice;
