//! Process-wide tracking state: the object/field map, the global PC, the
//! frame stack, and the cross-invocation call channel.
//!
//! The registry is explicit state, never an ambient global: construct one,
//! wrap it in an `Arc`, and hand the handle to every `InvocationMonitor`.
//! Multiple independent registries may coexist in one process. The interior
//! sits behind a mutex so the shared field map stays serialized; the
//! supported discipline is the single-threaded strict call/return nesting of
//! the instrumented program.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::error::MonitorError;
use crate::flow_event::FlowEvent;
use crate::security_lattice::{SecurityLattice, SecurityLevel};

// ---------------------------------------------------------------------------
// ObjectId — identity token minted by the registry
// ---------------------------------------------------------------------------

/// Opaque identity of a tracked object.
///
/// An index into the registry's append-only object table. Identity is by
/// token: two equal-but-distinct monitored objects receive distinct ids, and
/// an id stays valid for the registry's whole lifetime. Ids from one
/// registry are meaningless in another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(usize);

impl ObjectId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// TrackedSlot — one level plus its one-shot initialization exemption
// ---------------------------------------------------------------------------

/// Level of one local or field, with the one-shot flag that exempts the next
/// write from the no-sensitive-upgrade check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TrackedSlot {
    pub(crate) level: SecurityLevel,
    pub(crate) init_exempt: bool,
}

impl TrackedSlot {
    pub(crate) fn new(level: SecurityLevel) -> Self {
        Self {
            level,
            init_exempt: false,
        }
    }
}

// ---------------------------------------------------------------------------
// RegistryState — the interior behind the mutex
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct RegistryState {
    pub(crate) objects: Vec<BTreeMap<String, TrackedSlot>>,
    pub(crate) global_pc: SecurityLevel,
    pub(crate) frames: Vec<BTreeMap<String, TrackedSlot>>,
    // Frames released out of order: still buried under open frames, popped
    // as the stack unwinds down to them.
    pub(crate) orphaned_frames: BTreeSet<usize>,
    // Call channel: populated at a call site, consumed inside the callee
    // (arguments) or by the caller after the callee closes (return level).
    pub(crate) argument_buffer: Vec<SecurityLevel>,
    pub(crate) return_level: Option<SecurityLevel>,
    pub(crate) events: Vec<FlowEvent>,
}

impl RegistryState {
    pub(crate) fn field_slot_mut(
        &mut self,
        object: ObjectId,
        field: &str,
    ) -> Result<&mut TrackedSlot, MonitorError> {
        let fields = self
            .objects
            .get_mut(object.index())
            .ok_or(MonitorError::UnknownObject { object })?;
        fields.get_mut(field).ok_or_else(|| MonitorError::UnknownField {
            object,
            field: field.to_string(),
        })
    }

    /// Releases the frame at `frame`: popped immediately when it is on top,
    /// otherwise marked and popped once the frames above it unwind. Keeps
    /// the depth invariant (depth == open monitors) eventually exact even
    /// after an out-of-order release.
    pub(crate) fn release_frame(&mut self, frame: usize) {
        if self.frames.len() == frame + 1 {
            self.frames.pop();
            self.sweep_orphaned_frames();
        } else if frame < self.frames.len() {
            self.orphaned_frames.insert(frame);
        }
    }

    fn sweep_orphaned_frames(&mut self) {
        while !self.frames.is_empty() && self.orphaned_frames.remove(&(self.frames.len() - 1)) {
            self.frames.pop();
        }
    }

    pub(crate) fn local_slot_mut(
        &mut self,
        frame: usize,
        local: &str,
    ) -> Result<&mut TrackedSlot, MonitorError> {
        let frame = self
            .frames
            .get_mut(frame)
            .ok_or_else(|| MonitorError::FrameImbalance {
                detail: format!("frame {frame} is gone"),
            })?;
        frame.get_mut(local).ok_or_else(|| MonitorError::UnknownLocal {
            local: local.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// ObjectRegistry
// ---------------------------------------------------------------------------

/// Shared tracking state for one monitored execution.
pub struct ObjectRegistry {
    lattice: SecurityLattice,
    state: Mutex<RegistryState>,
}

impl ObjectRegistry {
    pub fn new(lattice: SecurityLattice) -> Self {
        let bottom = lattice.bottom();
        Self {
            lattice,
            state: Mutex::new(RegistryState {
                objects: Vec::new(),
                global_pc: bottom,
                frames: Vec::new(),
                orphaned_frames: BTreeSet::new(),
                argument_buffer: Vec::new(),
                return_level: None,
                events: Vec::new(),
            }),
        }
    }

    pub fn lattice(&self) -> &SecurityLattice {
        &self.lattice
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock()
    }

    pub(crate) fn push_event(&self, event: FlowEvent) {
        self.lock().events.push(event);
    }

    /// Drains the structured events recorded so far.
    pub fn drain_events(&self) -> Vec<FlowEvent> {
        std::mem::take(&mut self.lock().events)
    }

    // -- Object/field map --

    /// Mints a fresh object identity. The table is append-only; an identity
    /// exists exactly once and registration never resets field levels.
    pub fn register_object(&self) -> ObjectId {
        let mut state = self.lock();
        state.objects.push(BTreeMap::new());
        ObjectId(state.objects.len() - 1)
    }

    pub fn contains_object(&self, object: ObjectId) -> bool {
        object.index() < self.lock().objects.len()
    }

    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    /// Creates a field at the lattice bottom. Unconditional: object
    /// initialization is exempt from the no-sensitive-upgrade check.
    pub fn add_field(&self, object: ObjectId, field: &str) -> Result<(), MonitorError> {
        self.set_field(object, field, self.lattice.bottom())
    }

    /// Creates or overwrites a field entry. Unconditional, no NSU check.
    pub fn set_field(
        &self,
        object: ObjectId,
        field: &str,
        level: SecurityLevel,
    ) -> Result<(), MonitorError> {
        let mut state = self.lock();
        let fields = state
            .objects
            .get_mut(object.index())
            .ok_or(MonitorError::UnknownObject { object })?;
        fields.insert(field.to_string(), TrackedSlot::new(level));
        Ok(())
    }

    /// Level of a previously registered field. Absence of the object or the
    /// field is an internal fault, never a security result.
    pub fn field_level(&self, object: ObjectId, field: &str) -> Result<SecurityLevel, MonitorError> {
        let mut state = self.lock();
        state.field_slot_mut(object, field).map(|slot| slot.level)
    }

    // -- Global PC --

    /// Unguarded; used only by global-initialization code.
    pub fn set_global_pc(&self, level: SecurityLevel) {
        self.lock().global_pc = level;
    }

    pub fn global_pc(&self) -> SecurityLevel {
        self.lock().global_pc
    }

    // -- Frame stack --

    /// Pushes an empty variable frame and returns its index.
    pub(crate) fn push_frame(&self) -> usize {
        let mut state = self.lock();
        state.frames.push(BTreeMap::new());
        state.frames.len() - 1
    }

    /// Pops the top frame. Popping an empty stack is the fatal
    /// `FrameImbalance` fault.
    pub(crate) fn pop_frame(&self) -> Result<(), MonitorError> {
        let mut state = self.lock();
        match state.frames.pop() {
            Some(_) => {
                state.sweep_orphaned_frames();
                Ok(())
            }
            None => Err(MonitorError::FrameImbalance {
                detail: "pop on empty frame stack".to_string(),
            }),
        }
    }

    /// Current depth of the frame stack; equals the number of open
    /// invocation monitors. Introspection for tests.
    pub fn frame_depth(&self) -> usize {
        self.lock().frames.len()
    }
}

impl fmt::Debug for ObjectRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ObjectRegistry")
            .field("lattice", &self.lattice.to_string())
            .field("objects", &state.objects.len())
            .field("frame_depth", &state.frames.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ObjectRegistry {
        ObjectRegistry::new(SecurityLattice::two_point())
    }

    // -- Object table --

    #[test]
    fn register_mints_distinct_identities() {
        let reg = registry();
        assert_eq!(reg.object_count(), 0);
        let a = reg.register_object();
        let b = reg.register_object();
        assert_ne!(a, b);
        assert_eq!(reg.object_count(), 2);
        assert!(reg.contains_object(a));
        assert!(reg.contains_object(b));
    }

    #[test]
    fn fields_of_distinct_objects_are_independent() {
        let reg = registry();
        let high = reg.lattice().top();
        let a = reg.register_object();
        let b = reg.register_object();

        reg.add_field(a, "balance").unwrap();
        reg.set_field(b, "balance", high).unwrap();

        assert_eq!(reg.field_level(a, "balance").unwrap(), reg.lattice().bottom());
        assert_eq!(reg.field_level(b, "balance").unwrap(), high);

        reg.set_field(a, "balance", high).unwrap();
        assert_eq!(reg.field_level(b, "balance").unwrap(), high);
    }

    #[test]
    fn set_field_overwrites_unconditionally() {
        let reg = registry();
        let id = reg.register_object();
        let high = reg.lattice().top();
        reg.set_field(id, "f", high).unwrap();
        reg.set_field(id, "f", reg.lattice().bottom()).unwrap();
        assert_eq!(reg.field_level(id, "f").unwrap(), reg.lattice().bottom());
    }

    #[test]
    fn unknown_object_and_field_are_faults() {
        let reg = registry();
        let id = reg.register_object();

        let stray = ObjectId(17);
        let err = reg.field_level(stray, "f").unwrap_err();
        assert_eq!(err, MonitorError::UnknownObject { object: stray });
        assert!(!err.is_security_verdict());

        let err = reg.field_level(id, "missing").unwrap_err();
        assert_eq!(
            err,
            MonitorError::UnknownField {
                object: id,
                field: "missing".to_string(),
            }
        );

        let err = reg.set_field(stray, "f", reg.lattice().bottom()).unwrap_err();
        assert_eq!(err, MonitorError::UnknownObject { object: stray });
    }

    // -- Global PC --

    #[test]
    fn global_pc_defaults_to_bottom() {
        let reg = registry();
        assert_eq!(reg.global_pc(), reg.lattice().bottom());
        reg.set_global_pc(reg.lattice().top());
        assert_eq!(reg.global_pc(), reg.lattice().top());
    }

    // -- Frame stack --

    #[test]
    fn frame_stack_is_lifo() {
        let reg = registry();
        assert_eq!(reg.frame_depth(), 0);
        let first = reg.push_frame();
        let second = reg.push_frame();
        assert_eq!((first, second), (0, 1));
        assert_eq!(reg.frame_depth(), 2);
        reg.pop_frame().unwrap();
        assert_eq!(reg.frame_depth(), 1);
        reg.pop_frame().unwrap();
        assert_eq!(reg.frame_depth(), 0);
    }

    #[test]
    fn pop_on_empty_stack_is_a_fault() {
        let reg = registry();
        let err = reg.pop_frame().unwrap_err();
        assert_eq!(
            err,
            MonitorError::FrameImbalance {
                detail: "pop on empty frame stack".to_string(),
            }
        );
    }

    // -- Independent registries --

    #[test]
    fn registries_do_not_share_state() {
        let a = registry();
        let b = registry();
        a.register_object();
        a.set_global_pc(a.lattice().top());
        assert_eq!(b.object_count(), 0);
        assert_eq!(b.global_pc(), b.lattice().bottom());
    }

    // -- Call channel --

    #[test]
    fn call_channel_holds_arguments_and_return_level() {
        let reg = registry();
        let high = reg.lattice().top();
        {
            let mut state = reg.lock();
            state.argument_buffer = vec![high];
            state.return_level = Some(high);
        }
        let mut state = reg.lock();
        assert_eq!(state.argument_buffer, vec![high]);
        assert_eq!(state.return_level.take(), Some(high));
        assert_eq!(state.return_level, None);
    }
}
