//! Per-invocation monitor: the object the instrumenter actually drives.
//!
//! One `InvocationMonitor` per active procedure invocation. `open` pushes a
//! registry frame and binds to it; `close` pops exactly that frame and must
//! be reached on every exit path. Dropping an unclosed monitor still
//! releases the frame, so an unwinding host cannot leak it.
//!
//! Writes go through the no-sensitive-upgrade check; reads are pure.
//! Operand levels are passed explicitly to each write and joined with the
//! ambient PC internally, so there is no hidden accumulator to reset
//! between statements.

use std::sync::Arc;

use crate::branch_scope::{BranchPcStack, BranchToken, ScopeId};
use crate::error::MonitorError;
use crate::flow_event::{FlowEvent, FlowOperation, FlowOutcome};
use crate::object_registry::{ObjectId, ObjectRegistry, TrackedSlot};
use crate::security_lattice::{SecurityLattice, SecurityLevel};

// ---------------------------------------------------------------------------
// NSU check
// ---------------------------------------------------------------------------

/// Commits a checked write to `slot`.
///
/// The write is a sensitive upgrade, and therefore forbidden, when the
/// ambient PC does not flow to the slot's current level and the slot's
/// one-shot initialization exemption is not armed. A permitted write
/// overwrites the level with `candidate` and consumes the exemption; a
/// forbidden one leaves the slot untouched.
fn checked_write(
    lattice: &SecurityLattice,
    slot: &mut TrackedSlot,
    candidate: SecurityLevel,
    pc: SecurityLevel,
    entity: &str,
    invocation: &str,
) -> Result<SecurityLevel, MonitorError> {
    if !slot.init_exempt && !lattice.leq(pc, slot.level) {
        return Err(MonitorError::IllegalFlow {
            entity: entity.to_string(),
            old_level: lattice.name(slot.level).to_string(),
            pc_level: lattice.name(pc).to_string(),
            invocation: invocation.to_string(),
        });
    }
    slot.level = candidate;
    slot.init_exempt = false;
    Ok(candidate)
}

// ---------------------------------------------------------------------------
// InvocationMonitor
// ---------------------------------------------------------------------------

/// Tracker for one open invocation: its variable frame, its branch-PC
/// stack, and its side of the call channel.
#[derive(Debug)]
pub struct InvocationMonitor {
    registry: Arc<ObjectRegistry>,
    frame_index: usize,
    branch_pcs: BranchPcStack,
    label: String,
    closed: bool,
}

impl InvocationMonitor {
    /// Opens an invocation: pushes a fresh frame and binds to it.
    ///
    /// `label` identifies the invocation in events and verdicts; the
    /// instrumenter passes the method signature it is replaying.
    pub fn open(registry: Arc<ObjectRegistry>, label: impl Into<String>) -> Self {
        let label = label.into();
        let frame_index = registry.push_frame();
        let monitor = Self {
            registry,
            frame_index,
            branch_pcs: BranchPcStack::new(),
            label,
            closed: false,
        };
        monitor.emit_ok(FlowOperation::Open, None, None, None);
        monitor
    }

    /// Closes the invocation, releasing the bound frame.
    ///
    /// Must be reached once on every exit path. The frame is released even
    /// when a fault is reported: an out-of-order close finds its frame
    /// buried under open nested frames, and a buried frame is marked and
    /// popped as the frames above it unwind, so the registry never leaks
    /// depth. The fault itself remains fatal.
    pub fn close(mut self) -> Result<(), MonitorError> {
        self.closed = true;
        let open_scopes = self.branch_pcs.depth();
        let result = {
            let mut state = self.registry.lock();
            let depth = state.frames.len();
            let buried = depth != self.frame_index + 1;
            state.release_frame(self.frame_index);
            if buried {
                Err(MonitorError::FrameImbalance {
                    detail: format!(
                        "close of frame {} while the stack depth is {depth}",
                        self.frame_index
                    ),
                })
            } else if open_scopes > 0 {
                Err(MonitorError::UnclosedScopes { open: open_scopes })
            } else {
                Ok(())
            }
        };
        match &result {
            Ok(()) => self.emit_ok(FlowOperation::Close, None, None, None),
            Err(err) => self.emit_err(FlowOperation::Close, None, None, err),
        }
        result
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    /// Number of branch scopes currently open in this invocation.
    pub fn branch_depth(&self) -> usize {
        self.branch_pcs.depth()
    }

    /// Ambient PC: the global PC joined with every open branch entry.
    pub fn current_pc(&self) -> SecurityLevel {
        let base = self.registry.global_pc();
        self.branch_pcs.current(self.registry.lattice(), base)
    }

    // -- Prologue: objects, fields, locals --

    /// Mints a fresh object identity in the registry.
    pub fn register_object(&mut self) -> ObjectId {
        let object = self.registry.register_object();
        let entity = object.to_string();
        self.emit_ok(FlowOperation::RegisterObject, Some(&entity), None, None);
        object
    }

    /// Creates a field at the lattice bottom; unconditional, no NSU check.
    pub fn add_field(&mut self, object: ObjectId, field: &str) -> Result<(), MonitorError> {
        let result = self.registry.add_field(object, field);
        match &result {
            Ok(()) => self.emit_ok(FlowOperation::AddField, Some(field), None, None),
            Err(err) => self.emit_err(FlowOperation::AddField, Some(field), None, err),
        }
        result
    }

    /// Creates or overwrites a field entry; unconditional, no NSU check.
    pub fn set_field(
        &mut self,
        object: ObjectId,
        field: &str,
        level: SecurityLevel,
    ) -> Result<(), MonitorError> {
        let result = self.registry.set_field(object, field, level);
        match &result {
            Ok(()) => self.emit_ok(FlowOperation::SetField, Some(field), Some(level), None),
            Err(err) => self.emit_err(FlowOperation::SetField, Some(field), None, err),
        }
        result
    }

    /// Adds a local at the lattice bottom.
    pub fn add_local(&mut self, local: &str) -> Result<(), MonitorError> {
        self.add_local_with_level(local, self.registry.lattice().bottom())
    }

    /// Adds a local at the given level (the static system's emitted default).
    pub fn add_local_with_level(
        &mut self,
        local: &str,
        level: SecurityLevel,
    ) -> Result<(), MonitorError> {
        let result = {
            let mut state = self.registry.lock();
            let frame = state.frames.get_mut(self.frame_index).ok_or_else(|| {
                MonitorError::FrameImbalance {
                    detail: format!("frame {} is gone", self.frame_index),
                }
            });
            match frame {
                Err(err) => Err(err),
                Ok(frame) => {
                    if frame.contains_key(local) {
                        Err(MonitorError::DuplicateLocal {
                            local: local.to_string(),
                        })
                    } else {
                        frame.insert(local.to_string(), TrackedSlot::new(level));
                        Ok(())
                    }
                }
            }
        };
        match &result {
            Ok(()) => self.emit_ok(FlowOperation::AddLocal, Some(local), Some(level), None),
            Err(err) => self.emit_err(FlowOperation::AddLocal, Some(local), None, err),
        }
        result
    }

    // -- Reads (pure) --

    /// Level of a local in this invocation's frame.
    pub fn local_level(&self, local: &str) -> Result<SecurityLevel, MonitorError> {
        let mut state = self.registry.lock();
        state
            .local_slot_mut(self.frame_index, local)
            .map(|slot| slot.level)
    }

    /// Level of a previously registered field.
    pub fn field_level(&self, object: ObjectId, field: &str) -> Result<SecurityLevel, MonitorError> {
        self.registry.field_level(object, field)
    }

    // -- Initialization exemptions --

    /// Arms the one-shot exemption: the next write to the local skips the
    /// NSU check regardless of the ambient PC.
    pub fn initialize_local(&mut self, local: &str) -> Result<(), MonitorError> {
        let result = {
            let mut state = self.registry.lock();
            state
                .local_slot_mut(self.frame_index, local)
                .map(|slot| slot.init_exempt = true)
        };
        match &result {
            Ok(()) => self.emit_ok(FlowOperation::InitializeLocal, Some(local), None, None),
            Err(err) => self.emit_err(FlowOperation::InitializeLocal, Some(local), None, err),
        }
        result
    }

    /// Field variant of `initialize_local`.
    pub fn initialize_field(&mut self, object: ObjectId, field: &str) -> Result<(), MonitorError> {
        let result = {
            let mut state = self.registry.lock();
            state
                .field_slot_mut(object, field)
                .map(|slot| slot.init_exempt = true)
        };
        match &result {
            Ok(()) => self.emit_ok(FlowOperation::InitializeField, Some(field), None, None),
            Err(err) => self.emit_err(FlowOperation::InitializeField, Some(field), None, err),
        }
        result
    }

    // -- Checked writes --

    /// Assigns to a local: candidate = join(operands, ambient PC), gated by
    /// the NSU check. On success the local's level becomes the candidate;
    /// on `IllegalFlow` the local is untouched.
    pub fn assign_local(
        &mut self,
        local: &str,
        operands: &[SecurityLevel],
    ) -> Result<SecurityLevel, MonitorError> {
        let pc = self.current_pc();
        let lattice = self.registry.lattice();
        let candidate = lattice.join_all(pc, operands);
        let result = {
            let mut state = self.registry.lock();
            state
                .local_slot_mut(self.frame_index, local)
                .and_then(|slot| {
                    checked_write(lattice, slot, candidate, pc, local, &self.label)
                })
        };
        match &result {
            Ok(level) => self.emit_ok(FlowOperation::AssignLocal, Some(local), Some(*level), Some(pc)),
            Err(err) => self.emit_err(FlowOperation::AssignLocal, Some(local), Some(pc), err),
        }
        result
    }

    /// Assigns to a field; identical contract to `assign_local`.
    pub fn assign_field(
        &mut self,
        object: ObjectId,
        field: &str,
        operands: &[SecurityLevel],
    ) -> Result<SecurityLevel, MonitorError> {
        let pc = self.current_pc();
        let lattice = self.registry.lattice();
        let candidate = lattice.join_all(pc, operands);
        let result = {
            let mut state = self.registry.lock();
            state.field_slot_mut(object, field).and_then(|slot| {
                checked_write(lattice, slot, candidate, pc, field, &self.label)
            })
        };
        match &result {
            Ok(level) => self.emit_ok(FlowOperation::AssignField, Some(field), Some(*level), Some(pc)),
            Err(err) => self.emit_err(FlowOperation::AssignField, Some(field), Some(pc), err),
        }
        result
    }

    // -- Branch scopes --

    /// Enters a branch guarded by a condition of the given level: the entry
    /// records `join(level, current PC)`, raising the ambient PC for the
    /// branch body. Returns the token its pop consumes.
    pub fn push_branch_pc(&mut self, level: SecurityLevel, scope_id: ScopeId) -> BranchToken {
        let raised = self.registry.lattice().join(level, self.current_pc());
        let token = self.branch_pcs.push(raised, scope_id);
        let entity = token.scope_id().to_string();
        self.emit_ok(FlowOperation::BranchPush, Some(&entity), Some(raised), None);
        token
    }

    /// Leaves the branch scope the token belongs to. A token that does not
    /// match the most recent open scope is the fatal `ScopeMismatch` fault.
    pub fn pop_branch_pc(&mut self, token: BranchToken) -> Result<(), MonitorError> {
        let entity = token.scope_id().to_string();
        let result = self.branch_pcs.pop(token);
        match &result {
            Ok(()) => self.emit_ok(FlowOperation::BranchPop, Some(&entity), None, None),
            Err(err) => self.emit_err(FlowOperation::BranchPop, Some(&entity), None, err),
        }
        result
    }

    // -- Call channel --

    /// Captures the levels of the actual arguments at a call site, in
    /// parameter order. Overwrites any previous buffer.
    pub fn store_argument_levels(&mut self, levels: &[SecurityLevel]) {
        self.registry.lock().argument_buffer = levels.to_vec();
        self.emit_ok(FlowOperation::StoreArguments, None, None, None);
    }

    /// Binds parameter `index` to `local`. Parameter binding mirrors
    /// initialization and is exempt from the NSU check; the local's level
    /// becomes exactly the buffered argument level, untouched by the
    /// ambient PC.
    pub fn bind_argument(
        &mut self,
        index: usize,
        local: &str,
    ) -> Result<SecurityLevel, MonitorError> {
        let pc = self.current_pc();
        let result = {
            let mut state = self.registry.lock();
            let len = state.argument_buffer.len();
            match state.argument_buffer.get(index).copied() {
                None => Err(MonitorError::ArgumentIndexOutOfRange { index, len }),
                Some(argument) => {
                    state
                        .local_slot_mut(self.frame_index, local)
                        .map(|slot| {
                            slot.level = argument;
                            slot.init_exempt = false;
                            slot.level
                        })
                }
            }
        };
        match &result {
            Ok(level) => self.emit_ok(FlowOperation::BindArgument, Some(local), Some(*level), Some(pc)),
            Err(err) => self.emit_err(FlowOperation::BindArgument, Some(local), Some(pc), err),
        }
        result
    }

    /// Records this invocation's return level: join(operands, ambient PC).
    pub fn record_return_level(&mut self, operands: &[SecurityLevel]) -> SecurityLevel {
        let pc = self.current_pc();
        let level = self.registry.lattice().join_all(pc, operands);
        self.registry.lock().return_level = Some(level);
        self.emit_ok(FlowOperation::RecordReturn, None, Some(level), Some(pc));
        level
    }

    /// Takes the callee's recorded return level, exactly once, after the
    /// callee closed. The caller feeds it into the operand list of the
    /// assignment receiving the call result.
    pub fn consume_return_level(&mut self) -> Result<SecurityLevel, MonitorError> {
        let result = self
            .registry
            .lock()
            .return_level
            .take()
            .ok_or(MonitorError::ReturnChannelEmpty);
        match &result {
            Ok(level) => self.emit_ok(FlowOperation::ConsumeReturn, None, Some(*level), None),
            Err(err) => self.emit_err(FlowOperation::ConsumeReturn, None, None, err),
        }
        result
    }

    // -- Test support --

    /// Unchecked overwrite of a local's level. Not part of the instrumented
    /// protocol; forcing a level does not re-arm the initialization
    /// exemption.
    pub fn set_local_level(&mut self, local: &str, level: SecurityLevel) -> Result<(), MonitorError> {
        let mut state = self.registry.lock();
        state
            .local_slot_mut(self.frame_index, local)
            .map(|slot| slot.level = level)
    }

    /// Unchecked overwrite of a field's level; see `set_local_level`.
    pub fn set_field_level(
        &mut self,
        object: ObjectId,
        field: &str,
        level: SecurityLevel,
    ) -> Result<(), MonitorError> {
        let mut state = self.registry.lock();
        state
            .field_slot_mut(object, field)
            .map(|slot| slot.level = level)
    }

    // -- Event plumbing --

    fn emit_ok(
        &self,
        operation: FlowOperation,
        entity: Option<&str>,
        level: Option<SecurityLevel>,
        pc: Option<SecurityLevel>,
    ) {
        let mut event = FlowEvent::new(&self.label, operation, FlowOutcome::Pass);
        if let Some(entity) = entity {
            event = event.with_entity(entity);
        }
        if let Some(level) = level {
            event = event.with_level(self.registry.lattice().name(level));
        }
        if let Some(pc) = pc {
            event = event.with_pc(self.registry.lattice().name(pc));
        }
        self.registry.push_event(event);
    }

    fn emit_err(
        &self,
        operation: FlowOperation,
        entity: Option<&str>,
        pc: Option<SecurityLevel>,
        err: &MonitorError,
    ) {
        let outcome = if err.is_security_verdict() {
            FlowOutcome::IllegalFlow
        } else {
            FlowOutcome::Fault
        };
        let mut event =
            FlowEvent::new(&self.label, operation, outcome).with_error_code(err.stable_code());
        if let Some(entity) = entity {
            event = event.with_entity(entity);
        }
        if let Some(pc) = pc {
            event = event.with_pc(self.registry.lattice().name(pc));
        }
        self.registry.push_event(event);
    }
}

impl Drop for InvocationMonitor {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Guaranteed release on unwinding exits. A frame still buried under
        // open nested frames is marked and popped once those unwind.
        let mut state = self.registry.lock();
        let on_top = state.frames.len() == self.frame_index + 1;
        state.release_frame(self.frame_index);
        if on_top {
            state.events.push(FlowEvent::new(
                &self.label,
                FlowOperation::DropRelease,
                FlowOutcome::Pass,
            ));
        }
    }
}
