#![no_main]

use std::sync::Arc;

use labelflow_monitor::branch_scope::{BranchToken, ScopeId};
use labelflow_monitor::invocation::InvocationMonitor;
use labelflow_monitor::object_registry::{ObjectId, ObjectRegistry};
use labelflow_monitor::security_lattice::SecurityLattice;
use libfuzzer_sys::fuzz_target;

const MAX_STEPS: usize = 256;
const MAX_DEPTH: usize = 8;

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }

    run_monitor_program(data);
});

struct OpenInvocation {
    monitor: InvocationMonitor,
    tokens: Vec<BranchToken>,
}

// Drives a well-nested but otherwise arbitrary call sequence. Security
// verdicts and instrumentation faults are expected outputs; panics and a
// leaked frame are bugs.
fn run_monitor_program(data: &[u8]) {
    let registry = Arc::new(ObjectRegistry::new(SecurityLattice::two_point()));
    let mut stack: Vec<OpenInvocation> = Vec::new();
    let mut objects: Vec<ObjectId> = Vec::new();

    for (step, chunk) in data.chunks(2).take(MAX_STEPS).enumerate() {
        let op = chunk[0] % 12;
        let detail = chunk.get(1).copied().unwrap_or(0);
        let level = if detail % 2 == 0 {
            registry.lattice().bottom()
        } else {
            registry.lattice().top()
        };
        let local = format!("local_{}", detail % 4);

        match op {
            0 => {
                if stack.len() < MAX_DEPTH {
                    let monitor = InvocationMonitor::open(
                        Arc::clone(&registry),
                        format!("fuzz.Body.step{step}()"),
                    );
                    stack.push(OpenInvocation {
                        monitor,
                        tokens: Vec::new(),
                    });
                }
            }
            1 => {
                if let Some(open) = stack.pop() {
                    let _ = open.monitor.close();
                }
            }
            2 => {
                if let Some(open) = stack.last_mut() {
                    let _ = open.monitor.add_local(&local);
                }
            }
            3 => {
                if let Some(open) = stack.last_mut() {
                    let _ = open.monitor.assign_local(&local, &[level]);
                }
            }
            4 => {
                if let Some(open) = stack.last_mut() {
                    let _ = open.monitor.initialize_local(&local);
                }
            }
            5 => {
                if let Some(open) = stack.last_mut() {
                    let scope = ScopeId::derive("fuzz.Body", u32::from(detail));
                    let token = open.monitor.push_branch_pc(level, scope);
                    open.tokens.push(token);
                }
            }
            6 => {
                if let Some(open) = stack.last_mut() {
                    if let Some(token) = open.tokens.pop() {
                        let _ = open.monitor.pop_branch_pc(token);
                    }
                }
            }
            7 => {
                if let Some(open) = stack.last_mut() {
                    objects.push(open.monitor.register_object());
                }
            }
            8 => {
                if let (Some(open), Some(object)) = (stack.last_mut(), objects.last()) {
                    let _ = open.monitor.add_field(*object, "field");
                    let _ = open.monitor.assign_field(*object, "field", &[level]);
                }
            }
            9 => {
                if let Some(open) = stack.last_mut() {
                    open.monitor.store_argument_levels(&[level, level]);
                    let _ = open.monitor.bind_argument(usize::from(detail % 3), &local);
                }
            }
            10 => {
                if let Some(open) = stack.last_mut() {
                    open.monitor.record_return_level(&[level]);
                }
            }
            _ => {
                if let Some(open) = stack.last_mut() {
                    let _ = open.monitor.consume_return_level();
                }
            }
        }
    }

    // Whatever the program did, unwinding the monitors innermost-first
    // must drain the frame stack completely.
    while let Some(open) = stack.pop() {
        drop(open);
    }
    assert_eq!(registry.frame_depth(), 0);
}
