//! Guard descriptors and the side-exit protocol (spec.md §3 "Guard
//! Descriptor", §4.6 "Guard exits").
//!
//! Grounded on `trax_interp.py`'s `GuardFrame`/`GuardHandler` and the
//! reconstruction loop in `Interpreter.run` (the `compiled_traces` branch
//! that rebuilds `self.stack`/`self.call_stack` from `return_values`
//! zipped against `guard_handler.values_to_keep`).

use crate::bytecode::{Frame, MethodKey, ProgramPoint};
use crate::ir::NodeId;
use crate::value::Value;

pub type GuardId = u32;

/// The interpreter-frame shape a single trace call-depth needs to be
/// reconstructed: which method/pc it resumes at, and which IR values (in
/// order) become that frame's locals (spec.md §4.3 "Shadow call stack").
#[derive(Debug, Clone)]
pub struct FrameShape {
    pub method_key: MethodKey,
    pub pc: usize,
    /// IR values that, once restored through the exit buffer, repopulate
    /// this frame's locals in slot order.
    pub locals: Vec<NodeId>,
    /// IR values that repopulate this frame's eval stack, bottom to top.
    pub eval_stack: Vec<NodeId>,
}

/// Everything needed to rebuild interpreter state after a guard fails:
/// every call-stack frame from outermost to the one the guard actually
/// fired in, plus the flat list of values the native exit buffer carries
/// back (spec.md §3 "Guard Descriptor").
#[derive(Debug, Clone)]
pub struct ExitDescriptor {
    pub frames: Vec<FrameShape>,
    pub values_to_keep: Vec<NodeId>,
}

/// Dense, by-`GuardId`, table of every guard a trace can fail at.
///
/// Grounded on `trax_interp.py`'s `self.guard_handlers` list (`guard_id`
/// is simply the index a handler was appended at).
#[derive(Debug, Default)]
pub struct ExitTable {
    descriptors: Vec<ExitDescriptor>,
}

impl ExitTable {
    pub fn new() -> Self {
        ExitTable::default()
    }

    /// Register a new guard, returning its id (spec.md `new_guard_handler`).
    pub fn push(&mut self, descriptor: ExitDescriptor) -> GuardId {
        let id = self.descriptors.len() as GuardId;
        self.descriptors.push(descriptor);
        id
    }

    pub fn get(&self, id: GuardId) -> &ExitDescriptor {
        &self.descriptors[id as usize]
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// The exit buffer every compiled trace shares must be large enough
    /// for this trace's hungriest guard (SPEC_FULL.md §5 "`call_function`
    /// return-buffer sizing"): `max(values_to_keep.len())` over every
    /// guard registered so far.
    pub fn buffer_len(&self) -> usize {
        self.descriptors.iter().map(|d| d.values_to_keep.len()).max().unwrap_or(0)
    }
}

/// Rebuild the interpreter's program location, top frame, and call stack
/// from a guard's [`ExitDescriptor`] and the native exit buffer it wrote
/// (spec.md §4.6 "Guard exits", mirroring `Interpreter.run`'s
/// `value_mapping` zip-and-restore loop).
///
/// `restored` holds one [`Value`] per `NodeId` named anywhere in
/// `descriptor` (built by zipping `descriptor.values_to_keep` against the
/// raw words the native call wrote into the exit buffer).
pub fn reconstruct(descriptor: &ExitDescriptor, restored: &std::collections::HashMap<NodeId, Value>) -> (ProgramPoint, Vec<Frame>) {
    let mut frames: Vec<Frame> = descriptor
        .frames
        .iter()
        .map(|shape| {
            let mut frame = Frame::new(shape.method_key);
            frame.pc = shape.pc;
            for (i, value_id) in shape.locals.iter().enumerate() {
                frame.set_var(i as u32, restored[value_id]);
            }
            for value_id in &shape.eval_stack {
                frame.eval_stack.push(restored[value_id]);
            }
            frame
        })
        .collect();

    let top = frames.pop().expect("an exit descriptor always names at least one frame");
    let program_point = top.program_point();
    frames.push(top);
    (program_point, frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn buffer_len_tracks_the_largest_guard() {
        let mut table = ExitTable::new();
        table.push(ExitDescriptor { frames: vec![], values_to_keep: vec![0, 1] });
        table.push(ExitDescriptor { frames: vec![], values_to_keep: vec![0, 1, 2, 3] });
        assert_eq!(table.buffer_len(), 4);
    }

    #[test]
    fn empty_table_has_zero_buffer_len() {
        assert_eq!(ExitTable::new().buffer_len(), 0);
    }

    #[test]
    fn reconstruct_restores_locals_and_pc() {
        let descriptor = ExitDescriptor {
            frames: vec![FrameShape { method_key: (3, "loop"), pc: 5, locals: vec![10, 11], eval_stack: vec![] }],
            values_to_keep: vec![10, 11],
        };
        let mut restored = HashMap::new();
        restored.insert(10, Value::from_int(1));
        restored.insert(11, Value::from_int(2));
        let (point, frames) = reconstruct(&descriptor, &restored);
        assert_eq!(point, ((3, "loop"), 5));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].get_var(0).to_int().unwrap(), 1);
        assert_eq!(frames[0].get_var(1).to_int().unwrap(), 2);
    }
}
