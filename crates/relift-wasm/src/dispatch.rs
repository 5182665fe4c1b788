//! Dispatch loop that turns a chunk's flat instruction list into structured control flow.
//!
//! ```text
//! loop                                ;; level L
//!   block                             ;; target t[n-1]
//!     ...
//!       block                         ;; target t[0]
//!         link == t[0] ? br_if 0
//!         ...
//!         link == t[n-1] ? br_if n-1
//!         <instructions before t[0]>
//!       end
//!       <instructions t[0] .. t[1]>
//!     ...
//!   end
//!   <instructions from t[n-1]>
//! end
//! ```
//!
//! Jumping to target `t` means `link = t; br L`. Entering the function with `link` set to a
//! target resumes there; any other value starts at instruction 0.

use std::collections::BTreeSet;

use wasm_encoder::Instruction;

use crate::emitter::Emitter;

pub struct DispatchLoop {
    loop_level: u32,
    /// Sorted targets whose blocks are still open, innermost first.
    pending: Vec<u32>,
}

impl DispatchLoop {
    pub fn open(e: &mut Emitter, targets: &BTreeSet<u32>) -> Self {
        let loop_level = e.loop_();
        let pending: Vec<u32> = targets.iter().copied().collect();
        for _ in &pending {
            e.block();
        }
        let link = e.globals.link();
        for (depth, target) in pending.iter().enumerate() {
            e.global_get(link);
            e.u32_const(*target);
            e.func.instruction(&Instruction::I32Eq);
            e.func.instruction(&Instruction::BrIf(depth as u32));
        }
        Self {
            loop_level,
            pending,
        }
    }

    /// Close the block that lands on instruction `index`, if it is a target.
    pub fn before_instruction(&mut self, e: &mut Emitter, index: u32) {
        if self.pending.first() == Some(&index) {
            self.pending.remove(0);
            e.end();
        }
    }

    /// `link = target; br loop`.
    pub fn jump(&self, e: &mut Emitter, target: u32) {
        let link = e.globals.link();
        e.u32_const(target);
        e.global_set(link);
        e.br(self.loop_level);
    }

    pub fn close(mut self, e: &mut Emitter) {
        // Targets past the last instruction cannot be produced by fixup.
        while !self.pending.is_empty() {
            self.pending.remove(0);
            e.end();
        }
        e.end();
    }
}
