// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

// The second phase of the builder: linearize the block graph into the
// final instruction array.
//
// 1. Reachability from the entry block, unterminated reachable blocks
//    are an error.
// 2. The prologue: allocation-creating instructions when any local
//    address escaped, plain storage reservation otherwise.
// 3. Blocks in declaration order (skipping unreachable ones), each
//    preceded by its `block` marker, terminators lowered with
//    fallthrough elision.
// 4. Terminator offsets patched from block indices to signed
//    instruction deltas relative to the terminator itself.
// 5. Deferred debug locations shifted by the block offset and handed
//    to the module (or the chunk).

use std::mem::size_of;

use stavm_types::{inst::Inst, opcode::Opcode, VALUE_SIZE_IN_BYTES};

use crate::{
    builder::{BuildError, Builder, Target, Terminator},
    module::InstDebugLocation,
    stack::{StackFrame, MAX_FRAME_SIZE_IN_BYTES},
};

struct Patch {
    position: usize,
    dest: usize,
}

impl<'m> Builder<'m> {
    /// validate, linearize and attach the instruction array to the
    /// target. false when any build error occurred.
    pub fn finish(mut self) -> bool {
        const CONTEXT: &str = "finish";

        let frame_size = size_of::<StackFrame>() + self.local_allocation_size as usize;
        if frame_size > MAX_FRAME_SIZE_IN_BYTES {
            self.error(CONTEXT, BuildError::FrameTooLarge);
        }

        self.compute_reachability(CONTEXT);

        // a pessimistic upper bound: the prologue, a marker per block
        // and up to three terminator-lowering slots
        let estimate = 1
            + self.locals.len()
            + self
                .blocks
                .iter()
                .filter(|block| block.reachable)
                .map(|block| block.insts.len() + 4)
                .sum::<usize>();
        let mut insts: Vec<Inst> = Vec::with_capacity(estimate);

        self.emit_prologue(&mut insts);
        let patches = if self.blocks.len() == 1 {
            self.emit_linear_body(&mut insts)
        } else {
            self.emit_body(&mut insts)
        };
        self.patch_offsets(&mut insts, &patches);

        if insts.len() > u16::MAX as usize {
            self.error(CONTEXT, BuildError::TooManyInstructions);
        }

        let max_vstack_size = self
            .blocks
            .iter()
            .filter(|block| block.reachable)
            .map(|block| block.vstack.max_len())
            .max()
            .unwrap_or(0);
        if max_vstack_size > u16::MAX as usize {
            self.error(CONTEXT, BuildError::VstackLimit);
        }

        self.emit_debug_locations();

        let function = match &mut self.target {
            Target::Function(function) => &mut self.module.functions[function.0 as usize],
            Target::Chunk(chunk) => &mut chunk.function,
        };
        function.insts = insts;
        function.max_vstack_size = max_vstack_size.min(u16::MAX as usize) as u16;
        function.max_cstack_size = frame_size.min(u16::MAX as usize) as u16;

        !self.errored
    }

    fn compute_reachability(&mut self, context: &'static str) {
        let mut worklist = vec![0usize];
        while let Some(index) = worklist.pop() {
            if self.blocks[index].reachable {
                continue;
            }
            self.blocks[index].reachable = true;

            match self.blocks[index].terminator {
                Terminator::Unterminated => {
                    self.error(context, BuildError::UnterminatedBlock);
                }
                Terminator::Terminated | Terminator::Return | Terminator::Panic => {}
                Terminator::Jump => worklist.push(self.blocks[index].next[0]),
                Terminator::BranchNeEq | Terminator::BranchLtGe | Terminator::BranchLeGt => {
                    worklist.push(self.blocks[index].next[0]);
                    worklist.push(self.blocks[index].next[1]);
                }
            }
        }
    }

    fn emit_prologue(&mut self, insts: &mut Vec<Inst>) {
        const CONTEXT: &str = "finish";

        if self.local_addr_count > 0 {
            // one taken address forces allocation records for every
            // local, the indices in local_addr are absolute
            let setup = Inst::with_value(Opcode::setup_local_alloc, self.locals.len() as u64);
            match setup {
                Ok(inst) => insts.push(inst),
                Err(error) => self.error(CONTEXT, error.into()),
            }

            for local in self.locals.clone() {
                let opcode = if local.layout.alignment as usize == VALUE_SIZE_IN_BYTES {
                    Opcode::local_alloc
                } else {
                    Opcode::local_alloc_aligned
                };
                match Inst::with_layout(opcode, local.layout) {
                    Ok(inst) => insts.push(inst),
                    Err(error) => self.error(CONTEXT, error.into()),
                }
            }
        } else {
            for local in self.locals.clone() {
                let mut space = local.layout.size;
                if local.layout.alignment as usize > VALUE_SIZE_IN_BYTES {
                    // the pessimistic amount reserved for the unknown
                    // alignment padding
                    space += local.layout.alignment;
                }
                if space == 0 {
                    continue;
                }
                match Inst::with_value(Opcode::local_storage, space as u64) {
                    Ok(inst) => insts.push(inst),
                    Err(error) => self.error(CONTEXT, error.into()),
                }
            }
        }
    }

    fn emit_return(&self, insts: &mut Vec<Inst>) {
        if self.local_addr_count > 0 {
            insts.push(Inst::with_value(Opcode::return_free, self.locals.len() as u64).unwrap());
        } else {
            insts.push(Inst::none(Opcode::return_));
        }
    }

    /// a jump-family instruction whose offset is patched later
    fn emit_jump(insts: &mut Vec<Inst>, patches: &mut Vec<Patch>, opcode: Opcode, dest: usize) {
        patches.push(Patch {
            position: insts.len(),
            dest,
        });
        insts.push(Inst::none(opcode));
    }

    /// the first reachable block lexically after this one, its
    /// fallthrough target
    fn next_reachable_block(&self, index: usize) -> Option<usize> {
        (index + 1..self.blocks.len()).find(|candidate| self.blocks[*candidate].reachable)
    }

    fn emit_body(&mut self, insts: &mut Vec<Inst>) -> Vec<Patch> {
        let mut patches = Vec::new();

        for index in 0..self.blocks.len() {
            if !self.blocks[index].reachable {
                continue;
            }
            self.blocks[index].offset = insts.len() as u32;

            let sig = self.blocks[index].sig;
            insts.push(Inst::with_signature(Opcode::block, sig, 0));
            insts.extend_from_slice(&self.blocks[index].insts);

            let next_block = self.next_reachable_block(index);
            let [next0, next1] = self.blocks[index].next;

            match self.blocks[index].terminator {
                Terminator::Unterminated | Terminator::Terminated => {}

                Terminator::Return => self.emit_return(insts),
                Terminator::Panic => insts.push(Inst::none(Opcode::panic)),

                Terminator::Jump => {
                    if next_block != Some(next0) {
                        Self::emit_jump(insts, &mut patches, Opcode::jump, next0);
                    }
                }

                // next[0] is the not-equal successor. branch_eq keeps
                // the condition on fallthrough, the pop_top behind it
                // consumes it on the not-equal path.
                Terminator::BranchNeEq => {
                    if next_block == Some(next1) {
                        Self::emit_jump(insts, &mut patches, Opcode::branch_ne, next0);
                    } else {
                        Self::emit_jump(insts, &mut patches, Opcode::branch_eq, next1);
                        insts.push(Inst::with_stack_idx(Opcode::pop_top, 0));
                        if next_block != Some(next0) {
                            Self::emit_jump(insts, &mut patches, Opcode::jump, next0);
                        }
                    }
                }

                // next[0] is the less-than successor
                Terminator::BranchLtGe => {
                    if next_block == Some(next0) {
                        Self::emit_jump(insts, &mut patches, Opcode::branch_ge, next1);
                    } else if next_block == Some(next1) {
                        Self::emit_jump(insts, &mut patches, Opcode::branch_lt, next0);
                    } else {
                        Self::emit_jump(insts, &mut patches, Opcode::branch_ge, next1);
                        Self::emit_jump(insts, &mut patches, Opcode::jump, next0);
                    }
                }

                // next[0] is the less-or-equal successor
                Terminator::BranchLeGt => {
                    if next_block == Some(next0) {
                        Self::emit_jump(insts, &mut patches, Opcode::branch_gt, next1);
                    } else if next_block == Some(next1) {
                        Self::emit_jump(insts, &mut patches, Opcode::branch_le, next0);
                    } else {
                        Self::emit_jump(insts, &mut patches, Opcode::branch_gt, next1);
                        Self::emit_jump(insts, &mut patches, Opcode::jump, next0);
                    }
                }
            }
        }

        patches
    }

    /// the shorter path for a single-block function, the only possible
    /// jump target is the block itself
    fn emit_linear_body(&mut self, insts: &mut Vec<Inst>) -> Vec<Patch> {
        let entry = &mut self.blocks[0];
        entry.offset = insts.len() as u32;

        insts.push(Inst::with_signature(Opcode::block, entry.sig, 0));
        insts.extend_from_slice(&entry.insts);

        let self_jump = |insts: &mut Vec<Inst>, offset: u32| {
            let dest = offset as i64 + 1;
            let delta = dest - insts.len() as i64;
            insts.push(Inst::with_offset(Opcode::jump, delta).unwrap());
        };

        match self.blocks[0].terminator {
            Terminator::Unterminated | Terminator::Terminated => {}
            Terminator::Return => self.emit_return(insts),
            Terminator::Panic => insts.push(Inst::none(Opcode::panic)),
            Terminator::BranchNeEq | Terminator::BranchLtGe | Terminator::BranchLeGt => {
                // both successors are the entry itself, consume the
                // condition and loop
                insts.push(Inst::with_stack_idx(Opcode::pop_top, 0));
                self_jump(insts, self.blocks[0].offset);
            }
            Terminator::Jump => self_jump(insts, self.blocks[0].offset),
        }

        Vec::new()
    }

    /// rewrite the recorded jumps from block indices to instruction
    /// deltas relative to the jump instruction, targeting one past the
    /// destination's block marker
    fn patch_offsets(&mut self, insts: &mut [Inst], patches: &[Patch]) {
        const CONTEXT: &str = "finish";

        for patch in patches {
            let dest_offset = self.blocks[patch.dest].offset as i64 + 1;
            let delta = dest_offset - patch.position as i64;

            match Inst::with_offset(insts[patch.position].opcode(), delta) {
                Ok(inst) => insts[patch.position] = inst,
                Err(error) => self.error(CONTEXT, error.into()),
            }
        }
    }

    fn emit_debug_locations(&mut self) {
        let mut shifted: Vec<InstDebugLocation> = Vec::new();
        for block in &self.blocks {
            if !block.reachable {
                continue;
            }
            for location in &block.debug_locations {
                let mut location = *location;
                // the block marker shifts everything by one more
                location.inst_index += block.offset + 1;
                shifted.push(location);
            }
        }

        match &mut self.target {
            Target::Function(_) => self.module.add_debug_locations(&shifted),
            Target::Chunk(chunk) => chunk.inst_debug_locations.extend(shifted),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use stavm_types::{
        inst::Inst, opcode::Opcode, ConditionCode, Layout, Signature,
    };

    use crate::{
        builder::{BuildError, BuildOptions, Builder},
        libs::int::{SADD_WRAP, SDIV_WRAP},
        module::Module,
        test_helper::single_function_module,
    };

    use std::cell::RefCell;

    thread_local! {
        static LAST_ERROR: RefCell<Option<BuildError>> = const { RefCell::new(None) };
    }

    fn recording_handler(_function: &str, _context: &str, error: &BuildError) {
        LAST_ERROR.with(|cell| *cell.borrow_mut() = Some(error.clone()));
    }

    fn recording_options() -> BuildOptions {
        LAST_ERROR.with(|cell| cell.borrow_mut().take());
        BuildOptions {
            error_handler: recording_handler,
        }
    }

    fn last_error() -> Option<BuildError> {
        LAST_ERROR.with(|cell| cell.borrow_mut().take())
    }

    fn main_insts(module: &Module) -> &[Inst] {
        let main = module.find_function_by_name("main").unwrap();
        module.function(main).insts()
    }

    #[test]
    fn test_trivial_function_emission() {
        let module = single_function_module(Signature::new(0, 1), |builder| {
            builder.inst_uint(42);
            builder.inst_return();
        });

        assert_eq!(
            main_insts(&module),
            &[
                Inst::with_signature(Opcode::block, Signature::new(0, 1), 0),
                Inst::with_value(Opcode::push, 42).unwrap(),
                Inst::none(Opcode::return_),
            ]
        );
    }

    #[test]
    fn test_pop_of_pure_producer_is_removed() {
        let module = single_function_module(Signature::new(0, 0), |builder| {
            builder.inst_uint(7);
            builder.inst_pop(0);
            builder.inst_return();
        });

        assert_eq!(
            main_insts(&module),
            &[
                Inst::with_signature(Opcode::block, Signature::new(0, 0), 0),
                Inst::none(Opcode::return_),
            ]
        );
    }

    #[test]
    fn test_pop_of_multi_word_constant_removes_the_chain() {
        let module = single_function_module(Signature::new(0, 0), |builder| {
            builder.inst_uint(0xDEAD_BEEF_CAFE_F00D);
            builder.inst_pop(0);
            builder.inst_return();
        });

        assert_eq!(
            main_insts(&module),
            &[
                Inst::with_signature(Opcode::block, Signature::new(0, 0), 0),
                Inst::none(Opcode::return_),
            ]
        );
    }

    #[test]
    fn test_pop_of_side_effecting_producer_stays() {
        let module = single_function_module(Signature::new(0, 0), |builder| {
            builder.inst_uint(1);
            builder.inst_uint(1);
            // not foldable: SDIV can panic, so folding happens, but
            // feed one runtime value to be sure
            builder.inst_call_builtin(&SADD_WRAP);
            builder.inst_pop(0);
            builder.inst_return();
        });

        // the two constants folded, their pop removed the push, so
        // nothing remains but the frame
        assert_eq!(
            main_insts(&module),
            &[
                Inst::with_signature(Opcode::block, Signature::new(0, 0), 0),
                Inst::none(Opcode::return_),
            ]
        );

        // a call with a runtime input survives and its result needs a
        // real pop
        let module = single_function_module(Signature::new(1, 0), |builder| {
            builder.inst_uint(1);
            builder.inst_call_builtin(&SADD_WRAP);
            builder.inst_pop(0);
            builder.inst_return();
        });
        let insts = main_insts(&module);
        assert!(insts
            .iter()
            .any(|inst| inst.opcode() == Opcode::call_builtin_no_frame));
        assert!(insts.iter().any(|inst| inst.opcode() == Opcode::pop_top));
    }

    #[test]
    fn test_builtin_constant_folding() {
        let module = single_function_module(Signature::new(0, 1), |builder| {
            builder.inst_uint(2);
            builder.inst_uint(3);
            builder.inst_call_builtin(&SADD_WRAP);
            builder.inst_return();
        });

        assert_eq!(
            main_insts(&module),
            &[
                Inst::with_signature(Opcode::block, Signature::new(0, 1), 0),
                Inst::with_value(Opcode::push, 5).unwrap(),
                Inst::none(Opcode::return_),
            ]
        );
    }

    #[test]
    fn test_builtin_constant_folding_keeps_panicking_calls() {
        // 1 / 0 panics during folding, the call must stay
        let module = single_function_module(Signature::new(0, 1), |builder| {
            builder.inst_uint(1);
            builder.inst_uint(0);
            builder.inst_call_builtin(&SDIV_WRAP);
            builder.inst_return();
        });

        let insts = main_insts(&module);
        assert!(insts
            .iter()
            .any(|inst| inst.opcode() == Opcode::call_builtin));
    }

    #[test]
    fn test_cc_constant_folding() {
        let module = single_function_module(Signature::new(0, 1), |builder| {
            builder.inst_sint(-3);
            builder.inst_cc(ConditionCode::Lt);
            builder.inst_return();
        });

        assert_eq!(
            main_insts(&module),
            &[
                Inst::with_signature(Opcode::block, Signature::new(0, 1), 0),
                Inst::with_value(Opcode::push, 1).unwrap(),
                Inst::none(Opcode::return_),
            ]
        );
    }

    #[test]
    fn test_branch_with_constant_condition_becomes_jump() {
        let module = single_function_module(Signature::new(0, 1), |builder| {
            let if_true = builder.declare_block(0);
            let if_false = builder.declare_block(0);

            builder.inst_uint(1);
            let chosen = builder.inst_branch(if_true, if_false);
            assert_eq!(chosen, Some(if_true));

            builder.build_block(if_true);
            builder.inst_uint(10);
            builder.inst_return();

            builder.build_block(if_false);
            builder.inst_uint(20);
            builder.inst_return();
        });

        // if_false is unreachable and fully absent, the jump to
        // if_true is a fallthrough
        let insts = main_insts(&module);
        assert!(!insts.iter().any(|inst| {
            matches!(
                inst.opcode(),
                Opcode::jump | Opcode::branch_eq | Opcode::branch_ne
            )
        }));
        assert!(!insts
            .iter()
            .any(|inst| inst.opcode() == Opcode::push && inst.value() == 20));
    }

    #[test]
    fn test_branch_with_equal_successors_becomes_jump() {
        let module = single_function_module(Signature::new(1, 1), |builder| {
            let target = builder.declare_block(0);

            let chosen = builder.inst_branch(target, target);
            assert_eq!(chosen, Some(target));

            builder.build_block(target);
            builder.inst_uint(5);
            builder.inst_return();
        });

        // the condition is consumed by a real pop (it is the function
        // argument), then control falls through
        let insts = main_insts(&module);
        assert!(insts.iter().any(|inst| inst.opcode() == Opcode::pop_top));
        assert!(!insts.iter().any(|inst| inst.opcode() == Opcode::branch_ne));
    }

    #[test]
    fn test_cc_branch_fusion() {
        // cc(Lt) + branch fuses into branch_lt_ge, the cc disappears.
        // with the true-successor lexically next the builder emits the
        // inverted one-instruction form branch_ge.
        let module = single_function_module(Signature::new(1, 1), |builder| {
            let if_lt = builder.declare_block(0);
            let if_ge = builder.declare_block(0);

            builder.inst_cc(ConditionCode::Lt);
            builder.inst_branch(if_lt, if_ge);

            builder.build_block(if_lt);
            builder.inst_uint(1);
            builder.inst_return();

            builder.build_block(if_ge);
            builder.inst_uint(0);
            builder.inst_return();
        });

        let insts = main_insts(&module);
        assert!(!insts.iter().any(|inst| inst.opcode() == Opcode::cc));
        assert!(insts.iter().any(|inst| inst.opcode() == Opcode::branch_ge));
    }

    #[test]
    fn test_array_element_folding() {
        // constant index zero disappears entirely
        let module = single_function_module(Signature::new(1, 1), |builder| {
            builder.inst_uint(0);
            builder.inst_array_element(Layout::new(8, 8));
            builder.inst_return();
        });
        assert_eq!(
            main_insts(&module),
            &[
                Inst::with_signature(Opcode::block, Signature::new(1, 1), 0),
                Inst::none(Opcode::return_),
            ]
        );

        // constant nonzero index becomes a fixed byte offset
        let module = single_function_module(Signature::new(1, 1), |builder| {
            builder.inst_uint(3);
            builder.inst_array_element(Layout::new(8, 8));
            builder.inst_return();
        });
        assert!(main_insts(&module)
            .iter()
            .any(|inst| inst.opcode() == Opcode::aggregate_member && inst.value() == 24));

        // a runtime index keeps the scaled step, padded to the element
        // alignment
        let module = single_function_module(Signature::new(2, 1), |builder| {
            builder.inst_array_element(Layout::new(6, 4));
            builder.inst_return();
        });
        assert!(main_insts(&module)
            .iter()
            .any(|inst| inst.opcode() == Opcode::array_element && inst.value() == 8));
    }

    #[test]
    fn test_unterminated_block_fails() {
        let mut module = Module::new("test");
        let main = module.add_function("main", Signature::new(0, 0));
        let builder = Builder::for_function(&mut module, main, recording_options());
        assert!(!builder.finish());
        assert_eq!(last_error(), Some(BuildError::UnterminatedBlock));
    }

    #[test]
    fn test_pop_from_empty_block_fails() {
        let mut module = Module::new("test");
        let main = module.add_function("main", Signature::new(0, 0));
        let mut builder = Builder::for_function(&mut module, main, recording_options());
        builder.inst_pop(0);
        assert_eq!(last_error(), Some(BuildError::InvalidStackIndex(0)));
        builder.inst_return();
        assert!(!builder.finish());
    }

    #[test]
    fn test_output_count_overflow_fails() {
        let mut module = Module::new("test");
        let main = module.add_function("main", Signature::new(0, 0));
        let mut builder = Builder::for_function(&mut module, main, recording_options());
        for _ in 0..=u8::MAX as usize {
            builder.inst_uint(0);
        }
        let dest = builder.declare_block(u8::MAX as usize);
        builder.inst_jump(dest);
        assert_eq!(last_error(), Some(BuildError::OutputCountOverflow));
        assert!(!builder.finish());
    }

    #[test]
    fn test_successor_arity_mismatch_fails() {
        let mut module = Module::new("test");
        let main = module.add_function("main", Signature::new(0, 0));
        let mut builder = Builder::for_function(&mut module, main, recording_options());
        let dest = builder.declare_block(2);
        builder.inst_uint(1);
        builder.inst_jump(dest);
        assert_eq!(last_error(), Some(BuildError::SignatureMismatch));
        assert!(!builder.finish());
    }

    #[test]
    fn test_duplicate_definition_fails() {
        let mut module = Module::new("test");
        let main = module.add_function("main", Signature::new(0, 0));
        let mut builder = Builder::for_function(&mut module, main, BuildOptions::default());
        builder.inst_return();
        assert!(builder.finish());

        let builder = Builder::for_function(&mut module, main, recording_options());
        assert_eq!(last_error(), Some(BuildError::DuplicateDefinition));
        assert!(!builder.finish());
    }

    #[test]
    fn test_max_vstack_is_the_deepest_block() {
        let module = single_function_module(Signature::new(0, 1), |builder| {
            builder.inst_uint(1);
            builder.inst_uint(2);
            builder.inst_uint(3);
            builder.inst_pop(0);
            builder.inst_pop(0);
            builder.inst_return();
        });

        let main = module.find_function_by_name("main").unwrap();
        assert_eq!(module.function(main).max_vstack_size(), 3);
    }

    #[test]
    fn test_single_block_self_loop() {
        // a loop whose only block jumps to itself takes the linear
        // path: the jump targets the slot after the block marker
        let module = single_function_module(Signature::new(1, 1), |builder| {
            let entry = builder.entry_block();
            builder.inst_pick(0);
            builder.inst_cc(ConditionCode::Gt);
            builder.inst_branch(entry, entry);
        });

        let insts = main_insts(&module);
        let jump_at = insts
            .iter()
            .position(|inst| inst.opcode() == Opcode::jump)
            .unwrap();
        assert_eq!(jump_at as i64 + insts[jump_at].offset(), 1);
    }

    #[test]
    fn test_chunk_build_execute_and_reset() {
        let mut module = Module::new("test");
        let nine = module.add_function("nine", Signature::new(0, 1));
        let mut builder = Builder::for_function(&mut module, nine, BuildOptions::default());
        builder.inst_uint(9);
        builder.inst_return();
        assert!(builder.finish());

        // a chunk calling into the module exercises the pseudo anchor
        // its call offsets are compressed against
        let mut chunk = module.create_chunk();
        let mut builder = Builder::for_chunk(
            &mut module,
            &mut chunk,
            Signature::new(0, 1),
            BuildOptions::default(),
        );
        builder.inst_call(nine);
        builder.inst_return();
        assert!(builder.finish());

        assert!(!chunk.is_empty());
        assert_eq!(chunk.signature(), Signature::new(0, 1));

        let program = crate::program::Program::from_chunk(&module, &chunk).unwrap();
        let mut vm = crate::vm::Vm::new(crate::vm::VmOptions::default());
        let mut output = [stavm_types::Value::from_u64(0)];
        assert!(vm.execute(program, &[], &mut output));
        assert_eq!(output[0].as_u64(), 9);

        chunk.reset();
        assert!(chunk.is_empty());
    }
}
