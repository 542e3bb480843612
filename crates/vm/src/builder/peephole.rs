// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

use stavm_types::{inst::Inst, opcode::Opcode};

use crate::builder::Builder;

impl Builder<'_> {
    /// pop the top values, removing their producers from the
    /// instruction stream where possible.
    ///
    /// a producer with no side effects that pushed exactly one value is
    /// deleted. single-input single-output rewriters (the push
    /// extension words, derefs, `aggregate_member`, `cc`) are deleted
    /// together with their own producer. `array_element` consumed two
    /// values for its one, so removing it leaves one more value to
    /// pop. anything side-effecting or hard to undo ends the rewrite
    /// and real `pop_top` instructions absorb the rest.
    pub(crate) fn add_pop_top_n(&mut self, mut count: usize) {
        let Some(cur) = self.cur else { return };

        while count > 0 {
            let last = self.blocks[cur].insts.last().map(|inst| inst.opcode());

            match last {
                Some(Opcode::local_addr) => {
                    self.local_addr_count -= 1;
                    self.blocks[cur].insts.pop();
                    count -= 1;
                }

                // producers of one fresh value
                Some(
                    Opcode::push
                    | Opcode::pushn
                    | Opcode::global_addr
                    | Opcode::function_addr
                    | Opcode::pick
                    | Opcode::dup
                    | Opcode::load_local_value
                    | Opcode::load_global_value,
                ) => {
                    self.blocks[cur].insts.pop();
                    count -= 1;
                }

                // one value in, one value out: removing them exposes
                // their producer
                Some(
                    Opcode::push2
                    | Opcode::push3
                    | Opcode::deref_const
                    | Opcode::deref_mut
                    | Opcode::aggregate_member
                    | Opcode::cc,
                ) => {
                    self.blocks[cur].insts.pop();
                }

                // two values in, one out
                Some(Opcode::array_element) => {
                    self.blocks[cur].insts.pop();
                    count += 1;
                }

                // calls, stores, fiber operations, stack shuffles and
                // an empty block (popping an argument): give up and
                // pop for real. a pop_top is never removed either, it
                // exists because the last rewrite already gave up.
                _ => {
                    for _ in 0..count {
                        self.blocks[cur]
                            .insts
                            .push(Inst::with_stack_idx(Opcode::pop_top, 0));
                    }
                    count = 0;
                }
            }
        }
    }
}
