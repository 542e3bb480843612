// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

use std::ptr;

use crate::interpreter::{HandleResult, Machine};

pub fn nop(_machine: &mut Machine) -> HandleResult {
    HandleResult::Move(1)
}

/// a block marker carries the block signature for introspection and
/// otherwise executes as a skip
pub fn block(_machine: &mut Machine) -> HandleResult {
    HandleResult::Move(1)
}

/// the arity-and-flags word after a builtin call, skipped when reached
pub fn call_builtin_sig(_machine: &mut Machine) -> HandleResult {
    HandleResult::Move(1)
}

/// remove the value at the index, shifting the ones above it down
pub fn pop(machine: &mut Machine) -> HandleResult {
    let index = machine.inst().stack_idx() as usize;
    unsafe {
        ptr::copy(machine.vsp, machine.vsp.add(1), index);
    }
    machine.drop_top(1);
    HandleResult::Move(1)
}

pub fn pop_top(machine: &mut Machine) -> HandleResult {
    debug_assert_eq!(machine.inst().stack_idx(), 0);
    machine.drop_top(1);
    HandleResult::Move(1)
}

pub fn pick(machine: &mut Machine) -> HandleResult {
    let value = machine.at(machine.inst().stack_idx() as usize);
    machine.push(value);
    HandleResult::Move(1)
}

pub fn dup(machine: &mut Machine) -> HandleResult {
    debug_assert_eq!(machine.inst().stack_idx(), 0);
    let value = machine.at(0);
    machine.push(value);
    HandleResult::Move(1)
}

/// move the value at the index to the top, shifting the ones above it
pub fn roll(machine: &mut Machine) -> HandleResult {
    let index = machine.inst().stack_idx() as usize;
    unsafe {
        let value = *machine.vsp.add(index);
        ptr::copy(machine.vsp, machine.vsp.add(1), index);
        *machine.vsp = value;
    }
    HandleResult::Move(1)
}

pub fn swap(machine: &mut Machine) -> HandleResult {
    debug_assert_eq!(machine.inst().stack_idx(), 1);
    let top = machine.at(0);
    let below = machine.at(1);
    machine.set_at(0, below);
    machine.set_at(1, top);
    HandleResult::Move(1)
}

/// pop an index and replace the top N values with the chosen one
pub fn select(machine: &mut Machine) -> HandleResult {
    let count = machine.inst().stack_idx() as usize + 1;
    let chosen = machine.pop().as_u64();
    if chosen as usize >= count {
        return machine.panic("invalid select index");
    }

    let value = machine.at(chosen as usize);
    machine.drop_top(count - 1);
    machine.set_at(0, value);
    HandleResult::Move(1)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use stavm_types::Signature;

    use crate::test_helper::{run_ok, run_panic, single_function_module};

    #[test]
    fn test_stack_manipulation() {
        // build [10, 20, 30], pick the bottom, roll it up, swap,
        // drop the middle: exercises every shuffle opcode
        let module = single_function_module(Signature::new(0, 2), |builder| {
            builder.inst_uint(10);
            builder.inst_uint(20);
            builder.inst_uint(30);
            builder.inst_pick(2); // [10, 20, 30, 10]
            builder.inst_roll(3); // [20, 30, 10, 10]
            builder.inst_roll(1); // swap the two identical top values
            builder.inst_pop(1); // [20, 30, 10]
            builder.inst_pop(2); // [30, 10]
            builder.inst_return();
        });

        assert_eq!(run_ok(&module, &[], 2), vec![30, 10]);
    }

    #[test]
    fn test_select() {
        // select the middle of three alternatives
        let module = single_function_module(Signature::new(1, 1), |builder| {
            builder.inst_uint(100);
            builder.inst_uint(200);
            builder.inst_uint(300);
            builder.inst_roll(3); // bring the function argument on top
            builder.inst_select(3);
            builder.inst_return();
        });

        // index 0 selects the top alternative
        assert_eq!(run_ok(&module, &[0], 1), vec![300]);
        assert_eq!(run_ok(&module, &[1], 1), vec![200]);
        assert_eq!(run_ok(&module, &[2], 1), vec![100]);
        assert_eq!(run_panic(&module, &[3]), "invalid select index");
    }
}
