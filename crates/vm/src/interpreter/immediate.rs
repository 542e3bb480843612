// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

use stavm_types::{inst::uncompress_offset, Address, ConditionCode, FunctionAddress, Value};

use crate::interpreter::{HandleResult, Machine};

// `push`/`pushn` start a new constant, `push2`/`push3` extend the one
// on top of the stack. the builder chooses the shortest chain for each
// bit pattern.

pub fn push(machine: &mut Machine) -> HandleResult {
    let value = machine.inst().value() as u64;
    machine.push(Value::from_u64(value));
    HandleResult::Move(1)
}

pub fn pushn(machine: &mut Machine) -> HandleResult {
    let value = machine.inst().value() as u64;
    machine.push(Value::from_u64(!value));
    HandleResult::Move(1)
}

pub fn push2(machine: &mut Machine) -> HandleResult {
    let value = machine.at(0).as_u64() | ((machine.inst().value() as u64) << 24);
    machine.set_at(0, Value::from_u64(value));
    HandleResult::Move(1)
}

pub fn push3(machine: &mut Machine) -> HandleResult {
    let value = machine.at(0).as_u64() | ((machine.inst().value() as u64) << 48);
    machine.set_at(0, Value::from_u64(value));
    HandleResult::Move(1)
}

pub fn global_addr(machine: &mut Machine) -> HandleResult {
    // generation zero is always right for globals, their table slots
    // are never reused
    let address = Address::new(machine.inst().value(), 0, 0);
    machine.push(Value::from_address(address));
    HandleResult::Move(1)
}

pub fn function_addr(machine: &mut Machine) -> HandleResult {
    let process = unsafe { &mut *machine.process };
    let anchor = unsafe { (*(*machine.fp).function).function_index };
    let index = uncompress_offset(anchor, machine.inst().offset());
    let function = match process.program.module.functions.get(index as usize) {
        Some(function) => function,
        None => return machine.panic("invalid function address"),
    };

    machine.push(Value::from_function_address(FunctionAddress {
        index,
        input_count: function.signature.input_count,
        output_count: function.signature.output_count,
    }));
    HandleResult::Move(1)
}

pub fn local_addr(machine: &mut Machine) -> HandleResult {
    let (index, _frame_offset) = machine.inst().local_addr();
    let (allocation, generation) = unsafe {
        (
            (*machine.fp).first_local_alloc + index as u32,
            (*machine.fp).local_generation,
        )
    };
    machine.push(Value::from_address(Address::new(allocation, generation, 0)));
    HandleResult::Move(1)
}

/// consume the top value, push 0 or 1 per the condition code
pub fn cc(machine: &mut Machine) -> HandleResult {
    let code = ConditionCode::from_u8(machine.inst().value() as u8);
    let result = code.eval(machine.at(0).as_i64());
    machine.set_at(0, Value::from_u64(result as u64));
    HandleResult::Move(1)
}
