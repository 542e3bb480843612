// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

use stavm_memory::{AllocationSplit, AllocationStatus};

use crate::{
    fiber::FiberStatus,
    interpreter::{HandleResult, Machine},
    process::Registers,
};

pub fn return_(machine: &mut Machine) -> HandleResult {
    unsafe {
        machine.ip = (*machine.fp).return_ip;
        machine.fp = (*machine.fp).prev;
    }
    HandleResult::Goto
}

/// return and mark the frame's local allocations freed, emitted
/// instead of `return_` when any local address escaped
pub fn return_free(machine: &mut Machine) -> HandleResult {
    let count = machine.inst().value();
    let process = unsafe { &mut *machine.process };

    for index in 0..count {
        let allocation = process
            .memory
            .get_mut(unsafe { (*machine.fp).first_local_alloc } + index);
        if allocation.split != AllocationSplit::Unsplit {
            return machine.panic("cannot free split allocation");
        }
        allocation.status = AllocationStatus::Freed;
    }
    process.memory.remove_freed();

    return_(machine)
}

pub fn jump(machine: &mut Machine) -> HandleResult {
    HandleResult::Move(machine.inst().offset() as isize)
}

/// pop, jump when zero
pub fn branch_false(machine: &mut Machine) -> HandleResult {
    let condition = machine.pop().as_u64();
    if condition == 0 {
        HandleResult::Move(machine.inst().offset() as isize)
    } else {
        HandleResult::Move(1)
    }
}

/// jump and pop when zero, fall through WITHOUT popping otherwise:
/// the fused form of a `branch_ne_eq` terminator whose other leg still
/// needs the condition
pub fn branch_eq(machine: &mut Machine) -> HandleResult {
    if machine.at(0).as_i64() == 0 {
        machine.drop_top(1);
        HandleResult::Move(machine.inst().offset() as isize)
    } else {
        HandleResult::Move(1)
    }
}

pub fn branch_ne(machine: &mut Machine) -> HandleResult {
    let condition = machine.pop().as_i64();
    if condition != 0 {
        HandleResult::Move(machine.inst().offset() as isize)
    } else {
        HandleResult::Move(1)
    }
}

pub fn branch_lt(machine: &mut Machine) -> HandleResult {
    let condition = machine.pop().as_i64();
    if condition < 0 {
        HandleResult::Move(machine.inst().offset() as isize)
    } else {
        HandleResult::Move(1)
    }
}

pub fn branch_le(machine: &mut Machine) -> HandleResult {
    let condition = machine.pop().as_i64();
    if condition <= 0 {
        HandleResult::Move(machine.inst().offset() as isize)
    } else {
        HandleResult::Move(1)
    }
}

pub fn branch_ge(machine: &mut Machine) -> HandleResult {
    let condition = machine.pop().as_i64();
    if condition >= 0 {
        HandleResult::Move(machine.inst().offset() as isize)
    } else {
        HandleResult::Move(1)
    }
}

pub fn branch_gt(machine: &mut Machine) -> HandleResult {
    let condition = machine.pop().as_i64();
    if condition > 0 {
        HandleResult::Move(machine.inst().offset() as isize)
    } else {
        HandleResult::Move(1)
    }
}

/// pop a message address and panic with the string behind it
pub fn panic(machine: &mut Machine) -> HandleResult {
    let address = machine.pop().as_address();
    let message = if machine.process.is_null() {
        None
    } else {
        unsafe { (*machine.process).get_cstr(address).map(str::to_owned) }
    };
    match message {
        Some(message) => machine.panic(&message),
        None => machine.panic("(invalid message pointer)"),
    }
}

/// finish the current fiber: hand the remaining values to the parent
/// and resume it, or return to the host when there is none
pub fn exit(machine: &mut Machine) -> HandleResult {
    if machine.process.is_null() {
        // constant folding has neither fibers nor a host
        return HandleResult::End;
    }

    let process = unsafe { &mut *machine.process };
    let cur_ptr = process.cur_fiber;
    let cur = unsafe { &mut *cur_ptr };

    let parent = process
        .get_fiber_ptr(cur.parent)
        .filter(|parent| unsafe { (**parent).status } != FiberStatus::Done);

    cur.status = FiberStatus::Done;

    match parent {
        None => {
            process.regs = Registers::null();
            process.last_suspended = cur_ptr;
            process.cur_fiber = std::ptr::null_mut();
            HandleResult::End
        }
        Some(parent) => {
            let argument_count = cur.vstack_depth_at(machine.vsp) as u8;
            if !unsafe { (*parent).transfer_arguments(argument_count, &mut machine.vsp) } {
                return machine.panic("mismatched signature for fiber resume");
            }

            unsafe {
                (*parent).resume();
            }
            process.cur_fiber = parent;

            let regs = unsafe { (*parent).suspension_point };
            machine.ip = unsafe { regs.ip.add(1) };
            machine.vsp = regs.vsp;
            machine.fp = regs.fp;
            HandleResult::Goto
        }
    }
}
