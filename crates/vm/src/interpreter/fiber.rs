// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

use stavm_types::inst::uncompress_offset;
use stavm_types::Value;

use crate::{
    fiber::{Fiber, FiberStatus},
    function::Function,
    interpreter::{HandleResult, Machine},
    process::Registers,
};

/// create a fiber whose trampoline targets the designated function and
/// push the address of its handle
pub fn fiber_create(machine: &mut Machine) -> HandleResult {
    let process = unsafe { &mut *machine.process };

    let anchor = unsafe { (*(*machine.fp).function).function_index };
    let index = uncompress_offset(anchor, machine.inst().offset());
    let function: *const Function =
        match process.program.module.functions.get(index as usize) {
            Some(function) => function,
            None => return machine.panic("invalid function address"),
        };

    let fiber = Fiber::create(process, function);
    machine.push(Value::from_address(unsafe { (*fiber).handle() }));
    HandleResult::Move(1)
}

/// pop the handle, hand the arguments over and switch to the fiber,
/// recording ourselves as its parent
pub fn fiber_resume(machine: &mut Machine) -> HandleResult {
    let process = unsafe { &mut *machine.process };
    if !process.increment_step() {
        return machine.panic("step limit exceeded");
    }

    let signature = machine.inst().signature();
    let handle = machine.at(signature.input_count as usize).as_address();

    let fiber = match process.get_fiber_ptr(handle) {
        Some(fiber)
            if matches!(
                unsafe { (*fiber).status },
                FiberStatus::Ready | FiberStatus::Suspended
            ) =>
        {
            fiber
        }
        _ => return machine.panic("invalid fiber handle"),
    };

    if !unsafe { (*fiber).transfer_arguments(signature.input_count, &mut machine.vsp) } {
        return machine.panic("mismatched signature for fiber resume");
    }
    // the handle sits below the arguments and is consumed as well
    machine.drop_top(1);

    let cur = unsafe { &mut *process.cur_fiber };
    cur.suspend(
        Registers {
            ip: machine.ip,
            vsp: machine.vsp,
            fp: machine.fp,
        },
        signature.output_count,
    );
    let parent_handle = cur.handle();

    unsafe {
        (*fiber).resume_by(parent_handle);
    }
    process.cur_fiber = fiber;

    let regs = unsafe { (*fiber).suspension_point };
    machine.ip = unsafe { regs.ip.add(1) };
    machine.vsp = regs.vsp;
    machine.fp = regs.fp;
    HandleResult::Goto
}

/// hand values back to the resumer and yield. without a resumer,
/// control returns to the host instead.
pub fn fiber_suspend(machine: &mut Machine) -> HandleResult {
    let process = unsafe { &mut *machine.process };
    let signature = machine.inst().signature();

    let cur_ptr = process.cur_fiber;
    let cur = unsafe { &mut *cur_ptr };
    debug_assert_eq!(cur.status, FiberStatus::Running);

    if !cur.has_resumer() {
        cur.suspend(
            Registers {
                ip: machine.ip,
                vsp: machine.vsp,
                fp: machine.fp,
            },
            signature.output_count,
        );
        process.last_suspended = cur_ptr;
        process.cur_fiber = std::ptr::null_mut();
        return HandleResult::End;
    }

    let parent = match process.get_fiber_ptr(cur.parent) {
        Some(parent) => parent,
        None => return machine.panic("cannot suspend to destroyed parent"),
    };

    if !unsafe { (*parent).transfer_arguments(signature.input_count, &mut machine.vsp) } {
        return machine.panic("mismatched signature for fiber resume");
    }

    cur.suspend(
        Registers {
            ip: machine.ip,
            vsp: machine.vsp,
            fp: machine.fp,
        },
        signature.output_count,
    );

    // asymmetric: the parent keeps its own recorded parent link
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
