// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

use crate::{
    builtin::{Builtin, BuiltinFlags},
    interpreter::{HandleResult, Machine},
};

/// (value) -> (): log the top of the stack, a debugging directive that
/// other backends may drop
pub static PRINT: Builtin = Builtin {
    imp: print,
    input_count: 1,
    output_count: 0,
    flags: BuiltinFlags::NO_PANIC.union(BuiltinFlags::VM_DIRECTIVE),
    name: "print",
};

fn print(machine: &mut Machine) -> HandleResult {
    let value = machine.at(0);
    log::debug!(
        "print: 0x{:016x} ({})",
        value.as_u64(),
        value.as_i64()
    );
    machine.drop_top(1);
    HandleResult::Move(1)
}

/// () -> (): log the stacktrace of the running fiber
pub static PRINT_STACKTRACE: Builtin = Builtin {
    imp: print_stacktrace,
    input_count: 0,
    output_count: 0,
    flags: BuiltinFlags::VM_ONLY.union(BuiltinFlags::VM_DIRECTIVE),
    name: "print_stacktrace",
};

fn print_stacktrace(machine: &mut Machine) -> HandleResult {
    let process = unsafe { &mut *machine.process };

    // the registers were published on entry, suspend-style capture
    // works from them
    if let Some(handle) = process.current_fiber() {
        unsafe {
            let fiber = process.current_fiber_ptr();
            let saved = (*fiber).suspension_point;
            (*fiber).suspension_point = process.regs;
            for entry in crate::stacktrace::Stacktrace::capture(process, handle)
                .entries()
            {
                log::debug!("  at {}", entry);
            }
            (*fiber).suspension_point = saved;
        }
    }
    HandleResult::Move(1)
}
