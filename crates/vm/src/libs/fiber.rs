// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

// Fiber management beyond the dedicated instructions: creation from a
// first-class function address, destruction, and introspection.

use stavm_types::Value;

use crate::{
    builtin::{Builtin, BuiltinFlags},
    fiber::{Fiber, FiberStatus},
    function::Function,
    interpreter::{HandleResult, Machine},
};

/// (function address) -> fiber handle
pub static FIBER_CREATE: Builtin = Builtin {
    imp: fiber_create,
    input_count: 1,
    output_count: 1,
    flags: BuiltinFlags::empty(),
    name: "fiber_create",
};

fn fiber_create(machine: &mut Machine) -> HandleResult {
    let address = machine.at(0).as_function_address();
    let process = unsafe { &mut *machine.process };

    let function: *const Function = match process.get_function_by_address(address) {
        Some(function) => function,
        None => return machine.panic("invalid function address"),
    };

    let fiber = Fiber::create(process, function);
    machine.set_at(0, Value::from_address(unsafe { (*fiber).handle() }));
    HandleResult::Move(1)
}

/// (handle) -> (): cancel a fiber, freeing its local allocations
pub static FIBER_DESTROY: Builtin = Builtin {
    imp: fiber_destroy,
    input_count: 1,
    output_count: 0,
    flags: BuiltinFlags::empty(),
    name: "fiber_destroy",
};

fn fiber_destroy(machine: &mut Machine) -> HandleResult {
    let handle = machine.at(0).as_address();
    let process = unsafe { &mut *machine.process };

    if process.get_fiber_ptr(handle).is_none() {
        return machine.panic("invalid fiber handle");
    }
    if !process.destroy_fiber(handle) {
        return HandleResult::Panic;
    }

    machine.drop_top(1);
    HandleResult::Move(1)
}

/// () -> handle of the running fiber
pub static FIBER_CURRENT: Builtin = Builtin {
    imp: fiber_current,
    input_count: 0,
    output_count: 1,
    flags: BuiltinFlags::NO_PANIC,
    name: "fiber_current",
};

fn fiber_current(machine: &mut Machine) -> HandleResult {
    let process = unsafe { &mut *machine.process };
    let handle = unsafe { (*process.cur_fiber).handle() };
    machine.push(Value::from_address(handle));
    HandleResult::Move(1)
}

/// () -> handle of the resumer, or null for a root fiber
pub static FIBER_PARENT: Builtin = Builtin {
    imp: fiber_parent,
    input_count: 0,
    output_count: 1,
    flags: BuiltinFlags::NO_PANIC,
    name: "fiber_parent",
};

fn fiber_parent(machine: &mut Machine) -> HandleResult {
    let process = unsafe { &mut *machine.process };
    let parent = unsafe { (*process.cur_fiber).parent };
    machine.push(Value::from_address(parent));
    HandleResult::Move(1)
}

/// (handle) -> 1 when the fiber has finished
pub static FIBER_DONE: Builtin = Builtin {
    imp: fiber_done,
    input_count: 1,
    output_count: 1,
    flags: BuiltinFlags::empty(),
    name: "fiber_done",
};

fn fiber_done(machine: &mut Machine) -> HandleResult {
    let handle = machine.at(0).as_address();
    let process = unsafe { &mut *machine.process };

    let fiber = match process.get_fiber_ptr(handle) {
        Some(fiber) => fiber,
        None => return machine.panic("invalid fiber handle"),
    };
    let done = unsafe { (*fiber).status } == FiberStatus::Done;
    machine.set_at(0, Value::from_u64(done as u64));
    HandleResult::Move(1)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use stavm_types::Signature;

    use crate::{
        builder::{BuildOptions, Builder},
        libs::fiber::{FIBER_CREATE, FIBER_DESTROY, FIBER_DONE},
        module::Module,
        test_helper::run_main,
    };

    #[test]
    fn test_fiber_create_destroy_by_address() {
        let mut module = Module::new("test");
        let target = module.add_function("target", Signature::new(0, 0));
        let main = module.add_function("main", Signature::new(0, 1));
        module.export_function(main);

        let mut builder = Builder::for_function(&mut module, target, BuildOptions::default());
        builder.inst_return();
        assert!(builder.finish());

        // create a fiber from a first-class function value, check it
        // has not run, cancel it
        let mut builder = Builder::for_function(&mut module, main, BuildOptions::default());
        builder.inst_function_addr(target);
        builder.inst_call_builtin(&FIBER_CREATE); // [h]
        builder.inst_pick(0);
        builder.inst_call_builtin(&FIBER_DONE); // [h, done?]
        builder.inst_roll(1); // [done?, h]
        builder.inst_call_builtin(&FIBER_DESTROY); // [done?]
        builder.inst_return();
        assert!(builder.finish());

        assert_eq!(run_main(&module, &[], 1), vec![0]);
    }
}
