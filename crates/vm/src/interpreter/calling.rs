// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

use stavm_types::inst::uncompress_offset;

use crate::{
    function::Function,
    interpreter::{HandleResult, Machine},
    process::Registers,
};

enum Prepared {
    Frame(*mut crate::stack::StackFrame),
    Abort(HandleResult),
}

/// ensure value- and call-stack space for the callee and create its
/// frame. growth happens in place and may relocate the value-stack
/// pointer; exceeding a configured ceiling panics instead of silently
/// corrupting.
fn prepare_call(machine: &mut Machine, callee: &Function) -> Prepared {
    let process = unsafe { &mut *machine.process };
    let fiber = unsafe { &mut *process.cur_fiber };

    loop {
        let remaining =
            (machine.vsp as usize - fiber.vstack.limit() as usize) / stavm_types::VALUE_SIZE_IN_BYTES;
        if remaining >= callee.max_vstack_size as usize {
            break;
        }
        machine.vsp = fiber
            .vstack
            .grow(&mut process.vm.page_allocator, machine.vsp);
        if fiber.vstack.capacity() > process.vm.max_vstack_size {
            return Prepared::Abort(machine.panic("vstack overflow"));
        }
    }

    loop {
        match fiber.cstack.new_call_frame(machine.fp, callee, machine.ip) {
            Some(frame) => return Prepared::Frame(frame),
            None => {
                fiber
                    .cstack
                    .grow(&mut process.vm.page_allocator, machine.fp);
                if fiber.cstack.capacity() > process.vm.max_cstack_size {
                    return Prepared::Abort(machine.panic("cstack overflow"));
                }
            }
        }
    }
}

pub fn call(machine: &mut Machine) -> HandleResult {
    let offset = machine.inst().offset();
    let callee: *const Function = if offset == 0 {
        // the anchor itself: self recursion, or the trampoline calling
        // the function recorded in its own frame
        unsafe { (*machine.fp).function }
    } else {
        let process = unsafe { &mut *machine.process };
        let anchor = unsafe { (*(*machine.fp).function).function_index };
        let index = uncompress_offset(anchor, offset);
        match process.program.module.functions.get(index as usize) {
            Some(function) => function,
            None => return machine.panic("invalid function address"),
        }
    };

    let callee = unsafe { &*callee };
    match prepare_call(machine, callee) {
        Prepared::Abort(result) => result,
        Prepared::Frame(frame) => {
            machine.fp = frame;
            machine.ip = callee.insts.as_ptr();
            HandleResult::Goto
        }
    }
}

/// pop a function address and call it, the arity carried in the
/// address must match the requested signature
pub fn call_indirect(machine: &mut Machine) -> HandleResult {
    let signature = machine.inst().signature();
    let address = machine.at(0).as_function_address();

    if address.input_count != signature.input_count
        || address.output_count != signature.output_count
    {
        return machine.panic("invalid function address");
    }

    let process = unsafe { &mut *machine.process };
    let callee: *const Function =
        match process.program.module.functions.get(address.index as usize) {
            Some(function) => function,
            None => return machine.panic("invalid function address"),
        };

    let callee = unsafe { &*callee };
    match prepare_call(machine, callee) {
        Prepared::Abort(result) => result,
        Prepared::Frame(frame) => {
            // the address is consumed only now that nothing can
            // re-enter this instruction
            machine.drop_top(1);
            machine.fp = frame;
            machine.ip = callee.insts.as_ptr();
            HandleResult::Goto
        }
    }
}

/// builtin call that publishes the registers first, so the builtin may
/// inspect the process and panic with an accurate state
pub fn call_builtin(machine: &mut Machine) -> HandleResult {
    let process = unsafe { &mut *machine.process };
    if !process.increment_step() {
        return machine.panic("step limit exceeded");
    }
    process.regs = Registers {
        ip: machine.ip,
        vsp: machine.vsp,
        fp: machine.fp,
    };
    dispatch_builtin(machine)
}

/// builtin call without the register snapshot, chosen by the builder
/// when the builtin declares both NO_PANIC and NO_PROCESS
pub fn call_builtin_no_frame(machine: &mut Machine) -> HandleResult {
    dispatch_builtin(machine)
}

fn dispatch_builtin(machine: &mut Machine) -> HandleResult {
    let process = unsafe { &mut *machine.process };
    let index = uncompress_offset(0, machine.inst().offset());
    let builtin = match process.program.module.builtins.get(index as usize) {
        Some(builtin) => *builtin,
        None => return machine.panic("invalid function address"),
    };
    (builtin.imp)(machine)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use stavm_types::{ConditionCode, Signature, Value};

    use crate::{
        builder::{BuildOptions, Builder},
        libs::int::{SADD_WRAP, SSUB_WRAP},
        module::Module,
        test_helper::{run_main, single_function_module},
        vm::{Vm, VmOptions},
    };

    fn fib_module() -> Module {
        let mut module = Module::new("fib");
        let fib = module.add_function("fib", Signature::new(1, 1));
        let main = module.add_function("main", Signature::new(1, 1));
        module.export_function(main);

        // fn fib(n) { if n - 2 < 0 { n } else { fib(n-1) + fib(n-2) } }
        let mut builder = Builder::for_function(&mut module, fib, BuildOptions::default());
        let base = builder.declare_block(1);
        let recurse = builder.declare_block(1);

        builder.inst_pick(0);
        builder.inst_uint(2);
        builder.inst_call_builtin(&SSUB_WRAP);
        builder.inst_cc(ConditionCode::Lt);
        builder.inst_branch(base, recurse);

        builder.build_block(base);
        builder.inst_return();

        builder.build_block(recurse);
        builder.inst_pick(0); // [n, n]
        builder.inst_uint(1);
        builder.inst_call_builtin(&SSUB_WRAP); // [n, n-1]
        builder.inst_call(fib); // [n, fib(n-1)]
        builder.inst_roll(1); // [fib(n-1), n]
        builder.inst_uint(2);
        builder.inst_call_builtin(&SSUB_WRAP); // [fib(n-1), n-2]
        builder.inst_call(fib); // [fib(n-1), fib(n-2)]
        builder.inst_call_builtin(&SADD_WRAP);
        builder.inst_return();
        assert!(builder.finish());

        let mut builder = Builder::for_function(&mut module, main, BuildOptions::default());
        builder.inst_call(fib);
        builder.inst_return();
        assert!(builder.finish());

        module
    }

    #[test]
    fn test_recursive_fib() {
        let module = fib_module();
        assert_eq!(run_main(&module, &[0], 1), vec![0]);
        assert_eq!(run_main(&module, &[1], 1), vec![1]);
        assert_eq!(run_main(&module, &[10], 1), vec![55]);
    }

    #[test]
    fn test_recursive_fib_deep() {
        let module = fib_module();
        assert_eq!(run_main(&module, &[35], 1), vec![9227465]);
    }

    #[test]
    fn test_call_indirect() {
        let mut module = Module::new("test");
        let double = module.add_function("double", Signature::new(1, 1));
        let main = module.add_function("main", Signature::new(1, 1));
        module.export_function(main);

        let mut builder = Builder::for_function(&mut module, double, BuildOptions::default());
        builder.inst_pick(0);
        builder.inst_call_builtin(&SADD_WRAP);
        builder.inst_return();
        assert!(builder.finish());

        // the function address goes on top of the inputs
        let mut builder = Builder::for_function(&mut module, main, BuildOptions::default());
        builder.inst_function_addr(double); // [x, f]
        builder.inst_call_indirect(Signature::new(1, 1));
        builder.inst_return();
        assert!(builder.finish());

        // the address came from function_addr, which the builder
        // tracks as a constant and folds into a direct call
        use stavm_types::opcode::Opcode;
        assert!(!module
            .function(main)
            .insts()
            .iter()
            .any(|inst| inst.opcode() == Opcode::call_indirect));

        assert_eq!(run_main(&module, &[21], 1), vec![42]);
    }

    #[test]
    fn test_call_indirect_dynamic_arity_mismatch() {
        let mut module = Module::new("test");
        let nullary = module.add_function("nullary", Signature::new(0, 0));
        let main = module.add_function("main", Signature::new(1, 1));
        module.export_function(main);

        let mut builder = Builder::for_function(&mut module, nullary, BuildOptions::default());
        builder.inst_return();
        assert!(builder.finish());

        // launder the function address through an argument so the call
        // stays indirect, then request a mismatching signature
        let mut builder = Builder::for_function(&mut module, main, BuildOptions::default());
        builder.inst_call_indirect(Signature::new(0, 1));
        builder.inst_return();
        assert!(builder.finish());

        let mut vm = Vm::new(VmOptions::default());
        let program = crate::program::Program::new(&module, main).unwrap();
        let address = Value::from_function_address(stavm_types::FunctionAddress {
            index: 0,
            input_count: 0,
            output_count: 0,
        });
        let mut output = [Value::from_u64(0)];
        let captured = crate::test_helper::capture_panics(&mut vm);
        assert!(!vm.execute(program, &[address], &mut output));
        assert_eq!(captured.take().unwrap(), "invalid function address");
    }

    #[test]
    fn test_stack_growth_on_deep_recursion() {
        // sum(n) = n + sum(n - 1): six hundred live frames outgrow
        // both the initial value stack and the initial call stack, so
        // the grow-or-panic paths run without hitting the ceilings
        let mut module = Module::new("test");
        let sum = module.add_function("sum", Signature::new(1, 1));
        module.export_function(sum);

        let mut builder = Builder::for_function(&mut module, sum, BuildOptions::default());
        let base = builder.declare_block(1);
        let recurse = builder.declare_block(1);

        builder.inst_pick(0);
        builder.inst_cc(ConditionCode::Le);
        builder.inst_branch(base, recurse);

        builder.build_block(base);
        builder.inst_return();

        builder.build_block(recurse);
        builder.inst_pick(0);
        builder.inst_uint(1);
        builder.inst_call_builtin(&SSUB_WRAP); // [n, n-1]
        builder.inst_call(sum); // [n, sum(n-1)]
        builder.inst_call_builtin(&SADD_WRAP);
        builder.inst_return();
        assert!(builder.finish());

        let mut vm = Vm::new(VmOptions {
            initial_vstack_size_in_elements: 16,
            initial_cstack_size_in_bytes: 4096,
            ..VmOptions::default()
        });
        let program = crate::program::Program::new(&module, sum).unwrap();
        let mut output = [Value::from_u64(0)];
        assert!(vm.execute(program, &[Value::from_u64(600)], &mut output));
        assert_eq!(output[0].as_u64(), 600 * 601 / 2);
    }

    #[test]
    fn test_cstack_overflow_panics() {
        // unbounded recursion must hit the cstack ceiling
        let mut module = Module::new("test");
        let forever = module.add_function("forever", Signature::new(0, 0));
        let main = module.add_function("main", Signature::new(0, 0));
        module.export_function(main);

        let mut builder = Builder::for_function(&mut module, forever, BuildOptions::default());
        builder.inst_call(forever);
        builder.inst_return();
        assert!(builder.finish());

        let mut builder = Builder::for_function(&mut module, main, BuildOptions::default());
        builder.inst_call(forever);
        builder.inst_return();
        assert!(builder.finish());

        let mut vm = Vm::new(VmOptions {
            max_cstack_size_in_bytes: 64 * 1024,
            ..VmOptions::default()
        });
        let program = crate::program::Program::new(&module, main).unwrap();
        let captured = crate::test_helper::capture_panics(&mut vm);
        assert!(!vm.execute(program, &[], &mut []));
        assert_eq!(captured.take().unwrap(), "cstack overflow");
    }

    #[test]
    fn test_builtin_step_limit() {
        // divisions consume a runtime value, so constant folding does
        // not eliminate them, and a division can panic, so every call
        // goes through the register-publishing (and step-counting)
        // builtin dispatch
        use crate::libs::int::SDIV_WRAP;

        let module = single_function_module(Signature::new(1, 1), |builder| {
            for _ in 0..100 {
                builder.inst_uint(1);
                builder.inst_call_builtin(&SDIV_WRAP);
            }
            builder.inst_return();
        });

        let mut vm = Vm::new(VmOptions {
            step_limit: 10,
            ..VmOptions::default()
        });
        let program = crate::program::Program::new(
            &module,
            module.find_function_by_name("main").unwrap(),
        )
        .unwrap();
        let captured = crate::test_helper::capture_panics(&mut vm);
        let mut output = [Value::from_u64(0)];
        assert!(!vm.execute(program, &[Value::from_u64(0)], &mut output));
        assert_eq!(captured.take().unwrap(), "step limit exceeded");
    }
}
