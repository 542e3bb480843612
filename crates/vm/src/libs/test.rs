// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

use std::cell::RefCell;

use stavm_types::Signature;

use crate::{
    builtin::{Builtin, BuiltinFlags},
    interpreter::{HandleResult, Machine},
    process::Process,
};

/// (condition) -> (): panics when the condition is zero
pub static ASSERT: Builtin = Builtin {
    imp: assert,
    input_count: 1,
    output_count: 0,
    flags: BuiltinFlags::empty(),
    name: "assert",
};

fn assert(machine: &mut Machine) -> HandleResult {
    let condition = machine.at(0).as_u64();
    if condition == 0 {
        return machine.panic("assert failed");
    }
    machine.drop_top(1);
    HandleResult::Move(1)
}

/// (lhs, rhs) -> (): panics when the values differ
pub static ASSERT_EQ: Builtin = Builtin {
    imp: assert_eq,
    input_count: 2,
    output_count: 0,
    flags: BuiltinFlags::empty(),
    name: "assert_eq",
};

fn assert_eq(machine: &mut Machine) -> HandleResult {
    let rhs = machine.at(0).as_u64();
    let lhs = machine.at(1).as_u64();
    if lhs != rhs {
        log::debug!("assert_eq: {} != {}", lhs, rhs);
        return machine.panic("assert_eq failed");
    }
    machine.drop_top(2);
    HandleResult::Move(1)
}

/// () -> (): terminates the block, only unreachable code may follow
pub static UNREACHABLE: Builtin = Builtin {
    imp: unreachable,
    input_count: 0,
    output_count: 0,
    flags: BuiltinFlags::ALWAYS_PANIC,
    name: "unreachable",
};

fn unreachable(machine: &mut Machine) -> HandleResult {
    machine.panic("unreachable code reached")
}

thread_local! {
    static CAPTURED_PANIC: RefCell<Option<String>> = const { RefCell::new(None) };
}

fn capture_panic_handler(_process: &Process, message: &str) {
    CAPTURED_PANIC.with(|cell| *cell.borrow_mut() = Some(message.to_owned()));
}

/// (function, expected message address or null) -> ():
/// calls the function on a fresh fiber and swallows the panic it must
/// raise. a null expected message accepts any panic.
pub static ASSERT_PANIC: Builtin = Builtin {
    imp: assert_panic,
    input_count: 2,
    output_count: 0,
    flags: BuiltinFlags::VM_ONLY,
    name: "assert_panic",
};

fn assert_panic(machine: &mut Machine) -> HandleResult {
    let message_address = machine.at(0).as_address();
    let function_address = machine.at(1).as_function_address();
    let process = unsafe { &mut *machine.process };

    let expected = if message_address.is_null() {
        None
    } else {
        match process.get_cstr(message_address) {
            Some(message) => Some(message.to_owned()),
            None => return machine.panic("invalid message"),
        }
    };

    let function = match process.get_function_checked(function_address, Signature::new(0, 0)) {
        Some(function) => function,
        None => return machine.panic("invalid function"),
    };

    // temporarily capture panics instead of reporting them
    let saved_handler = process.vm.set_panic_handler(capture_panic_handler);
    CAPTURED_PANIC.with(|cell| cell.borrow_mut().take());

    let did_not_panic = process.call(function, &[], &mut []);

    process.vm.set_panic_handler(saved_handler);
    let captured = CAPTURED_PANIC.with(|cell| cell.borrow_mut().take());

    if did_not_panic {
        return machine.panic("assert_panic failed: no panic");
    }
    if let Some(expected) = expected {
        if captured.as_deref() != Some(expected.as_str()) {
            return machine.panic("assert_panic failed: different message");
        }
    }

    // the panic was consumed, execution continues
    machine.drop_top(2);
    HandleResult::Move(1)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use stavm_types::Signature;

    use crate::{
        builder::{BuildOptions, Builder},
        libs::test::{ASSERT, ASSERT_EQ, ASSERT_PANIC},
        module::Module,
        test_helper::{run_main, run_main_panic, run_ok, run_panic, single_function_module},
    };

    #[test]
    fn test_assert() {
        let module = single_function_module(Signature::new(1, 0), |builder| {
            builder.inst_call_builtin(&ASSERT);
            builder.inst_return();
        });
        assert_eq!(run_ok(&module, &[1], 0), Vec::<u64>::new());
        assert_eq!(run_panic(&module, &[0]), "assert failed");
    }

    #[test]
    fn test_assert_eq() {
        let module = single_function_module(Signature::new(2, 0), |builder| {
            builder.inst_call_builtin(&ASSERT_EQ);
            builder.inst_return();
        });
        assert_eq!(run_ok(&module, &[7, 7], 0), Vec::<u64>::new());
        assert_eq!(run_panic(&module, &[7, 8]), "assert_eq failed");
    }

    fn assert_panic_module(target_panics: bool, expect_message: Option<&str>) -> Module {
        let mut module = Module::new("test");
        let target = module.add_function("target", Signature::new(0, 0));
        let main = module.add_function("main", Signature::new(0, 0));
        module.export_function(main);

        let mut builder = Builder::for_function(&mut module, target, BuildOptions::default());
        if target_panics {
            let message = builder.string_literal("hello");
            builder.inst_global_addr(message);
            builder.inst_panic();
        } else {
            builder.inst_return();
        }
        assert!(builder.finish());

        let mut builder = Builder::for_function(&mut module, main, BuildOptions::default());
        builder.inst_function_addr(target);
        match expect_message {
            Some(message) => {
                let message = builder.string_literal(message);
                builder.inst_global_addr(message);
            }
            None => builder.inst_null(),
        }
        builder.inst_call_builtin(&ASSERT_PANIC);
        builder.inst_return();
        assert!(builder.finish());

        module
    }

    #[test]
    fn test_assert_panic_consumes_the_panic() {
        let module = assert_panic_module(true, Some("hello"));
        assert_eq!(run_main(&module, &[], 0), Vec::<u64>::new());

        // a null expected message accepts any panic
        let module = assert_panic_module(true, None);
        assert_eq!(run_main(&module, &[], 0), Vec::<u64>::new());
    }

    #[test]
    fn test_assert_panic_on_non_panicking_function() {
        let module = assert_panic_module(false, None);
        assert_eq!(run_main_panic(&module, &[]), "assert_panic failed: no panic");
    }

    #[test]
    fn test_assert_panic_message_mismatch() {
        let module = assert_panic_module(true, Some("goodbye"));
        assert_eq!(
            run_main_panic(&module, &[]),
            "assert_panic failed: different message"
        );
    }
}
