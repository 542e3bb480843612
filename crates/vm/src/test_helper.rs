// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! helpers shared by the unit tests: building one-function modules and
//! running them with panic capture.

use std::cell::RefCell;

use stavm_types::{Signature, Value};

use crate::{
    builder::{BuildOptions, Builder},
    module::Module,
    process::Process,
    program::Program,
    vm::{Vm, VmOptions},
};

thread_local! {
    static LAST_PANIC: RefCell<Option<String>> = const { RefCell::new(None) };
}

fn recording_panic_handler(_process: &Process, message: &str) {
    LAST_PANIC.with(|cell| *cell.borrow_mut() = Some(message.to_owned()));
}

pub struct CapturedPanic;

impl CapturedPanic {
    pub fn take(&self) -> Option<String> {
        LAST_PANIC.with(|cell| cell.borrow_mut().take())
    }
}

/// route panics of this VM into a thread-local slot for assertions
pub fn capture_panics(vm: &mut Vm) -> CapturedPanic {
    LAST_PANIC.with(|cell| cell.borrow_mut().take());
    vm.set_panic_handler(recording_panic_handler);
    CapturedPanic
}

/// a module with one exported function "main" built by the closure
pub fn single_function_module(
    signature: Signature,
    body: impl FnOnce(&mut Builder),
) -> Module {
    let mut module = Module::new("test");
    let main = module.add_function("main", signature);
    module.export_function(main);

    let mut builder = Builder::for_function(&mut module, main, BuildOptions::default());
    body(&mut builder);
    assert!(builder.finish(), "build failed");
    module
}

fn run(module: &Module, input: &[Value], output_count: usize) -> Result<Vec<Value>, String> {
    let main = module.find_function_by_name("main").expect("no main");
    let program = Program::new(module, main).expect("invalid program");

    let mut vm = Vm::new(VmOptions::default());
    let captured = capture_panics(&mut vm);
    let mut output = vec![Value::from_u64(0); output_count];
    if vm.execute(program, input, &mut output) {
        Ok(output)
    } else {
        Err(captured
            .take()
            .unwrap_or_else(|| "(no panic message)".to_owned()))
    }
}

pub fn run_ok(module: &Module, input: &[u64], output_count: usize) -> Vec<u64> {
    let input: Vec<Value> = input.iter().map(|value| Value::from_u64(*value)).collect();
    run(module, &input, output_count)
        .expect("execution panicked")
        .iter()
        .map(|value| value.as_u64())
        .collect()
}

pub fn run_ok_signed(module: &Module, input: &[i64], output_count: usize) -> Vec<i64> {
    let input: Vec<Value> = input.iter().map(|value| Value::from_i64(*value)).collect();
    run(module, &input, output_count)
        .expect("execution panicked")
        .iter()
        .map(|value| value.as_i64())
        .collect()
}

pub fn run_panic(module: &Module, input: &[u64]) -> String {
    let input: Vec<Value> = input.iter().map(|value| Value::from_u64(*value)).collect();
    run(module, &input, 0).expect_err("execution did not panic")
}

pub fn run_panic_signed(module: &Module, input: &[i64]) -> String {
    let input: Vec<Value> = input.iter().map(|value| Value::from_i64(*value)).collect();
    run(module, &input, 0).expect_err("execution did not panic")
}

pub fn run_main(module: &Module, input: &[u64], output_count: usize) -> Vec<u64> {
    run_ok(module, input, output_count)
}

pub fn run_main_panic(module: &Module, input: &[u64]) -> String {
    run_panic(module, input)
}
