// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

use stavm_types::Address;

use crate::{module::DebugLocation, process::Process};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StacktraceEntry {
    pub function_name: String,
    pub inst_index: usize,
    pub location: Option<DebugLocation>,
}

impl std::fmt::Display for StacktraceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.location {
            Some(location) => write!(
                f,
                "{} <+{}> ({}:{})",
                self.function_name, self.inst_index, location.line, location.column
            ),
            None => write!(f, "{} <+{}>", self.function_name, self.inst_index),
        }
    }
}

/// a post-panic (or mid-suspension) view of a fiber's call chain,
/// innermost frame first
pub struct Stacktrace {
    entries: Vec<StacktraceEntry>,
}

impl Stacktrace {
    /// walk the (ip, frame) pairs from the suspension point downward.
    /// each parent frame reports the call instruction, which sits one
    /// before the recorded return address.
    pub fn capture(process: &Process, fiber: Address) -> Stacktrace {
        let mut entries = Vec::new();

        let fiber = match process.get_fiber_ptr(fiber) {
            Some(fiber) => fiber,
            None => return Stacktrace { entries },
        };

        unsafe {
            let mut ip = (*fiber).suspension_point.ip;
            let mut frame = (*fiber).suspension_point.fp;

            while !frame.is_null() && !(*frame).is_trampoline_frame() {
                let function = &*(*frame).function;
                let inst_index = function.inst_index_of(ip).unwrap_or(0);
                entries.push(StacktraceEntry {
                    function_name: function.name().to_owned(),
                    inst_index,
                    location: process
                        .program
                        .module
                        .debug_location_of(function.function_index(), inst_index as u32),
                });

                // the caller's call instruction is one before the
                // recorded return address
                ip = (*frame).return_ip.wrapping_sub(1);
                frame = (*frame).prev;
            }
        }

        Stacktrace { entries }
    }

    pub fn entries(&self) -> &[StacktraceEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use stavm_types::{Signature, Value};

    use crate::{
        builder::{BuildOptions, Builder},
        module::{DebugLocation, Module},
        program::Program,
        stacktrace::Stacktrace,
        test_helper::capture_panics,
        vm::{Vm, VmOptions},
    };

    #[test]
    fn test_stacktrace_after_panic() {
        let mut module = Module::new("test");
        let inner = module.add_function("inner", Signature::new(0, 0));
        let outer = module.add_function("outer", Signature::new(0, 0));
        let main = module.add_function("main", Signature::new(0, 0));
        module.export_function(main);

        let mut builder = Builder::for_function(&mut module, inner, BuildOptions::default());
        builder.debug_location(DebugLocation { line: 7, column: 3 });
        let message = builder.string_literal("inner exploded");
        builder.inst_global_addr(message);
        builder.inst_panic();
        assert!(builder.finish());

        let mut builder = Builder::for_function(&mut module, outer, BuildOptions::default());
        builder.inst_call(inner);
        builder.inst_return();
        assert!(builder.finish());

        let mut builder = Builder::for_function(&mut module, main, BuildOptions::default());
        builder.inst_call(outer);
        builder.inst_return();
        assert!(builder.finish());

        let mut vm = Vm::new(VmOptions::default());
        let captured = capture_panics(&mut vm);
        let program = Program::new(&module, main).unwrap();
        let mut process = vm.start_process(program);
        let fiber = process.current_fiber().unwrap();
        assert!(!process.resume(fiber, &[], &mut [] as &mut [Value]));
        assert_eq!(captured.take().unwrap(), "inner exploded");

        // the panicked fiber stays suspended and inspectable
        let trace = Stacktrace::capture(&process, fiber);
        let names: Vec<&str> = trace
            .entries()
            .iter()
            .map(|entry| entry.function_name.as_str())
            .collect();
        assert_eq!(names, vec!["inner", "outer", "main"]);
        assert_eq!(
            trace.entries()[0].location,
            Some(DebugLocation { line: 7, column: 3 })
        );
    }
}
