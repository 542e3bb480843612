// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

use std::any::Any;

use stavm_allocator::{HeapAllocator, PageAllocator, SystemAllocator};
use stavm_types::Value;

use crate::{process::Process, program::Program, stacktrace::Stacktrace};

/// invoked before a panic unwinds, with the process still inspectable
pub type PanicHandler = fn(process: &Process, message: &str);

pub fn default_panic_handler(process: &Process, message: &str) {
    log::error!("panic: {}", message);
    if let Some(handle) = process.current_fiber() {
        for line in Stacktrace::capture(process, handle).entries() {
            log::error!("  at {}", line);
        }
    }
}

pub struct VmOptions {
    pub initial_vstack_size_in_elements: usize,
    pub max_vstack_size_in_elements: usize,
    pub initial_cstack_size_in_bytes: usize,
    pub max_cstack_size_in_bytes: usize,
    /// per-process upper bound of builtin-dispatch steps, 0 = unlimited
    pub step_limit: usize,
    pub panic_handler: PanicHandler,
    pub allocator: Box<dyn HeapAllocator>,
    pub user_data: Option<Box<dyn Any>>,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            initial_vstack_size_in_elements: 1024,
            max_vstack_size_in_elements: 16 * 1024,
            initial_cstack_size_in_bytes: 16 * 1024,
            max_cstack_size_in_bytes: 512 * 1024,
            step_limit: 0,
            panic_handler: default_panic_handler,
            allocator: Box::new(SystemAllocator),
            user_data: None,
        }
    }
}

/// the execution engine: configured limits, the page supply and the
/// heap allocator. processes borrow the VM while they run.
pub struct Vm {
    /// elements
    pub(crate) initial_vstack_size: usize,
    /// elements
    pub(crate) max_vstack_size: usize,
    /// bytes
    pub(crate) initial_cstack_size: usize,
    /// bytes
    pub(crate) max_cstack_size: usize,
    pub(crate) step_limit: usize,
    pub(crate) panic_handler: PanicHandler,
    pub(crate) page_allocator: PageAllocator,
    pub(crate) heap_allocator: Box<dyn HeapAllocator>,
    pub(crate) user_data: Option<Box<dyn Any>>,
}

impl Vm {
    pub fn new(options: VmOptions) -> Self {
        Self {
            initial_vstack_size: options.initial_vstack_size_in_elements,
            max_vstack_size: options.max_vstack_size_in_elements,
            initial_cstack_size: options.initial_cstack_size_in_bytes,
            max_cstack_size: options.max_cstack_size_in_bytes,
            step_limit: options.step_limit,
            panic_handler: options.panic_handler,
            page_allocator: PageAllocator::new(),
            heap_allocator: options.allocator,
            user_data: options.user_data,
        }
    }

    /// swap the panic handler, the result is the previous one
    pub fn set_panic_handler(&mut self, handler: PanicHandler) -> PanicHandler {
        std::mem::replace(&mut self.panic_handler, handler)
    }

    /// start a process with a ready entry fiber, to be driven through
    /// [Process::resume]
    pub fn start_process<'a>(&'a mut self, program: Program<'a>) -> Process<'a> {
        Process::new(self, program)
    }

    /// start, resume to completion and tear down in one step
    pub fn execute<'a>(
        &'a mut self,
        program: Program<'a>,
        input: &[Value],
        output: &mut [Value],
    ) -> bool {
        let mut process = Process::new(self, program);
        let entry = match process.current_fiber() {
            Some(handle) => handle,
            None => return false,
        };
        process.resume_until_completion(entry, input, output)
    }
}
