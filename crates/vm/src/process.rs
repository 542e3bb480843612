// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

use std::alloc::{alloc_zeroed, dealloc, Layout as AllocLayout};
use std::ptr;

use stavm_memory::{
    Allocation, AllocationSource, AllocationSplit, AllocationStatus, MemoryTable,
};
use stavm_types::{
    inst::Inst, Address, FunctionAddress, Layout, Signature, Value,
};

use crate::{
    fiber::{Fiber, FiberStatus},
    function::Function,
    interpreter::{execute, Machine},
    module::GlobalId,
    program::Program,
    vm::Vm,
};

/// the authoritative machine state between any two instructions
#[derive(Debug, Clone, Copy)]
pub struct Registers {
    pub ip: *const Inst,
    pub vsp: *mut Value,
    pub fp: *mut crate::stack::StackFrame,
}

impl Registers {
    pub fn null() -> Self {
        Self {
            ip: ptr::null(),
            vsp: ptr::null_mut(),
            fp: ptr::null_mut(),
        }
    }
}

/// aligned backing storage for one global of the process
pub(crate) struct GlobalBacking {
    ptr: *mut u8,
    layout: Option<AllocLayout>,
}

impl Drop for GlobalBacking {
    fn drop(&mut self) {
        if let Some(layout) = self.layout {
            unsafe { dealloc(self.ptr, layout) }
        }
    }
}

/// a running (or suspended) instance of a program.
///
/// the process owns the allocation table and the fibers, the VM only
/// supplies pages, the heap allocator and the configured limits. the
/// register triple is authoritative only between dispatcher steps, on
/// suspension it is copied into the fiber.
pub struct Process<'a> {
    pub(crate) vm: &'a mut Vm,
    pub(crate) program: Program<'a>,

    pub(crate) cur_fiber: *mut Fiber,
    pub(crate) memory: MemoryTable,
    pub(crate) fiber_list: *mut Fiber,

    /// the fiber that last returned control to the host, used to find
    /// the delivering fiber when `cur_fiber` was cleared
    pub(crate) last_suspended: *mut Fiber,

    /// lazily published whenever the process is exposed to user code:
    /// before a builtin call and before panicking
    pub(crate) regs: Registers,

    pub(crate) remaining_steps: usize,

    global_backing: Vec<GlobalBacking>,
}

impl<'a> Process<'a> {
    pub(crate) fn new(vm: &'a mut Vm, program: Program<'a>) -> Process<'a> {
        let mut process = Process {
            vm,
            program,
            cur_fiber: ptr::null_mut(),
            memory: MemoryTable::new(),
            fiber_list: ptr::null_mut(),
            last_suspended: ptr::null_mut(),
            regs: Registers::null(),
            remaining_steps: 0,
            global_backing: Vec::new(),
        };
        process.remaining_steps = process.vm.step_limit;
        process.init_globals();

        let entry: *const Function = process.program.entry;
        process.cur_fiber = Fiber::create(&mut process, entry);
        process
    }

    /// one allocation per module global, in allocation-index order so
    /// global addresses resolve by index
    fn init_globals(&mut self) {
        for global in &self.program.module.globals {
            let (ptr, backing) = if global.size == 0 {
                // undefined globals stay zero-sized until the host
                // backs them, address formation works but any read
                // fails the bounds check
                (ptr::null_mut(), None)
            } else {
                let layout =
                    AllocLayout::from_size_align(global.size as usize, global.alignment as usize)
                        .unwrap_or(AllocLayout::new::<u8>());
                let ptr = unsafe { alloc_zeroed(layout) };
                if let Some(bytes) = global.definition_bytes() {
                    unsafe {
                        ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
                    }
                }
                (ptr, Some(layout))
            };

            self.global_backing.push(GlobalBacking {
                ptr,
                layout: backing,
            });
            self.memory
                .new_allocation(Allocation::static_(ptr, global.size, global.is_mutable));
        }
    }

    /// provide the backing memory of an undefined (native-view) global
    pub fn back_native_global(&mut self, global: GlobalId, ptr: *mut u8, size: u32) {
        let allocation_index = self.program.module.global(global).allocation_index;
        let allocation = self.memory.get_mut(allocation_index);
        allocation.ptr = ptr;
        allocation.size = size;
    }

    pub fn program(&self) -> &Program<'a> {
        &self.program
    }

    pub fn vm_user_data(&self) -> Option<&dyn std::any::Any> {
        self.vm.user_data.as_deref()
    }

    //
    // fibers
    //

    pub(crate) fn current_fiber_ptr(&self) -> *mut Fiber {
        self.cur_fiber
    }

    /// the handle of the fiber that currently has (or last had) control
    pub fn current_fiber(&self) -> Option<Address> {
        if self.cur_fiber.is_null() {
            None
        } else {
            Some(unsafe { (*self.cur_fiber).handle() })
        }
    }

    pub fn create_fiber(&mut self, function: &Function) -> Address {
        let fiber = Fiber::create(self, function);
        unsafe { (*fiber).handle() }
    }

    pub(crate) fn get_fiber_ptr(&self, handle: Address) -> Option<*mut Fiber> {
        let allocation = self.memory.try_get(handle)?;
        if allocation.status == AllocationStatus::Freed
            || allocation.source != AllocationSource::Fiber
        {
            return None;
        }
        Some(allocation.ptr as *mut Fiber)
    }

    pub fn fiber_status(&self, handle: Address) -> Option<FiberStatus> {
        self.get_fiber_ptr(handle)
            .map(|fiber| unsafe { (*fiber).status })
    }

    /// resume the fiber with the input values and run until the next
    /// suspension point.
    ///
    /// the fiber must expect exactly `input.len()` values. on return to
    /// the host, `output` receives the values the delivering fiber
    /// handed over: the function results when it finished, or the
    /// suspension outputs when it yielded (which must match the output
    /// arity unless the fiber yielded no values).
    pub fn resume(&mut self, handle: Address, input: &[Value], output: &mut [Value]) -> bool {
        let fiber = match self.get_fiber_ptr(handle) {
            Some(fiber) => fiber,
            None => return self.panic("invalid fiber handle"),
        };

        unsafe {
            if !matches!(
                (*fiber).status,
                FiberStatus::Ready | FiberStatus::Suspended
            ) {
                return self.panic("invalid fiber handle");
            }

            (*fiber).resume_by(Address::NULL);
            self.cur_fiber = fiber;

            if (*fiber).expected_argument_count as usize != input.len() {
                return self.panic("mismatched signature for fiber resume");
            }

            // the host pushes the inputs in forward order, so the last
            // one ends up on top, the same order the instruction-level
            // transfer preserves
            for value in input {
                (*fiber).suspension_point.vsp = (*fiber).suspension_point.vsp.sub(1);
                *(*fiber).suspension_point.vsp = *value;
            }

            let suspension = (*fiber).suspension_point;
            let mut machine = Machine {
                ip: suspension.ip.add(1),
                vsp: suspension.vsp,
                fp: suspension.fp,
                process: self as *mut Process,
            };
            if !execute(&mut machine) {
                return false;
            }

            // control may have ended in a different fiber
            let fiber = if self.cur_fiber.is_null() {
                self.last_suspended
            } else {
                self.cur_fiber
            };

            if (*fiber).status == FiberStatus::Done {
                let output_count = (*(*fiber).root_function()).signature().output_count as usize;
                if output_count != output.len() {
                    return self.panic("mismatched signature for fiber resume");
                }
                let mut vsp = (*fiber).vstack.base().sub(output_count);
                for index in (0..output_count).rev() {
                    output[index] = *vsp;
                    vsp = vsp.add(1);
                }
            } else {
                debug_assert_eq!((*fiber).status, FiberStatus::Suspended);
                // the values the fiber yielded sit on its own stack,
                // their count is recorded in the suspend instruction
                let yielded = (*(*fiber).suspension_point.ip).signature().input_count as usize;
                if yielded > 0 {
                    if yielded != output.len() {
                        return self.panic("mismatched signature for fiber resume");
                    }
                    for index in (0..yielded).rev() {
                        output[index] = *(*fiber).suspension_point.vsp;
                        (*fiber).suspension_point.vsp =
                            (*fiber).suspension_point.vsp.add(1);
                    }
                }
            }
        }

        true
    }

    /// resume repeatedly until the fiber chain completes, then destroy
    /// the fiber
    pub fn resume_until_completion(
        &mut self,
        handle: Address,
        input: &[Value],
        output: &mut [Value],
    ) -> bool {
        let mut success = self.resume(handle, input, output);

        if success {
            loop {
                let fiber = if self.cur_fiber.is_null() {
                    self.last_suspended
                } else {
                    self.cur_fiber
                };
                if fiber.is_null() || unsafe { (*fiber).status } == FiberStatus::Done {
                    break;
                }
                let next = unsafe { (*fiber).handle() };
                if !self.resume(next, &[], output) {
                    success = false;
                    break;
                }
            }
        }

        // destroying also cancels it when it panicked mid-run
        if self.get_fiber_ptr(handle).is_some() {
            self.destroy_fiber(handle);
        }
        success
    }

    /// a synchronous call on a fresh fiber that runs to completion,
    /// preserving the interrupted execution state of the process
    pub fn call(&mut self, function: &Function, input: &[Value], output: &mut [Value]) -> bool {
        let saved_regs = self.regs;
        let saved_fiber = self.cur_fiber;
        self.cur_fiber = ptr::null_mut();

        let handle = self.create_fiber(function);
        let success = self.resume_until_completion(handle, input, output);

        self.regs = saved_regs;
        self.cur_fiber = saved_fiber;
        success
    }

    /// cancel and deallocate a fiber.
    ///
    /// a suspended fiber's frames never executed their returns, so
    /// every local allocation in them is marked freed here before the
    /// stacks go away.
    pub fn destroy_fiber(&mut self, handle: Address) -> bool {
        let fiber = match self.get_fiber_ptr(handle) {
            Some(fiber) => fiber,
            None => return self.panic("invalid fiber handle"),
        };

        unsafe {
            if !matches!((*fiber).status, FiberStatus::Done | FiberStatus::Ready) {
                debug_assert_eq!((*fiber).status, FiberStatus::Suspended);

                let mut frame = (*fiber).suspension_point.fp;
                while !frame.is_null() && frame != &mut (*fiber).trampoline_frame as *mut _ {
                    let function = (*frame).function;
                    let first_inst = (*function).insts().first();
                    let local_alloc_count = match first_inst {
                        Some(inst)
                            if inst.opcode() == stavm_types::opcode::Opcode::setup_local_alloc =>
                        {
                            inst.value()
                        }
                        _ => 0,
                    };

                    for index in 0..local_alloc_count {
                        let allocation = self
                            .memory
                            .get_mut((*frame).first_local_alloc + index);
                        debug_assert_eq!(allocation.source, AllocationSource::Local);
                        if allocation.split != AllocationSplit::Unsplit {
                            return self.panic("cannot free split allocation");
                        }
                        allocation.status = AllocationStatus::Freed;
                    }

                    frame = (*frame).prev;
                }
            }

            if self.cur_fiber == fiber {
                self.cur_fiber = ptr::null_mut();
            }
            if self.last_suspended == fiber {
                self.last_suspended = ptr::null_mut();
            }
        }

        Fiber::destroy(self, fiber);
        self.memory.remove_freed();
        true
    }

    //
    // panics
    //

    /// report a panic: invoke the host panic handler, then suspend the
    /// current fiber so its stacktrace stays inspectable. always
    /// returns false so call sites can propagate the unwind directly.
    pub fn panic(&mut self, message: &str) -> bool {
        let handler = self.vm.panic_handler;
        handler(self, message);

        if !self.cur_fiber.is_null() {
            unsafe {
                (*self.cur_fiber).suspend(self.regs, 0);
            }
            self.last_suspended = self.cur_fiber;
            self.cur_fiber = ptr::null_mut();
        }
        false
    }

    //
    // step limit
    //

    /// lower the per-process step budget, never above the VM ceiling
    pub fn set_step_limit(&mut self, new_limit: usize) -> bool {
        let vm_limit = self.vm.step_limit;
        if vm_limit != 0 && new_limit > vm_limit {
            return false;
        }
        self.remaining_steps = new_limit;
        true
    }

    /// count one step, false when the budget is exhausted. a budget of
    /// zero means unlimited.
    #[inline]
    pub(crate) fn increment_step(&mut self) -> bool {
        if self.remaining_steps > 0 {
            self.remaining_steps -= 1;
            if self.remaining_steps == 0 {
                return false;
            }
        }
        true
    }

    //
    // host memory queries
    //

    pub fn get_const_ptr(&self, address: Address, layout: Layout) -> Option<*const u8> {
        self.memory
            .try_get(address)?
            .checked_offset(address, layout)
            .map(|ptr| ptr as *const u8)
    }

    pub fn get_mut_ptr(&mut self, address: Address, layout: Layout) -> Option<*mut u8> {
        let allocation = self.memory.try_get(address)?;
        if allocation.source.is_const() {
            return None;
        }
        allocation.checked_offset(address, layout)
    }

    /// the NUL-terminated string at the address, when the terminator is
    /// inside the allocation
    pub fn get_cstr(&self, address: Address) -> Option<&str> {
        let allocation = self.memory.try_get(address)?;
        let start = allocation.checked_offset_unsized(address)?;

        let length = (allocation.size - address.offset) as usize;
        let bytes = unsafe { std::slice::from_raw_parts(start, length) };
        let nul = bytes.iter().position(|byte| *byte == 0)?;
        std::str::from_utf8(&bytes[..nul]).ok()
    }

    pub fn get_function_by_address(&self, address: FunctionAddress) -> Option<&'a Function> {
        self.program.module.functions.get(address.index as usize)
    }

    /// like [Self::get_function_by_address], additionally checking the
    /// arity carried in the address against the requested signature
    pub fn get_function_checked(
        &self,
        address: FunctionAddress,
        signature: Signature,
    ) -> Option<&'a Function> {
        if address.input_count != signature.input_count
            || address.output_count != signature.output_count
        {
            return None;
        }
        self.get_function_by_address(address)
    }

    /// register host heap memory with the allocation table
    pub fn add_heap_allocation(&mut self, ptr: *mut u8, size: u32) -> Address {
        let generation = self.memory.cur_generation();
        self.memory
            .new_allocation(Allocation::heap(ptr, size, generation))
    }
}

impl Drop for Process<'_> {
    /// free leaked heap memory and destroy leftover fibers.
    ///
    /// of a split heap allocation only the first part can be freed (its
    /// pointer is the true base, the size is unknown so zero is
    /// passed), middle and last parts have no freeable base address.
    fn drop(&mut self) {
        let mut fibers = Vec::new();
        for allocation in self.memory.iter() {
            if allocation.status == AllocationStatus::Freed {
                continue;
            }
            match allocation.source {
                AllocationSource::Heap => match allocation.split {
                    AllocationSplit::Unsplit => self
                        .vm
                        .heap_allocator
                        .free_alloc(allocation.ptr, allocation.size as usize),
                    AllocationSplit::First => {
                        self.vm.heap_allocator.free_alloc(allocation.ptr, 0)
                    }
                    _ => {}
                },
                AllocationSource::Fiber => fibers.push(allocation.ptr as *mut Fiber),
                _ => {}
            }
        }

        for fiber in fibers {
            Fiber::destroy(self, fiber);
        }
        self.memory.clear();
    }
}
