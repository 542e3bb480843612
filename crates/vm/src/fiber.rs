// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

// A fiber is a cooperative coroutine with its own value stack, call
// stack and saved register triple.
//
// The fiber record is written at the base of the first page of its own
// call stack, so destroying the call stack destroys the record. The
// record is addressable by the guest only through a poisoned, zero-size
// "handle" allocation that exists purely to validate handle addresses.
//
// State machine:
//
//        create      resume         suspend
// ready ──────▶ ready ────▶ running ─────▶ suspended
//                             │               │
//                             │ exit          │ resume
//                             ▼               ▼
//                            done          running

use std::mem::{offset_of, size_of};
use std::ptr;

use stavm_memory::Allocation;
use stavm_types::{inst::Inst, opcode::Opcode, Address, Value, VALUE_SIZE_IN_BYTES};

use crate::{
    function::Function,
    process::{Process, Registers},
    stack::{Cstack, StackFrame, Vstack, MAX_FRAME_SIZE_IN_BYTES},
};

/// the shared trampoline every fiber starts in. resuming always
/// increments the instruction pointer first, so the leading `nop` makes
/// the first real step the `call`; its offset of zero targets the
/// function recorded in the trampoline frame itself.
pub(crate) static TRAMPOLINE_CODE: [Inst; 3] = [
    Inst::none(Opcode::nop),
    Inst::none(Opcode::call),
    Inst::none(Opcode::exit),
];

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberStatus {
    Ready,
    Suspended,
    Running,
    Done,
}

#[repr(C)]
pub struct Fiber {
    pub(crate) status: FiberStatus,
    /// while suspended: the number of values the resumer must supply
    pub(crate) expected_argument_count: u8,

    /// the handle allocation validating guest addresses of this fiber
    pub(crate) handle_allocation: u32,
    pub(crate) handle_generation: u8,

    pub(crate) vstack: Vstack,
    pub(crate) cstack: Cstack,

    /// the saved registers, meaningful only while suspended or ready
    pub(crate) suspension_point: Registers,
    /// the fiber to transfer control back to on suspend
    pub(crate) parent: Address,

    /// the very base of the call-frame chain
    pub(crate) trampoline_frame: StackFrame,

    // intrusive list of all fibers of the process
    pub(crate) prev_fiber: *mut Fiber,
    pub(crate) next_fiber: *mut Fiber,
}

impl Fiber {
    /// create a fiber running the function, in state ready.
    ///
    /// the call stack is created first because its first page also
    /// provides the storage for the fiber record itself.
    pub(crate) fn create(process: &mut Process, function: *const Function) -> *mut Fiber {
        let page_allocator = &mut process.vm.page_allocator;
        let cstack = Cstack::init(page_allocator, process.vm.initial_cstack_size);
        let vstack = Vstack::init(page_allocator, process.vm.initial_vstack_size);

        let fiber_ptr = cstack.base_memory() as *mut Fiber;
        debug_assert!(size_of::<Fiber>() <= MAX_FRAME_SIZE_IN_BYTES);

        let handle = process.memory.new_allocation(Allocation::fiber(fiber_ptr as *mut u8));

        let vstack_base = vstack.base();
        let signature = unsafe { (*function).signature };
        unsafe {
            ptr::write(
                fiber_ptr,
                Fiber {
                    status: FiberStatus::Ready,
                    expected_argument_count: signature.input_count,
                    handle_allocation: handle.allocation,
                    handle_generation: handle.generation,
                    vstack,
                    cstack,
                    suspension_point: Registers {
                        ip: TRAMPOLINE_CODE.as_ptr(),
                        vsp: vstack_base,
                        fp: ptr::null_mut(),
                    },
                    parent: Address::NULL,
                    trampoline_frame: StackFrame {
                        function,
                        return_ip: ptr::null(),
                        prev: ptr::null_mut(),
                        first_local_alloc: 0,
                        next_offset: (size_of::<Fiber>() - offset_of!(Fiber, trampoline_frame))
                            as u32,
                        local_generation: 0,
                    },
                    prev_fiber: ptr::null_mut(),
                    next_fiber: process.fiber_list,
                },
            );
            (*fiber_ptr).suspension_point.fp = &mut (*fiber_ptr).trampoline_frame;

            // insert at the front of the fiber list
            if !process.fiber_list.is_null() {
                (*process.fiber_list).prev_fiber = fiber_ptr;
            }
            process.fiber_list = fiber_ptr;

            log::trace!(
                "fiber created for '{}', handle allocation {}",
                (*function).name(),
                handle.allocation
            );
        }

        fiber_ptr
    }

    /// free the handle allocation, unlink and release both stacks. the
    /// record itself lives in the first call-stack page, so it is gone
    /// afterwards.
    pub(crate) fn destroy(process: &mut Process, fiber: *mut Fiber) {
        unsafe {
            if process.last_suspended == fiber {
                process.last_suspended = std::ptr::null_mut();
            }

            process
                .memory
                .get_mut((*fiber).handle_allocation)
                .status = stavm_memory::AllocationStatus::Freed;

            if (*fiber).prev_fiber.is_null() {
                process.fiber_list = (*fiber).next_fiber;
            } else {
                (*(*fiber).prev_fiber).next_fiber = (*fiber).next_fiber;
            }
            if !(*fiber).next_fiber.is_null() {
                (*(*fiber).next_fiber).prev_fiber = (*fiber).prev_fiber;
            }

            let page_allocator = &mut process.vm.page_allocator;
            (*fiber).vstack.clear(page_allocator);
            // deallocates the fiber record as well
            (*fiber).cstack.clear(page_allocator);
        }
    }

    #[inline]
    pub(crate) fn handle(&self) -> Address {
        Address::new(self.handle_allocation, self.handle_generation, 0)
    }

    #[inline]
    pub(crate) fn root_function(&self) -> *const Function {
        self.trampoline_frame.function
    }

    #[inline]
    pub(crate) fn has_resumer(&self) -> bool {
        !self.parent.is_null()
    }

    pub(crate) fn suspend(&mut self, regs: Registers, expected_argument_count: u8) {
        debug_assert!(matches!(
            self.status,
            FiberStatus::Running | FiberStatus::Ready
        ));
        self.status = FiberStatus::Suspended;
        self.suspension_point = regs;
        self.expected_argument_count = expected_argument_count;
    }

    /// resume without changing the parent link (the asymmetric half of
    /// suspend)
    pub(crate) fn resume(&mut self) {
        debug_assert!(matches!(
            self.status,
            FiberStatus::Suspended | FiberStatus::Ready
        ));
        self.status = FiberStatus::Running;
    }

    pub(crate) fn resume_by(&mut self, parent: Address) {
        self.resume();
        self.parent = parent;
    }

    /// move `count` values from the resumer's stack onto this fiber's
    /// saved stack, preserving their order. both stack pointers are
    /// adjusted. false when the count does not match what this fiber
    /// expects.
    pub(crate) fn transfer_arguments(&mut self, count: u8, vsp: &mut *mut Value) -> bool {
        debug_assert!(matches!(
            self.status,
            FiberStatus::Suspended | FiberStatus::Ready
        ));
        if count != self.expected_argument_count {
            return false;
        }

        if count > 0 {
            unsafe {
                self.suspension_point.vsp = self.suspension_point.vsp.sub(count as usize);
                ptr::copy_nonoverlapping(*vsp, self.suspension_point.vsp, count as usize);
                *vsp = vsp.add(count as usize);
            }
        }
        true
    }

    /// the depth of the value stack in elements at the given pointer
    pub(crate) fn vstack_depth_at(&self, vsp: *mut Value) -> usize {
        (self.vstack.base() as usize - vsp as usize) / VALUE_SIZE_IN_BYTES
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use stavm_types::{Signature, Value};

    use crate::{
        module::Module,
        program::Program,
        vm::{Vm, VmOptions},
    };

    // the instruction-level transfer (used by fiber_resume,
    // fiber_suspend and exit) and the host-side resume path must
    // deliver operands in the same order.
    #[test]
    fn test_transfer_and_resume_agree() {
        let mut module = Module::new("test");
        let function = module.add_function("entry", Signature::new(2, 0));
        module.export_function(function);

        let mut vm = Vm::new(VmOptions::default());
        let mut process = {
            let entry = module.function(function);
            let program = Program {
                module: &module,
                entry,
            };
            vm.start_process(program)
        };

        // host-side resume push order: input[0] first, so input[1]
        // ends up on top
        let fiber = process.current_fiber_ptr();
        unsafe {
            let mut vsp = (*fiber).suspension_point.vsp;
            for value in [Value::from_u64(1), Value::from_u64(2)] {
                vsp = vsp.sub(1);
                *vsp = value;
            }
            (*fiber).suspension_point.vsp = vsp;

            // instruction-level transfer of the same two values from a
            // scratch stack: vsp[0] is the top
            let other = crate::fiber::Fiber::create(&mut process, (*fiber).root_function());
            let mut scratch = [Value::from_u64(2), Value::from_u64(1)];
            let mut scratch_vsp = scratch.as_mut_ptr();
            assert!((*other).transfer_arguments(2, &mut scratch_vsp));

            // both fibers now hold the same operand order
            let a = (*fiber).suspension_point.vsp;
            let b = (*other).suspension_point.vsp;
            assert_eq!((*a).as_u64(), (*b).as_u64());
            assert_eq!((*a.add(1)).as_u64(), (*b.add(1)).as_u64());

            // arity mismatch is rejected
            let mut scratch_vsp = scratch.as_mut_ptr();
            assert!(!(*other).transfer_arguments(1, &mut scratch_vsp));
        }
    }

    #[test]
    fn test_fiber_record_lives_in_the_call_stack() {
        let mut module = Module::new("test");
        let function = module.add_function("entry", Signature::new(0, 0));
        module.export_function(function);

        let mut vm = Vm::new(VmOptions::default());
        let entry = module.function(function);
        let program = Program {
            module: &module,
            entry,
        };
        let process = vm.start_process(program);

        let fiber = process.current_fiber_ptr();
        unsafe {
            assert_eq!(
                fiber as usize,
                (*fiber).cstack.base_memory() as usize,
                "the fiber record sits at the base of its own call stack"
            );
            // the trampoline frame chains into the memory right behind
            // the record
            let next = (*fiber).trampoline_frame.next_frame();
            assert_eq!(
                next as usize,
                fiber as usize + std::mem::size_of::<crate::fiber::Fiber>()
            );
        }
    }
}
