// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

// The garbage collector: conservative, tracing, stop-the-world, and
// only ever run on demand.
//
// Roots are the current fiber handle, every value-stack slot and every
// call-frame local area of every fiber (each 8-byte word is treated as
// a potential address), and every allocation explicitly declared
// reachable. Everything transitively reachable from there survives,
// unreachable heap allocations are freed and unreachable fibers
// destroyed.

use std::mem::size_of;

use stavm_memory::{Allocation, AllocationSource, AllocationStatus, AllocationSplit, GcTracking};
use stavm_types::{Value, VALUE_SIZE_IN_BYTES};

use crate::{fiber::Fiber, process::Process, stack::StackFrame};

impl Process<'_> {
    /// collect unreachable heap allocations and fibers, the result is
    /// the number of heap bytes freed
    pub fn gc(&mut self) -> usize {
        let mut pending: Vec<u32> = Vec::new();

        // the current fiber stays alive even when no value references
        // its handle
        if !self.cur_fiber.is_null() {
            let handle = unsafe { (*self.cur_fiber).handle_allocation };
            mark_reachable(self, &mut pending, handle);
        }

        // conservative roots: the stacks of every fiber, including
        // unreachable ones. an unreachable fiber is collected in this
        // run, whatever became unreferenced through it goes in the
        // next.
        let mut fiber = self.fiber_list;
        while !fiber.is_null() {
            scan_fiber_stacks(self, &mut pending, fiber);
            fiber = unsafe { (*fiber).next_fiber };
        }

        // explicitly-declared roots
        for index in 0..self.memory.len() as u32 {
            let allocation = *self.memory.get(index);
            if allocation.gc == GcTracking::ReachableExplicit
                && allocation.status != AllocationStatus::Freed
            {
                scan_allocation(self, &mut pending, allocation);
            }
        }

        // transitive closure
        while let Some(index) = pending.pop() {
            let allocation = *self.memory.get(index);
            scan_allocation(self, &mut pending, allocation);
        }

        // sweep: free unreachable heap memory, destroy unreachable
        // fibers, reset the marks for the next run
        let mut bytes_freed = 0usize;
        for index in 0..self.memory.len() as u32 {
            let allocation = *self.memory.get(index);

            if allocation.source == AllocationSource::Heap
                && allocation.status != AllocationStatus::Freed
                && allocation.split == AllocationSplit::Unsplit
                && allocation.gc == GcTracking::Unreachable
            {
                self.vm
                    .heap_allocator
                    .free_alloc(allocation.ptr, allocation.size as usize);
                self.memory.get_mut(index).status = AllocationStatus::Freed;
                bytes_freed += allocation.size as usize;
            } else if allocation.source == AllocationSource::Fiber
                && allocation.status != AllocationStatus::Freed
                && allocation.gc == GcTracking::Unreachable
            {
                Fiber::destroy(self, allocation.ptr as *mut Fiber);
                debug_assert_eq!(self.memory.get(index).status, AllocationStatus::Freed);
            }

            let allocation = self.memory.get_mut(index);
            if allocation.gc != GcTracking::ReachableExplicit {
                allocation.gc = GcTracking::Unreachable;
            }
        }

        log::trace!("gc freed {} heap bytes", bytes_freed);
        bytes_freed
    }
}

/// mark the allocation reachable and queue it for scanning when its
/// reachability was still undetermined
fn mark_reachable(process: &mut Process, pending: &mut Vec<u32>, index: u32) {
    let allocation = process.memory.get_mut(index);
    if allocation.status != AllocationStatus::Freed && allocation.gc == GcTracking::Unreachable {
        allocation.gc = GcTracking::Reachable;
        pending.push(index);
    }
}

/// treat a word as a potential address and mark its allocation.
/// one-past-the-end offsets count as references so provenance
/// addresses keep their allocation alive.
fn mark_value(process: &mut Process, pending: &mut Vec<u32>, value: Value) {
    let address = value.as_address();
    let index = match process.memory.try_get(address) {
        Some(allocation) if address.offset <= allocation.size => address.allocation,
        _ => return,
    };
    mark_reachable(process, pending, index);
}

/// walk the allocation's memory as an array of values. weak
/// allocations are reached but never traversed.
fn scan_allocation(process: &mut Process, pending: &mut Vec<u32>, allocation: Allocation) {
    if (allocation.size as usize) < VALUE_SIZE_IN_BYTES || allocation.is_gc_weak {
        return;
    }

    // align the scan window for whole values
    let start = allocation.ptr as usize;
    let aligned = (start + VALUE_SIZE_IN_BYTES - 1) & !(VALUE_SIZE_IN_BYTES - 1);
    let count = (allocation.size as usize - (aligned - start)) / VALUE_SIZE_IN_BYTES;

    scan_values(process, pending, aligned as *const Value, count);
}

fn scan_values(process: &mut Process, pending: &mut Vec<u32>, ptr: *const Value, count: usize) {
    for index in 0..count {
        let value = unsafe { *ptr.add(index) };
        mark_value(process, pending, value);
    }
}

/// roots from one fiber: every live value-stack slot, and the local
/// area of every call frame (locals whose address never escaped have
/// no allocation record but still hold references)
fn scan_fiber_stacks(process: &mut Process, pending: &mut Vec<u32>, fiber: *mut Fiber) {
    unsafe {
        // the registers are authoritative for the running fiber, but
        // only once they have been published (a host-invoked gc can
        // see a ready fiber that never ran)
        let is_current = fiber == process.cur_fiber && !process.regs.vsp.is_null();

        let vsp = if is_current {
            process.regs.vsp
        } else {
            (*fiber).suspension_point.vsp
        };
        // a fiber that panicked before publishing registers has no
        // scannable stack
        if !vsp.is_null() {
            let depth = (*fiber).vstack_depth_at(vsp);
            scan_values(process, pending, vsp, depth);
        }

        let mut frame = if is_current {
            process.regs.fp
        } else {
            (*fiber).suspension_point.fp
        };
        while !frame.is_null() && !(*frame).is_trampoline_frame() {
            let local_area = (frame as *const u8).add(size_of::<StackFrame>());
            let local_bytes = (*frame).next_offset as usize - size_of::<StackFrame>();
            scan_values(
                process,
                pending,
                local_area as *const Value,
                local_bytes / VALUE_SIZE_IN_BYTES,
            );
            frame = (*frame).prev;
        }
    }
}
