// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

// The two stacks of a fiber.
//
// The value stack grows DOWNWARD through a page block: `base()` is the
// high end, the stack pointer starts there and moves toward `limit()`.
// `vsp[0]` is the top of the stack, `vsp[1]` the value below, etc.
//
// The call stack is a chain of single OS pages. A frame is placed
// behind the previous frame's local storage and never moves, so local
// allocations can hand out stable pointers into it:
//
// | page                                          |
// | chunk | frame | locals | frame | locals | ... |
//           ^fp              ^fp->next_frame()
//
// A frame that does not fit into the remainder of its page spills to
// the start of the next one.

use std::mem::size_of;
use std::ptr;

use stavm_allocator::{PageAllocator, PageBlock, PAGE_SIZE};
use stavm_types::{inst::Inst, Value, VALUE_SIZE_IN_BYTES};

use crate::function::Function;

/// a call frame, trailed by the frame's local-variable storage.
#[repr(C)]
pub struct StackFrame {
    /// the current function, also the anchor for compressed offsets
    pub function: *const Function,
    /// where to continue when the call finishes
    pub return_ip: *const Inst,
    /// the previous stack frame, null marks a trampoline frame
    pub prev: *mut StackFrame,
    /// the allocation of the first `local_alloc`, meaningful only when
    /// the function has any
    pub first_local_alloc: u32,
    /// the distance from this frame to where the next frame can be put,
    /// grows as local allocations are made
    pub next_offset: u32,
    /// the table generation of the local allocations
    pub local_generation: u8,
}

impl StackFrame {
    #[inline]
    pub fn next_frame(&mut self) -> *mut u8 {
        unsafe { (self as *mut StackFrame as *mut u8).add(self.next_offset as usize) }
    }

    #[inline]
    pub fn is_trampoline_frame(&self) -> bool {
        self.prev.is_null()
    }
}

/// the biggest frame (header plus locals) that fits into one call-stack
/// page, enforced by the builder
pub const MAX_FRAME_SIZE_IN_BYTES: usize = PAGE_SIZE - size_of::<CstackChunk>();

//
// value stack
//

pub struct Vstack {
    block: PageBlock,
}

impl Vstack {
    pub fn init(allocator: &mut PageAllocator, size_in_elements: usize) -> Self {
        Self {
            block: allocator.allocate(size_in_elements * VALUE_SIZE_IN_BYTES),
        }
    }

    /// the high end, where the stack pointer of an empty stack sits
    #[inline]
    pub fn base(&self) -> *mut Value {
        unsafe { (self.block.ptr as *mut Value).add(self.capacity()) }
    }

    /// the low end, the stack is full when the pointer reaches it
    #[inline]
    pub fn limit(&self) -> *mut Value {
        self.block.ptr as *mut Value
    }

    /// capacity in elements
    #[inline]
    pub fn capacity(&self) -> usize {
        self.block.size / VALUE_SIZE_IN_BYTES
    }

    /// double the capacity, moving the live values to the top of the
    /// new block. the result is the relocated stack pointer.
    pub fn grow(&mut self, allocator: &mut PageAllocator, vsp: *mut Value) -> *mut Value {
        let used = (self.base() as usize - vsp as usize) / VALUE_SIZE_IN_BYTES;

        let new_block = allocator.allocate(self.block.size * 2);
        let new_capacity = new_block.size / VALUE_SIZE_IN_BYTES;
        let new_vsp = unsafe { (new_block.ptr as *mut Value).add(new_capacity - used) };
        unsafe {
            ptr::copy_nonoverlapping(vsp, new_vsp, used);
        }

        allocator.deallocate(self.block);
        self.block = new_block;
        new_vsp
    }

    pub fn clear(&mut self, allocator: &mut PageAllocator) {
        allocator.deallocate(self.block);
        self.block = PageBlock {
            ptr: ptr::null_mut(),
            size: 0,
        };
    }
}

//
// call stack
//

/// every call-stack page starts with this header
#[repr(C)]
pub struct CstackChunk {
    next: *mut CstackChunk,
}

impl CstackChunk {
    #[inline]
    fn memory(chunk: *mut CstackChunk) -> *mut u8 {
        unsafe { (chunk as *mut u8).add(size_of::<CstackChunk>()) }
    }

    #[inline]
    fn end(chunk: *mut CstackChunk) -> *mut u8 {
        unsafe { (chunk as *mut u8).add(PAGE_SIZE) }
    }

    /// the chunk containing the frame, every chunk is one aligned page
    #[inline]
    fn chunk_of(address: *mut u8) -> *mut CstackChunk {
        PageAllocator::page_of(address) as *mut CstackChunk
    }
}

pub struct Cstack {
    first: *mut CstackChunk,
}

impl Cstack {
    pub fn init(allocator: &mut PageAllocator, size_in_bytes: usize) -> Self {
        let page_count = PageAllocator::page_count_for(size_in_bytes).max(1);

        // chunks are chained single pages so a frame pointer can be
        // masked down to its chunk
        let mut first: *mut CstackChunk = ptr::null_mut();
        for _ in 0..page_count {
            let block = allocator.allocate(PAGE_SIZE);
            let chunk = block.ptr as *mut CstackChunk;
            unsafe {
                ptr::write(chunk, CstackChunk { next: first });
            }
            first = chunk;
        }

        Self { first }
    }

    /// the memory at the base of the first page, the fiber record lives
    /// here
    #[inline]
    pub fn base_memory(&self) -> *mut u8 {
        CstackChunk::memory(self.first)
    }

    /// capacity in bytes, a page per chunk
    pub fn capacity(&self) -> usize {
        let mut result = 0;
        let mut cur = self.first;
        while !cur.is_null() {
            result += PAGE_SIZE;
            cur = unsafe { (*cur).next };
        }
        result
    }

    /// place the callee frame behind the caller's locals, spilling to
    /// the next page when it does not fit. None means the chain is
    /// exhausted and the stack must grow.
    pub fn new_call_frame(
        &mut self,
        frame_ptr: *mut StackFrame,
        callee: &Function,
        ip: *const Inst,
    ) -> Option<*mut StackFrame> {
        let mut chunk = CstackChunk::chunk_of(frame_ptr as *mut u8);
        let mut next_frame = unsafe { (*frame_ptr).next_frame() };

        let remaining = CstackChunk::end(chunk) as usize - next_frame as usize;
        if callee.max_cstack_size as usize > remaining {
            chunk = unsafe { (*chunk).next };
            if chunk.is_null() {
                return None;
            }
            next_frame = CstackChunk::memory(chunk);
        }

        let frame = next_frame as *mut StackFrame;
        unsafe {
            ptr::write(
                frame,
                StackFrame {
                    function: callee,
                    return_ip: ip.wrapping_add(1),
                    prev: frame_ptr,
                    first_local_alloc: 0,
                    next_offset: size_of::<StackFrame>() as u32,
                    local_generation: 0,
                },
            );
        }
        Some(frame)
    }

    /// chain one more page behind the chunk of the frame
    pub fn grow(&mut self, allocator: &mut PageAllocator, frame_ptr: *mut StackFrame) {
        let chunk = CstackChunk::chunk_of(frame_ptr as *mut u8);
        debug_assert!(unsafe { (*chunk).next }.is_null());

        let block = allocator.allocate(PAGE_SIZE);
        let new_chunk = block.ptr as *mut CstackChunk;
        unsafe {
            ptr::write(new_chunk, CstackChunk { next: ptr::null_mut() });
            (*chunk).next = new_chunk;
        }
    }

    /// return every page, including the one holding the fiber record
    pub fn clear(&mut self, allocator: &mut PageAllocator) {
        let mut cur = self.first;
        while !cur.is_null() {
            let next = unsafe { (*cur).next };
            allocator.deallocate(PageBlock {
                ptr: cur as *mut u8,
                size: PAGE_SIZE,
            });
            cur = next;
        }
        self.first = ptr::null_mut();
    }
}

#[cfg(test)]
mod tests {
    use std::mem::size_of;
    use std::ptr;

    use pretty_assertions::assert_eq;
    use stavm_allocator::{PageAllocator, PAGE_SIZE};
    use stavm_types::{Signature, Value};

    use crate::{
        function::Function,
        stack::{Cstack, StackFrame, Vstack},
    };

    #[test]
    fn test_vstack_grow_preserves_values() {
        let mut allocator = PageAllocator::new();
        let mut vstack = Vstack::init(&mut allocator, 512);
        let capacity = vstack.capacity();

        let mut vsp = vstack.base();
        for value in 0..10u64 {
            unsafe {
                vsp = vsp.sub(1);
                *vsp = Value::from_u64(value);
            }
        }

        vsp = vstack.grow(&mut allocator, vsp);
        assert_eq!(vstack.capacity(), capacity * 2);
        // the live values keep their order relative to the new base
        for index in 0..10usize {
            let value = unsafe { *vstack.base().sub(index + 1) };
            assert_eq!(value.as_u64(), index as u64);
        }
        assert_eq!(
            (vstack.base() as usize - vsp as usize) / 8,
            10,
            "stack pointer must keep the same depth"
        );

        vstack.clear(&mut allocator);
    }

    #[test]
    fn test_cstack_frames_and_page_spill() {
        let mut allocator = PageAllocator::new();
        let mut cstack = Cstack::init(&mut allocator, PAGE_SIZE);
        assert_eq!(cstack.capacity(), PAGE_SIZE);

        // a pseudo caller frame at the base of the stack
        let base_frame = cstack.base_memory() as *mut StackFrame;
        unsafe {
            ptr::write(
                base_frame,
                StackFrame {
                    function: ptr::null(),
                    return_ip: ptr::null(),
                    prev: ptr::null_mut(),
                    first_local_alloc: 0,
                    next_offset: size_of::<StackFrame>() as u32,
                    local_generation: 0,
                },
            );
        }

        let mut callee = Function::new("callee", Signature::new(0, 0), 0);
        callee.max_cstack_size = 2048;

        let frame1 = cstack
            .new_call_frame(base_frame, &callee, ptr::null())
            .unwrap();
        unsafe {
            assert_eq!((*frame1).prev, base_frame);
            (*frame1).next_offset = 2048;
        }

        // the second 2 KiB frame does not fit behind the first, the
        // chain is exhausted
        assert!(cstack.new_call_frame(frame1, &callee, ptr::null()).is_none());

        cstack.grow(&mut allocator, frame1);
        assert_eq!(cstack.capacity(), 2 * PAGE_SIZE);
        let frame2 = cstack
            .new_call_frame(frame1, &callee, ptr::null())
            .unwrap();
        // the spilled frame starts at the base of the new page
        assert_eq!(
            frame2 as usize % PAGE_SIZE,
            size_of::<super::CstackChunk>(),
        );

        cstack.clear(&mut allocator);
    }
}
