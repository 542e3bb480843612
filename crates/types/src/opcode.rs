// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

// The instructions are fixed-width 32-bit words, the opcode occupies the
// low 8 bits of every word, the remaining 24 bits carry the payload of
// the encoding variant (see the `inst` module).
//
// Multi-word integer constants are expressed as a chain:
// `push`/`pushn` start a new value, `push2` merges bits 24..47 and
// `push3` merges bits 48..63 into the value on top of the stack.

#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[allow(non_camel_case_types)]
pub enum Opcode {
    //
    // control flow
    //

    nop = 0x0,          // do nothing
    block,              // basic block marker                   (signature: input_count, output_count)
    return_,            // return from the current function
    return_free,        // return and free local allocations    (value: local allocation count)
    jump,               // unconditional jump                   (offset: instruction delta)
    branch_false,       // pop, jump when zero                  (offset)
    branch_eq,          // jump and pop when zero,
                        // fall through WITHOUT popping         (offset)
    branch_ne,          // pop, jump when non-zero              (offset)
    branch_lt,          // pop, jump when negative              (offset)
    branch_le,          // pop, jump when zero or negative      (offset)
    branch_ge,          // pop, jump when zero or positive      (offset)
    branch_gt,          // pop, jump when positive              (offset)
    panic,              // pop a message address and panic
    exit,               // finish the current fiber

    //
    // calls
    //

    call = 0x10,        // direct call                          (offset: function index delta from the current function)
    call_indirect,      // pop a function address and call      (signature)
    call_builtin,       // builtin call, registers published    (offset: builtin registry index delta)
    call_builtin_no_frame, // builtin call without publishing
                        // registers, only for builtins that
                        // neither panic nor touch the process  (offset)
    call_builtin_sig,   // arity and flags of the preceding
                        // builtin call, executes as a skip     (signature)

    //
    // fibers
    //

    fiber_create = 0x18, // create a fiber, push its handle     (offset: function index delta)
    fiber_resume,        // pop handle, transfer arguments,
                         // switch to the fiber                 (signature)
    fiber_suspend,       // transfer arguments to the resumer
                         // and yield                           (signature)

    //
    // values
    //

    push = 0x20,        // push a 24-bit constant               (value)
    push2,              // merge bits 24..47 into the top       (value)
    push3,              // merge bits 48..63 into the top       (value: 16 bits used)
    pushn,              // push the bitwise NOT of the payload  (value)
    global_addr,        // push the address of a global         (value: allocation index)
    function_addr,      // push a function address              (offset: function index delta)
    local_addr,         // push the address of a local          (local_addr: index, frame offset)
    cc,                 // pop, push 0/1 per condition code     (value: condition code)

    //
    // stack manipulation
    //

    pop = 0x28,         // remove the value at the index        (stack_idx)
    pop_top,            // remove the top value                 (stack_idx: always 0)
    pick,               // copy the value at the index on top   (stack_idx)
    dup,                // copy the top value                   (stack_idx: always 0)
    roll,               // move the value at the index on top   (stack_idx)
    swap,               // exchange the two top values          (stack_idx: always 1)
    select,             // pop an index, replace the top N
                        // values with the chosen one           (stack_idx: N - 1)

    //
    // memory
    //

    setup_local_alloc = 0x30, // prepare the frame for local
                        // allocations                          (value: allocation count)
    local_alloc,        // create a pointer-aligned local
                        // allocation in the frame              (layout)
    local_alloc_aligned, // create an over-aligned local
                        // allocation in the frame              (layout)
    local_storage,      // reserve frame bytes without an
                        // allocation record                    (value: byte count)
    deref_const,        // pop address, push checked read-only
                        // native pointer                       (layout)
    deref_mut,          // pop address, push checked mutable
                        // native pointer                       (layout)
    array_element,      // pop index, scale by the stride and
                        // add to the address offset            (value: stride)
    aggregate_member,   // add a byte offset to the address     (value: byte offset)
    load_local_value,   // push 8 bytes read from the frame     (local_addr)
    store_local_value,  // pop 8 bytes into the frame           (local_addr)
    load_global_value,  // push 8 bytes read from a global      (value: allocation index)
    store_global_value, // pop 8 bytes into a global            (value: allocation index)
}

pub const MAX_OPCODE_NUMBER: usize = 0x40;

impl Opcode {
    /// the value must be a valid opcode number. the dispatcher never
    /// calls this, it indexes its handler table with the raw number and
    /// routes the holes between the families to the unreachable handler.
    pub fn from_u8(value: u8) -> Self {
        debug_assert!((value as usize) < MAX_OPCODE_NUMBER);
        unsafe { std::mem::transmute::<u8, Opcode>(value) }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::opcode::Opcode;

    #[test]
    fn test_opcode_round_trip() {
        for opcode in [
            Opcode::nop,
            Opcode::branch_gt,
            Opcode::exit,
            Opcode::call,
            Opcode::call_builtin_sig,
            Opcode::fiber_suspend,
            Opcode::push,
            Opcode::cc,
            Opcode::select,
            Opcode::setup_local_alloc,
            Opcode::store_global_value,
        ] {
            assert_eq!(Opcode::from_u8(opcode as u8), opcode);
        }
    }

    #[test]
    fn test_opcode_family_bases() {
        assert_eq!(Opcode::call as u8, 0x10);
        assert_eq!(Opcode::fiber_create as u8, 0x18);
        assert_eq!(Opcode::push as u8, 0x20);
        assert_eq!(Opcode::pop as u8, 0x28);
        assert_eq!(Opcode::setup_local_alloc as u8, 0x30);
    }
}
