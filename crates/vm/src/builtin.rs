// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

use bitflags::bitflags;

use crate::interpreter::{HandleResult, Machine};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BuiltinFlags: u8 {
        /// the implementation never panics, the dispatcher need not
        /// snapshot the registers before the call
        const NO_PANIC = 1 << 0;
        /// the implementation does not touch the process
        const NO_PROCESS = 1 << 1;
        /// safe to evaluate at build time on a synthetic machine with a
        /// null process, implies NO_PROCESS
        const CONSTANT_FOLD = 1 << 2;
        /// host backends other than the VM must refuse this builtin
        const VM_ONLY = 1 << 3;
        /// the builtin terminates its block, the builder stops
        /// appending after it
        const ALWAYS_PANIC = 1 << 4;
        /// accepts inputs but produces no outputs, backends other than
        /// the VM typically ignore it
        const VM_DIRECTIVE = 1 << 5;
    }
}

/// the implementation of a builtin.
///
/// inputs occupy `vsp[0..input_count)` with the top of the stack first,
/// outputs are written downward through the same slots (read all inputs
/// before writing any output). the instruction pointer addresses the
/// `call_builtin` word, the adjacent `call_builtin_sig` carries arity
/// and flags for introspection.
///
/// on success the implementation adjusts the stack pointer and returns
/// `Move(1)`, landing on its signature word. on panic it reports the
/// message through the machine and returns `Panic`.
pub type BuiltinImpl = for<'a, 'b> fn(&'a mut Machine<'b>) -> HandleResult;

pub struct Builtin {
    pub imp: BuiltinImpl,
    pub input_count: u8,
    pub output_count: u8,
    pub flags: BuiltinFlags,
    pub name: &'static str,
}
