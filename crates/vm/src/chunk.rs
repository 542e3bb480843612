// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

use stavm_types::Signature;

use crate::{function::Function, module::InstDebugLocation};

/// the pseudo function index chunks anchor their call offsets to,
/// chunks never appear in the module function list
pub const CHUNK_FUNCTION_INDEX: u32 = 0xFFFF;

/// a disposable, nameless function for short-lived programs.
///
/// a chunk owns its instruction storage and its debug locations, so
/// resetting it reclaims everything without touching the module.
pub struct Chunk {
    pub(crate) function: Function,
    pub(crate) inst_debug_locations: Vec<InstDebugLocation>,
}

impl Chunk {
    pub(crate) fn new() -> Self {
        Self {
            function: Function::new("<chunk>", Signature::new(0, 0), CHUNK_FUNCTION_INDEX),
            inst_debug_locations: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.function = Function::new("<chunk>", Signature::new(0, 0), CHUNK_FUNCTION_INDEX);
        self.inst_debug_locations.clear();
    }

    pub fn signature(&self) -> Signature {
        self.function.signature
    }

    pub fn is_empty(&self) -> bool {
        !self.function.has_definition()
    }
}
