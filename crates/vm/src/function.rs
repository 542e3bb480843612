// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

use stavm_types::{inst::Inst, Signature};

/// a function of a module.
///
/// the instruction array stays empty until a builder has produced a
/// definition, and is immutable afterwards.
pub struct Function {
    pub(crate) name: String,
    pub(crate) signature: Signature,
    pub(crate) exported: bool,
    pub(crate) insts: Vec<Inst>,
    pub(crate) function_index: u32,
    /// the deepest value-stack use of any block, checked before a call
    pub(crate) max_vstack_size: u16,
    /// frame header plus local allocation bytes
    pub(crate) max_cstack_size: u16,
}

impl Function {
    pub(crate) fn new(name: &str, signature: Signature, function_index: u32) -> Self {
        Self {
            name: name.to_owned(),
            signature,
            exported: false,
            insts: Vec::new(),
            function_index,
            max_vstack_size: 0,
            max_cstack_size: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> Signature {
        self.signature
    }

    pub fn is_exported(&self) -> bool {
        self.exported
    }

    pub fn has_definition(&self) -> bool {
        !self.insts.is_empty()
    }

    pub fn insts(&self) -> &[Inst] {
        &self.insts
    }

    pub fn function_index(&self) -> u32 {
        self.function_index
    }

    pub fn max_vstack_size(&self) -> u16 {
        self.max_vstack_size
    }

    pub fn max_cstack_size(&self) -> u16 {
        self.max_cstack_size
    }

    /// the index of the instruction when the pointer is inside this
    /// function's instruction array
    pub(crate) fn inst_index_of(&self, ip: *const Inst) -> Option<usize> {
        let start = self.insts.as_ptr() as usize;
        let end = unsafe { self.insts.as_ptr().add(self.insts.len()) } as usize;
        let ip = ip as usize;
        if ip >= start && ip < end {
            Some((ip - start) / std::mem::size_of::<Inst>())
        } else {
            None
        }
    }
}
