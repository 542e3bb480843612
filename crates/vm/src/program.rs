// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

use thiserror::Error;

use stavm_types::Signature;

use crate::{
    chunk::Chunk,
    function::Function,
    module::{FunctionId, Module},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProgramError {
    #[error("entry function is not exported")]
    EntryNotExported,

    #[error("entry function has no definition")]
    EntryUndefined,
}

/// an executable view of a module: the module plus an entry function
#[derive(Clone, Copy)]
pub struct Program<'m> {
    pub(crate) module: &'m Module,
    pub(crate) entry: &'m Function,
}

impl<'m> Program<'m> {
    pub fn new(module: &'m Module, entry: FunctionId) -> Result<Self, ProgramError> {
        let entry = module.function(entry);
        if !entry.is_exported() {
            return Err(ProgramError::EntryNotExported);
        }
        if !entry.has_definition() {
            return Err(ProgramError::EntryUndefined);
        }
        Ok(Self { module, entry })
    }

    /// run a chunk as the entry, the chunk stays outside the module
    /// function list and cannot be called indirectly
    pub fn from_chunk(module: &'m Module, chunk: &'m Chunk) -> Result<Self, ProgramError> {
        if chunk.is_empty() {
            return Err(ProgramError::EntryUndefined);
        }
        Ok(Self {
            module,
            entry: &chunk.function,
        })
    }

    pub fn module(&self) -> &'m Module {
        self.module
    }

    pub fn entry_signature(&self) -> Signature {
        self.entry.signature()
    }
}
