// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

// The builder assembles a well-formed function body from a stream of
// instruction-creation calls.
//
// Each call verifies the current block, pops its inputs from a shadow
// value stack (underflow is a build error), appends the encoded
// instruction, pushes its outputs and optionally applies a local
// peephole rewrite. The shadow stack tracks which in-flight values are
// compile-time constants or local addresses, feeding constant folding
// and the load/store promotion.
//
// Errors are routed to the host error handler and latch a flag, the
// build sequence runs to completion and `finish` reports the failure
// once.

use thiserror::Error;

use stavm_types::{
    inst::{compress_offset, EncodeError, Inst},
    opcode::Opcode,
    round_to_multiple_of_alignment, ConditionCode, Layout, Signature, Value, VALUE_SIZE_IN_BYTES,
};

use crate::{
    asm_type::{AsmType, VALUE_TYPE},
    builtin::{Builtin, BuiltinFlags},
    chunk::{Chunk, CHUNK_FUNCTION_INDEX},
    interpreter,
    module::{DebugLocation, FunctionId, GlobalId, InstDebugLocation, Module},
};

mod emit;
mod peephole;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("unterminated block")]
    UnterminatedBlock,

    #[error("{0}")]
    StackUnderflow(&'static str),

    #[error("invalid stack index {0}")]
    InvalidStackIndex(u16),

    #[error("block output count overflow")]
    OutputCountOverflow,

    #[error("output count does not match the successor's input count")]
    SignatureMismatch,

    #[error("incompatible signature")]
    IncompatibleSignature,

    #[error("function already has a definition")]
    DuplicateDefinition,

    #[error("cannot continue building a block that has been terminated already")]
    BlockTerminated,

    #[error("invalid field")]
    InvalidField,

    #[error("invalid value")]
    InvalidValue,

    #[error("too many local variables")]
    TooManyLocals,

    #[error("frame size exceeds the call-stack page capacity")]
    FrameTooLarge,

    #[error("too many instructions")]
    TooManyInstructions,

    #[error("per-function vstack size limit exceeded")]
    VstackLimit,

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

pub type BuildErrorHandler = fn(function_name: &str, context: &str, error: &BuildError);

fn default_error_handler(function_name: &str, context: &str, error: &BuildError) {
    log::error!("build error: {}() of '{}': {}", context, function_name, error);
}

#[derive(Clone, Copy)]
pub struct BuildOptions {
    pub error_handler: BuildErrorHandler,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            error_handler: default_error_handler,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalId(pub(crate) u16);

/// what the builder knows about an in-flight value
#[derive(Clone, Copy)]
pub(crate) enum Shadow {
    Unknown,
    Constant(Value),
    LocalAddr(LocalId),
}

pub(crate) struct ShadowStack {
    values: Vec<Shadow>,
    max: usize,
}

impl ShadowStack {
    fn new(input_count: u8) -> Self {
        Self {
            values: vec![Shadow::Unknown; input_count as usize],
            max: input_count as usize,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.values.len()
    }

    pub(crate) fn max_len(&self) -> usize {
        self.max
    }

    pub(crate) fn push(&mut self, value: Shadow) {
        self.values.push(value);
        if self.values.len() > self.max {
            self.max = self.values.len();
        }
    }

    pub(crate) fn push_unknown(&mut self, count: usize) {
        for _ in 0..count {
            self.push(Shadow::Unknown);
        }
    }

    pub(crate) fn pop(&mut self) -> Option<Shadow> {
        self.values.pop()
    }

    pub(crate) fn pop_n(&mut self, count: usize) -> bool {
        if self.values.len() < count {
            return false;
        }
        self.values.truncate(self.values.len() - count);
        true
    }

    /// the value at the stack index, 0 is the top
    pub(crate) fn pick(&self, index: usize) -> Shadow {
        self.values[self.values.len() - 1 - index]
    }

    /// move the value at the stack index to the top
    pub(crate) fn roll(&mut self, index: usize) {
        let at = self.values.len() - 1 - index;
        let value = self.values.remove(at);
        self.values.push(value);
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum Terminator {
    Unterminated,
    /// ended by an always-panicking builtin, nothing to lower
    Terminated,
    Return,
    Jump,
    BranchNeEq,
    BranchLtGe,
    BranchLeGt,
    Panic,
}

pub(crate) struct Block {
    pub(crate) sig: Signature,
    pub(crate) reachable: bool,
    /// instruction offset of the block marker, set during emission
    pub(crate) offset: u32,
    pub(crate) vstack: ShadowStack,
    pub(crate) insts: Vec<Inst>,
    /// inst indices relative to the block, shifted at finish
    pub(crate) debug_locations: Vec<InstDebugLocation>,
    pub(crate) terminator: Terminator,
    pub(crate) next: [usize; 2],
}

impl Block {
    fn new(input_count: u8) -> Self {
        Self {
            sig: Signature::new(input_count, 0),
            reachable: false,
            offset: 0,
            vstack: ShadowStack::new(input_count),
            insts: Vec::new(),
            debug_locations: Vec::new(),
            terminator: Terminator::Unterminated,
            next: [0, 0],
        }
    }
}

#[derive(Clone, Copy)]
pub(crate) struct Local {
    pub(crate) layout: Layout,
    pub(crate) index: u16,
    /// frame byte offset of the storage, `u16::MAX` for over-aligned
    /// locals whose position is only known at frame entry
    pub(crate) offset: u16,
}

enum Target<'t> {
    Function(FunctionId),
    Chunk(&'t mut Chunk),
}

pub struct Builder<'m> {
    options: BuildOptions,
    pub(crate) module: &'m mut Module,
    target: Target<'m>,

    pub(crate) blocks: Vec<Block>,
    pub(crate) cur: Option<usize>,

    pub(crate) locals: Vec<Local>,
    pub(crate) local_allocation_size: u32,
    /// number of `local_addr` instructions that escaped into the code
    pub(crate) local_addr_count: u16,

    pub(crate) errored: bool,
}

impl<'m> Builder<'m> {
    pub fn for_function(
        module: &'m mut Module,
        function: FunctionId,
        options: BuildOptions,
    ) -> Builder<'m> {
        let signature = module.function(function).signature();
        let defined = module.function(function).has_definition();

        let mut builder = Builder {
            options,
            module,
            target: Target::Function(function),
            blocks: vec![Block::new(signature.input_count)],
            cur: Some(0),
            locals: Vec::new(),
            local_allocation_size: 0,
            local_addr_count: 0,
            errored: false,
        };
        if defined {
            builder.error("for_function", BuildError::DuplicateDefinition);
        }
        builder
    }

    pub fn for_chunk(
        module: &'m mut Module,
        chunk: &'m mut Chunk,
        signature: Signature,
        options: BuildOptions,
    ) -> Builder<'m> {
        chunk.reset();
        chunk.function.signature = signature;

        Builder {
            options,
            module,
            target: Target::Chunk(chunk),
            blocks: vec![Block::new(signature.input_count)],
            cur: Some(0),
            locals: Vec::new(),
            local_allocation_size: 0,
            local_addr_count: 0,
            errored: false,
        }
    }

    //
    // state access
    //

    fn function_name(&self) -> String {
        match &self.target {
            Target::Function(function) => self.module.function(*function).name().to_owned(),
            Target::Chunk(_) => "<chunk>".to_owned(),
        }
    }

    pub(crate) fn target_signature(&self) -> Signature {
        match &self.target {
            Target::Function(function) => self.module.function(*function).signature(),
            Target::Chunk(chunk) => chunk.function.signature,
        }
    }

    /// the function-index anchor for compressed call offsets
    fn anchor_index(&self) -> u32 {
        match &self.target {
            Target::Function(function) => function.0,
            Target::Chunk(_) => CHUNK_FUNCTION_INDEX,
        }
    }

    pub(crate) fn error(&mut self, context: &'static str, error: BuildError) {
        (self.options.error_handler)(&self.function_name(), context, &error);
        self.errored = true;
    }

    /// the current shadow stack height, for frontends tracking values
    pub fn vstack_size(&self) -> usize {
        match self.cur {
            Some(cur) => self.blocks[cur].vstack.len(),
            None => 0,
        }
    }

    //
    // blocks
    //

    pub fn entry_block(&self) -> BlockId {
        BlockId(0)
    }

    pub fn declare_block(&mut self, input_count: usize) -> BlockId {
        if input_count > u8::MAX as usize {
            self.error("declare_block", BuildError::OutputCountOverflow);
        }
        self.blocks.push(Block::new(input_count as u8));
        BlockId(self.blocks.len() - 1)
    }

    pub fn build_block(&mut self, block: BlockId) {
        if self.blocks[block.0].terminator != Terminator::Unterminated {
            self.error("build_block", BuildError::BlockTerminated);
            return;
        }
        self.cur = Some(block.0);
    }

    pub fn debug_location(&mut self, location: DebugLocation) {
        let function_index = self.anchor_index();
        let Some(cur) = self.cur else { return };
        let block = &mut self.blocks[cur];

        if block
            .debug_locations
            .last()
            .is_some_and(|last| last.location == location)
        {
            return;
        }
        block.debug_locations.push(InstDebugLocation {
            function_index,
            inst_index: block.insts.len() as u32,
            location,
        });
    }

    //
    // data literals
    //

    pub fn data_literal(&mut self, bytes: &[u8]) -> GlobalId {
        self.module.intern_data_literal(bytes)
    }

    pub fn string_literal(&mut self, string: &str) -> GlobalId {
        self.module.intern_string_literal(string)
    }

    //
    // locals
    //

    /// reserve frame storage for a local variable.
    ///
    /// the requested size is rounded up to a pointer multiple so frames
    /// stay pointer-aligned. an over-aligned local reserves alignment
    /// plus size bytes and leaves its offset open until frame entry,
    /// which also bars it from the load/store promotion.
    pub fn build_local(&mut self, layout: Layout) -> LocalId {
        let size = round_to_multiple_of_alignment(layout.size, VALUE_SIZE_IN_BYTES as u32);

        let (layout, offset) = if layout.alignment as usize <= VALUE_SIZE_IN_BYTES {
            let offset = self.local_allocation_size as usize
                + std::mem::size_of::<crate::stack::StackFrame>();
            self.local_allocation_size += size;
            (
                Layout::new(size, VALUE_SIZE_IN_BYTES as u32),
                offset.min(u16::MAX as usize) as u16,
            )
        } else {
            self.local_allocation_size += layout.alignment + size;
            (Layout::new(size, layout.alignment), u16::MAX)
        };

        let index = self.locals.len() as u16;
        self.locals.push(Local {
            layout,
            index,
            offset,
        });
        LocalId(index)
    }

    //
    // terminators
    //

    fn finish_block_outputs(&mut self, cur: usize, context: &'static str) -> u8 {
        let size = self.blocks[cur].vstack.len();
        if size > u8::MAX as usize {
            self.error(context, BuildError::OutputCountOverflow);
        }
        let output_count = size.min(u8::MAX as usize) as u8;
        self.blocks[cur].sig.output_count = output_count;
        output_count
    }

    fn check_successor(&mut self, context: &'static str, output_count: u8, successor: BlockId) {
        if self.blocks[successor.0].sig.input_count != output_count {
            self.error(context, BuildError::SignatureMismatch);
        }
    }

    pub fn inst_return(&mut self) {
        const CONTEXT: &str = "inst_return";
        let Some(cur) = self.cur else { return };

        let output_count = self.finish_block_outputs(cur, CONTEXT);
        if output_count != self.target_signature().output_count {
            self.error(CONTEXT, BuildError::IncompatibleSignature);
        }

        self.blocks[cur].terminator = Terminator::Return;
        self.cur = None;
    }

    pub fn inst_jump(&mut self, dest: BlockId) {
        const CONTEXT: &str = "inst_jump";
        let Some(cur) = self.cur else { return };

        let output_count = self.finish_block_outputs(cur, CONTEXT);
        self.check_successor(CONTEXT, output_count, dest);

        self.blocks[cur].terminator = Terminator::Jump;
        self.blocks[cur].next[0] = dest.0;
        self.cur = None;
    }

    /// terminate with a two-way branch on the top value.
    ///
    /// equal successors and constant conditions collapse to a jump
    /// (the chosen successor is returned), a preceding `cc` fuses into
    /// the matching three-way terminator and is deleted.
    pub fn inst_branch(&mut self, if_true: BlockId, if_false: BlockId) -> Option<BlockId> {
        const CONTEXT: &str = "inst_branch";
        let Some(cur) = self.cur else { return None };

        let condition = match self.blocks[cur].vstack.pop() {
            Some(condition) => condition,
            None => {
                self.error(CONTEXT, BuildError::StackUnderflow("missing condition"));
                return None;
            }
        };

        let output_count = self.finish_block_outputs(cur, CONTEXT);
        self.check_successor(CONTEXT, output_count, if_true);
        self.check_successor(CONTEXT, output_count, if_false);

        let mut next_block = None;
        if if_true == if_false {
            self.add_pop_top_n(1);
            self.blocks[cur].terminator = Terminator::Jump;
            self.blocks[cur].next[0] = if_true.0;
            next_block = Some(if_true);
        } else if let Shadow::Constant(value) = condition {
            self.add_pop_top_n(1);
            let dest = if value.as_u64() != 0 { if_true } else { if_false };
            self.blocks[cur].terminator = Terminator::Jump;
            self.blocks[cur].next[0] = dest.0;
            next_block = Some(dest);
        } else if let Some(code) = self.last_inst_cc(cur) {
            // delete the cc, the fused terminator tests its input
            self.blocks[cur].insts.pop();

            let (terminator, next) = match code {
                ConditionCode::Eq => (Terminator::BranchNeEq, [if_false, if_true]),
                ConditionCode::Ne => (Terminator::BranchNeEq, [if_true, if_false]),
                ConditionCode::Lt => (Terminator::BranchLtGe, [if_true, if_false]),
                ConditionCode::Ge => (Terminator::BranchLtGe, [if_false, if_true]),
                ConditionCode::Le => (Terminator::BranchLeGt, [if_true, if_false]),
                ConditionCode::Gt => (Terminator::BranchLeGt, [if_false, if_true]),
            };
            self.blocks[cur].terminator = terminator;
            self.blocks[cur].next = [next[0].0, next[1].0];
        } else {
            // the condition is a boolean: non-zero means true
            self.blocks[cur].terminator = Terminator::BranchNeEq;
            self.blocks[cur].next = [if_true.0, if_false.0];
        }

        self.cur = None;
        next_block
    }

    fn last_inst_cc(&self, cur: usize) -> Option<ConditionCode> {
        self.blocks[cur]
            .insts
            .last()
            .filter(|inst| inst.opcode() == Opcode::cc)
            .map(|inst| ConditionCode::from_u8(inst.value() as u8))
    }

    pub fn inst_panic(&mut self) {
        const CONTEXT: &str = "inst_panic";
        let Some(cur) = self.cur else { return };

        if self.blocks[cur].vstack.pop().is_none() {
            self.error(CONTEXT, BuildError::StackUnderflow("missing message"));
        }

        self.blocks[cur].terminator = Terminator::Panic;
        self.cur = None;
    }

    //
    // calls
    //

    fn emit(&mut self, cur: usize, inst: Result<Inst, EncodeError>, context: &'static str) {
        match inst {
            Ok(inst) => self.blocks[cur].insts.push(inst),
            Err(error) => self.error(context, error.into()),
        }
    }

    pub fn inst_call(&mut self, callee: FunctionId) {
        const CONTEXT: &str = "inst_call";
        let Some(cur) = self.cur else { return };

        let signature = self.module.function(callee).signature();
        if !self.blocks[cur].vstack.pop_n(signature.input_count as usize) {
            self.error(
                CONTEXT,
                BuildError::StackUnderflow("missing input values for call"),
            );
        }

        let inst = compress_offset(self.anchor_index(), callee.0)
            .and_then(|offset| Inst::with_offset(Opcode::call, offset));
        self.emit(cur, inst, CONTEXT);

        self.blocks[cur]
            .vstack
            .push_unknown(signature.output_count as usize);
    }

    /// declare-or-reuse a function by name and call it
    pub fn inst_call_extern(&mut self, name: &str, signature: Signature) -> FunctionId {
        const CONTEXT: &str = "inst_call_extern";

        let callee = match self.module.find_function_by_name(name) {
            Some(callee) => {
                if self.module.function(callee).signature() != signature {
                    self.error(CONTEXT, BuildError::IncompatibleSignature);
                }
                callee
            }
            None => self.module.add_function(name, signature),
        };
        self.inst_call(callee);
        callee
    }

    pub fn inst_call_indirect(&mut self, signature: Signature) {
        const CONTEXT: &str = "inst_call_indirect";
        let Some(cur) = self.cur else { return };

        let function_address = match self.blocks[cur].vstack.pop() {
            Some(value) => value,
            None => {
                self.error(
                    CONTEXT,
                    BuildError::StackUnderflow("missing function address"),
                );
                return;
            }
        };
        if !self.blocks[cur].vstack.pop_n(signature.input_count as usize) {
            self.error(
                CONTEXT,
                BuildError::StackUnderflow("missing input values for call"),
            );
        }

        // a constant function address with the right arity is a direct
        // call
        if let Some(callee) = self.constant_function(function_address, signature) {
            self.add_pop_top_n(1);
            let inst = compress_offset(self.anchor_index(), callee.0)
                .and_then(|offset| Inst::with_offset(Opcode::call, offset));
            self.emit(cur, inst, CONTEXT);
        } else {
            self.blocks[cur].insts.push(Inst::with_signature(
                Opcode::call_indirect,
                signature,
                0,
            ));
        }

        self.blocks[cur]
            .vstack
            .push_unknown(signature.output_count as usize);
    }

    fn constant_function(&self, value: Shadow, signature: Signature) -> Option<FunctionId> {
        let Shadow::Constant(value) = value else {
            return None;
        };

        let address = value.as_function_address();
        if address.input_count != signature.input_count
            || address.output_count != signature.output_count
        {
            return None;
        }

        self.module
            .functions
            .iter()
            .find(|function| function.function_index() == address.index)
            .map(|function| FunctionId(function.function_index()))
    }

    pub fn inst_call_builtin(&mut self, callee: &'static Builtin) {
        const CONTEXT: &str = "inst_call_builtin";
        let Some(cur) = self.cur else { return };

        if callee.flags.contains(BuiltinFlags::VM_DIRECTIVE) && callee.output_count != 0 {
            self.error(CONTEXT, BuildError::IncompatibleSignature);
        }

        // collect the inputs, the scratch stack grows down so the
        // first pop (the top of the stack) lands lowest
        let mut all_constant = true;
        let mut scratch = [Value::from_u64(0); 256];
        let mut slot = scratch.len() - callee.input_count as usize;

        for _ in 0..callee.input_count {
            match self.blocks[cur].vstack.pop() {
                Some(Shadow::Constant(value)) => {
                    scratch[slot] = value;
                    slot += 1;
                }
                Some(_) => all_constant = false,
                None => {
                    self.error(
                        CONTEXT,
                        BuildError::StackUnderflow("missing input values for call"),
                    );
                    all_constant = false;
                }
            }
        }

        let foldable = BuiltinFlags::NO_PROCESS.union(BuiltinFlags::CONSTANT_FOLD);
        if all_constant && callee.flags.contains(foldable) {
            // run the builtin right now through the dispatcher, on
            // panic the call is kept as-is
            match interpreter::constant_fold_builtin(callee, &mut scratch) {
                Some(outputs) => {
                    self.add_pop_top_n(callee.input_count as usize);
                    for output in outputs {
                        self.inst_uint(output.as_u64());
                    }
                }
                None => self.add_call_builtin(cur, callee),
            }
        } else {
            self.add_call_builtin(cur, callee);
        }

        if callee.flags.contains(BuiltinFlags::ALWAYS_PANIC) {
            self.blocks[cur].terminator = Terminator::Terminated;
            self.cur = None;
        }
    }

    fn add_call_builtin(&mut self, cur: usize, callee: &'static Builtin) {
        const CONTEXT: &str = "inst_call_builtin";

        let index = self.module.intern_builtin(callee);
        let no_frame = BuiltinFlags::NO_PROCESS.union(BuiltinFlags::NO_PANIC);
        let opcode = if callee.flags.contains(no_frame) {
            Opcode::call_builtin_no_frame
        } else {
            Opcode::call_builtin
        };

        let inst =
            compress_offset(0, index).and_then(|offset| Inst::with_offset(opcode, offset));
        self.emit(cur, inst, CONTEXT);
        self.blocks[cur].insts.push(Inst::with_signature(
            Opcode::call_builtin_sig,
            Signature::new(callee.input_count, callee.output_count),
            callee.flags.bits(),
        ));

        self.blocks[cur]
            .vstack
            .push_unknown(callee.output_count as usize);
    }

    //
    // fibers
    //

    pub fn inst_fiber_create(&mut self, function: FunctionId) {
        const CONTEXT: &str = "inst_fiber_create";
        let Some(cur) = self.cur else { return };

        let inst = compress_offset(self.anchor_index(), function.0)
            .and_then(|offset| Inst::with_offset(Opcode::fiber_create, offset));
        self.emit(cur, inst, CONTEXT);
        self.blocks[cur].vstack.push_unknown(1);
    }

    pub fn inst_fiber_resume(&mut self, signature: Signature) {
        const CONTEXT: &str = "inst_fiber_resume";
        let Some(cur) = self.cur else { return };

        if !self.blocks[cur].vstack.pop_n(signature.input_count as usize) {
            self.error(CONTEXT, BuildError::StackUnderflow("missing inputs"));
        }
        if self.blocks[cur].vstack.pop().is_none() {
            self.error(CONTEXT, BuildError::StackUnderflow("missing handle"));
        }

        self.blocks[cur]
            .insts
            .push(Inst::with_signature(Opcode::fiber_resume, signature, 0));
        self.blocks[cur]
            .vstack
            .push_unknown(signature.output_count as usize);
    }

    pub fn inst_fiber_suspend(&mut self, signature: Signature) {
        const CONTEXT: &str = "inst_fiber_suspend";
        let Some(cur) = self.cur else { return };

        if !self.blocks[cur].vstack.pop_n(signature.input_count as usize) {
            self.error(CONTEXT, BuildError::StackUnderflow("missing inputs"));
        }

        self.blocks[cur]
            .insts
            .push(Inst::with_signature(Opcode::fiber_suspend, signature, 0));
        self.blocks[cur]
            .vstack
            .push_unknown(signature.output_count as usize);
    }

    //
    // values
    //

    /// push a 64-bit constant with the shortest instruction sequence
    /// for its bit pattern
    pub fn inst_uint(&mut self, value: u64) {
        let Some(cur) = self.cur else { return };
        let insts = &mut self.blocks[cur].insts;

        if value & 0xFFFF_FFFF_FF00_0000 == 0 {
            // 0x0000_0000_00xx_xxxx: push
            insts.push(Inst::with_value(Opcode::push, value).unwrap());
        } else if value & 0xFFFF_0000_0000_0000 == 0 {
            // 0x0000_yyyy_yyxx_xxxx: push + push2
            insts.push(Inst::with_value(Opcode::push, value & 0xFF_FFFF).unwrap());
            insts.push(Inst::with_value(Opcode::push2, value >> 24).unwrap());
        } else if value & 0xFFFF_FFFF_FF00_0000 == 0xFFFF_FFFF_FF00_0000 {
            // 0xFFFF_FFFF_FFxx_xxxx: pushn
            insts.push(Inst::with_value(Opcode::pushn, !value & 0xFF_FFFF).unwrap());
        } else {
            // 0xzzzz_yyyy_yyxx_xxxx: push + push2 + push3, the push2
            // is omitted when its bits are all zero
            insts.push(Inst::with_value(Opcode::push, value & 0xFF_FFFF).unwrap());
            if (value >> 24) & 0xFF_FFFF != 0 {
                insts.push(Inst::with_value(Opcode::push2, (value >> 24) & 0xFF_FFFF).unwrap());
            }
            insts.push(Inst::with_value(Opcode::push3, value >> 48).unwrap());
        }

        self.blocks[cur]
            .vstack
            .push(Shadow::Constant(Value::from_u64(value)));
    }

    /// negative values are treated as large positive ones
    pub fn inst_sint(&mut self, value: i64) {
        self.inst_uint(value as u64);
    }

    /// push 8 raw bytes reinterpreted as one value
    pub fn inst_bytes(&mut self, bytes: &[u8; 8]) {
        self.inst_uint(u64::from_le_bytes(*bytes));
    }

    /// the null value has all bits set
    pub fn inst_null(&mut self) {
        let Some(cur) = self.cur else { return };
        self.blocks[cur]
            .insts
            .push(Inst::with_value(Opcode::pushn, 0).unwrap());
        self.blocks[cur].vstack.push(Shadow::Constant(Value::null()));
    }

    pub fn inst_global_addr(&mut self, global: GlobalId) {
        const CONTEXT: &str = "inst_global_addr";
        let Some(cur) = self.cur else { return };

        let allocation_index = self.module.global(global).allocation_index();
        let inst = Inst::with_value(Opcode::global_addr, allocation_index as u64);
        self.emit(cur, inst, CONTEXT);

        self.blocks[cur]
            .vstack
            .push(Shadow::Constant(Value::from_address(stavm_types::Address::new(
                allocation_index,
                0,
                0,
            ))));
    }

    pub fn inst_function_addr(&mut self, function: FunctionId) {
        const CONTEXT: &str = "inst_function_addr";
        let Some(cur) = self.cur else { return };

        let signature = self.module.function(function).signature();
        let inst = compress_offset(self.anchor_index(), function.0)
            .and_then(|offset| Inst::with_offset(Opcode::function_addr, offset));
        self.emit(cur, inst, CONTEXT);

        self.blocks[cur].vstack.push(Shadow::Constant(
            Value::from_function_address(stavm_types::FunctionAddress {
                index: function.0,
                input_count: signature.input_count,
                output_count: signature.output_count,
            }),
        ));
    }

    pub fn inst_local_addr(&mut self, local: LocalId) {
        const CONTEXT: &str = "inst_local_addr";
        let Some(cur) = self.cur else { return };

        let record = self.locals[local.0 as usize];
        if record.index > u8::MAX as u16 {
            self.error(CONTEXT, BuildError::TooManyLocals);
            return;
        }

        self.local_addr_count += 1;
        self.blocks[cur].insts.push(Inst::with_local_addr(
            Opcode::local_addr,
            record.index as u8,
            record.offset,
        ));
        self.blocks[cur].vstack.push(Shadow::LocalAddr(local));
    }

    /// push alignment then size, for builtins taking a layout operand
    pub fn inst_layout(&mut self, layout: Layout) {
        self.inst_uint(layout.alignment as u64);
        self.inst_uint(layout.size as u64);
    }

    pub fn inst_cc(&mut self, code: ConditionCode) {
        const CONTEXT: &str = "inst_cc";
        let Some(cur) = self.cur else { return };

        let comparand = match self.blocks[cur].vstack.pop() {
            Some(comparand) => comparand,
            None => {
                self.error(CONTEXT, BuildError::StackUnderflow("missing comparand"));
                return;
            }
        };

        if let Shadow::Constant(value) = comparand {
            // evaluated now, the instruction becomes a plain push
            let result = code.eval(value.as_i64()) as u64;
            self.add_pop_top_n(1);
            self.blocks[cur]
                .insts
                .push(Inst::with_value(Opcode::push, result).unwrap());
            self.blocks[cur]
                .vstack
                .push(Shadow::Constant(Value::from_u64(result)));
        } else {
            self.blocks[cur]
                .insts
                .push(Inst::with_value(Opcode::cc, code as u64).unwrap());
            self.blocks[cur].vstack.push_unknown(1);
        }
    }

    //
    // stack manipulation
    //

    pub fn inst_pop(&mut self, stack_index: u16) {
        const CONTEXT: &str = "inst_pop";
        let Some(cur) = self.cur else { return };

        if stack_index as usize >= self.blocks[cur].vstack.len() {
            self.error(CONTEXT, BuildError::InvalidStackIndex(stack_index));
            return;
        }

        if stack_index == 0 {
            self.add_pop_top_n(1);
        } else {
            self.blocks[cur]
                .insts
                .push(Inst::with_stack_idx(Opcode::pop, stack_index));
        }

        self.blocks[cur].vstack.roll(stack_index as usize);
        let _ = self.blocks[cur].vstack.pop();
    }

    pub fn inst_pick(&mut self, stack_index: u16) {
        const CONTEXT: &str = "inst_pick";
        let Some(cur) = self.cur else { return };

        if stack_index as usize >= self.blocks[cur].vstack.len() {
            self.error(CONTEXT, BuildError::InvalidStackIndex(stack_index));
            return;
        }

        let opcode = if stack_index == 0 { Opcode::dup } else { Opcode::pick };
        self.blocks[cur]
            .insts
            .push(Inst::with_stack_idx(opcode, stack_index));

        let value = self.blocks[cur].vstack.pick(stack_index as usize);
        self.blocks[cur].vstack.push(value);
    }

    pub fn inst_roll(&mut self, stack_index: u16) {
        const CONTEXT: &str = "inst_roll";
        let Some(cur) = self.cur else { return };

        if stack_index as usize >= self.blocks[cur].vstack.len() {
            self.error(CONTEXT, BuildError::InvalidStackIndex(stack_index));
            return;
        }

        match stack_index {
            0 => {} // already on top
            1 => self.blocks[cur]
                .insts
                .push(Inst::with_stack_idx(Opcode::swap, stack_index)),
            _ => self.blocks[cur]
                .insts
                .push(Inst::with_stack_idx(Opcode::roll, stack_index)),
        }

        self.blocks[cur].vstack.roll(stack_index as usize);
    }

    pub fn inst_select(&mut self, count: u16) {
        const CONTEXT: &str = "inst_select";
        let Some(cur) = self.cur else { return };

        if count < 2 {
            self.error(CONTEXT, BuildError::InvalidValue);
            return;
        }

        if self.blocks[cur].vstack.pop().is_none() {
            self.error(CONTEXT, BuildError::StackUnderflow("missing index"));
        }
        if !self.blocks[cur].vstack.pop_n(count as usize) {
            self.error(
                CONTEXT,
                BuildError::StackUnderflow("missing alternative values"),
            );
        }

        self.blocks[cur]
            .insts
            .push(Inst::with_stack_idx(Opcode::select, count - 1));
        self.blocks[cur].vstack.push_unknown(1);
    }

    //
    // memory
    //

    pub fn inst_array_element(&mut self, element_layout: Layout) {
        const CONTEXT: &str = "inst_array_element";
        let Some(cur) = self.cur else { return };

        let stride =
            round_to_multiple_of_alignment(element_layout.size, element_layout.alignment);

        let index = match self.blocks[cur].vstack.pop() {
            Some(index) => index,
            None => {
                self.error(CONTEXT, BuildError::StackUnderflow("missing index"));
                return;
            }
        };
        if !self.blocks[cur].vstack.pop_n(1) {
            self.error(CONTEXT, BuildError::StackUnderflow("missing address"));
        }

        match index {
            Shadow::Constant(value) if value.as_i64() >= 0 => {
                // the element step is a compile-time byte offset
                self.add_pop_top_n(1);
                let offset = value.as_i64() * stride as i64;
                if offset > 0 {
                    let inst = Inst::with_value(Opcode::aggregate_member, offset as u64);
                    self.emit(cur, inst, CONTEXT);
                }
            }
            _ => {
                let inst = Inst::with_value(Opcode::array_element, stride as u64);
                self.emit(cur, inst, CONTEXT);
            }
        }
        self.blocks[cur].vstack.push_unknown(1);
    }

    pub fn inst_aggregate_member(&mut self, member_index: usize, member_layouts: &[Layout]) {
        const CONTEXT: &str = "inst_aggregate_member";
        let Some(cur) = self.cur else { return };

        if member_index >= member_layouts.len() {
            self.error(CONTEXT, BuildError::InvalidField);
            return;
        }

        // the packed size up to and including the member, minus the
        // member itself, is its alignment-padded byte offset
        let layout = Layout::aggregate(&member_layouts[..=member_index]);
        let offset = layout.size - member_layouts[member_index].size;

        if offset > 0 {
            if !self.blocks[cur].vstack.pop_n(1) {
                self.error(CONTEXT, BuildError::StackUnderflow("missing address"));
            }
            let inst = Inst::with_value(Opcode::aggregate_member, offset as u64);
            self.emit(cur, inst, CONTEXT);
            self.blocks[cur].vstack.push_unknown(1);
        }
    }

    pub fn inst_load_field(&mut self, value_type: &AsmType, field_index: usize) {
        const CONTEXT: &str = "inst_load_field";
        let Some(cur) = self.cur else { return };

        if field_index >= value_type.field_count {
            self.error(CONTEXT, BuildError::InvalidField);
            return;
        }

        let address = match self.blocks[cur].vstack.pop() {
            Some(address) => address,
            None => {
                self.error(CONTEXT, BuildError::StackUnderflow("missing address"));
                return;
            }
        };

        match self.load_store_promotion(address, value_type, false) {
            Promotion::Local(local) => {
                self.add_pop_top_n(1);
                let record = self.locals[local.0 as usize];

                // load directly after a store of the same slot: keep
                // the stored value on the stack instead of reloading
                let block = &mut self.blocks[cur];
                let folded_store = block.insts.last().copied().filter(|inst| {
                    inst.opcode() == Opcode::store_local_value
                        && inst.local_addr() == (record.index as u8, record.offset)
                });
                if let Some(store) = folded_store {
                    block.insts.pop();
                    block.insts.push(Inst::with_stack_idx(Opcode::dup, 0));
                    block.insts.push(store);
                } else {
                    block.insts.push(Inst::with_local_addr(
                        Opcode::load_local_value,
                        record.index as u8,
                        record.offset,
                    ));
                }
                block.vstack.push_unknown(1);
            }
            Promotion::Global(allocation_index) => {
                self.add_pop_top_n(1);
                let inst = Inst::with_value(Opcode::load_global_value, allocation_index as u64);
                self.emit(cur, inst, CONTEXT);
                self.blocks[cur].vstack.push_unknown(1);
            }
            Promotion::Dynamic => {
                if value_type.layout.size == 0 && value_type.load_fn.is_none() {
                    // a zero-sized type has exactly one value
                    self.add_pop_top_n(1);
                    self.inst_uint(0);
                    return;
                }

                let inst = Inst::with_layout(Opcode::deref_const, value_type.layout);
                self.emit(cur, inst, CONTEXT);
                self.blocks[cur].vstack.push_unknown(1);

                self.inst_uint(field_index as u64);
                match value_type.load_fn {
                    Some(builtin) => self.inst_call_builtin(builtin),
                    None => self.error(CONTEXT, BuildError::InvalidField),
                }
            }
        }
    }

    pub fn inst_store_field(&mut self, value_type: &AsmType, field_index: usize) {
        const CONTEXT: &str = "inst_store_field";
        let Some(cur) = self.cur else { return };

        if field_index >= value_type.field_count {
            self.error(CONTEXT, BuildError::InvalidField);
            return;
        }

        let address = match self.blocks[cur].vstack.pop() {
            Some(address) => address,
            None => {
                self.error(CONTEXT, BuildError::StackUnderflow("missing address"));
                return;
            }
        };

        match self.load_store_promotion(address, value_type, true) {
            Promotion::Local(local) => {
                self.add_pop_top_n(1);
                let record = self.locals[local.0 as usize];
                self.blocks[cur].insts.push(Inst::with_local_addr(
                    Opcode::store_local_value,
                    record.index as u8,
                    record.offset,
                ));
                if self.blocks[cur].vstack.pop().is_none() {
                    self.error(CONTEXT, BuildError::StackUnderflow("missing value"));
                }
            }
            Promotion::Global(allocation_index) => {
                self.add_pop_top_n(1);
                let inst = Inst::with_value(Opcode::store_global_value, allocation_index as u64);
                self.emit(cur, inst, CONTEXT);
                if self.blocks[cur].vstack.pop().is_none() {
                    self.error(CONTEXT, BuildError::StackUnderflow("missing value"));
                }
            }
            Promotion::Dynamic => {
                if value_type.layout.size == 0 && value_type.store_fn.is_none() {
                    if self.blocks[cur].vstack.pop().is_none() {
                        self.error(CONTEXT, BuildError::StackUnderflow("missing value"));
                    }
                    self.add_pop_top_n(2);
                    return;
                }

                let inst = Inst::with_layout(Opcode::deref_mut, value_type.layout);
                self.emit(cur, inst, CONTEXT);
                self.blocks[cur].vstack.push_unknown(1);

                self.inst_uint(field_index as u64);
                match value_type.store_fn {
                    Some(builtin) => self.inst_call_builtin(builtin),
                    None => self.error(CONTEXT, BuildError::InvalidField),
                }
            }
        }
    }

    fn load_store_promotion(
        &self,
        address: Shadow,
        value_type: &AsmType,
        store: bool,
    ) -> Promotion {
        // only the plain value type can bypass its load/store builtins
        let is_value_type = matches!(
            (value_type.load_fn, VALUE_TYPE.load_fn),
            (Some(a), Some(b)) if std::ptr::eq(a, b)
        ) && matches!(
            (value_type.store_fn, VALUE_TYPE.store_fn),
            (Some(a), Some(b)) if std::ptr::eq(a, b)
        );
        if !is_value_type {
            return Promotion::Dynamic;
        }

        match address {
            Shadow::LocalAddr(local) => {
                let record = self.locals[local.0 as usize];
                if record.layout.alignment as usize > VALUE_SIZE_IN_BYTES {
                    // the frame offset of an over-aligned local is
                    // only known at frame entry
                    return Promotion::Dynamic;
                }
                if record.layout.size < value_type.layout.size
                    || record.layout.alignment < value_type.layout.alignment
                {
                    return Promotion::Dynamic;
                }
                Promotion::Local(local)
            }
            Shadow::Constant(value) => {
                let address = value.as_address();
                if address.allocation as usize >= self.module.globals_count()
                    || address.generation != 0
                    || address.offset != 0
                {
                    return Promotion::Dynamic;
                }

                let global = &self.module.globals[address.allocation as usize];
                if !global.has_definition()
                    || (store && !global.is_mutable())
                    || global.size() < value_type.layout.size
                    || (global.alignment as u32) < value_type.layout.alignment
                {
                    return Promotion::Dynamic;
                }
                Promotion::Global(address.allocation)
            }
            Shadow::Unknown => Promotion::Dynamic,
        }
    }
}

enum Promotion {
    Dynamic,
    Local(LocalId),
    Global(u32),
}
