// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

// The dispatcher.
//
// Execution is a loop over a per-opcode handler table. A handler reads
// the instruction word at `ip`, applies its effect to the machine and
// reports how to continue. Between any two instructions the register
// triple plus the process pointer are the only authoritative state, so
// a handler may switch fibers by loading another register set.
//
// The process pointer is null while the builder constant-folds a
// builtin call: the synthetic program never touches memory, fibers or
// panics with a handler, builtins taking part declare NO_PROCESS.

use std::sync::OnceLock;

use stavm_types::{inst::Inst, opcode::MAX_OPCODE_NUMBER, Value};

use crate::{
    builtin::Builtin,
    process::{Process, Registers},
    stack::StackFrame,
};

mod calling;
mod control_flow;
mod fiber;
mod fundamental;
mod immediate;
mod local;
mod memory;

pub enum HandleResult {
    /// advance the instruction pointer by the signed amount
    Move(isize),
    /// the handler installed the instruction pointer itself (calls,
    /// returns, fiber switches)
    Goto,
    /// execution finished, control returns to the host
    End,
    /// a panic is unwinding
    Panic,
}

/// the register file of the interpreter
pub struct Machine<'a> {
    pub ip: *const Inst,
    pub vsp: *mut Value,
    pub fp: *mut StackFrame,
    /// null during build-time constant folding
    pub process: *mut Process<'a>,
}

impl<'a> Machine<'a> {
    #[inline]
    pub fn inst(&self) -> Inst {
        unsafe { *self.ip }
    }

    /// the value at the stack index, `at(0)` is the top
    #[inline]
    pub fn at(&self, index: usize) -> Value {
        unsafe { *self.vsp.add(index) }
    }

    #[inline]
    pub fn set_at(&mut self, index: usize, value: Value) {
        unsafe { *self.vsp.add(index) = value }
    }

    #[inline]
    pub fn push(&mut self, value: Value) {
        unsafe {
            self.vsp = self.vsp.sub(1);
            *self.vsp = value;
        }
    }

    #[inline]
    pub fn pop(&mut self) -> Value {
        unsafe {
            let value = *self.vsp;
            self.vsp = self.vsp.add(1);
            value
        }
    }

    #[inline]
    pub fn drop_top(&mut self, count: usize) {
        self.vsp = unsafe { self.vsp.add(count) };
    }

    /// publish the registers and report a panic through the process.
    /// with a null process (constant folding) the unwind is silent.
    pub fn panic(&mut self, message: &str) -> HandleResult {
        if !self.process.is_null() {
            unsafe {
                (*self.process).regs = Registers {
                    ip: self.ip,
                    vsp: self.vsp,
                    fp: self.fp,
                };
                (*self.process).panic(message);
            }
        }
        HandleResult::Panic
    }
}

pub(crate) type HandlerFn = for<'a, 'b> fn(&'a mut Machine<'b>) -> HandleResult;

fn unreachable_handler(machine: &mut Machine) -> HandleResult {
    unreachable!("invalid opcode: 0x{:02x}", machine.inst().opcode_num());
}

pub(crate) struct Dispatcher {
    pub handlers: [HandlerFn; MAX_OPCODE_NUMBER],
}

static DISPATCHER: OnceLock<Dispatcher> = OnceLock::new();

impl Dispatcher {
    pub(crate) fn global() -> &'static Dispatcher {
        DISPATCHER.get_or_init(Dispatcher::new)
    }

    fn new() -> Self {
        use stavm_types::opcode::Opcode;

        let mut handlers: [HandlerFn; MAX_OPCODE_NUMBER] =
            [unreachable_handler; MAX_OPCODE_NUMBER];

        // control flow
        handlers[Opcode::nop as usize] = fundamental::nop;
        handlers[Opcode::block as usize] = fundamental::block;
        handlers[Opcode::return_ as usize] = control_flow::return_;
        handlers[Opcode::return_free as usize] = control_flow::return_free;
        handlers[Opcode::jump as usize] = control_flow::jump;
        handlers[Opcode::branch_false as usize] = control_flow::branch_false;
        handlers[Opcode::branch_eq as usize] = control_flow::branch_eq;
        handlers[Opcode::branch_ne as usize] = control_flow::branch_ne;
        handlers[Opcode::branch_lt as usize] = control_flow::branch_lt;
        handlers[Opcode::branch_le as usize] = control_flow::branch_le;
        handlers[Opcode::branch_ge as usize] = control_flow::branch_ge;
        handlers[Opcode::branch_gt as usize] = control_flow::branch_gt;
        handlers[Opcode::panic as usize] = control_flow::panic;
        handlers[Opcode::exit as usize] = control_flow::exit;

        // calls
        handlers[Opcode::call as usize] = calling::call;
        handlers[Opcode::call_indirect as usize] = calling::call_indirect;
        handlers[Opcode::call_builtin as usize] = calling::call_builtin;
        handlers[Opcode::call_builtin_no_frame as usize] = calling::call_builtin_no_frame;
        handlers[Opcode::call_builtin_sig as usize] = fundamental::call_builtin_sig;

        // fibers
        handlers[Opcode::fiber_create as usize] = fiber::fiber_create;
        handlers[Opcode::fiber_resume as usize] = fiber::fiber_resume;
        handlers[Opcode::fiber_suspend as usize] = fiber::fiber_suspend;

        // values
        handlers[Opcode::push as usize] = immediate::push;
        handlers[Opcode::push2 as usize] = immediate::push2;
        handlers[Opcode::push3 as usize] = immediate::push3;
        handlers[Opcode::pushn as usize] = immediate::pushn;
        handlers[Opcode::global_addr as usize] = immediate::global_addr;
        handlers[Opcode::function_addr as usize] = immediate::function_addr;
        handlers[Opcode::local_addr as usize] = immediate::local_addr;
        handlers[Opcode::cc as usize] = immediate::cc;

        // stack manipulation
        handlers[Opcode::pop as usize] = fundamental::pop;
        handlers[Opcode::pop_top as usize] = fundamental::pop_top;
        handlers[Opcode::pick as usize] = fundamental::pick;
        handlers[Opcode::dup as usize] = fundamental::dup;
        handlers[Opcode::roll as usize] = fundamental::roll;
        handlers[Opcode::swap as usize] = fundamental::swap;
        handlers[Opcode::select as usize] = fundamental::select;

        // memory
        handlers[Opcode::setup_local_alloc as usize] = local::setup_local_alloc;
        handlers[Opcode::local_alloc as usize] = local::local_alloc;
        handlers[Opcode::local_alloc_aligned as usize] = local::local_alloc_aligned;
        handlers[Opcode::local_storage as usize] = local::local_storage;
        handlers[Opcode::deref_const as usize] = memory::deref_const;
        handlers[Opcode::deref_mut as usize] = memory::deref_mut;
        handlers[Opcode::array_element as usize] = memory::array_element;
        handlers[Opcode::aggregate_member as usize] = memory::aggregate_member;
        handlers[Opcode::load_local_value as usize] = local::load_local_value;
        handlers[Opcode::store_local_value as usize] = local::store_local_value;
        handlers[Opcode::load_global_value as usize] = local::load_global_value;
        handlers[Opcode::store_global_value as usize] = local::store_global_value;

        Self { handlers }
    }
}

/// run the machine until the program finishes (true) or a panic
/// unwinds (false)
pub fn execute(machine: &mut Machine) -> bool {
    let dispatcher = Dispatcher::global();
    loop {
        let opcode_num = machine.inst().opcode_num() as usize;
        match (dispatcher.handlers[opcode_num])(machine) {
            HandleResult::Move(offset) => {
                machine.ip = unsafe { machine.ip.offset(offset) };
            }
            HandleResult::Goto => {}
            HandleResult::End => return true,
            HandleResult::Panic => return false,
        }
    }
}

/// evaluate a builtin on a synthetic machine at build time.
///
/// the three-instruction program keeps the dispatch contract intact:
/// the builtin lands on its signature word and falls off the `exit`.
/// inputs occupy the top of the scratch stack; on success the outputs
/// are returned deepest-first, ready to be re-pushed as constants.
pub fn constant_fold_builtin(builtin: &Builtin, vstack: &mut [Value; 256]) -> Option<Vec<Value>> {
    use stavm_types::opcode::Opcode;

    let code = [
        Inst::none(Opcode::nop),
        Inst::with_signature(
            Opcode::call_builtin_sig,
            stavm_types::Signature::new(builtin.input_count, builtin.output_count),
            builtin.flags.bits(),
        ),
        Inst::none(Opcode::exit),
    ];

    let input_base = vstack.len() - builtin.input_count as usize;
    let mut machine = Machine {
        ip: code.as_ptr(),
        vsp: unsafe { vstack.as_mut_ptr().add(input_base) },
        fp: std::ptr::null_mut(),
        process: std::ptr::null_mut(),
    };

    let finished = match (builtin.imp)(&mut machine) {
        HandleResult::Move(offset) => {
            machine.ip = unsafe { machine.ip.offset(offset) };
            execute(&mut machine)
        }
        HandleResult::Goto => execute(&mut machine),
        HandleResult::End => true,
        HandleResult::Panic => false,
    };
    if !finished {
        return None;
    }

    // deepest output first, so pushing them in order recreates the
    // stack layout
    let output_count = builtin.output_count as usize;
    let mut outputs = Vec::with_capacity(output_count);
    for index in 0..output_count {
        outputs.push(vstack[vstack.len() - 1 - index]);
    }
    Some(outputs)
}
