// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

use stavm_memory::Allocation;
use stavm_types::Value;

use crate::interpreter::{HandleResult, Machine};

/// prepare the frame for the local allocations that follow: reserve
/// table capacity and record where their indices start
pub fn setup_local_alloc(machine: &mut Machine) -> HandleResult {
    let count = machine.inst().value() as usize;
    let process = unsafe { &mut *machine.process };

    if process.memory.needs_to_grow(count) {
        process.memory.grow(count);
    }

    unsafe {
        (*machine.fp).first_local_alloc = process.memory.next_index();
        (*machine.fp).local_generation = process.memory.cur_generation();
    }
    HandleResult::Move(1)
}

/// a pointer-aligned local allocation in the frame, the builder has
/// taken care of the alignment
pub fn local_alloc(machine: &mut Machine) -> HandleResult {
    let layout = machine.inst().layout();
    debug_assert_eq!(layout.alignment as usize, stavm_types::VALUE_SIZE_IN_BYTES);

    let process = unsafe { &mut *machine.process };
    unsafe {
        let memory = (*machine.fp).next_frame();
        debug_assert_eq!(memory as usize % stavm_types::VALUE_SIZE_IN_BYTES, 0);
        (*machine.fp).next_offset += layout.size;

        process.memory.new_allocation(Allocation::local(
            memory,
            layout.size,
            (*machine.fp).local_generation,
        ));
    }
    HandleResult::Move(1)
}

/// an over-aligned local allocation: align the frame cursor up, the
/// reserved space covers the worst case of alignment plus size
pub fn local_alloc_aligned(machine: &mut Machine) -> HandleResult {
    let layout = machine.inst().layout();
    let process = unsafe { &mut *machine.process };

    unsafe {
        let memory = (*machine.fp).next_frame();
        let aligned =
            (memory as usize + layout.alignment as usize - 1) & !(layout.alignment as usize - 1);
        (*machine.fp).next_offset += layout.alignment + layout.size;

        process.memory.new_allocation(Allocation::local(
            aligned as *mut u8,
            layout.size,
            (*machine.fp).local_generation,
        ));
    }
    HandleResult::Move(1)
}

/// reserve frame bytes without creating an allocation record, emitted
/// when no local address escapes
pub fn local_storage(machine: &mut Machine) -> HandleResult {
    let size = machine.inst().value();
    unsafe {
        (*machine.fp).next_offset += size;
    }
    HandleResult::Move(1)
}

/// read one value directly out of the frame at a build-time offset
pub fn load_local_value(machine: &mut Machine) -> HandleResult {
    let (_index, frame_offset) = machine.inst().local_addr();
    let value = unsafe {
        let memory = (machine.fp as *mut u8).add(frame_offset as usize);
        *(memory as *const Value)
    };
    machine.push(value);
    HandleResult::Move(1)
}

pub fn store_local_value(machine: &mut Machine) -> HandleResult {
    let (_index, frame_offset) = machine.inst().local_addr();
    let value = machine.pop();
    unsafe {
        let memory = (machine.fp as *mut u8).add(frame_offset as usize);
        *(memory as *mut Value) = value;
    }
    HandleResult::Move(1)
}

/// read one value out of a global allocation, the generation check is
/// unnecessary because globals never re-generate
pub fn load_global_value(machine: &mut Machine) -> HandleResult {
    let process = unsafe { &mut *machine.process };
    let allocation = process.memory.get(machine.inst().value());
    let value = unsafe { *(allocation.ptr as *const Value) };
    machine.push(value);
    HandleResult::Move(1)
}

pub fn store_global_value(machine: &mut Machine) -> HandleResult {
    let process = unsafe { &mut *machine.process };
    let allocation = process.memory.get(machine.inst().value());
    let value = machine.pop();
    unsafe {
        *(allocation.ptr as *mut Value) = value;
    }
    HandleResult::Move(1)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use stavm_types::{Layout, Signature};

    use crate::{
        asm_type::VALUE_TYPE,
        test_helper::{run_ok, single_function_module},
    };

    #[test]
    fn test_local_value_promotion_round_trip() {
        // store and load through a local whose address never escapes:
        // the builder promotes both accesses to frame-direct opcodes
        let module = single_function_module(Signature::new(1, 1), |builder| {
            let local = builder.build_local(Layout::of_value());
            builder.inst_local_addr(local);
            builder.inst_store_field(&VALUE_TYPE, 0); // local = argument
            builder.inst_local_addr(local);
            builder.inst_load_field(&VALUE_TYPE, 0);
            builder.inst_return();
        });

        use stavm_types::opcode::Opcode;
        let function = module.find_function_by_name("main").unwrap();
        let insts = module.function(function).insts();
        // no allocation records are needed, the prologue reserves raw
        // frame storage
        assert!(insts
            .iter()
            .any(|inst| inst.opcode() == Opcode::local_storage));
        assert!(!insts
            .iter()
            .any(|inst| inst.opcode() == Opcode::setup_local_alloc));

        assert_eq!(run_ok(&module, &[987], 1), vec![987]);
    }

    #[test]
    fn test_over_aligned_local_goes_through_the_allocation_table() {
        // an over-aligned local is never promoted to frame-direct
        // access, both accesses deref a real allocation
        let module = single_function_module(Signature::new(1, 1), |builder| {
            let local = builder.build_local(Layout::new(8, 16));
            builder.inst_local_addr(local); // [argument, addr]
            builder.inst_store_field(&VALUE_TYPE, 0); // *addr = argument
            builder.inst_local_addr(local);
            builder.inst_load_field(&VALUE_TYPE, 0);
            builder.inst_return();
        });

        use stavm_types::opcode::Opcode;
        let function = module.find_function_by_name("main").unwrap();
        let insts = module.function(function).insts();
        assert!(insts
            .iter()
            .any(|inst| inst.opcode() == Opcode::setup_local_alloc));
        assert!(insts
            .iter()
            .any(|inst| inst.opcode() == Opcode::local_alloc_aligned));
        assert!(insts
            .iter()
            .any(|inst| inst.opcode() == Opcode::return_free));

        assert_eq!(run_ok(&module, &[55555], 1), vec![55555]);
    }

    #[test]
    fn test_zero_sized_local_reserves_nothing() {
        let module = single_function_module(Signature::new(0, 1), |builder| {
            let _local = builder.build_local(Layout::new(0, 1));
            builder.inst_uint(1);
            builder.inst_return();
        });

        use stavm_types::opcode::Opcode;
        let function = module.find_function_by_name("main").unwrap();
        let insts = module.function(function).insts();
        assert!(!insts
            .iter()
            .any(|inst| inst.opcode() == Opcode::local_storage));
        assert_eq!(run_ok(&module, &[], 1), vec![1]);
    }
}
