// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

// Guest-visible memory management: heap allocation, allocation
// splitting and poisoning, address arithmetic and the address/integer
// round trip. These all reach into the allocation table, so they are
// VM-only.

use stavm_types::Value;

use crate::{
    builtin::{Builtin, BuiltinFlags},
    interpreter::{HandleResult, Machine},
};

/// (alignment, size) -> address
pub static HEAP_ALLOC: Builtin = Builtin {
    imp: heap_alloc,
    input_count: 2,
    output_count: 1,
    flags: BuiltinFlags::VM_ONLY,
    name: "heap_alloc",
};

fn heap_alloc(machine: &mut Machine) -> HandleResult {
    let size = machine.at(0).as_u64();
    let alignment = machine.at(1).as_u64();
    let process = unsafe { &mut *machine.process };

    let ptr = process
        .vm
        .heap_allocator
        .heap_alloc(size as usize, alignment as usize);
    if ptr.is_null() {
        return machine.panic("out of heap memory");
    }

    let address = process.add_heap_allocation(ptr, size as u32);
    machine.drop_top(1);
    machine.set_at(0, Value::from_address(address));
    HandleResult::Move(1)
}

/// (address) -> (), the memory goes back to the host allocator
pub static HEAP_FREE: Builtin = Builtin {
    imp: heap_free,
    input_count: 1,
    output_count: 0,
    flags: BuiltinFlags::VM_ONLY,
    name: "heap_free",
};

fn heap_free(machine: &mut Machine) -> HandleResult {
    let address = machine.at(0).as_address();
    let process = unsafe { &mut *machine.process };

    let allocation = match process.memory.try_get(address) {
        Some(allocation)
            if allocation.status.can_be_freed()
                && allocation.source == stavm_memory::AllocationSource::Heap =>
        {
            *allocation
        }
        _ => return machine.panic("invalid address"),
    };
    if allocation.split != stavm_memory::AllocationSplit::Unsplit {
        return machine.panic("cannot free split allocation");
    }

    process
        .vm
        .heap_allocator
        .free_alloc(allocation.ptr, allocation.size as usize);
    process.memory.try_get_mut(address).unwrap().status =
        stavm_memory::AllocationStatus::Freed;
    process.memory.remove_freed();

    machine.drop_top(1);
    HandleResult::Move(1)
}

/// run the garbage collector, the result is the number of bytes freed
pub static GC: Builtin = Builtin {
    imp: gc,
    input_count: 0,
    output_count: 1,
    flags: BuiltinFlags::VM_ONLY,
    name: "gc",
};

fn gc(machine: &mut Machine) -> HandleResult {
    let process = unsafe { &mut *machine.process };
    let bytes_freed = process.gc();
    machine.push(Value::from_u64(bytes_freed as u64));
    HandleResult::Move(1)
}

/// (address) -> (), mark unusable until unpoisoned
pub static POISON: Builtin = Builtin {
    imp: poison,
    input_count: 1,
    output_count: 0,
    flags: BuiltinFlags::VM_ONLY,
    name: "poison",
};

fn poison(machine: &mut Machine) -> HandleResult {
    let address = machine.at(0).as_address();
    let process = unsafe { &mut *machine.process };
    if !process.memory.poison(address) {
        return machine.panic("invalid address");
    }
    machine.drop_top(1);
    HandleResult::Move(1)
}

pub static UNPOISON: Builtin = Builtin {
    imp: unpoison,
    input_count: 1,
    output_count: 0,
    flags: BuiltinFlags::VM_ONLY,
    name: "unpoison",
};

fn unpoison(machine: &mut Machine) -> HandleResult {
    let address = machine.at(0).as_address();
    let process = unsafe { &mut *machine.process };
    if !process.memory.unpoison(address) {
        return machine.panic("invalid address");
    }
    machine.drop_top(1);
    HandleResult::Move(1)
}

/// (address) -> (first, rest): split the allocation at the address
/// offset
pub static SPLIT: Builtin = Builtin {
    imp: split,
    input_count: 1,
    output_count: 2,
    flags: BuiltinFlags::VM_ONLY,
    name: "split",
};

fn split(machine: &mut Machine) -> HandleResult {
    let address = machine.at(0).as_address();
    let process = unsafe { &mut *machine.process };

    match process.memory.split(address) {
        Some((addr1, addr2)) => {
            // the first part below, the rest on top
            machine.set_at(0, Value::from_address(addr1));
            machine.push(Value::from_address(addr2));
            HandleResult::Move(1)
        }
        None => machine.panic("invalid address"),
    }
}

/// (first, rest) -> address: merge two adjacent parts of a split chain
pub static MERGE: Builtin = Builtin {
    imp: merge,
    input_count: 2,
    output_count: 1,
    flags: BuiltinFlags::VM_ONLY,
    name: "merge",
};

fn merge(machine: &mut Machine) -> HandleResult {
    let addr2 = machine.at(0).as_address();
    let addr1 = machine.at(1).as_address();
    let process = unsafe { &mut *machine.process };

    match process.memory.merge(addr1, addr2) {
        Some(merged) => {
            machine.drop_top(1);
            machine.set_at(0, Value::from_address(merged));
            HandleResult::Move(1)
        }
        None => machine.panic("invalid address"),
    }
}

/// (address) -> (provenance, integer)
pub static ADDR_TO_INT: Builtin = Builtin {
    imp: addr_to_int,
    input_count: 1,
    output_count: 2,
    flags: BuiltinFlags::VM_ONLY,
    name: "addr_to_int",
};

fn addr_to_int(machine: &mut Machine) -> HandleResult {
    let address = machine.at(0).as_address();
    let process = unsafe { &mut *machine.process };

    match process.memory.addr_to_int(address) {
        Some((provenance, int)) => {
            machine.set_at(0, Value::from_address(provenance));
            machine.push(Value::from_u64(int));
            HandleResult::Move(1)
        }
        None => machine.panic("invalid address"),
    }
}

/// (provenance, integer) -> address
pub static INT_TO_ADDR: Builtin = Builtin {
    imp: int_to_addr,
    input_count: 2,
    output_count: 1,
    flags: BuiltinFlags::VM_ONLY,
    name: "int_to_addr",
};

fn int_to_addr(machine: &mut Machine) -> HandleResult {
    let int = machine.at(0).as_u64();
    let provenance = machine.at(1).as_address();
    let process = unsafe { &mut *machine.process };

    match process.memory.int_to_addr(provenance, int) {
        Some(address) => {
            machine.drop_top(1);
            machine.set_at(0, Value::from_address(address));
            HandleResult::Move(1)
        }
        None => machine.panic("invalid provenance"),
    }
}

/// (address, offset) -> address, overflow invalidates the offset
pub static ADDR_ADD: Builtin = Builtin {
    imp: addr_add,
    input_count: 2,
    output_count: 1,
    flags: BuiltinFlags::NO_PANIC,
    name: "addr_add",
};

fn addr_add(machine: &mut Machine) -> HandleResult {
    let offset = machine.at(0).as_i64();
    let address = machine.at(1).as_address();
    machine.drop_top(1);
    machine.set_at(
        0,
        Value::from_address(stavm_memory::table::addr_add(address, offset)),
    );
    HandleResult::Move(1)
}

pub static ADDR_SUB: Builtin = Builtin {
    imp: addr_sub,
    input_count: 2,
    output_count: 1,
    flags: BuiltinFlags::NO_PANIC,
    name: "addr_sub",
};

fn addr_sub(machine: &mut Machine) -> HandleResult {
    let offset = machine.at(0).as_i64();
    let address = machine.at(1).as_address();
    machine.drop_top(1);
    machine.set_at(
        0,
        Value::from_address(stavm_memory::table::addr_sub(address, offset)),
    );
    HandleResult::Move(1)
}

/// (address, offset) -> address, the panicking flavour for guests that
/// want overflow reported instead of an invalidated address
pub static ADDR_ADD_PANIC: Builtin = Builtin {
    imp: addr_add_panic,
    input_count: 2,
    output_count: 1,
    flags: BuiltinFlags::empty(),
    name: "addr_add_panic",
};

fn addr_add_panic(machine: &mut Machine) -> HandleResult {
    let offset = machine.at(0).as_i64();
    let address = machine.at(1).as_address();

    let result = stavm_memory::table::addr_add(address, offset);
    if result.offset == u32::MAX {
        return machine.panic("address overflow");
    }
    machine.drop_top(1);
    machine.set_at(0, Value::from_address(result));
    HandleResult::Move(1)
}

pub static ADDR_SUB_PANIC: Builtin = Builtin {
    imp: addr_sub_panic,
    input_count: 2,
    output_count: 1,
    flags: BuiltinFlags::empty(),
    name: "addr_sub_panic",
};

fn addr_sub_panic(machine: &mut Machine) -> HandleResult {
    let offset = machine.at(0).as_i64();
    let address = machine.at(1).as_address();

    let result = stavm_memory::table::addr_sub(address, offset);
    if result.offset == u32::MAX {
        return machine.panic("address overflow");
    }
    machine.drop_top(1);
    machine.set_at(0, Value::from_address(result));
    HandleResult::Move(1)
}

/// (lhs, rhs) -> signed distance, both must point into the same
/// allocation
pub static ADDR_DISTANCE: Builtin = Builtin {
    imp: addr_distance,
    input_count: 2,
    output_count: 1,
    flags: BuiltinFlags::empty(),
    name: "addr_distance",
};

fn addr_distance(machine: &mut Machine) -> HandleResult {
    let rhs = machine.at(0).as_address();
    let lhs = machine.at(1).as_address();

    match stavm_memory::table::addr_distance(lhs, rhs) {
        Some(distance) => {
            machine.drop_top(1);
            machine.set_at(0, Value::from_i64(distance));
            HandleResult::Move(1)
        }
        None => machine.panic("addresses are from different allocations"),
    }
}
