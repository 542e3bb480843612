// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

use stavm_types::{Layout, Value};

use crate::{
    builtin::{Builtin, BuiltinFlags},
    interpreter::{HandleResult, Machine},
};

/// a guest-visible memory type: its layout plus the builtins that move
/// a field between memory and the value stack.
///
/// the load builtin receives (pointer, field index) and produces the
/// field value, the store builtin receives (value, pointer, field
/// index) and produces nothing. for the plain value type the builder
/// bypasses the builtins entirely whenever the address is a promotable
/// local or global.
pub struct AsmType {
    pub layout: Layout,
    pub field_count: usize,
    pub load_fn: Option<&'static Builtin>,
    pub store_fn: Option<&'static Builtin>,
    pub name: &'static str,
}

/// a single stack value in memory
pub static VALUE_TYPE: AsmType = AsmType {
    layout: Layout::of_value(),
    field_count: 1,
    load_fn: Some(&LOAD_VALUE),
    store_fn: Some(&STORE_VALUE),
    name: "value",
};

pub static LOAD_VALUE: Builtin = Builtin {
    imp: load_value,
    input_count: 2,
    output_count: 1,
    flags: BuiltinFlags::NO_PANIC.union(BuiltinFlags::NO_PROCESS),
    name: "load_value",
};

pub static STORE_VALUE: Builtin = Builtin {
    imp: store_value,
    input_count: 3,
    output_count: 0,
    flags: BuiltinFlags::NO_PANIC.union(BuiltinFlags::NO_PROCESS),
    name: "store_value",
};

fn load_value(machine: &mut Machine) -> HandleResult {
    debug_assert_eq!(machine.at(0).as_u64(), 0, "the value type has one field");
    let ptr = machine.at(1).as_ptr();
    machine.drop_top(1);
    machine.set_at(0, unsafe { *(ptr as *const Value) });
    HandleResult::Move(1)
}

fn store_value(machine: &mut Machine) -> HandleResult {
    debug_assert_eq!(machine.at(0).as_u64(), 0, "the value type has one field");
    let ptr = machine.at(1).as_ptr();
    let value = machine.at(2);
    unsafe {
        *(ptr as *mut Value) = value;
    }
    machine.drop_top(3);
    HandleResult::Move(1)
}
