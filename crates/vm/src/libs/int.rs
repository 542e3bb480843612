// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

// Signed integer arithmetic in three overflow flavours: wrapping,
// panicking and saturating. Division only comes as wrapping (the one
// overflow case, i64::MIN / -1, yields i64::MIN) or panicking;
// dividing by zero always panics.
//
// Everything here is process-free and foldable, so fully-constant
// expressions evaporate at build time.

use stavm_types::Value;

use crate::{
    builtin::{Builtin, BuiltinFlags},
    interpreter::{HandleResult, Machine},
};

const FOLDABLE: BuiltinFlags = BuiltinFlags::NO_PROCESS.union(BuiltinFlags::CONSTANT_FOLD);
const FOLDABLE_NO_PANIC: BuiltinFlags = FOLDABLE.union(BuiltinFlags::NO_PANIC);

// the right-hand side is the top of the stack
macro_rules! binary_builtin {
    ($static_name:ident, $fn_name:ident, $name:literal, $flags:expr, |$machine:ident, $lhs:ident, $rhs:ident| $body:expr) => {
        pub static $static_name: Builtin = Builtin {
            imp: $fn_name,
            input_count: 2,
            output_count: 1,
            flags: $flags,
            name: $name,
        };

        fn $fn_name($machine: &mut Machine) -> HandleResult {
            let $rhs = $machine.at(0).as_i64();
            let $lhs = $machine.at(1).as_i64();
            let result: i64 = $body;
            $machine.drop_top(1);
            $machine.set_at(0, Value::from_i64(result));
            HandleResult::Move(1)
        }
    };
}

binary_builtin!(SADD_WRAP, sadd_wrap, "sadd_wrap", FOLDABLE_NO_PANIC, |machine, lhs, rhs| {
    lhs.wrapping_add(rhs)
});

binary_builtin!(SSUB_WRAP, ssub_wrap, "ssub_wrap", FOLDABLE_NO_PANIC, |machine, lhs, rhs| {
    lhs.wrapping_sub(rhs)
});

binary_builtin!(SMUL_WRAP, smul_wrap, "smul_wrap", FOLDABLE_NO_PANIC, |machine, lhs, rhs| {
    lhs.wrapping_mul(rhs)
});

binary_builtin!(SADD_SAT, sadd_sat, "sadd_sat", FOLDABLE_NO_PANIC, |machine, lhs, rhs| {
    lhs.saturating_add(rhs)
});

binary_builtin!(SSUB_SAT, ssub_sat, "ssub_sat", FOLDABLE_NO_PANIC, |machine, lhs, rhs| {
    lhs.saturating_sub(rhs)
});

binary_builtin!(SMUL_SAT, smul_sat, "smul_sat", FOLDABLE_NO_PANIC, |machine, lhs, rhs| {
    lhs.saturating_mul(rhs)
});

binary_builtin!(SADD_PANIC, sadd_panic, "sadd_panic", FOLDABLE, |machine, lhs, rhs| {
    match lhs.checked_add(rhs) {
        Some(result) => result,
        None => return machine.panic("integer overflow"),
    }
});

binary_builtin!(SSUB_PANIC, ssub_panic, "ssub_panic", FOLDABLE, |machine, lhs, rhs| {
    match lhs.checked_sub(rhs) {
        Some(result) => result,
        None => return machine.panic("integer overflow"),
    }
});

binary_builtin!(SMUL_PANIC, smul_panic, "smul_panic", FOLDABLE, |machine, lhs, rhs| {
    match lhs.checked_mul(rhs) {
        Some(result) => result,
        None => return machine.panic("integer overflow"),
    }
});

binary_builtin!(SDIV_WRAP, sdiv_wrap, "sdiv_wrap", FOLDABLE, |machine, lhs, rhs| {
    if rhs == 0 {
        return machine.panic("division by zero");
    }
    lhs.wrapping_div(rhs)
});

binary_builtin!(SDIV_PANIC, sdiv_panic, "sdiv_panic", FOLDABLE, |machine, lhs, rhs| {
    if rhs == 0 {
        return machine.panic("division by zero");
    }
    match lhs.checked_div(rhs) {
        Some(result) => result,
        None => return machine.panic("integer overflow"),
    }
});

binary_builtin!(SREM_WRAP, srem_wrap, "srem_wrap", FOLDABLE, |machine, lhs, rhs| {
    if rhs == 0 {
        return machine.panic("division by zero");
    }
    lhs.wrapping_rem(rhs)
});

binary_builtin!(SREM_PANIC, srem_panic, "srem_panic", FOLDABLE, |machine, lhs, rhs| {
    if rhs == 0 {
        return machine.panic("division by zero");
    }
    match lhs.checked_rem(rhs) {
        Some(result) => result,
        None => return machine.panic("integer overflow"),
    }
});
