// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

use stavm_types::Value;

use crate::interpreter::{HandleResult, Machine};

fn do_deref(machine: &mut Machine, mutable: bool) -> HandleResult {
    let layout = machine.inst().layout();
    let address = machine.at(0).as_address();
    let process = unsafe { &mut *machine.process };

    let allocation = match process.memory.try_get(address) {
        Some(allocation) => allocation,
        None => return machine.panic("invalid address"),
    };
    if mutable && allocation.source.is_const() {
        return machine.panic("invalid address");
    }

    match allocation.checked_offset(address, layout) {
        Some(ptr) => {
            machine.set_at(0, Value::from_ptr(ptr));
            HandleResult::Move(1)
        }
        None => machine.panic("invalid address"),
    }
}

/// pop an address, push the checked read-only native pointer
pub fn deref_const(machine: &mut Machine) -> HandleResult {
    do_deref(machine, false)
}

pub fn deref_mut(machine: &mut Machine) -> HandleResult {
    do_deref(machine, true)
}

/// pop an index and advance the address offset by index times the
/// element stride, bounds are checked by the next deref
pub fn array_element(machine: &mut Machine) -> HandleResult {
    let stride = machine.inst().value() as i64;
    let index = machine.pop().as_i64();
    let mut address = machine.at(0).as_address();

    address.offset = (address.offset as i64).wrapping_add(stride.wrapping_mul(index)) as u32;
    machine.set_at(0, Value::from_address(address));
    HandleResult::Move(1)
}

/// advance the address offset by a constant number of bytes
pub fn aggregate_member(machine: &mut Machine) -> HandleResult {
    let offset = machine.inst().value();
    let mut address = machine.at(0).as_address();

    address.offset = address.offset.wrapping_add(offset);
    machine.set_at(0, Value::from_address(address));
    HandleResult::Move(1)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use stavm_types::{Layout, Signature};

    use crate::{
        asm_type::VALUE_TYPE,
        test_helper::{run_ok, run_panic, single_function_module},
    };

    /// local x of one value, then load x[1]: the deref catches the
    /// out-of-bounds offset produced by the element step
    #[test]
    fn test_out_of_bounds_deref_panics() {
        let module = single_function_module(Signature::new(1, 0), |builder| {
            let local = builder.build_local(Layout::new(8, 16));
            builder.inst_local_addr(local); // [index, addr]
            builder.inst_roll(1); // [addr, index]
            builder.inst_array_element(Layout::of_value()); // addr + 8 * index
            builder.inst_load_field(&VALUE_TYPE, 0);
            builder.inst_pop(0);
            builder.inst_return();
        });

        // index 0 is fine
        assert_eq!(run_ok(&module, &[0], 0), Vec::<u64>::new());
        // index 1 is one past the end
        assert_eq!(run_panic(&module, &[1]), "invalid address");
        // negative indices wrap the offset far out of bounds
        assert_eq!(run_panic(&module, &[u64::MAX]), "invalid address");
    }

    #[test]
    fn test_aggregate_member_access() {
        // { u32, u64 }: member 1 sits at byte offset 8
        let module = single_function_module(Signature::new(1, 1), |builder| {
            let members = [Layout::new(4, 4), Layout::new(8, 8)];
            let local = builder.build_local(Layout::aggregate(&members));

            // store the argument into member 1 through the address
            builder.inst_local_addr(local);
            builder.inst_aggregate_member(1, &members);
            builder.inst_store_field(&VALUE_TYPE, 0);

            builder.inst_local_addr(local);
            builder.inst_aggregate_member(1, &members);
            builder.inst_load_field(&VALUE_TYPE, 0);
            builder.inst_return();
        });

        assert_eq!(run_ok(&module, &[0xABCD_EF01], 1), vec![0xABCD_EF01]);
    }

    #[test]
    fn test_use_after_free_is_detected() {
        // a helper returns the address of its own local, freeing it;
        // the caller's deref must fail the generation check
        use crate::builder::{BuildOptions, Builder};
        use crate::module::Module;
        use crate::test_helper::run_main_panic;

        let mut module = Module::new("test");
        let escape = module.add_function("escape", Signature::new(0, 1));
        let main = module.add_function("main", Signature::new(0, 0));
        module.export_function(main);

        let mut builder = Builder::for_function(&mut module, escape, BuildOptions::default());
        let local = builder.build_local(Layout::new(8, 16));
        builder.inst_local_addr(local);
        builder.inst_return();
        assert!(builder.finish());

        let mut builder = Builder::for_function(&mut module, main, BuildOptions::default());
        builder.inst_call(escape);
        builder.inst_load_field(&VALUE_TYPE, 0);
        builder.inst_pop(0);
        builder.inst_return();
        assert!(builder.finish());

        assert_eq!(run_main_panic(&module, &[]), "invalid address");
    }
}
