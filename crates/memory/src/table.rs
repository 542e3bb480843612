// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

use stavm_types::Address;

use crate::{Allocation, AllocationSplit, AllocationSource, AllocationStatus, GcTracking};

/// the allocation table of a process.
///
/// allocations are appended and addressed by index, the table carries
/// an 8-bit generation counter that is bumped whenever trailing freed
/// slots are reclaimed, so an address into a reused slot can be told
/// apart from a live one by its 2 generation bits.
pub struct MemoryTable {
    allocations: Vec<Allocation>,
    cur_generation: u8,
}

impl MemoryTable {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            allocations: Vec::new(),
            cur_generation: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    #[inline]
    pub fn next_index(&self) -> u32 {
        self.allocations.len() as u32
    }

    #[inline]
    pub fn cur_generation(&self) -> u8 {
        self.cur_generation
    }

    #[inline]
    pub fn get(&self, index: u32) -> &Allocation {
        &self.allocations[index as usize]
    }

    #[inline]
    pub fn get_mut(&mut self, index: u32) -> &mut Allocation {
        &mut self.allocations[index as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Allocation> {
        self.allocations.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Allocation> {
        self.allocations.iter_mut()
    }

    pub fn new_allocation(&mut self, allocation: Allocation) -> Address {
        let index = self.allocations.len() as u32;
        self.allocations.push(allocation);
        Address::new(index, allocation.generation & 0b11, 0)
    }

    pub fn needs_to_grow(&self, additional: usize) -> bool {
        self.allocations.len() + additional > self.allocations.capacity()
    }

    pub fn grow(&mut self, additional: usize) {
        self.allocations.reserve(additional);
    }

    /// the allocation behind an address, when the index is in range and
    /// the generation bits match. the status is not checked here.
    pub fn try_get(&self, address: Address) -> Option<&Allocation> {
        let allocation = self.allocations.get(address.allocation as usize)?;
        if allocation.generation & 0b11 != address.generation {
            return None;
        }
        Some(allocation)
    }

    pub fn try_get_mut(&mut self, address: Address) -> Option<&mut Allocation> {
        let allocation = self.allocations.get_mut(address.allocation as usize)?;
        if allocation.generation & 0b11 != address.generation {
            return None;
        }
        Some(allocation)
    }

    /// reclaim trailing freed slots.
    ///
    /// only the tail can be removed because addresses identify
    /// allocations by index, the generation is incremented so a later
    /// reuse of the slots cannot match stale addresses.
    pub fn remove_freed(&mut self) {
        if self
            .allocations
            .last()
            .map_or(true, |allocation| allocation.status != AllocationStatus::Freed)
        {
            return;
        }

        while self
            .allocations
            .last()
            .is_some_and(|allocation| allocation.status == AllocationStatus::Freed)
        {
            self.allocations.pop();
        }

        self.cur_generation = self.cur_generation.wrapping_add(1);
    }

    pub fn clear(&mut self) {
        self.allocations.clear();
    }

    //
    // split and merge
    //

    /// split the allocation at the address offset.
    ///
    /// the original shrinks to `[0, offset)` and a new allocation
    /// covers `[offset, size)`, inheriting source and status.
    /// addresses into the original with an offset at or beyond the
    /// split point are invalidated by the shrunk bounds.
    pub fn split(&mut self, address: Address) -> Option<(Address, Address)> {
        let allocation = self.try_get(address)?;
        if !allocation.status.is_usable() || address.offset >= allocation.size {
            return None;
        }

        let mut new_allocation = *allocation;
        new_allocation.ptr = allocation.unchecked_offset(address.offset);
        new_allocation.size -= address.offset;
        new_allocation.split = match allocation.split {
            AllocationSplit::Unsplit | AllocationSplit::Last => AllocationSplit::Last,
            AllocationSplit::First | AllocationSplit::Middle => AllocationSplit::Middle,
        };
        let addr2 = self.new_allocation(new_allocation);

        let allocation = self.try_get_mut(address).unwrap();
        allocation.size = address.offset;
        allocation.split = match allocation.split {
            AllocationSplit::Unsplit | AllocationSplit::First => AllocationSplit::First,
            AllocationSplit::Middle | AllocationSplit::Last => AllocationSplit::Middle,
        };
        let addr1 = Address::new(address.allocation, address.generation, 0);

        Some((addr1, addr2))
    }

    /// merge two contiguous parts of a split chain back together.
    ///
    /// the first grows to cover the second, the second is freed. the
    /// possible split configurations are (first, mid), (first, last),
    /// (mid, mid) and (mid, last): (first, last) restores an unsplit
    /// allocation, a trailing last makes the merged one the last.
    pub fn merge(&mut self, addr1: Address, addr2: Address) -> Option<Address> {
        let alloc1 = *self.try_get(addr1)?;
        let alloc2 = *self.try_get(addr2)?;

        if !alloc1.status.is_usable()
            || !alloc2.status.is_usable()
            || alloc1.split == AllocationSplit::Unsplit
            || alloc2.split == AllocationSplit::Unsplit
            || alloc1.unchecked_offset(alloc1.size) != alloc2.ptr
        {
            return None;
        }

        let merged_split = if alloc2.split == AllocationSplit::Last {
            if alloc1.split == AllocationSplit::First {
                AllocationSplit::Unsplit
            } else {
                AllocationSplit::Last
            }
        } else {
            alloc1.split
        };

        let first = self.try_get_mut(addr1).unwrap();
        first.size += alloc2.size;
        first.split = merged_split;

        let second = self.try_get_mut(addr2).unwrap();
        second.status = AllocationStatus::Freed;

        Some(addr1)
    }

    //
    // poisoning
    //

    pub fn poison(&mut self, address: Address) -> bool {
        match self.try_get_mut(address) {
            Some(allocation) if allocation.status.is_usable() => {
                allocation.status = AllocationStatus::Poisoned;
                true
            }
            _ => false,
        }
    }

    /// fiber memory stays poisoned for its whole life, a handle must
    /// never become readable
    pub fn unpoison(&mut self, address: Address) -> bool {
        match self.try_get_mut(address) {
            Some(allocation)
                if allocation.status == AllocationStatus::Poisoned
                    && allocation.source != AllocationSource::Fiber =>
            {
                allocation.status = AllocationStatus::Allocated;
                true
            }
            _ => false,
        }
    }

    //
    // address and integer conversion
    //

    /// the native pointer of an address together with a provenance
    /// address whose offset is one past the end, so the garbage
    /// collector keeps the allocation alive while the guest holds only
    /// the integer. reads through the provenance address fail until
    /// `int_to_addr` restores a valid offset.
    pub fn addr_to_int(&self, address: Address) -> Option<(Address, u64)> {
        let allocation = self.try_get(address)?;
        if address.offset >= allocation.size {
            return None;
        }

        let ptr = allocation.unchecked_offset(address.offset);
        let provenance = Address::new(address.allocation, address.generation, allocation.size);
        Some((provenance, ptr as usize as u64))
    }

    pub fn int_to_addr(&self, provenance: Address, int: u64) -> Option<Address> {
        let allocation = self.try_get(provenance)?;
        if provenance.offset != allocation.size {
            return None;
        }

        let offset = (int as usize as isize) - (allocation.ptr as usize as isize);
        if offset < 0 || offset >= allocation.size as isize {
            return None;
        }

        Some(Address::new(
            provenance.allocation,
            provenance.generation,
            offset as u32,
        ))
    }

    //
    // GC marks
    //

    pub fn declare_reachable(&mut self, address: Address) -> bool {
        match self.try_get_mut(address) {
            Some(allocation) if allocation.source == AllocationSource::Heap => {
                allocation.gc = GcTracking::ReachableExplicit;
                true
            }
            _ => false,
        }
    }

    pub fn undeclare_reachable(&mut self, address: Address) -> bool {
        match self.try_get_mut(address) {
            Some(allocation) if allocation.source == AllocationSource::Heap => {
                allocation.gc = GcTracking::Unreachable;
                true
            }
            _ => false,
        }
    }

    pub fn declare_weak(&mut self, address: Address) -> bool {
        match self.try_get_mut(address) {
            Some(allocation) => {
                allocation.is_gc_weak = true;
                true
            }
            None => false,
        }
    }

    pub fn undeclare_weak(&mut self, address: Address) -> bool {
        match self.try_get_mut(address) {
            Some(allocation) => {
                allocation.is_gc_weak = false;
                true
            }
            None => false,
        }
    }

    /// mark a heap allocation as freed without releasing its memory
    pub fn leak_heap(&mut self, address: Address) -> bool {
        match self.try_get_mut(address) {
            Some(allocation)
                if allocation.status.can_be_freed()
                    && allocation.source == AllocationSource::Heap
                    && allocation.split == AllocationSplit::Unsplit =>
            {
                allocation.status = AllocationStatus::Freed;
                true
            }
            _ => false,
        }
    }
}

/// add a signed offset to an address, saturating to the invalid offset
/// `u32::MAX` on overflow so the next bounds check fails
pub fn addr_add(address: Address, offset: i64) -> Address {
    let result = address.offset as i64 + offset;
    let offset = if !(0..=u32::MAX as i64 - 1).contains(&result) {
        u32::MAX
    } else {
        result as u32
    };
    Address::new(address.allocation, address.generation, offset)
}

pub fn addr_sub(address: Address, offset: i64) -> Address {
    addr_add(address, -offset)
}

/// the signed distance between two addresses of the same allocation and
/// generation
pub fn addr_distance(lhs: Address, rhs: Address) -> Option<i64> {
    if lhs.allocation != rhs.allocation || lhs.generation != rhs.generation {
        return None;
    }
    Some(lhs.offset as i64 - rhs.offset as i64)
}
