// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

use std::ptr::NonNull;

use stavm_allocator::Arena;
use stavm_types::{inst::Inst, Layout, Signature};

use crate::{builtin::Builtin, chunk::Chunk, function::Function};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalId(pub u32);

/// a source location attached to instructions for debugging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DebugLocation {
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct InstDebugLocation {
    pub function_index: u32,
    pub inst_index: u32,
    pub location: DebugLocation,
}

/// a global memory region of a module.
///
/// a defined global gets one pre-populated allocation at process
/// start. an undefined one (a native view) requires a host-provided
/// backing, until the host supplies it the allocation is zero-sized.
pub struct Global {
    /// definition bytes in the module arena, None for zero-initialized
    /// or undefined globals
    pub(crate) memory: Option<NonNull<u8>>,
    pub(crate) size: u32,
    pub(crate) allocation_index: u32,
    pub(crate) alignment: u16,
    pub(crate) is_mutable: bool,
    pub(crate) has_definition: bool,
    pub(crate) debug_name: Option<String>,
}

impl Global {
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn is_mutable(&self) -> bool {
        self.is_mutable
    }

    pub fn has_definition(&self) -> bool {
        self.has_definition
    }

    pub fn allocation_index(&self) -> u32 {
        self.allocation_index
    }

    pub(crate) fn definition_bytes(&self) -> Option<&[u8]> {
        self.memory
            .map(|ptr| unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.size as usize) })
    }
}

/// an in-memory IR module: globals, functions and their instruction
/// storage.
pub struct Module {
    name: String,
    debug_path: Option<String>,
    pub(crate) globals: Vec<Global>,
    pub(crate) functions: Vec<Function>,
    /// builtins referenced by this module's code, `call_builtin`
    /// offsets are anchored to slot zero of this registry
    pub(crate) builtins: Vec<&'static Builtin>,
    /// flat side table, kept sorted by (function index, inst index)
    pub(crate) inst_debug_locations: Vec<InstDebugLocation>,
    pub(crate) arena: Arena,
}

impl Module {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            debug_path: None,
            globals: Vec::new(),
            functions: Vec::new(),
            builtins: Vec::new(),
            inst_debug_locations: Vec::new(),
            arena: Arena::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_debug_path(&mut self, path: &str) {
        self.debug_path = Some(path.to_owned());
    }

    pub fn debug_path(&self) -> Option<&str> {
        self.debug_path.as_deref()
    }

    //
    // globals
    //

    pub fn add_global(&mut self, is_mutable: bool) -> GlobalId {
        let allocation_index = self.globals.len() as u32;
        self.globals.push(Global {
            memory: None,
            size: 0,
            allocation_index,
            alignment: 1,
            is_mutable,
            has_definition: false,
            debug_name: None,
        });
        GlobalId(allocation_index)
    }

    /// define the contents of a global, `None` means zero-initialized.
    /// the bytes are copied into the module arena.
    pub fn define_data_global(&mut self, global: GlobalId, layout: Layout, data: Option<&[u8]>) {
        let memory = data.map(|bytes| {
            debug_assert_eq!(bytes.len() as u32, layout.size);
            self.arena.alloc_slice_copy(bytes, layout.alignment as usize)
        });

        let global = &mut self.globals[global.0 as usize];
        debug_assert!(!global.has_definition, "global defined twice");
        global.memory = memory;
        global.size = layout.size;
        global.alignment = layout.alignment as u16;
        global.has_definition = true;
    }

    /// declare a global whose backing memory the host provides at
    /// process start
    pub fn add_global_native_data(&mut self, is_mutable: bool) -> GlobalId {
        self.add_global(is_mutable)
    }

    pub fn set_global_debug_name(&mut self, global: GlobalId, name: &str) {
        self.globals[global.0 as usize].debug_name = Some(name.to_owned());
    }

    pub fn global(&self, global: GlobalId) -> &Global {
        &self.globals[global.0 as usize]
    }

    pub fn globals_count(&self) -> usize {
        self.globals.len()
    }

    /// find a read-only global with the same contents or define a new
    /// one, so repeated literals share storage
    pub fn intern_data_literal(&mut self, bytes: &[u8]) -> GlobalId {
        for global in &self.globals {
            if global.is_mutable {
                continue;
            }
            if global.definition_bytes() == Some(bytes) {
                return GlobalId(global.allocation_index);
            }
        }

        let global = self.add_global(false);
        self.define_data_global(
            global,
            Layout::new(bytes.len() as u32, Layout::of_value().alignment),
            Some(bytes),
        );
        global
    }

    /// a data literal holding the string and its NUL terminator
    pub fn intern_string_literal(&mut self, string: &str) -> GlobalId {
        let mut bytes = Vec::with_capacity(string.len() + 1);
        bytes.extend_from_slice(string.as_bytes());
        bytes.push(0);
        self.intern_data_literal(&bytes)
    }

    //
    // functions
    //

    pub fn add_function(&mut self, name: &str, signature: Signature) -> FunctionId {
        let function_index = self.functions.len() as u32;
        self.functions
            .push(Function::new(name, signature, function_index));
        FunctionId(function_index)
    }

    pub fn export_function(&mut self, function: FunctionId) {
        self.functions[function.0 as usize].exported = true;
    }

    pub fn function(&self, function: FunctionId) -> &Function {
        &self.functions[function.0 as usize]
    }

    pub fn functions(&self) -> impl Iterator<Item = &Function> {
        self.functions.iter()
    }

    pub fn find_function_by_name(&self, name: &str) -> Option<FunctionId> {
        self.functions
            .iter()
            .find(|function| function.name == name)
            .map(|function| FunctionId(function.function_index))
    }

    /// the function whose instruction array contains the pointer,
    /// together with the instruction index
    pub fn find_function_of_instruction(&self, ip: *const Inst) -> Option<(&Function, usize)> {
        self.functions.iter().find_map(|function| {
            function
                .inst_index_of(ip)
                .map(|inst_index| (function, inst_index))
        })
    }

    //
    // builtins
    //

    /// the registry slot of the builtin, interned by identity
    pub(crate) fn intern_builtin(&mut self, builtin: &'static Builtin) -> u32 {
        if let Some(index) = self
            .builtins
            .iter()
            .position(|known| std::ptr::eq(*known, builtin))
        {
            return index as u32;
        }
        self.builtins.push(builtin);
        (self.builtins.len() - 1) as u32
    }

    //
    // debug locations
    //

    pub(crate) fn add_debug_locations(&mut self, locations: &[InstDebugLocation]) {
        for location in locations {
            let key = (location.function_index, location.inst_index);
            let at = self
                .inst_debug_locations
                .partition_point(|entry| (entry.function_index, entry.inst_index) <= key);
            self.inst_debug_locations.insert(at, *location);
        }
    }

    /// binary search of the side table, a missing entry is the null
    /// location
    pub fn debug_location_of(&self, function_index: u32, inst_index: u32) -> Option<DebugLocation> {
        let key = (function_index, inst_index);
        let at = self
            .inst_debug_locations
            .partition_point(|entry| (entry.function_index, entry.inst_index) <= key);
        if at == 0 {
            return None;
        }

        let entry = &self.inst_debug_locations[at - 1];
        if entry.function_index != function_index {
            return None;
        }
        Some(entry.location)
    }

    //
    // chunks
    //

    pub fn create_chunk(&self) -> Chunk {
        Chunk::new()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use stavm_types::{Layout, Signature};

    use crate::module::{DebugLocation, InstDebugLocation, Module};

    #[test]
    fn test_module_functions() {
        let mut module = Module::new("test");
        let foo = module.add_function("foo", Signature::new(1, 1));
        let bar = module.add_function("bar", Signature::new(0, 2));
        module.export_function(bar);

        assert_eq!(module.find_function_by_name("foo"), Some(foo));
        assert_eq!(module.find_function_by_name("bar"), Some(bar));
        assert_eq!(module.find_function_by_name("baz"), None);

        assert_eq!(module.function(foo).function_index(), 0);
        assert_eq!(module.function(bar).function_index(), 1);
        assert!(!module.function(foo).is_exported());
        assert!(module.function(bar).is_exported());
        assert!(!module.function(foo).has_definition());
    }

    #[test]
    fn test_module_globals() {
        let mut module = Module::new("test");
        let zeroed = module.add_global(true);
        module.define_data_global(zeroed, Layout::new(16, 8), None);
        let data = module.add_global(false);
        module.define_data_global(data, Layout::new(4, 4), Some(&[1, 2, 3, 4]));
        let native = module.add_global_native_data(true);

        assert_eq!(module.global(zeroed).size(), 16);
        assert!(module.global(zeroed).has_definition());
        assert_eq!(module.global(data).definition_bytes(), Some(&[1u8, 2, 3, 4][..]));
        assert!(!module.global(native).has_definition());
        assert_eq!(module.global(native).allocation_index(), 2);
    }

    #[test]
    fn test_data_literal_interning() {
        let mut module = Module::new("test");
        let hello = module.intern_string_literal("hello");
        let again = module.intern_string_literal("hello");
        let other = module.intern_string_literal("world");

        assert_eq!(hello, again);
        assert_ne!(hello, other);
        assert_eq!(
            module.global(hello).definition_bytes(),
            Some(&b"hello\0"[..])
        );
    }

    #[test]
    fn test_debug_location_lookup() {
        let mut module = Module::new("test");
        module.add_debug_locations(&[
            InstDebugLocation {
                function_index: 0,
                inst_index: 1,
                location: DebugLocation { line: 10, column: 1 },
            },
            InstDebugLocation {
                function_index: 0,
                inst_index: 5,
                location: DebugLocation { line: 20, column: 1 },
            },
            InstDebugLocation {
                function_index: 1,
                inst_index: 0,
                location: DebugLocation { line: 99, column: 7 },
            },
        ]);

        // before the first recorded instruction there is no location
        assert_eq!(module.debug_location_of(0, 0), None);
        // an instruction inherits the last recorded location before it
        assert_eq!(
            module.debug_location_of(0, 3),
            Some(DebugLocation { line: 10, column: 1 })
        );
        assert_eq!(
            module.debug_location_of(0, 5),
            Some(DebugLocation { line: 20, column: 1 })
        );
        // lookups never leak into another function
        assert_eq!(
            module.debug_location_of(1, 4),
            Some(DebugLocation { line: 99, column: 7 })
        );
        assert_eq!(module.debug_location_of(2, 0), None);
    }
}
