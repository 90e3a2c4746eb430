/// Native binding registry — the surface host code uses to expose
/// functions, classes, structs, processes, and modules to scripts.
/// Everything in this file is infrastructure only: no concrete bindings
/// (graphics, physics, input, audio, UI, JSON, regex, OS, time, math) live
/// here, since those are host/stdlib concerns out of scope for this core.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::errors::NativeError;
use crate::gc::Trace;
use crate::interpreter::Interpreter;
use crate::strings::StrRef;
use crate::value::Value;

pub type NativeFn = fn(&mut Interpreter, &[Value]) -> Result<Value, NativeError>;

/// Invoked on a native class instance's opaque payload just before the GC
/// (or an explicit host release) reclaims it. Only runs when the instance
/// owns its userdata.
pub type NativeClassDestructor = fn(&mut Box<dyn Any>);

/// Invoked on a native struct instance's field values just before reclaim.
pub type NativeStructDestructor = fn(&mut Vec<Value>);

pub struct NativeClassDef {
    pub name: StrRef,
    pub methods: HashMap<StrRef, NativeFn>,
    pub properties: HashMap<StrRef, NativeFn>,
    pub setters: HashMap<StrRef, NativeFn>,
    pub constructor: Option<NativeFn>,
    pub destructor: Option<NativeClassDestructor>,
    /// Instances of this class are never linked into the GC's object list;
    /// they live until explicitly destroyed by their owner.
    pub persistent: bool,
}

impl NativeClassDef {
    pub fn new(name: StrRef) -> Self {
        NativeClassDef {
            name,
            methods: HashMap::new(),
            properties: HashMap::new(),
            setters: HashMap::new(),
            constructor: None,
            destructor: None,
            persistent: false,
        }
    }

    pub fn resolve_method(&self, name: &str) -> Option<NativeFn> {
        self.methods.iter().find(|(k, _)| k.as_str() == name).map(|(_, f)| *f)
    }

    pub fn resolve_property(&self, name: &str) -> Option<NativeFn> {
        self.properties.iter().find(|(k, _)| k.as_str() == name).map(|(_, f)| *f)
    }

    pub fn resolve_setter(&self, name: &str) -> Option<NativeFn> {
        self.setters.iter().find(|(k, _)| k.as_str() == name).map(|(_, f)| *f)
    }
}

/// An instance of a native class. The native payload is host-defined and
/// opaque to the GC; only `Value`s explicitly handed back through method
/// calls participate in tracing.
pub struct NativeClassInstance {
    pub def: Rc<NativeClassDef>,
    pub data: RefCell<Box<dyn Any>>,
    pub persistent: bool,
    /// Whether this instance's destructor should run on reclaim. An
    /// instance that merely aliases another object's payload does not own
    /// it and must not destroy it twice.
    pub owns_userdata: bool,
}

impl NativeClassInstance {
    pub fn new(def: Rc<NativeClassDef>, data: Box<dyn Any>, persistent: bool, owns_userdata: bool) -> Self {
        NativeClassInstance { def, data: RefCell::new(data), persistent, owns_userdata }
    }
}

impl Trace for NativeClassInstance {
    fn trace(&self, _worklist: &mut Vec<Value>) {
        // opaque native payload; host bindings that stash Values inside
        // must expose their own root set instead of relying on this trace
    }

    fn on_reclaim(&self) {
        if self.owns_userdata {
            if let Some(dtor) = self.def.destructor {
                dtor(&mut self.data.borrow_mut());
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeFieldType {
    Int,
    UInt,
    Float,
    Double,
    Bool,
    Byte,
}

#[derive(Debug, Clone)]
pub struct NativeFieldDef {
    pub name: StrRef,
    pub ty: NativeFieldType,
    pub offset: usize,
    pub read_only: bool,
}

pub struct NativeStructDef {
    pub name: StrRef,
    pub size: usize,
    pub persistent: bool,
    pub fields: Vec<NativeFieldDef>,
    pub constructor: Option<NativeFn>,
    pub destructor: Option<NativeStructDestructor>,
}

impl NativeStructDef {
    pub fn new(name: StrRef) -> Self {
        NativeStructDef {
            name,
            size: 0,
            persistent: false,
            fields: Vec::new(),
            constructor: None,
            destructor: None,
        }
    }

    pub fn field(&self, name: &str) -> Option<(usize, &NativeFieldDef)> {
        self.fields.iter().enumerate().find(|(_, f)| f.name.as_str() == name)
    }
}

pub struct NativeStructInstance {
    pub def: Rc<NativeStructDef>,
    pub values: Vec<Value>,
    pub persistent: bool,
}

impl Trace for NativeStructInstance {
    fn trace(&self, worklist: &mut Vec<Value>) {
        worklist.extend(self.values.iter().cloned());
    }

    fn on_reclaim(&self) {
        if let Some(dtor) = self.def.destructor {
            let mut values = self.values.clone();
            dtor(&mut values);
        }
    }
}

/// A native process definition: a host callback invoked to spawn a process
/// that runs native code rather than a script closure.
pub struct NativeProcessDef {
    pub name: StrRef,
    pub spawn: NativeFn,
    pub arity: u8,
}

/// A native module: its own function table and constant pool, addressed
/// from bytecode via a packed `Value::ModuleReference(module_id, func_id)`.
pub struct ModuleDef {
    pub name: StrRef,
    pub functions: Vec<(StrRef, NativeFn)>,
    pub constants: Vec<(StrRef, Value)>,
}

impl ModuleDef {
    pub fn function_index(&self, name: &str) -> Option<u16> {
        self.functions.iter().position(|(n, _)| n.as_str() == name).map(|i| i as u16)
    }

    pub fn call(
        &self,
        func_id: u16,
        vm: &mut Interpreter,
        args: &[Value],
    ) -> Result<Value, NativeError> {
        let (_, f) = self
            .functions
            .get(func_id as usize)
            .ok_or_else(|| NativeError::new(format!("no such module function index {func_id}")))?;
        f(vm, args)
    }
}

pub struct ModuleBuilder {
    name: StrRef,
    functions: Vec<(StrRef, NativeFn)>,
    constants: Vec<(StrRef, Value)>,
}

impl ModuleBuilder {
    pub fn new(name: StrRef) -> Self {
        ModuleBuilder { name, functions: Vec::new(), constants: Vec::new() }
    }

    pub fn function(mut self, name: StrRef, f: NativeFn) -> Self {
        self.functions.push((name, f));
        self
    }

    pub fn constant(mut self, name: StrRef, value: Value) -> Self {
        self.constants.push((name, value));
        self
    }

    pub fn build(self) -> ModuleDef {
        ModuleDef { name: self.name, functions: self.functions, constants: self.constants }
    }
}

/// Function pointers the host wires up to receive scheduler lifecycle
/// events. Mirrors `NativeRegistry`'s registration-by-assignment style
/// rather than a trait object, since a host only ever needs one of each.
#[derive(Default, Clone, Copy)]
pub struct HostHooks {
    /// Fired once, explicitly, after the host finishes wiring up bindings
    /// and hooks (see `Interpreter::fire_on_create`).
    pub on_create: Option<fn(&mut Interpreter)>,
    /// Fired the first time a process suspends (its `initialized` flag
    /// transitions from false to true).
    pub on_start: Option<fn(&mut Interpreter, u32)>,
    /// Fired for every process, every tick, right after it runs.
    pub on_update: Option<fn(&mut Interpreter, u32, f64)>,
    /// Fired from the host's render pass via `Interpreter::render`.
    pub on_render: Option<fn(&mut Interpreter)>,
    /// Fired for every process entering the clean-up list, after the
    /// per-process pass, with that process's exit code.
    pub on_destroy: Option<fn(&mut Interpreter, u32, i32)>,
}

/// Process-wide registry of native classes/structs/processes/modules/free
/// functions, populated by host code before any script runs.
#[derive(Default)]
pub struct NativeRegistry {
    pub classes: HashMap<String, Rc<NativeClassDef>>,
    pub structs: HashMap<String, Rc<NativeStructDef>>,
    pub native_processes: Vec<Rc<NativeProcessDef>>,
    pub modules: Vec<Rc<ModuleDef>>,
    pub functions: HashMap<String, NativeFn>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_class(&mut self, def: NativeClassDef) {
        self.classes.insert(def.name.as_str().to_string(), Rc::new(def));
    }

    pub fn register_struct(&mut self, def: NativeStructDef) {
        self.structs.insert(def.name.as_str().to_string(), Rc::new(def));
    }

    pub fn register_native_process(&mut self, name: StrRef, spawn: NativeFn, arity: u8) -> u32 {
        self.native_processes.push(Rc::new(NativeProcessDef { name, spawn, arity }));
        (self.native_processes.len() - 1) as u32
    }

    pub fn register_module(&mut self, def: ModuleDef) -> u16 {
        self.modules.push(Rc::new(def));
        (self.modules.len() - 1) as u16
    }

    pub fn register_function(&mut self, name: &str, f: NativeFn) {
        self.functions.insert(name.to_string(), f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strings::StringPool;

    fn dummy(_vm: &mut Interpreter, _args: &[Value]) -> Result<Value, NativeError> {
        Ok(Value::Int(42))
    }

    #[test]
    fn module_builder_resolves_function_index() {
        let mut pool = StringPool::new();
        let m = ModuleBuilder::new(pool.intern("math"))
            .function(pool.intern("answer"), dummy)
            .build();
        assert_eq!(m.function_index("answer"), Some(0));
        assert_eq!(m.function_index("missing"), None);
    }

    #[test]
    fn registry_assigns_increasing_module_ids() {
        let mut pool = StringPool::new();
        let mut reg = NativeRegistry::new();
        let a = reg.register_module(ModuleBuilder::new(pool.intern("a")).build());
        let b = reg.register_module(ModuleBuilder::new(pool.intern("b")).build());
        assert_eq!(a, 0);
        assert_eq!(b, 1);
    }

    #[test]
    fn native_class_def_resolves_methods_by_name_not_by_pointer() {
        let mut pool = StringPool::new();
        let mut def = NativeClassDef::new(pool.intern("Vec2"));
        def.methods.insert(pool.intern("length"), dummy);
        assert!(def.resolve_method("length").is_some());
        assert!(def.resolve_method("missing").is_none());
    }

    #[test]
    fn registry_assigns_increasing_native_process_ids() {
        let mut pool = StringPool::new();
        let mut reg = NativeRegistry::new();
        let a = reg.register_native_process(pool.intern("ticker"), dummy, 0);
        let b = reg.register_native_process(pool.intern("timer"), dummy, 1);
        assert_eq!(a, 0);
        assert_eq!(b, 1);
    }
}
