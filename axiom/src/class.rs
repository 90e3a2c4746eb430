/// Struct/class definitions and their runtime instances, plus the closure
/// and upvalue machinery the interpreter uses to capture enclosing locals.
///
/// `StructDef`/`ClassDef` are script-level blueprints produced by the (out
/// of scope) compiler and loaded verbatim from a bytecode file; instances
/// are heap objects the collector traces like any other `Value`.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use dashmap::DashMap;

use crate::code::Function;
use crate::gc::{Gc, Trace};
use crate::native::{NativeClassDef, NativeFn};
use crate::strings::StrRef;
use crate::value::Value;

#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: StrRef,
    pub default: Value,
}

#[derive(Debug)]
pub struct StructDef {
    pub name: StrRef,
    pub fields: Vec<FieldDef>,
}

pub struct StructInstance {
    pub def: Rc<StructDef>,
    pub fields: Vec<Value>,
}

impl Trace for StructInstance {
    fn trace(&self, worklist: &mut Vec<Value>) {
        worklist.extend(self.fields.iter().cloned());
    }
}

#[derive(Debug)]
pub struct ClassDef {
    pub name: StrRef,
    pub parent: Option<Rc<ClassDef>>,
    /// A script class may additionally extend a host-registered native
    /// class; method/property lookup falls back to this chain only after
    /// the script parent chain is exhausted.
    pub native_superclass: Option<Rc<NativeClassDef>>,
    /// own fields only — resolving the full inherited set walks `parent`
    pub fields: Vec<FieldDef>,
    pub methods: DashMap<StrRef, u32>,
}

impl ClassDef {
    /// Look up a method by name, walking the parent chain. Mirrors the
    /// vtable-style dispatch used for script-defined classes: own methods
    /// shadow inherited ones of the same name.
    pub fn resolve_method(&self, name: &str) -> Option<u32> {
        if let Some(idx) = self.methods.iter().find(|e| e.key().as_str() == name) {
            return Some(*idx.value());
        }
        self.parent.as_ref().and_then(|p| p.resolve_method(name))
    }

    /// Walk only the native superclass chain for a method, after the
    /// script-method chain above has come up empty.
    pub fn resolve_native_method(&self, name: &str) -> Option<NativeFn> {
        self.native_superclass.as_ref().and_then(|n| n.resolve_method(name))
    }

    pub fn resolve_native_property(&self, name: &str) -> Option<NativeFn> {
        self.native_superclass.as_ref().and_then(|n| n.resolve_property(name))
    }

    pub fn resolve_native_setter(&self, name: &str) -> Option<NativeFn> {
        self.native_superclass.as_ref().and_then(|n| n.resolve_setter(name))
    }

    pub fn has_init(&self) -> bool {
        self.resolve_method("init").is_some()
    }

    /// All fields this class contributes, parent-first. Used to build the
    /// default field vector for a new instance: the Open Question on
    /// field-default inheritance is resolved by this ordering — each class
    /// in the chain contributes its defaults in root-to-leaf order, so a
    /// subclass's constructor body runs after every inherited default is
    /// already in place.
    pub fn inherited_fields(&self) -> Vec<FieldDef> {
        let mut out = match &self.parent {
            Some(p) => p.inherited_fields(),
            None => Vec::new(),
        };
        out.extend(self.fields.iter().cloned());
        out
    }
}

pub struct ClassInstance {
    pub def: Rc<ClassDef>,
    pub fields: DashMap<StrRef, Value>,
    /// Opaque payload for a native superclass, if any. The native
    /// destructor on `def.native_superclass` runs against this during GC
    /// reclamation iff it is `Some`.
    pub native_userdata: RefCell<Option<Box<dyn Any>>>,
}

impl ClassInstance {
    pub fn new(def: Rc<ClassDef>) -> Self {
        let fields = DashMap::new();
        for f in def.inherited_fields() {
            fields.insert(f.name, f.default);
        }
        ClassInstance { def, fields, native_userdata: RefCell::new(None) }
    }

    pub fn get_field(&self, name: &str) -> Option<Value> {
        self.fields.iter().find(|e| e.key().as_str() == name).map(|e| e.value().clone())
    }

    pub fn set_field(&self, name: StrRef, value: Value) {
        self.fields.insert(name, value);
    }

    pub fn resolve_method(&self, name: &str) -> Option<u32> {
        self.def.resolve_method(name)
    }
}

impl Trace for ClassInstance {
    fn trace(&self, worklist: &mut Vec<Value>) {
        for entry in self.fields.iter() {
            worklist.push(entry.value().clone());
        }
    }

    fn on_reclaim(&self) {
        if self.native_userdata.borrow().is_some() {
            if let Some(def) = &self.def.native_superclass {
                if let Some(dtor) = def.destructor {
                    let mut slot = self.native_userdata.borrow_mut();
                    if let Some(payload) = slot.as_mut() {
                        dtor(payload);
                    }
                }
            }
        }
    }
}

/// An open upvalue points at a live slot on its owning process's operand
/// stack; once the frame that slot belongs to returns, the value is copied
/// in and the upvalue is "closed". Closures only ever capture locals of
/// their own process, so a plain absolute stack index is enough — no
/// cross-process addressing is needed.
pub enum Upvalue {
    Open { stack_slot: usize },
    Closed(Value),
}

impl Trace for Upvalue {
    fn trace(&self, worklist: &mut Vec<Value>) {
        if let Upvalue::Closed(v) = self {
            worklist.push(v.clone());
        }
    }
}

pub struct Closure {
    pub function: Rc<Function>,
    pub upvalues: Vec<Gc<Upvalue>>,
}

impl Trace for Closure {
    fn trace(&self, worklist: &mut Vec<Value>) {
        for uv in &self.upvalues {
            worklist.push(Value::Upvalue(uv.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strings::StringPool;

    fn def_with_field(pool: &mut StringPool, name: &str, default: Value) -> FieldDef {
        FieldDef { name: pool.intern(name), default }
    }

    #[test]
    fn inherited_fields_are_parent_first() {
        let mut pool = StringPool::new();
        let base = Rc::new(ClassDef {
            name: pool.intern("Base"),
            parent: None,
            native_superclass: None,
            fields: vec![def_with_field(&mut pool, "hp", Value::Int(100))],
            methods: DashMap::new(),
        });
        let derived = Rc::new(ClassDef {
            name: pool.intern("Derived"),
            parent: Some(base),
            native_superclass: None,
            fields: vec![def_with_field(&mut pool, "mana", Value::Int(50))],
            methods: DashMap::new(),
        });
        let names: Vec<String> =
            derived.inherited_fields().iter().map(|f| f.name.as_str().to_string()).collect();
        assert_eq!(names, vec!["hp", "mana"]);
    }

    #[test]
    fn instance_gets_every_ancestor_default_before_init_runs() {
        let mut pool = StringPool::new();
        let base = Rc::new(ClassDef {
            name: pool.intern("Base"),
            parent: None,
            native_superclass: None,
            fields: vec![def_with_field(&mut pool, "hp", Value::Int(100))],
            methods: DashMap::new(),
        });
        let derived = Rc::new(ClassDef {
            name: pool.intern("Derived"),
            parent: Some(base),
            native_superclass: None,
            fields: vec![def_with_field(&mut pool, "mana", Value::Int(50))],
            methods: DashMap::new(),
        });
        let inst = ClassInstance::new(derived);
        assert_eq!(inst.get_field("hp"), Some(Value::Int(100)));
        assert_eq!(inst.get_field("mana"), Some(Value::Int(50)));
    }

    #[test]
    fn method_resolution_walks_parent_chain() {
        let mut pool = StringPool::new();
        let base_methods = DashMap::new();
        base_methods.insert(pool.intern("speak"), 7u32);
        let base = Rc::new(ClassDef {
            name: pool.intern("Base"),
            parent: None,
            native_superclass: None,
            fields: vec![],
            methods: base_methods,
        });
        let derived = Rc::new(ClassDef {
            name: pool.intern("Derived"),
            parent: Some(base),
            native_superclass: None,
            fields: vec![],
            methods: DashMap::new(),
        });
        assert_eq!(derived.resolve_method("speak"), Some(7));
        assert_eq!(derived.resolve_method("missing"), None);
    }
}
