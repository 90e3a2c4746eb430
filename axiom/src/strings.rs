/// Content-addressed string interning. Every `Value::String` is a handle
/// into this pool rather than an owned `String`: two strings with the same
/// bytes always resolve to the same handle, so equality and hashing reduce
/// to a pointer/index comparison instead of a byte scan.
///
/// Interned strings are owned by the pool for the lifetime of the VM and
/// are never visited by the GC's mark/sweep pass (they're not `GCObject`s).

use std::collections::HashMap;
use std::rc::Rc;

#[derive(Clone)]
pub struct StrRef(Rc<str>);

impl StrRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn ptr_eq(&self, other: &StrRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for StrRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl std::hash::Hash for StrRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.0) as *const () as usize).hash(state)
    }
}

impl PartialEq for StrRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}
impl Eq for StrRef {}

pub struct StringPool {
    table: HashMap<Rc<str>, ()>,
}

impl StringPool {
    pub fn new() -> Self {
        StringPool { table: HashMap::new() }
    }

    /// Return the canonical handle for `s`, allocating a new entry only if
    /// no equal string has been interned before.
    pub fn intern(&mut self, s: &str) -> StrRef {
        if let Some((existing, _)) = self.table.get_key_value(s) {
            return StrRef(existing.clone());
        }
        let rc: Rc<str> = Rc::from(s);
        self.table.insert(rc.clone(), ());
        StrRef(rc)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Drop interned strings with no remaining external reference. Called
    /// opportunistically by the collector at the end of a GC cycle; never
    /// invalidates a `StrRef` still held by a `Value` on some live stack,
    /// since those hold their own `Rc` clone.
    pub fn collect_unreferenced(&mut self) {
        self.table.retain(|rc, _| Rc::strong_count(rc) > 1);
    }
}

impl Default for StringPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_same_content_yields_pointer_equal_handles() {
        let mut pool = StringPool::new();
        let a = pool.intern("hello");
        let b = pool.intern("hello");
        assert!(a.ptr_eq(&b));
    }

    #[test]
    fn distinct_content_yields_distinct_handles() {
        let mut pool = StringPool::new();
        let a = pool.intern("hello");
        let b = pool.intern("world");
        assert!(!a.ptr_eq(&b));
    }

    #[test]
    fn collect_unreferenced_drops_orphans_but_keeps_held() {
        let mut pool = StringPool::new();
        let held = pool.intern("kept");
        pool.intern("orphan");
        assert_eq!(pool.len(), 2);
        pool.collect_unreferenced();
        assert_eq!(pool.len(), 1);
        assert_eq!(held.as_str(), "kept");
    }
}
