/// Tracing garbage collector.
///
/// ARCHITECTURE:
///   Tri-color mark-sweep over every object the VM has ever allocated.
///   Objects are not generational and never move — `Gc<T>` handles stay
///   valid for the lifetime of the object, so native code can hold one
///   across an allocation without pinning.
///
///   Mark phase: walk the root set (globals, every live process's operand
///   stack / call-frame closures / gosub targets, the open-upvalue list),
///   pushing each reachable heap value onto a gray worklist, then drain the
///   worklist, blackening each object by tracing its own children.
///
///   Sweep phase: walk every object this collector has ever allocated;
///   anything left white is unreachable and is dropped, anything gray/black
///   has its mark cleared for the next cycle.
///
/// GC runs are triggered by allocation pressure (`should_collect`), never by
/// a timer or explicit script call; reentrant collection during a collect is
/// guarded against.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::rc::Rc;

use crate::value::{ArrayInstance, Buffer, MapInstance, Value};

pub const MIN_GC_THRESHOLD: usize = 512 * 1024;
pub const MAX_GC_THRESHOLD: usize = 512 * 1024 * 1024;
pub const GC_GROWTH_FACTOR: f64 = 2.0;
const INITIAL_GC_THRESHOLD: usize = 1024 * 1024;

/// Every heap type traces its own children onto the gray worklist.
pub trait Trace {
    fn trace(&self, worklist: &mut Vec<Value>);

    /// Called once, right before sweep drops an unreachable object. Most
    /// types have nothing to clean up; native objects that own a
    /// host-allocated payload override this to run their destructor.
    fn on_reclaim(&self) {}
}

impl Trace for ArrayInstance {
    fn trace(&self, worklist: &mut Vec<Value>) {
        worklist.extend(self.iter().cloned());
    }
}

impl Trace for MapInstance {
    fn trace(&self, worklist: &mut Vec<Value>) {
        for entry in self.table.iter() {
            worklist.push(entry.value().clone());
        }
    }
}

impl Trace for Buffer {
    fn trace(&self, _worklist: &mut Vec<Value>) {
        // raw bytes only, nothing to trace
    }
}

struct GcBox<T: ?Sized> {
    marked: Cell<bool>,
    value: RefCell<T>,
}

/// A handle to a heap object. Cheap to copy (one `Rc` bump); two handles
/// compare equal only when they point at the same allocation.
pub struct Gc<T>(Rc<GcBox<T>>);

impl<T> Gc<T> {
    fn new(value: T) -> Self {
        Gc(Rc::new(GcBox { marked: Cell::new(false), value: RefCell::new(value) }))
    }

    pub fn borrow(&self) -> Ref<'_, T> {
        self.0.value.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, T> {
        self.0.value.borrow_mut()
    }

    pub fn ptr_eq(&self, other: &Gc<T>) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn is_marked(&self) -> bool {
        self.0.marked.get()
    }

    fn mark(&self) {
        self.0.marked.set(true);
    }

    fn unmark(&self) {
        self.0.marked.set(false);
    }
}

impl<T> Clone for Gc<T> {
    fn clone(&self) -> Self {
        Gc(self.0.clone())
    }
}

trait HeapEntry {
    fn is_marked(&self) -> bool;
    fn clear_mark(&self);
    fn approx_size(&self) -> usize;
    fn notify_reclaim(&self);
}

struct HeapSlot<T> {
    handle: Gc<T>,
    size: usize,
}

impl<T: Trace> HeapEntry for HeapSlot<T> {
    fn is_marked(&self) -> bool {
        self.handle.is_marked()
    }
    fn clear_mark(&self) {
        self.handle.unmark();
    }
    fn approx_size(&self) -> usize {
        self.size
    }
    fn notify_reclaim(&self) {
        self.handle.borrow().on_reclaim();
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GcStats {
    pub collections: u64,
    pub objects_live: usize,
    pub bytes_allocated: usize,
    pub next_threshold: usize,
}

/// Owns every heap allocation the VM has made and decides when to collect.
pub struct Heap {
    objects: Vec<Box<dyn HeapEntry>>,
    total_allocated: usize,
    next_gc: usize,
    gc_in_progress: bool,
    verbose: bool,
    collections: u64,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            objects: Vec::new(),
            total_allocated: 0,
            next_gc: INITIAL_GC_THRESHOLD,
            gc_in_progress: false,
            verbose: false,
            collections: 0,
        }
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn alloc<T: Trace + 'static>(&mut self, value: T) -> Gc<T> {
        let size = std::mem::size_of::<T>().max(1);
        let handle = Gc::new(value);
        self.total_allocated += size;
        self.objects.push(Box::new(HeapSlot { handle: handle.clone(), size }));
        handle
    }

    /// Allocate an object that is never linked into the GC's object list —
    /// it is never marked, swept, or counted against `total_allocated`, and
    /// lives until its owner explicitly drops the last handle. Used for
    /// native class/struct instances created with their def's `persistent`
    /// flag set.
    pub fn alloc_persistent<T: Trace + 'static>(&mut self, value: T) -> Gc<T> {
        Gc::new(value)
    }

    pub fn should_collect(&self) -> bool {
        !self.gc_in_progress && self.total_allocated > self.next_gc
    }

    pub fn stats(&self) -> GcStats {
        GcStats {
            collections: self.collections,
            objects_live: self.objects.len(),
            bytes_allocated: self.total_allocated,
            next_threshold: self.next_gc,
        }
    }

    /// Run a full mark-sweep cycle. `roots` must enumerate every `Value`
    /// reachable from outside the heap at this instant: globals, every
    /// non-dead process's operand stack/frames/privates, and the
    /// open-upvalue chain.
    pub fn collect(&mut self, roots: Vec<Value>) -> usize {
        if self.gc_in_progress {
            return 0;
        }
        self.gc_in_progress = true;

        let mut worklist = roots;
        while let Some(value) = worklist.pop() {
            mark_value(&value, &mut worklist);
        }

        let before = self.objects.len();
        self.objects.retain(|obj| {
            if obj.is_marked() {
                true
            } else {
                obj.notify_reclaim();
                false
            }
        });
        let freed = before - self.objects.len();
        for obj in &self.objects {
            obj.clear_mark();
        }

        self.total_allocated = self.objects.iter().map(|o| o.approx_size()).sum();
        self.next_gc = ((self.total_allocated as f64) * GC_GROWTH_FACTOR) as usize;
        self.next_gc = self.next_gc.clamp(MIN_GC_THRESHOLD, MAX_GC_THRESHOLD);
        self.collections += 1;

        if self.verbose {
            eprintln!(
                "[gc] collection {}: freed {freed} objects, {} live, next at {} bytes",
                self.collections,
                self.objects.len(),
                self.next_gc
            );
        }

        self.gc_in_progress = false;
        freed
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

/// Mark a single value: if it names a heap object and that object isn't
/// already black, mark it and push its children onto the worklist.
pub fn mark_value(value: &Value, worklist: &mut Vec<Value>) {
    match value {
        Value::Array(g) => mark_and_trace(g, worklist),
        Value::Map(g) => mark_and_trace(g, worklist),
        Value::Buffer(g) => mark_and_trace(g, worklist),
        Value::StructInstance(g) => mark_and_trace(g, worklist),
        Value::ClassInstance(g) => mark_and_trace(g, worklist),
        Value::NativeClassInstance(g) => mark_and_trace(g, worklist),
        Value::NativeStructInstance(g) => mark_and_trace(g, worklist),
        Value::Closure(g) => mark_and_trace(g, worklist),
        Value::Upvalue(g) => mark_and_trace(g, worklist),
        _ => {}
    }
}

fn mark_and_trace<T: Trace>(handle: &Gc<T>, worklist: &mut Vec<Value>) {
    if handle.is_marked() {
        return;
    }
    handle.mark();
    handle.borrow().trace(worklist);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_array_is_collected() {
        let mut heap = Heap::new();
        let arr = heap.alloc::<ArrayInstance>(vec![Value::Int(1), Value::Int(2)]);
        drop(arr);
        let freed = heap.collect(vec![]);
        assert_eq!(freed, 1);
        assert_eq!(heap.stats().objects_live, 0);
    }

    #[test]
    fn reachable_array_survives() {
        let mut heap = Heap::new();
        let arr = heap.alloc::<ArrayInstance>(vec![Value::Int(1)]);
        let root = Value::Array(arr);
        let freed = heap.collect(vec![root.clone()]);
        assert_eq!(freed, 0);
        assert_eq!(heap.stats().objects_live, 1);
    }

    #[test]
    fn nested_array_keeps_child_alive_transitively() {
        let mut heap = Heap::new();
        let inner = heap.alloc::<ArrayInstance>(vec![Value::Int(7)]);
        let outer = heap.alloc::<ArrayInstance>(vec![Value::Array(inner)]);
        let freed = heap.collect(vec![Value::Array(outer)]);
        assert_eq!(freed, 0);
        assert_eq!(heap.stats().objects_live, 2);
    }

    #[test]
    fn threshold_grows_and_is_clamped() {
        let mut heap = Heap::new();
        heap.total_allocated = MAX_GC_THRESHOLD * 10;
        heap.collect(vec![]);
        assert!(heap.next_gc <= MAX_GC_THRESHOLD && heap.next_gc >= MIN_GC_THRESHOLD);
    }
}
