//! The object heap: allocation, string interning, and the mark-and-sweep
//! garbage collector.
//!
//! Objects live in a slab of slots addressed by [`ObjRef`] handles; freed
//! slots are recycled through a free list. Independently of slot storage,
//! every live object is threaded onto an intrusive list through its header
//! `next` field; that list is what the sweep phase walks.
//!
//! Collection is tri-color: marking a root sets its mark bit and pushes it
//! onto the gray worklist (a plain `Vec`, outside the managed heap, so
//! growing it never re-enters the collector); tracing drains the worklist,
//! marking each object's children per kind; the intern set then drops
//! entries whose strings died (it holds its keys weakly); finally the sweep
//! frees everything unmarked and clears the marks on survivors.
//!
//! The heap decides *when* collection is due (allocation watermark, or
//! every allocation under the `stress-gc` feature) but cannot see the
//! roots; the VM owns those and runs the phases in order.

use crate::chunk::Chunk;
use crate::object::{
    Class, Closure, Function, Instance, Obj, ObjKind, ObjRef, Str, Upvalue, UpvalueState,
};
use crate::table::{hash_str, Table};
use crate::value::Value;

const GC_HEAP_GROW_FACTOR: usize = 2;
const GC_INITIAL_THRESHOLD: usize = 1024 * 1024;

#[derive(Debug)]
pub struct Heap {
    slots: Vec<Option<Obj>>,
    free: Vec<u32>,
    /// Head of the intrusive live-object list (most recent first).
    head: Option<ObjRef>,
    /// Intern set: every string object, keyed by itself. Held weakly;
    /// entries for unmarked strings are removed before each sweep.
    strings: Table,
    bytes_allocated: usize,
    next_gc: usize,
    stress: bool,
    gray: Vec<ObjRef>,
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            strings: Table::new(),
            bytes_allocated: 0,
            next_gc: GC_INITIAL_THRESHOLD,
            stress: cfg!(feature = "stress-gc"),
            gray: Vec::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_stress(&mut self, stress: bool) {
        self.stress = stress;
    }

    // -----------------------------------------------------------------------
    // Allocation and interning
    // -----------------------------------------------------------------------

    /// True when the next allocation should be preceded by a collection.
    pub fn should_collect(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_gc
    }

    /// Create an object and link it onto the live list. Callers that want
    /// GC at the watermark check [`Heap::should_collect`] *before* calling
    /// this, so a fresh object can never be reclaimed by its own
    /// allocation.
    pub fn allocate(&mut self, kind: ObjKind) -> ObjRef {
        self.bytes_allocated += object_size(&kind);
        let obj = Obj {
            marked: false,
            next: self.head,
            kind,
        };
        let r = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(obj);
                ObjRef(index)
            }
            None => {
                self.slots.push(Some(obj));
                ObjRef((self.slots.len() - 1) as u32)
            }
        };
        self.head = Some(r);

        #[cfg(feature = "log-gc")]
        eprintln!("gc: allocate {:?} ({} bytes total)", r, self.bytes_allocated);

        r
    }

    /// Look up an already-interned string by content.
    pub fn find_interned(&self, text: &str, hash: u32) -> Option<ObjRef> {
        self.strings.find_key_with(hash, |key| {
            let s = self.str_obj(key);
            s.text.len() == text.len() && s.text == text
        })
    }

    /// Register a freshly allocated string in the intern set.
    pub fn intern_insert(&mut self, string: ObjRef, hash: u32) {
        self.strings.set(string, hash, Value::Nil);
    }

    /// Find-or-allocate an interned string, without a GC trigger. The VM
    /// wraps this with its watermark check; tests use it directly.
    pub fn intern(&mut self, text: &str) -> ObjRef {
        let hash = hash_str(text);
        if let Some(existing) = self.find_interned(text, hash) {
            return existing;
        }
        let r = self.allocate(ObjKind::Str(Str {
            text: text.to_string(),
            hash,
        }));
        self.intern_insert(r, hash);
        r
    }

    // -----------------------------------------------------------------------
    // Object access
    // -----------------------------------------------------------------------

    pub fn get(&self, r: ObjRef) -> &Obj {
        self.slots[r.0 as usize].as_ref().unwrap()
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        self.slots[r.0 as usize].as_mut().unwrap()
    }

    fn str_obj(&self, r: ObjRef) -> &Str {
        match &self.get(r).kind {
            ObjKind::Str(s) => s,
            _ => unreachable!("expected string object"),
        }
    }

    pub fn str_text(&self, r: ObjRef) -> &str {
        &self.str_obj(r).text
    }

    pub fn str_hash(&self, r: ObjRef) -> u32 {
        self.str_obj(r).hash
    }

    pub fn function(&self, r: ObjRef) -> &Function {
        match &self.get(r).kind {
            ObjKind::Function(f) => f,
            _ => unreachable!("expected function object"),
        }
    }

    pub fn function_mut(&mut self, r: ObjRef) -> &mut Function {
        match &mut self.get_mut(r).kind {
            ObjKind::Function(f) => f,
            _ => unreachable!("expected function object"),
        }
    }

    pub fn chunk(&self, function: ObjRef) -> &Chunk {
        &self.function(function).chunk
    }

    pub fn closure(&self, r: ObjRef) -> &Closure {
        match &self.get(r).kind {
            ObjKind::Closure(c) => c,
            _ => unreachable!("expected closure object"),
        }
    }

    pub fn closure_mut(&mut self, r: ObjRef) -> &mut Closure {
        match &mut self.get_mut(r).kind {
            ObjKind::Closure(c) => c,
            _ => unreachable!("expected closure object"),
        }
    }

    pub fn upvalue(&self, r: ObjRef) -> &Upvalue {
        match &self.get(r).kind {
            ObjKind::Upvalue(u) => u,
            _ => unreachable!("expected upvalue object"),
        }
    }

    pub fn upvalue_mut(&mut self, r: ObjRef) -> &mut Upvalue {
        match &mut self.get_mut(r).kind {
            ObjKind::Upvalue(u) => u,
            _ => unreachable!("expected upvalue object"),
        }
    }

    pub fn class(&self, r: ObjRef) -> &Class {
        match &self.get(r).kind {
            ObjKind::Class(c) => c,
            _ => unreachable!("expected class object"),
        }
    }

    pub fn class_mut(&mut self, r: ObjRef) -> &mut Class {
        match &mut self.get_mut(r).kind {
            ObjKind::Class(c) => c,
            _ => unreachable!("expected class object"),
        }
    }

    pub fn instance(&self, r: ObjRef) -> &Instance {
        match &self.get(r).kind {
            ObjKind::Instance(i) => i,
            _ => unreachable!("expected instance object"),
        }
    }

    pub fn instance_mut(&mut self, r: ObjRef) -> &mut Instance {
        match &mut self.get_mut(r).kind {
            ObjKind::Instance(i) => i,
            _ => unreachable!("expected instance object"),
        }
    }

    pub fn is_marked(&self, r: ObjRef) -> bool {
        self.get(r).marked
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    // -----------------------------------------------------------------------
    // Mark phase
    // -----------------------------------------------------------------------

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    pub fn mark_object(&mut self, r: ObjRef) {
        let obj = self.get_mut(r);
        if obj.marked {
            return;
        }
        obj.marked = true;
        self.gray.push(r);

        #[cfg(feature = "log-gc")]
        eprintln!("gc: mark {:?}", r);
    }

    /// Mark every key and value of a table that lives outside the heap
    /// (the globals table).
    pub fn mark_table(&mut self, table: &Table) {
        for (key, _, value) in table.entries() {
            self.mark_object(key);
            self.mark_value(value);
        }
    }

    /// Drain the gray worklist, blackening each object: mark the children
    /// specific to its kind.
    pub fn trace_references(&mut self) {
        while let Some(r) = self.gray.pop() {
            self.blacken(r);
        }
    }

    fn blacken(&mut self, r: ObjRef) {
        let mut children: Vec<Value> = Vec::new();
        match &self.get(r).kind {
            ObjKind::Str(_) | ObjKind::Native(_) => {}
            ObjKind::Function(f) => {
                if let Some(name) = f.name {
                    children.push(Value::Obj(name));
                }
                children.extend(f.chunk.constants.iter().copied());
            }
            ObjKind::Closure(c) => {
                children.push(Value::Obj(c.function));
                children.extend(c.upvalues.iter().map(|&u| Value::Obj(u)));
            }
            ObjKind::Upvalue(u) => {
                // Once closed, the upvalue owns the only reference to the
                // hoisted value.
                if let UpvalueState::Closed(value) = u.state {
                    children.push(value);
                }
            }
            ObjKind::Class(c) => {
                children.push(Value::Obj(c.name));
                for (key, _, value) in c.methods.entries() {
                    children.push(Value::Obj(key));
                    children.push(value);
                }
            }
            ObjKind::Instance(i) => {
                children.push(Value::Obj(i.class));
                for (key, _, value) in i.fields.entries() {
                    children.push(Value::Obj(key));
                    children.push(value);
                }
            }
            ObjKind::Bound(b) => {
                children.push(b.receiver);
                children.push(Value::Obj(b.method));
            }
        }
        for child in children {
            self.mark_value(child);
        }
    }

    // -----------------------------------------------------------------------
    // Sweep phase
    // -----------------------------------------------------------------------

    /// Drop intern entries whose strings were not marked, so the sweep
    /// cannot leave the intern set pointing at freed objects.
    pub fn remove_white_strings(&mut self) {
        let dead: Vec<(ObjRef, u32)> = self
            .strings
            .entries()
            .filter(|&(key, _, _)| !self.is_marked(key))
            .map(|(key, hash, _)| (key, hash))
            .collect();
        for (key, hash) in dead {
            self.strings.delete(key, hash);
        }
    }

    /// Walk the live-object list, freeing unmarked objects and clearing
    /// the mark on survivors. Re-measures the live set and moves the next
    /// collection watermark.
    pub fn sweep(&mut self) {
        let mut live_bytes = 0;
        let mut previous: Option<ObjRef> = None;
        let mut current = self.head;

        while let Some(r) = current {
            let obj = self.get(r);
            let next = obj.next;
            if obj.marked {
                live_bytes += object_size(&obj.kind);
                self.get_mut(r).marked = false;
                previous = Some(r);
            } else {
                match previous {
                    Some(p) => self.get_mut(p).next = next,
                    None => self.head = next,
                }
                self.free_object(r);
            }
            current = next;
        }

        self.bytes_allocated = live_bytes;
        self.next_gc = self.bytes_allocated * GC_HEAP_GROW_FACTOR;
    }

    fn free_object(&mut self, r: ObjRef) {
        #[cfg(feature = "log-gc")]
        eprintln!("gc: free {:?}", r);

        self.slots[r.0 as usize] = None;
        self.free.push(r.0);
    }
}

impl Default for Heap {
    fn default() -> Heap {
        Heap::new()
    }
}

/// Heap footprint estimate used for the collection watermark: header plus
/// the payload's owned allocations at their current capacity.
fn object_size(kind: &ObjKind) -> usize {
    let payload = match kind {
        ObjKind::Str(s) => s.text.capacity(),
        ObjKind::Function(f) => {
            f.chunk.code.capacity()
                + f.chunk.lines.capacity() * std::mem::size_of::<u32>()
                + f.chunk.constants.capacity() * std::mem::size_of::<Value>()
        }
        ObjKind::Closure(c) => c.upvalues.capacity() * std::mem::size_of::<ObjRef>(),
        ObjKind::Class(c) => c.methods.footprint(),
        ObjKind::Instance(i) => i.fields.footprint(),
        ObjKind::Upvalue(_) | ObjKind::Bound(_) | ObjKind::Native(_) => 0,
    };
    std::mem::size_of::<Obj>() + payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_returns_one_object_per_content() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        let c = heap.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.str_text(a), "hello");
    }

    #[test]
    fn collection_frees_unreachable_and_keeps_reachable() {
        let mut heap = Heap::new();
        let kept = heap.intern("kept");
        let dropped = heap.intern("dropped");

        heap.mark_object(kept);
        heap.trace_references();
        heap.remove_white_strings();
        heap.sweep();

        // The survivor is still interned and unmarked again.
        assert!(!heap.is_marked(kept));
        assert!(heap.bytes_allocated() > 0);
        assert_eq!(heap.find_interned("kept", hash_str("kept")), Some(kept));
        // The dead string is gone from the intern set and its slot recycled.
        assert_eq!(heap.find_interned("dropped", hash_str("dropped")), None);
        assert!(heap.free.contains(&dropped.0));
    }

    #[test]
    fn tracing_reaches_children() {
        let mut heap = Heap::new();
        let name = heap.intern("f");
        let constant = heap.intern("in constants");
        let function = heap.allocate(ObjKind::Function(Function::new()));
        heap.function_mut(function).name = Some(name);
        let index = {
            let chunk = &mut heap.function_mut(function).chunk;
            chunk.add_constant(Value::Obj(constant))
        };
        assert_eq!(index, 0);

        heap.mark_object(function);
        heap.trace_references();
        heap.remove_white_strings();
        heap.sweep();

        assert_eq!(heap.find_interned("f", hash_str("f")), Some(name));
        assert_eq!(
            heap.find_interned("in constants", hash_str("in constants")),
            Some(constant)
        );
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut heap = Heap::new();
        let garbage = heap.intern("garbage");
        heap.remove_white_strings();
        heap.sweep();

        let next = heap.intern("next");
        assert_eq!(next.0, garbage.0);
    }
}
