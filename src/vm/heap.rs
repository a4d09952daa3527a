//! The garbage-collected heap.
//!
//! Objects live in a slot vector indexed by `ObjRef`; each slot carries the
//! mark bit in its header. Freed slots go on a free list and are reused by
//! later allocations. The heap also owns the string intern table, which is
//! weak: after the mark phase, entries whose key string died are dropped.
//!
//! The heap never collects on its own. Callers check `should_collect()`
//! right before allocating (while every transient value is still rooted) and
//! then hand over the root set via `collect`. Compilation relies on this:
//! interning during a compile only grows the heap, so in-progress functions
//! stay alive without being a root.

use std::io::{self, Write};
use std::time::Instant;

use super::object::{hash_string, Obj, ObjFunction, ObjRef, ObjStr, StrRef};
use super::table::Table;
use super::value::Value;

/// Collection threshold floor, in live objects.
pub const GC_FLOOR: usize = 1024;

#[derive(Debug)]
struct HeapEntry {
    marked: bool,
    obj: Obj,
}

/// Collection statistics, reported by the driver under `--gc-stats`.
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    pub cycles: usize,
    pub total_pause_us: u64,
    pub max_pause_us: u64,
}

/// The root set for a collection. Everything reachable from here survives.
pub struct Roots<'a> {
    /// Live portion of the value stack.
    pub stack: &'a [Value],
    /// The callable executing in each call frame.
    pub frames: &'a [ObjRef],
    /// All open upvalues.
    pub open_upvalues: &'a [ObjRef],
    /// The globals table (keys and values).
    pub globals: &'a Table,
    /// The pinned "init" string.
    pub init_string: StrRef,
}

pub struct Heap {
    slots: Vec<Option<HeapEntry>>,
    free: Vec<u32>,
    object_count: usize,
    threshold: usize,
    floor: usize,
    stress: bool,
    strings: Table,
    stats: GcStats,
}

impl Heap {
    pub fn new() -> Heap {
        Heap::with_floor(GC_FLOOR, false)
    }

    /// A heap that collects before every allocation, for stress testing.
    pub fn stress() -> Heap {
        Heap::with_floor(0, true)
    }

    fn with_floor(floor: usize, stress: bool) -> Heap {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            object_count: 0,
            threshold: floor,
            floor,
            stress,
            strings: Table::new(),
            stats: GcStats::default(),
        }
    }

    pub fn object_count(&self) -> usize {
        self.object_count
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// True when the next allocation should run a collection first.
    pub fn should_collect(&self) -> bool {
        self.stress || self.object_count >= self.threshold
    }

    /// Allocate `obj`, reusing a freed slot when one exists. Never collects.
    pub fn alloc(&mut self, obj: Obj) -> ObjRef {
        self.object_count += 1;
        let entry = HeapEntry { marked: false, obj };
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(entry);
                ObjRef(index)
            }
            None => {
                self.slots.push(Some(entry));
                ObjRef(self.slots.len() as u32 - 1)
            }
        }
    }

    pub fn get(&self, r: ObjRef) -> &Obj {
        match &self.slots[r.0 as usize] {
            Some(entry) => &entry.obj,
            None => panic!("dangling object handle {:?}", r),
        }
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        match &mut self.slots[r.0 as usize] {
            Some(entry) => &mut entry.obj,
            None => panic!("dangling object handle {:?}", r),
        }
    }

    /// Intern `s`: returns the handle of the unique string with these
    /// contents, allocating only on the first sighting.
    pub fn intern(&mut self, s: &str) -> StrRef {
        let hash = hash_string(s);
        let slots = &self.slots;
        if let Some(found) = self.strings.find_string(s, hash, |r| str_text(slots, r)) {
            return found;
        }

        let obj = self.alloc(Obj::Str(ObjStr {
            hash,
            text: s.into(),
        }));
        let key = StrRef { obj, hash };
        self.strings.insert(key, Value::nil());
        key
    }

    /// The text of an interned string.
    pub fn str_text(&self, r: ObjRef) -> &str {
        str_text(&self.slots, r)
    }

    /// Rebuild the `StrRef` (handle + cached hash) for a string object.
    pub fn str_ref(&self, r: ObjRef) -> Option<StrRef> {
        match self.get(r) {
            Obj::Str(s) => Some(StrRef { obj: r, hash: s.hash }),
            _ => None,
        }
    }

    pub fn is_string(&self, v: Value) -> bool {
        v.as_obj()
            .is_some_and(|r| matches!(self.get(r), Obj::Str(_)))
    }

    /// The function payload behind `r`, which must be a function handle.
    pub fn function(&self, r: ObjRef) -> &ObjFunction {
        match self.get(r) {
            Obj::Function(f) => f,
            other => panic!("expected function, found {:?}", other),
        }
    }

    /// The function backing a callable (a bare function or a closure).
    pub fn callable_function(&self, r: ObjRef) -> &ObjFunction {
        match self.get(r) {
            Obj::Function(f) => f,
            Obj::Closure(c) => self.function(c.function),
            other => panic!("expected callable, found {:?}", other),
        }
    }

    /// Run a full mark-and-sweep collection from `roots`.
    pub fn collect(&mut self, roots: Roots<'_>) {
        let start = Instant::now();
        let mut worklist: Vec<ObjRef> = Vec::new();

        for value in roots.stack {
            self.mark_value(*value, &mut worklist);
        }
        for r in roots.frames {
            self.mark_object(*r, &mut worklist);
        }
        for r in roots.open_upvalues {
            self.mark_object(*r, &mut worklist);
        }
        for (key, value) in roots.globals.iter() {
            self.mark_object(key.obj, &mut worklist);
            self.mark_value(value, &mut worklist);
        }
        self.mark_object(roots.init_string.obj, &mut worklist);

        while let Some(r) = worklist.pop() {
            self.mark_children(r, &mut worklist);
        }

        // The intern table is weak: drop entries whose string died.
        let slots = &self.slots;
        self.strings
            .retain(|key| matches!(&slots[key.obj.0 as usize], Some(e) if e.marked));

        self.sweep();
        self.threshold = (2 * self.object_count).max(self.floor);

        let pause_us = start.elapsed().as_micros() as u64;
        self.stats.cycles += 1;
        self.stats.total_pause_us += pause_us;
        self.stats.max_pause_us = self.stats.max_pause_us.max(pause_us);
    }

    fn mark_value(&mut self, value: Value, worklist: &mut Vec<ObjRef>) {
        if let Some(r) = value.as_obj() {
            self.mark_object(r, worklist);
        }
    }

    fn mark_object(&mut self, r: ObjRef, worklist: &mut Vec<ObjRef>) {
        if let Some(entry) = &mut self.slots[r.0 as usize] {
            if !entry.marked {
                entry.marked = true;
                worklist.push(r);
            }
        }
    }

    /// Mark the successors of an already-marked object.
    fn mark_children(&mut self, r: ObjRef, worklist: &mut Vec<ObjRef>) {
        let mut objs: Vec<ObjRef> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        match self.get(r) {
            Obj::Str(_) | Obj::Native(_) => {}
            Obj::Function(f) => {
                if let Some(name) = f.name {
                    objs.push(name.obj);
                }
                values.extend_from_slice(&f.chunk.constants);
            }
            Obj::Upvalue(u) => {
                // Safe while open too: the closed payload is nil then.
                if let super::object::ObjUpvalue::Closed(v) = u {
                    values.push(*v);
                }
            }
            Obj::Closure(c) => {
                objs.push(c.function);
                objs.extend_from_slice(&c.upvalues);
            }
            Obj::Class(c) => {
                objs.push(c.name.obj);
                for (key, value) in c.methods.iter() {
                    objs.push(key.obj);
                    values.push(value);
                }
            }
            Obj::Instance(i) => {
                objs.push(i.class);
                for (key, value) in i.fields.iter() {
                    objs.push(key.obj);
                    values.push(value);
                }
            }
            Obj::BoundMethod(b) => {
                values.push(b.receiver);
                objs.push(b.method);
            }
        }

        for o in objs {
            self.mark_object(o, worklist);
        }
        for v in values {
            self.mark_value(v, worklist);
        }
    }

    /// Free every unmarked slot and clear surviving marks.
    fn sweep(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            match slot {
                Some(entry) if entry.marked => entry.marked = false,
                Some(_) => {
                    *slot = None;
                    self.free.push(index as u32);
                    self.object_count -= 1;
                }
                None => {}
            }
        }
    }

    /// Write a value's printed form, resolving object handles.
    pub fn write_value(&self, value: Value, out: &mut dyn Write) -> io::Result<()> {
        if value.is_nil() {
            return write!(out, "nil");
        }
        if let Some(b) = value.as_bool() {
            return write!(out, "{}", b);
        }
        if let Some(n) = value.as_number() {
            return write!(out, "{}", n);
        }
        let Some(r) = value.as_obj() else {
            return write!(out, "nil");
        };
        self.write_object(r, out)
    }

    fn write_object(&self, r: ObjRef, out: &mut dyn Write) -> io::Result<()> {
        match self.get(r) {
            Obj::Str(s) => write!(out, "{}", s.text),
            Obj::Function(f) => self.write_function(f, out),
            Obj::Native(_) => write!(out, "<native fn>"),
            Obj::Closure(c) => self.write_function(self.function(c.function), out),
            Obj::Upvalue(_) => write!(out, "upvalue"),
            Obj::Class(c) => write!(out, "{}", self.str_text(c.name.obj)),
            Obj::Instance(i) => match self.get(i.class) {
                Obj::Class(c) => write!(out, "{} instance", self.str_text(c.name.obj)),
                _ => write!(out, "instance"),
            },
            Obj::BoundMethod(b) => match self.get(b.method) {
                Obj::Closure(c) => self.write_function(self.function(c.function), out),
                Obj::Function(f) => self.write_function(f, out),
                _ => write!(out, "<bound method>"),
            },
        }
    }

    fn write_function(&self, f: &ObjFunction, out: &mut dyn Write) -> io::Result<()> {
        match f.name {
            Some(name) => write!(out, "<fn {}>", self.str_text(name.obj)),
            None => write!(out, "<script>"),
        }
    }

    /// Convenience for error messages and tests.
    pub fn value_to_string(&self, value: Value) -> String {
        let mut buf = Vec::new();
        // Writing into a Vec cannot fail.
        let _ = self.write_value(value, &mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

fn str_text(slots: &[Option<HeapEntry>], r: ObjRef) -> &str {
    match &slots[r.0 as usize] {
        Some(HeapEntry {
            obj: Obj::Str(s), ..
        }) => &s.text,
        _ => panic!("expected string object {:?}", r),
    }
}
