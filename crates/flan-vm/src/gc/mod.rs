//! The managed heap: a two-generation mark-and-sweep collector.
//!
//! Every object lives in an intrusive singly-linked list, either the
//! nursery or the tenured generation. New objects start in the nursery;
//! surviving one collection promotes them. Both generations are walked from
//! the same roots on every collection, so no cross-generation pointer
//! tracking is needed.


use std::cell::Cell;
use std::fmt;
use std::mem;
use std::ops::Deref;
use std::ptr::NonNull;

use tracing::debug;

use crate::value::{Globals, Obj, Value};

/// A handle to a heap-owned object.
///
/// Handles are plain copyable pointers; the heap owns every referent and
/// frees it only when a collection proves it unreachable from the roots, so
/// a handle reachable from the stack or the globals is always valid.
#[derive(Clone, Copy)]
pub struct ObjRef(NonNull<GcBox>);

impl ObjRef {
    pub fn get(&self) -> &Obj {
        unsafe { &self.0.as_ref().obj }
    }

    /// Get a mutable reference through a shared handle.
    ///
    /// # Safety
    ///
    /// The caller must not hold any other reference into the same object.
    /// The interpreter upholds this by mutating only between instructions'
    /// borrows, never across them.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self) -> &mut Obj {
        &mut (*self.0.as_ptr()).obj
    }

    pub fn ptr_eq(a: ObjRef, b: ObjRef) -> bool {
        a.0 == b.0
    }

    /// Address of the cell, for printing unnamed functions.
    pub fn addr(&self) -> usize {
        self.0.as_ptr() as usize
    }

    fn header(&self) -> &GcBox {
        unsafe { self.0.as_ref() }
    }
}

impl Deref for ObjRef {
    type Target = Obj;

    fn deref(&self) -> &Self::Target {
        self.get()
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjRef({:#x})", self.addr())
    }
}

/// The heap-allocated cell: mark bit, size recorded at allocation, the
/// intrusive generation link, and the object itself.
struct GcBox {
    marked: Cell<bool>,
    size: usize,
    next: Cell<Option<NonNull<GcBox>>>,
    obj: Obj,
}

/// One generation: list head plus its byte and object ledgers.
#[derive(Default)]
struct GenList {
    head: Option<NonNull<GcBox>>,
    bytes: usize,
    count: usize,
}

impl GenList {
    fn push(&mut self, ptr: NonNull<GcBox>, size: usize) {
        unsafe { ptr.as_ref() }.next.set(self.head);
        self.head = Some(ptr);
        self.bytes += size;
        self.count += 1;
    }
}

/// The collection roots: every value on the evaluation stack and in the
/// globals table. Borrowed per call so the heap never aliases interpreter
/// state.
#[derive(Clone, Copy)]
pub struct Roots<'a> {
    pub stack: &'a [Value],
    pub globals: &'a Globals,
}

pub struct Heap {
    nursery: GenList,
    tenured: GenList,
    nursery_budget: usize,
    tenured_budget: usize,
}

impl Heap {
    pub fn new(nursery_budget: usize, tenured_budget: usize) -> Heap {
        Heap {
            nursery: GenList::default(),
            tenured: GenList::default(),
            nursery_budget,
            tenured_budget,
        }
    }

    /// Allocate an object in the nursery. A collection check runs first, so
    /// any heap value the caller still needs must be reachable from `roots`.
    pub fn alloc(&mut self, obj: Obj, roots: Roots<'_>) -> ObjRef {
        self.may_collect(roots);

        let size = mem::size_of::<GcBox>() + obj.payload_size();
        let cell = Box::new(GcBox {
            marked: Cell::new(false),
            size,
            next: Cell::new(None),
            obj,
        });
        let ptr = NonNull::from(Box::leak(cell));
        self.nursery.push(ptr, size);
        ObjRef(ptr)
    }

    /// Run a full collection: tenured sweep first, then nursery promotion.
    pub fn collect(&mut self, roots: Roots<'_>) {
        self.run_collection(roots, true);
    }

    fn may_collect(&mut self, roots: Roots<'_>) {
        if self.nursery.bytes < self.nursery_budget {
            return;
        }
        let major = self.tenured.bytes >= self.tenured_budget;
        self.run_collection(roots, major);
    }

    /// One collection cycle: mark from the roots, then sweep. The tenured
    /// sweep runs before promotion so objects promoted this cycle are never
    /// swept by it; after a minor-only cycle the tenured marks set by the
    /// root walk are cleared again so the heap rests with all bits zero.
    fn run_collection(&mut self, roots: Roots<'_>, major: bool) {
        mark_roots(roots);

        if major {
            self.sweep_tenured();
        }
        self.sweep_nursery();
        if !major {
            self.clear_tenured_marks();
        }

        debug!(
            major,
            nursery_bytes = self.nursery.bytes,
            tenured_bytes = self.tenured.bytes,
            tenured_objects = self.tenured.count,
            "collection finished"
        );
    }

    /// Drain the nursery: free unmarked cells, promote survivors with their
    /// mark bit cleared.
    fn sweep_nursery(&mut self) {
        let mut cursor = self.nursery.head.take();
        self.nursery.bytes = 0;
        self.nursery.count = 0;

        while let Some(ptr) = cursor {
            let (next, marked, size) = {
                let cell = unsafe { ptr.as_ref() };
                (cell.next.get(), cell.marked.get(), cell.size)
            };
            if marked {
                unsafe { ptr.as_ref() }.marked.set(false);
                self.tenured.push(ptr, size);
            } else {
                drop(unsafe { Box::from_raw(ptr.as_ptr()) });
            }
            cursor = next;
        }
    }

    /// Free unmarked tenured cells, keeping a predecessor pointer so the
    /// unlink is O(1).
    fn sweep_tenured(&mut self) {
        let mut pred: Option<NonNull<GcBox>> = None;
        let mut cursor = self.tenured.head;

        while let Some(ptr) = cursor {
            let (next, marked, size) = {
                let cell = unsafe { ptr.as_ref() };
                (cell.next.get(), cell.marked.get(), cell.size)
            };
            if marked {
                unsafe { ptr.as_ref() }.marked.set(false);
                pred = Some(ptr);
            } else {
                match pred {
                    Some(p) => unsafe { p.as_ref() }.next.set(next),
                    None => self.tenured.head = next,
                }
                self.tenured.bytes -= size;
                self.tenured.count -= 1;
                drop(unsafe { Box::from_raw(ptr.as_ptr()) });
            }
            cursor = next;
        }
    }

    fn clear_tenured_marks(&self) {
        let mut cursor = self.tenured.head;
        while let Some(ptr) = cursor {
            let cell = unsafe { ptr.as_ref() };
            cell.marked.set(false);
            cursor = cell.next.get();
        }
    }

    pub fn nursery_bytes(&self) -> usize {
        self.nursery.bytes
    }

    pub fn tenured_bytes(&self) -> usize {
        self.tenured.bytes
    }

    pub fn nursery_count(&self) -> usize {
        self.nursery.count
    }

    pub fn tenured_count(&self) -> usize {
        self.tenured.count
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        free_list(self.nursery.head.take());
        free_list(self.tenured.head.take());
    }
}

fn free_list(mut cursor: Option<NonNull<GcBox>>) {
    while let Some(ptr) = cursor {
        cursor = unsafe { ptr.as_ref() }.next.get();
        drop(unsafe { Box::from_raw(ptr.as_ptr()) });
    }
}

fn mark_roots(roots: Roots<'_>) {
    for value in roots.stack {
        mark_value(value);
    }
    for value in roots.globals.values() {
        mark_value(value);
    }
}

fn mark_value(value: &Value) {
    if let Value::Obj(r) = value {
        mark_obj(*r);
    }
}

/// Set the mark bit and recurse into owned children. Idempotent, which also
/// makes it terminate on cyclic structures.
fn mark_obj(r: ObjRef) {
    let cell = r.header();
    if cell.marked.get() {
        return;
    }
    cell.marked.set(true);

    match &cell.obj {
        Obj::List(xs) => xs.iter().for_each(mark_value),
        Obj::Table(map) => map.values().for_each(mark_value),
        Obj::Tuple(xs) => xs.iter().for_each(mark_value),
        Obj::Upvalue(v) => mark_value(v),
        Obj::Closure(c) => {
            mark_obj(c.function);
            c.upvalues.iter().copied().for_each(mark_obj);
        }
        Obj::Str(_) | Obj::Atom(_) | Obj::Function(_) => {}
    }
}
