//! Runtime collaborator interface.
//!
//! Everything the bridge needs from the garbage-collected runtime goes
//! through [`ScriptRuntime`]. Calls are synchronous and only ever made from
//! the thread owning the [`Engine`](crate::Engine).
//!
//! [`Heap`] is the in-crate implementation: a small generation-checked
//! mark/sweep heap, enough to exercise reachability, persistent roots and
//! pending exceptions.

mod heap;

use std::fmt;

use bytes::Bytes;

use crate::error::Result;

pub use heap::Heap;

/// Generation-checked reference to a heap cell.
///
/// Packed `{ index: u32, generation: u32 }`. The generation is bumped each
/// time a cell is freed, so a stale `GcRef` never aliases a reused cell.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct GcRef(u64);

impl GcRef {
    pub(crate) fn from_parts(index: u32, generation: u32) -> Self {
        Self((index as u64) | ((generation as u64) << 32))
    }

    #[inline]
    pub fn index(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Debug for GcRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcRef")
            .field("index", &self.index())
            .field("generation", &self.generation())
            .finish()
    }
}

/// A runtime value as seen from native code.
///
/// Primitives are held by value and never collected; everything else lives
/// in the heap behind a [`GcRef`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Gc(GcRef),
}

impl Value {
    #[inline]
    pub fn as_gc(self) -> Option<GcRef> {
        match self {
            Value::Gc(r) => Some(r),
            _ => None,
        }
    }

    #[inline]
    pub fn is_undefined(self) -> bool {
        matches!(self, Value::Undefined)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueType {
    Undefined,
    Null,
    Boolean,
    Number,
    String,
    Object,
    Error,
    ArrayBuffer,
}

/// Handle to a persistent root. Keeps its value live until removed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RootId(pub(crate) u32);

/// Kind of collection pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GcKind {
    /// Opportunistic pass run inside an idle window
    Idle,
    /// Full stop-the-world pass
    Full,
}

/// What a collection pass did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GcOutcome {
    pub kind: GcKind,
    /// Cells freed by this pass
    pub collected: usize,
    pub used_bytes_before: usize,
    pub used_bytes_after: usize,
}

/// Runtime value API consumed by the engine.
pub trait ScriptRuntime {
    fn create_object(&mut self) -> Value;

    fn create_string(&mut self, s: &str) -> Value;

    fn create_error(&mut self, message: &str) -> Value;

    fn create_array_buffer(&mut self, data: Bytes) -> Value;

    /// Append `element` to the elements of object `target`, making it
    /// reachable from `target`.
    fn set_element(&mut self, target: Value, element: Value) -> Result<()>;

    /// `None` when `value` refers to a collected cell.
    fn value_type(&self, value: Value) -> Option<ValueType>;

    fn read_string(&self, value: Value) -> Option<&str>;

    fn read_error_message(&self, value: Value) -> Option<&str>;

    fn read_array_buffer(&self, value: Value) -> Option<Bytes>;

    /// Primitives are always live; heap values are live until swept.
    fn is_live(&self, value: Value) -> bool;

    fn add_root(&mut self, value: Value) -> RootId;

    fn remove_root(&mut self, root: RootId);

    /// Make `value` the pending exception, replacing any previous one.
    fn throw(&mut self, value: Value);

    fn has_pending_exception(&self) -> bool;

    fn take_pending_exception(&mut self) -> Option<Value>;

    fn collect_garbage(&mut self, kind: GcKind) -> GcOutcome;

    /// Number of collection passes run so far.
    fn gc_count(&self) -> u64;

    fn heap_used_bytes(&self) -> usize;
}
