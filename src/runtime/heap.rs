//! Generation-checked mark/sweep heap implementing [`ScriptRuntime`].

use std::mem;

use bytes::Bytes;

use super::{GcKind, GcOutcome, GcRef, RootId, ScriptRuntime, Value, ValueType};
use crate::error::{EngineError, Result};

enum CellData {
    Object { elements: Vec<Value> },
    String(Box<str>),
    Error { message: Box<str> },
    ArrayBuffer(Bytes),
}

impl CellData {
    fn byte_size(&self) -> usize {
        let payload = match self {
            CellData::Object { elements } => elements.capacity() * mem::size_of::<Value>(),
            CellData::String(s) => s.len(),
            CellData::Error { message } => message.len(),
            CellData::ArrayBuffer(b) => b.len(),
        };
        mem::size_of::<CellData>() + payload
    }
}

#[derive(Default)]
struct Cell {
    data: Option<CellData>,
    generation: u32,
    bytes: usize,
}

/// In-crate runtime heap.
///
/// Roots are the persistent root table plus the pending exception. Objects
/// trace their elements; strings, errors and array buffers are leaves.
#[derive(Default)]
pub struct Heap {
    cells: Vec<Cell>,
    marks: Vec<bool>,
    free_list: Vec<u32>,
    roots: Vec<Option<Value>>,
    roots_free: Vec<u32>,
    pending_exception: Option<Value>,
    used_bytes: usize,
    gc_runs: u64,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of occupied cells.
    pub fn live_cells(&self) -> usize {
        self.cells.len() - self.free_list.len()
    }

    /// Number of registered persistent roots.
    pub fn root_count(&self) -> usize {
        self.roots.len() - self.roots_free.len()
    }

    fn alloc(&mut self, data: CellData) -> Value {
        let bytes = data.byte_size();
        self.used_bytes += bytes;

        let index = match self.free_list.pop() {
            Some(index) => index,
            None => {
                self.cells.push(Cell::default());
                self.marks.push(false);
                (self.cells.len() - 1) as u32
            }
        };

        let cell = &mut self.cells[index as usize];
        debug_assert!(cell.data.is_none());
        cell.data = Some(data);
        cell.bytes = bytes;

        Value::Gc(GcRef::from_parts(index, cell.generation))
    }

    fn cell(&self, r: GcRef) -> Option<&CellData> {
        let cell = self.cells.get(r.index() as usize)?;
        if cell.generation != r.generation() {
            return None;
        }
        cell.data.as_ref()
    }

    fn cell_mut(&mut self, r: GcRef) -> Option<&mut CellData> {
        let cell = self.cells.get_mut(r.index() as usize)?;
        if cell.generation != r.generation() {
            return None;
        }
        cell.data.as_mut()
    }

    fn mark_from(&mut self, mut work: Vec<GcRef>) {
        while let Some(r) = work.pop() {
            let idx = r.index() as usize;
            let Some(cell) = self.cells.get(idx) else {
                continue;
            };
            if cell.generation != r.generation() || self.marks[idx] {
                continue;
            }
            self.marks[idx] = true;

            if let Some(CellData::Object { elements }) = &cell.data {
                work.extend(elements.iter().filter_map(|v| v.as_gc()));
            }
        }
    }
}

impl ScriptRuntime for Heap {
    fn create_object(&mut self) -> Value {
        self.alloc(CellData::Object {
            elements: Vec::new(),
        })
    }

    fn create_string(&mut self, s: &str) -> Value {
        self.alloc(CellData::String(s.into()))
    }

    fn create_error(&mut self, message: &str) -> Value {
        self.alloc(CellData::Error {
            message: message.into(),
        })
    }

    fn create_array_buffer(&mut self, data: Bytes) -> Value {
        self.alloc(CellData::ArrayBuffer(data))
    }

    fn set_element(&mut self, target: Value, element: Value) -> Result<()> {
        let Some(r) = target.as_gc() else {
            return Err(EngineError::invalid_arg("set_element target is not an object"));
        };

        match self.cell_mut(r) {
            Some(CellData::Object { elements }) => {
                elements.push(element);
                Ok(())
            }
            Some(_) => Err(EngineError::invalid_arg(
                "set_element target is not an object",
            )),
            None => Err(EngineError::invalid_arg("set_element target was collected")),
        }
    }

    fn value_type(&self, value: Value) -> Option<ValueType> {
        let ty = match value {
            Value::Undefined => ValueType::Undefined,
            Value::Null => ValueType::Null,
            Value::Bool(_) => ValueType::Boolean,
            Value::Number(_) => ValueType::Number,
            Value::Gc(r) => match self.cell(r)? {
                CellData::Object { .. } => ValueType::Object,
                CellData::String(_) => ValueType::String,
                CellData::Error { .. } => ValueType::Error,
                CellData::ArrayBuffer(_) => ValueType::ArrayBuffer,
            },
        };
        Some(ty)
    }

    fn read_string(&self, value: Value) -> Option<&str> {
        match self.cell(value.as_gc()?)? {
            CellData::String(s) => Some(s),
            _ => None,
        }
    }

    fn read_error_message(&self, value: Value) -> Option<&str> {
        match self.cell(value.as_gc()?)? {
            CellData::Error { message } => Some(message),
            _ => None,
        }
    }

    fn read_array_buffer(&self, value: Value) -> Option<Bytes> {
        match self.cell(value.as_gc()?)? {
            CellData::ArrayBuffer(b) => Some(b.clone()),
            _ => None,
        }
    }

    fn is_live(&self, value: Value) -> bool {
        match value {
            Value::Gc(r) => self.cell(r).is_some(),
            _ => true,
        }
    }

    fn add_root(&mut self, value: Value) -> RootId {
        let idx = match self.roots_free.pop() {
            Some(idx) => idx as usize,
            None => {
                self.roots.push(None);
                self.roots.len() - 1
            }
        };
        debug_assert!(self.roots[idx].is_none());
        self.roots[idx] = Some(value);
        RootId(idx as u32)
    }

    fn remove_root(&mut self, root: RootId) {
        let idx = root.0 as usize;
        debug_assert!(idx < self.roots.len(), "invalid RootId");
        let Some(slot) = self.roots.get_mut(idx) else {
            return;
        };
        if slot.take().is_some() {
            self.roots_free.push(root.0);
        }
    }

    fn throw(&mut self, value: Value) {
        self.pending_exception = Some(value);
    }

    fn has_pending_exception(&self) -> bool {
        self.pending_exception.is_some()
    }

    fn take_pending_exception(&mut self) -> Option<Value> {
        self.pending_exception.take()
    }

    fn collect_garbage(&mut self, kind: GcKind) -> GcOutcome {
        self.gc_runs += 1;
        let used_bytes_before = self.used_bytes;

        // Mark.
        let work: Vec<GcRef> = self
            .roots
            .iter()
            .flatten()
            .chain(self.pending_exception.iter())
            .filter_map(|v| v.as_gc())
            .collect();
        self.mark_from(work);

        // Sweep.
        let mut collected = 0;
        for (idx, cell) in self.cells.iter_mut().enumerate() {
            let marked = mem::replace(&mut self.marks[idx], false);
            if marked || cell.data.is_none() {
                continue;
            }

            self.used_bytes = self.used_bytes.saturating_sub(cell.bytes);
            cell.data = None;
            cell.bytes = 0;
            cell.generation = cell.generation.wrapping_add(1);
            self.free_list.push(idx as u32);
            collected += 1;
        }

        tracing::trace!(
            "{:?} collection #{} freed {} cells ({} -> {} bytes)",
            kind,
            self.gc_runs,
            collected,
            used_bytes_before,
            self.used_bytes
        );

        GcOutcome {
            kind,
            collected,
            used_bytes_before,
            used_bytes_after: self.used_bytes,
        }
    }

    fn gc_count(&self) -> u64 {
        self.gc_runs
    }

    fn heap_used_bytes(&self) -> usize {
        self.used_bytes
    }
}
