//! Handle slot table.
//!
//! One slot holds one runtime value for native code. A strong slot owns a
//! persistent root in the runtime; a weak slot only observes the value and
//! is emptied by [`HandleSlotTable::sweep`] once the runtime collected it.

use std::any::Any;
use std::fmt;

use crate::runtime::{RootId, ScriptRuntime, Value};

/// Opaque user data carried by a finalizer.
pub type UserData = Box<dyn Any>;

/// Callback invoked once when a slot's value is finalized.
///
/// Receives the finalizer's data and hint by value.
pub type FinalizeCallback = Box<dyn FnOnce(Option<UserData>, Option<UserData>)>;

/// Generation-checked slot identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(u64);

impl SlotId {
    fn from_parts(index: u32, generation: u32) -> Self {
        Self((index as u64) | ((generation as u64) << 32))
    }

    #[inline]
    fn index(self) -> usize {
        self.0 as u32 as usize
    }

    #[inline]
    fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Debug for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlotId({}@{})", self.index(), self.generation())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strength {
    Strong,
    Weak,
}

/// Native finalizer armed on a slot.
pub struct Finalizer {
    callback: FinalizeCallback,
    data: Option<UserData>,
    hint: Option<UserData>,
}

impl Finalizer {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(Option<UserData>, Option<UserData>) + 'static,
    {
        Self {
            callback: Box::new(callback),
            data: None,
            hint: None,
        }
    }

    pub fn with_data<T: Any>(mut self, data: T) -> Self {
        self.data = Some(Box::new(data));
        self
    }

    pub fn with_hint<T: Any>(mut self, hint: T) -> Self {
        self.hint = Some(Box::new(hint));
        self
    }

    pub fn data(&self) -> Option<&dyn Any> {
        self.data.as_deref()
    }

    /// Consumes the finalizer, so it can only ever run once.
    pub(crate) fn invoke(self) {
        (self.callback)(self.data, self.hint);
    }
}

impl fmt::Debug for Finalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Finalizer")
            .field("has_data", &self.data.is_some())
            .field("has_hint", &self.hint.is_some())
            .finish()
    }
}

struct HandleSlot {
    value: Option<Value>,
    strength: Strength,
    /// Present iff strong and holding a heap value
    root: Option<RootId>,
    finalizer: Option<Finalizer>,
}

#[derive(Default)]
struct Entry {
    generation: u32,
    slot: Option<HandleSlot>,
}

/// Table of handle slots, owned by one engine.
#[derive(Default)]
pub struct HandleSlotTable {
    entries: Vec<Entry>,
    free: Vec<u32>,
    len: usize,
}

impl HandleSlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn slot(&self, id: SlotId) -> Option<&HandleSlot> {
        let entry = self.entries.get(id.index())?;
        if entry.generation != id.generation() {
            return None;
        }
        entry.slot.as_ref()
    }

    fn slot_mut(&mut self, id: SlotId) -> Option<&mut HandleSlot> {
        let entry = self.entries.get_mut(id.index())?;
        if entry.generation != id.generation() {
            return None;
        }
        entry.slot.as_mut()
    }

    pub fn contains(&self, id: SlotId) -> bool {
        self.slot(id).is_some()
    }

    /// Wrap `value` in a new slot.
    pub fn insert(
        &mut self,
        rt: &mut dyn ScriptRuntime,
        value: Value,
        strength: Strength,
        finalizer: Option<Finalizer>,
    ) -> SlotId {
        let root = match (strength, value) {
            (Strength::Strong, Value::Gc(_)) => Some(rt.add_root(value)),
            _ => None,
        };

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.entries.push(Entry::default());
                (self.entries.len() - 1) as u32
            }
        };

        let entry = &mut self.entries[index as usize];
        debug_assert!(entry.slot.is_none());
        entry.slot = Some(HandleSlot {
            value: Some(value),
            strength,
            root,
            finalizer,
        });
        self.len += 1;

        let id = SlotId::from_parts(index, entry.generation);
        tracing::trace!("Inserted {:?} slot {:?}", strength, id);
        id
    }

    /// Current value, or `None` once the slot was emptied or its value
    /// collected. Callers must check on every access.
    pub fn get(&self, rt: &dyn ScriptRuntime, id: SlotId) -> Option<Value> {
        let value = self.slot(id)?.value?;
        rt.is_live(value).then_some(value)
    }

    pub fn strength(&self, id: SlotId) -> Option<Strength> {
        self.slot(id).map(|s| s.strength)
    }

    pub fn finalizer_data(&self, id: SlotId) -> Option<&dyn Any> {
        self.slot(id)?.finalizer.as_ref()?.data()
    }

    /// Weak to strong. Goes through the runtime root API after re-checking
    /// liveness, so a value swept by an earlier pass is never resurrected.
    ///
    /// Returns whether the slot still holds a value.
    pub fn promote(&mut self, rt: &mut dyn ScriptRuntime, id: SlotId) -> bool {
        let Some(slot) = self.slot_mut(id) else {
            return false;
        };
        if slot.strength == Strength::Strong {
            return slot.value.is_some();
        }

        slot.strength = Strength::Strong;
        let current = slot.value;
        match current {
            Some(value) if rt.is_live(value) => {
                if value.as_gc().is_some() {
                    slot.root = Some(rt.add_root(value));
                }
                true
            }
            Some(_) => {
                // Collected, not yet swept.
                slot.value = None;
                false
            }
            None => false,
        }
    }

    /// Strong to weak. The value becomes eligible for collection.
    pub fn demote(&mut self, rt: &mut dyn ScriptRuntime, id: SlotId) {
        let Some(slot) = self.slot_mut(id) else {
            return;
        };
        if slot.strength == Strength::Weak {
            return;
        }

        slot.strength = Strength::Weak;
        if let Some(root) = slot.root.take() {
            rt.remove_root(root);
        }
    }

    /// Empty every weak slot whose value the runtime no longer holds.
    ///
    /// Returns the ids of slots emptied by this call. Finalizers stay armed;
    /// the owner decides when to take and run them.
    pub fn sweep(&mut self, rt: &dyn ScriptRuntime) -> Vec<SlotId> {
        let mut emptied = Vec::new();

        for (index, entry) in self.entries.iter_mut().enumerate() {
            let Some(slot) = entry.slot.as_mut() else {
                continue;
            };
            if slot.strength != Strength::Weak {
                continue;
            }
            let Some(value) = slot.value else {
                continue;
            };
            if rt.is_live(value) {
                continue;
            }

            slot.value = None;
            emptied.push(SlotId::from_parts(index as u32, entry.generation));
        }

        if !emptied.is_empty() {
            tracing::trace!("Swept {} weak slots", emptied.len());
        }
        emptied
    }

    /// Disarm and return the slot's finalizer, if any.
    pub fn take_finalizer(&mut self, id: SlotId) -> Option<Finalizer> {
        self.slot_mut(id)?.finalizer.take()
    }

    /// Release the slot. Returns its finalizer if it was still armed.
    ///
    /// Removing a stale id is a no-op.
    pub fn remove(&mut self, rt: &mut dyn ScriptRuntime, id: SlotId) -> Option<Finalizer> {
        let entry = self.entries.get_mut(id.index())?;
        if entry.generation != id.generation() {
            return None;
        }
        let slot = entry.slot.take()?;

        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(id.index() as u32);
        self.len -= 1;

        if let Some(root) = slot.root {
            rt.remove_root(root);
        }

        tracing::trace!("Removed slot {:?}", id);
        slot.finalizer
    }
}

impl fmt::Debug for HandleSlotTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleSlotTable")
            .field("len", &self.len)
            .field("capacity", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{GcKind, Heap};

    #[test]
    fn test_strong_slot_keeps_value_alive() {
        let mut heap = Heap::new();
        let mut table = HandleSlotTable::new();
        let obj = heap.create_object();
        let id = table.insert(&mut heap, obj, Strength::Strong, None);

        heap.collect_garbage(GcKind::Full);
        assert!(table.sweep(&heap).is_empty());
        assert_eq!(table.get(&heap, id), Some(obj));
    }

    #[test]
    fn test_weak_slot_is_emptied_after_collection() {
        let mut heap = Heap::new();
        let mut table = HandleSlotTable::new();
        let obj = heap.create_object();
        let id = table.insert(&mut heap, obj, Strength::Weak, None);

        heap.collect_garbage(GcKind::Full);
        assert_eq!(table.get(&heap, id), None);
        assert_eq!(table.sweep(&heap), vec![id]);
        assert!(table.sweep(&heap).is_empty());
        assert!(table.contains(id));
    }

    #[test]
    fn test_promote_after_collection_does_not_resurrect() {
        let mut heap = Heap::new();
        let mut table = HandleSlotTable::new();
        let obj = heap.create_object();
        let id = table.insert(&mut heap, obj, Strength::Weak, None);

        heap.collect_garbage(GcKind::Full);
        assert!(!table.promote(&mut heap, id));
        assert_eq!(table.strength(id), Some(Strength::Strong));
        assert_eq!(heap.root_count(), 0);
    }

    #[test]
    fn test_demote_then_promote_tracks_roots() {
        let mut heap = Heap::new();
        let mut table = HandleSlotTable::new();
        let obj = heap.create_object();
        let id = table.insert(&mut heap, obj, Strength::Strong, None);
        assert_eq!(heap.root_count(), 1);

        table.demote(&mut heap, id);
        assert_eq!(heap.root_count(), 0);
        assert!(table.promote(&mut heap, id));
        assert_eq!(heap.root_count(), 1);
    }

    #[test]
    fn test_remove_returns_armed_finalizer_once() {
        let mut heap = Heap::new();
        let mut table = HandleSlotTable::new();
        let obj = heap.create_object();
        let finalizer = Finalizer::new(|_, _| {}).with_data(7u32);
        let id = table.insert(&mut heap, obj, Strength::Strong, Some(finalizer));

        assert_eq!(
            table.finalizer_data(id).and_then(|d| d.downcast_ref::<u32>()),
            Some(&7)
        );
        assert!(table.remove(&mut heap, id).is_some());
        assert!(table.remove(&mut heap, id).is_none());
        assert!(!table.contains(id));
        assert_eq!(heap.root_count(), 0);
        assert!(table.is_empty());
    }

    #[test]
    fn test_reused_index_gets_new_generation() {
        let mut heap = Heap::new();
        let mut table = HandleSlotTable::new();
        let a = table.insert(&mut heap, Value::Null, Strength::Weak, None);
        table.remove(&mut heap, a);
        let b = table.insert(&mut heap, Value::Bool(true), Strength::Weak, None);

        assert_ne!(a, b);
        assert_eq!(table.get(&heap, a), None);
        assert_eq!(table.get(&heap, b), Some(Value::Bool(true)));
    }
}
