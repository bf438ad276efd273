//! Reference-counted native references over handle slots.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;

use super::handle_slot::{Finalizer, HandleSlotTable, SlotId, Strength};
use crate::error::{EngineError, Result};
use crate::runtime::{ScriptRuntime, Value};

/// Generation-checked reference identifier. Stale ids are rejected.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReferenceId(u64);

impl ReferenceId {
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

impl fmt::Debug for ReferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReferenceId({}@{})", self.index(), self.generation())
    }
}

struct Reference {
    slot: SlotId,
    ref_count: u32,
    /// Removed from the manager right after its finalize message
    owns_slot_deletion: bool,
    final_run: bool,
}

#[derive(Default)]
struct Entry {
    generation: u32,
    reference: Option<Reference>,
}

/// Result of delivering finalize messages after a collection pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FinalizeReport {
    /// Weak slots emptied by the pass
    pub emptied: usize,
    /// Finalizer callbacks invoked
    pub finalized: usize,
    /// Self-owned references removed after finalization
    pub self_deleted: usize,
}

fn lookup(entries: &[Entry], id: ReferenceId) -> Result<&Reference> {
    entries
        .get(id.index())
        .filter(|e| e.generation == id.generation())
        .and_then(|e| e.reference.as_ref())
        .ok_or_else(|| EngineError::invalid_arg(format!("stale reference {:?}", id)))
}

fn lookup_mut(entries: &mut [Entry], id: ReferenceId) -> Result<&mut Reference> {
    entries
        .get_mut(id.index())
        .filter(|e| e.generation == id.generation())
        .and_then(|e| e.reference.as_mut())
        .ok_or_else(|| EngineError::invalid_arg(format!("stale reference {:?}", id)))
}

/// Owns every reference of one engine together with their slots.
///
/// `ref_count == 0` exactly when the slot is weak. Self-owned references are
/// also tracked for teardown when the engine goes away.
#[derive(Default)]
pub struct ReferenceManager {
    slots: HandleSlotTable,
    entries: Vec<Entry>,
    free: Vec<u32>,
    by_slot: HashMap<SlotId, ReferenceId>,
    self_owned: HashSet<ReferenceId>,
}

impl ReferenceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live references.
    pub fn len(&self) -> usize {
        self.by_slot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_slot.is_empty()
    }

    pub fn self_owned_len(&self) -> usize {
        self.self_owned.len()
    }

    pub fn slots(&self) -> &HandleSlotTable {
        &self.slots
    }

    /// Wrap `value`. With `initial_ref_count == 0` the slot starts weak and
    /// the finalizer is armed right away.
    pub fn create(
        &mut self,
        rt: &mut dyn ScriptRuntime,
        value: Value,
        initial_ref_count: u32,
        finalizer: Option<Finalizer>,
        owns_slot_deletion: bool,
    ) -> Result<ReferenceId> {
        if !rt.is_live(value) {
            return Err(EngineError::invalid_arg(
                "cannot reference a collected value",
            ));
        }

        let strength = if initial_ref_count == 0 {
            Strength::Weak
        } else {
            Strength::Strong
        };
        let slot = self.slots.insert(rt, value, strength, finalizer);

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.entries.push(Entry::default());
                (self.entries.len() - 1) as u32
            }
        };
        let entry = &mut self.entries[index as usize];
        entry.reference = Some(Reference {
            slot,
            ref_count: initial_ref_count,
            owns_slot_deletion,
            final_run: false,
        });

        let id = ReferenceId::from_parts(index, entry.generation);
        self.by_slot.insert(slot, id);
        if owns_slot_deletion {
            self.self_owned.insert(id);
        }

        tracing::trace!(
            "Created reference {:?} (count={}, self_owned={})",
            id,
            initial_ref_count,
            owns_slot_deletion
        );
        Ok(id)
    }

    /// Increment. The 0 to 1 transition promotes the slot to strong.
    pub fn add_ref(&mut self, rt: &mut dyn ScriptRuntime, id: ReferenceId) -> Result<u32> {
        let reference = lookup_mut(&mut self.entries, id)?;
        reference.ref_count = reference
            .ref_count
            .checked_add(1)
            .ok_or_else(|| EngineError::invalid_arg("reference count overflow"))?;

        if reference.ref_count == 1 {
            self.slots.promote(rt, reference.slot);
        }
        Ok(reference.ref_count)
    }

    /// Decrement, saturating at 0. The 1 to 0 transition demotes the slot to
    /// weak.
    pub fn unref(&mut self, rt: &mut dyn ScriptRuntime, id: ReferenceId) -> Result<u32> {
        let reference = lookup_mut(&mut self.entries, id)?;
        if reference.ref_count == 0 {
            return Ok(0);
        }

        reference.ref_count -= 1;
        if reference.ref_count == 0 {
            self.slots.demote(rt, reference.slot);
        }
        Ok(reference.ref_count)
    }

    /// Current value, `None` once collected.
    pub fn get(&self, rt: &dyn ScriptRuntime, id: ReferenceId) -> Result<Option<Value>> {
        let reference = lookup(&self.entries, id)?;
        Ok(self.slots.get(rt, reference.slot))
    }

    pub fn count(&self, id: ReferenceId) -> Result<u32> {
        lookup(&self.entries, id).map(|r| r.ref_count)
    }

    pub fn final_run(&self, id: ReferenceId) -> Result<bool> {
        lookup(&self.entries, id).map(|r| r.final_run)
    }

    pub fn owns_slot_deletion(&self, id: ReferenceId) -> Result<bool> {
        lookup(&self.entries, id).map(|r| r.owns_slot_deletion)
    }

    /// Finalizer user data, `None` once the finalizer ran or if there is none.
    pub fn data(&self, id: ReferenceId) -> Result<Option<&dyn Any>> {
        let reference = lookup(&self.entries, id)?;
        Ok(self.slots.finalizer_data(reference.slot))
    }

    pub fn strength(&self, id: ReferenceId) -> Result<Strength> {
        let reference = lookup(&self.entries, id)?;
        self.slots
            .strength(reference.slot)
            .ok_or_else(|| EngineError::Generic(format!("reference {:?} lost its slot", id)))
    }

    /// Release the reference and its slot. An armed finalizer that has not
    /// run yet is invoked before this returns.
    ///
    /// Returns false for stale ids, which makes a repeated delete a no-op.
    pub fn delete(&mut self, rt: &mut dyn ScriptRuntime, id: ReferenceId) -> bool {
        let Some(entry) = self
            .entries
            .get_mut(id.index())
            .filter(|e| e.generation == id.generation())
        else {
            return false;
        };
        let Some(reference) = entry.reference.take() else {
            return false;
        };

        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(id.index() as u32);
        self.by_slot.remove(&reference.slot);
        self.self_owned.remove(&id);

        let finalizer = self.slots.remove(rt, reference.slot);
        tracing::trace!("Deleted reference {:?}", id);

        if let Some(finalizer) = finalizer {
            if !reference.final_run {
                finalizer.invoke();
            }
        }
        true
    }

    /// Deliver finalize messages for every weak slot the last collection
    /// pass emptied.
    ///
    /// Each message is delivered once: the finalizer is taken out of its slot
    /// before it runs. Self-owned references are removed afterwards.
    pub fn on_collection(&mut self, rt: &mut dyn ScriptRuntime) -> FinalizeReport {
        let emptied = self.slots.sweep(rt);
        let mut report = FinalizeReport {
            emptied: emptied.len(),
            ..Default::default()
        };

        for slot in emptied {
            let Some(&id) = self.by_slot.get(&slot) else {
                continue;
            };

            if let Some(finalizer) = self.slots.take_finalizer(slot) {
                finalizer.invoke();
                report.finalized += 1;
            }

            let Ok(reference) = lookup_mut(&mut self.entries, id) else {
                continue;
            };
            reference.final_run = true;

            if reference.owns_slot_deletion && self.delete(rt, id) {
                report.self_deleted += 1;
            }
        }

        report
    }

    /// Engine shutdown: finalize self-owned references, then release the
    /// slots of creator-owned ones without running their finalizers.
    ///
    /// Returns the number of self-owned references torn down.
    pub fn teardown(&mut self, rt: &mut dyn ScriptRuntime) -> usize {
        let mut owned: Vec<ReferenceId> = self.self_owned.iter().copied().collect();
        owned.sort();

        let mut torn_down = 0;
        for id in owned {
            if self.delete(rt, id) {
                torn_down += 1;
            }
        }

        let leftover: Vec<ReferenceId> = self.by_slot.values().copied().collect();
        if !leftover.is_empty() {
            log::debug!(
                "Releasing {} creator-owned references at teardown",
                leftover.len()
            );
        }
        for id in leftover {
            let Ok(reference) = lookup_mut(&mut self.entries, id) else {
                continue;
            };
            // Dropped without invoking: only self-owned references are
            // finalized by the engine.
            reference.final_run = true;
            let slot = reference.slot;
            drop(self.slots.take_finalizer(slot));
            self.delete(rt, id);
        }

        torn_down
    }
}

impl fmt::Debug for ReferenceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceManager")
            .field("references", &self.len())
            .field("self_owned", &self.self_owned.len())
            .field("slots", &self.slots)
            .finish()
    }
}
