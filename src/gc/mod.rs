//! Native references to garbage-collected values.
//!
//! Native code holds runtime values through reference-counted references.
//! The count drives the strength of the underlying handle slot: counted
//! references keep their value alive, uncounted ones only observe it and get
//! a one-shot finalize message when the runtime collects it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ReferenceManager                                           │
//! │  ├── ReferenceId → { slot, ref_count, owns_slot_deletion }  │
//! │  ├── ref 0→1 promotes, unref 1→0 demotes                    │
//! │  ├── on_collection(): finalize emptied slots exactly once   │
//! │  └── teardown(): finalize self-owned references             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  HandleSlotTable                                            │
//! │  ├── SlotId → { value, strength, root, finalizer }          │
//! │  ├── Strong: holds a persistent root in the runtime         │
//! │  └── Weak: emptied by sweep() once the value is collected   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ScriptRuntime (add_root / remove_root / is_live)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let id = engine.create_reference(value, 0, Some(Finalizer::new(|data, _hint| {
//!     // runs once, after the value is collected
//! })))?;
//!
//! engine.reference_ref(id)?;   // strong
//! engine.reference_unref(id)?; // weak again
//!
//! if let Some(value) = engine.reference_get(id)? {
//!     // still alive
//! }
//! engine.delete_reference(id);
//! ```

mod handle_slot;
mod reference;

pub use handle_slot::{
    FinalizeCallback, Finalizer, HandleSlotTable, SlotId, Strength, UserData,
};
pub use reference::{FinalizeReport, ReferenceId, ReferenceManager};
