//! Native engine bridge: references, async work and idle-driven collection
//! around a garbage-collected script runtime.

pub mod config;
pub mod engine;
pub mod error;
pub mod event_loop;
pub mod gc;
pub mod idle;
pub mod platform;
pub mod runtime;
pub mod work;

// Core API
pub use engine::{CleanupHookId, CollectionReport, Engine, EngineHandle};
pub use event_loop::{LoopMode, PostTask};

pub use config::{EngineConfig, IdleConfig};
pub use error::{EngineError, ExtendedErrorInfo, Result, Status};
pub use gc::{FinalizeReport, Finalizer, ReferenceId, Strength, UserData};
pub use idle::IdleSnapshot;
pub use platform::{EngineId, EngineRegistry};
pub use runtime::{GcKind, GcOutcome, Heap, ScriptRuntime, Value, ValueType};
pub use work::{Qos, WorkData, WorkId, WorkState};
