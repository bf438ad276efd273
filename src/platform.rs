//! Process-level context shared by every engine.
//!
//! The only process-wide static is the monotonic clock origin. Engine
//! liveness lives in an [`EngineRegistry`] the host creates once and hands
//! to each engine it builds.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

static PROCESS_START: OnceLock<Instant> = OnceLock::new();

/// Milliseconds elapsed on the monotonic clock since first use.
///
/// All idle monitor timestamps are expressed on this clock.
pub fn monotonic_millis() -> i64 {
    let start = PROCESS_START.get_or_init(Instant::now);
    i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX)
}

/// Identity of one engine within a registry.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineId(u64);

impl EngineId {
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EngineId({})", self.0)
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine-{}", self.0)
    }
}

struct RegistryInner {
    next_id: AtomicU64,
    alive: Mutex<HashSet<EngineId>>,
}

/// Registry of live engines.
///
/// Cheap to clone; all clones observe the same set. Liveness checks are
/// safe from any thread.
#[derive(Clone)]
pub struct EngineRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                next_id: AtomicU64::new(1),
                alive: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub(crate) fn register(&self) -> EngineId {
        let id = EngineId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .alive
            .lock()
            .expect("engine registry poisoned")
            .insert(id);
        log::debug!("Registered {}", id);
        id
    }

    pub(crate) fn unregister(&self, id: EngineId) -> bool {
        let removed = self
            .inner
            .alive
            .lock()
            .expect("engine registry poisoned")
            .remove(&id);
        log::debug!("Unregistered {} (was registered: {})", id, removed);
        removed
    }

    pub fn is_alive(&self, id: EngineId) -> bool {
        self.inner
            .alive
            .lock()
            .expect("engine registry poisoned")
            .contains(&id)
    }

    /// Number of live engines.
    pub fn len(&self) -> usize {
        self.inner
            .alive
            .lock()
            .expect("engine registry poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("alive", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_unregister() {
        let registry = EngineRegistry::new();
        let a = registry.register();
        let b = registry.register();

        assert_ne!(a, b);
        assert!(registry.is_alive(a));
        assert_eq!(registry.len(), 2);

        assert!(registry.unregister(a));
        assert!(!registry.unregister(a));
        assert!(!registry.is_alive(a));
        assert!(registry.is_alive(b));
    }

    #[test]
    fn test_clones_share_state() {
        let registry = EngineRegistry::new();
        let clone = registry.clone();
        let id = registry.register();
        assert!(clone.is_alive(id));
    }

    #[test]
    fn test_monotonic_clock_does_not_go_backwards() {
        let a = monotonic_millis();
        let b = monotonic_millis();
        assert!(b >= a);
    }
}
