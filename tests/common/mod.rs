#![allow(dead_code)]

use std::sync::Once;
use std::sync::mpsc;
use std::time::Duration;

use openworkers_native_engine::{Engine, EngineConfig, EngineRegistry};

static LOGGER: Once = Once::new();

/// Route `log` output through env_logger (RUST_LOG=debug to see it).
pub fn init_logger() {
    LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Small pool, no idle timer thread.
pub fn test_config() -> EngineConfig {
    EngineConfig::default()
        .with_worker_threads(2)
        .with_idle_monitor(false)
}

pub fn new_engine(config: EngineConfig) -> (Engine, EngineRegistry) {
    init_logger();
    let registry = EngineRegistry::new();
    let engine = Engine::new(config, &registry).unwrap();
    (engine, registry)
}

/// One-shot latch that worker closures can block on.
pub struct Gate {
    tx: mpsc::Sender<()>,
    rx: Option<mpsc::Receiver<()>>,
}

impl Gate {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self { tx, rx: Some(rx) }
    }

    /// Receiver half, moved into the blocking closure.
    pub fn waiter(&mut self) -> GateWaiter {
        GateWaiter(self.rx.take().expect("gate waiter already taken"))
    }

    pub fn open(&self) {
        let _ = self.tx.send(());
    }
}

pub struct GateWaiter(mpsc::Receiver<()>);

impl GateWaiter {
    pub fn wait(&self) {
        let _ = self.0.recv_timeout(Duration::from_secs(10));
    }
}
