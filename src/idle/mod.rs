//! Idle-driven collection heuristic.
//!
//! ## How it works
//!
//! 1. The event loop reports every blocking wait as an idle start/end pair
//! 2. A timer thread ticks [`IdleMonitor::interval_monitor`] once a second
//! 3. Each tick pushes the tick's idle-notify count into a small ring buffer
//!    and recomputes the idle ratio since the last reset
//! 4. A collection is requested when the ratio stayed above the threshold
//!    for consecutive ticks, or when a backgrounded engine has been quiet
//!    for several cycles
//! 5. After a trigger the window resets and the next tick is postponed
//!
//! A cooldown between triggers bounds how often a full collection can be
//! requested, whatever the loop does.

mod monitor;
mod ring_buffer;
mod timer;

pub use monitor::{GcRequester, IdleMonitor, IdleSnapshot};
pub use ring_buffer::RingBuffer;
pub use timer::IntervalTimer;
