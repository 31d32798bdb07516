//! View scheduler runner -- drives views to materialization, one cycle at a time.
//!
//! Split into focused submodules:
//! - `core`: Scheduler struct, constructor, and accessor methods
//! - `cancel`: cooperative cancellation handle
//! - `scheduling`: per-cycle view table, eligibility, cache hits, selection
//! - `execution`: cycle loop, dispatch monitors, and the long-running loop

mod cancel;
mod core;
mod execution;
mod scheduling;
#[cfg(test)]
mod tests;

pub use self::cancel::CancelHandle;
pub use self::core::Scheduler;
