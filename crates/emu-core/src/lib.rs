//! Core introspection types for the minicomputer emulator.
//!
//! The engine is driven by a single virtual clock; `Ticks` is the unit every
//! cycle counter is expressed in. `Observable` is the debugger-facing query
//! surface — component state a front end wants to display is reachable
//! through it without touching emulation state.

mod observable;
mod ticks;

pub use observable::{Observable, Value};
pub use ticks::Ticks;
