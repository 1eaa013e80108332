//! Focuser state machine: sequences moves, caches position, and enforces
//! limit and concurrency invariants on top of the protocol engine.

mod controller;

pub use controller::{FocuserController, StatusSnapshot};
