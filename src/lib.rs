#![warn(
    clippy::pedantic,
    clippy::as_conversions,
    clippy::clone_on_ref_ptr,
    clippy::format_push_string,
    clippy::map_err_ignore,
    clippy::str_to_string,
    clippy::unwrap_used,
    elided_lifetimes_in_paths,
    noop_method_call,
    unreachable_pub,
    unused_lifetimes,
    unused_qualifications
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::return_self_not_must_use,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

//! ASCOM Alpaca driver for the Robofocus electronic focuser.
//!
//! Three layers, leaves first: the wire-level serial protocol engine
//! ([`protocol`]), the focuser state machine ([`focuser`]), and the Alpaca
//! HTTP surface ([`server`]). A byte-exact in-process simulator plugs into
//! the same protocol engine so everything above the wire is testable
//! without hardware.

pub mod config;
pub mod errors;
pub mod focuser;
pub mod protocol;
pub mod server;
pub mod settings;

pub use errors::{AscomError, AscomErrorCode, DriverError, DriverResult};
pub use server::Server;
