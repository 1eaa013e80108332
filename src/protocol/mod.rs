//! Wire-level Robofocus protocol: 9-byte framing, checksum, retry and the
//! asynchronous movement-status stream, plus the in-process simulator.

pub mod log;
pub mod packet;
pub mod port;
pub mod scan;
pub mod simulator;

pub use log::ProtocolLog;
pub use packet::{Command, Packet};
pub use port::{Backend, DynSerial, ProtocolPort};
pub use simulator::Simulator;

/// Unsolicited single-byte status markers emitted by the hardware while the
/// motor is running. They arrive outside any frame and are never part of a
/// packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionEvent {
    /// One step inward (`I`).
    Inward,
    /// One step outward (`O`).
    Outward,
    /// Motion terminator (`F`), usually followed by an `FD` packet carrying
    /// the final position.
    Finished { position: Option<u32> },
}
