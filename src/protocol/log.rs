//! Bounded ring buffer of raw protocol traffic, surfaced through the GUI
//! `logs` endpoint for field debugging of serial trouble.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::protocol::packet::{Packet, FRAME_LEN};

pub const DEFAULT_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Tx,
    Rx,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecodedFrame {
    pub cmd: &'static str,
    pub value: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub direction: Direction,
    /// Raw bytes as spaced uppercase hex.
    pub raw: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decoded: Option<DecodedFrame>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug)]
pub struct ProtocolLog {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl Default for ProtocolLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ProtocolLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn record_tx(&self, bytes: &[u8]) {
        self.push(Direction::Tx, bytes, None);
    }

    pub fn record_rx(&self, bytes: &[u8]) {
        self.push(Direction::Rx, bytes, None);
    }

    pub fn record_note(&self, direction: Direction, bytes: &[u8], note: impl Into<String>) {
        self.push(direction, bytes, Some(note.into()));
    }

    fn push(&self, direction: Direction, bytes: &[u8], note: Option<String>) {
        let decoded = <&[u8; FRAME_LEN]>::try_from(bytes)
            .ok()
            .and_then(|frame| Packet::decode(frame).ok())
            .map(|packet| DecodedFrame {
                cmd: packet.cmd.name(),
                value: packet.value,
            });

        let entry = LogEntry {
            timestamp: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default(),
            direction,
            raw: hex(bytes),
            decoded,
            note,
        };

        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;

    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{byte:02X}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::Command;

    #[test]
    fn frames_are_decoded_and_hex_dumped() {
        let log = ProtocolLog::default();
        log.record_tx(&Packet::new(Command::Goto, 2500).encode());
        log.record_rx(b"I");

        let entries = log.snapshot();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].decoded.as_ref().map(|d| d.cmd), Some("FG"));
        assert_eq!(entries[0].decoded.as_ref().map(|d| d.value), Some(2500));
        assert!(entries[0].raw.starts_with("46 47 30 30 32 35 30 30"));
        assert!(entries[1].decoded.is_none());
        assert_eq!(entries[1].raw, "49");
    }

    #[test]
    fn ring_buffer_is_bounded() {
        let log = ProtocolLog::new(4);
        for _ in 0..10 {
            log.record_rx(b"O");
        }
        assert_eq!(log.len(), 4);
    }
}
