//! The 9-byte Robofocus frame: two ASCII command letters, six ASCII decimal
//! digits and a binary checksum byte equal to the sum of the first eight
//! bytes modulo 256.

use thiserror::Error;

/// Total frame length on the wire.
pub const FRAME_LEN: usize = 9;

/// Largest value representable in the six-digit field.
pub const VALUE_MAX: u32 = 999_999;

/// Largest backlash magnitude the hardware accepts.
pub const BACKLASH_MAX: i16 = 255;

/// Smallest value `FS` actually applies; 0 and 1 make the hardware echo the
/// current counter instead of setting it.
pub const SYNC_MIN: u32 = 2;

/// Wire direction digit for outward backlash compensation.
const BACKLASH_OUTWARD: u32 = 1;

/// Recognized two-letter command prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// `FV` - read firmware version.
    Firmware,
    /// `FG` - goto absolute position (value 0 queries the position).
    Goto,
    /// `FD` - position reply or end-of-motion broadcast.
    Position,
    /// `FI` - move inward by N steps.
    StepIn,
    /// `FO` - move outward by N steps.
    StepOut,
    /// `FT` - read the raw temperature ADC.
    Temperature,
    /// `FB` - read or set backlash compensation.
    Backlash,
    /// `FL` - read or set the maximum travel stored in hardware.
    MaxTravel,
    /// `FS` - sync the position counter without moving.
    SyncCounter,
    /// `FQ` - halt motion. Write-only; completion arrives as `F` + `FD`.
    Halt,
    /// `FP` - read or toggle the power-module switches.
    PowerModule,
}

impl Command {
    pub const fn letters(self) -> [u8; 2] {
        match self {
            Self::Firmware => *b"FV",
            Self::Goto => *b"FG",
            Self::Position => *b"FD",
            Self::StepIn => *b"FI",
            Self::StepOut => *b"FO",
            Self::Temperature => *b"FT",
            Self::Backlash => *b"FB",
            Self::MaxTravel => *b"FL",
            Self::SyncCounter => *b"FS",
            Self::Halt => *b"FQ",
            Self::PowerModule => *b"FP",
        }
    }

    pub fn from_letters(raw: [u8; 2]) -> Option<Self> {
        Some(match &raw {
            b"FV" => Self::Firmware,
            b"FG" => Self::Goto,
            b"FD" => Self::Position,
            b"FI" => Self::StepIn,
            b"FO" => Self::StepOut,
            b"FT" => Self::Temperature,
            b"FB" => Self::Backlash,
            b"FL" => Self::MaxTravel,
            b"FS" => Self::SyncCounter,
            b"FQ" => Self::Halt,
            b"FP" => Self::PowerModule,
            _ => return None,
        })
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Firmware => "FV",
            Self::Goto => "FG",
            Self::Position => "FD",
            Self::StepIn => "FI",
            Self::StepOut => "FO",
            Self::Temperature => "FT",
            Self::Backlash => "FB",
            Self::MaxTravel => "FL",
            Self::SyncCounter => "FS",
            Self::Halt => "FQ",
            Self::PowerModule => "FP",
        }
    }

    /// Command prefix expected on the reply to a request, or `None` for
    /// write-only commands. Goto and the relative moves are answered with a
    /// position (`FD`) packet; everything else echoes its own prefix.
    pub const fn reply(self) -> Option<Self> {
        match self {
            Self::Goto | Self::StepIn | Self::StepOut => Some(Self::Position),
            Self::Halt => None,
            other => Some(other),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub cmd: Command,
    pub value: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("checksum mismatch: expected {expected:#04x}, found {found:#04x}")]
    Checksum { expected: u8, found: u8 },
    #[error("unrecognized command prefix {:?}", String::from_utf8_lossy(.0))]
    UnknownCommand([u8; 2]),
    #[error("non-digit characters in the value field")]
    BadDigits,
}

/// Sum of the eight payload bytes modulo 256.
pub fn checksum(payload: &[u8; 8]) -> u8 {
    payload.iter().fold(0_u8, |acc, byte| acc.wrapping_add(*byte))
}

impl Packet {
    /// Builds a frame payload. Callers validate ranges at the API boundary;
    /// a value beyond six digits is a programming error here.
    pub fn new(cmd: Command, value: u32) -> Self {
        assert!(value <= VALUE_MAX, "packet value out of range: {value}");
        Self { cmd, value }
    }

    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut frame = [0_u8; FRAME_LEN];
        frame[..2].copy_from_slice(&self.cmd.letters());
        let mut rest = self.value;
        for slot in frame[2..8].iter_mut().rev() {
            *slot = b'0' + u8::try_from(rest % 10).unwrap_or(0);
            rest /= 10;
        }
        let payload: [u8; 8] = frame[..8].try_into().unwrap_or([0; 8]);
        frame[8] = checksum(&payload);
        frame
    }

    pub fn decode(frame: &[u8; FRAME_LEN]) -> Result<Self, FrameError> {
        let payload: [u8; 8] = frame[..8].try_into().unwrap_or([0; 8]);
        let expected = checksum(&payload);
        if frame[8] != expected {
            return Err(FrameError::Checksum {
                expected,
                found: frame[8],
            });
        }
        let cmd = Command::from_letters([frame[0], frame[1]])
            .ok_or(FrameError::UnknownCommand([frame[0], frame[1]]))?;
        let mut value = 0_u32;
        for byte in &frame[2..8] {
            if !byte.is_ascii_digit() {
                return Err(FrameError::BadDigits);
            }
            value = value * 10 + u32::from(byte - b'0');
        }
        Ok(Self { cmd, value })
    }
}

/// Signed backlash (INDI convention: negative = inward bias) to the wire
/// form: digit 1 is the direction mode (0 inward, 1 outward), digits 4-6
/// the magnitude.
pub fn backlash_to_wire(steps: i16) -> u32 {
    let magnitude = u32::from(steps.unsigned_abs().min(255));
    if steps >= 0 {
        BACKLASH_OUTWARD * 100_000 + magnitude
    } else {
        magnitude
    }
}

pub fn backlash_from_wire(value: u32) -> i16 {
    let magnitude = i16::try_from((value % 1_000).min(255)).unwrap_or(BACKLASH_MAX);
    if value / 100_000 == BACKLASH_OUTWARD {
        magnitude
    } else {
        -magnitude
    }
}

/// `FT` replies carry a raw ADC value; physical temperature is
/// `raw / 2 - 273.15` degrees Celsius. Not configurable.
pub fn celsius_from_raw(raw: u32) -> f64 {
    f64::from(raw) / 2.0 - 273.15
}

/// Inverse of [`celsius_from_raw`], used by the simulator.
#[allow(clippy::as_conversions, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn raw_from_celsius(celsius: f64) -> u32 {
    let raw = ((celsius + 273.15) * 2.0).round();
    if raw.is_sign_negative() {
        0
    } else {
        // Non-negative, in range, round number.
        raw.min(f64::from(VALUE_MAX)) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_sum_mod_256() {
        assert_eq!(checksum(b"FG002500"), 180);
        assert_eq!(checksum(b"FV000000"), (70 + 86 + 6 * 48) as u8);
    }

    #[test]
    fn encode_produces_six_zero_padded_digits() {
        let frame = Packet::new(Command::Goto, 2500).encode();
        assert_eq!(&frame[..8], b"FG002500");
        assert_eq!(frame[8], 180);

        let frame = Packet::new(Command::SyncCounter, 999_999).encode();
        assert_eq!(&frame[..8], b"FS999999");

        let frame = Packet::new(Command::Firmware, 0).encode();
        assert_eq!(&frame[..8], b"FV000000");
    }

    #[test]
    fn decode_roundtrips_all_commands() {
        for cmd in [
            Command::Firmware,
            Command::Goto,
            Command::Position,
            Command::StepIn,
            Command::StepOut,
            Command::Temperature,
            Command::Backlash,
            Command::MaxTravel,
            Command::SyncCounter,
            Command::Halt,
            Command::PowerModule,
        ] {
            let packet = Packet::new(cmd, 123_456);
            assert_eq!(Packet::decode(&packet.encode()), Ok(packet));
        }
    }

    #[test]
    fn decode_rejects_bad_checksum() {
        let mut frame = Packet::new(Command::Position, 30_000).encode();
        frame[8] = frame[8].wrapping_add(1);
        assert!(matches!(
            Packet::decode(&frame),
            Err(FrameError::Checksum { .. })
        ));
    }

    #[test]
    fn decode_rejects_unknown_prefix_and_bad_digits() {
        let mut frame = Packet::new(Command::Goto, 0).encode();
        frame[1] = b'Z';
        frame[8] = checksum(&frame[..8].try_into().expect("payload"));
        assert_eq!(
            Packet::decode(&frame),
            Err(FrameError::UnknownCommand(*b"FZ"))
        );

        let mut frame = Packet::new(Command::Goto, 0).encode();
        frame[4] = b'x';
        frame[8] = checksum(&frame[..8].try_into().expect("payload"));
        assert_eq!(Packet::decode(&frame), Err(FrameError::BadDigits));
    }

    #[test]
    fn reply_prefix_table() {
        assert_eq!(Command::Goto.reply(), Some(Command::Position));
        assert_eq!(Command::StepIn.reply(), Some(Command::Position));
        assert_eq!(Command::Backlash.reply(), Some(Command::Backlash));
        assert_eq!(Command::Halt.reply(), None);
    }

    #[test]
    fn backlash_wire_encoding_follows_direction_digit() {
        // Inward bias: direction digit 0, magnitude in the last three digits.
        assert_eq!(backlash_to_wire(-20), 20);
        // Outward bias: direction digit 1.
        assert_eq!(backlash_to_wire(20), 100_020);
        assert_eq!(backlash_to_wire(0), 100_000);
        assert_eq!(backlash_to_wire(-255), 255);

        for steps in [-255, -20, -1, 0, 1, 20, 255] {
            assert_eq!(backlash_from_wire(backlash_to_wire(steps)), steps);
        }
    }

    #[test]
    fn temperature_conversion_is_fixed() {
        assert!((celsius_from_raw(0) - -273.15).abs() < 1e-9);
        assert!((celsius_from_raw(600) - 26.85).abs() < 1e-9);
        assert_eq!(raw_from_celsius(26.85), 600);
        assert_eq!(raw_from_celsius(16.85), 580);
    }
}
