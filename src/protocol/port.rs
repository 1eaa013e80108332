//! The transport engine: framed serial exchange with checksum validation,
//! retry, and draining of the asynchronous movement-status stream.
//!
//! The engine is written against a type-erased async byte channel so the
//! same framing and retry code runs over a real RS-232 port and over the
//! in-process simulator pipe.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::errors::{DriverError, DriverResult};
use crate::protocol::log::{Direction, ProtocolLog};
use crate::protocol::packet::{Command, FrameError, Packet, FRAME_LEN};
use crate::protocol::simulator::Simulator;
use crate::protocol::MotionEvent;

/// Anything that can carry the byte protocol: a `tokio_serial::SerialStream`
/// or one end of an in-memory duplex pipe.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

pub type DynSerial = Box<dyn SerialPortIO>;

/// Attempts per logical command, including the first.
pub const MAX_ATTEMPTS: u32 = 3;

/// Back-off between attempts; the hardware needs a quiet period before it
/// accepts a resend.
pub const RETRY_DELAY: Duration = Duration::from_millis(500);

/// How long to wait for the `FD` packet trailing a motion terminator.
const FINISH_GRACE: Duration = Duration::from_millis(250);

/// Quiet window that ends an input-buffer flush.
const FLUSH_QUIET: Duration = Duration::from_millis(20);

/// The two transport variants. The controller and everything above it never
/// look inside.
#[derive(Debug, Clone)]
pub enum Backend {
    Serial { port: String, baud: u32 },
    Simulator(Arc<Simulator>),
}

impl Backend {
    /// Serial port name, when this backend is real hardware.
    pub fn port_name(&self) -> Option<&str> {
        match self {
            Self::Serial { port, .. } => Some(port),
            Self::Simulator(_) => None,
        }
    }
}

/// Reasons to resend a command within the retry budget.
#[derive(Debug)]
enum RetryReason {
    Timeout,
    Garbled(FrameError),
    /// Well-formed frame whose prefix is not the one we asked for, e.g. a
    /// stray move-completion `FD` arriving in place of an `FB` reply.
    UnexpectedReply(Command),
}

pub struct ProtocolPort {
    channel: Mutex<Option<DynSerial>>,
    /// Status bytes observed by the framing loop between a command write and
    /// its reply; drained by the motion monitor or by the next caller.
    events: parking_lot::Mutex<VecDeque<MotionEvent>>,
    command_timeout: Duration,
    attempts: u32,
    retries: AtomicU64,
    log: Arc<ProtocolLog>,
}

impl std::fmt::Debug for ProtocolPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolPort")
            .field("command_timeout", &self.command_timeout)
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

impl ProtocolPort {
    pub fn new(command_timeout: Duration, log: Arc<ProtocolLog>) -> Self {
        Self {
            channel: Mutex::new(None),
            events: parking_lot::Mutex::new(VecDeque::new()),
            command_timeout,
            attempts: MAX_ATTEMPTS,
            retries: AtomicU64::new(0),
            log,
        }
    }

    /// Single-attempt variant used by the port scanner, where unresponsive
    /// ports are the common case and the full retry budget would make a
    /// scan take tens of seconds.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Opens the backend, flushes both directions and validates the device
    /// with an `FV` handshake. Returns the firmware string.
    pub async fn connect(&self, backend: &Backend) -> DriverResult<String> {
        let mut guard = self.channel.lock().await;
        if guard.is_some() {
            return Err(DriverError::InvalidOperation(
                "transport is already connected".to_owned(),
            ));
        }

        let mut io: DynSerial = match backend {
            Backend::Serial { port, baud } => open_serial(port, *baud).await?,
            Backend::Simulator(simulator) => simulator.attach(),
        };

        self.flush_input(&mut io).await;
        io.flush().await?;

        let reply = self.exchange_on(&mut io, Command::Firmware, 0).await?;
        let firmware = format!("{:06}", reply.value);

        *guard = Some(io);
        tracing::info!(%firmware, "transport handshake complete");
        Ok(firmware)
    }

    /// Closes the channel. Idempotent.
    pub async fn disconnect(&self) {
        *self.channel.lock().await = None;
        self.events.lock().clear();
    }

    pub async fn is_connected(&self) -> bool {
        self.channel.lock().await.is_some()
    }

    /// Sends one command and returns its validated reply. Blocking and
    /// exclusive: at most one exchange is in flight per transport.
    pub async fn exchange(&self, cmd: Command, value: u32) -> DriverResult<Packet> {
        let mut guard = self.channel.lock().await;
        let io = guard.as_mut().ok_or(DriverError::NotConnected)?;
        let result = self.exchange_on(io, cmd, value).await;
        if matches!(result, Err(DriverError::Io(_))) {
            // Channel is gone; callers see NotConnected until reconnect.
            *guard = None;
        }
        result
    }

    /// Writes a command without waiting for a reply. Used for `FQ`, whose
    /// acknowledgment arrives as an `F` + `FD` broadcast.
    pub async fn send_only(&self, cmd: Command, value: u32) -> DriverResult<()> {
        let mut guard = self.channel.lock().await;
        let io = guard.as_mut().ok_or(DriverError::NotConnected)?;
        let frame = Packet::new(cmd, value).encode();
        self.log.record_tx(&frame);
        io.write_all(&frame).await?;
        io.flush().await?;
        Ok(())
    }

    /// Non-blocking sweep of buffered status bytes, combined with whatever
    /// the framing loop has already put aside.
    pub async fn drain_events(&self) -> DriverResult<Vec<MotionEvent>> {
        let mut out = self.take_events();
        let mut guard = self.channel.lock().await;
        let Some(io) = guard.as_mut() else {
            return Ok(out);
        };

        let mut failure = None;
        loop {
            let mut byte = [0_u8; 1];
            match tokio::time::timeout(Duration::from_millis(1), io.read(&mut byte)).await {
                Err(_) => break,
                Ok(Ok(0)) => break,
                Ok(Ok(_)) => match byte[0] {
                    b'I' => {
                        self.log.record_rx(&byte);
                        out.push(MotionEvent::Inward);
                    }
                    b'O' => {
                        self.log.record_rx(&byte);
                        out.push(MotionEvent::Outward);
                    }
                    b'F' => {
                        self.log.record_rx(&byte);
                        let position = self.complete_finish_frame(io).await;
                        out.push(MotionEvent::Finished { position });
                    }
                    other => {
                        tracing::debug!(byte = other, "skipping noise byte");
                        self.log.record_note(Direction::Rx, &byte, "noise");
                    }
                },
                Ok(Err(err)) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        if let Some(err) = failure {
            *guard = None;
            return Err(err.into());
        }
        Ok(out)
    }

    /// Pops the events the framing loop has recorded so far.
    pub fn take_events(&self) -> Vec<MotionEvent> {
        self.events.lock().drain(..).collect()
    }

    /// Number of command retransmissions since the port was created.
    pub fn retry_count(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    async fn exchange_on(&self, io: &mut DynSerial, cmd: Command, value: u32) -> DriverResult<Packet> {
        let expected = cmd.reply().ok_or_else(|| {
            DriverError::Protocol(format!("{cmd} does not solicit a reply"))
        })?;
        let frame = Packet::new(cmd, value).encode();

        let mut last_reason = RetryReason::Timeout;
        for attempt in 1..=self.attempts {
            if attempt > 1 {
                self.retries.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%cmd, attempt, reason = ?last_reason, "retrying command");
                tokio::time::sleep(RETRY_DELAY).await;
                self.flush_input(io).await;
            }

            self.log.record_tx(&frame);
            io.write_all(&frame).await?;
            io.flush().await?;

            match self.read_reply(io, expected).await? {
                Ok(packet) => return Ok(packet),
                Err(reason) => last_reason = reason,
            }
        }

        Err(match last_reason {
            RetryReason::Timeout => DriverError::SerialTimeout {
                cmd: cmd.name(),
                attempts: self.attempts,
            },
            RetryReason::Garbled(err) => {
                DriverError::Protocol(format!("{cmd} reply invalid after {} attempts: {err}", self.attempts))
            }
            RetryReason::UnexpectedReply(got) => DriverError::Protocol(format!(
                "expected {expected} reply to {cmd}, hardware keeps answering {got}"
            )),
        })
    }

    /// Collects one reply frame, byte by byte. Status bytes seen before the
    /// frame are recorded as motion events; other out-of-frame bytes are
    /// noise. Frame sync starts at the first `F`.
    async fn read_reply(
        &self,
        io: &mut DynSerial,
        expected: Command,
    ) -> DriverResult<Result<Packet, RetryReason>> {
        let deadline = Instant::now() + self.command_timeout;
        loop {
            let Some(byte) = read_byte_until(io, deadline).await? else {
                self.log
                    .record_note(Direction::Rx, &[], format!("timeout waiting for {expected}"));
                return Ok(Err(RetryReason::Timeout));
            };
            match byte {
                b'I' => {
                    self.log.record_rx(&[byte]);
                    self.events.lock().push_back(MotionEvent::Inward);
                }
                b'O' => {
                    self.log.record_rx(&[byte]);
                    self.events.lock().push_back(MotionEvent::Outward);
                }
                b'F' => {
                    let mut frame = [0_u8; FRAME_LEN];
                    frame[0] = byte;
                    for slot in &mut frame[1..] {
                        let Some(next) = read_byte_until(io, deadline).await? else {
                            self.log.record_note(Direction::Rx, &frame, "incomplete frame");
                            return Ok(Err(RetryReason::Timeout));
                        };
                        *slot = next;
                    }
                    self.log.record_rx(&frame);
                    return Ok(match Packet::decode(&frame) {
                        Ok(packet) if packet.cmd == expected => Ok(packet),
                        Ok(packet) => Err(RetryReason::UnexpectedReply(packet.cmd)),
                        Err(err) => Err(RetryReason::Garbled(err)),
                    });
                }
                other => {
                    tracing::debug!(byte = other, "skipping noise byte");
                    self.log.record_note(Direction::Rx, &[other], "noise");
                }
            }
        }
    }

    /// After a motion terminator the hardware broadcasts an `FD` packet with
    /// the final position. Consuming it here both recovers the position and
    /// leaves the buffer clean for the next exchange.
    async fn complete_finish_frame(&self, io: &mut DynSerial) -> Option<u32> {
        let deadline = Instant::now() + FINISH_GRACE;
        loop {
            let byte = read_byte_until(io, deadline).await.ok().flatten()?;
            if byte != b'F' {
                continue;
            }
            let mut frame = [0_u8; FRAME_LEN];
            frame[0] = byte;
            for slot in &mut frame[1..] {
                *slot = read_byte_until(io, deadline).await.ok().flatten()?;
            }
            self.log.record_rx(&frame);
            return match Packet::decode(&frame) {
                Ok(packet) if packet.cmd == Command::Position => Some(packet.value),
                _ => None,
            };
        }
    }

    /// Discards everything currently buffered on the input side.
    async fn flush_input(&self, io: &mut DynSerial) {
        let mut discard = [0_u8; 64];
        let mut total = 0_usize;
        loop {
            match tokio::time::timeout(FLUSH_QUIET, io.read(&mut discard)).await {
                Ok(Ok(n)) if n > 0 => total += n,
                _ => break,
            }
        }
        if total > 0 {
            tracing::debug!(total, "flushed stale input bytes");
            self.log
                .record_note(Direction::Rx, &[], format!("flushed {total} stale bytes"));
        }
    }

    #[cfg(test)]
    pub(crate) async fn attach_for_test(&self, io: DynSerial) {
        *self.channel.lock().await = Some(io);
    }
}

async fn read_byte_until(io: &mut DynSerial, deadline: Instant) -> DriverResult<Option<u8>> {
    let mut byte = [0_u8; 1];
    match tokio::time::timeout_at(deadline, io.read(&mut byte)).await {
        Err(_) => Ok(None),
        Ok(Ok(0)) => Err(DriverError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "serial channel closed",
        ))),
        Ok(Ok(_)) => Ok(Some(byte[0])),
        Ok(Err(err)) => Err(err.into()),
    }
}

/// Opens a real serial port with the settings the Robofocus protocol fixes:
/// 8 data bits, no parity, one stop bit, no flow control.
async fn open_serial(port: &str, baud: u32) -> DriverResult<DynSerial> {
    use tokio_serial::SerialPortBuilderExt;

    let port_name = port.to_owned();
    let stream = tokio::task::spawn_blocking(move || {
        tokio_serial::new(&port_name, baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|source| DriverError::PortOpen {
                port: port_name.clone(),
                source,
            })
    })
    .await
    .map_err(|err| DriverError::Protocol(format!("serial open task failed: {err}")))??;

    Ok(Box::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::checksum;
    use tokio::io::DuplexStream;

    fn test_port() -> ProtocolPort {
        ProtocolPort::new(Duration::from_millis(200), Arc::new(ProtocolLog::default()))
    }

    async fn connected_pair(port: &ProtocolPort) -> DuplexStream {
        let (host, device) = tokio::io::duplex(512);
        port.attach_for_test(Box::new(host)).await;
        device
    }

    /// Reads the 9-byte request the port wrote, so scripted replies stay in
    /// lockstep with the retry loop.
    async fn expect_request(device: &mut DuplexStream, cmd: Command, value: u32) {
        let mut frame = [0_u8; FRAME_LEN];
        device.read_exact(&mut frame).await.expect("request frame");
        assert_eq!(Packet::decode(&frame), Ok(Packet::new(cmd, value)));
    }

    #[tokio::test]
    async fn exchange_reads_a_clean_reply() {
        let port = test_port();
        let mut device = connected_pair(&port).await;

        let task = tokio::spawn(async move {
            expect_request(&mut device, Command::Temperature, 0).await;
            device
                .write_all(&Packet::new(Command::Temperature, 600).encode())
                .await
                .expect("reply");
            device
        });

        let reply = port.exchange(Command::Temperature, 0).await.expect("reply");
        assert_eq!(reply.value, 600);
        assert_eq!(port.retry_count(), 0);
        task.await.expect("device task");
    }

    #[tokio::test]
    async fn status_bytes_inside_a_reply_become_events() {
        let port = test_port();
        let mut device = connected_pair(&port).await;

        let task = tokio::spawn(async move {
            expect_request(&mut device, Command::Temperature, 0).await;
            // Hand-controller movement interleaves with the reply.
            device.write_all(&[b'I'; 50]).await.expect("status bytes");
            device
                .write_all(&Packet::new(Command::Temperature, 580).encode())
                .await
                .expect("reply");
            device
        });

        let reply = port.exchange(Command::Temperature, 0).await.expect("reply");
        assert_eq!(reply.value, 580);
        let events = port.take_events();
        assert_eq!(events.len(), 50);
        assert!(events.iter().all(|ev| *ev == MotionEvent::Inward));
        task.await.expect("device task");
    }

    #[tokio::test]
    async fn corrupted_reply_is_retried_once() {
        let port = test_port();
        let mut device = connected_pair(&port).await;

        let task = tokio::spawn(async move {
            expect_request(&mut device, Command::Backlash, 0).await;
            let mut bad = Packet::new(Command::Backlash, 20).encode();
            bad[8] = bad[8].wrapping_add(1);
            device.write_all(&bad).await.expect("corrupt reply");

            expect_request(&mut device, Command::Backlash, 0).await;
            device
                .write_all(&Packet::new(Command::Backlash, 20).encode())
                .await
                .expect("good reply");
            device
        });

        let reply = port.exchange(Command::Backlash, 0).await.expect("reply");
        assert_eq!(reply.value, 20);
        assert_eq!(port.retry_count(), 1);
        task.await.expect("device task");
    }

    #[tokio::test]
    async fn persistent_prefix_mismatch_surfaces_protocol_error() {
        let port = test_port();
        let mut device = connected_pair(&port).await;

        let task = tokio::spawn(async move {
            for _ in 0..MAX_ATTEMPTS {
                expect_request(&mut device, Command::Backlash, 0).await;
                device
                    .write_all(&Packet::new(Command::Position, 30_000).encode())
                    .await
                    .expect("mismatched reply");
            }
            device
        });

        let err = port.exchange(Command::Backlash, 0).await.expect_err("mismatch");
        assert!(matches!(err, DriverError::Protocol(_)), "{err:?}");
        assert_eq!(port.retry_count(), u64::from(MAX_ATTEMPTS - 1));
        task.await.expect("device task");
    }

    #[tokio::test]
    async fn silence_surfaces_serial_timeout() {
        let port = test_port();
        let _device = connected_pair(&port).await;

        let err = port.exchange(Command::Firmware, 0).await.expect_err("timeout");
        assert!(matches!(err, DriverError::SerialTimeout { cmd: "FV", .. }), "{err:?}");
        assert_eq!(port.retry_count(), u64::from(MAX_ATTEMPTS - 1));
    }

    #[tokio::test]
    async fn drain_collects_statuses_and_finish_position() {
        let port = test_port();
        let mut device = connected_pair(&port).await;

        device.write_all(b"OOO").await.expect("statuses");
        device.write_all(b"F").await.expect("terminator");
        device
            .write_all(&Packet::new(Command::Position, 31_000).encode())
            .await
            .expect("final position");
        // Unrelated junk between packets is skipped, not an error.
        device.write_all(b"x").await.expect("noise");

        let events = port.drain_events().await.expect("drain");
        assert_eq!(
            events,
            vec![
                MotionEvent::Outward,
                MotionEvent::Outward,
                MotionEvent::Outward,
                MotionEvent::Finished {
                    position: Some(31_000)
                },
            ]
        );

        // Buffer is clean afterwards.
        assert!(port.drain_events().await.expect("drain").is_empty());
    }

    #[tokio::test]
    async fn drain_tolerates_missing_finish_frame() {
        let port = test_port();
        let mut device = connected_pair(&port).await;

        device.write_all(b"F").await.expect("terminator");

        let events = port.drain_events().await.expect("drain");
        assert_eq!(events, vec![MotionEvent::Finished { position: None }]);
    }

    #[tokio::test]
    async fn checksum_helper_matches_wire_bytes() {
        // Keep the canonical example from the protocol notes honest.
        let frame = Packet::new(Command::Goto, 2500).encode();
        let payload: [u8; 8] = frame[..8].try_into().expect("payload");
        assert_eq!(checksum(&payload), frame[8]);
    }
}
