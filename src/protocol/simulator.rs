//! In-process Robofocus simulator.
//!
//! Speaks the byte-exact wire protocol over one end of a `tokio::io::duplex`
//! pipe, so the real framing, checksum and retry engine is exercised even
//! without hardware. Virtual state lives behind an `Arc` and survives
//! disconnect/reconnect cycles, like the EEPROM-backed settings of the real
//! device.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, WriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::SimulatorCfg;
use crate::protocol::packet::{self, Command, Packet, FRAME_LEN, SYNC_MIN};
use crate::protocol::port::DynSerial;

type SharedWriter = Arc<Mutex<WriteHalf<DuplexStream>>>;

/// Deterministic fault injection for the retry path: counters instead of
/// probabilities so tests can assert exact retry counts.
#[derive(Debug, Default)]
pub struct FaultInjector {
    drop_replies: AtomicU32,
    corrupt_checksums: AtomicU32,
}

impl FaultInjector {
    /// Swallow the next `n` replies (the driver sees read timeouts).
    pub fn drop_next_replies(&self, n: u32) {
        self.drop_replies.fetch_add(n, Ordering::Relaxed);
    }

    /// Corrupt the checksum byte of the next `n` replies.
    pub fn corrupt_next_checksums(&self, n: u32) {
        self.corrupt_checksums.fetch_add(n, Ordering::Relaxed);
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[derive(Debug)]
struct SimState {
    position: u32,
    target: u32,
    backlash_wire: u32,
    max_travel: u32,
    /// Power-module switches; `false` = off.
    switches: [bool; 4],
    movement: Option<JoinHandle<()>>,
    /// Writer of the current connection, for status-byte emission.
    writer: Option<SharedWriter>,
}

#[derive(Debug)]
pub struct Simulator {
    cfg: SimulatorCfg,
    faults: FaultInjector,
    state: Mutex<SimState>,
    started: std::time::Instant,
}

impl Simulator {
    pub fn new(cfg: SimulatorCfg) -> Self {
        let state = SimState {
            position: cfg.initial_position,
            target: cfg.initial_position,
            backlash_wire: packet::backlash_to_wire(0),
            max_travel: cfg.max_travel,
            switches: [false; 4],
            movement: None,
            writer: None,
        };
        Self {
            cfg,
            faults: FaultInjector::default(),
            state: Mutex::new(state),
            started: std::time::Instant::now(),
        }
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Wires up a fresh connection and returns the host end of the pipe.
    pub fn attach(self: &Arc<Self>) -> DynSerial {
        let (host, device) = tokio::io::duplex(8192);
        let simulator = Arc::clone(self);
        drop(tokio::spawn(async move { simulator.serve(device).await }));
        Box::new(host)
    }

    /// Pushes raw bytes into the device-to-host direction, outside any
    /// frame. Tests use this to fake hand-controller status streams.
    pub async fn inject(&self, bytes: &[u8]) {
        let writer = self.state.lock().await.writer.clone();
        if let Some(writer) = writer {
            let _ = writer.lock().await.write_all(bytes).await;
        }
    }

    async fn serve(self: Arc<Self>, device: DuplexStream) {
        let (mut reader, writer) = tokio::io::split(device);
        let writer: SharedWriter = Arc::new(Mutex::new(writer));
        self.state.lock().await.writer = Some(Arc::clone(&writer));
        tracing::debug!("simulator attached");

        loop {
            let mut frame = [0_u8; FRAME_LEN];
            if reader.read_exact(&mut frame).await.is_err() {
                break;
            }
            match Packet::decode(&frame) {
                Ok(request) => self.handle(request, &writer).await,
                // A garbled request is dropped on the floor, like hardware
                // does; the driver's retry resends it.
                Err(err) => tracing::debug!(%err, "simulator ignoring malformed request"),
            }
        }

        // Host hung up; stop any motion and forget the stale writer. A new
        // connection may already have attached, so only clear our own.
        let mut state = self.state.lock().await;
        if let Some(task) = state.movement.take() {
            task.abort();
        }
        if let Some(current) = &state.writer {
            if Arc::ptr_eq(current, &writer) {
                state.writer = None;
            }
        }
        tracing::debug!("simulator detached");
    }

    async fn handle(self: &Arc<Self>, request: Packet, writer: &SharedWriter) {
        let reply = match request.cmd {
            Command::Firmware => Some(Packet::new(Command::Firmware, self.cfg.firmware_value())),
            Command::Goto => {
                if request.value == 0 {
                    let position = self.state.lock().await.position;
                    Some(Packet::new(Command::Position, position))
                } else {
                    let target = {
                        let state = self.state.lock().await;
                        request.value.min(state.max_travel)
                    };
                    self.start_movement(target, writer).await;
                    // The goto reply echoes the target, not the position.
                    Some(Packet::new(Command::Position, target))
                }
            }
            Command::StepIn => {
                let target = {
                    let state = self.state.lock().await;
                    state.position.saturating_sub(request.value)
                };
                self.start_movement(target, writer).await;
                Some(Packet::new(Command::Position, target))
            }
            Command::StepOut => {
                let target = {
                    let state = self.state.lock().await;
                    (state.position + request.value).min(state.max_travel)
                };
                self.start_movement(target, writer).await;
                Some(Packet::new(Command::Position, target))
            }
            Command::Temperature => {
                Some(Packet::new(Command::Temperature, self.temperature_raw()))
            }
            Command::Backlash => {
                let mut state = self.state.lock().await;
                if request.value == 0 {
                    Some(Packet::new(Command::Backlash, state.backlash_wire))
                } else {
                    state.backlash_wire = request.value;
                    Some(Packet::new(Command::Backlash, request.value))
                }
            }
            Command::MaxTravel => {
                let mut state = self.state.lock().await;
                if request.value == 0 {
                    Some(Packet::new(Command::MaxTravel, state.max_travel))
                } else {
                    state.max_travel = request.value;
                    Some(Packet::new(Command::MaxTravel, request.value))
                }
            }
            Command::SyncCounter => {
                let mut state = self.state.lock().await;
                // FS000000 and FS000001 echo the counter instead of setting it.
                if request.value >= SYNC_MIN {
                    state.position = request.value;
                    state.target = request.value;
                }
                Some(Packet::new(Command::SyncCounter, state.position))
            }
            Command::Halt => {
                self.halt(writer).await;
                None
            }
            Command::PowerModule => {
                let mut state = self.state.lock().await;
                if request.value > 0 {
                    let which = request.value / 100_000;
                    if (1..=4).contains(&which) {
                        let index = usize::try_from(which - 1).unwrap_or(0);
                        state.switches[index] = !state.switches[index];
                    }
                }
                Some(Packet::new(Command::PowerModule, encode_switches(&state.switches)))
            }
            Command::Position => None,
        };

        if let Some(reply) = reply {
            self.send_reply(writer, reply).await;
        }
    }

    async fn start_movement(self: &Arc<Self>, target: u32, writer: &SharedWriter) {
        // A new goto preempts the old one mid-flight; wait the old task out
        // so two tasks never step the position concurrently.
        let old = self.state.lock().await.movement.take();
        if let Some(task) = old {
            task.abort();
            let _ = task.await;
        }

        let mut state = self.state.lock().await;
        state.target = target;
        let simulator = Arc::clone(self);
        let writer = Arc::clone(writer);
        state.movement = Some(tokio::spawn(async move {
            simulator.run_movement(target, writer).await;
        }));
    }

    /// Advances the virtual position toward `target`, one status byte per
    /// step, then broadcasts `F` plus an `FD` packet. Steps are grouped
    /// into short ticks so high speeds do not outrun the timer resolution.
    async fn run_movement(self: Arc<Self>, target: u32, writer: SharedWriter) {
        let speed = self.cfg.movement_speed_steps_per_sec.max(1);
        let batch = (speed / 200).max(1);
        let tick = Duration::from_secs_f64(f64::from(batch) / f64::from(speed));

        loop {
            let mut bytes = Vec::with_capacity(usize::try_from(batch).unwrap_or(1));
            {
                let mut state = self.state.lock().await;
                for _ in 0..batch {
                    if state.position == target {
                        break;
                    }
                    if target > state.position {
                        state.position += 1;
                        bytes.push(b'O');
                    } else {
                        state.position -= 1;
                        bytes.push(b'I');
                    }
                }
            }
            if bytes.is_empty() {
                break;
            }
            if writer.lock().await.write_all(&bytes).await.is_err() {
                return;
            }
            tokio::time::sleep(tick).await;
        }

        let position = {
            let mut state = self.state.lock().await;
            state.movement = None;
            state.position
        };
        write_finish(&writer, position).await;
        tracing::debug!(position, "simulated movement finished");
    }

    async fn halt(&self, writer: &SharedWriter) {
        let task = self.state.lock().await.movement.take();
        let Some(task) = task else {
            // Nothing in flight; the real unit stays silent here too.
            return;
        };
        task.abort();
        match task.await {
            // Ran to completion first; the terminator is already on the wire.
            Ok(()) => {}
            Err(err) if err.is_cancelled() => {
                let position = self.state.lock().await.position;
                write_finish(writer, position).await;
                tracing::debug!(position, "simulated movement halted");
            }
            Err(err) => tracing::warn!(%err, "simulated movement task failed"),
        }
    }

    async fn send_reply(&self, writer: &SharedWriter, reply: Packet) {
        if FaultInjector::take(&self.faults.drop_replies) {
            tracing::debug!(cmd = %reply.cmd, "fault injection: dropping reply");
            return;
        }
        let mut frame = reply.encode();
        if FaultInjector::take(&self.faults.corrupt_checksums) {
            tracing::debug!(cmd = %reply.cmd, "fault injection: corrupting checksum");
            frame[8] = frame[8].wrapping_add(1);
        }
        let _ = writer.lock().await.write_all(&frame).await;
    }

    fn temperature_raw(&self) -> u32 {
        let elapsed = self.started.elapsed();
        let mut celsius = self.cfg.temperature_celsius
            + self.cfg.temperature_drift_per_hour * (elapsed.as_secs_f64() / 3600.0);
        if self.cfg.temperature_noise_celsius > 0.0 {
            celsius += noise_sample(elapsed) * self.cfg.temperature_noise_celsius;
        }
        packet::raw_from_celsius(celsius)
    }
}

/// Cheap time-seeded LCG in [-1, 1]; enough jitter for a virtual sensor.
fn noise_sample(elapsed: Duration) -> f64 {
    #[allow(clippy::as_conversions, clippy::cast_possible_truncation)]
    let seed = elapsed.as_nanos() as u64;
    let mixed = seed
        .wrapping_mul(6_364_136_223_846_793_005)
        .wrapping_add(1_442_695_040_888_963_407);
    #[allow(clippy::as_conversions, clippy::cast_precision_loss)]
    let unit = ((mixed >> 11) as f64) / ((1_u64 << 53) as f64);
    unit * 2.0 - 1.0
}

async fn write_finish(writer: &SharedWriter, position: u32) {
    let frame = Packet::new(Command::Position, position).encode();
    let mut writer = writer.lock().await;
    if writer.write_all(b"F").await.is_ok() {
        let _ = writer.write_all(&frame).await;
    }
}

fn encode_switches(switches: &[bool; 4]) -> u32 {
    switches
        .iter()
        .fold(0, |acc, on| acc * 10 + if *on { 2 } else { 1 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::log::ProtocolLog;
    use crate::protocol::port::{Backend, ProtocolPort};
    use crate::protocol::MotionEvent;

    fn sim_cfg() -> SimulatorCfg {
        SimulatorCfg {
            enabled: true,
            initial_position: 30_000,
            movement_speed_steps_per_sec: 50_000,
            ..SimulatorCfg::default()
        }
    }

    async fn connected(cfg: SimulatorCfg) -> (Arc<Simulator>, ProtocolPort, String) {
        let simulator = Arc::new(Simulator::new(cfg));
        let port = ProtocolPort::new(
            Duration::from_millis(500),
            Arc::new(ProtocolLog::default()),
        );
        let firmware = port
            .connect(&Backend::Simulator(Arc::clone(&simulator)))
            .await
            .expect("connect");
        (simulator, port, firmware)
    }

    #[tokio::test]
    async fn handshake_reports_firmware() {
        let (_sim, _port, firmware) = connected(sim_cfg()).await;
        assert_eq!(firmware, "002100");
    }

    #[tokio::test]
    async fn position_query_and_sync_quirk() {
        let (_sim, port, _) = connected(sim_cfg()).await;

        let reply = port.exchange(Command::Goto, 0).await.expect("query");
        assert_eq!(reply, Packet::new(Command::Position, 30_000));

        // 0 and 1 echo the current counter instead of setting it.
        for quirk in [0, 1] {
            let reply = port.exchange(Command::SyncCounter, quirk).await.expect("sync");
            assert_eq!(reply.value, 30_000);
        }

        let reply = port.exchange(Command::SyncCounter, 12_345).await.expect("sync");
        assert_eq!(reply.value, 12_345);
        let reply = port.exchange(Command::Goto, 0).await.expect("query");
        assert_eq!(reply.value, 12_345);
    }

    #[tokio::test]
    async fn backlash_and_max_travel_are_stored() {
        let (simulator, port, _) = connected(sim_cfg()).await;

        let wire = packet::backlash_to_wire(-20);
        port.exchange(Command::Backlash, wire).await.expect("set");
        let reply = port.exchange(Command::Backlash, 0).await.expect("get");
        assert_eq!(packet::backlash_from_wire(reply.value), -20);

        port.exchange(Command::MaxTravel, 55_000).await.expect("set");
        port.disconnect().await;

        // Hardware-stored settings survive a reconnect.
        let reconnected = ProtocolPort::new(
            Duration::from_millis(500),
            Arc::new(ProtocolLog::default()),
        );
        reconnected
            .connect(&Backend::Simulator(Arc::clone(&simulator)))
            .await
            .expect("reconnect");
        let reply = reconnected
            .exchange(Command::MaxTravel, 0)
            .await
            .expect("get");
        assert_eq!(reply.value, 55_000);
    }

    #[tokio::test]
    async fn goto_echoes_target_then_streams_statuses() {
        let (_sim, port, _) = connected(sim_cfg()).await;

        let reply = port.exchange(Command::Goto, 30_100).await.expect("goto");
        assert_eq!(reply.value, 30_100);

        // Collect events until the terminator arrives.
        let mut outward = 0;
        let mut finish = None;
        for _ in 0..100 {
            for event in port.drain_events().await.expect("drain") {
                match event {
                    MotionEvent::Outward => outward += 1,
                    MotionEvent::Finished { position } => finish = position,
                    MotionEvent::Inward => panic!("wrong direction"),
                }
            }
            if finish.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(outward, 100);
        assert_eq!(finish, Some(30_100));
    }

    #[tokio::test]
    async fn relative_moves_clamp_to_limits() {
        let (_sim, port, _) = connected(sim_cfg()).await;

        let reply = port.exchange(Command::StepOut, 999_999).await.expect("out");
        assert_eq!(reply.value, 60_000);
        // Preempt with an inward move far past zero.
        let reply = port.exchange(Command::StepIn, 999_999).await.expect("in");
        assert_eq!(reply.value, 0);
    }

    #[tokio::test]
    async fn power_switches_toggle() {
        let (_sim, port, _) = connected(sim_cfg()).await;

        let reply = port.exchange(Command::PowerModule, 0).await.expect("read");
        assert_eq!(reply.value, 1111);

        let reply = port
            .exchange(Command::PowerModule, 200_000)
            .await
            .expect("toggle");
        assert_eq!(reply.value, 1211);
    }

    #[tokio::test]
    async fn dropped_reply_forces_timeout_then_recovery() {
        let (simulator, port, _) = connected(sim_cfg()).await;

        simulator.faults().drop_next_replies(1);
        let reply = port.exchange(Command::Temperature, 0).await.expect("reply");
        assert_eq!(reply.cmd, Command::Temperature);
        assert_eq!(port.retry_count(), 1);
    }
}
