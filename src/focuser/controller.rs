use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::AppConfig;
use crate::errors::{DriverError, DriverResult};
use crate::protocol::packet::{self, Command, BACKLASH_MAX, SYNC_MIN, VALUE_MAX};
use crate::protocol::port::{Backend, ProtocolPort};
use crate::protocol::scan;
use crate::protocol::simulator::Simulator;
use crate::protocol::{MotionEvent, ProtocolLog};
use crate::settings::{Mode, SettingsStore};

/// Steps of slack when deciding that a stalled move actually reached its
/// target.
const MOVE_TOLERANCE: u32 = 2;

/// Everything the controller caches about the device. Guarded by one
/// controller-wide mutex so that operations are linearizable and at most
/// one serial exchange is ever prepared at a time.
#[derive(Debug)]
struct DeviceState {
    connected: bool,
    /// Raw (hardware) position; what clients see is `position - zero_offset`.
    position: u32,
    position_refreshed: Option<Instant>,
    /// Raw target; meaningful only while `moving`.
    target: u32,
    moving: bool,
    /// Set when a motion terminator was observed but the post-motion
    /// refresh has not run yet.
    finish_seen: bool,
    /// Last time any movement status byte arrived; drives the stall net.
    last_event: Instant,
    /// Forced end of the moving state after a halt whose terminator never
    /// arrived.
    halt_deadline: Option<Instant>,
    /// Hardware needs a quiet period after motion before the next command.
    settle_until: Option<Instant>,
    firmware: Option<String>,
    /// Hardware-reported maximum travel; configuration fallback until read.
    hw_max: u32,
    /// Signed backlash, INDI convention.
    backlash: i16,
    backlash_refreshed: Option<Instant>,
    temperature: Option<f64>,
    temperature_refreshed: Option<Instant>,
}

/// One-lock status summary for the control panel; served from cache only,
/// so high-frequency polling never touches the wire.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub mode: Mode,
    pub connected: bool,
    pub port: Option<String>,
    pub position: i32,
    pub target: i32,
    pub moving: bool,
    pub temperature: Option<f64>,
    pub firmware: Option<String>,
    pub max_step: i32,
    pub max_increment: u32,
    pub min_step: u32,
    pub backlash: i16,
}

pub struct FocuserController {
    cfg: AppConfig,
    settings: Arc<SettingsStore>,
    port: ProtocolPort,
    simulator: Arc<Simulator>,
    backend: parking_lot::Mutex<Backend>,
    state: Mutex<DeviceState>,
    monitor: parking_lot::Mutex<Option<JoinHandle<()>>>,
    log: Arc<ProtocolLog>,
}

impl std::fmt::Debug for FocuserController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FocuserController")
            .field("backend", &*self.backend.lock())
            .finish_non_exhaustive()
    }
}

impl FocuserController {
    pub fn new(
        cfg: AppConfig,
        settings: Arc<SettingsStore>,
        log: Arc<ProtocolLog>,
        mode_override: Option<Mode>,
    ) -> Arc<Self> {
        let simulator = Arc::new(Simulator::new(cfg.simulator.clone()));
        let mode = mode_override
            .or(settings.get().mode)
            .unwrap_or(if cfg.simulator.enabled {
                Mode::Simulator
            } else {
                Mode::Hardware
            });
        let backend = match mode {
            Mode::Simulator => Backend::Simulator(Arc::clone(&simulator)),
            Mode::Hardware => Backend::Serial {
                port: settings
                    .get()
                    .last_port
                    .unwrap_or_else(|| cfg.serial.port.clone()),
                baud: cfg.serial.baud,
            },
        };
        let state = DeviceState {
            connected: false,
            position: 0,
            position_refreshed: None,
            target: 0,
            moving: false,
            finish_seen: false,
            last_event: Instant::now(),
            halt_deadline: None,
            settle_until: None,
            firmware: None,
            hw_max: cfg.focuser.max_step,
            backlash: cfg.focuser.backlash_steps,
            backlash_refreshed: None,
            temperature: None,
            temperature_refreshed: None,
        };
        Arc::new(Self {
            port: ProtocolPort::new(cfg.serial.timeout(), Arc::clone(&log)),
            cfg,
            settings,
            simulator,
            backend: parking_lot::Mutex::new(backend),
            state: Mutex::new(state),
            monitor: parking_lot::Mutex::new(None),
            log,
        })
    }

    pub fn simulator(&self) -> &Arc<Simulator> {
        &self.simulator
    }

    pub fn protocol_log(&self) -> &Arc<ProtocolLog> {
        &self.log
    }

    /// Command retransmissions since startup; a health indicator for the
    /// serial link.
    pub fn retry_count(&self) -> u64 {
        self.port.retry_count()
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    pub fn mode(&self) -> Mode {
        match *self.backend.lock() {
            Backend::Serial { .. } => Mode::Hardware,
            Backend::Simulator(_) => Mode::Simulator,
        }
    }

    pub fn port_name(&self) -> Option<String> {
        self.backend.lock().port_name().map(str::to_owned)
    }

    pub fn step_size(&self) -> f64 {
        self.cfg.focuser.step_size_microns
    }

    pub fn max_increment(&self) -> u32 {
        self.settings.get().max_increment
    }

    pub fn min_position(&self) -> u32 {
        self.settings.get().min_step
    }

    /// Probes every serial port for a Robofocus.
    pub async fn scan_devices(&self) -> Vec<scan::DiscoveredDevice> {
        scan::scan_for_devices(
            self.cfg.serial.baud,
            self.cfg.serial.scan_timeout(),
            &self.log,
        )
        .await
    }

    /// Switches between hardware and simulator. Refused while connected.
    pub async fn set_mode(&self, mode: Mode) -> DriverResult<()> {
        let state = self.state.lock().await;
        if state.connected {
            return Err(DriverError::InvalidOperation(
                "disconnect before switching mode".to_owned(),
            ));
        }
        *self.backend.lock() = match mode {
            Mode::Simulator => Backend::Simulator(Arc::clone(&self.simulator)),
            Mode::Hardware => Backend::Serial {
                port: self
                    .settings
                    .get()
                    .last_port
                    .unwrap_or_else(|| self.cfg.serial.port.clone()),
                baud: self.cfg.serial.baud,
            },
        };
        self.settings.update(|s| s.mode = Some(mode));
        Ok(())
    }

    /// Selects the serial port to use on the next connect. Implies hardware
    /// mode. Refused while connected.
    pub async fn set_port(&self, port: String) -> DriverResult<()> {
        let state = self.state.lock().await;
        if state.connected {
            return Err(DriverError::InvalidOperation(
                "disconnect before changing the serial port".to_owned(),
            ));
        }
        *self.backend.lock() = Backend::Serial {
            port: port.clone(),
            baud: self.cfg.serial.baud,
        };
        self.settings.update(|s| {
            s.last_port = Some(port);
            s.mode = Some(Mode::Hardware);
        });
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }

    pub async fn is_moving(&self) -> bool {
        let state = self.state.lock().await;
        state.connected && state.moving
    }

    pub async fn firmware_version(&self) -> Option<String> {
        self.state.lock().await.firmware.clone()
    }

    /// Opens the transport, validates the device, and seeds the cache:
    /// firmware from the handshake, then position, max travel, backlash and
    /// temperature from the hardware. Max travel and backlash are optional
    /// per firmware; failures there fall back to configured values.
    pub async fn connect(self: &Arc<Self>) -> DriverResult<()> {
        let mut state = self.state.lock().await;
        if state.connected {
            tracing::warn!("already connected");
            return Ok(());
        }

        let backend = self.resolve_backend().await?;
        let firmware = self.port.connect(&backend).await?;

        let position = match self.port.exchange(Command::Goto, 0).await {
            Ok(reply) => reply.value,
            Err(err) => {
                self.port.disconnect().await;
                return Err(err);
            }
        };
        state.connected = true;
        state.firmware = Some(firmware);
        state.position = position;
        state.position_refreshed = Some(Instant::now());
        state.target = position;
        state.moving = false;
        state.finish_seen = false;
        state.halt_deadline = None;
        state.settle_until = None;

        // Hardware is authoritative on max travel and backlash, but older
        // firmwares answer with a different packet; that is not fatal.
        match self.port.exchange(Command::MaxTravel, 0).await {
            Ok(reply) => state.hw_max = reply.value,
            Err(err) => {
                state.hw_max = self.cfg.focuser.max_step;
                tracing::warn!(%err, fallback = state.hw_max, "max travel query failed, using configured value");
            }
        }
        match self.port.exchange(Command::Backlash, 0).await {
            Ok(reply) => {
                state.backlash = packet::backlash_from_wire(reply.value);
                state.backlash_refreshed = Some(Instant::now());
            }
            Err(err) => {
                state.backlash = self.cfg.focuser.backlash_steps;
                tracing::warn!(%err, fallback = state.backlash, "backlash query failed, using configured value");
            }
        }
        // Prime the temperature cache so moving-state reads have a value.
        match self.port.exchange(Command::Temperature, 0).await {
            Ok(reply) => {
                state.temperature = Some(packet::celsius_from_raw(reply.value));
                state.temperature_refreshed = Some(Instant::now());
            }
            Err(err) => tracing::warn!(%err, "initial temperature read failed"),
        }

        if let Backend::Serial { port, .. } = &backend {
            let port = port.clone();
            self.settings.update(|s| s.last_port = Some(port));
        }

        let monitor = tokio::spawn(run_monitor(Arc::downgrade(self)));
        if let Some(old) = self.monitor.lock().replace(monitor) {
            old.abort();
        }

        tracing::info!(
            position = state.position,
            max_travel = state.hw_max,
            backlash = state.backlash,
            "focuser connected"
        );
        Ok(())
    }

    /// Resolves an empty serial port name through a device scan when
    /// auto-discovery is enabled.
    async fn resolve_backend(&self) -> DriverResult<Backend> {
        let backend = self.backend.lock().clone();
        let Backend::Serial { port, baud } = &backend else {
            return Ok(backend);
        };
        if !port.is_empty() {
            return Ok(backend);
        }
        if !self.cfg.serial.auto_discover {
            return Err(DriverError::PortUnavailable(
                "no serial port configured and auto-discovery is disabled".to_owned(),
            ));
        }

        tracing::info!("no port configured, scanning for a Robofocus");
        let found = scan::scan_for_devices(*baud, self.cfg.serial.scan_timeout(), &self.log).await;
        let device = found.into_iter().next().ok_or_else(|| {
            DriverError::PortUnavailable("no Robofocus device found on any serial port".to_owned())
        })?;
        let resolved = Backend::Serial {
            port: device.port,
            baud: *baud,
        };
        *self.backend.lock() = resolved.clone();
        Ok(resolved)
    }

    /// Closes the transport. Refused while a move is in flight; halt first.
    pub async fn disconnect(&self) -> DriverResult<()> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Ok(());
        }
        if state.moving {
            return Err(DriverError::InvalidOperation(
                "cannot disconnect while the focuser is moving".to_owned(),
            ));
        }

        if let Some(monitor) = self.monitor.lock().take() {
            monitor.abort();
        }
        self.port.disconnect().await;

        state.connected = false;
        state.firmware = None;
        state.temperature = None;
        state.temperature_refreshed = None;
        state.position_refreshed = None;
        state.backlash_refreshed = None;
        state.finish_seen = false;
        state.halt_deadline = None;
        state.settle_until = None;

        tracing::info!("focuser disconnected");
        Ok(())
    }

    /// Reported position: `raw - zero_offset`. Idle and stale caches are
    /// refreshed with an `FG 0` query first.
    pub async fn position(&self) -> DriverResult<i32> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(DriverError::NotConnected);
        }
        self.apply_events(&mut state);
        if !state.moving
            && stale(
                state.position_refreshed,
                self.cfg.focuser.idle_interval(),
            )
        {
            self.refresh_position(&mut state).await?;
        }
        Ok(self.to_logical(state.position))
    }

    /// Reported maximum: `hardware max - zero_offset`.
    pub async fn max_step(&self) -> i32 {
        let state = self.state.lock().await;
        self.to_logical(state.hw_max)
    }

    /// Temperature in Celsius, refreshed on a cadence while idle. During
    /// motion the cached value is served; no query may interleave with the
    /// status stream.
    pub async fn temperature(&self) -> DriverResult<f64> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(DriverError::NotConnected);
        }
        self.apply_events(&mut state);
        if !state.moving
            && stale(
                state.temperature_refreshed,
                self.cfg.focuser.temperature_cache(),
            )
        {
            self.wait_settled(&mut state).await;
            let reply = self.port.exchange(Command::Temperature, 0).await?;
            self.apply_events(&mut state);
            state.temperature = Some(packet::celsius_from_raw(reply.value));
            state.temperature_refreshed = Some(Instant::now());
        }
        state
            .temperature
            .ok_or_else(|| DriverError::Protocol("temperature not available".to_owned()))
    }

    /// Signed backlash. Hardware is queried only while idle; during motion
    /// the cached value is returned and the refresh is deferred, because an
    /// FB exchange would corrupt the status-byte stream.
    pub async fn backlash(&self) -> DriverResult<i16> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(DriverError::NotConnected);
        }
        self.apply_events(&mut state);
        if !state.moving
            && stale(
                state.backlash_refreshed,
                self.cfg.focuser.idle_interval(),
            )
        {
            self.wait_settled(&mut state).await;
            let reply = self.port.exchange(Command::Backlash, 0).await?;
            self.apply_events(&mut state);
            state.backlash = packet::backlash_from_wire(reply.value);
            state.backlash_refreshed = Some(Instant::now());
        }
        Ok(state.backlash)
    }

    pub async fn set_backlash(&self, steps: i16) -> DriverResult<()> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(DriverError::NotConnected);
        }
        if state.moving {
            return Err(DriverError::InvalidOperation(
                "cannot set backlash while the focuser is moving".to_owned(),
            ));
        }
        if steps.abs() > BACKLASH_MAX {
            return Err(DriverError::InvalidValue(format!(
                "backlash must be within -{BACKLASH_MAX}..={BACKLASH_MAX}, got {steps}"
            )));
        }
        self.wait_settled(&mut state).await;
        let _ = self
            .port
            .exchange(Command::Backlash, packet::backlash_to_wire(steps))
            .await?;
        self.apply_events(&mut state);
        state.backlash = steps;
        state.backlash_refreshed = Some(Instant::now());
        Ok(())
    }

    /// Starts an absolute move. Non-blocking: completion is observed by the
    /// motion monitor.
    pub async fn move_to(&self, logical: i32) -> DriverResult<()> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(DriverError::NotConnected);
        }
        self.apply_events(&mut state);
        if state.moving {
            return Err(DriverError::InvalidOperation(
                "a move is already in progress".to_owned(),
            ));
        }

        let zero = i64::from(self.settings.get().zero_offset);
        let raw = i64::from(logical) + zero;
        let min = i64::from(self.settings.get().min_step);
        let max = i64::from(state.hw_max);
        if raw < min || raw > max {
            return Err(DriverError::InvalidValue(format!(
                "target {logical} outside the allowed range {}..={}",
                min - zero,
                max - zero
            )));
        }
        let raw = u32::try_from(raw)
            .map_err(|_| DriverError::InvalidValue(format!("target {logical} out of range")))?;

        let delta = state.position.abs_diff(raw);
        let max_increment = self.settings.get().max_increment;
        if delta > max_increment {
            return Err(DriverError::InvalidValue(format!(
                "move of {delta} steps exceeds the maximum increment {max_increment}"
            )));
        }

        self.wait_settled(&mut state).await;
        // FG with value 0 is the position query, so raw position 0 cannot be
        // addressed by goto; an exact inward step count lands there instead.
        let reply = if raw == 0 {
            if delta == 0 {
                return Ok(());
            }
            self.port.exchange(Command::StepIn, delta).await?
        } else {
            self.port.exchange(Command::Goto, raw).await?
        };
        // The reply echoes the target, not the current position.
        if reply.value != raw {
            tracing::warn!(sent = raw, echoed = reply.value, "goto echo differs from target");
        }

        state.target = raw;
        state.moving = true;
        state.finish_seen = false;
        state.halt_deadline = None;
        state.last_event = Instant::now();
        tracing::info!(from = state.position, to = raw, "movement started");
        Ok(())
    }

    /// Relative convenience used by the control panel; routed through
    /// [`Self::move_to`] so the same limit checks apply.
    pub async fn move_relative(&self, delta: i32) -> DriverResult<()> {
        let current = self.position().await?;
        let target = current
            .checked_add(delta)
            .ok_or_else(|| DriverError::InvalidValue("relative move overflows".to_owned()))?;
        self.move_to(target).await
    }

    /// Stops motion. The moving flag clears when the `F` terminator is seen,
    /// or after the safety deadline if the terminator is missed.
    pub async fn halt(&self) -> DriverResult<()> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(DriverError::NotConnected);
        }
        self.port.send_only(Command::Halt, 0).await?;
        if state.moving {
            state.halt_deadline = Some(Instant::now() + self.cfg.focuser.halt_deadline());
        }
        tracing::info!("halt issued");
        Ok(())
    }

    /// Defines the current position as `logical`. Purely local: only the
    /// persisted zero offset changes, the hardware counter is untouched.
    pub async fn set_zero(&self, logical: i32) -> DriverResult<()> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(DriverError::NotConnected);
        }
        self.apply_events(&mut state);
        let offset = i64::from(state.position) - i64::from(logical);
        let offset = i32::try_from(offset)
            .map_err(|_| DriverError::InvalidValue("zero reference out of range".to_owned()))?;
        self.settings.update(|s| s.zero_offset = offset);
        tracing::info!(zero_offset = offset, "zero reference updated");
        Ok(())
    }

    /// Writes the hardware position counter without moving (`FS`). Values
    /// below 2 are rejected: the hardware echoes the current position for 0
    /// and 1 instead of syncing.
    pub async fn sync_position(&self, raw: u32) -> DriverResult<()> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(DriverError::NotConnected);
        }
        if state.moving {
            return Err(DriverError::InvalidOperation(
                "cannot sync the counter while the focuser is moving".to_owned(),
            ));
        }
        if raw < SYNC_MIN {
            return Err(DriverError::InvalidValue(format!(
                "sync value must be at least {SYNC_MIN}, got {raw}"
            )));
        }
        if raw > VALUE_MAX {
            return Err(DriverError::InvalidValue(format!(
                "sync value must be at most {VALUE_MAX}, got {raw}"
            )));
        }
        self.wait_settled(&mut state).await;
        let reply = self.port.exchange(Command::SyncCounter, raw).await?;
        self.apply_events(&mut state);
        state.position = reply.value;
        state.position_refreshed = Some(Instant::now());
        Ok(())
    }

    /// Writes a new hardware maximum travel (`FL`) and reads it back.
    pub async fn set_max_travel(&self, max: u32) -> DriverResult<()> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(DriverError::NotConnected);
        }
        if state.moving {
            return Err(DriverError::InvalidOperation(
                "cannot set max travel while the focuser is moving".to_owned(),
            ));
        }
        if max == 0 || max > VALUE_MAX {
            return Err(DriverError::InvalidValue(format!(
                "max travel must be within 1..={VALUE_MAX}, got {max}"
            )));
        }
        self.wait_settled(&mut state).await;
        let _ = self.port.exchange(Command::MaxTravel, max).await?;
        let reply = self.port.exchange(Command::MaxTravel, 0).await?;
        self.apply_events(&mut state);
        state.hw_max = reply.value;
        if reply.value != max {
            tracing::warn!(requested = max, stored = reply.value, "hardware adjusted max travel");
        }
        Ok(())
    }

    /// Soft per-move cap; local only.
    pub async fn set_max_increment(&self, steps: i32) -> DriverResult<()> {
        let state = self.state.lock().await;
        let steps = u32::try_from(steps).map_err(|_| {
            DriverError::InvalidValue(format!("max increment must not be negative, got {steps}"))
        })?;
        if steps > state.hw_max {
            return Err(DriverError::InvalidValue(format!(
                "max increment {steps} exceeds the hardware maximum {}",
                state.hw_max
            )));
        }
        self.settings.update(|s| s.max_increment = steps);
        Ok(())
    }

    /// Soft minimum position; local only.
    pub async fn set_min_position(&self, steps: i32) -> DriverResult<()> {
        let state = self.state.lock().await;
        let steps = u32::try_from(steps).map_err(|_| {
            DriverError::InvalidValue(format!("minimum position must not be negative, got {steps}"))
        })?;
        if steps > state.hw_max {
            return Err(DriverError::InvalidValue(format!(
                "minimum position {steps} exceeds the hardware maximum {}",
                state.hw_max
            )));
        }
        self.settings.update(|s| s.min_step = steps);
        Ok(())
    }

    /// Cache-only summary for the control panel.
    pub async fn snapshot(&self) -> StatusSnapshot {
        let state = self.state.lock().await;
        let settings = self.settings.get();
        StatusSnapshot {
            mode: self.mode(),
            connected: state.connected,
            port: self.port_name(),
            position: self.to_logical(state.position),
            target: self.to_logical(state.target),
            moving: state.connected && state.moving,
            temperature: state.temperature,
            firmware: state.firmware.clone(),
            max_step: self.to_logical(state.hw_max),
            max_increment: settings.max_increment,
            min_step: settings.min_step,
            backlash: state.backlash,
        }
    }

    fn to_logical(&self, raw: u32) -> i32 {
        let logical = i64::from(raw) - i64::from(self.settings.get().zero_offset);
        i32::try_from(logical).unwrap_or(i32::MAX)
    }

    /// Applies status bytes picked up by the framing loop to the cache.
    fn apply_events(&self, state: &mut DeviceState) {
        for event in self.port.take_events() {
            self.apply_event(state, event);
        }
    }

    fn apply_event(&self, state: &mut DeviceState, event: MotionEvent) {
        state.last_event = Instant::now();
        match event {
            MotionEvent::Inward => state.position = state.position.saturating_sub(1),
            MotionEvent::Outward => state.position = state.position.saturating_add(1),
            MotionEvent::Finished { position } => {
                if let Some(position) = position {
                    state.position = position;
                }
                state.settle_until = Some(Instant::now() + self.cfg.focuser.settle_delay());
                if state.moving {
                    state.finish_seen = true;
                }
            }
        }
    }

    /// Honors the post-motion settling delay before the next command.
    async fn wait_settled(&self, state: &mut DeviceState) {
        if let Some(until) = state.settle_until.take() {
            tokio::time::sleep_until(until).await;
        }
    }

    async fn refresh_position(&self, state: &mut DeviceState) -> DriverResult<()> {
        self.wait_settled(state).await;
        let reply = self.port.exchange(Command::Goto, 0).await?;
        self.apply_events(state);
        state.position = reply.value;
        state.position_refreshed = Some(Instant::now());
        Ok(())
    }

    /// Post-motion cleanup: settle, refresh the authoritative position, and
    /// leave the moving state.
    async fn finish_move(&self, state: &mut DeviceState) {
        if let Err(err) = self.refresh_position(state).await {
            tracing::warn!(%err, "position refresh after motion failed; cache may be stale");
        }
        state.moving = false;
        state.finish_seen = false;
        state.halt_deadline = None;
        tracing::info!(position = state.position, "movement finished");
    }
}

/// Long-lived monitor task, one per connection. Sleeps while idle; while a
/// move is in flight it drains status bytes, tracks the position, and turns
/// the `F` terminator into the post-motion refresh. A stall net recovers
/// from lost bytes and missed halt terminators.
async fn run_monitor(controller: Weak<FocuserController>) {
    loop {
        let Some(controller) = controller.upgrade() else {
            return;
        };
        let idle_interval = controller.cfg.focuser.idle_interval();
        let moving_interval = controller.cfg.focuser.moving_interval();
        let command_timeout = controller.cfg.serial.timeout();

        let moving = {
            let state = controller.state.lock().await;
            if !state.connected {
                return;
            }
            state.moving
        };

        if !moving {
            drop(controller);
            tokio::time::sleep(idle_interval).await;
            continue;
        }

        let events = match controller.port.drain_events().await {
            Ok(events) => events,
            Err(err) => {
                tracing::warn!(%err, "status drain failed");
                Vec::new()
            }
        };

        {
            let mut state = controller.state.lock().await;
            for event in events {
                controller.apply_event(&mut state, event);
            }

            if state.finish_seen {
                controller.finish_move(&mut state).await;
            } else if state.moving {
                let overdue = state
                    .halt_deadline
                    .is_some_and(|deadline| Instant::now() >= deadline);
                if overdue {
                    tracing::warn!("halt terminator missed; forcing idle state");
                    controller.finish_move(&mut state).await;
                } else if state.last_event.elapsed() > command_timeout {
                    // No status bytes for a whole command timeout: the
                    // terminator was probably lost. Ask the hardware.
                    if let Err(err) = controller.refresh_position(&mut state).await {
                        tracing::warn!(%err, "stall refresh failed");
                    } else if state.position.abs_diff(state.target) <= MOVE_TOLERANCE {
                        tracing::warn!(
                            position = state.position,
                            "movement terminator lost; target reached"
                        );
                        state.moving = false;
                        state.halt_deadline = None;
                    }
                    state.last_event = Instant::now();
                }
            }
        }

        drop(controller);
        tokio::time::sleep(moving_interval).await;
    }
}

fn stale(last: Option<Instant>, max_age: Duration) -> bool {
    last.map_or(true, |instant| instant.elapsed() > max_age)
}
