//! The PCI protocol engine.
//!
//! Owns the transport, the receive buffer, the confirmation tag pool, the
//! in-flight command records, the group database, and both periodic
//! controllers. Everything runs in one logical control context: the event
//! loop in [`conn`](crate::conn) feeds inbound bytes through [`Engine::feed`]
//! and drives deadlines through [`Engine::tick`], passing explicit monotonic
//! `Instant`s so the whole machine is deterministic under test.
//!
//! Callbacks on [`Events`] are invoked in-context and must not block.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::codec;
use crate::frame::RxBuffer;
use crate::group::GroupDb;
use crate::packet::{self, Packet};
use crate::periodic::{ClockSync, Resync, RESYNC_BLOCK};
use crate::protocol::{
    lighting, Cal, ClockSal, LightingSal, Sal, StatusKind, TemperatureSal, WallTime,
    APP_STATUS_REQUEST,
};
use crate::tags::TagPool;
use crate::transport::PciTransport;

/// Time allowed for the PCI to confirm a command.
pub const CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);
/// Gap between retransmissions after the first timeout.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);
/// Time allowed for the reset echo after `~~~`.
const RESET_ECHO_TIMEOUT: Duration = Duration::from_secs(5);
/// PCI error frames within [`PCI_ERROR_WINDOW`] that count as flooding.
const PCI_ERROR_FLOOD: usize = 5;
const PCI_ERROR_WINDOW: Duration = Duration::from_secs(10);

/// What to do when the PCI answers a command with `!`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackPolicy {
    /// Count it as a failed attempt and retransmit (default).
    Retry,
    /// Give up on the command immediately.
    Abandon,
}

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Source address stamped on outbound point-to-multipoint packets.
    pub source_address: u8,
    /// Lighting applications in use (drives resync coverage).
    pub lighting_apps: Vec<u8>,
    pub confirm_timeout: Duration,
    pub retry_interval: Duration,
    /// Upper bound on on-wire transmissions per confirmable command.
    pub max_attempts: u8,
    pub clock_interval: Duration,
    /// Zero disables resync.
    pub resync_interval: Duration,
    pub nack_policy: NackPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            source_address: 0xFF,
            lighting_apps: vec![crate::protocol::APP_LIGHTING],
            confirm_timeout: CONFIRM_TIMEOUT,
            retry_interval: RETRY_INTERVAL,
            max_attempts: 3,
            clock_interval: Duration::from_secs(300),
            resync_interval: Duration::from_secs(300),
            nack_policy: NackPolicy::Retry,
        }
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Resetting,
    Ready,
    Error,
}

/// Terminal outcome of a confirmable send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Confirmed,
    Abandoned,
    ConnectionLost,
}

/// One-shot handle resolved when a command reaches its terminal outcome.
pub struct Completion {
    rx: mpsc::Receiver<SendOutcome>,
}

impl Completion {
    pub fn wait(&self) -> SendOutcome {
        self.rx.recv().unwrap_or(SendOutcome::ConnectionLost)
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<SendOutcome> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_get(&self) -> Option<SendOutcome> {
        self.rx.try_recv().ok()
    }

    pub(crate) fn resolved(outcome: SendOutcome) -> Self {
        let (tx, rx) = mpsc::channel();
        let _ = tx.send(outcome);
        Self { rx }
    }
}

/// Terminal outcome of a status request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusOutcome {
    /// The first level report falling inside the requested block.
    Levels { block_start: u8, levels: Vec<u8> },
    Timeout,
    ConnectionLost,
}

/// One-shot handle resolved when a status request completes.
pub struct StatusCompletion {
    rx: mpsc::Receiver<StatusOutcome>,
}

impl StatusCompletion {
    pub fn wait(&self) -> StatusOutcome {
        self.rx.recv().unwrap_or(StatusOutcome::ConnectionLost)
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<StatusOutcome> {
        self.rx.recv_timeout(timeout).ok()
    }
}

/// Inbound event callbacks delivered to the bridge.
///
/// Invoked from the engine's control context; implementations must hand work
/// off (e.g. into a channel) rather than block.
pub trait Events: Send {
    fn on_lighting_on(&mut self, _application: u8, _group: u8) {}
    fn on_lighting_off(&mut self, _application: u8, _group: u8) {}
    fn on_lighting_ramp(&mut self, _application: u8, _group: u8, _level: u8, _duration: u16) {}
    fn on_clock_update(&mut self, _sal: &ClockSal) {}
    fn on_temperature(&mut self, _group: u8, _degrees: u8) {}
    fn on_level_report(&mut self, _application: u8, _block_start: u8, _levels: &[u8]) {}
    /// A cached level changed (level report path only; the SAL callbacks
    /// above already cover broadcast changes).
    fn on_level_changed(&mut self, _application: u8, _group: u8, _level: u8) {}
    fn on_connected(&mut self) {}
    fn on_disconnected(&mut self, _reason: &str) {}
    fn on_command_abandoned(&mut self, _op: &'static str) {}
}

/// No-op event sink.
pub struct NullEvents;

impl Events for NullEvents {}

struct Inflight {
    tag: u8,
    frame: Vec<u8>,
    attempts_remaining: u8,
    deadline: Instant,
    completer: mpsc::Sender<SendOutcome>,
    op: &'static str,
}

struct PendingSend {
    body: Vec<u8>,
    completer: mpsc::Sender<SendOutcome>,
    op: &'static str,
}

struct StatusWait {
    application: u8,
    block_start: u8,
    deadline: Instant,
    completer: Option<mpsc::Sender<StatusOutcome>>,
    from_resync: bool,
}

/// The protocol engine. See the module docs for the ownership model.
pub struct Engine<E: Events> {
    cfg: EngineConfig,
    state: LinkState,
    transport: Option<Box<dyn PciTransport>>,
    rx: RxBuffer,
    tags: TagPool,
    inflight: Vec<Inflight>,
    waiters: VecDeque<PendingSend>,
    status_waits: Vec<StatusWait>,
    groups: Arc<GroupDb>,
    clock: ClockSync,
    resync: Resync,
    reset_deadline: Option<Instant>,
    pci_errors: VecDeque<Instant>,
    wall: fn() -> WallTime,
    events: E,
}

impl<E: Events> Engine<E> {
    pub fn new(cfg: EngineConfig, events: E) -> Self {
        let clock = ClockSync::new(cfg.clock_interval);
        let resync = Resync::new(cfg.resync_interval);
        Self {
            cfg,
            state: LinkState::Disconnected,
            transport: None,
            rx: RxBuffer::new(),
            tags: TagPool::new(),
            inflight: Vec::new(),
            waiters: VecDeque::new(),
            status_waits: Vec::new(),
            groups: Arc::new(GroupDb::new()),
            clock,
            resync,
            reset_deadline: None,
            pci_errors: VecDeque::new(),
            wall: WallTime::now,
            events,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Shared read-only view of the cached group levels.
    pub fn groups(&self) -> Arc<GroupDb> {
        self.groups.clone()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Take ownership of a freshly opened transport and begin normalising
    /// the PCI: a `~~~` burst, the interface-options frame that enables
    /// smart mode, then wait for the reset echo.
    pub fn attach(&mut self, transport: Box<dyn PciTransport>, now: Instant) {
        self.transport = Some(transport);
        self.state = LinkState::Connecting;
        info!("transport ready, resetting PCI");
        if !self.write(b"~~~") {
            return;
        }
        let smart_mode = packet::wrap_body(&[0xA3, 0x30, 0x00]);
        if !self.write(&smart_mode) {
            return;
        }
        self.state = LinkState::Resetting;
        self.reset_deadline = Some(now + RESET_ECHO_TIMEOUT);
    }

    /// Orderly shutdown: drain everything and stop both controllers.
    pub fn close(&mut self) {
        if self.state == LinkState::Disconnected {
            return;
        }
        self.drain("closed");
        self.state = LinkState::Disconnected;
    }

    /// Fatal failure: drain, drop the transport, and park in `Error` until
    /// the event loop settles it into `Disconnected` for reconnect.
    fn fail(&mut self, reason: &str) {
        if matches!(self.state, LinkState::Disconnected | LinkState::Error) {
            return;
        }
        warn!("connection failed: {reason}");
        self.drain(reason);
        self.state = LinkState::Error;
    }

    fn drain(&mut self, reason: &str) {
        for rec in self.inflight.drain(..) {
            let _ = rec.completer.send(SendOutcome::ConnectionLost);
        }
        for pending in self.waiters.drain(..) {
            let _ = pending.completer.send(SendOutcome::ConnectionLost);
        }
        for wait in self.status_waits.drain(..) {
            if let Some(completer) = wait.completer {
                let _ = completer.send(StatusOutcome::ConnectionLost);
            }
        }
        self.tags.reset();
        self.rx.clear();
        self.clock.stop();
        self.resync.stop();
        self.reset_deadline = None;
        self.pci_errors.clear();
        if let Some(mut transport) = self.transport.take() {
            transport.shutdown();
        }
        self.events.on_disconnected(reason);
    }

    /// The transport reported end-of-stream or an I/O error.
    pub fn transport_lost(&mut self, reason: &str) {
        self.fail(reason);
    }

    // -----------------------------------------------------------------------
    // Event surface
    // -----------------------------------------------------------------------

    pub fn lighting_on(&mut self, application: u8, group: u8, now: Instant) -> Completion {
        self.send_lighting(
            application,
            LightingSal::On { group },
            "lighting on",
            now,
        )
    }

    pub fn lighting_off(&mut self, application: u8, group: u8, now: Instant) -> Completion {
        self.send_lighting(
            application,
            LightingSal::Off { group },
            "lighting off",
            now,
        )
    }

    /// Ramp to `level` over (at least) `duration_secs`, using the smallest
    /// ramp code that covers the request.
    pub fn lighting_ramp(
        &mut self,
        application: u8,
        group: u8,
        level: u8,
        duration_secs: u16,
        now: Instant,
    ) -> Completion {
        self.send_lighting(
            application,
            LightingSal::Ramp {
                group,
                level,
                duration_code: lighting::duration_code_for(duration_secs),
            },
            "lighting ramp",
            now,
        )
    }

    /// Request a level report for the block containing `block_start`.
    pub fn request_status(
        &mut self,
        application: u8,
        block_start: u8,
        now: Instant,
    ) -> StatusCompletion {
        let (tx, rx) = mpsc::channel();
        if self.state != LinkState::Ready {
            let _ = tx.send(StatusOutcome::ConnectionLost);
            return StatusCompletion { rx };
        }
        self.send_status_request(application, block_start, Some(tx), false, now);
        StatusCompletion { rx }
    }

    /// Force a clock broadcast outside its schedule.
    pub fn publish_time(&mut self, now: Instant) {
        self.clock.force();
        self.maybe_emit_clock(now);
    }

    fn send_lighting(
        &mut self,
        application: u8,
        sal: LightingSal,
        op: &'static str,
        now: Instant,
    ) -> Completion {
        self.send_pm(application, vec![Sal::Lighting(sal)], op, true, now)
    }

    /// Build and submit a point-to-multipoint packet.
    ///
    /// With confirmation, the caller observes exactly one terminal outcome;
    /// without, the completion resolves as soon as the bytes are handed to
    /// the transport.
    fn send_pm(
        &mut self,
        application: u8,
        sals: Vec<Sal>,
        op: &'static str,
        confirm: bool,
        now: Instant,
    ) -> Completion {
        if self.state != LinkState::Ready {
            return Completion::resolved(SendOutcome::ConnectionLost);
        }
        let body = Packet::PointToMultipoint {
            source: self.cfg.source_address,
            application,
            sals,
        }
        .encode_body();

        if !confirm {
            let frame = packet::wrap_body(&body);
            return if self.write(&frame) {
                Completion::resolved(SendOutcome::Confirmed)
            } else {
                Completion::resolved(SendOutcome::ConnectionLost)
            };
        }

        let (tx, rx) = mpsc::channel();
        match self.tags.acquire() {
            Some(tag) => self.dispatch_send(body, tag, tx, op, now),
            None => {
                debug!("all confirmation tags lent, queueing {op}");
                self.waiters.push_back(PendingSend {
                    body,
                    completer: tx,
                    op,
                });
            }
        }
        Completion { rx }
    }

    fn dispatch_send(
        &mut self,
        mut body: Vec<u8>,
        tag: u8,
        completer: mpsc::Sender<SendOutcome>,
        op: &'static str,
        now: Instant,
    ) {
        body.push(tag);
        let frame = packet::wrap_body(&body);
        self.inflight.push(Inflight {
            tag,
            frame: frame.clone(),
            attempts_remaining: self.cfg.max_attempts.saturating_sub(1),
            deadline: now + self.cfg.confirm_timeout,
            completer,
            op,
        });
        self.write(&frame);
    }

    fn send_status_request(
        &mut self,
        application: u8,
        block_start: u8,
        completer: Option<mpsc::Sender<StatusOutcome>>,
        from_resync: bool,
        now: Instant,
    ) {
        let frame = Packet::PointToPoint {
            unit: 0xFF,
            application: APP_STATUS_REQUEST,
            cal: Cal::StatusRequest {
                level: true,
                application,
                block_start,
            },
        }
        .encode_frame();
        self.status_waits.push(StatusWait {
            application,
            block_start,
            deadline: now + self.cfg.confirm_timeout,
            completer,
            from_resync,
        });
        self.write(&frame);
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Feed bytes read from the transport.
    pub fn feed(&mut self, data: &[u8], now: Instant) {
        for extracted in self.rx.feed(data) {
            match extracted {
                Ok(body) => match Packet::decode(&body) {
                    Ok(packet) => self.dispatch(packet, now),
                    Err(e) => {
                        warn!("dropping packet [{}]: {e}", codec::hex_string(&body))
                    }
                },
                Err(e) => warn!("dropping frame: {e}"),
            }
        }
    }

    fn dispatch(&mut self, packet: Packet, now: Instant) {
        match packet {
            Packet::Reset => self.on_reset_echo(now),
            Packet::Confirmation { tag, success } => self.on_confirmation(tag, success, now),
            Packet::PciError => self.on_pci_error(now),
            Packet::PointToMultipoint {
                source,
                application,
                sals,
            } => {
                debug!(
                    "PM from {source:02X} app {application:02X}: {} SAL(s)",
                    sals.len()
                );
                for sal in sals {
                    self.apply_sal(application, sal, now);
                }
            }
            Packet::PointToPoint {
                unit,
                application,
                cal,
            } => self.apply_cal(unit, application, cal, now),
        }
    }

    fn on_reset_echo(&mut self, now: Instant) {
        if self.state != LinkState::Resetting {
            debug!("unsolicited reset echo");
            return;
        }
        info!("PCI reset complete");
        self.state = LinkState::Ready;
        self.reset_deadline = None;
        self.clock.start(now);
        self.resync.start(now);
        self.events.on_connected();
        self.pump_resync(now);
    }

    fn on_confirmation(&mut self, tag: u8, success: bool, now: Instant) {
        let Some(idx) = self.inflight.iter().position(|rec| rec.tag == tag) else {
            debug!("confirmation for unknown tag '{}'", tag as char);
            return;
        };
        if success {
            let rec = self.inflight.swap_remove(idx);
            let _ = rec.completer.send(SendOutcome::Confirmed);
            self.tags.release(rec.tag);
            self.pump_waiters(now);
        } else {
            debug!("NACK for tag '{}'", tag as char);
            match self.cfg.nack_policy {
                NackPolicy::Retry => self.consume_attempt(idx, now),
                NackPolicy::Abandon => self.abandon(idx, now),
            }
        }
    }

    fn on_pci_error(&mut self, now: Instant) {
        warn!("PCI reported a frame error");
        self.pci_errors.push_back(now);
        while let Some(&front) = self.pci_errors.front() {
            if now.duration_since(front) > PCI_ERROR_WINDOW {
                self.pci_errors.pop_front();
            } else {
                break;
            }
        }
        // In-flight frames are left alone; each will retry on its own
        // deadline. Flooding means the link itself is sick.
        if self.pci_errors.len() >= PCI_ERROR_FLOOD {
            self.fail("PCI error flood");
        }
    }

    fn apply_sal(&mut self, application: u8, sal: Sal, now: Instant) {
        match sal {
            Sal::Lighting(LightingSal::On { group }) => {
                self.groups.set_level(application, group, 255);
                self.events.on_lighting_on(application, group);
            }
            Sal::Lighting(LightingSal::Off { group }) => {
                self.groups.set_level(application, group, 0);
                self.events.on_lighting_off(application, group);
            }
            Sal::Lighting(LightingSal::Ramp {
                group,
                level,
                duration_code,
            }) => {
                self.groups.set_level(application, group, level);
                let duration = lighting::RAMP_DURATIONS[duration_code.min(15) as usize];
                self.events
                    .on_lighting_ramp(application, group, level, duration);
            }
            Sal::Lighting(LightingSal::TerminateRamp { group }) => {
                debug!("ramp terminated for group {group} (level unknown)");
            }
            Sal::Clock(ClockSal::Request { attribute }) => {
                debug!("clock request for attribute {attribute}");
                self.clock.note_request(now);
            }
            Sal::Clock(update) => self.events.on_clock_update(&update),
            Sal::Temperature(TemperatureSal::Broadcast { group, degrees }) => {
                self.events.on_temperature(group, degrees);
            }
        }
    }

    fn apply_cal(&mut self, unit: u8, application: u8, cal: Cal, now: Instant) {
        match cal {
            Cal::StatusReport {
                kind: StatusKind::Level,
                block_start,
                data,
            } => {
                for (i, &level) in data.iter().enumerate() {
                    let group = block_start.wrapping_add(i as u8);
                    if self.groups.set_level(application, group, level) {
                        self.events.on_level_changed(application, group, level);
                    }
                }
                self.events
                    .on_level_report(application, block_start, &data);
                self.complete_status_wait(application, block_start, &data, now);
            }
            Cal::StatusReport {
                kind: StatusKind::Binary,
                block_start,
                ..
            } => debug!("binary status report from block {block_start} ignored"),
            Cal::IdentifyReply { attribute, value } => {
                debug!("unit {unit:02X} identify attribute {attribute}: {value}");
            }
            Cal::Reply { parameter, value } => {
                debug!("unit {unit:02X} replied parameter {parameter:02X}: {value:02X?}");
            }
            Cal::Acknowledge => debug!("unit {unit:02X} acknowledged"),
            Cal::StatusRequest { .. } => debug!("ignoring inbound status request"),
        }
    }

    /// Resolve the oldest status wait whose block covers this report.
    fn complete_status_wait(
        &mut self,
        application: u8,
        block_start: u8,
        levels: &[u8],
        now: Instant,
    ) {
        let Some(idx) = self.status_waits.iter().position(|wait| {
            wait.application == application
                && block_start >= wait.block_start
                && u16::from(block_start) < u16::from(wait.block_start) + u16::from(RESYNC_BLOCK)
        }) else {
            return;
        };
        let wait = self.status_waits.remove(idx);
        if let Some(completer) = wait.completer {
            let _ = completer.send(StatusOutcome::Levels {
                block_start,
                levels: levels.to_vec(),
            });
        }
        if wait.from_resync {
            self.resync.request_done();
            self.pump_resync(now);
        }
    }

    // -----------------------------------------------------------------------
    // Deadlines
    // -----------------------------------------------------------------------

    /// Drive every deadline that has passed. Called by the event loop after
    /// each read (or read timeout).
    pub fn tick(&mut self, now: Instant) {
        if self.state == LinkState::Error {
            self.state = LinkState::Disconnected;
            return;
        }
        if self.state == LinkState::Resetting
            && self.reset_deadline.is_some_and(|t| now >= t)
        {
            self.fail("no reset echo from PCI");
            return;
        }

        // Confirmation timeouts.
        loop {
            let Some(idx) = self
                .inflight
                .iter()
                .position(|rec| now >= rec.deadline)
            else {
                break;
            };
            self.consume_attempt(idx, now);
            if self.state != LinkState::Ready && self.state != LinkState::Resetting {
                return;
            }
        }

        // Status request timeouts.
        loop {
            let Some(idx) = self
                .status_waits
                .iter()
                .position(|wait| now >= wait.deadline)
            else {
                break;
            };
            let wait = self.status_waits.remove(idx);
            debug!(
                "status request for app {:02X} block {} timed out",
                wait.application, wait.block_start
            );
            if let Some(completer) = wait.completer {
                let _ = completer.send(StatusOutcome::Timeout);
            }
            if wait.from_resync {
                self.resync.request_done();
            }
        }

        if self.state == LinkState::Ready {
            self.maybe_emit_clock(now);
            self.pump_resync(now);
        }
    }

    /// The earliest instant at which `tick` has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut next: Option<Instant> = self.reset_deadline;
        let mut fold = |candidate: Option<Instant>| {
            next = match (next, candidate) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        };
        fold(self.inflight.iter().map(|rec| rec.deadline).min());
        fold(self.status_waits.iter().map(|wait| wait.deadline).min());
        fold(self.clock.next_deadline());
        fold(self.resync.next_deadline());
        next
    }

    /// One transmission attempt burned (timeout or NACK): retransmit if any
    /// attempts remain, otherwise give the command up.
    fn consume_attempt(&mut self, idx: usize, now: Instant) {
        let rec = &mut self.inflight[idx];
        if rec.attempts_remaining == 0 {
            self.abandon(idx, now);
            return;
        }
        rec.attempts_remaining -= 1;
        rec.deadline = now + self.cfg.retry_interval;
        let frame = rec.frame.clone();
        debug!(
            "retransmitting '{}' (tag '{}', {} attempt(s) left)",
            rec.op, rec.tag as char, rec.attempts_remaining
        );
        self.write(&frame);
    }

    fn abandon(&mut self, idx: usize, now: Instant) {
        let rec = self.inflight.swap_remove(idx);
        warn!("abandoning '{}' (tag '{}')", rec.op, rec.tag as char);
        let _ = rec.completer.send(SendOutcome::Abandoned);
        self.tags.release(rec.tag);
        self.events.on_command_abandoned(rec.op);
        self.pump_waiters(now);
    }

    fn pump_waiters(&mut self, now: Instant) {
        while let Some(pending) = self.waiters.pop_front() {
            match self.tags.acquire() {
                Some(tag) => {
                    self.dispatch_send(pending.body, tag, pending.completer, pending.op, now)
                }
                None => {
                    self.waiters.push_front(pending);
                    break;
                }
            }
        }
    }

    fn maybe_emit_clock(&mut self, now: Instant) {
        if self.state != LinkState::Ready || !self.clock.due(now) {
            return;
        }
        let stamp = (self.wall)();
        debug!(
            "broadcasting clock {:02}:{:02}:{:02}",
            stamp.hour, stamp.minute, stamp.second
        );
        let sals = vec![Sal::Clock(stamp.date_sal()), Sal::Clock(stamp.time_sal())];
        self.send_pm(crate::protocol::APP_CLOCK, sals, "clock broadcast", false, now);
        self.clock.emitted(now);
    }

    fn pump_resync(&mut self, now: Instant) {
        if self.state != LinkState::Ready {
            return;
        }
        let apps = self.cfg.lighting_apps.clone();
        for (application, block_start) in self.resync.poll(now, &apps) {
            if self.state != LinkState::Ready {
                break;
            }
            debug!("resync: requesting app {application:02X} block {block_start}");
            self.send_status_request(application, block_start, None, true, now);
        }
    }

    // -----------------------------------------------------------------------
    // Transport
    // -----------------------------------------------------------------------

    /// Read once from the transport, waiting up to `timeout`, and feed any
    /// bytes through the framer. A read timeout is the event loop's idle
    /// tick and is not an error.
    pub fn poll_transport(&mut self, timeout: Duration, now: Instant) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        let mut buf = [0u8; 4096];
        match transport.read(&mut buf, timeout) {
            Ok(0) => self.transport_lost("transport closed"),
            Ok(n) => {
                let data = buf[..n].to_vec();
                self.feed(&data, now);
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::Interrupted
                ) => {}
            Err(e) => self.transport_lost(&format!("transport read failed: {e}")),
        }
    }

    /// Write bytes to the transport. On failure the connection is failed and
    /// `false` is returned; callers must not touch drained state afterwards.
    fn write(&mut self, bytes: &[u8]) -> bool {
        let Some(transport) = self.transport.as_mut() else {
            return false;
        };
        match transport.write_all(bytes) {
            Ok(()) => true,
            Err(e) => {
                self.fail(&format!("transport write failed: {e}"));
                false
            }
        }
    }

    #[cfg(test)]
    fn set_wall_clock(&mut self, wall: fn() -> WallTime) {
        self.wall = wall;
    }

    #[cfg(test)]
    fn tag_counts(&self) -> (usize, usize) {
        (self.tags.free_count(), self.tags.lent_count())
    }

    #[cfg(test)]
    fn inflight_count(&self) -> usize {
        self.inflight.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::transport::testing::{MockHandle, MockTransport};
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl Recorder {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }

        fn log(&self, entry: String) {
            self.0.lock().unwrap().push(entry);
        }
    }

    impl Events for Recorder {
        fn on_lighting_on(&mut self, application: u8, group: u8) {
            self.log(format!("on {application:02X} {group}"));
        }
        fn on_lighting_off(&mut self, application: u8, group: u8) {
            self.log(format!("off {application:02X} {group}"));
        }
        fn on_lighting_ramp(&mut self, application: u8, group: u8, level: u8, duration: u16) {
            self.log(format!("ramp {application:02X} {group} {level} {duration}"));
        }
        fn on_level_report(&mut self, application: u8, block_start: u8, levels: &[u8]) {
            self.log(format!(
                "report {application:02X} {block_start} {levels:?}"
            ));
        }
        fn on_connected(&mut self) {
            self.log("connected".into());
        }
        fn on_disconnected(&mut self, reason: &str) {
            self.log(format!("disconnected: {reason}"));
        }
        fn on_command_abandoned(&mut self, op: &'static str) {
            self.log(format!("abandoned: {op}"));
        }
    }

    fn ready_engine(cfg: EngineConfig) -> (Engine<Recorder>, MockHandle, Recorder, Instant) {
        let recorder = Recorder::default();
        let mut engine = Engine::new(cfg, recorder.clone());
        let (transport, handle) = MockTransport::pair();
        let t0 = Instant::now();
        engine.attach(Box::new(transport), t0);
        // Drop the reset burst so tests see only their own traffic; the
        // echo below may immediately trigger the first resync requests.
        handle.clear_writes();
        engine.feed(b"~", t0);
        assert_eq!(engine.state(), LinkState::Ready);
        recorder.take();
        (engine, handle, recorder, t0)
    }

    fn no_resync_cfg() -> EngineConfig {
        EngineConfig {
            resync_interval: Duration::ZERO,
            ..EngineConfig::default()
        }
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn reset_sequence_on_attach() {
        let mut engine = Engine::new(no_resync_cfg(), NullEvents);
        let (transport, handle) = MockTransport::pair();
        let t0 = Instant::now();
        engine.attach(Box::new(transport), t0);
        assert_eq!(engine.state(), LinkState::Resetting);
        let writes = handle.writes();
        assert_eq!(writes[0], b"~~~");
        // Interface-options frame: A3 30 00 + checksum 2D.
        assert_eq!(writes[1], b"\\A330002D\r");
    }

    #[test]
    fn reset_echo_timeout_fails_link() {
        let mut engine = Engine::new(no_resync_cfg(), NullEvents);
        let (transport, _handle) = MockTransport::pair();
        let t0 = Instant::now();
        engine.attach(Box::new(transport), t0);
        engine.tick(t0 + secs(6));
        assert_eq!(engine.state(), LinkState::Error);
        engine.tick(t0 + secs(6));
        assert_eq!(engine.state(), LinkState::Disconnected);
    }

    #[test]
    fn lighting_on_confirmed() {
        // The worked example: app 0x38, group 100, first free tag.
        let (mut engine, handle, _rec, t0) = ready_engine(no_resync_cfg());
        let completion = engine.lighting_on(0x38, 100, t0);

        let writes = handle.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0], b"\\05FF38007964687F\r");

        engine.feed(b"h.\r", t0 + secs(1));
        assert_eq!(completion.try_get(), Some(SendOutcome::Confirmed));
        assert_eq!(engine.tag_counts(), (20, 0));
        assert_eq!(engine.inflight_count(), 0);
    }

    #[test]
    fn retry_then_abandon() {
        // 30s confirm window, then two 1s retries: exactly 3 transmissions.
        let (mut engine, handle, rec, t0) = ready_engine(no_resync_cfg());
        let completion = engine.lighting_on(0x38, 100, t0);

        engine.tick(t0 + secs(29));
        assert_eq!(handle.writes().len(), 1);

        engine.tick(t0 + secs(30));
        assert_eq!(handle.writes().len(), 2);
        engine.tick(t0 + secs(31));
        assert_eq!(handle.writes().len(), 3);
        assert!(completion.try_get().is_none());

        engine.tick(t0 + secs(32));
        assert_eq!(handle.writes().len(), 3);
        assert_eq!(completion.try_get(), Some(SendOutcome::Abandoned));
        assert_eq!(engine.tag_counts(), (20, 0));
        assert!(rec.take().contains(&"abandoned: lighting on".to_string()));

        // All three transmissions are byte-identical.
        let writes = handle.writes();
        assert_eq!(writes[0], writes[1]);
        assert_eq!(writes[1], writes[2]);
    }

    #[test]
    fn nack_counts_as_attempt() {
        let (mut engine, handle, _rec, t0) = ready_engine(no_resync_cfg());
        let completion = engine.lighting_on(0x38, 1, t0);
        engine.feed(b"h!\r", t0 + secs(1));
        assert_eq!(handle.writes().len(), 2);
        engine.feed(b"h!\r", t0 + secs(2));
        assert_eq!(handle.writes().len(), 3);
        engine.feed(b"h!\r", t0 + secs(3));
        assert_eq!(handle.writes().len(), 3);
        assert_eq!(completion.try_get(), Some(SendOutcome::Abandoned));
    }

    #[test]
    fn tag_pool_exhaustion_queues_fifo() {
        let (mut engine, handle, _rec, t0) = ready_engine(no_resync_cfg());
        let mut completions = Vec::new();
        for group in 0..22u8 {
            completions.push(engine.lighting_on(0x38, group, t0));
        }
        // 20 frames written, 2 queued behind the tag pool.
        assert_eq!(handle.writes().len(), 20);
        assert_eq!(engine.tag_counts(), (0, 20));

        // Confirm tag 'h'; the first waiter goes out with the released tag.
        engine.feed(b"h.\r", t0 + secs(1));
        assert_eq!(handle.writes().len(), 21);
        assert_eq!(completions[0].try_get(), Some(SendOutcome::Confirmed));
        // The 21st frame is for group 20, tagged with 'h' again.
        let frame = &handle.writes()[20];
        let body = codec::decode_hex(&frame[1..frame.len() - 1]).unwrap();
        assert_eq!(body[5], 20);
        assert_eq!(body[6], b'h');
    }

    #[test]
    fn level_report_dispatch() {
        // Level report for block 0x40, groups alternating full/off.
        let (mut engine, _handle, rec, t0) = ready_engine(no_resync_cfg());
        let mut body = vec![0x06, 0xFF, 0x38, 0xF0, 0x40];
        for i in 0..16u8 {
            let level = if i % 2 == 0 { 0xFF } else { 0x00 };
            let lo = level & 0x0F;
            let hi = level >> 4;
            body.push(lo << 4 | lo);
            body.push(hi << 4 | hi);
        }
        let frame = packet::wrap_body(&body);
        engine.feed(&frame, t0);

        let events = rec.take();
        let reports: Vec<_> = events.iter().filter(|e| e.starts_with("report")).collect();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].starts_with("report 38 64"));

        let groups = engine.groups();
        assert_eq!(groups.level(0x38, 64), Some(255));
        assert_eq!(groups.level(0x38, 65), Some(0));
        assert_eq!(groups.level(0x38, 79), Some(0));
        assert_eq!(groups.known(), 16);
    }

    #[test]
    fn corrupt_frame_interleaved() {
        // A bad hex frame followed by a valid lighting-on broadcast.
        let (mut engine, _handle, rec, t0) = ready_engine(no_resync_cfg());
        let mut stream = b"\\05FFzz\r".to_vec();
        stream.extend_from_slice(&packet::wrap_body(&[0x05, 0xFF, 0x38, 0x00, 0x79, 0x64]));
        engine.feed(&stream, t0);
        let events = rec.take();
        assert_eq!(events, vec!["on 38 100".to_string()]);
        assert_eq!(engine.groups().level(0x38, 100), Some(255));
    }

    #[test]
    fn sal_prefix_dispatched_before_bad_tail() {
        // On(100) decodes, then a truncated ramp item: the good item still
        // fires its callback and updates the cache.
        let (mut engine, _handle, rec, t0) = ready_engine(no_resync_cfg());
        let frame = packet::wrap_body(&[0x05, 0xFF, 0x38, 0x00, 0x79, 0x64, 0x22, 0x05]);
        engine.feed(&frame, t0);
        assert_eq!(rec.take(), vec!["on 38 100".to_string()]);
        assert_eq!(engine.groups().level(0x38, 100), Some(255));
    }

    #[test]
    fn checksum_failure_fires_no_callbacks() {
        let (mut engine, _handle, rec, t0) = ready_engine(no_resync_cfg());
        let mut frame = packet::wrap_body(&[0x05, 0xFF, 0x38, 0x00, 0x79, 0x64]);
        // Corrupt one hex digit of the group byte.
        frame[10] = b'0';
        engine.feed(&frame, t0);
        assert!(rec.take().is_empty());
    }

    fn test_wall() -> WallTime {
        WallTime {
            year: 2026,
            month: 8,
            day: 1,
            weekday: 6,
            hour: 12,
            minute: 0,
            second: 0,
            fractional: 0,
        }
    }

    #[test]
    fn clock_request_answered_and_coalesced() {
        // A clock request is answered once within the coalescing window.
        let (mut engine, handle, _rec, t0) = ready_engine(no_resync_cfg());
        engine.set_wall_clock(test_wall);

        let request = packet::wrap_body(&[0x05, 0x20, 0xDF, 0x00, 0x11, 0x01]);
        engine.feed(&request, t0);
        engine.tick(t0);

        let writes = handle.writes();
        assert_eq!(writes.len(), 1);
        let body = codec::decode_hex(&writes[0][1..writes[0].len() - 1]).unwrap();
        // PM to the clock application carrying date then time updates.
        assert_eq!(&body[..4], &[0x05, 0xFF, 0xDF, 0x00]);
        assert_eq!(&body[4..11], &[0x08, 0x02, 0x07, 0xEA, 0x08, 0x01, 0x06]);
        assert_eq!(&body[11..17], &[0x08, 0x01, 12, 0, 0, 0]);

        // A second request half a second later is coalesced.
        engine.feed(&request, t0 + Duration::from_millis(500));
        engine.tick(t0 + Duration::from_millis(600));
        assert_eq!(handle.writes().len(), 1);
    }

    #[test]
    fn publish_time_is_immediate() {
        let (mut engine, handle, _rec, t0) = ready_engine(no_resync_cfg());
        engine.set_wall_clock(test_wall);
        engine.publish_time(t0);
        assert_eq!(handle.writes().len(), 1);
    }

    #[test]
    fn disconnect_drains_everything() {
        // Closing the transport drains tags, in-flight records, and timers.
        let (mut engine, handle, rec, t0) = ready_engine(no_resync_cfg());
        let c1 = engine.lighting_on(0x38, 1, t0);
        let c2 = engine.lighting_on(0x38, 2, t0);
        assert_eq!(engine.tag_counts(), (18, 2));

        handle.close();
        engine.transport_lost("transport closed");

        assert_eq!(c1.try_get(), Some(SendOutcome::ConnectionLost));
        assert_eq!(c2.try_get(), Some(SendOutcome::ConnectionLost));
        assert_eq!(engine.tag_counts(), (20, 0));
        assert_eq!(engine.inflight_count(), 0);
        assert!(engine.next_deadline().is_none());
        assert!(rec
            .take()
            .contains(&"disconnected: transport closed".to_string()));
    }

    #[test]
    fn close_resolves_pending_sends() {
        let (mut engine, _handle, _rec, t0) = ready_engine(no_resync_cfg());
        let completion = engine.lighting_on(0x38, 1, t0);
        engine.close();
        assert_eq!(engine.state(), LinkState::Disconnected);
        assert_eq!(completion.wait(), SendOutcome::ConnectionLost);
    }

    #[test]
    fn send_while_disconnected_resolves_immediately() {
        let mut engine = Engine::new(no_resync_cfg(), NullEvents);
        let completion = engine.lighting_on(0x38, 1, Instant::now());
        assert_eq!(completion.wait(), SendOutcome::ConnectionLost);
    }

    #[test]
    fn resync_sweep_requests_status() {
        let cfg = EngineConfig::default();
        let (mut engine, handle, _rec, t0) = ready_engine(cfg);
        // Ready already pumped the first four requests of the initial sweep.
        let writes = handle.writes();
        assert_eq!(writes.len(), 4);
        let body = codec::decode_hex(&writes[0][1..writes[0].len() - 1]).unwrap();
        // PP to the status-request application: 06 FF FF 23 01 38 00 (+chk).
        assert_eq!(&body[..7], &[0x06, 0xFF, 0xFF, 0x23, 0x01, 0x38, 0x00]);

        // Answer block 0 with a level report; the next block goes out.
        let mut report = vec![0x06, 0xFF, 0x38, 0xF0, 0x00];
        report.extend_from_slice(&[0x00; 32]);
        engine.feed(&packet::wrap_body(&report), t0 + secs(1));
        assert_eq!(handle.writes().len(), 5);
    }

    #[test]
    fn resync_timeout_releases_slot() {
        let cfg = EngineConfig::default();
        let (mut engine, handle, _rec, t0) = ready_engine(cfg);
        assert_eq!(handle.writes().len(), 4);
        // Let all four outstanding requests time out; the sweep continues.
        engine.tick(t0 + secs(31));
        assert_eq!(handle.writes().len(), 8);
    }

    #[test]
    fn request_status_completes_with_levels() {
        let (mut engine, _handle, _rec, t0) = ready_engine(no_resync_cfg());
        let completion = engine.request_status(0x38, 0x40, t0);

        let mut report = vec![0x06, 0xFF, 0x38, 0xF0, 0x40];
        for _ in 0..16 {
            report.extend_from_slice(&[0xFF, 0xFF]);
        }
        engine.feed(&packet::wrap_body(&report), t0 + secs(1));

        match completion.wait_timeout(Duration::from_millis(10)) {
            Some(StatusOutcome::Levels { block_start, levels }) => {
                assert_eq!(block_start, 0x40);
                assert_eq!(levels, vec![255u8; 16]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn request_status_times_out() {
        let (mut engine, _handle, _rec, t0) = ready_engine(no_resync_cfg());
        let completion = engine.request_status(0x38, 0x40, t0);
        engine.tick(t0 + secs(31));
        assert_eq!(
            completion.wait_timeout(Duration::from_millis(10)),
            Some(StatusOutcome::Timeout)
        );
    }

    #[test]
    fn pci_error_flood_fails_link() {
        let (mut engine, _handle, rec, t0) = ready_engine(no_resync_cfg());
        for i in 0..4 {
            engine.feed(b"#", t0 + secs(i));
        }
        assert_eq!(engine.state(), LinkState::Ready);
        engine.feed(b"#", t0 + secs(4));
        assert_eq!(engine.state(), LinkState::Error);
        assert!(rec
            .take()
            .contains(&"disconnected: PCI error flood".to_string()));
    }

    #[test]
    fn isolated_pci_error_leaves_inflight_alone() {
        let (mut engine, _handle, _rec, t0) = ready_engine(no_resync_cfg());
        let completion = engine.lighting_on(0x38, 1, t0);
        engine.feed(b"#", t0 + secs(1));
        assert_eq!(engine.inflight_count(), 1);
        engine.feed(b"h.\r", t0 + secs(2));
        assert_eq!(completion.try_get(), Some(SendOutcome::Confirmed));
    }

    #[test]
    fn ramp_broadcast_updates_group_db() {
        let (mut engine, _handle, rec, t0) = ready_engine(no_resync_cfg());
        // Ramp group 3 to 0x80 with code 4 (20s).
        let frame = packet::wrap_body(&[0x05, 0x20, 0x38, 0x00, 0x22, 3, 0x80]);
        engine.feed(&frame, t0);
        assert_eq!(engine.groups().level(0x38, 3), Some(0x80));
        assert_eq!(rec.take(), vec!["ramp 38 3 128 20".to_string()]);
    }

    #[test]
    fn next_deadline_tracks_inflight() {
        let (mut engine, _handle, _rec, t0) = ready_engine(no_resync_cfg());
        assert_eq!(engine.next_deadline(), Some(t0 + secs(300)));
        engine.lighting_on(0x38, 1, t0);
        assert_eq!(engine.next_deadline(), Some(t0 + secs(30)));
    }
}
