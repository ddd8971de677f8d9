//! The engine's event-loop thread and the handle the bridge drives it with.
//!
//! All engine state lives on one thread. The loop polls the transport with a
//! short read timeout, drains the operation inbox, and drives deadlines —
//! the four suspension points of the protocol model. Reconnection uses
//! exponential backoff (1s doubling to a 60s cap), reset once the PCI
//! answers a reset.

use std::fmt;
use std::io;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::engine::{
    Completion, Engine, EngineConfig, Events, LinkState, SendOutcome, StatusCompletion,
};
use crate::group::GroupDb;
use crate::transport::{PciTransport, SerialTransport, TcpTransport};

/// Event-loop poll interval when nothing else is due.
const POLL: Duration = Duration::from_millis(100);
const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Where the PCI lives.
#[derive(Debug, Clone)]
pub enum PciAddr {
    /// `host:port` of a network PCI (or terminal server).
    Tcp(String),
    /// Serial device path, driven at 9600 8N1.
    Serial(String),
}

impl fmt::Display for PciAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PciAddr::Tcp(endpoint) => write!(f, "tcp://{endpoint}"),
            PciAddr::Serial(path) => write!(f, "serial://{path}"),
        }
    }
}

/// Connection-level configuration.
#[derive(Debug, Clone)]
pub struct ConnConfig {
    pub addr: PciAddr,
    pub engine: EngineConfig,
    pub connect_timeout: Duration,
    /// Consecutive failed dials tolerated before giving up; `None` retries
    /// forever.
    pub reconnect_limit: Option<u32>,
}

impl ConnConfig {
    pub fn new(addr: PciAddr) -> Self {
        Self {
            addr,
            engine: EngineConfig::default(),
            connect_timeout: Duration::from_secs(10),
            reconnect_limit: None,
        }
    }
}

/// Errors that terminate the event loop.
#[derive(Debug)]
pub enum ConnError {
    /// Dial failure surfaced after the retry cap.
    Io(io::Error),
    /// The reconnect limit was exhausted.
    RetriesExhausted { attempts: u32 },
}

impl fmt::Display for ConnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnError::Io(e) => write!(f, "I/O error: {e}"),
            ConnError::RetriesExhausted { attempts } => {
                write!(f, "gave up after {attempts} failed connection attempts")
            }
        }
    }
}

impl std::error::Error for ConnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnError::Io(e) => Some(e),
            ConnError::RetriesExhausted { .. } => None,
        }
    }
}

impl From<io::Error> for ConnError {
    fn from(e: io::Error) -> Self {
        ConnError::Io(e)
    }
}

enum Op {
    LightingOn {
        application: u8,
        group: u8,
        reply: mpsc::Sender<Completion>,
    },
    LightingOff {
        application: u8,
        group: u8,
        reply: mpsc::Sender<Completion>,
    },
    LightingRamp {
        application: u8,
        group: u8,
        level: u8,
        duration_secs: u16,
        reply: mpsc::Sender<Completion>,
    },
    RequestStatus {
        application: u8,
        block_start: u8,
        reply: mpsc::Sender<StatusCompletion>,
    },
    PublishTime,
    Close,
}

/// Handle to a running PCI event loop.
///
/// Operations are queued to the engine thread and hand back one-shot
/// completions; dropping the handle shuts the loop down.
pub struct PciConnection {
    ops: mpsc::Sender<Op>,
    groups: Arc<GroupDb>,
    thread: Option<thread::JoinHandle<Result<(), ConnError>>>,
}

impl PciConnection {
    /// Spawn the event loop. `events` receives inbound callbacks on the
    /// engine thread and must not block.
    pub fn spawn<E: Events + 'static>(cfg: ConnConfig, events: E) -> io::Result<Self> {
        let (ops_tx, ops_rx) = mpsc::channel();
        let engine = Engine::new(cfg.engine.clone(), events);
        let groups = engine.groups();
        let thread = thread::Builder::new()
            .name("cbus-pci".into())
            .spawn(move || run_loop(cfg, engine, ops_rx))?;
        Ok(Self {
            ops: ops_tx,
            groups,
            thread: Some(thread),
        })
    }

    /// Shared read-only view of the cached group levels.
    pub fn groups(&self) -> Arc<GroupDb> {
        self.groups.clone()
    }

    pub fn lighting_on(&self, application: u8, group: u8) -> Completion {
        self.submit(|reply| Op::LightingOn {
            application,
            group,
            reply,
        })
    }

    pub fn lighting_off(&self, application: u8, group: u8) -> Completion {
        self.submit(|reply| Op::LightingOff {
            application,
            group,
            reply,
        })
    }

    pub fn lighting_ramp(
        &self,
        application: u8,
        group: u8,
        level: u8,
        duration_secs: u16,
    ) -> Completion {
        self.submit(|reply| Op::LightingRamp {
            application,
            group,
            level,
            duration_secs,
            reply,
        })
    }

    pub fn request_status(&self, application: u8, block_start: u8) -> Option<StatusCompletion> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.ops
            .send(Op::RequestStatus {
                application,
                block_start,
                reply: reply_tx,
            })
            .ok()?;
        reply_rx.recv().ok()
    }

    pub fn publish_time(&self) {
        let _ = self.ops.send(Op::PublishTime);
    }

    /// Stop the event loop, draining all in-flight state, and wait for the
    /// thread to finish.
    pub fn close(mut self) -> Result<(), ConnError> {
        let _ = self.ops.send(Op::Close);
        match self.thread.take() {
            Some(handle) => handle.join().unwrap_or(Ok(())),
            None => Ok(()),
        }
    }

    /// True while the event-loop thread is alive.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn submit(&self, op: impl FnOnce(mpsc::Sender<Completion>) -> Op) -> Completion {
        let (reply_tx, reply_rx) = mpsc::channel();
        if self.ops.send(op(reply_tx)).is_err() {
            return Completion::resolved(SendOutcome::ConnectionLost);
        }
        reply_rx
            .recv()
            .unwrap_or_else(|_| Completion::resolved(SendOutcome::ConnectionLost))
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

fn run_loop<E: Events>(
    cfg: ConnConfig,
    mut engine: Engine<E>,
    ops: mpsc::Receiver<Op>,
) -> Result<(), ConnError> {
    let mut backoff = BACKOFF_START;
    let mut failed_dials: u32 = 0;
    let mut next_dial = Instant::now();
    let mut was_ready = false;

    loop {
        let now = Instant::now();

        if engine.state() == LinkState::Disconnected {
            if now >= next_dial {
                info!("connecting to PCI at {}", cfg.addr);
                match dial(&cfg.addr, cfg.connect_timeout) {
                    Ok(transport) => {
                        engine.attach(transport, Instant::now());
                        // A session that dies before reaching Ready redials
                        // on the backoff schedule; reaching Ready resets it.
                        next_dial = now + backoff;
                        backoff = (backoff * 2).min(BACKOFF_CAP);
                    }
                    Err(e) => {
                        warn!("connection to {} failed: {e}", cfg.addr);
                        failed_dials += 1;
                        if let Some(limit) = cfg.reconnect_limit {
                            if failed_dials >= limit {
                                return Err(ConnError::RetriesExhausted {
                                    attempts: failed_dials,
                                });
                            }
                        }
                        next_dial = now + backoff;
                        debug!("next attempt in {backoff:?}");
                        backoff = (backoff * 2).min(BACKOFF_CAP);
                    }
                }
            } else {
                // Idle until the next dial, but keep serving the inbox.
                let wait = next_dial
                    .saturating_duration_since(now)
                    .min(POLL);
                match ops.recv_timeout(wait) {
                    Ok(op) => {
                        if !handle_op(&mut engine, op) {
                            return Ok(());
                        }
                    }
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                    Err(mpsc::RecvTimeoutError::Disconnected) => {
                        engine.close();
                        return Ok(());
                    }
                }
                continue;
            }
        }

        if engine.state() == LinkState::Ready && !was_ready {
            was_ready = true;
            failed_dials = 0;
            backoff = BACKOFF_START;
        } else if engine.state() != LinkState::Ready {
            was_ready = false;
        }

        // Bound the read by the engine's next deadline so retries and timers
        // fire on time.
        let timeout = engine
            .next_deadline()
            .map(|d| d.saturating_duration_since(now))
            .unwrap_or(POLL)
            .clamp(Duration::from_millis(1), POLL);
        engine.poll_transport(timeout, Instant::now());

        loop {
            match ops.try_recv() {
                Ok(op) => {
                    if !handle_op(&mut engine, op) {
                        return Ok(());
                    }
                }
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => {
                    engine.close();
                    return Ok(());
                }
            }
        }

        engine.tick(Instant::now());
    }
}

/// Apply one queued operation. Returns `false` on `Close`.
fn handle_op<E: Events>(engine: &mut Engine<E>, op: Op) -> bool {
    let now = Instant::now();
    match op {
        Op::LightingOn {
            application,
            group,
            reply,
        } => {
            let _ = reply.send(engine.lighting_on(application, group, now));
        }
        Op::LightingOff {
            application,
            group,
            reply,
        } => {
            let _ = reply.send(engine.lighting_off(application, group, now));
        }
        Op::LightingRamp {
            application,
            group,
            level,
            duration_secs,
            reply,
        } => {
            let _ = reply.send(engine.lighting_ramp(application, group, level, duration_secs, now));
        }
        Op::RequestStatus {
            application,
            block_start,
            reply,
        } => {
            let _ = reply.send(engine.request_status(application, block_start, now));
        }
        Op::PublishTime => engine.publish_time(now),
        Op::Close => {
            engine.close();
            return false;
        }
    }
    true
}

fn dial(addr: &PciAddr, timeout: Duration) -> io::Result<Box<dyn PciTransport>> {
    match addr {
        PciAddr::Tcp(endpoint) => Ok(Box::new(TcpTransport::connect(endpoint.as_str(), timeout)?)),
        PciAddr::Serial(path) => Ok(Box::new(SerialTransport::open(path)?)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
