//! Idle/active scheduler.
//!
//! While idle the loop polls the live flag at a low rate. When the flag is set
//! it opens the link and runs one streaming session to completion, then goes
//! back to polling. Only one session ever exists at a time: the session runs
//! on this thread and `tick` does not return until it has ended.
//!
//! Every sleep checks the shutdown flag, so Ctrl-C stops the daemon within one
//! sleep slice or one frame read.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::control::ControlOracle;
use crate::raster::{OutputWriter, RasterHeader};
use crate::session::{FrameBuffers, SessionEnd, SessionOptions, StreamingSession};
use crate::transport::{FrameLink, ReadPolicy, SerialLink, SerialSettings, TransportError};

const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Cooperative shutdown signal shared with the Ctrl-C handler.
#[derive(Clone, Debug, Default)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` in short slices. Returns `false` if interrupted.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_requested() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

/// Opens a fresh link for each session.
pub trait LinkOpener {
    type Link: FrameLink;

    fn open(&mut self) -> Result<Self::Link, TransportError>;
}

/// Opens the camera's serial device.
pub struct SerialOpener {
    settings: SerialSettings,
    policy: ReadPolicy,
    shutdown: Shutdown,
}

impl SerialOpener {
    pub fn new(settings: SerialSettings, policy: ReadPolicy, shutdown: Shutdown) -> Self {
        Self {
            settings,
            policy,
            shutdown,
        }
    }
}

impl LinkOpener for SerialOpener {
    type Link = SerialLink;

    fn open(&mut self) -> Result<SerialLink, TransportError> {
        SerialLink::open(&self.settings, self.policy.clone(), self.shutdown.clone())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceOptions {
    /// Flag poll interval while idle.
    pub idle_poll: Duration,
    /// Wait after a failed open before polling again.
    pub open_backoff: Duration,
    pub session: SessionOptions,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            idle_poll: Duration::from_millis(100),
            open_backoff: Duration::from_secs(1),
            session: SessionOptions::default(),
        }
    }
}

/// Outcome of one scheduler step.
#[derive(Debug)]
pub enum Tick {
    /// Flag was clear; nothing opened.
    Idle,
    /// Flag was set but the link could not be opened.
    OpenFailed(TransportError),
    /// A session ran and ended.
    Session(SessionEnd),
    /// Shutdown was observed before doing anything.
    Shutdown,
}

pub struct ServiceLoop<O: LinkOpener, C: ControlOracle> {
    opener: O,
    oracle: C,
    writer: OutputWriter,
    header: RasterHeader,
    buffers: FrameBuffers,
    options: ServiceOptions,
    shutdown: Shutdown,
    sessions: u64,
}

impl<O: LinkOpener, C: ControlOracle> ServiceLoop<O, C> {
    pub fn new(
        opener: O,
        oracle: C,
        writer: OutputWriter,
        options: ServiceOptions,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            opener,
            oracle,
            writer,
            header: RasterHeader::for_frame(),
            buffers: FrameBuffers::new(),
            options,
            shutdown,
            sessions: 0,
        }
    }

    /// Number of sessions started so far.
    pub fn sessions(&self) -> u64 {
        self.sessions
    }

    /// Run until shutdown is requested.
    pub fn run(&mut self) -> Result<()> {
        self.writer.ensure_parent_dir()?;
        log::info!(
            "live preview service started, publishing to {}",
            self.writer.path().display()
        );
        loop {
            if let Tick::Shutdown = self.tick() {
                break;
            }
        }
        log::info!("shutdown signal received, live preview service stopped");
        Ok(())
    }

    /// Poll the flag once and, if set, run one session to completion.
    pub fn tick(&mut self) -> Tick {
        if self.shutdown.is_requested() {
            return Tick::Shutdown;
        }
        if !self.oracle.is_enabled() {
            self.shutdown.sleep(self.options.idle_poll);
            return Tick::Idle;
        }

        let mut session: StreamingSession<'_, O::Link> = StreamingSession::new(
            &mut self.buffers,
            &self.header,
            &self.writer,
            self.options.session.clone(),
        );
        if let Err(e) = session.connect(&mut self.opener) {
            log::warn!("{}", e);
            self.shutdown.sleep(self.options.open_backoff);
            return Tick::OpenFailed(e);
        }
        self.sessions += 1;
        let end = session.run(&mut self.oracle, &self.shutdown);
        log::info!("session {} ended ({:?}), idle", self.sessions, end);
        self.shutdown.sleep(self.options.idle_poll);
        Tick::Session(end)
    }
}
