//! Streaming session.
//!
//! One session covers one open link, from the start token to either a stop
//! token or a link failure. Steady state per cycle:
//!
//! 1. read one full frame
//! 2. re-check the live flag and ack (or stop) right away, so the camera
//!    captures the next frame while this side converts and writes
//! 3. convert YVYU to pixels
//! 4. publish the BMP
//! 5. emit the cycle timing
//!
//! A short or timed-out read means the link is out of step. The session ends
//! without sending anything else and the service loop reopens from scratch.

use std::io;
use std::time::{Duration, Instant};

use crate::color::convert_frame;
use crate::control::ControlOracle;
use crate::raster::{OutputWriter, RasterHeader};
use crate::service::{LinkOpener, Shutdown};
use crate::timing::{CycleClock, CycleTiming};
use crate::transport::{FrameLink, Token, TransportError};
use crate::{FRAME_BYTES, PIXEL_BYTES};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Starting,
    Streaming,
    Stopping,
}

/// Why a session returned to idle.
#[derive(Debug)]
pub enum SessionEnd {
    /// The live flag was cleared; stop token sent.
    Disabled,
    /// Shutdown was requested between frames; stop token sent.
    Shutdown,
    /// The configured frame limit was reached; stop token sent.
    FrameLimit,
    /// The link failed; no further tokens were sent.
    LinkFailed(TransportError),
}

impl SessionEnd {
    /// Whether the session ended through the stop handshake.
    pub fn sent_stop(&self) -> bool {
        !matches!(self, SessionEnd::LinkFailed(_))
    }
}

/// Frame and pixel storage, allocated once and reused for every cycle.
pub struct FrameBuffers {
    raw: Box<[u8; FRAME_BYTES]>,
    pixels: Box<[u8; PIXEL_BYTES]>,
}

impl FrameBuffers {
    pub fn new() -> Self {
        Self {
            raw: boxed_array(),
            pixels: boxed_array(),
        }
    }

    pub fn raw(&self) -> &[u8; FRAME_BYTES] {
        &self.raw
    }

    pub fn pixels(&self) -> &[u8; PIXEL_BYTES] {
        &self.pixels
    }
}

impl Default for FrameBuffers {
    fn default() -> Self {
        Self::new()
    }
}

// Allocate on the heap directly; a stack temporary this size is wasteful.
fn boxed_array<const N: usize>() -> Box<[u8; N]> {
    let slice = vec![0u8; N].into_boxed_slice();
    match slice.try_into() {
        Ok(array) => array,
        Err(_) => unreachable!("vec![0; N] has length N"),
    }
}

/// Knobs for a single session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionOptions {
    /// Pause after the stop token so the camera can settle before close.
    pub stop_grace: Duration,
    /// Stop after this many frames have been published.
    pub max_frames: Option<u64>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_millis(50),
            max_frames: None,
        }
    }
}

/// Running totals for one session.
#[derive(Clone, Debug)]
pub struct SessionStats {
    pub frames_written: u64,
    pub write_failures: u64,
    pub transport_total: Duration,
    pub started_at: Instant,
}

impl SessionStats {
    fn new() -> Self {
        Self {
            frames_written: 0,
            write_failures: 0,
            transport_total: Duration::ZERO,
            started_at: Instant::now(),
        }
    }

    fn record(&mut self, timing: &CycleTiming) {
        self.transport_total += timing.transport;
    }

    pub fn cycles(&self) -> u64 {
        self.frames_written + self.write_failures
    }

    /// Mean rate over the session, bounded by transport time.
    pub fn mean_fps(&self) -> f64 {
        let secs = self.transport_total.as_secs_f64();
        if secs > 0.0 {
            self.cycles() as f64 / secs
        } else {
            0.0
        }
    }
}

pub struct StreamingSession<'a, L: FrameLink> {
    link: Option<L>,
    buffers: &'a mut FrameBuffers,
    header: &'a RasterHeader,
    writer: &'a OutputWriter,
    options: SessionOptions,
    state: SessionState,
    stats: SessionStats,
}

impl<'a, L: FrameLink> StreamingSession<'a, L> {
    /// Create an idle session. Call `connect` before `run`.
    pub fn new(
        buffers: &'a mut FrameBuffers,
        header: &'a RasterHeader,
        writer: &'a OutputWriter,
        options: SessionOptions,
    ) -> Self {
        Self {
            link: None,
            buffers,
            header,
            writer,
            options,
            state: SessionState::Idle,
            stats: SessionStats::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Open the link. On failure the session is back in `Idle`.
    pub fn connect<O>(&mut self, opener: &mut O) -> Result<(), TransportError>
    where
        O: LinkOpener<Link = L> + ?Sized,
    {
        self.set_state(SessionState::Connecting);
        match opener.open() {
            Ok(link) => {
                self.link = Some(link);
                self.stats = SessionStats::new();
                Ok(())
            }
            Err(e) => {
                self.set_state(SessionState::Idle);
                Err(e)
            }
        }
    }

    /// Drive the handshake until the flag clears, shutdown, or the link fails.
    pub fn run<C: ControlOracle + ?Sized>(
        &mut self,
        oracle: &mut C,
        shutdown: &Shutdown,
    ) -> SessionEnd {
        match self.stream(oracle, shutdown) {
            Ok(end) => end,
            Err(e) => self.fail(e),
        }
    }

    fn stream<C: ControlOracle + ?Sized>(
        &mut self,
        oracle: &mut C,
        shutdown: &Shutdown,
    ) -> Result<SessionEnd, TransportError> {
        self.set_state(SessionState::Starting);
        // Stale bytes from an aborted session would shift every frame.
        connected(&mut self.link)?.discard_input()?;
        connected(&mut self.link)?.write_token(Token::Start)?;
        log::info!("live mode triggered, start token sent");
        let mut clock = CycleClock::start();
        self.set_state(SessionState::Streaming);

        loop {
            let read = connected(&mut self.link)?.read_exact(&mut self.buffers.raw[..])?;
            if read != FRAME_BYTES {
                return Err(TransportError::ShortFrame {
                    read,
                    expected: FRAME_BYTES,
                });
            }
            clock.mark_read();

            // Ack before converting so remote capture overlaps local work.
            if shutdown.is_requested() {
                return Ok(self.stop(SessionEnd::Shutdown));
            }
            if !oracle.is_enabled() {
                return Ok(self.stop(SessionEnd::Disabled));
            }
            if self
                .options
                .max_frames
                .is_some_and(|max| self.stats.frames_written >= max)
            {
                return Ok(self.stop(SessionEnd::FrameLimit));
            }
            connected(&mut self.link)?.write_token(Token::Ack)?;

            convert_frame(&self.buffers.raw, &mut self.buffers.pixels);
            let written = self
                .writer
                .write_image(self.header, &self.buffers.pixels[..]);

            let timing = clock.finish();
            self.stats.record(&timing);
            match written {
                Ok(()) => {
                    self.stats.frames_written += 1;
                    log::info!("frame ok | {}", timing);
                }
                Err(e) => {
                    self.stats.write_failures += 1;
                    log::warn!("frame skipped, output write failed: {:#} | {}", e, timing);
                }
            }
        }
    }

    fn stop(&mut self, end: SessionEnd) -> SessionEnd {
        self.set_state(SessionState::Stopping);
        log::info!("stop requested ({:?}), sending stop token", end);
        match connected(&mut self.link).and_then(|link| link.write_token(Token::Stop)) {
            Ok(()) => std::thread::sleep(self.options.stop_grace),
            Err(e) => log::warn!("stop token not delivered: {}", e),
        }
        self.finish(end)
    }

    fn fail(&mut self, error: TransportError) -> SessionEnd {
        match &error {
            TransportError::Interrupted { read } => log::info!(
                "shutdown during frame read ({}/{} bytes), closing link",
                read,
                FRAME_BYTES
            ),
            _ => match error.bytes_read() {
                Some(read) => log::warn!(
                    "frame error (read {}/{} bytes): {}; reconnecting",
                    read,
                    FRAME_BYTES,
                    error
                ),
                None => log::warn!("link error: {}; reconnecting", error),
            },
        }
        self.finish(SessionEnd::LinkFailed(error))
    }

    fn finish(&mut self, end: SessionEnd) -> SessionEnd {
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        self.set_state(SessionState::Idle);
        log::info!(
            "session ended: {} frames, {} write failures, mean {:.2} fps over {:.1}s",
            self.stats.frames_written,
            self.stats.write_failures,
            self.stats.mean_fps(),
            self.stats.started_at.elapsed().as_secs_f64()
        );
        end
    }

    fn set_state(&mut self, state: SessionState) {
        log::debug!("session state {:?} -> {:?}", self.state, state);
        self.state = state;
    }
}

fn connected<L: FrameLink>(link: &mut Option<L>) -> Result<&mut L, TransportError> {
    link.as_mut().ok_or_else(|| {
        TransportError::Io(io::Error::new(
            io::ErrorKind::NotConnected,
            "session has no open link",
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Event {
        Discard,
        Token(Token),
        Close,
    }

    enum Reply {
        Frame(u8),
        Short(usize),
        Timeout(usize),
        Interrupted(usize),
    }

    struct ScriptedLink {
        replies: VecDeque<Reply>,
        events: Rc<RefCell<Vec<Event>>>,
    }

    impl FrameLink for ScriptedLink {
        fn discard_input(&mut self) -> Result<(), TransportError> {
            self.events.borrow_mut().push(Event::Discard);
            Ok(())
        }

        fn read_exact(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
            match self.replies.pop_front() {
                Some(Reply::Frame(fill)) => {
                    buf.fill(fill);
                    Ok(buf.len())
                }
                Some(Reply::Short(n)) => Ok(n),
                Some(Reply::Timeout(read)) => Err(TransportError::Timeout {
                    read,
                    expected: buf.len(),
                }),
                Some(Reply::Interrupted(read)) => Err(TransportError::Interrupted { read }),
                None => Err(TransportError::Timeout {
                    read: 0,
                    expected: buf.len(),
                }),
            }
        }

        fn write_token(&mut self, token: Token) -> Result<(), TransportError> {
            self.events.borrow_mut().push(Event::Token(token));
            Ok(())
        }

        fn close(&mut self) {
            self.events.borrow_mut().push(Event::Close);
        }
    }

    struct OneShot(Option<ScriptedLink>);

    impl LinkOpener for OneShot {
        type Link = ScriptedLink;

        fn open(&mut self) -> Result<ScriptedLink, TransportError> {
            self.0.take().ok_or_else(|| {
                TransportError::Io(io::Error::new(io::ErrorKind::NotFound, "no camera"))
            })
        }
    }

    struct FlagScript(VecDeque<bool>);

    impl ControlOracle for FlagScript {
        fn is_enabled(&mut self) -> bool {
            self.0.pop_front().unwrap_or(false)
        }
    }

    fn link(replies: Vec<Reply>) -> (ScriptedLink, Rc<RefCell<Vec<Event>>>) {
        let events = Rc::new(RefCell::new(Vec::new()));
        (
            ScriptedLink {
                replies: replies.into(),
                events: events.clone(),
            },
            events,
        )
    }

    fn quick() -> SessionOptions {
        SessionOptions {
            stop_grace: Duration::from_millis(1),
            max_frames: None,
        }
    }

    #[test]
    fn disabled_flag_sends_stop_before_close() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let writer = OutputWriter::new(temp_dir.path().join("live.bmp"));
        let header = RasterHeader::for_frame();
        let mut buffers = FrameBuffers::new();
        let (link, events) = link(vec![Reply::Frame(128), Reply::Frame(128)]);
        let mut oracle = FlagScript(vec![true, false].into());

        let mut session = StreamingSession::new(&mut buffers, &header, &writer, quick());
        session.connect(&mut OneShot(Some(link))).expect("scripted link opens");
        let end = session.run(&mut oracle, &Shutdown::new());

        assert!(matches!(end, SessionEnd::Disabled));
        assert!(end.sent_stop());
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.stats().frames_written, 1);
        assert_eq!(
            *events.borrow(),
            vec![
                Event::Discard,
                Event::Token(Token::Start),
                Event::Token(Token::Ack),
                Event::Token(Token::Stop),
                Event::Close,
            ]
        );
    }

    #[test]
    fn short_frame_closes_without_stop() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let writer = OutputWriter::new(temp_dir.path().join("live.bmp"));
        let header = RasterHeader::for_frame();
        let mut buffers = FrameBuffers::new();
        let (link, events) = link(vec![Reply::Short(100)]);
        let mut oracle = FlagScript(vec![true; 4].into());

        let mut session = StreamingSession::new(&mut buffers, &header, &writer, quick());
        session.connect(&mut OneShot(Some(link))).expect("scripted link opens");
        let end = session.run(&mut oracle, &Shutdown::new());

        match end {
            SessionEnd::LinkFailed(TransportError::ShortFrame { read, expected }) => {
                assert_eq!(read, 100);
                assert_eq!(expected, FRAME_BYTES);
            }
            ref other => panic!("unexpected end: {:?}", other),
        }
        assert!(!end.sent_stop());
        assert!(!events.borrow().contains(&Event::Token(Token::Stop)));
        assert_eq!(events.borrow().last(), Some(&Event::Close));
        assert!(!writer.path().exists());
    }

    #[test]
    fn timeout_mid_stream_keeps_previous_frame() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let writer = OutputWriter::new(temp_dir.path().join("live.bmp"));
        let header = RasterHeader::for_frame();
        let mut buffers = FrameBuffers::new();
        let (link, events) = link(vec![Reply::Frame(90), Reply::Timeout(4096)]);
        let mut oracle = FlagScript(vec![true; 4].into());

        let mut session = StreamingSession::new(&mut buffers, &header, &writer, quick());
        session.connect(&mut OneShot(Some(link))).expect("scripted link opens");
        let end = session.run(&mut oracle, &Shutdown::new());
        assert!(matches!(
            end,
            SessionEnd::LinkFailed(TransportError::Timeout { read: 4096, .. })
        ));
        assert_eq!(
            *events.borrow(),
            vec![
                Event::Discard,
                Event::Token(Token::Start),
                Event::Token(Token::Ack),
                Event::Close,
            ]
        );
        let written = std::fs::read(writer.path()).expect("first frame written");
        assert_eq!(written.len(), crate::raster::frame_file_len());
    }

    #[test]
    fn ack_goes_out_before_the_frame_is_published() {
        // The output path is unwritable, so publishing fails; the ack must
        // already have been sent and the session must keep streaming.
        let writer = OutputWriter::new("/nonexistent-live-preview-dir/live.bmp");
        let header = RasterHeader::for_frame();
        let mut buffers = FrameBuffers::new();
        let (link, events) = link(vec![Reply::Frame(1), Reply::Frame(2)]);
        let mut oracle = FlagScript(vec![true, true].into());

        let mut session = StreamingSession::new(&mut buffers, &header, &writer, quick());
        session.connect(&mut OneShot(Some(link))).expect("scripted link opens");
        let end = session.run(&mut oracle, &Shutdown::new());

        assert!(matches!(end, SessionEnd::LinkFailed(TransportError::Timeout { .. })));
        assert_eq!(session.stats().write_failures, 2);
        assert_eq!(session.stats().frames_written, 0);
        let acks = events
            .borrow()
            .iter()
            .filter(|e| **e == Event::Token(Token::Ack))
            .count();
        assert_eq!(acks, 2);
    }

    #[test]
    fn frame_limit_stops_after_publishing() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let writer = OutputWriter::new(temp_dir.path().join("live.bmp"));
        let header = RasterHeader::for_frame();
        let mut buffers = FrameBuffers::new();
        let (link, events) = link(vec![Reply::Frame(5), Reply::Frame(6), Reply::Frame(7)]);
        let mut oracle = FlagScript(vec![true; 8].into());
        let options = SessionOptions {
            max_frames: Some(2),
            ..quick()
        };

        let mut session = StreamingSession::new(&mut buffers, &header, &writer, options);
        session.connect(&mut OneShot(Some(link))).expect("scripted link opens");
        let end = session.run(&mut oracle, &Shutdown::new());

        assert!(matches!(end, SessionEnd::FrameLimit));
        assert_eq!(session.stats().frames_written, 2);
        let events = events.borrow();
        assert_eq!(events[events.len() - 2], Event::Token(Token::Stop));
        assert_eq!(buffers.raw()[0], 7);
    }

    #[test]
    fn shutdown_after_read_sends_stop() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let writer = OutputWriter::new(temp_dir.path().join("live.bmp"));
        let header = RasterHeader::for_frame();
        let mut buffers = FrameBuffers::new();
        let (link, events) = link(vec![Reply::Frame(0)]);
        let mut oracle = FlagScript(vec![true].into());
        let shutdown = Shutdown::new();
        shutdown.request();

        let mut session = StreamingSession::new(&mut buffers, &header, &writer, quick());
        session.connect(&mut OneShot(Some(link))).expect("scripted link opens");
        let end = session.run(&mut oracle, &shutdown);

        assert!(matches!(end, SessionEnd::Shutdown));
        assert!(end.sent_stop());
        assert!(events.borrow().contains(&Event::Token(Token::Stop)));
        assert!(!writer.path().exists());
    }

    #[test]
    fn interrupted_read_closes_without_stop() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let writer = OutputWriter::new(temp_dir.path().join("live.bmp"));
        let header = RasterHeader::for_frame();
        let mut buffers = FrameBuffers::new();
        let (link, events) = link(vec![Reply::Interrupted(512)]);
        let mut oracle = FlagScript(vec![true].into());

        let mut session = StreamingSession::new(&mut buffers, &header, &writer, quick());
        session.connect(&mut OneShot(Some(link))).expect("scripted link opens");
        let end = session.run(&mut oracle, &Shutdown::new());

        assert!(matches!(
            end,
            SessionEnd::LinkFailed(TransportError::Interrupted { read: 512 })
        ));
        assert!(!end.sent_stop());
        assert_eq!(
            *events.borrow(),
            vec![Event::Discard, Event::Token(Token::Start), Event::Close]
        );
    }

    #[test]
    fn connect_moves_through_connecting() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let writer = OutputWriter::new(temp_dir.path().join("live.bmp"));
        let header = RasterHeader::for_frame();
        let mut buffers = FrameBuffers::new();
        let (link, events) = link(vec![]);

        let mut session = StreamingSession::new(&mut buffers, &header, &writer, quick());
        assert_eq!(session.state(), SessionState::Idle);
        session.connect(&mut OneShot(Some(link))).expect("scripted link opens");
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(events.borrow().is_empty());

        session.run(&mut FlagScript(VecDeque::new()), &Shutdown::new());
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn failed_connect_returns_to_idle() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let writer = OutputWriter::new(temp_dir.path().join("live.bmp"));
        let header = RasterHeader::for_frame();
        let mut buffers = FrameBuffers::new();

        let mut session =
            StreamingSession::<ScriptedLink>::new(&mut buffers, &header, &writer, quick());
        let err = session.connect(&mut OneShot(None)).expect_err("nothing to open");
        assert!(matches!(err, TransportError::Io(_)));
        assert_eq!(session.state(), SessionState::Idle);

        // Running without a link ends at once and never touches the wire.
        let end = session.run(&mut FlagScript(vec![true].into()), &Shutdown::new());
        assert!(matches!(end, SessionEnd::LinkFailed(TransportError::Io(_))));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn buffers_have_fixed_sizes() {
        let buffers = FrameBuffers::new();
        assert_eq!(buffers.raw().len(), FRAME_BYTES);
        assert_eq!(buffers.pixels().len(), PIXEL_BYTES);
    }
}
