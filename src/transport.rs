//! Serial frame transport.
//!
//! This module provides `SerialLink` for talking to the camera microcontroller:
//! - Opening the device as a raw 8N1 line with no flow control
//! - Reading exactly one frame under a bounded retry budget
//! - Writing handshake tokens and draining them to the wire
//!
//! The session only sees the `FrameLink` trait, so scripted links can stand in
//! for the device in tests.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use thiserror::Error;

use crate::service::Shutdown;

/// Handshake tokens understood by the camera firmware.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Token {
    /// `L`: begin streaming.
    Start,
    /// `A`: frame received, capture the next one.
    Ack,
    /// `X`: stop streaming.
    Stop,
}

impl Token {
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Token::Start => b"L\n",
            Token::Ack => b"A\n",
            Token::Stop => b"X\n",
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("serial device {path} unavailable: {source}")]
    DeviceUnavailable {
        path: String,
        #[source]
        source: serialport::Error,
    },
    #[error("read timed out after {read}/{expected} bytes")]
    Timeout { read: usize, expected: usize },
    #[error("short frame: read {read}/{expected} bytes")]
    ShortFrame { read: usize, expected: usize },
    #[error("shutdown requested after {read} bytes")]
    Interrupted { read: usize },
    #[error("serial i/o error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Bytes collected before the failure, when the failure happened mid-read.
    pub fn bytes_read(&self) -> Option<usize> {
        match self {
            TransportError::Timeout { read, .. }
            | TransportError::ShortFrame { read, .. }
            | TransportError::Interrupted { read } => Some(*read),
            _ => None,
        }
    }
}

/// Retry budget for exact-length reads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadPolicy {
    /// Consecutive reads returning no data before giving up.
    pub max_empty_reads: u32,
    /// Pause after an empty read.
    pub pause: Duration,
    /// Longest stretch without progress before giving up, whatever the count.
    pub stall_limit: Duration,
}

impl Default for ReadPolicy {
    fn default() -> Self {
        Self {
            max_empty_reads: 500,
            pause: Duration::from_millis(1),
            stall_limit: Duration::from_millis(2500),
        }
    }
}

/// Fill `buf` from `reader`, retrying empty reads until the policy runs out.
///
/// Returns the number of bytes read, which is always `buf.len()` on success.
/// Timeouts report how many bytes had arrived so the caller can log the gap.
pub fn read_exact_from<R: Read + ?Sized>(
    reader: &mut R,
    buf: &mut [u8],
    policy: &ReadPolicy,
    shutdown: &Shutdown,
) -> Result<usize, TransportError> {
    let expected = buf.len();
    let mut total = 0;
    let mut empty_reads = 0u32;
    let mut last_progress = Instant::now();

    while total < expected {
        match reader.read(&mut buf[total..]) {
            Ok(n) if n > 0 => {
                total += n;
                empty_reads = 0;
                last_progress = Instant::now();
                continue;
            }
            Ok(_) => {}
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => return Err(TransportError::Io(e)),
        }

        empty_reads += 1;
        if empty_reads > policy.max_empty_reads || last_progress.elapsed() >= policy.stall_limit {
            return Err(TransportError::Timeout {
                read: total,
                expected,
            });
        }
        if shutdown.is_requested() {
            return Err(TransportError::Interrupted { read: total });
        }
        std::thread::sleep(policy.pause);
    }

    Ok(total)
}

/// A bidirectional link to the camera.
pub trait FrameLink {
    /// Drop any bytes already buffered on the input side.
    fn discard_input(&mut self) -> Result<(), TransportError>;

    /// Read exactly `buf.len()` bytes, returning the count actually read.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Write a token and block until it has left the output queue.
    fn write_token(&mut self, token: Token) -> Result<(), TransportError>;

    /// Release the device. Safe to call more than once.
    fn close(&mut self);
}

/// Line settings for the camera's serial device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerialSettings {
    pub path: String,
    pub baud_rate: u32,
    /// Per-read timeout in tenths of a second.
    pub read_timeout_ds: u8,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            path: "/dev/stm32_cam_1".to_string(),
            baud_rate: 115_200,
            read_timeout_ds: 20,
        }
    }
}

impl SerialSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.read_timeout_ds) * 100)
    }
}

/// Serial link backed by a raw tty.
pub struct SerialLink {
    path: String,
    port: Option<Box<dyn SerialPort>>,
    policy: ReadPolicy,
    shutdown: Shutdown,
}

impl SerialLink {
    /// Open and configure the device: raw mode, 8N1, no flow control.
    pub fn open(
        settings: &SerialSettings,
        policy: ReadPolicy,
        shutdown: Shutdown,
    ) -> Result<Self, TransportError> {
        let port = serialport::new(settings.path.as_str(), settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(settings.read_timeout())
            .open()
            .map_err(|source| TransportError::DeviceUnavailable {
                path: settings.path.clone(),
                source,
            })?;
        log::debug!(
            "SerialLink: opened {} at {} baud",
            settings.path,
            settings.baud_rate
        );
        Ok(Self {
            path: settings.path.clone(),
            port: Some(port),
            policy,
            shutdown,
        })
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>, TransportError> {
        self.port.as_mut().ok_or_else(|| {
            TransportError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "serial link already closed",
            ))
        })
    }
}

impl FrameLink for SerialLink {
    fn discard_input(&mut self) -> Result<(), TransportError> {
        self.port()?
            .clear(ClearBuffer::Input)
            .map_err(|e| TransportError::Io(e.into()))
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let policy = self.policy.clone();
        let shutdown = self.shutdown.clone();
        let port = self.port()?;
        read_exact_from(port.as_mut(), buf, &policy, &shutdown)
    }

    fn write_token(&mut self, token: Token) -> Result<(), TransportError> {
        let port = self.port()?;
        port.write_all(token.as_bytes())?;
        // tcdrain on unix ports
        port.flush()?;
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            log::debug!("SerialLink: closed {}", self.path);
        }
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.close();
    }
}
