//! Live Preview daemon library.
//!
//! Streams raw YVYU frames from a microcontroller camera over a serial link,
//! converts them to 24-bit pixels and publishes the latest frame as a BMP for
//! the preview UI.
//!
//! # Module Structure
//!
//! - `color`: YVYU to pixel conversion (integer math)
//! - `transport`: serial link, exact-length reads, handshake tokens
//! - `control`: live flag lookup in the control store
//! - `raster`: BMP header and atomic output writes
//! - `timing`: per-cycle transport/processing instrumentation
//! - `session`: the start/ack/stop streaming state machine
//! - `service`: idle/active scheduler with graceful shutdown
//! - `config`: file + environment configuration

pub mod color;
pub mod config;
pub mod control;
pub mod raster;
pub mod service;
pub mod session;
pub mod timing;
pub mod transport;

pub use config::LivePreviewConfig;
pub use control::{ControlOracle, SqliteControlStore};
pub use raster::{OutputWriter, RasterHeader};
pub use service::{LinkOpener, SerialOpener, ServiceLoop, ServiceOptions, Shutdown, Tick};
pub use session::{
    FrameBuffers, SessionEnd, SessionOptions, SessionState, SessionStats, StreamingSession,
};
pub use timing::{CycleClock, CycleTiming};
pub use transport::{FrameLink, ReadPolicy, SerialLink, SerialSettings, Token, TransportError};

/// Frame width in pixels. Fixed by the camera firmware.
pub const WIDTH: usize = 320;

/// Frame height in pixels. Fixed by the camera firmware.
pub const HEIGHT: usize = 240;

/// Bytes per frame on the wire (packed 4:2:2, two bytes per pixel).
pub const FRAME_BYTES: usize = WIDTH * HEIGHT * 2;

/// Bytes per converted frame (three bytes per pixel).
pub const PIXEL_BYTES: usize = WIDTH * HEIGHT * 3;
