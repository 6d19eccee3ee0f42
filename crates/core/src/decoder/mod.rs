//! Decoding service boundary and the feed pipeline built on top of it.
//!
//! The decoding engine itself is external. This module describes what the
//! pipeline needs from it as two narrow traits:
//!
//! - [`DecodingService`] / [`Codec`]: calls the pipeline makes into the
//!   engine (create, configure, start, stop, flush, release, input and
//!   output slot handling).
//! - [`CodecCallbacks`]: notifications the engine sends back, on a context
//!   it owns (input slot available, output ready, error, format changed).
//!
//! ## Input slot protocol
//!
//! ```text
//! engine ── on_input_slot_available(slot) ──> FeedQueue::credit
//! session ── FeedQueue::acquire(timeout) ──> slot
//! session ── write_input(slot, bytes) + queue_input(slot, len, pts, flags) ──> engine
//! ```
//!
//! A slot handed to the session is owned by it until it is queued back.
//!
//! [`loopback`] provides an in-process engine used by the CLI and tests.

pub mod feed;
pub mod loopback;
pub mod session;

use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

use crate::error::CodecError;

/// Index of a decoder input or output slot.
pub type SlotId = u32;

/// MIME type of H.264 elementary streams.
pub const MIME_AVC: &str = "video/avc";

/// Per-input flags passed to [`Codec::queue_input`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BufferFlags(u32);

impl BufferFlags {
    /// Ordinary frame data.
    pub const NONE: Self = Self(0);
    /// Synchronization point (IDR picture).
    pub const KEY_FRAME: Self = Self(0x1);
    /// Codec-specific configuration data (SPS/PPS).
    pub const CODEC_CONFIG: Self = Self(0x2);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for BufferFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for BufferFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::KEY_FRAME) {
            names.push("KEY_FRAME");
        }
        if self.contains(Self::CODEC_CONFIG) {
            names.push("CODEC_CONFIG");
        }
        if names.is_empty() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// Opaque handle of the rendering target a decoder draws into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceHandle(pub u64);

/// Stream format negotiated with the decoder.
///
/// `csd` holds codec-specific data buffers (`csd-0`, `csd-1`, ...): for
/// H.264 the start-code-prefixed SPS and PPS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFormat {
    pub mime: String,
    pub width: u32,
    pub height: u32,
    pub csd: Vec<Vec<u8>>,
}

impl MediaFormat {
    pub fn video(mime: &str, width: u32, height: u32) -> Self {
        Self {
            mime: mime.to_string(),
            width,
            height,
            csd: Vec::new(),
        }
    }
}

/// Metadata of a decoded output slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputInfo {
    pub size: usize,
    pub presentation_time_us: u64,
    pub flags: BufferFlags,
}

/// Factory side of a decoding engine.
pub trait DecodingService: Send + Sync {
    /// Create a decoder instance for `mime`.
    fn create_decoder(&self, mime: &str) -> Result<Arc<dyn Codec>, CodecError>;
}

/// One decoder instance.
///
/// Implementations must deliver [`CodecCallbacks`] from their own execution
/// context and never from inside one of these calls: the session holds its
/// lock while calling into the codec.
pub trait Codec: Send + Sync {
    /// Install the notification sink. Called before [`configure`](Self::configure),
    /// and again between [`flush`](Self::flush) and [`start`](Self::start) to
    /// move to a new sink; events emitted before that keep their old sink.
    fn register_callbacks(&self, callbacks: Arc<dyn CodecCallbacks>);

    fn configure(&self, format: &MediaFormat, surface: SurfaceHandle) -> Result<(), CodecError>;

    /// Start decoding; input slots are credited through the callbacks afterwards.
    fn start(&self) -> Result<(), CodecError>;

    fn stop(&self) -> Result<(), CodecError>;

    /// Drop all pending input and output. Slots must be re-credited after
    /// the next [`start`](Self::start).
    fn flush(&self) -> Result<(), CodecError>;

    fn release(&self) -> Result<(), CodecError>;

    /// Copy `data` into the writable region of input slot `slot`.
    fn write_input(&self, slot: SlotId, data: &[u8]) -> Result<(), CodecError>;

    /// Hand the first `len` bytes of input slot `slot` to the decoder.
    fn queue_input(
        &self,
        slot: SlotId,
        len: usize,
        presentation_time_us: u64,
        flags: BufferFlags,
    ) -> Result<(), CodecError>;

    /// Return output slot `slot`, rendering it to the surface if `render`.
    fn release_output(&self, slot: SlotId, render: bool) -> Result<(), CodecError>;
}

/// Notifications from a [`Codec`], dispatched on the codec's own context.
pub trait CodecCallbacks: Send + Sync {
    fn on_input_slot_available(&self, slot: SlotId);

    fn on_output_ready(&self, slot: SlotId, info: OutputInfo);

    fn on_error(&self, error: CodecError);

    fn on_format_changed(&self, format: MediaFormat);
}
