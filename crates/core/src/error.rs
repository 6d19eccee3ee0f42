//! Error types for the decoder feed pipeline.

use crate::decoder::SlotId;
use crate::decoder::session::Phase;

/// Errors surfaced by the feed pipeline.
///
/// Only structural failures are returned to callers:
///
/// - **Configuration**: [`Configuration`](Self::Configuration) — the decoding
///   service refused the format or surface.
/// - **Lifecycle**: [`InvalidTransition`](Self::InvalidTransition) — an
///   operation was called in a phase that does not allow it.
/// - **Feed**: [`SlotOverflow`](Self::SlotOverflow) — the service credited
///   more input slots than the feed queue can hold.
///
/// Per-segment problems (backpressure timeouts, short buffers) are absorbed
/// by the session and only show up in logs and [`FeedStats`](crate::FeedStats).
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// The decoding service rejected the decoder creation, format or surface.
    #[error("decoder configuration failed: {0}")]
    Configuration(#[source] CodecError),

    /// The requested operation is not valid in the session's current phase.
    #[error("cannot {operation} while {phase:?}")]
    InvalidTransition {
        phase: Phase,
        operation: &'static str,
    },

    /// A slot credit arrived while the feed queue was already full.
    #[error("input slot {slot} credited beyond feed capacity {capacity}")]
    SlotOverflow { slot: SlotId, capacity: usize },

    /// A codec call failed outside of configuration.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Failures reported by a [`Codec`](crate::decoder::Codec) implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// No decoder is available for the MIME type.
    #[error("unsupported MIME type: {0}")]
    UnsupportedMime(String),

    /// The format or surface is not acceptable to the decoder.
    #[error("format rejected: {0}")]
    FormatRejected(String),

    /// The call is not valid in the codec's current state.
    #[error("illegal codec state: {0}")]
    IllegalState(&'static str),

    /// The codec has already been released.
    #[error("codec released")]
    Released,

    /// The slot index is unknown or not currently owned by the client.
    #[error("invalid slot {0}")]
    InvalidSlot(SlotId),

    /// The data does not fit into the input slot.
    #[error("input of {len} bytes exceeds slot capacity {capacity}")]
    SlotTooSmall { len: usize, capacity: usize },

    /// Unrecoverable decoder failure.
    #[error("decoder fault: {0}")]
    Fault(String),
}

/// Convenience alias for `Result<T, FeedError>`.
pub type Result<T> = std::result::Result<T, FeedError>;
