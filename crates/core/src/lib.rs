pub mod decoder;
pub mod error;
pub mod media;
pub mod player;

pub use decoder::session::{
    DecoderConfig, DecoderSession, FeedStats, Phase, StatsSnapshot, SubmitSummary,
};
pub use decoder::{
    BufferFlags, Codec, CodecCallbacks, DecodingService, MediaFormat, SurfaceHandle,
};
pub use error::{CodecError, FeedError, Result};
pub use media::{NalType, NaluSegment, scan};
pub use player::{PayloadDelegate, PlaybackTarget, Player};
