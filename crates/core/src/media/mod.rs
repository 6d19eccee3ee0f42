//! Elementary stream parsing.
//!
//! This module turns raw payload bytes delivered by the network layer into
//! addressable NAL units that can be handed to a decoder one at a time.
//!
//! ## Annex B overview (ITU-T H.264 Annex B)
//!
//! A byte stream delimits NAL units with start code prefixes:
//!
//! - 3-byte: `0x00 0x00 0x01`
//! - 4-byte: `0x00 0x00 0x00 0x01` (an extra leading zero)
//!
//! The byte after the prefix is the NAL header; its low 5 bits carry the
//! `nal_unit_type` used to classify the unit.
//!
//! ## Supported codecs
//!
//! | Codec | Module | Status |
//! |-------|--------|--------|
//! | H.264 | [`h264`] | Implemented |

pub mod h264;

pub use h264::{NalType, NaluSegment, scan};
