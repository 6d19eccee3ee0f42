use std::sync::Arc;

use parking_lot::Mutex;

use crate::decoder::session::{DecoderConfig, DecoderSession, Phase, StatsSnapshot, SubmitSummary};
use crate::decoder::{DecodingService, SurfaceHandle};
use crate::error::Result;

/// Calls the network layer makes as media arrives.
///
/// Implemented by [`Player`]; an RTSP client holds one of these and invokes
/// it from its own receive thread.
pub trait PayloadDelegate: Send + Sync {
    /// A depacketized Annex B payload.
    fn payload(&self, bytes: &[u8]);

    /// The stream stopped delivering data.
    fn timeout(&self);
}

/// Where decoded pictures go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackTarget {
    pub surface: SurfaceHandle,
    pub width: u32,
    pub height: u32,
}

/// Playback facade tying a rendering target to a [`DecoderSession`].
///
/// `start_playback` is typically called when the surface becomes available
/// and `stop_playback` when it is destroyed. Payloads delivered while
/// playback is stopped are ignored.
pub struct Player {
    session: DecoderSession,
    target: Mutex<Option<PlaybackTarget>>,
}

impl Player {
    pub fn new(service: Arc<dyn DecodingService>) -> Self {
        Self::with_config(service, DecoderConfig::default())
    }

    pub fn with_config(service: Arc<dyn DecodingService>, config: DecoderConfig) -> Self {
        Self {
            session: DecoderSession::with_config(service, config),
            target: Mutex::new(None),
        }
    }

    /// Configure and start a decoder for `target`.
    pub fn start_playback(&self, target: PlaybackTarget) -> Result<()> {
        self.session
            .configure(target.surface, target.width, target.height)?;
        *self.target.lock() = Some(target);
        Ok(())
    }

    /// Restart on the last target, e.g. after a decoder fault.
    ///
    /// Returns `Ok(false)` if playback was never started.
    pub fn resume_playback(&self) -> Result<bool> {
        let Some(target) = *self.target.lock() else {
            return Ok(false);
        };
        self.session
            .configure(target.surface, target.width, target.height)?;
        tracing::info!(surface = target.surface.0, "playback resumed");
        Ok(true)
    }

    pub fn stop_playback(&self) {
        self.session.stop();
    }

    pub fn deliver_payload(&self, bytes: &[u8]) -> SubmitSummary {
        self.session.submit(bytes)
    }

    pub fn is_playing(&self) -> bool {
        self.session.phase() == Phase::Running
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.session.stats()
    }

    pub fn session(&self) -> &DecoderSession {
        &self.session
    }
}

impl PayloadDelegate for Player {
    fn payload(&self, bytes: &[u8]) {
        self.deliver_payload(bytes);
    }

    fn timeout(&self) {
        tracing::warn!(phase = ?self.session.phase(), "media stream timed out");
    }
}
