//! Decoder session lifecycle and the segment submission loop.
//!
//! ## Phases
//!
//! ```text
//! configure            Idle | Released -> Configured -> Running
//! stop                 Configured | Running | Error -> Released
//! decoder fault        Running -> Error -> Released
//! ```
//!
//! A session outlives the decoder instances it drives: the last SPS and PPS
//! seen on the wire are retained across stop/configure cycles and decoder
//! faults, and are attached as `csd-0`/`csd-1` to the next configuration so a
//! fresh decoder can start on the very next keyframe.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use base64::prelude::{BASE64_STANDARD, Engine as _};
use parking_lot::Mutex;

use super::feed::{DEFAULT_FEED_CAPACITY, FeedQueue};
use super::{
    BufferFlags, Codec, CodecCallbacks, DecodingService, MIME_AVC, MediaFormat, OutputInfo,
    SlotId, SurfaceHandle,
};
use crate::error::{CodecError, FeedError, Result};
use crate::media::h264::{self, NalType, NaluSegment};

/// How long a segment waits for a free input slot before it is dropped.
pub const DEFAULT_INPUT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Session-level configuration.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// MIME type passed to [`DecodingService::create_decoder`].
    pub mime_type: String,
    /// Maximum number of free input slots the feed queue can hold.
    pub feed_capacity: usize,
    /// Per-segment wait for a free input slot.
    pub input_timeout: Duration,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            mime_type: MIME_AVC.to_string(),
            feed_capacity: DEFAULT_FEED_CAPACITY,
            input_timeout: DEFAULT_INPUT_TIMEOUT,
        }
    }
}

impl DecoderConfig {
    pub fn with_feed_capacity(mut self, capacity: usize) -> Self {
        self.feed_capacity = capacity.max(1);
        self
    }

    pub fn with_input_timeout(mut self, timeout: Duration) -> Self {
        self.input_timeout = timeout;
        self
    }
}

/// Decoder session lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Created, never configured.
    Idle,
    /// Decoder configured but not started yet.
    Configured,
    /// Accepting payloads.
    Running,
    /// The decoder reported a fatal error; resources are being released.
    Error,
    /// Decoder resources released. `configure` starts a new decoder.
    Released,
}

/// Input flags for a NAL unit type.
pub fn buffer_flags(kind: NalType) -> BufferFlags {
    match kind {
        NalType::Sps | NalType::Pps => BufferFlags::CODEC_CONFIG,
        NalType::Idr => BufferFlags::KEY_FRAME,
        _ => BufferFlags::NONE,
    }
}

/// Outcome of one [`DecoderSession::submit`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitSummary {
    /// NAL units found in the payload.
    pub scanned: usize,
    /// Units handed to the decoder.
    pub queued: usize,
    /// Units dropped for lack of an input slot or a live decoder.
    pub dropped: usize,
}

/// Cumulative session counters.
#[derive(Debug, Default)]
pub struct FeedStats {
    queued: AtomicU64,
    dropped: AtomicU64,
    config_units: AtomicU64,
    key_frames: AtomicU64,
    faults: AtomicU64,
}

impl FeedStats {
    fn record_queued(&self, flags: BufferFlags) {
        self.queued.fetch_add(1, Ordering::Relaxed);
        if flags.contains(BufferFlags::CODEC_CONFIG) {
            self.config_units.fetch_add(1, Ordering::Relaxed);
        }
        if flags.contains(BufferFlags::KEY_FRAME) {
            self.key_frames.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_dropped(&self, count: usize) {
        self.dropped.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            queued: self.queued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            config_units: self.config_units.load(Ordering::Relaxed),
            key_frames: self.key_frames.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`FeedStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub queued: u64,
    pub dropped: u64,
    pub config_units: u64,
    pub key_frames: u64,
    pub faults: u64,
}

/// The decoder instance of one configuration.
struct ActiveCodec {
    codec: Arc<dyn Codec>,
    /// Free slots of the current slot epoch. Replaced on every flush; a slot
    /// taken from an older queue is never written.
    feed: Arc<FeedQueue>,
    generation: u64,
}

struct SessionState {
    phase: Phase,
    active: Option<ActiveCodec>,
    sps: Option<NaluSegment>,
    pps: Option<NaluSegment>,
    /// Bumped on every configure; callbacks and in-flight submissions carry
    /// the value they were issued under.
    generation: u64,
    output_format: Option<MediaFormat>,
    started_at: Instant,
}

impl SessionState {
    fn set_phase(&mut self, phase: Phase) {
        tracing::debug!(old_phase = ?self.phase, new_phase = ?phase, "decoder phase transition");
        self.phase = phase;
    }

    fn is_current(&self, generation: u64) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.generation == generation)
    }
}

struct Shared {
    service: Arc<dyn DecodingService>,
    config: DecoderConfig,
    state: Mutex<SessionState>,
    stats: FeedStats,
}

impl Shared {
    fn handle_fault(&self, generation: u64, error: &CodecError) {
        let mut state = self.state.lock();
        if !state.is_current(generation) {
            tracing::debug!(generation, error = %error, "error from stale decoder ignored");
            return;
        }
        self.release_after_fault(&mut state, error);
    }

    /// A credit that does not fit the feed queue is a protocol violation of
    /// the decoder. Only the queue of the current slot epoch can fault it.
    fn handle_overflow(&self, feed: &Arc<FeedQueue>, error: &FeedError) {
        let mut state = self.state.lock();
        let current = state
            .active
            .as_ref()
            .is_some_and(|a| Arc::ptr_eq(&a.feed, feed));
        if !current {
            tracing::debug!(error = %error, "overflow of a retired feed queue ignored");
            return;
        }
        self.release_after_fault(&mut state, &CodecError::Fault(error.to_string()));
    }

    fn release_after_fault(&self, state: &mut SessionState, error: &CodecError) {
        let generation = state.generation;
        state.set_phase(Phase::Error);
        self.stats.faults.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(generation, error = %error, "decoder fault, releasing decoder");

        if let Some(active) = state.active.take()
            && let Err(e) = active.codec.release()
        {
            tracing::warn!(error = %e, "decoder release after fault failed");
        }
        state.set_phase(Phase::Released);
    }

    fn record_format(&self, generation: u64, format: MediaFormat) {
        let mut state = self.state.lock();
        if !state.is_current(generation) {
            return;
        }
        tracing::info!(
            mime = %format.mime,
            width = format.width,
            height = format.height,
            "decoder output format changed"
        );
        state.output_format = Some(format);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(active) = self.state.get_mut().active.take() {
            teardown(active.codec.as_ref());
        }
    }
}

/// Stop then release, logging each failure and carrying on.
fn teardown(codec: &dyn Codec) {
    if let Err(e) = codec.stop() {
        tracing::warn!(error = %e, "decoder stop failed");
    }
    if let Err(e) = codec.release() {
        tracing::warn!(error = %e, "decoder release failed");
    }
}

/// Callback sink registered with each decoder instance.
///
/// Holds the feed queue of its own configuration and slot epoch, so credits
/// from a replaced or flushed decoder can never reach the current queue.
struct SessionCallbacks {
    session: Weak<Shared>,
    codec: Weak<dyn Codec>,
    feed: Arc<FeedQueue>,
    generation: u64,
}

impl CodecCallbacks for SessionCallbacks {
    fn on_input_slot_available(&self, slot: SlotId) {
        if let Err(e) = self.feed.credit(slot)
            && let Some(shared) = self.session.upgrade()
        {
            shared.handle_overflow(&self.feed, &e);
        }
    }

    fn on_output_ready(&self, slot: SlotId, info: OutputInfo) {
        let Some(codec) = self.codec.upgrade() else {
            return;
        };
        match codec.release_output(slot, true) {
            Ok(()) => tracing::trace!(
                slot,
                size = info.size,
                pts_us = info.presentation_time_us,
                "output rendered"
            ),
            Err(e) => tracing::debug!(slot, error = %e, "output release failed"),
        }
    }

    fn on_error(&self, error: CodecError) {
        if let Some(shared) = self.session.upgrade() {
            shared.handle_fault(self.generation, &error);
        }
    }

    fn on_format_changed(&self, format: MediaFormat) {
        if let Some(shared) = self.session.upgrade() {
            shared.record_format(self.generation, format);
        }
    }
}

/// Feeds Annex B payloads into one decoder at a time.
///
/// Cheap to clone; clones share the same decoder and state. All lifecycle
/// operations and the retained parameter sets are serialized by a single
/// lock. Waiting for an input slot happens outside that lock, so
/// [`stop`](Self::stop) never waits behind a blocked submission.
#[derive(Clone)]
pub struct DecoderSession {
    shared: Arc<Shared>,
}

impl DecoderSession {
    pub fn new(service: Arc<dyn DecodingService>) -> Self {
        Self::with_config(service, DecoderConfig::default())
    }

    pub fn with_config(service: Arc<dyn DecodingService>, config: DecoderConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                service,
                config,
                state: Mutex::new(SessionState {
                    phase: Phase::Idle,
                    active: None,
                    sps: None,
                    pps: None,
                    generation: 0,
                    output_format: None,
                    started_at: Instant::now(),
                }),
                stats: FeedStats::default(),
            }),
        }
    }

    /// Create, configure and start a decoder rendering to `surface`.
    ///
    /// Retained SPS/PPS, when both are known, are attached to the format so
    /// the decoder is primed before any new parameter sets arrive. A
    /// rejection by the decoding service is returned as
    /// [`FeedError::Configuration`] and leaves no decoder behind.
    pub fn configure(&self, surface: SurfaceHandle, width: u32, height: u32) -> Result<()> {
        let mut state = self.shared.state.lock();
        match state.phase {
            Phase::Idle | Phase::Released => {}
            phase => {
                return Err(FeedError::InvalidTransition {
                    phase,
                    operation: "configure",
                });
            }
        }

        let mime = &self.shared.config.mime_type;
        let codec = self
            .shared
            .service
            .create_decoder(mime)
            .map_err(FeedError::Configuration)?;

        state.generation += 1;
        let generation = state.generation;
        let feed = self.new_feed();
        codec.register_callbacks(self.callbacks(&codec, &feed, generation));

        let mut format = MediaFormat::video(mime, width, height);
        if let (Some(sps), Some(pps)) = (&state.sps, &state.pps) {
            tracing::debug!(
                sps_len = sps.len(),
                pps_len = pps.len(),
                "priming decoder with retained parameter sets"
            );
            format.csd = vec![sps.data().to_vec(), pps.data().to_vec()];
        }

        if let Err(e) = codec.configure(&format, surface) {
            tracing::warn!(error = %e, width, height, "decoder rejected configuration");
            if let Err(e) = codec.release() {
                tracing::warn!(error = %e, "decoder release failed");
            }
            return Err(FeedError::Configuration(e));
        }
        state.set_phase(Phase::Configured);

        if let Err(e) = codec.start() {
            tracing::warn!(error = %e, "decoder failed to start");
            teardown(codec.as_ref());
            state.set_phase(Phase::Released);
            return Err(FeedError::Configuration(e));
        }

        state.active = Some(ActiveCodec {
            codec,
            feed,
            generation,
        });
        state.output_format = None;
        state.started_at = Instant::now();
        state.set_phase(Phase::Running);

        tracing::info!(
            generation,
            mime = %mime,
            width,
            height,
            surface = surface.0,
            primed = !format.csd.is_empty(),
            "decoder started"
        );
        Ok(())
    }

    fn new_feed(&self) -> Arc<FeedQueue> {
        Arc::new(FeedQueue::new(self.shared.config.feed_capacity.max(1)))
    }

    fn callbacks(
        &self,
        codec: &Arc<dyn Codec>,
        feed: &Arc<FeedQueue>,
        generation: u64,
    ) -> Arc<SessionCallbacks> {
        Arc::new(SessionCallbacks {
            session: Arc::downgrade(&self.shared),
            codec: Arc::downgrade(codec),
            feed: feed.clone(),
            generation,
        })
    }

    /// Feed a payload, timestamped with the time since the decoder started.
    pub fn submit(&self, payload: &[u8]) -> SubmitSummary {
        self.feed_payload(payload, None)
    }

    /// Feed a payload with an externally supplied presentation timestamp.
    pub fn submit_at(&self, payload: &[u8], presentation_time_us: u64) -> SubmitSummary {
        self.feed_payload(payload, Some(presentation_time_us))
    }

    fn feed_payload(&self, payload: &[u8], pts: Option<u64>) -> SubmitSummary {
        let mut summary = SubmitSummary::default();
        let segments = h264::scan(payload);

        let (feed, pts) = {
            let mut state = self.shared.state.lock();
            let feed = match (state.phase, &state.active) {
                (Phase::Running, Some(active)) => active.feed.clone(),
                (phase, _) => {
                    tracing::debug!(
                        ?phase,
                        len = payload.len(),
                        "decoder not running, payload ignored"
                    );
                    return summary;
                }
            };

            for segment in &segments {
                match segment.kind() {
                    NalType::Sps => state.sps = Some(segment.clone()),
                    NalType::Pps => state.pps = Some(segment.clone()),
                    _ => {}
                }
            }

            let pts = pts.unwrap_or_else(|| state.started_at.elapsed().as_micros() as u64);
            (feed, pts)
        };

        summary.scanned = segments.len();
        let timeout = self.shared.config.input_timeout;

        for (index, segment) in segments.iter().enumerate() {
            let flags = buffer_flags(segment.kind());

            let slot = feed.acquire(timeout);

            // a stop, fault or flush since the payload was accepted retires
            // the queue, and any slot taken from it
            let state = self.shared.state.lock();
            let active = match &state.active {
                Some(active)
                    if state.phase == Phase::Running && Arc::ptr_eq(&active.feed, &feed) =>
                {
                    active
                }
                _ => {
                    let abandoned = segments.len() - index;
                    summary.dropped += abandoned;
                    self.shared.stats.record_dropped(abandoned);
                    tracing::debug!(
                        abandoned,
                        stale_slot = ?slot,
                        "decoder gone or flushed mid-payload, remaining segments dropped"
                    );
                    break;
                }
            };

            let Some(slot) = slot else {
                summary.dropped += 1;
                self.shared.stats.record_dropped(1);
                tracing::debug!(
                    nal_type = segment.nal_type(),
                    len = segment.len(),
                    timeout_ms = timeout.as_millis() as u64,
                    "no input slot in time, segment dropped"
                );
                continue;
            };

            if let Err(e) = active.codec.write_input(slot, segment.data()) {
                tracing::warn!(slot, len = segment.len(), error = %e, "failed to fill input slot");
                summary.dropped += 1;
                self.shared.stats.record_dropped(1);
                // the slot was never queued, so it is still ours to reuse
                if let Err(e) = feed.credit(slot) {
                    drop(state);
                    self.shared.handle_overflow(&feed, &e);
                }
                continue;
            }

            match active.codec.queue_input(slot, segment.len(), pts, flags) {
                Ok(()) => {
                    summary.queued += 1;
                    self.shared.stats.record_queued(flags);
                    tracing::trace!(
                        slot,
                        nal_type = segment.nal_type(),
                        len = segment.len(),
                        ?flags,
                        pts_us = pts,
                        "segment queued"
                    );
                }
                Err(e) => {
                    summary.dropped += 1;
                    self.shared.stats.record_dropped(1);
                    tracing::warn!(slot, error = %e, "failed to queue input");
                }
            }
        }

        if summary.dropped > 0 {
            tracing::debug!(
                scanned = summary.scanned,
                queued = summary.queued,
                dropped = summary.dropped,
                "payload partially fed"
            );
        }

        summary
    }

    /// Stop and release the decoder. Never fails; teardown errors are logged.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        if matches!(state.phase, Phase::Idle | Phase::Released) {
            tracing::debug!(phase = ?state.phase, "stop ignored, no active decoder");
            return;
        }

        if let Some(active) = state.active.take() {
            teardown(active.codec.as_ref());
        }
        state.set_phase(Phase::Released);
        tracing::info!(generation = state.generation, "decoder stopped");
    }

    /// Discard all pending decoder input and output and resume.
    ///
    /// Starts a new slot epoch: the decoder gets a fresh feed queue and
    /// callback sink before it is restarted, so credits issued before the
    /// flush and slots held by in-flight submissions are never used again.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        let phase = state.phase;
        let active = match (phase, state.active.as_mut()) {
            (Phase::Running, Some(active)) => active,
            _ => {
                return Err(FeedError::InvalidTransition {
                    phase,
                    operation: "flush",
                });
            }
        };

        active.codec.flush()?;
        let feed = self.new_feed();
        active
            .codec
            .register_callbacks(self.callbacks(&active.codec, &feed, active.generation));
        let discarded = std::mem::replace(&mut active.feed, feed).clear();
        active.codec.start()?;
        tracing::debug!(generation = active.generation, discarded, "decoder flushed");
        Ok(())
    }

    /// Handle a fatal error of the current decoder: release it and move to
    /// [`Phase::Released`]. Retained parameter sets are kept.
    pub fn on_service_error(&self, error: CodecError) {
        let generation = self.shared.state.lock().generation;
        self.shared.handle_fault(generation, &error);
    }

    /// Record the current decoder's output format.
    pub fn on_format_changed(&self, format: MediaFormat) {
        let generation = self.shared.state.lock().generation;
        self.shared.record_format(generation, format);
    }

    pub fn phase(&self) -> Phase {
        self.shared.state.lock().phase
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Output format last reported by the running decoder.
    pub fn output_format(&self) -> Option<MediaFormat> {
        self.shared.state.lock().output_format.clone()
    }

    /// Free input slots currently credited to the running decoder's queue.
    pub fn available_slots(&self) -> usize {
        let state = self.shared.state.lock();
        state.active.as_ref().map_or(0, |a| a.feed.len())
    }

    /// Last sequence parameter set seen on the wire.
    pub fn last_sps(&self) -> Option<NaluSegment> {
        self.shared.state.lock().sps.clone()
    }

    /// Last picture parameter set seen on the wire.
    pub fn last_pps(&self) -> Option<NaluSegment> {
        self.shared.state.lock().pps.clone()
    }

    /// Forget the retained parameter sets; the next decoder starts unprimed.
    pub fn clear_parameter_sets(&self) {
        let mut state = self.shared.state.lock();
        state.sps = None;
        state.pps = None;
        tracing::debug!("retained parameter sets cleared");
    }

    /// `sprop-parameter-sets` value (RFC 6184 §8.1) from the retained SPS/PPS.
    pub fn sprop_parameter_sets(&self) -> Option<String> {
        let state = self.shared.state.lock();
        let (sps, pps) = (state.sps.as_ref()?, state.pps.as_ref()?);
        Some(format!(
            "{},{}",
            BASE64_STANDARD.encode(sps.nal()),
            BASE64_STANDARD.encode(pps.nal())
        ))
    }

    /// `profile-level-id` (RFC 6184 §8.1): SPS bytes 1-3 as hex.
    pub fn profile_level_id(&self) -> Option<String> {
        let state = self.shared.state.lock();
        let sps = state.sps.as_ref()?.nal();
        if sps.len() < 4 {
            return None;
        }
        Some(format!("{:02x}{:02x}{:02x}", sps[1], sps[2], sps[3]))
    }
}
