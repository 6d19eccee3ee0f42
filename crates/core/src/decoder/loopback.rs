//! In-process decoding service.
//!
//! [`LoopbackService`] implements the decoder capability traits without
//! decoding anything: it validates formats, hands out a fixed pool of input
//! slots, records every queued input and answers with output buffers, all
//! from its own callback thread like a hardware decoder would. The CLI uses
//! it to exercise the pipeline end to end; tests use it to observe exactly
//! what reached the decoder.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Sender, unbounded};
use parking_lot::Mutex;

use super::{
    BufferFlags, Codec, CodecCallbacks, DecodingService, MIME_AVC, MediaFormat, OutputInfo,
    SlotId, SurfaceHandle,
};
use crate::error::CodecError;

/// Loopback decoder behavior.
#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    /// Number of input slots the decoder owns.
    pub input_slots: usize,
    /// Size of each input slot in bytes.
    pub slot_size: usize,
    /// Credit an input slot back as soon as it has been queued. When false,
    /// each slot is handed out once per start.
    pub recycle_inputs: bool,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            input_slots: 8,
            slot_size: 1 << 20,
            recycle_inputs: true,
        }
    }
}

/// One input as the decoder received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedInput {
    pub slot: SlotId,
    pub data: Vec<u8>,
    pub presentation_time_us: u64,
    pub flags: BufferFlags,
}

#[derive(Default)]
struct Journal {
    queued: Vec<QueuedInput>,
    formats: Vec<MediaFormat>,
    rendered: u64,
    created: usize,
}

/// Decoding service whose decoders loop input straight back as output.
#[derive(Clone)]
pub struct LoopbackService {
    options: LoopbackOptions,
    journal: Arc<Mutex<Journal>>,
    current: Arc<Mutex<Option<Arc<LoopbackCodec>>>>,
}

impl LoopbackService {
    pub fn new(options: LoopbackOptions) -> Self {
        Self {
            options,
            journal: Arc::new(Mutex::new(Journal::default())),
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Report a fatal error from the most recently created decoder.
    ///
    /// Returns false when there is no running decoder to report from.
    pub fn inject_fault(&self, reason: &str) -> bool {
        match self.current.lock().as_ref() {
            Some(codec) => codec.emit(Event::Error(CodecError::Fault(reason.to_string()))),
            None => false,
        }
    }

    /// Every input queued so far, across all decoders, in order.
    pub fn queued(&self) -> Vec<QueuedInput> {
        self.journal.lock().queued.clone()
    }

    /// Every format accepted by `configure`, in order.
    pub fn formats(&self) -> Vec<MediaFormat> {
        self.journal.lock().formats.clone()
    }

    /// Number of output buffers released with `render = true`.
    pub fn rendered(&self) -> u64 {
        self.journal.lock().rendered
    }

    pub fn decoders_created(&self) -> usize {
        self.journal.lock().created
    }
}

impl Default for LoopbackService {
    fn default() -> Self {
        Self::new(LoopbackOptions::default())
    }
}

impl DecodingService for LoopbackService {
    fn create_decoder(&self, mime: &str) -> Result<Arc<dyn Codec>, CodecError> {
        if mime != MIME_AVC {
            return Err(CodecError::UnsupportedMime(mime.to_string()));
        }

        let codec = Arc::new(LoopbackCodec::new(
            self.options.clone(),
            self.journal.clone(),
        ));
        self.journal.lock().created += 1;
        *self.current.lock() = Some(codec.clone());
        tracing::debug!(mime, slots = self.options.input_slots, "loopback decoder created");
        Ok(codec)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CodecPhase {
    Created,
    Configured,
    Running,
    Flushed,
    Stopped,
    Released,
}

enum Event {
    InputAvailable(u64, SlotId),
    OutputReady(u64, SlotId, OutputInfo),
    FormatChanged(u64, MediaFormat),
    Error(CodecError),
}

/// An event bound to the sink that was registered when it was emitted.
struct Dispatch {
    callbacks: Arc<dyn CodecCallbacks>,
    event: Event,
}

struct Slot {
    data: Vec<u8>,
    owned_by_client: bool,
}

struct CodecState {
    phase: CodecPhase,
    callbacks: Option<Arc<dyn CodecCallbacks>>,
    format: Option<MediaFormat>,
    slots: Vec<Slot>,
    events: Option<Sender<Dispatch>>,
    next_output: SlotId,
}

impl CodecState {
    fn post(&self, event: Event) -> bool {
        match (&self.events, &self.callbacks) {
            (Some(tx), Some(callbacks)) => tx
                .send(Dispatch {
                    callbacks: callbacks.clone(),
                    event,
                })
                .is_ok(),
            _ => false,
        }
    }
}

/// A loopback decoder instance.
pub struct LoopbackCodec {
    options: LoopbackOptions,
    journal: Arc<Mutex<Journal>>,
    /// Events tagged with an older epoch are discarded by the callback thread.
    epoch: Arc<AtomicU64>,
    state: Mutex<CodecState>,
}

impl LoopbackCodec {
    fn new(options: LoopbackOptions, journal: Arc<Mutex<Journal>>) -> Self {
        let slots = (0..options.input_slots)
            .map(|_| Slot {
                data: Vec::new(),
                owned_by_client: false,
            })
            .collect();
        Self {
            options,
            journal,
            epoch: Arc::new(AtomicU64::new(0)),
            state: Mutex::new(CodecState {
                phase: CodecPhase::Created,
                callbacks: None,
                format: None,
                slots,
                events: None,
                next_output: 0,
            }),
        }
    }

    fn emit(&self, event: Event) -> bool {
        self.state.lock().post(event)
    }

    /// Spawn the thread that delivers callbacks outside of codec calls.
    fn spawn_dispatcher(&self) -> Result<Sender<Dispatch>, CodecError> {
        let (tx, rx) = unbounded::<Dispatch>();
        let epoch = self.epoch.clone();

        thread::Builder::new()
            .name("loopback-codec".to_string())
            .spawn(move || {
                for Dispatch { callbacks, event } in rx {
                    let current = epoch.load(Ordering::SeqCst);
                    match event {
                        Event::InputAvailable(e, slot) if e == current => {
                            callbacks.on_input_slot_available(slot)
                        }
                        Event::OutputReady(e, slot, info) if e == current => {
                            callbacks.on_output_ready(slot, info)
                        }
                        Event::FormatChanged(e, format) if e == current => {
                            callbacks.on_format_changed(format)
                        }
                        Event::Error(error) => callbacks.on_error(error),
                        _ => tracing::trace!("stale loopback event discarded"),
                    }
                }
                tracing::trace!("loopback dispatcher exited");
            })
            .map_err(|e| CodecError::Fault(format!("failed to spawn dispatcher: {e}")))?;

        Ok(tx)
    }

    fn check_running(state: &CodecState) -> Result<(), CodecError> {
        match state.phase {
            CodecPhase::Running => Ok(()),
            CodecPhase::Released => Err(CodecError::Released),
            _ => Err(CodecError::IllegalState("decoder not running")),
        }
    }

    fn client_slot(state: &mut CodecState, slot: SlotId) -> Result<&mut Slot, CodecError> {
        match state.slots.get_mut(slot as usize) {
            Some(s) if s.owned_by_client => Ok(s),
            _ => Err(CodecError::InvalidSlot(slot)),
        }
    }
}

impl Codec for LoopbackCodec {
    fn register_callbacks(&self, callbacks: Arc<dyn CodecCallbacks>) {
        self.state.lock().callbacks = Some(callbacks);
    }

    fn configure(&self, format: &MediaFormat, surface: SurfaceHandle) -> Result<(), CodecError> {
        let mut state = self.state.lock();
        match state.phase {
            CodecPhase::Created | CodecPhase::Stopped => {}
            CodecPhase::Released => return Err(CodecError::Released),
            _ => return Err(CodecError::IllegalState("already configured")),
        }
        if format.mime != MIME_AVC {
            return Err(CodecError::FormatRejected(format!("mime {}", format.mime)));
        }
        if format.width == 0 || format.height == 0 {
            return Err(CodecError::FormatRejected(format!(
                "dimensions {}x{}",
                format.width, format.height
            )));
        }

        tracing::debug!(
            width = format.width,
            height = format.height,
            csd = format.csd.len(),
            surface = surface.0,
            "loopback decoder configured"
        );
        state.format = Some(format.clone());
        state.phase = CodecPhase::Configured;
        self.journal.lock().formats.push(format.clone());
        Ok(())
    }

    fn start(&self) -> Result<(), CodecError> {
        let mut state = self.state.lock();
        let first_start = match state.phase {
            CodecPhase::Configured => true,
            CodecPhase::Flushed => false,
            CodecPhase::Released => return Err(CodecError::Released),
            _ => return Err(CodecError::IllegalState("start requires a configured decoder")),
        };

        if state.callbacks.is_none() {
            return Err(CodecError::IllegalState("callbacks not registered"));
        }
        if state.events.is_none() {
            state.events = Some(self.spawn_dispatcher()?);
        }

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if first_start && let Some(format) = state.format.clone() {
            state.post(Event::FormatChanged(epoch, format));
        }
        for slot in &mut state.slots {
            slot.owned_by_client = true;
        }
        for index in 0..state.slots.len() {
            state.post(Event::InputAvailable(epoch, index as SlotId));
        }

        state.phase = CodecPhase::Running;
        Ok(())
    }

    fn stop(&self) -> Result<(), CodecError> {
        let mut state = self.state.lock();
        match state.phase {
            CodecPhase::Configured | CodecPhase::Running | CodecPhase::Flushed => {}
            CodecPhase::Released => return Err(CodecError::Released),
            _ => return Err(CodecError::IllegalState("decoder not started")),
        }
        self.epoch.fetch_add(1, Ordering::SeqCst);
        state.events = None;
        for slot in &mut state.slots {
            slot.owned_by_client = false;
        }
        state.phase = CodecPhase::Stopped;
        Ok(())
    }

    fn flush(&self) -> Result<(), CodecError> {
        let mut state = self.state.lock();
        Self::check_running(&state)?;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        for slot in &mut state.slots {
            slot.owned_by_client = false;
        }
        state.phase = CodecPhase::Flushed;
        Ok(())
    }

    fn release(&self) -> Result<(), CodecError> {
        let mut state = self.state.lock();
        if state.phase == CodecPhase::Released {
            return Ok(());
        }
        self.epoch.fetch_add(1, Ordering::SeqCst);
        state.events = None;
        state.callbacks = None;
        state.phase = CodecPhase::Released;
        tracing::debug!("loopback decoder released");
        Ok(())
    }

    fn write_input(&self, slot: SlotId, data: &[u8]) -> Result<(), CodecError> {
        let capacity = self.options.slot_size;
        let mut state = self.state.lock();
        Self::check_running(&state)?;
        let target = Self::client_slot(&mut state, slot)?;
        if data.len() > capacity {
            return Err(CodecError::SlotTooSmall {
                len: data.len(),
                capacity,
            });
        }
        target.data.clear();
        target.data.extend_from_slice(data);
        Ok(())
    }

    fn queue_input(
        &self,
        slot: SlotId,
        len: usize,
        presentation_time_us: u64,
        flags: BufferFlags,
    ) -> Result<(), CodecError> {
        let mut state = self.state.lock();
        Self::check_running(&state)?;
        let recycle = self.options.recycle_inputs;
        let target = Self::client_slot(&mut state, slot)?;
        if len > target.data.len() {
            return Err(CodecError::SlotTooSmall {
                len,
                capacity: target.data.len(),
            });
        }

        let data = target.data[..len].to_vec();
        target.owned_by_client = recycle;
        self.journal.lock().queued.push(QueuedInput {
            slot,
            data,
            presentation_time_us,
            flags,
        });

        let epoch = self.epoch.load(Ordering::SeqCst);
        let output = if flags.contains(BufferFlags::CODEC_CONFIG) {
            None
        } else {
            let index = state.next_output;
            state.next_output = state.next_output.wrapping_add(1);
            Some(index)
        };

        if recycle {
            state.post(Event::InputAvailable(epoch, slot));
        }
        if let Some(index) = output {
            let info = OutputInfo {
                size: len,
                presentation_time_us,
                flags,
            };
            state.post(Event::OutputReady(epoch, index, info));
        }
        Ok(())
    }

    fn release_output(&self, slot: SlotId, render: bool) -> Result<(), CodecError> {
        let state = self.state.lock();
        if state.phase == CodecPhase::Released {
            return Err(CodecError::Released);
        }
        if render {
            self.journal.lock().rendered += 1;
        }
        tracing::trace!(slot, render, "loopback output released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Recorder {
        inputs: Mutex<Vec<SlotId>>,
        outputs: Mutex<Vec<SlotId>>,
        errors: Mutex<Vec<CodecError>>,
    }

    impl CodecCallbacks for Recorder {
        fn on_input_slot_available(&self, slot: SlotId) {
            self.inputs.lock().push(slot);
        }

        fn on_output_ready(&self, slot: SlotId, _info: OutputInfo) {
            self.outputs.lock().push(slot);
        }

        fn on_error(&self, error: CodecError) {
            self.errors.lock().push(error);
        }

        fn on_format_changed(&self, _format: MediaFormat) {}
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn started(options: LoopbackOptions) -> (LoopbackService, Arc<dyn Codec>, Arc<Recorder>) {
        let service = LoopbackService::new(options);
        let codec = service.create_decoder(MIME_AVC).unwrap();
        let recorder = Arc::new(Recorder::default());
        codec.register_callbacks(recorder.clone());
        codec
            .configure(&MediaFormat::video(MIME_AVC, 64, 64), SurfaceHandle(0))
            .unwrap();
        codec.start().unwrap();
        (service, codec, recorder)
    }

    #[test]
    fn start_credits_every_slot() {
        let options = LoopbackOptions {
            input_slots: 3,
            ..LoopbackOptions::default()
        };
        let (_service, _codec, recorder) = started(options);
        assert!(wait_for(|| recorder.inputs.lock().len() == 3));
        assert_eq!(*recorder.inputs.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn queued_frame_recycles_slot_and_produces_output() {
        let (service, codec, recorder) = started(LoopbackOptions::default());
        codec.write_input(2, &[0, 0, 1, 0x65, 1, 2]).unwrap();
        codec.queue_input(2, 6, 33_000, BufferFlags::KEY_FRAME).unwrap();

        let queued = service.queued();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].slot, 2);
        assert_eq!(queued[0].data, vec![0, 0, 1, 0x65, 1, 2]);

        // 8 initial credits plus the recycled slot
        assert!(wait_for(|| recorder.inputs.lock().len() == 9));
        assert!(wait_for(|| recorder.outputs.lock().len() == 1));
    }

    #[test]
    fn config_input_produces_no_output() {
        let (_service, codec, recorder) = started(LoopbackOptions::default());
        codec.write_input(0, &[0, 0, 1, 0x67]).unwrap();
        codec.queue_input(0, 4, 0, BufferFlags::CODEC_CONFIG).unwrap();
        assert!(wait_for(|| recorder.inputs.lock().len() == 9));
        assert!(recorder.outputs.lock().is_empty());
    }

    #[test]
    fn slot_not_owned_by_client_is_rejected() {
        let options = LoopbackOptions {
            input_slots: 1,
            recycle_inputs: false,
            ..LoopbackOptions::default()
        };
        let (_service, codec, _recorder) = started(options);
        codec.write_input(0, &[1, 2, 3]).unwrap();
        codec.queue_input(0, 3, 0, BufferFlags::NONE).unwrap();
        assert_eq!(codec.write_input(0, &[1]), Err(CodecError::InvalidSlot(0)));
        assert_eq!(codec.write_input(5, &[1]), Err(CodecError::InvalidSlot(5)));
    }

    #[test]
    fn oversized_input_is_rejected() {
        let options = LoopbackOptions {
            slot_size: 4,
            ..LoopbackOptions::default()
        };
        let (_service, codec, _recorder) = started(options);
        assert_eq!(
            codec.write_input(0, &[0; 5]),
            Err(CodecError::SlotTooSmall {
                len: 5,
                capacity: 4
            })
        );
    }

    #[test]
    fn injected_fault_reaches_callbacks() {
        let (service, _codec, recorder) = started(LoopbackOptions::default());
        assert!(service.inject_fault("boom"));
        assert!(wait_for(|| !recorder.errors.lock().is_empty()));
        assert_eq!(
            recorder.errors.lock()[0],
            CodecError::Fault("boom".to_string())
        );
    }

    #[test]
    fn released_codec_refuses_work() {
        let (_service, codec, _recorder) = started(LoopbackOptions::default());
        codec.stop().unwrap();
        codec.release().unwrap();
        codec.release().unwrap();
        assert_eq!(codec.start(), Err(CodecError::Released));
        assert_eq!(codec.stop(), Err(CodecError::Released));
        assert_eq!(codec.release_output(0, true), Err(CodecError::Released));
    }

    #[test]
    fn restart_after_flush_credits_the_new_sink() {
        let options = LoopbackOptions {
            input_slots: 2,
            ..LoopbackOptions::default()
        };
        let (_service, codec, first) = started(options);
        assert!(wait_for(|| first.inputs.lock().len() == 2));

        codec.flush().unwrap();
        let second = Arc::new(Recorder::default());
        codec.register_callbacks(second.clone());
        codec.start().unwrap();

        assert!(wait_for(|| second.inputs.lock().len() == 2));
        assert_eq!(*second.inputs.lock(), vec![0, 1]);
        assert_eq!(first.inputs.lock().len(), 2);
    }

    #[test]
    fn rejects_bad_formats() {
        let service = LoopbackService::default();
        assert!(matches!(
            service.create_decoder("video/hevc"),
            Err(CodecError::UnsupportedMime(_))
        ));
        let codec = service.create_decoder(MIME_AVC).unwrap();
        let err = codec
            .configure(&MediaFormat::video(MIME_AVC, 0, 0), SurfaceHandle(0))
            .unwrap_err();
        assert!(matches!(err, CodecError::FormatRejected(_)));
        assert!(service.formats().is_empty());
    }
}
