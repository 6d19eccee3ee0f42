//! Integration test: payload delivery → scan → feed → loopback decoder.
//!
//! Drives a [`Player`] the way a network client would and checks what the
//! decoder actually received.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nalufeed::decoder::loopback::{LoopbackOptions, LoopbackService};
use nalufeed::{
    BufferFlags, DecoderConfig, PayloadDelegate, Phase, PlaybackTarget, Player, SurfaceHandle,
};

const TARGET: PlaybackTarget = PlaybackTarget {
    surface: SurfaceHandle(42),
    width: 1280,
    height: 720,
};

fn unit(header: u8, body_len: usize) -> Vec<u8> {
    let mut nal = vec![0, 0, 0, 1, header];
    nal.extend((0..body_len).map(|i| (i % 200) as u8 + 2));
    nal
}

/// One group of pictures: SPS, PPS, IDR, then `slices` non-IDR slices.
fn gop(slices: usize) -> Vec<u8> {
    let mut data = unit(0x67, 12);
    data.extend(unit(0x68, 4));
    data.extend(unit(0x65, 64));
    for _ in 0..slices {
        data.extend(unit(0x41, 32));
    }
    data
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

#[test]
fn stream_reaches_decoder_in_order_with_flags() {
    let service = LoopbackService::default();
    let player = Player::new(Arc::new(service.clone()));
    player.start_playback(TARGET).expect("start playback");

    let first = gop(3);
    let second = gop(2);
    player.payload(&first);
    player.payload(&second);

    let queued = service.queued();
    assert_eq!(queued.len(), 6 + 5);

    let flags: Vec<BufferFlags> = queued.iter().map(|q| q.flags).collect();
    let config = BufferFlags::CODEC_CONFIG;
    let key = BufferFlags::KEY_FRAME;
    let none = BufferFlags::NONE;
    assert_eq!(
        flags,
        vec![
            config, config, key, none, none, none, config, config, key, none, none
        ]
    );

    // each payload is reassembled exactly by its queued units
    let joined: Vec<u8> = queued[..6].iter().flat_map(|q| q.data.clone()).collect();
    assert_eq!(joined, first);
    let joined: Vec<u8> = queued[6..].iter().flat_map(|q| q.data.clone()).collect();
    assert_eq!(joined, second);

    // IDR and slices produce output, parameter sets do not
    assert!(wait_for(|| service.rendered() == 7));

    let stats = player.stats();
    assert_eq!(stats.queued, 11);
    assert_eq!(stats.config_units, 4);
    assert_eq!(stats.key_frames, 2);
    assert_eq!(stats.dropped, 0);

    player.stop_playback();
}

#[test]
fn decoder_fault_then_resume_is_primed() {
    let service = LoopbackService::default();
    let player = Player::new(Arc::new(service.clone()));
    player.start_playback(TARGET).unwrap();
    player.payload(&gop(1));

    assert!(service.inject_fault("surface lost"));
    assert!(wait_for(|| player.session().phase() == Phase::Released));
    assert!(!player.is_playing());

    // nothing reaches the released decoder
    let before = service.queued().len();
    let summary = player.deliver_payload(&gop(1));
    assert_eq!(summary.queued, 0);
    assert_eq!(service.queued().len(), before);

    assert!(player.resume_playback().unwrap());
    assert!(player.is_playing());
    let formats = service.formats();
    assert_eq!(formats.len(), 2);
    assert_eq!(formats[1].csd.len(), 2);
    assert_eq!(formats[1].csd[0], unit(0x67, 12));
    assert_eq!(formats[1].csd[1], unit(0x68, 4));

    // slices decode right away on the primed decoder
    let summary = player.deliver_payload(&[unit(0x41, 32), unit(0x41, 32)].concat());
    assert_eq!(summary.queued, 2);
    assert_eq!(player.stats().faults, 1);
}

#[test]
fn starved_decoder_drops_and_keeps_streaming() {
    let options = LoopbackOptions {
        input_slots: 2,
        recycle_inputs: false,
        ..LoopbackOptions::default()
    };
    let config = DecoderConfig::default().with_input_timeout(Duration::from_millis(100));
    let service = LoopbackService::new(options);
    let player = Player::with_config(Arc::new(service.clone()), config);
    player.start_playback(TARGET).unwrap();

    let start = Instant::now();
    let summary = player.deliver_payload(&gop(2));
    let elapsed = start.elapsed();

    assert_eq!(summary.scanned, 5);
    assert_eq!(summary.queued, 2);
    assert_eq!(summary.dropped, 3);
    // three bounded waits, never an unbounded block
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_secs(5));
    assert!(player.is_playing());
}

#[test]
fn stop_races_with_delivery() {
    let service = LoopbackService::default();
    let player = Arc::new(Player::new(Arc::new(service.clone())));
    player.start_playback(TARGET).unwrap();

    let feeder = {
        let player = player.clone();
        thread::spawn(move || {
            let payload = gop(4);
            let mut queued = 0;
            for _ in 0..200 {
                queued += player.deliver_payload(&payload).queued;
            }
            queued
        })
    };

    thread::sleep(Duration::from_millis(10));
    player.stop_playback();
    let queued = feeder.join().expect("feeder thread");

    assert_eq!(player.session().phase(), Phase::Released);
    assert_eq!(service.queued().len(), queued);
}
