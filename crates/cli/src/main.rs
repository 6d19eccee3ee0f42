use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use nalufeed::decoder::loopback::{LoopbackOptions, LoopbackService};
use nalufeed::{DecoderConfig, PayloadDelegate, PlaybackTarget, Player, SurfaceHandle};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "nalu-feed",
    about = "Feed an H.264 Annex B file through the decoder pipeline"
)]
struct Args {
    /// Annex B elementary stream (.264 / .h264)
    input: PathBuf,

    /// Approximate payload size; payloads are cut at the next start code
    #[arg(long, short, default_value_t = 64 * 1024)]
    chunk_size: usize,

    #[arg(long, default_value_t = 1280)]
    width: u32,

    #[arg(long, default_value_t = 720)]
    height: u32,

    /// Input slots owned by the loopback decoder
    #[arg(long, default_value_t = 8)]
    input_slots: usize,

    /// Feed queue capacity
    #[arg(long, default_value_t = 100)]
    capacity: usize,

    /// Wait for a free input slot before dropping a unit (ms)
    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,
}

/// Split `data` into payloads of at least `chunk_size` bytes, each ending
/// right before a start code so no NAL unit straddles two payloads.
fn payloads(data: &[u8], chunk_size: usize) -> Vec<&[u8]> {
    let mut out = Vec::new();
    let mut start = 0;
    while start < data.len() {
        let mut end = (start + chunk_size.max(1)).min(data.len());
        while end < data.len() && !data[end..].starts_with(&[0, 0, 1]) {
            end += 1;
        }
        // keep the extra zero of a 4-byte prefix with its unit
        if end < data.len() && end > start + 1 && data[end - 1] == 0 {
            end -= 1;
        }
        out.push(&data[start..end]);
        start = end;
    }
    out
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let data = match std::fs::read(&args.input) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("Failed to read {}: {}", args.input.display(), e);
            std::process::exit(1);
        }
    };

    let service = LoopbackService::new(LoopbackOptions {
        input_slots: args.input_slots,
        ..LoopbackOptions::default()
    });
    let config = DecoderConfig::default()
        .with_feed_capacity(args.capacity)
        .with_input_timeout(Duration::from_millis(args.timeout_ms));
    let player = Player::with_config(Arc::new(service.clone()), config);

    let target = PlaybackTarget {
        surface: SurfaceHandle(0),
        width: args.width,
        height: args.height,
    };
    if let Err(e) = player.start_playback(target) {
        eprintln!("Failed to start playback: {}", e);
        std::process::exit(1);
    }

    let chunks = payloads(&data, args.chunk_size);
    tracing::info!(bytes = data.len(), payloads = chunks.len(), "feeding stream");
    for chunk in &chunks {
        player.payload(chunk);
    }

    let stats = player.stats();
    let sprop = player.session().sprop_parameter_sets();
    let profile = player.session().profile_level_id();
    player.stop_playback();

    println!("payloads:          {}", chunks.len());
    println!("units queued:      {}", stats.queued);
    println!("units dropped:     {}", stats.dropped);
    println!("config units:      {}", stats.config_units);
    println!("key frames:        {}", stats.key_frames);
    println!("decoder faults:    {}", stats.faults);
    println!("frames rendered:   {}", service.rendered());
    if let Some(profile) = profile {
        println!("profile-level-id:  {}", profile);
    }
    if let Some(sprop) = sprop {
        println!("sprop-parameter-sets: {}", sprop);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_end_before_start_codes() {
        let mut data = vec![0, 0, 0, 1, 0x67, 5, 5, 5];
        data.extend_from_slice(&[0, 0, 1, 0x68, 6, 6]);
        data.extend_from_slice(&[0, 0, 0, 1, 0x65, 7, 7, 7, 7]);

        let chunks = payloads(&data, 2);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], &[0, 0, 0, 1, 0x67, 5, 5, 5]);
        assert_eq!(chunks[1], &[0, 0, 1, 0x68, 6, 6]);
        assert_eq!(chunks[2], &[0, 0, 0, 1, 0x65, 7, 7, 7, 7]);
        assert_eq!(chunks.concat(), data);
    }

    #[test]
    fn large_chunk_keeps_everything_together() {
        let data = [0, 0, 1, 0x65, 1, 2, 0, 0, 1, 0x41, 3];
        assert_eq!(payloads(&data, 1024), vec![&data[..]]);
    }
}
