use std::collections::HashMap;
use std::io::Cursor;
use std::time::{Duration, Instant};

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::ImageFormat;
use tracing::{debug, warn};

use crate::session::{SessionHandle, SessionStatus};

/// Re-encodes a captured still to `quality` (1-100) if it differs from the
/// driver's native capture quality. Cheap to call with the same bytes
/// multiple times since it decodes+encodes fresh each call; the caller
/// (the paced loop below) is responsible for deduplicating per distinct
/// quality value across subscribers so a tick costs at most one decode per
/// distinct setting rather than one per peer (spec.md §4.2).
fn reencode(source: &[u8], quality: u8) -> Option<Bytes> {
    let decoded = image::load_from_memory_with_format(source, ImageFormat::Jpeg).ok()?;
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
    encoder
        .encode_image(&decoded)
        .ok()
        .map(|_| Bytes::from(out))
}

/// Runs the paced Frame Source loop for one Session until it closes. Meant
/// to be spawned once per Session (see `session::spawn`); there is no
/// public constructor because a Frame Source has no identity independent of
/// its Session (spec.md §3: "A Session exclusively owns ... its Frame ...
/// Source[s]").
pub fn spawn(session: SessionHandle, target_fps: u32) {
    tokio::spawn(async move {
        let mut interval = Duration::from_secs_f64(1.0 / target_fps.max(1) as f64);
        let mut next_deadline = Instant::now() + interval;
        let mut previous_frame: Option<Bytes> = None;

        loop {
            let now = Instant::now();
            if next_deadline > now {
                tokio::time::sleep(next_deadline - now).await;
            }
            let tick_deadline = next_deadline;
            next_deadline += interval;

            if matches!(session.status(), SessionStatus::Closing | SessionStatus::Closed) {
                break;
            }

            let subscribers = session.live_subscribers();
            if subscribers.is_empty() {
                // Keep pacing even with nobody attached yet, so the first
                // subscriber doesn't see a stale deadline on join.
                continue;
            }

            // Re-read the per-peer FPS target each tick; the slowest
            // subscriber's cadence governs how often we bother capturing at
            // all (fast peers just receive more repeats), but we always
            // honor the configured base `target_fps` for the capture tick
            // itself per spec.md §4.2 step 1.
            let frame: Bytes = if Instant::now() > tick_deadline + interval && previous_frame.is_some() {
                session.record_frame_skipped();
                previous_frame.clone().unwrap()
            } else {
                match session.capture_frame().await {
                    Ok(bytes) => {
                        session.record_frame_captured();
                        Bytes::from(bytes)
                    }
                    Err(err) => {
                        warn!(session = %session.id(), %err, "capture failed, reusing previous frame");
                        session.record_frame_skipped();
                        match previous_frame.clone() {
                            Some(bytes) => bytes,
                            None => continue,
                        }
                    }
                }
            };
            previous_frame = Some(frame.clone());

            // Encode once per distinct quality value present among
            // subscribers rather than once per peer. A peer whose own fps
            // target is below the session's capture cadence skips some
            // ticks entirely so its effective delivery rate matches that
            // target (spec.md §3 Peer Transport: "current FPS target").
            let mut encoded_by_quality: HashMap<u8, Bytes> = HashMap::new();
            for peer in &subscribers {
                if !peer.due_for_video_frame() {
                    continue;
                }
                let (quality, _) = peer.quality_and_fps();
                let payload = encoded_by_quality
                    .entry(quality)
                    .or_insert_with(|| reencode(&frame, quality).unwrap_or_else(|| frame.clone()))
                    .clone();
                peer.push_video_frame(payload, interval).await;
            }
            debug!(session = %session.id(), peers = subscribers.len(), "frame tick delivered");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_jpeg() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(4, 4, image::Rgb([10, 20, 30]));
        let mut out = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Jpeg)
            .unwrap();
        out
    }

    #[test_timeout::timeout]
    fn reencode_produces_valid_jpeg_at_new_quality() {
        let source = sample_jpeg();
        let out = reencode(&source, 40).expect("reencode should succeed");
        assert!(image::load_from_memory_with_format(&out, ImageFormat::Jpeg).is_ok());
    }
}
