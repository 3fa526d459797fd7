use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::transport::PeerTransport;

/// Bandwidth thresholds from spec.md §4.8.
const FAST_MBPS: f64 = 5.0;
const NORMAL_MBPS: f64 = 2.0;

const MIN_MBPS: f64 = 0.5;
const MAX_MBPS: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityDecision {
    pub quality: u8,
    pub fps: u8,
}

/// `8·Σbytes/Δt` over the given `(timestamp, bytes)` samples, clamped to
/// `[0.5, 50]` Mbps. An empty window, or one whose span is effectively
/// zero, reports the floor rather than dividing by zero.
pub fn estimate_bandwidth_mbps(samples: impl Iterator<Item = (Instant, usize)>) -> f64 {
    let samples: Vec<(Instant, usize)> = samples.collect();
    if samples.len() < 2 {
        return MIN_MBPS;
    }
    let first = samples.first().unwrap().0;
    let last = samples.last().unwrap().0;
    let elapsed = last.duration_since(first).as_secs_f64();
    if elapsed <= 0.0 {
        return MIN_MBPS;
    }
    let total_bytes: usize = samples.iter().map(|(_, b)| b).sum();
    let mbps = 8.0 * total_bytes as f64 / 1_000_000.0 / elapsed;
    mbps.clamp(MIN_MBPS, MAX_MBPS)
}

/// Maps an estimated bandwidth to a `(quality, fps)` decision per the table
/// in spec.md §4.8. Monotone in `bandwidth_mbps`: a higher estimate never
/// yields a lower quality or fps than a lower one (spec.md §8).
pub fn classify(bandwidth_mbps: f64) -> QualityDecision {
    if bandwidth_mbps > FAST_MBPS {
        QualityDecision { quality: 90, fps: 30 }
    } else if bandwidth_mbps > NORMAL_MBPS {
        QualityDecision { quality: 75, fps: 30 }
    } else {
        QualityDecision { quality: 50, fps: 20 }
    }
}

/// Spawns the per-peer adjustment loop: every `cadence`, if the peer is
/// still in adaptive mode, recompute `(quality, fps)` from its sliding
/// bandwidth window and apply it. A manual `quality:set`/`fps:set` message
/// clears adaptive mode (see `input_router.rs`); this loop then idles until
/// it's re-enabled.
pub fn spawn_adjustment_loop(peer: Arc<PeerTransport>, cadence: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cadence);
        loop {
            ticker.tick().await;
            if peer.state() == crate::transport::PeerState::Closed
                || peer.state() == crate::transport::PeerState::Failed
            {
                break;
            }
            if !peer.adaptive_mode.load(std::sync::atomic::Ordering::Relaxed) {
                continue;
            }
            let bandwidth = peer.bandwidth_mbps();
            let decision = classify(bandwidth);
            peer.set_quality(decision.quality);
            peer.set_fps(decision.fps);
            debug!(
                peer = %peer.id,
                bandwidth_mbps = bandwidth,
                quality = decision.quality,
                fps = decision.fps,
                "adaptive controller adjustment"
            );
            metrics::gauge!("session_core_peer_bandwidth_mbps", bandwidth, "peer" => peer.id.clone());
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn classify_is_monotone_across_thresholds() {
        let low = classify(1.0);
        let mid = classify(3.0);
        let high = classify(10.0);
        assert!(low.quality <= mid.quality && mid.quality <= high.quality);
        assert!(low.fps <= mid.fps && mid.fps <= high.fps);
    }

    #[test_timeout::timeout]
    fn classify_matches_table_boundaries() {
        assert_eq!(classify(10.0), QualityDecision { quality: 90, fps: 30 });
        assert_eq!(classify(5.0), QualityDecision { quality: 75, fps: 30 });
        assert_eq!(classify(3.0), QualityDecision { quality: 75, fps: 30 });
        assert_eq!(classify(2.0), QualityDecision { quality: 50, fps: 20 });
        assert_eq!(classify(0.1), QualityDecision { quality: 50, fps: 20 });
    }

    #[test_timeout::timeout]
    fn bandwidth_estimate_matches_formula() {
        let t0 = Instant::now();
        let samples = vec![(t0, 125_000usize), (t0 + Duration::from_secs(1), 125_000)];
        let mbps = estimate_bandwidth_mbps(samples.into_iter());
        // 250_000 bytes over ~1s => 2 Mbps, clamped range holds.
        assert!((mbps - 2.0).abs() < 0.5);
    }

    #[test_timeout::timeout]
    fn bandwidth_estimate_clamps_to_floor_and_ceiling() {
        assert_eq!(estimate_bandwidth_mbps(std::iter::empty()), MIN_MBPS);
        let t0 = Instant::now();
        let huge = vec![(t0, 100_000_000usize), (t0 + Duration::from_millis(1), 100_000_000)];
        assert_eq!(estimate_bandwidth_mbps(huge.into_iter()), MAX_MBPS);
    }
}
