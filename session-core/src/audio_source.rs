use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::session::{SessionHandle, SessionStatus};

const FRAME_DURATION: Duration = Duration::from_millis(20);
const RING_CAPACITY: usize = 8;
const ERROR_LOG_INTERVAL_SECONDS: i64 = 60;

fn samples_per_frame(sample_rate: u32) -> usize {
    (sample_rate as f64 * 0.02).round() as usize
}

fn frame_bytes(sample_rate: u32, channels: u16) -> usize {
    samples_per_frame(sample_rate) * channels as usize * 2
}

/// Spawns the capture subprocess on a dedicated OS thread (the one blocking
/// I/O source in the pipeline, per spec.md §9) and forwards whole-frame
/// chunks into a bounded channel. The channel is the boundary between
/// blocking capture and the async paced reader below; on process death it
/// simply closes, and the reader falls back to silence forever.
fn spawn_capture_reader(config: Arc<Config>, tx: mpsc::Sender<Vec<u8>>) {
    tokio::spawn(async move {
        let chunk_size = frame_bytes(config.audio_sample_rate, config.audio_channels);
        let mut command = Command::new(&config.audio_capture_command);
        command
            .arg("--raw")
            .arg("--format=s16le")
            .arg(format!("--rate={}", config.audio_sample_rate))
            .arg(format!("--channels={}", config.audio_channels))
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                error!(%err, command = %config.audio_capture_command, "failed to spawn audio capture process");
                return;
            }
        };

        let mut stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                error!("audio capture process has no stdout pipe");
                return;
            }
        };

        let mut buffer = vec![0u8; chunk_size];
        loop {
            if let Err(err) = stdout.read_exact(&mut buffer).await {
                warn!(%err, "audio capture stream ended");
                break;
            }
            if tx.send(buffer.clone()).await.is_err() {
                break;
            }
        }
        let _ = child.kill().await;
    });
}

/// Runs the paced Audio Source loop for one Session until it closes. Reads
/// one whole-frame chunk per 20ms tick from the capture reader's channel; if
/// none is available (ring empty, or the capture process has died) emits
/// silence of the same shape rather than blocking the pipeline.
pub fn spawn(session: SessionHandle, config: Arc<Config>) {
    if !config.audio_enabled {
        return;
    }
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(RING_CAPACITY);
    spawn_capture_reader(config.clone(), tx);

    tokio::spawn(async move {
        let silence = vec![0u8; frame_bytes(config.audio_sample_rate, config.audio_channels)];
        let last_error_logged = AtomicI64::new(0);
        let mut ticker = tokio::time::interval(FRAME_DURATION);

        loop {
            ticker.tick().await;
            if matches!(session.status(), SessionStatus::Closing | SessionStatus::Closed) {
                break;
            }

            let chunk = match rx.try_recv() {
                Ok(chunk) => chunk,
                Err(mpsc::error::TryRecvError::Empty) => silence.clone(),
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    let now = Utc::now().timestamp();
                    let last = last_error_logged.load(Ordering::Relaxed);
                    if now - last >= ERROR_LOG_INTERVAL_SECONDS {
                        last_error_logged.store(now, Ordering::Relaxed);
                        error!(session = %session.id(), "audio capture process unavailable, emitting silence");
                    }
                    silence.clone()
                }
            };

            let payload = Bytes::from(chunk);
            for peer in session.live_subscribers() {
                peer.push_audio_frame(payload.clone(), FRAME_DURATION).await;
            }
        }
        info!(session = %session.id(), "audio source exiting");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn frame_sizing_matches_20ms_at_48k_stereo() {
        assert_eq!(samples_per_frame(48_000), 960);
        assert_eq!(frame_bytes(48_000, 2), 960 * 2 * 2);
    }

    #[test_timeout::timeout]
    fn frame_sizing_matches_20ms_at_48k_mono() {
        assert_eq!(frame_bytes(48_000, 1), 960 * 2);
    }
}
