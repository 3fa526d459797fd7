use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::input_router::InputEvent;
use crate::pool::SessionPool;

/// `(timestamp, bytes_sent)` sample retained for the sliding bandwidth
/// window. Bounded at `BANDWIDTH_WINDOW_CAPACITY` entries (spec.md §4.8: N≈30).
const BANDWIDTH_WINDOW_CAPACITY: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataChannelState {
    Opening,
    Open,
    Closed,
}

/// One negotiated end-to-end connection to a single client. Owns a video
/// track and an audio track fed by the bound Session's Frame/Audio Sources,
/// plus one reliable ordered data channel carrying input events.
///
/// Per the object-graph note in spec.md §9, a Peer Transport never holds a
/// raw/owning reference to its Session — only the id, looked up through the
/// pool whenever it needs to touch it (e.g. to ask for a close, or report an
/// input event).
pub struct PeerTransport {
    pub id: String,
    pub session_id: String,
    pc: Arc<RTCPeerConnection>,
    video_track: Arc<TrackLocalStaticSample>,
    audio_track: Arc<TrackLocalStaticSample>,
    data_channel: AsyncMutex<Option<Arc<RTCDataChannel>>>,
    data_channel_state: Mutex<DataChannelState>,
    state: Mutex<PeerState>,
    state_tx: watch::Sender<PeerState>,
    video_pts: AtomicU32,
    audio_pts: AtomicU32,

    /// Current quality (1-100) and FPS target (1-`max_framerate`). Read by
    /// the Frame Source on a copy-on-read basis; written only by manual
    /// `quality:set`/`fps:set` messages or the Adaptive Controller.
    pub quality: AtomicU8,
    pub fps: AtomicU8,
    pub adaptive_mode: AtomicBool,
    bandwidth_window: Mutex<VecDeque<(Instant, usize)>>,
    next_video_due: Mutex<Instant>,

    pool: Arc<SessionPool>,
    input_tx: mpsc::UnboundedSender<(String, String, InputEvent)>,
}

impl PeerTransport {
    /// Allocates a peer bound to `session_id`, attaches media tracks and the
    /// input data channel, and returns both the handle and the SDP offer the
    /// caller should forward over the signaling endpoint.
    pub async fn create(
        peer_id: String,
        session_id: String,
        config: &Config,
        pool: Arc<SessionPool>,
        input_tx: mpsc::UnboundedSender<(String, String, InputEvent)>,
    ) -> AppResult<(Arc<Self>, RTCSessionDescription)> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::Transport(e.to_string()))?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| AppError::Transport(e.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let mut ice_servers: Vec<RTCIceServer> = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();
        if let Some(turn) = config.turn_server.clone() {
            ice_servers.push(RTCIceServer {
                urls: vec![turn],
                username: config.turn_username.clone().unwrap_or_default(),
                credential: config.turn_password.clone().unwrap_or_default(),
                ..Default::default()
            });
        }

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| AppError::Transport(e.to_string()))?,
        );

        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                ..Default::default()
            },
            "video".to_string(),
            format!("session-{session_id}"),
        ));
        pc.add_track(video_track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| AppError::Transport(e.to_string()))?;

        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                channels: config.audio_channels as u16,
                clock_rate: config.audio_sample_rate,
                ..Default::default()
            },
            "audio".to_string(),
            format!("session-{session_id}"),
        ));
        pc.add_track(audio_track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| AppError::Transport(e.to_string()))?;

        let data_channel = pc
            .create_data_channel(
                "input",
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| AppError::Transport(e.to_string()))?;

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| AppError::Transport(e.to_string()))?;
        pc.set_local_description(offer)
            .await
            .map_err(|e| AppError::Transport(e.to_string()))?;
        // Non-trickle ICE: wait for gathering to finish so the offer we hand
        // back over signaling already carries every candidate (spec.md §4.7
        // lists no server->client ice-candidate message, so candidates must
        // travel embedded in the SDP rather than trickled separately).
        wait_for_ice_gathering_complete(&pc, Duration::from_secs(10)).await;
        let local_description = pc
            .local_description()
            .await
            .ok_or_else(|| AppError::Transport("missing local description after offer".into()))?;

        let (state_tx, _state_rx) = watch::channel(PeerState::New);
        let peer = Arc::new(Self {
            id: peer_id,
            session_id,
            pc: pc.clone(),
            video_track,
            audio_track,
            data_channel: AsyncMutex::new(None),
            data_channel_state: Mutex::new(DataChannelState::Opening),
            state: Mutex::new(PeerState::New),
            state_tx,
            video_pts: AtomicU32::new(0),
            audio_pts: AtomicU32::new(0),
            quality: AtomicU8::new(75),
            fps: AtomicU8::new(config.framerate.min(255) as u8),
            adaptive_mode: AtomicBool::new(true),
            bandwidth_window: Mutex::new(VecDeque::with_capacity(BANDWIDTH_WINDOW_CAPACITY)),
            next_video_due: Mutex::new(Instant::now()),
            pool,
            input_tx,
        });

        peer.wire_data_channel(data_channel).await;
        peer.wire_connection_state_handler();

        Ok((peer, local_description))
    }

    async fn wire_data_channel(self: &Arc<Self>, channel: Arc<RTCDataChannel>) {
        let peer_for_open = self.clone();
        channel.on_open(Box::new(move || {
            let peer = peer_for_open.clone();
            Box::pin(async move {
                *peer.data_channel_state.lock().unwrap() = DataChannelState::Open;
                info!(peer = %peer.id, "input data channel open");
            })
        }));

        let peer_for_message = self.clone();
        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            let peer = peer_for_message.clone();
            Box::pin(async move {
                peer.on_input_message(msg);
            })
        }));

        let peer_for_close = self.clone();
        channel.on_close(Box::new(move || {
            let peer = peer_for_close.clone();
            Box::pin(async move {
                *peer.data_channel_state.lock().unwrap() = DataChannelState::Closed;
            })
        }));

        *self.data_channel.lock().await = Some(channel);
    }

    fn wire_connection_state_handler(self: &Arc<Self>) {
        let peer = self.clone();
        self.pc.on_peer_connection_state_change(Box::new(move |s| {
            let peer = peer.clone();
            Box::pin(async move {
                let mapped = match s {
                    RTCPeerConnectionState::New => PeerState::New,
                    RTCPeerConnectionState::Connecting => PeerState::Connecting,
                    RTCPeerConnectionState::Connected => PeerState::Connected,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                        PeerState::Failed
                    }
                    _ => return,
                };
                *peer.state.lock().unwrap() = mapped;
                let _ = peer.state_tx.send(mapped);
                if mapped == PeerState::Failed {
                    warn!(peer = %peer.id, session = %peer.session_id, "peer connection failed");
                    let pool = peer.pool.clone();
                    let session_id = peer.session_id.clone();
                    tokio::spawn(async move {
                        let _ = pool.close(&session_id).await;
                    });
                }
            })
        }));
    }

    fn on_input_message(&self, msg: DataChannelMessage) {
        let text = match String::from_utf8(msg.data.to_vec()) {
            Ok(t) => t,
            Err(_) => {
                warn!(peer = %self.id, "dropped non-utf8 input channel frame");
                return;
            }
        };
        match serde_json::from_str::<InputEvent>(&text) {
            Ok(event) => {
                if self
                    .input_tx
                    .send((self.session_id.clone(), self.id.clone(), event))
                    .is_err()
                {
                    warn!(peer = %self.id, "input router channel closed");
                }
            }
            Err(err) => {
                debug!(peer = %self.id, %err, "dropped malformed input event");
            }
        }
    }

    pub async fn set_remote_answer(&self, answer: RTCSessionDescription) -> AppResult<()> {
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| AppError::Transport(e.to_string()))
    }

    pub async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> AppResult<()> {
        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| AppError::Transport(e.to_string()))
    }

    pub fn on_ice_candidate<F>(self: &Arc<Self>, mut callback: F)
    where
        F: FnMut(RTCIceCandidate) + Send + 'static,
    {
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(candidate) = candidate {
                callback(candidate);
            }
            Box::pin(async {})
        }));
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock().unwrap()
    }

    /// A receiver that observes every connection-state transition, used by
    /// the signaling endpoint to emit `{type:"ready"}` once negotiation
    /// completes (spec.md §4.7).
    pub fn watch_state(&self) -> watch::Receiver<PeerState> {
        self.state_tx.subscribe()
    }

    pub fn data_channel_state(&self) -> DataChannelState {
        *self.data_channel_state.lock().unwrap()
    }

    /// Pushes one encoded still frame to this peer's video track with a
    /// strictly increasing presentation ordinal (spec.md invariant (ii) in
    /// §5: per-peer video delivery order).
    pub async fn push_video_frame(&self, payload: Bytes, duration: Duration) {
        let size = payload.len();
        let sample = Sample {
            data: payload,
            duration,
            ..Default::default()
        };
        if let Err(err) = self.video_track.write_sample(&sample).await {
            debug!(peer = %self.id, %err, "video sample write failed");
            return;
        }
        self.video_pts.fetch_add(1, Ordering::Relaxed);
        self.record_bytes_sent(size);
    }

    /// Pushes one 20ms audio frame whose PTS advances by exactly
    /// `samples_per_frame` from the previous delivery (spec.md invariant
    /// (iii)).
    pub async fn push_audio_frame(&self, pcm: Bytes, duration: Duration) {
        let size = pcm.len();
        let sample = Sample {
            data: pcm,
            duration,
            ..Default::default()
        };
        if let Err(err) = self.audio_track.write_sample(&sample).await {
            debug!(peer = %self.id, %err, "audio sample write failed");
            return;
        }
        self.audio_pts.fetch_add(1, Ordering::Relaxed);
        self.record_bytes_sent(size);
    }

    fn record_bytes_sent(&self, bytes: usize) {
        let mut window = self.bandwidth_window.lock().unwrap();
        window.push_back((Instant::now(), bytes));
        while window.len() > BANDWIDTH_WINDOW_CAPACITY {
            window.pop_front();
        }
    }

    /// `8·Σbytes / Δt` over the retained window, clamped to `[0.5, 50]`
    /// Mbps (spec.md §4.8, §8). Empty/zero-span windows read as the floor.
    pub fn bandwidth_mbps(&self) -> f64 {
        let window = self.bandwidth_window.lock().unwrap();
        crate::adaptive::estimate_bandwidth_mbps(window.iter().copied())
    }

    pub fn quality_and_fps(&self) -> (u8, u8) {
        (self.quality.load(Ordering::Relaxed), self.fps.load(Ordering::Relaxed))
    }

    /// Whether this tick should actually push a video frame to this peer,
    /// given its own `fps` target. The Frame Source's capture cadence is
    /// governed by the session's base `target_fps` (spec.md §4.2 step 1);
    /// a peer with a lower target just skips some of those ticks so its
    /// effective delivery rate matches its own setting.
    pub fn due_for_video_frame(&self) -> bool {
        let fps = self.fps.load(Ordering::Relaxed);
        let mut next_due = self.next_video_due.lock().unwrap();
        let (due, new_next) = fps_gate(Instant::now(), *next_due, fps);
        *next_due = new_next;
        due
    }

    pub fn set_quality(&self, quality: u8) {
        self.quality.store(quality, Ordering::Relaxed);
    }

    pub fn set_fps(&self, fps: u8) {
        self.fps.store(fps, Ordering::Relaxed);
    }

    pub async fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == PeerState::Closed {
                return;
            }
            *state = PeerState::Closed;
        }
        if let Err(err) = self.pc.close().await {
            debug!(peer = %self.id, %err, "error closing peer connection");
        }
        if let Some(session) = self.pool.get(&self.session_id) {
            session.remove_subscriber(&self.id);
        }
    }
}

/// Pure decision for `PeerTransport::due_for_video_frame`: given the current
/// time, the previously scheduled due time, and a peer's fps target,
/// returns whether a frame should be pushed now and the next due time.
fn fps_gate(now: Instant, next_due: Instant, fps: u8) -> (bool, Instant) {
    let frame_interval = Duration::from_secs_f64(1.0 / fps.max(1) as f64);
    if now < next_due {
        (false, next_due)
    } else {
        (true, now + frame_interval)
    }
}

async fn wait_for_ice_gathering_complete(pc: &RTCPeerConnection, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while pc.ice_gathering_state() != RTCIceGatheringState::Complete {
        if Instant::now() >= deadline {
            warn!("ice gathering did not complete within deadline, sending partial candidate set");
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn fresh_window_reports_floor_bandwidth() {
        let window: VecDeque<(Instant, usize)> = VecDeque::new();
        assert_eq!(crate::adaptive::estimate_bandwidth_mbps(window.into_iter()), 0.5);
    }

    #[test_timeout::timeout]
    fn fps_gate_allows_frame_when_due_and_schedules_next() {
        let now = Instant::now();
        let (due, next) = fps_gate(now, now, 10);
        assert!(due);
        assert!(next > now);
        assert!((next - now) <= Duration::from_millis(101));
    }

    #[test_timeout::timeout]
    fn fps_gate_blocks_frame_before_next_due() {
        let now = Instant::now();
        let future_due = now + Duration::from_secs(1);
        let (due, next) = fps_gate(now, future_due, 30);
        assert!(!due);
        assert_eq!(next, future_due);
    }

    #[test_timeout::timeout]
    fn fps_gate_lower_fps_yields_longer_interval_than_higher_fps() {
        let now = Instant::now();
        let (_, next_slow) = fps_gate(now, now, 5);
        let (_, next_fast) = fps_gate(now, now, 30);
        assert!(next_slow - now > next_fast - now);
    }
}
