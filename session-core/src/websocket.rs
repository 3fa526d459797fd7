use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::adaptive;
use crate::handlers::AppState;
use crate::signaling::{generate_peer_id, ClientMessage, ServerMessage, SessionDescription};
use crate::transport::{PeerState, PeerTransport};

/// `GET /ws/signaling` (spec.md §4.7/§6). One peer per signaling connection;
/// the client joins a session by id once connected, rather than binding to
/// one in the URL, since a socket that fails to join must stay open for a
/// retry (spec.md §4.7: "join to a non-existent session ... keeps the
/// signaling channel open").
pub async fn signaling_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let peer_id = generate_peer_id();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let writer_peer_id = peer_id.clone();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(json) => {
                    if sink.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(peer = %writer_peer_id, %err, "failed to serialize signaling message");
                }
            }
        }
    });

    let mut peer: Option<Arc<PeerTransport>> = None;
    let mut joined_session_id: Option<String> = None;

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(peer = %peer_id, %err, "signaling socket error");
                break;
            }
        };

        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let message: ClientMessage = match serde_json::from_str(&text) {
            Ok(message) => message,
            Err(err) => {
                debug!(peer = %peer_id, %err, "dropped malformed signaling message");
                let _ = tx.send(ServerMessage::Error {
                    message: format!("malformed message: {err}"),
                });
                continue;
            }
        };

        match message {
            ClientMessage::Join { session_id } => {
                if peer.is_some() {
                    let _ = tx.send(ServerMessage::Error {
                        message: "peer has already joined a session".into(),
                    });
                    continue;
                }
                handle_join(&state, &peer_id, session_id, &tx, &mut peer, &mut joined_session_id)
                    .await;
            }
            ClientMessage::Answer { answer } => {
                let Some(bound) = peer.as_ref() else {
                    let _ = tx.send(ServerMessage::Error {
                        message: "join before sending an answer".into(),
                    });
                    continue;
                };
                match RTCSessionDescription::answer(answer.sdp) {
                    Ok(description) => {
                        if let Err(err) = bound.set_remote_answer(description).await {
                            let _ = tx.send(ServerMessage::Error { message: err.to_string() });
                        }
                    }
                    Err(err) => {
                        let _ = tx.send(ServerMessage::Error { message: err.to_string() });
                    }
                }
            }
            ClientMessage::IceCandidate { candidate, sdp_mid, sdp_mline_index } => {
                let Some(bound) = peer.as_ref() else {
                    let _ = tx.send(ServerMessage::Error {
                        message: "join before sending ice candidates".into(),
                    });
                    continue;
                };
                let init = RTCIceCandidateInit {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                    ..Default::default()
                };
                if let Err(err) = bound.add_ice_candidate(init).await {
                    let _ = tx.send(ServerMessage::Error { message: err.to_string() });
                }
            }
            ClientMessage::Ping => {
                let _ = tx.send(ServerMessage::Pong);
            }
            ClientMessage::QualitySet { quality } => {
                if let Some(bound) = peer.as_ref() {
                    bound.adaptive_mode.store(false, Ordering::Relaxed);
                    bound.set_quality(quality.clamp(1, 100));
                }
            }
            ClientMessage::FpsSet { fps } => {
                if let Some(bound) = peer.as_ref() {
                    bound.adaptive_mode.store(false, Ordering::Relaxed);
                    bound.set_fps(fps.max(1));
                }
            }
        }
    }

    if let Some(bound) = peer {
        bound.close().await;
    }
    // Peer-lifetime Session model (spec.md §9 open question, resolved in
    // SPEC_FULL.md): a Session exists to serve exactly one peer connection,
    // so losing the signaling socket closes the bound Session too.
    if let Some(session_id) = joined_session_id {
        let _ = state.pool.close(&session_id).await;
    }
    info!(peer = %peer_id, "signaling connection closed");
}

/// Forwards exactly one `{type:"ready"}` the first time the peer connection
/// reaches `Connected`, then exits.
fn spawn_ready_notifier(peer: Arc<PeerTransport>, tx: mpsc::UnboundedSender<ServerMessage>) {
    let mut watch = peer.watch_state();
    tokio::spawn(async move {
        loop {
            if *watch.borrow() == PeerState::Connected {
                let _ = tx.send(ServerMessage::Ready);
                return;
            }
            if matches!(*watch.borrow(), PeerState::Failed | PeerState::Closed) {
                return;
            }
            if watch.changed().await.is_err() {
                return;
            }
        }
    });
}

async fn handle_join(
    state: &AppState,
    peer_id: &str,
    session_id: String,
    tx: &mpsc::UnboundedSender<ServerMessage>,
    peer_slot: &mut Option<Arc<PeerTransport>>,
    joined_session_id: &mut Option<String>,
) {
    let Some(session) = state.pool.get(&session_id) else {
        let _ = tx.send(ServerMessage::Error {
            message: format!("session {session_id} not found"),
        });
        return;
    };

    match PeerTransport::create(
        peer_id.to_string(),
        session_id.clone(),
        &state.config,
        state.pool.clone(),
        state.input_tx.clone(),
    )
    .await
    {
        Ok((transport, offer)) => {
            session.add_subscriber(peer_id.to_string(), &transport);
            adaptive::spawn_adjustment_loop(
                transport.clone(),
                Duration::from_secs(state.config.adaptive_adjustment_seconds),
            );
            spawn_ready_notifier(transport.clone(), tx.clone());
            let _ = tx.send(ServerMessage::Offer {
                offer: SessionDescription { sdp: offer.sdp, kind: "offer".to_string() },
            });
            *peer_slot = Some(transport);
            *joined_session_id = Some(session_id);
        }
        Err(err) => {
            warn!(peer = %peer_id, session = %session_id, %err, "failed to allocate peer transport");
            let _ = tx.send(ServerMessage::Error { message: err.to_string() });
        }
    }
}
