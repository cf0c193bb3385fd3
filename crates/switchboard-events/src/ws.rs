// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Axum WebSocket endpoint for the streaming transport.
//!
//! The handler subscribes the client (optionally honoring a first
//! `subscribe` control frame's filters via query-less re-registration),
//! registers its connection with the stream transport, and pumps frames
//! both ways: outbound events and pings to the socket, inbound control
//! frames (`ping`, `pong`, `subscribe`) back into the transport.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use crate::envelope::StreamFrame;
use crate::filter::SubscriptionFilter;
use crate::publisher::EventPublisher;
use crate::transport::stream::StreamTransport;
use crate::transport::TransportProtocol;

/// Oversized control frames are rejected before JSON parsing.
const MAX_CONTROL_BYTES: usize = 16 * 1024;

/// Shared endpoint state.
#[derive(Clone)]
pub struct WsState {
    pub publisher: Arc<EventPublisher>,
    pub transport: Arc<StreamTransport>,
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    /// Identifies the subscribing user; anonymous connections get a
    /// placeholder.
    pub user_id: Option<String>,
}

/// Routes for mounting under the exchange's API server.
pub fn routes(state: WsState) -> Router {
    Router::new()
        .route("/ws/events", get(ws_upgrade))
        .with_state(state)
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<WsState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, params, state))
}

async fn handle_socket(mut socket: WebSocket, params: WsParams, state: WsState) {
    let user_id = params.user_id.unwrap_or_else(|| "anonymous".to_string());

    let subscription = match state.publisher.subscribe(
        &user_id,
        TransportProtocol::Stream,
        SubscriptionFilter::match_all(),
    ) {
        Ok(subscription) => subscription,
        Err(e) => {
            tracing::warn!(error = %e, "websocket subscribe rejected");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    let mut frames = state.transport.register(subscription.id);
    tracing::info!(subscription = %subscription.id, user = %user_id, "stream client connected");

    loop {
        tokio::select! {
            outbound = frames.recv() => {
                let Some(frame) = outbound else { break };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(error = %e, "frame serialization failed");
                        continue;
                    }
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        state.transport.note_pong(subscription.id);
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        state.transport.note_pong(subscription.id);
                    }
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > MAX_CONTROL_BYTES {
                            tracing::warn!(
                                bytes = text.len(),
                                "rejecting oversized control frame"
                            );
                            break;
                        }
                        match serde_json::from_str::<StreamFrame>(&text) {
                            Ok(StreamFrame::Ping) => {
                                state.transport.note_pong(subscription.id);
                                let pong = match serde_json::to_string(&StreamFrame::pong()) {
                                    Ok(pong) => pong,
                                    Err(_) => continue,
                                };
                                if socket.send(Message::Text(pong)).await.is_err() {
                                    break;
                                }
                            }
                            Ok(StreamFrame::Pong { .. }) => {
                                state.transport.note_pong(subscription.id);
                            }
                            Ok(StreamFrame::Subscribe { filters }) => {
                                // Replace the match-all registration with
                                // the client's filters.
                                state.publisher.router().unregister(subscription.id);
                                state.publisher.router().register(subscription.id, filters);
                                tracing::debug!(
                                    subscription = %subscription.id,
                                    "client filters applied"
                                );
                            }
                            Ok(other) => {
                                tracing::debug!(frame = ?other, "ignoring unexpected client frame");
                            }
                            Err(e) => {
                                tracing::debug!(error = %e, "unparsable control frame");
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        tracing::debug!("ignoring binary client frame");
                    }
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "websocket receive error");
                        break;
                    }
                }
            }
        }
    }

    state.transport.deregister(subscription.id);
    if let Err(e) = state.publisher.unsubscribe(subscription.id) {
        tracing::debug!(subscription = %subscription.id, error = %e, "unsubscribe on disconnect");
    }
    tracing::info!(subscription = %subscription.id, "stream client disconnected");
}
