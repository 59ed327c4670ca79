//! WebSocket signaling transport.
//!
//! `GET /ws?uid=<uid>` upgrades to a WebSocket carrying JSON
//! [`ClientEvent`]s in and [`ServerEvent`]s out. Each connection gets a fresh
//! connection id and a bounded outbound queue registered with the
//! [`ConnectionHub`](crate::session::hub::ConnectionHub). Inbound events are
//! dispatched one at a time in arrival order. When the socket closes the
//! participant is handed to [`SessionHandler::disconnect`], which starts the
//! reconnection grace period.

use crate::session::messages::{ClientEvent, ServerEvent};
use crate::session::{ConnectionContext, SessionHandler};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outbound events buffered per connection before new ones are dropped.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// Largest inbound frame accepted.
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

#[derive(Clone)]
struct SignalingState {
    handler: Arc<SessionHandler>,
    shutdown: CancellationToken,
}

#[derive(Debug, Deserialize)]
struct ConnectQuery {
    uid: String,
}

/// Router serving the `/ws` upgrade endpoint.
pub fn signaling_router(handler: Arc<SessionHandler>, shutdown: CancellationToken) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(SignalingState { handler, shutdown })
}

async fn ws_upgrade(
    State(state): State<SignalingState>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let uid = query.uid.trim().to_string();
    if uid.is_empty() {
        return (StatusCode::BAD_REQUEST, "uid is required").into_response();
    }

    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_failed_upgrade(|error| {
            warn!(target: "sfu.signaling", error = %error, "WebSocket upgrade failed");
        })
        .on_upgrade(move |socket| run_connection(socket, state.handler, state.shutdown, uid))
}

/// Parse one inbound frame. On failure returns the error reply, naming the
/// event when the frame carried a recognisable name.
fn parse_event(text: &str) -> Result<ClientEvent, ServerEvent> {
    let malformed = |event: String| ServerEvent::Error {
        event,
        code: 1,
        message: "Malformed event".to_string(),
    };

    let value: Value = serde_json::from_str(text).map_err(|_| malformed("unknown".to_string()))?;
    let name = value
        .get("event")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    serde_json::from_value(value).map_err(|_| malformed(name))
}

async fn run_connection(
    socket: WebSocket,
    handler: Arc<SessionHandler>,
    shutdown: CancellationToken,
    uid: String,
) {
    let ctx = ConnectionContext::new(Uuid::new_v4().to_string(), uid);
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(OUTBOUND_QUEUE_CAPACITY);
    handler.hub().register(&ctx.connection_id, tx);
    info!(
        target: "sfu.signaling",
        uid = %ctx.uid,
        connection_id = %ctx.connection_id,
        "Connection opened"
    );

    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!(target: "sfu.signaling", error = %e, "Failed to encode event");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        let frame = tokio::select! {
            () = shutdown.cancelled() => break,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => match parse_event(&text) {
                Ok(event) => handler.dispatch(&ctx, event).await,
                Err(reply) => {
                    debug!(target: "sfu.signaling", uid = %ctx.uid, "Malformed event");
                    handler.hub().send(&ctx.connection_id, reply);
                }
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(target: "sfu.signaling", uid = %ctx.uid, error = %e, "Socket read failed");
                break;
            }
        }
    }

    handler.hub().unregister(&ctx.connection_id);
    writer.abort();
    handler.disconnect(&ctx).await;
    info!(
        target: "sfu.signaling",
        uid = %ctx.uid,
        connection_id = %ctx.connection_id,
        "Connection closed"
    );
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_event_accepts_known_events() {
        let event = parse_event(r#"{"event":"heartbeat"}"#).unwrap();
        assert_eq!(event, ClientEvent::Heartbeat);
    }

    #[test]
    fn test_parse_event_names_the_failing_event() {
        let reply = parse_event(r#"{"event":"consume","data":{}}"#).unwrap_err();
        assert_eq!(
            reply,
            ServerEvent::Error {
                event: "consume".to_string(),
                code: 1,
                message: "Malformed event".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_event_rejects_non_json() {
        let reply = parse_event("not json").unwrap_err();
        assert!(matches!(reply, ServerEvent::Error { event, .. } if event == "unknown"));
    }
}
