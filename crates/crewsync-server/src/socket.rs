//! One push-channel socket: registration handshake, then a reader loop
//! routing client events through the hub and a writer task draining the
//! connection's queue.

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crewsync_shared::{ClientEvent, ServerEvent};

use crate::api::AppState;
use crate::auth::Identity;

type Sink = SplitSink<WebSocket, Message>;

/// Drive a socket until either side closes it. `expected` is the identity
/// bound to the bearer, `None` when the hub runs open.
pub async fn serve_socket(state: AppState, socket: WebSocket, expected: Option<Identity>) {
    let (mut sink, mut stream) = socket.split();

    let first = tokio::time::timeout(state.config.registration_timeout, next_event(&mut stream)).await;
    let identity = match first {
        Ok(Some(ClientEvent::RegisterIdentity {
            user_id,
            company_id,
        })) => Identity {
            user_id,
            company_id,
        },
        Ok(Some(other)) => {
            reject(&mut sink, &format!("expected register-identity, got {}", other.name())).await;
            return;
        }
        Ok(None) => {
            debug!("Socket closed before registration");
            return;
        }
        Err(_) => {
            debug!("Registration timed out");
            reject(&mut sink, "registration timed out").await;
            return;
        }
    };

    if let Some(expected) = &expected {
        if *expected != identity {
            warn!(
                claimed = %identity.user_id,
                bearer = %expected.user_id,
                "Registration does not match credential"
            );
            reject(&mut sink, "identity does not match credential").await;
            return;
        }
    }

    // Registered in the hub before acknowledging, so anything published
    // after the client sees `registered` reaches it. Events routed in the
    // meantime wait in the queue behind the acknowledgment.
    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = state.hub.register(identity.clone(), tx);

    let registered = ServerEvent::Registered {
        user_id: identity.user_id.clone(),
    };
    if send_event(&mut sink, &registered).await.is_err() {
        state.hub.unregister(conn);
        return;
    }

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if send_event(&mut sink, &event).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(event) = next_event(&mut stream).await {
        if !state.throttle.admit(&identity.user_id, &event) {
            warn!(user = %identity.user_id, event = event.name(), "Client event throttled");
            continue;
        }
        state.hub.handle(conn, event);
    }

    state.hub.unregister(conn);
    writer.abort();
}

/// Next decodable client event; `None` once the socket is closed.
async fn next_event(stream: &mut SplitStream<WebSocket>) -> Option<ClientEvent> {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match ClientEvent::from_frame(&text) {
                Ok(event) => return Some(event),
                Err(e) => debug!(error = %e, "Undecodable client frame dropped"),
            },
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(e) => {
                debug!(error = %e, "Socket read failed");
                return None;
            }
        }
    }
    None
}

async fn send_event(sink: &mut Sink, event: &ServerEvent) -> Result<(), axum::Error> {
    match event.to_frame() {
        Ok(frame) => sink.send(Message::Text(frame)).await,
        Err(e) => {
            warn!(error = %e, "Unencodable server event dropped");
            Ok(())
        }
    }
}

async fn reject(sink: &mut Sink, reason: &str) {
    let rejected = ServerEvent::AuthRejected {
        reason: reason.to_string(),
    };
    let _ = send_event(sink, &rejected).await;
    let _ = sink.close().await;
}
