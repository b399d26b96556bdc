//! WebSocket connector for the push hub.
//!
//! The bearer credential travels in the `Authorization` header of the
//! upgrade request; a 401/403 answer to the upgrade is reported as
//! `AuthRejected`.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crewsync_shared::Credential;

use crate::error::TransportError;
use crate::link::{Connector, Link};

pub struct WsConnector {
    url: String,
}

impl WsConnector {
    /// `url` is the hub endpoint, e.g. `wss://push.example.com/ws`.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, credential: &Credential) -> Result<Box<dyn Link>, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Unreachable(format!("Invalid push URL: {e}")))?;

        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.token))
            .map_err(|_| TransportError::AuthRejected("credential is not a valid header".into()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        debug!(url = %self.url, user = %credential.user_id, "Opening push link");

        match connect_async(request).await {
            Ok((stream, _response)) => {
                info!(url = %self.url, "Push link open");
                Ok(Box::new(WsLink { stream }))
            }
            Err(WsError::Http(response))
                if response.status() == StatusCode::UNAUTHORIZED
                    || response.status() == StatusCode::FORBIDDEN =>
            {
                Err(TransportError::AuthRejected(format!(
                    "hub answered {}",
                    response.status()
                )))
            }
            Err(e) => Err(TransportError::Unreachable(e.to_string())),
        }
    }
}

struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Link for WsLink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(frame))
            .await
            .map_err(|e| TransportError::Link(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Close(frame)) => {
                    debug!(frame = ?frame, "Hub closed the push link");
                    return None;
                }
                // Pings are answered by tungstenite itself
                Ok(_) => continue,
                Err(e) => return Some(Err(TransportError::Link(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "Push link already closed");
        }
    }
}
