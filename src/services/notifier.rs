use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use crate::services::progress::{ProgressStore, snapshot};
use crate::services::session::SessionToken;

/// Pushes a session's progress record to a websocket client on a fixed
/// interval until the client goes away.
///
/// The connection is not closed when the batch completes; the client decides
/// when it has seen enough.
pub struct ProgressNotifier {
    store: Arc<dyn ProgressStore>,
    interval: Duration,
}

impl ProgressNotifier {
    pub fn new(store: Arc<dyn ProgressStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    pub async fn serve(&self, socket: WebSocket, session: SessionToken) {
        tracing::info!(session = %session, "🔌 Status socket connected");
        let (mut sink, stream) = socket.split();

        tokio::select! {
            _ = self.push_loop(session.as_str(), &mut sink) => {}
            _ = drain_inbound(stream, &session) => {}
        }

        let _ = sink.close().await;
        tracing::info!(session = %session, "Status socket closed");
    }

    /// Returns once a push fails, which means the client disconnected.
    pub async fn push_loop<S>(&self, session: &str, sink: &mut S)
    where
        S: Sink<Message> + Unpin,
        S::Error: Display,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let snap = match snapshot(self.store.as_ref(), session).await {
                Ok(snap) => snap,
                Err(e) => {
                    tracing::warn!(session, "Failed to read progress: {:?}", e);
                    continue;
                }
            };
            let payload = match serde_json::to_string(&snap) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!(session, "Failed to encode progress: {}", e);
                    continue;
                }
            };

            if let Err(e) = sink.send(Message::Text(payload)).await {
                tracing::debug!(session, "Status push failed: {}", e);
                break;
            }
        }
    }
}

/// Logs whatever the client sends; inbound messages never change server
/// state. Returns when the client closes the connection.
pub async fn drain_inbound<St, E>(mut stream: St, session: &SessionToken)
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                tracing::info!(session = %session, "Client sent: {}", text);
            }
            Ok(Message::Binary(data)) => {
                tracing::info!(session = %session, "Client sent {} binary bytes", data.len());
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(session = %session, "Status socket receive error: {}", e);
                break;
            }
        }
    }
}
