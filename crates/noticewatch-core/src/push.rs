//! Push-channel listener.
//!
//! Keeps a websocket open to the push endpoint and runs every `{symbol, ...}`
//! frame through [`NoticeClient::process_push`], reconnecting with backoff.

use std::sync::Arc;

use futures_util::StreamExt;
use serde::Deserialize;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::domain::Timestamp;
use crate::notice_client::{NoticeClient, NoticeOutcome, ProcessOptions};
use crate::resilient::destination_of;
use crate::retry::{sleep_or_cancel, Backoff};
use crate::sink::EventSink;
use crate::NoticeError;

/// A decoded push frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushFrame {
    pub symbol: String,
    pub observed_at: Option<Timestamp>,
}

#[derive(Debug, Deserialize)]
struct WirePushFrame {
    #[serde(default, alias = "code", alias = "ticker")]
    symbol: Option<String>,
    #[serde(default, alias = "ts")]
    timestamp: Option<i64>,
}

/// Decode a text frame. Frames without a symbol (heartbeats, acks) are `None`.
pub fn decode_push_frame(text: &str) -> Result<Option<PushFrame>, NoticeError> {
    let wire: WirePushFrame = serde_json::from_str(text)
        .map_err(|e| NoticeError::decode("push", format!("failed to parse push frame: {e}")))?;
    Ok(wire
        .symbol
        .map(|symbol| symbol.trim().to_owned())
        .filter(|symbol| !symbol.is_empty())
        .map(|symbol| PushFrame {
            symbol,
            observed_at: wire.timestamp.map(Timestamp::from_epoch_number),
        }))
}

pub struct PushListener {
    client: Arc<NoticeClient>,
    sink: Arc<dyn EventSink>,
    url: String,
    reconnect: Backoff,
}

impl PushListener {
    pub fn new(client: Arc<NoticeClient>, sink: Arc<dyn EventSink>, url: impl Into<String>) -> Self {
        Self {
            client,
            sink,
            url: url.into(),
            reconnect: Backoff::default(),
        }
    }

    pub fn with_reconnect_backoff(mut self, reconnect: Backoff) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Listen until `shutdown` fires, reconnecting after every disconnect.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut attempt = 0_u32;
        loop {
            let result = tokio::select! {
                () = shutdown.cancelled() => return,
                result = self.connect_and_stream(&shutdown) => result,
            };

            match result {
                Ok(frames) => {
                    if shutdown.is_cancelled() {
                        return;
                    }
                    if frames > 0 {
                        attempt = 0;
                    }
                    tracing::warn!(url = %self.url, frames, "push stream ended");
                }
                Err(NoticeError::Cancelled) => return,
                Err(error) => {
                    tracing::warn!(url = %self.url, error = %error, "push connection failed");
                }
            }

            let delay = self.reconnect.delay(attempt);
            attempt = attempt.saturating_add(1);
            tracing::info!(delay_ms = delay.as_millis() as u64, attempt, "reconnecting push channel");
            if sleep_or_cancel(delay, &shutdown).await.is_err() {
                return;
            }
        }
    }

    /// One connection lifetime. Returns the number of text frames handled.
    async fn connect_and_stream(&self, shutdown: &CancellationToken) -> Result<u64, NoticeError> {
        let destination = destination_of(&self.url);
        let limiter = self.client.http().rate_limiter();
        let (stream, _) = limiter
            .run(&destination, shutdown, || async {
                tokio_tungstenite::connect_async(self.url.as_str())
                    .await
                    .map_err(|e| NoticeError::network(&destination, e.to_string()))
            })
            .await?;
        tracing::info!(url = %self.url, "push channel connected");

        let (_, mut read) = stream.split();
        let mut frames = 0_u64;
        while let Some(message) = read.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    frames += 1;
                    self.handle_text(&text).await;
                }
                Ok(Message::Close(frame)) => {
                    let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                    tracing::info!(reason = %reason, "push channel closed by peer");
                    return Ok(frames);
                }
                Ok(_) => {}
                Err(error) => return Err(NoticeError::network(&destination, error.to_string())),
            }
        }
        Ok(frames)
    }

    async fn handle_text(&self, text: &str) {
        let frame = match decode_push_frame(text) {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(error) => {
                self.client.stats().record_item_error();
                tracing::warn!(error = %error, "undecodable push frame");
                return;
            }
        };

        let outcome = self
            .client
            .process_push(&frame.symbol, frame.observed_at, ProcessOptions::default());
        match outcome {
            Ok(NoticeOutcome::Accepted(accepted)) => {
                if let Err(error) = self.client.deliver(self.sink.as_ref(), &[accepted]).await {
                    tracing::error!(error = %error, "failed to deliver push event");
                }
            }
            Ok(other) => tracing::debug!(symbol = %frame.symbol, outcome = ?other, "push frame not accepted"),
            Err(error) => {
                self.client.stats().record_item_error();
                tracing::warn!(symbol = %frame.symbol, error = %error, "failed to process push frame");
            }
        }
    }
}
