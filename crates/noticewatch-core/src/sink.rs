use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;

use crate::notice_client::AcceptedEvent;
use crate::NoticeError;

/// Downstream consumer of accepted events. Trading and alerting decisions
/// live behind this trait.
pub trait EventSink: Send + Sync {
    fn deliver<'a>(
        &'a self,
        events: &'a [AcceptedEvent],
    ) -> Pin<Box<dyn Future<Output = Result<(), NoticeError>> + Send + 'a>>;
}

/// Sink forwarding each event into a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<AcceptedEvent>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::Sender<AcceptedEvent>) -> Self {
        Self { sender }
    }

    /// Sink plus the receiving end of a channel holding `capacity` events.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<AcceptedEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self::new(sender), receiver)
    }
}

impl EventSink for ChannelSink {
    fn deliver<'a>(
        &'a self,
        events: &'a [AcceptedEvent],
    ) -> Pin<Box<dyn Future<Output = Result<(), NoticeError>> + Send + 'a>> {
        Box::pin(async move {
            for event in events {
                self.sender
                    .send(event.clone())
                    .await
                    .map_err(|_| NoticeError::SinkClosed)?;
            }
            Ok(())
        })
    }
}

/// Sink that only logs, for runs without a downstream consumer.
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn deliver<'a>(
        &'a self,
        events: &'a [AcceptedEvent],
    ) -> Pin<Box<dyn Future<Output = Result<(), NoticeError>> + Send + 'a>> {
        Box::pin(async move {
            for accepted in events {
                tracing::info!(
                    event_id = %accepted.event.event_id,
                    base = %accepted.event.base,
                    timing = ?accepted.timing,
                    "listing event"
                );
            }
            Ok(())
        })
    }
}
