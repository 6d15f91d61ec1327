//! Interval-driven poll loop with periodic maintenance.

use std::sync::Arc;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::domain::Timestamp;
use crate::notice_client::{startup_jitter, NoticeClient, ProcessOptions};
use crate::retry::sleep_or_cancel;
use crate::sink::EventSink;
use crate::NoticeError;

pub struct Poller {
    client: Arc<NoticeClient>,
    sink: Arc<dyn EventSink>,
    jitter_start: bool,
}

impl Poller {
    pub fn new(client: Arc<NoticeClient>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            client,
            sink,
            jitter_start: true,
        }
    }

    /// Start polling immediately instead of after a random startup delay.
    pub fn without_startup_jitter(mut self) -> Self {
        self.jitter_start = false;
        self
    }

    /// Poll and deliver until `shutdown` fires.
    ///
    /// Boot re-arms the poll watermark. A failed cycle is logged and the loop
    /// carries on; only a closed sink ends the run early.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), NoticeError> {
        let config = self.client.config();
        self.client.init_watermarks_at_boot(Timestamp::now())?;

        if self.jitter_start {
            let delay = startup_jitter(config.poll_interval);
            tracing::debug!(delay_ms = delay.as_millis() as u64, "startup jitter");
            if sleep_or_cancel(delay, &shutdown).await.is_err() {
                return Ok(());
            }
        }

        let mut poll = time::interval(config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut maintenance = time::interval(config.maintenance_interval);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Skip);
        maintenance.tick().await;

        tracing::info!(
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            source = %config.poll_source,
            "poller started"
        );

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = poll.tick() => {
                    if let Err(NoticeError::SinkClosed) = self.cycle(&shutdown).await {
                        tracing::error!("event sink closed, stopping poller");
                        return Err(NoticeError::SinkClosed);
                    }
                }
                _ = maintenance.tick() => {
                    if let Err(error) = self.client.run_maintenance(Timestamp::now()) {
                        tracing::warn!(error = %error, "maintenance failed");
                    }
                }
            }
        }

        tracing::info!(stats = ?self.client.stats().snapshot(), "poller stopped");
        Ok(())
    }

    async fn cycle(&self, shutdown: &CancellationToken) -> Result<(), NoticeError> {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            result = self.client.poll_once(ProcessOptions::default()) => result,
        };
        match accepted {
            Ok(events) => self.client.deliver(self.sink.as_ref(), &events).await,
            Err(NoticeError::Cancelled) => Ok(()),
            Err(error) => {
                tracing::warn!(error = %error, "poll cycle failed");
                Ok(())
            }
        }
    }
}
