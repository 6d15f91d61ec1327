//! The poll-cycle orchestrator.
//!
//! ```text
//! fetch (structured + markup) -> select -> parse -> watermark check
//!   -> listing filter -> extract tickers
//!   -> per ticker: classify timing -> event id -> cooldown -> dedup insert
//! -> advance watermark over everything considered
//! ```

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use noticewatch_store::{InsertOutcome, Store, Watermark, WatermarkPosition};
use serde::Serialize;
use time::UtcOffset;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::circuit_breaker::CircuitSnapshot;
use crate::config::PipelineConfig;
use crate::domain::{offset_from_hours, EventId, ProcessedEvent, RawNotice, Ticker, Timestamp};
use crate::event_id::EventIdBuilder;
use crate::extract::{Extraction, NoticeExtractor};
use crate::http_client::{HttpClient, HttpRequest};
use crate::latency::{checkpoints, LatencySnapshot, LatencyTracker};
use crate::parse::{parse_markup, parse_structured};
use crate::quantiles::QuantileEstimator;
use crate::rate_limiter::{RateLimitSnapshot, RateLimiter};
use crate::resilient::ResilientHttpClient;
use crate::sink::EventSink;
use crate::stats::{RunStats, StatsSnapshot};
use crate::text_source::{self, CandidateKind, TextCandidate};
use crate::timing::{classify, TimingClass};
use crate::{NoticeError, ValidationError};

/// An event that passed dedup, with its timing class.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcceptedEvent {
    pub event: ProcessedEvent,
    pub timing: TimingClass,
    pub confidence: f64,
    /// Latency flow that tracks this event until it is emitted.
    pub flow_id: String,
}

/// What happened to one notice or one of its tickers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NoticeOutcome {
    Accepted(AcceptedEvent),
    Duplicate { event_id: EventId },
    CooldownSuppressed { base: Ticker, event_id: EventId },
    WatermarkSkipped,
    NotListing,
    NoTicker,
}

impl NoticeOutcome {
    pub fn accepted(&self) -> Option<&AcceptedEvent> {
        match self {
            Self::Accepted(accepted) => Some(accepted),
            _ => None,
        }
    }
}

/// Overrides for controlled replays and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessOptions {
    pub bypass_watermark: bool,
    pub bypass_cooldown: bool,
}

impl ProcessOptions {
    /// Skip both the watermark and the cooldown check.
    pub fn bypass_all() -> Self {
        Self {
            bypass_watermark: true,
            bypass_cooldown: true,
        }
    }
}

/// Result of a maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub events_removed: usize,
    pub bases_removed: usize,
    pub flows_swept: usize,
    pub windows_evicted: usize,
}

/// Everything an external exporter needs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub stats: StatsSnapshot,
    pub latency: LatencySnapshot,
    pub breakers: Vec<CircuitSnapshot>,
    pub rate_limits: Vec<RateLimitSnapshot>,
}

pub struct NoticeClient {
    config: PipelineConfig,
    store: Store,
    http: Arc<ResilientHttpClient>,
    extractor: NoticeExtractor,
    ids: EventIdBuilder,
    link_base: Option<Url>,
    local_offset: UtcOffset,
    latency: Arc<LatencyTracker>,
    stats: Arc<RunStats>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for NoticeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoticeClient")
            .field("poll_source", &self.config.poll_source)
            .field("push_source", &self.config.push_source)
            .field("api_url", &self.config.api_url)
            .finish_non_exhaustive()
    }
}

impl NoticeClient {
    /// Assemble a client from explicit parts.
    pub fn new(
        config: PipelineConfig,
        store: Store,
        http: Arc<ResilientHttpClient>,
        latency: Arc<LatencyTracker>,
        stats: Arc<RunStats>,
    ) -> Result<Self, ValidationError> {
        config.validate()?;
        let ids = EventIdBuilder::new(config.link_base())?;
        let link_base = config.link_base().and_then(|base| Url::parse(base).ok());
        let local_offset = offset_from_hours(config.extraction.local_offset_hours);
        let extractor = NoticeExtractor::new(config.extraction.clone());
        Ok(Self {
            config,
            store,
            http,
            extractor,
            ids,
            link_base,
            local_offset,
            latency,
            stats,
            cancel: CancellationToken::new(),
        })
    }

    /// Build every collaborator from `config` over `transport` with fresh
    /// statistics and latency state.
    pub fn from_config(
        config: PipelineConfig,
        store: Store,
        transport: Arc<dyn HttpClient>,
    ) -> Result<Self, ValidationError> {
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let http = Arc::new(ResilientHttpClient::new(
            transport,
            config.circuit_breaker,
            config.retry.clone(),
            rate_limiter,
        ));
        let estimator = Arc::new(QuantileEstimator::new(config.latency.sample_capacity));
        let latency = Arc::new(LatencyTracker::new(config.latency.clone(), estimator));
        Self::new(config, store, http, latency, Arc::new(RunStats::new()))
    }

    /// Cancel in-flight fetches and backoff sleeps with `token`.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn stats(&self) -> &Arc<RunStats> {
        &self.stats
    }

    pub fn latency(&self) -> &Arc<LatencyTracker> {
        &self.latency
    }

    pub fn http(&self) -> &Arc<ResilientHttpClient> {
        &self.http
    }

    pub fn extractor(&self) -> &NoticeExtractor {
        &self.extractor
    }

    /// Re-arm the poll watermark to `now - grace_window` so downtime is not
    /// replayed. Failure here is fatal to startup.
    pub fn init_watermarks_at_boot(&self, now: Timestamp) -> Result<Watermark, NoticeError> {
        let watermark = self.store.initialize_watermark_at_boot(
            &self.config.poll_source,
            now.as_millis(),
            self.config.grace_window,
        )?;
        Ok(watermark)
    }

    /// Fetch both renderings, process every notice newer than the watermark
    /// and return the events that passed dedup.
    ///
    /// Fetch and decode failures yield an empty batch. Per-notice failures are
    /// logged and counted without aborting the batch.
    pub async fn poll_once(&self, options: ProcessOptions) -> Result<Vec<AcceptedEvent>, NoticeError> {
        self.stats.record_poll();
        let cycle = Uuid::new_v4().to_string();
        self.latency.begin(&cycle);
        let now = Timestamp::now();

        let (structured, markup) = tokio::join!(self.fetch_structured(), self.fetch_markup());
        if self.cancel.is_cancelled() {
            self.latency.finish(&cycle);
            return Err(NoticeError::Cancelled);
        }
        self.latency.mark(&cycle, checkpoints::FETCHED);

        let notices = self.decode(structured, markup);
        self.latency.mark(&cycle, checkpoints::PARSED);
        self.stats.record_notices_seen(notices.len());

        let mut considered = Vec::with_capacity(notices.len());
        let mut accepted = Vec::new();
        for notice in &notices {
            if !options.bypass_watermark {
                match self.store.should_consider(&self.config.poll_source, &notice.position()) {
                    Ok(true) => {}
                    Ok(false) => {
                        self.stats.record_watermark_skip();
                        continue;
                    }
                    Err(error) => {
                        self.stats.record_item_error();
                        tracing::warn!(notice_id = %notice.id, error = %error, "watermark check failed");
                        continue;
                    }
                }
            }
            considered.push(notice.position());

            let outcomes =
                self.process_considered(&self.config.poll_source, notice, options, now, &cycle);
            accepted.extend(outcomes.into_iter().filter_map(|outcome| match outcome {
                NoticeOutcome::Accepted(event) => Some(event),
                _ => None,
            }));
        }

        self.advance_watermark(&self.config.poll_source, &considered, now);
        self.latency.finish(&cycle);

        tracing::info!(
            notices = notices.len(),
            considered = considered.len(),
            accepted = accepted.len(),
            "poll cycle complete"
        );
        Ok(accepted)
    }

    /// Process one externally supplied notice as if it had been polled.
    /// The watermark is checked (unless bypassed) but not advanced.
    pub fn process_notice(
        &self,
        notice: &RawNotice,
        options: ProcessOptions,
    ) -> Result<Vec<NoticeOutcome>, NoticeError> {
        self.process_notice_at(notice, options, Timestamp::now())
    }

    /// [`process_notice`](Self::process_notice) with an explicit `now`.
    pub fn process_notice_at(
        &self,
        notice: &RawNotice,
        options: ProcessOptions,
        now: Timestamp,
    ) -> Result<Vec<NoticeOutcome>, NoticeError> {
        let source = &self.config.poll_source;
        if !options.bypass_watermark && !self.store.should_consider(source, &notice.position())? {
            self.stats.record_watermark_skip();
            return Ok(vec![NoticeOutcome::WatermarkSkipped]);
        }

        let flow = Uuid::new_v4().to_string();
        self.latency.begin(&flow);
        let outcomes = self.process_considered(source, notice, options, now, &flow);
        self.latency.finish(&flow);
        Ok(outcomes)
    }

    /// Handle a push-channel detection of `symbol` (for example `KRW-ABC`).
    ///
    /// Push events carry no article, so they use the ticker-only event id and
    /// are always classified live. Frames are not watermark-gated: replays are
    /// caught by dedup and the cooldown, and `observed_at` is only logged.
    pub fn process_push(
        &self,
        symbol: &str,
        observed_at: Option<Timestamp>,
        options: ProcessOptions,
    ) -> Result<NoticeOutcome, NoticeError> {
        self.process_push_at(symbol, observed_at, options, Timestamp::now())
    }

    /// [`process_push`](Self::process_push) with an explicit `now`.
    pub fn process_push_at(
        &self,
        symbol: &str,
        observed_at: Option<Timestamp>,
        options: ProcessOptions,
        now: Timestamp,
    ) -> Result<NoticeOutcome, NoticeError> {
        self.stats.record_push_received();
        let source = self.config.push_source.as_str();

        let base = Ticker::from_pair_symbol(symbol, &self.config.extraction.market_codes)?;
        if self.extractor.is_denied(&base) {
            return Err(ValidationError::DeniedTicker {
                value: base.as_str().to_owned(),
            }
            .into());
        }

        tracing::debug!(
            base = %base,
            observed_at = observed_at.map(Timestamp::as_millis),
            "push detection"
        );

        let flow = Uuid::new_v4().to_string();
        self.latency.begin(&flow);
        let markets = [self.config.extraction.default_market.clone()];
        let event = self
            .ids
            .push_event(source, &base, &markets, &format!("push:{}", symbol.trim()));
        let outcome = self.admit(event, TimingClass::Live, 1.0, options, now, &flow);
        if !matches!(outcome, Ok(NoticeOutcome::Accepted(_))) {
            self.latency.finish(&flow);
        }
        outcome
    }

    /// Hand `events` to `sink`, then close their latency flows.
    pub async fn deliver(&self, sink: &dyn EventSink, events: &[AcceptedEvent]) -> Result<(), NoticeError> {
        if events.is_empty() {
            return Ok(());
        }
        sink.deliver(events).await?;
        for accepted in events {
            self.latency.mark(&accepted.flow_id, checkpoints::EMITTED);
        }
        Ok(())
    }

    /// Retention cleanup and in-memory eviction. Off the hot path.
    pub fn run_maintenance(&self, now: Timestamp) -> Result<MaintenanceReport, NoticeError> {
        let cleanup = self
            .store
            .cleanup_older_than(self.config.retention, now.as_millis())?;
        let flows_swept = self.latency.sweep(Instant::now());
        let windows_evicted = self.http.rate_limiter().evict_idle(self.config.rate_limit_idle);
        let report = MaintenanceReport {
            events_removed: cleanup.events_removed,
            bases_removed: cleanup.bases_removed,
            flows_swept,
            windows_evicted,
        };
        tracing::debug!(?report, "maintenance complete");
        Ok(report)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            stats: self.stats.snapshot(),
            latency: self.latency.snapshot(),
            breakers: self.http.breaker_snapshots(),
            rate_limits: self.http.rate_limiter().snapshots(),
        }
    }

    async fn fetch_structured(&self) -> Option<TextCandidate> {
        let url = self.config.api_url.trim();
        if url.is_empty() {
            return None;
        }
        let request = self.request(url).with_header("accept", "application/json");
        match self.http.get(request, &self.cancel).await {
            Ok(response) => Some(TextCandidate::structured(response.body, response.charset)),
            Err(error) => {
                self.record_fetch_failure("structured", &error);
                None
            }
        }
    }

    async fn fetch_markup(&self) -> Option<TextCandidate> {
        let url = self.config.board_url.as_deref()?.trim();
        let request = self.request(url).with_header("accept", "text/html");
        match self.http.get(request, &self.cancel).await {
            Ok(response) => Some(TextCandidate::markup(response.body, response.charset)),
            Err(error) => {
                self.record_fetch_failure("markup", &error);
                None
            }
        }
    }

    fn request(&self, url: &str) -> HttpRequest {
        let timeout_ms = u64::try_from(self.config.request_timeout.as_millis()).unwrap_or(u64::MAX);
        HttpRequest::get(url).with_timeout_ms(timeout_ms)
    }

    fn record_fetch_failure(&self, rendering: &str, error: &NoticeError) {
        if matches!(error, NoticeError::Cancelled) {
            return;
        }
        self.stats.record_fetch_failure();
        tracing::warn!(rendering, error = %error, "notice fetch failed");
    }

    /// Select the better rendering and parse it, falling back to the other one
    /// when the winner does not decode.
    fn decode(&self, structured: Option<TextCandidate>, markup: Option<TextCandidate>) -> Vec<RawNotice> {
        let Some(selection) = text_source::select(structured, markup, self.config.extraction.expected_script)
        else {
            tracing::debug!("nothing fetched this cycle");
            return Vec::new();
        };

        let winner_kind = selection.winner.kind;
        match self.parse_candidate(&selection.winner) {
            Ok(notices) => return notices,
            Err(error) => {
                tracing::warn!(rendering = ?winner_kind, error = %error, "selected rendering did not decode");
            }
        }

        let Some(runner_up) = selection.runner_up else {
            return Vec::new();
        };
        match self.parse_candidate(&runner_up) {
            Ok(notices) => notices,
            Err(error) => {
                tracing::warn!(rendering = ?runner_up.kind, error = %error, "fallback rendering did not decode");
                Vec::new()
            }
        }
    }

    fn parse_candidate(&self, candidate: &TextCandidate) -> Result<Vec<RawNotice>, NoticeError> {
        match candidate.kind {
            CandidateKind::Structured => parse_structured(&candidate.text, self.local_offset),
            CandidateKind::Markup => parse_markup(&candidate.text, self.link_base.as_ref(), self.local_offset),
        }
    }

    /// Listing filter, extraction and per-ticker admission for a notice that
    /// already passed the watermark.
    fn process_considered(
        &self,
        source: &str,
        notice: &RawNotice,
        options: ProcessOptions,
        now: Timestamp,
        flow: &str,
    ) -> Vec<NoticeOutcome> {
        if !self.extractor.is_listing(notice) {
            self.stats.record_non_listing();
            tracing::debug!(notice_id = %notice.id, "not a listing notice");
            return vec![NoticeOutcome::NotListing];
        }

        let extraction = self.extractor.extract(notice);
        if extraction.tickers.is_empty() {
            self.stats.record_no_ticker();
            tracing::debug!(notice_id = %notice.id, "listing notice without a ticker");
            return vec![NoticeOutcome::NoTicker];
        }

        let link = notice_link(notice);
        if matches!(link, Cow::Owned(_)) {
            tracing::warn!(notice_id = %notice.id, link = %link, "notice has no link, using its id path");
        }

        let mut outcomes = Vec::with_capacity(extraction.tickers.len());
        for base in &extraction.tickers {
            match self.process_ticker(source, notice, &link, &extraction, base, options, now, flow) {
                Ok(outcome) => outcomes.push(outcome),
                Err(error) => {
                    self.stats.record_item_error();
                    tracing::warn!(
                        notice_id = %notice.id,
                        base = %base,
                        error = %error,
                        "failed to process ticker"
                    );
                }
            }
        }
        outcomes
    }

    #[allow(clippy::too_many_arguments)]
    fn process_ticker(
        &self,
        source: &str,
        notice: &RawNotice,
        link: &str,
        extraction: &Extraction,
        base: &Ticker,
        options: ProcessOptions,
        now: Timestamp,
        flow: &str,
    ) -> Result<NoticeOutcome, NoticeError> {
        let timing = classify(extraction.trade_time, now, self.config.live_window);
        let event = self.ids.article_event(
            source,
            base,
            link,
            &extraction.markets,
            extraction.trade_time,
            &notice.title,
        )?;
        let child = format!("{flow}:{}", event.event_id);
        self.latency.fork(flow, &child);
        let outcome = self.admit(event, timing, extraction.confidence, options, now, &child);
        if !matches!(outcome, Ok(NoticeOutcome::Accepted(_))) {
            self.latency.finish(&child);
        }
        outcome
    }

    /// Cooldown check, dedup insert and counters for one identified event.
    fn admit(
        &self,
        event: ProcessedEvent,
        timing: TimingClass,
        confidence: f64,
        options: ProcessOptions,
        now: Timestamp,
        flow: &str,
    ) -> Result<NoticeOutcome, NoticeError> {
        let base = event.base.as_str();
        if !options.bypass_cooldown
            && self
                .store
                .is_base_recently_traded(base, self.config.cooldown, now.as_millis())?
        {
            self.stats.record_cooldown_suppressed();
            tracing::info!(base, event_id = %event.event_id, "suppressed by cross-source cooldown");
            return Ok(NoticeOutcome::CooldownSuppressed {
                base: event.base,
                event_id: event.event_id,
            });
        }

        match self.store.try_mark_processed(&event.to_record(now))? {
            InsertOutcome::Duplicate => {
                self.stats.record_duplicate();
                tracing::debug!(event_id = %event.event_id, base, "duplicate event");
                Ok(NoticeOutcome::Duplicate {
                    event_id: event.event_id,
                })
            }
            InsertOutcome::Inserted => {
                self.stats.record_inserted(timing);
                self.latency.mark(flow, checkpoints::DEDUPED);
                if timing == TimingClass::Live {
                    self.store
                        .mark_base_as_traded(base, event.event_id.as_str(), now.as_millis())?;
                }
                tracing::info!(
                    event_id = %event.event_id,
                    source = %event.source,
                    base,
                    timing = ?timing,
                    confidence,
                    "accepted listing event"
                );
                Ok(NoticeOutcome::Accepted(AcceptedEvent {
                    event,
                    timing,
                    confidence,
                    flow_id: flow.to_owned(),
                }))
            }
        }
    }

    fn advance_watermark(&self, source: &str, considered: &[WatermarkPosition], now: Timestamp) {
        if considered.is_empty() {
            return;
        }
        if let Err(error) = self
            .store
            .update_watermark_from_batch(source, considered, now.as_millis())
        {
            tracing::error!(source, error = %error, "failed to advance watermark");
        }
    }
}

/// Article link for `notice`. A notice published without one gets a path
/// derived from its id, resolved against the link base like any relative link.
fn notice_link(notice: &RawNotice) -> Cow<'_, str> {
    if notice.url.trim().is_empty() {
        Cow::Owned(format!("notice/{}", notice.id.trim()))
    } else {
        Cow::Borrowed(notice.url.as_str())
    }
}

/// Delay before the first poll so that a freshly booted process does not
/// hammer the upstream in lockstep with its peers.
pub fn startup_jitter(poll_interval: Duration) -> Duration {
    let max_ms = u64::try_from(poll_interval.as_millis() / 2).unwrap_or(u64::MAX);
    Duration::from_millis(fastrand::u64(0..=max_ms))
}
