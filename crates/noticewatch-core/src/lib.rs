//! Core pipeline for noticewatch.
//!
//! This crate contains:
//! - Domain models and validation (tickers, timestamps, notices)
//! - Notice parsing, text-source selection and ticker extraction
//! - Deterministic event ids and trade-time classification
//! - Resilient HTTP (circuit breaker, rate limiter, retry)
//! - The poll orchestrator, push listener and downstream sinks
//! - Latency tracking, run counters and logging setup
//!
//! Persisted state (watermarks, dedup, cooldown) lives in `noticewatch-store`.

pub mod circuit_breaker;
pub mod config;
pub mod domain;
pub mod error;
pub mod event_id;
pub mod extract;
pub mod http_client;
pub mod latency;
pub mod logging;
pub mod notice_client;
pub mod parse;
pub mod poller;
pub mod push;
pub mod quantiles;
pub mod rate_limiter;
pub mod resilient;
pub mod retry;
pub mod sink;
pub mod stats;
pub mod text_source;
pub mod timing;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use config::PipelineConfig;
pub use domain::{offset_from_hours, EventId, ProcessedEvent, RawNotice, Ticker, Timestamp};
pub use error::{NoticeError, ValidationError};
pub use event_id::EventIdBuilder;
pub use extract::{Extraction, ExtractionConfig, NoticeExtractor};
pub use http_client::{HttpClient, HttpError, HttpRequest, HttpResponse, NoopHttpClient, ReqwestHttpClient};
pub use latency::{LatencyConfig, LatencySnapshot, LatencyTracker, StageSpec};
pub use logging::LoggingConfig;
pub use noticewatch_store::{Store, StoreConfig, StoreError, Watermark, WatermarkPosition};
pub use notice_client::{
    AcceptedEvent, MaintenanceReport, MetricsSnapshot, NoticeClient, NoticeOutcome, ProcessOptions,
};
pub use poller::Poller;
pub use push::{decode_push_frame, PushFrame, PushListener};
pub use quantiles::{QuantileEstimator, QuantileSummary};
pub use rate_limiter::{RateLimitConfig, RateLimitSnapshot, RateLimiter};
pub use resilient::ResilientHttpClient;
pub use retry::{Backoff, RetryConfig};
pub use sink::{ChannelSink, EventSink, LogSink};
pub use stats::{RunStats, StatsSnapshot};
pub use text_source::{CandidateKind, ExpectedScript, Selection, TextCandidate};
pub use timing::{classify, TimingClass};
