use std::fmt::{Display, Formatter};

use noticewatch_store::{EventRecord, WatermarkPosition};
use serde::Serialize;

use super::{Ticker, Timestamp};

/// One upstream notice as fetched. Never persisted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawNotice {
    pub id: String,
    pub title: String,
    pub content: String,
    pub categories: Vec<String>,
    pub url: String,
    pub published_at: Timestamp,
}

impl RawNotice {
    /// Watermark ordering key for this notice.
    pub fn position(&self) -> WatermarkPosition {
        WatermarkPosition::new(self.published_at.as_millis(), self.id.clone())
    }
}

/// 64-character lowercase hex content hash identifying one listing observation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub(crate) fn from_digest_hex(hex: String) -> Self {
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for EventId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A uniquely identified listing event ready for downstream consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessedEvent {
    pub event_id: EventId,
    pub source: String,
    pub base: Ticker,
    pub url: String,
    pub markets: Vec<String>,
    pub trade_time_utc: Option<Timestamp>,
    pub raw_title: String,
}

impl ProcessedEvent {
    /// Persisted form, stamped with `created_at`.
    pub fn to_record(&self, created_at: Timestamp) -> EventRecord {
        EventRecord {
            event_id: self.event_id.as_str().to_owned(),
            source: self.source.clone(),
            base: self.base.as_str().to_owned(),
            url: self.url.clone(),
            markets: self.markets.clone(),
            trade_time_utc: self.trade_time_utc.map(Timestamp::to_iso_string),
            raw_title: self.raw_title.clone(),
            created_at: created_at.as_millis(),
        }
    }
}
