//! # Domain Models
//!
//! | Type | Description |
//! |------|-------------|
//! | [`RawNotice`] | Upstream notice as fetched |
//! | [`Ticker`] | Validated asset ticker |
//! | [`Timestamp`] | UTC instant, millisecond precision |
//! | [`EventId`] | Content hash of one listing observation |
//! | [`ProcessedEvent`] | Accepted, identified listing event |

mod notice;
mod ticker;
mod timestamp;

pub use notice::{EventId, ProcessedEvent, RawNotice};
pub use ticker::{Ticker, MAX_TICKER_LEN, MIN_TICKER_LEN};
pub use timestamp::{offset_from_hours, Timestamp};
