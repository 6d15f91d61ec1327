//! Live / future / stale classification of a listing's trade start.

use std::time::Duration;

use serde::Serialize;

use crate::domain::Timestamp;

pub const DEFAULT_LIVE_WINDOW: Duration = Duration::from_secs(120);

/// Where a listing's trade start sits relative to now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingClass {
    /// Trading already started within the live window, or the start is unknown.
    Live,
    /// Trading starts later.
    Future,
    /// Trading started longer ago than the live window.
    Stale,
}

/// Classify `trade_start` against `now`.
///
/// Unknown start times are treated as live. Pure: the same inputs always give
/// the same class.
pub fn classify(trade_start: Option<Timestamp>, now: Timestamp, live_window: Duration) -> TimingClass {
    let Some(trade_start) = trade_start else {
        return TimingClass::Live;
    };

    let delta = trade_start.millis_since(now);
    if delta > 0 {
        return TimingClass::Future;
    }

    let window_ms = i64::try_from(live_window.as_millis()).unwrap_or(i64::MAX);
    if delta.unsigned_abs() <= window_ms.unsigned_abs() {
        TimingClass::Live
    } else {
        TimingClass::Stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: Timestamp = Timestamp::from_millis(1_700_000_000_000);

    fn at_offset(offset_ms: i64) -> Option<Timestamp> {
        Some(Timestamp::from_millis(NOW.as_millis() + offset_ms))
    }

    #[test]
    fn unknown_start_is_live() {
        assert_eq!(classify(None, NOW, DEFAULT_LIVE_WINDOW), TimingClass::Live);
    }

    #[test]
    fn any_positive_delta_is_future() {
        assert_eq!(classify(at_offset(1), NOW, DEFAULT_LIVE_WINDOW), TimingClass::Future);
        assert_eq!(
            classify(at_offset(86_400_000), NOW, DEFAULT_LIVE_WINDOW),
            TimingClass::Future
        );
    }

    #[test]
    fn window_edges() {
        assert_eq!(classify(at_offset(0), NOW, DEFAULT_LIVE_WINDOW), TimingClass::Live);
        assert_eq!(
            classify(at_offset(-119_999), NOW, DEFAULT_LIVE_WINDOW),
            TimingClass::Live
        );
        assert_eq!(
            classify(at_offset(-120_000), NOW, DEFAULT_LIVE_WINDOW),
            TimingClass::Live
        );
        assert_eq!(
            classify(at_offset(-120_001), NOW, DEFAULT_LIVE_WINDOW),
            TimingClass::Stale
        );
    }
}
