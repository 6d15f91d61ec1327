use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::timing::TimingClass;

/// Run counters for one pipeline. Shared by `Arc`, never global.
#[derive(Debug, Default)]
pub struct RunStats {
    polls: AtomicU64,
    fetch_failures: AtomicU64,
    notices_seen: AtomicU64,
    watermark_skipped: AtomicU64,
    non_listing: AtomicU64,
    no_ticker: AtomicU64,
    new: AtomicU64,
    future: AtomicU64,
    stale: AtomicU64,
    duplicate: AtomicU64,
    cooldown_suppressed: AtomicU64,
    item_errors: AtomicU64,
    push_received: AtomicU64,
}

/// Serializable copy of [`RunStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub polls: u64,
    pub fetch_failures: u64,
    pub notices_seen: u64,
    pub watermark_skipped: u64,
    pub non_listing: u64,
    pub no_ticker: u64,
    pub new: u64,
    pub future: u64,
    pub stale: u64,
    pub duplicate: u64,
    pub cooldown_suppressed: u64,
    pub item_errors: u64,
    pub push_received: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_poll(&self) {
        bump(&self.polls);
    }

    pub fn record_fetch_failure(&self) {
        bump(&self.fetch_failures);
    }

    pub fn record_notices_seen(&self, count: usize) {
        self.notices_seen.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_watermark_skip(&self) {
        bump(&self.watermark_skipped);
    }

    pub fn record_non_listing(&self) {
        bump(&self.non_listing);
    }

    pub fn record_no_ticker(&self) {
        bump(&self.no_ticker);
    }

    /// Exactly one of `new`, `future` or `stale` per inserted event.
    pub fn record_inserted(&self, timing: TimingClass) {
        match timing {
            TimingClass::Live => bump(&self.new),
            TimingClass::Future => bump(&self.future),
            TimingClass::Stale => bump(&self.stale),
        }
    }

    pub fn record_duplicate(&self) {
        bump(&self.duplicate);
    }

    pub fn record_cooldown_suppressed(&self) {
        bump(&self.cooldown_suppressed);
    }

    pub fn record_item_error(&self) {
        bump(&self.item_errors);
    }

    pub fn record_push_received(&self) {
        bump(&self.push_received);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            polls: load(&self.polls),
            fetch_failures: load(&self.fetch_failures),
            notices_seen: load(&self.notices_seen),
            watermark_skipped: load(&self.watermark_skipped),
            non_listing: load(&self.non_listing),
            no_ticker: load(&self.no_ticker),
            new: load(&self.new),
            future: load(&self.future),
            stale: load(&self.stale),
            duplicate: load(&self.duplicate),
            cooldown_suppressed: load(&self.cooldown_suppressed),
            item_errors: load(&self.item_errors),
            push_received: load(&self.push_received),
        }
    }
}
