//! Dedup records for accepted events and the cross-source cooldown index.

use std::time::Duration;

use ::duckdb::{params, ToSql};
use serde::Serialize;

use crate::{format_utc_millis, parse_utc_millis, Store, StoreError};

const EVENT_ID_LEN: usize = 64;

/// Persisted form of an accepted event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventRecord {
    pub event_id: String,
    pub source: String,
    pub base: String,
    pub url: String,
    pub markets: Vec<String>,
    pub trade_time_utc: Option<String>,
    pub raw_title: String,
    pub created_at: i64,
}

/// Result of an insert-if-absent write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// Last action taken on a base ticker, from any source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BaseCooldown {
    pub base: String,
    pub last_acted_at: String,
    pub last_event_id: String,
}

/// Rows removed by a retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub events_removed: usize,
    pub bases_removed: usize,
}

impl Store {
    /// Record `record` unless its event id is already present.
    ///
    /// A second write with the same id reports [`InsertOutcome::Duplicate`]
    /// instead of failing.
    pub fn try_mark_processed(&self, record: &EventRecord) -> Result<InsertOutcome, StoreError> {
        validate_record(record)?;
        let markets = serde_json::to_string(&record.markets)?;

        let _guard = self.write_guard();
        let connection = self.connection()?;
        let params: [&dyn ToSql; 8] = [
            &record.event_id,
            &record.source,
            &record.base,
            &record.url,
            &markets,
            &record.trade_time_utc,
            &record.raw_title,
            &record.created_at,
        ];
        let inserted = connection.execute(
            "INSERT OR IGNORE INTO processed_events \
             (event_id, source, base, url, markets, trade_time_utc, raw_title, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params.as_slice(),
        )?;

        if inserted == 0 {
            Ok(InsertOutcome::Duplicate)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    /// Look up a stored event by id.
    pub fn event(&self, event_id: &str) -> Result<Option<EventRecord>, StoreError> {
        let connection = self.connection()?;
        let mut statement = connection.prepare(
            "SELECT event_id, source, base, url, markets, trade_time_utc, raw_title, created_at \
             FROM processed_events WHERE event_id = ?",
        )?;
        let mut rows = statement.query_map(params![event_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, i64>(7)?,
            ))
        })?;

        let Some(row) = rows.next().transpose()? else {
            return Ok(None);
        };
        let (event_id, source, base, url, markets, trade_time_utc, raw_title, created_at) = row;
        Ok(Some(EventRecord {
            event_id,
            source,
            base,
            url,
            markets: serde_json::from_str(&markets)?,
            trade_time_utc,
            raw_title,
            created_at,
        }))
    }

    /// Number of stored events.
    pub fn event_count(&self) -> Result<usize, StoreError> {
        let connection = self.connection()?;
        let count: i64 =
            connection.query_row("SELECT COUNT(*) FROM processed_events", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Whether any source acted on `base` within `within` of `now_ms`.
    pub fn is_base_recently_traded(
        &self,
        base: &str,
        within: Duration,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let Some(cooldown) = self.base_cooldown(base)? else {
            return Ok(false);
        };

        let acted_at = parse_utc_millis(&cooldown.last_acted_at)?;
        let within_ms = i64::try_from(within.as_millis()).unwrap_or(i64::MAX);
        Ok(now_ms.saturating_sub(acted_at) < within_ms)
    }

    /// Record that `base` was acted on at `acted_at_ms` because of `event_id`.
    pub fn mark_base_as_traded(
        &self,
        base: &str,
        event_id: &str,
        acted_at_ms: i64,
    ) -> Result<(), StoreError> {
        let acted_at = format_utc_millis(acted_at_ms)?;

        let _guard = self.write_guard();
        let connection = self.connection()?;
        connection.execute(
            "INSERT OR REPLACE INTO processed_bases (base, last_acted_at, last_event_id) \
             VALUES (?, ?, ?)",
            params![base, acted_at, event_id],
        )?;
        Ok(())
    }

    /// Cooldown row for `base`, if any.
    pub fn base_cooldown(&self, base: &str) -> Result<Option<BaseCooldown>, StoreError> {
        let connection = self.connection()?;
        let mut statement = connection.prepare(
            "SELECT base, last_acted_at, last_event_id FROM processed_bases WHERE base = ?",
        )?;
        let mut rows = statement.query_map(params![base], |row| {
            Ok(BaseCooldown {
                base: row.get(0)?,
                last_acted_at: row.get(1)?,
                last_event_id: row.get(2)?,
            })
        })?;
        let cooldown = rows.next().transpose()?;
        Ok(cooldown)
    }

    /// Remove events and cooldown rows older than `retention` relative to `now_ms`.
    pub fn cleanup_older_than(
        &self,
        retention: Duration,
        now_ms: i64,
    ) -> Result<CleanupReport, StoreError> {
        let retention_ms = i64::try_from(retention.as_millis()).unwrap_or(i64::MAX);
        let cutoff_ms = now_ms.saturating_sub(retention_ms).max(0);
        let cutoff_text = format_utc_millis(cutoff_ms)?;

        let _guard = self.write_guard();
        let connection = self.connection()?;
        let events_removed = connection.execute(
            "DELETE FROM processed_events WHERE created_at < ?",
            params![cutoff_ms],
        )?;
        let bases_removed = connection.execute(
            "DELETE FROM processed_bases WHERE last_acted_at < ?",
            params![cutoff_text],
        )?;

        let report = CleanupReport {
            events_removed,
            bases_removed,
        };
        tracing::info!(
            events_removed,
            bases_removed,
            cutoff = %cutoff_text,
            "retention sweep finished"
        );
        Ok(report)
    }
}

fn validate_record(record: &EventRecord) -> Result<(), StoreError> {
    let id_ok = record.event_id.len() == EVENT_ID_LEN
        && record
            .event_id
            .bytes()
            .all(|byte| matches!(byte, b'0'..=b'9' | b'a'..=b'f'));
    if !id_ok {
        return Err(StoreError::InvalidRecord(format!(
            "event_id must be {EVENT_ID_LEN} lowercase hex characters: '{}'",
            record.event_id
        )));
    }
    if record.base.is_empty() {
        return Err(StoreError::InvalidRecord(String::from("base cannot be empty")));
    }
    Ok(())
}
