//! Per-source anti-replay watermarks.

use std::time::Duration;

use ::duckdb::{params, ToSql};
use serde::Serialize;

use crate::{Store, StoreError};

/// Position of one upstream item, ordered by publish time then item id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct WatermarkPosition {
    pub published_at: i64,
    pub item_id: String,
}

impl WatermarkPosition {
    pub fn new(published_at: i64, item_id: impl Into<String>) -> Self {
        Self {
            published_at,
            item_id: item_id.into(),
        }
    }
}

/// The highest position already considered for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Watermark {
    pub source: String,
    pub last_published_at: i64,
    pub last_item_id: String,
    pub updated_at: i64,
}

impl Watermark {
    pub fn position(&self) -> WatermarkPosition {
        WatermarkPosition::new(self.last_published_at, self.last_item_id.clone())
    }

    /// True when `position` is strictly after this watermark.
    pub fn admits(&self, position: &WatermarkPosition) -> bool {
        *position > self.position()
    }
}

impl Store {
    /// Current watermark for `source`, if one was ever written.
    pub fn watermark(&self, source: &str) -> Result<Option<Watermark>, StoreError> {
        let connection = self.connection()?;
        let mut statement = connection.prepare(
            "SELECT source, last_published_at, last_item_id, updated_at \
             FROM watermarks WHERE source = ?",
        )?;
        let mut rows = statement.query_map(params![source], |row| {
            Ok(Watermark {
                source: row.get(0)?,
                last_published_at: row.get(1)?,
                last_item_id: row.get(2)?,
                updated_at: row.get(3)?,
            })
        })?;
        let watermark = rows.next().transpose()?;
        Ok(watermark)
    }

    /// Whether an item at `position` is newer than what `source` already considered.
    /// Without a stored watermark everything is considered.
    pub fn should_consider(
        &self,
        source: &str,
        position: &WatermarkPosition,
    ) -> Result<bool, StoreError> {
        Ok(self
            .watermark(source)?
            .map_or(true, |watermark| watermark.admits(position)))
    }

    /// Advance the watermark for `source` to the maximum position in `batch`.
    ///
    /// The stored position never moves backwards: an out-of-order or older batch
    /// leaves the row untouched. Returns the watermark in effect afterwards.
    pub fn update_watermark_from_batch(
        &self,
        source: &str,
        batch: &[WatermarkPosition],
        now_ms: i64,
    ) -> Result<Option<Watermark>, StoreError> {
        let Some(candidate) = batch.iter().max() else {
            return self.watermark(source);
        };

        let _guard = self.write_guard();
        let current = self.watermark(source)?;
        if let Some(current) = &current {
            if *candidate < current.position() {
                return Ok(Some(current.clone()));
            }
        }

        let next = Watermark {
            source: source.to_owned(),
            last_published_at: candidate.published_at,
            last_item_id: candidate.item_id.clone(),
            updated_at: now_ms,
        };
        self.write_watermark(&next)?;
        tracing::debug!(
            source,
            published_at = next.last_published_at,
            item_id = %next.last_item_id,
            "watermark advanced"
        );
        Ok(Some(next))
    }

    /// Re-arm `source` to `now - grace` so that a restart does not replay
    /// whatever was published while the process was down.
    ///
    /// A watermark already past `now - grace` is kept as is.
    pub fn initialize_watermark_at_boot(
        &self,
        source: &str,
        now_ms: i64,
        grace: Duration,
    ) -> Result<Watermark, StoreError> {
        let grace_ms = i64::try_from(grace.as_millis()).unwrap_or(i64::MAX);
        let armed = WatermarkPosition::new(now_ms.saturating_sub(grace_ms), String::new());

        let _guard = self.write_guard();
        let existing = self.watermark(source)?;
        if let Some(existing) = existing.as_ref().filter(|w| w.position() >= armed) {
            return Ok(existing.clone());
        }

        let rearmed = Watermark {
            source: source.to_owned(),
            last_published_at: armed.published_at,
            last_item_id: armed.item_id,
            updated_at: now_ms,
        };
        self.write_watermark(&rearmed)?;
        tracing::info!(
            source,
            armed_at = rearmed.last_published_at,
            previous = existing.as_ref().map(|w| w.last_published_at),
            "watermark armed at boot"
        );
        Ok(rearmed)
    }

    fn write_watermark(&self, watermark: &Watermark) -> Result<(), StoreError> {
        let connection = self.connection()?;
        let params: [&dyn ToSql; 4] = [
            &watermark.source,
            &watermark.last_published_at,
            &watermark.last_item_id,
            &watermark.updated_at,
        ];
        connection.execute(
            "INSERT OR REPLACE INTO watermarks \
             (source, last_published_at, last_item_id, updated_at) VALUES (?, ?, ?, ?)",
            params.as_slice(),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::open_temp_store;

    #[test]
    fn missing_watermark_considers_everything() {
        let (_temp, store) = open_temp_store();
        assert!(store
            .should_consider("api", &WatermarkPosition::new(0, "1"))
            .expect("should_consider"));
    }

    #[test]
    fn equal_publish_time_falls_back_to_item_id_order() {
        let (_temp, store) = open_temp_store();
        store
            .update_watermark_from_batch("api", &[WatermarkPosition::new(1_000, "b")], 5)
            .expect("update");

        let consider = |id: &str| {
            store
                .should_consider("api", &WatermarkPosition::new(1_000, id))
                .expect("should_consider")
        };
        assert!(!consider("a"));
        assert!(!consider("b"));
        assert!(consider("c"));
    }

    #[test]
    fn older_batch_never_regresses_the_watermark() {
        let (_temp, store) = open_temp_store();
        store
            .update_watermark_from_batch("api", &[WatermarkPosition::new(2_000, "9")], 1)
            .expect("first update");

        let after = store
            .update_watermark_from_batch(
                "api",
                &[
                    WatermarkPosition::new(1_500, "1"),
                    WatermarkPosition::new(1_999, "99"),
                ],
                2,
            )
            .expect("second update")
            .expect("watermark present");

        assert_eq!(after.position(), WatermarkPosition::new(2_000, "9"));
        assert_eq!(after.updated_at, 1);
    }

    #[test]
    fn out_of_order_batch_uses_its_maximum() {
        let (_temp, store) = open_temp_store();
        let after = store
            .update_watermark_from_batch(
                "api",
                &[
                    WatermarkPosition::new(300, "3"),
                    WatermarkPosition::new(900, "1"),
                    WatermarkPosition::new(100, "7"),
                ],
                10,
            )
            .expect("update")
            .expect("watermark present");

        assert_eq!(after.position(), WatermarkPosition::new(900, "1"));
    }

    #[test]
    fn empty_batch_leaves_state_alone() {
        let (_temp, store) = open_temp_store();
        let after = store
            .update_watermark_from_batch("api", &[], 10)
            .expect("update");
        assert!(after.is_none());
    }

    #[test]
    fn boot_seed_applies_grace_and_keeps_newer_rows() {
        let (_temp, store) = open_temp_store();
        let seeded = store
            .initialize_watermark_at_boot("push", 60_000, Duration::from_secs(5))
            .expect("seed");
        assert_eq!(seeded.last_published_at, 55_000);
        assert!(store
            .should_consider("push", &WatermarkPosition::new(56_000, "1"))
            .expect("should_consider"));

        store
            .update_watermark_from_batch("push", &[WatermarkPosition::new(90_000, "2")], 61_000)
            .expect("update");
        let reseeded = store
            .initialize_watermark_at_boot("push", 80_000, Duration::from_secs(5))
            .expect("reseed");
        assert_eq!(reseeded.position(), WatermarkPosition::new(90_000, "2"));
    }

    #[test]
    fn boot_after_downtime_moves_a_stale_row_forward() {
        let (_temp, store) = open_temp_store();
        store
            .update_watermark_from_batch("api", &[WatermarkPosition::new(10_000, "7")], 11_000)
            .expect("update");

        let rearmed = store
            .initialize_watermark_at_boot("api", 500_000, Duration::from_secs(5))
            .expect("boot");

        assert_eq!(rearmed.position(), WatermarkPosition::new(495_000, ""));
        assert_eq!(rearmed.updated_at, 500_000);
        assert!(!store
            .should_consider("api", &WatermarkPosition::new(494_999, "9"))
            .expect("should_consider"));
    }
}
