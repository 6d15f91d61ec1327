use std::fmt::{Display, Formatter};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Serialize, Serializer};
use time::format_description::well_known::Rfc3339;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

use crate::ValidationError;

static NAIVE_DATETIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4})[-./](\d{1,2})[-./](\d{1,2})(?:[ T](\d{1,2}):(\d{2})(?::(\d{2})(?:\.\d+)?)?)?$")
        .expect("naive datetime pattern compiles")
});

/// UTC instant with millisecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn now() -> Self {
        Self::from_offset_datetime(OffsetDateTime::now_utc())
    }

    pub const fn from_millis(epoch_ms: i64) -> Self {
        Self(epoch_ms)
    }

    pub const fn as_millis(self) -> i64 {
        self.0
    }

    pub fn from_offset_datetime(value: OffsetDateTime) -> Self {
        let millis = value.unix_timestamp_nanos() / 1_000_000;
        Self(i64::try_from(millis).unwrap_or(i64::MAX))
    }

    /// Build from wall-clock fields in `offset`.
    pub fn from_local_parts(
        year: i32,
        month: u8,
        day: u8,
        hour: u8,
        minute: u8,
        second: u8,
        offset: UtcOffset,
    ) -> Option<Self> {
        let month = Month::try_from(month).ok()?;
        let date = Date::from_calendar_date(year, month, day).ok()?;
        let time = Time::from_hms(hour, minute, second).ok()?;
        Some(Self::from_offset_datetime(
            PrimitiveDateTime::new(date, time).assume_offset(offset),
        ))
    }

    /// Parse an upstream timestamp.
    ///
    /// Accepts RFC3339, naive `YYYY-MM-DD[ HH:MM[:SS]]` wall-clock text in
    /// `local_offset`, or integer epoch seconds/milliseconds.
    pub fn parse(input: &str, local_offset: UtcOffset) -> Result<Self, ValidationError> {
        let trimmed = input.trim();
        let invalid = || ValidationError::InvalidTimestamp {
            value: input.to_owned(),
        };

        if let Ok(parsed) = OffsetDateTime::parse(trimmed, &Rfc3339) {
            return Ok(Self::from_offset_datetime(parsed));
        }

        if !trimmed.is_empty() && trimmed.bytes().all(|byte| byte.is_ascii_digit()) {
            let value: i64 = trimmed.parse().map_err(|_| invalid())?;
            return Ok(Self::from_epoch_number(value));
        }

        let captures = NAIVE_DATETIME.captures(trimmed).ok_or_else(invalid)?;
        let field = |index: usize| -> Option<u32> {
            captures
                .get(index)
                .and_then(|matched| matched.as_str().parse().ok())
        };
        let year = field(1).and_then(|year| i32::try_from(year).ok());
        let (Some(year), Some(month), Some(day)) = (year, field(2), field(3)) else {
            return Err(invalid());
        };
        let hour = field(4).unwrap_or(0);
        let minute = field(5).unwrap_or(0);
        let second = field(6).unwrap_or(0);

        Self::from_local_parts(
            year,
            u8::try_from(month).map_err(|_| invalid())?,
            u8::try_from(day).map_err(|_| invalid())?,
            u8::try_from(hour).map_err(|_| invalid())?,
            u8::try_from(minute).map_err(|_| invalid())?,
            u8::try_from(second).map_err(|_| invalid())?,
            local_offset,
        )
        .ok_or_else(invalid)
    }

    /// Interpret an integer as epoch milliseconds, or seconds when it is too
    /// small to be a plausible millisecond value.
    pub fn from_epoch_number(value: i64) -> Self {
        if value.abs() < 100_000_000_000 {
            Self(value.saturating_mul(1_000))
        } else {
            Self(value)
        }
    }

    pub fn saturating_sub(self, duration: Duration) -> Self {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_sub(millis))
    }

    pub fn saturating_add(self, duration: Duration) -> Self {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(millis))
    }

    /// Signed distance `self - earlier` in milliseconds.
    pub const fn millis_since(self, earlier: Self) -> i64 {
        self.0.saturating_sub(earlier.0)
    }

    /// Calendar year of this instant in `offset`.
    pub fn year_in(self, offset: UtcOffset) -> Option<i32> {
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(self.0) * 1_000_000)
            .ok()
            .map(|at| at.to_offset(offset).year())
    }

    /// Canonical fixed-width UTC text (`YYYY-MM-DDTHH:MM:SS.mmmZ`).
    pub fn to_iso_string(self) -> String {
        noticewatch_store::format_utc_millis(self.0)
            .unwrap_or_else(|_| String::from("<unrepresentable>"))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_iso_string())
    }
}

impl Serialize for Timestamp {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_iso_string())
    }
}

/// Build a `UtcOffset` from whole hours, falling back to UTC when out of range.
pub fn offset_from_hours(hours: i8) -> UtcOffset {
    UtcOffset::from_hms(hours, 0, 0).unwrap_or(UtcOffset::UTC)
}
