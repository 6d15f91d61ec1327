use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::ValidationError;

pub const MIN_TICKER_LEN: usize = 2;
pub const MAX_TICKER_LEN: usize = 10;

/// Normalized asset ticker: 2 to 10 uppercase ASCII alphanumerics with at
/// least one letter.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ticker(String);

impl Ticker {
    /// Parse and normalize a ticker to uppercase.
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyTicker);
        }

        let normalized = trimmed.to_ascii_uppercase();
        let len = normalized.chars().count();
        if !(MIN_TICKER_LEN..=MAX_TICKER_LEN).contains(&len) {
            return Err(ValidationError::TickerLength {
                len,
                min: MIN_TICKER_LEN,
                max: MAX_TICKER_LEN,
            });
        }

        for (index, ch) in normalized.chars().enumerate() {
            if !ch.is_ascii_alphanumeric() {
                return Err(ValidationError::TickerInvalidChar { ch, index });
            }
        }

        if !normalized.chars().any(|ch| ch.is_ascii_alphabetic()) {
            return Err(ValidationError::TickerWithoutLetter { value: normalized });
        }

        Ok(Self(normalized))
    }

    /// Reduce a pair symbol such as `KRW-ABC`, `ABC_KRW` or `ABC/USDT` to its base.
    ///
    /// `quotes` lists the settlement codes that may appear on either side.
    pub fn from_pair_symbol(input: &str, quotes: &[String]) -> Result<Self, ValidationError> {
        let upper = input.trim().to_ascii_uppercase();
        let parts: Vec<&str> = upper
            .split(['-', '_', '/'])
            .filter(|part| !part.is_empty())
            .collect();

        match parts.as_slice() {
            [single] => Self::parse(single),
            [first, second] => {
                let first_is_quote = quotes.iter().any(|quote| quote == first);
                if first_is_quote {
                    Self::parse(second)
                } else {
                    Self::parse(first)
                }
            }
            _ => Self::parse(&upper),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the ticker is in the short (2 to 6 character) band.
    pub fn is_short(&self) -> bool {
        self.0.len() <= 6
    }
}

impl Display for Ticker {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Ticker {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl TryFrom<&str> for Ticker {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Ticker> for String {
    fn from(value: Ticker) -> Self {
        value.0
    }
}
