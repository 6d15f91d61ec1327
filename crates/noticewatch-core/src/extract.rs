//! Ticker, market and trade-start extraction from noisy notice text.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::{Captures, Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use time::UtcOffset;

use crate::domain::{offset_from_hours, RawNotice, Ticker, Timestamp};
use crate::text_source::{count_replacement_chars, ExpectedScript};

static TICKER_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(([A-Z0-9]{2,10})\)").expect("ticker pattern compiles"));

static MARKUP_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<[^>]+>").expect("tag pattern compiles"));

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern compiles"));

static NUMERIC_DATETIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(\d{4})\s*[-./]\s*(\d{1,2})\s*[-./]\s*(\d{1,2})\.?\s*(?:\([^)]{0,8}\)\s*)?(오전|오후)?\s*(\d{1,2}):(\d{2})",
    )
    .expect("numeric datetime pattern compiles")
});

static KOREAN_FULL_DATETIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(\d{4})\s*년\s*(\d{1,2})\s*월\s*(\d{1,2})\s*일\s*(?:\([^)]{0,8}\)\s*)?(오전|오후)?\s*(\d{1,2})(?::(\d{2})|\s*시(?:\s*(\d{1,2})\s*분)?)",
    )
    .expect("korean datetime pattern compiles")
});

static KOREAN_MONTH_DAY_TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(\d{1,2})\s*월\s*(\d{1,2})\s*일\s*(?:\([^)]{0,8}\)\s*)?(오전|오후)?\s*(\d{1,2})(?::(\d{2})|\s*시(?:\s*(\d{1,2})\s*분)?)",
    )
    .expect("month-day pattern compiles")
});

const REPLACEMENT_PENALTY: f64 = 0.05;
const MAX_REPLACEMENT_PENALTY: f64 = 0.5;

/// Extraction tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Settlement/quote currencies that are never listing targets.
    pub quote_denylist: Vec<String>,
    /// A notice must mention one of these (title or categories) to be a listing.
    pub listing_keywords: Vec<String>,
    /// Title keywords that disqualify a notice (delistings, warnings, maintenance).
    pub exclusion_keywords: Vec<String>,
    /// Market codes recognised in notice text.
    pub market_codes: Vec<String>,
    /// Market assumed when the text names none.
    pub default_market: String,
    /// Phrases that introduce the trade-start time.
    pub trade_start_keywords: Vec<String>,
    pub expected_script: ExpectedScript,
    /// Offset of wall-clock times written in notices.
    pub local_offset_hours: i8,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            quote_denylist: ["KRW", "BTC", "USDT", "USD", "USDC"]
                .map(String::from)
                .to_vec(),
            listing_keywords: ["신규", "상장", "거래지원", "listing", "Listing"]
                .map(String::from)
                .to_vec(),
            exclusion_keywords: ["종료", "폐지", "유의", "점검", "delisting", "maintenance"]
                .map(String::from)
                .to_vec(),
            market_codes: ["KRW", "BTC", "USDT"].map(String::from).to_vec(),
            default_market: String::from("KRW"),
            trade_start_keywords: [
                "거래지원 개시",
                "거래 개시",
                "거래개시",
                "trading opens",
                "trading will open",
                "trading starts",
            ]
            .map(String::from)
            .to_vec(),
            expected_script: ExpectedScript::Hangul,
            local_offset_hours: 9,
        }
    }
}

/// What was pulled out of one notice.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Extraction {
    pub tickers: Vec<Ticker>,
    pub markets: Vec<String>,
    pub trade_time: Option<Timestamp>,
    pub confidence: f64,
}

/// Stateless extractor built from an [`ExtractionConfig`].
#[derive(Debug, Clone)]
pub struct NoticeExtractor {
    config: ExtractionConfig,
    market_patterns: Vec<Regex>,
    trade_start_pattern: Option<Regex>,
    local_offset: UtcOffset,
}

impl NoticeExtractor {
    pub fn new(config: ExtractionConfig) -> Self {
        let market_patterns = build_market_patterns(&config.market_codes);
        let trade_start_pattern = build_keyword_pattern(&config.trade_start_keywords);
        let local_offset = offset_from_hours(config.local_offset_hours);
        Self {
            config,
            market_patterns,
            trade_start_pattern,
            local_offset,
        }
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    /// Whether the notice announces a listing.
    pub fn is_listing(&self, notice: &RawNotice) -> bool {
        if self.config.listing_keywords.is_empty() {
            return true;
        }

        let title = normalize_brackets(&notice.title).to_lowercase();
        let excluded = self
            .config
            .exclusion_keywords
            .iter()
            .any(|keyword| title.contains(&keyword.to_lowercase()));
        if excluded {
            return false;
        }

        self.config.listing_keywords.iter().any(|keyword| {
            let keyword = keyword.to_lowercase();
            title.contains(&keyword)
                || notice
                    .categories
                    .iter()
                    .any(|category| category.to_lowercase().contains(&keyword))
        })
    }

    /// Bracketed tickers in `text`, deduplicated, denylist-filtered and ordered
    /// short (2 to 6 characters) first, keeping appearance order within each band.
    pub fn extract_tickers(&self, text: &str) -> Vec<Ticker> {
        let normalized = normalize_brackets(text);
        let mut seen = BTreeSet::new();
        let mut tickers = Vec::new();

        for captures in TICKER_TOKEN.captures_iter(&normalized) {
            let Ok(ticker) = Ticker::parse(&captures[1]) else {
                continue;
            };
            if self.is_denied(&ticker) || !seen.insert(ticker.clone()) {
                continue;
            }
            tickers.push(ticker);
        }

        tickers.sort_by_key(|ticker| !ticker.is_short());
        tickers
    }

    pub fn is_denied(&self, ticker: &Ticker) -> bool {
        self.config
            .quote_denylist
            .iter()
            .any(|denied| denied.eq_ignore_ascii_case(ticker.as_str()))
    }

    /// Confidence in `[0, 1]` that `text` was decoded and extracted correctly.
    pub fn confidence(&self, text: &str, tickers_found: bool) -> f64 {
        let markers = count_replacement_chars(text) as f64;
        let mut score = 0.5 - (markers * REPLACEMENT_PENALTY).min(MAX_REPLACEMENT_PENALTY);
        if self.config.expected_script.present_in(text) {
            score += 0.2;
        }
        if tickers_found {
            score += 0.3;
        }
        score.clamp(0.0, 1.0)
    }

    /// Market codes named in `text`, upper-case, sorted and unique; the default
    /// market when none are named.
    pub fn extract_markets(&self, text: &str) -> Vec<String> {
        let normalized = normalize_brackets(text);
        let mut markets = BTreeSet::new();
        for pattern in &self.market_patterns {
            for captures in pattern.captures_iter(&normalized) {
                if let Some(code) = captures.name("code") {
                    markets.insert(code.as_str().to_ascii_uppercase());
                }
            }
        }

        if markets.is_empty() && !self.config.default_market.is_empty() {
            markets.insert(self.config.default_market.to_ascii_uppercase());
        }
        markets.into_iter().collect()
    }

    /// Trade-start time announced in `text`, preferring a time written after a
    /// trade-start keyword. `reference` supplies the year for month/day-only dates.
    pub fn extract_trade_time(&self, text: &str, reference: Timestamp) -> Option<Timestamp> {
        let normalized = normalize_text(text);
        let reference_year = reference.year_in(self.local_offset)?;

        // (start, end, instant) per match
        let mut found: Vec<(usize, usize, Timestamp)> = Vec::new();
        for captures in NUMERIC_DATETIME.captures_iter(&normalized) {
            if let Some(at) = self.numeric_datetime(&captures) {
                let (start, end) = span_of(&captures);
                found.push((start, end, at));
            }
        }
        for captures in KOREAN_FULL_DATETIME.captures_iter(&normalized) {
            if let Some(at) = self.korean_datetime(&captures, None) {
                let (start, end) = span_of(&captures);
                found.push((start, end, at));
            }
        }
        for captures in KOREAN_MONTH_DAY_TIME.captures_iter(&normalized) {
            let (start, end) = span_of(&captures);
            let covered = found
                .iter()
                .any(|(other_start, other_end, _)| (*other_start..*other_end).contains(&start));
            if covered {
                continue;
            }
            if let Some(at) = self.korean_datetime(&captures, Some(reference_year)) {
                found.push((start, end, at));
            }
        }
        found.sort_by_key(|(start, _, _)| *start);

        let keyword_at = self
            .trade_start_pattern
            .as_ref()
            .and_then(|pattern| pattern.find(&normalized))
            .map(|keyword| keyword.start());

        keyword_at
            .and_then(|position| {
                found
                    .iter()
                    .find(|(start, _, _)| *start >= position)
                    .map(|(_, _, at)| *at)
            })
            .or_else(|| found.first().map(|(_, _, at)| *at))
    }

    /// Run every extractor over a notice. Tickers come from the title, falling
    /// back to the body when the title names none.
    pub fn extract(&self, notice: &RawNotice) -> Extraction {
        let title = normalize_text(&notice.title);
        let content = normalize_text(&notice.content);

        let mut tickers = self.extract_tickers(&title);
        if tickers.is_empty() {
            tickers = self.extract_tickers(&content);
        }

        let combined = format!("{title}\n{content}");
        let confidence = self.confidence(&combined, !tickers.is_empty());
        let markets = self.extract_markets(&combined);
        let trade_time = self.extract_trade_time(&combined, notice.published_at);

        Extraction {
            tickers,
            markets,
            trade_time,
            confidence,
        }
    }

    fn numeric_datetime(&self, captures: &Captures<'_>) -> Option<Timestamp> {
        let year: i32 = captures.get(1)?.as_str().parse().ok()?;
        let month: u8 = captures.get(2)?.as_str().parse().ok()?;
        let day: u8 = captures.get(3)?.as_str().parse().ok()?;
        let hour = to_24h(captures.get(4).map(|m| m.as_str()), captures.get(5)?.as_str())?;
        let minute: u8 = captures.get(6)?.as_str().parse().ok()?;
        Timestamp::from_local_parts(year, month, day, hour, minute, 0, self.local_offset)
    }

    /// Shared by the full-date and month/day forms; `year` is `None` when the
    /// captures carry their own year group.
    fn korean_datetime(&self, captures: &Captures<'_>, year: Option<i32>) -> Option<Timestamp> {
        let shift = usize::from(year.is_none());
        let year = match year {
            Some(year) => year,
            None => captures.get(1)?.as_str().parse().ok()?,
        };
        let month: u8 = captures.get(1 + shift)?.as_str().parse().ok()?;
        let day: u8 = captures.get(2 + shift)?.as_str().parse().ok()?;
        let meridiem = captures.get(3 + shift).map(|m| m.as_str());
        let hour = to_24h(meridiem, captures.get(4 + shift)?.as_str())?;
        let minute: u8 = captures
            .get(5 + shift)
            .or_else(|| captures.get(6 + shift))
            .map_or(Some(0), |m| m.as_str().parse().ok())?;
        Timestamp::from_local_parts(year, month, day, hour, minute, 0, self.local_offset)
    }
}

impl Default for NoticeExtractor {
    fn default() -> Self {
        Self::new(ExtractionConfig::default())
    }
}

/// Map visually equivalent bracket and quote characters to ASCII.
///
/// Full-width forms (U+FF01 to U+FF5E) shift to their ASCII counterparts, so
/// `（ＡＢＣ）` becomes `(ABC)`.
pub fn normalize_brackets(text: &str) -> String {
    text.chars()
        .map(|ch| match ch {
            '\u{FF01}'..='\u{FF5E}' => char::from_u32(u32::from(ch) - 0xFEE0).unwrap_or(ch),
            '\u{3000}' => ' ',
            '\u{FE59}' | '\u{2985}' => '(',
            '\u{FE5A}' | '\u{2986}' => ')',
            '【' | '〔' | '〖' | '〘' | '〚' => '[',
            '】' | '〕' | '〗' | '〙' | '〛' => ']',
            '「' | '」' | '『' | '』' | '“' | '”' | '〝' | '〞' => '"',
            '‘' | '’' => '\'',
            _ => ch,
        })
        .collect()
}

/// Decode entities, strip markup, canonicalize brackets and collapse whitespace.
pub fn normalize_text(text: &str) -> String {
    let decoded = html_escape::decode_html_entities(text);
    let stripped = MARKUP_TAG.replace_all(&decoded, " ");
    let bracketed = normalize_brackets(&stripped);
    WHITESPACE.replace_all(&bracketed, " ").trim().to_string()
}

/// Case-insensitive alternation of `keywords`, matched against the same text
/// the datetime spans come from.
fn build_keyword_pattern(keywords: &[String]) -> Option<Regex> {
    let escaped: Vec<String> = keywords
        .iter()
        .filter(|keyword| !keyword.trim().is_empty())
        .map(|keyword| regex::escape(keyword.trim()))
        .collect();
    if escaped.is_empty() {
        return None;
    }
    RegexBuilder::new(&escaped.join("|"))
        .case_insensitive(true)
        .build()
        .ok()
}

fn build_market_patterns(codes: &[String]) -> Vec<Regex> {
    let escaped: Vec<String> = codes
        .iter()
        .filter(|code| !code.is_empty())
        .map(|code| regex::escape(&code.to_ascii_uppercase()))
        .collect();
    if escaped.is_empty() {
        return Vec::new();
    }
    let alternation = escaped.join("|");

    [
        format!(r"(?i)\b(?P<code>{alternation})\s*(?:마켓|market)"),
        format!(r"\b(?P<code>{alternation})-[A-Z0-9]{{2,10}}\b"),
        format!(r"\b[A-Z0-9]{{2,10}}[-/](?P<code>{alternation})\b"),
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
}

fn to_24h(meridiem: Option<&str>, hour: &str) -> Option<u8> {
    let hour: u8 = hour.parse().ok()?;
    let hour = match meridiem {
        Some("오후") if hour < 12 => hour + 12,
        Some("오전") if hour == 12 => 0,
        _ => hour,
    };
    (hour < 24).then_some(hour)
}

fn span_of(captures: &Captures<'_>) -> (usize, usize) {
    captures.get(0).map_or((0, 0), |m| (m.start(), m.end()))
}
