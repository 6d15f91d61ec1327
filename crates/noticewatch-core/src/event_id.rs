//! Deterministic content-addressed event identity.
//!
//! Two digests exist. Article events hash
//! `source|BASE|normalized_url|MARKET,MARKET|trade_time_iso` and push events,
//! which carry no article, hash `source|BASE`. Both are SHA-256 rendered as 64
//! lowercase hex characters.

use sha2::{Digest, Sha256};
use url::Url;

use crate::domain::{EventId, ProcessedEvent, Ticker, Timestamp};
use crate::ValidationError;

/// Digest of an article observation. Inputs must already be canonical; see
/// [`normalize_url`] and [`canonical_markets`].
pub fn article_event_id(
    source: &str,
    base: &Ticker,
    normalized_url: &str,
    markets: &[String],
    trade_time: Option<Timestamp>,
) -> EventId {
    let trade_time = trade_time.map(Timestamp::to_iso_string).unwrap_or_default();
    let markets = markets.join(",");
    digest(&[source, base.as_str(), normalized_url, &markets, &trade_time])
}

/// Digest of a push-channel detection keyed only on the ticker.
pub fn push_event_id(source: &str, base: &Ticker) -> EventId {
    digest(&[source, base.as_str()])
}

/// Upper-case, trim, deduplicate and sort market codes.
pub fn canonical_markets(markets: &[String]) -> Vec<String> {
    let mut canonical: Vec<String> = markets
        .iter()
        .map(|market| market.trim().to_ascii_uppercase())
        .filter(|market| !market.is_empty())
        .collect();
    canonical.sort();
    canonical.dedup();
    canonical
}

/// Force `https`, drop query and fragment, keep host and path.
///
/// Relative links are resolved against `base` when one is given.
pub fn normalize_url(raw: &str, base: Option<&Url>) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    let invalid = |reason: String| ValidationError::InvalidUrl {
        value: raw.to_owned(),
        reason,
    };

    let mut url = match Url::parse(trimmed) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => match base {
            Some(base) => base.join(trimmed).map_err(|err| invalid(err.to_string()))?,
            None => return Err(invalid(String::from("relative url without a base"))),
        },
        Err(err) => return Err(invalid(err.to_string())),
    };

    match url.scheme() {
        "https" => {}
        "http" => url
            .set_scheme("https")
            .map_err(|()| invalid(String::from("scheme cannot be forced to https")))?,
        other => return Err(invalid(format!("unsupported scheme '{other}'"))),
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.to_string())
}

/// Builds identified events, resolving relative links against the board URL.
#[derive(Debug, Clone, Default)]
pub struct EventIdBuilder {
    base_url: Option<Url>,
}

impl EventIdBuilder {
    pub fn new(base_url: Option<&str>) -> Result<Self, ValidationError> {
        let base_url = base_url
            .filter(|value| !value.trim().is_empty())
            .map(|value| {
                Url::parse(value.trim()).map_err(|err| ValidationError::InvalidUrl {
                    value: value.to_owned(),
                    reason: err.to_string(),
                })
            })
            .transpose()?;
        Ok(Self { base_url })
    }

    pub fn normalize_url(&self, raw: &str) -> Result<String, ValidationError> {
        normalize_url(raw, self.base_url.as_ref())
    }

    /// Event for one ticker of an article notice.
    pub fn article_event(
        &self,
        source: &str,
        base: &Ticker,
        raw_url: &str,
        markets: &[String],
        trade_time: Option<Timestamp>,
        raw_title: &str,
    ) -> Result<ProcessedEvent, ValidationError> {
        let url = self.normalize_url(raw_url)?;
        let markets = canonical_markets(markets);
        let event_id = article_event_id(source, base, &url, &markets, trade_time);
        Ok(ProcessedEvent {
            event_id,
            source: source.to_owned(),
            base: base.clone(),
            url,
            markets,
            trade_time_utc: trade_time,
            raw_title: raw_title.to_owned(),
        })
    }

    /// Event for a push detection with no article.
    pub fn push_event(
        &self,
        source: &str,
        base: &Ticker,
        markets: &[String],
        raw_title: &str,
    ) -> ProcessedEvent {
        ProcessedEvent {
            event_id: push_event_id(source, base),
            source: source.to_owned(),
            base: base.clone(),
            url: String::new(),
            markets: canonical_markets(markets),
            trade_time_utc: None,
            raw_title: raw_title.to_owned(),
        }
    }
}

fn digest(parts: &[&str]) -> EventId {
    let mut hasher = Sha256::new();
    hasher.update(parts.join("|").as_bytes());
    EventId::from_digest_hex(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticker(value: &str) -> Ticker {
        Ticker::parse(value).expect("ticker")
    }

    fn markets(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn digest_is_64_lowercase_hex_and_stable() {
        let first = article_event_id(
            "api",
            &ticker("ABC"),
            "https://exchange.test/notice/1",
            &markets(&["KRW"]),
            None,
        );
        let second = article_event_id(
            "api",
            &ticker("ABC"),
            "https://exchange.test/notice/1",
            &markets(&["KRW"]),
            None,
        );

        assert_eq!(first, second);
        assert_eq!(first.as_str().len(), 64);
        assert!(first
            .as_str()
            .chars()
            .all(|ch| ch.is_ascii_digit() || ('a'..='f').contains(&ch)));
    }

    #[test]
    fn push_digest_matches_plain_sha256_of_the_pair() {
        let id = push_event_id("push", &ticker("ABC"));
        let expected = hex::encode(Sha256::digest(b"push|ABC"));
        assert_eq!(id.as_str(), expected);
    }

    #[test]
    fn url_normalization_forces_https_and_drops_tracking() {
        assert_eq!(
            normalize_url("http://Exchange.test/notice/7?utm_source=x#top", None).expect("url"),
            "https://exchange.test/notice/7"
        );
        assert_ne!(
            normalize_url("https://exchange.test/notice/7", None).expect("url"),
            normalize_url("https://exchange.test/notice/8", None).expect("url")
        );
    }

    #[test]
    fn relative_links_resolve_against_the_board() {
        let builder = EventIdBuilder::new(Some("https://exchange.test/board/")).expect("builder");
        assert_eq!(
            builder.normalize_url("/notice/9?page=2").expect("url"),
            "https://exchange.test/notice/9"
        );
        assert!(normalize_url("/notice/9", None).is_err());
        assert!(normalize_url("ftp://exchange.test/x", None).is_err());
    }

    #[test]
    fn market_order_and_duplicates_do_not_matter() {
        let builder = EventIdBuilder::default();
        let base = ticker("ABC");
        let one = builder
            .article_event("api", &base, "https://x.test/n/1", &markets(&["usdt", "KRW"]), None, "t")
            .expect("event");
        let two = builder
            .article_event(
                "api",
                &base,
                "https://x.test/n/1?ref=feed",
                &markets(&["KRW", "USDT", "krw"]),
                None,
                "t",
            )
            .expect("event");

        assert_eq!(one.event_id, two.event_id);
        assert_eq!(one.markets, vec!["KRW", "USDT"]);
    }
}
