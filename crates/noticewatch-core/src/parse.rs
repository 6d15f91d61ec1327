//! Decode the two board renderings into [`RawNotice`] lists.
//!
//! Both parsers skip individual malformed items with a warning; only a body
//! that is not the expected format at all is a [`NoticeError::Decode`].

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use time::UtcOffset;
use url::Url;

use crate::domain::{RawNotice, Timestamp};
use crate::extract::normalize_text;
use crate::NoticeError;

static ANCHOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<a\s[^>]*?href\s*=\s*["']([^"']+)["'][^>]*>(.*?)</a\s*>"#)
        .expect("anchor pattern compiles")
});

static QUERY_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[?&](?:id|noticeId|notice_id|articleId)=(\d+)").expect("query id pattern compiles")
});

static PATH_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/(\d+)/?(?:[?#]|$)").expect("path id pattern compiles"));

static BOARD_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{4})[-./](\d{1,2})[-./](\d{1,2})(?:\.?\s*(\d{1,2}):(\d{2})(?::(\d{2}))?)?")
        .expect("board date pattern compiles")
});

/// How far past an anchor to look for its date.
const DATE_LOOKAHEAD: usize = 600;

/// Parse the structured endpoint: a bare array, or an array under `data`,
/// `notices`, `list` or `data.list`.
pub fn parse_structured(body: &str, local_offset: UtcOffset) -> Result<Vec<RawNotice>, NoticeError> {
    let envelope: NoticeEnvelope = serde_json::from_str(body)
        .map_err(|e| NoticeError::decode("structured", format!("failed to parse notice list: {e}")))?;
    let items = envelope
        .into_items()
        .ok_or_else(|| NoticeError::decode("structured", "no notice array in response"))?;

    let notices = items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<WireNotice>(item) {
            Ok(wire) => wire.into_notice(local_offset),
            Err(error) => {
                tracing::warn!(error = %error, "skipping malformed notice item");
                None
            }
        })
        .collect();
    Ok(notices)
}

/// Parse the markup board. Every anchor whose link carries a numeric notice
/// id becomes a notice dated by the first date found after it.
pub fn parse_markup(
    body: &str,
    base_url: Option<&Url>,
    local_offset: UtcOffset,
) -> Result<Vec<RawNotice>, NoticeError> {
    if !body.contains('<') {
        return Err(NoticeError::decode("markup", "body is not markup"));
    }

    let anchors: Vec<_> = ANCHOR.captures_iter(body).collect();
    let mut seen = HashSet::new();
    let mut notices = Vec::new();

    for (index, captures) in anchors.iter().enumerate() {
        let (Some(whole), Some(href), Some(inner)) = (captures.get(0), captures.get(1), captures.get(2))
        else {
            continue;
        };
        let href = html_escape::decode_html_entities(href.as_str()).into_owned();
        let Some(id) = notice_id(&href) else {
            continue;
        };
        if !seen.insert(id.clone()) {
            continue;
        }

        let title = normalize_text(inner.as_str());
        if title.is_empty() {
            continue;
        }

        let window_end = anchors
            .get(index + 1)
            .and_then(|next| next.get(0))
            .map_or(body.len(), |next| next.start())
            .min(floor_char_boundary(body, whole.end() + DATE_LOOKAHEAD));
        let Some(published_at) = body
            .get(whole.end()..window_end)
            .and_then(|tail| board_date(tail, local_offset))
        else {
            tracing::debug!(id = %id, "board entry without a date, skipping");
            continue;
        };

        let url = match base_url {
            Some(base) => base
                .join(&href)
                .map(|resolved| resolved.to_string())
                .unwrap_or(href),
            None => href,
        };

        notices.push(RawNotice {
            id,
            title,
            content: String::new(),
            categories: Vec::new(),
            url,
            published_at,
        });
    }

    Ok(notices)
}

fn notice_id(href: &str) -> Option<String> {
    QUERY_ID
        .captures(href)
        .or_else(|| PATH_ID.captures(href))
        .and_then(|captures| captures.get(1))
        .map(|id| id.as_str().to_owned())
}

fn board_date(text: &str, local_offset: UtcOffset) -> Option<Timestamp> {
    let captures = BOARD_DATE.captures(text)?;
    let field = |index: usize| -> Option<u8> { captures.get(index)?.as_str().parse().ok() };
    let year: i32 = captures.get(1)?.as_str().parse().ok()?;
    Timestamp::from_local_parts(
        year,
        field(2)?,
        field(3)?,
        field(4).unwrap_or(0),
        field(5).unwrap_or(0),
        field(6).unwrap_or(0),
        local_offset,
    )
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    let mut index = index.min(text.len());
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NoticeEnvelope {
    Bare(Vec<Value>),
    Wrapped(WrappedNotices),
}

impl NoticeEnvelope {
    fn into_items(self) -> Option<Vec<Value>> {
        match self {
            Self::Bare(items) => Some(items),
            Self::Wrapped(wrapped) => match wrapped.data {
                Some(DataField::List(items)) => Some(items),
                Some(DataField::Nested { list, notices }) => list.or(notices),
                None => wrapped.notices.or(wrapped.list),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct WrappedNotices {
    #[serde(default)]
    data: Option<DataField>,
    #[serde(default)]
    notices: Option<Vec<Value>>,
    #[serde(default)]
    list: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DataField {
    List(Vec<Value>),
    Nested {
        #[serde(default)]
        list: Option<Vec<Value>>,
        #[serde(default)]
        notices: Option<Vec<Value>>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireId {
    Number(i64),
    Text(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireTime {
    Epoch(i64),
    Text(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireCategories {
    Many(Vec<String>),
    One(String),
}

#[derive(Debug, Deserialize)]
struct WireNotice {
    id: WireId,
    title: String,
    #[serde(default, alias = "body")]
    content: Option<String>,
    #[serde(default, alias = "category")]
    categories: Option<WireCategories>,
    #[serde(default, alias = "link")]
    url: Option<String>,
    #[serde(alias = "publishedAt", alias = "listed_at", alias = "created_at")]
    published_at: WireTime,
}

impl WireNotice {
    fn into_notice(self, local_offset: UtcOffset) -> Option<RawNotice> {
        let id = match self.id {
            WireId::Number(value) => value.to_string(),
            WireId::Text(value) => value.trim().to_owned(),
        };
        if id.is_empty() {
            return None;
        }

        let published_at = match self.published_at {
            WireTime::Epoch(value) => Timestamp::from_epoch_number(value),
            WireTime::Text(value) => match Timestamp::parse(&value, local_offset) {
                Ok(parsed) => parsed,
                Err(error) => {
                    tracing::warn!(id = %id, error = %error, "skipping notice with bad publish time");
                    return None;
                }
            },
        };

        let categories = match self.categories {
            Some(WireCategories::Many(values)) => values,
            Some(WireCategories::One(value)) => vec![value],
            None => Vec::new(),
        };

        Some(RawNotice {
            id,
            title: self.title,
            content: self.content.unwrap_or_default(),
            categories,
            url: self.url.unwrap_or_default(),
            published_at,
        })
    }
}
