//! Choose between two renderings of the same notice board.
//!
//! The structured endpoint and the markup board often disagree on encoding.
//! Each candidate is scored by the number of replacement characters left by a
//! lossy decode; ties fall to whichever contains the expected script, then to
//! the structured rendering.

use serde::{Deserialize, Serialize};

/// Character a lossy decoder leaves behind for bytes it could not map.
pub const REPLACEMENT_CHAR: char = '\u{FFFD}';

/// Which upstream rendering a candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateKind {
    Structured,
    Markup,
}

/// Non-Latin script expected in correctly decoded notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedScript {
    Hangul,
    Han,
    Kana,
    Cyrillic,
}

impl ExpectedScript {
    pub fn matches(self, ch: char) -> bool {
        let code = u32::from(ch);
        match self {
            Self::Hangul => {
                (0xAC00..=0xD7A3).contains(&code)
                    || (0x1100..=0x11FF).contains(&code)
                    || (0x3130..=0x318F).contains(&code)
            }
            Self::Han => (0x4E00..=0x9FFF).contains(&code) || (0x3400..=0x4DBF).contains(&code),
            Self::Kana => (0x3040..=0x30FF).contains(&code),
            Self::Cyrillic => (0x0400..=0x04FF).contains(&code),
        }
    }

    pub fn present_in(self, text: &str) -> bool {
        text.chars().any(|ch| self.matches(ch))
    }
}

/// One decoded rendering of the board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextCandidate {
    pub kind: CandidateKind,
    pub text: String,
    pub encoding_label: String,
}

impl TextCandidate {
    pub fn structured(text: impl Into<String>, encoding_label: impl Into<String>) -> Self {
        Self {
            kind: CandidateKind::Structured,
            text: text.into(),
            encoding_label: encoding_label.into(),
        }
    }

    pub fn markup(text: impl Into<String>, encoding_label: impl Into<String>) -> Self {
        Self {
            kind: CandidateKind::Markup,
            text: text.into(),
            encoding_label: encoding_label.into(),
        }
    }
}

/// Score of one candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateScore {
    pub kind: CandidateKind,
    pub encoding_label: String,
    pub replacement_chars: usize,
    pub has_expected_script: bool,
}

/// Why the winner won.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionReason {
    OnlyCandidate,
    FewerReplacementChars,
    ExpectedScript,
    StructuredPreferred,
}

/// Diagnostic record of a selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectionDiagnostics {
    pub structured: Option<CandidateScore>,
    pub markup: Option<CandidateScore>,
    pub chosen: CandidateKind,
    pub reason: SelectionReason,
}

/// Winning candidate, the other one (kept for decode fallback) and diagnostics.
#[derive(Debug, Clone)]
pub struct Selection {
    pub winner: TextCandidate,
    pub runner_up: Option<TextCandidate>,
    pub diagnostics: SelectionDiagnostics,
}

pub fn count_replacement_chars(text: &str) -> usize {
    text.chars().filter(|ch| *ch == REPLACEMENT_CHAR).count()
}

pub fn score(candidate: &TextCandidate, script: ExpectedScript) -> CandidateScore {
    CandidateScore {
        kind: candidate.kind,
        encoding_label: candidate.encoding_label.clone(),
        replacement_chars: count_replacement_chars(&candidate.text),
        has_expected_script: script.present_in(&candidate.text),
    }
}

/// Pick the better of two candidates. `None` when neither was fetched.
pub fn select(
    structured: Option<TextCandidate>,
    markup: Option<TextCandidate>,
    script: ExpectedScript,
) -> Option<Selection> {
    let structured_score = structured.as_ref().map(|candidate| score(candidate, script));
    let markup_score = markup.as_ref().map(|candidate| score(candidate, script));

    let (winner, runner_up, reason) = match (structured, markup) {
        (None, None) => return None,
        (Some(only), None) | (None, Some(only)) => (only, None, SelectionReason::OnlyCandidate),
        (Some(structured), Some(markup)) => {
            let (s, m) = match (&structured_score, &markup_score) {
                (Some(s), Some(m)) => (s, m),
                _ => return None,
            };
            if s.replacement_chars != m.replacement_chars {
                if m.replacement_chars < s.replacement_chars {
                    (markup, Some(structured), SelectionReason::FewerReplacementChars)
                } else {
                    (structured, Some(markup), SelectionReason::FewerReplacementChars)
                }
            } else if s.has_expected_script != m.has_expected_script {
                if m.has_expected_script {
                    (markup, Some(structured), SelectionReason::ExpectedScript)
                } else {
                    (structured, Some(markup), SelectionReason::ExpectedScript)
                }
            } else {
                (structured, Some(markup), SelectionReason::StructuredPreferred)
            }
        }
    };

    let diagnostics = SelectionDiagnostics {
        structured: structured_score,
        markup: markup_score,
        chosen: winner.kind,
        reason,
    };
    tracing::debug!(
        chosen = ?diagnostics.chosen,
        reason = ?diagnostics.reason,
        structured_markers = diagnostics.structured.as_ref().map(|s| s.replacement_chars),
        markup_markers = diagnostics.markup.as_ref().map(|s| s.replacement_chars),
        "text source selected"
    );

    Some(Selection {
        winner,
        runner_up,
        diagnostics,
    })
}
