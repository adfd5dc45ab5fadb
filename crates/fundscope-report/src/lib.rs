//! Report payload decoding and row normalization.
//!
//! The upstream report is a JSON object whose `results` map carries an
//! arbitrary set of named segments, each an ordered table of loosely typed
//! cells. Cell values can be strings, numbers, booleans, nulls, or the
//! pandas-style `NaN` sentinel, sometimes emitted as a bare numeric token
//! that is not valid JSON at all. Two decode entry points cover this:
//! [`parse_report`] (strict) and [`parse_report_lenient`] (sanitizes bare
//! `NaN` tokens to `null` first).

use chrono::{DateTime, NaiveDateTime};
use fundscope_core::OpportunityRecord;
use serde::Deserialize;
use serde_json::{Map as JsonMap, Value};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "fundscope-report";

/// Decoded upstream report. Unknown top-level and nested keys are ignored;
/// a missing `results` map means zero segments, not an error.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportPayload {
    pub analysis_type: Option<String>,
    pub last_update: Option<String>,
    pub status: Option<String>,
    #[serde(default)]
    pub results: HashMap<String, ReportSegment>,
    pub statistics: Option<ReportStatistics>,
}

/// One named result segment: an ordered row table plus informational
/// metadata the pipeline never acts on.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportSegment {
    #[serde(default)]
    pub columns: Vec<String>,
    pub count: Option<u64>,
    #[serde(default)]
    pub data: Vec<JsonMap<String, Value>>,
    pub file: Option<String>,
    pub size_kb: Option<f64>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ReportStatistics {
    pub llm_analyzed_count: Option<u64>,
    pub projects_count: Option<u64>,
    pub relevant_count: Option<u64>,
}

#[derive(Debug, Error)]
#[error("malformed report payload: {source}")]
pub struct ParseError {
    #[from]
    source: serde_json::Error,
}

/// Strict decode of a raw report payload.
pub fn parse_report(bytes: &[u8]) -> Result<ReportPayload, ParseError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Fallback decode: rewrite bare `NaN` numeric tokens (which some upstream
/// serializers emit) to `null`, then decode.
pub fn parse_report_lenient(bytes: &[u8]) -> Result<ReportPayload, ParseError> {
    let sanitized = sanitize_nan_tokens(bytes);
    Ok(serde_json::from_slice(&sanitized)?)
}

/// Replace standalone `NaN` tokens outside of JSON strings with `null`.
/// A leading minus sign on the token is swallowed too. String contents are
/// left untouched.
pub fn sanitize_nan_tokens(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            out.push(b);
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        if b == b'"' {
            in_string = true;
            out.push(b);
            i += 1;
            continue;
        }

        let token_start = i == 0 || !bytes[i - 1].is_ascii_alphanumeric();
        let token_end = i + 3 >= bytes.len() || !bytes[i + 3].is_ascii_alphanumeric();
        if b == b'N' && token_start && token_end && bytes[i..].starts_with(b"NaN") {
            if out.last() == Some(&b'-') {
                out.pop();
            }
            out.extend_from_slice(b"null");
            i += 3;
            continue;
        }

        out.push(b);
        i += 1;
    }

    out
}

/// Best-effort timestamp parsing for the upstream `last_update` field.
/// The format drifts between RFC 3339 and bare ISO local datetimes.
pub fn parse_last_update(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "null" {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.naive_utc());
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(ts);
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").ok()
}

/// Normalize one loosely typed cell to an optional string.
///
/// Absent keys, JSON nulls, NaN-typed numbers, the literal string `"null"`,
/// and any case variant of `"NaN"` all collapse to `None` so the sentinel
/// text never leaks into stored records.
fn string_cell(row: &JsonMap<String, Value>, key: &str) -> Option<String> {
    match row.get(key)? {
        Value::Null => None,
        Value::String(s) => {
            if s == "null" || s.eq_ignore_ascii_case("nan") {
                None
            } else {
                Some(s.clone())
            }
        }
        Value::Number(n) => {
            if n.as_f64().map(f64::is_nan).unwrap_or(false) {
                None
            } else {
                Some(n.to_string())
            }
        }
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// Matching-keyword gate: a row with no traceable relevance signal is not a
/// real opportunity.
pub fn has_matching_signal(matching_words: &str) -> bool {
    let normalized = matching_words.trim().to_lowercase();
    !matches!(
        normalized.as_str(),
        "" | "null" | "nan" | "none" | "n/a" | "undefined"
    )
}

/// Map one intermediate row plus its segment name into a canonical record.
///
/// Returns `None` when the row fails the matching-keyword gate; the caller
/// drops such rows entirely.
pub fn normalize_row(
    row: &JsonMap<String, Value>,
    segment_name: &str,
    snapshot_id: i64,
) -> Option<OpportunityRecord> {
    let matching_words = match string_cell(row, "Matching Word(s)") {
        Some(words) if has_matching_signal(&words) => words,
        other => {
            debug!(
                segment = segment_name,
                matching_words = ?other,
                "dropping row without usable matching keywords"
            );
            return None;
        }
    };

    // Bilingual title consolidation: the French-labelled primary key wins,
    // the English key is the fallback. The resolved value lands in all three
    // title aliases.
    let title = string_cell(row, "Titre")
        .filter(|t| !t.trim().is_empty())
        .or_else(|| string_cell(row, "Title"));

    Some(OpportunityRecord {
        id: Uuid::new_v4(),
        snapshot_id,
        title: title.clone(),
        titre: title.clone(),
        main_title: title,
        lien: string_cell(row, "Lien"),
        url: string_cell(row, "URL"),
        description: string_cell(row, "Description"),
        date_ouverture: string_cell(row, "Date d'ouverture"),
        start_date: string_cell(row, "Start_date"),
        date_cloture: string_cell(row, "Date de clôture"),
        deadline: string_cell(row, "Deadline"),
        pertinence: string_cell(row, "Pertinence"),
        matching_words,
        pertinence_llm: string_cell(row, "Pertinence LLM"),
        resume_llm: string_cell(row, "Résumé LLM"),
        reponse_brute: string_cell(row, "Réponse brute"),
        status: string_cell(row, "Status"),
        data_source: segment_name.to_string(),
    })
}
