//! Core domain model for FUNDSCOPE.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fundscope-core";

/// One of the two fixed analysis domains. Never extended at runtime; the
/// snapshot identity and the upstream endpoint both key off this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisCategory {
    Uk,
    Eu,
}

impl AnalysisCategory {
    pub const ALL: [AnalysisCategory; 2] = [AnalysisCategory::Uk, AnalysisCategory::Eu];

    /// Fixed snapshot identity: UK owns slot 1, EU owns slot 2.
    pub fn snapshot_id(self) -> i64 {
        match self {
            AnalysisCategory::Uk => 1,
            AnalysisCategory::Eu => 2,
        }
    }

    pub fn endpoint_path(self) -> &'static str {
        match self {
            AnalysisCategory::Uk => "/analysis/uk",
            AnalysisCategory::Eu => "/analysis/eu",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            AnalysisCategory::Uk => "UK Funding Opportunities",
            AnalysisCategory::Eu => "EU Funding Opportunities",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisCategory::Uk => "uk",
            AnalysisCategory::Eu => "eu",
        }
    }
}

impl fmt::Display for AnalysisCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCategory(pub String);

impl fmt::Display for UnknownCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown analysis category: {}", self.0)
    }
}

impl std::error::Error for UnknownCategory {}

impl FromStr for AnalysisCategory {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "uk" => Ok(AnalysisCategory::Uk),
            "eu" => Ok(AnalysisCategory::Eu),
            other => Err(UnknownCategory(other.to_string())),
        }
    }
}

/// Replaceable per-category result of one completed ingestion cycle.
///
/// The identity is fixed by category, so re-ingesting a category replaces the
/// prior snapshot instead of accumulating history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSnapshot {
    pub id: i64,
    pub category: AnalysisCategory,
    pub status: Option<String>,
    /// Upstream-reported last-update timestamp, parsed best-effort.
    pub last_update: Option<NaiveDateTime>,
    pub created_at: DateTime<Utc>,
    pub llm_analyzed_count: Option<u64>,
    pub projects_count: Option<u64>,
    pub relevant_count: Option<u64>,
}

impl AnalysisSnapshot {
    pub fn shell(category: AnalysisCategory) -> Self {
        Self {
            id: category.snapshot_id(),
            category,
            status: None,
            last_update: None,
            created_at: Utc::now(),
            llm_analyzed_count: None,
            projects_count: None,
            relevant_count: None,
        }
    }
}

/// One normalized row from the upstream report.
///
/// Date fields stay opaque strings: the upstream format is inconsistent and
/// downstream consumers render them verbatim. `pertinence` keeps the raw
/// upstream value ("Yes"/"No"/"Oui"/"Non") rather than a boolean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityRecord {
    pub id: Uuid,
    pub snapshot_id: i64,
    /// Consolidated title; mirrored into `titre` and `main_title` so no
    /// consumer sees an untitled record regardless of which alias it reads.
    pub title: Option<String>,
    pub titre: Option<String>,
    pub main_title: Option<String>,
    pub lien: Option<String>,
    pub url: Option<String>,
    pub description: Option<String>,
    pub date_ouverture: Option<String>,
    pub start_date: Option<String>,
    pub date_cloture: Option<String>,
    pub deadline: Option<String>,
    pub pertinence: Option<String>,
    /// Never empty after the validity filter.
    pub matching_words: String,
    pub pertinence_llm: Option<String>,
    pub resume_llm: Option<String>,
    pub reponse_brute: Option<String>,
    pub status: Option<String>,
    /// Named result segment this row came from.
    pub data_source: String,
}

impl OpportunityRecord {
    /// Relevance flag check over the raw bilingual upstream value.
    pub fn is_relevant(&self) -> bool {
        self.pertinence
            .as_deref()
            .map(|p| p.eq_ignore_ascii_case("yes") || p.eq_ignore_ascii_case("oui"))
            .unwrap_or(false)
    }
}
