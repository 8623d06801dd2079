//! Core data models used throughout wp-relocate.
//!
//! These types represent the content units, references, fetch outcomes, and
//! redirect rules that flow through the relocation pipeline. Everything that
//! is written to a stage artifact derives `Serialize`/`Deserialize`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A row of published content as read from the content store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentUnit {
    pub id: String,
    pub body: Option<String>,
    /// Named scalar columns that may each hold one reference (e.g. `featured_image`).
    pub fields: BTreeMap<String, Option<String>>,
}

/// A raw string found in a content unit, attributed to the field it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub content_id: String,
    pub field: String,
    pub raw: String,
}

/// Structural origin of a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Empty,
    ManagedUpload,
    LegacyUpload,
    ManagedOther,
    External,
    Relative,
    Other,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Empty,
        Category::ManagedUpload,
        Category::LegacyUpload,
        Category::ManagedOther,
        Category::External,
        Category::Relative,
        Category::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Empty => "empty",
            Category::ManagedUpload => "managed-upload",
            Category::LegacyUpload => "legacy-upload",
            Category::ManagedOther => "managed-other",
            Category::External => "external",
            Category::Relative => "relative",
            Category::Other => "other",
        }
    }

    /// Categories that can never be turned into a fetchable address.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Category::Empty | Category::Other)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedReference {
    #[serde(flatten)]
    pub reference: Reference,
    pub category: Category,
}

/// Outcome of resolving and retrieving one reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum FetchOutcome {
    Downloaded { bytes: u64 },
    AlreadyPresent,
    FailedHttp { status: u16 },
    FailedError { message: String },
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            FetchOutcome::Downloaded { .. } | FetchOutcome::AlreadyPresent
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResult {
    pub content_id: String,
    pub field: String,
    pub original: String,
    pub resolved_url: String,
    pub target_path: String,
    pub new_url: String,
    pub partition: (String, String),
    pub filename: String,
    /// The address that actually answered: the origin or a fallback mirror.
    pub served_from: Option<String>,
    #[serde(flatten)]
    pub outcome: FetchOutcome,
}

/// Counts derived from a full set of fetch results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FetchSummary {
    pub downloaded: u64,
    pub already_present: u64,
    pub failed: u64,
}

impl FetchSummary {
    pub fn from_results(results: &[FetchResult]) -> Self {
        let mut summary = FetchSummary::default();
        for result in results {
            match result.outcome {
                FetchOutcome::Downloaded { .. } => summary.downloaded += 1,
                FetchOutcome::AlreadyPresent => summary.already_present += 1,
                FetchOutcome::FailedHttp { .. } | FetchOutcome::FailedError { .. } => {
                    summary.failed += 1
                }
            }
        }
        summary
    }

    pub fn succeeded(&self) -> u64 {
        self.downloaded + self.already_present
    }

    pub fn total(&self) -> u64 {
        self.succeeded() + self.failed
    }
}

/// A legacy path the reverse proxy should answer with a redirect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectRule {
    pub from_path: String,
    pub to_path: String,
    pub status_code: u16,
    pub content_id: String,
}
