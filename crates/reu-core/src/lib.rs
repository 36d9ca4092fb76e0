//! Core domain model and channel logger for REU Cafe.

pub mod logger;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "reu-core";

/// Canonical persisted research-program listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub id: Uuid,
    pub title: String,
    pub url: Option<String>,
    pub field: Vec<String>,
    pub deadline: Option<String>,
    pub description: Option<String>,
    pub institution: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Normalized handoff contract from the extractor into the sync writer.
///
/// All descriptive fields are optional; a draft carrying neither `url` nor
/// `title` cannot be matched against the store and is dropped upstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgramDraft {
    pub source_id: String,
    pub title: Option<String>,
    pub url: Option<String>,
    #[serde(default)]
    pub field: Vec<String>,
    pub deadline: Option<String>,
    pub description: Option<String>,
    pub institution: Option<String>,
}

impl ProgramDraft {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            ..Self::default()
        }
    }

    /// A draft is matchable if the sync writer can key it by url or title.
    pub fn is_matchable(&self) -> bool {
        self.url.is_some() || self.title.is_some()
    }

    /// Display title, falling back to the url for title-less drafts.
    pub fn display_title(&self) -> Option<&str> {
        self.title.as_deref().or(self.url.as_deref())
    }
}
