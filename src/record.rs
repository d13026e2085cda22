use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::parser::CitationClassification;

/// Joins a source and a related identifier into one record name.
pub const KEY_SEPARATOR: char = '_';

/// Which level of the crawl a record belongs to. Also the directory name
/// records and assets of that level live under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Query,
    Document,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Query => "query",
            Level::Document => "document",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of one unit of work inside the output tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordKey {
    Source {
        group: String,
        id: String,
    },
    Related {
        group: String,
        source: String,
        id: String,
    },
}

impl RecordKey {
    pub fn source(group: &str, id: &str) -> Self {
        RecordKey::Source {
            group: group.to_string(),
            id: id.to_string(),
        }
    }

    pub fn related(group: &str, source: &str, id: &str) -> Self {
        RecordKey::Related {
            group: group.to_string(),
            source: source.to_string(),
            id: id.to_string(),
        }
    }

    pub fn group(&self) -> &str {
        match self {
            RecordKey::Source { group, .. } | RecordKey::Related { group, .. } => group,
        }
    }

    /// The identifier whose page gets fetched.
    pub fn identifier(&self) -> &str {
        match self {
            RecordKey::Source { id, .. } | RecordKey::Related { id, .. } => id,
        }
    }

    pub fn level(&self) -> Level {
        match self {
            RecordKey::Source { .. } => Level::Query,
            RecordKey::Related { .. } => Level::Document,
        }
    }

    /// File stem: `<id>` for sources, `<source>_<id>` for related entities.
    pub fn stem(&self) -> String {
        match self {
            RecordKey::Source { id, .. } => id.clone(),
            RecordKey::Related { source, id, .. } => format!("{source}{KEY_SEPARATOR}{id}"),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group(), self.stem())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Record {
    #[serde(rename = "query")]
    Source(SourceRecord),
    #[serde(rename = "document")]
    Related(RelatedRecord),
}

impl Record {
    pub fn key(&self) -> RecordKey {
        match self {
            Record::Source(r) => RecordKey::source(&r.group_name, &r.identifier),
            Record::Related(r) => {
                RecordKey::related(&r.group_name, &r.source_identifier, &r.identifier)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub identifier: String,
    pub group_name: String,
    pub url: String,
    pub title: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub classification_codes: Vec<String>,
    #[serde(flatten)]
    pub citations: CitationClassification,
    /// Derived; written for readers of the JSON, ignored on load.
    #[serde(default, skip_deserializing)]
    pub all_cited: Vec<String>,
    pub first_claim: String,
    pub front_image: Option<PathBuf>,
    /// Where the front image was downloaded from.
    #[serde(default)]
    pub front_image_url: Option<String>,
    pub harvested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedRecord {
    pub identifier: String,
    pub source_identifier: String,
    pub group_name: String,
    pub url: String,
    pub title: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub classification_codes: Vec<String>,
    pub first_claim: String,
    pub front_image: Option<PathBuf>,
    /// Where the front image was downloaded from.
    #[serde(default)]
    pub front_image_url: Option<String>,
    pub harvested_at: DateTime<Utc>,
}
