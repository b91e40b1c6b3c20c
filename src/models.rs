//! Core data models.
//!
//! These types describe the file records tracked by the ledger, the
//! descriptors they are registered from, and the metadata that is
//! denormalized onto every vector index entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Processing lifecycle of a file record.
///
/// Stored as its ordinal. Records move forward through
/// `new → downloaded → parsed → done`; any non-terminal stage may escape to
/// `error`, and `error` may only be retried back to `new`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    New,
    Downloaded,
    Parsed,
    Done,
    Error,
}

impl Status {
    pub const ALL: [Status; 5] = [
        Status::New,
        Status::Downloaded,
        Status::Parsed,
        Status::Done,
        Status::Error,
    ];

    pub fn ordinal(self) -> i64 {
        match self {
            Status::New => 0,
            Status::Downloaded => 1,
            Status::Parsed => 2,
            Status::Done => 3,
            Status::Error => 4,
        }
    }

    pub fn from_ordinal(value: i64) -> Option<Status> {
        Status::ALL.into_iter().find(|s| s.ordinal() == value)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::New => "new",
            Status::Downloaded => "downloaded",
            Status::Parsed => "parsed",
            Status::Done => "done",
            Status::Error => "error",
        }
    }

    /// The transition table enforced by the ledger. Staying put is not a
    /// transition and is handled by the caller as a no-op.
    pub fn can_transition_to(self, next: Status) -> bool {
        matches!(
            (self, next),
            (Status::New, Status::Downloaded)
                | (Status::Downloaded, Status::Parsed)
                | (Status::Parsed, Status::Done)
                | (Status::New, Status::Error)
                | (Status::Downloaded, Status::Error)
                | (Status::Parsed, Status::Error)
                | (Status::Error, Status::New)
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("unknown status: '{}'", s))
    }
}

/// A storage object as discovered in the upstream file store, before it is
/// registered in the ledger. One JSON object per line in a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub id: String,
    pub name: String,
    pub site_id: String,
    #[serde(default)]
    pub site_name: Option<String>,
    #[serde(default)]
    pub size: Option<i64>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_by_id: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_by_id: Option<String>,
    pub link: String,
}

/// One ingestible file as tracked by the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub id: String,
    pub name: String,
    pub site_id: String,
    pub size: Option<i64>,
    pub created_at: Option<DateTime<Utc>>,
    pub created_by_id: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub updated_by_id: Option<String>,
    pub link: String,
    pub status: Status,
    /// Assigned once at registration, never recomputed.
    pub target_path: PathBuf,
}

impl FileRecord {
    /// Extension used for parser dispatch, lowercased. Empty when the name
    /// has no dot.
    pub fn extension(&self) -> String {
        match self.name.rsplit_once('.') {
            Some((_, ext)) => ext.to_ascii_lowercase(),
            None => String::new(),
        }
    }

    /// Path of the extracted plain-text sibling.
    pub fn text_path(&self) -> PathBuf {
        let mut os = self.target_path.clone().into_os_string();
        os.push(".txt");
        PathBuf::from(os)
    }
}

/// Type tag stored on each index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    Site,
    Page,
    File,
    List,
}

/// Parent metadata copied onto every chunk of one source object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub object_id: String,
    #[serde(rename = "type")]
    pub object_type: ObjectType,
    pub name: String,
    pub site_id: String,
    pub site_name: Option<String>,
    pub size: Option<i64>,
    pub created_at: Option<DateTime<Utc>>,
    pub created_by_id: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub updated_by_id: Option<String>,
    pub link: Option<String>,
}

impl EntryMetadata {
    pub fn for_file(record: &FileRecord, site_name: Option<String>, link: String) -> Self {
        Self {
            object_id: record.id.clone(),
            object_type: ObjectType::File,
            name: record.name.clone(),
            site_id: record.site_id.clone(),
            site_name,
            size: record.size,
            created_at: record.created_at,
            created_by_id: record.created_by_id.clone(),
            updated_at: record.updated_at,
            updated_by_id: record.updated_by_id.clone(),
            link: Some(link),
        }
    }
}

/// A chunk ready to be written: text, its 1-based ordinal within the source
/// object, and the shared parent metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexRecord {
    /// Explicit entry id; the index assigns one when absent.
    #[serde(skip)]
    pub id: Option<String>,
    pub content: String,
    pub chunk_id: i64,
    #[serde(flatten)]
    pub metadata: EntryMetadata,
}
