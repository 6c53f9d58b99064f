//! Data models for shelfsync
//!
//! Defines the synchronized entity families (reading positions, bookshelf
//! entries, bookmarks, reading history), their local patches, and the
//! `MutationRecord` that carries a local change to the server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifier of a queued mutation; doubles as the server idempotency key
pub type MutationId = Uuid;

/// Prefix of client-generated bookmark ids awaiting a server id
pub const TEMP_ID_PREFIX: &str = "tmp-";

/// A family of synchronized domain objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Progress,
    Bookshelf,
    Bookmark,
    History,
}

impl EntityKind {
    /// Every family, in drain order
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Progress,
        EntityKind::Bookshelf,
        EntityKind::Bookmark,
        EntityKind::History,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Progress => "progress",
            EntityKind::Bookshelf => "bookshelf",
            EntityKind::Bookmark => "bookmark",
            EntityKind::History => "history",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Kind of change a mutation applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOp {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for MutationOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MutationOp::Create => f.pad("create"),
            MutationOp::Update => f.pad("update"),
            MutationOp::Delete => f.pad("delete"),
        }
    }
}

/// A not-yet-confirmed local change
///
/// Only the retry bookkeeping (`attempts`, `last_error`, `next_attempt_at`,
/// `parked`) changes after creation, plus key/payload rewrites when a
/// temporary id is remapped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub id: MutationId,
    pub entity_kind: EntityKind,
    pub entity_key: String,
    pub op: MutationOp,
    pub payload: Value,
    /// Monotonic local timestamp (epoch ms)
    pub local_timestamp: u64,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Earliest time (epoch ms) the record may be sent again
    #[serde(default)]
    pub next_attempt_at: u64,
    /// Retry budget exhausted; waiting for a user decision
    #[serde(default)]
    pub parked: bool,
}

impl MutationRecord {
    pub fn new(
        entity_kind: EntityKind,
        entity_key: impl Into<String>,
        op: MutationOp,
        payload: Value,
        local_timestamp: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_kind,
            entity_key: entity_key.into(),
            op,
            payload,
            local_timestamp,
            attempts: 0,
            last_error: None,
            next_attempt_at: 0,
            parked: false,
        }
    }
}

/// Where a reader is in a book
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingPosition {
    pub book_id: String,
    pub chapter_id: String,
    pub offset: u32,
    /// Fraction of the book read, in `[0, 1]`
    pub percentage: f32,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub source_device_id: Option<String>,
}

/// Local change to a reading position (always a full position)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionPatch {
    pub chapter_id: String,
    pub offset: u32,
    pub percentage: f32,
}

impl PositionPatch {
    pub fn new(chapter_id: impl Into<String>, offset: u32, percentage: f32) -> Self {
        Self {
            chapter_id: chapter_id.into(),
            offset,
            percentage: clamp_percentage(percentage),
        }
    }
}

/// Shelf a book sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShelfStatus {
    Reading,
    Completed,
    WantToRead,
}

impl std::fmt::Display for ShelfStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShelfStatus::Reading => f.write_str("reading"),
            ShelfStatus::Completed => f.write_str("completed"),
            ShelfStatus::WantToRead => f.write_str("want_to_read"),
        }
    }
}

/// Book membership on the user's bookshelf (one per book)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookshelfEntry {
    pub book_id: String,
    pub status: ShelfStatus,
    pub added_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShelfPatch {
    pub status: ShelfStatus,
}

/// A bookmark or highlight inside a book
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bookmark {
    /// Server id, or a `tmp-` id until the first sync
    pub id: String,
    pub book_id: String,
    pub chapter_id: String,
    pub position: u32,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub highlight_text: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bookmark {
    /// Generate a client-side temporary id
    pub fn temporary_id() -> String {
        format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4())
    }
}

/// Check whether an id was generated locally and not yet confirmed
pub fn is_temporary_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// Local change to a bookmark; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub book_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlight_text: Option<String>,
}

/// Last time a book was opened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub book_id: String,
    pub chapter_id: String,
    pub last_read_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub source_device_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPatch {
    pub chapter_id: String,
}

/// Clamp a percentage into `[0, 1]`, mapping NaN to 0
pub fn clamp_percentage(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Convert epoch milliseconds into a UTC timestamp
pub fn datetime_from_ms(ms: u64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms as i64).unwrap_or_default()
}

/// Convert a UTC timestamp into epoch milliseconds (pre-epoch clamps to 0)
pub fn datetime_to_ms(at: &DateTime<Utc>) -> u64 {
    at.timestamp_millis().max(0) as u64
}
