//! # bytecache-core
//!
//! Core types shared by the bytecache daemon and its catalog providers.
//!
//! One logical catalog entry travels through three representations:
//!
//! - [`WireItem`] - what a [`CatalogSource`] returns; untrusted and possibly partial
//! - [`PersistedItem`] - the normalized row kept in the offline cache
//! - [`ViewItem`] - the read model handed to consumers
//!
//! The mapping from wire to persisted form is fallible (an entry without any
//! usable identifier cannot be keyed); the mapping from persisted to view form
//! is a pure 1:1 projection.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors a catalog source can report for a fetch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Unexpected HTTP status: {0}")]
    Status(u16),

    #[error("Failed to decode catalog: {0}")]
    Decode(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Errors raised while normalizing wire items into cache rows.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MappingError {
    /// Neither an `id` nor a media `url` was present.
    #[error("Catalog entry has no identifier (title: {title:?})")]
    MissingIdentifier { title: Option<String> },
}

// ============================================================================
// Core ID Types
// ============================================================================

/// Primary key of a cached item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(pub String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Wire Format
// ============================================================================

/// A catalog entry exactly as the remote source delivered it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireItem {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Media URL. Doubles as the identifier when `id` is absent.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub updated: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default, rename = "closedCaptions")]
    pub closed_captions: Option<String>,
}

/// Top-level payload of a catalog fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogEnvelope {
    #[serde(default, alias = "videos")]
    pub items: Vec<WireItem>,
}

// ============================================================================
// Persisted Format
// ============================================================================

/// A normalized cache row. Every field is present; `id` is the primary key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedItem {
    pub id: ItemId,
    pub title: String,
    pub description: String,
    pub url: String,
    pub updated: String,
    pub thumbnail: String,
}

impl PersistedItem {
    /// Check that the row can be written to the cache.
    pub fn validate(&self) -> Result<(), MappingError> {
        if self.id.as_str().trim().is_empty() {
            return Err(MappingError::MissingIdentifier {
                title: Some(self.title.clone()),
            });
        }
        Ok(())
    }
}

fn normalize(field: Option<String>) -> String {
    field.map(|s| s.trim().to_string()).unwrap_or_default()
}

impl TryFrom<WireItem> for PersistedItem {
    type Error = MappingError;

    fn try_from(wire: WireItem) -> Result<Self, Self::Error> {
        let url = normalize(wire.url);
        let id = match normalize(wire.id) {
            id if !id.is_empty() => id,
            _ if !url.is_empty() => url.clone(),
            _ => {
                return Err(MappingError::MissingIdentifier { title: wire.title });
            }
        };

        Ok(Self {
            id: ItemId(id),
            title: normalize(wire.title),
            description: normalize(wire.description),
            url,
            updated: normalize(wire.updated),
            thumbnail: normalize(wire.thumbnail),
        })
    }
}

/// Map a fetched batch into cache rows. Fails as a whole on the first bad entry.
pub fn to_persisted(batch: Vec<WireItem>) -> Result<Vec<PersistedItem>, MappingError> {
    batch.into_iter().map(PersistedItem::try_from).collect()
}

// ============================================================================
// Read Model
// ============================================================================

/// Default length used by [`ViewItem::short_description`].
pub const SHORT_DESCRIPTION_LEN: usize = 200;

/// What consumers of the cache see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewItem {
    pub id: ItemId,
    pub title: String,
    pub description: String,
    pub url: String,
    pub updated: String,
    pub thumbnail: String,
}

impl ViewItem {
    pub fn from_persisted(item: &PersistedItem) -> Self {
        Self {
            id: item.id.clone(),
            title: item.title.clone(),
            description: item.description.clone(),
            url: item.url.clone(),
            updated: item.updated.clone(),
            thumbnail: item.thumbnail.clone(),
        }
    }

    /// Description cut at a word boundary near [`SHORT_DESCRIPTION_LEN`].
    pub fn short_description(&self) -> String {
        smart_truncate(&self.description, SHORT_DESCRIPTION_LEN)
    }
}

impl From<&PersistedItem> for ViewItem {
    fn from(item: &PersistedItem) -> Self {
        Self::from_persisted(item)
    }
}

/// Map cache rows into the read model.
pub fn to_view(items: &[PersistedItem]) -> Vec<ViewItem> {
    items.iter().map(ViewItem::from_persisted).collect()
}

const TRAILING_SEPARATORS: [&str; 4] = [", ", "; ", ": ", " "];

/// Keep whole words until the text grows past `limit` characters.
///
/// Trailing separators are dropped and `...` is appended when words were cut.
pub fn smart_truncate(text: &str, limit: usize) -> String {
    let mut out = String::with_capacity(text.len().min(limit + 16));
    let mut has_more = false;

    for word in text.split(' ') {
        if out.chars().count() > limit {
            has_more = true;
            break;
        }
        out.push_str(word);
        out.push(' ');
    }

    for separator in TRAILING_SEPARATORS {
        if out.ends_with(separator) {
            out.truncate(out.len() - separator.len());
        }
    }

    if has_more {
        out.push_str("...");
    }
    out
}

// ============================================================================
// Source Trait
// ============================================================================

/// A remote catalog the cache is refreshed from.
///
/// Implementations perform a single attempt per call; retrying is up to the
/// scheduler host.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Stable identifier used in logs.
    fn id(&self) -> &'static str;

    /// Fetch the full current catalog.
    async fn fetch_catalog(&self) -> SourceResult<Vec<WireItem>>;
}

pub mod prelude {
    pub use super::{
        to_persisted, to_view, CatalogEnvelope, CatalogSource, ItemId, MappingError,
        PersistedItem, SourceError, SourceResult, ViewItem, WireItem,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(id: Option<&str>, url: Option<&str>, title: &str) -> WireItem {
        WireItem {
            id: id.map(str::to_string),
            title: Some(title.to_string()),
            url: url.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_mapping_prefers_explicit_id() {
        let item = PersistedItem::try_from(wire(Some("a"), Some("https://x/a"), "A")).unwrap();
        assert_eq!(item.id, ItemId::new("a"));
        assert_eq!(item.url, "https://x/a");
        assert_eq!(item.title, "A");
    }

    #[test]
    fn test_mapping_falls_back_to_url() {
        let item = PersistedItem::try_from(wire(Some("  "), Some(" https://x/b "), "B")).unwrap();
        assert_eq!(item.id.as_str(), "https://x/b");
        assert_eq!(item.url, "https://x/b");
    }

    #[test]
    fn test_mapping_defaults_missing_fields() {
        let item = PersistedItem::try_from(WireItem {
            id: Some("c".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(item.title, "");
        assert_eq!(item.description, "");
        assert_eq!(item.thumbnail, "");
        assert_eq!(item.updated, "");
    }

    #[test]
    fn test_mapping_rejects_entry_without_identifier() {
        let err = PersistedItem::try_from(wire(None, None, "orphan")).unwrap_err();
        assert_eq!(
            err,
            MappingError::MissingIdentifier {
                title: Some("orphan".to_string())
            }
        );
    }

    #[test]
    fn test_batch_mapping_fails_as_a_whole() {
        let batch = vec![wire(Some("a"), None, "A"), wire(None, None, "bad")];
        assert!(to_persisted(batch).is_err());

        let batch = vec![wire(Some("a"), None, "A"), wire(Some("b"), None, "B")];
        assert_eq!(to_persisted(batch).unwrap().len(), 2);
    }

    #[test]
    fn test_validate_rejects_blank_id() {
        let item = PersistedItem {
            id: ItemId::new(" "),
            title: "x".to_string(),
            description: String::new(),
            url: String::new(),
            updated: String::new(),
            thumbnail: String::new(),
        };
        assert!(item.validate().is_err());
    }

    #[test]
    fn test_view_projection_is_one_to_one() {
        let persisted = PersistedItem::try_from(WireItem {
            id: Some("a".to_string()),
            title: Some("A".to_string()),
            description: Some("About A".to_string()),
            url: Some("https://x/a".to_string()),
            updated: Some("2018-06-01T00:00:00".to_string()),
            thumbnail: Some("https://x/a.png".to_string()),
            closed_captions: None,
        })
        .unwrap();

        let view = ViewItem::from(&persisted);
        assert_eq!(view.id, persisted.id);
        assert_eq!(view.title, "A");
        assert_eq!(view.description, "About A");
        assert_eq!(view.thumbnail, "https://x/a.png");
        assert_eq!(to_view(&[persisted]), vec![view]);
    }

    #[test]
    fn test_envelope_accepts_videos_key() {
        let json = r#"{
            "videos": [
                {"title": "Intro", "description": "d", "url": "https://x/1",
                 "updated": "2018-06-07T17:09:43+00:00", "thumbnail": "https://x/1.jpg",
                 "closedCaptions": null}
            ]
        }"#;
        let envelope: CatalogEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.items.len(), 1);
        assert_eq!(envelope.items[0].url.as_deref(), Some("https://x/1"));
        assert!(envelope.items[0].id.is_none());
    }

    #[test]
    fn test_smart_truncate_keeps_short_text() {
        assert_eq!(smart_truncate("short text", 200), "short text");
        assert_eq!(smart_truncate("", 200), "");
    }

    #[test]
    fn test_smart_truncate_cuts_at_word_boundary() {
        assert_eq!(smart_truncate("aaaa bbbb cccc", 5), "aaaa bbbb...");
        assert_eq!(smart_truncate("one, two, three", 3), "one...");
    }

    #[test]
    fn test_short_description() {
        let long = "word ".repeat(100);
        let view = ViewItem {
            id: ItemId::new("a"),
            title: String::new(),
            description: long,
            url: String::new(),
            updated: String::new(),
            thumbnail: String::new(),
        };
        let short = view.short_description();
        assert!(short.ends_with("..."));
        assert!(short.len() < view.description.len());
    }
}
