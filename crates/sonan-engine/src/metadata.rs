//! Per-item metadata snapshot (tags and artwork).

use std::collections::BTreeMap;

use symphonia::core::meta::{MetadataRevision, StandardVisualKey, Value};

/// Key used for the primary artwork entry.
pub const ARTWORK_KEY: &str = "Artwork";

const MAX_ARTWORK_BYTES: usize = 5_000_000;

/// A single metadata value.
#[derive(Clone, Debug, PartialEq)]
pub enum TagValue {
    Text(String),
    Binary {
        media_type: Option<String>,
        data: Vec<u8>,
    },
}

impl TagValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            TagValue::Text(text) => Some(text),
            TagValue::Binary { .. } => None,
        }
    }
}

/// Read-only snapshot of an item's tags, taken when the source is opened.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ItemMetadata {
    tags: BTreeMap<String, TagValue>,
}

impl ItemMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: TagValue) {
        self.tags.insert(key.into(), value);
    }

    pub fn insert_text(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.insert(key, TagValue::Text(value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&TagValue> {
        self.tags.get(key)
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(TagValue::as_text)
    }

    /// Front cover if present, otherwise the first embedded picture.
    pub fn artwork(&self) -> Option<&[u8]> {
        match self.get(ARTWORK_KEY)? {
            TagValue::Binary { data, .. } => Some(data),
            TagValue::Text(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TagValue)> {
        self.tags.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Build a snapshot from a Symphonia metadata revision.
    ///
    /// Standard tags use their standard key name (`TrackTitle`, `Artist`, ...); others keep
    /// the raw container key. The first occurrence of a key wins.
    pub fn from_revision(rev: &MetadataRevision) -> Self {
        let mut meta = Self::new();
        for tag in rev.tags() {
            let key = match tag.std_key {
                Some(std_key) => format!("{std_key:?}"),
                None => tag.key.clone(),
            };
            if meta.tags.contains_key(&key) {
                continue;
            }
            let value = match &tag.value {
                Value::Binary(data) => TagValue::Binary {
                    media_type: None,
                    data: data.to_vec(),
                },
                other => TagValue::Text(other.to_string()),
            };
            meta.tags.insert(key, value);
        }

        let mut visuals: Vec<_> = rev
            .visuals()
            .iter()
            .filter(|v| v.data.len() <= MAX_ARTWORK_BYTES)
            .collect();
        // Front cover first, remaining pictures in container order.
        visuals.sort_by_key(|v| v.usage != Some(StandardVisualKey::FrontCover));
        for (idx, visual) in visuals.into_iter().enumerate() {
            let key = if idx == 0 {
                ARTWORK_KEY.to_string()
            } else {
                format!("{ARTWORK_KEY}.{idx}")
            };
            meta.tags.insert(
                key,
                TagValue::Binary {
                    media_type: Some(visual.media_type.clone()),
                    data: visual.data.to_vec(),
                },
            );
        }
        meta
    }
}
