#![forbid(unsafe_code)]

//! Turns heterogeneous upstream posts into [`MediaItem`]s.
//!
//! Upstream client versions disagree on record shape: legacy camelCase
//! mappings, snake_case mappings, and model objects exposing a map view.
//! Each shape gets a [`FieldView`] adapter that knows its key spellings; the
//! shape is picked once per post and nothing downstream ever cares which one
//! arrived.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::model::{Creator, MediaItem, UNTITLED, is_path_component};
use crate::upstream::RawPost;

/// Epoch values above this are milliseconds rather than seconds.
const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Id,
    Caption,
    CreatedAt,
}

/// Read access to the logical fields of one record shape.
pub trait FieldView {
    /// First present, non-null value among this shape's spellings of `field`.
    fn lookup(&self, field: Field) -> Option<&Value>;

    fn into_metadata(self: Box<Self>) -> Value;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Dropped {
    #[error("post is not a mapping")]
    NotAMapping,
    #[error("post has no usable id")]
    MissingId,
    #[error("post id {0:?} is not usable as a file name")]
    UnsafeId(String),
}

struct LegacyRecord(Map<String, Value>);
struct SnakeRecord(Map<String, Value>);
struct ModelRecord(Map<String, Value>);

impl LegacyRecord {
    const ID: &'static [&'static str] = &["id", "videoId", "awemeId", "itemId"];
    const CAPTION: &'static [&'static str] = &["desc", "caption", "title", "description"];
    const CREATED_AT: &'static [&'static str] = &["createTime", "createdAt", "timestamp"];
}

impl SnakeRecord {
    const ID: &'static [&'static str] = &["id", "video_id", "aweme_id", "item_id"];
    const CAPTION: &'static [&'static str] = &["desc", "caption", "title", "description"];
    const CREATED_AT: &'static [&'static str] = &["create_time", "created_at", "timestamp"];
}

impl ModelRecord {
    const ID: &'static [&'static str] = &["id", "video_id", "videoId", "aweme_id"];
    const CAPTION: &'static [&'static str] = &["desc", "caption", "title", "description"];
    const CREATED_AT: &'static [&'static str] =
        &["create_time", "createTime", "created_at", "createdAt", "timestamp"];
}

macro_rules! field_view {
    ($shape:ty) => {
        impl FieldView for $shape {
            fn lookup(&self, field: Field) -> Option<&Value> {
                let keys = match field {
                    Field::Id => Self::ID,
                    Field::Caption => Self::CAPTION,
                    Field::CreatedAt => Self::CREATED_AT,
                };
                first_present(&self.0, keys)
            }

            fn into_metadata(self: Box<Self>) -> Value {
                Value::Object(self.0)
            }
        }
    };
}

field_view!(LegacyRecord);
field_view!(SnakeRecord);
field_view!(ModelRecord);

fn first_present<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .find_map(|key| map.get(*key).filter(|value| !value.is_null()))
}

/// Keys only the legacy camelCase payloads carry.
const LEGACY_MARKERS: &[&str] = &[
    "createTime",
    "videoId",
    "awemeId",
    "itemId",
    "authorMeta",
    "webVideoUrl",
    "downloadAddr",
    "playAddr",
];

fn is_legacy(map: &Map<String, Value>) -> bool {
    LEGACY_MARKERS.iter().any(|key| map.contains_key(*key))
        || map
            .get("video")
            .and_then(Value::as_object)
            .is_some_and(|video| video.contains_key("playAddr") || video.contains_key("downloadAddr"))
}

/// Chooses the adapter for a post. Runs once per post.
pub fn view_for(post: RawPost) -> Result<Box<dyn FieldView>, Dropped> {
    match post {
        RawPost::Model(model) => Ok(Box::new(ModelRecord(model.to_map()))),
        RawPost::Record(Value::Object(map)) if is_legacy(&map) => Ok(Box::new(LegacyRecord(map))),
        RawPost::Record(Value::Object(map)) => Ok(Box::new(SnakeRecord(map))),
        RawPost::Record(_) => Err(Dropped::NotAMapping),
    }
}

pub fn normalize(creator: &Creator, post: RawPost) -> Result<MediaItem, Dropped> {
    let view = view_for(post)?;
    let id = view
        .lookup(Field::Id)
        .and_then(id_text)
        .ok_or(Dropped::MissingId)?;
    // Ids are used verbatim as cache file names.
    if !is_path_component(&id) {
        return Err(Dropped::UnsafeId(id));
    }
    let caption = view
        .lookup(Field::Caption)
        .and_then(caption_text)
        .unwrap_or_else(|| UNTITLED.to_string());
    let created_at = view.lookup(Field::CreatedAt).and_then(parse_timestamp);

    Ok(MediaItem {
        id,
        creator: creator.clone(),
        caption,
        created_at,
        raw_metadata: view.into_metadata(),
    })
}

fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.trim().to_string()).filter(|id| !id.is_empty()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn caption_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(text) => text.trim().to_string(),
        Value::Number(number) => number.to_string(),
        _ => return None,
    };
    Some(text).filter(|caption| !caption.is_empty())
}

/// Accepts epoch seconds or milliseconds (numbers or digit strings) and
/// RFC 3339 strings. Anything else is unknown time.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float as i64))
            .and_then(from_epoch),
        Value::String(text) => {
            let text = text.trim();
            if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) {
                text.parse::<i64>().ok().and_then(from_epoch)
            } else {
                DateTime::parse_from_rfc3339(text)
                    .ok()
                    .map(|parsed| parsed.with_timezone(&Utc))
            }
        }
        _ => None,
    }
}

fn from_epoch(value: i64) -> Option<DateTime<Utc>> {
    if value <= 0 {
        return None;
    }
    if value > MILLIS_THRESHOLD {
        DateTime::from_timestamp_millis(value)
    } else {
        DateTime::from_timestamp(value, 0)
    }
}
