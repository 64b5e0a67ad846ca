#![forbid(unsafe_code)]

//! Picks the best downloadable media URL out of a post's raw metadata.
//!
//! Resolution order, first hit wins:
//!
//! 1. direct no-watermark fields, every historical spelling
//! 2. ranked fallbacks: watermarked download, then play URLs
//! 3. the first entry of a bitrate/variant list
//! 4. depth-first search for any http(s) string
//!
//! Each named field is looked up under the nested `video` object first and
//! then at the top level. Key order comes from the metadata's own insertion
//! order, so the recursive search is deterministic.

use serde_json::Value;

use crate::model::{Provenance, ResolvedUrl};

const NO_WATERMARK_FIELDS: &[&str] = &[
    "downloadAddrNoWatermark",
    "download_addr_no_watermark",
    "playAddrNoWatermark",
    "play_addr_no_watermark",
    "noWatermarkUrl",
    "no_watermark_url",
    "nwmVideoUrl",
    "nwm_video_url",
];

const FALLBACK_FIELDS: &[&str] = &[
    "downloadAddr",
    "download_addr",
    "downloadUrl",
    "download_url",
    "playAddr",
    "play_addr",
    "playUrl",
    "play_url",
];

const VARIANT_LIST_FIELDS: &[&str] = &["bitrateInfo", "bitrate_info", "bit_rate"];

const COVER_FIELDS: &[&str] = &[
    "cover",
    "originCover",
    "origin_cover",
    "dynamicCover",
    "dynamic_cover",
    "coverUrl",
    "cover_url",
    "thumbnail",
    "thumbnailUrl",
    "thumbnail_url",
];

const COVER_LIST_FIELDS: &[&str] = &["covers", "thumbnails"];

const URL_LIST_KEYS: &[&str] = &["url_list", "urlList", "UrlList"];

pub fn resolve(metadata: &Value) -> Option<ResolvedUrl> {
    let found = |url: String, provenance| Some(ResolvedUrl { url, provenance });

    if let Some(url) = first_named_url(metadata, NO_WATERMARK_FIELDS) {
        return found(url, Provenance::DirectField);
    }
    if let Some(url) = first_named_url(metadata, FALLBACK_FIELDS) {
        return found(url, Provenance::RankedFallbackField);
    }
    if let Some(url) = first_variant_url(metadata) {
        return found(url, Provenance::RankedFallbackField);
    }
    search_http(metadata).map(|url| ResolvedUrl {
        url: url.to_string(),
        provenance: Provenance::RecursiveSearch,
    })
}

/// Still-image cover for the post, if the metadata names one.
pub fn resolve_cover(metadata: &Value) -> Option<String> {
    first_named_url(metadata, COVER_FIELDS).or_else(|| {
        scopes(metadata).find_map(|scope| {
            COVER_LIST_FIELDS.iter().find_map(|key| {
                scope
                    .get(*key)
                    .and_then(Value::as_array)
                    .and_then(|list| list.first())
                    .and_then(url_from_field)
            })
        })
    })
}

/// The nested `video` object, then the record itself.
fn scopes(metadata: &Value) -> impl Iterator<Item = &Value> {
    metadata
        .get("video")
        .filter(|video| video.is_object())
        .into_iter()
        .chain(std::iter::once(metadata).filter(|root| root.is_object()))
}

fn first_named_url(metadata: &Value, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|key| {
        scopes(metadata).find_map(|scope| scope.get(*key).and_then(url_from_field))
    })
}

/// Field values are either a URL string or an object carrying a URL list.
fn url_from_field(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if is_http(text) => Some(text.trim().to_string()),
        Value::Object(map) => URL_LIST_KEYS
            .iter()
            .filter_map(|key| map.get(*key).and_then(Value::as_array))
            .flatten()
            .find_map(|entry| entry.as_str().filter(|text| is_http(text)))
            .map(|text| text.trim().to_string())
            .or_else(|| {
                map.get("url")
                    .and_then(Value::as_str)
                    .filter(|text| is_http(text))
                    .map(|text| text.trim().to_string())
            }),
        _ => None,
    }
}

fn first_variant_url(metadata: &Value) -> Option<String> {
    VARIANT_LIST_FIELDS.iter().find_map(|key| {
        scopes(metadata).find_map(|scope| {
            scope
                .get(*key)
                .and_then(Value::as_array)
                .and_then(|variants| variants.first())
                .and_then(search_http)
                .map(str::to_string)
        })
    })
}

/// Depth-first, in key insertion order then sequence order.
fn search_http(value: &Value) -> Option<&str> {
    match value {
        Value::String(text) if is_http(text) => Some(text.trim()),
        Value::Array(items) => items.iter().find_map(search_http),
        Value::Object(map) => map.values().find_map(search_http),
        _ => None,
    }
}

fn is_http(text: &str) -> bool {
    let text = text.trim_start();
    let prefix = |scheme: &str| {
        text.get(..scheme.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(scheme))
    };
    prefix("http://") || prefix("https://")
}
