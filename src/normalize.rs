//! Result normalization for the universal `search` and `fetch` tools.
//!
//! Upstream payloads have no fixed schema: hit lists live under varying keys,
//! tool results may wrap JSON documents inside text content, and documents
//! arrive as content arrays or bare strings. Everything is decoded
//! field-by-field and best-effort: unreadable parts are skipped, never fatal.

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Keys that may hold a list of search hits, in lookup order.
const HIT_LIST_KEYS: &[&str] = &["results", "organic", "items", "hits", "data"];

/// URL fields in preference order.
const URL_KEYS: &[&str] = &["url", "link", "href", "uri"];

/// Title fields in preference order.
const TITLE_KEYS: &[&str] = &["title", "name"];

/// Descriptive hit fields carried into `metadata`.
const METADATA_KEYS: &[&str] = &["snippet", "description", "source", "position"];

/// Document body fields used when a payload has no `content` array.
const BODY_KEYS: &[&str] = &["text", "markdown", "body"];

/// Nesting limit when hit lists are wrapped in objects or JSON text.
const MAX_DEPTH: usize = 4;

// ─── Types ───────────────────────────────────────────────────────────────────

/// The bridge's normalized record, independent of the upstream tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalResult {
    pub id: String,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// Normalized `search` output: hits in upstream order, possibly empty.
///
/// Hits serialize as `{id, title, url, metadata?}`; search never carries text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedSearchResponse {
    #[serde(serialize_with = "serialize_hits")]
    pub results: Vec<CanonicalResult>,
}

/// Wire view of one search hit.
#[derive(Serialize)]
struct SearchHit<'a> {
    id: &'a str,
    title: &'a str,
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a Map<String, Value>>,
}

fn serialize_hits<S: Serializer>(results: &[CanonicalResult], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(results.iter().map(|r| SearchHit {
        id: &r.id,
        title: &r.title,
        url: &r.url,
        metadata: r.metadata.as_ref(),
    }))
}

// ─── Search ──────────────────────────────────────────────────────────────────

/// Flatten a search payload into canonical hits.
///
/// Hits without any URL-like field are dropped.
pub fn normalize_search(payload: &Value) -> NormalizedSearchResponse {
    let candidates = hit_candidates(payload, 0);
    let total = candidates.len();

    let results: Vec<CanonicalResult> = candidates.iter().filter_map(canonical_hit).collect();

    if results.len() < total {
        tracing::debug!(
            kept = results.len(),
            dropped = total - results.len(),
            "dropped search hits without a url"
        );
    }
    NormalizedSearchResponse { results }
}

/// Locate the hit list inside a payload.
fn hit_candidates(payload: &Value, depth: usize) -> Vec<Value> {
    if depth > MAX_DEPTH {
        return Vec::new();
    }

    match payload {
        Value::Array(items) => items.clone(),
        Value::String(s) => serde_json::from_str::<Value>(s)
            .map(|doc| hit_candidates(&doc, depth + 1))
            .unwrap_or_default(),
        Value::Object(obj) => {
            for key in HIT_LIST_KEYS {
                match obj.get(*key) {
                    Some(Value::Array(items)) => return items.clone(),
                    Some(nested @ Value::Object(_)) => {
                        let found = hit_candidates(nested, depth + 1);
                        if !found.is_empty() {
                            return found;
                        }
                    }
                    _ => {}
                }
            }

            // Tool results that wrap the real document in text content.
            if let Some(content) = obj.get("content").and_then(Value::as_array) {
                let from_text: Vec<Value> = content
                    .iter()
                    .filter_map(fragment_text)
                    .filter_map(|text| serde_json::from_str::<Value>(text).ok())
                    .flat_map(|doc| hit_candidates(&doc, depth + 1))
                    .collect();
                if !from_text.is_empty() {
                    return from_text;
                }
            }

            // A lone hit.
            if first_str(obj, URL_KEYS).is_some() {
                return vec![payload.clone()];
            }
            Vec::new()
        }
        _ => Vec::new(),
    }
}

/// Build one canonical hit, or `None` when no URL can be found.
fn canonical_hit(hit: &Value) -> Option<CanonicalResult> {
    match hit {
        Value::Object(obj) => {
            let url = first_str(obj, URL_KEYS)?;
            let title = first_str(obj, TITLE_KEYS).unwrap_or_else(|| url.clone());

            let metadata: Map<String, Value> = METADATA_KEYS
                .iter()
                .filter_map(|k| {
                    obj.get(*k)
                        .filter(|v| !v.is_null())
                        .map(|v| (k.to_string(), v.clone()))
                })
                .collect();

            Some(CanonicalResult {
                id: url.clone(),
                title,
                url,
                text: String::new(),
                metadata: (!metadata.is_empty()).then_some(metadata),
            })
        }
        Value::String(s) if looks_like_url(s) => {
            let url = s.trim().to_string();
            Some(CanonicalResult {
                id: url.clone(),
                title: url.clone(),
                url,
                text: String::new(),
                metadata: None,
            })
        }
        _ => None,
    }
}

fn looks_like_url(s: &str) -> bool {
    let s = s.trim();
    s.starts_with("http://") || s.starts_with("https://")
}

// ─── Fetch ───────────────────────────────────────────────────────────────────

/// Assemble a single document from a fetch payload.
///
/// `text` joins every text fragment with `\n` in upstream order. `id` and
/// `url` default to `requested_id`; `title` defaults to `fallback_title`.
pub fn normalize_fetch(payload: &Value, requested_id: &str, fallback_title: &str) -> CanonicalResult {
    let obj = payload.as_object();

    let metadata = obj
        .and_then(|o| o.get("metadata"))
        .and_then(Value::as_object)
        .cloned();

    let title = obj
        .and_then(|o| first_str(o, &["title"]))
        .or_else(|| metadata.as_ref().and_then(|m| first_str(m, &["title"])))
        .unwrap_or_else(|| fallback_title.to_string());

    let id = obj
        .and_then(|o| first_str(o, &["id"]))
        .unwrap_or_else(|| requested_id.to_string());

    let url = obj
        .and_then(|o| first_str(o, URL_KEYS))
        .unwrap_or_else(|| requested_id.to_string());

    CanonicalResult {
        id,
        title,
        url,
        text: text_fragments(payload).join("\n"),
        metadata,
    }
}

/// Every textual fragment of a payload, in upstream order.
///
/// Reads a `content` array (`{text}` objects or bare strings) when present,
/// otherwise the first of `text`/`markdown`/`body`, otherwise a bare string.
pub fn text_fragments(payload: &Value) -> Vec<&str> {
    match payload {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items.iter().filter_map(fragment_text).collect(),
        Value::Object(obj) => {
            if let Some(content) = obj.get("content") {
                match content {
                    Value::Array(items) => return items.iter().filter_map(fragment_text).collect(),
                    Value::String(s) => return vec![s.as_str()],
                    _ => {}
                }
            }
            BODY_KEYS
                .iter()
                .find_map(|k| obj.get(*k).and_then(Value::as_str))
                .map(|s| vec![s])
                .unwrap_or_default()
        }
        _ => Vec::new(),
    }
}

fn fragment_text(item: &Value) -> Option<&str> {
    match item {
        Value::String(s) => Some(s.as_str()),
        Value::Object(o) => o.get("text").and_then(Value::as_str),
        _ => None,
    }
}

/// First non-blank string among `keys`.
fn first_str(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| {
        obj.get(*k)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
