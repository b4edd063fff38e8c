//! smee-style payload envelopes
//!
//! A smee channel serializes each incoming webhook as one JSON object. The
//! original body sits under `"body"`, the query string under `"query"`, and
//! every other key is a request header. Unwrapping rebuilds the original
//! request for the local target.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

use crate::error::DeliveryError;

/// Envelope keys that are not copied onto the forwarded request
const SKIPPED_KEYS: &[&str] = &[
    "body",
    "query",
    "host",
    "content-length",
    "connection",
    "transfer-encoding",
    "timestamp",
];

/// Event types smee uses for its own bookkeeping
pub const BOOKKEEPING_EVENTS: &[&str] = &["ready", "ping"];

/// A webhook request recovered from an envelope
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    /// JSON-serialized original body, empty when the envelope had none
    pub body: Vec<u8>,
    /// Original query parameters, sorted by key
    pub query: Vec<(String, String)>,
    /// Original request headers
    pub headers: HeaderMap,
}

impl Envelope {
    /// Parse an envelope out of an event's data
    pub fn parse(data: &str) -> Result<Self, DeliveryError> {
        let value: Value =
            serde_json::from_str(data).map_err(|e| DeliveryError::Envelope(e.to_string()))?;
        let Value::Object(object) = value else {
            return Err(DeliveryError::Envelope("data is not a JSON object".into()));
        };

        let body = match object.get("body") {
            Some(Value::Null) | None => Vec::new(),
            Some(body) => {
                serde_json::to_vec(body).map_err(|e| DeliveryError::Envelope(e.to_string()))?
            }
        };

        let query = match object.get("query") {
            Some(Value::Object(query)) => flatten_query(query),
            _ => Vec::new(),
        };

        let mut headers = HeaderMap::new();
        for (key, value) in &object {
            if SKIPPED_KEYS.contains(&key.to_ascii_lowercase().as_str()) {
                continue;
            }
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            match (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(&rendered),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => debug!(header = %key, "Skipping envelope key that is not a valid header"),
            }
        }

        Ok(Self {
            body,
            query,
            headers,
        })
    }

    /// Merge the envelope's query into `target`
    ///
    /// Keys present in the envelope replace keys already on the target URL.
    pub fn apply_query(&self, target: &Url) -> Url {
        if self.query.is_empty() {
            return target.clone();
        }

        let mut url = target.clone();
        let kept: Vec<(String, String)> = target
            .query_pairs()
            .filter(|(k, _)| !self.query.iter().any(|(q, _)| q == k))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        url.query_pairs_mut()
            .clear()
            .extend_pairs(kept.iter().chain(self.query.iter()));
        url
    }
}

fn flatten_query(query: &Map<String, Value>) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for (key, value) in query {
        match value {
            Value::Array(items) => {
                pairs.extend(items.iter().map(|item| (key.clone(), render(item))));
            }
            other => pairs.push((key.clone(), render(other))),
        }
    }
    pairs
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
