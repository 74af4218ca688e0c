//! Shared types used across SpaceGrid crates.

use std::collections::HashMap;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type PackageId = i64;
pub type VersionId = i64;
pub type InstallId = i64;
pub type SpaceId = i64;
pub type UserId = i64;
pub type CapabilityId = i64;
pub type SubscriptionId = i64;
pub type EventId = i64;
pub type TargetId = i64;

// ── HTTP shapes handed to package code ─────────────────────────────

/// Response produced by serving a space request.
///
/// Scripts write into this through [`HttpContext::response`]; static and
/// template routes build it directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(skip)]
    pub body: Bytes,
}

impl Default for SpaceResponse {
    fn default() -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }
}

impl SpaceResponse {
    pub fn new(status: u16, content_type: &str, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: vec![("content-type".into(), content_type.into())],
            body: body.into(),
        }
    }

    pub fn html(status: u16, body: impl Into<Bytes>) -> Self {
        Self::new(status, "text/html; charset=utf-8", body)
    }

    pub fn json(status: u16, value: &Value) -> Self {
        Self::new(status, "application/json", value.to_string())
    }

    pub fn text(status: u16, body: impl Into<Bytes>) -> Self {
        Self::new(status, "text/plain; charset=utf-8", body)
    }

    pub fn not_found() -> Self {
        Self::text(404, "not found")
    }

    /// Set (or replace) a header, matching names case-insensitively.
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_ascii_lowercase(), value.to_string()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Request context passed to the script runtime and used as the data model
/// for template rendering.
#[derive(Debug, Clone, Default)]
pub struct HttpContext {
    pub method: String,
    /// Path inside the space, always starting with `/`.
    pub path: String,
    pub query: HashMap<String, String>,
    /// Header names are lower-cased.
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    /// Path parameters bound by the route matcher.
    pub params: HashMap<String, String>,
    /// Free-form data set by the handler script, exposed to templates.
    pub data: Value,
    pub response: SpaceResponse,
}

impl HttpContext {
    pub fn new(method: &str, path: &str) -> Self {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        Self {
            method: method.to_ascii_uppercase(),
            path,
            ..Default::default()
        }
    }

    /// JSON view of the context used when rendering templates.
    pub fn template_model(&self) -> Value {
        serde_json::json!({
            "method": self.method,
            "path": self.path,
            "query": self.query,
            "headers": self.headers,
            "params": self.params,
            "data": self.data,
        })
    }
}

// ── LazyData ───────────────────────────────────────────────────────

/// Deferred-deserialization parameter bag.
///
/// HTTP handlers hand the raw body through untouched; capabilities decide
/// whether they want a map, a typed struct, or the bytes themselves.
#[derive(Debug, Clone)]
pub enum LazyData {
    Bytes(Bytes),
    Map(Map<String, Value>),
}

impl LazyData {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        LazyData::Bytes(bytes.into())
    }

    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => LazyData::Map(map),
            other => LazyData::Bytes(Bytes::from(other.to_string())),
        }
    }

    /// Decode as a JSON object. An empty body is an empty map.
    pub fn as_map(&self) -> Result<Map<String, Value>, serde_json::Error> {
        match self {
            LazyData::Map(map) => Ok(map.clone()),
            LazyData::Bytes(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Map::new()),
            LazyData::Bytes(bytes) => serde_json::from_slice(bytes),
        }
    }

    pub fn as_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match self {
            LazyData::Map(map) => serde_json::from_value(Value::Object(map.clone())),
            LazyData::Bytes(bytes) => serde_json::from_slice(bytes),
        }
    }

    pub fn as_bytes(&self) -> Result<Bytes, serde_json::Error> {
        match self {
            LazyData::Bytes(bytes) => Ok(bytes.clone()),
            LazyData::Map(map) => serde_json::to_vec(map).map(Bytes::from),
        }
    }
}
