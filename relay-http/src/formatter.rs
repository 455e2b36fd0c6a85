//! Content formatters.
//!
//! A formatter converts between wire bytes of one family of media types and
//! a `serde_json::Value`; typed content and results go through serde on
//! either side of that value.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::response::Response;
use crate::{HttpClientError, Result};

/// Encodes and decodes one family of media types.
pub trait Formatter: Send + Sync {
    /// Media types this formatter handles, preferred first.
    fn media_types(&self) -> &[&'static str];

    /// Whether this formatter handles `media_type` (already lowercased,
    /// without parameters).
    fn supports(&self, media_type: &str) -> bool {
        self.media_types().contains(&media_type)
    }

    /// Encode a value.
    fn write(&self, value: &Value) -> Result<Bytes>;

    /// Decode bytes.
    fn read(&self, bytes: &[u8]) -> Result<Value>;
}

/// `application/json` and `+json` media types.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFormatter;

impl Formatter for JsonFormatter {
    fn media_types(&self) -> &[&'static str] {
        &["application/json"]
    }

    fn supports(&self, media_type: &str) -> bool {
        media_type == "application/json" || media_type.ends_with("+json")
    }

    fn write(&self, value: &Value) -> Result<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| HttpClientError::Serialization(e.to_string()))
    }

    fn read(&self, bytes: &[u8]) -> Result<Value> {
        serde_json::from_slice(bytes).map_err(|e| HttpClientError::Serialization(e.to_string()))
    }
}

/// `application/x-www-form-urlencoded`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormFormatter;

impl Formatter for FormFormatter {
    fn media_types(&self) -> &[&'static str] {
        &["application/x-www-form-urlencoded"]
    }

    fn write(&self, value: &Value) -> Result<Bytes> {
        serde_urlencoded::to_string(value)
            .map(Bytes::from)
            .map_err(|e| HttpClientError::Serialization(e.to_string()))
    }

    fn read(&self, bytes: &[u8]) -> Result<Value> {
        let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(bytes)
            .map_err(|e| HttpClientError::Serialization(e.to_string()))?;
        Ok(Value::Object(
            pairs
                .into_iter()
                .map(|(key, value)| (key, Value::String(value)))
                .collect(),
        ))
    }
}

/// Any `text/*` media type.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextFormatter;

impl Formatter for TextFormatter {
    fn media_types(&self) -> &[&'static str] {
        &["text/plain"]
    }

    fn supports(&self, media_type: &str) -> bool {
        media_type.starts_with("text/")
    }

    fn write(&self, value: &Value) -> Result<Bytes> {
        Ok(match value {
            Value::String(text) => Bytes::from(text.clone()),
            Value::Null => Bytes::new(),
            other => Bytes::from(other.to_string()),
        })
    }

    fn read(&self, bytes: &[u8]) -> Result<Value> {
        Ok(Value::String(String::from_utf8_lossy(bytes).into_owned()))
    }
}

/// Lowercased media type without parameters.
fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Ordered set of formatters, selected by media type.
#[derive(Clone)]
pub struct Formatters {
    formatters: Vec<Arc<dyn Formatter>>,
    default_media_type: String,
}

impl Default for Formatters {
    fn default() -> Self {
        Self {
            formatters: vec![
                Arc::new(JsonFormatter),
                Arc::new(FormFormatter),
                Arc::new(TextFormatter),
            ],
            default_media_type: "application/json".to_string(),
        }
    }
}

impl Formatters {
    /// Create an empty set.
    pub fn empty(default_media_type: impl Into<String>) -> Self {
        Self {
            formatters: Vec::new(),
            default_media_type: default_media_type.into(),
        }
    }

    /// Add a formatter; it is consulted before the existing ones.
    pub fn push(&mut self, formatter: Arc<dyn Formatter>) {
        self.formatters.insert(0, formatter);
    }

    /// Media type assumed for responses without a content type.
    pub fn default_media_type(&self) -> &str {
        &self.default_media_type
    }

    pub(crate) fn set_default_media_type(&mut self, media_type: impl Into<String>) {
        self.default_media_type = media_type.into();
    }

    /// Find the formatter for a content type.
    pub fn find(&self, content_type: &str) -> Result<&dyn Formatter> {
        let media_type = essence(content_type);
        self.formatters
            .iter()
            .find(|formatter| formatter.supports(&media_type))
            .map(|formatter| formatter.as_ref())
            .ok_or(HttpClientError::UnsupportedMediaType(media_type))
    }

    /// `Accept` header value listing every supported media type.
    pub fn accept_header(&self) -> String {
        self.formatters
            .iter()
            .flat_map(|formatter| formatter.media_types().iter().copied())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Encode content for the given content type.
    pub fn create_content<T: Serialize + ?Sized>(
        &self,
        value: &T,
        content_type: &str,
    ) -> Result<Bytes> {
        let formatter = self.find(content_type)?;
        let value =
            serde_json::to_value(value).map_err(|e| HttpClientError::Serialization(e.to_string()))?;
        formatter.write(&value)
    }

    /// Decode a response body into `T`. An empty body reads as `null`.
    pub fn deserialize<T: DeserializeOwned>(&self, response: &Response) -> Result<T> {
        let value = if response.bytes().is_empty() {
            Value::Null
        } else {
            let content_type = response
                .content_type()
                .unwrap_or(self.default_media_type.as_str());
            self.find(content_type)?.read(response.bytes())?
        };
        serde_json::from_value(value).map_err(|e| HttpClientError::Serialization(e.to_string()))
    }
}

impl fmt::Debug for Formatters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Formatters")
            .field("accept", &self.accept_header())
            .field("default_media_type", &self.default_media_type)
            .finish()
    }
}

/// Conversion of a response into a call's result or error type.
pub trait Decode: Sized + Send + Sync + 'static {
    /// Decode `response`.
    fn decode(response: &Response, formatters: &Formatters) -> Result<Self>;
}

impl<T: DeserializeOwned + Send + Sync + 'static> Decode for T {
    fn decode(response: &Response, formatters: &Formatters) -> Result<Self> {
        formatters.deserialize(response)
    }
}

impl Decode for Response {
    fn decode(response: &Response, _formatters: &Formatters) -> Result<Self> {
        Ok(response.clone())
    }
}
