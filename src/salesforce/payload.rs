//! Request payloads and the typed values they carry.
//!
//! [`FieldValue`] is the one value type used both for query filters and for
//! record attribute maps. Each kind has fixed rendering rules per wire format.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};
use tokio_util::io::ReaderStream;

use crate::error::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// ContentType
// ─────────────────────────────────────────────────────────────────────────────

/// Wire format of a request or bulk job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentType {
    #[serde(rename = "JSON")]
    Json,
    #[serde(rename = "XML")]
    Xml,
    #[serde(rename = "CSV")]
    Csv,
    /// Zipped batches (legacy bulk only).
    #[serde(rename = "ZIP_JSON")]
    ZipJson,
    #[serde(rename = "ZIP_CSV")]
    ZipCsv,
    #[serde(rename = "ZIP_XML")]
    ZipXml,
}

impl ContentType {
    /// MIME type sent in `Content-Type` / `Accept`.
    pub fn mime(&self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Xml => "application/xml",
            ContentType::Csv => "text/csv",
            ContentType::ZipJson => "zip/json",
            ContentType::ZipCsv => "zip/csv",
            ContentType::ZipXml => "zip/xml",
        }
    }

    /// Name used in bulk job descriptors.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Json => "JSON",
            ContentType::Xml => "XML",
            ContentType::Csv => "CSV",
            ContentType::ZipJson => "ZIP_JSON",
            ContentType::ZipCsv => "ZIP_CSV",
            ContentType::ZipXml => "ZIP_XML",
        }
    }

    /// Parses a bulk descriptor name ("CSV", "JSON", ...).
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_uppercase().as_str() {
            "JSON" => Ok(ContentType::Json),
            "XML" => Ok(ContentType::Xml),
            "CSV" => Ok(ContentType::Csv),
            "ZIP_JSON" => Ok(ContentType::ZipJson),
            "ZIP_CSV" => Ok(ContentType::ZipCsv),
            "ZIP_XML" => Ok(ContentType::ZipXml),
            _ => Err(Error::UnsupportedContentType(name.to_string())),
        }
    }

    /// Returns true for the zipped batch formats.
    pub fn is_zipped(&self) -> bool {
        matches!(
            self,
            ContentType::ZipJson | ContentType::ZipCsv | ContentType::ZipXml
        )
    }

    /// Returns true if a `Content-Type` header value denotes XML.
    pub fn header_is_xml(value: &str) -> bool {
        let value = value.trim_start().to_ascii_lowercase();
        value.starts_with("application/xml") || value.starts_with("text/xml")
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FieldValue
// ─────────────────────────────────────────────────────────────────────────────

/// A typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    String(String),
    StringSet(Vec<String>),
    Bool(bool),
    Int(i64),
    IntSet(Vec<i64>),
    Float(f64),
    FloatSet(Vec<f64>),
    Timestamp(DateTime<Utc>),
}

/// Field name to value, iterated in sorted key order.
pub type Attributes = BTreeMap<String, FieldValue>;

/// Renders a timestamp as RFC3339 with second precision and a `Z` suffix.
pub(crate) fn rfc3339(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl FieldValue {
    /// Plain text form used in XML and CSV payloads.
    ///
    /// Collections are joined with `;`, the multi-select picklist separator.
    pub fn to_text(&self) -> String {
        match self {
            FieldValue::String(s) => s.clone(),
            FieldValue::StringSet(items) => items.join(";"),
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::Int(i) => i.to_string(),
            FieldValue::IntSet(items) => join_display(items, ";"),
            FieldValue::Float(f) => f.to_string(),
            FieldValue::FloatSet(items) => join_display(items, ";"),
            FieldValue::Timestamp(ts) => rfc3339(ts),
        }
    }
}

pub(crate) fn join_display<T: ToString>(items: &[T], sep: &str) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(sep)
}

impl Serialize for FieldValue {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            FieldValue::String(s) => serializer.serialize_str(s),
            FieldValue::StringSet(items) => items.serialize(serializer),
            FieldValue::Bool(b) => serializer.serialize_bool(*b),
            FieldValue::Int(i) => serializer.serialize_i64(*i),
            FieldValue::IntSet(items) => items.serialize(serializer),
            FieldValue::Float(f) => serializer.serialize_f64(*f),
            FieldValue::FloatSet(items) => items.serialize(serializer),
            FieldValue::Timestamp(ts) => serializer.serialize_str(&rfc3339(ts)),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Int(i64::from(value))
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        FieldValue::Timestamp(value)
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(value: Vec<String>) -> Self {
        FieldValue::StringSet(value)
    }
}

impl From<Vec<&str>> for FieldValue {
    fn from(value: Vec<&str>) -> Self {
        FieldValue::StringSet(value.into_iter().map(str::to_string).collect())
    }
}

impl From<Vec<i64>> for FieldValue {
    fn from(value: Vec<i64>) -> Self {
        FieldValue::IntSet(value)
    }
}

impl From<Vec<f64>> for FieldValue {
    fn from(value: Vec<f64>) -> Self {
        FieldValue::FloatSet(value)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Attribute encoding
// ─────────────────────────────────────────────────────────────────────────────

/// Serializes an attribute map to the given wire format.
pub fn encode_attributes(attrs: &Attributes, content_type: ContentType) -> Result<Bytes> {
    match content_type {
        ContentType::Json => serde_json::to_vec(attrs)
            .map(Bytes::from)
            .map_err(|e| Error::Internal(format!("Failed to serialize attributes: {}", e))),
        ContentType::Xml => Ok(Bytes::from(attributes_to_xml(attrs))),
        ContentType::Csv => attributes_to_csv(attrs).map(Bytes::from),
        ContentType::ZipJson | ContentType::ZipCsv | ContentType::ZipXml => Err(
            Error::UnsupportedContentType("attribute payloads cannot be zipped".to_string()),
        ),
    }
}

fn attributes_to_xml(attrs: &Attributes) -> String {
    let mut xml = String::from("<sObject>");
    for (name, value) in attrs {
        xml.push('<');
        xml.push_str(name);
        xml.push('>');
        xml.push_str(&quick_xml::escape::escape(value.to_text().as_str()));
        xml.push_str("</");
        xml.push_str(name);
        xml.push('>');
    }
    xml.push_str("</sObject>");
    xml
}

fn attributes_to_csv(attrs: &Attributes) -> Result<Vec<u8>> {
    let csv_err = |e: csv::Error| Error::Internal(format!("Failed to write CSV payload: {}", e));

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(attrs.keys()).map_err(csv_err)?;
    writer
        .write_record(attrs.values().map(FieldValue::to_text))
        .map_err(csv_err)?;
    writer
        .into_inner()
        .map_err(|e| Error::Internal(format!("Failed to flush CSV payload: {}", e.error())))
}

// ─────────────────────────────────────────────────────────────────────────────
// Payload
// ─────────────────────────────────────────────────────────────────────────────

/// Body of an outbound request.
///
/// Every variant can be turned into a body more than once so the executor
/// can reissue a call after a refresh.
#[derive(Debug, Clone, Default)]
pub enum Payload {
    #[default]
    Empty,
    Bytes(Bytes),
    /// Streamed from disk, reopened per attempt.
    File(PathBuf),
    Attributes(Attributes),
}

impl Payload {
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        serde_json::to_vec(value)
            .map(|v| Payload::Bytes(Bytes::from(v)))
            .map_err(|e| Error::Internal(format!("Failed to serialize request body: {}", e)))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Payload::Empty)
    }

    pub(crate) async fn to_body(&self, content_type: ContentType) -> Result<Option<reqwest::Body>> {
        match self {
            Payload::Empty => Ok(None),
            Payload::Bytes(bytes) => Ok(Some(reqwest::Body::from(bytes.clone()))),
            Payload::File(path) => {
                let file = tokio::fs::File::open(path).await?;
                Ok(Some(reqwest::Body::wrap_stream(ReaderStream::new(file))))
            }
            Payload::Attributes(attrs) => {
                encode_attributes(attrs, content_type).map(|b| Some(reqwest::Body::from(b)))
            }
        }
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Payload::Bytes(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(value))
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Bytes(Bytes::from(value))
    }
}

impl From<Attributes> for Payload {
    fn from(value: Attributes) -> Self {
        Payload::Attributes(value)
    }
}
