//! Declarative site profiles and the generic extractor.
//!
//! A [`SiteProfile`] describes how to pull program fields out of one source's
//! payload: a record locator plus one [`FieldRule`] per field name. New
//! sources are added by editing the registry file, not by writing code.

use std::collections::BTreeMap;

use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "reu-extract";

/// Configuration for one source site or API.
#[derive(Debug, Clone, Deserialize)]
pub struct SiteProfile {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    pub payload: PayloadKind,
    /// CSS selector addressing record elements (html), or a JSON pointer
    /// addressing the records array (json).
    pub records: String,
    pub fields: BTreeMap<String, FieldRule>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    Html,
    Json,
}

/// How to extract one field, relative to a record element/value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldRule {
    /// Text of the first element matching `selector`.
    Text { selector: String },
    /// Texts of all elements matching `selector`, as a list.
    TextAll { selector: String },
    /// Attribute `attr` of the first element matching `selector`.
    Attr { selector: String, attr: String },
    /// Value at a JSON pointer relative to the record.
    Pointer { pointer: String },
    /// String items of the array at a JSON pointer relative to the record.
    PointerAll { pointer: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Text(String),
    List(Vec<String>),
}

impl RawValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            RawValue::Text(s) => Some(s),
            RawValue::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            RawValue::Text(_) => None,
            RawValue::List(items) => Some(items),
        }
    }
}

/// One candidate program as extracted: a mapping of field name to raw value.
/// Fields a rule found nothing for are simply absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub fields: BTreeMap<String, RawValue>,
}

impl CandidateRecord {
    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(RawValue::as_text)
    }

    pub fn list(&self, name: &str) -> Option<&[String]> {
        self.fields.get(name).and_then(RawValue::as_list)
    }

    pub fn set_text(&mut self, name: &str, value: impl Into<String>) {
        self.fields
            .insert(name.to_string(), RawValue::Text(value.into()));
    }

    pub fn set_list(&mut self, name: &str, values: Vec<String>) {
        self.fields.insert(name.to_string(), RawValue::List(values));
    }
}

/// Payload could not be interpreted as the structure the profile expects.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector `{selector}` in profile `{source_id}`: {message}")]
    Selector {
        source_id: String,
        selector: String,
        message: String,
    },
    #[error("payload for `{source_id}` is not valid JSON: {source}")]
    Json {
        source_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("records pointer `{pointer}` in profile `{source_id}` does not address an array")]
    RecordsPointer { source_id: String, pointer: String },
}

/// Run a profile against a raw payload. Zero records is a valid result;
/// the caller decides whether that deserves a warning.
pub fn extract(profile: &SiteProfile, payload: &str) -> Result<Vec<CandidateRecord>, ExtractError> {
    match profile.payload {
        PayloadKind::Html => extract_html(profile, payload),
        PayloadKind::Json => extract_json(profile, payload),
    }
}

fn parse_selector(profile: &SiteProfile, selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|err| ExtractError::Selector {
        source_id: profile.source_id.clone(),
        selector: selector.to_string(),
        message: err.to_string(),
    })
}

fn extract_html(
    profile: &SiteProfile,
    payload: &str,
) -> Result<Vec<CandidateRecord>, ExtractError> {
    let document = Html::parse_document(payload);
    let record_sel = parse_selector(profile, &profile.records)?;

    let mut records = Vec::new();
    for element in document.select(&record_sel) {
        let mut record = CandidateRecord::default();
        for (name, rule) in &profile.fields {
            match rule {
                FieldRule::Text { selector } => {
                    let sel = parse_selector(profile, selector)?;
                    if let Some(text) = first_text(element, &sel) {
                        record.set_text(name, text);
                    }
                }
                FieldRule::TextAll { selector } => {
                    let sel = parse_selector(profile, selector)?;
                    let texts = all_texts(element, &sel);
                    if !texts.is_empty() {
                        record.set_list(name, texts);
                    }
                }
                FieldRule::Attr { selector, attr } => {
                    let sel = parse_selector(profile, selector)?;
                    if let Some(value) = first_attr(element, &sel, attr) {
                        record.set_text(name, value);
                    }
                }
                // JSON rules are inert against an HTML payload; the field
                // simply stays absent.
                FieldRule::Pointer { .. } | FieldRule::PointerAll { .. } => {}
            }
        }
        records.push(record);
    }
    Ok(records)
}

fn first_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope
        .select(selector)
        .next()
        .and_then(|n| non_empty(n.text().collect::<String>()))
}

fn all_texts(scope: ElementRef<'_>, selector: &Selector) -> Vec<String> {
    scope
        .select(selector)
        .filter_map(|n| non_empty(n.text().collect::<String>()))
        .collect()
}

fn first_attr(scope: ElementRef<'_>, selector: &Selector, attr: &str) -> Option<String> {
    scope
        .select(selector)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| non_empty(s.to_string()))
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn extract_json(
    profile: &SiteProfile,
    payload: &str,
) -> Result<Vec<CandidateRecord>, ExtractError> {
    let value: JsonValue = serde_json::from_str(payload).map_err(|source| ExtractError::Json {
        source_id: profile.source_id.clone(),
        source,
    })?;

    let records_value = value
        .pointer(&profile.records)
        .ok_or_else(|| ExtractError::RecordsPointer {
            source_id: profile.source_id.clone(),
            pointer: profile.records.clone(),
        })?;
    let items = records_value
        .as_array()
        .ok_or_else(|| ExtractError::RecordsPointer {
            source_id: profile.source_id.clone(),
            pointer: profile.records.clone(),
        })?;

    let mut records = Vec::new();
    for item in items {
        let mut record = CandidateRecord::default();
        for (name, rule) in &profile.fields {
            match rule {
                FieldRule::Pointer { pointer } => {
                    if let Some(text) = item.pointer(pointer).and_then(scalar_to_string) {
                        record.set_text(name, text);
                    }
                }
                FieldRule::PointerAll { pointer } => {
                    let values = item
                        .pointer(pointer)
                        .and_then(JsonValue::as_array)
                        .map(|arr| {
                            arr.iter()
                                .filter_map(scalar_to_string)
                                .collect::<Vec<_>>()
                        })
                        .unwrap_or_default();
                    if !values.is_empty() {
                        record.set_list(name, values);
                    }
                }
                // HTML rules are inert against a JSON payload.
                FieldRule::Text { .. } | FieldRule::TextAll { .. } | FieldRule::Attr { .. } => {}
            }
        }
        records.push(record);
    }
    Ok(records)
}

fn scalar_to_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => non_empty(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Null | JsonValue::Array(_) | JsonValue::Object(_) => None,
    }
}
