// Copyright (c) 2025 - Cowboy AI, Inc.
//! CloudEvent envelope
//!
//! Publishers put structured-mode CloudEvents JSON on the stream. Before
//! delivery the event type is restored to its original form and the event is
//! converted to binary-mode HTTP: attributes become `ce-` headers and `data`
//! becomes the body. Events carrying `data_base64` are sent in structured mode
//! instead, as the body would otherwise need re-encoding.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Extension attribute carrying the event type before cleaning
pub const ORIGINAL_TYPE_EXTENSION: &str = "originaltype";

/// Content type of structured-mode bodies
pub const STRUCTURED_CONTENT_TYPE: &str = "application/cloudevents+json";

/// A CloudEvents 1.0 event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent {
    pub specversion: String,
    pub id: String,
    pub source: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataschema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_base64: Option<String>,
    #[serde(flatten)]
    pub extensions: BTreeMap<String, Value>,
}

impl CloudEvent {
    /// Decode a structured-mode JSON payload
    pub fn from_slice(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Extension value rendered as a header string
    pub fn extension(&self, name: &str) -> Option<String> {
        self.extensions.get(name).map(attribute_string)
    }

    /// Put back the type the publisher sent
    ///
    /// Prefers the original-type extension; otherwise strips
    /// `{prefix}.{source}.` from the type.
    pub fn restore_original_type(&mut self, prefix: &str) {
        if let Some(original) = self.extension(ORIGINAL_TYPE_EXTENSION) {
            if !original.is_empty() {
                self.event_type = original;
                return;
            }
        }
        let stem = format!("{}.{}.", prefix, self.source);
        if let Some(stripped) = self.event_type.strip_prefix(&stem) {
            self.event_type = stripped.to_string();
        }
    }

    /// Headers and body of the HTTP request delivering this event
    pub fn to_http_parts(&self) -> Result<(Vec<(String, String)>, Vec<u8>), serde_json::Error> {
        if self.data_base64.is_some() {
            let headers = vec![("content-type".to_string(), STRUCTURED_CONTENT_TYPE.to_string())];
            return Ok((headers, serde_json::to_vec(self)?));
        }

        let mut headers = vec![
            ("ce-specversion".to_string(), self.specversion.clone()),
            ("ce-id".to_string(), self.id.clone()),
            ("ce-source".to_string(), self.source.clone()),
            ("ce-type".to_string(), self.event_type.clone()),
        ];
        if let Some(subject) = &self.subject {
            headers.push(("ce-subject".to_string(), subject.clone()));
        }
        if let Some(schema) = &self.dataschema {
            headers.push(("ce-dataschema".to_string(), schema.clone()));
        }
        if let Some(time) = &self.time {
            headers.push(("ce-time".to_string(), time.to_rfc3339()));
        }
        for (name, value) in &self.extensions {
            headers.push((format!("ce-{}", name), attribute_string(value)));
        }

        let content_type = self
            .datacontenttype
            .clone()
            .unwrap_or_else(|| "application/json".to_string());
        let body = match &self.data {
            None => Vec::new(),
            Some(Value::String(text)) if !is_json(&content_type) => text.clone().into_bytes(),
            Some(value) => serde_json::to_vec(value)?,
        };
        headers.push(("content-type".to_string(), content_type));
        Ok((headers, body))
    }
}

fn is_json(content_type: &str) -> bool {
    let media = content_type.split(';').next().unwrap_or_default().trim();
    media == "application/json" || media.ends_with("+json") || media == "text/json"
}

fn attribute_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
