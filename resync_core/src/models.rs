use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Provider-native field map.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// One pagination step's worth of records.
pub type Page = Vec<RawRecord>;

/// Class of entity synchronized independently (one resync pass per provider and kind).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceKind {
    Group,
    Project,
    Folder,
    MergeRequest,
    Issue,
    Job,
    Pipeline,
    Service,
    Incident,
    Control,
    ServiceTicket,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 11] = [
        ResourceKind::Group,
        ResourceKind::Project,
        ResourceKind::Folder,
        ResourceKind::MergeRequest,
        ResourceKind::Issue,
        ResourceKind::Job,
        ResourceKind::Pipeline,
        ResourceKind::Service,
        ResourceKind::Incident,
        ResourceKind::Control,
        ResourceKind::ServiceTicket,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Group => "group",
            ResourceKind::Project => "project",
            ResourceKind::Folder => "folder",
            ResourceKind::MergeRequest => "mergeRequest",
            ResourceKind::Issue => "issue",
            ResourceKind::Job => "job",
            ResourceKind::Pipeline => "pipeline",
            ResourceKind::Service => "service",
            ResourceKind::Incident => "incident",
            ResourceKind::Control => "control",
            ResourceKind::ServiceTicket => "serviceTicket",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        ResourceKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::InvalidInput(format!("unknown resource kind '{s}'")))
    }
}

/// A provider-native record. Identity lives in a kind-specific field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(Fields);

impl RawRecord {
    pub fn new(fields: Fields) -> Self {
        Self(fields)
    }

    /// Build a record from a JSON value; anything but an object is rejected.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Object(map) => Ok(Self(map)),
            other => Err(Error::InvalidInput(format!(
                "raw record must be a JSON object, got {}",
                json_type_name(&other)
            ))),
        }
    }

    /// Build a record holding only its identity field. The value keeps its JSON type.
    pub fn identity(id_field: &str, id: impl Into<serde_json::Value>) -> Self {
        let mut fields = Fields::new();
        fields.insert(id_field.to_string(), id.into());
        Self(fields)
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn into_value(self) -> serde_json::Value {
        serde_json::Value::Object(self.0)
    }

    /// Attach a derived field (e.g. the parent snapshot) unless the key is already taken.
    pub fn tag(mut self, key: &str, value: serde_json::Value) -> Self {
        self.0.entry(key.to_string()).or_insert(value);
        self
    }

    /// Identity rendered as a string (numbers are accepted, as most providers use them).
    pub fn id(&self, id_field: &str) -> Option<String> {
        value_as_id(self.0.get(id_field)?)
    }

    /// Add enrichment fields. Existing fields are never overwritten: a colliding key is an error.
    pub fn augment(mut self, extra: Fields) -> Result<Self> {
        if let Some(key) = extra.keys().find(|k| self.0.contains_key(k.as_str())) {
            return Err(Error::InvalidInput(format!(
                "enrichment field '{key}' would overwrite an existing record field"
            )));
        }
        self.0.extend(extra);
        Ok(self)
    }
}

impl From<Fields> for RawRecord {
    fn from(fields: Fields) -> Self {
        Self(fields)
    }
}

/// Decode a list response: an array of objects (`null` reads as an empty page).
pub fn records_from_value(value: serde_json::Value) -> Result<Page> {
    match value {
        serde_json::Value::Array(items) => items.into_iter().map(RawRecord::from_value).collect(),
        serde_json::Value::Null => Ok(Vec::new()),
        other => Err(Error::InvalidInput(format!(
            "expected a JSON array of records, got {}",
            json_type_name(&other)
        ))),
    }
}

/// Render a scalar JSON value as an identifier.
pub fn value_as_id(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Downstream-sized chunk of records. Only the last batch of a pass may be short.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Batch {
    pub kind: ResourceKind,
    /// 0-based emission index within the pass.
    pub seq: u64,
    pub records: Vec<RawRecord>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// An inbound provider webhook: parsed JSON body plus lower-cased headers.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    pub provider: String,
    pub headers: BTreeMap<String, String>,
    pub body: serde_json::Value,
}

impl WebhookEvent {
    pub fn new(provider: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            provider: provider.into(),
            headers: BTreeMap::new(),
            body,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_parses_wire_names() {
        assert_eq!(
            "mergeRequest".parse::<ResourceKind>().unwrap(),
            ResourceKind::MergeRequest
        );
        assert_eq!(
            "SERVICETICKET".parse::<ResourceKind>().unwrap(),
            ResourceKind::ServiceTicket
        );
        assert!("repository".parse::<ResourceKind>().is_err());
        assert_eq!(
            serde_json::to_value(ResourceKind::ServiceTicket).unwrap(),
            json!("serviceTicket")
        );
    }

    #[test]
    fn id_accepts_strings_and_numbers() {
        let rec = RawRecord::from_value(json!({"id": 42, "key": "PRJ-1"})).unwrap();
        assert_eq!(rec.id("id").as_deref(), Some("42"));
        assert_eq!(rec.id("key").as_deref(), Some("PRJ-1"));
        assert_eq!(rec.id("missing"), None);
    }

    #[test]
    fn augment_never_overwrites() {
        let rec = RawRecord::from_value(json!({"id": 1, "name": "a"})).unwrap();
        let mut extra = Fields::new();
        extra.insert("__languages".into(), json!({"Rust": 100.0}));
        let rec = rec.augment(extra).unwrap();
        assert_eq!(rec.get("name"), Some(&json!("a")));
        assert_eq!(rec.get("__languages"), Some(&json!({"Rust": 100.0})));

        let mut clash = Fields::new();
        clash.insert("id".into(), json!(2));
        assert!(rec.augment(clash).is_err());
    }

    #[test]
    fn tag_keeps_existing_fields() {
        let rec = RawRecord::from_value(json!({"id": 1, "__project": "kept"})).unwrap();
        let rec = rec.tag("__project", json!("ignored")).tag("__extra", json!(true));
        assert_eq!(rec.get("__project"), Some(&json!("kept")));
        assert_eq!(rec.get("__extra"), Some(&json!(true)));
    }

    #[test]
    fn list_responses_decode_to_pages() {
        assert_eq!(records_from_value(json!([{"id": 1}, {"id": 2}])).unwrap().len(), 2);
        assert!(records_from_value(json!(null)).unwrap().is_empty());
        assert!(records_from_value(json!({"id": 1})).is_err());
        assert!(records_from_value(json!([1])).is_err());
    }

    #[test]
    fn non_object_payload_is_rejected() {
        assert!(RawRecord::from_value(json!([1, 2])).is_err());
    }
}
