//! Index, field, and item models.
//!
//! These types describe *what* is indexed. Storage layout is derived from
//! them by each backend (see [`crate::schema`]), and values flow from a
//! [`Datasource`](crate::datasource::Datasource) into a backend as
//! [`IndexedItem`]s.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SearchError};

/// Default length bound for string values (characters).
pub const DEFAULT_STRING_LENGTH: u32 = 255;

/// Composite item identifier: `datasource/source_id:language`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ItemId {
    pub datasource: String,
    pub source_id: String,
    pub language: String,
}

impl ItemId {
    pub fn new(
        datasource: impl Into<String>,
        source_id: impl Into<String>,
        language: impl Into<String>,
    ) -> Self {
        Self {
            datasource: datasource.into(),
            source_id: source_id.into(),
            language: language.into(),
        }
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.datasource, self.source_id, self.language)
    }
}

impl FromStr for ItemId {
    type Err = SearchError;

    fn from_str(s: &str) -> Result<Self> {
        let (datasource, rest) = s
            .split_once('/')
            .ok_or_else(|| SearchError::Config(format!("item id '{}' has no datasource", s)))?;
        let (source_id, language) = rest
            .rsplit_once(':')
            .ok_or_else(|| SearchError::Config(format!("item id '{}' has no language", s)))?;
        if datasource.is_empty() || source_id.is_empty() || language.is_empty() {
            return Err(SearchError::Config(format!("malformed item id '{}'", s)));
        }
        Ok(ItemId::new(datasource, source_id, language))
    }
}

impl TryFrom<String> for ItemId {
    type Error = SearchError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ItemId> for String {
    fn from(id: ItemId) -> Self {
        id.to_string()
    }
}

/// Declared type of an index field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// Tokenized fulltext.
    Text,
    String,
    Integer,
    Decimal,
    Boolean,
    /// Unix timestamp in seconds.
    Date,
}

impl FieldType {
    pub fn is_fulltext(self) -> bool {
        self == FieldType::Text
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Decimal => "decimal",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One field of an index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub multi_valued: bool,
    /// Dotted path into the source document. Defaults to the field name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_path: Option<String>,
    /// Relevance multiplier for fulltext fields.
    #[serde(default = "default_boost")]
    pub boost: f64,
    /// Maximum characters kept for string values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,
}

fn default_boost() -> f64 {
    1.0
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            multi_valued: false,
            property_path: None,
            boost: 1.0,
            max_length: None,
        }
    }

    pub fn multi(mut self) -> Self {
        self.multi_valued = true;
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.property_path = Some(path.into());
        self
    }

    pub fn with_boost(mut self, boost: f64) -> Self {
        self.boost = boost;
        self
    }

    pub fn with_max_length(mut self, len: u32) -> Self {
        self.max_length = Some(len);
        self
    }

    pub fn path(&self) -> &str {
        self.property_path.as_deref().unwrap_or(&self.name)
    }

    pub fn max_chars(&self) -> usize {
        self.max_length.unwrap_or(DEFAULT_STRING_LENGTH) as usize
    }

    /// String fields longer than the default bound get an unbounded column.
    pub fn is_long(&self) -> bool {
        self.field_type == FieldType::String && self.max_chars() > DEFAULT_STRING_LENGTH as usize
    }

    /// Whether switching from `other` to `self` requires recreating storage.
    pub fn storage_differs(&self, other: &Field) -> bool {
        self.field_type != other.field_type
            || self.multi_valued != other.multi_valued
            || self.is_long() != other.is_long()
    }
}

/// Per-index tuning options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexOptions {
    /// Items indexed per batch during an indexing pass.
    #[serde(default = "default_cron_limit")]
    pub cron_limit: usize,
}

fn default_cron_limit() -> usize {
    50
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self { cron_limit: 50 }
    }
}

/// A search index definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDef {
    pub id: String,
    /// Id of the server whose backend stores this index.
    pub server: String,
    /// Id of the datasource providing items.
    pub datasource: String,
    pub fields: Vec<Field>,
    #[serde(default)]
    pub options: IndexOptions,
}

impl IndexDef {
    pub fn new(
        id: impl Into<String>,
        server: impl Into<String>,
        datasource: impl Into<String>,
        fields: Vec<Field>,
    ) -> Self {
        Self {
            id: id.into(),
            server: server.into(),
            datasource: datasource.into(),
            fields,
            options: IndexOptions::default(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Look up a field, failing with [`SearchError::UnknownField`].
    pub fn require_field(&self, name: &str) -> Result<&Field> {
        self.field(name).ok_or_else(|| SearchError::UnknownField {
            index: self.id.clone(),
            field: name.to_string(),
        })
    }

    pub fn fulltext_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.field_type.is_fulltext())
    }

    /// Whether stored rows written under `previous` are invalid under `self`.
    pub fn needs_reindex_from(&self, previous: &IndexDef) -> bool {
        self.fields != previous.fields || self.datasource != previous.datasource
    }

    /// Check the definition can be mapped onto storage.
    pub fn validate(&self) -> Result<()> {
        if !valid_identifier(&self.id) {
            return Err(SearchError::Schema(format!(
                "index id '{}' must be non-empty and contain only [A-Za-z0-9_-]",
                self.id
            )));
        }
        let mut seen = HashSet::new();
        for field in &self.fields {
            if !valid_identifier(&field.name) {
                return Err(SearchError::Schema(format!(
                    "field name '{}' on index '{}' must contain only [A-Za-z0-9_-]",
                    field.name, self.id
                )));
            }
            if !seen.insert(field.name.to_lowercase()) {
                return Err(SearchError::Schema(format!(
                    "duplicate field '{}' on index '{}'",
                    field.name, self.id
                )));
            }
            if field.field_type.is_fulltext() && !(field.boost > 0.0 && field.boost.is_finite()) {
                return Err(SearchError::Schema(format!(
                    "field '{}' needs a positive boost",
                    field.name
                )));
            }
            if field.max_length.is_some() && field.field_type != FieldType::String {
                return Err(SearchError::Schema(format!(
                    "max_length is only valid on string fields ('{}' is {})",
                    field.name, field.field_type
                )));
            }
            if field.max_length == Some(0) {
                return Err(SearchError::Schema(format!(
                    "max_length of '{}' must be > 0",
                    field.name
                )));
            }
        }
        Ok(())
    }
}

fn valid_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// A single stored value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// String and fulltext content.
    Text(String),
    Integer(i64),
    Decimal(f64),
    Boolean(bool),
    /// Unix timestamp in seconds.
    Date(i64),
}

impl FieldValue {
    /// Parse a textual value (CLI filters, config) for a field type.
    pub fn parse_for(field_type: FieldType, raw: &str) -> Result<FieldValue> {
        let bad = || {
            SearchError::InvalidQuery(format!("'{}' is not a valid {} value", raw, field_type))
        };
        Ok(match field_type {
            FieldType::Text | FieldType::String => FieldValue::Text(raw.to_string()),
            FieldType::Integer => FieldValue::Integer(raw.trim().parse().map_err(|_| bad())?),
            FieldType::Decimal => FieldValue::Decimal(raw.trim().parse().map_err(|_| bad())?),
            FieldType::Boolean => match raw.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" => FieldValue::Boolean(true),
                "0" | "false" | "no" => FieldValue::Boolean(false),
                _ => return Err(bad()),
            },
            FieldType::Date => FieldValue::Date(parse_date(raw).ok_or_else(bad)?),
        })
    }

    /// Convert a JSON value from a source document. Returns `None` for
    /// nulls and values that cannot represent the field type.
    pub fn from_json(field_type: FieldType, value: &serde_json::Value) -> Option<FieldValue> {
        use serde_json::Value;
        match (field_type, value) {
            (_, Value::Null) => None,
            (FieldType::Text | FieldType::String, Value::String(s)) => {
                Some(FieldValue::Text(s.clone()))
            }
            (FieldType::Text | FieldType::String, Value::Number(n)) => {
                Some(FieldValue::Text(n.to_string()))
            }
            (FieldType::Text | FieldType::String, Value::Bool(b)) => {
                Some(FieldValue::Text(b.to_string()))
            }
            (FieldType::Integer, Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
                .map(FieldValue::Integer),
            (FieldType::Decimal, Value::Number(n)) => n.as_f64().map(FieldValue::Decimal),
            (FieldType::Boolean, Value::Bool(b)) => Some(FieldValue::Boolean(*b)),
            (FieldType::Boolean, Value::Number(n)) => n.as_i64().map(|i| FieldValue::Boolean(i != 0)),
            (FieldType::Date, Value::Number(n)) => n.as_i64().map(FieldValue::Date),
            (FieldType::Integer | FieldType::Decimal | FieldType::Boolean | FieldType::Date, Value::String(s)) => {
                FieldValue::parse_for(field_type, s).ok()
            }
            _ => None,
        }
    }

    /// The value as it appears inside a facet filter, without quotes.
    pub fn filter_string(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Integer(i) | FieldValue::Date(i) => i.to_string(),
            FieldValue::Decimal(f) => f.to_string(),
            FieldValue::Boolean(b) => if *b { "1" } else { "0" }.to_string(),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(i) | FieldValue::Date(i) => Some(*i as f64),
            FieldValue::Decimal(f) => Some(*f),
            FieldValue::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            FieldValue::Text(_) => None,
        }
    }

    /// Total-ish ordering used by in-memory evaluation. Numeric kinds compare
    /// numerically with each other; text compares bytewise.
    pub fn compare(&self, other: &FieldValue) -> Option<Ordering> {
        match (self, other) {
            (FieldValue::Text(a), FieldValue::Text(b)) => Some(a.cmp(b)),
            (FieldValue::Integer(a), FieldValue::Integer(b))
            | (FieldValue::Date(a), FieldValue::Date(b)) => Some(a.cmp(b)),
            (a, b) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        }
    }
}

/// Parse `YYYY-MM-DD`, RFC 3339, or a raw unix timestamp.
fn parse_date(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(ts) = raw.parse::<i64>() {
        return Some(ts);
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp());
    }
    chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp())
}

/// Field values extracted for one item, keyed by field name.
pub type ItemValues = BTreeMap<String, Vec<FieldValue>>;

/// An item ready to be written by a backend.
#[derive(Debug, Clone)]
pub struct IndexedItem {
    pub id: ItemId,
    pub values: ItemValues,
}

impl IndexedItem {
    pub fn new(id: ItemId, values: ItemValues) -> Self {
        Self { id, values }
    }

    /// Values for a field, deduplicated for multi-valued storage and cut to
    /// one value for single-valued storage. String values are truncated to
    /// the field's length bound.
    pub fn values_for(&self, field: &Field) -> Vec<FieldValue> {
        let raw = match self.values.get(&field.name) {
            Some(v) => v,
            None => return Vec::new(),
        };
        let mut out: Vec<FieldValue> = Vec::new();
        for value in raw {
            let value = match (field.field_type, value) {
                (FieldType::String, FieldValue::Text(s)) => {
                    FieldValue::Text(s.chars().take(field.max_chars()).collect())
                }
                (_, v) => v.clone(),
            };
            if !out.contains(&value) {
                out.push(value);
            }
        }
        if !field.multi_valued && !field.field_type.is_fulltext() {
            out.truncate(1);
        }
        out
    }
}
