//! Metadata filter predicates.
//!
//! A [`MetadataFilter`] selects candidate documents by their index metadata
//! before any strategy runs. Filters serialize as tagged JSON objects
//! (`{"op": "eq", "key": "team", "value": "infra"}`), and additionally
//! accept a plain object shorthand where every pair is an equality clause:
//!
//! ```rust
//! use memory_agent_core::filter::MetadataFilter;
//!
//! let f: MetadataFilter = serde_json::from_str(r#"{"team": "infra", "year": 2024}"#).unwrap();
//! assert!(matches!(f, MetadataFilter::And { .. }));
//! ```
//!
//! An object is read as tagged only when its `op` field names a known
//! operator; otherwise `op` is treated as an ordinary metadata key.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::models::{Metadata, MetadataValue};

/// A predicate over document metadata.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MetadataFilter {
    /// Matches every document.
    #[default]
    All,
    Eq {
        key: String,
        value: MetadataValue,
    },
    In {
        key: String,
        values: Vec<MetadataValue>,
    },
    /// List membership, or substring for text values.
    Contains {
        key: String,
        value: MetadataValue,
    },
    Exists {
        key: String,
    },
    Not {
        filter: Box<MetadataFilter>,
    },
    And {
        filters: Vec<MetadataFilter>,
    },
    Or {
        filters: Vec<MetadataFilter>,
    },
}

const OPERATORS: &[&str] = &["all", "eq", "in", "contains", "exists", "not", "and", "or"];

impl MetadataFilter {
    pub fn eq(key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        MetadataFilter::Eq {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Conjunction of equality clauses; an empty list matches everything.
    pub fn all_of(clauses: Vec<(String, MetadataValue)>) -> Self {
        let mut filters: Vec<MetadataFilter> = clauses
            .into_iter()
            .map(|(key, value)| MetadataFilter::Eq { key, value })
            .collect();
        match filters.len() {
            0 => MetadataFilter::All,
            1 => filters.remove(0),
            _ => MetadataFilter::And { filters },
        }
    }

    /// Evaluate the predicate against one document's metadata.
    pub fn matches(&self, metadata: &Metadata) -> bool {
        match self {
            MetadataFilter::All => true,
            MetadataFilter::Eq { key, value } => metadata
                .get(key)
                .is_some_and(|v| match v {
                    MetadataValue::List(_) => v.contains(value),
                    _ => v.loosely_equals(value),
                }),
            MetadataFilter::In { key, values } => metadata
                .get(key)
                .is_some_and(|v| values.iter().any(|candidate| v.loosely_equals(candidate))),
            MetadataFilter::Contains { key, value } => {
                metadata.get(key).is_some_and(|v| v.contains(value))
            }
            MetadataFilter::Exists { key } => {
                metadata.get(key).is_some_and(|v| *v != MetadataValue::Null)
            }
            MetadataFilter::Not { filter } => !filter.matches(metadata),
            MetadataFilter::And { filters } => filters.iter().all(|f| f.matches(metadata)),
            MetadataFilter::Or { filters } => filters.iter().any(|f| f.matches(metadata)),
        }
    }
}

impl<'de> Deserialize<'de> for MetadataFilter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        MetadataFilter::try_from(value).map_err(serde::de::Error::custom)
    }
}

impl TryFrom<Value> for MetadataFilter {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Null => Ok(MetadataFilter::All),
            Value::Object(map) => {
                if let Some(Value::String(op)) = map.get("op") {
                    if OPERATORS.contains(&op.as_str()) {
                        let op = op.clone();
                        return parse_tagged(&op, map);
                    }
                }
                let clauses = map
                    .into_iter()
                    .map(|(key, v)| {
                        serde_json::from_value::<MetadataValue>(v)
                            .map(|value| (key, value))
                            .map_err(|e| e.to_string())
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(MetadataFilter::all_of(clauses))
            }
            other => Err(format!("filter must be a JSON object, got {other}")),
        }
    }
}

fn parse_tagged(op: &str, mut map: Map<String, Value>) -> Result<MetadataFilter, String> {
    Ok(match op {
        "all" => MetadataFilter::All,
        "eq" => MetadataFilter::Eq {
            key: field(&mut map, "key")?,
            value: field(&mut map, "value")?,
        },
        "in" => MetadataFilter::In {
            key: field(&mut map, "key")?,
            values: field(&mut map, "values")?,
        },
        "contains" => MetadataFilter::Contains {
            key: field(&mut map, "key")?,
            value: field(&mut map, "value")?,
        },
        "exists" => MetadataFilter::Exists {
            key: field(&mut map, "key")?,
        },
        "not" => {
            let inner = map
                .remove("filter")
                .ok_or_else(|| "filter 'not' is missing field 'filter'".to_string())?;
            MetadataFilter::Not {
                filter: Box::new(MetadataFilter::try_from(inner)?),
            }
        }
        "and" | "or" => {
            let items: Vec<Value> = field(&mut map, "filters")?;
            let filters = items
                .into_iter()
                .map(MetadataFilter::try_from)
                .collect::<Result<Vec<_>, _>>()?;
            if op == "and" {
                MetadataFilter::And { filters }
            } else {
                MetadataFilter::Or { filters }
            }
        }
        other => return Err(format!("unknown filter operator '{other}'")),
    })
}

fn field<T: DeserializeOwned>(map: &mut Map<String, Value>, name: &str) -> Result<T, String> {
    let value = map
        .remove(name)
        .ok_or_else(|| format!("filter is missing field '{name}'"))?;
    serde_json::from_value(value).map_err(|e| format!("filter field '{name}': {e}"))
}

/// Parse a `key=value` assignment from the command line.
///
/// The value is read as JSON when it parses (`n=3`, `tags=["a","b"]`,
/// `draft=true`), and as a plain string otherwise.
pub fn parse_assignment(raw: &str) -> Result<(String, MetadataValue), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    let value = serde_json::from_str::<MetadataValue>(value)
        .unwrap_or_else(|_| MetadataValue::Text(value.to_string()));
    Ok((key.to_string(), value))
}
