//! Closed set of partial-document mutations
//!
//! Every mutation is a pure function over a JSON document, so any backend
//! with read-modify-write semantics can support the full set by loading the
//! source, calling [`ListMutation::apply`] and writing back when it reports a
//! change. All mutations are idempotent: applying one twice leaves the
//! document as applying it once did.
//!
//! Timestamps are stored as epoch milliseconds.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::IndexError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ListMutation {
    /// Append `element` unless an element with the same `key_field` value is
    /// already present. With `max_len`, the oldest elements are evicted first.
    Append {
        list_field: String,
        key_field: String,
        element: Value,
        max_len: Option<usize>,
    },
    /// Drop every element whose `key_field` equals `key`
    Remove {
        list_field: String,
        key_field: String,
        key: Value,
    },
    /// Set `field` on the element whose `key_field` equals `key`
    UpdateElement {
        list_field: String,
        key_field: String,
        key: Value,
        field: String,
        value: Value,
    },
    /// Append a timestamp and prune entries older than the retention window
    AddTimestamp {
        field: String,
        timestamp: DateTime<Utc>,
        retention_days: u32,
    },
    /// Replace a top-level scalar field
    SetField { field: String, value: Value },
}

impl ListMutation {
    pub fn name(&self) -> &'static str {
        match self {
            ListMutation::Append { .. } => "append_to_list",
            ListMutation::Remove { .. } => "remove_from_list",
            ListMutation::UpdateElement { .. } => "update_list_element",
            ListMutation::AddTimestamp { .. } => "add_timestamp",
            ListMutation::SetField { .. } => "set_field",
        }
    }

    /// Reject mutations that could never apply to any document.
    pub fn validate(&self) -> Result<(), IndexError> {
        match self {
            ListMutation::Append {
                key_field,
                element,
                max_len,
                ..
            } => {
                if *max_len == Some(0) {
                    return Err(IndexError::InvalidInput(
                        "max_len must be at least 1".to_string(),
                    ));
                }
                if element_key(element, key_field).is_none() {
                    return Err(IndexError::InvalidInput(format!(
                        "element has no identity key '{}'",
                        key_field
                    )));
                }
                Ok(())
            }
            ListMutation::SetField { field, .. } | ListMutation::AddTimestamp { field, .. }
                if field.is_empty() =>
            {
                Err(IndexError::InvalidInput("field name is empty".to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Apply to `doc` in place. Returns `true` if the document changed.
    ///
    /// `now` anchors the retention window of [`ListMutation::AddTimestamp`].
    pub fn apply(&self, doc_id: &str, doc: &mut Value, now: DateTime<Utc>) -> Result<bool, IndexError> {
        self.validate()?;
        let fields = doc.as_object_mut().ok_or_else(|| IndexError::MalformedDocument {
            id: doc_id.to_string(),
            reason: "document is not a JSON object".to_string(),
        })?;

        match self {
            ListMutation::Append {
                list_field,
                key_field,
                element,
                max_len,
            } => {
                let list = list_mut(fields, list_field, doc_id, true)?;
                let Some(list) = list else { return Ok(false) };
                let key = element_key(element, key_field);
                if list.iter().any(|e| element_key(e, key_field) == key) {
                    return Ok(false);
                }
                if let Some(max_len) = max_len {
                    let keep = max_len.saturating_sub(1);
                    if list.len() > keep {
                        let evict = list.len() - keep;
                        list.drain(..evict);
                    }
                }
                list.push(element.clone());
                Ok(true)
            }
            ListMutation::Remove {
                list_field,
                key_field,
                key,
            } => {
                let Some(list) = list_mut(fields, list_field, doc_id, false)? else {
                    return Ok(false);
                };
                let before = list.len();
                list.retain(|e| element_key(e, key_field) != Some(key));
                Ok(list.len() != before)
            }
            ListMutation::UpdateElement {
                list_field,
                key_field,
                key,
                field,
                value,
            } => {
                let Some(list) = list_mut(fields, list_field, doc_id, false)? else {
                    return Ok(false);
                };
                let mut changed = false;
                for element in list
                    .iter_mut()
                    .filter(|e| element_key(e, key_field) == Some(key))
                {
                    if let Some(obj) = element.as_object_mut() {
                        if obj.get(field) != Some(value) {
                            obj.insert(field.clone(), value.clone());
                            changed = true;
                        }
                    }
                }
                Ok(changed)
            }
            ListMutation::AddTimestamp {
                field,
                timestamp,
                retention_days,
            } => {
                let cutoff = (now - Duration::days(i64::from(*retention_days))).timestamp_millis();
                let Some(list) = list_mut(fields, field, doc_id, true)? else {
                    return Ok(false);
                };
                let mut millis = Vec::with_capacity(list.len() + 1);
                for entry in list.iter() {
                    let ms = entry.as_i64().ok_or_else(|| IndexError::MalformedDocument {
                        id: doc_id.to_string(),
                        reason: format!("'{}' holds a non-integer timestamp", field),
                    })?;
                    millis.push(ms);
                }

                let ts = timestamp.timestamp_millis();
                let mut next: Vec<i64> = millis.iter().copied().filter(|ms| *ms >= cutoff).collect();
                if ts >= cutoff && !next.contains(&ts) {
                    next.push(ts);
                }
                if next == millis {
                    return Ok(false);
                }
                *list = next.into_iter().map(Value::from).collect();
                Ok(true)
            }
            ListMutation::SetField { field, value } => {
                if fields.get(field) == Some(value) {
                    return Ok(false);
                }
                fields.insert(field.clone(), value.clone());
                Ok(true)
            }
        }
    }
}

fn element_key<'a>(element: &'a Value, key_field: &str) -> Option<&'a Value> {
    element.get(key_field).filter(|v| !v.is_null())
}

/// Borrow `field` as an array. A missing or null field is created when
/// `create` is set and reported as `None` otherwise.
fn list_mut<'a>(
    fields: &'a mut Map<String, Value>,
    field: &str,
    doc_id: &str,
    create: bool,
) -> Result<Option<&'a mut Vec<Value>>, IndexError> {
    let missing = fields.get(field).map_or(true, Value::is_null);
    if missing {
        if !create {
            return Ok(None);
        }
        fields.insert(field.to_string(), Value::Array(Vec::new()));
    }
    match fields.get_mut(field) {
        Some(Value::Array(list)) => Ok(Some(list)),
        _ => Err(IndexError::MalformedDocument {
            id: doc_id.to_string(),
            reason: format!("field '{}' is not a list", field),
        }),
    }
}
