//! Dot-path addressing into JSON values.

use serde_json::{Map, Value};

use super::EnvelopeError;

/// Segment that appends to an array when setting.
const APPEND: &str = "-1";

/// Furthest an index may reach past the end of an array; the gap is
/// padded with nulls.
pub(super) const MAX_INDEX_GAP: usize = 1024;

/// Split a dot path into segments, honouring `\.` escapes.
pub(super) fn parse(path: &str) -> Result<Vec<String>, EnvelopeError> {
    let malformed = |reason: &str| EnvelopeError::Path {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    if path.is_empty() {
        return Err(malformed("path is empty"));
    }

    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped) => current.push(escaped),
                None => return Err(malformed("dangling escape")),
            },
            '.' => segments.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    segments.push(current);

    if segments.iter().any(String::is_empty) {
        return Err(malformed("empty segment"));
    }

    Ok(segments)
}

fn is_index(segment: &str) -> bool {
    segment == APPEND || segment.bytes().all(|b| b.is_ascii_digit())
}

pub(super) fn get<'a>(root: &'a Value, segments: &[String]) -> Option<&'a Value> {
    segments
        .iter()
        .try_fold(root, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) if segment == APPEND => items.last(),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

pub(super) fn set(root: &mut Value, segments: &[String], value: Value) -> Result<(), String> {
    let mut current = root;

    for segment in segments {
        if current.is_null() {
            *current = if is_index(segment) {
                Value::Array(Vec::new())
            } else {
                Value::Object(Map::new())
            };
        }

        current = match current {
            Value::Object(map) => map.entry(segment.clone()).or_insert(Value::Null),
            Value::Array(items) => {
                let index = if segment == APPEND {
                    items.len()
                } else {
                    segment
                        .parse::<usize>()
                        .map_err(|_| format!("'{}' is not an array index", segment))?
                };
                if index >= items.len() {
                    if index - items.len() > MAX_INDEX_GAP {
                        return Err(format!(
                            "index {} is more than {} past the end of the array",
                            index, MAX_INDEX_GAP
                        ));
                    }
                    items.resize(index + 1, Value::Null);
                }
                &mut items[index]
            }
            _ => return Err(format!("'{}' traverses a scalar value", segment)),
        };
    }

    *current = value;
    Ok(())
}
