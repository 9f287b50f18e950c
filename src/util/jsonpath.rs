//! Dot-path resolution over JSON values - minimal subset
//!
//! Used by the executor to resolve task argument expressions such as
//! `deps.task_2.output.rows[0].id` against the completed-tasks map.
//!
//! Supports:
//! - `a.b.c` (dot notation)
//! - `a[0].b` (array index)
//! - `a.0.b` (numeric segment as index)
//!
//! Does NOT support filters, wildcards, slices or unions.

use serde_json::Value;

use crate::error::{PmlError, Result};

/// A parsed path segment
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// Object field access: .field
    Field(String),
    /// Array index access: [0]
    Index(usize),
}

/// Parse a dot-path string into segments
///
/// Examples:
/// - "output.rows" → [Field("output"), Field("rows")]
/// - "items[0].name" → [Field("items"), Index(0), Field("name")]
pub fn parse(path: &str) -> Result<Vec<Segment>> {
    if path.is_empty() {
        return Ok(vec![]);
    }

    let mut segments = Vec::new();

    for part in path.split('.') {
        if part.is_empty() {
            return Err(PmlError::InvalidParams {
                method: "path".to_string(),
                reason: format!("empty segment in path '{}'", path),
            });
        }

        // Check for array index: field[0] or just [0]
        if let Some(bracket_pos) = part.find('[') {
            let field = &part[..bracket_pos];
            if !field.is_empty() {
                segments.push(Segment::Field(field.to_string()));
            }

            if !part.ends_with(']') {
                return Err(PmlError::InvalidParams {
                    method: "path".to_string(),
                    reason: format!("unterminated index in path '{}'", path),
                });
            }

            let index_str = &part[bracket_pos + 1..part.len() - 1];
            let index: usize = index_str.parse().map_err(|_| PmlError::InvalidParams {
                method: "path".to_string(),
                reason: format!("non-numeric index in path '{}'", path),
            })?;

            segments.push(Segment::Index(index));
        } else if let Ok(index) = part.parse::<usize>() {
            // Numeric segment treated as array index (e.g., "items.0")
            segments.push(Segment::Index(index));
        } else {
            segments.push(Segment::Field(part.to_string()));
        }
    }

    Ok(segments)
}

/// Apply path segments to a JSON value
///
/// Uses references internally, only clones once at the end.
pub fn apply(value: &Value, segments: &[Segment]) -> Option<Value> {
    let mut current = value;

    for segment in segments {
        current = match segment {
            Segment::Field(name) => current.get(name)?,
            Segment::Index(idx) => current.get(*idx)?,
        };
    }

    Some(current.clone())
}

/// Parse and apply a dot-path in one step
pub fn resolve(value: &Value, path: &str) -> Result<Option<Value>> {
    let segments = parse(path)?;
    Ok(apply(value, &segments))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_simple_path() {
        let segments = parse("a.b.c").unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::Field("a".to_string()),
                Segment::Field("b".to_string()),
                Segment::Field("c".to_string()),
            ]
        );
    }

    #[test]
    fn parse_array_index() {
        let segments = parse("items[2].name").unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::Field("items".to_string()),
                Segment::Index(2),
                Segment::Field("name".to_string()),
            ]
        );
    }

    #[test]
    fn parse_numeric_segment_as_index() {
        let segments = parse("rows.0.id").unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::Field("rows".to_string()),
                Segment::Index(0),
                Segment::Field("id".to_string()),
            ]
        );
    }

    #[test]
    fn resolve_nested() {
        let value = json!({"output": {"rows": [{"id": 7}, {"id": 9}]}});
        assert_eq!(resolve(&value, "output.rows.1.id").unwrap(), Some(json!(9)));
        assert_eq!(
            resolve(&value, "output.rows[0].id").unwrap(),
            Some(json!(7))
        );
    }

    #[test]
    fn resolve_missing_returns_none() {
        let value = json!({"a": 1});
        assert_eq!(resolve(&value, "b.c").unwrap(), None);
    }

    #[test]
    fn empty_path_resolves_to_root() {
        let value = json!({"a": 1});
        assert_eq!(resolve(&value, "").unwrap(), Some(value.clone()));
    }

    #[test]
    fn unterminated_index_is_error() {
        assert!(parse("items[2.name").is_err());
    }
}
