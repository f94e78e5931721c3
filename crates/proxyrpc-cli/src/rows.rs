//! Conversion between command-line JSON and row sets.

use anyhow::{anyhow, Result};
use proxyrpc_client::{Row, RowReader};
use serde_json::Value;

/// Parses rows given on the command line.
///
/// Accepts either a single JSON object or an array of objects.
pub fn parse_rows(input: &str) -> Result<Vec<Row>> {
    let value: Value =
        serde_json::from_str(input).map_err(|e| anyhow!("Invalid JSON in rows: {}", e))?;

    match value {
        Value::Object(row) => Ok(vec![row]),
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| match item {
                Value::Object(row) => Ok(row),
                other => Err(anyhow!("row {} is not an object: {}", i, other)),
            })
            .collect(),
        other => Err(anyhow!("expected an object or an array of objects, got {}", other)),
    }
}

/// Drains a row reader into a JSON array.
pub fn rows_to_json(reader: RowReader) -> Value {
    Value::Array(reader.map(Value::Object).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxyrpc_client::ErrorKind;
    use proxyrpc_common::protocol::RowsetDescriptor;
    use serde_json::json;

    #[test]
    fn test_parse_single_object() {
        let rows = parse_rows(r#"{"k": 1}"#).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["k"], json!(1));
    }

    #[test]
    fn test_parse_array() {
        let rows = parse_rows(r#"[{"k": 1}, {"k": 2}]"#).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_parse_rejects_scalars() {
        assert!(parse_rows("42").is_err());
        assert!(parse_rows(r#"[{"k": 1}, 2]"#).is_err());
        assert!(parse_rows("{not json").is_err());
    }

    #[test]
    fn test_rows_to_json() {
        let rows = parse_rows(r#"[{"k": 1}, {"k": 2}]"#).unwrap();
        let reader = RowReader::new(RowsetDescriptor::from_names(["k"]), rows).unwrap();
        assert_eq!(rows_to_json(reader), json!([{"k": 1}, {"k": 2}]));

        let bad = parse_rows(r#"{"x": 1}"#).unwrap();
        let err = RowReader::new(RowsetDescriptor::from_names(["k"]), bad).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }
}
