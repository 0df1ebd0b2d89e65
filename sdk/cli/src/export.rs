use crate::Format;
use serde_json::Value;

pub fn render(value: &Value, format: Format) -> anyhow::Result<String> {
    match format {
        Format::Json => Ok(serde_json::to_string_pretty(value)?),
        Format::Csv => Ok(to_csv(value)),
    }
}

/// One row per array element (or one row for an object). Columns come from
/// the first row; nested values are written as compact JSON.
pub fn to_csv(value: &Value) -> String {
    let rows: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    let Some(Value::Object(first)) = rows.first() else {
        return rows.iter().map(|v| cell(v)).collect::<Vec<_>>().join("\n");
    };
    let columns: Vec<&String> = first.keys().collect();
    let mut lines = vec![columns.iter().map(|c| escape(c)).collect::<Vec<_>>().join(",")];
    for row in &rows {
        let line = columns
            .iter()
            .map(|column| row.get(column.as_str()).map(cell).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(",");
        lines.push(line);
    }
    lines.join("\n")
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => escape(s),
        Value::Bool(_) | Value::Number(_) => value.to_string(),
        nested => escape(&nested.to_string()),
    }
}

fn escape(raw: &str) -> String {
    if raw.contains(|c: char| matches!(c, ',' | '"' | '\n')) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn arrays_become_rows() {
        let value = json!([
            {"identity": "did:robo:a", "score": 512.0, "grade": "C"},
            {"identity": "did:robo:b", "score": 90.0, "grade": "F"},
        ]);
        assert_eq!(
            to_csv(&value),
            "grade,identity,score\nC,did:robo:a,512.0\nF,did:robo:b,90.0"
        );
    }

    #[test]
    fn nested_and_quoted_cells_are_escaped() {
        let value = json!({"id": "batch-1", "records": ["aa", "bb"], "note": "a,b", "ref": null});
        assert_eq!(
            to_csv(&value),
            "id,note,records,ref\nbatch-1,\"a,b\",\"[\"\"aa\"\",\"\"bb\"\"]\","
        );
    }

    #[test]
    fn json_is_pretty_printed() {
        let out = render(&json!({"ok": true}), Format::Json).unwrap();
        assert_eq!(out, "{\n  \"ok\": true\n}");
    }
}
