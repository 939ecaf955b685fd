use crate::model::Field;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Value the workflow system stores in a checked checkbox field.
pub const CHECKED: &str = "checked";

pub fn field_value(fields: &[Field], field_id: i64) -> Option<&Value> {
    fields
        .iter()
        .find(|field| field.id == field_id)
        .map(|field| &field.value)
        .filter(|value| !value.is_null())
}

/// Chat user id stored in a task field. Accepts numbers and numeric
/// strings; blanks and anything else resolve to `None`.
pub fn user_id(fields: &[Field], field_id: i64) -> Option<i64> {
    match field_value(fields, field_id)? {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    }
}

pub fn choice_id(fields: &[Field], field_id: i64) -> Option<i64> {
    field_value(fields, field_id)?
        .get("choice_id")
        .and_then(Value::as_i64)
}

pub fn is_checked(fields: &[Field], field_id: i64) -> bool {
    matches!(field_value(fields, field_id), Some(Value::String(text)) if text == CHECKED)
}

/// Display text of a field: plain strings as-is, catalog/choice values by
/// their first textual member.
pub fn text_value(fields: &[Field], field_id: i64) -> Option<String> {
    match field_value(fields, field_id)? {
        Value::String(text) => Some(text.clone()).filter(|text| !text.trim().is_empty()),
        Value::Number(number) => Some(number.to_string()),
        Value::Object(map) => ["choice_names", "values", "name", "text"]
            .iter()
            .find_map(|key| match map.get(*key) {
                Some(Value::String(text)) => Some(text.clone()),
                Some(Value::Array(items)) => items.first().and_then(Value::as_str).map(String::from),
                _ => None,
            }),
        _ => None,
    }
}

pub fn parse_close_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|timestamp| timestamp.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field(id: i64, value: Value) -> Field {
        Field {
            id,
            code: None,
            name: None,
            value,
        }
    }

    #[test]
    fn user_id_accepts_numbers_and_numeric_strings() {
        let fields = vec![
            field(72, json!("  123456789 ")),
            field(73, json!(987)),
            field(74, json!("   ")),
            field(75, Value::Null),
        ];

        assert_eq!(user_id(&fields, 72), Some(123_456_789));
        assert_eq!(user_id(&fields, 73), Some(987));
        assert_eq!(user_id(&fields, 74), None);
        assert_eq!(user_id(&fields, 75), None);
        assert_eq!(user_id(&fields, 76), None);
    }

    #[test]
    fn reads_choice_and_checkbox_fields() {
        let fields = vec![
            field(71, json!({"choice_id": 2, "choice_names": ["No"]})),
            field(111, json!("checked")),
            field(112, json!("unchecked")),
        ];

        assert_eq!(choice_id(&fields, 71), Some(2));
        assert!(is_checked(&fields, 111));
        assert!(!is_checked(&fields, 112));
        assert!(!is_checked(&fields, 113));
        assert_eq!(text_value(&fields, 71).as_deref(), Some("No"));
    }

    #[test]
    fn parses_close_date_with_zulu_suffix() {
        let parsed = parse_close_date("2026-02-20T14:00:00Z").expect("valid timestamp");
        assert_eq!(parsed.to_rfc3339(), "2026-02-20T14:00:00+00:00");
        assert!(parse_close_date("yesterday").is_none());
    }
}
