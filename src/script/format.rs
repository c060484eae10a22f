//! Value formatting for template output and log messages
//!
//! Substitution renders null as an empty string; logging renders it as
//! `null` and shows entities as `Type(name, id)`.

use crate::value::Value;
use chrono::{DateTime, Utc};
use std::fmt::Write;

/// Format a date with a chrono pattern, falling back to RFC 3339 when the
/// pattern is invalid
pub fn format_date(date: &DateTime<Utc>, pattern: &str) -> String {
    let mut out = String::new();
    match write!(out, "{}", date.format(pattern)) {
        Ok(()) => out,
        Err(_) => date.to_rfc3339(),
    }
}

/// Template substitution form of a value
pub fn for_substitution(value: &Value, date_format: &str) -> String {
    match value {
        Value::Null => String::new(),
        Value::Entity(entity) => entity.id.clone(),
        other => common(other, date_format, for_substitution),
    }
}

/// Log message form of a value
pub fn for_logging(value: &Value, date_format: &str) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Entity(entity) => match entity.name.as_deref().filter(|n| !n.trim().is_empty()) {
            Some(name) => format!("{}({}, {})", entity.type_name, name, entity.id),
            None => format!("{}({})", entity.type_name, entity.id),
        },
        other => common(other, date_format, for_logging),
    }
}

fn common(value: &Value, date_format: &str, element: fn(&Value, &str) -> String) -> String {
    match value {
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::String(s) => s.clone(),
        Value::Date(d) => format_date(d, date_format),
        Value::List(items) => {
            let parts: Vec<String> = items.iter().map(|item| element(item, date_format)).collect();
            format!("[{}]", parts.join(", "))
        }
        Value::Map(_) => value.to_json().to_string(),
        Value::Null | Value::Entity(_) => element(value, date_format),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_DATE_FORMAT;
    use crate::value::EntityRef;
    use chrono::TimeZone;

    fn task(name: Option<&str>) -> Value {
        Value::Entity(EntityRef {
            id: "t1".into(),
            type_name: "Task".into(),
            name: name.map(str::to_string),
        })
    }

    #[test]
    fn test_null_differs_between_formatters() {
        assert_eq!(for_substitution(&Value::Null, DEFAULT_DATE_FORMAT), "");
        assert_eq!(for_logging(&Value::Null, DEFAULT_DATE_FORMAT), "null");
    }

    #[test]
    fn test_lists_are_bracketed_and_recursive() {
        let list = Value::List(vec![Value::Int(1), Value::Null, Value::List(vec![Value::from("x")])]);
        assert_eq!(for_substitution(&list, DEFAULT_DATE_FORMAT), "[1, , [x]]");
        assert_eq!(for_logging(&list, DEFAULT_DATE_FORMAT), "[1, null, [x]]");
    }

    #[test]
    fn test_dates_use_the_configured_pattern() {
        let date = Value::Date(Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap());
        assert_eq!(for_substitution(&date, "%Y-%m-%d"), "2024-03-01");
        assert_eq!(for_logging(&date, DEFAULT_DATE_FORMAT), "2024-03-01T12:30:00+0000");
    }

    #[test]
    fn test_entities_in_logs() {
        assert_eq!(for_logging(&task(Some("first")), DEFAULT_DATE_FORMAT), "Task(first, t1)");
        assert_eq!(for_logging(&task(None), DEFAULT_DATE_FORMAT), "Task(t1)");
        assert_eq!(for_substitution(&task(Some("first")), DEFAULT_DATE_FORMAT), "t1");
    }
}
