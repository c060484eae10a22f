//! Value converters
//!
//! One converter per primitive property kind, handling both directions of
//! both representations: domain `Value` ↔ persisted JSON (storage form) and
//! external/API JSON → domain `Value` (input form).

use crate::property::SortType;
use crate::schema::ElementKind;
use crate::value::Value;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;

/// Why a value could not be converted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionError {
    /// Machine-readable token for the error buffer
    pub token: &'static str,
    pub detail: String,
}

impl ConversionError {
    fn new(token: &'static str, detail: impl Into<String>) -> Self {
        Self {
            token,
            detail: detail.into(),
        }
    }
}

/// Converter for a primitive property kind
#[derive(Debug, Clone, PartialEq)]
pub enum Converter {
    String { lowercase: bool },
    Integer,
    Long,
    Double,
    Boolean,
    /// Dates persist as epoch milliseconds; `pattern` is the chrono input format
    Date { pattern: String },
    Enum(Vec<String>),
    Array(ElementKind),
}

impl Converter {
    pub fn for_element(kind: ElementKind) -> Self {
        match kind {
            ElementKind::String => Converter::String { lowercase: false },
            ElementKind::Integer => Converter::Integer,
            ElementKind::Long => Converter::Long,
            ElementKind::Double => Converter::Double,
            ElementKind::Boolean => Converter::Boolean,
        }
    }

    /// Value type name reported by the property listing
    pub fn kind_name(&self) -> &'static str {
        match self {
            Converter::String { .. } => "String",
            Converter::Integer => "Integer",
            Converter::Long => "Long",
            Converter::Double => "Double",
            Converter::Boolean => "Boolean",
            Converter::Date { .. } => "Date",
            Converter::Enum(_) => "Enum",
            Converter::Array(kind) => match kind {
                ElementKind::String => "String[]",
                ElementKind::Integer => "Integer[]",
                ElementKind::Long => "Long[]",
                ElementKind::Double => "Double[]",
                ElementKind::Boolean => "Boolean[]",
            },
        }
    }

    pub fn sort_type(&self) -> SortType {
        match self {
            Converter::Integer => SortType::Integer,
            Converter::Long | Converter::Date { .. } => SortType::Long,
            Converter::Double => SortType::Double,
            _ => SortType::Default,
        }
    }

    /// Domain value to persisted JSON. `Null` maps to `None` (property removed).
    pub fn to_storage(&self, value: &Value) -> Result<Option<JsonValue>, ConversionError> {
        if value.is_null() {
            return Ok(None);
        }

        let stored = match self {
            Converter::String { lowercase } => {
                let text = scalar_to_string(value)
                    .ok_or_else(|| ConversionError::new("invalid_string", format!("{:?} is not a string", value)))?;
                JsonValue::String(if *lowercase { text.to_lowercase() } else { text })
            }
            Converter::Integer => {
                let number = integer(value)?;
                if i32::try_from(number).is_err() {
                    return Err(ConversionError::new(
                        "integer_out_of_range",
                        format!("{} does not fit into an integer", number),
                    ));
                }
                JsonValue::from(number)
            }
            Converter::Long => JsonValue::from(integer(value)?),
            Converter::Double => {
                let number = value
                    .as_f64()
                    .ok_or_else(|| ConversionError::new("invalid_number", format!("{:?} is not a number", value)))?;
                serde_json::Number::from_f64(number)
                    .map(JsonValue::Number)
                    .ok_or_else(|| ConversionError::new("invalid_number", format!("{} is not finite", number)))?
            }
            Converter::Boolean => JsonValue::Bool(boolean(value)?),
            Converter::Date { pattern } => {
                let date = match value {
                    Value::Date(date) => *date,
                    Value::Int(millis) => millis_to_date(*millis)?,
                    Value::String(text) => parse_date(text, pattern)?,
                    other => {
                        return Err(ConversionError::new(
                            "invalid_date",
                            format!("{:?} is not a date", other),
                        ))
                    }
                };
                JsonValue::from(date.timestamp_millis())
            }
            Converter::Enum(allowed) => {
                let text = scalar_to_string(value).unwrap_or_default();
                if !allowed.iter().any(|a| a == &text) {
                    return Err(ConversionError::new(
                        "invalid_enum_value",
                        format!("{} is not one of {}", text, allowed.join(", ")),
                    ));
                }
                JsonValue::String(text)
            }
            Converter::Array(kind) => {
                let element = Converter::for_element(*kind);
                let items = match value {
                    Value::List(items) => items.clone(),
                    Value::String(text) => split_list(text),
                    single => vec![single.clone()],
                };
                let mut stored = Vec::with_capacity(items.len());
                for item in &items {
                    stored.push(element.to_storage(item)?.unwrap_or(JsonValue::Null));
                }
                JsonValue::Array(stored)
            }
        };

        Ok(Some(stored))
    }

    /// Persisted JSON to domain value
    pub fn from_storage(&self, stored: &JsonValue) -> Value {
        match (self, stored) {
            (_, JsonValue::Null) => Value::Null,
            (Converter::Date { .. }, JsonValue::Number(n)) => n
                .as_i64()
                .and_then(Value::date_from_millis)
                .unwrap_or_default(),
            (Converter::Double, JsonValue::Number(n)) => Value::Float(n.as_f64().unwrap_or_default()),
            (Converter::Array(kind), JsonValue::Array(items)) => {
                let element = Converter::for_element(*kind);
                Value::List(items.iter().map(|item| element.from_storage(item)).collect())
            }
            (_, other) => Value::from_json(other),
        }
    }

    /// External (API) JSON to domain value
    pub fn from_input(&self, input: &JsonValue) -> Result<Value, ConversionError> {
        if input.is_null() {
            return Ok(Value::Null);
        }

        let value = match self {
            Converter::String { .. } | Converter::Enum(_) => match input {
                JsonValue::String(text) => Value::String(text.clone()),
                JsonValue::Number(n) => Value::String(n.to_string()),
                JsonValue::Bool(b) => Value::String(b.to_string()),
                other => {
                    return Err(ConversionError::new(
                        "invalid_string",
                        format!("{} is not a string", other),
                    ))
                }
            },
            Converter::Integer | Converter::Long => Value::Int(integer(&Value::from_json(input))?),
            Converter::Double => Value::Float(
                Value::from_json(input)
                    .as_f64()
                    .ok_or_else(|| ConversionError::new("invalid_number", format!("{} is not a number", input)))?,
            ),
            Converter::Boolean => Value::Bool(boolean(&Value::from_json(input))?),
            Converter::Date { pattern } => match input {
                JsonValue::String(text) => Value::Date(parse_date(text, pattern)?),
                JsonValue::Number(n) => Value::Date(millis_to_date(n.as_i64().unwrap_or_default())?),
                other => {
                    return Err(ConversionError::new(
                        "invalid_date",
                        format!("{} is not a date", other),
                    ))
                }
            },
            Converter::Array(kind) => {
                let element = Converter::for_element(*kind);
                let items: Vec<JsonValue> = match input {
                    JsonValue::Array(items) => items.clone(),
                    JsonValue::String(text) => split_list(text)
                        .into_iter()
                        .map(|item| item.to_json())
                        .collect(),
                    single => vec![single.clone()],
                };
                let mut values = Vec::with_capacity(items.len());
                for item in &items {
                    values.push(element.from_input(item)?);
                }
                Value::List(values)
            }
        };

        Ok(value)
    }
}

/// Parse a date with the configured pattern, falling back to RFC 3339
pub fn parse_date(text: &str, pattern: &str) -> Result<DateTime<Utc>, ConversionError> {
    let text = text.trim();
    if let Ok(date) = DateTime::parse_from_str(text, pattern) {
        return Ok(date.with_timezone(&Utc));
    }
    if let Ok(date) = DateTime::parse_from_rfc3339(text) {
        return Ok(date.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, pattern) {
        return Ok(naive.and_utc());
    }
    Err(ConversionError::new(
        "invalid_date",
        format!("{} does not match {}", text, pattern),
    ))
}

fn millis_to_date(millis: i64) -> Result<DateTime<Utc>, ConversionError> {
    match Value::date_from_millis(millis) {
        Some(Value::Date(date)) => Ok(date),
        _ => Err(ConversionError::new("invalid_date", format!("{} is out of range", millis))),
    }
}

fn integer(value: &Value) -> Result<i64, ConversionError> {
    value
        .as_i64()
        .ok_or_else(|| ConversionError::new("invalid_integer", format!("{:?} is not an integer", value)))
}

fn boolean(value: &Value) -> Result<bool, ConversionError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(false),
        other => Err(ConversionError::new(
            "invalid_boolean",
            format!("{:?} is not a boolean", other),
        )),
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn split_list(text: &str) -> Vec<Value> {
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Value::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    const PATTERN: &str = "%Y-%m-%dT%H:%M:%S%z";

    #[test]
    fn test_integer_range_is_checked() {
        let err = Converter::Integer.to_storage(&Value::Int(i64::MAX)).unwrap_err();
        assert_eq!(err.token, "integer_out_of_range");
        assert_eq!(
            Converter::Long.to_storage(&Value::Int(i64::MAX)).unwrap(),
            Some(json!(i64::MAX))
        );
        assert_eq!(
            Converter::Integer.to_storage(&Value::Float(4.0)).unwrap(),
            Some(json!(4))
        );
    }

    #[test]
    fn test_dates_persist_as_millis() {
        let converter = Converter::Date {
            pattern: PATTERN.to_string(),
        };
        let input = converter.from_input(&json!("2024-03-01T10:00:00+0000")).unwrap();
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(input, Value::Date(expected));

        let stored = converter.to_storage(&input).unwrap().unwrap();
        assert_eq!(stored, json!(expected.timestamp_millis()));
        assert_eq!(converter.from_storage(&stored), Value::Date(expected));

        assert_eq!(
            converter.from_input(&json!("2024-03-01T10:00:00Z")).unwrap(),
            Value::Date(expected)
        );
        assert_eq!(converter.from_input(&json!("yesterday")).unwrap_err().token, "invalid_date");
    }

    #[test]
    fn test_enum_membership() {
        let converter = Converter::Enum(vec!["open".to_string(), "closed".to_string()]);
        assert_eq!(
            converter.to_storage(&Value::from("open")).unwrap(),
            Some(json!("open"))
        );
        assert_eq!(
            converter.to_storage(&Value::from("archived")).unwrap_err().token,
            "invalid_enum_value"
        );
    }

    #[test]
    fn test_arrays_accept_comma_separated_input() {
        let converter = Converter::Array(ElementKind::Integer);
        let value = converter.from_input(&json!("1, 2,3")).unwrap();
        assert_eq!(value, Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]));
        assert_eq!(converter.to_storage(&value).unwrap(), Some(json!([1, 2, 3])));
        assert_eq!(converter.from_input(&json!(["x"])).unwrap_err().token, "invalid_integer");
    }

    #[test]
    fn test_lowercase_strings_and_null_removal() {
        let converter = Converter::String { lowercase: true };
        assert_eq!(
            converter.to_storage(&Value::from("MiXeD")).unwrap(),
            Some(json!("mixed"))
        );
        assert_eq!(converter.to_storage(&Value::Null).unwrap(), None);
    }

    #[test]
    fn test_boolean_input() {
        assert_eq!(Converter::Boolean.from_input(&json!("TRUE")).unwrap(), Value::Bool(true));
        assert_eq!(
            Converter::Boolean.from_input(&json!(1)).unwrap_err().token,
            "invalid_boolean"
        );
    }
}
