//! Builtin functions of the expression language
//!
//! Wrong arity or argument types are returned as usage errors, never
//! panics. `assert` raises an application error.
//!
//! `find`, `get`, `create`, `set` and `delete` work on the caller's graph
//! transaction and fail when the evaluation has no host.

use crate::error::FrameworkError;
use crate::script::engine::Bindings;
use crate::script::error::EvaluationError;
use crate::script::format::{for_substitution, format_date};
use crate::script::host::ScriptHost;
use crate::value::Value;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};

pub type Builtin = fn(&[Value], &mut Bindings<'_>) -> Result<Value, EvaluationError>;

/// Builtin by name
pub fn lookup(name: &str) -> Option<Builtin> {
    let builtin: Builtin = match name {
        "concat" => concat,
        "upper" => upper,
        "lower" => lower,
        "trim" => trim,
        "join" => join,
        "split" => split,
        "size" => size,
        "empty" => empty,
        "equal" => equal,
        "not" => not,
        "add" => add,
        "subtract" => subtract,
        "mult" => mult,
        "quot" => quot,
        "mod" => modulo,
        "round" => round,
        "print" => print,
        "now" => now,
        "date_format" => date_format,
        "contains" => contains,
        "substring" => substring,
        "first" => first,
        "last" => last,
        "nth" => nth,
        "assert" => assert,
        "find" => find,
        "get" => get,
        "create" => create,
        "set" => set,
        "delete" => delete,
        _ => return None,
    };
    Some(builtin)
}

fn arity(function: &str, usage: &str, args: &[Value], min: usize, max: usize) -> Result<(), EvaluationError> {
    if args.len() < min || args.len() > max {
        return Err(EvaluationError::usage(function, usage));
    }
    Ok(())
}

fn number(function: &str, usage: &str, value: &Value) -> Result<f64, EvaluationError> {
    value.as_f64().ok_or_else(|| EvaluationError::usage(function, usage))
}

/// Int when the result is integral and fits, Float otherwise
fn numeric(result: f64) -> Value {
    if result.fract() == 0.0 && result.abs() < i64::MAX as f64 {
        Value::Int(result as i64)
    } else {
        Value::Float(result)
    }
}

/// Equality with numeric coercion (`1 == 1.0`, `'2' == 2`)
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Int(_) | Value::Float(_), _) | (_, Value::Int(_) | Value::Float(_)) => {
            match (left.as_f64(), right.as_f64()) {
                (Some(l), Some(r)) => l == r,
                _ => false,
            }
        }
        (Value::Entity(l), Value::Entity(r)) => l.id == r.id,
        (Value::Entity(e), Value::String(s)) | (Value::String(s), Value::Entity(e)) => &e.id == s,
        _ => left == right,
    }
}

fn text(value: &Value, bindings: &Bindings<'_>) -> String {
    for_substitution(value, bindings.date_format)
}

fn string_op(
    function: &str,
    args: &[Value],
    bindings: &Bindings<'_>,
    op: fn(&str) -> String,
) -> Result<Value, EvaluationError> {
    let usage = format!("{}(string)", function);
    arity(function, &usage, args, 1, 1)?;
    match &args[0] {
        Value::Null => Ok(Value::Null),
        other => Ok(Value::String(op(&text(other, bindings)))),
    }
}

fn concat(args: &[Value], bindings: &mut Bindings<'_>) -> Result<Value, EvaluationError> {
    let mut out = String::new();
    for arg in args {
        match arg {
            Value::List(items) => items.iter().for_each(|item| out.push_str(&text(item, bindings))),
            other => out.push_str(&text(other, bindings)),
        }
    }
    Ok(Value::String(out))
}

fn upper(args: &[Value], bindings: &mut Bindings<'_>) -> Result<Value, EvaluationError> {
    string_op("upper", args, bindings, str::to_uppercase)
}

fn lower(args: &[Value], bindings: &mut Bindings<'_>) -> Result<Value, EvaluationError> {
    string_op("lower", args, bindings, str::to_lowercase)
}

fn trim(args: &[Value], bindings: &mut Bindings<'_>) -> Result<Value, EvaluationError> {
    string_op("trim", args, bindings, |s| s.trim().to_string())
}

fn join(args: &[Value], bindings: &mut Bindings<'_>) -> Result<Value, EvaluationError> {
    const USAGE: &str = "join(list, separator)";
    arity("join", USAGE, args, 2, 2)?;
    let Value::List(items) = &args[0] else {
        return Err(EvaluationError::usage("join", USAGE));
    };
    let separator = text(&args[1], bindings);
    let parts: Vec<String> = items.iter().map(|item| text(item, bindings)).collect();
    Ok(Value::String(parts.join(&separator)))
}

fn split(args: &[Value], bindings: &mut Bindings<'_>) -> Result<Value, EvaluationError> {
    const USAGE: &str = "split(string[, separator])";
    arity("split", USAGE, args, 1, 2)?;
    let source = text(&args[0], bindings);
    let separator = args.get(1).map_or_else(|| ",".to_string(), |s| text(s, bindings));
    if source.is_empty() {
        return Ok(Value::List(Vec::new()));
    }
    if separator.is_empty() {
        return Err(EvaluationError::usage("split", USAGE));
    }
    Ok(Value::List(
        source
            .split(separator.as_str())
            .map(|part| Value::String(part.trim().to_string()))
            .collect(),
    ))
}

fn size(args: &[Value], _bindings: &mut Bindings<'_>) -> Result<Value, EvaluationError> {
    arity("size", "size(collection)", args, 1, 1)?;
    let size = match &args[0] {
        Value::Null => 0,
        Value::List(items) => items.len(),
        Value::Map(map) => map.len(),
        Value::String(s) => s.chars().count(),
        _ => return Err(EvaluationError::usage("size", "size(collection)")),
    };
    Ok(Value::Int(size as i64))
}

fn empty(args: &[Value], _bindings: &mut Bindings<'_>) -> Result<Value, EvaluationError> {
    arity("empty", "empty(value)", args, 1, 1)?;
    Ok(Value::Bool(args[0].is_empty()))
}

fn equal(args: &[Value], _bindings: &mut Bindings<'_>) -> Result<Value, EvaluationError> {
    arity("equal", "equal(value1, value2)", args, 2, 2)?;
    Ok(Value::Bool(values_equal(&args[0], &args[1])))
}

fn not(args: &[Value], _bindings: &mut Bindings<'_>) -> Result<Value, EvaluationError> {
    arity("not", "not(value)", args, 1, 1)?;
    Ok(Value::Bool(!args[0].is_truthy()))
}

fn add(args: &[Value], _bindings: &mut Bindings<'_>) -> Result<Value, EvaluationError> {
    const USAGE: &str = "add(number, number, ...)";
    arity("add", USAGE, args, 1, usize::MAX)?;
    let mut sum = 0.0;
    for arg in args {
        sum += number("add", USAGE, arg)?;
    }
    Ok(numeric(sum))
}

fn subtract(args: &[Value], _bindings: &mut Bindings<'_>) -> Result<Value, EvaluationError> {
    const USAGE: &str = "subtract(number, number)";
    arity("subtract", USAGE, args, 2, 2)?;
    Ok(numeric(number("subtract", USAGE, &args[0])? - number("subtract", USAGE, &args[1])?))
}

fn mult(args: &[Value], _bindings: &mut Bindings<'_>) -> Result<Value, EvaluationError> {
    const USAGE: &str = "mult(number, number, ...)";
    arity("mult", USAGE, args, 1, usize::MAX)?;
    let mut product = 1.0;
    for arg in args {
        product *= number("mult", USAGE, arg)?;
    }
    Ok(numeric(product))
}

/// Division failure raised by `quot` and `mod`
pub fn division_by_zero() -> EvaluationError {
    EvaluationError::ScriptFailure(FrameworkError::new(422, "Division by zero"))
}

fn quot(args: &[Value], _bindings: &mut Bindings<'_>) -> Result<Value, EvaluationError> {
    const USAGE: &str = "quot(number, number)";
    arity("quot", USAGE, args, 2, 2)?;
    let divisor = number("quot", USAGE, &args[1])?;
    if divisor == 0.0 {
        return Err(division_by_zero());
    }
    Ok(numeric(number("quot", USAGE, &args[0])? / divisor))
}

fn modulo(args: &[Value], _bindings: &mut Bindings<'_>) -> Result<Value, EvaluationError> {
    const USAGE: &str = "mod(number, number)";
    arity("mod", USAGE, args, 2, 2)?;
    let divisor = number("mod", USAGE, &args[1])?;
    if divisor == 0.0 {
        return Err(division_by_zero());
    }
    Ok(numeric(number("mod", USAGE, &args[0])? % divisor))
}

fn round(args: &[Value], _bindings: &mut Bindings<'_>) -> Result<Value, EvaluationError> {
    const USAGE: &str = "round(number[, decimals])";
    arity("round", USAGE, args, 1, 2)?;
    let value = number("round", USAGE, &args[0])?;
    let decimals = match args.get(1) {
        Some(d) => d.as_i64().ok_or_else(|| EvaluationError::usage("round", USAGE))?,
        None => 0,
    };
    let factor = 10f64.powi(decimals.clamp(0, 15) as i32);
    Ok(numeric((value * factor).round() / factor))
}

fn print(args: &[Value], bindings: &mut Bindings<'_>) -> Result<Value, EvaluationError> {
    for arg in args {
        let formatted = text(arg, bindings);
        bindings.ctx.output.push_str(&formatted);
    }
    Ok(Value::Null)
}

fn now(args: &[Value], _bindings: &mut Bindings<'_>) -> Result<Value, EvaluationError> {
    arity("now", "now()", args, 0, 0)?;
    Ok(Value::Date(Utc::now()))
}

fn as_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Date(d) => Some(*d),
        Value::Int(millis) => DateTime::from_timestamp_millis(*millis),
        Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|d| d.with_timezone(&Utc)),
        _ => None,
    }
}

fn date_format(args: &[Value], _bindings: &mut Bindings<'_>) -> Result<Value, EvaluationError> {
    const USAGE: &str = "date_format(date, pattern)";
    arity("date_format", USAGE, args, 2, 2)?;
    if args[0].is_null() {
        return Ok(Value::String(String::new()));
    }
    let (Some(date), Some(pattern)) = (as_date(&args[0]), args[1].as_str()) else {
        return Err(EvaluationError::usage("date_format", USAGE));
    };
    Ok(Value::String(format_date(&date, pattern)))
}

fn contains(args: &[Value], bindings: &mut Bindings<'_>) -> Result<Value, EvaluationError> {
    const USAGE: &str = "contains(stringOrList, element)";
    arity("contains", USAGE, args, 2, 2)?;
    let found = match &args[0] {
        Value::Null => false,
        Value::List(items) => items.iter().any(|item| values_equal(item, &args[1])),
        Value::Map(map) => map.contains_key(&text(&args[1], bindings)),
        other => text(other, bindings).contains(&text(&args[1], bindings)),
    };
    Ok(Value::Bool(found))
}

fn substring(args: &[Value], bindings: &mut Bindings<'_>) -> Result<Value, EvaluationError> {
    const USAGE: &str = "substring(string, start[, length])";
    arity("substring", USAGE, args, 2, 3)?;
    let source: Vec<char> = text(&args[0], bindings).chars().collect();
    let start = args[1]
        .as_i64()
        .filter(|s| *s >= 0)
        .ok_or_else(|| EvaluationError::usage("substring", USAGE))? as usize;
    let length = match args.get(2) {
        Some(l) => l
            .as_i64()
            .filter(|l| *l >= 0)
            .ok_or_else(|| EvaluationError::usage("substring", USAGE))? as usize,
        None => source.len().saturating_sub(start),
    };
    let start = start.min(source.len());
    let end = start.saturating_add(length).min(source.len());
    Ok(Value::String(source[start..end].iter().collect()))
}

fn list_arg<'v>(function: &str, usage: &str, args: &'v [Value], count: usize) -> Result<Option<&'v [Value]>, EvaluationError> {
    arity(function, usage, args, count, count)?;
    match &args[0] {
        Value::Null => Ok(None),
        Value::List(items) => Ok(Some(items.as_slice())),
        _ => Err(EvaluationError::usage(function, usage)),
    }
}

fn first(args: &[Value], _bindings: &mut Bindings<'_>) -> Result<Value, EvaluationError> {
    let items = list_arg("first", "first(list)", args, 1)?;
    Ok(items.and_then(|items| items.first()).cloned().unwrap_or_default())
}

fn last(args: &[Value], _bindings: &mut Bindings<'_>) -> Result<Value, EvaluationError> {
    let items = list_arg("last", "last(list)", args, 1)?;
    Ok(items.and_then(|items| items.last()).cloned().unwrap_or_default())
}

fn nth(args: &[Value], _bindings: &mut Bindings<'_>) -> Result<Value, EvaluationError> {
    const USAGE: &str = "nth(list, index)";
    let items = list_arg("nth", USAGE, args, 2)?;
    let index = args[1].as_i64().ok_or_else(|| EvaluationError::usage("nth", USAGE))?;
    let value = usize::try_from(index)
        .ok()
        .and_then(|index| items.and_then(|items| items.get(index)))
        .cloned();
    Ok(value.unwrap_or_default())
}

fn assert(args: &[Value], bindings: &mut Bindings<'_>) -> Result<Value, EvaluationError> {
    const USAGE: &str = "assert(condition, statusCode, message)";
    arity("assert", USAGE, args, 3, 3)?;
    if args[0].is_truthy() {
        return Ok(Value::Null);
    }
    let status = args[1]
        .as_i64()
        .and_then(|s| u16::try_from(s).ok())
        .ok_or_else(|| EvaluationError::usage("assert", USAGE))?;
    Err(EvaluationError::Application(FrameworkError::new(status, text(&args[2], bindings))))
}

fn host<'b>(function: &str, bindings: &Bindings<'b>) -> Result<&'b dyn ScriptHost, EvaluationError> {
    bindings
        .host
        .ok_or_else(|| EvaluationError::Host(format!("{}() needs access to a graph transaction", function)))
}

/// Id of an entity reference, an id string or a map with an `id`
fn entity_id(function: &str, usage: &str, value: &Value) -> Result<String, EvaluationError> {
    match value {
        Value::Entity(entity) => Ok(entity.id.clone()),
        Value::String(id) => Ok(id.clone()),
        Value::Map(map) => match map.get("id") {
            Some(Value::String(id)) => Ok(id.clone()),
            _ => Err(EvaluationError::usage(function, usage)),
        },
        _ => Err(EvaluationError::usage(function, usage)),
    }
}

fn find(args: &[Value], bindings: &mut Bindings<'_>) -> Result<Value, EvaluationError> {
    const USAGE: &str = "find(type, key, value)";
    arity("find", USAGE, args, 3, 3)?;
    let (Value::String(type_name), Value::String(key)) = (&args[0], &args[1]) else {
        return Err(EvaluationError::usage("find", USAGE));
    };
    let found = host("find", bindings)?.find(type_name, key, &args[2])?;
    Ok(Value::List(found.iter().map(|entity| Value::Entity(entity.to_ref())).collect()))
}

fn get(args: &[Value], bindings: &mut Bindings<'_>) -> Result<Value, EvaluationError> {
    const USAGE: &str = "get(id)";
    arity("get", USAGE, args, 1, 1)?;
    let id = entity_id("get", USAGE, &args[0])?;
    let entity = host("get", bindings)?.get(&id)?;
    Ok(entity.map(|entity| Value::Entity(entity.to_ref())).unwrap_or_default())
}

fn create(args: &[Value], bindings: &mut Bindings<'_>) -> Result<Value, EvaluationError> {
    const USAGE: &str = "create(type[, properties])";
    arity("create", USAGE, args, 1, 2)?;
    let Value::String(type_name) = &args[0] else {
        return Err(EvaluationError::usage("create", USAGE));
    };
    let input = match args.get(1).map(Value::to_json) {
        None | Some(JsonValue::Null) => Map::new(),
        Some(JsonValue::Object(input)) => input,
        Some(_) => return Err(EvaluationError::usage("create", USAGE)),
    };
    let host = host("create", bindings)?;
    let entity = host.create(bindings.ctx, type_name, &input)?;
    Ok(Value::Entity(entity.to_ref()))
}

fn set(args: &[Value], bindings: &mut Bindings<'_>) -> Result<Value, EvaluationError> {
    const USAGE: &str = "set(entity, key, value)";
    arity("set", USAGE, args, 3, 3)?;
    let id = entity_id("set", USAGE, &args[0])?;
    let Value::String(key) = &args[1] else {
        return Err(EvaluationError::usage("set", USAGE));
    };
    let host = host("set", bindings)?;
    host.set(bindings.ctx, &id, key, args[2].clone())?;
    Ok(Value::Null)
}

fn delete(args: &[Value], bindings: &mut Bindings<'_>) -> Result<Value, EvaluationError> {
    const USAGE: &str = "delete(entity)";
    arity("delete", USAGE, args, 1, 1)?;
    let id = entity_id("delete", USAGE, &args[0])?;
    let host = host("delete", bindings)?;
    let deleted = host.delete(bindings.ctx, &id)?;
    Ok(Value::Int(deleted.len() as i64))
}
