//! Default (restricted) expression language
//!
//! Literals, names bound in the context, member access, arithmetic,
//! comparisons and builtins. Side effects come only from `print`, `assert`
//! and the graph functions, which need a host.

// Tokenizer and parser
pub mod parser;

// Builtin functions
pub mod functions;

pub use parser::{parse, BinaryOp, Expr, ParseError, Pos, UnaryOp};

use crate::script::engine::{Bindings, CompiledForm, CompiledScript, EngineError, ScriptEngine};
use crate::script::error::{ErrorLocation, EvaluationError};
use crate::value::Value;
use functions::values_equal;
use std::cmp::Ordering;
use std::collections::BTreeMap;

pub const ENGINE_NAME: &str = "expression";

#[derive(Debug, Default)]
pub struct ExpressionEngine;

impl ScriptEngine for ExpressionEngine {
    fn name(&self) -> &str {
        ENGINE_NAME
    }

    fn wrap(&self, snippet: &crate::script::snippet::Snippet) -> String {
        snippet.source.clone()
    }

    fn compile(&self, source: &str) -> Result<CompiledScript, EngineError> {
        let expr = parse(source).map_err(|e| EngineError::script(e.message, e.pos.location()))?;
        Ok(CompiledScript {
            engine: ENGINE_NAME.to_string(),
            form: CompiledForm::Expression(expr),
        })
    }

    fn evaluate(&self, script: &CompiledScript, bindings: &mut Bindings<'_>) -> Result<Value, EngineError> {
        match &script.form {
            CompiledForm::Expression(expr) => eval(expr, bindings),
            CompiledForm::Source(source) => {
                let expr = parse(source).map_err(|e| EngineError::script(e.message, e.pos.location()))?;
                eval(&expr, bindings)
            }
        }
    }
}

fn failure(err: EvaluationError, location: ErrorLocation) -> EngineError {
    match err {
        EvaluationError::Application(app) => EngineError::Application(app),
        EvaluationError::ScriptFailure(failed) => EngineError::script(failed.message, location),
        other @ (EvaluationError::Usage { .. } | EvaluationError::Host(_)) => EngineError::script(other.to_string(), location),
    }
}

fn eval(expr: &Expr, bindings: &mut Bindings<'_>) -> Result<Value, EngineError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::List(items) => Ok(Value::List(
            items.iter().map(|item| eval(item, bindings)).collect::<Result<_, _>>()?,
        )),
        Expr::Map(entries) => {
            let mut map = BTreeMap::new();
            for (key, value) in entries {
                map.insert(key.clone(), eval(value, bindings)?);
            }
            Ok(Value::Map(map))
        }
        Expr::Ident(name) => Ok(bindings.lookup(name).unwrap_or_default()),
        Expr::Member(target, key) => {
            let target = eval(target, bindings)?;
            bindings
                .member(&target, key)
                .map_err(|e| failure(e, ErrorLocation::default()))
        }
        Expr::Index(target, index) => {
            let target = eval(target, bindings)?;
            let index = eval(index, bindings)?;
            match (&target, &index) {
                (Value::List(items), _) => Ok(index
                    .as_i64()
                    .and_then(|i| usize::try_from(i).ok())
                    .and_then(|i| items.get(i))
                    .cloned()
                    .unwrap_or_default()),
                (_, Value::String(key)) => bindings
                    .member(&target, key)
                    .map_err(|e| failure(e, ErrorLocation::default())),
                _ => Ok(Value::Null),
            }
        }
        Expr::Call { name, args, pos } => call(name, args, *pos, bindings),
        Expr::Unary(UnaryOp::Not, inner) => Ok(Value::Bool(!eval(inner, bindings)?.is_truthy())),
        Expr::Unary(UnaryOp::Neg, inner) => match eval(inner, bindings)? {
            Value::Int(i) => Ok(i.checked_neg().map_or(Value::Float(-(i as f64)), Value::Int)),
            other => match other.as_f64() {
                Some(f) => Ok(Value::Float(-f)),
                None => Err(EngineError::script("Cannot negate a non-numeric value", ErrorLocation::default())),
            },
        },
        Expr::Binary { op, left, right, pos } => binary(*op, left, right, *pos, bindings),
    }
}

fn call(name: &str, args: &[Expr], pos: Pos, bindings: &mut Bindings<'_>) -> Result<Value, EngineError> {
    // only the chosen branch is evaluated
    if name == "if" {
        if args.len() < 2 || args.len() > 3 {
            return Err(failure(
                EvaluationError::usage("if", "if(condition, trueValue[, falseValue])"),
                pos.location(),
            ));
        }
        return if eval(&args[0], bindings)?.is_truthy() {
            eval(&args[1], bindings)
        } else {
            args.get(2).map_or(Ok(Value::Null), |branch| eval(branch, bindings))
        };
    }

    let Some(builtin) = functions::lookup(name) else {
        return Err(EngineError::script(format!("Unknown function {}()", name), pos.location()));
    };
    let values = args
        .iter()
        .map(|arg| eval(arg, bindings))
        .collect::<Result<Vec<_>, _>>()?;
    builtin(&values, bindings).map_err(|e| failure(e, pos.location()))
}

fn binary(op: BinaryOp, left: &Expr, right: &Expr, pos: Pos, bindings: &mut Bindings<'_>) -> Result<Value, EngineError> {
    match op {
        BinaryOp::Or => {
            let truthy = eval(left, bindings)?.is_truthy() || eval(right, bindings)?.is_truthy();
            return Ok(Value::Bool(truthy));
        }
        BinaryOp::And => {
            let truthy = eval(left, bindings)?.is_truthy() && eval(right, bindings)?.is_truthy();
            return Ok(Value::Bool(truthy));
        }
        _ => {}
    }

    let left = eval(left, bindings)?;
    let right = eval(right, bindings)?;
    let mismatch = || {
        EngineError::script(
            format!("Cannot apply {:?} to {} and {}", op, kind(&left), kind(&right)),
            pos.location(),
        )
    };

    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(&left, &right))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(&left, &right))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare(&left, &right).ok_or_else(mismatch)?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }))
        }
        BinaryOp::Add => match (&left, &right) {
            (Value::List(l), Value::List(r)) => Ok(Value::List(l.iter().chain(r).cloned().collect())),
            (Value::String(_), _) | (_, Value::String(_)) => Ok(Value::String(format!(
                "{}{}",
                crate::script::format::for_substitution(&left, bindings.date_format),
                crate::script::format::for_substitution(&right, bindings.date_format)
            ))),
            (Value::Int(l), Value::Int(r)) => Ok(l.checked_add(*r).map_or(Value::Float(*l as f64 + *r as f64), Value::Int)),
            _ => arithmetic(&left, &right, |l, r| l + r).ok_or_else(mismatch),
        },
        BinaryOp::Sub => match (&left, &right) {
            (Value::Int(l), Value::Int(r)) => Ok(l.checked_sub(*r).map_or(Value::Float(*l as f64 - *r as f64), Value::Int)),
            _ => arithmetic(&left, &right, |l, r| l - r).ok_or_else(mismatch),
        },
        BinaryOp::Mul => match (&left, &right) {
            (Value::Int(l), Value::Int(r)) => Ok(l.checked_mul(*r).map_or(Value::Float(*l as f64 * *r as f64), Value::Int)),
            _ => arithmetic(&left, &right, |l, r| l * r).ok_or_else(mismatch),
        },
        BinaryOp::Div | BinaryOp::Rem => {
            let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) else {
                return Err(mismatch());
            };
            if r == 0.0 {
                return Err(failure(functions::division_by_zero(), pos.location()));
            }
            let result = if op == BinaryOp::Div { l / r } else { l % r };
            let integral = matches!((&left, &right), (Value::Int(_), Value::Int(_))) && result.fract() == 0.0;
            Ok(if integral { Value::Int(result as i64) } else { Value::Float(result) })
        }
        BinaryOp::Or | BinaryOp::And => Ok(Value::Null),
    }
}

fn arithmetic(left: &Value, right: &Value, op: fn(f64, f64) -> f64) -> Option<Value> {
    Some(Value::Float(op(left.as_f64()?, right.as_f64()?)))
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        (Value::Date(l), Value::Date(r)) => Some(l.cmp(r)),
        _ => left.as_f64()?.partial_cmp(&right.as_f64()?),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Int(_) | Value::Float(_) => "number",
        Value::String(_) => "string",
        Value::Date(_) => "date",
        Value::List(_) => "list",
        Value::Map(_) => "map",
        Value::Entity(_) => "entity",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_DATE_FORMAT;
    use crate::error::FrameworkError;
    use crate::script::context::ActionContext;

    fn run(source: &str, ctx: &mut ActionContext) -> Result<Value, EngineError> {
        let engine = ExpressionEngine;
        let script = engine.compile(source)?;
        let mut bindings = Bindings::new(ctx, DEFAULT_DATE_FORMAT);
        bindings.this = Some(Value::from_json(&serde_json::json!({
            "name": "Alpha",
            "tags": ["a", "b"],
            "owner": { "name": "Ada" }
        })));
        engine.evaluate(&script, &mut bindings)
    }

    fn eval_str(source: &str) -> Result<Value, EngineError> {
        run(source, &mut ActionContext::default())
    }

    #[test]
    fn test_arithmetic_and_strings() {
        assert_eq!(eval_str("1 + 2 * 3").unwrap(), Value::Int(7));
        assert_eq!(eval_str("7 / 2").unwrap(), Value::Float(3.5));
        assert_eq!(eval_str("8 / 2").unwrap(), Value::Int(4));
        assert_eq!(eval_str("'n: ' + 1").unwrap(), Value::from("n: 1"));
        assert_eq!(eval_str("-(2 + 3) % 3").unwrap(), Value::Int(-2));
    }

    #[test]
    fn test_negating_the_smallest_integer_widens_to_float() {
        let value = eval_str("-(0 - 9223372036854775807 - 1)").unwrap();
        assert_eq!(value, Value::Float(9223372036854775808.0));
        assert_eq!(eval_str("-(0 - 9223372036854775807)").unwrap(), Value::Int(i64::MAX));
    }

    #[test]
    fn test_deeply_nested_source_is_a_script_error() {
        let source = format!("{}1{}", "(".repeat(200_000), ")".repeat(200_000));
        let err = eval_str(&source).unwrap_err();
        assert!(matches!(err, EngineError::Script { ref message, .. } if message == "Expression nested too deeply"));
    }

    #[test]
    fn test_graph_functions_need_a_host() {
        let err = eval_str("find('Task', 'name', 'x')").unwrap_err();
        assert!(matches!(err, EngineError::Script { ref message, .. } if message.contains("find()")));
    }

    #[test]
    fn test_bindings_and_access() {
        assert_eq!(eval_str("this.name").unwrap(), Value::from("Alpha"));
        assert_eq!(eval_str("this.owner.name").unwrap(), Value::from("Ada"));
        assert_eq!(eval_str("this.tags[1]").unwrap(), Value::from("b"));
        assert_eq!(eval_str("this['name']").unwrap(), Value::from("Alpha"));
        assert_eq!(eval_str("missing").unwrap(), Value::Null);

        let mut ctx = ActionContext::default().with_constant("limit", Value::Int(3));
        assert_eq!(run("limit > 2 && size(this.tags) == 2", &mut ctx).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_if_only_evaluates_the_chosen_branch() {
        assert_eq!(eval_str("if(true, 'yes', 1 / 0)").unwrap(), Value::from("yes"));
        assert_eq!(eval_str("if(empty(this.missing), 'none')").unwrap(), Value::from("none"));
    }

    #[test]
    fn test_division_by_zero_is_a_script_error() {
        let err = eval_str("1/0").unwrap_err();
        assert!(matches!(err, EngineError::Script { ref message, .. } if message == "Division by zero"));
    }

    #[test]
    fn test_usage_errors_become_script_errors_with_position() {
        let err = eval_str("\n  upper()").unwrap_err();
        let EngineError::Script { message, location } = err else {
            panic!("expected script error");
        };
        assert_eq!(message, "Usage: upper(string)");
        assert_eq!((location.row, location.column), (2, 3));
    }

    #[test]
    fn test_assert_escapes_as_application_error() {
        let err = eval_str("assert(false, 403, 'nope')").unwrap_err();
        assert_eq!(err, EngineError::Application(FrameworkError::new(403, "nope")));
    }

    #[test]
    fn test_print_and_literals() {
        let mut ctx = ActionContext::default();
        let value = run("print('a', [1, 2], { k: 'v' })", &mut ctx).unwrap();
        assert_eq!(value, Value::Null);
        assert_eq!(ctx.output, "a[1, 2]{\"k\":\"v\"}");
    }
}
