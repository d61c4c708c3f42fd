//! Expression evaluation.
//!
//! Expressions never suspend: every call reachable from here is a builtin.
//! Host operations must go through an awaited statement instead.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::ExecError;
use super::ast::{BinaryOp, BoolOp, Call, Expr, FStringPart, UnaryOp};
use super::value::{Namespace, Value};

const MAX_RANGE_LEN: i64 = 100_000;
const MAX_REPEAT_LEN: usize = 1_000_000;

const BUILTINS: &[&str] = &[
    "len", "str", "int", "float", "bool", "range", "abs", "min", "max", "print", "repr", "format",
    "list", "sorted", "sum",
];

/// Methods that modify their receiver in place; evaluated by the statement
/// executor, which can write the receiver back.
pub const MUTATING_METHODS: &[&str] = &["append", "extend", "pop", "update", "insert"];

/// Whether `name` is a builtin function.
pub fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

/// Read access to everything an expression can reference.
pub trait Scope {
    /// Local namespace of the current turn.
    fn namespace(&self) -> &Namespace;
    /// Agent-level variable (`$name`), if assigned.
    fn state_var(&self, name: &str) -> Option<Value>;
    /// Whether `name` is a host operation (used to produce a precise diagnostic).
    fn is_host_function(&self, name: &str) -> bool;
}

/// Evaluate an expression.
pub fn eval_expr(expr: &Expr, scope: &dyn Scope) -> Result<Value, ExecError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::FString(parts) => {
            let mut out = String::new();
            for part in parts {
                match part {
                    FStringPart::Text(text) => out.push_str(text),
                    FStringPart::Expr(inner) => out.push_str(&eval_expr(inner, scope)?.to_string()),
                }
            }
            Ok(Value::Str(out))
        }
        Expr::Name(name) => match scope.namespace().get(name) {
            Some(value) => Ok(value.clone()),
            None if scope.is_host_function(name) || is_builtin(name) => Err(ExecError::Type(
                format!("`{}` is a function; call it instead of using it as a value", name),
            )),
            None => Err(ExecError::UndefinedVariable(name.clone())),
        },
        Expr::StateVar(name) => scope
            .state_var(name)
            .ok_or_else(|| ExecError::UndefinedVariable(format!("${}", name))),
        Expr::List(items) => Ok(Value::List(
            items
                .iter()
                .map(|item| eval_expr(item, scope))
                .collect::<Result<Vec<_>, _>>()?,
        )),
        Expr::Dict(entries) => {
            let mut map = BTreeMap::new();
            for (key, value) in entries {
                let key = dict_key(eval_expr(key, scope)?)?;
                map.insert(key, eval_expr(value, scope)?);
            }
            Ok(Value::Dict(map))
        }
        Expr::Index { value, index } => {
            let container = eval_expr(value, scope)?;
            let index = eval_expr(index, scope)?;
            index_value(&container, &index)
        }
        Expr::Call(call) => eval_call(call, scope),
        Expr::Method {
            receiver,
            method,
            args,
        } => {
            if MUTATING_METHODS.contains(&method.as_str()) {
                return Err(ExecError::Type(format!(
                    "`.{}()` modifies a variable and must be used on its own line or as an assignment value",
                    method
                )));
            }
            let receiver = eval_expr(receiver, scope)?;
            let args = args
                .iter()
                .map(|arg| eval_expr(arg, scope))
                .collect::<Result<Vec<_>, _>>()?;
            call_method(&receiver, method, &args)
        }
        Expr::Unary { op, operand } => {
            let value = eval_expr(operand, scope)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
                UnaryOp::Neg => match value {
                    Value::Int(num) => num
                        .checked_neg()
                        .map(Value::Int)
                        .ok_or_else(|| ExecError::Type("integer overflow".into())),
                    Value::Float(num) => Ok(Value::Float(-num)),
                    Value::Bool(flag) => Ok(Value::Int(-i64::from(flag))),
                    other => Err(ExecError::Type(format!(
                        "bad operand type for unary -: '{}'",
                        other.type_name()
                    ))),
                },
            }
        }
        Expr::Binary { op, left, right } => {
            let left = eval_expr(left, scope)?;
            let right = eval_expr(right, scope)?;
            binary_op(*op, &left, &right)
        }
        Expr::BoolOp { op, left, right } => {
            let left = eval_expr(left, scope)?;
            match op {
                BoolOp::And if !left.is_truthy() => Ok(left),
                BoolOp::Or if left.is_truthy() => Ok(left),
                _ => eval_expr(right, scope),
            }
        }
    }
}

/// Evaluate the arguments of a call, positional then keyword.
pub fn eval_args(
    call: &Call,
    scope: &dyn Scope,
) -> Result<(Vec<Value>, BTreeMap<String, Value>), ExecError> {
    let args = call
        .args
        .iter()
        .map(|arg| eval_expr(arg, scope))
        .collect::<Result<Vec<_>, _>>()?;
    let mut kwargs = BTreeMap::new();
    for (name, expr) in &call.kwargs {
        kwargs.insert(name.clone(), eval_expr(expr, scope)?);
    }
    Ok((args, kwargs))
}

fn eval_call(call: &Call, scope: &dyn Scope) -> Result<Value, ExecError> {
    if !is_builtin(&call.function) {
        if scope.is_host_function(&call.function) {
            return Err(ExecError::MustAwait(call.function.clone()));
        }
        return Err(ExecError::UnknownFunction(call.function.clone()));
    }
    let (args, kwargs) = eval_args(call, scope)?;
    if let Some(name) = kwargs.keys().next() {
        return Err(ExecError::Type(format!(
            "{}() got an unexpected keyword argument '{}'",
            call.function, name
        )));
    }
    call_builtin(&call.function, &args)
}

fn call_builtin(name: &str, args: &[Value]) -> Result<Value, ExecError> {
    match name {
        "len" => {
            let [value] = expect_args::<1>(name, args)?;
            let len = match value {
                Value::Str(text) => text.chars().count(),
                Value::List(items) => items.len(),
                Value::Dict(map) => map.len(),
                other => {
                    return Err(ExecError::Type(format!(
                        "object of type '{}' has no len()",
                        other.type_name()
                    )));
                }
            };
            Ok(Value::Int(len as i64))
        }
        "str" => {
            let [value] = expect_args::<1>(name, args)?;
            Ok(Value::Str(value.to_string()))
        }
        "repr" => {
            let [value] = expect_args::<1>(name, args)?;
            Ok(Value::Str(value.repr()))
        }
        "bool" => {
            let [value] = expect_args::<1>(name, args)?;
            Ok(Value::Bool(value.is_truthy()))
        }
        "int" => {
            let [value] = expect_args::<1>(name, args)?;
            match value {
                Value::Int(num) => Ok(Value::Int(*num)),
                Value::Bool(flag) => Ok(Value::Int(i64::from(*flag))),
                Value::Float(num) if num.is_finite() => Ok(Value::Int(num.trunc() as i64)),
                Value::Str(text) => text.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                    ExecError::Type(format!("invalid literal for int(): {}", value.repr()))
                }),
                other => Err(ExecError::Type(format!(
                    "int() argument must be a string or a number, not '{}'",
                    other.type_name()
                ))),
            }
        }
        "float" => {
            let [value] = expect_args::<1>(name, args)?;
            match value {
                Value::Str(text) => text.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                    ExecError::Type(format!("could not convert string to float: {}", value.repr()))
                }),
                other => as_f64(other).map(Value::Float),
            }
        }
        "abs" => {
            let [value] = expect_args::<1>(name, args)?;
            match value {
                Value::Int(num) => num
                    .checked_abs()
                    .map(Value::Int)
                    .ok_or_else(|| ExecError::Type("integer overflow".into())),
                Value::Float(num) => Ok(Value::Float(num.abs())),
                other => Err(ExecError::Type(format!(
                    "bad operand type for abs(): '{}'",
                    other.type_name()
                ))),
            }
        }
        "range" => {
            let ints = args
                .iter()
                .map(|arg| {
                    arg.as_int().ok_or_else(|| {
                        ExecError::Type(format!(
                            "'{}' object cannot be interpreted as an integer",
                            arg.type_name()
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let (start, stop, step) = match ints.as_slice() {
                [stop] => (0, *stop, 1),
                [start, stop] => (*start, *stop, 1),
                [start, stop, step] => (*start, *stop, *step),
                _ => return Err(arity_error(name, "1 to 3", args.len())),
            };
            if step == 0 {
                return Err(ExecError::Type("range() arg 3 must not be zero".into()));
            }
            let span = if step > 0 {
                i128::from(stop) - i128::from(start)
            } else {
                i128::from(start) - i128::from(stop)
            };
            if span / i128::from(step).abs() > i128::from(MAX_RANGE_LEN) {
                return Err(ExecError::Type(format!(
                    "range() longer than {} items is not supported",
                    MAX_RANGE_LEN
                )));
            }
            let mut items = Vec::new();
            let mut current = start;
            while (step > 0 && current < stop) || (step < 0 && current > stop) {
                items.push(Value::Int(current));
                match current.checked_add(step) {
                    Some(next) => current = next,
                    None => break,
                }
            }
            Ok(Value::List(items))
        }
        "min" | "max" => {
            let items: Vec<Value> = match args {
                [Value::List(items)] => items.clone(),
                [] => return Err(arity_error(name, "at least 1", 0)),
                many => many.to_vec(),
            };
            let mut iter = items.into_iter();
            let mut best = iter
                .next()
                .ok_or_else(|| ExecError::Type(format!("{}() arg is an empty sequence", name)))?;
            for item in iter {
                let ordering = compare(&item, &best)?;
                let better = if name == "min" {
                    ordering == Ordering::Less
                } else {
                    ordering == Ordering::Greater
                };
                if better {
                    best = item;
                }
            }
            Ok(best)
        }
        "sorted" => {
            let [value] = expect_args::<1>(name, args)?;
            let mut items = iterate(value)?;
            let mut failure = None;
            items.sort_by(|a, b| {
                compare(a, b).unwrap_or_else(|err| {
                    failure.get_or_insert(err);
                    Ordering::Equal
                })
            });
            match failure {
                Some(err) => Err(err),
                None => Ok(Value::List(items)),
            }
        }
        "sum" => {
            let [value] = expect_args::<1>(name, args)?;
            let mut total = Value::Int(0);
            for item in iterate(value)? {
                total = binary_op(BinaryOp::Add, &total, &item)?;
            }
            Ok(total)
        }
        "list" => {
            let [value] = expect_args::<1>(name, args)?;
            Ok(Value::List(iterate(value)?))
        }
        "print" => {
            let line = args
                .iter()
                .map(Value::to_string)
                .collect::<Vec<_>>()
                .join(" ");
            tracing::info!(target: "encore::print", "{}", line);
            Ok(Value::None)
        }
        "format" => {
            let [value, spec] = expect_args::<2>(name, args)?;
            let spec = spec.as_str().unwrap_or_default();
            Ok(Value::Str(apply_format_spec(value, spec)))
        }
        other => Err(ExecError::UnknownFunction(other.to_string())),
    }
}

fn apply_format_spec(value: &Value, spec: &str) -> String {
    if let Some(precision) = spec
        .strip_prefix('.')
        .and_then(|rest| rest.strip_suffix('f'))
        .and_then(|digits| digits.parse::<usize>().ok())
    {
        if let Ok(num) = as_f64(value) {
            return format!("{:.*}", precision, num);
        }
    }
    if spec == "d" {
        if let Some(num) = value.as_int() {
            return num.to_string();
        }
    }
    value.to_string()
}

fn expect_args<'a, const N: usize>(
    name: &str,
    args: &'a [Value],
) -> Result<&'a [Value; N], ExecError> {
    args.try_into()
        .map_err(|_| arity_error(name, &N.to_string(), args.len()))
}

fn arity_error(name: &str, expected: &str, got: usize) -> ExecError {
    ExecError::Type(format!(
        "{}() takes {} argument(s) but {} were given",
        name, expected, got
    ))
}

/// Items produced by iterating a value (`for` loops, `list()`, `sorted()`).
pub fn iterate(value: &Value) -> Result<Vec<Value>, ExecError> {
    match value {
        Value::List(items) => Ok(items.clone()),
        Value::Str(text) => Ok(text.chars().map(|c| Value::Str(c.to_string())).collect()),
        Value::Dict(map) => Ok(map.keys().cloned().map(Value::Str).collect()),
        other => Err(ExecError::Type(format!(
            "'{}' object is not iterable",
            other.type_name()
        ))),
    }
}

/// Convert a value into a dict key.
pub fn dict_key(value: Value) -> Result<String, ExecError> {
    match value {
        Value::Str(text) => Ok(text),
        other => Err(ExecError::Type(format!(
            "dict keys must be strings, not '{}'",
            other.type_name()
        ))),
    }
}

/// Resolve `container[index]`.
pub fn index_value(container: &Value, index: &Value) -> Result<Value, ExecError> {
    match container {
        Value::List(items) => {
            let idx = resolve_index(items.len(), index)?;
            Ok(items[idx].clone())
        }
        Value::Str(text) => {
            let chars: Vec<char> = text.chars().collect();
            let idx = resolve_index(chars.len(), index)?;
            Ok(Value::Str(chars[idx].to_string()))
        }
        Value::Dict(map) => {
            let key = index
                .as_str()
                .ok_or_else(|| ExecError::Lookup(format!("dict key {} is not a string", index.repr())))?;
            map.get(key)
                .cloned()
                .ok_or_else(|| ExecError::Lookup(format!("key {} not found", index.repr())))
        }
        other => Err(ExecError::Type(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

/// Translate a possibly negative index into a bounds-checked position.
pub fn resolve_index(len: usize, index: &Value) -> Result<usize, ExecError> {
    let raw = index.as_int().ok_or_else(|| {
        ExecError::Type(format!(
            "indices must be integers, not '{}'",
            index.type_name()
        ))
    })?;
    let len = len as i64;
    let idx = if raw < 0 { raw + len } else { raw };
    if idx < 0 || idx >= len {
        return Err(ExecError::Lookup(format!("index {} out of range", raw)));
    }
    Ok(idx as usize)
}

fn call_method(receiver: &Value, method: &str, args: &[Value]) -> Result<Value, ExecError> {
    match (receiver, method) {
        (Value::Str(text), "upper") => Ok(Value::Str(text.to_uppercase())),
        (Value::Str(text), "lower") => Ok(Value::Str(text.to_lowercase())),
        (Value::Str(text), "strip") => Ok(Value::Str(text.trim().to_string())),
        (Value::Str(text), "startswith") => {
            let [prefix] = expect_args::<1>(method, args)?;
            Ok(Value::Bool(text.starts_with(str_arg(method, prefix)?)))
        }
        (Value::Str(text), "endswith") => {
            let [suffix] = expect_args::<1>(method, args)?;
            Ok(Value::Bool(text.ends_with(str_arg(method, suffix)?)))
        }
        (Value::Str(text), "replace") => {
            let [from, to] = expect_args::<2>(method, args)?;
            Ok(Value::Str(
                text.replace(str_arg(method, from)?, str_arg(method, to)?),
            ))
        }
        (Value::Str(text), "split") => {
            let parts: Vec<Value> = match args {
                [] => text
                    .split_whitespace()
                    .map(|part| Value::Str(part.to_string()))
                    .collect(),
                [sep] => text
                    .split(str_arg(method, sep)?)
                    .map(|part| Value::Str(part.to_string()))
                    .collect(),
                _ => return Err(arity_error(method, "0 or 1", args.len())),
            };
            Ok(Value::List(parts))
        }
        (Value::Str(sep), "join") => {
            let [items] = expect_args::<1>(method, args)?;
            let pieces = iterate(items)?
                .into_iter()
                .map(|item| match item {
                    Value::Str(text) => Ok(text),
                    other => Err(ExecError::Type(format!(
                        "sequence item: expected str instance, {} found",
                        other.type_name()
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Str(pieces.join(sep)))
        }
        (Value::Dict(map), "get") => {
            let (key, default) = match args {
                [key] => (key, Value::None),
                [key, default] => (key, default.clone()),
                _ => return Err(arity_error(method, "1 or 2", args.len())),
            };
            let key = str_arg(method, key)?;
            Ok(map.get(key).cloned().unwrap_or(default))
        }
        (Value::Dict(map), "keys") => Ok(Value::List(
            map.keys().cloned().map(Value::Str).collect(),
        )),
        (Value::Dict(map), "values") => Ok(Value::List(map.values().cloned().collect())),
        (Value::Dict(map), "items") => Ok(Value::List(
            map.iter()
                .map(|(key, value)| Value::List(vec![Value::Str(key.clone()), value.clone()]))
                .collect(),
        )),
        (Value::List(items), "index") => {
            let [needle] = expect_args::<1>(method, args)?;
            items
                .iter()
                .position(|item| values_equal(item, needle))
                .map(|pos| Value::Int(pos as i64))
                .ok_or_else(|| ExecError::Lookup(format!("{} is not in list", needle.repr())))
        }
        (Value::List(items), "count") => {
            let [needle] = expect_args::<1>(method, args)?;
            Ok(Value::Int(
                items.iter().filter(|item| values_equal(item, needle)).count() as i64,
            ))
        }
        (other, _) => Err(ExecError::Type(format!(
            "'{}' object has no method '{}'",
            other.type_name(),
            method
        ))),
    }
}

/// Apply a mutating method to `receiver` in place, returning the call result.
pub fn call_mutating_method(
    receiver: &mut Value,
    method: &str,
    args: Vec<Value>,
) -> Result<Value, ExecError> {
    match (receiver, method) {
        (Value::List(items), "append") => {
            let [item]: [Value; 1] = args
                .try_into()
                .map_err(|args: Vec<Value>| arity_error(method, "1", args.len()))?;
            items.push(item);
            Ok(Value::None)
        }
        (Value::List(items), "extend") => {
            let [other]: [Value; 1] = args
                .try_into()
                .map_err(|args: Vec<Value>| arity_error(method, "1", args.len()))?;
            items.extend(iterate(&other)?);
            Ok(Value::None)
        }
        (Value::List(items), "insert") => {
            let [position, item]: [Value; 2] = args
                .try_into()
                .map_err(|args: Vec<Value>| arity_error(method, "2", args.len()))?;
            let raw = position
                .as_int()
                .ok_or_else(|| ExecError::Type("insert position must be an integer".into()))?;
            let len = items.len() as i64;
            let idx = if raw < 0 { (raw + len).max(0) } else { raw.min(len) };
            items.insert(idx as usize, item);
            Ok(Value::None)
        }
        (Value::List(items), "pop") => match args.as_slice() {
            [] => items
                .pop()
                .ok_or_else(|| ExecError::Lookup("pop from empty list".into())),
            [index] => {
                let idx = resolve_index(items.len(), index)?;
                Ok(items.remove(idx))
            }
            _ => Err(arity_error(method, "0 or 1", args.len())),
        },
        (Value::Dict(map), "pop") => match args.as_slice() {
            [key] => {
                let key = str_arg(method, key)?;
                map.remove(key)
                    .ok_or_else(|| ExecError::Lookup(format!("key '{}' not found", key)))
            }
            [key, default] => {
                let key = str_arg(method, key)?;
                Ok(map.remove(key).unwrap_or_else(|| default.clone()))
            }
            _ => Err(arity_error(method, "1 or 2", args.len())),
        },
        (Value::Dict(map), "update") => {
            let [other]: [Value; 1] = args
                .try_into()
                .map_err(|args: Vec<Value>| arity_error(method, "1", args.len()))?;
            let Value::Dict(other) = other else {
                return Err(ExecError::Type("update() expects a dict".into()));
            };
            map.extend(other);
            Ok(Value::None)
        }
        (other, _) => Err(ExecError::Type(format!(
            "'{}' object has no method '{}'",
            other.type_name(),
            method
        ))),
    }
}

fn str_arg<'a>(method: &str, value: &'a Value) -> Result<&'a str, ExecError> {
    value.as_str().ok_or_else(|| {
        ExecError::Type(format!(
            "{}() argument must be str, not '{}'",
            method,
            value.type_name()
        ))
    })
}

fn as_f64(value: &Value) -> Result<f64, ExecError> {
    match value {
        Value::Int(num) => Ok(*num as f64),
        Value::Float(num) => Ok(*num),
        Value::Bool(flag) => Ok(if *flag { 1.0 } else { 0.0 }),
        other => Err(ExecError::Type(format!(
            "expected a number, found '{}'",
            other.type_name()
        ))),
    }
}

fn is_number(value: &Value) -> bool {
    matches!(value, Value::Int(_) | Value::Float(_) | Value::Bool(_))
}

/// Equality with Python's numeric coercion (`1 == 1.0`).
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Float(_), _) | (_, Value::Float(_)) if is_number(left) && is_number(right) => {
            as_f64(left).ok() == as_f64(right).ok()
        }
        (Value::Int(_) | Value::Bool(_), Value::Int(_) | Value::Bool(_)) => {
            left.as_int() == right.as_int()
        }
        (Value::List(a), Value::List(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Dict(a), Value::Dict(b)) => {
            a.len() == b.len()
                && a.iter()
                    .zip(b)
                    .all(|((ka, va), (kb, vb))| ka == kb && values_equal(va, vb))
        }
        _ => left == right,
    }
}

/// Ordering for `<`, `min`, `sorted` and friends.
pub fn compare(left: &Value, right: &Value) -> Result<Ordering, ExecError> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
        (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
        _ if is_number(left) && is_number(right) => {
            let (a, b) = (as_f64(left)?, as_f64(right)?);
            a.partial_cmp(&b)
                .ok_or_else(|| ExecError::Type("cannot order NaN".into()))
        }
        (Value::List(a), Value::List(b)) => {
            for (x, y) in a.iter().zip(b) {
                let ordering = compare(x, y)?;
                if ordering != Ordering::Equal {
                    return Ok(ordering);
                }
            }
            Ok(a.len().cmp(&b.len()))
        }
        _ => Err(ExecError::Type(format!(
            "'<' not supported between instances of '{}' and '{}'",
            left.type_name(),
            right.type_name()
        ))),
    }
}

/// Apply a binary operator.
pub fn binary_op(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ExecError> {
    let unsupported = || {
        ExecError::Type(format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op.symbol(),
            left.type_name(),
            right.type_name()
        ))
    };
    let overflow = || ExecError::Type("integer overflow".into());

    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(left, right))),
        BinaryOp::NotEq => Ok(Value::Bool(!values_equal(left, right))),
        BinaryOp::Lt => Ok(Value::Bool(compare(left, right)? == Ordering::Less)),
        BinaryOp::LtE => Ok(Value::Bool(compare(left, right)? != Ordering::Greater)),
        BinaryOp::Gt => Ok(Value::Bool(compare(left, right)? == Ordering::Greater)),
        BinaryOp::GtE => Ok(Value::Bool(compare(left, right)? != Ordering::Less)),
        BinaryOp::In | BinaryOp::NotIn => {
            let found = match right {
                Value::List(items) => items.iter().any(|item| values_equal(item, left)),
                Value::Dict(map) => left.as_str().is_some_and(|key| map.contains_key(key)),
                Value::Str(text) => match left {
                    Value::Str(needle) => text.contains(needle.as_str()),
                    _ => return Err(unsupported()),
                },
                _ => return Err(unsupported()),
            };
            Ok(Value::Bool(if op == BinaryOp::In { found } else { !found }))
        }
        BinaryOp::Add => match (left, right) {
            (Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{}{}", a, b))),
            (Value::List(a), Value::List(b)) => {
                Ok(Value::List(a.iter().chain(b.iter()).cloned().collect()))
            }
            _ => arithmetic(left, right, i64::checked_add, |a, b| a + b)
                .ok_or_else(unsupported)?
                .ok_or_else(overflow),
        },
        BinaryOp::Sub => arithmetic(left, right, i64::checked_sub, |a, b| a - b)
            .ok_or_else(unsupported)?
            .ok_or_else(overflow),
        BinaryOp::Mul => match (left, right) {
            (Value::Str(text), count) | (count, Value::Str(text)) if count.as_int().is_some() => {
                let times = repeat_count(text.len(), count.as_int().unwrap_or(0))?;
                Ok(Value::Str(text.repeat(times)))
            }
            (Value::List(items), count) | (count, Value::List(items))
                if count.as_int().is_some() =>
            {
                let times = repeat_count(items.len(), count.as_int().unwrap_or(0))?;
                let mut out = Vec::with_capacity(items.len() * times);
                for _ in 0..times {
                    out.extend(items.iter().cloned());
                }
                Ok(Value::List(out))
            }
            _ => arithmetic(left, right, i64::checked_mul, |a, b| a * b)
                .ok_or_else(unsupported)?
                .ok_or_else(overflow),
        },
        BinaryOp::Div => {
            if !is_number(left) || !is_number(right) {
                return Err(unsupported());
            }
            let divisor = as_f64(right)?;
            if divisor == 0.0 {
                return Err(ExecError::ZeroDivision);
            }
            Ok(Value::Float(as_f64(left)? / divisor))
        }
        BinaryOp::FloorDiv | BinaryOp::Mod => {
            if !is_number(left) || !is_number(right) {
                return Err(unsupported());
            }
            match (left.as_int(), right.as_int()) {
                (Some(a), Some(b)) => {
                    if b == 0 {
                        return Err(ExecError::ZeroDivision);
                    }
                    if a == i64::MIN && b == -1 {
                        return Err(overflow());
                    }
                    let quotient = a.div_euclid(b) - i64::from(b < 0 && a.rem_euclid(b) != 0);
                    let remainder = a - quotient * b;
                    Ok(Value::Int(if op == BinaryOp::FloorDiv {
                        quotient
                    } else {
                        remainder
                    }))
                }
                _ => {
                    let (a, b) = (as_f64(left)?, as_f64(right)?);
                    if b == 0.0 {
                        return Err(ExecError::ZeroDivision);
                    }
                    let quotient = (a / b).floor();
                    Ok(Value::Float(if op == BinaryOp::FloorDiv {
                        quotient
                    } else {
                        a - quotient * b
                    }))
                }
            }
        }
    }
}

/// Numeric arithmetic: `None` when the operands are not numbers, `Some(None)`
/// on integer overflow.
fn arithmetic(
    left: &Value,
    right: &Value,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Option<Option<Value>> {
    if !is_number(left) || !is_number(right) {
        return None;
    }
    match (left, right) {
        (Value::Float(_), _) | (_, Value::Float(_)) => {
            let a = as_f64(left).ok()?;
            let b = as_f64(right).ok()?;
            Some(Some(Value::Float(float_op(a, b))))
        }
        _ => {
            let a = left.as_int()?;
            let b = right.as_int()?;
            Some(int_op(a, b).map(Value::Int))
        }
    }
}

/// Repetition count for `seq * n`, refusing results over `MAX_REPEAT_LEN`
fn repeat_count(len: usize, times: i64) -> Result<usize, ExecError> {
    let times = usize::try_from(times.max(0)).unwrap_or(usize::MAX);
    match len.checked_mul(times) {
        Some(total) if total <= MAX_REPEAT_LEN => Ok(times),
        _ => Err(ExecError::Type(format!(
            "repeated sequence longer than {} items is not supported",
            MAX_REPEAT_LEN
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::parser::parse_expression;

    struct TestScope {
        ns: Namespace,
    }

    impl Scope for TestScope {
        fn namespace(&self) -> &Namespace {
            &self.ns
        }

        fn state_var(&self, name: &str) -> Option<Value> {
            (name == "order").then(|| Value::Int(7))
        }

        fn is_host_function(&self, name: &str) -> bool {
            name == "Say"
        }
    }

    fn eval(src: &str) -> Result<Value, ExecError> {
        let mut ns = Namespace::new();
        ns.set("x", Value::Int(10));
        ns.set("items", Value::List(vec![Value::Int(3), Value::Int(1)]));
        let scope = TestScope { ns };
        eval_expr(&parse_expression(src).expect("parse"), &scope)
    }

    #[test]
    fn arithmetic_follows_python_rules() {
        assert_eq!(eval("x + 2 * 3").unwrap(), Value::Int(16));
        assert_eq!(eval("7 // 2").unwrap(), Value::Int(3));
        assert_eq!(eval("-7 // 2").unwrap(), Value::Int(-4));
        assert_eq!(eval("-7 % 3").unwrap(), Value::Int(2));
        assert_eq!(eval("7 % -3").unwrap(), Value::Int(-2));
        assert_eq!(eval("x / 4").unwrap(), Value::Float(2.5));
        assert_eq!(eval("1 / 0").unwrap_err(), ExecError::ZeroDivision);
    }

    #[test]
    fn undefined_variable_is_distinguished() {
        let err = eval("y + 1").unwrap_err();
        assert!(err.is_undefined_variable());
        assert_eq!(err.to_string(), "variable `y` was read before it was assigned");
    }

    #[test]
    fn host_calls_must_be_awaited() {
        let err = eval("Say('hi')").unwrap_err();
        assert_eq!(err, ExecError::MustAwait("Say".into()));
    }

    #[test]
    fn state_vars_and_fstrings() {
        assert_eq!(eval("f'order {$order}'").unwrap(), Value::from("order 7"));
        assert!(eval("$missing").unwrap_err().is_undefined_variable());
    }

    #[test]
    fn builtins_and_methods() {
        assert_eq!(eval("len(items)").unwrap(), Value::Int(2));
        assert_eq!(eval("sorted(items)[0]").unwrap(), Value::Int(1));
        assert_eq!(eval("', '.join(['a', 'b'])").unwrap(), Value::from("a, b"));
        assert_eq!(eval("{'k': 1}.get('z', 5)").unwrap(), Value::Int(5));
        assert_eq!(eval("format(2, '.2f')").unwrap(), Value::from("2.00"));
        assert_eq!(eval("3 in items and not 4 in items").unwrap(), Value::Bool(true));
    }

    #[test]
    fn huge_repetition_is_an_error() {
        assert!(matches!(eval("[1, 2, 3] * 9223372036854775807"), Err(ExecError::Type(_))));
        assert!(matches!(eval("'ab' * 9223372036854775807"), Err(ExecError::Type(_))));
        assert!(matches!(eval("'ab' * 2000000"), Err(ExecError::Type(_))));
        assert_eq!(eval("'ab' * 2").unwrap(), Value::from("abab"));
        assert_eq!(eval("items * -1").unwrap(), Value::List(Vec::new()));
    }

    #[test]
    fn range_near_integer_limits() {
        assert_eq!(
            eval("range(9223372036854775806, 9223372036854775807, 5)").unwrap(),
            Value::List(vec![Value::Int(9223372036854775806)])
        );
        assert_eq!(
            eval("range(-9223372036854775807, -9223372036854775807 - 1, -3)").unwrap(),
            Value::List(vec![Value::Int(-9223372036854775807)])
        );
        assert!(matches!(
            eval("range(-9223372036854775807, 9223372036854775807)"),
            Err(ExecError::Type(_))
        ));
    }
}
