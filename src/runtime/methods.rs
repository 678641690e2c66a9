//! Built-in methods on values (`items.append(x)`, `name.upper()`).
//!
//! ## Methods Provided
//!
//! | Receiver | Methods                                                      |
//! |----------|--------------------------------------------------------------|
//! | list     | `append`, `pop`                                              |
//! | string   | `upper`, `lower`, `strip`, `startswith`, `endswith`, `replace`, `split` |
//! | map      | `get`, `keys`, `values`, `items`                             |
//!
//! A map entry holding a function shadows the built-in of the same name.

use crate::ast::Value;
use crate::TemplateError;

fn arity(method: &str, args: &[Value], min: usize, max: usize) -> Result<(), TemplateError> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            min.to_string()
        } else {
            format!("{} to {}", min, max)
        };
        return Err(err_msg!(
            Runtime,
            "{}() takes {} argument(s), got {}",
            method,
            expected,
            args.len()
        ));
    }
    Ok(())
}

fn string_arg(method: &str, value: &Value) -> Result<String, TemplateError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        other => Err(err_msg!(
            Runtime,
            "{}() expects a string argument, got {}",
            method,
            other.type_name()
        )),
    }
}

/// Calls `method` on `target`.
pub fn call_method(target: &Value, method: &str, args: &[Value]) -> Result<Value, TemplateError> {
    match target {
        Value::Map(map) => {
            if let Some(Value::Function(func)) = map.get(method) {
                return func.call(args);
            }
            map_method(target, method, args)
        }
        Value::List(_) => list_method(target, method, args),
        Value::String(_) => string_method(target, method, args),
        other => Err(no_method(other, method)),
    }
}

fn no_method(target: &Value, method: &str) -> TemplateError {
    err_msg!(
        Runtime,
        "'{}' object has no method '{}'",
        target.type_name(),
        method
    )
}

fn list_method(target: &Value, method: &str, args: &[Value]) -> Result<Value, TemplateError> {
    let Value::List(list) = target else {
        return Err(no_method(target, method));
    };
    match method {
        "append" => {
            arity(method, args, 1, 1)?;
            list.push(args[0].clone());
            Ok(Value::None)
        }
        "pop" => {
            arity(method, args, 0, 0)?;
            list.pop()
                .ok_or_else(|| err_msg!(Runtime, "pop from empty list"))
        }
        _ => Err(no_method(target, method)),
    }
}

fn string_method(target: &Value, method: &str, args: &[Value]) -> Result<Value, TemplateError> {
    let Value::String(s) = target else {
        return Err(no_method(target, method));
    };
    let value = match method {
        "upper" => {
            arity(method, args, 0, 0)?;
            Value::String(s.to_uppercase())
        }
        "lower" => {
            arity(method, args, 0, 0)?;
            Value::String(s.to_lowercase())
        }
        "strip" => {
            arity(method, args, 0, 0)?;
            Value::String(s.trim().to_string())
        }
        "startswith" => {
            arity(method, args, 1, 1)?;
            Value::Bool(s.starts_with(&string_arg(method, &args[0])?))
        }
        "endswith" => {
            arity(method, args, 1, 1)?;
            Value::Bool(s.ends_with(&string_arg(method, &args[0])?))
        }
        "replace" => {
            arity(method, args, 2, 2)?;
            let from = string_arg(method, &args[0])?;
            let to = string_arg(method, &args[1])?;
            Value::String(s.replace(&from, &to))
        }
        "split" => {
            arity(method, args, 0, 1)?;
            let parts: Vec<Value> = match args.first() {
                Some(sep) => {
                    let sep = string_arg(method, sep)?;
                    s.split(sep.as_str()).map(Value::from).collect()
                }
                None => s.split_whitespace().map(Value::from).collect(),
            };
            Value::from(parts)
        }
        _ => return Err(no_method(target, method)),
    };
    Ok(value)
}

fn map_method(target: &Value, method: &str, args: &[Value]) -> Result<Value, TemplateError> {
    let Value::Map(map) = target else {
        return Err(no_method(target, method));
    };
    let value = match method {
        "get" => {
            arity(method, args, 1, 2)?;
            let key = args[0].to_string();
            map.get(&key)
                .cloned()
                .unwrap_or_else(|| args.get(1).cloned().unwrap_or(Value::None))
        }
        "keys" => {
            arity(method, args, 0, 0)?;
            Value::from(map.keys().cloned().map(Value::String).collect::<Vec<_>>())
        }
        "values" => {
            arity(method, args, 0, 0)?;
            Value::from(map.values().cloned().collect::<Vec<_>>())
        }
        "items" => {
            arity(method, args, 0, 0)?;
            let items = map
                .iter()
                .map(|(k, v)| Value::from(vec![Value::String(k.clone()), v.clone()]))
                .collect::<Vec<_>>();
            Value::from(items)
        }
        _ => return Err(no_method(target, method)),
    };
    Ok(value)
}
