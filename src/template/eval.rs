//! Pure interpreter over [`Expr`] trees.

use indexmap::IndexMap;
use std::cmp::Ordering;

use super::parser::{BinaryOp, Expr, UnaryOp};
use super::value::Value;
use super::{TemplateEngine, TemplateError, Vars};

/// Lazily-resolved variables may reference each other; this bounds the chain.
const MAX_DEPTH: usize = 16;

pub(crate) struct Evaluator<'a> {
    engine: &'a TemplateEngine,
    vars: &'a Vars,
    depth: usize,
}

impl<'a> Evaluator<'a> {
    pub(crate) fn new(engine: &'a TemplateEngine, vars: &'a Vars, depth: usize) -> Self {
        Self {
            engine,
            vars,
            depth,
        }
    }

    pub(crate) fn eval(&self, expr: &Expr) -> Result<Value, TemplateError> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Var(name) => self.resolve_var(name),
            Expr::List(items) => {
                let values = items
                    .iter()
                    .map(|e| self.eval(e))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(values
                    .iter()
                    .find(|v| v.is_undefined())
                    .cloned()
                    .unwrap_or(Value::List(values)))
            }
            Expr::Map(pairs) => {
                let mut map = IndexMap::with_capacity(pairs.len());
                for (k, v) in pairs {
                    let key = self.eval(k)?;
                    if key.is_undefined() {
                        return Ok(key);
                    }
                    let value = self.eval(v)?;
                    if value.is_undefined() {
                        return Ok(value);
                    }
                    map.insert(key.to_string(), value);
                }
                Ok(Value::Map(map))
            }
            Expr::Attr(base, attr) => {
                let base_value = self.eval(base)?;
                Ok(self.get_member(expr, base_value, &Value::Str(attr.clone())))
            }
            Expr::Index(base, index) => {
                let base_value = self.eval(base)?;
                let index_value = self.eval(index)?;
                if index_value.is_undefined() {
                    return Ok(index_value);
                }
                Ok(self.get_member(expr, base_value, &index_value))
            }
            Expr::Call { name, args } => self.call(name, args),
            Expr::Filter { expr, name, args } => self.filter(expr, name, args),
            Expr::Test {
                expr,
                name,
                negated,
            } => {
                let value = self.eval(expr)?;
                match self.test(name, &value)? {
                    Value::Bool(b) => Ok(Value::Bool(b != *negated)),
                    other => Ok(other),
                }
            }
            Expr::Unary(op, inner) => {
                let value = self.eval(inner)?;
                match (op, value) {
                    (_, v @ Value::Undefined(_)) => Ok(v),
                    (UnaryOp::Not, v) => Ok(Value::Bool(!v.is_truthy())),
                    (UnaryOp::Neg, Value::Int(i)) => i
                        .checked_neg()
                        .map(Value::Int)
                        .ok_or_else(|| TemplateError::Type(format!("cannot negate {}", i))),
                    (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
                    (UnaryOp::Neg, v) => Err(type_error("negate", &v, &v)),
                }
            }
            Expr::Binary(op, left, right) => self.binary(*op, left, right),
        }
    }

    fn resolve_var(&self, name: &str) -> Result<Value, TemplateError> {
        let Some(json) = self.vars.get(name) else {
            return Ok(Value::Undefined(name.to_string()));
        };
        match json {
            serde_json::Value::String(s) if TemplateEngine::is_template(s) => {
                if self.depth >= MAX_DEPTH {
                    return Err(TemplateError::Recursion(name.to_string()));
                }
                match self.engine.render_at_depth(s, self.vars, self.depth + 1) {
                    Err(TemplateError::UndefinedVariable(inner)) => Ok(Value::Undefined(inner)),
                    other => other,
                }
            }
            other => Ok(match TemplateEngine::as_literal(other) {
                Some(text) => Value::Str(text.to_string()),
                None => Value::from_json(other),
            }),
        }
    }

    fn get_member(&self, expr: &Expr, base: Value, key: &Value) -> Value {
        let missing = || Value::Undefined(expr.path().unwrap_or_else(|| format!("[{}]", key)));
        match (base, key) {
            (v @ Value::Undefined(_), _) => match expr.path() {
                Some(path) => Value::Undefined(path),
                None => v,
            },
            (Value::Map(mut map), key) => map.shift_remove(&key.to_string()).unwrap_or_else(missing),
            (Value::List(mut items), Value::Int(i)) => {
                let len = items.len() as i64;
                let idx = if *i < 0 { len + i } else { *i };
                if (0..len).contains(&idx) {
                    items.swap_remove(idx as usize)
                } else {
                    missing()
                }
            }
            (Value::Str(s), Value::Int(i)) => {
                let chars: Vec<char> = s.chars().collect();
                let len = chars.len() as i64;
                let idx = if *i < 0 { len + i } else { *i };
                if (0..len).contains(&idx) {
                    Value::Str(chars[idx as usize].to_string())
                } else {
                    missing()
                }
            }
            _ => missing(),
        }
    }

    fn eval_args(&self, args: &[Expr]) -> Result<Result<Vec<Value>, Value>, TemplateError> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            let v = self.eval(arg)?;
            if v.is_undefined() {
                return Ok(Err(v));
            }
            values.push(v);
        }
        Ok(Ok(values))
    }

    fn call(&self, name: &str, args: &[Expr]) -> Result<Value, TemplateError> {
        if name != "lookup" {
            return Err(TemplateError::UnknownFunction(name.to_string()));
        }
        let values = match self.eval_args(args)? {
            Ok(values) => values,
            Err(undefined) => return Ok(undefined),
        };
        let Some((kind, rest)) = values.split_first() else {
            return Err(TemplateError::Type(
                "lookup() needs a plugin name".to_string(),
            ));
        };
        let kind = kind.to_string();
        let rest: Vec<String> = rest.iter().map(ToString::to_string).collect();
        let rest: Vec<&str> = rest.iter().map(String::as_str).collect();

        let (registry, context) = self.engine.lookups();
        let results = registry.lookup(&kind, &rest, context)?;
        Ok(Value::Str(results.join(",")))
    }

    fn filter(&self, input: &Expr, name: &str, args: &[Expr]) -> Result<Value, TemplateError> {
        let value = self.eval(input)?;

        if name == "default" || name == "d" {
            let fallback = match args.first() {
                Some(arg) => self.eval(arg)?,
                None => Value::Str(String::new()),
            };
            let on_falsy = match args.get(1) {
                Some(arg) => self.eval(arg)?.is_truthy(),
                None => false,
            };
            let use_fallback = value.is_undefined() || (on_falsy && !value.is_truthy());
            return Ok(if use_fallback { fallback } else { value });
        }

        if value.is_undefined() {
            return Ok(value);
        }
        let args = match self.eval_args(args)? {
            Ok(args) => args,
            Err(undefined) => return Ok(undefined),
        };

        let result = match (name, value) {
            ("length" | "count", Value::Str(s)) => Value::Int(s.chars().count() as i64),
            ("length" | "count", Value::List(items)) => Value::Int(items.len() as i64),
            ("length" | "count", Value::Map(map)) => Value::Int(map.len() as i64),
            ("lower", v) => Value::Str(v.to_string().to_lowercase()),
            ("upper", v) => Value::Str(v.to_string().to_uppercase()),
            ("trim", v) => Value::Str(v.to_string().trim().to_string()),
            ("string", v) => Value::Str(v.to_string()),
            ("int", v) => Value::Int(to_int(&v)),
            ("bool", v) => Value::Bool(to_bool(&v)),
            ("join", Value::List(items)) => {
                let sep = args.first().map(ToString::to_string).unwrap_or_default();
                Value::Str(
                    items
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(&sep),
                )
            }
            ("basename", v) => {
                let s = v.to_string();
                Value::Str(s.rsplit('/').next().unwrap_or_default().to_string())
            }
            ("dirname", v) => {
                let s = v.to_string();
                Value::Str(match s.rfind('/') {
                    Some(0) => "/".to_string(),
                    Some(idx) => s[..idx].to_string(),
                    None => String::new(),
                })
            }
            ("first", Value::List(mut items)) => {
                if items.is_empty() {
                    Value::Undefined(format!("{}|first", describe(input)))
                } else {
                    items.swap_remove(0)
                }
            }
            ("last", Value::List(mut items)) => items
                .pop()
                .unwrap_or_else(|| Value::Undefined(format!("{}|last", describe(input)))),
            (
                "length" | "count" | "join" | "first" | "last",
                v,
            ) => {
                return Err(TemplateError::Type(format!(
                    "filter '{}' cannot be applied to a {}",
                    name,
                    v.type_name()
                )))
            }
            _ => return Err(TemplateError::UnknownFilter(name.to_string())),
        };
        Ok(result)
    }

    fn test(&self, name: &str, value: &Value) -> Result<Value, TemplateError> {
        match name {
            "defined" => return Ok(Value::Bool(!value.is_undefined())),
            "undefined" => return Ok(Value::Bool(value.is_undefined())),
            _ => {}
        }
        if value.is_undefined() {
            return Ok(value.clone());
        }
        let flag = |key: &str| match value {
            Value::Map(map) => map.get(key).map(Value::is_truthy).unwrap_or(false),
            _ => false,
        };
        let result = match name {
            "none" => matches!(value, Value::None),
            "failed" => flag("failed"),
            "changed" => flag("changed"),
            "skipped" => flag("skipped"),
            "succeeded" | "success" => !flag("failed"),
            "string" => matches!(value, Value::Str(_)),
            "number" => matches!(value, Value::Int(_) | Value::Float(_)),
            "mapping" => matches!(value, Value::Map(_)),
            _ => return Err(TemplateError::UnknownTest(name.to_string())),
        };
        Ok(Value::Bool(result))
    }

    fn binary(&self, op: BinaryOp, left: &Expr, right: &Expr) -> Result<Value, TemplateError> {
        let l = self.eval(left)?;
        if l.is_undefined() {
            return Ok(l);
        }

        match op {
            BinaryOp::And if !l.is_truthy() => return Ok(l),
            BinaryOp::Or if l.is_truthy() => return Ok(l),
            _ => {}
        }

        let r = self.eval(right)?;
        if r.is_undefined() {
            return Ok(r);
        }

        let ordering = |l: &Value, r: &Value| -> Result<Ordering, TemplateError> {
            l.partial_order(r).ok_or_else(|| type_error("compare", l, r))
        };

        Ok(match op {
            BinaryOp::And | BinaryOp::Or => r,
            BinaryOp::Eq => Value::Bool(l.loose_eq(&r)),
            BinaryOp::Ne => Value::Bool(!l.loose_eq(&r)),
            BinaryOp::Lt => Value::Bool(ordering(&l, &r)? == Ordering::Less),
            BinaryOp::Le => Value::Bool(ordering(&l, &r)? != Ordering::Greater),
            BinaryOp::Gt => Value::Bool(ordering(&l, &r)? == Ordering::Greater),
            BinaryOp::Ge => Value::Bool(ordering(&l, &r)? != Ordering::Less),
            BinaryOp::In => Value::Bool(contains(&r, &l)?),
            BinaryOp::NotIn => Value::Bool(!contains(&r, &l)?),
            BinaryOp::Concat => Value::Str(format!("{}{}", l, r)),
            BinaryOp::Add => match (l, r) {
                (Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_add(b)),
                (Value::Str(a), Value::Str(b)) => Value::Str(a + &b),
                (Value::List(mut a), Value::List(b)) => {
                    a.extend(b);
                    Value::List(a)
                }
                (l, r) => match (l.as_f64(), r.as_f64()) {
                    (Some(a), Some(b)) => Value::Float(a + b),
                    _ => return Err(type_error("add", &l, &r)),
                },
            },
            BinaryOp::Sub => match (l, r) {
                (Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_sub(b)),
                (l, r) => match (l.as_f64(), r.as_f64()) {
                    (Some(a), Some(b)) => Value::Float(a - b),
                    _ => return Err(type_error("subtract", &l, &r)),
                },
            },
        })
    }
}

fn describe(expr: &Expr) -> String {
    expr.path().unwrap_or_else(|| "expression".to_string())
}

fn type_error(action: &str, l: &Value, r: &Value) -> TemplateError {
    TemplateError::Type(format!(
        "cannot {} {} and {}",
        action,
        l.type_name(),
        r.type_name()
    ))
}

fn contains(haystack: &Value, needle: &Value) -> Result<bool, TemplateError> {
    match haystack {
        Value::List(items) => Ok(items.iter().any(|item| item.loose_eq(needle))),
        Value::Map(map) => Ok(map.contains_key(&needle.to_string())),
        Value::Str(s) => Ok(s.contains(&needle.to_string())),
        other => Err(TemplateError::Type(format!(
            "'in' needs a list, mapping or string, got {}",
            other.type_name()
        ))),
    }
}

fn to_int(value: &Value) -> i64 {
    match value {
        Value::Int(i) => *i,
        Value::Float(f) => *f as i64,
        Value::Bool(b) => i64::from(*b),
        Value::Str(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
                .unwrap_or(0)
        }
        _ => 0,
    }
}

fn to_bool(value: &Value) -> bool {
    match value {
        Value::Str(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "yes" | "y" | "true" | "on" | "1"
        ),
        other => other.is_truthy(),
    }
}
