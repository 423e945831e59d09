//! Tree-walking interpreter for alarm expressions.
//!
//! Names resolve against lambda parameters first (innermost wins), then
//! against the keys of the root document. Numbers are compared as `f64`.

use serde_json::{Map, Value};

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::error::{ExprError, ExprResult};
use crate::parser::parse;

/// Evaluates boolean expressions against JSON documents.
///
/// Alarm checks and the wizard consume this trait so that the expression
/// language can be swapped without touching the control loop.
pub trait Evaluator: Send + Sync {
    /// Check that `expression` is well formed without evaluating it.
    fn validate(&self, expression: &str) -> ExprResult<()>;

    /// Evaluate `expression` against `document`.
    fn evaluate(&self, expression: &str, document: &Value) -> ExprResult<bool>;
}

/// The built-in expression engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExprEngine;

impl ExprEngine {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate a parsed expression to an arbitrary JSON value.
    pub fn eval_value(&self, expr: &Expr, document: &Value) -> ExprResult<Value> {
        Interpreter {
            root: document,
            scopes: Vec::new(),
        }
        .eval(expr)
    }
}

impl Evaluator for ExprEngine {
    fn validate(&self, expression: &str) -> ExprResult<()> {
        parse(expression).map(|_| ())
    }

    fn evaluate(&self, expression: &str, document: &Value) -> ExprResult<bool> {
        let expr = parse(expression)?;
        match self.eval_value(&expr, document)? {
            Value::Bool(b) => Ok(b),
            other => Err(ExprError::NotBoolean(type_name(&other).to_string())),
        }
    }
}

struct Interpreter<'a> {
    root: &'a Value,
    /// Lambda parameter bindings, innermost last.
    scopes: Vec<Vec<(String, Value)>>,
}

impl Interpreter<'_> {
    fn eval(&mut self, expr: &Expr) -> ExprResult<Value> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Ident(name) => self.lookup(name),
            Expr::Member { object, property } => {
                let target = self.eval(object)?;
                member(&target, property, expr)
            }
            Expr::Index { object, index } => {
                let target = self.eval(object)?;
                let index = self.eval(index)?;
                self.index(&target, &index, expr)
            }
            Expr::Call {
                object,
                method,
                args,
            } => {
                let target = self.eval(object)?;
                self.call(&target, method, args, expr)
            }
            Expr::Lambda { .. } => Err(ExprError::Type(
                "a lambda can only be passed to an array method".to_string(),
            )),
            Expr::Unary { op, expr: inner } => {
                let value = self.eval(inner)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!as_bool(&value, "!")?)),
                    UnaryOp::Neg => number(-as_number(&value, "-")?),
                }
            }
            Expr::Binary { left, op, right } => self.binary(left, *op, right),
        }
    }

    fn lookup(&self, name: &str) -> ExprResult<Value> {
        for scope in self.scopes.iter().rev() {
            if let Some((_, v)) = scope.iter().rev().find(|(n, _)| n == name) {
                return Ok(v.clone());
            }
        }
        match self.root.get(name) {
            Some(v) => Ok(v.clone()),
            None => Err(ExprError::UnknownName(name.to_string())),
        }
    }

    fn index(&self, target: &Value, index: &Value, expr: &Expr) -> ExprResult<Value> {
        match (target, index) {
            (Value::Array(items), Value::Number(n)) => {
                let i = n.as_f64().unwrap_or(-1.0);
                if i < 0.0 || i.fract() != 0.0 {
                    return Err(ExprError::Type(format!("invalid array index {n} in {expr}")));
                }
                items
                    .get(i as usize)
                    .cloned()
                    .ok_or_else(|| ExprError::MissingField(expr.to_string()))
            }
            (Value::Object(_), Value::String(key)) => member(target, key, expr),
            (Value::Array(_), other) | (Value::Object(_), other) => Err(ExprError::Type(format!(
                "cannot index {} with {} in {expr}",
                type_name(target),
                type_name(other)
            ))),
            _ => Err(ExprError::Type(format!(
                "cannot index {} in {expr}",
                type_name(target)
            ))),
        }
    }

    fn call(&mut self, target: &Value, method: &str, args: &[Expr], expr: &Expr) -> ExprResult<Value> {
        let items = match target {
            Value::Array(items) => items,
            other => {
                return Err(ExprError::Type(format!(
                    "{method}() called on {} in {expr}",
                    type_name(other)
                )));
            }
        };

        match method {
            "map" => {
                let lambda = lambda_arg(args, 0, 1, method)?;
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.apply(lambda, &[item.clone()])?);
                }
                Ok(Value::Array(out))
            }
            "filter" => {
                let lambda = lambda_arg(args, 0, 1, method)?;
                let mut out = Vec::new();
                for item in items {
                    if self.predicate(lambda, item, method)? {
                        out.push(item.clone());
                    }
                }
                Ok(Value::Array(out))
            }
            "count" => {
                let lambda = lambda_arg(args, 0, 1, method)?;
                let mut n = 0u64;
                for item in items {
                    if self.predicate(lambda, item, method)? {
                        n += 1;
                    }
                }
                Ok(Value::from(n))
            }
            "some" => {
                let lambda = lambda_arg(args, 0, 1, method)?;
                for item in items {
                    if self.predicate(lambda, item, method)? {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            "every" => {
                let lambda = lambda_arg(args, 0, 1, method)?;
                for item in items {
                    if !self.predicate(lambda, item, method)? {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            "reduce" => {
                let lambda = lambda_arg(args, 0, 2, method)?;
                let (mut acc, rest) = match args.get(1) {
                    Some(init) => (self.eval(init)?, &items[..]),
                    None => match items.split_first() {
                        Some((first, rest)) => (first.clone(), rest),
                        None => {
                            return Err(ExprError::Type(format!(
                                "reduce() of empty array with no initial value in {expr}"
                            )));
                        }
                    },
                };
                for item in rest {
                    acc = self.apply(lambda, &[acc, item.clone()])?;
                }
                Ok(acc)
            }
            "sum" => {
                let mut total = 0.0;
                for item in items {
                    total += as_number(item, "sum()")?;
                }
                number(total)
            }
            "includes" => {
                let needle = match args.first() {
                    Some(arg) => self.eval(arg)?,
                    None => return Err(ExprError::Type("includes() needs an argument".to_string())),
                };
                Ok(Value::Bool(items.iter().any(|item| values_equal(item, &needle))))
            }
            other => Err(ExprError::UnknownMethod(other.to_string())),
        }
    }

    fn apply(&mut self, lambda: (&[String], &Expr), values: &[Value]) -> ExprResult<Value> {
        let (params, body) = lambda;
        let bindings = params
            .iter()
            .cloned()
            .zip(values.iter().cloned())
            .collect();
        self.scopes.push(bindings);
        let result = self.eval(body);
        self.scopes.pop();
        result
    }

    fn predicate(&mut self, lambda: (&[String], &Expr), item: &Value, method: &str) -> ExprResult<bool> {
        let value = self.apply(lambda, std::slice::from_ref(item))?;
        as_bool(&value, method)
    }

    fn binary(&mut self, left: &Expr, op: BinaryOp, right: &Expr) -> ExprResult<Value> {
        // Logical operators short-circuit.
        match op {
            BinaryOp::And => {
                let l = as_bool(&self.eval(left)?, "&&")?;
                if !l {
                    return Ok(Value::Bool(false));
                }
                return Ok(Value::Bool(as_bool(&self.eval(right)?, "&&")?));
            }
            BinaryOp::Or => {
                let l = as_bool(&self.eval(left)?, "||")?;
                if l {
                    return Ok(Value::Bool(true));
                }
                return Ok(Value::Bool(as_bool(&self.eval(right)?, "||")?));
            }
            _ => {}
        }

        let l = self.eval(left)?;
        let r = self.eval(right)?;
        match op {
            BinaryOp::Eq => Ok(Value::Bool(values_equal(&l, &r))),
            BinaryOp::NotEq => Ok(Value::Bool(!values_equal(&l, &r))),
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                let ordering = match (&l, &r) {
                    (Value::Number(a), Value::Number(b)) => {
                        let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
                        a.partial_cmp(&b)
                    }
                    (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                    _ => return Err(mismatch(op, &l, &r)),
                };
                let result = match ordering {
                    Some(o) => match op {
                        BinaryOp::Lt => o.is_lt(),
                        BinaryOp::Le => o.is_le(),
                        BinaryOp::Gt => o.is_gt(),
                        _ => o.is_ge(),
                    },
                    None => false,
                };
                Ok(Value::Bool(result))
            }
            BinaryOp::Add => match (&l, &r) {
                (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
                (Value::Number(_), Value::Number(_)) => number(as_number(&l, "+")? + as_number(&r, "+")?),
                _ => Err(mismatch(op, &l, &r)),
            },
            _ => {
                let (a, b) = match (&l, &r) {
                    (Value::Number(_), Value::Number(_)) => (as_number(&l, "")?, as_number(&r, "")?),
                    _ => return Err(mismatch(op, &l, &r)),
                };
                if matches!(op, BinaryOp::Div | BinaryOp::Rem) && b == 0.0 {
                    return Err(ExprError::Type(format!("division by zero in {a} {op} {b}")));
                }
                number(match op {
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                    _ => a % b,
                })
            }
        }
    }
}

fn member(target: &Value, property: &str, expr: &Expr) -> ExprResult<Value> {
    match target {
        Value::Object(map) => map
            .get(property)
            .cloned()
            .ok_or_else(|| ExprError::MissingField(expr.to_string())),
        Value::Array(items) if property == "length" => Ok(Value::from(items.len())),
        Value::String(s) if property == "length" => Ok(Value::from(s.chars().count())),
        other => Err(ExprError::Type(format!(
            "cannot read .{property} of {} in {expr}",
            type_name(other)
        ))),
    }
}

fn lambda_arg<'e>(
    args: &'e [Expr],
    position: usize,
    max_params: usize,
    method: &str,
) -> ExprResult<(&'e [String], &'e Expr)> {
    match args.get(position) {
        Some(Expr::Lambda { params, body }) if !params.is_empty() && params.len() <= max_params => {
            Ok((params.as_slice(), body.as_ref()))
        }
        _ => Err(ExprError::Type(format!(
            "{method}() expects a lambda with at most {max_params} parameter(s)"
        ))),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => objects_equal(x, y),
        _ => a == b,
    }
}

fn objects_equal(x: &Map<String, Value>, y: &Map<String, Value>) -> bool {
    x.len() == y.len()
        && x
            .iter()
            .all(|(k, v)| y.get(k).is_some_and(|other| values_equal(v, other)))
}

fn as_bool(value: &Value, context: &str) -> ExprResult<bool> {
    value.as_bool().ok_or_else(|| {
        ExprError::Type(format!("{context} expects a boolean, got {}", type_name(value)))
    })
}

fn as_number(value: &Value, context: &str) -> ExprResult<f64> {
    value.as_f64().ok_or_else(|| {
        ExprError::Type(format!("{context} expects a number, got {}", type_name(value)))
    })
}

fn number(n: f64) -> ExprResult<Value> {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .ok_or_else(|| ExprError::Type(format!("non-finite result {n}")))
}

fn mismatch(op: BinaryOp, l: &Value, r: &Value) -> ExprError {
    ExprError::Type(format!(
        "cannot apply {op} to {} and {}",
        type_name(l),
        type_name(r)
    ))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
