//! Declarative predicate trees.
//!
//! Rules are data: a small expression language stored as JSON
//! (`{"and": [...]}`, `{"var": "user.role"}`, `{"<": [a, b]}`) parsed into
//! an algebraic type and evaluated recursively against a flat context.
//! Evaluation is total: lookups that miss, type mismatches, and unknown
//! operators all evaluate to false, never to an error.

use serde_json::Value;
use tracing::warn;

/// Parsed predicate expression.
#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Value),
    /// Dotted-path context dereference.
    Var(String),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    Lt(Box<Expr>, Box<Expr>),
    Le(Box<Expr>, Box<Expr>),
    Gt(Box<Expr>, Box<Expr>),
    Ge(Box<Expr>, Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    /// Membership: element in array, or substring in string.
    In(Box<Expr>, Box<Expr>),
    /// Operator this engine does not implement; always false.
    Unknown(String),
}

impl Expr {
    /// Parse a JSON-Logic value. Never fails; unrecognized operators
    /// become [`Expr::Unknown`].
    pub fn parse(value: &Value) -> Expr {
        let Some(object) = value.as_object() else {
            return Expr::Literal(value.clone());
        };
        if object.len() != 1 {
            return Expr::Literal(value.clone());
        }

        let Some((op, args)) = object.iter().next() else {
            return Expr::Literal(value.clone());
        };
        match op.as_str() {
            "var" => match args {
                Value::String(path) => Expr::Var(path.clone()),
                Value::Array(items) => items
                    .first()
                    .and_then(|v| v.as_str())
                    .map(|p| Expr::Var(p.to_string()))
                    .unwrap_or(Expr::Unknown("var".to_string())),
                _ => Expr::Unknown("var".to_string()),
            },
            "and" => Expr::And(parse_list(args)),
            "or" => Expr::Or(parse_list(args)),
            "!" => Expr::Not(Box::new(parse_single(args))),
            "==" => parse_pair(args, Expr::Eq).unwrap_or(Expr::Unknown("==".to_string())),
            "!=" => parse_pair(args, Expr::Ne).unwrap_or(Expr::Unknown("!=".to_string())),
            "<" => parse_pair(args, Expr::Lt).unwrap_or(Expr::Unknown("<".to_string())),
            "<=" => parse_pair(args, Expr::Le).unwrap_or(Expr::Unknown("<=".to_string())),
            ">" => parse_pair(args, Expr::Gt).unwrap_or(Expr::Unknown(">".to_string())),
            ">=" => parse_pair(args, Expr::Ge).unwrap_or(Expr::Unknown(">=".to_string())),
            "in" => parse_pair(args, Expr::In).unwrap_or(Expr::Unknown("in".to_string())),
            other => {
                warn!(operator = other, "unknown rule operator");
                Expr::Unknown(other.to_string())
            }
        }
    }

    /// Evaluate to a JSON value against the context.
    pub fn evaluate(&self, context: &Value) -> Value {
        match self {
            Expr::Literal(v) => v.clone(),
            Expr::Var(path) => lookup(context, path),
            Expr::Eq(a, b) => Value::Bool(loose_eq(&a.evaluate(context), &b.evaluate(context))),
            Expr::Ne(a, b) => Value::Bool(!loose_eq(&a.evaluate(context), &b.evaluate(context))),
            Expr::Lt(a, b) => Value::Bool(compare(&a.evaluate(context), &b.evaluate(context))
                .map(|o| o == std::cmp::Ordering::Less)
                .unwrap_or(false)),
            Expr::Le(a, b) => Value::Bool(compare(&a.evaluate(context), &b.evaluate(context))
                .map(|o| o != std::cmp::Ordering::Greater)
                .unwrap_or(false)),
            Expr::Gt(a, b) => Value::Bool(compare(&a.evaluate(context), &b.evaluate(context))
                .map(|o| o == std::cmp::Ordering::Greater)
                .unwrap_or(false)),
            Expr::Ge(a, b) => Value::Bool(compare(&a.evaluate(context), &b.evaluate(context))
                .map(|o| o != std::cmp::Ordering::Less)
                .unwrap_or(false)),
            Expr::And(items) => Value::Bool(items.iter().all(|e| e.truthy(context))),
            Expr::Or(items) => Value::Bool(items.iter().any(|e| e.truthy(context))),
            Expr::Not(inner) => Value::Bool(!inner.truthy(context)),
            Expr::In(needle, haystack) => {
                let needle = needle.evaluate(context);
                match haystack.evaluate(context) {
                    Value::Array(items) => Value::Bool(items.iter().any(|v| loose_eq(v, &needle))),
                    Value::String(s) => Value::Bool(
                        needle.as_str().map(|n| s.contains(n)).unwrap_or(false),
                    ),
                    _ => Value::Bool(false),
                }
            }
            Expr::Unknown(_) => Value::Bool(false),
        }
    }

    /// Truthiness of the evaluated value.
    pub fn truthy(&self, context: &Value) -> bool {
        is_truthy(&self.evaluate(context))
    }
}

fn parse_list(args: &Value) -> Vec<Expr> {
    match args {
        Value::Array(items) => items.iter().map(Expr::parse).collect(),
        other => vec![Expr::parse(other)],
    }
}

fn parse_single(args: &Value) -> Expr {
    match args {
        Value::Array(items) if items.len() == 1 => Expr::parse(&items[0]),
        other => Expr::parse(other),
    }
}

fn parse_pair(args: &Value, build: fn(Box<Expr>, Box<Expr>) -> Expr) -> Option<Expr> {
    let items = args.as_array()?;
    if items.len() != 2 {
        return None;
    }
    Some(build(
        Box::new(Expr::parse(&items[0])),
        Box::new(Expr::parse(&items[1])),
    ))
}

fn lookup(context: &Value, path: &str) -> Value {
    let mut current = context;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => a.as_f64().zip(b.as_f64()).and_then(|(x, y)| x.partial_cmp(&y)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> Value {
        json!({
            "user": {"role": "guest", "permissions": ["read"]},
            "intent": {"confidence": 0.4, "is_forced": false},
            "session": {"request_count": 3},
        })
    }

    #[test]
    fn var_dereferences_dotted_paths() {
        let expr = Expr::parse(&json!({"var": "user.role"}));
        assert_eq!(expr.evaluate(&context()), json!("guest"));
    }

    #[test]
    fn missing_var_is_null_and_falsy() {
        let expr = Expr::parse(&json!({"var": "user.missing.deep"}));
        assert_eq!(expr.evaluate(&context()), Value::Null);
        assert!(!expr.truthy(&context()));
    }

    #[test]
    fn comparison_and_logic_operators() {
        let expr = Expr::parse(&json!({
            "and": [
                {"==": [{"var": "user.role"}, "guest"]},
                {"<": [{"var": "intent.confidence"}, 0.7]},
            ]
        }));
        assert!(expr.truthy(&context()));
    }

    #[test]
    fn negation() {
        let expr = Expr::parse(&json!({"!": {"var": "intent.is_forced"}}));
        assert!(expr.truthy(&context()));
    }

    #[test]
    fn membership_in_array_and_string() {
        let arr = Expr::parse(&json!({"in": ["read", {"var": "user.permissions"}]}));
        assert!(arr.truthy(&context()));

        let s = Expr::parse(&json!({"in": ["gue", {"var": "user.role"}]}));
        assert!(s.truthy(&context()));
    }

    #[test]
    fn unknown_operator_is_false() {
        let expr = Expr::parse(&json!({"merge": [1, 2]}));
        assert!(!expr.truthy(&context()));
    }

    #[test]
    fn numeric_comparison_across_int_and_float() {
        let expr = Expr::parse(&json!({">": [{"var": "session.request_count"}, 2.5]}));
        assert!(expr.truthy(&context()));
    }
}
