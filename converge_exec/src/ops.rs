use crate::ast::Expr;
use converge_core::Value;

/// A binary operator on the value union. Operators are total over the
/// symbols in the table below; type errors come back as messages for the
/// caller to attach a location to.
pub type BinaryFn = fn(&Value, &Value) -> Result<Value, String>;

/// The operator dispatch table, indexed by symbol. `Unknown` operands never
/// reach these functions: the evaluator short-circuits them to `Unknown`
/// results first.
pub static BINARY_OPERATORS: &[(&str, BinaryFn)] = &[
    ("==", op_eq),
    ("!=", op_ne),
    ("<", op_lt),
    ("<=", op_le),
    (">", op_gt),
    (">=", op_ge),
    ("and", op_and),
    ("or", op_or),
    ("in", op_in),
    ("=~", op_matches),
];

pub fn binary(symbol: &str) -> Option<BinaryFn> {
    BINARY_OPERATORS
        .iter()
        .find(|(s, _)| *s == symbol)
        .map(|(_, f)| *f)
}

fn op_eq(a: &Value, b: &Value) -> Result<Value, String> {
    Ok(Value::Bool(a == b))
}

fn op_ne(a: &Value, b: &Value) -> Result<Value, String> {
    Ok(Value::Bool(a != b))
}

fn numbers(a: &Value, b: &Value) -> Result<(f64, f64), String> {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => Ok((x, y)),
        _ => Err(format!(
            "can only compare numbers, got {} and {}",
            a.kind(),
            b.kind()
        )),
    }
}

fn op_lt(a: &Value, b: &Value) -> Result<Value, String> {
    numbers(a, b).map(|(x, y)| Value::Bool(x < y))
}

fn op_le(a: &Value, b: &Value) -> Result<Value, String> {
    numbers(a, b).map(|(x, y)| Value::Bool(x <= y))
}

fn op_gt(a: &Value, b: &Value) -> Result<Value, String> {
    numbers(a, b).map(|(x, y)| Value::Bool(x > y))
}

fn op_ge(a: &Value, b: &Value) -> Result<Value, String> {
    numbers(a, b).map(|(x, y)| Value::Bool(x >= y))
}

fn bools(a: &Value, b: &Value) -> Result<(bool, bool), String> {
    match (a.as_bool(), b.as_bool()) {
        (Some(x), Some(y)) => Ok((x, y)),
        _ => Err(format!(
            "boolean operators need bool operands, got {} and {}",
            a.kind(),
            b.kind()
        )),
    }
}

fn op_and(a: &Value, b: &Value) -> Result<Value, String> {
    bools(a, b).map(|(x, y)| Value::Bool(x && y))
}

fn op_or(a: &Value, b: &Value) -> Result<Value, String> {
    bools(a, b).map(|(x, y)| Value::Bool(x || y))
}

fn op_in(a: &Value, b: &Value) -> Result<Value, String> {
    match b {
        Value::List(items) => Ok(Value::Bool(items.iter().any(|item| item == a))),
        other => Err(format!(
            "the second operand of 'in' must be a list, got {}",
            other.kind()
        )),
    }
}

fn op_matches(a: &Value, b: &Value) -> Result<Value, String> {
    match (a, b) {
        (Value::String(text), Value::Regex(pattern)) => {
            Ok(Value::Bool(pattern.is_match(text)))
        }
        (other, Value::Regex(_)) => Err(format!(
            "regular expressions only match strings, got {}",
            other.kind()
        )),
        (_, other) => Err(format!(
            "the second operand of '=~' must be a regex, got {}",
            other.kind()
        )),
    }
}

pub fn unary_not(value: &Value) -> Result<Value, String> {
    match value.as_bool() {
        Some(b) => Ok(Value::Bool(!b)),
        None => Err(format!("cannot negate {}", value.kind())),
    }
}

/// Evaluate a constant expression: literals, lists and operators, plus the
/// `self` reference inside typedef constraints. Used for attribute defaults
/// and typedef predicates; anything that would need the runtime (scopes,
/// instances, plugins) is rejected.
pub fn const_eval(expr: &Expr, self_value: Option<&Value>) -> Result<Value, String> {
    match expr {
        Expr::Literal { value, .. } => Ok(value.clone()),
        Expr::List { items, .. } => {
            let values: Result<Vec<Value>, String> =
                items.iter().map(|e| const_eval(e, self_value)).collect();
            Ok(Value::List(values?))
        }
        Expr::Reference { name, .. } if name.as_str() == "self" => match self_value {
            Some(value) => Ok(value.clone()),
            None => Err("self is not available in this context".to_string()),
        },
        Expr::Not { expr, .. } => {
            let value = const_eval(expr, self_value)?;
            if value.is_unknown() {
                return Ok(Value::Unknown);
            }
            unary_not(&value)
        }
        Expr::BinOp { op, lhs, rhs, .. } => {
            let left = const_eval(lhs, self_value)?;
            let right = const_eval(rhs, self_value)?;
            if left.is_unknown() || right.is_unknown() {
                return Ok(Value::Unknown);
            }
            let f = binary(op).ok_or_else(|| format!("unknown operator {}", op))?;
            f(&left, &right)
        }
        other => Err(format!(
            "not a constant expression (at {})",
            other.location()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge_core::{Location, RegexValue};

    fn loc() -> Location {
        Location::new("test", 1)
    }

    #[test]
    fn comparisons_cross_numeric_variants() {
        let f = binary("<").unwrap();
        assert_eq!(f(&Value::Int(1), &Value::Float(1.5)).unwrap(), Value::Bool(true));
        assert!(f(&Value::string("a"), &Value::Int(1)).is_err());
    }

    #[test]
    fn boolean_operators_reject_non_bools() {
        let f = binary("and").unwrap();
        assert!(f(&Value::Int(1), &Value::Bool(true)).is_err());
        assert_eq!(
            f(&Value::Bool(true), &Value::Bool(false)).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn in_operator_scans_lists() {
        let f = binary("in").unwrap();
        let list = Value::List(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(f(&Value::Int(2), &list).unwrap(), Value::Bool(true));
        assert_eq!(f(&Value::Int(5), &list).unwrap(), Value::Bool(false));
        assert!(f(&Value::Int(1), &Value::Int(1)).is_err());
    }

    #[test]
    fn regex_match_is_string_only() {
        let f = binary("=~").unwrap();
        let pattern = Value::Regex(RegexValue::new("^ab+$").unwrap());
        assert_eq!(f(&Value::string("abb"), &pattern).unwrap(), Value::Bool(true));
        assert!(f(&Value::Int(1), &pattern).is_err());
    }

    #[test]
    fn const_eval_binds_self() {
        let expr = Expr::binop(
            "and",
            Expr::binop(">", Expr::reference("self", loc()), Expr::literal(0i64, loc()), loc()),
            Expr::binop(
                "<",
                Expr::reference("self", loc()),
                Expr::literal(65536i64, loc()),
                loc(),
            ),
            loc(),
        );
        let ok = const_eval(&expr, Some(&Value::Int(80))).unwrap();
        assert_eq!(ok, Value::Bool(true));
        let out = const_eval(&expr, Some(&Value::Int(-1))).unwrap();
        assert_eq!(out, Value::Bool(false));
    }

    #[test]
    fn const_eval_rejects_runtime_nodes() {
        let expr = Expr::reference("x", loc());
        assert!(const_eval(&expr, None).is_err());
    }
}
