//! Reduction operators for `reduce`, `allreduce`, and `scan`.

use crate::error::MpiError;
use crate::serializer::Value;
use std::fmt;

/// An associative binary operator over payload values.
///
/// The built-in operators work on `Int`/`Float` (arithmetic, min/max) or
/// `Bool` (logical). `Custom` accepts any function; the engine always folds
/// contributions in ascending rank order, so non-commutative custom
/// operators are safe.
#[derive(Clone, Copy)]
pub enum Op {
    Sum,
    Prod,
    Max,
    Min,
    Land,
    Lor,
    Custom(fn(&Value, &Value) -> Value),
}

impl Op {
    /// Apply the operator to two values.
    pub fn apply(&self, a: &Value, b: &Value) -> Result<Value, MpiError> {
        match self {
            Op::Custom(f) => Ok(f(a, b)),
            Op::Land | Op::Lor => match (a, b) {
                (Value::Bool(x), Value::Bool(y)) => Ok(Value::Bool(match self {
                    Op::Land => *x && *y,
                    _ => *x || *y,
                })),
                _ => Err(MpiError::Mpi(format!(
                    "logical operator applied to non-boolean values {a:?}, {b:?}"
                ))),
            },
            _ => numeric(self, a, b),
        }
    }
}

fn numeric(op: &Op, a: &Value, b: &Value) -> Result<Value, MpiError> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(match op {
            Op::Sum => x + y,
            Op::Prod => x * y,
            Op::Max => *x.max(y),
            Op::Min => *x.min(y),
            _ => unreachable!(),
        })),
        (Value::Int(_), Value::Float(_))
        | (Value::Float(_), Value::Int(_))
        | (Value::Float(_), Value::Float(_)) => {
            let x = as_f64(a);
            let y = as_f64(b);
            Ok(Value::Float(match op {
                Op::Sum => x + y,
                Op::Prod => x * y,
                Op::Max => x.max(y),
                Op::Min => x.min(y),
                _ => unreachable!(),
            }))
        }
        _ => Err(MpiError::Mpi(format!(
            "arithmetic operator applied to non-numeric values {a:?}, {b:?}"
        ))),
    }
}

fn as_f64(v: &Value) -> f64 {
    match v {
        Value::Int(x) => *x as f64,
        Value::Float(x) => *x,
        _ => unreachable!(),
    }
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Op::Sum => "Sum",
            Op::Prod => "Prod",
            Op::Max => "Max",
            Op::Min => "Min",
            Op::Land => "Land",
            Op::Lor => "Lor",
            Op::Custom(_) => "Custom",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arithmetic_ops() {
        assert_eq!(
            Op::Sum.apply(&Value::Int(2), &Value::Int(3)).unwrap(),
            Value::Int(5)
        );
        assert_eq!(
            Op::Prod.apply(&Value::Int(2), &Value::Float(1.5)).unwrap(),
            Value::Float(3.0)
        );
        assert_eq!(
            Op::Max.apply(&Value::Int(-2), &Value::Int(7)).unwrap(),
            Value::Int(7)
        );
        assert_eq!(
            Op::Min.apply(&Value::Float(0.5), &Value::Int(1)).unwrap(),
            Value::Float(0.5)
        );
    }

    #[test]
    fn test_logical_ops() {
        assert_eq!(
            Op::Land
                .apply(&Value::Bool(true), &Value::Bool(false))
                .unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            Op::Lor
                .apply(&Value::Bool(true), &Value::Bool(false))
                .unwrap(),
            Value::Bool(true)
        );
        assert!(Op::Land.apply(&Value::Int(1), &Value::Bool(true)).is_err());
    }

    #[test]
    fn test_custom_op() {
        fn concat(a: &Value, b: &Value) -> Value {
            Value::Text(format!(
                "{}{}",
                a.as_text().unwrap_or(""),
                b.as_text().unwrap_or("")
            ))
        }
        let op = Op::Custom(concat);
        assert_eq!(
            op.apply(&Value::Text("ab".into()), &Value::Text("cd".into()))
                .unwrap(),
            Value::Text("abcd".into())
        );
    }

    #[test]
    fn test_type_mismatch_rejected() {
        assert!(Op::Sum
            .apply(&Value::Text("a".into()), &Value::Int(1))
            .is_err());
    }
}
