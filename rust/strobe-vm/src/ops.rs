//! Operator semantics over [`Value`].
//!
//! Operators never fail: operands of the wrong variant produce `Unset`, the
//! same degradation an unresolved name gets.

use std::cmp::Ordering;
use strobe_core::{Opcode, Value};

pub(crate) fn unary(op: Opcode, operand: Value) -> Value {
    match op {
        Opcode::Neg => match operand {
            Value::Number(n) => Value::Number(-n),
            _ => Value::Unset,
        },
        Opcode::Not => Value::Boolean(!operand.is_truthy()),
        _ => Value::Unset,
    }
}

pub(crate) fn is_unary(op: Opcode) -> bool {
    matches!(op, Opcode::Neg | Opcode::Not)
}

pub(crate) fn binary(op: Opcode, lhs: Value, rhs: Value) -> Value {
    match op {
        Opcode::Add => match (lhs, rhs) {
            (Value::Number(a), Value::Number(b)) => Value::Number(a + b),
            (Value::Text(mut a), Value::Text(b)) => {
                a.push_str(&b);
                Value::Text(a)
            }
            _ => Value::Unset,
        },
        Opcode::Sub => numeric(lhs, rhs, |a, b| a - b),
        Opcode::Mul => numeric(lhs, rhs, |a, b| a * b),
        Opcode::Div => numeric(lhs, rhs, |a, b| a / b),
        Opcode::Mod => numeric(lhs, rhs, |a, b| a % b),
        Opcode::Eq => Value::Boolean(lhs == rhs),
        Opcode::Ne => Value::Boolean(lhs != rhs),
        Opcode::Lt => ordered(&lhs, &rhs, Ordering::is_lt),
        Opcode::Le => ordered(&lhs, &rhs, Ordering::is_le),
        Opcode::Gt => ordered(&lhs, &rhs, Ordering::is_gt),
        Opcode::Ge => ordered(&lhs, &rhs, Ordering::is_ge),
        _ => Value::Unset,
    }
}

fn numeric(lhs: Value, rhs: Value, f: impl Fn(f64, f64) -> f64) -> Value {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => Value::Number(f(a, b)),
        _ => Value::Unset,
    }
}

fn ordered(lhs: &Value, rhs: &Value, test: fn(Ordering) -> bool) -> Value {
    Value::Boolean(lhs.partial_cmp(rhs).is_some_and(test))
}
