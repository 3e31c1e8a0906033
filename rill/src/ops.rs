//! Arithmetic, comparison and logic on primitive operands.
//!
//! Integers wrap on overflow. Mixed Int/Float operands promote to Float;
//! Char behaves as an integer everywhere.
use std::cmp::Ordering;

use crate::{Op, Primitive, RuntimeError, RuntimeResult};

fn unsupported(op: Op, lhs: Primitive, rhs: Primitive) -> RuntimeError {
    RuntimeError::UnsupportedOperands {
        op: op.name(),
        lhs: lhs.type_name().into(),
        rhs: rhs.type_name().into(),
    }
}

/// `ADD`..`MOD` and the bitwise operators.
pub fn arithmetic(op: Op, lhs: Primitive, rhs: Primitive) -> RuntimeResult<Primitive> {
    if lhs.is_float() || rhs.is_float() {
        let (a, b) = (lhs.as_f64(), rhs.as_f64());
        let value = match op {
            Op::Add => a + b,
            Op::Sub => a - b,
            Op::Mult => a * b,
            Op::Div => a / b,
            _ => return Err(unsupported(op, lhs, rhs)),
        };
        return Ok(Primitive::Float(value));
    }

    let (Some(a), Some(b)) = (lhs.as_i64(), rhs.as_i64()) else {
        return Err(unsupported(op, lhs, rhs));
    };
    let value = match op {
        Op::Add => a.wrapping_add(b),
        Op::Sub => a.wrapping_sub(b),
        Op::Mult => a.wrapping_mul(b),
        Op::Div if b == 0 => return Err(RuntimeError::DivisionByZero),
        Op::Div => a.wrapping_div(b),
        Op::Mod if b == 0 => return Err(RuntimeError::DivisionByZero),
        Op::Mod => a.wrapping_rem(b),
        Op::Band => a & b,
        Op::Bxor => a ^ b,
        Op::Bor => a | b,
        _ => return Err(unsupported(op, lhs, rhs)),
    };
    Ok(Primitive::Int(value))
}

fn ordering(lhs: Primitive, rhs: Primitive) -> Option<Ordering> {
    match (lhs.as_i64(), rhs.as_i64()) {
        (Some(a), Some(b)) => Some(a.cmp(&b)),
        _ => lhs.as_f64().partial_cmp(&rhs.as_f64()),
    }
}

pub fn primitive_eq(lhs: Primitive, rhs: Primitive) -> bool {
    ordering(lhs, rhs) == Some(Ordering::Equal)
}

fn holds(op: Op, ord: Option<Ordering>) -> bool {
    let Some(ord) = ord else {
        return false;
    };
    match op {
        Op::Lt => ord == Ordering::Less,
        Op::Gt => ord == Ordering::Greater,
        Op::Lte => ord != Ordering::Greater,
        Op::Gte => ord != Ordering::Less,
        Op::Eq => ord == Ordering::Equal,
        Op::Neq => ord != Ordering::Equal,
        _ => false,
    }
}

/// `LT`/`GT`/`LTE`/`GTE`/`EQ`/`NEQ` on two primitives. NaN compares false
/// except under `NEQ`.
pub fn compare(op: Op, lhs: Primitive, rhs: Primitive) -> bool {
    let ord = ordering(lhs, rhs);
    if op == Op::Neq && ord.is_none() {
        return true;
    }
    holds(op, ord)
}

/// Lexicographic comparison of two strings.
pub fn compare_str(op: Op, lhs: &str, rhs: &str) -> bool {
    holds(op, Some(lhs.cmp(rhs)))
}

pub fn is_comparison(op: Op) -> bool {
    matches!(op, Op::Lt | Op::Gt | Op::Lte | Op::Gte | Op::Eq | Op::Neq)
}
