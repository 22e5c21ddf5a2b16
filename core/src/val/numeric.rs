//! Arithmetic and comparison over primitive values.
//!
//! This is the numeric collaborator the interpreter and reference cells lean on for the
//! generic (non-overridden) path of binary and compound operators. Integer
//! arithmetic is checked.

use std::cmp::Ordering;
use std::fmt::Display;
use std::sync::Arc;

use super::{Exception, ExceptionKind, Val};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinOp {
    #[inline]
    pub fn is_arith(&self) -> bool {
        matches!(self, BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod)
    }

    /// Name of the compound-assignment override for this operator (`"+="` for `Add`).
    pub fn assign_symbol(&self) -> Option<&'static str> {
        match self {
            BinOp::Add => Some("+="),
            BinOp::Sub => Some("-="),
            BinOp::Mul => Some("*="),
            BinOp::Div => Some("/="),
            BinOp::Mod => Some("%="),
            _ => None,
        }
    }
}

impl Display for BinOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BinOp::Add => write!(f, "+"),
            BinOp::Sub => write!(f, "-"),
            BinOp::Mul => write!(f, "*"),
            BinOp::Div => write!(f, "/"),
            BinOp::Mod => write!(f, "%"),
            BinOp::Eq => write!(f, "=="),
            BinOp::Ne => write!(f, "!="),
            BinOp::Lt => write!(f, "<"),
            BinOp::Le => write!(f, "<="),
            BinOp::Gt => write!(f, ">"),
            BinOp::Ge => write!(f, ">="),
        }
    }
}

#[inline]
fn err_op(l: &Val, op: BinOp, r: &Val) -> Exception {
    Exception::type_mismatch(format!(
        "unsupported operands: {} {op} {}",
        l.type_name(),
        r.type_name()
    ))
}

#[inline]
fn overflow(l: i64, op: BinOp, r: i64) -> Exception {
    Exception::new(ExceptionKind::Overflow, format!("{l} {op} {r}"))
}

fn divide_by_zero() -> Exception {
    Exception::new(ExceptionKind::DivideByZero, "")
}

/// Apply `op` to two values.
pub fn apply(op: BinOp, l: &Val, r: &Val) -> Result<Val, Exception> {
    if op.is_arith() {
        arith(op, l, r)
    } else {
        compare(op, l, r).map(Val::Bool)
    }
}

fn arith(op: BinOp, l: &Val, r: &Val) -> Result<Val, Exception> {
    match (l, r) {
        (Val::Int(a), Val::Int(b)) => int_arith(op, *a, *b).map(Val::Int),
        (Val::Float(a), Val::Float(b)) => float_arith(op, *a, *b),
        (Val::Int(a), Val::Float(b)) => float_arith(op, *a as f64, *b),
        (Val::Float(a), Val::Int(b)) => float_arith(op, *a, *b as f64),
        (Val::Str(a), _) if op == BinOp::Add => Ok(Val::Str(concat(a, r))),
        _ => Err(err_op(l, op, r)),
    }
}

fn int_arith(op: BinOp, a: i64, b: i64) -> Result<i64, Exception> {
    let out = match op {
        BinOp::Add => a.checked_add(b),
        BinOp::Sub => a.checked_sub(b),
        BinOp::Mul => a.checked_mul(b),
        BinOp::Div => {
            if b == 0 {
                return Err(divide_by_zero());
            }
            a.checked_div(b)
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(divide_by_zero());
            }
            a.checked_rem(b)
        }
        _ => unreachable!("int_arith called with comparison operator"),
    };
    out.ok_or_else(|| overflow(a, op, b))
}

fn float_arith(op: BinOp, a: f64, b: f64) -> Result<Val, Exception> {
    let out = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(divide_by_zero());
            }
            a / b
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Err(divide_by_zero());
            }
            a % b
        }
        _ => unreachable!("float_arith called with comparison operator"),
    };
    Ok(Val::Float(out))
}

fn concat(prefix: &str, r: &Val) -> Arc<str> {
    let mut out = String::with_capacity(prefix.len() + 16);
    out.push_str(prefix);
    match r {
        Val::Str(s) => out.push_str(s),
        Val::Int(i) => {
            let mut buf = itoa::Buffer::new();
            out.push_str(buf.format(*i));
        }
        Val::Float(f) => {
            let mut buf = ryu::Buffer::new();
            out.push_str(buf.format(*f));
        }
        other => out.push_str(&other.to_string()),
    }
    Arc::from(out)
}

fn compare(op: BinOp, l: &Val, r: &Val) -> Result<bool, Exception> {
    match op {
        BinOp::Eq => return Ok(l == r),
        BinOp::Ne => return Ok(l != r),
        _ => {}
    }
    let ord = match (l, r) {
        (Val::Int(a), Val::Int(b)) => Some(a.cmp(b)),
        (Val::Float(a), Val::Float(b)) => a.partial_cmp(b),
        (Val::Int(a), Val::Float(b)) => (*a as f64).partial_cmp(b),
        (Val::Float(a), Val::Int(b)) => a.partial_cmp(&(*b as f64)),
        (Val::Str(a), Val::Str(b)) => Some(a.cmp(b)),
        (Val::Bool(a), Val::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    };
    let Some(ord) = ord else {
        return Err(err_op(l, op, r));
    };
    Ok(match op {
        BinOp::Lt => ord == Ordering::Less,
        BinOp::Le => ord != Ordering::Greater,
        BinOp::Gt => ord == Ordering::Greater,
        BinOp::Ge => ord != Ordering::Less,
        _ => unreachable!("equality handled above"),
    })
}
