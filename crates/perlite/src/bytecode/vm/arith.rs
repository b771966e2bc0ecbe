//! Arithmetic/bit handlers (400–499) and in-place compound assignment
//! (500–599).
//!
//! Integer arithmetic stays in `i64` until it overflows or a fraction
//! appears, then upgrades to doubles, matching Perl's IV/NV behavior.
//! Compound assignment computes and then writes back through the same cell —
//! never rebinding — so a captured variable's mutation is seen by every
//! holder of the cell (the parent frame included).

use std::rc::Rc;

use crate::{
    bytecode::op::{NONE_REG, Opcode},
    error::{RunError, RunResult},
    interp::Interp,
    resource::ResourceTracker,
    tracer::VmTracer,
    value::{Number, Value, parse_number_prefix, str_increment},
};

use super::{Frame, call};

/// Adds with overflow upgrade.
pub(crate) fn num_add(l: Number, r: Number) -> Number {
    match (l, r) {
        (Number::Int(a), Number::Int(b)) => match a.checked_add(b) {
            Some(n) => Number::Int(n),
            None => Number::Float(a as f64 + b as f64),
        },
        _ => Number::Float(l.as_f64() + r.as_f64()),
    }
}

pub(crate) fn num_sub(l: Number, r: Number) -> Number {
    match (l, r) {
        (Number::Int(a), Number::Int(b)) => match a.checked_sub(b) {
            Some(n) => Number::Int(n),
            None => Number::Float(a as f64 - b as f64),
        },
        _ => Number::Float(l.as_f64() - r.as_f64()),
    }
}

pub(crate) fn num_mul(l: Number, r: Number) -> Number {
    match (l, r) {
        (Number::Int(a), Number::Int(b)) => match a.checked_mul(b) {
            Some(n) => Number::Int(n),
            None => Number::Float(a as f64 * b as f64),
        },
        _ => Number::Float(l.as_f64() * r.as_f64()),
    }
}

pub(crate) fn num_div(l: Number, r: Number) -> RunResult<Number> {
    let rv = r.as_f64();
    if rv == 0.0 {
        return Err(RunError::Die(Value::str("Illegal division by zero")));
    }
    let q = l.as_f64() / rv;
    // Exact integer quotients stay integers.
    if q.fract() == 0.0 && q.abs() < 9_007_199_254_740_992.0 {
        Ok(Number::Int(q as i64))
    } else {
        Ok(Number::Float(q))
    }
}

/// Perl `%`: integer semantics with the sign of the right operand.
pub(crate) fn num_mod(l: Number, r: Number) -> RunResult<Number> {
    let (a, b) = (l.as_f64(), r.as_f64());
    if b == 0.0 {
        return Err(RunError::Die(Value::str("Illegal modulus zero")));
    }
    if a.fract() == 0.0 && b.fract() == 0.0 && a.abs() < 9e15 && b.abs() < 9e15 {
        let (ai, bi) = (a as i64, b as i64);
        let mut m = ai % bi;
        if m != 0 && (m < 0) != (bi < 0) {
            m += bi;
        }
        return Ok(Number::Int(m));
    }
    let mut m = a % b;
    if m != 0.0 && (m < 0.0) != (b < 0.0) {
        m += b;
    }
    Ok(Number::Float(m))
}

pub(crate) fn num_pow(l: Number, r: Number) -> Number {
    let p = l.as_f64().powf(r.as_f64());
    if p.fract() == 0.0 && p.abs() < 9_007_199_254_740_992.0 {
        Number::Int(p as i64)
    } else {
        Number::Float(p)
    }
}

/// Applies one binary arithmetic opcode to already-numified operands.
pub(crate) fn apply_binary(op: Opcode, l: Number, r: Number) -> RunResult<Value> {
    Ok(match op {
        Opcode::Add | Opcode::AddAssign => num_add(l, r).into_value(),
        Opcode::Sub | Opcode::SubAssign => num_sub(l, r).into_value(),
        Opcode::Mul | Opcode::MulAssign => num_mul(l, r).into_value(),
        Opcode::Div | Opcode::DivAssign => num_div(l, r)?.into_value(),
        Opcode::Mod | Opcode::ModAssign => num_mod(l, r)?.into_value(),
        Opcode::Pow | Opcode::PowAssign => num_pow(l, r).into_value(),
        Opcode::BitAnd | Opcode::BitAndAssign => Value::Int(((num_u64(l)) & (num_u64(r))) as i64),
        Opcode::BitOr | Opcode::BitOrAssign => Value::Int(((num_u64(l)) | (num_u64(r))) as i64),
        Opcode::BitXor | Opcode::BitXorAssign => Value::Int(((num_u64(l)) ^ (num_u64(r))) as i64),
        Opcode::Shl | Opcode::ShlAssign => Value::Int((num_u64(l) << (num_u64(r) & 63)) as i64),
        Opcode::Shr | Opcode::ShrAssign => Value::Int((num_u64(l) >> (num_u64(r) & 63)) as i64),
        Opcode::Atan2 => Value::Num(l.as_f64().atan2(r.as_f64())),
        _ => return Err(RunError::Die(Value::str(format!("Unhandled arithmetic opcode {op:?}")))),
    })
}

fn num_u64(n: Number) -> u64 {
    match n {
        Number::Int(i) => i as u64,
        Number::Float(f) => {
            if f < 0.0 {
                (f as i64) as u64
            } else {
                f as u64
            }
        }
    }
}

fn overload_symbol(op: Opcode) -> Option<&'static str> {
    Some(match op {
        Opcode::Add => "+",
        Opcode::Sub => "-",
        Opcode::Mul => "*",
        Opcode::Div => "/",
        Opcode::Mod => "%",
        Opcode::Pow => "**",
        Opcode::Shl => "<<",
        Opcode::Shr => ">>",
        Opcode::BitAnd => "&",
        Opcode::BitOr => "|",
        Opcode::BitXor => "^",
        _ => return None,
    })
}

pub(crate) fn handle<T: ResourceTracker, Tr: VmTracer>(
    op: Opcode,
    frame: &mut Frame,
    pc: usize,
    interp: &mut Interp<T>,
    tracer: &mut Tr,
) -> RunResult<usize> {
    let code = Rc::clone(&frame.code);
    let w = |k: usize| code.words[pc + k];

    match op {
        // Binary ops: dst, a, b.
        Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod | Opcode::Pow | Opcode::Atan2
        | Opcode::BitAnd | Opcode::BitOr | Opcode::BitXor | Opcode::Shl | Opcode::Shr => {
            let (dst, a, b) = (w(0), w(1), w(2));
            let left = frame.scalar(a);
            let right = frame.scalar(b);
            if let Some(symbol) = overload_symbol(op)
                && let Some(v) = call::overload_binary(interp, tracer, symbol, &left, &right)?
            {
                frame.set(dst, v);
                return Ok(pc + 3);
            }
            let l = call::numify_warn(interp, tracer, frame, pc, &left)?;
            let r = call::numify_warn(interp, tracer, frame, pc, &right)?;
            frame.set(dst, apply_binary(op, l, r)?);
            Ok(pc + 3)
        }
        // Unary ops: dst, src.
        Opcode::Neg => {
            let (dst, src) = (w(0), w(1));
            let v = frame.scalar(src);
            // `-"bareword"` negates strings textually.
            if let Value::Str(s) = &v
                && !s.is_empty()
                && !s.starts_with(|c: char| c.is_ascii_digit() || c == '+' || c == '-' || c == '.')
            {
                frame.set(dst, Value::str(format!("-{s}")));
                return Ok(pc + 2);
            }
            let n = call::numify_warn(interp, tracer, frame, pc, &v)?;
            let out = match n {
                Number::Int(i) => i.checked_neg().map_or(Value::Num(-(i as f64)), Value::Int),
                Number::Float(f) => Value::Num(-f),
            };
            frame.set(dst, out);
            Ok(pc + 2)
        }
        Opcode::Abs => {
            let n = unary_num(frame, interp, tracer, pc, w(1))?;
            let out = match n {
                Number::Int(i) => i.checked_abs().map_or(Value::Num((i as f64).abs()), Value::Int),
                Number::Float(f) => Value::Num(f.abs()),
            };
            frame.set(w(0), out);
            Ok(pc + 2)
        }
        Opcode::Sqrt => {
            let n = unary_num(frame, interp, tracer, pc, w(1))?.as_f64();
            if n < 0.0 {
                return Err(RunError::Die(Value::str(format!("Can't take sqrt of {n}"))));
            }
            frame.set(w(0), float_or_int(n.sqrt()));
            Ok(pc + 2)
        }
        Opcode::IntOp => {
            let n = unary_num(frame, interp, tracer, pc, w(1))?;
            frame.set(w(0), n.truncate().into_value());
            Ok(pc + 2)
        }
        Opcode::Sin => {
            let n = unary_num(frame, interp, tracer, pc, w(1))?.as_f64();
            frame.set(w(0), Value::Num(n.sin()));
            Ok(pc + 2)
        }
        Opcode::Cos => {
            let n = unary_num(frame, interp, tracer, pc, w(1))?.as_f64();
            frame.set(w(0), Value::Num(n.cos()));
            Ok(pc + 2)
        }
        Opcode::Exp => {
            let n = unary_num(frame, interp, tracer, pc, w(1))?.as_f64();
            frame.set(w(0), Value::Num(n.exp()));
            Ok(pc + 2)
        }
        Opcode::Log => {
            let n = unary_num(frame, interp, tracer, pc, w(1))?.as_f64();
            if n <= 0.0 {
                return Err(RunError::Die(Value::str(format!("Can't take log of {n}"))));
            }
            frame.set(w(0), Value::Num(n.ln()));
            Ok(pc + 2)
        }
        Opcode::Rand => {
            let (dst, src) = (w(0), w(1));
            let ceiling = if src == NONE_REG {
                1.0
            } else {
                let c = frame.scalar(src).numify().0.as_f64();
                if c == 0.0 { 1.0 } else { c }
            };
            let v = interp.next_random() * ceiling;
            frame.set(dst, Value::Num(v));
            Ok(pc + 2)
        }
        Opcode::Srand => {
            let (dst, src) = (w(0), w(1));
            let seed = if src == NONE_REG {
                0x853C_49E6_748F_EA9B
            } else {
                frame.scalar(src).numify().0.as_f64() as u64
            };
            let old = interp.rng;
            interp.rng = seed | 1;
            frame.set(dst, Value::Int(old as i64));
            Ok(pc + 2)
        }
        Opcode::NotOp => {
            let v = frame.scalar(w(1));
            frame.set(w(0), super::compare::bool_value(!v.truthy()));
            Ok(pc + 2)
        }
        Opcode::BitNot => {
            let n = unary_num(frame, interp, tracer, pc, w(1))?;
            frame.set(w(0), Value::Int(!num_u64(n) as i64));
            Ok(pc + 2)
        }
        Opcode::HexOp => {
            let s = frame.scalar(w(1)).stringify(&interp.heap);
            let digits = s.trim_start_matches("0x").trim_start_matches("0X");
            let n = u64::from_str_radix(digits, 16).unwrap_or(0);
            frame.set(w(0), Value::Int(n as i64));
            Ok(pc + 2)
        }
        Opcode::OctOp => {
            let s = frame.scalar(w(1)).stringify(&interp.heap);
            let s = s.trim();
            let n = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                u64::from_str_radix(hex, 16).unwrap_or(0)
            } else if let Some(bin) = s.strip_prefix("0b").or_else(|| s.strip_prefix("0B")) {
                u64::from_str_radix(bin, 2).unwrap_or(0)
            } else {
                let digits = s.trim_start_matches("0o").trim_start_matches('0');
                if digits.is_empty() { 0 } else { u64::from_str_radix(digits, 8).unwrap_or(0) }
            };
            frame.set(w(0), Value::Int(n as i64));
            Ok(pc + 2)
        }
        Opcode::Incr => {
            let (dst, lv, flags) = (w(0), w(1), w(2));
            let cell = frame.ref_cell(lv)?;
            let old = call::scalar_fetch(interp, tracer, cell)?;
            let decrement = flags & 1 != 0;
            let post = flags & 2 != 0;
            let new = increment_value(&old, decrement, interp)?;
            call::scalar_store(interp, tracer, cell, new.clone())?;
            frame.set(dst, if post { old } else { new });
            Ok(pc + 3)
        }
        _ => Err(RunError::Die(Value::str(format!("Unhandled arithmetic opcode {op:?}")))),
    }
}

fn unary_num<T: ResourceTracker, Tr: VmTracer>(
    frame: &Frame,
    interp: &mut Interp<T>,
    tracer: &mut Tr,
    pc: usize,
    r: u16,
) -> RunResult<Number> {
    let v = frame.scalar(r);
    call::numify_warn(interp, tracer, frame, pc, &v)
}

fn float_or_int(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 { Value::Int(f as i64) } else { Value::Num(f) }
}

/// `++`/`--` with Perl's magic string increment.
fn increment_value<T: ResourceTracker>(old: &Value, decrement: bool, interp: &Interp<T>) -> RunResult<Value> {
    if !decrement {
        if let Value::Str(s) = old {
            // Strings that don't look numeric increment alphabetically.
            let (_, consumed) = parse_number_prefix(s);
            if consumed == 0 && !s.is_empty() {
                return Ok(Value::str(str_increment(s)));
            }
        }
    }
    let _ = interp;
    let (n, _) = old.numify();
    Ok(if decrement { num_sub(n, Number::Int(1)) } else { num_add(n, Number::Int(1)) }.into_value())
}

pub(crate) fn compound<T: ResourceTracker, Tr: VmTracer>(
    op: Opcode,
    frame: &mut Frame,
    pc: usize,
    interp: &mut Interp<T>,
    tracer: &mut Tr,
) -> RunResult<usize> {
    let code = Rc::clone(&frame.code);
    let w = |k: usize| code.words[pc + k];
    let (dst, lv, src) = (w(0), w(1), w(2));
    let cell = frame.ref_cell(lv)?;
    let current = call::scalar_fetch(interp, tracer, cell)?;
    let operand = frame.scalar(src);

    let new = match op {
        Opcode::ConcatAssign => {
            let l = call::stringify_warn(interp, tracer, frame, pc, &current)?;
            let r = call::stringify_warn(interp, tracer, frame, pc, &operand)?;
            Value::str(format!("{l}{r}"))
        }
        Opcode::RepeatAssign => {
            let l = call::stringify_warn(interp, tracer, frame, pc, &current)?;
            let n = call::numify_warn(interp, tracer, frame, pc, &operand)?.as_f64().max(0.0) as usize;
            interp.heap.tracker.check_large_result(l.len().saturating_mul(n))?;
            Value::str(l.repeat(n))
        }
        _ => {
            let symbol = match op {
                Opcode::AddAssign => Some("+"),
                Opcode::SubAssign => Some("-"),
                Opcode::MulAssign => Some("*"),
                Opcode::DivAssign => Some("/"),
                _ => None,
            };
            if let Some(symbol) = symbol
                && let Some(v) = call::overload_binary(interp, tracer, symbol, &current, &operand)?
            {
                v
            } else {
                let l = call::numify_warn(interp, tracer, frame, pc, &current)?;
                let r = call::numify_warn(interp, tracer, frame, pc, &operand)?;
                apply_binary(op, l, r)?
            }
        }
    };
    // Mutate the cell in place: the parent and any closure sharing this cell
    // observe the new value.
    call::scalar_store(interp, tracer, cell, new.clone())?;
    frame.set(dst, new);
    Ok(pc + 3)
}
