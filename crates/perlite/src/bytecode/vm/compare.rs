//! Numeric (300–349) and string (350–399) comparison handlers.

use std::cmp::Ordering;
use std::rc::Rc;

use crate::{
    bytecode::op::Opcode,
    error::{RunError, RunResult},
    interp::Interp,
    resource::ResourceTracker,
    tracer::VmTracer,
    value::Value,
};

use super::{Frame, call};

pub(crate) fn numeric<T: ResourceTracker, Tr: VmTracer>(
    op: Opcode,
    frame: &mut Frame,
    pc: usize,
    interp: &mut Interp<T>,
    tracer: &mut Tr,
) -> RunResult<usize> {
    let code = Rc::clone(&frame.code);
    let w = |k: usize| code.words[pc + k];
    let (dst, a, b) = (w(0), w(1), w(2));
    let left = frame.scalar(a);
    let right = frame.scalar(b);

    let symbol = match op {
        Opcode::NumEq => "==",
        Opcode::NumNe => "!=",
        Opcode::NumLt => "<",
        Opcode::NumLe => "<=",
        Opcode::NumGt => ">",
        Opcode::NumGe => ">=",
        Opcode::Spaceship => "<=>",
        _ => return Err(RunError::Die(Value::str(format!("Unhandled comparison opcode {op:?}")))),
    };
    if let Some(v) = call::overload_binary(interp, tracer, symbol, &left, &right)? {
        frame.set(dst, v);
        return Ok(pc + 3);
    }

    let l = call::numify_warn(interp, tracer, frame, pc, &left)?.as_f64();
    let r = call::numify_warn(interp, tracer, frame, pc, &right)?.as_f64();
    let result = match op {
        Opcode::NumEq => bool_value(l == r),
        Opcode::NumNe => bool_value(l != r),
        Opcode::NumLt => bool_value(l < r),
        Opcode::NumLe => bool_value(l <= r),
        Opcode::NumGt => bool_value(l > r),
        Opcode::NumGe => bool_value(l >= r),
        _ => match l.partial_cmp(&r) {
            Some(Ordering::Less) => Value::Int(-1),
            Some(Ordering::Equal) => Value::Int(0),
            Some(Ordering::Greater) => Value::Int(1),
            // NaN operands compare to undef under <=>.
            None => Value::Undef,
        },
    };
    frame.set(dst, result);
    Ok(pc + 3)
}

pub(crate) fn string<T: ResourceTracker, Tr: VmTracer>(
    op: Opcode,
    frame: &mut Frame,
    pc: usize,
    interp: &mut Interp<T>,
    tracer: &mut Tr,
) -> RunResult<usize> {
    let code = Rc::clone(&frame.code);
    let w = |k: usize| code.words[pc + k];
    let (dst, a, b) = (w(0), w(1), w(2));
    let left = frame.scalar(a);
    let right = frame.scalar(b);

    let symbol = match op {
        Opcode::StrEq => "eq",
        Opcode::StrNe => "ne",
        Opcode::StrLt => "lt",
        Opcode::StrLe => "le",
        Opcode::StrGt => "gt",
        Opcode::StrGe => "ge",
        Opcode::StrCmp => "cmp",
        _ => return Err(RunError::Die(Value::str(format!("Unhandled comparison opcode {op:?}")))),
    };
    if let Some(v) = call::overload_binary(interp, tracer, symbol, &left, &right)? {
        frame.set(dst, v);
        return Ok(pc + 3);
    }

    let l = call::stringify_warn(interp, tracer, frame, pc, &left)?;
    let r = call::stringify_warn(interp, tracer, frame, pc, &right)?;
    let ord = l.as_ref().cmp(r.as_ref());
    let result = match op {
        Opcode::StrEq => bool_value(ord == Ordering::Equal),
        Opcode::StrNe => bool_value(ord != Ordering::Equal),
        Opcode::StrLt => bool_value(ord == Ordering::Less),
        Opcode::StrLe => bool_value(ord != Ordering::Greater),
        Opcode::StrGt => bool_value(ord == Ordering::Greater),
        Opcode::StrGe => bool_value(ord != Ordering::Less),
        _ => Value::Int(match ord {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        }),
    };
    frame.set(dst, result);
    Ok(pc + 3)
}

/// Perl booleans: 1 and "".
pub(crate) fn bool_value(b: bool) -> Value {
    if b { Value::Int(1) } else { Value::str("") }
}
