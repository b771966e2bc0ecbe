//! String operation handlers (600–699).

use std::rc::Rc;

use crate::{
    ast::Context,
    bytecode::op::{NONE_REG, Opcode, word_to_ctx},
    error::{RunError, RunResult},
    interp::Interp,
    resource::ResourceTracker,
    sprintf::sprintf_value,
    tracer::VmTracer,
    value::Value,
    warnings::WarningCategory,
};

use super::{Frame, call, resolve_ctx};

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
        Opcode::Concat => {
            let (dst, a, b) = (w(0), w(1), w(2));
            let left = frame.scalar(a);
            let right = frame.scalar(b);
            if let Some(v) = call::overload_binary(interp, tracer, ".", &left, &right)? {
                frame.set(dst, v);
                return Ok(pc + 3);
            }
            let l = call::stringify_warn(interp, tracer, frame, pc, &left)?;
            let r = call::stringify_warn(interp, tracer, frame, pc, &right)?;
            frame.set(dst, Value::str(format!("{l}{r}")));
            Ok(pc + 3)
        }
        Opcode::Repeat => {
            let (dst, val_r, count_r) = (w(0), w(1), w(2));
            let ctx = resolve_ctx(word_to_ctx(w(3)), frame);
            let count = call::numify_warn(interp, tracer, frame, pc, &frame.scalar(count_r))?
                .as_f64()
                .max(0.0) as usize;
            let value = frame.take(val_r);
            match (&value, ctx) {
                // `(LIST) x N` repeats the list in list context.
                (Value::List(items), Context::List) => {
                    interp.heap.tracker.check_large_result(items.len() * count * 16)?;
                    let mut out = Vec::with_capacity(items.len() * count);
                    for _ in 0..count {
                        out.extend(items.iter().cloned());
                    }
                    frame.set(dst, Value::list(out));
                }
                _ => {
                    let s = call::stringify_warn(interp, tracer, frame, pc, &value.scalarize())?;
                    interp.heap.tracker.check_large_result(s.len().saturating_mul(count))?;
                    frame.set(dst, Value::str(s.repeat(count)));
                }
            }
            Ok(pc + 4)
        }
        Opcode::Uc | Opcode::Lc | Opcode::Ucfirst | Opcode::Lcfirst => {
            let (dst, src) = (w(0), w(1));
            let s = call::stringify_warn(interp, tracer, frame, pc, &frame.scalar(src))?;
            let out = match op {
                Opcode::Uc => s.to_uppercase(),
                Opcode::Lc => s.to_lowercase(),
                Opcode::Ucfirst => case_first(&s, true),
                _ => case_first(&s, false),
            };
            frame.set(dst, Value::str(out));
            Ok(pc + 2)
        }
        Opcode::Length => {
            let (dst, src) = (w(0), w(1));
            let v = frame.scalar(src);
            // length(undef) is undef, no warning.
            if v.is_undef() {
                frame.set(dst, Value::Undef);
            } else {
                let n = match &v {
                    Value::Bytes(b) => b.len(),
                    other => other.stringify(&interp.heap).chars().count(),
                };
                frame.set(dst, Value::Int(n as i64));
            }
            Ok(pc + 2)
        }
        Opcode::Ord => {
            let (dst, src) = (w(0), w(1));
            let s = call::stringify_warn(interp, tracer, frame, pc, &frame.scalar(src))?;
            let n = s.chars().next().map_or(0, |c| c as u32);
            frame.set(dst, Value::Int(i64::from(n)));
            Ok(pc + 2)
        }
        Opcode::Chr => {
            let (dst, src) = (w(0), w(1));
            let n = call::numify_warn(interp, tracer, frame, pc, &frame.scalar(src))?.as_f64();
            let code_point = u32::try_from(n as i64).unwrap_or(0xFFFD);
            let c = char::from_u32(code_point).unwrap_or('\u{FFFD}');
            frame.set(dst, Value::str(c.to_string()));
            Ok(pc + 2)
        }
        Opcode::IndexOp | Opcode::RindexOp => {
            let (dst, str_r, sub_r, pos_r) = (w(0), w(1), w(2), w(3));
            let s = call::stringify_warn(interp, tracer, frame, pc, &frame.scalar(str_r))?;
            let needle = call::stringify_warn(interp, tracer, frame, pc, &frame.scalar(sub_r))?;
            let chars: Vec<char> = s.chars().collect();
            let result = if op == Opcode::IndexOp {
                let start = if pos_r == NONE_REG {
                    0
                } else {
                    (frame.scalar(pos_r).numify().0.as_f64().max(0.0)) as usize
                };
                find_chars(&chars, &needle, start, false)
            } else {
                let start = if pos_r == NONE_REG {
                    chars.len()
                } else {
                    (frame.scalar(pos_r).numify().0.as_f64().max(0.0)) as usize
                };
                find_chars(&chars, &needle, start, true)
            };
            frame.set(dst, Value::Int(result));
            Ok(pc + 4)
        }
        Opcode::Substr => {
            let (dst, str_r, off_r, len_r, repl_r) = (w(0), w(1), w(2), w(3), w(4));
            let target = frame.take(str_r);
            let source = match &target {
                Value::Ref { id, .. } => interp.heap.scalar_value(*id),
                other => other.clone().scalarize(),
            };
            let s = call::stringify_warn(interp, tracer, frame, pc, &source)?;
            let chars: Vec<char> = s.chars().collect();
            let off = frame.scalar(off_r).numify().0.as_f64() as i64;
            let start = resolve_offset(chars.len(), off);
            let Some(start) = start else {
                call::warn_category(interp, tracer, frame, pc, WarningCategory::Substr, "substr outside of string")?;
                frame.set(dst, Value::Undef);
                return Ok(pc + 5);
            };
            let len = if len_r == NONE_REG {
                chars.len().saturating_sub(start)
            } else {
                let l = frame.scalar(len_r).numify().0.as_f64() as i64;
                if l < 0 {
                    chars.len().saturating_sub(start).saturating_sub(l.unsigned_abs() as usize)
                } else {
                    (l as usize).min(chars.len().saturating_sub(start))
                }
            };
            let extracted: String = chars[start.min(chars.len())..(start + len).min(chars.len())].iter().collect();
            if repl_r != NONE_REG {
                let repl = call::stringify_warn(interp, tracer, frame, pc, &frame.scalar(repl_r))?;
                let mut new: String = chars[..start.min(chars.len())].iter().collect();
                new.push_str(&repl);
                new.extend(chars.get((start + len).min(chars.len())..).unwrap_or(&[]));
                if let Value::Ref { id, .. } = &target {
                    call::scalar_store(interp, tracer, *id, Value::str(new))?;
                }
            }
            frame.set(dst, Value::str(extracted));
            Ok(pc + 5)
        }
        Opcode::Sprintf => {
            let (dst, list_r) = (w(0), w(1));
            let mut args = frame.list(list_r);
            if args.is_empty() {
                frame.set(dst, Value::str(""));
                return Ok(pc + 2);
            }
            let fmt = args.remove(0).stringify(&interp.heap);
            let (out, missing) = sprintf_value(&fmt, &args, &interp.heap);
            if missing > 0 {
                call::warn_category(
                    interp,
                    tracer,
                    frame,
                    pc,
                    WarningCategory::Redundant,
                    "Missing argument in sprintf",
                )?;
            }
            frame.set(dst, Value::str(out));
            Ok(pc + 2)
        }
        Opcode::Join => {
            let (dst, sep_r, list_r) = (w(0), w(1), w(2));
            let sep = frame.scalar(sep_r).stringify(&interp.heap);
            let items = frame.list(list_r);
            let mut parts = Vec::with_capacity(items.len());
            for item in &items {
                parts.push(call::stringify_warn(interp, tracer, frame, pc, item)?.to_string());
            }
            frame.set(dst, Value::str(parts.join(&sep)));
            Ok(pc + 3)
        }
        Opcode::Quotemeta => {
            let (dst, src) = (w(0), w(1));
            let s = call::stringify_warn(interp, tracer, frame, pc, &frame.scalar(src))?;
            let mut out = String::with_capacity(s.len());
            for c in s.chars() {
                if !c.is_alphanumeric() && c != '_' {
                    out.push('\\');
                }
                out.push(c);
            }
            frame.set(dst, Value::str(out));
            Ok(pc + 2)
        }
        Opcode::Chomp => {
            let (dst, lv) = (w(0), w(1));
            let cell = frame.ref_cell(lv)?;
            let v = call::scalar_fetch(interp, tracer, cell)?;
            let s = v.stringify(&interp.heap);
            let sep = interp.special_string("main::/");
            let removed = if !sep.is_empty() && s.ends_with(&*sep) {
                call::scalar_store(interp, tracer, cell, Value::str(&s[..s.len() - sep.len()]))?;
                sep.len()
            } else {
                0
            };
            frame.set(dst, Value::Int(removed as i64));
            Ok(pc + 2)
        }
        Opcode::Chop => {
            let (dst, lv) = (w(0), w(1));
            let cell = frame.ref_cell(lv)?;
            let v = call::scalar_fetch(interp, tracer, cell)?;
            let s = v.stringify(&interp.heap);
            let mut chars: Vec<char> = s.chars().collect();
            let removed = chars.pop();
            call::scalar_store(interp, tracer, cell, Value::str(chars.into_iter().collect::<String>()))?;
            frame.set(dst, removed.map_or(Value::str(""), |c| Value::str(c.to_string())));
            Ok(pc + 2)
        }
        Opcode::Trans => {
            let (dst, target_r, tr_idx) = (w(0), w(1), w(2));
            let spec = Rc::clone(&code.trans[tr_idx as usize]);
            let target = frame.take(target_r);
            let source = match &target {
                Value::Ref { id, .. } => interp.heap.scalar_value(*id),
                other => other.clone().scalarize(),
            };
            let s = source.stringify(&interp.heap);
            let (out, count) = spec.apply(&s);
            if spec.nondestructive {
                frame.set(dst, Value::str(out));
            } else {
                if let Value::Ref { id, .. } = &target {
                    call::scalar_store(interp, tracer, *id, Value::str(out))?;
                }
                frame.set(dst, Value::Int(count as i64));
            }
            Ok(pc + 4)
        }
        Opcode::StrBuild => {
            let (dst, count) = (w(0), w(1));
            let mut out = String::new();
            for k in 0..count {
                let r = w(2 + k as usize);
                let v = frame.scalar(r);
                out.push_str(&call::stringify_warn(interp, tracer, frame, pc, &v)?);
            }
            frame.set(dst, Value::str(out));
            Ok(pc + 2 + count as usize)
        }
        _ => Err(RunError::Die(Value::str(format!("Unhandled string opcode {op:?}")))),
    }
}

fn case_first(s: &str, upper: bool) -> String {
    let mut chars = s.chars();
    match chars.next() {
        None => String::new(),
        Some(first) => {
            let mapped: String = if upper { first.to_uppercase().collect() } else { first.to_lowercase().collect() };
            format!("{mapped}{}", chars.as_str())
        }
    }
}

/// Char-index `index`/`rindex`.
fn find_chars(haystack: &[char], needle: &str, start: usize, reverse: bool) -> i64 {
    let needle_chars: Vec<char> = needle.chars().collect();
    let n = needle_chars.len();
    if n > haystack.len() {
        return -1;
    }
    let last = haystack.len() - n;
    if reverse {
        let from = start.min(last);
        for i in (0..=from).rev() {
            if haystack[i..i + n] == needle_chars[..] {
                return i as i64;
            }
        }
    } else {
        for i in start.min(last)..=last {
            if haystack[i..i + n] == needle_chars[..] {
                return i as i64;
            }
        }
    }
    -1
}

/// Maps a (possibly negative) substr offset; `None` when out of range.
fn resolve_offset(len: usize, off: i64) -> Option<usize> {
    if off >= 0 {
        if off as usize > len { None } else { Some(off as usize) }
    } else {
        len.checked_sub(off.unsigned_abs() as usize)
    }
}
