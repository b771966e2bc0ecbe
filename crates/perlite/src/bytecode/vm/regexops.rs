//! Regex opcodes: match, substitution, split, and the capture variables.
//!
//! The matcher adaptor lives in [`crate::regex`]; these handlers own the
//! Perl-visible semantics: `pos()` bookkeeping for `/g`, the
//! one-element-`(1)` list for a captureless match, empty-pattern reuse of
//! the last successful pattern, and `$1`/`$&`/`%+`/`@-` state.

use std::rc::Rc;

use crate::{
    ast::Context,
    bytecode::op::{NONE_REG, Opcode, word_to_ctx},
    error::{RunError, RunResult},
    heap::HeapId,
    interp::Interp,
    regex::{CompiledRegex, MatchState},
    resource::ResourceTracker,
    tracer::VmTracer,
    value::{RcStr, Value},
};

use super::{Frame, call, compare::bool_value, resolve_ctx};

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
        Opcode::LoadRegex => {
            let re = Rc::clone(&code.regexes[w(1) as usize]);
            frame.set(w(0), Value::Regex(re));
            Ok(pc + 2)
        }
        Opcode::BuildRegex => {
            let (dst, pat_r, mods_idx) = (w(0), w(1), w(2));
            let pattern_value = frame.scalar(pat_r);
            // Interpolating a qr object reuses it wholesale.
            if let Value::Regex(re) = &pattern_value {
                frame.set(dst, Value::Regex(Rc::clone(re)));
                return Ok(pc + 3);
            }
            let pattern = pattern_value.stringify(&interp.heap);
            let mods = Rc::clone(&code.strings[mods_idx as usize]);
            let re = call::build_regex(interp, &pattern, &mods)?;
            frame.set(dst, Value::Regex(re));
            Ok(pc + 3)
        }
        Opcode::Match => {
            let (dst, target_r, re_r, negated) = (w(0), w(1), w(2), w(3) != 0);
            let ctx = resolve_ctx(word_to_ctx(w(4)), frame);
            let re = regex_operand(frame, re_r, interp)?;
            let target = frame.take(target_r);
            let result = do_match(interp, &target, &re, negated, ctx)?;
            frame.set(dst, result);
            Ok(pc + 5)
        }
        Opcode::Subst => {
            let (dst, target_r, re_r, repl_r) = (w(0), w(1), w(2), w(3));
            let re = regex_operand(frame, re_r, interp)?;
            let repl = frame.ref_cell(repl_r)?;
            let target = frame.take(target_r);
            let result = do_subst(interp, tracer, &target, &re, repl)?;
            frame.set(dst, result);
            Ok(pc + 5)
        }
        Opcode::Split => {
            let (dst, re_r, target_r, limit_r, awk) = (w(0), w(1), w(2), w(3), w(4) != 0);
            let ctx = resolve_ctx(word_to_ctx(w(5)), frame);
            let re = regex_operand(frame, re_r, interp)?;
            let subject = frame.scalar(target_r).stringify(&interp.heap);
            let limit = if limit_r == NONE_REG {
                0i64
            } else {
                frame.scalar(limit_r).numify().0.as_f64() as i64
            };
            let fields = do_split(&re, &subject, limit, awk)?;
            let out = match ctx {
                Context::Scalar => Value::Int(fields.len() as i64),
                _ => Value::list(fields),
            };
            frame.set(dst, out);
            Ok(pc + 6)
        }
        Opcode::PosOp => {
            let (dst, target_r) = (w(0), w(1));
            let pos = match frame.reg(target_r) {
                Value::Ref { id, .. } => match interp.heap.get(*id) {
                    crate::heap::Cell::Scalar(c) => c.magic.as_ref().and_then(|m| m.pos),
                    _ => None,
                },
                _ => None,
            };
            frame.set(dst, pos.map_or(Value::Undef, |p| Value::Int(p as i64)));
            Ok(pc + 2)
        }
        Opcode::CaptureGroup => {
            let (dst, n_r) = (w(0), w(1));
            let n = frame.scalar(n_r).numify().0.as_f64() as usize;
            let v = interp
                .last_match
                .as_ref()
                .and_then(|m| m.group_str(n))
                .map_or(Value::Undef, Value::str);
            frame.set(dst, v);
            Ok(pc + 2)
        }
        Opcode::MatchSpecial => {
            let (dst, which) = (w(0), w(1));
            let v = interp
                .last_match
                .as_ref()
                .and_then(|m| match which {
                    0 => m.group_str(0),
                    1 => m.prematch(),
                    _ => m.postmatch(),
                })
                .map_or(Value::Undef, Value::str);
            frame.set(dst, v);
            Ok(pc + 2)
        }
        Opcode::NamedCapture => {
            let (dst, name_r) = (w(0), w(1));
            let name = frame.scalar(name_r).stringify(&interp.heap);
            let v = interp
                .last_match
                .as_ref()
                .and_then(|m| m.named_str(&name))
                .map_or(Value::Undef, Value::str);
            frame.set(dst, v);
            Ok(pc + 2)
        }
        Opcode::MatchSpans => {
            let (dst, ends) = (w(0), w(1) != 0);
            let spans: Vec<Value> = interp
                .last_match
                .as_ref()
                .map(|m| {
                    m.spans
                        .iter()
                        .map(|s| match s {
                            Some((start, end)) => Value::Int(if ends { *end } else { *start } as i64),
                            None => Value::Undef,
                        })
                        .collect()
                })
                .unwrap_or_default();
            frame.set(dst, Value::list(spans));
            Ok(pc + 2)
        }
        _ => Err(RunError::Die(Value::str(format!("Unhandled regex opcode {op:?}")))),
    }
}

/// The regex operand: a qr value, or anything stringifiable (bound `=~ $re`).
fn regex_operand<T: ResourceTracker>(
    frame: &Frame,
    re_r: u16,
    interp: &mut Interp<T>,
) -> RunResult<Rc<CompiledRegex>> {
    match frame.reg(re_r) {
        Value::Regex(re) => {
            // An empty pattern reuses the last successful pattern.
            if re.pattern().is_empty()
                && let Some(last) = &interp.last_pattern
            {
                return Ok(Rc::clone(last));
            }
            Ok(Rc::clone(re))
        }
        other => {
            let pattern = other.stringify(&interp.heap);
            call::build_regex(interp, &pattern, "")
        }
    }
}

/// The match target: a scalar cell (pos-capable) or a plain value.
fn match_target<T: ResourceTracker>(interp: &Interp<T>, target: &Value) -> (Option<HeapId>, RcStr) {
    match target {
        Value::Ref { id, .. } if matches!(interp.heap.get(*id), crate::heap::Cell::Scalar(_)) => {
            let subject = interp.heap.scalar(*id).value.stringify(&interp.heap);
            (Some(*id), subject)
        }
        other => (None, other.stringify(&interp.heap)),
    }
}

fn set_pos<T: ResourceTracker>(interp: &mut Interp<T>, cell: Option<HeapId>, pos: Option<usize>) {
    if let Some(cell) = cell {
        interp.heap.scalar_mut(cell).magic_mut().pos = pos;
    }
}

fn get_pos<T: ResourceTracker>(interp: &Interp<T>, cell: Option<HeapId>) -> usize {
    cell.and_then(|c| match interp.heap.get(c) {
        crate::heap::Cell::Scalar(s) => s.magic.as_ref().and_then(|m| m.pos),
        _ => None,
    })
    .unwrap_or(0)
}

fn record_match<T: ResourceTracker>(
    interp: &mut Interp<T>,
    subject: &RcStr,
    spans: Vec<Option<(usize, usize)>>,
    re: &Rc<CompiledRegex>,
) {
    interp.last_match = Some(MatchState {
        subject: Rc::clone(subject),
        spans,
        names: re.names().to_vec(),
    });
    interp.last_pattern = Some(Rc::clone(re));
}

fn do_match<T: ResourceTracker>(
    interp: &mut Interp<T>,
    target: &Value,
    re: &Rc<CompiledRegex>,
    negated: bool,
    ctx: Context,
) -> RunResult<Value> {
    let (cell, subject) = match_target(interp, target);
    let global = re.flags.global;

    if global && ctx == Context::List {
        // Collect every match; captures interleave when present.
        let mut out = Vec::new();
        let mut at = 0usize;
        let mut last_spans = None;
        while at <= subject.len() {
            let Some(spans) = re.match_at(&subject, at).map_err(regex_die)? else { break };
            let Some((start, end)) = spans[0] else { break };
            if re.n_groups() == 0 {
                if let Some(text) = subject.get(start..end) {
                    out.push(Value::str(text));
                }
            } else {
                for span in spans.iter().skip(1) {
                    out.push(match span {
                        Some((s, e)) => subject.get(*s..*e).map_or(Value::Undef, Value::str),
                        None => Value::Undef,
                    });
                }
            }
            last_spans = Some(spans);
            at = if end > start { end } else { end + 1 };
        }
        set_pos(interp, cell, None);
        if let Some(spans) = last_spans {
            record_match(interp, &subject, spans, re);
        }
        if negated {
            return Ok(bool_value(out.is_empty()));
        }
        return Ok(Value::list(out));
    }

    let start = if global { get_pos(interp, cell) } else { 0 };
    let found = if start > subject.len() { None } else { re.match_at(&subject, start).map_err(regex_die)? };
    match found {
        Some(spans) => {
            let whole = spans[0];
            if global {
                set_pos(interp, cell, whole.map(|(_, e)| e));
            }
            let n_groups = re.n_groups();
            let captures: Vec<Value> = spans
                .iter()
                .skip(1)
                .map(|span| match span {
                    Some((s, e)) => subject.get(*s..*e).map_or(Value::Undef, Value::str),
                    None => Value::Undef,
                })
                .collect();
            record_match(interp, &subject, spans, re);
            if negated {
                return Ok(bool_value(false));
            }
            match ctx {
                // A successful captureless match in list context is (1).
                Context::List | Context::Runtime => {
                    if n_groups == 0 {
                        Ok(Value::list(vec![Value::Int(1)]))
                    } else {
                        Ok(Value::list(captures))
                    }
                }
                _ => Ok(Value::Int(1)),
            }
        }
        None => {
            if global && !re.flags.keep_pos {
                set_pos(interp, cell, None);
            }
            if negated {
                Ok(Value::Int(1))
            } else if matches!(ctx, Context::List | Context::Runtime) {
                Ok(Value::list(Vec::new()))
            } else {
                Ok(bool_value(false))
            }
        }
    }
}

fn do_subst<T: ResourceTracker, Tr: VmTracer>(
    interp: &mut Interp<T>,
    tracer: &mut Tr,
    target: &Value,
    re: &Rc<CompiledRegex>,
    repl_code: HeapId,
) -> RunResult<Value> {
    let (cell, subject) = match_target(interp, target);
    let global = re.flags.global;
    let nondestructive = re.flags.nondestructive;

    let mut out = String::new();
    let mut at = 0usize;
    let mut count = 0usize;
    loop {
        let found = if at > subject.len() { None } else { re.match_at(&subject, at).map_err(regex_die)? };
        let Some(spans) = found else { break };
        let Some((start, end)) = spans[0] else { break };
        out.push_str(subject.get(at..start).unwrap_or(""));
        record_match(interp, &subject, spans, re);
        // The replacement closure sees $1.. and $& for this match.
        let replacement = call::call_code(interp, tracer, repl_code, Vec::new(), Context::Scalar)?;
        out.push_str(&replacement.stringify(&interp.heap));
        count += 1;
        at = if end > start {
            end
        } else {
            // Zero-width match: copy one char through to make progress.
            if let Some(c) = subject[end..].chars().next() {
                out.push(c);
            }
            end + subject[end..].chars().next().map_or(1, char::len_utf8)
        };
        if !global || at > subject.len() {
            break;
        }
    }
    out.push_str(subject.get(at.min(subject.len())..).unwrap_or(""));

    if nondestructive {
        return Ok(Value::str(out));
    }
    if count > 0
        && let Some(cell) = cell
    {
        interp.heap.scalar_set(cell, Value::str(out))?;
    }
    if count == 0 {
        return Ok(bool_value(false));
    }
    Ok(Value::Int(count as i64))
}

fn do_split(
    re: &Rc<CompiledRegex>,
    subject: &str,
    limit: i64,
    awk: bool,
) -> RunResult<Vec<Value>> {
    let subject: &str = if awk { subject.trim_start() } else { subject };
    let mut fields: Vec<Value> = Vec::new();
    let mut at = 0usize;
    let mut field_start = 0usize;
    while at <= subject.len() {
        if limit > 0 && fields.len() as i64 >= limit - 1 {
            break;
        }
        let Some(spans) = re.match_at(subject, at).map_err(regex_die)? else { break };
        let Some((start, end)) = spans[0] else { break };
        if start == end {
            // Zero-width: split between characters.
            if start >= subject.len() {
                break;
            }
            if start == 0 {
                at = next_char(subject, 0);
                continue;
            }
            fields.push(Value::str(&subject[field_start..start]));
            field_start = start;
            at = next_char(subject, start);
            continue;
        }
        // A leading empty field is kept only for a non-zero-width match at 0.
        fields.push(Value::str(&subject[field_start..start]));
        for span in spans.iter().skip(1) {
            fields.push(match span {
                Some((s, e)) => subject.get(*s..*e).map_or(Value::Undef, Value::str),
                None => Value::Undef,
            });
        }
        field_start = end;
        at = end.max(next_char(subject, start));
    }
    fields.push(Value::str(&subject[field_start.min(subject.len())..]));
    // Default limit strips trailing empty fields.
    if limit == 0 {
        while fields.last().is_some_and(|f| f.stringify_empty()) {
            fields.pop();
        }
    }
    Ok(fields)
}

fn next_char(s: &str, at: usize) -> usize {
    at + s[at..].chars().next().map_or(1, char::len_utf8)
}

fn regex_die(e: crate::regex::RegexError) -> RunError {
    RunError::Die(Value::str(e.message))
}

impl Value {
    fn stringify_empty(&self) -> bool {
        matches!(self, Value::Str(s) if s.is_empty()) || matches!(self, Value::Undef)
    }
}
