//! Call machinery: sub and method invocation, closures, `eval STRING`,
//! tie and overload dispatch, `die`/`warn` routing, and `caller`.

use std::rc::Rc;

use crate::{
    ast::Context,
    bytecode::code::Code,
    error::{RunError, RunResult},
    heap::{Cell, CodeCell, HeapId},
    interp::{CallerFrame, Interp},
    regex::CompiledRegex,
    resource::ResourceTracker,
    tracer::VmTracer,
    value::{Number, NumifyNote, RcStr, Value},
    warnings::WarningCategory,
};

use super::{Frame, run_code};

/// Marker prefix left by `GLOBAL_CODE` for names with no installed sub.
const UNDEF_SUB_MARKER: &str = "\0undef_sub\0";

/// Invokes a code cell with the given arguments.
pub(crate) fn call_code<T: ResourceTracker, Tr: VmTracer>(
    interp: &mut Interp<T>,
    tracer: &mut Tr,
    cell: HeapId,
    args: Vec<Value>,
    ctx: Context,
) -> RunResult<Value> {
    let (code, captures) = {
        let c = interp.heap.code(cell);
        (Rc::clone(&c.code), c.captures.clone())
    };
    run_code(interp, tracer, &code, &captures, args, ctx)
}

/// `CALL_SUB`: the callee register holds a code ref or a (symbolic) name.
pub(crate) fn call_value<T: ResourceTracker, Tr: VmTracer>(
    interp: &mut Interp<T>,
    tracer: &mut Tr,
    frame: &Frame,
    pc: usize,
    callee: &Value,
    args: Vec<Value>,
    ctx: Context,
) -> RunResult<Value> {
    match callee {
        Value::Ref { id, .. } if matches!(interp.heap.get(*id), Cell::Code(_)) => {
            let name = interp.heap.code(*id).name.clone().unwrap_or_else(|| Rc::from("__ANON__"));
            push_caller(interp, frame, pc, name, ctx);
            let result = call_code(interp, tracer, *id, args, ctx);
            interp.call_stack.pop();
            result
        }
        Value::Str(s) => {
            if let Some(name) = s.strip_prefix(UNDEF_SUB_MARKER) {
                return Err(RunError::Die(Value::str(format!("Undefined subroutine &{name} called"))));
            }
            // Symbolic call by name.
            let (pkg, short) = crate::stash::Stashes::split_name(s, "main");
            match interp.stashes.code_slot(&interp.heap, &pkg, short) {
                Some(cell) => {
                    push_caller(interp, frame, pc, Rc::from(&**s), ctx);
                    let result = call_code(interp, tracer, cell, args, ctx);
                    interp.call_stack.pop();
                    result
                }
                None => Err(RunError::Die(Value::str(format!("Undefined subroutine &{pkg}::{short} called")))),
            }
        }
        _ => Err(RunError::Die(Value::str("Not a CODE reference"))),
    }
}

fn push_caller<T: ResourceTracker>(interp: &mut Interp<T>, frame: &Frame, pc: usize, callee: RcStr, ctx: Context) {
    let (file, line) = frame.position(pc);
    interp.call_stack.push(CallerFrame {
        package: Rc::clone(&frame.code.package),
        file,
        line,
        callee,
        wantarray: ctx,
    });
}

/// Method dispatch with `@ISA` resolution; `super_from` forces SUPER:: from
/// that package.
#[expect(clippy::too_many_arguments, reason = "dispatch needs the full call site")]
pub(crate) fn method_call<T: ResourceTracker, Tr: VmTracer>(
    interp: &mut Interp<T>,
    tracer: &mut Tr,
    frame: &Frame,
    pc: usize,
    invocant: Value,
    name: &Value,
    mut args: Vec<Value>,
    ctx: Context,
    super_from: Option<RcStr>,
) -> RunResult<Value> {
    // `$obj->$code(...)` — a code ref used as the method.
    if let Value::Ref { id, .. } = name
        && matches!(interp.heap.get(*id), Cell::Code(_))
    {
        args.insert(0, invocant);
        push_caller(interp, frame, pc, Rc::from("__ANON__"), ctx);
        let result = call_code(interp, tracer, *id, args, ctx);
        interp.call_stack.pop();
        return result;
    }

    let method = name.stringify(&interp.heap);
    let pkg: RcStr = match &invocant {
        Value::Undef => {
            return Err(RunError::Die(Value::str(format!(
                "Can't call method \"{method}\" on an undefined value"
            ))));
        }
        Value::Ref { id, .. } => match interp.heap.blessed(*id) {
            Some(pkg) => Rc::clone(pkg),
            None => {
                return Err(RunError::Die(Value::str(format!(
                    "Can't call method \"{method}\" on unblessed reference"
                ))));
            }
        },
        other => other.stringify(&interp.heap),
    };

    let resolved = match &super_from {
        Some(from) => interp.stashes.resolve_super(&interp.heap, from, &method),
        None => interp.stashes.resolve_method(&interp.heap, &pkg, &method),
    };

    match resolved {
        Some(cell) => {
            args.insert(0, invocant);
            push_caller(interp, frame, pc, Rc::from(format!("{pkg}::{method}").as_str()), ctx);
            let result = call_code(interp, tracer, cell, args, ctx);
            interp.call_stack.pop();
            result
        }
        // UNIVERSAL::can and ::isa are built in.
        None if method.as_ref() == "can" => {
            let want = args.first().map(|v| v.stringify(&interp.heap)).unwrap_or_default();
            match interp.stashes.resolve_method(&interp.heap, &pkg, &want) {
                Some(cell) => Ok(Value::Ref { id: cell, weak: false }),
                None => Ok(Value::Undef),
            }
        }
        None if method.as_ref() == "isa" => {
            let want = args.first().map(|v| v.stringify(&interp.heap)).unwrap_or_default();
            Ok(Value::Int(i64::from(interp.stashes.isa(&interp.heap, &pkg, &want))))
        }
        None if method.as_ref() == "DOES" => {
            let want = args.first().map(|v| v.stringify(&interp.heap)).unwrap_or_default();
            Ok(Value::Int(i64::from(interp.stashes.isa(&interp.heap, &pkg, &want))))
        }
        None => Err(RunError::Die(Value::str(format!(
            "Can't locate object method \"{method}\" via package \"{pkg}\""
        )))),
    }
}

/// Builds a closure cell over the current frame.
pub(crate) fn capture_closure<T: ResourceTracker>(
    interp: &mut Interp<T>,
    frame: &Frame,
    sub_code: &Rc<Code>,
) -> RunResult<HeapId> {
    let captures = resolve_captures(frame, sub_code);
    interp.heap.alloc(Cell::Code(CodeCell {
        code: Rc::clone(sub_code),
        captures,
        package: Rc::clone(&sub_code.package),
        name: None,
        prototype: None,
    }))
}

/// Maps a nested code object's capture descriptors onto this frame's pad.
pub(crate) fn resolve_captures(frame: &Frame, sub_code: &Code) -> Vec<HeapId> {
    let offset = frame.code.pad_offset as usize;
    sub_code
        .captures
        .iter()
        .map(|source| match source {
            crate::ast::CaptureSource::ParentCapture(i) => frame.pad[*i as usize],
            crate::ast::CaptureSource::ParentLexical(slot) => frame.pad[offset + *slot as usize],
        })
        .collect()
}

/// `EVAL_STRING`: compile against the site snapshot, run as a die boundary.
pub(crate) fn eval_string<T: ResourceTracker, Tr: VmTracer>(
    interp: &mut Interp<T>,
    tracer: &mut Tr,
    frame: &Frame,
    source: &str,
    snap_idx: u16,
    ctx: Context,
) -> RunResult<Value> {
    let snapshot = Rc::clone(&frame.code.snapshots[snap_idx as usize]);
    let package = Rc::clone(&frame.code.package);
    let code = match interp.compile_eval(source, snapshot, package) {
        Ok(code) => code,
        Err(payload) => {
            interp.set_special("main::@", payload);
            return Ok(Value::Undef);
        }
    };
    let captures = resolve_captures(frame, &code);
    push_caller(interp, frame, 0, Rc::from("(eval)"), ctx);
    let result = run_code(interp, tracer, &code, &captures, Vec::new(), ctx);
    interp.call_stack.pop();
    match result {
        Ok(value) => {
            interp.set_special("main::@", Value::str(""));
            Ok(value)
        }
        Err(RunError::Die(payload)) => {
            interp.set_special("main::@", payload);
            Ok(Value::Undef)
        }
        Err(other) => Err(other),
    }
}

/// `eval BLOCK`-equivalent boundary around a code value (try/catch uses the
/// inline handler path instead; this serves sort/map/grep bodies no die
/// protection, so it simply forwards).
pub(crate) fn call_block_code<T: ResourceTracker, Tr: VmTracer>(
    interp: &mut Interp<T>,
    tracer: &mut Tr,
    code_cell: HeapId,
    args: Vec<Value>,
    ctx: Context,
) -> RunResult<Value> {
    call_code(interp, tracer, code_cell, args, ctx)
}

// ---- tie-aware scalar access ----

pub(crate) fn scalar_fetch<T: ResourceTracker, Tr: VmTracer>(
    interp: &mut Interp<T>,
    tracer: &mut Tr,
    cell: HeapId,
) -> RunResult<Value> {
    let tied = match interp.heap.get(cell) {
        Cell::Scalar(c) => c.tied().cloned(),
        Cell::Freed => return Ok(Value::Undef),
        other => {
            // Container cells read as refs to themselves (rare paths).
            let _ = other;
            return Ok(Value::Ref { id: cell, weak: false });
        }
    };
    match tied {
        None => Ok(interp.heap.scalar_value(cell)),
        Some(obj) => tie_method(interp, tracer, &obj, "FETCH", Vec::new()),
    }
}

pub(crate) fn scalar_store<T: ResourceTracker, Tr: VmTracer>(
    interp: &mut Interp<T>,
    tracer: &mut Tr,
    cell: HeapId,
    value: Value,
) -> RunResult<()> {
    let tied = match interp.heap.get(cell) {
        Cell::Scalar(c) => c.tied().cloned(),
        _ => None,
    };
    match tied {
        None => interp.heap.scalar_set(cell, value),
        Some(obj) => {
            tie_method(interp, tracer, &obj, "STORE", vec![value])?;
            Ok(())
        }
    }
}

/// Calls a tie handler method on the tied object.
pub(crate) fn tie_method<T: ResourceTracker, Tr: VmTracer>(
    interp: &mut Interp<T>,
    tracer: &mut Tr,
    obj: &Value,
    method: &str,
    mut args: Vec<Value>,
) -> RunResult<Value> {
    let Value::Ref { id, .. } = obj else {
        return Err(RunError::Die(Value::str("Tied variable lost its object")));
    };
    let Some(pkg) = interp.heap.blessed(*id).cloned() else {
        return Err(RunError::Die(Value::str("Tied variable lost its object")));
    };
    let Some(cell) = interp.stashes.resolve_method(&interp.heap, &pkg, method) else {
        return Err(RunError::Die(Value::str(format!(
            "Can't locate object method \"{method}\" via package \"{pkg}\""
        ))));
    };
    args.insert(0, obj.clone());
    call_code(interp, tracer, cell, args, Context::Scalar)
}

// ---- overload ----

/// Tries operator overloading on a binary op. Returns `None` when neither
/// operand is a blessed ref with a table for the operator.
pub(crate) fn overload_binary<T: ResourceTracker, Tr: VmTracer>(
    interp: &mut Interp<T>,
    tracer: &mut Tr,
    symbol: &str,
    left: &Value,
    right: &Value,
) -> RunResult<Option<Value>> {
    for (this, other, swapped) in [(left, right, false), (right, left, true)] {
        let Value::Ref { id, .. } = this else { continue };
        let Some(pkg) = interp.heap.blessed(*id).cloned() else { continue };
        if !interp.stashes.has_overload(&interp.heap, &pkg) {
            continue;
        }
        if let Some(handler) = interp.stashes.find_overload(&interp.heap, &pkg, symbol)
            && let Value::Ref { id: code, .. } = handler
            && matches!(interp.heap.get(code), Cell::Code(_))
        {
            let args = vec![this.clone(), other.clone(), Value::Int(i64::from(swapped))];
            return call_code(interp, tracer, code, args, Context::Scalar).map(Some);
        }
    }
    Ok(None)
}

/// Overloaded stringification (`""`), used by print/concat paths.
pub(crate) fn stringify_overloaded<T: ResourceTracker, Tr: VmTracer>(
    interp: &mut Interp<T>,
    tracer: &mut Tr,
    value: &Value,
) -> RunResult<RcStr> {
    if let Value::Ref { id, .. } = value
        && let Some(pkg) = interp.heap.blessed(*id).cloned()
        && interp.stashes.has_overload(&interp.heap, &pkg)
        && let Some(handler) = interp.stashes.find_overload(&interp.heap, &pkg, "\"\"")
        && let Value::Ref { id: code, .. } = handler
        && matches!(interp.heap.get(code), Cell::Code(_))
    {
        let args = vec![value.clone(), Value::Undef, Value::Int(0)];
        let result = call_code(interp, tracer, code, args, Context::Scalar)?;
        return Ok(result.stringify(&interp.heap));
    }
    Ok(value.stringify(&interp.heap))
}

// ---- die / warn ----

/// Builds the `die` payload and runs `$SIG{__DIE__}`.
pub(crate) fn do_die<T: ResourceTracker, Tr: VmTracer>(
    interp: &mut Interp<T>,
    tracer: &mut Tr,
    frame: &Frame,
    pc: usize,
    args: Vec<Value>,
) -> RunError {
    let payload = if args.len() == 1 && matches!(args[0], Value::Ref { .. }) {
        args[0].clone()
    } else {
        let text: String = args.iter().map(|v| v.stringify(&interp.heap).to_string()).collect();
        let text = if text.is_empty() { "Died".to_string() } else { text };
        if text.ends_with('\n') {
            Value::str(text)
        } else {
            let (file, line) = frame.position(pc);
            Value::str(format!("{text} at {file} line {line}.\n"))
        }
    };
    tracer.on_die(&payload.stringify(&interp.heap));
    // $SIG{__DIE__} sees the raise before unwinding.
    if !interp.in_sig_handler
        && let Some(handler) = interp.sig_handler("__DIE__")
        && let Value::Ref { id, .. } = handler
    {
        interp.in_sig_handler = true;
        let hook = call_code(interp, tracer, id, vec![payload.clone()], Context::Void);
        interp.in_sig_handler = false;
        if let Err(e) = hook {
            return e;
        }
    }
    RunError::Die(payload)
}

pub(crate) fn do_warn<T: ResourceTracker, Tr: VmTracer>(
    interp: &mut Interp<T>,
    tracer: &mut Tr,
    frame: &Frame,
    pc: usize,
    args: Vec<Value>,
) -> RunResult<()> {
    let text: String = args.iter().map(|v| v.stringify(&interp.heap).to_string()).collect();
    let text = if text.is_empty() { "Warning: something's wrong".to_string() } else { text };
    let full = if text.ends_with('\n') {
        text
    } else {
        let (file, line) = frame.position(pc);
        format!("{text} at {file} line {line}.\n")
    };
    if let Some(handler) = interp.route_warning(&full)
        && let Value::Ref { id, .. } = handler
    {
        interp.in_sig_handler = true;
        let result = call_code(interp, tracer, id, vec![Value::str(full)], Context::Void);
        interp.in_sig_handler = false;
        result?;
    }
    Ok(())
}

/// Category-gated runtime warning (`uninitialized`, `numeric`, ...).
pub(crate) fn warn_category<T: ResourceTracker, Tr: VmTracer>(
    interp: &mut Interp<T>,
    tracer: &mut Tr,
    frame: &Frame,
    pc: usize,
    category: WarningCategory,
    message: &str,
) -> RunResult<()> {
    if frame.warn_mask & category.bit() == 0 {
        return Ok(());
    }
    let (file, line) = frame.position(pc);
    let full = format!("{message} at {file} line {line}.\n");
    if let Some(handler) = interp.route_warning(&full)
        && let Value::Ref { id, .. } = handler
    {
        interp.in_sig_handler = true;
        let result = call_code(interp, tracer, id, vec![Value::str(full)], Context::Void);
        interp.in_sig_handler = false;
        result?;
    }
    Ok(())
}

/// Numification with Perl's warnings.
pub(crate) fn numify_warn<T: ResourceTracker, Tr: VmTracer>(
    interp: &mut Interp<T>,
    tracer: &mut Tr,
    frame: &Frame,
    pc: usize,
    value: &Value,
) -> RunResult<Number> {
    let (n, note) = value.numify();
    match note {
        NumifyNote::Clean => {}
        NumifyNote::Uninitialized => {
            warn_category(interp, tracer, frame, pc, WarningCategory::Uninitialized, "Use of uninitialized value")?;
        }
        NumifyNote::NotNumeric => {
            let text = value.stringify(&interp.heap);
            warn_category(
                interp,
                tracer,
                frame,
                pc,
                WarningCategory::Numeric,
                &format!("Argument \"{text}\" isn't numeric"),
            )?;
        }
    }
    Ok(n)
}

/// Stringification with the `uninitialized` warning.
pub(crate) fn stringify_warn<T: ResourceTracker, Tr: VmTracer>(
    interp: &mut Interp<T>,
    tracer: &mut Tr,
    frame: &Frame,
    pc: usize,
    value: &Value,
) -> RunResult<RcStr> {
    if value.is_undef() {
        warn_category(interp, tracer, frame, pc, WarningCategory::Uninitialized, "Use of uninitialized value")?;
        return Ok(Rc::from(""));
    }
    stringify_overloaded(interp, tracer, value)
}

/// `caller EXPR` — shapes the frame record per context.
pub(crate) fn caller_info<T: ResourceTracker>(interp: &Interp<T>, level: usize, ctx: Context) -> Value {
    let len = interp.call_stack.len();
    let Some(entry) = len.checked_sub(1 + level).and_then(|i| interp.call_stack.get(i)) else {
        return Value::Undef;
    };
    match ctx {
        Context::Scalar | Context::Void => Value::Str(Rc::clone(&entry.package)),
        _ => {
            let mut items = vec![
                Value::Str(Rc::clone(&entry.package)),
                Value::Str(Rc::clone(&entry.file)),
                Value::Int(i64::from(entry.line)),
            ];
            if level < len {
                items.push(Value::Str(Rc::clone(&entry.callee)));
                items.push(Value::Int(1));
                items.push(match entry.wantarray {
                    Context::List | Context::Runtime => Value::Int(1),
                    Context::Scalar => Value::str(""),
                    Context::Void => Value::Undef,
                });
            }
            Value::list(items)
        }
    }
}

/// Builds (and caches) a runtime-interpolated regex; an empty pattern reuses
/// the last successful one.
pub(crate) fn build_regex<T: ResourceTracker>(
    interp: &mut Interp<T>,
    pattern: &str,
    mods: &str,
) -> RunResult<Rc<CompiledRegex>> {
    if pattern.is_empty()
        && let Some(last) = &interp.last_pattern
    {
        return Ok(Rc::clone(last));
    }
    let key = (pattern.to_string(), mods.to_string());
    if let Some(re) = interp.regex_cache.get(&key) {
        return Ok(Rc::clone(re));
    }
    let compiled = CompiledRegex::compile(pattern, mods)
        .map_err(|e| RunError::Die(Value::str(e.message)))?;
    let re = Rc::new(compiled);
    interp.regex_cache.insert(key, Rc::clone(&re));
    Ok(re)
}
