//! IO, pack/unpack, and object-model handlers (900–1199 except the regex
//! block, which lives in [`super::regexops`]).

use std::rc::Rc;

use crate::{
    ast::Context,
    bytecode::op::{NONE_REG, Opcode, word_to_ctx},
    error::{RunError, RunResult},
    heap::{Cell, GlobCell, HeapId},
    interp::Interp,
    io::IoId,
    pack::{pack::pack_values, unpack::unpack_values},
    resource::ResourceTracker,
    sprintf::sprintf_value,
    tracer::VmTracer,
    value::Value,
    warnings::WarningCategory,
};

use super::{Frame, call, compare::bool_value, resolve_ctx};

pub(crate) fn handle<T: ResourceTracker, Tr: VmTracer>(
    op: Opcode,
    frame: &mut Frame,
    pc: usize,
    interp: &mut Interp<T>,
    tracer: &mut Tr,
) -> RunResult<usize> {
    // The regex block of the range delegates sideways.
    if matches!(
        op,
        Opcode::LoadRegex
            | Opcode::BuildRegex
            | Opcode::Match
            | Opcode::Subst
            | Opcode::Split
            | Opcode::PosOp
            | Opcode::CaptureGroup
            | Opcode::MatchSpecial
            | Opcode::NamedCapture
            | Opcode::MatchSpans
    ) {
        return super::regexops::handle(op, frame, pc, interp, tracer);
    }

    let code = Rc::clone(&frame.code);
    let w = |k: usize| code.words[pc + k];

    match op {
        Opcode::Print | Opcode::Say => {
            let (dst, fh_r, list_r) = (w(0), w(1), w(2));
            let handle = resolve_handle(interp, frame, fh_r);
            let items = frame.list(list_r);
            let sep = interp.special_string("main::,");
            let end = if op == Opcode::Say {
                Rc::from("\n")
            } else {
                interp.special_string("main::\\")
            };
            let mut text = String::new();
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    text.push_str(&sep);
                }
                text.push_str(&call::stringify_warn(interp, tracer, frame, pc, item)?);
            }
            text.push_str(&end);
            let ok = write_handle(interp, tracer, frame, pc, handle, text.as_bytes())?;
            frame.set(dst, bool_value(ok));
            Ok(pc + 3)
        }
        Opcode::Printf => {
            let (dst, fh_r, list_r) = (w(0), w(1), w(2));
            let handle = resolve_handle(interp, frame, fh_r);
            let mut items = frame.list(list_r);
            let fmt = if items.is_empty() { Rc::from("") } else { items.remove(0).stringify(&interp.heap) };
            let (text, _) = sprintf_value(&fmt, &items, &interp.heap);
            let ok = write_handle(interp, tracer, frame, pc, handle, text.as_bytes())?;
            frame.set(dst, bool_value(ok));
            Ok(pc + 3)
        }
        Opcode::Open => {
            let (dst, target_r, args_r) = (w(0), w(1), w(2));
            let args = frame.list(args_r);
            let target = frame.take(target_r);
            let ok = do_open(interp, &target, &args)?;
            frame.set(dst, bool_value(ok));
            Ok(pc + 3)
        }
        Opcode::Close => {
            let (dst, fh_r) = (w(0), w(1));
            let ok = match resolve_handle(interp, frame, fh_r) {
                Some(id) => interp.io.close(id),
                None => false,
            };
            frame.set(dst, bool_value(ok));
            Ok(pc + 2)
        }
        Opcode::Readline => {
            let (dst, fh_r) = (w(0), w(1));
            let ctx = resolve_ctx(word_to_ctx(w(2)), frame);
            let Some(id) = resolve_handle(interp, frame, fh_r) else {
                call::warn_category(interp, tracer, frame, pc, WarningCategory::Unopened, "readline() on unopened filehandle")?;
                frame.set(dst, Value::Undef);
                return Ok(pc + 3);
            };
            let sep_value = interp.special_string("main::/");
            let sep_bytes = crate::value::string_to_bytes(&sep_value);
            let sep = {
                let cell = interp.global_scalar_cell("main::/")?;
                if interp.heap.scalar(cell).value.is_undef() { None } else { Some(sep_bytes.as_slice()) }
            };
            if ctx == Context::List {
                let mut out = Vec::new();
                while let Some(record) = interp.io.read_record(id, sep).map_err(io_die)? {
                    out.push(bytes_to_value(record));
                }
                frame.set(dst, Value::list(out));
            } else {
                let v = match interp.io.read_record(id, sep).map_err(io_die)? {
                    Some(record) => bytes_to_value(record),
                    None => Value::Undef,
                };
                frame.set(dst, v);
            }
            Ok(pc + 3)
        }
        Opcode::EofOp => {
            let (dst, fh_r) = (w(0), w(1));
            let at_eof = match if fh_r == NONE_REG { Some(IoId(2)) } else { resolve_handle(interp, frame, fh_r) } {
                Some(id) => interp.io.at_eof(id),
                None => true,
            };
            frame.set(dst, bool_value(at_eof));
            Ok(pc + 2)
        }
        Opcode::Binmode => {
            // Layers are accepted and inert: the runtime is byte-faithful.
            frame.set(w(0), Value::Int(1));
            Ok(pc + 2)
        }
        Opcode::Sleep => {
            let (dst, src) = (w(0), w(1));
            let secs = if src == NONE_REG { 0.0 } else { frame.scalar(src).numify().0.as_f64() };
            if secs > 0.0 {
                std::thread::sleep(std::time::Duration::from_secs_f64(secs));
            }
            frame.set(dst, Value::Int(secs as i64));
            Ok(pc + 2)
        }
        Opcode::Time => {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map_or(0, |d| d.as_secs());
            frame.set(w(0), Value::Int(now as i64));
            Ok(pc + 2)
        }
        Opcode::Tie => {
            let (dst, target_r, args_r) = (w(0), w(1), w(2));
            let cell = frame.ref_cell(target_r)?;
            let mut args = frame.list(args_r);
            if args.is_empty() {
                return Err(RunError::Die(Value::str("Not enough arguments for tie")));
            }
            let pkg = args.remove(0);
            let pkg_name = pkg.stringify(&interp.heap);
            let ctor = interp
                .stashes
                .resolve_method(&interp.heap, &pkg_name, "TIESCALAR")
                .ok_or_else(|| {
                    RunError::Die(Value::str(format!(
                        "Can't locate object method \"TIESCALAR\" via package \"{pkg_name}\""
                    )))
                })?;
            let mut ctor_args = vec![pkg];
            ctor_args.extend(args);
            let object = call::call_code(interp, tracer, ctor, ctor_args, Context::Scalar)?;
            interp.heap.scalar_mut(cell).magic_mut().tie = Some(object.clone());
            frame.set(dst, object);
            Ok(pc + 3)
        }
        Opcode::Untie => {
            let (dst, target_r) = (w(0), w(1));
            let cell = frame.ref_cell(target_r)?;
            if let Cell::Scalar(c) = interp.heap.get_mut(cell)
                && let Some(magic) = &mut c.magic
            {
                magic.tie = None;
            }
            frame.set(dst, Value::Int(1));
            Ok(pc + 2)
        }
        Opcode::Tied => {
            let (dst, target_r) = (w(0), w(1));
            let cell = frame.ref_cell(target_r)?;
            let obj = match interp.heap.get(cell) {
                Cell::Scalar(c) => c.tied().cloned(),
                _ => None,
            };
            frame.set(dst, obj.unwrap_or(Value::Undef));
            Ok(pc + 2)
        }
        Opcode::Bless => {
            let (dst, ref_r, pkg_r) = (w(0), w(1), w(2));
            let v = frame.take(ref_r);
            let Value::Ref { id, .. } = &v else {
                return Err(RunError::Die(Value::str("Can't bless non-reference value")));
            };
            let pkg = frame.scalar(pkg_r).stringify(&interp.heap);
            interp.stashes.ensure_package(&pkg);
            interp.heap.bless(*id, pkg);
            frame.set(dst, v);
            Ok(pc + 3)
        }
        Opcode::RefOp => {
            let (dst, src) = (w(0), w(1));
            let v = frame.scalar(src);
            let name = match &v {
                Value::Ref { id, .. } => interp.heap.ref_name(*id).to_string(),
                Value::Regex(_) => "Regexp".to_string(),
                Value::Glob(_) => "GLOB".to_string(),
                _ => String::new(),
            };
            frame.set(dst, Value::str(name));
            Ok(pc + 2)
        }
        Opcode::DefinedOp => {
            let (dst, src) = (w(0), w(1));
            let v = frame.scalar(src);
            frame.set(dst, bool_value(v.defined()));
            Ok(pc + 2)
        }
        Opcode::UndefOp => {
            let (dst, target_r) = (w(0), w(1));
            if target_r != NONE_REG {
                let cell = frame.ref_cell(target_r)?;
                match interp.heap.get_mut(cell) {
                    Cell::Scalar(c) => c.value = Value::Undef,
                    Cell::Array(a) => a.elems.clear(),
                    Cell::Hash(h) => {
                        h.map.clear();
                        h.iter_pos = 0;
                    }
                    _ => {}
                }
            }
            frame.set(dst, Value::Undef);
            Ok(pc + 2)
        }
        Opcode::Pack => {
            let (dst, list_r) = (w(0), w(1));
            let mut args = frame.list(list_r);
            if args.is_empty() {
                frame.set(dst, Value::str(""));
                return Ok(pc + 2);
            }
            let template = args.remove(0).stringify(&interp.heap);
            // Overloaded objects numify/stringify through their handlers
            // before the engine type-checks them (the `w` format contract).
            for arg in &mut args {
                if let Value::Ref { id, .. } = arg
                    && interp.heap.blessed(*id).is_some()
                {
                    let plain = overload_plain(interp, tracer, arg)?;
                    *arg = plain;
                }
            }
            let packed = pack_values(&template, &args, &interp.heap)
                .map_err(|e| RunError::Die(Value::str(e.message)))?;
            frame.set(dst, packed);
            Ok(pc + 2)
        }
        Opcode::Unpack => {
            let (dst, tmpl_r, src_r) = (w(0), w(1), w(2));
            let ctx = resolve_ctx(word_to_ctx(w(3)), frame);
            let template = frame.scalar(tmpl_r).stringify(&interp.heap);
            let input = frame.scalar(src_r);
            let values = unpack_values(&template, &input, &interp.heap)
                .map_err(|e| RunError::Die(Value::str(e.message)))?;
            let out = match ctx {
                Context::Scalar => values.into_iter().next().unwrap_or(Value::Undef),
                _ => Value::list(values),
            };
            frame.set(dst, out);
            Ok(pc + 4)
        }
        _ => Err(RunError::Die(Value::str(format!("Unhandled io opcode {op:?}")))),
    }
}

/// Resolves a handle-bearing value: a glob, a ref to a glob, or a scalar
/// holding one.
fn resolve_handle<T: ResourceTracker>(interp: &Interp<T>, frame: &Frame, fh_r: u16) -> Option<IoId> {
    if fh_r == NONE_REG {
        return Some(IoId(0));
    }
    handle_of_value(interp, &frame.scalar(fh_r))
}

fn handle_of_value<T: ResourceTracker>(interp: &Interp<T>, v: &Value) -> Option<IoId> {
    match v {
        Value::Glob(glob) => interp.heap.glob(*glob).io,
        Value::Ref { id, .. } => match interp.heap.get(*id) {
            Cell::Glob(g) => g.io,
            Cell::Scalar(s) => handle_of_value(interp, &s.value.clone()),
            _ => None,
        },
        Value::Str(name) => {
            let (pkg, short) = crate::stash::Stashes::split_name(name, "main");
            let glob = interp.stashes.find_glob(&pkg, short)?;
            interp.heap.glob(glob).io
        }
        _ => None,
    }
}

fn write_handle<T: ResourceTracker, Tr: VmTracer>(
    interp: &mut Interp<T>,
    tracer: &mut Tr,
    frame: &Frame,
    pc: usize,
    handle: Option<IoId>,
    bytes: &[u8],
) -> RunResult<bool> {
    let Some(id) = handle else {
        call::warn_category(interp, tracer, frame, pc, WarningCategory::Unopened, "print() on unopened filehandle")?;
        return Ok(false);
    };
    let Interp { io, heap, writer, .. } = interp;
    io.write(id, bytes, heap, writer.as_mut())
}

fn bytes_to_value(bytes: Vec<u8>) -> Value {
    match String::from_utf8(bytes) {
        Ok(s) => Value::str(s),
        Err(e) => Value::from_bytes(e.into_bytes()),
    }
}

fn io_die(e: std::io::Error) -> RunError {
    RunError::Die(Value::str(format!("I/O error: {e}")))
}

/// `open FH, MODE, EXPR` and the 2-arg form.
fn do_open<T: ResourceTracker>(interp: &mut Interp<T>, target: &Value, args: &[Value]) -> RunResult<bool> {
    let (mode, path_value) = match args {
        [mode, path, ..] => {
            let m = mode.stringify(&interp.heap).to_string();
            (m, path.clone())
        }
        [spec] => {
            let s = spec.stringify(&interp.heap).to_string();
            let trimmed = s.trim();
            let (m, p) = if let Some(rest) = trimmed.strip_prefix(">>") {
                (">>", rest)
            } else if let Some(rest) = trimmed.strip_prefix('>') {
                (">", rest)
            } else if let Some(rest) = trimmed.strip_prefix('<') {
                ("<", rest)
            } else {
                ("<", trimmed)
            };
            (m.to_string(), Value::str(p.trim()))
        }
        [] => return Err(RunError::Die(Value::str("Not enough arguments for open"))),
    };

    // In-memory handles: the path is a scalar ref.
    let io_id = if let Value::Ref { id, .. } = &path_value
        && matches!(interp.heap.get(*id), Cell::Scalar(_))
    {
        match mode.as_str() {
            "<" => {
                let data = interp.heap.scalar(*id).value.to_byte_vec(&interp.heap);
                Some(interp.io.open_scalar_read(data))
            }
            ">" | ">>" => {
                if mode == ">" {
                    interp.heap.scalar_set(*id, Value::str(""))?;
                }
                Some(interp.io.open_scalar_write(*id))
            }
            _ => None,
        }
    } else {
        let path = path_value.stringify(&interp.heap);
        match interp.io.open_file(&path, &mode) {
            Ok(id) => Some(id),
            Err(e) => {
                interp.set_special("main::!", Value::str(e.to_string()));
                return Ok(false);
            }
        }
    };
    let Some(io_id) = io_id else {
        interp.set_special("main::!", Value::str("Unknown open() mode"));
        return Ok(false);
    };

    // Bind the handle: through a glob target directly, else a fresh
    // anonymous glob stored into the scalar target.
    match target {
        Value::Glob(glob) => {
            interp.heap.glob_mut(*glob).io = Some(io_id);
        }
        Value::Ref { id, .. } => {
            let glob = interp.heap.alloc(Cell::Glob(GlobCell::new(Rc::from("main::__ANONIO__"))))?;
            interp.heap.glob_mut(glob).io = Some(io_id);
            interp.heap.scalar_set(*id, Value::Glob(glob))?;
        }
        _ => return Err(RunError::Die(Value::str("Bad filehandle target in open"))),
    }
    Ok(true)
}

/// Converts a blessed, overloaded operand into its plain numeric/string
/// form via `0+` or `""`.
fn overload_plain<T: ResourceTracker, Tr: VmTracer>(
    interp: &mut Interp<T>,
    tracer: &mut Tr,
    value: &Value,
) -> RunResult<Value> {
    let Value::Ref { id, .. } = value else { return Ok(value.clone()) };
    let Some(pkg) = interp.heap.blessed(*id).cloned() else { return Ok(value.clone()) };
    if !interp.stashes.has_overload(&interp.heap, &pkg) {
        return Ok(value.clone());
    }
    for symbol in ["0+", "\"\""] {
        if let Some(handler) = interp.stashes.find_overload(&interp.heap, &pkg, symbol)
            && let Value::Ref { id: code, .. } = handler
            && matches!(interp.heap.get(code), Cell::Code(_))
        {
            let args = vec![value.clone(), Value::Undef, Value::Int(0)];
            return call::call_code(interp, tracer, code, args, Context::Scalar);
        }
    }
    Ok(value.clone())
}
