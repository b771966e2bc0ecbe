//! The register bytecode interpreter.
//!
//! One [`Frame`] per native call; recursion is native recursion through
//! [`run_code`]. The dispatch loop reads 16-bit opcode words and jumps
//! through contiguous category ranges: control flow and register movement
//! are handled inline here, and each remaining range delegates to a handler
//! module with the uniform shape `(op, frame, pc, interp, tracer) → new pc`,
//! so the hot loop stays small and each handler stays compact.
//!
//! `die` unwinds as an `Err` to the nearest handler pushed by `EVAL_TRY`
//! (inline `eval BLOCK` regions) or out of the frame to the calling
//! `eval STRING`/sub boundary. Loop controls resolve against the frame's
//! loop stack first and unwind as errors only when they cross a frame.

pub(crate) mod arith;
pub(crate) mod call;
pub(crate) mod collections;
pub(crate) mod compare;
pub(crate) mod ioops;
pub(crate) mod regexops;
pub(crate) mod strings;

use std::rc::Rc;

use crate::{
    ast::Context,
    bytecode::{
        code::Code,
        op::{NONE_REG, Opcode, word_to_ctx},
    },
    error::{LoopKind, LoopSignal, RunError, RunResult},
    heap::{Cell, HeapId},
    interp::{Interp, LocalEntry},
    resource::ResourceTracker,
    tracer::VmTracer,
    value::{RcStr, Value},
};

/// An active loop, targetable by `last`/`next`/`redo`.
#[derive(Debug)]
pub(crate) struct LoopFrame {
    pub label: Option<RcStr>,
    pub last_addr: u16,
    pub next_addr: u16,
    pub redo_addr: u16,
    pub handlers_len: usize,
    pub stack_len: usize,
    pub marks_len: usize,
}

/// A die boundary from `EVAL_TRY`.
#[derive(Debug)]
pub(crate) struct Handler {
    pub catch_addr: u16,
    pub locals_depth: usize,
    pub loops_len: usize,
    pub stack_len: usize,
    pub marks_len: usize,
}

/// In-flight list assignment.
#[derive(Debug)]
pub(crate) struct AssignState {
    pub src: Vec<Value>,
    pub pos: usize,
}

#[derive(Debug)]
pub(crate) struct Frame {
    pub code: Rc<Code>,
    pub regs: Vec<Value>,
    pub pad: Vec<HeapId>,
    pub args_cell: HeapId,
    /// Scratch stack for list building.
    pub stack: Vec<Value>,
    pub marks: Vec<usize>,
    pub ctx: Context,
    pub loops: Vec<LoopFrame>,
    pub handlers: Vec<Handler>,
    pub assigns: Vec<AssignState>,
    pub warn_mask: u64,
    pub cur_line: u32,
}

impl Frame {
    #[inline]
    pub(crate) fn reg(&self, r: u16) -> &Value {
        &self.regs[r as usize]
    }

    #[inline]
    pub(crate) fn take(&self, r: u16) -> Value {
        self.regs[r as usize].clone()
    }

    /// Operand read in scalar shape.
    #[inline]
    pub(crate) fn scalar(&self, r: u16) -> Value {
        self.regs[r as usize].clone().scalarize()
    }

    #[inline]
    pub(crate) fn set(&mut self, r: u16, v: Value) {
        self.regs[r as usize] = v;
    }

    /// Flattens a register into a value list.
    pub(crate) fn list(&self, r: u16) -> Vec<Value> {
        let mut out = Vec::new();
        self.regs[r as usize].flatten_into(&mut out);
        out
    }

    /// Source position of the instruction at `pc`.
    pub(crate) fn position(&self, pc: usize) -> (RcStr, u32) {
        let (file, line) = self.code.position_at(pc);
        let line = if line == 0 { self.cur_line } else { line };
        (file, line)
    }

    /// The cell a Ref-valued register names; dies otherwise.
    pub(crate) fn ref_cell(&self, r: u16) -> RunResult<HeapId> {
        match self.reg(r) {
            Value::Ref { id, .. } => Ok(*id),
            other => Err(RunError::Die(Value::str(format!(
                "Can't use {} as a reference",
                kind_word(other)
            )))),
        }
    }
}

fn kind_word(v: &Value) -> &'static str {
    match v {
        Value::Undef => "an undefined value",
        Value::Str(_) | Value::Bytes(_) => "string",
        Value::Int(_) | Value::Num(_) => "number",
        _ => "value",
    }
}

/// Executes a code object in a fresh frame. `captures` bind the capture
/// block of the pad; `args` become `@_`.
pub(crate) fn run_code<T: ResourceTracker, Tr: VmTracer>(
    interp: &mut Interp<T>,
    tracer: &mut Tr,
    code: &Rc<Code>,
    captures: &[HeapId],
    args: Vec<Value>,
    ctx: Context,
) -> RunResult<Value> {
    interp.heap.tracker.check_recursion_depth(interp.depth)?;
    interp.depth += 1;
    tracer.on_frame_push(&code.name, interp.depth);
    let locals_base = interp.locals_depth();

    let result = run_frame(interp, tracer, code, captures, args, ctx);

    interp.unwind_locals(locals_base);
    interp.depth -= 1;
    tracer.on_frame_pop(interp.depth);
    result
}

fn run_frame<T: ResourceTracker, Tr: VmTracer>(
    interp: &mut Interp<T>,
    tracer: &mut Tr,
    code: &Rc<Code>,
    captures: &[HeapId],
    args: Vec<Value>,
    ctx: Context,
) -> RunResult<Value> {
    let mut pad = Vec::with_capacity(code.pad_size as usize);
    pad.extend_from_slice(captures);
    while pad.len() < code.pad_size as usize {
        pad.push(interp.heap.new_scalar(Value::Undef)?);
    }
    let args_cell = interp.heap.new_array_from(args)?;
    let ctx = if ctx == Context::Runtime { Context::List } else { ctx };

    let mut frame = Frame {
        code: Rc::clone(code),
        regs: vec![Value::Undef; code.num_regs as usize],
        pad,
        args_cell,
        stack: Vec::new(),
        marks: Vec::new(),
        ctx,
        loops: Vec::new(),
        handlers: Vec::new(),
        assigns: Vec::new(),
        warn_mask: 0,
        cur_line: 0,
    };

    let mut pc = 0usize;
    loop {
        let word = frame.code.words[pc];
        let Some(op) = Opcode::from_repr(word) else {
            return Err(RunError::Die(Value::str(format!("Unknown opcode {word} at {pc}"))));
        };
        tracer.on_instruction(pc, op);

        let step: RunResult<Flow> = match word {
            0..=99 => control(op, &mut frame, pc + 1, interp, tracer),
            100..=199 => moves(op, &mut frame, pc + 1, interp, tracer).map(Flow::Pc),
            300..=349 => compare::numeric(op, &mut frame, pc + 1, interp, tracer).map(Flow::Pc),
            350..=399 => compare::string(op, &mut frame, pc + 1, interp, tracer).map(Flow::Pc),
            400..=499 => arith::handle(op, &mut frame, pc + 1, interp, tracer).map(Flow::Pc),
            500..=599 => arith::compound(op, &mut frame, pc + 1, interp, tracer).map(Flow::Pc),
            600..=699 => strings::handle(op, &mut frame, pc + 1, interp, tracer).map(Flow::Pc),
            700..=899 => collections::handle(op, &mut frame, pc + 1, interp, tracer).map(Flow::Pc),
            _ => ioops::handle(op, &mut frame, pc + 1, interp, tracer).map(Flow::Pc),
        };

        match step {
            Ok(Flow::Pc(next)) => pc = next,
            Ok(Flow::Done(value)) => {
                return Ok(shape_return(value, frame.ctx));
            }
            Err(RunError::Return(value)) => {
                return Ok(shape_return(value, frame.ctx));
            }
            Err(RunError::Die(payload)) => {
                let payload = locate_die(payload, &frame, pc, interp);
                match frame.handlers.pop() {
                    Some(handler) => {
                        tracer.on_die(&payload.stringify(&interp.heap));
                        interp.unwind_locals(handler.locals_depth);
                        frame.loops.truncate(handler.loops_len);
                        frame.stack.truncate(handler.stack_len);
                        frame.marks.truncate(handler.marks_len);
                        interp.set_special("main::@", payload);
                        pc = handler.catch_addr as usize;
                    }
                    None => return Err(RunError::Die(payload)),
                }
            }
            Err(RunError::Loop(sig)) => match resolve_loop(&mut frame, &sig) {
                Some(next) => pc = next,
                None => return Err(RunError::Loop(sig)),
            },
            Err(other) => return Err(other),
        }
    }
}

enum Flow {
    Pc(usize),
    Done(Value),
}

fn shape_return(value: Value, ctx: Context) -> Value {
    match ctx {
        Context::Scalar => value.scalarize(),
        Context::Void => Value::Undef,
        _ => value,
    }
}

/// Appends the ` at FILE line N.` suffix to a string die payload that lacks
/// a trailing newline; idempotent on propagation.
fn locate_die<T: ResourceTracker>(payload: Value, frame: &Frame, pc: usize, interp: &Interp<T>) -> Value {
    match &payload {
        Value::Str(s) if !s.ends_with('\n') => {
            let (file, line) = frame.position(pc);
            let _ = interp;
            Value::str(format!("{s} at {file} line {line}.\n"))
        }
        _ => payload,
    }
}

/// Resolves a loop-control signal against the frame's loop stack.
fn resolve_loop(frame: &mut Frame, sig: &LoopSignal) -> Option<usize> {
    let idx = match &sig.label {
        None => frame.loops.len().checked_sub(1)?,
        Some(label) => frame.loops.iter().rposition(|l| l.label.as_deref() == Some(&**label))?,
    };
    let target = &frame.loops[idx];
    let (addr, keep) = match sig.kind {
        LoopKind::Last => (target.last_addr, idx),
        LoopKind::Next => (target.next_addr, idx + 1),
        LoopKind::Redo => (target.redo_addr, idx + 1),
    };
    let handlers_len = target.handlers_len;
    let stack_len = target.stack_len;
    let marks_len = target.marks_len;
    frame.handlers.truncate(handlers_len);
    frame.stack.truncate(stack_len);
    frame.marks.truncate(marks_len);
    frame.loops.truncate(keep);
    Some(addr as usize)
}

// ---- control range (0..=99) ----

fn control<T: ResourceTracker, Tr: VmTracer>(
    op: Opcode,
    frame: &mut Frame,
    pc: usize,
    interp: &mut Interp<T>,
    tracer: &mut Tr,
) -> RunResult<Flow> {
    let code = Rc::clone(&frame.code);
    let w = |k: usize| code.words[pc + k];
    match op {
        Opcode::Nop => Ok(Flow::Pc(pc)),
        Opcode::Return => Ok(Flow::Done(frame.take(w(0)))),
        Opcode::ReturnUndef => Ok(Flow::Done(Value::Undef)),
        Opcode::Goto => Ok(Flow::Pc(w(0) as usize)),
        Opcode::GotoIfFalse => {
            let cond = frame.scalar(w(0));
            if cond.truthy() { Ok(Flow::Pc(pc + 2)) } else { Ok(Flow::Pc(w(1) as usize)) }
        }
        Opcode::GotoIfTrue => {
            let cond = frame.scalar(w(0));
            if cond.truthy() { Ok(Flow::Pc(w(1) as usize)) } else { Ok(Flow::Pc(pc + 2)) }
        }
        Opcode::CallSub => {
            let (dst, code_r, args_r) = (w(0), w(1), w(2));
            let ctx = resolve_ctx(word_to_ctx(w(3)), frame);
            let callee = frame.take(code_r);
            let args = frame.list(args_r);
            let value = call::call_value(interp, tracer, frame, pc, &callee, args, ctx)?;
            frame.set(dst, value);
            Ok(Flow::Pc(pc + 4))
        }
        Opcode::CallMethod => {
            let (dst, inv_r, name_r, args_r) = (w(0), w(1), w(2), w(3));
            let ctx = resolve_ctx(word_to_ctx(w(4)), frame);
            let invocant = frame.scalar(inv_r);
            let name = frame.scalar(name_r);
            let args = frame.list(args_r);
            let value = call::method_call(interp, tracer, frame, pc, invocant, &name, args, ctx, None)?;
            frame.set(dst, value);
            Ok(Flow::Pc(pc + 5))
        }
        Opcode::CallSuper => {
            let (dst, inv_r, name_idx, args_r) = (w(0), w(1), w(2), w(3));
            let ctx = resolve_ctx(word_to_ctx(w(4)), frame);
            let invocant = frame.scalar(inv_r);
            let name = Value::Str(Rc::clone(&code.strings[name_idx as usize]));
            let args = frame.list(args_r);
            let super_pkg = Rc::clone(&code.package);
            let value = call::method_call(interp, tracer, frame, pc, invocant, &name, args, ctx, Some(super_pkg))?;
            frame.set(dst, value);
            Ok(Flow::Pc(pc + 5))
        }
        Opcode::EvalBlock => Ok(Flow::Pc(pc)),
        Opcode::EvalString => {
            let (dst, src_r, snap_idx) = (w(0), w(1), w(2));
            let ctx = resolve_ctx(word_to_ctx(w(3)), frame);
            let source = frame.scalar(src_r).stringify(&interp.heap);
            let value = call::eval_string(interp, tracer, frame, &source, snap_idx, ctx)?;
            frame.set(dst, value);
            Ok(Flow::Pc(pc + 4))
        }
        Opcode::LoopEnter => {
            let label_idx = w(0);
            let label = if label_idx == NONE_REG {
                None
            } else {
                Some(Rc::clone(&code.strings[label_idx as usize]))
            };
            frame.loops.push(LoopFrame {
                label,
                last_addr: w(1),
                next_addr: w(2),
                redo_addr: w(3),
                handlers_len: frame.handlers.len(),
                stack_len: frame.stack.len(),
                marks_len: frame.marks.len(),
            });
            Ok(Flow::Pc(pc + 4))
        }
        Opcode::LoopExit => {
            frame.loops.pop();
            Ok(Flow::Pc(pc))
        }
        Opcode::LoopCtl => {
            let kind = match w(0) {
                0 => LoopKind::Last,
                1 => LoopKind::Next,
                _ => LoopKind::Redo,
            };
            let label_idx = w(1);
            let label = if label_idx == NONE_REG {
                None
            } else {
                Some(Rc::clone(&code.strings[label_idx as usize]))
            };
            let sig = LoopSignal { kind, label };
            match resolve_loop(frame, &sig) {
                Some(next) => Ok(Flow::Pc(next)),
                None => Err(RunError::Loop(sig)),
            }
        }
        Opcode::Wantarray => {
            let dst = w(0);
            let v = match frame.ctx {
                Context::List | Context::Runtime => Value::Int(1),
                Context::Scalar => Value::str(""),
                Context::Void => Value::Undef,
            };
            frame.set(dst, v);
            Ok(Flow::Pc(pc + 1))
        }
        Opcode::Die => {
            let args = frame.list(w(0));
            Err(call::do_die(interp, tracer, frame, pc, args))
        }
        Opcode::Warn => {
            let args = frame.list(w(0));
            call::do_warn(interp, tracer, frame, pc, args)?;
            Ok(Flow::Pc(pc + 1))
        }
        Opcode::Caller => {
            let (dst, level_r) = (w(0), w(1));
            let ctx = word_to_ctx(w(2));
            let level = if level_r == NONE_REG {
                0
            } else {
                frame.scalar(level_r).numify().0.as_f64() as usize
            };
            let value = call::caller_info(interp, level, ctx);
            frame.set(dst, value);
            Ok(Flow::Pc(pc + 3))
        }
        Opcode::Tick => {
            frame.cur_line = u32::from(w(0));
            interp.heap.tracker.check_time()?;
            Ok(Flow::Pc(pc + 1))
        }
        Opcode::SetWarnMask => {
            frame.warn_mask = u64::from(w(0))
                | (u64::from(w(1)) << 16)
                | (u64::from(w(2)) << 32)
                | (u64::from(w(3)) << 48);
            Ok(Flow::Pc(pc + 4))
        }
        Opcode::Exit => {
            let status = if w(0) == NONE_REG {
                0
            } else {
                frame.scalar(w(0)).numify().0.as_f64() as i32
            };
            Err(RunError::Exit(status))
        }
        Opcode::LocalScopeEnter => {
            interp.locals.push(LocalEntry::ScopeMark);
            Ok(Flow::Pc(pc))
        }
        Opcode::LocalScopeExit => {
            interp.pop_local_scope();
            Ok(Flow::Pc(pc))
        }
        Opcode::LocalSave => {
            let cell = frame.ref_cell(w(0))?;
            let entry = match interp.heap.get(cell) {
                Cell::Array(a) => LocalEntry::Array { cell, saved: a.elems.iter().copied().collect() },
                Cell::Hash(h) => LocalEntry::Hash {
                    cell,
                    saved: h.map.iter().map(|(k, v)| (Rc::clone(k), *v)).collect(),
                },
                _ => LocalEntry::Scalar { cell, saved: interp.heap.scalar_value(cell) },
            };
            match &entry {
                LocalEntry::Array { cell, .. } => interp.heap.array_mut(*cell).elems.clear(),
                LocalEntry::Hash { cell, .. } => {
                    let h = interp.heap.hash_mut(*cell);
                    h.map.clear();
                    h.iter_pos = 0;
                }
                _ => {
                    let _ = interp.heap.scalar_set(cell, Value::Undef);
                }
            }
            interp.locals.push(entry);
            Ok(Flow::Pc(pc + 1))
        }
        Opcode::LocalSaveGlobSlot => {
            let name = &code.strings[w(0) as usize];
            let (pkg, short) = crate::stash::Stashes::split_name(name, "main");
            let glob = interp.stashes.glob_id(&mut interp.heap, &pkg, short)?;
            let saved = interp.heap.glob(glob).scalar;
            interp.locals.push(LocalEntry::GlobScalarSlot { glob, saved });
            Ok(Flow::Pc(pc + 1))
        }
        Opcode::RegisterEnd => {
            let cell = frame.ref_cell(w(0))?;
            if let Cell::Code(c) = interp.heap.get(cell) {
                let code = Rc::clone(&c.code);
                interp_register_end(interp, code);
            }
            Ok(Flow::Pc(pc + 1))
        }
        Opcode::EvalTry => {
            frame.handlers.push(Handler {
                catch_addr: w(0),
                locals_depth: interp.locals_depth(),
                loops_len: frame.loops.len(),
                stack_len: frame.stack.len(),
                marks_len: frame.marks.len(),
            });
            Ok(Flow::Pc(pc + 1))
        }
        Opcode::EvalEnd => {
            frame.handlers.pop();
            interp.set_special("main::@", Value::str(""));
            Ok(Flow::Pc(pc))
        }
        _ => Err(RunError::Die(Value::str(format!("Unhandled control opcode {op:?}")))),
    }
}

fn interp_register_end<T: ResourceTracker>(interp: &mut Interp<T>, code: Rc<Code>) {
    interp.push_end_block(code);
}

/// Resolves a static `Runtime` context against the running frame.
pub(crate) fn resolve_ctx(ctx: Context, frame: &Frame) -> Context {
    if ctx == Context::Runtime { frame.ctx } else { ctx }
}

// ---- moves range (100..=199) ----

fn moves<T: ResourceTracker, Tr: VmTracer>(
    op: Opcode,
    frame: &mut Frame,
    pc: usize,
    interp: &mut Interp<T>,
    tracer: &mut Tr,
) -> RunResult<usize> {
    let code = Rc::clone(&frame.code);
    let w = |k: usize| code.words[pc + k];
    match op {
        Opcode::LoadUndef => {
            frame.set(w(0), Value::Undef);
            Ok(pc + 1)
        }
        Opcode::LoadInt => {
            frame.set(w(0), Value::Int(code.ints[w(1) as usize]));
            Ok(pc + 2)
        }
        Opcode::LoadNum => {
            frame.set(w(0), Value::Num(code.nums[w(1) as usize]));
            Ok(pc + 2)
        }
        Opcode::LoadStr => {
            frame.set(w(0), Value::Str(Rc::clone(&code.strings[w(1) as usize])));
            Ok(pc + 2)
        }
        Opcode::Move => {
            let v = frame.take(w(1));
            frame.set(w(0), v);
            Ok(pc + 2)
        }
        Opcode::LoadLocal => {
            let cell = frame.pad[w(1) as usize];
            let v = call::scalar_fetch(interp, tracer, cell)?;
            frame.set(w(0), v);
            Ok(pc + 2)
        }
        Opcode::StoreLocal => {
            let cell = frame.pad[w(0) as usize];
            let v = frame.scalar(w(1));
            call::scalar_store(interp, tracer, cell, v)?;
            Ok(pc + 2)
        }
        Opcode::LocalRef => {
            let cell = frame.pad[w(1) as usize];
            frame.set(w(0), Value::Ref { id: cell, weak: false });
            Ok(pc + 2)
        }
        Opcode::MyNew => {
            let (slot, kind) = (w(0), w(1));
            let cell = match kind {
                1 => interp.heap.new_array()?,
                2 => interp.heap.new_hash()?,
                _ => interp.heap.new_scalar(Value::Undef)?,
            };
            frame.pad[slot as usize] = cell;
            Ok(pc + 2)
        }
        Opcode::MyPersist => {
            let (slot, pid_idx, kind, dst) = (w(0), w(1), w(2), w(3));
            let id = u32::try_from(code.ints[pid_idx as usize]).unwrap_or(0);
            let created = !interp.persistents.contains_key(&id);
            let cell = interp.persistent_cell(id, kind)?;
            if slot != NONE_REG {
                frame.pad[slot as usize] = cell;
                if dst != NONE_REG {
                    frame.set(dst, Value::Int(i64::from(created)));
                }
            } else if dst != NONE_REG {
                frame.set(dst, Value::Ref { id: cell, weak: false });
            }
            Ok(pc + 4)
        }
        Opcode::LoadGlobalScalar => {
            let name = Rc::clone(&code.strings[w(1) as usize]);
            // The last-successful-pattern linkage reads live match state.
            if &*name == "main::^LAST_SUCCESSFUL_PATTERN" {
                let v = interp.last_pattern.as_ref().map_or(Value::Undef, |re| Value::Regex(Rc::clone(re)));
                frame.set(w(0), v);
                return Ok(pc + 2);
            }
            let cell = interp.global_scalar_cell(&name)?;
            let v = call::scalar_fetch(interp, tracer, cell)?;
            frame.set(w(0), v);
            Ok(pc + 2)
        }
        Opcode::StoreGlobalScalar => {
            let name = Rc::clone(&code.strings[w(0) as usize]);
            let cell = interp.global_scalar_cell(&name)?;
            let v = frame.scalar(w(1));
            call::scalar_store(interp, tracer, cell, v)?;
            Ok(pc + 2)
        }
        Opcode::GlobalScalarRef => {
            let name = Rc::clone(&code.strings[w(1) as usize]);
            let cell = interp.global_scalar_cell(&name)?;
            frame.set(w(0), Value::Ref { id: cell, weak: false });
            Ok(pc + 2)
        }
        Opcode::GlobalArrayRef => {
            let name = Rc::clone(&code.strings[w(1) as usize]);
            let cell = interp.global_array_cell(&name)?;
            frame.set(w(0), Value::Ref { id: cell, weak: false });
            Ok(pc + 2)
        }
        Opcode::GlobalHashRef => {
            let name = Rc::clone(&code.strings[w(1) as usize]);
            let cell = interp.global_hash_cell(&name)?;
            frame.set(w(0), Value::Ref { id: cell, weak: false });
            Ok(pc + 2)
        }
        Opcode::GlobalCode => {
            let name = Rc::clone(&code.strings[w(1) as usize]);
            let (pkg, short) = crate::stash::Stashes::split_name(&name, "main");
            match interp.stashes.code_slot(&interp.heap, &pkg, short) {
                Some(cell) => frame.set(w(0), Value::Ref { id: cell, weak: false }),
                None => {
                    // Leave the name for the call site's diagnostics.
                    frame.set(w(0), Value::str(format!("\0undef_sub\0{name}")));
                }
            }
            Ok(pc + 2)
        }
        Opcode::GlobRef => {
            let name = Rc::clone(&code.strings[w(1) as usize]);
            let (pkg, short) = crate::stash::Stashes::split_name(&name, "main");
            let glob = interp.stashes.glob_id(&mut interp.heap, &pkg, short)?;
            frame.set(w(0), Value::Glob(glob));
            Ok(pc + 2)
        }
        Opcode::GlobAssign => {
            let name = Rc::clone(&code.strings[w(0) as usize]);
            let (pkg, short) = crate::stash::Stashes::split_name(&name, "main");
            let glob = interp.stashes.glob_id(&mut interp.heap, &pkg, short)?;
            let v = frame.scalar(w(1));
            match &v {
                Value::Ref { id, .. } => match interp.heap.get(*id) {
                    Cell::Code(_) => interp.heap.glob_mut(glob).code = Some(*id),
                    Cell::Array(_) => interp.heap.glob_mut(glob).array = Some(*id),
                    Cell::Hash(_) => interp.heap.glob_mut(glob).hash = Some(*id),
                    _ => interp.heap.glob_mut(glob).scalar = Some(*id),
                },
                Value::Glob(other) => {
                    let src = interp.heap.glob(*other);
                    let (s, a, h, c, io) = (src.scalar, src.array, src.hash, src.code, src.io);
                    let dst = interp.heap.glob_mut(glob);
                    dst.scalar = s;
                    dst.array = a;
                    dst.hash = h;
                    dst.code = c;
                    dst.io = io;
                }
                other => {
                    return Err(RunError::Die(Value::str(format!(
                        "Can't assign {} to a glob",
                        kind_word(other)
                    ))));
                }
            }
            Ok(pc + 2)
        }
        Opcode::CaptureSub => {
            let (dst, sub_idx) = (w(0), w(1));
            let sub_code = Rc::clone(&code.subs[sub_idx as usize]);
            let cell = call::capture_closure(interp, frame, &sub_code)?;
            frame.set(dst, Value::Ref { id: cell, weak: false });
            Ok(pc + 2)
        }
        Opcode::DerefScalarLoad => {
            let v = frame.scalar(w(1));
            let cell = interp.heap.deref_expect(&v, crate::heap::VivifyKind::Scalar)?;
            let value = call::scalar_fetch(interp, tracer, cell)?;
            frame.set(w(0), value);
            Ok(pc + 2)
        }
        Opcode::DerefCell => {
            let (dst, src, kind) = (w(0), w(1), w(2));
            let v = frame.take(src);
            // A code-ref dereference passes through unchecked (kind 3).
            if kind == 3 {
                frame.set(dst, v.scalarize());
                return Ok(pc + 3);
            }
            // A transient list subscripted as an array (`(LIST)[i]`, `$-[0]`)
            // materializes into a temporary.
            if kind == 1
                && let Value::List(items) = &v
            {
                let cell = interp.heap.new_array_from(items.to_vec())?;
                frame.set(dst, Value::Ref { id: cell, weak: false });
                return Ok(pc + 3);
            }
            let v = v.scalarize();
            let want = match kind {
                1 => crate::heap::VivifyKind::Array,
                2 => crate::heap::VivifyKind::Hash,
                _ => crate::heap::VivifyKind::Scalar,
            };
            let cell = interp.heap.deref_expect(&v, want)?;
            frame.set(dst, Value::Ref { id: cell, weak: false });
            Ok(pc + 3)
        }
        Opcode::DerefVivify => {
            let (dst, holder_r, kind) = (w(0), w(1), w(2));
            let holder = frame.ref_cell(holder_r)?;
            let want = match kind {
                1 => crate::heap::VivifyKind::Array,
                2 => crate::heap::VivifyKind::Hash,
                _ => crate::heap::VivifyKind::Scalar,
            };
            let cell = interp.heap.deref_or_vivify(holder, want)?;
            frame.set(dst, Value::Ref { id: cell, weak: false });
            Ok(pc + 3)
        }
        Opcode::MakeRef => {
            let v = frame.scalar(w(1));
            let cell = interp.heap.new_scalar(v)?;
            frame.set(w(0), Value::Ref { id: cell, weak: false });
            Ok(pc + 2)
        }
        Opcode::StoreThroughRef => {
            let cell = frame.ref_cell(w(0))?;
            let v = frame.scalar(w(1));
            call::scalar_store(interp, tracer, cell, v)?;
            Ok(pc + 2)
        }
        Opcode::LoadThroughRef => {
            let cell = frame.ref_cell(w(1))?;
            let v = call::scalar_fetch(interp, tracer, cell)?;
            frame.set(w(0), v);
            Ok(pc + 2)
        }
        Opcode::LoadArgCell => {
            let (dst, idx) = (w(0), w(1));
            let args = frame.args_cell;
            match interp.heap.array_get(args, i64::from(idx)) {
                Some(cell) => frame.set(dst, Value::Ref { id: cell, weak: false }),
                None => frame.set(dst, Value::Undef),
            }
            Ok(pc + 2)
        }
        Opcode::LoadArgs => {
            frame.set(w(0), Value::Ref { id: frame.args_cell, weak: false });
            Ok(pc + 1)
        }
        Opcode::AliasSlot => {
            let (slot, src) = (w(0), w(1));
            let cell = frame.ref_cell(src)?;
            frame.pad[slot as usize] = cell;
            Ok(pc + 2)
        }
        Opcode::InstallSub => {
            let name = Rc::clone(&code.strings[w(0) as usize]);
            let cell = frame.ref_cell(w(1))?;
            let (pkg, short) = crate::stash::Stashes::split_name(&name, "main");
            interp.stashes.install_sub(&mut interp.heap, &pkg, short, cell)?;
            Ok(pc + 2)
        }
        _ => Err(RunError::Die(Value::str(format!("Unhandled move opcode {op:?}")))),
    }
}
