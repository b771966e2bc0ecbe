//! AST → register bytecode.
//!
//! One [`Compiler`] instance emits one body; nested subs (anonymous subs,
//! sort/map/grep bodies, substitution replacements, refactored chunks)
//! recurse into fresh instances and land in the parent's sub pool. Context
//! is propagated statically: every value-producing node is compiled in the
//! caller's [`Context`], `Runtime` rides along as a trailing operand on the
//! ops that must ask the frame, and logical operators force scalar context
//! on their conditions regardless of the surrounding context.
//!
//! Frame pads are laid out captures-first; `Lexical` slots address past the
//! capture block, except in `inherits_pad` closures from the refactorer,
//! where slot numbers address capture positions directly.

use std::rc::Rc;

use smallvec::SmallVec;

use crate::{
    ast::{
        BinOp, Block, Builtin, Callee, Context, DeclSlot, Expr, ExprKind, ForeachVar, InterpPart, LogOp,
        MethodName, RegexLit, Sigil, Stmt, StmtKind, SubDef, UnOp,
    },
    error::{Diagnostic, LoopKind, ParseError, Severity},
    refactor::{RefactorOptions, refactor_sub},
    regex::CompiledRegex,
    tr,
    value::RcStr,
    warnings::WarningCategory,
};

use super::{
    builder::{CodeBuilder, JumpSlot},
    code::Code,
    op::{NONE_REG, Opcode, ctx_to_word},
};

type CResult<T> = Result<T, ParseError>;

/// The output of compiling one top-level body.
pub(crate) struct CompiledUnit {
    pub code: Rc<Code>,
    /// Named subs without captures, installable at compile time: fully
    /// qualified name, body, and the recorded prototype.
    pub installs: Vec<(RcStr, Rc<Code>, Option<RcStr>)>,
    pub warnings: Vec<Diagnostic>,
}

pub(crate) fn compile_unit(
    sub: &SubDef,
    file: &str,
    refactor: RefactorOptions,
    warn_mask: u64,
) -> CResult<CompiledUnit> {
    let mut installs = Vec::new();
    let mut warnings = Vec::new();
    let code = compile_sub(sub, file, refactor, warn_mask, &mut installs, &mut warnings)?;
    Ok(CompiledUnit { code, installs, warnings })
}

fn compile_sub(
    sub: &SubDef,
    file: &str,
    refactor: RefactorOptions,
    warn_mask: u64,
    installs: &mut Vec<(RcStr, Rc<Code>, Option<RcStr>)>,
    warnings: &mut Vec<Diagnostic>,
) -> CResult<Rc<Code>> {
    // Every body gets the large-block pass; already-small bodies (and the
    // refactorer's own chunks) come back untouched.
    let refactored;
    let sub = if refactor.enabled {
        let mut owned = sub.clone();
        refactor_sub(&mut owned, refactor);
        refactored = owned;
        &refactored
    } else {
        sub
    };
    let mut c = Compiler {
        b: CodeBuilder::new(file),
        sub,
        file,
        cap_len: u16::try_from(sub.captures.len()).unwrap_or(u16::MAX),
        next_reg: 0,
        installs,
        warnings,
        eval_blocks: Vec::new(),
        refactor,
        warn_mask,
    };
    c.b.set_position(file, sub.line);
    c.compile_body()?;

    let pad_size = if sub.inherits_pad {
        c.cap_len
    } else {
        c.cap_len + u16::try_from(sub.pad.len()).unwrap_or(u16::MAX)
    };
    let name: RcStr = match &sub.name {
        Some(n) => Rc::from(format!("{}::{n}", sub.package).as_str()),
        None => Rc::from("__ANON__"),
    };
    let pad_offset = c.pad_offset();
    let code = c
        .b
        .build_with_pad_offset(pad_size, sub.captures.clone(), name, Rc::clone(&sub.package), pad_offset)
        .map_err(|e| {
            ParseError::new(
                format!(
                    "Method too large: emitted {} words exceeds the 64KiB body limit (set JPERL_LARGECODE=refactor)",
                    e.words
                ),
                file.to_string(),
                sub.line,
            )
        })?;
    Ok(Rc::new(code))
}

struct EvalBlockCtx {
    dst: u16,
    end_jumps: Vec<JumpSlot>,
}

struct Compiler<'a> {
    b: CodeBuilder,
    sub: &'a SubDef,
    file: &'a str,
    cap_len: u16,
    next_reg: u16,
    installs: &'a mut Vec<(RcStr, Rc<Code>, Option<RcStr>)>,
    warnings: &'a mut Vec<Diagnostic>,
    eval_blocks: Vec<EvalBlockCtx>,
    refactor: RefactorOptions,
    warn_mask: u64,
}

impl Compiler<'_> {
    // ---- registers and pads ----

    fn alloc(&mut self) -> u16 {
        let r = self.next_reg;
        self.next_reg += 1;
        self.b.note_reg(r);
        r
    }

    fn mark(&self) -> u16 {
        self.next_reg
    }

    fn release(&mut self, mark: u16) {
        self.next_reg = mark;
    }

    /// Offset of the lexical block in this frame's pad.
    fn pad_offset(&self) -> u16 {
        if self.sub.inherits_pad { self.sub.parent_cap_len } else { self.cap_len }
    }

    fn pad_index(&self, slot: u16) -> u16 {
        self.pad_offset() + slot
    }

    fn error(&self, line: u32, message: impl Into<String>) -> ParseError {
        ParseError::new(message, self.file.to_string(), line)
    }

    fn warn(&mut self, line: u32, category: WarningCategory, message: impl Into<String>) {
        if self.warn_mask & category.bit() != 0 {
            self.warnings.push(Diagnostic {
                severity: Severity::Warning,
                message: message.into(),
                file: self.file.to_string(),
                line,
            });
        }
    }

    fn set_warn_mask_ops(&mut self) {
        let m = self.warn_mask;
        self.b.emit(
            Opcode::SetWarnMask,
            &[
                (m & 0xFFFF) as u16,
                ((m >> 16) & 0xFFFF) as u16,
                ((m >> 32) & 0xFFFF) as u16,
                ((m >> 48) & 0xFFFF) as u16,
            ],
        );
    }

    // ---- bodies and statements ----

    fn compile_body(&mut self) -> CResult<()> {
        self.set_warn_mask_ops();
        // Captureless named subs install at compile time, wherever they sit.
        let body = self.sub.body.clone();
        self.hoist_named_subs(&body)?;
        let stmts = &self.sub.body.stmts;
        if stmts.is_empty() {
            self.b.emit(Opcode::ReturnUndef, &[]);
            return Ok(());
        }
        for stmt in &stmts[..stmts.len() - 1] {
            self.stmt(stmt)?;
        }
        let last = &stmts[stmts.len() - 1];
        // The last expression statement is the implicit return value.
        if let StmtKind::Expr(e) = &last.kind {
            self.position(last.line);
            self.b.emit(Opcode::Tick, &[clamp_line(last.line)]);
            let m = self.mark();
            let r = self.expr(e, Context::Runtime)?;
            self.b.emit(Opcode::Return, &[r]);
            self.release(m);
        } else {
            self.stmt(last)?;
            self.b.emit(Opcode::ReturnUndef, &[]);
        }
        Ok(())
    }

    fn hoist_named_subs(&mut self, block: &Block) -> CResult<()> {
        for stmt in &block.stmts {
            match &stmt.kind {
                StmtKind::SubDecl(sub) if sub.captures.is_empty() => {
                    let code =
                        compile_sub(sub, self.file, self.refactor, self.warn_mask, self.installs, self.warnings)?;
                    let short = sub.name.clone().unwrap_or_else(|| Rc::from("__ANON__"));
                    let fq = if short.contains("::") {
                        short
                    } else {
                        Rc::from(format!("{}::{short}", sub.package).as_str())
                    };
                    self.installs.push((fq, code, sub.prototype.clone()));
                }
                StmtKind::If { then, elsifs, else_, .. } => {
                    self.hoist_named_subs(then)?;
                    for (_, b) in elsifs {
                        self.hoist_named_subs(b)?;
                    }
                    if let Some(b) = else_ {
                        self.hoist_named_subs(b)?;
                    }
                }
                StmtKind::While { body, cont, .. } => {
                    self.hoist_named_subs(body)?;
                    if let Some(c) = cont {
                        self.hoist_named_subs(c)?;
                    }
                }
                StmtKind::DoWhile { body, .. }
                | StmtKind::BareBlock { body, .. }
                | StmtKind::ForC { body, .. }
                | StmtKind::Foreach { body, .. } => self.hoist_named_subs(body)?,
                StmtKind::TryCatch { body, catch, finally, .. } => {
                    self.hoist_named_subs(body)?;
                    self.hoist_named_subs(catch)?;
                    if let Some(f) = finally {
                        self.hoist_named_subs(f)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn position(&mut self, line: u32) {
        self.b.set_position(self.file, line);
    }

    fn block(&mut self, block: &Block) -> CResult<()> {
        let has_local = block_has_local(block);
        if has_local {
            self.b.emit(Opcode::LocalScopeEnter, &[]);
        }
        for stmt in &block.stmts {
            self.stmt(stmt)?;
        }
        if has_local {
            self.b.emit(Opcode::LocalScopeExit, &[]);
        }
        Ok(())
    }

    /// A block in value position: the last expression statement's value.
    fn block_value(&mut self, block: &Block, ctx: Context) -> CResult<u16> {
        let dst = self.alloc();
        self.b.emit(Opcode::LoadUndef, &[dst]);
        let has_local = block_has_local(block);
        if has_local {
            self.b.emit(Opcode::LocalScopeEnter, &[]);
        }
        if let Some((last, init)) = block.stmts.split_last() {
            for stmt in init {
                self.stmt(stmt)?;
            }
            if let StmtKind::Expr(e) = &last.kind {
                self.position(last.line);
                self.b.emit(Opcode::Tick, &[clamp_line(last.line)]);
                let m = self.mark();
                let r = self.expr(e, ctx)?;
                self.b.emit(Opcode::Move, &[dst, r]);
                self.release(m);
            } else {
                self.stmt(last)?;
            }
        }
        if has_local {
            self.b.emit(Opcode::LocalScopeExit, &[]);
        }
        Ok(dst)
    }

    fn stmt(&mut self, stmt: &Stmt) -> CResult<()> {
        self.position(stmt.line);
        self.b.emit(Opcode::Tick, &[clamp_line(stmt.line)]);
        let m = self.mark();
        match &stmt.kind {
            StmtKind::Empty => {}
            StmtKind::Expr(e) => {
                self.expr(e, Context::Void)?;
            }
            StmtKind::Return(value) => {
                // Inside an inline eval region, return exits the eval.
                if let Some(eval) = self.eval_blocks.last() {
                    let dst = eval.dst;
                    let r = match value {
                        Some(e) => self.expr(e, Context::Runtime)?,
                        None => {
                            let r = self.alloc();
                            self.b.emit(Opcode::LoadUndef, &[r]);
                            r
                        }
                    };
                    self.b.emit(Opcode::Move, &[dst, r]);
                    self.b.emit(Opcode::EvalEnd, &[]);
                    let jump = self.b.emit_jump(Opcode::Goto, &[]);
                    if let Some(eval) = self.eval_blocks.last_mut() {
                        eval.end_jumps.push(jump);
                    }
                } else {
                    match value {
                        Some(e) => {
                            let r = self.expr(e, Context::Runtime)?;
                            self.b.emit(Opcode::Return, &[r]);
                        }
                        None => self.b.emit(Opcode::ReturnUndef, &[]),
                    }
                }
            }
            StmtKind::LoopCtl { kind, label } => {
                let kind_word = match kind {
                    LoopKind::Last => 0,
                    LoopKind::Next => 1,
                    LoopKind::Redo => 2,
                };
                let label_idx = match label {
                    Some(l) => self.b.intern_str(l),
                    None => NONE_REG,
                };
                self.b.emit(Opcode::LoopCtl, &[kind_word, label_idx]);
            }
            StmtKind::If { cond, then, elsifs, else_ } => {
                let c = self.expr_scalar_cond(cond)?;
                let mut to_end: Vec<JumpSlot> = Vec::new();
                let mut next_branch = self.b.emit_jump(Opcode::GotoIfFalse, &[c]);
                self.release(m);
                self.block(then)?;
                for (cond, body) in elsifs {
                    to_end.push(self.b.emit_jump(Opcode::Goto, &[]));
                    self.b.patch_jump(next_branch);
                    let mk = self.mark();
                    let c = self.expr_scalar_cond(cond)?;
                    next_branch = self.b.emit_jump(Opcode::GotoIfFalse, &[c]);
                    self.release(mk);
                    self.block(body)?;
                }
                if let Some(body) = else_ {
                    to_end.push(self.b.emit_jump(Opcode::Goto, &[]));
                    self.b.patch_jump(next_branch);
                    self.block(body)?;
                } else {
                    self.b.patch_jump(next_branch);
                }
                for j in to_end {
                    self.b.patch_jump(j);
                }
            }
            StmtKind::While { label, cond, body, until, cont } => {
                self.compile_while(label.as_deref(), cond, body, *until, cont.as_ref())?;
            }
            StmtKind::DoWhile { body, cond, until } => {
                // Post-tested: the body is not a loop-control target in Perl,
                // but last/next still resolve against it via the loop entry.
                let label_idx = NONE_REG;
                let enter = self.emit_loop_enter(label_idx);
                let top = self.b.here();
                self.block(body)?;
                let next_target = self.b.here();
                let mk = self.mark();
                let c = self.expr_scalar_cond(cond)?;
                if *until {
                    self.b.emit(Opcode::GotoIfFalse, &[c, top]);
                } else {
                    self.b.emit(Opcode::GotoIfTrue, &[c, top]);
                }
                self.release(mk);
                self.finish_loop(enter, top, next_target);
            }
            StmtKind::ForC { label, init, cond, step, body } => {
                if let Some(init) = init {
                    let mk = self.mark();
                    self.expr(init, Context::Void)?;
                    self.release(mk);
                }
                let label_idx = label.as_deref().map_or(NONE_REG, |l| self.b.intern_str(l));
                let enter = self.emit_loop_enter(label_idx);
                let head = self.b.here();
                let exit = match cond {
                    Some(cond) => {
                        let mk = self.mark();
                        let c = self.expr_scalar_cond(cond)?;
                        let j = self.b.emit_jump(Opcode::GotoIfFalse, &[c]);
                        self.release(mk);
                        Some(j)
                    }
                    None => None,
                };
                let redo_target = self.b.here();
                self.block(body)?;
                let next_target = self.b.here();
                if let Some(step) = step {
                    let mk = self.mark();
                    self.expr(step, Context::Void)?;
                    self.release(mk);
                }
                self.b.emit(Opcode::Goto, &[head]);
                if let Some(j) = exit {
                    self.b.patch_jump(j);
                }
                self.finish_loop(enter, redo_target, next_target);
            }
            StmtKind::Foreach { label, var, list, body } => {
                self.compile_foreach(label.as_deref(), var, list, body)?;
            }
            StmtKind::BareBlock { label, body } => {
                // Runs once; a loop target for last/next/redo.
                let label_idx = label.as_deref().map_or(NONE_REG, |l| self.b.intern_str(l));
                let enter = self.emit_loop_enter(label_idx);
                let top = self.b.here();
                self.block(body)?;
                let next_target = self.b.here();
                self.finish_loop(enter, top, next_target);
            }
            StmtKind::SubDecl(sub) => {
                if !sub.captures.is_empty() {
                    // Closure over the frame: install when this line runs.
                    let code = compile_sub(sub, self.file, self.refactor, self.warn_mask, self.installs, self.warnings)?;
                    let idx = self.b.add_sub(code);
                    let r = self.alloc();
                    self.b.emit(Opcode::CaptureSub, &[r, idx]);
                    let short = sub.name.clone().unwrap_or_else(|| Rc::from("__ANON__"));
                    let fq = if short.contains("::") {
                        short
                    } else {
                        Rc::from(format!("{}::{short}", sub.package).as_str())
                    };
                    let name_idx = self.b.intern_str(&fq);
                    self.b.emit(Opcode::InstallSub, &[name_idx, r]);
                }
                // Captureless subs were hoisted.
            }
            StmtKind::TryCatch { body, catch_var, catch, finally } => {
                self.compile_try(body, *catch_var, catch, finally.as_ref())?;
            }
        }
        self.release(m);
        Ok(())
    }

    fn emit_loop_enter(&mut self, label_idx: u16) -> (JumpSlot, JumpSlot, JumpSlot) {
        // LOOP_ENTER label, last_addr, next_addr, redo_addr — all patched.
        self.b.emit(Opcode::LoopEnter, &[label_idx]);
        let last = self.b.emit_placeholder();
        let next = self.b.emit_placeholder();
        let redo = self.b.emit_placeholder();
        (last, next, redo)
    }

    fn finish_loop(&mut self, enter: (JumpSlot, JumpSlot, JumpSlot), redo_target: u16, next_target: u16) {
        self.b.emit(Opcode::LoopExit, &[]);
        let end = self.b.here();
        self.b.patch_jump_to(enter.0, end);
        self.b.patch_jump_to(enter.1, next_target);
        self.b.patch_jump_to(enter.2, redo_target);
    }

    fn compile_while(
        &mut self,
        label: Option<&str>,
        cond: &Expr,
        body: &Block,
        until: bool,
        cont: Option<&Block>,
    ) -> CResult<()> {
        // `while (my $line = <FH>)` and `while (each)` idioms arrive here
        // already shaped; the condition re-evaluates per iteration.
        let label_idx = label.map_or(NONE_REG, |l| self.b.intern_str(l));
        let enter = self.emit_loop_enter(label_idx);
        let head = self.b.here();
        let mk = self.mark();
        let c = self.expr_scalar_cond(cond)?;
        let exit = if until {
            self.b.emit_jump(Opcode::GotoIfTrue, &[c])
        } else {
            self.b.emit_jump(Opcode::GotoIfFalse, &[c])
        };
        self.release(mk);
        let redo_target = self.b.here();
        self.block(body)?;
        let next_target = self.b.here();
        if let Some(cont) = cont {
            self.block(cont)?;
        }
        self.b.emit(Opcode::Goto, &[head]);
        self.b.patch_jump(exit);
        self.finish_loop(enter, redo_target, next_target);
        Ok(())
    }

    fn compile_foreach(
        &mut self,
        label: Option<&str>,
        var: &ForeachVar,
        list: &Expr,
        body: &Block,
    ) -> CResult<()> {
        let iter = self.alloc();
        // Ranges iterate in O(1) space; arrays iterate their cells (aliasing).
        match &list.kind {
            ExprKind::Range { from, to } => {
                let f = self.expr(from, Context::Scalar)?;
                let t = self.expr(to, Context::Scalar)?;
                self.b.emit(Opcode::IterRange, &[iter, f, t]);
            }
            _ => {
                // Iterating an array variable walks its cells, so the loop
                // variable aliases the elements.
                let r = if is_array_target(list) {
                    self.array_cell(list)?
                } else {
                    self.expr(list, Context::List)?
                };
                self.b.emit(Opcode::IterList, &[iter, r]);
            }
        }

        let label_idx = label.map_or(NONE_REG, |l| self.b.intern_str(l));
        match var {
            ForeachVar::Global(name) => {
                let name_idx = self.b.intern_str(name);
                self.b.emit(Opcode::LocalScopeEnter, &[]);
                self.b.emit(Opcode::LocalSaveGlobSlot, &[name_idx]);
            }
            ForeachVar::Default => {
                let name_idx = self.b.intern_str("main::_");
                self.b.emit(Opcode::LocalScopeEnter, &[]);
                self.b.emit(Opcode::LocalSaveGlobSlot, &[name_idx]);
            }
            ForeachVar::Lexical(_) => {}
        }

        let enter = self.emit_loop_enter(label_idx);
        let head = self.b.here();
        let has = self.alloc();
        self.b.emit(Opcode::IterHasNext, &[has, iter]);
        let exit = self.b.emit_jump(Opcode::GotoIfFalse, &[has]);
        match var {
            ForeachVar::Lexical(slot) => {
                let idx = self.pad_index(*slot);
                self.b.emit(Opcode::IterNextAlias, &[idx, iter]);
            }
            ForeachVar::Global(name) => {
                let name_idx = self.b.intern_str(name);
                self.b.emit(Opcode::IterNextGlobal, &[name_idx, iter]);
            }
            ForeachVar::Default => {
                let name_idx = self.b.intern_str("main::_");
                self.b.emit(Opcode::IterNextGlobal, &[name_idx, iter]);
            }
        }
        let redo_target = self.b.here();
        self.block(body)?;
        let next_target = self.b.here();
        self.b.emit(Opcode::Goto, &[head]);
        self.b.patch_jump(exit);
        self.finish_loop(enter, redo_target, next_target);
        if !matches!(var, ForeachVar::Lexical(_)) {
            self.b.emit(Opcode::LocalScopeExit, &[]);
        }
        Ok(())
    }

    fn compile_try(
        &mut self,
        body: &Block,
        catch_var: Option<u16>,
        catch: &Block,
        finally: Option<&Block>,
    ) -> CResult<()> {
        // Unlike `eval BLOCK`, `return` inside `try` still exits the
        // enclosing sub, so no eval-block context is pushed here.
        let try_slot = self.b.emit_jump(Opcode::EvalTry, &[]);
        self.block(body)?;
        self.b.emit(Opcode::EvalEnd, &[]);
        let skip_catch = self.b.emit_jump(Opcode::Goto, &[]);
        self.b.patch_jump(try_slot);
        // Catch: bind the error into the catch variable, then run the block.
        if let Some(slot) = catch_var {
            let idx = self.pad_index(slot);
            self.b.emit(Opcode::MyNew, &[idx, 0]);
            let err = self.alloc();
            let at = self.b.intern_str("main::@");
            self.b.emit(Opcode::LoadGlobalScalar, &[err, at]);
            self.b.emit(Opcode::StoreLocal, &[idx, err]);
        }
        self.block(catch)?;
        self.b.patch_jump(skip_catch);
        if let Some(fin) = finally {
            self.block(fin)?;
        }
        Ok(())
    }

    // ---- expressions ----

    /// Condition position: scalar context always (§4.4.4 trap).
    fn expr_scalar_cond(&mut self, e: &Expr) -> CResult<u16> {
        self.expr(e, Context::Scalar)
    }

    fn expr(&mut self, e: &Expr, ctx: Context) -> CResult<u16> {
        let line = e.line;
        match &e.kind {
            ExprKind::IntLit(n) => {
                let dst = self.alloc();
                let idx = self.b.intern_int(*n);
                self.b.emit(Opcode::LoadInt, &[dst, idx]);
                Ok(dst)
            }
            ExprKind::NumLit(f) => {
                let dst = self.alloc();
                let idx = self.b.intern_num(*f);
                self.b.emit(Opcode::LoadNum, &[dst, idx]);
                Ok(dst)
            }
            ExprKind::StrLit(s) => {
                let dst = self.alloc();
                let idx = self.b.intern_str(s);
                self.b.emit(Opcode::LoadStr, &[dst, idx]);
                Ok(dst)
            }
            ExprKind::Interp(parts) => self.interp_parts(parts, line),
            ExprKind::Nop => {
                let dst = self.alloc();
                self.b.emit(Opcode::LoadUndef, &[dst]);
                Ok(dst)
            }
            ExprKind::Lexical { slot, sigil } => {
                let idx = self.pad_index(*slot);
                match sigil {
                    Sigil::Scalar => {
                        let dst = self.alloc();
                        self.b.emit(Opcode::LoadLocal, &[dst, idx]);
                        Ok(dst)
                    }
                    Sigil::Array => {
                        let cell = self.alloc();
                        self.b.emit(Opcode::LocalRef, &[cell, idx]);
                        self.container_value(cell, Sigil::Array, ctx)
                    }
                    Sigil::Hash => {
                        let cell = self.alloc();
                        self.b.emit(Opcode::LocalRef, &[cell, idx]);
                        self.container_value(cell, Sigil::Hash, ctx)
                    }
                    _ => {
                        let dst = self.alloc();
                        self.b.emit(Opcode::LocalRef, &[dst, idx]);
                        Ok(dst)
                    }
                }
            }
            ExprKind::Capture { index, sigil } => {
                // Captures sit at pad positions [0, cap_len).
                match sigil {
                    Sigil::Scalar => {
                        let dst = self.alloc();
                        self.b.emit(Opcode::LoadLocal, &[dst, *index]);
                        Ok(dst)
                    }
                    Sigil::Array | Sigil::Hash => {
                        let cell = self.alloc();
                        self.b.emit(Opcode::LocalRef, &[cell, *index]);
                        self.container_value(cell, *sigil, ctx)
                    }
                    _ => {
                        let dst = self.alloc();
                        self.b.emit(Opcode::LocalRef, &[dst, *index]);
                        Ok(dst)
                    }
                }
            }
            ExprKind::Persistent { id, sigil } => {
                // Persistent cells bind through a dedicated pad-less path:
                // materialize the cell ref each time.
                let dst = self.alloc();
                let idx = self.b.intern_int(i64::from(*id));
                self.b.emit(Opcode::MyPersist, &[NONE_REG, idx, sigil_kind(*sigil), dst]);
                match sigil {
                    Sigil::Scalar => {
                        let v = self.alloc();
                        self.b.emit(Opcode::LoadThroughRef, &[v, dst]);
                        Ok(v)
                    }
                    Sigil::Array | Sigil::Hash => self.container_value(dst, *sigil, ctx),
                    _ => Ok(dst),
                }
            }
            ExprKind::Global { name, sigil } => match sigil {
                Sigil::Scalar => {
                    let dst = self.alloc();
                    let idx = self.b.intern_str(name);
                    self.b.emit(Opcode::LoadGlobalScalar, &[dst, idx]);
                    Ok(dst)
                }
                Sigil::Array => {
                    let cell = self.alloc();
                    let idx = self.b.intern_str(name);
                    self.b.emit(Opcode::GlobalArrayRef, &[cell, idx]);
                    self.container_value(cell, Sigil::Array, ctx)
                }
                Sigil::Hash => {
                    let cell = self.alloc();
                    let idx = self.b.intern_str(name);
                    self.b.emit(Opcode::GlobalHashRef, &[cell, idx]);
                    self.container_value(cell, Sigil::Hash, ctx)
                }
                Sigil::Code => {
                    let dst = self.alloc();
                    let idx = self.b.intern_str(name);
                    self.b.emit(Opcode::GlobalCode, &[dst, idx]);
                    Ok(dst)
                }
                Sigil::Glob => {
                    let dst = self.alloc();
                    let idx = self.b.intern_str(name);
                    self.b.emit(Opcode::GlobRef, &[dst, idx]);
                    Ok(dst)
                }
            },
            ExprKind::ArgsArray => {
                let cell = self.alloc();
                self.b.emit(Opcode::LoadArgs, &[cell]);
                self.container_value(cell, Sigil::Array, ctx)
            }
            ExprKind::Deref { sigil, expr } => {
                let inner = self.expr(expr, Context::Scalar)?;
                match sigil {
                    Sigil::Scalar => {
                        let dst = self.alloc();
                        self.b.emit(Opcode::DerefScalarLoad, &[dst, inner]);
                        Ok(dst)
                    }
                    Sigil::Array | Sigil::Hash => {
                        let cell = self.alloc();
                        self.b.emit(Opcode::DerefCell, &[cell, inner, sigil_kind(*sigil)]);
                        self.container_value(cell, *sigil, ctx)
                    }
                    Sigil::Code => Ok(inner),
                    Sigil::Glob => Ok(inner),
                }
            }
            ExprKind::LastIndex(array) => {
                let cell = self.array_cell(array)?;
                let dst = self.alloc();
                self.b.emit(Opcode::ArrayLen, &[dst, cell]);
                Ok(dst)
            }
            ExprKind::ArrayElem { array, index } => {
                let cell = self.array_cell(array)?;
                let idx = self.expr(index, Context::Scalar)?;
                let dst = self.alloc();
                self.b.emit(Opcode::ArrayElem, &[dst, cell, idx]);
                Ok(dst)
            }
            ExprKind::HashElem { hash, key } => {
                let cell = self.hash_cell(hash)?;
                let k = self.expr(key, Context::Scalar)?;
                let dst = self.alloc();
                self.b.emit(Opcode::HashElem, &[dst, cell, k]);
                Ok(dst)
            }
            ExprKind::ArraySlice { array, indices } => {
                let cell = self.array_cell(array)?;
                let list = self.expr(indices, Context::List)?;
                let dst = self.alloc();
                self.b.emit(Opcode::SliceArray, &[dst, cell, list, ctx_to_word(ctx)]);
                Ok(dst)
            }
            ExprKind::HashSlice { hash, keys } => {
                let cell = self.hash_cell(hash)?;
                let list = self.expr(keys, Context::List)?;
                let dst = self.alloc();
                self.b.emit(Opcode::SliceHash, &[dst, cell, list, ctx_to_word(ctx)]);
                Ok(dst)
            }
            ExprKind::KvSlice { hash, keys } => {
                let cell = self.hash_cell(hash)?;
                let list = self.expr(keys, Context::List)?;
                let dst = self.alloc();
                self.b.emit(Opcode::KvSlice, &[dst, cell, list]);
                Ok(dst)
            }
            ExprKind::List(items) => match ctx {
                // Scalar/void context turns parens into the comma operator:
                // every element but the last evaluates for effect, and the
                // last keeps the scalar context (so `my $n = (%h = LIST)`
                // sees the list-assignment's source count).
                Context::Scalar | Context::Void => {
                    if items.is_empty() {
                        let dst = self.alloc();
                        self.b.emit(Opcode::LoadUndef, &[dst]);
                        return Ok(dst);
                    }
                    for item in &items[..items.len() - 1] {
                        let m = self.mark();
                        self.expr(item, Context::Void)?;
                        self.release(m);
                    }
                    self.expr(&items[items.len() - 1], ctx)
                }
                _ => self.list_value(items),
            },
            ExprKind::AnonArray(items) => {
                let list = self.list_value(items)?;
                let dst = self.alloc();
                self.b.emit(Opcode::ArrayFromList, &[dst, list]);
                Ok(dst)
            }
            ExprKind::AnonHash(items) => {
                let list = self.list_value(items)?;
                let dst = self.alloc();
                self.b.emit(Opcode::HashFromList, &[dst, list]);
                Ok(dst)
            }
            ExprKind::AnonSub(sub) => {
                let code = compile_sub(sub, self.file, self.refactor, self.warn_mask, self.installs, self.warnings)?;
                let idx = self.b.add_sub(code);
                let dst = self.alloc();
                self.b.emit(Opcode::CaptureSub, &[dst, idx]);
                Ok(dst)
            }
            ExprKind::RefTo(inner) => self.ref_to(inner, line),
            ExprKind::Assign { target, value } => self.assign(target, value, ctx, line),
            ExprKind::OpAssign { op, target, value } => {
                let lv = self.lvalue(target)?;
                let v = self.expr(value, Context::Scalar)?;
                let dst = self.alloc();
                self.b.emit(compound_op(*op), &[dst, lv, v]);
                Ok(dst)
            }
            ExprKind::LogAssign { op, target, value } => {
                // Short-circuit: evaluate the RHS only when needed, then
                // store through the same cell.
                let lv = self.lvalue(target)?;
                let dst = self.alloc();
                self.b.emit(Opcode::LoadThroughRef, &[dst, lv]);
                let jump = match op {
                    LogOp::And => self.b.emit_jump(Opcode::GotoIfFalse, &[dst]),
                    LogOp::Or => self.b.emit_jump(Opcode::GotoIfTrue, &[dst]),
                    LogOp::Dor => {
                        let d = self.alloc();
                        self.b.emit(Opcode::DefinedOp, &[d, dst]);
                        self.b.emit_jump(Opcode::GotoIfTrue, &[d])
                    }
                };
                let v = self.expr(value, Context::Scalar)?;
                self.b.emit(Opcode::StoreThroughRef, &[lv, v]);
                self.b.emit(Opcode::Move, &[dst, v]);
                self.b.patch_jump(jump);
                Ok(dst)
            }
            ExprKind::Unary { op, operand } => {
                let dst = self.alloc();
                match op {
                    UnOp::Not => {
                        let r = self.expr_scalar_cond(operand)?;
                        self.b.emit(Opcode::NotOp, &[dst, r]);
                    }
                    UnOp::Neg => {
                        let r = self.expr(operand, Context::Scalar)?;
                        self.b.emit(Opcode::Neg, &[dst, r]);
                    }
                    UnOp::Plus => {
                        let r = self.expr(operand, Context::Scalar)?;
                        self.b.emit(Opcode::Move, &[dst, r]);
                    }
                    UnOp::BitNot => {
                        let r = self.expr(operand, Context::Scalar)?;
                        self.b.emit(Opcode::BitNot, &[dst, r]);
                    }
                    UnOp::Defined => {
                        let r = self.expr(operand, Context::Scalar)?;
                        self.b.emit(Opcode::DefinedOp, &[dst, r]);
                    }
                }
                Ok(dst)
            }
            ExprKind::Binary { op, left, right } => {
                if *op == BinOp::Repeat {
                    // List repetition needs the list context of the LHS.
                    let l = match &left.kind {
                        ExprKind::List(items) => self.list_value(items)?,
                        _ => self.expr(left, Context::Scalar)?,
                    };
                    let r = self.expr(right, Context::Scalar)?;
                    let dst = self.alloc();
                    self.b.emit(Opcode::Repeat, &[dst, l, r, ctx_to_word(ctx)]);
                    return Ok(dst);
                }
                let l = self.expr(left, Context::Scalar)?;
                let r = self.expr(right, Context::Scalar)?;
                let dst = self.alloc();
                self.b.emit(binary_op(*op), &[dst, l, r]);
                Ok(dst)
            }
            ExprKind::Logical { op, left, right } => {
                let dst = self.alloc();
                let l = self.expr_scalar_cond(left)?;
                self.b.emit(Opcode::Move, &[dst, l]);
                let jump = match op {
                    LogOp::And => self.b.emit_jump(Opcode::GotoIfFalse, &[l]),
                    LogOp::Or => self.b.emit_jump(Opcode::GotoIfTrue, &[l]),
                    LogOp::Dor => {
                        let d = self.alloc();
                        self.b.emit(Opcode::DefinedOp, &[d, l]);
                        self.b.emit_jump(Opcode::GotoIfTrue, &[d])
                    }
                };
                let rhs_ctx = if ctx == Context::Void { Context::Scalar } else { ctx };
                let r = self.expr(right, rhs_ctx)?;
                self.b.emit(Opcode::Move, &[dst, r]);
                self.b.patch_jump(jump);
                Ok(dst)
            }
            ExprKind::Ternary { cond, then, else_ } => {
                let dst = self.alloc();
                let c = self.expr_scalar_cond(cond)?;
                let jump_else = self.b.emit_jump(Opcode::GotoIfFalse, &[c]);
                let t = self.expr(then, ctx)?;
                self.b.emit(Opcode::Move, &[dst, t]);
                let jump_end = self.b.emit_jump(Opcode::Goto, &[]);
                self.b.patch_jump(jump_else);
                let f = self.expr(else_, ctx)?;
                self.b.emit(Opcode::Move, &[dst, f]);
                self.b.patch_jump(jump_end);
                Ok(dst)
            }
            ExprKind::Range { from, to } => {
                let f = self.expr(from, Context::Scalar)?;
                let t = self.expr(to, Context::Scalar)?;
                let dst = self.alloc();
                self.b.emit(Opcode::Range, &[dst, f, t]);
                Ok(dst)
            }
            ExprKind::Incr { target, by, post } => {
                let lv = self.lvalue(target)?;
                let dst = self.alloc();
                let mut flags = 0u16;
                if *by < 0 {
                    flags |= 1;
                }
                if *post {
                    flags |= 2;
                }
                self.b.emit(Opcode::Incr, &[dst, lv, flags]);
                Ok(dst)
            }
            ExprKind::Decl { slots, .. } => {
                // Bare declaration (no assignment): create the cells.
                for slot in slots {
                    self.emit_decl_slot(slot)?;
                }
                let dst = self.alloc();
                self.b.emit(Opcode::LoadUndef, &[dst]);
                Ok(dst)
            }
            ExprKind::Local { target } => {
                let lv = self.local_lvalue(target)?;
                self.b.emit(Opcode::LocalSave, &[lv]);
                Ok(lv)
            }
            ExprKind::SubCall { callee, args } => {
                let code_r = match callee {
                    Callee::Named(name) => {
                        let dst = self.alloc();
                        let idx = self.b.intern_str(name);
                        self.b.emit(Opcode::GlobalCode, &[dst, idx]);
                        dst
                    }
                    Callee::Expr(e) => self.expr(e, Context::Scalar)?,
                };
                let args_r = self.list_value(args)?;
                let dst = self.alloc();
                self.b.emit(Opcode::CallSub, &[dst, code_r, args_r, ctx_to_word(ctx)]);
                Ok(dst)
            }
            ExprKind::MethodCall { invocant, method, args } => {
                let inv = match &invocant.kind {
                    // `Foo->method` — the bareword is the class name.
                    ExprKind::Bareword(name) => {
                        let dst = self.alloc();
                        let idx = self.b.intern_str(name);
                        self.b.emit(Opcode::LoadStr, &[dst, idx]);
                        dst
                    }
                    _ => self.expr(invocant, Context::Scalar)?,
                };
                let args_r = self.list_value(args)?;
                let dst = self.alloc();
                match method {
                    MethodName::Static(name) => {
                        let name_r = self.alloc();
                        let idx = self.b.intern_str(name);
                        self.b.emit(Opcode::LoadStr, &[name_r, idx]);
                        self.b.emit(Opcode::CallMethod, &[dst, inv, name_r, args_r, ctx_to_word(ctx)]);
                    }
                    MethodName::Super(name) => {
                        let idx = self.b.intern_str(name);
                        self.b.emit(Opcode::CallSuper, &[dst, inv, idx, args_r, ctx_to_word(ctx)]);
                    }
                    MethodName::Dynamic(name_expr) => {
                        let name_r = self.expr(name_expr, Context::Scalar)?;
                        self.b.emit(Opcode::CallMethod, &[dst, inv, name_r, args_r, ctx_to_word(ctx)]);
                    }
                }
                Ok(dst)
            }
            ExprKind::FuncCall { func, args } => self.builtin(*func, args, ctx, line),
            ExprKind::Sort { cmp, args } => {
                let cmp_r = match cmp {
                    Some(sub) => {
                        let code =
                            compile_sub(sub, self.file, self.refactor, self.warn_mask, self.installs, self.warnings)?;
                        let idx = self.b.add_sub(code);
                        let r = self.alloc();
                        self.b.emit(Opcode::CaptureSub, &[r, idx]);
                        r
                    }
                    None => NONE_REG,
                };
                let list = self.list_value(args)?;
                let dst = self.alloc();
                self.b.emit(Opcode::Sort, &[dst, cmp_r, list]);
                Ok(dst)
            }
            ExprKind::Map { body, args } => {
                let code = compile_sub(body, self.file, self.refactor, self.warn_mask, self.installs, self.warnings)?;
                let idx = self.b.add_sub(code);
                let code_r = self.alloc();
                self.b.emit(Opcode::CaptureSub, &[code_r, idx]);
                let list = self.list_value(args)?;
                let dst = self.alloc();
                self.b.emit(Opcode::Map, &[dst, code_r, list]);
                Ok(dst)
            }
            ExprKind::Grep { body, args } => {
                let code = compile_sub(body, self.file, self.refactor, self.warn_mask, self.installs, self.warnings)?;
                let idx = self.b.add_sub(code);
                let code_r = self.alloc();
                self.b.emit(Opcode::CaptureSub, &[code_r, idx]);
                let list = self.list_value(args)?;
                let dst = self.alloc();
                self.b.emit(Opcode::Grep, &[dst, code_r, list]);
                Ok(dst)
            }
            ExprKind::Match { target, regex, negated } => {
                let target_r = match target {
                    Some(t) if is_scalar_lvalue(t) => self.lvalue(t)?,
                    Some(t) => self.expr(t, Context::Scalar)?,
                    None => {
                        let idx = self.b.intern_str("main::_");
                        let r = self.alloc();
                        self.b.emit(Opcode::GlobalScalarRef, &[r, idx]);
                        r
                    }
                };
                let re_r = self.regex_value(regex, line)?;
                let dst = self.alloc();
                self.b.emit(Opcode::Match, &[dst, target_r, re_r, u16::from(*negated), ctx_to_word(ctx)]);
                Ok(dst)
            }
            ExprKind::MatchBind { target, pattern, negated } => {
                let target_r = if is_scalar_lvalue(target) {
                    self.lvalue(target)?
                } else {
                    self.expr(target, Context::Scalar)?
                };
                let re_r = self.expr(pattern, Context::Scalar)?;
                let dst = self.alloc();
                self.b.emit(Opcode::Match, &[dst, target_r, re_r, u16::from(*negated), ctx_to_word(ctx)]);
                Ok(dst)
            }
            ExprKind::QrConstruct { regex } => self.regex_value(regex, line),
            ExprKind::Subst { target, regex, replacement, .. } => {
                let nondestructive = regex.mods.contains('r');
                if nondestructive && ctx == Context::Void {
                    self.warn(line, WarningCategory::Void, "Useless use of non-destructive substitution (s///r) in void context");
                }
                let target_r = match target {
                    Some(t) if !nondestructive && is_scalar_lvalue(t) => self.lvalue(t)?,
                    Some(t) => self.expr(t, Context::Scalar)?,
                    None => {
                        let idx = self.b.intern_str("main::_");
                        let r = self.alloc();
                        self.b.emit(Opcode::GlobalScalarRef, &[r, idx]);
                        r
                    }
                };
                let re_r = self.regex_value(regex, line)?;
                // The replacement is a synthetic closure sharing this pad,
                // invoked per match with the capture vars in place.
                let repl_sub = self.replacement_sub(replacement, line);
                let code = compile_sub(&repl_sub, self.file, self.refactor, self.warn_mask, self.installs, self.warnings)?;
                let idx = self.b.add_sub(code);
                let repl_r = self.alloc();
                self.b.emit(Opcode::CaptureSub, &[repl_r, idx]);
                let dst = self.alloc();
                self.b.emit(Opcode::Subst, &[dst, target_r, re_r, repl_r, ctx_to_word(ctx)]);
                Ok(dst)
            }
            ExprKind::Trans { target, search, replacement, mods } => {
                let spec = tr::parse_trans(search, replacement, mods)
                    .map_err(|err| self.error(line, err.message))?;
                let nondestructive = spec.nondestructive;
                let target_r = match target {
                    Some(t) if !nondestructive && is_scalar_lvalue(t) => self.lvalue(t)?,
                    Some(t) => self.expr(t, Context::Scalar)?,
                    None => {
                        let idx = self.b.intern_str("main::_");
                        let r = self.alloc();
                        self.b.emit(Opcode::GlobalScalarRef, &[r, idx]);
                        r
                    }
                };
                let idx = self.b.add_trans(Rc::new(spec));
                let dst = self.alloc();
                self.b.emit(Opcode::Trans, &[dst, target_r, idx, ctx_to_word(ctx)]);
                Ok(dst)
            }
            ExprKind::ReadLine { handle } => {
                let h = self.handle_value(handle)?;
                let dst = self.alloc();
                self.b.emit(Opcode::Readline, &[dst, h, ctx_to_word(ctx)]);
                Ok(dst)
            }
            ExprKind::Bareword(word) => {
                // Reaching codegen as a value: a filehandle name or string.
                let dst = self.alloc();
                let idx = self.b.intern_str(word);
                self.b.emit(Opcode::LoadStr, &[dst, idx]);
                Ok(dst)
            }
            ExprKind::DoBlock(block) => self.block_value(block, ctx),
            ExprKind::EvalBlock(block) => {
                let dst = self.alloc();
                let try_slot = self.b.emit_jump(Opcode::EvalTry, &[]);
                self.eval_blocks.push(EvalBlockCtx { dst, end_jumps: Vec::new() });
                let r = self.block_value(block, ctx)?;
                self.b.emit(Opcode::Move, &[dst, r]);
                let mut blk = self.eval_blocks.pop().unwrap_or_else(|| unreachable!());
                self.b.emit(Opcode::EvalEnd, &[]);
                let skip = self.b.emit_jump(Opcode::Goto, &[]);
                self.b.patch_jump(try_slot);
                // The catch path: `$@` is set; the eval's value is undef.
                self.b.emit(Opcode::LoadUndef, &[dst]);
                self.b.patch_jump(skip);
                for j in blk.end_jumps.drain(..) {
                    self.b.patch_jump(j);
                }
                Ok(dst)
            }
            ExprKind::EvalString { code, snapshot } => {
                let src = self.expr(code, Context::Scalar)?;
                let idx = self.b.add_snapshot(Rc::clone(snapshot));
                let dst = self.alloc();
                self.b.emit(Opcode::EvalString, &[dst, src, idx, ctx_to_word(ctx)]);
                Ok(dst)
            }
            ExprKind::Wantarray => {
                let dst = self.alloc();
                self.b.emit(Opcode::Wantarray, &[dst]);
                Ok(dst)
            }
            ExprKind::CaptureGroup(n) => {
                let n_r = self.alloc();
                let idx = self.b.intern_int(*n as i64);
                self.b.emit(Opcode::LoadInt, &[n_r, idx]);
                let dst = self.alloc();
                self.b.emit(Opcode::CaptureGroup, &[dst, n_r]);
                Ok(dst)
            }
            ExprKind::MatchSpecial(which) => {
                let w = match which {
                    '&' => 0,
                    '`' => 1,
                    _ => 2,
                };
                let dst = self.alloc();
                self.b.emit(Opcode::MatchSpecial, &[dst, w]);
                Ok(dst)
            }
            ExprKind::NamedCapture { key } => {
                let k = self.expr(key, Context::Scalar)?;
                let dst = self.alloc();
                self.b.emit(Opcode::NamedCapture, &[dst, k]);
                Ok(dst)
            }
            ExprKind::MatchSpans { ends } => {
                let dst = self.alloc();
                self.b.emit(Opcode::MatchSpans, &[dst, u16::from(*ends)]);
                Ok(dst)
            }
        }
    }

    /// Array/hash cell value in the given context: flattened list, count, or
    /// nothing worth keeping in void.
    fn container_value(&mut self, cell: u16, sigil: Sigil, ctx: Context) -> CResult<u16> {
        match (sigil, ctx) {
            (Sigil::Array, Context::Scalar) => {
                let dst = self.alloc();
                self.b.emit(Opcode::ArrayCount, &[dst, cell]);
                Ok(dst)
            }
            (Sigil::Hash, Context::Scalar) => {
                let dst = self.alloc();
                self.b.emit(Opcode::HashCount, &[dst, cell]);
                Ok(dst)
            }
            (Sigil::Array, _) => {
                let dst = self.alloc();
                self.b.emit(Opcode::ArrayList, &[dst, cell]);
                Ok(dst)
            }
            (Sigil::Hash, _) => {
                let dst = self.alloc();
                self.b.emit(Opcode::HashList, &[dst, cell]);
                Ok(dst)
            }
            _ => Ok(cell),
        }
    }

    /// A register holding a Ref to the array cell an expression denotes.
    fn array_cell(&mut self, e: &Expr) -> CResult<u16> {
        match &e.kind {
            ExprKind::Lexical { slot, sigil: Sigil::Array } => {
                let dst = self.alloc();
                self.b.emit(Opcode::LocalRef, &[dst, self.pad_index(*slot)]);
                Ok(dst)
            }
            ExprKind::Capture { index, sigil: Sigil::Array } => {
                let dst = self.alloc();
                self.b.emit(Opcode::LocalRef, &[dst, *index]);
                Ok(dst)
            }
            ExprKind::Persistent { id, sigil: Sigil::Array } => {
                let dst = self.alloc();
                let idx = self.b.intern_int(i64::from(*id));
                self.b.emit(Opcode::MyPersist, &[NONE_REG, idx, 1, dst]);
                Ok(dst)
            }
            ExprKind::Global { name, sigil: Sigil::Array } => {
                let dst = self.alloc();
                let idx = self.b.intern_str(name);
                self.b.emit(Opcode::GlobalArrayRef, &[dst, idx]);
                Ok(dst)
            }
            ExprKind::ArgsArray => {
                let dst = self.alloc();
                self.b.emit(Opcode::LoadArgs, &[dst]);
                Ok(dst)
            }
            ExprKind::Deref { sigil: Sigil::Array, expr } => {
                let holder = self.deref_holder(expr)?;
                Ok(holder)
            }
            _ => {
                // Whatever it is, require an array ref at runtime.
                let r = self.expr(e, Context::Scalar)?;
                let dst = self.alloc();
                self.b.emit(Opcode::DerefCell, &[dst, r, 1]);
                Ok(dst)
            }
        }
    }

    fn hash_cell(&mut self, e: &Expr) -> CResult<u16> {
        match &e.kind {
            ExprKind::Lexical { slot, sigil: Sigil::Hash } => {
                let dst = self.alloc();
                self.b.emit(Opcode::LocalRef, &[dst, self.pad_index(*slot)]);
                Ok(dst)
            }
            ExprKind::Capture { index, sigil: Sigil::Hash } => {
                let dst = self.alloc();
                self.b.emit(Opcode::LocalRef, &[dst, *index]);
                Ok(dst)
            }
            ExprKind::Persistent { id, sigil: Sigil::Hash } => {
                let dst = self.alloc();
                let idx = self.b.intern_int(i64::from(*id));
                self.b.emit(Opcode::MyPersist, &[NONE_REG, idx, 2, dst]);
                Ok(dst)
            }
            ExprKind::Global { name, sigil: Sigil::Hash } => {
                let dst = self.alloc();
                let idx = self.b.intern_str(name);
                self.b.emit(Opcode::GlobalHashRef, &[dst, idx]);
                Ok(dst)
            }
            ExprKind::Deref { sigil: Sigil::Hash, expr } => {
                let holder = self.deref_holder_hash(expr)?;
                Ok(holder)
            }
            _ => {
                let r = self.expr(e, Context::Scalar)?;
                let dst = self.alloc();
                self.b.emit(Opcode::DerefCell, &[dst, r, 2]);
                Ok(dst)
            }
        }
    }

    /// Dereference with autovivification when the holder is an lvalue-able
    /// scalar: `$x->{k}` on undef `$x` creates the hash.
    fn deref_holder(&mut self, holder: &Expr) -> CResult<u16> {
        if is_scalar_lvalue(holder) {
            let lv = self.lvalue(holder)?;
            let dst = self.alloc();
            self.b.emit(Opcode::DerefVivify, &[dst, lv, 1]);
            Ok(dst)
        } else {
            let r = self.expr(holder, Context::Scalar)?;
            let dst = self.alloc();
            self.b.emit(Opcode::DerefCell, &[dst, r, 1]);
            Ok(dst)
        }
    }

    fn deref_holder_hash(&mut self, holder: &Expr) -> CResult<u16> {
        if is_scalar_lvalue(holder) {
            let lv = self.lvalue(holder)?;
            let dst = self.alloc();
            self.b.emit(Opcode::DerefVivify, &[dst, lv, 2]);
            Ok(dst)
        } else {
            let r = self.expr(holder, Context::Scalar)?;
            let dst = self.alloc();
            self.b.emit(Opcode::DerefCell, &[dst, r, 2]);
            Ok(dst)
        }
    }

    /// Builds a flattened list value from element expressions.
    fn list_value(&mut self, items: &[Expr]) -> CResult<u16> {
        self.b.emit(Opcode::ListBegin, &[]);
        for item in items {
            let m = self.mark();
            let r = self.expr(item, Context::List)?;
            self.b.emit(Opcode::ListPush, &[r]);
            self.release(m);
        }
        let dst = self.alloc();
        self.b.emit(Opcode::ListEnd, &[dst]);
        Ok(dst)
    }

    fn interp_parts(&mut self, parts: &[InterpPart], line: u32) -> CResult<u16> {
        let _ = line;
        let mut regs: SmallVec<[u16; 8]> = SmallVec::new();
        for part in parts {
            match part {
                InterpPart::Lit(s) => {
                    let r = self.alloc();
                    let idx = self.b.intern_str(s);
                    self.b.emit(Opcode::LoadStr, &[r, idx]);
                    regs.push(r);
                }
                InterpPart::Scalar(e) => {
                    let r = self.expr(e, Context::Scalar)?;
                    regs.push(r);
                }
                InterpPart::Join(e) => {
                    let list = self.expr(e, Context::List)?;
                    let sep = self.alloc();
                    let idx = self.b.intern_str("main::\"");
                    self.b.emit(Opcode::LoadGlobalScalar, &[sep, idx]);
                    let joined = self.alloc();
                    self.b.emit(Opcode::Join, &[joined, sep, list]);
                    regs.push(joined);
                }
            }
        }
        let dst = self.alloc();
        let mut operands: SmallVec<[u16; 10]> = SmallVec::new();
        operands.push(dst);
        operands.push(u16::try_from(regs.len()).unwrap_or(u16::MAX));
        operands.extend(regs);
        self.b.emit(Opcode::StrBuild, &operands);
        Ok(dst)
    }

    /// Compiles a regex literal: precompiled into the pool when static,
    /// interpolated and built (with caching) at runtime otherwise.
    fn regex_value(&mut self, regex: &RegexLit, line: u32) -> CResult<u16> {
        if let Some(pattern) = regex.static_pattern() {
            let compiled = CompiledRegex::compile(&pattern, &regex.mods)
                .map_err(|e| self.error(line, e.message))?;
            let idx = self.b.add_regex(Rc::new(compiled));
            let dst = self.alloc();
            self.b.emit(Opcode::LoadRegex, &[dst, idx]);
            return Ok(dst);
        }
        let pat = self.interp_parts(&regex.parts, line)?;
        let mods_idx = self.b.intern_str(&regex.mods);
        let dst = self.alloc();
        self.b.emit(Opcode::BuildRegex, &[dst, pat, mods_idx]);
        Ok(dst)
    }

    /// The synthetic replacement closure for `s///`: shares this sub's pad.
    fn replacement_sub(&mut self, replacement: &[InterpPart], line: u32) -> SubDef {
        let lex = u16::try_from(self.sub.pad.len()).unwrap_or(u16::MAX);
        let captures = (0..self.cap_len)
            .map(crate::ast::CaptureSource::ParentCapture)
            .chain((0..lex).map(crate::ast::CaptureSource::ParentLexical))
            .collect();
        let body_expr = Expr { kind: ExprKind::Interp(replacement.to_vec()), line };
        SubDef {
            name: None,
            package: Rc::clone(&self.sub.package),
            body: Block { stmts: vec![Stmt { kind: StmtKind::Return(Some(body_expr)), line }] },
            pad: Vec::new(),
            captures,
            prototype: None,
            inherits_pad: true,
            parent_cap_len: self.pad_offset(),
            line,
        }
    }

    /// Print/readline handle expression: a glob value or handle-bearing value.
    fn handle_value(&mut self, handle: &Expr) -> CResult<u16> {
        match &handle.kind {
            ExprKind::Nop => {
                let dst = self.alloc();
                let idx = self.b.intern_str("main::STDOUT");
                self.b.emit(Opcode::GlobRef, &[dst, idx]);
                Ok(dst)
            }
            ExprKind::Bareword(name) => {
                let dst = self.alloc();
                let idx = self.b.intern_str(&format!("main::{name}"));
                self.b.emit(Opcode::GlobRef, &[dst, idx]);
                Ok(dst)
            }
            _ => self.expr(handle, Context::Scalar),
        }
    }

    // ---- builtins ----

    fn builtin(&mut self, func: Builtin, args: &[Expr], ctx: Context, line: u32) -> CResult<u16> {
        use Builtin::*;
        match func {
            Print | Say | Printf => {
                let default = Expr { kind: ExprKind::Nop, line };
                let handle = args.first().unwrap_or(&default);
                let h = self.handle_value(handle)?;
                let list = self.list_value(args.get(1..).unwrap_or(&[]))?;
                let dst = self.alloc();
                let op = match func {
                    Say => Opcode::Say,
                    Printf => Opcode::Printf,
                    _ => Opcode::Print,
                };
                self.b.emit(op, &[dst, h, list]);
                Ok(dst)
            }
            Sprintf => {
                let list = self.list_value(args)?;
                let dst = self.alloc();
                self.b.emit(Opcode::Sprintf, &[dst, list]);
                Ok(dst)
            }
            Push | Unshift => {
                let cell = self.array_cell(args.first().ok_or_else(|| self.error(line, "Not enough arguments for push"))?)?;
                let list = self.list_value(args.get(1..).unwrap_or(&[]))?;
                let dst = self.alloc();
                let op = if func == Push { Opcode::Push } else { Opcode::Unshift };
                self.b.emit(op, &[dst, cell, list]);
                Ok(dst)
            }
            Pop | Shift => {
                let cell = self.array_cell(args.first().ok_or_else(|| self.error(line, "Not enough arguments for shift"))?)?;
                let dst = self.alloc();
                let op = if func == Pop { Opcode::Pop } else { Opcode::Shift };
                self.b.emit(op, &[dst, cell]);
                Ok(dst)
            }
            Splice => {
                let cell = self.array_cell(args.first().ok_or_else(|| self.error(line, "Not enough arguments for splice"))?)?;
                let off = match args.get(1) {
                    Some(e) => self.expr(e, Context::Scalar)?,
                    None => NONE_REG,
                };
                let len = match args.get(2) {
                    Some(e) => self.expr(e, Context::Scalar)?,
                    None => NONE_REG,
                };
                let list = self.list_value(args.get(3..).unwrap_or(&[]))?;
                let dst = self.alloc();
                self.b.emit(Opcode::Splice, &[dst, cell, off, len, list, ctx_to_word(ctx)]);
                Ok(dst)
            }
            Keys | Values => {
                let arg = args.first().ok_or_else(|| self.error(line, "Not enough arguments for keys"))?;
                let cell = if is_array_target(arg) { self.array_cell(arg)? } else { self.hash_cell(arg)? };
                let dst = self.alloc();
                let op = if func == Keys { Opcode::Keys } else { Opcode::Values };
                self.b.emit(op, &[dst, cell, ctx_to_word(ctx)]);
                Ok(dst)
            }
            Each => {
                let cell = self.hash_cell(args.first().ok_or_else(|| self.error(line, "Not enough arguments for each"))?)?;
                let dst = self.alloc();
                self.b.emit(Opcode::Each, &[dst, cell]);
                Ok(dst)
            }
            Exists => {
                let arg = args.first().ok_or_else(|| self.error(line, "Not enough arguments for exists"))?;
                match &arg.kind {
                    ExprKind::HashElem { hash, key } => {
                        let cell = self.hash_cell(hash)?;
                        let k = self.expr(key, Context::Scalar)?;
                        let dst = self.alloc();
                        self.b.emit(Opcode::ExistsHash, &[dst, cell, k]);
                        Ok(dst)
                    }
                    ExprKind::ArrayElem { array, index } => {
                        let cell = self.array_cell(array)?;
                        let i = self.expr(index, Context::Scalar)?;
                        let dst = self.alloc();
                        self.b.emit(Opcode::ExistsArray, &[dst, cell, i]);
                        Ok(dst)
                    }
                    _ => Err(self.error(line, "exists argument is not a HASH or ARRAY element")),
                }
            }
            Delete => {
                let arg = args.first().ok_or_else(|| self.error(line, "Not enough arguments for delete"))?;
                match &arg.kind {
                    ExprKind::HashElem { hash, key } => {
                        let cell = self.hash_cell(hash)?;
                        let k = self.expr(key, Context::Scalar)?;
                        let dst = self.alloc();
                        self.b.emit(Opcode::DeleteHash, &[dst, cell, k, ctx_to_word(ctx)]);
                        Ok(dst)
                    }
                    ExprKind::ArrayElem { array, index } => {
                        let cell = self.array_cell(array)?;
                        let i = self.expr(index, Context::Scalar)?;
                        let dst = self.alloc();
                        self.b.emit(Opcode::DeleteArray, &[dst, cell, i]);
                        Ok(dst)
                    }
                    _ => Err(self.error(line, "delete argument is not a HASH or ARRAY element")),
                }
            }
            Defined => {
                let arg = args.first().ok_or_else(|| self.error(line, "Not enough arguments for defined"))?;
                let r = self.expr(arg, Context::Scalar)?;
                let dst = self.alloc();
                self.b.emit(Opcode::DefinedOp, &[dst, r]);
                Ok(dst)
            }
            Undef => {
                let dst = self.alloc();
                match args.first() {
                    None => self.b.emit(Opcode::UndefOp, &[dst, NONE_REG]),
                    Some(arg) if is_array_target(arg) => {
                        let cell = self.array_cell(arg)?;
                        self.b.emit(Opcode::UndefOp, &[dst, cell]);
                    }
                    Some(arg) if is_hash_target(arg) => {
                        let cell = self.hash_cell(arg)?;
                        self.b.emit(Opcode::UndefOp, &[dst, cell]);
                    }
                    Some(arg) => {
                        let lv = self.lvalue(arg)?;
                        self.b.emit(Opcode::UndefOp, &[dst, lv]);
                    }
                }
                Ok(dst)
            }
            Scalar => {
                let arg = args.first().ok_or_else(|| self.error(line, "Not enough arguments for scalar"))?;
                self.expr(arg, Context::Scalar)
            }
            Ref => {
                let arg = args.first().ok_or_else(|| self.error(line, "Not enough arguments for ref"))?;
                let r = self.expr(arg, Context::Scalar)?;
                let dst = self.alloc();
                self.b.emit(Opcode::RefOp, &[dst, r]);
                Ok(dst)
            }
            Bless => {
                let r = self.expr(args.first().ok_or_else(|| self.error(line, "Not enough arguments for bless"))?, Context::Scalar)?;
                let pkg = match args.get(1) {
                    Some(e) => self.expr(e, Context::Scalar)?,
                    None => {
                        let p = self.alloc();
                        let idx = self.b.intern_str(&self.sub.package);
                        self.b.emit(Opcode::LoadStr, &[p, idx]);
                        p
                    }
                };
                let dst = self.alloc();
                self.b.emit(Opcode::Bless, &[dst, r, pkg]);
                Ok(dst)
            }
            Die | Warn => {
                let list = self.list_value(args)?;
                let dst = self.alloc();
                let op = if func == Die { Opcode::Die } else { Opcode::Warn };
                self.b.emit(op, &[list]);
                self.b.emit(Opcode::LoadUndef, &[dst]);
                Ok(dst)
            }
            Length => {
                let r = self.expr(args.first().ok_or_else(|| self.error(line, "Not enough arguments for length"))?, Context::Scalar)?;
                let dst = self.alloc();
                self.b.emit(Opcode::Length, &[dst, r]);
                Ok(dst)
            }
            Substr => {
                let first = args.first().ok_or_else(|| self.error(line, "Not enough arguments for substr"))?;
                let with_repl = args.len() >= 4;
                let s = if with_repl && is_scalar_lvalue(first) {
                    self.lvalue(first)?
                } else {
                    self.expr(first, Context::Scalar)?
                };
                let off = self.expr(args.get(1).ok_or_else(|| self.error(line, "Not enough arguments for substr"))?, Context::Scalar)?;
                let len = match args.get(2) {
                    Some(e) => self.expr(e, Context::Scalar)?,
                    None => NONE_REG,
                };
                let repl = match args.get(3) {
                    Some(e) => self.expr(e, Context::Scalar)?,
                    None => NONE_REG,
                };
                let dst = self.alloc();
                self.b.emit(Opcode::Substr, &[dst, s, off, len, repl]);
                Ok(dst)
            }
            Index | Rindex => {
                let s = self.expr(args.first().ok_or_else(|| self.error(line, "Not enough arguments for index"))?, Context::Scalar)?;
                let sub = self.expr(args.get(1).ok_or_else(|| self.error(line, "Not enough arguments for index"))?, Context::Scalar)?;
                let pos = match args.get(2) {
                    Some(e) => self.expr(e, Context::Scalar)?,
                    None => NONE_REG,
                };
                let dst = self.alloc();
                let op = if func == Index { Opcode::IndexOp } else { Opcode::RindexOp };
                self.b.emit(op, &[dst, s, sub, pos]);
                Ok(dst)
            }
            Uc | Lc | Ucfirst | Lcfirst | Quotemeta => {
                let r = self.expr(args.first().ok_or_else(|| self.error(line, "Not enough arguments"))?, Context::Scalar)?;
                let dst = self.alloc();
                let op = match func {
                    Uc => Opcode::Uc,
                    Lc => Opcode::Lc,
                    Ucfirst => Opcode::Ucfirst,
                    Lcfirst => Opcode::Lcfirst,
                    _ => Opcode::Quotemeta,
                };
                self.b.emit(op, &[dst, r]);
                Ok(dst)
            }
            Chomp | Chop => {
                let arg = args.first().ok_or_else(|| self.error(line, "Not enough arguments for chomp"))?;
                let lv = self.lvalue(arg)?;
                let dst = self.alloc();
                let op = if func == Chomp { Opcode::Chomp } else { Opcode::Chop };
                self.b.emit(op, &[dst, lv]);
                Ok(dst)
            }
            Chr | Ord | Hex | Oct | Abs | Int | Sqrt | Sin | Cos | Exp | Log => {
                let r = self.expr(args.first().ok_or_else(|| self.error(line, "Not enough arguments"))?, Context::Scalar)?;
                let dst = self.alloc();
                let op = match func {
                    Chr => Opcode::Chr,
                    Ord => Opcode::Ord,
                    Hex => Opcode::HexOp,
                    Oct => Opcode::OctOp,
                    Abs => Opcode::Abs,
                    Int => Opcode::IntOp,
                    Sqrt => Opcode::Sqrt,
                    Sin => Opcode::Sin,
                    Cos => Opcode::Cos,
                    Exp => Opcode::Exp,
                    _ => Opcode::Log,
                };
                self.b.emit(op, &[dst, r]);
                Ok(dst)
            }
            Atan2 => {
                let y = self.expr(args.first().ok_or_else(|| self.error(line, "Not enough arguments for atan2"))?, Context::Scalar)?;
                let x = self.expr(args.get(1).ok_or_else(|| self.error(line, "Not enough arguments for atan2"))?, Context::Scalar)?;
                let dst = self.alloc();
                self.b.emit(Opcode::Atan2, &[dst, y, x]);
                Ok(dst)
            }
            Rand | Srand => {
                let r = match args.first() {
                    Some(e) => self.expr(e, Context::Scalar)?,
                    None => NONE_REG,
                };
                let dst = self.alloc();
                let op = if func == Rand { Opcode::Rand } else { Opcode::Srand };
                self.b.emit(op, &[dst, r]);
                Ok(dst)
            }
            Join => {
                let sep = self.expr(args.first().ok_or_else(|| self.error(line, "Not enough arguments for join"))?, Context::Scalar)?;
                let list = self.list_value(args.get(1..).unwrap_or(&[]))?;
                let dst = self.alloc();
                self.b.emit(Opcode::Join, &[dst, sep, list]);
                Ok(dst)
            }
            Split => self.compile_split(args, ctx, line),
            Reverse => {
                let list = self.list_value(args)?;
                let dst = self.alloc();
                self.b.emit(Opcode::Reverse, &[dst, list, ctx_to_word(ctx)]);
                Ok(dst)
            }
            Wantarray => {
                let dst = self.alloc();
                self.b.emit(Opcode::Wantarray, &[dst]);
                Ok(dst)
            }
            Caller => {
                let level = match args.first() {
                    Some(e) => self.expr(e, Context::Scalar)?,
                    None => NONE_REG,
                };
                let dst = self.alloc();
                self.b.emit(Opcode::Caller, &[dst, level, ctx_to_word(ctx)]);
                Ok(dst)
            }
            Pack => {
                let list = self.list_value(args)?;
                let dst = self.alloc();
                self.b.emit(Opcode::Pack, &[dst, list]);
                Ok(dst)
            }
            Unpack => {
                let tmpl = self.expr(args.first().ok_or_else(|| self.error(line, "Not enough arguments for unpack"))?, Context::Scalar)?;
                let src = match args.get(1) {
                    Some(e) => self.expr(e, Context::Scalar)?,
                    None => {
                        let idx = self.b.intern_str("main::_");
                        let r = self.alloc();
                        self.b.emit(Opcode::LoadGlobalScalar, &[r, idx]);
                        r
                    }
                };
                let dst = self.alloc();
                self.b.emit(Opcode::Unpack, &[dst, tmpl, src, ctx_to_word(ctx)]);
                Ok(dst)
            }
            Open => {
                let target = args.first().ok_or_else(|| self.error(line, "Not enough arguments for open"))?;
                let t = match &target.kind {
                    ExprKind::Bareword(name) => {
                        let dst = self.alloc();
                        let idx = self.b.intern_str(&format!("main::{name}"));
                        self.b.emit(Opcode::GlobRef, &[dst, idx]);
                        dst
                    }
                    _ => self.lvalue(target)?,
                };
                let list = self.list_value(args.get(1..).unwrap_or(&[]))?;
                let dst = self.alloc();
                self.b.emit(Opcode::Open, &[dst, t, list]);
                Ok(dst)
            }
            Close => {
                let h = self.handle_value(args.first().unwrap_or(&Expr { kind: ExprKind::Nop, line }))?;
                let dst = self.alloc();
                self.b.emit(Opcode::Close, &[dst, h]);
                Ok(dst)
            }
            Binmode => {
                let list = self.list_value(args)?;
                let dst = self.alloc();
                self.b.emit(Opcode::Binmode, &[dst, list]);
                Ok(dst)
            }
            Eof => {
                let h = match args.first() {
                    Some(e) => self.handle_value(e)?,
                    None => NONE_REG,
                };
                let dst = self.alloc();
                self.b.emit(Opcode::EofOp, &[dst, h]);
                Ok(dst)
            }
            Readline => {
                let h = self.handle_value(args.first().ok_or_else(|| self.error(line, "Not enough arguments for readline"))?)?;
                let dst = self.alloc();
                self.b.emit(Opcode::Readline, &[dst, h, ctx_to_word(ctx)]);
                Ok(dst)
            }
            Pos => {
                let r = self.expr(args.first().ok_or_else(|| self.error(line, "Not enough arguments for pos"))?, Context::Scalar)?;
                let dst = self.alloc();
                self.b.emit(Opcode::PosOp, &[dst, r]);
                Ok(dst)
            }
            Exit => {
                let r = match args.first() {
                    Some(e) => self.expr(e, Context::Scalar)?,
                    None => NONE_REG,
                };
                self.b.emit(Opcode::Exit, &[r]);
                let dst = self.alloc();
                self.b.emit(Opcode::LoadUndef, &[dst]);
                Ok(dst)
            }
            Sleep => {
                let r = match args.first() {
                    Some(e) => self.expr(e, Context::Scalar)?,
                    None => NONE_REG,
                };
                let dst = self.alloc();
                self.b.emit(Opcode::Sleep, &[dst, r]);
                Ok(dst)
            }
            Time => {
                let dst = self.alloc();
                self.b.emit(Opcode::Time, &[dst]);
                Ok(dst)
            }
            Tie => {
                let target = args.first().ok_or_else(|| self.error(line, "Not enough arguments for tie"))?;
                let t = self.lvalue(target)?;
                let list = self.list_value(args.get(1..).unwrap_or(&[]))?;
                let dst = self.alloc();
                self.b.emit(Opcode::Tie, &[dst, t, list]);
                Ok(dst)
            }
            Untie | Tied => {
                let target = args.first().ok_or_else(|| self.error(line, "Not enough arguments for untie"))?;
                let t = self.lvalue(target)?;
                let dst = self.alloc();
                let op = if func == Untie { Opcode::Untie } else { Opcode::Tied };
                self.b.emit(op, &[dst, t]);
                Ok(dst)
            }
        }
    }

    fn compile_split(&mut self, args: &[Expr], ctx: Context, line: u32) -> CResult<u16> {
        let pattern = args.first();
        // `split ' '` is awk-mode: leading whitespace stripped, split on runs.
        let (re_r, awk) = match pattern.map(|p| &p.kind) {
            Some(ExprKind::StrLit(s)) if &**s == " " => {
                let compiled = CompiledRegex::compile("\\s+", "").map_err(|e| self.error(line, e.message))?;
                let idx = self.b.add_regex(Rc::new(compiled));
                let r = self.alloc();
                self.b.emit(Opcode::LoadRegex, &[r, idx]);
                (r, 1u16)
            }
            Some(ExprKind::Match { regex, .. }) => (self.regex_value(regex, line)?, 0),
            Some(ExprKind::QrConstruct { regex }) => (self.regex_value(regex, line)?, 0),
            Some(_) => {
                let s = self.expr(pattern.unwrap_or(&Expr { kind: ExprKind::Nop, line }), Context::Scalar)?;
                let mods_idx = self.b.intern_str("");
                let r = self.alloc();
                self.b.emit(Opcode::BuildRegex, &[r, s, mods_idx]);
                (r, 0)
            }
            None => {
                let compiled = CompiledRegex::compile("\\s+", "").map_err(|e| self.error(line, e.message))?;
                let idx = self.b.add_regex(Rc::new(compiled));
                let r = self.alloc();
                self.b.emit(Opcode::LoadRegex, &[r, idx]);
                (r, 1)
            }
        };
        let target = match args.get(1) {
            Some(e) => self.expr(e, Context::Scalar)?,
            None => {
                let idx = self.b.intern_str("main::_");
                let r = self.alloc();
                self.b.emit(Opcode::LoadGlobalScalar, &[r, idx]);
                r
            }
        };
        let limit = match args.get(2) {
            Some(e) => self.expr(e, Context::Scalar)?,
            None => NONE_REG,
        };
        let dst = self.alloc();
        self.b.emit(Opcode::Split, &[dst, re_r, target, limit, awk, ctx_to_word(ctx)]);
        Ok(dst)
    }

    // ---- lvalues and assignment ----

    fn emit_decl_slot(&mut self, slot: &DeclSlot) -> CResult<()> {
        if slot.slot == u16::MAX {
            return Ok(());
        }
        let idx = self.pad_index(slot.slot);
        // A `my` slot that a BEGIN block touched was converted to a
        // persistent cell after this declaration parsed; the pad entry
        // carries the id.
        let persist = slot
            .persist
            .or_else(|| self.sub.pad.get(slot.slot as usize).and_then(|entry| entry.persist_id));
        match persist {
            Some(id) => {
                let pid = self.b.intern_int(i64::from(id));
                let created = self.alloc();
                self.b.emit(Opcode::MyPersist, &[idx, pid, sigil_kind(slot.sigil), created]);
            }
            None => {
                self.b.emit(Opcode::MyNew, &[idx, sigil_kind(slot.sigil)]);
            }
        }
        Ok(())
    }

    /// A register holding a Ref to the scalar cell an lvalue denotes.
    fn lvalue(&mut self, e: &Expr) -> CResult<u16> {
        let line = e.line;
        match &e.kind {
            ExprKind::Lexical { slot, sigil: Sigil::Scalar } => {
                let dst = self.alloc();
                self.b.emit(Opcode::LocalRef, &[dst, self.pad_index(*slot)]);
                Ok(dst)
            }
            ExprKind::Capture { index, sigil: Sigil::Scalar } => {
                let dst = self.alloc();
                self.b.emit(Opcode::LocalRef, &[dst, *index]);
                Ok(dst)
            }
            ExprKind::Persistent { id, sigil: Sigil::Scalar } => {
                let dst = self.alloc();
                let idx = self.b.intern_int(i64::from(*id));
                self.b.emit(Opcode::MyPersist, &[NONE_REG, idx, 0, dst]);
                Ok(dst)
            }
            ExprKind::Global { name, sigil: Sigil::Scalar } => {
                let dst = self.alloc();
                let idx = self.b.intern_str(name);
                self.b.emit(Opcode::GlobalScalarRef, &[dst, idx]);
                Ok(dst)
            }
            ExprKind::ArrayElem { array, index } => {
                let cell = self.array_cell(array)?;
                let idx = self.expr(index, Context::Scalar)?;
                let dst = self.alloc();
                self.b.emit(Opcode::ArrayElemLv, &[dst, cell, idx]);
                Ok(dst)
            }
            ExprKind::HashElem { hash, key } => {
                let cell = self.hash_cell(hash)?;
                let k = self.expr(key, Context::Scalar)?;
                let dst = self.alloc();
                self.b.emit(Opcode::HashElemLv, &[dst, cell, k]);
                Ok(dst)
            }
            ExprKind::Deref { sigil: Sigil::Scalar, expr } => {
                // `$$r = v` — the ref value itself names the cell.
                let r = self.expr(expr, Context::Scalar)?;
                let dst = self.alloc();
                self.b.emit(Opcode::DerefCell, &[dst, r, 0]);
                Ok(dst)
            }
            ExprKind::Decl { slots, declared_ref, .. } => {
                if *declared_ref || slots.len() != 1 {
                    return Err(self.error(line, "Can't use a declaration here"));
                }
                let slot = &slots[0];
                self.emit_decl_slot(slot)?;
                let dst = self.alloc();
                self.b.emit(Opcode::LocalRef, &[dst, self.pad_index(slot.slot)]);
                Ok(dst)
            }
            ExprKind::Local { target } => {
                let lv = self.local_lvalue(target)?;
                self.b.emit(Opcode::LocalSave, &[lv]);
                Ok(lv)
            }
            _ => Err(self.error(line, "Can't modify non-lvalue subroutine call or expression")),
        }
    }

    fn local_lvalue(&mut self, target: &Expr) -> CResult<u16> {
        match &target.kind {
            // `local @a` / `local %h` save whole containers.
            ExprKind::Global { name, sigil: Sigil::Array } => {
                let dst = self.alloc();
                let idx = self.b.intern_str(name);
                self.b.emit(Opcode::GlobalArrayRef, &[dst, idx]);
                Ok(dst)
            }
            ExprKind::Global { name, sigil: Sigil::Hash } => {
                let dst = self.alloc();
                let idx = self.b.intern_str(name);
                self.b.emit(Opcode::GlobalHashRef, &[dst, idx]);
                Ok(dst)
            }
            _ => self.lvalue(target),
        }
    }

    fn assign(&mut self, target: &Expr, value: &Expr, ctx: Context, line: u32) -> CResult<u16> {
        // `state $x = INIT` runs the initializer only on first execution.
        if let ExprKind::Decl { slots, declared_ref: false, .. } = &target.kind
            && slots.len() == 1
            && slots[0].sigil == Sigil::Scalar
            && let Some(persist_id) = slots[0].persist
        {
            let idx = self.pad_index(slots[0].slot);
            let pid = self.b.intern_int(i64::from(persist_id));
            let created = self.alloc();
            self.b.emit(Opcode::MyPersist, &[idx, pid, 0, created]);
            let skip = self.b.emit_jump(Opcode::GotoIfFalse, &[created]);
            let v = self.expr(value, Context::Scalar)?;
            self.b.emit(Opcode::StoreLocal, &[idx, v]);
            self.b.patch_jump(skip);
            let dst = self.alloc();
            self.b.emit(Opcode::LoadLocal, &[dst, idx]);
            return Ok(dst);
        }

        // List assignment?
        if let Some(targets) = list_assign_targets(target) {
            let rhs = self.expr(value, Context::List)?;
            self.b.emit(Opcode::LassignBegin, &[rhs]);
            for t in targets {
                match &t.kind {
                    ExprKind::Decl { slots, declared_ref, .. } => {
                        if *declared_ref {
                            // `my (\@a, \%h) = (\@x, \%y)` — each slot
                            // aliases the cell its source ref names.
                            for slot in slots {
                                if slot.slot == u16::MAX {
                                    self.b.emit(Opcode::LassignSkip, &[]);
                                    continue;
                                }
                                let undef = self.alloc();
                                self.b.emit(Opcode::LoadUndef, &[undef]);
                                let tmp = self.alloc();
                                self.b.emit(Opcode::MakeRef, &[tmp, undef]);
                                self.b.emit(Opcode::LassignScalar, &[tmp]);
                                let val = self.alloc();
                                self.b.emit(Opcode::LoadThroughRef, &[val, tmp]);
                                self.b.emit(Opcode::AliasSlot, &[self.pad_index(slot.slot), val]);
                            }
                            continue;
                        }
                        for slot in slots {
                            if slot.slot == u16::MAX {
                                self.b.emit(Opcode::LassignSkip, &[]);
                                continue;
                            }
                            self.emit_decl_slot(slot)?;
                            let r = self.alloc();
                            self.b.emit(Opcode::LocalRef, &[r, self.pad_index(slot.slot)]);
                            match slot.sigil {
                                Sigil::Array => self.b.emit(Opcode::LassignArray, &[r]),
                                Sigil::Hash => self.b.emit(Opcode::LassignHash, &[r]),
                                _ => self.b.emit(Opcode::LassignScalar, &[r]),
                            }
                        }
                    }
                    ExprKind::FuncCall { func: Builtin::Undef, args } if args.is_empty() => {
                        self.b.emit(Opcode::LassignSkip, &[]);
                    }
                    ExprKind::ArraySlice { array, indices } => {
                        let cell = self.array_cell(array)?;
                        let idxs = self.expr(indices, Context::List)?;
                        self.b.emit(Opcode::LassignSliceArray, &[cell, idxs]);
                    }
                    ExprKind::HashSlice { hash, keys } => {
                        let cell = self.hash_cell(hash)?;
                        let keys_r = self.expr(keys, Context::List)?;
                        self.b.emit(Opcode::LassignSliceHash, &[cell, keys_r]);
                    }
                    _ if is_array_target(&t) => {
                        let cell = self.array_cell(&t)?;
                        self.b.emit(Opcode::LassignArray, &[cell]);
                    }
                    _ if is_hash_target(&t) => {
                        let cell = self.hash_cell(&t)?;
                        self.b.emit(Opcode::LassignHash, &[cell]);
                    }
                    _ => {
                        let lv = self.lvalue(&t)?;
                        self.b.emit(Opcode::LassignScalar, &[lv]);
                    }
                }
            }
            let dst = self.alloc();
            self.b.emit(Opcode::LassignEnd, &[dst, ctx_to_word(ctx)]);
            return Ok(dst);
        }

        // Declared-reference scalar assignment: `my \$x = \$y` aliases.
        if let ExprKind::Decl { slots, declared_ref: true, .. } = &target.kind {
            let v = self.expr(value, Context::Scalar)?;
            for slot in slots {
                if slot.slot == u16::MAX {
                    continue;
                }
                self.b.emit(Opcode::AliasSlot, &[self.pad_index(slot.slot), v]);
            }
            return Ok(v);
        }

        // Whole-container assignment: `@a = LIST`, `%h = LIST`.
        if is_array_target(target) {
            let rhs = self.expr(value, Context::List)?;
            self.b.emit(Opcode::LassignBegin, &[rhs]);
            let cell = self.array_cell(target)?;
            self.b.emit(Opcode::LassignArray, &[cell]);
            let dst = self.alloc();
            self.b.emit(Opcode::LassignEnd, &[dst, ctx_to_word(ctx)]);
            return Ok(dst);
        }
        if is_hash_target(target) {
            let rhs = self.expr(value, Context::List)?;
            self.b.emit(Opcode::LassignBegin, &[rhs]);
            let cell = self.hash_cell(target)?;
            self.b.emit(Opcode::LassignHash, &[cell]);
            let dst = self.alloc();
            self.b.emit(Opcode::LassignEnd, &[dst, ctx_to_word(ctx)]);
            return Ok(dst);
        }

        // Slice assignment.
        if let ExprKind::ArraySlice { array, indices } = &target.kind {
            let rhs = self.expr(value, Context::List)?;
            let cell = self.array_cell(array)?;
            let idxs = self.expr(indices, Context::List)?;
            self.b.emit(Opcode::LassignBegin, &[rhs]);
            self.b.emit(Opcode::LassignSliceArray, &[cell, idxs]);
            let out = self.alloc();
            self.b.emit(Opcode::LassignEnd, &[out, ctx_to_word(ctx)]);
            return Ok(out);
        }
        if let ExprKind::HashSlice { hash, keys } = &target.kind {
            let rhs = self.expr(value, Context::List)?;
            let cell = self.hash_cell(hash)?;
            let keys_r = self.expr(keys, Context::List)?;
            self.b.emit(Opcode::LassignBegin, &[rhs]);
            self.b.emit(Opcode::LassignSliceHash, &[cell, keys_r]);
            let out = self.alloc();
            self.b.emit(Opcode::LassignEnd, &[out, ctx_to_word(ctx)]);
            return Ok(out);
        }

        // `$#a = n`.
        if let ExprKind::LastIndex(array) = &target.kind {
            let cell = self.array_cell(array)?;
            let v = self.expr(value, Context::Scalar)?;
            self.b.emit(Opcode::ArraySetLen, &[cell, v]);
            return Ok(v);
        }

        // Glob assignment: `*name = ...`.
        if let ExprKind::Global { name, sigil: Sigil::Glob } = &target.kind {
            let v = self.expr(value, Context::Scalar)?;
            let idx = self.b.intern_str(name);
            self.b.emit(Opcode::GlobAssign, &[idx, v]);
            return Ok(v);
        }

        // Plain scalar assignment.
        let v = self.expr(value, Context::Scalar)?;
        match &target.kind {
            ExprKind::Lexical { slot, sigil: Sigil::Scalar } => {
                self.b.emit(Opcode::StoreLocal, &[self.pad_index(*slot), v]);
            }
            ExprKind::Capture { index, sigil: Sigil::Scalar } => {
                self.b.emit(Opcode::StoreLocal, &[*index, v]);
            }
            ExprKind::Global { name, sigil: Sigil::Scalar } => {
                let idx = self.b.intern_str(name);
                self.b.emit(Opcode::StoreGlobalScalar, &[idx, v]);
            }
            _ => {
                let lv = self.lvalue(target)?;
                self.b.emit(Opcode::StoreThroughRef, &[lv, v]);
            }
        }
        let _ = line;
        Ok(v)
    }

    /// `\EXPR`.
    fn ref_to(&mut self, inner: &Expr, line: u32) -> CResult<u16> {
        match &inner.kind {
            // References to variables are references to their cells.
            ExprKind::Lexical { slot, .. } => {
                let dst = self.alloc();
                self.b.emit(Opcode::LocalRef, &[dst, self.pad_index(*slot)]);
                Ok(dst)
            }
            ExprKind::Capture { index, .. } => {
                let dst = self.alloc();
                self.b.emit(Opcode::LocalRef, &[dst, *index]);
                Ok(dst)
            }
            ExprKind::Persistent { id, sigil } => {
                let dst = self.alloc();
                let idx = self.b.intern_int(i64::from(*id));
                self.b.emit(Opcode::MyPersist, &[NONE_REG, idx, sigil_kind(*sigil), dst]);
                Ok(dst)
            }
            ExprKind::Global { name, sigil } => {
                let dst = self.alloc();
                let idx = self.b.intern_str(name);
                match sigil {
                    Sigil::Array => self.b.emit(Opcode::GlobalArrayRef, &[dst, idx]),
                    Sigil::Hash => self.b.emit(Opcode::GlobalHashRef, &[dst, idx]),
                    Sigil::Code => self.b.emit(Opcode::GlobalCode, &[dst, idx]),
                    _ => self.b.emit(Opcode::GlobalScalarRef, &[dst, idx]),
                }
                Ok(dst)
            }
            ExprKind::ArrayElem { .. } | ExprKind::HashElem { .. } => self.lvalue(inner),
            ExprKind::SubCall { callee: Callee::Named(name), args } if args.is_empty() => {
                // `\&name`.
                let dst = self.alloc();
                let idx = self.b.intern_str(name);
                self.b.emit(Opcode::GlobalCode, &[dst, idx]);
                Ok(dst)
            }
            ExprKind::AnonSub(_) => self.expr(inner, Context::Scalar),
            ExprKind::List(items) => {
                // `\(LIST)` distributes over the elements.
                self.b.emit(Opcode::ListBegin, &[]);
                for item in items {
                    let m = self.mark();
                    let r = self.ref_to(item, line)?;
                    self.b.emit(Opcode::ListPush, &[r]);
                    self.release(m);
                }
                let dst = self.alloc();
                self.b.emit(Opcode::ListEnd, &[dst]);
                Ok(dst)
            }
            ExprKind::Deref { sigil, expr } => {
                // `\@$r` etc: the referenced cell itself.
                let r = self.expr(expr, Context::Scalar)?;
                let dst = self.alloc();
                self.b.emit(Opcode::DerefCell, &[dst, r, sigil_kind(*sigil)]);
                Ok(dst)
            }
            // `\(expression)` — a fresh read-only-ish cell holding the value.
            _ => {
                let v = self.expr(inner, Context::Scalar)?;
                let dst = self.alloc();
                self.b.emit(Opcode::MakeRef, &[dst, v]);
                Ok(dst)
            }
        }
    }
}

fn clamp_line(line: u32) -> u16 {
    u16::try_from(line).unwrap_or(u16::MAX)
}

fn sigil_kind(sigil: Sigil) -> u16 {
    match sigil {
        Sigil::Array => 1,
        Sigil::Hash => 2,
        _ => 0,
    }
}

fn binary_op(op: BinOp) -> Opcode {
    match op {
        BinOp::Add => Opcode::Add,
        BinOp::Sub => Opcode::Sub,
        BinOp::Mul => Opcode::Mul,
        BinOp::Div => Opcode::Div,
        BinOp::Mod => Opcode::Mod,
        BinOp::Pow => Opcode::Pow,
        BinOp::NumEq => Opcode::NumEq,
        BinOp::NumNe => Opcode::NumNe,
        BinOp::NumLt => Opcode::NumLt,
        BinOp::NumLe => Opcode::NumLe,
        BinOp::NumGt => Opcode::NumGt,
        BinOp::NumGe => Opcode::NumGe,
        BinOp::Spaceship => Opcode::Spaceship,
        BinOp::StrEq => Opcode::StrEq,
        BinOp::StrNe => Opcode::StrNe,
        BinOp::StrLt => Opcode::StrLt,
        BinOp::StrLe => Opcode::StrLe,
        BinOp::StrGt => Opcode::StrGt,
        BinOp::StrGe => Opcode::StrGe,
        BinOp::StrCmp => Opcode::StrCmp,
        BinOp::Concat => Opcode::Concat,
        BinOp::Repeat => Opcode::Repeat,
        BinOp::BitAnd => Opcode::BitAnd,
        BinOp::BitOr => Opcode::BitOr,
        BinOp::BitXor => Opcode::BitXor,
        BinOp::Shl => Opcode::Shl,
        BinOp::Shr => Opcode::Shr,
        // Logical xor is equality over truth.
        BinOp::LogXor => Opcode::BitXor,
    }
}

fn compound_op(op: BinOp) -> Opcode {
    match op {
        BinOp::Add => Opcode::AddAssign,
        BinOp::Sub => Opcode::SubAssign,
        BinOp::Mul => Opcode::MulAssign,
        BinOp::Div => Opcode::DivAssign,
        BinOp::Mod => Opcode::ModAssign,
        BinOp::Pow => Opcode::PowAssign,
        BinOp::Concat => Opcode::ConcatAssign,
        BinOp::Repeat => Opcode::RepeatAssign,
        BinOp::Shl => Opcode::ShlAssign,
        BinOp::Shr => Opcode::ShrAssign,
        BinOp::BitAnd => Opcode::BitAndAssign,
        BinOp::BitOr => Opcode::BitOrAssign,
        BinOp::BitXor => Opcode::BitXorAssign,
        _ => Opcode::AddAssign,
    }
}

/// Scalar lvalues the compiler can take a cell reference to.
fn is_scalar_lvalue(e: &Expr) -> bool {
    matches!(
        e.kind,
        ExprKind::Lexical { sigil: Sigil::Scalar, .. }
            | ExprKind::Capture { sigil: Sigil::Scalar, .. }
            | ExprKind::Persistent { sigil: Sigil::Scalar, .. }
            | ExprKind::Global { sigil: Sigil::Scalar, .. }
            | ExprKind::ArrayElem { .. }
            | ExprKind::HashElem { .. }
            | ExprKind::Deref { sigil: Sigil::Scalar, .. }
    )
}

fn is_array_target(e: &Expr) -> bool {
    matches!(
        e.kind,
        ExprKind::Lexical { sigil: Sigil::Array, .. }
            | ExprKind::Capture { sigil: Sigil::Array, .. }
            | ExprKind::Persistent { sigil: Sigil::Array, .. }
            | ExprKind::Global { sigil: Sigil::Array, .. }
            | ExprKind::Deref { sigil: Sigil::Array, .. }
            | ExprKind::ArgsArray
    )
}

fn is_hash_target(e: &Expr) -> bool {
    matches!(
        e.kind,
        ExprKind::Lexical { sigil: Sigil::Hash, .. }
            | ExprKind::Capture { sigil: Sigil::Hash, .. }
            | ExprKind::Persistent { sigil: Sigil::Hash, .. }
            | ExprKind::Global { sigil: Sigil::Hash, .. }
            | ExprKind::Deref { sigil: Sigil::Hash, .. }
    )
}

/// `($a, $b) = ...` / `my ($x, @y) = ...` — returns the flattened targets
/// when the assignment is list-shaped.
fn list_assign_targets(target: &Expr) -> Option<Vec<Expr>> {
    match &target.kind {
        ExprKind::List(items) => {
            let mut out = Vec::new();
            for item in items {
                match &item.kind {
                    ExprKind::List(inner) => out.extend(inner.iter().cloned()),
                    _ => out.push(item.clone()),
                }
            }
            Some(out)
        }
        // `my ($x) = ...` and `my ($a, @b) = ...` are list assignments;
        // `my @a = ...` is a single-container one, routed the same way.
        ExprKind::Decl { slots, declared_ref, paren } => {
            let container = !declared_ref && slots.first().is_some_and(|s| s.sigil != Sigil::Scalar);
            if *paren || slots.len() > 1 || container {
                Some(vec![target.clone()])
            } else {
                None
            }
        }
        _ => None,
    }
}

fn block_has_local(block: &Block) -> bool {
    fn expr_has_local(e: &Expr) -> bool {
        let mut found = false;
        crate::refactor::walk_expr(e, &mut |x| {
            if matches!(x.kind, ExprKind::Local { .. }) {
                found = true;
            }
        });
        found
    }
    block.stmts.iter().any(|s| match &s.kind {
        StmtKind::Expr(e) | StmtKind::Return(Some(e)) => expr_has_local(e),
        _ => false,
    })
}
