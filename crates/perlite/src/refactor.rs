//! The large-block refactorer.
//!
//! The emission layer caps a compiled body at 64 KiB of code words; programs
//! with huge flat blocks (generated tables, test suites) blow through that.
//! This pass re-expresses oversized blocks as immediately-invoked closures
//! before code generation:
//!
//! 1. estimate each block's emitted size with a per-node cost visitor
//!    calibrated against the code generator;
//! 2. wrap a whole oversized sub body as `sub { BODY }->(@_)` when its
//!    control flow cannot escape the closure;
//! 3. otherwise split runs of safe statements at statement boundaries into
//!    `sub { CHUNK }->()` invocations, leaving unsafe statements (returns,
//!    loop controls that leave the chunk, declarations whose slots outlive
//!    the chunk) at the original level.
//!
//! Synthetic closures set `inherits_pad`: they capture the parent's entire
//! pad so slot numbering inside the moved code keeps meaning, and mutation
//! through the shared cells is seen on both sides.

use std::rc::Rc;

use crate::ast::{Block, Callee, Expr, ExprKind, InterpPart, Stmt, StmtKind, SubDef};

/// Tuning knobs; defaults match the 64 KiB emission ceiling with headroom.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RefactorOptions {
    pub enabled: bool,
    /// Blocks estimated above this many bytes get refactored.
    pub threshold: usize,
    /// Minimum estimated size before a run of statements is worth wrapping.
    pub chunk_min: usize,
}

impl Default for RefactorOptions {
    fn default() -> Self {
        Self { enabled: false, threshold: 30 * 1024, chunk_min: 4 * 1024 }
    }
}

impl RefactorOptions {
    pub(crate) fn from_env() -> Self {
        let enabled = std::env::var("JPERL_LARGECODE").is_ok_and(|v| v == "refactor");
        Self { enabled, ..Self::default() }
    }
}

/// How the pad of the frame owning the candidate code is laid out: its
/// capture block, its lexical block, and the capture offset the moved
/// code's `Lexical` slots were written against.
#[derive(Debug, Clone, Copy)]
struct PadShape {
    cap: u16,
    lex: u16,
    orig_cap: u16,
}

/// Entry point: rewrites the sub's body in place when it is oversized.
pub(crate) fn refactor_sub(sub: &mut SubDef, opts: RefactorOptions) {
    if !opts.enabled {
        return;
    }
    let cap = u16::try_from(sub.captures.len()).unwrap_or(u16::MAX);
    let lex = u16::try_from(sub.pad.len()).unwrap_or(u16::MAX);
    let orig_cap = if sub.inherits_pad { sub.parent_cap_len } else { cap };
    let shape = PadShape { cap, lex, orig_cap };
    refactor_block(&mut sub.body, shape, sub.package.clone(), opts, true);
}

fn refactor_block(
    block: &mut Block,
    shape: PadShape,
    package: crate::value::RcStr,
    opts: RefactorOptions,
    is_sub_body: bool,
) {
    // Recurse into control-structure bodies first: a while body can be huge
    // on its own even when the enclosing block is fine.
    for stmt in &mut block.stmts {
        match &mut stmt.kind {
            StmtKind::If { then, elsifs, else_, .. } => {
                refactor_block(then, shape, package.clone(), opts, false);
                for (_, b) in elsifs {
                    refactor_block(b, shape, package.clone(), opts, false);
                }
                if let Some(b) = else_ {
                    refactor_block(b, shape, package.clone(), opts, false);
                }
            }
            StmtKind::While { body, cont, .. } => {
                refactor_block(body, shape, package.clone(), opts, false);
                if let Some(c) = cont {
                    refactor_block(c, shape, package.clone(), opts, false);
                }
            }
            StmtKind::DoWhile { body, .. } | StmtKind::BareBlock { body, .. } => {
                refactor_block(body, shape, package.clone(), opts, false);
            }
            StmtKind::ForC { body, .. } | StmtKind::Foreach { body, .. } => {
                refactor_block(body, shape, package.clone(), opts, false);
            }
            StmtKind::TryCatch { body, catch, finally, .. } => {
                refactor_block(body, shape, package.clone(), opts, false);
                refactor_block(catch, shape, package.clone(), opts, false);
                if let Some(f) = finally {
                    refactor_block(f, shape, package.clone(), opts, false);
                }
            }
            _ => {}
        }
    }

    let estimated = estimate_block(block);
    if estimated <= opts.threshold {
        return;
    }

    // Whole-body wrap: only for a sub body whose statements cannot jump out.
    if is_sub_body && block.stmts.iter().all(|s| stmt_safe_for_wrap(s)) {
        let line = block.stmts.first().map_or(1, |s| s.line);
        let inner = std::mem::take(&mut block.stmts);
        let wrapped = wrap_closure(inner, shape, package.clone(), line, true);
        block.stmts = vec![Stmt { kind: StmtKind::Return(Some(wrapped)), line }];
        // The moved body may itself still be oversized; chunk it.
        if let StmtKind::Return(Some(expr)) = &mut block.stmts[0].kind
            && let ExprKind::SubCall { callee: Callee::Expr(callee), .. } = &mut expr.kind
            && let ExprKind::AnonSub(sub) = &mut callee.kind
        {
            let sub = Rc::get_mut(sub).unwrap_or_else(|| unreachable!("freshly built sub is unshared"));
            // Inside the wrapper, the whole original pad is the capture block.
            let inner_shape = PadShape { cap: shape.cap + shape.lex, lex: 0, orig_cap: shape.orig_cap };
            chunk_statements(&mut sub.body, inner_shape, package, opts);
        }
        return;
    }

    chunk_statements(block, shape, package, opts);
}

/// Splits contiguous safe statement runs into immediately-invoked closures.
fn chunk_statements(block: &mut Block, shape: PadShape, package: crate::value::RcStr, opts: RefactorOptions) {
    let stmts = std::mem::take(&mut block.stmts);
    let mut out: Vec<Stmt> = Vec::new();
    let mut run: Vec<Stmt> = Vec::new();
    let mut run_size = 0usize;

    let flush = |out: &mut Vec<Stmt>, run: &mut Vec<Stmt>, run_size: &mut usize| {
        if run.is_empty() {
            return;
        }
        if *run_size >= opts.chunk_min {
            let line = run.first().map_or(1, |s| s.line);
            let inner = std::mem::take(run);
            let call = wrap_closure(inner, shape, package.clone(), line, false);
            out.push(Stmt { kind: StmtKind::Expr(call), line });
        } else {
            out.append(run);
        }
        *run_size = 0;
    };

    for stmt in stmts {
        let size = estimate_stmt(&stmt);
        if stmt_safe_for_chunk(&stmt) {
            // Keep chunks near the threshold so each stays well under the cap.
            if run_size + size > opts.threshold {
                flush(&mut out, &mut run, &mut run_size);
            }
            run_size += size;
            run.push(stmt);
        } else {
            flush(&mut out, &mut run, &mut run_size);
            out.push(stmt);
        }
    }
    flush(&mut out, &mut run, &mut run_size);
    block.stmts = out;
}

/// Builds `sub { STMTS }->(@_)` (or `->()`), inheriting the parent pad.
fn wrap_closure(
    stmts: Vec<Stmt>,
    shape: PadShape,
    package: crate::value::RcStr,
    line: u32,
    pass_args: bool,
) -> Expr {
    let captures = (0..shape.cap)
        .map(crate::ast::CaptureSource::ParentCapture)
        .chain((0..shape.lex).map(crate::ast::CaptureSource::ParentLexical))
        .collect();
    let sub = Rc::new(SubDef {
        name: None,
        package,
        body: Block { stmts },
        pad: Vec::new(),
        captures,
        prototype: None,
        inherits_pad: true,
        parent_cap_len: shape.orig_cap,
        line,
    });
    let callee = Expr { kind: ExprKind::AnonSub(sub), line };
    let args = if pass_args { vec![Expr { kind: ExprKind::ArgsArray, line }] } else { Vec::new() };
    Expr { kind: ExprKind::SubCall { callee: Callee::Expr(Box::new(callee)), args }, line }
}

// ---- safety analysis ----

/// Safe to move into a whole-body closure: `return` keeps its meaning (the
/// wrapper returns the call result), but loop controls may not escape.
fn stmt_safe_for_wrap(stmt: &Stmt) -> bool {
    !stmt_has_escaping_loop_ctl(stmt, 0)
}

/// Safe to move into a mid-block chunk: additionally no `return`, no
/// declarations (their slots must be created by the frame that owns them),
/// and no `wantarray` surprises from expressions that read the frame.
fn stmt_safe_for_chunk(stmt: &Stmt) -> bool {
    if stmt_has_escaping_loop_ctl(stmt, 0) {
        return false;
    }
    if stmt_contains_return(stmt) {
        return false;
    }
    !stmt_declares(stmt)
}

fn stmt_has_escaping_loop_ctl(stmt: &Stmt, loop_depth: usize) -> bool {
    match &stmt.kind {
        StmtKind::LoopCtl { label, .. } => {
            // A label always targets an enclosing (possibly outer) loop; a
            // bare control escapes only when no loop wraps it here.
            label.is_some() || loop_depth == 0
        }
        StmtKind::If { then, elsifs, else_, .. } => {
            then.stmts.iter().any(|s| stmt_has_escaping_loop_ctl(s, loop_depth))
                || elsifs.iter().any(|(_, b)| b.stmts.iter().any(|s| stmt_has_escaping_loop_ctl(s, loop_depth)))
                || else_
                    .as_ref()
                    .is_some_and(|b| b.stmts.iter().any(|s| stmt_has_escaping_loop_ctl(s, loop_depth)))
        }
        StmtKind::While { body, cont, .. } => {
            body.stmts.iter().any(|s| stmt_has_escaping_loop_ctl(s, loop_depth + 1))
                || cont
                    .as_ref()
                    .is_some_and(|b| b.stmts.iter().any(|s| stmt_has_escaping_loop_ctl(s, loop_depth + 1)))
        }
        StmtKind::DoWhile { body, .. } => body.stmts.iter().any(|s| stmt_has_escaping_loop_ctl(s, loop_depth + 1)),
        StmtKind::ForC { body, .. } | StmtKind::Foreach { body, .. } => {
            body.stmts.iter().any(|s| stmt_has_escaping_loop_ctl(s, loop_depth + 1))
        }
        StmtKind::BareBlock { body, .. } => {
            body.stmts.iter().any(|s| stmt_has_escaping_loop_ctl(s, loop_depth + 1))
        }
        StmtKind::TryCatch { body, catch, finally, .. } => {
            body.stmts.iter().any(|s| stmt_has_escaping_loop_ctl(s, loop_depth))
                || catch.stmts.iter().any(|s| stmt_has_escaping_loop_ctl(s, loop_depth))
                || finally
                    .as_ref()
                    .is_some_and(|b| b.stmts.iter().any(|s| stmt_has_escaping_loop_ctl(s, loop_depth)))
        }
        _ => false,
    }
}

fn stmt_contains_return(stmt: &Stmt) -> bool {
    match &stmt.kind {
        StmtKind::Return(_) => true,
        StmtKind::If { then, elsifs, else_, .. } => {
            then.stmts.iter().any(stmt_contains_return)
                || elsifs.iter().any(|(_, b)| b.stmts.iter().any(stmt_contains_return))
                || else_.as_ref().is_some_and(|b| b.stmts.iter().any(stmt_contains_return))
        }
        StmtKind::While { body, cont, .. } => {
            body.stmts.iter().any(stmt_contains_return)
                || cont.as_ref().is_some_and(|b| b.stmts.iter().any(stmt_contains_return))
        }
        StmtKind::DoWhile { body, .. } | StmtKind::BareBlock { body, .. } => {
            body.stmts.iter().any(stmt_contains_return)
        }
        StmtKind::ForC { body, .. } | StmtKind::Foreach { body, .. } => {
            body.stmts.iter().any(stmt_contains_return)
        }
        StmtKind::TryCatch { body, catch, finally, .. } => {
            body.stmts.iter().any(stmt_contains_return)
                || catch.stmts.iter().any(stmt_contains_return)
                || finally.as_ref().is_some_and(|b| b.stmts.iter().any(stmt_contains_return))
        }
        _ => false,
    }
}

/// Whether the statement introduces pad slots (any `my`/`state`, the foreach
/// loop variable, a named sub that closes over the frame).
fn stmt_declares(stmt: &Stmt) -> bool {
    match &stmt.kind {
        StmtKind::Expr(e) | StmtKind::Return(Some(e)) => expr_declares(e),
        StmtKind::If { cond, then, elsifs, else_ } => {
            expr_declares(cond)
                || then.stmts.iter().any(stmt_declares)
                || elsifs.iter().any(|(c, b)| expr_declares(c) || b.stmts.iter().any(stmt_declares))
                || else_.as_ref().is_some_and(|b| b.stmts.iter().any(stmt_declares))
        }
        StmtKind::While { cond, body, cont, .. } => {
            expr_declares(cond)
                || body.stmts.iter().any(stmt_declares)
                || cont.as_ref().is_some_and(|b| b.stmts.iter().any(stmt_declares))
        }
        StmtKind::DoWhile { body, cond, .. } => expr_declares(cond) || body.stmts.iter().any(stmt_declares),
        StmtKind::ForC { init, cond, step, body, .. } => {
            init.as_ref().is_some_and(expr_declares)
                || cond.as_ref().is_some_and(expr_declares)
                || step.as_ref().is_some_and(expr_declares)
                || body.stmts.iter().any(stmt_declares)
        }
        StmtKind::Foreach { var, list, body, .. } => {
            matches!(var, crate::ast::ForeachVar::Lexical(_))
                || expr_declares(list)
                || body.stmts.iter().any(stmt_declares)
        }
        StmtKind::BareBlock { body, .. } => body.stmts.iter().any(stmt_declares),
        StmtKind::TryCatch { .. } => true,
        StmtKind::SubDecl(_) => true,
        _ => false,
    }
}

fn expr_declares(expr: &Expr) -> bool {
    let mut found = false;
    walk_expr(expr, &mut |e| {
        if matches!(e.kind, ExprKind::Decl { .. } | ExprKind::AnonSub(_) | ExprKind::EvalString { .. }) {
            found = true;
        }
    });
    found
}

// ---- size estimation ----

/// Calibrated per-node costs (bytes of emitted code). The shape matters more
/// than exactness: every node pays a base word cost and containers pay per
/// element, which tracks how the generator emits loads, stores, and list
/// plumbing.
const STMT_BASE: usize = 6;
const EXPR_BASE: usize = 8;

pub(crate) fn estimate_block(block: &Block) -> usize {
    block.stmts.iter().map(estimate_stmt).sum()
}

pub(crate) fn estimate_stmt(stmt: &Stmt) -> usize {
    let mut size = STMT_BASE;
    match &stmt.kind {
        StmtKind::Expr(e) | StmtKind::Return(Some(e)) => size += estimate_expr(e),
        StmtKind::If { cond, then, elsifs, else_ } => {
            size += estimate_expr(cond) + estimate_block(then) + 8;
            for (c, b) in elsifs {
                size += estimate_expr(c) + estimate_block(b) + 8;
            }
            if let Some(b) = else_ {
                size += estimate_block(b) + 4;
            }
        }
        StmtKind::While { cond, body, cont, .. } => {
            size += estimate_expr(cond) + estimate_block(body) + 16;
            if let Some(c) = cont {
                size += estimate_block(c);
            }
        }
        StmtKind::DoWhile { body, cond, .. } => size += estimate_block(body) + estimate_expr(cond) + 12,
        StmtKind::ForC { init, cond, step, body, .. } => {
            size += init.as_ref().map_or(0, estimate_expr)
                + cond.as_ref().map_or(0, estimate_expr)
                + step.as_ref().map_or(0, estimate_expr)
                + estimate_block(body)
                + 20;
        }
        StmtKind::Foreach { list, body, .. } => size += estimate_expr(list) + estimate_block(body) + 24,
        StmtKind::BareBlock { body, .. } => size += estimate_block(body) + 8,
        StmtKind::TryCatch { body, catch, finally, .. } => {
            size += estimate_block(body) + estimate_block(catch) + 24;
            if let Some(f) = finally {
                size += estimate_block(f);
            }
        }
        StmtKind::SubDecl(_) => size += 8,
        StmtKind::Return(None) | StmtKind::LoopCtl { .. } | StmtKind::Empty => size += 2,
    }
    size
}

fn estimate_expr(expr: &Expr) -> usize {
    let mut size = 0usize;
    walk_expr(expr, &mut |_| size += EXPR_BASE);
    size
}

/// Pre-order walk over an expression tree (statements inside nested blocks
/// are not entered; nested subs pay a flat cost at their site).
pub(crate) fn walk_expr(expr: &Expr, f: &mut impl FnMut(&Expr)) {
    f(expr);
    match &expr.kind {
        ExprKind::Interp(parts) => {
            for p in parts {
                if let InterpPart::Scalar(e) | InterpPart::Join(e) = p {
                    walk_expr(e, f);
                }
            }
        }
        ExprKind::Deref { expr, .. } | ExprKind::LastIndex(expr) | ExprKind::RefTo(expr) | ExprKind::Local { target: expr } => {
            walk_expr(expr, f);
        }
        ExprKind::ArrayElem { array: a, index: b }
        | ExprKind::HashElem { hash: a, key: b }
        | ExprKind::ArraySlice { array: a, indices: b }
        | ExprKind::HashSlice { hash: a, keys: b }
        | ExprKind::KvSlice { hash: a, keys: b }
        | ExprKind::Assign { target: a, value: b }
        | ExprKind::OpAssign { target: a, value: b, .. }
        | ExprKind::LogAssign { target: a, value: b, .. }
        | ExprKind::Binary { left: a, right: b, .. }
        | ExprKind::Logical { left: a, right: b, .. }
        | ExprKind::Range { from: a, to: b }
        | ExprKind::MatchBind { target: a, pattern: b, .. } => {
            walk_expr(a, f);
            walk_expr(b, f);
        }
        ExprKind::Ternary { cond, then, else_ } => {
            walk_expr(cond, f);
            walk_expr(then, f);
            walk_expr(else_, f);
        }
        ExprKind::Unary { operand, .. } | ExprKind::Incr { target: operand, .. } => walk_expr(operand, f),
        ExprKind::List(items) | ExprKind::AnonArray(items) | ExprKind::AnonHash(items) => {
            for e in items {
                walk_expr(e, f);
            }
        }
        ExprKind::SubCall { callee, args } => {
            if let Callee::Expr(e) = callee {
                walk_expr(e, f);
            }
            for e in args {
                walk_expr(e, f);
            }
        }
        ExprKind::MethodCall { invocant, args, .. } => {
            walk_expr(invocant, f);
            for e in args {
                walk_expr(e, f);
            }
        }
        ExprKind::FuncCall { args, .. } => {
            for e in args {
                walk_expr(e, f);
            }
        }
        ExprKind::Sort { args, .. } | ExprKind::Map { args, .. } | ExprKind::Grep { args, .. } => {
            for e in args {
                walk_expr(e, f);
            }
        }
        ExprKind::Match { target, .. } => {
            if let Some(t) = target {
                walk_expr(t, f);
            }
        }
        ExprKind::Subst { target, replacement, .. } => {
            if let Some(t) = target {
                walk_expr(t, f);
            }
            for p in replacement {
                if let InterpPart::Scalar(e) | InterpPart::Join(e) = p {
                    walk_expr(e, f);
                }
            }
        }
        ExprKind::Trans { target, .. } => {
            if let Some(t) = target {
                walk_expr(t, f);
            }
        }
        ExprKind::ReadLine { handle } => walk_expr(handle, f),
        ExprKind::EvalString { code, .. } => walk_expr(code, f),
        ExprKind::NamedCapture { key } => walk_expr(key, f),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::ast::{BinOp, DeclSlot, Sigil};

    fn int(n: i64) -> Expr {
        Expr { kind: ExprKind::IntLit(n), line: 1 }
    }

    fn add_assign_stmt() -> Stmt {
        // `$x += 1;` with $x at pad slot 0.
        let target = Expr { kind: ExprKind::Lexical { slot: 0, sigil: Sigil::Scalar }, line: 1 };
        let expr = Expr {
            kind: ExprKind::OpAssign { op: BinOp::Add, target: Box::new(target), value: Box::new(int(1)) },
            line: 1,
        };
        Stmt { kind: StmtKind::Expr(expr), line: 1 }
    }

    fn decl_stmt() -> Stmt {
        let decl = Expr {
            kind: ExprKind::Decl {
                slots: vec![DeclSlot { slot: 0, sigil: Sigil::Scalar, persist: None }],
                declared_ref: false,
                paren: false,
            },
            line: 1,
        };
        let expr = Expr { kind: ExprKind::Assign { target: Box::new(decl), value: Box::new(int(0)) }, line: 1 };
        Stmt { kind: StmtKind::Expr(expr), line: 1 }
    }

    fn big_sub(n: usize) -> SubDef {
        let mut stmts = vec![decl_stmt()];
        for _ in 0..n {
            stmts.push(add_assign_stmt());
        }
        SubDef {
            name: None,
            package: Rc::from("main"),
            body: Block { stmts },
            pad: vec![crate::ast::PadEntry { name: Rc::from("x"), sigil: Sigil::Scalar, persist_id: None }],
            captures: Vec::new(),
            prototype: None,
            inherits_pad: false,
            parent_cap_len: 0,
            line: 1,
        }
    }

    #[test]
    fn small_bodies_are_untouched() {
        let mut sub = big_sub(10);
        let before = sub.body.stmts.len();
        refactor_sub(&mut sub, RefactorOptions { enabled: true, ..Default::default() });
        assert_eq!(sub.body.stmts.len(), before);
    }

    #[test]
    fn disabled_refactorer_is_inert() {
        let mut sub = big_sub(10_000);
        refactor_sub(&mut sub, RefactorOptions { enabled: false, ..Default::default() });
        assert_eq!(sub.body.stmts.len(), 10_001);
    }

    #[test]
    fn oversized_body_wraps_and_chunks() {
        let mut sub = big_sub(10_000);
        let opts = RefactorOptions { enabled: true, ..Default::default() };
        refactor_sub(&mut sub, opts);
        // The body became a single return of an invoked closure.
        assert_eq!(sub.body.stmts.len(), 1);
        let StmtKind::Return(Some(expr)) = &sub.body.stmts[0].kind else {
            panic!("expected return-wrapped body");
        };
        let ExprKind::SubCall { callee: Callee::Expr(callee), .. } = &expr.kind else {
            panic!("expected closure invocation");
        };
        let ExprKind::AnonSub(inner) = &callee.kind else { panic!("expected anon sub") };
        assert!(inner.inherits_pad);
        // The inner body was chunked: far fewer statements than 10_001, each
        // chunk itself an invoked closure, and each under the threshold.
        assert!(inner.body.stmts.len() < 100, "expected chunks, got {}", inner.body.stmts.len());
        let mut chunks = 0;
        for stmt in &inner.body.stmts {
            if let StmtKind::Expr(e) = &stmt.kind
                && let ExprKind::SubCall { callee: Callee::Expr(c), .. } = &e.kind
                && let ExprKind::AnonSub(chunk) = &c.kind
            {
                chunks += 1;
                assert!(chunk.inherits_pad);
                assert!(estimate_block(&chunk.body) <= opts.threshold);
            }
        }
        assert!(chunks >= 2, "expected multiple chunks, got {chunks}");
    }

    #[test]
    fn declarations_stay_at_parent_level() {
        let mut sub = big_sub(10_000);
        let opts = RefactorOptions { enabled: true, ..Default::default() };
        refactor_sub(&mut sub, opts);
        let StmtKind::Return(Some(expr)) = &sub.body.stmts[0].kind else { panic!() };
        let ExprKind::SubCall { callee: Callee::Expr(callee), .. } = &expr.kind else { panic!() };
        let ExprKind::AnonSub(inner) = &callee.kind else { panic!() };
        // First statement of the moved body is still the bare declaration.
        assert!(matches!(&inner.body.stmts[0].kind, StmtKind::Expr(e)
            if matches!(&e.kind, ExprKind::Assign { target, .. }
                if matches!(target.kind, ExprKind::Decl { .. }))));
    }

    #[test]
    fn loop_controls_block_wrapping() {
        let mut sub = big_sub(10_000);
        sub.body.stmts.push(Stmt {
            kind: StmtKind::LoopCtl { kind: crate::error::LoopKind::Last, label: None },
            line: 1,
        });
        let opts = RefactorOptions { enabled: true, ..Default::default() };
        refactor_sub(&mut sub, opts);
        // No whole-body wrap; chunking still happened around the unsafe tail.
        assert!(sub.body.stmts.len() > 1);
        assert!(matches!(sub.body.stmts.last().map(|s| &s.kind), Some(StmtKind::LoopCtl { .. })));
    }
}
