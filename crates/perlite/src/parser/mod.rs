//! The recursive-descent parser.
//!
//! Statements live here; the precedence-climbing expression grammar is in
//! [`expr`], the string/regex interpolation sub-parsers in [`quote`], and the
//! class-feature desugar in [`class`]. The parser owns the scoped symbol
//! tables and pulls tokens from the lexer with an explicit term/operator
//! expectation, which is what lets Perl's `/`, `<<`, and `%` ambiguities
//! resolve.
//!
//! BEGIN blocks compile and run the moment their closing brace parses, against
//! the same interpreter context the rest of the program will use; their side
//! effects (packages, `@INC`, installed subs, persistent lexicals) are visible
//! to the remainder of the parse.

mod class;
pub(crate) mod expr;
pub(crate) mod quote;

use std::rc::Rc;

use ahash::AHashSet;

use crate::{
    ast::{Block, Expr, ExprKind, ForeachVar, SubDef, Stmt, StmtKind},
    error::{LoopKind, ParseError, ParseResult},
    interp::Interp,
    lexer::{Expect, Lexer, Token, TokenKind},
    resource::ResourceTracker,
    symbols::{ScopeSnapshot, ScopeStack},
    value::RcStr,
    warnings::{self, WarningCategory},
};

/// Lexically scoped pragma state.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Features {
    pub strict_vars: bool,
    pub strict_subs: bool,
    pub strict_refs: bool,
    pub say: bool,
    pub signatures: bool,
    pub class: bool,
    pub try_feature: bool,
    pub declared_refs: bool,
    pub warn_mask: u64,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            strict_vars: false,
            strict_subs: false,
            strict_refs: false,
            say: false,
            signatures: false,
            class: false,
            try_feature: false,
            declared_refs: false,
            warn_mask: warnings::NO_WARNINGS,
        }
    }
}

pub(crate) struct Parser<'i, T: ResourceTracker> {
    lexer: Lexer,
    /// Pushed-back tokens, innermost last.
    pending: Vec<(Expect, Token)>,
    pub(crate) scopes: ScopeStack,
    pub(crate) interp: &'i mut Interp<T>,
    pub(crate) package: RcStr,
    pub(crate) feats: Features,
    /// Fully qualified names of subs seen so far (parsed or BEGIN-installed),
    /// so barewords can be calls.
    pub(crate) declared_subs: AHashSet<String>,
    /// Current sub nesting depth; 0 is the program top level.
    pub(crate) sub_depth: usize,
    /// Active `class` block, when the feature is in use.
    pub(crate) class_state: Option<class::ClassState>,
}

/// Parses a complete program into its top-level body.
pub(crate) fn parse_program<T: ResourceTracker>(
    source: &str,
    name: &str,
    interp: &mut Interp<T>,
) -> ParseResult<Rc<SubDef>> {
    let feats = interp.default_features();
    let mut parser = Parser {
        lexer: Lexer::new(source, name),
        pending: Vec::new(),
        scopes: ScopeStack::new(),
        interp,
        package: Rc::from("main"),
        feats,
        declared_subs: AHashSet::new(),
        sub_depth: 0,
        class_state: None,
    };
    let body = parser.parse_statements_until_eof()?;
    let next_persist = parser.scopes.next_persist_id();
    let (pad, captures) = parser.scopes.leave_sub();
    parser.interp.reserve_persist_ids(next_persist);
    Ok(Rc::new(SubDef {
        name: None,
        package: Rc::from("main"),
        body,
        pad,
        captures,
        prototype: None,
        inherits_pad: false,
        parent_cap_len: 0,
        line: 1,
    }))
}

/// Parses an `eval STRING` body at runtime against the caller's snapshot.
pub(crate) fn parse_eval<T: ResourceTracker>(
    source: &str,
    snapshot: Rc<ScopeSnapshot>,
    package: RcStr,
    feats: Features,
    interp: &mut Interp<T>,
) -> ParseResult<Rc<SubDef>> {
    let persist_base = interp.persist_id_watermark();
    let mut parser = Parser {
        lexer: Lexer::new(source, "(eval)"),
        pending: Vec::new(),
        scopes: ScopeStack::for_eval(snapshot, persist_base),
        interp,
        package: Rc::clone(&package),
        feats,
        declared_subs: AHashSet::new(),
        sub_depth: 0,
        class_state: None,
    };
    let body = parser.parse_statements_until_eof()?;
    let next_persist = parser.scopes.next_persist_id();
    let (pad, captures) = parser.scopes.leave_sub();
    parser.interp.reserve_persist_ids(next_persist);
    Ok(Rc::new(SubDef {
        name: None,
        package,
        body,
        pad,
        captures,
        prototype: None,
        inherits_pad: false,
        parent_cap_len: 0,
        line: 1,
    }))
}

impl<T: ResourceTracker> Parser<'_, T> {
    // ---- token plumbing ----

    pub(crate) fn next(&mut self, expect: Expect) -> ParseResult<Token> {
        // A replayed token keeps whatever shape it was lexed with. That is
        // only safe because the grammar re-reads under a different
        // expectation solely at points where both lex the same (punctuation
        // and identifiers); the genuinely ambiguous probes (`print $fh ...`)
        // rewind the lexer instead of replaying.
        if let Some((_, tok)) = self.pending.pop() {
            return Ok(tok);
        }
        self.lexer.next_token(expect)
    }

    pub(crate) fn unread(&mut self, expect: Expect, token: Token) {
        self.pending.push((expect, token));
    }

    pub(crate) fn peek(&mut self, expect: Expect) -> ParseResult<Token> {
        let tok = self.next(expect)?;
        self.unread(expect, tok.clone());
        Ok(tok)
    }

    pub(crate) fn eat_op(&mut self, op: &str) -> ParseResult<bool> {
        let tok = self.next(Expect::Operator)?;
        if tok.is_op(op) {
            Ok(true)
        } else {
            self.unread(Expect::Operator, tok);
            Ok(false)
        }
    }

    pub(crate) fn expect_op(&mut self, op: &str) -> ParseResult<()> {
        let tok = self.next(Expect::Operator)?;
        if tok.is_op(op) {
            Ok(())
        } else {
            Err(self.error_at(&tok, format!("syntax error, expecting \"{op}\" near \"{}\"", tok.text)))
        }
    }

    /// Like [`Self::expect_op`] but pulled with term expectation, for places
    /// where an opening delimiter is what must come next.
    pub(crate) fn expect_term_op(&mut self, op: &str) -> ParseResult<()> {
        let tok = self.next(Expect::Term)?;
        if tok.is_op(op) {
            Ok(())
        } else {
            Err(self.error_at(&tok, format!("syntax error, expecting \"{op}\" near \"{}\"", tok.text)))
        }
    }

    pub(crate) fn error_at(&self, tok: &Token, message: impl Into<String>) -> ParseError {
        ParseError::new(message, tok.file.to_string(), tok.line)
    }

    pub(crate) fn error_here(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(message, self.lexer.file().to_string(), self.lexer.line())
    }

    // ---- statements ----

    fn parse_statements_until_eof(&mut self) -> ParseResult<Block> {
        let mut stmts = Vec::new();
        loop {
            let tok = self.peek(Expect::Term)?;
            if tok.kind == TokenKind::Eof {
                break;
            }
            if let Some(stmt) = self.parse_statement()? {
                stmts.push(stmt);
            }
        }
        Ok(Block { stmts })
    }

    /// Parses `{ ... }` as a scope, saving lexical pragma state.
    pub(crate) fn parse_block(&mut self) -> ParseResult<Block> {
        self.expect_term_op("{")?;
        self.parse_block_rest()
    }

    /// The body after an already-consumed `{`.
    pub(crate) fn parse_block_rest(&mut self) -> ParseResult<Block> {
        let saved_feats = self.feats;
        let saved_pkg = Rc::clone(&self.package);
        self.scopes.enter_scope();
        let mut stmts = Vec::new();
        loop {
            let tok = self.peek(Expect::Term)?;
            if tok.kind == TokenKind::Eof {
                return Err(self.error_at(&tok, "Missing right curly or square bracket"));
            }
            if tok.is_op("}") {
                self.next(Expect::Term)?;
                break;
            }
            if let Some(stmt) = self.parse_statement()? {
                stmts.push(stmt);
            }
        }
        self.scopes.leave_scope();
        self.feats = saved_feats;
        self.package = saved_pkg;
        Ok(Block { stmts })
    }

    fn parse_statement(&mut self) -> ParseResult<Option<Stmt>> {
        let tok = self.next(Expect::Term)?;
        let line = tok.line;

        if tok.is_op(";") {
            return Ok(Some(Stmt { kind: StmtKind::Empty, line }));
        }
        if tok.is_op("{") {
            let body = self.parse_block_rest()?;
            return Ok(Some(Stmt { kind: StmtKind::BareBlock { label: None, body }, line }));
        }

        if tok.kind == TokenKind::Ident {
            // LABEL: loop — needs one more token of lookahead.
            if tok.text.chars().next().is_some_and(char::is_uppercase) {
                let colon = self.next(Expect::Operator)?;
                if colon.is_op(":") {
                    let label: RcStr = Rc::from(tok.text.as_str());
                    return self.parse_labeled(label, line).map(Some);
                }
                self.unread(Expect::Operator, colon);
            }

            match tok.text.as_str() {
                "if" | "unless" => return self.parse_if(tok.text == "unless", line).map(Some),
                "while" | "until" => return self.parse_while(None, tok.text == "until", line).map(Some),
                "for" | "foreach" => return self.parse_for(None, line).map(Some),
                "sub" => {
                    let name = self.peek(Expect::Term)?;
                    if name.kind == TokenKind::Ident {
                        return self.parse_named_sub(line).map(Some);
                    }
                    // Anonymous sub in expression position; fall through.
                }
                "package" => return self.parse_package(line),
                "use" => return self.parse_use(true, line),
                "no" => return self.parse_use(false, line),
                "BEGIN" | "END" | "CHECK" | "INIT" | "UNITCHECK" => {
                    let brace = self.peek(Expect::Term)?;
                    if brace.is_op("{") {
                        let phase = tok.text.clone();
                        self.parse_phase_block(&phase, line)?;
                        return Ok(Some(Stmt { kind: StmtKind::Empty, line }));
                    }
                }
                "return" => {
                    let next = self.peek(Expect::Term)?;
                    let value = if next.is_op(";") || next.is_op("}") || next.kind == TokenKind::Eof {
                        None
                    } else if next.kind == TokenKind::Ident
                        && matches!(next.text.as_str(), "if" | "unless" | "while" | "until")
                    {
                        None
                    } else {
                        Some(self.parse_expr()?)
                    };
                    let stmt = Stmt { kind: StmtKind::Return(value), line };
                    return self.finish_simple_statement(stmt, line).map(Some);
                }
                "last" | "next" | "redo" => {
                    let kind = match tok.text.as_str() {
                        "last" => LoopKind::Last,
                        "next" => LoopKind::Next,
                        _ => LoopKind::Redo,
                    };
                    let label = {
                        let next = self.peek(Expect::Term)?;
                        if next.kind == TokenKind::Ident
                            && !matches!(next.text.as_str(), "if" | "unless" | "while" | "until")
                        {
                            self.next(Expect::Term)?;
                            Some(Rc::from(next.text.as_str()))
                        } else {
                            None
                        }
                    };
                    let stmt = Stmt { kind: StmtKind::LoopCtl { kind, label }, line };
                    return self.finish_simple_statement(stmt, line).map(Some);
                }
                "do" => {
                    let next = self.peek(Expect::Term)?;
                    if next.is_op("{") {
                        // `do BLOCK while COND` is the one post-tested loop.
                        let body = self.parse_block()?;
                        let after = self.peek(Expect::Term)?;
                        if after.kind == TokenKind::Ident && matches!(after.text.as_str(), "while" | "until") {
                            self.next(Expect::Term)?;
                            let until = after.text == "until";
                            let cond = self.parse_expr()?;
                            self.end_statement()?;
                            return Ok(Some(Stmt { kind: StmtKind::DoWhile { body, cond, until }, line }));
                        }
                        let expr = Expr { kind: ExprKind::DoBlock(body), line };
                        let stmt = Stmt { kind: StmtKind::Expr(expr), line };
                        return self.finish_simple_statement(stmt, line).map(Some);
                    }
                }
                "format" => {
                    self.parse_format(line)?;
                    return Ok(Some(Stmt { kind: StmtKind::Empty, line }));
                }
                "try" if self.feats.try_feature => {
                    let brace = self.peek(Expect::Term)?;
                    if brace.is_op("{") {
                        return self.parse_try(line).map(Some);
                    }
                }
                "class" if self.feats.class => {
                    return self.parse_class(line);
                }
                "field" | "method" | "ADJUST" if self.class_state.is_some() => {
                    return self.parse_class_member(&tok.text, line);
                }
                _ => {}
            }
        }

        // Expression statement.
        self.unread(Expect::Term, tok);
        let expr = self.parse_expr()?;
        let stmt = Stmt { kind: StmtKind::Expr(expr), line };
        self.finish_simple_statement(stmt, line).map(Some)
    }

    /// Consumes statement modifiers and the trailing semicolon.
    fn finish_simple_statement(&mut self, stmt: Stmt, line: u32) -> ParseResult<Stmt> {
        let tok = self.peek(Expect::Operator)?;
        if tok.kind == TokenKind::Ident {
            match tok.text.as_str() {
                "if" | "unless" => {
                    self.next(Expect::Operator)?;
                    let negate = tok.text == "unless";
                    let cond = self.parse_expr()?;
                    self.end_statement()?;
                    let body = Block { stmts: vec![stmt] };
                    let cond = if negate { negate_expr(cond) } else { cond };
                    return Ok(Stmt { kind: StmtKind::If { cond, then: body, elsifs: Vec::new(), else_: None }, line });
                }
                "while" | "until" => {
                    self.next(Expect::Operator)?;
                    let until = tok.text == "until";
                    let cond = self.parse_expr()?;
                    self.end_statement()?;
                    let body = Block { stmts: vec![stmt] };
                    return Ok(Stmt { kind: StmtKind::While { label: None, cond, body, until, cont: None }, line });
                }
                "for" | "foreach" => {
                    self.next(Expect::Operator)?;
                    let list = self.parse_expr()?;
                    self.end_statement()?;
                    let body = Block { stmts: vec![stmt] };
                    return Ok(Stmt { kind: StmtKind::Foreach { label: None, var: ForeachVar::Default, list, body }, line });
                }
                _ => {}
            }
        }
        self.end_statement()?;
        Ok(stmt)
    }

    /// A statement ends at `;`, `}` (left for the caller), or EOF.
    fn end_statement(&mut self) -> ParseResult<()> {
        let tok = self.next(Expect::Operator)?;
        if tok.is_op(";") || tok.kind == TokenKind::Eof {
            return Ok(());
        }
        if tok.is_op("}") {
            self.unread(Expect::Operator, tok);
            return Ok(());
        }
        Err(self.error_at(&tok, format!("syntax error near \"{}\"", tok.text)))
    }

    fn parse_labeled(&mut self, label: RcStr, line: u32) -> ParseResult<Stmt> {
        let tok = self.next(Expect::Term)?;
        if tok.kind == TokenKind::Ident {
            match tok.text.as_str() {
                "while" | "until" => return self.parse_while(Some(label), tok.text == "until", line),
                "for" | "foreach" => return self.parse_for(Some(label), line),
                _ => {}
            }
        }
        if tok.is_op("{") {
            let body = self.parse_block_rest()?;
            return Ok(Stmt { kind: StmtKind::BareBlock { label: Some(label), body }, line });
        }
        Err(self.error_at(&tok, "syntax error: label must precede a loop or block"))
    }

    fn parse_if(&mut self, negate: bool, line: u32) -> ParseResult<Stmt> {
        self.expect_term_op("(")?;
        let cond = self.parse_expr()?;
        self.expect_op(")")?;
        let then = self.parse_block()?;
        let mut elsifs = Vec::new();
        let mut else_ = None;
        loop {
            let tok = self.peek(Expect::Term)?;
            if tok.is_ident("elsif") {
                self.next(Expect::Term)?;
                self.expect_term_op("(")?;
                let c = self.parse_expr()?;
                self.expect_op(")")?;
                let b = self.parse_block()?;
                elsifs.push((c, b));
            } else if tok.is_ident("else") {
                self.next(Expect::Term)?;
                else_ = Some(self.parse_block()?);
                break;
            } else {
                break;
            }
        }
        let cond = if negate { negate_expr(cond) } else { cond };
        Ok(Stmt { kind: StmtKind::If { cond, then, elsifs, else_ }, line })
    }

    fn parse_while(&mut self, label: Option<RcStr>, until: bool, line: u32) -> ParseResult<Stmt> {
        self.expect_term_op("(")?;
        let cond = self.parse_expr()?;
        self.expect_op(")")?;
        let body = self.parse_block()?;
        let cont = {
            let tok = self.peek(Expect::Term)?;
            if tok.is_ident("continue") {
                self.next(Expect::Term)?;
                Some(self.parse_block()?)
            } else {
                None
            }
        };
        Ok(Stmt { kind: StmtKind::While { label, cond, body, until, cont }, line })
    }

    fn parse_for(&mut self, label: Option<RcStr>, line: u32) -> ParseResult<Stmt> {
        // `for my $x (LIST)`, `for $x (LIST)`, `for (LIST)`, `for (;;)`.
        let tok = self.next(Expect::Term)?;
        let var = if tok.is_ident("my") || tok.is_ident("state") {
            let v = self.next(Expect::Term)?;
            if v.kind != TokenKind::Var || !v.text.starts_with('$') {
                return Err(self.error_at(&v, "Missing $ on loop variable"));
            }
            let name = v.text[1..].to_string();
            self.scopes.enter_scope();
            let slot = self.scopes.declare_my(&name, crate::ast::Sigil::Scalar);
            let stmt = self.parse_foreach_tail(label, ForeachVar::Lexical(slot), line);
            self.scopes.leave_scope();
            return stmt;
        } else if tok.kind == TokenKind::Var && tok.text.starts_with('$') {
            let name = &tok.text[1..];
            match self.scopes.resolve(name, crate::ast::Sigil::Scalar) {
                Some(crate::symbols::Resolved::Lexical(slot)) => ForeachVar::Lexical(slot),
                _ => ForeachVar::Global(Rc::from(format!("{}::{name}", self.package).as_str())),
            }
        } else if tok.is_op("(") {
            // Could be C-style or a bare list: parse the first expression and
            // let the delimiter decide.
            let probe = self.peek(Expect::Term)?;
            if probe.is_op(";") {
                return self.parse_c_for(label, line);
            }
            let first = self.parse_expr()?;
            let delim = self.next(Expect::Operator)?;
            if delim.is_op(";") {
                self.scopes.enter_scope();
                let cond = {
                    let tok = self.peek(Expect::Term)?;
                    if tok.is_op(";") { None } else { Some(self.parse_expr()?) }
                };
                self.expect_op(";")?;
                let step = {
                    let tok = self.peek(Expect::Term)?;
                    if tok.is_op(")") { None } else { Some(self.parse_expr()?) }
                };
                self.expect_op(")")?;
                let body = self.parse_block()?;
                self.scopes.leave_scope();
                return Ok(Stmt { kind: StmtKind::ForC { label, init: Some(first), cond, step, body }, line });
            }
            if !delim.is_op(")") {
                return Err(self.error_at(&delim, format!("syntax error near \"{}\"", delim.text)));
            }
            let body = self.parse_block()?;
            return Ok(Stmt { kind: StmtKind::Foreach { label, var: ForeachVar::Default, list: first, body }, line });
        } else {
            return Err(self.error_at(&tok, format!("syntax error near \"{}\"", tok.text)));
        };
        self.parse_foreach_tail(label, var, line)
    }

    fn parse_c_for(&mut self, label: Option<RcStr>, line: u32) -> ParseResult<Stmt> {
        // `(` already consumed; the init may be empty.
        self.scopes.enter_scope();
        let init = {
            let tok = self.peek(Expect::Term)?;
            if tok.is_op(";") { None } else { Some(self.parse_expr()?) }
        };
        self.expect_op(";")?;
        let cond = {
            let tok = self.peek(Expect::Term)?;
            if tok.is_op(";") { None } else { Some(self.parse_expr()?) }
        };
        self.expect_op(";")?;
        let step = {
            let tok = self.peek(Expect::Term)?;
            if tok.is_op(")") { None } else { Some(self.parse_expr()?) }
        };
        self.expect_op(")")?;
        let body = self.parse_block()?;
        self.scopes.leave_scope();
        Ok(Stmt { kind: StmtKind::ForC { label, init, cond, step, body }, line })
    }

    fn parse_foreach_tail(&mut self, label: Option<RcStr>, var: ForeachVar, line: u32) -> ParseResult<Stmt> {
        self.expect_term_op("(")?;
        // C-style with a declared variable is not a thing; this is a list.
        let probe = self.peek(Expect::Term)?;
        let list = if probe.is_op(")") {
            Expr { kind: ExprKind::List(Vec::new()), line }
        } else {
            self.parse_expr()?
        };
        // `for my $i (0; $i < n; ...)` is C-style spelled wrong; also catch
        // the plain-variable C-style case `for ($i = 0; ...)`.
        let delim = self.next(Expect::Operator)?;
        if delim.is_op(";") {
            if let ForeachVar::Lexical(_) = var {
                return Err(self.error_at(&delim, "syntax error: C-style loop cannot declare the loop variable"));
            }
            let cond = {
                let tok = self.peek(Expect::Term)?;
                if tok.is_op(";") { None } else { Some(self.parse_expr()?) }
            };
            self.expect_op(";")?;
            let step = {
                let tok = self.peek(Expect::Term)?;
                if tok.is_op(")") { None } else { Some(self.parse_expr()?) }
            };
            self.expect_op(")")?;
            let body = self.parse_block()?;
            return Ok(Stmt { kind: StmtKind::ForC { label, init: Some(list), cond, step, body }, line });
        }
        if !delim.is_op(")") {
            return Err(self.error_at(&delim, format!("syntax error near \"{}\"", delim.text)));
        }
        let body = self.parse_block()?;
        Ok(Stmt { kind: StmtKind::Foreach { label, var, list, body }, line })
    }

    fn parse_try(&mut self, line: u32) -> ParseResult<Stmt> {
        let body = self.parse_block()?;
        let tok = self.next(Expect::Term)?;
        if !tok.is_ident("catch") {
            return Err(self.error_at(&tok, "syntax error: try block must be followed by catch"));
        }
        self.expect_term_op("(")?;
        let var = self.next(Expect::Term)?;
        if var.kind != TokenKind::Var || !var.text.starts_with('$') {
            return Err(self.error_at(&var, "syntax error in catch parameter"));
        }
        self.expect_op(")")?;
        self.scopes.enter_scope();
        let catch_slot = self.scopes.declare_my(&var.text[1..], crate::ast::Sigil::Scalar);
        let catch = self.parse_block()?;
        self.scopes.leave_scope();
        let finally = {
            let tok = self.peek(Expect::Term)?;
            if tok.is_ident("finally") {
                self.next(Expect::Term)?;
                Some(self.parse_block()?)
            } else {
                None
            }
        };
        // Optional trailing semicolon, as in Perl.
        let _ = self.eat_op(";")?;
        Ok(Stmt { kind: StmtKind::TryCatch { body, catch_var: Some(catch_slot), catch, finally }, line })
    }

    // ---- subs ----

    fn parse_named_sub(&mut self, line: u32) -> ParseResult<Stmt> {
        let name_tok = self.next(Expect::Term)?;
        let short = name_tok.text.clone();
        let fq = if short.contains("::") {
            short.clone()
        } else {
            format!("{}::{short}", self.package)
        };
        self.declared_subs.insert(fq.clone());

        // Forward declaration: `sub name;`
        if self.eat_op(";")? {
            return Ok(Stmt { kind: StmtKind::Empty, line });
        }
        let sub = self.parse_sub_tail(Some(Rc::from(short.as_str())), line)?;
        Ok(Stmt { kind: StmtKind::SubDecl(sub), line })
    }

    /// Parses prototype/signature, attributes, and body. The caller has
    /// consumed `sub` and the optional name.
    pub(crate) fn parse_sub_tail(&mut self, name: Option<RcStr>, line: u32) -> ParseResult<Rc<SubDef>> {
        self.scopes.enter_sub(false);
        self.sub_depth += 1;

        let mut prototype = None;
        let mut sig_stmts: Vec<Stmt> = Vec::new();
        let tok = self.peek(Expect::Term)?;
        if tok.is_op("(") {
            if self.feats.signatures {
                sig_stmts = self.parse_signature()?;
            } else {
                prototype = Some(self.parse_prototype()?);
            }
        }
        // Attributes are parsed and discarded.
        while self.eat_op(":")? {
            let attr = self.next(Expect::Term)?;
            if attr.kind != TokenKind::Ident {
                return Err(self.error_at(&attr, "syntax error in sub attribute"));
            }
            let paren = self.peek(Expect::Operator)?;
            if paren.is_op("(") {
                self.next(Expect::Operator)?;
                let mut depth = 1;
                while depth > 0 {
                    let t = self.next(Expect::Term)?;
                    if t.kind == TokenKind::Eof {
                        return Err(self.error_at(&t, "Unterminated attribute list"));
                    }
                    if t.is_op("(") {
                        depth += 1;
                    } else if t.is_op(")") {
                        depth -= 1;
                    }
                }
            }
        }

        let mut body = self.parse_block()?;
        if !sig_stmts.is_empty() {
            sig_stmts.extend(body.stmts);
            body.stmts = sig_stmts;
        }
        self.sub_depth -= 1;
        let (pad, captures) = self.scopes.leave_sub();
        Ok(Rc::new(SubDef {
            name,
            package: Rc::clone(&self.package),
            body,
            pad,
            captures,
            prototype,
            inherits_pad: false,
            parent_cap_len: 0,
            line,
        }))
    }

    /// `($$;@)` — recorded on the code object, consulted only at call sites.
    fn parse_prototype(&mut self) -> ParseResult<RcStr> {
        // Raw scan: prototypes are not expression syntax.
        self.expect_term_op("(")?;
        let mut proto = String::new();
        loop {
            let tok = self.next(Expect::Term)?;
            if tok.is_op(")") {
                break;
            }
            if tok.kind == TokenKind::Eof {
                return Err(self.error_at(&tok, "Missing ')' in prototype"));
            }
            match &tok.kind {
                TokenKind::Var => proto.push_str(&tok.text),
                TokenKind::Op => proto.push_str(&tok.text),
                _ => proto.push_str(&tok.text),
            }
        }
        Ok(Rc::from(proto.as_str()))
    }

    /// `sub f ($a, $b = 5, @rest) { ... }` desugars into assignments from `@_`.
    fn parse_signature(&mut self) -> ParseResult<Vec<Stmt>> {
        self.expect_term_op("(")?;
        let mut stmts = Vec::new();
        let mut index: i64 = 0;
        loop {
            let tok = self.next(Expect::Term)?;
            if tok.is_op(")") {
                break;
            }
            if tok.is_op(",") {
                continue;
            }
            if tok.kind != TokenKind::Var {
                return Err(self.error_at(&tok, "syntax error in subroutine signature"));
            }
            let line = tok.line;
            let sigil = tok.text.chars().next().unwrap_or('$');
            let name = tok.text[1..].to_string();
            match sigil {
                '$' => {
                    let slot = self.scopes.declare_my(&name, crate::ast::Sigil::Scalar);
                    let default = if self.eat_op("=")? { Some(self.parse_assign_expr()?) } else { None };
                    // my $a = @_ > N ? $_[N] : DEFAULT;
                    let arg = Expr {
                        kind: ExprKind::ArrayElem {
                            array: Box::new(Expr { kind: ExprKind::ArgsArray, line }),
                            index: Box::new(Expr { kind: ExprKind::IntLit(index), line }),
                        },
                        line,
                    };
                    let value = match default {
                        None => arg,
                        Some(default) => Expr {
                            kind: ExprKind::Ternary {
                                cond: Box::new(Expr {
                                    kind: ExprKind::Binary {
                                        op: crate::ast::BinOp::NumGt,
                                        left: Box::new(Expr {
                                            kind: ExprKind::FuncCall {
                                                func: crate::ast::Builtin::Scalar,
                                                args: vec![Expr { kind: ExprKind::ArgsArray, line }],
                                            },
                                            line,
                                        }),
                                        right: Box::new(Expr { kind: ExprKind::IntLit(index), line }),
                                    },
                                    line,
                                }),
                                then: Box::new(arg),
                                else_: Box::new(default),
                            },
                            line,
                        },
                    };
                    let decl = Expr {
                        kind: ExprKind::Decl {
                            slots: vec![crate::ast::DeclSlot { slot, sigil: crate::ast::Sigil::Scalar, persist: None }],
                            declared_ref: false, paren: false,
                        },
                        line,
                    };
                    stmts.push(Stmt {
                        kind: StmtKind::Expr(Expr {
                            kind: ExprKind::Assign { target: Box::new(decl), value: Box::new(value) },
                            line,
                        }),
                        line,
                    });
                    index += 1;
                }
                '@' | '%' => {
                    let sig = if sigil == '@' { crate::ast::Sigil::Array } else { crate::ast::Sigil::Hash };
                    let slot = self.scopes.declare_my(&name, sig);
                    // my @rest = @_[N..$#_] — expressed as a splice-free slice.
                    let value = Expr {
                        kind: ExprKind::ArraySlice {
                            array: Box::new(Expr { kind: ExprKind::ArgsArray, line }),
                            indices: Box::new(Expr {
                                kind: ExprKind::Range {
                                    from: Box::new(Expr { kind: ExprKind::IntLit(index), line }),
                                    to: Box::new(Expr {
                                        kind: ExprKind::LastIndex(Box::new(Expr { kind: ExprKind::ArgsArray, line })),
                                        line,
                                    }),
                                },
                                line,
                            }),
                        },
                        line,
                    };
                    let decl = Expr {
                        kind: ExprKind::Decl {
                            slots: vec![crate::ast::DeclSlot { slot, sigil: sig, persist: None }],
                            declared_ref: false, paren: false,
                        },
                        line,
                    };
                    stmts.push(Stmt {
                        kind: StmtKind::Expr(Expr {
                            kind: ExprKind::Assign { target: Box::new(decl), value: Box::new(value) },
                            line,
                        }),
                        line,
                    });
                    let close = self.next(Expect::Term)?;
                    if !close.is_op(")") {
                        return Err(self.error_at(&close, "slurpy parameter must be last in signature"));
                    }
                    break;
                }
                _ => return Err(self.error_at(&tok, "syntax error in subroutine signature")),
            }
        }
        Ok(stmts)
    }

    // ---- packages and phases ----

    fn parse_package(&mut self, line: u32) -> ParseResult<Option<Stmt>> {
        let name_tok = self.next(Expect::Term)?;
        if name_tok.kind != TokenKind::Ident {
            return Err(self.error_at(&name_tok, "syntax error: package requires a name"));
        }
        let name: RcStr = Rc::from(name_tok.text.as_str());
        self.interp.ensure_package(&name);
        let brace = self.peek(Expect::Operator)?;
        if brace.is_op("{") {
            self.next(Expect::Operator)?;
            let saved = Rc::clone(&self.package);
            self.package = Rc::clone(&name);
            let body = self.parse_block_rest()?;
            self.package = saved;
            return Ok(Some(Stmt { kind: StmtKind::BareBlock { label: None, body }, line }));
        }
        self.end_statement()?;
        self.package = name;
        Ok(Some(Stmt { kind: StmtKind::Empty, line }))
    }

    /// BEGIN runs now; the other phases compile now and register with the
    /// context for their boundary. All phase bodies are detached: they run
    /// with no enclosing frame, so outer lexicals they touch go persistent.
    fn parse_phase_block(&mut self, phase: &str, line: u32) -> ParseResult<()> {
        let detached = true;
        self.scopes.enter_sub(detached);
        self.sub_depth += 1;
        let body = self.parse_block()?;
        self.sub_depth -= 1;
        let (pad, captures) = self.scopes.leave_sub();
        let sub = Rc::new(SubDef {
            name: Some(Rc::from(phase)),
            package: Rc::clone(&self.package),
            body,
            pad,
            captures,
            prototype: None,
            inherits_pad: false,
            parent_cap_len: 0,
            line,
        });
        // Trailing semicolon after a phase block is optional.
        let _ = self.eat_op(";")?;
        match phase {
            "BEGIN" => {
                self.interp.reserve_persist_ids(self.scopes.next_persist_id());
                self.interp.run_parse_time_sub(&sub).map_err(|e| {
                    ParseError::new(
                        format!("{e}\nBEGIN failed--compilation aborted"),
                        self.lexer.file().to_string(),
                        line,
                    )
                })?;
                // BEGIN-installed subs become visible barewords.
                self.declared_subs.extend(self.interp.known_subs());
            }
            "END" => self.interp.register_phase_end(&sub, line)?,
            "CHECK" | "UNITCHECK" => self.interp.register_phase_check(&sub, line)?,
            _ => self.interp.register_phase_init(&sub, line)?,
        }
        Ok(())
    }

    fn parse_format(&mut self, _line: u32) -> ParseResult<()> {
        // `format NAME =` or `format =` (STDOUT).
        let tok = self.next(Expect::Term)?;
        let name = if tok.kind == TokenKind::Ident {
            let n = tok.text.clone();
            self.expect_op("=")?;
            n
        } else if tok.is_op("=") {
            "STDOUT".to_string()
        } else {
            return Err(self.error_at(&tok, "Format not terminated"));
        };
        let lines = self.lexer.take_lines_until_dot();
        self.interp.install_format(&self.package, &name, lines);
        Ok(())
    }

    // ---- use / no ----

    fn parse_use(&mut self, enable: bool, line: u32) -> ParseResult<Option<Stmt>> {
        let tok = self.next(Expect::Term)?;

        // `use 5.036;` / `use v5.36;`
        if tok.kind == TokenKind::Number
            || (tok.kind == TokenKind::Ident && tok.text.starts_with('v') && tok.text[1..].chars().all(|c| c.is_ascii_digit()))
        {
            let mut version = tok.text.trim_start_matches('v').to_string();
            loop {
                let next = self.peek(Expect::Operator)?;
                if next.kind == TokenKind::Number && next.text.starts_with('.') {
                    self.next(Expect::Operator)?;
                    version.push_str(&next.text);
                } else if next.is_op(".") {
                    self.next(Expect::Operator)?;
                    let frag = self.next(Expect::Term)?;
                    version.push('.');
                    version.push_str(&frag.text);
                } else {
                    break;
                }
            }
            self.apply_version_pragma(&version);
            self.end_statement()?;
            return Ok(Some(Stmt { kind: StmtKind::Empty, line }));
        }

        if tok.kind != TokenKind::Ident {
            return Err(self.error_at(&tok, "syntax error in use statement"));
        }
        let module = tok.text.clone();

        // `use overload` carries real expression syntax (code refs); it
        // cannot go through the plain-string argument scanner.
        if module == "overload" {
            if enable {
                self.apply_use_overload(line)?;
            }
            self.end_statement()?;
            return Ok(Some(Stmt { kind: StmtKind::Empty, line }));
        }

        let args = self.parse_use_args()?;

        match module.as_str() {
            "strict" => {
                let all = args.is_empty();
                for which in if all { vec!["vars".to_string(), "subs".to_string(), "refs".to_string()] } else { args.clone() } {
                    match which.as_str() {
                        "vars" => self.feats.strict_vars = enable,
                        "subs" => self.feats.strict_subs = enable,
                        "refs" => self.feats.strict_refs = enable,
                        other => {
                            return Err(self.error_here(format!("Unknown 'strict' tag(s) '{other}'")));
                        }
                    }
                }
            }
            "warnings" => {
                let categories: Vec<WarningCategory> =
                    args.iter().filter_map(|a| a.parse().ok()).collect();
                self.feats.warn_mask = warnings::adjust_mask(self.feats.warn_mask, enable, &categories);
            }
            "feature" | "experimental" => {
                for arg in &args {
                    match arg.as_str() {
                        "say" => self.feats.say = enable,
                        "signatures" => self.feats.signatures = enable,
                        "class" => self.feats.class = enable,
                        "try" => self.feats.try_feature = enable,
                        "declared_refs" => self.feats.declared_refs = enable,
                        "state" | "current_sub" | "fc" | "bitwise" | "postderef" | "unicode_strings" => {}
                        other => {
                            return Err(self.error_here(format!("Feature \"{other}\" is not supported")));
                        }
                    }
                }
                if module == "experimental" {
                    // `use experimental 'class'` also silences the category.
                    let categories: Vec<WarningCategory> = args
                        .iter()
                        .filter_map(|a| format!("experimental::{a}").parse().ok())
                        .collect();
                    self.feats.warn_mask = warnings::adjust_mask(self.feats.warn_mask, false, &categories);
                }
            }
            "parent" | "base" => {
                for arg in args.iter().filter(|a| *a != "-norequire") {
                    self.interp.push_isa(&self.package, arg).map_err(|e| {
                        ParseError::new(e, self.lexer.file().to_string(), line)
                    })?;
                }
            }
            "constant" => self.apply_use_constant(&args, line)?,
            "vars" => {
                for arg in &args {
                    if let Some(sigil) = arg.chars().next().and_then(crate::ast::Sigil::from_char) {
                        self.scopes.declare_our(&arg[1..], sigil, &self.package);
                    }
                }
            }
            "lib" => {
                for arg in &args {
                    self.interp.push_inc(arg);
                }
            }
            "integer" | "utf8" | "bytes" | "locale" | "subs" | "filetest" => {}
            other => {
                return Err(self.error_here(format!(
                    "Can't locate {}.pm in @INC (you may need to install the {other} module)",
                    other.replace("::", "/"),
                )));
            }
        }
        self.end_statement()?;
        Ok(Some(Stmt { kind: StmtKind::Empty, line }))
    }

    fn apply_version_pragma(&mut self, version: &str) {
        let (major, minor) = parse_perl_version(version);
        if (major, minor) >= (5, 10) {
            self.feats.say = true;
        }
        if (major, minor) >= (5, 12) {
            self.feats.strict_vars = true;
            self.feats.strict_subs = true;
            self.feats.strict_refs = true;
        }
        if (major, minor) >= (5, 36) {
            self.feats.signatures = true;
            self.feats.warn_mask = warnings::ALL_WARNINGS;
        }
    }

    /// Collects the plain-string arguments of a `use` (strings, qw lists,
    /// barewords, fat commas).
    fn parse_use_args(&mut self) -> ParseResult<Vec<String>> {
        let mut args = Vec::new();
        loop {
            let tok = self.next(Expect::Term)?;
            match &tok.kind {
                TokenKind::Op if tok.text == ";" => {
                    self.unread(Expect::Term, tok);
                    break;
                }
                TokenKind::Eof => {
                    self.unread(Expect::Term, tok);
                    break;
                }
                TokenKind::Op
                    if matches!(tok.text.as_str(), "," | "=>" | "(" | ")" | "{" | "}") => {}
                TokenKind::SingleStr(s) => args.push(s.clone()),
                TokenKind::DoubleStr(s) => args.push(s.clone()),
                TokenKind::QwList(words) => args.extend(words.iter().cloned()),
                TokenKind::Number => args.push(tok.text.clone()),
                TokenKind::Ident => args.push(tok.text.clone()),
                TokenKind::Var => args.push(tok.text.clone()),
                _ => {
                    return Err(self.error_at(&tok, "syntax error in use statement"));
                }
            }
        }
        Ok(args)
    }

    /// `use constant NAME => VALUE;` — the value list is evaluated now, the
    /// way BEGIN blocks run, and a constant sub is installed.
    fn apply_use_constant(&mut self, args: &[String], line: u32) -> ParseResult<()> {
        if args.is_empty() {
            return Ok(());
        }
        let name = args[0].clone();
        let values: Vec<String> = args[1..].to_vec();
        self.interp
            .install_constant(&self.package, &name, &values)
            .map_err(|e| ParseError::new(e, self.lexer.file().to_string(), line))
    }

    /// `use overload '+' => sub {...}, fallback => 1;` — the argument list is
    /// genuine expression syntax (it carries code refs), so it is parsed as a
    /// list and evaluated at parse time.
    fn apply_use_overload(&mut self, line: u32) -> ParseResult<()> {
        // Parse the list expression, wrap it as a sub, run it now.
        self.scopes.enter_sub(true);
        self.sub_depth += 1;
        let list = self.parse_expr()?;
        self.sub_depth -= 1;
        let (pad, captures) = self.scopes.leave_sub();
        let sub = Rc::new(SubDef {
            name: Some(Rc::from("overload::import")),
            package: Rc::clone(&self.package),
            body: Block {
                stmts: vec![Stmt { kind: StmtKind::Return(Some(list)), line }],
            },
            pad,
            captures,
            prototype: None,
            inherits_pad: false,
            parent_cap_len: 0,
            line,
        });
        self.interp
            .install_overload_pairs(&self.package, &sub)
            .map_err(|e| ParseError::new(e, self.lexer.file().to_string(), line))?;
        Ok(())
    }

    // ---- class feature (delegated) ----

    fn parse_class(&mut self, line: u32) -> ParseResult<Option<Stmt>> {
        class::parse_class(self, line)
    }

    fn parse_class_member(&mut self, keyword: &str, line: u32) -> ParseResult<Option<Stmt>> {
        class::parse_class_member(self, keyword, line)
    }
}

/// Builds `!COND` for `unless`/`until` desugaring.
pub(crate) fn negate_expr(cond: Expr) -> Expr {
    let line = cond.line;
    Expr { kind: ExprKind::Unary { op: crate::ast::UnOp::Not, operand: Box::new(cond) }, line }
}

fn parse_perl_version(version: &str) -> (u32, u32) {
    // `5.036`, `5.36.0`, `5.036002`.
    let mut parts = version.split('.');
    let major = parts.next().and_then(|p| p.parse().ok()).unwrap_or(5);
    let minor_raw = parts.next().unwrap_or("0");
    let minor = if minor_raw.len() >= 3 && minor_raw.starts_with('0') {
        minor_raw[..3.min(minor_raw.len())].parse().unwrap_or(0)
    } else {
        minor_raw.parse().unwrap_or(0)
    };
    (major, minor)
}
