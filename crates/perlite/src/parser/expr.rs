//! The expression grammar.
//!
//! Precedence climbing over Perl's operator table, loosest first:
//! `or`/`xor` → `and` → `not` → list operators → `,` → assignment → `?:` →
//! `..` → `||`/`//` → `&&` → `|`/`^` → `&` → equality → relational → named
//! unary → shifts → additive → multiplicative → `=~` → unary → `**` →
//! postfix (`->`, subscripts, `++`/`--`) → terms.
//!
//! Variable references resolve against the scope stack as they parse, so the
//! produced nodes carry pad slots, capture indices, persistent ids, or
//! qualified global names rather than bare text.

use std::rc::Rc;

use crate::{
    ast::{
        BinOp, Block, Builtin, Callee, DeclSlot, Expr, ExprKind, InterpPart, LogOp, MethodName, Sigil, Stmt,
        StmtKind, SubDef, UnOp,
    },
    error::ParseResult,
    lexer::{Expect, Token, TokenKind},
    resource::ResourceTracker,
    symbols::Resolved,
    value::{Number, RcStr, parse_number_prefix},
};

use super::Parser;

impl<T: ResourceTracker> Parser<'_, T> {
    /// Full expression, including low-precedence `or`/`and`/`not` and commas.
    pub(crate) fn parse_expr(&mut self) -> ParseResult<Expr> {
        self.parse_or_low()
    }

    /// Expression above the comma level (one list element).
    pub(crate) fn parse_assign_expr(&mut self) -> ParseResult<Expr> {
        self.parse_assign()
    }

    fn parse_or_low(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_and_low()?;
        loop {
            let tok = self.peek(Expect::Operator)?;
            if tok.is_ident("or") {
                self.next(Expect::Operator)?;
                let right = self.parse_and_low()?;
                left = binlog(LogOp::Or, left, right);
            } else if tok.is_ident("xor") {
                self.next(Expect::Operator)?;
                let right = self.parse_and_low()?;
                let line = left.line;
                left = Expr {
                    kind: ExprKind::Binary { op: BinOp::LogXor, left: Box::new(left), right: Box::new(right) },
                    line,
                };
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_and_low(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_not_low()?;
        loop {
            let tok = self.peek(Expect::Operator)?;
            if tok.is_ident("and") {
                self.next(Expect::Operator)?;
                let right = self.parse_not_low()?;
                left = binlog(LogOp::And, left, right);
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_not_low(&mut self) -> ParseResult<Expr> {
        let tok = self.peek(Expect::Term)?;
        if tok.is_ident("not") {
            self.next(Expect::Term)?;
            let operand = self.parse_not_low()?;
            let line = tok.line;
            return Ok(Expr { kind: ExprKind::Unary { op: UnOp::Not, operand: Box::new(operand) }, line });
        }
        self.parse_comma()
    }

    /// The comma level: two or more elements make a list.
    fn parse_comma(&mut self) -> ParseResult<Expr> {
        let first = self.parse_assign()?;
        let line = first.line;
        let mut items = vec![first];
        let mut is_list = false;
        loop {
            let tok = self.peek(Expect::Operator)?;
            if tok.is_op(",") || tok.is_op("=>") {
                self.next(Expect::Operator)?;
                is_list = true;
                // Trailing comma before a closer is fine.
                let after = self.peek(Expect::Term)?;
                if after.is_op(")") || after.is_op("]") || after.is_op("}") || after.is_op(";") || after.kind == TokenKind::Eof {
                    break;
                }
                items.push(self.parse_assign()?);
            } else {
                break;
            }
        }
        if is_list {
            Ok(Expr { kind: ExprKind::List(items), line })
        } else {
            Ok(items.pop().unwrap_or(Expr { kind: ExprKind::Nop, line }))
        }
    }

    fn parse_assign(&mut self) -> ParseResult<Expr> {
        let left = self.parse_ternary()?;
        let tok = self.peek(Expect::Operator)?;
        let line = left.line;
        if tok.is_op("=") {
            self.next(Expect::Operator)?;
            let value = self.parse_assign()?;
            return Ok(Expr { kind: ExprKind::Assign { target: Box::new(left), value: Box::new(value) }, line });
        }
        let op = match tok.text.as_str() {
            "+=" => Some(BinOp::Add),
            "-=" => Some(BinOp::Sub),
            "*=" => Some(BinOp::Mul),
            "/=" => Some(BinOp::Div),
            "%=" => Some(BinOp::Mod),
            "**=" => Some(BinOp::Pow),
            ".=" => Some(BinOp::Concat),
            "x=" => Some(BinOp::Repeat),
            "<<=" => Some(BinOp::Shl),
            ">>=" => Some(BinOp::Shr),
            "&=" => Some(BinOp::BitAnd),
            "|=" => Some(BinOp::BitOr),
            "^=" => Some(BinOp::BitXor),
            _ => None,
        };
        if tok.kind == TokenKind::Op
            && let Some(op) = op
        {
            self.next(Expect::Operator)?;
            let value = self.parse_assign()?;
            return Ok(Expr { kind: ExprKind::OpAssign { op, target: Box::new(left), value: Box::new(value) }, line });
        }
        let logop = match tok.text.as_str() {
            "&&=" => Some(LogOp::And),
            "||=" => Some(LogOp::Or),
            "//=" => Some(LogOp::Dor),
            _ => None,
        };
        if tok.kind == TokenKind::Op
            && let Some(op) = logop
        {
            self.next(Expect::Operator)?;
            let value = self.parse_assign()?;
            return Ok(Expr { kind: ExprKind::LogAssign { op, target: Box::new(left), value: Box::new(value) }, line });
        }
        Ok(left)
    }

    fn parse_ternary(&mut self) -> ParseResult<Expr> {
        let cond = self.parse_range()?;
        if self.eat_op("?")? {
            let line = cond.line;
            let then = self.parse_assign()?;
            self.expect_op(":")?;
            let else_ = self.parse_assign()?;
            return Ok(Expr {
                kind: ExprKind::Ternary { cond: Box::new(cond), then: Box::new(then), else_: Box::new(else_) },
                line,
            });
        }
        Ok(cond)
    }

    fn parse_range(&mut self) -> ParseResult<Expr> {
        let from = self.parse_oror()?;
        let tok = self.peek(Expect::Operator)?;
        if tok.is_op("..") || tok.is_op("...") {
            self.next(Expect::Operator)?;
            let line = from.line;
            let to = self.parse_oror()?;
            return Ok(Expr { kind: ExprKind::Range { from: Box::new(from), to: Box::new(to) }, line });
        }
        Ok(from)
    }

    fn parse_oror(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_andand()?;
        loop {
            let tok = self.peek(Expect::Operator)?;
            let op = if tok.is_op("||") {
                LogOp::Or
            } else if tok.is_op("//") {
                LogOp::Dor
            } else {
                return Ok(left);
            };
            self.next(Expect::Operator)?;
            let right = self.parse_andand()?;
            left = binlog(op, left, right);
        }
    }

    fn parse_andand(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_bitor()?;
        while self.peek(Expect::Operator)?.is_op("&&") {
            self.next(Expect::Operator)?;
            let right = self.parse_bitor()?;
            left = binlog(LogOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_bitor(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_bitand()?;
        loop {
            let tok = self.peek(Expect::Operator)?;
            let op = if tok.is_op("|") {
                BinOp::BitOr
            } else if tok.is_op("^") {
                BinOp::BitXor
            } else {
                return Ok(left);
            };
            self.next(Expect::Operator)?;
            let right = self.parse_bitand()?;
            left = bin(op, left, right);
        }
    }

    fn parse_bitand(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_equality()?;
        while self.peek(Expect::Operator)?.is_op("&") {
            self.next(Expect::Operator)?;
            let right = self.parse_equality()?;
            left = bin(BinOp::BitAnd, left, right);
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_relational()?;
        loop {
            let tok = self.peek(Expect::Operator)?;
            let op = match tok.text.as_str() {
                "==" if tok.kind == TokenKind::Op => BinOp::NumEq,
                "!=" if tok.kind == TokenKind::Op => BinOp::NumNe,
                "<=>" if tok.kind == TokenKind::Op => BinOp::Spaceship,
                "eq" if tok.kind == TokenKind::Ident => BinOp::StrEq,
                "ne" if tok.kind == TokenKind::Ident => BinOp::StrNe,
                "cmp" if tok.kind == TokenKind::Ident => BinOp::StrCmp,
                _ => return Ok(left),
            };
            self.next(Expect::Operator)?;
            let right = self.parse_relational()?;
            left = bin(op, left, right);
        }
    }

    fn parse_relational(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_uni()?;
        loop {
            let tok = self.peek(Expect::Operator)?;
            let op = match tok.text.as_str() {
                "<" if tok.kind == TokenKind::Op => BinOp::NumLt,
                ">" if tok.kind == TokenKind::Op => BinOp::NumGt,
                "<=" if tok.kind == TokenKind::Op => BinOp::NumLe,
                ">=" if tok.kind == TokenKind::Op => BinOp::NumGe,
                "lt" if tok.kind == TokenKind::Ident => BinOp::StrLt,
                "gt" if tok.kind == TokenKind::Ident => BinOp::StrGt,
                "le" if tok.kind == TokenKind::Ident => BinOp::StrLe,
                "ge" if tok.kind == TokenKind::Ident => BinOp::StrGe,
                _ => return Ok(left),
            };
            self.next(Expect::Operator)?;
            let right = self.parse_uni()?;
            left = bin(op, left, right);
        }
    }

    /// Named-unary level: nothing to do on the operator side; named unaries
    /// are parsed as terms and their argument grabs through the shift level.
    fn parse_uni(&mut self) -> ParseResult<Expr> {
        self.parse_shift()
    }

    fn parse_shift(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_additive()?;
        loop {
            let tok = self.peek(Expect::Operator)?;
            let op = if tok.is_op("<<") {
                BinOp::Shl
            } else if tok.is_op(">>") {
                BinOp::Shr
            } else {
                return Ok(left);
            };
            self.next(Expect::Operator)?;
            let right = self.parse_additive()?;
            left = bin(op, left, right);
        }
    }

    fn parse_additive(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let tok = self.peek(Expect::Operator)?;
            let op = if tok.is_op("+") {
                BinOp::Add
            } else if tok.is_op("-") {
                BinOp::Sub
            } else if tok.is_op(".") {
                BinOp::Concat
            } else {
                return Ok(left);
            };
            self.next(Expect::Operator)?;
            let right = self.parse_multiplicative()?;
            left = bin(op, left, right);
        }
    }

    fn parse_multiplicative(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_bind()?;
        loop {
            let tok = self.peek(Expect::Operator)?;
            let op = if tok.is_op("*") {
                BinOp::Mul
            } else if tok.is_op("/") {
                BinOp::Div
            } else if tok.is_op("%") {
                BinOp::Mod
            } else if tok.is_ident("x") {
                BinOp::Repeat
            } else {
                return Ok(left);
            };
            self.next(Expect::Operator)?;
            let right = self.parse_bind()?;
            left = bin(op, left, right);
        }
    }

    /// `=~` / `!~` binding.
    fn parse_bind(&mut self) -> ParseResult<Expr> {
        let left = self.parse_unary()?;
        let tok = self.peek(Expect::Operator)?;
        let negated = tok.is_op("!~");
        if !tok.is_op("=~") && !negated {
            return Ok(left);
        }
        self.next(Expect::Operator)?;
        let line = left.line;
        let rhs = self.parse_unary()?;
        let bound = match rhs.kind {
            ExprKind::Match { regex, .. } => {
                Expr { kind: ExprKind::Match { target: Some(Box::new(left)), regex, negated }, line }
            }
            ExprKind::Subst { regex, replacement, .. } => {
                if negated && regex.mods.contains('r') {
                    return Err(self.error_here("Using !~ with s///r doesn't make sense"));
                }
                Expr {
                    kind: ExprKind::Subst { target: Some(Box::new(left)), regex, replacement, negated },
                    line,
                }
            }
            ExprKind::Trans { search, replacement, mods, .. } => {
                if negated && mods.contains('r') {
                    return Err(self.error_here("Using !~ with tr///r doesn't make sense"));
                }
                Expr { kind: ExprKind::Trans { target: Some(Box::new(left)), search, replacement, mods }, line }
            }
            _ => Expr {
                kind: ExprKind::MatchBind { target: Box::new(left), pattern: Box::new(rhs), negated },
                line,
            },
        };
        Ok(bound)
    }

    fn parse_unary(&mut self) -> ParseResult<Expr> {
        let tok = self.peek(Expect::Term)?;
        let line = tok.line;
        if tok.kind == TokenKind::Op {
            match tok.text.as_str() {
                "!" => {
                    self.next(Expect::Term)?;
                    let operand = self.parse_unary()?;
                    return Ok(Expr { kind: ExprKind::Unary { op: UnOp::Not, operand: Box::new(operand) }, line });
                }
                "~" => {
                    self.next(Expect::Term)?;
                    let operand = self.parse_unary()?;
                    return Ok(Expr { kind: ExprKind::Unary { op: UnOp::BitNot, operand: Box::new(operand) }, line });
                }
                "-" => {
                    self.next(Expect::Term)?;
                    // `-bareword` is the string "-bareword".
                    let after = self.peek(Expect::Term)?;
                    if after.kind == TokenKind::Ident && !self.is_known_word(&after.text) {
                        self.next(Expect::Term)?;
                        return Ok(Expr { kind: ExprKind::StrLit(Rc::from(format!("-{}", after.text).as_str())), line });
                    }
                    let operand = self.parse_unary()?;
                    return Ok(Expr { kind: ExprKind::Unary { op: UnOp::Neg, operand: Box::new(operand) }, line });
                }
                "+" => {
                    self.next(Expect::Term)?;
                    let operand = self.parse_unary()?;
                    return Ok(Expr { kind: ExprKind::Unary { op: UnOp::Plus, operand: Box::new(operand) }, line });
                }
                "\\" => {
                    self.next(Expect::Term)?;
                    let operand = self.parse_unary()?;
                    return Ok(Expr { kind: ExprKind::RefTo(Box::new(operand)), line });
                }
                "++" | "--" => {
                    self.next(Expect::Term)?;
                    let by = if tok.text == "++" { 1 } else { -1 };
                    let target = self.parse_unary()?;
                    return Ok(Expr { kind: ExprKind::Incr { target: Box::new(target), by, post: false }, line });
                }
                _ => {}
            }
        }
        self.parse_pow()
    }

    fn parse_pow(&mut self) -> ParseResult<Expr> {
        let base = self.parse_postfix()?;
        if self.peek(Expect::Operator)?.is_op("**") {
            self.next(Expect::Operator)?;
            let line = base.line;
            // Right associative, and `-$x**2` binds the unary under the pow.
            let exp = self.parse_unary()?;
            return Ok(Expr { kind: ExprKind::Binary { op: BinOp::Pow, left: Box::new(base), right: Box::new(exp) }, line });
        }
        Ok(base)
    }

    // ---- postfix chains ----

    fn parse_postfix(&mut self) -> ParseResult<Expr> {
        let mut node = self.parse_term()?;
        loop {
            let tok = self.peek(Expect::Operator)?;
            let line = tok.line;
            if tok.is_op("->") {
                self.next(Expect::Operator)?;
                node = self.parse_arrow(node, line)?;
                continue;
            }
            if tok.is_op("->@*") {
                self.next(Expect::Operator)?;
                node = Expr { kind: ExprKind::Deref { sigil: Sigil::Array, expr: Box::new(node) }, line };
                continue;
            }
            if tok.is_op("->%*") {
                self.next(Expect::Operator)?;
                node = Expr { kind: ExprKind::Deref { sigil: Sigil::Hash, expr: Box::new(node) }, line };
                continue;
            }
            if tok.is_op("->$*") {
                self.next(Expect::Operator)?;
                node = Expr { kind: ExprKind::Deref { sigil: Sigil::Scalar, expr: Box::new(node) }, line };
                continue;
            }
            if tok.is_op("->$#*") {
                self.next(Expect::Operator)?;
                node = Expr { kind: ExprKind::LastIndex(Box::new(node)), line };
                continue;
            }
            // Auto-arrow between subscripts: `$r->[0][1]`, `$h{a}{b}`.
            if tok.is_op("[") && subscript_chains(&node) {
                self.next(Expect::Operator)?;
                let index = self.parse_expr()?;
                self.expect_op("]")?;
                let array = self.as_array_base(node);
                node = Expr { kind: ExprKind::ArrayElem { array: Box::new(array), index: Box::new(index) }, line };
                continue;
            }
            if tok.is_op("{") && subscript_chains(&node) {
                self.next(Expect::Operator)?;
                let key = self.parse_hash_key()?;
                self.expect_op("}")?;
                let hash = self.as_hash_base(node);
                node = Expr { kind: ExprKind::HashElem { hash: Box::new(hash), key: Box::new(key) }, line };
                continue;
            }
            if tok.is_op("++") || tok.is_op("--") {
                self.next(Expect::Operator)?;
                let by = if tok.text == "++" { 1 } else { -1 };
                node = Expr { kind: ExprKind::Incr { target: Box::new(node), by, post: true }, line };
                continue;
            }
            return Ok(node);
        }
    }

    fn parse_arrow(&mut self, invocant: Expr, line: u32) -> ParseResult<Expr> {
        let tok = self.next(Expect::Term)?;
        if tok.is_op("[") {
            let index = self.parse_expr()?;
            self.expect_op("]")?;
            let array = Expr { kind: ExprKind::Deref { sigil: Sigil::Array, expr: Box::new(invocant) }, line };
            return Ok(Expr { kind: ExprKind::ArrayElem { array: Box::new(array), index: Box::new(index) }, line });
        }
        if tok.is_op("{") {
            let key = self.parse_hash_key()?;
            self.expect_op("}")?;
            let hash = Expr { kind: ExprKind::Deref { sigil: Sigil::Hash, expr: Box::new(invocant) }, line };
            return Ok(Expr { kind: ExprKind::HashElem { hash: Box::new(hash), key: Box::new(key) }, line });
        }
        if tok.is_op("(") {
            let args = self.parse_call_args_rest()?;
            return Ok(Expr {
                kind: ExprKind::SubCall { callee: Callee::Expr(Box::new(invocant)), args },
                line,
            });
        }
        if tok.kind == TokenKind::Ident {
            // Method call; SUPER:: resolves against the current package.
            let method = if let Some(rest) = tok.text.strip_prefix("SUPER::") {
                MethodName::Super(Rc::from(rest))
            } else {
                MethodName::Static(Rc::from(tok.text.as_str()))
            };
            let args = if self.peek(Expect::Operator)?.is_op("(") {
                self.next(Expect::Operator)?;
                self.parse_call_args_rest()?
            } else {
                Vec::new()
            };
            return Ok(Expr { kind: ExprKind::MethodCall { invocant: Box::new(invocant), method, args }, line });
        }
        if tok.kind == TokenKind::Var && tok.text.starts_with('$') {
            self.unread(Expect::Term, tok);
            let method = self.parse_term()?;
            let args = if self.peek(Expect::Operator)?.is_op("(") {
                self.next(Expect::Operator)?;
                self.parse_call_args_rest()?
            } else {
                Vec::new()
            };
            return Ok(Expr {
                kind: ExprKind::MethodCall { invocant: Box::new(invocant), method: MethodName::Dynamic(Box::new(method)), args },
                line,
            });
        }
        Err(self.error_at(&tok, format!("syntax error near \"->{}\"", tok.text)))
    }

    /// Args after an already-consumed `(`.
    fn parse_call_args_rest(&mut self) -> ParseResult<Vec<Expr>> {
        let tok = self.peek(Expect::Term)?;
        if tok.is_op(")") {
            self.next(Expect::Term)?;
            return Ok(Vec::new());
        }
        let list = self.parse_expr()?;
        self.expect_op(")")?;
        Ok(flatten_list(list))
    }

    /// Hash subscripts quote simple barewords: `$h{word}`.
    fn parse_hash_key(&mut self) -> ParseResult<Expr> {
        let tok = self.next(Expect::Term)?;
        if tok.kind == TokenKind::Ident {
            let after = self.peek(Expect::Operator)?;
            if after.is_op("}") {
                let line = tok.line;
                return Ok(Expr { kind: ExprKind::StrLit(Rc::from(tok.text.as_str())), line });
            }
        }
        // `$h{-bareword}` also quotes.
        if tok.is_op("-") {
            let word = self.peek(Expect::Term)?;
            if word.kind == TokenKind::Ident {
                let line = tok.line;
                self.next(Expect::Term)?;
                let after = self.peek(Expect::Operator)?;
                if after.is_op("}") {
                    return Ok(Expr { kind: ExprKind::StrLit(Rc::from(format!("-{}", word.text).as_str())), line });
                }
                self.unread(Expect::Term, word);
            }
        }
        self.unread(Expect::Term, tok);
        self.parse_expr()
    }

    fn as_array_base(&self, node: Expr) -> Expr {
        let line = node.line;
        Expr { kind: ExprKind::Deref { sigil: Sigil::Array, expr: Box::new(node) }, line }
    }

    fn as_hash_base(&self, node: Expr) -> Expr {
        let line = node.line;
        Expr { kind: ExprKind::Deref { sigil: Sigil::Hash, expr: Box::new(node) }, line }
    }

    fn is_known_word(&self, word: &str) -> bool {
        word.parse::<Builtin>().is_ok()
            || matches!(word, "my" | "our" | "state" | "local" | "sub" | "do" | "eval" | "sort" | "map" | "grep" | "if" | "unless" | "while" | "until" | "not" | "and" | "or")
    }

    // ---- terms ----

    fn parse_term(&mut self) -> ParseResult<Expr> {
        let tok = self.next(Expect::Term)?;
        let line = tok.line;
        match &tok.kind {
            TokenKind::Number => Ok(Expr { kind: numeric_literal(&tok.text), line }),
            TokenKind::SingleStr(s) => Ok(Expr { kind: ExprKind::StrLit(Rc::from(s.as_str())), line }),
            TokenKind::DoubleStr(raw) => {
                let raw = raw.clone();
                let parts = self.parse_interp_string(&raw, line)?;
                Ok(make_interp(parts, line))
            }
            TokenKind::Heredoc { body, interpolate } => {
                if *interpolate {
                    let body = body.clone();
                    let parts = self.parse_interp_string(&body, line)?;
                    Ok(make_interp(parts, line))
                } else {
                    Ok(Expr { kind: ExprKind::StrLit(Rc::from(body.as_str())), line })
                }
            }
            TokenKind::QwList(words) => {
                let items = words
                    .iter()
                    .map(|w| Expr { kind: ExprKind::StrLit(Rc::from(w.as_str())), line })
                    .collect();
                Ok(Expr { kind: ExprKind::List(items), line })
            }
            TokenKind::Backtick(_) => Err(self.error_at(&tok, "qx// and backticks are not supported")),
            TokenKind::Match { pattern, mods, interpolate } => {
                let regex = self.parse_regex_lit(pattern, mods, *interpolate, line)?;
                Ok(Expr { kind: ExprKind::Match { target: None, regex, negated: false }, line })
            }
            TokenKind::QrLiteral { pattern, mods, interpolate } => {
                let regex = self.parse_regex_lit(pattern, mods, *interpolate, line)?;
                Ok(Expr { kind: ExprKind::QrConstruct { regex }, line })
            }
            TokenKind::Subst { pattern, replacement, mods, interpolate } => {
                let regex = self.parse_regex_lit(pattern, mods, *interpolate, line)?;
                let replacement = replacement.clone();
                let repl = if mods.contains('e') {
                    vec![InterpPart::Scalar(self.parse_snippet(&replacement, line)?)]
                } else {
                    self.parse_interp_string(&replacement, line)?
                };
                Ok(Expr { kind: ExprKind::Subst { target: None, regex, replacement: repl, negated: false }, line })
            }
            TokenKind::Trans { search, replacement, mods } => Ok(Expr {
                kind: ExprKind::Trans {
                    target: None,
                    search: Rc::from(search.as_str()),
                    replacement: Rc::from(replacement.as_str()),
                    mods: Rc::from(mods.as_str()),
                },
                line,
            }),
            TokenKind::ReadLine(inner) => {
                let handle = if inner.is_empty() {
                    Expr { kind: ExprKind::Bareword(Rc::from("STDIN")), line }
                } else if let Some(name) = inner.strip_prefix('$') {
                    self.resolve_scalar(name, line)?
                } else {
                    Expr { kind: ExprKind::Bareword(Rc::from(inner.as_str())), line }
                };
                Ok(Expr { kind: ExprKind::ReadLine { handle: Box::new(handle) }, line })
            }
            TokenKind::Var => {
                let text = tok.text.clone();
                self.parse_variable_term(&text, line)
            }
            TokenKind::Op => {
                let text = tok.text.clone();
                self.parse_op_term(&text, line, &tok)
            }
            TokenKind::Ident => {
                let word = tok.text.clone();
                self.parse_ident_term(&word, line)
            }
            TokenKind::Eof => Err(self.error_at(&tok, "syntax error at end of input")),
        }
    }

    fn parse_op_term(&mut self, op: &str, line: u32, tok: &Token) -> ParseResult<Expr> {
        match op {
            "(" => {
                let inner = self.peek(Expect::Term)?;
                if inner.is_op(")") {
                    self.next(Expect::Term)?;
                    return Ok(Expr { kind: ExprKind::List(Vec::new()), line });
                }
                let expr = self.parse_expr()?;
                self.expect_op(")")?;
                // Parens always make a list; scalar consumers collapse it.
                Ok(Expr { kind: ExprKind::List(flatten_list(expr)), line })
            }
            "[" => {
                let inner = self.peek(Expect::Term)?;
                let items = if inner.is_op("]") {
                    Vec::new()
                } else {
                    let e = self.parse_expr()?;
                    flatten_list(e)
                };
                self.expect_op("]")?;
                Ok(Expr { kind: ExprKind::AnonArray(items), line })
            }
            "{" => {
                let inner = self.peek(Expect::Term)?;
                let items = if inner.is_op("}") {
                    Vec::new()
                } else {
                    let e = self.parse_expr()?;
                    flatten_list(e)
                };
                self.expect_op("}")?;
                Ok(Expr { kind: ExprKind::AnonHash(items), line })
            }
            // Sigil dereference: `$$x`, `@{...}`, `%$h`, `&$code`, `*{...}`.
            "$" | "@" | "%" | "&" | "*" => {
                let sigil = Sigil::from_char(op.chars().next().unwrap_or('$')).unwrap_or(Sigil::Scalar);
                let inner = self.parse_deref_operand()?;
                let node = Expr { kind: ExprKind::Deref { sigil, expr: Box::new(inner) }, line };
                self.parse_deref_subscript(node, sigil, line)
            }
            "$#" => {
                let inner = self.parse_deref_operand()?;
                Ok(Expr { kind: ExprKind::LastIndex(Box::new(inner)), line })
            }
            "-" | "+" | "!" | "~" | "\\" | "++" | "--" => {
                // parse_unary normally handles these; reaching here means a
                // nested unary (e.g. `\\$x` after `\`).
                self.unread(Expect::Term, tok.clone());
                self.parse_unary()
            }
            _ => Err(self.error_at(tok, format!("syntax error near \"{op}\""))),
        }
    }

    /// The operand of a sigil dereference: a `{ EXPR }` block or a simple
    /// term chain.
    fn parse_deref_operand(&mut self) -> ParseResult<Expr> {
        let tok = self.peek(Expect::Term)?;
        if tok.is_op("{") {
            self.next(Expect::Term)?;
            let inner = self.parse_expr()?;
            self.expect_op("}")?;
            return Ok(inner);
        }
        self.parse_term()
    }

    /// After `@$r` / `${e}` / `%$h`: a following subscript turns the deref
    /// into an element or slice of the referenced container.
    fn parse_deref_subscript(&mut self, node: Expr, sigil: Sigil, line: u32) -> ParseResult<Expr> {
        let tok = self.peek(Expect::Operator)?;
        let ExprKind::Deref { expr: inner, .. } = &node.kind else { return Ok(node) };
        if tok.is_op("[") {
            self.next(Expect::Operator)?;
            let index = self.parse_expr()?;
            self.expect_op("]")?;
            let array = Expr { kind: ExprKind::Deref { sigil: Sigil::Array, expr: inner.clone() }, line };
            return Ok(match sigil {
                Sigil::Scalar => Expr { kind: ExprKind::ArrayElem { array: Box::new(array), index: Box::new(index) }, line },
                _ => Expr { kind: ExprKind::ArraySlice { array: Box::new(array), indices: Box::new(index) }, line },
            });
        }
        if tok.is_op("{") && !matches!(sigil, Sigil::Code | Sigil::Glob) {
            self.next(Expect::Operator)?;
            let key = if sigil == Sigil::Scalar {
                let k = self.parse_hash_key()?;
                self.expect_op("}")?;
                k
            } else {
                let k = self.parse_expr()?;
                self.expect_op("}")?;
                k
            };
            let hash = Expr { kind: ExprKind::Deref { sigil: Sigil::Hash, expr: inner.clone() }, line };
            return Ok(match sigil {
                Sigil::Scalar => Expr { kind: ExprKind::HashElem { hash: Box::new(hash), key: Box::new(key) }, line },
                Sigil::Hash => Expr { kind: ExprKind::KvSlice { hash: Box::new(hash), keys: Box::new(key) }, line },
                _ => Expr { kind: ExprKind::HashSlice { hash: Box::new(hash), keys: Box::new(key) }, line },
            });
        }
        // `&$code(...)`: call through the code ref.
        if sigil == Sigil::Code {
            if tok.is_op("(") {
                self.next(Expect::Operator)?;
                let args = self.parse_call_args_rest()?;
                return Ok(Expr { kind: ExprKind::SubCall { callee: Callee::Expr(inner.clone()), args }, line });
            }
            return Ok(Expr { kind: ExprKind::SubCall { callee: Callee::Expr(inner.clone()), args: Vec::new() }, line });
        }
        Ok(node)
    }

    // ---- variables ----

    pub(crate) fn resolve_scalar(&mut self, name: &str, line: u32) -> ParseResult<Expr> {
        self.resolve_var(name, Sigil::Scalar, line)
    }

    pub(crate) fn resolve_var(&mut self, name: &str, sigil: Sigil, line: u32) -> ParseResult<Expr> {
        // Class fields look like plain lexicals inside method bodies.
        if let Some(field) = self.class_field_access(name, sigil, line)? {
            return Ok(field);
        }
        match self.scopes.resolve(name, sigil) {
            Some(Resolved::Lexical(slot)) => Ok(Expr { kind: ExprKind::Lexical { slot, sigil }, line }),
            Some(Resolved::Capture(index)) => Ok(Expr { kind: ExprKind::Capture { index, sigil }, line }),
            Some(Resolved::Persistent(id)) => Ok(Expr { kind: ExprKind::Persistent { id, sigil }, line }),
            Some(Resolved::Global(full)) => Ok(Expr { kind: ExprKind::Global { name: full, sigil }, line }),
            None => {
                let qualified = name.contains("::");
                if qualified {
                    let full = normalize_qualified(name);
                    return Ok(Expr { kind: ExprKind::Global { name: full, sigil }, line });
                }
                if self.feats.strict_vars && !is_special_name(name) {
                    return Err(self.error_here(format!(
                        "Global symbol \"{}{name}\" requires explicit package name (did you forget to declare \"my {}{name}\"?)",
                        sigil.ch(),
                        sigil.ch(),
                    )));
                }
                // Unqualified globals in the current package; specials in main.
                let pkg = if is_special_name(name) { "main" } else { &self.package };
                Ok(Expr {
                    kind: ExprKind::Global { name: Rc::from(format!("{pkg}::{name}").as_str()), sigil },
                    line,
                })
            }
        }
    }

    fn parse_variable_term(&mut self, text: &str, line: u32) -> ParseResult<Expr> {
        let sigil_ch = text.chars().next().unwrap_or('$');
        let name = &text[1..];

        // Specials first.
        match text {
            "@_" => {
                let node = Expr { kind: ExprKind::ArgsArray, line };
                return self.parse_container_subscript(node, Sigil::Array, line);
            }
            "@-" | "@+" => {
                return Ok(Expr { kind: ExprKind::MatchSpans { ends: text == "@+" }, line });
            }
            "$&" => return Ok(Expr { kind: ExprKind::MatchSpecial('&'), line }),
            "$`" => return Ok(Expr { kind: ExprKind::MatchSpecial('`'), line }),
            "$'" => return Ok(Expr { kind: ExprKind::MatchSpecial('\''), line }),
            "$+" => {
                // `$+{name}` — named capture hash.
                if self.peek(Expect::Operator)?.is_op("{") {
                    self.next(Expect::Operator)?;
                    let key = self.parse_hash_key()?;
                    self.expect_op("}")?;
                    return Ok(Expr { kind: ExprKind::NamedCapture { key: Box::new(key) }, line });
                }
                return Ok(Expr { kind: ExprKind::Global { name: Rc::from("main::+"), sigil: Sigil::Scalar }, line });
            }
            _ => {}
        }

        // Capture groups $1..$N.
        if sigil_ch == '$' && !name.is_empty() && name.chars().all(|c| c.is_ascii_digit()) && name != "0" {
            let n: usize = name.parse().unwrap_or(0);
            return Ok(Expr { kind: ExprKind::CaptureGroup(n), line });
        }

        // `$#array`.
        if let Some(arr_name) = text.strip_prefix("$#") {
            let array = self.resolve_var(arr_name, Sigil::Array, line)?;
            return Ok(Expr { kind: ExprKind::LastIndex(Box::new(array)), line });
        }

        let Some(sigil) = Sigil::from_char(sigil_ch) else {
            return Err(self.error_here(format!("syntax error near \"{text}\"")));
        };

        match sigil {
            Sigil::Scalar => {
                // `$x[...]` is an element of `@x`; `$x{...}` of `%x`.
                let after = self.peek(Expect::Operator)?;
                if after.is_op("[") {
                    self.next(Expect::Operator)?;
                    let index = self.parse_expr()?;
                    self.expect_op("]")?;
                    // `$_[0]` is `@_`; `$-[n]`/`$+[n]` index the match spans.
                    let array = match name {
                        "_" => Expr { kind: ExprKind::ArgsArray, line },
                        "-" | "+" => Expr { kind: ExprKind::MatchSpans { ends: name == "+" }, line },
                        _ => self.resolve_var(name, Sigil::Array, line)?,
                    };
                    return Ok(Expr { kind: ExprKind::ArrayElem { array: Box::new(array), index: Box::new(index) }, line });
                }
                if after.is_op("{") {
                    self.next(Expect::Operator)?;
                    let key = self.parse_hash_key()?;
                    self.expect_op("}")?;
                    let hash = self.resolve_var(name, Sigil::Hash, line)?;
                    return Ok(Expr { kind: ExprKind::HashElem { hash: Box::new(hash), key: Box::new(key) }, line });
                }
                self.resolve_var(name, Sigil::Scalar, line)
            }
            Sigil::Array => {
                let node = self.resolve_var(name, Sigil::Array, line)?;
                self.parse_container_subscript(node, Sigil::Array, line)
            }
            Sigil::Hash => {
                let node = self.resolve_var(name, Sigil::Hash, line)?;
                self.parse_container_subscript(node, Sigil::Hash, line)
            }
            Sigil::Code => {
                // `&name` / `&name(...)`.
                let fq = self.qualify_sub(name);
                if self.peek(Expect::Operator)?.is_op("(") {
                    self.next(Expect::Operator)?;
                    let args = self.parse_call_args_rest()?;
                    return Ok(Expr { kind: ExprKind::SubCall { callee: Callee::Named(fq), args }, line });
                }
                Ok(Expr { kind: ExprKind::SubCall { callee: Callee::Named(fq), args: Vec::new() }, line })
            }
            Sigil::Glob => {
                let full = if name.contains("::") {
                    normalize_qualified(name)
                } else {
                    Rc::from(format!("{}::{name}", self.package).as_str())
                };
                Ok(Expr { kind: ExprKind::Global { name: full, sigil: Sigil::Glob }, line })
            }
        }
    }

    /// Slices on array/hash terms: `@a[...]`, `@h{...}`, `%h{...}`.
    fn parse_container_subscript(&mut self, node: Expr, sigil: Sigil, line: u32) -> ParseResult<Expr> {
        let after = self.peek(Expect::Operator)?;
        if after.is_op("[") && sigil == Sigil::Array {
            self.next(Expect::Operator)?;
            let indices = self.parse_expr()?;
            self.expect_op("]")?;
            return Ok(Expr { kind: ExprKind::ArraySlice { array: Box::new(node), indices: Box::new(indices) }, line });
        }
        if after.is_op("{") {
            self.next(Expect::Operator)?;
            let keys = self.parse_expr()?;
            self.expect_op("}")?;
            let kind = match sigil {
                Sigil::Array => ExprKind::HashSlice { hash: Box::new(node), keys: Box::new(keys) },
                _ => ExprKind::KvSlice { hash: Box::new(node), keys: Box::new(keys) },
            };
            return Ok(Expr { kind, line });
        }
        Ok(node)
    }

    pub(crate) fn qualify_sub(&self, name: &str) -> RcStr {
        if name.contains("::") {
            normalize_qualified(name)
        } else {
            Rc::from(format!("{}::{name}", self.package).as_str())
        }
    }

    fn class_field_access(&mut self, name: &str, sigil: Sigil, line: u32) -> ParseResult<Option<Expr>> {
        let Some(state) = &self.class_state else { return Ok(None) };
        if !state.in_method || !state.fields.iter().any(|f| f.name == name && f.sigil == sigil) {
            return Ok(None);
        }
        // `$x` in a method body reads `$self->{x}`.
        let self_var = self.resolve_var("self", Sigil::Scalar, line)?;
        let hash = Expr { kind: ExprKind::Deref { sigil: Sigil::Hash, expr: Box::new(self_var) }, line };
        let elem = Expr {
            kind: ExprKind::HashElem {
                hash: Box::new(hash),
                key: Box::new(Expr { kind: ExprKind::StrLit(Rc::from(name)), line }),
            },
            line,
        };
        match sigil {
            Sigil::Scalar => Ok(Some(elem)),
            Sigil::Array => Ok(Some(Expr { kind: ExprKind::Deref { sigil: Sigil::Array, expr: Box::new(elem) }, line })),
            Sigil::Hash => Ok(Some(Expr { kind: ExprKind::Deref { sigil: Sigil::Hash, expr: Box::new(elem) }, line })),
            _ => Ok(None),
        }
    }

    // ---- identifiers: declarations, builtins, calls ----

    fn parse_ident_term(&mut self, word: &str, line: u32) -> ParseResult<Expr> {
        // Bareword before a fat comma is a string.
        if self.peek(Expect::Operator)?.is_op("=>") {
            return Ok(Expr { kind: ExprKind::StrLit(Rc::from(word)), line });
        }

        match word {
            "my" | "state" => return self.parse_decl(word == "state", line),
            "our" => return self.parse_our(line),
            "local" => {
                let target = self.parse_unary()?;
                return Ok(Expr { kind: ExprKind::Local { target: Box::new(target) }, line });
            }
            "sub" => {
                let sub = self.parse_sub_tail(None, line)?;
                return Ok(Expr { kind: ExprKind::AnonSub(sub), line });
            }
            "do" => {
                let tok = self.peek(Expect::Term)?;
                if tok.is_op("{") {
                    let body = self.parse_block()?;
                    return Ok(Expr { kind: ExprKind::DoBlock(body), line });
                }
                return Err(self.error_here("do FILE is not supported"));
            }
            "eval" => {
                let tok = self.peek(Expect::Term)?;
                if tok.is_op("{") {
                    let body = self.parse_block()?;
                    return Ok(Expr { kind: ExprKind::EvalBlock(body), line });
                }
                let snapshot = Rc::new(self.scopes.snapshot());
                let code = if starts_expression(&tok) {
                    self.parse_uni()?
                } else {
                    // Bare `eval` evaluates `$_`.
                    self.resolve_scalar("_", line)?
                };
                return Ok(Expr { kind: ExprKind::EvalString { code: Box::new(code), snapshot }, line });
            }
            "wantarray" => return Ok(Expr { kind: ExprKind::Wantarray, line }),
            "__PACKAGE__" => {
                return Ok(Expr { kind: ExprKind::StrLit(Rc::clone(&self.package)), line });
            }
            "__FILE__" => {
                return Ok(Expr { kind: ExprKind::StrLit(Rc::from(self.current_file().as_str())), line });
            }
            "__LINE__" => return Ok(Expr { kind: ExprKind::IntLit(i64::from(line)), line }),
            "sort" => return self.parse_sort(line),
            "map" => return self.parse_map_grep(true, line),
            "grep" => return self.parse_map_grep(false, line),
            "print" | "say" | "printf" => return self.parse_print(word, line),
            _ => {}
        }

        // `say` only exists under its feature; otherwise it is a bareword.
        if let Ok(func) = word.parse::<Builtin>() {
            let enabled = func != Builtin::Say || self.feats.say;
            if enabled {
                return self.parse_builtin(func, line);
            }
        }

        // User sub call with parens.
        if self.peek(Expect::Operator)?.is_op("(") {
            self.next(Expect::Operator)?;
            let args = self.parse_call_args_rest()?;
            let fq = self.qualify_sub(word);
            return Ok(Expr { kind: ExprKind::SubCall { callee: Callee::Named(fq), args }, line });
        }

        // Known sub: list-operator call without parens.
        let fq = self.qualify_sub(word);
        if self.declared_subs.contains(&*fq) || self.interp.has_sub(&fq) {
            let next = self.peek(Expect::Term)?;
            let args = if starts_expression(&next) { flatten_list(self.parse_comma()?) } else { Vec::new() };
            return Ok(Expr { kind: ExprKind::SubCall { callee: Callee::Named(fq), args }, line });
        }

        // Class-method bareword (`Foo->new`) is handled by the postfix arrow;
        // a bare package name or filehandle stays a bareword.
        if self.peek(Expect::Operator)?.is_op("->") || is_bareword_ok(word) {
            return Ok(Expr { kind: ExprKind::Bareword(Rc::from(word)), line });
        }

        if self.feats.strict_subs {
            return Err(self.error_here(format!(
                "Bareword \"{word}\" not allowed while \"strict subs\" in use"
            )));
        }
        Ok(Expr { kind: ExprKind::StrLit(Rc::from(word)), line })
    }

    fn parse_decl(&mut self, is_state: bool, line: u32) -> ParseResult<Expr> {
        let tok = self.next(Expect::Term)?;
        // `my \$x` / `my (\@a, \%h)` — declared references.
        let declared_ref = tok.is_op("\\");
        let tok = if declared_ref {
            if !self.feats.declared_refs {
                return Err(self.error_at(&tok, "The experimental declared_refs feature is not enabled"));
            }
            self.next(Expect::Term)?
        } else {
            tok
        };

        if tok.kind == TokenKind::Var {
            let sigil = Sigil::from_char(tok.text.chars().next().unwrap_or('$')).unwrap_or(Sigil::Scalar);
            let name = tok.text[1..].to_string();
            // A declared reference keeps its sigil; the slot is filled by
            // aliasing instead of a fresh cell.
            let slot_sigil = sigil;
            let (slot, persist) = if is_state {
                let (slot, id) = self.scopes.declare_state(&name, slot_sigil);
                (slot, Some(id))
            } else {
                (self.scopes.declare_my(&name, slot_sigil), None)
            };
            return Ok(Expr {
                kind: ExprKind::Decl {
                    slots: vec![DeclSlot { slot, sigil: slot_sigil, persist }],
                    declared_ref,
                    paren: false,
                },
                line,
            });
        }

        if tok.is_op("(") {
            let mut slots = Vec::new();
            let mut any_ref = declared_ref;
            loop {
                let tok = self.next(Expect::Term)?;
                if tok.is_op(")") {
                    break;
                }
                if tok.is_op(",") {
                    continue;
                }
                let item_ref = tok.is_op("\\");
                let tok = if item_ref {
                    if !self.feats.declared_refs {
                        return Err(self.error_at(&tok, "The experimental declared_refs feature is not enabled"));
                    }
                    any_ref = true;
                    self.next(Expect::Term)?
                } else {
                    tok
                };
                if tok.is_ident("undef") {
                    // Placeholder target.
                    slots.push(DeclSlot { slot: u16::MAX, sigil: Sigil::Scalar, persist: None });
                    continue;
                }
                if tok.kind != TokenKind::Var {
                    return Err(self.error_at(&tok, "syntax error in my() list"));
                }
                let sigil = Sigil::from_char(tok.text.chars().next().unwrap_or('$')).unwrap_or(Sigil::Scalar);
                let name = tok.text[1..].to_string();
                let slot_sigil = sigil;
                let (slot, persist) = if is_state {
                    let (slot, id) = self.scopes.declare_state(&name, slot_sigil);
                    (slot, Some(id))
                } else {
                    (self.scopes.declare_my(&name, slot_sigil), None)
                };
                slots.push(DeclSlot { slot, sigil: slot_sigil, persist });
            }
            return Ok(Expr { kind: ExprKind::Decl { slots, declared_ref: any_ref, paren: true }, line });
        }
        Err(self.error_at(&tok, "syntax error after my"))
    }

    fn parse_our(&mut self, line: u32) -> ParseResult<Expr> {
        let parse_one = |p: &mut Self, tok: Token| -> ParseResult<Expr> {
            if tok.kind != TokenKind::Var {
                return Err(p.error_at(&tok, "syntax error after our"));
            }
            let sigil = Sigil::from_char(tok.text.chars().next().unwrap_or('$')).unwrap_or(Sigil::Scalar);
            let name = &tok.text[1..];
            p.scopes.declare_our(name, sigil, &p.package);
            Ok(Expr {
                kind: ExprKind::Global { name: Rc::from(format!("{}::{name}", p.package).as_str()), sigil },
                line: tok.line,
            })
        };
        let tok = self.next(Expect::Term)?;
        if tok.is_op("(") {
            let mut items = Vec::new();
            loop {
                let tok = self.next(Expect::Term)?;
                if tok.is_op(")") {
                    break;
                }
                if tok.is_op(",") {
                    continue;
                }
                items.push(parse_one(self, tok)?);
            }
            return Ok(Expr { kind: ExprKind::List(items), line });
        }
        parse_one(self, tok)
    }

    fn parse_sort(&mut self, line: u32) -> ParseResult<Expr> {
        let paren = self.eat_term_op("(")?;
        let tok = self.peek(Expect::Term)?;
        let cmp = if tok.is_op("{") {
            self.next(Expect::Term)?;
            self.scopes.enter_sub(false);
            self.sub_depth += 1;
            let body = self.parse_block_rest()?;
            self.sub_depth -= 1;
            let (pad, captures) = self.scopes.leave_sub();
            Some(Rc::new(SubDef {
                name: None,
                package: Rc::clone(&self.package),
                body,
                pad,
                captures,
                prototype: None,
                inherits_pad: false,
                parent_cap_len: 0,
                line,
            }))
        } else {
            None
        };
        let next = self.peek(Expect::Term)?;
        let args = if starts_expression(&next) && !next.is_op(")") {
            flatten_list(self.parse_comma()?)
        } else {
            Vec::new()
        };
        if paren {
            self.expect_op(")")?;
        }
        Ok(Expr { kind: ExprKind::Sort { cmp, args }, line })
    }

    fn parse_map_grep(&mut self, is_map: bool, line: u32) -> ParseResult<Expr> {
        let paren = self.eat_term_op("(")?;
        let tok = self.peek(Expect::Term)?;
        let body = if tok.is_op("{") {
            self.next(Expect::Term)?;
            self.scopes.enter_sub(false);
            self.sub_depth += 1;
            let block = self.parse_block_rest()?;
            self.sub_depth -= 1;
            let (pad, captures) = self.scopes.leave_sub();
            // An optional comma may separate the block from the list.
            let _ = self.eat_op(",")?;
            Rc::new(SubDef {
                name: None,
                package: Rc::clone(&self.package),
                body: block,
                pad,
                captures,
                prototype: None,
                inherits_pad: false,
                parent_cap_len: 0,
                line,
            })
        } else {
            // Expression form: `map EXPR, LIST`.
            self.scopes.enter_sub(false);
            self.sub_depth += 1;
            let expr = self.parse_assign()?;
            self.sub_depth -= 1;
            let (pad, captures) = self.scopes.leave_sub();
            self.expect_op(",")?;
            Rc::new(SubDef {
                name: None,
                package: Rc::clone(&self.package),
                body: Block { stmts: vec![Stmt { kind: StmtKind::Expr(expr), line }] },
                pad,
                captures,
                prototype: None,
                inherits_pad: false,
                parent_cap_len: 0,
                line,
            })
        };
        let args = flatten_list(self.parse_comma()?);
        if paren {
            self.expect_op(")")?;
        }
        let kind = if is_map {
            ExprKind::Map { body, args }
        } else {
            ExprKind::Grep { body, args }
        };
        Ok(Expr { kind, line })
    }

    fn parse_print(&mut self, word: &str, line: u32) -> ParseResult<Expr> {
        let func = match word {
            "say" => Builtin::Say,
            "printf" => Builtin::Printf,
            _ => Builtin::Print,
        };
        if func == Builtin::Say && !self.feats.say {
            return Err(self.error_here("say is only available with the \"say\" feature"));
        }
        let paren = self.eat_term_op("(")?;

        // Filehandle detection: `print STDERR LIST`, `print {$fh} LIST`,
        // `print $fh LIST` (no comma after the handle).
        let mut handle = Expr { kind: ExprKind::Nop, line };
        let tok = self.peek(Expect::Term)?;
        if tok.is_op("{") {
            self.next(Expect::Term)?;
            let h = self.parse_expr()?;
            self.expect_op("}")?;
            handle = h;
        } else if tok.kind == TokenKind::Ident
            && matches!(tok.text.as_str(), "STDOUT" | "STDERR" | "STDIN")
        {
            self.next(Expect::Term)?;
            handle = Expr { kind: ExprKind::Bareword(Rc::from(tok.text.as_str())), line };
        } else if tok.kind == TokenKind::Var && tok.text.starts_with('$') && tok.text.len() > 1 {
            // `print $fh LIST` — a handle when a term follows with no comma.
            // Probe with a checkpoint so the rewind replays under the right
            // expectation (a `/` after `$fh` must stay division).
            self.next(Expect::Term)?;
            let cp = self.lexer.checkpoint();
            let saved_pending = self.pending.clone();
            let after = self.next(Expect::Operator)?;
            let operator_follows = matches!(&after.kind, TokenKind::Op | TokenKind::Eof)
                || matches!(after.text.as_str(), "if" | "unless" | "while" | "until" | "for" | "foreach"
                    | "or" | "and" | "xor" | "not" | "x" | "eq" | "ne" | "lt" | "gt" | "le" | "ge" | "cmp");
            self.lexer.rewind(cp);
            self.pending = saved_pending;
            if operator_follows {
                self.unread(Expect::Term, tok);
            } else {
                handle = self.resolve_scalar(&tok.text[1..], line)?;
            }
        }

        let next = self.peek(Expect::Term)?;
        let mut args = vec![handle];
        if starts_expression(&next) && !next.is_op(")") {
            args.extend(flatten_list(self.parse_comma()?));
        } else if !matches!(args[0].kind, ExprKind::Nop) {
            // `print $fh;` prints the handle variable, not through it — but we
            // already consumed it as a handle only when a term followed.
        } else {
            // Bare `print;` prints `$_`.
            args.push(self.resolve_scalar("_", line)?);
        }
        if paren {
            self.expect_op(")")?;
        }
        Ok(Expr { kind: ExprKind::FuncCall { func, args }, line })
    }

    /// Consumes `(` at term position if present.
    fn eat_term_op(&mut self, op: &str) -> ParseResult<bool> {
        let tok = self.next(Expect::Term)?;
        if tok.is_op(op) {
            Ok(true)
        } else {
            self.unread(Expect::Term, tok);
            Ok(false)
        }
    }

    fn parse_builtin(&mut self, func: Builtin, line: u32) -> ParseResult<Expr> {
        use Builtin::*;
        let paren = self.eat_term_op("(")?;

        // Zero-arg-able builtins.
        let no_arg_default = matches!(
            func,
            Shift | Pop | Chomp | Chop | Wantarray | Time | Caller | Rand | Srand | Undef | Die | Warn | Exit
                | Lc | Uc | Lcfirst | Ucfirst | Length | Defined | Ref | Chr | Ord | Hex | Oct | Abs | Int | Sqrt
                | Exp | Log | Sin | Cos | Pos | Quotemeta | Eof | Split | Readline | Each | Keys | Values | Scalar
        );

        let next = self.peek(Expect::Term)?;
        let mut args: Vec<Expr> = Vec::new();
        let has_args = if paren {
            !next.is_op(")")
        } else {
            starts_expression(&next)
        };
        if has_args {
            if is_named_unary(func) && !paren {
                // Named unary: one argument at shift precedence.
                args.push(self.parse_uni()?);
            } else {
                args = flatten_list(self.parse_comma()?);
            }
        } else if !no_arg_default {
            // List ops with no args at all: allow and let codegen default.
        }
        if paren {
            self.expect_op(")")?;
        }

        // Implicit arguments.
        if args.is_empty() {
            match func {
                Shift | Pop => {
                    let arr = if self.sub_depth > 0 {
                        Expr { kind: ExprKind::ArgsArray, line }
                    } else {
                        Expr { kind: ExprKind::Global { name: Rc::from("main::ARGV"), sigil: Sigil::Array }, line }
                    };
                    args.push(arr);
                }
                Chomp | Chop | Lc | Uc | Lcfirst | Ucfirst | Length | Defined | Chr | Ord | Hex | Oct | Abs
                | Int | Sqrt | Exp | Log | Sin | Cos | Pos | Quotemeta | Ref => {
                    args.push(self.resolve_scalar("_", line)?);
                }
                _ => {}
            }
        }
        Ok(Expr { kind: ExprKind::FuncCall { func, args }, line })
    }

    fn current_file(&self) -> String {
        // The lexer's view of the (possibly #line-adjusted) file name.
        self.lexer.file().to_string()
    }
}

fn bin(op: BinOp, left: Expr, right: Expr) -> Expr {
    let line = left.line;
    Expr { kind: ExprKind::Binary { op, left: Box::new(left), right: Box::new(right) }, line }
}

fn binlog(op: LogOp, left: Expr, right: Expr) -> Expr {
    let line = left.line;
    Expr { kind: ExprKind::Logical { op, left: Box::new(left), right: Box::new(right) }, line }
}

/// Splits a comma-level parse into its elements.
pub(crate) fn flatten_list(expr: Expr) -> Vec<Expr> {
    match expr.kind {
        ExprKind::List(items) => items,
        _ => vec![expr],
    }
}

fn make_interp(parts: Vec<InterpPart>, line: u32) -> Expr {
    // A fully literal interpolation collapses to a plain string.
    if parts.len() == 1
        && let InterpPart::Lit(s) = &parts[0]
    {
        return Expr { kind: ExprKind::StrLit(Rc::from(s.as_str())), line };
    }
    if parts.is_empty() {
        return Expr { kind: ExprKind::StrLit(Rc::from("")), line };
    }
    Expr { kind: ExprKind::Interp(parts), line }
}

/// Whether a token can begin an expression (for list-op argument detection).
pub(crate) fn starts_expression(tok: &Token) -> bool {
    match &tok.kind {
        TokenKind::Eof => false,
        TokenKind::Op => matches!(
            tok.text.as_str(),
            "(" | "[" | "{" | "\\" | "-" | "+" | "!" | "~" | "$" | "@" | "%" | "&" | "*" | "$#" | "++" | "--"
        ),
        TokenKind::Ident => !matches!(
            tok.text.as_str(),
            "if" | "unless" | "while" | "until" | "for" | "foreach" | "or" | "and" | "xor" | "not" | "cmp"
                | "eq" | "ne" | "lt" | "gt" | "le" | "ge" | "x"
        ),
        _ => true,
    }
}

/// Punctuation and control names live in `main` regardless of package.
fn is_special_name(name: &str) -> bool {
    matches!(
        name,
        "_" | "@" | "!" | "/" | "\\" | "," | "\"" | ";" | "0" | "." | "+" | "-" | "ARGV" | "ENV" | "INC" | "SIG"
            | "STDIN" | "STDOUT" | "STDERR" | "a" | "b"
    ) || name.starts_with('^')
}

fn is_bareword_ok(word: &str) -> bool {
    matches!(word, "STDIN" | "STDOUT" | "STDERR" | "ARGV" | "DATA") || word.contains("::")
        || word.chars().next().is_some_and(char::is_uppercase)
}

fn normalize_qualified(name: &str) -> RcStr {
    if let Some(rest) = name.strip_prefix("::") {
        Rc::from(format!("main::{rest}").as_str())
    } else {
        Rc::from(name)
    }
}

fn is_named_unary(func: Builtin) -> bool {
    use Builtin::*;
    matches!(
        func,
        Defined | Ref | Scalar | Lc | Uc | Lcfirst | Ucfirst | Length | Chr | Ord | Hex | Oct | Abs | Int
            | Sqrt | Log | Exp | Sin | Cos | Rand | Srand | Quotemeta | Chomp | Chop | Pos | Readline | Close
            | Exists | Delete | Each | Keys | Values | Shift | Pop | Undef
    )
}

/// Parses a numeric literal's text (hex, binary, octal, underscores, floats).
fn numeric_literal(text: &str) -> ExprKind {
    let clean: String = text.chars().filter(|&c| c != '_').collect();
    if let Some(hex) = clean.strip_prefix("0x").or_else(|| clean.strip_prefix("0X")) {
        return ExprKind::IntLit(i64::from_str_radix(hex, 16).unwrap_or(0));
    }
    if let Some(bin) = clean.strip_prefix("0b").or_else(|| clean.strip_prefix("0B")) {
        return ExprKind::IntLit(i64::from_str_radix(bin, 2).unwrap_or(0));
    }
    if clean.len() > 1 && clean.starts_with('0') && clean.chars().all(|c| c.is_ascii_digit()) {
        return ExprKind::IntLit(i64::from_str_radix(&clean, 8).unwrap_or(0));
    }
    match parse_number_prefix(&clean) {
        (Number::Int(n), _) => ExprKind::IntLit(n),
        (Number::Float(f), _) => ExprKind::NumLit(f),
    }
}

/// Whether subscripts chain (auto-arrow) off this node kind.
fn subscript_chains(node: &Expr) -> bool {
    matches!(
        node.kind,
        ExprKind::ArrayElem { .. } | ExprKind::HashElem { .. } | ExprKind::SubCall { .. } | ExprKind::MethodCall { .. }
    )
}
