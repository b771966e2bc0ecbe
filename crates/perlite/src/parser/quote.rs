//! Interpolation sub-parsers.
//!
//! Double-quoted strings, heredocs, and regex/replacement bodies arrive from
//! the lexer raw. This module splits them into literal and expression parts:
//! escapes resolve here (`\n`, `\x{...}`, `\c`, octal, case shifters), and
//! embedded `$var`/`@var` chains are cut out textually and re-parsed through
//! the main expression grammar, so subscripts, arrows, and scope resolution
//! behave exactly as they do outside a string.
//!
//! Regex bodies keep their escapes untouched — the pattern preprocessor owns
//! those — and only variable interpolation is extracted.

use std::rc::Rc;

use crate::{
    ast::{Builtin, Expr, ExprKind, InterpPart, RegexLit},
    error::ParseResult,
    lexer::Lexer,
    resource::ResourceTracker,
};

use super::Parser;

impl<T: ResourceTracker> Parser<'_, T> {
    /// Parses an isolated expression snippet (an interpolated variable chain
    /// or an `/e` replacement) with the surrounding scope state.
    pub(crate) fn parse_snippet(&mut self, src: &str, line: u32) -> ParseResult<Expr> {
        let file = self.lexer.file();
        let saved_lexer = std::mem::replace(&mut self.lexer, Lexer::new(src, &file));
        let saved_pending = std::mem::take(&mut self.pending);
        let result = self.parse_expr();
        self.lexer = saved_lexer;
        self.pending = saved_pending;
        result.map(|mut e| {
            e.line = line;
            e
        })
    }

    /// Splits a double-quoted body into parts, resolving escapes.
    pub(crate) fn parse_interp_string(&mut self, body: &str, line: u32) -> ParseResult<Vec<InterpPart>> {
        let chars: Vec<char> = body.chars().collect();
        let mut parts: Vec<InterpPart> = Vec::new();
        let mut lit = String::new();
        let mut i = 0usize;
        // Case-shift state: \U \L \Q spans plus the one-shot \u \l.
        let mut spans: Vec<char> = Vec::new();
        let mut one_shot: Option<char> = None;

        let push_lit = |lit: &mut String, c: char, spans: &[char], one_shot: &mut Option<char>| {
            let c = match one_shot.take() {
                Some('u') => c.to_uppercase().next().unwrap_or(c),
                Some('l') => c.to_lowercase().next().unwrap_or(c),
                _ => c,
            };
            match spans.last() {
                Some('U') => lit.extend(c.to_uppercase()),
                Some('L') => lit.extend(c.to_lowercase()),
                Some('Q') => {
                    if !c.is_alphanumeric() && c != '_' {
                        lit.push('\\');
                    }
                    lit.push(c);
                }
                _ => lit.push(c),
            }
        };

        while i < chars.len() {
            let c = chars[i];
            if c == '\\' && i + 1 < chars.len() {
                let esc = chars[i + 1];
                i += 2;
                match esc {
                    'n' => push_lit(&mut lit, '\n', &spans, &mut one_shot),
                    't' => push_lit(&mut lit, '\t', &spans, &mut one_shot),
                    'r' => push_lit(&mut lit, '\r', &spans, &mut one_shot),
                    'f' => push_lit(&mut lit, '\x0C', &spans, &mut one_shot),
                    'b' => push_lit(&mut lit, '\x08', &spans, &mut one_shot),
                    'a' => push_lit(&mut lit, '\x07', &spans, &mut one_shot),
                    'e' => push_lit(&mut lit, '\x1B', &spans, &mut one_shot),
                    'x' => {
                        let code = if chars.get(i) == Some(&'{') {
                            let mut hex = String::new();
                            i += 1;
                            while i < chars.len() && chars[i] != '}' {
                                hex.push(chars[i]);
                                i += 1;
                            }
                            i += 1;
                            u32::from_str_radix(&hex, 16).unwrap_or(0)
                        } else {
                            let mut hex = String::new();
                            while hex.len() < 2 && chars.get(i).is_some_and(char::is_ascii_hexdigit) {
                                hex.push(chars[i]);
                                i += 1;
                            }
                            u32::from_str_radix(&hex, 16).unwrap_or(0)
                        };
                        if let Some(ch) = char::from_u32(code) {
                            push_lit(&mut lit, ch, &spans, &mut one_shot);
                        }
                    }
                    'c' => {
                        if let Some(&ctl) = chars.get(i) {
                            i += 1;
                            let code = (ctl.to_ascii_uppercase() as u32) ^ 0x40;
                            if let Some(ch) = char::from_u32(code) {
                                push_lit(&mut lit, ch, &spans, &mut one_shot);
                            }
                        }
                    }
                    '0'..='7' => {
                        let mut oct = String::from(esc);
                        while oct.len() < 3 && chars.get(i).is_some_and(|c| ('0'..='7').contains(c)) {
                            oct.push(chars[i]);
                            i += 1;
                        }
                        let code = u32::from_str_radix(&oct, 8).unwrap_or(0);
                        if let Some(ch) = char::from_u32(code) {
                            push_lit(&mut lit, ch, &spans, &mut one_shot);
                        }
                    }
                    'u' | 'l' => one_shot = Some(esc),
                    'U' | 'L' | 'Q' => spans.push(esc),
                    'E' => {
                        spans.pop();
                    }
                    other => push_lit(&mut lit, other, &spans, &mut one_shot),
                }
                continue;
            }
            if (c == '$' || c == '@') && i + 1 < chars.len() {
                if let Some((snippet, consumed)) = scan_variable(&chars, i, true) {
                    if !lit.is_empty() {
                        parts.push(InterpPart::Lit(std::mem::take(&mut lit)));
                    }
                    let expr = self.parse_snippet(&snippet, line)?;
                    let expr = wrap_case(expr, spans.last().copied(), one_shot.take(), line);
                    if c == '$' {
                        parts.push(InterpPart::Scalar(expr));
                    } else {
                        parts.push(InterpPart::Join(expr));
                    }
                    i += consumed;
                    continue;
                }
            }
            push_lit(&mut lit, c, &spans, &mut one_shot);
            i += 1;
        }
        if !lit.is_empty() || parts.is_empty() {
            parts.push(InterpPart::Lit(lit));
        }
        Ok(parts)
    }

    /// Splits a regex body: variables interpolate, escapes stay raw for the
    /// pattern preprocessor.
    pub(crate) fn parse_regex_lit(
        &mut self,
        pattern: &str,
        mods: &str,
        interpolate: bool,
        line: u32,
    ) -> ParseResult<RegexLit> {
        if !interpolate || pattern.is_empty() {
            let parts = if pattern.is_empty() { Vec::new() } else { vec![InterpPart::Lit(pattern.to_string())] };
            return Ok(RegexLit { parts, mods: mods.to_string() });
        }
        let chars: Vec<char> = pattern.chars().collect();
        let mut parts: Vec<InterpPart> = Vec::new();
        let mut lit = String::new();
        let mut i = 0usize;
        let mut in_class = false;
        while i < chars.len() {
            let c = chars[i];
            if c == '\\' {
                lit.push(c);
                if let Some(&n) = chars.get(i + 1) {
                    lit.push(n);
                }
                i += 2;
                continue;
            }
            if c == '[' {
                in_class = true;
            } else if c == ']' {
                in_class = false;
            }
            // `$` only interpolates before a name; a trailing `$` is the
            // end-of-string anchor. Inside a class, subscripts stay literal.
            if (c == '$' || c == '@') && i + 1 < chars.len() {
                let next = chars[i + 1];
                let interpolates = next.is_ascii_alphabetic() || next == '_' || next == '{';
                if interpolates
                    && let Some((snippet, consumed)) = scan_variable(&chars, i, !in_class)
                {
                    if !lit.is_empty() {
                        parts.push(InterpPart::Lit(std::mem::take(&mut lit)));
                    }
                    let expr = self.parse_snippet(&snippet, line)?;
                    if c == '$' {
                        parts.push(InterpPart::Scalar(expr));
                    } else {
                        parts.push(InterpPart::Join(expr));
                    }
                    i += consumed;
                    continue;
                }
            }
            lit.push(c);
            i += 1;
        }
        if !lit.is_empty() {
            parts.push(InterpPart::Lit(lit));
        }
        Ok(RegexLit { parts, mods: mods.to_string() })
    }
}

fn wrap_case(expr: Expr, span: Option<char>, one_shot: Option<char>, line: u32) -> Expr {
    let wrap = |func: Builtin, e: Expr| Expr { kind: ExprKind::FuncCall { func, args: vec![e] }, line };
    let expr = match one_shot {
        Some('u') => wrap(Builtin::Ucfirst, expr),
        Some('l') => wrap(Builtin::Lcfirst, expr),
        _ => expr,
    };
    match span {
        Some('U') => wrap(Builtin::Uc, expr),
        Some('L') => wrap(Builtin::Lc, expr),
        Some('Q') => wrap(Builtin::Quotemeta, expr),
        _ => expr,
    }
}

/// Cuts the text of an interpolated variable chain out of `chars` starting
/// at the sigil. Returns the snippet and how many chars it covers, or `None`
/// when the sigil is literal (`"100$"`, `"a@ b"`).
fn scan_variable(chars: &[char], start: usize, allow_subscripts: bool) -> Option<(String, usize)> {
    let sigil = chars[start];
    let mut j = start + 1;

    // `${name}` / `${ expr }` / `@{...}`.
    if chars.get(j) == Some(&'{') {
        let mut depth = 1usize;
        j += 1;
        while j < chars.len() && depth > 0 {
            match chars[j] {
                '{' => depth += 1,
                '}' => depth -= 1,
                _ => {}
            }
            j += 1;
        }
        if depth != 0 {
            return None;
        }
    } else if sigil == '$'
        && chars.get(j).is_some_and(|c| {
            matches!(c, '&' | '`' | '\'' | '+' | '!' | '@' | '/' | '\\' | ',' | '.' | ';' | '0'..='9' | '$')
        })
    {
        // Punctuation specials interpolate as single chars ($1.. are runs).
        if chars[j].is_ascii_digit() {
            while j < chars.len() && chars[j].is_ascii_digit() {
                j += 1;
            }
        } else {
            j += 1;
        }
    } else if chars.get(j).is_some_and(|c| c.is_ascii_alphabetic() || *c == '_') {
        while j < chars.len() && (chars[j].is_ascii_alphanumeric() || chars[j] == '_') {
            j += 1;
        }
        // Package-qualified names.
        while chars.get(j) == Some(&':') && chars.get(j + 1) == Some(&':') && chars.get(j + 2).is_some_and(|c| c.is_ascii_alphanumeric() || *c == '_') {
            j += 2;
            while j < chars.len() && (chars[j].is_ascii_alphanumeric() || chars[j] == '_') {
                j += 1;
            }
        }
    } else {
        return None;
    }

    // Subscript and arrow chains.
    if allow_subscripts {
        loop {
            match chars.get(j) {
                Some('[') => {
                    let Some(end) = balanced(chars, j, '[', ']') else { break };
                    j = end;
                }
                Some('{') => {
                    let Some(end) = balanced(chars, j, '{', '}') else { break };
                    j = end;
                }
                Some('-') if chars.get(j + 1) == Some(&'>') && matches!(chars.get(j + 2), Some('[' | '{')) => {
                    j += 2;
                }
                _ => break,
            }
        }
    }

    let snippet: String = chars[start..j].iter().collect();
    Some((snippet, j - start))
}

fn balanced(chars: &[char], start: usize, open: char, close: char) -> Option<usize> {
    let mut depth = 0usize;
    let mut j = start;
    while j < chars.len() {
        let c = chars[j];
        if c == '\\' {
            j += 2;
            continue;
        }
        if c == open {
            depth += 1;
        } else if c == close {
            depth -= 1;
            if depth == 0 {
                return Some(j + 1);
            }
        }
        j += 1;
    }
    None
}
