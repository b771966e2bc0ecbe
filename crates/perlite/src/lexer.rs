//! The tokenizer.
//!
//! Perl cannot be tokenized without knowing what the parser expects next:
//! `/` is division after a term and a match operator before one, `<<` is a
//! shift or a heredoc, `%` is modulo or a sigil. The lexer therefore exposes
//! [`Lexer::next_token`] taking an [`Expect`] hint, and the parser pulls
//! tokens one at a time with the right expectation.
//!
//! Heredocs are resolved by splicing: on `<<TAG` the body is located after
//! the current physical line, captured into the token immediately, and a
//! watermark makes the main scan skip the consumed lines when it gets there.

use std::rc::Rc;

use crate::{
    error::{ParseError, ParseResult},
    value::RcStr,
};

/// What the parser expects at the current position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expect {
    /// A term: literals, variables, quote-like operators, unary ops.
    Term,
    /// An infix/postfix operator or statement punctuation.
    Operator,
}

/// Token payload.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    /// Bareword, keyword, or package name (`Foo::Bar`).
    Ident,
    /// Variable with sigil: `$x`, `@a`, `%h`, `&f`, `*g`, `$#a`, `$1`, `$_`,
    /// `$^W` (caret names are canonicalized to `$^NAME`).
    Var,
    /// Numeric literal (raw text in `text`).
    Number,
    /// Non-interpolating string (already processed: `\\` and `\'`).
    SingleStr(String),
    /// Interpolating string body, raw (escape/interp parsing happens later).
    DoubleStr(String),
    /// `qx//` / backticks body.
    Backtick(String),
    /// `qw//` word list.
    QwList(Vec<String>),
    /// Match: `m/.../`, `/.../`. `interpolate` is false for `m'...'`.
    Match { pattern: String, mods: String, interpolate: bool },
    /// Substitution `s/PAT/REPL/mods`.
    Subst { pattern: String, replacement: String, mods: String, interpolate: bool },
    /// Transliteration `tr/SEARCH/REPL/mods`.
    Trans { search: String, replacement: String, mods: String },
    /// `qr/.../mods`.
    QrLiteral { pattern: String, mods: String, interpolate: bool },
    /// `<>`, `<$fh>`, `<STDIN>` — the inner text.
    ReadLine(String),
    /// Heredoc string; behaves like `SingleStr`/`DoubleStr` per `interpolate`.
    Heredoc { body: String, interpolate: bool },
    /// Operator or punctuation; the text is the operator itself.
    Op,
    Eof,
}

#[derive(Debug, Clone)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: u32,
    pub file: RcStr,
    pub offset: usize,
}

impl Token {
    pub(crate) fn is_op(&self, op: &str) -> bool {
        self.kind == TokenKind::Op && self.text == op
    }

    pub(crate) fn is_ident(&self, word: &str) -> bool {
        self.kind == TokenKind::Ident && self.text == word
    }
}

/// Multi-character operators, longest first so greedy matching works.
const OPERATORS: &[&str] = &[
    "->$#*", "->@*", "->%*", "->$*", "<<=", ">>=", "**=", "||=", "&&=", "//=", "...", "<=>", "=~", "!~", "<=",
    ">=", "==", "!=", "->", "=>", "++", "--", "**", "+=", "-=", "*=", "/=", ".=", "%=", "x=", "|=", "&=", "^=",
    "&&", "||", "//", "..", "<<", ">>", "::", "<", ">", "=", "+", "-", "*", "/", "%", ".", "!", "~", "\\", "?",
    ":", ";", ",", "(", ")", "[", "]", "{", "}", "&", "|", "^", "$", "@",
];

/// Characters that pair as quote delimiters.
fn paired_close(open: char) -> Option<char> {
    match open {
        '(' => Some(')'),
        '[' => Some(']'),
        '{' => Some('}'),
        '<' => Some('>'),
        _ => None,
    }
}

/// Saved scan state from [`Lexer::checkpoint`].
#[derive(Debug, Clone)]
pub(crate) struct LexCheckpoint {
    pos: usize,
    line: u32,
    file: RcStr,
    heredoc_watermark: usize,
    finished: bool,
}

pub(crate) struct Lexer {
    src: Vec<char>,
    /// Byte offsets are tracked alongside the char index for diagnostics.
    pos: usize,
    line: u32,
    file: RcStr,
    /// First position after heredoc bodies consumed ahead of the scan.
    heredoc_watermark: usize,
    /// Set once `__END__`/`__DATA__` is seen.
    finished: bool,
}

impl Lexer {
    pub(crate) fn new(source: &str, file: &str) -> Self {
        Self {
            src: source.chars().collect(),
            pos: 0,
            line: 1,
            file: Rc::from(file),
            heredoc_watermark: 0,
            finished: false,
        }
    }

    pub(crate) fn line(&self) -> u32 {
        self.line
    }

    pub(crate) fn file(&self) -> RcStr {
        Rc::clone(&self.file)
    }

    /// Snapshot of the scan state, for bounded lookahead with rewind.
    pub(crate) fn checkpoint(&self) -> LexCheckpoint {
        LexCheckpoint {
            pos: self.pos,
            line: self.line,
            file: Rc::clone(&self.file),
            heredoc_watermark: self.heredoc_watermark,
            finished: self.finished,
        }
    }

    pub(crate) fn rewind(&mut self, cp: LexCheckpoint) {
        self.pos = cp.pos;
        self.line = cp.line;
        self.file = cp.file;
        self.heredoc_watermark = cp.heredoc_watermark;
        self.finished = cp.finished;
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(message, self.file.to_string(), self.line)
    }

    fn peek_char(&self) -> Option<char> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<char> {
        self.src.get(self.pos + ahead).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.src.get(self.pos).copied();
        if let Some(c) = c {
            self.pos += 1;
            if c == '\n' {
                self.line += 1;
                if self.heredoc_watermark > self.pos {
                    self.pos = self.heredoc_watermark;
                }
            }
        }
        c
    }

    fn at_line_start(&self) -> bool {
        self.pos == 0 || matches!(self.src.get(self.pos - 1), Some('\n'))
    }

    /// Skips whitespace, comments, POD sections, and `#line` directives.
    fn skip_trivia(&mut self) -> ParseResult<()> {
        loop {
            // POD: a line starting with `=identifier` up to `=cut`.
            if self.at_line_start()
                && self.peek_char() == Some('=')
                && self.peek_at(1).is_some_and(|c| c.is_ascii_alphabetic())
            {
                self.skip_pod();
                continue;
            }
            match self.peek_char() {
                Some('#') => {
                    self.consume_comment_line();
                }
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                _ => return Ok(()),
            }
        }
    }

    fn skip_pod(&mut self) {
        // Consume until a line starting with `=cut`, or end of input.
        loop {
            let mut line = String::new();
            loop {
                match self.bump() {
                    Some('\n') | None => break,
                    Some(c) => line.push(c),
                }
            }
            if line.starts_with("=cut") || self.peek_char().is_none() {
                return;
            }
        }
    }

    /// Consumes `#...` to end of line, interpreting `#line N "file"`.
    fn consume_comment_line(&mut self) {
        let mut comment = String::new();
        loop {
            match self.peek_char() {
                Some('\n') | None => break,
                Some(c) => {
                    comment.push(c);
                    self.pos += 1;
                }
            }
        }
        if let Some(rest) = comment.strip_prefix("#") {
            let rest = rest.strip_prefix("line").or_else(|| rest.trim_start().strip_prefix("line"));
            if let Some(rest) = rest {
                let rest = rest.trim_start();
                let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
                if !digits.is_empty() {
                    let after = rest[digits.len()..].trim_start();
                    if let Some(stripped) = after.strip_prefix('"')
                        && let Some(end) = stripped.find('"')
                    {
                        self.file = Rc::from(&stripped[..end]);
                    }
                    if let Ok(n) = digits.parse::<u32>() {
                        // The directive names the line number of the NEXT line.
                        self.line = n.wrapping_sub(1);
                    }
                }
            }
        }
    }

    fn make_token(&self, kind: TokenKind, text: String, line: u32, offset: usize) -> Token {
        Token { kind, text, line, file: Rc::clone(&self.file), offset }
    }

    /// Produces the next token under the given expectation.
    pub(crate) fn next_token(&mut self, expect: Expect) -> ParseResult<Token> {
        self.skip_trivia()?;
        let line = self.line;
        let offset = self.pos;
        if self.finished || self.peek_char().is_none() {
            return Ok(self.make_token(TokenKind::Eof, String::new(), line, offset));
        }

        // __END__ / __DATA__ at line start end the program.
        if self.at_line_start() && self.lookahead_word_is("__END__") || self.at_line_start() && self.lookahead_word_is("__DATA__") {
            self.finished = true;
            return Ok(self.make_token(TokenKind::Eof, String::new(), line, offset));
        }

        let c = self.peek_char().unwrap_or('\0');

        // Numbers (also `.5` at term position).
        if c.is_ascii_digit() || (c == '.' && expect == Expect::Term && self.peek_at(1).is_some_and(|d| d.is_ascii_digit())) {
            let text = self.lex_number();
            return Ok(self.make_token(TokenKind::Number, text, line, offset));
        }

        // Strings.
        if c == '\'' {
            self.bump();
            let value = self.scan_single_quoted('\'')?;
            return Ok(self.make_token(TokenKind::SingleStr(value), String::new(), line, offset));
        }
        if c == '"' {
            self.bump();
            let raw = self.scan_raw_delimited('"')?;
            return Ok(self.make_token(TokenKind::DoubleStr(raw), String::new(), line, offset));
        }
        if c == '`' {
            self.bump();
            let raw = self.scan_raw_delimited('`')?;
            return Ok(self.make_token(TokenKind::Backtick(raw), String::new(), line, offset));
        }

        if expect == Expect::Term {
            // Heredoc or readline.
            if c == '<' {
                let tag_start = self.peek_at(2);
                if self.peek_at(1) == Some('<')
                    && tag_start.is_some_and(|t| t == '~' || t == '"' || t == '\'' || t == '_' || t.is_ascii_alphabetic())
                {
                    return self.lex_heredoc(line, offset);
                }
                if let Some(tok) = self.try_lex_readline(line, offset) {
                    return Ok(tok);
                }
            }
            // Bare regex.
            if c == '/' {
                self.bump();
                let (pattern, _) = self.scan_quote_body('/')?;
                let mods = self.scan_modifiers();
                return Ok(self.make_token(
                    TokenKind::Match { pattern, mods, interpolate: true },
                    String::new(),
                    line,
                    offset,
                ));
            }
            // Sigil variables.
            if matches!(c, '$' | '@' | '%' | '&' | '*') {
                if let Some(tok) = self.try_lex_variable(line, offset)? {
                    return Ok(tok);
                }
                // Fall through to operator lexing (deref sigil, `%`/`*` ops).
            }
        }

        // `x=` repetition-assignment: `x` would otherwise lex as a bareword.
        if expect == Expect::Operator && c == 'x' && self.peek_at(1) == Some('=') && self.peek_at(2) != Some('=') {
            self.pos += 2;
            return Ok(self.make_token(TokenKind::Op, "x=".to_string(), line, offset));
        }

        // Identifiers, keywords, quote-like operators.
        if c.is_ascii_alphabetic() || c == '_' {
            let word = self.lex_word();
            if expect == Expect::Term {
                if let Some(tok) = self.try_lex_quotelike(&word, line, offset)? {
                    return Ok(tok);
                }
            }
            return Ok(self.make_token(TokenKind::Ident, word, line, offset));
        }

        // Operators, longest match first.
        for op in OPERATORS {
            if self.lookahead_is(op) {
                // `<<` at term position was handled above; at operator
                // position it is a shift.
                self.pos += op.chars().count();
                return Ok(self.make_token(TokenKind::Op, (*op).to_string(), line, offset));
            }
        }

        Err(self.error(format!("Unrecognized character '{c}'")))
    }

    fn lookahead_is(&self, s: &str) -> bool {
        s.chars().enumerate().all(|(i, c)| self.peek_at(i) == Some(c))
    }

    fn lookahead_word_is(&self, word: &str) -> bool {
        self.lookahead_is(word)
            && !self.peek_at(word.chars().count()).is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
    }

    fn lex_word(&mut self) -> String {
        let mut word = String::new();
        while let Some(c) = self.peek_char() {
            if c.is_ascii_alphanumeric() || c == '_' {
                word.push(c);
                self.pos += 1;
            } else if c == ':' && self.peek_at(1) == Some(':') && self.peek_at(2).is_some_and(|n| n.is_ascii_alphabetic() || n == '_') {
                word.push_str("::");
                self.pos += 2;
            } else {
                break;
            }
        }
        word
    }

    fn lex_number(&mut self) -> String {
        let mut text = String::new();
        // 0x / 0b / 0o prefixes.
        if self.peek_char() == Some('0') && matches!(self.peek_at(1), Some('x' | 'X' | 'b' | 'B')) {
            text.push(self.bump().unwrap_or('0'));
            text.push(self.bump().unwrap_or('x'));
            while let Some(c) = self.peek_char() {
                if c.is_ascii_hexdigit() || c == '_' {
                    text.push(c);
                    self.pos += 1;
                } else {
                    break;
                }
            }
            return text;
        }
        let mut seen_dot = false;
        let mut seen_exp = false;
        while let Some(c) = self.peek_char() {
            match c {
                '0'..='9' | '_' => {
                    text.push(c);
                    self.pos += 1;
                }
                '.' if !seen_dot && !seen_exp => {
                    // `..` is the range operator, not a decimal point.
                    if self.peek_at(1) == Some('.') {
                        break;
                    }
                    seen_dot = true;
                    text.push(c);
                    self.pos += 1;
                }
                'e' | 'E' if !seen_exp => {
                    let next = self.peek_at(1);
                    let next2 = self.peek_at(2);
                    let exp_ok = next.is_some_and(|n| n.is_ascii_digit())
                        || (matches!(next, Some('+' | '-')) && next2.is_some_and(|n| n.is_ascii_digit()));
                    if !exp_ok {
                        break;
                    }
                    seen_exp = true;
                    text.push(c);
                    self.pos += 1;
                    if matches!(self.peek_char(), Some('+' | '-')) {
                        text.push(self.bump().unwrap_or('+'));
                    }
                }
                _ => break,
            }
        }
        text
    }

    /// Lexes `$name`-style variables. Returns `None` when the sigil starts a
    /// dereference chain (`$$x`, `@{...}`) that the parser assembles itself.
    fn try_lex_variable(&mut self, line: u32, offset: usize) -> ParseResult<Option<Token>> {
        let sigil = self.peek_char().unwrap_or('$');
        let ahead = 1;

        // `$#` — last index: `$#array` is a Var, `$#{` / `$#$` is an Op.
        if sigil == '$' && self.peek_at(1) == Some('#') {
            match self.peek_at(2) {
                Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                    self.pos += 2;
                    let name = self.lex_word();
                    return Ok(Some(self.make_token(TokenKind::Var, format!("$#{name}"), line, offset)));
                }
                Some('{' | '$') => {
                    self.pos += 2;
                    return Ok(Some(self.make_token(TokenKind::Op, "$#".to_string(), line, offset)));
                }
                _ => return Err(self.error("Expected array name after '$#'")),
            }
        }

        match self.peek_at(ahead) {
            // Identifier: plain variable.
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                self.pos += 1;
                let name = self.lex_word();
                return Ok(Some(self.make_token(TokenKind::Var, format!("{sigil}{name}"), line, offset)));
            }
            // Digits: capture variables and $0.
            Some(c) if c.is_ascii_digit() && sigil == '$' => {
                self.pos += 1;
                let mut name = String::new();
                while let Some(d) = self.peek_char() {
                    if d.is_ascii_digit() {
                        name.push(d);
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
                return Ok(Some(self.make_token(TokenKind::Var, format!("${name}"), line, offset)));
            }
            // `${name}` and `${^NAME}`.
            Some('{') => {
                let mut probe = ahead + 1;
                let mut name = String::new();
                if self.peek_at(probe) == Some('^') {
                    name.push('^');
                    probe += 1;
                }
                while let Some(c) = self.peek_at(probe) {
                    if c.is_ascii_alphanumeric() || c == '_' || (c == ':' && self.peek_at(probe + 1) == Some(':')) {
                        if c == ':' {
                            name.push_str("::");
                            probe += 2;
                        } else {
                            name.push(c);
                            probe += 1;
                        }
                    } else {
                        break;
                    }
                }
                if self.peek_at(probe) == Some('}') && !name.is_empty() {
                    self.pos += probe + 1;
                    return Ok(Some(self.make_token(TokenKind::Var, format!("{sigil}{name}"), line, offset)));
                }
                // `${ EXPR }` block deref: emit the bare sigil operator.
                self.pos += 1;
                return Ok(Some(self.make_token(TokenKind::Op, sigil.to_string(), line, offset)));
            }
            // `$^X` control names.
            Some('^') if sigil == '$' => {
                self.pos += 2;
                let mut name = String::from("^");
                while let Some(c) = self.peek_char() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        name.push(c);
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
                return Ok(Some(self.make_token(TokenKind::Var, format!("${name}"), line, offset)));
            }
            // `$$`: pid when not followed by something derefable.
            Some('$') => {
                let after = self.peek_at(ahead + 1);
                if sigil == '$' && !after.is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == '{' || c == '$') {
                    self.pos += 2;
                    return Ok(Some(self.make_token(TokenKind::Var, "$$".to_string(), line, offset)));
                }
                // Deref chain: emit the sigil operator alone.
                self.pos += 1;
                return Ok(Some(self.make_token(TokenKind::Op, sigil.to_string(), line, offset)));
            }
            // Punctuation specials.
            Some(p) if sigil == '$' && matches!(p, '_' | '@' | '!' | '/' | '\\' | ',' | '"' | ';' | '&' | '`' | '\'' | '+' | '-' | '.') => {
                self.pos += 2;
                return Ok(Some(self.make_token(TokenKind::Var, format!("${p}"), line, offset)));
            }
            Some(p) if (sigil == '@' || sigil == '%') && matches!(p, '_' | '+' | '-') => {
                self.pos += 2;
                return Ok(Some(self.make_token(TokenKind::Var, format!("{sigil}{p}"), line, offset)));
            }
            _ => {}
        }
        // Not a variable form we lex directly; let the operator table take it.
        Ok(None)
    }

    fn try_lex_readline(&mut self, line: u32, offset: usize) -> Option<Token> {
        // `<>`, `<STDIN>`, `<$fh>`; anything else is a less-than.
        let mut probe = 1;
        let mut inner = String::new();
        if self.peek_at(probe) == Some('$') {
            inner.push('$');
            probe += 1;
        }
        while let Some(c) = self.peek_at(probe) {
            if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
                inner.push(c);
                probe += 1;
            } else {
                break;
            }
        }
        if self.peek_at(probe) == Some('>') && inner != "$" {
            self.pos += probe + 1;
            return Some(self.make_token(TokenKind::ReadLine(inner), String::new(), line, offset));
        }
        None
    }

    /// Recognizes `q qq qw qr m s tr y` followed by a delimiter.
    fn try_lex_quotelike(&mut self, word: &str, line: u32, offset: usize) -> ParseResult<Option<Token>> {
        if !matches!(word, "q" | "qq" | "qw" | "qr" | "qx" | "m" | "s" | "tr" | "y") {
            return Ok(None);
        }
        // `q => 1` is a bareword, not a quote; so is `s;` with no delimiter.
        let mut probe = 0;
        while self.peek_at(probe).is_some_and(|c| c == ' ' || c == '\t') {
            probe += 1;
        }
        let Some(delim) = self.peek_at(probe) else { return Ok(None) };
        if delim.is_ascii_alphanumeric() || delim == '_' || delim == '=' && self.peek_at(probe + 1) == Some('>') {
            return Ok(None);
        }
        if matches!(delim, ',' | ';' | ')' | '}' | ']' | '>' | '=') {
            return Ok(None);
        }
        self.pos += probe;
        let open = self.bump().ok_or_else(|| self.error("Unexpected end of input in quote"))?;
        let interpolate = open != '\'';

        match word {
            "q" => {
                let value = self.scan_single_quoted_like(open)?;
                Ok(Some(self.make_token(TokenKind::SingleStr(value), String::new(), line, offset)))
            }
            "qq" => {
                let (raw, _) = self.scan_quote_body(open)?;
                Ok(Some(self.make_token(TokenKind::DoubleStr(raw), String::new(), line, offset)))
            }
            "qx" => {
                let (raw, _) = self.scan_quote_body(open)?;
                Ok(Some(self.make_token(TokenKind::Backtick(raw), String::new(), line, offset)))
            }
            "qw" => {
                let (raw, _) = self.scan_quote_body(open)?;
                let words = raw.split_whitespace().map(str::to_string).collect();
                Ok(Some(self.make_token(TokenKind::QwList(words), String::new(), line, offset)))
            }
            "qr" => {
                let (pattern, _) = self.scan_quote_body(open)?;
                let mods = self.scan_modifiers();
                Ok(Some(self.make_token(TokenKind::QrLiteral { pattern, mods, interpolate }, String::new(), line, offset)))
            }
            "m" => {
                let (pattern, _) = self.scan_quote_body(open)?;
                let mods = self.scan_modifiers();
                Ok(Some(self.make_token(TokenKind::Match { pattern, mods, interpolate }, String::new(), line, offset)))
            }
            "s" => {
                let (pattern, close) = self.scan_quote_body(open)?;
                let replacement = self.scan_second_part(open, close)?;
                let mods = self.scan_modifiers();
                Ok(Some(self.make_token(
                    TokenKind::Subst { pattern, replacement, mods, interpolate },
                    String::new(),
                    line,
                    offset,
                )))
            }
            "tr" | "y" => {
                let (search, close) = self.scan_quote_body(open)?;
                let replacement = self.scan_second_part(open, close)?;
                let mods = self.scan_modifiers();
                Ok(Some(self.make_token(TokenKind::Trans { search, replacement, mods }, String::new(), line, offset)))
            }
            _ => Ok(None),
        }
    }

    /// Scans a delimited body keeping escapes raw (for later sub-parsing).
    /// Paired delimiters nest. Returns the body and the closing delimiter.
    fn scan_quote_body(&mut self, open: char) -> ParseResult<(String, char)> {
        let close = paired_close(open).unwrap_or(open);
        let nested = paired_close(open).is_some();
        let mut depth = 1usize;
        let mut body = String::new();
        loop {
            let Some(c) = self.bump() else {
                return Err(self.error(format!("Can't find string terminator \"{close}\" anywhere before EOF")));
            };
            if c == '\\' {
                body.push(c);
                if let Some(next) = self.bump() {
                    body.push(next);
                }
                continue;
            }
            if nested && c == open {
                depth += 1;
            } else if c == close {
                depth -= 1;
                if depth == 0 {
                    return Ok((body, close));
                }
            }
            body.push(c);
        }
    }

    /// For `s` and `tr`: paired delimiters start a fresh delimiter for the
    /// second part; plain delimiters continue in place.
    fn scan_second_part(&mut self, open: char, _close: char) -> ParseResult<String> {
        if paired_close(open).is_some() {
            // Skip whitespace and comments between the parts.
            self.skip_trivia()?;
            let second = self.bump().ok_or_else(|| self.error("Substitution replacement not terminated"))?;
            let (body, _) = self.scan_quote_body(second)?;
            Ok(body)
        } else {
            let (body, _) = self.scan_quote_body(open)?;
            Ok(body)
        }
    }

    fn scan_modifiers(&mut self) -> String {
        let mut mods = String::new();
        while let Some(c) = self.peek_char() {
            if c.is_ascii_alphabetic() {
                mods.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }
        mods
    }

    /// `'...'`: only `\\` and `\'` are escapes.
    fn scan_single_quoted(&mut self, close: char) -> ParseResult<String> {
        let mut value = String::new();
        loop {
            let Some(c) = self.bump() else {
                return Err(self.error(format!("Can't find string terminator \"{close}\" anywhere before EOF")));
            };
            if c == '\\' {
                match self.peek_char() {
                    Some(n) if n == close || n == '\\' => {
                        value.push(n);
                        self.bump();
                    }
                    _ => value.push('\\'),
                }
            } else if c == close {
                return Ok(value);
            } else {
                value.push(c);
            }
        }
    }

    /// `q{...}` with paired or plain delimiters; same escape rules as `'...'`.
    fn scan_single_quoted_like(&mut self, open: char) -> ParseResult<String> {
        let close = paired_close(open).unwrap_or(open);
        let nested = paired_close(open).is_some();
        let mut depth = 1usize;
        let mut value = String::new();
        loop {
            let Some(c) = self.bump() else {
                return Err(self.error(format!("Can't find string terminator \"{close}\" anywhere before EOF")));
            };
            if c == '\\' {
                match self.peek_char() {
                    Some(n) if n == close || n == '\\' || (nested && n == open) => {
                        value.push(n);
                        self.bump();
                    }
                    _ => value.push('\\'),
                }
            } else if nested && c == open {
                depth += 1;
                value.push(c);
            } else if c == close {
                depth -= 1;
                if depth == 0 {
                    return Ok(value);
                }
                value.push(c);
            } else {
                value.push(c);
            }
        }
    }

    /// Scans `"..."` keeping escapes raw for the interpolation sub-parser.
    fn scan_raw_delimited(&mut self, close: char) -> ParseResult<String> {
        let mut body = String::new();
        loop {
            let Some(c) = self.bump() else {
                return Err(self.error(format!("Can't find string terminator \"{close}\" anywhere before EOF")));
            };
            if c == '\\' {
                body.push(c);
                if let Some(next) = self.bump() {
                    body.push(next);
                }
            } else if c == close {
                return Ok(body);
            } else {
                body.push(c);
            }
        }
    }

    /// Consumes raw source lines up to (and including) a line holding only
    /// `.` — the body of a `format` definition.
    pub(crate) fn take_lines_until_dot(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        // Drop the remainder of the current line first.
        while let Some(c) = self.bump() {
            if c == '\n' {
                break;
            }
        }
        loop {
            let mut line = String::new();
            loop {
                match self.bump() {
                    Some('\n') | None => break,
                    Some(c) => line.push(c),
                }
            }
            if line.trim() == "." || (line.is_empty() && self.peek_char().is_none()) {
                break;
            }
            lines.push(line);
        }
        lines
    }

    /// Lexes `<<TAG`, `<<"TAG"`, `<<'TAG'`, `<<~TAG` and captures the body by
    /// scanning forward past the current line.
    fn lex_heredoc(&mut self, line: u32, offset: usize) -> ParseResult<Token> {
        self.pos += 2; // consume `<<`
        let indented = if self.peek_char() == Some('~') {
            self.pos += 1;
            true
        } else {
            false
        };
        let (tag, interpolate) = match self.peek_char() {
            Some('"') => {
                self.pos += 1;
                let mut t = String::new();
                while let Some(c) = self.peek_char() {
                    if c == '"' {
                        break;
                    }
                    t.push(c);
                    self.pos += 1;
                }
                self.pos += 1;
                (t, true)
            }
            Some('\'') => {
                self.pos += 1;
                let mut t = String::new();
                while let Some(c) = self.peek_char() {
                    if c == '\'' {
                        break;
                    }
                    t.push(c);
                    self.pos += 1;
                }
                self.pos += 1;
                (t, false)
            }
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                let mut t = String::new();
                while let Some(c) = self.peek_char() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        t.push(c);
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
                (t, true)
            }
            _ => return Err(self.error("Use of bare << to mean <<\"\" is forbidden")),
        };

        // The body starts after the current line, or after bodies already
        // consumed by earlier heredocs on this same line.
        let body_start = if self.heredoc_watermark > self.pos {
            self.heredoc_watermark
        } else {
            let mut p = self.pos;
            while p < self.src.len() && self.src[p] != '\n' {
                p += 1;
            }
            p + 1
        };

        // Collect lines until the terminator.
        let mut body = String::new();
        let mut p = body_start;
        let mut found = false;
        let mut terminator_indent = String::new();
        while p < self.src.len() {
            let mut text = String::new();
            while p < self.src.len() && self.src[p] != '\n' {
                text.push(self.src[p]);
                p += 1;
            }
            let had_newline = p < self.src.len();
            if had_newline {
                p += 1;
            }
            let candidate = if indented { text.trim_start() } else { text.as_str() };
            if candidate == tag {
                found = true;
                if indented {
                    let ws_len = text.len() - text.trim_start().len();
                    terminator_indent = text[..ws_len].to_string();
                }
                break;
            }
            body.push_str(&text);
            if had_newline {
                body.push('\n');
            }
        }
        if !found {
            return Err(self.error(format!("Can't find string terminator \"{tag}\" anywhere before EOF")));
        }
        self.heredoc_watermark = p;

        if indented && !terminator_indent.is_empty() {
            body = body
                .split_inclusive('\n')
                .map(|l| l.strip_prefix(terminator_indent.as_str()).unwrap_or(l))
                .collect();
        }

        Ok(self.make_token(TokenKind::Heredoc { body, interpolate }, String::new(), line, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_all(src: &str) -> Vec<Token> {
        let mut lexer = Lexer::new(src, "t.pl");
        let mut out = Vec::new();
        let mut expect = Expect::Term;
        loop {
            let tok = lexer.next_token(expect).unwrap();
            if tok.kind == TokenKind::Eof {
                break;
            }
            // The real parser drives expectations from its grammar; for the
            // tests a keyword list is enough.
            expect = match &tok.kind {
                TokenKind::Op if matches!(tok.text.as_str(), ")" | "]" | "}") => Expect::Operator,
                TokenKind::Op | TokenKind::Eof => Expect::Term,
                TokenKind::Ident
                    if matches!(tok.text.as_str(), "my" | "our" | "local" | "return" | "print" | "use" | "if" | "while") =>
                {
                    Expect::Term
                }
                _ => Expect::Operator,
            };
            out.push(tok);
        }
        out
    }

    #[test]
    fn lexes_variables_and_operators() {
        let toks = lex_all("my $x = 40 + 2;");
        let texts: Vec<&str> = toks.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["my", "$x", "=", "40", "+", "2", ";"]);
        assert_eq!(toks[1].kind, TokenKind::Var);
        assert!(toks.windows(2).all(|w| w[0].offset < w[1].offset));
    }

    #[test]
    fn slash_is_match_at_term_and_division_after_term() {
        let toks = lex_all("$x / 2");
        assert!(toks[1].is_op("/"));
        let mut lexer = Lexer::new("/abc/i", "t.pl");
        let tok = lexer.next_token(Expect::Term).unwrap();
        match tok.kind {
            TokenKind::Match { pattern, mods, .. } => {
                assert_eq!(pattern, "abc");
                assert_eq!(mods, "i");
            }
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn quotelike_with_paired_delimiters() {
        let mut lexer = Lexer::new("s{a(b)}{X}g", "t.pl");
        let tok = lexer.next_token(Expect::Term).unwrap();
        match tok.kind {
            TokenKind::Subst { pattern, replacement, mods, .. } => {
                assert_eq!(pattern, "a(b)");
                assert_eq!(replacement, "X");
                assert_eq!(mods, "g");
            }
            other => panic!("expected subst, got {other:?}"),
        }
    }

    #[test]
    fn qw_splits_on_whitespace() {
        let mut lexer = Lexer::new("qw( foo bar  baz )", "t.pl");
        let tok = lexer.next_token(Expect::Term).unwrap();
        assert_eq!(tok.kind, TokenKind::QwList(vec!["foo".into(), "bar".into(), "baz".into()]));
    }

    #[test]
    fn heredoc_body_is_spliced() {
        let src = "my $x = <<EOF;\nhello\nworld\nEOF\nmy $y = 1;\n";
        let toks = lex_all(src);
        let heredoc = toks.iter().find(|t| matches!(t.kind, TokenKind::Heredoc { .. })).unwrap();
        match &heredoc.kind {
            TokenKind::Heredoc { body, interpolate } => {
                assert_eq!(body, "hello\nworld\n");
                assert!(interpolate);
            }
            _ => unreachable!(),
        }
        // Lexing continues after the heredoc body.
        assert!(toks.iter().any(|t| t.text == "$y"));
    }

    #[test]
    fn indented_heredoc_strips_terminator_indent() {
        let src = "my $x = <<~EOT;\n    a\n      b\n    EOT\n1;\n";
        let toks = lex_all(src);
        let heredoc = toks.iter().find(|t| matches!(t.kind, TokenKind::Heredoc { .. })).unwrap();
        match &heredoc.kind {
            TokenKind::Heredoc { body, .. } => assert_eq!(body, "a\n  b\n"),
            _ => unreachable!(),
        }
    }

    #[test]
    fn line_directive_rewrites_positions() {
        let src = "#line 100 \"gen.pl\"\nmy $x;\n";
        let mut lexer = Lexer::new(src, "t.pl");
        let tok = lexer.next_token(Expect::Term).unwrap();
        assert_eq!(tok.line, 100);
        assert_eq!(&*tok.file, "gen.pl");
    }

    #[test]
    fn pod_sections_are_skipped() {
        let src = "=head1 DESC\n\nprose\n\n=cut\nmy $x;\n";
        let toks = lex_all(src);
        assert_eq!(toks[0].text, "my");
    }

    #[test]
    fn dollar_dollar_is_pid_but_dollar_dollar_name_is_deref() {
        let toks = lex_all("$$;");
        assert_eq!(toks[0].kind, TokenKind::Var);
        assert_eq!(toks[0].text, "$$");
        let mut lexer = Lexer::new("$$x", "t.pl");
        let tok = lexer.next_token(Expect::Term).unwrap();
        assert!(tok.is_op("$"));
        let tok = lexer.next_token(Expect::Term).unwrap();
        assert_eq!(tok.text, "$x");
    }

    #[test]
    fn caret_variables_canonicalize() {
        let toks = lex_all("${^LAST_SUCCESSFUL_PATTERN} $^W;");
        assert_eq!(toks[0].text, "$^LAST_SUCCESSFUL_PATTERN");
        assert_eq!(toks[1].text, "$^W");
    }

    #[test]
    fn readline_tokens() {
        let mut lexer = Lexer::new("<STDIN> <$fh> <>", "t.pl");
        assert_eq!(lexer.next_token(Expect::Term).unwrap().kind, TokenKind::ReadLine("STDIN".into()));
        assert_eq!(lexer.next_token(Expect::Term).unwrap().kind, TokenKind::ReadLine("$fh".into()));
        assert_eq!(lexer.next_token(Expect::Term).unwrap().kind, TokenKind::ReadLine(String::new()));
    }
}
