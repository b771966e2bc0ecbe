//! Template-driven binary packing.
//!
//! The template language is parsed once into [`TplNode`]s shared by `pack`
//! and `unpack`: format items with repeat counts and `! < >` modifiers,
//! groups (executed by mutual recursion back into the interpreter functions,
//! not by a duplicated parser), slash constructs, checksums, and the
//! `C0`/`U0` mode switches. Group-level endianness suffixes rewrite the
//! group body before parsing, preserving `!` ordering.

pub(crate) mod pack;
pub(crate) mod unpack;

use std::fmt;

/// Formats that accept the `<`/`>` endianness modifiers.
const ENDIAN_CAPABLE: &str = "sSiIlLqQjJfdFD";

/// Formats that accept `!`.
const NATIVE_CAPABLE: &str = "sSiIlLxXnNvV";

/// Numeric formats allowed before `/`.
const SLASH_COUNT_OK: &str = "cCsSlLnNvVqQjJiIwW";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Endian {
    Little,
    Big,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Repeat {
    One,
    Count(usize),
    Star,
}

#[derive(Debug, Clone)]
pub(crate) struct Item {
    pub code: char,
    pub repeat: Repeat,
    /// Repeat given as `[TEMPLATE]` — resolved to a byte count at parse time.
    pub native: bool,
    pub endian: Option<Endian>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PackMode {
    /// `C0` — positions and string formats count bytes.
    Byte,
    /// `U0` — positions and string formats count characters.
    Character,
}

#[derive(Debug, Clone)]
pub(crate) enum TplNode {
    Item(Item),
    Group { template: String, repeat: Repeat },
    /// `X/Y` — pack the count with X, then that many of Y.
    Slash { count: Item, elem: Box<TplNode> },
    /// `%N FMT` — checksum of the unpacked values, masked to N bits.
    Checksum { bits: u32, node: Box<TplNode> },
    Mode(PackMode),
}

/// A template error; stringifies with Perl's wording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PackError {
    pub message: String,
}

impl PackError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl fmt::Display for PackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

struct TplParser<'t> {
    chars: Vec<char>,
    i: usize,
    /// "pack" or "unpack", for error wording.
    role: &'t str,
}

/// Parses a full template for `pack` or `unpack`.
pub(crate) fn parse_template(template: &str, role: &str) -> Result<Vec<TplNode>, PackError> {
    let mut parser = TplParser { chars: template.chars().collect(), i: 0, role };
    parser.parse_nodes()
}

impl TplParser<'_> {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.i).copied()
    }

    fn skip_trivia(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() || c == ',' {
                self.i += 1;
            } else if c == '#' {
                while let Some(c) = self.peek() {
                    self.i += 1;
                    if c == '\n' {
                        break;
                    }
                }
            } else {
                break;
            }
        }
    }

    fn parse_nodes(&mut self) -> Result<Vec<TplNode>, PackError> {
        let mut nodes = Vec::new();
        loop {
            self.skip_trivia();
            let Some(c) = self.peek() else { break };
            if c == ')' {
                return Err(PackError::new(format!("')' allowed only after types in {}", self.role)));
            }
            let node = self.parse_one()?;
            // Slash construct: the node just parsed supplies the count.
            self.skip_trivia();
            if self.peek() == Some('/') {
                self.i += 1;
                let TplNode::Item(count) = node else {
                    return Err(PackError::new(format!("'/' must follow a numeric type in {}", self.role)));
                };
                if !SLASH_COUNT_OK.contains(count.code) && !matches!(count.code, 'a' | 'A' | 'Z') {
                    return Err(PackError::new(format!("'/' must follow a numeric type in {}", self.role)));
                }
                self.skip_trivia();
                if self.peek().is_none() {
                    return Err(PackError::new(format!("Code missing after '/' in {}", self.role)));
                }
                let elem = self.parse_one()?;
                nodes.push(TplNode::Slash { count, elem: Box::new(elem) });
                continue;
            }
            nodes.push(node);
        }
        Ok(nodes)
    }

    fn parse_one(&mut self) -> Result<TplNode, PackError> {
        let c = self.peek().unwrap_or('\0');

        // Checksum prefix.
        if c == '%' {
            self.i += 1;
            let mut bits = 0u32;
            let mut have_digits = false;
            while let Some(d) = self.peek() {
                if let Some(v) = d.to_digit(10) {
                    bits = bits.saturating_mul(10).saturating_add(v);
                    have_digits = true;
                    self.i += 1;
                } else {
                    break;
                }
            }
            if !have_digits {
                bits = 16;
            }
            self.skip_trivia();
            if self.peek().is_none() {
                return Err(PackError::new(format!("Code missing after '%' in {}", self.role)));
            }
            let node = self.parse_one()?;
            return Ok(TplNode::Checksum { bits, node: Box::new(node) });
        }

        // Group.
        if c == '(' {
            self.i += 1;
            let mut depth = 1usize;
            let mut body = String::new();
            loop {
                let Some(c) = self.peek() else {
                    return Err(PackError::new(format!("Mismatched parenthesis in {}", self.role)));
                };
                self.i += 1;
                if c == '(' {
                    depth += 1;
                } else if c == ')' {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                body.push(c);
            }
            // Modifiers and repeat after the group: `(...)<`, `(...)3`, `(...)*`.
            let mut endian = None;
            loop {
                match self.peek() {
                    Some('<') => {
                        self.check_group_endian(endian, Endian::Little)?;
                        endian = Some(Endian::Little);
                        self.i += 1;
                    }
                    Some('>') => {
                        self.check_group_endian(endian, Endian::Big)?;
                        endian = Some(Endian::Big);
                        self.i += 1;
                    }
                    Some('!') => {
                        self.i += 1;
                    }
                    _ => break,
                }
            }
            let repeat = self.parse_repeat(true)?;
            let template = match endian {
                Some(e) => apply_group_endian(&body, e, self.role)?,
                None => body,
            };
            return Ok(TplNode::Group { template, repeat });
        }

        // Ordinary format character.
        self.i += 1;
        if !"aAZbBhHcCwWsSlLqQjJiInNvVfdFDuUxX@.".contains(c) {
            return Err(PackError::new(format!("Invalid type '{c}' in {}", self.role)));
        }
        let mut native = false;
        let mut endian = None;
        loop {
            match self.peek() {
                Some('!') => {
                    if !NATIVE_CAPABLE.contains(c) {
                        return Err(PackError::new(format!(
                            "'!' allowed only after types {NATIVE_CAPABLE} in {}",
                            self.role
                        )));
                    }
                    native = true;
                    self.i += 1;
                }
                Some(e @ ('<' | '>')) => {
                    if !ENDIAN_CAPABLE.contains(c) {
                        return Err(PackError::new(format!("'{e}' allowed only after types {ENDIAN_CAPABLE} in {}", self.role)));
                    }
                    let new = if e == '<' { Endian::Little } else { Endian::Big };
                    if endian.is_some_and(|old| old != new) {
                        return Err(PackError::new(format!("Can't use both '<' and '>' after type '{c}' in {}", self.role)));
                    }
                    endian = Some(new);
                    self.i += 1;
                }
                _ => break,
            }
        }
        let repeat = self.parse_repeat(false)?;

        // `C0` / `U0` are mode switches, not zero-repeat items.
        if repeat == Repeat::Count(0) {
            if c == 'C' {
                return Ok(TplNode::Mode(PackMode::Byte));
            }
            if c == 'U' {
                return Ok(TplNode::Mode(PackMode::Character));
            }
        }

        Ok(TplNode::Item(Item { code: c, repeat, native, endian }))
    }

    fn check_group_endian(&self, old: Option<Endian>, new: Endian) -> Result<(), PackError> {
        if old.is_some_and(|o| o != new) {
            return Err(PackError::new(format!("Can't use both '<' and '>' in a group in {}", self.role)));
        }
        Ok(())
    }

    fn parse_repeat(&mut self, group: bool) -> Result<Repeat, PackError> {
        match self.peek() {
            Some('*') => {
                self.i += 1;
                Ok(Repeat::Star)
            }
            Some('[') => {
                self.i += 1;
                let mut body = String::new();
                let mut depth = 1usize;
                loop {
                    let Some(c) = self.peek() else {
                        return Err(PackError::new(format!("No group ending character ']' found in {}", self.role)));
                    };
                    self.i += 1;
                    if c == '[' {
                        depth += 1;
                    } else if c == ']' {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    body.push(c);
                }
                if body.contains('*') {
                    return Err(PackError::new(format!("Within []-length '*' not allowed in {}", self.role)));
                }
                // A digit-only bracket is a plain count.
                if body.chars().all(|c| c.is_ascii_digit()) && !body.is_empty() {
                    return Ok(Repeat::Count(body.parse().unwrap_or(0)));
                }
                let size = template_byte_size(&body, self.role)?;
                Ok(Repeat::Count(size))
            }
            Some(d) if d.is_ascii_digit() => {
                let mut n = 0usize;
                while let Some(d) = self.peek() {
                    if let Some(v) = d.to_digit(10) {
                        n = n.saturating_mul(10).saturating_add(v as usize);
                        self.i += 1;
                    } else {
                        break;
                    }
                }
                Ok(Repeat::Count(n))
            }
            _ => {
                let _ = group;
                Ok(Repeat::One)
            }
        }
    }
}

/// Rewrites a group body for a trailing `<`/`>`: each endian-capable format
/// gets the endian character appended after any `!` it already carries.
/// Nested groups without their own endianness recurse; an explicit
/// conflicting endianness inside is an error. Formats that don't take
/// endianness are left alone.
pub(crate) fn apply_group_endian(body: &str, endian: Endian, role: &str) -> Result<String, PackError> {
    let chars: Vec<char> = body.chars().collect();
    let mut out = String::with_capacity(body.len() + 8);
    let ec = if endian == Endian::Little { '<' } else { '>' };
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '(' {
            // Find the matching close, then check its own modifiers.
            let start = i + 1;
            let mut depth = 1usize;
            let mut j = start;
            while j < chars.len() {
                if chars[j] == '(' {
                    depth += 1;
                } else if chars[j] == ')' {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                j += 1;
            }
            if j >= chars.len() {
                return Err(PackError::new(format!("Mismatched parenthesis in {role}")));
            }
            let inner: String = chars[start..j].iter().collect();
            let mut k = j + 1;
            let mut has_own = false;
            while k < chars.len() && matches!(chars[k], '<' | '>' | '!') {
                if matches!(chars[k], '<' | '>') {
                    if chars[k] != ec {
                        return Err(PackError::new(format!("Can't use '{}' in a group with different byte-order in {role}", chars[k])));
                    }
                    has_own = true;
                }
                k += 1;
            }
            let rewritten = if has_own { inner } else { apply_group_endian(&inner, endian, role)? };
            out.push('(');
            out.push_str(&rewritten);
            out.push(')');
            out.push_str(&chars[j + 1..k].iter().collect::<String>());
            i = k;
            continue;
        }
        out.push(c);
        i += 1;
        if ENDIAN_CAPABLE.contains(c) {
            // Keep `!` before the endianness character.
            while i < chars.len() && chars[i] == '!' {
                out.push('!');
                i += 1;
            }
            if i < chars.len() && matches!(chars[i], '<' | '>') {
                if chars[i] != ec {
                    return Err(PackError::new(format!("Can't use '{}' in a group with different byte-order in {role}", chars[i])));
                }
                // Explicit, identical endianness: keep as written.
                continue;
            }
            out.push(ec);
        }
    }
    Ok(out)
}

/// Fixed byte width of a numeric format, with `!` applied.
pub(crate) fn numeric_width(code: char, native: bool) -> Option<usize> {
    let _ = native;
    match code {
        'c' | 'C' | 'W' => Some(1),
        's' | 'S' | 'v' | 'n' => Some(2),
        'l' | 'L' | 'V' | 'N' | 'f' => Some(4),
        'q' | 'Q' | 'j' | 'J' | 'd' | 'F' | 'D' => Some(8),
        'i' | 'I' => Some(4),
        _ => None,
    }
}

/// Byte size of a template packed with dummy values — the meaning of
/// `x[TEMPLATE]`. Measured in byte mode; `U` contributes the UTF-8 length of
/// U+0000, i.e. one byte. `*` was already rejected by the bracket parser.
pub(crate) fn template_byte_size(template: &str, role: &str) -> Result<usize, PackError> {
    let nodes = parse_template(template, role)?;
    let mut size = 0isize;
    for node in &nodes {
        size += node_byte_size(node, role)?;
    }
    Ok(usize::try_from(size.max(0)).unwrap_or(0))
}

fn node_byte_size(node: &TplNode, role: &str) -> Result<isize, PackError> {
    Ok(match node {
        TplNode::Mode(_) => 0,
        TplNode::Checksum { .. } => 0,
        TplNode::Slash { count, elem } => {
            let count_width = numeric_width(count.code, count.native).unwrap_or(0) as isize;
            count_width + node_byte_size(elem, role)?
        }
        TplNode::Group { template, repeat } => {
            let one = template_byte_size(template, role)? as isize;
            match repeat {
                Repeat::One => one,
                Repeat::Count(n) => one * (*n as isize),
                Repeat::Star => {
                    return Err(PackError::new(format!("Within []-length '*' not allowed in {role}")));
                }
            }
        }
        TplNode::Item(item) => {
            let n = match item.repeat {
                Repeat::One => 1isize,
                Repeat::Count(n) => n as isize,
                Repeat::Star => {
                    return Err(PackError::new(format!("Within []-length '*' not allowed in {role}")));
                }
            };
            match item.code {
                'a' | 'A' | 'Z' | 'x' => n,
                'X' => -n,
                '@' | '.' => 0,
                'b' | 'B' => (n + 7) / 8,
                'h' | 'H' => (n + 1) / 2,
                'u' => 0,
                'U' | 'w' => n,
                code => numeric_width(code, item.native).map_or(0, |w| w as isize) * n,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_items() {
        let nodes = parse_template("N n3 A*", "pack").unwrap();
        assert_eq!(nodes.len(), 3);
        match &nodes[0] {
            TplNode::Item(item) => {
                assert_eq!(item.code, 'N');
                assert_eq!(item.repeat, Repeat::One);
            }
            other => panic!("unexpected {other:?}"),
        }
        match &nodes[1] {
            TplNode::Item(item) => assert_eq!(item.repeat, Repeat::Count(3)),
            other => panic!("unexpected {other:?}"),
        }
        match &nodes[2] {
            TplNode::Item(item) => assert_eq!(item.repeat, Repeat::Star),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn slash_requires_numeric_count() {
        assert!(parse_template("N/S", "pack").is_ok());
        assert!(parse_template("a3/A*", "unpack").is_ok());
        let err = parse_template("(N)/S", "pack").unwrap_err();
        assert!(err.message.contains("'/' must follow a numeric type in pack"));
    }

    #[test]
    fn c0_and_u0_are_mode_switches() {
        let nodes = parse_template("C0 W", "pack").unwrap();
        assert!(matches!(nodes[0], TplNode::Mode(PackMode::Byte)));
        assert!(matches!(&nodes[1], TplNode::Item(item) if item.code == 'W'));
        let nodes = parse_template("U0C", "pack").unwrap();
        assert!(matches!(nodes[0], TplNode::Mode(PackMode::Character)));
    }

    #[test]
    fn bracket_repeat_measures_template() {
        let nodes = parse_template("x[s2]", "pack").unwrap();
        match &nodes[0] {
            TplNode::Item(item) => assert_eq!(item.repeat, Repeat::Count(4)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn star_in_bracket_is_rejected() {
        let err = parse_template("x[s<*]", "unpack").unwrap_err();
        assert_eq!(err.message, "Within []-length '*' not allowed in unpack");
    }

    #[test]
    fn group_endian_rewrite_inserts_after_native() {
        let out = apply_group_endian("l! I", Endian::Big, "pack").unwrap();
        assert_eq!(out, "l!> I>");
    }

    #[test]
    fn group_endian_rewrite_recurses_and_respects_explicit() {
        let out = apply_group_endian("s (l)", Endian::Little, "pack").unwrap();
        assert_eq!(out, "s< (l<)");
        let out = apply_group_endian("s< l", Endian::Little, "pack").unwrap();
        assert_eq!(out, "s< l<");
        let err = apply_group_endian("s> l", Endian::Little, "pack").unwrap_err();
        assert!(err.message.contains("different byte-order"));
    }

    #[test]
    fn invalid_type_is_reported() {
        let err = parse_template("y", "pack").unwrap_err();
        assert_eq!(err.message, "Invalid type 'y' in pack");
    }

    #[test]
    fn bang_is_restricted() {
        assert!(parse_template("l!", "pack").is_ok());
        let err = parse_template("d!", "pack").unwrap_err();
        assert!(err.message.starts_with("'!' allowed only after types"));
    }
}
