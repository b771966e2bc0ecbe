//! Perl-pattern preprocessing.
//!
//! Rewrites Perl regex syntax into the dialect the backing engines accept,
//! collecting structural metadata on the way: capture counts, branch-reset
//! renumbering, named groups, and whether the pattern needs the backtracking
//! engine. Constructs the engines cannot express are rejected here with
//! Perl-ish diagnostics, or downgraded to never-matching assertions with a
//! warning when the unimplemented policy is lenient.

use super::{RegexError, RegexFlags};

#[derive(Debug, Default)]
pub(crate) struct Preprocessed {
    pub translated: String,
    pub n_groups: usize,
    /// Engine group `k+1` corresponds to Perl group `group_map[k]`.
    pub group_map: Vec<usize>,
    pub names: Vec<(String, usize)>,
    pub needs_fancy: bool,
    pub pos_anchored: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug)]
enum Scope {
    Group,
    BranchReset { saved: usize, max: usize },
}

struct Pre {
    chars: Vec<char>,
    i: usize,
    out: String,
    perl_counter: usize,
    group_map: Vec<usize>,
    names: Vec<(String, usize)>,
    engine_names: Vec<String>,
    scopes: Vec<Scope>,
    needs_fancy: bool,
    warnings: Vec<String>,
    lenient: bool,
}

/// Whether the unimplemented policy downgrades errors to warnings.
fn lenient_policy() -> bool {
    std::env::var("JPERL_UNIMPLEMENTED").is_ok_and(|v| v == "warn")
}

pub(crate) fn preprocess(pattern: &str, flags: RegexFlags) -> Result<Preprocessed, RegexError> {
    let mut pre = Pre {
        chars: pattern.chars().collect(),
        i: 0,
        out: String::with_capacity(pattern.len() + 8),
        perl_counter: 0,
        group_map: Vec::new(),
        names: Vec::new(),
        engine_names: Vec::new(),
        scopes: Vec::new(),
        needs_fancy: false,
        warnings: Vec::new(),
        lenient: lenient_policy(),
    };

    // `\G` as a leading anchor turns into start-position matching.
    let pos_anchored = pattern.starts_with("\\G");
    if pos_anchored {
        pre.i = 2;
    }

    pre.run(flags)?;

    Ok(Preprocessed {
        translated: pre.out,
        n_groups: pre.perl_counter,
        group_map: pre.group_map,
        names: pre.names,
        needs_fancy: pre.needs_fancy,
        pos_anchored,
        warnings: pre.warnings,
    })
}

impl Pre {
    fn peek(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.i + ahead).copied()
    }

    fn starts_with(&self, s: &str) -> bool {
        s.chars().enumerate().all(|(k, c)| self.peek(k) == Some(c))
    }

    fn unimplemented(&mut self, what: &str) -> Result<(), RegexError> {
        if self.lenient {
            self.warnings.push(format!("{what} not implemented; match will fail"));
            // Never-matching assertion keeps the pattern well-formed.
            self.out.push_str("(?!)");
            self.needs_fancy = true;
            Ok(())
        } else {
            Err(RegexError::new(format!("{what} not implemented in regex")))
        }
    }

    fn run(&mut self, flags: RegexFlags) -> Result<(), RegexError> {
        while let Some(c) = self.peek(0) {
            match c {
                '\\' => self.escape()?,
                '[' => self.char_class()?,
                '(' => self.open_group(flags)?,
                ')' => {
                    self.i += 1;
                    if let Some(Scope::BranchReset { saved: _, max }) = self.scopes.last() {
                        self.perl_counter = self.perl_counter.max(*max);
                    }
                    self.scopes.pop();
                    self.out.push(')');
                }
                '|' => {
                    self.i += 1;
                    if let Some(Scope::BranchReset { saved, max }) = self.scopes.last_mut() {
                        *max = (*max).max(self.perl_counter);
                        self.perl_counter = *saved;
                    }
                    self.out.push('|');
                }
                // Possessive quantifiers fall through to the engine, which
                // reports them as the syntax error they are for it.
                _ => {
                    self.i += 1;
                    self.out.push(c);
                }
            }
        }
        Ok(())
    }

    fn escape(&mut self) -> Result<(), RegexError> {
        let Some(next) = self.peek(1) else {
            return Err(RegexError::new("Trailing \\ in regex"));
        };
        match next {
            '1'..='9' => {
                self.needs_fancy = true;
                self.out.push('\\');
                self.out.push(next);
                self.i += 2;
            }
            'G' => {
                return Err(RegexError::new("\\G is only supported at the start of the pattern"));
            }
            'g' | 'k' => {
                self.backref_escape(next)?;
            }
            'N' => {
                self.i += 2;
                if self.starts_with("{U+") {
                    // \N{U+XXXX} → \x{XXXX}
                    self.i += 3;
                    let mut hex = String::new();
                    while let Some(c) = self.peek(0) {
                        if c == '}' {
                            break;
                        }
                        hex.push(c);
                        self.i += 1;
                    }
                    self.i += 1;
                    self.out.push_str(&format!("\\x{{{hex}}}"));
                } else if self.peek(0) == Some('{') {
                    return Err(RegexError::new("\\N{NAME} character names not supported in regex"));
                } else {
                    // \N — any char but newline, independent of /s.
                    self.out.push_str("[^\\n]");
                }
            }
            'h' => {
                self.out.push_str("[\\t\\p{Zs}]");
                self.i += 2;
            }
            'H' => {
                self.out.push_str("[^\\t\\p{Zs}]");
                self.i += 2;
            }
            'v' => {
                self.out.push_str("[\\n\\x0B\\f\\r\\x{85}\\x{2028}\\x{2029}]");
                self.i += 2;
            }
            'V' => {
                self.out.push_str("[^\\n\\x0B\\f\\r\\x{85}\\x{2028}\\x{2029}]");
                self.i += 2;
            }
            'R' => {
                self.out.push_str("(?:\\r\\n|[\\n\\x0B\\f\\r\\x{85}\\x{2028}\\x{2029}])");
                self.i += 2;
            }
            _ => {
                self.out.push('\\');
                self.out.push(next);
                self.i += 2;
            }
        }
        Ok(())
    }

    fn backref_escape(&mut self, kind: char) -> Result<(), RegexError> {
        // \g{N}, \gN, \g{name}, \k<name>, \k{name}, \k'name'
        self.i += 2;
        self.needs_fancy = true;
        match self.peek(0) {
            Some('{') => {
                self.i += 1;
                let mut inner = String::new();
                while let Some(c) = self.peek(0) {
                    if c == '}' {
                        break;
                    }
                    inner.push(c);
                    self.i += 1;
                }
                self.i += 1;
                if inner.starts_with('-') {
                    return Err(RegexError::new("Relative backreferences not supported in regex"));
                }
                if inner.chars().all(|c| c.is_ascii_digit()) {
                    self.out.push('\\');
                    self.out.push_str(&inner);
                } else {
                    self.out.push_str(&format!("\\k<{inner}>"));
                }
            }
            Some('<') | Some('\'') if kind == 'k' => {
                let close = if self.peek(0) == Some('<') { '>' } else { '\'' };
                self.i += 1;
                let mut name = String::new();
                while let Some(c) = self.peek(0) {
                    if c == close {
                        break;
                    }
                    name.push(c);
                    self.i += 1;
                }
                self.i += 1;
                self.out.push_str(&format!("\\k<{name}>"));
            }
            Some(c) if c.is_ascii_digit() => {
                let mut digits = String::new();
                while let Some(c) = self.peek(0) {
                    if !c.is_ascii_digit() {
                        break;
                    }
                    digits.push(c);
                    self.i += 1;
                }
                self.out.push('\\');
                self.out.push_str(&digits);
            }
            _ => return Err(RegexError::new("Malformed \\g or \\k backreference in regex")),
        }
        Ok(())
    }

    /// Copies a character class verbatim (no group syntax applies inside).
    fn char_class(&mut self) -> Result<(), RegexError> {
        self.out.push('[');
        self.i += 1;
        if self.peek(0) == Some('^') {
            self.out.push('^');
            self.i += 1;
        }
        if self.peek(0) == Some(']') {
            self.out.push_str("\\]");
            self.i += 1;
        }
        loop {
            match self.peek(0) {
                None => return Err(RegexError::new("Unmatched [ in regex")),
                Some('\\') => {
                    self.out.push('\\');
                    if let Some(n) = self.peek(1) {
                        self.out.push(n);
                    }
                    self.i += 2;
                }
                Some(']') => {
                    self.out.push(']');
                    self.i += 1;
                    return Ok(());
                }
                Some(c) => {
                    self.out.push(c);
                    self.i += 1;
                }
            }
        }
    }

    fn open_group(&mut self, flags: RegexFlags) -> Result<(), RegexError> {
        // Comment group: removed entirely so a following quantifier applies
        // to whatever preceded the comment.
        if self.starts_with("(?#") {
            self.i += 3;
            while let Some(c) = self.peek(0) {
                self.i += 1;
                if c == ')' {
                    return Ok(());
                }
            }
            return Err(RegexError::new("Sequence (?#... not terminated in regex"));
        }

        // Control verbs and alpha assertions.
        if self.starts_with("(*") {
            return self.star_group();
        }

        if self.starts_with("(?") {
            return self.question_group();
        }

        // Plain capturing group (non-capturing under /n).
        self.i += 1;
        self.scopes.push(Scope::Group);
        if flags.no_capture {
            self.out.push_str("(?:");
        } else {
            self.new_capture(None);
            self.out.push('(');
        }
        Ok(())
    }

    fn new_capture(&mut self, name: Option<&str>) {
        self.perl_counter += 1;
        self.group_map.push(self.perl_counter);
        if let Some(name) = name {
            let pair = (name.to_string(), self.perl_counter);
            if !self.names.contains(&pair) {
                self.names.push(pair);
            }
        }
    }

    fn star_group(&mut self) -> Result<(), RegexError> {
        let rest: String = self.chars[self.i + 2..].iter().collect();
        // Alpha assertions translate to classic lookaround.
        for (alpha, classic) in [
            ("pla:", "(?="),
            ("positive_lookahead:", "(?="),
            ("plb:", "(?<="),
            ("positive_lookbehind:", "(?<="),
            ("nla:", "(?!"),
            ("negative_lookahead:", "(?!"),
            ("nlb:", "(?<!"),
            ("negative_lookbehind:", "(?<!"),
            ("atomic:", "(?>"),
        ] {
            if rest.starts_with(alpha) {
                self.i += 2 + alpha.len();
                self.scopes.push(Scope::Group);
                self.needs_fancy = true;
                self.out.push_str(classic);
                return Ok(());
            }
        }
        // (*FAIL) / (*F) are exactly a failing assertion.
        for fail in ["FAIL)", "F)"] {
            if rest.starts_with(fail) {
                self.i += 2 + fail.len();
                self.out.push_str("(?!)");
                self.needs_fancy = true;
                return Ok(());
            }
        }
        for verb in ["ACCEPT", "PRUNE", "COMMIT", "SKIP", "THEN", "MARK"] {
            if rest.starts_with(verb) {
                // Consume through the closing paren.
                while let Some(c) = self.peek(0) {
                    self.i += 1;
                    if c == ')' {
                        break;
                    }
                }
                return self.unimplemented(&format!("Regex control verb (*{verb})"));
            }
        }
        Err(RegexError::new("Unknown verb pattern in regex"))
    }

    fn question_group(&mut self) -> Result<(), RegexError> {
        // self.i points at '('; chars[i+1] == '?'.
        let rest: String = self.chars[self.i + 2..].iter().take(24).collect();

        // Branch reset.
        if rest.starts_with('|') {
            self.i += 3;
            self.scopes.push(Scope::BranchReset { saved: self.perl_counter, max: self.perl_counter });
            self.out.push_str("(?:");
            return Ok(());
        }

        // Code blocks.
        if rest.starts_with('{') || rest.starts_with("?{") {
            return Err(RegexError::new("Eval-group (?{...}) not allowed at runtime"));
        }

        // Recursion.
        if rest.starts_with('&') || rest.starts_with("P>") || rest.starts_with('R') || rest.starts_with('0') {
            while let Some(c) = self.peek(0) {
                self.i += 1;
                if c == ')' {
                    break;
                }
            }
            return self.unimplemented("Regex recursion");
        }
        if rest.starts_with("P=") {
            // (?P=name) → named backreference.
            self.i += 4;
            let mut name = String::new();
            while let Some(c) = self.peek(0) {
                self.i += 1;
                if c == ')' {
                    break;
                }
                name.push(c);
            }
            self.needs_fancy = true;
            self.out.push_str(&format!("\\k<{name}>"));
            return Ok(());
        }

        // Conditionals are beyond both engines.
        if rest.starts_with('(') {
            return self.unimplemented("Regex conditional (?(...))");
        }

        // Named captures: (?<name>, (?'name', (?P<name>.
        let named = if rest.starts_with("P<") {
            Some(("P<".len(), '>'))
        } else if rest.starts_with('<') && !rest.starts_with("<=") && !rest.starts_with("<!") {
            Some(("<".len(), '>'))
        } else if rest.starts_with('\'') {
            Some(("'".len(), '\''))
        } else {
            None
        };
        if let Some((skip, close)) = named {
            self.i += 2 + skip;
            let mut name = String::new();
            while let Some(c) = self.peek(0) {
                if c == close {
                    break;
                }
                name.push(c);
                self.i += 1;
            }
            self.i += 1;
            self.new_capture(Some(&name));
            // Engines refuse duplicate names (legal in Perl under branch
            // reset), so alias duplicates on the engine side.
            let engine_name = if self.engine_names.contains(&name) {
                format!("{name}_br{}", self.group_map.len())
            } else {
                name.clone()
            };
            self.engine_names.push(name);
            self.scopes.push(Scope::Group);
            self.out.push_str(&format!("(?<{engine_name}>"));
            return Ok(());
        }

        // Lookaround and atomic groups go to the fancy engine.
        for look in ["<=", "<!", "=", "!", ">"] {
            if rest.starts_with(look) {
                self.i += 2 + look.len();
                self.scopes.push(Scope::Group);
                self.needs_fancy = true;
                self.out.push_str("(?");
                self.out.push_str(look);
                return Ok(());
            }
        }

        // Non-capturing group.
        if rest.starts_with(':') {
            self.i += 3;
            self.scopes.push(Scope::Group);
            self.out.push_str("(?:");
            return Ok(());
        }

        // Inline flags: (?flags) and (?flags:...), with `^` meaning "reset".
        self.i += 2;
        let mut seg = String::new();
        while let Some(c) = self.peek(0) {
            if c == ')' || c == ':' {
                break;
            }
            seg.push(c);
            self.i += 1;
        }
        let grouped = self.peek(0) == Some(':');
        self.i += 1;
        let filtered: String = seg.chars().filter(|c| matches!(c, 'i' | 'm' | 's' | 'x' | 'u' | 'U' | '-')).collect();
        let filtered = filtered.trim_end_matches('-').to_string();
        if grouped {
            self.scopes.push(Scope::Group);
            if filtered.is_empty() {
                self.out.push_str("(?:");
            } else {
                self.out.push_str(&format!("(?{filtered}:"));
            }
        } else if !filtered.is_empty() {
            self.out.push_str(&format!("(?{filtered})"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pre(pattern: &str) -> Preprocessed {
        preprocess(pattern, RegexFlags::default()).unwrap()
    }

    #[test]
    fn plain_groups_count_and_map() {
        let p = pre("(a)(b(c))");
        assert_eq!(p.n_groups, 3);
        assert_eq!(p.group_map, vec![1, 2, 3]);
        assert_eq!(p.translated, "(a)(b(c))");
        assert!(!p.needs_fancy);
    }

    #[test]
    fn comment_groups_vanish() {
        let p = pre("a(?#comment)b");
        assert_eq!(p.translated, "ab");
    }

    #[test]
    fn branch_reset_renumbers() {
        let p = pre("(?|(a)|(b)(x))(c)");
        // Engine sees three groups in the alternation plus the trailing one.
        assert_eq!(p.group_map, vec![1, 1, 2, 3]);
        assert_eq!(p.n_groups, 3);
        assert_eq!(p.translated, "(?:(a)|(b)(x))(c)");
    }

    #[test]
    fn alpha_assertion_translation() {
        assert_eq!(pre("(*pla:x)").translated, "(?=x)");
        assert_eq!(pre("(*nlb:x)").translated, "(?<!x)");
        assert!(pre("(*nla:x)").needs_fancy);
    }

    #[test]
    fn fail_verb_is_a_failing_assertion() {
        assert_eq!(pre("a(*FAIL)").translated, "a(?!)");
    }

    #[test]
    fn control_verbs_error_when_strict() {
        let err = preprocess("a(*ACCEPT)", RegexFlags::default()).unwrap_err();
        assert!(err.message.contains("(*ACCEPT)"));
    }

    #[test]
    fn recursion_is_rejected() {
        assert!(preprocess("(a)(?1)", RegexFlags::default()).is_err());
        assert!(preprocess("(?<x>a)(?&x)", RegexFlags::default()).is_err());
    }

    #[test]
    fn named_group_forms_normalize() {
        let p = pre("(?P<word>\\w+)");
        assert_eq!(p.translated, "(?<word>\\w+)");
        assert_eq!(p.names, vec![("word".to_string(), 1)]);
        let p = pre("(?'word'\\w+)");
        assert_eq!(p.translated, "(?<word>\\w+)");
    }

    #[test]
    fn python_backref_translates() {
        let p = pre("(?P<a>x)(?P=a)");
        assert_eq!(p.translated, "(?<a>x)\\k<a>");
        assert!(p.needs_fancy);
    }

    #[test]
    fn g_anchor_is_stripped_and_flagged() {
        let p = pre("\\Gfoo");
        assert!(p.pos_anchored);
        assert_eq!(p.translated, "foo");
    }

    #[test]
    fn char_class_contents_are_verbatim() {
        let p = pre("[a(b)|]x");
        assert_eq!(p.translated, "[a(b)|]x");
        assert_eq!(p.n_groups, 0);
    }

    #[test]
    fn caret_flag_reset_is_filtered() {
        let p = pre("(?^u:abc)");
        assert_eq!(p.translated, "(?u:abc)");
        let p = pre("(?^:abc)");
        assert_eq!(p.translated, "(?:abc)");
    }

    #[test]
    fn duplicate_names_alias_on_engine_side() {
        let p = pre("(?|(?<v>a)|(?<v>b))");
        assert_eq!(p.names, vec![("v".to_string(), 1)]);
        assert!(p.translated.contains("(?<v>a)"));
        assert!(p.translated.contains("(?<v_br2>b)"));
    }
}
