//! Compiled regexes and the matcher adaptor.
//!
//! Perl patterns are preprocessed (see [`preprocess`]) into the syntax the
//! backing engines accept, then compiled with `regex::Regex` when the pattern
//! needs no backtracking-only features, falling back to `fancy_regex::Regex`
//! for lookaround, backreferences, and atomic groups. Capture numbering is
//! Perl's: branch-reset groups renumber, and the adaptor remaps engine group
//! indices back through the preprocessor's group map.

pub(crate) mod preprocess;

use std::fmt;

use crate::value::RcStr;

/// Modifier flags of a pattern (`imsxpgcaednlur`). Match-time flags (`g`,
/// `c`) and substitution flags (`e`, `r`) ride along for the ops that need
/// them; the engines only see `imsx`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RegexFlags {
    pub ignore_case: bool,
    pub multiline: bool,
    pub dot_all: bool,
    pub extended: bool,
    pub global: bool,
    pub keep_pos: bool,
    pub preserve: bool,
    pub no_capture: bool,
    pub ascii: bool,
    pub eval_replacement: bool,
    pub nondestructive: bool,
}

impl RegexFlags {
    pub(crate) fn parse(mods: &str) -> Result<Self, RegexError> {
        let mut flags = Self::default();
        for c in mods.chars() {
            match c {
                'i' => flags.ignore_case = true,
                'm' => flags.multiline = true,
                's' => flags.dot_all = true,
                'x' => flags.extended = true,
                'g' => flags.global = true,
                'c' => flags.keep_pos = true,
                'p' => flags.preserve = true,
                'n' => flags.no_capture = true,
                'a' => flags.ascii = true,
                'e' => flags.eval_replacement = true,
                'r' => flags.nondestructive = true,
                // Charset semantics modifiers are accepted and inert.
                'd' | 'l' | 'u' => {}
                other => {
                    return Err(RegexError::new(format!("Unknown regexp modifier \"/{other}\"")));
                }
            }
        }
        Ok(flags)
    }

    /// The canonical modifier string (compile-relevant flags only).
    pub(crate) fn to_compile_string(self) -> String {
        let mut s = String::new();
        for (on, c) in [
            (self.ignore_case, 'i'),
            (self.multiline, 'm'),
            (self.dot_all, 's'),
            (self.extended, 'x'),
            (self.no_capture, 'n'),
            (self.ascii, 'a'),
        ] {
            if on {
                s.push(c);
            }
        }
        s
    }

    fn inline_prefix(self) -> String {
        let mut inner = String::new();
        if self.ignore_case {
            inner.push('i');
        }
        if self.multiline {
            inner.push('m');
        }
        if self.dot_all {
            inner.push('s');
        }
        if self.extended {
            inner.push('x');
        }
        if inner.is_empty() { String::new() } else { format!("(?{inner})") }
    }
}

/// A regex compilation failure.
#[derive(Debug, Clone)]
pub(crate) struct RegexError {
    pub message: String,
}

impl RegexError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl fmt::Display for RegexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug)]
enum Engine {
    Plain(regex::Regex),
    Fancy(fancy_regex::Regex),
}

/// A compiled pattern plus its structural metadata.
#[derive(Debug)]
pub struct CompiledRegex {
    pattern: String,
    pub(crate) flags: RegexFlags,
    engine: Engine,
    /// Engine group index → Perl group number (branch reset collapses these).
    group_map: Vec<usize>,
    /// Named groups: Perl-visible name → Perl group number.
    names: Vec<(String, usize)>,
    n_groups: usize,
    /// Pattern began with `\G` (anchors `/g` scans to `pos`).
    pos_anchored: bool,
}

impl CompiledRegex {
    /// Compiles a Perl pattern with the given modifier string.
    pub(crate) fn compile(pattern: &str, mods: &str) -> Result<Self, RegexError> {
        let flags = RegexFlags::parse(mods)?;
        Self::compile_with_flags(pattern, flags)
    }

    pub(crate) fn compile_with_flags(pattern: &str, flags: RegexFlags) -> Result<Self, RegexError> {
        let pre = preprocess::preprocess(pattern, flags)?;
        let full = format!("{}{}", flags.inline_prefix(), pre.translated);
        let engine = if pre.needs_fancy {
            Engine::Fancy(
                fancy_regex::Regex::new(&full)
                    .map_err(|e| RegexError::new(format!("Invalid regular expression: {e}")))?,
            )
        } else {
            match regex::Regex::new(&full) {
                Ok(re) => Engine::Plain(re),
                // The feature scan is conservative; fall back on any refusal.
                Err(_) => Engine::Fancy(
                    fancy_regex::Regex::new(&full)
                        .map_err(|e| RegexError::new(format!("Invalid regular expression: {e}")))?,
                ),
            }
        };
        Ok(Self {
            pattern: pattern.to_string(),
            flags,
            engine,
            group_map: pre.group_map,
            names: pre.names,
            n_groups: pre.n_groups,
            pos_anchored: pre.pos_anchored,
        })
    }

    pub(crate) fn pattern(&self) -> &str {
        &self.pattern
    }

    pub(crate) fn flags_string(&self) -> String {
        self.flags.to_compile_string()
    }

    /// The `qr//` stringification: `(?^flags:pattern)`.
    pub(crate) fn display_form(&self) -> String {
        format!("(?^{}:{})", self.flags.to_compile_string(), self.pattern)
    }

    pub(crate) fn n_groups(&self) -> usize {
        self.n_groups
    }

    pub(crate) fn names(&self) -> &[(String, usize)] {
        &self.names
    }

    pub(crate) fn is_pos_anchored(&self) -> bool {
        self.pos_anchored
    }

    /// Finds the first match at or after `start` (byte offset). Returns
    /// Perl-numbered capture spans; index 0 is the whole match.
    pub(crate) fn match_at(&self, haystack: &str, start: usize) -> Result<Option<Vec<Option<(usize, usize)>>>, RegexError> {
        let raw: Option<Vec<Option<(usize, usize)>>> = match &self.engine {
            Engine::Plain(re) => re
                .captures_at(haystack, start)
                .map(|caps| (0..caps.len()).map(|i| caps.get(i).map(|m| (m.start(), m.end()))).collect()),
            Engine::Fancy(re) => re
                .captures_from_pos(haystack, start)
                .map_err(|e| RegexError::new(format!("Regexp matching failed: {e}")))?
                .map(|caps| (0..caps.len()).map(|i| caps.get(i).map(|m| (m.start(), m.end()))).collect()),
        };
        let Some(raw) = raw else { return Ok(None) };
        if self.pos_anchored && raw.first().copied().flatten().is_some_and(|(s, _)| s != start) {
            return Ok(None);
        }
        // Remap engine group numbering onto Perl's.
        let mut spans: Vec<Option<(usize, usize)>> = vec![None; self.n_groups + 1];
        spans[0] = raw.first().copied().flatten();
        for (engine_idx, span) in raw.iter().enumerate().skip(1) {
            if let Some(&perl_idx) = self.group_map.get(engine_idx - 1)
                && span.is_some()
                && spans[perl_idx].is_none()
            {
                spans[perl_idx] = *span;
            }
        }
        Ok(Some(spans))
    }
}

/// The capture state of the most recent successful match, backing `$1`..`$n`,
/// `$&`, `` $` ``, `$'`, `@-`, `@+`, and `%+`.
#[derive(Debug, Clone, Default)]
pub(crate) struct MatchState {
    pub subject: RcStr,
    /// Perl-numbered spans; index 0 is the whole match.
    pub spans: Vec<Option<(usize, usize)>>,
    pub names: Vec<(String, usize)>,
}

impl MatchState {
    pub(crate) fn group_str(&self, n: usize) -> Option<&str> {
        let (start, end) = (*self.spans.get(n)?)?;
        self.subject.get(start..end)
    }

    pub(crate) fn named_str(&self, name: &str) -> Option<&str> {
        for (n, idx) in &self.names {
            if n == name
                && let Some(s) = self.group_str(*idx)
            {
                return Some(s);
            }
        }
        None
    }

    pub(crate) fn prematch(&self) -> Option<&str> {
        let (start, _) = (*self.spans.first()?)?;
        self.subject.get(..start)
    }

    pub(crate) fn postmatch(&self) -> Option<&str> {
        let (_, end) = (*self.spans.first()?)?;
        self.subject.get(end..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_patterns_match_with_captures() {
        let re = CompiledRegex::compile(r"(\w+)=(\d+)", "").unwrap();
        let spans = re.match_at("key=42", 0).unwrap().unwrap();
        assert_eq!(spans[0], Some((0, 6)));
        assert_eq!(spans[1], Some((0, 3)));
        assert_eq!(spans[2], Some((4, 6)));
        assert_eq!(re.n_groups(), 2);
    }

    #[test]
    fn case_insensitive_flag_applies() {
        let re = CompiledRegex::compile("abc", "i").unwrap();
        assert!(re.match_at("xABCy", 0).unwrap().is_some());
    }

    #[test]
    fn lookahead_routes_to_fancy() {
        let re = CompiledRegex::compile(r"foo(?=bar)", "").unwrap();
        assert!(re.match_at("foobar", 0).unwrap().is_some());
        assert!(re.match_at("foobaz", 0).unwrap().is_none());
    }

    #[test]
    fn comment_group_is_removed_and_quantifier_survives() {
        // The `{3}` quantifies the `a`, not a literal brace group.
        let re = CompiledRegex::compile("^a(?#xxx){3}c", "").unwrap();
        assert!(re.match_at("aaac", 0).unwrap().is_some());
        assert!(re.match_at("ac", 0).unwrap().is_none());
    }

    #[test]
    fn hex_escape_brace_then_quantifier() {
        let re = CompiledRegex::compile(r"(\x{100}){2}", "").unwrap();
        let subject = "\u{100}\u{100}";
        assert!(re.match_at(subject, 0).unwrap().is_some());
    }

    #[test]
    fn named_groups_are_recorded() {
        let re = CompiledRegex::compile(r"(?<word>\w+)", "").unwrap();
        assert_eq!(re.names(), &[("word".to_string(), 1)]);
        let spans = re.match_at("hi", 0).unwrap().unwrap();
        assert_eq!(spans[1], Some((0, 2)));
    }

    #[test]
    fn branch_reset_reuses_numbers() {
        let re = CompiledRegex::compile(r"(?|(a)|(b))(c)", "").unwrap();
        assert_eq!(re.n_groups(), 2);
        let spans = re.match_at("bc", 0).unwrap().unwrap();
        assert_eq!(spans[1], Some((0, 1)));
        assert_eq!(spans[2], Some((1, 2)));
    }

    #[test]
    fn alpha_assertions_translate() {
        let re = CompiledRegex::compile(r"foo(*nla:bar)", "").unwrap();
        assert!(re.match_at("foobaz", 0).unwrap().is_some());
        assert!(re.match_at("foobar", 0).unwrap().is_none());
    }

    #[test]
    fn control_verbs_are_rejected() {
        let err = CompiledRegex::compile(r"a(*ACCEPT)", "").unwrap_err();
        assert!(err.message.contains("not implemented"), "{}", err.message);
    }

    #[test]
    fn match_state_exposes_groups() {
        let re = CompiledRegex::compile(r"(?<k>\w+)=(\d+)", "").unwrap();
        let spans = re.match_at("x=1", 0).unwrap().unwrap();
        let state = MatchState {
            subject: "x=1".into(),
            spans,
            names: re.names().to_vec(),
        };
        assert_eq!(state.group_str(0), Some("x=1"));
        assert_eq!(state.group_str(1), Some("x"));
        assert_eq!(state.group_str(2), Some("1"));
        assert_eq!(state.named_str("k"), Some("x"));
        assert_eq!(state.prematch(), Some(""));
        assert_eq!(state.postmatch(), Some(""));
    }
}
