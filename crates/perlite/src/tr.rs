//! Transliteration (`tr///`, `y///`).
//!
//! Search and replacement lists expand ranges and escapes at parse time into
//! a [`TransSpec`]; execution walks the target string once. The `c` (complement),
//! `d` (delete), `s` (squeeze), and `r` (non-destructive) modifiers follow
//! Perl's semantics; `r` itself is handled by the opcode, which decides
//! whether to write back.

use serde::{Deserialize, Serialize};

use crate::pack::PackError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransSpec {
    pub search: Vec<char>,
    pub replacement: Vec<char>,
    pub complement: bool,
    pub delete: bool,
    pub squeeze: bool,
    pub nondestructive: bool,
}

/// Parses the two halves and the modifier set. Ranges like `a-z-A` are
/// ambiguous and rejected, matching Perl's diagnostic.
pub(crate) fn parse_trans(search: &str, replacement: &str, mods: &str) -> Result<TransSpec, PackError> {
    let mut spec = TransSpec {
        search: expand_side(search)?,
        replacement: expand_side(replacement)?,
        complement: false,
        delete: false,
        squeeze: false,
        nondestructive: false,
    };
    for m in mods.chars() {
        match m {
            'c' => spec.complement = true,
            'd' => spec.delete = true,
            's' => spec.squeeze = true,
            'r' => spec.nondestructive = true,
            other => {
                return Err(PackError::new(format!("Unknown transliteration modifier '{other}'")));
            }
        }
    }
    Ok(spec)
}

fn expand_side(side: &str) -> Result<Vec<char>, PackError> {
    let chars: Vec<char> = side.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    // Whether the last emitted char closed a range (for `a-z-A` detection).
    let mut last_was_range = false;
    while i < chars.len() {
        let c = chars[i];
        if c == '\\' && i + 1 < chars.len() {
            out.push(unescape(chars[i + 1]));
            i += 2;
            last_was_range = false;
            continue;
        }
        if c == '-' && !out.is_empty() && i + 1 < chars.len() {
            if last_was_range {
                return Err(PackError::new("Ambiguous range in transliteration operator"));
            }
            let start = *out.last().unwrap_or(&'\0');
            let mut end = chars[i + 1];
            let mut skip = 2;
            if end == '\\' && i + 2 < chars.len() {
                end = unescape(chars[i + 2]);
                skip = 3;
            }
            if (end as u32) < (start as u32) {
                return Err(PackError::new(format!(
                    "Invalid range \"{start}-{end}\" in transliteration operator"
                )));
            }
            for code in (start as u32 + 1)..=(end as u32) {
                if let Some(ch) = char::from_u32(code) {
                    out.push(ch);
                }
            }
            i += skip;
            last_was_range = true;
            continue;
        }
        out.push(c);
        i += 1;
        last_was_range = false;
    }
    Ok(out)
}

fn unescape(c: char) -> char {
    match c {
        'n' => '\n',
        't' => '\t',
        'r' => '\r',
        'f' => '\x0C',
        'e' => '\x1B',
        '0' => '\0',
        other => other,
    }
}

impl TransSpec {
    /// Runs the transliteration, returning the transformed string and the
    /// number of characters matched.
    pub(crate) fn apply(&self, input: &str) -> (String, usize) {
        let mut out = String::with_capacity(input.len());
        let mut count = 0usize;
        // Last char this pass *translated*, for squeeze runs.
        let mut last_translated: Option<char> = None;
        for c in input.chars() {
            let position = self.search.iter().position(|&s| s == c);
            let matched = if self.complement { position.is_none() } else { position.is_some() };
            if !matched {
                out.push(c);
                last_translated = None;
                continue;
            }
            count += 1;
            let target = if self.complement {
                if self.replacement.is_empty() {
                    if self.delete { None } else { Some(c) }
                } else {
                    self.replacement.last().copied()
                }
            } else {
                let idx = position.unwrap_or(0);
                match self.replacement.get(idx) {
                    Some(&r) => Some(r),
                    None if self.delete => None,
                    None if self.replacement.is_empty() => Some(c),
                    None => self.replacement.last().copied(),
                }
            };
            match target {
                None => {
                    last_translated = None;
                }
                Some(r) => {
                    if self.squeeze && last_translated == Some(r) {
                        continue;
                    }
                    out.push(r);
                    last_translated = Some(r);
                }
            }
        }
        (out, count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(s: &str, r: &str, m: &str) -> TransSpec {
        parse_trans(s, r, m).unwrap()
    }

    #[test]
    fn basic_mapping_and_count() {
        let t = spec("a-z", "A-Z", "");
        let (out, n) = t.apply("Hello, World!");
        assert_eq!(out, "HELLO, WORLD!");
        assert_eq!(n, 8);
    }

    #[test]
    fn count_only_uses_match_total() {
        let t = spec("aeiou", "", "");
        let (out, n) = t.apply("banana");
        // Empty replacement without /d is identity.
        assert_eq!(out, "banana");
        assert_eq!(n, 3);
    }

    #[test]
    fn delete_modifier_drops_unreplaced() {
        let t = spec("a-z", "x", "d");
        let (out, n) = t.apply("abc1");
        assert_eq!(out, "x1");
        assert_eq!(n, 3);
    }

    #[test]
    fn squeeze_collapses_runs() {
        let t = spec("a-z", "a-z", "s");
        let (out, _) = t.apply("aabbccdd");
        assert_eq!(out, "abcd");
        let t = spec("0-9", "#", "s");
        let (out, _) = t.apply("ab123cd45");
        assert_eq!(out, "ab#cd#");
    }

    #[test]
    fn complement_maps_nonmembers() {
        let t = spec("a-y", "z", "c");
        let (out, _) = t.apply("az!");
        assert_eq!(out, "azz");
        let t = spec("a-z", "", "cd");
        let (out, _) = t.apply("ab1cd2");
        assert_eq!(out, "abcd");
    }

    #[test]
    fn shorter_replacement_pads_with_last() {
        let t = spec("abc", "xy", "");
        let (out, _) = t.apply("abc");
        assert_eq!(out, "xyy");
    }

    #[test]
    fn ambiguous_range_is_rejected() {
        let err = parse_trans("a-z-A", "", "").unwrap_err();
        assert_eq!(err.message, "Ambiguous range in transliteration operator");
        assert!(parse_trans("z-a", "", "").is_err());
    }

    #[test]
    fn escapes_expand() {
        let t = spec("\\n", " ", "");
        let (out, _) = t.apply("a\nb");
        assert_eq!(out, "a b");
        let t = spec("a\\-z", "x", "");
        let (out, _) = t.apply("a-z");
        assert_eq!(out, "xxx");
    }
}
