//! `sprintf` formatting.
//!
//! Implements the core conversion set (`%s %c %d %u %o %x %X %b %e %E %f %g
//! %G %%`) with the `-`, `+`, space, `0`, and `#` flags, width and precision
//! (including `*` taken from the argument list). Unknown conversions pass
//! through literally, as Perl does, leaving the caller to warn.

use crate::{
    heap::Heap,
    resource::ResourceTracker,
    value::{Number, Value, fmt_double},
};

#[derive(Debug, Default, Clone, Copy)]
struct Flags {
    minus: bool,
    plus: bool,
    space: bool,
    zero: bool,
    alt: bool,
}

/// Formats `fmt` against `args`. Returns the text plus how many conversions
/// found no argument (the caller warns under `missing` semantics).
pub(crate) fn sprintf_value(
    fmt: &str,
    args: &[Value],
    heap: &Heap<impl ResourceTracker>,
) -> (String, usize) {
    let chars: Vec<char> = fmt.chars().collect();
    let mut out = String::with_capacity(fmt.len());
    let mut i = 0usize;
    let mut arg_i = 0usize;
    let mut missing = 0usize;

    let mut next_arg = |arg_i: &mut usize, missing: &mut usize| -> Value {
        match args.get(*arg_i) {
            Some(v) => {
                *arg_i += 1;
                v.clone()
            }
            None => {
                *arg_i += 1;
                *missing += 1;
                Value::Undef
            }
        }
    };

    while i < chars.len() {
        if chars[i] != '%' {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        i += 1;
        if i >= chars.len() {
            out.push('%');
            break;
        }
        if chars[i] == '%' {
            out.push('%');
            i += 1;
            continue;
        }

        let start = i;
        let mut flags = Flags::default();
        while i < chars.len() {
            match chars[i] {
                '-' => flags.minus = true,
                '+' => flags.plus = true,
                ' ' => flags.space = true,
                '0' => flags.zero = true,
                '#' => flags.alt = true,
                _ => break,
            }
            i += 1;
        }

        let mut width: Option<usize> = None;
        if i < chars.len() && chars[i] == '*' {
            let v = next_arg(&mut arg_i, &mut missing);
            let w = number_to_i64(v.numify().0);
            if w < 0 {
                flags.minus = true;
                width = Some(w.unsigned_abs() as usize);
            } else {
                width = Some(w as usize);
            }
            i += 1;
        } else {
            let mut w = 0usize;
            let mut have = false;
            while i < chars.len() && chars[i].is_ascii_digit() {
                w = w * 10 + chars[i].to_digit(10).unwrap_or(0) as usize;
                have = true;
                i += 1;
            }
            if have {
                width = Some(w);
            }
        }

        let mut precision: Option<usize> = None;
        if i < chars.len() && chars[i] == '.' {
            i += 1;
            if i < chars.len() && chars[i] == '*' {
                let v = next_arg(&mut arg_i, &mut missing);
                precision = Some(number_to_i64(v.numify().0).max(0) as usize);
                i += 1;
            } else {
                let mut p = 0usize;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    p = p * 10 + chars[i].to_digit(10).unwrap_or(0) as usize;
                    i += 1;
                }
                precision = Some(p);
            }
        }

        // Length modifiers are accepted and ignored (everything is 64-bit).
        while i < chars.len() && matches!(chars[i], 'h' | 'l' | 'q' | 'L') {
            i += 1;
        }

        let Some(&conv) = chars.get(i) else {
            out.push('%');
            out.extend(&chars[start..]);
            break;
        };
        i += 1;

        let text = match conv {
            's' => {
                let v = next_arg(&mut arg_i, &mut missing);
                let mut s = v.stringify(heap).to_string();
                if let Some(p) = precision {
                    s.truncate_chars(p);
                }
                pad(s, width, flags, false)
            }
            'c' => {
                let v = next_arg(&mut arg_i, &mut missing);
                let code = number_to_i64(v.numify().0);
                let s = char::from_u32(u32::try_from(code.max(0)).unwrap_or(0)).map_or(String::new(), String::from);
                pad(s, width, flags, false)
            }
            'd' | 'i' => {
                let v = next_arg(&mut arg_i, &mut missing);
                let n = number_to_i64(v.numify().0);
                let body = n.unsigned_abs().to_string();
                let sign = if n < 0 {
                    "-"
                } else if flags.plus {
                    "+"
                } else if flags.space {
                    " "
                } else {
                    ""
                };
                pad_numeric(sign, body, width, precision, flags)
            }
            'u' => {
                let v = next_arg(&mut arg_i, &mut missing);
                let n = number_to_u64(v.numify().0);
                pad_numeric("", n.to_string(), width, precision, flags)
            }
            'o' => {
                let v = next_arg(&mut arg_i, &mut missing);
                let n = number_to_u64(v.numify().0);
                let body = format!("{n:o}");
                let body = if flags.alt && !body.starts_with('0') { format!("0{body}") } else { body };
                pad_numeric("", body, width, precision, flags)
            }
            'x' | 'X' => {
                let v = next_arg(&mut arg_i, &mut missing);
                let n = number_to_u64(v.numify().0);
                let mut body = if conv == 'x' { format!("{n:x}") } else { format!("{n:X}") };
                if flags.alt && n != 0 {
                    body = format!("{}{body}", if conv == 'x' { "0x" } else { "0X" });
                }
                pad_numeric("", body, width, precision, flags)
            }
            'b' | 'B' => {
                let v = next_arg(&mut arg_i, &mut missing);
                let n = number_to_u64(v.numify().0);
                let mut body = format!("{n:b}");
                if flags.alt && n != 0 {
                    body = format!("0b{body}");
                }
                pad_numeric("", body, width, precision, flags)
            }
            'e' | 'E' => {
                let v = next_arg(&mut arg_i, &mut missing);
                let f = v.numify().0.as_f64();
                let p = precision.unwrap_or(6);
                let mut s = format!("{f:.p$e}");
                s = fix_exponent(&s, conv == 'E');
                if f >= 0.0 && flags.plus {
                    s.insert(0, '+');
                }
                pad(s, width, flags, true)
            }
            'f' | 'F' => {
                let v = next_arg(&mut arg_i, &mut missing);
                let f = v.numify().0.as_f64();
                let p = precision.unwrap_or(6);
                let mut s = format!("{f:.p$}");
                if f >= 0.0 && flags.plus {
                    s.insert(0, '+');
                }
                pad(s, width, flags, true)
            }
            'g' | 'G' => {
                let v = next_arg(&mut arg_i, &mut missing);
                let f = v.numify().0.as_f64();
                let mut s = fmt_double(f);
                if conv == 'G' {
                    s = s.to_uppercase();
                }
                if f >= 0.0 && flags.plus {
                    s.insert(0, '+');
                }
                pad(s, width, flags, true)
            }
            // Unknown conversions pass through literally.
            other => {
                out.push('%');
                out.extend(&chars[start..i - 1]);
                out.push(other);
                continue;
            }
        };
        out.push_str(&text);
    }

    (out, missing)
}

trait TruncateChars {
    fn truncate_chars(&mut self, n: usize);
}

impl TruncateChars for String {
    fn truncate_chars(&mut self, n: usize) {
        if let Some((idx, _)) = self.char_indices().nth(n) {
            self.truncate(idx);
        }
    }
}

fn number_to_i64(n: Number) -> i64 {
    match n {
        Number::Int(i) => i,
        Number::Float(f) => f as i64,
    }
}

fn number_to_u64(n: Number) -> u64 {
    match n {
        Number::Int(i) => i as u64,
        Number::Float(f) => {
            if f < 0.0 {
                (f as i64) as u64
            } else {
                f as u64
            }
        }
    }
}

fn pad(s: String, width: Option<usize>, flags: Flags, numeric: bool) -> String {
    let Some(width) = width else { return s };
    let len = s.chars().count();
    if len >= width {
        return s;
    }
    let fill = width - len;
    if flags.minus {
        format!("{s}{}", " ".repeat(fill))
    } else if flags.zero && numeric {
        // Zero padding goes after any sign.
        let (sign, rest) = match s.strip_prefix(['-', '+']) {
            Some(rest) => (&s[..1], rest),
            None => ("", s.as_str()),
        };
        format!("{sign}{}{rest}", "0".repeat(fill))
    } else {
        format!("{}{s}", " ".repeat(fill))
    }
}

fn pad_numeric(sign: &str, body: String, width: Option<usize>, precision: Option<usize>, flags: Flags) -> String {
    // Precision on integers means minimum digits.
    let body = match precision {
        Some(p) if body.len() < p => format!("{}{body}", "0".repeat(p - body.len())),
        _ => body,
    };
    let zero_ok = flags.zero && precision.is_none();
    let s = format!("{sign}{body}");
    pad(s, width, Flags { zero: zero_ok, ..flags }, true)
}

/// Rust writes `1.5e2`; C (and Perl) write `1.500000e+02`.
fn fix_exponent(s: &str, upper: bool) -> String {
    let Some((mantissa, exp)) = s.split_once(['e', 'E']) else { return s.to_string() };
    let (sign, digits) = match exp.strip_prefix('-') {
        Some(d) => ('-', d),
        None => ('+', exp.trim_start_matches('+')),
    };
    let e = if upper { 'E' } else { 'e' };
    format!("{mantissa}{e}{sign}{digits:0>2}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NoLimitTracker;

    fn fmt(template: &str, args: &[Value]) -> String {
        let heap: Heap<NoLimitTracker> = Heap::new(NoLimitTracker);
        sprintf_value(template, args, &heap).0
    }

    #[test]
    fn strings_and_widths() {
        assert_eq!(fmt("[%s]", &[Value::str("ab")]), "[ab]");
        assert_eq!(fmt("[%5s]", &[Value::str("ab")]), "[   ab]");
        assert_eq!(fmt("[%-5s]", &[Value::str("ab")]), "[ab   ]");
        assert_eq!(fmt("[%.1s]", &[Value::str("ab")]), "[a]");
    }

    #[test]
    fn integers() {
        assert_eq!(fmt("%d", &[Value::Int(-42)]), "-42");
        assert_eq!(fmt("%+d", &[Value::Int(42)]), "+42");
        assert_eq!(fmt("%05d", &[Value::Int(-42)]), "-0042");
        assert_eq!(fmt("%x", &[Value::Int(255)]), "ff");
        assert_eq!(fmt("%#X", &[Value::Int(255)]), "0XFF");
        assert_eq!(fmt("%o", &[Value::Int(8)]), "10");
        assert_eq!(fmt("%b", &[Value::Int(5)]), "101");
        assert_eq!(fmt("%d", &[Value::Num(3.9)]), "3");
    }

    #[test]
    fn floats() {
        assert_eq!(fmt("%f", &[Value::Num(2.5)]), "2.500000");
        assert_eq!(fmt("%.2f", &[Value::Num(2.5)]), "2.50");
        assert_eq!(fmt("%e", &[Value::Num(150.0)]), "1.500000e+02");
        assert_eq!(fmt("%g", &[Value::Num(0.5)]), "0.5");
    }

    #[test]
    fn star_width_from_args() {
        assert_eq!(fmt("[%*d]", &[Value::Int(5), Value::Int(7)]), "[    7]");
        assert_eq!(fmt("[%.*f]", &[Value::Int(1), Value::Num(2.53)]), "[2.5]");
    }

    #[test]
    fn percent_and_char() {
        assert_eq!(fmt("100%%", &[]), "100%");
        assert_eq!(fmt("%c", &[Value::Int(65)]), "A");
    }

    #[test]
    fn missing_args_count() {
        let heap: Heap<NoLimitTracker> = Heap::new(NoLimitTracker);
        let (s, missing) = sprintf_value("%s-%s", &[Value::str("a")], &heap);
        assert_eq!(s, "a-");
        assert_eq!(missing, 1);
    }
}
