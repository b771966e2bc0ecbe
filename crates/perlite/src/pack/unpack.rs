//! The `unpack` direction.
//!
//! The state carries the input both as character codes and as bytes, with a
//! char→byte offset table keeping the two positions in lock-step: numeric
//! formats consume bytes, text formats consume characters, and `x`/`X`/`@`/
//! `.` arithmetic follows the active `C0`/`U0` mode. Group baselines make
//! `@` and `.` relative to the innermost group.

use super::{Endian, Item, PackError, PackMode, Repeat, TplNode, numeric_width, parse_template};
use crate::{
    heap::Heap,
    resource::ResourceTracker,
    value::{Number, Value, latin1_to_string},
};

pub(crate) fn unpack_values(
    template: &str,
    input: &Value,
    heap: &Heap<impl ResourceTracker>,
) -> Result<Vec<Value>, PackError> {
    let nodes = parse_template(template, "unpack")?;
    let mut state = UnpackState::new(input, heap);
    let mut out = Vec::new();
    state.run(&nodes, &mut out)?;
    Ok(out)
}

struct UnpackState {
    chars: Vec<u32>,
    bytes: Vec<u8>,
    /// Byte offset of each char boundary; length is `chars.len() + 1`.
    offsets: Vec<usize>,
    char_pos: usize,
    byte_pos: usize,
    mode: PackMode,
    /// (byte base, char base) per open group.
    bases: Vec<(usize, usize)>,
}

impl UnpackState {
    fn new(input: &Value, heap: &Heap<impl ResourceTracker>) -> Self {
        let (chars, bytes, offsets) = match input {
            Value::Bytes(b) => {
                let chars: Vec<u32> = b.iter().map(|&x| u32::from(x)).collect();
                let offsets: Vec<usize> = (0..=b.len()).collect();
                (chars, b.to_vec(), offsets)
            }
            other => {
                let s = other.stringify(heap);
                if s.chars().all(|c| (c as u32) <= 0xFF) {
                    let chars: Vec<u32> = s.chars().map(|c| c as u32).collect();
                    let bytes: Vec<u8> = s.chars().map(|c| c as u8).collect();
                    let offsets: Vec<usize> = (0..=bytes.len()).collect();
                    (chars, bytes, offsets)
                } else {
                    let chars: Vec<u32> = s.chars().map(|c| c as u32).collect();
                    let bytes = s.as_bytes().to_vec();
                    let mut offsets = Vec::with_capacity(chars.len() + 1);
                    let mut pos = 0;
                    for c in s.chars() {
                        offsets.push(pos);
                        pos += c.len_utf8();
                    }
                    offsets.push(pos);
                    (chars, bytes, offsets)
                }
            }
        };
        Self { chars, bytes, offsets, char_pos: 0, byte_pos: 0, mode: PackMode::Byte, bases: vec![(0, 0)] }
    }

    fn remaining_bytes(&self) -> usize {
        self.bytes.len().saturating_sub(self.byte_pos)
    }

    fn remaining_chars(&self) -> usize {
        self.chars.len().saturating_sub(self.char_pos)
    }

    /// Advances the char position to cover the current byte position.
    fn sync_chars_to_bytes(&mut self) {
        while self.char_pos < self.chars.len() && self.offsets[self.char_pos + 1] <= self.byte_pos {
            self.char_pos += 1;
        }
        while self.char_pos > 0 && self.offsets[self.char_pos] > self.byte_pos {
            self.char_pos -= 1;
        }
    }

    fn read_bytes(&mut self, n: usize) -> Option<&[u8]> {
        if self.remaining_bytes() < n {
            return None;
        }
        let start = self.byte_pos;
        self.byte_pos += n;
        self.sync_chars_to_bytes();
        Some(&self.bytes[start..start + n])
    }

    fn read_chars(&mut self, n: usize) -> Option<Vec<u32>> {
        if self.remaining_chars() < n {
            return None;
        }
        let out = self.chars[self.char_pos..self.char_pos + n].to_vec();
        self.char_pos += n;
        self.byte_pos = self.offsets[self.char_pos];
        Some(out)
    }

    fn seek_chars(&mut self, pos: usize) {
        self.char_pos = pos.min(self.chars.len());
        self.byte_pos = self.offsets[self.char_pos];
    }

    fn seek_bytes(&mut self, pos: usize) {
        self.byte_pos = pos.min(self.bytes.len());
        self.sync_chars_to_bytes();
    }

    fn run(&mut self, nodes: &[TplNode], out: &mut Vec<Value>) -> Result<(), PackError> {
        for node in nodes {
            match node {
                TplNode::Mode(mode) => self.mode = *mode,
                TplNode::Checksum { bits, node } => {
                    let mut values = Vec::new();
                    self.run(std::slice::from_ref(node), &mut values)?;
                    out.push(checksum(*bits, &values));
                }
                TplNode::Group { template, repeat } => {
                    let inner = parse_template(template, "unpack")?;
                    match repeat {
                        Repeat::One => self.group_once(&inner, out)?,
                        Repeat::Count(n) => {
                            for _ in 0..*n {
                                self.group_once(&inner, out)?;
                            }
                        }
                        Repeat::Star => loop {
                            let before = (self.byte_pos, self.char_pos);
                            if self.remaining_bytes() == 0 {
                                break;
                            }
                            self.group_once(&inner, out)?;
                            // A group that consumed nothing would loop forever.
                            if (self.byte_pos, self.char_pos) == before {
                                break;
                            }
                        },
                    }
                }
                TplNode::Slash { count, elem } => {
                    let mut count_vals = Vec::new();
                    self.item(&Item { repeat: Repeat::One, ..count.clone() }, &mut count_vals)?;
                    let n = match count_vals.first().map(Value::numify) {
                        Some((Number::Int(i), _)) => usize::try_from(i.max(0)).unwrap_or(0),
                        Some((Number::Float(f), _)) => f.max(0.0) as usize,
                        None => 0,
                    };
                    match &**elem {
                        TplNode::Item(item) => {
                            self.item(&Item { repeat: Repeat::Count(n), ..item.clone() }, out)?;
                        }
                        TplNode::Group { template, .. } => {
                            let inner = parse_template(template, "unpack")?;
                            for _ in 0..n {
                                self.group_once(&inner, out)?;
                            }
                        }
                        other => {
                            let _ = other;
                            return Err(PackError::new("Code missing after '/' in unpack"));
                        }
                    }
                }
                TplNode::Item(item) => self.item(item, out)?,
            }
        }
        Ok(())
    }

    fn group_once(&mut self, nodes: &[TplNode], out: &mut Vec<Value>) -> Result<(), PackError> {
        self.bases.push((self.byte_pos, self.char_pos));
        let result = self.run(nodes, out);
        self.bases.pop();
        result
    }

    fn item(&mut self, item: &Item, out: &mut Vec<Value>) -> Result<(), PackError> {
        match item.code {
            'a' | 'A' | 'Z' => self.string_format(item, out),
            'b' | 'B' => self.bit_format(item, out),
            'h' | 'H' => self.hex_format(item, out),
            'u' => self.uudecode(out),
            'x' => {
                let n = self.repeat_len(item.repeat, 1);
                match self.mode {
                    PackMode::Byte => {
                        if self.read_bytes(n).is_none() {
                            return Err(PackError::new("'x' outside of string in unpack"));
                        }
                    }
                    PackMode::Character => {
                        if self.read_chars(n).is_none() {
                            return Err(PackError::new("'x' outside of string in unpack"));
                        }
                    }
                }
                Ok(())
            }
            'X' => {
                let n = self.repeat_len(item.repeat, 1);
                match self.mode {
                    PackMode::Byte => {
                        if self.byte_pos < n {
                            return Err(PackError::new("'X' outside of string in unpack"));
                        }
                        self.seek_bytes(self.byte_pos - n);
                    }
                    PackMode::Character => {
                        if self.char_pos < n {
                            return Err(PackError::new("'X' outside of string in unpack"));
                        }
                        self.seek_chars(self.char_pos - n);
                    }
                }
                Ok(())
            }
            '@' => {
                let n = self.repeat_len(item.repeat, 0);
                let (byte_base, char_base) = *self.bases.last().unwrap_or(&(0, 0));
                match self.mode {
                    PackMode::Byte => self.seek_bytes(byte_base + n),
                    PackMode::Character => self.seek_chars(char_base + n),
                }
                Ok(())
            }
            '.' => {
                let (byte_base, char_base) = *self.bases.last().unwrap_or(&(0, 0));
                let offset = match self.mode {
                    PackMode::Byte => self.byte_pos.saturating_sub(byte_base),
                    PackMode::Character => self.char_pos.saturating_sub(char_base),
                };
                out.push(Value::Int(offset as i64));
                Ok(())
            }
            _ => self.numeric(item, out),
        }
    }

    fn repeat_len(&self, repeat: Repeat, default: usize) -> usize {
        match repeat {
            Repeat::One => default,
            Repeat::Count(n) => n,
            Repeat::Star => match self.mode {
                PackMode::Byte => self.remaining_bytes(),
                PackMode::Character => self.remaining_chars(),
            },
        }
    }

    fn string_format(&mut self, item: &Item, out: &mut Vec<Value>) -> Result<(), PackError> {
        let n = self.repeat_len(item.repeat, 1).min(match self.mode {
            PackMode::Byte => self.remaining_bytes(),
            PackMode::Character => self.remaining_chars(),
        });
        let raw: String = match self.mode {
            PackMode::Byte => {
                let bytes = self.read_bytes(n).unwrap_or(&[]).to_vec();
                latin1_to_string(&bytes)
            }
            PackMode::Character => {
                let chars = self.read_chars(n).unwrap_or_default();
                chars.iter().filter_map(|&c| char::from_u32(c)).collect()
            }
        };
        let value = match item.code {
            'a' => raw,
            'A' => raw.trim_end_matches(|c: char| c.is_whitespace() || c == '\0').to_string(),
            _ => match raw.find('\0') {
                Some(idx) => raw[..idx].to_string(),
                None => raw,
            },
        };
        out.push(Value::str(value));
        Ok(())
    }

    fn bit_format(&mut self, item: &Item, out: &mut Vec<Value>) -> Result<(), PackError> {
        let n_bits = match item.repeat {
            Repeat::One => 1,
            Repeat::Count(n) => n,
            Repeat::Star => self.remaining_bytes() * 8,
        };
        let n_bytes = n_bits.div_ceil(8).min(self.remaining_bytes());
        let n_bits = n_bits.min(n_bytes * 8);
        let bytes = self.read_bytes(n_bytes).unwrap_or(&[]).to_vec();
        let mut s = String::with_capacity(n_bits);
        for i in 0..n_bits {
            let byte = bytes[i / 8];
            let bit = if item.code == 'b' { (byte >> (i % 8)) & 1 } else { (byte >> (7 - i % 8)) & 1 };
            s.push(if bit == 1 { '1' } else { '0' });
        }
        out.push(Value::str(s));
        Ok(())
    }

    fn hex_format(&mut self, item: &Item, out: &mut Vec<Value>) -> Result<(), PackError> {
        let n_digits = match item.repeat {
            Repeat::One => 1,
            Repeat::Count(n) => n,
            Repeat::Star => self.remaining_bytes() * 2,
        };
        let n_bytes = n_digits.div_ceil(2).min(self.remaining_bytes());
        let n_digits = n_digits.min(n_bytes * 2);
        let bytes = self.read_bytes(n_bytes).unwrap_or(&[]).to_vec();
        let mut s = String::with_capacity(n_digits);
        for i in 0..n_digits {
            let byte = bytes[i / 2];
            let nybble = match (item.code, i % 2) {
                ('H', 0) | ('h', 1) => byte >> 4,
                _ => byte & 0xF,
            };
            s.push(char::from_digit(u32::from(nybble), 16).unwrap_or('0'));
        }
        out.push(Value::str(s));
        Ok(())
    }

    fn uudecode(&mut self, out: &mut Vec<Value>) -> Result<(), PackError> {
        let mut decoded = Vec::new();
        let dec = |c: u8| -> u8 {
            if c == b'`' { 0 } else { c.wrapping_sub(b' ') & 0x3F }
        };
        while self.remaining_bytes() > 0 {
            let Some(&len_char) = self.bytes.get(self.byte_pos) else { break };
            let line_len = dec(len_char) as usize;
            if line_len == 0 {
                break;
            }
            self.read_bytes(1);
            let mut line = Vec::new();
            while self.remaining_bytes() > 0 && self.bytes[self.byte_pos] != b'\n' {
                line.push(self.bytes[self.byte_pos]);
                self.byte_pos += 1;
            }
            self.read_bytes(usize::from(self.remaining_bytes() > 0));
            self.sync_chars_to_bytes();
            let mut bytes_done = 0;
            for quad in line.chunks(4) {
                let v: u32 = quad
                    .iter()
                    .enumerate()
                    .map(|(i, &c)| u32::from(dec(c)) << (18 - 6 * i))
                    .sum();
                for shift in [16, 8, 0] {
                    if bytes_done < line_len {
                        decoded.push(u8::try_from((v >> shift) & 0xFF).unwrap_or(0));
                        bytes_done += 1;
                    }
                }
            }
        }
        out.push(Value::from_bytes(decoded));
        Ok(())
    }

    fn numeric(&mut self, item: &Item, out: &mut Vec<Value>) -> Result<(), PackError> {
        match item.code {
            'w' => {
                let count = match item.repeat {
                    Repeat::One => 1,
                    Repeat::Count(n) => n,
                    Repeat::Star => usize::MAX,
                };
                let mut done = 0;
                while done < count && self.remaining_bytes() > 0 {
                    let mut value: u64 = 0;
                    loop {
                        let Some(bytes) = self.read_bytes(1) else {
                            return Err(PackError::new("Unterminated compressed integer in unpack"));
                        };
                        let b = bytes[0];
                        value = (value << 7) | u64::from(b & 0x7F);
                        if b & 0x80 == 0 {
                            break;
                        }
                    }
                    out.push(u64_to_value(value));
                    done += 1;
                }
                Ok(())
            }
            'U' => {
                let count = self.star_count(item.repeat, 1);
                for _ in 0..count {
                    match self.mode {
                        PackMode::Character => {
                            let Some(chars) = self.read_chars(1) else { break };
                            out.push(Value::Int(i64::from(chars[0])));
                        }
                        PackMode::Byte => {
                            // Decode one UTF-8 sequence from the byte stream.
                            let Some(&first) = self.bytes.get(self.byte_pos) else { break };
                            let len = utf8_len(first);
                            let Some(bytes) = self.read_bytes(len) else { break };
                            let s = String::from_utf8_lossy(bytes);
                            let code = s.chars().next().map_or(0xFFFD, |c| c as u32);
                            out.push(Value::Int(i64::from(code)));
                        }
                    }
                }
                Ok(())
            }
            'W' => {
                let count = self.star_count(item.repeat, 1);
                for _ in 0..count {
                    let Some(chars) = self.read_chars(1) else { break };
                    out.push(Value::Int(i64::from(chars[0])));
                }
                Ok(())
            }
            code => {
                let width = numeric_width(code, item.native)
                    .ok_or_else(|| PackError::new(format!("Invalid type '{code}' in unpack")))?;
                let count = match item.repeat {
                    Repeat::One => 1,
                    Repeat::Count(n) => n,
                    Repeat::Star => self.remaining_bytes() / width,
                };
                for _ in 0..count {
                    let endian = match code {
                        'n' | 'N' => Endian::Big,
                        'v' | 'V' => Endian::Little,
                        _ => item.endian.unwrap_or(Endian::Little),
                    };
                    let Some(bytes) = self.read_bytes(width) else { break };
                    let mut le = [0u8; 8];
                    match endian {
                        Endian::Little => le[..width].copy_from_slice(bytes),
                        Endian::Big => {
                            for (i, &b) in bytes.iter().rev().enumerate() {
                                le[i] = b;
                            }
                        }
                    }
                    let raw = u64::from_le_bytes(le);
                    let value = match code {
                        'c' => Value::Int(i64::from(raw as u8 as i8)),
                        'C' => Value::Int(i64::from(raw as u8)),
                        's' => Value::Int(i64::from(raw as u16 as i16)),
                        'S' | 'v' | 'n' if !item.native => Value::Int(i64::from(raw as u16)),
                        // `n!` / `v!` read signed.
                        'v' | 'n' => Value::Int(i64::from(raw as u16 as i16)),
                        'S' => Value::Int(i64::from(raw as u16)),
                        'l' => Value::Int(i64::from(raw as u32 as i32)),
                        'L' | 'V' | 'N' => Value::Int(i64::from(raw as u32)),
                        'i' => Value::Int(i64::from(raw as u32 as i32)),
                        'I' => Value::Int(i64::from(raw as u32)),
                        'q' | 'j' => Value::Int(raw as i64),
                        'Q' | 'J' => u64_to_value(raw),
                        'f' => Value::Num(f64::from(f32::from_bits(raw as u32))),
                        'd' | 'F' | 'D' => Value::Num(f64::from_bits(raw)),
                        other => {
                            return Err(PackError::new(format!("Invalid type '{other}' in unpack")));
                        }
                    };
                    out.push(value);
                }
                Ok(())
            }
        }
    }

    fn star_count(&self, repeat: Repeat, _width: usize) -> usize {
        match repeat {
            Repeat::One => 1,
            Repeat::Count(n) => n,
            Repeat::Star => match self.mode {
                PackMode::Byte => self.remaining_bytes(),
                PackMode::Character => self.remaining_chars(),
            },
        }
    }
}

fn utf8_len(first: u8) -> usize {
    match first {
        0x00..=0x7F => 1,
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        _ => 4,
    }
}

fn u64_to_value(v: u64) -> Value {
    match i64::try_from(v) {
        Ok(i) => Value::Int(i),
        Err(_) => Value::Num(v as f64),
    }
}

/// `%N FMT` — bit-masked sum of the unpacked values. Floats sum in floating
/// point; everything else sums wrapping. Empty input sums to 0.
fn checksum(bits: u32, values: &[Value]) -> Value {
    let float = values.iter().any(|v| matches!(v, Value::Num(_)));
    if float {
        let sum: f64 = values.iter().map(|v| v.numify().0.as_f64()).sum();
        if bits >= 64 {
            return Value::Num(sum);
        }
        let modulus = (1u128 << bits) as f64;
        return Value::Num(sum.rem_euclid(modulus));
    }
    let mut sum: u64 = 0;
    for v in values {
        let (n, _) = v.numify();
        let raw = match n {
            Number::Int(i) => i as u64,
            Number::Float(f) => f as u64,
        };
        sum = sum.wrapping_add(raw);
    }
    if bits < 64 {
        sum &= (1u64 << bits) - 1;
    }
    u64_to_value(sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{pack::pack::pack_values, resource::NoLimitTracker};

    fn heap() -> Heap<NoLimitTracker> {
        Heap::new(NoLimitTracker)
    }

    fn ints(values: &[Value]) -> Vec<i64> {
        values
            .iter()
            .map(|v| match v.numify().0 {
                Number::Int(i) => i,
                Number::Float(f) => f as i64,
            })
            .collect()
    }

    #[test]
    fn numeric_round_trip() {
        let h = heap();
        let packed = pack_values("N n v c", &[Value::Int(70000), Value::Int(513), Value::Int(513), Value::Int(-3)], &h).unwrap();
        let vals = unpack_values("N n v c", &packed, &h).unwrap();
        assert_eq!(ints(&vals), vec![70000, 513, 513, -3]);
    }

    #[test]
    fn slash_reads_count_then_items() {
        let h = heap();
        let packed = pack_values("N/S", &[Value::Int(1), Value::Int(2), Value::Int(3)], &h).unwrap();
        let vals = unpack_values("N/S", &packed, &h).unwrap();
        assert_eq!(ints(&vals), vec![1, 2, 3]);
    }

    #[test]
    fn slash_with_string_element() {
        let h = heap();
        let packed = pack_values("C/a*", &[Value::str("hello")], &h).unwrap();
        let vals = unpack_values("C/a", &packed, &h).unwrap();
        assert_eq!(&*vals[0].stringify(&h), "hello");
    }

    #[test]
    fn a_strips_and_z_stops_at_nul() {
        let h = heap();
        let vals = unpack_values("A5", &Value::from_bytes(b"ab  \0".to_vec()), &h).unwrap();
        assert_eq!(&*vals[0].stringify(&h), "ab");
        let vals = unpack_values("Z5", &Value::from_bytes(b"ab\0cd".to_vec()), &h).unwrap();
        assert_eq!(&*vals[0].stringify(&h), "ab");
        let vals = unpack_values("a3", &Value::from_bytes(b"ab\0xx".to_vec()), &h).unwrap();
        assert_eq!(vals[0].to_byte_vec(&h), b"ab\0");
    }

    #[test]
    fn h_star_hexdump() {
        let h = heap();
        let vals = unpack_values("H*", &Value::from_bytes(vec![0x00, 0x00, 0x00, 0x03, 0x01, 0x00]), &h).unwrap();
        assert_eq!(&*vals[0].stringify(&h), "000000030100");
    }

    #[test]
    fn w_reads_ber_sequences() {
        let h = heap();
        let packed = pack_values("w w", &[Value::Int(128), Value::Int(5)], &h).unwrap();
        let vals = unpack_values("w w", &packed, &h).unwrap();
        assert_eq!(ints(&vals), vec![128, 5]);
    }

    #[test]
    fn u_and_w_formats_differ_on_wide_input() {
        let h = heap();
        // Character-mode input: U reads codepoints.
        let packed = pack_values("U", &[Value::Int(0x100)], &h).unwrap();
        let vals = unpack_values("U", &packed, &h).unwrap();
        assert_eq!(ints(&vals), vec![0x100]);
        // W reads a codepoint, not UTF-8 bytes.
        let vals = unpack_values("W", &Value::str("\u{100}"), &h).unwrap();
        assert_eq!(ints(&vals), vec![0x100]);
    }

    #[test]
    fn dot_reports_group_relative_position() {
        let h = heap();
        let vals = unpack_values("C (C .)", &Value::from_bytes(vec![1, 2, 3]), &h).unwrap();
        assert_eq!(ints(&vals), vec![1, 2, 1]);
    }

    #[test]
    fn at_seeks_within_group_baseline() {
        let h = heap();
        let vals = unpack_values("C (C @0 C)", &Value::from_bytes(vec![9, 7, 8]), &h).unwrap();
        assert_eq!(ints(&vals), vec![9, 7, 7]);
    }

    #[test]
    fn group_star_stops_without_progress() {
        let h = heap();
        let vals = unpack_values("(C)*", &Value::from_bytes(vec![1, 2, 3]), &h).unwrap();
        assert_eq!(ints(&vals), vec![1, 2, 3]);
        // A pure-position group makes no progress and must terminate.
        let vals = unpack_values("(@0)*", &Value::from_bytes(vec![1]), &h).unwrap();
        assert!(vals.is_empty());
    }

    #[test]
    fn checksum_sums_with_mask() {
        let h = heap();
        let vals = unpack_values("%16C*", &Value::from_bytes(vec![250, 250]), &h).unwrap();
        assert_eq!(ints(&vals), vec![500]);
        let vals = unpack_values("%8C*", &Value::from_bytes(vec![250, 250]), &h).unwrap();
        assert_eq!(ints(&vals), vec![500 & 0xFF]);
        let vals = unpack_values("%16C*", &Value::from_bytes(Vec::new()), &h).unwrap();
        assert_eq!(ints(&vals), vec![0]);
    }

    #[test]
    fn uu_round_trip() {
        let h = heap();
        let packed = pack_values("u", &[Value::str("Hello, world! This line is long enough to span.")], &h).unwrap();
        let vals = unpack_values("u", &packed, &h).unwrap();
        assert_eq!(&*vals[0].stringify(&h), "Hello, world! This line is long enough to span.");
    }

    #[test]
    fn fixed_width_prefix_round_trips() {
        let h = heap();
        let packed = pack_values("N d A4", &[Value::Int(42), Value::Num(2.5), Value::str("perl")], &h).unwrap();
        let vals = unpack_values("N d A4", &packed, &h).unwrap();
        assert_eq!(ints(&vals[..1]), vec![42]);
        assert!(matches!(vals[1], Value::Num(f) if f == 2.5));
        assert_eq!(&*vals[2].stringify(&h), "perl");
    }
}
