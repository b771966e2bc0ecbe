//! The `pack` direction.
//!
//! Output is modeled as a sequence of character codes: numeric writers append
//! byte values, `W` appends raw codes without encoding, and `U` appends a
//! codepoint in character mode or its UTF-8 bytes in byte mode. The final
//! value is a byte string unless a wide character or character-mode `U`
//! forces a character string — which round-trips through the same
//! downgrade-else-UTF-8 rule the rest of the runtime uses.

use super::{Endian, Item, PackError, PackMode, Repeat, TplNode, numeric_width, parse_template};
use crate::{
    heap::Heap,
    resource::ResourceTracker,
    value::{Number, Value},
};

pub(crate) fn pack_values(
    template: &str,
    args: &[Value],
    heap: &Heap<impl ResourceTracker>,
) -> Result<Value, PackError> {
    let nodes = parse_template(template, "pack")?;
    let mut packer = Packer {
        out: Vec::new(),
        char_mode_used: false,
        mode: initial_mode(&nodes),
        bases: vec![0],
    };
    let mut arg_i = 0usize;
    packer.run(&nodes, args, &mut arg_i, heap)?;
    Ok(packer.into_value())
}

/// A template whose first format is `U` starts in character mode.
fn initial_mode(nodes: &[TplNode]) -> PackMode {
    for node in nodes {
        match node {
            TplNode::Mode(m) => return *m,
            TplNode::Item(item) => {
                return if item.code == 'U' { PackMode::Character } else { PackMode::Byte };
            }
            _ => return PackMode::Byte,
        }
    }
    PackMode::Byte
}

struct Packer {
    /// Character codes; bytes are codes ≤ 255.
    out: Vec<u32>,
    char_mode_used: bool,
    mode: PackMode,
    /// Group baselines for `@` and `.`, as output indices.
    bases: Vec<usize>,
}

impl Packer {
    fn into_value(self) -> Value {
        let wide = self.out.iter().any(|&c| c > 0xFF);
        if wide || self.char_mode_used {
            let s: String = self.out.iter().map(|&c| char::from_u32(c).unwrap_or('\u{FFFD}')).collect();
            Value::str(s)
        } else {
            Value::from_bytes(self.out.iter().map(|&c| c as u8).collect())
        }
    }

    fn run(
        &mut self,
        nodes: &[TplNode],
        args: &[Value],
        arg_i: &mut usize,
        heap: &Heap<impl ResourceTracker>,
    ) -> Result<(), PackError> {
        for node in nodes {
            match node {
                TplNode::Mode(mode) => self.mode = *mode,
                TplNode::Checksum { .. } => {
                    return Err(PackError::new("'%' may only be used in unpack"));
                }
                TplNode::Group { template, repeat } => {
                    let inner = parse_template(template, "pack")?;
                    match repeat {
                        Repeat::One => self.group_once(&inner, args, arg_i, heap)?,
                        Repeat::Count(n) => {
                            for _ in 0..*n {
                                self.group_once(&inner, args, arg_i, heap)?;
                            }
                        }
                        Repeat::Star => {
                            // No-progress detection stops `()*` from spinning.
                            while *arg_i < args.len() {
                                let before = *arg_i;
                                self.group_once(&inner, args, arg_i, heap)?;
                                if *arg_i == before {
                                    break;
                                }
                            }
                        }
                    }
                }
                TplNode::Slash { count, elem } => self.slash(count, elem, args, arg_i, heap)?,
                TplNode::Item(item) => self.item(item, args, arg_i, heap)?,
            }
        }
        Ok(())
    }

    fn group_once(
        &mut self,
        nodes: &[TplNode],
        args: &[Value],
        arg_i: &mut usize,
        heap: &Heap<impl ResourceTracker>,
    ) -> Result<(), PackError> {
        self.bases.push(self.out.len());
        let result = self.run(nodes, args, arg_i, heap);
        self.bases.pop();
        result
    }

    fn slash(
        &mut self,
        count: &Item,
        elem: &TplNode,
        args: &[Value],
        arg_i: &mut usize,
        heap: &Heap<impl ResourceTracker>,
    ) -> Result<(), PackError> {
        // An uncounted element packs everything remaining (`N/S` = `N/S*`).
        let elem = match elem {
            TplNode::Item(item) if item.repeat == Repeat::One => TplNode::Item(Item { repeat: Repeat::Star, ..item.clone() }),
            other => other.clone(),
        };
        let before_args = *arg_i;
        let before_len = self.out.len();
        // Pack the element into a scratch packer sharing our mode.
        let mut scratch = Packer { out: Vec::new(), char_mode_used: false, mode: self.mode, bases: vec![0] };
        scratch.run(std::slice::from_ref(&elem), args, arg_i, heap)?;
        let produced = scratch.out.len();
        let consumed = *arg_i - before_args;
        let is_string_elem = matches!(&elem, TplNode::Item(item) if matches!(item.code, 'a' | 'A' | 'Z'));
        let n = if is_string_elem { produced } else { consumed };
        let count_item = Item { repeat: Repeat::One, ..count.clone() };
        self.write_numeric(&count_item, &[Value::Int(n as i64)], &mut 0, heap)?;
        self.out.extend_from_slice(&scratch.out);
        self.char_mode_used |= scratch.char_mode_used;
        let _ = before_len;
        Ok(())
    }

    fn item(
        &mut self,
        item: &Item,
        args: &[Value],
        arg_i: &mut usize,
        heap: &Heap<impl ResourceTracker>,
    ) -> Result<(), PackError> {
        match item.code {
            'a' | 'A' | 'Z' => self.string_format(item, args, arg_i, heap),
            'b' | 'B' => self.bit_format(item, args, arg_i, heap),
            'h' | 'H' => self.hex_format(item, args, arg_i, heap),
            'u' => self.uuencode(args, arg_i, heap),
            'x' => {
                let n = match item.repeat {
                    Repeat::One => 1,
                    Repeat::Count(n) => n,
                    Repeat::Star => 0,
                };
                self.out.extend(std::iter::repeat_n(0u32, n));
                Ok(())
            }
            'X' => {
                let n = match item.repeat {
                    Repeat::One => 1,
                    Repeat::Count(n) => n,
                    Repeat::Star => 0,
                };
                if self.out.len() < n {
                    return Err(PackError::new("'X' outside of string in pack"));
                }
                self.out.truncate(self.out.len() - n);
                Ok(())
            }
            '@' => {
                let base = *self.bases.last().unwrap_or(&0);
                let n = match item.repeat {
                    Repeat::One => 0,
                    Repeat::Count(n) => n,
                    Repeat::Star => 0,
                };
                self.seek_to(base + n);
                Ok(())
            }
            '.' => {
                let v = take_arg(args, arg_i)?;
                let (n, _) = v.numify();
                let base = *self.bases.last().unwrap_or(&0);
                let target = base as i64 + match n {
                    Number::Int(i) => i,
                    Number::Float(f) => f as i64,
                };
                self.seek_to(usize::try_from(target.max(0)).unwrap_or(0));
                Ok(())
            }
            _ => self.write_numeric(item, args, arg_i, heap),
        }
    }

    fn seek_to(&mut self, target: usize) {
        if target <= self.out.len() {
            self.out.truncate(target);
        } else {
            self.out.resize(target, 0);
        }
    }

    fn string_format(
        &mut self,
        item: &Item,
        args: &[Value],
        arg_i: &mut usize,
        heap: &Heap<impl ResourceTracker>,
    ) -> Result<(), PackError> {
        let v = take_arg(args, arg_i)?;
        let data = v.to_byte_vec(heap);
        let (len, pad_to) = match item.repeat {
            Repeat::Star => {
                if item.code == 'Z' {
                    (data.len(), data.len() + 1)
                } else {
                    (data.len(), data.len())
                }
            }
            Repeat::One => (data.len().min(1), 1),
            Repeat::Count(n) => {
                if item.code == 'Z' {
                    (data.len().min(n.saturating_sub(1)), n)
                } else {
                    (data.len().min(n), n)
                }
            }
        };
        let pad = if item.code == 'A' { b' ' } else { 0u8 };
        for &b in &data[..len] {
            self.out.push(u32::from(b));
        }
        for _ in len..pad_to {
            self.out.push(u32::from(pad));
        }
        Ok(())
    }

    fn bit_format(
        &mut self,
        item: &Item,
        args: &[Value],
        arg_i: &mut usize,
        heap: &Heap<impl ResourceTracker>,
    ) -> Result<(), PackError> {
        let v = take_arg(args, arg_i)?;
        let bits_str = v.stringify(heap);
        let bits: Vec<u8> = bits_str.bytes().collect();
        let n = match item.repeat {
            Repeat::Star => bits.len(),
            Repeat::One => 1.min(bits.len()),
            Repeat::Count(n) => n,
        };
        let n_bytes = n.div_ceil(8);
        let start = self.out.len();
        self.out.extend(std::iter::repeat_n(0u32, n_bytes));
        for i in 0..n {
            // Missing input bits pack as zero.
            let bit = bits.get(i).is_some_and(|b| b & 1 == 1);
            if bit {
                let byte = start + i / 8;
                let shift = if item.code == 'b' { i % 8 } else { 7 - i % 8 };
                self.out[byte] |= 1 << shift;
            }
        }
        Ok(())
    }

    fn hex_format(
        &mut self,
        item: &Item,
        args: &[Value],
        arg_i: &mut usize,
        heap: &Heap<impl ResourceTracker>,
    ) -> Result<(), PackError> {
        let v = take_arg(args, arg_i)?;
        let digits_str = v.stringify(heap);
        let digits: Vec<char> = digits_str.chars().collect();
        let n = match item.repeat {
            Repeat::Star => digits.len(),
            Repeat::One => 1.min(digits.len()),
            Repeat::Count(n) => n,
        };
        let n_bytes = n.div_ceil(2);
        let start = self.out.len();
        self.out.extend(std::iter::repeat_n(0u32, n_bytes));
        for i in 0..n {
            let nybble = digits.get(i).and_then(|c| c.to_digit(16)).unwrap_or(0);
            let byte = start + i / 2;
            let shift = match (item.code, i % 2) {
                ('H', 0) | ('h', 1) => 4,
                _ => 0,
            };
            self.out[byte] |= nybble << shift;
        }
        Ok(())
    }

    fn uuencode(
        &mut self,
        args: &[Value],
        arg_i: &mut usize,
        heap: &Heap<impl ResourceTracker>,
    ) -> Result<(), PackError> {
        let v = take_arg(args, arg_i)?;
        let data = v.to_byte_vec(heap);
        let enc = |v: u8| -> u32 {
            if v == 0 { u32::from(b'`') } else { u32::from(b' ' + v) }
        };
        for chunk in data.chunks(45) {
            self.out.push(enc(u8::try_from(chunk.len()).unwrap_or(45)));
            for triple in chunk.chunks(3) {
                let b0 = u32::from(triple[0]);
                let b1 = triple.get(1).map_or(0, |b| u32::from(*b));
                let b2 = triple.get(2).map_or(0, |b| u32::from(*b));
                let word = (b0 << 16) | (b1 << 8) | b2;
                for shift in [18u32, 12, 6, 0] {
                    self.out.push(enc(u8::try_from((word >> shift) & 0x3F).unwrap_or(0)));
                }
            }
            self.out.push(u32::from(b'\n'));
        }
        Ok(())
    }

    fn write_numeric(
        &mut self,
        item: &Item,
        args: &[Value],
        arg_i: &mut usize,
        heap: &Heap<impl ResourceTracker>,
    ) -> Result<(), PackError> {
        let _ = heap;
        let count = match item.repeat {
            Repeat::One => 1,
            Repeat::Count(n) => n,
            Repeat::Star => args.len().saturating_sub(*arg_i),
        };
        for _ in 0..count {
            let v = take_arg(args, arg_i)?;
            let (num, _) = v.numify();
            match item.code {
                'U' => {
                    let code = number_to_u64(num);
                    if code > 0x10_FFFF {
                        return Err(PackError::new(format!("Cannot pack Unicode code point 0x{code:X} in pack")));
                    }
                    let code = u32::try_from(code).unwrap_or(0xFFFD);
                    match self.mode {
                        PackMode::Character => {
                            self.char_mode_used = true;
                            self.out.push(code);
                        }
                        PackMode::Byte => {
                            // In byte mode U contributes the UTF-8 bytes.
                            let mut buf = [0u8; 4];
                            let s = char::from_u32(code).unwrap_or('\u{FFFD}').encode_utf8(&mut buf);
                            self.out.extend(s.bytes().map(u32::from));
                        }
                    }
                }
                'W' => {
                    // Raw code, never UTF-8 encoded.
                    let code = number_to_u64(num);
                    self.out.push(u32::try_from(code & 0x7FFF_FFFF).unwrap_or(0));
                }
                'w' => self.write_ber(num)?,
                'f' => {
                    let bytes = (num.as_f64() as f32).to_bits().to_le_bytes();
                    self.write_endian(&bytes, item.endian.unwrap_or(Endian::Little));
                }
                'd' | 'F' | 'D' => {
                    let bytes = num.as_f64().to_bits().to_le_bytes();
                    self.write_endian(&bytes, item.endian.unwrap_or(Endian::Little));
                }
                code => {
                    let width = numeric_width(code, item.native)
                        .ok_or_else(|| PackError::new(format!("Invalid type '{code}' in pack")))?;
                    let endian = match code {
                        'n' | 'N' => Endian::Big,
                        'v' | 'V' => Endian::Little,
                        _ => item.endian.unwrap_or(Endian::Little),
                    };
                    let raw = number_to_u64(num);
                    let le = raw.to_le_bytes();
                    self.write_endian(&le[..width], endian);
                }
            }
        }
        Ok(())
    }

    /// Writes little-endian source bytes in the requested order.
    fn write_endian(&mut self, le_bytes: &[u8], endian: Endian) {
        match endian {
            Endian::Little => self.out.extend(le_bytes.iter().map(|&b| u32::from(b))),
            Endian::Big => self.out.extend(le_bytes.iter().rev().map(|&b| u32::from(b))),
        }
    }

    /// BER compressed integer: 7-bit groups, high group first, continuation
    /// bit on all but the last.
    fn write_ber(&mut self, num: Number) -> Result<(), PackError> {
        let value = match num {
            Number::Int(i) if i < 0 => {
                return Err(PackError::new("Cannot compress negative numbers in pack"));
            }
            Number::Int(i) => i as u64,
            Number::Float(f) if f < 0.0 => {
                return Err(PackError::new("Cannot compress negative numbers in pack"));
            }
            Number::Float(f) => f as u64,
        };
        let mut groups = Vec::new();
        let mut v = value;
        loop {
            groups.push((v & 0x7F) as u32);
            v >>= 7;
            if v == 0 {
                break;
            }
        }
        groups.reverse();
        let last = groups.len() - 1;
        for (i, g) in groups.into_iter().enumerate() {
            self.out.push(if i == last { g } else { g | 0x80 });
        }
        Ok(())
    }
}

fn take_arg<'a>(args: &'a [Value], arg_i: &mut usize) -> Result<&'a Value, PackError> {
    let v = args.get(*arg_i);
    *arg_i += 1;
    // Perl packs missing arguments as empty/zero with a warning; the warning
    // is the caller's concern.
    Ok(v.unwrap_or(&Value::Undef))
}

fn number_to_u64(num: Number) -> u64 {
    match num {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NoLimitTracker;

    fn heap() -> Heap<NoLimitTracker> {
        Heap::new(NoLimitTracker)
    }

    fn pack_bytes(template: &str, args: &[Value]) -> Vec<u8> {
        let h = heap();
        pack_values(template, args, &h).unwrap().to_byte_vec(&h)
    }

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[test]
    fn big_endian_and_native_shorts() {
        assert_eq!(hex(&pack_bytes("N", &[Value::Int(3)])), "00000003");
        assert_eq!(hex(&pack_bytes("v", &[Value::Int(0x0102)])), "0201");
        assert_eq!(hex(&pack_bytes("n", &[Value::Int(0x0102)])), "0102");
        assert_eq!(hex(&pack_bytes("s>", &[Value::Int(1)])), "0001");
    }

    #[test]
    fn slash_with_default_count() {
        let bytes = pack_bytes("N/S", &[Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(hex(&bytes), "00000003010002000300");
    }

    #[test]
    fn byte_mode_w_writes_raw() {
        let bytes = pack_bytes("C0 W", &[Value::Int(253)]);
        assert_eq!(hex(&bytes), "fd");
    }

    #[test]
    fn u_is_utf8_in_character_mode() {
        let h = heap();
        let v = pack_values("U", &[Value::Int(0x100)], &h).unwrap();
        assert_eq!(hex(&v.to_byte_vec(&h)), "c480");
    }

    #[test]
    fn string_padding() {
        assert_eq!(pack_bytes("a5", &[Value::str("ab")]), b"ab\0\0\0");
        assert_eq!(pack_bytes("A5", &[Value::str("ab")]), b"ab   ");
        assert_eq!(pack_bytes("Z5", &[Value::str("abcdef")]), b"abcd\0");
        assert_eq!(pack_bytes("Z*", &[Value::str("ab")]), b"ab\0");
    }

    #[test]
    fn bit_and_hex_strings() {
        assert_eq!(hex(&pack_bytes("B8", &[Value::str("10000001")])), "81");
        assert_eq!(hex(&pack_bytes("b8", &[Value::str("10000001")])), "81");
        assert_eq!(hex(&pack_bytes("H2", &[Value::str("fd")])), "fd");
        assert_eq!(hex(&pack_bytes("h2", &[Value::str("df")])), "fd");
    }

    #[test]
    fn ber_compression() {
        assert_eq!(hex(&pack_bytes("w", &[Value::Int(0)])), "00");
        assert_eq!(hex(&pack_bytes("w", &[Value::Int(127)])), "7f");
        assert_eq!(hex(&pack_bytes("w", &[Value::Int(128)])), "8100");
        assert_eq!(hex(&pack_bytes("w", &[Value::Int(16384)])), "818000");
        let h = heap();
        let err = pack_values("w", &[Value::Int(-1)], &h).unwrap_err();
        assert!(err.message.contains("Cannot compress negative numbers"));
    }

    #[test]
    fn x_and_at_position_ops() {
        assert_eq!(hex(&pack_bytes("Cx2C", &[Value::Int(1), Value::Int(2)])), "01000002");
        assert_eq!(hex(&pack_bytes("CCX C", &[Value::Int(1), Value::Int(2), Value::Int(3)])), "0103");
        assert_eq!(hex(&pack_bytes("C@3C", &[Value::Int(1), Value::Int(2)])), "01000002");
    }

    #[test]
    fn groups_repeat_and_propagate() {
        let bytes = pack_bytes("(CC)2", &[Value::Int(1), Value::Int(2), Value::Int(3), Value::Int(4)]);
        assert_eq!(hex(&bytes), "01020304");
        let bytes = pack_bytes("(C)*", &[Value::Int(7), Value::Int(8)]);
        assert_eq!(hex(&bytes), "0708");
    }

    #[test]
    fn group_endian_suffix_applies_inside() {
        let bytes = pack_bytes("(s s)>", &[Value::Int(1), Value::Int(2)]);
        assert_eq!(hex(&bytes), "00010002");
    }

    #[test]
    fn checksum_rejected_in_pack() {
        let h = heap();
        let err = pack_values("%16C*", &[Value::Int(1)], &h).unwrap_err();
        assert!(err.message.contains("may only be used in unpack"));
    }

    #[test]
    fn codepoint_ceiling_enforced() {
        let h = heap();
        let err = pack_values("U", &[Value::Int(0x110000)], &h).unwrap_err();
        assert!(err.message.contains("Cannot pack Unicode code point"));
    }
}
