//! The compiled code object.
//!
//! A [`Code`] is one compiled body: a flat 16-bit word stream plus the pools
//! its operands index — strings, integers, doubles, nested subs, compiled
//! regexes, transliteration specs, and eval-site scope snapshots — the
//! per-body register count, the pad size, the capture descriptor table, and a
//! line-number table mapping word offsets back to source positions (kept
//! accurate through AST refactoring so `caller` and diagnostics stay honest).

use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::{ast::CaptureSource, regex::CompiledRegex, symbols::ScopeSnapshot, tr::TransSpec, value::RcStr};

/// One line-table entry: instructions from `offset` up to the next entry's
/// offset belong to `line` of `file` (a string-pool index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineEntry {
    pub offset: u32,
    pub line: u32,
    pub file: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Code {
    /// Opcode and operand words.
    pub words: Vec<u16>,
    /// String pool (also holds global names, file names, sort keys).
    #[serde(with = "rcstr_pool")]
    pub strings: Vec<RcStr>,
    /// Integer pool.
    pub ints: Vec<i64>,
    /// Double pool.
    pub nums: Vec<f64>,
    /// Register file size for a frame running this body.
    pub num_regs: u16,
    /// Pad size (lexical slots, captures first).
    pub pad_size: u16,
    /// Offset of the lexical block in the pad: `Lexical(slot)` descriptors of
    /// nested subs resolve to `pad[pad_offset + slot]`. Equal to the capture
    /// count for ordinary subs; refactorer closures keep their original
    /// frame's offset so moved slot numbering stays valid.
    pub pad_offset: u16,
    /// Capture descriptors, resolved against the defining frame.
    pub captures: Vec<CaptureSource>,
    /// Line-number table, ascending by offset.
    pub lines: Vec<LineEntry>,
    /// Nested sub bodies (anonymous subs, eval blocks, sort/map/grep bodies).
    #[serde(with = "rc_pool")]
    pub subs: Vec<Rc<Code>>,
    /// Precompiled regex pool; persisted as pattern/flag sources.
    #[serde(with = "regex_pool")]
    pub regexes: Vec<Rc<CompiledRegex>>,
    /// Transliteration specs.
    #[serde(with = "rc_pool")]
    pub trans: Vec<Rc<TransSpec>>,
    /// Scope snapshots for `eval STRING` sites.
    #[serde(with = "rc_pool")]
    pub snapshots: Vec<Rc<ScopeSnapshot>>,
    /// Display name for stack traces, e.g. `main::process`.
    #[serde(with = "rcstr_one")]
    pub name: RcStr,
    /// Package the body was compiled in.
    #[serde(with = "rcstr_one")]
    pub package: RcStr,
}

impl Code {
    /// Source position for the instruction at `offset`, from the line table.
    pub(crate) fn position_at(&self, offset: usize) -> (RcStr, u32) {
        let mut line = 0;
        let mut file = 0u16;
        for entry in &self.lines {
            if entry.offset as usize > offset {
                break;
            }
            line = entry.line;
            file = entry.file;
        }
        let file = self
            .strings
            .get(file as usize)
            .cloned()
            .unwrap_or_else(|| Rc::from("-"));
        (file, line)
    }

    /// Emitted size in bytes (words are 16-bit).
    pub(crate) fn byte_size(&self) -> usize {
        self.words.len() * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{builder::CodeBuilder, op::Opcode};

    /// The persisted layout round-trips: opcode words, pools, register and
    /// pad headers, and the line table all survive serialization.
    #[test]
    fn serialized_code_round_trips() {
        let mut b = CodeBuilder::new("t.pl");
        b.set_position("t.pl", 3);
        let s = b.intern_str("hello");
        let n = b.intern_int(42);
        b.note_reg(1);
        b.emit(Opcode::LoadStr, &[0, s]);
        b.emit(Opcode::LoadInt, &[1, n]);
        b.emit(Opcode::Return, &[1]);
        let code = b.build(2, Vec::new(), Rc::from("main::demo"), Rc::from("main")).unwrap();

        let json = serde_json::to_string(&code).unwrap();
        let back: Code = serde_json::from_str(&json).unwrap();
        assert_eq!(back.words, code.words);
        assert_eq!(back.ints, code.ints);
        assert_eq!(back.num_regs, code.num_regs);
        assert_eq!(back.pad_size, code.pad_size);
        assert_eq!(back.pad_offset, code.pad_offset);
        assert_eq!(back.lines, code.lines);
        assert_eq!(&*back.strings[s as usize], "hello");
        assert_eq!(&*back.name, "main::demo");
    }

    #[test]
    fn regex_pool_recompiles_on_load() {
        let mut b = CodeBuilder::new("t.pl");
        b.set_position("t.pl", 1);
        let re = crate::regex::CompiledRegex::compile("a(b)c", "i").unwrap();
        let idx = b.add_regex(Rc::new(re));
        b.emit(Opcode::LoadRegex, &[0, idx]);
        b.emit(Opcode::ReturnUndef, &[]);
        let code = b.build(0, Vec::new(), Rc::from("main"), Rc::from("main")).unwrap();

        let json = serde_json::to_string(&code).unwrap();
        let back: Code = serde_json::from_str(&json).unwrap();
        assert_eq!(back.regexes.len(), 1);
        assert_eq!(back.regexes[0].pattern(), "a(b)c");
        assert!(back.regexes[0].match_at("xABCx", 0).unwrap().is_some());
    }

    #[test]
    fn position_lookup_walks_the_line_table() {
        let mut b = CodeBuilder::new("t.pl");
        b.set_position("t.pl", 1);
        b.emit(Opcode::Nop, &[]);
        b.set_position("other.pl", 9);
        b.emit(Opcode::Nop, &[]);
        let code = b.build(0, Vec::new(), Rc::from("main"), Rc::from("main")).unwrap();
        assert_eq!(code.position_at(0).1, 1);
        let (file, line) = code.position_at(1);
        assert_eq!(&*file, "other.pl");
        assert_eq!(line, 9);
    }
}

mod rcstr_pool {
    use super::{Deserialize, Rc, RcStr, Serialize};

    pub fn serialize<S: serde::Serializer>(pool: &[RcStr], ser: S) -> Result<S::Ok, S::Error> {
        let strings: Vec<&str> = pool.iter().map(|s| &**s).collect();
        strings.serialize(ser)
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(de: D) -> Result<Vec<RcStr>, D::Error> {
        let strings = Vec::<String>::deserialize(de)?;
        Ok(strings.into_iter().map(|s| Rc::from(s.as_str())).collect())
    }
}

mod rcstr_one {
    use super::{Deserialize, Rc, RcStr, Serialize};

    pub fn serialize<S: serde::Serializer>(s: &RcStr, ser: S) -> Result<S::Ok, S::Error> {
        (**s).serialize(ser)
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(de: D) -> Result<RcStr, D::Error> {
        let s = String::deserialize(de)?;
        Ok(Rc::from(s.as_str()))
    }
}

mod rc_pool {
    use super::{Deserialize, Rc, Serialize};

    pub fn serialize<S: serde::Serializer, T: Serialize>(pool: &[Rc<T>], ser: S) -> Result<S::Ok, S::Error> {
        let items: Vec<&T> = pool.iter().map(|rc| &**rc).collect();
        items.serialize(ser)
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>, T: Deserialize<'de>>(de: D) -> Result<Vec<Rc<T>>, D::Error> {
        let items = Vec::<T>::deserialize(de)?;
        Ok(items.into_iter().map(Rc::new).collect())
    }
}

mod regex_pool {
    use serde::de::Error as _;

    use super::{CompiledRegex, Deserialize, Rc, Serialize};

    pub fn serialize<S: serde::Serializer>(pool: &[Rc<CompiledRegex>], ser: S) -> Result<S::Ok, S::Error> {
        let sources: Vec<(&str, String)> = pool.iter().map(|re| (re.pattern(), re.flags_string())).collect();
        sources.serialize(ser)
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(de: D) -> Result<Vec<Rc<CompiledRegex>>, D::Error> {
        let sources = Vec::<(String, String)>::deserialize(de)?;
        sources
            .into_iter()
            .map(|(pattern, flags)| {
                CompiledRegex::compile(&pattern, &flags)
                    .map(Rc::new)
                    .map_err(|e| D::Error::custom(format!("regex pool entry failed to recompile: {e}")))
            })
            .collect()
    }
}
