//! Word emitter for the code generator.
//!
//! Handles operand encoding, constant-pool interning, forward-jump patching,
//! and the per-instruction line table. Also the enforcement point for the
//! per-body emission ceiling: a body that would exceed [`MAX_CODE_WORDS`]
//! fails to build, and the large-block refactorer exists to keep real
//! programs under it.

use std::rc::Rc;

use ahash::AHashMap;

use super::{
    code::{Code, LineEntry},
    op::Opcode,
};
use crate::{ast::CaptureSource, regex::CompiledRegex, symbols::ScopeSnapshot, tr::TransSpec, value::RcStr};

/// 64 KiB of 16-bit words per compiled body.
pub(crate) const MAX_CODE_WORDS: usize = 32 * 1024;

/// Emission exceeded [`MAX_CODE_WORDS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CodeTooLarge {
    pub words: usize,
}

/// A forward jump awaiting its target address.
#[derive(Debug, Clone, Copy)]
pub(crate) struct JumpSlot(usize);

#[derive(Debug, Default)]
pub(crate) struct CodeBuilder {
    words: Vec<u16>,
    strings: Vec<RcStr>,
    string_map: AHashMap<String, u16>,
    ints: Vec<i64>,
    int_map: AHashMap<i64, u16>,
    nums: Vec<f64>,
    num_map: AHashMap<u64, u16>,
    lines: Vec<LineEntry>,
    cur_line: u32,
    cur_file: u16,
    line_dirty: bool,
    subs: Vec<Rc<Code>>,
    regexes: Vec<Rc<CompiledRegex>>,
    trans: Vec<Rc<TransSpec>>,
    snapshots: Vec<Rc<ScopeSnapshot>>,
    max_reg: u16,
}

impl CodeBuilder {
    pub(crate) fn new(file: &str) -> Self {
        let mut builder = Self::default();
        builder.cur_file = builder.intern_str(file);
        builder.line_dirty = true;
        builder
    }

    /// Sets the source position recorded for subsequently emitted words.
    pub(crate) fn set_position(&mut self, file: &str, line: u32) {
        let file_idx = self.intern_str(file);
        if file_idx != self.cur_file || line != self.cur_line {
            self.cur_file = file_idx;
            self.cur_line = line;
            self.line_dirty = true;
        }
    }

    pub(crate) fn line(&self) -> u32 {
        self.cur_line
    }

    /// Current word offset; jump targets use this.
    pub(crate) fn here(&self) -> u16 {
        u16::try_from(self.words.len()).unwrap_or(u16::MAX)
    }

    pub(crate) fn emit(&mut self, op: Opcode, operands: &[u16]) {
        if self.line_dirty {
            self.lines.push(LineEntry {
                offset: u32::try_from(self.words.len()).unwrap_or(u32::MAX),
                line: self.cur_line,
                file: self.cur_file,
            });
            self.line_dirty = false;
        }
        self.words.push(op.code());
        self.words.extend_from_slice(operands);
    }

    /// Emits `op` with `operands` followed by a placeholder address word.
    pub(crate) fn emit_jump(&mut self, op: Opcode, operands: &[u16]) -> JumpSlot {
        self.emit(op, operands);
        self.words.push(0);
        JumpSlot(self.words.len() - 1)
    }

    /// Appends a bare placeholder word (multi-address ops like LOOP_ENTER).
    pub(crate) fn emit_placeholder(&mut self) -> JumpSlot {
        self.words.push(0);
        JumpSlot(self.words.len() - 1)
    }

    /// Points a pending jump at the current offset.
    pub(crate) fn patch_jump(&mut self, slot: JumpSlot) {
        self.words[slot.0] = self.here();
    }

    pub(crate) fn patch_jump_to(&mut self, slot: JumpSlot, addr: u16) {
        self.words[slot.0] = addr;
    }

    // ---- constant pools ----

    pub(crate) fn intern_str(&mut self, s: &str) -> u16 {
        if let Some(&idx) = self.string_map.get(s) {
            return idx;
        }
        let idx = u16::try_from(self.strings.len()).unwrap_or(u16::MAX);
        self.strings.push(Rc::from(s));
        self.string_map.insert(s.to_string(), idx);
        idx
    }

    pub(crate) fn intern_int(&mut self, n: i64) -> u16 {
        if let Some(&idx) = self.int_map.get(&n) {
            return idx;
        }
        let idx = u16::try_from(self.ints.len()).unwrap_or(u16::MAX);
        self.ints.push(n);
        self.int_map.insert(n, idx);
        idx
    }

    pub(crate) fn intern_num(&mut self, n: f64) -> u16 {
        let bits = n.to_bits();
        if let Some(&idx) = self.num_map.get(&bits) {
            return idx;
        }
        let idx = u16::try_from(self.nums.len()).unwrap_or(u16::MAX);
        self.nums.push(n);
        self.num_map.insert(bits, idx);
        idx
    }

    pub(crate) fn add_sub(&mut self, code: Rc<Code>) -> u16 {
        self.subs.push(code);
        u16::try_from(self.subs.len() - 1).unwrap_or(u16::MAX)
    }

    pub(crate) fn add_regex(&mut self, re: Rc<CompiledRegex>) -> u16 {
        self.regexes.push(re);
        u16::try_from(self.regexes.len() - 1).unwrap_or(u16::MAX)
    }

    pub(crate) fn add_trans(&mut self, spec: Rc<TransSpec>) -> u16 {
        self.trans.push(spec);
        u16::try_from(self.trans.len() - 1).unwrap_or(u16::MAX)
    }

    pub(crate) fn add_snapshot(&mut self, snapshot: Rc<ScopeSnapshot>) -> u16 {
        self.snapshots.push(snapshot);
        u16::try_from(self.snapshots.len() - 1).unwrap_or(u16::MAX)
    }

    /// Registers a register index so the frame allocates enough.
    pub(crate) fn note_reg(&mut self, r: u16) {
        if r != super::op::NONE_REG && r >= self.max_reg {
            self.max_reg = r + 1;
        }
    }

    pub(crate) fn build(
        self,
        pad_size: u16,
        captures: Vec<CaptureSource>,
        name: RcStr,
        package: RcStr,
    ) -> Result<Code, CodeTooLarge> {
        let offset = u16::try_from(captures.len()).unwrap_or(u16::MAX);
        self.build_with_pad_offset(pad_size, captures, name, package, offset)
    }

    pub(crate) fn build_with_pad_offset(
        self,
        pad_size: u16,
        captures: Vec<CaptureSource>,
        name: RcStr,
        package: RcStr,
        pad_offset: u16,
    ) -> Result<Code, CodeTooLarge> {
        if self.words.len() > MAX_CODE_WORDS {
            return Err(CodeTooLarge { words: self.words.len() });
        }
        Ok(Code {
            words: self.words,
            strings: self.strings,
            ints: self.ints,
            nums: self.nums,
            num_regs: self.max_reg,
            pad_size,
            pad_offset,
            captures,
            lines: self.lines,
            subs: self.subs,
            regexes: self.regexes,
            trans: self.trans,
            snapshots: self.snapshots,
            name,
            package,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jump_patching_lands_on_target() {
        let mut b = CodeBuilder::new("t.pl");
        b.set_position("t.pl", 1);
        let jump = b.emit_jump(Opcode::Goto, &[]);
        b.emit(Opcode::Nop, &[]);
        b.patch_jump(jump);
        b.emit(Opcode::ReturnUndef, &[]);
        let code = b.build(0, Vec::new(), Rc::from("main"), Rc::from("main")).unwrap();
        // GOTO at 0, address word at 1, NOP at 2, target 3.
        assert_eq!(code.words[0], Opcode::Goto.code());
        assert_eq!(code.words[1], 3);
        assert_eq!(code.words[3], Opcode::ReturnUndef.code());
    }

    #[test]
    fn pools_deduplicate() {
        let mut b = CodeBuilder::new("t.pl");
        let a = b.intern_str("foo");
        let c = b.intern_str("foo");
        assert_eq!(a, c);
        assert_eq!(b.intern_int(42), b.intern_int(42));
        assert_eq!(b.intern_num(2.5), b.intern_num(2.5));
        assert_ne!(b.intern_num(0.0), b.intern_num(-0.0));
    }

    #[test]
    fn oversized_bodies_fail_to_build() {
        let mut b = CodeBuilder::new("t.pl");
        b.set_position("t.pl", 1);
        for _ in 0..MAX_CODE_WORDS / 2 + 1 {
            b.emit(Opcode::Nop, &[0]);
        }
        let err = b.build(0, Vec::new(), Rc::from("main"), Rc::from("main")).unwrap_err();
        assert!(err.words > MAX_CODE_WORDS);
    }

    #[test]
    fn line_table_tracks_positions() {
        let mut b = CodeBuilder::new("t.pl");
        b.set_position("t.pl", 5);
        b.emit(Opcode::Nop, &[]);
        b.set_position("t.pl", 6);
        b.emit(Opcode::Nop, &[]);
        let code = b.build(0, Vec::new(), Rc::from("main"), Rc::from("main")).unwrap();
        assert_eq!(code.position_at(0).1, 5);
        assert_eq!(code.position_at(1).1, 6);
    }
}
