//! The opcode space.
//!
//! Opcodes are 16-bit words partitioned into contiguous category ranges so
//! the dispatch loop compiles to a jump table and each range can be delegated
//! to one handler. Numbering inside a range is gap-free; new opcodes must be
//! appended at the end of their range (`test_ranges_are_contiguous` enforces
//! this).
//!
//! | Range | Category |
//! |-------|----------|
//! | 0–99 | Control flow, frames, eval, warnings plumbing |
//! | 100–199 | Register movement, pad and global access, closures |
//! | 300–349 | Numeric comparisons |
//! | 350–399 | String comparisons |
//! | 400–499 | Arithmetic and bit operations |
//! | 500–599 | Compound assignment (in-place on cells) |
//! | 600–699 | String operations |
//! | 700–899 | Lists, arrays, hashes, slices, iterators |
//! | 900–1199 | IO, regex, pack, process control |
//! | 1200+ | Reserved for promotions |
//!
//! Operands are 16-bit words following the opcode. Register operands name
//! registers; `NONE_REG` marks an absent optional operand. Context-sensitive
//! ops carry a trailing context word (see [`ctx_to_word`]).

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, FromRepr};

use crate::ast::Context;

/// Sentinel for "no register" in optional operand positions.
pub(crate) const NONE_REG: u16 = 0xFFFF;

/// Encodes a context into a trailing operand word.
pub(crate) fn ctx_to_word(ctx: Context) -> u16 {
    match ctx {
        Context::Void => 0,
        Context::Scalar => 1,
        Context::List => 2,
        Context::Runtime => 3,
    }
}

/// Decodes a context operand word.
pub(crate) fn word_to_ctx(word: u16) -> Context {
    match word {
        0 => Context::Void,
        1 => Context::Scalar,
        2 => Context::List,
        _ => Context::Runtime,
    }
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr, EnumIter, Serialize, Deserialize)]
pub enum Opcode {
    // ---- 0..: control flow ----
    Nop = 0,
    /// `RETURN r` — unwind the frame with `regs[r]`.
    Return = 1,
    ReturnUndef = 2,
    /// `GOTO addr` — absolute word offset.
    Goto = 3,
    GotoIfFalse = 4,
    GotoIfTrue = 5,
    /// `CALL_SUB dst, code_r, args_r, ctx`.
    CallSub = 6,
    /// `CALL_METHOD dst, invocant_r, name_r, args_r, ctx`.
    CallMethod = 7,
    /// `CALL_SUPER dst, invocant_r, name_idx, args_r, ctx`.
    CallSuper = 8,
    /// `EVAL_BLOCK dst, sub_idx, ctx` — nested frame with a die boundary.
    EvalBlock = 9,
    /// `EVAL_STRING dst, src_r, snapshot_idx, ctx`.
    EvalString = 10,
    /// `LOOP_ENTER label_idx, last_addr, next_addr, redo_addr`.
    LoopEnter = 11,
    LoopExit = 12,
    /// `LOOP_CTL kind, label_idx` — last/next/redo.
    LoopCtl = 13,
    Wantarray = 14,
    /// `DIE r` — raise with the flattened list in `r`.
    Die = 15,
    Warn = 16,
    /// `CALLER dst, level_r, ctx`.
    Caller = 17,
    /// `TICK line` — statement boundary: line bookkeeping + resource check.
    Tick = 18,
    /// `SET_WARN_MASK w0, w1, w2, w3` — 64-bit lexical warning mask.
    SetWarnMask = 19,
    /// `EXIT r`.
    Exit = 20,
    LocalScopeEnter = 21,
    LocalScopeExit = 22,
    /// `LOCAL_SAVE lv_r` — save the cell's value for scope-exit restore.
    LocalSave = 23,
    /// `REGISTER_END code_r` — queue a code ref to run at context teardown.
    RegisterEnd = 24,
    /// `LOCAL_SAVE_GLOB_SLOT name_idx` — save a glob's scalar slot (foreach
    /// aliasing of a package loop variable).
    LocalSaveGlobSlot = 25,
    /// `EVAL_TRY catch_addr` — push a die handler for an inline eval region.
    EvalTry = 26,
    /// `EVAL_END` — pop the handler and clear `$@`.
    EvalEnd = 27,

    // ---- 100..: register movement, pads, globals, closures ----
    LoadUndef = 100,
    /// `LOAD_INT dst, pool_idx`.
    LoadInt = 101,
    LoadNum = 102,
    LoadStr = 103,
    Move = 104,
    /// `LOAD_LOCAL dst, slot` — pad cell value into a register.
    LoadLocal = 105,
    /// `STORE_LOCAL slot, src` — register into pad cell, in place.
    StoreLocal = 106,
    /// `LOCAL_REF dst, slot` — reference to the pad cell.
    LocalRef = 107,
    /// `MY_NEW slot, kind` — fresh cell (0 scalar, 1 array, 2 hash).
    MyNew = 108,
    /// `MY_PERSIST slot, persist_idx, kind` — bind registry cell.
    MyPersist = 109,
    LoadGlobalScalar = 110,
    StoreGlobalScalar = 111,
    /// `GLOBAL_SCALAR_REF dst, name_idx`.
    GlobalScalarRef = 112,
    GlobalArrayRef = 113,
    GlobalHashRef = 114,
    /// `GLOBAL_CODE dst, name_idx` — code ref from a stash slot.
    GlobalCode = 115,
    /// `GLOB_REF dst, name_idx` — the glob itself as a value.
    GlobRef = 116,
    /// `GLOB_ASSIGN name_idx, src` — `*foo = ...` aliasing by slot kind.
    GlobAssign = 117,
    /// `CAPTURE_SUB dst, sub_idx` — close over the current frame.
    CaptureSub = 118,
    /// `DEREF_SCALAR_LOAD dst, ref_r` — `$$r` rvalue.
    DerefScalarLoad = 119,
    /// `DEREF_CELL dst, ref_r, kind` — checked dereference to a cell ref.
    DerefCell = 120,
    /// `DEREF_VIVIFY dst, holder_lv, kind` — autovivifying deref through a
    /// scalar cell.
    DerefVivify = 121,
    /// `MAKE_REF dst, src` — reference to a fresh cell holding `src`.
    MakeRef = 122,
    /// `STORE_THROUGH_REF ref_r, src` — assign the referenced scalar cell.
    StoreThroughRef = 123,
    /// `LOAD_THROUGH_REF dst, ref_r` — read a referenced scalar cell.
    LoadThroughRef = 124,
    /// `LOAD_ARG_CELL dst, slot` — `@_` element cell by index (alias).
    LoadArgCell = 125,
    /// `LOAD_ARGS dst` — the frame's `@_` array cell as a reference.
    LoadArgs = 126,
    /// `ALIAS_SLOT slot, ref_r` — bind the pad slot to the referenced cell
    /// (declared references, `my \$x = \$y`).
    AliasSlot = 127,
    /// `INSTALL_SUB name_idx, code_r` — install a closure under a stash name
    /// (named subs that capture lexicals install when their statement runs).
    InstallSub = 128,

    // ---- 300..: numeric comparisons ----
    NumEq = 300,
    NumNe = 301,
    NumLt = 302,
    NumLe = 303,
    NumGt = 304,
    NumGe = 305,
    Spaceship = 306,

    // ---- 350..: string comparisons ----
    StrEq = 350,
    StrNe = 351,
    StrLt = 352,
    StrLe = 353,
    StrGt = 354,
    StrGe = 355,
    StrCmp = 356,

    // ---- 400..: arithmetic and bit ops ----
    Add = 400,
    Sub = 401,
    Mul = 402,
    Div = 403,
    Mod = 404,
    Pow = 405,
    Neg = 406,
    Abs = 407,
    Sqrt = 408,
    IntOp = 409,
    Sin = 410,
    Cos = 411,
    Atan2 = 412,
    Exp = 413,
    Log = 414,
    /// `RAND dst, src_r` (`NONE_REG` → 1.0 ceiling).
    Rand = 415,
    Srand = 416,
    /// Logical not (scalar truth).
    NotOp = 417,
    BitAnd = 418,
    BitOr = 419,
    BitXor = 420,
    BitNot = 421,
    Shl = 422,
    Shr = 423,
    HexOp = 424,
    OctOp = 425,
    /// `INCR dst, lv_r, flags` — magic ++/-- (bit 0: decrement, bit 1: post).
    Incr = 426,

    // ---- 500..: compound assignment (mutates the cell in place) ----
    AddAssign = 500,
    SubAssign = 501,
    MulAssign = 502,
    DivAssign = 503,
    ModAssign = 504,
    PowAssign = 505,
    ConcatAssign = 506,
    RepeatAssign = 507,
    ShlAssign = 508,
    ShrAssign = 509,
    BitAndAssign = 510,
    BitOrAssign = 511,
    BitXorAssign = 512,

    // ---- 600..: string ops ----
    Concat = 600,
    /// `REPEAT dst, val_r, count_r, ctx` — string or list repetition.
    Repeat = 601,
    Uc = 602,
    Lc = 603,
    Ucfirst = 604,
    Lcfirst = 605,
    Length = 606,
    Ord = 607,
    Chr = 608,
    /// `INDEX dst, str_r, substr_r, pos_r`.
    IndexOp = 609,
    RindexOp = 610,
    /// `SUBSTR dst, str_r, off_r, len_r, repl_r` — optional tail operands.
    Substr = 611,
    Sprintf = 612,
    Join = 613,
    Quotemeta = 614,
    Chomp = 615,
    Chop = 616,
    /// `TRANS dst, target_lv, tr_idx, ctx` — transliteration.
    Trans = 617,
    /// `STR_BUILD dst, count, r...` — concatenation of `count` registers.
    StrBuild = 618,

    // ---- 700..: lists, arrays, hashes, iterators ----
    ListBegin = 700,
    ListPush = 701,
    ListEnd = 702,
    ArrayNew = 703,
    HashNew = 704,
    /// `ARRAY_FROM_LIST dst, list_r` — `[...]`.
    ArrayFromList = 705,
    HashFromList = 706,
    /// `ARRAY_ELEM dst, arr_r, idx_r` — rvalue read.
    ArrayElem = 707,
    /// `ARRAY_ELEM_LV dst, arr_r, idx_r` — lvalue cell ref, extends.
    ArrayElemLv = 708,
    HashElem = 709,
    HashElemLv = 710,
    /// `ARRAY_LEN dst, arr_r` — `$#a`.
    ArrayLen = 711,
    ArraySetLen = 712,
    /// `ARRAY_COUNT dst, arr_r` — `scalar(@a)`.
    ArrayCount = 713,
    Push = 714,
    Pop = 715,
    Shift = 716,
    Unshift = 717,
    /// `SPLICE dst, arr_r, off_r, len_r, list_r, ctx`.
    Splice = 718,
    /// `ARRAY_LIST dst, arr_r` — flatten to a transient list.
    ArrayList = 719,
    HashList = 720,
    /// `HASH_COUNT dst, hash_r` — `scalar(%h)`.
    HashCount = 721,
    /// `KEYS dst, hash_r, ctx`.
    Keys = 722,
    Values = 723,
    Each = 724,
    ExistsHash = 725,
    ExistsArray = 726,
    /// `DELETE_HASH dst, hash_r, key_r, ctx`.
    DeleteHash = 727,
    DeleteArray = 728,
    SliceArray = 729,
    SliceHash = 730,
    KvSlice = 731,
    /// List assignment protocol: begin with the source list, feed targets,
    /// end with the context-shaped result.
    LassignBegin = 732,
    LassignScalar = 733,
    LassignArray = 734,
    LassignHash = 735,
    LassignSkip = 736,
    /// `LASSIGN_END dst, ctx` — source element count in scalar context.
    LassignEnd = 737,
    /// `ITER_LIST dst, list_r`.
    IterList = 738,
    /// `ITER_RANGE dst, from_r, to_r` — O(1) space range iterator.
    IterRange = 739,
    IterHasNext = 740,
    /// `ITER_NEXT_ALIAS slot, iter_r` — alias the pad slot to the element.
    IterNextAlias = 741,
    IterNext = 742,
    /// `RANGE dst, from_r, to_r` — materialized range list.
    Range = 743,
    /// `SORT dst, cmp_r, list_r` (`NONE_REG` cmp → default string order).
    Sort = 744,
    Map = 745,
    Grep = 746,
    /// `REVERSE dst, list_r, ctx`.
    Reverse = 747,
    /// `ITER_NEXT_GLOBAL name_idx, iter_r` — alias a package variable (or
    /// `$_`) to the iterator's next element cell.
    IterNextGlobal = 748,
    /// `LASSIGN_SLICE_ARRAY arr_r, idx_list_r` — array-slice assign targets.
    LassignSliceArray = 749,
    /// `LASSIGN_SLICE_HASH hash_r, key_list_r` — hash-slice assign targets.
    LassignSliceHash = 750,

    // ---- 900..: IO, regex, pack, process ----
    /// `PRINT dst, fh_r, list_r` (`NONE_REG` fh → STDOUT).
    Print = 900,
    Say = 901,
    Printf = 902,
    /// `OPEN dst, target_lv, args_list_r`.
    Open = 903,
    Close = 904,
    /// `READLINE dst, fh_r, ctx`.
    Readline = 905,
    EofOp = 906,
    Binmode = 907,
    /// `LOAD_REGEX dst, re_idx` — precompiled pattern from the pool.
    LoadRegex = 908,
    /// `BUILD_REGEX dst, pattern_r, mods_idx` — runtime-built pattern.
    BuildRegex = 909,
    /// `MATCH dst, target_r, re_r, negated, ctx`.
    Match = 910,
    /// `SUBST dst, target_lv, re_r, repl_code_r, ctx`.
    Subst = 911,
    /// `SPLIT dst, re_r, target_r, limit_r, ctx`.
    Split = 912,
    Sleep = 913,
    Time = 914,
    /// `TIE dst, target_r, args_list_r`.
    Tie = 915,
    Untie = 916,
    Tied = 917,
    /// `BLESS dst, ref_r, pkg_r`.
    Bless = 918,
    /// `REF_OP dst, src_r` — `ref()`.
    RefOp = 919,
    DefinedOp = 920,
    /// `UNDEF_OP dst, target_r` (`NONE_REG` → plain undef value).
    UndefOp = 921,
    /// `PACK dst, list_r`.
    Pack = 922,
    /// `UNPACK dst, tmpl_r, src_r, ctx`.
    Unpack = 923,
    /// `POS dst, target_r`.
    PosOp = 924,
    /// `CAPTURE_GROUP dst, n_r` — `$1`-family reads from the last match.
    CaptureGroup = 925,
    /// `MATCH_SPECIAL dst, which` — 0 `$&`, 1 `` $` ``, 2 `$'`.
    MatchSpecial = 926,
    /// `NAMED_CAPTURE dst, name_r` — `%+` lookup.
    NamedCapture = 927,
    /// `MATCH_SPANS dst, which` — `@-` (0) / `@+` (1) as a list.
    MatchSpans = 928,
}

impl Opcode {
    /// Category range starts, in ascending order, paired with inclusive ends.
    pub(crate) const RANGES: &'static [(u16, u16, &'static str)] = &[
        (0, 99, "control"),
        (100, 199, "moves"),
        (300, 349, "numeric comparisons"),
        (350, 399, "string comparisons"),
        (400, 499, "arithmetic"),
        (500, 599, "compound assignment"),
        (600, 699, "string ops"),
        (700, 899, "collections"),
        (900, 1199, "io/regex"),
    ];

    #[inline]
    pub(crate) fn code(self) -> u16 {
        self as u16
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    /// Every opcode category must be gap-free so dispatch stays a jump table.
    #[test]
    fn test_ranges_are_contiguous() {
        let mut codes: Vec<u16> = Opcode::iter().map(Opcode::code).collect();
        codes.sort_unstable();
        for &(start, end, name) in Opcode::RANGES {
            let in_range: Vec<u16> = codes.iter().copied().filter(|c| *c >= start && *c <= end).collect();
            for (i, code) in in_range.iter().enumerate() {
                assert_eq!(
                    *code,
                    start + u16::try_from(i).unwrap(),
                    "gap in {name} range at opcode {code}",
                );
            }
        }
    }

    #[test]
    fn every_opcode_is_inside_a_declared_range() {
        for op in Opcode::iter() {
            let code = op.code();
            assert!(
                Opcode::RANGES.iter().any(|&(start, end, _)| code >= start && code <= end),
                "opcode {op:?} ({code}) is outside every range",
            );
        }
    }

    #[test]
    fn from_repr_round_trips() {
        for op in Opcode::iter() {
            assert_eq!(Opcode::from_repr(op.code()), Some(op));
        }
        assert_eq!(Opcode::from_repr(299), None);
        assert_eq!(Opcode::from_repr(1199), None);
    }

    #[test]
    fn context_words_round_trip() {
        for ctx in [Context::Void, Context::Scalar, Context::List, Context::Runtime] {
            assert_eq!(word_to_ctx(ctx_to_word(ctx)), ctx);
        }
    }
}
