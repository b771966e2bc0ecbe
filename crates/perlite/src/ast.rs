//! The abstract syntax tree.
//!
//! Variables are resolved during parsing: a node refers to a pad slot of the
//! enclosing sub, a capture index, a persistent registry id (BEGIN-touched or
//! `state` lexicals), or a package global by qualified name. Each sub carries
//! its pad layout and capture table, so the code generator never re-derives
//! scoping.

use std::rc::Rc;

use strum::{Display, EnumString};

use crate::value::RcStr;

/// Call-site context. `Runtime` defers to the frame's `wantarray`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    Void,
    Scalar,
    List,
    Runtime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Sigil {
    Scalar,
    Array,
    Hash,
    Code,
    Glob,
}

impl Sigil {
    pub(crate) fn from_char(c: char) -> Option<Self> {
        match c {
            '$' => Some(Self::Scalar),
            '@' => Some(Self::Array),
            '%' => Some(Self::Hash),
            '&' => Some(Self::Code),
            '*' => Some(Self::Glob),
            _ => None,
        }
    }

    pub(crate) fn ch(self) -> char {
        match self {
            Self::Scalar => '$',
            Self::Array => '@',
            Self::Hash => '%',
            Self::Code => '&',
            Self::Glob => '*',
        }
    }
}

/// Where a capture slot of a nested sub comes from in its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub(crate) enum CaptureSource {
    /// The parent's own pad slot.
    ParentLexical(u16),
    /// The parent's capture table (forwarding an outer cell inward).
    ParentCapture(u16),
}

/// One pad entry of a sub.
#[derive(Debug, Clone)]
pub(crate) struct PadEntry {
    pub name: RcStr,
    pub sigil: Sigil,
    /// Persistent registry id for BEGIN-touched and `state` lexicals; such
    /// slots bind to the context registry instead of a fresh cell.
    pub persist_id: Option<u32>,
}

/// A subroutine body (named, anonymous, or the program top level).
#[derive(Debug, Clone)]
pub(crate) struct SubDef {
    /// Short name; `None` for anonymous subs and the top level.
    pub name: Option<RcStr>,
    pub package: RcStr,
    pub body: Block,
    pub pad: Vec<PadEntry>,
    pub captures: Vec<CaptureSource>,
    pub prototype: Option<RcStr>,
    /// Synthetic closure (refactorer chunks, substitution replacements):
    /// captures the whole parent pad so the moved code's slot numbering
    /// keeps meaning.
    pub inherits_pad: bool,
    /// For synthetic closures: the capture-block size of the frame the moved
    /// code was written for, i.e. the offset its `Lexical` slots assume.
    pub parent_cap_len: u16,
    pub line: u32,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Block {
    pub stmts: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub(crate) struct Stmt {
    pub kind: StmtKind,
    pub line: u32,
}

/// The loop variable of a `foreach`.
#[derive(Debug, Clone)]
pub(crate) enum ForeachVar {
    /// `foreach my $x (...)` — fresh pad slot, aliased per iteration.
    Lexical(u16),
    /// `foreach $x (...)` — package variable, localized.
    Global(RcStr),
    /// Implicit `$_`.
    Default,
}

#[derive(Debug, Clone)]
pub(crate) enum StmtKind {
    Expr(Expr),
    If {
        cond: Expr,
        then: Block,
        elsifs: Vec<(Expr, Block)>,
        else_: Option<Block>,
    },
    While {
        label: Option<RcStr>,
        cond: Expr,
        body: Block,
        /// `until` negates the condition.
        until: bool,
        /// `continue { ... }` block.
        cont: Option<Block>,
    },
    DoWhile {
        body: Block,
        cond: Expr,
        until: bool,
    },
    ForC {
        label: Option<RcStr>,
        init: Option<Expr>,
        cond: Option<Expr>,
        step: Option<Expr>,
        body: Block,
    },
    Foreach {
        label: Option<RcStr>,
        var: ForeachVar,
        list: Expr,
        body: Block,
    },
    /// A bare block runs once but is a loop for `last`/`next`/`redo`.
    BareBlock {
        label: Option<RcStr>,
        body: Block,
    },
    /// Named sub definition (installed at compile time).
    SubDecl(Rc<SubDef>),
    Return(Option<Expr>),
    LoopCtl {
        kind: crate::error::LoopKind,
        label: Option<RcStr>,
    },
    /// `try { } catch ($e) { } finally { }` under the `try` feature.
    TryCatch {
        body: Block,
        catch_var: Option<u16>,
        catch: Block,
        finally: Option<Block>,
    },
    /// Empty statement (stray semicolon).
    Empty,
}

#[derive(Debug, Clone)]
pub(crate) struct Expr {
    pub kind: ExprKind,
    pub line: u32,
}

/// A part of an interpolated string, regex, or replacement.
#[derive(Debug, Clone)]
pub(crate) enum InterpPart {
    Lit(String),
    /// Scalar interpolation: expression stringified in place.
    Scalar(Expr),
    /// List interpolation: elements joined with `$"`.
    Join(Expr),
}

/// A regex literal: interpolating pattern parts plus modifier letters.
#[derive(Debug, Clone)]
pub(crate) struct RegexLit {
    pub parts: Vec<InterpPart>,
    pub mods: String,
}

impl RegexLit {
    /// The pattern text when no interpolation is present.
    pub(crate) fn static_pattern(&self) -> Option<String> {
        match self.parts.as_slice() {
            [] => Some(String::new()),
            [InterpPart::Lit(s)] => Some(s.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum ExprKind {
    IntLit(i64),
    NumLit(f64),
    StrLit(RcStr),
    /// Interpolating string.
    Interp(Vec<InterpPart>),
    /// Pad slot of the current sub.
    Lexical { slot: u16, sigil: Sigil },
    /// Capture-table slot of the current sub.
    Capture { index: u16, sigil: Sigil },
    /// Persistent registry cell (BEGIN-touched or `state`).
    Persistent { id: u32, sigil: Sigil },
    /// Package variable; `name` is fully qualified without sigil.
    Global { name: RcStr, sigil: Sigil },
    /// Dereference: `@$x`, `%{$h}`, `$$s`, `&$c`, `*{...}`, `$r->@*` etc.
    Deref { sigil: Sigil, expr: Box<Expr> },
    /// `$#array` / `$#$ref`.
    LastIndex(Box<Expr>),
    ArrayElem { array: Box<Expr>, index: Box<Expr> },
    HashElem { hash: Box<Expr>, key: Box<Expr> },
    ArraySlice { array: Box<Expr>, indices: Box<Expr> },
    HashSlice { hash: Box<Expr>, keys: Box<Expr> },
    /// `%h{...}` key/value slice.
    KvSlice { hash: Box<Expr>, keys: Box<Expr> },
    /// Parenthesized / comma list.
    List(Vec<Expr>),
    /// `[ ... ]`.
    AnonArray(Vec<Expr>),
    /// `{ ... }`.
    AnonHash(Vec<Expr>),
    /// `sub { ... }`.
    AnonSub(Rc<SubDef>),
    /// `\EXPR` (including `\&f`, `\@a`; `\(LIST)` distributes).
    RefTo(Box<Expr>),
    Assign { target: Box<Expr>, value: Box<Expr> },
    OpAssign { op: BinOp, target: Box<Expr>, value: Box<Expr> },
    /// `&&=`, `||=`, `//=` — short-circuit, so not an [`ExprKind::OpAssign`].
    LogAssign { op: LogOp, target: Box<Expr>, value: Box<Expr> },
    Unary { op: UnOp, operand: Box<Expr> },
    Binary { op: BinOp, left: Box<Expr>, right: Box<Expr> },
    /// Short-circuit logical ops (condition forced to scalar context).
    Logical { op: LogOp, left: Box<Expr>, right: Box<Expr> },
    Ternary { cond: Box<Expr>, then: Box<Expr>, else_: Box<Expr> },
    Range { from: Box<Expr>, to: Box<Expr> },
    /// Pre/post increment/decrement.
    Incr { target: Box<Expr>, by: i8, post: bool },
    /// `my`/`our`/`state` declaration in expression position. Slots pair a
    /// pad index with its sigil; `declared_ref` marks `my \$x` forms and
    /// `paren` distinguishes `my ($x)` (list assignment) from `my $x`.
    Decl { slots: Vec<DeclSlot>, declared_ref: bool, paren: bool },
    /// `local EXPR` (dynamic scoping, restored on scope exit).
    Local { target: Box<Expr> },
    /// Named or code-ref sub call.
    SubCall { callee: Callee, args: Vec<Expr> },
    /// Method call: `$obj->meth(...)`, `Pkg->meth(...)`, `$obj->$m(...)`.
    MethodCall { invocant: Box<Expr>, method: MethodName, args: Vec<Expr> },
    /// Builtin function call.
    FuncCall { func: Builtin, args: Vec<Expr> },
    /// `sort { ... } LIST` / `sort LIST`.
    Sort { cmp: Option<Rc<SubDef>>, args: Vec<Expr> },
    Map { body: Rc<SubDef>, args: Vec<Expr> },
    Grep { body: Rc<SubDef>, args: Vec<Expr> },
    /// `=~` / `!~` match. `target` of `None` means `$_`.
    Match { target: Option<Box<Expr>>, regex: RegexLit, negated: bool },
    /// `$x =~ $re` — the pattern is a runtime value (qr object or string).
    MatchBind { target: Box<Expr>, pattern: Box<Expr>, negated: bool },
    /// `qr//` object.
    QrConstruct { regex: RegexLit },
    Subst {
        target: Option<Box<Expr>>,
        regex: RegexLit,
        /// Replacement as interpolation parts, or code under `/e`.
        replacement: Vec<InterpPart>,
        negated: bool,
    },
    Trans { target: Option<Box<Expr>>, search: RcStr, replacement: RcStr, mods: RcStr },
    /// `<FH>`, `<$fh>`, `<>`.
    ReadLine { handle: Box<Expr> },
    /// Bareword filehandle or package name used as a term.
    Bareword(RcStr),
    DoBlock(Block),
    EvalBlock(Block),
    /// `eval EXPR` with the scope snapshot of the call site.
    EvalString { code: Box<Expr>, snapshot: Rc<crate::symbols::ScopeSnapshot> },
    Wantarray,
    /// `$1`, `$2`, ...
    CaptureGroup(usize),
    /// `$&` / `` $` `` / `$'`.
    MatchSpecial(char),
    /// `$+{name}`-style read; the key expression evaluates to the name.
    NamedCapture { key: Box<Expr> },
    /// `@-` / `@+` as lists of match starts/ends.
    MatchSpans { ends: bool },
    /// The current frame's `@_`.
    ArgsArray,
    /// A no-op placeholder for parsed-but-inert constructs.
    Nop,
}

#[derive(Debug, Clone)]
pub(crate) struct DeclSlot {
    pub slot: u16,
    pub sigil: Sigil,
    /// Persistent registry id for `state` declarations.
    pub persist: Option<u32>,
}

#[derive(Debug, Clone)]
pub(crate) enum Callee {
    /// Fully qualified sub name.
    Named(RcStr),
    /// `&$code(...)` / `$code->(...)`.
    Expr(Box<Expr>),
}

#[derive(Debug, Clone)]
pub(crate) enum MethodName {
    Static(RcStr),
    /// `SUPER::name`.
    Super(RcStr),
    /// `$obj->$name(...)`.
    Dynamic(Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub(crate) enum UnOp {
    Not,
    Neg,
    Plus,
    BitNot,
    Defined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub(crate) enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    NumEq,
    NumNe,
    NumLt,
    NumLe,
    NumGt,
    NumGe,
    Spaceship,
    StrEq,
    StrNe,
    StrLt,
    StrLe,
    StrGt,
    StrGe,
    StrCmp,
    Concat,
    Repeat,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    /// Logical `xor` (low precedence, not short-circuit).
    LogXor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub(crate) enum LogOp {
    And,
    Or,
    /// `//` defined-or.
    Dor,
}

/// Builtin functions recognized at parse time. The string form is the Perl
/// name (`EnumString` gives us the reverse lookup).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum Builtin {
    Print,
    Say,
    Printf,
    Sprintf,
    Push,
    Pop,
    Shift,
    Unshift,
    Splice,
    Keys,
    Values,
    Each,
    Exists,
    Delete,
    Defined,
    Undef,
    Scalar,
    Ref,
    Bless,
    Die,
    Warn,
    Length,
    Substr,
    Index,
    Rindex,
    Uc,
    Lc,
    Ucfirst,
    Lcfirst,
    Quotemeta,
    Chomp,
    Chop,
    Chr,
    Ord,
    Hex,
    Oct,
    Abs,
    Int,
    Sqrt,
    Sin,
    Cos,
    Atan2,
    Exp,
    Log,
    Rand,
    Srand,
    Join,
    Split,
    Reverse,
    Wantarray,
    Caller,
    Pack,
    Unpack,
    Open,
    Close,
    Binmode,
    Eof,
    Readline,
    Pos,
    Exit,
    Sleep,
    Time,
    Tie,
    Untie,
    Tied,
}

/// A parsed `format NAME = ... .` body, stored on the glob's format slot.
/// Execution via `write` is policy-gated; the definition itself is kept so
/// introspection and redefinition behave.
#[derive(Debug, Clone)]
pub struct FormatDef {
    pub name: String,
    pub lines: Vec<String>,
}
