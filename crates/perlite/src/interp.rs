//! The compilation context.
//!
//! One [`Interp`] is one program's world: the cell arena, the package
//! registry, special variables, IO handles, the persistent-lexical registry,
//! warning routing, and the diagnostic sink. Everything is created by
//! [`Interp::new`] and torn down when the context drops — END blocks run at
//! teardown in reverse registration order, matching Perl's phase rules.
//!
//! The compile pipeline is [`Interp::compile`]: lex+parse (BEGIN blocks
//! execute mid-parse against this same context), the AST passes, then code
//! generation. [`Interp::run`] executes a compiled program; `eval STRING`
//! re-enters the same pipeline at runtime with the caller's scope snapshot.

use std::rc::Rc;

use ahash::AHashMap;

use crate::{
    ast::{Context, SubDef},
    bytecode::{
        Code,
        compiler::{CompiledUnit, compile_unit},
        vm,
    },
    error::{Diagnostic, Exception, ParseResult, RunError, RunResult, Severity},
    heap::{Cell, CodeCell, Heap, HeapId},
    io::{IoTable, PrintWriter, StdPrint},
    parser::{self, Features},
    refactor::RefactorOptions,
    regex::{CompiledRegex, MatchState},
    resource::{LimitedTracker, NoLimitTracker, ResourceLimits, ResourceTracker},
    stash::Stashes,
    symbols::ScopeSnapshot,
    tracer::NoopTracer,
    value::{RcStr, Value},
};

/// Options for a compilation context.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Pre-populated `@ARGV`.
    pub argv: Vec<String>,
    /// `%ENV` seed; `None` inherits the process environment.
    pub env: Option<Vec<(String, String)>>,
    /// Enable the large-block refactorer (also via `JPERL_LARGECODE=refactor`).
    pub large_code_refactor: bool,
    /// Unimplemented constructs warn instead of failing
    /// (also via `JPERL_UNIMPLEMENTED=warn`).
    pub unimplemented_warn: bool,
    /// `eval STRING` backend selection (`JPERL_EVAL_USE_INTERPRETER`); both
    /// values select the register interpreter here.
    pub eval_use_interpreter: bool,
    /// Features enabled for the whole program (the lexical pragmas still
    /// apply on top).
    pub strict: bool,
    pub warnings: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            argv: Vec::new(),
            env: None,
            large_code_refactor: false,
            unimplemented_warn: false,
            eval_use_interpreter: false,
            strict: false,
            warnings: false,
        }
    }
}

impl CompileOptions {
    /// Reads the recognized environment variables into an options value.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            large_code_refactor: std::env::var("JPERL_LARGECODE").is_ok_and(|v| v == "refactor"),
            unimplemented_warn: std::env::var("JPERL_UNIMPLEMENTED").is_ok_and(|v| v == "warn"),
            eval_use_interpreter: std::env::var("JPERL_EVAL_USE_INTERPRETER").is_ok_and(|v| v == "1"),
            ..Self::default()
        }
    }
}

/// A compiled program: callable until the owning context drops.
#[derive(Debug, Clone)]
pub struct CodeRef {
    pub(crate) code: Rc<Code>,
}

/// Why a program failed.
#[derive(Debug)]
pub enum PerliteError {
    /// Compile-time diagnostics (the first is the fatal one).
    Compile(Vec<Diagnostic>),
    /// An uncaught runtime exception.
    Runtime(Exception),
}

impl std::fmt::Display for PerliteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Compile(diags) => {
                for d in diags {
                    writeln!(f, "{d}")?;
                }
                Ok(())
            }
            Self::Runtime(e) => write!(f, "{e}"),
        }
    }
}

/// One embedded Perl world.
#[derive(Debug)]
pub struct Interp<T: ResourceTracker = NoLimitTracker> {
    pub(crate) heap: Heap<T>,
    pub(crate) stashes: Stashes,
    pub(crate) io: IoTable,
    pub(crate) writer: Box<dyn PrintWriter>,
    pub(crate) options: CompileOptions,
    /// Persistent lexical registry (BEGIN-touched and `state` cells).
    pub(crate) persistents: AHashMap<u32, HeapId>,
    persist_watermark: u32,
    /// Dynamic `local` save stack.
    pub(crate) locals: Vec<LocalEntry>,
    /// Capture state of the most recent successful match.
    pub(crate) last_match: Option<MatchState>,
    /// `${^LAST_SUCCESSFUL_PATTERN}` linkage.
    pub(crate) last_pattern: Option<Rc<CompiledRegex>>,
    pub(crate) regex_cache: AHashMap<(String, String), Rc<CompiledRegex>>,
    /// Phase blocks (compiled, captureless by construction).
    end_blocks: Vec<Rc<Code>>,
    check_blocks: Vec<Rc<Code>>,
    init_blocks: Vec<Rc<Code>>,
    end_blocks_run: bool,
    /// Compile- and run-time diagnostics not routed to `$SIG{__WARN__}`.
    pub(crate) diagnostics: Vec<Diagnostic>,
    /// Native frame depth (recursion ceiling).
    pub(crate) depth: usize,
    /// `caller` bookkeeping: one entry per active sub/eval call.
    pub(crate) call_stack: Vec<CallerFrame>,
    /// xorshift state for `rand`/`srand`.
    pub(crate) rng: u64,
    pub(crate) exit_status: Option<i32>,
    /// Re-entrancy guard for `$SIG{__DIE__}`/`__WARN__` handlers.
    pub(crate) in_sig_handler: bool,
}

/// One `caller` record: where the call was made from, and what was called.
#[derive(Debug, Clone)]
pub(crate) struct CallerFrame {
    pub package: RcStr,
    pub file: RcStr,
    pub line: u32,
    /// Fully qualified name of the called sub (`(eval)` for eval frames).
    pub callee: RcStr,
    pub wantarray: Context,
}

/// One entry on the `local` save stack.
#[derive(Debug)]
pub(crate) enum LocalEntry {
    /// Scope boundary marker.
    ScopeMark,
    Scalar { cell: HeapId, saved: Value },
    Array { cell: HeapId, saved: Vec<HeapId> },
    Hash { cell: HeapId, saved: Vec<(RcStr, HeapId)> },
    /// A glob's scalar slot (foreach over a package loop variable).
    GlobScalarSlot { glob: HeapId, saved: Option<HeapId> },
}

impl Interp<NoLimitTracker> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_tracker(NoLimitTracker, CompileOptions::from_env())
    }

    #[must_use]
    pub fn with_options(options: CompileOptions) -> Self {
        Self::with_tracker(NoLimitTracker, options)
    }
}

impl Default for Interp<NoLimitTracker> {
    fn default() -> Self {
        Self::new()
    }
}

impl Interp<LimitedTracker> {
    #[must_use]
    pub fn with_limits(limits: ResourceLimits, options: CompileOptions) -> Self {
        Self::with_tracker(LimitedTracker::new(limits), options)
    }
}

impl<T: ResourceTracker> Interp<T> {
    pub(crate) fn with_tracker(tracker: T, options: CompileOptions) -> Self {
        let mut interp = Self {
            heap: Heap::new(tracker),
            stashes: Stashes::new(),
            io: IoTable::with_standard_handles(),
            writer: Box::new(StdPrint),
            options,
            persistents: AHashMap::new(),
            persist_watermark: 0,
            locals: Vec::new(),
            last_match: None,
            last_pattern: None,
            regex_cache: AHashMap::new(),
            end_blocks: Vec::new(),
            check_blocks: Vec::new(),
            init_blocks: Vec::new(),
            end_blocks_run: false,
            diagnostics: Vec::new(),
            depth: 0,
            call_stack: Vec::new(),
            rng: 0x9E37_79B9_7F4A_7C15,
            exit_status: None,
            in_sig_handler: false,
        };
        interp.init_globals();
        interp
    }

    /// Replaces the output writer (tests capture output this way).
    pub fn set_writer(&mut self, writer: Box<dyn PrintWriter>) {
        self.writer = writer;
    }

    pub fn take_writer(&mut self) -> Box<dyn PrintWriter> {
        std::mem::replace(&mut self.writer, Box::new(StdPrint))
    }

    #[must_use]
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    #[must_use]
    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    fn init_globals(&mut self) {
        let defaults: &[(&str, Value)] = &[
            ("main::/", Value::str("\n")),
            ("main::\\", Value::Undef),
            ("main::,", Value::str("")),
            ("main::\"", Value::str(" ")),
            ("main::;", Value::str("\x1C")),
            ("main::@", Value::str("")),
            ("main::!", Value::str("")),
            ("main::0", Value::str("-")),
            ("main::^P", Value::Int(0)),
        ];
        for (name, value) in defaults {
            if let Ok(cell) = self.global_scalar_cell(name) {
                let _ = self.heap.scalar_set(cell, value.clone());
            }
        }
        // @ARGV, %ENV, @INC, %INC, %SIG.
        let argv = self.options.argv.clone();
        if let Ok(cell) = self.global_array_cell("main::ARGV") {
            for arg in argv {
                let _ = self.heap.array_push(cell, Value::str(arg));
            }
        }
        let env_pairs: Vec<(String, String)> = match &self.options.env {
            Some(pairs) => pairs.clone(),
            None => std::env::vars().collect(),
        };
        if let Ok(cell) = self.global_hash_cell("main::ENV") {
            for (k, v) in env_pairs {
                if let Ok(slot) = self.heap.hash_elem_lv(cell, &k) {
                    let _ = self.heap.scalar_set(slot, Value::str(v));
                }
            }
        }
        let _ = self.global_array_cell("main::INC");
        let _ = self.global_hash_cell("main::INC");
        let _ = self.global_hash_cell("main::SIG");
        // Standard handles.
        for (name, id) in [("STDOUT", IoTable::STDOUT), ("STDERR", IoTable::STDERR), ("STDIN", IoTable::STDIN)] {
            if let Ok(glob) = self.stashes.glob_id(&mut self.heap, "main", name) {
                self.heap.glob_mut(glob).io = Some(id);
            }
        }
    }

    // ---- compile and run ----

    /// Compiles a program. BEGIN blocks run during this call.
    pub fn compile(&mut self, source: &str, name: &str) -> Result<CodeRef, PerliteError> {
        if let Ok(cell) = self.global_scalar_cell("main::0") {
            let _ = self.heap.scalar_set(cell, Value::str(name));
        }
        let main = parser::parse_program(source, name, self).map_err(|e| {
            PerliteError::Compile(vec![e.into_diagnostic()])
        })?;
        let code = self
            .codegen(&main, name)
            .map_err(|e| PerliteError::Compile(vec![e.into_diagnostic()]))?;
        // CHECK blocks run at the end of compilation, last-in first-out.
        let checks: Vec<Rc<Code>> = self.check_blocks.drain(..).rev().collect();
        for check in checks {
            if let Err(e) = self.run_plain(&check) {
                return Err(PerliteError::Runtime(self.unwind_to_exception(e)));
            }
        }
        Ok(CodeRef { code })
    }

    pub(crate) fn codegen(&mut self, sub: &Rc<SubDef>, file: &str) -> ParseResult<Rc<Code>> {
        let mut refactor = RefactorOptions::from_env();
        refactor.enabled |= self.options.large_code_refactor;
        let warn_mask = self.default_features().warn_mask;
        let CompiledUnit { code, installs, warnings } = compile_unit(sub, file, refactor, warn_mask)?;
        self.diagnostics.extend(warnings);
        for (name, sub_code, prototype) in installs {
            self.install_code(&name, sub_code, Vec::new(), prototype)?;
        }
        Ok(code)
    }

    pub(crate) fn install_code(
        &mut self,
        fq_name: &str,
        code: Rc<Code>,
        captures: Vec<HeapId>,
        prototype: Option<RcStr>,
    ) -> ParseResult<()> {
        let (pkg, short) = Stashes::split_name(fq_name, "main");
        let package: RcStr = Rc::from(pkg.as_str());
        let cell = self
            .heap
            .alloc(Cell::Code(CodeCell {
                code,
                captures,
                package,
                name: Some(Rc::from(fq_name)),
                prototype,
            }))
            .map_err(|_| crate::error::ParseError::new("Out of memory during compilation", fq_name, 0))?;
        self.stashes
            .install_sub(&mut self.heap, &pkg, short, cell)
            .map_err(|_| crate::error::ParseError::new("Out of memory during compilation", fq_name, 0))?;
        Ok(())
    }

    /// Runs a compiled program: INIT blocks, the main body, then END blocks.
    pub fn run(&mut self, program: &CodeRef) -> Result<(), PerliteError> {
        let inits: Vec<Rc<Code>> = self.init_blocks.drain(..).collect();
        for init in inits {
            if let Err(e) = self.run_plain(&init) {
                return Err(PerliteError::Runtime(self.unwind_to_exception(e)));
            }
        }
        let result = self.run_plain(&program.code);
        self.run_end_blocks();
        match result {
            Ok(_) => Ok(()),
            Err(RunError::Exit(status)) => {
                self.exit_status = Some(status);
                Ok(())
            }
            Err(e) => Err(PerliteError::Runtime(self.unwind_to_exception(e))),
        }
    }

    /// Compile-and-run in one step.
    pub fn run_source(&mut self, source: &str, name: &str) -> Result<(), PerliteError> {
        let program = self.compile(source, name)?;
        self.run(&program)
    }

    fn run_plain(&mut self, code: &Rc<Code>) -> RunResult<Value> {
        let mut tracer = NoopTracer;
        vm::run_code(self, &mut tracer, code, &[], Vec::new(), Context::Void)
    }

    pub(crate) fn unwind_to_exception(&mut self, e: RunError) -> Exception {
        match e {
            RunError::Die(v) => {
                let message = v.stringify(&self.heap).to_string();
                Exception::new(message)
            }
            RunError::Return(_) => Exception::new("Can't return outside a subroutine".to_string()),
            RunError::Loop(sig) => Exception::new(format!("Can't \"{}\" outside a loop block", sig.kind)),
            RunError::Exit(status) => {
                self.exit_status = Some(status);
                Exception::new(String::new())
            }
            RunError::Resource(err) => Exception::new(err.to_string()),
        }
    }

    fn run_end_blocks(&mut self) {
        if self.end_blocks_run {
            return;
        }
        self.end_blocks_run = true;
        // Reverse source order.
        let blocks: Vec<Rc<Code>> = self.end_blocks.drain(..).rev().collect();
        for block in blocks {
            let _ = self.run_plain(&block);
        }
    }

    // ---- parser services ----

    pub(crate) fn default_features(&self) -> Features {
        let mut feats = Features::default();
        if self.options.strict {
            feats.strict_vars = true;
            feats.strict_subs = true;
            feats.strict_refs = true;
        }
        if self.options.warnings {
            feats.warn_mask = crate::warnings::ALL_WARNINGS;
        }
        feats
    }

    pub(crate) fn reserve_persist_ids(&mut self, watermark: u32) {
        if watermark > self.persist_watermark {
            self.persist_watermark = watermark;
        }
    }

    pub(crate) fn persist_id_watermark(&self) -> u32 {
        self.persist_watermark
    }

    /// The registry cell for a persistent lexical, created on first touch.
    pub(crate) fn persistent_cell(&mut self, id: u32, kind: u16) -> RunResult<HeapId> {
        if let Some(&cell) = self.persistents.get(&id) {
            return Ok(cell);
        }
        let cell = match kind {
            1 => self.heap.new_array()?,
            2 => self.heap.new_hash()?,
            _ => self.heap.new_scalar(Value::Undef)?,
        };
        self.persistents.insert(id, cell);
        Ok(cell)
    }

    /// Compiles and immediately runs a parse-time sub (BEGIN, `use overload`
    /// argument lists, constant folding).
    pub(crate) fn run_parse_time_sub(&mut self, sub: &Rc<SubDef>) -> Result<Value, String> {
        let code = self.codegen(sub, "(BEGIN)").map_err(|e| e.message)?;
        self.run_plain(&code).map_err(|e| match e {
            RunError::Die(v) => v.stringify(&self.heap).to_string(),
            other => format!("{other:?}"),
        })
    }

    pub(crate) fn push_end_block(&mut self, code: Rc<Code>) {
        self.end_blocks.push(code);
    }

    pub(crate) fn register_phase_end(&mut self, sub: &Rc<SubDef>, line: u32) -> ParseResult<()> {
        let code = self
            .codegen(sub, "(END)")
            .map_err(|e| crate::error::ParseError::new(e.message, e.file, line))?;
        self.end_blocks.push(code);
        Ok(())
    }

    pub(crate) fn register_phase_check(&mut self, sub: &Rc<SubDef>, line: u32) -> ParseResult<()> {
        let code = self
            .codegen(sub, "(CHECK)")
            .map_err(|e| crate::error::ParseError::new(e.message, e.file, line))?;
        self.check_blocks.push(code);
        Ok(())
    }

    pub(crate) fn register_phase_init(&mut self, sub: &Rc<SubDef>, line: u32) -> ParseResult<()> {
        let code = self
            .codegen(sub, "(INIT)")
            .map_err(|e| crate::error::ParseError::new(e.message, e.file, line))?;
        self.init_blocks.push(code);
        Ok(())
    }

    pub(crate) fn ensure_package(&mut self, pkg: &str) {
        self.stashes.ensure_package(pkg);
    }

    pub(crate) fn push_isa(&mut self, pkg: &str, parent: &str) -> Result<(), String> {
        self.stashes.ensure_package(parent);
        let isa = self
            .stashes
            .array_cell(&mut self.heap, pkg, "ISA")
            .map_err(|_| "Out of memory".to_string())?;
        self.heap.array_push(isa, Value::str(parent)).map_err(|_| "Out of memory".to_string())
    }

    pub(crate) fn push_inc(&mut self, dir: &str) {
        if let Ok(cell) = self.global_array_cell("main::INC") {
            let _ = self.heap.array_push(cell, Value::str(dir));
        }
    }

    pub(crate) fn has_sub(&self, fq_name: &str) -> bool {
        let (pkg, short) = Stashes::split_name(fq_name, "main");
        self.stashes.code_slot(&self.heap, &pkg, short).is_some()
    }

    pub(crate) fn known_subs(&self) -> Vec<String> {
        self.stashes.all_sub_names(&self.heap)
    }

    /// `use constant NAME => VALUES;` — installs a sub returning the values.
    pub(crate) fn install_constant(&mut self, pkg: &str, name: &str, values: &[String]) -> Result<(), String> {
        use crate::bytecode::builder::CodeBuilder;
        use crate::bytecode::op::Opcode;
        let mut b = CodeBuilder::new("(constant)");
        b.set_position("(constant)", 0);
        if values.len() == 1 {
            let idx = b.intern_str(&values[0]);
            b.emit(Opcode::LoadStr, &[0, idx]);
            b.note_reg(0);
        } else {
            b.emit(Opcode::ListBegin, &[]);
            for v in values {
                let idx = b.intern_str(v);
                b.emit(Opcode::LoadStr, &[0, idx]);
                b.note_reg(0);
                b.emit(Opcode::ListPush, &[0]);
            }
            b.emit(Opcode::ListEnd, &[0]);
        }
        b.emit(Opcode::Return, &[0]);
        let code = b
            .build(0, Vec::new(), Rc::from(format!("{pkg}::{name}").as_str()), Rc::from(pkg))
            .map_err(|_| "constant body too large".to_string())?;
        self.install_code(&format!("{pkg}::{name}"), Rc::new(code), Vec::new(), None)
            .map_err(|e| e.message)
    }

    /// `use overload '+' => sub {...}, fallback => 1;` — evaluates the pair
    /// list at parse time and installs the handlers.
    pub(crate) fn install_overload_pairs(&mut self, pkg: &str, sub: &Rc<SubDef>) -> Result<(), String> {
        let value = self.run_parse_time_sub(sub)?;
        let mut flat = Vec::new();
        value.flatten_into(&mut flat);
        let mut iter = flat.into_iter();
        while let Some(key) = iter.next() {
            let key_str = key.stringify(&self.heap).to_string();
            let Some(handler) = iter.next() else { break };
            if key_str == "fallback" {
                self.stashes.set_overload_fallback(pkg, handler.truthy());
            } else {
                self.stashes.install_overload(pkg, Rc::from(key_str.as_str()), handler);
            }
        }
        Ok(())
    }

    pub(crate) fn install_format(&mut self, pkg: &str, name: &str, lines: Vec<String>) {
        if let Ok(glob) = self.stashes.glob_id(&mut self.heap, pkg, name) {
            self.heap.glob_mut(glob).format =
                Some(Rc::new(crate::ast::FormatDef { name: name.to_string(), lines }));
        }
    }

    // ---- global variable access ----

    pub(crate) fn global_scalar_cell(&mut self, name: &str) -> RunResult<HeapId> {
        let (pkg, short) = Stashes::split_name(name, "main");
        self.stashes.scalar_cell(&mut self.heap, &pkg, short)
    }

    pub(crate) fn global_array_cell(&mut self, name: &str) -> RunResult<HeapId> {
        let (pkg, short) = Stashes::split_name(name, "main");
        self.stashes.array_cell(&mut self.heap, &pkg, short)
    }

    pub(crate) fn global_hash_cell(&mut self, name: &str) -> RunResult<HeapId> {
        let (pkg, short) = Stashes::split_name(name, "main");
        self.stashes.hash_cell(&mut self.heap, &pkg, short)
    }

    pub(crate) fn set_special(&mut self, name: &str, value: Value) {
        if let Ok(cell) = self.global_scalar_cell(name) {
            // Specials keep their cell identity; only the value changes.
            if let Cell::Scalar(c) = self.heap.get_mut(cell) {
                c.value = value;
            }
        }
    }

    pub(crate) fn special_string(&mut self, name: &str) -> RcStr {
        match self.global_scalar_cell(name) {
            Ok(cell) => self.heap.scalar(cell).value.stringify(&self.heap),
            Err(_) => Rc::from(""),
        }
    }

    /// A `%SIG` handler as a callable code value, if installed.
    pub(crate) fn sig_handler(&mut self, name: &str) -> Option<Value> {
        let sig = self.global_hash_cell("main::SIG").ok()?;
        let cell = self.heap.hash_get(sig, name)?;
        let v = self.heap.scalar(cell).value.clone();
        match &v {
            Value::Ref { id, .. } if matches!(self.heap.get(*id), Cell::Code(_)) => Some(v),
            _ => None,
        }
    }

    /// Routes a runtime warning: `$SIG{__WARN__}` gets first refusal; the
    /// caller invokes the returned handler. Otherwise the message goes to
    /// stderr (and the diagnostic sink).
    pub(crate) fn route_warning(&mut self, message: &str) -> Option<Value> {
        if !self.in_sig_handler
            && let Some(handler) = self.sig_handler("__WARN__")
        {
            return Some(handler);
        }
        self.writer.stderr_write(message.to_string().into());
        self.diagnostics.push(Diagnostic {
            severity: Severity::Warning,
            message: message.trim_end().to_string(),
            file: String::new(),
            line: 0,
        });
        None
    }

    /// `local` scope plumbing.
    pub(crate) fn locals_depth(&self) -> usize {
        self.locals.len()
    }

    pub(crate) fn unwind_locals(&mut self, depth: usize) {
        while self.locals.len() > depth {
            let Some(entry) = self.locals.pop() else { break };
            self.restore_local(entry);
        }
    }

    pub(crate) fn restore_local(&mut self, entry: LocalEntry) {
        match entry {
            LocalEntry::ScopeMark => {}
            LocalEntry::Scalar { cell, saved } => {
                if let Cell::Scalar(c) = self.heap.get_mut(cell) {
                    c.value = saved;
                }
            }
            LocalEntry::Array { cell, saved } => {
                if let Cell::Array(a) = self.heap.get_mut(cell) {
                    a.elems = saved.into();
                }
            }
            LocalEntry::Hash { cell, saved } => {
                if let Cell::Hash(h) = self.heap.get_mut(cell) {
                    h.map = saved.into_iter().collect();
                    h.iter_pos = 0;
                }
            }
            LocalEntry::GlobScalarSlot { glob, saved } => {
                if let Cell::Glob(g) = self.heap.get_mut(glob) {
                    g.scalar = saved;
                }
            }
        }
    }

    /// Pops one `local` scope (back to and including the nearest mark).
    pub(crate) fn pop_local_scope(&mut self) {
        while let Some(entry) = self.locals.pop() {
            if matches!(entry, LocalEntry::ScopeMark) {
                break;
            }
            self.restore_local(entry);
        }
    }

    // ---- eval STRING ----

    /// Compiles an `eval STRING` body against the caller's scope snapshot.
    /// Errors come back as the `$@` payload.
    pub(crate) fn compile_eval(
        &mut self,
        source: &str,
        snapshot: Rc<ScopeSnapshot>,
        package: RcStr,
    ) -> Result<Rc<Code>, Value> {
        let mut feats = self.default_features();
        // Eval bodies see the say/state world of the program around them.
        feats.say = true;
        let sub = parser::parse_eval(source, snapshot, package, feats, self)
            .map_err(|e| Value::str(format!("{} at {} line {}.\n", e.message, e.file, e.line)))?;
        self.codegen(&sub, "(eval)")
            .map_err(|e| Value::str(format!("{} at {} line {}.\n", e.message, e.file, e.line)))
    }

    /// xorshift64* step for `rand`.
    pub(crate) fn next_random(&mut self) -> f64 {
        let mut x = self.rng;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.rng = x;
        let bits = x.wrapping_mul(0x2545_F491_4F6C_DD1D) >> 11;
        bits as f64 / (1u64 << 53) as f64
    }
}

impl<T: ResourceTracker> Drop for Interp<T> {
    fn drop(&mut self) {
        self.run_end_blocks();
        self.heap.teardown();
    }
}
