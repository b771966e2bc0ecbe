//! perlite — an embeddable Perl 5 compiler and register-bytecode interpreter.
//!
//! One [`Interp`] is one compilation context: feed it source text and it
//! lexes, parses (running BEGIN blocks as they close), desugars class
//! features, re-expresses oversized blocks as nested closures, compiles to a
//! 16-bit register bytecode, and executes against a shared runtime value
//! model with references, autovivification, tie magic, and operator
//! overloading.
//!
//! ```
//! use perlite::{CollectStringPrint, Interp};
//!
//! let mut interp = Interp::new();
//! interp.set_writer(Box::new(CollectStringPrint::new()));
//! interp.run_source("print 6 * 7;", "answer.pl").unwrap();
//! ```

mod ast;
mod bytecode;
mod error;
mod heap;
mod interp;
mod io;
mod lexer;
mod pack;
mod parser;
mod refactor;
mod regex;
mod resource;
mod sprintf;
mod stash;
mod symbols;
mod tr;
pub mod tracer;
mod value;
mod warnings;

pub use crate::{
    bytecode::{Code, Opcode},
    error::{Diagnostic, Exception, Severity, StackFrame},
    interp::{CodeRef, CompileOptions, Interp, PerliteError},
    io::{CollectStringPrint, NoPrint, PrintWriter, StdPrint},
    resource::{
        DEFAULT_MAX_RECURSION_DEPTH, LARGE_RESULT_THRESHOLD, LimitedTracker, NoLimitTracker, ResourceError,
        ResourceLimits, ResourceTracker,
    },
    tracer::{NoopTracer, ProfilingTracer, StderrTracer, VmTracer},
    warnings::WarningCategory,
};
