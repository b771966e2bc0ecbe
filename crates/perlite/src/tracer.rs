//! Execution tracing hooks for the bytecode interpreter.
//!
//! The [`VmTracer`] trait defines hook points at key execution events
//! (instruction dispatch, frame push/pop, `die` unwinding). The interpreter is
//! monomorphized over the tracer, so [`NoopTracer`] — the production default —
//! compiles every hook away, the same way [`NoLimitTracker`](crate::resource::NoLimitTracker)
//! eliminates resource checks.
//!
//! | Tracer | Purpose |
//! |--------|---------|
//! | [`NoopTracer`] | Zero-cost no-op (default) |
//! | [`StderrTracer`] | Human-readable execution log to stderr |
//! | [`ProfilingTracer`] | Opcode frequency counters and peak frame depth |

use ahash::AHashMap;

use crate::bytecode::Opcode;

/// Hook points called by the interpreter main loop.
pub trait VmTracer {
    /// An opcode is about to be dispatched at word offset `pc`.
    fn on_instruction(&mut self, pc: usize, op: Opcode);

    /// A frame was pushed (sub call, `eval`, or sort/map/grep body).
    fn on_frame_push(&mut self, name: &str, depth: usize);

    /// A frame was popped.
    fn on_frame_pop(&mut self, depth: usize);

    /// A `die` started unwinding with the given message text.
    fn on_die(&mut self, message: &str);
}

/// Zero-cost tracer; all hooks are empty and inline away.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {
    #[inline(always)]
    fn on_instruction(&mut self, _pc: usize, _op: Opcode) {}

    #[inline(always)]
    fn on_frame_push(&mut self, _name: &str, _depth: usize) {}

    #[inline(always)]
    fn on_frame_pop(&mut self, _depth: usize) {}

    #[inline(always)]
    fn on_die(&mut self, _message: &str) {}
}

/// Logs every event to stderr. Slow; debugging only.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrTracer;

impl VmTracer for StderrTracer {
    fn on_instruction(&mut self, pc: usize, op: Opcode) {
        eprintln!("[perlite] {pc:06} {op:?}");
    }

    fn on_frame_push(&mut self, name: &str, depth: usize) {
        eprintln!("[perlite] {:depth$}-> {name}", "");
    }

    fn on_frame_pop(&mut self, depth: usize) {
        eprintln!("[perlite] {:depth$}<-", "");
    }

    fn on_die(&mut self, message: &str) {
        eprintln!("[perlite] die: {}", message.trim_end());
    }
}

/// Counts opcode frequency and tracks peak frame depth.
#[derive(Debug, Clone, Default)]
pub struct ProfilingTracer {
    counts: AHashMap<Opcode, u64>,
    instructions: u64,
    peak_depth: usize,
    dies: u64,
}

impl ProfilingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total instructions dispatched.
    #[must_use]
    pub fn instructions(&self) -> u64 {
        self.instructions
    }

    /// Deepest frame stack observed.
    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak_depth
    }

    /// Opcode counts sorted descending, for a quick hot-op report.
    #[must_use]
    pub fn report(&self) -> Vec<(Opcode, u64)> {
        let mut pairs: Vec<_> = self.counts.iter().map(|(op, n)| (*op, *n)).collect();
        pairs.sort_by(|a, b| b.1.cmp(&a.1));
        pairs
    }
}

impl VmTracer for ProfilingTracer {
    fn on_instruction(&mut self, _pc: usize, op: Opcode) {
        self.instructions += 1;
        *self.counts.entry(op).or_insert(0) += 1;
    }

    fn on_frame_push(&mut self, _name: &str, depth: usize) {
        if depth > self.peak_depth {
            self.peak_depth = depth;
        }
    }

    fn on_frame_pop(&mut self, _depth: usize) {}

    fn on_die(&mut self, _message: &str) {
        self.dies += 1;
    }
}
