//! Scoped symbol tables.
//!
//! The parser resolves every variable reference against this structure: a
//! stack of subs, each with a stack of block scopes over a flat pad. Nested
//! subs that touch outer lexicals get capture-table entries, chained through
//! intermediate subs so the cell travels inward one level at a time.
//!
//! Two constructs break the frame discipline and route through the
//! per-context persistent registry instead: BEGIN blocks (compiled and run
//! mid-parse, when no outer frame exists) and `state` variables. A lexical
//! referenced from a BEGIN block has its pad entry converted to a persistent
//! id; every frame thereafter binds that slot to the registry cell, so the
//! BEGIN-time closure and the runtime code share storage by name.

use std::rc::Rc;

use ahash::AHashMap;

use crate::{
    ast::{CaptureSource, PadEntry, Sigil},
    value::RcStr,
};

/// How a resolved name should be addressed by the current sub.
#[derive(Debug, Clone)]
pub(crate) enum Resolved {
    Lexical(u16),
    Capture(u16),
    Persistent(u32),
    /// Package variable, fully qualified (no sigil).
    Global(RcStr),
}

#[derive(Debug, Clone)]
enum ScopeEntry {
    Lexical(u16),
    /// `our` alias to a stash slot.
    OurAlias(RcStr),
}

/// The scope snapshot taken at an `eval STRING` site. When the eval body is
/// compiled at runtime, lexical lookups that miss resolve here and become
/// captures against the *calling frame*.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub(crate) struct ScopeSnapshot {
    pub entries: AHashMap<String, SnapshotSlot>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub(crate) enum SnapshotSlot {
    Lexical(u16),
    Capture(u16),
    Persistent(u32),
    Global(String),
}

#[derive(Debug)]
struct SubScope {
    pad: Vec<PadEntry>,
    scopes: Vec<AHashMap<String, ScopeEntry>>,
    captures: Vec<CaptureSource>,
    /// Name key per capture, to reuse entries.
    capture_keys: Vec<String>,
    /// BEGIN bodies run before any outer frame exists, so outer lexicals
    /// cannot be captured and convert to persistent cells instead.
    detached: bool,
    /// Snapshot for eval-string compilation roots.
    snapshot: Option<Rc<ScopeSnapshot>>,
}

impl SubScope {
    fn new(detached: bool, snapshot: Option<Rc<ScopeSnapshot>>) -> Self {
        Self { pad: Vec::new(), scopes: vec![AHashMap::new()], captures: Vec::new(), capture_keys: Vec::new(), detached, snapshot }
    }
}

/// The parser's view of all live scopes, innermost sub last.
#[derive(Debug)]
pub(crate) struct ScopeStack {
    subs: Vec<SubScope>,
    next_persist_id: u32,
}

/// A sub scope detached by [`ScopeStack::suspend_sub`].
#[derive(Debug)]
pub(crate) struct SuspendedSub(SubScope);

fn key(sigil: Sigil, name: &str) -> String {
    format!("{}{name}", sigil.ch())
}

impl ScopeStack {
    pub(crate) fn new() -> Self {
        Self { subs: vec![SubScope::new(false, None)], next_persist_id: 0 }
    }

    /// A fresh stack for an `eval STRING` compilation: the root sub resolves
    /// missing names through the snapshot. `persist_base` continues the id
    /// sequence of the main compilation.
    pub(crate) fn for_eval(snapshot: Rc<ScopeSnapshot>, persist_base: u32) -> Self {
        Self { subs: vec![SubScope::new(false, Some(snapshot))], next_persist_id: persist_base }
    }

    pub(crate) fn next_persist_id(&self) -> u32 {
        self.next_persist_id
    }

    fn current(&mut self) -> &mut SubScope {
        self.subs.last_mut().unwrap_or_else(|| unreachable!("scope stack is never empty"))
    }

    // ---- sub boundaries ----

    pub(crate) fn enter_sub(&mut self, detached: bool) {
        self.subs.push(SubScope::new(detached, None));
    }

    /// Pops the finished sub, returning its pad and capture table.
    pub(crate) fn leave_sub(&mut self) -> (Vec<PadEntry>, Vec<CaptureSource>) {
        let sub = self.subs.pop().unwrap_or_else(|| unreachable!("unbalanced leave_sub"));
        (sub.pad, sub.captures)
    }

    /// Temporarily removes the innermost sub so a sibling sub can be parsed
    /// against the outer scopes (class methods parse while the synthesized
    /// constructor scope is open).
    pub(crate) fn suspend_sub(&mut self) -> SuspendedSub {
        SuspendedSub(self.subs.pop().unwrap_or_else(|| unreachable!("unbalanced suspend_sub")))
    }

    pub(crate) fn resume_sub(&mut self, suspended: SuspendedSub) {
        self.subs.push(suspended.0);
    }

    // ---- block scopes ----

    pub(crate) fn enter_scope(&mut self) {
        self.current().scopes.push(AHashMap::new());
    }

    pub(crate) fn leave_scope(&mut self) {
        self.current().scopes.pop();
    }

    // ---- declarations ----

    /// Declares a `my` variable in the innermost scope, returning its pad slot.
    pub(crate) fn declare_my(&mut self, name: &str, sigil: Sigil) -> u16 {
        let sub = self.current();
        let slot = u16::try_from(sub.pad.len()).unwrap_or(u16::MAX);
        sub.pad.push(PadEntry { name: Rc::from(name), sigil, persist_id: None });
        let k = key(sigil, name);
        if let Some(scope) = sub.scopes.last_mut() {
            scope.insert(k, ScopeEntry::Lexical(slot));
        }
        slot
    }

    /// Declares a `state` variable: a pad slot bound to a persistent cell.
    pub(crate) fn declare_state(&mut self, name: &str, sigil: Sigil) -> (u16, u32) {
        let id = self.next_persist_id;
        self.next_persist_id += 1;
        let sub = self.current();
        let slot = u16::try_from(sub.pad.len()).unwrap_or(u16::MAX);
        sub.pad.push(PadEntry { name: Rc::from(name), sigil, persist_id: Some(id) });
        let k = key(sigil, name);
        if let Some(scope) = sub.scopes.last_mut() {
            scope.insert(k, ScopeEntry::Lexical(slot));
        }
        (slot, id)
    }

    /// Declares an `our` alias to `package::name`.
    pub(crate) fn declare_our(&mut self, name: &str, sigil: Sigil, package: &str) {
        let full: RcStr = Rc::from(format!("{package}::{name}").as_str());
        let k = key(sigil, name);
        let sub = self.current();
        if let Some(scope) = sub.scopes.last_mut() {
            scope.insert(k, ScopeEntry::OurAlias(full));
        }
    }

    // ---- resolution ----

    /// Resolves `name` with `sigil` from the innermost sub outward. Returns
    /// `None` for names with no lexical binding (package variable territory).
    pub(crate) fn resolve(&mut self, name: &str, sigil: Sigil) -> Option<Resolved> {
        let k = key(sigil, name);

        // Current sub's own scopes.
        if let Some(r) = self.find_in_sub(self.subs.len() - 1, &k) {
            return Some(r);
        }

        // Outer subs, innermost first.
        for depth in (0..self.subs.len() - 1).rev() {
            if let Some(found) = self.find_in_sub(depth, &k) {
                return Some(self.bridge_inward(depth, &k, found));
            }
        }

        // Eval-site snapshot on the root sub.
        let root_snapshot = self.subs.first().and_then(|s| s.snapshot.clone());
        if let Some(snapshot) = root_snapshot
            && let Some(slot) = snapshot.entries.get(&k)
        {
            let resolved = match slot {
                SnapshotSlot::Lexical(s) => self.capture_in(0, &k, CaptureSource::ParentLexical(*s)),
                SnapshotSlot::Capture(i) => self.capture_in(0, &k, CaptureSource::ParentCapture(*i)),
                SnapshotSlot::Persistent(id) => Resolved::Persistent(*id),
                SnapshotSlot::Global(full) => Resolved::Global(Rc::from(full.as_str())),
            };
            // Bridge from the root to the current sub if we're nested.
            return Some(self.bridge_from_root(&k, resolved));
        }
        None
    }

    fn find_in_sub(&self, depth: usize, k: &str) -> Option<Resolved> {
        let sub = &self.subs[depth];
        for scope in sub.scopes.iter().rev() {
            match scope.get(k) {
                Some(ScopeEntry::Lexical(slot)) => {
                    let entry = &sub.pad[*slot as usize];
                    if let Some(id) = entry.persist_id {
                        return Some(Resolved::Persistent(id));
                    }
                    return Some(Resolved::Lexical(*slot));
                }
                Some(ScopeEntry::OurAlias(full)) => return Some(Resolved::Global(Rc::clone(full))),
                None => {}
            }
        }
        // Already-captured name in this sub.
        if let Some(idx) = sub.capture_keys.iter().position(|ck| ck == k) {
            return Some(Resolved::Capture(u16::try_from(idx).unwrap_or(u16::MAX)));
        }
        None
    }

    /// Builds the capture chain from the sub at `depth` (where the name is a
    /// lexical or capture) into the current sub.
    fn bridge_inward(&mut self, depth: usize, k: &str, found: Resolved) -> Resolved {
        match found {
            Resolved::Global(_) | Resolved::Persistent(_) => found,
            Resolved::Lexical(slot) => {
                // A detached sub (BEGIN) cannot capture: convert the outer pad
                // entry to a persistent cell and address it by id everywhere.
                // The same applies when any sub on the chain is detached.
                if self.subs[depth + 1..].iter().any(|s| s.detached) {
                    let id = self.next_persist_id;
                    self.next_persist_id += 1;
                    self.subs[depth].pad[slot as usize].persist_id = Some(id);
                    return Resolved::Persistent(id);
                }
                let mut source = CaptureSource::ParentLexical(slot);
                let mut resolved = Resolved::Lexical(slot);
                for d in depth + 1..self.subs.len() {
                    resolved = self.capture_in(d, k, source);
                    if let Resolved::Capture(idx) = resolved {
                        source = CaptureSource::ParentCapture(idx);
                    }
                }
                resolved
            }
            Resolved::Capture(idx) => {
                let mut source = CaptureSource::ParentCapture(idx);
                let mut resolved = Resolved::Capture(idx);
                for d in depth + 1..self.subs.len() {
                    resolved = self.capture_in(d, k, source);
                    if let Resolved::Capture(i) = resolved {
                        source = CaptureSource::ParentCapture(i);
                    }
                }
                resolved
            }
        }
    }

    fn bridge_from_root(&mut self, k: &str, resolved: Resolved) -> Resolved {
        match resolved {
            Resolved::Capture(idx) if self.subs.len() > 1 => {
                let mut source = CaptureSource::ParentCapture(idx);
                let mut out = Resolved::Capture(idx);
                for d in 1..self.subs.len() {
                    out = self.capture_in(d, k, source);
                    if let Resolved::Capture(i) = out {
                        source = CaptureSource::ParentCapture(i);
                    }
                }
                out
            }
            other => other,
        }
    }

    /// Adds (or reuses) a capture entry for `k` in the sub at `depth`.
    fn capture_in(&mut self, depth: usize, k: &str, source: CaptureSource) -> Resolved {
        let sub = &mut self.subs[depth];
        if let Some(idx) = sub.capture_keys.iter().position(|ck| ck == k) {
            return Resolved::Capture(u16::try_from(idx).unwrap_or(u16::MAX));
        }
        sub.captures.push(source);
        sub.capture_keys.push(k.to_string());
        Resolved::Capture(u16::try_from(sub.captures.len() - 1).unwrap_or(u16::MAX))
    }

    /// Snapshot of everything visible in the current sub, for `eval STRING`.
    pub(crate) fn snapshot(&self) -> ScopeSnapshot {
        let mut entries = AHashMap::new();
        let sub = self.subs.last().unwrap_or_else(|| unreachable!());
        // Outer scopes first so inner declarations shadow them.
        for scope in &sub.scopes {
            for (k, entry) in scope {
                let slot = match entry {
                    ScopeEntry::Lexical(s) => match sub.pad[*s as usize].persist_id {
                        Some(id) => SnapshotSlot::Persistent(id),
                        None => SnapshotSlot::Lexical(*s),
                    },
                    ScopeEntry::OurAlias(full) => SnapshotSlot::Global(full.to_string()),
                };
                entries.insert(k.clone(), slot);
            }
        }
        for (idx, k) in sub.capture_keys.iter().enumerate() {
            entries.entry(k.clone()).or_insert(SnapshotSlot::Capture(u16::try_from(idx).unwrap_or(u16::MAX)));
        }
        ScopeSnapshot { entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadowing_resolves_to_innermost() {
        let mut st = ScopeStack::new();
        let outer = st.declare_my("x", Sigil::Scalar);
        st.enter_scope();
        let inner = st.declare_my("x", Sigil::Scalar);
        assert_ne!(outer, inner);
        assert!(matches!(st.resolve("x", Sigil::Scalar), Some(Resolved::Lexical(s)) if s == inner));
        st.leave_scope();
        assert!(matches!(st.resolve("x", Sigil::Scalar), Some(Resolved::Lexical(s)) if s == outer));
    }

    #[test]
    fn sigils_are_distinct_namespaces() {
        let mut st = ScopeStack::new();
        let s = st.declare_my("x", Sigil::Scalar);
        let a = st.declare_my("x", Sigil::Array);
        assert!(matches!(st.resolve("x", Sigil::Scalar), Some(Resolved::Lexical(v)) if v == s));
        assert!(matches!(st.resolve("x", Sigil::Array), Some(Resolved::Lexical(v)) if v == a));
        assert!(st.resolve("x", Sigil::Hash).is_none());
    }

    #[test]
    fn nested_sub_captures_outer_lexical() {
        let mut st = ScopeStack::new();
        let slot = st.declare_my("count", Sigil::Scalar);
        st.enter_sub(false);
        let r = st.resolve("count", Sigil::Scalar);
        assert!(matches!(r, Some(Resolved::Capture(0))));
        // Second reference reuses the capture entry.
        let r = st.resolve("count", Sigil::Scalar);
        assert!(matches!(r, Some(Resolved::Capture(0))));
        let (_, captures) = st.leave_sub();
        assert!(matches!(captures.as_slice(), [CaptureSource::ParentLexical(s)] if *s == slot));
    }

    #[test]
    fn doubly_nested_capture_chains_through() {
        let mut st = ScopeStack::new();
        st.declare_my("x", Sigil::Scalar);
        st.enter_sub(false);
        st.enter_sub(false);
        let r = st.resolve("x", Sigil::Scalar);
        assert!(matches!(r, Some(Resolved::Capture(0))));
        let (_, inner_caps) = st.leave_sub();
        assert!(matches!(inner_caps.as_slice(), [CaptureSource::ParentCapture(0)]));
        let (_, mid_caps) = st.leave_sub();
        assert!(matches!(mid_caps.as_slice(), [CaptureSource::ParentLexical(0)]));
    }

    #[test]
    fn begin_reference_converts_to_persistent() {
        let mut st = ScopeStack::new();
        let slot = st.declare_my("x", Sigil::Scalar);
        st.enter_sub(true);
        let r = st.resolve("x", Sigil::Scalar);
        assert!(matches!(r, Some(Resolved::Persistent(0))));
        let (pad, captures) = st.leave_sub();
        assert!(pad.is_empty());
        assert!(captures.is_empty());
        // The outer slot is now persistent, and later outer references see it.
        assert!(matches!(st.resolve("x", Sigil::Scalar), Some(Resolved::Persistent(0))));
        let _ = slot;
    }

    #[test]
    fn our_aliases_resolve_to_globals() {
        let mut st = ScopeStack::new();
        st.declare_our("VERSION", Sigil::Scalar, "Foo");
        match st.resolve("VERSION", Sigil::Scalar) {
            Some(Resolved::Global(full)) => assert_eq!(&*full, "Foo::VERSION"),
            other => panic!("expected global, got {other:?}"),
        }
    }

    #[test]
    fn snapshot_lists_visible_lexicals() {
        let mut st = ScopeStack::new();
        let slot = st.declare_my("x", Sigil::Scalar);
        st.enter_scope();
        st.declare_my("y", Sigil::Array);
        let snap = st.snapshot();
        assert!(matches!(snap.entries.get("$x"), Some(SnapshotSlot::Lexical(s)) if *s == slot));
        assert!(matches!(snap.entries.get("@y"), Some(SnapshotSlot::Lexical(_))));
        assert!(snap.entries.get("%z").is_none());
    }

    #[test]
    fn eval_snapshot_names_become_captures() {
        let snap = ScopeSnapshot {
            entries: [("$x".to_string(), SnapshotSlot::Lexical(4))].into_iter().collect(),
        };
        let mut st = ScopeStack::for_eval(Rc::new(snap), 10);
        let r = st.resolve("x", Sigil::Scalar);
        assert!(matches!(r, Some(Resolved::Capture(0))));
        let (_, captures) = st.leave_sub();
        assert!(matches!(captures.as_slice(), [CaptureSource::ParentLexical(4)]));
    }
}
