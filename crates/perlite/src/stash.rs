//! Package symbol tables.
//!
//! A stash maps short names to globs for one package; the registry of all
//! stashes belongs to the compilation context and is torn down with it.
//! `main` is the root. Method resolution walks `@ISA` depth-first, and
//! per-package overload tables (installed by `use overload`) hang off the
//! stash so operator dispatch can find them through the same `@ISA` walk.

use std::rc::Rc;

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::{
    error::RunResult,
    heap::{Cell, GlobCell, Heap, HeapId},
    resource::ResourceTracker,
    value::{RcStr, Value},
};

/// Operator-overload table for one package: operator symbol → handler.
#[derive(Debug, Default)]
pub(crate) struct OverloadTable {
    pub handlers: AHashMap<RcStr, Value>,
    pub fallback: Option<bool>,
}

/// One package's symbol table.
#[derive(Debug, Default)]
pub(crate) struct Stash {
    globs: AHashMap<RcStr, HeapId>,
    overload: Option<Box<OverloadTable>>,
}

/// The per-context package registry.
#[derive(Debug, Default)]
pub(crate) struct Stashes {
    map: AHashMap<RcStr, Stash>,
}

impl Stashes {
    pub(crate) fn new() -> Self {
        let mut stashes = Self::default();
        stashes.map.insert(Rc::from("main"), Stash::default());
        stashes
    }

    /// Splits a possibly qualified name into package and short name.
    /// `Foo::Bar::baz` → (`Foo::Bar`, `baz`); unqualified names fall into
    /// `default_pkg`. A leading `::` or `main::` means `main`.
    pub(crate) fn split_name<'n>(name: &'n str, default_pkg: &str) -> (String, &'n str) {
        match name.rfind("::") {
            Some(pos) => {
                let pkg = &name[..pos];
                let short = &name[pos + 2..];
                let pkg = if pkg.is_empty() { "main" } else { pkg };
                (pkg.to_string(), short)
            }
            None => (default_pkg.to_string(), name),
        }
    }

    pub(crate) fn ensure_package(&mut self, pkg: &str) {
        if !self.map.contains_key(pkg) {
            self.map.insert(Rc::from(pkg), Stash::default());
        }
    }

    /// Looks up a glob without vivifying it.
    pub(crate) fn find_glob(&self, pkg: &str, short: &str) -> Option<HeapId> {
        self.map.get(pkg)?.globs.get(short).copied()
    }

    /// Finds or creates the glob for `pkg::short`.
    pub(crate) fn glob_id(
        &mut self,
        heap: &mut Heap<impl ResourceTracker>,
        pkg: &str,
        short: &str,
    ) -> RunResult<HeapId> {
        self.ensure_package(pkg);
        if let Some(id) = self.map[pkg].globs.get(short) {
            return Ok(*id);
        }
        let full: RcStr = Rc::from(format!("{pkg}::{short}").as_str());
        let id = heap.alloc(Cell::Glob(GlobCell::new(full)))?;
        self.map.get_mut(pkg).unwrap_or_else(|| unreachable!()).globs.insert(Rc::from(short), id);
        Ok(id)
    }

    /// The scalar slot of `pkg::short`, vivified.
    pub(crate) fn scalar_cell(
        &mut self,
        heap: &mut Heap<impl ResourceTracker>,
        pkg: &str,
        short: &str,
    ) -> RunResult<HeapId> {
        let glob = self.glob_id(heap, pkg, short)?;
        if let Some(cell) = heap.glob(glob).scalar {
            return Ok(cell);
        }
        let cell = heap.new_scalar(Value::Undef)?;
        heap.glob_mut(glob).scalar = Some(cell);
        Ok(cell)
    }

    /// The array slot of `pkg::short`, vivified.
    pub(crate) fn array_cell(
        &mut self,
        heap: &mut Heap<impl ResourceTracker>,
        pkg: &str,
        short: &str,
    ) -> RunResult<HeapId> {
        let glob = self.glob_id(heap, pkg, short)?;
        if let Some(cell) = heap.glob(glob).array {
            return Ok(cell);
        }
        let cell = heap.new_array()?;
        heap.glob_mut(glob).array = Some(cell);
        Ok(cell)
    }

    /// The hash slot of `pkg::short`, vivified.
    pub(crate) fn hash_cell(
        &mut self,
        heap: &mut Heap<impl ResourceTracker>,
        pkg: &str,
        short: &str,
    ) -> RunResult<HeapId> {
        let glob = self.glob_id(heap, pkg, short)?;
        if let Some(cell) = heap.glob(glob).hash {
            return Ok(cell);
        }
        let cell = heap.new_hash()?;
        heap.glob_mut(glob).hash = Some(cell);
        Ok(cell)
    }

    /// The code slot of `pkg::short`, if installed.
    pub(crate) fn code_slot(&self, heap: &Heap<impl ResourceTracker>, pkg: &str, short: &str) -> Option<HeapId> {
        let glob = self.find_glob(pkg, short)?;
        heap.glob(glob).code
    }

    pub(crate) fn install_sub(
        &mut self,
        heap: &mut Heap<impl ResourceTracker>,
        pkg: &str,
        short: &str,
        code: HeapId,
    ) -> RunResult<()> {
        let glob = self.glob_id(heap, pkg, short)?;
        heap.glob_mut(glob).code = Some(code);
        Ok(())
    }

    /// Every installed sub, fully qualified (the parser uses this to treat
    /// BEGIN-installed names as known barewords).
    pub(crate) fn all_sub_names(&self, heap: &Heap<impl ResourceTracker>) -> Vec<String> {
        let mut out = Vec::new();
        for (pkg, stash) in &self.map {
            for (short, &glob) in &stash.globs {
                if heap.glob(glob).code.is_some() {
                    out.push(format!("{pkg}::{short}"));
                }
            }
        }
        out
    }

    /// Resolves a method through `pkg` and its `@ISA` ancestry, depth-first
    /// in declaration order, `UNIVERSAL` last.
    pub(crate) fn resolve_method(
        &self,
        heap: &Heap<impl ResourceTracker>,
        pkg: &str,
        method: &str,
    ) -> Option<HeapId> {
        let mut seen = SmallVec::new();
        self.resolve_method_walk(heap, pkg, method, &mut seen)
            .or_else(|| self.code_slot(heap, "UNIVERSAL", method))
    }

    fn resolve_method_walk(
        &self,
        heap: &Heap<impl ResourceTracker>,
        pkg: &str,
        method: &str,
        seen: &mut SmallVec<[String; 8]>,
    ) -> Option<HeapId> {
        if seen.iter().any(|p| p == pkg) {
            return None;
        }
        seen.push(pkg.to_string());
        if let Some(code) = self.code_slot(heap, pkg, method) {
            return Some(code);
        }
        let isa_glob = self.find_glob(pkg, "ISA")?;
        let isa = heap.glob(isa_glob).array?;
        let parents: Vec<String> =
            heap.array(isa).elems.iter().map(|&e| heap.scalar(e).value.stringify(heap).to_string()).collect();
        for parent in parents {
            if let Some(code) = self.resolve_method_walk(heap, &parent, method, seen) {
                return Some(code);
            }
        }
        None
    }

    /// `SUPER::method` resolution: starts at the parents of `pkg`.
    pub(crate) fn resolve_super(
        &self,
        heap: &Heap<impl ResourceTracker>,
        pkg: &str,
        method: &str,
    ) -> Option<HeapId> {
        let isa_glob = self.find_glob(pkg, "ISA")?;
        let isa = heap.glob(isa_glob).array?;
        let parents: Vec<String> =
            heap.array(isa).elems.iter().map(|&e| heap.scalar(e).value.stringify(heap).to_string()).collect();
        let mut seen = SmallVec::new();
        for parent in parents {
            if let Some(code) = self.resolve_method_walk(heap, &parent, method, &mut seen) {
                return Some(code);
            }
        }
        None
    }

    /// `$obj->isa('Pkg')` ancestry test.
    pub(crate) fn isa(&self, heap: &Heap<impl ResourceTracker>, pkg: &str, ancestor: &str) -> bool {
        if pkg == ancestor {
            return true;
        }
        let Some(isa_glob) = self.find_glob(pkg, "ISA") else { return false };
        let Some(isa) = heap.glob(isa_glob).array else { return false };
        let parents: Vec<String> =
            heap.array(isa).elems.iter().map(|&e| heap.scalar(e).value.stringify(heap).to_string()).collect();
        parents.iter().any(|parent| self.isa(heap, parent, ancestor))
    }

    // ---- overload ----

    pub(crate) fn install_overload(&mut self, pkg: &str, op: RcStr, handler: Value) {
        self.ensure_package(pkg);
        let stash = self.map.get_mut(pkg).unwrap_or_else(|| unreachable!());
        stash.overload.get_or_insert_with(Box::default).handlers.insert(op, handler);
    }

    pub(crate) fn set_overload_fallback(&mut self, pkg: &str, fallback: bool) {
        self.ensure_package(pkg);
        let stash = self.map.get_mut(pkg).unwrap_or_else(|| unreachable!());
        stash.overload.get_or_insert_with(Box::default).fallback = Some(fallback);
    }

    /// True when `pkg` (or an ancestor) has any overload table at all.
    pub(crate) fn has_overload(&self, heap: &Heap<impl ResourceTracker>, pkg: &str) -> bool {
        if self.map.get(pkg).is_some_and(|s| s.overload.is_some()) {
            return true;
        }
        let Some(isa_glob) = self.find_glob(pkg, "ISA") else { return false };
        let Some(isa) = heap.glob(isa_glob).array else { return false };
        let parents: Vec<String> =
            heap.array(isa).elems.iter().map(|&e| heap.scalar(e).value.stringify(heap).to_string()).collect();
        parents.iter().any(|parent| self.has_overload(heap, parent))
    }

    /// Finds the handler for `op` through the `@ISA` walk.
    pub(crate) fn find_overload(&self, heap: &Heap<impl ResourceTracker>, pkg: &str, op: &str) -> Option<Value> {
        if let Some(stash) = self.map.get(pkg)
            && let Some(table) = &stash.overload
            && let Some(handler) = table.handlers.get(op)
        {
            return Some(handler.clone());
        }
        let isa_glob = self.find_glob(pkg, "ISA")?;
        let isa = heap.glob(isa_glob).array?;
        let parents: Vec<String> =
            heap.array(isa).elems.iter().map(|&e| heap.scalar(e).value.stringify(heap).to_string()).collect();
        for parent in parents {
            if let Some(handler) = self.find_overload(heap, &parent, op) {
                return Some(handler);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NoLimitTracker;

    #[test]
    fn split_name_handles_qualification() {
        assert_eq!(Stashes::split_name("foo", "main"), ("main".to_string(), "foo"));
        assert_eq!(Stashes::split_name("Foo::bar", "main"), ("Foo".to_string(), "bar"));
        assert_eq!(Stashes::split_name("Foo::Bar::baz", "P"), ("Foo::Bar".to_string(), "baz"));
        assert_eq!(Stashes::split_name("::baz", "P"), ("main".to_string(), "baz"));
    }

    #[test]
    fn glob_slots_vivify_once() {
        let mut heap = Heap::new(NoLimitTracker);
        let mut stashes = Stashes::new();
        let a = stashes.scalar_cell(&mut heap, "main", "x").unwrap();
        let b = stashes.scalar_cell(&mut heap, "main", "x").unwrap();
        assert_eq!(a, b);
        let arr = stashes.array_cell(&mut heap, "main", "x").unwrap();
        assert_ne!(a, arr);
        assert_eq!(&*heap.glob(stashes.find_glob("main", "x").unwrap()).name, "main::x");
    }

    #[test]
    fn method_resolution_walks_isa() {
        let mut heap = Heap::new(NoLimitTracker);
        let mut stashes = Stashes::new();
        // Dog isa Animal; Animal::speak exists.
        let code = heap
            .alloc(Cell::Glob(GlobCell::new(Rc::from("dummy"))))
            .unwrap();
        stashes.install_sub(&mut heap, "Animal", "speak", code).unwrap();
        let isa = stashes.array_cell(&mut heap, "Dog", "ISA").unwrap();
        heap.array_push(isa, Value::str("Animal")).unwrap();
        assert_eq!(stashes.resolve_method(&heap, "Dog", "speak"), Some(code));
        assert!(stashes.resolve_method(&heap, "Dog", "bark").is_none());
        assert!(stashes.isa(&heap, "Dog", "Animal"));
        assert!(!stashes.isa(&heap, "Animal", "Dog"));
        assert_eq!(stashes.resolve_super(&heap, "Dog", "speak"), Some(code));
    }
}
