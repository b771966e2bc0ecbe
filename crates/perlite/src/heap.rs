//! The cell arena.
//!
//! Every Perl container the program can alias — a scalar variable, an array,
//! a hash, a subroutine, a glob — is a [`Cell`] in the arena, addressed by
//! [`HeapId`]. Sharing is the point: a closure capture, a reference, a glob
//! slot, and a pad slot may all hold the same id, and mutation through any of
//! them is seen by the rest. Cells live until the owning context is dropped;
//! destruction timing follows the context, matching a garbage-collected host.

use std::{collections::VecDeque, rc::Rc};

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::{
    ast::FormatDef,
    bytecode::Code,
    error::{RunError, RunResult},
    io::IoId,
    resource::{NoLimitTracker, ResourceTracker},
    value::{RcStr, Value, ref_address_hex},
};

/// Index of a cell in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(u32);

impl HeapId {
    pub(crate) fn index(self) -> u32 {
        self.0
    }
}

/// Out-of-band per-scalar metadata. Allocated only when first needed.
#[derive(Debug, Default)]
pub(crate) struct Magic {
    pub readonly: bool,
    pub tainted: bool,
    /// `pos()` after a `/g` match on this scalar.
    pub pos: Option<usize>,
    /// Tied object (the blessed ref passed to `tie`). The interpreter routes
    /// reads through `FETCH` and writes through `STORE` when this is set.
    pub tie: Option<Value>,
}

#[derive(Debug)]
pub(crate) struct ScalarCell {
    pub value: Value,
    pub magic: Option<Box<Magic>>,
}

impl ScalarCell {
    pub(crate) fn new(value: Value) -> Self {
        Self { value, magic: None }
    }

    pub(crate) fn magic_mut(&mut self) -> &mut Magic {
        self.magic.get_or_insert_with(Box::default)
    }

    pub(crate) fn is_readonly(&self) -> bool {
        self.magic.as_ref().is_some_and(|m| m.readonly)
    }

    pub(crate) fn tied(&self) -> Option<&Value> {
        self.magic.as_ref().and_then(|m| m.tie.as_ref())
    }
}

/// An array is a deque of element cells, so that references to elements and
/// `foreach` aliasing see through to the same storage.
#[derive(Debug, Default)]
pub(crate) struct ArrayCell {
    pub elems: VecDeque<HeapId>,
}

/// A hash preserves insertion order (so `each`/`keys` walk deterministically
/// and deletes do not reshuffle survivors) and carries the `each` cursor.
#[derive(Debug, Default)]
pub(crate) struct HashCell {
    pub map: IndexMap<RcStr, HeapId, ahash::RandomState>,
    /// Cursor for `each`; reset by `keys`/`values`.
    pub iter_pos: usize,
    /// Grow-only bucket estimate backing the `scalar(%h)` ratio diagnostic.
    pub buckets: usize,
}

/// A compiled subroutine plus its captured cells.
#[derive(Debug)]
pub(crate) struct CodeCell {
    pub code: Rc<Code>,
    /// Captured outer cells, in the order of `code.captures`.
    pub captures: Vec<HeapId>,
    pub package: RcStr,
    /// Fully qualified name; `None` for anonymous subs.
    pub name: Option<RcStr>,
    pub prototype: Option<RcStr>,
}

/// A symbol-table entry: one slot per thing a name can mean.
#[derive(Debug)]
pub(crate) struct GlobCell {
    /// Fully qualified name, e.g. `main::foo`.
    pub name: RcStr,
    pub scalar: Option<HeapId>,
    pub array: Option<HeapId>,
    pub hash: Option<HeapId>,
    pub code: Option<HeapId>,
    pub io: Option<IoId>,
    pub format: Option<Rc<FormatDef>>,
}

impl GlobCell {
    pub(crate) fn new(name: RcStr) -> Self {
        Self { name, scalar: None, array: None, hash: None, code: None, io: None, format: None }
    }
}

#[derive(Debug)]
pub(crate) enum Cell {
    Scalar(ScalarCell),
    Array(ArrayCell),
    Hash(HashCell),
    Code(CodeCell),
    Glob(GlobCell),
    /// Target of a weak reference after explicit teardown.
    Freed,
}

impl Cell {
    /// The `ref()` answer for a reference to this cell.
    pub(crate) fn ref_kind(&self) -> &'static str {
        match self {
            Self::Scalar(c) => {
                if matches!(c.value, Value::Ref { .. }) {
                    "REF"
                } else {
                    "SCALAR"
                }
            }
            Self::Array(_) => "ARRAY",
            Self::Hash(_) => "HASH",
            Self::Code(_) => "CODE",
            Self::Glob(_) => "GLOB",
            Self::Freed => "SCALAR",
        }
    }
}

/// The arena. Generic over the resource tracker so that the no-limit
/// configuration compiles the checks away.
#[derive(Debug)]
pub(crate) struct Heap<T: ResourceTracker = NoLimitTracker> {
    cells: Vec<Cell>,
    blessed: AHashMap<u32, RcStr>,
    pub tracker: T,
}

/// Rough per-cell byte estimate for the allocation tracker.
const CELL_SIZE_ESTIMATE: usize = 64;

impl<T: ResourceTracker> Heap<T> {
    pub(crate) fn new(tracker: T) -> Self {
        Self { cells: Vec::with_capacity(64), blessed: AHashMap::new(), tracker }
    }

    pub(crate) fn alloc(&mut self, cell: Cell) -> RunResult<HeapId> {
        self.tracker.on_allocate(|| CELL_SIZE_ESTIMATE)?;
        let id = u32::try_from(self.cells.len()).map_err(|_| {
            RunError::Resource(crate::resource::ResourceError::Allocation { limit: u32::MAX as usize, count: self.cells.len() })
        })?;
        self.cells.push(cell);
        Ok(HeapId(id))
    }

    pub(crate) fn new_scalar(&mut self, value: Value) -> RunResult<HeapId> {
        self.alloc(Cell::Scalar(ScalarCell::new(value)))
    }

    pub(crate) fn new_array(&mut self) -> RunResult<HeapId> {
        self.alloc(Cell::Array(ArrayCell::default()))
    }

    pub(crate) fn new_hash(&mut self) -> RunResult<HeapId> {
        self.alloc(Cell::Hash(HashCell::default()))
    }

    /// Builds an array cell from a flattened list of values.
    pub(crate) fn new_array_from(&mut self, values: Vec<Value>) -> RunResult<HeapId> {
        self.tracker.check_large_result(values.len() * CELL_SIZE_ESTIMATE)?;
        let mut elems = VecDeque::with_capacity(values.len());
        for v in values {
            elems.push_back(self.new_scalar(v)?);
        }
        self.alloc(Cell::Array(ArrayCell { elems }))
    }

    /// Builds a hash cell from a flattened key/value list. Later duplicate
    /// keys overwrite earlier ones. An odd trailing key gets undef.
    pub(crate) fn new_hash_from(&mut self, values: Vec<Value>) -> RunResult<(HeapId, bool)> {
        let odd = values.len() % 2 != 0;
        let id = self.new_hash()?;
        let mut iter = values.into_iter();
        while let Some(k) = iter.next() {
            let key = k.stringify(self);
            let v = iter.next().unwrap_or(Value::Undef);
            let vcell = self.new_scalar(v)?;
            self.hash_insert_cell(id, key, vcell);
        }
        Ok((id, odd))
    }

    pub(crate) fn get(&self, id: HeapId) -> &Cell {
        &self.cells[id.0 as usize]
    }

    pub(crate) fn get_mut(&mut self, id: HeapId) -> &mut Cell {
        &mut self.cells[id.0 as usize]
    }

    pub(crate) fn scalar(&self, id: HeapId) -> &ScalarCell {
        match self.get(id) {
            Cell::Scalar(c) => c,
            other => panic!("expected scalar cell, found {}", other.ref_kind()),
        }
    }

    pub(crate) fn scalar_mut(&mut self, id: HeapId) -> &mut ScalarCell {
        match self.get_mut(id) {
            Cell::Scalar(c) => c,
            other => panic!("expected scalar cell, found {}", other.ref_kind()),
        }
    }

    pub(crate) fn array(&self, id: HeapId) -> &ArrayCell {
        match self.get(id) {
            Cell::Array(c) => c,
            other => panic!("expected array cell, found {}", other.ref_kind()),
        }
    }

    pub(crate) fn array_mut(&mut self, id: HeapId) -> &mut ArrayCell {
        match self.get_mut(id) {
            Cell::Array(c) => c,
            other => panic!("expected array cell, found {}", other.ref_kind()),
        }
    }

    pub(crate) fn hash(&self, id: HeapId) -> &HashCell {
        match self.get(id) {
            Cell::Hash(c) => c,
            other => panic!("expected hash cell, found {}", other.ref_kind()),
        }
    }

    pub(crate) fn hash_mut(&mut self, id: HeapId) -> &mut HashCell {
        match self.get_mut(id) {
            Cell::Hash(c) => c,
            other => panic!("expected hash cell, found {}", other.ref_kind()),
        }
    }

    pub(crate) fn code(&self, id: HeapId) -> &CodeCell {
        match self.get(id) {
            Cell::Code(c) => c,
            other => panic!("expected code cell, found {}", other.ref_kind()),
        }
    }

    pub(crate) fn glob(&self, id: HeapId) -> &GlobCell {
        match self.get(id) {
            Cell::Glob(c) => c,
            other => panic!("expected glob cell, found {}", other.ref_kind()),
        }
    }

    pub(crate) fn glob_mut(&mut self, id: HeapId) -> &mut GlobCell {
        match self.get_mut(id) {
            Cell::Glob(c) => c,
            other => panic!("expected glob cell, found {}", other.ref_kind()),
        }
    }

    // ---- blessing ----

    pub(crate) fn bless(&mut self, id: HeapId, package: RcStr) {
        self.blessed.insert(id.0, package);
    }

    pub(crate) fn blessed(&self, id: HeapId) -> Option<&RcStr> {
        self.blessed.get(&id.0)
    }

    /// Display form of a reference value: `ARRAY(0x...)`, `Pkg=HASH(0x...)`.
    pub(crate) fn ref_display(&self, id: HeapId) -> String {
        let kind = self.get(id).ref_kind();
        let addr = ref_address_hex(id);
        match self.blessed(id) {
            Some(pkg) => format!("{pkg}={kind}(0x{addr})"),
            None => format!("{kind}(0x{addr})"),
        }
    }

    pub(crate) fn glob_display(&self, id: HeapId) -> String {
        format!("*{}", self.glob(id).name)
    }

    /// The `ref()` answer for a reference to `id`: the blessing package when
    /// blessed, else the cell kind.
    pub(crate) fn ref_name(&self, id: HeapId) -> RcStr {
        match self.blessed(id) {
            Some(pkg) => Rc::clone(pkg),
            None => Rc::from(self.get(id).ref_kind()),
        }
    }

    // ---- array access ----

    /// Maps a possibly negative Perl index onto the deque. `None` when a
    /// negative index reaches before the start.
    pub(crate) fn resolve_index(len: usize, index: i64) -> Option<usize> {
        if index >= 0 {
            Some(index as usize)
        } else {
            let back = index.unsigned_abs() as usize;
            len.checked_sub(back)
        }
    }

    /// Rvalue element read; missing elements read as no cell.
    pub(crate) fn array_get(&self, id: HeapId, index: i64) -> Option<HeapId> {
        let arr = self.array(id);
        let idx = Self::resolve_index(arr.elems.len(), index)?;
        arr.elems.get(idx).copied()
    }

    /// Lvalue element access: extends the array with undef cells as needed
    /// (autovivification of the element slot).
    pub(crate) fn array_elem_lv(&mut self, id: HeapId, index: i64) -> RunResult<HeapId> {
        let len = self.array(id).elems.len();
        let Some(idx) = Self::resolve_index(len, index) else {
            return Err(RunError::Die(Value::str(format!(
                "Modification of non-creatable array value attempted, subscript {index}"
            ))));
        };
        while self.array(id).elems.len() <= idx {
            self.tracker.on_container_insert()?;
            let cell = self.new_scalar(Value::Undef)?;
            self.array_mut(id).elems.push_back(cell);
        }
        Ok(self.array(id).elems[idx])
    }

    pub(crate) fn array_push(&mut self, id: HeapId, value: Value) -> RunResult<()> {
        self.tracker.on_container_insert()?;
        let cell = self.new_scalar(value)?;
        self.array_mut(id).elems.push_back(cell);
        Ok(())
    }

    pub(crate) fn array_unshift(&mut self, id: HeapId, value: Value) -> RunResult<()> {
        self.tracker.on_container_insert()?;
        let cell = self.new_scalar(value)?;
        self.array_mut(id).elems.push_front(cell);
        Ok(())
    }

    pub(crate) fn array_pop(&mut self, id: HeapId) -> Option<HeapId> {
        self.array_mut(id).elems.pop_back()
    }

    pub(crate) fn array_shift(&mut self, id: HeapId) -> Option<HeapId> {
        self.array_mut(id).elems.pop_front()
    }

    /// `$#a = n` — truncates or extends with undef cells.
    pub(crate) fn array_set_last_index(&mut self, id: HeapId, last: i64) -> RunResult<()> {
        if last < 0 {
            self.array_mut(id).elems.clear();
            return Ok(());
        }
        let want = last as usize + 1;
        while self.array(id).elems.len() < want {
            self.tracker.on_container_insert()?;
            let cell = self.new_scalar(Value::Undef)?;
            self.array_mut(id).elems.push_back(cell);
        }
        self.array_mut(id).elems.truncate(want);
        Ok(())
    }

    /// Flattens the array's current values.
    pub(crate) fn array_values(&self, id: HeapId) -> Vec<Value> {
        self.array(id).elems.iter().map(|&e| self.scalar(e).value.clone()).collect()
    }

    /// Replaces the array's contents with the given values.
    pub(crate) fn array_replace(&mut self, id: HeapId, values: Vec<Value>) -> RunResult<()> {
        self.array_mut(id).elems.clear();
        for v in values {
            self.array_push(id, v)?;
        }
        Ok(())
    }

    // ---- hash access ----

    fn hash_insert_cell(&mut self, id: HeapId, key: RcStr, cell: HeapId) {
        let hash = self.hash_mut(id);
        hash.map.insert(key, cell);
        if hash.map.len() > hash.buckets {
            // Bucket estimate may grow on resize but never shrinks.
            hash.buckets = hash.map.len().next_power_of_two().max(8);
        }
    }

    pub(crate) fn hash_get(&self, id: HeapId, key: &str) -> Option<HeapId> {
        self.hash(id).map.get(key).copied()
    }

    /// Lvalue element access: inserts an undef cell when the key is missing.
    pub(crate) fn hash_elem_lv(&mut self, id: HeapId, key: &str) -> RunResult<HeapId> {
        if let Some(cell) = self.hash_get(id, key) {
            return Ok(cell);
        }
        self.tracker.on_container_insert()?;
        let cell = self.new_scalar(Value::Undef)?;
        self.hash_insert_cell(id, Rc::from(key), cell);
        Ok(cell)
    }

    /// Deletes a key, keeping the survivors' order and clamping the `each`
    /// cursor so iteration neither skips nor repeats.
    pub(crate) fn hash_delete(&mut self, id: HeapId, key: &str) -> Option<HeapId> {
        let hash = self.hash_mut(id);
        let (index, _, cell) = hash.map.shift_remove_full(key)?;
        if index < hash.iter_pos {
            hash.iter_pos -= 1;
        }
        Some(cell)
    }

    pub(crate) fn hash_exists(&self, id: HeapId, key: &str) -> bool {
        self.hash(id).map.contains_key(key)
    }

    /// One `each` step; `None` when the iterator is exhausted (and resets).
    pub(crate) fn hash_each(&mut self, id: HeapId) -> Option<(RcStr, HeapId)> {
        let hash = self.hash_mut(id);
        match hash.map.get_index(hash.iter_pos) {
            Some((k, v)) => {
                hash.iter_pos += 1;
                Some((Rc::clone(k), *v))
            }
            None => {
                hash.iter_pos = 0;
                None
            }
        }
    }

    /// `keys` resets the `each` cursor as a side effect.
    pub(crate) fn hash_keys(&mut self, id: HeapId) -> Vec<RcStr> {
        let hash = self.hash_mut(id);
        hash.iter_pos = 0;
        hash.map.keys().map(Rc::clone).collect()
    }

    pub(crate) fn hash_values(&mut self, id: HeapId) -> Vec<HeapId> {
        let hash = self.hash_mut(id);
        hash.iter_pos = 0;
        hash.map.values().copied().collect()
    }

    /// Replaces the hash's contents from a flattened key/value list.
    /// Returns true when the list had an odd element count.
    pub(crate) fn hash_replace(&mut self, id: HeapId, values: Vec<Value>) -> RunResult<bool> {
        let odd = values.len() % 2 != 0;
        {
            let hash = self.hash_mut(id);
            hash.map.clear();
            hash.iter_pos = 0;
        }
        let mut iter = values.into_iter();
        while let Some(k) = iter.next() {
            self.tracker.on_container_insert()?;
            let key = k.stringify(self);
            let v = iter.next().unwrap_or(Value::Undef);
            let vcell = self.new_scalar(v)?;
            self.hash_insert_cell(id, key, vcell);
        }
        Ok(odd)
    }

    // ---- scalar helpers ----

    /// Reads a scalar cell's value; a freed target (weak-ref semantics)
    /// reads as undef.
    pub(crate) fn scalar_value(&self, id: HeapId) -> Value {
        match self.get(id) {
            Cell::Scalar(c) => c.value.clone(),
            Cell::Freed => Value::Undef,
            other => panic!("expected scalar cell, found {}", other.ref_kind()),
        }
    }

    /// Writes a scalar cell in place, honouring the read-only flag.
    pub(crate) fn scalar_set(&mut self, id: HeapId, value: Value) -> RunResult<()> {
        let cell = self.scalar_mut(id);
        if cell.is_readonly() {
            return Err(RunError::Die(Value::str("Modification of a read-only value attempted")));
        }
        cell.value = value;
        Ok(())
    }

    // ---- dereference helpers ----

    /// Dereferences to a cell of the expected kind, autovivifying through an
    /// undef scalar lvalue (`$x->{k}` when `$x` is undef creates the hash).
    pub(crate) fn deref_or_vivify(&mut self, holder: HeapId, want: VivifyKind) -> RunResult<HeapId> {
        let value = self.scalar(holder).value.clone();
        match value {
            Value::Ref { id, .. } => {
                let ok = matches!(
                    (self.get(id), want),
                    (Cell::Array(_), VivifyKind::Array) | (Cell::Hash(_), VivifyKind::Hash) | (Cell::Scalar(_), VivifyKind::Scalar)
                );
                if ok {
                    Ok(id)
                } else {
                    Err(RunError::Die(Value::str(format!("Not {} reference", want.article_name()))))
                }
            }
            Value::Undef => {
                let fresh = match want {
                    VivifyKind::Array => self.new_array()?,
                    VivifyKind::Hash => self.new_hash()?,
                    VivifyKind::Scalar => self.new_scalar(Value::Undef)?,
                };
                self.scalar_set(holder, Value::Ref { id: fresh, weak: false })?;
                Ok(fresh)
            }
            other => {
                let text = other.stringify(self);
                Err(RunError::Die(Value::str(format!(
                    "Can't use string (\"{text}\") as {} ref while \"strict refs\" in use",
                    want.article_name()
                ))))
            }
        }
    }

    /// Rvalue dereference: no autovivification, undef is an error.
    pub(crate) fn deref_expect(&self, value: &Value, want: VivifyKind) -> RunResult<HeapId> {
        match value {
            Value::Ref { id, .. } => {
                let ok = matches!(
                    (self.get(*id), want),
                    (Cell::Array(_), VivifyKind::Array) | (Cell::Hash(_), VivifyKind::Hash) | (Cell::Scalar(_), VivifyKind::Scalar)
                );
                if ok {
                    Ok(*id)
                } else {
                    Err(RunError::Die(Value::str(format!("Not {} reference", want.article_name()))))
                }
            }
            Value::Undef => Err(RunError::Die(Value::str(format!(
                "Can't use an undefined value as {} reference",
                want.article_name()
            )))),
            other => {
                let text = other.stringify(self);
                Err(RunError::Die(Value::str(format!(
                    "Can't use string (\"{text}\") as {} ref while \"strict refs\" in use",
                    want.article_name()
                ))))
            }
        }
    }

    /// Tears every cell down. Called by the context on drop, after END blocks.
    pub(crate) fn teardown(&mut self) {
        for cell in &mut self.cells {
            *cell = Cell::Freed;
        }
        self.blessed.clear();
    }
}

/// What an lvalue dereference expects to find or create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VivifyKind {
    Scalar,
    Array,
    Hash,
}

impl VivifyKind {
    fn article_name(self) -> &'static str {
        match self {
            Self::Scalar => "a SCALAR",
            Self::Array => "an ARRAY",
            Self::Hash => "a HASH",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> Heap<NoLimitTracker> {
        Heap::new(NoLimitTracker)
    }

    #[test]
    fn array_lvalue_access_extends() {
        let mut h = heap();
        let arr = h.new_array().unwrap();
        let cell = h.array_elem_lv(arr, 3).unwrap();
        h.scalar_set(cell, Value::Int(7)).unwrap();
        assert_eq!(h.array(arr).elems.len(), 4);
        assert!(h.scalar(h.array_get(arr, 0).unwrap()).value.is_undef());
        assert!(matches!(h.scalar(h.array_get(arr, 3).unwrap()).value, Value::Int(7)));
        assert!(matches!(h.scalar(h.array_get(arr, -1).unwrap()).value, Value::Int(7)));
    }

    #[test]
    fn rvalue_read_does_not_extend() {
        let mut h = heap();
        let arr = h.new_array().unwrap();
        assert!(h.array_get(arr, 5).is_none());
        assert_eq!(h.array(arr).elems.len(), 0);
    }

    #[test]
    fn hash_each_survives_delete() {
        let mut h = heap();
        let hash = h.new_hash().unwrap();
        for k in ["a", "b", "c", "d"] {
            let cell = h.hash_elem_lv(hash, k).unwrap();
            h.scalar_set(cell, Value::str(k)).unwrap();
        }
        let (k1, _) = h.hash_each(hash).unwrap();
        assert_eq!(&*k1, "a");
        h.hash_delete(hash, "a");
        let (k2, _) = h.hash_each(hash).unwrap();
        assert_eq!(&*k2, "b");
        h.hash_delete(hash, "d");
        let (k3, _) = h.hash_each(hash).unwrap();
        assert_eq!(&*k3, "c");
        assert!(h.hash_each(hash).is_none());
    }

    #[test]
    fn hash_buckets_never_shrink() {
        let mut h = heap();
        let hash = h.new_hash().unwrap();
        for i in 0..100 {
            h.hash_elem_lv(hash, &i.to_string()).unwrap();
        }
        let grown = h.hash(hash).buckets;
        for i in 0..100 {
            h.hash_delete(hash, &i.to_string());
        }
        assert_eq!(h.hash(hash).buckets, grown);
        assert!(h.hash(hash).map.is_empty());
    }

    #[test]
    fn vivify_through_undef_scalar() {
        let mut h = heap();
        let holder = h.new_scalar(Value::Undef).unwrap();
        let hash = h.deref_or_vivify(holder, VivifyKind::Hash).unwrap();
        assert!(matches!(h.get(hash), Cell::Hash(_)));
        assert!(matches!(h.scalar(holder).value, Value::Ref { .. }));
        // Second access resolves to the same hash.
        assert_eq!(h.deref_or_vivify(holder, VivifyKind::Hash).unwrap(), hash);
    }

    #[test]
    fn readonly_scalars_refuse_assignment() {
        let mut h = heap();
        let cell = h.new_scalar(Value::Int(1)).unwrap();
        h.scalar_mut(cell).magic_mut().readonly = true;
        let err = h.scalar_set(cell, Value::Int(2)).unwrap_err();
        match err {
            RunError::Die(v) => {
                assert!(v.stringify(&h).contains("Modification of a read-only value attempted"));
            }
            other => panic!("expected die, got {other:?}"),
        }
    }

    #[test]
    fn blessed_refs_display_package() {
        let mut h = heap();
        let arr = h.new_array().unwrap();
        assert!(h.ref_display(arr).starts_with("ARRAY(0x"));
        h.bless(arr, Rc::from("Dog"));
        assert!(h.ref_display(arr).starts_with("Dog=ARRAY(0x"));
        assert_eq!(&*h.ref_name(arr), "Dog");
    }
}
