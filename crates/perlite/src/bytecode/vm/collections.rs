//! List, array, hash, and iterator handlers (700–899).
//!
//! List assignment follows the begin/target/end protocol: the source list is
//! staged, scalar/array/hash targets consume from it in order, and the end
//! op produces the context-shaped result — in scalar context the *source*
//! element count, which is what makes `scalar(%h = (1,2,1,3))` say 4.

use std::{cell::RefCell, rc::Rc};

use crate::{
    ast::Context,
    bytecode::op::{NONE_REG, Opcode, word_to_ctx},
    error::{RunError, RunResult},
    heap::Cell,
    interp::Interp,
    resource::ResourceTracker,
    tracer::VmTracer,
    value::{IterState, Number, Value, str_increment},
};

use super::{AssignState, Frame, call, resolve_ctx};

pub(crate) fn handle<T: ResourceTracker, Tr: VmTracer>(
    op: Opcode,
    frame: &mut Frame,
    pc: usize,
    interp: &mut Interp<T>,
    tracer: &mut Tr,
) -> RunResult<usize> {
    let code = Rc::clone(&frame.code);
    let w = |k: usize| code.words[pc + k];

    match op {
        // ---- list building ----
        Opcode::ListBegin => {
            frame.marks.push(frame.stack.len());
            Ok(pc)
        }
        Opcode::ListPush => {
            let v = frame.take(w(0));
            v.flatten_into(&mut frame.stack);
            Ok(pc + 1)
        }
        Opcode::ListEnd => {
            let mark = frame.marks.pop().unwrap_or(0);
            let items: Vec<Value> = frame.stack.drain(mark..).collect();
            frame.set(w(0), Value::list(items));
            Ok(pc + 1)
        }
        Opcode::ArrayNew => {
            let cell = interp.heap.new_array()?;
            frame.set(w(0), Value::Ref { id: cell, weak: false });
            Ok(pc + 1)
        }
        Opcode::HashNew => {
            let cell = interp.heap.new_hash()?;
            frame.set(w(0), Value::Ref { id: cell, weak: false });
            Ok(pc + 1)
        }
        Opcode::ArrayFromList => {
            let items = frame.list(w(1));
            let cell = interp.heap.new_array_from(items)?;
            frame.set(w(0), Value::Ref { id: cell, weak: false });
            Ok(pc + 2)
        }
        Opcode::HashFromList => {
            let items = frame.list(w(1));
            let (cell, odd) = interp.heap.new_hash_from(items)?;
            if odd {
                call::warn_category(
                    interp,
                    tracer,
                    frame,
                    pc,
                    crate::warnings::WarningCategory::Misc,
                    "Odd number of elements in anonymous hash",
                )?;
            }
            frame.set(w(0), Value::Ref { id: cell, weak: false });
            Ok(pc + 2)
        }

        // ---- element access ----
        Opcode::ArrayElem => {
            let (dst, arr_r, idx_r) = (w(0), w(1), w(2));
            let arr = frame.ref_cell(arr_r)?;
            let idx = frame.scalar(idx_r).numify().0.as_f64() as i64;
            let v = match interp.heap.array_get(arr, idx) {
                Some(cell) => call::scalar_fetch(interp, tracer, cell)?,
                None => Value::Undef,
            };
            frame.set(dst, v);
            Ok(pc + 3)
        }
        Opcode::ArrayElemLv => {
            let (dst, arr_r, idx_r) = (w(0), w(1), w(2));
            let arr = frame.ref_cell(arr_r)?;
            let idx = frame.scalar(idx_r).numify().0.as_f64() as i64;
            let cell = interp.heap.array_elem_lv(arr, idx)?;
            frame.set(dst, Value::Ref { id: cell, weak: false });
            Ok(pc + 3)
        }
        Opcode::HashElem => {
            let (dst, hash_r, key_r) = (w(0), w(1), w(2));
            let hash = frame.ref_cell(hash_r)?;
            let key = frame.scalar(key_r).stringify(&interp.heap);
            let v = match interp.heap.hash_get(hash, &key) {
                Some(cell) => call::scalar_fetch(interp, tracer, cell)?,
                None => Value::Undef,
            };
            frame.set(dst, v);
            Ok(pc + 3)
        }
        Opcode::HashElemLv => {
            let (dst, hash_r, key_r) = (w(0), w(1), w(2));
            let hash = frame.ref_cell(hash_r)?;
            let key = frame.scalar(key_r).stringify(&interp.heap);
            let cell = interp.heap.hash_elem_lv(hash, &key)?;
            frame.set(dst, Value::Ref { id: cell, weak: false });
            Ok(pc + 3)
        }

        // ---- array shape ----
        Opcode::ArrayLen => {
            let arr = frame.ref_cell(w(1))?;
            let len = interp.heap.array(arr).elems.len() as i64;
            frame.set(w(0), Value::Int(len - 1));
            Ok(pc + 2)
        }
        Opcode::ArraySetLen => {
            let arr = frame.ref_cell(w(0))?;
            let last = frame.scalar(w(1)).numify().0.as_f64() as i64;
            interp.heap.array_set_last_index(arr, last)?;
            Ok(pc + 2)
        }
        Opcode::ArrayCount => {
            let arr = frame.ref_cell(w(1))?;
            let len = interp.heap.array(arr).elems.len() as i64;
            frame.set(w(0), Value::Int(len));
            Ok(pc + 2)
        }
        Opcode::ArrayList => {
            let arr = frame.ref_cell(w(1))?;
            frame.set(w(0), Value::list(interp.heap.array_values(arr)));
            Ok(pc + 2)
        }
        Opcode::HashList => {
            let hash = frame.ref_cell(w(1))?;
            let mut out = Vec::new();
            let pairs: Vec<(crate::value::RcStr, crate::heap::HeapId)> = {
                let h = interp.heap.hash(hash);
                h.map.iter().map(|(k, v)| (Rc::clone(k), *v)).collect()
            };
            for (k, cell) in pairs {
                out.push(Value::Str(k));
                out.push(interp.heap.scalar_value(cell));
            }
            frame.set(w(0), Value::list(out));
            Ok(pc + 2)
        }
        Opcode::HashCount => {
            let hash = frame.ref_cell(w(1))?;
            let n = interp.heap.hash(hash).map.len() as i64;
            frame.set(w(0), Value::Int(n));
            Ok(pc + 2)
        }

        // ---- push/pop family ----
        Opcode::Push | Opcode::Unshift => {
            let (dst, arr_r, list_r) = (w(0), w(1), w(2));
            let arr = frame.ref_cell(arr_r)?;
            let items = frame.list(list_r);
            if op == Opcode::Push {
                for v in items {
                    interp.heap.array_push(arr, v)?;
                }
            } else {
                for v in items.into_iter().rev() {
                    interp.heap.array_unshift(arr, v)?;
                }
            }
            let len = interp.heap.array(arr).elems.len() as i64;
            frame.set(dst, Value::Int(len));
            Ok(pc + 3)
        }
        Opcode::Pop | Opcode::Shift => {
            let (dst, arr_r) = (w(0), w(1));
            let arr = frame.ref_cell(arr_r)?;
            let cell = if op == Opcode::Pop { interp.heap.array_pop(arr) } else { interp.heap.array_shift(arr) };
            let v = match cell {
                Some(cell) => interp.heap.scalar_value(cell),
                None => Value::Undef,
            };
            frame.set(dst, v);
            Ok(pc + 2)
        }
        Opcode::Splice => {
            let (dst, arr_r, off_r, len_r, list_r) = (w(0), w(1), w(2), w(3), w(4));
            let ctx = resolve_ctx(word_to_ctx(w(5)), frame);
            let arr = frame.ref_cell(arr_r)?;
            let len = interp.heap.array(arr).elems.len();
            let off = if off_r == NONE_REG { 0 } else { frame.scalar(off_r).numify().0.as_f64() as i64 };
            let start = if off < 0 {
                len.saturating_sub(off.unsigned_abs() as usize)
            } else {
                (off as usize).min(len)
            };
            let count = if len_r == NONE_REG {
                len - start
            } else {
                let c = frame.scalar(len_r).numify().0.as_f64() as i64;
                if c < 0 {
                    (len - start).saturating_sub(c.unsigned_abs() as usize)
                } else {
                    (c as usize).min(len - start)
                }
            };
            let replacement = frame.list(list_r);
            // Remove, then insert in place.
            let removed: Vec<Value> = {
                let removed_cells: Vec<crate::heap::HeapId> =
                    interp.heap.array_mut(arr).elems.drain(start..start + count).collect();
                removed_cells.iter().map(|&c| interp.heap.scalar_value(c)).collect()
            };
            let mut new_cells = Vec::with_capacity(replacement.len());
            for v in replacement {
                new_cells.push(interp.heap.new_scalar(v)?);
            }
            for (i, cell) in new_cells.into_iter().enumerate() {
                interp.heap.array_mut(arr).elems.insert(start + i, cell);
            }
            let out = match ctx {
                Context::Scalar => removed.last().cloned().unwrap_or(Value::Undef),
                _ => Value::list(removed),
            };
            frame.set(dst, out);
            Ok(pc + 6)
        }

        // ---- keys / values / each / exists / delete ----
        Opcode::Keys => {
            let (dst, cell_r) = (w(0), w(1));
            let ctx = resolve_ctx(word_to_ctx(w(2)), frame);
            let cell = frame.ref_cell(cell_r)?;
            let out = match interp.heap.get(cell) {
                Cell::Hash(_) => {
                    let keys = interp.heap.hash_keys(cell);
                    match ctx {
                        Context::Scalar => Value::Int(keys.len() as i64),
                        _ => Value::list(keys.into_iter().map(Value::Str).collect()),
                    }
                }
                Cell::Array(a) => {
                    let n = a.elems.len() as i64;
                    match ctx {
                        Context::Scalar => Value::Int(n),
                        _ => Value::list((0..n).map(Value::Int).collect()),
                    }
                }
                _ => Value::Undef,
            };
            frame.set(dst, out);
            Ok(pc + 3)
        }
        Opcode::Values => {
            let (dst, cell_r) = (w(0), w(1));
            let ctx = resolve_ctx(word_to_ctx(w(2)), frame);
            let cell = frame.ref_cell(cell_r)?;
            let out = match interp.heap.get(cell) {
                Cell::Hash(_) => {
                    let cells = interp.heap.hash_values(cell);
                    match ctx {
                        Context::Scalar => Value::Int(cells.len() as i64),
                        _ => Value::list(cells.iter().map(|&c| interp.heap.scalar_value(c)).collect()),
                    }
                }
                Cell::Array(_) => {
                    let values = interp.heap.array_values(cell);
                    match ctx {
                        Context::Scalar => Value::Int(values.len() as i64),
                        _ => Value::list(values),
                    }
                }
                _ => Value::Undef,
            };
            frame.set(dst, out);
            Ok(pc + 3)
        }
        Opcode::Each => {
            let (dst, hash_r) = (w(0), w(1));
            let hash = frame.ref_cell(hash_r)?;
            let out = match interp.heap.hash_each(hash) {
                Some((k, cell)) => {
                    let v = interp.heap.scalar_value(cell);
                    Value::list(vec![Value::Str(k), v])
                }
                None => Value::list(Vec::new()),
            };
            frame.set(dst, out);
            Ok(pc + 2)
        }
        Opcode::ExistsHash => {
            let (dst, hash_r, key_r) = (w(0), w(1), w(2));
            let hash = frame.ref_cell(hash_r)?;
            let key = frame.scalar(key_r).stringify(&interp.heap);
            frame.set(dst, super::compare::bool_value(interp.heap.hash_exists(hash, &key)));
            Ok(pc + 3)
        }
        Opcode::ExistsArray => {
            let (dst, arr_r, idx_r) = (w(0), w(1), w(2));
            let arr = frame.ref_cell(arr_r)?;
            let idx = frame.scalar(idx_r).numify().0.as_f64() as i64;
            frame.set(dst, super::compare::bool_value(interp.heap.array_get(arr, idx).is_some()));
            Ok(pc + 3)
        }
        Opcode::DeleteHash => {
            let (dst, hash_r, key_r) = (w(0), w(1), w(2));
            let hash = frame.ref_cell(hash_r)?;
            let key = frame.scalar(key_r).stringify(&interp.heap);
            let v = match interp.heap.hash_delete(hash, &key) {
                Some(cell) => interp.heap.scalar_value(cell),
                None => Value::Undef,
            };
            frame.set(dst, v);
            Ok(pc + 4)
        }
        Opcode::DeleteArray => {
            let (dst, arr_r, idx_r) = (w(0), w(1), w(2));
            let arr = frame.ref_cell(arr_r)?;
            let idx = frame.scalar(idx_r).numify().0.as_f64() as i64;
            let v = match interp.heap.array_get(arr, idx) {
                Some(cell) => {
                    let v = interp.heap.scalar_value(cell);
                    let _ = interp.heap.scalar_set(cell, Value::Undef);
                    v
                }
                None => Value::Undef,
            };
            frame.set(dst, v);
            Ok(pc + 3)
        }

        // ---- slices ----
        Opcode::SliceArray => {
            let (dst, arr_r, list_r) = (w(0), w(1), w(2));
            let ctx = resolve_ctx(word_to_ctx(w(3)), frame);
            let arr = frame.ref_cell(arr_r)?;
            let indices = frame.list(list_r);
            let mut out = Vec::with_capacity(indices.len());
            for idx in indices {
                let i = idx.numify().0.as_f64() as i64;
                out.push(match interp.heap.array_get(arr, i) {
                    Some(cell) => interp.heap.scalar_value(cell),
                    None => Value::Undef,
                });
            }
            let out = match ctx {
                Context::Scalar => out.last().cloned().unwrap_or(Value::Undef),
                _ => Value::list(out),
            };
            frame.set(dst, out);
            Ok(pc + 4)
        }
        Opcode::SliceHash => {
            let (dst, hash_r, list_r) = (w(0), w(1), w(2));
            let ctx = resolve_ctx(word_to_ctx(w(3)), frame);
            let hash = frame.ref_cell(hash_r)?;
            let keys = frame.list(list_r);
            let mut out = Vec::with_capacity(keys.len());
            for key in keys {
                let k = key.stringify(&interp.heap);
                out.push(match interp.heap.hash_get(hash, &k) {
                    Some(cell) => interp.heap.scalar_value(cell),
                    None => Value::Undef,
                });
            }
            let out = match ctx {
                Context::Scalar => out.last().cloned().unwrap_or(Value::Undef),
                _ => Value::list(out),
            };
            frame.set(dst, out);
            Ok(pc + 4)
        }
        Opcode::KvSlice => {
            let (dst, hash_r, list_r) = (w(0), w(1), w(2));
            let hash = frame.ref_cell(hash_r)?;
            let keys = frame.list(list_r);
            let mut out = Vec::new();
            for key in keys {
                let k = key.stringify(&interp.heap);
                if let Some(cell) = interp.heap.hash_get(hash, &k) {
                    out.push(Value::Str(k));
                    out.push(interp.heap.scalar_value(cell));
                }
            }
            frame.set(dst, Value::list(out));
            Ok(pc + 3)
        }

        // ---- list assignment ----
        Opcode::LassignBegin => {
            let src = frame.list(w(0));
            frame.assigns.push(AssignState { src, pos: 0 });
            Ok(pc + 1)
        }
        Opcode::LassignScalar => {
            let cell = frame.ref_cell(w(0))?;
            let v = {
                let state = frame.assigns.last_mut().ok_or_else(assign_state_lost)?;
                let v = state.src.get(state.pos).cloned().unwrap_or(Value::Undef);
                state.pos += 1;
                v
            };
            call::scalar_store(interp, tracer, cell, v)?;
            Ok(pc + 1)
        }
        Opcode::LassignArray => {
            let cell = frame.ref_cell(w(0))?;
            let rest = {
                let state = frame.assigns.last_mut().ok_or_else(assign_state_lost)?;
                let rest: Vec<Value> = state.src[state.pos.min(state.src.len())..].to_vec();
                state.pos = state.src.len();
                rest
            };
            interp.heap.array_replace(cell, rest)?;
            Ok(pc + 1)
        }
        Opcode::LassignHash => {
            let cell = frame.ref_cell(w(0))?;
            let rest = {
                let state = frame.assigns.last_mut().ok_or_else(assign_state_lost)?;
                let rest: Vec<Value> = state.src[state.pos.min(state.src.len())..].to_vec();
                state.pos = state.src.len();
                rest
            };
            let odd = interp.heap.hash_replace(cell, rest)?;
            if odd {
                call::warn_category(
                    interp,
                    tracer,
                    frame,
                    pc,
                    crate::warnings::WarningCategory::Misc,
                    "Odd number of elements in hash assignment",
                )?;
            }
            Ok(pc + 1)
        }
        Opcode::LassignSkip => {
            if let Some(state) = frame.assigns.last_mut() {
                state.pos += 1;
            }
            Ok(pc)
        }
        Opcode::LassignSliceArray => {
            let (arr_r, idx_r) = (w(0), w(1));
            let arr = frame.ref_cell(arr_r)?;
            let indices = frame.list(idx_r);
            for idx in indices {
                let i = idx.numify().0.as_f64() as i64;
                let v = {
                    let state = frame.assigns.last_mut().ok_or_else(assign_state_lost)?;
                    let v = state.src.get(state.pos).cloned().unwrap_or(Value::Undef);
                    state.pos += 1;
                    v
                };
                let cell = interp.heap.array_elem_lv(arr, i)?;
                call::scalar_store(interp, tracer, cell, v)?;
            }
            Ok(pc + 2)
        }
        Opcode::LassignSliceHash => {
            let (hash_r, keys_r) = (w(0), w(1));
            let hash = frame.ref_cell(hash_r)?;
            let keys = frame.list(keys_r);
            for key in keys {
                let k = key.stringify(&interp.heap);
                let v = {
                    let state = frame.assigns.last_mut().ok_or_else(assign_state_lost)?;
                    let v = state.src.get(state.pos).cloned().unwrap_or(Value::Undef);
                    state.pos += 1;
                    v
                };
                let cell = interp.heap.hash_elem_lv(hash, &k)?;
                call::scalar_store(interp, tracer, cell, v)?;
            }
            Ok(pc + 2)
        }
        Opcode::LassignEnd => {
            let (dst, ctx_w) = (w(0), w(1));
            let ctx = resolve_ctx(word_to_ctx(ctx_w), frame);
            let state = frame.assigns.pop().ok_or_else(assign_state_lost)?;
            // Scalar context: the number of source elements.
            let out = match ctx {
                Context::Scalar => Value::Int(state.src.len() as i64),
                _ => Value::list(state.src),
            };
            frame.set(dst, out);
            Ok(pc + 2)
        }

        // ---- iterators ----
        Opcode::IterList => {
            let (dst, src_r) = (w(0), w(1));
            let state = match frame.take(src_r) {
                // An array cell iterates its element cells (aliasing).
                Value::Ref { id, .. } if matches!(interp.heap.get(id), Cell::Array(_)) => {
                    IterState::Cells { cells: interp.heap.array(id).elems.iter().copied().collect(), pos: 0 }
                }
                Value::List(items) => IterState::Values { items, pos: 0 },
                other => IterState::Values { items: vec![other.scalarize()].into(), pos: 0 },
            };
            frame.set(dst, Value::Iter(Rc::new(RefCell::new(state))));
            Ok(pc + 2)
        }
        Opcode::IterRange => {
            let (dst, from_r, to_r) = (w(0), w(1), w(2));
            let from = frame.scalar(from_r);
            let to = frame.scalar(to_r);
            let state = range_iter(&from, &to, interp)?;
            frame.set(dst, Value::Iter(Rc::new(RefCell::new(state))));
            Ok(pc + 3)
        }
        Opcode::IterHasNext => {
            let (dst, iter_r) = (w(0), w(1));
            let has = match frame.reg(iter_r) {
                Value::Iter(state) => iter_has_next(&state.borrow()),
                _ => false,
            };
            frame.set(dst, super::compare::bool_value(has));
            Ok(pc + 2)
        }
        Opcode::IterNextAlias => {
            let (slot, iter_r) = (w(0), w(1));
            let next = iter_next(frame, iter_r, interp)?;
            match next {
                IterNext::Cell(cell) => frame.pad[slot as usize] = cell,
                IterNext::Value(v) => {
                    let cell = interp.heap.new_scalar(v)?;
                    frame.pad[slot as usize] = cell;
                }
                IterNext::Done => {}
            }
            Ok(pc + 2)
        }
        Opcode::IterNextGlobal => {
            let (name_idx, iter_r) = (w(0), w(1));
            let name = Rc::clone(&code.strings[name_idx as usize]);
            let next = iter_next(frame, iter_r, interp)?;
            let cell = match next {
                IterNext::Cell(cell) => cell,
                IterNext::Value(v) => interp.heap.new_scalar(v)?,
                IterNext::Done => return Ok(pc + 2),
            };
            let (pkg, short) = crate::stash::Stashes::split_name(&name, "main");
            let glob = interp.stashes.glob_id(&mut interp.heap, &pkg, short)?;
            interp.heap.glob_mut(glob).scalar = Some(cell);
            Ok(pc + 2)
        }
        Opcode::IterNext => {
            let (dst, iter_r) = (w(0), w(1));
            let next = iter_next(frame, iter_r, interp)?;
            let v = match next {
                IterNext::Cell(cell) => interp.heap.scalar_value(cell),
                IterNext::Value(v) => v,
                IterNext::Done => Value::Undef,
            };
            frame.set(dst, v);
            Ok(pc + 2)
        }
        Opcode::Range => {
            let (dst, from_r, to_r) = (w(0), w(1), w(2));
            let from = frame.scalar(from_r);
            let to = frame.scalar(to_r);
            let mut state = range_iter(&from, &to, interp)?;
            // Materialization is bounded up front: a range like
            // `1 .. 2147483648` is rejected, not attempted.
            if let IterState::NumRange { cur, end } = &state {
                let count = end.saturating_sub(*cur).saturating_add(1).max(0) as u64;
                let bytes = count.saturating_mul(16);
                interp.heap.tracker.check_large_result(usize::try_from(bytes).unwrap_or(usize::MAX))?;
                if count > (1 << 27) {
                    return Err(RunError::Resource(crate::resource::ResourceError::Memory {
                        limit: 1 << 31,
                        used: usize::try_from(bytes).unwrap_or(usize::MAX),
                    }));
                }
            }
            let mut out = Vec::new();
            while iter_has_next(&state) {
                match advance_iter(&mut state, interp)? {
                    IterNext::Value(v) => out.push(v),
                    IterNext::Cell(cell) => out.push(interp.heap.scalar_value(cell)),
                    IterNext::Done => break,
                }
            }
            frame.set(dst, Value::list(out));
            Ok(pc + 3)
        }

        // ---- sort / map / grep / reverse ----
        Opcode::Sort => {
            let (dst, cmp_r, list_r) = (w(0), w(1), w(2));
            let items = frame.list(list_r);
            let sorted = if cmp_r == NONE_REG {
                let mut keyed: Vec<(String, Value)> =
                    items.into_iter().map(|v| (v.stringify(&interp.heap).to_string(), v)).collect();
                keyed.sort_by(|a, b| a.0.cmp(&b.0));
                keyed.into_iter().map(|(_, v)| v).collect()
            } else {
                let cmp_cell = frame.ref_cell(cmp_r)?;
                sort_with_comparator(interp, tracer, cmp_cell, items)?
            };
            frame.set(dst, Value::list(sorted));
            Ok(pc + 3)
        }
        Opcode::Map => {
            let (dst, code_r, list_r) = (w(0), w(1), w(2));
            let body = frame.ref_cell(code_r)?;
            let items = frame.list(list_r);
            let underscore = interp.global_scalar_cell("main::_")?;
            let saved = interp.heap.scalar_value(underscore);
            let mut out = Vec::new();
            for item in items {
                interp.heap.scalar_set(underscore, item)?;
                let result = call::call_block_code(interp, tracer, body, Vec::new(), Context::List)?;
                result.flatten_into(&mut out);
            }
            interp.heap.scalar_set(underscore, saved)?;
            frame.set(dst, Value::list(out));
            Ok(pc + 3)
        }
        Opcode::Grep => {
            let (dst, code_r, list_r) = (w(0), w(1), w(2));
            let body = frame.ref_cell(code_r)?;
            let items = frame.list(list_r);
            let underscore = interp.global_scalar_cell("main::_")?;
            let saved = interp.heap.scalar_value(underscore);
            let mut out = Vec::new();
            for item in items {
                interp.heap.scalar_set(underscore, item.clone())?;
                let keep = call::call_block_code(interp, tracer, body, Vec::new(), Context::Scalar)?;
                if keep.truthy() {
                    out.push(item);
                }
            }
            interp.heap.scalar_set(underscore, saved)?;
            frame.set(dst, Value::list(out));
            Ok(pc + 3)
        }
        Opcode::Reverse => {
            let (dst, list_r) = (w(0), w(1));
            let ctx = resolve_ctx(word_to_ctx(w(2)), frame);
            let items = frame.list(list_r);
            let out = match ctx {
                Context::Scalar => {
                    // Scalar reverse: concatenate and reverse characters.
                    let joined: String = items.iter().map(|v| v.stringify(&interp.heap).to_string()).collect();
                    Value::str(joined.chars().rev().collect::<String>())
                }
                _ => Value::list(items.into_iter().rev().collect()),
            };
            frame.set(dst, out);
            Ok(pc + 3)
        }
        _ => Err(RunError::Die(Value::str(format!("Unhandled collection opcode {op:?}")))),
    }
}

fn assign_state_lost() -> RunError {
    RunError::Die(Value::str("panic: list assignment state lost"))
}

enum IterNext {
    Cell(crate::heap::HeapId),
    Value(Value),
    Done,
}

fn iter_has_next(state: &IterState) -> bool {
    match state {
        IterState::NumRange { cur, end } => cur <= end,
        IterState::StrRange { cur, .. } => cur.is_some(),
        IterState::Cells { cells, pos } => *pos < cells.len(),
        IterState::Values { items, pos } => *pos < items.len(),
    }
}

fn iter_next<T: ResourceTracker>(frame: &Frame, iter_r: u16, interp: &mut Interp<T>) -> RunResult<IterNext> {
    let Value::Iter(state) = frame.reg(iter_r) else {
        return Err(RunError::Die(Value::str("panic: foreach iterator lost")));
    };
    let state = Rc::clone(state);
    let mut state = state.borrow_mut();
    advance_iter(&mut state, interp)
}

fn advance_iter<T: ResourceTracker>(state: &mut IterState, interp: &mut Interp<T>) -> RunResult<IterNext> {
    let _ = interp;
    Ok(match state {
        IterState::NumRange { cur, end } => {
            if *cur > *end {
                IterNext::Done
            } else {
                let v = Value::Int(*cur);
                *cur += 1;
                IterNext::Value(v)
            }
        }
        IterState::StrRange { cur, end } => match cur.take() {
            None => IterNext::Done,
            Some(s) => {
                // Stop after the end value, or when the increment outgrows
                // the end's length (so 'a'..'\xFF' ends at 'z').
                if s != *end {
                    let next = str_increment(&s);
                    if next.chars().count() <= end.chars().count() {
                        *cur = Some(next);
                    }
                }
                IterNext::Value(Value::str(s))
            }
        },
        IterState::Cells { cells, pos } => {
            if *pos >= cells.len() {
                IterNext::Done
            } else {
                let cell = cells[*pos];
                *pos += 1;
                IterNext::Cell(cell)
            }
        }
        IterState::Values { items, pos } => {
            if *pos >= items.len() {
                IterNext::Done
            } else {
                let v = items[*pos].clone();
                *pos += 1;
                IterNext::Value(v)
            }
        }
    })
}

/// Builds a range iterator: numeric when both ends numify cleanly or the
/// start looks numeric, string-increment otherwise.
fn range_iter<T: ResourceTracker>(from: &Value, to: &Value, interp: &Interp<T>) -> RunResult<IterState> {
    let numeric = matches!(from, Value::Int(_) | Value::Num(_) | Value::Undef)
        || matches!(from, Value::Str(s) if crate::value::parse_number_prefix(s).1 == s.len() && !s.is_empty());
    if numeric {
        let (f, _) = from.numify();
        let (t, _) = to.numify();
        let cur = match f {
            Number::Int(i) => i,
            Number::Float(x) => x as i64,
        };
        let end = match t {
            Number::Int(i) => i,
            Number::Float(x) => x as i64,
        };
        Ok(IterState::NumRange { cur, end })
    } else {
        let start = from.stringify(&interp.heap).to_string();
        let end = to.stringify(&interp.heap).to_string();
        Ok(IterState::StrRange { cur: Some(start), end })
    }
}

/// `sort { ... }` with `$a`/`$b` as package globals.
fn sort_with_comparator<T: ResourceTracker, Tr: VmTracer>(
    interp: &mut Interp<T>,
    tracer: &mut Tr,
    cmp: crate::heap::HeapId,
    items: Vec<Value>,
) -> RunResult<Vec<Value>> {
    let a_cell = interp.global_scalar_cell("main::a")?;
    let b_cell = interp.global_scalar_cell("main::b")?;
    // A comparator that dies must unwind; sort_by can't carry errors, so
    // collect the verdicts through an insertion sort instead.
    let mut out: Vec<Value> = Vec::with_capacity(items.len());
    for item in items {
        let mut lo = 0usize;
        let mut hi = out.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            interp.heap.scalar_set(a_cell, item.clone())?;
            interp.heap.scalar_set(b_cell, out[mid].clone())?;
            let verdict = call::call_block_code(interp, tracer, cmp, Vec::new(), Context::Scalar)?;
            let n = verdict.numify().0.as_f64();
            if n < 0.0 {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        out.insert(lo, item);
    }
    Ok(out)
}
