//! Memory buffer descriptors and small IR helpers shared by the conversion.

use log::trace;

use crate::ir::{
    ConstAttr, ElemType, InsertPoint, Module, OpId, OpKind, Rewriter, ShapedType, Type, ValueDef,
    ValueId,
};

/// Rectangular region of a memref tiles are loaded from or stored to.
///
/// An empty buffer (`mem_ref == None`) means "nothing to load": tiles are
/// zero-initialized instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemBuffer {
    pub mem_ref: Option<ValueId>,
    /// Origin of the region, one index per memref dimension.
    pub indices: Vec<ValueId>,
    /// Per-dimension distance to the region the next loop iteration reads.
    /// Empty when unknown.
    pub step: Vec<i64>,
    /// The memory holds the row-interleaved layout of the value.
    pub packed: bool,
}

impl MemBuffer {
    pub fn new(mem_ref: ValueId, indices: Vec<ValueId>) -> Self {
        Self { mem_ref: Some(mem_ref), indices, step: Vec::new(), packed: false }
    }

    pub fn is_empty(&self) -> bool {
        self.mem_ref.is_none()
    }
}

pub fn has_mask_or_bounds_check(module: &Module, op: OpId) -> bool {
    matches!(module.op(op).kind, OpKind::Read { masked: true, .. } | OpKind::Write { masked: true })
}

/// Whether `value` is a zero splat, possibly behind casts.
pub fn is_zero_const(module: &Module, value: ValueId) -> bool {
    let mut cur = value;
    loop {
        if let Some(attr) = module.constant_of(cur) {
            return attr.is_zero();
        }
        match module.defining_op(cur).map(|op| module.op(op)) {
            Some(data) if data.kind == OpKind::Cast => cur = data.operands[0],
            _ => return false,
        }
    }
}

/// Memory `value` was read from, if tiles loaded at `at` still see the
/// value read.
///
/// Only unmasked 2-D reads qualify. Memory holding the packed layout is only
/// returned when the caller asked for an interleaved operand. Scratch memory
/// is never shared, and the memory must not be written between the read and
/// `at`.
pub fn find_input_buffer(
    module: &Module,
    value: ValueId,
    interleave: bool,
    at: InsertPoint,
) -> MemBuffer {
    let Some(read) = module.defining_op(value) else {
        return MemBuffer::default();
    };
    let data = module.op(read);
    let OpKind::Read { masked: false, packed } = data.kind else {
        return MemBuffer::default();
    };
    if packed && !interleave {
        return MemBuffer::default();
    }
    let mem_ref = data.operands[0];
    let mem_rank = module.value_type(mem_ref).as_memref().map_or(0, ShapedType::rank);
    let vec_rank = module.value_type(value).as_vector().map_or(0, ShapedType::rank);
    if mem_rank < 2 || vec_rank != 2 || is_scratch(module, mem_ref) {
        return MemBuffer::default();
    }
    if written_between(module, read, at, |mem| mem == mem_ref) {
        trace!("memory of %{} may be overwritten before the tile loads", value.0);
        return MemBuffer::default();
    }
    MemBuffer {
        mem_ref: Some(mem_ref),
        indices: data.operands[1..].to_vec(),
        step: prefetch_step(module, read),
        packed,
    }
}

fn is_scratch(module: &Module, mem_ref: ValueId) -> bool {
    module.defining_op(mem_ref).is_some_and(|op| module.op(op).kind == OpKind::Alloca)
}

/// Memref written by `op` itself.
fn written_memref(module: &Module, op: OpId) -> Option<ValueId> {
    let data = module.op(op);
    match data.kind {
        OpKind::Write { .. } | OpKind::TileStore => data.operands.get(1).copied(),
        _ => None,
    }
}

/// Ops strictly between `from` and `to`, if `to` follows `from` in its block.
fn ops_between(module: &Module, from: OpId, to: InsertPoint) -> Option<&[OpId]> {
    let block = module.op(from).parent?;
    let ops = &module.block(block).ops;
    let start = module.op_position(from)? + 1;
    let end = match to {
        InsertPoint::Before(op) if module.op(op).parent == Some(block) => module.op_position(op)?,
        InsertPoint::End(b) if b == block => ops.len(),
        _ => return None,
    };
    ops.get(start..end)
}

/// Whether memory selected by `hits` may be written after `from` and before
/// `to`, including by ops nested in loops in between. Memrefs are distinct
/// unless they are the same value. A `to` outside `from`'s block, or before
/// `from`, counts as written.
pub fn written_between(
    module: &Module,
    from: OpId,
    to: InsertPoint,
    hits: impl Fn(ValueId) -> bool,
) -> bool {
    let Some(window) = ops_between(module, from, to) else {
        return true;
    };
    let mut ops = Vec::new();
    for &op in window {
        ops.push(op);
        for &region in &module.op(op).regions {
            module.walk_block(region, &mut ops);
        }
    }
    ops.into_iter().any(|op| written_memref(module, op).is_some_and(&hits))
}

/// Distance, per memref dimension, between what `read` accesses in two
/// consecutive iterations of its enclosing loop.
///
/// Each index is decomposed as `stride * iv + invariant`; the step is the
/// stride times the constant loop step. Empty when the read is not directly
/// inside a loop, the loop step is not constant, any index cannot be
/// decomposed, or the access does not move at all.
pub fn prefetch_step(module: &Module, read: OpId) -> Vec<i64> {
    let Some(loop_op) = module.parent_op(read).filter(|&p| module.op(p).kind == OpKind::For) else {
        return Vec::new();
    };
    let Some(loop_step) = index_const(module, module.op(loop_op).operands[2]) else {
        return Vec::new();
    };

    let indices = &module.op(read).operands[1..];
    let strides: Option<Vec<i64>> =
        indices.iter().map(|&idx| linear_stride(module, idx, loop_op)).collect();
    match strides {
        Some(strides) if strides.iter().any(|&s| s != 0) => {
            strides.into_iter().map(|s| s * loop_step).collect()
        }
        _ => Vec::new(),
    }
}

/// Coefficient of `loop_op`'s induction variable in `value`, if `value` is
/// linear in it.
fn linear_stride(module: &Module, value: ValueId, loop_op: OpId) -> Option<i64> {
    let body = module.op(loop_op).regions[0];
    match module.value(value).def {
        ValueDef::BlockArg { block, index } if block == body => (index == 0).then_some(1),
        ValueDef::BlockArg { .. } => Some(0),
        ValueDef::OpResult { op, .. } => {
            if !module.is_proper_ancestor(loop_op, op) {
                return Some(0);
            }
            let data = module.op(op);
            match data.kind {
                OpKind::Constant(_) => Some(0),
                OpKind::AddI => Some(
                    linear_stride(module, data.operands[0], loop_op)?
                        + linear_stride(module, data.operands[1], loop_op)?,
                ),
                OpKind::MulI => {
                    let (lhs, rhs) = (data.operands[0], data.operands[1]);
                    match (index_const(module, lhs), index_const(module, rhs)) {
                        (Some(c), _) => Some(c * linear_stride(module, rhs, loop_op)?),
                        (_, Some(c)) => Some(c * linear_stride(module, lhs, loop_op)?),
                        _ => None,
                    }
                }
                _ => None,
            }
        }
    }
}

pub fn index_const(module: &Module, value: ValueId) -> Option<i64> {
    match module.constant_of(value)? {
        ConstAttr::Int(v) => Some(v),
        ConstAttr::Float(_) => None,
    }
}

/// The operation directly in the function body that contains `op`. Scratch
/// buffers are allocated in front of it so they dominate every use.
pub fn alloca_point(module: &Module, op: OpId) -> OpId {
    let mut cur = op;
    while let Some(parent) = module.parent_op(cur) {
        if matches!(module.op(parent).kind, OpKind::Func { .. }) {
            break;
        }
        cur = parent;
    }
    cur
}

/// Allocate scratch memory of shape `ty` in front of `alloca_point`.
pub fn allocate_tmp_buffer(
    rw: &mut Rewriter<'_>,
    ty: &ShapedType,
    alloca_point: OpId,
) -> MemBuffer {
    rw.guarded(|rw| {
        rw.restore_insertion_point(InsertPoint::Before(alloca_point));
        let mem_ref = rw.alloca(Type::MemRef(ty.clone()));
        let zero = rw.index_const(0);
        trace!("allocated scratch buffer memref<{}>", ty);
        MemBuffer::new(mem_ref, vec![zero; ty.rank()])
    })
}

/// `index + offset`, folded when `index` is a constant.
pub fn shift_index(rw: &mut Rewriter<'_>, index: ValueId, offset: i64) -> ValueId {
    if offset == 0 {
        return index;
    }
    match index_const(rw.module(), index) {
        Some(base) => rw.index_const(base + offset),
        None => {
            let offset = rw.index_const(offset);
            rw.addi(index, offset)
        }
    }
}

/// Cast `value` to element type `elem` unless it already has it.
pub fn maybe_cast(rw: &mut Rewriter<'_>, value: ValueId, elem: ElemType) -> ValueId {
    if rw.module().value_type(value).elem() == Some(elem) {
        return value;
    }
    rw.cast(value, elem)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn before_return(module: &Module) -> InsertPoint {
        let ret =
            module.walk().into_iter().find(|&op| module.op(op).kind == OpKind::Return).unwrap();
        InsertPoint::Before(ret)
    }

    fn find_read(module: &Module) -> (OpId, ValueId) {
        let read = module
            .walk()
            .into_iter()
            .find(|&op| matches!(module.op(op).kind, OpKind::Read { .. }))
            .unwrap();
        (read, module.op(read).results[0])
    }

    #[test]
    fn test_find_input_buffer_reuses_plain_read() {
        let module = Module::parse(
            r#"
func @f(%m: memref<32x32xbf16>) {
  %c0 = const 0 : index
  %v = read %m[%c0, %c0] : vector<32x32xbf16>
  return
}
"#,
        )
        .unwrap();
        let (_, value) = find_read(&module);
        let buf = find_input_buffer(&module, value, false, before_return(&module));
        assert!(!buf.is_empty());
        assert_eq!(buf.indices.len(), 2);
        assert!(buf.step.is_empty());
        assert!(!buf.packed);
    }

    #[test]
    fn test_find_input_buffer_rejects_masked_and_packed() {
        let module = Module::parse(
            r#"
func @f(%m: memref<32x32xbf16>) {
  %c0 = const 0 : index
  %a = read %m[%c0, %c0] {masked} : vector<32x32xbf16>
  %b = read %m[%c0, %c0] {packed} : vector<32x32xbf16>
  return
}
"#,
        )
        .unwrap();
        let reads: Vec<_> = module
            .walk()
            .into_iter()
            .filter(|&op| matches!(module.op(op).kind, OpKind::Read { .. }))
            .map(|op| module.op(op).results[0])
            .collect();
        assert!(find_input_buffer(&module, reads[0], false, before_return(&module)).is_empty());
        assert!(find_input_buffer(&module, reads[1], false, before_return(&module)).is_empty());
        assert!(find_input_buffer(&module, reads[1], true, before_return(&module)).packed);
    }

    #[test]
    fn test_prefetch_step_from_loop() {
        let module = Module::parse(
            r#"
func @f(%m: memref<16x256xbf16>) {
  %c0 = const 0 : index
  %c32 = const 32 : index
  %c256 = const 256 : index
  %c2 = const 2 : index
  for %iv = %c0 to %c256 step %c32 {
    %col = muli %iv, %c2 : index
    %off = addi %col, %c0 : index
    %v = read %m[%c0, %iv] : vector<16x32xbf16>
    %w = read %m[%c0, %off] : vector<16x32xbf16>
    yield
  }
  return
}
"#,
        )
        .unwrap();
        let reads: Vec<_> = module
            .walk()
            .into_iter()
            .filter(|&op| matches!(module.op(op).kind, OpKind::Read { .. }))
            .collect();
        assert_eq!(prefetch_step(&module, reads[0]), vec![0, 32]);
        assert_eq!(prefetch_step(&module, reads[1]), vec![0, 64]);
    }

    #[test]
    fn test_is_zero_const_looks_through_casts() {
        let module = Module::parse(
            r#"
func @f() {
  %z = const 0.0 : vector<16x16xbf16>
  %c = cast %z : vector<16x16xf32>
  %o = const 1.0 : vector<16x16xf32>
  return
}
"#,
        )
        .unwrap();
        let values: Vec<_> =
            module.walk().into_iter().flat_map(|op| module.op(op).results.clone()).collect();
        assert!(is_zero_const(&module, values[0]));
        assert!(is_zero_const(&module, values[1]));
        assert!(!is_zero_const(&module, values[2]));
    }

    #[test]
    fn test_alloca_point_and_shift_index() {
        let mut module = Module::parse(
            r#"
func @f() {
  %c0 = const 0 : index
  %c4 = const 4 : index
  %c1 = const 1 : index
  for %iv = %c0 to %c4 step %c1 {
    %x = addi %iv, %c1 : index
    yield
  }
  return
}
"#,
        )
        .unwrap();
        let add = module.walk().into_iter().find(|&op| module.op(op).kind == OpKind::AddI).unwrap();
        let point = alloca_point(&module, add);
        assert_eq!(module.op(point).kind, OpKind::For);

        let iv = module.op(add).operands[0];
        let c4 = module.op(point).operands[1];
        let mut rw = Rewriter::before(&mut module, add);
        assert_eq!(shift_index(&mut rw, iv, 0), iv);
        let folded = shift_index(&mut rw, c4, 12);
        assert_eq!(index_const(rw.module(), folded), Some(16));
        let shifted = shift_index(&mut rw, iv, 16);
        assert_eq!(rw.module().op(rw.module().defining_op(shifted).unwrap()).kind, OpKind::AddI);
    }

    #[test]
    fn test_find_input_buffer_rejects_overwritten_memory() {
        let module = Module::parse(
            r#"
func @f(%m: memref<16x16xi8>, %n: memref<16x16xi8>, %o: memref<16x16xi8>) {
  %c0 = const 0 : index
  %c1 = const 1 : index
  %c2 = const 2 : index
  %s = alloca : memref<16x16xi8>
  %v = read %m[%c0, %c0] : vector<16x16xi8>
  %w = read %n[%c0, %c0] : vector<16x16xi8>
  %x = read %s[%c0, %c0] : vector<16x16xi8>
  write %w, %o[%c0, %c0]
  for %i = %c0 to %c2 step %c1 {
    write %v, %n[%c0, %c0]
    yield
  }
  return
}
"#,
        )
        .unwrap();
        let reads: Vec<_> = module
            .walk()
            .into_iter()
            .filter(|&op| matches!(module.op(op).kind, OpKind::Read { .. }))
            .map(|op| module.op(op).results[0])
            .collect();
        let at = before_return(&module);
        // %m is only read; the write to %o does not touch it.
        assert!(!find_input_buffer(&module, reads[0], false, at).is_empty());
        // %n is written inside the loop.
        assert!(find_input_buffer(&module, reads[1], false, at).is_empty());
        // Scratch memory is never shared.
        assert!(find_input_buffer(&module, reads[2], false, at).is_empty());

        // Tiles loaded right after the read see the value.
        let read_n = module.defining_op(reads[1]).unwrap();
        let block = module.op(read_n).parent.unwrap();
        let next = module.block(block).ops[module.op_position(read_n).unwrap() + 1];
        assert!(!find_input_buffer(&module, reads[1], false, InsertPoint::Before(next)).is_empty());
    }
}
