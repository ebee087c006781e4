//! IR mutation with a stable insertion point.
//!
//! [`Rewriter`] inserts newly created operations at its insertion point,
//! which is anchored either *before* an existing operation or at the *end* of
//! a block. Anchoring before an op keeps the point stable while further ops
//! are inserted, so a sequence of `create` calls lands in program order.

use super::{BlockId, ConstAttr, ElemType, Module, OpId, OpKind, Type, ValueId};
use crate::core::error::{IrError, IrResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPoint {
    Before(OpId),
    End(BlockId),
}

pub struct Rewriter<'m> {
    module: &'m mut Module,
    ip: InsertPoint,
    tile_ops: usize,
    /// First insertion that found its anchor detached.
    error: Option<IrError>,
}

impl<'m> Rewriter<'m> {
    pub fn new(module: &'m mut Module, ip: InsertPoint) -> Self {
        Self { module, ip, tile_ops: 0, error: None }
    }

    /// Rewriter inserting before `op`.
    pub fn before(module: &'m mut Module, op: OpId) -> Self {
        Self::new(module, InsertPoint::Before(op))
    }

    pub fn module(&self) -> &Module {
        self.module
    }

    pub fn module_mut(&mut self) -> &mut Module {
        self.module
    }

    /// Number of tile operations created so far.
    pub fn tile_ops_created(&self) -> usize {
        self.tile_ops
    }

    /// End the rewrite. Fails if any op could not be inserted because its
    /// anchor was no longer in a block; such ops are left detached.
    pub fn finish(self) -> IrResult<usize> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.tile_ops),
        }
    }

    // =========================================================================
    // Insertion point
    // =========================================================================

    pub fn insertion_point(&self) -> InsertPoint {
        self.ip
    }

    pub fn restore_insertion_point(&mut self, ip: InsertPoint) {
        self.ip = ip;
    }

    pub fn set_insertion_point(&mut self, op: OpId) {
        self.ip = InsertPoint::Before(op);
    }

    pub fn set_insertion_point_after(&mut self, op: OpId) {
        let Some(block) = self.module.op(op).parent else {
            return;
        };
        let ops = &self.module.block(block).ops;
        self.ip = match ops.iter().position(|&o| o == op).and_then(|p| ops.get(p + 1)) {
            Some(&next) => InsertPoint::Before(next),
            None => InsertPoint::End(block),
        };
    }

    /// Run `f` and restore the insertion point afterwards.
    pub fn guarded<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let saved = self.ip;
        let result = f(self);
        self.ip = saved;
        result
    }

    fn insert(&mut self, op: OpId) {
        match self.ip {
            InsertPoint::Before(anchor) => {
                let anchor_op = self.module.op(anchor);
                match (anchor_op.parent, self.module.op_position(anchor)) {
                    (Some(block), Some(pos)) => self.module.insert_op(op, block, pos),
                    _ => {
                        let op = anchor_op.kind.name();
                        self.error.get_or_insert(IrError::DetachedAnchor { op });
                    }
                }
            }
            InsertPoint::End(block) => self.module.append_op(op, block),
        }
    }

    // =========================================================================
    // Creation
    // =========================================================================

    pub fn create(
        &mut self,
        kind: OpKind,
        operands: Vec<ValueId>,
        result_types: Vec<Type>,
    ) -> OpId {
        if matches!(
            kind,
            OpKind::TileZero
                | OpKind::TileLoad
                | OpKind::TileStore
                | OpKind::TileMulF
                | OpKind::TileMulI
        ) {
            self.tile_ops += 1;
        }
        let op = self.module.create_op(kind, operands, result_types);
        self.insert(op);
        op
    }

    fn create_value(&mut self, kind: OpKind, operands: Vec<ValueId>, ty: Type) -> ValueId {
        let op = self.create(kind, operands, vec![ty]);
        self.module.op(op).results[0]
    }

    pub fn constant(&mut self, attr: ConstAttr, ty: Type) -> ValueId {
        self.create_value(OpKind::Constant(attr), Vec::new(), ty)
    }

    pub fn index_const(&mut self, value: i64) -> ValueId {
        self.constant(ConstAttr::Int(value), Type::Index)
    }

    pub fn addi(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.create_value(OpKind::AddI, vec![lhs, rhs], Type::Index)
    }

    pub fn muli(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.create_value(OpKind::MulI, vec![lhs, rhs], Type::Index)
    }

    /// Convert the element type of a vector.
    pub fn cast(&mut self, value: ValueId, elem: ElemType) -> ValueId {
        let ty = match self.module.value_type(value) {
            Type::Vector(v) => Type::Vector(v.with_elem(elem)),
            _ => Type::Scalar(elem),
        };
        self.create_value(OpKind::Cast, vec![value], ty)
    }

    pub fn alloca(&mut self, ty: Type) -> ValueId {
        self.create_value(OpKind::Alloca, Vec::new(), ty)
    }

    pub fn read(&mut self, ty: Type, mem: ValueId, indices: &[ValueId]) -> ValueId {
        let mut operands = vec![mem];
        operands.extend_from_slice(indices);
        self.create_value(OpKind::Read { masked: false, packed: false }, operands, ty)
    }

    pub fn write(&mut self, value: ValueId, mem: ValueId, indices: &[ValueId]) -> OpId {
        let mut operands = vec![value, mem];
        operands.extend_from_slice(indices);
        self.create(OpKind::Write { masked: false }, operands, Vec::new())
    }

    pub fn extract(&mut self, value: ValueId, pos: i64) -> ValueId {
        let ty = match self.module.value_type(value) {
            Type::Vector(v) => Type::vector(v.shape[1..].to_vec(), v.elem),
            other => other.clone(),
        };
        self.create_value(OpKind::Extract { pos }, vec![value], ty)
    }

    pub fn interleave(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        let ty = match self.module.value_type(lhs) {
            Type::Vector(v) => Type::vector([v.shape[0] * 2], v.elem),
            other => other.clone(),
        };
        self.create_value(OpKind::Interleave, vec![lhs, rhs], ty)
    }

    pub fn prefetch(&mut self, mem: ValueId, indices: &[ValueId]) -> OpId {
        let mut operands = vec![mem];
        operands.extend_from_slice(indices);
        self.create(OpKind::Prefetch, operands, Vec::new())
    }

    pub fn tile_zero(&mut self, ty: Type) -> ValueId {
        self.create_value(OpKind::TileZero, Vec::new(), ty)
    }

    pub fn tile_load(&mut self, ty: Type, mem: ValueId, indices: &[ValueId]) -> ValueId {
        let mut operands = vec![mem];
        operands.extend_from_slice(indices);
        self.create_value(OpKind::TileLoad, operands, ty)
    }

    pub fn tile_store(&mut self, tile: ValueId, mem: ValueId, indices: &[ValueId]) -> OpId {
        let mut operands = vec![tile, mem];
        operands.extend_from_slice(indices);
        self.create(OpKind::TileStore, operands, Vec::new())
    }

    /// `tile_mulf`/`tile_muli` accumulating `lhs x rhs` into `acc`.
    pub fn tile_mul(&mut self, kind: OpKind, lhs: ValueId, rhs: ValueId, acc: ValueId) -> ValueId {
        let ty = self.module.value_type(acc).clone();
        self.create_value(kind, vec![lhs, rhs, acc], ty)
    }

    /// Create a counted loop. The body starts with a `yield` forwarding the
    /// iteration arguments unchanged.
    pub fn create_for(
        &mut self,
        lower: ValueId,
        upper: ValueId,
        step: ValueId,
        inits: &[ValueId],
    ) -> OpId {
        let types: Vec<Type> = inits.iter().map(|&v| self.module.value_type(v).clone()).collect();
        let mut operands = vec![lower, upper, step];
        operands.extend_from_slice(inits);
        let op = self.create(OpKind::For, operands, types.clone());

        let body = self.module.add_block(Some(op));
        self.module.op_mut(op).regions.push(body);
        self.module.add_block_arg(body, Type::Index);
        let iter_args: Vec<ValueId> =
            types.into_iter().map(|ty| self.module.add_block_arg(body, ty)).collect();
        let yield_op = self.module.create_op(OpKind::Yield, iter_args, Vec::new());
        self.module.append_op(yield_op, body);
        op
    }

    // =========================================================================
    // Replacement and erasure
    // =========================================================================

    pub fn replace_all_uses_with(&mut self, from: ValueId, to: ValueId) {
        self.replace_uses_if(from, to, |_, _| true);
    }

    /// Replace uses of `from` by users for which `pred(module, user)` holds.
    pub fn replace_uses_if(
        &mut self,
        from: ValueId,
        to: ValueId,
        pred: impl Fn(&Module, OpId) -> bool,
    ) {
        for (user, idx) in self.module.uses(from) {
            if pred(&*self.module, user) {
                self.module.op_mut(user).operands[idx] = to;
            }
        }
    }

    /// Replace all results of `op` with `values` and erase it.
    pub fn replace_op(&mut self, op: OpId, values: &[ValueId]) -> IrResult<()> {
        let results = self.module.op(op).results.clone();
        if results.len() != values.len() {
            return Err(IrError::Malformed(format!(
                "replacing '{}' with {} value(s) for {} result(s)",
                self.module.op(op).kind.name(),
                values.len(),
                results.len()
            )));
        }
        for (&from, &to) in results.iter().zip(values) {
            self.replace_all_uses_with(from, to);
        }
        self.erase_op(op)
    }

    /// Detach and erase `op` together with everything nested in it. Fails if
    /// any result is still used outside of `op`.
    pub fn erase_op(&mut self, op: OpId) -> IrResult<()> {
        let module = &*self.module;
        let outside_uses: usize = module
            .op(op)
            .results
            .iter()
            .flat_map(|&r| module.uses(r))
            .filter(|&(user, _)| !module.is_proper_ancestor(op, user))
            .count();
        if outside_uses > 0 {
            let name = module.op(op).kind.name();
            return Err(IrError::EraseWithUses { op: name, uses: outside_uses });
        }

        if self.ip == InsertPoint::Before(op) {
            self.set_insertion_point_after(op);
        }
        if let Some(block) = self.module.op(op).parent {
            self.module.block_mut(block).ops.retain(|&o| o != op);
        }
        self.mark_erased(op);
        Ok(())
    }

    fn mark_erased(&mut self, op: OpId) {
        let data = self.module.op_mut(op);
        data.erased = true;
        data.parent = None;
        let regions = data.regions.clone();
        for region in regions {
            let nested = self.module.block(region).ops.clone();
            for inner in nested {
                self.mark_erased(inner);
            }
        }
    }
}
