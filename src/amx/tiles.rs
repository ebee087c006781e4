//! Tile loads, stores and blocked multiplies.
//!
//! Tile positions are given as `(block, tile)` coordinates along the two
//! dimensions of the buffer: the element offset of a tile is
//! `block * tiles_in_block * tile_dim + tile * tile_dim`.

use log::trace;

use super::common::{shift_index, MemBuffer};
use crate::core::error::{ConvertError, ConvertResult};
use crate::ir::{ElemType, OpKind, Rewriter, ShapedType, Type, ValueId};

/// Tile multiply flavour, fixed once per candidate by the accumulator type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MulKind {
    Integer,
    Float,
}

impl MulKind {
    pub fn for_acc(acc_elem: ElemType) -> Self {
        if acc_elem.is_integer() {
            MulKind::Integer
        } else {
            MulKind::Float
        }
    }

    pub fn op_kind(self) -> OpKind {
        match self {
            MulKind::Integer => OpKind::TileMulI,
            MulKind::Float => OpKind::TileMulF,
        }
    }
}

/// Accumulator tiles of one block, indexed `[m][n]`.
pub type BlockTiles = Vec<Vec<ValueId>>;

/// Buffer indices shifted to the origin of one tile.
pub fn shift_indices(
    rw: &mut Rewriter<'_>,
    indices: &[ValueId],
    tile_ty: &ShapedType,
    tiles_in_block: (i64, i64),
    block: (i64, i64),
    tile: (i64, i64),
) -> Vec<ValueId> {
    let offs_m = (block.0 * tiles_in_block.0 + tile.0) * tile_ty.dim(0);
    let offs_n = (block.1 * tiles_in_block.1 + tile.1) * tile_ty.dim(1);
    let split = indices.len() - 2;
    let mut res = indices[..split].to_vec();
    res.push(shift_index(rw, indices[split], offs_m));
    res.push(shift_index(rw, indices[split + 1], offs_n));
    res
}

fn buffer_mem(buf: &MemBuffer) -> ConvertResult<ValueId> {
    buf.mem_ref.ok_or_else(|| ConvertError::UnexpectedStructure {
        reason: "tile access to an empty buffer".to_string(),
    })
}

/// Load one tile, prefetching the tile one step ahead when the buffer's step
/// is known.
pub fn load_tile(
    rw: &mut Rewriter<'_>,
    tile_ty: &ShapedType,
    buf: &MemBuffer,
    tiles_in_block: (i64, i64),
    block: (i64, i64),
    tile: (i64, i64),
) -> ConvertResult<ValueId> {
    let mem = buffer_mem(buf)?;
    let indices = shift_indices(rw, &buf.indices, tile_ty, tiles_in_block, block, tile);
    let value = rw.tile_load(Type::Tile(tile_ty.clone()), mem, &indices);
    if !buf.step.is_empty() {
        let ahead: Vec<ValueId> =
            indices.iter().zip(&buf.step).map(|(&idx, &s)| shift_index(rw, idx, s)).collect();
        rw.prefetch(mem, &ahead);
    }
    Ok(value)
}

pub fn store_tile(
    rw: &mut Rewriter<'_>,
    tile_ty: &ShapedType,
    value: ValueId,
    buf: &MemBuffer,
    tiles_in_block: (i64, i64),
    block: (i64, i64),
    tile: (i64, i64),
) -> ConvertResult<()> {
    let mem = buffer_mem(buf)?;
    let indices = shift_indices(rw, &buf.indices, tile_ty, tiles_in_block, block, tile);
    rw.tile_store(value, mem, &indices);
    Ok(())
}

/// Load all tiles of a block, or zero them when `buf` is empty.
pub fn load_block_tiles(
    rw: &mut Rewriter<'_>,
    tile_ty: &ShapedType,
    buf: &MemBuffer,
    tiles_in_block: (i64, i64),
    block: (i64, i64),
) -> ConvertResult<BlockTiles> {
    let mut res = Vec::with_capacity(tiles_in_block.0 as usize);
    for m in 0..tiles_in_block.0 {
        let mut row = Vec::with_capacity(tiles_in_block.1 as usize);
        for n in 0..tiles_in_block.1 {
            let tile = if buf.is_empty() {
                rw.tile_zero(Type::Tile(tile_ty.clone()))
            } else {
                load_tile(rw, tile_ty, buf, tiles_in_block, block, (m, n))?
            };
            row.push(tile);
        }
        res.push(row);
    }
    Ok(res)
}

pub fn store_block_tiles(
    rw: &mut Rewriter<'_>,
    tile_ty: &ShapedType,
    buf: &MemBuffer,
    block: (i64, i64),
    tiles: &BlockTiles,
) -> ConvertResult<()> {
    let tiles_in_block = (tiles.len() as i64, tiles.first().map_or(0, Vec::len) as i64);
    for (m, row) in tiles.iter().enumerate() {
        for (n, &tile) in row.iter().enumerate() {
            store_tile(rw, tile_ty, tile, buf, tiles_in_block, block, (m as i64, n as i64))?;
        }
    }
    Ok(())
}

/// Operands shared by every block multiply of one candidate.
pub struct BlockMultiply<'a> {
    pub lhs_tile: &'a ShapedType,
    /// Packed RHS tile.
    pub rhs_tile: &'a ShapedType,
    pub acc_tile: &'a ShapedType,
    pub lhs_buf: &'a MemBuffer,
    pub rhs_buf: &'a MemBuffer,
    /// Where final accumulator tiles are stored.
    pub res_buf: &'a MemBuffer,
    pub tiles_in_block_m: i64,
    pub tiles_in_block_n: i64,
    pub kind: MulKind,
}

impl BlockMultiply<'_> {
    /// Multiply one reduction step `block_k` into `acc_tiles`, preloading the
    /// smaller of the LHS and RHS block. With `store_result` each accumulator
    /// tile is stored right after its multiply.
    pub fn emit(
        &self,
        rw: &mut Rewriter<'_>,
        block: (i64, i64),
        block_k: i64,
        acc_tiles: &mut BlockTiles,
        store_result: bool,
    ) -> ConvertResult<()> {
        if self.tiles_in_block_m <= self.tiles_in_block_n {
            self.preload_lhs(rw, block, block_k, acc_tiles, store_result)
        } else {
            self.preload_rhs(rw, block, block_k, acc_tiles, store_result)
        }
    }

    fn multiply(
        &self,
        rw: &mut Rewriter<'_>,
        lhs: ValueId,
        rhs: ValueId,
        block: (i64, i64),
        tile: (i64, i64),
        acc_tiles: &mut BlockTiles,
        store_result: bool,
    ) -> ConvertResult<()> {
        let (m, n) = (tile.0 as usize, tile.1 as usize);
        acc_tiles[m][n] = rw.tile_mul(self.kind.op_kind(), lhs, rhs, acc_tiles[m][n]);
        if store_result {
            let tiles_in_block = (self.tiles_in_block_m, self.tiles_in_block_n);
            let acc = acc_tiles[m][n];
            store_tile(rw, self.acc_tile, acc, self.res_buf, tiles_in_block, block, tile)?;
        }
        Ok(())
    }

    /// LHS block stays on tiles while RHS tiles stream through.
    pub fn preload_lhs(
        &self,
        rw: &mut Rewriter<'_>,
        block: (i64, i64),
        block_k: i64,
        acc_tiles: &mut BlockTiles,
        store_result: bool,
    ) -> ConvertResult<()> {
        trace!("block {:?} k={}: preloading {} LHS tile(s)", block, block_k, self.tiles_in_block_m);
        let lhs_in_block = (self.tiles_in_block_m, 1);
        let rhs_in_block = (1, self.tiles_in_block_n);
        let lhs_block = (block.0, block_k);
        let rhs_block = (block_k, block.1);
        let lhs_tiles = load_block_tiles(rw, self.lhs_tile, self.lhs_buf, lhs_in_block, lhs_block)?;
        for n in 0..self.tiles_in_block_n {
            let rhs = load_tile(rw, self.rhs_tile, self.rhs_buf, rhs_in_block, rhs_block, (0, n))?;
            for m in 0..self.tiles_in_block_m {
                let lhs = lhs_tiles[m as usize][0];
                self.multiply(rw, lhs, rhs, block, (m, n), acc_tiles, store_result)?;
            }
        }
        Ok(())
    }

    /// RHS block stays on tiles while LHS tiles stream through.
    pub fn preload_rhs(
        &self,
        rw: &mut Rewriter<'_>,
        block: (i64, i64),
        block_k: i64,
        acc_tiles: &mut BlockTiles,
        store_result: bool,
    ) -> ConvertResult<()> {
        trace!("block {:?} k={}: preloading {} RHS tile(s)", block, block_k, self.tiles_in_block_n);
        let lhs_in_block = (self.tiles_in_block_m, 1);
        let rhs_in_block = (1, self.tiles_in_block_n);
        let lhs_block = (block.0, block_k);
        let rhs_block = (block_k, block.1);
        let rhs_tiles = load_block_tiles(rw, self.rhs_tile, self.rhs_buf, rhs_in_block, rhs_block)?;
        for m in 0..self.tiles_in_block_m {
            let lhs = load_tile(rw, self.lhs_tile, self.lhs_buf, lhs_in_block, lhs_block, (m, 0))?;
            for n in 0..self.tiles_in_block_n {
                let rhs = rhs_tiles[0][n as usize];
                self.multiply(rw, lhs, rhs, block, (m, n), acc_tiles, store_result)?;
            }
        }
        Ok(())
    }
}
