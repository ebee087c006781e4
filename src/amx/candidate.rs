// This module decides whether a dot operation can be lowered to AMX and, if so, with which
// tile geometry. check_elem_types is the type legalizer: it matches operand and result element
// types against the enabled capabilities and picks the element types used on tiles (i8 inputs
// with an i32 accumulator, or a common 16-bit float input type with an f32 accumulator).
// check_input_shapes enforces rank 2 and the minimum size of 8 along M, K and N.
// plan_block_and_tile_sizes derives tile sizes from the 64-byte tile rows and groups
// accumulator tiles into blocks of at most four so that inputs still fit in the remaining
// tile registers. analyze_dot runs all checks, picks the accumulator mode for a loop-carried
// accumulator and looks for a store the tiles can write to directly. Infeasibility is an
// ordinary outcome expressed as a Rejection, never an error.

//! Candidate analysis: type legalization and tile/block size planning.

use std::fmt;

use log::debug;
use thiserror::Error;

use super::common::{has_mask_or_bounds_check, written_between, MemBuffer};
use super::layout::rows_per_group;
use super::loops::{is_loop_carried_acc, tied_loop_result};
use super::AmxOptions;
use crate::ir::{ElemType, InsertPoint, Module, OpId, OpKind, ShapedType, ValueId};

/// Tile register rows are limited to 64 bytes.
pub const TILE_ROW_BITS: i64 = 512;
/// Tile rows; also the column limit for 4-byte accumulator elements.
pub const MAX_TILE_DIM: i64 = 16;
/// Accumulator tiles resident at once, out of 8 tile registers.
pub const MAX_ACC_TILES: i64 = 4;
/// Smallest M, K or N worth lowering.
pub const MIN_DIM: i64 = 8;

/// How the accumulator is handled relative to an enclosing loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccMode {
    /// Not loop-carried: load, multiply, store around a flat nest.
    Unlooped,
    /// Loop-carried and small enough to stay in tile registers for the
    /// whole loop.
    KeepOnTiles,
    /// Loop-carried but spanning several blocks: kept in a scratch buffer
    /// across iterations.
    KeepInBuffer,
}

impl fmt::Display for AccMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AccMode::Unlooped => "unlooped",
            AccMode::KeepOnTiles => "keep-on-tiles",
            AccMode::KeepInBuffer => "keep-in-buffer",
        })
    }
}

/// Why a dot stays on the generic path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("operands and result must be vectors")]
    NotVector,

    #[error("AMX_INT8 is not available")]
    Int8Disabled,

    #[error("unsupported input integer type")]
    UnsupportedIntInput,

    #[error("unsupported output integer type")]
    UnsupportedIntOutput,

    #[error("mixed int/fp types")]
    MixedIntFloat,

    #[error("unsupported input fp type")]
    UnsupportedFloatInput,

    #[error("mismatched 16-bit input types")]
    MismatchedInputs,

    #[error("AMX_FP16 is not available")]
    Fp16Disabled,

    #[error("AMX_BF16 is not available")]
    Bf16Disabled,

    #[error("unsupported accumulator type")]
    UnsupportedFloatAcc,

    #[error("rank {0} is not supported")]
    Rank(usize),

    #[error("shape too small")]
    TooSmall,

    #[error("shape does not split into tiles")]
    NotDivisible,
}

/// Element types used on tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileElemTypes {
    pub lhs: ElemType,
    pub rhs: ElemType,
    pub acc: ElemType,
}

/// Tile sizes and accumulator block shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilePlan {
    pub tile_m: i64,
    pub tile_n: i64,
    pub tile_k: i64,
    pub tiles_in_block_m: i64,
    pub tiles_in_block_n: i64,
}

/// A dot accepted for lowering together with everything the rewrite needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmxDotCandidate {
    pub op: OpId,
    pub lhs_tile_elem_ty: ElemType,
    pub rhs_tile_elem_ty: ElemType,
    pub acc_tile_elem_ty: ElemType,
    pub tile_m: i64,
    pub tile_n: i64,
    pub tile_k: i64,
    pub tiles_in_block_m: i64,
    pub tiles_in_block_n: i64,
    pub acc_mode: AccMode,
    /// Memory the final tiles are stored to directly, if any.
    pub out_buf: MemBuffer,
    /// Store made redundant by `out_buf`.
    pub orig_store: Option<OpId>,
}

/// Match element types against the enabled capabilities.
pub fn check_elem_types(
    lhs: ElemType,
    rhs: ElemType,
    acc: ElemType,
    res: ElemType,
    options: &AmxOptions,
) -> Result<TileElemTypes, Rejection> {
    if lhs.is_integer() {
        if !options.convert_int8 {
            return Err(Rejection::Int8Disabled);
        }
        if lhs != ElemType::I8 || rhs != ElemType::I8 {
            return Err(Rejection::UnsupportedIntInput);
        }
        if !acc.is_integer() || acc.bit_width() > 32 || !res.is_integer() || res.bit_width() > 32 {
            return Err(Rejection::UnsupportedIntOutput);
        }
        return Ok(TileElemTypes { lhs: ElemType::I8, rhs: ElemType::I8, acc: ElemType::I32 });
    }

    if rhs.is_integer() || acc.is_integer() || res.is_integer() {
        return Err(Rejection::MixedIntFloat);
    }
    if lhs.bit_width() > 16 || rhs.bit_width() > 16 {
        return Err(Rejection::UnsupportedFloatInput);
    }

    // 8-bit floats have no tile support and are promoted.
    let common = if lhs.bit_width() == 16 {
        if rhs.bit_width() == 16 && rhs != lhs {
            return Err(Rejection::MismatchedInputs);
        }
        lhs
    } else if rhs.bit_width() == 16 {
        rhs
    } else if options.convert_bf16 {
        ElemType::BF16
    } else {
        ElemType::F16
    };

    if common == ElemType::F16 && !options.convert_fp16 {
        return Err(Rejection::Fp16Disabled);
    }
    if common == ElemType::BF16 && !options.convert_bf16 {
        return Err(Rejection::Bf16Disabled);
    }
    if acc.bit_width() > 32 || res.bit_width() > 32 {
        return Err(Rejection::UnsupportedFloatAcc);
    }

    Ok(TileElemTypes { lhs: common, rhs: common, acc: ElemType::F32 })
}

/// Only 2-D inputs of at least 8 along M, K and N are lowered.
pub fn check_input_shapes(
    lhs: &ShapedType,
    rhs: &ShapedType,
    acc: &ShapedType,
    res: &ShapedType,
) -> Result<(), Rejection> {
    for ty in [lhs, rhs, acc, res] {
        if ty.rank() != 2 {
            return Err(Rejection::Rank(ty.rank()));
        }
    }
    if lhs.dim(0) < MIN_DIM || lhs.dim(1) < MIN_DIM || res.dim(1) < MIN_DIM {
        return Err(Rejection::TooSmall);
    }
    Ok(())
}

/// Tile sizes from the 64-byte row limit, then accumulator tiles grouped into
/// blocks of at most [`MAX_ACC_TILES`]. The larger block side is halved first;
/// ties shrink M.
pub fn plan_block_and_tile_sizes(m: i64, n: i64, k: i64, lhs_tile_elem: ElemType) -> TilePlan {
    let tile_m = m.min(MAX_TILE_DIM);
    let tile_n = n.min(MAX_TILE_DIM);
    let tile_k = k.min(TILE_ROW_BITS / lhs_tile_elem.bit_width() as i64);

    let mut blocks_m = m / tile_m;
    let mut blocks_n = n / tile_n;
    while blocks_m * blocks_n > MAX_ACC_TILES {
        if blocks_m >= blocks_n {
            blocks_m /= 2;
        } else {
            blocks_n /= 2;
        }
    }

    TilePlan { tile_m, tile_n, tile_k, tiles_in_block_m: blocks_m, tiles_in_block_n: blocks_n }
}

fn check_divisible(
    m: i64,
    n: i64,
    k: i64,
    plan: &TilePlan,
    rhs_elem: ElemType,
) -> Result<(), Rejection> {
    let divisible = m % plan.tile_m == 0
        && n % plan.tile_n == 0
        && k % plan.tile_k == 0
        && plan.tile_k % rows_per_group(rhs_elem) == 0
        && (m / plan.tile_m) % plan.tiles_in_block_m == 0
        && (n / plan.tile_n) % plan.tiles_in_block_n == 0;
    if divisible {
        Ok(())
    } else {
        Err(Rejection::NotDivisible)
    }
}

/// A store the final value can be replaced with: the value's only use is an
/// unmasked write of the whole value into memory of the accumulator tile type.
pub fn find_output_buffer(
    module: &Module,
    value: ValueId,
    acc_tile_elem: ElemType,
) -> Option<(MemBuffer, OpId)> {
    let uses = module.uses(value);
    let [(store, 0)] = uses.as_slice() else {
        return None;
    };
    let data = module.op(*store);
    if !matches!(data.kind, OpKind::Write { .. }) || has_mask_or_bounds_check(module, *store) {
        return None;
    }
    let mem = module.value_type(data.operands[1]).as_memref()?;
    if mem.elem != acc_tile_elem || mem.rank() < 2 {
        return None;
    }
    Some((MemBuffer::new(data.operands[1], data.operands[2..].to_vec()), *store))
}

fn vector_type(module: &Module, value: ValueId) -> Result<ShapedType, Rejection> {
    module.value_type(value).as_vector().cloned().ok_or(Rejection::NotVector)
}

/// Check whether `op` can be lowered and build its candidate descriptor.
pub fn analyze_dot(
    module: &Module,
    op: OpId,
    options: &AmxOptions,
) -> Result<AmxDotCandidate, Rejection> {
    let data = module.op(op);
    if data.kind != OpKind::Dot || data.operands.len() != 3 || data.results.len() != 1 {
        return Err(Rejection::NotVector);
    }
    let lhs_ty = vector_type(module, data.operands[0])?;
    let rhs_ty = vector_type(module, data.operands[1])?;
    let acc_ty = vector_type(module, data.operands[2])?;
    let res_ty = vector_type(module, data.results[0])?;

    let elems = check_elem_types(lhs_ty.elem, rhs_ty.elem, acc_ty.elem, res_ty.elem, options)?;
    check_input_shapes(&lhs_ty, &rhs_ty, &acc_ty, &res_ty)?;

    let (m, n, k) = (res_ty.dim(0), res_ty.dim(1), lhs_ty.dim(1));
    let plan = plan_block_and_tile_sizes(m, n, k, elems.lhs);
    check_divisible(m, n, k, &plan, elems.rhs)?;

    let mut acc_mode = AccMode::Unlooped;
    let mut output = None;
    if is_loop_carried_acc(module, op) {
        if plan.tiles_in_block_m * plan.tile_m < m || plan.tiles_in_block_n * plan.tile_n < n {
            debug!("accumulator is too big to keep on tiles, keeping it in a buffer");
            acc_mode = AccMode::KeepInBuffer;
        } else {
            acc_mode = AccMode::KeepOnTiles;
            output = tied_loop_result(module, data.operands[2])
                .and_then(|res| find_output_buffer(module, res, elems.acc));
        }
    } else {
        // The rewrite is emitted at the store, so nothing may write memory
        // between the dot and the store.
        output = find_output_buffer(module, data.results[0], elems.acc).filter(|&(_, store)| {
            !written_between(module, op, InsertPoint::Before(store), |_| true)
        });
    }
    let (out_buf, orig_store) = match output {
        Some((buf, store)) => (buf, Some(store)),
        None => (MemBuffer::default(), None),
    };

    Ok(AmxDotCandidate {
        op,
        lhs_tile_elem_ty: elems.lhs,
        rhs_tile_elem_ty: elems.rhs,
        acc_tile_elem_ty: elems.acc,
        tile_m: plan.tile_m,
        tile_n: plan.tile_n,
        tile_k: plan.tile_k,
        tiles_in_block_m: plan.tiles_in_block_m,
        tiles_in_block_n: plan.tiles_in_block_n,
        acc_mode,
        out_buf,
        orig_store,
    })
}
