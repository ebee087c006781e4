//! Rewrite of one accepted candidate.
//!
//! Operands are cast to the tile element types and given buffers, the blocked
//! multiply nest is emitted, and the result is wired back according to the
//! candidate's [`AccMode`]:
//!
//! - `Unlooped`: tiles go to the output memory (the original store is erased)
//!   or to a buffer that is read back to replace the dot result.
//! - `KeepOnTiles`: accumulator tiles become extra loop-carried values; after
//!   the loop they are stored to the output memory or read back through a
//!   buffer to replace the tied loop result.
//! - `KeepInBuffer`: the accumulator lives in a buffer initialized before the
//!   loop and read back once after it.
//!
//! Tiles carried through a loop are not forward-stored to the output memory
//! inside the loop; the store always happens after the loop exits.

use log::{debug, trace};

use super::buffer::{prepare_result_buffer, prepare_tensor_buffer};
use super::candidate::{AccMode, AmxDotCandidate};
use super::common::{alloca_point, maybe_cast, MemBuffer};
use super::layout::packed_layout_type;
use super::loops::{
    enclosing_loop, replace_with_additional_yields, tied_init_value, tied_loop_result,
};
use super::tiles::{load_block_tiles, store_block_tiles, BlockMultiply, BlockTiles, MulKind};
use crate::core::error::{ConvertError, ConvertResult};
use crate::ir::{ElemType, Module, OpKind, Rewriter, ShapedType, Type, ValueId};

fn unexpected(reason: impl Into<String>) -> ConvertError {
    ConvertError::UnexpectedStructure { reason: reason.into() }
}

fn vector_of(module: &Module, value: ValueId) -> ConvertResult<ShapedType> {
    module
        .value_type(value)
        .as_vector()
        .cloned()
        .ok_or_else(|| unexpected(format!("value %{} is not a vector", value.0)))
}

/// Rewrite `candidate` in place. Returns the number of tile operations
/// emitted. On error the module may be partially rewritten.
pub fn convert_candidate(module: &mut Module, candidate: &AmxDotCandidate) -> ConvertResult<usize> {
    let op = candidate.op;
    let data = module.op(op).clone();
    if data.erased || data.kind != OpKind::Dot {
        return Err(unexpected("candidate is no longer a live dot"));
    }
    let (lhs, rhs, acc) = (data.operands[0], data.operands[1], data.operands[2]);
    let res = data.results[0];
    let lhs_ty = vector_of(module, lhs)?;
    let acc_ty = vector_of(module, acc)?;
    let res_ty = vector_of(module, res)?;

    let (tile_m, tile_n, tile_k) = (candidate.tile_m, candidate.tile_n, candidate.tile_k);
    let lhs_tile = ShapedType::new([tile_m, tile_k], candidate.lhs_tile_elem_ty);
    let rhs_tile =
        packed_layout_type(&ShapedType::new([tile_k, tile_n], candidate.rhs_tile_elem_ty));
    let acc_tile = ShapedType::new([tile_m, tile_n], candidate.acc_tile_elem_ty);
    let acc_vec_ty = acc_ty.with_elem(candidate.acc_tile_elem_ty);

    let allocs = alloca_point(module, op);
    let loop_op = match candidate.acc_mode {
        AccMode::Unlooped => None,
        AccMode::KeepOnTiles | AccMode::KeepInBuffer => {
            let found = module.parent_op(op).map_or("nothing", |p| module.op(p).kind.name());
            Some(enclosing_loop(module, op).ok_or(ConvertError::NotInLoop { found })?)
        }
    };
    let keep_on_tiles = candidate.acc_mode == AccMode::KeepOnTiles;

    let mut rw = Rewriter::before(module, op);
    // Direct stores need the store's memref and indices, which are only
    // available at the store.
    if let (AccMode::Unlooped, Some(store)) = (candidate.acc_mode, candidate.orig_store) {
        rw.set_insertion_point(store);
    }

    let lhs = maybe_cast(&mut rw, lhs, candidate.lhs_tile_elem_ty);
    let lhs_buf = prepare_tensor_buffer(&mut rw, lhs, false, false, true, allocs)?;
    let rhs = maybe_cast(&mut rw, rhs, candidate.rhs_tile_elem_ty);
    let rhs_buf = prepare_tensor_buffer(&mut rw, rhs, true, false, true, allocs)?;

    let acc_buf = match loop_op {
        None => {
            let acc = maybe_cast(&mut rw, acc, candidate.acc_tile_elem_ty);
            prepare_tensor_buffer(&mut rw, acc, false, true, false, allocs)?
        }
        Some(loop_op) => {
            // The initial accumulator is materialized in front of the loop.
            let init = tied_init_value(rw.module(), acc)
                .ok_or_else(|| unexpected("accumulator has no loop init"))?;
            rw.guarded(|rw| {
                rw.set_insertion_point(loop_op);
                let init = maybe_cast(rw, init, candidate.acc_tile_elem_ty);
                prepare_tensor_buffer(rw, init, false, keep_on_tiles, false, allocs)
            })?
        }
    };
    let res_buf = prepare_result_buffer(&mut rw, &acc_vec_ty, &acc_buf, &candidate.out_buf, allocs);

    let tiles_in_block = (candidate.tiles_in_block_m, candidate.tiles_in_block_n);
    let mut acc_tiles: BlockTiles = Vec::new();
    let mut acc_init_tiles: BlockTiles = Vec::new();
    if let (true, Some(loop_op)) = (keep_on_tiles, loop_op) {
        debug!("loading accumulator to tiles before the loop");
        acc_init_tiles = rw.guarded(|rw| {
            rw.set_insertion_point(loop_op);
            load_block_tiles(rw, &acc_tile, &acc_buf, tiles_in_block, (0, 0))
        })?;
        acc_tiles = acc_init_tiles.clone();
    }

    let mul = BlockMultiply {
        lhs_tile: &lhs_tile,
        rhs_tile: &rhs_tile,
        acc_tile: &acc_tile,
        lhs_buf: &lhs_buf,
        rhs_buf: &rhs_buf,
        res_buf: &res_buf,
        tiles_in_block_m: candidate.tiles_in_block_m,
        tiles_in_block_n: candidate.tiles_in_block_n,
        kind: MulKind::for_acc(candidate.acc_tile_elem_ty),
    };
    let blocks_m = acc_ty.dim(0) / candidate.tile_m / candidate.tiles_in_block_m;
    let blocks_n = acc_ty.dim(1) / candidate.tile_n / candidate.tiles_in_block_n;
    let tiles_k = lhs_ty.dim(1) / candidate.tile_k;
    for block_m in 0..blocks_m {
        for block_n in 0..blocks_n {
            if !keep_on_tiles {
                let block = (block_m, block_n);
                acc_tiles = load_block_tiles(&mut rw, &acc_tile, &acc_buf, tiles_in_block, block)?;
            }
            for block_k in 0..tiles_k {
                let store_acc = !keep_on_tiles && block_k == tiles_k - 1;
                mul.emit(&mut rw, (block_m, block_n), block_k, &mut acc_tiles, store_acc)?;
            }
        }
    }
    trace!("emitted {}x{} block(s) with {} reduction step(s)", blocks_m, blocks_n, tiles_k);

    match (candidate.acc_mode, loop_op) {
        (AccMode::KeepOnTiles, Some(loop_op)) => {
            let tied = tied_loop_result(rw.module(), acc)
                .ok_or_else(|| unexpected("accumulator has no tied result"))?;
            let slot = rw
                .module()
                .op(loop_op)
                .results
                .iter()
                .position(|&r| r == tied)
                .ok_or_else(|| unexpected("tied result does not belong to the loop"))?;
            rw.replace_op(op, &[acc])?;

            debug!("rewriting loop to carry accumulator tiles");
            let inits: Vec<ValueId> = acc_init_tiles.iter().flatten().copied().collect();
            let yields: Vec<ValueId> = acc_tiles.iter().flatten().copied().collect();
            let (new_loop, res_tiles) =
                replace_with_additional_yields(&mut rw, loop_op, &inits, &yields, true)?;
            let row = candidate.tiles_in_block_n as usize;
            let final_tiles: BlockTiles = res_tiles.chunks(row).map(<[ValueId]>::to_vec).collect();

            match candidate.orig_store {
                None => {
                    debug!("moving resulting tiles to a vector through memory");
                    rw.set_insertion_point_after(new_loop);
                    store_block_tiles(&mut rw, &acc_tile, &res_buf, (0, 0), &final_tiles)?;
                    let value = read_back(&mut rw, &acc_vec_ty, &res_buf, acc_ty.elem)?;
                    let loop_res = rw.module().op(new_loop).results[slot];
                    rw.replace_all_uses_with(loop_res, value);
                }
                Some(store) => {
                    debug!("storing resulting tiles to the output memory");
                    rw.set_insertion_point(store);
                    let out_buf = &candidate.out_buf;
                    store_block_tiles(&mut rw, &acc_tile, out_buf, (0, 0), &final_tiles)?;
                    rw.erase_op(store)?;
                }
            }
        }
        (AccMode::KeepInBuffer, Some(loop_op)) => {
            let loop_res = tied_loop_result(rw.module(), acc)
                .ok_or_else(|| unexpected("accumulator has no tied result"))?;
            debug!("loading bufferized accumulator to replace the loop result");
            rw.set_insertion_point_after(loop_op);
            let value = read_back(&mut rw, &acc_vec_ty, &res_buf, acc_ty.elem)?;
            rw.replace_all_uses_with(loop_res, value);
            rw.replace_op(op, &[acc])?;
        }
        (AccMode::Unlooped, _) => match candidate.orig_store {
            None => {
                debug!("loading the result to replace the dot");
                let value = read_back(&mut rw, &acc_vec_ty, &res_buf, res_ty.elem)?;
                rw.replace_op(op, &[value])?;
            }
            Some(store) => {
                debug!("removing the dot and its store");
                rw.erase_op(store)?;
                rw.erase_op(op)?;
            }
        },
        (mode, None) => return Err(unexpected(format!("{} accumulator outside a loop", mode))),
    }

    Ok(rw.finish()?)
}

/// Read the accumulator back from `buf` and cast it to `elem`.
fn read_back(
    rw: &mut Rewriter<'_>,
    ty: &ShapedType,
    buf: &MemBuffer,
    elem: ElemType,
) -> ConvertResult<ValueId> {
    let mem = buf.mem_ref.ok_or_else(|| unexpected("result buffer is empty"))?;
    let value = rw.read(Type::Vector(ty.clone()), mem, &buf.indices);
    Ok(maybe_cast(rw, value, elem))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amx::{analyze_dot, AmxOptions};
    use crate::ir::{Buffer, Interpreter, OpId};

    fn convert_op(module: &mut Module, op: OpId) -> ConvertResult<usize> {
        let candidate = analyze_dot(module, op, &AmxOptions::all()).unwrap();
        convert_candidate(module, &candidate)
    }

    fn dot_of(module: &Module) -> OpId {
        module.walk().into_iter().find(|&op| module.op(op).kind == OpKind::Dot).unwrap()
    }

    #[test]
    fn test_unlooped_direct_store() {
        let mut module = Module::parse(
            r#"
func @f(%a: memref<16x32xbf16>, %b: memref<32x16xbf16>, %c: memref<16x16xf32>) {
  %c0 = const 0 : index
  %lhs = read %a[%c0, %c0] : vector<16x32xbf16>
  %rhs = read %b[%c0, %c0] : vector<32x16xbf16>
  %acc = read %c[%c0, %c0] : vector<16x16xf32>
  %res = dot %lhs, %rhs, %acc : vector<16x16xf32>
  write %res, %c[%c0, %c0]
  return
}
"#,
        )
        .unwrap();
        let dot = dot_of(&module);
        let emitted = convert_op(&mut module, dot).unwrap();
        assert_eq!(module.count_ops("dot"), 0);
        assert_eq!(module.count_ops("tile_mulf"), 1);
        assert_eq!(module.count_ops("tile_store"), 1);
        // acc load, lhs load, rhs load, multiply, store
        assert_eq!(emitted, 5);
        assert!(module.verify().is_ok());

        let mut interp = Interpreter::new(&module);
        let a = Buffer::from_fn(16, 32, ElemType::BF16, |r, c| ((r + 2 * c) % 5) as f64);
        let a = interp.add_buffer(a);
        let b = Buffer::from_fn(32, 16, ElemType::BF16, |r, c| ((3 * r + c) % 7) as f64 - 3.0);
        let b = interp.add_buffer(b);
        let c = interp.add_buffer(Buffer::from_fn(16, 16, ElemType::F32, |r, c| (r * c) as f64));
        interp.run("f", &[a, b, c.clone()]).unwrap();

        let out = interp.buffer(&c).unwrap();
        let expected = dot_product(3, 7) + 21.0;
        assert_eq!(out.get(3, 7), expected);
    }

    fn dot_product(r: i64, c: i64) -> f64 {
        (0..32).map(|k| (((r + 2 * k) % 5) as f64) * ((((3 * k + c) % 7) as f64) - 3.0)).sum()
    }

    #[test]
    fn test_converted_twice_fails() {
        let mut module = Module::parse(
            r#"
func @f(%a: memref<16x16xi8>, %b: memref<16x16xi8>) {
  %c0 = const 0 : index
  %lhs = read %a[%c0, %c0] : vector<16x16xi8>
  %rhs = read %b[%c0, %c0] : vector<16x16xi8>
  %acc = const 0 : vector<16x16xi32>
  %res = dot %lhs, %rhs, %acc : vector<16x16xi32>
  return %res
}
"#,
        )
        .unwrap();
        let dot = dot_of(&module);
        let candidate = analyze_dot(&module, dot, &AmxOptions::all()).unwrap();
        convert_candidate(&mut module, &candidate).unwrap();
        assert_eq!(module.count_ops("tile_zero"), 1);
        assert!(matches!(
            convert_candidate(&mut module, &candidate),
            Err(ConvertError::UnexpectedStructure { .. })
        ));
    }
}
