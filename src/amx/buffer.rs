//! Operand and result buffers for tile loads and stores.
//!
//! Tiles are only loaded from and stored to memory, so every operand of a
//! converted dot needs a memory region. Where possible the memory a value was
//! read from is reused as is; otherwise the value is copied into scratch
//! memory, packing the RHS on the way.

use log::{debug, trace};

use super::common::{allocate_tmp_buffer, find_input_buffer, is_zero_const, shift_index, MemBuffer};
use super::layout::{packed_layout_type, rows_per_group};
use crate::core::error::{ConvertError, ConvertResult};
use crate::ir::{OpId, Rewriter, ShapedType, Type, ValueId};

fn vector_type(rw: &Rewriter<'_>, value: ValueId) -> ConvertResult<ShapedType> {
    rw.module()
        .value_type(value)
        .as_vector()
        .cloned()
        .ok_or_else(|| ConvertError::UnexpectedStructure {
            reason: format!("value %{} is not a vector", value.0),
        })
}

fn mem_ref(buf: &MemBuffer) -> ConvertResult<ValueId> {
    buf.mem_ref
        .ok_or_else(|| ConvertError::UnexpectedStructure { reason: "empty buffer".to_string() })
}

/// Store a 2-D `value` into `buf` in packed layout.
///
/// For 16-bit types rows `2i` and `2i+1` are interleaved into packed row `i`.
/// For 8-bit types four rows are merged by interleaving rows `(0, 2)` and
/// `(1, 3)` first, then interleaving the two results.
pub fn interleave_and_store(
    rw: &mut Rewriter<'_>,
    value: ValueId,
    buf: &MemBuffer,
) -> ConvertResult<()> {
    let ty = vector_type(rw, value)?;
    let group = rows_per_group(ty.elem);
    if (group != 2 && group != 4) || ty.dim(0) % group != 0 {
        return Err(ConvertError::UnexpectedStructure {
            reason: format!("cannot pack vector<{}>", ty),
        });
    }
    let mem = mem_ref(buf)?;
    let row_dim = buf.indices.len() - 2;

    for i in (0..ty.dim(0)).step_by(group as usize) {
        let (row1, row2) = if group == 2 {
            (rw.extract(value, i), rw.extract(value, i + 1))
        } else {
            let r0 = rw.extract(value, i);
            let r2 = rw.extract(value, i + 2);
            let r1 = rw.extract(value, i + 1);
            let r3 = rw.extract(value, i + 3);
            (rw.interleave(r0, r2), rw.interleave(r1, r3))
        };
        let shuffled = rw.interleave(row1, row2);
        let mut indices = buf.indices.clone();
        indices[row_dim] = shift_index(rw, indices[row_dim], i / group);
        rw.write(shuffled, mem, &indices);
    }
    Ok(())
}

/// Read `ty` from `mem` and, with a known step, prefetch what the next loop
/// iteration reads.
pub fn load_with_prefetch(
    rw: &mut Rewriter<'_>,
    ty: Type,
    mem: ValueId,
    indices: &[ValueId],
    step: &[i64],
) -> ValueId {
    let value = rw.read(ty, mem, indices);
    if !step.is_empty() {
        let ahead: Vec<ValueId> =
            indices.iter().zip(step).map(|(&idx, &s)| shift_index(rw, idx, s)).collect();
        rw.prefetch(mem, &ahead);
    }
    value
}

/// Copy `src` (unpacked, of type `src_ty`) into `dst` in packed layout with a
/// loop over row groups.
pub fn copy_with_interleave(
    rw: &mut Rewriter<'_>,
    src_ty: &ShapedType,
    src: &MemBuffer,
    dst: &MemBuffer,
) -> ConvertResult<()> {
    let group = rows_per_group(src_ty.elem);
    let src_mem = mem_ref(src)?;
    let dst_mem = mem_ref(dst)?;

    let lower = rw.index_const(0);
    let upper = rw.index_const(src_ty.dim(0) / group);
    let one = rw.index_const(1);
    let group_val = rw.index_const(group);
    let for_op = rw.create_for(lower, upper, one, &[]);
    let body = rw.module().op(for_op).regions[0];
    let iv = rw.module().block(body).args[0];
    let terminator = rw.module().block(body).ops[0];
    let row_ty = Type::vector([src_ty.dim(1)], src_ty.elem);

    rw.guarded(|rw| {
        rw.set_insertion_point(terminator);
        let mut indices = src.indices.clone();
        let m = indices.len() - 2;
        let scaled = rw.muli(iv, group_val);
        indices[m] = rw.addi(indices[m], scaled);

        let mut rows = Vec::with_capacity(group as usize);
        for j in 0..group {
            if j > 0 {
                indices[m] = rw.addi(indices[m], one);
            }
            rows.push(load_with_prefetch(rw, row_ty.clone(), src_mem, &indices, &src.step));
        }
        let (row1, row2) = if group == 4 {
            (rw.interleave(rows[0], rows[2]), rw.interleave(rows[1], rows[3]))
        } else {
            (rows[0], rows[1])
        };
        let shuffled = rw.interleave(row1, row2);

        let mut dst_indices = dst.indices.clone();
        let d = dst_indices.len() - 2;
        dst_indices[d] = rw.addi(dst_indices[d], iv);
        rw.write(shuffled, dst_mem, &dst_indices);
    });
    trace!("emitted interleaving copy loop over {} row groups", src_ty.dim(0) / group);
    Ok(())
}

/// Memory to load tiles of `value` from.
///
/// With `read_only` the memory `value` was read from is reused when its
/// layout fits and nothing writes it before the insertion point, or copied
/// with interleave when a packed operand was read unpacked. Otherwise the
/// value is stored into scratch memory, packed first when `interleave` is
/// set. With `skip_for_zeros` a zero splat gets no buffer at all and an
/// empty [`MemBuffer`] is returned.
pub fn prepare_tensor_buffer(
    rw: &mut Rewriter<'_>,
    value: ValueId,
    interleave: bool,
    skip_for_zeros: bool,
    read_only: bool,
    alloca_point: OpId,
) -> ConvertResult<MemBuffer> {
    debug!("preparing buffer (interleave={}) for %{}", interleave, value.0);
    let ty = vector_type(rw, value)?;

    let input = if read_only {
        find_input_buffer(rw.module(), value, interleave, rw.insertion_point())
    } else {
        MemBuffer::default()
    };
    if !input.is_empty() {
        if interleave && !input.packed {
            debug!("  copying from the original memref with interleave");
            let mut tmp = allocate_tmp_buffer(rw, &packed_layout_type(&ty), alloca_point);
            copy_with_interleave(rw, &ty, &input, &tmp)?;
            tmp.packed = true;
            return Ok(tmp);
        }
        debug!("  reusing the original memref");
        return Ok(input);
    }

    if skip_for_zeros && is_zero_const(rw.module(), value) {
        debug!("  skipping buffer for a zero vector");
        return Ok(MemBuffer::default());
    }

    if interleave {
        let mut buf = allocate_tmp_buffer(rw, &packed_layout_type(&ty), alloca_point);
        interleave_and_store(rw, value, &buf)?;
        buf.packed = true;
        Ok(buf)
    } else {
        let buf = allocate_tmp_buffer(rw, &ty, alloca_point);
        let mem = mem_ref(&buf)?;
        rw.write(value, mem, &buf.indices);
        Ok(buf)
    }
}

/// Where the final accumulator tiles go: the output memory if the result can
/// be stored directly, else the accumulator buffer, else new scratch memory
/// of type `result_ty`.
pub fn prepare_result_buffer(
    rw: &mut Rewriter<'_>,
    result_ty: &ShapedType,
    acc_buf: &MemBuffer,
    out_buf: &MemBuffer,
    alloca_point: OpId,
) -> MemBuffer {
    if !out_buf.is_empty() {
        debug!("output memory will be used for direct tile stores");
        return out_buf.clone();
    }
    if !acc_buf.is_empty() {
        debug!("result will be stored to the accumulator buffer");
        return acc_buf.clone();
    }
    debug!("allocating buffer for the result");
    allocate_tmp_buffer(rw, result_ty, alloca_point)
}
