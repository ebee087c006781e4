//! Packed ("VNNI") layout of the RHS operand.
//!
//! The tile multiply consumes its RHS in 32-bit lanes, each lane holding
//! `rows_per_group` values taken from consecutive rows of the same column.
//! For a `K x N` matrix with group size `g` the packed form is
//! `(K / g) x (N * g)` with `packed[r][c * g + j] = orig[r * g + j][c]`.

use crate::ir::{ElemType, ShapedType};

/// Rows merged into one 32-bit lane: 2 for 16-bit types, 4 for 8-bit types.
pub fn rows_per_group(elem: ElemType) -> i64 {
    32 / elem.bit_width() as i64
}

/// Shape of the packed form of a 2-D `ty`.
pub fn packed_layout_type(ty: &ShapedType) -> ShapedType {
    let group = rows_per_group(ty.elem);
    ShapedType::new([ty.shape[0] / group, ty.shape[1] * group], ty.elem)
}

/// Pack a row-major `rows x cols` matrix. `rows` must be a multiple of `group`.
pub fn pack_rows<T: Copy>(data: &[T], rows: usize, cols: usize, group: usize) -> Vec<T> {
    debug_assert_eq!(rows % group, 0);
    let mut out = Vec::with_capacity(data.len());
    for r in 0..rows / group {
        for c in 0..cols {
            for j in 0..group {
                out.push(data[(r * group + j) * cols + c]);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Buffer, Interpreter, Module};

    #[test]
    fn test_rows_per_group() {
        assert_eq!(rows_per_group(ElemType::BF16), 2);
        assert_eq!(rows_per_group(ElemType::F16), 2);
        assert_eq!(rows_per_group(ElemType::I8), 4);
    }

    #[test]
    fn test_packed_type() {
        let ty = ShapedType::new([32, 16], ElemType::BF16);
        assert_eq!(packed_layout_type(&ty), ShapedType::new([16, 32], ElemType::BF16));
        let ty = ShapedType::new([64, 16], ElemType::I8);
        assert_eq!(packed_layout_type(&ty), ShapedType::new([16, 64], ElemType::I8));
    }

    #[test]
    fn test_pack_two_rows() {
        // B(0,0) B(1,0) B(0,1) B(1,1) ...
        let data = [0, 1, 2, 10, 11, 12];
        assert_eq!(pack_rows(&data, 2, 3, 2), vec![0, 10, 1, 11, 2, 12]);
    }

    #[test]
    fn test_pack_four_rows() {
        let data: Vec<u8> = (0..8).collect();
        // 4x2 matrix, one packed row: column 0 then column 1
        assert_eq!(pack_rows(&data, 4, 2, 4), vec![0, 2, 4, 6, 1, 3, 5, 7]);
    }

    /// Pack with `pack_rows`, then read the packed memory back as the logical
    /// value with a `{packed}` read.
    fn unpack_through_read(elem: ElemType, rows: i64, cols: i64) {
        let group = rows_per_group(elem);
        let text = format!(
            "func @f(%p: memref<{pr}x{pc}x{e}>, %out: memref<{rows}x{cols}x{e}>) {{\n\
             \x20 %c0 = const 0 : index\n\
             \x20 %v = read %p[%c0, %c0] {{packed}} : vector<{rows}x{cols}x{e}>\n\
             \x20 write %v, %out[%c0, %c0]\n\
             \x20 return\n}}\n",
            pr = rows / group,
            pc = cols * group,
            e = elem,
        );
        let module = Module::parse(&text).unwrap();

        let original = Buffer::from_fn(rows, cols, elem, |r, c| ((r * cols + c) % 97) as f64);
        let mut packed = Buffer::zeros([rows / group, cols * group], elem);
        packed.data = pack_rows(&original.data, rows as usize, cols as usize, group as usize);

        let mut interp = Interpreter::new(&module);
        let p = interp.add_buffer(packed);
        let out = interp.add_buffer(Buffer::zeros([rows, cols], elem));
        interp.run("f", &[p, out.clone()]).unwrap();
        assert_eq!(interp.buffer(&out).unwrap().data, original.data);
    }

    #[test]
    fn test_packed_read_restores_original() {
        unpack_through_read(ElemType::BF16, 32, 16);
        unpack_through_read(ElemType::I8, 64, 16);
    }
}
