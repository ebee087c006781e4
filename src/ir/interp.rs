//! Reference interpreter for the IR.
//!
//! Executes a function over host buffers so rewrites can be checked for
//! numeric equivalence. Every number is carried as `f64` and rounded to the
//! element type of the value it is stored in; 16-bit floats round through
//! the `half` crate.

use hashbrown::HashMap;

use super::{BlockId, ConstAttr, ElemType, Module, OpId, OpKind, Type, ValueId};
use crate::core::error::InterpError;

/// Host memory backing a `memref`.
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    pub shape: Vec<i64>,
    pub elem: ElemType,
    pub data: Vec<f64>,
}

impl Buffer {
    pub fn zeros(shape: impl Into<Vec<i64>>, elem: ElemType) -> Self {
        let shape = shape.into();
        let len = shape.iter().product::<i64>() as usize;
        Self { shape, elem, data: vec![0.0; len] }
    }

    /// 2-D buffer filled by `f(row, col)`, rounded to `elem`.
    pub fn from_fn(rows: i64, cols: i64, elem: ElemType, f: impl Fn(i64, i64) -> f64) -> Self {
        let mut data = Vec::with_capacity((rows * cols) as usize);
        for r in 0..rows {
            for c in 0..cols {
                data.push(round_to(elem, f(r, c)));
            }
        }
        Self { shape: vec![rows, cols], elem, data }
    }

    pub fn get(&self, row: i64, col: i64) -> f64 {
        self.data[(row * self.shape[1] + col) as usize]
    }

    fn offset(&self, indices: &[i64]) -> Option<usize> {
        let mut offset = 0i64;
        for (&idx, &dim) in indices.iter().zip(&self.shape) {
            if idx < 0 || idx >= dim {
                return None;
            }
            offset = offset * dim + idx;
        }
        Some(offset as usize)
    }
}

/// Runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum RtValue {
    Index(i64),
    Scalar(f64),
    Vector { shape: Vec<i64>, data: Vec<f64> },
    /// Index into the interpreter's buffer list.
    MemRef(usize),
    Tile { rows: i64, cols: i64, data: Vec<f64> },
}

/// Round `value` to what `elem` can represent. Integers wrap.
pub fn round_to(elem: ElemType, value: f64) -> f64 {
    match elem {
        ElemType::I8 => (value.trunc() as i64) as i8 as f64,
        ElemType::I16 => (value.trunc() as i64) as i16 as f64,
        ElemType::I32 => (value.trunc() as i64) as i32 as f64,
        ElemType::I64 => value.trunc() as i64 as f64,
        ElemType::F16 => half::f16::from_f64(value).to_f64(),
        ElemType::BF16 => half::bf16::from_f64(value).to_f64(),
        ElemType::F32 => value as f32 as f64,
        ElemType::F64 => value,
        ElemType::F8E5M2 => round_f8(value, 2, 57344.0),
        ElemType::F8E4M3 => round_f8(value, 3, 448.0),
    }
}

/// Round to a float with `mantissa_bits` explicit mantissa bits, saturating
/// at `max`. Subnormal ranges are approximated through f16.
fn round_f8(value: f64, mantissa_bits: u32, max: f64) -> f64 {
    let drop = 10 - mantissa_bits;
    let bits = half::f16::from_f64(value.clamp(-max, max)).to_bits();
    let half_ulp = 1u16 << (drop - 1);
    let lsb = (bits >> drop) & 1;
    let rounded = bits.wrapping_add(half_ulp - 1 + lsb) & !((1u16 << drop) - 1);
    half::f16::from_bits(rounded).to_f64().clamp(-max, max)
}

pub struct Interpreter<'m> {
    module: &'m Module,
    buffers: Vec<Buffer>,
    env: HashMap<ValueId, RtValue>,
}

impl<'m> Interpreter<'m> {
    pub fn new(module: &'m Module) -> Self {
        Self { module, buffers: Vec::new(), env: HashMap::new() }
    }

    /// Register host memory, returning the value to pass as a `memref` argument.
    pub fn add_buffer(&mut self, buffer: Buffer) -> RtValue {
        self.buffers.push(buffer);
        RtValue::MemRef(self.buffers.len() - 1)
    }

    pub fn buffer(&self, value: &RtValue) -> Option<&Buffer> {
        match value {
            RtValue::MemRef(idx) => self.buffers.get(*idx),
            _ => None,
        }
    }

    /// Execute function `name` and return the values passed to `return`.
    pub fn run(&mut self, name: &str, args: &[RtValue]) -> Result<Vec<RtValue>, InterpError> {
        let func = self
            .module
            .func_by_name(name)
            .ok_or_else(|| InterpError::FunctionNotFound { name: name.to_string() })?;
        let expected = self.module.func_args(func).len();
        if expected != args.len() {
            return Err(InterpError::ArgumentCount { expected, got: args.len() });
        }
        self.exec_block(self.module.func_body(func), args.to_vec())
    }

    fn get(&self, value: ValueId) -> Result<&RtValue, InterpError> {
        self.env.get(&value).ok_or(InterpError::Undefined(value.0))
    }

    fn get_index(&self, value: ValueId) -> Result<i64, InterpError> {
        match self.get(value)? {
            RtValue::Index(v) => Ok(*v),
            other => Err(mismatch("index", format!("expected index, got {:?}", other))),
        }
    }

    fn get_indices(&self, values: &[ValueId]) -> Result<Vec<i64>, InterpError> {
        values.iter().map(|&v| self.get_index(v)).collect()
    }

    fn get_buffer_idx(&self, value: ValueId) -> Result<usize, InterpError> {
        match self.get(value)? {
            RtValue::MemRef(idx) => Ok(*idx),
            other => Err(mismatch("memref", format!("expected memref, got {:?}", other))),
        }
    }

    fn get_vector(&self, value: ValueId) -> Result<(Vec<i64>, Vec<f64>), InterpError> {
        match self.get(value)? {
            RtValue::Vector { shape, data } => Ok((shape.clone(), data.clone())),
            other => Err(mismatch("vector", format!("expected vector, got {:?}", other))),
        }
    }

    fn get_tile(&self, value: ValueId) -> Result<(i64, i64, Vec<f64>), InterpError> {
        match self.get(value)? {
            RtValue::Tile { rows, cols, data } => Ok((*rows, *cols, data.clone())),
            other => Err(mismatch("tile", format!("expected tile, got {:?}", other))),
        }
    }

    fn exec_block(
        &mut self,
        block: BlockId,
        args: Vec<RtValue>,
    ) -> Result<Vec<RtValue>, InterpError> {
        let module = self.module;
        for (&arg, value) in module.block(block).args.iter().zip(args) {
            self.env.insert(arg, value);
        }
        for &op in &module.block(block).ops {
            let data = module.op(op);
            if data.kind.is_terminator() {
                return data.operands.iter().map(|&v| self.get(v).cloned()).collect();
            }
            let results = self.exec_op(op)?;
            for (&res, value) in data.results.iter().zip(results) {
                self.env.insert(res, value);
            }
        }
        Ok(Vec::new())
    }

    fn exec_op(&mut self, op: OpId) -> Result<Vec<RtValue>, InterpError> {
        let module = self.module;
        let data = module.op(op);
        let ops = &data.operands;
        let result_ty = data.results.first().map(|&r| module.value_type(r));

        let value = match &data.kind {
            OpKind::Constant(attr) => match result_ty {
                Some(Type::Index) => RtValue::Index(match attr {
                    ConstAttr::Int(v) => *v,
                    ConstAttr::Float(v) => *v as i64,
                }),
                Some(Type::Scalar(e)) => RtValue::Scalar(round_to(*e, attr.as_f64())),
                Some(Type::Vector(v)) => RtValue::Vector {
                    shape: v.shape.clone(),
                    data: vec![round_to(v.elem, attr.as_f64()); v.num_elements()],
                },
                _ => return Err(mismatch("const", "unsupported constant type".to_string())),
            },
            OpKind::AddI => RtValue::Index(self.get_index(ops[0])? + self.get_index(ops[1])?),
            OpKind::MulI => RtValue::Index(self.get_index(ops[0])? * self.get_index(ops[1])?),
            OpKind::Cast => {
                let elem = result_ty
                    .and_then(Type::elem)
                    .ok_or_else(|| mismatch("cast", "no result".into()))?;
                match self.get(ops[0])?.clone() {
                    RtValue::Vector { shape, data } => RtValue::Vector {
                        shape,
                        data: data.into_iter().map(|v| round_to(elem, v)).collect(),
                    },
                    RtValue::Scalar(v) => RtValue::Scalar(round_to(elem, v)),
                    other => return Err(mismatch("cast", format!("cannot cast {:?}", other))),
                }
            }
            OpKind::Alloca => {
                let Some(Type::MemRef(m)) = result_ty else {
                    return Err(mismatch("alloca", "result is not a memref".into()));
                };
                self.buffers.push(Buffer::zeros(m.shape.clone(), m.elem));
                RtValue::MemRef(self.buffers.len() - 1)
            }
            OpKind::Read { masked, packed } => {
                let Some(Type::Vector(v)) = result_ty else {
                    return Err(mismatch("read", "result is not a vector".into()));
                };
                let buf = &self.buffers[self.get_buffer_idx(ops[0])?];
                let base = self.get_indices(&ops[1..])?;
                let data = if *packed {
                    read_packed(buf, &base, &v.shape)?
                } else {
                    read_dense(buf, &base, &v.shape, *masked)?
                };
                RtValue::Vector { shape: v.shape.clone(), data }
            }
            OpKind::Write { masked } => {
                let (shape, values) = self.get_vector(ops[0])?;
                let buf_idx = self.get_buffer_idx(ops[1])?;
                let base = self.get_indices(&ops[2..])?;
                write_dense(&mut self.buffers[buf_idx], &base, &shape, &values, *masked)?;
                return Ok(Vec::new());
            }
            OpKind::Extract { pos } => {
                let (shape, values) = self.get_vector(ops[0])?;
                let row: i64 = shape[1..].iter().product();
                if *pos < 0 || *pos >= shape[0] {
                    return Err(out_of_bounds(vec![*pos], vec![1], shape));
                }
                let start = (*pos * row) as usize;
                let data = values[start..start + row as usize].to_vec();
                RtValue::Vector { shape: shape[1..].to_vec(), data }
            }
            OpKind::Interleave => {
                let (shape, lhs) = self.get_vector(ops[0])?;
                let (_, rhs) = self.get_vector(ops[1])?;
                let data = lhs.iter().zip(&rhs).flat_map(|(&a, &b)| [a, b]).collect();
                RtValue::Vector { shape: vec![shape[0] * 2], data }
            }
            OpKind::Prefetch => return Ok(Vec::new()),
            OpKind::TileZero => {
                let Some(Type::Tile(t)) = result_ty else {
                    return Err(mismatch("tile_zero", "result is not a tile".into()));
                };
                let data = vec![0.0; t.num_elements()];
                RtValue::Tile { rows: t.shape[0], cols: t.shape[1], data }
            }
            OpKind::TileLoad => {
                let Some(Type::Tile(t)) = result_ty else {
                    return Err(mismatch("tile_load", "result is not a tile".into()));
                };
                let buf = &self.buffers[self.get_buffer_idx(ops[0])?];
                let base = self.get_indices(&ops[1..])?;
                let data = read_dense(buf, &base, &t.shape, false)?;
                RtValue::Tile { rows: t.shape[0], cols: t.shape[1], data }
            }
            OpKind::TileStore => {
                let (rows, cols, values) = self.get_tile(ops[0])?;
                let buf_idx = self.get_buffer_idx(ops[1])?;
                let base = self.get_indices(&ops[2..])?;
                write_dense(&mut self.buffers[buf_idx], &base, &[rows, cols], &values, false)?;
                return Ok(Vec::new());
            }
            OpKind::TileMulF | OpKind::TileMulI => {
                let elem = result_ty
                    .and_then(Type::elem)
                    .ok_or_else(|| mismatch("tile_mul", "no result".into()))?;
                let a = self.get_tile(ops[0])?;
                let b = self.get_tile(ops[1])?;
                let (rows, cols, acc) = self.get_tile(ops[2])?;
                RtValue::Tile { rows, cols, data: tile_multiply(a, b, (rows, cols, acc), elem)? }
            }
            OpKind::Dot => {
                let elem = result_ty
                    .and_then(Type::elem)
                    .ok_or_else(|| mismatch("dot", "no result".into()))?;
                let (lhs_shape, lhs) = self.get_vector(ops[0])?;
                let (_, rhs) = self.get_vector(ops[1])?;
                let (acc_shape, acc) = self.get_vector(ops[2])?;
                let (m, k, n) = (lhs_shape[0], lhs_shape[1], acc_shape[1]);
                let mut out = Vec::with_capacity(acc.len());
                for i in 0..m {
                    for j in 0..n {
                        let mut sum = acc[(i * n + j) as usize];
                        for p in 0..k {
                            sum += lhs[(i * k + p) as usize] * rhs[(p * n + j) as usize];
                        }
                        out.push(round_to(elem, sum));
                    }
                }
                RtValue::Vector { shape: acc_shape, data: out }
            }
            OpKind::For => return self.exec_for(op),
            OpKind::Func { .. } | OpKind::Yield | OpKind::Return => {
                return Err(mismatch(data.kind.name(), "not executable here".into()));
            }
        };
        Ok(vec![value])
    }

    fn exec_for(&mut self, op: OpId) -> Result<Vec<RtValue>, InterpError> {
        let module = self.module;
        let data = module.op(op);
        let lower = self.get_index(data.operands[0])?;
        let upper = self.get_index(data.operands[1])?;
        let step = self.get_index(data.operands[2])?;
        if step <= 0 {
            return Err(mismatch("for", format!("non-positive step {}", step)));
        }
        let mut iters: Vec<RtValue> = data.operands[3..]
            .iter()
            .map(|&v| self.get(v).cloned())
            .collect::<Result<_, _>>()?;

        let mut iv = lower;
        while iv < upper {
            let mut args = vec![RtValue::Index(iv)];
            args.extend(iters);
            iters = self.exec_block(data.regions[0], args)?;
            iv += step;
        }
        Ok(iters)
    }
}

fn mismatch(op: &'static str, reason: String) -> InterpError {
    InterpError::TypeMismatch { op, reason }
}

fn out_of_bounds(indices: Vec<i64>, extent: Vec<i64>, shape: Vec<i64>) -> InterpError {
    InterpError::OutOfBounds { indices, extent, shape }
}

/// Visit every element of a `shape`-sized window whose origin is `base`. The
/// window covers the trailing dimensions of the buffer.
fn window_offsets(buf: &Buffer, base: &[i64], shape: &[i64]) -> Vec<Option<usize>> {
    let lead = base.len() - shape.len();
    let total: i64 = shape.iter().product();
    let mut out = Vec::with_capacity(total as usize);
    let mut pos = vec![0i64; shape.len()];
    for _ in 0..total {
        let mut indices = base[..lead].to_vec();
        indices.extend(base[lead..].iter().zip(&pos).map(|(b, p)| b + p));
        out.push(buf.offset(&indices));
        for d in (0..shape.len()).rev() {
            pos[d] += 1;
            if pos[d] < shape[d] {
                break;
            }
            pos[d] = 0;
        }
    }
    out
}

fn rank_mismatch(op: &'static str, base: &[i64], buf: &Buffer) -> InterpError {
    mismatch(op, format!("{} indices for a rank-{} buffer", base.len(), buf.shape.len()))
}

fn read_dense(
    buf: &Buffer,
    base: &[i64],
    shape: &[i64],
    masked: bool,
) -> Result<Vec<f64>, InterpError> {
    if base.len() != buf.shape.len() || shape.len() > base.len() {
        return Err(rank_mismatch("read", base, buf));
    }
    window_offsets(buf, base, shape)
        .into_iter()
        .map(|off| match off {
            Some(off) => Ok(buf.data[off]),
            None if masked => Ok(0.0),
            None => Err(out_of_bounds(base.to_vec(), shape.to_vec(), buf.shape.clone())),
        })
        .collect()
}

fn write_dense(
    buf: &mut Buffer,
    base: &[i64],
    shape: &[i64],
    values: &[f64],
    masked: bool,
) -> Result<(), InterpError> {
    if base.len() != buf.shape.len() || shape.len() > base.len() {
        return Err(rank_mismatch("write", base, buf));
    }
    let offsets = window_offsets(buf, base, shape);
    if !masked && offsets.iter().any(Option::is_none) {
        return Err(out_of_bounds(base.to_vec(), shape.to_vec(), buf.shape.clone()));
    }
    let elem = buf.elem;
    for (off, &v) in offsets.into_iter().zip(values) {
        if let Some(off) = off {
            buf.data[off] = round_to(elem, v);
        }
    }
    Ok(())
}

/// Read a logical `K x N` value from memory holding its packed layout
/// (`K/g x N*g`, `g = 32 / bitwidth`).
fn read_packed(buf: &Buffer, base: &[i64], shape: &[i64]) -> Result<Vec<f64>, InterpError> {
    if shape.len() != 2 || base.len() != 2 || buf.shape.len() != 2 {
        return Err(mismatch("read", "packed reads are 2-D only".into()));
    }
    let group = 32 / buf.elem.bit_width() as i64;
    let (k, n) = (shape[0], shape[1]);
    let mut out = Vec::with_capacity((k * n) as usize);
    for row in 0..k {
        for col in 0..n {
            let idx = [base[0] + row / group, base[1] + col * group + row % group];
            let off = buf.offset(&idx).ok_or_else(|| {
                out_of_bounds(base.to_vec(), vec![k / group, n * group], buf.shape.clone())
            })?;
            out.push(buf.data[off]);
        }
    }
    Ok(out)
}

/// Packed tile multiply: `c[m][n] += sum_k a[m][k] * b[k/g][n*g + k%g]`.
fn tile_multiply(
    a: (i64, i64, Vec<f64>),
    b: (i64, i64, Vec<f64>),
    c: (i64, i64, Vec<f64>),
    elem: ElemType,
) -> Result<Vec<f64>, InterpError> {
    let (m, k, a) = a;
    let (b_rows, b_cols, b) = b;
    let (c_rows, n, mut c) = c;
    if c_rows != m || b_cols % n != 0 || b_rows * (b_cols / n) != k {
        return Err(mismatch(
            "tile_mul",
            format!("incompatible tiles {}x{} * {}x{} -> {}x{}", m, k, b_rows, b_cols, c_rows, n),
        ));
    }
    let group = b_cols / n;
    for i in 0..m {
        for j in 0..n {
            let mut sum = c[(i * n + j) as usize];
            for p in 0..k {
                let packed = (p / group) * b_cols + j * group + p % group;
                sum += a[(i * k + p) as usize] * b[packed as usize];
            }
            c[(i * n + j) as usize] = round_to(elem, sum);
        }
    }
    Ok(c)
}
