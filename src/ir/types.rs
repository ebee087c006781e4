//! Types of the structured IR.
//!
//! Only what the AMX lowering needs is modelled: an index type, scalar
//! element types, and three shaped types sharing the same `shape x elem`
//! syntax (`vector`, `memref` and `tile`).

use std::fmt;

/// Scalar element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElemType {
    I8,
    I16,
    I32,
    I64,
    F8E5M2,
    F8E4M3,
    F16,
    BF16,
    F32,
    F64,
}

impl ElemType {
    pub const fn bit_width(self) -> u32 {
        use ElemType::*;
        match self {
            I8 | F8E5M2 | F8E4M3 => 8,
            I16 | F16 | BF16 => 16,
            I32 | F32 => 32,
            I64 | F64 => 64,
        }
    }

    pub const fn is_integer(self) -> bool {
        matches!(self, ElemType::I8 | ElemType::I16 | ElemType::I32 | ElemType::I64)
    }

    pub const fn is_float(self) -> bool {
        !self.is_integer()
    }

    pub const fn name(self) -> &'static str {
        use ElemType::*;
        match self {
            I8 => "i8",
            I16 => "i16",
            I32 => "i32",
            I64 => "i64",
            F8E5M2 => "f8E5M2",
            F8E4M3 => "f8E4M3",
            F16 => "f16",
            BF16 => "bf16",
            F32 => "f32",
            F64 => "f64",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        use ElemType::*;
        match s {
            "i8" => Some(I8),
            "i16" => Some(I16),
            "i32" => Some(I32),
            "i64" => Some(I64),
            "f8E5M2" => Some(F8E5M2),
            "f8E4M3" => Some(F8E4M3),
            "f16" => Some(F16),
            "bf16" => Some(BF16),
            "f32" => Some(F32),
            "f64" => Some(F64),
            _ => None,
        }
    }
}

impl fmt::Display for ElemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which family of shaped type a [`ShapedType`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShapedKind {
    Vector,
    MemRef,
    Tile,
}

impl ShapedKind {
    pub const fn keyword(self) -> &'static str {
        match self {
            ShapedKind::Vector => "vector",
            ShapedKind::MemRef => "memref",
            ShapedKind::Tile => "tile",
        }
    }
}

/// Shape plus element type. Dimensions are always static.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShapedType {
    pub shape: Vec<i64>,
    pub elem: ElemType,
}

impl ShapedType {
    pub fn new(shape: impl Into<Vec<i64>>, elem: ElemType) -> Self {
        Self { shape: shape.into(), elem }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn dim(&self, idx: usize) -> i64 {
        self.shape[idx]
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product::<i64>() as usize
    }

    /// Same shape, different element type.
    pub fn with_elem(&self, elem: ElemType) -> Self {
        Self { shape: self.shape.clone(), elem }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Index,
    Scalar(ElemType),
    Vector(ShapedType),
    MemRef(ShapedType),
    Tile(ShapedType),
}

impl Type {
    pub fn vector(shape: impl Into<Vec<i64>>, elem: ElemType) -> Self {
        Type::Vector(ShapedType::new(shape, elem))
    }

    pub fn memref(shape: impl Into<Vec<i64>>, elem: ElemType) -> Self {
        Type::MemRef(ShapedType::new(shape, elem))
    }

    pub fn tile(shape: impl Into<Vec<i64>>, elem: ElemType) -> Self {
        Type::Tile(ShapedType::new(shape, elem))
    }

    pub fn shaped(kind: ShapedKind, shaped: ShapedType) -> Self {
        match kind {
            ShapedKind::Vector => Type::Vector(shaped),
            ShapedKind::MemRef => Type::MemRef(shaped),
            ShapedKind::Tile => Type::Tile(shaped),
        }
    }

    pub fn as_vector(&self) -> Option<&ShapedType> {
        match self {
            Type::Vector(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_memref(&self) -> Option<&ShapedType> {
        match self {
            Type::MemRef(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_tile(&self) -> Option<&ShapedType> {
        match self {
            Type::Tile(t) => Some(t),
            _ => None,
        }
    }

    /// Element type of a scalar or shaped type.
    pub fn elem(&self) -> Option<ElemType> {
        match self {
            Type::Index => None,
            Type::Scalar(e) => Some(*e),
            Type::Vector(s) | Type::MemRef(s) | Type::Tile(s) => Some(s.elem),
        }
    }
}

impl fmt::Display for ShapedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for dim in &self.shape {
            write!(f, "{}x", dim)?;
        }
        write!(f, "{}", self.elem)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Index => f.write_str("index"),
            Type::Scalar(e) => write!(f, "{}", e),
            Type::Vector(s) => write!(f, "vector<{}>", s),
            Type::MemRef(s) => write!(f, "memref<{}>", s),
            Type::Tile(s) => write!(f, "tile<{}>", s),
        }
    }
}
