//! Structured SSA IR the AMX lowering operates on.
//!
//! The IR is deliberately small: a module holds `func` operations, every
//! function has a single body block, and the only control flow is the
//! counted `for` loop whose body block carries the induction variable and the
//! loop-carried values as block arguments. All nodes live in arenas inside
//! [`Module`] and are addressed by [`OpId`], [`ValueId`] and [`BlockId`].
//! Erased operations stay in the arena as tombstones, so an identifier never
//! starts pointing at a different node.
//!
//! # Text Format
//!
//! ```text
//! ; Comments start with semicolon
//! func @matmul(%a: memref<16x32xbf16>, %b: memref<32x16xbf16>, %c: memref<16x16xf32>) {
//!   %c0 = const 0 : index
//!   %lhs = read %a[%c0, %c0] : vector<16x32xbf16>
//!   %rhs = read %b[%c0, %c0] : vector<32x16xbf16>
//!   %acc = read %c[%c0, %c0] : vector<16x16xf32>
//!   %res = dot %lhs, %rhs, %acc : vector<16x16xf32>
//!   write %res, %c[%c0, %c0]
//!   return
//! }
//! ```

use std::fmt;

use crate::core::error::{IrError, IrResult};

pub mod check;
pub mod interp;
pub mod parser;
pub mod rewriter;
pub mod types;

pub use check::{CheckDirective, TestRunner, TestSpec};
pub use interp::{Buffer, Interpreter, RtValue};
pub use rewriter::{InsertPoint, Rewriter};
pub use types::{ElemType, ShapedKind, ShapedType, Type};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// Constant payload. Vector constants are splats of this value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstAttr {
    Int(i64),
    Float(f64),
}

impl ConstAttr {
    pub fn is_zero(self) -> bool {
        match self {
            ConstAttr::Int(v) => v == 0,
            ConstAttr::Float(v) => v == 0.0,
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            ConstAttr::Int(v) => v as f64,
            ConstAttr::Float(v) => v,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    Func { name: String },
    Constant(ConstAttr),
    AddI,
    MulI,
    /// Element type conversion, the result type names the target.
    Cast,
    /// Scratch memory, zero initialized.
    Alloca,
    /// Operands: `[memref, indices...]`. `packed` means the memory holds the
    /// row-interleaved layout of the logical value being read.
    Read { masked: bool, packed: bool },
    /// Operands: `[value, memref, indices...]`.
    Write { masked: bool },
    /// Extracts row `pos` of a 2-D vector.
    Extract { pos: i64 },
    /// Element-wise interleave of two 1-D vectors.
    Interleave,
    /// Operands: `[memref, indices...]`.
    Prefetch,
    TileZero,
    /// Operands: `[memref, indices...]`.
    TileLoad,
    /// Operands: `[tile, memref, indices...]`.
    TileStore,
    TileMulF,
    TileMulI,
    /// Operands: `[lower, upper, step, inits...]`; one body region whose block
    /// arguments are `[iv, iter_args...]`.
    For,
    Yield,
    Return,
    /// Operands: `[lhs, rhs, acc]`.
    Dot,
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        use OpKind::*;
        match self {
            Func { .. } => "func",
            Constant(_) => "const",
            AddI => "addi",
            MulI => "muli",
            Cast => "cast",
            Alloca => "alloca",
            Read { .. } => "read",
            Write { .. } => "write",
            Extract { .. } => "extract",
            Interleave => "interleave",
            Prefetch => "prefetch",
            TileZero => "tile_zero",
            TileLoad => "tile_load",
            TileStore => "tile_store",
            TileMulF => "tile_mulf",
            TileMulI => "tile_muli",
            For => "for",
            Yield => "yield",
            Return => "return",
            Dot => "dot",
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(self, OpKind::Yield | OpKind::Return)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueDef {
    OpResult { op: OpId, index: u32 },
    BlockArg { block: BlockId, index: u32 },
}

#[derive(Debug, Clone)]
pub struct ValueData {
    pub ty: Type,
    pub def: ValueDef,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OpData {
    pub kind: OpKind,
    pub operands: Vec<ValueId>,
    pub results: Vec<ValueId>,
    pub regions: Vec<BlockId>,
    pub parent: Option<BlockId>,
    pub erased: bool,
}

#[derive(Debug, Clone)]
pub struct BlockData {
    pub args: Vec<ValueId>,
    pub ops: Vec<OpId>,
    pub parent: Option<OpId>,
}

/// Arena holding every operation, value and block of a compilation unit.
#[derive(Debug, Clone)]
pub struct Module {
    ops: Vec<OpData>,
    values: Vec<ValueData>,
    blocks: Vec<BlockData>,
    top: BlockId,
}

impl Module {
    pub fn new() -> Self {
        Self {
            ops: Vec::new(),
            values: Vec::new(),
            blocks: vec![BlockData { args: Vec::new(), ops: Vec::new(), parent: None }],
            top: BlockId(0),
        }
    }

    pub fn parse(text: &str) -> IrResult<Self> {
        parser::parse_module(text)
    }

    /// Block holding the module's functions.
    pub fn top_block(&self) -> BlockId {
        self.top
    }

    pub fn op(&self, op: OpId) -> &OpData {
        &self.ops[op.0 as usize]
    }

    pub(crate) fn op_mut(&mut self, op: OpId) -> &mut OpData {
        &mut self.ops[op.0 as usize]
    }

    pub fn block(&self, block: BlockId) -> &BlockData {
        &self.blocks[block.0 as usize]
    }

    pub(crate) fn block_mut(&mut self, block: BlockId) -> &mut BlockData {
        &mut self.blocks[block.0 as usize]
    }

    pub fn value(&self, value: ValueId) -> &ValueData {
        &self.values[value.0 as usize]
    }

    pub fn value_type(&self, value: ValueId) -> &Type {
        &self.values[value.0 as usize].ty
    }

    pub fn set_value_name(&mut self, value: ValueId, name: impl Into<String>) {
        self.values[value.0 as usize].name = Some(name.into());
    }

    /// Operation producing `value`, `None` for block arguments.
    pub fn defining_op(&self, value: ValueId) -> Option<OpId> {
        match self.value(value).def {
            ValueDef::OpResult { op, .. } => Some(op),
            ValueDef::BlockArg { .. } => None,
        }
    }

    /// Operation owning the block that contains `op`.
    pub fn parent_op(&self, op: OpId) -> Option<OpId> {
        self.op(op).parent.and_then(|b| self.block(b).parent)
    }

    pub fn op_position(&self, op: OpId) -> Option<usize> {
        let block = self.op(op).parent?;
        self.block(block).ops.iter().position(|&o| o == op)
    }

    // =========================================================================
    // Construction
    // =========================================================================

    pub fn add_block(&mut self, parent: Option<OpId>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BlockData { args: Vec::new(), ops: Vec::new(), parent });
        id
    }

    pub fn add_block_arg(&mut self, block: BlockId, ty: Type) -> ValueId {
        let index = self.block(block).args.len() as u32;
        let value = self.push_value(ty, ValueDef::BlockArg { block, index });
        self.block_mut(block).args.push(value);
        value
    }

    fn push_value(&mut self, ty: Type, def: ValueDef) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(ValueData { ty, def, name: None });
        id
    }

    /// Create a detached operation. It becomes visible once inserted.
    pub fn create_op(
        &mut self,
        kind: OpKind,
        operands: Vec<ValueId>,
        result_types: Vec<Type>,
    ) -> OpId {
        let id = OpId(self.ops.len() as u32);
        self.ops.push(OpData {
            kind,
            operands,
            results: Vec::new(),
            regions: Vec::new(),
            parent: None,
            erased: false,
        });
        let results = result_types
            .into_iter()
            .enumerate()
            .map(|(index, ty)| {
                self.push_value(ty, ValueDef::OpResult { op: id, index: index as u32 })
            })
            .collect();
        self.op_mut(id).results = results;
        id
    }

    pub fn insert_op(&mut self, op: OpId, block: BlockId, pos: usize) {
        self.op_mut(op).parent = Some(block);
        self.block_mut(block).ops.insert(pos, op);
    }

    pub fn append_op(&mut self, op: OpId, block: BlockId) {
        let pos = self.block(block).ops.len();
        self.insert_op(op, block, pos);
    }

    /// Create a function with the given argument types and an empty body.
    pub fn add_func(&mut self, name: &str, arg_types: Vec<Type>) -> OpId {
        let func = self.create_op(OpKind::Func { name: name.to_string() }, Vec::new(), Vec::new());
        let body = self.add_block(Some(func));
        self.op_mut(func).regions.push(body);
        for ty in arg_types {
            self.add_block_arg(body, ty);
        }
        let top = self.top;
        self.append_op(func, top);
        func
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn funcs(&self) -> Vec<OpId> {
        self.block(self.top).ops.clone()
    }

    pub fn func_by_name(&self, name: &str) -> Option<OpId> {
        self.block(self.top)
            .ops
            .iter()
            .copied()
            .find(|&f| matches!(&self.op(f).kind, OpKind::Func { name: n } if n == name))
    }

    pub fn func_body(&self, func: OpId) -> BlockId {
        self.op(func).regions[0]
    }

    pub fn func_args(&self, func: OpId) -> &[ValueId] {
        &self.block(self.func_body(func)).args
    }

    /// Every attached operation in pre-order (an op before the ops nested in
    /// its regions), in block order.
    pub fn walk(&self) -> Vec<OpId> {
        let mut out = Vec::new();
        self.walk_block(self.top, &mut out);
        out
    }

    /// Pre-order walk of the ops nested inside `block`.
    pub fn walk_block(&self, block: BlockId, out: &mut Vec<OpId>) {
        for &op in &self.block(block).ops {
            out.push(op);
            for &region in &self.op(op).regions {
                self.walk_block(region, out);
            }
        }
    }

    /// All `(user, operand index)` pairs reading `value`.
    pub fn uses(&self, value: ValueId) -> Vec<(OpId, usize)> {
        let mut uses = Vec::new();
        for op in self.walk() {
            for (idx, &operand) in self.op(op).operands.iter().enumerate() {
                if operand == value {
                    uses.push((op, idx));
                }
            }
        }
        uses
    }

    pub fn has_one_use(&self, value: ValueId) -> bool {
        self.uses(value).len() == 1
    }

    pub fn use_empty(&self, value: ValueId) -> bool {
        self.uses(value).is_empty()
    }

    /// Whether `op` is nested (at any depth) inside `ancestor`'s regions.
    pub fn is_proper_ancestor(&self, ancestor: OpId, op: OpId) -> bool {
        let mut cur = self.parent_op(op);
        while let Some(p) = cur {
            if p == ancestor {
                return true;
            }
            cur = self.parent_op(p);
        }
        false
    }

    /// Constant payload of `value` if it is produced by `const`.
    pub fn constant_of(&self, value: ValueId) -> Option<ConstAttr> {
        let op = self.defining_op(value)?;
        match self.op(op).kind {
            OpKind::Constant(attr) => Some(attr),
            _ => None,
        }
    }

    /// Number of attached operations of the given name.
    pub fn count_ops(&self, name: &str) -> usize {
        self.walk().into_iter().filter(|&op| self.op(op).kind.name() == name).count()
    }

    // =========================================================================
    // Verification
    // =========================================================================

    /// Check structural invariants: operands refer to live definitions and
    /// loop yields match the loop signature.
    pub fn verify(&self) -> IrResult<()> {
        for op in self.walk() {
            let data = self.op(op);
            for &operand in &data.operands {
                if !self.is_live_value(operand) {
                    return Err(IrError::DanglingOperand {
                        op: data.kind.name(),
                        value: operand.0,
                    });
                }
            }
            if data.kind == OpKind::For {
                let body = data.regions[0];
                let iter_count = data.operands.len() - 3;
                let args = self.block(body).args.len();
                if args != iter_count + 1 || data.results.len() != iter_count {
                    return Err(IrError::Malformed("loop signature mismatch".to_string()));
                }
                let yielded = self
                    .block(body)
                    .ops
                    .last()
                    .filter(|&&t| self.op(t).kind == OpKind::Yield)
                    .map(|&t| self.op(t).operands.len());
                if yielded != Some(iter_count) {
                    let reason = "loop yield does not match its results";
                    return Err(IrError::Malformed(reason.to_string()));
                }
            }
        }
        Ok(())
    }

    fn is_live_value(&self, value: ValueId) -> bool {
        match self.value(value).def {
            ValueDef::OpResult { op, .. } => !self.op(op).erased && self.op(op).parent.is_some(),
            ValueDef::BlockArg { block, .. } => {
                block == self.top || self.block(block).parent.is_some_and(|p| !self.op(p).erased)
            }
        }
    }
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Printing
// =============================================================================

/// Assigns printable names to values of one function.
struct Namer {
    names: hashbrown::HashMap<ValueId, String>,
    taken: hashbrown::HashSet<String>,
    next: usize,
}

impl Namer {
    fn new() -> Self {
        Self { names: hashbrown::HashMap::new(), taken: hashbrown::HashSet::new(), next: 0 }
    }

    fn assign(&mut self, module: &Module, value: ValueId) {
        let name = match &module.value(value).name {
            Some(n) if !self.taken.contains(n) => n.clone(),
            _ => loop {
                let candidate = self.next.to_string();
                self.next += 1;
                if !self.taken.contains(&candidate) {
                    break candidate;
                }
            },
        };
        self.taken.insert(name.clone());
        self.names.insert(value, name);
    }

    fn get(&self, value: ValueId) -> String {
        match self.names.get(&value) {
            Some(n) => format!("%{}", n),
            None => format!("%<unknown{}>", value.0),
        }
    }
}

impl Module {
    fn name_block(&self, block: BlockId, namer: &mut Namer) {
        for &arg in &self.block(block).args {
            namer.assign(self, arg);
        }
        for &op in &self.block(block).ops {
            for &res in &self.op(op).results {
                namer.assign(self, res);
            }
            for &region in &self.op(op).regions {
                self.name_block(region, namer);
            }
        }
    }

    fn print_block(&self, block: BlockId, namer: &Namer, indent: usize, out: &mut String) {
        for &op in &self.block(block).ops {
            self.print_op(op, namer, indent, out);
        }
    }

    fn print_op(&self, op: OpId, namer: &Namer, indent: usize, out: &mut String) {
        let data = self.op(op);
        let pad = "  ".repeat(indent);
        let list =
            |vals: &[ValueId]| vals.iter().map(|&v| namer.get(v)).collect::<Vec<_>>().join(", ");
        let access = |vals: &[ValueId]| format!("{}[{}]", namer.get(vals[0]), list(&vals[1..]));
        let store = |vals: &[ValueId]| format!(" {}, {}", namer.get(vals[0]), access(&vals[1..]));

        out.push_str(&pad);
        if !data.results.is_empty() {
            out.push_str(&list(&data.results));
            out.push_str(" = ");
        }
        out.push_str(data.kind.name());

        let result_ty = data.results.first().map(|&r| self.value_type(r).to_string());
        match &data.kind {
            OpKind::Func { .. } | OpKind::For => unreachable!("region ops are printed separately"),
            OpKind::Constant(attr) => match attr {
                ConstAttr::Int(v) => out.push_str(&format!(" {}", v)),
                ConstAttr::Float(v) => out.push_str(&format!(" {:?}", v)),
            },
            OpKind::Read { masked, packed } => {
                out.push_str(&format!(" {}", access(&data.operands)));
                push_flags(out, &[("masked", *masked), ("packed", *packed)]);
            }
            OpKind::Write { masked } => {
                out.push_str(&store(&data.operands));
                push_flags(out, &[("masked", *masked)]);
            }
            OpKind::Extract { pos } => {
                out.push_str(&format!(" {}[{}]", namer.get(data.operands[0]), pos));
            }
            OpKind::Prefetch | OpKind::TileLoad => {
                out.push_str(&format!(" {}", access(&data.operands)));
            }
            OpKind::TileStore => {
                out.push_str(&store(&data.operands));
            }
            _ => {
                if !data.operands.is_empty() {
                    out.push(' ');
                    out.push_str(&list(&data.operands));
                }
            }
        }
        if let Some(ty) = result_ty {
            out.push_str(" : ");
            out.push_str(&ty);
        }
        out.push('\n');
    }

    fn print_for(&self, op: OpId, namer: &Namer, indent: usize, out: &mut String) {
        let data = self.op(op);
        let body = data.regions[0];
        let args = &self.block(body).args;
        let pad = "  ".repeat(indent);
        out.push_str(&pad);
        if !data.results.is_empty() {
            let results: Vec<_> = data.results.iter().map(|&r| namer.get(r)).collect();
            out.push_str(&results.join(", "));
            out.push_str(" = ");
        }
        out.push_str(&format!(
            "for {} = {} to {} step {}",
            namer.get(args[0]),
            namer.get(data.operands[0]),
            namer.get(data.operands[1]),
            namer.get(data.operands[2])
        ));
        if data.operands.len() > 3 {
            let iters: Vec<_> = args[1..]
                .iter()
                .zip(&data.operands[3..])
                .map(|(&arg, &init)| {
                    format!("{} = {} : {}", namer.get(arg), namer.get(init), self.value_type(init))
                })
                .collect();
            out.push_str(&format!(" iter({})", iters.join(", ")));
        }
        out.push_str(" {\n");
        self.print_region_block(body, namer, indent + 1, out);
        out.push_str(&pad);
        out.push_str("}\n");
    }

    fn print_region_block(&self, block: BlockId, namer: &Namer, indent: usize, out: &mut String) {
        for &op in &self.block(block).ops {
            if self.op(op).kind == OpKind::For {
                self.print_for(op, namer, indent, out);
            } else {
                self.print_op(op, namer, indent, out);
            }
        }
    }

    /// Render the module in its text form.
    pub fn print(&self) -> String {
        let mut out = String::new();
        for func in self.funcs() {
            let OpKind::Func { name } = &self.op(func).kind else {
                continue;
            };
            let body = self.func_body(func);
            let mut namer = Namer::new();
            self.name_block(body, &mut namer);
            let args: Vec<_> = self
                .block(body)
                .args
                .iter()
                .map(|&a| format!("{}: {}", namer.get(a), self.value_type(a)))
                .collect();
            out.push_str(&format!("func @{}({}) {{\n", name, args.join(", ")));
            self.print_region_block(body, &namer, 1, &mut out);
            out.push_str("}\n");
        }
        out
    }
}

fn push_flags(out: &mut String, flags: &[(&str, bool)]) {
    let set: Vec<_> = flags.iter().filter(|(_, on)| *on).map(|(name, _)| *name).collect();
    if !set.is_empty() {
        out.push_str(&format!(" {{{}}}", set.join(", ")));
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.print())
    }
}
