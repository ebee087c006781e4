// This module defines error types for the AMX legalization crate using the thiserror crate
// for idiomatic Rust error handling. IrError covers structural problems with the IR itself:
// text parse failures (with byte position), dangling operands, malformed loops, and attempts
// to erase operations whose results are still used. ConvertError is reported when a dot that
// already qualified as an AMX candidate could not be rewritten; the pass logs it, restores the
// module and moves on to the next candidate. InterpError is produced by the reference
// interpreter used for numeric-equivalence testing, and OptionsError by the pass-option
// string parser. Convenience aliases IrResult<T> and
// ConvertResult<T> keep signatures short throughout the crate.

//! Error types for the AMX legalization crate.
//!
//! Using thiserror for more idiomatic error handling.

use thiserror::Error;

/// Structural IR errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IrError {
    #[error("Parse error at byte {pos}: {message}")]
    Parse {
        pos: usize,
        message: String,
    },

    #[error("Operand %{value} of '{op}' has no live definition")]
    DanglingOperand {
        op: &'static str,
        value: u32,
    },

    #[error("Cannot erase '{op}': its results still have {uses} use(s)")]
    EraseWithUses {
        op: &'static str,
        uses: usize,
    },

    #[error("Cannot insert before '{op}': it is not in a block")]
    DetachedAnchor {
        op: &'static str,
    },

    #[error("Malformed IR: {0}")]
    Malformed(String),
}

/// Failure to rewrite an accepted candidate.
#[derive(Error, Debug)]
pub enum ConvertError {
    #[error(transparent)]
    Ir(#[from] IrError),

    #[error("Loop-carried accumulator expects an enclosing 'for', found {found}")]
    NotInLoop {
        found: &'static str,
    },

    #[error("Unexpected IR structure: {reason}")]
    UnexpectedStructure {
        reason: String,
    },
}

/// Errors raised while interpreting IR.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InterpError {
    #[error("Function not found: {name}")]
    FunctionNotFound {
        name: String,
    },

    #[error("Function expects {expected} argument(s), got {got}")]
    ArgumentCount {
        expected: usize,
        got: usize,
    },

    #[error("Access {indices:?} with extent {extent:?} is out of bounds for shape {shape:?}")]
    OutOfBounds {
        indices: Vec<i64>,
        extent: Vec<i64>,
        shape: Vec<i64>,
    },

    #[error("Type mismatch in '{op}': {reason}")]
    TypeMismatch {
        op: &'static str,
        reason: String,
    },

    #[error("Value %{0} used before definition")]
    Undefined(u32),
}

/// Errors parsing a pass-option string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OptionsError {
    #[error("Unknown option '{0}'")]
    UnknownOption(String),

    #[error("Invalid value '{value}' for option '{option}'")]
    InvalidValue {
        option: String,
        value: String,
    },
}

/// Result type alias for IR operations.
pub type IrResult<T> = Result<T, IrError>;

/// Result type alias for candidate conversion.
pub type ConvertResult<T> = Result<T, ConvertError>;
