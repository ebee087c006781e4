// This module lowers `dot` operations over 2-D vectors to Intel AMX tile operations. The
// analysis half (candidate, with the type legalizer and the tile/block size planner) decides
// per dot whether the accelerator can take it and with which tile geometry. The conversion
// half prepares memory for the operands in the layout the tile multiply expects (buffer,
// layout), emits the blocked nest of tile loads, multiplies and stores (tiles), and rewrites
// an enclosing loop when the accumulator is carried through it (loops). The pass module ties
// both halves together: walk the module once, collect candidates, convert them in discovery
// order, and isolate failures so one bad candidate never affects the next.

//! Dot-to-AMX legalization.
//!
//! ## Analysis
//! - `candidate`: feasibility checks, legalized tile element types, tile and
//!   block sizes, accumulator mode and direct output buffer
//!
//! ## Conversion
//! - `layout`: row interleaving ("packing") for the RHS operand
//! - `common`: memory buffer descriptors and small IR helpers
//! - `buffer`: operand and result buffer preparation
//! - `tiles`: tile load/store and blocked multiply emission
//! - `loops`: loop-carried accumulator detection and loop extension
//! - `convert`: per-candidate rewrite
//! - `pass`: module-level driver

use std::fmt;
use std::str::FromStr;

use crate::core::error::OptionsError;

pub mod buffer;
pub mod candidate;
pub mod common;
pub mod convert;
pub mod layout;
pub mod loops;
pub mod pass;
pub mod tiles;

pub use candidate::{analyze_dot, AccMode, AmxDotCandidate, Rejection};
pub use common::MemBuffer;
pub use pass::{ConvertDotToAmx, PassReport};
pub use tiles::MulKind;

/// Hardware capabilities the lowering may target.
///
/// All switches default to off, in which case the pass does nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AmxOptions {
    /// AMX-INT8: `i8 x i8 -> i32` multiplies.
    pub convert_int8: bool,
    /// AMX-FP16.
    pub convert_fp16: bool,
    /// AMX-BF16.
    pub convert_bf16: bool,
}

impl AmxOptions {
    pub fn all() -> Self {
        Self { convert_int8: true, convert_fp16: true, convert_bf16: true }
    }

    pub fn any(&self) -> bool {
        self.convert_int8 || self.convert_fp16 || self.convert_bf16
    }
}

/// Parses `"convert-int8=true convert-bf16=1"`. Options may be separated by
/// whitespace or commas; a bare option name enables it.
impl FromStr for AmxOptions {
    type Err = OptionsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut options = AmxOptions::default();
        for item in s.split(|c: char| c.is_whitespace() || c == ',').filter(|t| !t.is_empty()) {
            let (name, value) = item.split_once('=').unwrap_or((item, "true"));
            let enabled = match value {
                "true" | "1" => true,
                "false" | "0" => false,
                _ => {
                    return Err(OptionsError::InvalidValue {
                        option: name.to_string(),
                        value: value.to_string(),
                    })
                }
            };
            match name {
                "convert-int8" => options.convert_int8 = enabled,
                "convert-fp16" => options.convert_fp16 = enabled,
                "convert-bf16" => options.convert_bf16 = enabled,
                _ => return Err(OptionsError::UnknownOption(name.to_string())),
            }
        }
        Ok(options)
    }
}

impl fmt::Display for AmxOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "convert-int8={} convert-fp16={} convert-bf16={}",
            self.convert_int8, self.convert_fp16, self.convert_bf16
        )
    }
}
