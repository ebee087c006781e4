// This module groups the infrastructure shared by the IR and the AMX lowering: error types
// built with thiserror and the arena-backed pass session that collects candidates and
// statistics for one run of the pass.

//! Core infrastructure.
//!
//! ## Session Management (`session`)
//! - Arena-based storage of per-run pass data using `bumpalo`
//! - Pass statistics (candidates, rejections, conversions)
//!
//! ## Errors (`error`)
//! - `IrError`, `ConvertError`, `InterpError`, `OptionsError`

pub mod error;
pub mod session;

pub use error::{ConvertError, ConvertResult, InterpError, IrError, IrResult, OptionsError};
pub use session::{PassSession, PassStats};
