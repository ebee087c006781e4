//! amx-legalize - Dot-to-AMX lowering.
//!
//! Lowers matrix-multiply-accumulate (`dot`) operations over 2-D vectors to
//! Intel AMX tile operations: tile loads, tile multiplies and tile stores,
//! with the RHS operand in the row-interleaved layout the hardware multiply
//! reads. Dots that the accelerator cannot take are left untouched.
//!
//! # Primary Usage
//!
//! ```ignore
//! use amx_legalize::amx::{AmxOptions, ConvertDotToAmx};
//! use amx_legalize::core::PassSession;
//! use amx_legalize::ir::Module;
//! use bumpalo::Bump;
//!
//! let mut module = Module::parse(text)?;
//! let arena = Bump::new();
//! let session = PassSession::new(&arena);
//! let report = ConvertDotToAmx::new(AmxOptions::all()).run(&mut module, &session);
//! println!("{}", module);
//! ```
//!
//! # Architecture
//!
//! - [`ir`] - Structured SSA IR, parser, printer, rewriter and interpreter
//! - [`amx`] - Candidate analysis and conversion
//! - [`core`] - Shared infrastructure (session, errors)

pub mod amx;
pub mod core;
pub mod ir;

pub use amx::{AccMode, AmxDotCandidate, AmxOptions, ConvertDotToAmx, PassReport, Rejection};
pub use core::{ConvertError, IrError, PassSession, PassStats};
pub use ir::Module;
