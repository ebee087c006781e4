//! Module-level driver.
//!
//! The module is walked once and every accepted dot is collected before any
//! rewriting starts, so conversions never observe half-rewritten IR of an
//! earlier candidate through the walk. Candidates are then converted in
//! discovery order. A failed conversion is logged and rolled back; it never
//! affects the next candidate.

use log::{debug, info, warn};

use super::candidate::{analyze_dot, AmxDotCandidate};
use super::convert::convert_candidate;
use super::AmxOptions;
use crate::core::error::{ConvertError, ConvertResult};
use crate::core::session::PassSession;
use crate::ir::{Module, OpKind};

/// Outcome of one pass run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub candidates: usize,
    pub converted: usize,
    pub failed: usize,
    pub rejected: usize,
}

/// Lowers feasible `dot` operations to AMX tile operations.
#[derive(Debug, Clone, Default)]
pub struct ConvertDotToAmx {
    options: AmxOptions,
}

impl ConvertDotToAmx {
    pub fn new(options: AmxOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &AmxOptions {
        &self.options
    }

    /// Analyze every dot in walk order. Rejections are recorded in the
    /// session statistics and otherwise ignored.
    pub fn collect_candidates<'a>(
        &self,
        module: &Module,
        session: &PassSession<'a>,
    ) -> &'a [AmxDotCandidate] {
        let mut candidates = Vec::new();
        for op in module.walk() {
            if module.op(op).kind != OpKind::Dot {
                continue;
            }
            session.record_dot_visited();
            match analyze_dot(module, op, &self.options) {
                Ok(candidate) => {
                    debug!(
                        "candidate: dot op{} lhs={} rhs={} acc={} tile={}x{}x{} block={}x{} \
                         acc_mode={} out_buf={}",
                        op.0,
                        candidate.lhs_tile_elem_ty,
                        candidate.rhs_tile_elem_ty,
                        candidate.acc_tile_elem_ty,
                        candidate.tile_m,
                        candidate.tile_n,
                        candidate.tile_k,
                        candidate.tiles_in_block_m,
                        candidate.tiles_in_block_n,
                        candidate.acc_mode,
                        !candidate.out_buf.is_empty(),
                    );
                    session.record_candidate();
                    candidates.push(candidate);
                }
                Err(rejection) => {
                    debug!("dot op{} rejected: {}", op.0, rejection);
                    session.record_rejection(&rejection.to_string());
                }
            }
        }
        session.alloc_slice(&candidates)
    }

    /// Run the pass over `module`.
    pub fn run(&self, module: &mut Module, session: &PassSession<'_>) -> PassReport {
        if !self.options.any() {
            debug!("all AMX capabilities disabled, nothing to do");
            return PassReport::default();
        }

        let before = session.stats();
        let candidates = self.collect_candidates(module, session);
        let mut report = PassReport { candidates: candidates.len(), ..PassReport::default() };
        report.rejected = session.stats().rejected - before.rejected;

        for candidate in candidates {
            let snapshot = module.clone();
            match convert_checked(module, candidate) {
                Ok(tile_ops) => {
                    session.record_converted(tile_ops);
                    report.converted += 1;
                }
                Err(err) => {
                    warn!("failed to convert dot op{} to AMX: {}", candidate.op.0, err);
                    *module = snapshot;
                    session.record_failed();
                    report.failed += 1;
                }
            }
        }

        info!(
            "AMX legalization: {} candidate(s), {} converted, {} failed, {} rejected",
            report.candidates, report.converted, report.failed, report.rejected
        );
        report
    }
}

fn convert_checked(module: &mut Module, candidate: &AmxDotCandidate) -> ConvertResult<usize> {
    let tile_ops = convert_candidate(module, candidate)?;
    module.verify().map_err(ConvertError::from)?;
    Ok(tile_ops)
}
