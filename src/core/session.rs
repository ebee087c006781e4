// This module provides arena-based pass session management using the bumpalo crate. PassSession
// owns a reference to the arena that per-run pass data is moved into once it stops changing:
// the candidate list collected by the module walk is copied into an arena slice before
// conversion starts, and rejection reasons are interned as arena strings. The session also
// tracks pass statistics behind a RefCell so that the orchestrator can record outcomes while
// only holding a shared reference. PassStats counts dot operations visited, candidates
// accepted, rejections broken down by reason, successful and failed conversions, and the
// number of accelerator operations emitted. The Display implementation renders the summary
// printed by the amx-legalize --stats flag.

//! Arena-based pass session management.
//!
//! All per-run pass data is tied to the session lifetime, which keeps the
//! candidate list stable while the IR underneath it is being rewritten.

use std::cell::RefCell;
use std::fmt;

use bumpalo::Bump;
use hashbrown::{HashMap, HashSet};

/// Arena-based pass session.
pub struct PassSession<'arena> {
    /// Arena allocator for pass data.
    arena: &'arena Bump,

    /// Session statistics.
    stats: RefCell<PassStats<'arena>>,

    /// Interned rejection reasons.
    interned_strings: RefCell<HashSet<&'arena str>>,
}

impl<'arena> PassSession<'arena> {
    /// Create a new pass session with the given arena.
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(PassStats::default()),
            interned_strings: RefCell::new(HashSet::new()),
        }
    }

    /// Allocate a slice in the session arena.
    pub fn alloc_slice<T>(&self, slice: &[T]) -> &'arena [T]
    where
        T: Clone,
    {
        self.arena.alloc_slice_clone(slice)
    }

    /// Intern a string in the arena.
    pub fn intern_str(&self, s: &str) -> &'arena str {
        let mut strings = self.interned_strings.borrow_mut();
        if let Some(&interned) = strings.get(s) {
            return interned;
        }

        let interned = self.arena.alloc_str(s);
        strings.insert(interned);
        interned
    }

    /// Record that a dot operation was considered.
    pub fn record_dot_visited(&self) {
        self.stats.borrow_mut().dots_visited += 1;
    }

    /// Record an accepted candidate.
    pub fn record_candidate(&self) {
        self.stats.borrow_mut().candidates += 1;
    }

    /// Record a rejected dot operation together with the reason.
    pub fn record_rejection(&self, reason: &str) {
        let reason = self.intern_str(reason);
        let mut stats = self.stats.borrow_mut();
        stats.rejected += 1;
        *stats.rejection_counts.entry(reason).or_insert(0) += 1;
    }

    /// Record a successful conversion that emitted `tile_ops` accelerator ops.
    pub fn record_converted(&self, tile_ops: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.converted += 1;
        stats.tile_ops_emitted += tile_ops;
    }

    /// Record a failed conversion.
    pub fn record_failed(&self) {
        self.stats.borrow_mut().failed += 1;
    }

    /// Get pass statistics.
    pub fn stats(&self) -> PassStats<'arena> {
        self.stats.borrow().clone()
    }
}

/// Pass session statistics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassStats<'arena> {
    /// Number of dot operations walked.
    pub dots_visited: usize,

    /// Dots accepted as AMX candidates.
    pub candidates: usize,

    /// Dots left for the generic lowering.
    pub rejected: usize,

    /// Count of each rejection reason, keyed by the interned reason.
    pub rejection_counts: HashMap<&'arena str, usize>,

    /// Candidates rewritten successfully.
    pub converted: usize,

    /// Candidates whose rewrite failed and was rolled back.
    pub failed: usize,

    /// Tile loads, stores, zeroes and multiplies emitted.
    pub tile_ops_emitted: usize,
}

impl fmt::Display for PassStats<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "AMX Legalization Statistics:")?;
        writeln!(f, "  Dot operations visited: {}", self.dots_visited)?;
        writeln!(f, "  Candidates: {}", self.candidates)?;
        writeln!(f, "  Rejected: {}", self.rejected)?;
        writeln!(f, "  Converted: {}", self.converted)?;
        writeln!(f, "  Failed: {}", self.failed)?;
        writeln!(f, "  Tile operations emitted: {}", self.tile_ops_emitted)?;

        if !self.rejection_counts.is_empty() {
            writeln!(f, "  Rejection breakdown:")?;
            let mut sorted: Vec<_> = self.rejection_counts.iter().collect();
            sorted.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));

            for (reason, count) in sorted {
                writeln!(f, "    {}: {}", reason, count)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_session_creation() {
        let arena = Bump::new();
        let session = PassSession::new(&arena);

        let stats = session.stats();
        assert_eq!(stats.dots_visited, 0);
        assert_eq!(stats.candidates, 0);
        assert_eq!(stats.converted, 0);
    }

    #[test]
    fn test_arena_allocation() {
        let arena = Bump::new();
        let session = PassSession::new(&arena);

        let slice = session.alloc_slice(&[1, 2, 3, 4]);
        assert_eq!(slice, &[1, 2, 3, 4]);
    }

    #[test]
    fn test_string_interning() {
        let arena = Bump::new();
        let session = PassSession::new(&arena);

        let s1 = session.intern_str("too small");
        let s2 = session.intern_str("too small");
        let s3 = session.intern_str("rank");

        assert_eq!(s1.as_ptr(), s2.as_ptr());
        assert_ne!(s1.as_ptr(), s3.as_ptr());
    }

    #[test]
    fn test_pass_statistics() {
        let arena = Bump::new();
        let session = PassSession::new(&arena);

        session.record_dot_visited();
        session.record_dot_visited();
        session.record_dot_visited();
        session.record_candidate();
        session.record_candidate();
        session.record_rejection("shape too small");
        session.record_converted(7);
        session.record_failed();

        let stats = session.stats();
        assert_eq!(stats.dots_visited, 3);
        assert_eq!(stats.candidates, 2);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.rejection_counts["shape too small"], 1);

        // Counts are keyed by the interned reason.
        let (&key, _) = stats.rejection_counts.iter().next().unwrap();
        assert_eq!(key.as_ptr(), session.intern_str("shape too small").as_ptr());
        assert_eq!(stats.converted, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.tile_ops_emitted, 7);
    }

    #[test]
    fn test_statistics_display() {
        let arena = Bump::new();
        let session = PassSession::new(&arena);

        session.record_dot_visited();
        session.record_rejection("AMX_INT8 is not available");

        let output = format!("{}", session.stats());
        assert!(output.contains("Dot operations visited: 1"));
        assert!(output.contains("Rejected: 1"));
        assert!(output.contains("AMX_INT8 is not available: 1"));
    }
}
