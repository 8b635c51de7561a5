//! # Escape Analysis
//!
//! Decides which stack allocations must move to the managed heap.
//!
//! ## Algorithm
//!
//! For every `alloca`, walk its transitive users breadth first. The walk
//! stops at the first user that lets the address leave the function's
//! local use set:
//!
//! | User | Result |
//! |------|--------|
//! | argument of a call the [`LibraryCallOracle`] does not recognize | escapes |
//! | store whose *value* is a pointer derived from the allocation | escapes |
//! | library call | ignored; its result does not join the walk |
//! | anything else (loads, casts, indexing, phis, ...) | its result joins the walk |
//!
//! Each value is visited at most once, so a merge point reached along a
//! second path is not walked again. Returning a stack address is not an
//! escape here; the runtime escape check catches it.
//!
//! The analysis is conservative in one direction only: it may promote an
//! allocation that did not need it, never the reverse for the patterns
//! above.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use crate::ir::{Function, InstKind, ValueId};
use crate::libcall::LibraryCallOracle;

// ============================================================================
// Escape Results
// ============================================================================

/// Why an allocation escapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscapeReason {
    /// A derived pointer is passed to a non-library call.
    PassedToCall {
        /// The call instruction.
        call: ValueId,
    },
    /// A derived pointer is stored into memory.
    StoredToMemory {
        /// The store instruction.
        store: ValueId,
    },
}

/// Results of escape analysis for a function.
#[derive(Debug, Clone, Default)]
pub struct EscapeResults {
    /// Escaping allocations, in program order.
    pub escaping: Vec<ValueId>,
    /// First escaping use found for each escaping allocation.
    pub reasons: HashMap<ValueId, EscapeReason>,
    /// Number of allocations examined.
    pub allocations: usize,
}

impl EscapeResults {
    /// Does `alloca` escape?
    pub fn escapes(&self, alloca: ValueId) -> bool {
        self.reasons.contains_key(&alloca)
    }

    /// Why `alloca` escapes, if it does.
    pub fn reason(&self, alloca: ValueId) -> Option<EscapeReason> {
        self.reasons.get(&alloca).copied()
    }
}

// ============================================================================
// Escape Analyzer
// ============================================================================

/// Escape analysis over one function at a time.
pub struct EscapeAnalyzer<'o> {
    oracle: &'o dyn LibraryCallOracle,
}

impl<'o> EscapeAnalyzer<'o> {
    /// Create an analyzer using `oracle` to recognize library calls.
    pub fn new(oracle: &'o dyn LibraryCallOracle) -> Self {
        Self { oracle }
    }

    /// Analyze a function body.
    pub fn analyze(&self, func: &Function) -> EscapeResults {
        let uses = func.uses();
        let mut results = EscapeResults::default();

        for (_, inst) in func.instructions() {
            if !matches!(func.inst(inst), Some(InstKind::Alloca { .. })) {
                continue;
            }
            results.allocations += 1;
            if let Some(reason) = self.first_escape(func, &uses, inst) {
                debug!(function = %func.name, alloca = %inst, ?reason, "allocation escapes");
                results.escaping.push(inst);
                results.reasons.insert(inst, reason);
            }
        }

        results
    }

    fn first_escape(
        &self,
        func: &Function,
        uses: &HashMap<ValueId, Vec<ValueId>>,
        alloca: ValueId,
    ) -> Option<EscapeReason> {
        let mut derived: HashSet<ValueId> = HashSet::from([alloca]);
        let mut worklist: VecDeque<ValueId> = VecDeque::from([alloca]);

        while let Some(value) = worklist.pop_front() {
            for &user in uses.get(&value).map(Vec::as_slice).unwrap_or_default() {
                match func.inst(user) {
                    Some(InstKind::Call { callee, .. }) if !self.oracle.is_library_call(callee) => {
                        return Some(EscapeReason::PassedToCall { call: user });
                    }
                    Some(InstKind::Call { .. }) => continue,
                    Some(InstKind::Store { value: stored, .. })
                        if derived.contains(stored) && func.ty(*stored).is_pointer() =>
                    {
                        return Some(EscapeReason::StoredToMemory { store: user });
                    }
                    _ => {
                        if derived.insert(user) {
                            worklist.push_back(user);
                        }
                    }
                }
            }
        }

        None
    }
}

// ============================================================================
// Tests
// ============================================================================
