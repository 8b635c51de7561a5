//! # Memory-Safety Pass
//!
//! Runs the three phases over one function at a time:
//!
//! ```text
//! EscapeAnalyzer ──► HeapPromoter ──► CheckInserter
//!  (which allocas     (alloca → safec_alloc,   (escape / bounds checks,
//!   escape)            safec_free at exits)      write barriers)
//! ```
//!
//! Promotion runs first so the checks see promoted objects as heap
//! objects and fall back to the runtime header lookup for them.

use std::fmt;

use serde::Serialize;
use tracing::{debug, info};

use crate::bitmap::TypeBitmapComputer;
use crate::checks::{CheckInserter, CheckStats};
use crate::error::InstrumentError;
use crate::escape::EscapeAnalyzer;
use crate::ir::{Callee, Function, Global, InstKind, Module};
use crate::libcall::{KnownLibraryCalls, LibraryCallOracle};
use crate::promote::{HeapPromoter, PromotionStats};
use crate::runtime::RuntimeFn;

/// Which phases run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassConfig {
    /// Promote escaping allocations to the managed heap.
    pub promote: bool,
    /// Insert escape checks.
    pub escape_checks: bool,
    /// Insert bounds checks.
    pub bounds_checks: bool,
    /// Insert write barriers.
    pub write_barriers: bool,
}

impl Default for PassConfig {
    fn default() -> Self {
        Self {
            promote: true,
            escape_checks: true,
            bounds_checks: true,
            write_barriers: true,
        }
    }
}

/// What the pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassStats {
    /// Functions instrumented.
    pub functions: usize,
    /// Fixed-size allocations promoted.
    pub promoted_fixed: usize,
    /// Variable-length allocations promoted.
    pub promoted_vla: usize,
    /// Escape checks inserted.
    pub escape_checks: usize,
    /// Bounds checks with a static stack size.
    pub bounds_static_stack: usize,
    /// Bounds checks with a computed stack size.
    pub bounds_dynamic_stack: usize,
    /// Bounds checks with a static global size.
    pub bounds_global: usize,
    /// Bounds checks resolved by header lookup.
    pub bounds_runtime: usize,
    /// Write barriers inserted.
    pub write_barriers: usize,
}

impl PassStats {
    fn record(&mut self, promotion: PromotionStats, checks: CheckStats) {
        self.functions += 1;
        self.promoted_fixed += promotion.fixed;
        self.promoted_vla += promotion.vla;
        self.escape_checks += checks.escape_checks;
        self.bounds_static_stack += checks.bounds_static_stack;
        self.bounds_dynamic_stack += checks.bounds_dynamic_stack;
        self.bounds_global += checks.bounds_global;
        self.bounds_runtime += checks.bounds_runtime;
        self.write_barriers += checks.write_barriers;
    }

    /// Add another run's counts to these.
    pub fn merge(&mut self, other: &PassStats) {
        self.functions += other.functions;
        self.promoted_fixed += other.promoted_fixed;
        self.promoted_vla += other.promoted_vla;
        self.escape_checks += other.escape_checks;
        self.bounds_static_stack += other.bounds_static_stack;
        self.bounds_dynamic_stack += other.bounds_dynamic_stack;
        self.bounds_global += other.bounds_global;
        self.bounds_runtime += other.bounds_runtime;
        self.write_barriers += other.write_barriers;
    }

    /// All bounds checks, whatever their shape.
    pub fn bounds_checks(&self) -> usize {
        self.bounds_static_stack + self.bounds_dynamic_stack + self.bounds_global + self.bounds_runtime
    }
}

impl fmt::Display for PassStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "functions instrumented: {}", self.functions)?;
        writeln!(f, "promoted allocations:   {} fixed, {} variable-length", self.promoted_fixed, self.promoted_vla)?;
        writeln!(f, "escape checks:          {}", self.escape_checks)?;
        writeln!(
            f,
            "bounds checks:          {} ({} static stack, {} dynamic stack, {} global, {} runtime)",
            self.bounds_checks(),
            self.bounds_static_stack,
            self.bounds_dynamic_stack,
            self.bounds_global,
            self.bounds_runtime
        )?;
        write!(f, "write barriers:         {}", self.write_barriers)
    }
}

/// The memory-safety instrumentation pass.
pub struct MemSafePass {
    config: PassConfig,
    oracle: Box<dyn LibraryCallOracle>,
    bitmaps: TypeBitmapComputer,
}

impl MemSafePass {
    /// A pass with the default library-call oracle.
    pub fn new(config: PassConfig) -> Self {
        Self::with_oracle(config, Box::new(KnownLibraryCalls::new()))
    }

    /// A pass with a custom library-call oracle.
    pub fn with_oracle(config: PassConfig, oracle: Box<dyn LibraryCallOracle>) -> Self {
        Self {
            config,
            oracle,
            bitmaps: TypeBitmapComputer::default(),
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &PassConfig {
        &self.config
    }

    /// Instrument one function. `globals` are the module's globals.
    ///
    /// The body is validated first; a malformed body is rejected untouched.
    pub fn run_on_function(&mut self, globals: &[Global], func: &mut Function) -> Result<PassStats, InstrumentError> {
        func.validate()?;
        self.instrument(globals, func)
    }

    fn instrument(&mut self, globals: &[Global], func: &mut Function) -> Result<PassStats, InstrumentError> {
        let mut stats = PassStats::default();
        if !func.has_body() {
            return Ok(stats);
        }

        let promotion = if self.config.promote {
            let escapes = EscapeAnalyzer::new(self.oracle.as_ref()).analyze(func);
            debug!(
                function = %func.name,
                allocations = escapes.allocations,
                escaping = escapes.escaping.len(),
                "escape analysis"
            );
            HeapPromoter::new(*self.bitmaps.layout()).promote(func, &escapes.escaping)?
        } else {
            PromotionStats::default()
        };

        let checks = CheckInserter::new(self.oracle.as_ref(), globals, &mut self.bitmaps, &self.config).run(func)?;
        stats.record(promotion, checks);
        debug!(function = %func.name, ?stats, "instrumented");
        Ok(stats)
    }

    /// Instrument every function with a body, then declare the runtime
    /// entry points the instrumented code calls.
    ///
    /// Every function is validated before any is rewritten.
    pub fn run_on_module(&mut self, module: &mut Module) -> Result<PassStats, InstrumentError> {
        module.validate()?;
        if *self.bitmaps.layout() != module.layout {
            self.bitmaps = TypeBitmapComputer::new(module.layout);
        }

        let mut total = PassStats::default();
        for func in &mut module.functions {
            let stats = self.instrument(&module.globals, func)?;
            total.merge(&stats);
        }

        for f in used_runtime_fns(module) {
            module.declare(f.symbol(), f.params(), f.ret());
        }

        info!(
            module = %module.name,
            functions = total.functions,
            promoted = total.promoted_fixed + total.promoted_vla,
            checks = total.escape_checks + total.bounds_checks() + total.write_barriers,
            "instrumented module"
        );
        Ok(total)
    }
}

impl Default for MemSafePass {
    fn default() -> Self {
        Self::new(PassConfig::default())
    }
}

/// Runtime entry points called anywhere in `module`, in ABI table order.
fn used_runtime_fns(module: &Module) -> Vec<RuntimeFn> {
    let mut used: Vec<RuntimeFn> = module
        .functions
        .iter()
        .flat_map(|func| {
            func.instructions()
                .into_iter()
                .filter_map(move |(_, i)| match func.inst(i) {
                    Some(InstKind::Call { callee: Callee::Direct(name), .. }) => RuntimeFn::from_symbol(name),
                    _ => None,
                })
        })
        .collect();
    used.sort();
    used.dedup();
    used
}
