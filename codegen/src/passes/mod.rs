//! The optimization passes and the pass manager driving them.
//!
//! Each pass is a function from `&mut Graph` to `Result<bool, Bailout>`:
//! `Ok(changed)` reports whether the graph was mutated, and `Err(Bailout)`
//! is *normal* control flow meaning the pass declined to run and left the
//! graph untouched (unsupported IR, missing preconditions, or a pass that
//! lives outside this crate). Structural misuse, by contrast, is a
//! programmer error and panics.
//!
//! The pass manager resolves a configured sequence of pass identifiers
//! (the closed set below), runs each once, and checks a cooperative
//! cancellation predicate between passes.

pub mod bounds_check;
pub mod cha_guard;
pub mod code_sinking;
pub mod constant_folding;
pub mod dce;
pub mod gvn;
pub mod licm;
pub mod load_store_elimination;
pub mod loop_optimization;
pub mod select_generator;
pub mod simplifier;
pub mod simplifier_aarch64;
pub mod vectorizer;

use crate::dominator_tree::DominatorTree;
use crate::induction::InductionAnalysis;
use crate::ir::Graph;
use crate::isa::IsaInfo;
use crate::load_store_analysis::LoadStoreAnalysis;
use crate::loop_analysis::LoopForest;
use crate::side_effects::SideEffectsAnalysis;
use crate::stats::CompilationStats;
use core::fmt;

/// Why a pass declined to run or to transform a particular site.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Bailout {
    /// The graph contains IR this pass does not handle (try/catch,
    /// irreducible loops, no exit block, ...).
    UnsupportedIr(&'static str),
    /// The identifier names a pass owned by an external collaborator (the
    /// inliner, the scheduler, ...), not part of this optimization core.
    ExternalPass(&'static str),
}

impl fmt::Display for Bailout {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Bailout::UnsupportedIr(what) => write!(f, "unsupported IR: {}", what),
            Bailout::ExternalPass(name) => write!(f, "external pass: {}", name),
        }
    }
}

/// The result of running one pass: did it change the graph, or why not.
pub type PassResult = Result<bool, Bailout>;

macro_rules! define_pass_names {
    ($($variant:ident => $name:expr,)+) => {
        /// The closed set of pass identifiers.
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        #[allow(missing_docs)]
        pub enum OptimizationPass {
            $($variant,)+
        }

        impl OptimizationPass {
            /// The canonical identifier of this pass.
            pub fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)+
                }
            }

            /// Resolve an identifier. Identifiers outside the closed set do
            /// not resolve.
            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

define_pass_names! {
    SideEffectsAnalysis => "side_effects_analysis",
    InductionVarAnalysis => "induction_var_analysis",
    LoadStoreAnalysis => "load_store_analysis",
    GlobalValueNumbering => "global_value_numbering",
    InvariantCodeMotion => "licm",
    LoopOptimization => "loop_optimization",
    BoundsCheckElimination => "bounds_check_elimination",
    LoadStoreElimination => "load_store_elimination",
    ConstantFolding => "constant_folding",
    DeadCodeElimination => "dead_code_elimination",
    Inliner => "inliner",
    Sharpening => "sharpening",
    SelectGenerator => "select_generator",
    InstructionSimplifier => "instruction_simplifier",
    IntrinsicsRecognizer => "intrinsics_recognizer",
    ChaGuardOptimization => "cha_guard_optimization",
    CodeSinking => "code_sinking",
    ConstructorFenceRedundancyElimination => "constructor_fence_redundancy_elimination",
    Scheduling => "scheduling",
    InstructionSimplifierAarch64 => "instruction_simplifier_aarch64",
}

impl OptimizationPass {
    /// Is this pass owned by an external collaborator rather than this
    /// crate?
    pub fn is_external(self) -> bool {
        matches!(
            self,
            Self::Inliner
                | Self::Sharpening
                | Self::IntrinsicsRecognizer
                | Self::Scheduling
                | Self::ConstructorFenceRedundancyElimination
        )
    }
}

/// Errors the pass manager itself can produce. Pass-level bailouts are not
/// errors; they are logged and skipped.
#[derive(Debug)]
pub enum PassManagerError {
    /// An identifier outside the closed set.
    UnknownPass(String),
    /// The cancellation predicate fired between passes.
    Cancelled,
}

impl fmt::Display for PassManagerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UnknownPass(name) => write!(f, "cannot find optimization {}", name),
            Self::Cancelled => write!(f, "compilation cancelled"),
        }
    }
}

/// Runs a configured sequence of passes over one graph.
pub struct PassManager<'a> {
    isa: &'a IsaInfo,
    cancel: Option<&'a dyn Fn() -> bool>,
}

impl<'a> PassManager<'a> {
    /// A pass manager for the given target.
    pub fn new(isa: &'a IsaInfo) -> Self {
        Self { isa, cancel: None }
    }

    /// Install a cooperative cancellation predicate, polled between
    /// passes.
    pub fn with_cancellation(mut self, cancel: &'a dyn Fn() -> bool) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// The default optimizing pipeline for this core.
    pub fn default_pipeline() -> &'static [&'static str] {
        &[
            "constant_folding",
            "instruction_simplifier",
            "dead_code_elimination",
            "global_value_numbering",
            "select_generator",
            "side_effects_analysis",
            "induction_var_analysis",
            "licm",
            "bounds_check_elimination",
            "loop_optimization",
            "load_store_analysis",
            "load_store_elimination",
            "cha_guard_optimization",
            "code_sinking",
            "dead_code_elimination:dead_code_elimination_final",
        ]
    }

    /// Run `entries` over `graph` in order. Each entry is a pass
    /// identifier, optionally followed by `:alternative_name` used for
    /// logging. Unknown identifiers are a configuration error.
    pub fn run(
        &self,
        graph: &mut Graph,
        stats: &mut CompilationStats,
        entries: &[&str],
    ) -> Result<(), PassManagerError> {
        let _tt = crate::timing::process_graph();
        for entry in entries {
            let (name, alt) = match entry.split_once(':') {
                Some((name, alt)) => (name, alt),
                None => (*entry, *entry),
            };
            let pass = OptimizationPass::from_name(name)
                .ok_or_else(|| PassManagerError::UnknownPass(name.to_string()))?;
            if let Some(cancel) = self.cancel {
                if cancel() {
                    return Err(PassManagerError::Cancelled);
                }
            }
            match run_pass(pass, graph, self.isa, stats) {
                Ok(changed) => {
                    log::debug!("{}: {}", alt, if changed { "changed" } else { "no change" })
                }
                Err(bailout) => log::debug!("{}: skipped ({})", alt, bailout),
            }
        }
        Ok(())
    }
}

/// Run a single pass over `graph`.
pub fn run_pass(
    pass: OptimizationPass,
    graph: &mut Graph,
    isa: &IsaInfo,
    stats: &mut CompilationStats,
) -> PassResult {
    if pass.is_external() {
        return Err(Bailout::ExternalPass(pass.name()));
    }
    match pass {
        // The analysis identifiers exist so a pipeline can state its
        // dependencies explicitly; the analyses themselves are computed
        // (and version-checked) by the consuming passes.
        OptimizationPass::SideEffectsAnalysis => {
            let domtree = DominatorTree::compute(graph);
            let forest = LoopForest::compute(graph, &domtree);
            let analysis = SideEffectsAnalysis::compute(graph, &forest);
            debug_assert!(analysis.is_valid(graph));
            Ok(false)
        }
        OptimizationPass::InductionVarAnalysis => {
            let domtree = DominatorTree::compute(graph);
            let forest = LoopForest::compute(graph, &domtree);
            let analysis = InductionAnalysis::compute(graph, &forest);
            debug_assert!(analysis.is_valid(graph));
            Ok(false)
        }
        OptimizationPass::LoadStoreAnalysis => {
            let analysis = LoadStoreAnalysis::compute(graph);
            debug_assert!(analysis.is_valid(graph));
            Ok(false)
        }
        OptimizationPass::GlobalValueNumbering => gvn::run(graph, stats),
        OptimizationPass::InvariantCodeMotion => licm::run(graph, stats),
        OptimizationPass::LoopOptimization => loop_optimization::run(graph, isa, stats),
        OptimizationPass::BoundsCheckElimination => bounds_check::run(graph, stats),
        OptimizationPass::LoadStoreElimination => load_store_elimination::run(graph, stats),
        OptimizationPass::ConstantFolding => constant_folding::run(graph, stats),
        OptimizationPass::DeadCodeElimination => dce::run(graph, stats),
        OptimizationPass::SelectGenerator => select_generator::run(graph, stats),
        OptimizationPass::InstructionSimplifier => simplifier::run(graph, stats),
        OptimizationPass::ChaGuardOptimization => cha_guard::run(graph, stats),
        OptimizationPass::CodeSinking => code_sinking::run(graph, stats),
        OptimizationPass::InstructionSimplifierAarch64 => {
            simplifier_aarch64::run(graph, isa, stats)
        }
        OptimizationPass::Inliner
        | OptimizationPass::Sharpening
        | OptimizationPass::IntrinsicsRecognizer
        | OptimizationPass::Scheduling
        | OptimizationPass::ConstructorFenceRedundancyElimination => {
            unreachable!("external passes are rejected above")
        }
    }
}
