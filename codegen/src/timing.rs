//! Pass timing.
//!
//! This modules provides wall-clock accounting of compilation passes. Each
//! pass or analysis that wants to appear in the report calls its
//! corresponding function, which returns a guard; the elapsed time between
//! the call and the guard's drop is added to the accumulated time for that
//! pass. Timing is per thread: each compilation worker accumulates its own
//! totals.

use core::fmt;
use std::cell::RefCell;
use std::time::{Duration, Instant};

// Each pass that can be timed is predefined with a snake_case name and a
// plain text description, which expand to a `Pass` constant and a public
// function that starts timing it.
macro_rules! define_passes {
    ($($name:ident: $desc:expr,)+) => {
        /// A compilation pass or analysis that can be timed.
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        #[allow(missing_docs, non_camel_case_types)]
        pub enum Pass {
            $($name,)+
            /// Bookkeeping slot for time not spent in any pass.
            None,
        }

        const NUM_PASSES: usize = Pass::None as usize;

        const ALL_PASSES: [Pass; NUM_PASSES] = [$(Pass::$name,)+];

        impl Pass {
            fn description(self) -> &'static str {
                match self {
                    $(Pass::$name => $desc,)+
                    Pass::None => "<no pass>",
                }
            }
        }

        $(
            /// Start timing this pass; timing stops when the guard drops.
            #[must_use]
            pub fn $name() -> TimingToken {
                start_pass(Pass::$name)
            }
        )+
    };
}

define_passes! {
    process_graph: "Processing graph (total)",
    verifier: "Graph verifier",
    domtree: "Dominator tree",
    postdomtree: "Post-dominator tree",
    loop_analysis: "Loop analysis",
    linear_order: "Linearization",
    side_effects: "Side-effects analysis",
    induction_analysis: "Induction variable analysis",
    load_store_analysis: "Load-store analysis",
    gvn: "Global value numbering",
    licm: "Loop-invariant code motion",
    loop_optimization: "Loop optimization",
    vectorizer: "Vectorization",
    bounds_check_elimination: "Bounds check elimination",
    load_store_elimination: "Load-store elimination",
    constant_folding: "Constant folding",
    dce: "Dead code elimination",
    select_generator: "Select generation",
    instruction_simplifier: "Instruction simplifier",
    cha_guard_optimization: "CHA guard optimization",
    code_sinking: "Code sinking",
}

/// A timing token from `start_pass`; the pass is timed until the token is
/// dropped.
pub struct TimingToken {
    /// The index of the pass being timed.
    pass: Pass,
    /// The pass that will be resumed when this token is dropped.
    prev: Pass,
    /// The time this pass was started.
    start: Instant,
}

/// Accumulated timing information for all passes on this thread.
#[derive(Default)]
pub struct PassTimes {
    pass: [Duration; NUM_PASSES],
}

impl PassTimes {
    /// Add `duration` to the total for `pass`.
    fn add(&mut self, pass: Pass, duration: Duration) {
        if pass != Pass::None {
            self.pass[pass as usize] += duration;
        }
    }

    /// The total time recorded for `pass`.
    pub fn total(&self, pass: Pass) -> Duration {
        if pass == Pass::None {
            Duration::default()
        } else {
            self.pass[pass as usize]
        }
    }
}

impl fmt::Display for PassTimes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "======== ==========================================")?;
        writeln!(f, "   Time   Pass")?;
        writeln!(f, "-------- ------------------------------------------")?;
        for &pass in ALL_PASSES.iter() {
            let time = self.pass[pass as usize];
            if time != Duration::default() {
                writeln!(f, "{:8.3} {}", time.as_secs_f64(), pass.description())?;
            }
        }
        writeln!(f, "======== ==========================================")
    }
}

thread_local! {
    static CURRENT_PASS: RefCell<Pass> = const { RefCell::new(Pass::None) };
    static PASS_TIME: RefCell<PassTimes> = RefCell::new(Default::default());
}

/// Start timing `pass` as a child of the currently running pass, if any.
fn start_pass(pass: Pass) -> TimingToken {
    let prev = CURRENT_PASS.with(|p| p.replace(pass));
    log::debug!("timing: Starting {:?}, (during {:?})", pass, prev);
    TimingToken {
        pass,
        prev,
        start: Instant::now(),
    }
}

impl Drop for TimingToken {
    /// Dropping a timing token indicates the end of the pass.
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        log::debug!("timing: Ending {:?}", self.pass);
        let prev = CURRENT_PASS.with(|p| p.replace(self.prev));
        debug_assert_eq!(self.pass, prev, "timing tokens dropped out of order");
        PASS_TIME.with(|t| t.borrow_mut().add(self.pass, duration));
    }
}

/// Take the current accumulated pass timings for this thread, resetting the
/// totals to zero.
pub fn take_current() -> PassTimes {
    PASS_TIME.with(|t| t.take())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nesting() {
        let _t0 = process_graph();
        {
            let _t1 = domtree();
        }
        {
            let _t2 = loop_analysis();
        }
        drop(_t0);

        let times = take_current();
        assert!(times.total(Pass::process_graph) >= times.total(Pass::domtree));
        // Totals were reset by `take_current`.
        let empty = take_current();
        assert_eq!(empty.total(Pass::domtree), Duration::default());
    }

    #[test]
    fn display() {
        let _t = verifier();
        drop(_t);
        let times = take_current();
        let text = times.to_string();
        assert!(text.contains("Pass"));
    }
}
