//! HashMap and HashSet aliases with a faster, non-DoS-resistant hash
//! function, for compiler-internal keys that are not attacker-controlled.

pub use rustc_hash::FxHashMap;
pub use rustc_hash::FxHashSet;
