//! The JIT core: module lifecycle and symbol resolution.
//!
//! Layered the way the code flows:
//! - `compile`: turns a submitted IR module into a linked artifact
//! - `object`: keeps linked artifacts resident and owns their memory
//! - `engine`: the manager tying both to the handle registry and the
//!   newest-first resolution order

mod compile;
mod engine;
mod object;

pub use engine::{JitConfig, JitEngine, JitSymbol};
pub use object::ModuleHandle;
