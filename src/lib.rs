//! An in-process JIT compilation manager.
//!
//! Callers hand the engine intermediate-representation modules; it compiles
//! and links them into executable memory through Cranelift and resolves
//! symbol names across every loaded module plus the host process's own
//! symbol table. Resolution searches modules newest-first, so redefining a
//! name in a later module shadows the older definition the way a REPL
//! expects, and removing the newer module exposes the older one again.

pub mod capi;
pub mod error;
pub mod ir;
pub mod jit;
pub mod mangle;
pub mod process;
pub mod target;

pub use error::{CompileError, NarwhalError};
pub use ir::{BinOp, Cmp, DataDef, Expr, FuncDef, IrModule};
pub use jit::{JitConfig, JitEngine, JitSymbol, ModuleHandle};
pub use mangle::Mangler;
pub use process::{HostProcess, ProcessSymbols};
pub use target::{OptLevel, TargetDescriptor};

pub type NarwhalResult<T> = Result<T, error::NarwhalError>;
