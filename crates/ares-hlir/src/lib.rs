//! HLIR: a construct-level parallel IR and its lowering onto the Ares
//! runtime.
//!
//! Frontends register functions whose bodies may contain three parallel
//! constructs: task launch, parallel-for and parallel-reduce. The
//! [`lower_module`] pass rewrites each construct into calls against the
//! runtime's `__ares_*` ABI and generates the trampoline and wrapper
//! functions those calls need. After lowering, a module contains only
//! plain instructions and can be handed to code generation.

mod hlir;
mod lower;

pub use hlir::{
    BinOp, Callee, FunctionId, HlirFunction, HlirModule, Instr, Value, ValueId,
};
pub use lower::{abi, lower_module, LowerError, LowerReport};
