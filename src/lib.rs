// HostCL: Common Lisp semantics on a host AST
// Symbols and packages, special variables, conditions and restarts,
// generic functions, and a form-to-AST lowering compiler.

pub mod types;
pub mod symbol;
pub mod dynamic;
pub mod conditions;
pub mod clos;
pub mod lambda_list;
pub mod ast;
pub mod analyzer;
pub mod compiler;
pub mod eval;
pub mod primitives;
pub mod reader;
pub mod printer;
pub mod process;
pub mod context;
pub mod config;
pub mod debug;

pub use crate::context::GlobalContext;
pub use crate::eval::{ControlSignal, EvalResult, Interpreter};
pub use crate::process::Process;
pub use crate::symbol::{PackageId, SymbolId};
pub use crate::types::Value;
