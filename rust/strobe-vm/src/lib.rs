//! Strobe VM: bytecode evaluator, function registry and expression caches.
//!
//! [`Runtime`] is the embedding surface. It owns one trigger bus, function
//! registry, module queue directory and set of expression caches, all
//! confined to the loop thread.

pub mod builtins;
pub mod config;
pub mod expr;
mod ops;
pub mod registry;
pub mod runtime;
pub mod vm;

pub use config::{ConfigError, RuntimeConfig, VmConfig, MAX_CALL_DEPTH_CEILING};
pub use expr::{EvalMode, ExprHandle, ExpressionCache, ExpressionStore};
pub use registry::{Behavior, CallContext, FunctionEntry, FunctionRegistry, NativeFn};
pub use runtime::{LoopMessage, LoopSender, LoopSource, Runtime};
pub use vm::{Evaluation, Vm};
