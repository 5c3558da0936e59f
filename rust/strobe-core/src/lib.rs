//! Strobe Core
//!
//! Values, bytecode programs and evaluation errors shared by the evaluator,
//! the runtime plumbing and producer modules.

pub mod error;
pub mod program;
pub mod value;

pub use error::{EvalError, MalformedReason};
pub use program::{Instruction, Opcode, Program, ProgramBuilder};
pub use value::Value;
