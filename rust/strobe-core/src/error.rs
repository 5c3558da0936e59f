//! Evaluation errors.
//!
//! Only corrupt bytecode is an error. Name lookup misses, disconnected
//! producers and empty queues all degrade to `Value::Unset` instead.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedReason {
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),
    #[error("truncated operand")]
    Truncated,
    #[error("text operand is not valid utf-8")]
    InvalidText,
    #[error("operand stack underflow")]
    StackUnderflow,
    #[error("operand stack overflow (limit {0})")]
    StackOverflow(usize),
    #[error("jump target {0} out of bounds")]
    JumpOutOfBounds(isize),
    #[error("call depth exceeded {0}")]
    CallDepthExceeded(usize),
    #[error("instruction budget of {0} exhausted")]
    BudgetExhausted(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("malformed program at offset {offset}: {reason}")]
    Malformed {
        offset: usize,
        reason: MalformedReason,
    },
}

impl EvalError {
    pub fn malformed(offset: usize, reason: MalformedReason) -> Self {
        EvalError::Malformed { offset, reason }
    }

    pub fn reason(&self) -> &MalformedReason {
        match self {
            EvalError::Malformed { reason, .. } => reason,
        }
    }

    pub fn offset(&self) -> usize {
        match self {
            EvalError::Malformed { offset, .. } => *offset,
        }
    }
}
