//! Bytecode programs: instruction set, decoder and assembler.
//!
//! A program is an immutable byte string shared by reference count between
//! every expression cache and action binding that uses it. Each instruction
//! is a one-byte opcode followed by little-endian operands.

use crate::error::{EvalError, MalformedReason};
use std::fmt;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    PushUnset = 0x01,
    PushNumber = 0x02,
    PushText = 0x03,
    PushTrue = 0x04,
    PushFalse = 0x05,
    LoadArg = 0x06,
    Call = 0x10,
    Pop = 0x11,
    Add = 0x20,
    Sub = 0x21,
    Mul = 0x22,
    Div = 0x23,
    Mod = 0x24,
    Neg = 0x25,
    Not = 0x26,
    Eq = 0x30,
    Ne = 0x31,
    Lt = 0x32,
    Le = 0x33,
    Gt = 0x34,
    Ge = 0x35,
    Jump = 0x40,
    JumpIfFalse = 0x41,
    Return = 0x50,
}

impl TryFrom<u8> for Opcode {
    type Error = MalformedReason;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        use Opcode::*;
        Ok(match byte {
            0x01 => PushUnset,
            0x02 => PushNumber,
            0x03 => PushText,
            0x04 => PushTrue,
            0x05 => PushFalse,
            0x06 => LoadArg,
            0x10 => Call,
            0x11 => Pop,
            0x20 => Add,
            0x21 => Sub,
            0x22 => Mul,
            0x23 => Div,
            0x24 => Mod,
            0x25 => Neg,
            0x26 => Not,
            0x30 => Eq,
            0x31 => Ne,
            0x32 => Lt,
            0x33 => Le,
            0x34 => Gt,
            0x35 => Ge,
            0x40 => Jump,
            0x41 => JumpIfFalse,
            0x50 => Return,
            other => return Err(MalformedReason::UnknownOpcode(other)),
        })
    }
}

/// A decoded instruction borrowing its operands from the program bytes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Instruction<'a> {
    PushUnset,
    PushNumber(f64),
    PushText(&'a str),
    PushBool(bool),
    LoadArg(u8),
    Call { name: &'a str, argc: u8 },
    Pop,
    /// Arithmetic, logical and comparison operators without operands.
    Operator(Opcode),
    Jump(i16),
    JumpIfFalse(i16),
    Return,
}

/// Decode the instruction at `offset`, returning it with the offset of the
/// next instruction.
pub fn decode(code: &[u8], offset: usize) -> Result<(Instruction<'_>, usize), EvalError> {
    let mut cursor = Cursor { code, pos: offset, start: offset };
    let byte = cursor.u8()?;
    let op = Opcode::try_from(byte).map_err(|r| EvalError::malformed(offset, r))?;
    let insn = match op {
        Opcode::PushUnset => Instruction::PushUnset,
        Opcode::PushNumber => Instruction::PushNumber(f64::from_le_bytes(cursor.array()?)),
        Opcode::PushText => Instruction::PushText(cursor.text()?),
        Opcode::PushTrue => Instruction::PushBool(true),
        Opcode::PushFalse => Instruction::PushBool(false),
        Opcode::LoadArg => Instruction::LoadArg(cursor.u8()?),
        Opcode::Call => {
            let argc = cursor.u8()?;
            let name = cursor.text()?;
            Instruction::Call { name, argc }
        }
        Opcode::Pop => Instruction::Pop,
        Opcode::Jump => Instruction::Jump(i16::from_le_bytes(cursor.array()?)),
        Opcode::JumpIfFalse => Instruction::JumpIfFalse(i16::from_le_bytes(cursor.array()?)),
        Opcode::Return => Instruction::Return,
        other => Instruction::Operator(other),
    };
    Ok((insn, cursor.pos))
}

struct Cursor<'a> {
    code: &'a [u8],
    pos: usize,
    start: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], EvalError> {
        let end = self.pos.checked_add(n).filter(|&end| end <= self.code.len());
        match end {
            Some(end) => {
                let bytes = &self.code[self.pos..end];
                self.pos = end;
                Ok(bytes)
            }
            None => Err(EvalError::malformed(self.start, MalformedReason::Truncated)),
        }
    }

    fn u8(&mut self) -> Result<u8, EvalError> {
        Ok(self.take(1)?[0])
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], EvalError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn text(&mut self) -> Result<&'a str, EvalError> {
        let len = u16::from_le_bytes(self.array()?) as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map_err(|_| EvalError::malformed(self.start, MalformedReason::InvalidText))
    }
}

/// Immutable compiled bytecode, cheap to clone and share.
#[derive(Clone, PartialEq, Eq)]
pub struct Program {
    code: Rc<[u8]>,
}

impl Program {
    pub fn from_bytes(code: impl Into<Vec<u8>>) -> Self {
        let code: Vec<u8> = code.into();
        Self { code: Rc::from(code) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.code
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Whether both handles share the same underlying bytes.
    pub fn ptr_eq(&self, other: &Program) -> bool {
        Rc::ptr_eq(&self.code, &other.code)
    }

    /// Iterate decoded instructions with their offsets. Iteration stops
    /// after the first decoding error.
    pub fn instructions(&self) -> Instructions<'_> {
        Instructions { code: &self.code, pos: 0, failed: false }
    }

    /// Names of all functions called directly by this program, in first
    /// appearance order. Names inside malformed tails are not reported.
    pub fn referenced_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for (_, insn) in self.instructions().map_while(Result::ok) {
            if let Instruction::Call { name, .. } = insn {
                if !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
            }
        }
        names
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program").field("len", &self.code.len()).finish()
    }
}

pub struct Instructions<'a> {
    code: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<(usize, Instruction<'a>), EvalError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.code.len() {
            return None;
        }
        let offset = self.pos;
        match decode(self.code, offset) {
            Ok((insn, next)) => {
                self.pos = next;
                Some(Ok((offset, insn)))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

/// Position of an emitted jump whose target is not yet known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct JumpSlot(usize);

/// A position in the program that later jumps may target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Assembler producing [`Program`]s.
///
/// Stands in for the configuration compiler: producers, tests and
/// benchmarks use it to build the bytecode the evaluator runs.
#[derive(Debug, Default, Clone)]
pub struct ProgramBuilder {
    code: Vec<u8>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn op(&mut self, op: Opcode) -> &mut Self {
        self.code.push(op as u8);
        self
    }

    pub fn push_unset(&mut self) -> &mut Self {
        self.op(Opcode::PushUnset)
    }

    pub fn push_number(&mut self, n: f64) -> &mut Self {
        self.op(Opcode::PushNumber);
        self.code.extend_from_slice(&n.to_le_bytes());
        self
    }

    /// Text longer than `u16::MAX` bytes is cut at the last char boundary
    /// that fits.
    pub fn push_text(&mut self, s: &str) -> &mut Self {
        self.op(Opcode::PushText);
        self.emit_text(s);
        self
    }

    pub fn push_bool(&mut self, b: bool) -> &mut Self {
        self.op(if b { Opcode::PushTrue } else { Opcode::PushFalse })
    }

    pub fn load_arg(&mut self, index: u8) -> &mut Self {
        self.op(Opcode::LoadArg);
        self.code.push(index);
        self
    }

    pub fn call(&mut self, name: &str, argc: u8) -> &mut Self {
        self.op(Opcode::Call);
        self.code.push(argc);
        self.emit_text(name);
        self
    }

    pub fn pop(&mut self) -> &mut Self {
        self.op(Opcode::Pop)
    }

    pub fn ret(&mut self) -> &mut Self {
        self.op(Opcode::Return)
    }

    pub fn label(&self) -> Label {
        Label(self.code.len())
    }

    pub fn jump(&mut self) -> JumpSlot {
        self.emit_jump(Opcode::Jump)
    }

    pub fn jump_if_false(&mut self) -> JumpSlot {
        self.emit_jump(Opcode::JumpIfFalse)
    }

    /// Point `slot` at the current end of the program.
    pub fn bind(&mut self, slot: JumpSlot) -> Result<&mut Self, EvalError> {
        let target = self.code.len();
        self.patch(slot, target)?;
        Ok(self)
    }

    /// Emit an unconditional jump back to `label`.
    pub fn jump_to(&mut self, label: Label) -> Result<&mut Self, EvalError> {
        let slot = self.jump();
        self.patch(slot, label.0)?;
        Ok(self)
    }

    pub fn finish(&self) -> Program {
        Program::from_bytes(self.code.clone())
    }

    fn emit_jump(&mut self, op: Opcode) -> JumpSlot {
        self.op(op);
        let at = self.code.len();
        self.code.extend_from_slice(&0i16.to_le_bytes());
        JumpSlot(at)
    }

    fn patch(&mut self, slot: JumpSlot, target: usize) -> Result<(), EvalError> {
        let next = slot.0 + 2;
        let delta = target as isize - next as isize;
        let rel = i16::try_from(delta).map_err(|_| {
            EvalError::malformed(slot.0 - 1, MalformedReason::JumpOutOfBounds(delta))
        })?;
        self.code[slot.0..next].copy_from_slice(&rel.to_le_bytes());
        Ok(())
    }

    fn emit_text(&mut self, s: &str) {
        let mut end = s.len().min(u16::MAX as usize);
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        self.code.extend_from_slice(&(end as u16).to_le_bytes());
        self.code.extend_from_slice(&s.as_bytes()[..end]);
    }
}
