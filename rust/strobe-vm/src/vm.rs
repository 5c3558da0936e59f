//! Stack-based bytecode evaluator.
//!
//! Each call frame owns its operand stack. Names are resolved against the
//! [`FunctionRegistry`] at the moment a `Call` executes, so a registration
//! between two evaluations is visible on the next one. The evaluator never
//! writes to the registry.
//!
//! Frames of user-defined functions live on a heap-allocated frame stack,
//! not the native one, so nesting depth is bounded by
//! [`VmConfig::max_call_depth`] alone.

use crate::config::VmConfig;
use crate::ops;
use crate::registry::{Behavior, CallContext, FunctionRegistry};
use smallvec::SmallVec;
use std::rc::Rc;
use strobe_core::program::decode;
use strobe_core::{EvalError, Instruction, MalformedReason, Program, Value};
use tracing::trace;

/// Arguments for one call, kept inline for the usual small arities.
type Args = SmallVec<[Value; 4]>;

/// The outcome of a traced evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub value: Value,
    /// Every name called, directly or through user-defined functions, in
    /// first-call order.
    pub dependencies: Vec<String>,
    /// A nondeterministic native was called; the value must not be cached.
    pub volatile: bool,
}

struct Session<'c> {
    ctx: CallContext<'c>,
    budget: u64,
    dependencies: Vec<String>,
    volatile: bool,
}

impl Session<'_> {
    fn record(&mut self, name: &str) {
        if !self.dependencies.iter().any(|d| d == name) {
            self.dependencies.push(name.to_string());
        }
    }
}

/// What a single instruction asks of the frame loop.
enum Step {
    Continue,
    Enter(Program, Args),
    Exit(Value),
}

/// What a `Call` resolved to.
enum Callee {
    Done(Value),
    Enter(Program),
}

/// Evaluator over a shared [`FunctionRegistry`].
///
/// Expressions go through [`evaluate`](Vm::evaluate), actions through
/// [`execute`](Vm::execute). Both fail only on malformed bytecode or an
/// exhausted limit from [`VmConfig`].
pub struct Vm {
    registry: Rc<FunctionRegistry>,
    config: VmConfig,
}

impl Vm {
    pub fn new(registry: Rc<FunctionRegistry>, config: VmConfig) -> Self {
        Self { registry, config }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// The registry calls are resolved against.
    pub fn registry(&self) -> &Rc<FunctionRegistry> {
        &self.registry
    }

    /// Evaluate `program` for its value.
    pub fn evaluate(&self, program: &Program, args: &[Value]) -> Result<Value, EvalError> {
        self.evaluate_with(program, args, CallContext::default())
            .map(|e| e.value)
    }

    /// Run `program` for its side effects, discarding the value.
    pub fn execute(&self, program: &Program, args: &[Value]) -> Result<(), EvalError> {
        self.evaluate_with(program, args, CallContext::default())
            .map(drop)
    }

    /// Evaluate with a host context, reporting the names the evaluation
    /// depended on and whether it touched nondeterministic natives.
    pub fn evaluate_with(
        &self,
        program: &Program,
        args: &[Value],
        ctx: CallContext<'_>,
    ) -> Result<Evaluation, EvalError> {
        let mut session = Session {
            ctx,
            budget: self.config.instruction_budget,
            dependencies: Vec::new(),
            volatile: false,
        };
        let value = self.run(program, args, &mut session)?;
        Ok(Evaluation {
            value,
            dependencies: session.dependencies,
            volatile: session.volatile,
        })
    }

    fn run(
        &self,
        program: &Program,
        args: &[Value],
        session: &mut Session<'_>,
    ) -> Result<Value, EvalError> {
        let limit = self.config.max_stack;
        let mut frames = vec![Frame::new(
            program.clone(),
            args.iter().cloned().collect(),
            limit,
            0,
        )];

        loop {
            let depth = frames.len() - 1;
            let Some(frame) = frames.last_mut() else {
                return Ok(Value::Unset);
            };
            match self.step(frame, depth, session)? {
                Step::Continue => {}
                Step::Enter(program, args) => {
                    let call_site = frame.pc;
                    frames.push(Frame::new(program, args, limit, call_site));
                }
                Step::Exit(value) => {
                    let call_site = frame.call_site;
                    frames.pop();
                    match frames.last_mut() {
                        Some(caller) => {
                            caller.operands.push(call_site, value)?;
                            caller.pc = caller.resume;
                        }
                        None => return Ok(value),
                    }
                }
            }
        }
    }

    /// Execute one instruction of `frame`.
    fn step(
        &self,
        frame: &mut Frame,
        depth: usize,
        session: &mut Session<'_>,
    ) -> Result<Step, EvalError> {
        let code = frame.program.as_bytes();
        let pc = frame.pc;
        if pc >= code.len() {
            return Ok(Step::Exit(frame.operands.stack.pop().unwrap_or_default()));
        }
        if session.budget == 0 {
            return Err(EvalError::malformed(
                pc,
                MalformedReason::BudgetExhausted(self.config.instruction_budget),
            ));
        }
        session.budget -= 1;

        let operands = &mut frame.operands;
        let (insn, next) = decode(code, pc)?;
        let mut target = next;
        match insn {
            Instruction::PushUnset => operands.push(pc, Value::Unset)?,
            Instruction::PushNumber(n) => operands.push(pc, Value::Number(n))?,
            Instruction::PushText(s) => operands.push(pc, Value::text(s))?,
            Instruction::PushBool(b) => operands.push(pc, Value::Boolean(b))?,
            Instruction::LoadArg(i) => {
                let v = frame.args.get(i as usize).cloned().unwrap_or_default();
                operands.push(pc, v)?;
            }
            Instruction::Call { name, argc } => {
                let call_args = operands.take(pc, argc as usize)?;
                match self.call(pc, name, &call_args, depth, session)? {
                    Callee::Done(v) => operands.push(pc, v)?,
                    Callee::Enter(program) => {
                        frame.resume = next;
                        return Ok(Step::Enter(program, call_args));
                    }
                }
            }
            Instruction::Pop => {
                operands.pop(pc)?;
            }
            Instruction::Operator(op) if ops::is_unary(op) => {
                let operand = operands.pop(pc)?;
                operands.push(pc, ops::unary(op, operand))?;
            }
            Instruction::Operator(op) => {
                let rhs = operands.pop(pc)?;
                let lhs = operands.pop(pc)?;
                operands.push(pc, ops::binary(op, lhs, rhs))?;
            }
            Instruction::Jump(rel) => target = jump_target(pc, next, rel, code.len())?,
            Instruction::JumpIfFalse(rel) => {
                let cond = operands.pop(pc)?;
                if !cond.is_truthy() {
                    target = jump_target(pc, next, rel, code.len())?;
                }
            }
            Instruction::Return => {
                return Ok(Step::Exit(operands.stack.pop().unwrap_or_default()));
            }
        }
        frame.pc = target;
        Ok(Step::Continue)
    }

    fn call(
        &self,
        pc: usize,
        name: &str,
        args: &[Value],
        depth: usize,
        session: &mut Session<'_>,
    ) -> Result<Callee, EvalError> {
        session.record(name);
        // The behavior is cloned out, so natives may mutate the registry.
        match self.registry.resolve(name) {
            Behavior::Unbound => {
                trace!(function = name, "unbound name resolved to unset");
                Ok(Callee::Done(Value::Unset))
            }
            Behavior::Native { func, deterministic } => {
                if !deterministic {
                    session.volatile = true;
                }
                Ok(Callee::Done(func(args, &session.ctx)))
            }
            Behavior::UserDefined(program) => {
                if depth + 1 > self.config.max_call_depth {
                    return Err(EvalError::malformed(
                        pc,
                        MalformedReason::CallDepthExceeded(self.config.max_call_depth),
                    ));
                }
                Ok(Callee::Enter(program))
            }
        }
    }
}

/// One activation: the program, its arguments and its operand stack.
struct Frame {
    program: Program,
    args: Args,
    pc: usize,
    /// Caller offset to continue at once this frame returns.
    resume: usize,
    /// Offset of the `Call` in the caller that entered this frame.
    call_site: usize,
    operands: Operands,
}

impl Frame {
    fn new(program: Program, args: Args, limit: usize, call_site: usize) -> Self {
        Self {
            program,
            args,
            pc: 0,
            resume: 0,
            call_site,
            operands: Operands {
                stack: Vec::with_capacity(8),
                limit,
            },
        }
    }
}

struct Operands {
    stack: Vec<Value>,
    limit: usize,
}

impl Operands {
    fn push(&mut self, pc: usize, value: Value) -> Result<(), EvalError> {
        if self.stack.len() >= self.limit {
            return Err(EvalError::malformed(pc, MalformedReason::StackOverflow(self.limit)));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self, pc: usize) -> Result<Value, EvalError> {
        self.stack
            .pop()
            .ok_or_else(|| EvalError::malformed(pc, MalformedReason::StackUnderflow))
    }

    /// Remove the top `n` values, bottom first.
    fn take(&mut self, pc: usize, n: usize) -> Result<Args, EvalError> {
        let len = self.stack.len();
        if n > len {
            return Err(EvalError::malformed(pc, MalformedReason::StackUnderflow));
        }
        Ok(self.stack.drain(len - n..).collect())
    }
}

/// Jumps are relative to the following instruction; landing exactly on the
/// end of the code is allowed and ends the frame.
fn jump_target(pc: usize, next: usize, rel: i16, len: usize) -> Result<usize, EvalError> {
    let target = next as isize + rel as isize;
    if target < 0 || target as usize > len {
        return Err(EvalError::malformed(pc, MalformedReason::JumpOutOfBounds(target)));
    }
    Ok(target as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;
    use std::cell::Cell;
    use strobe_core::{Opcode, ProgramBuilder};
    use strobe_runtime::TriggerBus;

    fn vm() -> Vm {
        let registry = Rc::new(FunctionRegistry::new(Rc::new(TriggerBus::new())));
        Vm::new(registry, VmConfig::default())
    }

    fn reason(err: EvalError) -> MalformedReason {
        err.reason().clone()
    }

    #[test]
    fn test_arithmetic() {
        let program = ProgramBuilder::new()
            .push_number(6.0)
            .push_number(7.0)
            .op(Opcode::Mul)
            .push_number(2.0)
            .op(Opcode::Sub)
            .finish();
        assert_eq!(vm().evaluate(&program, &[]).unwrap(), Value::Number(40.0));
    }

    #[test]
    fn test_empty_program_is_unset() {
        let program = Program::from_bytes(Vec::new());
        assert_eq!(vm().evaluate(&program, &[]).unwrap(), Value::Unset);
    }

    #[test]
    fn test_unbound_call_is_unset_and_recorded() {
        let program = ProgramBuilder::new().call("NeverRegistered", 0).finish();
        let vm = vm();
        let eval = vm
            .evaluate_with(&program, &[], CallContext::default())
            .unwrap();
        assert_eq!(eval.value, Value::Unset);
        assert_eq!(eval.dependencies, vec!["NeverRegistered".to_string()]);
        assert!(!eval.volatile);
        assert!(!vm.registry().contains("NeverRegistered"));
    }

    #[test]
    fn test_native_receives_arguments_in_order() {
        let vm = vm();
        vm.registry().register_native(
            "Join",
            |args, _| {
                Value::text(
                    args.iter()
                        .map(Value::display_pretty)
                        .collect::<Vec<_>>()
                        .join(","),
                )
            },
            true,
        );
        let program = ProgramBuilder::new()
            .push_text("a")
            .push_number(2.0)
            .push_bool(true)
            .call("Join", 3)
            .finish();
        assert_eq!(vm.evaluate(&program, &[]).unwrap(), Value::text("a,2,true"));
    }

    #[test]
    fn test_volatile_native_marks_evaluation() {
        let vm = vm();
        let ticks = Rc::new(Cell::new(0.0));
        let t = ticks.clone();
        vm.registry().register_native(
            "Tick",
            move |_, _| {
                t.set(t.get() + 1.0);
                Value::Number(t.get())
            },
            false,
        );
        let program = ProgramBuilder::new().call("Tick", 0).finish();
        let eval = vm
            .evaluate_with(&program, &[], CallContext::default())
            .unwrap();
        assert!(eval.volatile);
        assert_eq!(eval.value, Value::Number(1.0));
    }

    #[test]
    fn test_user_function_with_arguments_and_dependencies() {
        let vm = vm();
        vm.registry().register_native("Base", |_, _| Value::Number(10.0), true);
        let double_plus_base = ProgramBuilder::new()
            .load_arg(0)
            .push_number(2.0)
            .op(Opcode::Mul)
            .call("Base", 0)
            .op(Opcode::Add)
            .finish();
        vm.registry().register_user("Scale", double_plus_base);

        let program = ProgramBuilder::new().push_number(4.0).call("Scale", 1).finish();
        let eval = vm
            .evaluate_with(&program, &[], CallContext::default())
            .unwrap();
        assert_eq!(eval.value, Value::Number(18.0));
        assert_eq!(eval.dependencies, vec!["Scale".to_string(), "Base".to_string()]);
    }

    #[test]
    fn test_missing_argument_is_unset() {
        let program = ProgramBuilder::new().load_arg(3).finish();
        assert_eq!(vm().evaluate(&program, &[Value::Number(1.0)]).unwrap(), Value::Unset);
    }

    #[test]
    fn test_conditional_branches() -> Result<(), EvalError> {
        // if arg0 { "on" } else { "off" }
        let mut b = ProgramBuilder::new();
        b.load_arg(0);
        let to_else = b.jump_if_false();
        b.push_text("on");
        let to_end = b.jump();
        b.bind(to_else)?.push_text("off");
        b.bind(to_end)?;
        let program = b.finish();

        let vm = vm();
        assert_eq!(vm.evaluate(&program, &[Value::Boolean(true)])?, Value::text("on"));
        assert_eq!(vm.evaluate(&program, &[Value::Number(0.0)])?, Value::text("off"));
        Ok(())
    }

    #[test]
    fn test_return_stops_early() {
        let program = ProgramBuilder::new()
            .push_number(1.0)
            .ret()
            .push_number(2.0)
            .finish();
        assert_eq!(vm().evaluate(&program, &[]).unwrap(), Value::Number(1.0));
    }

    #[test]
    fn test_unknown_opcode_reports_offset() {
        let program = Program::from_bytes(vec![0x04, 0xee]);
        let err = vm().evaluate(&program, &[]).unwrap_err();
        assert_eq!(err.offset(), 1);
        assert_eq!(reason(err), MalformedReason::UnknownOpcode(0xee));
    }

    #[test]
    fn test_stack_underflow() {
        let program = ProgramBuilder::new().push_number(1.0).op(Opcode::Add).finish();
        let err = vm().evaluate(&program, &[]).unwrap_err();
        assert_eq!(reason(err), MalformedReason::StackUnderflow);
    }

    #[test]
    fn test_stack_overflow() {
        let registry = Rc::new(FunctionRegistry::new(Rc::new(TriggerBus::new())));
        let vm = Vm::new(
            registry,
            VmConfig {
                max_stack: 2,
                ..VmConfig::default()
            },
        );
        let program = ProgramBuilder::new()
            .push_unset()
            .push_unset()
            .push_unset()
            .finish();
        let err = vm.evaluate(&program, &[]).unwrap_err();
        assert_eq!(reason(err), MalformedReason::StackOverflow(2));
    }

    #[test]
    fn test_jump_out_of_bounds() {
        // Jump(+100)
        let program = Program::from_bytes(vec![0x40, 100, 0]);
        let err = vm().evaluate(&program, &[]).unwrap_err();
        assert_eq!(reason(err), MalformedReason::JumpOutOfBounds(103));
    }

    #[test]
    fn test_infinite_loop_exhausts_budget() -> Result<(), EvalError> {
        let registry = Rc::new(FunctionRegistry::new(Rc::new(TriggerBus::new())));
        let vm = Vm::new(
            registry,
            VmConfig {
                instruction_budget: 50,
                ..VmConfig::default()
            },
        );
        let mut b = ProgramBuilder::new();
        let top = b.label();
        b.jump_to(top)?;
        let err = vm.evaluate(&b.finish(), &[]).unwrap_err();
        assert_eq!(reason(err), MalformedReason::BudgetExhausted(50));
        Ok(())
    }

    #[test]
    fn test_runaway_recursion_is_bounded() {
        let vm = vm();
        vm.registry()
            .register_user("Loop", ProgramBuilder::new().call("Loop", 0).finish());
        let program = ProgramBuilder::new().call("Loop", 0).finish();
        let err = vm.evaluate(&program, &[]).unwrap_err();
        assert_eq!(reason(err), MalformedReason::CallDepthExceeded(64));
    }

    #[test]
    fn test_native_may_register_during_call() {
        let vm = vm();
        let registry = vm.registry().clone();
        vm.registry().register_native(
            "Install",
            move |_, _| {
                registry.register_native("Installed", |_, _| Value::Boolean(true), true);
                Value::Unset
            },
            true,
        );
        let program = ProgramBuilder::new()
            .call("Install", 0)
            .pop()
            .call("Installed", 0)
            .finish();
        assert_eq!(vm.evaluate(&program, &[]).unwrap(), Value::Boolean(true));
    }

    #[test]
    fn test_context_reaches_native() {
        let vm = vm();
        vm.registry().register_native(
            "WidgetName",
            |_, ctx| ctx.widget::<String>().cloned().into(),
            true,
        );
        vm.registry().register_native(
            "EventName",
            |_, ctx| ctx.event::<String>().cloned().into(),
            true,
        );
        let widget = String::from("battery");
        let event = String::from("Clock");
        let ctx = CallContext::new(Some(&widget as &dyn Any), Some(&event as &dyn Any));

        let program = ProgramBuilder::new().call("WidgetName", 0).finish();
        let eval = vm.evaluate_with(&program, &[], ctx).unwrap();
        assert_eq!(eval.value, Value::text("battery"));

        let program = ProgramBuilder::new().call("EventName", 0).finish();
        let eval = vm.evaluate_with(&program, &[], ctx).unwrap();
        assert_eq!(eval.value, Value::text("Clock"));
        // Without an event the native reads unset.
        assert_eq!(vm.evaluate(&program, &[]).unwrap(), Value::Unset);
    }

    #[test]
    fn test_deep_recursion_stays_off_native_stack() {
        let registry = Rc::new(FunctionRegistry::new(Rc::new(TriggerBus::new())));
        let vm = Vm::new(
            registry,
            VmConfig {
                max_call_depth: 20_000,
                instruction_budget: 1_000_000,
                ..VmConfig::default()
            },
        );
        vm.registry()
            .register_user("Loop", ProgramBuilder::new().call("Loop", 0).finish());
        let program = ProgramBuilder::new().call("Loop", 0).finish();
        let err = vm.evaluate(&program, &[]).unwrap_err();
        assert_eq!(reason(err), MalformedReason::CallDepthExceeded(20_000));
    }

    #[test]
    fn test_nested_user_calls_resume_caller() {
        // Inc(x) = x + 1; Twice(x) = Inc(Inc(x)) * 10
        let vm = vm();
        vm.registry().register_user(
            "Inc",
            ProgramBuilder::new()
                .load_arg(0)
                .push_number(1.0)
                .op(Opcode::Add)
                .finish(),
        );
        vm.registry().register_user(
            "Twice",
            ProgramBuilder::new()
                .load_arg(0)
                .call("Inc", 1)
                .call("Inc", 1)
                .push_number(10.0)
                .op(Opcode::Mul)
                .finish(),
        );
        let program = ProgramBuilder::new()
            .push_number(1.0)
            .call("Twice", 1)
            .push_text("!")
            .pop()
            .finish();
        assert_eq!(vm.evaluate(&program, &[]).unwrap(), Value::Number(30.0));
    }
}
