//! The host-facing runtime: one trigger bus, registry, queue directory and
//! cache store wired together, plus the mailbox through which other threads
//! reach the loop.

use crate::builtins;
use crate::config::RuntimeConfig;
use crate::expr::{EvalMode, ExprHandle, ExpressionStore, Lookup};
use crate::registry::{CallContext, FunctionEntry, FunctionRegistry, NativeFn};
use crate::vm::Vm;
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use strobe_core::{EvalError, Program, Value};
use strobe_runtime::mailbox::MailboxSendError;
use strobe_runtime::{
    Mailbox, MailboxSender, ModuleQueue, QueueDirectory, QueueError, QueueItem, SubscriptionId,
    TriggerBus,
};
use tracing::{debug, trace, warn};

/// Work posted to the loop thread.
pub enum LoopMessage {
    Fire(String),
    Task(Box<dyn FnOnce(&Runtime) + Send>),
}

impl fmt::Debug for LoopMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopMessage::Fire(name) => f.debug_tuple("Fire").field(name).finish(),
            LoopMessage::Task(_) => f.write_str("Task(..)"),
        }
    }
}

/// `Send` handle for posting work to the runtime from any thread.
#[derive(Debug, Clone)]
pub struct LoopSender {
    inner: MailboxSender<LoopMessage>,
}

impl LoopSender {
    /// Fire `name` on the loop thread at the next dispatch.
    pub fn fire(&self, name: impl Into<String>) -> Result<(), MailboxSendError<LoopMessage>> {
        self.inner.send(LoopMessage::Fire(name.into()))
    }

    /// Run `task` on the loop thread at the next dispatch.
    pub fn post<F>(&self, task: F) -> Result<(), MailboxSendError<LoopMessage>>
    where
        F: FnOnce(&Runtime) + Send + 'static,
    {
        self.inner.send(LoopMessage::Task(Box::new(task)))
    }
}

/// A producer with its own buffered input, drained on the loop thread.
pub trait LoopSource {
    /// Apply everything buffered so far. Returns the number of events
    /// applied.
    fn pump(&self, runtime: &Runtime) -> usize;
}

/// Host-facing runtime. Owns every shared structure and lives on the loop
/// thread; other threads reach it through [`LoopSender`].
pub struct Runtime {
    config: RuntimeConfig,
    bus: Rc<TriggerBus>,
    registry: Rc<FunctionRegistry>,
    queues: Rc<QueueDirectory>,
    vm: Rc<Vm>,
    exprs: ExpressionStore,
    mailbox: Mailbox<LoopMessage>,
    sender: LoopSender,
    sources: RefCell<Vec<Rc<dyn LoopSource>>>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("queues", &self.queues)
            .field("expressions", &self.exprs)
            .field("sources", &self.sources.borrow().len())
            .finish()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl Runtime {
    /// A runtime with the given limits and the built-in queue natives
    /// registered.
    pub fn new(config: RuntimeConfig) -> Self {
        let bus = Rc::new(TriggerBus::new());
        let registry = Rc::new(FunctionRegistry::new(bus.clone()));
        let queues = Rc::new(QueueDirectory::new(bus.clone()));
        builtins::install(&registry, &queues, &bus);
        let (inner, mailbox) = Mailbox::unbounded();
        Self {
            vm: Rc::new(Vm::new(registry.clone(), config.vm.clone())),
            exprs: ExpressionStore::new(bus.clone()),
            config,
            bus,
            registry,
            queues,
            mailbox,
            sender: LoopSender { inner },
            sources: RefCell::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn bus(&self) -> &Rc<TriggerBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Rc<FunctionRegistry> {
        &self.registry
    }

    pub fn queues(&self) -> &Rc<QueueDirectory> {
        &self.queues
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    pub fn expressions(&self) -> &ExpressionStore {
        &self.exprs
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    /// Bind `program` to a new cache. Eager caches are evaluated now.
    pub fn bind_expression(&self, program: Program, mode: EvalMode) -> ExprHandle {
        let handle = self.exprs.insert(program, mode);
        if mode == EvalMode::Eager {
            self.evaluate_cached(handle);
        }
        handle
    }

    /// Drop the cache behind `handle` and its subscriptions. Returns false
    /// for an unknown handle.
    pub fn unbind_expression(&self, handle: ExprHandle) -> bool {
        self.exprs.remove(handle)
    }

    /// [`evaluate_cached_with`](Self::evaluate_cached_with) without host
    /// context.
    pub fn evaluate_cached(&self, handle: ExprHandle) -> Value {
        self.evaluate_cached_with(handle, CallContext::default())
    }

    /// Current value of the expression behind `handle`. Served from the
    /// cache while valid; otherwise the program runs and the result is
    /// stored unless it came from a nondeterministic native. Malformed
    /// bytecode and unknown handles read as unset.
    pub fn evaluate_cached_with(&self, handle: ExprHandle, ctx: CallContext<'_>) -> Value {
        let pending = match self.exprs.lookup(handle) {
            Lookup::Hit(value) => return value,
            Lookup::Gone => return Value::Unset,
            Lookup::Miss(pending) => pending,
        };
        match self.vm.evaluate_with(&pending.program, &[], ctx) {
            Ok(eval) => {
                self.exprs.complete(
                    handle,
                    &pending,
                    &eval.value,
                    &eval.dependencies,
                    eval.volatile,
                );
                eval.value
            }
            Err(err) => {
                warn!(expression = ?handle, error = %err, "expression evaluation failed");
                Value::Unset
            }
        }
    }

    /// Re-evaluate Eager caches that were invalidated since the last read.
    /// Returns the handles whose value differs from what was last read.
    pub fn refresh(&self) -> Vec<ExprHandle> {
        let mut changed = Vec::new();
        for handle in self.exprs.stale_eager() {
            let before = self.exprs.shown(handle);
            let after = self.evaluate_cached(handle);
            if before.as_ref() != Some(&after) {
                changed.push(handle);
            }
        }
        if !changed.is_empty() {
            trace!(changed = changed.len(), "eager expressions refreshed");
        }
        changed
    }

    /// One-shot evaluation outside any cache.
    pub fn evaluate(&self, program: &Program, args: &[Value]) -> Value {
        match self.vm.evaluate(program, args) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "evaluation failed");
                Value::Unset
            }
        }
    }

    /// [`run_action_with`](Self::run_action_with) without host context.
    pub fn run_action(&self, program: &Program, args: &[Value]) -> Result<(), EvalError> {
        self.run_action_with(program, args, CallContext::default())
    }

    /// Run an action program for its side effects.
    pub fn run_action_with(
        &self,
        program: &Program,
        args: &[Value],
        ctx: CallContext<'_>,
    ) -> Result<(), EvalError> {
        perform(&self.vm, program, args, ctx)
    }

    /// Run `program` as an action every time `trigger` fires. The action
    /// sees the fired name as its event, readable by natives through
    /// [`CallContext::event`] as a `String`. A failing run is logged and
    /// later fires still run it. Unsubscribe the returned id to unbind.
    pub fn bind_trigger_action(&self, trigger: &str, program: Program) -> SubscriptionId {
        let vm: Weak<Vm> = Rc::downgrade(&self.vm);
        debug!(trigger, "action bound to trigger");
        self.bus.subscribe(trigger, move |fired| {
            let Some(vm) = vm.upgrade() else {
                return;
            };
            let event = fired.to_string();
            let ctx = CallContext::new(None, Some(&event as &dyn Any));
            // Already logged.
            let _ = perform(&vm, &program, &[], ctx);
        })
    }

    // ------------------------------------------------------------------
    // Functions
    // ------------------------------------------------------------------

    /// See [`FunctionRegistry::register_native`].
    pub fn register_native<F>(&self, name: &str, func: F, deterministic: bool)
    where
        F: Fn(&[Value], &CallContext<'_>) -> Value + 'static,
    {
        self.registry.register_native(name, func, deterministic);
    }

    pub fn register_native_rc(&self, name: &str, func: NativeFn, deterministic: bool) {
        self.registry.register_native_rc(name, func, deterministic);
    }

    /// See [`FunctionRegistry::register_user`].
    pub fn register_user(&self, name: &str, program: Program) {
        self.registry.register_user(name, program);
    }

    /// See [`FunctionRegistry::unregister`].
    pub fn unregister(&self, name: &str) -> bool {
        self.registry.unregister(name)
    }

    /// See [`FunctionRegistry::lookup`].
    pub fn lookup(&self, name: &str) -> FunctionEntry {
        self.registry.lookup(name)
    }

    // ------------------------------------------------------------------
    // Triggers
    // ------------------------------------------------------------------

    /// Listen for `name`. Listeners run after every cache has dropped
    /// values that depend on `name`.
    pub fn subscribe<F>(&self, name: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&str) + 'static,
    {
        self.bus.subscribe(name, callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    /// Fire `name` for state not modeled as a queue or registry entry.
    pub fn fire(&self, name: &str) {
        self.bus.fire(name);
    }

    // ------------------------------------------------------------------
    // Queues
    // ------------------------------------------------------------------

    /// The queue named `name`, created with `trigger` on first use.
    pub fn queue<T: QueueItem>(
        &self,
        name: &str,
        trigger: &str,
    ) -> Result<Rc<ModuleQueue<T>>, QueueError> {
        self.queues.get_or_create(name, trigger)
    }

    /// Append to the queue named `name`. A queue created here uses its own
    /// name as trigger.
    pub fn queue_append<T: QueueItem>(&self, name: &str, item: T) -> Result<(), QueueError> {
        let queue = match self.queues.typed::<T>(name) {
            Some(queue) => queue,
            None => self.queues.get_or_create::<T>(name, name)?,
        };
        queue.append(item);
        Ok(())
    }

    /// Drop the front item of `name` without firing. Returns false when the
    /// queue is unknown or empty.
    pub fn queue_pop_front(&self, name: &str) -> bool {
        self.queues.get(name).is_some_and(|q| q.pop_front())
    }

    /// Drop the front item and fire the queue trigger if more remain.
    pub fn queue_ack(&self, name: &str) -> bool {
        builtins::acknowledge(&self.queues, &self.bus, name)
    }

    // ------------------------------------------------------------------
    // Loop dispatch
    // ------------------------------------------------------------------

    /// A handle other threads use to reach this runtime.
    pub fn loop_sender(&self) -> LoopSender {
        self.sender.clone()
    }

    /// Pump `source` on every [`dispatch_pending`](Self::dispatch_pending).
    pub fn add_source(&self, source: Rc<dyn LoopSource>) {
        self.sources.borrow_mut().push(source);
    }

    /// Apply posted messages, then pump every source. Returns the number of
    /// messages and source events applied.
    pub fn dispatch_pending(&self) -> usize {
        let mut applied = 0;
        for message in self.mailbox.drain() {
            match message {
                LoopMessage::Fire(name) => self.bus.fire(&name),
                LoopMessage::Task(task) => task(self),
            }
            applied += 1;
        }
        let sources: Vec<Rc<dyn LoopSource>> = self.sources.borrow().clone();
        for source in sources {
            applied += source.pump(self);
        }
        if applied > 0 {
            debug!(applied, "loop dispatch");
        }
        applied
    }
}

fn perform(
    vm: &Vm,
    program: &Program,
    args: &[Value],
    ctx: CallContext<'_>,
) -> Result<(), EvalError> {
    vm.evaluate_with(program, args, ctx)
        .map(drop)
        .inspect_err(|err| warn!(error = %err, "action failed"))
}
