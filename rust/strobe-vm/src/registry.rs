//! Function registry with replace-and-trigger invalidation.
//!
//! Every mutation that changes what a name resolves to fires that name on the
//! trigger bus, so caches that called the name drop their stored value. Looking
//! up a name that was never registered inserts an `Unbound` placeholder;
//! programs may therefore reference providers that load later.

use rustc_hash::FxHashMap;
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use strobe_core::{Program, Value};
use strobe_runtime::TriggerBus;
use tracing::debug;

/// Opaque context handed to native functions: the host entity that owns the
/// expression and, for actions, the event that started the evaluation.
#[derive(Clone, Copy, Default)]
pub struct CallContext<'a> {
    pub widget: Option<&'a dyn Any>,
    pub event: Option<&'a dyn Any>,
}

impl<'a> CallContext<'a> {
    pub fn new(widget: Option<&'a dyn Any>, event: Option<&'a dyn Any>) -> Self {
        Self { widget, event }
    }

    pub fn widget<T: Any>(&self) -> Option<&'a T> {
        self.widget.and_then(|w| w.downcast_ref())
    }

    pub fn event<T: Any>(&self) -> Option<&'a T> {
        self.event.and_then(|e| e.downcast_ref())
    }
}

impl fmt::Debug for CallContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("widget", &self.widget.is_some())
            .field("event", &self.event.is_some())
            .finish()
    }
}

/// A native function: call arguments and host context in, owned value out.
pub type NativeFn = Rc<dyn Fn(&[Value], &CallContext<'_>) -> Value>;

/// What a registered name resolves to.
#[derive(Clone)]
pub enum Behavior {
    /// A host closure. `deterministic: false` marks results that may change
    /// without the name firing; callers never cache them.
    Native { func: NativeFn, deterministic: bool },
    /// A bytecode function run in a nested frame with the call's arguments.
    UserDefined(Program),
    /// Placeholder for a name seen before any registration. Calls yield
    /// [`Value::Unset`].
    Unbound,
}

impl Behavior {
    /// Whether the entry resolves to a callable behavior.
    pub fn is_bound(&self) -> bool {
        !matches!(self, Behavior::Unbound)
    }

    /// Identity comparison: same native closure with the same flag, or the
    /// same program allocation.
    fn same_as(&self, other: &Behavior) -> bool {
        match (self, other) {
            (
                Behavior::Native { func: a, deterministic: da },
                Behavior::Native { func: b, deterministic: db },
            ) => Rc::ptr_eq(a, b) && da == db,
            (Behavior::UserDefined(a), Behavior::UserDefined(b)) => a.ptr_eq(b),
            (Behavior::Unbound, Behavior::Unbound) => true,
            _ => false,
        }
    }
}

impl fmt::Debug for Behavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Behavior::Native { deterministic, .. } => f
                .debug_struct("Native")
                .field("deterministic", deterministic)
                .finish_non_exhaustive(),
            Behavior::UserDefined(program) => f.debug_tuple("UserDefined").field(program).finish(),
            Behavior::Unbound => f.write_str("Unbound"),
        }
    }
}

/// Snapshot of one registry entry as returned by
/// [`FunctionRegistry::lookup`].
#[derive(Debug, Clone)]
pub struct FunctionEntry {
    pub name: String,
    pub behavior: Behavior,
}

/// Name to behavior mapping shared by the evaluator, the host and producer
/// modules. Each name has exactly one entry.
pub struct FunctionRegistry {
    entries: RefCell<FxHashMap<String, Behavior>>,
    bus: Rc<TriggerBus>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("entries", &self.entries.borrow().len())
            .finish()
    }
}

impl FunctionRegistry {
    pub fn new(bus: Rc<TriggerBus>) -> Self {
        Self {
            entries: RefCell::new(FxHashMap::default()),
            bus,
        }
    }

    /// Bind `name` to a native closure, replacing any previous behavior and
    /// firing `name`.
    pub fn register_native<F>(&self, name: &str, func: F, deterministic: bool)
    where
        F: Fn(&[Value], &CallContext<'_>) -> Value + 'static,
    {
        self.register_native_rc(name, Rc::new(func), deterministic);
    }

    /// Like [`register_native`](Self::register_native) for an already shared
    /// closure. Re-registering the same closure with the same flag is silent.
    pub fn register_native_rc(&self, name: &str, func: NativeFn, deterministic: bool) {
        self.replace(name, Behavior::Native { func, deterministic });
    }

    /// Bind `name` to a bytecode function. The displaced behavior is
    /// dropped before `name` fires.
    pub fn register_user(&self, name: &str, program: Program) {
        self.replace(name, Behavior::UserDefined(program));
    }

    /// Reset `name` to `Unbound`, keeping the entry. Returns whether it was
    /// bound before; only then does the trigger fire.
    pub fn unregister(&self, name: &str) -> bool {
        let previous = {
            let mut entries = self.entries.borrow_mut();
            match entries.get_mut(name) {
                Some(behavior) => std::mem::replace(behavior, Behavior::Unbound),
                None => return false,
            }
        };
        if !previous.is_bound() {
            return false;
        }
        drop(previous);
        debug!(function = name, "function unregistered");
        self.bus.fire(name);
        true
    }

    /// Resolve `name`, inserting an `Unbound` placeholder on first sight.
    pub fn lookup(&self, name: &str) -> FunctionEntry {
        let behavior = self
            .entries
            .borrow_mut()
            .entry(name.to_string())
            .or_insert(Behavior::Unbound)
            .clone();
        FunctionEntry {
            name: name.to_string(),
            behavior,
        }
    }

    /// Resolve `name` without inserting. Used by the evaluator, which never
    /// mutates the registry.
    pub fn resolve(&self, name: &str) -> Behavior {
        self.entries
            .borrow()
            .get(name)
            .cloned()
            .unwrap_or(Behavior::Unbound)
    }

    /// Whether `name` has an entry, bound or not.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.borrow().contains_key(name)
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.entries
            .borrow()
            .get(name)
            .is_some_and(Behavior::is_bound)
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Every known name, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.borrow().keys().cloned().collect();
        names.sort();
        names
    }

    fn replace(&self, name: &str, behavior: Behavior) {
        let kind = match &behavior {
            Behavior::Native { deterministic: true, .. } => "native",
            Behavior::Native { deterministic: false, .. } => "native (volatile)",
            Behavior::UserDefined(_) => "user",
            Behavior::Unbound => "unbound",
        };
        let previous = self
            .entries
            .borrow_mut()
            .insert(name.to_string(), behavior.clone());
        if previous.as_ref().is_some_and(|p| p.same_as(&behavior)) {
            return;
        }
        // Release the displaced program or closure before subscribers run.
        drop(previous);
        debug!(function = name, kind, "function registered");
        self.bus.fire(name);
    }
}
