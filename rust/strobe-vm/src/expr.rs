//! Expression caches keyed by generational handles.
//!
//! A cache remembers the last value of its program until a name the program
//! called fires on the trigger bus. Invalidation runs in the bus's
//! invalidator tier, ahead of host listeners, so a listener that re-reads
//! an expression sees the fresh value.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use slotmap::{new_key_type, SlotMap};
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use strobe_core::{Program, Value};
use strobe_runtime::{SubscriptionId, TriggerBus};
use tracing::{trace, warn};

new_key_type! {
    /// Handle to a bound expression; stale once unbound.
    pub struct ExprHandle;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvalMode {
    /// Evaluated at bind time and again by each refresh after invalidation.
    Eager,
    /// Evaluated only when read.
    #[default]
    Lazy,
}

/// One bound expression: its program and the last value it produced.
#[derive(Debug, Clone)]
pub struct ExpressionCache {
    program: Program,
    mode: EvalMode,
    last_value: Option<Value>,
    /// Last value handed out, kept across invalidation for change detection.
    shown: Option<Value>,
    epoch: u64,
    volatile: bool,
    subscriptions: FxHashMap<String, SubscriptionId>,
}

impl ExpressionCache {
    fn new(program: Program, mode: EvalMode) -> Self {
        Self {
            program,
            mode,
            last_value: None,
            shown: None,
            epoch: 0,
            volatile: false,
            subscriptions: FxHashMap::default(),
        }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn mode(&self) -> EvalMode {
        self.mode
    }

    /// The stored value, if still valid.
    pub fn cached(&self) -> Option<&Value> {
        self.last_value.as_ref()
    }

    /// The last evaluation called a nondeterministic native.
    pub fn is_volatile(&self) -> bool {
        self.volatile
    }

    pub fn dependencies(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.subscriptions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn invalidate(&mut self) {
        self.last_value = None;
        self.epoch += 1;
    }
}

/// Snapshot taken before evaluating a cache, outside any store borrow.
pub(crate) struct Pending {
    pub program: Program,
    pub epoch: u64,
}

pub(crate) enum Lookup {
    Hit(Value),
    Miss(Pending),
    Gone,
}

type Store = SlotMap<ExprHandle, ExpressionCache>;

/// Every expression cache of a runtime, keyed by [`ExprHandle`].
pub struct ExpressionStore {
    caches: Rc<RefCell<Store>>,
    bus: Rc<TriggerBus>,
}

impl ExpressionStore {
    pub fn new(bus: Rc<TriggerBus>) -> Self {
        Self {
            caches: Rc::new(RefCell::new(SlotMap::with_key())),
            bus,
        }
    }

    pub fn insert(&self, program: Program, mode: EvalMode) -> ExprHandle {
        self.caches
            .borrow_mut()
            .insert(ExpressionCache::new(program, mode))
    }

    /// Drop a cache and its bus subscriptions.
    pub fn remove(&self, handle: ExprHandle) -> bool {
        let removed = self.caches.borrow_mut().remove(handle);
        match removed {
            Some(cache) => {
                for id in cache.subscriptions.into_values() {
                    self.bus.unsubscribe(id);
                }
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, handle: ExprHandle) -> bool {
        self.caches.borrow().contains_key(handle)
    }

    pub fn len(&self) -> usize {
        self.caches.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.borrow().is_empty()
    }

    /// Run `f` against a snapshot of a cache. The store is not borrowed
    /// while `f` runs, so `f` may fire triggers or evaluate expressions.
    pub fn with<R>(&self, handle: ExprHandle, f: impl FnOnce(&ExpressionCache) -> R) -> Option<R> {
        let snapshot = self.caches.borrow().get(handle).cloned();
        snapshot.as_ref().map(f)
    }

    pub(crate) fn lookup(&self, handle: ExprHandle) -> Lookup {
        let caches = self.caches.borrow();
        match caches.get(handle) {
            None => Lookup::Gone,
            Some(cache) => match &cache.last_value {
                Some(v) => Lookup::Hit(v.clone()),
                None => Lookup::Miss(Pending {
                    program: cache.program.clone(),
                    epoch: cache.epoch,
                }),
            },
        }
    }

    /// Eager handles whose value has been invalidated.
    pub(crate) fn stale_eager(&self) -> Vec<ExprHandle> {
        self.caches
            .borrow()
            .iter()
            .filter(|(_, c)| c.mode == EvalMode::Eager && c.last_value.is_none())
            .map(|(h, _)| h)
            .collect()
    }

    pub(crate) fn shown(&self, handle: ExprHandle) -> Option<Value> {
        self.caches
            .borrow()
            .get(handle)
            .and_then(|c| c.shown.clone())
    }

    /// Record an evaluation result. Subscribes to newly seen dependencies
    /// and stores the value unless the evaluation was volatile or a
    /// dependency fired while it ran.
    pub(crate) fn complete(
        &self,
        handle: ExprHandle,
        pending: &Pending,
        value: &Value,
        dependencies: &[String],
        volatile: bool,
    ) {
        let fresh: Vec<String> = {
            let caches = self.caches.borrow();
            let Some(cache) = caches.get(handle) else {
                return;
            };
            dependencies
                .iter()
                .filter(|d| !cache.subscriptions.contains_key(d.as_str()))
                .cloned()
                .collect()
        };
        // Subscribing never fires, so no invalidator runs here.
        let added: Vec<(String, SubscriptionId)> = fresh
            .into_iter()
            .map(|name| {
                let id = self.watch(handle, &name);
                (name, id)
            })
            .collect();

        let mut caches = self.caches.borrow_mut();
        let Some(cache) = caches.get_mut(handle) else {
            drop(caches);
            for (_, id) in added {
                self.bus.unsubscribe(id);
            }
            return;
        };
        cache.subscriptions.extend(added);
        cache.volatile = volatile;
        cache.shown = Some(value.clone());
        if !volatile && cache.epoch == pending.epoch {
            cache.last_value = Some(value.clone());
        }
    }

    fn watch(&self, handle: ExprHandle, name: &str) -> SubscriptionId {
        let caches: Weak<RefCell<Store>> = Rc::downgrade(&self.caches);
        self.bus.subscribe_invalidator(name, move |fired| {
            let Some(caches) = caches.upgrade() else {
                return;
            };
            // The store is only borrowed for short bookkeeping, never across
            // a user callback, an evaluation or a fire.
            let Ok(mut caches) = caches.try_borrow_mut() else {
                warn!(trigger = fired, "expression store busy, invalidation lost");
                return;
            };
            if let Some(cache) = caches.get_mut(handle) {
                trace!(trigger = fired, "expression invalidated");
                cache.invalidate();
            }
        })
    }
}

impl std::fmt::Debug for ExpressionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpressionStore")
            .field("caches", &self.caches.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete(store: &ExpressionStore, h: ExprHandle, v: Value, deps: &[&str], volatile: bool) {
        let Lookup::Miss(pending) = store.lookup(h) else {
            panic!("expected a miss");
        };
        let deps: Vec<String> = deps.iter().map(|d| d.to_string()).collect();
        store.complete(h, &pending, &v, &deps, volatile);
    }

    #[test]
    fn test_hit_after_complete() {
        let bus = Rc::new(TriggerBus::new());
        let store = ExpressionStore::new(bus.clone());
        let h = store.insert(Program::from_bytes(vec![]), EvalMode::Lazy);
        complete(&store, h, Value::Number(1.0), &["A"], false);
        assert!(matches!(store.lookup(h), Lookup::Hit(Value::Number(n)) if n == 1.0));
        assert_eq!(store.with(h, |c| c.dependencies().len()), Some(1));
    }

    #[test]
    fn test_fire_invalidates() {
        let bus = Rc::new(TriggerBus::new());
        let store = ExpressionStore::new(bus.clone());
        let h = store.insert(Program::from_bytes(vec![]), EvalMode::Eager);
        complete(&store, h, Value::Number(1.0), &["A"], false);
        bus.fire("B");
        assert!(matches!(store.lookup(h), Lookup::Hit(_)));
        bus.fire("A");
        assert!(matches!(store.lookup(h), Lookup::Miss(_)));
        assert_eq!(store.stale_eager(), vec![h]);
        assert_eq!(store.shown(h), Some(Value::Number(1.0)));
    }

    #[test]
    fn test_volatile_never_stored() {
        let bus = Rc::new(TriggerBus::new());
        let store = ExpressionStore::new(bus);
        let h = store.insert(Program::from_bytes(vec![]), EvalMode::Lazy);
        complete(&store, h, Value::Number(1.0), &["Now"], true);
        assert!(matches!(store.lookup(h), Lookup::Miss(_)));
        assert_eq!(store.with(h, ExpressionCache::is_volatile), Some(true));
    }

    #[test]
    fn test_fire_during_evaluation_discards_result() {
        let bus = Rc::new(TriggerBus::new());
        let store = ExpressionStore::new(bus.clone());
        let h = store.insert(Program::from_bytes(vec![]), EvalMode::Lazy);
        complete(&store, h, Value::Number(1.0), &["A"], false);
        bus.fire("A");

        let Lookup::Miss(pending) = store.lookup(h) else {
            panic!("expected a miss");
        };
        // "A" changes while the program runs.
        bus.fire("A");
        store.complete(h, &pending, &Value::Number(2.0), &["A".to_string()], false);
        assert!(matches!(store.lookup(h), Lookup::Miss(_)));
    }

    #[test]
    fn test_fire_inside_with_invalidates() {
        let bus = Rc::new(TriggerBus::new());
        let store = ExpressionStore::new(bus.clone());
        let h = store.insert(Program::from_bytes(vec![]), EvalMode::Lazy);
        complete(&store, h, Value::Number(1.0), &["A"], false);

        let cached = store.with(h, |c| {
            bus.fire("A");
            c.cached().cloned()
        });
        // The closure saw the value as of the call; the store did not.
        assert_eq!(cached, Some(Some(Value::Number(1.0))));
        assert!(matches!(store.lookup(h), Lookup::Miss(_)));
    }

    #[test]
    fn test_remove_unsubscribes() {
        let bus = Rc::new(TriggerBus::new());
        let store = ExpressionStore::new(bus.clone());
        let h = store.insert(Program::from_bytes(vec![]), EvalMode::Lazy);
        complete(&store, h, Value::Unset, &["A", "B"], false);
        assert_eq!(bus.subscriber_count("A"), 1);
        assert!(store.remove(h));
        assert_eq!(bus.subscriber_count("A"), 0);
        assert_eq!(bus.subscriber_count("B"), 0);
        assert!(matches!(store.lookup(h), Lookup::Gone));
        assert!(!store.remove(h));
    }
}
