//! Named trigger fan-out.
//!
//! A trigger is a bare name. Firing it notifies every subscriber registered
//! under that name, synchronously and in subscription order. Subscribers come
//! in two tiers: invalidators (expression caches) run before listeners (the
//! host), so a listener that re-evaluates on notification never reads a value
//! cached before the change.
//!
//! A `fire` issued while a fan-out is in progress is queued and delivered
//! once the current fan-out finishes, preserving mutation order.

use rustc_hash::FxHashMap;
use slotmap::{new_key_type, SlotMap};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

new_key_type! {
    /// Handle returned by [`TriggerBus::subscribe`], used to unsubscribe.
    pub struct SubscriptionId;
}

/// Callback invoked with the name of the trigger that fired.
pub type TriggerCallback = Rc<dyn Fn(&str)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Invalidate,
    Listen,
}

struct Subscription {
    name: String,
    tier: Tier,
    callback: TriggerCallback,
}

/// Process-wide name → subscriber multimap.
#[derive(Default)]
pub struct TriggerBus {
    subscriptions: RefCell<SlotMap<SubscriptionId, Subscription>>,
    by_name: RefCell<FxHashMap<String, Vec<SubscriptionId>>>,
    pending: RefCell<VecDeque<String>>,
    dispatching: Cell<bool>,
}

impl fmt::Debug for TriggerBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerBus")
            .field("subscriptions", &self.subscriptions.borrow().len())
            .field("pending", &self.pending.borrow().len())
            .finish()
    }
}

impl TriggerBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a host listener to `name`.
    pub fn subscribe<F>(&self, name: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&str) + 'static,
    {
        self.insert(name, Tier::Listen, Rc::new(callback))
    }

    /// Subscribe a cache invalidator to `name`. Invalidators run before any
    /// listener of the same trigger.
    pub fn subscribe_invalidator<F>(&self, name: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&str) + 'static,
    {
        self.insert(name, Tier::Invalidate, Rc::new(callback))
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Some(sub) = self.subscriptions.borrow_mut().remove(id) else {
            return false;
        };
        let mut by_name = self.by_name.borrow_mut();
        if let Some(ids) = by_name.get_mut(&sub.name) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                by_name.remove(&sub.name);
            }
        }
        true
    }

    pub fn subscriber_count(&self, name: &str) -> usize {
        self.by_name.borrow().get(name).map_or(0, Vec::len)
    }

    pub fn is_dispatching(&self) -> bool {
        self.dispatching.get()
    }

    /// Notify every subscriber of `name`.
    ///
    /// Subscribers must not rely on a nested `fire` being delivered before
    /// they return: it is deferred until the outermost fan-out completes.
    pub fn fire(&self, name: &str) {
        self.pending.borrow_mut().push_back(name.to_string());
        if self.dispatching.get() {
            tracing::trace!(trigger = name, "trigger deferred until current fan-out completes");
            return;
        }

        let _guard = DispatchGuard::enter(&self.dispatching);
        loop {
            let next = self.pending.borrow_mut().pop_front();
            let Some(next) = next else { break };
            self.fan_out(&next);
        }
    }

    fn insert(&self, name: &str, tier: Tier, callback: TriggerCallback) -> SubscriptionId {
        let id = self.subscriptions.borrow_mut().insert(Subscription {
            name: name.to_string(),
            tier,
            callback,
        });
        self.by_name
            .borrow_mut()
            .entry(name.to_string())
            .or_default()
            .push(id);
        id
    }

    fn fan_out(&self, name: &str) {
        let targets: Vec<(SubscriptionId, TriggerCallback)> = {
            let by_name = self.by_name.borrow();
            let Some(ids) = by_name.get(name) else {
                tracing::trace!(trigger = name, "trigger fired with no subscribers");
                return;
            };
            let subs = self.subscriptions.borrow();
            let mut targets = Vec::with_capacity(ids.len());
            for tier in [Tier::Invalidate, Tier::Listen] {
                for id in ids {
                    if let Some(sub) = subs.get(*id).filter(|s| s.tier == tier) {
                        targets.push((*id, sub.callback.clone()));
                    }
                }
            }
            targets
        };

        tracing::trace!(trigger = name, subscribers = targets.len(), "trigger fan-out");
        for (id, callback) in targets {
            // An earlier subscriber may have unsubscribed this one.
            if !self.subscriptions.borrow().contains_key(id) {
                continue;
            }
            callback(name);
        }
    }
}

struct DispatchGuard<'a> {
    flag: &'a Cell<bool>,
}

impl<'a> DispatchGuard<'a> {
    fn enter(flag: &'a Cell<bool>) -> Self {
        flag.set(true);
        Self { flag }
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}
