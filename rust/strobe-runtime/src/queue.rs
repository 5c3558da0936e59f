//! Module event queues.
//!
//! Producers publish state changes as items in a [`ModuleQueue`]. The front
//! item is the oldest unacknowledged one; expressions read it with
//! [`get_property`](ModuleQueue::get_property) and an acknowledgment action
//! removes it with [`pop_front`](ModuleQueue::pop_front).
//!
//! No two items in a queue describe the same entity: appending an item that
//! [`QueueItem::same_entity`] matches an existing one replaces that item in
//! place, keeping its position.

use crate::trigger::TriggerBus;
use rustc_hash::FxHashMap;
use std::any::{type_name, Any};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

/// Operations a producer supplies for its item type.
///
/// Duplication is [`Clone`] and release is [`Drop`].
pub trait QueueItem: Clone + 'static {
    /// Whether `self` and `other` describe the same logical entity.
    fn same_entity(&self, other: &Self) -> bool;

    /// String form of property `name`, or `None` if the item has no such
    /// property.
    fn property(&self, name: &str) -> Option<String>;
}

/// Type-erased view used by the evaluator's built-in natives.
pub trait EventQueue {
    fn trigger(&self) -> &str;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn get_property(&self, name: &str) -> Option<String>;
    /// Remove the front item. Returns false on an empty queue.
    fn pop_front(&self) -> bool;
}

/// Ordered pending items of one producer, front first, plus the trigger
/// fired when they change.
pub struct ModuleQueue<T> {
    trigger: String,
    items: RefCell<VecDeque<T>>,
    bus: Rc<TriggerBus>,
}

impl<T> fmt::Debug for ModuleQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleQueue")
            .field("trigger", &self.trigger)
            .field("len", &self.items.borrow().len())
            .finish()
    }
}

impl<T: QueueItem> ModuleQueue<T> {
    /// An empty queue that fires `trigger` on `bus`.
    pub fn new(bus: Rc<TriggerBus>, trigger: impl Into<String>) -> Self {
        Self {
            trigger: trigger.into(),
            items: RefCell::new(VecDeque::new()),
            bus,
        }
    }

    /// Name fired on every append.
    pub fn trigger(&self) -> &str {
        &self.trigger
    }

    /// Take ownership of `item`, replacing an item for the same entity in
    /// place or appending at the back. Fires the queue trigger exactly once.
    pub fn append(&self, item: T) {
        let displaced = {
            let mut items = self.items.borrow_mut();
            match items.iter().position(|e| e.same_entity(&item)) {
                Some(pos) => Some(std::mem::replace(&mut items[pos], item)),
                None => {
                    items.push_back(item);
                    None
                }
            }
        };
        if displaced.is_some() {
            tracing::debug!(trigger = %self.trigger, "queue item replaced in place");
        }
        drop(displaced);
        self.bus.fire(&self.trigger);
    }

    /// Read property `name` from the front item without mutating the queue.
    pub fn get_property(&self, name: &str) -> Option<String> {
        self.items.borrow().front().and_then(|item| item.property(name))
    }

    /// Remove and return the front item. Does not fire the trigger.
    pub fn pop_front(&self) -> Option<T> {
        self.items.borrow_mut().pop_front()
    }

    /// Number of pending items.
    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.borrow().is_empty()
    }

    /// Duplicates of all pending items, front first.
    pub fn snapshot(&self) -> Vec<T> {
        self.items.borrow().iter().cloned().collect()
    }
}

impl<T: QueueItem> EventQueue for ModuleQueue<T> {
    fn trigger(&self) -> &str {
        &self.trigger
    }

    fn len(&self) -> usize {
        ModuleQueue::len(self)
    }

    fn get_property(&self, name: &str) -> Option<String> {
        ModuleQueue::get_property(self, name)
    }

    fn pop_front(&self) -> bool {
        ModuleQueue::pop_front(self).is_some()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue '{name}' holds {existing}, not {requested}")]
    TypeMismatch {
        name: String,
        existing: &'static str,
        requested: &'static str,
    },
}

struct QueueSlot {
    erased: Rc<dyn EventQueue>,
    typed: Rc<dyn Any>,
    item_type: &'static str,
}

/// Name-keyed directory of every module queue in the process.
pub struct QueueDirectory {
    bus: Rc<TriggerBus>,
    queues: RefCell<FxHashMap<String, QueueSlot>>,
}

impl fmt::Debug for QueueDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queues = self.queues.borrow();
        let mut names: Vec<&String> = queues.keys().collect();
        names.sort();
        f.debug_struct("QueueDirectory").field("queues", &names).finish()
    }
}

impl QueueDirectory {
    pub fn new(bus: Rc<TriggerBus>) -> Self {
        Self {
            bus,
            queues: RefCell::new(FxHashMap::default()),
        }
    }

    /// Fetch the queue registered under `name`, creating it with `trigger`
    /// on first use. The trigger of an existing queue is left unchanged.
    pub fn get_or_create<T: QueueItem>(
        &self,
        name: &str,
        trigger: &str,
    ) -> Result<Rc<ModuleQueue<T>>, QueueError> {
        if let Some(slot) = self.queues.borrow().get(name) {
            return slot
                .typed
                .clone()
                .downcast::<ModuleQueue<T>>()
                .map_err(|_| QueueError::TypeMismatch {
                    name: name.to_string(),
                    existing: slot.item_type,
                    requested: type_name::<T>(),
                });
        }

        let queue = Rc::new(ModuleQueue::<T>::new(self.bus.clone(), trigger));
        self.queues.borrow_mut().insert(
            name.to_string(),
            QueueSlot {
                erased: queue.clone(),
                typed: queue.clone(),
                item_type: type_name::<T>(),
            },
        );
        tracing::debug!(queue = name, trigger, "module queue created");
        Ok(queue)
    }

    /// Typed handle to an existing queue.
    pub fn typed<T: QueueItem>(&self, name: &str) -> Option<Rc<ModuleQueue<T>>> {
        let queues = self.queues.borrow();
        let slot = queues.get(name)?;
        slot.typed.clone().downcast::<ModuleQueue<T>>().ok()
    }

    /// Type-erased handle to an existing queue.
    pub fn get(&self, name: &str) -> Option<Rc<dyn EventQueue>> {
        self.queues.borrow().get(name).map(|slot| slot.erased.clone())
    }

    /// Forget the queue named `name`. Outstanding handles keep working but
    /// are no longer reachable by name.
    pub fn remove(&self, name: &str) -> bool {
        self.queues.borrow_mut().remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.borrow().keys().cloned().collect();
        names.sort();
        names
    }
}
