//! Natives every runtime starts with: generic access to module queues by
//! name, for configurations that read a producer's queue directly.

use crate::registry::FunctionRegistry;
use std::rc::Rc;
use strobe_core::Value;
use strobe_runtime::{QueueDirectory, TriggerBus};
use tracing::trace;

/// `QueueGet(queue, property)`: property of the front item, or unset.
pub const QUEUE_GET: &str = "QueueGet";
/// `QueueLength(queue)`: number of pending items.
pub const QUEUE_LENGTH: &str = "QueueLength";
/// `QueueAck(queue)`: drop the front item.
pub const QUEUE_ACK: &str = "QueueAck";

pub(crate) fn install(
    registry: &FunctionRegistry,
    queues: &Rc<QueueDirectory>,
    bus: &Rc<TriggerBus>,
) {
    let dir = queues.clone();
    registry.register_native(
        QUEUE_GET,
        move |args, _| {
            let (Some(queue), Some(property)) = (text_arg(args, 0), text_arg(args, 1)) else {
                return Value::Unset;
            };
            dir.get(queue)
                .and_then(|q| q.get_property(property))
                .into()
        },
        false,
    );

    let dir = queues.clone();
    registry.register_native(
        QUEUE_LENGTH,
        move |args, _| match text_arg(args, 0).and_then(|name| dir.get(name)) {
            Some(q) => Value::Number(q.len() as f64),
            None => Value::Unset,
        },
        false,
    );

    let (dir, bus) = (queues.clone(), bus.clone());
    registry.register_native(
        QUEUE_ACK,
        move |args, _| {
            if let Some(name) = text_arg(args, 0) {
                acknowledge(&dir, &bus, name);
            }
            Value::Unset
        },
        false,
    );
}

/// Pop the front item of `name`. When items remain, the queue trigger is
/// fired so readers move on to the next one. Returns whether an item was
/// removed.
pub(crate) fn acknowledge(queues: &QueueDirectory, bus: &TriggerBus, name: &str) -> bool {
    let Some(queue) = queues.get(name) else {
        trace!(queue = name, "acknowledge on unknown queue");
        return false;
    };
    if !queue.pop_front() {
        return false;
    }
    if !queue.is_empty() {
        let trigger = queue.trigger().to_string();
        bus.fire(&trigger);
    }
    true
}

fn text_arg(args: &[Value], index: usize) -> Option<&str> {
    args.get(index).and_then(Value::as_text)
}
