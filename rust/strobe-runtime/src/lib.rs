//! Strobe Runtime
//!
//! Plumbing shared by the evaluator and producer modules: the trigger bus,
//! module event queues, the loop mailbox and synthetic identifiers.

pub mod ident;
pub mod mailbox;
pub mod queue;
pub mod trigger;

pub use ident::SyntheticId;
pub use mailbox::{Mailbox, MailboxSender};
pub use queue::{EventQueue, ModuleQueue, QueueDirectory, QueueError, QueueItem};
pub use trigger::{SubscriptionId, TriggerBus};
