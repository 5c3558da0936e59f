//! Audio mixer producer for the strobe runtime.
//!
//! Keeps sink, source and client-stream tables fed by [`MixerEvent`]s from a
//! sound server connection and exposes them to expressions:
//! - `Mixer(query, address)`: device property, e.g. `Mixer("sink-volume")`
//! - `MixerChannel(property)`: front of the channel/removal queues
//! - `MixerCmd(command, address)`: `volume`, `mute` and `set-sink` requests
//! - `MixerSetDefaultSink(name)` / `MixerSetDefaultSource(name)`
//! - `MixerChannelAck()` / `MixerChannelAckRemoved()`
//!
//! Any state change fires the `Mixer` trigger. Events may be posted from any
//! thread through [`MixerModule::sender`]; they are applied on the loop
//! thread when the runtime dispatches.

pub mod backend;
pub mod device;
pub mod items;

pub use backend::{BackendCall, MixerBackend, RecordingBackend};
pub use device::{ChannelVolume, Device, Interface, UnknownInterface};
pub use items::{ChannelAdvert, Removal};

use device::{parse_mute, Tables};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use strobe_core::Value;
use strobe_runtime::{Mailbox, MailboxSender, ModuleQueue, QueueError, QueueItem, TriggerBus};
use strobe_vm::{LoopSource, Runtime};
use tracing::{debug, trace};

/// Queue (and trigger) announcing channels of new devices.
pub const CHANNEL_QUEUE: &str = "mixer_channel";
/// Queue (and trigger) announcing removed devices.
pub const REMOVED_QUEUE: &str = "mixer_removed";

/// Input from the sound server connection.
#[derive(Debug, Clone, PartialEq)]
pub enum MixerEvent {
    DeviceUpdated { interface: Interface, device: Device },
    DeviceRemoved { interface: Interface, index: u32 },
    /// A client's display name changed; applies to all its streams.
    ClientRenamed { client: u32, name: String },
    ServerDefaults { sink: String, source: String },
}

// ---------------------------------------------------------------------------
// MixerFunction enum
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerFunction {
    Mixer,
    MixerChannel,
    MixerCmd,
    MixerSetDefaultSink,
    MixerSetDefaultSource,
    MixerChannelAck,
    MixerChannelAckRemoved,
}

impl MixerFunction {
    pub const ALL: [MixerFunction; 7] = [
        MixerFunction::Mixer,
        MixerFunction::MixerChannel,
        MixerFunction::MixerCmd,
        MixerFunction::MixerSetDefaultSink,
        MixerFunction::MixerSetDefaultSource,
        MixerFunction::MixerChannelAck,
        MixerFunction::MixerChannelAckRemoved,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MixerFunction::Mixer => "Mixer",
            MixerFunction::MixerChannel => "MixerChannel",
            MixerFunction::MixerCmd => "MixerCmd",
            MixerFunction::MixerSetDefaultSink => "MixerSetDefaultSink",
            MixerFunction::MixerSetDefaultSource => "MixerSetDefaultSource",
            MixerFunction::MixerChannelAck => "MixerChannelAck",
            MixerFunction::MixerChannelAckRemoved => "MixerChannelAckRemoved",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            MixerFunction::Mixer => "Query a device property such as volume, mute, port or count",
            MixerFunction::MixerChannel => {
                "Read a property of the next channel or removal announcement"
            }
            MixerFunction::MixerCmd => {
                "Change volume or mute state, or move a client stream to another sink"
            }
            MixerFunction::MixerSetDefaultSink => {
                "Fix the default sink, overriding the server's choice"
            }
            MixerFunction::MixerSetDefaultSource => {
                "Fix the default source, overriding the server's choice"
            }
            MixerFunction::MixerChannelAck => "Acknowledge the front channel announcement",
            MixerFunction::MixerChannelAckRemoved => "Acknowledge the front removal announcement",
        }
    }

    /// Only `Mixer` reads state that is covered by the `Mixer` trigger; the
    /// rest read queues or act.
    pub fn deterministic(self) -> bool {
        matches!(self, MixerFunction::Mixer)
    }
}

// ---------------------------------------------------------------------------
// MixerModule
// ---------------------------------------------------------------------------

pub struct MixerModule {
    tables: RefCell<Tables>,
    channels: Rc<ModuleQueue<ChannelAdvert>>,
    removals: Rc<ModuleQueue<Removal>>,
    bus: Rc<TriggerBus>,
    backend: Rc<dyn MixerBackend>,
    inbox: Mailbox<MixerEvent>,
    sender: MailboxSender<MixerEvent>,
}

impl fmt::Debug for MixerModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MixerModule")
            .field("tables", &self.tables.borrow())
            .field("channels", &self.channels.len())
            .field("removals", &self.removals.len())
            .finish_non_exhaustive()
    }
}

impl MixerModule {
    /// Create the module's queues, register its functions and attach it to
    /// the runtime's loop dispatch.
    pub fn install(
        runtime: &Runtime,
        backend: Rc<dyn MixerBackend>,
    ) -> Result<Rc<Self>, QueueError> {
        let channels = runtime.queue::<ChannelAdvert>(CHANNEL_QUEUE, CHANNEL_QUEUE)?;
        let removals = runtime.queue::<Removal>(REMOVED_QUEUE, REMOVED_QUEUE)?;
        let (sender, inbox) = Mailbox::unbounded();
        let module = Rc::new(Self {
            tables: RefCell::new(Tables::default()),
            channels,
            removals,
            bus: runtime.bus().clone(),
            backend,
            inbox,
            sender,
        });

        for function in MixerFunction::ALL {
            let m = module.clone();
            runtime.register_native(
                function.name(),
                move |args, _| m.call(function, args),
                function.deterministic(),
            );
        }
        runtime.add_source(module.clone());
        debug!(functions = MixerFunction::ALL.len(), "mixer module installed");
        Ok(module)
    }

    /// Handle for posting events from the connection thread.
    pub fn sender(&self) -> MailboxSender<MixerEvent> {
        self.sender.clone()
    }

    fn call(&self, function: MixerFunction, args: &[Value]) -> Value {
        let text = |i: usize| args.get(i).and_then(Value::as_text);
        match function {
            MixerFunction::Mixer => match text(0) {
                Some(query) => self.query(query, text(1)),
                None => Value::Unset,
            },
            MixerFunction::MixerChannel => match text(0) {
                Some(property) => self.channel_property(property),
                None => Value::Unset,
            },
            MixerFunction::MixerCmd => {
                if let Some(command) = text(0) {
                    self.command(command, text(1));
                }
                Value::Unset
            }
            MixerFunction::MixerSetDefaultSink => {
                if let Some(name) = text(0) {
                    self.set_default(Interface::Sink, name);
                }
                Value::Unset
            }
            MixerFunction::MixerSetDefaultSource => {
                if let Some(name) = text(0) {
                    self.set_default(Interface::Source, name);
                }
                Value::Unset
            }
            MixerFunction::MixerChannelAck => {
                self.ack(&self.channels);
                Value::Unset
            }
            MixerFunction::MixerChannelAckRemoved => {
                self.ack(&self.removals);
                Value::Unset
            }
        }
    }

    /// Answer `<iface>-<property>` for the device at `address`, or for the
    /// interface default when no address is given.
    pub fn query(&self, query: &str, address: Option<&str>) -> Value {
        let Some((iface, property)) = Interface::split_prefix(query) else {
            return Value::Unset;
        };
        let tables = self.tables.borrow();
        let table = tables.get(iface);
        if property.eq_ignore_ascii_case("count") {
            return Value::Number(table.len() as f64);
        }
        let Some((device, cidx)) = table.resolve(address) else {
            return Value::Unset;
        };
        let text = |s: &Option<String>| Value::text(s.as_deref().unwrap_or(""));
        match property.to_ascii_lowercase().as_str() {
            "volume" => Value::Number(device.channel_volume(cidx)),
            "mute" => Value::Boolean(device.mute),
            "icon" => text(&device.icon),
            "form" => text(&device.form),
            "port" => text(&device.port),
            "monitor" => text(&device.monitor),
            "description" => text(&device.description),
            _ => Value::text(format!("invalid query: {}", property)),
        }
    }

    /// Property of the front channel announcement, falling back to the
    /// front removal announcement.
    pub fn channel_property(&self, property: &str) -> Value {
        self.channels
            .get_property(property)
            .or_else(|| self.removals.get_property(property))
            .into()
    }

    /// Execute `<iface>-<verb> <argument>` against the device at `address`.
    pub fn command(&self, command: &str, address: Option<&str>) {
        let Some((iface, verb)) = Interface::split_prefix(command) else {
            trace!(command, "mixer command without interface");
            return;
        };

        enum Request {
            Volume(u32, Vec<f64>),
            Mute(u32, bool),
            Move(u32, u32),
        }

        let request = {
            let tables = self.tables.borrow();
            let Some((device, cidx)) = tables.get(iface).resolve(address) else {
                trace!(command, address, "mixer command for unknown device");
                return;
            };
            if let Some(arg) = strip_prefix_ci(verb, "volume") {
                device
                    .adjust_volume(cidx, arg)
                    .map(|volumes| Request::Volume(device.index, volumes))
            } else if let Some(arg) = strip_prefix_ci(verb, "mute") {
                Some(Request::Mute(device.index, parse_mute(arg, device.mute)))
            } else if let Some(arg) = strip_prefix_ci(verb, "set-sink") {
                match (iface, device.client) {
                    (Interface::Client, Some(_)) => tables
                        .get(Interface::Sink)
                        .resolve(Some(arg.trim_start()))
                        .map(|(sink, _)| Request::Move(device.index, sink.index)),
                    _ => None,
                }
            } else {
                None
            }
        };

        match request {
            Some(Request::Volume(index, volumes)) => {
                debug!(interface = %iface, index, "mixer set volume");
                self.backend.set_volume(iface, index, &volumes);
            }
            Some(Request::Mute(index, mute)) => {
                debug!(interface = %iface, index, mute, "mixer set mute");
                self.backend.set_mute(iface, index, mute);
            }
            Some(Request::Move(stream, sink)) => {
                debug!(stream, sink, "mixer move client");
                self.backend.move_client(stream, sink);
            }
            None => trace!(command, "mixer command ignored"),
        }
    }

    /// Fix the default device of `iface`; later server announcements no
    /// longer change it.
    pub fn set_default(&self, iface: Interface, name: &str) {
        let changed = self.tables.borrow_mut().get_mut(iface).set_default(name, true);
        if changed {
            self.notify();
        }
    }

    /// Apply one event from the server connection.
    pub fn apply(&self, event: MixerEvent) {
        match event {
            MixerEvent::DeviceUpdated { interface, mut device } => {
                let index = device.index;
                let positions: Vec<String> =
                    device.channels.iter().map(|c| c.position.clone()).collect();
                let is_new = {
                    let mut tables = self.tables.borrow_mut();
                    let table = tables.get_mut(interface);
                    // Client descriptions come from ClientRenamed.
                    if interface == Interface::Client && device.description.is_none() {
                        device.description = table.get(index).and_then(|d| d.description.clone());
                    }
                    table.upsert(device)
                };
                self.notify();
                if is_new {
                    debug!(interface = %interface, index, "mixer device added");
                    for (number, channel) in positions.into_iter().enumerate() {
                        self.channels.append(ChannelAdvert {
                            interface,
                            number,
                            channel,
                            device: interface.id(index),
                        });
                    }
                }
            }
            MixerEvent::DeviceRemoved { interface, index } => {
                let removed = self.tables.borrow_mut().get_mut(interface).remove(index);
                if removed.is_some() {
                    debug!(interface = %interface, index, "mixer device removed");
                    self.removals.append(Removal(interface.id(index)));
                    self.notify();
                }
            }
            MixerEvent::ClientRenamed { client, name } => {
                let mut changed = false;
                {
                    let mut tables = self.tables.borrow_mut();
                    for stream in tables.get_mut(Interface::Client).iter_mut() {
                        if stream.client == Some(client)
                            && stream.description.as_deref() != Some(name.as_str())
                        {
                            stream.description = Some(name.clone());
                            changed = true;
                        }
                    }
                }
                if changed {
                    self.notify();
                }
            }
            MixerEvent::ServerDefaults { sink, source } => {
                let changed = {
                    let mut tables = self.tables.borrow_mut();
                    let sink_changed = tables.get_mut(Interface::Sink).set_default(&sink, false);
                    let source_changed =
                        tables.get_mut(Interface::Source).set_default(&source, false);
                    sink_changed || source_changed
                };
                if changed {
                    self.notify();
                }
            }
        }
    }

    fn ack<T: QueueItem>(&self, queue: &ModuleQueue<T>) {
        if queue.pop_front().is_some() && !queue.is_empty() {
            self.bus.fire(queue.trigger());
        }
    }

    fn notify(&self) {
        self.bus.fire(MixerFunction::Mixer.name());
    }
}

impl LoopSource for MixerModule {
    fn pump(&self, _runtime: &Runtime) -> usize {
        let events = self.inbox.drain();
        let applied = events.len();
        for event in events {
            self.apply(event);
        }
        applied
    }
}

/// ASCII case-insensitive `strip_prefix`.
fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &s[prefix.len()..])
}
