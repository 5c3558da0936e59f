//! Device tables for the three mixer interfaces and the address and
//! command-argument parsing that selects and adjusts devices.

use std::fmt;
use std::str::FromStr;
use strobe_runtime::SyntheticId;
use thiserror::Error;

/// Tag used in every identifier this module hands out.
pub const ID_TAG: &str = "mixer";

/// Upper bound for volume adjustments, in percent.
pub const VOLUME_MAX: f64 = 150.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interface {
    Sink,
    Source,
    /// Per-application playback streams.
    Client,
}

impl Interface {
    pub const ALL: [Interface; 3] = [Interface::Sink, Interface::Source, Interface::Client];

    pub fn prefix(self) -> &'static str {
        match self {
            Interface::Sink => "sink",
            Interface::Source => "source",
            Interface::Client => "client",
        }
    }

    fn slot(self) -> usize {
        match self {
            Interface::Sink => 0,
            Interface::Source => 1,
            Interface::Client => 2,
        }
    }

    /// Split `"sink-volume"` into the interface and the rest after the
    /// separator.
    pub fn split_prefix(s: &str) -> Option<(Interface, &str)> {
        Interface::ALL.into_iter().find_map(|iface| {
            let rest = s.strip_prefix(iface.prefix())?;
            let mut chars = rest.chars();
            chars.next();
            Some((iface, chars.as_str()))
        })
    }

    pub fn id(self, index: u32) -> SyntheticId {
        SyntheticId::new(ID_TAG, self.prefix(), index)
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown mixer interface '{0}'")]
pub struct UnknownInterface(pub String);

impl FromStr for Interface {
    type Err = UnknownInterface;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Interface::ALL
            .into_iter()
            .find(|i| i.prefix() == s)
            .ok_or_else(|| UnknownInterface(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelVolume {
    /// Position name, e.g. `front-left`.
    pub position: String,
    /// Percent of nominal volume.
    pub volume: f64,
}

impl ChannelVolume {
    pub fn new(position: impl Into<String>, volume: f64) -> Self {
        Self {
            position: position.into(),
            volume,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Device {
    pub index: u32,
    pub name: String,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub form: Option<String>,
    pub port: Option<String>,
    pub monitor: Option<String>,
    pub mute: bool,
    pub channels: Vec<ChannelVolume>,
    /// Owning client, for client streams.
    pub client: Option<u32>,
}

impl Device {
    pub fn new(index: u32, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            ..Self::default()
        }
    }

    /// Average over all channels.
    pub fn volume(&self) -> f64 {
        if self.channels.is_empty() {
            return 0.0;
        }
        self.channels.iter().map(|c| c.volume).sum::<f64>() / self.channels.len() as f64
    }

    /// Volume of channel `cidx` (1-based), or the average for 0.
    pub fn channel_volume(&self, cidx: usize) -> f64 {
        match cidx.checked_sub(1).and_then(|i| self.channels.get(i)) {
            Some(channel) => channel.volume,
            None => self.volume(),
        }
    }

    /// 1-based index of the channel at `position`; the last match wins.
    pub fn channel_index(&self, position: &str) -> Option<usize> {
        self.channels
            .iter()
            .rposition(|c| c.position.eq_ignore_ascii_case(position))
            .map(|i| i + 1)
    }

    /// Apply a volume argument: `+N`/`-N` is relative, a bare number is
    /// absolute. `cidx` selects one channel (1-based) or all for 0. Returns
    /// the new channel volumes, or `None` if the argument is not a number.
    pub fn adjust_volume(&self, cidx: usize, arg: &str) -> Option<Vec<f64>> {
        let arg = arg.trim_start();
        let amount = arg
            .trim_end()
            .parse::<f64>()
            .ok()
            .filter(|a| a.is_finite())?;
        let relative = arg.starts_with('+') || arg.starts_with('-');
        let delta = if relative {
            amount
        } else {
            amount - self.channel_volume(cidx)
        };

        let mut volumes: Vec<f64> = self.channels.iter().map(|c| c.volume).collect();
        match cidx.checked_sub(1) {
            None if delta > 0.0 => {
                for v in &mut volumes {
                    *v = (*v + delta).min(VOLUME_MAX);
                }
            }
            None => {
                for v in &mut volumes {
                    *v = (*v + delta).max(0.0);
                }
            }
            Some(i) => {
                let v = volumes.get_mut(i)?;
                *v = (*v + delta).clamp(0.0, VOLUME_MAX);
            }
        }
        Some(volumes)
    }
}

/// Parse a mute argument: `toggle`, `true` or `false`. Anything else keeps
/// the current state.
pub fn parse_mute(arg: &str, current: bool) -> bool {
    let arg = arg.trim();
    if arg.eq_ignore_ascii_case("toggle") {
        !current
    } else if arg.eq_ignore_ascii_case("true") {
        true
    } else if arg.eq_ignore_ascii_case("false") {
        false
    } else {
        current
    }
}

/// Devices of one interface plus its default device name.
#[derive(Debug, Default)]
pub(crate) struct DeviceTable {
    devices: Vec<Device>,
    default_name: Option<String>,
    /// The default was set by the user and ignores server announcements.
    fixed: bool,
}

impl DeviceTable {
    pub fn get(&self, index: u32) -> Option<&Device> {
        self.devices.iter().find(|d| d.index == index)
    }

    pub fn by_name(&self, name: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.name == name)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.devices.iter_mut()
    }

    /// Insert or replace by index. Returns true for a device not seen
    /// before.
    pub fn upsert(&mut self, device: Device) -> bool {
        match self.devices.iter_mut().find(|d| d.index == device.index) {
            Some(slot) => {
                *slot = device;
                false
            }
            None => {
                self.devices.push(device);
                true
            }
        }
    }

    pub fn remove(&mut self, index: u32) -> Option<Device> {
        let pos = self.devices.iter().position(|d| d.index == index)?;
        Some(self.devices.remove(pos))
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default_name.as_deref()
    }

    /// Set the default device name. A server announcement (`fixed` false)
    /// is ignored once the user fixed a default. Returns whether the name
    /// changed.
    pub fn set_default(&mut self, name: &str, fixed: bool) -> bool {
        if !fixed && self.fixed {
            return false;
        }
        self.fixed = fixed;
        let changed = self.default_name.as_deref() != Some(name);
        self.default_name = Some(name.to_string());
        changed
    }

    /// Resolve an address: `@mixer-<iface>-<index>[:channel]`, a device
    /// name, or nothing for the default device. Returns the device and the
    /// 1-based channel index (0 for the whole device).
    pub fn resolve(&self, address: Option<&str>) -> Option<(&Device, usize)> {
        let (device, channel) = match address {
            Some(addr) => match addr.split_once(':') {
                Some((device, channel)) => (Some(device), Some(channel)),
                None => (Some(addr), None),
            },
            None => (None, None),
        };

        let found = match device {
            Some(d) if SyntheticId::has_tag(d, ID_TAG) => d
                .rsplit_once('-')
                .and_then(|(_, index)| index.parse::<u32>().ok())
                .and_then(|index| self.get(index)),
            Some(name) => self.by_name(name),
            None => self.default_name().and_then(|name| self.by_name(name)),
        }?;

        let cidx = channel
            .and_then(|position| found.channel_index(position))
            .unwrap_or(0);
        Some((found, cidx))
    }
}

/// The three device tables.
#[derive(Debug, Default)]
pub(crate) struct Tables([DeviceTable; 3]);

impl Tables {
    pub fn get(&self, iface: Interface) -> &DeviceTable {
        &self.0[iface.slot()]
    }

    pub fn get_mut(&mut self, iface: Interface) -> &mut DeviceTable {
        &mut self.0[iface.slot()]
    }
}
