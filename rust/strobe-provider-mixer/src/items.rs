//! Queue items announcing channels that appeared and devices that went away.

use crate::device::Interface;
use strobe_runtime::{QueueItem, SyntheticId};

/// One channel of a newly seen device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAdvert {
    pub interface: Interface,
    /// Zero-based position in the device's channel map.
    pub number: usize,
    pub channel: String,
    pub device: SyntheticId,
}

impl QueueItem for ChannelAdvert {
    fn same_entity(&self, other: &Self) -> bool {
        self.channel == other.channel
            && self.device == other.device
            && self.interface == other.interface
    }

    fn property(&self, name: &str) -> Option<String> {
        if name.eq_ignore_ascii_case("interface") {
            Some(self.interface.prefix().to_string())
        } else if name.eq_ignore_ascii_case("channel") {
            Some(self.channel.clone())
        } else if name.eq_ignore_ascii_case("device") {
            Some(self.device.to_string())
        } else if name.eq_ignore_ascii_case("ChannelNumber") {
            Some(self.number.to_string())
        } else {
            None
        }
    }
}

/// Identifier of a device that was removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal(pub SyntheticId);

impl QueueItem for Removal {
    fn same_entity(&self, other: &Self) -> bool {
        self == other
    }

    fn property(&self, name: &str) -> Option<String> {
        name.eq_ignore_ascii_case("RemovedDevice")
            .then(|| self.0.to_string())
    }
}
