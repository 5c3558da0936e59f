//! The sound server side of mixer commands.

use crate::device::Interface;
use std::cell::RefCell;

/// Requests the mixer sends back to the sound server. Calls are fire and
/// forget; the server confirms by sending a fresh
/// [`MixerEvent::DeviceUpdated`](crate::MixerEvent::DeviceUpdated).
pub trait MixerBackend {
    /// Set per-channel volumes, in percent.
    fn set_volume(&self, interface: Interface, index: u32, volumes: &[f64]);
    fn set_mute(&self, interface: Interface, index: u32, mute: bool);
    /// Route client stream `stream` to sink `sink`.
    fn move_client(&self, stream: u32, sink: u32);
}

/// A request recorded by [`RecordingBackend`].
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    SetVolume {
        interface: Interface,
        index: u32,
        volumes: Vec<f64>,
    },
    SetMute {
        interface: Interface,
        index: u32,
        mute: bool,
    },
    MoveClient {
        stream: u32,
        sink: u32,
    },
}

/// Backend that only records requests, for running without a server.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    calls: RefCell<Vec<BackendCall>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<BackendCall> {
        std::mem::take(&mut *self.calls.borrow_mut())
    }
}

impl MixerBackend for RecordingBackend {
    fn set_volume(&self, interface: Interface, index: u32, volumes: &[f64]) {
        self.calls.borrow_mut().push(BackendCall::SetVolume {
            interface,
            index,
            volumes: volumes.to_vec(),
        });
    }

    fn set_mute(&self, interface: Interface, index: u32, mute: bool) {
        self.calls.borrow_mut().push(BackendCall::SetMute {
            interface,
            index,
            mute,
        });
    }

    fn move_client(&self, stream: u32, sink: u32) {
        self.calls
            .borrow_mut()
            .push(BackendCall::MoveClient { stream, sink });
    }
}
