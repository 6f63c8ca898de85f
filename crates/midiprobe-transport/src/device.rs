use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{DeviceId, Result, TransportError};

/// Maximum number of driver-specific parameters accepted at open time.
pub const MAX_OPEN_PARAMS: usize = 2;

/// Data flow direction of an endpoint or handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => f.write_str("input"),
            Direction::Output => f.write_str("output"),
        }
    }
}

/// Endpoint as reported by an [`EndpointDirectory`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub id: DeviceId,
    /// Host interface name, e.g. "ALSA" or "CoreMIDI".
    pub interface: String,
    /// Human readable port name.
    pub name: String,
    pub direction: Direction,
    /// Whether the endpoint was created by this process.
    pub is_virtual: bool,
}

impl EndpointDescriptor {
    pub fn is_input(&self) -> bool {
        self.direction == Direction::Input
    }

    pub fn is_output(&self) -> bool {
        self.direction == Direction::Output
    }
}

/// Keys understood by backends when opening an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamKey {
    /// Name of the host-side client (ALSA sequencer client, midir client).
    ClientName,
    /// Name of the port created for the connection.
    PortName,
    /// Manufacturer string for hosts that publish one.
    Manufacturer,
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamKey::ClientName => f.write_str("client name"),
            ParamKey::PortName => f.write_str("port name"),
            ParamKey::Manufacturer => f.write_str("manufacturer name"),
        }
    }
}

/// Bounded, ordered list of driver-specific open parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenParams {
    entries: SmallVec<[(ParamKey, String); MAX_OPEN_PARAMS]>,
}

impl OpenParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a parameter, failing once the fixed capacity is reached.
    pub fn push(&mut self, key: ParamKey, value: impl Into<String>) -> Result<()> {
        if self.entries.len() >= MAX_OPEN_PARAMS {
            return Err(TransportError::TooManyParameters {
                limit: MAX_OPEN_PARAMS,
            });
        }
        self.entries.push((key, value.into()));
        Ok(())
    }

    /// Builder form of [`OpenParams::push`].
    pub fn with(mut self, key: ParamKey, value: impl Into<String>) -> Result<Self> {
        self.push(key, value)?;
        Ok(self)
    }

    /// First value stored for `key`.
    pub fn get(&self, key: ParamKey) -> Option<&str> {
        self.entries
            .iter()
            .find(|(candidate, _)| *candidate == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParamKey, &str)> {
        self.entries.iter().map(|(key, value)| (*key, value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TryFrom<Vec<(ParamKey, String)>> for OpenParams {
    type Error = TransportError;

    fn try_from(entries: Vec<(ParamKey, String)>) -> Result<Self> {
        let mut params = OpenParams::new();
        for (key, value) in entries {
            params.push(key, value)?;
        }
        Ok(params)
    }
}

/// Read-only view of the endpoints a host exposes.
pub trait EndpointDirectory {
    /// Number of endpoints; valid ids are `0..count_devices()`.
    fn count_devices(&self) -> usize;

    /// Descriptor for `id`, or `None` when out of range.
    fn device_info(&self, id: DeviceId) -> Option<EndpointDescriptor>;

    fn default_input_device(&self) -> Option<DeviceId>;

    fn default_output_device(&self) -> Option<DeviceId>;

    /// All descriptors in id order.
    fn devices(&self) -> Vec<EndpointDescriptor> {
        (0..self.count_devices())
            .filter_map(|id| self.device_info(id))
            .collect()
    }
}

/// Callback receiving raw bytes as they arrive on an input connection.
pub type InputSink = Box<dyn FnMut(&[u8]) + Send + 'static>;

/// Live native input connection. Dropping or closing it stops delivery.
pub trait NativeInput: Send {
    fn close(self: Box<Self>);
}

/// Live native output connection.
pub trait NativeOutput: Send {
    /// Transmit one message immediately.
    fn send(&mut self, bytes: &[u8]) -> Result<()>;

    fn close(self: Box<Self>);
}

/// Backend abstraction for platform specific MIDI implementations.
pub trait MidiBackend: EndpointDirectory {
    /// Open an input endpoint and start delivering messages to `sink`.
    fn open_input(
        &mut self,
        descriptor: &EndpointDescriptor,
        params: &OpenParams,
        sink: InputSink,
    ) -> Result<Box<dyn NativeInput>>;

    /// Open an output endpoint for immediate transmission.
    fn open_output(
        &mut self,
        descriptor: &EndpointDescriptor,
        params: &OpenParams,
    ) -> Result<Box<dyn NativeOutput>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedDirectory(Vec<EndpointDescriptor>);

    impl EndpointDirectory for FixedDirectory {
        fn count_devices(&self) -> usize {
            self.0.len()
        }

        fn device_info(&self, id: DeviceId) -> Option<EndpointDescriptor> {
            self.0.get(id).cloned()
        }

        fn default_input_device(&self) -> Option<DeviceId> {
            self.0.iter().position(EndpointDescriptor::is_input)
        }

        fn default_output_device(&self) -> Option<DeviceId> {
            self.0.iter().position(EndpointDescriptor::is_output)
        }
    }

    fn descriptor(id: DeviceId, direction: Direction) -> EndpointDescriptor {
        EndpointDescriptor {
            id,
            interface: "Test".into(),
            name: format!("Port {id}"),
            direction,
            is_virtual: false,
        }
    }

    #[test]
    fn open_params_enforce_capacity() {
        let mut params = OpenParams::new();
        params.push(ParamKey::ClientName, "probe").unwrap();
        params.push(ParamKey::PortName, "out").unwrap();
        let err = params.push(ParamKey::Manufacturer, "acme").unwrap_err();
        assert_eq!(
            err,
            TransportError::TooManyParameters {
                limit: MAX_OPEN_PARAMS
            }
        );
        assert_eq!(params.len(), MAX_OPEN_PARAMS);
        assert_eq!(params.get(ParamKey::PortName), Some("out"));
        assert_eq!(params.get(ParamKey::Manufacturer), None);
    }

    #[test]
    fn directory_lists_devices_in_order() {
        let directory = FixedDirectory(vec![
            descriptor(0, Direction::Output),
            descriptor(1, Direction::Input),
        ]);
        let devices = directory.devices();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].name, "Port 1");
        assert_eq!(directory.default_input_device(), Some(1));
        assert_eq!(directory.default_output_device(), Some(0));
        assert!(directory.device_info(2).is_none());
    }
}
