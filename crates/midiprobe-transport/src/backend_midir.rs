use anyhow::Context;
use midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use tracing::debug;

use crate::device::{
    Direction, EndpointDescriptor, EndpointDirectory, InputSink, MidiBackend, NativeInput,
    NativeOutput, OpenParams, ParamKey,
};
use crate::{DeviceId, Result, TransportError};

const DEFAULT_CLIENT_NAME: &str = "midiprobe";

const INTERFACE: &str = if cfg!(target_os = "linux") {
    "ALSA"
} else if cfg!(target_os = "macos") {
    "CoreMIDI"
} else if cfg!(target_os = "windows") {
    "MMSystem"
} else {
    "midir"
};

/// Backend implemented using the `midir` crate.
///
/// Inputs and outputs share one id space: inputs come first, followed by
/// outputs, in the order the host reports them.
pub struct MidirBackend {
    devices: Vec<EndpointDescriptor>,
    input_count: usize,
}

impl MidirBackend {
    /// Enumerate the host's endpoints.
    pub fn new() -> Result<Self> {
        let mut backend = Self {
            devices: Vec::new(),
            input_count: 0,
        };
        backend.refresh()?;
        Ok(backend)
    }

    /// Re-enumerate endpoints. Ids of previously listed devices may change.
    pub fn refresh(&mut self) -> Result<()> {
        let (inputs, outputs) =
            enumerate().map_err(|err| TransportError::Driver(format!("{err:#}")))?;
        self.input_count = inputs.len();
        self.devices = inputs
            .into_iter()
            .map(|name| (name, Direction::Input))
            .chain(outputs.into_iter().map(|name| (name, Direction::Output)))
            .enumerate()
            .map(|(id, (name, direction))| EndpointDescriptor {
                id,
                interface: INTERFACE.into(),
                name,
                direction,
                is_virtual: false,
            })
            .collect();
        debug!(devices = self.devices.len(), "enumerated midir endpoints");
        Ok(())
    }

    fn port_index(&self, descriptor: &EndpointDescriptor) -> usize {
        match descriptor.direction {
            Direction::Input => descriptor.id,
            Direction::Output => descriptor.id.saturating_sub(self.input_count),
        }
    }
}

fn enumerate() -> anyhow::Result<(Vec<String>, Vec<String>)> {
    let input = MidiInput::new(DEFAULT_CLIENT_NAME).context("initialise midir for enumeration")?;
    let output =
        MidiOutput::new(DEFAULT_CLIENT_NAME).context("initialise midir for enumeration")?;
    let inputs = input
        .ports()
        .iter()
        .enumerate()
        .map(|(index, port)| {
            input
                .port_name(port)
                .unwrap_or_else(|_| format!("Port {index}"))
        })
        .collect();
    let outputs = output
        .ports()
        .iter()
        .enumerate()
        .map(|(index, port)| {
            output
                .port_name(port)
                .unwrap_or_else(|_| format!("Port {index}"))
        })
        .collect();
    Ok((inputs, outputs))
}

fn client_name(params: &OpenParams) -> &str {
    if params.get(ParamKey::Manufacturer).is_some() {
        debug!("manufacturer parameter has no effect with the {INTERFACE} host");
    }
    params
        .get(ParamKey::ClientName)
        .unwrap_or(DEFAULT_CLIENT_NAME)
}

impl EndpointDirectory for MidirBackend {
    fn count_devices(&self) -> usize {
        self.devices.len()
    }

    fn device_info(&self, id: DeviceId) -> Option<EndpointDescriptor> {
        self.devices.get(id).cloned()
    }

    fn default_input_device(&self) -> Option<DeviceId> {
        self.devices.iter().position(EndpointDescriptor::is_input)
    }

    fn default_output_device(&self) -> Option<DeviceId> {
        self.devices.iter().position(EndpointDescriptor::is_output)
    }
}

impl MidiBackend for MidirBackend {
    fn open_input(
        &mut self,
        descriptor: &EndpointDescriptor,
        params: &OpenParams,
        mut sink: InputSink,
    ) -> Result<Box<dyn NativeInput>> {
        let mut input = MidiInput::new(client_name(params))
            .map_err(|err| TransportError::Driver(format!("initialise midir for input: {err}")))?;
        input.ignore(Ignore::None);
        let ports = input.ports();
        // Prefer the name so a re-ordered host list still opens the right port.
        let port = ports
            .iter()
            .find(|port| input.port_name(port).ok().as_deref() == Some(descriptor.name.as_str()))
            .or_else(|| ports.get(self.port_index(descriptor)))
            .ok_or_else(|| {
                TransportError::InvalidDevice(format!("{} is no longer available", descriptor.name))
            })?;
        let port_name = params.get(ParamKey::PortName).unwrap_or("midiprobe-in");
        let connection = input
            .connect(port, port_name, move |_stamp, message, _| sink(message), ())
            .map_err(|err| TransportError::Driver(format!("failed to connect midi input: {err}")))?;
        Ok(Box::new(MidirInput(connection)))
    }

    fn open_output(
        &mut self,
        descriptor: &EndpointDescriptor,
        params: &OpenParams,
    ) -> Result<Box<dyn NativeOutput>> {
        let output = MidiOutput::new(client_name(params))
            .map_err(|err| TransportError::Driver(format!("initialise midir for output: {err}")))?;
        let ports = output.ports();
        let port = ports
            .iter()
            .find(|port| output.port_name(port).ok().as_deref() == Some(descriptor.name.as_str()))
            .or_else(|| ports.get(self.port_index(descriptor)))
            .ok_or_else(|| {
                TransportError::InvalidDevice(format!("{} is no longer available", descriptor.name))
            })?;
        let port_name = params.get(ParamKey::PortName).unwrap_or("midiprobe-out");
        let connection = output
            .connect(port, port_name)
            .map_err(|err| TransportError::Driver(format!("failed to open midi output: {err}")))?;
        Ok(Box::new(MidirOutput(connection)))
    }
}

struct MidirInput(MidiInputConnection<()>);

impl NativeInput for MidirInput {
    fn close(self: Box<Self>) {
        let _ = self.0.close();
    }
}

struct MidirOutput(MidiOutputConnection);

impl NativeOutput for MidirOutput {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.0
            .send(bytes)
            .map_err(|err| TransportError::Host(format!("failed to send midi message: {err}")))
    }

    fn close(self: Box<Self>) {
        let _ = self.0.close();
    }
}
