//! In-memory backend with one output wired straight into one input.
//!
//! Every message that reaches the wire is recorded with the clock time it was
//! transmitted, which makes release timing observable without hardware.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::device::{
    Direction, EndpointDescriptor, EndpointDirectory, InputSink, MidiBackend, NativeInput,
    NativeOutput, OpenParams,
};
use crate::{Clock, DeviceId, MidiEvent, MidiMessage, Result, TransportError};

/// Id of the loopback output endpoint.
pub const LOOPBACK_OUTPUT: DeviceId = 0;
/// Id of the loopback input endpoint.
pub const LOOPBACK_INPUT: DeviceId = 1;

const INTERFACE: &str = "Loopback";

#[derive(Default)]
struct LoopbackState {
    sink: Option<InputSink>,
    egress: Vec<MidiEvent>,
    open_connections: usize,
    disconnected: bool,
}

/// Loopback backend. Clones share the same endpoints.
#[derive(Clone)]
pub struct LoopbackBackend {
    clock: Clock,
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackBackend {
    /// Create a loopback pair that stamps egress with `clock`.
    pub fn new(clock: Clock) -> Self {
        Self {
            clock,
            state: Arc::new(Mutex::new(LoopbackState::default())),
        }
    }

    /// Messages transmitted so far, stamped with their egress time.
    pub fn egress(&self) -> Vec<MidiEvent> {
        self.state.lock().egress.clone()
    }

    pub fn clear_egress(&self) {
        self.state.lock().egress.clear();
    }

    /// Native connections currently open against this backend.
    pub fn open_connections(&self) -> usize {
        self.state.lock().open_connections
    }

    /// Deliver bytes to the input endpoint as if an external device sent them.
    pub fn inject(&self, bytes: &[u8]) {
        let mut state = self.state.lock();
        if state.disconnected {
            return;
        }
        if let Some(sink) = state.sink.as_mut() {
            sink(bytes);
        }
    }

    /// Simulate the endpoints being unplugged.
    pub fn disconnect(&self) {
        debug!("loopback endpoints disconnected");
        self.state.lock().disconnected = true;
    }

    pub fn reconnect(&self) {
        self.state.lock().disconnected = false;
    }

    fn descriptor(id: DeviceId) -> Option<EndpointDescriptor> {
        let (name, direction) = match id {
            LOOPBACK_OUTPUT => ("Loopback Out", Direction::Output),
            LOOPBACK_INPUT => ("Loopback In", Direction::Input),
            _ => return None,
        };
        Some(EndpointDescriptor {
            id,
            interface: INTERFACE.into(),
            name: name.into(),
            direction,
            is_virtual: true,
        })
    }
}

impl EndpointDirectory for LoopbackBackend {
    fn count_devices(&self) -> usize {
        2
    }

    fn device_info(&self, id: DeviceId) -> Option<EndpointDescriptor> {
        Self::descriptor(id)
    }

    fn default_input_device(&self) -> Option<DeviceId> {
        Some(LOOPBACK_INPUT)
    }

    fn default_output_device(&self) -> Option<DeviceId> {
        Some(LOOPBACK_OUTPUT)
    }
}

impl MidiBackend for LoopbackBackend {
    fn open_input(
        &mut self,
        descriptor: &EndpointDescriptor,
        _params: &OpenParams,
        sink: InputSink,
    ) -> Result<Box<dyn NativeInput>> {
        let mut state = self.state.lock();
        if state.disconnected {
            return Err(TransportError::Driver(format!(
                "{} is disconnected",
                descriptor.name
            )));
        }
        if state.sink.is_some() {
            return Err(TransportError::Driver(format!(
                "{} is already open",
                descriptor.name
            )));
        }
        state.sink = Some(sink);
        state.open_connections += 1;
        Ok(Box::new(LoopbackInput {
            state: Arc::clone(&self.state),
        }))
    }

    fn open_output(
        &mut self,
        descriptor: &EndpointDescriptor,
        _params: &OpenParams,
    ) -> Result<Box<dyn NativeOutput>> {
        let mut state = self.state.lock();
        if state.disconnected {
            return Err(TransportError::Driver(format!(
                "{} is disconnected",
                descriptor.name
            )));
        }
        state.open_connections += 1;
        Ok(Box::new(LoopbackOutput {
            clock: self.clock,
            state: Arc::clone(&self.state),
        }))
    }
}

struct LoopbackInput {
    state: Arc<Mutex<LoopbackState>>,
}

impl NativeInput for LoopbackInput {
    fn close(self: Box<Self>) {}
}

impl Drop for LoopbackInput {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.sink = None;
        state.open_connections = state.open_connections.saturating_sub(1);
    }
}

struct LoopbackOutput {
    clock: Clock,
    state: Arc<Mutex<LoopbackState>>,
}

impl NativeOutput for LoopbackOutput {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if state.disconnected {
            return Err(TransportError::Host("loopback endpoint disconnected".into()));
        }
        let Some(message) = MidiMessage::from_bytes(bytes) else {
            return Ok(());
        };
        state.egress.push(MidiEvent::new(self.clock.now(), message));
        if let Some(sink) = state.sink.as_mut() {
            sink(bytes);
        }
        Ok(())
    }

    fn close(self: Box<Self>) {}
}

impl Drop for LoopbackOutput {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.open_connections = state.open_connections.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_feeds_input_and_records_egress() {
        let mut backend = LoopbackBackend::new(Clock::start());
        let input = backend.device_info(LOOPBACK_INPUT).unwrap();
        let output = backend.device_info(LOOPBACK_OUTPUT).unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink_store = Arc::clone(&received);
        let conn_in = backend
            .open_input(
                &input,
                &OpenParams::new(),
                Box::new(move |bytes: &[u8]| sink_store.lock().push(bytes.to_vec())),
            )
            .unwrap();
        let mut conn_out = backend.open_output(&output, &OpenParams::new()).unwrap();
        assert_eq!(backend.open_connections(), 2);

        conn_out.send(&[0x90, 60, 100]).unwrap();
        assert_eq!(received.lock().as_slice(), &[vec![0x90, 60, 100]]);
        assert_eq!(backend.egress().len(), 1);

        conn_in.close();
        conn_out.close();
        assert_eq!(backend.open_connections(), 0);
    }

    #[test]
    fn disconnected_output_reports_host_error() {
        let mut backend = LoopbackBackend::new(Clock::start());
        let output = backend.device_info(LOOPBACK_OUTPUT).unwrap();
        let mut conn = backend.open_output(&output, &OpenParams::new()).unwrap();
        backend.disconnect();
        assert!(matches!(
            conn.send(&[0x90, 60, 100]),
            Err(TransportError::Host(_))
        ));
        conn.close();
        assert_eq!(backend.open_connections(), 0);
    }

    #[test]
    fn reconnect_resumes_delivery() {
        let mut backend = LoopbackBackend::new(Clock::start());
        let output = backend.device_info(LOOPBACK_OUTPUT).unwrap();
        let mut conn = backend.open_output(&output, &OpenParams::new()).unwrap();
        conn.send(&[0x90, 60, 100]).unwrap();
        backend.clear_egress();
        assert!(backend.egress().is_empty());

        backend.disconnect();
        assert!(conn.send(&[0x90, 61, 100]).is_err());
        assert!(backend.open_output(&output, &OpenParams::new()).is_err());
        backend.reconnect();
        conn.send(&[0x90, 62, 100]).unwrap();
        let egress = backend.egress();
        assert_eq!(egress.len(), 1);
        assert_eq!(egress[0].message, MidiMessage::note_on(0, 62, 100));
        conn.close();
        assert_eq!(backend.open_connections(), 0);
    }
}
