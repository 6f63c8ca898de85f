use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::device::{
    Direction, EndpointDescriptor, MidiBackend, NativeInput, NativeOutput, OpenParams, ParamKey,
};
use crate::input::{InputPoller, InputSlot};
use crate::output::{OutputScheduler, OutputSlot};
use crate::registry::{self, HandleId};
use crate::{
    clock, ChannelMask, Clock, DeviceId, FilterMask, MidiEvent, MidiMessage, Result, Timestamp,
    TransportError,
};

/// Number of incoming messages an input handle buffers between reads.
pub const DEFAULT_INPUT_BUFFER_SIZE: usize = 100;

/// Lock timeout used when the registry sweeps a connection another thread holds.
const SWEEP_LOCK_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(100);

/// Settings applied when opening an endpoint.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Output buffering delay in milliseconds. Zero sends immediately.
    pub latency: u32,
    /// Driver-specific parameters, validated against [`crate::MAX_OPEN_PARAMS`].
    pub params: Vec<(ParamKey, String)>,
    /// Time source for timestamps; falls back to the session clock.
    pub clock: Option<Clock>,
    /// Capacity of the input arrival buffer.
    pub buffer_size: usize,
    /// Categories dropped on arrival for input handles.
    pub filter: FilterMask,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            latency: 0,
            params: Vec::new(),
            clock: None,
            buffer_size: DEFAULT_INPUT_BUFFER_SIZE,
            filter: FilterMask::ACTIVE,
        }
    }
}

impl OpenOptions {
    pub fn latency(mut self, latency: u32) -> Self {
        self.latency = latency;
        self
    }

    pub fn param(mut self, key: ParamKey, value: impl Into<String>) -> Self {
        self.params.push((key, value.into()));
        self
    }

    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn filter(mut self, filter: FilterMask) -> Self {
        self.filter = filter;
        self
    }
}

enum Connection {
    Input { slot: InputSlot, poller: InputPoller },
    Output { slot: OutputSlot, scheduler: OutputScheduler },
}

/// Open connection to a single input or output endpoint.
///
/// A live handle dropped without [`EndpointHandle::close`] closes itself, and
/// every live handle is tracked by the process-wide [`registry`].
pub struct EndpointHandle {
    id: HandleId,
    descriptor: EndpointDescriptor,
    latency: u32,
    clock: Option<Clock>,
    live: bool,
    connection: Connection,
}

impl EndpointHandle {
    /// Open `device` in `direction`.
    ///
    /// Input handles and outputs with a positive latency need a clock, taken
    /// from `options` or the session clock. A zero-latency output never reads
    /// the clock.
    pub fn open<B>(
        backend: &mut B,
        device: DeviceId,
        direction: Direction,
        options: OpenOptions,
    ) -> Result<Self>
    where
        B: MidiBackend + ?Sized,
    {
        let params = OpenParams::try_from(options.params)?;
        let descriptor = backend
            .device_info(device)
            .ok_or_else(|| TransportError::InvalidDevice(format!("no device with id {device}")))?;
        if descriptor.direction != direction {
            return Err(TransportError::InvalidDevice(format!(
                "{} is not an {direction} endpoint",
                descriptor.name
            )));
        }

        let needs_clock = direction == Direction::Input || options.latency > 0;
        let clock = if needs_clock {
            Some(
                options
                    .clock
                    .or_else(clock::global)
                    .ok_or(TransportError::ClockNotRunning)?,
            )
        } else {
            None
        };
        let label = format!("{}:{}", direction, descriptor.name);

        let (id, connection) = match (direction, clock) {
            (Direction::Input, Some(clock)) => {
                let (poller, sink) = InputPoller::new(options.buffer_size, clock, options.filter);
                let native = backend.open_input(&descriptor, &params, sink)?;
                let slot: InputSlot = Arc::new(Mutex::new(Some(native)));
                let closer =
                    sweep(Arc::clone(&slot), |native: Box<dyn NativeInput>| native.close());
                let id = registry::register(label, closer);
                (id, Connection::Input { slot, poller })
            }
            (Direction::Input, None) => return Err(TransportError::ClockNotRunning),
            (Direction::Output, clock) => {
                let native = backend.open_output(&descriptor, &params)?;
                let slot: OutputSlot = Arc::new(Mutex::new(Some(native)));
                let scheduler = match OutputScheduler::start(
                    Arc::clone(&slot),
                    options.latency,
                    clock,
                    &descriptor.name,
                ) {
                    Ok(scheduler) => scheduler,
                    Err(err) => {
                        if let Some(native) = slot.lock().take() {
                            native.close();
                        }
                        return Err(err);
                    }
                };
                let closer =
                    sweep(Arc::clone(&slot), |native: Box<dyn NativeOutput>| native.close());
                let id = registry::register(label, closer);
                (id, Connection::Output { slot, scheduler })
            }
        };

        info!(
            id,
            device = %descriptor.name,
            %direction,
            latency_ms = options.latency,
            "opened midi endpoint"
        );
        Ok(Self {
            id,
            descriptor,
            latency: options.latency,
            clock,
            live: true,
            connection,
        })
    }

    /// Release the native connection. Buffered output not yet released is dropped.
    ///
    /// Closing twice is a caller error and reports [`TransportError::HandleClosed`].
    /// Closing an endpoint that was unplugged still succeeds.
    pub fn close(&mut self) -> Result<()> {
        if !self.live {
            return Err(TransportError::HandleClosed);
        }
        self.live = false;
        if !registry::unregister(self.id) {
            debug!(id = self.id, "handle was already swept");
        }
        match &mut self.connection {
            Connection::Input { slot, .. } => {
                if let Some(native) = slot.lock().take() {
                    native.close();
                }
            }
            Connection::Output { slot, scheduler } => {
                scheduler.shutdown();
                if let Some(native) = slot.lock().take() {
                    native.close();
                }
            }
        }
        info!(id = self.id, device = %self.descriptor.name, "closed midi endpoint");
        Ok(())
    }

    /// Whether the handle is open and has not been swept by the registry.
    pub fn is_live(&self) -> bool {
        self.live && registry::is_registered(self.id)
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    pub fn direction(&self) -> Direction {
        self.descriptor.direction
    }

    pub fn latency(&self) -> u32 {
        self.latency
    }

    /// Clock the handle's timestamps are relative to. `None` for zero-latency outputs.
    pub fn clock(&self) -> Option<Clock> {
        self.clock
    }

    /// Submit events in order. Each event's timestamp is its release time.
    ///
    /// At zero latency the events are sent before this returns and their
    /// timestamps are ignored. An empty slice is a no-op.
    pub fn write(&mut self, events: &[MidiEvent]) -> Result<()> {
        self.scheduler()?.write(events)
    }

    /// Submit a single message for release at `timestamp`.
    pub fn write_short(&mut self, timestamp: Timestamp, message: MidiMessage) -> Result<()> {
        self.write(&[MidiEvent::new(timestamp, message)])
    }

    /// Diagnostic text of the last host transmission failure.
    pub fn host_error_text(&self) -> Option<String> {
        match &self.connection {
            Connection::Output { scheduler, .. } => scheduler.host_error_text(),
            Connection::Input { .. } => None,
        }
    }

    /// Whether at least one message is waiting. Never blocks.
    pub fn poll(&mut self) -> Result<bool> {
        Ok(self.poller()?.poll())
    }

    /// Consume up to `max_count` waiting messages in arrival order. Never blocks.
    pub fn read(&mut self, max_count: usize) -> Result<Vec<MidiEvent>> {
        self.poller()?.read(max_count)
    }

    /// Replace the filter mask for messages arriving from now on.
    pub fn set_filter(&mut self, mask: FilterMask) -> Result<()> {
        self.poller()?.set_filter(mask);
        Ok(())
    }

    /// Restrict channel voice messages to the channels in `mask`.
    pub fn set_channel_mask(&mut self, mask: ChannelMask) -> Result<()> {
        self.poller()?.set_channel_mask(mask);
        Ok(())
    }

    fn scheduler(&self) -> Result<&OutputScheduler> {
        match &self.connection {
            Connection::Output { scheduler, .. } if self.is_live() => Ok(scheduler),
            Connection::Output { .. } => Err(TransportError::HandleClosed),
            Connection::Input { .. } => Err(TransportError::NotOutputHandle),
        }
    }

    fn poller(&mut self) -> Result<&mut InputPoller> {
        let live = self.is_live();
        match &mut self.connection {
            Connection::Input { poller, .. } if live => Ok(poller),
            Connection::Input { .. } => Err(TransportError::HandleClosed),
            Connection::Output { .. } => Err(TransportError::NotInputHandle),
        }
    }
}

impl Drop for EndpointHandle {
    fn drop(&mut self) {
        if self.live {
            let _ = self.close();
        }
    }
}

fn sweep<C: Send + 'static>(
    slot: Arc<Mutex<Option<C>>>,
    close: fn(C),
) -> impl FnOnce() + Send + 'static {
    move || {
        if let Some(mut guard) = slot.try_lock_for(SWEEP_LOCK_TIMEOUT) {
            if let Some(native) = guard.take() {
                close(native);
            }
        }
    }
}
