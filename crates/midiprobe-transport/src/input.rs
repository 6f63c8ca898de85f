use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use ringbuf::{HeapConsumer, HeapProducer, HeapRb};
use tracing::warn;

use crate::device::{InputSink, NativeInput};
use crate::{ChannelMask, Clock, FilterMask, MidiEvent, MidiMessage, Result, TransportError};

/// Native input connection shared between the handle and the registry.
pub(crate) type InputSlot = Arc<Mutex<Option<Box<dyn NativeInput>>>>;

/// Masks consulted on the delivery thread as messages arrive.
#[derive(Debug)]
struct InputFilters {
    filter: AtomicU32,
    channels: AtomicU16,
    overflow: AtomicBool,
}

/// Consumer side of an input handle's arrival buffer.
///
/// Filtering happens when a message arrives, so anything buffered before a
/// mask change can still surface on the next read.
pub(crate) struct InputPoller {
    consumer: HeapConsumer<MidiEvent>,
    filters: Arc<InputFilters>,
    poll_reported: bool,
}

impl InputPoller {
    /// Create a poller and the sink the backend feeds.
    pub(crate) fn new(capacity: usize, clock: Clock, filter: FilterMask) -> (Self, InputSink) {
        let (producer, consumer) = HeapRb::new(capacity.max(1)).split();
        let filters = Arc::new(InputFilters {
            filter: AtomicU32::new(filter.bits()),
            channels: AtomicU16::new(ChannelMask::ALL.bits()),
            overflow: AtomicBool::new(false),
        });
        let sink = arrival_sink(producer, Arc::clone(&filters), clock);
        let poller = Self {
            consumer,
            filters,
            poll_reported: false,
        };
        (poller, sink)
    }

    /// Whether at least one message is waiting.
    pub(crate) fn poll(&mut self) -> bool {
        self.poll_reported = !self.consumer.is_empty();
        self.poll_reported
    }

    /// Consume up to `max_count` messages in arrival order.
    pub(crate) fn read(&mut self, max_count: usize) -> Result<Vec<MidiEvent>> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        if self.filters.overflow.swap(false, Ordering::AcqRel) {
            return Err(TransportError::BufferOverflow);
        }
        let mut events = Vec::with_capacity(max_count.min(self.consumer.len()));
        while events.len() < max_count {
            match self.consumer.pop() {
                Some(event) => events.push(event),
                None => break,
            }
        }
        let reported = std::mem::replace(&mut self.poll_reported, false);
        if events.is_empty() && reported {
            return Err(TransportError::ProtocolInvariantViolation(
                "poll reported pending input but read returned nothing".into(),
            ));
        }
        Ok(events)
    }

    pub(crate) fn set_filter(&self, mask: FilterMask) {
        self.filters.filter.store(mask.bits(), Ordering::Release);
    }

    pub(crate) fn filter(&self) -> FilterMask {
        FilterMask::from_bits(self.filters.filter.load(Ordering::Acquire))
    }

    pub(crate) fn set_channel_mask(&self, mask: ChannelMask) {
        self.filters.channels.store(mask.bits(), Ordering::Release);
    }
}

fn arrival_sink(
    mut producer: HeapProducer<MidiEvent>,
    filters: Arc<InputFilters>,
    clock: Clock,
) -> InputSink {
    Box::new(move |bytes: &[u8]| {
        let timestamp = clock.now();
        let Some(head) = MidiMessage::from_bytes(bytes) else {
            return;
        };
        let filter = FilterMask::from_bits(filters.filter.load(Ordering::Acquire));
        let channels = ChannelMask::from_bits(filters.channels.load(Ordering::Acquire));
        if filter.blocks(&head) || !channels.allows(&head) {
            return;
        }
        // Long system-exclusive payloads arrive as consecutive 3-byte chunks.
        for chunk in bytes.chunks(3) {
            let Some(message) = MidiMessage::from_bytes(chunk) else {
                continue;
            };
            if producer.push(MidiEvent::new(timestamp, message)).is_err() {
                if !filters.overflow.swap(true, Ordering::AcqRel) {
                    warn!("midi input buffer full; dropping messages");
                }
                return;
            }
        }
    })
}
