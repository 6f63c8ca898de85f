use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::device::NativeOutput;
use crate::{Clock, MidiEvent, Result, Timestamp, TransportError};

/// Native output connection shared between the handle, its scheduler and the registry.
pub(crate) type OutputSlot = Arc<Mutex<Option<Box<dyn NativeOutput>>>>;

#[derive(Debug, Default)]
struct HostErrors {
    unreported: Option<String>,
    last: Option<String>,
}

impl HostErrors {
    fn record(&mut self, message: String) {
        self.unreported = Some(message.clone());
        self.last = Some(message);
    }
}

enum Command {
    Batch(Vec<MidiEvent>),
    Shutdown,
}

struct Worker {
    tx: Sender<Command>,
    thread: Option<JoinHandle<()>>,
}

/// Releases outbound events on time.
///
/// At zero latency every write goes straight to the wire. With a positive
/// latency a worker thread holds events until their timestamp. Events of one
/// batch never overtake each other; separate batches interleave by timestamp.
pub(crate) struct OutputScheduler {
    slot: OutputSlot,
    errors: Arc<Mutex<HostErrors>>,
    worker: Option<Worker>,
}

impl OutputScheduler {
    pub(crate) fn start(
        slot: OutputSlot,
        latency: u32,
        clock: Option<Clock>,
        label: &str,
    ) -> Result<Self> {
        let errors = Arc::new(Mutex::new(HostErrors::default()));
        let worker = match (latency, clock) {
            (0, _) => None,
            (_, None) => return Err(TransportError::ClockNotRunning),
            (latency, Some(clock)) => {
                let (tx, rx) = crossbeam_channel::unbounded();
                let release = Release {
                    slot: Arc::clone(&slot),
                    errors: Arc::clone(&errors),
                    clock,
                    latency,
                };
                let thread = thread::Builder::new()
                    .name(format!("midiprobe-out-{label}"))
                    .spawn(move || release.run(rx))
                    .map_err(|err| {
                        TransportError::Driver(format!("failed to spawn output scheduler: {err}"))
                    })?;
                Some(Worker {
                    tx,
                    thread: Some(thread),
                })
            }
        };
        Ok(Self {
            slot,
            errors,
            worker,
        })
    }

    pub(crate) fn write(&self, events: &[MidiEvent]) -> Result<()> {
        // Writing nothing must never touch the wire.
        if events.is_empty() {
            return Ok(());
        }
        if let Some(message) = self.errors.lock().unreported.take() {
            return Err(TransportError::Host(message));
        }
        match &self.worker {
            None => {
                let mut slot = self.slot.lock();
                let Some(connection) = slot.as_mut() else {
                    return Err(TransportError::HandleClosed);
                };
                for event in events {
                    if let Err(err) = connection.send(event.message.wire_bytes()) {
                        let message = host_message(err);
                        self.errors.lock().last = Some(message.clone());
                        return Err(TransportError::Host(message));
                    }
                }
                Ok(())
            }
            Some(worker) => worker
                .tx
                .send(Command::Batch(events.to_vec()))
                .map_err(|_| TransportError::Host("output scheduler has stopped".into())),
        }
    }

    /// Last transmission failure reported by the host, if any.
    pub(crate) fn host_error_text(&self) -> Option<String> {
        self.errors.lock().last.clone()
    }

    /// Stop the worker; events not yet released are dropped.
    pub(crate) fn shutdown(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            let _ = worker.tx.send(Command::Shutdown);
            if let Some(thread) = worker.thread.take() {
                if let Err(err) = thread.join() {
                    warn!(?err, "failed to join output scheduler thread");
                }
            }
        }
    }
}

impl Drop for OutputScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn host_message(err: TransportError) -> String {
    match err {
        TransportError::Host(message) | TransportError::Driver(message) => message,
        other => other.to_string(),
    }
}

struct Release {
    slot: OutputSlot,
    errors: Arc<Mutex<HostErrors>>,
    clock: Clock,
    latency: u32,
}

/// Queued event ordered by release time, then submission order.
struct Pending {
    due: Timestamp,
    seq: u64,
    event: MidiEvent,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    // Reversed so the max-heap yields the earliest event first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.due, other.seq).cmp(&(self.due, self.seq))
    }
}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<Pending>,
    next_seq: u64,
}

impl Queue {
    fn extend(&mut self, events: Vec<MidiEvent>) {
        // An event is never due before the one submitted ahead of it in the batch.
        let mut floor = 0;
        for event in events {
            floor = floor.max(event.timestamp);
            self.heap.push(Pending {
                due: floor,
                seq: self.next_seq,
                event,
            });
            self.next_seq += 1;
        }
    }

    fn next_due(&self) -> Option<Timestamp> {
        self.heap.peek().map(|pending| pending.due)
    }
}

impl Release {
    fn run(self, rx: Receiver<Command>) {
        debug!(latency_ms = self.latency, "output scheduler started");
        let mut queue = Queue::default();
        loop {
            while let Some(due) = queue.next_due() {
                if self.clock.until(due).is_some() {
                    break;
                }
                if let Some(pending) = queue.heap.pop() {
                    self.transmit(&pending.event);
                }
            }

            let command = match queue.next_due() {
                Some(due) => {
                    let wait = self.clock.until(due).unwrap_or_default();
                    match rx.recv_timeout(wait) {
                        Ok(command) => command,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match rx.recv() {
                    Ok(command) => command,
                    Err(_) => break,
                },
            };

            match command {
                Command::Batch(events) => queue.extend(events),
                Command::Shutdown => break,
            }
        }
        if !queue.heap.is_empty() {
            debug!(dropped = queue.heap.len(), "dropping unreleased output");
        }
        debug!("output scheduler stopped");
    }

    fn transmit(&self, event: &MidiEvent) {
        let now = self.clock.now();
        let deadline = event.timestamp.saturating_add(self.latency);
        if now > deadline {
            warn!(
                timestamp = event.timestamp,
                late_by_ms = now - deadline,
                "midi event released later than latency allows"
            );
        }
        let mut slot = self.slot.lock();
        let Some(connection) = slot.as_mut() else {
            return;
        };
        if let Err(err) = connection.send(event.message.wire_bytes()) {
            let message = host_message(err);
            warn!(%message, "midi transmission failed");
            self.errors.lock().record(message);
        }
    }
}
