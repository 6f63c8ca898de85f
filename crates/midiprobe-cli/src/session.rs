//! Test scenarios driving the transport core.

use anyhow::{anyhow, Context, Result};
use midiprobe_transport::{
    clock, Clock, DeviceId, Direction, EndpointDirectory, EndpointHandle, FilterMask, MidiBackend,
    MidiEvent, MidiMessage, SessionConfig, TransportError,
};
use rand::Rng;
use tracing::info;

use crate::console::Console;

/// Program sent before the output tests so the notes are audible.
const PROGRAM: u8 = 0;
const CHORD: [u8; 5] = [60, 67, 76, 83, 90];
/// Messages read by the input scenario.
const INPUT_COUNT: usize = 10;
/// Messages forwarded by the bridge scenario.
const BRIDGE_COUNT: usize = 11;
const STREAM_LATENCY_MS: u32 = 500;
const ISOCHRONOUS_NOTES: u32 = 80;
const ISOCHRONOUS_PERIOD_MS: u32 = 250;
const ISOCHRONOUS_JITTER_MS: u32 = 100;
/// Pause between polls of an idle input.
const POLL_INTERVAL_MS: u32 = 1;

/// How an input session deliberately fails halfway through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crash {
    Panic,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    Input(Option<Crash>),
    Output,
    Both,
    Stream,
    Isochronous,
}

impl Scenario {
    pub const ALL: [Scenario; 7] = [
        Scenario::Input(None),
        Scenario::Input(Some(Crash::Panic)),
        Scenario::Input(Some(Crash::Abort)),
        Scenario::Output,
        Scenario::Both,
        Scenario::Stream,
        Scenario::Isochronous,
    ];

    pub fn from_choice(choice: i64) -> Option<Self> {
        let index = usize::try_from(choice).ok()?.checked_sub(1)?;
        Self::ALL.get(index).copied()
    }

    pub fn choice(self) -> usize {
        Self::ALL
            .iter()
            .position(|candidate| *candidate == self)
            .map_or(0, |index| index + 1)
    }

    pub fn label(self) -> &'static str {
        match self {
            Scenario::Input(None) => "test input",
            Scenario::Input(Some(Crash::Panic)) => "test input (fail w/panic)",
            Scenario::Input(Some(Crash::Abort)) => "test input (fail w/abort)",
            Scenario::Output => "test output",
            Scenario::Both => "test both",
            Scenario::Stream => "stream test",
            Scenario::Isochronous => "isochronous out",
        }
    }

    pub fn uses_input(self) -> bool {
        matches!(self, Scenario::Input(_) | Scenario::Both)
    }

    pub fn uses_output(self) -> bool {
        !matches!(self, Scenario::Input(_))
    }
}

/// Session driver: owns the handles for the duration of one scenario.
pub struct Session<'a> {
    backend: &'a mut dyn MidiBackend,
    config: SessionConfig,
    console: Console,
}

impl<'a> Session<'a> {
    pub fn new(backend: &'a mut dyn MidiBackend, config: SessionConfig, console: Console) -> Self {
        Self {
            backend,
            config,
            console,
        }
    }

    pub fn run(mut self, scenario: Scenario) -> Result<()> {
        list_devices(&*self.backend, scenario);
        info!(?scenario, latency_ms = self.config.latency_ms, "starting scenario");
        match scenario {
            Scenario::Input(crash) => self.test_input(crash)?,
            Scenario::Output => self.test_output(false)?,
            Scenario::Isochronous => self.test_output(true)?,
            Scenario::Both => self.test_both()?,
            Scenario::Stream => self.test_stream()?,
        }
        self.console
            .wait_for_enter("finished midiprobe test...type ENTER to quit...")?;
        Ok(())
    }

    fn open(
        &mut self,
        device: DeviceId,
        direction: Direction,
        latency: u32,
        clock: Clock,
    ) -> Result<EndpointHandle> {
        let options = self.config.open_options().latency(latency).clock(clock);
        EndpointHandle::open(&mut *self.backend, device, direction, options)
            .with_context(|| format!("failed to open {direction} device {device}"))
    }

    fn prompt_device(&mut self, prompt: &str) -> Result<DeviceId> {
        let choice = self.console.prompt_number(prompt)?;
        DeviceId::try_from(choice).map_err(|_| anyhow!("invalid device number {choice}"))
    }

    fn test_input(&mut self, crash: Option<Crash>) -> Result<()> {
        let device = self.prompt_device("Type input number: ")?;
        let clock = clock::start();
        let latency = self.config.latency_ms;
        let mut midi = self.open(device, Direction::Input, latency, clock)?;

        println!("Midi Input opened. Reading {INPUT_COUNT} Midi messages...");
        midi.set_filter(FilterMask::ACTIVE | FilterMask::CLOCK | FilterMask::SYSEX)?;
        drain(&mut midi)?;

        let mut count = 0;
        while count < INPUT_COUNT {
            if midi.poll()? {
                for event in midi.read(1)? {
                    print_event(count, &clock, &event);
                    count += 1;
                }
            } else {
                clock.sleep(POLL_INTERVAL_MS);
            }
            if count > INPUT_COUNT / 2 {
                match crash {
                    Some(Crash::Panic) => panic!("simulated crash with an open input handle"),
                    Some(Crash::Abort) => std::process::abort(),
                    None => {}
                }
            }
        }

        print!("ready to close...");
        midi.close()?;
        println!("done closing...");
        Ok(())
    }

    fn test_output(&mut self, isochronous: bool) -> Result<()> {
        let device = self.prompt_device("Type output number: ")?;
        let clock = clock::start();
        let latency = self.config.latency_ms;
        let mut midi = self.open(device, Direction::Output, latency, clock)?;
        println!("Midi Output opened with {latency} ms latency.");

        self.console
            .wait_for_enter("ready to send program 1 change... (type ENTER):")?;
        midi.write(&[MidiEvent::new(
            clock.now(),
            MidiMessage::program_change(0, PROGRAM),
        )])?;

        if isochronous {
            play_isochronous(&mut midi, &clock, latency)?;
        } else {
            self.console
                .wait_for_enter("ready to note-on... (type ENTER):")?;
            let sent = midi_write(&mut midi, clock.now(), MidiMessage::note_on(0, 60, 100));
            report(sent, &midi)?;
            self.console
                .wait_for_enter("ready to note-off... (type ENTER):")?;
            let sent = midi_write(&mut midi, clock.now(), MidiMessage::note_off(0, 60));
            report(sent, &midi)?;

            self.console
                .wait_for_enter("ready to note-on (short form)... (type ENTER):")?;
            let sent = midi.write_short(clock.now(), MidiMessage::note_on(0, 60, 100));
            report(sent, &midi)?;
            self.console
                .wait_for_enter("ready to note-off (short form)... (type ENTER):")?;
            let sent = midi.write_short(clock.now(), MidiMessage::note_off(0, 60));
            report(sent, &midi)?;

            if latency == 0 {
                println!("chord should not arpeggiate, latency == 0");
            } else {
                println!("chord should arpeggiate (latency = {latency} > 0)");
            }
            self.console
                .wait_for_enter("ready to chord-on/chord-off... (type ENTER):")?;
            play_chord(&mut midi, &clock)?;
        }

        self.console
            .wait_for_enter("ready to close and terminate... (type ENTER):")?;
        midi.close()?;
        println!("done closing and terminating...");
        Ok(())
    }

    fn test_both(&mut self) -> Result<()> {
        let input = self.prompt_device("Type input number: ")?;
        let output = self.prompt_device("Type output number: ")?;
        let clock = clock::start();
        let latency = self.config.latency_ms;

        let mut midi_out = self.open(output, Direction::Output, latency, clock)?;
        println!("Midi Output opened with {latency} ms latency.");
        let mut midi_in = self.open(input, Direction::Input, latency, clock)?;
        println!("Midi Input opened. Reading {BRIDGE_COUNT} Midi messages...");
        midi_in.set_filter(FilterMask::ACTIVE | FilterMask::CLOCK)?;
        drain(&mut midi_in)?;

        let mut count = 0;
        while count < BRIDGE_COUNT {
            if !midi_in.poll()? {
                clock.sleep(POLL_INTERVAL_MS);
                continue;
            }
            let events = midi_in.read(1)?;
            let sent = midi_out.write(&events);
            report(sent, &midi_out)?;
            for event in &events {
                print_event(count, &clock, event);
                count += 1;
            }
        }
        // Allow time for the last message to go out.
        clock.sleep(100 + latency);

        midi_in.close()?;
        midi_out.close()?;
        Ok(())
    }

    /// Scheduled output well ahead of time, then a batch submitted late.
    fn test_stream(&mut self) -> Result<()> {
        let device = self.prompt_device("Type output number: ")?;
        let clock = clock::start();
        let mut midi = self.open(device, Direction::Output, STREAM_LATENCY_MS, clock)?;
        println!("Midi Output opened with {STREAM_LATENCY_MS} ms latency.");

        self.console
            .wait_for_enter("ready to send output... (type ENTER):")?;
        let t0 = clock.now();
        let mut events = vec![
            MidiEvent::new(t0, MidiMessage::program_change(0, PROGRAM)),
            MidiEvent::new(t0, MidiMessage::note_on(0, 60, 100)),
            MidiEvent::new(t0 + 1000, MidiMessage::note_on(0, 62, 100)),
            MidiEvent::new(t0 + 2000, MidiMessage::note_on(0, 64, 100)),
            MidiEvent::new(t0 + 3000, MidiMessage::note_on(0, 66, 100)),
        ];
        events.extend(
            [60, 62, 64, 66]
                .into_iter()
                .map(|note| MidiEvent::new(t0 + 4000, MidiMessage::note_off(0, note))),
        );
        midi.write(&events)?;
        clock.sleep_until(t0 + 4000);

        // Four notes on time, then four more submitted half a latency late.
        // With enough latency the eight notes sound evenly spaced.
        let mut now = clock.now();
        midi.write(&pulse(now))?;
        clock.sleep_until(now + 2000 + STREAM_LATENCY_MS / 2);
        now += 2000;
        midi.write(&pulse(now))?;

        self.console
            .wait_for_enter("ready to close and terminate... (type ENTER):")?;
        midi.close()?;
        println!("done closing and terminating...");
        Ok(())
    }
}

/// Discard anything that arrived before the filter was set.
fn drain(midi: &mut EndpointHandle) -> Result<(), TransportError> {
    while midi.poll()? {
        midi.read(1)?;
    }
    Ok(())
}

fn midi_write(
    midi: &mut EndpointHandle,
    timestamp: u32,
    message: MidiMessage,
) -> Result<(), TransportError> {
    midi.write(&[MidiEvent::new(timestamp, message)])
}

/// Print a failed write and carry on; host errors include the driver's text.
///
/// Fatal transport errors end the session instead.
fn report(result: Result<(), TransportError>, midi: &EndpointHandle) -> Result<()> {
    if let Err(err) = result {
        if err.is_fatal() {
            return Err(err).context("midi transport failed");
        }
        println!("write returned error: {err}");
        if matches!(err, TransportError::Host(_)) {
            if let Some(text) = midi.host_error_text() {
                println!("    Host error: {text}");
            }
        }
    }
    Ok(())
}

fn print_event(index: usize, clock: &Clock, event: &MidiEvent) {
    println!(
        "Got message {index} @ time {}: timestamp {}, {}",
        clock.now(),
        event.timestamp,
        event.message
    );
}

fn play_chord(midi: &mut EndpointHandle, clock: &Clock) -> Result<()> {
    let timestamp = clock.now();
    println!("starting timestamp {timestamp}");
    let chord_on: Vec<MidiEvent> = CHORD
        .iter()
        .zip(0u32..)
        .map(|(&note, i)| MidiEvent::new(timestamp + 1000 * i, MidiMessage::note_on(0, note, 100)))
        .collect();
    midi.write(&chord_on)?;

    let off_time = timestamp + 1000 + CHORD.len() as u32 * 1000;
    while clock.now() < off_time {
        // Empty writes must not repeat the last message.
        midi.write(&[])?;
        clock.sleep(20);
    }

    let chord_off: Vec<MidiEvent> = chord_on
        .iter()
        .map(|event| MidiEvent::new(event.timestamp, MidiMessage::note_off(0, event.message.data1())))
        .collect();
    midi.write(&chord_off)?;
    Ok(())
}

fn play_isochronous(midi: &mut EndpointHandle, clock: &Clock, latency: u32) -> Result<()> {
    if latency < ISOCHRONOUS_JITTER_MS {
        println!(
            "Warning: latency < {ISOCHRONOUS_JITTER_MS}, but this test sends messages at times \
             that are jittered by up to {ISOCHRONOUS_JITTER_MS}ms, so you may hear uneven timing"
        );
    }
    println!("Starting in 1s...");
    clock.sleep(1000);
    let mut rng = rand::thread_rng();
    let start = clock.now();
    for count in 0..ISOCHRONOUS_NOTES {
        let on = start + count * ISOCHRONOUS_PERIOD_MS;
        let sent = midi.write(&[
            MidiEvent::new(on, MidiMessage::note_on(0, 69, 100)),
            MidiEvent::new(on + 200, MidiMessage::note_off(0, 69)),
        ]);
        report(sent, midi)?;
        let next_time = on + ISOCHRONOUS_PERIOD_MS;
        // Random submission jitter; the scheduler should hide it when latency covers it.
        while clock.now() < next_time {
            clock.sleep(rng.gen_range(0..ISOCHRONOUS_JITTER_MS));
        }
    }
    println!(
        "Done sending {ISOCHRONOUS_NOTES} notes at {} notes per second.",
        1000 / ISOCHRONOUS_PERIOD_MS
    );
    Ok(())
}

/// Four short notes 500ms apart starting at `start`.
fn pulse(start: u32) -> Vec<MidiEvent> {
    (0..4u32)
        .flat_map(|i| {
            let on = start + i * 500;
            [
                MidiEvent::new(on, MidiMessage::note_on(0, 60, 100)),
                MidiEvent::new(on + 250, MidiMessage::note_off(0, 60)),
            ]
        })
        .collect()
}

/// Print the endpoints relevant to `scenario`, marking the defaults.
fn list_devices<D: EndpointDirectory + ?Sized>(directory: &D, scenario: Scenario) {
    let default_in = directory.default_input_device();
    let default_out = directory.default_output_device();
    for device in directory.devices() {
        let wanted = (device.is_input() && scenario.uses_input())
            || (device.is_output() && scenario.uses_output());
        if !wanted {
            continue;
        }
        let default = match device.direction {
            Direction::Input if default_in == Some(device.id) => "default ",
            Direction::Output if default_out == Some(device.id) => "default ",
            _ => "",
        };
        println!(
            "{}: {}, {} ({default}{})",
            device.id, device.interface, device.name, device.direction
        );
    }
}
