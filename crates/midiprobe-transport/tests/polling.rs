use midiprobe_transport::loopback::{LOOPBACK_INPUT, LOOPBACK_OUTPUT};
use midiprobe_transport::{
    Clock, Direction, EndpointHandle, FilterMask, LoopbackBackend, MidiMessage, OpenOptions,
};

const TOLERANCE_MS: u32 = 50;

fn open_pair(latency: u32) -> (LoopbackBackend, EndpointHandle, EndpointHandle, Clock) {
    let clock = Clock::start();
    let mut backend = LoopbackBackend::new(clock);
    let input = EndpointHandle::open(
        &mut backend,
        LOOPBACK_INPUT,
        Direction::Input,
        OpenOptions::default().clock(clock),
    )
    .unwrap();
    let output = EndpointHandle::open(
        &mut backend,
        LOOPBACK_OUTPUT,
        Direction::Output,
        OpenOptions::default().latency(latency).clock(clock),
    )
    .unwrap();
    (backend, input, output, clock)
}

#[test]
fn note_on_travels_from_output_to_input() {
    let (_backend, mut input, mut output, clock) = open_pair(0);
    let sent_at = clock.now();
    output
        .write_short(sent_at, MidiMessage::new(0x90, 60, 100))
        .unwrap();

    let deadline = sent_at + 1000;
    while !input.poll().unwrap() {
        assert!(clock.now() < deadline, "message never arrived");
        clock.sleep(1);
    }
    let events = input.read(1).unwrap();
    assert_eq!(events.len(), 1);
    let event = events[0];
    assert_eq!(event.message.status(), 0x90);
    assert_eq!(event.message.data1(), 60);
    assert_eq!(event.message.data2(), 100);
    assert!(event.timestamp >= sent_at && event.timestamp <= sent_at + TOLERANCE_MS);
    assert!(!input.poll().unwrap());
}

#[test]
fn poll_false_means_read_is_empty() {
    let (_backend, mut input, _output, _clock) = open_pair(0);
    assert!(!input.poll().unwrap());
    assert!(input.read(10).unwrap().is_empty());
}

#[test]
fn filtered_categories_never_surface_after_draining() {
    let (backend, mut input, _output, _clock) = open_pair(0);
    backend.inject(&[0xF8]);
    backend.inject(&[0xF0, 0x7E, 0x7F, 0x09, 0x01, 0xF7]);
    input
        .set_filter(FilterMask::ACTIVE | FilterMask::CLOCK | FilterMask::SYSEX)
        .unwrap();
    // Drain whatever arrived before the filter changed.
    while input.poll().unwrap() {
        input.read(1).unwrap();
    }

    backend.inject(&[0xFE]);
    backend.inject(&[0xF8]);
    backend.inject(&[0x90, 62, 80]);
    backend.inject(&[0xF0, 0x7E, 0x7F, 0x09, 0x01, 0xF7]);
    backend.inject(&[0x80, 62, 0]);

    let mut received = Vec::new();
    while input.poll().unwrap() {
        received.extend(input.read(1).unwrap());
    }
    let statuses: Vec<u8> = received.iter().map(|event| event.message.status()).collect();
    assert_eq!(statuses, vec![0x90, 0x80]);
}

#[test]
fn active_sensing_is_filtered_by_default() {
    let (backend, mut input, _output, _clock) = open_pair(0);
    backend.inject(&[0xFE]);
    assert!(!input.poll().unwrap());
    input.set_filter(FilterMask::NONE).unwrap();
    backend.inject(&[0xFE]);
    assert_eq!(input.read(4).unwrap().len(), 1);
}

#[test]
fn bridged_messages_keep_arrival_order() {
    // Separate loopbacks so forwarded output does not feed back into the input.
    let (source, mut input, _unused, clock) = open_pair(0);
    let mut sink = LoopbackBackend::new(clock);
    let mut output = EndpointHandle::open(
        &mut sink,
        LOOPBACK_OUTPUT,
        Direction::Output,
        OpenOptions::default(),
    )
    .unwrap();
    for note in 60..71 {
        source.inject(&[0x90, note, 100]);
    }
    let mut forwarded = 0;
    while input.poll().unwrap() {
        let events = input.read(1).unwrap();
        output.write(&events).unwrap();
        forwarded += events.len();
    }
    assert_eq!(forwarded, 11);
    let notes: Vec<u8> = sink
        .egress()
        .iter()
        .map(|event| event.message.data1())
        .collect();
    assert_eq!(notes, (60..71).collect::<Vec<u8>>());
}
