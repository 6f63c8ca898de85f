use midiprobe_transport::loopback::LOOPBACK_OUTPUT;
use midiprobe_transport::{
    Clock, Direction, EndpointHandle, LoopbackBackend, MidiEvent, MidiMessage, OpenOptions,
    TransportError,
};

/// Allowed lateness of a release, in milliseconds. Releases are never early.
const TOLERANCE_MS: u32 = 50;

fn open_output(latency: u32) -> (LoopbackBackend, EndpointHandle, Clock) {
    let clock = Clock::start();
    let mut backend = LoopbackBackend::new(clock);
    let handle = EndpointHandle::open(
        &mut backend,
        LOOPBACK_OUTPUT,
        Direction::Output,
        OpenOptions::default().latency(latency).clock(clock),
    )
    .unwrap();
    (backend, handle, clock)
}

fn assert_on_time(egress: &[MidiEvent], expected: &[u32]) {
    assert_eq!(egress.len(), expected.len());
    for (event, &due) in egress.iter().zip(expected) {
        assert!(
            event.timestamp >= due,
            "released at {} before its time {due}",
            event.timestamp
        );
        assert!(
            event.timestamp <= due + TOLERANCE_MS,
            "released at {}, more than {TOLERANCE_MS}ms after {due}",
            event.timestamp
        );
    }
}

#[test]
fn zero_latency_sends_before_write_returns() {
    let (backend, mut handle, clock) = open_output(0);
    let now = clock.now();
    handle
        .write_short(now, MidiMessage::note_on(0, 60, 100))
        .unwrap();
    assert_on_time(&backend.egress(), &[now]);
}

#[test]
fn future_events_are_held_until_their_timestamp() {
    for latency in [1, 20, 100] {
        let (backend, mut handle, clock) = open_output(latency);
        let due = clock.now() + 80;
        handle.write_short(due, MidiMessage::note_on(0, 64, 90)).unwrap();
        assert!(backend.egress().is_empty());
        clock.sleep_until(due + TOLERANCE_MS);
        assert_on_time(&backend.egress(), &[due]);
    }
}

#[test]
fn arpeggiated_chord_releases_on_schedule() {
    let (backend, mut handle, clock) = open_output(100);
    let t0 = clock.now();
    let chord = [60, 67, 76, 83, 90];
    let events: Vec<MidiEvent> = chord
        .iter()
        .enumerate()
        .map(|(i, &note)| MidiEvent::new(t0 + 100 * i as u32, MidiMessage::note_on(0, note, 100)))
        .collect();
    handle.write(&events).unwrap();
    clock.sleep_until(t0 + 400 + TOLERANCE_MS);

    let egress = backend.egress();
    assert_on_time(&egress, &[t0, t0 + 100, t0 + 200, t0 + 300, t0 + 400]);
    let notes: Vec<u8> = egress.iter().map(|event| event.message.data1()).collect();
    assert_eq!(notes, chord);
}

#[test]
fn batch_order_is_preserved_on_the_wire() {
    let (backend, mut handle, clock) = open_output(50);
    let at = clock.now() + 20;
    let events: Vec<MidiEvent> = (0..32)
        .map(|note| MidiEvent::new(at, MidiMessage::note_on(0, note, 1)))
        .collect();
    handle.write(&events).unwrap();
    clock.sleep_until(at + TOLERANCE_MS);

    let notes: Vec<u8> = backend
        .egress()
        .iter()
        .map(|event| event.message.data1())
        .collect();
    assert_eq!(notes, (0..32).collect::<Vec<u8>>());
}

#[test]
fn empty_write_never_repeats_the_last_message() {
    let (backend, mut handle, clock) = open_output(30);
    let due = clock.now();
    handle.write_short(due, MidiMessage::note_on(0, 60, 100)).unwrap();
    let stop = due + 150;
    while clock.now() < stop {
        handle.write(&[]).unwrap();
        clock.sleep(10);
    }
    assert_eq!(backend.egress().len(), 1);

    let (backend, mut handle, clock) = open_output(0);
    handle
        .write_short(clock.now(), MidiMessage::note_on(0, 60, 100))
        .unwrap();
    for _ in 0..10 {
        handle.write(&[]).unwrap();
    }
    assert_eq!(backend.egress().len(), 1);
}

#[test]
fn late_batch_within_latency_is_sent_immediately_in_order() {
    let (backend, mut handle, clock) = open_output(200);
    clock.sleep(150);
    let now = clock.now();
    let late = now - 100;
    let events = [
        MidiEvent::new(late, MidiMessage::note_on(0, 60, 100)),
        MidiEvent::new(late + 50, MidiMessage::note_off(0, 60)),
        MidiEvent::new(now + 60, MidiMessage::note_on(0, 62, 100)),
    ];
    handle.write(&events).unwrap();
    clock.sleep_until(now + 60 + TOLERANCE_MS);

    let egress = backend.egress();
    assert_on_time(&egress, &[now, now, now + 60]);
    assert_eq!(egress[1].message, MidiMessage::note_off(0, 60));
}

#[test]
fn successive_writes_release_in_time_order() {
    let (backend, mut handle, clock) = open_output(100);
    let t0 = clock.now();
    for i in 0..4u32 {
        handle
            .write(&[
                MidiEvent::new(t0 + i * 40, MidiMessage::note_on(0, 69, 100)),
                MidiEvent::new(t0 + i * 40 + 20, MidiMessage::note_off(0, 69)),
            ])
            .unwrap();
    }
    clock.sleep_until(t0 + 140 + TOLERANCE_MS);
    let expected: Vec<u32> = (0..4u32)
        .flat_map(|i| [t0 + i * 40, t0 + i * 40 + 20])
        .collect();
    assert_on_time(&backend.egress(), &expected);
}

#[test]
fn later_batch_interleaves_by_timestamp() {
    let (backend, mut handle, clock) = open_output(100);
    let t0 = clock.now() + 20;
    handle
        .write(&[
            MidiEvent::new(t0, MidiMessage::note_on(0, 60, 100)),
            MidiEvent::new(t0 + 200, MidiMessage::note_on(0, 64, 100)),
        ])
        .unwrap();
    handle
        .write_short(t0 + 100, MidiMessage::note_on(0, 62, 100))
        .unwrap();
    clock.sleep_until(t0 + 200 + TOLERANCE_MS);

    let egress = backend.egress();
    assert_on_time(&egress, &[t0, t0 + 100, t0 + 200]);
    let notes: Vec<u8> = egress.iter().map(|event| event.message.data1()).collect();
    assert_eq!(notes, vec![60, 62, 64]);
}

#[test]
fn out_of_order_timestamps_within_a_batch_keep_submission_order() {
    let (backend, mut handle, clock) = open_output(100);
    let t0 = clock.now() + 20;
    handle
        .write(&[
            MidiEvent::new(t0 + 80, MidiMessage::note_on(0, 60, 100)),
            MidiEvent::new(t0, MidiMessage::note_on(0, 61, 100)),
        ])
        .unwrap();
    clock.sleep_until(t0 + 80 + TOLERANCE_MS);

    let egress = backend.egress();
    assert_on_time(&egress, &[t0 + 80, t0 + 80]);
    assert_eq!(egress[0].message.data1(), 60);
    assert_eq!(egress[1].message.data1(), 61);
}

#[test]
fn closing_drops_unreleased_output() {
    let (backend, mut handle, clock) = open_output(500);
    let now = clock.now();
    handle
        .write(&[
            MidiEvent::new(now, MidiMessage::note_on(0, 60, 100)),
            MidiEvent::new(now + 300, MidiMessage::note_off(0, 60)),
        ])
        .unwrap();
    clock.sleep(50);
    handle.close().unwrap();
    clock.sleep(350);
    assert_eq!(backend.egress().len(), 1);
    assert_eq!(backend.open_connections(), 0);
}

#[test]
fn scheduled_host_failure_surfaces_on_next_write() {
    let (backend, mut handle, clock) = open_output(20);
    backend.disconnect();
    handle
        .write_short(clock.now(), MidiMessage::note_on(0, 60, 100))
        .unwrap();
    clock.sleep(60);
    let err = handle.write_short(clock.now(), MidiMessage::note_off(0, 60));
    assert!(matches!(err, Err(TransportError::Host(_))));
    assert!(handle.host_error_text().is_some());
}

#[test]
fn positive_latency_without_clock_is_rejected() {
    let mut backend = LoopbackBackend::new(Clock::start());
    let result = EndpointHandle::open(
        &mut backend,
        LOOPBACK_OUTPUT,
        Direction::Output,
        OpenOptions::default().latency(10),
    );
    // The session clock is never started in this test binary.
    assert!(matches!(result, Err(TransportError::ClockNotRunning)));
    assert_eq!(backend.open_connections(), 0);
}
