//! End-to-end scheduling scenarios, run against the real system clock with a recording sink in
//! place of a hardware MIDI port. Deadlines are kept short (tens to low hundreds of
//! milliseconds) so the suite stays fast while still exercising the real player thread, its
//! smart-sleep cooperative wait, and its busy-wait tail.

use midi_scheduler::{
    Beat, MidiMessageKind, MidiSink, NoteDescriptor, RawEvent, Scheduler, SchedulerConfig, SchedulerError,
    SystemClock, TimeSource,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Default)]
struct RecordingSink {
    sent: Arc<Mutex<Vec<[u8; 3]>>>,
}

impl RecordingSink {
    fn snapshot(&self) -> Vec<[u8; 3]> {
        self.sent.lock().unwrap().clone()
    }
}

impl MidiSink for RecordingSink {
    fn send(&mut self, bytes: &[u8]) -> Result<(), SchedulerError> {
        self.sent.lock().unwrap().push([bytes[0], bytes[1], bytes[2]]);
        Ok(())
    }
}

fn settle(millis: u64) {
    std::thread::sleep(Duration::from_millis(millis));
}

#[test]
fn ascending_scale_is_emitted_in_order() {
    let clock = Arc::new(SystemClock::default());
    let sink = RecordingSink::default();
    let config = SchedulerConfig { tempo_bpm: 600.0, start_immediately: true, ..Default::default() };
    let scheduler =
        Scheduler::new_with_seed(config, sink.clone(), clock.clone() as Arc<dyn TimeSource>, 1).unwrap();

    let scale = [60u8, 62, 64, 65, 67];
    let mut notes = scale.iter().map(|&note| NoteDescriptor::chained(note, 100, Beat::Sixteenth, 0.8));
    let seed = notes.next().unwrap();
    scheduler
        .add_note(NoteDescriptor::new(seed.base.note, seed.base.velocity, seed.duration, seed.division, 0, 600.0))
        .unwrap();
    scheduler.add_notes(notes).unwrap();

    settle(600);

    let sent = sink.snapshot();
    let note_ons: Vec<u8> = sent.iter().filter(|b| b[0] == MidiMessageKind::NoteOn.status_byte()).map(|b| b[1]).collect();
    assert_eq!(note_ons, scale.to_vec());
}

#[test]
fn tempo_change_mid_queue_does_not_reorder_pending_notes() {
    let clock = Arc::new(SystemClock::default());
    let sink = RecordingSink::default();
    let config = SchedulerConfig { tempo_bpm: 300.0, start_immediately: true, ..Default::default() };
    let scheduler =
        Scheduler::new_with_seed(config, sink.clone(), clock.clone() as Arc<dyn TimeSource>, 2).unwrap();

    let seed = NoteDescriptor::new(60, 100, Beat::Quarter, 0.9, clock.future(clock.now(), 50), 300.0);
    scheduler.add_note(seed).unwrap();
    scheduler.add_notes((0..4).map(|i| NoteDescriptor::chained(60 + i + 1, 100, Beat::Quarter, 0.9))).unwrap();

    settle(30);
    scheduler.change_tempo(600.0, clock.future(clock.now(), 20)).unwrap();

    settle(600);

    let sent = sink.snapshot();
    let note_ons: Vec<u8> = sent.iter().filter(|b| b[0] == MidiMessageKind::NoteOn.status_byte()).map(|b| b[1]).collect();
    assert_eq!(note_ons, vec![60, 61, 62, 63, 64]);
}

#[test]
fn beat_shift_translates_the_grid_without_touching_event_deadlines() {
    let clock = Arc::new(SystemClock::default());
    let sink = RecordingSink::default();
    let config = SchedulerConfig { tempo_bpm: 120.0, start_immediately: true, ..Default::default() };
    let scheduler =
        Scheduler::new_with_seed(config, sink.clone(), clock.clone() as Arc<dyn TimeSource>, 3).unwrap();

    let before = scheduler.beat_schedule();
    let offset = SystemClock::FREQUENCY / 10;
    scheduler.shift(offset);

    // A far-off event keeps the player thread inside smart-sleep long enough to drain the
    // incremental shift before it fires.
    scheduler.add_event(RawEvent::new(MidiMessageKind::NoteOn, 90, 100, clock.future(clock.now(), 200)));
    settle(80);
    let after = scheduler.beat_schedule();

    assert_eq!(before.len(), after.len());
    for (b, a) in before.iter().zip(after.iter()) {
        assert_eq!(a.0 - b.0, offset);
        assert_eq!(a.1, b.1);
    }
}

#[test]
fn pause_then_resume_delivers_events_admitted_before_the_pause() {
    let clock = Arc::new(SystemClock::default());
    let sink = RecordingSink::default();
    let config = SchedulerConfig { tempo_bpm: 600.0, start_immediately: true, ..Default::default() };
    let scheduler =
        Scheduler::new_with_seed(config, sink.clone(), clock.clone() as Arc<dyn TimeSource>, 4).unwrap();

    let deadline = clock.future(clock.now(), 400);
    scheduler.add_event(RawEvent::new(MidiMessageKind::NoteOn, 72, 100, deadline));

    scheduler.pause();
    settle(50);
    scheduler.resume();

    settle(600);

    let sent = sink.snapshot();
    assert!(sent.iter().any(|b| b[0] == MidiMessageKind::NoteOn.status_byte() && b[1] == 72));
}

#[test]
fn events_admitted_inside_the_guard_window_are_dropped_as_budget_exceeded() {
    let clock = Arc::new(SystemClock::default());
    let sink = RecordingSink::default();
    let config = SchedulerConfig { tempo_bpm: 120.0, start_immediately: true, ..Default::default() };
    let scheduler =
        Scheduler::new_with_seed(config, sink.clone(), clock.clone() as Arc<dyn TimeSource>, 5).unwrap();

    let immediate = RawEvent::new(MidiMessageKind::NoteOn, 90, 100, clock.now());
    scheduler.add_event(immediate);

    settle(300);

    let sent = sink.snapshot();
    assert!(!sent.iter().any(|b| b[1] == 90));
}
