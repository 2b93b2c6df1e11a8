// Copyright (c) 2023 Mike Tsao. All rights reserved.

//! Plays a one-octave C-major scale, one quarter note at a time, chained end-to-end.
//!
//! Run with the name of a real or virtual MIDI output port, e.g.:
//!   cargo run --example ascending_scale -- "IAC Driver Bus 1"

use midi_scheduler::{Beat, MidirSink, NoteDescriptor, Scheduler, SchedulerConfig, SystemClock, TimeSource};
use std::env;
use std::sync::Arc;
use std::time::Duration;

fn main() {
    env_logger::init();

    let port_name = env::args().nth(1).unwrap_or_else(|| "IAC Driver Bus".to_string());
    let config = SchedulerConfig {
        output_port_name: port_name.clone(),
        tempo_bpm: 120.0,
        print_msgs: true,
        ..Default::default()
    };

    let sink = match MidirSink::open(&port_name) {
        Ok(sink) => sink,
        Err(error) => {
            eprintln!("could not open MIDI output: {error}");
            std::process::exit(1);
        }
    };
    let clock = Arc::new(SystemClock::default());
    let scheduler = Scheduler::new_with_clock(config, sink, clock.clone() as Arc<dyn TimeSource>)
        .expect("sink is already open, construction cannot fail here");

    const C_MAJOR_SCALE: [u8; 8] = [60, 62, 64, 65, 67, 69, 71, 72];

    let mut notes = C_MAJOR_SCALE.iter().map(|&note| NoteDescriptor::chained(note, 100, Beat::Quarter, 0.9));
    let seed_note = notes.next().expect("scale is non-empty");
    let seed_deadline = clock.future(clock.now(), 1000);
    scheduler
        .add_note(NoteDescriptor::new(
            seed_note.base.note,
            seed_note.base.velocity,
            seed_note.duration,
            seed_note.division,
            seed_deadline,
            120.0,
        ))
        .expect("seed note always admits");
    scheduler.add_notes(notes).expect("chained scale always admits after a seed");

    std::thread::sleep(Duration::from_secs(6));
}
