// Copyright (c) 2023 Mike Tsao. All rights reserved.

//! The two-queue pipeline, the player loop and its smart-sleep maintenance cycle, the
//! pause/resume/stop lifecycle, and the producer API admissions land through.

use crate::beat::Beat;
use crate::beat_grid::BeatGrid;
use crate::error::SchedulerError;
use crate::event::{MidiMessageKind, NoteDescriptor, RawEvent};
use crate::port::{MidirSink, MidiSink};
use crate::time::{beats_to_ticks, fp_floor_i64, SystemClock, Tick, TimeSource};

use log::{debug, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

/// Options recognized at construction. See the field docs for defaults.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Normalized name of the MIDI output port to open.
    pub output_port_name: String,
    /// If true, the player thread is spawned as part of construction.
    pub start_immediately: bool,
    /// If true, scheduling decisions are also printed to standard error.
    pub print_msgs: bool,
    /// Cycle length for beat-grid numbering.
    pub beats_per_measure: u32,
    /// Denominator of the symbolic beat. Carried as configuration state; it does not
    /// participate in beat-grid numbering (see DESIGN.md).
    pub beat_unit: u32,
    /// Initial global tempo, in beats per minute.
    pub tempo_bpm: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            output_port_name: String::new(),
            start_immediately: true,
            print_msgs: false,
            beats_per_measure: 4,
            beat_unit: 4,
            tempo_bpm: 60.0,
        }
    }
}

/// State carried over from one `change_tempo` call until its incremental queue rescale
/// completes. A single sorted snapshot is taken up front; each smart-sleep step advances one
/// entry further into it, scaling inter-event gaps relative to the previous (already rescaled)
/// entry.
struct TempoRescale {
    old: Vec<RawEvent>,
    new: Vec<RawEvent>,
    index: usize,
    scaling_factor: f64,
}

struct Shared<S: MidiSink> {
    clock: Arc<dyn TimeSource>,
    sink: Mutex<S>,
    running: AtomicBool,
    paused: AtomicBool,
    print_msgs: bool,
    pause_lock: Mutex<()>,
    pause_cv: Condvar,
    buffer: Mutex<BinaryHeap<RawEvent>>,
    queue: Mutex<BinaryHeap<RawEvent>>,
    grid: Mutex<BeatGrid>,
    previous_end_marker: Mutex<Tick>,
    tempo_bpm: Mutex<f64>,
    guard_ticks: Tick,
    rng: Mutex<StdRng>,
    tempo_rescale: Mutex<Option<TempoRescale>>,
}

/// A real-time MIDI event scheduler.
///
/// Owns a single player thread. Producers call the admission methods from any thread; the
/// player thread promotes admitted events into its ready queue during its idle time and emits
/// them at their deadlines.
pub struct Scheduler<S: MidiSink> {
    shared: Arc<Shared<S>>,
    player_thread: Option<JoinHandle<()>>,
}

impl Scheduler<MidirSink> {
    /// Opens `config.output_port_name` via `midir` and constructs a scheduler around it, using
    /// the system clock.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        let sink = MidirSink::open(&config.output_port_name)?;
        Self::new_with_clock(config, sink, Arc::new(SystemClock::default()))
    }
}

impl<S: MidiSink + Send + 'static> Scheduler<S> {
    /// Constructs a scheduler around an already-open sink, using the system clock. Jitter is
    /// seeded from OS entropy.
    pub fn new_with_sink(config: SchedulerConfig, sink: S) -> Result<Self, SchedulerError> {
        Self::new_with_clock(config, sink, Arc::new(SystemClock::default()))
    }

    /// Constructs a scheduler around an already-open sink and an explicit clock. Jitter is
    /// seeded from OS entropy.
    pub fn new_with_clock(config: SchedulerConfig, sink: S, clock: Arc<dyn TimeSource>) -> Result<Self, SchedulerError> {
        Self::new_internal(config, sink, clock, None)
    }

    /// Like [`Self::new_with_clock`], but the jitter PRNG is seeded deterministically instead of
    /// from OS entropy. For tests.
    pub fn new_with_seed(
        config: SchedulerConfig,
        sink: S,
        clock: Arc<dyn TimeSource>,
        seed: u64,
    ) -> Result<Self, SchedulerError> {
        Self::new_internal(config, sink, clock, Some(seed))
    }

    fn new_internal(
        config: SchedulerConfig,
        sink: S,
        clock: Arc<dyn TimeSource>,
        seed: Option<u64>,
    ) -> Result<Self, SchedulerError> {
        let frequency = clock.frequency();
        let guard_ticks = frequency / 100; // 10ms
        let now = clock.now();
        let anchor = clock.future(now, 1000);

        let mut grid = BeatGrid::new(config.beats_per_measure);
        grid.precalculate(anchor, config.tempo_bpm, frequency);

        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let shared = Arc::new(Shared {
            clock,
            sink: Mutex::new(sink),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            print_msgs: config.print_msgs,
            pause_lock: Mutex::new(()),
            pause_cv: Condvar::new(),
            buffer: Mutex::new(BinaryHeap::new()),
            queue: Mutex::new(BinaryHeap::new()),
            grid: Mutex::new(grid),
            previous_end_marker: Mutex::new(0),
            tempo_bpm: Mutex::new(config.tempo_bpm),
            guard_ticks,
            rng: Mutex::new(rng),
            tempo_rescale: Mutex::new(None),
        });

        let mut scheduler = Self { shared, player_thread: None };
        if config.start_immediately {
            scheduler.start();
        }
        Ok(scheduler)
    }

    /// Idempotent: spawns the player thread and returns `true`, or returns `false` without
    /// doing anything if it's already running.
    pub fn start(&mut self) -> bool {
        if self.player_thread.is_some() {
            debug!("start() called while the player thread is already running");
            return false;
        }
        self.shared.running.store(true, AtomicOrdering::SeqCst);
        let shared = self.shared.clone();
        self.player_thread = Some(thread::spawn(move || player_loop(shared)));
        true
    }

    /// Blocks the caller for 100ms (to let currently-sounding notes release), then sends
    /// all-notes-off. The player continues to idle on the pause condition until `resume()`.
    pub fn pause(&self) {
        self.shared.paused.store(true, AtomicOrdering::SeqCst);
        self.shared.clock.sleep_coarse(100);
        send_all_notes_off(&self.shared);
    }

    pub fn resume(&self) {
        {
            let _guard = self.shared.pause_lock.lock().unwrap();
            self.shared.paused.store(false, AtomicOrdering::SeqCst);
        }
        self.shared.pause_cv.notify_all();
    }

    /// Stops the player and clears its ready queue. Does not join the thread; `Drop` does that.
    pub fn stop(&self) {
        self.shared.running.store(false, AtomicOrdering::SeqCst);
        self.shared.pause_cv.notify_all();
        *self.shared.queue.lock().unwrap() = BinaryHeap::new();
    }

    /// Pushes a raw event directly to the producer buffer.
    pub fn add_event(&self, event: RawEvent) {
        self.shared.buffer.lock().unwrap().push(event);
    }

    /// Pushes a raw event whose deadline is shifted by `offset_ticks`.
    pub fn add_event_with_offset(&self, mut event: RawEvent, offset_ticks: Tick) {
        event.deadline += offset_ticks;
        self.shared.buffer.lock().unwrap().push(event);
    }

    pub fn add_events(&self, events: impl IntoIterator<Item = RawEvent>) {
        let mut buffer = self.shared.buffer.lock().unwrap();
        for event in events {
            buffer.push(event);
        }
    }

    pub fn add_events_with_offset(&self, events: impl IntoIterator<Item = RawEvent>, offset_ticks: Tick) {
        let mut buffer = self.shared.buffer.lock().unwrap();
        for mut event in events {
            event.deadline += offset_ticks;
            buffer.push(event);
        }
    }

    /// Admits a note descriptor, resolving chaining and tempo inheritance, applying jitter, and
    /// pushing the resulting NoteOn/NoteOff pair to the producer buffer.
    pub fn add_note(&self, mut descriptor: NoteDescriptor) -> Result<(), SchedulerError> {
        let sounding_ticks = self.resolve_note(&mut descriptor, 0)?;
        self.push_note(descriptor, sounding_ticks);
        Ok(())
    }

    /// Like [`Self::add_note`], but the note's anchor is shifted by `offset_beats` (converted to
    /// ticks at the note's effective tempo) before chaining/marker resolution.
    pub fn add_note_with_offset(&self, mut descriptor: NoteDescriptor, offset_beats: Beat) -> Result<(), SchedulerError> {
        let tempo = if descriptor.tempo_bpm < 0.0 {
            *self.shared.tempo_bpm.lock().unwrap()
        } else {
            descriptor.tempo_bpm
        };
        let offset_ticks = beats_to_ticks(tempo, offset_beats.millis_at_60bpm(), self.shared.clock.frequency());
        let sounding_ticks = self.resolve_note(&mut descriptor, offset_ticks)?;
        self.push_note(descriptor, sounding_ticks);
        Ok(())
    }

    /// Admits each descriptor in order, stopping at the first failure.
    pub fn add_notes(&self, descriptors: impl IntoIterator<Item = NoteDescriptor>) -> Result<(), SchedulerError> {
        for descriptor in descriptors {
            self.add_note(descriptor)?;
        }
        Ok(())
    }

    pub fn add_notes_with_offset(
        &self,
        descriptors: impl IntoIterator<Item = NoteDescriptor>,
        offset_beats: Beat,
    ) -> Result<(), SchedulerError> {
        for descriptor in descriptors {
            self.add_note_with_offset(descriptor, offset_beats)?;
        }
        Ok(())
    }

    /// Changes the global tempo effective from `anchor`: rebuilds the beat grid at the new
    /// tempo and requests an incremental rescale of the currently-queued (not-yet-played)
    /// events, preserving their relative spacing multiplied by `old_tempo / new_tempo`.
    pub fn change_tempo(&self, tempo_bpm: f64, anchor: Tick) -> Result<(), SchedulerError> {
        if tempo_bpm <= 0.0 {
            return Err(SchedulerError::InvalidTempo(tempo_bpm));
        }
        let old_tempo = {
            let mut tempo = self.shared.tempo_bpm.lock().unwrap();
            let old = *tempo;
            *tempo = tempo_bpm;
            old
        };
        let scaling_factor = old_tempo / tempo_bpm;
        {
            let queue = self.shared.queue.lock().unwrap();
            let mut old_sorted: Vec<RawEvent> = queue.iter().copied().collect();
            old_sorted.sort_by_key(|event| event.deadline);
            *self.shared.tempo_rescale.lock().unwrap() = Some(TempoRescale {
                old: old_sorted,
                new: Vec::new(),
                index: 0,
                scaling_factor,
            });
        }
        self.shared
            .grid
            .lock()
            .unwrap()
            .rescale(anchor, tempo_bpm, self.shared.clock.frequency());
        Ok(())
    }

    /// Requests that every beat-grid entry's tick be translated by `offset_ticks`, applied
    /// incrementally during smart-sleep.
    pub fn shift(&self, offset_ticks: Tick) {
        self.shared.grid.lock().unwrap().request_shift(offset_ticks);
    }

    pub fn tempo(&self) -> f64 {
        *self.shared.tempo_bpm.lock().unwrap()
    }

    pub fn previous_end_marker(&self) -> Tick {
        *self.shared.previous_end_marker.lock().unwrap()
    }

    pub fn beat_from_index(&self, index: usize) -> Result<(Tick, u32), SchedulerError> {
        let now = self.shared.clock.now();
        self.shared.grid.lock().unwrap().beat_from_index(index, now)
    }

    pub fn next_beat_by_number(&self, beat_num: u32, measure_num: u32) -> Option<Tick> {
        let now = self.shared.clock.now();
        self.shared.grid.lock().unwrap().next_beat_by_number(beat_num, measure_num, now)
    }

    pub fn beat_schedule(&self) -> Vec<(Tick, u32)> {
        self.shared.grid.lock().unwrap().snapshot()
    }

    /// Resolves chaining/tempo-inheritance/jitter for a descriptor, bumps the previous-end
    /// marker, and returns the number of sounding ticks (the NoteOn/NoteOff gap).
    fn resolve_note(&self, descriptor: &mut NoteDescriptor, offset_ticks: Tick) -> Result<Tick, SchedulerError> {
        let frequency = self.shared.clock.frequency();
        let mut marker = self.shared.previous_end_marker.lock().unwrap();

        if *marker == 0 && descriptor.scheduled_tick < 0 {
            return Err(SchedulerError::ChainingUnseeded);
        }
        if descriptor.scheduled_tick < 0 {
            descriptor.scheduled_tick = *marker;
        }
        descriptor.scheduled_tick += offset_ticks;

        let jitter = self.shared.rng.lock().unwrap().gen_range(-10_000..=10_000);
        descriptor.base.deadline = descriptor.scheduled_tick + jitter;

        if descriptor.tempo_bpm < 0.0 {
            descriptor.tempo_bpm = *self.shared.tempo_bpm.lock().unwrap();
        }

        let symbolic_ticks = beats_to_ticks(descriptor.tempo_bpm, descriptor.duration.millis_at_60bpm(), frequency);
        *marker = descriptor.scheduled_tick + symbolic_ticks.abs();

        Ok(fp_floor_i64(descriptor.division * symbolic_ticks as f64))
    }

    fn push_note(&self, descriptor: NoteDescriptor, sounding_ticks: Tick) {
        let mut note_on = descriptor.base;
        if sounding_ticks <= 0 {
            note_on.velocity = 0;
        }
        let note_off = note_on.note_off_after(sounding_ticks.max(0));
        let mut buffer = self.shared.buffer.lock().unwrap();
        buffer.push(note_on);
        buffer.push(note_off);
    }
}

impl<S: MidiSink> Drop for Scheduler<S> {
    fn drop(&mut self) {
        send_all_notes_off(&self.shared);
        self.shared.running.store(false, AtomicOrdering::SeqCst);
        self.shared.pause_cv.notify_all();
        if let Some(handle) = self.player_thread.take() {
            let _ = handle.join();
        }
    }
}

fn send_all_notes_off<S: MidiSink>(shared: &Shared<S>) {
    let event = RawEvent::all_notes_off(shared.clock.now());
    let mut sink = shared.sink.lock().unwrap();
    if let Err(error) = sink.send(&event.to_bytes()) {
        warn!("failed to send all-notes-off: {error}");
    }
}

fn send_event<S: MidiSink>(shared: &Shared<S>, event: &RawEvent) {
    let mut sink = shared.sink.lock().unwrap();
    if let Err(error) = sink.send(&event.to_bytes()) {
        warn!("sink transport fault, dropping event: {error}");
    }
}

/// Attempts to promote `event` from `B` to `Q`: accepted if its deadline is at least `G` ticks
/// in the future, otherwise dropped as budget-exceeded.
fn try_promote<S: MidiSink>(shared: &Shared<S>, queue: &mut BinaryHeap<RawEvent>, event: RawEvent) -> bool {
    if event.deadline >= shared.clock.now() + shared.guard_ticks {
        queue.push(event);
        true
    } else {
        if shared.print_msgs {
            eprintln!("budget exceeded, dropping note {} (deadline {})", event.note, event.deadline);
        }
        warn!("budget exceeded for note {} at deadline {}", event.note, event.deadline);
        false
    }
}

/// One bounded step of the tempo-rescale-in-progress over `queue`: advances the saved index by
/// one entry, scaling its gap from the previous (already-rescaled) entry, and swaps the
/// rebuilt queue in once complete.
fn step_tempo_rescale(
    slot: &mut Option<TempoRescale>,
    queue: &mut BinaryHeap<RawEvent>,
    clock: &dyn TimeSource,
    budget_deadline: Tick,
    guard_ticks: Tick,
) {
    let Some(state) = slot.as_mut() else { return };
    loop {
        if state.index >= state.old.len() {
            *queue = state.new.drain(..).collect();
            *slot = None;
            return;
        }
        let event = state.old[state.index];
        let new_deadline = if state.index == 0 {
            event.deadline
        } else {
            let prev_old = state.old[state.index - 1];
            let prev_new = state.new[state.index - 1];
            let diff = event.deadline - prev_old.deadline;
            prev_new.deadline + fp_floor_i64(state.scaling_factor * diff as f64)
        };
        let mut shifted = event;
        shifted.deadline = new_deadline;
        state.new.push(shifted);
        state.index += 1;
        if clock.now() >= budget_deadline - guard_ticks {
            return;
        }
    }
}

/// The cooperative wait before `deadline`: repeatedly promotes from `B`, advances an in-progress
/// shift, advances an in-progress tempo rescale, or prunes/extends the beat grid by one step,
/// until within `guard_ticks` of `deadline`. `B`'s mutex is held for the whole call.
fn smart_sleep<S: MidiSink>(shared: &Shared<S>, deadline: Tick) {
    let mut buffer = shared.buffer.lock().unwrap();
    loop {
        if let Some(candidate) = buffer.pop() {
            let mut queue = shared.queue.lock().unwrap();
            try_promote(shared, &mut queue, candidate);
        } else {
            let shift_pending = shared.grid.lock().unwrap().shift_pending();
            if shift_pending {
                let mut grid = shared.grid.lock().unwrap();
                grid.shift_step(shared.clock.as_ref(), deadline, shared.guard_ticks);
            } else if shared.tempo_rescale.lock().unwrap().is_some() {
                let mut rescale = shared.tempo_rescale.lock().unwrap();
                let mut queue = shared.queue.lock().unwrap();
                step_tempo_rescale(&mut rescale, &mut queue, shared.clock.as_ref(), deadline, shared.guard_ticks);
            } else {
                let mut grid = shared.grid.lock().unwrap();
                grid.prune_step(shared.clock.as_ref(), deadline, shared.guard_ticks);
            }
        }
        if shared.clock.now() >= deadline - shared.guard_ticks {
            break;
        }
    }
}

fn player_loop<S: MidiSink>(shared: Arc<Shared<S>>) {
    'outer: while shared.running.load(AtomicOrdering::SeqCst) {
        {
            let guard = shared.pause_lock.lock().unwrap();
            let _guard = shared
                .pause_cv
                .wait_while(guard, |_| {
                    shared.paused.load(AtomicOrdering::SeqCst) && shared.running.load(AtomicOrdering::SeqCst)
                })
                .unwrap();
        }
        if !shared.running.load(AtomicOrdering::SeqCst) {
            break;
        }

        {
            let mut queue = shared.queue.lock().unwrap();
            if queue.is_empty() {
                let mut buffer = shared.buffer.lock().unwrap();
                if buffer.is_empty() {
                    *shared.previous_end_marker.lock().unwrap() = 0;
                    continue 'outer;
                }
                while let Some(candidate) = buffer.pop() {
                    if try_promote(&shared, &mut queue, candidate) {
                        break;
                    }
                }
                if queue.is_empty() {
                    continue 'outer;
                }
            }
        }

        let event = {
            let mut queue = shared.queue.lock().unwrap();
            match queue.pop() {
                Some(event) => event,
                None => continue 'outer,
            }
        };

        let now = shared.clock.now();

        if now > event.deadline + shared.guard_ticks {
            if shared.print_msgs {
                eprintln!("dropping late event: note={} deadline={} now={}", event.note, event.deadline, now);
            }
            debug!("dropping late event {:?} (now={now})", event);
            continue 'outer;
        } else if now > event.deadline {
            // Within the guard window behind schedule: emit immediately and stop. See the
            // resolved open question in DESIGN.md about not falling through into smart-sleep.
            send_event(&shared, &event);
            continue 'outer;
        }

        if shared.print_msgs {
            eprintln!(
                "scheduled: status=0x{:02X} note={} velocity={} deadline={}",
                event.kind.status_byte(),
                event.note,
                event.velocity,
                event.deadline
            );
        }

        smart_sleep(&shared, event.deadline);
        shared.clock.busy_wait_until(event.deadline);
        send_event(&shared, &event);
    }
}
