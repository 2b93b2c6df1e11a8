// Copyright (c) 2023 Mike Tsao. All rights reserved.

//! Pre-computed `(tick, beat_in_measure)` schedule, kept contiguous over a rolling horizon so
//! "when is beat N of measure M" is a constant-time lookup and tempo/shift changes are cheap.

use crate::error::SchedulerError;
use crate::time::{fp_floor_i64, Tick, TimeSource};
use std::collections::VecDeque;

const HORIZON_SECONDS: i64 = 5 * 60;

/// Valid range for [`BeatGrid::beat_from_index`]: `[0, 600)`.
pub const MAX_INDEX: usize = 600;

/// A monotone, rolling schedule of beat ticks. Owned by the player; mutated in place by
/// prune-and-extend, shift, and rescale.
#[derive(Debug)]
pub struct BeatGrid {
    entries: VecDeque<(Tick, u32)>,
    beats_per_measure: u32,
    ticks_per_beat: Tick,
    shift_offset: Tick,
    shift_index: usize,
    shift_pending: bool,
}

impl BeatGrid {
    pub fn new(beats_per_measure: u32) -> Self {
        Self {
            entries: VecDeque::new(),
            beats_per_measure: beats_per_measure.max(1),
            ticks_per_beat: 0,
            shift_offset: 0,
            shift_index: 0,
            shift_pending: false,
        }
    }

    /// Clears the grid and emits entries from `anchor` forward at `ticks_per_beat = floor((60 /
    /// tempo) * frequency)` spacing, cycling beat numbers `1..=beats_per_measure`, until the
    /// horizon is covered.
    pub fn precalculate(&mut self, anchor: Tick, tempo_bpm: f64, frequency: i64) {
        self.entries.clear();
        self.ticks_per_beat = fp_floor_i64((60.0 / tempo_bpm) * frequency as f64).max(1);
        let horizon = HORIZON_SECONDS * frequency;
        let mut tick = anchor;
        let mut beat_number = 1u32;
        while tick - anchor < horizon {
            self.entries.push_back((tick, beat_number));
            tick += self.ticks_per_beat;
            beat_number += 1;
            if beat_number > self.beats_per_measure {
                beat_number = 1;
            }
        }
    }

    /// Rebuilds the grid at a new tempo, anchored at `anchor`. Equivalent to `precalculate`.
    pub fn rescale(&mut self, anchor: Tick, tempo_bpm: f64, frequency: i64) {
        self.precalculate(anchor, tempo_bpm, frequency);
    }

    /// One bounded step of prune-and-extend: while the head entry is expired, drop it and
    /// append a new tail entry, checking the time budget after each drop/extend pair.
    pub fn prune_step(&mut self, clock: &dyn TimeSource, budget_deadline: Tick, guard_ticks: Tick) {
        loop {
            let now = clock.now();
            let expired = matches!(self.entries.front(), Some(&(tick, _)) if tick < now);
            if !expired {
                break;
            }
            let &(last_tick, last_beat) = self.entries.back().expect("grid is never empty while running");
            self.entries.pop_front();
            let mut next_beat = last_beat + 1;
            if next_beat > self.beats_per_measure {
                next_beat = 1;
            }
            self.entries.push_back((last_tick + self.ticks_per_beat, next_beat));
            if clock.now() >= budget_deadline - guard_ticks {
                break;
            }
        }
    }

    /// Requests that every grid entry's tick be translated by `offset_ticks`. Applied
    /// incrementally across subsequent [`Self::shift_step`] calls.
    pub fn request_shift(&mut self, offset_ticks: Tick) {
        self.shift_offset = offset_ticks;
        self.shift_index = 0;
        self.shift_pending = true;
    }

    pub fn shift_pending(&self) -> bool {
        self.shift_pending
    }

    /// One bounded step of the incremental shift: advances from the saved index until either
    /// the budget is exhausted or the grid end is reached, at which point the request clears.
    pub fn shift_step(&mut self, clock: &dyn TimeSource, budget_deadline: Tick, guard_ticks: Tick) {
        while self.shift_index < self.entries.len() {
            self.entries[self.shift_index].0 += self.shift_offset;
            self.shift_index += 1;
            if clock.now() >= budget_deadline - guard_ticks {
                return;
            }
        }
        self.shift_pending = false;
        self.shift_index = 0;
    }

    /// `(tick, beat_in_measure)` at `index`, or `(0, 0)` if that slot's tick has already passed.
    /// `index` must be in `[0, 600)`.
    pub fn beat_from_index(&self, index: usize, now: Tick) -> Result<(Tick, u32), SchedulerError> {
        if index >= MAX_INDEX {
            return Err(SchedulerError::IndexOutOfRange(index));
        }
        match self.entries.get(index) {
            None => Ok((0, 0)),
            Some(&(tick, _)) if tick < now => Ok((0, 0)),
            Some(&(tick, beat)) => Ok((tick, beat)),
        }
    }

    /// Walks forward to the `measure_num`-th (0-indexed) still-future occurrence of `beat_num`.
    pub fn next_beat_by_number(&self, beat_num: u32, measure_num: u32, now: Tick) -> Option<Tick> {
        let mut occurrence = 0u32;
        for &(tick, beat) in self.entries.iter() {
            if tick < now || beat != beat_num {
                continue;
            }
            if occurrence == measure_num {
                return Some(tick);
            }
            occurrence += 1;
        }
        None
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A snapshot of the grid's entries, for callers that want to display or reason about
    /// upcoming beats.
    pub fn snapshot(&self) -> Vec<(Tick, u32)> {
        self.entries.iter().copied().collect()
    }
}
