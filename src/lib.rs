// Copyright (c) 2023 Mike Tsao. All rights reserved.

//! A real-time MIDI event scheduler: a two-priority-queue producer/consumer pipeline driven by
//! a single player thread, with a rolling beat grid for tempo-relative lookups.
//!
//! Producers admit [`RawEvent`]s or [`NoteDescriptor`]s from any thread via [`Scheduler`]; the
//! player thread promotes them onto its ready queue during idle time ("smart-sleep") and emits
//! them at their deadlines through a [`MidiSink`].

mod beat;
mod beat_grid;
mod error;
mod event;
mod port;
mod scheduler;
mod time;

pub use beat::Beat;
pub use beat_grid::MAX_INDEX;
pub use error::SchedulerError;
pub use event::{MidiMessageKind, NoteDescriptor, RawEvent, ALL_NOTES_OFF_CONTROLLER};
pub use port::{normalize_port_name, MidirSink, MidiSink};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use time::{beats_to_ticks, SystemClock, TimeSource, Tick};
