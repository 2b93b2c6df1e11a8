// Copyright (c) 2023 Mike Tsao. All rights reserved.

//! Caller-surfaced error kinds.
//!
//! Only construction-time failures and contract violations propagate as errors; everything
//! recoverable at runtime (late drops, budget-exceeded rejections, transport faults) is a
//! drop-and-proceed policy decision logged through [`log`] instead.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("no MIDI output port matching \"{0}\" was found")]
    SinkUnavailable(String),

    #[error("chaining was requested but no note has been scheduled yet")]
    ChainingUnseeded,

    #[error("tempo must be greater than zero, got {0}")]
    InvalidTempo(f64),

    #[error("beat grid index {0} is out of range [0, 600)")]
    IndexOutOfRange(usize),

    #[error("failed to send MIDI message to the output port: {0}")]
    SinkTransportFault(String),
}
