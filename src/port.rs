// Copyright (c) 2023 Mike Tsao. All rights reserved.

//! The external MIDI output boundary.

use crate::error::SchedulerError;
use midir::{MidiOutput, MidiOutputConnection};

/// Anything that can accept raw outgoing MIDI messages. The player thread is the sole sender
/// during normal operation; `pause()` and the destructor's all-notes-off also send through this,
/// serialized behind the same lock (see `Scheduler`).
pub trait MidiSink: Send {
    fn send(&mut self, bytes: &[u8]) -> Result<(), SchedulerError>;
}

/// Tokenizes a raw port enumeration string on whitespace and drops the trailing device-index
/// token, leaving the remainder to be matched verbatim against a configured port name.
pub fn normalize_port_name(raw: &str) -> String {
    let tokens: Vec<&str> = raw.split_whitespace().collect();
    if tokens.len() <= 1 {
        return String::new();
    }
    tokens[..tokens.len() - 1].join(" ")
}

/// A [`MidiSink`] backed by `midir`, located at construction time by normalized name.
pub struct MidirSink {
    connection: MidiOutputConnection,
}

impl MidirSink {
    pub fn open(name: &str) -> Result<Self, SchedulerError> {
        let midi_out =
            MidiOutput::new("midi-scheduler").map_err(|e| SchedulerError::SinkUnavailable(e.to_string()))?;
        let ports = midi_out.ports();
        let index = ports
            .iter()
            .position(|port| {
                midi_out
                    .port_name(port)
                    .map(|raw| normalize_port_name(&raw) == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| SchedulerError::SinkUnavailable(name.to_string()))?;
        let connection = midi_out
            .connect(&ports[index], "midi-scheduler-out")
            .map_err(|e| SchedulerError::SinkUnavailable(e.to_string()))?;
        Ok(Self { connection })
    }
}

impl MidiSink for MidirSink {
    fn send(&mut self, bytes: &[u8]) -> Result<(), SchedulerError> {
        self.connection
            .send(bytes)
            .map_err(|e| SchedulerError::SinkTransportFault(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_drops_trailing_index_token() {
        assert_eq!(normalize_port_name("IAC Driver Bus 1"), "IAC Driver Bus");
        assert_eq!(normalize_port_name("Midi Through Port-0 14"), "Midi Through Port-0");
    }

    #[test]
    fn normalize_single_token_has_no_name_left() {
        assert_eq!(normalize_port_name("USB"), "");
    }

    #[test]
    fn normalize_empty_input_is_empty() {
        assert_eq!(normalize_port_name(""), "");
    }

    #[test]
    fn normalize_collapses_internal_whitespace() {
        assert_eq!(normalize_port_name("Foo   Bar   2"), "Foo Bar");
    }
}
