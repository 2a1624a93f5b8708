use anyhow::Result;

use etude_shared::InputSource;

use crate::input::{InputKind, InputSender, RawInputEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiNote {
    pub pitch: u8,
    pub kind: InputKind,
}

/// Decode a channel voice message. Note-on with velocity 0 is a note-off;
/// everything except note-on/off is ignored.
pub fn parse_message(message: &[u8]) -> Option<MidiNote> {
    let (&status, rest) = message.split_first()?;
    let pitch = *rest.first()? & 0x7F;
    let velocity = rest.get(1).copied().unwrap_or(0) & 0x7F;
    match status & 0xF0 {
        0x90 if velocity > 0 => Some(MidiNote { pitch, kind: InputKind::NoteOn { velocity } }),
        0x90 | 0x80 => Some(MidiNote { pitch, kind: InputKind::NoteOff }),
        _ => None,
    }
}

/// Controller input over every available MIDI port.
pub struct MidiControllerInput {
    /// Kept alive to keep receiving.
    connections: Vec<midir::MidiInputConnection<()>>,
    port_names: Vec<String>,
}

impl MidiControllerInput {
    pub fn open(sender: InputSender) -> Result<Self> {
        let midi_in = midir::MidiInput::new("etude-input")?;
        let ports = midi_in.ports();
        let mut connections = Vec::new();
        let mut port_names = Vec::new();

        for port in &ports {
            // Each connection consumes its MidiInput.
            let midi_in_for_port = midir::MidiInput::new("etude-input")?;
            let port_name = midi_in_for_port.port_name(port).unwrap_or_else(|_| "unknown".to_string());
            let tx = sender.clone();
            let clock = sender.clock();

            match midi_in_for_port.connect(
                port,
                &port_name,
                move |_timestamp, message, _| {
                    if let Some(note) = parse_message(message) {
                        tx.send(RawInputEvent {
                            source: InputSource::Controller,
                            pitch: note.pitch,
                            kind: note.kind,
                            observed_ms: clock.now_ms(),
                        });
                    }
                },
                (),
            ) {
                Ok(conn) => {
                    log::info!("[Midi] Connected {}", port_name);
                    connections.push(conn);
                    port_names.push(port_name);
                }
                Err(e) => log::warn!("[Midi] Could not connect {}: {}", port_name, e),
            }
        }

        if connections.is_empty() {
            log::info!("[Midi] No controller ports available");
        }
        Ok(Self { connections, port_names })
    }

    pub fn port_names(&self) -> &[String] {
        &self.port_names
    }

    pub fn is_connected(&self) -> bool {
        !self.connections.is_empty()
    }

    pub fn close(self) {
        for conn in self.connections {
            conn.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_on_and_off() {
        assert_eq!(
            parse_message(&[0x90, 60, 100]),
            Some(MidiNote { pitch: 60, kind: InputKind::NoteOn { velocity: 100 } })
        );
        assert_eq!(parse_message(&[0x83, 61, 64]), Some(MidiNote { pitch: 61, kind: InputKind::NoteOff }));
    }

    #[test]
    fn test_zero_velocity_note_on_is_release() {
        assert_eq!(parse_message(&[0x9F, 72, 0]), Some(MidiNote { pitch: 72, kind: InputKind::NoteOff }));
    }

    #[test]
    fn test_other_messages_ignored() {
        assert_eq!(parse_message(&[0xB0, 64, 127]), None);
        assert_eq!(parse_message(&[0xF8]), None);
        assert_eq!(parse_message(&[]), None);
    }
}
