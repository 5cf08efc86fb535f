//! Standard MIDI File parser
//!
//! Reads format 0/1/2 files (running status, sysex and meta events, tempo
//! changes, SMPTE division) and flattens every track into a single timeline
//! of channel events stamped with output frame positions.

use crate::error::{Error, Result};
use std::io::{Cursor, Read, Seek, SeekFrom};

/// Controller number RPG Maker uses as a loop-start marker
pub const LOOP_CONTROLLER: u8 = 111;

/// Default tempo: 120 BPM
const DEFAULT_TEMPO_US: u32 = 500_000;

/// Channel event relevant for playback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiEvent {
    NoteOn { channel: u8, key: u8, velocity: u8 },
    NoteOff { channel: u8, key: u8 },
    Controller { channel: u8, controller: u8, value: u8 },
    Program { channel: u8, program: u8 },
    /// 14-bit bend centred on 0 (-8192..=8191)
    PitchBend { channel: u8, value: i16 },
}

impl MidiEvent {
    /// Whether replaying this event is needed to restore state after a seek
    pub fn is_state_change(&self) -> bool {
        !matches!(self, MidiEvent::NoteOn { .. } | MidiEvent::NoteOff { .. })
    }
}

/// Event with its position on the output timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedEvent {
    pub frame: u64,
    pub event: MidiEvent,
}

/// Flattened, time-resolved song
#[derive(Debug, Clone, Default)]
pub struct Sequence {
    pub events: Vec<TimedEvent>,

    /// Frame of the first loop marker, if any
    pub loop_start: Option<u64>,

    /// Frame of the last event
    pub length: u64,
}

#[derive(Debug, Clone, Copy)]
enum Division {
    TicksPerQuarter(u16),
    /// Ticks per second (SMPTE)
    Smpte(f64),
}

#[derive(Debug, Clone, Copy)]
enum RawKind {
    Channel(MidiEvent),
    Tempo(u32),
}

#[derive(Debug, Clone, Copy)]
struct RawEvent {
    tick: u64,
    kind: RawKind,
}

/// Parse `data` and resolve its timeline at `sample_rate`.
pub fn parse(data: &[u8], sample_rate: u32) -> Result<Sequence> {
    if data.len() < 14 {
        return Err(Error::Midi("File too small to contain a MIDI header".to_string()));
    }

    let mut cursor = Cursor::new(data);
    let mut magic = [0u8; 4];
    cursor.read_exact(&mut magic).map_err(|_| eof())?;
    if &magic != b"MThd" {
        return Err(Error::Midi("Missing MThd header".to_string()));
    }

    let header_len = read_u32(&mut cursor)?;
    if header_len < 6 {
        return Err(Error::Midi(format!("Invalid header length {}", header_len)));
    }
    let format = read_u16(&mut cursor)?;
    let track_count = read_u16(&mut cursor)?;
    let raw_division = read_u16(&mut cursor)?;
    cursor
        .seek(SeekFrom::Current(header_len as i64 - 6))
        .map_err(|_| eof())?;

    if format > 2 {
        return Err(Error::Midi(format!("Unsupported MIDI format {}", format)));
    }

    let division = if raw_division & 0x8000 != 0 {
        let fps = match ((raw_division >> 8) as u8 as i8).wrapping_neg() {
            29 => 29.97,
            fps => fps as f64,
        };
        let ticks_per_second = fps * (raw_division & 0xFF) as f64;
        if ticks_per_second <= 0.0 {
            return Err(Error::Midi(format!("Invalid SMPTE division 0x{:04X}", raw_division)));
        }
        Division::Smpte(ticks_per_second)
    } else {
        if raw_division == 0 {
            return Err(Error::Midi("Division of zero ticks per quarter".to_string()));
        }
        Division::TicksPerQuarter(raw_division)
    };

    let mut raw = Vec::new();
    let mut tracks_read = 0;
    while tracks_read < track_count && (cursor.position() as usize) < data.len() {
        let mut id = [0u8; 4];
        if cursor.read_exact(&mut id).is_err() {
            break;
        }
        let len = read_u32(&mut cursor)? as usize;
        let start = cursor.position() as usize;
        let end = start.saturating_add(len).min(data.len());

        if &id == b"MTrk" {
            parse_track(&data[start..end], &mut raw)?;
            tracks_read += 1;
        }
        cursor.set_position(end as u64);
    }

    if tracks_read == 0 {
        return Err(Error::Midi("No MTrk chunks found".to_string()));
    }

    // Stable sort keeps track order for simultaneous events
    raw.sort_by_key(|e| e.tick);
    Ok(resolve_timeline(&raw, division, sample_rate))
}

fn parse_track(data: &[u8], out: &mut Vec<RawEvent>) -> Result<()> {
    let mut cursor = Cursor::new(data);
    let mut tick: u64 = 0;
    let mut running_status: Option<u8> = None;

    while (cursor.position() as usize) < data.len() {
        tick += read_var_len(&mut cursor)? as u64;
        let mut status = read_u8(&mut cursor)?;

        let first_data = if status < 0x80 {
            let Some(running) = running_status else {
                return Err(Error::Midi("Data byte without running status".to_string()));
            };
            let data_byte = status;
            status = running;
            Some(data_byte)
        } else {
            None
        };

        match status {
            0xFF => {
                let meta_type = read_u8(&mut cursor)?;
                let len = read_var_len(&mut cursor)? as usize;
                let pos = cursor.position() as usize;
                if pos + len > data.len() {
                    return Err(eof());
                }
                match meta_type {
                    0x2F => break,
                    0x51 if len == 3 => {
                        let b = &data[pos..pos + 3];
                        let tempo = (b[0] as u32) << 16 | (b[1] as u32) << 8 | b[2] as u32;
                        out.push(RawEvent {
                            tick,
                            kind: RawKind::Tempo(tempo),
                        });
                    }
                    _ => {}
                }
                cursor.set_position((pos + len) as u64);
            }
            0xF0 | 0xF7 => {
                let len = read_var_len(&mut cursor)? as u64;
                cursor.set_position(cursor.position() + len);
                running_status = None;
            }
            0x80..=0xEF => {
                running_status = Some(status);
                let channel = status & 0x0F;
                let d1 = match first_data {
                    Some(b) => b,
                    None => read_u8(&mut cursor)?,
                } & 0x7F;

                let event = match status & 0xF0 {
                    0xC0 => Some(MidiEvent::Program {
                        channel,
                        program: d1,
                    }),
                    0xD0 => None,
                    high => {
                        let d2 = read_u8(&mut cursor)? & 0x7F;
                        match high {
                            0x80 => Some(MidiEvent::NoteOff { channel, key: d1 }),
                            0x90 if d2 == 0 => Some(MidiEvent::NoteOff { channel, key: d1 }),
                            0x90 => Some(MidiEvent::NoteOn {
                                channel,
                                key: d1,
                                velocity: d2,
                            }),
                            0xB0 => Some(MidiEvent::Controller {
                                channel,
                                controller: d1,
                                value: d2,
                            }),
                            0xE0 => Some(MidiEvent::PitchBend {
                                channel,
                                value: (((d2 as i16) << 7) | d1 as i16) - 8192,
                            }),
                            // Polyphonic aftertouch
                            _ => None,
                        }
                    }
                };

                if let Some(event) = event {
                    out.push(RawEvent {
                        tick,
                        kind: RawKind::Channel(event),
                    });
                }
            }
            // System common/real-time messages carry no payload we use
            _ => {}
        }
    }
    Ok(())
}

fn resolve_timeline(raw: &[RawEvent], division: Division, sample_rate: u32) -> Sequence {
    let rate = sample_rate as f64;
    let mut seq = Sequence::default();

    let mut tempo = DEFAULT_TEMPO_US;
    let mut last_tick: u64 = 0;
    let mut seconds: f64 = 0.0;

    for event in raw {
        let delta = (event.tick - last_tick) as f64;
        seconds += match division {
            Division::TicksPerQuarter(tpq) => delta * tempo as f64 / 1_000_000.0 / tpq as f64,
            Division::Smpte(ticks_per_sec) => delta / ticks_per_sec,
        };
        last_tick = event.tick;
        let frame = (seconds * rate).round() as u64;

        match event.kind {
            RawKind::Tempo(t) => {
                if t > 0 {
                    tempo = t;
                }
            }
            RawKind::Channel(ev) => {
                if let MidiEvent::Controller {
                    controller: LOOP_CONTROLLER,
                    ..
                } = ev
                {
                    seq.loop_start.get_or_insert(frame);
                }
                seq.events.push(TimedEvent { frame, event: ev });
            }
        }
        seq.length = frame;
    }
    seq
}

fn eof() -> Error {
    Error::Midi("Unexpected end of MIDI data".to_string())
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8> {
    let mut buf = [0u8; 1];
    cursor.read_exact(&mut buf).map_err(|_| eof())?;
    Ok(buf[0])
}

fn read_u16(cursor: &mut Cursor<&[u8]>) -> Result<u16> {
    let mut buf = [0u8; 2];
    cursor.read_exact(&mut buf).map_err(|_| eof())?;
    Ok(u16::from_be_bytes(buf))
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    let mut buf = [0u8; 4];
    cursor.read_exact(&mut buf).map_err(|_| eof())?;
    Ok(u32::from_be_bytes(buf))
}

/// Variable-length quantity, at most 4 bytes
fn read_var_len(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    let mut value: u32 = 0;
    for _ in 0..4 {
        let byte = read_u8(cursor)?;
        value = (value << 7) | (byte & 0x7F) as u32;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(Error::Midi("Variable-length quantity too long".to_string()))
}

/// Builders for test fixtures
#[cfg(test)]
pub(crate) mod build {
    pub fn var_len(mut value: u32, out: &mut Vec<u8>) {
        let mut bytes = vec![(value & 0x7F) as u8];
        value >>= 7;
        while value > 0 {
            bytes.push((value & 0x7F) as u8 | 0x80);
            value >>= 7;
        }
        bytes.reverse();
        out.extend(bytes);
    }

    /// Single-track file at 480 ticks per quarter from (delta, bytes) pairs
    pub fn smf(events: &[(u32, &[u8])]) -> Vec<u8> {
        let mut track = Vec::new();
        for (delta, bytes) in events {
            var_len(*delta, &mut track);
            track.extend_from_slice(bytes);
        }
        track.extend_from_slice(&[0x00, 0xFF, 0x2F, 0x00]);

        let mut data = b"MThd".to_vec();
        data.extend_from_slice(&6u32.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
        data.extend_from_slice(&1u16.to_be_bytes());
        data.extend_from_slice(&480u16.to_be_bytes());
        data.extend_from_slice(b"MTrk");
        data.extend_from_slice(&(track.len() as u32).to_be_bytes());
        data.extend(track);
        data
    }
}

#[cfg(test)]
mod tests {
    use super::build::smf;
    use super::*;

    #[test]
    fn test_parse_notes_at_default_tempo() {
        // Quarter note at 120 BPM = 0.5 s
        let data = smf(&[(0, &[0x90, 60, 100]), (480, &[0x80, 60, 0])]);
        let seq = parse(&data, 1000).unwrap();
        assert_eq!(seq.events.len(), 2);
        assert_eq!(seq.events[1].frame, 500);
        assert_eq!(seq.length, 500);
        assert_eq!(
            seq.events[0].event,
            MidiEvent::NoteOn {
                channel: 0,
                key: 60,
                velocity: 100
            }
        );
    }

    #[test]
    fn test_running_status_and_zero_velocity() {
        let data = smf(&[(0, &[0x91, 60, 100]), (240, &[62, 100]), (240, &[60, 0])]);
        let seq = parse(&data, 1000).unwrap();
        assert_eq!(seq.events.len(), 3);
        assert_eq!(seq.events[2].event, MidiEvent::NoteOff { channel: 1, key: 60 });
        assert_eq!(seq.events[2].frame, 500);
    }

    #[test]
    fn test_tempo_change() {
        // 60 BPM after the first event
        let data = smf(&[
            (0, &[0xFF, 0x51, 0x03, 0x0F, 0x42, 0x40]),
            (480, &[0x90, 60, 100]),
        ]);
        let seq = parse(&data, 1000).unwrap();
        assert_eq!(seq.events[0].frame, 1000);
    }

    #[test]
    fn test_loop_marker() {
        let data = smf(&[
            (0, &[0x90, 60, 100]),
            (480, &[0xB0, LOOP_CONTROLLER, 0]),
            (480, &[0xB0, LOOP_CONTROLLER, 0]),
        ]);
        let seq = parse(&data, 1000).unwrap();
        assert_eq!(seq.loop_start, Some(500));
    }

    #[test]
    fn test_pitch_bend_centre() {
        let data = smf(&[(0, &[0xE0, 0x00, 0x40])]);
        let seq = parse(&data, 1000).unwrap();
        assert_eq!(seq.events[0].event, MidiEvent::PitchBend { channel: 0, value: 0 });
    }

    #[test]
    fn test_rejects_truncated() {
        let data = smf(&[(0, &[0x90, 60, 100])]);
        assert!(parse(&data[..10], 1000).is_err());
        assert!(parse(b"MThd\x00\x00\x00\x06\x00\x00\x00\x00\x01\xE0", 1000).is_err());
    }
}
