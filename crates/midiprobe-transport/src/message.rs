//! Message types and the category masks applied to incoming traffic.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

use crate::Timestamp;

/// Packed three-byte MIDI payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MidiMessage {
    /// Raw status, data1 and data2 bytes.
    pub data: [u8; 3],
}

impl MidiMessage {
    pub const fn new(status: u8, data1: u8, data2: u8) -> Self {
        Self {
            data: [status, data1, data2],
        }
    }

    /// Note-on on `channel` (0-15).
    pub const fn note_on(channel: u8, note: u8, velocity: u8) -> Self {
        Self::new(0x90 | (channel & 0x0F), note, velocity)
    }

    /// Note-off expressed as a zero-velocity note-on.
    pub const fn note_off(channel: u8, note: u8) -> Self {
        Self::note_on(channel, note, 0)
    }

    pub const fn program_change(channel: u8, program: u8) -> Self {
        Self::new(0xC0 | (channel & 0x0F), program, 0)
    }

    pub const fn control_change(channel: u8, controller: u8, value: u8) -> Self {
        Self::new(0xB0 | (channel & 0x0F), controller, value)
    }

    /// Build a message from up to three leading bytes, zero padding the rest.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let (&status, rest) = bytes.split_first()?;
        Some(Self::new(
            status,
            rest.first().copied().unwrap_or(0),
            rest.get(1).copied().unwrap_or(0),
        ))
    }

    pub const fn status(&self) -> u8 {
        self.data[0]
    }

    pub const fn data1(&self) -> u8 {
        self.data[1]
    }

    pub const fn data2(&self) -> u8 {
        self.data[2]
    }

    /// Bytes to put on the wire, trimmed to the length the status implies.
    ///
    /// Outbound system exclusive is not supported: a `0xF0` message carries
    /// only its status byte, never an unterminated payload.
    pub fn wire_bytes(&self) -> &[u8] {
        &self.data[..wire_len(self.status())]
    }

    /// Bit of this message's category within a [`FilterMask`].
    pub const fn filter_bit(&self) -> u32 {
        filter_bit(self.status())
    }

    /// Channel (0-15) for channel voice messages.
    pub const fn channel(&self) -> Option<u8> {
        let status = self.status();
        if status >= 0x80 && status < 0xF0 {
            Some(status & 0x0F)
        } else {
            None
        }
    }
}

impl fmt::Display for MidiMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:2x} {:2x} {:2x}",
            self.data[0], self.data[1], self.data[2]
        )
    }
}

/// Message paired with a clock timestamp.
///
/// Outbound events carry their intended emission time, inbound events the
/// time of arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MidiEvent {
    pub timestamp: Timestamp,
    pub message: MidiMessage,
}

impl MidiEvent {
    pub const fn new(timestamp: Timestamp, message: MidiMessage) -> Self {
        Self { timestamp, message }
    }
}

const fn filter_bit(status: u8) -> u32 {
    if status >= 0xF0 {
        1 << (status & 0x0F)
    } else if status >= 0x80 {
        1 << (0x10 + (status >> 4))
    } else {
        0
    }
}

fn wire_len(status: u8) -> usize {
    match status {
        0xC0..=0xDF => 2,
        0x80..=0xEF => 3,
        0xF1 | 0xF3 => 2,
        0xF2 => 3,
        _ => 1,
    }
}

/// Set of message categories dropped by the input poller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterMask(u32);

impl FilterMask {
    pub const NONE: Self = Self(0);
    pub const SYSEX: Self = Self(1 << 0x00);
    pub const MTC: Self = Self(1 << 0x01);
    pub const SONG_POSITION: Self = Self(1 << 0x02);
    pub const SONG_SELECT: Self = Self(1 << 0x03);
    pub const TUNE: Self = Self(1 << 0x06);
    pub const CLOCK: Self = Self(1 << 0x08);
    pub const TICK: Self = Self(1 << 0x09);
    pub const PLAY: Self = Self((1 << 0x0A) | (1 << 0x0B) | (1 << 0x0C));
    pub const FD: Self = Self(1 << 0x0D);
    pub const ACTIVE: Self = Self(1 << 0x0E);
    pub const RESET: Self = Self(1 << 0x0F);
    pub const NOTE: Self = Self((1 << 0x18) | (1 << 0x19));
    pub const POLY_AFTERTOUCH: Self = Self(1 << 0x1A);
    pub const CONTROL: Self = Self(1 << 0x1B);
    pub const PROGRAM: Self = Self(1 << 0x1C);
    pub const CHANNEL_AFTERTOUCH: Self = Self(1 << 0x1D);
    pub const PITCHBEND: Self = Self(1 << 0x1E);
    pub const AFTERTOUCH: Self = Self(Self::POLY_AFTERTOUCH.0 | Self::CHANNEL_AFTERTOUCH.0);
    pub const REALTIME: Self = Self(
        Self::ACTIVE.0
            | Self::SYSEX.0
            | Self::CLOCK.0
            | Self::PLAY.0
            | Self::FD.0
            | Self::RESET.0
            | Self::TICK.0,
    );
    pub const SYSTEM_COMMON: Self =
        Self(Self::MTC.0 | Self::SONG_POSITION.0 | Self::SONG_SELECT.0 | Self::TUNE.0);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether `message` belongs to a category in this mask.
    pub const fn blocks(self, message: &MidiMessage) -> bool {
        self.0 & message.filter_bit() != 0
    }
}

impl BitOr for FilterMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for FilterMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Set of channels whose voice messages reach the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelMask(u16);

impl ChannelMask {
    pub const ALL: Self = Self(0xFFFF);

    /// Mask admitting a single channel (0-15).
    pub const fn only(channel: u8) -> Self {
        Self(1 << (channel & 0x0F))
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// System messages always pass; channel messages pass when their channel is set.
    pub const fn allows(self, message: &MidiMessage) -> bool {
        match message.channel() {
            Some(channel) => self.0 & (1 << channel) != 0,
            None => true,
        }
    }
}

impl Default for ChannelMask {
    fn default() -> Self {
        Self::ALL
    }
}

impl BitOr for ChannelMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}
