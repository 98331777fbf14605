//! Time tags and their wire formats for the TTM8000 family of time taggers

pub mod bit;
pub mod codec;
pub mod de;
pub mod error;
pub mod ser;
pub mod wire;

pub use error::{Error, Result};
pub use wire::{Format, Packet, Payload};

use serde::{Deserialize, Serialize};

/// The basic representation of a tagged event
///
/// Ordering compares `time` first, so sorting a slice of tags sorts it
/// chronologically with ties broken by channel.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct Tag {
    /// Counter in ticks from the start of the measurement
    pub time: u64,
    /// Logical channel (0-15) for single-board data, or source id
    /// (`board << 4 | channel`) for multi-board data
    pub channel: u8,
}

impl Tag {
    pub fn new(time: u64, channel: u8) -> Self {
        Tag { time, channel }
    }
}

/// Tick frequency of the instrument: 12.15 GHz
pub const TICKS_PER_SECOND: u64 = 12_150_000_000;
pub const TICKS_PER_MS: u64 = 12_150_000;
/// One tick in picoseconds
pub const TICK_PS: f64 = 82.304_526_748;

/// Sentinel for a high-word carry that has not seen a high word yet
pub const TIME_HIGH_UNDEFINED: u64 = 1 << 60;

/// Number of logical channels of one board: 8 inputs, rising and falling
pub const CHANNELS: usize = 16;
/// Number of boards a multi-board stream may address
pub const BOARDS: usize = 16;
/// Number of distinct source ids in multi-board data
pub const SOURCES: usize = 256;

/// Combine a board and its logical channel into a source id
#[inline]
pub fn source_id(board: u8, channel: u8) -> u8 {
    return (board & 0x0F) << 4 | (channel & 0x0F);
}

#[inline]
pub fn board_of(source: u8) -> u8 {
    return source >> 4;
}

#[inline]
pub fn channel_of(source: u8) -> u8 {
    return source & 0x0F;
}

/// Physical input (0-7) behind a logical channel
#[inline]
pub fn input_of(channel: u8) -> u8 {
    return channel & 0x07;
}

/// Logical channels 8-15 are the falling edges of inputs 0-7
#[inline]
pub fn is_falling(channel: u8) -> bool {
    return channel & 0x08 != 0;
}

/// Convert a duration in picoseconds to whole ticks, rounding to nearest
pub fn ps_to_ticks(ps: u64) -> u64 {
    return (ps as f64 / TICK_PS).round() as u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_ids() {
        assert_eq!(source_id(0, 0), 0);
        assert_eq!(source_id(1, 3), 0x13);
        assert_eq!(source_id(15, 15), 0xFF);
        for id in 0..=255u8 {
            assert_eq!(source_id(board_of(id), channel_of(id)), id);
        }
    }

    #[test]
    fn edges() {
        assert!(!is_falling(7));
        assert!(is_falling(8));
        assert_eq!(input_of(8), 0);
        assert_eq!(input_of(15), 7);
    }

    #[test]
    fn tag_order_is_chronological() {
        let mut tags = vec![Tag::new(5, 0), Tag::new(1, 9), Tag::new(5, 2), Tag::new(3, 1)];
        tags.sort();
        assert_eq!(
            tags,
            vec![Tag::new(1, 9), Tag::new(3, 1), Tag::new(5, 0), Tag::new(5, 2)]
        );
    }

    #[test]
    fn picoseconds() {
        assert_eq!(ps_to_ticks(0), 0);
        assert_eq!(ps_to_ticks(823), 10);
        assert_eq!(ps_to_ticks(1_000_000_000), TICKS_PER_MS);
    }
}
