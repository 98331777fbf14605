//! Merge the streams of several boards into one sorted stream
//!
//! Each board's events pass its channel mask and dead time, get their
//! calibration offset, and enter one shared sort buffer keyed by source id.
//! Events leave once every live board has sent something later, so a board
//! that falls behind holds the merged stream back until it has been silent
//! for the idle timeout.

use crate::deadtime::DeadTimeFilter;
use crate::sort::SortBuffer;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tagwire::bit::source_enabled;
use tagwire::{board_of, codec, source_id, Error, Packet, Result, Tag, BOARDS, SOURCES, TIME_HIGH_UNDEFINED};
#[allow(unused_imports)]
use tracing::{debug, info, warn};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(20);

/// Dead time of every source id, or one per source id
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeadTime {
    Global(u64),
    PerChannel(Vec<u64>),
}

#[derive(Clone, Copy, Debug)]
struct Board {
    latest: u64,
    last_seen: Instant,
}

#[derive(Debug)]
pub struct MultiMerge {
    masks: [u8; BOARDS],
    offsets: [i32; SOURCES],
    min_offset: i64,
    dead: DeadTimeFilter,
    sorter: SortBuffer,
    boards: [Option<Board>; BOARDS],
    carries: [u64; BOARDS],
    idle_timeout: Duration,
    ready: VecDeque<Tag>,
    masked: u64,
}

impl MultiMerge {
    /// All channels enabled, no offsets, no dead time
    pub fn new() -> Self {
        MultiMerge {
            masks: [0xFF; BOARDS],
            offsets: [0; SOURCES],
            min_offset: 0,
            dead: DeadTimeFilter::per_channel(vec![0; SOURCES]),
            sorter: SortBuffer::new(0),
            boards: [None; BOARDS],
            carries: [TIME_HIGH_UNDEFINED; BOARDS],
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            ready: VecDeque::new(),
            masked: 0,
        }
    }

    /// One byte per board, bit `i` enables both edges of input `i`
    pub fn set_channel_masks(&mut self, masks: [u8; BOARDS]) {
        self.masks = masks;
    }

    pub fn set_idle_timeout(&mut self, timeout: Duration) {
        self.idle_timeout = timeout;
    }

    pub fn set_dead_time(&mut self, dead: DeadTime, retrigger: bool) -> Result<()> {
        let ticks = match dead {
            DeadTime::Global(t) => vec![t; SOURCES],
            DeadTime::PerChannel(v) if v.len() == SOURCES => v,
            DeadTime::PerChannel(v) => {
                return Err(Error::bad_parameter(format!(
                    "{} dead times given, need one per source id ({})",
                    v.len(),
                    SOURCES
                )));
            }
        };
        self.dead = DeadTimeFilter::per_channel(ticks).with_retrigger(retrigger);
        Ok(())
    }

    /// Calibration offset of every source id, in ticks, added to each of its
    /// events. Results below zero are clamped to zero. Only allowed while
    /// nothing is buffered, since it moves the merge order.
    pub fn set_channel_offsets(&mut self, offsets: &[i32; SOURCES]) -> Result<()> {
        if self.sorter.pending() > 0 {
            return Err(Error::bad_parameter("flush before changing channel offsets"));
        }
        self.offsets = *offsets;
        self.min_offset = offsets.iter().copied().min().unwrap_or(0) as i64;
        Ok(())
    }

    pub fn set_channel_offset(&mut self, source: u8, ticks: i32) -> Result<()> {
        let mut offsets = self.offsets;
        offsets[source as usize] = ticks;
        return self.set_channel_offsets(&offsets);
    }

    /// Add one packet of any format. Single-board formats are labeled with
    /// the packet's board; packed formats use that board's high-word carry.
    pub fn add_packet(&mut self, packet: &Packet) -> Result<()> {
        return self.add_packet_at(packet, Instant::now());
    }

    fn add_packet_at(&mut self, packet: &Packet, now: Instant) -> Result<()> {
        let board = packet.board as usize;
        if board >= BOARDS {
            return Err(Error::bad_parameter(format!("board {} out of range", board)));
        }
        let mut tags = codec::decode(packet, &mut self.carries[board])?;
        if !packet.format().is_multi() {
            for t in tags.iter_mut() {
                t.channel = source_id(packet.board, t.channel);
            }
        }
        self.add_tags_at(&tags, now);
        Ok(())
    }

    /// Add events labeled with source ids, each board's events in order
    pub fn add_tags(&mut self, tags: &[Tag]) {
        self.add_tags_at(tags, Instant::now());
    }

    fn add_tags_at(&mut self, tags: &[Tag], now: Instant) {
        let before = tags.len();
        let enabled: Vec<Tag> = tags
            .iter()
            .copied()
            .filter(|t| source_enabled(&self.masks, t.channel))
            .collect();
        self.masked += (before - enabled.len()) as u64;

        for tag in self.dead.debounce(&enabled) {
            let b = board_of(tag.channel) as usize;
            let board = self.boards[b].get_or_insert(Board { latest: tag.time, last_seen: now });
            board.latest = board.latest.max(tag.time);
            board.last_seen = now;
            self.sorter.push(Tag {
                time: tag.time.saturating_add_signed(self.offsets[tag.channel as usize] as i64),
                channel: tag.channel,
            });
        }
        self.release(now);
    }

    fn release(&mut self, now: Instant) {
        let timeout = self.idle_timeout;
        let watermark = self
            .boards
            .iter()
            .flatten()
            .filter(|b| now.saturating_duration_since(b.last_seen) < timeout)
            .map(|b| b.latest)
            .min()
            .map(|latest| latest.saturating_add_signed(self.min_offset));
        let out = match watermark {
            Some(0) => return,
            Some(w) => self.sorter.release_until(w - 1),
            // Every board is idle
            None => self.sorter.release_until(u64::MAX),
        };
        self.ready.extend(out);
    }

    /// Re-check idle boards without adding data
    pub fn poll(&mut self) {
        self.release(Instant::now());
    }

    /// End of stream: release everything still buffered
    pub fn flush(&mut self) {
        let rest = self.sorter.flush();
        self.ready.extend(rest);
    }

    /// Merged events ready to be taken
    pub fn available(&self) -> usize {
        return self.ready.len();
    }

    /// Take up to `max` merged events, oldest first. Timestamps include the
    /// calibration offsets.
    pub fn get_sorted(&mut self, max: usize) -> Vec<Tag> {
        let n = max.min(self.ready.len());
        return self.ready.drain(..n).collect();
    }

    /// Events dropped by the channel masks
    pub fn masked(&self) -> u64 {
        return self.masked;
    }

    /// Events dropped by dead time
    pub fn debounced(&self) -> u64 {
        return self.dead.discarded();
    }

    /// Events that arrived after later events had already left
    pub fn late_events(&self) -> u64 {
        return self.sorter.late_events();
    }
}

impl Default for MultiMerge {
    fn default() -> Self {
        MultiMerge::new()
    }
}
