//! Group a merged stream into coincidence windows
//!
//! A window opens at an event and takes in every following event no more
//! than `window` ticks after it. When the next event falls outside, the
//! window closes and is kept only if it holds between `min_count` and
//! `max_count` events.

use itertools::Itertools;
use std::collections::VecDeque;
use tagwire::bit::source_enabled;
use tagwire::{Error, Result, Tag, BOARDS};
#[allow(unused_imports)]
use tracing::{debug, trace};

pub const DEFAULT_MAX_COUNT: usize = 128;
pub const DEFAULT_WINDOW: u64 = 61;

#[derive(Debug)]
pub struct CoincidenceGroup {
    min_count: usize,
    max_count: usize,
    window: u64,
    masks: [u8; BOARDS],
    open: Vec<Tag>,
    ready: VecDeque<Vec<Tag>>,
    rejected: u64,
}

impl CoincidenceGroup {
    pub fn new(min_count: usize) -> Result<Self> {
        let mut g = CoincidenceGroup {
            min_count: 1,
            max_count: DEFAULT_MAX_COUNT,
            window: DEFAULT_WINDOW,
            masks: [0xFF; BOARDS],
            open: Vec::new(),
            ready: VecDeque::new(),
            rejected: 0,
        };
        g.set_counts(min_count, DEFAULT_MAX_COUNT)?;
        return Ok(g);
    }

    pub fn set_counts(&mut self, min_count: usize, max_count: usize) -> Result<()> {
        if min_count == 0 || min_count > max_count {
            return Err(Error::bad_parameter(format!(
                "need 1 <= min_count <= max_count, got {} and {}",
                min_count, max_count
            )));
        }
        self.min_count = min_count;
        self.max_count = max_count;
        Ok(())
    }

    /// Window length in ticks, inclusive
    pub fn set_window(&mut self, ticks: u64) {
        self.window = ticks;
    }

    /// One byte per board, bit `i` admits both edges of input `i`
    pub fn set_channel_masks(&mut self, masks: [u8; BOARDS]) {
        self.masks = masks;
    }

    fn close(&mut self) {
        let n = self.open.len();
        if n == 0 {
            return;
        }
        if n >= self.min_count && n <= self.max_count {
            self.ready.push_back(std::mem::take(&mut self.open));
        } else {
            trace!(n, "coincidence window rejected");
            self.rejected += 1;
            self.open.clear();
        }
    }

    /// Add sorted events labeled with source ids
    pub fn add(&mut self, tags: &[Tag]) {
        let masks = self.masks;
        let mut events = tags
            .iter()
            .filter(|t| source_enabled(&masks, t.channel))
            .peekable();
        while let Some(&&next) = events.peek() {
            let t0 = match self.open.first() {
                Some(first) => first.time,
                None => next.time,
            };
            let wnd = self.window;
            self.open.extend(events.peeking_take_while(|t| t.time.saturating_sub(t0) <= wnd));
            if events.peek().is_some() {
                self.close();
            }
        }
    }

    /// End of stream: close the open window
    pub fn flush(&mut self) {
        self.close();
    }

    /// Accepted groups waiting to be taken
    pub fn available(&self) -> usize {
        return self.ready.len();
    }

    pub fn get_group(&mut self) -> Option<Vec<Tag>> {
        return self.ready.pop_front();
    }

    /// Windows closed with too few or too many events
    pub fn rejected(&self) -> u64 {
        return self.rejected;
    }
}
