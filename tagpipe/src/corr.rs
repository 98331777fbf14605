//! Correlation counting: singles, channel pairs and multi-channel patterns
//!
//! Each event is first moved by its channel's delay. Since delays reorder the
//! stream, shifted events wait in a queue until every event that could still
//! precede them has arrived; that is, until they are older than the newest
//! raw timestamp plus the smallest delay. They are then counted in shifted
//! order.
//!
//! When an event on channel `b` is counted, every other channel whose most
//! recent event lies within the coincidence window before it is present. Each
//! present channel `a` adds one to the pair counts `[a][b]` and `[b][a]`, and
//! every configured pattern that contains `b` and only present channels adds
//! one. A pattern therefore counts each time a new event completes it again.

use crate::count::Counts;
use crate::slot::{self, SlotClock};
use crate::sort::SortBuffer;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tagwire::{Error, Result, Tag, CHANNELS, TICK_PS};
#[allow(unused_imports)]
use tracing::{debug, info, trace};

pub type PairCounts = [[u64; CHANNELS]; CHANNELS];

/// Most patterns one counter accepts
pub const MAX_PATTERNS: usize = 256;
const MEMO_LIMIT: usize = 4096;

/// Coincidence window in ticks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Window {
    /// Events are coincident when at most this far apart
    Global(u32),
    /// Total width per channel, half before and half after the event; two
    /// events coincide when their windows overlap
    PerChannel([u32; CHANNELS]),
}

impl Window {
    #[inline]
    pub fn pair(&self, a: usize, b: usize) -> u64 {
        match self {
            Window::Global(w) => *w as u64,
            Window::PerChannel(w) => (w[a] / 2) as u64 + (w[b] / 2) as u64,
        }
    }
}

/// Every counter of a correlation counter at one instant
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub singles: Counts,
    pub pairs: PairCounts,
    pub patterns: Vec<u64>,
}

impl Snapshot {
    fn zeroed(patterns: usize) -> Self {
        Snapshot {
            singles: [0; CHANNELS],
            pairs: [[0; CHANNELS]; CHANNELS],
            patterns: vec![0; patterns],
        }
    }
}

/// With per-channel windows, presence relative to the new event is not
/// enough: every pair inside the pattern must overlap too.
fn pattern_spans_fit(pattern: u16, last: &[Option<u64>; CHANNELS], window: &Window) -> bool {
    if let Window::Global(_) = window {
        return true;
    }
    let chans = tagwire::bit::mask_to_chans(pattern);
    for (i, &x) in chans.iter().enumerate() {
        for &y in &chans[i + 1..] {
            let (tx, ty) = match (last[x as usize], last[y as usize]) {
                (Some(tx), Some(ty)) => (tx, ty),
                _ => return false,
            };
            if tx.abs_diff(ty) > window.pair(x as usize, y as usize) {
                return false;
            }
        }
    }
    return true;
}

#[derive(Debug)]
pub struct CorrelationCounter {
    delays: [i32; CHANNELS],
    min_delay: i64,
    window: Window,
    enabled: bool,
    patterns: Vec<u16>,
    counts: Snapshot,
    clock: SlotClock<Snapshot>,
    queue: SortBuffer,
    latest_raw: Option<u64>,
    last: [Option<u64>; CHANNELS],
    // Patterns matched by an event on a channel given the present mask
    memo: HashMap<(u8, u16), Vec<usize>>,
}

impl CorrelationCounter {
    /// Counts singles only until correlations are configured
    pub fn new(slot_ms: u32) -> Self {
        CorrelationCounter {
            delays: [0; CHANNELS],
            min_delay: 0,
            window: Window::Global(0),
            enabled: false,
            patterns: Vec::new(),
            counts: Snapshot::zeroed(0),
            clock: SlotClock::new(slot_ms),
            queue: SortBuffer::new(0),
            latest_raw: None,
            last: [None; CHANNELS],
            memo: HashMap::new(),
        }
    }

    /// Zero every counter and start a new time base. Events still waiting
    /// in the queue are discarded.
    pub fn reset(&mut self, slot_ms: u32) {
        if self.queue.pending() > 0 {
            debug!(pending = self.queue.pending(), "queued events discarded by reset");
        }
        self.counts = Snapshot::zeroed(self.patterns.len());
        self.clock.reset(slot_ms);
        self.queue = SortBuffer::new(0);
        self.latest_raw = None;
        self.last = [None; CHANNELS];
    }

    /// Set per-channel delays and the coincidence window, in ticks. Each
    /// delay is added to its channel's timestamps as given; results below
    /// zero clamp to zero. The queue must be empty.
    pub fn configure_timing(&mut self, delays: &[i32; CHANNELS], window: Window) -> Result<()> {
        if self.queue.pending() > 0 {
            return Err(Error::bad_parameter("flush the queue before changing timing"));
        }
        self.delays = *delays;
        self.min_delay = delays.iter().copied().min().unwrap_or(0) as i64;
        self.window = window;
        self.last = [None; CHANNELS];
        info!(?window, "correlation timing configured");
        Ok(())
    }

    /// [`configure_timing`](Self::configure_timing) with picosecond values
    /// and a global window
    pub fn configure_timing_ps(&mut self, delays_ps: &[i64; CHANNELS], window_ps: u64) -> Result<()> {
        let mut delays = [0i32; CHANNELS];
        for (d, &ps) in delays.iter_mut().zip(delays_ps.iter()) {
            let ticks = (ps as f64 / TICK_PS).round();
            if ticks.abs() > i32::MAX as f64 {
                return Err(Error::bad_parameter(format!("delay of {} ps out of range", ps)));
            }
            *d = ticks as i32;
        }
        let window = tagwire::ps_to_ticks(window_ps).min(u32::MAX as u64) as u32;
        return self.configure_timing(&delays, Window::Global(window));
    }

    /// Turn correlation counting on or off and set the patterns to count.
    /// Restarts every counter; the queue must be empty.
    pub fn configure_correlations(&mut self, enable: bool, patterns: &[u16]) -> Result<()> {
        if patterns.len() > MAX_PATTERNS {
            return Err(Error::bad_parameter(format!(
                "{} patterns given, at most {} supported",
                patterns.len(),
                MAX_PATTERNS
            )));
        }
        if patterns.iter().any(|&p| p == 0) {
            return Err(Error::bad_parameter("empty pattern mask"));
        }
        if self.queue.pending() > 0 {
            return Err(Error::bad_parameter("flush the queue before changing correlations"));
        }
        self.enabled = enable;
        self.patterns = patterns.to_vec();
        self.memo.clear();
        self.reset(self.clock.slot_ms());
        Ok(())
    }

    /// Count a sorted batch. With correlations off, events count as singles
    /// right away; otherwise they wait for the queue watermark.
    pub fn process(&mut self, batch: &[Tag]) {
        for tag in batch {
            let c = tag.channel as usize;
            if c >= CHANNELS {
                continue;
            }
            if !self.enabled {
                self.clock.advance(tag.time, &self.counts);
                self.counts.singles[c] += 1;
                continue;
            }
            self.latest_raw = self.latest_raw.max(Some(tag.time));
            self.queue.push(Tag {
                time: tag.time.saturating_add_signed(self.delays[c] as i64),
                channel: tag.channel,
            });
        }
        // No later event can land before the newest raw time plus the smallest delay
        let watermark = self.latest_raw.map(|t| t.saturating_add_signed(self.min_delay));
        if let Some(w) = watermark.filter(|&w| w > 0) {
            for tag in self.queue.release_until(w - 1) {
                self.count(tag);
            }
        }
    }

    /// Count everything still queued. Call at the end of the stream.
    pub fn flush_queue(&mut self) {
        let rest = self.queue.flush();
        trace!(n = rest.len(), "correlation queue flushed");
        for tag in rest {
            self.count(tag);
        }
    }

    fn count(&mut self, tag: Tag) {
        let b = tag.channel as usize;
        let s = tag.time;
        self.clock.advance(s, &self.counts);
        self.counts.singles[b] += 1;

        let mut present: u16 = 1 << b;
        for a in (0..CHANNELS).filter(|&a| a != b) {
            if let Some(ta) = self.last[a] {
                if s.saturating_sub(ta) <= self.window.pair(a, b) {
                    present |= 1 << a;
                    self.counts.pairs[a][b] += 1;
                    self.counts.pairs[b][a] += 1;
                }
            }
        }
        self.last[b] = Some(s);
        if self.patterns.is_empty() {
            return;
        }

        if self.memo.len() >= MEMO_LIMIT {
            self.memo.clear();
        }
        let patterns = &self.patterns;
        let matched = self.memo.entry((b as u8, present)).or_insert_with(|| {
            patterns
                .iter()
                .enumerate()
                .filter(|&(_, &p)| p & (1 << b) != 0 && p & !present == 0)
                .map(|(i, _)| i)
                .collect()
        });
        for &i in matched.iter() {
            if pattern_spans_fit(self.patterns[i], &self.last, &self.window) {
                self.counts.patterns[i] += 1;
            }
        }
    }

    /// Close the current slot on the manual time base
    pub fn force_new_slot(&mut self) -> Result<u64> {
        return self.clock.force(&self.counts);
    }

    pub fn singles(&self) -> Counts {
        return self.counts.singles;
    }

    /// Symmetric pair counts; the diagonal stays zero
    pub fn pairs(&self) -> PairCounts {
        return self.counts.pairs;
    }

    /// One count per configured pattern, in configuration order
    pub fn patterns(&self) -> &[u64] {
        return &self.counts.patterns;
    }

    pub fn pattern_masks(&self) -> &[u16] {
        return &self.patterns;
    }

    pub fn dated(&self, slot: u64) -> Result<&Snapshot> {
        return self.clock.history().get(slot);
    }

    pub fn dated_singles(&self, slot: u64) -> Result<Counts> {
        return Ok(self.dated(slot)?.singles);
    }

    pub fn dated_pairs(&self, slot: u64) -> Result<PairCounts> {
        return Ok(self.dated(slot)?.pairs);
    }

    pub fn dated_patterns(&self, slot: u64) -> Result<Vec<u64>> {
        return Ok(self.dated(slot)?.patterns.clone());
    }

    pub fn singles_frequency(&self, slots_per_second: u32, avg_slots: u32) -> Result<[u32; CHANNELS]> {
        let rates = slot::frequency(self.clock.history(), slots_per_second, avg_slots, |s| {
            s.singles.to_vec()
        })?;
        let mut out = [0u32; CHANNELS];
        for (o, r) in out.iter_mut().zip(rates) {
            *o = r;
        }
        return Ok(out);
    }

    pub fn pairs_frequency(&self, slots_per_second: u32, avg_slots: u32) -> Result<[[u32; CHANNELS]; CHANNELS]> {
        let rates = slot::frequency(self.clock.history(), slots_per_second, avg_slots, |s| {
            s.pairs.iter().flatten().copied().collect()
        })?;
        let mut out = [[0u32; CHANNELS]; CHANNELS];
        for (o, r) in out.iter_mut().flatten().zip(rates) {
            *o = r;
        }
        return Ok(out);
    }

    pub fn patterns_frequency(&self, slots_per_second: u32, avg_slots: u32) -> Result<Vec<u32>> {
        return slot::frequency(self.clock.history(), slots_per_second, avg_slots, |s| {
            s.patterns.clone()
        });
    }

    pub fn slot_count(&self) -> u64 {
        return self.clock.slot_count();
    }

    /// Latest timestamp counted, delay included, 0 on the manual time base
    pub fn current_time(&self) -> u64 {
        return self.clock.current_time();
    }

    /// Events waiting in the queue
    pub fn pending(&self) -> usize {
        return self.queue.pending();
    }

    pub fn notify_new_slots(&mut self, tx: flume::Sender<u64>) {
        self.clock.subscribe(tx);
    }
}
