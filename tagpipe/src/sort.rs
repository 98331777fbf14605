//! Sort buffer: restore chronological order to a stream whose disorder is
//! bounded by `max_shuffle` ticks
//!
//! Events are held until the newest timestamp seen is at least `max_shuffle`
//! ticks ahead of them, then released in ascending order. Equal timestamps
//! keep their arrival order. An event arriving more than `max_shuffle` late
//! cannot be placed correctly; it is released with the next batch and counted
//! in [`SortBuffer::late_events`].

use crate::Stage;
use std::collections::BTreeMap;
use tagwire::Tag;
#[allow(unused_imports)]
use tracing::{debug, warn};

#[derive(Debug)]
pub struct SortBuffer {
    max_shuffle: u64,
    // Keyed by (time, arrival) so equal times drain in arrival order
    pending: BTreeMap<(u64, u64), Tag>,
    arrival: u64,
    latest: Option<u64>,
    last_emitted: Option<u64>,
    late: u64,
}

impl SortBuffer {
    pub fn new(max_shuffle_ticks: u64) -> Self {
        SortBuffer {
            max_shuffle: max_shuffle_ticks,
            pending: BTreeMap::new(),
            arrival: 0,
            latest: None,
            last_emitted: None,
            late: 0,
        }
    }

    pub fn max_shuffle(&self) -> u64 {
        return self.max_shuffle;
    }

    /// Buffer one event without releasing anything
    pub fn push(&mut self, tag: Tag) {
        if self.last_emitted.map_or(false, |e| tag.time < e) {
            self.late += 1;
            warn!(time = tag.time, channel = tag.channel, "event arrived after its slot was released");
        }
        self.latest = self.latest.max(Some(tag.time));
        self.pending.insert((tag.time, self.arrival), tag);
        self.arrival += 1;
    }

    /// Release every buffered event at or before `watermark`, oldest first
    pub fn release_until(&mut self, watermark: u64) -> Vec<Tag> {
        let rest = self.pending.split_off(&(watermark, u64::MAX));
        let ready = std::mem::replace(&mut self.pending, rest);
        let out: Vec<Tag> = ready.into_values().collect();
        if let Some(t) = out.last() {
            self.last_emitted = self.last_emitted.max(Some(t.time));
        }
        return out;
    }

    /// Merge a batch and release what the watermark allows
    pub fn insert(&mut self, batch: &[Tag]) -> Vec<Tag> {
        for &tag in batch {
            self.push(tag);
        }
        match self.latest {
            Some(latest) => self.release_until(latest.saturating_sub(self.max_shuffle)),
            None => Vec::new(),
        }
    }

    /// Release everything, ignoring the watermark
    pub fn flush(&mut self) -> Vec<Tag> {
        let n = self.pending.len();
        let out = self.release_until(u64::MAX);
        debug!(n, "sort buffer flushed");
        return out;
    }

    /// Events buffered and not yet released
    pub fn pending(&self) -> usize {
        return self.pending.len();
    }

    pub fn latest_seen(&self) -> Option<u64> {
        return self.latest;
    }

    /// Events that arrived older than something already released
    pub fn late_events(&self) -> u64 {
        return self.late;
    }
}

impl Stage for SortBuffer {
    fn process(&mut self, batch: &[Tag]) -> Vec<Tag> {
        return self.insert(batch);
    }

    fn flush(&mut self) -> Vec<Tag> {
        return SortBuffer::flush(self);
    }
}
