//! Solitary event filter: keep only events with a neighbor on a configured
//! channel
//!
//! Events A (channel `a`) and B (channel `b`) are neighbors iff
//! `t_A < t_B` and `t_B - t_A <= delta[a][b]`. The bound is inclusive, equal
//! timestamps never pair, and the matrix need not be symmetric. An event is kept iff it has at least one
//! neighbor before or after it.
//!
//! Input must be sorted. Every event waits in a queue until no later event
//! could still become its neighbor, then leaves in input order. Events on
//! channels outside 0-15 never have neighbors.

use crate::Stage;
use std::collections::VecDeque;
use tagwire::{Error, Result, Tag, CHANNELS};
#[allow(unused_imports)]
use tracing::{debug, trace};

/// Per channel pair maximum delta in ticks, `None` where the pair never
/// counts as neighbors. Indexed `[earlier][later]`.
pub type DeltaMatrix = [[Option<u32>; CHANNELS]; CHANNELS];

#[derive(Clone, Copy, Debug)]
struct Pending {
    tag: Tag,
    neighbored: bool,
}

#[derive(Debug)]
pub struct SoloFilter {
    matrix: DeltaMatrix,
    // Longest window in which a channel can still gain a later neighbor
    forward: [Option<u64>; CHANNELS],
    // Longest window in which a channel can find an earlier neighbor
    backward: [Option<u64>; CHANNELS],
    deep: bool,
    queue: VecDeque<Pending>,
    // Stream index of the queue front
    base: u64,
    // Stream index of the latest event per channel
    last: [Option<u64>; CHANNELS],
    now: u64,
    dropped: u64,
}

impl SoloFilter {
    /// Every pair of channels, a channel with itself included, are neighbors
    /// within `ticks`. Uses the deep search.
    pub fn with_max_delta(ticks: u32) -> Self {
        return SoloFilter::with_channel_deltas([[Some(ticks); CHANNELS]; CHANNELS], true);
    }

    /// Full matrix. `deep` scans the whole retained history instead of only
    /// the latest event of each channel; the shallow search is exact only
    /// when no event has two qualifying neighbors on one channel.
    pub fn with_channel_deltas(matrix: DeltaMatrix, deep: bool) -> Self {
        let mut f = SoloFilter {
            matrix,
            forward: [None; CHANNELS],
            backward: [None; CHANNELS],
            deep,
            queue: VecDeque::new(),
            base: 0,
            last: [None; CHANNELS],
            now: 0,
            dropped: 0,
        };
        f.update_windows();
        return f;
    }

    fn update_windows(&mut self) {
        self.forward = [None; CHANNELS];
        self.backward = [None; CHANNELS];
        for a in 0..CHANNELS {
            for b in 0..CHANNELS {
                if let Some(w) = self.matrix[a][b] {
                    let w = Some(w as u64);
                    self.forward[a] = self.forward[a].max(w);
                    self.backward[b] = self.backward[b].max(w);
                }
            }
        }
    }

    /// Change one entry of the matrix
    pub fn set_max_delta(&mut self, earlier: u8, later: u8, ticks: Option<u32>) -> Result<()> {
        if earlier as usize >= CHANNELS || later as usize >= CHANNELS {
            return Err(Error::bad_parameter(format!(
                "channel pair ({}, {}) out of range",
                earlier, later
            )));
        }
        self.matrix[earlier as usize][later as usize] = ticks;
        self.update_windows();
        Ok(())
    }

    pub fn set_deep_search(&mut self, deep: bool) {
        self.deep = deep;
    }

    #[inline]
    fn window(&self, a: u8, b: u8) -> Option<u64> {
        if a as usize >= CHANNELS || b as usize >= CHANNELS {
            return None;
        }
        return self.matrix[a as usize][b as usize].map(|w| w as u64);
    }

    /// Pop every event that can no longer gain a neighbor
    fn resolve(&mut self, out: &mut Vec<Tag>) {
        while let Some(front) = self.queue.front() {
            let c = front.tag.channel as usize;
            let fwd = if c < CHANNELS { self.forward[c] } else { None };
            if let Some(f) = fwd {
                if self.now.saturating_sub(front.tag.time) <= f {
                    break;
                }
            }
            if front.neighbored {
                out.push(front.tag);
            } else {
                self.dropped += 1;
            }
            self.queue.pop_front();
            self.base += 1;
        }
    }

    /// Mark the queued events that neighbor `tag`; true if any do
    fn match_earlier(&mut self, tag: Tag) -> bool {
        let b = tag.channel as usize;
        if b >= CHANNELS {
            return false;
        }
        let reach = match self.backward[b] {
            Some(r) => r,
            None => return false,
        };
        let mut found = false;
        if self.deep {
            for i in (0..self.queue.len()).rev() {
                let prev = self.queue[i].tag;
                if prev.time >= tag.time {
                    continue;
                }
                let dt = tag.time - prev.time;
                if dt > reach {
                    break;
                }
                if self.window(prev.channel, tag.channel).map_or(false, |w| dt <= w) {
                    self.queue[i].neighbored = true;
                    found = true;
                }
            }
        } else {
            for a in 0..CHANNELS {
                let w = match self.matrix[a][b] {
                    Some(w) => w as u64,
                    None => continue,
                };
                let idx = match self.last[a] {
                    Some(i) if i >= self.base => (i - self.base) as usize,
                    _ => continue,
                };
                let prev = self.queue[idx].tag.time;
                if prev < tag.time && tag.time - prev <= w {
                    self.queue[idx].neighbored = true;
                    found = true;
                }
            }
        }
        return found;
    }

    /// Pass a sorted batch; returns the events whose fate is now known to be
    /// "kept", in input order
    pub fn filter(&mut self, batch: &[Tag]) -> Vec<Tag> {
        let mut out = Vec::with_capacity(batch.len());
        for &tag in batch {
            self.now = self.now.max(tag.time);
            self.resolve(&mut out);
            let neighbored = self.match_earlier(tag);
            if (tag.channel as usize) < CHANNELS {
                self.last[tag.channel as usize] = Some(self.base + self.queue.len() as u64);
            }
            self.queue.push_back(Pending { tag, neighbored });
        }
        self.resolve(&mut out);
        return out;
    }

    /// End of stream: keep queued events that already have a neighbor and
    /// discard the rest
    pub fn flush(&mut self) -> Vec<Tag> {
        let mut out = Vec::with_capacity(self.queue.len());
        for p in self.queue.drain(..) {
            if p.neighbored {
                out.push(p.tag);
            } else {
                self.dropped += 1;
            }
            self.base += 1;
        }
        debug!(kept = out.len(), dropped = self.dropped, "solitary filter flushed");
        return out;
    }

    /// Events waiting for their fate to be decided
    pub fn pending(&self) -> usize {
        return self.queue.len();
    }

    /// Events discarded as solitary so far
    pub fn dropped(&self) -> u64 {
        return self.dropped;
    }
}

impl Stage for SoloFilter {
    fn process(&mut self, batch: &[Tag]) -> Vec<Tag> {
        return self.filter(batch);
    }

    fn flush(&mut self) -> Vec<Tag> {
        return SoloFilter::flush(self);
    }
}
