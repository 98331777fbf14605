//! Dead-time filter: drop events that follow too closely on their channel

use crate::Stage;
use tagwire::{Error, Result, Tag, CHANNELS};
#[allow(unused_imports)]
use tracing::{debug, trace};

/// Keep an event iff its channel has no previous accepted event, or the
/// event is more than `dead[c]` ticks after it. With `extend`, rejected
/// events also restart the dead time.
///
/// `last` is the per-channel state carried across batches. Events on
/// channels beyond the end of `last` or `dead` pass unfiltered. An event
/// older than its channel's last timestamp counts as inside the dead time.
pub fn debounce(batch: &[Tag], last: &mut [Option<u64>], dead: &[u64], extend: bool) -> Vec<Tag> {
    let mut out = Vec::with_capacity(batch.len());
    for &tag in batch {
        let c = tag.channel as usize;
        if c >= last.len() || c >= dead.len() {
            out.push(tag);
            continue;
        }
        let accept = match last[c] {
            None => true,
            Some(prev) => tag.time > prev && tag.time - prev > dead[c],
        };
        if accept {
            last[c] = Some(tag.time);
            out.push(tag);
        } else if extend {
            last[c] = last[c].max(Some(tag.time));
        }
    }
    return out;
}

/// Stateful dead-time filter over a fixed number of channels
#[derive(Debug)]
pub struct DeadTimeFilter {
    dead: Vec<u64>,
    last: Vec<Option<u64>>,
    extend: bool,
    discarded: u64,
}

impl DeadTimeFilter {
    /// Same dead time on all 16 channels of one board
    pub fn new(dead_ticks: u64) -> Self {
        return DeadTimeFilter::per_channel(vec![dead_ticks; CHANNELS]);
    }

    /// One dead time per channel; the channel count is the vector length
    pub fn per_channel(dead: Vec<u64>) -> Self {
        let n = dead.len();
        DeadTimeFilter {
            dead,
            last: vec![None; n],
            extend: false,
            discarded: 0,
        }
    }

    /// Rejected events restart the dead time
    pub fn with_retrigger(mut self, extend: bool) -> Self {
        self.extend = extend;
        self
    }

    pub fn set_dead_time(&mut self, channel: u8, ticks: u64) -> Result<()> {
        let slot = self.dead.get_mut(channel as usize).ok_or_else(|| {
            Error::bad_parameter(format!("dead time for channel {} out of range", channel))
        })?;
        *slot = ticks;
        Ok(())
    }

    pub fn dead_time(&self, channel: u8) -> Option<u64> {
        return self.dead.get(channel as usize).copied();
    }

    pub fn debounce(&mut self, batch: &[Tag]) -> Vec<Tag> {
        let out = debounce(batch, &mut self.last, &self.dead, self.extend);
        let dropped = (batch.len() - out.len()) as u64;
        if dropped > 0 {
            trace!(dropped, "dead time");
        }
        self.discarded += dropped;
        return out;
    }

    /// Events rejected since construction
    pub fn discarded(&self) -> u64 {
        return self.discarded;
    }

    /// Forget the last timestamp of every channel
    pub fn reset(&mut self) {
        self.last.iter_mut().for_each(|l| *l = None);
    }
}

impl Stage for DeadTimeFilter {
    fn process(&mut self, batch: &[Tag]) -> Vec<Tag> {
        return self.debounce(batch);
    }

    fn flush(&mut self) -> Vec<Tag> {
        return Vec::new();
    }
}
