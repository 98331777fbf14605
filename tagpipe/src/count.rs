//! Per-channel event counting with slot history

use crate::slot::{self, SlotClock};
use tagwire::{Result, Tag, CHANNELS};
#[allow(unused_imports)]
use tracing::{debug, info};

pub type Counts = [u64; CHANNELS];

/// Cumulative event counts of the 16 channels of one board
///
/// Counts never reset on their own; slot history is recorded as described in
/// [`slot`](crate::slot). Events on channels beyond 15 are ignored.
#[derive(Debug)]
pub struct EventCounter {
    counts: Counts,
    clock: SlotClock<Counts>,
}

impl EventCounter {
    /// `slot_ms` of zero selects the manual time base
    pub fn new(slot_ms: u32) -> Self {
        EventCounter {
            counts: [0; CHANNELS],
            clock: SlotClock::new(slot_ms),
        }
    }

    /// Zero all counters, drop the history and start a new time base
    pub fn reset(&mut self, slot_ms: u32) {
        debug!(slot_ms, "event counter reset");
        self.counts = [0; CHANNELS];
        self.clock.reset(slot_ms);
    }

    pub fn process(&mut self, batch: &[Tag]) {
        for tag in batch {
            let c = tag.channel as usize;
            if c >= CHANNELS {
                continue;
            }
            self.clock.advance(tag.time, &self.counts);
            self.counts[c] += 1;
        }
    }

    /// Close the current slot on the manual time base, returning its index
    pub fn force_new_slot(&mut self) -> Result<u64> {
        return self.clock.force(&self.counts);
    }

    pub fn counter(&self) -> Counts {
        return self.counts;
    }

    /// Counts as they stood at the end of `slot`
    pub fn dated_counter(&self, slot: u64) -> Result<Counts> {
        return self.clock.history().get(slot).copied();
    }

    /// Per-channel event rate in Hz, averaged over the last `avg_slots` slots
    pub fn frequency(&self, slots_per_second: u32, avg_slots: u32) -> Result<[u32; CHANNELS]> {
        let rates = slot::frequency(self.clock.history(), slots_per_second, avg_slots, |c| c.to_vec())?;
        let mut out = [0u32; CHANNELS];
        for (o, r) in out.iter_mut().zip(rates) {
            *o = r;
        }
        return Ok(out);
    }

    pub fn slot_count(&self) -> u64 {
        return self.clock.slot_count();
    }

    /// Latest timestamp processed, 0 on the manual time base
    pub fn current_time(&self) -> u64 {
        return self.clock.current_time();
    }

    /// Receive the index of every slot as it closes
    pub fn notify_new_slots(&mut self, tx: flume::Sender<u64>) {
        self.clock.subscribe(tx);
    }
}
