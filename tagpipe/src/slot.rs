//! Time slots and the snapshot history behind the counters
//!
//! A counter's time axis is cut into slots of a fixed length. Whenever an
//! event lands past the end of the current slot, the counter values as they
//! stood before that event are recorded once for every slot boundary crossed,
//! empty slots included. The newest [`HISTORY_DEPTH`] snapshots are kept.
//!
//! Slot boundaries sit at multiples of the slot length, and slot 0 is the one
//! holding the first event seen after construction or reset. A slot length of
//! zero selects the manual time base, where only [`SlotClock::force`] closes a
//! slot.

use itertools::Itertools;
use std::collections::VecDeque;
use tagwire::{Error, Result, TICKS_PER_MS};
#[allow(unused_imports)]
use tracing::{debug, trace};

pub const HISTORY_DEPTH: usize = 250;

/// Ring of the most recent per-slot snapshots, indexed by absolute slot
#[derive(Clone, Debug)]
pub struct SlotHistory<T> {
    ring: VecDeque<T>,
    total: u64,
}

impl<T: Clone> SlotHistory<T> {
    pub fn new() -> Self {
        SlotHistory { ring: VecDeque::with_capacity(HISTORY_DEPTH), total: 0 }
    }

    /// Close `n` slots that all ended with the same values
    pub fn record(&mut self, snapshot: &T, n: u64) {
        self.total += n;
        let keep = n.min(HISTORY_DEPTH as u64);
        for _ in 0..keep {
            if self.ring.len() == HISTORY_DEPTH {
                self.ring.pop_front();
            }
            self.ring.push_back(snapshot.clone());
        }
    }

    /// Number of slots closed so far
    pub fn slot_count(&self) -> u64 {
        return self.total;
    }

    /// Oldest slot still held
    pub fn first_slot(&self) -> u64 {
        return self.total - self.ring.len() as u64;
    }

    pub fn get(&self, slot: u64) -> Result<&T> {
        let first = self.first_slot();
        if slot < first || slot >= self.total {
            return Err(Error::OutOfRange {
                slot: slot as i64,
                first: first as i64,
                last: self.total as i64 - 1,
            });
        }
        return Ok(&self.ring[(slot - first) as usize]);
    }

    pub fn clear(&mut self) {
        self.ring.clear();
        self.total = 0;
    }
}

impl<T: Clone> Default for SlotHistory<T> {
    fn default() -> Self {
        SlotHistory::new()
    }
}

/// Event rate over the last `avg_slots` slots:
/// `(end(sc - 1) - end(sc - 1 - avg)) * slots_per_second / avg`, where the
/// end of slot -1 is all zeros. Rates saturate at `u32::MAX`.
pub fn frequency<T: Clone>(
    history: &SlotHistory<T>,
    slots_per_second: u32,
    avg_slots: u32,
    values: impl Fn(&T) -> Vec<u64>,
) -> Result<Vec<u32>> {
    if avg_slots == 0 {
        return Err(Error::bad_parameter("frequency needs at least one slot to average"));
    }
    let sc = history.slot_count();
    let avg = avg_slots as u64;
    if sc == 0 || avg > sc {
        return Err(Error::OutOfRange {
            slot: sc as i64 - 1 - avg as i64,
            first: history.first_slot() as i64,
            last: sc as i64 - 1,
        });
    }
    let end = values(history.get(sc - 1)?);
    let base = if avg == sc {
        vec![0; end.len()]
    } else {
        values(history.get(sc - 1 - avg)?)
    };
    let rates = end
        .iter()
        .zip_eq(base.iter())
        .map(|(&e, &b)| {
            let r = e.saturating_sub(b) as u128 * slots_per_second as u128 / avg as u128;
            r.min(u32::MAX as u128) as u32
        })
        .collect();
    return Ok(rates);
}

/// Slot time base plus the history it feeds
#[derive(Debug)]
pub struct SlotClock<T> {
    slot_ms: u32,
    slot_ticks: u64,
    slot_end: Option<u64>,
    current_time: u64,
    history: SlotHistory<T>,
    notify: Option<flume::Sender<u64>>,
}

impl<T: Clone> SlotClock<T> {
    pub fn new(slot_ms: u32) -> Self {
        SlotClock {
            slot_ms,
            slot_ticks: slot_ms as u64 * TICKS_PER_MS,
            slot_end: None,
            current_time: 0,
            history: SlotHistory::new(),
            notify: None,
        }
    }

    /// Start over with a new slot length, keeping the subscriber
    pub fn reset(&mut self, slot_ms: u32) {
        let notify = self.notify.take();
        *self = SlotClock::new(slot_ms);
        self.notify = notify;
    }

    pub fn is_manual(&self) -> bool {
        return self.slot_ticks == 0;
    }

    pub fn slot_ms(&self) -> u32 {
        return self.slot_ms;
    }

    /// Send the index of every slot that closes from now on
    pub fn subscribe(&mut self, tx: flume::Sender<u64>) {
        self.notify = Some(tx);
    }

    fn close(&mut self, current: &T, n: u64) {
        let first = self.history.slot_count();
        self.history.record(current, n);
        trace!(first, n, "slots closed");
        if let Some(tx) = &self.notify {
            // Only slots still held in the history are announced
            let skip = n.saturating_sub(HISTORY_DEPTH as u64);
            for slot in first + skip..first + n {
                if tx.try_send(slot).is_err() {
                    debug!(slot, "slot notification not delivered");
                    break;
                }
            }
        }
    }

    /// Move the clock to `t`, closing every slot that ends at or before it.
    /// `current` holds the counter values before the event at `t` counts.
    pub fn advance(&mut self, t: u64, current: &T) {
        if self.is_manual() {
            return;
        }
        self.current_time = self.current_time.max(t);
        match self.slot_end {
            None => {
                self.slot_end = Some((t / self.slot_ticks + 1) * self.slot_ticks);
            }
            Some(end) if t >= end => {
                let n = (t - end) / self.slot_ticks + 1;
                self.slot_end = Some(end + n * self.slot_ticks);
                self.close(current, n);
            }
            Some(_) => {}
        }
    }

    /// Close the current slot by hand. Only the manual time base allows it.
    /// Returns the index of the slot just closed.
    pub fn force(&mut self, current: &T) -> Result<u64> {
        if !self.is_manual() {
            return Err(Error::bad_parameter(format!(
                "slots close on their own every {} ms",
                self.slot_ms
            )));
        }
        self.close(current, 1);
        return Ok(self.history.slot_count() - 1);
    }

    pub fn history(&self) -> &SlotHistory<T> {
        return &self.history;
    }

    pub fn slot_count(&self) -> u64 {
        return self.history.slot_count();
    }

    /// Latest timestamp seen; always 0 on the manual time base
    pub fn current_time(&self) -> u64 {
        return self.current_time;
    }
}
