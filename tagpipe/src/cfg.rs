//! Configuration: declaring a processing chain in a text file
//!
//! Every field is optional; an empty object `{}` gives a chain with only a
//! sort buffer and a 100 ms event counter. Durations are parsed as in
//! [humantime](https://docs.rs/humantime/), e.g. `250ms` or `1s`.
//!
//! ```json
//! {
//!     "max_shuffle_ticks": 2048,
//!     "dead_time": { "ticks": 100, "retrigger": true },
//!     "solo": { "max_delta": 60, "deep": false },
//!     "counter": { "slot": "250ms" },
//!     "correlation": {
//!         "window": { "Global": 61 },
//!         "patterns": [[0, 1], [0, 1, 2]]
//!     }
//! }
//! ```

use crate::coinc::{CoincidenceGroup, DEFAULT_MAX_COUNT, DEFAULT_WINDOW};
use crate::corr::{CorrelationCounter, Window};
use crate::count::EventCounter;
use crate::deadtime::DeadTimeFilter;
use crate::merge::{DeadTime, MultiMerge, DEFAULT_IDLE_TIMEOUT};
use crate::pipeline::Pipeline;
use crate::solo::SoloFilter;
use crate::sort::SortBuffer;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::time::Duration;
use tagwire::bit::chans_to_mask;
use tagwire::{BOARDS, CHANNELS, SOURCES};

/// Single-board chain from packets to counters
#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_shuffle_ticks: u64,
    pub dead_time: Option<DeadTimeConfig>,
    pub solo: Option<SoloConfig>,
    pub counter: CounterConfig,
    pub correlation: Option<CorrelationConfig>,
}

/// Dead time for every channel, with optional per-channel overrides
#[derive(Serialize, Deserialize, Debug, PartialEq, Default)]
#[serde(default)]
pub struct DeadTimeConfig {
    pub ticks: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<(u8, u64)>,
    pub retrigger: bool,
}

/// Neighbor window for every pair of channels, with optional per-pair
/// overrides `(earlier, later, ticks)`; `null` ticks unpairs them. Deep
/// search is on unless `deep` is `false`.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct SoloConfig {
    pub max_delta: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pairs: Vec<(u8, u8, Option<u32>)>,
    pub deep: bool,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct CounterConfig {
    /// Slot length; zero for slots closed by hand
    #[serde(with = "humantime_serde")]
    pub slot: Duration,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct CorrelationConfig {
    pub delays: [i32; CHANNELS],
    pub window: Window,
    /// Each pattern lists its channels
    pub patterns: Vec<Vec<u8>>,
}

/// Multi-board merge
#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct MergeConfig {
    pub channel_masks: [u8; BOARDS],
    /// `(source id, ticks)` calibration offsets
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub offsets: Vec<(u8, i32)>,
    pub dead_time: Option<DeadTimeConfig>,
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct CoincidenceConfig {
    pub min_count: usize,
    pub max_count: usize,
    pub window: u64,
    pub channel_masks: [u8; BOARDS],
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            max_shuffle_ticks: 0,
            dead_time: None,
            solo: None,
            counter: CounterConfig::default(),
            correlation: None,
        }
    }
}

impl Default for SoloConfig {
    fn default() -> Self {
        SoloConfig { max_delta: 0, pairs: Vec::new(), deep: true }
    }
}

impl Default for CounterConfig {
    fn default() -> Self {
        CounterConfig { slot: Duration::from_millis(100) }
    }
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        CorrelationConfig {
            delays: [0; CHANNELS],
            window: Window::Global(DEFAULT_WINDOW as u32),
            patterns: Vec::new(),
        }
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        MergeConfig {
            channel_masks: [0xFF; BOARDS],
            offsets: Vec::new(),
            dead_time: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl Default for CoincidenceConfig {
    fn default() -> Self {
        CoincidenceConfig {
            min_count: 2,
            max_count: DEFAULT_MAX_COUNT,
            window: DEFAULT_WINDOW,
            channel_masks: [0xFF; BOARDS],
        }
    }
}

fn slot_ms(slot: Duration) -> Result<u32> {
    let ms = slot.as_millis();
    if slot.subsec_nanos() % 1_000_000 != 0 || ms > u32::MAX as u128 {
        bail!("slot length {:?} is not a whole number of milliseconds", slot);
    }
    Ok(ms as u32)
}

impl DeadTimeConfig {
    fn ticks(&self, n: usize) -> Result<Vec<u64>> {
        let mut ticks = vec![self.ticks; n];
        for &(ch, t) in &self.channels {
            match ticks.get_mut(ch as usize) {
                Some(slot) => *slot = t,
                None => bail!("dead time for channel {} out of range", ch),
            }
        }
        Ok(ticks)
    }

    pub fn build(&self) -> Result<DeadTimeFilter> {
        Ok(DeadTimeFilter::per_channel(self.ticks(CHANNELS)?).with_retrigger(self.retrigger))
    }
}

impl SoloConfig {
    pub fn build(&self) -> Result<SoloFilter> {
        let mut f = SoloFilter::with_max_delta(self.max_delta);
        f.set_deep_search(self.deep);
        for &(a, b, w) in &self.pairs {
            f.set_max_delta(a, b, w)?;
        }
        Ok(f)
    }
}

impl CounterConfig {
    pub fn build(&self) -> Result<EventCounter> {
        Ok(EventCounter::new(slot_ms(self.slot)?))
    }
}

impl CorrelationConfig {
    pub fn build(&self, slot: Duration) -> Result<CorrelationCounter> {
        let mut c = CorrelationCounter::new(slot_ms(slot)?);
        c.configure_timing(&self.delays, self.window)?;
        let mut masks = Vec::with_capacity(self.patterns.len());
        for p in &self.patterns {
            if p.iter().any(|&ch| ch as usize >= CHANNELS) {
                bail!("pattern {:?} names a channel beyond 15", p);
            }
            masks.push(chans_to_mask(p));
        }
        c.configure_correlations(true, &masks)?;
        Ok(c)
    }
}

impl MergeConfig {
    pub fn build(&self) -> Result<MultiMerge> {
        let mut m = MultiMerge::new();
        m.set_channel_masks(self.channel_masks);
        m.set_idle_timeout(self.idle_timeout);
        let mut offsets = [0i32; SOURCES];
        for &(id, ticks) in &self.offsets {
            offsets[id as usize] = ticks;
        }
        m.set_channel_offsets(&offsets)?;
        if let Some(d) = &self.dead_time {
            m.set_dead_time(DeadTime::PerChannel(d.ticks(SOURCES)?), d.retrigger)?;
        }
        Ok(m)
    }
}

impl CoincidenceConfig {
    pub fn build(&self) -> Result<CoincidenceGroup> {
        let mut g = CoincidenceGroup::new(self.min_count)?;
        g.set_counts(self.min_count, self.max_count)?;
        g.set_window(self.window);
        g.set_channel_masks(self.channel_masks);
        Ok(g)
    }
}

impl PipelineConfig {
    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_reader(rdr: impl Read) -> Result<Self> {
        Ok(serde_json::from_reader(rdr)?)
    }

    pub fn build(&self) -> Result<Pipeline> {
        let dead = self.dead_time.as_ref().map(|d| d.build()).transpose()?;
        let solo = self.solo.as_ref().map(|s| s.build()).transpose()?;
        let correlation = self
            .correlation
            .as_ref()
            .map(|c| c.build(self.counter.slot))
            .transpose()?;
        Ok(Pipeline::build(
            dead,
            SortBuffer::new(self.max_shuffle_ticks),
            solo,
            self.counter.build()?,
            correlation,
        ))
    }
}
