//! Single-board processing chain: decode, filter, sort, count

use crate::corr::CorrelationCounter;
use crate::count::EventCounter;
use crate::deadtime::DeadTimeFilter;
use crate::solo::SoloFilter;
use crate::sort::SortBuffer;
use crate::Stage;
use tagwire::wire::SequenceTracker;
use tagwire::{codec, Error, Packet, Result, Tag, TIME_HIGH_UNDEFINED};
#[allow(unused_imports)]
use tracing::{debug, info, warn};

/// Packets of one board in, filtered and sorted events out
///
/// Stages run in the order dead time, sort buffer, solitary filter. Every
/// batch leaving the chain feeds the event counter and, when configured, the
/// correlation counter.
pub struct Pipeline {
    carry: u64,
    sequence: SequenceTracker,
    stages: Vec<Box<dyn Stage + Send>>,
    counter: EventCounter,
    correlation: Option<CorrelationCounter>,
    emitted: u64,
}

impl Pipeline {
    /// Sort buffer only, no filters, no correlation
    pub fn new(max_shuffle_ticks: u64, slot_ms: u32) -> Self {
        Pipeline::build(None, SortBuffer::new(max_shuffle_ticks), None, EventCounter::new(slot_ms), None)
    }

    pub fn build(
        dead: Option<DeadTimeFilter>,
        sort: SortBuffer,
        solo: Option<SoloFilter>,
        counter: EventCounter,
        correlation: Option<CorrelationCounter>,
    ) -> Self {
        let mut stages: Vec<Box<dyn Stage + Send>> = Vec::new();
        if let Some(d) = dead {
            stages.push(Box::new(d));
        }
        stages.push(Box::new(sort));
        if let Some(s) = solo {
            stages.push(Box::new(s));
        }
        Pipeline {
            carry: TIME_HIGH_UNDEFINED,
            sequence: SequenceTracker::new(),
            stages,
            counter,
            correlation,
            emitted: 0,
        }
    }

    fn count(&mut self, batch: &[Tag]) {
        self.emitted += batch.len() as u64;
        self.counter.process(batch);
        if let Some(c) = self.correlation.as_mut() {
            c.process(batch);
        }
    }

    /// Run events through every stage
    pub fn process_tags(&mut self, tags: &[Tag]) -> Vec<Tag> {
        let mut batch = tags.to_vec();
        for stage in self.stages.iter_mut() {
            batch = stage.process(&batch);
        }
        self.count(&batch);
        return batch;
    }

    /// Decode a single-board packet and run its events through
    pub fn process_packet(&mut self, packet: &Packet) -> Result<Vec<Tag>> {
        if packet.format().is_multi() {
            return Err(Error::InvalidPacketFormat(format!(
                "{:?} packets need a multi-board merge",
                packet.format()
            )));
        }
        self.sequence.observe(packet.seq);
        let tags = codec::decode(packet, &mut self.carry)?;
        return Ok(self.process_tags(&tags));
    }

    /// Parse a received packet and run its events through
    pub fn process_bytes(&mut self, buf: &[u8]) -> Result<Vec<Tag>> {
        let packet = Packet::from_bytes(buf)?;
        return self.process_packet(&packet);
    }

    /// End of stream: flush every stage in order, each flush passing through
    /// the stages after it, then drain the correlation queue
    pub fn finish(&mut self) -> Vec<Tag> {
        let mut batch = Vec::new();
        for stage in self.stages.iter_mut() {
            let mut out = stage.process(&batch);
            out.extend(stage.flush());
            batch = out;
        }
        self.count(&batch);
        if let Some(c) = self.correlation.as_mut() {
            c.flush_queue();
        }
        info!(emitted = self.emitted, lost_packets = self.sequence.lost(), "pipeline finished");
        return batch;
    }

    pub fn counter(&self) -> &EventCounter {
        return &self.counter;
    }

    pub fn counter_mut(&mut self) -> &mut EventCounter {
        return &mut self.counter;
    }

    pub fn correlation(&self) -> Option<&CorrelationCounter> {
        return self.correlation.as_ref();
    }

    pub fn correlation_mut(&mut self) -> Option<&mut CorrelationCounter> {
        return self.correlation.as_mut();
    }

    /// Events that made it through every stage
    pub fn emitted(&self) -> u64 {
        return self.emitted;
    }

    /// Packets missing from the sequence numbers seen so far
    pub fn lost_packets(&self) -> u64 {
        return self.sequence.lost();
    }
}
