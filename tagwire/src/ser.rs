//! Serialization of tags and packets for fixtures and replay

use crate::wire::Endian;
use crate::{Packet, Tag};
use anyhow::Result;
use std::io::Write;

/// Serialize tags to tab-separated values (channel, time).
pub fn tsv(wtr: &mut csv::Writer<impl Write>, tags: &[Tag]) -> Result<()> {
    for tag in tags.iter() {
        wtr.write_record(&[tag.channel.to_string(), tag.time.to_string()])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Write packets back to back, each as its serialized wire image
pub fn packets(wtr: &mut impl Write, packets: &[Packet], order: Endian) -> Result<()> {
    for p in packets {
        wtr.write_all(&p.to_bytes(order)?)?;
    }
    Ok(())
}
