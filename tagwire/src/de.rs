//! Deserialization of tags and packets for fixtures and replay

use crate::wire::{HEADER_LEN, MAGIC};
use crate::{Error, Format, Packet, Tag};
use anyhow::Result;
use byteorder::{BigEndian, ByteOrder};
use std::io::Read;

/// Deserialize tags from tab-separated values (channel, time).
pub fn tsv(rdr: &mut csv::Reader<impl Read>) -> Result<Vec<Tag>> {
    let mut tags: Vec<Tag> = Vec::new();
    for result in rdr.records() {
        let record = result?;
        tags.push(Tag {
            time: record[1].parse::<u64>()?,
            channel: record[0].parse::<u8>()?,
        });
    }
    Ok(tags)
}

/// Split a byte stream of back-to-back packets, as written by
/// [`ser::packets`](crate::ser::packets), and parse each one.
pub fn packets(buf: &[u8]) -> Result<Vec<Packet>> {
    let mut out = Vec::new();
    let mut rest = buf;
    while !rest.is_empty() {
        if rest.len() < HEADER_LEN || BigEndian::read_u16(&rest[0..2]) != MAGIC {
            return Err(Error::InvalidPacketFormat("stream lost packet framing".into()).into());
        }
        let word = Format::from_code(rest[2]).map_or(8, |f| f.word_size());
        let count = BigEndian::read_u32(&rest[8..12]) as usize;
        let len = (HEADER_LEN + count * word).min(rest.len());
        out.push(Packet::from_bytes(&rest[..len])?);
        rest = &rest[len..];
    }
    Ok(out)
}
