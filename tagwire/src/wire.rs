//! Packet formats as they arrive from the instrument
//!
//! A serialized packet is a 16-byte header in network byte order followed by
//! `count` payload words:
//!
//! | offset | size | field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 2    | magic `0x5454`                          |
//! | 2      | 1    | format (1 Packed, 2 Flat, 3 MultiPacked, 4 MultiFlat) |
//! | 3      | 1    | flags, bit 0 set: payload is little-endian |
//! | 4      | 4    | sequence number                         |
//! | 8      | 4    | count of payload words                  |
//! | 12     | 1    | board id                                |
//! | 13     | 3    | reserved                                |
//!
//! Packed words are 32 bits. Bit 31 marks a high word whose remaining 31 bits
//! are the upper part of the timestamp; otherwise the word is an event with
//! its id above the low timestamp bits. Single-board words carry a 4-bit
//! channel and 27 low bits, multi-board words an 8-bit source id and 23 low
//! bits. Flat words are 64 bits: id in the top nibble (single-board) or top
//! byte (multi-board), timestamp below.

use crate::{Error, Result, Tag};
use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
#[allow(unused_imports)]
use tracing::{debug, warn};

/// Capacity of one packet, in payload entries
pub const MAX_EVENTS: usize = 2048;
pub const HEADER_LEN: usize = 16;
pub const MAGIC: u16 = 0x5454;

const HIGH_FLAG: u32 = 1 << 31;
const HIGH_MASK: u32 = !HIGH_FLAG;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Format {
    Packed,
    Flat,
    MultiPacked,
    MultiFlat,
}

impl Format {
    pub fn is_multi(self) -> bool {
        return matches!(self, Format::MultiPacked | Format::MultiFlat);
    }

    pub fn is_packed(self) -> bool {
        return matches!(self, Format::Packed | Format::MultiPacked);
    }

    /// Width of the timestamps this format can carry
    pub fn time_bits(self) -> u32 {
        return Layout::of(self).time_bits();
    }

    pub fn code(self) -> u8 {
        match self {
            Format::Packed => 1,
            Format::Flat => 2,
            Format::MultiPacked => 3,
            Format::MultiFlat => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Format> {
        match code {
            1 => Some(Format::Packed),
            2 => Some(Format::Flat),
            3 => Some(Format::MultiPacked),
            4 => Some(Format::MultiFlat),
            _ => None,
        }
    }

    /// Bytes per payload word on the wire
    pub fn word_size(self) -> usize {
        if self.is_packed() { 4 } else { 8 }
    }
}

/// Bit layout of packed words, shared by a packed format and its flat twin
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    low_bits: u32,
    id_mask: u32,
}

impl Layout {
    pub const SINGLE: Layout = Layout { low_bits: 27, id_mask: 0x0F };
    pub const MULTI: Layout = Layout { low_bits: 23, id_mask: 0xFF };

    pub fn of(format: Format) -> Layout {
        if format.is_multi() { Layout::MULTI } else { Layout::SINGLE }
    }

    pub fn time_bits(self) -> u32 {
        return self.low_bits + 31;
    }

    pub fn max_time(self) -> u64 {
        return (1u64 << self.time_bits()) - 1;
    }

    pub fn max_id(self) -> u8 {
        return self.id_mask as u8;
    }

    fn low_mask(self) -> u64 {
        return (1u64 << self.low_bits) - 1;
    }

    /// Upper part of a timestamp, as carried by a high word
    #[inline]
    pub fn high_part(self, time: u64) -> u64 {
        return time >> self.low_bits;
    }

    #[inline]
    pub fn high_word(self, time: u64) -> u32 {
        return HIGH_FLAG | (self.high_part(time) as u32 & HIGH_MASK);
    }

    #[inline]
    pub fn event_word(self, id: u8, time: u64) -> u32 {
        return (id as u32 & self.id_mask) << self.low_bits | (time & self.low_mask()) as u32;
    }

    /// Split an event word into its id and the low bits of its timestamp
    #[inline]
    pub fn split(self, word: u32) -> (u8, u64) {
        let id = (word >> self.low_bits) & self.id_mask;
        return (id as u8, word as u64 & self.low_mask());
    }

    #[inline]
    pub fn join(self, high: u64, low: u64) -> u64 {
        return high << self.low_bits | low;
    }

    fn flat_shift(self) -> u32 {
        return 64 - self.id_mask.count_ones();
    }

    pub fn flat_word(self, tag: &Tag) -> Result<u64> {
        if tag.time > self.max_time() {
            return Err(Error::bad_parameter(format!(
                "timestamp {} exceeds the {}-bit wire range",
                tag.time,
                self.time_bits()
            )));
        }
        if tag.channel as u32 > self.id_mask {
            return Err(Error::bad_parameter(format!(
                "id {} does not fit a single-board word",
                tag.channel
            )));
        }
        return Ok((tag.channel as u64) << self.flat_shift() | tag.time);
    }

    pub fn flat_tag(self, word: u64) -> Tag {
        let shift = self.flat_shift();
        return Tag {
            time: word & ((1u64 << shift) - 1),
            channel: (word >> shift) as u8,
        };
    }
}

#[inline]
pub fn is_high_word(word: u32) -> bool {
    return word & HIGH_FLAG != 0;
}

/// High part carried by a high word
#[inline]
pub fn high_value(word: u32) -> u64 {
    return (word & HIGH_MASK) as u64;
}

/// Contents of a packet, one variant per wire format
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Packed(Vec<u32>),
    Flat(Vec<Tag>),
    MultiPacked(Vec<u32>),
    MultiFlat(Vec<Tag>),
}

impl Payload {
    pub fn format(&self) -> Format {
        match self {
            Payload::Packed(_) => Format::Packed,
            Payload::Flat(_) => Format::Flat,
            Payload::MultiPacked(_) => Format::MultiPacked,
            Payload::MultiFlat(_) => Format::MultiFlat,
        }
    }

    /// Number of entries, high words included
    pub fn len(&self) -> usize {
        match self {
            Payload::Packed(w) | Payload::MultiPacked(w) => w.len(),
            Payload::Flat(t) | Payload::MultiFlat(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        return self.len() == 0;
    }

    /// Number of event entries, high words excluded
    pub fn event_count(&self) -> usize {
        match self {
            Payload::Packed(w) | Payload::MultiPacked(w) => {
                w.iter().filter(|&&w| !is_high_word(w)).count()
            }
            Payload::Flat(t) | Payload::MultiFlat(t) => t.len(),
        }
    }

    /// Empty payload of the given format
    pub fn empty(format: Format) -> Payload {
        match format {
            Format::Packed => Payload::Packed(Vec::new()),
            Format::Flat => Payload::Flat(Vec::new()),
            Format::MultiPacked => Payload::MultiPacked(Vec::new()),
            Format::MultiFlat => Payload::MultiFlat(Vec::new()),
        }
    }
}

/// Payload byte order, announced by bit 0 of the header flags
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

fn io_error(e: std::io::Error) -> Error {
    Error::InvalidPacketFormat(e.to_string())
}

fn read_payload<B: ByteOrder>(format: Format, body: &[u8]) -> Payload {
    let layout = Layout::of(format);
    match format {
        Format::Packed => Payload::Packed(body.chunks_exact(4).map(B::read_u32).collect()),
        Format::MultiPacked => Payload::MultiPacked(body.chunks_exact(4).map(B::read_u32).collect()),
        Format::Flat => Payload::Flat(
            body.chunks_exact(8).map(|c| layout.flat_tag(B::read_u64(c))).collect(),
        ),
        Format::MultiFlat => Payload::MultiFlat(
            body.chunks_exact(8).map(|c| layout.flat_tag(B::read_u64(c))).collect(),
        ),
    }
}

fn write_payload<B: ByteOrder>(buf: &mut Vec<u8>, payload: &Payload) -> Result<()> {
    let layout = Layout::of(payload.format());
    match payload {
        Payload::Packed(words) | Payload::MultiPacked(words) => {
            for &w in words {
                buf.write_u32::<B>(w).map_err(io_error)?;
            }
        }
        Payload::Flat(tags) | Payload::MultiFlat(tags) => {
            for tag in tags {
                buf.write_u64::<B>(layout.flat_word(tag)?).map_err(io_error)?;
            }
        }
    }
    Ok(())
}

/// One batch of events from one board
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub seq: u32,
    pub board: u8,
    pub payload: Payload,
}

impl Packet {
    pub fn new(board: u8, payload: Payload) -> Self {
        Packet { seq: 0, board, payload }
    }

    pub fn flat(tags: Vec<Tag>) -> Self {
        Packet::new(0, Payload::Flat(tags))
    }

    pub fn multi_flat(tags: Vec<Tag>) -> Self {
        Packet::new(0, Payload::MultiFlat(tags))
    }

    pub fn format(&self) -> Format {
        return self.payload.format();
    }

    pub fn len(&self) -> usize {
        return self.payload.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.payload.is_empty();
    }

    pub fn event_count(&self) -> usize {
        return self.payload.event_count();
    }

    /// Events of a flat packet, `None` for packed formats
    pub fn tags(&self) -> Option<&[Tag]> {
        match &self.payload {
            Payload::Flat(t) | Payload::MultiFlat(t) => Some(t),
            _ => None,
        }
    }

    pub fn into_tags(self) -> Result<Vec<Tag>> {
        match self.payload {
            Payload::Flat(t) | Payload::MultiFlat(t) => Ok(t),
            p => Err(Error::wrong_format("into_tags", p.format())),
        }
    }

    /// Same header, new contents
    pub fn with_payload(&self, payload: Payload) -> Packet {
        Packet { seq: self.seq, board: self.board, payload }
    }

    /// Parse a received packet, converting its payload to native byte order
    pub fn from_bytes(buf: &[u8]) -> Result<Packet> {
        if buf.len() < HEADER_LEN {
            return Err(Error::InvalidPacketFormat(format!(
                "truncated header: {} bytes",
                buf.len()
            )));
        }
        let mut hdr = &buf[..HEADER_LEN];
        let magic = hdr.read_u16::<BigEndian>().map_err(io_error)?;
        if magic != MAGIC {
            return Err(Error::InvalidPacketFormat(format!("bad magic {:#06x}", magic)));
        }
        let code = hdr.read_u8().map_err(io_error)?;
        let format = Format::from_code(code)
            .ok_or_else(|| Error::InvalidPacketFormat(format!("unknown format code {}", code)))?;
        let flags = hdr.read_u8().map_err(io_error)?;
        let seq = hdr.read_u32::<BigEndian>().map_err(io_error)?;
        let count = hdr.read_u32::<BigEndian>().map_err(io_error)? as usize;
        let board = hdr.read_u8().map_err(io_error)?;
        if count > MAX_EVENTS {
            return Err(Error::InvalidPacketFormat(format!(
                "count {} exceeds packet capacity {}",
                count, MAX_EVENTS
            )));
        }
        let body = &buf[HEADER_LEN..];
        let size = format.word_size();
        if body.len() != count * size {
            return Err(Error::InvalidPacketFormat(format!(
                "payload is {} bytes, header announces {} words of {} bytes",
                body.len(),
                count,
                size
            )));
        }

        let payload = if flags & 1 == 1 {
            read_payload::<LittleEndian>(format, body)
        } else {
            read_payload::<BigEndian>(format, body)
        };
        return Ok(Packet { seq, board, payload });
    }

    /// Serialize with the payload in the given byte order
    pub fn to_bytes(&self, order: Endian) -> Result<Vec<u8>> {
        let format = self.format();
        let count = self.len();
        if count > MAX_EVENTS {
            return Err(Error::BufferOverflow { needed: count, capacity: MAX_EVENTS });
        }
        let mut buf = Vec::with_capacity(HEADER_LEN + count * format.word_size());
        buf.write_u16::<BigEndian>(MAGIC).map_err(io_error)?;
        buf.write_u8(format.code()).map_err(io_error)?;
        buf.write_u8(if order == Endian::Little { 1 } else { 0 }).map_err(io_error)?;
        buf.write_u32::<BigEndian>(self.seq).map_err(io_error)?;
        buf.write_u32::<BigEndian>(count as u32).map_err(io_error)?;
        buf.write_u8(self.board).map_err(io_error)?;
        buf.extend_from_slice(&[0, 0, 0]);

        match order {
            Endian::Big => write_payload::<BigEndian>(&mut buf, &self.payload)?,
            Endian::Little => write_payload::<LittleEndian>(&mut buf, &self.payload)?,
        }
        return Ok(buf);
    }
}

/// Watches packet sequence numbers for gaps
#[derive(Clone, Debug, Default)]
pub struct SequenceTracker {
    last: Option<u32>,
    lost: u64,
}

impl SequenceTracker {
    pub fn new() -> Self {
        SequenceTracker::default()
    }

    /// Record a sequence number, returning how many packets went missing
    /// since the previous one. Repeated or reordered numbers report zero.
    pub fn observe(&mut self, seq: u32) -> u32 {
        let prev = match self.last {
            Some(p) => p,
            None => {
                self.last = Some(seq);
                return 0;
            }
        };
        let step = seq.wrapping_sub(prev);
        if step == 0 || step > u32::MAX / 2 {
            warn!(seq, prev, "out-of-order packet");
            return 0;
        }
        let gap = step - 1;
        if gap > 0 {
            warn!(seq, gap, "packets lost");
            self.lost += gap as u64;
        }
        self.last = Some(seq);
        return gap;
    }

    /// Total packets reported missing so far
    pub fn lost(&self) -> u64 {
        return self.lost;
    }
}
