//! Conversions between packed and flat packets, and per-event rewrites
//!
//! Packed streams are stateful: an event word only carries the low bits of its
//! timestamp, and the upper part comes from the most recent high word, which
//! may have arrived in an earlier packet. That state is the high-word carry,
//! owned by the caller and threaded through successive calls. A fresh carry is
//! [`TIME_HIGH_UNDEFINED`].

use crate::wire::{high_value, is_high_word, Layout, MAX_EVENTS};
use crate::{board_of, channel_of, source_id, Error, Format, Packet, Payload, Result, Tag};
use crate::TIME_HIGH_UNDEFINED;
#[allow(unused_imports)]
use tracing::{debug, warn};

fn words_payload(multi: bool, words: Vec<u32>) -> Payload {
    if multi { Payload::MultiPacked(words) } else { Payload::Packed(words) }
}

fn tags_payload(multi: bool, tags: Vec<Tag>) -> Payload {
    if multi { Payload::MultiFlat(tags) } else { Payload::Flat(tags) }
}

/// Decode a packed packet into a flat one.
///
/// Event words that arrive while the carry is still undefined have no
/// timestamp to attach to and are dropped.
pub fn expand(packet: &Packet, carry: &mut u64) -> Result<Packet> {
    let (words, multi) = match &packet.payload {
        Payload::Packed(w) => (w, false),
        Payload::MultiPacked(w) => (w, true),
        p => return Err(Error::wrong_format("expand", p.format())),
    };
    let layout = if multi { Layout::MULTI } else { Layout::SINGLE };

    let mut tags = Vec::with_capacity(words.len());
    let mut orphans = 0usize;
    for &w in words {
        if is_high_word(w) {
            *carry = high_value(w);
        } else if *carry == TIME_HIGH_UNDEFINED {
            orphans += 1;
        } else {
            let (id, low) = layout.split(w);
            tags.push(Tag { time: layout.join(*carry, low), channel: id });
        }
    }
    if orphans > 0 {
        warn!(orphans, seq = packet.seq, "events before the first high word dropped");
    }
    return Ok(packet.with_payload(tags_payload(multi, tags)));
}

/// Encode a flat packet as a packed one, emitting a high word ahead of every
/// event whose upper timestamp bits differ from the carry.
///
/// The carry is only updated when the whole packet encodes.
pub fn compress(packet: &Packet, carry: &mut u64) -> Result<Packet> {
    let (tags, multi) = match &packet.payload {
        Payload::Flat(t) => (t, false),
        Payload::MultiFlat(t) => (t, true),
        p => return Err(Error::wrong_format("compress", p.format())),
    };
    let layout = if multi { Layout::MULTI } else { Layout::SINGLE };

    let mut high = *carry;
    let mut words = Vec::with_capacity(tags.len() + 1);
    for tag in tags {
        if tag.time > layout.max_time() {
            return Err(Error::bad_parameter(format!(
                "timestamp {} exceeds the {}-bit wire range",
                tag.time,
                layout.time_bits()
            )));
        }
        if tag.channel > layout.max_id() {
            return Err(Error::bad_parameter(format!(
                "channel {} does not fit a single-board word",
                tag.channel
            )));
        }
        if layout.high_part(tag.time) != high {
            high = layout.high_part(tag.time);
            words.push(layout.high_word(tag.time));
        }
        words.push(layout.event_word(tag.channel, tag.time));
    }
    if words.len() > MAX_EVENTS {
        return Err(Error::BufferOverflow { needed: words.len(), capacity: MAX_EVENTS });
    }
    *carry = high;
    return Ok(packet.with_payload(words_payload(multi, words)));
}

/// Keep at most the first `max_events` events. High words are kept but not
/// counted. Returns the clipped packet and the number of events it holds.
pub fn clip(packet: &Packet, max_events: usize) -> (Packet, usize) {
    match &packet.payload {
        Payload::Packed(w) | Payload::MultiPacked(w) => {
            let mut n = 0;
            let mut kept = Vec::with_capacity(w.len());
            for &word in w {
                if !is_high_word(word) {
                    if n == max_events {
                        break;
                    }
                    n += 1;
                }
                kept.push(word);
            }
            let multi = packet.format().is_multi();
            return (packet.with_payload(words_payload(multi, kept)), n);
        }
        Payload::Flat(t) | Payload::MultiFlat(t) => {
            let n = t.len().min(max_events);
            let multi = packet.format().is_multi();
            return (packet.with_payload(tags_payload(multi, t[..n].to_vec())), n);
        }
    }
}

/// Relabel events through a table indexed by source id. `None` drops the
/// event. Single-board packets use their channel as source id.
pub fn channel_exchange(packet: &Packet, table: &[Option<u8>; 256]) -> Result<Packet> {
    let multi = packet.format().is_multi();
    let remap = |id: u8| -> Result<Option<u8>> {
        match table[id as usize] {
            Some(d) if !multi && d > 15 => Err(Error::bad_parameter(format!(
                "source {} maps to {}, beyond the 16 channels of a single-board packet",
                id, d
            ))),
            d => Ok(d),
        }
    };

    match &packet.payload {
        Payload::Packed(w) | Payload::MultiPacked(w) => {
            let layout = Layout::of(packet.format());
            let mut words = Vec::with_capacity(w.len());
            for &word in w {
                if is_high_word(word) {
                    words.push(word);
                    continue;
                }
                let (id, low) = layout.split(word);
                if let Some(d) = remap(id)? {
                    words.push(layout.event_word(d, low));
                }
            }
            return Ok(packet.with_payload(words_payload(multi, words)));
        }
        Payload::Flat(t) | Payload::MultiFlat(t) => {
            let mut tags = Vec::with_capacity(t.len());
            for tag in t {
                if let Some(d) = remap(tag.channel)? {
                    tags.push(Tag { time: tag.time, channel: d });
                }
            }
            return Ok(packet.with_payload(tags_payload(multi, tags)));
        }
    }
}

/// Add a per-channel offset to every event of a flat single-board packet.
/// Times saturate at zero; the result may no longer be sorted.
pub fn time_shift(packet: &Packet, offsets: &[i32; 16]) -> Result<Packet> {
    let tags = match &packet.payload {
        Payload::Flat(t) => t,
        p => return Err(Error::wrong_format("time_shift", p.format())),
    };
    let mut shifted = Vec::with_capacity(tags.len());
    for tag in tags {
        let off = offsets.get(tag.channel as usize).ok_or_else(|| {
            Error::bad_parameter(format!("channel {} out of range", tag.channel))
        })?;
        shifted.push(Tag {
            time: tag.time.saturating_add_signed(*off as i64),
            channel: tag.channel,
        });
    }
    return Ok(packet.with_payload(Payload::Flat(shifted)));
}

/// Events of any packet as flat tags, expanding packed formats
pub fn decode(packet: &Packet, carry: &mut u64) -> Result<Vec<Tag>> {
    if packet.format().is_packed() {
        return expand(packet, carry)?.into_tags();
    }
    return packet.clone().into_tags();
}

/// Convert between any two packet formats.
///
/// Single-board events gain the source id of `board`; going the other way,
/// only events of `board` survive. Each packed side keeps its own carry.
pub fn convert(
    packet: &Packet,
    dest: Format,
    board: u8,
    src_carry: &mut u64,
    dst_carry: &mut u64,
) -> Result<Packet> {
    let tags = decode(packet, src_carry)?;
    let tags: Vec<Tag> = match (packet.format().is_multi(), dest.is_multi()) {
        (false, true) => tags
            .into_iter()
            .map(|t| Tag { time: t.time, channel: source_id(board, t.channel) })
            .collect(),
        (true, false) => tags
            .into_iter()
            .filter(|t| board_of(t.channel) == board)
            .map(|t| Tag { time: t.time, channel: channel_of(t.channel) })
            .collect(),
        _ => tags,
    };
    let flat = packet.with_payload(tags_payload(dest.is_multi(), tags));
    if dest.is_packed() {
        return compress(&flat, dst_carry);
    }
    return Ok(flat);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(p: &Packet) -> &[u32] {
        match &p.payload {
            Payload::Packed(w) | Payload::MultiPacked(w) => w,
            _ => panic!("not packed"),
        }
    }

    #[test]
    fn compress_emits_high_words_on_change() {
        let l = Layout::SINGLE;
        let tags = vec![
            Tag::new(5, 0),
            Tag::new(6, 1),
            Tag::new((1 << 27) + 2, 2),
            Tag::new((1 << 27) + 3, 3),
        ];
        let mut carry = TIME_HIGH_UNDEFINED;
        let p = compress(&Packet::flat(tags.clone()), &mut carry).unwrap();
        let w = words(&p);
        assert_eq!(w.len(), 6);
        assert!(is_high_word(w[0]));
        assert!(is_high_word(w[3]));
        assert_eq!(high_value(w[3]), 1);
        assert_eq!(l.split(w[4]), (2, 2));
        assert_eq!(carry, 1);

        // Same high part as the carry: no high word
        let p = compress(&Packet::flat(vec![Tag::new((1 << 27) + 9, 4)]), &mut carry).unwrap();
        assert_eq!(words(&p).len(), 1);
    }

    #[test]
    fn expand_drops_events_before_first_high_word() {
        let l = Layout::SINGLE;
        let p = Packet::new(0, Payload::Packed(vec![
            l.event_word(1, 10),
            l.high_word(3 << 27),
            l.event_word(2, 20),
        ]));
        let mut carry = TIME_HIGH_UNDEFINED;
        let out = expand(&p, &mut carry).unwrap();
        assert_eq!(out.tags().unwrap(), &[Tag::new((3 << 27) + 20, 2)]);
        assert_eq!(carry, 3);

        // The carry persists into the next packet
        let p = Packet::new(0, Payload::Packed(vec![l.event_word(7, 1)]));
        let out = expand(&p, &mut carry).unwrap();
        assert_eq!(out.tags().unwrap(), &[Tag::new((3 << 27) + 1, 7)]);
    }

    #[test]
    fn wrong_formats() {
        let mut c = TIME_HIGH_UNDEFINED;
        let flat = Packet::flat(vec![Tag::new(1, 1)]);
        let packed = Packet::new(0, Payload::Packed(vec![]));
        assert!(matches!(expand(&flat, &mut c), Err(Error::InvalidPacketFormat(_))));
        assert!(matches!(compress(&packed, &mut c), Err(Error::InvalidPacketFormat(_))));
        assert!(matches!(time_shift(&packed, &[0; 16]), Err(Error::InvalidPacketFormat(_))));
    }

    #[test]
    fn compress_rejects_out_of_range() {
        let mut c = TIME_HIGH_UNDEFINED;
        let p = Packet::flat(vec![Tag::new(1 << 58, 0)]);
        assert!(matches!(compress(&p, &mut c), Err(Error::BadParameter(_))));
        let p = Packet::multi_flat(vec![Tag::new(1 << 54, 0)]);
        assert!(matches!(compress(&p, &mut c), Err(Error::BadParameter(_))));
        assert_eq!(c, TIME_HIGH_UNDEFINED);
    }

    #[test]
    fn compress_overflow() {
        // Every event lands in a new high slot: two words each
        let tags = (0..MAX_EVENTS as u64).map(|i| Tag::new(i << 27, 0)).collect();
        let mut c = TIME_HIGH_UNDEFINED;
        let r = compress(&Packet::flat(tags), &mut c);
        assert_eq!(r, Err(Error::BufferOverflow { needed: 2 * MAX_EVENTS, capacity: MAX_EVENTS }));
        assert_eq!(c, TIME_HIGH_UNDEFINED);
    }

    #[test]
    fn clip_counts_events_only() {
        let l = Layout::SINGLE;
        let p = Packet::new(0, Payload::Packed(vec![
            l.high_word(0),
            l.event_word(0, 1),
            l.event_word(1, 2),
            l.high_word(1 << 27),
            l.event_word(2, 3),
        ]));
        let (c, n) = clip(&p, 2);
        assert_eq!(n, 2);
        assert_eq!(words(&c).len(), 4);
        let (c, n) = clip(&p, 10);
        assert_eq!(n, 3);
        assert_eq!(c, p);

        let f = Packet::flat(vec![Tag::new(1, 0), Tag::new(2, 0), Tag::new(3, 0)]);
        let (c, n) = clip(&f, 2);
        assert_eq!(n, 2);
        assert_eq!(c.tags().unwrap(), &[Tag::new(1, 0), Tag::new(2, 0)]);
    }

    #[test]
    fn exchange_relabels_and_drops() {
        let mut table = [None; 256];
        table[0] = Some(5);
        table[1] = Some(1);
        let f = Packet::flat(vec![Tag::new(1, 0), Tag::new(2, 1), Tag::new(3, 2)]);
        let out = channel_exchange(&f, &table).unwrap();
        assert_eq!(out.tags().unwrap(), &[Tag::new(1, 5), Tag::new(2, 1)]);

        table[2] = Some(16);
        assert!(matches!(channel_exchange(&f, &table), Err(Error::BadParameter(_))));

        // Multi-board ids may use the full byte
        let m = Packet::multi_flat(vec![Tag::new(4, 2)]);
        let out = channel_exchange(&m, &table).unwrap();
        assert_eq!(out.tags().unwrap(), &[Tag::new(4, 16)]);
    }

    #[test]
    fn exchange_on_packed_words() {
        let l = Layout::SINGLE;
        let mut table = [None; 256];
        table[3] = Some(4);
        let p = Packet::new(0, Payload::Packed(vec![
            l.high_word(1 << 27),
            l.event_word(3, 77),
            l.event_word(9, 78),
        ]));
        let out = channel_exchange(&p, &table).unwrap();
        assert_eq!(words(&out), &[l.high_word(1 << 27), l.event_word(4, 77)]);
    }

    #[test]
    fn shift_saturates_at_zero() {
        let mut offsets = [0i32; 16];
        offsets[0] = -100;
        offsets[1] = 50;
        let f = Packet::flat(vec![Tag::new(40, 0), Tag::new(60, 1), Tag::new(500, 0)]);
        let out = time_shift(&f, &offsets).unwrap();
        assert_eq!(out.tags().unwrap(), &[Tag::new(0, 0), Tag::new(110, 1), Tag::new(400, 0)]);
    }

    #[test]
    fn convert_between_boards() {
        let f = Packet::flat(vec![Tag::new(10, 3), Tag::new(20, 12)]);
        let (mut a, mut b) = (TIME_HIGH_UNDEFINED, TIME_HIGH_UNDEFINED);
        let m = convert(&f, Format::MultiPacked, 2, &mut a, &mut b).unwrap();
        assert_eq!(m.format(), Format::MultiPacked);

        let (mut c, mut d) = (TIME_HIGH_UNDEFINED, TIME_HIGH_UNDEFINED);
        let mf = convert(&m, Format::MultiFlat, 0, &mut c, &mut d).unwrap();
        assert_eq!(mf.tags().unwrap(), &[Tag::new(10, 0x23), Tag::new(20, 0x2C)]);

        let (mut c, mut d) = (TIME_HIGH_UNDEFINED, TIME_HIGH_UNDEFINED);
        let back = convert(&mf, Format::Flat, 2, &mut c, &mut d).unwrap();
        assert_eq!(back, f);
        let other = convert(&mf, Format::Flat, 1, &mut c, &mut d).unwrap();
        assert!(other.is_empty());
    }
}
