use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tagpipe::corr::PairCounts;
use tagpipe::{processor, CoincidenceGroup, CorrelationCounter, EventCounter, MultiMerge, Pipeline, SortBuffer, Window};
use tagwire::wire::{Endian, MAX_EVENTS};
use tagwire::{codec, source_id, Packet, Payload, Tag, CHANNELS, TIME_HIGH_UNDEFINED};

mod common;

/// Packets as they would arrive from one board
fn encode(tags: &[Tag], board: u8, chunk: usize) -> Vec<Packet> {
    let mut carry = TIME_HIGH_UNDEFINED;
    let mut out = Vec::new();
    for (seq, chunk) in tags.chunks(chunk).enumerate() {
        let mut p = Packet::new(board, Payload::Flat(chunk.to_vec()));
        p.seq = seq as u32;
        out.push(codec::compress(&p, &mut carry).unwrap());
    }
    return out;
}

fn random_stream(rng: &mut StdRng, n: usize, channels: u8, step: u64) -> Vec<Tag> {
    let mut t = 0u64;
    let mut tags = Vec::with_capacity(n);
    for _ in 0..n {
        t += step * rng.gen_range(1..20u64);
        tags.push(Tag::new(t, rng.gen_range(0..channels)));
    }
    return tags;
}

#[test]
fn sort_restores_bounded_disorder() {
    let mut rng = StdRng::seed_from_u64(7);
    let max_shuffle = 50;
    let sorted = random_stream(&mut rng, 5000, 16, 1);
    // Arrival order by time plus a jitter no larger than the shuffle bound
    let mut keyed: Vec<(u64, Tag)> = sorted
        .iter()
        .map(|&t| (t.time + rng.gen_range(0..=max_shuffle), t))
        .collect();
    keyed.sort_by_key(|&(k, _)| k);
    let arrivals: Vec<Tag> = keyed.into_iter().map(|(_, t)| t).collect();

    let mut s = SortBuffer::new(max_shuffle);
    let mut out = Vec::new();
    let mut rest = &arrivals[..];
    while !rest.is_empty() {
        let n = rng.gen_range(1..64).min(rest.len());
        out.extend(s.insert(&rest[..n]));
        rest = &rest[n..];
    }
    out.extend(s.flush());
    assert_eq!(s.late_events(), 0);
    assert_eq!(out, sorted);
}

#[test]
fn pipeline_from_packets() {
    let tags = common::load_test_data();
    let mut pipeline = Pipeline::new(0, 1);
    let mut out = Vec::new();
    for p in encode(&tags, 0, MAX_EVENTS / 4) {
        let bytes = p.to_bytes(Endian::Little).unwrap();
        out.extend(pipeline.process_bytes(&bytes).unwrap());
    }
    out.extend(pipeline.finish());
    assert_eq!(out, tags);
    assert_eq!(pipeline.emitted(), tags.len() as u64);
    assert_eq!(pipeline.lost_packets(), 0);

    let counts = pipeline.counter().counter();
    for ch in 0..CHANNELS {
        let n = tags.iter().filter(|t| t.channel as usize == ch).count() as u64;
        assert_eq!(counts[ch], n);
    }
    assert!(pipeline.counter().slot_count() > 10);
}

#[test]
fn pipeline_counts_lost_packets() {
    let tags = common::load_test_data();
    let packets = encode(&tags[..300], 0, 100);
    assert!(packets.len() >= 3);
    let mut pipeline = Pipeline::new(0, 0);
    // Flat packets carry absolute times, so dropping one loses only its events
    let mut carry = TIME_HIGH_UNDEFINED;
    for (i, p) in packets.iter().enumerate() {
        if i == 1 {
            codec::decode(p, &mut carry).unwrap();
            continue;
        }
        let flat = p.with_payload(Payload::Flat(codec::decode(p, &mut carry).unwrap()));
        pipeline.process_packet(&flat).unwrap();
    }
    pipeline.finish();
    assert_eq!(pipeline.lost_packets(), 1);
    let multi = Packet::multi_flat(vec![Tag::new(1, 0x12)]);
    assert!(pipeline.process_packet(&multi).is_err());
}

#[test]
fn processor_thread() {
    common::init_tracing();
    let tags = common::load_test_data();
    let (tx, rx) = flume::unbounded();
    let (out_tx, out_rx) = flume::unbounded();
    let handle = processor::spawn(rx, out_tx, Pipeline::new(1000, 1)).unwrap();
    for p in encode(&tags, 0, MAX_EVENTS / 4) {
        tx.send(p.to_bytes(Endian::Big).unwrap()).unwrap();
    }
    // Garbage is skipped, not fatal
    tx.send(vec![0x54, 0x54, 9]).unwrap();
    drop(tx);

    let pipeline = handle.join().unwrap();
    let out: Vec<Tag> = out_rx.iter().flatten().collect();
    assert_eq!(out, tags);
    assert_eq!(pipeline.emitted(), tags.len() as u64);
}

#[test]
fn counter_history_is_monotonic() {
    let tags = common::load_test_data();
    let mut c = EventCounter::new(1);
    let (tx, rx) = flume::unbounded();
    c.notify_new_slots(tx);
    for chunk in tags.chunks(37) {
        c.process(chunk);
    }
    let sc = c.slot_count();
    assert!(sc > 2);
    let notified: Vec<u64> = rx.try_iter().collect();
    assert_eq!(notified, (0..sc).collect::<Vec<u64>>());

    let first = sc.saturating_sub(tagpipe::slot::HISTORY_DEPTH as u64);
    for s in first + 1..sc {
        let prev = c.dated_counter(s - 1).unwrap();
        let cur = c.dated_counter(s).unwrap();
        assert!(prev.iter().zip(cur.iter()).all(|(p, c)| p <= c));
    }
    let end = c.dated_counter(sc - 1).unwrap();
    let base = c.dated_counter(sc - 3).unwrap();
    let freq = c.frequency(1000, 2).unwrap();
    for ch in 0..CHANNELS {
        assert_eq!(freq[ch] as u64, (end[ch] - base[ch]) * 1000 / 2);
    }
    assert!(c.dated_counter(sc).is_err());
    assert!(c.frequency(1000, 0).is_err());
}

/// Straightforward recount of a sorted stream, no memo
fn brute_force(tags: &[Tag], window: u64, patterns: &[u16]) -> ([u64; CHANNELS], PairCounts, Vec<u64>) {
    let mut singles = [0u64; CHANNELS];
    let mut pairs = [[0u64; CHANNELS]; CHANNELS];
    let mut counts = vec![0u64; patterns.len()];
    let mut last: [Option<u64>; CHANNELS] = [None; CHANNELS];
    for t in tags {
        let b = t.channel as usize;
        singles[b] += 1;
        let mut present = 1u16 << b;
        for a in 0..CHANNELS {
            match last[a] {
                Some(ta) if a != b && t.time - ta <= window => {
                    present |= 1 << a;
                    pairs[a][b] += 1;
                    pairs[b][a] += 1;
                }
                _ => {}
            }
        }
        last[b] = Some(t.time);
        for (i, &p) in patterns.iter().enumerate() {
            if p & (1 << b) != 0 && p & !present == 0 {
                counts[i] += 1;
            }
        }
    }
    return (singles, pairs, counts);
}

#[test]
fn correlation_matches_brute_force() {
    let mut rng = StdRng::seed_from_u64(0x7777);
    let tags = random_stream(&mut rng, 20_000, 4, 1);
    let patterns: [u16; 5] = [0b0011, 0b0111, 0b1010, 0b1111, 0b0100];
    let mut c = CorrelationCounter::new(0);
    c.configure_timing(&[0; CHANNELS], Window::Global(12)).unwrap();
    c.configure_correlations(true, &patterns).unwrap();
    for chunk in tags.chunks(101) {
        c.process(chunk);
    }
    c.flush_queue();
    assert_eq!(c.pending(), 0);

    let (singles, pairs, counts) = brute_force(&tags, 12, &patterns);
    assert_eq!(c.singles(), singles);
    assert_eq!(c.pairs(), pairs);
    assert_eq!(c.patterns(), &counts[..]);
}

#[test]
fn delays_equal_shifted_input() {
    let mut rng = StdRng::seed_from_u64(99);
    // Even times everywhere, odd delay: no ties after shifting
    let tags = random_stream(&mut rng, 10_000, 3, 2);
    let mut delays = [0i32; CHANNELS];
    delays[1] = 11;
    let patterns: [u16; 2] = [0b011, 0b111];

    let mut delayed = CorrelationCounter::new(0);
    delayed.configure_timing(&delays, Window::Global(20)).unwrap();
    delayed.configure_correlations(true, &patterns).unwrap();
    for chunk in tags.chunks(64) {
        delayed.process(chunk);
    }
    delayed.flush_queue();

    let mut shifted: Vec<Tag> = tags
        .iter()
        .map(|t| Tag::new(t.time + delays[t.channel as usize] as u64, t.channel))
        .collect();
    shifted.sort();
    let (singles, pairs, counts) = brute_force(&shifted, 20, &patterns);
    assert_eq!(delayed.singles(), singles);
    assert_eq!(delayed.pairs(), pairs);
    assert_eq!(delayed.patterns(), &counts[..]);
}

#[test]
fn boards_merge_into_one_stream() {
    let mut rng = StdRng::seed_from_u64(3);
    let mut streams = Vec::new();
    for board in 0..3u8 {
        // Disjoint residues keep every timestamp unique across boards
        let tags: Vec<Tag> = random_stream(&mut rng, 3000, 8, 3)
            .into_iter()
            .map(|t| Tag::new(t.time + board as u64, t.channel))
            .collect();
        streams.push(encode(&tags, board, MAX_EVENTS / 4));
    }

    let mut m = MultiMerge::new();
    m.set_idle_timeout(std::time::Duration::from_secs(3600));
    let mut out = Vec::new();
    let longest = streams.iter().map(|s| s.len()).max().unwrap();
    for i in 0..longest {
        for s in &streams {
            if let Some(p) = s.get(i) {
                m.add_packet(p).unwrap();
            }
        }
        out.extend(m.get_sorted(usize::MAX));
    }
    m.flush();
    out.extend(m.get_sorted(usize::MAX));

    assert_eq!(out.len(), 9000);
    assert!(out.windows(2).all(|w| w[0].time < w[1].time));
    assert_eq!(m.late_events(), 0);
    for board in 0..3u8 {
        let n = out.iter().filter(|t| t.channel >> 4 == board).count();
        assert_eq!(n, 3000);
    }

    let mut g = CoincidenceGroup::new(2).unwrap();
    g.set_window(3);
    g.add(&out);
    g.flush();
    while let Some(group) = g.get_group() {
        assert!(group.len() >= 2);
        assert!(group.last().unwrap().time - group[0].time <= 3);
    }
    assert!(out.iter().any(|t| t.channel == source_id(2, 7)));
}
