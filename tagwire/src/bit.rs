//! Bitmask tools for working with patterns of channels
//!
//! Channels are 0-indexed, so channel `c` is bit `c` of a pattern mask.

use bit_iter::BitIter;

/// Convert channels into a bitmask. Channels above 15 are ignored.
pub fn chans_to_mask(chs: &[u8]) -> u16 {
    let mut m = 0u16;
    for &ch in chs.iter().filter(|&&ch| ch < 16) {
        m.set(ch as usize);
    }
    return m;
}

/// Returns all channels in mask, lowest first
pub fn mask_to_chans(m: u16) -> Vec<u8> {
    return BitIter::from(m).map(|b| b as u8).collect();
}

/// Set and test single bits of a channel or input mask
pub trait BitOps: Copy {
    fn set(&mut self, b: usize);
    fn check(self, b: usize) -> bool;
}

macro_rules! impl_bit_ops {
    ($($t:ty),*) => {$(
        impl BitOps for $t {
            #[inline]
            fn set(&mut self, b: usize) {
                *self |= 1 << b;
            }

            #[inline]
            fn check(self, b: usize) -> bool {
                return self >> b & 1 == 1;
            }
        }
    )*};
}

impl_bit_ops!(u8, u16);

/// Active-channel mask of 256 source ids, one byte of inputs per board
///
/// Bit `i` of byte `b` enables input `i` of board `b`, both of its edges.
pub fn source_enabled(masks: &[u8; 16], source: u8) -> bool {
    let board = crate::board_of(source) as usize;
    let input = crate::input_of(crate::channel_of(source)) as usize;
    return masks[board].check(input);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_masks() {
        assert_eq!(0b01, chans_to_mask(&[0]));
        assert_eq!(0b10, chans_to_mask(&[1]));
        assert_eq!(0b11, chans_to_mask(&[0, 1]));
        assert_eq!(0x8000, chans_to_mask(&[15]));
        assert_eq!(0, chans_to_mask(&[16, 200]));
    }

    #[test]
    fn bijective_channel_masks() {
        // Exhaustively check all u16s
        for pat in u16::MIN..=u16::MAX {
            let chs = mask_to_chans(pat);
            assert!(chs.iter().all(|&c| c < 16));
            assert_eq!(pat, chans_to_mask(&chs));
            assert_eq!(chs.len(), pat.count_ones() as usize);
            assert!(chs.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn bit_ops() {
        for i in u16::MIN..=u16::MAX {
            for b in 0..16 {
                let mut x = i;
                assert_eq!(i.check(b), i >> b & 1 == 1);
                x.set(b);
                assert_eq!(x, i | 1 << b);
                assert!(x.check(b));
            }
        }
        for i in u8::MIN..=u8::MAX {
            for b in 0..8 {
                let mut x = i;
                x.set(b);
                assert!(x.check(b));
                assert_eq!(x & !(1 << b), i & !(1 << b));
            }
        }
    }

    #[test]
    fn source_masks() {
        let mut masks = [0u8; 16];
        masks[1] = 0b0000_0101;
        assert!(source_enabled(&masks, 0x10));
        // Falling edge of input 0 on board 1
        assert!(source_enabled(&masks, 0x18));
        assert!(!source_enabled(&masks, 0x11));
        assert!(source_enabled(&masks, 0x12));
        assert!(!source_enabled(&masks, 0x00));
    }
}
