//! Fixed-size bit groups read from a code at a moving offset.
//!
//! The sample trie is built and queried through the same window, so a trie
//! level always consumes exactly the bits a query consumes at that level.

use crate::record::{rotated, Code};
use crate::DATA_BIT;

/// Largest supported window width in bits.
pub const MAX_WINDOW_BITS: u32 = 16;

/// A sliding window of `size` bits over a code, wrapping at `DATA_BIT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    size: u32,
    cur: u32,
    left: i32,
}

impl Window {
    /// Window starting at bit `first` with the whole code left to consume.
    pub fn new(size: u32, first: u32) -> Self {
        Self::with_budget(size, first, DATA_BIT as i32)
    }

    /// Window starting at bit `first` with `left` bits left to consume.
    pub fn with_budget(size: u32, first: u32, left: i32) -> Self {
        assert!(
            is_valid_size(size),
            "window size {size} must be a power of two dividing {DATA_BIT} and at most {MAX_WINDOW_BITS}"
        );
        Self {
            size,
            cur: first % DATA_BIT as u32,
            left,
        }
    }

    /// The `size` bits starting at the current offset, as an integer.
    #[inline]
    pub fn peek(&self, code: &Code) -> u32 {
        (rotated(code, self.cur) >> (DATA_BIT as u32 - self.size)) as u32
    }

    /// The window one step further along.
    #[inline]
    pub fn next(&self) -> Self {
        Self {
            size: self.size,
            cur: (self.cur + self.size) % DATA_BIT as u32,
            left: self.left - self.size as i32,
        }
    }

    #[inline]
    pub fn advance(&mut self) {
        *self = self.next();
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Number of distinct values `peek` can return.
    pub fn fanout(&self) -> usize {
        1usize << self.size
    }

    pub fn offset(&self) -> u32 {
        self.cur
    }

    /// Whether any bits remain before the window has wrapped all the way round.
    pub fn has_remaining(&self) -> bool {
        self.left > 0
    }
}

pub(crate) fn is_valid_size(size: u32) -> bool {
    size > 0 && size <= MAX_WINDOW_BITS && size.is_power_of_two() && DATA_BIT as u32 % size == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    fn naive_peek(code: &Code, offset: u32, size: u32) -> u32 {
        let mut value = 0u32;
        for i in 0..size {
            let idx = ((offset + i) % DATA_BIT as u32) as usize;
            let bit = (code[idx / 8] >> (7 - idx % 8)) & 1;
            value = (value << 1) | bit as u32;
        }
        value
    }

    #[test]
    fn peek_matches_bit_by_bit_extraction() {
        let mut rng = StdRng::seed_from_u64(17);
        for _ in 0..500 {
            let code: Code = rng.gen();
            let size = [1u32, 2, 4, 8, 16][rng.gen_range(0..5)];
            let offset = rng.gen_range(0..DATA_BIT as u32);
            let window = Window::new(size, offset);
            assert_eq!(window.peek(&code), naive_peek(&code, offset, size));
        }
    }

    #[test]
    fn peek_wraps_across_the_last_chunk() {
        let mut code = [0u8; 16];
        code[15] = 0x0F; // bits 124..128 set
        code[0] = 0xA0; // bits 0..4 = 1010
        let window = Window::new(8, 124);
        assert_eq!(window.peek(&code), 0b1111_1010);
    }

    #[test]
    fn peek_is_pure_in_code_offset_and_size() {
        let mut rng = StdRng::seed_from_u64(99);
        let code: Code = rng.gen();
        let driven = {
            let mut w = Window::new(4, 12);
            let mut values = Vec::new();
            while w.has_remaining() {
                values.push(w.peek(&code));
                w.advance();
            }
            values
        };
        let stepped: Vec<u32> = (0..32)
            .map(|i| Window::new(4, 12 + 4 * i).peek(&code))
            .collect();
        assert_eq!(driven, stepped);
        assert_eq!(driven.len(), 32);
    }

    #[test]
    fn next_tracks_remaining_bits() {
        let mut w = Window::new(8, 120);
        assert_eq!(w.fanout(), 256);
        for _ in 0..15 {
            w.advance();
            assert!(w.has_remaining());
        }
        assert_eq!(w.offset(), 112);
        w.advance();
        assert!(!w.has_remaining());
        assert_eq!(w.offset(), 120);
    }

    #[test]
    #[should_panic]
    fn rejects_sizes_that_do_not_divide_the_code() {
        let _ = Window::new(3, 0);
    }
}
