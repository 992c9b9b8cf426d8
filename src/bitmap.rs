//! Per-page mark bitmap with atomic tri-color transitions.
//!
//! The bitmap stores one bit per heap word. An object's color is the pair of
//! bits at its start word and the word after it:
//!
//! ```text
//! 00  white      not yet discovered
//! 10  grey       discovered, fields unscanned
//! 11  black      discovered and scanned
//! 01  impossible observing this pattern means memory corruption
//! ```
//!
//! Objects are at least two words long, so the second bit of one object never
//! collides with the first bit of the next. Keeping the color in two adjacent
//! single bits (rather than a packed 2-bit lane) is what makes the
//! left-trimming overlap fix-up possible: trimming one word off the front of
//! an array shifts the color window by exactly one bit.

use crossbeam_utils::Backoff;
use std::sync::atomic::{AtomicUsize, Ordering};

const BITS_PER_CELL: usize = usize::BITS as usize;

/// Color of a single object, as read from its two mark bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    White,
    Grey,
    Black,
    /// The 01 pattern. Never produced by legal transitions.
    Impossible,
}

/// Dense mark bitmap covering one page, one bit per word.
///
/// All single-bit updates are atomic; under concurrent marking the
/// white-to-grey / grey-to-black races are resolved by whoever wins the
/// fetch_or, exactly one caller observing success.
///
/// # Examples
///
/// ```
/// use greymark::bitmap::{Color, MarkBitmap};
///
/// let bitmap = MarkBitmap::new(512);
/// assert_eq!(bitmap.color(64), Color::White);
/// assert!(bitmap.white_to_grey(64));
/// assert!(!bitmap.white_to_grey(64));
/// assert!(bitmap.grey_to_black(64));
/// assert_eq!(bitmap.color(64), Color::Black);
/// ```
pub struct MarkBitmap {
    cells: Box<[AtomicUsize]>,
}

impl MarkBitmap {
    /// Create a bitmap for a page of `words` heap words. One guard bit past
    /// the end keeps the second-bit accesses of the last object in range.
    pub fn new(words: usize) -> Self {
        let cells = (words + 1).div_ceil(BITS_PER_CELL);
        Self {
            cells: (0..cells).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    #[inline]
    fn cell_and_mask(&self, bit: usize) -> (&AtomicUsize, usize) {
        let cell = bit / BITS_PER_CELL;
        let mask = 1usize << (bit % BITS_PER_CELL);
        (&self.cells[cell], mask)
    }

    #[inline]
    fn bit(&self, bit: usize) -> bool {
        let (cell, mask) = self.cell_and_mask(bit);
        cell.load(Ordering::Acquire) & mask != 0
    }

    /// Atomically set a bit; true if this call flipped it from clear to set.
    #[inline]
    fn try_set_bit(&self, bit: usize) -> bool {
        let (cell, mask) = self.cell_and_mask(bit);
        let backoff = Backoff::new();
        loop {
            let current = cell.load(Ordering::Acquire);
            if current & mask != 0 {
                return false;
            }
            match cell.compare_exchange_weak(
                current,
                current | mask,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(_) => backoff.spin(),
            }
        }
    }

    /// Atomically clear a bit; true if this call flipped it from set to clear.
    #[inline]
    fn try_clear_bit(&self, bit: usize) -> bool {
        let (cell, mask) = self.cell_and_mask(bit);
        let old = cell.fetch_and(!mask, Ordering::AcqRel);
        old & mask != 0
    }

    /// Read the color of the object starting at `word`.
    pub fn color(&self, word: usize) -> Color {
        match (self.bit(word), self.bit(word + 1)) {
            (false, false) => Color::White,
            (true, false) => Color::Grey,
            (true, true) => Color::Black,
            (false, true) => Color::Impossible,
        }
    }

    /// Read the color, treating the impossible pattern as a fatal corruption.
    pub fn color_checked(&self, word: usize) -> Color {
        let color = self.color(word);
        assert!(
            color != Color::Impossible,
            "impossible mark bit pattern at word {word}"
        );
        color
    }

    #[inline]
    pub fn is_white(&self, word: usize) -> bool {
        self.color_checked(word) == Color::White
    }

    #[inline]
    pub fn is_grey(&self, word: usize) -> bool {
        self.color_checked(word) == Color::Grey
    }

    #[inline]
    pub fn is_black(&self, word: usize) -> bool {
        self.color_checked(word) == Color::Black
    }

    /// White → grey. Succeeds iff the first bit was clear.
    #[inline]
    pub fn white_to_grey(&self, word: usize) -> bool {
        debug_assert!(self.color(word) != Color::Impossible);
        self.try_set_bit(word)
    }

    /// Grey → black. Succeeds iff the second bit was clear. The caller is
    /// expected to hold the grey claim; setting the second bit of a white
    /// object would manufacture the impossible pattern.
    #[inline]
    pub fn grey_to_black(&self, word: usize) -> bool {
        debug_assert!(self.bit(word), "grey_to_black on unmarked word {word}");
        self.try_set_bit(word + 1)
    }

    /// White → black in one claim. Succeeds iff this caller won the first
    /// bit; the second bit is then set unconditionally.
    #[inline]
    pub fn white_to_black(&self, word: usize) -> bool {
        if !self.try_set_bit(word) {
            return false;
        }
        self.try_set_bit(word + 1);
        true
    }

    /// Black → grey. Reverses `grey_to_black`; used only by the work-list
    /// full fallback and the left-trimming fix-up.
    #[inline]
    pub fn black_to_grey(&self, word: usize) -> bool {
        debug_assert!(self.bit(word), "black_to_grey on unmarked word {word}");
        self.try_clear_bit(word + 1)
    }

    /// Raw first-bit set for the trimming overlap case: publishes the shifted
    /// position as (at least) grey.
    #[inline]
    pub fn set_first_bit(&self, word: usize) {
        self.try_set_bit(word);
    }

    /// Raw second-bit set for the trimming overlap case: promotes the shifted
    /// position from grey to black.
    #[inline]
    pub fn set_second_bit(&self, word: usize) {
        debug_assert!(self.bit(word));
        self.try_set_bit(word + 1);
    }

    #[inline]
    pub fn second_bit(&self, word: usize) -> bool {
        self.bit(word + 1)
    }

    /// Reset every bit to white. Only legal while no marker is running; in
    /// production the sweeper owns this.
    pub fn clear(&self) {
        for cell in self.cells.iter() {
            cell.store(0, Ordering::Release);
        }
    }

    /// True when no bit is set.
    pub fn is_clean(&self) -> bool {
        self.cells
            .iter()
            .all(|cell| cell.load(Ordering::Acquire) == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn transitions_follow_the_color_dag() {
        let bitmap = MarkBitmap::new(256);
        assert_eq!(bitmap.color(0), Color::White);
        assert!(bitmap.white_to_grey(0));
        assert_eq!(bitmap.color(0), Color::Grey);
        assert!(!bitmap.white_to_grey(0));
        assert!(bitmap.grey_to_black(0));
        assert_eq!(bitmap.color(0), Color::Black);
        assert!(!bitmap.grey_to_black(0));
        assert!(bitmap.black_to_grey(0));
        assert_eq!(bitmap.color(0), Color::Grey);
    }

    #[test]
    fn white_to_black_claims_both_bits() {
        let bitmap = MarkBitmap::new(256);
        assert!(bitmap.white_to_black(8));
        assert_eq!(bitmap.color(8), Color::Black);
        assert!(!bitmap.white_to_black(8));
    }

    #[test]
    fn colors_span_cell_boundaries() {
        let bitmap = MarkBitmap::new(256);
        // Word 63's second bit lives in the next cell.
        assert!(bitmap.white_to_grey(63));
        assert_eq!(bitmap.color(63), Color::Grey);
        assert!(bitmap.grey_to_black(63));
        assert_eq!(bitmap.color(63), Color::Black);
        // The neighbor at word 64 is independently white.
        assert_eq!(bitmap.bit(65), false);
    }

    #[test]
    fn guard_bit_covers_last_word() {
        let bitmap = MarkBitmap::new(64);
        assert!(bitmap.white_to_black(63));
        assert_eq!(bitmap.color(63), Color::Black);
    }

    #[test]
    #[should_panic(expected = "impossible mark bit pattern")]
    fn impossible_pattern_is_fatal() {
        let bitmap = MarkBitmap::new(64);
        // Manufacture 01 directly; no legal transition can produce it.
        bitmap.try_set_bit(1);
        let _ = bitmap.color_checked(0);
    }

    #[test]
    fn concurrent_discovery_has_a_single_winner() {
        let bitmap = Arc::new(MarkBitmap::new(1024));
        let winners: usize = std::thread::scope(|scope| {
            (0..8)
                .map(|_| {
                    let bitmap = Arc::clone(&bitmap);
                    scope.spawn(move || {
                        let mut won = 0;
                        for word in (0..1024).step_by(2) {
                            if bitmap.white_to_grey(word) {
                                won += 1;
                            }
                        }
                        won
                    })
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|h| h.join().unwrap())
                .sum()
        });
        assert_eq!(winners, 512);
        for word in (0..1024).step_by(2) {
            assert_eq!(bitmap.color(word), Color::Grey);
        }
    }
}
