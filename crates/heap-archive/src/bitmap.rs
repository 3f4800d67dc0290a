//! Reference bitmap ("oopmap") for archive regions.
//!
//! One bit per 8-byte word of a region image. A set bit means the word holds
//! a reference (null included) and must be rewritten by fixup. Anything else
//! is primitive data or an object header and is left alone.

/// A growable bitmap with one bit per region word.
///
/// # Example
///
/// ```
/// use heap_archive::RefBitmap;
///
/// let mut bitmap = RefBitmap::new(128);
/// assert!(!bitmap.is_set(3));
/// bitmap.set(3);
/// assert!(bitmap.is_set(3));
/// assert_eq!(bitmap.iter_set().collect::<Vec<_>>(), vec![3]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RefBitmap {
    /// Bitmap storage, one bit per region word.
    words: Vec<u64>,
    /// Number of region words covered.
    len: usize,
    /// Number of set bits.
    set_count: usize,
}

impl RefBitmap {
    /// Creates a cleared bitmap covering `len` region words.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
            set_count: 0,
        }
    }

    /// Rebuilds a bitmap from its persisted words.
    ///
    /// Returns `None` if `words` is too short for `len` or has bits set past
    /// `len`.
    #[must_use]
    pub fn from_words(words: Vec<u64>, len: usize) -> Option<Self> {
        if words.len() != len.div_ceil(64) {
            return None;
        }
        let tail = len % 64;
        if tail != 0 {
            let last = *words.last()?;
            if last >> tail != 0 {
                return None;
            }
        }
        let set_count = words.iter().map(|w| w.count_ones() as usize).sum();
        Some(Self {
            words,
            len,
            set_count,
        })
    }

    /// The persisted form.
    #[must_use]
    pub fn as_words(&self) -> &[u64] {
        &self.words
    }

    /// Number of region words covered.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the bitmap covers no words.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of set bits.
    #[must_use]
    pub const fn set_count(&self) -> usize {
        self.set_count
    }

    /// Extends coverage to `len` words. Never shrinks.
    pub fn grow(&mut self, len: usize) {
        if len > self.len {
            self.words.resize(len.div_ceil(64), 0);
            self.len = len;
        }
    }

    /// Drops coverage of words at and past `len`, clearing their bits.
    pub fn truncate(&mut self, len: usize) {
        if len >= self.len {
            return;
        }
        self.words.truncate(len.div_ceil(64));
        if len % 64 != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << (len % 64)) - 1;
            }
        }
        self.len = len;
        self.set_count = self.words.iter().map(|w| w.count_ones() as usize).sum();
    }

    /// Marks a word as a reference.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn set(&mut self, index: usize) {
        assert!(index < self.len, "bit {index} out of range {}", self.len);
        let mask = 1u64 << (index % 64);
        let word = &mut self.words[index / 64];
        if *word & mask == 0 {
            *word |= mask;
            self.set_count += 1;
        }
    }

    /// Returns `true` if the word at `index` is marked. Out of range is `false`.
    #[must_use]
    pub fn is_set(&self, index: usize) -> bool {
        index < self.len && (self.words[index / 64] >> (index % 64)) & 1 != 0
    }

    /// Iterates over marked word indices in increasing order.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            let mut rest = word;
            std::iter::from_fn(move || {
                if rest == 0 {
                    return None;
                }
                let bit = rest.trailing_zeros() as usize;
                rest &= rest - 1;
                Some(i * 64 + bit)
            })
        })
    }
}
