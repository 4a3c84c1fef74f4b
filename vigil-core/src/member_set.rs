use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Largest node identifier a [`MemberIdSet`] accepts.
pub const MAX_ID: u32 = 65_535;

const WORD_BITS: usize = u64::BITS as usize;

/// Growable bit-indexed set of node identifiers.
///
/// Capacity only ever grows: merging with a larger set widens this one, removals never
/// shrink it. Equality and hashing look at membership alone, so two sets holding the same
/// ids compare equal regardless of how much padding either carries.
///
/// On the wire a set is the ascending list of its ids, so its encoded size tracks the
/// number of members rather than the largest id.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(into = "Vec<u32>", from = "Vec<u32>")]
pub struct MemberIdSet {
    words: Vec<u64>,
}

impl MemberIdSet {
    /// Creates an empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self { words: Vec::new() }
    }

    /// Creates an empty set able to hold ids `0..bits` without reallocating.
    #[must_use]
    pub fn with_capacity(bits: usize) -> Self {
        Self {
            words: vec![0; bits.div_ceil(WORD_BITS)],
        }
    }

    /// Number of ids the set can currently hold without growing.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.words.len() * WORD_BITS
    }

    /// Adds `id`, returning `true` if it was not already present.
    ///
    /// Ids above [`MAX_ID`] are refused and reported as unchanged.
    pub fn add(&mut self, id: u32) -> bool {
        if id > MAX_ID {
            return false;
        }
        let (word, mask) = locate(id);
        self.grow_to(word + 1);
        let changed = self.words[word] & mask == 0;
        self.words[word] |= mask;
        changed
    }

    /// Removes `id`, returning `true` if it was present.
    pub fn remove(&mut self, id: u32) -> bool {
        let (word, mask) = locate(id);
        match self.words.get_mut(word) {
            Some(bits) if *bits & mask != 0 => {
                *bits &= !mask;
                true
            }
            _ => false,
        }
    }

    /// Returns `true` if `id` is a member.
    #[must_use]
    pub fn contains(&self, id: u32) -> bool {
        let (word, mask) = locate(id);
        self.words.get(word).is_some_and(|bits| bits & mask != 0)
    }

    /// Bitwise union. Grows to the wider of the two operands; no bit of either is dropped.
    pub fn merge(&mut self, other: &Self) {
        self.grow_to(other.words.len());
        for (mine, theirs) in self.words.iter_mut().zip(&other.words) {
            *mine |= *theirs;
        }
    }

    /// Returns `true` if the two sets share at least one id.
    #[must_use]
    pub fn overlap(&self, other: &Self) -> bool {
        self.words
            .iter()
            .zip(&other.words)
            .any(|(mine, theirs)| mine & theirs != 0)
    }

    /// Removes every id present in `other`.
    pub fn subtract(&mut self, other: &Self) {
        for (mine, theirs) in self.words.iter_mut().zip(&other.words) {
            *mine &= !*theirs;
        }
    }

    /// Number of ids in the set.
    #[must_use]
    pub fn cardinality(&self) -> usize {
        self.words
            .iter()
            .map(|bits| bits.count_ones() as usize)
            .sum()
    }

    /// Returns `true` if no id is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|bits| *bits == 0)
    }

    /// Iterates over member ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(index, bits)| {
            let base = index * WORD_BITS;
            let mut remaining = *bits;
            std::iter::from_fn(move || {
                if remaining == 0 {
                    return None;
                }
                let offset = remaining.trailing_zeros() as usize;
                remaining &= remaining - 1;
                u32::try_from(base + offset).ok()
            })
        })
    }

    fn grow_to(&mut self, words: usize) {
        if self.words.len() < words {
            self.words.resize(words, 0);
        }
    }

    fn significant_words(&self) -> &[u64] {
        let len = self
            .words
            .iter()
            .rposition(|bits| *bits != 0)
            .map_or(0, |last| last + 1);
        &self.words[..len]
    }
}

#[inline]
const fn locate(id: u32) -> (usize, u64) {
    let id = id as usize;
    (id / WORD_BITS, 1 << (id % WORD_BITS))
}

impl PartialEq for MemberIdSet {
    fn eq(&self, other: &Self) -> bool {
        self.significant_words() == other.significant_words()
    }
}

impl Eq for MemberIdSet {}

impl Hash for MemberIdSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.significant_words().hash(state);
    }
}

impl FromIterator<u32> for MemberIdSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}

impl Extend<u32> for MemberIdSet {
    fn extend<I: IntoIterator<Item = u32>>(&mut self, iter: I) {
        for id in iter {
            self.add(id);
        }
    }
}

impl From<MemberIdSet> for Vec<u32> {
    fn from(set: MemberIdSet) -> Self {
        set.iter().collect()
    }
}

/// Ids above [`MAX_ID`] are dropped.
impl From<Vec<u32>> for MemberIdSet {
    fn from(ids: Vec<u32>) -> Self {
        ids.into_iter().collect()
    }
}

impl fmt::Debug for MemberIdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for MemberIdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (index, id) in self.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{id}")?;
        }
        f.write_str("}")
    }
}
