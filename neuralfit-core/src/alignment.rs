//! Parameter alignment for transplanting weights between similar networks.
//!
//! Parameter shapes of the source and target network are rendered to string
//! tokens and matched with the longest-matching-block search used by
//! sequence differs. Every matched block pairs its source and target indices
//! one to one.
//!
//! Only rendered shapes are compared. A bias vector can therefore be paired
//! with a weight tensor that happens to have the same shape.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

/// Target sequences at least this long get the popular-token heuristic.
const AUTOJUNK_MIN_LEN: usize = 200;

/// Shape of a single parameter tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape(pub Vec<usize>);

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self(dims.into())
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of scalar elements.
    pub fn size(&self) -> usize {
        self.0.iter().product()
    }

    /// Compact `AxBxC` rendering used in console tables.
    pub fn to_x_string(&self) -> String {
        self.0
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join("x")
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Self(dims.to_vec())
    }
}

/// Tuple rendering: `(3, 3)`, `(64,)`, `()`.
impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [] => write!(f, "()"),
            [single] => write!(f, "({single},)"),
            dims => {
                let inner = dims
                    .iter()
                    .map(|d| d.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "({inner})")
            }
        }
    }
}

/// A run of `size` equal tokens starting at `a` in the first sequence and
/// `b` in the second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MatchingBlock {
    pub a: usize,
    pub b: usize,
    pub size: usize,
}

/// Longest-matching-block search over two token sequences.
pub struct SequenceMatcher<'s, T> {
    a: &'s [T],
    b: &'s [T],
    b2j: HashMap<&'s T, Vec<usize>>,
}

impl<'s, T: Eq + Hash> SequenceMatcher<'s, T> {
    pub fn new(a: &'s [T], b: &'s [T]) -> Self {
        let mut b2j: HashMap<&T, Vec<usize>> = HashMap::new();
        for (j, token) in b.iter().enumerate() {
            b2j.entry(token).or_default().push(j);
        }

        if b.len() >= AUTOJUNK_MIN_LEN {
            let ntest = b.len() / 100 + 1;
            let popular: HashSet<&T> = b2j
                .iter()
                .filter(|(_, idxs)| idxs.len() > ntest)
                .map(|(token, _)| *token)
                .collect();
            for token in popular {
                b2j.remove(token);
            }
        }

        Self { a, b, b2j }
    }

    /// Longest block of equal tokens within `a[alo..ahi]` and `b[blo..bhi]`.
    ///
    /// Among equally long blocks the one starting earliest in `a` wins, then
    /// the one starting earliest in `b`.
    pub fn find_longest_match(
        &self,
        alo: usize,
        ahi: usize,
        blo: usize,
        bhi: usize,
    ) -> MatchingBlock {
        let (a, b) = (self.a, self.b);
        let (mut besti, mut bestj, mut bestsize) = (alo, blo, 0usize);

        // j2len[j] = length of the longest match ending at a[i - 1] and b[j]
        let mut j2len: HashMap<usize, usize> = HashMap::new();
        for (i, token) in a.iter().enumerate().take(ahi).skip(alo) {
            let mut next: HashMap<usize, usize> = HashMap::new();
            if let Some(positions) = self.b2j.get(token) {
                for &j in positions {
                    if j < blo {
                        continue;
                    }
                    if j >= bhi {
                        break;
                    }
                    let k = j
                        .checked_sub(1)
                        .and_then(|prev| j2len.get(&prev))
                        .copied()
                        .unwrap_or(0)
                        + 1;
                    next.insert(j, k);
                    if k > bestsize {
                        besti = i + 1 - k;
                        bestj = j + 1 - k;
                        bestsize = k;
                    }
                }
            }
            j2len = next;
        }

        // Popular tokens never seed a match but may extend one.
        while besti > alo && bestj > blo && a[besti - 1] == b[bestj - 1] {
            besti -= 1;
            bestj -= 1;
            bestsize += 1;
        }
        while besti + bestsize < ahi
            && bestj + bestsize < bhi
            && a[besti + bestsize] == b[bestj + bestsize]
        {
            bestsize += 1;
        }

        MatchingBlock {
            a: besti,
            b: bestj,
            size: bestsize,
        }
    }

    /// All maximal matching blocks, sorted, with adjacent blocks merged.
    ///
    /// Unlike the classic interface no zero-sized sentinel is appended.
    pub fn matching_blocks(&self) -> Vec<MatchingBlock> {
        let mut queue = vec![(0, self.a.len(), 0, self.b.len())];
        let mut blocks = Vec::new();

        while let Some((alo, ahi, blo, bhi)) = queue.pop() {
            let block = self.find_longest_match(alo, ahi, blo, bhi);
            if block.size == 0 {
                continue;
            }
            blocks.push(block);
            if alo < block.a && blo < block.b {
                queue.push((alo, block.a, blo, block.b));
            }
            if block.a + block.size < ahi && block.b + block.size < bhi {
                queue.push((block.a + block.size, ahi, block.b + block.size, bhi));
            }
        }
        blocks.sort();

        let mut merged: Vec<MatchingBlock> = Vec::with_capacity(blocks.len());
        for block in blocks {
            match merged.last_mut() {
                Some(last) if last.a + last.size == block.a && last.b + last.size == block.b => {
                    last.size += block.size;
                }
                _ => merged.push(block),
            }
        }
        merged
    }
}

/// Pair up equivalent parameters of two networks by shape.
///
/// Returns `(source_index, target_index)` pairs ordered by source index.
/// Sequences of different lengths are fine; unmatched parameters are left
/// out.
pub fn align(source: &[Shape], target: &[Shape]) -> Vec<(usize, usize)> {
    let source_tokens: Vec<String> = source.iter().map(|s| s.to_string()).collect();
    let target_tokens: Vec<String> = target.iter().map(|s| s.to_string()).collect();

    SequenceMatcher::new(&source_tokens, &target_tokens)
        .matching_blocks()
        .into_iter()
        .flat_map(|block| (0..block.size).map(move |k| (block.a + k, block.b + k)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn shapes(dims: &[&[usize]]) -> Vec<Shape> {
        dims.iter().map(|d| Shape::from(*d)).collect()
    }

    #[test]
    fn test_shape_display_matches_tuple_rendering() {
        assert_eq!(Shape::new(vec![3, 3]).to_string(), "(3, 3)");
        assert_eq!(Shape::new(vec![64]).to_string(), "(64,)");
        assert_eq!(Shape::new(Vec::new()).to_string(), "()");
        assert_eq!(Shape::new(vec![32, 1, 5, 5]).to_x_string(), "32x1x5x5");
    }

    #[test]
    fn test_align_skips_unmatched_source_entry() {
        let a = shapes(&[&[3, 3], &[64], &[3, 3], &[10]]);
        let b = shapes(&[&[3, 3], &[64], &[10]]);
        assert_eq!(align(&a, &b), vec![(0, 0), (1, 1), (3, 2)]);
    }

    #[test]
    fn test_align_empty_sides() {
        let a = shapes(&[&[3, 3], &[64]]);
        assert!(align(&[], &a).is_empty());
        assert!(align(&a, &[]).is_empty());
        assert!(align(&[], &[]).is_empty());
    }

    #[test]
    fn test_align_identical_is_identity() {
        let a = shapes(&[&[784, 100], &[100], &[100, 10], &[10]]);
        assert_eq!(align(&a, &a), vec![(0, 0), (1, 1), (2, 2), (3, 3)]);
    }

    #[test]
    fn test_align_no_overlap() {
        let a = shapes(&[&[1, 2], &[2]]);
        let b = shapes(&[&[5, 5], &[5]]);
        assert!(align(&a, &b).is_empty());
    }

    #[test]
    fn test_align_matches_bias_with_weight_of_same_shape() {
        // A (10,) bias and a (10,) weight vector are indistinguishable.
        let a = shapes(&[&[10]]);
        let b = shapes(&[&[4, 10], &[10]]);
        assert_eq!(align(&a, &b), vec![(0, 1)]);
    }

    #[test]
    fn test_longest_match_prefers_earliest() {
        let a = vec!["x", "y", "x", "y"];
        let b = vec!["x", "y"];
        let matcher = SequenceMatcher::new(&a, &b);
        assert_eq!(
            matcher.find_longest_match(0, a.len(), 0, b.len()),
            MatchingBlock { a: 0, b: 0, size: 2 }
        );
    }

    #[test]
    fn test_matching_blocks_recurse_both_sides() {
        let a: Vec<char> = "abxcd".chars().collect();
        let b: Vec<char> = "abcd".chars().collect();
        let blocks = SequenceMatcher::new(&a, &b).matching_blocks();
        assert_eq!(
            blocks,
            vec![
                MatchingBlock { a: 0, b: 0, size: 2 },
                MatchingBlock { a: 3, b: 2, size: 2 },
            ]
        );
    }

    #[test]
    fn test_popular_tokens_only_extend_from_window_start() {
        // Every target token is popular, so nothing seeds a match and the
        // block only grows by extension from the window origin.
        let a = vec![9u32, 7, 7];
        let b = vec![7u32; 250];
        let matcher = SequenceMatcher::new(&a, &b);
        assert_eq!(
            matcher.find_longest_match(0, a.len(), 0, b.len()),
            MatchingBlock { a: 0, b: 0, size: 0 }
        );
        assert!(matcher.matching_blocks().is_empty());
    }
}
