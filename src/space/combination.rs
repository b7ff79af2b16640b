//! Element triples and their canonical, resumable enumeration.

use std::cmp::Ordering;
use std::fmt;

use super::element::{Element, ElementCatalogue};

/// Three distinct catalogue elements, `(primary, solute_a, solute_b)`.
///
/// Stored as catalogue indices `i < j < k`. Ordering compares the index
/// triples, which is exactly the enumeration order of [`Combinations`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Combination {
    indices: [usize; 3],
    elements: [Element; 3],
    rank: u64,
}

impl Combination {
    fn from_indices(catalogue: &ElementCatalogue, indices: [usize; 3], rank: u64) -> Option<Self> {
        let [i, j, k] = indices;
        Some(Self {
            indices,
            elements: [
                catalogue.get(i)?.clone(),
                catalogue.get(j)?.clone(),
                catalogue.get(k)?.clone(),
            ],
            rank,
        })
    }

    /// Rebuilds the combination at `rank` in canonical order.
    pub fn from_rank(catalogue: &ElementCatalogue, rank: u64) -> Option<Self> {
        let n = catalogue.len() as u64;
        if rank >= choose3(n) {
            return None;
        }

        let mut rest = rank;
        let mut i = 0u64;
        while rest >= choose2(n - 1 - i) {
            rest -= choose2(n - 1 - i);
            i += 1;
        }
        let mut j = i + 1;
        while rest >= n - 1 - j {
            rest -= n - 1 - j;
            j += 1;
        }
        let k = j + 1 + rest;

        Self::from_indices(catalogue, [i as usize, j as usize, k as usize], rank)
    }

    pub fn indices(&self) -> [usize; 3] {
        self.indices
    }

    pub fn elements(&self) -> &[Element; 3] {
        &self.elements
    }

    pub fn primary(&self) -> &Element {
        &self.elements[0]
    }

    pub fn solute_a(&self) -> &Element {
        &self.elements[1]
    }

    pub fn solute_b(&self) -> &Element {
        &self.elements[2]
    }

    /// Zero-based position in the canonical enumeration.
    pub fn rank(&self) -> u64 {
        self.rank
    }

    /// Symbols only, in `(primary, solute_a, solute_b)` order.
    pub fn symbols(&self) -> [String; 3] {
        [
            self.elements[0].symbol().to_string(),
            self.elements[1].symbol().to_string(),
            self.elements[2].symbol().to_string(),
        ]
    }
}

impl fmt::Display for Combination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            self.elements[0], self.elements[1], self.elements[2]
        )
    }
}

impl PartialOrd for Combination {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Combination {
    fn cmp(&self, other: &Self) -> Ordering {
        self.indices.cmp(&other.indices)
    }
}

/// Lazy lexicographic enumeration of all 3-subsets of a catalogue.
#[derive(Debug, Clone)]
pub struct Combinations<'a> {
    catalogue: &'a ElementCatalogue,
    next: Option<[usize; 3]>,
    rank: u64,
}

impl<'a> Combinations<'a> {
    pub(crate) fn new(catalogue: &'a ElementCatalogue) -> Self {
        let next = (catalogue.len() >= 3).then_some([0, 1, 2]);
        Self {
            catalogue,
            next,
            rank: 0,
        }
    }

    pub(crate) fn starting_at(catalogue: &'a ElementCatalogue, combination: Combination) -> Self {
        Self {
            catalogue,
            next: Some(combination.indices),
            rank: combination.rank,
        }
    }

    fn successor(&self, [i, j, k]: [usize; 3]) -> Option<[usize; 3]> {
        let n = self.catalogue.len();
        if k + 1 < n {
            Some([i, j, k + 1])
        } else if j + 2 < n {
            Some([i, j + 1, j + 2])
        } else if i + 3 < n {
            Some([i + 1, i + 2, i + 3])
        } else {
            None
        }
    }
}

impl Iterator for Combinations<'_> {
    type Item = Combination;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = self.successor(current);
        let combination = Combination::from_indices(self.catalogue, current, self.rank);
        self.rank += 1;
        combination
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = choose3(self.catalogue.len() as u64).saturating_sub(self.rank) as usize;
        if self.next.is_none() {
            (0, Some(0))
        } else {
            (remaining, Some(remaining))
        }
    }
}

/// Canonical rank of the index triple `i < j < k` among `C(n, 3)` combinations.
pub(crate) fn rank_of(n: u64, [i, j, k]: [u64; 3]) -> u64 {
    let before_i: u64 = (0..i).map(|a| choose2(n - 1 - a)).sum();
    let before_j: u64 = (i + 1..j).map(|b| n - 1 - b).sum();
    before_i + before_j + (k - j - 1)
}

pub(crate) fn choose2(n: u64) -> u64 {
    if n < 2 {
        0
    } else {
        n * (n - 1) / 2
    }
}

pub(crate) fn choose3(n: u64) -> u64 {
    if n < 3 {
        0
    } else {
        n * (n - 1) * (n - 2) / 6
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_combinations_of_default_catalogue() {
        let cat = ElementCatalogue::default();
        let firsts: Vec<String> = Combinations::new(&cat).take(3).map(|c| c.to_string()).collect();
        assert_eq!(firsts, vec!["LI-BE-NA", "LI-BE-MG", "LI-BE-AL"]);
        assert_eq!(Combinations::new(&cat).count() as u64, choose3(56));
    }

    #[test]
    fn test_from_rank_inverts_enumeration() {
        let cat = ElementCatalogue::new(["A", "B", "C", "D", "E", "F", "G"]).unwrap();
        for combo in Combinations::new(&cat) {
            let rebuilt = Combination::from_rank(&cat, combo.rank()).unwrap();
            assert_eq!(rebuilt, combo);
        }
        assert!(Combination::from_rank(&cat, choose3(7)).is_none());
    }

    #[test]
    fn test_rank_of_matches_enumeration() {
        let cat = ElementCatalogue::new(["A", "B", "C", "D", "E", "F"]).unwrap();
        for combo in Combinations::new(&cat) {
            let [i, j, k] = combo.indices();
            assert_eq!(rank_of(6, [i as u64, j as u64, k as u64]), combo.rank());
        }
    }

    #[test]
    fn test_indices_strictly_increasing() {
        let cat = ElementCatalogue::new(["A", "B", "C", "D", "E"]).unwrap();
        for combo in Combinations::new(&cat) {
            let [i, j, k] = combo.indices();
            assert!(i < j && j < k);
        }
    }

    #[test]
    fn test_accessors() {
        let cat = ElementCatalogue::new(["AL", "CU", "FE"]).unwrap();
        let combo = Combinations::new(&cat).next().unwrap();
        assert_eq!(combo.primary().symbol(), "AL");
        assert_eq!(combo.solute_a().symbol(), "CU");
        assert_eq!(combo.solute_b().symbol(), "FE");
        assert_eq!(combo.symbols(), ["AL".to_string(), "CU".to_string(), "FE".to_string()]);
    }

    #[test]
    fn test_size_hint_tracks_remaining() {
        let cat = ElementCatalogue::new(["A", "B", "C", "D", "E"]).unwrap();
        let mut iter = Combinations::new(&cat);
        assert_eq!(iter.size_hint(), (10, Some(10)));
        iter.next();
        iter.next();
        assert_eq!(iter.size_hint(), (8, Some(8)));
    }
}
