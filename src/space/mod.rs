//! Composition space: the element catalogue, the canonical enumeration of
//! element triples, and the shared concentration grid.
//!
//! Everything here is deterministic. Resuming from a checkpoint relies on
//! [`CompositionSpace::combinations_after`] reproducing exactly the work that
//! remained when the previous run stopped.

pub mod combination;
pub mod element;
pub mod grid;

pub use combination::{Combination, Combinations};
pub use element::{Element, ElementCatalogue, DEFAULT_ELEMENTS};
pub use grid::{ConcentrationGrid, ConcentrationPoint, GridSpec};

use thiserror::Error;

/// Errors raised while building the composition space.
#[derive(Debug, Error)]
pub enum SpaceError {
    #[error("Element catalogue needs at least 3 elements, got {0}")]
    CatalogueTooSmall(usize),

    #[error("Duplicate element '{0}' in catalogue")]
    DuplicateElement(String),

    #[error("Invalid element symbol '{0}': must be non-empty and alphabetic")]
    InvalidSymbol(String),

    #[error("Invalid concentration grid: {0}")]
    InvalidGrid(String),

    #[error("Combination rank {rank} out of range (space has {len} combinations)")]
    RankOutOfRange { rank: u64, len: u64 },
}

/// The full space of work: every element triple crossed with the grid.
#[derive(Debug, Clone)]
pub struct CompositionSpace {
    catalogue: ElementCatalogue,
    grid: ConcentrationGrid,
}

impl CompositionSpace {
    /// Builds the space, computing the concentration grid once.
    pub fn new(catalogue: ElementCatalogue, grid_spec: &GridSpec) -> Result<Self, SpaceError> {
        if catalogue.len() < 3 {
            return Err(SpaceError::CatalogueTooSmall(catalogue.len()));
        }
        let grid = ConcentrationGrid::build(grid_spec)?;
        Ok(Self { catalogue, grid })
    }

    pub fn catalogue(&self) -> &ElementCatalogue {
        &self.catalogue
    }

    /// Lazy iterator over every combination in canonical order.
    pub fn combinations(&self) -> Combinations<'_> {
        Combinations::new(&self.catalogue)
    }

    /// Combinations strictly after `rank` in canonical order.
    ///
    /// `None` yields the whole enumeration.
    pub fn combinations_after(&self, rank: Option<u64>) -> Result<Combinations<'_>, SpaceError> {
        match rank {
            None => Ok(self.combinations()),
            Some(rank) => {
                let current = self.combination_at(rank)?;
                let mut iter = Combinations::starting_at(&self.catalogue, current);
                iter.next();
                Ok(iter)
            }
        }
    }

    /// Reconstructs the combination at a given zero-based rank.
    pub fn combination_at(&self, rank: u64) -> Result<Combination, SpaceError> {
        Combination::from_rank(&self.catalogue, rank).ok_or(SpaceError::RankOutOfRange {
            rank,
            len: self.len(),
        })
    }

    /// Looks up a combination by its three symbols, in any order.
    pub fn find(&self, symbols: [&str; 3]) -> Option<Combination> {
        let elements = self.catalogue.elements();
        let mut indices = [0u64; 3];
        for (slot, symbol) in indices.iter_mut().zip(symbols) {
            let element = Element::new(symbol).ok()?;
            *slot = elements.iter().position(|e| *e == element)? as u64;
        }
        indices.sort_unstable();
        if indices[0] == indices[1] || indices[1] == indices[2] {
            return None;
        }
        let rank = combination::rank_of(self.catalogue.len() as u64, indices);
        self.combination_at(rank).ok()
    }

    /// Number of combinations, `C(n, 3)`.
    pub fn len(&self) -> u64 {
        combination::choose3(self.catalogue.len() as u64)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The concentration grid shared by every combination.
    pub fn concentration_grid(&self) -> &ConcentrationGrid {
        &self.grid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn catalogue(symbols: &[&str]) -> ElementCatalogue {
        ElementCatalogue::new(symbols.iter().copied()).unwrap()
    }

    #[test]
    fn test_combination_count_matches_binomial() {
        for n in 3..=12usize {
            let symbols: Vec<String> = (0..n).map(|i| format!("X{}", (b'A' + i as u8) as char)).collect();
            let cat = ElementCatalogue::new(symbols.iter().map(String::as_str)).unwrap();
            let space = CompositionSpace::new(cat, &GridSpec::default()).unwrap();

            let all: Vec<Combination> = space.combinations().collect();
            let expected = (n * (n - 1) * (n - 2) / 6) as u64;
            assert_eq!(all.len() as u64, expected);
            assert_eq!(space.len(), expected);

            let unique: HashSet<_> = all.iter().map(|c| c.indices()).collect();
            assert_eq!(unique.len(), all.len());
        }
    }

    #[test]
    fn test_enumeration_is_stable_and_sorted() {
        let space = CompositionSpace::new(
            catalogue(&["AL", "CU", "FE", "NI", "TI"]),
            &GridSpec::default(),
        )
        .unwrap();

        let first: Vec<Combination> = space.combinations().collect();
        let second: Vec<Combination> = space.combinations().collect();
        assert_eq!(first, second);

        for pair in first.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        for (rank, combo) in first.iter().enumerate() {
            assert_eq!(combo.rank(), rank as u64);
        }
    }

    #[test]
    fn test_combinations_after_resumes_at_next_rank() {
        let space = CompositionSpace::new(
            catalogue(&["AL", "CU", "FE", "NI", "TI"]),
            &GridSpec::default(),
        )
        .unwrap();
        assert_eq!(space.len(), 10);

        let rest: Vec<u64> = space
            .combinations_after(Some(6))
            .unwrap()
            .map(|c| c.rank())
            .collect();
        assert_eq!(rest, vec![7, 8, 9]);

        let all: Vec<u64> = space.combinations_after(None).unwrap().map(|c| c.rank()).collect();
        assert_eq!(all.len(), 10);

        let none: Vec<u64> = space.combinations_after(Some(9)).unwrap().map(|c| c.rank()).collect();
        assert!(none.is_empty());
    }

    #[test]
    fn test_find_by_symbols() {
        let space = CompositionSpace::new(
            catalogue(&["AL", "CU", "FE", "NI", "TI"]),
            &GridSpec::default(),
        )
        .unwrap();
        let found = space.find(["ni", "AL", "FE"]).unwrap();
        assert_eq!(found.to_string(), "AL-FE-NI");
        assert_eq!(found, space.combination_at(found.rank()).unwrap());
        assert!(space.find(["AL", "AL", "FE"]).is_none());
        assert!(space.find(["AL", "CU", "ZN"]).is_none());
    }

    #[test]
    fn test_rank_out_of_range() {
        let space = CompositionSpace::new(catalogue(&["AL", "CU", "FE"]), &GridSpec::default()).unwrap();
        assert!(matches!(
            space.combination_at(1),
            Err(SpaceError::RankOutOfRange { rank: 1, len: 1 })
        ));
    }

    #[test]
    fn test_catalogue_too_small() {
        let err = CompositionSpace::new(catalogue(&["AL", "CU"]), &GridSpec::default()).unwrap_err();
        assert!(matches!(err, SpaceError::CatalogueTooSmall(2)));
    }
}
