//! Chemical elements and the ordered catalogue they are drawn from.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::SpaceError;

/// Metals (plus the C and SI solutes) enumerated by default, in catalogue order.
pub const DEFAULT_ELEMENTS: &[&str] = &[
    "LI", "BE", "NA", "MG", "AL", "K", "CA", "SC", "TI", "V", "CR", "MN", "FE", "CO", "NI", "CU",
    "ZN", "GA", "Y", "ZR", "NB", "MO", "TC", "RH", "PD", "AG", "CD", "IN", "SN", "BA", "LA", "CE",
    "PR", "ND", "PM", "SM", "EU", "GD", "TB", "DY", "HO", "ER", "HF", "TA", "W", "RE", "OS", "IR",
    "PT", "AU", "HG", "TL", "PB", "BI", "C", "SI",
];

/// An atomic symbol, normalized to upper case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Element(String);

impl Element {
    /// Parses and normalizes a symbol.
    pub fn new(symbol: &str) -> Result<Self, SpaceError> {
        let trimmed = symbol.trim();
        if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(SpaceError::InvalidSymbol(symbol.to_string()));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    pub fn symbol(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered, duplicate-free list of elements.
///
/// The order is significant: it defines the canonical enumeration of
/// combinations, and its fingerprint guards checkpoints against being
/// replayed on a different catalogue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementCatalogue {
    elements: Vec<Element>,
    fingerprint: String,
}

impl ElementCatalogue {
    pub fn new<'a>(symbols: impl IntoIterator<Item = &'a str>) -> Result<Self, SpaceError> {
        let mut seen = HashSet::new();
        let mut elements = Vec::new();
        for symbol in symbols {
            let element = Element::new(symbol)?;
            if !seen.insert(element.clone()) {
                return Err(SpaceError::DuplicateElement(element.0));
            }
            elements.push(element);
        }

        let fingerprint = fingerprint_of(&elements);
        Ok(Self {
            elements,
            fingerprint,
        })
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Element> {
        self.elements.get(index)
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    /// Hex SHA-256 over the ordered symbols.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl Default for ElementCatalogue {
    fn default() -> Self {
        let elements: Vec<Element> = DEFAULT_ELEMENTS
            .iter()
            .map(|s| Element(s.to_string()))
            .collect();
        let fingerprint = fingerprint_of(&elements);
        Self {
            elements,
            fingerprint,
        }
    }
}

fn fingerprint_of(elements: &[Element]) -> String {
    let mut hasher = Sha256::new();
    for element in elements {
        hasher.update(element.symbol().as_bytes());
        hasher.update(b",");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalogue() {
        let cat = ElementCatalogue::default();
        assert_eq!(cat.len(), 56);
        assert_eq!(cat.get(0).unwrap().symbol(), "LI");
        assert_eq!(cat.get(55).unwrap().symbol(), "SI");
        assert_eq!(cat, ElementCatalogue::new(DEFAULT_ELEMENTS.iter().copied()).unwrap());
    }

    #[test]
    fn test_symbols_are_normalized() {
        let cat = ElementCatalogue::new(["al", " Cu ", "FE"]).unwrap();
        let symbols: Vec<&str> = cat.elements().iter().map(Element::symbol).collect();
        assert_eq!(symbols, vec!["AL", "CU", "FE"]);
    }

    #[test]
    fn test_rejects_duplicates_and_bad_symbols() {
        assert!(matches!(
            ElementCatalogue::new(["AL", "CU", "al"]),
            Err(SpaceError::DuplicateElement(s)) if s == "AL"
        ));
        assert!(matches!(
            ElementCatalogue::new(["AL", "C2"]),
            Err(SpaceError::InvalidSymbol(_))
        ));
        assert!(ElementCatalogue::new(["AL", ""]).is_err());
    }

    #[test]
    fn test_fingerprint_depends_on_order() {
        let a = ElementCatalogue::new(["AL", "CU", "FE"]).unwrap();
        let b = ElementCatalogue::new(["CU", "AL", "FE"]).unwrap();
        let c = ElementCatalogue::new(["AL", "CU", "FE"]).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }
}
