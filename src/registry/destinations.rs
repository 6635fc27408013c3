use crate::core::{Result, SignalError};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{Level, event};

/// An announcer device reachable over HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Destination {
    pub address: String,
    pub display_name: String,
}

impl Destination {
    /// Parses `address \t name`; the name column is optional.
    pub fn parse_line(line: &str) -> Result<Self> {
        let mut cols = line.split('\t');
        let address = cols.next().unwrap_or_default().trim();
        if address.is_empty() {
            return Err(SignalError::ConfigError(format!(
                "destination line has no address: '{}'",
                line
            )));
        }
        let display_name = cols.next().unwrap_or_default().trim();
        Ok(Self {
            address: address.to_string(),
            display_name: display_name.to_string(),
        })
    }
}

/// Destinations indexed by their 1-based position in the configured list.
#[derive(Debug, Clone, Default)]
pub struct DestinationBook {
    entries: BTreeMap<usize, Destination>,
}

impl DestinationBook {
    /// Builds the book from `address \t name` lines. Invalid lines keep their
    /// index slot empty so later indexes stay stable.
    pub fn from_lines<S: AsRef<str>>(lines: &[S]) -> Self {
        let mut entries = BTreeMap::new();
        for (idx, line) in lines.iter().enumerate() {
            match Destination::parse_line(line.as_ref()) {
                Ok(destination) => {
                    entries.insert(idx + 1, destination);
                }
                Err(err) => {
                    event!(Level::WARN, index = idx + 1, error = %err, "destination line skipped");
                }
            }
        }
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Destination> {
        self.entries.get(&index)
    }

    /// Resolves `"1,2,3"` style index lists; `"ALL"` or an empty list selects
    /// every destination. Unknown indexes are ignored.
    pub fn resolve(&self, index_list: &str) -> Vec<Destination> {
        let index_list = index_list.trim();
        if index_list.is_empty() || index_list == "ALL" {
            return self.entries.values().cloned().collect();
        }

        index_list
            .split(',')
            .filter_map(|part| part.trim().parse::<usize>().ok())
            .filter_map(|idx| self.entries.get(&idx).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> DestinationBook {
        DestinationBook::from_lines(&[
            "192.168.1.11\tTower1",
            "192.168.1.12\tTower2",
            "",
            "192.168.1.14",
        ])
    }

    #[test]
    fn resolve_all_and_empty_select_everything() {
        let book = book();
        assert_eq!(book.len(), 3);
        assert_eq!(book.resolve("ALL").len(), 3);
        assert_eq!(book.resolve("").len(), 3);
    }

    #[test]
    fn resolve_keeps_positional_indexes() {
        let book = book();
        let picked = book.resolve("2,4,9,x");
        let addresses: Vec<_> = picked.iter().map(|d| d.address.as_str()).collect();
        assert_eq!(addresses, vec!["192.168.1.12", "192.168.1.14"]);
        assert_eq!(book.get(4).unwrap().display_name, "");
        assert!(book.get(3).is_none());
    }
}
